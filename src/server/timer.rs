//! Min-heap timer enforcing per-connection idle timeouts.
//!
//! Timers are keyed by connection fd. The heap orders nodes by deadline
//! ascending; a side map from id to heap index makes `adjust` and `cancel`
//! O(log n). Expired callbacks fire from [`HeapTimer::tick`], which the
//! reactor runs once per loop iteration; [`HeapTimer::next_tick_ms`] feeds
//! the multiplexer wait timeout.

use std::collections::HashMap;
use std::os::fd::RawFd;
use std::time::{Duration, Instant};

pub type TimeoutCallback = Box<dyn FnOnce() + Send>;

struct TimerNode {
    id: RawFd,
    deadline: Instant,
    cb: TimeoutCallback,
}

#[derive(Default)]
pub struct HeapTimer {
    heap: Vec<TimerNode>,
    /// id -> index of that id's node in `heap`. Kept in sync by every swap.
    index: HashMap<RawFd, usize>,
}

impl HeapTimer {
    pub fn new() -> Self {
        Self {
            heap: Vec::with_capacity(64),
            index: HashMap::new(),
        }
    }

    pub fn len(&self) -> usize {
        self.heap.len()
    }

    pub fn is_empty(&self) -> bool {
        self.heap.is_empty()
    }

    /// Arms a timer for `id`. If `id` already has a node, its deadline and
    /// callback are replaced and the heap order restored.
    pub fn add(&mut self, id: RawFd, timeout: Duration, cb: TimeoutCallback) {
        let deadline = Instant::now() + timeout;
        match self.index.get(&id).copied() {
            None => {
                let i = self.heap.len();
                self.index.insert(id, i);
                self.heap.push(TimerNode { id, deadline, cb });
                self.sift_up(i);
            }
            Some(i) => {
                self.heap[i].deadline = deadline;
                self.heap[i].cb = cb;
                if !self.sift_down(i) {
                    self.sift_up(i);
                }
            }
        }
    }

    /// Pushes an existing timer's deadline out to `now + timeout`.
    pub fn adjust(&mut self, id: RawFd, timeout: Duration) {
        let Some(&i) = self.index.get(&id) else {
            tracing::debug!(id, "adjust on unknown timer");
            return;
        };
        self.heap[i].deadline = Instant::now() + timeout;
        if !self.sift_down(i) {
            self.sift_up(i);
        }
    }

    /// Fires `id`'s callback now and removes its node.
    pub fn do_work(&mut self, id: RawFd) {
        if let Some(&i) = self.index.get(&id) {
            let node = self.remove_at(i);
            (node.cb)();
        }
    }

    /// Drops `id`'s node without firing the callback.
    pub fn cancel(&mut self, id: RawFd) {
        if let Some(&i) = self.index.get(&id) {
            self.remove_at(i);
        }
    }

    /// Fires every expired timer, nearest deadline first.
    pub fn tick(&mut self) {
        let now = Instant::now();
        while let Some(root) = self.heap.first() {
            if root.deadline > now {
                break;
            }
            let node = self.remove_at(0);
            (node.cb)();
        }
    }

    /// Removes the nearest-deadline node without firing it.
    pub fn pop(&mut self) {
        if !self.heap.is_empty() {
            self.remove_at(0);
        }
    }

    pub fn clear(&mut self) {
        self.heap.clear();
        self.index.clear();
    }

    /// Milliseconds until the nearest deadline, clamped at 0, or `-1` when no
    /// timers are armed. Passed as the multiplexer wait timeout.
    pub fn next_tick_ms(&self) -> i32 {
        match self.heap.first() {
            None => -1,
            Some(root) => {
                let now = Instant::now();
                if root.deadline <= now {
                    0
                } else {
                    (root.deadline - now).as_millis() as i32
                }
            }
        }
    }

    fn remove_at(&mut self, i: usize) -> TimerNode {
        debug_assert!(i < self.heap.len());
        let last = self.heap.len() - 1;
        self.swap_nodes(i, last);
        let node = self.heap.pop().unwrap();
        self.index.remove(&node.id);
        if i < self.heap.len() && !self.sift_down(i) {
            self.sift_up(i);
        }
        node
    }

    fn sift_up(&mut self, mut i: usize) {
        while i > 0 {
            let parent = (i - 1) / 2;
            if self.heap[parent].deadline <= self.heap[i].deadline {
                break;
            }
            self.swap_nodes(i, parent);
            i = parent;
        }
    }

    /// Returns true if the node moved.
    fn sift_down(&mut self, mut i: usize) -> bool {
        let n = self.heap.len();
        let start = i;
        loop {
            let mut child = i * 2 + 1;
            if child >= n {
                break;
            }
            if child + 1 < n && self.heap[child + 1].deadline < self.heap[child].deadline {
                child += 1;
            }
            if self.heap[i].deadline <= self.heap[child].deadline {
                break;
            }
            self.swap_nodes(i, child);
            i = child;
        }
        i > start
    }

    fn swap_nodes(&mut self, i: usize, j: usize) {
        if i == j {
            return;
        }
        self.heap.swap(i, j);
        self.index.insert(self.heap[i].id, i);
        self.index.insert(self.heap[j].id, j);
    }
}
