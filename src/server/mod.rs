//! Event-driven server core.
//!
//! - **`poller`**: thin epoll wrapper plus the eventfd waker
//! - **`timer`**: min-heap of per-connection idle deadlines
//! - **`reactor`**: the accept/dispatch loop tying poller, timer, worker
//!   pool, and connection map together

pub mod poller;
pub mod reactor;
pub mod timer;

pub use poller::{Poller, Registry, Waker};
pub use reactor::Server;
pub use timer::HeapTimer;
