//! Append-oriented byte buffer backing the per-connection read and write paths.
//!
//! A `Buffer` is a growable FIFO over a contiguous byte array with a read
//! index and a write index. The readable span is `[read_pos, write_pos)`, the
//! writable span is `[write_pos, len)`, and the prependable span `[0, read_pos)`
//! is dead space reclaimed by compaction when more room is needed.

use std::io;
use std::os::fd::RawFd;

/// Size of the stack scratch area used by [`Buffer::read_fd`].
const SCRATCH_SIZE: usize = 65536;

const INITIAL_SIZE: usize = 1024;

pub struct Buffer {
    buf: Vec<u8>,
    read_pos: usize,
    write_pos: usize,
}

impl Default for Buffer {
    fn default() -> Self {
        Self::new()
    }
}

impl Buffer {
    pub fn new() -> Self {
        Self::with_capacity(INITIAL_SIZE)
    }

    pub fn with_capacity(capacity: usize) -> Self {
        Self {
            buf: vec![0; capacity],
            read_pos: 0,
            write_pos: 0,
        }
    }

    /// Number of bytes available to read.
    pub fn readable(&self) -> usize {
        self.write_pos - self.read_pos
    }

    /// Number of bytes that can be written without growing or compacting.
    pub fn writable(&self) -> usize {
        self.buf.len() - self.write_pos
    }

    /// Dead space in front of the readable span, reclaimable by compaction.
    pub fn prependable(&self) -> usize {
        self.read_pos
    }

    /// The readable span.
    pub fn peek(&self) -> &[u8] {
        &self.buf[self.read_pos..self.write_pos]
    }

    /// Makes room for at least `len` more bytes behind the write index.
    pub fn ensure_writable(&mut self, len: usize) {
        if self.writable() < len {
            self.make_space(len);
        }
        debug_assert!(self.writable() >= len);
    }

    /// Advances the write index after bytes were placed in the writable span.
    pub fn has_written(&mut self, len: usize) {
        debug_assert!(len <= self.writable());
        self.write_pos += len;
    }

    pub fn append(&mut self, data: &[u8]) {
        self.ensure_writable(data.len());
        self.buf[self.write_pos..self.write_pos + data.len()].copy_from_slice(data);
        self.has_written(data.len());
    }

    /// Discards `len` readable bytes. Draining the buffer resets both indices.
    pub fn retrieve(&mut self, len: usize) {
        debug_assert!(len <= self.readable());
        if len < self.readable() {
            self.read_pos += len;
        } else {
            self.retrieve_all();
        }
    }

    pub fn retrieve_all(&mut self) {
        self.read_pos = 0;
        self.write_pos = 0;
    }

    /// Snapshots the readable span as a string and drains the buffer.
    pub fn retrieve_all_to_string(&mut self) -> String {
        let s = String::from_utf8_lossy(self.peek()).into_owned();
        self.retrieve_all();
        s
    }

    /// Reads from `fd` with a vectored read into the writable tail plus a
    /// 64 KiB stack scratch area, so a single syscall can pull in more than
    /// the buffer currently has room for. Returns the total bytes read;
    /// `Ok(0)` is end of stream.
    pub fn read_fd(&mut self, fd: RawFd) -> io::Result<usize> {
        let mut scratch = [0u8; SCRATCH_SIZE];
        let writable = self.writable();

        let iov = [
            libc::iovec {
                iov_base: self.buf[self.write_pos..].as_mut_ptr() as *mut libc::c_void,
                iov_len: writable,
            },
            libc::iovec {
                iov_base: scratch.as_mut_ptr() as *mut libc::c_void,
                iov_len: scratch.len(),
            },
        ];

        let n = unsafe { libc::readv(fd, iov.as_ptr(), 2) };
        if n < 0 {
            return Err(io::Error::last_os_error());
        }

        let n = n as usize;
        if n <= writable {
            self.write_pos += n;
        } else {
            self.write_pos = self.buf.len();
            self.append(&scratch[..n - writable]);
        }
        Ok(n)
    }

    /// Writes the readable span to `fd` and advances the read index.
    pub fn write_fd(&mut self, fd: RawFd) -> io::Result<usize> {
        let readable = self.readable();
        let n = unsafe {
            libc::write(
                fd,
                self.buf[self.read_pos..].as_ptr() as *const libc::c_void,
                readable,
            )
        };
        if n < 0 {
            return Err(io::Error::last_os_error());
        }
        self.retrieve(n as usize);
        Ok(n as usize)
    }

    fn make_space(&mut self, len: usize) {
        if self.writable() + self.prependable() < len + 1 {
            self.buf.resize(self.write_pos + len + 1, 0);
        } else {
            // Shift the readable span to the front, reclaiming dead space.
            let readable = self.readable();
            self.buf.copy_within(self.read_pos..self.write_pos, 0);
            self.read_pos = 0;
            self.write_pos = readable;
        }
    }
}
