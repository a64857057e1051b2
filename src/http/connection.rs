//! Per-peer HTTP connection state.
//!
//! A `Connection` owns the socket, the read and write buffers, and the
//! request/response pair for one client. It implements the three entry
//! points the reactor's worker tasks drive:
//!
//! 1. **read**: drain the socket into the read buffer (exhaustively in
//!    edge-triggered mode)
//! 2. **process**: parse a request and stage the response, headers in the
//!    write buffer and the body as a memory-mapped file
//! 3. **write**: scatter-gather write of header bytes and mapped body until
//!    drained or the socket would block
//!
//! Keep-alive connections cycle back from write to process to read for the
//! next request on the same socket.
//!
//! A connection is advanced by one worker at a time (the reactor re-arms the
//! fd only after the previous task finishes), so the states never race; the
//! close flag makes teardown idempotent against a timer firing behind a
//! worker.

use std::io;
use std::net::{Shutdown, SocketAddr, TcpStream};
use std::os::fd::{AsRawFd, RawFd};
use std::path::PathBuf;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;

use crate::buffer::Buffer;
use crate::http::request::{ParseError, Request};
use crate::http::response::{Response, StatusCode};
use crate::pool::DbPool;

/// In level-triggered mode the write loop stops once the backlog is small
/// enough for a single future writev.
const WRITE_LOOP_THRESHOLD: usize = 10240;

pub struct Connection {
    stream: TcpStream,
    addr: SocketAddr,
    closed: bool,
    et_mode: bool,
    src_dir: Arc<PathBuf>,
    db: Option<Arc<DbPool>>,
    user_count: Arc<AtomicUsize>,
    read_buf: Buffer,
    write_buf: Buffer,
    /// Bytes of the mapped file body already written out.
    file_written: usize,
    request: Request,
    response: Response,
}

impl Connection {
    /// Takes ownership of an accepted socket and counts the client in.
    pub fn new(
        stream: TcpStream,
        addr: SocketAddr,
        et_mode: bool,
        src_dir: Arc<PathBuf>,
        db: Option<Arc<DbPool>>,
        user_count: Arc<AtomicUsize>,
    ) -> Self {
        let users = user_count.fetch_add(1, Ordering::Relaxed) + 1;
        tracing::info!(fd = stream.as_raw_fd(), addr = %addr, users, "client in");
        Self {
            stream,
            addr,
            closed: false,
            et_mode,
            src_dir,
            db,
            user_count,
            read_buf: Buffer::new(),
            write_buf: Buffer::new(),
            file_written: 0,
            request: Request::new(),
            response: Response::new(),
        }
    }

    pub fn fd(&self) -> RawFd {
        self.stream.as_raw_fd()
    }

    pub fn addr(&self) -> SocketAddr {
        self.addr
    }

    pub fn is_closed(&self) -> bool {
        self.closed
    }

    pub fn is_keep_alive(&self) -> bool {
        self.request.is_keep_alive()
    }

    /// Header bytes plus unsent body bytes still owed to the peer.
    pub fn to_write_bytes(&self) -> usize {
        self.write_buf.readable() + self.response.file_len().saturating_sub(self.file_written)
    }

    /// Drains the socket into the read buffer; loops until `WouldBlock` in
    /// edge-triggered mode, reads once otherwise.
    ///
    /// Returns the total bytes read. `Ok(0)` means the peer closed; an
    /// `Err(WouldBlock)` means no data was available at all.
    pub fn read(&mut self) -> io::Result<usize> {
        let mut total = 0;
        loop {
            match self.read_buf.read_fd(self.fd()) {
                Ok(0) => return Ok(0),
                Ok(n) => {
                    total += n;
                    if !self.et_mode {
                        break;
                    }
                }
                Err(e) if e.kind() == io::ErrorKind::WouldBlock => {
                    if total == 0 {
                        return Err(e);
                    }
                    break;
                }
                Err(e) if e.kind() == io::ErrorKind::Interrupted => continue,
                Err(e) => return Err(e),
            }
        }
        Ok(total)
    }

    /// Scatter-gather write of the staged response: header bytes from the
    /// write buffer as the first segment, the mapped file as the second.
    ///
    /// Loops until everything is out or the socket would block; in
    /// level-triggered mode the loop also yields once the backlog drops to
    /// [`WRITE_LOOP_THRESHOLD`], letting the reactor re-invoke on the next
    /// writable event.
    pub fn write(&mut self) -> io::Result<usize> {
        let mut total = 0;
        loop {
            let n = self.writev()?;
            total += n;

            let head_len = self.write_buf.readable();
            if n > head_len {
                self.file_written += n - head_len;
                if head_len > 0 {
                    self.write_buf.retrieve_all();
                }
            } else {
                self.write_buf.retrieve(n);
            }

            if self.to_write_bytes() == 0 {
                break;
            }
            if !self.et_mode && self.to_write_bytes() <= WRITE_LOOP_THRESHOLD {
                break;
            }
        }
        Ok(total)
    }

    /// Parses buffered request data and stages the response.
    ///
    /// Returns `true` when a response is ready to write (including error
    /// responses) and `false` when the caller should wait for more request
    /// data first.
    pub fn process(&mut self) -> bool {
        if self.request.is_finished() {
            // Fresh cycle on a kept-alive connection.
            self.request.reset();
        }
        if self.read_buf.readable() == 0 {
            return false;
        }
        match self.request.parse(&mut self.read_buf, self.db.as_deref()) {
            Ok(()) => {
                self.response.init(
                    &self.src_dir,
                    self.request.path(),
                    self.request.is_keep_alive(),
                    Some(StatusCode::Ok),
                );
            }
            Err(ParseError::Incomplete) => return false,
            Err(e) => {
                tracing::warn!(addr = %self.addr, error = ?e, "bad request");
                self.response.init(
                    &self.src_dir,
                    self.request.path(),
                    false,
                    Some(StatusCode::BadRequest),
                );
                // The failed request must not decide keep-alive for the
                // connection; the 400 response already said close.
                self.request.reset();
            }
        }
        self.response.make_response(&mut self.write_buf);
        self.file_written = 0;
        tracing::debug!(
            path = self.request.path(),
            file_len = self.response.file_len(),
            to_write = self.to_write_bytes(),
            "response staged"
        );
        true
    }

    /// Releases the file mapping, shuts the socket down, and counts the
    /// client out. Safe to call more than once.
    pub fn close(&mut self) {
        self.response.unmap_file();
        if !self.closed {
            self.closed = true;
            let users = self.user_count.fetch_sub(1, Ordering::Relaxed) - 1;
            let _ = self.stream.shutdown(Shutdown::Both);
            tracing::info!(fd = self.fd(), addr = %self.addr, users, "client out");
        }
    }

    fn writev(&self) -> io::Result<usize> {
        let head = self.write_buf.peek();
        let body = self.response.file().map_or(&[][..], |f| &f[self.file_written..]);

        let iov = [
            libc::iovec {
                iov_base: head.as_ptr() as *mut libc::c_void,
                iov_len: head.len(),
            },
            libc::iovec {
                iov_base: body.as_ptr() as *mut libc::c_void,
                iov_len: body.len(),
            },
        ];
        let iov_cnt = if body.is_empty() { 1 } else { 2 };

        let n = unsafe { libc::writev(self.stream.as_raw_fd(), iov.as_ptr(), iov_cnt) };
        if n < 0 {
            return Err(io::Error::last_os_error());
        }
        Ok(n as usize)
    }
}

impl Drop for Connection {
    fn drop(&mut self) {
        self.close();
    }
}
