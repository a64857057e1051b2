//! The reactor: accept loop, event dispatch, timer coupling, and lifecycle.
//!
//! One thread owns the multiplexer, the connection map, and the timer heap.
//! Ready events are dispatched to the worker pool, which advances a
//! connection's state machine (read → process → write) and re-arms the fd
//! itself; `EPOLLONESHOT` guarantees at most one in-flight worker task per
//! connection, so per-connection state needs no further coordination.
//!
//! Closes are funneled back to the reactor: workers and timer callbacks push
//! the fd onto a pending-close list and kick an eventfd, and only the reactor
//! tears the connection down and drops it from the map. That keeps the map
//! and the timer heap single-owner and the fd alive for any worker task still
//! holding the connection.

use std::collections::HashMap;
use std::io::{self, Write as _};
use std::net::{SocketAddr, TcpListener, TcpStream};
use std::os::fd::{AsRawFd, FromRawFd, OwnedFd, RawFd};
use std::path::PathBuf;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use anyhow::Context as _;

use crate::config::Config;
use crate::http::connection::Connection;
use crate::pool::{DbPool, WorkerPool};
use crate::server::poller::{Poller, Registry, Waker};
use crate::server::timer::HeapTimer;

/// Hard cap on concurrent clients; accepts beyond it are turned away.
const MAX_FD: usize = 65536;

const EV_IN: u32 = libc::EPOLLIN as u32;
const EV_OUT: u32 = libc::EPOLLOUT as u32;
const EV_ET: u32 = libc::EPOLLET as u32;
const EV_RDHUP: u32 = libc::EPOLLRDHUP as u32;
const EV_HUP: u32 = libc::EPOLLHUP as u32;
const EV_ERR: u32 = libc::EPOLLERR as u32;
const EV_ONESHOT: u32 = libc::EPOLLONESHOT as u32;

pub struct Server {
    listener: TcpListener,
    listen_event: u32,
    conn_event: u32,
    /// Idle timeout per connection; `None` disables the timer wheel.
    timeout: Option<Duration>,
    poller: Poller,
    registry: Registry,
    timer: HeapTimer,
    workers: WorkerPool,
    db: Option<Arc<DbPool>>,
    src_dir: Arc<PathBuf>,
    users: HashMap<RawFd, Arc<Mutex<Connection>>>,
    user_count: Arc<AtomicUsize>,
    closer: Closer,
}

/// Handle worker tasks and timer callbacks use to ask the reactor for a
/// close.
#[derive(Clone)]
struct Closer {
    pending: Arc<Mutex<Vec<RawFd>>>,
    waker: Arc<Waker>,
}

impl Closer {
    fn request(&self, fd: RawFd) {
        self.pending.lock().unwrap().push(fd);
        self.waker.wake();
    }
}

impl Server {
    pub fn new(cfg: &Config) -> anyhow::Result<Self> {
        anyhow::ensure!(
            cfg.src_dir.is_dir(),
            "document root {} is not a directory",
            cfg.src_dir.display()
        );

        let db = if cfg.conn_pool_size == 0 {
            tracing::warn!("db pool disabled, login and register will fail");
            None
        } else {
            let pool = DbPool::connect(
                &cfg.sql_host,
                cfg.sql_port,
                &cfg.sql_user,
                &cfg.sql_pwd,
                &cfg.db_name,
                cfg.conn_pool_size,
            )
            .context("db pool init failed")?;
            Some(Arc::new(pool))
        };

        let (listen_event, conn_event) = Self::event_mode(cfg.trig_mode);
        let listener = Self::init_socket(cfg.port, cfg.opt_linger)?;
        let poller = Poller::new(cfg.max_events).context("epoll init failed")?;
        let registry = poller.registry();
        let waker = Arc::new(Waker::new().context("eventfd init failed")?);

        registry
            .add(listener.as_raw_fd(), listen_event | EV_IN)
            .context("failed to register listen socket")?;
        registry
            .add(waker.fd(), EV_IN)
            .context("failed to register waker")?;

        tracing::info!(
            addr = %listener.local_addr()?,
            trig_mode = cfg.trig_mode,
            timeout_ms = cfg.timeout_ms,
            workers = cfg.thread_count,
            src_dir = %cfg.src_dir.display(),
            "server ready"
        );

        Ok(Self {
            listener,
            listen_event,
            conn_event,
            timeout: (cfg.timeout_ms > 0).then(|| Duration::from_millis(cfg.timeout_ms)),
            poller,
            registry,
            timer: HeapTimer::new(),
            workers: WorkerPool::new(cfg.thread_count),
            db,
            src_dir: Arc::new(cfg.src_dir.clone()),
            users: HashMap::new(),
            user_count: Arc::new(AtomicUsize::new(0)),
            closer: Closer {
                pending: Arc::new(Mutex::new(Vec::new())),
                waker,
            },
        })
    }

    /// The bound listen address (the port is ephemeral when configured as 0).
    pub fn local_addr(&self) -> io::Result<SocketAddr> {
        self.listener.local_addr()
    }

    /// Runs the event loop. Only a hard multiplexer failure exits.
    pub fn run(&mut self) {
        loop {
            let timeout_ms = if self.timeout.is_some() {
                self.timer.next_tick_ms()
            } else {
                -1
            };
            let ready = match self.poller.wait(timeout_ms) {
                Ok(n) => n,
                Err(e) if e.kind() == io::ErrorKind::Interrupted => 0,
                Err(e) => {
                    tracing::error!(error = %e, "epoll wait failed");
                    break;
                }
            };

            for i in 0..ready {
                let fd = self.poller.event_fd(i);
                let mask = self.poller.event_mask(i);
                if fd == self.listener.as_raw_fd() {
                    self.deal_listen();
                } else if fd == self.closer.waker.fd() {
                    self.closer.waker.drain();
                } else if mask & (EV_RDHUP | EV_HUP | EV_ERR) != 0 {
                    self.close_conn(fd);
                } else if mask & EV_IN != 0 {
                    self.deal_read(fd);
                } else if mask & EV_OUT != 0 {
                    self.deal_write(fd);
                } else {
                    tracing::warn!(fd, mask, "unexpected event");
                }
            }

            self.timer.tick();
            self.drain_pending_close();
        }
    }

    /// Client events carry `EPOLLONESHOT` so one worker at a time advances a
    /// connection; `trig_mode` bit 0 selects edge-triggered client events,
    /// bit 1 edge-triggered accepts.
    fn event_mode(trig_mode: u8) -> (u32, u32) {
        let mut listen_event = EV_RDHUP;
        let mut conn_event = EV_ONESHOT | EV_RDHUP;
        if trig_mode & 0b01 != 0 {
            conn_event |= EV_ET;
        }
        if trig_mode & 0b10 != 0 {
            listen_event |= EV_ET;
        }
        (listen_event, conn_event)
    }

    fn init_socket(port: u16, opt_linger: bool) -> anyhow::Result<TcpListener> {
        anyhow::ensure!(port == 0 || port >= 1024, "port {port} out of range");

        let fd = unsafe { libc::socket(libc::AF_INET, libc::SOCK_STREAM, 0) };
        if fd < 0 {
            return Err(io::Error::last_os_error()).context("socket failed");
        }
        let owned = unsafe { OwnedFd::from_raw_fd(fd) };

        // Optional graceful close: linger up to a second for in-flight data.
        let linger = libc::linger {
            l_onoff: opt_linger as libc::c_int,
            l_linger: 1,
        };
        set_sock_opt(fd, libc::SO_LINGER, &linger).context("SO_LINGER failed")?;

        let reuse: libc::c_int = 1;
        set_sock_opt(fd, libc::SO_REUSEADDR, &reuse).context("SO_REUSEADDR failed")?;

        let addr = libc::sockaddr_in {
            sin_family: libc::AF_INET as libc::sa_family_t,
            sin_port: port.to_be(),
            sin_addr: libc::in_addr {
                s_addr: libc::INADDR_ANY,
            },
            sin_zero: [0; 8],
        };
        let ret = unsafe {
            libc::bind(
                fd,
                &addr as *const libc::sockaddr_in as *const libc::sockaddr,
                std::mem::size_of::<libc::sockaddr_in>() as libc::socklen_t,
            )
        };
        if ret < 0 {
            return Err(io::Error::last_os_error()).context(format!("bind port {port} failed"));
        }
        if unsafe { libc::listen(fd, 6) } < 0 {
            return Err(io::Error::last_os_error()).context("listen failed");
        }

        let listener = TcpListener::from(owned);
        listener
            .set_nonblocking(true)
            .context("failed to set listen socket non-blocking")?;
        Ok(listener)
    }

    fn deal_listen(&mut self) {
        loop {
            match self.listener.accept() {
                Ok((stream, addr)) => {
                    if self.user_count.load(Ordering::Relaxed) >= MAX_FD {
                        Self::send_busy(stream, addr);
                    } else {
                        self.add_client(stream, addr);
                    }
                }
                Err(e) if e.kind() == io::ErrorKind::WouldBlock => break,
                Err(e) if e.kind() == io::ErrorKind::Interrupted => continue,
                Err(e) => {
                    tracing::error!(error = %e, "accept failed");
                    break;
                }
            }
            if self.listen_event & EV_ET == 0 {
                break;
            }
        }
    }

    fn send_busy(mut stream: TcpStream, addr: SocketAddr) {
        tracing::warn!(%addr, "server busy, turning client away");
        let _ = stream.write_all(b"Server busy!");
    }

    fn add_client(&mut self, stream: TcpStream, addr: SocketAddr) {
        if let Err(e) = stream.set_nonblocking(true) {
            tracing::warn!(%addr, error = %e, "failed to set client non-blocking");
            return;
        }
        let fd = stream.as_raw_fd();
        let conn = Connection::new(
            stream,
            addr,
            self.conn_event & EV_ET != 0,
            Arc::clone(&self.src_dir),
            self.db.clone(),
            Arc::clone(&self.user_count),
        );
        self.users.insert(fd, Arc::new(Mutex::new(conn)));

        if let Some(timeout) = self.timeout {
            let closer = self.closer.clone();
            self.timer
                .add(fd, timeout, Box::new(move || closer.request(fd)));
        }
        if let Err(e) = self.registry.add(fd, self.conn_event | EV_IN) {
            tracing::error!(fd, error = %e, "failed to register client");
            self.close_conn(fd);
        }
    }

    /// A fresh event on a connection proves it alive; push its deadline out.
    fn extend_time(&mut self, fd: RawFd) {
        if let Some(timeout) = self.timeout {
            self.timer.adjust(fd, timeout);
        }
    }

    fn deal_read(&mut self, fd: RawFd) {
        let Some(conn) = self.users.get(&fd).cloned() else {
            return;
        };
        self.extend_time(fd);
        let registry = self.registry.clone();
        let conn_event = self.conn_event;
        let closer = self.closer.clone();
        self.workers
            .submit(move || on_read(&conn, &registry, conn_event, &closer));
    }

    fn deal_write(&mut self, fd: RawFd) {
        let Some(conn) = self.users.get(&fd).cloned() else {
            return;
        };
        self.extend_time(fd);
        let registry = self.registry.clone();
        let conn_event = self.conn_event;
        let closer = self.closer.clone();
        self.workers
            .submit(move || on_write(&conn, &registry, conn_event, &closer));
    }

    /// Tears a connection down: deregisters, cancels its timer, closes, and
    /// drops it from the map. The fd itself closes when the last clone of the
    /// connection (possibly held by an in-flight worker task) is dropped.
    fn close_conn(&mut self, fd: RawFd) {
        let Some(conn) = self.users.remove(&fd) else {
            return;
        };
        self.timer.cancel(fd);
        let _ = self.registry.delete(fd);
        conn.lock().unwrap().close();
    }

    fn drain_pending_close(&mut self) {
        let fds = std::mem::take(&mut *self.closer.pending.lock().unwrap());
        for fd in fds {
            self.close_conn(fd);
        }
    }
}

fn on_read(conn: &Arc<Mutex<Connection>>, registry: &Registry, conn_event: u32, closer: &Closer) {
    let mut c = conn.lock().unwrap();
    if c.is_closed() {
        return;
    }
    let fd = c.fd();
    match c.read() {
        // Peer closed.
        Ok(0) => closer.request(fd),
        Ok(_) => on_process(&mut c, registry, conn_event, closer),
        Err(e) if e.kind() == io::ErrorKind::WouldBlock => {
            let _ = registry.modify(fd, conn_event | EV_IN);
        }
        Err(e) => {
            tracing::warn!(fd, error = %e, "read failed");
            closer.request(fd);
        }
    }
}

fn on_process(c: &mut Connection, registry: &Registry, conn_event: u32, closer: &Closer) {
    let fd = c.fd();
    let interest = if c.process() { EV_OUT } else { EV_IN };
    if registry.modify(fd, conn_event | interest).is_err() {
        closer.request(fd);
    }
}

fn on_write(conn: &Arc<Mutex<Connection>>, registry: &Registry, conn_event: u32, closer: &Closer) {
    let mut c = conn.lock().unwrap();
    if c.is_closed() {
        return;
    }
    let fd = c.fd();
    match c.write() {
        Ok(_) => {
            if c.to_write_bytes() == 0 {
                if c.is_keep_alive() {
                    // Response done; look for a pipelined request or go back
                    // to waiting for one.
                    on_process(&mut c, registry, conn_event, closer);
                } else {
                    closer.request(fd);
                }
            } else {
                // Partial write without EAGAIN; finish on the next event.
                let _ = registry.modify(fd, conn_event | EV_OUT);
            }
        }
        Err(e) if e.kind() == io::ErrorKind::WouldBlock => {
            let _ = registry.modify(fd, conn_event | EV_OUT);
        }
        Err(e) => {
            tracing::warn!(fd, error = %e, "write failed");
            closer.request(fd);
        }
    }
}

fn set_sock_opt<T>(fd: RawFd, opt: libc::c_int, value: &T) -> io::Result<()> {
    let ret = unsafe {
        libc::setsockopt(
            fd,
            libc::SOL_SOCKET,
            opt,
            value as *const T as *const libc::c_void,
            std::mem::size_of::<T>() as libc::socklen_t,
        )
    };
    if ret < 0 {
        return Err(io::Error::last_os_error());
    }
    Ok(())
}
