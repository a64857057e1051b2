//! Bounded pool of pre-established MySQL connections.
//!
//! The pool opens its full complement of connections up front and hands them
//! out FIFO. [`DbPool::get`] blocks until a handle is free and returns a
//! [`PooledConn`] guard that puts the handle back on drop, so a connection is
//! released on every return path. A failed query returns the handle to the
//! pool unchanged; no retry or health check is performed.

use anyhow::Context as _;
use mysql::prelude::Queryable;
use mysql::{Conn, Opts, OptsBuilder};
use std::collections::VecDeque;
use std::ops::{Deref, DerefMut};
use std::sync::{Condvar, Mutex};

pub struct DbPool {
    conns: Mutex<VecDeque<Conn>>,
    available: Condvar,
    capacity: usize,
}

impl DbPool {
    /// Opens `capacity` connections. Any connection failure aborts pool
    /// construction.
    pub fn connect(
        host: &str,
        port: u16,
        user: &str,
        pwd: &str,
        db_name: &str,
        capacity: usize,
    ) -> anyhow::Result<Self> {
        assert!(capacity > 0, "db pool needs at least one connection");
        let opts = Opts::from(
            OptsBuilder::new()
                .ip_or_hostname(Some(host))
                .tcp_port(port)
                .user(Some(user))
                .pass(Some(pwd))
                .db_name(Some(db_name)),
        );

        let mut conns = VecDeque::with_capacity(capacity);
        for _ in 0..capacity {
            let conn = Conn::new(opts.clone())
                .with_context(|| format!("failed to connect to mysql at {host}:{port}"))?;
            conns.push_back(conn);
        }
        tracing::info!(capacity, host, port, db_name, "db pool ready");

        Ok(Self {
            conns: Mutex::new(conns),
            available: Condvar::new(),
            capacity,
        })
    }

    /// Blocks until a connection is free, then leases it out.
    pub fn get(&self) -> PooledConn<'_> {
        let mut conns = self.conns.lock().unwrap();
        loop {
            if let Some(conn) = conns.pop_front() {
                return PooledConn {
                    pool: self,
                    conn: Some(conn),
                };
            }
            conns = self.available.wait(conns).unwrap();
        }
    }

    pub fn capacity(&self) -> usize {
        self.capacity
    }

    /// Connections currently sitting idle in the pool.
    pub fn free_count(&self) -> usize {
        self.conns.lock().unwrap().len()
    }

    fn put(&self, conn: Conn) {
        self.conns.lock().unwrap().push_back(conn);
        self.available.notify_one();
    }

    /// Checks `(name, pwd)` against the `user` table. For a login, success
    /// means the row exists and the stored password matches. For a
    /// registration, success means no row exists and the insert goes through.
    /// Query failures count as verification failure.
    pub fn verify_user(&self, name: &str, pwd: &str, is_login: bool) -> bool {
        if name.is_empty() || pwd.is_empty() {
            return false;
        }
        let mut conn = self.get();

        let row: Option<(String, String)> = match conn.exec_first(
            "SELECT username, password FROM user WHERE username = ? LIMIT 1",
            (name,),
        ) {
            Ok(row) => row,
            Err(e) => {
                tracing::warn!(error = %e, "user lookup failed");
                return false;
            }
        };

        if is_login {
            let ok = matches!(&row, Some((_, stored)) if stored == pwd);
            if !ok {
                tracing::debug!(name, "login rejected");
            }
            return ok;
        }

        // Registration: the name must be unused.
        if row.is_some() {
            tracing::debug!(name, "username already taken");
            return false;
        }
        match conn.exec_drop(
            "INSERT INTO user(username, password) VALUES(?, ?)",
            (name, pwd),
        ) {
            Ok(()) => true,
            Err(e) => {
                tracing::warn!(error = %e, "user insert failed");
                false
            }
        }
    }
}

/// RAII lease on a pooled connection; returns it to the pool on drop.
pub struct PooledConn<'a> {
    pool: &'a DbPool,
    conn: Option<Conn>,
}

impl Deref for PooledConn<'_> {
    type Target = Conn;

    fn deref(&self) -> &Conn {
        self.conn.as_ref().unwrap()
    }
}

impl DerefMut for PooledConn<'_> {
    fn deref_mut(&mut self) -> &mut Conn {
        self.conn.as_mut().unwrap()
    }
}

impl Drop for PooledConn<'_> {
    fn drop(&mut self) {
        if let Some(conn) = self.conn.take() {
            self.pool.put(conn);
        }
    }
}
