//! Shared resource pools: worker threads and database connections.

pub mod db;
pub mod worker;

pub use db::{DbPool, PooledConn};
pub use worker::WorkerPool;
