//! Citadel - Event-driven HTTP/1.1 static file server
//!
//! Core library: single-reactor event loop over epoll, worker-pool request
//! processing, memory-mapped static file responses, and database-backed
//! login/registration.

pub mod buffer;
pub mod config;
pub mod http;
pub mod pool;
pub mod server;
