//! HTTP protocol implementation.
//!
//! This module implements the HTTP/1.1 side of the server: parsing requests
//! out of the connection's read buffer, resolving them against the static
//! document root, and staging responses for the reactor's scatter-gather
//! write path.
//!
//! # Architecture
//!
//! - **`connection`**: per-peer state with the read/process/write entry
//!   points driven by worker tasks
//! - **`request`**: HTTP request representation and the incremental
//!   line-oriented parser
//! - **`response`**: HTTP response construction with memory-mapped file
//!   bodies and synthesized error pages
//! - **`mime`**: MIME type detection based on file extensions
//!
//! # Connection State Machine
//!
//! Each client connection cycles through these states:
//!
//! ```text
//!        ┌─────────────┐
//!        │   Reading   │ ← Drain socket into the read buffer
//!        └──────┬──────┘
//!               │ Data buffered
//!               ▼
//!        ┌──────────────────┐
//!        │   Processing     │ ← Parse request, stage response
//!        └──────┬───────────┘
//!               │ Response staged (or: need more data → Reading)
//!               ▼
//!        ┌──────────────────┐
//!        │    Writing       │ ← writev header bytes + mapped file
//!        └──────┬───────────┘
//!               │ Drained
//!               ├─ Keep-Alive → Processing (next request, same socket)
//!               └─ Close → Closed
//! ```

pub mod connection;
pub mod mime;
pub mod request;
pub mod response;
