//! HTTP response construction with zero-copy file bodies.
//!
//! A [`Response`] resolves the request path against the document root, picks
//! the status code, and appends the status line and headers to the
//! connection's write buffer. The body is not copied: the resolved file is
//! memory mapped read-only and the connection's scatter-gather write sends
//! the mapping as its second segment. When the file cannot be mapped, a small
//! synthesized HTML error page is appended to the buffer instead.

use std::fs::File;
use std::os::unix::fs::PermissionsExt;
use std::path::{Path, PathBuf};

use memmap2::Mmap;

use crate::buffer::Buffer;
use crate::http::mime;

/// HTTP status codes emitted by the server.
///
/// Anything outside this set normalizes to `BadRequest`.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StatusCode {
    /// 200 OK
    Ok,
    /// 400 Bad Request
    BadRequest,
    /// 403 Forbidden
    Forbidden,
    /// 404 Not Found
    NotFound,
}

impl StatusCode {
    pub fn as_u16(&self) -> u16 {
        match self {
            StatusCode::Ok => 200,
            StatusCode::BadRequest => 400,
            StatusCode::Forbidden => 403,
            StatusCode::NotFound => 404,
        }
    }

    pub fn reason_phrase(&self) -> &'static str {
        match self {
            StatusCode::Ok => "OK",
            StatusCode::BadRequest => "Bad Request",
            StatusCode::Forbidden => "Forbidden",
            StatusCode::NotFound => "Not Found",
        }
    }

    /// The canonical error page served for this code, if it has one.
    pub fn error_page(&self) -> Option<&'static str> {
        match self {
            StatusCode::Ok => None,
            StatusCode::BadRequest => Some("/400.html"),
            StatusCode::Forbidden => Some("/403.html"),
            StatusCode::NotFound => Some("/404.html"),
        }
    }
}

pub struct Response {
    code: Option<StatusCode>,
    keep_alive: bool,
    path: String,
    src_dir: PathBuf,
    file: Option<Mmap>,
}

impl Default for Response {
    fn default() -> Self {
        Self::new()
    }
}

impl Response {
    pub fn new() -> Self {
        Self {
            code: None,
            keep_alive: false,
            path: String::new(),
            src_dir: PathBuf::new(),
            file: None,
        }
    }

    /// Resets the response for a new request. A previous file mapping is
    /// released first. `code` is the tentative status; `None` lets
    /// [`make_response`](Self::make_response) decide from the filesystem.
    pub fn init(&mut self, src_dir: &Path, path: &str, keep_alive: bool, code: Option<StatusCode>) {
        debug_assert!(!src_dir.as_os_str().is_empty());
        self.unmap_file();
        self.code = code;
        self.keep_alive = keep_alive;
        self.path = path.to_string();
        self.src_dir = src_dir.to_path_buf();
    }

    /// Resolves the target file, finalizes the status code, and appends the
    /// status line and headers to `buf`. On success the file is mapped and
    /// exposed through [`file`](Self::file) for the scatter-gather write; on
    /// mapping failure a synthesized error body is appended to `buf` instead.
    pub fn make_response(&mut self, buf: &mut Buffer) {
        match self.stat_target() {
            TargetStatus::Missing => self.code = Some(StatusCode::NotFound),
            TargetStatus::Unreadable => self.code = Some(StatusCode::Forbidden),
            TargetStatus::Serveable => {
                if self.code.is_none() {
                    self.code = Some(StatusCode::Ok);
                }
            }
        }
        self.error_html();
        self.add_state_line(buf);
        self.add_header(buf);
        self.add_content(buf);
    }

    /// The mapped file body, when one exists.
    pub fn file(&self) -> Option<&[u8]> {
        self.file.as_deref()
    }

    pub fn file_len(&self) -> usize {
        self.file.as_ref().map_or(0, |m| m.len())
    }

    pub fn code(&self) -> Option<StatusCode> {
        self.code
    }

    /// Releases the file mapping. Idempotent; also called on re-init.
    pub fn unmap_file(&mut self) {
        self.file = None;
    }

    fn full_path(&self) -> PathBuf {
        self.src_dir.join(self.path.trim_start_matches('/'))
    }

    fn stat_target(&self) -> TargetStatus {
        // Paths are joined without normalization, so refuse traversal
        // attempts outright.
        if self.path.contains("..") {
            return TargetStatus::Unreadable;
        }
        match std::fs::metadata(self.full_path()) {
            Err(_) => TargetStatus::Missing,
            Ok(meta) if meta.is_dir() => TargetStatus::Missing,
            // Serve only world-readable files.
            Ok(meta) if meta.permissions().mode() & 0o004 == 0 => TargetStatus::Unreadable,
            Ok(_) => TargetStatus::Serveable,
        }
    }

    /// Swaps in the canonical error page for error codes.
    fn error_html(&mut self) {
        if let Some(page) = self.code.and_then(|c| c.error_page()) {
            self.path = page.to_string();
        }
    }

    fn add_state_line(&mut self, buf: &mut Buffer) {
        let code = self.code.unwrap_or(StatusCode::BadRequest);
        self.code = Some(code);
        buf.append(format!("HTTP/1.1 {} {}\r\n", code.as_u16(), code.reason_phrase()).as_bytes());
    }

    fn add_header(&mut self, buf: &mut Buffer) {
        buf.append(b"Connection: ");
        if self.keep_alive {
            buf.append(b"keep-alive\r\n");
            buf.append(b"keep-alive: max=6, timeout=120\r\n");
        } else {
            buf.append(b"close\r\n");
        }
        buf.append(format!("Content-type: {}\r\n", mime::content_type(&self.path)).as_bytes());
    }

    fn add_content(&mut self, buf: &mut Buffer) {
        let path = self.full_path();
        let file = match File::open(&path) {
            Ok(f) => f,
            Err(e) => {
                tracing::debug!(path = %path.display(), error = %e, "open failed");
                self.error_content(buf, "File NotFound!");
                return;
            }
        };
        let mmap = match unsafe { Mmap::map(&file) } {
            Ok(m) => m,
            Err(e) => {
                tracing::debug!(path = %path.display(), error = %e, "mmap failed");
                self.error_content(buf, "File NotFound!");
                return;
            }
        };
        tracing::debug!(path = %path.display(), len = mmap.len(), "file mapped");
        buf.append(format!("Content-length: {}\r\n\r\n", mmap.len()).as_bytes());
        self.file = Some(mmap);
    }

    /// Appends a synthesized HTML error body, headers included.
    pub fn error_content(&mut self, buf: &mut Buffer, message: &str) {
        let code = self.code.unwrap_or(StatusCode::BadRequest);
        let body = format!(
            "<html><title>Error</title><body bgcolor=\"ffffff\">\
             {} : {}\n<p>{message}</p><hr><em>citadel</em></body></html>",
            code.as_u16(),
            code.reason_phrase(),
        );
        buf.append(format!("Content-length: {}\r\n\r\n", body.len()).as_bytes());
        buf.append(body.as_bytes());
    }
}

enum TargetStatus {
    Missing,
    Unreadable,
    Serveable,
}
