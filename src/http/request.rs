//! HTTP request representation and incremental parsing.
//!
//! [`Request::parse`] is a line-oriented state machine over the connection's
//! read buffer: REQUEST_LINE → HEADERS → BODY → FINISH. Parsing consumes
//! complete CRLF-terminated lines from the buffer and keeps its state across
//! calls, so a request split over several reads resumes where it left off and
//! [`ParseError::Incomplete`] tells the caller to wait for more data.

use std::collections::HashMap;

use crate::buffer::Buffer;
use crate::pool::DbPool;

/// Targets that may be requested without their `.html` extension.
const DEFAULT_HTML: [&str; 6] = [
    "/index",
    "/register",
    "/login",
    "/welcome",
    "/video",
    "/picture",
];

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Method {
    GET,
    POST,
    PUT,
    DELETE,
    HEAD,
    OPTIONS,
    PATCH,
}

impl Method {
    pub fn from_str(s: &str) -> Option<Self> {
        match s {
            "GET" => Some(Method::GET),
            "POST" => Some(Method::POST),
            "PUT" => Some(Method::PUT),
            "DELETE" => Some(Method::DELETE),
            "HEAD" => Some(Method::HEAD),
            "OPTIONS" => Some(Method::OPTIONS),
            "PATCH" => Some(Method::PATCH),
            _ => None,
        }
    }
}

/// Errors that can occur during HTTP request parsing.
#[derive(Debug, PartialEq, Eq)]
pub enum ParseError {
    /// The request is incomplete and more data is needed
    Incomplete,
    /// The request line is malformed
    InvalidRequest,
    /// The HTTP method is not recognized
    InvalidMethod,
    /// A header line is malformed
    InvalidHeader,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum ParseState {
    RequestLine,
    Headers,
    Body,
    Finish,
}

pub struct Request {
    method: Option<Method>,
    path: String,
    version: String,
    headers: HashMap<String, String>,
    form: HashMap<String, String>,
    body: String,
    state: ParseState,
}

impl Default for Request {
    fn default() -> Self {
        Self::new()
    }
}

impl Request {
    pub fn new() -> Self {
        Self {
            method: None,
            path: String::new(),
            version: String::new(),
            headers: HashMap::new(),
            form: HashMap::new(),
            body: String::new(),
            state: ParseState::RequestLine,
        }
    }

    /// Clears all parsed state ahead of the next request on the connection.
    pub fn reset(&mut self) {
        self.method = None;
        self.path.clear();
        self.version.clear();
        self.headers.clear();
        self.form.clear();
        self.body.clear();
        self.state = ParseState::RequestLine;
    }

    /// Advances the state machine over whatever `buf` currently holds.
    ///
    /// Returns `Ok(())` once a full request has been parsed,
    /// `Err(ParseError::Incomplete)` when more data must be read first, and
    /// any other error for a malformed request (callers respond 400).
    ///
    /// POST bodies with content type `application/x-www-form-urlencoded` are
    /// decoded into the form map; login and register targets are then
    /// verified against `db` and the path rewritten to `/welcome.html` or
    /// `/error.html` accordingly.
    pub fn parse(&mut self, buf: &mut Buffer, db: Option<&DbPool>) -> Result<(), ParseError> {
        if buf.readable() == 0 && self.state != ParseState::Finish {
            return Err(ParseError::Incomplete);
        }
        while self.state != ParseState::Finish {
            match self.state {
                ParseState::RequestLine => {
                    let line = take_line(buf)?;
                    self.parse_request_line(&line)?;
                    self.resolve_path();
                    self.state = ParseState::Headers;
                }
                ParseState::Headers => {
                    let line = take_line(buf)?;
                    if line.is_empty() {
                        // Blank line ends the header block; GET has no body.
                        self.state = if self.method == Some(Method::GET) {
                            ParseState::Finish
                        } else {
                            ParseState::Body
                        };
                    } else {
                        self.parse_header(&line)?;
                    }
                }
                ParseState::Body => self.parse_body(buf, db)?,
                ParseState::Finish => break,
            }
        }
        tracing::debug!(method = ?self.method, path = %self.path, version = %self.version, "request parsed");
        Ok(())
    }

    pub fn method(&self) -> Option<Method> {
        self.method
    }

    pub fn path(&self) -> &str {
        &self.path
    }

    pub fn version(&self) -> &str {
        &self.version
    }

    pub fn header(&self, key: &str) -> Option<&str> {
        self.headers.get(key).map(|v| v.as_str())
    }

    /// Value of a decoded POST form field.
    pub fn form_value(&self, key: &str) -> Option<&str> {
        self.form.get(key).map(|v| v.as_str())
    }

    pub fn body(&self) -> &str {
        &self.body
    }

    pub fn is_finished(&self) -> bool {
        self.state == ParseState::Finish
    }

    /// Keep-alive requires both the header and HTTP/1.1.
    pub fn is_keep_alive(&self) -> bool {
        self.header("Connection") == Some("keep-alive") && self.version == "1.1"
    }

    fn parse_request_line(&mut self, line: &str) -> Result<(), ParseError> {
        let mut parts = line.split(' ');
        let (Some(method), Some(target), Some(proto), None) =
            (parts.next(), parts.next(), parts.next(), parts.next())
        else {
            tracing::warn!(line, "malformed request line");
            return Err(ParseError::InvalidRequest);
        };
        let Some(version) = proto.strip_prefix("HTTP/") else {
            tracing::warn!(line, "malformed request line");
            return Err(ParseError::InvalidRequest);
        };
        if method.is_empty() || target.is_empty() || version.is_empty() {
            return Err(ParseError::InvalidRequest);
        }
        self.method = Some(Method::from_str(method).ok_or(ParseError::InvalidMethod)?);
        self.path = target.to_string();
        self.version = version.to_string();
        Ok(())
    }

    /// `/` serves the index; extensionless default pages get `.html`
    /// appended; everything else is used verbatim.
    fn resolve_path(&mut self) {
        if self.path == "/" {
            self.path = "/index.html".to_string();
        } else if DEFAULT_HTML.contains(&self.path.as_str()) {
            self.path.push_str(".html");
        }
    }

    fn parse_header(&mut self, line: &str) -> Result<(), ParseError> {
        let Some((key, value)) = line.split_once(':') else {
            return Err(ParseError::InvalidHeader);
        };
        let value = value.strip_prefix(' ').unwrap_or(value);
        self.headers.insert(key.to_string(), value.to_string());
        Ok(())
    }

    fn parse_body(&mut self, buf: &mut Buffer, db: Option<&DbPool>) -> Result<(), ParseError> {
        self.body = match self.content_length() {
            Some(len) => {
                if buf.readable() < len {
                    return Err(ParseError::Incomplete);
                }
                let bytes = buf.peek()[..len].to_vec();
                buf.retrieve(len);
                String::from_utf8_lossy(&bytes).into_owned()
            }
            None => buf.retrieve_all_to_string(),
        };
        self.parse_form(db);
        self.state = ParseState::Finish;
        tracing::debug!(len = self.body.len(), "body parsed");
        Ok(())
    }

    fn content_length(&self) -> Option<usize> {
        self.header("Content-Length").and_then(|v| v.parse().ok())
    }

    fn parse_form(&mut self, db: Option<&DbPool>) {
        if self.method != Some(Method::POST)
            || self.header("Content-Type") != Some("application/x-www-form-urlencoded")
        {
            return;
        }
        self.form = parse_urlencoded(&self.body);

        let is_login = match self.path.as_str() {
            "/login.html" => true,
            "/register.html" => false,
            _ => return,
        };
        let name = self.form_value("username").unwrap_or("");
        let pwd = self.form_value("password").unwrap_or("");
        let verified = match db {
            Some(pool) => pool.verify_user(name, pwd, is_login),
            None => false,
        };
        self.path = if verified {
            "/welcome.html".to_string()
        } else {
            "/error.html".to_string()
        };
    }
}

/// Consumes one CRLF-terminated line from the buffer, without the terminator.
fn take_line(buf: &mut Buffer) -> Result<String, ParseError> {
    let readable = buf.peek();
    let Some(pos) = readable.windows(2).position(|w| w == b"\r\n") else {
        return Err(ParseError::Incomplete);
    };
    let line = String::from_utf8_lossy(&readable[..pos]).into_owned();
    buf.retrieve(pos + 2);
    Ok(line)
}

/// Decodes an `application/x-www-form-urlencoded` body into key/value pairs.
/// `+` becomes a space and `%HH` the byte with that hex value; a missing
/// trailing `&` is tolerated.
pub fn parse_urlencoded(body: &str) -> HashMap<String, String> {
    let mut form = HashMap::new();
    for pair in body.split('&') {
        if pair.is_empty() {
            continue;
        }
        let (key, value) = pair.split_once('=').unwrap_or((pair, ""));
        form.insert(url_decode(key), url_decode(value));
    }
    form
}

fn url_decode(s: &str) -> String {
    let bytes = s.as_bytes();
    let mut out = Vec::with_capacity(bytes.len());
    let mut i = 0;
    while i < bytes.len() {
        match bytes[i] {
            b'+' => {
                out.push(b' ');
                i += 1;
            }
            b'%' if i + 2 < bytes.len() => match (hex_value(bytes[i + 1]), hex_value(bytes[i + 2]))
            {
                (Some(hi), Some(lo)) => {
                    out.push(hi * 16 + lo);
                    i += 3;
                }
                _ => {
                    out.push(b'%');
                    i += 1;
                }
            },
            other => {
                out.push(other);
                i += 1;
            }
        }
    }
    String::from_utf8_lossy(&out).into_owned()
}

fn hex_value(b: u8) -> Option<u8> {
    match b {
        b'0'..=b'9' => Some(b - b'0'),
        b'a'..=b'f' => Some(b - b'a' + 10),
        b'A'..=b'F' => Some(b - b'A' + 10),
        _ => None,
    }
}
