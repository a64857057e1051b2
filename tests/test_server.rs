use citadel::config::Config;
use citadel::server::Server;

use std::io::{Read, Write};
use std::net::{SocketAddr, TcpStream};
use std::path::Path;
use std::thread;
use std::time::Duration;

use tempfile::TempDir;

fn doc_root() -> TempDir {
    let dir = tempfile::tempdir().unwrap();
    std::fs::write(dir.path().join("index.html"), "<html>index page</html>").unwrap();
    std::fs::write(dir.path().join("a.html"), "<html>page a</html>").unwrap();
    std::fs::write(dir.path().join("b.html"), "<html>page b</html>").unwrap();
    std::fs::write(dir.path().join("404.html"), "<html>not found page</html>").unwrap();
    std::fs::write(dir.path().join("error.html"), "<html>auth failed</html>").unwrap();
    dir
}

fn test_config(root: &Path) -> Config {
    Config {
        port: 0,
        trig_mode: 3,
        timeout_ms: 60000,
        src_dir: root.to_path_buf(),
        // No database in the test environment; auth fails closed.
        conn_pool_size: 0,
        thread_count: 2,
        open_log: false,
        ..Config::default()
    }
}

fn start_server(cfg: &Config) -> SocketAddr {
    let mut server = Server::new(cfg).unwrap();
    let addr = server.local_addr().unwrap();
    thread::spawn(move || server.run());
    addr
}

fn connect(addr: SocketAddr) -> TcpStream {
    let stream = TcpStream::connect(("127.0.0.1", addr.port())).unwrap();
    stream
        .set_read_timeout(Some(Duration::from_secs(3)))
        .unwrap();
    stream
}

fn find(haystack: &[u8], needle: &[u8]) -> Option<usize> {
    haystack.windows(needle.len()).position(|w| w == needle)
}

/// Reads one full response and returns (header block, body).
fn read_response(stream: &mut TcpStream) -> (String, String) {
    let mut data = Vec::new();
    let mut chunk = [0u8; 4096];
    let header_end = loop {
        if let Some(pos) = find(&data, b"\r\n\r\n") {
            break pos;
        }
        let n = stream.read(&mut chunk).unwrap();
        assert!(n > 0, "connection closed before headers completed");
        data.extend_from_slice(&chunk[..n]);
    };

    let headers = String::from_utf8_lossy(&data[..header_end]).into_owned();
    let content_length = headers
        .lines()
        .find_map(|l| l.strip_prefix("Content-length: "))
        .map(|v| v.trim().parse::<usize>().unwrap())
        .unwrap_or(0);

    let mut body = data[header_end + 4..].to_vec();
    while body.len() < content_length {
        let n = stream.read(&mut chunk).unwrap();
        assert!(n > 0, "connection closed before body completed");
        body.extend_from_slice(&chunk[..n]);
    }
    (headers, String::from_utf8_lossy(&body).into_owned())
}

fn read_eof(stream: &mut TcpStream) -> bool {
    let mut chunk = [0u8; 16];
    matches!(stream.read(&mut chunk), Ok(0))
}

#[test]
fn test_get_root_serves_index() {
    let root = doc_root();
    let addr = start_server(&test_config(root.path()));

    let mut stream = connect(addr);
    stream
        .write_all(b"GET / HTTP/1.1\r\nHost: localhost\r\nConnection: close\r\n\r\n")
        .unwrap();

    let (headers, body) = read_response(&mut stream);
    assert!(headers.starts_with("HTTP/1.1 200 OK\r\n"), "{headers}");
    assert!(headers.contains("Content-type: text/html"));
    assert!(headers.contains("Content-length: 23"));
    assert_eq!(body, "<html>index page</html>");
}

#[test]
fn test_missing_file_serves_404_page() {
    let root = doc_root();
    let addr = start_server(&test_config(root.path()));

    let mut stream = connect(addr);
    stream
        .write_all(b"GET /nosuchfile HTTP/1.1\r\nHost: localhost\r\nConnection: close\r\n\r\n")
        .unwrap();

    let (headers, body) = read_response(&mut stream);
    assert!(headers.starts_with("HTTP/1.1 404 Not Found\r\n"), "{headers}");
    assert_eq!(body, "<html>not found page</html>");
}

#[test]
fn test_keep_alive_serves_sequential_requests() {
    let root = doc_root();
    let addr = start_server(&test_config(root.path()));

    let mut stream = connect(addr);

    stream
        .write_all(b"GET /a.html HTTP/1.1\r\nHost: localhost\r\nConnection: keep-alive\r\n\r\n")
        .unwrap();
    let (headers, body) = read_response(&mut stream);
    assert!(headers.starts_with("HTTP/1.1 200 OK\r\n"), "{headers}");
    assert!(headers.contains("Connection: keep-alive"));
    assert_eq!(body, "<html>page a</html>");

    // Same socket, next request.
    stream
        .write_all(b"GET /b.html HTTP/1.1\r\nHost: localhost\r\nConnection: keep-alive\r\n\r\n")
        .unwrap();
    let (headers, body) = read_response(&mut stream);
    assert!(headers.starts_with("HTTP/1.1 200 OK\r\n"), "{headers}");
    assert_eq!(body, "<html>page b</html>");
}

#[test]
fn test_connection_close_is_honored() {
    let root = doc_root();
    let addr = start_server(&test_config(root.path()));

    let mut stream = connect(addr);
    stream
        .write_all(b"GET /a.html HTTP/1.1\r\nHost: localhost\r\nConnection: close\r\n\r\n")
        .unwrap();

    let (headers, _) = read_response(&mut stream);
    assert!(headers.contains("Connection: close"));
    assert!(read_eof(&mut stream), "server did not close the connection");
}

#[test]
fn test_idle_connection_times_out() {
    let root = doc_root();
    let mut cfg = test_config(root.path());
    cfg.timeout_ms = 300;
    let addr = start_server(&cfg);

    let mut stream = connect(addr);
    // Send nothing; the idle timer must close the socket.
    assert!(read_eof(&mut stream), "idle connection was not closed");
}

#[test]
fn test_activity_refreshes_idle_timer() {
    let root = doc_root();
    let mut cfg = test_config(root.path());
    cfg.timeout_ms = 600;
    let addr = start_server(&cfg);

    let mut stream = connect(addr);
    thread::sleep(Duration::from_millis(300));

    // Still inside the window; the request resets the deadline.
    stream
        .write_all(b"GET /a.html HTTP/1.1\r\nHost: localhost\r\nConnection: keep-alive\r\n\r\n")
        .unwrap();
    let (headers, _) = read_response(&mut stream);
    assert!(headers.starts_with("HTTP/1.1 200 OK\r\n"), "{headers}");

    // And the refreshed timer still fires once the connection goes idle.
    assert!(read_eof(&mut stream), "idle connection was not closed");
}

#[test]
fn test_login_without_db_serves_error_page() {
    let root = doc_root();
    let addr = start_server(&test_config(root.path()));

    let body = "username=alice&password=secret";
    let request = format!(
        "POST /login.html HTTP/1.1\r\nHost: localhost\r\nConnection: close\r\n\
         Content-Type: application/x-www-form-urlencoded\r\nContent-Length: {}\r\n\r\n{}",
        body.len(),
        body
    );

    let mut stream = connect(addr);
    stream.write_all(request.as_bytes()).unwrap();

    let (headers, body) = read_response(&mut stream);
    assert!(headers.starts_with("HTTP/1.1 200 OK\r\n"), "{headers}");
    assert_eq!(body, "<html>auth failed</html>");
}

#[test]
fn test_level_triggered_mode_serves_requests() {
    let root = doc_root();
    let mut cfg = test_config(root.path());
    cfg.trig_mode = 0;
    let addr = start_server(&cfg);

    let mut stream = connect(addr);
    stream
        .write_all(b"GET /a.html HTTP/1.1\r\nHost: localhost\r\nConnection: close\r\n\r\n")
        .unwrap();

    let (headers, body) = read_response(&mut stream);
    assert!(headers.starts_with("HTTP/1.1 200 OK\r\n"), "{headers}");
    assert_eq!(body, "<html>page a</html>");
}
