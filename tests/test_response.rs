use citadel::buffer::Buffer;
use citadel::http::mime::content_type;
use citadel::http::response::{Response, StatusCode};
use std::fs;
use std::path::Path;

use tempfile::TempDir;

fn doc_root() -> TempDir {
    let dir = tempfile::tempdir().unwrap();
    fs::write(dir.path().join("index.html"), "<html>welcome home</html>").unwrap();
    dir
}

fn make(root: &Path, path: &str, keep_alive: bool, code: Option<StatusCode>) -> (Response, Buffer) {
    let mut resp = Response::new();
    let mut buf = Buffer::new();
    resp.init(root, path, keep_alive, code);
    resp.make_response(&mut buf);
    (resp, buf)
}

fn header_text(buf: &mut Buffer) -> String {
    buf.retrieve_all_to_string()
}

#[test]
fn test_status_code_tables() {
    assert_eq!(StatusCode::Ok.as_u16(), 200);
    assert_eq!(StatusCode::BadRequest.as_u16(), 400);
    assert_eq!(StatusCode::Forbidden.as_u16(), 403);
    assert_eq!(StatusCode::NotFound.as_u16(), 404);

    assert_eq!(StatusCode::Ok.reason_phrase(), "OK");
    assert_eq!(StatusCode::BadRequest.reason_phrase(), "Bad Request");
    assert_eq!(StatusCode::Forbidden.reason_phrase(), "Forbidden");
    assert_eq!(StatusCode::NotFound.reason_phrase(), "Not Found");

    assert_eq!(StatusCode::Ok.error_page(), None);
    assert_eq!(StatusCode::BadRequest.error_page(), Some("/400.html"));
    assert_eq!(StatusCode::Forbidden.error_page(), Some("/403.html"));
    assert_eq!(StatusCode::NotFound.error_page(), Some("/404.html"));
}

#[test]
fn test_existing_file_served_with_200() {
    let root = doc_root();
    let (resp, mut buf) = make(root.path(), "/index.html", false, Some(StatusCode::Ok));

    let headers = header_text(&mut buf);
    assert!(headers.starts_with("HTTP/1.1 200 OK\r\n"), "{headers}");
    assert!(headers.contains("Connection: close\r\n"));
    assert!(headers.contains("Content-type: text/html\r\n"));
    assert!(headers.contains("Content-length: 25\r\n\r\n"));

    assert_eq!(resp.code(), Some(StatusCode::Ok));
    assert_eq!(resp.file().unwrap(), b"<html>welcome home</html>");
    assert_eq!(resp.file_len(), 25);
}

#[test]
fn test_keep_alive_headers_emitted() {
    let root = doc_root();
    let (_, mut buf) = make(root.path(), "/index.html", true, Some(StatusCode::Ok));

    let headers = header_text(&mut buf);
    assert!(headers.contains("Connection: keep-alive\r\n"));
    assert!(headers.contains("keep-alive: max=6, timeout=120\r\n"));
}

#[test]
fn test_missing_file_serves_404_page() {
    let root = doc_root();
    fs::write(root.path().join("404.html"), "<html>gone</html>").unwrap();
    let (resp, mut buf) = make(root.path(), "/nosuchfile", false, Some(StatusCode::Ok));

    let headers = header_text(&mut buf);
    assert!(headers.starts_with("HTTP/1.1 404 Not Found\r\n"), "{headers}");
    assert_eq!(resp.code(), Some(StatusCode::NotFound));
    assert_eq!(resp.file().unwrap(), b"<html>gone</html>");
}

#[test]
fn test_missing_error_page_synthesizes_body() {
    let root = doc_root();
    let (resp, mut buf) = make(root.path(), "/nosuchfile", false, Some(StatusCode::Ok));

    let out = header_text(&mut buf);
    assert!(out.starts_with("HTTP/1.1 404 Not Found\r\n"), "{out}");
    assert!(out.contains("404 : Not Found"));
    assert!(out.contains("<html><title>Error</title>"));
    assert!(resp.file().is_none());

    // Content-length must match the synthesized body.
    let body = out.split("\r\n\r\n").nth(1).unwrap();
    assert!(out.contains(&format!("Content-length: {}\r\n", body.len())));
}

#[test]
fn test_directory_target_is_404() {
    let root = doc_root();
    fs::create_dir(root.path().join("assets")).unwrap();
    let (resp, _) = make(root.path(), "/assets", false, Some(StatusCode::Ok));

    assert_eq!(resp.code(), Some(StatusCode::NotFound));
}

#[test]
fn test_world_unreadable_file_is_403() {
    use std::os::unix::fs::PermissionsExt;

    let root = doc_root();
    let secret = root.path().join("secret.html");
    fs::write(&secret, "<html>private</html>").unwrap();
    fs::set_permissions(&secret, fs::Permissions::from_mode(0o640)).unwrap();

    let (resp, mut buf) = make(root.path(), "/secret.html", false, Some(StatusCode::Ok));

    let out = header_text(&mut buf);
    assert!(out.starts_with("HTTP/1.1 403 Forbidden\r\n"), "{out}");
    assert_eq!(resp.code(), Some(StatusCode::Forbidden));
}

#[test]
fn test_path_traversal_is_rejected() {
    let root = doc_root();
    let (resp, _) = make(root.path(), "/../../etc/passwd", false, Some(StatusCode::Ok));

    assert_eq!(resp.code(), Some(StatusCode::Forbidden));
}

#[test]
fn test_bad_request_with_unresolvable_path_maps_to_404() {
    // A parse failure arrives with 400 and no usable path; the stat check
    // turns that into the 404 flow.
    let root = doc_root();
    let (resp, mut buf) = make(root.path(), "", false, Some(StatusCode::BadRequest));

    let out = header_text(&mut buf);
    assert!(out.starts_with("HTTP/1.1 404 Not Found\r\n"), "{out}");
    assert_eq!(resp.code(), Some(StatusCode::NotFound));
}

#[test]
fn test_unmap_file_is_idempotent() {
    let root = doc_root();
    let (mut resp, _) = make(root.path(), "/index.html", false, Some(StatusCode::Ok));

    assert!(resp.file().is_some());
    resp.unmap_file();
    assert!(resp.file().is_none());
    assert_eq!(resp.file_len(), 0);
    resp.unmap_file();
    assert!(resp.file().is_none());
}

#[test]
fn test_reinit_releases_previous_mapping() {
    let root = doc_root();
    let (mut resp, _) = make(root.path(), "/index.html", false, Some(StatusCode::Ok));
    assert!(resp.file().is_some());

    resp.init(root.path(), "/index.html", false, None);
    assert!(resp.file().is_none());
}

#[test]
fn test_unset_code_defaults_to_200() {
    let root = doc_root();
    let (resp, mut buf) = make(root.path(), "/index.html", false, None);

    let headers = header_text(&mut buf);
    assert!(headers.starts_with("HTTP/1.1 200 OK\r\n"), "{headers}");
    assert_eq!(resp.code(), Some(StatusCode::Ok));
}

#[test]
fn test_content_type_table() {
    assert_eq!(content_type("/index.html"), "text/html");
    assert_eq!(content_type("/feed.xml"), "text/xml");
    assert_eq!(content_type("/page.xhtml"), "application/xhtml+xml");
    assert_eq!(content_type("/notes.txt"), "text/plain");
    assert_eq!(content_type("/doc.rtf"), "application/rtf");
    assert_eq!(content_type("/paper.pdf"), "application/pdf");
    assert_eq!(content_type("/old.word"), "application/nsword");
    assert_eq!(content_type("/pic.png"), "image/png");
    assert_eq!(content_type("/anim.gif"), "image/gif");
    assert_eq!(content_type("/photo.jpg"), "image/jpeg");
    assert_eq!(content_type("/photo.jpeg"), "image/jpeg");
    assert_eq!(content_type("/sound.au"), "audio/basic");
    assert_eq!(content_type("/clip.mpeg"), "video/mpeg");
    assert_eq!(content_type("/clip.mpg"), "video/mpeg");
    assert_eq!(content_type("/clip.avi"), "video/x-msvideo");
    assert_eq!(content_type("/bundle.gz"), "application/x-gzip");
    assert_eq!(content_type("/archive.tar"), "application/x-tar");
    assert_eq!(content_type("/style.css"), "text/css");
    assert_eq!(content_type("/app.js"), "text/javascript");
}

#[test]
fn test_content_type_defaults_to_text_plain() {
    assert_eq!(content_type("/README"), "text/plain");
    assert_eq!(content_type("/data.unknown"), "text/plain");
}
