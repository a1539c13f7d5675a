//! HTTP response builder serving memory-mapped static files.
//!
//! The builder writes the status line and headers into the connection's
//! output buffer and maps the file body read-only; the mapping is owned by
//! the `Response` and must outlive the scatter/gather write that sends it.

use std::fs::{self, File};
use std::os::unix::fs::MetadataExt;
use std::os::unix::io::AsRawFd;
use std::path::{Path, PathBuf};

use tracing::warn;

use crate::buffer::Buffer;
use crate::syscalls;

/// Read-only private mapping of a served file.
pub struct MappedFile {
    ptr: *mut u8,
    len: usize,
}

impl MappedFile {
    fn map(file: &File, len: usize) -> std::io::Result<Self> {
        let ptr = syscalls::mmap_readonly(file.as_raw_fd(), len)?;
        Ok(Self { ptr, len })
    }

    pub fn as_slice(&self) -> &[u8] {
        unsafe { std::slice::from_raw_parts(self.ptr, self.len) }
    }

    pub fn len(&self) -> usize {
        self.len
    }

    pub fn is_empty(&self) -> bool {
        self.len == 0
    }
}

impl Drop for MappedFile {
    fn drop(&mut self) {
        syscalls::munmap(self.ptr, self.len);
    }
}

// The mapping is immutable bytes; moving it between worker threads is fine.
unsafe impl Send for MappedFile {}

fn status_text(code: i32) -> Option<&'static str> {
    match code {
        200 => Some("OK"),
        400 => Some("Bad Request"),
        403 => Some("Forbidden"),
        404 => Some("Not Found"),
        _ => None,
    }
}

fn error_page(code: i32) -> Option<&'static str> {
    match code {
        400 => Some("/400.html"),
        403 => Some("/403.html"),
        404 => Some("/404.html"),
        _ => None,
    }
}

fn mime_type(path: &str) -> &'static str {
    let suffix = match path.rfind('.') {
        Some(i) => &path[i..],
        None => return "text/plain",
    };
    match suffix {
        ".html" => "text/html",
        ".xml" => "text/xml",
        ".xhtml" => "application/xhtml+xml",
        ".txt" => "text/plain",
        ".rtf" => "application/rtf",
        ".pdf" => "application/pdf",
        ".word" => "application/msword",
        ".png" => "image/png",
        ".gif" => "image/gif",
        ".jpg" | ".jpeg" => "image/jpeg",
        ".au" => "audio/basic",
        ".mpeg" | ".mpg" => "video/mpeg",
        ".avi" => "video/x-msvideo",
        ".gz" => "application/x-gzip",
        ".tar" => "application/x-tar",
        ".css" => "text/css",
        ".js" => "application/x-javascript",
        _ => "text/plain",
    }
}

pub struct Response {
    code: i32,
    keep_alive: bool,
    src_dir: PathBuf,
    path: String,
    file: Option<MappedFile>,
    file_size: u64,
}

impl Response {
    pub fn new() -> Self {
        Self {
            code: -1,
            keep_alive: false,
            src_dir: PathBuf::new(),
            path: String::new(),
            file: None,
            file_size: 0,
        }
    }

    /// Prepare for a fresh response, releasing any previous file mapping.
    pub fn init(&mut self, src_dir: &Path, path: &str, keep_alive: bool, code: i32) {
        self.unmap_file();
        self.code = code;
        self.keep_alive = keep_alive;
        self.src_dir = src_dir.to_path_buf();
        self.path = path.to_string();
        self.file_size = 0;
    }

    pub fn code(&self) -> i32 {
        self.code
    }

    /// The mapped body, when the file could be opened and mapped.
    pub fn file(&self) -> Option<&MappedFile> {
        self.file.as_ref()
    }

    pub fn file_len(&self) -> usize {
        self.file.as_ref().map_or(0, MappedFile::len)
    }

    pub fn unmap_file(&mut self) {
        self.file = None;
    }

    /// Stat the resource, pick the status code, then write the status line
    /// and headers into `buf` and map the body.
    ///
    /// A response already initialised with an error code (e.g. 400 for an
    /// unparsable request) skips the stat classification: its path may be
    /// empty and must not be reinterpreted as a missing file.
    pub fn make_response(&mut self, buf: &mut Buffer) {
        if self.code == -1 || self.code == 200 {
            match fs::metadata(self.full_path()) {
                Err(_) => self.code = 404,
                Ok(meta) if meta.is_dir() => self.code = 404,
                // Readable-by-others cleared means the asset is off limits.
                Ok(meta) if meta.mode() & 0o004 == 0 => self.code = 403,
                Ok(meta) => {
                    self.file_size = meta.len();
                    if self.code == -1 {
                        self.code = 200;
                    }
                }
            }
        }

        self.swap_in_error_page();
        self.add_status_line(buf);
        self.add_headers(buf);
        self.add_content(buf);
    }

    fn full_path(&self) -> PathBuf {
        self.src_dir.join(self.path.trim_start_matches('/'))
    }

    /// Error codes are served from their dedicated page under the same root.
    fn swap_in_error_page(&mut self) {
        if let Some(page) = error_page(self.code) {
            self.path = page.to_string();
            self.file_size = fs::metadata(self.full_path()).map_or(0, |m| m.len());
        }
    }

    fn add_status_line(&mut self, buf: &mut Buffer) {
        let status = match status_text(self.code) {
            Some(s) => s,
            None => {
                self.code = 400;
                "Bad Request"
            }
        };
        buf.append_str(&format!("HTTP/1.1 {} {}\r\n", self.code, status));
    }

    fn add_headers(&self, buf: &mut Buffer) {
        if self.keep_alive {
            buf.append_str("Connection: keep-alive\r\n");
            buf.append_str("keep-alive: max=6, timeout=120\r\n");
        } else {
            buf.append_str("Connection: close\r\n");
        }
        buf.append_str(&format!("Content-type: {}\r\n", mime_type(&self.path)));
    }

    fn add_content(&mut self, buf: &mut Buffer) {
        let file = match File::open(self.full_path()) {
            Ok(f) => f,
            Err(err) => {
                warn!(path = %self.path, %err, "failed to open resource");
                self.error_content(buf, "File Not Found!");
                return;
            }
        };

        match MappedFile::map(&file, self.file_size as usize) {
            Ok(mapping) => {
                buf.append_str(&format!("Content-length: {}\r\n\r\n", self.file_size));
                self.file = Some(mapping);
            }
            Err(err) => {
                warn!(path = %self.path, %err, "failed to map resource");
                self.error_content(buf, "File Not Found!");
            }
        }
    }

    /// Inline HTML fallback when the file cannot be served.
    fn error_content(&self, buf: &mut Buffer, message: &str) {
        let status = status_text(self.code).unwrap_or("Bad Request");
        let body = format!(
            "<html><title>Error</title><body bgcolor=\"ffffff\">{} : {}<p>{}</p><hr><em>mazurka</em></body></html>",
            self.code, status, message
        );
        buf.append_str(&format!("Content-length: {}\r\n\r\n", body.len()));
        buf.append_str(&body);
    }
}

impl Default for Response {
    fn default() -> Self {
        Self::new()
    }
}

impl Drop for Response {
    fn drop(&mut self) {
        self.unmap_file();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write;
    use temp_dir::TempDir;

    fn write_page(dir: &TempDir, name: &str, contents: &str) {
        let mut f = File::create(dir.child(name)).unwrap();
        f.write_all(contents.as_bytes()).unwrap();
    }

    fn render(dir: &TempDir, path: &str, keep_alive: bool, code: i32) -> (Response, String) {
        let mut response = Response::new();
        response.init(dir.path(), path, keep_alive, code);
        let mut buf = Buffer::new();
        response.make_response(&mut buf);
        let head = buf.retrieve_all_to_string();
        (response, head)
    }

    #[test]
    fn serves_existing_file_with_mapping() {
        let dir = TempDir::new().unwrap();
        write_page(&dir, "index.html", "<html>hi</html>");

        let (response, head) = render(&dir, "/index.html", true, 200);
        assert!(head.starts_with("HTTP/1.1 200 OK\r\n"));
        assert!(head.contains("Connection: keep-alive\r\n"));
        assert!(head.contains("keep-alive: max=6, timeout=120\r\n"));
        assert!(head.contains("Content-type: text/html\r\n"));
        assert!(head.contains("Content-length: 15\r\n\r\n"));
        assert_eq!(response.file().unwrap().as_slice(), b"<html>hi</html>");
    }

    #[test]
    fn missing_file_becomes_404_page() {
        let dir = TempDir::new().unwrap();
        write_page(&dir, "404.html", "<html>gone</html>");

        let (response, head) = render(&dir, "/no-such.html", false, -1);
        assert!(head.starts_with("HTTP/1.1 404 Not Found\r\n"));
        assert!(head.contains("Connection: close\r\n"));
        assert_eq!(response.file().unwrap().as_slice(), b"<html>gone</html>");
    }

    #[test]
    fn unreadable_file_becomes_403() {
        use std::fs::Permissions;
        use std::os::unix::fs::PermissionsExt;

        let dir = TempDir::new().unwrap();
        write_page(&dir, "secret.html", "hidden");
        fs::set_permissions(dir.child("secret.html"), Permissions::from_mode(0o640)).unwrap();

        let (_response, head) = render(&dir, "/secret.html", false, -1);
        assert!(head.starts_with("HTTP/1.1 403 Forbidden\r\n"));
    }

    #[test]
    fn missing_error_page_falls_back_to_inline_body() {
        let dir = TempDir::new().unwrap();

        let (response, head) = render(&dir, "/no-such.html", false, -1);
        assert!(head.starts_with("HTTP/1.1 404 Not Found\r\n"));
        assert!(head.contains("<em>mazurka</em>"));
        assert!(response.file().is_none());

        // The advertised length matches the inline body exactly.
        let (header_part, body) = head.split_once("\r\n\r\n").unwrap();
        let advertised: usize = header_part
            .lines()
            .find_map(|l| l.strip_prefix("Content-length: "))
            .unwrap()
            .parse()
            .unwrap();
        assert_eq!(advertised, body.len());
    }

    #[test]
    fn bad_request_keeps_its_400_code() {
        let dir = TempDir::new().unwrap();
        write_page(&dir, "400.html", "<html>bad</html>");

        // An unparsable request initialises the response with 400 and an
        // empty path; the 400 page is served, not a 404.
        let (response, head) = render(&dir, "", false, 400);
        assert!(head.starts_with("HTTP/1.1 400 Bad Request\r\n"));
        assert_eq!(response.file().unwrap().as_slice(), b"<html>bad</html>");
    }

    #[test]
    fn unknown_status_code_is_coerced_to_400() {
        let dir = TempDir::new().unwrap();
        write_page(&dir, "x.html", "x");

        let (_response, head) = render(&dir, "/x.html", false, 999);
        assert!(head.starts_with("HTTP/1.1 400 Bad Request\r\n"), "{}", head);
    }

    #[test]
    fn mime_types_derive_from_suffix() {
        assert_eq!(mime_type("/a/b.html"), "text/html");
        assert_eq!(mime_type("/a/b.png"), "image/png");
        assert_eq!(mime_type("/a/b.mpg"), "video/mpeg");
        assert_eq!(mime_type("/a/b"), "text/plain");
        assert_eq!(mime_type("/a/b.weird"), "text/plain");
    }

    #[test]
    fn reinit_releases_previous_mapping() {
        let dir = TempDir::new().unwrap();
        write_page(&dir, "a.html", "aaaa");
        write_page(&dir, "b.html", "bb");

        let mut response = Response::new();
        let mut buf = Buffer::new();
        response.init(dir.path(), "/a.html", false, -1);
        response.make_response(&mut buf);
        assert_eq!(response.file_len(), 4);

        buf.clear();
        response.init(dir.path(), "/b.html", false, -1);
        response.make_response(&mut buf);
        assert_eq!(response.file_len(), 2);
    }
}
