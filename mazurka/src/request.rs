//! Line-oriented HTTP/1.1 request parser.
//!
//! Four states walked strictly forward: request line, headers, body, done.
//! The buffer is only consumed once a full request has been parsed, so an
//! incomplete read leaves everything in place for the next pass.

use std::collections::HashMap;

use tracing::debug;

use crate::buffer::Buffer;
use crate::sql::Credentials;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ParseState {
    RequestLine,
    Headers,
    Body,
    Done,
}

#[derive(Debug, PartialEq, Eq)]
pub enum ParseError {
    /// More bytes are needed before the request can be judged.
    Incomplete,
    /// The request line is unusable; answer 400 and close.
    BadRequest,
}

/// Bare paths that map onto their `.html` page.
const DEFAULT_HTML: [&str; 6] = [
    "/index",
    "/register",
    "/login",
    "/welcome",
    "/video",
    "/picture",
];

pub struct Request {
    state: ParseState,
    method: String,
    path: String,
    version: String,
    body: String,
    headers: HashMap<String, String>,
    form: HashMap<String, String>,
}

impl Request {
    pub fn new() -> Self {
        Self {
            state: ParseState::RequestLine,
            method: String::new(),
            path: String::new(),
            version: String::new(),
            body: String::new(),
            headers: HashMap::new(),
            form: HashMap::new(),
        }
    }

    /// Reset for the next request on the same connection.
    pub fn clear(&mut self) {
        self.state = ParseState::RequestLine;
        self.method.clear();
        self.path.clear();
        self.version.clear();
        self.body.clear();
        self.headers.clear();
        self.form.clear();
    }

    pub fn state(&self) -> ParseState {
        self.state
    }

    pub fn method(&self) -> &str {
        &self.method
    }

    pub fn path(&self) -> &str {
        &self.path
    }

    pub fn version(&self) -> &str {
        &self.version
    }

    pub fn header(&self, key: &str) -> Option<&str> {
        self.headers.get(key).map(String::as_str)
    }

    pub fn form_value(&self, key: &str) -> Option<&str> {
        self.form.get(key).map(String::as_str)
    }

    /// Keep-alive iff the header says so and the version is exactly 1.1.
    pub fn is_keep_alive(&self) -> bool {
        self.header("Connection") == Some("keep-alive") && self.version == "1.1"
    }

    /// Drive the state machine over the readable window of `buf`. The
    /// window is consumed only on success.
    pub fn parse(
        &mut self,
        buf: &mut Buffer,
        credentials: &dyn Credentials,
    ) -> Result<(), ParseError> {
        let data = buf.as_read_slice();
        let mut cursor = 0;

        while self.state != ParseState::Done {
            match self.state {
                ParseState::RequestLine => {
                    let line_end =
                        find_crlf(&data[cursor..]).ok_or(ParseError::Incomplete)?;
                    let line = as_utf8(&data[cursor..cursor + line_end])?;
                    self.parse_request_line(line)?;
                    cursor += line_end + 2;
                }
                ParseState::Headers => {
                    let line_end =
                        find_crlf(&data[cursor..]).ok_or(ParseError::Incomplete)?;
                    if line_end == 0 {
                        cursor += 2;
                        self.state = self.state_after_headers(data.len() - cursor)?;
                        continue;
                    }
                    let line = as_utf8(&data[cursor..cursor + line_end])?;
                    match line.find(':').filter(|&i| i > 0) {
                        Some(colon) => {
                            let value = line[colon + 1..]
                                .strip_prefix(' ')
                                .unwrap_or(&line[colon + 1..]);
                            self.headers
                                .insert(line[..colon].to_string(), value.to_string());
                            cursor += line_end + 2;
                        }
                        // A line that is not a header starts the body.
                        None => self.state = ParseState::Body,
                    }
                }
                ParseState::Body => {
                    let remaining = &data[cursor..];
                    match self.content_length()? {
                        Some(len) => {
                            if remaining.len() < len {
                                return Err(ParseError::Incomplete);
                            }
                            self.body = String::from_utf8_lossy(&remaining[..len]).into_owned();
                            cursor += len;
                        }
                        None => {
                            self.body = String::from_utf8_lossy(remaining).into_owned();
                            cursor = data.len();
                        }
                    }
                    self.parse_post(credentials);
                    self.state = ParseState::Done;
                }
                ParseState::Done => unreachable!(),
            }
        }

        buf.advance(cursor);
        debug!(method = %self.method, path = %self.path, "request parsed");
        Ok(())
    }

    fn parse_request_line(&mut self, line: &str) -> Result<(), ParseError> {
        let mut parts = line.split(' ');
        let (method, path, proto) = match (parts.next(), parts.next(), parts.next(), parts.next())
        {
            (Some(m), Some(p), Some(v), None) if !m.is_empty() && !p.is_empty() => (m, p, v),
            _ => return Err(ParseError::BadRequest),
        };
        let version = proto.strip_prefix("HTTP/").ok_or(ParseError::BadRequest)?;

        self.method = method.to_string();
        self.path = path.to_string();
        self.version = version.to_string();
        self.remap_path();
        self.state = ParseState::Headers;
        Ok(())
    }

    fn remap_path(&mut self) {
        if self.path == "/" {
            self.path = "/index.html".to_string();
        } else if DEFAULT_HTML.contains(&self.path.as_str()) {
            self.path.push_str(".html");
        }
    }

    fn state_after_headers(&self, remaining: usize) -> Result<ParseState, ParseError> {
        match self.content_length()? {
            Some(0) => Ok(ParseState::Done),
            Some(_) => Ok(ParseState::Body),
            None if remaining > 0 => Ok(ParseState::Body),
            None => Ok(ParseState::Done),
        }
    }

    fn content_length(&self) -> Result<Option<usize>, ParseError> {
        match self.header("Content-Length") {
            None => Ok(None),
            Some(raw) => raw
                .trim()
                .parse()
                .map(Some)
                .map_err(|_| ParseError::BadRequest),
        }
    }

    /// Urlencoded POST handling, including the login/register rewrite.
    fn parse_post(&mut self, credentials: &dyn Credentials) {
        if self.method != "POST"
            || self.header("Content-Type") != Some("application/x-www-form-urlencoded")
        {
            return;
        }
        self.parse_urlencoded();

        let is_login = match self.path.as_str() {
            "/login.html" => true,
            "/register.html" => false,
            _ => return,
        };
        let user = self.form_value("username").unwrap_or("");
        let password = self.form_value("password").unwrap_or("");
        if credentials.verify(user, password, is_login) {
            self.path = "/welcome.html".to_string();
        } else {
            self.path = "/error.html".to_string();
        }
    }

    /// Split the body on `&`, each pair on the first `=`. No percent
    /// decoding, matching what the login pages submit.
    fn parse_urlencoded(&mut self) {
        if self.body.is_empty() {
            return;
        }
        let body = std::mem::take(&mut self.body);
        for pair in body.split('&') {
            let (key, value) = pair.split_once('=').unwrap_or((pair, ""));
            self.form.insert(key.to_string(), value.to_string());
        }
        self.body = body;
    }
}

impl Default for Request {
    fn default() -> Self {
        Self::new()
    }
}

fn find_crlf(data: &[u8]) -> Option<usize> {
    data.windows(2).position(|w| w == b"\r\n")
}

fn as_utf8(data: &[u8]) -> Result<&str, ParseError> {
    std::str::from_utf8(data).map_err(|_| ParseError::BadRequest)
}

#[cfg(test)]
mod tests {
    use super::*;

    struct AllowAll;
    impl Credentials for AllowAll {
        fn verify(&self, _user: &str, _password: &str, _is_login: bool) -> bool {
            true
        }
    }

    struct DenyAll;
    impl Credentials for DenyAll {
        fn verify(&self, _user: &str, _password: &str, _is_login: bool) -> bool {
            false
        }
    }

    fn parse_ok(raw: &[u8]) -> Request {
        let mut buf = Buffer::new();
        buf.append(raw);
        let mut req = Request::new();
        req.parse(&mut buf, &AllowAll).unwrap();
        req
    }

    #[test]
    fn parses_get_request() {
        let req = parse_ok(b"GET /index.html HTTP/1.1\r\nHost: x\r\nConnection: keep-alive\r\n\r\n");
        assert_eq!(req.method(), "GET");
        assert_eq!(req.path(), "/index.html");
        assert_eq!(req.version(), "1.1");
        assert_eq!(req.header("Host"), Some("x"));
        assert_eq!(req.state(), ParseState::Done);
    }

    #[test]
    fn keep_alive_requires_header_and_version() {
        let req = parse_ok(b"GET / HTTP/1.1\r\nConnection: keep-alive\r\n\r\n");
        assert!(req.is_keep_alive());

        let req = parse_ok(b"GET / HTTP/1.0\r\nConnection: keep-alive\r\n\r\n");
        assert!(!req.is_keep_alive());

        let req = parse_ok(b"GET / HTTP/1.1\r\nConnection: close\r\n\r\n");
        assert!(!req.is_keep_alive());

        let req = parse_ok(b"GET / HTTP/1.1\r\n\r\n");
        assert!(!req.is_keep_alive());
    }

    #[test]
    fn path_rewriting() {
        assert_eq!(parse_ok(b"GET / HTTP/1.1\r\n\r\n").path(), "/index.html");
        assert_eq!(parse_ok(b"GET /login HTTP/1.1\r\n\r\n").path(), "/login.html");
        assert_eq!(parse_ok(b"GET /video HTTP/1.1\r\n\r\n").path(), "/video.html");
        assert_eq!(parse_ok(b"GET /foo HTTP/1.1\r\n\r\n").path(), "/foo");
    }

    #[test]
    fn bogus_request_line_is_rejected() {
        let mut buf = Buffer::new();
        buf.append(b"BOGUS\r\n\r\n");
        let mut req = Request::new();
        assert_eq!(req.parse(&mut buf, &AllowAll), Err(ParseError::BadRequest));
    }

    #[test]
    fn partial_request_is_incomplete_and_unconsumed() {
        let mut buf = Buffer::new();
        buf.append(b"GET /index.html HTTP/1.1\r\nHost: x");
        let mut req = Request::new();
        assert_eq!(req.parse(&mut buf, &AllowAll), Err(ParseError::Incomplete));
        assert_eq!(buf.readable(), 33);

        // The rest arrives; a fresh pass succeeds.
        buf.append(b"\r\n\r\n");
        req.clear();
        req.parse(&mut buf, &AllowAll).unwrap();
        assert_eq!(buf.readable(), 0);
    }

    #[test]
    fn short_post_body_waits_for_content_length() {
        let mut buf = Buffer::new();
        buf.append(b"POST /login.html HTTP/1.1\r\nContent-Length: 20\r\n\r\nusername=a");
        let mut req = Request::new();
        assert_eq!(req.parse(&mut buf, &AllowAll), Err(ParseError::Incomplete));
    }

    #[test]
    fn post_login_success_rewrites_to_welcome() {
        let req = parse_ok(
            b"POST /login.html HTTP/1.1\r\nContent-Type: application/x-www-form-urlencoded\r\n\
              Content-Length: 28\r\n\r\nusername=alice&password=pw12",
        );
        assert_eq!(req.path(), "/welcome.html");
        assert_eq!(req.form_value("username"), Some("alice"));
        assert_eq!(req.form_value("password"), Some("pw12"));
    }

    #[test]
    fn post_login_failure_rewrites_to_error() {
        let mut buf = Buffer::new();
        buf.append(
            b"POST /register.html HTTP/1.1\r\nContent-Type: application/x-www-form-urlencoded\r\n\
              Content-Length: 28\r\n\r\nusername=alice&password=pw12",
        );
        let mut req = Request::new();
        req.parse(&mut buf, &DenyAll).unwrap();
        assert_eq!(req.path(), "/error.html");
    }

    #[test]
    fn post_to_other_path_is_untouched() {
        let req = parse_ok(
            b"POST /submit HTTP/1.1\r\nContent-Type: application/x-www-form-urlencoded\r\n\
              Content-Length: 3\r\n\r\na=b",
        );
        assert_eq!(req.path(), "/submit");
        assert_eq!(req.form_value("a"), Some("b"));
    }
}
