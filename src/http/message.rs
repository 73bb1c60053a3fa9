//! Incremental HTTP message.
//!
//! A [`Message`] is either a request being read off a socket or a response
//! being assembled for one. Requests are grown with [`Message::append_data`]
//! as bytes arrive; once the blank line ending the header block has been seen
//! the header content no longer changes.

use std::collections::HashMap;

use percent_encoding::percent_decode_str;

use crate::http::headers::HeaderMap;
use crate::http::parser::{
    parse_header_line, parse_request_line, parse_status_line, ParseError, ParseLimits,
};
use crate::http::request::{Method, HTTP_1_0, HTTP_1_1};
use crate::http::response::StatusCode;

#[derive(Debug, Clone)]
enum StartLine {
    Request {
        method: Method,
        url: String,
        version: String,
    },
    Response {
        code: u16,
        reason: String,
        version: String,
    },
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Mode {
    Request,
    Response,
}

#[derive(Debug, Clone)]
pub struct Message {
    mode: Mode,
    start: Option<StartLine>,
    headers: HeaderMap,
    body: Vec<u8>,
    header_complete: bool,
    line_buf: Vec<u8>,
    lines_seen: usize,
    limits: ParseLimits,
}

impl Message {
    /// An empty request to be filled by [`Message::append_data`].
    pub fn empty_request() -> Self {
        Self::empty(Mode::Request, ParseLimits::default())
    }

    pub fn empty_request_with_limits(limits: ParseLimits) -> Self {
        Self::empty(Mode::Request, limits)
    }

    /// An empty response to be filled by [`Message::append_data`], used when
    /// reading what a server sent.
    pub fn empty_response() -> Self {
        Self::empty(Mode::Response, ParseLimits::default())
    }

    pub fn request(method: Method, url: impl Into<String>, version: impl Into<String>) -> Self {
        let mut msg = Self::empty(Mode::Request, ParseLimits::default());
        msg.start = Some(StartLine::Request {
            method,
            url: url.into(),
            version: version.into(),
        });
        msg.header_complete = true;
        msg
    }

    pub fn response(
        code: u16,
        description: impl Into<String>,
        version: impl Into<String>,
    ) -> Self {
        let mut msg = Self::empty(Mode::Response, ParseLimits::default());
        msg.start = Some(StartLine::Response {
            code,
            reason: description.into(),
            version: version.into(),
        });
        msg.header_complete = true;
        msg
    }

    /// Response with the standard reason phrase of `status`.
    pub fn with_status(status: StatusCode, version: impl Into<String>) -> Self {
        Self::response(status.as_u16(), status.reason_phrase(), version)
    }

    fn empty(mode: Mode, limits: ParseLimits) -> Self {
        Self {
            mode,
            start: None,
            headers: HeaderMap::new(),
            body: Vec::new(),
            header_complete: false,
            line_buf: Vec::new(),
            lines_seen: 0,
            limits,
        }
    }

    /// Feeds raw bytes into the header parser.
    ///
    /// Returns how many bytes of `data` were consumed. Consumption stops right
    /// after the header terminator, so whatever follows (body, or the next
    /// pipelined request) stays with the caller. After the headers are
    /// complete this always returns `Ok(0)`.
    pub fn append_data(&mut self, data: &[u8]) -> Result<usize, ParseError> {
        let mut consumed = 0;

        while !self.header_complete && consumed < data.len() {
            let rest = &data[consumed..];

            match rest.iter().position(|&b| b == b'\n') {
                Some(i) => {
                    self.line_buf.extend_from_slice(&rest[..=i]);
                    consumed += i + 1;
                    let line = std::mem::take(&mut self.line_buf);
                    self.process_line(&line)?;
                }
                None => {
                    self.line_buf.extend_from_slice(rest);
                    consumed = data.len();
                    // +1 leaves room for a '\r' still to come.
                    if self.line_buf.len() > self.limits.max_line_length + 1 {
                        return Err(ParseError::LineTooLong);
                    }
                }
            }
        }

        Ok(consumed)
    }

    fn process_line(&mut self, raw: &[u8]) -> Result<(), ParseError> {
        let raw = raw.strip_suffix(b"\n").unwrap_or(raw);
        let raw = raw.strip_suffix(b"\r").unwrap_or(raw);

        if raw.len() > self.limits.max_line_length {
            return Err(ParseError::LineTooLong);
        }

        let line = std::str::from_utf8(raw).map_err(|_| ParseError::InvalidHeader)?;

        if self.start.is_none() {
            if line.is_empty() {
                // Stray CRLF between pipelined requests.
                return Ok(());
            }
            self.count_line()?;
            self.start = Some(match self.mode {
                Mode::Request => {
                    let (method, url, version) = parse_request_line(line)?;
                    StartLine::Request {
                        method,
                        url,
                        version,
                    }
                }
                Mode::Response => {
                    let (version, code, reason) = parse_status_line(line)?;
                    StartLine::Response {
                        code,
                        reason,
                        version,
                    }
                }
            });
            return Ok(());
        }

        if line.is_empty() {
            self.header_complete = true;
            return Ok(());
        }

        self.count_line()?;
        let (key, value) = parse_header_line(line)?;
        self.headers.set(key, value);
        Ok(())
    }

    fn count_line(&mut self) -> Result<(), ParseError> {
        self.lines_seen += 1;
        if self.lines_seen > self.limits.max_header_lines {
            return Err(ParseError::TooManyHeaders);
        }
        Ok(())
    }

    pub fn is_header_complete(&self) -> bool {
        self.header_complete
    }

    /// True once the request or status line has been parsed.
    pub fn has_start_line(&self) -> bool {
        self.start.is_some()
    }

    pub fn is_request(&self) -> bool {
        self.mode == Mode::Request
    }

    pub fn method(&self) -> Option<&Method> {
        match &self.start {
            Some(StartLine::Request { method, .. }) => Some(method),
            _ => None,
        }
    }

    /// The request target exactly as sent.
    pub fn url(&self) -> Option<&str> {
        match &self.start {
            Some(StartLine::Request { url, .. }) => Some(url),
            _ => None,
        }
    }

    pub fn version(&self) -> Option<&str> {
        match &self.start {
            Some(StartLine::Request { version, .. }) | Some(StartLine::Response { version, .. }) => {
                Some(version)
            }
            None => None,
        }
    }

    pub fn status_code(&self) -> Option<u16> {
        match &self.start {
            Some(StartLine::Response { code, .. }) => Some(*code),
            _ => None,
        }
    }

    pub fn reason_phrase(&self) -> Option<&str> {
        match &self.start {
            Some(StartLine::Response { reason, .. }) => Some(reason),
            _ => None,
        }
    }

    pub fn all_header_fields(&self) -> &HeaderMap {
        &self.headers
    }

    pub fn header_field(&self, name: &str) -> Option<&str> {
        self.headers.get(name)
    }

    pub fn set_header_field(&mut self, name: impl Into<String>, value: impl Into<String>) {
        self.headers.set(name, value);
    }

    pub fn remove_header_field(&mut self, name: &str) -> Option<String> {
        self.headers.remove(name)
    }

    pub fn body(&self) -> &[u8] {
        &self.body
    }

    /// Replaces the body. Headers are left alone; keeping `Content-Length`
    /// consistent is up to the caller.
    pub fn set_body(&mut self, body: impl Into<Vec<u8>>) {
        self.body = body.into();
    }

    pub fn append_body(&mut self, chunk: &[u8]) {
        self.body.extend_from_slice(chunk);
    }

    /// The declared `Content-Length`, if any.
    pub fn content_length(&self) -> Result<Option<u64>, ParseError> {
        match self.header_field("Content-Length") {
            None => Ok(None),
            Some(v) if !v.is_empty() && v.bytes().all(|b| b.is_ascii_digit()) => v
                .parse::<u64>()
                .map(Some)
                .map_err(|_| ParseError::InvalidContentLength),
            Some(_) => Err(ParseError::InvalidContentLength),
        }
    }

    /// Percent-decoded path of the request target, without the query.
    pub fn path(&self) -> Option<String> {
        let url = self.url()?;
        let url = match url.find("://") {
            // Absolute form: drop scheme and authority.
            Some(i) => {
                let after = &url[i + 3..];
                after.find('/').map_or("/", |p| &after[p..])
            }
            None => url,
        };
        let raw = url.split(['?', '#']).next().unwrap_or("");
        Some(percent_decode_str(raw).decode_utf8_lossy().into_owned())
    }

    /// Query string parameters of the request target.
    ///
    /// `/search.html?q=John%20Mayer%20Trio&num=50` yields
    /// `{ q: "John Mayer Trio", num: "50" }`.
    pub fn query_params(&self) -> HashMap<String, String> {
        self.url()
            .and_then(|u| u.split_once('?'))
            .map(|(_, q)| q.split('#').next().unwrap_or(""))
            .map(|q| url::form_urlencoded::parse(q.as_bytes()).into_owned().collect())
            .unwrap_or_default()
    }

    /// Whether the connection may carry another request after this one.
    ///
    /// HTTP/1.1 defaults to keep-alive unless `Connection: close` is sent;
    /// HTTP/1.0 only keeps alive on an explicit `Connection: keep-alive`.
    pub fn keep_alive(&self) -> bool {
        if self.headers.has_token("Connection", "close") {
            return false;
        }
        match self.version() {
            Some(HTTP_1_1) => true,
            Some(HTTP_1_0) => self.headers.has_token("Connection", "keep-alive"),
            _ => false,
        }
    }

    /// Serializes the start line, headers, blank line and body.
    pub fn message_data(&self) -> Vec<u8> {
        let mut buf = self.header_data();
        buf.extend_from_slice(&self.body);
        buf
    }

    /// Like [`Message::message_data`] without the body.
    pub fn header_data(&self) -> Vec<u8> {
        let mut buf = Vec::with_capacity(256);

        match &self.start {
            Some(StartLine::Request {
                method,
                url,
                version,
            }) => {
                buf.extend_from_slice(format!("{} {} {}\r\n", method, url, version).as_bytes());
            }
            Some(StartLine::Response {
                code,
                reason,
                version,
            }) => {
                buf.extend_from_slice(format!("{} {} {}\r\n", version, code, reason).as_bytes());
            }
            None => {}
        }

        for (k, v) in self.headers.iter() {
            buf.extend_from_slice(k.as_bytes());
            buf.extend_from_slice(b": ");
            buf.extend_from_slice(v.as_bytes());
            buf.extend_from_slice(b"\r\n");
        }

        buf.extend_from_slice(b"\r\n");
        buf
    }
}
