use std::io;

use bytes::Bytes;
use tokio::sync::mpsc;

use crate::http::file::AsyncFileResponse;
use crate::http::headers::HeaderMap;

/// HTTP status codes produced by the server.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StatusCode {
    /// 101 Switching Protocols
    SwitchingProtocols,
    /// 200 OK
    Ok,
    /// 206 Partial Content
    PartialContent,
    /// 301 Moved Permanently
    MovedPermanently,
    /// 307 Temporary Redirect
    TemporaryRedirect,
    /// 400 Bad Request
    BadRequest,
    /// 401 Unauthorized
    Unauthorized,
    /// 404 Not Found
    NotFound,
    /// 405 Method Not Allowed
    MethodNotAllowed,
    /// 416 Range Not Satisfiable
    RangeNotSatisfiable,
    /// 500 Internal Server Error
    InternalServerError,
    /// 505 HTTP Version Not Supported
    VersionNotSupported,
}

impl StatusCode {
    /// Returns the numeric HTTP status code.
    ///
    /// # Example
    ///
    /// ```
    /// # use beacon::http::response::StatusCode;
    /// assert_eq!(StatusCode::Ok.as_u16(), 200);
    /// assert_eq!(StatusCode::RangeNotSatisfiable.as_u16(), 416);
    /// ```
    pub fn as_u16(&self) -> u16 {
        match self {
            StatusCode::SwitchingProtocols => 101,
            StatusCode::Ok => 200,
            StatusCode::PartialContent => 206,
            StatusCode::MovedPermanently => 301,
            StatusCode::TemporaryRedirect => 307,
            StatusCode::BadRequest => 400,
            StatusCode::Unauthorized => 401,
            StatusCode::NotFound => 404,
            StatusCode::MethodNotAllowed => 405,
            StatusCode::RangeNotSatisfiable => 416,
            StatusCode::InternalServerError => 500,
            StatusCode::VersionNotSupported => 505,
        }
    }

    /// Returns the standard HTTP reason phrase for this status code.
    ///
    /// # Example
    ///
    /// ```
    /// # use beacon::http::response::StatusCode;
    /// assert_eq!(StatusCode::Ok.reason_phrase(), "OK");
    /// assert_eq!(StatusCode::NotFound.reason_phrase(), "Not Found");
    /// ```
    pub fn reason_phrase(&self) -> &'static str {
        match self {
            StatusCode::SwitchingProtocols => "Switching Protocols",
            StatusCode::Ok => "OK",
            StatusCode::PartialContent => "Partial Content",
            StatusCode::MovedPermanently => "Moved Permanently",
            StatusCode::TemporaryRedirect => "Temporary Redirect",
            StatusCode::BadRequest => "Bad Request",
            StatusCode::Unauthorized => "Unauthorized",
            StatusCode::NotFound => "Not Found",
            StatusCode::MethodNotAllowed => "Method Not Allowed",
            StatusCode::RangeNotSatisfiable => "Requested Range Not Satisfiable",
            StatusCode::InternalServerError => "Internal Server Error",
            StatusCode::VersionNotSupported => "HTTP Version Not Supported",
        }
    }
}

/// A response object handed to a connection by the host.
///
/// The connection never needs to know which kind it is dealing with beyond
/// the capability flags: [`content_length`](HttpResponse::content_length),
/// [`supports_ranges`](HttpResponse::supports_ranges),
/// [`is_async`](HttpResponse::is_async) and
/// [`is_chunked`](HttpResponse::is_chunked).
#[derive(Debug)]
pub enum HttpResponse {
    /// Bytes already in memory.
    Data(DataResponse),
    /// A file streamed through the background reader.
    File(AsyncFileResponse),
    /// Generated data of unknown length.
    Chunked(ChunkedResponse),
    /// A redirect with no body.
    Redirect(RedirectResponse),
}

impl HttpResponse {
    /// Shorthand for an in-memory `200 OK` response.
    pub fn data(body: impl Into<Bytes>) -> Self {
        HttpResponse::Data(DataResponse::new(body))
    }

    pub fn status(&self) -> StatusCode {
        match self {
            HttpResponse::Data(d) => d.status,
            HttpResponse::File(_) | HttpResponse::Chunked(_) => StatusCode::Ok,
            HttpResponse::Redirect(r) => r.status(),
        }
    }

    /// Total length if known up front.
    pub fn content_length(&self) -> Option<u64> {
        match self {
            HttpResponse::Data(d) => Some(d.data.len() as u64),
            HttpResponse::File(f) => Some(f.file_length()),
            HttpResponse::Chunked(_) => None,
            HttpResponse::Redirect(_) => Some(0),
        }
    }

    pub fn supports_ranges(&self) -> bool {
        match self {
            HttpResponse::Data(d) => d.status == StatusCode::Ok,
            HttpResponse::File(_) => true,
            HttpResponse::Chunked(_) | HttpResponse::Redirect(_) => false,
        }
    }

    /// Data arrives from a background task rather than being at hand.
    pub fn is_async(&self) -> bool {
        matches!(self, HttpResponse::File(_) | HttpResponse::Chunked(_))
    }

    pub fn is_chunked(&self) -> bool {
        matches!(self, HttpResponse::Chunked(_))
    }

    pub fn content_type(&self) -> Option<&str> {
        match self {
            HttpResponse::Data(d) => d.content_type.as_deref(),
            HttpResponse::File(f) => f.content_type(),
            HttpResponse::Chunked(c) => c.content_type.as_deref(),
            HttpResponse::Redirect(_) => None,
        }
    }

    /// Headers the response wants on top of the ones the connection writes.
    pub fn headers(&self) -> HeaderMap {
        match self {
            HttpResponse::Data(d) => d.headers.clone(),
            HttpResponse::Redirect(r) => {
                let mut h = HeaderMap::new();
                h.set("Location", r.location.clone());
                h
            }
            HttpResponse::File(_) | HttpResponse::Chunked(_) => HeaderMap::new(),
        }
    }

    /// Positions the next read at `offset` from the start of the resource.
    pub async fn set_offset(&mut self, offset: u64) -> io::Result<()> {
        match self {
            HttpResponse::Data(d) => {
                d.offset = (offset as usize).min(d.data.len());
                Ok(())
            }
            HttpResponse::File(f) => f.set_offset(offset).await,
            HttpResponse::Chunked(_) | HttpResponse::Redirect(_) => Err(io::Error::new(
                io::ErrorKind::Unsupported,
                "response does not support seeking",
            )),
        }
    }

    /// Next bytes of the body, at most `len` of them. Empty once exhausted.
    pub async fn read_data(&mut self, len: usize) -> io::Result<Bytes> {
        match self {
            HttpResponse::Data(d) => Ok(d.read_data(len)),
            HttpResponse::File(f) => f.read_data(len).await,
            HttpResponse::Chunked(c) => Ok(c.read_data(len).await),
            HttpResponse::Redirect(_) => Ok(Bytes::new()),
        }
    }

    pub fn is_done(&self) -> bool {
        match self {
            HttpResponse::Data(d) => d.offset >= d.data.len(),
            HttpResponse::File(f) => f.is_done(),
            HttpResponse::Chunked(c) => c.is_done(),
            HttpResponse::Redirect(_) => true,
        }
    }

    /// Releases whatever the response holds. Safe to call more than once.
    pub fn abort(&mut self) {
        match self {
            HttpResponse::Data(d) => d.offset = d.data.len(),
            HttpResponse::File(f) => f.abort(),
            HttpResponse::Chunked(c) => c.abort(),
            HttpResponse::Redirect(_) => {}
        }
    }
}

/// Builder-style in-memory response.
///
/// # Example
///
/// ```
/// # use beacon::http::response::{DataResponse, StatusCode};
/// let response = DataResponse::new("{}")
///     .with_content_type("application/json")
///     .with_header("Cache-Control", "no-cache");
/// assert_eq!(response.status(), StatusCode::Ok);
/// ```
#[derive(Debug, Clone)]
pub struct DataResponse {
    data: Bytes,
    offset: usize,
    status: StatusCode,
    content_type: Option<String>,
    headers: HeaderMap,
}

impl DataResponse {
    pub fn new(data: impl Into<Bytes>) -> Self {
        Self {
            data: data.into(),
            offset: 0,
            status: StatusCode::Ok,
            content_type: None,
            headers: HeaderMap::new(),
        }
    }

    pub fn with_status(mut self, status: StatusCode) -> Self {
        self.status = status;
        self
    }

    pub fn with_content_type(mut self, content_type: impl Into<String>) -> Self {
        self.content_type = Some(content_type.into());
        self
    }

    pub fn with_header(mut self, key: impl Into<String>, value: impl Into<String>) -> Self {
        self.headers.set(key, value);
        self
    }

    pub fn status(&self) -> StatusCode {
        self.status
    }

    pub fn data(&self) -> &Bytes {
        &self.data
    }

    fn read_data(&mut self, len: usize) -> Bytes {
        let end = self.offset.saturating_add(len).min(self.data.len());
        let out = self.data.slice(self.offset..end);
        self.offset = end;
        out
    }
}

/// Body produced piecemeal by the host through a channel.
///
/// The host keeps the sender from [`ChunkedResponse::channel`]; dropping it
/// ends the body. The connection frames what it receives with
/// `Transfer-Encoding: chunked`.
#[derive(Debug)]
pub struct ChunkedResponse {
    rx: mpsc::Receiver<Bytes>,
    pending: Bytes,
    finished: bool,
    content_type: Option<String>,
}

impl ChunkedResponse {
    pub fn channel(capacity: usize) -> (mpsc::Sender<Bytes>, Self) {
        let (tx, rx) = mpsc::channel(capacity.max(1));
        let response = Self {
            rx,
            pending: Bytes::new(),
            finished: false,
            content_type: None,
        };
        (tx, response)
    }

    pub fn with_content_type(mut self, content_type: impl Into<String>) -> Self {
        self.content_type = Some(content_type.into());
        self
    }

    async fn read_data(&mut self, len: usize) -> Bytes {
        while self.pending.is_empty() && !self.finished {
            match self.rx.recv().await {
                Some(chunk) => self.pending = chunk,
                None => self.finished = true,
            }
        }
        let n = len.min(self.pending.len());
        self.pending.split_to(n)
    }

    fn is_done(&self) -> bool {
        self.finished && self.pending.is_empty()
    }

    fn abort(&mut self) {
        self.rx.close();
        self.pending = Bytes::new();
        self.finished = true;
    }
}

#[derive(Debug, Clone)]
pub struct RedirectResponse {
    location: String,
    permanent: bool,
}

impl RedirectResponse {
    /// `307 Temporary Redirect` to `location`.
    pub fn temporary(location: impl Into<String>) -> Self {
        Self {
            location: location.into(),
            permanent: false,
        }
    }

    /// `301 Moved Permanently` to `location`.
    pub fn permanent(location: impl Into<String>) -> Self {
        Self {
            location: location.into(),
            permanent: true,
        }
    }

    pub fn location(&self) -> &str {
        &self.location
    }

    pub fn status(&self) -> StatusCode {
        if self.permanent {
            StatusCode::MovedPermanently
        } else {
            StatusCode::TemporaryRedirect
        }
    }
}

/// Empty response for `status`, ready to be written.
pub fn error_response(status: StatusCode, version: &str) -> crate::http::message::Message {
    let mut msg = crate::http::message::Message::with_status(status, version);
    msg.set_header_field("Content-Length", "0");
    msg
}
