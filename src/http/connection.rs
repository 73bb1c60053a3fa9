use std::sync::Arc;

use anyhow::Context;

use bytes::{Buf, BytesMut};
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt};
use tokio::sync::watch;
use tracing::{debug, info, warn};

use crate::host::Host;
use crate::http::auth::{self, AuthError};
use crate::http::message::Message;
use crate::http::parser::ParseError;
use crate::http::range::{ByteRange, RequestRangeSet};
use crate::http::request::{HTTP_1_0, HTTP_1_1, Method};
use crate::http::response::{HttpResponse, StatusCode, error_response};
use crate::http::websocket::{self, HandshakeVariant, LEGACY_TOKEN_LEN, WebSocket, WebSocketHandler};
use crate::http::writer::ResponseWriter;
use crate::server::{ServerContext, ServerEvent};

const READ_CHUNK: usize = 4096;
// Fresh nonces one connection may obtain; later challenges repeat the last.
const MAX_NONCES_PER_CONNECTION: u32 = 16;

/// One client connection, from the first request byte to the socket close.
///
/// Generic over the stream so TLS or in-memory transports plug in as well as
/// plain TCP.
pub struct Connection<S> {
    id: u64,
    stream: S,
    buffer: BytesMut,
    state: ConnectionState,
    ctx: Arc<ServerContext>,
    stop: watch::Receiver<bool>,
    request: Message,
    buffer_body: bool,
    nonces_issued: u32,
    last_nonce: Option<String>,
    consecutive_errors: u32,
    force_close: bool,
    requests_handled: u64,
    dead: bool,
}

pub enum ConnectionState {
    AwaitingRequestLine,
    AwaitingHeaders,
    AwaitingBody { remaining: u64 },
    ResolvingResponse,
    SendingHeaders(Outgoing),
    SendingBody(Outgoing),
    Upgrading(Message, Box<dyn WebSocketHandler>),
    Done,
    Aborted,
    Closed,
}

impl ConnectionState {
    pub fn name(&self) -> &'static str {
        match self {
            ConnectionState::AwaitingRequestLine => "awaiting-request-line",
            ConnectionState::AwaitingHeaders => "awaiting-headers",
            ConnectionState::AwaitingBody { .. } => "awaiting-body",
            ConnectionState::ResolvingResponse => "resolving-response",
            ConnectionState::SendingHeaders(_) => "sending-headers",
            ConnectionState::SendingBody(_) => "sending-body",
            ConnectionState::Upgrading(..) => "upgrading",
            ConnectionState::Done => "done",
            ConnectionState::Aborted => "aborted",
            ConnectionState::Closed => "closed",
        }
    }
}

/// A response on its way out: the head plus whatever produces the body.
pub struct Outgoing {
    head: Message,
    body: Body,
    head_only: bool,
}

enum Body {
    Empty,
    Full {
        response: HttpResponse,
        length: u64,
    },
    Single {
        response: HttpResponse,
        range: ByteRange,
    },
    Multipart {
        response: HttpResponse,
        ranges: RequestRangeSet,
        content_type: String,
    },
    Chunked {
        response: HttpResponse,
    },
    // HTTP/1.0 with no length: raw bytes, then close.
    UntilClose {
        response: HttpResponse,
    },
}

impl Outgoing {
    fn empty(head: Message, head_only: bool) -> Self {
        Self {
            head,
            body: Body::Empty,
            head_only,
        }
    }

    fn response_mut(&mut self) -> Option<&mut HttpResponse> {
        match &mut self.body {
            Body::Empty => None,
            Body::Full { response, .. }
            | Body::Single { response, .. }
            | Body::Multipart { response, .. }
            | Body::Chunked { response }
            | Body::UntilClose { response } => Some(response),
        }
    }
}

impl<S> Connection<S>
where
    S: AsyncRead + AsyncWrite + Unpin + Send,
{
    pub fn new(id: u64, stream: S, ctx: Arc<ServerContext>, stop: watch::Receiver<bool>) -> Self {
        Self {
            id,
            stream,
            buffer: BytesMut::with_capacity(READ_CHUNK),
            state: ConnectionState::AwaitingRequestLine,
            ctx,
            stop,
            request: Message::empty_request(),
            buffer_body: false,
            nonces_issued: 0,
            last_nonce: None,
            consecutive_errors: 0,
            force_close: false,
            requests_handled: 0,
            dead: false,
        }
    }

    pub fn id(&self) -> u64 {
        self.id
    }

    pub fn state(&self) -> &ConnectionState {
        &self.state
    }

    pub fn requests_handled(&self) -> u64 {
        self.requests_handled
    }

    pub async fn run(&mut self) -> anyhow::Result<()> {
        loop {
            if self.stop_requested() {
                self.abort_state();
            }

            let state = std::mem::replace(&mut self.state, ConnectionState::Closed);
            self.state = match state {
                ConnectionState::AwaitingRequestLine => self.await_request_line().await?,

                ConnectionState::AwaitingHeaders => self.await_headers().await?,

                ConnectionState::AwaitingBody { remaining } => self.await_body(remaining).await?,

                ConnectionState::ResolvingResponse => self.resolve_response().await?,

                ConnectionState::SendingHeaders(mut out) => match self.send_headers(&mut out).await {
                    Ok(true) if out.head_only || matches!(out.body, Body::Empty) => {
                        // Nothing more to send; let the response go quietly.
                        if let Some(response) = out.response_mut() {
                            response.abort();
                        }
                        self.log_response(&out);
                        ConnectionState::Done
                    }
                    Ok(true) => ConnectionState::SendingBody(out),
                    Ok(false) => {
                        self.abort_outgoing(&mut out);
                        ConnectionState::Aborted
                    }
                    Err(e) => {
                        self.abort_outgoing(&mut out);
                        return Err(e);
                    }
                },

                ConnectionState::SendingBody(mut out) => match self.send_body(&mut out).await {
                    Ok(true) => {
                        self.log_response(&out);
                        ConnectionState::Done
                    }
                    Ok(false) => {
                        self.abort_outgoing(&mut out);
                        ConnectionState::Aborted
                    }
                    Err(e) => {
                        self.abort_outgoing(&mut out);
                        return Err(e);
                    }
                },

                ConnectionState::Upgrading(response, handler) => {
                    self.upgrade(response, handler).await?
                }

                ConnectionState::Done => self.finish_request(),

                ConnectionState::Aborted => {
                    debug!(id = self.id, "Connection aborted");
                    break;
                }

                ConnectionState::Closed => break,
            };
        }

        Ok(())
    }

    /// Releases everything the connection holds and announces its death.
    /// Safe to call more than once.
    pub fn die(&mut self) {
        if self.dead {
            return;
        }
        self.dead = true;

        self.abort_state();
        self.state = ConnectionState::Closed;

        self.ctx.registry.remove_connection(self.id);
        self.ctx.emit(ServerEvent::ConnectionDied { id: self.id });
        debug!(id = self.id, requests = self.requests_handled, "Connection died");
    }

    fn stop_requested(&self) -> bool {
        *self.stop.borrow()
    }

    fn abort_state(&mut self) {
        match std::mem::replace(&mut self.state, ConnectionState::Aborted) {
            ConnectionState::SendingHeaders(mut out) | ConnectionState::SendingBody(mut out) => {
                self.abort_outgoing(&mut out);
            }
            ConnectionState::Closed => self.state = ConnectionState::Closed,
            _ => {}
        }
    }

    fn abort_outgoing(&self, out: &mut Outgoing) {
        let Some(response) = out.response_mut() else {
            return;
        };
        if response.is_done() {
            return;
        }
        response.abort();

        let path = self.request_path();
        warn!(id = self.id, path = %path, "Response aborted");
        self.ctx.emit(ServerEvent::ResponseAborted { id: self.id, path });
    }

    // ---- reading ----

    /// `Ok(None)` when a stop was requested, `Ok(Some(0))` on end of stream.
    async fn read_more(&mut self) -> anyhow::Result<Option<usize>> {
        self.buffer.reserve(READ_CHUNK);
        tokio::select! {
            res = self.stream.read_buf(&mut self.buffer) => Ok(Some(res?)),
            _ = self.stop.changed() => Ok(None),
        }
    }

    fn feed_request(&mut self) -> Result<(), ParseError> {
        let consumed = self.request.append_data(&self.buffer)?;
        self.buffer.advance(consumed);
        Ok(())
    }

    async fn await_request_line(&mut self) -> anyhow::Result<ConnectionState> {
        self.request = Message::empty_request_with_limits(self.ctx.config.limits.parse_limits());
        self.buffer_body = false;

        loop {
            if !self.buffer.is_empty() {
                if let Err(e) = self.feed_request() {
                    return Ok(self.handle_invalid_request(e));
                }
                if self.request.is_header_complete() {
                    return Ok(self.on_headers_complete());
                }
                if self.request.has_start_line() {
                    return Ok(ConnectionState::AwaitingHeaders);
                }
            }

            match self.read_more().await? {
                None => return Ok(ConnectionState::Aborted),
                // Client went away between requests.
                Some(0) => return Ok(ConnectionState::Closed),
                Some(_) => {}
            }
        }
    }

    async fn await_headers(&mut self) -> anyhow::Result<ConnectionState> {
        loop {
            if !self.buffer.is_empty() {
                if let Err(e) = self.feed_request() {
                    return Ok(self.handle_invalid_request(e));
                }
                if self.request.is_header_complete() {
                    return Ok(self.on_headers_complete());
                }
            }

            match self.read_more().await? {
                None => return Ok(ConnectionState::Aborted),
                Some(0) => {
                    debug!(id = self.id, "Client closed mid-headers");
                    return Ok(ConnectionState::Closed);
                }
                Some(_) => {}
            }
        }
    }

    async fn await_body(&mut self, mut remaining: u64) -> anyhow::Result<ConnectionState> {
        let legacy_token = self.is_legacy_upgrade();

        loop {
            if !self.buffer.is_empty() && remaining > 0 {
                let n = remaining.min(self.buffer.len() as u64) as usize;
                let chunk = self.buffer.split_to(n);

                if !legacy_token {
                    self.ctx.host.process_body_chunk(&self.request, &chunk);
                }
                if self.buffer_body {
                    self.request.append_body(&chunk);
                }
                remaining -= n as u64;
            }

            if remaining == 0 {
                return Ok(ConnectionState::ResolvingResponse);
            }

            match self.read_more().await? {
                None => return Ok(ConnectionState::Aborted),
                Some(0) => {
                    debug!(id = self.id, remaining, "Client closed mid-body");
                    return Ok(ConnectionState::Closed);
                }
                Some(_) => {}
            }
        }
    }

    fn is_legacy_upgrade(&self) -> bool {
        websocket::variant(&self.request) == Some(HandshakeVariant::Legacy)
    }

    fn request_path(&self) -> String {
        self.request.path().unwrap_or_else(|| "/".to_string())
    }

    // ---- request validation ----

    fn handle_invalid_request(&mut self, error: ParseError) -> ConnectionState {
        warn!(id = self.id, error = ?error, "Invalid request");
        self.force_close = true;
        self.error_state(StatusCode::BadRequest)
    }

    fn on_headers_complete(&mut self) -> ConnectionState {
        let version = self.request.version().unwrap_or_default();
        if version != HTTP_1_0 && version != HTTP_1_1 {
            debug!(id = self.id, version, "Unsupported HTTP version");
            self.force_close = true;
            return self.error_state(StatusCode::VersionNotSupported);
        }

        let Some(method) = self.request.method().cloned() else {
            return self.handle_invalid_request(ParseError::InvalidMethod);
        };
        let path = self.request_path();
        let host = Arc::clone(&self.ctx.host);

        if !host.supports_method(&method, &path) {
            return self.handle_unknown_method(&method);
        }

        if self.request.header_field("Transfer-Encoding").is_some() {
            // Chunked request bodies are not accepted.
            return self.handle_invalid_request(ParseError::InvalidHeader);
        }

        if self.is_legacy_upgrade() {
            self.buffer_body = true;
            return ConnectionState::AwaitingBody {
                remaining: LEGACY_TOKEN_LEN as u64,
            };
        }

        let content_length = match self.request.content_length() {
            Ok(len) => len,
            Err(e) => return self.handle_invalid_request(e),
        };

        if host.expects_request_body(&method, &path) {
            let Some(length) = content_length else {
                debug!(id = self.id, method = %method, "Missing Content-Length");
                return self.handle_invalid_request(ParseError::InvalidContentLength);
            };

            host.prepare_for_body(&self.request, length);
            self.buffer_body = length <= self.ctx.config.limits.max_buffered_body;
            if length > 0 {
                return ConnectionState::AwaitingBody { remaining: length };
            }
        } else if content_length.unwrap_or(0) > 0 {
            debug!(id = self.id, method = %method, "Unexpected request body");
            return self.handle_invalid_request(ParseError::InvalidContentLength);
        }

        ConnectionState::ResolvingResponse
    }

    fn handle_unknown_method(&mut self, method: &Method) -> ConnectionState {
        self.consecutive_errors += 1;
        debug!(id = self.id, method = %method, errors = self.consecutive_errors, "Method not allowed");
        self.error_state(StatusCode::MethodNotAllowed)
    }

    // ---- resolution ----

    async fn resolve_response(&mut self) -> anyhow::Result<ConnectionState> {
        self.consecutive_errors = 0;
        let path = self.request_path();
        let host = Arc::clone(&self.ctx.host);

        if host.is_password_protected(&path) {
            if let Err(e) = self.authenticate(host.as_ref()) {
                debug!(id = self.id, path = %path, error = ?e, "Authentication failed");
                return Ok(self.handle_authentication_failed(host.as_ref()));
            }
        }

        if websocket::is_web_socket_request(&self.request) {
            if let Some(handler) = host.web_socket_for(&path) {
                match websocket::handshake_response(&self.request) {
                    Ok(response) => return Ok(ConnectionState::Upgrading(response, handler)),
                    Err(e) => warn!(id = self.id, error = ?e, "WebSocket handshake failed"),
                }
            }
        }

        // Hosts may block (file system, databases), so keep them off the runtime.
        let request = std::mem::replace(&mut self.request, Message::empty_request());
        let lookup = tokio::task::spawn_blocking(move || {
            let response = host.response_for(&request, &path);
            (request, response)
        });
        let (request, response) = tokio::select! {
            res = lookup => res.context("response lookup panicked")?,
            _ = self.stop.changed() => return Ok(ConnectionState::Aborted),
        };
        self.request = request;

        Ok(match response {
            Some(response) => self.prepare_outgoing(response),
            None => self.handle_resource_not_found(),
        })
    }

    fn authenticate(&self, host: &dyn Host) -> Result<String, AuthError> {
        auth::authenticate(
            &self.request,
            host.use_digest_access_authentication(),
            |user| host.password_for_user(user),
            &self.ctx.nonces,
        )
    }

    fn handle_authentication_failed(&mut self, host: &dyn Host) -> ConnectionState {
        let realm = host.realm();
        let challenge = if host.use_digest_access_authentication() {
            let nonce = self.challenge_nonce();
            auth::digest_challenge(&realm, &nonce)
        } else {
            auth::basic_challenge(&realm)
        };

        let mut head = self.error_head(StatusCode::Unauthorized);
        head.set_header_field("WWW-Authenticate", challenge);
        host.preprocess_error_response(&mut head);
        ConnectionState::SendingHeaders(Outgoing::empty(head, self.is_head_request()))
    }

    fn challenge_nonce(&mut self) -> String {
        if self.nonces_issued >= MAX_NONCES_PER_CONNECTION {
            if let Some(nonce) = &self.last_nonce {
                if self.ctx.nonces.is_issued(nonce) {
                    return nonce.clone();
                }
            }
        }

        let nonce = self.ctx.nonces.issue();
        self.nonces_issued += 1;
        self.last_nonce = Some(nonce.clone());
        nonce
    }

    fn handle_resource_not_found(&mut self) -> ConnectionState {
        debug!(id = self.id, path = %self.request_path(), "Resource not found");
        self.error_state(StatusCode::NotFound)
    }

    fn error_head(&self, status: StatusCode) -> Message {
        let mut head = error_response(status, HTTP_1_1);
        self.set_connection_header(&mut head);
        head
    }

    fn error_outgoing(&self, status: StatusCode) -> Outgoing {
        let mut head = self.error_head(status);
        self.ctx.host.preprocess_error_response(&mut head);
        Outgoing::empty(head, self.is_head_request())
    }

    fn is_head_request(&self) -> bool {
        self.request.method() == Some(&Method::HEAD)
    }

    /// `close` when this is the last response; `keep-alive` for an HTTP/1.0
    /// client that asked to keep the connection.
    fn set_connection_header(&self, head: &mut Message) {
        if self.should_die() {
            head.set_header_field("Connection", "close");
        } else if self.request.version() == Some(HTTP_1_0) {
            head.set_header_field("Connection", "keep-alive");
        }
    }

    fn error_state(&self, status: StatusCode) -> ConnectionState {
        ConnectionState::SendingHeaders(self.error_outgoing(status))
    }

    /// Picks the framing for `response`: full, single range, multipart,
    /// chunked or read-until-close.
    fn prepare_outgoing(&mut self, mut response: HttpResponse) -> ConnectionState {
        let method = self.request.method().cloned().unwrap_or(Method::GET);
        let head_only = method == Method::HEAD;
        let rangeable =
            response.supports_ranges() && matches!(method, Method::GET | Method::HEAD);
        let content_type = response.content_type().map(str::to_string);

        let mut headers = response.headers();
        if let Some(ct) = &content_type {
            headers.set("Content-Type", ct.clone());
        }
        if rangeable {
            headers.set("Accept-Ranges", "bytes");
        }

        let range_header = if rangeable {
            self.request.header_field("Range").map(str::to_string)
        } else {
            None
        };

        let (status, body) = match (response.content_length(), range_header) {
            (Some(length), Some(value)) => match RequestRangeSet::from_header(&value, length) {
                Err(e) => {
                    debug!(id = self.id, range = %value, error = ?e, "Range not satisfiable");
                    response.abort();
                    headers.remove("Content-Type");
                    headers.set("Content-Range", format!("bytes */{}", length));
                    headers.set("Content-Length", "0");
                    (StatusCode::RangeNotSatisfiable, Body::Empty)
                }
                Ok(ranges) if ranges.is_multipart() => {
                    let part_type =
                        content_type.unwrap_or_else(|| "application/octet-stream".to_string());
                    if let Some(ct) = ranges.multipart_content_type() {
                        headers.set("Content-Type", ct);
                    }
                    let total = ranges.multipart_content_length(&part_type).unwrap_or(0);
                    headers.set("Content-Length", total.to_string());
                    (
                        StatusCode::PartialContent,
                        Body::Multipart {
                            response,
                            ranges,
                            content_type: part_type,
                        },
                    )
                }
                Ok(ranges) => {
                    let range = ranges.ranges()[0];
                    headers.set("Content-Range", range.content_range(length));
                    headers.set("Content-Length", range.length.to_string());
                    (StatusCode::PartialContent, Body::Single { response, range })
                }
            },

            (Some(length), None) => {
                headers.set("Content-Length", length.to_string());
                (response.status(), Body::Full { response, length })
            }

            (None, _) => {
                let status = response.status();
                if self.request.version() == Some(HTTP_1_1) {
                    headers.set("Transfer-Encoding", "chunked");
                    (status, Body::Chunked { response })
                } else {
                    self.force_close = true;
                    (status, Body::UntilClose { response })
                }
            }
        };

        let mut head = Message::with_status(status, HTTP_1_1);
        for (name, value) in headers.iter() {
            head.set_header_field(name, value);
        }
        self.set_connection_header(&mut head);
        self.ctx.host.preprocess_response(&mut head);

        ConnectionState::SendingHeaders(Outgoing {
            head,
            body,
            head_only,
        })
    }

    // ---- writing ----

    /// False when a stop interrupted the write.
    async fn write_all(&mut self, data: &[u8]) -> anyhow::Result<bool> {
        tokio::select! {
            res = self.stream.write_all(data) => {
                res?;
                Ok(true)
            }
            _ = self.stop.changed() => Ok(false),
        }
    }

    async fn send_headers(&mut self, out: &mut Outgoing) -> anyhow::Result<bool> {
        // Error pages carry whatever body the host put on the head.
        let mut writer = if matches!(out.body, Body::Empty) && !out.head_only {
            ResponseWriter::new(&out.head)
        } else {
            ResponseWriter::head(&out.head)
        };
        tokio::select! {
            res = writer.write_to_stream(&mut self.stream) => {
                res?;
                Ok(true)
            }
            _ = self.stop.changed() => Ok(false),
        }
    }

    async fn send_body(&mut self, out: &mut Outgoing) -> anyhow::Result<bool> {
        let chunk = self.ctx.config.limits.write_chunk_size.max(1);

        let sent = match &mut out.body {
            Body::Empty => true,

            Body::Full { response, length } => {
                let length = *length;
                self.stream_exact(response, length, chunk).await?
            }

            Body::Single { response, range } => {
                response.set_offset(range.location).await?;
                self.stream_exact(response, range.length, chunk).await?
            }

            Body::Multipart {
                response,
                ranges,
                content_type,
            } => {
                while let Some(range) = ranges.current() {
                    let part = ranges
                        .part_header(ranges.cursor(), content_type)
                        .unwrap_or_default();
                    if !self.write_all(part.as_bytes()).await? {
                        return Ok(false);
                    }
                    response.set_offset(range.location).await?;
                    if !self.stream_exact(response, range.length, chunk).await? {
                        return Ok(false);
                    }
                    if !self.write_all(b"\r\n").await? {
                        return Ok(false);
                    }
                    ranges.advance();
                }
                let trailer = ranges.trailer().unwrap_or_default();
                self.write_all(trailer.as_bytes()).await?
            }

            Body::Chunked { response } => loop {
                let Some(data) = self.next_data(response, chunk).await? else {
                    return Ok(false);
                };
                if data.is_empty() {
                    break self.write_all(b"0\r\n\r\n").await?;
                }

                let mut frame = BytesMut::with_capacity(data.len() + 12);
                frame.extend_from_slice(format!("{:x}\r\n", data.len()).as_bytes());
                frame.extend_from_slice(&data);
                frame.extend_from_slice(b"\r\n");
                if !self.write_all(&frame).await? {
                    return Ok(false);
                }
            },

            Body::UntilClose { response } => loop {
                let Some(data) = self.next_data(response, chunk).await? else {
                    return Ok(false);
                };
                if data.is_empty() {
                    break true;
                }
                if !self.write_all(&data).await? {
                    return Ok(false);
                }
            },
        };

        if sent {
            self.stream.flush().await?;
        }
        Ok(sent)
    }

    /// Next piece of body, `None` if a stop came first.
    async fn next_data(
        &mut self,
        response: &mut HttpResponse,
        max: usize,
    ) -> anyhow::Result<Option<bytes::Bytes>> {
        tokio::select! {
            res = response.read_data(max) => {
                let data = res?;
                anyhow::ensure!(data.len() <= max, "response delivered more than requested");
                Ok(Some(data))
            }
            _ = self.stop.changed() => Ok(None),
        }
    }

    /// Copies exactly `length` bytes of `response` to the socket.
    async fn stream_exact(
        &mut self,
        response: &mut HttpResponse,
        length: u64,
        chunk: usize,
    ) -> anyhow::Result<bool> {
        let mut remaining = length;

        while remaining > 0 {
            let want = (chunk as u64).min(remaining) as usize;
            let Some(data) = self.next_data(response, want).await? else {
                return Ok(false);
            };
            if data.is_empty() {
                anyhow::bail!("response ended {} bytes early", remaining);
            }
            if !self.write_all(&data).await? {
                return Ok(false);
            }
            remaining -= data.len() as u64;
        }

        Ok(true)
    }

    fn log_response(&self, out: &Outgoing) {
        info!(
            id = self.id,
            method = %self.request.method().map(Method::as_str).unwrap_or("-"),
            path = %self.request_path(),
            status = out.head.status_code().unwrap_or(0),
            "Request handled"
        );
    }

    fn finish_request(&mut self) -> ConnectionState {
        self.requests_handled += 1;
        if self.should_die() {
            ConnectionState::Closed
        } else {
            ConnectionState::AwaitingRequestLine
        }
    }

    fn should_die(&self) -> bool {
        self.force_close
            || self.stop_requested()
            || !self.request.keep_alive()
            || self.consecutive_errors >= self.ctx.config.limits.max_consecutive_errors
    }

    // ---- websocket ----

    async fn upgrade(
        &mut self,
        response: Message,
        mut handler: Box<dyn WebSocketHandler>,
    ) -> anyhow::Result<ConnectionState> {
        let request = std::mem::replace(&mut self.request, Message::empty_request());
        let max_frame = self.ctx.config.limits.max_websocket_frame;

        let mut ws = match WebSocket::new(self.id, request, max_frame) {
            Ok(ws) => ws,
            Err(e) => {
                warn!(id = self.id, error = ?e, "Not a WebSocket request");
                return Ok(ConnectionState::Closed);
            }
        };

        let mut writer = ResponseWriter::new(&response);
        tokio::select! {
            res = writer.write_to_stream(&mut self.stream) => res?,
            _ = self.stop.changed() => return Ok(ConnectionState::Aborted),
        }

        info!(id = self.id, path = %ws.request().path().unwrap_or_default(), "WebSocket upgraded");
        self.requests_handled += 1;
        self.ctx.registry.promote_to_web_socket(self.id, ws.handle());

        let leftover = self.buffer.split();
        let result = ws
            .run(&mut self.stream, &leftover, handler.as_mut(), &mut self.stop)
            .await;

        self.ctx.registry.remove_web_socket(self.id);
        self.ctx.emit(ServerEvent::WebSocketDied { id: self.id });
        result?;

        Ok(ConnectionState::Closed)
    }
}
