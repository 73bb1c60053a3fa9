//! WebSocket upgrade and text framing.
//!
//! Two handshakes are recognised:
//!
//! - **Legacy**: `Sec-WebSocket-Key1`, `Sec-WebSocket-Key2` and an 8-byte
//!   token sent as the request body. The reply body is the MD5 of both key
//!   numbers and the token.
//! - **Hybi**: a single `Sec-WebSocket-Key`, answered with
//!   `base64(SHA-1(key + GUID))` in `Sec-WebSocket-Accept`.
//!
//! Once open, text frames are `0x00 <utf-8> 0xFF` with no length prefix.

use base64::Engine;
use bytes::{BufMut, Bytes, BytesMut};
use md5::Md5;
use sha1::{Digest, Sha1};
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt};
use tokio::sync::{mpsc, watch};

use crate::http::message::Message;
use crate::http::response::StatusCode;

/// Fixed GUID appended to the client key (RFC 6455).
pub const WS_GUID: &str = "258EAFA5-E914-47DA-95CA-C5AB0DC85B11";

const FRAME_START: u8 = 0x00;
const FRAME_END: u8 = 0xFF;

/// Length of the token a legacy client sends after its headers.
pub const LEGACY_TOKEN_LEN: usize = 8;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum HandshakeVariant {
    Legacy,
    Hybi,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum HandshakeError {
    NotUpgrade,
    MalformedKey(&'static str),
    MissingToken,
    MissingHost,
}

/// Which handshake `request` asks for, if it is an upgrade request at all.
pub fn variant(request: &Message) -> Option<HandshakeVariant> {
    let headers = request.all_header_fields();

    let upgrade = headers
        .get("Upgrade")
        .is_some_and(|v| v.trim().eq_ignore_ascii_case("websocket"));
    if !upgrade {
        return None;
    }

    if headers.contains("Sec-WebSocket-Key1") && headers.contains("Sec-WebSocket-Key2") {
        Some(HandshakeVariant::Legacy)
    } else if headers.contains("Sec-WebSocket-Key") {
        Some(HandshakeVariant::Hybi)
    } else {
        None
    }
}

pub fn is_web_socket_request(request: &Message) -> bool {
    variant(request).is_some()
}

/// Digits of a legacy key divided by its number of spaces.
///
/// The key must contain at least one space and the digits must be an exact
/// multiple of the space count.
pub fn legacy_key_number(key: &str) -> Result<u32, HandshakeError> {
    let digits: String = key.chars().filter(|c| c.is_ascii_digit()).collect();
    let spaces = key.chars().filter(|&c| c == ' ').count() as u64;

    if digits.is_empty() || spaces == 0 {
        return Err(HandshakeError::MalformedKey("key"));
    }

    let number: u64 = digits
        .parse()
        .map_err(|_| HandshakeError::MalformedKey("key"))?;

    if number % spaces != 0 {
        return Err(HandshakeError::MalformedKey("key"));
    }

    u32::try_from(number / spaces).map_err(|_| HandshakeError::MalformedKey("key"))
}

/// The 16-byte body answering a legacy handshake.
pub fn legacy_challenge_response(
    key1: &str,
    key2: &str,
    token: &[u8],
) -> Result<[u8; 16], HandshakeError> {
    if token.len() != LEGACY_TOKEN_LEN {
        return Err(HandshakeError::MissingToken);
    }

    let n1 = legacy_key_number(key1).map_err(|_| HandshakeError::MalformedKey("Sec-WebSocket-Key1"))?;
    let n2 = legacy_key_number(key2).map_err(|_| HandshakeError::MalformedKey("Sec-WebSocket-Key2"))?;

    let mut challenge = Vec::with_capacity(16);
    challenge.extend_from_slice(&n1.to_be_bytes());
    challenge.extend_from_slice(&n2.to_be_bytes());
    challenge.extend_from_slice(token);

    let digest = Md5::digest(&challenge);
    let mut out = [0u8; 16];
    out.copy_from_slice(&digest);
    Ok(out)
}

/// `Sec-WebSocket-Accept` for a client key.
pub fn accept_key(key: &str) -> String {
    let mut hasher = Sha1::new();
    hasher.update(key.trim().as_bytes());
    hasher.update(WS_GUID.as_bytes());
    base64::engine::general_purpose::STANDARD.encode(hasher.finalize())
}

/// Builds the `101` reply for `request`.
pub fn handshake_response(request: &Message) -> Result<Message, HandshakeError> {
    let variant = variant(request).ok_or(HandshakeError::NotUpgrade)?;

    match variant {
        HandshakeVariant::Hybi => {
            let key = request
                .header_field("Sec-WebSocket-Key")
                .filter(|k| !k.trim().is_empty())
                .ok_or(HandshakeError::MalformedKey("Sec-WebSocket-Key"))?;

            let mut response = Message::with_status(StatusCode::SwitchingProtocols, "HTTP/1.1");
            response.set_header_field("Upgrade", "websocket");
            response.set_header_field("Connection", "Upgrade");
            response.set_header_field("Sec-WebSocket-Accept", accept_key(key));
            Ok(response)
        }

        HandshakeVariant::Legacy => {
            let key1 = request.header_field("Sec-WebSocket-Key1").unwrap_or("");
            let key2 = request.header_field("Sec-WebSocket-Key2").unwrap_or("");
            let body = legacy_challenge_response(key1, key2, request.body())?;

            let host = request
                .header_field("Host")
                .ok_or(HandshakeError::MissingHost)?;
            let location = format!("ws://{}{}", host, request.url().unwrap_or("/"));

            let mut response = Message::response(101, "Web Socket Protocol Handshake", "HTTP/1.1");
            response.set_header_field("Upgrade", "WebSocket");
            response.set_header_field("Connection", "Upgrade");
            if let Some(origin) = request.header_field("Origin") {
                response.set_header_field("Sec-WebSocket-Origin", origin);
            }
            response.set_header_field("Sec-WebSocket-Location", location);
            if let Some(protocol) = request.header_field("Sec-WebSocket-Protocol") {
                response.set_header_field("Sec-WebSocket-Protocol", protocol);
            }
            response.set_body(body.to_vec());
            Ok(response)
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Frame {
    Text(String),
    Close,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum FrameError {
    UnexpectedByte(u8),
    TooLarge,
    InvalidUtf8,
}

/// Wraps `msg` in start and end markers.
pub fn encode_text_frame(msg: &str) -> Bytes {
    let mut buf = BytesMut::with_capacity(msg.len() + 2);
    buf.put_u8(FRAME_START);
    buf.put_slice(msg.as_bytes());
    buf.put_u8(FRAME_END);
    buf.freeze()
}

/// Splits inbound bytes into frames.
#[derive(Debug)]
pub struct FrameDecoder {
    buf: BytesMut,
    max_frame: usize,
}

impl FrameDecoder {
    pub fn new(max_frame: usize) -> Self {
        Self {
            buf: BytesMut::new(),
            max_frame,
        }
    }

    pub fn extend(&mut self, data: &[u8]) {
        self.buf.extend_from_slice(data);
    }

    /// Next complete frame, `Ok(None)` if more bytes are needed.
    pub fn decode(&mut self) -> Result<Option<Frame>, FrameError> {
        let Some(&lead) = self.buf.first() else {
            return Ok(None);
        };

        match lead {
            FRAME_START => match self.buf[1..].iter().position(|&b| b == FRAME_END) {
                Some(end) => {
                    let frame = self.buf.split_to(end + 2);
                    let payload = frame[1..end + 1].to_vec();
                    String::from_utf8(payload)
                        .map(|text| Some(Frame::Text(text)))
                        .map_err(|_| FrameError::InvalidUtf8)
                }
                None if self.buf.len() - 1 > self.max_frame => Err(FrameError::TooLarge),
                None => Ok(None),
            },
            FRAME_END => match self.buf.get(1) {
                None => Ok(None),
                Some(0x00) => {
                    let _ = self.buf.split_to(2);
                    Ok(Some(Frame::Close))
                }
                Some(&other) => Err(FrameError::UnexpectedByte(other)),
            },
            other => Err(FrameError::UnexpectedByte(other)),
        }
    }
}

/// Callbacks of a WebSocket session. All default to doing nothing.
pub trait WebSocketHandler: Send {
    fn did_open(&mut self, _ws: &WebSocketHandle) {}

    fn did_receive_message(&mut self, _ws: &WebSocketHandle, _msg: &str) {}

    fn did_close(&mut self, _ws: &WebSocketHandle) {}
}

#[derive(Debug)]
enum Command {
    Send(String),
    Stop,
}

/// Cloneable handle to a session, usable from any task.
#[derive(Debug, Clone)]
pub struct WebSocketHandle {
    id: u64,
    commands: mpsc::UnboundedSender<Command>,
}

impl WebSocketHandle {
    pub fn id(&self) -> u64 {
        self.id
    }

    /// Queues a text message. Returns false if the session is gone.
    pub fn send_message(&self, msg: impl Into<String>) -> bool {
        self.commands.send(Command::Send(msg.into())).is_ok()
    }

    pub fn stop(&self) {
        let _ = self.commands.send(Command::Stop);
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum WebSocketState {
    Connecting,
    Open,
    Closed,
}

pub struct WebSocket {
    request: Message,
    variant: HandshakeVariant,
    state: WebSocketState,
    started: bool,
    handle: WebSocketHandle,
    commands: mpsc::UnboundedReceiver<Command>,
    decoder: FrameDecoder,
}

impl WebSocket {
    pub fn new(id: u64, request: Message, max_frame: usize) -> Result<Self, HandshakeError> {
        let variant = variant(&request).ok_or(HandshakeError::NotUpgrade)?;
        let (tx, rx) = mpsc::unbounded_channel();

        Ok(Self {
            request,
            variant,
            state: WebSocketState::Connecting,
            started: false,
            handle: WebSocketHandle { id, commands: tx },
            commands: rx,
            decoder: FrameDecoder::new(max_frame),
        })
    }

    pub fn handle(&self) -> WebSocketHandle {
        self.handle.clone()
    }

    pub fn request(&self) -> &Message {
        &self.request
    }

    pub fn variant(&self) -> HandshakeVariant {
        self.variant
    }

    pub fn state(&self) -> WebSocketState {
        self.state
    }

    pub fn is_started(&self) -> bool {
        self.started
    }

    pub fn handshake_response(&self) -> Result<Message, HandshakeError> {
        handshake_response(&self.request)
    }

    /// Drives the open session until either side closes or `stop` fires.
    ///
    /// `leftover` holds bytes that arrived together with the handshake.
    pub async fn run<S>(
        &mut self,
        stream: &mut S,
        leftover: &[u8],
        handler: &mut dyn WebSocketHandler,
        stop: &mut watch::Receiver<bool>,
    ) -> anyhow::Result<()>
    where
        S: AsyncRead + AsyncWrite + Unpin,
    {
        self.started = true;
        self.state = WebSocketState::Open;
        tracing::debug!(id = self.handle.id, variant = ?self.variant, "WebSocket opened");
        handler.did_open(&self.handle);

        self.decoder.extend(leftover);
        let result = if self.deliver(handler) {
            self.pump(stream, handler, stop).await
        } else {
            Ok(())
        };

        self.close(stream, handler).await;
        result
    }

    async fn pump<S>(
        &mut self,
        stream: &mut S,
        handler: &mut dyn WebSocketHandler,
        stop: &mut watch::Receiver<bool>,
    ) -> anyhow::Result<()>
    where
        S: AsyncRead + AsyncWrite + Unpin,
    {
        let mut buf = BytesMut::with_capacity(4096);

        loop {
            if *stop.borrow() {
                return Ok(());
            }

            tokio::select! {
                read = stream.read_buf(&mut buf) => {
                    if read? == 0 {
                        return Ok(());
                    }
                    self.decoder.extend(&buf);
                    buf.clear();
                    if !self.deliver(handler) {
                        return Ok(());
                    }
                }
                cmd = self.commands.recv() => match cmd {
                    Some(Command::Send(msg)) => {
                        stream.write_all(&encode_text_frame(&msg)).await?;
                    }
                    Some(Command::Stop) | None => return Ok(()),
                },
                _ = stop.changed() => return Ok(()),
            }
        }
    }

    /// Hands every complete frame to the handler. False once the session
    /// should close.
    fn deliver(&mut self, handler: &mut dyn WebSocketHandler) -> bool {
        loop {
            match self.decoder.decode() {
                Ok(Some(Frame::Text(msg))) => handler.did_receive_message(&self.handle, &msg),
                Ok(Some(Frame::Close)) => return false,
                Ok(None) => return true,
                Err(FrameError::InvalidUtf8) => {
                    tracing::warn!(id = self.handle.id, "Dropping WebSocket frame with invalid UTF-8");
                }
                Err(e) => {
                    tracing::warn!(id = self.handle.id, error = ?e, "WebSocket protocol error");
                    return false;
                }
            }
        }
    }

    async fn close<S>(&mut self, stream: &mut S, handler: &mut dyn WebSocketHandler)
    where
        S: AsyncWrite + Unpin,
    {
        if self.state == WebSocketState::Closed {
            return;
        }
        self.state = WebSocketState::Closed;

        let _ = stream.write_all(&[FRAME_END, 0x00]).await;
        let _ = stream.shutdown().await;

        tracing::debug!(id = self.handle.id, "WebSocket closed");
        handler.did_close(&self.handle);
    }
}
