//! HTTP/1.1 protocol implementation.
//!
//! # Architecture
//!
//! - **`connection`**: per-connection state machine, one tokio task each
//! - **`message`**: incremental request/response message with header access
//! - **`parser`**: start-line and header-line parsing with size limits
//! - **`headers`**: ordered, case-insensitive header map
//! - **`request`**: methods and protocol versions
//! - **`response`**: the response kinds a host can hand back
//! - **`file`**: file bodies read ahead by a background task
//! - **`range`**: `Range` header parsing and multipart/byteranges framing
//! - **`auth`**: Basic and Digest authentication
//! - **`websocket`**: upgrade handshakes and text framing
//! - **`writer`**: writes serialized messages to the socket
//! - **`mime`**: content types from file extensions
//!
//! # Connection State Machine
//!
//! ```text
//!   AwaitingRequestLine ──► AwaitingHeaders ──► AwaitingBody
//!            ▲                     │                 │
//!            │                     ▼                 ▼
//!            │              ResolvingResponse ◄──────┘
//!            │                 │         │
//!            │                 ▼         ▼
//!            │          SendingHeaders  Upgrading ──► Closed
//!            │                 │
//!            │                 ▼
//!            │           SendingBody
//!            │                 │
//!            └──── keep-alive ─┴─ Done ── close ──► Closed
//! ```
//!
//! A stop request or write failure in any state leads to `Aborted`, which
//! aborts the in-flight response before the socket closes.

pub mod auth;
pub mod connection;
pub mod file;
pub mod headers;
pub mod message;
pub mod mime;
pub mod parser;
pub mod range;
pub mod request;
pub mod response;
pub mod websocket;
pub mod writer;
