//! What the embedding application plugs into the server.
//!
//! Every connection consults one shared [`Host`]. Only
//! [`Host::response_for`] has to be written; the rest default to a
//! read-only, unauthenticated server.

use crate::http::message::Message;
use crate::http::request::Method;
use crate::http::response::HttpResponse;
use crate::http::websocket::WebSocketHandler;

pub trait Host: Send + Sync + 'static {
    /// Whether `method` is accepted for `path`. Unsupported methods get a 405.
    fn supports_method(&self, method: &Method, _path: &str) -> bool {
        matches!(method, Method::GET | Method::HEAD)
    }

    /// Whether `method` carries a body, and so must send `Content-Length`.
    fn expects_request_body(&self, method: &Method, _path: &str) -> bool {
        matches!(method, Method::POST | Method::PUT)
    }

    fn is_password_protected(&self, _path: &str) -> bool {
        false
    }

    /// Digest when true, Basic otherwise.
    fn use_digest_access_authentication(&self) -> bool {
        true
    }

    fn realm(&self) -> String {
        "defaultRealm@host.com".to_string()
    }

    fn password_for_user(&self, _username: &str) -> Option<String> {
        None
    }

    /// Called once the headers of a request with a body are in.
    fn prepare_for_body(&self, _request: &Message, _content_length: u64) {}

    /// Called for each piece of request body as it arrives.
    fn process_body_chunk(&self, _request: &Message, _chunk: &[u8]) {}

    /// The response for a fully read request, `None` for a 404.
    ///
    /// Runs on tokio's blocking pool, so it may do blocking file I/O.
    fn response_for(&self, request: &Message, path: &str) -> Option<HttpResponse>;

    /// Last look at a response head before it is written.
    fn preprocess_response(&self, _head: &mut Message) {}

    /// Last look at an error head (400, 401, 404, 405, 505). A body set here
    /// is sent as-is; the host owns the matching `Content-Length`.
    fn preprocess_error_response(&self, _head: &mut Message) {}

    /// Handler for a WebSocket upgrade on `path`, `None` to refuse it.
    fn web_socket_for(&self, _path: &str) -> Option<Box<dyn WebSocketHandler>> {
        None
    }
}
