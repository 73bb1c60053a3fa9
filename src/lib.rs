//! Beacon - embeddable HTTP/1.1 server
//!
//! Keep-alive connections, byte ranges, streamed file bodies, Basic and
//! Digest authentication and WebSocket upgrades. Applications implement
//! [`host::Host`] and hand it to [`server::HttpServer`].

pub mod config;
pub mod host;
pub mod http;
pub mod server;
pub mod site;
