/// Lifecycle notifications published by the server.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ServerEvent {
    /// A connection finished, for whatever reason. Its resources are released.
    ConnectionDied { id: u64 },
    /// A WebSocket session on connection `id` closed.
    WebSocketDied { id: u64 },
    /// A response was cut short before all of its body was sent.
    ResponseAborted { id: u64, path: String },
}
