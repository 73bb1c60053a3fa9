//! Listener, connection registry and the state shared by all connections.

pub mod events;
pub mod listener;
pub mod registry;

use std::sync::Arc;
use std::sync::atomic::{AtomicU64, Ordering};

use tokio::sync::broadcast;

use crate::config::Config;
use crate::host::Host;
use crate::http::auth::NonceTracker;

pub use events::ServerEvent;
pub use listener::HttpServer;
pub use registry::{ConnectionHandle, Registry};

const EVENT_CAPACITY: usize = 256;

/// Everything a connection task needs from its server.
pub struct ServerContext {
    pub config: Config,
    pub host: Arc<dyn Host>,
    pub nonces: NonceTracker,
    pub registry: Registry,
    events: broadcast::Sender<ServerEvent>,
    next_id: AtomicU64,
}

impl ServerContext {
    pub fn new(config: Config, host: Arc<dyn Host>) -> Arc<Self> {
        let (events, _) = broadcast::channel(EVENT_CAPACITY);
        let nonces = NonceTracker::with_limits(config.auth.nonce_lifetime(), config.auth.max_nonces);
        Arc::new(Self {
            config,
            host,
            nonces,
            registry: Registry::new(),
            events,
            next_id: AtomicU64::new(1),
        })
    }

    pub fn next_connection_id(&self) -> u64 {
        self.next_id.fetch_add(1, Ordering::Relaxed)
    }

    pub fn subscribe(&self) -> broadcast::Receiver<ServerEvent> {
        self.events.subscribe()
    }

    pub fn emit(&self, event: ServerEvent) {
        // Nobody listening is fine.
        let _ = self.events.send(event);
    }
}
