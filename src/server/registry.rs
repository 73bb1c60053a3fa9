//! Live connections and WebSocket sessions.
//!
//! A single coarse lock guards both maps. Every operation is a constant-time
//! insert, remove or lookup and the lock is never held across an await.

use std::collections::HashMap;
use std::sync::{Mutex, MutexGuard, PoisonError};

use tokio::sync::watch;
use tokio::task::JoinHandle;

use crate::http::websocket::WebSocketHandle;

/// Owner side of a connection: its stop signal and the task driving it.
#[derive(Debug)]
pub struct ConnectionHandle {
    stop: watch::Sender<bool>,
    task: Option<JoinHandle<()>>,
}

impl ConnectionHandle {
    /// A handle and the receiver the connection task listens on.
    pub fn new() -> (Self, watch::Receiver<bool>) {
        let (stop, rx) = watch::channel(false);
        (Self { stop, task: None }, rx)
    }

    /// Asks the connection to stop. Idempotent.
    pub fn stop(&self) {
        self.stop.send_replace(true);
    }
}

#[derive(Debug)]
struct WebSocketEntry {
    handle: WebSocketHandle,
    // Keeps the stop signal of the upgraded connection alive.
    connection: Option<ConnectionHandle>,
}

#[derive(Debug, Default)]
struct Inner {
    connections: HashMap<u64, ConnectionHandle>,
    web_sockets: HashMap<u64, WebSocketEntry>,
}

#[derive(Debug, Default)]
pub struct Registry {
    inner: Mutex<Inner>,
}

impl Registry {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn add_connection(&self, id: u64, handle: ConnectionHandle) {
        self.lock().connections.insert(id, handle);
    }

    /// Records the task serving connection `id`. A task that already
    /// finished has removed its entry, so there is nothing to record.
    pub fn attach_task(&self, id: u64, task: JoinHandle<()>) {
        if let Some(handle) = self.lock().connections.get_mut(&id) {
            handle.task = Some(task);
        }
    }

    pub fn remove_connection(&self, id: u64) -> bool {
        self.lock().connections.remove(&id).is_some()
    }

    /// Moves connection `id` over to the WebSocket list.
    pub fn promote_to_web_socket(&self, id: u64, handle: WebSocketHandle) {
        let mut inner = self.lock();
        let connection = inner.connections.remove(&id);
        inner
            .web_sockets
            .insert(id, WebSocketEntry { handle, connection });
    }

    pub fn remove_web_socket(&self, id: u64) -> bool {
        self.lock().web_sockets.remove(&id).is_some()
    }

    pub fn connection_count(&self) -> usize {
        self.lock().connections.len()
    }

    pub fn web_socket_count(&self) -> usize {
        self.lock().web_sockets.len()
    }

    /// Signals every connection and session to stop and hands back the
    /// tasks not yet collected. Entries are removed by the tasks themselves
    /// as they wind down.
    pub fn stop_all(&self) -> Vec<JoinHandle<()>> {
        let mut inner = self.lock();
        let mut tasks = Vec::new();

        for handle in inner.connections.values_mut() {
            handle.stop();
            tasks.extend(handle.task.take());
        }
        for entry in inner.web_sockets.values_mut() {
            entry.handle.stop();
            if let Some(connection) = &mut entry.connection {
                connection.stop();
                tasks.extend(connection.task.take());
            }
        }

        tasks
    }

    fn lock(&self) -> MutexGuard<'_, Inner> {
        self.inner.lock().unwrap_or_else(PoisonError::into_inner)
    }
}
