use std::net::SocketAddr;
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use std::time::Duration;

use anyhow::Context;
use tokio::io::{AsyncRead, AsyncWrite};
use tokio::net::TcpListener;
use tokio::sync::broadcast;
use tokio::task::JoinHandle;
use tracing::{error, info, warn};

use crate::config::Config;
use crate::host::Host;
use crate::http::connection::Connection;
use crate::server::{ConnectionHandle, ServerContext, ServerEvent};
use crate::site::StaticSite;

// Pause after a failed accept, e.g. when out of file descriptors.
const ACCEPT_BACKOFF: Duration = Duration::from_millis(100);

#[derive(Default)]
struct ListenState {
    accept_task: Option<JoinHandle<()>>,
    local_addr: Option<SocketAddr>,
}

/// An embeddable HTTP server.
///
/// ```no_run
/// # use std::sync::Arc;
/// # use beacon::config::Config;
/// # use beacon::server::HttpServer;
/// # use beacon::site::StaticSite;
/// # async fn demo() -> anyhow::Result<()> {
/// let cfg = Config::default();
/// let server = HttpServer::new(cfg.clone(), Arc::new(StaticSite::new(&cfg)));
/// let addr = server.start().await?;
/// println!("listening on {}", addr);
/// server.stop().await;
/// # Ok(())
/// # }
/// ```
pub struct HttpServer {
    ctx: Arc<ServerContext>,
    state: Mutex<ListenState>,
}

impl HttpServer {
    pub fn new(config: Config, host: Arc<dyn Host>) -> Self {
        Self {
            ctx: ServerContext::new(config, host),
            state: Mutex::new(ListenState::default()),
        }
    }

    pub fn context(&self) -> &Arc<ServerContext> {
        &self.ctx
    }

    /// Binds `listen_addr` and starts accepting. Returns the bound address,
    /// which carries the real port when the configured one was 0.
    pub async fn start(&self) -> anyhow::Result<SocketAddr> {
        if self.is_running() {
            anyhow::bail!("server already running");
        }

        let addr = &self.ctx.config.listen_addr;
        let listener = TcpListener::bind(addr)
            .await
            .with_context(|| format!("binding {}", addr))?;
        let local_addr = listener.local_addr()?;
        info!("Listening on {}", local_addr);

        let ctx = Arc::clone(&self.ctx);
        let task = tokio::spawn(async move {
            loop {
                match listener.accept().await {
                    Ok((socket, peer)) => {
                        info!("Accepted connection from {}", peer);
                        if let Err(e) = socket.set_nodelay(true) {
                            warn!(%peer, error = %e, "Cannot set TCP_NODELAY");
                        }
                        spawn_connection(&ctx, socket, Some(peer));
                    }
                    Err(e) => {
                        warn!(error = %e, "Accept failed");
                        tokio::time::sleep(ACCEPT_BACKOFF).await;
                    }
                }
            }
        });

        let mut state = self.lock();
        state.accept_task = Some(task);
        state.local_addr = Some(local_addr);
        Ok(local_addr)
    }

    /// Serves an already established stream, e.g. one that went through a
    /// TLS handshake. Returns the connection id.
    pub fn serve_stream<S>(&self, stream: S) -> u64
    where
        S: AsyncRead + AsyncWrite + Unpin + Send + 'static,
    {
        spawn_connection(&self.ctx, stream, None)
    }

    /// Stops accepting, tells every connection and WebSocket to wind down
    /// and waits until all of them have released their sockets and files.
    /// Returns false if the server was not running.
    pub async fn stop(&self) -> bool {
        let accept_task = self.halt_accepting();
        let was_running = accept_task.is_some();
        if let Some(task) = accept_task {
            // Cancelled on purpose; awaiting drops the listening socket.
            let _ = task.await;
        }

        loop {
            let tasks = self.ctx.registry.stop_all();
            if tasks.is_empty() {
                break;
            }
            for task in tasks {
                if let Err(e) = task.await {
                    if e.is_panic() {
                        error!(error = %e, "Connection task panicked");
                    }
                }
            }
        }

        if was_running {
            info!("Server stopped");
        }
        was_running
    }

    fn halt_accepting(&self) -> Option<JoinHandle<()>> {
        let mut state = self.lock();
        state.local_addr = None;
        let task = state.accept_task.take()?;
        task.abort();
        Some(task)
    }

    pub fn is_running(&self) -> bool {
        self.lock().accept_task.is_some()
    }

    pub fn listening_port(&self) -> Option<u16> {
        self.lock().local_addr.map(|a| a.port())
    }

    pub fn number_of_http_connections(&self) -> usize {
        self.ctx.registry.connection_count()
    }

    pub fn number_of_web_socket_connections(&self) -> usize {
        self.ctx.registry.web_socket_count()
    }

    pub fn subscribe(&self) -> broadcast::Receiver<ServerEvent> {
        self.ctx.subscribe()
    }

    fn lock(&self) -> MutexGuard<'_, ListenState> {
        self.state.lock().unwrap_or_else(PoisonError::into_inner)
    }
}

impl Drop for HttpServer {
    fn drop(&mut self) {
        // Cannot wait here; connections finish on their own once signalled.
        self.halt_accepting();
        self.ctx.registry.stop_all();
    }
}

/// Registers a connection on `stream` and drives it on its own task.
pub fn spawn_connection<S>(ctx: &Arc<ServerContext>, stream: S, peer: Option<SocketAddr>) -> u64
where
    S: AsyncRead + AsyncWrite + Unpin + Send + 'static,
{
    let id = ctx.next_connection_id();
    let (handle, stop) = ConnectionHandle::new();
    ctx.registry.add_connection(id, handle);

    let task_ctx = Arc::clone(ctx);
    let task = tokio::spawn(async move {
        let mut conn = Connection::new(id, stream, task_ctx, stop);
        if let Err(e) = conn.run().await {
            match peer {
                Some(peer) => error!(id, "Connection error from {}: {}", peer, e),
                None => error!(id, "Connection error: {}", e),
            }
        }
        conn.die();
    });
    ctx.registry.attach_task(id, task);

    id
}

/// Serves the configured document root until ctrl-c.
pub async fn run(cfg: &Config) -> anyhow::Result<()> {
    let server = HttpServer::new(cfg.clone(), Arc::new(StaticSite::new(cfg)));
    server.start().await?;

    tokio::signal::ctrl_c().await?;
    info!("Shutdown signal received");
    server.stop().await;

    Ok(())
}
