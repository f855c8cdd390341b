//! Ingest server listener
//!
//! Handles the TCP accept loop and spawns one session task per connection.

use std::net::SocketAddr;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

use tokio::net::{TcpListener, TcpStream};
use tokio::sync::Semaphore;

use crate::error::Result;
use crate::protocol::FlvIngestAdapter;
use crate::registry::SessionRegistry;
use crate::server::config::ServerConfig;
use crate::session::{Session, SessionControl, SessionCore};
use crate::sink::peer_output;
use crate::stats::ServerStats;

/// Ingest server
pub struct IngestServer {
    config: ServerConfig,
    registry: Arc<SessionRegistry>,
    next_session_id: AtomicU64,
    connection_semaphore: Option<Arc<Semaphore>>,
    stats: Arc<ServerStats>,
}

impl IngestServer {
    pub fn new(config: ServerConfig, registry: Arc<SessionRegistry>) -> Self {
        let connection_semaphore = if config.max_connections > 0 {
            Some(Arc::new(Semaphore::new(config.max_connections)))
        } else {
            None
        };

        Self {
            config,
            registry,
            next_session_id: AtomicU64::new(1),
            connection_semaphore,
            stats: Arc::new(ServerStats::default()),
        }
    }

    pub fn registry(&self) -> &Arc<SessionRegistry> {
        &self.registry
    }

    pub fn stats(&self) -> &ServerStats {
        &self.stats
    }

    /// Run the server
    ///
    /// This method blocks until the process exits.
    pub async fn run(&self) -> Result<()> {
        let listener = TcpListener::bind(self.config.bind_addr).await?;
        tracing::info!(addr = %self.config.bind_addr, "Ingest server listening");
        self.accept_loop(&listener).await
    }

    /// Run the server until `shutdown` resolves
    pub async fn run_until<F>(&self, shutdown: F) -> Result<()>
    where
        F: std::future::Future<Output = ()>,
    {
        let listener = TcpListener::bind(self.config.bind_addr).await?;
        tracing::info!(addr = %self.config.bind_addr, "Ingest server listening");
        self.serve(listener, shutdown).await
    }

    /// Accept on an already bound listener until `shutdown` resolves
    pub async fn serve<F>(&self, listener: TcpListener, shutdown: F) -> Result<()>
    where
        F: std::future::Future<Output = ()>,
    {
        tokio::select! {
            _ = shutdown => {
                tracing::info!("Shutdown signal received");
                Ok(())
            }
            result = self.accept_loop(&listener) => result,
        }
    }

    async fn accept_loop(&self, listener: &TcpListener) -> Result<()> {
        loop {
            match listener.accept().await {
                Ok((socket, peer_addr)) => {
                    self.handle_connection(socket, peer_addr);
                }
                Err(e) => {
                    tracing::error!(error = %e, "Failed to accept connection");
                }
            }
        }
    }

    fn handle_connection(&self, socket: TcpStream, peer_addr: SocketAddr) {
        let permit = match &self.connection_semaphore {
            Some(sem) => match Arc::clone(sem).try_acquire_owned() {
                Ok(permit) => Some(permit),
                Err(_) => {
                    self.stats.connection_rejected();
                    tracing::warn!(peer = %peer_addr, "Connection rejected: limit reached");
                    return;
                }
            },
            None => None,
        };

        let session_id = self.next_session_id.fetch_add(1, Ordering::Relaxed);
        tracing::debug!(session_id, peer = %peer_addr, "New connection");

        if self.config.tcp_nodelay {
            if let Err(e) = socket.set_nodelay(true) {
                tracing::error!(session_id, error = %e, "Failed to configure socket");
                return;
            }
        }

        let (reader, writer) = socket.into_split();
        let control = SessionControl::new(session_id);
        let core = SessionCore::new(control, Arc::clone(&self.registry), peer_output(writer));
        let session = Session::new(
            core,
            Box::new(FlvIngestAdapter::new()),
            self.config.read_buffer_size,
        );

        let stats = Arc::clone(&self.stats);
        stats.connection_opened();
        tokio::spawn(async move {
            let _permit = permit;
            if let Err(e) = session.run(reader).await {
                tracing::debug!(session_id, error = %e, "Connection error");
            }
            stats.connection_closed();
            tracing::debug!(session_id, "Connection closed");
        });
    }

    /// Get the bind address
    pub fn bind_addr(&self) -> SocketAddr {
        self.config.bind_addr
    }
}
