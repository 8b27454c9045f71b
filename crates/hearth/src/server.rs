//! `ChatServer` builder and server loop.
//!
//! This is the entry point for running a hearth server. It ties together
//! all the layers: transport → framing → session → router → store.

use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;

use hearth_channel::ChannelDirectory;
use hearth_session::{DuplicateLoginPolicy, SessionConfig, SessionRegistry};
use hearth_store::{SqliteStore, Store};
use hearth_transport::{TcpTransport, Transport, WebSocketTransport};
use tokio::sync::watch;
use tokio::task::JoinSet;

use crate::HearthError;
use crate::config::{DatabaseLocation, ServerConfig};
use crate::connection::handle_connection;
use crate::router::Router;

/// Extra time, beyond one flush timeout, that shutdown waits for
/// connection tasks before aborting them.
const SHUTDOWN_GRACE: Duration = Duration::from_secs(1);

/// Builder for configuring and starting a hearth server.
///
/// # Example
///
/// ```rust,no_run
/// use hearth::prelude::*;
///
/// # async fn demo() -> Result<(), HearthError> {
/// let server = ChatServer::builder()
///     .bind("0.0.0.0:7878")
///     .database(DatabaseLocation::File("chat.db".into()))
///     .build()
///     .await?;
/// server.run().await
/// # }
/// ```
pub struct ChatServerBuilder {
    config: ServerConfig,
    store: Option<Arc<dyn Store>>,
}

impl ChatServerBuilder {
    /// Creates a new builder with default settings.
    pub fn new() -> Self {
        Self {
            config: ServerConfig::default(),
            store: None,
        }
    }

    /// Replaces the whole configuration.
    pub fn config(mut self, config: ServerConfig) -> Self {
        self.config = config;
        self
    }

    /// Sets the address to bind the server to.
    pub fn bind(mut self, addr: &str) -> Self {
        self.config.bind_addr = addr.to_string();
        self
    }

    /// Sets the per-connection limits and timeouts.
    pub fn session_config(mut self, config: SessionConfig) -> Self {
        self.config.session = config;
        self
    }

    /// Sets what happens when an online user logs in again.
    pub fn duplicate_login(mut self, policy: DuplicateLoginPolicy) -> Self {
        self.config.duplicate_login = policy;
        self
    }

    pub fn database(mut self, location: DatabaseLocation) -> Self {
        self.config.database = location;
        self
    }

    pub fn max_frame_size(mut self, bytes: usize) -> Self {
        self.config.max_frame_size = bytes;
        self
    }

    /// Sets the bcrypt cost used when hashing new passwords.
    pub fn password_cost(mut self, cost: u32) -> Self {
        self.config.password_cost = cost;
        self
    }

    /// Uses an already opened store instead of [`database`](Self::database).
    pub fn store(mut self, store: Arc<dyn Store>) -> Self {
        self.store = Some(store);
        self
    }

    /// Binds a raw TCP listener.
    pub async fn build(self) -> Result<ChatServer<TcpTransport>, HearthError> {
        let transport = TcpTransport::bind(&self.config.bind_addr).await?;
        self.finish(transport)
    }

    /// Binds a WebSocket listener.
    pub async fn build_websocket(self) -> Result<ChatServer<WebSocketTransport>, HearthError> {
        let transport = WebSocketTransport::bind(&self.config.bind_addr).await?;
        self.finish(transport)
    }

    fn finish<T: Transport>(self, transport: T) -> Result<ChatServer<T>, HearthError> {
        let store = match self.store {
            Some(store) => store,
            None => open_store(&self.config.database)?,
        };
        let router = Router::new(store, &self.config);
        let (shutdown_tx, shutdown_rx) = watch::channel(false);

        Ok(ChatServer {
            transport,
            router,
            session_config: Arc::new(self.config.session),
            shutdown_tx: Arc::new(shutdown_tx),
            shutdown_rx,
        })
    }
}

impl Default for ChatServerBuilder {
    fn default() -> Self {
        Self::new()
    }
}

fn open_store(location: &DatabaseLocation) -> Result<Arc<dyn Store>, HearthError> {
    let store = match location {
        DatabaseLocation::InMemory => SqliteStore::open_in_memory()?,
        DatabaseLocation::File(path) => SqliteStore::open(path)?,
    };
    tracing::info!(?location, "store opened");
    Ok(Arc::new(store))
}

/// Asks a running server to shut down. Cheap to clone.
#[derive(Clone)]
pub struct ShutdownHandle {
    tx: Arc<watch::Sender<bool>>,
}

impl ShutdownHandle {
    /// Stops accepting connections, closes every session, and lets
    /// [`ChatServer::run`] return once they have flushed.
    pub fn shutdown(&self) {
        self.tx.send_replace(true);
    }
}

/// A hearth chat server bound to a transport.
///
/// Call [`run()`](Self::run) to start accepting connections.
pub struct ChatServer<T: Transport = TcpTransport> {
    transport: T,
    router: Arc<Router>,
    session_config: Arc<SessionConfig>,
    shutdown_tx: Arc<watch::Sender<bool>>,
    shutdown_rx: watch::Receiver<bool>,
}

impl ChatServer {
    /// Creates a new builder.
    pub fn builder() -> ChatServerBuilder {
        ChatServerBuilder::new()
    }
}

impl<T: Transport> ChatServer<T> {
    /// Returns the local address the server is bound to.
    pub fn local_addr(&self) -> Result<SocketAddr, HearthError> {
        Ok(self.transport.local_addr()?)
    }

    pub fn shutdown_handle(&self) -> ShutdownHandle {
        ShutdownHandle {
            tx: Arc::clone(&self.shutdown_tx),
        }
    }

    pub fn registry(&self) -> Arc<SessionRegistry> {
        Arc::clone(self.router.registry())
    }

    pub fn directory(&self) -> Arc<ChannelDirectory> {
        Arc::clone(self.router.directory())
    }

    pub fn store(&self) -> Arc<dyn Store> {
        Arc::clone(self.router.store())
    }

    /// Runs the accept loop until [`ShutdownHandle::shutdown`] is called.
    ///
    /// Each connection runs in its own task. On shutdown the listener is
    /// dropped first, then every session is closed and given its flush
    /// timeout before the remaining tasks are aborted.
    pub async fn run(mut self) -> Result<(), HearthError> {
        tracing::info!(addr = ?self.transport.local_addr().ok(), "hearth server running");
        let mut connections = JoinSet::new();

        loop {
            if *self.shutdown_rx.borrow_and_update() {
                break;
            }
            tokio::select! {
                changed = self.shutdown_rx.changed() => {
                    if changed.is_err() {
                        break;
                    }
                }
                accepted = self.transport.accept() => match accepted {
                    Ok(conn) => {
                        let router = Arc::clone(&self.router);
                        let codec = Arc::clone(self.router.codec());
                        let config = Arc::clone(&self.session_config);
                        connections.spawn(async move {
                            if let Err(e) = handle_connection(conn, router, codec, config).await {
                                tracing::debug!(error = %e, "connection ended with error");
                            }
                        });
                    }
                    Err(e) => {
                        tracing::error!(error = %e, "accept failed");
                    }
                },
                Some(finished) = connections.join_next(), if !connections.is_empty() => {
                    if let Err(e) = finished {
                        if e.is_panic() {
                            tracing::error!(error = %e, "connection task panicked");
                        }
                    }
                }
            }
        }

        tracing::info!(connections = connections.len(), "shutting down");
        drop(self.transport);
        self.router.begin_shutdown();

        let grace = self.session_config.flush_timeout + SHUTDOWN_GRACE;
        let drained = tokio::time::timeout(grace, async {
            while connections.join_next().await.is_some() {}
        })
        .await;
        if drained.is_err() {
            tracing::warn!(
                remaining = connections.len(),
                "aborting connections that did not finish"
            );
            connections.shutdown().await;
        }

        tracing::info!("hearth server stopped");
        Ok(())
    }
}
