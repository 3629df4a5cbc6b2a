//! Core server: wires the store into the messaging components and accepts
//! connections.
//!
//! Every accepted connection gets its own session task. A semaphore caps the
//! number of concurrent sessions; connections beyond the cap get a `sys`
//! error and are closed straight away.

use crate::auth::RateLimiter;
use crate::channel::ChannelDirectory;
use crate::config::{ServerConfig, StoreBackend};
use crate::controller::Controller;
use crate::presence::Presence;
use crate::session::multiplexer::{self, SessionSettings};
use crate::store::{MemoryStore, RedisStore, Store};
use crate::transport::websocket::{self, WebSocketConnection};
use crate::users::UserRegistry;
use futures_util::StreamExt;
use murmur_core::{frame_encode, MurmurError, MurmurResult, ServerEnvelope};
use std::future::Future;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{broadcast, mpsc, Semaphore};
use tracing::{debug, info, warn};

/// How long shutdown waits for sessions to say goodbye.
const SHUTDOWN_GRACE: Duration = Duration::from_secs(5);

/// Build the store adapter selected in the config.
pub async fn connect_store(config: &ServerConfig) -> MurmurResult<Arc<dyn Store>> {
    let store: Arc<dyn Store> = match &config.store {
        StoreBackend::Memory => Arc::new(MemoryStore::new()),
        StoreBackend::Redis { url } => Arc::new(RedisStore::connect(url).await?),
    };
    info!(backend = store.name(), "store ready");
    Ok(store)
}

/// The murmur server instance.
pub struct MurmurServer {
    controller: Arc<Controller>,
    settings: SessionSettings,
    max_connections: usize,
    connections: Arc<Semaphore>,
    /// Broadcast sender for server shutdown notification.
    shutdown_tx: broadcast::Sender<()>,
}

impl MurmurServer {
    /// Create a server over an already connected store.
    pub fn new(config: ServerConfig, store: Arc<dyn Store>) -> Self {
        let presence = Presence::new(store.clone(), config.presence_ttl);
        let users = UserRegistry::new(
            store.clone(),
            presence.clone(),
            config.access_key_secret.clone(),
            config.access_key_ttl_secs,
        );
        let channels = ChannelDirectory::new(store, config.max_history_page);
        let controller = Controller::new(
            channels,
            presence,
            users,
            RateLimiter::per_minute(config.auth_attempts_per_minute),
            config.max_message_chars,
        );

        Self {
            controller: Arc::new(controller),
            settings: SessionSettings {
                max_frame_bytes: config.max_frame_bytes,
                outbound_queue: config.outbound_queue,
                close_on_unauthorized: config.close_on_unauthorized,
            },
            max_connections: config.max_connections,
            connections: Arc::new(Semaphore::new(config.max_connections)),
            shutdown_tx: broadcast::channel(1).0,
        }
    }

    /// Accept connections from `incoming` until `shutdown` resolves or the
    /// listener goes away, then tell every session to close.
    pub async fn run<F>(
        self,
        mut incoming: mpsc::Receiver<WebSocketConnection>,
        shutdown: F,
    ) -> MurmurResult<()>
    where
        F: Future<Output = ()>,
    {
        tokio::pin!(shutdown);
        let mut gc = tokio::time::interval(Duration::from_secs(60));

        info!(max_connections = self.max_connections, "murmur-server ready");

        loop {
            tokio::select! {
                _ = &mut shutdown => {
                    info!("shutdown requested");
                    break;
                }
                conn = incoming.recv() => {
                    match conn {
                        Some(conn) => self.accept(conn),
                        None => {
                            info!("listener closed, shutting down");
                            break;
                        }
                    }
                }
                _ = gc.tick() => {
                    self.controller.auth_limiter().gc();
                }
            }
        }

        // Stop accepting, then broadcast shutdown to all connected clients
        drop(incoming);
        info!("broadcasting shutdown to connected clients");
        let _ = self.shutdown_tx.send(());

        let all = u32::try_from(self.max_connections).unwrap_or(u32::MAX);
        match tokio::time::timeout(SHUTDOWN_GRACE, self.connections.acquire_many(all)).await {
            Ok(Ok(_)) => debug!("all sessions closed"),
            Ok(Err(e)) => return Err(MurmurError::Other(format!("connection gate closed: {e}"))),
            Err(_) => warn!("sessions still open after shutdown grace period"),
        }
        Ok(())
    }

    fn accept(&self, conn: WebSocketConnection) {
        let permit = match self.connections.clone().try_acquire_owned() {
            Ok(permit) => permit,
            Err(_) => {
                warn!(remote = %conn.remote_addr, max = self.max_connections, "connection limit reached");
                tokio::spawn(reject(conn));
                return;
            }
        };

        let controller = self.controller.clone();
        let settings = self.settings.clone();
        let shutdown_rx = self.shutdown_tx.subscribe();
        tokio::spawn(async move {
            multiplexer::serve(conn, controller, settings, shutdown_rx).await;
            drop(permit);
        });
    }
}

/// Tell an over-limit client why it is being turned away, then close.
async fn reject(conn: WebSocketConnection) {
    let (mut sink, _) = conn.ws_stream.split();
    let err = MurmurError::RateLimited("too many connections".into());
    if let Ok(frame) = frame_encode(&ServerEnvelope::error(&err)) {
        let _ = websocket::ws_send_text(&mut sink, frame).await;
    }
    websocket::ws_close(&mut sink).await;
}

/// Bind the configured address and serve until `shutdown` resolves.
pub async fn serve<F>(config: ServerConfig, shutdown: F) -> MurmurResult<()>
where
    F: Future<Output = ()>,
{
    let store = connect_store(&config).await?;
    let (addr, incoming) =
        websocket::start_listener(&config.bind_addr(), config.max_frame_bytes).await?;
    info!(addr = %addr, "listening");
    MurmurServer::new(config, store).run(incoming, shutdown).await
}
