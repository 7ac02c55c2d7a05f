//! TCP listener and session registry.
//!
//! A listener binds one local address and relays every accepted
//! connection to one configured target. It optionally terminates TLS
//! on the inbound leg and originates TLS on the outbound leg. Each
//! accepted connection becomes a session, tracked in the listener's
//! registry until the session reports itself closed.

use std::collections::HashMap;
use std::io;
use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use tokio::net::{TcpListener, TcpStream};
use tokio::sync::{mpsc, watch, RwLock};
use tokio_rustls::rustls::pki_types::ServerName;
use tokio_rustls::{TlsAcceptor, TlsConnector};
use tracing::{debug, error, info, warn, Instrument};

use crate::error::RelayError;
use crate::factory::SessionFactory;
use crate::session::{next_session_id, OutboundConnector, SessionContext, SessionId};
use crate::stream::BoxedStream;
use crate::tls::{build_acceptor, build_connector, TlsOrigination, TlsTermination};

/// Configuration for a relay listener.
#[derive(Debug, Clone)]
pub struct ListenerConfig {
    /// Address to bind to.
    pub bind_addr: SocketAddr,
    /// Target host to relay to.
    pub target_host: String,
    /// Target port to relay to.
    pub target_port: u16,
    /// Terminate TLS on accepted connections.
    pub inbound_tls: Option<TlsTermination>,
    /// Originate TLS on connections to the target.
    pub outbound_tls: Option<TlsOrigination>,
}

impl ListenerConfig {
    /// Plain TCP relay from `bind_addr` to `target_host:target_port`.
    pub fn new(bind_addr: SocketAddr, target_host: impl Into<String>, target_port: u16) -> Self {
        Self {
            bind_addr,
            target_host: target_host.into(),
            target_port,
            inbound_tls: None,
            outbound_tls: None,
        }
    }
}

/// Tracks the live sessions of one listener.
#[derive(Default)]
pub(crate) struct SessionRegistry {
    sessions: RwLock<HashMap<SessionId, SocketAddr>>,
}

impl SessionRegistry {
    async fn insert(&self, id: SessionId, peer: SocketAddr) {
        self.sessions.write().await.insert(id, peer);
    }

    async fn remove(&self, id: SessionId) -> bool {
        self.sessions.write().await.remove(&id).is_some()
    }

    async fn len(&self) -> usize {
        self.sessions.read().await.len()
    }
}

/// Dials the listener's target, originating TLS when configured.
struct TargetConnector {
    target: String,
    tls: Option<(TlsConnector, ServerName<'static>)>,
}

#[async_trait]
impl OutboundConnector for TargetConnector {
    async fn connect(&self) -> io::Result<BoxedStream> {
        let stream = TcpStream::connect(&self.target).await?;
        let _ = stream.set_nodelay(true);
        match &self.tls {
            Some((connector, name)) => {
                let tls = connector.connect(name.clone(), stream).await?;
                Ok(Box::new(tls))
            }
            None => Ok(Box::new(stream)),
        }
    }
}

/// A listener relaying accepted connections to a single target.
pub struct Listener {
    config: ListenerConfig,
    /// Taken by [`Listener::run`]; dropping it on shutdown closes
    /// the bound socket.
    listener: std::sync::Mutex<Option<TcpListener>>,
    local_addr: SocketAddr,
    factory: Arc<dyn SessionFactory>,
    registry: Arc<SessionRegistry>,
    acceptor: Option<TlsAcceptor>,
    ctx: SessionContext,
    force_close_tx: watch::Sender<bool>,
    shutdown_tx: watch::Sender<bool>,
}

impl Listener {
    /// Bind the listener and start its registry removal pump. The
    /// accept loop does not run until [`Listener::run`] is called.
    pub async fn bind(
        config: ListenerConfig,
        factory: Arc<dyn SessionFactory>,
    ) -> Result<Self, RelayError> {
        let listener = TcpListener::bind(config.bind_addr).await?;
        let local_addr = listener.local_addr()?;

        let acceptor = config.inbound_tls.as_ref().map(build_acceptor).transpose()?;
        let tls = config
            .outbound_tls
            .as_ref()
            .map(build_connector)
            .transpose()?;

        let connector = Arc::new(TargetConnector {
            target: format!("{}:{}", config.target_host, config.target_port),
            tls,
        });

        let registry = Arc::new(SessionRegistry::default());
        let (removal_tx, removal_rx) = mpsc::unbounded_channel();
        let (force_close_tx, force_close_rx) = watch::channel(false);
        let (shutdown_tx, _) = watch::channel(false);

        tokio::spawn(run_removal_pump(
            removal_rx,
            Arc::clone(&registry),
            Arc::clone(&factory),
        ));

        info!(
            bind_addr = %local_addr,
            target_addr = %connector.target,
            inbound_tls = config.inbound_tls.is_some(),
            outbound_tls = config.outbound_tls.is_some(),
            "listener bound"
        );

        Ok(Self {
            config,
            listener: std::sync::Mutex::new(Some(listener)),
            local_addr,
            factory,
            registry,
            acceptor,
            ctx: SessionContext {
                connector,
                removal_tx,
                force_close: force_close_rx,
            },
            force_close_tx,
            shutdown_tx,
        })
    }

    /// The local address this listener is bound to.
    pub fn local_addr(&self) -> SocketAddr {
        self.local_addr
    }

    /// Number of live sessions in the registry.
    pub async fn session_count(&self) -> usize {
        self.registry.len().await
    }

    /// Stop accepting new connections. Live sessions are unaffected.
    pub fn shutdown_accept(&self) {
        let _ = self.shutdown_tx.send(true);
    }

    /// Abruptly tear down every live session of this listener.
    pub fn force_close_sessions(&self) {
        let _ = self.force_close_tx.send(true);
    }

    /// Run the accept loop until [`Listener::shutdown_accept`], then
    /// close the bound socket. Live sessions keep running.
    pub async fn run(self: Arc<Self>) -> io::Result<()> {
        let Some(listener) = self.listener.lock().unwrap().take() else {
            return Ok(());
        };
        let mut shutdown_rx = self.shutdown_tx.subscribe();
        info!(bind_addr = %self.local_addr, "listener started");

        // Re-checked at the top of every iteration: subscribing marks
        // the current value as seen, so a shutdown sent before this
        // point would otherwise never trip `changed()`.
        while !*shutdown_rx.borrow_and_update() {
            let accepted = tokio::select! {
                accepted = listener.accept() => accepted,
                _ = shutdown_rx.changed() => continue,
            };

            match accepted {
                Ok((stream, peer_addr)) => {
                    let _ = stream.set_nodelay(true);
                    self.start_session(stream, peer_addr).await;
                }
                Err(e) => {
                    error!(error = %e, "accept error");
                    // Brief sleep to avoid a tight loop on persistent
                    // errors
                    tokio::time::sleep(Duration::from_millis(100)).await;
                }
            }
        }

        drop(listener);
        info!(bind_addr = %self.local_addr, "listener stopped accepting");
        Ok(())
    }

    /// Register and spawn a session for one accepted connection.
    ///
    /// The id is registered before the factory runs so the removal
    /// pump can never see an id it does not know about.
    async fn start_session(&self, stream: TcpStream, peer_addr: SocketAddr) {
        let id = next_session_id();
        self.registry.insert(id, peer_addr).await;
        debug!(id, peer = %peer_addr, "connection accepted");

        let acceptor = self.acceptor.clone();
        let factory = Arc::clone(&self.factory);
        let registry = Arc::clone(&self.registry);
        let ctx = self.ctx.clone();
        let mut force_close = self.ctx.force_close.clone();

        // The TLS handshake must not stall the accept loop, so the
        // rest of session setup happens off it. The handshake races
        // the force-close signal: a registered connection that is
        // still mid-handshake must not be able to hold up a drain.
        tokio::spawn(
            async move {
                let inbound: BoxedStream = match acceptor {
                    Some(acceptor) => {
                        let accepted = tokio::select! {
                            accepted = acceptor.accept(stream) => Some(accepted),
                            _ = force_closed(&mut force_close) => None,
                        };
                        match accepted {
                            Some(Ok(tls)) => Box::new(tls),
                            Some(Err(e)) => {
                                warn!(id, peer = %peer_addr, error = %e, "tls handshake failed");
                                registry.remove(id).await;
                                factory.dispose(id);
                                return;
                            }
                            None => {
                                debug!(id, peer = %peer_addr, "handshake abandoned on force close");
                                registry.remove(id).await;
                                factory.dispose(id);
                                return;
                            }
                        }
                    }
                    None => Box::new(stream),
                };
                factory.create(id, inbound, peer_addr, &ctx);
            }
            .instrument(tracing::debug_span!("accept", id, peer = %peer_addr)),
        );
    }

    /// Target this listener relays to, as `host:port`.
    pub fn target(&self) -> String {
        format!("{}:{}", self.config.target_host, self.config.target_port)
    }
}

/// Resolves when the listener force-closes its sessions. Pends
/// forever if the listener is gone and no force-close can ever land.
async fn force_closed(rx: &mut watch::Receiver<bool>) {
    if rx.wait_for(|forced| *forced).await.is_err() {
        std::future::pending::<()>().await;
    }
}

/// Drains session removal notices: unregisters the session and lets
/// the factory observe its disposal.
async fn run_removal_pump(
    mut removal_rx: mpsc::UnboundedReceiver<SessionId>,
    registry: Arc<SessionRegistry>,
    factory: Arc<dyn SessionFactory>,
) {
    while let Some(id) = removal_rx.recv().await {
        let removed = registry.remove(id).await;
        debug_assert!(removed, "removal notice for an unregistered session");
        if removed {
            debug!(id, "session removed");
        }
        factory.dispose(id);
    }
}
