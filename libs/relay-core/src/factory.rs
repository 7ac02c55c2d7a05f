//! Session creation seam.
//!
//! The listener delegates session construction to a factory so that
//! session variants (plain relay, cached replay) can be swapped in
//! without touching the accept path.

use std::net::SocketAddr;

use crate::session::{NoopHooks, Session, SessionContext, SessionHandle, SessionId};
use crate::stream::BoxedStream;

/// Creates a session for each accepted connection and observes its
/// removal. One factory instance serves all sessions of a listener.
pub trait SessionFactory: Send + Sync {
    /// Called for each accepted (and, if configured, TLS-terminated)
    /// inbound connection. Must spawn a session and return its handle.
    fn create(
        &self,
        id: SessionId,
        inbound: BoxedStream,
        peer: SocketAddr,
        ctx: &SessionContext,
    ) -> SessionHandle;

    /// Called after the session has been removed from the registry.
    fn dispose(&self, _id: SessionId) {}
}

/// The default factory: plain relay sessions with no interception.
pub struct DefaultSessionFactory;

impl SessionFactory for DefaultSessionFactory {
    fn create(
        &self,
        id: SessionId,
        inbound: BoxedStream,
        peer: SocketAddr,
        ctx: &SessionContext,
    ) -> SessionHandle {
        Session::spawn_relay(id, inbound, peer, Box::new(NoopHooks), ctx)
    }
}
