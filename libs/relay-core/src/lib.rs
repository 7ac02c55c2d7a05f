//! Protocol-agnostic TCP relay.
//!
//! Every connection accepted by a [`Listener`] becomes a [`Session`]
//! relaying bytes to that listener's target, with TLS optionally
//! terminated on the inbound leg and originated on the outbound leg.
//! A [`RelayManager`] drives listeners through startup and graceful
//! shutdown.

pub mod cache;
pub mod error;
pub mod factory;
pub mod listener;
pub mod manager;
pub mod session;
pub mod stream;
pub mod tls;

pub use cache::{CacheStore, CachedSessionFactory, CACHE_KEY, DEFAULT_CACHE_TTL};
pub use error::RelayError;
pub use factory::{DefaultSessionFactory, SessionFactory};
pub use listener::{Listener, ListenerConfig};
pub use manager::{LifecycleState, RelayManager, StopMode, DEFAULT_DRAIN_POLL_INTERVAL};
pub use session::{
    LegId, LegState, NoopHooks, OutboundConnector, Session, SessionContext, SessionHandle,
    SessionHooks, SessionId,
};
pub use stream::{AsyncReadWrite, BoxedStream};
pub use tls::{ClientCert, TlsOrigination, TlsTermination};
