//! Unified stream type.
//!
//! Legs operate on a boxed stream so that plaintext TCP and TLS
//! connections flow through the same relay path.

use tokio::io::{AsyncRead, AsyncWrite};

/// Combined trait for async read + write.
pub trait AsyncReadWrite: AsyncRead + AsyncWrite + Send + Unpin {}

impl<T: AsyncRead + AsyncWrite + Send + Unpin> AsyncReadWrite for T {}

/// The stream type a leg is built from: plain TCP, TLS-terminated
/// inbound, or TLS-originated outbound.
pub type BoxedStream = Box<dyn AsyncReadWrite>;
