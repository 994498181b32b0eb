use std::future::Future;
use std::io;
use std::net::SocketAddr;
use thiserror::Error;

/// Reply time for targets that never answered. Guaranteed larger than any
/// real measurement; filtered out before aggregation, never an error.
pub const NO_RESPONSE_MS: f64 = 10_000_000.0;

#[derive(Debug, Error)]
pub enum ProbeError {
    #[error("transport is not bound")]
    NotBound,
    #[error("bind failed: {0}")]
    Bind(#[source] io::Error),
    #[error("socket i/o failed: {0}")]
    Io(#[from] io::Error),
}

/// Outcome of one timed exchange with one target.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct ProbeReply {
    pub target: SocketAddr,
    /// Round-trip time in milliseconds, or [`NO_RESPONSE_MS`].
    pub time_ms: f64,
}

impl ProbeReply {
    pub fn answered(&self) -> bool {
        self.time_ms < NO_RESPONSE_MS
    }
}

/// One timed ping exchange per target, no retries.
///
/// The transport owns its per-batch timeout; callers never supply one. A
/// target that stays silent comes back as a [`ProbeReply`] carrying
/// [`NO_RESPONSE_MS`] rather than an error.
pub trait ProbeTransport: Send + Sync {
    /// Bind local sockets. Awaited once before any probing; idempotent.
    fn bind(&self) -> impl Future<Output = Result<(), ProbeError>> + Send;

    /// Perform one exchange per target and return one reply per target, in
    /// the same order.
    fn ping_batch(
        &self,
        targets: &[SocketAddr],
    ) -> impl Future<Output = Result<Vec<ProbeReply>, ProbeError>> + Send;
}
