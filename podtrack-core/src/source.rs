//! Snapshot source trait implemented by streaming-provider clients.

use crate::snapshot::Snapshot;
use async_trait::async_trait;

/// A source of playback snapshots.
///
/// Implementations poll a streaming provider's "currently playing" surface
/// and report one [`Snapshot`] per call. Implementations must:
///
/// - Absorb transient failures (network, HTTP, auth, decode) and return
///   [`Snapshot::Unavailable`] rather than propagating an error - the
///   tracking loop treats that as a no-op tick, never a stop.
/// - Return [`Snapshot::Empty`] only when the provider positively reports
///   that nothing is playing.
#[async_trait]
pub trait SnapshotSource: Send + Sync {
    /// Returns a human-readable name for this source.
    fn name(&self) -> &'static str;

    /// Poll the provider once for current playback state.
    async fn poll(&self) -> Snapshot;
}
