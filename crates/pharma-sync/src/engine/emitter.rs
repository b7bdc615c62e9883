//! Status observers.

use pharma_core::SyncStatus;

/// Receives engine notifications (implemented by the composition root).
///
/// Called after the engine has released its internal lock, so an
/// implementation may query the engine.
pub trait SyncEventEmitter: Send + Sync {
    /// The effective status changed.
    fn emit_status(&self, status: SyncStatus);

    /// An event was acknowledged by the remote.
    fn emit_progress(&self, pending: usize, flushed: usize);

    /// A flush or connect attempt failed.
    fn emit_error(&self, message: &str, retryable: bool);
}

/// No-op event emitter.
pub struct NoOpEmitter;

impl SyncEventEmitter for NoOpEmitter {
    fn emit_status(&self, _status: SyncStatus) {}
    fn emit_progress(&self, _pending: usize, _flushed: usize) {}
    fn emit_error(&self, _message: &str, _retryable: bool) {}
}
