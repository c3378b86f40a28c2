//! Error taxonomy.
//!
//! The runtime distinguishes truly fatal invariant violations (which must
//! terminate the process rather than be caught, because anything executed
//! afterward would see a corrupted heap) from soft, recoverable conditions.
//! See `lose` for the former and `RuntimeError` for the latter.

use thiserror::Error;

/// Recoverable or caller-actionable error conditions. Never constructed for
/// a corrupted-heap situation -- that path calls [`lose`] and never returns.
#[derive(Debug, Error)]
pub enum RuntimeError {
    #[error("out of memory in {region}: requested {requested} words, {available} available")]
    OutOfMemory {
        region: &'static str,
        requested: usize,
        available: usize,
    },

    #[error("failed to reserve address range at {address:#x} ({length} bytes): {reason}")]
    ReservationFailed {
        address: usize,
        length: usize,
        reason: String,
    },

    #[error("core image error: {0}")]
    CoreImage(String),

    #[error("build id mismatch: core file has {found:?}, runtime expects {expected:?}")]
    BuildIdMismatch { found: String, expected: String },

    #[error("purify refused: {count} interrupt context(s) still active")]
    PurifyRefused { count: usize },

    #[error("configuration error: {0}")]
    Configuration(String),

    #[error("signal installation failed: {0}")]
    SignalSetup(String),

    #[error("thread registry error: {0}")]
    ThreadRegistry(String),

    #[error("lock poisoned: {0}")]
    LockPoisoned(String),
}

impl<T> From<std::sync::PoisonError<T>> for RuntimeError {
    fn from(e: std::sync::PoisonError<T>) -> Self {
        RuntimeError::LockPoisoned(e.to_string())
    }
}

pub type Result<T> = std::result::Result<T, RuntimeError>;

/// Terminate the process after logging a diagnostic.
///
/// This is the runtime's only response to a corrupted header word, a
/// missing dispatch-table entry, exceeded interrupt nesting, an allocation
/// failure during initialization, a missing core file, or a build-id
/// mismatch: every one of these means later execution would read or write
/// through a heap the collector no longer understands, so nothing past this
/// call is safe to run.
#[track_caller]
pub fn lose(reason: impl std::fmt::Display) -> ! {
    let location = std::panic::Location::caller();
    tracing::error!(%location, %reason, "fatal runtime invariant violated");
    eprintln!("scarab-core: fatal error at {location}: {reason}");
    std::process::abort()
}
