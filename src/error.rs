//! Error taxonomy (§7).
//!
//! Only admission errors and protocol anomalies are represented here.
//! Transient I/O (`EAGAIN`/`EINTR`) is filtered out at the call site before
//! it ever reaches a `Result`; terminal flow errors live on `Flow::last_error`
//! instead of being propagated, per §7 "per-flow errors never propagate out
//! of the flow."

use thiserror::Error;

#[derive(Debug, Error)]
pub enum FlowgrindError {
    #[error("admission failed: {0}")]
    Admission(String),

    #[error(transparent)]
    Io(#[from] std::io::Error),

    #[error("protocol anomaly: {0}")]
    Protocol(String),
}

pub type Result<T> = std::result::Result<T, FlowgrindError>;

/// True for errno values that never surface as an error (§7 "Transient I/O").
pub fn is_transient(err: &std::io::Error) -> bool {
    matches!(
        err.kind(),
        std::io::ErrorKind::WouldBlock | std::io::ErrorKind::Interrupted
    )
}
