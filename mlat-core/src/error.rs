//! Errors for configuration-time and handshake-time failures.
//!
//! Most data-plane rejections (bad CRC, CPR fail, clock-pair outlier, solver
//! non-convergence) are *not* errors here — they're `None`/`false`/silent
//! drops, matching the taxonomy in the spec's error-handling section. This
//! enum is reserved for the handful of cases that should fail fast or
//! propagate to a caller.

use thiserror::Error;

#[derive(Debug, Error)]
pub enum MlatError {
    #[error("unknown clock type: {0}")]
    UnknownClockType(String),

    #[error("user already connected: {0}")]
    DuplicateUser(String),

    #[error("authentication failed: {0}")]
    AuthFailed(String),

    #[error("invalid partition spec: index {index} of {count}")]
    InvalidPartition { index: u32, count: u32 },

    #[error("io error: {0}")]
    Io(#[from] std::io::Error),

    #[error("json error: {0}")]
    Json(#[from] serde_json::Error),
}

pub type Result<T> = std::result::Result<T, MlatError>;
