//! Error types for the openvdp datapath

use thiserror::Error;

/// Fatal datapath errors
///
/// These surface only from module initialisation; per-packet failures are
/// packet dispositions and never errors.
#[derive(Error, Debug)]
pub enum CoreError {
    /// Table geometry is unusable
    #[error("invalid table geometry: {0}")]
    InvalidConfig(String),

    /// Backing memory could not be allocated
    #[error("allocation failed: {0}")]
    AllocationFailed(String),
}

/// Result type for the openvdp datapath
pub type CoreResult<T> = Result<T, CoreError>;
