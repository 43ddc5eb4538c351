//! Error taxonomy shared across the connection managers, pipeline, and
//! virtual-pad backends.

use thiserror::Error;

#[derive(Debug, Error)]
pub enum GcError {
    /// Transport enumeration returned no match. Retryable.
    #[error("device not found: {0}")]
    DeviceNotFound(String),

    /// USB write, HID open, or BLE connect failed. Retryable.
    #[error("transport error: {0}")]
    Transport(String),

    /// Command timeout or unexpected response during the SW2 handshake.
    #[error("protocol error: {0}")]
    Protocol(String),

    /// The requested virtual-pad backend is not supported on this host.
    #[error("emulation unavailable: {reason}")]
    EmulationUnavailable { reason: String },

    /// The Dolphin pipe has no reader attached.
    #[error("pipe not ready: {remedy}")]
    PipeNotReady { remedy: String },

    /// Normalization was attempted with a degenerate range.
    #[error("calibration error: {0}")]
    Calibration(String),

    /// Settings load/save failed.
    #[error("persistence error: {0}")]
    Persistence(String),
}

impl From<std::io::Error> for GcError {
    fn from(e: std::io::Error) -> Self {
        GcError::Transport(e.to_string())
    }
}

pub type Result<T> = std::result::Result<T, GcError>;
