//! Error types for the link-adaptation components

use std::path::PathBuf;

/// Channel quality sampler errors
#[derive(Debug, thiserror::Error)]
pub enum SamplerError {
    /// Enumeration found no instrument
    #[error("No measurement device found")]
    NoDeviceFound,

    /// Every available interface refused the connection
    #[error("Connection failed on all interfaces: {attempted:?}")]
    ConnectFailed { attempted: Vec<String> },

    /// Instrument is locked by another process
    #[error("Instrument is busy")]
    ResourceBusy,

    /// Instrument I/O error during the sweep
    #[error("Sweep failed: {0}")]
    SweepFailed(String),

    #[error("Measurement timed out")]
    MeasurementTimeout,

    /// Sweep returned unusable data
    #[error("Measurement corrupt: {0}")]
    MeasurementCorrupt(String),
}

impl SamplerError {
    /// No device, or no interface would connect.
    pub fn is_instrument_unavailable(&self) -> bool {
        matches!(self, SamplerError::NoDeviceFound | SamplerError::ConnectFailed { .. })
    }
}

/// Decision protocol errors
#[derive(Debug, thiserror::Error)]
pub enum ProtocolError {
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    #[error("Connection closed by peer")]
    Closed,

    #[error("Frame exceeds {0} bytes")]
    FrameTooLong(usize),

    #[error("Timed out waiting for peer")]
    Timeout,

    #[error("Malformed message: {0}")]
    Malformed(String),

    /// Peer answered with an error record
    #[error("Remote error: {0}")]
    Remote(String),
}

/// Media subprocess errors
#[derive(Debug, thiserror::Error)]
pub enum TransportError {
    #[error("Failed to spawn {program}: {source}")]
    Spawn {
        program: String,
        #[source]
        source: std::io::Error,
    },

    #[error("{program} exited with status {code:?}")]
    Exit { program: String, code: Option<i32> },

    /// Terminated before it finished on its own
    #[error("{program} stopped early")]
    Stopped { program: String },

    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),
}

/// Recording session errors
#[derive(Debug, thiserror::Error)]
pub enum RecordError {
    /// A session is already active; requests are not queued
    #[error("Recording already in progress")]
    RecordingInProgress,

    #[error("Receiver is not running")]
    NotRunning,

    #[error("Recording I/O error: {0}")]
    Io(#[from] std::io::Error),

    #[error("Failed to write session metadata: {0}")]
    Metadata(#[from] serde_json::Error),
}

/// Audio enhancement errors
#[derive(Debug, thiserror::Error)]
pub enum EnhanceError {
    #[error("No audio recording found in {0}")]
    NoRecording(PathBuf),

    #[error("Failed to spawn enhancer {program}: {source}")]
    Spawn {
        program: String,
        #[source]
        source: std::io::Error,
    },

    #[error("Enhancer failed: {0}")]
    Failed(String),

    #[error("Enhancer timed out after {0}s")]
    Timeout(u64),

    #[error("Enhancer produced no output at {0}")]
    MissingOutput(PathBuf),

    #[error("Enhancement I/O error: {0}")]
    Io(#[from] std::io::Error),

    #[error("Invalid recording metadata: {0}")]
    Metadata(#[from] serde_json::Error),
}
