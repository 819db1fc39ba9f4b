//! Engine error types.

use thiserror::Error;

/// Errors that can occur while opening or operating audio/MIDI drivers.
#[derive(Error, Debug)]
pub enum DriverError {
    /// No driver kind registered under the requested name
    #[error("Unknown driver kind: {0}")]
    UnknownKind(String),

    /// Device not found
    #[error("Device not found: {0}")]
    DeviceNotFound(String),

    /// Device already opened by this engine
    #[error("Device busy: {0}")]
    DeviceBusy(String),

    /// Requested direction or format not supported by the device
    #[error("Unsupported configuration: {0}")]
    Unsupported(String),

    /// Failed to build the backend stream
    #[error("Failed to build audio stream: {0}")]
    StreamBuild(String),

    /// Failed to start the backend stream
    #[error("Failed to start audio stream: {0}")]
    StreamPlay(String),

    /// Backend-specific failure
    #[error("Driver backend error: {0}")]
    Backend(String),
}

/// Result type for driver operations.
pub type DriverResult<T> = Result<T, DriverError>;

/// Errors that can occur while starting or running a capture sink.
#[derive(Error, Debug)]
pub enum CaptureError {
    /// File extension does not map to a supported encoder
    #[error("Unsupported capture format: {0}")]
    UnsupportedFormat(String),

    /// Capture file could not be created
    #[error("Failed to create capture file: {0}")]
    Io(#[from] std::io::Error),

    /// Encoder rejected the data or configuration
    #[error("Capture encoding failed: {0}")]
    Encoding(String),
}

/// Result type for capture operations.
pub type CaptureResult<T> = Result<T, CaptureError>;
