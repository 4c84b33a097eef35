//! Channel error types

use thiserror::Error;

/// Errors surfaced by the channel and its platform layer.
///
/// Backpressure is never an error: a full channel makes `send` return
/// `Ok(false)` and an empty one makes `receive` return `Ok(false)`. The
/// variants here are either environment failures that abort startup or
/// invalid inputs that no amount of retrying can fix.
#[derive(Error, Debug)]
pub enum ChannelError {
    /// Platform-specific error
    #[error("Platform error: {0}")]
    Platform(String),

    /// Segment not found
    #[error("Shared memory segment not found: {0}")]
    SegmentNotFound(String),

    /// Segment already exists
    #[error("Shared memory segment already exists: {0}")]
    SegmentExists(String),

    /// Invalid capacity
    #[error("Invalid capacity: {size} bytes, must be between {min} and {max}")]
    InvalidCapacity { size: usize, min: usize, max: usize },

    /// Existing segment does not match the configured capacity
    #[error("Segment {name} is {actual} bytes, expected {expected}")]
    SegmentMismatch {
        name: String,
        actual: usize,
        expected: usize,
    },

    /// Memory mapping failed
    #[error("Memory mapping failed: {0}")]
    MappingFailed(String),

    /// Named lock could not be created, acquired or released
    #[error("Lock error: {0}")]
    Lock(String),

    /// Permission denied
    #[error("Permission denied: {0}")]
    PermissionDenied(String),

    /// Zero-length payloads cannot be framed
    #[error("Empty payloads cannot be sent")]
    EmptyPayload,

    /// The payload can never fit the channel, regardless of occupancy
    #[error("Payload of {len} bytes can never fit a channel with {max} data bytes")]
    PayloadTooLarge { len: usize, max: usize },

    /// IO error
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),
}

/// Convenience type alias
pub type Result<T> = std::result::Result<T, ChannelError>;

impl ChannelError {
    /// Invalid-input errors reject the call's arguments; retrying the same
    /// call can never succeed. Everything else is an environment failure.
    pub fn is_invalid_input(&self) -> bool {
        matches!(
            self,
            ChannelError::EmptyPayload | ChannelError::PayloadTooLarge { .. }
        )
    }

    /// Convert platform-specific error codes to ChannelError
    pub fn from_platform_error(error: i32, message: impl Into<String>) -> Self {
        match error {
            13 => ChannelError::PermissionDenied(message.into()), // EACCES
            2 => ChannelError::SegmentNotFound(message.into()),   // ENOENT
            17 => ChannelError::SegmentExists(message.into()),    // EEXIST
            _ => ChannelError::Platform(format!("Error {}: {}", error, message.into())),
        }
    }
}
