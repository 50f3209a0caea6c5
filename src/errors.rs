// SPDX-License-Identifier: GPL-3.0-only

//! Error types for the post-processing pipeline

use crate::backends::camera::{BackendError, ChannelHandle, StreamType};
use crate::backends::jpeg::JobId;
use thiserror::Error;

/// Result type alias using PostProcError
pub type PostProcResult<T> = Result<T, PostProcError>;

/// Result type alias using ChannelError
pub type ChannelResult<T> = Result<T, ChannelError>;

/// Channel and stream bundling errors
#[derive(Debug, Error)]
pub enum ChannelError {
    /// Bundle already holds the maximum number of streams
    #[error("Channel bundle is full ({max} streams)")]
    BundleFull { max: usize },

    /// Operation issued before `init` or after the channel went inactive
    #[error("Channel is not initialized")]
    NotInitialized,

    /// A required stream type is missing from the bundle
    #[error("No {0:?} stream in channel")]
    MissingStream(StreamType),

    /// Reprocess channel was asked to reprocess without offline streams
    #[error("Reprocess channel has no streams")]
    NoReprocessStreams,

    /// Reprocess channel has not been bound to a source channel
    #[error("Reprocess channel has no source channel")]
    NoSourceChannel,

    /// Allocator or application memory refused a request
    #[error("Failed to allocate {0}")]
    NoMemory(&'static str),

    /// Driver transaction failed
    #[error(transparent)]
    Backend(#[from] BackendError),
}

/// Post-processor errors
#[derive(Debug, Error)]
pub enum PostProcError {
    /// Pipeline used before `init` (or after `deinit`)
    #[error("Post-processor not initialized")]
    NotInitialized,

    /// Operation not valid in the current state
    #[error("Invalid state: {0}")]
    InvalidState(String),

    /// A job queue refused admission
    #[error("Queue '{0}' is not accepting jobs")]
    QueueInactive(&'static str),

    /// Application memory allocation failed
    #[error("Out of memory: {0}")]
    NoMemory(String),

    /// No capture or reprocess channel owns the handle
    #[error("No channel with handle {0}")]
    ChannelNotFound(ChannelHandle),

    /// Reprocess completion arrived with no ongoing job
    #[error("No reprocess job in flight")]
    NoPendingJob,

    /// Frame handed to the encoder carries no snapshot/video/raw buffer
    #[error("Frame has no main image buffer")]
    NoMainFrame,

    /// Reprocess chain lookup past its end
    #[error("Reprocess pass {index} out of range (chain length {len})")]
    PassOutOfRange { index: usize, len: usize },

    /// Encoder reported a failed job
    #[error("JPEG job {0} failed")]
    EncoderJobFailed(JobId),

    /// Notification sink refused a callback
    #[error("Notification rejected: {0}")]
    NotifyFailed(String),

    /// Configuration load/save failed
    #[error("Configuration error: {0}")]
    Config(String),

    /// Channel-level failure
    #[error(transparent)]
    Channel(#[from] ChannelError),

    /// Driver or encoder transaction failed
    #[error(transparent)]
    Backend(#[from] BackendError),

    /// Save worker I/O failure
    #[error("Storage error: {0}")]
    Storage(#[from] std::io::Error),
}

impl From<serde_json::Error> for PostProcError {
    fn from(err: serde_json::Error) -> Self {
        PostProcError::Config(err.to_string())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_channel_error_wraps_into_postproc_error() {
        let err: PostProcError = ChannelError::BundleFull { max: 4 }.into();
        assert!(matches!(err, PostProcError::Channel(ChannelError::BundleFull { max: 4 })));
        assert_eq!(err.to_string(), "Channel bundle is full (4 streams)");
    }

    #[test]
    fn test_backend_error_is_transparent() {
        let err: PostProcError = BackendError::Transaction("map failed".into()).into();
        assert_eq!(err.to_string(), "Driver transaction failed: map failed");
    }
}
