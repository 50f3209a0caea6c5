// SPDX-License-Identifier: GPL-3.0-only

//! Application-facing callbacks
//!
//! Finished images leave the pipeline as [`CallbackEvent::Data`], each
//! carrying a [`ReleaseHandle`] that gives the underlying buffers back once
//! the application is done with them. Failures leave as
//! [`CallbackEvent::Notify`] with [`MsgType::Error`].

use crate::backends::camera::{HeapMemory, Metadata};
use crate::errors::PostProcResult;
use tracing::debug;

/// Generic error code carried in `ext1` of error notifications
pub const CAMERA_ERROR_UNKNOWN: i32 = 1;

/// Callback message kinds the pipeline emits
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum MsgType {
    CompressedImage,
    RawImage,
    RawImageNotify,
    Shutter,
    Error,
}

/// Outcome reported to a release action
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ReleaseStatus {
    Delivered,
    Failed,
}

/// What a release action gives back
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ReleaseKind {
    /// Application memory block
    Memory,
    /// Bundled frame returned to its channel
    Frame,
    /// File written by the save worker
    File,
}

type ReleaseFn = Box<dyn FnOnce(ReleaseStatus) + Send>;

/// Release action that runs exactly once
///
/// Dropping an unreleased handle runs the action with
/// [`ReleaseStatus::Failed`].
pub struct ReleaseHandle {
    kind: ReleaseKind,
    action: Option<ReleaseFn>,
}

impl ReleaseHandle {
    pub fn new(kind: ReleaseKind, action: impl FnOnce(ReleaseStatus) + Send + 'static) -> Self {
        Self {
            kind,
            action: Some(Box::new(action)),
        }
    }

    pub fn kind(&self) -> ReleaseKind {
        self.kind
    }

    pub fn release(mut self, status: ReleaseStatus) {
        self.run(status);
    }

    fn run(&mut self, status: ReleaseStatus) {
        if let Some(action) = self.action.take() {
            debug!(kind = ?self.kind, ?status, "Running release action");
            action(status);
        }
    }
}

impl Drop for ReleaseHandle {
    fn drop(&mut self) {
        self.run(ReleaseStatus::Failed);
    }
}

impl std::fmt::Debug for ReleaseHandle {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ReleaseHandle")
            .field("kind", &self.kind)
            .field("pending", &self.action.is_some())
            .finish()
    }
}

/// Event delivered to the application layer
#[derive(Debug)]
pub enum CallbackEvent {
    Data {
        msg: MsgType,
        data: HeapMemory,
        index: u32,
        metadata: Option<Metadata>,
        release: ReleaseHandle,
    },
    Notify {
        msg: MsgType,
        ext1: i32,
        ext2: i32,
    },
}

impl CallbackEvent {
    pub fn error() -> Self {
        CallbackEvent::Notify {
            msg: MsgType::Error,
            ext1: CAMERA_ERROR_UNKNOWN,
            ext2: 0,
        }
    }

    pub fn msg_type(&self) -> MsgType {
        match self {
            CallbackEvent::Data { msg, .. } | CallbackEvent::Notify { msg, .. } => *msg,
        }
    }
}

/// Application callback dispatcher
pub trait Notifier: Send + Sync {
    /// Hand an event to the application
    ///
    /// A rejected event is dropped, which runs its release action with
    /// [`ReleaseStatus::Failed`].
    fn notify(&self, event: CallbackEvent) -> PostProcResult<()>;

    fn msg_type_enabled(&self, msg: MsgType) -> bool;

    /// Whether a data callback is registered at all
    fn has_data_callback(&self) -> bool;
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Arc;
    use std::sync::atomic::{AtomicU32, Ordering};

    #[test]
    fn test_release_runs_once() {
        let runs = Arc::new(AtomicU32::new(0));
        let runs_clone = Arc::clone(&runs);
        let handle = ReleaseHandle::new(ReleaseKind::Memory, move |status| {
            assert_eq!(status, ReleaseStatus::Delivered);
            runs_clone.fetch_add(1, Ordering::SeqCst);
        });
        handle.release(ReleaseStatus::Delivered);
        assert_eq!(runs.load(Ordering::SeqCst), 1);
    }

    #[test]
    fn test_drop_releases_as_failed() {
        let failed = Arc::new(AtomicU32::new(0));
        let failed_clone = Arc::clone(&failed);
        let event = CallbackEvent::Data {
            msg: MsgType::CompressedImage,
            data: HeapMemory::zeroed(8),
            index: 0,
            metadata: None,
            release: ReleaseHandle::new(ReleaseKind::Frame, move |status| {
                if status == ReleaseStatus::Failed {
                    failed_clone.fetch_add(1, Ordering::SeqCst);
                }
            }),
        };
        assert_eq!(event.msg_type(), MsgType::CompressedImage);
        drop(event);
        assert_eq!(failed.load(Ordering::SeqCst), 1);
    }

    #[test]
    fn test_error_event() {
        match CallbackEvent::error() {
            CallbackEvent::Notify { msg, ext1, .. } => {
                assert_eq!(msg, MsgType::Error);
                assert_eq!(ext1, CAMERA_ERROR_UNKNOWN);
            }
            other => panic!("unexpected event {other:?}"),
        }
    }
}
