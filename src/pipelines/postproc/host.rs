// SPDX-License-Identifier: GPL-3.0-only

//! Capture-side owner consumed by the post-processor

use super::notify::Notifier;
use crate::backends::camera::{
    ChannelHandle, FrameCallback, HeapMemory, ParamStore, Stream, SuperFrame,
};
use crate::backends::jpeg::{ExifTable, JobId};
use crate::channels::{ReprocessChannel, SharedChannel};
use crate::errors::PostProcResult;

/// Hardware-interface owner the post-processor works for
///
/// The host owns the capture channels and the parameter store, creates
/// reprocess channels on request and forwards finished images to the
/// application.
pub trait CameraHost: Send + Sync {
    // ===== Parameters =====

    fn params(&self) -> &dyn ParamStore;

    // ===== Channels =====

    /// Capture channel registered under `handle`
    fn channel_by_handle(&self, handle: ChannelHandle) -> Option<SharedChannel>;

    /// Create a reprocess channel mirroring `source`
    ///
    /// Outputs of the new channel must be delivered to `callback`.
    fn add_reproc_channel(
        &self,
        source: &SharedChannel,
        callback: FrameCallback,
    ) -> PostProcResult<ReprocessChannel>;

    /// Tear down the capture channel after a regular capture was handed to
    /// reprocessing
    fn stop_capture_channel(&self) -> PostProcResult<()>;

    // ===== Application =====

    fn notifier(&self) -> &dyn Notifier;

    /// Copy `bytes` into application memory; `None` when allocation fails
    fn get_memory(&self, bytes: &[u8]) -> Option<HeapMemory>;

    fn play_shutter(&self) {}

    /// EXIF table for the next encode
    fn build_exif(&self) -> Option<ExifTable>;

    // ===== Debug dumps =====

    fn dump_frame(&self, _frame: &SuperFrame, _stream: &Stream) {}

    fn dump_jpeg(&self, _job_id: JobId, _data: &[u8]) {}
}
