// SPDX-License-Identifier: GPL-3.0-only

//! Driver-backed buffer stream

use super::types::*;
use super::CameraOps;
use parking_lot::{Condvar, Mutex};
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use std::time::Duration;
use tracing::debug;

/// A single buffer-producing endpoint bound to a channel
///
/// Streams are shared (`Arc<Stream>`) between the channel that created them
/// and any channel they are linked into. Only the creating channel, whose
/// handle equals [`Stream::channel_handle`], may delete them.
pub struct Stream {
    ops: Arc<dyn CameraOps>,
    camera_handle: CameraHandle,
    channel_handle: ChannelHandle,
    handle: StreamHandle,
    server_id: ServerId,
    info: StreamInfo,
    padding: Padding,
    offset: FrameOffset,
    info_buf: HeapMemory,
    misc_buf: Option<HeapMemory>,
    misc_result: Mutex<Option<MiscResult>>,
    deferred: bool,
    running: AtomicBool,
    data_ready: Mutex<bool>,
    data_cond: Condvar,
}

impl Stream {
    #[allow(clippy::too_many_arguments)]
    pub(crate) fn new(
        ops: Arc<dyn CameraOps>,
        camera_handle: CameraHandle,
        channel_handle: ChannelHandle,
        handle: StreamHandle,
        server_id: ServerId,
        info: StreamInfo,
        padding: Padding,
        info_buf: HeapMemory,
        misc_buf: Option<HeapMemory>,
    ) -> Self {
        let offset = FrameOffset::for_format(info.fmt, info.dim, &padding);
        Self {
            ops,
            camera_handle,
            channel_handle,
            handle,
            server_id,
            info,
            padding,
            offset,
            info_buf,
            misc_buf,
            misc_result: Mutex::new(None),
            deferred: false,
            running: AtomicBool::new(false),
            data_ready: Mutex::new(false),
            data_cond: Condvar::new(),
        }
    }

    /// Postpone driver configuration until the channel's `config()`
    pub(crate) fn with_deferred_config(mut self, deferred: bool) -> Self {
        self.deferred = deferred;
        self
    }

    pub fn is_deferred(&self) -> bool {
        self.deferred
    }

    pub fn handle(&self) -> StreamHandle {
        self.handle
    }

    pub fn server_id(&self) -> ServerId {
        self.server_id
    }

    /// Handle of the channel that created (and owns) this stream
    pub fn channel_handle(&self) -> ChannelHandle {
        self.channel_handle
    }

    pub fn stream_type(&self) -> StreamType {
        self.info.stream_type
    }

    /// Type this stream was derived from; differs from
    /// [`Stream::stream_type`] only for offline reprocess streams
    pub fn original_type(&self) -> StreamType {
        match (self.info.stream_type, self.info.reprocess_config) {
            (StreamType::OfflineProc, Some(cfg)) => cfg.input_type(),
            (stream_type, _) => stream_type,
        }
    }

    pub fn is_type_of(&self, stream_type: StreamType) -> bool {
        self.info.stream_type == stream_type
    }

    pub fn is_original_type_of(&self, stream_type: StreamType) -> bool {
        self.info.stream_type == StreamType::OfflineProc && self.original_type() == stream_type
    }

    pub fn format(&self) -> PixelFormat {
        self.info.fmt
    }

    pub fn dimension(&self) -> Dimension {
        self.info.dim
    }

    pub fn frame_offset(&self) -> FrameOffset {
        self.offset
    }

    pub fn padding(&self) -> Padding {
        self.padding
    }

    pub fn info(&self) -> &StreamInfo {
        &self.info
    }

    pub fn pp_config(&self) -> &PpFeatureConfig {
        &self.info.pp_config
    }

    pub fn num_bufs(&self) -> u32 {
        self.info.num_bufs
    }

    /// Buffer slots the driver can hold for this stream at once
    pub fn num_queued_bufs(&self) -> usize {
        self.info.num_bufs as usize
    }

    pub fn info_buf(&self) -> &HeapMemory {
        &self.info_buf
    }

    pub fn has_misc_buf(&self) -> bool {
        self.misc_buf.is_some()
    }

    /// Side result (depth map, portrait mask) last written to the misc buffer
    pub fn misc_result(&self) -> Option<MiscResult> {
        self.misc_result.lock().clone()
    }

    pub fn publish_misc_result(&self, result: MiscResult) {
        *self.misc_result.lock() = Some(result);
    }

    pub(crate) fn configure(&self) -> BackendResult<()> {
        self.ops
            .config_stream(self.camera_handle, self.channel_handle, self.handle, &self.info)
    }

    pub(crate) fn start(&self) -> BackendResult<()> {
        debug!(stream = self.handle, stream_type = ?self.info.stream_type, "Starting stream");
        self.ops
            .start_stream(self.camera_handle, self.channel_handle, self.handle)?;
        self.running.store(true, Ordering::SeqCst);
        Ok(())
    }

    pub(crate) fn stop(&self) -> BackendResult<()> {
        debug!(stream = self.handle, "Stopping stream");
        self.running.store(false, Ordering::SeqCst);
        self.ops
            .stop_stream(self.camera_handle, self.channel_handle, self.handle)?;
        *self.data_ready.lock() = false;
        Ok(())
    }

    pub fn is_running(&self) -> bool {
        self.running.load(Ordering::SeqCst)
    }

    /// Wake readers blocked in [`Stream::wait_for_data`]
    pub fn cond_signal(&self) {
        let mut ready = self.data_ready.lock();
        *ready = true;
        self.data_cond.notify_all();
    }

    /// Block until the owning channel has gone active, or the timeout elapses
    pub fn wait_for_data(&self, timeout: Duration) -> bool {
        let mut ready = self.data_ready.lock();
        if !*ready {
            let _ = self.data_cond.wait_for(&mut ready, timeout);
        }
        *ready
    }

    pub fn set_bundle_info(&self, bundle: &BundleConfig) -> BackendResult<()> {
        self.set_parameter(&StreamParam::SetBundleInfo(bundle.clone()))
            .map(|_| ())
    }

    pub fn sync_runtime_params(&self) -> BackendResult<()> {
        self.set_parameter(&StreamParam::SyncRuntimeParams).map(|_| ())
    }

    pub fn set_parameter(&self, param: &StreamParam) -> BackendResult<i32> {
        self.ops
            .set_stream_parameter(self.camera_handle, self.channel_handle, self.handle, param)
    }

    pub fn map_buf(&self, mapping: &BufMapping) -> BackendResult<()> {
        self.ops
            .map_stream_buf(self.camera_handle, self.channel_handle, self.handle, mapping)
    }

    pub fn unmap_buf(&self, buf_type: MappingBufType, index: u32) -> BackendResult<()> {
        self.ops.unmap_stream_buf(
            self.camera_handle,
            self.channel_handle,
            self.handle,
            buf_type,
            index,
        )
    }

    /// Return one buffer of this stream to the driver
    pub fn buf_done(&self, buf: &BufDef) -> BackendResult<()> {
        self.ops.buf_done(self.camera_handle, self.channel_handle, buf)
    }

    pub fn release_opaque(&self, opaque: u64, is_metadata: bool) -> BackendResult<()> {
        self.ops.release_opaque_buf(
            self.camera_handle,
            self.channel_handle,
            self.handle,
            opaque,
            is_metadata,
        )
    }

    pub(crate) fn delete(&self) -> BackendResult<()> {
        self.ops
            .delete_stream(self.camera_handle, self.channel_handle, self.handle)
    }
}

impl std::fmt::Debug for Stream {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Stream")
            .field("handle", &self.handle)
            .field("server_id", &self.server_id)
            .field("channel", &self.channel_handle)
            .field("type", &self.info.stream_type)
            .field("original_type", &self.original_type())
            .finish()
    }
}
