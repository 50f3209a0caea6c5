// SPDX-License-Identifier: GPL-3.0-only

//! Camera driver abstraction
//!
//! The post-processing pipeline never talks to hardware directly. Everything
//! it needs from the kernel/driver layer goes through [`CameraOps`]; stream
//! buffer allocation goes through [`StreamAllocator`] and per-frame feature
//! queries through [`ParamStore`].
//!
//! ```text
//! ┌──────────────────────┐
//! │    PostProcessor     │
//! └──────────┬───────────┘
//!            │
//!            ▼
//! ┌──────────────────────┐
//! │ Channel / Reprocess  │  ← bundling, offline mappings
//! └──────────┬───────────┘
//!            │
//!            ▼
//! ┌──────────────────────┐
//! │   CameraOps trait    │  ← driver transactions
//! └──────────┬───────────┘
//!            │
//!            ▼
//!      ┌───────────┐
//!      │ Simulated │  ← in-process driver for tests and the CLI
//!      └───────────┘
//! ```

pub mod allocator;
pub mod params;
pub mod simulated;
pub mod stream;
pub mod types;

pub use allocator::{HeapAllocator, StreamAllocator};
pub use params::{CaptureSettings, MpoRole, ParamStore, ScaleConfig};
pub use simulated::SimulatedCamera;
pub use stream::Stream;
pub use types::*;

use std::sync::Arc;

/// Completion callback registered per channel; receives bundled frames
pub type FrameCallback = Arc<dyn Fn(SuperFrame) + Send + Sync>;

/// Driver operations table
///
/// Implementations deliver frames for a channel by invoking the
/// [`FrameCallback`] registered in [`CameraOps::add_channel`], always from a
/// driver-owned thread.
pub trait CameraOps: Send + Sync {
    // ===== Channels =====

    /// Register a channel and its frame callback
    fn add_channel(
        &self,
        camera: CameraHandle,
        attr: Option<ChannelAttr>,
        callback: FrameCallback,
    ) -> BackendResult<ChannelHandle>;

    /// Destroy a channel; buffers still out are reclaimed by the driver
    fn delete_channel(&self, camera: CameraHandle, channel: ChannelHandle) -> BackendResult<()>;

    /// Bundle layout the driver chose for the channel
    fn get_bundle_info(
        &self,
        camera: CameraHandle,
        channel: ChannelHandle,
        stream: StreamHandle,
    ) -> BackendResult<BundleConfig>;

    fn start_channel(&self, camera: CameraHandle, channel: ChannelHandle) -> BackendResult<()>;

    fn stop_channel(&self, camera: CameraHandle, channel: ChannelHandle) -> BackendResult<()>;

    // ===== Streams =====

    /// Create and configure a stream, returning its handle and server ID
    fn add_stream(
        &self,
        camera: CameraHandle,
        channel: ChannelHandle,
        info: &StreamInfo,
    ) -> BackendResult<(StreamHandle, ServerId)>;

    /// Re-apply configuration to a stream whose setup was deferred
    fn config_stream(
        &self,
        camera: CameraHandle,
        channel: ChannelHandle,
        stream: StreamHandle,
        info: &StreamInfo,
    ) -> BackendResult<()>;

    /// Destroy a stream; its buffers still out are reclaimed by the driver
    fn delete_stream(
        &self,
        camera: CameraHandle,
        channel: ChannelHandle,
        stream: StreamHandle,
    ) -> BackendResult<()>;

    fn start_stream(
        &self,
        camera: CameraHandle,
        channel: ChannelHandle,
        stream: StreamHandle,
    ) -> BackendResult<()>;

    fn stop_stream(
        &self,
        camera: CameraHandle,
        channel: ChannelHandle,
        stream: StreamHandle,
    ) -> BackendResult<()>;

    /// Make a stream owned by `src_channel` deliver into `dst_channel` as well
    fn link_stream(
        &self,
        camera: CameraHandle,
        src_channel: ChannelHandle,
        stream: StreamHandle,
        dst_channel: ChannelHandle,
    ) -> BackendResult<()>;

    /// Issue a parameter transaction; returns the driver's result value
    fn set_stream_parameter(
        &self,
        camera: CameraHandle,
        channel: ChannelHandle,
        stream: StreamHandle,
        param: &StreamParam,
    ) -> BackendResult<i32>;

    fn map_stream_buf(
        &self,
        camera: CameraHandle,
        channel: ChannelHandle,
        stream: StreamHandle,
        mapping: &BufMapping,
    ) -> BackendResult<()>;

    fn unmap_stream_buf(
        &self,
        camera: CameraHandle,
        channel: ChannelHandle,
        stream: StreamHandle,
        buf_type: MappingBufType,
        index: u32,
    ) -> BackendResult<()>;

    /// Return one buffer to the driver
    fn buf_done(
        &self,
        camera: CameraHandle,
        channel: ChannelHandle,
        buf: &BufDef,
    ) -> BackendResult<()>;

    /// Return a buffer identified only by an opaque handle (video path)
    fn release_opaque_buf(
        &self,
        camera: CameraHandle,
        channel: ChannelHandle,
        stream: StreamHandle,
        opaque: u64,
        is_metadata: bool,
    ) -> BackendResult<()>;

    // ===== Capture =====

    fn request_super_buf(
        &self,
        camera: CameraHandle,
        channel: ChannelHandle,
        request: CaptureRequest,
    ) -> BackendResult<()>;

    fn cancel_super_buf_request(
        &self,
        camera: CameraHandle,
        channel: ChannelHandle,
    ) -> BackendResult<()>;

    fn process_advanced_capture(
        &self,
        camera: CameraHandle,
        channel: ChannelHandle,
        kind: AdvancedCaptureType,
        start: bool,
    ) -> BackendResult<()>;

    /// Drop queued frames up to `frame_idx`
    fn flush_super_buf_queue(
        &self,
        camera: CameraHandle,
        channel: ChannelHandle,
        frame_idx: u32,
    ) -> BackendResult<()>;
}
