// SPDX-License-Identifier: GPL-3.0-only

//! Shared types for the camera driver interface

use crate::constants::MAX_NUM_STREAMS;
use parking_lot::RwLock;
use serde::{Deserialize, Serialize};
use std::sync::Arc;
use thiserror::Error;

/// Driver-assigned camera session handle
pub type CameraHandle = u32;
/// Driver-assigned channel handle (0 means "not registered")
pub type ChannelHandle = u32;
/// Driver-assigned stream handle
pub type StreamHandle = u32;
/// Identifier the hardware uses for a stream in metadata and bundle configs
pub type ServerId = u32;

/// Metadata buffer shared between a frame and the reprocess pipeline
pub type SharedMetadata = Arc<RwLock<Metadata>>;

/// Result type for driver and encoder operations
pub type BackendResult<T> = Result<T, BackendError>;

/// Error types for driver and encoder operations
#[derive(Debug, Clone, Error)]
pub enum BackendError {
    /// Handle does not refer to a registered object
    #[error("Invalid handle: {0}")]
    InvalidHandle(String),
    /// Hardware rejected a transaction (map, parameter, start)
    #[error("Driver transaction failed: {0}")]
    Transaction(String),
    /// Encoder session or job failure
    #[error("Encoder error: {0}")]
    Encoder(String),
    /// Backend has been shut down
    #[error("Backend not available: {0}")]
    NotAvailable(String),
}

/// Role a stream plays in a bundle
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum StreamType {
    Default,
    Preview,
    Postview,
    Snapshot,
    Video,
    Callback,
    Raw,
    Metadata,
    Analysis,
    /// Offline reprocess stream created from another stream
    OfflineProc,
}

/// Pixel layout of a stream's buffers
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum PixelFormat {
    Nv21,
    Nv12,
    Yv12,
    Nv61,
    Nv16,
    YOnly,
    RawBayer,
    Jpeg,
    Metadata,
}

impl PixelFormat {
    /// Short name published with YUV frame info
    pub fn name(&self) -> &'static str {
        match self {
            PixelFormat::Nv21 => "yuv420sp",
            PixelFormat::Nv12 => "yuv420sp-nv12",
            PixelFormat::Yv12 => "yuv420p",
            PixelFormat::Nv61 => "yuv422sp-nv61",
            PixelFormat::Nv16 => "yuv422sp",
            PixelFormat::YOnly => "y-only",
            PixelFormat::RawBayer => "bayer-raw",
            PixelFormat::Jpeg => "jpeg",
            PixelFormat::Metadata => "metadata",
        }
    }

    /// Bytes needed for one frame of the given size
    pub fn frame_len(&self, dim: Dimension) -> usize {
        let pixels = dim.width as usize * dim.height as usize;
        match self {
            PixelFormat::Nv21 | PixelFormat::Nv12 | PixelFormat::Yv12 => pixels * 3 / 2,
            PixelFormat::Nv61 | PixelFormat::Nv16 | PixelFormat::RawBayer => pixels * 2,
            PixelFormat::YOnly => pixels,
            PixelFormat::Jpeg | PixelFormat::Metadata => pixels,
        }
    }
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct Dimension {
    pub width: u32,
    pub height: u32,
}

impl Dimension {
    pub const fn new(width: u32, height: u32) -> Self {
        Self { width, height }
    }

    pub fn is_empty(&self) -> bool {
        self.width == 0 || self.height == 0
    }

    pub fn swapped(&self) -> Self {
        Self::new(self.height, self.width)
    }
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct Rect {
    pub left: u32,
    pub top: u32,
    pub width: u32,
    pub height: u32,
}

impl Rect {
    /// Rectangle covering a whole frame
    pub fn full(dim: Dimension) -> Self {
        Self {
            left: 0,
            top: 0,
            width: dim.width,
            height: dim.height,
        }
    }
}

/// Buffer alignment requirements, in bytes
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct Padding {
    pub width_padding: u32,
    pub height_padding: u32,
    pub plane_padding: u32,
}

impl Padding {
    pub const PAD_NONE: u32 = 1;
    pub const PAD_TO_WORD: u32 = 4;
    pub const PAD_TO_16: u32 = 16;
    pub const PAD_TO_32: u32 = 32;

    /// Use the larger of width/height padding on both axes so a later
    /// rotation cannot clip the frame
    pub fn normalized(&self) -> Self {
        let pad = self.width_padding.max(self.height_padding);
        Self {
            width_padding: pad,
            height_padding: pad,
            plane_padding: self.plane_padding,
        }
    }
}

impl Default for Padding {
    fn default() -> Self {
        Self {
            width_padding: Self::PAD_NONE,
            height_padding: Self::PAD_NONE,
            plane_padding: Self::PAD_NONE,
        }
    }
}

/// Plane layout of one frame
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct FrameOffset {
    pub frame_len: u32,
    pub y_offset: u32,
    pub cbcr_offset: u32,
    pub stride: u32,
    pub scanline: u32,
}

impl FrameOffset {
    /// Semi-planar layout for `format` at `dim`, aligned to `padding`
    pub fn for_format(format: PixelFormat, dim: Dimension, padding: &Padding) -> Self {
        let stride = align(dim.width, padding.width_padding);
        let scanline = align(dim.height, padding.height_padding);
        let luma = stride * scanline;
        let frame_len = align(
            format.frame_len(Dimension::new(stride, scanline)) as u32,
            padding.plane_padding,
        );
        Self {
            frame_len,
            y_offset: 0,
            cbcr_offset: luma,
            stride,
            scanline,
        }
    }
}

fn align(value: u32, to: u32) -> u32 {
    if to <= 1 { value } else { value.div_ceil(to) * to }
}

/// Post-processing features a stream can request, as a bit mask
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct FeatureMask(pub u32);

impl FeatureMask {
    pub const NONE: FeatureMask = FeatureMask(0);
    pub const DENOISE2D: FeatureMask = FeatureMask(1 << 0);
    pub const CAC: FeatureMask = FeatureMask(1 << 1);
    pub const SHARPNESS: FeatureMask = FeatureMask(1 << 2);
    pub const FLIP: FeatureMask = FeatureMask(1 << 3);
    pub const CDS: FeatureMask = FeatureMask(1 << 4);
    pub const DSDN: FeatureMask = FeatureMask(1 << 5);
    pub const HDR: FeatureMask = FeatureMask(1 << 6);
    pub const ROTATION: FeatureMask = FeatureMask(1 << 7);
    pub const SCALE: FeatureMask = FeatureMask(1 << 8);
    pub const CROP: FeatureMask = FeatureMask(1 << 9);
    pub const UBIFOCUS: FeatureMask = FeatureMask(1 << 10);
    pub const REFOCUS: FeatureMask = FeatureMask(1 << 11);

    pub fn contains(&self, other: FeatureMask) -> bool {
        self.0 & other.0 == other.0 && other.0 != 0
    }

    pub fn insert(&mut self, other: FeatureMask) {
        self.0 |= other.0;
    }

    pub fn remove(&mut self, other: FeatureMask) {
        self.0 &= !other.0;
    }

    pub fn is_empty(&self) -> bool {
        self.0 == 0
    }
}

impl std::ops::BitOr for FeatureMask {
    type Output = FeatureMask;

    fn bitor(self, rhs: FeatureMask) -> FeatureMask {
        FeatureMask(self.0 | rhs.0)
    }
}

/// Mirror settings as a bit mask
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct FlipMode(pub u8);

impl FlipMode {
    pub const NONE: FlipMode = FlipMode(0);
    pub const HORIZONTAL: FlipMode = FlipMode(1);
    pub const VERTICAL: FlipMode = FlipMode(2);

    pub fn is_flipped(&self) -> bool {
        self.0 != 0
    }
}

/// Offline rotation applied by a reprocess stream
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub enum Rotation {
    #[default]
    Rot0,
    Rot90,
    Rot180,
    Rot270,
}

impl Rotation {
    pub fn from_degrees(degrees: u32) -> Self {
        match degrees % 360 {
            90 => Rotation::Rot90,
            180 => Rotation::Rot180,
            270 => Rotation::Rot270,
            _ => Rotation::Rot0,
        }
    }
}

/// Post-processing configuration carried by a reprocess stream
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct PpFeatureConfig {
    pub feature_mask: FeatureMask,
    pub flip: FlipMode,
    pub rotation: Rotation,
    /// Requested output size when `SCALE` is set
    pub scale_output: Option<Dimension>,
}

/// How a stream produces buffers
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum StreamingMode {
    Continuous,
    Burst { num_frames: u32 },
}

/// Input description for a reprocess stream
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum ReprocessConfig {
    /// Input buffers come from a live stream the driver already knows
    Online {
        input_stream_id: ServerId,
        input_stream_type: StreamType,
    },
    /// Input buffers are mapped explicitly per request
    Offline {
        input_fmt: PixelFormat,
        input_dim: Dimension,
        input_offset: FrameOffset,
        input_type: StreamType,
        num_of_bufs: u32,
    },
}

impl ReprocessConfig {
    /// Stream type the reprocess input originated from
    pub fn input_type(&self) -> StreamType {
        match self {
            ReprocessConfig::Online {
                input_stream_type, ..
            } => *input_stream_type,
            ReprocessConfig::Offline { input_type, .. } => *input_type,
        }
    }
}

/// Stream performance hint
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub enum PerfMode {
    #[default]
    Normal,
    HighPerformance,
}

/// Everything the driver needs to create a stream
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct StreamInfo {
    pub stream_type: StreamType,
    pub fmt: PixelFormat,
    pub dim: Dimension,
    pub streaming_mode: StreamingMode,
    pub num_bufs: u32,
    pub pp_config: PpFeatureConfig,
    pub reprocess_config: Option<ReprocessConfig>,
    pub perf_mode: PerfMode,
}

impl StreamInfo {
    /// A plain continuous stream with no post-processing
    pub fn new(stream_type: StreamType, fmt: PixelFormat, dim: Dimension, num_bufs: u32) -> Self {
        Self {
            stream_type,
            fmt,
            dim,
            streaming_mode: StreamingMode::Continuous,
            num_bufs,
            pp_config: PpFeatureConfig::default(),
            reprocess_config: None,
            perf_mode: PerfMode::Normal,
        }
    }
}

/// Bundle layout reported by the driver after `link`/`add_stream`
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct BundleConfig {
    pub bundle_id: ChannelHandle,
    pub stream_ids: Vec<ServerId>,
}

/// Per-channel attributes passed at registration
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ChannelAttr {
    pub burst_notify: bool,
    pub max_unmatched_frames: u32,
    pub look_back: u32,
    pub water_mark: u32,
}

impl Default for ChannelAttr {
    fn default() -> Self {
        Self {
            burst_notify: false,
            max_unmatched_frames: 3,
            look_back: 2,
            water_mark: 2,
        }
    }
}

/// Request for future bundled frames
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct CaptureRequest {
    pub num_frames: u32,
    pub retro_frames: u32,
}

/// Staged capture sequences handled by the driver
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AdvancedCaptureType {
    Bracketing,
    FrameCapture,
    ChromaFlash,
    Optizoom,
    Refocus,
    TruePortrait,
    StillMore,
}

/// Where a mapped buffer goes on a stream
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum MappingBufType {
    OfflineInput,
    OfflineMeta,
    StreamBuf,
    StreamInfo,
    MiscBuf,
}

/// What backs a mapped buffer
#[derive(Debug, Clone)]
pub enum MappedPayload {
    Frame(Arc<[u8]>),
    Metadata(SharedMetadata),
    /// Externally owned memory identified by fd only
    External,
}

/// One buffer mapping request
#[derive(Debug, Clone)]
pub struct BufMapping {
    pub buf_type: MappingBufType,
    pub index: u32,
    pub fd: i32,
    pub len: usize,
    pub payload: MappedPayload,
}

/// Metadata reference attached to a reprocess request
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ReprocessMeta {
    None,
    /// Metadata already lives on a stream the driver knows
    Stream { stream_id: ServerId, buf_index: u32 },
    /// Metadata was mapped into the offline-meta slot
    Mapped { buf_index: u32 },
}

/// "Do reprocess" parameter payload
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ReprocessRequest {
    pub buf_index: u32,
    pub frame_idx: u32,
    pub meta: ReprocessMeta,
}

/// Stream parameter transactions
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum StreamParam {
    SetBundleInfo(BundleConfig),
    DoReprocess(ReprocessRequest),
    SetFlip(FlipMode),
    /// Push the session's latest runtime parameters to the stream
    SyncRuntimeParams,
}

/// Per-stream crop published in metadata
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct StreamCrop {
    pub stream_id: ServerId,
    pub crop: Rect,
    pub roi_map: Rect,
}

/// Crop records for every stream in a bundle, bounded by `MAX_NUM_STREAMS`
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct CropData {
    pub entries: Vec<StreamCrop>,
}

impl CropData {
    pub fn find(&self, stream_id: ServerId) -> Option<&StreamCrop> {
        self.entries.iter().find(|e| e.stream_id == stream_id)
    }

    pub fn has_space(&self) -> bool {
        self.entries.len() < MAX_NUM_STREAMS
    }
}

/// Per-frame 3A and crop metadata
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct Metadata {
    pub frame_number: u32,
    pub crop: CropData,
    /// Crop computed by a multi-frame image feature (refocus, optizoom, ...)
    pub img_prop_crop: Option<Rect>,
    /// Opaque 3A debug blob attached for mobicat
    pub debug_3a: Vec<u8>,
    pub mobicat_valid: bool,
}

impl Metadata {
    pub fn into_shared(self) -> SharedMetadata {
        Arc::new(RwLock::new(self))
    }
}

/// Refocus/true-portrait side result carried in a stream's misc buffer
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct MiscResult {
    pub header: Vec<u8>,
    pub width: u32,
    pub height: u32,
    pub data: Vec<u8>,
}

impl MiscResult {
    pub fn len(&self) -> usize {
        self.header.len() + (self.width * self.height) as usize
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

/// One sub-buffer of a bundled frame
#[derive(Debug, Clone)]
pub struct BufDef {
    pub stream_id: StreamHandle,
    pub stream_type: StreamType,
    pub buf_idx: u32,
    pub frame_idx: u32,
    pub fd: i32,
    pub data: Arc<[u8]>,
    /// Populated for metadata-stream buffers
    pub metadata: Option<SharedMetadata>,
}

impl BufDef {
    pub fn frame_len(&self) -> usize {
        self.data.len()
    }
}

/// A bundled delivery: one sub-buffer per bundled stream
///
/// Deliberately not `Clone`: whoever holds a `SuperFrame` is responsible for
/// returning it to its channel exactly once.
#[derive(Debug)]
pub struct SuperFrame {
    pub camera_handle: CameraHandle,
    pub ch_id: ChannelHandle,
    pub bufs: Vec<BufDef>,
}

impl SuperFrame {
    pub fn new(camera_handle: CameraHandle, ch_id: ChannelHandle, bufs: Vec<BufDef>) -> Self {
        Self {
            camera_handle,
            ch_id,
            bufs,
        }
    }

    pub fn num_bufs(&self) -> usize {
        self.bufs.len()
    }

    /// First metadata sub-buffer, if the bundle carries one
    pub fn metadata_buf(&self) -> Option<&BufDef> {
        self.bufs
            .iter()
            .find(|b| b.stream_type == StreamType::Metadata)
    }

    pub fn frame_idx(&self) -> Option<u32> {
        self.bufs.first().map(|b| b.frame_idx)
    }
}

/// Heap memory block handed to or allocated by the application layer
#[derive(Debug, Clone)]
pub struct HeapMemory {
    data: Arc<[u8]>,
}

impl HeapMemory {
    pub fn zeroed(len: usize) -> Self {
        Self {
            data: vec![0u8; len].into(),
        }
    }

    /// Share an existing buffer without copying
    pub fn wrap(data: Arc<[u8]>) -> Self {
        Self { data }
    }

    pub fn copy_from(bytes: &[u8]) -> Self {
        Self { data: bytes.into() }
    }

    pub fn as_slice(&self) -> &[u8] {
        &self.data
    }

    pub fn len(&self) -> usize {
        self.data.len()
    }

    pub fn is_empty(&self) -> bool {
        self.data.is_empty()
    }

    /// Whether both blocks share one allocation
    pub fn shares_with(&self, other: &Arc<[u8]>) -> bool {
        Arc::ptr_eq(&self.data, other)
    }
}

/// Published layout of a raw YUV capture
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct YuvFrameInfo {
    pub frame_len: u32,
    pub y_offset: u32,
    pub cbcr_offset: u32,
    pub format: String,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_padding_normalized_uses_larger_axis() {
        let padding = Padding {
            width_padding: Padding::PAD_TO_32,
            height_padding: Padding::PAD_TO_16,
            plane_padding: Padding::PAD_TO_WORD,
        };
        let normalized = padding.normalized();
        assert_eq!(normalized.width_padding, 32);
        assert_eq!(normalized.height_padding, 32);
        assert_eq!(normalized.plane_padding, 4);
    }

    #[test]
    fn test_feature_mask_remove() {
        let mut mask = FeatureMask::CAC | FeatureMask::SHARPNESS | FeatureMask::HDR;
        mask.remove(FeatureMask::CAC | FeatureMask::SHARPNESS);
        assert_eq!(mask, FeatureMask::HDR);
        assert!(!mask.contains(FeatureMask::CAC));
    }

    #[test]
    fn test_frame_offset_nv21() {
        let offset =
            FrameOffset::for_format(PixelFormat::Nv21, Dimension::new(640, 480), &Padding::default());
        assert_eq!(offset.cbcr_offset, 640 * 480);
        assert_eq!(offset.frame_len, 640 * 480 * 3 / 2);
    }

    #[test]
    fn test_crop_data_capacity() {
        let mut crop = CropData::default();
        for id in 0..MAX_NUM_STREAMS as u32 {
            assert!(crop.has_space());
            crop.entries.push(StreamCrop {
                stream_id: id,
                ..Default::default()
            });
        }
        assert!(!crop.has_space());
        assert!(crop.find(3).is_some());
    }
}
