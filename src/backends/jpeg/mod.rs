// SPDX-License-Identifier: GPL-3.0-only

//! JPEG encoder interface
//!
//! The post-processor drives an encoder through [`JpegOps`]: one session per
//! capture configuration, one job per image. Job completion is reported
//! asynchronously through the [`JpegCallback`] given when the session was
//! created.

pub mod convert;
pub mod exif;
pub mod software;

pub use exif::{ExifEntry, ExifError, ExifTable, ExifValue};
pub use software::SoftwareJpeg;

use crate::backends::camera::{BackendResult, Dimension, FrameOffset, Metadata, PixelFormat, Rect};
use std::sync::Arc;

/// Encoder-assigned job identifier
pub type JobId = u32;
/// Encoder-assigned session identifier
pub type SessionId = u32;

/// Completion callback for encode jobs
pub type JpegCallback = Arc<dyn Fn(JpegEvent) + Send + Sync>;

/// Chroma layout the encoder reads
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum JpegColorFormat {
    /// 4:2:0, V before U
    YCrCbH2V2,
    /// 4:2:0, U before V
    YCbCrH2V2,
    /// 4:2:2, V before U
    YCrCbH2V1,
    /// 4:2:2, U before V
    YCbCrH2V1,
    Monochrome,
}

impl JpegColorFormat {
    pub fn from_pixel_format(fmt: PixelFormat) -> Self {
        match fmt {
            PixelFormat::Nv21 => JpegColorFormat::YCrCbH2V2,
            PixelFormat::Nv12 | PixelFormat::Yv12 => JpegColorFormat::YCbCrH2V2,
            PixelFormat::Nv61 => JpegColorFormat::YCrCbH2V1,
            PixelFormat::Nv16 => JpegColorFormat::YCbCrH2V1,
            PixelFormat::YOnly => JpegColorFormat::Monochrome,
            _ => JpegColorFormat::YCrCbH2V2,
        }
    }
}

/// Source and destination geometry of one image
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct ImageDims {
    pub src: Dimension,
    pub dst: Dimension,
    pub crop: Rect,
}

/// Session-wide encode configuration
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct EncodeParams {
    pub main_dim: ImageDims,
    pub thumb_dim: ImageDims,
    pub color_format: JpegColorFormat,
    pub thumb_color_format: JpegColorFormat,
    pub quality: u32,
    pub thumb_quality: u32,
    pub encode_thumbnail: bool,
    /// Degrees; zero when a reprocess pass already rotated the image
    pub rotation: u32,
    pub thumb_rotation: u32,
    pub burst: bool,
    pub num_dst_bufs: usize,
    pub mem_opt: bool,
}

/// One YUV image handed to the encoder
#[derive(Debug, Clone)]
pub struct SourceImage {
    pub data: Arc<[u8]>,
    pub buf_index: u32,
    pub format: PixelFormat,
    pub offset: FrameOffset,
}

/// Multi-picture (MPO) composition role of a job
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct MultiImageInfo {
    pub is_primary: bool,
    pub num_images: u32,
}

/// Per-image encode request
#[derive(Debug, Clone)]
pub struct EncodeJob {
    pub session: SessionId,
    pub main: SourceImage,
    pub main_dim: ImageDims,
    pub thumbnail: Option<SourceImage>,
    pub thumb_dim: ImageDims,
    /// Destination slot; `None` lets the encoder pick (burst mode)
    pub dst_index: Option<usize>,
    /// Scratch memory the encoder may use instead of allocating
    pub work_buf: Option<Arc<[u8]>>,
    pub rotation: u32,
    pub exif: Option<ExifTable>,
    pub q3a_version: [u16; 4],
    pub metadata: Option<Metadata>,
    pub mobicat_mask: u8,
    pub multi_image: Option<MultiImageInfo>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum JpegStatus {
    Done,
    Error,
}

/// Encoded bitstream produced by a job
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct JpegOutput {
    pub data: Vec<u8>,
    pub buf_index: usize,
    pub thumbnail_len: usize,
}

/// Completion of one encode job
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct JpegEvent {
    pub job_id: JobId,
    pub status: JpegStatus,
    pub output: Option<JpegOutput>,
}

/// Encoder operations table
pub trait JpegOps: Send + Sync {
    fn create_session(
        &self,
        params: &EncodeParams,
        callback: JpegCallback,
    ) -> BackendResult<SessionId>;

    /// Queue a job; completion arrives through the session callback
    fn start_job(&self, job: EncodeJob) -> BackendResult<JobId>;

    /// Cancel a job; blocks until the job is no longer running, after which
    /// its callback will not fire
    fn abort_job(&self, job_id: JobId) -> BackendResult<()>;

    fn destroy_session(&self, session: SessionId) -> BackendResult<()>;
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_color_format_mapping() {
        assert_eq!(
            JpegColorFormat::from_pixel_format(PixelFormat::Nv21),
            JpegColorFormat::YCrCbH2V2
        );
        assert_eq!(
            JpegColorFormat::from_pixel_format(PixelFormat::Nv16),
            JpegColorFormat::YCbCrH2V1
        );
        assert_eq!(
            JpegColorFormat::from_pixel_format(PixelFormat::YOnly),
            JpegColorFormat::Monochrome
        );
        assert_eq!(
            JpegColorFormat::from_pixel_format(PixelFormat::RawBayer),
            JpegColorFormat::YCrCbH2V2
        );
    }
}
