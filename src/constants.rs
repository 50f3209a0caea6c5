// SPDX-License-Identifier: GPL-3.0-only

//! Pipeline-wide constants

use serde::{Deserialize, Serialize};

/// Maximum number of streams a channel can bundle together
pub const MAX_STREAM_NUM_IN_BUNDLE: usize = 8;

/// Maximum number of per-stream crop records carried in one metadata buffer
pub const MAX_NUM_STREAMS: usize = 8;

/// Maximum number of entries in an EXIF table
pub const MAX_EXIF_TABLE_ENTRIES: usize = 17;

/// JPEG quality used when the parameter store reports 0
pub const DEFAULT_JPEG_QUALITY: u32 = 85;

/// Destination buffers allocated for a burst encode session
pub const MAX_JPEG_BURST: u32 = 2;

/// Offline-metadata mapping slot on a reprocess stream
pub const OFFLINE_META_BUF_INDEX: u32 = 0;

/// Offline-input mapping slot on a reprocess stream
pub const OFFLINE_INPUT_BUF_INDEX: u32 = 1;

/// Input buffers declared for an offline reprocess stream
pub const OFFLINE_REPROC_NUM_BUFS: u32 = 2;

/// File name template used by the save worker (`{}` is the frame counter)
pub const STORE_FILE_TEMPLATE: &str = "img_{}.jpg";

/// Save location used when no pictures directory can be resolved
pub const FALLBACK_STORE_LOCATION: &str = "/sdcard/img_{}.jpg";

/// JPEG rotation applied by the encoder
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
pub enum JpegRotation {
    #[default]
    Deg0,
    Deg90,
    Deg180,
    Deg270,
}

impl JpegRotation {
    /// All rotations in clockwise order
    pub const ALL: [JpegRotation; 4] = [
        JpegRotation::Deg0,
        JpegRotation::Deg90,
        JpegRotation::Deg180,
        JpegRotation::Deg270,
    ];

    /// Map a degree value from the parameter store; anything off the
    /// quarter-turn grid is treated as no rotation
    pub fn from_degrees(degrees: u32) -> Self {
        match degrees % 360 {
            90 => JpegRotation::Deg90,
            180 => JpegRotation::Deg180,
            270 => JpegRotation::Deg270,
            _ => JpegRotation::Deg0,
        }
    }

    pub fn degrees(&self) -> u32 {
        match self {
            JpegRotation::Deg0 => 0,
            JpegRotation::Deg90 => 90,
            JpegRotation::Deg180 => 180,
            JpegRotation::Deg270 => 270,
        }
    }

    /// Whether width and height trade places after rotating
    pub fn swaps_dimensions(&self) -> bool {
        matches!(self, JpegRotation::Deg90 | JpegRotation::Deg270)
    }
}

/// Build-time version information
pub mod app_info {
    /// Version string stamped by the build script
    pub fn version() -> &'static str {
        env!("GIT_VERSION")
    }
}
