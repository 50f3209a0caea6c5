// SPDX-License-Identifier: GPL-3.0-only

//! Parameter and metadata store interface

use super::types::*;
use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use std::sync::atomic::{AtomicU8, Ordering};

/// Role of this camera in a synchronized multi-camera (MPO) capture
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum MpoRole {
    Primary,
    Secondary,
}

/// Offline scaling request
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct ScaleConfig {
    /// Output is smaller than the sensor picture size
    pub under_scaling: bool,
    /// Picture size the application asked for
    pub picture_size: Dimension,
}

/// Feature queries and per-frame state published by the capture layer
///
/// All methods take `&self`; implementations synchronize their own mutable
/// state because the store is consulted from driver callback threads and the
/// post-processor worker at the same time.
pub trait ParamStore: Send + Sync {
    // ===== Reprocess configuration =====

    fn reprocess_needed(&self) -> bool;
    /// Recompute the number of reprocess passes from the active features
    fn set_reproc_count(&self);
    fn reproc_count(&self) -> u8;
    fn set_cur_pp_count(&self, count: u8);
    fn cur_pp_count(&self) -> u8;
    fn offline_raw(&self) -> bool;
    fn reprocess_burst_count(&self) -> u32;
    fn reprocess_buf_count(&self) -> u32;
    /// Features to run on each reprocess pass
    fn pp_feature_config(&self) -> PpFeatureConfig;
    /// Whether a thumbnail-origin stream still needs reprocessing; may
    /// narrow `mask` to the features it needs
    fn need_thumbnail_reprocess(&self, mask: &mut FeatureMask) -> bool;
    fn scale_config(&self) -> Option<ScaleConfig>;
    fn in_bufs_for_single_shot(&self) -> u32;
    fn out_bufs_for_single_shot(&self) -> u32;

    // ===== Capture mode =====

    fn regular_capture(&self) -> bool;
    fn zsl_mode(&self) -> bool;
    fn longshot_enabled(&self) -> bool;
    fn low_power_mode(&self) -> bool;
    /// Picture format is NV16/NV21 raw passthrough
    fn raw_picture_format(&self) -> bool;
    fn yuv_frame_info_needed(&self) -> bool;
    fn adv_cam_features_enabled(&self) -> bool;

    // ===== Features =====

    fn hdr_enabled(&self) -> bool;
    fn hdr_thumbnail_process_needed(&self) -> bool;
    fn hdr_output_crop_enabled(&self) -> bool;
    /// Ubifocus, refocus, chroma flash, optizoom or still-more active
    fn image_feature_crop_enabled(&self) -> bool;
    fn refocus_enabled(&self) -> bool;
    fn refocus_output_count(&self) -> u32;
    fn flip_mode(&self, stream_type: StreamType) -> FlipMode;
    fn flip_changed(&self, stream_type: StreamType) -> bool;
    fn stream_dimension(&self, stream_type: StreamType) -> Dimension;

    // ===== JPEG =====

    fn thumbnail_size(&self) -> Dimension;
    fn generate_thumb_from_main(&self) -> bool;
    fn jpeg_rotation(&self) -> u32;
    /// Rotation is applied by a reprocess pass instead of the encoder
    fn rotation_handled_by_reprocess(&self) -> bool;
    fn jpeg_quality(&self) -> u32;
    fn mobicat_mask(&self) -> u8;
    fn exif_buf_index(&self, pp_index: usize) -> usize;
    fn mpo_role(&self) -> Option<MpoRole>;
    fn q3a_version(&self) -> [u16; 4];

    // ===== Published state =====

    fn update_metadata(&self, metadata: &Metadata);
    fn set_yuv_frame_info(&self, info: YuvFrameInfo);
}

/// Plain-data parameter store
///
/// Loaded from JSON by the CLI and built directly by tests.
#[derive(Debug, Serialize, Deserialize)]
#[serde(default)]
pub struct CaptureSettings {
    pub reprocess_passes: u8,
    pub offline_raw: bool,
    pub reprocess_burst: u32,
    pub reprocess_bufs: u32,
    pub pp_features: PpFeatureConfig,
    pub thumbnail_reprocess_mask: FeatureMask,
    pub scale: Option<ScaleConfig>,
    pub in_bufs_per_shot: u32,
    pub out_bufs_per_shot: u32,
    pub regular_capture: bool,
    pub zsl: bool,
    pub longshot: bool,
    pub low_power: bool,
    pub raw_picture: bool,
    pub yuv_frame_info: bool,
    pub adv_features: bool,
    pub hdr: bool,
    pub hdr_thumbnail: bool,
    pub hdr_output_crop: bool,
    pub image_feature_crop: bool,
    pub refocus: bool,
    pub refocus_outputs: u32,
    pub preview_flip: FlipMode,
    pub video_flip: FlipMode,
    pub snapshot_flip: FlipMode,
    pub snapshot_size: Dimension,
    pub thumbnail_size: Dimension,
    pub thumb_from_main: bool,
    pub jpeg_rotation: u32,
    pub rotation_by_reprocess: bool,
    pub jpeg_quality: u32,
    pub mobicat_mask: u8,
    pub mpo: Option<MpoRole>,
    pub q3a_version: [u16; 4],
    #[serde(skip)]
    reproc_count: AtomicU8,
    #[serde(skip)]
    cur_pp_count: AtomicU8,
    #[serde(skip)]
    last_metadata: Mutex<Option<Metadata>>,
    #[serde(skip)]
    yuv_info: Mutex<Option<YuvFrameInfo>>,
}

impl Default for CaptureSettings {
    fn default() -> Self {
        Self {
            reprocess_passes: 0,
            offline_raw: false,
            reprocess_burst: 1,
            reprocess_bufs: 2,
            pp_features: PpFeatureConfig::default(),
            thumbnail_reprocess_mask: FeatureMask::NONE,
            scale: None,
            in_bufs_per_shot: 1,
            out_bufs_per_shot: 1,
            regular_capture: false,
            zsl: false,
            longshot: false,
            low_power: false,
            raw_picture: false,
            yuv_frame_info: false,
            adv_features: false,
            hdr: false,
            hdr_thumbnail: false,
            hdr_output_crop: false,
            image_feature_crop: false,
            refocus: false,
            refocus_outputs: 0,
            preview_flip: FlipMode::NONE,
            video_flip: FlipMode::NONE,
            snapshot_flip: FlipMode::NONE,
            snapshot_size: Dimension::new(640, 480),
            thumbnail_size: Dimension::new(160, 120),
            thumb_from_main: false,
            jpeg_rotation: 0,
            rotation_by_reprocess: false,
            jpeg_quality: 0,
            mobicat_mask: 0,
            mpo: None,
            q3a_version: [0; 4],
            reproc_count: AtomicU8::new(0),
            cur_pp_count: AtomicU8::new(0),
            last_metadata: Mutex::new(None),
            yuv_info: Mutex::new(None),
        }
    }
}

impl CaptureSettings {
    /// Settings with `passes` reprocess passes enabled
    pub fn with_reprocess(passes: u8) -> Self {
        Self {
            reprocess_passes: passes,
            ..Default::default()
        }
    }

    /// Metadata most recently published by the pipeline
    pub fn last_metadata(&self) -> Option<Metadata> {
        self.last_metadata.lock().clone()
    }

    pub fn yuv_frame_info(&self) -> Option<YuvFrameInfo> {
        self.yuv_info.lock().clone()
    }
}

impl ParamStore for CaptureSettings {
    fn reprocess_needed(&self) -> bool {
        self.reprocess_passes > 0
    }

    fn set_reproc_count(&self) {
        self.reproc_count
            .store(self.reprocess_passes, Ordering::SeqCst);
    }

    fn reproc_count(&self) -> u8 {
        self.reproc_count.load(Ordering::SeqCst)
    }

    fn set_cur_pp_count(&self, count: u8) {
        self.cur_pp_count.store(count, Ordering::SeqCst);
    }

    fn cur_pp_count(&self) -> u8 {
        self.cur_pp_count.load(Ordering::SeqCst)
    }

    fn offline_raw(&self) -> bool {
        self.offline_raw
    }

    fn reprocess_burst_count(&self) -> u32 {
        self.reprocess_burst
    }

    fn reprocess_buf_count(&self) -> u32 {
        self.reprocess_bufs
    }

    fn pp_feature_config(&self) -> PpFeatureConfig {
        self.pp_features
    }

    fn need_thumbnail_reprocess(&self, mask: &mut FeatureMask) -> bool {
        if self.thumbnail_reprocess_mask.is_empty() {
            return false;
        }
        mask.0 &= self.thumbnail_reprocess_mask.0;
        !mask.is_empty()
    }

    fn scale_config(&self) -> Option<ScaleConfig> {
        self.scale
    }

    fn in_bufs_for_single_shot(&self) -> u32 {
        self.in_bufs_per_shot.max(1)
    }

    fn out_bufs_for_single_shot(&self) -> u32 {
        self.out_bufs_per_shot.max(1)
    }

    fn regular_capture(&self) -> bool {
        self.regular_capture
    }

    fn zsl_mode(&self) -> bool {
        self.zsl
    }

    fn longshot_enabled(&self) -> bool {
        self.longshot
    }

    fn low_power_mode(&self) -> bool {
        self.low_power
    }

    fn raw_picture_format(&self) -> bool {
        self.raw_picture
    }

    fn yuv_frame_info_needed(&self) -> bool {
        self.yuv_frame_info
    }

    fn adv_cam_features_enabled(&self) -> bool {
        self.adv_features
    }

    fn hdr_enabled(&self) -> bool {
        self.hdr
    }

    fn hdr_thumbnail_process_needed(&self) -> bool {
        self.hdr_thumbnail
    }

    fn hdr_output_crop_enabled(&self) -> bool {
        self.hdr_output_crop
    }

    fn image_feature_crop_enabled(&self) -> bool {
        self.image_feature_crop || self.refocus
    }

    fn refocus_enabled(&self) -> bool {
        self.refocus
    }

    fn refocus_output_count(&self) -> u32 {
        self.refocus_outputs
    }

    fn flip_mode(&self, stream_type: StreamType) -> FlipMode {
        match stream_type {
            StreamType::Preview => self.preview_flip,
            StreamType::Video => self.video_flip,
            StreamType::Snapshot | StreamType::Postview => self.snapshot_flip,
            _ => FlipMode::NONE,
        }
    }

    fn flip_changed(&self, stream_type: StreamType) -> bool {
        self.flip_mode(stream_type).is_flipped()
    }

    fn stream_dimension(&self, stream_type: StreamType) -> Dimension {
        match stream_type {
            StreamType::Preview | StreamType::Postview => self.thumbnail_size,
            _ => self.snapshot_size,
        }
    }

    fn thumbnail_size(&self) -> Dimension {
        self.thumbnail_size
    }

    fn generate_thumb_from_main(&self) -> bool {
        self.thumb_from_main
    }

    fn jpeg_rotation(&self) -> u32 {
        self.jpeg_rotation
    }

    fn rotation_handled_by_reprocess(&self) -> bool {
        self.rotation_by_reprocess
    }

    fn jpeg_quality(&self) -> u32 {
        self.jpeg_quality
    }

    fn mobicat_mask(&self) -> u8 {
        self.mobicat_mask
    }

    fn exif_buf_index(&self, pp_index: usize) -> usize {
        pp_index
    }

    fn mpo_role(&self) -> Option<MpoRole> {
        self.mpo
    }

    fn q3a_version(&self) -> [u16; 4] {
        self.q3a_version
    }

    fn update_metadata(&self, metadata: &Metadata) {
        *self.last_metadata.lock() = Some(metadata.clone());
    }

    fn set_yuv_frame_info(&self, info: YuvFrameInfo) {
        *self.yuv_info.lock() = Some(info);
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_reproc_count_latched_on_set() {
        let settings = CaptureSettings::with_reprocess(2);
        assert_eq!(settings.reproc_count(), 0);
        settings.set_reproc_count();
        assert_eq!(settings.reproc_count(), 2);
    }

    #[test]
    fn test_thumbnail_reprocess_narrows_mask() {
        let settings = CaptureSettings {
            thumbnail_reprocess_mask: FeatureMask::HDR,
            ..Default::default()
        };
        let mut mask = FeatureMask::HDR | FeatureMask::CAC;
        assert!(settings.need_thumbnail_reprocess(&mut mask));
        assert_eq!(mask, FeatureMask::HDR);

        let plain = CaptureSettings::default();
        let mut mask = FeatureMask::HDR;
        assert!(!plain.need_thumbnail_reprocess(&mut mask));
    }

    #[test]
    fn test_settings_deserialize_partial_json() {
        let settings: CaptureSettings =
            serde_json::from_str(r#"{"reprocess_passes": 3, "zsl": true}"#).unwrap();
        assert_eq!(settings.reprocess_passes, 3);
        assert!(settings.zsl);
        assert_eq!(settings.thumbnail_size, Dimension::new(160, 120));
    }
}
