// SPDX-License-Identifier: GPL-3.0-only

//! Offline reprocess channel
//!
//! A reprocess channel owns one offline stream per relevant stream of a
//! source channel. Frames captured on the source are mapped into the offline
//! streams and run through the hardware post-processing block; the outputs
//! arrive on this channel's own frame callback.
//!
//! Every buffer mapping made while submitting work is recorded and released
//! when the channel stops.

use super::{Channel, SharedChannel, StreamSetup};
use crate::backends::camera::{
    BufDef, BufMapping, Dimension, FeatureMask, MappedPayload, MappingBufType, Padding, PixelFormat,
    ParamStore, PerfMode, PpFeatureConfig, ReprocessConfig, ReprocessMeta, ReprocessRequest,
    Rotation, Stream, StreamAllocator, StreamHandle, StreamInfo, StreamParam, StreamType,
    StreamingMode, SuperFrame,
};
use crate::constants::{OFFLINE_INPUT_BUF_INDEX, OFFLINE_META_BUF_INDEX, OFFLINE_REPROC_NUM_BUFS};
use crate::errors::{ChannelError, ChannelResult};
use parking_lot::{Mutex, RwLock};
use std::collections::HashMap;
use std::sync::{Arc, Weak};
use tracing::{debug, error, info, warn};

/// Features already applied in real time on preview/postview streams
const ONLINE_APPLIED: FeatureMask = FeatureMask(
    FeatureMask::DENOISE2D.0 | FeatureMask::CAC.0 | FeatureMask::SHARPNESS.0 | FeatureMask::FLIP.0,
);

/// Features never re-applied to a stream that is not a snapshot
const SNAPSHOT_ONLY: FeatureMask = FeatureMask(
    FeatureMask::CAC.0
        | FeatureMask::SHARPNESS.0
        | FeatureMask::FLIP.0
        | FeatureMask::DENOISE2D.0
        | FeatureMask::CDS.0
        | FeatureMask::DSDN.0,
);

/// How the offline streams of a reprocess channel are created
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ReprocessSetup {
    pub feature_config: PpFeatureConfig,
    /// Buffers the driver keeps per offline stream
    pub buf_count: u32,
    pub burst_count: u32,
    pub padding: Padding,
    /// Continuous streaming instead of a fixed burst
    pub continuous: bool,
    /// Inputs are mapped per request instead of read from a live stream
    pub offline: bool,
}

/// A driver mapping made on an offline stream
#[derive(Debug, Clone)]
pub struct OfflineBuffer {
    pub stream: Arc<Stream>,
    pub buf_type: MappingBufType,
    pub index: u32,
}

impl OfflineBuffer {
    fn same_slot(&self, other: &OfflineBuffer) -> bool {
        self.stream.handle() == other.stream.handle()
            && self.buf_type == other.buf_type
            && self.index == other.index
    }
}

/// Channel that drives the hardware post-processing block
pub struct ReprocessChannel {
    channel: SharedChannel,
    source: Option<Weak<RwLock<Channel>>>,
    /// Source stream handle → offline stream mirroring it
    by_source: HashMap<StreamHandle, Arc<Stream>>,
    offline_bufs: Mutex<Vec<OfflineBuffer>>,
}

impl ReprocessChannel {
    /// Wrap an initialized channel
    pub fn new(channel: Channel) -> Self {
        Self {
            channel: channel.into_shared(),
            source: None,
            by_source: HashMap::new(),
            offline_bufs: Mutex::new(Vec::new()),
        }
    }

    pub fn channel(&self) -> &SharedChannel {
        &self.channel
    }

    pub fn handle(&self) -> u32 {
        self.channel.read().handle()
    }

    pub fn streams(&self) -> Vec<Arc<Stream>> {
        self.channel.read().streams().to_vec()
    }

    /// Source channel, while it is still alive
    pub fn source(&self) -> Option<SharedChannel> {
        self.source.as_ref().and_then(Weak::upgrade)
    }

    /// Mappings not yet released
    pub fn offline_buffers(&self) -> Vec<OfflineBuffer> {
        self.offline_bufs.lock().clone()
    }

    /// Offline stream created from the source stream `handle`
    pub fn get_stream_by_source_handle(&self, handle: StreamHandle) -> Option<Arc<Stream>> {
        self.by_source.get(&handle).cloned()
    }

    /// Create one offline stream per relevant stream of `source`
    ///
    /// Metadata and analysis streams are never mirrored. With offline RAW
    /// only RAW streams are, and without it RAW streams are skipped.
    /// Thumbnail-origin streams are mirrored only when a feature beyond the
    /// ones applied in real time remains.
    ///
    /// The source is committed only when every stream was created.
    pub fn add_reproc_streams_from_source(
        &mut self,
        allocator: &dyn StreamAllocator,
        setup: &ReprocessSetup,
        source: &SharedChannel,
        params: &dyn ParamStore,
    ) -> ChannelResult<()> {
        let padding = setup.padding.normalized();
        let offline_raw = params.offline_raw();
        let src = source.read();
        debug!(channel = src.handle(), streams = src.num_streams(), "Mirroring source streams");

        for index in 0..src.num_streams() {
            let Some(stream) = src.get_stream_by_index(index) else {
                continue;
            };
            let is_raw = stream.is_type_of(StreamType::Raw);
            if offline_raw != is_raw {
                continue;
            }
            if stream.is_type_of(StreamType::Metadata) || stream.is_type_of(StreamType::Analysis) {
                continue;
            }
            let thumbnail_origin = [StreamType::Preview, StreamType::Postview]
                .iter()
                .any(|t| stream.is_type_of(*t) || stream.is_original_type_of(*t));
            if thumbnail_origin || (offline_raw && is_raw) {
                let mut mask = setup.feature_config.feature_mask;
                if !params.need_thumbnail_reprocess(&mut mask) {
                    continue;
                }
                mask.remove(ONLINE_APPLIED);
                if mask.is_empty() {
                    continue;
                }
            }

            let info = offline_stream_info(&stream, setup, params);
            let info_buf = allocator.allocate_stream_info_buf(&info).map_err(|e| {
                error!(error = %e, "No memory for stream info buf");
                ChannelError::NoMemory("stream info buffer")
            })?;
            let misc_buf = allocator.allocate_misc_buf(&info).map_err(|e| {
                error!(error = %e, "No memory for misc buf");
                ChannelError::NoMemory("misc buffer")
            })?;

            let offline = self.channel.write().add_stream(StreamSetup {
                info,
                info_buf,
                misc_buf,
                padding,
                deferred: false,
            });
            let offline = match offline {
                Ok(offline) => offline,
                Err(e) => {
                    error!(error = %e, "Add reprocess stream failed");
                    return Err(e);
                }
            };
            debug!(
                source = stream.handle(),
                offline = offline.handle(),
                original_type = ?offline.original_type(),
                "Offline stream created"
            );
            self.by_source.insert(stream.handle(), offline);
        }

        self.source = Some(Arc::downgrade(source));
        Ok(())
    }

    pub fn start(&self) -> ChannelResult<()> {
        self.channel.write().start()
    }

    /// Release every recorded mapping, then stop the channel
    ///
    /// Unmap failures are logged and do not stop the drain.
    pub fn stop(&self) -> ChannelResult<()> {
        let mapped: Vec<OfflineBuffer> = std::mem::take(&mut *self.offline_bufs.lock());
        for buf in &mapped {
            if let Err(e) = buf.stream.unmap_buf(buf.buf_type, buf.index) {
                error!(
                    stream = buf.stream.handle(),
                    buf_type = ?buf.buf_type,
                    index = buf.index,
                    error = %e,
                    "Error during offline buffer unmap"
                );
            }
        }
        if !mapped.is_empty() {
            debug!(count = mapped.len(), "Offline buffers unmapped");
        }
        self.channel.write().stop()
    }

    /// Map `frame` (and optionally its metadata) into the offline streams
    /// and request one reprocess per mirrored sub-buffer
    ///
    /// The crop record of each source stream is copied in the metadata under
    /// the server ID of the offline stream producing the output.
    pub fn do_reprocess_offline(
        &self,
        frame: &SuperFrame,
        meta_buf: Option<&BufDef>,
    ) -> ChannelResult<()> {
        let source = self.checked_source()?;
        let channel = self.channel.read();

        for buf in &frame.bufs {
            let Some(stream) = self.owned_offline_stream(&channel, buf.stream_id) else {
                continue;
            };
            if stream.is_type_of(StreamType::Metadata) {
                continue;
            }

            let meta = match meta_buf {
                Some(meta) => {
                    let payload = match &meta.metadata {
                        Some(shared) => MappedPayload::Metadata(Arc::clone(shared)),
                        None => MappedPayload::External,
                    };
                    stream
                        .map_buf(&BufMapping {
                            buf_type: MappingBufType::OfflineMeta,
                            index: OFFLINE_META_BUF_INDEX,
                            fd: meta.fd,
                            len: meta.frame_len(),
                            payload,
                        })
                        .map_err(|e| {
                            error!(error = %e, "Error during metadata buffer mapping");
                            ChannelError::from(e)
                        })?;
                    self.republish_crop(&channel, &source, buf.stream_id, meta);
                    self.record(&stream, MappingBufType::OfflineMeta, OFFLINE_META_BUF_INDEX);
                    ReprocessMeta::Mapped {
                        buf_index: OFFLINE_META_BUF_INDEX,
                    }
                }
                None => ReprocessMeta::None,
            };

            stream
                .map_buf(&BufMapping {
                    buf_type: MappingBufType::OfflineInput,
                    index: OFFLINE_INPUT_BUF_INDEX,
                    fd: buf.fd,
                    len: buf.frame_len(),
                    payload: MappedPayload::Frame(Arc::clone(&buf.data)),
                })
                .map_err(|e| {
                    error!(error = %e, "Error during reprocess input buffer mapping");
                    ChannelError::from(e)
                })?;
            self.record(&stream, MappingBufType::OfflineInput, OFFLINE_INPUT_BUF_INDEX);

            let request = ReprocessRequest {
                buf_index: OFFLINE_INPUT_BUF_INDEX,
                frame_idx: buf.frame_idx,
                meta,
            };
            stream
                .set_parameter(&StreamParam::DoReprocess(request))
                .map_err(|e| {
                    error!(error = %e, "Stream setParameter for reprocess failed");
                    ChannelError::from(e)
                })?;
            debug!(
                stream = stream.handle(),
                frame_idx = buf.frame_idx,
                "Offline reprocess issued"
            );
        }
        Ok(())
    }

    /// Request reprocessing of buffers the driver already knows
    ///
    /// Metadata is referenced on `meta_stream` instead of being mapped.
    pub fn do_reprocess(
        &self,
        frame: &SuperFrame,
        params: &dyn ParamStore,
        meta_stream: Option<&Stream>,
        meta_buf_index: u32,
    ) -> ChannelResult<()> {
        self.checked_source()?;
        let channel = self.channel.read();

        for buf in &frame.bufs {
            let Some(stream) = self.owned_offline_stream(&channel, buf.stream_id) else {
                continue;
            };
            if params.offline_raw() && !stream.is_original_type_of(StreamType::Raw) {
                continue;
            }
            if stream.is_type_of(StreamType::Metadata) || stream.is_type_of(StreamType::Analysis) {
                continue;
            }

            let meta = match meta_stream {
                Some(meta) => ReprocessMeta::Stream {
                    stream_id: meta.server_id(),
                    buf_index: meta_buf_index,
                },
                None => ReprocessMeta::None,
            };
            let request = ReprocessRequest {
                buf_index: buf.buf_idx,
                frame_idx: buf.frame_idx,
                meta,
            };
            debug!(
                frame_idx = request.frame_idx,
                buf_idx = request.buf_index,
                meta_buf_index,
                "Frame for reprocessing"
            );
            stream
                .set_parameter(&StreamParam::DoReprocess(request))
                .map_err(|e| {
                    error!(error = %e, "Stream setParameter for reprocess failed");
                    ChannelError::from(e)
                })?;
        }
        Ok(())
    }

    /// Reprocess an externally owned buffer synchronously
    ///
    /// The buffer is mapped, processed and unmapped on every owned stream;
    /// the driver's result value for the last stream is returned.
    pub fn do_reprocess_fd(&self, fd: i32, len: usize) -> ChannelResult<i32> {
        let channel = self.channel.read();
        if channel.num_streams() == 0 {
            error!("No reprocess streams");
            return Err(ChannelError::NoReprocessStreams);
        }

        let index = 0;
        let mut result = Ok(0);
        for stream in channel.streams().iter().filter(|s| channel.owns(s)) {
            let mapping = BufMapping {
                buf_type: MappingBufType::OfflineInput,
                index,
                fd,
                len,
                payload: MappedPayload::External,
            };
            if let Err(e) = stream.map_buf(&mapping) {
                result = Err(e.into());
                continue;
            }
            let request = ReprocessRequest {
                buf_index: index,
                frame_idx: 0,
                meta: ReprocessMeta::None,
            };
            result = stream
                .set_parameter(&StreamParam::DoReprocess(request))
                .map_err(ChannelError::from);
            if let Err(e) = stream.unmap_buf(MappingBufType::OfflineInput, index) {
                warn!(stream = stream.handle(), error = %e, "Unmap after reprocess failed");
            }
        }
        result
    }

    fn checked_source(&self) -> ChannelResult<SharedChannel> {
        if self.channel.read().num_streams() == 0 {
            error!("No reprocess streams");
            return Err(ChannelError::NoReprocessStreams);
        }
        self.source().ok_or_else(|| {
            error!("No source channel for reprocess");
            ChannelError::NoSourceChannel
        })
    }

    fn owned_offline_stream(&self, channel: &Channel, source_handle: StreamHandle) -> Option<Arc<Stream>> {
        self.get_stream_by_source_handle(source_handle)
            .filter(|s| channel.owns(s))
    }

    fn record(&self, stream: &Arc<Stream>, buf_type: MappingBufType, index: u32) {
        let entry = OfflineBuffer {
            stream: Arc::clone(stream),
            buf_type,
            index,
        };
        let mut bufs = self.offline_bufs.lock();
        // Re-mapping a slot replaces the driver mapping
        if !bufs.iter().any(|b| b.same_slot(&entry)) {
            bufs.push(entry);
        }
    }

    fn republish_crop(
        &self,
        channel: &Channel,
        source: &SharedChannel,
        source_handle: StreamHandle,
        meta: &BufDef,
    ) {
        let Some(shared) = &meta.metadata else {
            return;
        };
        let Some(src_stream) = source.read().get_stream_by_handle(source_handle) else {
            return;
        };
        let mut metadata = shared.write();
        if !metadata.crop.has_space() {
            error!("No space to add reprocess stream crop/roi information");
            return;
        }
        let Some(entry) = metadata.crop.find(src_stream.server_id()).copied() else {
            return;
        };
        let Some(target) = channel
            .streams()
            .iter()
            .find(|s| s.original_type() == src_stream.stream_type())
        else {
            return;
        };
        let mut republished = entry;
        republished.stream_id = target.server_id();
        metadata.crop.entries.push(republished);
    }
}

impl Drop for ReprocessChannel {
    fn drop(&mut self) {
        let pending = self.offline_bufs.get_mut().len();
        if pending > 0 {
            info!(pending, "Reprocess channel dropped with mapped offline buffers");
            let _ = self.stop();
        }
    }
}

impl std::fmt::Debug for ReprocessChannel {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ReprocessChannel")
            .field("channel", &self.channel)
            .field("sources", &self.by_source.keys().collect::<Vec<_>>())
            .finish()
    }
}

/// Stream description of the offline mirror of `stream`
fn offline_stream_info(
    stream: &Stream,
    setup: &ReprocessSetup,
    params: &dyn ParamStore,
) -> StreamInfo {
    let raw_offline = params.offline_raw() && stream.is_type_of(StreamType::Raw);

    let fmt = if raw_offline {
        PixelFormat::Nv21
    } else {
        stream.format()
    };
    let mut dim = if stream.is_type_of(StreamType::Postview) || stream.is_type_of(StreamType::Preview)
    {
        params.thumbnail_size()
    } else if raw_offline {
        params.stream_dimension(StreamType::Snapshot)
    } else {
        stream.dimension()
    };

    let streaming_mode = if setup.continuous {
        StreamingMode::Continuous
    } else {
        StreamingMode::Burst {
            num_frames: setup.burst_count,
        }
    };

    let reprocess_config = if setup.offline {
        ReprocessConfig::Offline {
            input_fmt: stream.format(),
            input_dim: stream.dimension(),
            input_offset: stream.frame_offset(),
            input_type: stream.original_type(),
            num_of_bufs: OFFLINE_REPROC_NUM_BUFS,
        }
    } else {
        ReprocessConfig::Online {
            input_stream_id: stream.server_id(),
            input_stream_type: stream.original_type(),
        }
    };

    let mut pp_config = setup.feature_config;
    let is_snapshot =
        stream.is_type_of(StreamType::Snapshot) || stream.is_original_type_of(StreamType::Snapshot);
    if !is_snapshot {
        pp_config.feature_mask.remove(SNAPSHOT_ONLY);
        if params.hdr_enabled() && !params.hdr_thumbnail_process_needed() {
            pp_config.feature_mask.remove(FeatureMask::HDR);
        }
    }

    if reprocess_config.input_type() == StreamType::Snapshot {
        let flip = params.flip_mode(StreamType::Snapshot);
        if flip.is_flipped() {
            pp_config.feature_mask.insert(FeatureMask::FLIP);
            pp_config.flip = flip;
        }
    }

    if pp_config.feature_mask.contains(FeatureMask::ROTATION) && params.rotation_handled_by_reprocess()
    {
        pp_config.rotation = Rotation::from_degrees(params.jpeg_rotation());
    }

    if pp_config.feature_mask.contains(FeatureMask::SCALE) {
        if let Some(scale) = params.scale_config().filter(|s| s.under_scaling) {
            // Only snapshot frames are scaled
            if stream.is_type_of(StreamType::Snapshot) {
                let output = pp_config.scale_output.unwrap_or(scale.picture_size);
                pp_config.scale_output = Some(output);
                dim = Dimension::new(output.width, output.height);
            }
        }
    }

    StreamInfo {
        stream_type: StreamType::OfflineProc,
        fmt,
        dim,
        streaming_mode,
        num_bufs: setup.buf_count,
        pp_config,
        reprocess_config: Some(reprocess_config),
        perf_mode: PerfMode::HighPerformance,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::backends::camera::simulated::FaultInjection;
    use crate::backends::camera::{
        CaptureSettings, FlipMode, HeapAllocator, HeapMemory, ScaleConfig,
        SimulatedCamera,
    };
    use std::time::Duration;

    struct Fixture {
        sim: Arc<SimulatedCamera>,
        source: SharedChannel,
        frames: Arc<Mutex<Vec<SuperFrame>>>,
    }

    fn setup(offline: bool) -> ReprocessSetup {
        ReprocessSetup {
            feature_config: PpFeatureConfig {
                feature_mask: FeatureMask::CAC | FeatureMask::SHARPNESS | FeatureMask::HDR,
                ..Default::default()
            },
            buf_count: 2,
            burst_count: 1,
            padding: Padding::default(),
            continuous: false,
            offline,
        }
    }

    fn fixture(types: &[StreamType]) -> Fixture {
        let sim = SimulatedCamera::new();
        let frames = Arc::new(Mutex::new(Vec::new()));
        let sink = Arc::clone(&frames);
        let mut ch = Channel::new(sim.clone(), sim.camera_handle());
        ch.init(None, Arc::new(move |f: SuperFrame| sink.lock().push(f)))
            .unwrap();
        for t in types {
            let fmt = if *t == StreamType::Metadata {
                PixelFormat::Metadata
            } else {
                PixelFormat::Nv21
            };
            let info = StreamInfo::new(*t, fmt, Dimension::new(32, 24), 4);
            ch.add_stream(StreamSetup::new(info, HeapMemory::zeroed(8))).unwrap();
        }
        ch.start().unwrap();
        Fixture {
            sim,
            source: ch.into_shared(),
            frames,
        }
    }

    fn reproc_channel(fx: &Fixture, params: &CaptureSettings, offline: bool) -> ReprocessChannel {
        let mut ch = Channel::new(fx.sim.clone(), fx.sim.camera_handle());
        ch.init(None, Arc::new(|_f: SuperFrame| {})).unwrap();
        let mut reproc = ReprocessChannel::new(ch);
        reproc
            .add_reproc_streams_from_source(&HeapAllocator::new(), &setup(offline), &fx.source, params)
            .unwrap();
        reproc
    }

    fn capture(fx: &Fixture) -> SuperFrame {
        let handle = fx.source.read().handle();
        fx.sim.inject_frame(handle, 7).unwrap();
        assert!(fx.sim.wait_idle(Duration::from_secs(2)));
        fx.frames.lock().pop().unwrap()
    }

    #[test]
    fn test_mirrors_only_relevant_streams() {
        let fx = fixture(&[
            StreamType::Snapshot,
            StreamType::Preview,
            StreamType::Metadata,
            StreamType::Raw,
        ]);
        let reproc = reproc_channel(&fx, &CaptureSettings::default(), true);

        let streams = reproc.streams();
        assert_eq!(streams.len(), 1);
        let offline = &streams[0];
        assert_eq!(offline.stream_type(), StreamType::OfflineProc);
        assert_eq!(offline.original_type(), StreamType::Snapshot);
        assert_eq!(offline.info().perf_mode, PerfMode::HighPerformance);

        let snapshot = fx.source.read().streams()[0].handle();
        assert!(reproc.get_stream_by_source_handle(snapshot).is_some());
        assert!(reproc.source().is_some());
    }

    #[test]
    fn test_thumbnail_stream_mirrored_when_feature_remains() {
        let fx = fixture(&[StreamType::Snapshot, StreamType::Postview]);
        let mut params = CaptureSettings::default();
        params.thumbnail_reprocess_mask = FeatureMask::HDR;
        params.hdr = true;
        params.hdr_thumbnail = true;
        let reproc = reproc_channel(&fx, &params, true);
        let streams = reproc.streams();
        assert_eq!(streams.len(), 2);

        let thumb = &streams[1];
        assert_eq!(thumb.original_type(), StreamType::Postview);
        assert_eq!(thumb.dimension(), params.thumbnail_size);
        assert_eq!(thumb.pp_config().feature_mask, FeatureMask::HDR);
    }

    #[test]
    fn test_snapshot_flip_and_scale() {
        let fx = fixture(&[StreamType::Snapshot]);
        let mut params = CaptureSettings::default();
        params.snapshot_flip = FlipMode::VERTICAL;
        params.scale = Some(ScaleConfig {
            under_scaling: true,
            picture_size: Dimension::new(16, 12),
        });
        let mut ch = Channel::new(fx.sim.clone(), fx.sim.camera_handle());
        ch.init(None, Arc::new(|_f: SuperFrame| {})).unwrap();
        let mut reproc = ReprocessChannel::new(ch);
        let mut cfg = setup(true);
        cfg.feature_config.feature_mask.insert(FeatureMask::SCALE);
        reproc
            .add_reproc_streams_from_source(&HeapAllocator::new(), &cfg, &fx.source, &params)
            .unwrap();

        let offline = &reproc.streams()[0];
        assert!(offline.pp_config().feature_mask.contains(FeatureMask::FLIP));
        assert_eq!(offline.pp_config().flip, FlipMode::VERTICAL);
        assert_eq!(offline.dimension(), Dimension::new(16, 12));
    }

    #[test]
    fn test_offline_reprocess_maps_and_unmaps_once() {
        let fx = fixture(&[StreamType::Snapshot, StreamType::Metadata]);
        let reproc = reproc_channel(&fx, &CaptureSettings::default(), true);
        reproc.start().unwrap();

        let frame = capture(&fx);
        let meta = frame.metadata_buf().cloned();
        reproc.do_reprocess_offline(&frame, meta.as_ref()).unwrap();

        let offline = &reproc.streams()[0];
        let mapped = reproc.offline_buffers();
        assert_eq!(mapped.len(), 2);
        assert_eq!(fx.sim.active_mappings().len(), 2);

        let requests = fx.sim.reprocess_requests();
        assert_eq!(requests.len(), 1);
        assert_eq!(requests[0].0, offline.handle());
        assert_eq!(requests[0].1.buf_index, OFFLINE_INPUT_BUF_INDEX);
        assert_eq!(requests[0].1.frame_idx, 7);
        assert_eq!(
            requests[0].1.meta,
            ReprocessMeta::Mapped {
                buf_index: OFFLINE_META_BUF_INDEX
            }
        );

        // Crop republished under the offline stream
        let metadata = meta.unwrap().metadata.unwrap();
        assert!(metadata.read().crop.find(offline.server_id()).is_some());

        reproc.stop().unwrap();
        assert!(reproc.offline_buffers().is_empty());
        assert!(fx.sim.active_mappings().is_empty());
        assert_eq!(fx.sim.unmap_count(), 2);

        fx.source.read().buf_done(&frame).unwrap();
    }

    #[test]
    fn test_remapping_a_slot_is_recorded_once() {
        let fx = fixture(&[StreamType::Snapshot]);
        let reproc = reproc_channel(&fx, &CaptureSettings::default(), true);
        reproc.start().unwrap();

        let first = capture(&fx);
        let second = capture(&fx);
        reproc.do_reprocess_offline(&first, None).unwrap();
        reproc.do_reprocess_offline(&second, None).unwrap();
        assert_eq!(reproc.offline_buffers().len(), 1);

        reproc.stop().unwrap();
        assert_eq!(fx.sim.unmap_count(), 1);
    }

    #[test]
    fn test_map_failure_propagates() {
        let fx = fixture(&[StreamType::Snapshot]);
        let reproc = reproc_channel(&fx, &CaptureSettings::default(), true);
        reproc.start().unwrap();
        let frame = capture(&fx);
        fx.sim.set_faults(FaultInjection {
            fail_map: true,
            ..Default::default()
        });
        assert!(reproc.do_reprocess_offline(&frame, None).is_err());
        assert!(fx.sim.reprocess_requests().is_empty());
    }

    #[test]
    fn test_online_reprocess_references_meta_stream() {
        let fx = fixture(&[StreamType::Snapshot, StreamType::Metadata]);
        let reproc = reproc_channel(&fx, &CaptureSettings::default(), false);
        reproc.start().unwrap();

        let frame = capture(&fx);
        let meta_stream = fx.source.read().streams()[1].clone();
        reproc
            .do_reprocess(&frame, &CaptureSettings::default(), Some(&meta_stream), 3)
            .unwrap();

        let requests = fx.sim.reprocess_requests();
        assert_eq!(requests.len(), 1);
        assert_eq!(requests[0].1.buf_index, frame.bufs[0].buf_idx);
        assert_eq!(
            requests[0].1.meta,
            ReprocessMeta::Stream {
                stream_id: meta_stream.server_id(),
                buf_index: 3
            }
        );
        assert!(reproc.offline_buffers().is_empty());
    }

    #[test]
    fn test_reprocess_without_source_fails() {
        let sim = SimulatedCamera::new();
        let mut ch = Channel::new(sim.clone(), sim.camera_handle());
        ch.init(None, Arc::new(|_f: SuperFrame| {})).unwrap();
        let reproc = ReprocessChannel::new(ch);
        let frame = SuperFrame::new(1, 1, Vec::new());
        assert!(matches!(
            reproc.do_reprocess_offline(&frame, None),
            Err(ChannelError::NoReprocessStreams)
        ));
    }

    #[test]
    fn test_reprocess_fd_unmaps_immediately() {
        let fx = fixture(&[StreamType::Snapshot]);
        let reproc = reproc_channel(&fx, &CaptureSettings::default(), true);
        reproc.start().unwrap();
        assert_eq!(reproc.do_reprocess_fd(42, 1024).unwrap(), 0);
        assert!(fx.sim.active_mappings().is_empty());
        assert_eq!(fx.sim.unmap_count(), 1);
    }
}
