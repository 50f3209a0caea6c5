// SPDX-License-Identifier: GPL-3.0-only

//! Stream bundling
//!
//! A [`Channel`] groups streams that the driver starts, stops and delivers
//! together. Streams created through [`Channel::add_stream`] are owned by the
//! channel; streams imported with [`Channel::link_stream`] belong to another
//! channel and are only referenced.
//!
//! - [`picture`]: burst capture on top of a channel
//! - [`reprocess`]: offline streams mirroring a source channel

pub mod picture;
pub mod reprocess;

pub use picture::{PictureChannel, VideoChannel};
pub use reprocess::{OfflineBuffer, ReprocessChannel, ReprocessSetup};

use crate::backends::camera::{
    BackendError, BufDef, CameraHandle, CameraOps, ChannelAttr, ChannelHandle, FrameCallback,
    HeapMemory, Padding, ParamStore, ServerId, Stream, StreamHandle, StreamInfo, StreamParam,
    StreamType, SuperFrame,
};
use crate::constants::MAX_STREAM_NUM_IN_BUNDLE;
use crate::errors::{ChannelError, ChannelResult};
use parking_lot::RwLock;
use std::sync::Arc;
use tracing::{debug, error, info, warn};

/// Channel shared between its creator, the host registry and the
/// post-processor
pub type SharedChannel = Arc<RwLock<Channel>>;

/// Everything needed to create one stream on a channel
#[derive(Debug, Clone)]
pub struct StreamSetup {
    pub info: StreamInfo,
    /// Info block from [`crate::backends::camera::StreamAllocator`]
    pub info_buf: HeapMemory,
    pub misc_buf: Option<HeapMemory>,
    pub padding: Padding,
    /// Defer driver configuration to [`Channel::config`]
    pub deferred: bool,
}

impl StreamSetup {
    pub fn new(info: StreamInfo, info_buf: HeapMemory) -> Self {
        Self {
            info,
            info_buf,
            misc_buf: None,
            padding: Padding::default(),
            deferred: false,
        }
    }
}

/// A hardware-bound bundle of streams
pub struct Channel {
    ops: Arc<dyn CameraOps>,
    camera_handle: CameraHandle,
    handle: ChannelHandle,
    streams: Vec<Arc<Stream>>,
    active: bool,
}

impl Channel {
    pub fn new(ops: Arc<dyn CameraOps>, camera_handle: CameraHandle) -> Self {
        Self {
            ops,
            camera_handle,
            handle: 0,
            streams: Vec::new(),
            active: false,
        }
    }

    /// Wrap into the shared form used by the host and the post-processor
    pub fn into_shared(self) -> SharedChannel {
        Arc::new(RwLock::new(self))
    }

    /// Register with the driver; frames for this channel go to `callback`
    pub fn init(&mut self, attr: Option<ChannelAttr>, callback: FrameCallback) -> ChannelResult<()> {
        let handle = self
            .ops
            .add_channel(self.camera_handle, attr, callback)
            .map_err(|e| {
                error!(error = %e, "Add channel failed");
                ChannelError::from(e)
            })?;
        if handle == 0 {
            error!("Driver returned a null channel handle");
            return Err(ChannelError::NotInitialized);
        }
        self.handle = handle;
        debug!(channel = handle, "Channel initialized");
        Ok(())
    }

    /// Create a stream owned by this channel
    ///
    /// Fails with [`ChannelError::BundleFull`] once the bundle holds
    /// `MAX_STREAM_NUM_IN_BUNDLE` streams; the info buffer is dropped.
    pub fn add_stream(&mut self, setup: StreamSetup) -> ChannelResult<Arc<Stream>> {
        if self.handle == 0 {
            return Err(ChannelError::NotInitialized);
        }
        if self.streams.len() >= MAX_STREAM_NUM_IN_BUNDLE {
            error!(
                channel = self.handle,
                streams = self.streams.len(),
                max = MAX_STREAM_NUM_IN_BUNDLE,
                "Stream count exceeds bundle limit"
            );
            drop(setup.info_buf);
            return Err(ChannelError::BundleFull {
                max: MAX_STREAM_NUM_IN_BUNDLE,
            });
        }

        let (stream_handle, server_id) =
            self.ops
                .add_stream(self.camera_handle, self.handle, &setup.info)?;
        let stream = Arc::new(
            Stream::new(
                Arc::clone(&self.ops),
                self.camera_handle,
                self.handle,
                stream_handle,
                server_id,
                setup.info,
                setup.padding,
                setup.info_buf,
                setup.misc_buf,
            )
            .with_deferred_config(setup.deferred),
        );
        self.streams.push(Arc::clone(&stream));
        Ok(stream)
    }

    /// Apply driver configuration to streams created with `deferred` set
    pub fn config(&self) -> ChannelResult<()> {
        for stream in self.streams.iter().filter(|s| s.is_deferred()) {
            stream.configure()?;
        }
        Ok(())
    }

    /// Import a stream owned by `source` into this bundle
    pub fn link_stream(&mut self, source: &Channel, stream: Arc<Stream>) -> ChannelResult<()> {
        if self.handle == 0 {
            return Err(ChannelError::NotInitialized);
        }
        self.ops
            .link_stream(self.camera_handle, source.handle, stream.handle(), self.handle)
            .map_err(|e| {
                error!(error = %e, stream = stream.handle(), "Linking of stream failed");
                ChannelError::from(e)
            })?;
        self.streams.push(stream);
        Ok(())
    }

    /// Start owned streams, then the channel
    ///
    /// When the driver bundles more than one stream every non-metadata member
    /// is told the bundle layout first. A failed channel start stops the
    /// streams again.
    pub fn start(&mut self) -> ChannelResult<()> {
        if self.streams.len() > 1 {
            let first = self.streams[0].handle();
            let bundle = self
                .ops
                .get_bundle_info(self.camera_handle, self.handle, first)
                .map_err(|e| {
                    error!(error = %e, "get_bundle_info failed");
                    ChannelError::from(e)
                })?;
            if bundle.stream_ids.len() > 1 {
                for server_id in &bundle.stream_ids {
                    let Some(stream) = self.get_stream_by_server_id(*server_id) else {
                        continue;
                    };
                    // Reprocess hardware cannot consume metadata
                    if stream.is_type_of(StreamType::Metadata) {
                        continue;
                    }
                    stream.set_bundle_info(&bundle).map_err(|e| {
                        error!(error = %e, "Set bundle info failed");
                        ChannelError::from(e)
                    })?;
                }
            }
        }

        for stream in self.owned_streams() {
            if let Err(e) = stream.start() {
                warn!(stream = stream.handle(), error = %e, "Stream start failed");
            }
        }

        if let Err(e) = self.ops.start_channel(self.camera_handle, self.handle) {
            error!(channel = self.handle, error = %e, "Channel start failed");
            for stream in self.owned_streams() {
                if let Err(e) = stream.stop() {
                    warn!(stream = stream.handle(), error = %e, "Stream stop failed");
                }
            }
            return Err(e.into());
        }

        self.active = true;
        for stream in &self.streams {
            stream.cond_signal();
        }
        info!(channel = self.handle, streams = self.streams.len(), "Channel started");
        Ok(())
    }

    /// Stop owned streams and the channel; linked streams leave the bundle
    pub fn stop(&mut self) -> ChannelResult<()> {
        if !self.active {
            return Err(ChannelError::NotInitialized);
        }
        for stream in self.owned_streams() {
            if let Err(e) = stream.stop() {
                warn!(stream = stream.handle(), error = %e, "Stream stop failed");
            }
        }
        let handle = self.handle;
        self.streams.retain(|s| s.channel_handle() == handle);

        let result = self.ops.stop_channel(self.camera_handle, self.handle);
        self.active = false;
        info!(channel = self.handle, "Channel stopped");
        result.map_err(ChannelError::from)
    }

    /// Return every sub-buffer of `frame` to the stream that produced it
    ///
    /// All sub-buffers are attempted; the last failure is reported.
    pub fn buf_done(&self, frame: &SuperFrame) -> ChannelResult<()> {
        let mut result = Ok(());
        for buf in &frame.bufs {
            if let Err(e) = self.buf_done_one(buf) {
                result = Err(e);
            }
        }
        result
    }

    /// Return a single sub-buffer
    pub fn buf_done_one(&self, buf: &BufDef) -> ChannelResult<()> {
        match self.get_stream_by_handle(buf.stream_id) {
            Some(stream) => stream.buf_done(buf).map_err(|e| {
                warn!(
                    stream = buf.stream_id,
                    buf_idx = buf.buf_idx,
                    error = %e,
                    "Buffer return failed"
                );
                ChannelError::from(e)
            }),
            None => {
                warn!(
                    channel = self.handle,
                    stream = buf.stream_id,
                    "Buffer belongs to no stream of this channel"
                );
                Err(BackendError::InvalidHandle(format!("stream {}", buf.stream_id)).into())
            }
        }
    }

    /// Push per-type flip settings to matching owned streams
    ///
    /// A failing stream is logged and the remaining streams are still
    /// updated; the last error is returned.
    pub fn update_stream_based_parameters(&self, params: &dyn ParamStore) -> ChannelResult<()> {
        let mut result = Ok(());
        let groups: [&[StreamType]; 3] = [
            &[StreamType::Preview],
            &[StreamType::Video],
            &[StreamType::Snapshot, StreamType::Postview],
        ];
        for types in groups {
            let lead = types[0];
            if !params.flip_changed(lead) {
                continue;
            }
            let flip = params.flip_mode(lead);
            for stream in self.owned_streams() {
                let matches = types
                    .iter()
                    .any(|t| stream.is_type_of(*t) || stream.is_original_type_of(*t));
                if !matches {
                    continue;
                }
                if let Err(e) = stream.set_parameter(&StreamParam::SetFlip(flip)) {
                    warn!(stream = stream.handle(), error = %e, "Set flip failed");
                    result = Err(e.into());
                }
            }
        }
        result
    }

    // ===== Lookups =====

    pub fn get_stream_by_handle(&self, handle: StreamHandle) -> Option<Arc<Stream>> {
        self.streams.iter().find(|s| s.handle() == handle).cloned()
    }

    pub fn get_stream_by_server_id(&self, server_id: ServerId) -> Option<Arc<Stream>> {
        self.streams
            .iter()
            .find(|s| s.server_id() == server_id)
            .cloned()
    }

    pub fn get_stream_by_index(&self, index: usize) -> Option<Arc<Stream>> {
        if index >= MAX_STREAM_NUM_IN_BUNDLE {
            return None;
        }
        self.streams.get(index).cloned()
    }

    pub fn streams(&self) -> &[Arc<Stream>] {
        &self.streams
    }

    pub fn num_streams(&self) -> usize {
        self.streams.len()
    }

    pub fn handle(&self) -> ChannelHandle {
        self.handle
    }

    pub fn camera_handle(&self) -> CameraHandle {
        self.camera_handle
    }

    pub fn is_active(&self) -> bool {
        self.active
    }

    /// Whether `stream` was created by (not linked into) this channel
    pub fn owns(&self, stream: &Stream) -> bool {
        self.handle != 0 && stream.channel_handle() == self.handle
    }

    pub(crate) fn ops(&self) -> &Arc<dyn CameraOps> {
        &self.ops
    }

    fn owned_streams(&self) -> impl Iterator<Item = &Arc<Stream>> {
        let handle = self.handle;
        self.streams
            .iter()
            .filter(move |s| s.channel_handle() == handle)
    }

    /// Stop if active, delete owned streams and unregister from the driver
    pub fn delete(&mut self) {
        if self.handle == 0 {
            return;
        }
        if self.active {
            if let Err(e) = self.stop() {
                warn!(channel = self.handle, error = %e, "Channel stop before delete failed");
            }
        }
        for stream in self.owned_streams() {
            if let Err(e) = stream.delete() {
                warn!(stream = stream.handle(), error = %e, "Stream delete failed");
            }
        }
        self.streams.clear();
        if let Err(e) = self.ops.delete_channel(self.camera_handle, self.handle) {
            warn!(channel = self.handle, error = %e, "Channel delete failed");
        }
        debug!(channel = self.handle, "Channel deleted");
        self.handle = 0;
    }
}

impl Drop for Channel {
    fn drop(&mut self) {
        self.delete();
    }
}

impl std::fmt::Debug for Channel {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Channel")
            .field("handle", &self.handle)
            .field("active", &self.active)
            .field("streams", &self.streams)
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::backends::camera::simulated::FaultInjection;
    use crate::backends::camera::{
        CaptureSettings, Dimension, FlipMode, HeapAllocator, PixelFormat, SimulatedCamera,
        StreamAllocator,
    };

    fn setup(stream_type: StreamType) -> StreamSetup {
        let info = StreamInfo::new(stream_type, PixelFormat::Nv21, Dimension::new(32, 24), 4);
        let info_buf = HeapAllocator::new().allocate_stream_info_buf(&info).unwrap();
        StreamSetup::new(info, info_buf)
    }

    fn channel(sim: &Arc<SimulatedCamera>) -> Channel {
        let mut ch = Channel::new(sim.clone(), sim.camera_handle());
        ch.init(None, Arc::new(|_frame: SuperFrame| {})).unwrap();
        ch
    }

    #[test]
    fn test_add_stream_requires_init() {
        let sim = SimulatedCamera::new();
        let mut ch = Channel::new(sim.clone(), sim.camera_handle());
        assert!(matches!(
            ch.add_stream(setup(StreamType::Snapshot)),
            Err(ChannelError::NotInitialized)
        ));
    }

    #[test]
    fn test_bundle_cap() {
        let sim = SimulatedCamera::new();
        let mut ch = channel(&sim);
        for _ in 0..MAX_STREAM_NUM_IN_BUNDLE {
            ch.add_stream(setup(StreamType::Snapshot)).unwrap();
        }
        assert!(matches!(
            ch.add_stream(setup(StreamType::Snapshot)),
            Err(ChannelError::BundleFull { .. })
        ));
        assert_eq!(ch.num_streams(), MAX_STREAM_NUM_IN_BUNDLE);
        assert!(ch.get_stream_by_index(MAX_STREAM_NUM_IN_BUNDLE).is_none());
    }

    #[test]
    fn test_start_sets_bundle_info_on_image_streams() {
        let sim = SimulatedCamera::new();
        let mut ch = channel(&sim);
        let snapshot = ch.add_stream(setup(StreamType::Snapshot)).unwrap();
        let meta = ch.add_stream(setup(StreamType::Metadata)).unwrap();
        ch.start().unwrap();

        let bundled: Vec<_> = sim
            .stream_params()
            .into_iter()
            .filter(|(_, p)| matches!(p, StreamParam::SetBundleInfo(_)))
            .map(|(s, _)| s)
            .collect();
        assert_eq!(bundled, vec![snapshot.handle()]);
        assert!(sim.stream_running(meta.handle()));
        assert!(ch.is_active());
    }

    #[test]
    fn test_failed_start_rolls_back_streams() {
        let sim = SimulatedCamera::new();
        let mut ch = channel(&sim);
        let stream = ch.add_stream(setup(StreamType::Snapshot)).unwrap();
        sim.set_faults(FaultInjection {
            fail_channel_start: true,
            ..Default::default()
        });
        assert!(ch.start().is_err());
        assert!(!sim.stream_running(stream.handle()));
        assert!(!ch.is_active());
    }

    #[test]
    fn test_stop_twice_reports_not_initialized() {
        let sim = SimulatedCamera::new();
        let mut ch = channel(&sim);
        ch.add_stream(setup(StreamType::Snapshot)).unwrap();
        ch.start().unwrap();
        ch.stop().unwrap();
        assert!(matches!(ch.stop(), Err(ChannelError::NotInitialized)));
    }

    #[test]
    fn test_linked_stream_not_deleted_and_dropped_on_stop() {
        let sim = SimulatedCamera::new();
        let mut owner = channel(&sim);
        let shared = owner.add_stream(setup(StreamType::Preview)).unwrap();
        let mut other = channel(&sim);
        other.add_stream(setup(StreamType::Snapshot)).unwrap();
        other.link_stream(&owner, Arc::clone(&shared)).unwrap();
        assert_eq!(other.num_streams(), 2);
        assert!(!other.owns(&shared));

        other.start().unwrap();
        assert!(!sim.stream_running(shared.handle()));
        other.stop().unwrap();
        assert_eq!(other.num_streams(), 1);

        drop(other);
        assert_eq!(sim.stream_count(), 1);
        drop(owner);
        assert_eq!(sim.stream_count(), 0);
    }

    #[test]
    fn test_delete_reclaims_buffers_still_out() {
        let sim = SimulatedCamera::new();
        let mut ch = channel(&sim);
        ch.add_stream(setup(StreamType::Snapshot)).unwrap();
        ch.add_stream(setup(StreamType::Metadata)).unwrap();
        ch.start().unwrap();
        sim.inject_frame(ch.handle(), 0).unwrap();
        assert!(sim.wait_idle(std::time::Duration::from_secs(2)));
        assert_eq!(sim.outstanding(), 2);

        ch.delete();
        assert_eq!(sim.outstanding(), 0);
        assert_eq!(sim.reclaimed(), 2);
        assert_eq!(sim.double_returns(), 0);
    }

    #[test]
    fn test_flip_pushed_to_snapshot_group() {
        let sim = SimulatedCamera::new();
        let mut ch = channel(&sim);
        let snapshot = ch.add_stream(setup(StreamType::Snapshot)).unwrap();
        ch.add_stream(setup(StreamType::Preview)).unwrap();
        let mut params = CaptureSettings::default();
        params.snapshot_flip = FlipMode::HORIZONTAL;
        ch.update_stream_based_parameters(&params).unwrap();

        let flips: Vec<_> = sim
            .stream_params()
            .into_iter()
            .filter(|(_, p)| matches!(p, StreamParam::SetFlip(_)))
            .collect();
        assert_eq!(
            flips,
            vec![(snapshot.handle(), StreamParam::SetFlip(FlipMode::HORIZONTAL))]
        );
    }
}
