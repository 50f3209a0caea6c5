// SPDX-License-Identifier: GPL-3.0-only

//! Simulated capture session
//!
//! [`SimulatedHost`] plays the hardware-interface owner around a
//! [`PostProcessor`]: it owns a capture channel on the simulated driver, the
//! parameter store and a [`RecordingNotifier`] that keeps every event the
//! pipeline emits. The CLI and the integration tests drive the pipeline
//! through it.

use crate::backends::camera::{
    CameraOps, CaptureSettings, ChannelHandle, Dimension, FrameCallback, HeapAllocator,
    HeapMemory, Metadata, Padding, ParamStore, PixelFormat, SimulatedCamera, StreamAllocator,
    StreamInfo, StreamType, SuperFrame,
};
use crate::backends::jpeg::exif::tags;
use crate::backends::jpeg::{ExifTable, ExifValue};
use crate::channels::{Channel, ReprocessChannel, ReprocessSetup, SharedChannel, StreamSetup};
use crate::constants::{JpegRotation, app_info};
use crate::errors::{PostProcError, PostProcResult};
use crate::pipelines::postproc::{
    CallbackEvent, CameraHost, MsgType, Notifier, ReleaseStatus, WeakPostProcessor,
};
use parking_lot::{Condvar, Mutex, RwLock};
use std::collections::HashSet;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, AtomicU32, Ordering};
use std::time::{Duration, Instant};
use tracing::{debug, info, warn};

const CAPTURE_BUFS: u32 = 4;
const PREVIEW_SIZE: Dimension = Dimension::new(320, 240);

/// A data event as the application saw it
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DeliveredImage {
    pub msg: MsgType,
    pub data: Vec<u8>,
    pub index: u32,
    pub metadata: Option<Metadata>,
}

#[derive(Default)]
struct Recorded {
    images: Vec<DeliveredImage>,
    notifications: Vec<(MsgType, i32, i32)>,
}

/// Notifier that records events and acknowledges them immediately
pub struct RecordingNotifier {
    recorded: Mutex<Recorded>,
    changed: Condvar,
    enabled: RwLock<HashSet<MsgType>>,
    data_callback: AtomicBool,
    reject: AtomicBool,
}

impl Default for RecordingNotifier {
    fn default() -> Self {
        Self {
            recorded: Mutex::new(Recorded::default()),
            changed: Condvar::new(),
            enabled: RwLock::new(
                [MsgType::CompressedImage, MsgType::Shutter, MsgType::Error]
                    .into_iter()
                    .collect(),
            ),
            data_callback: AtomicBool::new(true),
            reject: AtomicBool::new(false),
        }
    }
}

impl RecordingNotifier {
    pub fn enable(&self, msg: MsgType, enabled: bool) {
        let mut set = self.enabled.write();
        if enabled {
            set.insert(msg);
        } else {
            set.remove(&msg);
        }
    }

    pub fn set_data_callback(&self, present: bool) {
        self.data_callback.store(present, Ordering::SeqCst);
    }

    /// Refuse every data event, as an application that cannot take more
    pub fn set_reject(&self, reject: bool) {
        self.reject.store(reject, Ordering::SeqCst);
    }

    pub fn images(&self) -> Vec<DeliveredImage> {
        self.recorded.lock().images.clone()
    }

    pub fn images_of(&self, msg: MsgType) -> Vec<DeliveredImage> {
        self.recorded
            .lock()
            .images
            .iter()
            .filter(|i| i.msg == msg)
            .cloned()
            .collect()
    }

    pub fn notifications(&self) -> Vec<(MsgType, i32, i32)> {
        self.recorded.lock().notifications.clone()
    }

    pub fn error_count(&self) -> usize {
        self.recorded
            .lock()
            .notifications
            .iter()
            .filter(|(msg, _, _)| *msg == MsgType::Error)
            .count()
    }

    /// Wait until `count` events of kind `msg` arrived
    pub fn wait_for(&self, msg: MsgType, count: usize, timeout: Duration) -> bool {
        let deadline = Instant::now() + timeout;
        let mut recorded = self.recorded.lock();
        loop {
            let seen = recorded.images.iter().filter(|i| i.msg == msg).count()
                + recorded
                    .notifications
                    .iter()
                    .filter(|(m, _, _)| *m == msg)
                    .count();
            if seen >= count {
                return true;
            }
            if self.changed.wait_until(&mut recorded, deadline).timed_out() {
                return false;
            }
        }
    }
}

impl Notifier for RecordingNotifier {
    fn notify(&self, event: CallbackEvent) -> PostProcResult<()> {
        match event {
            CallbackEvent::Data {
                msg,
                data,
                index,
                metadata,
                release,
            } => {
                if self.reject.load(Ordering::SeqCst) {
                    // Dropping the event releases it as failed
                    return Err(PostProcError::NotifyFailed(format!("{msg:?} rejected")));
                }
                self.recorded.lock().images.push(DeliveredImage {
                    msg,
                    data: data.as_slice().to_vec(),
                    index,
                    metadata,
                });
                release.release(ReleaseStatus::Delivered);
            }
            CallbackEvent::Notify { msg, ext1, ext2 } => {
                self.recorded.lock().notifications.push((msg, ext1, ext2));
            }
        }
        self.changed.notify_all();
        Ok(())
    }

    fn msg_type_enabled(&self, msg: MsgType) -> bool {
        self.enabled.read().contains(&msg)
    }

    fn has_data_callback(&self) -> bool {
        self.data_callback.load(Ordering::SeqCst)
    }
}

/// Builder for [`SimulatedHost`]
pub struct SimulatedHostBuilder {
    settings: CaptureSettings,
    snapshot_format: PixelFormat,
    preview: bool,
    raw: bool,
}

impl SimulatedHostBuilder {
    pub fn settings(mut self, settings: CaptureSettings) -> Self {
        self.settings = settings;
        self
    }

    pub fn snapshot_format(mut self, format: PixelFormat) -> Self {
        self.snapshot_format = format;
        self
    }

    /// Bundle a preview stream with the snapshot
    pub fn preview(mut self, preview: bool) -> Self {
        self.preview = preview;
        self
    }

    /// Bundle a RAW stream with the snapshot
    pub fn raw(mut self, raw: bool) -> Self {
        self.raw = raw;
        self
    }

    pub fn build(self) -> Arc<SimulatedHost> {
        let camera = SimulatedCamera::new();
        let host = Arc::new(SimulatedHost {
            camera,
            params: self.settings,
            allocator: HeapAllocator::new(),
            notifier: RecordingNotifier::default(),
            capture: RwLock::new(None),
            sink: RwLock::new(None),
            shutters: AtomicU32::new(0),
            fail_memory: AtomicBool::new(false),
        });
        if let Err(e) = host.open_capture_channel(self.snapshot_format, self.preview, self.raw) {
            warn!(error = %e, "Capture channel setup failed");
        }
        host
    }
}

/// Hardware-interface owner backed by the simulated driver
pub struct SimulatedHost {
    camera: Arc<SimulatedCamera>,
    params: CaptureSettings,
    allocator: HeapAllocator,
    notifier: RecordingNotifier,
    capture: RwLock<Option<SharedChannel>>,
    sink: RwLock<Option<WeakPostProcessor>>,
    shutters: AtomicU32,
    fail_memory: AtomicBool,
}

impl SimulatedHost {
    pub fn builder() -> SimulatedHostBuilder {
        SimulatedHostBuilder {
            settings: CaptureSettings::default(),
            snapshot_format: PixelFormat::Nv21,
            preview: true,
            raw: false,
        }
    }

    pub fn camera(&self) -> &Arc<SimulatedCamera> {
        &self.camera
    }

    pub fn settings(&self) -> &CaptureSettings {
        &self.params
    }

    pub fn recorder(&self) -> &RecordingNotifier {
        &self.notifier
    }

    pub fn capture_channel(&self) -> Option<SharedChannel> {
        self.capture.read().clone()
    }

    pub fn shutter_count(&self) -> u32 {
        self.shutters.load(Ordering::SeqCst)
    }

    /// Make `get_memory` fail
    pub fn set_fail_memory(&self, fail: bool) {
        self.fail_memory.store(fail, Ordering::SeqCst);
    }

    /// Route captured frames into `pipeline`
    pub fn attach(&self, pipeline: WeakPostProcessor) {
        *self.sink.write() = Some(pipeline);
    }

    /// Start the capture channel
    pub fn start_capture(&self) -> PostProcResult<()> {
        let channel = self
            .capture_channel()
            .ok_or_else(|| PostProcError::InvalidState("no capture channel".into()))?;
        channel.write().start()?;
        Ok(())
    }

    /// Capture one bundled frame
    pub fn capture(&self, frame_idx: u32) -> PostProcResult<()> {
        let handle = self
            .capture_channel()
            .map(|c| c.read().handle())
            .ok_or_else(|| PostProcError::InvalidState("no capture channel".into()))?;
        self.camera.inject_frame(handle, frame_idx)?;
        Ok(())
    }

    /// Block until the driver delivered everything it queued
    pub fn wait_idle(&self, timeout: Duration) -> bool {
        self.camera.wait_idle(timeout)
    }

    fn open_capture_channel(
        self: &Arc<Self>,
        format: PixelFormat,
        preview: bool,
        raw: bool,
    ) -> PostProcResult<()> {
        let ops: Arc<dyn CameraOps> = self.camera.clone();
        let mut channel = Channel::new(ops, self.camera.camera_handle());
        channel.init(None, self.capture_callback())?;

        let snapshot = self.params.snapshot_size;
        let mut infos = vec![StreamInfo::new(
            StreamType::Snapshot,
            format,
            snapshot,
            CAPTURE_BUFS,
        )];
        if preview {
            infos.push(StreamInfo::new(
                StreamType::Preview,
                PixelFormat::Nv21,
                PREVIEW_SIZE,
                CAPTURE_BUFS,
            ));
        }
        if raw {
            infos.push(StreamInfo::new(
                StreamType::Raw,
                PixelFormat::RawBayer,
                snapshot,
                CAPTURE_BUFS,
            ));
        }
        infos.push(StreamInfo::new(
            StreamType::Metadata,
            PixelFormat::Metadata,
            Dimension::new(64, 1),
            CAPTURE_BUFS,
        ));

        for info in infos {
            let info_buf = self
                .allocator
                .allocate_stream_info_buf(&info)
                .map_err(|e| PostProcError::NoMemory(e.to_string()))?;
            channel.add_stream(StreamSetup::new(info, info_buf))?;
        }
        info!(
            channel = channel.handle(),
            streams = channel.num_streams(),
            "Capture channel ready"
        );
        *self.capture.write() = Some(channel.into_shared());
        Ok(())
    }

    fn capture_callback(self: &Arc<Self>) -> FrameCallback {
        let weak = Arc::downgrade(self);
        Arc::new(move |frame: SuperFrame| {
            let Some(host) = weak.upgrade() else {
                return;
            };
            let sink = host.sink.read().clone();
            let unclaimed = match sink {
                Some(pipeline) => pipeline.process_data(frame).err(),
                None => Some(frame),
            };
            if let Some(frame) = unclaimed {
                debug!(channel = frame.ch_id, "No pipeline attached, returning frame");
                if let Some(channel) = host.channel_by_handle(frame.ch_id) {
                    if let Err(e) = channel.read().buf_done(&frame) {
                        warn!(error = %e, "Returning unclaimed frame failed");
                    }
                }
            }
        })
    }
}

impl CameraHost for SimulatedHost {
    fn params(&self) -> &dyn ParamStore {
        &self.params
    }

    fn channel_by_handle(&self, handle: ChannelHandle) -> Option<SharedChannel> {
        self.capture
            .read()
            .as_ref()
            .filter(|c| c.read().handle() == handle)
            .cloned()
    }

    fn add_reproc_channel(
        &self,
        source: &SharedChannel,
        callback: FrameCallback,
    ) -> PostProcResult<ReprocessChannel> {
        let ops: Arc<dyn CameraOps> = self.camera.clone();
        let mut channel = Channel::new(ops, self.camera.camera_handle());
        channel.init(None, callback)?;

        let setup = ReprocessSetup {
            feature_config: self.params.pp_feature_config(),
            buf_count: self.params.reprocess_buf_count(),
            burst_count: self.params.reprocess_burst_count(),
            padding: Padding::default(),
            continuous: false,
            offline: self.params.regular_capture(),
        };
        let mut reproc = ReprocessChannel::new(channel);
        reproc.add_reproc_streams_from_source(&self.allocator, &setup, source, &self.params)?;
        debug!(
            channel = reproc.handle(),
            streams = reproc.streams().len(),
            "Reprocess channel created"
        );
        Ok(reproc)
    }

    fn stop_capture_channel(&self) -> PostProcResult<()> {
        let Some(channel) = self.capture.write().take() else {
            return Ok(());
        };
        channel.write().delete();
        info!("Capture channel torn down");
        Ok(())
    }

    fn notifier(&self) -> &dyn Notifier {
        &self.notifier
    }

    fn get_memory(&self, bytes: &[u8]) -> Option<HeapMemory> {
        if self.fail_memory.load(Ordering::SeqCst) {
            return None;
        }
        Some(HeapMemory::copy_from(bytes))
    }

    fn play_shutter(&self) {
        self.shutters.fetch_add(1, Ordering::SeqCst);
        if self.notifier.msg_type_enabled(MsgType::Shutter) {
            let _ = self.notifier.notify(CallbackEvent::Notify {
                msg: MsgType::Shutter,
                ext1: 0,
                ext2: 0,
            });
        }
    }

    fn build_exif(&self) -> Option<ExifTable> {
        let mut table = ExifTable::new();
        let now = chrono::Local::now().format("%Y:%m:%d %H:%M:%S").to_string();
        let orientation = match JpegRotation::from_degrees(self.params.jpeg_rotation()) {
            JpegRotation::Deg0 => 1,
            JpegRotation::Deg90 => 6,
            JpegRotation::Deg180 => 3,
            JpegRotation::Deg270 => 8,
        };
        let entries = [
            (tags::MAKE, ExifValue::Ascii("Simulated".into())),
            (tags::MODEL, ExifValue::Ascii("camera-postproc".into())),
            (
                tags::SOFTWARE,
                ExifValue::Ascii(format!("camera-postproc {}", app_info::version())),
            ),
            (tags::DATE_TIME, ExifValue::Ascii(now.clone())),
            (tags::DATE_TIME_ORIGINAL, ExifValue::Ascii(now)),
            (tags::ORIENTATION, ExifValue::Short(vec![orientation])),
        ];
        for (tag, value) in entries {
            if let Err(e) = table.add_entry(tag, value) {
                warn!(tag, error = %e, "EXIF entry dropped");
            }
        }
        Some(table)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_builder_creates_capture_channel() {
        let host = SimulatedHost::builder().build();
        let channel = host.capture_channel().expect("capture channel");
        let channel = channel.read();
        // snapshot, preview, metadata
        assert_eq!(channel.num_streams(), 3);
        assert!(host.channel_by_handle(channel.handle()).is_some());
        assert!(host.channel_by_handle(channel.handle() + 100).is_none());
    }

    #[test]
    fn test_unattached_frames_are_returned() {
        let host = SimulatedHost::builder().build();
        host.start_capture().unwrap();
        host.capture(1).unwrap();
        assert!(host.wait_idle(Duration::from_secs(2)));
        assert_eq!(host.camera().outstanding(), 0);
        assert_eq!(host.camera().double_returns(), 0);
    }

    #[test]
    fn test_rejected_data_event_runs_release_as_failed() {
        let notifier = RecordingNotifier::default();
        notifier.set_reject(true);
        let failed = Arc::new(AtomicBool::new(false));
        let flag = Arc::clone(&failed);
        let result = notifier.notify(CallbackEvent::Data {
            msg: MsgType::CompressedImage,
            data: HeapMemory::zeroed(4),
            index: 0,
            metadata: None,
            release: crate::pipelines::postproc::ReleaseHandle::new(
                crate::pipelines::postproc::ReleaseKind::Memory,
                move |status| flag.store(status == ReleaseStatus::Failed, Ordering::SeqCst),
            ),
        });
        assert!(result.is_err());
        assert!(failed.load(Ordering::SeqCst));
        assert!(notifier.images().is_empty());
    }

    #[test]
    fn test_exif_carries_orientation() {
        let mut settings = CaptureSettings::default();
        settings.jpeg_rotation = 90;
        let host = SimulatedHost::builder().settings(settings).build();
        let exif = host.build_exif().unwrap();
        assert_eq!(exif.get(tags::ORIENTATION), Some(&ExifValue::Short(vec![6])));
    }
}
