// SPDX-License-Identifier: GPL-3.0-only

//! In-process camera driver
//!
//! `SimulatedCamera` implements [`CameraOps`] entirely in memory. It hands out
//! synthetic frames, keeps an exact ledger of every buffer that is out with a
//! consumer, records buffer mappings and reprocess requests, and emits a
//! reprocess output frame whenever a "do reprocess" parameter arrives.
//!
//! Frame callbacks are never invoked from the calling thread. Every delivery
//! is queued to a single FIFO delivery thread, the same way a real driver
//! calls back from its own context.

use super::types::*;
use super::{CameraOps, FrameCallback};
use crossbeam_channel::{Receiver, Sender, unbounded};
use parking_lot::{Condvar, Mutex};
use std::collections::{HashMap, HashSet};
use std::sync::Arc;
use std::sync::atomic::{AtomicU32, Ordering};
use std::thread::{self, JoinHandle, ThreadId};
use std::time::{Duration, Instant};
use tracing::{debug, info, warn};

const SERVER_ID_BASE: u32 = 0x100;

/// Failure switches for exercising error paths
#[derive(Debug, Clone, Copy, Default)]
pub struct FaultInjection {
    pub fail_channel_start: bool,
    pub fail_map: bool,
    pub fail_reprocess: bool,
    pub fail_bundle_info: bool,
}

/// A mapping the driver currently holds
#[derive(Debug, Clone)]
pub struct ActiveMapping {
    pub stream: StreamHandle,
    pub buf_type: MappingBufType,
    pub index: u32,
    pub len: usize,
}

struct ChannelState {
    callback: FrameCallback,
    streams: Vec<StreamHandle>,
    running: bool,
}

struct StreamState {
    owner: ChannelHandle,
    server_id: ServerId,
    info: StreamInfo,
    running: bool,
    next_buf_idx: u32,
    /// Inputs accepted since the last emitted output batch
    pending_inputs: u32,
}

#[derive(Default)]
struct DriverState {
    channels: HashMap<ChannelHandle, ChannelState>,
    streams: HashMap<StreamHandle, StreamState>,
    outstanding: HashSet<(StreamHandle, u32)>,
    mappings: HashMap<(StreamHandle, MappingBufType, u32), BufMapping>,
    buf_done_count: usize,
    double_returns: usize,
    reclaimed: usize,
    unmap_count: usize,
    reprocess_requests: Vec<(StreamHandle, ReprocessRequest)>,
    stream_params: Vec<(StreamHandle, StreamParam)>,
    capture_requests: Vec<(ChannelHandle, CaptureRequest)>,
    cancelled_requests: usize,
    advanced_captures: Vec<(AdvancedCaptureType, bool)>,
    flushed_frames: Vec<u32>,
    faults: FaultInjection,
    /// Inputs and outputs per reprocess batch
    reprocess_ratio: (u32, u32),
}

struct Delivery {
    callback: FrameCallback,
    frame: SuperFrame,
}

/// Count of queued-but-not-yet-delivered frames
struct Pending {
    count: Mutex<usize>,
    idle: Condvar,
}

/// Simulated driver; see the module docs
pub struct SimulatedCamera {
    camera_handle: CameraHandle,
    next_handle: AtomicU32,
    state: Mutex<DriverState>,
    pending: Arc<Pending>,
    sender: Mutex<Option<Sender<Delivery>>>,
    delivery_thread: Mutex<Option<JoinHandle<()>>>,
    delivery_thread_id: Option<ThreadId>,
}

impl SimulatedCamera {
    pub fn new() -> Arc<Self> {
        let (sender, receiver) = unbounded::<Delivery>();
        let pending = Arc::new(Pending {
            count: Mutex::new(0),
            idle: Condvar::new(),
        });
        let thread_pending = Arc::clone(&pending);
        let handle = thread::Builder::new()
            .name("sim-camera-cb".into())
            .spawn(move || delivery_loop(receiver, thread_pending))
            .ok();
        if handle.is_none() {
            warn!("Failed to spawn delivery thread; frames will be dropped");
        }
        let delivery_thread_id = handle.as_ref().map(|h| h.thread().id());

        Arc::new(Self {
            camera_handle: 1,
            next_handle: AtomicU32::new(1),
            state: Mutex::new(DriverState {
                reprocess_ratio: (1, 1),
                ..Default::default()
            }),
            pending,
            sender: Mutex::new(Some(sender)),
            delivery_thread: Mutex::new(handle),
            delivery_thread_id,
        })
    }

    pub fn camera_handle(&self) -> CameraHandle {
        self.camera_handle
    }

    pub fn set_faults(&self, faults: FaultInjection) {
        self.state.lock().faults = faults;
    }

    /// Emit `outputs` frames for every `inputs` reprocess requests on a stream
    pub fn set_reprocess_ratio(&self, inputs: u32, outputs: u32) {
        self.state.lock().reprocess_ratio = (inputs.max(1), outputs);
    }

    // ===== Frame generation =====

    /// Deliver one bundled frame on `channel`, one buffer per bundled stream
    ///
    /// Metadata-stream buffers carry a [`Metadata`] record with a full-frame
    /// crop entry for every image stream of the bundle.
    pub fn inject_frame(&self, channel: ChannelHandle, frame_idx: u32) -> BackendResult<()> {
        let (callback, frame) = {
            let mut state = self.state.lock();
            let ch = state
                .channels
                .get(&channel)
                .ok_or_else(|| BackendError::InvalidHandle(format!("channel {channel}")))?;
            if !ch.running {
                return Err(BackendError::NotAvailable(format!(
                    "channel {channel} not started"
                )));
            }
            let callback = Arc::clone(&ch.callback);
            let members = ch.streams.clone();

            let mut crop = CropData::default();
            for handle in &members {
                if let Some(stream) = state.streams.get(handle) {
                    if stream.info.stream_type != StreamType::Metadata && crop.has_space() {
                        crop.entries.push(StreamCrop {
                            stream_id: stream.server_id,
                            crop: Rect::full(stream.info.dim),
                            roi_map: Rect::full(stream.info.dim),
                        });
                    }
                }
            }

            let mut bufs = Vec::with_capacity(members.len());
            for handle in members {
                let Some(stream) = state.streams.get_mut(&handle) else {
                    continue;
                };
                let buf_idx = stream.next_buf_idx;
                stream.next_buf_idx += 1;
                let is_meta = stream.info.stream_type == StreamType::Metadata;
                let metadata = is_meta.then(|| {
                    Metadata {
                        frame_number: frame_idx,
                        crop: crop.clone(),
                        ..Default::default()
                    }
                    .into_shared()
                });
                let data = synthetic_frame(&stream.info, frame_idx);
                bufs.push(BufDef {
                    stream_id: handle,
                    stream_type: stream.info.stream_type,
                    buf_idx,
                    frame_idx,
                    fd: (handle * 1000 + buf_idx) as i32,
                    data,
                    metadata,
                });
                state.outstanding.insert((handle, buf_idx));
            }
            (
                callback,
                SuperFrame::new(self.camera_handle, channel, bufs),
            )
        };
        debug!(channel, frame_idx, "Injecting frame");
        self.deliver(callback, frame);
        Ok(())
    }

    fn deliver(&self, callback: FrameCallback, frame: SuperFrame) {
        let sender = self.sender.lock();
        let Some(sender) = sender.as_ref() else {
            warn!("Delivery thread gone, dropping frame");
            return;
        };
        *self.pending.count.lock() += 1;
        if sender.send(Delivery { callback, frame }).is_err() {
            let mut count = self.pending.count.lock();
            *count -= 1;
            self.pending.idle.notify_all();
        }
    }

    /// Block until every queued delivery has been handed to its callback
    pub fn wait_idle(&self, timeout: Duration) -> bool {
        let deadline = Instant::now() + timeout;
        let mut count = self.pending.count.lock();
        while *count > 0 {
            if self.pending.idle.wait_until(&mut count, deadline).timed_out() {
                return *count == 0;
            }
        }
        true
    }

    // ===== Ledger =====

    /// Buffers currently held by consumers
    pub fn outstanding(&self) -> usize {
        self.state.lock().outstanding.len()
    }

    pub fn buf_done_count(&self) -> usize {
        self.state.lock().buf_done_count
    }

    /// Returns for buffers that were not out at the time
    pub fn double_returns(&self) -> usize {
        self.state.lock().double_returns
    }

    /// Buffers taken back by channel teardown instead of `buf_done`
    pub fn reclaimed(&self) -> usize {
        self.state.lock().reclaimed
    }

    pub fn active_mappings(&self) -> Vec<ActiveMapping> {
        self.state
            .lock()
            .mappings
            .iter()
            .map(|((stream, _, _), m)| ActiveMapping {
                stream: *stream,
                buf_type: m.buf_type,
                index: m.index,
                len: m.len,
            })
            .collect()
    }

    pub fn unmap_count(&self) -> usize {
        self.state.lock().unmap_count
    }

    pub fn reprocess_requests(&self) -> Vec<(StreamHandle, ReprocessRequest)> {
        self.state.lock().reprocess_requests.clone()
    }

    pub fn stream_params(&self) -> Vec<(StreamHandle, StreamParam)> {
        self.state.lock().stream_params.clone()
    }

    pub fn capture_requests(&self) -> Vec<(ChannelHandle, CaptureRequest)> {
        self.state.lock().capture_requests.clone()
    }

    pub fn cancelled_requests(&self) -> usize {
        self.state.lock().cancelled_requests
    }

    pub fn advanced_captures(&self) -> Vec<(AdvancedCaptureType, bool)> {
        self.state.lock().advanced_captures.clone()
    }

    pub fn flushed_frames(&self) -> Vec<u32> {
        self.state.lock().flushed_frames.clone()
    }

    pub fn channel_exists(&self, channel: ChannelHandle) -> bool {
        self.state.lock().channels.contains_key(&channel)
    }

    pub fn channel_running(&self, channel: ChannelHandle) -> bool {
        self.state
            .lock()
            .channels
            .get(&channel)
            .is_some_and(|c| c.running)
    }

    pub fn stream_running(&self, stream: StreamHandle) -> bool {
        self.state
            .lock()
            .streams
            .get(&stream)
            .is_some_and(|s| s.running)
    }

    pub fn stream_count(&self) -> usize {
        self.state.lock().streams.len()
    }

    fn alloc_handle(&self) -> u32 {
        self.next_handle.fetch_add(1, Ordering::SeqCst)
    }

    /// Build the output frame(s) for a reprocess request on `stream`
    fn reprocess_outputs(
        state: &mut DriverState,
        camera: CameraHandle,
        channel: ChannelHandle,
        stream: StreamHandle,
        request: &ReprocessRequest,
    ) -> BackendResult<Option<(FrameCallback, Vec<SuperFrame>)>> {
        let (inputs, outputs) = state.reprocess_ratio;
        let input_data = match state.mappings.get(&(
            stream,
            MappingBufType::OfflineInput,
            request.buf_index,
        )) {
            Some(BufMapping {
                payload: MappedPayload::Frame(data),
                ..
            }) => Some(Arc::clone(data)),
            _ => None,
        };
        let callback = match state.channels.get(&channel) {
            Some(ch) if ch.running => Arc::clone(&ch.callback),
            _ => {
                return Err(BackendError::Transaction(format!(
                    "reprocess on stopped channel {channel}"
                )));
            }
        };
        let st = state
            .streams
            .get_mut(&stream)
            .ok_or_else(|| BackendError::InvalidHandle(format!("stream {stream}")))?;
        st.pending_inputs += 1;
        if st.pending_inputs < inputs {
            return Ok(None);
        }
        st.pending_inputs = 0;

        let mut frames = Vec::with_capacity(outputs as usize);
        let mut taken = Vec::with_capacity(outputs as usize);
        for _ in 0..outputs {
            let buf_idx = st.next_buf_idx;
            st.next_buf_idx += 1;
            let expected = st.info.fmt.frame_len(st.info.dim);
            let data = match &input_data {
                Some(data) if data.len() == expected => Arc::clone(data),
                _ => synthetic_frame(&st.info, request.frame_idx),
            };
            frames.push(SuperFrame::new(
                camera,
                channel,
                vec![BufDef {
                    stream_id: stream,
                    stream_type: st.info.stream_type,
                    buf_idx,
                    frame_idx: request.frame_idx,
                    fd: (stream * 1000 + buf_idx) as i32,
                    data,
                    metadata: None,
                }],
            ));
            taken.push((stream, buf_idx));
        }
        state.outstanding.extend(taken);
        Ok(Some((callback, frames)))
    }
}

impl CameraOps for SimulatedCamera {
    fn add_channel(
        &self,
        _camera: CameraHandle,
        _attr: Option<ChannelAttr>,
        callback: FrameCallback,
    ) -> BackendResult<ChannelHandle> {
        let handle = self.alloc_handle();
        self.state.lock().channels.insert(
            handle,
            ChannelState {
                callback,
                streams: Vec::new(),
                running: false,
            },
        );
        debug!(channel = handle, "Channel added");
        Ok(handle)
    }

    fn delete_channel(&self, _camera: CameraHandle, channel: ChannelHandle) -> BackendResult<()> {
        let mut state = self.state.lock();
        if state.channels.remove(&channel).is_none() {
            return Err(BackendError::InvalidHandle(format!("channel {channel}")));
        }
        let owned: Vec<StreamHandle> = state
            .streams
            .iter()
            .filter(|(_, s)| s.owner == channel)
            .map(|(h, _)| *h)
            .collect();
        for handle in &owned {
            state.streams.remove(handle);
        }
        let before = state.outstanding.len();
        state.outstanding.retain(|(s, _)| !owned.contains(s));
        let reclaimed = before - state.outstanding.len();
        state.reclaimed += reclaimed;
        state.mappings.retain(|(s, _, _), _| !owned.contains(s));
        for ch in state.channels.values_mut() {
            ch.streams.retain(|s| !owned.contains(s));
        }
        debug!(channel, reclaimed, "Channel deleted");
        Ok(())
    }

    fn get_bundle_info(
        &self,
        _camera: CameraHandle,
        channel: ChannelHandle,
        _stream: StreamHandle,
    ) -> BackendResult<BundleConfig> {
        let state = self.state.lock();
        if state.faults.fail_bundle_info {
            return Err(BackendError::Transaction("bundle query failed".into()));
        }
        let ch = state
            .channels
            .get(&channel)
            .ok_or_else(|| BackendError::InvalidHandle(format!("channel {channel}")))?;
        let stream_ids = ch
            .streams
            .iter()
            .filter_map(|h| state.streams.get(h).map(|s| s.server_id))
            .collect();
        Ok(BundleConfig {
            bundle_id: channel,
            stream_ids,
        })
    }

    fn start_channel(&self, _camera: CameraHandle, channel: ChannelHandle) -> BackendResult<()> {
        let mut state = self.state.lock();
        if state.faults.fail_channel_start {
            return Err(BackendError::Transaction("channel start failed".into()));
        }
        let ch = state
            .channels
            .get_mut(&channel)
            .ok_or_else(|| BackendError::InvalidHandle(format!("channel {channel}")))?;
        ch.running = true;
        Ok(())
    }

    fn stop_channel(&self, _camera: CameraHandle, channel: ChannelHandle) -> BackendResult<()> {
        let mut state = self.state.lock();
        let ch = state
            .channels
            .get_mut(&channel)
            .ok_or_else(|| BackendError::InvalidHandle(format!("channel {channel}")))?;
        ch.running = false;
        Ok(())
    }

    fn add_stream(
        &self,
        _camera: CameraHandle,
        channel: ChannelHandle,
        info: &StreamInfo,
    ) -> BackendResult<(StreamHandle, ServerId)> {
        let handle = self.alloc_handle();
        let server_id = SERVER_ID_BASE + handle;
        let mut state = self.state.lock();
        let ch = state
            .channels
            .get_mut(&channel)
            .ok_or_else(|| BackendError::InvalidHandle(format!("channel {channel}")))?;
        ch.streams.push(handle);
        state.streams.insert(
            handle,
            StreamState {
                owner: channel,
                server_id,
                info: info.clone(),
                running: false,
                next_buf_idx: 0,
                pending_inputs: 0,
            },
        );
        debug!(channel, stream = handle, server_id, stream_type = ?info.stream_type, "Stream added");
        Ok((handle, server_id))
    }

    fn config_stream(
        &self,
        _camera: CameraHandle,
        _channel: ChannelHandle,
        stream: StreamHandle,
        info: &StreamInfo,
    ) -> BackendResult<()> {
        let mut state = self.state.lock();
        let st = state
            .streams
            .get_mut(&stream)
            .ok_or_else(|| BackendError::InvalidHandle(format!("stream {stream}")))?;
        st.info = info.clone();
        Ok(())
    }

    fn delete_stream(
        &self,
        _camera: CameraHandle,
        _channel: ChannelHandle,
        stream: StreamHandle,
    ) -> BackendResult<()> {
        let mut state = self.state.lock();
        state.streams.remove(&stream);
        for ch in state.channels.values_mut() {
            ch.streams.retain(|s| *s != stream);
        }
        let before = state.outstanding.len();
        state.outstanding.retain(|(s, _)| *s != stream);
        let reclaimed = before - state.outstanding.len();
        state.reclaimed += reclaimed;
        state.mappings.retain(|(s, _, _), _| *s != stream);
        if reclaimed > 0 {
            debug!(stream, reclaimed, "Stream deleted with buffers out");
        }
        Ok(())
    }

    fn start_stream(
        &self,
        _camera: CameraHandle,
        _channel: ChannelHandle,
        stream: StreamHandle,
    ) -> BackendResult<()> {
        let mut state = self.state.lock();
        let st = state
            .streams
            .get_mut(&stream)
            .ok_or_else(|| BackendError::InvalidHandle(format!("stream {stream}")))?;
        st.running = true;
        Ok(())
    }

    fn stop_stream(
        &self,
        _camera: CameraHandle,
        _channel: ChannelHandle,
        stream: StreamHandle,
    ) -> BackendResult<()> {
        if let Some(st) = self.state.lock().streams.get_mut(&stream) {
            st.running = false;
        }
        Ok(())
    }

    fn link_stream(
        &self,
        _camera: CameraHandle,
        _src_channel: ChannelHandle,
        stream: StreamHandle,
        dst_channel: ChannelHandle,
    ) -> BackendResult<()> {
        let mut state = self.state.lock();
        if !state.streams.contains_key(&stream) {
            return Err(BackendError::InvalidHandle(format!("stream {stream}")));
        }
        let ch = state
            .channels
            .get_mut(&dst_channel)
            .ok_or_else(|| BackendError::InvalidHandle(format!("channel {dst_channel}")))?;
        ch.streams.push(stream);
        Ok(())
    }

    fn set_stream_parameter(
        &self,
        camera: CameraHandle,
        channel: ChannelHandle,
        stream: StreamHandle,
        param: &StreamParam,
    ) -> BackendResult<i32> {
        let outputs = {
            let mut state = self.state.lock();
            state.stream_params.push((stream, param.clone()));
            match param {
                StreamParam::DoReprocess(request) => {
                    if state.faults.fail_reprocess {
                        return Err(BackendError::Transaction("reprocess rejected".into()));
                    }
                    state.reprocess_requests.push((stream, *request));
                    Self::reprocess_outputs(&mut state, camera, channel, stream, request)?
                }
                StreamParam::SetBundleInfo(_)
                | StreamParam::SetFlip(_)
                | StreamParam::SyncRuntimeParams => None,
            }
        };
        if let Some((callback, frames)) = outputs {
            for frame in frames {
                self.deliver(Arc::clone(&callback), frame);
            }
        }
        Ok(0)
    }

    fn map_stream_buf(
        &self,
        _camera: CameraHandle,
        _channel: ChannelHandle,
        stream: StreamHandle,
        mapping: &BufMapping,
    ) -> BackendResult<()> {
        let mut state = self.state.lock();
        if state.faults.fail_map {
            return Err(BackendError::Transaction("map failed".into()));
        }
        if !state.streams.contains_key(&stream) {
            return Err(BackendError::InvalidHandle(format!("stream {stream}")));
        }
        state
            .mappings
            .insert((stream, mapping.buf_type, mapping.index), mapping.clone());
        Ok(())
    }

    fn unmap_stream_buf(
        &self,
        _camera: CameraHandle,
        _channel: ChannelHandle,
        stream: StreamHandle,
        buf_type: MappingBufType,
        index: u32,
    ) -> BackendResult<()> {
        let mut state = self.state.lock();
        if state.mappings.remove(&(stream, buf_type, index)).is_none() {
            return Err(BackendError::InvalidHandle(format!(
                "no {buf_type:?} mapping {index} on stream {stream}"
            )));
        }
        state.unmap_count += 1;
        Ok(())
    }

    fn buf_done(
        &self,
        _camera: CameraHandle,
        _channel: ChannelHandle,
        buf: &BufDef,
    ) -> BackendResult<()> {
        let mut state = self.state.lock();
        if state.outstanding.remove(&(buf.stream_id, buf.buf_idx)) {
            state.buf_done_count += 1;
            Ok(())
        } else {
            state.double_returns += 1;
            warn!(
                stream = buf.stream_id,
                buf_idx = buf.buf_idx,
                "Buffer returned while not outstanding"
            );
            Err(BackendError::InvalidHandle(format!(
                "buffer {} of stream {} is not outstanding",
                buf.buf_idx, buf.stream_id
            )))
        }
    }

    fn release_opaque_buf(
        &self,
        _camera: CameraHandle,
        _channel: ChannelHandle,
        stream: StreamHandle,
        opaque: u64,
        _is_metadata: bool,
    ) -> BackendResult<()> {
        let mut state = self.state.lock();
        let idx = opaque as u32;
        if state.outstanding.remove(&(stream, idx)) {
            state.buf_done_count += 1;
            Ok(())
        } else {
            state.double_returns += 1;
            Err(BackendError::InvalidHandle(format!("opaque buffer {opaque}")))
        }
    }

    fn request_super_buf(
        &self,
        _camera: CameraHandle,
        channel: ChannelHandle,
        request: CaptureRequest,
    ) -> BackendResult<()> {
        self.state.lock().capture_requests.push((channel, request));
        Ok(())
    }

    fn cancel_super_buf_request(
        &self,
        _camera: CameraHandle,
        _channel: ChannelHandle,
    ) -> BackendResult<()> {
        self.state.lock().cancelled_requests += 1;
        Ok(())
    }

    fn process_advanced_capture(
        &self,
        _camera: CameraHandle,
        _channel: ChannelHandle,
        kind: AdvancedCaptureType,
        start: bool,
    ) -> BackendResult<()> {
        self.state.lock().advanced_captures.push((kind, start));
        Ok(())
    }

    fn flush_super_buf_queue(
        &self,
        _camera: CameraHandle,
        _channel: ChannelHandle,
        frame_idx: u32,
    ) -> BackendResult<()> {
        self.state.lock().flushed_frames.push(frame_idx);
        Ok(())
    }
}

impl Drop for SimulatedCamera {
    fn drop(&mut self) {
        self.sender.lock().take();
        let on_delivery_thread = self.delivery_thread_id == Some(thread::current().id());
        if let Some(handle) = self.delivery_thread.lock().take() {
            if on_delivery_thread {
                return;
            }
            if handle.join().is_err() {
                warn!("Delivery thread panicked");
            }
        }
    }
}

fn delivery_loop(receiver: Receiver<Delivery>, pending: Arc<Pending>) {
    info!("Simulated camera delivery thread started");
    for Delivery { callback, frame } in receiver.iter() {
        callback(frame);
        let mut count = pending.count.lock();
        *count = count.saturating_sub(1);
        if *count == 0 {
            pending.idle.notify_all();
        }
    }
    debug!("Simulated camera delivery thread exiting");
}

/// Gradient test pattern; luma ramps with the frame index so successive
/// frames differ
fn synthetic_frame(info: &StreamInfo, frame_idx: u32) -> Arc<[u8]> {
    if info.stream_type == StreamType::Metadata {
        return vec![0u8; 64].into();
    }
    let len = info.fmt.frame_len(info.dim);
    let width = info.dim.width.max(1) as usize;
    let luma_len = width * info.dim.height as usize;
    let mut data = vec![128u8; len];
    for (i, px) in data.iter_mut().take(luma_len.min(len)).enumerate() {
        *px = ((i % width) as u32 + frame_idx * 16) as u8;
    }
    data.into()
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::AtomicUsize;

    fn counting_callback(count: Arc<AtomicUsize>, sink: Arc<Mutex<Vec<SuperFrame>>>) -> FrameCallback {
        Arc::new(move |frame: SuperFrame| {
            count.fetch_add(1, Ordering::SeqCst);
            sink.lock().push(frame);
        })
    }

    #[test]
    fn test_inject_and_return_buffers() {
        let cam = SimulatedCamera::new();
        let count = Arc::new(AtomicUsize::new(0));
        let sink = Arc::new(Mutex::new(Vec::new()));
        let ch = cam
            .add_channel(1, None, counting_callback(count.clone(), sink.clone()))
            .unwrap();
        let info = StreamInfo::new(StreamType::Snapshot, PixelFormat::Nv21, Dimension::new(8, 8), 2);
        cam.add_stream(1, ch, &info).unwrap();
        let meta = StreamInfo::new(StreamType::Metadata, PixelFormat::Metadata, Dimension::new(1, 1), 2);
        cam.add_stream(1, ch, &meta).unwrap();
        cam.start_channel(1, ch).unwrap();

        cam.inject_frame(ch, 0).unwrap();
        assert!(cam.wait_idle(Duration::from_secs(2)));
        assert_eq!(count.load(Ordering::SeqCst), 1);
        assert_eq!(cam.outstanding(), 2);

        let frame = sink.lock().pop().unwrap();
        let meta_buf = frame.metadata_buf().unwrap();
        assert_eq!(meta_buf.metadata.as_ref().unwrap().read().crop.entries.len(), 1);
        for buf in &frame.bufs {
            cam.buf_done(1, ch, buf).unwrap();
        }
        assert_eq!(cam.outstanding(), 0);
        assert!(cam.buf_done(1, ch, &frame.bufs[0]).is_err());
        assert_eq!(cam.double_returns(), 1);
    }

    #[test]
    fn test_delete_channel_reclaims_outstanding() {
        let cam = SimulatedCamera::new();
        let ch = cam.add_channel(1, None, Arc::new(|_frame: SuperFrame| {})).unwrap();
        let info = StreamInfo::new(StreamType::Snapshot, PixelFormat::Nv21, Dimension::new(4, 4), 2);
        cam.add_stream(1, ch, &info).unwrap();
        cam.start_channel(1, ch).unwrap();
        cam.inject_frame(ch, 0).unwrap();
        cam.inject_frame(ch, 1).unwrap();
        assert!(cam.wait_idle(Duration::from_secs(2)));

        cam.delete_channel(1, ch).unwrap();
        assert_eq!(cam.outstanding(), 0);
        assert_eq!(cam.reclaimed(), 2);
    }

    #[test]
    fn test_delete_stream_reclaims_its_buffers() {
        let cam = SimulatedCamera::new();
        let ch = cam.add_channel(1, None, Arc::new(|_frame: SuperFrame| {})).unwrap();
        let info = StreamInfo::new(StreamType::Snapshot, PixelFormat::Nv21, Dimension::new(4, 4), 2);
        let (snapshot, _) = cam.add_stream(1, ch, &info).unwrap();
        let meta = StreamInfo::new(StreamType::Metadata, PixelFormat::Metadata, Dimension::new(1, 1), 2);
        cam.add_stream(1, ch, &meta).unwrap();
        cam.start_channel(1, ch).unwrap();
        cam.inject_frame(ch, 0).unwrap();
        assert!(cam.wait_idle(Duration::from_secs(2)));
        assert_eq!(cam.outstanding(), 2);

        cam.delete_stream(1, ch, snapshot).unwrap();
        assert_eq!(cam.outstanding(), 1);
        assert_eq!(cam.reclaimed(), 1);

        cam.delete_channel(1, ch).unwrap();
        assert_eq!(cam.outstanding(), 0);
        assert_eq!(cam.reclaimed(), 2);
        assert_eq!(cam.double_returns(), 0);
    }

    #[test]
    fn test_inject_on_stopped_channel_fails() {
        let cam = SimulatedCamera::new();
        let ch = cam.add_channel(1, None, Arc::new(|_frame: SuperFrame| {})).unwrap();
        assert!(cam.inject_frame(ch, 0).is_err());
    }
}
