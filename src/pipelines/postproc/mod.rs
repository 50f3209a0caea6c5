// SPDX-License-Identifier: GPL-3.0-only

//! Reprocess and JPEG post-processing pipeline
//!
//! Captured frames flow through a chain of job queues drained by two worker
//! threads:
//!
//! ```text
//! process_data ─┬─► input_pp ──► ongoing_pp ──► reprocess channel[pass]
//!               │      ▲                              │
//!               │      └──────── process_pp_data ◄────┘
//!               │                      │ (last pass)
//!               ├─► input_jpeg ◄───────┘
//!               │       │
//!               │       ▼
//!               │  ongoing_jpeg ──► encoder ──► process_jpeg_evt ──► notify
//!               │                                    │
//!               │                                    └─► save queue (long-shot save)
//!               └─► input_raw ──► notify
//! ```
//!
//! Every envelope owns the frames it carries, so each buffer goes back to
//! its channel exactly once whichever path the frame takes.

mod cmd_thread;
mod encoding;
pub mod host;
pub mod jobs;
pub mod notify;
mod queue;
mod raw;
mod save;

pub use cmd_thread::{Cmd, CmdThread};
pub use encoding::StreamSelection;
pub use host::CameraHost;
pub use jobs::{FrameReleaser, JpegJob, OngoingPp, PpJob, PpRequest, SourceFrame};
pub use notify::{
    CAMERA_ERROR_UNKNOWN, CallbackEvent, MsgType, Notifier, ReleaseHandle, ReleaseKind,
    ReleaseStatus,
};
pub use queue::JobQueue;

use crate::backends::camera::{
    BufDef, FrameCallback, HeapMemory, Padding, SharedMetadata, Stream, StreamType, SuperFrame,
};
use crate::backends::jpeg::{JpegCallback, JpegEvent, JpegOps, SessionId};
use crate::channels::{ReprocessChannel, SharedChannel};
use crate::config::PostProcConfig;
use crate::errors::{PostProcError, PostProcResult};
use parking_lot::{Mutex, RwLock};
use std::sync::atomic::{AtomicBool, AtomicU32, AtomicUsize, Ordering};
use std::sync::{Arc, Weak};
use tracing::{debug, error, info, warn};

const PROCESS_THREAD_NAME: &str = "CAM_JpegProc";
const SAVE_THREAD_NAME: &str = "CAM_JpegSave";

/// Post-processor handle
///
/// Cloning is not supported; share it behind an `Arc` or hand out
/// [`WeakPostProcessor`]s to completion callbacks.
pub struct PostProcessor {
    inner: Arc<Inner>,
}

/// Non-owning reference used by completion callbacks
#[derive(Clone)]
pub struct WeakPostProcessor {
    inner: Weak<Inner>,
}

impl WeakPostProcessor {
    /// Forward a captured frame; hands it back when the pipeline is gone
    pub fn process_data(&self, frame: SuperFrame) -> Result<(), SuperFrame> {
        match self.inner.upgrade() {
            Some(inner) => {
                if let Err(e) = inner.process_data(frame) {
                    debug!(error = %e, "Captured frame not accepted");
                }
                Ok(())
            }
            None => Err(frame),
        }
    }

    /// Forward a JPEG completion; dropped when the pipeline is gone
    pub fn process_jpeg_evt(&self, event: JpegEvent) -> PostProcResult<()> {
        match self.inner.upgrade() {
            Some(inner) => inner.process_jpeg_evt(event),
            None => {
                warn!(job_id = event.job_id, "JPEG event after post-processor was dropped");
                Err(PostProcError::NotInitialized)
            }
        }
    }
}

pub(crate) struct Inner {
    host: Arc<dyn CameraHost>,
    config: PostProcConfig,
    weak_self: Weak<Inner>,

    jpeg_ops: RwLock<Option<Arc<dyn JpegOps>>>,
    jpeg_callback: RwLock<Option<JpegCallback>>,
    /// `None` until the next encode creates a session
    session: Mutex<Option<SessionId>>,
    /// Held across submission and completion lookup of encode jobs
    submit_lock: Mutex<()>,

    chain: RwLock<Vec<Arc<ReprocessChannel>>>,

    input_pp: JobQueue<PpRequest>,
    ongoing_pp: JobQueue<OngoingPp>,
    input_jpeg: JobQueue<JpegJob>,
    ongoing_jpeg: JobQueue<JpegJob>,
    input_raw: JobQueue<SuperFrame>,
    save_queue: JobQueue<JpegEvent>,

    process_thread: RwLock<Option<Arc<CmdThread>>>,
    save_thread: RwLock<Option<Arc<CmdThread>>>,

    initialized: AtomicBool,
    active: AtomicBool,
    /// Worker-side view of the active state
    processing: AtomicBool,
    save_active: AtomicBool,

    /// Reprocess dispatches, for batch placeholder accounting
    buf_count_pp: AtomicU32,
    /// Outputs encoded so far, indexes the advanced-feature metadata list
    pp_index: AtomicUsize,
    input_metadata: Mutex<Vec<SharedMetadata>>,
    output_count: AtomicU32,
    save_counter: AtomicU32,
    depth_map: Mutex<Option<HeapMemory>>,
}

impl PostProcessor {
    pub fn new(host: Arc<dyn CameraHost>, config: PostProcConfig) -> Self {
        let inner = Arc::new_cyclic(|weak_self| Inner {
            host,
            config,
            weak_self: weak_self.clone(),
            jpeg_ops: RwLock::new(None),
            jpeg_callback: RwLock::new(None),
            session: Mutex::new(None),
            submit_lock: Mutex::new(()),
            chain: RwLock::new(Vec::new()),
            input_pp: JobQueue::new("input_pp"),
            ongoing_pp: JobQueue::new("ongoing_pp"),
            input_jpeg: JobQueue::new("input_jpeg"),
            ongoing_jpeg: JobQueue::new("ongoing_jpeg"),
            input_raw: JobQueue::new("input_raw"),
            save_queue: JobQueue::new("save"),
            process_thread: RwLock::new(None),
            save_thread: RwLock::new(None),
            initialized: AtomicBool::new(false),
            active: AtomicBool::new(false),
            processing: AtomicBool::new(false),
            save_active: AtomicBool::new(false),
            buf_count_pp: AtomicU32::new(0),
            pp_index: AtomicUsize::new(0),
            input_metadata: Mutex::new(Vec::new()),
            output_count: AtomicU32::new(0),
            save_counter: AtomicU32::new(0),
            depth_map: Mutex::new(None),
        });
        Self { inner }
    }

    pub fn downgrade(&self) -> WeakPostProcessor {
        WeakPostProcessor {
            inner: Arc::downgrade(&self.inner),
        }
    }

    /// Encoder callback routing completions back into this pipeline
    pub fn jpeg_callback(&self) -> JpegCallback {
        let weak = self.downgrade();
        Arc::new(move |event: JpegEvent| {
            if let Err(e) = weak.process_jpeg_evt(event) {
                debug!(error = %e, "JPEG event not processed");
            }
        })
    }

    // ===== Lifecycle =====

    /// Attach the encoder and spawn the worker threads
    ///
    /// `callback` is handed to every encode session created afterwards.
    pub fn init(&self, jpeg_ops: Arc<dyn JpegOps>, callback: JpegCallback) -> PostProcResult<()> {
        self.inner.init(jpeg_ops, callback)
    }

    /// Stop if needed, join the workers and delete the reprocess chain
    pub fn deinit(&self) {
        self.inner.deinit();
    }

    /// Build the reprocess chain for `source` and start accepting frames
    pub fn start(&self, source: &SharedChannel) -> PostProcResult<()> {
        self.inner.start(source)
    }

    /// Drain everything and return once the encode session is gone
    pub fn stop(&self) -> PostProcResult<()> {
        self.inner.stop()
    }

    pub fn is_initialized(&self) -> bool {
        self.inner.initialized.load(Ordering::SeqCst)
    }

    pub fn is_active(&self) -> bool {
        self.inner.active.load(Ordering::SeqCst)
    }

    // ===== Entry points =====

    /// Accept a captured bundled frame
    pub fn process_data(&self, frame: SuperFrame) -> PostProcResult<()> {
        self.inner.process_data(frame)
    }

    /// Accept a frame for raw delivery
    pub fn process_raw_data(&self, frame: SuperFrame) -> PostProcResult<()> {
        self.inner.process_raw_data(frame)
    }

    /// Reprocess completion for the oldest job in flight
    pub fn process_pp_data(&self, frame: SuperFrame) -> PostProcResult<()> {
        self.inner.process_pp_data(frame)
    }

    /// JPEG completion reported by the encoder
    pub fn process_jpeg_evt(&self, event: JpegEvent) -> PostProcResult<()> {
        self.inner.process_jpeg_evt(event)
    }

    // ===== Queries =====

    pub fn get_reproc_channel(&self, index: usize) -> PostProcResult<Arc<ReprocessChannel>> {
        self.inner.reproc_channel(index)
    }

    pub fn num_reproc_channels(&self) -> usize {
        self.inner.chain.read().len()
    }

    /// Buffer alignment the encoder needs on its input
    pub fn get_jpeg_padding_req(&self) -> Padding {
        Padding {
            width_padding: Padding::PAD_NONE,
            height_padding: Padding::PAD_TO_16,
            plane_padding: Padding::PAD_TO_WORD,
        }
    }

    /// Publish the snapshot layout of `frame` to the parameter store
    pub fn set_yuv_frame_info(&self, frame: &SuperFrame) -> PostProcResult<()> {
        self.inner.set_yuv_frame_info(frame)
    }

    /// Push runtime parameters to every stream `frame` and `source` came from
    pub fn sync_stream_params(
        &self,
        frame: &SuperFrame,
        source: Option<&SuperFrame>,
    ) -> PostProcResult<()> {
        self.inner.sync_stream_params(frame, source)
    }

    /// Main, thumbnail and reprocess streams of `frame`
    pub fn query_streams(
        &self,
        frame: &SuperFrame,
        source: Option<&SuperFrame>,
    ) -> PostProcResult<StreamSelection> {
        self.inner.query_streams(frame, source)
    }

    /// Jobs waiting or in flight per queue, for diagnostics
    pub fn queue_depths(&self) -> QueueDepths {
        let inner = &self.inner;
        QueueDepths {
            input_pp: inner.input_pp.len(),
            ongoing_pp: inner.ongoing_pp.len(),
            input_jpeg: inner.input_jpeg.len(),
            ongoing_jpeg: inner.ongoing_jpeg.len(),
            input_raw: inner.input_raw.len(),
            save: inner.save_queue.len(),
        }
    }
}

impl Drop for PostProcessor {
    fn drop(&mut self) {
        if self.inner.initialized.load(Ordering::SeqCst) {
            debug!("PostProcessor dropped, deinitializing");
            self.inner.deinit();
        }
    }
}

impl std::fmt::Debug for PostProcessor {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("PostProcessor")
            .field("initialized", &self.is_initialized())
            .field("active", &self.is_active())
            .field("queues", &self.queue_depths())
            .finish()
    }
}

/// Snapshot of queue lengths
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct QueueDepths {
    pub input_pp: usize,
    pub ongoing_pp: usize,
    pub input_jpeg: usize,
    pub ongoing_jpeg: usize,
    pub input_raw: usize,
    pub save: usize,
}

impl QueueDepths {
    pub fn is_idle(&self) -> bool {
        *self == QueueDepths::default()
    }
}

impl FrameReleaser for Inner {
    fn release_frame(&self, frame: SuperFrame) {
        match self.find_channel(frame.ch_id) {
            Some(channel) => {
                if let Err(e) = channel.read().buf_done(&frame) {
                    warn!(channel = frame.ch_id, error = %e, "Returning frame buffers failed");
                }
            }
            None => {
                warn!(
                    channel = frame.ch_id,
                    bufs = frame.num_bufs(),
                    "No channel for frame, buffers left to teardown"
                );
            }
        }
    }
}

impl Inner {
    // ===== Lifecycle =====

    fn init(&self, jpeg_ops: Arc<dyn JpegOps>, callback: JpegCallback) -> PostProcResult<()> {
        if self.initialized.load(Ordering::SeqCst) {
            return Err(PostProcError::InvalidState("already initialized".into()));
        }
        *self.jpeg_ops.write() = Some(jpeg_ops);
        *self.jpeg_callback.write() = Some(callback);

        let weak = self.weak_self.clone();
        let save_thread = CmdThread::launch(SAVE_THREAD_NAME, move |cmd| {
            if let Some(inner) = weak.upgrade() {
                inner.handle_save_cmd(cmd);
            }
        })?;
        let weak = self.weak_self.clone();
        let process_thread = CmdThread::launch(PROCESS_THREAD_NAME, move |cmd| {
            if let Some(inner) = weak.upgrade() {
                inner.handle_process_cmd(cmd);
            }
        })?;
        *self.save_thread.write() = Some(Arc::new(save_thread));
        *self.process_thread.write() = Some(Arc::new(process_thread));

        self.initialized.store(true, Ordering::SeqCst);
        info!(
            mem_opt = self.config.jpeg_mem_opt,
            burst = self.config.burst_enabled(),
            save = self.config.longshot_save,
            "Post-processor initialized"
        );
        Ok(())
    }

    fn deinit(&self) {
        if !self.initialized.load(Ordering::SeqCst) {
            return;
        }
        if self.active.load(Ordering::SeqCst) {
            if let Err(e) = self.stop() {
                warn!(error = %e, "Stop during deinit failed");
            }
        }

        let process_thread = self.process_thread.write().take();
        let save_thread = self.save_thread.write().take();
        if let Some(thread) = process_thread {
            thread.exit();
        }
        if let Some(thread) = save_thread {
            thread.exit();
        }

        self.teardown_chain();
        self.destroy_session();
        *self.jpeg_ops.write() = None;
        *self.jpeg_callback.write() = None;
        self.initialized.store(false, Ordering::SeqCst);
        info!("Post-processor deinitialized");
    }

    fn start(&self, source: &SharedChannel) -> PostProcResult<()> {
        if !self.initialized.load(Ordering::SeqCst) {
            return Err(PostProcError::NotInitialized);
        }
        if self.active.load(Ordering::SeqCst) {
            return Err(PostProcError::InvalidState("already started".into()));
        }

        let params = self.host.params();
        if params.reprocess_needed() {
            self.teardown_chain();
            params.set_reproc_count();
            let passes = params.reproc_count();

            let mut chain: Vec<Arc<ReprocessChannel>> = Vec::with_capacity(passes as usize);
            for pass in 0..passes {
                params.set_cur_pp_count(pass + 1);
                let pass_source = match chain.last() {
                    Some(previous) => Arc::clone(previous.channel()),
                    None => Arc::clone(source),
                };
                let channel = self
                    .host
                    .add_reproc_channel(&pass_source, self.reproc_frame_callback())
                    .map_err(|e| {
                        error!(pass, error = %e, "Cannot add reprocess channel");
                        e
                    })?;
                chain.push(Arc::new(channel));
            }

            for (index, channel) in chain.iter().enumerate() {
                if let Err(e) = channel.start() {
                    error!(pass = index, error = %e, "Reprocess channel start failed");
                    for started in &chain[..index] {
                        if let Err(e) = started.stop() {
                            warn!(error = %e, "Rollback stop failed");
                        }
                    }
                    return Err(e.into());
                }
            }
            info!(passes, "Reprocess chain ready");
            *self.chain.write() = chain;
        }

        self.pp_index.store(0, Ordering::SeqCst);
        self.buf_count_pp.store(0, Ordering::SeqCst);
        self.output_count.store(0, Ordering::SeqCst);
        self.input_metadata.lock().clear();

        let thread = self.process_thread().ok_or(PostProcError::NotInitialized)?;
        thread.send_sync(Cmd::Start);
        self.active.store(true, Ordering::SeqCst);
        info!(source = source.read().handle(), "Post-processor started");
        Ok(())
    }

    fn stop(&self) -> PostProcResult<()> {
        if !self.active.swap(false, Ordering::SeqCst) {
            debug!("Stop while not active");
            return Err(PostProcError::NotInitialized);
        }
        if let Some(thread) = self.process_thread() {
            thread.send_sync(Cmd::Stop);
        }
        for channel in self.chain.read().iter() {
            if let Err(e) = channel.stop() {
                warn!(channel = channel.handle(), error = %e, "Reprocess channel stop failed");
            }
        }
        self.host.params().set_cur_pp_count(0);
        info!("Post-processor stopped");
        Ok(())
    }

    fn teardown_chain(&self) {
        let chain = std::mem::take(&mut *self.chain.write());
        for channel in &chain {
            if channel.channel().read().is_active() {
                if let Err(e) = channel.stop() {
                    warn!(channel = channel.handle(), error = %e, "Reprocess channel stop failed");
                }
            }
        }
        if !chain.is_empty() {
            debug!(count = chain.len(), "Reprocess chain deleted");
        }
    }

    fn destroy_session(&self) {
        let session = self.session.lock().take();
        if let (Some(session), Some(ops)) = (session, self.jpeg_ops()) {
            if let Err(e) = ops.destroy_session(session) {
                warn!(session, error = %e, "Destroying JPEG session failed");
            }
        }
    }

    // ===== Helpers =====

    fn process_thread(&self) -> Option<Arc<CmdThread>> {
        self.process_thread.read().clone()
    }

    fn save_thread(&self) -> Option<Arc<CmdThread>> {
        self.save_thread.read().clone()
    }

    fn jpeg_ops(&self) -> Option<Arc<dyn JpegOps>> {
        self.jpeg_ops.read().clone()
    }

    fn signal_next_job(&self) {
        if let Some(thread) = self.process_thread() {
            thread.do_next_job();
        }
    }

    fn notify_error(&self) {
        if let Err(e) = self.host.notifier().notify(CallbackEvent::error()) {
            error!(error = %e, "Error notification rejected");
        }
    }

    fn reproc_channel(&self, index: usize) -> PostProcResult<Arc<ReprocessChannel>> {
        let chain = self.chain.read();
        chain
            .get(index)
            .cloned()
            .ok_or(PostProcError::PassOutOfRange {
                index,
                len: chain.len(),
            })
    }

    /// Capture channel or reprocess channel registered under `handle`
    fn find_channel(&self, handle: u32) -> Option<SharedChannel> {
        self.host.channel_by_handle(handle).or_else(|| {
            self.chain
                .read()
                .iter()
                .find(|c| c.handle() == handle)
                .map(|c| Arc::clone(c.channel()))
        })
    }

    fn find_stream(&self, buf: &BufDef, channel: &SharedChannel) -> Option<Arc<Stream>> {
        channel.read().get_stream_by_handle(buf.stream_id)
    }

    fn reproc_frame_callback(&self) -> FrameCallback {
        let weak = self.weak_self.clone();
        Arc::new(move |frame: SuperFrame| match weak.upgrade() {
            Some(inner) => {
                if let Err(e) = inner.process_pp_data(frame) {
                    warn!(error = %e, "Reprocess output not accepted");
                }
            }
            None => warn!(
                channel = frame.ch_id,
                "Reprocess output after post-processor was dropped"
            ),
        })
    }

    // ===== Entry points =====

    fn process_data(&self, frame: SuperFrame) -> PostProcResult<()> {
        if !self.active.load(Ordering::SeqCst) {
            error!(channel = frame.ch_id, "Post-processor not started, returning frame");
            self.release_frame(frame);
            return Err(PostProcError::NotInitialized);
        }

        let params = self.host.params();
        let metadata = frame.metadata_buf().and_then(|b| b.metadata.clone());
        if let Some(metadata) = &metadata {
            params.update_metadata(&metadata.read());
        }

        if params.reprocess_needed() {
            if params.adv_cam_features_enabled() {
                if let Some(metadata) = &metadata {
                    self.input_metadata.lock().push(Arc::clone(metadata));
                }
            }
            debug!(frame_idx = ?frame.frame_idx(), "Frame queued for reprocess");
            if let Err(request) = self.input_pp.enqueue(PpRequest::new(frame)) {
                warn!("Input reprocess queue is not active");
                request.release(self);
                return Ok(());
            }
        } else if params.raw_picture_format() {
            if params.yuv_frame_info_needed() {
                if let Err(e) = self.set_yuv_frame_info(&frame) {
                    warn!(error = %e, "Publishing YUV frame info failed");
                }
            }
            return self.process_raw_data(frame);
        } else {
            debug!(frame_idx = ?frame.frame_idx(), "Frame queued for JPEG");
            if let Err(job) = self.input_jpeg.enqueue(JpegJob::new(frame, metadata)) {
                warn!("Input JPEG queue is not active");
                job.release(self);
                return Ok(());
            }
        }

        self.signal_next_job();
        Ok(())
    }

    fn process_raw_data(&self, frame: SuperFrame) -> PostProcResult<()> {
        if !self.active.load(Ordering::SeqCst) {
            error!(channel = frame.ch_id, "Post-processor not started, returning raw frame");
            self.release_frame(frame);
            return Err(PostProcError::NotInitialized);
        }
        if let Some(metadata) = frame.metadata_buf().and_then(|b| b.metadata.clone()) {
            self.host.params().update_metadata(&metadata.read());
        }
        if let Err(frame) = self.input_raw.enqueue(frame) {
            warn!("Input raw queue is not active");
            self.release_frame(frame);
            return Ok(());
        }
        self.signal_next_job();
        Ok(())
    }

    fn process_pp_data(&self, frame: SuperFrame) -> PostProcResult<()> {
        // A job left in ongoing_pp is released by the stop flush
        if !self.active.load(Ordering::SeqCst) {
            error!(channel = frame.ch_id, "Post-processor not started, returning reprocess output");
            self.release_frame(frame);
            return Err(PostProcError::NotInitialized);
        }
        let Some(ongoing) = self.ongoing_pp.dequeue() else {
            error!(channel = frame.ch_id, "Cannot find reprocess job");
            self.release_frame(frame);
            return Err(PostProcError::NoPendingJob);
        };

        let params = self.host.params();
        let (source, pass) = match ongoing {
            OngoingPp::Job(job) => {
                let PpJob {
                    intermediate,
                    source,
                    pass,
                } = job;
                // The previous pass's output is no longer needed
                if let Some(previous) = intermediate {
                    self.release_frame(previous);
                }
                (source, pass)
            }
            // Extra output of a batch shot stands in for its own source
            OngoingPp::Placeholder { pass } => {
                debug!(pass, "Batch output arrived");
                return self.route_batch_output(frame, pass);
            }
        };

        if params.raw_picture_format() && !params.generate_thumb_from_main() {
            source.release(self);
            if params.yuv_frame_info_needed() {
                if let Err(e) = self.set_yuv_frame_info(&frame) {
                    warn!(error = %e, "Publishing YUV frame info failed");
                }
            }
            return self.process_raw_data(frame);
        }

        if params.longshot_enabled() {
            self.host.play_shutter();
        }

        let total = params.reproc_count();
        debug!(pass, total, "Reprocess pass done");
        if pass < total {
            let request = PpRequest {
                intermediate: Some(frame),
                source,
                pass,
            };
            if let Err(request) = self.input_pp.enqueue(request) {
                warn!("Input reprocess queue is not active");
                request.release(self);
                return Ok(());
            }
        } else {
            let metadata = self.jpeg_metadata(source.frame(), &frame);
            let job = JpegJob::reprocessed(frame, source, metadata);
            if let Err(job) = self.input_jpeg.enqueue(job) {
                warn!("Input JPEG queue is not active");
                job.release(self);
                return Ok(());
            }
        }

        self.signal_next_job();
        Ok(())
    }

    /// Route an output that has no job of its own
    fn route_batch_output(&self, frame: SuperFrame, pass: u8) -> PostProcResult<()> {
        let total = self.host.params().reproc_count();
        if pass < total {
            let request = PpRequest {
                intermediate: None,
                source: SourceFrame::Owned(frame),
                pass,
            };
            if let Err(request) = self.input_pp.enqueue(request) {
                warn!("Input reprocess queue is not active");
                request.release(self);
                return Ok(());
            }
        } else {
            let metadata = frame.metadata_buf().and_then(|b| b.metadata.clone());
            if let Err(job) = self.input_jpeg.enqueue(JpegJob::new(frame, metadata)) {
                warn!("Input JPEG queue is not active");
                job.release(self);
                return Ok(());
            }
        }
        self.signal_next_job();
        Ok(())
    }

    /// Metadata for the JPEG job built from a reprocess output
    fn jpeg_metadata(&self, source: &SuperFrame, output: &SuperFrame) -> Option<SharedMetadata> {
        let params = self.host.params();
        if params.adv_cam_features_enabled() {
            let pp_index = self.pp_index.fetch_add(1, Ordering::SeqCst);
            let meta_idx = params.exif_buf_index(pp_index);
            let list = self.input_metadata.lock();
            let metadata = list.get(meta_idx).cloned();
            if metadata.is_none() {
                error!(
                    entries = list.len(),
                    index = meta_idx,
                    "Input metadata list too short"
                );
            }
            return metadata;
        }
        source
            .metadata_buf()
            .or_else(|| output.metadata_buf())
            .and_then(|b| b.metadata.clone())
    }

    // ===== Reprocess dispatch =====

    /// Whether the reprocess channel fed by `frame`'s channel has a free slot
    fn validate_post_process(&self, frame: &SuperFrame) -> bool {
        let Some(channel) = self.find_channel(frame.ch_id) else {
            return true;
        };
        let chain = self.chain.read();
        let Some(target) = chain
            .iter()
            .find(|c| c.source().is_some_and(|s| Arc::ptr_eq(&s, &channel)))
        else {
            return true;
        };
        let ongoing = self.ongoing_pp.len();
        for stream in target.streams() {
            if ongoing >= stream.num_queued_bufs() {
                debug!(
                    ongoing,
                    slots = stream.num_queued_bufs(),
                    "Out of reprocess buffers, deferring"
                );
                return false;
            }
        }
        true
    }

    /// Metadata buffer of `source` and the stream it came from
    fn find_meta(&self, source: &SuperFrame) -> Option<(BufDef, Arc<Stream>)> {
        let chain = self.chain.read();
        for reproc in chain.iter() {
            let Some(src_channel) = reproc.source() else {
                continue;
            };
            for buf in &source.bufs {
                if let Some(stream) = self.find_stream(buf, &src_channel) {
                    if stream.is_type_of(StreamType::Metadata) {
                        return Some((buf.clone(), stream));
                    }
                }
            }
        }
        None
    }

    /// Pop the entries just pushed for a failed dispatch and release them
    fn rollback_dispatch(&self, count: usize) {
        for _ in 0..count {
            match self.ongoing_pp.dequeue_last() {
                Some(entry) => entry.release(self),
                None => break,
            }
        }
    }

    /// Dispatch the head of the reprocess input queue if a slot is free
    ///
    /// Returns whether a request left the input queue.
    fn do_reprocess(&self) -> PostProcResult<bool> {
        let Some(request) = self
            .input_pp
            .dequeue_if(|request| self.validate_post_process(request.input()))
        else {
            return Ok(false);
        };

        let params = self.host.params();
        let reproc = match self.reproc_channel(request.pass as usize) {
            Ok(reproc) => reproc,
            Err(e) => {
                error!(pass = request.pass, "Reprocess channel is missing");
                request.release(self);
                return Err(e);
            }
        };

        let meta = self.find_meta(request.source.frame());
        if params.adv_cam_features_enabled() {
            if let Err(e) = self.sync_stream_params(request.input(), Some(request.source.frame())) {
                warn!(error = %e, "Syncing stream parameters failed");
            }
        }

        // Dispatch reads a copy of the buffer table; the job keeps ownership
        let input = request.input();
        let view = SuperFrame::new(input.camera_handle, input.ch_id, input.bufs.clone());
        let mut job = request.into_job();
        let pass = job.pass;
        self.buf_count_pp.fetch_add(1, Ordering::SeqCst);

        if params.regular_capture() {
            // Capture channel teardown reclaims the source buffers
            job.source = job.source.detach();
            if let Err(entry) = self.ongoing_pp.enqueue(OngoingPp::Job(job)) {
                warn!("Ongoing reprocess queue is not active");
                entry.release(self);
                return Ok(true);
            }
            if let Err(e) = reproc.do_reprocess_offline(&view, meta.as_ref().map(|(buf, _)| buf))
            {
                error!(pass, error = %e, "Offline reprocess failed");
                self.rollback_dispatch(1);
                return Err(e.into());
            }
            debug!(pass, frame_idx = ?view.frame_idx(), "Offline reprocess dispatched");
            self.host.stop_capture_channel()?;
            return Ok(true);
        }

        if let Err(entry) = self.ongoing_pp.enqueue(OngoingPp::Job(job)) {
            warn!("Ongoing reprocess queue is not active");
            entry.release(self);
            return Ok(true);
        }
        let mut pushed = 1;
        let count = self.buf_count_pp.load(Ordering::SeqCst);
        let in_bufs = params.in_bufs_for_single_shot().max(1);
        if count % in_bufs == 0 {
            let extra = params.out_bufs_for_single_shot().saturating_sub(in_bufs);
            for _ in 0..extra {
                if self
                    .ongoing_pp
                    .enqueue(OngoingPp::Placeholder { pass })
                    .is_err()
                {
                    break;
                }
                pushed += 1;
            }
        }

        let (meta_stream, meta_buf_index) = match &meta {
            Some((buf, stream)) => (Some(Arc::clone(stream)), buf.buf_idx),
            None => (None, 0),
        };
        if let Err(e) = reproc.do_reprocess(&view, params, meta_stream.as_deref(), meta_buf_index)
        {
            error!(pass, error = %e, "Reprocess request failed");
            self.rollback_dispatch(pushed);
            return Err(e.into());
        }
        debug!(pass, pushed, frame_idx = ?view.frame_idx(), "Reprocess dispatched");
        Ok(true)
    }

    /// Push runtime parameters to the streams of `frame` and `source`
    fn sync_stream_params(
        &self,
        frame: &SuperFrame,
        source: Option<&SuperFrame>,
    ) -> PostProcResult<()> {
        for frame in std::iter::once(frame).chain(source) {
            let Some(channel) = self.find_channel(frame.ch_id) else {
                return Err(PostProcError::ChannelNotFound(frame.ch_id));
            };
            for buf in &frame.bufs {
                if let Some(stream) = self.find_stream(buf, &channel) {
                    stream.sync_runtime_params()?;
                }
            }
        }
        Ok(())
    }

    // ===== Process worker =====

    fn handle_process_cmd(&self, cmd: Cmd) {
        match cmd {
            Cmd::Start => {
                self.ongoing_pp.init();
                self.input_jpeg.init();
                self.input_pp.init();
                self.input_raw.init();
                self.ongoing_jpeg.init();
                self.processing.store(true, Ordering::SeqCst);
                if let Some(thread) = self.save_thread() {
                    thread.send_sync(Cmd::Start);
                }
                debug!("Process worker started");
            }
            Cmd::Stop => {
                if let Some(thread) = self.save_thread() {
                    thread.send_sync(Cmd::Stop);
                }
                self.processing.store(false, Ordering::SeqCst);
                self.abort_ongoing_jpeg();
                self.destroy_session();

                let mut released = 0;
                for entry in self.ongoing_pp.flush() {
                    entry.release(self);
                    released += 1;
                }
                for job in self.input_jpeg.flush() {
                    job.release(self);
                    released += 1;
                }
                for request in self.input_pp.flush() {
                    request.release(self);
                    released += 1;
                }
                for frame in self.input_raw.flush() {
                    self.release_frame(frame);
                    released += 1;
                }
                self.input_metadata.lock().clear();
                self.depth_map.lock().take();
                info!(released, "Process worker drained");
            }
            Cmd::DoNextJob => {
                if self.processing.load(Ordering::SeqCst) {
                    self.run_next_jobs();
                } else {
                    self.discard_next_jobs();
                }
            }
        }
    }

    /// Abort and release every in-flight encode
    ///
    /// No lock is held across `abort_job`: a completion running concurrently
    /// finds its job gone and drops the event.
    fn abort_ongoing_jpeg(&self) {
        let jobs = {
            let _submit = self.submit_lock.lock();
            self.ongoing_jpeg.flush()
        };
        let ops = self.jpeg_ops();
        for job in jobs {
            if let (Some(ops), Some(job_id)) = (ops.as_ref(), job.job_id) {
                if let Err(e) = ops.abort_job(job_id) {
                    warn!(job_id, error = %e, "Aborting JPEG job failed");
                }
            }
            job.release(self);
        }
    }

    /// Drain passes until one makes no progress
    ///
    /// Signals are coalesced, so a single wake-up may stand for several
    /// queued jobs.
    fn run_next_jobs(&self) {
        while self.processing.load(Ordering::SeqCst) && self.run_one_pass() {}
    }

    /// One JPEG job, one raw frame and one reprocess dispatch at most
    fn run_one_pass(&self) -> bool {
        let params = self.host.params();
        let mut progressed = false;

        if let Some(job) = self.input_jpeg.dequeue() {
            progressed = true;
            if params.adv_cam_features_enabled() {
                if let Err(e) = self.sync_stream_params(&job.frame, job.source_frame()) {
                    warn!(error = %e, "Syncing stream parameters failed");
                }
            }
            if let Err(e) = self.encode_data(job) {
                error!(error = %e, "JPEG encode failed");
                self.notify_error();
            }
        }

        if let Some(frame) = self.input_raw.dequeue() {
            progressed = true;
            self.host.play_shutter();
            if let Err(e) = self.process_raw_image(frame) {
                error!(error = %e, "Raw delivery failed");
                self.notify_error();
            }
        }

        match self.do_reprocess() {
            Ok(dispatched) => progressed |= dispatched,
            Err(e) => {
                progressed = true;
                error!(error = %e, "Reprocess dispatch failed");
                self.notify_error();
            }
        }
        progressed
    }

    /// Return whatever is waiting while the pipeline is stopped
    fn discard_next_jobs(&self) {
        let mut released = 0;
        while let Some(job) = self.input_jpeg.dequeue() {
            job.release(self);
            released += 1;
        }
        while let Some(frame) = self.input_raw.dequeue() {
            self.release_frame(frame);
            released += 1;
        }
        for request in self.input_pp.flush() {
            request.release(self);
            released += 1;
        }
        if released > 0 {
            debug!(released, "Discarded jobs while stopped");
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_jpeg_padding() {
        let host = crate::session::SimulatedHost::builder().build();
        let pp = PostProcessor::new(host, PostProcConfig::default());
        let padding = pp.get_jpeg_padding_req();
        assert_eq!(padding.width_padding, Padding::PAD_NONE);
        assert_eq!(padding.height_padding, Padding::PAD_TO_16);
        assert_eq!(padding.plane_padding, Padding::PAD_TO_WORD);
    }

    #[test]
    fn test_start_requires_init() {
        let host = crate::session::SimulatedHost::builder().build();
        let pp = PostProcessor::new(host.clone(), PostProcConfig::default());
        let channel = host.capture_channel().expect("capture channel");
        let result = pp.start(&channel);
        assert!(matches!(result, Err(PostProcError::NotInitialized)));
        assert!(!pp.is_active());
    }

    #[test]
    fn test_stop_without_start_fails() {
        let host = crate::session::SimulatedHost::builder().build();
        let pp = PostProcessor::new(host, PostProcConfig::default());
        assert!(matches!(pp.stop(), Err(PostProcError::NotInitialized)));
    }

    #[test]
    fn test_reproc_channel_out_of_range() {
        let host = crate::session::SimulatedHost::builder().build();
        let pp = PostProcessor::new(host, PostProcConfig::default());
        assert!(matches!(
            pp.get_reproc_channel(0),
            Err(PostProcError::PassOutOfRange { index: 0, len: 0 })
        ));
    }

    use crate::backends::camera::{
        CameraOps, CaptureSettings, Dimension, PixelFormat, StreamInfo,
    };
    use crate::backends::jpeg::SoftwareJpeg;
    use crate::session::SimulatedHost;
    use std::time::{Duration, Instant};

    const TIMEOUT: Duration = Duration::from_secs(20);

    fn running(settings: CaptureSettings) -> (Arc<SimulatedHost>, PostProcessor) {
        let host = SimulatedHost::builder().settings(settings).build();
        let pp = PostProcessor::new(host.clone(), PostProcConfig::default());
        pp.init(Arc::new(SoftwareJpeg::new()), pp.jpeg_callback())
            .unwrap();
        let capture = host.capture_channel().unwrap();
        pp.start(&capture).unwrap();
        host.attach(pp.downgrade());
        host.start_capture().unwrap();
        (host, pp)
    }

    fn settings(passes: u8) -> CaptureSettings {
        let mut settings = CaptureSettings::default();
        settings.snapshot_size = Dimension::new(64, 48);
        settings.thumbnail_size = Dimension::new(32, 24);
        settings.reprocess_passes = passes;
        settings
    }

    fn wait_returned(host: &SimulatedHost) -> bool {
        let deadline = Instant::now() + TIMEOUT;
        while Instant::now() < deadline {
            if host.camera().outstanding() == 0 {
                return true;
            }
            std::thread::sleep(Duration::from_millis(5));
        }
        host.camera().outstanding() == 0
    }

    /// A frame captured on a side channel the pipeline never sees
    fn loose_frame(host: &SimulatedHost) -> SuperFrame {
        let camera = host.camera();
        let sink = Arc::new(Mutex::new(Vec::new()));
        let frames = Arc::clone(&sink);
        let callback: FrameCallback = Arc::new(move |frame: SuperFrame| frames.lock().push(frame));
        let ch = camera
            .add_channel(camera.camera_handle(), None, callback)
            .unwrap();
        let info = StreamInfo::new(StreamType::Snapshot, PixelFormat::Nv21, Dimension::new(8, 8), 2);
        camera.add_stream(camera.camera_handle(), ch, &info).unwrap();
        camera.start_channel(camera.camera_handle(), ch).unwrap();
        camera.inject_frame(ch, 0).unwrap();
        assert!(camera.wait_idle(TIMEOUT));
        sink.lock().pop().unwrap()
    }

    #[test]
    fn test_refused_jpeg_admission_returns_frame() {
        let (host, pp) = running(settings(0));
        // Queue closes while the pipeline still reports active
        drop(pp.inner.input_jpeg.flush());
        assert!(pp.is_active());

        host.capture(0).unwrap();
        assert!(wait_returned(&host));
        assert_eq!(host.camera().double_returns(), 0);
        assert!(host.recorder().images_of(MsgType::CompressedImage).is_empty());
    }

    #[test]
    fn test_refused_reprocess_admission_returns_frame() {
        let (host, pp) = running(settings(1));
        drop(pp.inner.input_pp.flush());

        host.capture(0).unwrap();
        assert!(wait_returned(&host));
        assert_eq!(host.camera().double_returns(), 0);
        assert!(host.camera().reprocess_requests().is_empty());
    }

    #[test]
    fn test_refused_jpeg_after_last_pass_returns_output_and_source() {
        let (host, pp) = running(settings(1));
        drop(pp.inner.input_jpeg.flush());

        host.capture(0).unwrap();
        assert!(wait_returned(&host));
        let camera = host.camera();
        assert_eq!(camera.reprocess_requests().len(), 1);
        assert_eq!(camera.double_returns(), 0);
        assert!(pp.inner.ongoing_pp.is_empty());
        assert!(host.recorder().images_of(MsgType::CompressedImage).is_empty());
    }

    #[test]
    fn test_refused_batch_outputs_are_returned() {
        let mut settings = settings(1);
        settings.out_bufs_per_shot = 2;
        let (host, pp) = running(settings);
        host.camera().set_reprocess_ratio(1, 2);
        drop(pp.inner.input_jpeg.flush());

        host.capture(0).unwrap();
        assert!(wait_returned(&host));
        assert_eq!(host.camera().double_returns(), 0);
        assert!(pp.inner.ongoing_pp.is_empty());
    }

    #[test]
    fn test_work_before_start_is_rejected() {
        let host = SimulatedHost::builder().settings(settings(0)).build();
        let pp = PostProcessor::new(host.clone(), PostProcConfig::default());
        pp.init(Arc::new(SoftwareJpeg::new()), pp.jpeg_callback())
            .unwrap();

        let raw = loose_frame(&host);
        assert!(matches!(
            pp.process_raw_data(raw),
            Err(PostProcError::NotInitialized)
        ));
        let output = loose_frame(&host);
        assert!(matches!(
            pp.process_pp_data(output),
            Err(PostProcError::NotInitialized)
        ));
        assert!(pp.queue_depths().is_idle());
    }

    #[test]
    fn test_queue_depths_idle() {
        assert!(QueueDepths::default().is_idle());
        let busy = QueueDepths {
            input_jpeg: 1,
            ..Default::default()
        };
        assert!(!busy.is_idle());
    }
}
