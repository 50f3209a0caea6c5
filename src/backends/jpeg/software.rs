// SPDX-License-Identifier: GPL-3.0-only

//! Software JPEG encoder built on the `image` crate
//!
//! Jobs run one at a time on a dedicated encoder thread and complete through
//! the session callback, mirroring how a hardware encoder reports back from
//! its own context.

use super::convert::yuv_to_rgb;
use super::*;
use crate::backends::camera::BackendError;
use crossbeam_channel::{Receiver, Sender, unbounded};
use image::RgbImage;
use image::imageops::{self, FilterType};
use parking_lot::{Condvar, Mutex};
use std::collections::HashMap;
use std::thread::{self, JoinHandle, ThreadId};
use std::time::{Duration, Instant};
use tracing::{debug, error, info, warn};

struct Session {
    params: EncodeParams,
    callback: JpegCallback,
    next_burst_slot: usize,
}

enum JobPhase {
    Queued(Box<EncodeJob>),
    Running { abort_requested: bool },
}

#[derive(Default)]
struct EncoderState {
    sessions: HashMap<SessionId, Session>,
    jobs: HashMap<JobId, JobPhase>,
    next_session: SessionId,
    next_job: JobId,
    paused: bool,
    shutdown: bool,
    fail_jobs: bool,
    completed: usize,
    aborted: usize,
}

struct Shared {
    state: Mutex<EncoderState>,
    changed: Condvar,
}

/// Thread-backed software encoder implementing [`JpegOps`]
pub struct SoftwareJpeg {
    shared: Arc<Shared>,
    sender: Mutex<Option<Sender<JobId>>>,
    worker: Mutex<Option<JoinHandle<()>>>,
    worker_id: Option<ThreadId>,
}

impl SoftwareJpeg {
    pub fn new() -> Self {
        let shared = Arc::new(Shared {
            state: Mutex::new(EncoderState {
                next_session: 1,
                next_job: 1,
                ..Default::default()
            }),
            changed: Condvar::new(),
        });
        let (sender, receiver) = unbounded();
        let worker_shared = Arc::clone(&shared);
        let worker = thread::Builder::new()
            .name("jpeg-encoder".into())
            .spawn(move || encoder_loop(receiver, worker_shared))
            .map_err(|e| error!(error = %e, "Failed to spawn encoder thread"))
            .ok();
        let worker_id = worker.as_ref().map(|h| h.thread().id());
        Self {
            shared,
            sender: Mutex::new(Some(sender)),
            worker: Mutex::new(worker),
            worker_id,
        }
    }

    /// Hold queued jobs until [`SoftwareJpeg::resume`]
    pub fn pause(&self) {
        self.shared.state.lock().paused = true;
    }

    pub fn resume(&self) {
        self.shared.state.lock().paused = false;
        self.shared.changed.notify_all();
    }

    /// Make every subsequent job complete with [`JpegStatus::Error`]
    pub fn set_fail_jobs(&self, fail: bool) {
        self.shared.state.lock().fail_jobs = fail;
    }

    pub fn completed_jobs(&self) -> usize {
        self.shared.state.lock().completed
    }

    pub fn aborted_jobs(&self) -> usize {
        self.shared.state.lock().aborted
    }

    pub fn active_sessions(&self) -> usize {
        self.shared.state.lock().sessions.len()
    }

    pub fn pending_jobs(&self) -> usize {
        self.shared.state.lock().jobs.len()
    }

    /// Wait until no job is queued or running
    pub fn wait_idle(&self, timeout: Duration) -> bool {
        let deadline = Instant::now() + timeout;
        let mut state = self.shared.state.lock();
        while !state.jobs.is_empty() {
            if self.shared.changed.wait_until(&mut state, deadline).timed_out() {
                return state.jobs.is_empty();
            }
        }
        true
    }
}

impl Default for SoftwareJpeg {
    fn default() -> Self {
        Self::new()
    }
}

impl JpegOps for SoftwareJpeg {
    fn create_session(
        &self,
        params: &EncodeParams,
        callback: JpegCallback,
    ) -> BackendResult<SessionId> {
        let mut state = self.shared.state.lock();
        let id = state.next_session;
        state.next_session += 1;
        state.sessions.insert(
            id,
            Session {
                params: params.clone(),
                callback,
                next_burst_slot: 0,
            },
        );
        info!(session = id, quality = params.quality, burst = params.burst, "JPEG session created");
        Ok(id)
    }

    fn start_job(&self, job: EncodeJob) -> BackendResult<JobId> {
        let id = {
            let mut state = self.shared.state.lock();
            if !state.sessions.contains_key(&job.session) {
                return Err(BackendError::Encoder(format!(
                    "unknown session {}",
                    job.session
                )));
            }
            let id = state.next_job;
            state.next_job += 1;
            state.jobs.insert(id, JobPhase::Queued(Box::new(job)));
            id
        };
        let sender = self.sender.lock();
        let sent = sender.as_ref().is_some_and(|s| s.send(id).is_ok());
        if !sent {
            self.shared.state.lock().jobs.remove(&id);
            return Err(BackendError::NotAvailable("encoder thread stopped".into()));
        }
        debug!(job_id = id, "JPEG job queued");
        Ok(id)
    }

    fn abort_job(&self, job_id: JobId) -> BackendResult<()> {
        let mut state = self.shared.state.lock();
        match state.jobs.get_mut(&job_id) {
            None => return Ok(()),
            Some(JobPhase::Queued(_)) => {
                state.jobs.remove(&job_id);
                state.aborted += 1;
                self.shared.changed.notify_all();
                debug!(job_id, "Aborted queued JPEG job");
                return Ok(());
            }
            Some(JobPhase::Running { abort_requested }) => *abort_requested = true,
        }
        if self.worker_id == Some(thread::current().id()) {
            return Err(BackendError::Encoder(
                "abort of a running job from its own callback".into(),
            ));
        }
        while state.jobs.contains_key(&job_id) {
            self.shared.changed.wait(&mut state);
        }
        debug!(job_id, "Aborted running JPEG job");
        Ok(())
    }

    fn destroy_session(&self, session: SessionId) -> BackendResult<()> {
        let mut state = self.shared.state.lock();
        if state.sessions.remove(&session).is_none() {
            return Err(BackendError::Encoder(format!("unknown session {session}")));
        }
        info!(session, "JPEG session destroyed");
        Ok(())
    }
}

impl Drop for SoftwareJpeg {
    fn drop(&mut self) {
        self.shared.state.lock().shutdown = true;
        self.shared.changed.notify_all();
        self.sender.lock().take();
        if let Some(handle) = self.worker.lock().take() {
            if self.worker_id == Some(thread::current().id()) {
                return;
            }
            if handle.join().is_err() {
                warn!("Encoder thread panicked");
            }
        }
    }
}

fn encoder_loop(receiver: Receiver<JobId>, shared: Arc<Shared>) {
    debug!("Encoder thread started");
    for job_id in receiver.iter() {
        let (job, params, callback, slot, fail) = {
            let mut state = shared.state.lock();
            while state.paused && !state.shutdown {
                shared.changed.wait(&mut state);
            }
            if state.shutdown {
                break;
            }
            let job = match state.jobs.remove(&job_id) {
                Some(JobPhase::Queued(job)) => job,
                // aborted before it started
                _ => continue,
            };
            state.jobs.insert(
                job_id,
                JobPhase::Running {
                    abort_requested: false,
                },
            );
            let fail = state.fail_jobs;
            match state.sessions.get_mut(&job.session) {
                Some(session) => {
                    let slot = job.dst_index.unwrap_or_else(|| {
                        let slot = session.next_burst_slot;
                        session.next_burst_slot =
                            (slot + 1) % session.params.num_dst_bufs.max(1);
                        slot
                    });
                    (
                        job,
                        Some(session.params.clone()),
                        Some(Arc::clone(&session.callback)),
                        slot,
                        fail,
                    )
                }
                None => (job, None, None, 0, fail),
            }
        };

        let output = match (&params, fail) {
            (Some(params), false) => encode(&job, params, slot),
            (Some(_), true) => Err("injected failure".to_string()),
            (None, _) => Err(format!("session {} destroyed", job.session)),
        };
        let event = match output {
            Ok(output) => JpegEvent {
                job_id,
                status: JpegStatus::Done,
                output: Some(output),
            },
            Err(e) => {
                warn!(job_id, error = %e, "JPEG job failed");
                JpegEvent {
                    job_id,
                    status: JpegStatus::Error,
                    output: None,
                }
            }
        };

        let abort_requested = matches!(
            shared.state.lock().jobs.get(&job_id),
            Some(JobPhase::Running {
                abort_requested: true
            })
        );
        if !abort_requested {
            if let Some(callback) = callback {
                callback(event);
            }
        }

        let mut state = shared.state.lock();
        state.jobs.remove(&job_id);
        if abort_requested {
            state.aborted += 1;
        } else {
            state.completed += 1;
        }
        shared.changed.notify_all();
    }
    debug!("Encoder thread exiting");
}

fn encode(job: &EncodeJob, params: &EncodeParams, slot: usize) -> Result<JpegOutput, String> {
    let main = render(&job.main, &job.main_dim, job.rotation)?;
    let mut data = encode_rgb(&main, params.quality)?;

    let mut thumbnail_len = 0;
    if params.encode_thumbnail {
        let source = job.thumbnail.as_ref().unwrap_or(&job.main);
        let thumb = render(source, &job.thumb_dim, params.thumb_rotation)?;
        thumbnail_len = encode_rgb(&thumb, params.thumb_quality)?.len();
    }

    if let Some(exif) = job.exif.as_ref().filter(|t| !t.is_empty()) {
        if data.starts_with(&[0xFF, 0xD8]) {
            let app1 = exif.to_app1();
            let mut with_exif = Vec::with_capacity(data.len() + app1.len());
            with_exif.extend_from_slice(&data[..2]);
            with_exif.extend(app1);
            with_exif.extend_from_slice(&data[2..]);
            data = with_exif;
        }
    }

    debug!(
        bytes = data.len(),
        thumbnail_len,
        width = main.width(),
        height = main.height(),
        "JPEG encoded"
    );
    Ok(JpegOutput {
        data,
        buf_index: slot,
        thumbnail_len,
    })
}

/// Crop, scale and rotate one source image
fn render(src: &SourceImage, dims: &ImageDims, rotation: u32) -> Result<RgbImage, String> {
    let crop = if dims.crop.width == 0 || dims.crop.height == 0 {
        Rect::full(dims.src)
    } else {
        dims.crop
    };
    let mut img = yuv_to_rgb(
        &src.data,
        src.format,
        dims.src.width,
        dims.src.height,
        &src.offset,
        crop,
    )
    .ok_or_else(|| format!("source buffer too short ({} bytes)", src.data.len()))?;

    if !dims.dst.is_empty() && (img.width(), img.height()) != (dims.dst.width, dims.dst.height) {
        img = imageops::resize(&img, dims.dst.width, dims.dst.height, FilterType::Triangle);
    }

    Ok(match rotation % 360 {
        90 => imageops::rotate90(&img),
        180 => imageops::rotate180(&img),
        270 => imageops::rotate270(&img),
        _ => img,
    })
}

fn encode_rgb(img: &RgbImage, quality: u32) -> Result<Vec<u8>, String> {
    let mut buffer = Vec::new();
    let mut cursor = std::io::Cursor::new(&mut buffer);
    let mut encoder =
        image::codecs::jpeg::JpegEncoder::new_with_quality(&mut cursor, quality.clamp(1, 100) as u8);
    encoder
        .encode(
            img.as_raw(),
            img.width(),
            img.height(),
            image::ExtendedColorType::Rgb8,
        )
        .map_err(|e| format!("JPEG encoding failed: {}", e))?;
    Ok(buffer)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::backends::camera::Padding;
    use std::sync::mpsc;

    fn params() -> EncodeParams {
        let dim = Dimension::new(16, 16);
        EncodeParams {
            main_dim: ImageDims {
                src: dim,
                dst: dim,
                crop: Rect::full(dim),
            },
            thumb_dim: ImageDims::default(),
            color_format: JpegColorFormat::YCrCbH2V2,
            thumb_color_format: JpegColorFormat::YCrCbH2V2,
            quality: 85,
            thumb_quality: 75,
            encode_thumbnail: false,
            rotation: 0,
            thumb_rotation: 0,
            burst: false,
            num_dst_bufs: 1,
            mem_opt: true,
        }
    }

    fn job(session: SessionId) -> EncodeJob {
        let dim = Dimension::new(16, 16);
        let offset = FrameOffset::for_format(PixelFormat::Nv21, dim, &Padding::default());
        EncodeJob {
            session,
            main: SourceImage {
                data: vec![128u8; offset.frame_len as usize].into(),
                buf_index: 0,
                format: PixelFormat::Nv21,
                offset,
            },
            main_dim: params().main_dim,
            thumbnail: None,
            thumb_dim: ImageDims::default(),
            dst_index: Some(0),
            work_buf: None,
            rotation: 90,
            exif: None,
            q3a_version: [0; 4],
            metadata: None,
            mobicat_mask: 0,
            multi_image: None,
        }
    }

    #[test]
    fn test_job_completes_through_callback() {
        let encoder = SoftwareJpeg::new();
        let (tx, rx) = mpsc::channel();
        let tx = Mutex::new(tx);
        let session = encoder
            .create_session(&params(), Arc::new(move |evt: JpegEvent| {
                let _ = tx.lock().send(evt);
            }))
            .unwrap();
        let id = encoder.start_job(job(session)).unwrap();

        let evt = rx.recv_timeout(Duration::from_secs(5)).unwrap();
        assert_eq!(evt.job_id, id);
        assert_eq!(evt.status, JpegStatus::Done);
        let output = evt.output.unwrap();
        assert_eq!(&output.data[..2], &[0xFF, 0xD8]);
        assert!(encoder.wait_idle(Duration::from_secs(5)));
        assert_eq!(encoder.completed_jobs(), 1);
    }

    #[test]
    fn test_abort_queued_job_suppresses_callback() {
        let encoder = SoftwareJpeg::new();
        let (tx, rx) = mpsc::channel();
        let tx = Mutex::new(tx);
        let session = encoder
            .create_session(&params(), Arc::new(move |evt: JpegEvent| {
                let _ = tx.lock().send(evt);
            }))
            .unwrap();
        encoder.pause();
        let id = encoder.start_job(job(session)).unwrap();
        encoder.abort_job(id).unwrap();
        encoder.resume();

        assert!(rx.recv_timeout(Duration::from_millis(200)).is_err());
        assert_eq!(encoder.aborted_jobs(), 1);
        assert_eq!(encoder.pending_jobs(), 0);
    }

    #[test]
    fn test_injected_failure_reports_error() {
        let encoder = SoftwareJpeg::new();
        let (tx, rx) = mpsc::channel();
        let tx = Mutex::new(tx);
        let session = encoder
            .create_session(&params(), Arc::new(move |evt: JpegEvent| {
                let _ = tx.lock().send(evt);
            }))
            .unwrap();
        encoder.set_fail_jobs(true);
        encoder.start_job(job(session)).unwrap();
        let evt = rx.recv_timeout(Duration::from_secs(5)).unwrap();
        assert_eq!(evt.status, JpegStatus::Error);
        assert!(evt.output.is_none());
    }

    #[test]
    fn test_unknown_session_rejected() {
        let encoder = SoftwareJpeg::new();
        assert!(encoder.start_job(job(42)).is_err());
        assert!(encoder.destroy_session(42).is_err());
    }
}
