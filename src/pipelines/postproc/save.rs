// SPDX-License-Identifier: GPL-3.0-only

//! Long-shot save worker
//!
//! In save mode finished JPEGs are written to numbered files instead of
//! being handed over in memory. The application receives the file path and
//! reports back through the release action; a failed delivery removes the
//! file again.

use super::notify::{CallbackEvent, MsgType, ReleaseHandle, ReleaseKind, ReleaseStatus};
use super::{Cmd, Inner};
use crate::backends::camera::HeapMemory;
use crate::backends::jpeg::{JpegEvent, JpegStatus};
use crate::errors::{PostProcError, PostProcResult};
use std::path::PathBuf;
use std::sync::atomic::Ordering;
use tracing::{debug, error, info, warn};

impl Inner {
    pub(super) fn handle_save_cmd(&self, cmd: Cmd) {
        match cmd {
            Cmd::Start => {
                self.save_queue.init();
                self.save_active.store(true, Ordering::SeqCst);
                debug!("Save worker started");
            }
            Cmd::Stop => {
                self.save_active.store(false, Ordering::SeqCst);
                let pending = self.save_queue.flush();
                for event in &pending {
                    if let Some(job) = self.take_ongoing_jpeg(event.job_id) {
                        job.release(self);
                    }
                }
                debug!(dropped = pending.len(), "Save worker stopped");
            }
            Cmd::DoNextJob => {
                while let Some(event) = self.save_queue.dequeue() {
                    self.save_one(event);
                }
            }
        }
    }

    fn save_one(&self, event: JpegEvent) {
        let job_id = event.job_id;
        let Some(job) = self.take_ongoing_jpeg(job_id) else {
            warn!(job_id, "No ongoing job for saved JPEG");
            return;
        };
        let index = job.frame.frame_idx().unwrap_or_default();
        job.release(self);

        if self.save_active.load(Ordering::SeqCst) {
            if let Err(e) = self.write_jpeg(event, index) {
                error!(job_id, error = %e, "Saving JPEG failed");
                self.notify_error();
            }
        }
        self.signal_next_job();
    }

    fn write_jpeg(&self, event: JpegEvent, index: u32) -> PostProcResult<()> {
        let output = match (event.status, event.output) {
            (JpegStatus::Done, Some(output)) => output,
            _ => return Err(PostProcError::EncoderJobFailed(event.job_id)),
        };

        let counter = self.save_counter.fetch_add(1, Ordering::SeqCst);
        let path = PathBuf::from(self.config.store_path(counter));
        if let Some(parent) = path.parent() {
            std::fs::create_dir_all(parent)?;
        }
        std::fs::write(&path, &output.data)?;
        info!(path = %path.display(), bytes = output.data.len(), "JPEG saved");

        let notifier = self.host.notifier();
        if !notifier.has_data_callback() || !notifier.msg_type_enabled(MsgType::CompressedImage) {
            return Ok(());
        }
        let payload = HeapMemory::copy_from(path.to_string_lossy().as_bytes());
        let release_path = path.clone();
        notifier.notify(CallbackEvent::Data {
            msg: MsgType::CompressedImage,
            data: payload,
            index,
            metadata: None,
            release: ReleaseHandle::new(ReleaseKind::File, move |status| {
                if status == ReleaseStatus::Failed {
                    if let Err(e) = std::fs::remove_file(&release_path) {
                        warn!(path = %release_path.display(), error = %e, "Removing undelivered file failed");
                    }
                }
            }),
        })
    }
}
