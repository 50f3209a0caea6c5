// SPDX-License-Identifier: GPL-3.0-only

//! JPEG submission and completion
//!
//! `encode_data` runs on the process worker; `process_jpeg_evt` runs on the
//! encoder's completion thread. Both hold `submit_lock` while touching the
//! ongoing-JPEG queue, so a completion can never look for a job that is
//! still being submitted.

use super::notify::{CallbackEvent, MsgType, ReleaseHandle, ReleaseKind};
use super::{Inner, JpegJob};
use crate::backends::camera::{
    BufDef, Dimension, HeapMemory, Metadata, MiscResult, MpoRole, PixelFormat, Rect, Stream,
    StreamType, SuperFrame,
};
use crate::backends::jpeg::{
    EncodeJob, EncodeParams, ImageDims, JobId, JpegColorFormat, JpegEvent, JpegOps, JpegStatus,
    MultiImageInfo, SessionId, SourceImage,
};
use crate::constants::{DEFAULT_JPEG_QUALITY, JpegRotation, MAX_JPEG_BURST};
use crate::errors::{PostProcError, PostProcResult};
use std::sync::Arc;
use std::sync::atomic::Ordering;
use tracing::{debug, error, info, warn};

/// Streams an encode reads from
#[derive(Debug, Clone, Default)]
pub struct StreamSelection {
    /// Snapshot, video or offline RAW buffer
    pub main: Option<(BufDef, Arc<Stream>)>,
    /// Preview or postview buffer the thumbnail is scaled from
    pub thumb: Option<(BufDef, Arc<Stream>)>,
    /// Offline stream that produced the frame, for reprocess outputs
    pub reproc: Option<Arc<Stream>>,
}

fn is_main_stream(stream: &Stream, offline_raw: bool) -> bool {
    stream.is_type_of(StreamType::Snapshot)
        || stream.is_original_type_of(StreamType::Snapshot)
        || stream.is_type_of(StreamType::Video)
        || stream.is_original_type_of(StreamType::Video)
        || (offline_raw && stream.is_original_type_of(StreamType::Raw))
}

fn is_thumb_stream(stream: &Stream) -> bool {
    [StreamType::Preview, StreamType::Postview]
        .iter()
        .any(|t| stream.is_type_of(*t) || stream.is_original_type_of(*t))
}

impl Inner {
    pub(super) fn query_streams(
        &self,
        frame: &SuperFrame,
        source: Option<&SuperFrame>,
    ) -> PostProcResult<StreamSelection> {
        let params = self.host.params();
        let channel = self
            .find_channel(frame.ch_id)
            .ok_or(PostProcError::ChannelNotFound(frame.ch_id))?;

        // A ZSL preview flipped differently from the snapshot is unusable
        let thumb_allowed = (!params.zsl_mode()
            || params.flip_mode(StreamType::Snapshot) == params.flip_mode(StreamType::Preview))
            && !params.generate_thumb_from_main();

        let mut selection = StreamSelection::default();
        for buf in &frame.bufs {
            let Some(stream) = self.find_stream(buf, &channel) else {
                continue;
            };
            if stream.is_type_of(StreamType::OfflineProc) {
                selection.reproc = Some(Arc::clone(&stream));
            }
            if selection.main.is_none() && is_main_stream(&stream, params.offline_raw()) {
                selection.main = Some((buf.clone(), stream));
            } else if thumb_allowed && selection.thumb.is_none() && is_thumb_stream(&stream) {
                selection.thumb = Some((buf.clone(), stream));
            }
        }

        if selection.thumb.is_none() && thumb_allowed {
            if let Some(source) = source {
                if let Some(src_channel) = self.find_channel(source.ch_id) {
                    selection.thumb = source.bufs.iter().find_map(|buf| {
                        self.find_stream(buf, &src_channel)
                            .filter(|s| is_thumb_stream(s))
                            .map(|s| (buf.clone(), s))
                    });
                }
            }
        }

        debug!(
            main = ?selection.main.as_ref().map(|(_, s)| s.handle()),
            thumb = ?selection.thumb.as_ref().map(|(_, s)| s.handle()),
            reproc = ?selection.reproc.as_ref().map(|s| s.handle()),
            "Streams resolved"
        );
        Ok(selection)
    }

    /// Session-wide parameters for encodes from `main`
    pub(super) fn encode_params(&self, main: &Stream, thumb: Option<&Stream>) -> EncodeParams {
        let params = self.host.params();
        let burst = self.config.burst_enabled();
        let quality = match params.jpeg_quality() {
            0 => DEFAULT_JPEG_QUALITY,
            q => q,
        };
        let rotation = self.encoder_rotation();
        let thumb_format = thumb.map(Stream::format).unwrap_or(main.format());
        let thumbnail_size = params.thumbnail_size();

        EncodeParams {
            main_dim: ImageDims {
                src: main.dimension(),
                dst: main.dimension(),
                crop: Rect::full(main.dimension()),
            },
            thumb_dim: ImageDims {
                src: thumb.map(Stream::dimension).unwrap_or(main.dimension()),
                dst: thumbnail_size,
                crop: Rect::default(),
            },
            color_format: JpegColorFormat::from_pixel_format(main.format()),
            thumb_color_format: JpegColorFormat::from_pixel_format(thumb_format),
            quality,
            thumb_quality: quality,
            encode_thumbnail: !self.config.thumbnail_disabled
                && !thumbnail_size.is_empty()
                && main.format() != PixelFormat::YOnly,
            rotation: rotation.degrees(),
            thumb_rotation: rotation.degrees(),
            burst,
            num_dst_bufs: if burst { MAX_JPEG_BURST as usize } else { 1 },
            mem_opt: self.config.jpeg_mem_opt,
        }
    }

    /// Rotation left for the encoder to apply
    fn encoder_rotation(&self) -> JpegRotation {
        let params = self.host.params();
        if params.rotation_handled_by_reprocess() {
            JpegRotation::Deg0
        } else {
            JpegRotation::from_degrees(params.jpeg_rotation())
        }
    }

    /// Session for the current configuration, created on first use
    fn ensure_session(
        &self,
        ops: &Arc<dyn JpegOps>,
        main: &Stream,
        thumb: Option<&Stream>,
    ) -> PostProcResult<SessionId> {
        let mut session = self.session.lock();
        if let Some(id) = *session {
            return Ok(id);
        }
        let callback = self
            .jpeg_callback
            .read()
            .clone()
            .ok_or(PostProcError::NotInitialized)?;
        let params = self.encode_params(main, thumb);
        let id = ops.create_session(&params, callback).map_err(|e| {
            error!(error = %e, "Cannot create JPEG session");
            e
        })?;
        info!(session = id, quality = params.quality, burst = params.burst, "JPEG session ready");
        *session = Some(id);
        Ok(id)
    }

    /// Build and submit the encode for `job`
    ///
    /// The job is released on every failure path; an inactive ongoing queue
    /// (stop in progress) releases it without submitting.
    pub(super) fn encode_data(&self, job: JpegJob) -> PostProcResult<()> {
        let Some(ops) = self.jpeg_ops() else {
            job.release(self);
            return Err(PostProcError::NotInitialized);
        };
        let selection = match self.query_streams(&job.frame, job.source_frame()) {
            Ok(selection) => selection,
            Err(e) => {
                job.release(self);
                return Err(e);
            }
        };
        let Some((main_buf, main_stream)) = selection.main.clone() else {
            error!(channel = job.frame.ch_id, "No main stream in frame");
            job.release(self);
            return Err(PostProcError::NoMainFrame);
        };
        let thumb_stream = selection.thumb.as_ref().map(|(_, s)| Arc::clone(s));

        let session = match self.ensure_session(&ops, &main_stream, thumb_stream.as_deref()) {
            Ok(session) => session,
            Err(e) => {
                job.release(self);
                return Err(e);
            }
        };

        self.host.dump_frame(&job.frame, &main_stream);
        if self.host.params().refocus_enabled() {
            self.capture_depth_map(selection.reproc.as_deref());
        }

        let encode_job = self.build_encode_job(session, &job, &selection, &main_buf, &main_stream);
        self.submit(&ops, job, encode_job)
    }

    fn build_encode_job(
        &self,
        session: SessionId,
        job: &JpegJob,
        selection: &StreamSelection,
        main_buf: &BufDef,
        main_stream: &Stream,
    ) -> EncodeJob {
        let params = self.host.params();
        let metadata = job.metadata.as_ref().map(|m| m.read().clone());

        let main_dim = self.main_dims(main_stream, metadata.as_ref());
        let rotation = self.encoder_rotation();

        let (thumbnail, thumb_src_dim, thumb_crop) = match &selection.thumb {
            Some((buf, stream)) => {
                let crop = metadata
                    .as_ref()
                    .and_then(|m| m.crop.find(stream.server_id()).map(|c| c.crop))
                    .unwrap_or_else(|| Rect::full(stream.dimension()));
                (
                    Some(source_image(buf, stream)),
                    stream.dimension(),
                    crop,
                )
            }
            // Thumbnail comes from the main image
            None => (None, main_dim.src, main_dim.crop),
        };
        let mut thumb_dst = params.thumbnail_size();
        if rotation.swaps_dimensions() {
            thumb_dst = thumb_dst.swapped();
        }

        let dst_index = if self.config.jpeg_mem_opt {
            Some(main_buf.buf_idx as usize)
        } else if self.config.burst_enabled() {
            None
        } else {
            Some(0)
        };

        let work_buf = if params.low_power_mode() {
            None
        } else {
            job.source_frame().and_then(|source| {
                source
                    .bufs
                    .iter()
                    .find(|b| b.stream_type != StreamType::Metadata)
                    .map(|b| Arc::clone(&b.data))
            })
        };

        let multi_image = params.mpo_role().map(|role| MultiImageInfo {
            is_primary: role == MpoRole::Primary,
            num_images: 2,
        });

        EncodeJob {
            session,
            main: source_image(main_buf, main_stream),
            main_dim,
            thumbnail,
            thumb_dim: ImageDims {
                src: thumb_src_dim,
                dst: thumb_dst,
                crop: thumb_crop,
            },
            dst_index,
            work_buf,
            rotation: rotation.degrees(),
            exif: job.exif.clone().or_else(|| self.host.build_exif()),
            q3a_version: params.q3a_version(),
            metadata,
            mobicat_mask: params.mobicat_mask(),
            multi_image,
        }
    }

    /// Source size, crop and output size of the main image
    fn main_dims(
        &self,
        main: &Stream,
        metadata: Option<&Metadata>,
    ) -> ImageDims {
        let params = self.host.params();
        let src = main.dimension();
        let mut crop = metadata
            .and_then(|m| m.crop.find(main.server_id()).map(|c| c.crop))
            .unwrap_or_else(|| Rect::full(src));
        if params.image_feature_crop_enabled() {
            if let Some(feature_crop) = metadata.and_then(|m| m.img_prop_crop) {
                debug!(?feature_crop, "Image feature crop overrides stream crop");
                crop = feature_crop;
            }
        }
        let dst = if params.hdr_enabled() && params.hdr_output_crop_enabled() {
            Dimension::new(crop.width, crop.height)
        } else {
            src
        };
        ImageDims { src, dst, crop }
    }

    /// Keep the refocus side result of the reprocess stream for delivery
    fn capture_depth_map(&self, reproc: Option<&Stream>) {
        let Some(result) = reproc.and_then(Stream::misc_result) else {
            return;
        };
        if result.is_empty() {
            return;
        }
        debug!(width = result.width, height = result.height, "Depth map captured");
        *self.depth_map.lock() = Some(depth_map_memory(&result));
    }

    fn submit(
        &self,
        ops: &Arc<dyn JpegOps>,
        mut job: JpegJob,
        encode_job: EncodeJob,
    ) -> PostProcResult<()> {
        let submit = self.submit_lock.lock();
        if !self.ongoing_jpeg.is_active() {
            drop(submit);
            debug!("Ongoing JPEG queue inactive, dropping job");
            job.release(self);
            return Ok(());
        }
        let job_id = match ops.start_job(encode_job) {
            Ok(job_id) => job_id,
            Err(e) => {
                drop(submit);
                error!(error = %e, "JPEG job submission failed");
                job.release(self);
                return Err(e.into());
            }
        };
        job.job_id = Some(job_id);
        let frame_idx = job.frame.frame_idx();
        if let Err(job) = self.ongoing_jpeg.enqueue(job) {
            drop(submit);
            warn!(job_id, "Ongoing JPEG queue closed during submission");
            if let Err(e) = ops.abort_job(job_id) {
                warn!(job_id, error = %e, "Aborting JPEG job failed");
            }
            job.release(self);
            return Ok(());
        }
        debug!(job_id, ?frame_idx, "JPEG job submitted");
        Ok(())
    }

    /// Remove the in-flight job the encoder finished
    pub(super) fn take_ongoing_jpeg(&self, job_id: JobId) -> Option<JpegJob> {
        let _submit = self.submit_lock.lock();
        self.ongoing_jpeg
            .take_matching(|job| job.job_id == Some(job_id))
            .into_iter()
            .next()
    }

    pub(super) fn process_jpeg_evt(&self, event: JpegEvent) -> PostProcResult<()> {
        if !self.initialized.load(Ordering::SeqCst) {
            warn!(job_id = event.job_id, "JPEG event while not initialized");
            return Err(PostProcError::NotInitialized);
        }

        if self.config.longshot_save && self.host.params().longshot_enabled() {
            let job_id = event.job_id;
            if let Err(event) = self.save_queue.enqueue(event) {
                warn!(job_id = event.job_id, "Save queue is not active");
                if let Some(job) = self.take_ongoing_jpeg(job_id) {
                    job.release(self);
                }
                self.signal_next_job();
                return Ok(());
            }
            if let Some(thread) = self.save_thread() {
                thread.do_next_job();
            }
            return Ok(());
        }

        let Some(job) = self.take_ongoing_jpeg(event.job_id) else {
            warn!(job_id = event.job_id, "No ongoing job for JPEG event");
            self.signal_next_job();
            return Ok(());
        };
        let index = job.frame.frame_idx().unwrap_or_default();
        job.release(self);

        let result = self.deliver_jpeg(event, index);
        self.signal_next_job();
        result
    }

    fn deliver_jpeg(&self, event: JpegEvent, index: u32) -> PostProcResult<()> {
        let notifier = self.host.notifier();
        if !notifier.has_data_callback() || !notifier.msg_type_enabled(MsgType::CompressedImage) {
            debug!(job_id = event.job_id, "Compressed image not requested");
            return Ok(());
        }

        let output = match (event.status, event.output) {
            (JpegStatus::Done, Some(output)) => output,
            (status, _) => {
                error!(job_id = event.job_id, ?status, "JPEG job reported an error");
                self.notify_error();
                return Err(PostProcError::EncoderJobFailed(event.job_id));
            }
        };
        self.host.dump_jpeg(event.job_id, &output.data);

        let len = output.data.len();
        let memory = if self.config.jpeg_mem_opt {
            HeapMemory::wrap(output.data.into())
        } else {
            match self.host.get_memory(&output.data) {
                Some(memory) => memory,
                None => {
                    error!(len, "No memory for JPEG output");
                    self.notify_error();
                    return Err(PostProcError::NoMemory("JPEG output".into()));
                }
            }
        };

        if let Err(e) = notifier.notify(CallbackEvent::Data {
            msg: MsgType::CompressedImage,
            data: memory,
            index,
            metadata: None,
            release: memory_release(event.job_id),
        }) {
            error!(job_id = event.job_id, error = %e, "JPEG delivery rejected");
            self.notify_error();
            return Err(e);
        }
        let delivered = self.output_count.fetch_add(1, Ordering::SeqCst) + 1;
        info!(job_id = event.job_id, bytes = len, index, "JPEG delivered");

        let params = self.host.params();
        if params.refocus_enabled() && delivered + 1 == params.refocus_output_count() {
            match self.depth_map.lock().take() {
                Some(depth_map) => {
                    if let Err(e) = notifier.notify(CallbackEvent::Data {
                        msg: MsgType::CompressedImage,
                        data: depth_map,
                        index,
                        metadata: None,
                        release: memory_release(event.job_id),
                    }) {
                        error!(job_id = event.job_id, error = %e, "Depth map delivery rejected");
                        self.notify_error();
                        return Err(e);
                    }
                    debug!(job_id = event.job_id, "Depth map delivered");
                }
                None => warn!(job_id = event.job_id, "No depth map to deliver"),
            }
        }
        Ok(())
    }
}

fn source_image(buf: &BufDef, stream: &Stream) -> SourceImage {
    SourceImage {
        data: Arc::clone(&buf.data),
        buf_index: buf.buf_idx,
        format: stream.format(),
        offset: stream.frame_offset(),
    }
}

fn depth_map_memory(result: &MiscResult) -> HeapMemory {
    let mut bytes = Vec::with_capacity(result.header.len() + result.data.len());
    bytes.extend_from_slice(&result.header);
    bytes.extend_from_slice(&result.data);
    HeapMemory::copy_from(&bytes)
}

fn memory_release(job_id: JobId) -> ReleaseHandle {
    ReleaseHandle::new(ReleaseKind::Memory, move |status| {
        debug!(job_id, ?status, "JPEG memory released");
    })
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_depth_map_concatenates_header_and_data() {
        let result = MiscResult {
            header: vec![1, 2],
            width: 2,
            height: 1,
            data: vec![7, 8],
        };
        assert_eq!(depth_map_memory(&result).as_slice(), &[1, 2, 7, 8]);
    }
}
