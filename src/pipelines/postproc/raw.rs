// SPDX-License-Identifier: GPL-3.0-only

//! Raw passthrough delivery

use super::notify::{CallbackEvent, MsgType, ReleaseHandle, ReleaseKind, ReleaseStatus};
use super::{FrameReleaser, Inner};
use crate::backends::camera::{BufDef, HeapMemory, StreamType, SuperFrame, YuvFrameInfo};
use crate::errors::{PostProcError, PostProcResult};
use tracing::{debug, error, warn};

impl Inner {
    /// Deliver the main buffer of `frame` without encoding
    ///
    /// Frames from a ZSL capture channel are lent to the application and
    /// returned when it releases them; anything else is copied and returned
    /// right away.
    pub(super) fn process_raw_image(&self, frame: SuperFrame) -> PostProcResult<()> {
        let params = self.host.params();
        let Some(main_buf) = self.raw_main_buf(&frame) else {
            error!(channel = frame.ch_id, "No raw buffer in frame");
            self.release_frame(frame);
            return Err(PostProcError::NoMainFrame);
        };
        let index = main_buf.frame_idx;
        let metadata = frame
            .metadata_buf()
            .and_then(|b| b.metadata.as_ref())
            .map(|m| m.read().clone());

        let from_reprocess = self.chain.read().iter().any(|c| c.handle() == frame.ch_id);
        let zsl_used = params.zsl_mode() && !from_reprocess;

        let (memory, release) = if zsl_used {
            let memory = HeapMemory::wrap(main_buf.data.clone());
            let weak = self.weak_self.clone();
            let release = ReleaseHandle::new(ReleaseKind::Frame, move |status| {
                match weak.upgrade() {
                    Some(inner) => inner.release_frame(frame),
                    None => warn!(?status, "Raw frame released after post-processor was dropped"),
                }
            });
            (memory, release)
        } else {
            let Some(memory) = self.host.get_memory(&main_buf.data) else {
                error!(len = main_buf.data.len(), "No memory for raw frame");
                self.release_frame(frame);
                return Err(PostProcError::NoMemory("raw frame".into()));
            };
            self.release_frame(frame);
            let release = ReleaseHandle::new(ReleaseKind::Memory, move |status| {
                debug!(index, ?status, "Raw copy released");
            });
            (memory, release)
        };

        let notifier = self.host.notifier();
        if notifier.msg_type_enabled(MsgType::RawImage) {
            notifier.notify(CallbackEvent::Data {
                msg: MsgType::RawImage,
                data: memory.clone(),
                index,
                metadata: metadata.clone(),
                release: ReleaseHandle::new(ReleaseKind::Memory, |_| {}),
            })?;
        }
        if notifier.msg_type_enabled(MsgType::RawImageNotify) {
            notifier.notify(CallbackEvent::Notify {
                msg: MsgType::RawImageNotify,
                ext1: 0,
                ext2: 0,
            })?;
        }

        if notifier.has_data_callback() && notifier.msg_type_enabled(MsgType::CompressedImage) {
            debug!(index, zsl_used, bytes = memory.len(), "Raw frame delivered");
            notifier.notify(CallbackEvent::Data {
                msg: MsgType::CompressedImage,
                data: memory,
                index,
                metadata,
                release,
            })?;
        } else {
            release.release(ReleaseStatus::Delivered);
        }
        Ok(())
    }

    /// RAW sub-buffer, or the first image sub-buffer when there is none
    fn raw_main_buf(&self, frame: &SuperFrame) -> Option<BufDef> {
        let channel = self.find_channel(frame.ch_id)?;
        let mut fallback = None;
        for buf in &frame.bufs {
            let Some(stream) = self.find_stream(buf, &channel) else {
                continue;
            };
            if stream.is_type_of(StreamType::Raw) || stream.is_original_type_of(StreamType::Raw) {
                return Some(buf.clone());
            }
            if fallback.is_none() && !stream.is_type_of(StreamType::Metadata) {
                fallback = Some(buf.clone());
            }
        }
        fallback
    }

    /// Publish the snapshot plane layout for raw YUV captures
    pub(super) fn set_yuv_frame_info(&self, frame: &SuperFrame) -> PostProcResult<()> {
        let channel = self
            .find_channel(frame.ch_id)
            .ok_or(PostProcError::ChannelNotFound(frame.ch_id))?;
        let stream = frame
            .bufs
            .iter()
            .filter_map(|buf| self.find_stream(buf, &channel))
            .find(|s| {
                s.is_type_of(StreamType::Snapshot) || s.is_original_type_of(StreamType::Snapshot)
            })
            .ok_or(PostProcError::NoMainFrame)?;

        let offset = stream.frame_offset();
        let info = YuvFrameInfo {
            frame_len: offset.frame_len,
            y_offset: offset.y_offset,
            cbcr_offset: offset.cbcr_offset,
            format: stream.format().name().to_string(),
        };
        debug!(
            frame_len = info.frame_len,
            cbcr_offset = info.cbcr_offset,
            format = %info.format,
            "YUV frame info published"
        );
        self.host.params().set_yuv_frame_info(info);
        Ok(())
    }
}
