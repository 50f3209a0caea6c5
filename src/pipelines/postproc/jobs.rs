// SPDX-License-Identifier: GPL-3.0-only

//! Job envelopes moving through the post-processing queues
//!
//! Every envelope owns the frames it carries. Frames are moved from one
//! envelope into the next as a job advances, and an envelope that is dropped
//! from the pipeline is consumed by its `release` method, which hands each
//! frame back exactly once.

use crate::backends::camera::{SharedMetadata, SuperFrame};
use crate::backends::jpeg::{ExifTable, JobId};
use tracing::debug;

/// Returns a frame's buffers to the channel that produced them
pub trait FrameReleaser {
    fn release_frame(&self, frame: SuperFrame);
}

/// The capture frame a reprocess chain started from
#[derive(Debug)]
pub enum SourceFrame {
    /// Returned to its channel when the job is released
    Owned(SuperFrame),
    /// Buffers are reclaimed by tearing down the capture channel; releasing
    /// the job leaves them alone
    Detached(SuperFrame),
}

impl SourceFrame {
    pub fn frame(&self) -> &SuperFrame {
        match self {
            SourceFrame::Owned(frame) | SourceFrame::Detached(frame) => frame,
        }
    }

    /// Hand buffer return over to channel teardown
    pub fn detach(self) -> Self {
        match self {
            SourceFrame::Owned(frame) | SourceFrame::Detached(frame) => {
                SourceFrame::Detached(frame)
            }
        }
    }

    pub fn is_detached(&self) -> bool {
        matches!(self, SourceFrame::Detached(_))
    }

    pub fn release(self, releaser: &dyn FrameReleaser) {
        match self {
            SourceFrame::Owned(frame) => releaser.release_frame(frame),
            SourceFrame::Detached(frame) => {
                debug!(
                    channel = frame.ch_id,
                    frame_idx = ?frame.frame_idx(),
                    "Detached source frame left to channel teardown"
                );
            }
        }
    }
}

/// A frame waiting for its next reprocess pass
#[derive(Debug)]
pub struct PpRequest {
    /// Output of the previous pass; `None` before the first pass
    pub intermediate: Option<SuperFrame>,
    pub source: SourceFrame,
    /// Passes already completed
    pub pass: u8,
}

impl PpRequest {
    pub fn new(source: SuperFrame) -> Self {
        Self {
            intermediate: None,
            source: SourceFrame::Owned(source),
            pass: 0,
        }
    }

    /// Frame to feed into the next pass
    pub fn input(&self) -> &SuperFrame {
        self.intermediate
            .as_ref()
            .unwrap_or_else(|| self.source.frame())
    }

    /// Envelope for the pass being dispatched
    pub fn into_job(self) -> PpJob {
        PpJob {
            intermediate: self.intermediate,
            source: self.source,
            pass: self.pass + 1,
        }
    }

    pub fn release(self, releaser: &dyn FrameReleaser) {
        if let Some(frame) = self.intermediate {
            releaser.release_frame(frame);
        }
        self.source.release(releaser);
    }
}

/// A frame inside a reprocess pass
#[derive(Debug)]
pub struct PpJob {
    pub intermediate: Option<SuperFrame>,
    pub source: SourceFrame,
    /// Number of the pass in flight, starting at 1
    pub pass: u8,
}

impl PpJob {
    pub fn release(self, releaser: &dyn FrameReleaser) {
        if let Some(frame) = self.intermediate {
            releaser.release_frame(frame);
        }
        self.source.release(releaser);
    }
}

/// Entry of the in-flight reprocess queue
#[derive(Debug)]
pub enum OngoingPp {
    Job(PpJob),
    /// Keeps the queue length matching the outputs a batch shot produces
    Placeholder { pass: u8 },
}

impl OngoingPp {
    pub fn pass(&self) -> u8 {
        match self {
            OngoingPp::Job(job) => job.pass,
            OngoingPp::Placeholder { pass } => *pass,
        }
    }

    pub fn release(self, releaser: &dyn FrameReleaser) {
        if let OngoingPp::Job(job) = self {
            job.release(releaser);
        }
    }
}

/// A frame ready for, or inside, a JPEG encode
#[derive(Debug)]
pub struct JpegJob {
    /// Frame whose main buffer is encoded
    pub frame: SuperFrame,
    /// Capture frame the reprocess chain started from
    pub source: Option<SourceFrame>,
    pub metadata: Option<SharedMetadata>,
    pub exif: Option<ExifTable>,
    /// Assigned once the encoder accepted the job
    pub job_id: Option<JobId>,
}

impl JpegJob {
    pub fn new(frame: SuperFrame, metadata: Option<SharedMetadata>) -> Self {
        Self {
            frame,
            source: None,
            metadata,
            exif: None,
            job_id: None,
        }
    }

    /// Envelope for the output of the last reprocess pass
    pub fn reprocessed(
        frame: SuperFrame,
        source: SourceFrame,
        metadata: Option<SharedMetadata>,
    ) -> Self {
        Self {
            frame,
            source: Some(source),
            metadata,
            exif: None,
            job_id: None,
        }
    }

    pub fn source_frame(&self) -> Option<&SuperFrame> {
        self.source.as_ref().map(SourceFrame::frame)
    }

    pub fn release(self, releaser: &dyn FrameReleaser) {
        releaser.release_frame(self.frame);
        if let Some(source) = self.source {
            source.release(releaser);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::backends::camera::{BufDef, StreamType};
    use parking_lot::Mutex;

    #[derive(Default)]
    struct Recorder {
        released: Mutex<Vec<u32>>,
    }

    impl FrameReleaser for Recorder {
        fn release_frame(&self, frame: SuperFrame) {
            self.released.lock().push(frame.ch_id);
        }
    }

    fn frame(ch_id: u32) -> SuperFrame {
        SuperFrame::new(
            1,
            ch_id,
            vec![BufDef {
                stream_id: 1,
                stream_type: StreamType::Snapshot,
                buf_idx: 0,
                frame_idx: 0,
                fd: -1,
                data: vec![0u8; 4].into(),
                metadata: None,
            }],
        )
    }

    #[test]
    fn test_first_pass_reads_source() {
        let request = PpRequest::new(frame(10));
        assert_eq!(request.input().ch_id, 10);
        let job = request.into_job();
        assert_eq!(job.pass, 1);

        let recorder = Recorder::default();
        job.release(&recorder);
        assert_eq!(*recorder.released.lock(), vec![10]);
    }

    #[test]
    fn test_later_pass_releases_intermediate_and_source() {
        let request = PpRequest {
            intermediate: Some(frame(20)),
            source: SourceFrame::Owned(frame(10)),
            pass: 1,
        };
        assert_eq!(request.input().ch_id, 20);

        let recorder = Recorder::default();
        request.release(&recorder);
        assert_eq!(*recorder.released.lock(), vec![20, 10]);
    }

    #[test]
    fn test_detached_source_is_not_returned() {
        let job = JpegJob::reprocessed(frame(20), SourceFrame::Owned(frame(10)).detach(), None);
        assert!(job.source.as_ref().is_some_and(SourceFrame::is_detached));

        let recorder = Recorder::default();
        job.release(&recorder);
        assert_eq!(*recorder.released.lock(), vec![20]);
    }

    #[test]
    fn test_placeholder_releases_nothing() {
        let recorder = Recorder::default();
        let placeholder = OngoingPp::Placeholder { pass: 1 };
        assert_eq!(placeholder.pass(), 1);
        placeholder.release(&recorder);
        assert!(recorder.released.lock().is_empty());
    }
}
