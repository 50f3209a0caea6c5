// SPDX-License-Identifier: GPL-3.0-only

//! Capture-oriented channel views
//!
//! Both wrap a [`SharedChannel`] so the same channel stays reachable through
//! the host registry while capture requests go through the wrapper.

use super::SharedChannel;
use crate::backends::camera::{AdvancedCaptureType, CaptureRequest, StreamType};
use crate::errors::{ChannelError, ChannelResult};
use tracing::{debug, error};

/// Snapshot channel: burst requests, staged captures and queue flushes
#[derive(Debug, Clone)]
pub struct PictureChannel {
    channel: SharedChannel,
}

impl PictureChannel {
    pub fn new(channel: SharedChannel) -> Self {
        Self { channel }
    }

    pub fn channel(&self) -> &SharedChannel {
        &self.channel
    }

    /// Ask the driver for `request.num_frames` future bundled frames
    pub fn take_picture(&self, request: CaptureRequest) -> ChannelResult<()> {
        let ch = self.channel.read();
        debug!(channel = ch.handle(), frames = request.num_frames, "Requesting super buffers");
        ch.ops()
            .request_super_buf(ch.camera_handle(), ch.handle(), request)?;
        Ok(())
    }

    pub fn cancel_picture(&self) -> ChannelResult<()> {
        let ch = self.channel.read();
        ch.ops()
            .cancel_super_buf_request(ch.camera_handle(), ch.handle())?;
        Ok(())
    }

    pub fn start_advanced_capture(&self, kind: AdvancedCaptureType) -> ChannelResult<()> {
        let ch = self.channel.read();
        ch.ops()
            .process_advanced_capture(ch.camera_handle(), ch.handle(), kind, true)?;
        Ok(())
    }

    pub fn stop_advanced_capture(&self, kind: AdvancedCaptureType) -> ChannelResult<()> {
        let ch = self.channel.read();
        ch.ops()
            .process_advanced_capture(ch.camera_handle(), ch.handle(), kind, false)?;
        Ok(())
    }

    /// Drop frames queued in the driver up to `frame_idx`
    pub fn flush_superbuffer(&self, frame_idx: u32) -> ChannelResult<()> {
        let ch = self.channel.read();
        ch.ops()
            .flush_super_buf_queue(ch.camera_handle(), ch.handle(), frame_idx)?;
        Ok(())
    }
}

/// Video channel with the opaque-handle buffer return path
#[derive(Debug, Clone)]
pub struct VideoChannel {
    channel: SharedChannel,
}

impl VideoChannel {
    pub fn new(channel: SharedChannel) -> Self {
        Self { channel }
    }

    pub fn channel(&self) -> &SharedChannel {
        &self.channel
    }

    /// Live snapshot during recording
    pub fn take_picture(&self, request: CaptureRequest) -> ChannelResult<()> {
        let ch = self.channel.read();
        ch.ops()
            .request_super_buf(ch.camera_handle(), ch.handle(), request)?;
        Ok(())
    }

    pub fn cancel_picture(&self) -> ChannelResult<()> {
        let ch = self.channel.read();
        ch.ops()
            .cancel_super_buf_request(ch.camera_handle(), ch.handle())?;
        Ok(())
    }

    /// Return a video buffer known only by its opaque handle
    pub fn release_frame(&self, opaque: u64, is_metadata: bool) -> ChannelResult<()> {
        let ch = self.channel.read();
        let stream = ch
            .streams()
            .iter()
            .find(|s| s.is_type_of(StreamType::Video))
            .ok_or_else(|| {
                error!(channel = ch.handle(), "No video stream in the channel");
                ChannelError::MissingStream(StreamType::Video)
            })?;
        stream.release_opaque(opaque, is_metadata)?;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::backends::camera::{
        Dimension, HeapMemory, PixelFormat, SimulatedCamera, StreamInfo, SuperFrame,
    };
    use crate::channels::{Channel, StreamSetup};
    use parking_lot::Mutex;
    use std::sync::Arc;
    use std::time::Duration;

    fn shared_channel(sim: &Arc<SimulatedCamera>, stream_type: StreamType) -> SharedChannel {
        let mut ch = Channel::new(sim.clone(), sim.camera_handle());
        ch.init(None, Arc::new(|_frame: SuperFrame| {})).unwrap();
        let info = StreamInfo::new(stream_type, PixelFormat::Nv21, Dimension::new(16, 16), 4);
        ch.add_stream(StreamSetup::new(info, HeapMemory::zeroed(8))).unwrap();
        ch.into_shared()
    }

    #[test]
    fn test_picture_requests_reach_driver() {
        let sim = SimulatedCamera::new();
        let pic = PictureChannel::new(shared_channel(&sim, StreamType::Snapshot));
        let request = CaptureRequest {
            num_frames: 3,
            retro_frames: 0,
        };
        pic.take_picture(request).unwrap();
        pic.cancel_picture().unwrap();
        pic.start_advanced_capture(AdvancedCaptureType::Bracketing).unwrap();
        pic.stop_advanced_capture(AdvancedCaptureType::Bracketing).unwrap();
        pic.flush_superbuffer(42).unwrap();

        let handle = pic.channel().read().handle();
        assert_eq!(sim.capture_requests(), vec![(handle, request)]);
        assert_eq!(sim.cancelled_requests(), 1);
        assert_eq!(
            sim.advanced_captures(),
            vec![
                (AdvancedCaptureType::Bracketing, true),
                (AdvancedCaptureType::Bracketing, false)
            ]
        );
        assert_eq!(sim.flushed_frames(), vec![42]);
    }

    #[test]
    fn test_video_release_frame() {
        let sim = SimulatedCamera::new();
        let received = Arc::new(Mutex::new(Vec::new()));
        let sink = Arc::clone(&received);
        let mut ch = Channel::new(sim.clone(), sim.camera_handle());
        ch.init(None, Arc::new(move |frame: SuperFrame| sink.lock().push(frame)))
            .unwrap();
        let info = StreamInfo::new(StreamType::Video, PixelFormat::Nv12, Dimension::new(16, 16), 4);
        ch.add_stream(StreamSetup::new(info, HeapMemory::zeroed(8))).unwrap();
        ch.start().unwrap();
        let handle = ch.handle();
        let video = VideoChannel::new(ch.into_shared());

        sim.inject_frame(handle, 0).unwrap();
        assert!(sim.wait_idle(Duration::from_secs(2)));
        let frame = received.lock().pop().unwrap();
        let buf_idx = frame.bufs[0].buf_idx;

        video.release_frame(buf_idx as u64, false).unwrap();
        assert_eq!(sim.outstanding(), 0);
        assert!(video.release_frame(buf_idx as u64, false).is_err());
    }

    #[test]
    fn test_video_release_without_video_stream() {
        let sim = SimulatedCamera::new();
        let video = VideoChannel::new(shared_channel(&sim, StreamType::Preview));
        assert!(matches!(
            video.release_frame(0, false),
            Err(ChannelError::MissingStream(StreamType::Video))
        ));
    }
}
