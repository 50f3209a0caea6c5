// SPDX-License-Identifier: GPL-3.0-only

//! End-to-end tests for the post-processor on the simulated camera

use camera_postproc::backends::camera::{CaptureSettings, Dimension};
use camera_postproc::backends::jpeg::SoftwareJpeg;
use camera_postproc::pipelines::postproc::MsgType;
use camera_postproc::{PostProcConfig, PostProcError, PostProcessor, SimulatedHost};
use std::sync::Arc;
use std::thread;
use std::time::{Duration, Instant};

const TIMEOUT: Duration = Duration::from_secs(20);

struct Rig {
    host: Arc<SimulatedHost>,
    pp: PostProcessor,
    encoder: Arc<SoftwareJpeg>,
}

fn small_settings() -> CaptureSettings {
    let mut settings = CaptureSettings::default();
    settings.snapshot_size = Dimension::new(96, 64);
    settings.thumbnail_size = Dimension::new(32, 24);
    settings
}

fn rig(settings: CaptureSettings, config: PostProcConfig) -> Rig {
    let host = SimulatedHost::builder().settings(settings).build();
    let pp = PostProcessor::new(host.clone(), config);
    let encoder = Arc::new(SoftwareJpeg::new());
    pp.init(encoder.clone(), pp.jpeg_callback()).unwrap();
    let capture = host.capture_channel().expect("capture channel");
    pp.start(&capture).unwrap();
    host.attach(pp.downgrade());
    host.start_capture().unwrap();
    Rig { host, pp, encoder }
}

fn wait_until(timeout: Duration, mut cond: impl FnMut() -> bool) -> bool {
    let deadline = Instant::now() + timeout;
    while Instant::now() < deadline {
        if cond() {
            return true;
        }
        thread::sleep(Duration::from_millis(5));
    }
    cond()
}

fn is_jpeg(data: &[u8]) -> bool {
    data.len() > 4 && data[0] == 0xFF && data[1] == 0xD8
}

#[test]
fn test_capture_without_reprocess_delivers_jpeg() {
    let rig = rig(small_settings(), PostProcConfig::default());
    rig.host.capture(0).unwrap();

    let recorder = rig.host.recorder();
    assert!(recorder.wait_for(MsgType::CompressedImage, 1, TIMEOUT));
    let images = recorder.images_of(MsgType::CompressedImage);
    assert_eq!(images.len(), 1);
    assert_eq!(images[0].index, 0);
    assert!(is_jpeg(&images[0].data));

    let camera = rig.host.camera();
    assert_eq!(camera.outstanding(), 0);
    assert_eq!(camera.double_returns(), 0);
    assert!(rig.encoder.wait_idle(TIMEOUT));
    assert_eq!(rig.encoder.completed_jobs(), 1);
    assert!(camera.reprocess_requests().is_empty());
}

#[test]
fn test_every_buffer_returned_once_for_each_pass_count() {
    for passes in 0..=2u8 {
        let mut settings = small_settings();
        settings.reprocess_passes = passes;
        let rig = rig(settings, PostProcConfig::default());
        assert_eq!(rig.pp.num_reproc_channels(), passes as usize);

        for frame_idx in 0..3 {
            rig.host.capture(frame_idx).unwrap();
        }
        let recorder = rig.host.recorder();
        assert!(
            recorder.wait_for(MsgType::CompressedImage, 3, TIMEOUT),
            "passes={passes}"
        );

        let camera = rig.host.camera();
        assert_eq!(camera.reprocess_requests().len(), 3 * passes as usize);
        assert_eq!(camera.outstanding(), 0, "passes={passes}");
        assert_eq!(camera.double_returns(), 0, "passes={passes}");
        assert_eq!(recorder.error_count(), 0);

        rig.pp.stop().unwrap();
        assert_eq!(camera.reclaimed(), 0);
    }
}

#[test]
fn test_reprocess_backpressure_preserves_order() {
    let mut settings = small_settings();
    settings.reprocess_passes = 1;
    settings.reprocess_bufs = 1;
    let rig = rig(settings, PostProcConfig::default());

    for frame_idx in 0..4 {
        rig.host.capture(frame_idx).unwrap();
    }
    let recorder = rig.host.recorder();
    assert!(recorder.wait_for(MsgType::CompressedImage, 4, TIMEOUT));

    let order: Vec<u32> = recorder
        .images_of(MsgType::CompressedImage)
        .iter()
        .map(|image| image.index)
        .collect();
    assert_eq!(order, vec![0, 1, 2, 3]);
    assert_eq!(rig.host.camera().outstanding(), 0);
}

#[test]
fn test_batch_outputs_each_become_a_jpeg() {
    let mut settings = small_settings();
    settings.reprocess_passes = 1;
    settings.out_bufs_per_shot = 2;
    let rig = rig(settings, PostProcConfig::default());
    rig.host.camera().set_reprocess_ratio(1, 2);

    rig.host.capture(0).unwrap();
    let recorder = rig.host.recorder();
    assert!(recorder.wait_for(MsgType::CompressedImage, 2, TIMEOUT));

    let camera = rig.host.camera();
    assert_eq!(camera.reprocess_requests().len(), 1);
    assert_eq!(camera.outstanding(), 0);
    assert_eq!(camera.double_returns(), 0);
}

#[test]
fn test_encoder_failure_reports_error() {
    let rig = rig(small_settings(), PostProcConfig::default());
    rig.encoder.set_fail_jobs(true);

    rig.host.capture(0).unwrap();
    let recorder = rig.host.recorder();
    assert!(recorder.wait_for(MsgType::Error, 1, TIMEOUT));
    assert!(recorder.images_of(MsgType::CompressedImage).is_empty());
    assert_eq!(rig.host.camera().outstanding(), 0);
}

#[test]
fn test_memory_failure_reports_error() {
    let config = PostProcConfig {
        jpeg_mem_opt: false,
        ..Default::default()
    };
    let rig = rig(small_settings(), config);
    rig.host.set_fail_memory(true);

    rig.host.capture(0).unwrap();
    let recorder = rig.host.recorder();
    assert!(recorder.wait_for(MsgType::Error, 1, TIMEOUT));
    assert!(recorder.images_of(MsgType::CompressedImage).is_empty());
    assert_eq!(rig.host.camera().outstanding(), 0);
}

#[test]
fn test_rejected_jpeg_delivery_reports_error() {
    let rig = rig(small_settings(), PostProcConfig::default());
    let recorder = rig.host.recorder();
    recorder.set_reject(true);

    rig.host.capture(0).unwrap();
    assert!(recorder.wait_for(MsgType::Error, 1, TIMEOUT));
    assert!(recorder.images_of(MsgType::CompressedImage).is_empty());
    assert!(rig.encoder.wait_idle(TIMEOUT));
    assert_eq!(rig.encoder.completed_jobs(), 1);
    assert_eq!(rig.host.camera().outstanding(), 0);
    assert_eq!(rig.host.camera().double_returns(), 0);
}

#[test]
fn test_stop_aborts_inflight_jpeg() {
    let rig = rig(small_settings(), PostProcConfig::default());
    rig.encoder.pause();

    rig.host.capture(0).unwrap();
    rig.host.capture(1).unwrap();
    assert!(rig.host.wait_idle(TIMEOUT));
    assert!(wait_until(TIMEOUT, || rig.pp.queue_depths().ongoing_jpeg == 2));
    assert_eq!(rig.host.camera().outstanding(), 6);

    rig.pp.stop().unwrap();
    assert_eq!(rig.host.camera().outstanding(), 0);
    assert_eq!(rig.encoder.active_sessions(), 0);
    assert!(rig.pp.queue_depths().is_idle());

    rig.encoder.resume();
    assert!(rig.encoder.wait_idle(TIMEOUT));
    assert_eq!(rig.encoder.aborted_jobs(), 2);
    assert!(
        rig.host
            .recorder()
            .images_of(MsgType::CompressedImage)
            .is_empty()
    );
}

#[test]
fn test_frames_after_stop_are_returned() {
    let mut settings = small_settings();
    settings.reprocess_passes = 1;
    let rig = rig(settings, PostProcConfig::default());

    rig.pp.stop().unwrap();
    assert!(matches!(rig.pp.stop(), Err(PostProcError::NotInitialized)));

    rig.host.capture(7).unwrap();
    assert!(rig.host.wait_idle(TIMEOUT));
    let camera = rig.host.camera();
    assert_eq!(camera.outstanding(), 0);
    assert_eq!(camera.double_returns(), 0);
    assert!(camera.reprocess_requests().is_empty());
}

#[test]
fn test_restart_after_stop() {
    let rig = rig(small_settings(), PostProcConfig::default());
    rig.pp.stop().unwrap();

    let capture = rig.host.capture_channel().unwrap();
    rig.pp.start(&capture).unwrap();
    rig.host.capture(0).unwrap();
    assert!(
        rig.host
            .recorder()
            .wait_for(MsgType::CompressedImage, 1, TIMEOUT)
    );
    assert_eq!(rig.host.camera().outstanding(), 0);
}

#[test]
fn test_regular_capture_tears_down_capture_channel() {
    let mut settings = small_settings();
    settings.reprocess_passes = 1;
    settings.regular_capture = true;
    let rig = rig(settings, PostProcConfig::default());

    rig.host.capture(0).unwrap();
    assert!(
        rig.host
            .recorder()
            .wait_for(MsgType::CompressedImage, 1, TIMEOUT)
    );

    let camera = rig.host.camera();
    assert!(rig.host.capture_channel().is_none());
    // snapshot, preview and metadata buffers of the source frame
    assert_eq!(camera.reclaimed(), 3);
    assert_eq!(camera.outstanding(), 0);
    assert_eq!(camera.double_returns(), 0);
    assert!(!camera.active_mappings().is_empty());
    assert!(rig.host.capture(1).is_err());

    rig.pp.stop().unwrap();
    assert!(camera.active_mappings().is_empty());
    assert_eq!(camera.unmap_count(), 2);
}

#[test]
fn test_save_mode_writes_numbered_files() {
    let dir = tempfile::tempdir().unwrap();
    let config = PostProcConfig {
        longshot_save: true,
        store_location: dir.path().join("img_{}.jpg").to_string_lossy().into_owned(),
        ..Default::default()
    };
    let mut settings = small_settings();
    settings.longshot = true;
    let rig = rig(settings, config);

    rig.host.capture(0).unwrap();
    rig.host.capture(1).unwrap();
    let recorder = rig.host.recorder();
    assert!(recorder.wait_for(MsgType::CompressedImage, 2, TIMEOUT));

    for image in recorder.images_of(MsgType::CompressedImage) {
        let path = String::from_utf8(image.data).unwrap();
        let bytes = std::fs::read(&path).unwrap();
        assert!(is_jpeg(&bytes), "{path} is not a JPEG");
    }
    assert!(dir.path().join("img_0.jpg").exists());
    assert!(dir.path().join("img_1.jpg").exists());
    assert_eq!(rig.host.camera().outstanding(), 0);
}

#[test]
fn test_rejected_save_removes_file() {
    let dir = tempfile::tempdir().unwrap();
    let config = PostProcConfig {
        longshot_save: true,
        store_location: dir.path().join("img_{}.jpg").to_string_lossy().into_owned(),
        ..Default::default()
    };
    let mut settings = small_settings();
    settings.longshot = true;
    let rig = rig(settings, config);
    rig.host.recorder().set_reject(true);

    rig.host.capture(0).unwrap();
    assert!(rig.host.recorder().wait_for(MsgType::Error, 1, TIMEOUT));
    assert!(!dir.path().join("img_0.jpg").exists());
    assert_eq!(rig.host.camera().outstanding(), 0);
}

#[test]
fn test_raw_passthrough_copies_snapshot() {
    let mut settings = small_settings();
    settings.raw_picture = true;
    settings.yuv_frame_info = true;
    let rig = rig(settings, PostProcConfig::default());

    rig.host.capture(0).unwrap();
    let recorder = rig.host.recorder();
    assert!(recorder.wait_for(MsgType::CompressedImage, 1, TIMEOUT));

    let images = recorder.images_of(MsgType::CompressedImage);
    // NV21: full luma plane plus half-size interleaved chroma
    assert_eq!(images[0].data.len(), 96 * 64 * 3 / 2);
    assert!(!is_jpeg(&images[0].data));
    assert!(rig.host.settings().yuv_frame_info().is_some());
    assert_eq!(rig.host.shutter_count(), 1);
    assert_eq!(rig.encoder.completed_jobs(), 0);
    assert_eq!(rig.host.camera().outstanding(), 0);
}

#[test]
fn test_deinit_drops_reprocess_chain() {
    let mut settings = small_settings();
    settings.reprocess_passes = 2;
    let rig = rig(settings, PostProcConfig::default());

    assert_eq!(rig.pp.num_reproc_channels(), 2);
    let second = rig.pp.get_reproc_channel(1).unwrap();
    let first = rig.pp.get_reproc_channel(0).unwrap();
    assert!(Arc::ptr_eq(&second.source().unwrap(), first.channel()));
    drop((first, second));

    rig.pp.deinit();
    assert!(!rig.pp.is_initialized());
    assert_eq!(rig.pp.num_reproc_channels(), 0);
}
