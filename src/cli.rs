// SPDX-License-Identifier: GPL-3.0-only

//! CLI commands
//!
//! This module provides command-line functionality for:
//! - Running captures through the pipeline on the simulated camera
//! - Inspecting the post-processor configuration

use camera_postproc::backends::camera::{CaptureRequest, CaptureSettings};
use camera_postproc::backends::jpeg::SoftwareJpeg;
use camera_postproc::channels::PictureChannel;
use camera_postproc::pipelines::postproc::MsgType;
use camera_postproc::{PostProcConfig, PostProcessor, SimulatedHost};
use chrono::Local;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::{Duration, Instant};

/// How long to wait for each capture to come out of the pipeline
const FRAME_TIMEOUT: Duration = Duration::from_secs(10);

pub struct SimulateArgs {
    pub passes: u8,
    pub frames: u32,
    pub settings: Option<PathBuf>,
    pub config: Option<PathBuf>,
    pub output: Option<PathBuf>,
}

/// Capture `frames` frames and write every JPEG the pipeline delivers
pub fn simulate(args: SimulateArgs) -> Result<(), Box<dyn std::error::Error>> {
    let mut settings = match &args.settings {
        Some(path) => load_settings(path)?,
        None => CaptureSettings::default(),
    };
    if args.passes > 0 {
        settings.reprocess_passes = args.passes;
    }
    let config = match &args.config {
        Some(path) => PostProcConfig::load(path)?,
        None => PostProcConfig::default(),
    };

    let output_dir = args.output.unwrap_or_else(default_output_dir);
    std::fs::create_dir_all(&output_dir)?;

    println!(
        "Simulating {} capture(s), {} reprocess pass(es), {}x{}",
        args.frames,
        settings.reprocess_passes,
        settings.snapshot_size.width,
        settings.snapshot_size.height
    );

    let host = SimulatedHost::builder().settings(settings).build();
    let capture = host
        .capture_channel()
        .ok_or("Capture channel could not be created")?;

    let pp = PostProcessor::new(host.clone(), config.clone());
    let encoder = Arc::new(SoftwareJpeg::new());
    pp.init(encoder.clone(), pp.jpeg_callback())?;
    pp.start(&capture)?;
    host.attach(pp.downgrade());
    host.start_capture()?;

    let picture = PictureChannel::new(capture);
    picture.take_picture(CaptureRequest {
        num_frames: args.frames,
        retro_frames: 0,
    })?;

    let start = Instant::now();
    for frame_idx in 0..args.frames {
        host.capture(frame_idx)?;
    }

    let recorder = host.recorder();
    let expected = args.frames as usize;
    let timeout = FRAME_TIMEOUT * args.frames.max(1);
    if !recorder.wait_for(MsgType::CompressedImage, expected, timeout) {
        eprintln!(
            "Timed out: {} of {} image(s) delivered",
            recorder.images_of(MsgType::CompressedImage).len(),
            expected
        );
    }
    let elapsed = start.elapsed();

    pp.stop()?;
    pp.deinit();

    let images = recorder.images_of(MsgType::CompressedImage);
    for image in &images {
        if config.longshot_save {
            // Save mode delivers the path of the file it wrote
            println!("  Saved: {}", String::from_utf8_lossy(&image.data));
            continue;
        }
        let path = output_dir.join(format!("frame_{:04}.jpg", image.index));
        std::fs::write(&path, &image.data)?;
        println!("  Wrote: {} ({} bytes)", path.display(), image.data.len());
    }

    println!();
    println!(
        "Delivered {} image(s) in {:.2}s, {} error(s), {} buffer(s) still out",
        images.len(),
        elapsed.as_secs_f64(),
        recorder.error_count(),
        host.camera().outstanding()
    );

    Ok(())
}

/// Print the effective configuration as JSON
pub fn print_config(path: Option<PathBuf>) -> Result<(), Box<dyn std::error::Error>> {
    let config = match &path {
        Some(path) => PostProcConfig::load(path)?,
        None => PostProcConfig::default(),
    };
    println!("{}", serde_json::to_string_pretty(&config)?);
    Ok(())
}

fn load_settings(path: &Path) -> Result<CaptureSettings, Box<dyn std::error::Error>> {
    let text = std::fs::read_to_string(path)?;
    Ok(serde_json::from_str(&text)?)
}

/// Get default output directory for simulated captures
fn default_output_dir() -> PathBuf {
    let timestamp = Local::now().format("%Y%m%d_%H%M%S");
    dirs::picture_dir()
        .unwrap_or_else(|| PathBuf::from("."))
        .join("camera-postproc")
        .join(timestamp.to_string())
}
