// SPDX-License-Identifier: GPL-3.0-only

//! Hardware-facing collaborators of the post-processor
//!
//! ```text
//! ┌─────────────────────────────────────────────┐
//! │             Post-processing layer            │
//! └────────────────────┬────────────────────────┘
//!                      │
//! ┌────────────────────┴────────────────────────┐
//! │              Backend Layer                   │
//! │  ┌─────────────────┐  ┌──────────────────┐  │
//! │  │  Camera driver  │  │   JPEG encoder   │  │
//! │  │   (CameraOps)   │  │    (JpegOps)     │  │
//! │  └─────────────────┘  └──────────────────┘  │
//! └─────────────────────────────────────────────┘
//! ```
//!
//! - [`camera`]: driver operations, streams, parameter store, simulated driver
//! - [`jpeg`]: encoder operations, EXIF table, software encoder

pub mod camera;
pub mod jpeg;
