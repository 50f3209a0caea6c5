// SPDX-License-Identifier: GPL-3.0-only

//! Processing pipelines fed by capture channels
//!
//! ```text
//! ┌──────────────┐     ┌────────────────────┐     ┌────────────────┐
//! │ Capture      │ ──▶ │  Post-processor    │ ──▶ │  Notifier      │
//! │ channel      │     │  - reprocess chain │     │  (JPEG / raw / │
//! │ (SuperFrame) │     │  - JPEG encode     │     │   saved file)  │
//! └──────────────┘     └────────────────────┘     └────────────────┘
//! ```
//!
//! - [`postproc`]: reprocess, JPEG and raw delivery worker pipeline

pub mod postproc;
