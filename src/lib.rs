// SPDX-License-Identifier: GPL-3.0-only

//! Camera post-processing pipeline
//!
//! This library takes bundled frames from a camera capture channel, runs them
//! through an optional chain of hardware reprocess passes and encodes the
//! result to JPEG, handing finished images back to the application layer.
//!
//! # Architecture
//!
//! The crate is organized into several modules:
//!
//! - [`backends`]: Camera driver and JPEG encoder abstraction
//! - [`channels`]: Stream bundling, capture and reprocess channels
//! - [`pipelines`]: The post-processor and its job queues
//! - [`config`]: Runtime switches of the post-processor
//! - [`session`]: Simulated host wiring everything together
//!
//! # Example
//!
//! ```ignore
//! let host = SimulatedHost::builder().build();
//! let pp = PostProcessor::new(host.clone(), PostProcConfig::default());
//! pp.init(Arc::new(SoftwareJpeg::new()), pp.jpeg_callback())?;
//! ```

pub mod backends;
pub mod channels;
pub mod config;
pub mod constants;
pub mod errors;
pub mod pipelines;
pub mod session;

// Re-export commonly used types
pub use backends::camera::{CaptureSettings, SimulatedCamera};
pub use backends::jpeg::SoftwareJpeg;
pub use channels::{Channel, PictureChannel, ReprocessChannel, VideoChannel};
pub use config::PostProcConfig;
pub use errors::{ChannelError, PostProcError, PostProcResult};
pub use pipelines::postproc::{MsgType, PostProcessor};
pub use session::SimulatedHost;
