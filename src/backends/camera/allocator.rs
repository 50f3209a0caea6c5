// SPDX-License-Identifier: GPL-3.0-only

//! Stream-side memory allocation

use super::types::*;
use std::sync::atomic::{AtomicUsize, Ordering};

/// Size of the per-stream info block shared with the driver
pub const STREAM_INFO_BUF_LEN: usize = 256;

/// Provides the memory a stream needs besides its frame buffers
pub trait StreamAllocator: Send + Sync {
    /// Info block describing the stream to the driver
    fn allocate_stream_info_buf(&self, info: &StreamInfo) -> BackendResult<HeapMemory>;

    /// Side-result buffer for streams whose features produce one
    /// (refocus depth maps, ubifocus masks); `None` when not needed
    fn allocate_misc_buf(&self, info: &StreamInfo) -> BackendResult<Option<HeapMemory>>;
}

/// Plain heap allocator
#[derive(Debug, Default)]
pub struct HeapAllocator {
    allocations: AtomicUsize,
}

impl HeapAllocator {
    pub fn new() -> Self {
        Self::default()
    }

    /// Number of blocks handed out so far
    pub fn allocations(&self) -> usize {
        self.allocations.load(Ordering::Relaxed)
    }
}

impl StreamAllocator for HeapAllocator {
    fn allocate_stream_info_buf(&self, _info: &StreamInfo) -> BackendResult<HeapMemory> {
        self.allocations.fetch_add(1, Ordering::Relaxed);
        Ok(HeapMemory::zeroed(STREAM_INFO_BUF_LEN))
    }

    fn allocate_misc_buf(&self, info: &StreamInfo) -> BackendResult<Option<HeapMemory>> {
        let mask = info.pp_config.feature_mask;
        if !mask.contains(FeatureMask::REFOCUS) && !mask.contains(FeatureMask::UBIFOCUS) {
            return Ok(None);
        }
        self.allocations.fetch_add(1, Ordering::Relaxed);
        Ok(Some(HeapMemory::zeroed(
            info.dim.width as usize * info.dim.height as usize,
        )))
    }
}
