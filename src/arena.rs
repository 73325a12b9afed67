//! Bump allocator for per-tile build scratch memory.
//!
//! Tile builds churn through short-lived buffers (triangle areas, staged
//! layer payloads). Rather than allocating fresh vectors per tile, the
//! builder carves byte ranges out of one reusable buffer and resets it
//! between tiles, tracking the peak usage across the whole build.

use std::ops::Range;

/// Linear allocator over a single owned buffer.
///
/// `alloc` hands out byte ranges; `reset` reclaims everything at once and
/// folds the current top into the high-water mark. Exhaustion is reported
/// as `None` so callers can skip work instead of failing the build.
pub struct BuildArena {
    buf: Vec<u8>,
    top: usize,
    high: usize,
}

impl BuildArena {
    /// Creates an arena with a fixed capacity in bytes.
    pub fn with_capacity(capacity: usize) -> Self {
        Self {
            buf: vec![0; capacity],
            top: 0,
            high: 0,
        }
    }

    /// Total capacity in bytes.
    pub fn capacity(&self) -> usize {
        self.buf.len()
    }

    /// Bytes currently allocated.
    pub fn top(&self) -> usize {
        self.top
    }

    /// Reserves `len` bytes, zeroed. Returns `None` when the arena is full.
    pub fn alloc(&mut self, len: usize) -> Option<Range<usize>> {
        if self.top + len > self.buf.len() {
            return None;
        }
        let range = self.top..self.top + len;
        self.buf[range.clone()].fill(0);
        self.top += len;
        Some(range)
    }

    /// Borrows an allocated range immutably.
    pub fn slice(&self, range: Range<usize>) -> &[u8] {
        &self.buf[range]
    }

    /// Borrows an allocated range mutably.
    pub fn slice_mut(&mut self, range: Range<usize>) -> &mut [u8] {
        &mut self.buf[range]
    }

    /// Releases all allocations and records the peak usage.
    pub fn reset(&mut self) {
        self.high = self.high.max(self.top);
        self.top = 0;
    }

    /// Peak bytes allocated across all resets.
    pub fn high_water(&self) -> usize {
        self.high.max(self.top)
    }
}
