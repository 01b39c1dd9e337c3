// Copyright 2024 Open Nexus OS Contributors
// SPDX-License-Identifier: Apache-2.0

//! Physical frame table with per-frame reference counts.

pub mod page_table;

use exo_abi::{PhysAddr, PGSIZE};

/// Size of a frame in bytes.
pub const FRAME_BYTES: usize = PGSIZE as usize;

type FrameData = Box<[u8; FRAME_BYTES]>;

struct Frame {
    refs: u32,
    data: Option<FrameData>,
}

/// Bounded pool of physical frames.
///
/// Frame 0 is reserved so a zero frame address never names real memory.
pub struct FrameTable {
    frames: Vec<Frame>,
    free: Vec<usize>,
}

impl FrameTable {
    /// Creates a table of `count` frames (including the reserved frame 0).
    pub fn new(count: usize) -> Self {
        let count = count.max(1);
        let mut frames = Vec::with_capacity(count);
        frames.push(Frame { refs: 1, data: None });
        frames.extend((1..count).map(|_| Frame { refs: 0, data: None }));
        // Pop from the back so low frames are handed out first.
        let free = (1..count).rev().collect();
        Self { frames, free }
    }

    /// Hands out a zero-filled frame with a reference count of zero.
    pub fn alloc(&mut self) -> Option<PhysAddr> {
        let index = self.free.pop()?;
        let frame = &mut self.frames[index];
        frame.refs = 0;
        frame.data = Some(Box::new([0u8; FRAME_BYTES]));
        Some(PhysAddr::from_frame(index))
    }

    /// Returns a frame that never gained a reference.
    pub fn free_unreferenced(&mut self, pa: PhysAddr) {
        if let Some(frame) = self.frames.get_mut(pa.frame()) {
            if frame.refs == 0 && frame.data.is_some() {
                frame.data = None;
                self.free.push(pa.frame());
            }
        }
    }

    /// Adds one reference to `pa`.
    pub fn incref(&mut self, pa: PhysAddr) {
        if let Some(frame) = self.frames.get_mut(pa.frame()) {
            frame.refs += 1;
        }
    }

    /// Drops one reference; the frame is recycled when none remain.
    pub fn decref(&mut self, pa: PhysAddr) {
        let index = pa.frame();
        if index == 0 {
            return;
        }
        if let Some(frame) = self.frames.get_mut(index) {
            debug_assert!(frame.refs > 0, "decref of unreferenced frame {pa}");
            frame.refs = frame.refs.saturating_sub(1);
            if frame.refs == 0 {
                frame.data = None;
                self.free.push(index);
            }
        }
    }

    /// Number of mappings referencing `pa`.
    pub fn refcount(&self, pa: PhysAddr) -> u32 {
        self.frames.get(pa.frame()).map_or(0, |frame| frame.refs)
    }

    /// Contents of `pa`, if allocated.
    pub fn bytes(&self, pa: PhysAddr) -> Option<&[u8; FRAME_BYTES]> {
        self.frames.get(pa.frame())?.data.as_deref()
    }

    /// Mutable contents of `pa`, if allocated.
    pub fn bytes_mut(&mut self, pa: PhysAddr) -> Option<&mut [u8; FRAME_BYTES]> {
        self.frames.get_mut(pa.frame())?.data.as_deref_mut()
    }

    /// Frames available for allocation.
    pub fn free_count(&self) -> usize {
        self.free.len()
    }

    /// Total frames, the reserved one included.
    pub fn capacity(&self) -> usize {
        self.frames.len()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn frame_zero_is_never_handed_out() {
        let mut frames = FrameTable::new(3);
        let a = frames.alloc().expect("first");
        let b = frames.alloc().expect("second");
        assert_ne!(a.frame(), 0);
        assert_ne!(b.frame(), 0);
        assert!(frames.alloc().is_none());
    }

    #[test]
    fn last_decref_recycles_zeroed() {
        let mut frames = FrameTable::new(2);
        let pa = frames.alloc().expect("alloc");
        frames.incref(pa);
        frames.incref(pa);
        frames.bytes_mut(pa).expect("live")[7] = 0xAA;
        frames.decref(pa);
        assert_eq!(frames.refcount(pa), 1);
        assert_eq!(frames.free_count(), 0);
        frames.decref(pa);
        assert_eq!(frames.free_count(), 1);
        let again = frames.alloc().expect("realloc");
        assert_eq!(again, pa);
        assert_eq!(frames.bytes(again).expect("live")[7], 0);
    }
}
