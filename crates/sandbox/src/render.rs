//! Rendering collaborator interface.
//!
//! The sandbox only needs to create and release opaque frames and let the
//! host paint them on refresh. Layout, fonts and wrapping are the
//! renderer's business.

use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};

use parking_lot::Mutex;

/// Opaque handle to a frame owned by a [`Renderer`].
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct FrameHandle(pub u64);

/// Host-side frame store. Implementations must tolerate releasing an
/// unknown or already released handle.
pub trait Renderer: Send + Sync {
    fn create_frame(&self, width: u32, height: u32) -> FrameHandle;

    fn release_frame(&self, handle: FrameHandle);

    /// Set one pixel. Out-of-bounds writes are ignored.
    fn set_pixel(&self, handle: FrameHandle, x: u32, y: u32, color: u8);

    fn pixel(&self, handle: FrameHandle, x: u32, y: u32) -> Option<u8>;

    /// Called by the host's display refresh. Visits every pixel of the frame.
    fn paint(&self, handle: FrameHandle, canvas: &mut dyn FnMut(u32, u32, u8));
}

struct MemoryFrame {
    width: u32,
    height: u32,
    pixels: Vec<u8>,
}

impl MemoryFrame {
    fn index(&self, x: u32, y: u32) -> Option<usize> {
        if x < self.width && y < self.height {
            Some(y as usize * self.width as usize + x as usize)
        } else {
            None
        }
    }
}

/// In-memory renderer for headless hosts and tests.
#[derive(Default)]
pub struct MemoryRenderer {
    next_id: AtomicU64,
    frames: Mutex<HashMap<FrameHandle, MemoryFrame>>,
}

impl MemoryRenderer {
    pub fn new() -> Self {
        Self::default()
    }

    /// Number of frames created and not yet released.
    pub fn live_frames(&self) -> usize {
        self.frames.lock().len()
    }
}

impl Renderer for MemoryRenderer {
    fn create_frame(&self, width: u32, height: u32) -> FrameHandle {
        let handle = FrameHandle(self.next_id.fetch_add(1, Ordering::Relaxed));
        let frame = MemoryFrame {
            width,
            height,
            pixels: vec![0; (width as usize) * (height as usize)],
        };
        self.frames.lock().insert(handle, frame);
        handle
    }

    fn release_frame(&self, handle: FrameHandle) {
        self.frames.lock().remove(&handle);
    }

    fn set_pixel(&self, handle: FrameHandle, x: u32, y: u32, color: u8) {
        let mut frames = self.frames.lock();
        if let Some(frame) = frames.get_mut(&handle) {
            if let Some(i) = frame.index(x, y) {
                frame.pixels[i] = color;
            }
        }
    }

    fn pixel(&self, handle: FrameHandle, x: u32, y: u32) -> Option<u8> {
        let frames = self.frames.lock();
        let frame = frames.get(&handle)?;
        frame.index(x, y).map(|i| frame.pixels[i])
    }

    fn paint(&self, handle: FrameHandle, canvas: &mut dyn FnMut(u32, u32, u8)) {
        let frames = self.frames.lock();
        if let Some(frame) = frames.get(&handle) {
            let width = frame.width as usize;
            for (i, &color) in frame.pixels.iter().enumerate() {
                canvas((i % width) as u32, (i / width) as u32, color);
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_create_set_paint_release() {
        let r = MemoryRenderer::new();
        let h = r.create_frame(2, 2);
        r.set_pixel(h, 1, 1, 7);
        r.set_pixel(h, 5, 5, 9); // ignored
        assert_eq!(r.pixel(h, 1, 1), Some(7));
        assert_eq!(r.pixel(h, 5, 5), None);

        let mut painted = Vec::new();
        r.paint(h, &mut |x, y, c| painted.push((x, y, c)));
        assert_eq!(painted.len(), 4);
        assert!(painted.contains(&(1, 1, 7)));

        assert_eq!(r.live_frames(), 1);
        r.release_frame(h);
        r.release_frame(h);
        assert_eq!(r.live_frames(), 0);
    }

    #[test]
    fn test_wide_frame_indexes_past_u32() {
        let r = MemoryRenderer::new();
        let h = r.create_frame(70_000, 2);
        r.set_pixel(h, 69_999, 1, 3);
        assert_eq!(r.pixel(h, 69_999, 1), Some(3));
        assert_eq!(r.pixel(h, 69_999, 0), Some(0));

        let frame = MemoryFrame {
            width: 70_000,
            height: 70_000,
            pixels: Vec::new(),
        };
        // 69_999 * 70_000 does not fit in a u32
        assert_eq!(frame.index(5, 69_999), Some(69_999 * 70_000 + 5));
        assert_eq!(frame.index(70_000, 0), None);
    }

    #[test]
    fn test_paint_visits_rows_in_order() {
        let r = MemoryRenderer::new();
        let h = r.create_frame(3, 2);
        r.set_pixel(h, 2, 1, 5);
        let mut painted = Vec::new();
        r.paint(h, &mut |x, y, c| painted.push((x, y, c)));
        assert_eq!(painted.len(), 6);
        assert_eq!(painted[5], (2, 1, 5));
        assert_eq!(painted[3], (0, 1, 0));
    }
}
