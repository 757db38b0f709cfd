//! Per-session resources and their guaranteed release.
//!
//! Everything a script allocates on the host during a run is recorded in
//! [`SessionResources`]: frames, channel registrations, display slots, and
//! (through the [`FunctionPool`]) whatever its bindings opened. A
//! [`ResourceGuard`] owns them for the length of the run and releases them
//! when it goes out of scope, however the run ended.

use std::cell::{RefCell, RefMut};
use std::collections::BTreeMap;
use std::rc::Rc;
use std::sync::Arc;

use crate::host::Host;
use crate::pool::FunctionPool;
use crate::render::FrameHandle;
use crate::session::SessionId;
use crate::terminal::Terminal;

/// Most frames one session may hold at once.
pub const MAX_FRAMES: usize = 256;

/// Largest frame a script may allocate, in pixels.
pub const MAX_FRAME_PIXELS: u64 = 4096 * 4096;

/// Frames allocated by a script, keyed by small dense ids.
#[derive(Debug, Default)]
pub struct FramePool {
    frames: BTreeMap<u32, FrameHandle>,
}

impl FramePool {
    /// Lowest id not currently in use.
    pub fn next_id(&self) -> u32 {
        let mut id = 0;
        while self.frames.contains_key(&id) {
            id += 1;
        }
        id
    }

    pub fn insert(&mut self, handle: FrameHandle) -> u32 {
        let id = self.next_id();
        self.frames.insert(id, handle);
        id
    }

    pub fn get(&self, id: u32) -> Option<FrameHandle> {
        self.frames.get(&id).copied()
    }

    pub fn remove(&mut self, id: u32) -> Option<FrameHandle> {
        self.frames.remove(&id)
    }

    pub fn len(&self) -> usize {
        self.frames.len()
    }

    pub fn is_empty(&self) -> bool {
        self.frames.is_empty()
    }

    fn drain(&mut self) -> Vec<FrameHandle> {
        std::mem::take(&mut self.frames).into_values().collect()
    }
}

/// Counts of what a teardown released.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct ReleaseSummary {
    pub frames: usize,
    pub channels: usize,
    pub slots: usize,
}

/// Host allocations owned by one session.
pub struct SessionResources {
    id: SessionId,
    host: Arc<Host>,
    terminal: Option<Terminal>,
    frames: FramePool,
    channels: Vec<String>,
    slots: Vec<usize>,
    released: bool,
}

pub type SharedResources = Rc<RefCell<SessionResources>>;

impl SessionResources {
    pub fn new(id: SessionId, host: Arc<Host>, terminal: Option<Terminal>) -> Self {
        Self {
            id,
            host,
            terminal,
            frames: FramePool::default(),
            channels: Vec::new(),
            slots: Vec::new(),
            released: false,
        }
    }

    pub fn session_id(&self) -> SessionId {
        self.id
    }

    pub fn host(&self) -> &Arc<Host> {
        &self.host
    }

    pub fn terminal(&self) -> Option<&Terminal> {
        self.terminal.as_ref()
    }

    /// The terminal, if this session holds its busy slot. Only the holder
    /// may install or clear terminal hooks.
    pub fn held_terminal(&self) -> Option<&Terminal> {
        self.terminal.as_ref().filter(|t| t.is_held_by(self.id))
    }

    pub fn frames(&self) -> &FramePool {
        &self.frames
    }

    pub fn channels(&self) -> &[String] {
        &self.channels
    }

    pub fn slots(&self) -> &[usize] {
        &self.slots
    }

    pub fn is_released(&self) -> bool {
        self.released
    }

    // ========================================================================
    // Frames
    // ========================================================================

    pub fn create_frame(&mut self, width: u32, height: u32) -> Result<u32, String> {
        if self.frames.len() >= MAX_FRAMES {
            return Err(format!("frame limit reached ({} frames)", MAX_FRAMES));
        }
        if u64::from(width) * u64::from(height) > MAX_FRAME_PIXELS {
            return Err(format!(
                "frame {}x{} exceeds {} pixels",
                width, height, MAX_FRAME_PIXELS
            ));
        }
        let handle = self.host.renderer().create_frame(width, height);
        Ok(self.frames.insert(handle))
    }

    pub fn frame(&self, id: u32) -> Option<FrameHandle> {
        self.frames.get(id)
    }

    /// Release one frame early. Any slot showing it is cleared as well.
    pub fn release_frame(&mut self, id: u32) -> bool {
        let Some(handle) = self.frames.remove(id) else {
            return false;
        };
        let display = self.host.display();
        for &slot in &self.slots {
            if display.component(slot) == Some(handle) {
                display.set_component(slot, None);
            }
        }
        self.host.renderer().release_frame(handle);
        true
    }

    // ========================================================================
    // Channels
    // ========================================================================

    pub fn register_channel(&mut self, name: &str) -> bool {
        if !self.host.channels().register(name, self.id) {
            return false;
        }
        if !self.channels.iter().any(|c| c == name) {
            self.channels.push(name.to_string());
        }
        true
    }

    pub fn unregister_channel(&mut self, name: &str) -> bool {
        let Some(pos) = self.channels.iter().position(|c| c == name) else {
            return false;
        };
        self.channels.remove(pos);
        self.host.channels().unregister(name, self.id)
    }

    // ========================================================================
    // Display slots
    // ========================================================================

    pub fn attach_slot(&mut self, slot: usize, frame_id: u32) -> Result<(), String> {
        let handle = self
            .frames
            .get(frame_id)
            .ok_or_else(|| format!("no frame with id {}", frame_id))?;
        if !self.host.display().set_component(slot, Some(handle)) {
            return Err(format!("no display slot {}", slot));
        }
        if !self.slots.contains(&slot) {
            self.slots.push(slot);
        }
        Ok(())
    }

    pub fn detach_slot(&mut self, slot: usize) -> bool {
        let Some(pos) = self.slots.iter().position(|s| *s == slot) else {
            return false;
        };
        self.slots.remove(pos);
        self.host.display().set_component(slot, None)
    }

    // ========================================================================
    // Teardown
    // ========================================================================

    /// Hand everything back to the host. Only the first call does work and
    /// returns a summary; later calls return `None`.
    pub fn release(&mut self) -> Option<ReleaseSummary> {
        if self.released {
            return None;
        }
        self.released = true;

        let frames = self.frames.drain();
        for handle in &frames {
            self.host.renderer().release_frame(*handle);
        }

        let channels = std::mem::take(&mut self.channels);
        for name in &channels {
            self.host.channels().unregister(name, self.id);
        }

        if let Some(terminal) = self.held_terminal() {
            terminal.clear_hooks();
        }

        let slots = std::mem::take(&mut self.slots);
        for slot in &slots {
            self.host.display().set_component(*slot, None);
        }

        Some(ReleaseSummary {
            frames: frames.len(),
            channels: channels.len(),
            slots: slots.len(),
        })
    }
}

/// Scoped owner of a session's resources and function pool.
///
/// Dropping the guard runs the pool cleanup and releases the resources, so
/// every exit path (normal, interrupted, failed, or an early `?`) tears down
/// exactly once.
pub struct ResourceGuard {
    resources: SharedResources,
    pool: FunctionPool,
    summary: Option<ReleaseSummary>,
}

impl ResourceGuard {
    pub fn new(resources: SessionResources) -> Self {
        Self {
            resources: Rc::new(RefCell::new(resources)),
            pool: FunctionPool::new(),
            summary: None,
        }
    }

    /// Shared handle for bindings that allocate on the session's behalf.
    pub fn shared(&self) -> SharedResources {
        self.resources.clone()
    }

    pub fn pool(&self) -> &FunctionPool {
        &self.pool
    }

    pub fn pool_mut(&mut self) -> &mut FunctionPool {
        &mut self.pool
    }

    pub fn resources(&self) -> RefMut<'_, SessionResources> {
        self.resources.borrow_mut()
    }

    /// Tear down now. Idempotent; the summary of the first call is kept.
    pub fn release(&mut self) -> ReleaseSummary {
        self.pool.cleanup();
        if let Some(summary) = self.resources.borrow_mut().release() {
            log::debug!(
                "session {} released {} frames, {} channels, {} slots",
                self.resources.borrow().session_id(),
                summary.frames,
                summary.channels,
                summary.slots
            );
            self.summary = Some(summary);
        }
        self.summary.unwrap_or_default()
    }
}

impl Drop for ResourceGuard {
    fn drop(&mut self) {
        self.release();
    }
}
