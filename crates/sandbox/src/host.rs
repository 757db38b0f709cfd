//! The host machine a session runs on.
//!
//! A [`Host`] bundles the collaborators that outlive any single session:
//! the working filesystem root, the inter-session channel hub, the display
//! slots, and the renderer. Sessions borrow from it; what they allocate they
//! must hand back at teardown.

use std::collections::{HashMap, VecDeque};
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;

use parking_lot::Mutex;

use crate::render::{FrameHandle, MemoryRenderer, Renderer};
use crate::session::SessionId;

/// Number of display slots a host exposes.
pub const DISPLAY_SLOTS: usize = 8;

/// Most messages a channel queues before `send` starts refusing.
pub const CHANNEL_QUEUE_LIMIT: usize = 1_024;

// ============================================================================
// Channels
// ============================================================================

struct Route {
    owner: SessionId,
    queue: VecDeque<String>,
}

/// Named inter-session message routes.
///
/// A name is registered by exactly one session, which alone may poll it or
/// unregister it. Any session may send to a registered name.
#[derive(Default)]
pub struct ChannelHub {
    routes: Mutex<HashMap<String, Route>>,
}

impl ChannelHub {
    pub fn new() -> Self {
        Self::default()
    }

    /// Claim `name` for `owner`. Returns false if another session holds it.
    /// Re-registering one's own channel is a no-op that succeeds.
    pub fn register(&self, name: &str, owner: SessionId) -> bool {
        let mut routes = self.routes.lock();
        match routes.get(name) {
            Some(route) => route.owner == owner,
            None => {
                routes.insert(
                    name.to_string(),
                    Route {
                        owner,
                        queue: VecDeque::new(),
                    },
                );
                true
            }
        }
    }

    /// Release `name` if `owner` holds it. Pending messages are dropped.
    pub fn unregister(&self, name: &str, owner: SessionId) -> bool {
        let mut routes = self.routes.lock();
        match routes.get(name) {
            Some(route) if route.owner == owner => {
                routes.remove(name);
                true
            }
            _ => false,
        }
    }

    /// Queue a message. False if nobody listens or the queue is full.
    pub fn send(&self, name: &str, message: String) -> bool {
        let mut routes = self.routes.lock();
        match routes.get_mut(name) {
            Some(route) if route.queue.len() < CHANNEL_QUEUE_LIMIT => {
                route.queue.push_back(message);
                true
            }
            _ => false,
        }
    }

    /// Next message on `name`, only for its owner.
    pub fn poll(&self, name: &str, owner: SessionId) -> Option<String> {
        let mut routes = self.routes.lock();
        match routes.get_mut(name) {
            Some(route) if route.owner == owner => route.queue.pop_front(),
            _ => None,
        }
    }

    pub fn is_registered(&self, name: &str) -> bool {
        self.routes.lock().contains_key(name)
    }

    pub fn len(&self) -> usize {
        self.routes.lock().len()
    }

    pub fn is_empty(&self) -> bool {
        self.routes.lock().is_empty()
    }
}

// ============================================================================
// Display
// ============================================================================

/// Numbered component slots plus the slot currently shown.
pub struct Display {
    slots: Mutex<Vec<Option<FrameHandle>>>,
    current: AtomicUsize,
}

impl Default for Display {
    fn default() -> Self {
        Self {
            slots: Mutex::new(vec![None; DISPLAY_SLOTS]),
            current: AtomicUsize::new(0),
        }
    }
}

impl Display {
    pub fn new() -> Self {
        Self::default()
    }

    /// Put `component` in `slot` (None clears it). False if out of range.
    pub fn set_component(&self, slot: usize, component: Option<FrameHandle>) -> bool {
        let mut slots = self.slots.lock();
        match slots.get_mut(slot) {
            Some(entry) => {
                *entry = component;
                true
            }
            None => false,
        }
    }

    pub fn component(&self, slot: usize) -> Option<FrameHandle> {
        self.slots.lock().get(slot).copied().flatten()
    }

    pub fn occupied(&self) -> usize {
        self.slots.lock().iter().filter(|s| s.is_some()).count()
    }

    pub fn switch_view(&self, slot: usize) -> bool {
        if slot < DISPLAY_SLOTS {
            self.current.store(slot, Ordering::Relaxed);
            true
        } else {
            false
        }
    }

    pub fn current_view(&self) -> usize {
        self.current.load(Ordering::Relaxed)
    }
}

// ============================================================================
// Host
// ============================================================================

/// Machine-level state shared by every session on one host.
pub struct Host {
    root: PathBuf,
    channels: ChannelHub,
    display: Display,
    renderer: Arc<dyn Renderer>,
}

impl Host {
    /// `root` is the working filesystem; terminal directories resolve under it.
    pub fn new(root: impl Into<PathBuf>, renderer: Arc<dyn Renderer>) -> Self {
        Self {
            root: root.into(),
            channels: ChannelHub::new(),
            display: Display::new(),
            renderer,
        }
    }

    /// Host backed by a [`MemoryRenderer`].
    pub fn headless(root: impl Into<PathBuf>) -> Self {
        Self::new(root, Arc::new(MemoryRenderer::new()))
    }

    pub fn root(&self) -> &Path {
        &self.root
    }

    pub fn channels(&self) -> &ChannelHub {
        &self.channels
    }

    pub fn display(&self) -> &Display {
        &self.display
    }

    pub fn renderer(&self) -> &Arc<dyn Renderer> {
        &self.renderer
    }

    /// Map a terminal directory (`/home/user`) onto the host filesystem.
    pub fn resolve_dir(&self, dir: &str) -> PathBuf {
        let relative = dir.trim_start_matches('/');
        if relative.is_empty() {
            self.root.clone()
        } else {
            self.root.join(relative)
        }
    }

    /// Display refresh: paint whatever sits in the current view.
    pub fn refresh(&self, canvas: &mut dyn FnMut(u32, u32, u8)) -> bool {
        match self.display.component(self.display.current_view()) {
            Some(frame) => {
                self.renderer.paint(frame, canvas);
                true
            }
            None => false,
        }
    }
}
