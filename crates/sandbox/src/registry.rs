//! Capability registry.
//!
//! Capability bundles are named sets of host-callable functions contributed
//! by the host and its plugins, usually at start-up. A bundle marked
//! `restricted` is withheld from sessions running in [`Mode::Restricted`].
//!
//! The registry is append-only: bundles are immutable once published, names
//! are unique, and resolution preserves registration order so every run sees
//! the same bindings in the same order.

use std::fmt;
use std::sync::Arc;

use mlua::{FromLuaMulti, IntoLuaMulti, Lua, MultiValue};
use parking_lot::RwLock;

use crate::error::SandboxError;

/// Execution mode of a session.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum Mode {
    /// Untrusted code: restricted bundles and privileged libraries withheld.
    #[default]
    Restricted,
    /// Host-initiated code: everything installed.
    Privileged,
}

impl fmt::Display for Mode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Mode::Restricted => write!(f, "restricted"),
            Mode::Privileged => write!(f, "privileged"),
        }
    }
}

type HostCall = dyn Fn(&Lua, MultiValue) -> mlua::Result<MultiValue> + Send + Sync;

/// A host-callable function that is not tied to any particular VM.
///
/// Each session turns it into a `mlua::Function` on its own VM.
#[derive(Clone)]
pub struct HostFunction {
    name: String,
    call: Arc<HostCall>,
}

impl HostFunction {
    /// Wrap a typed Rust closure. Arguments and results convert through
    /// mlua's `FromLuaMulti` / `IntoLuaMulti`.
    pub fn new<A, R, F>(name: impl Into<String>, func: F) -> Self
    where
        A: FromLuaMulti,
        R: IntoLuaMulti,
        F: Fn(&Lua, A) -> mlua::Result<R> + Send + Sync + 'static,
    {
        let call = move |lua: &Lua, args: MultiValue| -> mlua::Result<MultiValue> {
            let args = A::from_lua_multi(args, lua)?;
            func(lua, args)?.into_lua_multi(lua)
        };
        Self {
            name: name.into(),
            call: Arc::new(call),
        }
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub(crate) fn invoke(&self, lua: &Lua, args: MultiValue) -> mlua::Result<MultiValue> {
        (self.call)(lua, args)
    }
}

impl fmt::Debug for HostFunction {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("HostFunction").field("name", &self.name).finish()
    }
}

/// A named library of host functions.
#[derive(Debug, Clone)]
pub struct CapabilityBundle {
    name: String,
    restricted: bool,
    functions: Vec<HostFunction>,
}

impl CapabilityBundle {
    /// `restricted == true` keeps the bundle out of restricted sessions.
    pub fn new(name: impl Into<String>, restricted: bool) -> Self {
        Self {
            name: name.into(),
            restricted,
            functions: Vec::new(),
        }
    }

    pub fn with_function(mut self, function: HostFunction) -> Self {
        self.functions.push(function);
        self
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn is_restricted(&self) -> bool {
        self.restricted
    }

    pub fn functions(&self) -> &[HostFunction] {
        &self.functions
    }

    /// Whether a session in `mode` may see this bundle.
    pub fn allowed_in(&self, mode: Mode) -> bool {
        mode == Mode::Privileged || !self.restricted
    }
}

/// Process-wide, append-only set of capability bundles.
///
/// Shared between sessions behind an `Arc`; many readers, one writer at a time.
#[derive(Debug, Default)]
pub struct CapabilityRegistry {
    bundles: RwLock<Vec<Arc<CapabilityBundle>>>,
}

impl CapabilityRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Publish a bundle. Re-using a name is a contract violation: the first
    /// registration is kept and `DuplicateBundle` is returned.
    pub fn register(&self, bundle: CapabilityBundle) -> Result<(), SandboxError> {
        let mut bundles = self.bundles.write();
        if bundles.iter().any(|b| b.name == bundle.name) {
            return Err(SandboxError::DuplicateBundle(bundle.name));
        }
        log::debug!(
            "registered capability bundle '{}' ({} functions, restricted: {})",
            bundle.name,
            bundle.functions.len(),
            bundle.restricted
        );
        bundles.push(Arc::new(bundle));
        Ok(())
    }

    /// Bundles visible in `mode`, in registration order.
    pub fn resolve(&self, mode: Mode) -> Vec<Arc<CapabilityBundle>> {
        self.bundles
            .read()
            .iter()
            .filter(|b| b.allowed_in(mode))
            .cloned()
            .collect()
    }

    pub fn get(&self, name: &str) -> Option<Arc<CapabilityBundle>> {
        self.bundles.read().iter().find(|b| b.name == name).cloned()
    }

    pub fn names(&self) -> Vec<String> {
        self.bundles.read().iter().map(|b| b.name.clone()).collect()
    }

    pub fn len(&self) -> usize {
        self.bundles.read().len()
    }

    pub fn is_empty(&self) -> bool {
        self.bundles.read().is_empty()
    }
}
