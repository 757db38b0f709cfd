//! Function pool: every host-callable function one session can see.
//!
//! The pool is seeded from the capability bundles resolved for the session's
//! mode, then extended by [`SessionBinder`]s with functions bound to this
//! session's state. Names are unique across all sources.

use std::cell::RefCell;
use std::rc::Rc;
use std::sync::Arc;
use std::time::Duration;

use mlua::{FromLuaMulti, Function, IntoLuaMulti, Lua, MultiValue};

use crate::error::{InvocationError, SandboxError};
use crate::interrupt::{is_interrupt, Interrupt};
use crate::registry::{CapabilityBundle, HostFunction, Mode};
use crate::resources::SharedResources;
use crate::session::SessionId;

/// Tag a host-function failure with the function's name. Interrupts pass
/// through untouched so they stay recognisable.
pub(crate) fn wrap_failure(function: &str, err: mlua::Error) -> mlua::Error {
    if is_interrupt(&err) {
        err
    } else {
        InvocationError::new(function, err).into_lua()
    }
}

pub struct FunctionPool {
    functions: Vec<(String, Function)>,
    cleanups: Vec<Box<dyn FnOnce()>>,
    cleaned: bool,
}

impl Default for FunctionPool {
    fn default() -> Self {
        Self::new()
    }
}

impl FunctionPool {
    pub fn new() -> Self {
        Self {
            functions: Vec::new(),
            cleanups: Vec::new(),
            cleaned: false,
        }
    }

    /// Install the functions of `bundles`, in order, on `lua`.
    pub fn seed(&mut self, lua: &Lua, bundles: &[Arc<CapabilityBundle>]) -> Result<(), SandboxError> {
        for bundle in bundles {
            for function in bundle.functions() {
                self.install(lua, function.clone())?;
            }
        }
        Ok(())
    }

    /// Turn a VM-independent [`HostFunction`] into a function on `lua`.
    pub fn install(&mut self, lua: &Lua, function: HostFunction) -> Result<(), SandboxError> {
        let name = function.name().to_string();
        self.ensure_free(&name)?;
        let f = lua.create_function(move |lua, args: MultiValue| {
            function
                .invoke(lua, args)
                .map_err(|e| wrap_failure(function.name(), e))
        })?;
        self.functions.push((name, f));
        Ok(())
    }

    /// Bind a session-local closure. Failures are tagged like bundle functions.
    pub fn register<A, R, F>(&mut self, lua: &Lua, name: &str, func: F) -> Result<(), SandboxError>
    where
        A: FromLuaMulti,
        R: IntoLuaMulti,
        F: Fn(&Lua, A) -> mlua::Result<R> + 'static,
    {
        self.ensure_free(name)?;
        let owned = name.to_string();
        let f = lua.create_function(move |lua, args: A| {
            func(lua, args).map_err(|e| wrap_failure(&owned, e))
        })?;
        self.functions.push((name.to_string(), f));
        Ok(())
    }

    /// Add an already created function.
    pub fn insert(&mut self, name: impl Into<String>, function: Function) -> Result<(), SandboxError> {
        let name = name.into();
        self.ensure_free(&name)?;
        self.functions.push((name, function));
        Ok(())
    }

    fn ensure_free(&self, name: &str) -> Result<(), SandboxError> {
        if self.contains(name) {
            return Err(SandboxError::DuplicateBinding(name.to_string()));
        }
        Ok(())
    }

    pub fn contains(&self, name: &str) -> bool {
        self.functions.iter().any(|(n, _)| n == name)
    }

    pub fn get(&self, name: &str) -> Option<&Function> {
        self.functions.iter().find(|(n, _)| n == name).map(|(_, f)| f)
    }

    pub fn names(&self) -> impl Iterator<Item = &str> {
        self.functions.iter().map(|(n, _)| n.as_str())
    }

    pub fn iter(&self) -> impl Iterator<Item = (&str, &Function)> {
        self.functions.iter().map(|(n, f)| (n.as_str(), f))
    }

    pub fn len(&self) -> usize {
        self.functions.len()
    }

    pub fn is_empty(&self) -> bool {
        self.functions.is_empty()
    }

    /// Register release work for something a binding opened.
    pub fn on_cleanup(&mut self, release: impl FnOnce() + 'static) {
        if self.cleaned {
            release();
        } else {
            self.cleanups.push(Box::new(release));
        }
    }

    /// Run every registered release, newest first. Later calls do nothing.
    pub fn cleanup(&mut self) -> bool {
        if self.cleaned {
            return false;
        }
        self.cleaned = true;
        while let Some(release) = self.cleanups.pop() {
            release();
        }
        true
    }

    pub fn is_cleaned_up(&self) -> bool {
        self.cleaned
    }
}

// ============================================================================
// Binders
// ============================================================================

/// Shared output stream of one session.
pub type SessionOutput = Rc<RefCell<Box<dyn std::io::Write + Send>>>;

/// Shared input stream of one session.
pub type SessionInput = Rc<RefCell<Box<dyn std::io::Read + Send>>>;

/// What a binder may capture from the session it binds into.
#[derive(Clone)]
pub struct BindContext {
    pub session: SessionId,
    pub mode: Mode,
    pub resources: SharedResources,
    pub interrupt: Interrupt,
    pub input: SessionInput,
    pub output: SessionOutput,
    pub poll: Duration,
}

/// Produces session-bound functions. Runs on the session's worker with the
/// session's VM, after the bundles were seeded.
pub trait SessionBinder: Send + Sync {
    fn bind(&self, lua: &Lua, ctx: &BindContext, pool: &mut FunctionPool) -> Result<(), SandboxError>;
}
