//! Error types for the sandbox.
//!
//! Three families live here:
//!
//! - [`SandboxError`]: setup-time failures and contract violations. These are
//!   the only errors the public API returns.
//! - [`Interrupted`]: the cooperative termination signal. It travels through
//!   the VM inside `mlua::Error::ExternalError` and is never shown to a
//!   script as an ordinary runtime error.
//! - [`InvocationError`]: the single wrapper placed around failures raised by
//!   host-callable functions, so reports can name the function that failed.

use std::fmt;
use std::io;
use std::sync::Arc;

/// Setup-time failure or contract violation.
#[derive(Debug)]
pub enum SandboxError {
    /// A capability bundle with this name is already registered.
    DuplicateBundle(String),
    /// Two bindings tried to claim the same global name.
    DuplicateBinding(String),
    /// The VM rejected a setup step (creating a function, table, ...).
    Lua(mlua::Error),
    /// Underlying I/O failure (reading a script file, writing a report).
    Io(io::Error),
    /// Script source could not be read in.
    Source(SourceError),
}

impl fmt::Display for SandboxError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            SandboxError::DuplicateBundle(name) => {
                write!(f, "capability bundle '{}' is already registered", name)
            }
            SandboxError::DuplicateBinding(name) => {
                write!(f, "global '{}' is bound more than once", name)
            }
            SandboxError::Lua(e) => write!(f, "Lua setup failed: {}", e),
            SandboxError::Io(e) => write!(f, "I/O error: {}", e),
            SandboxError::Source(e) => write!(f, "could not read program: {}", e),
        }
    }
}

impl std::error::Error for SandboxError {
    fn source(&self) -> Option<&(dyn std::error::Error + 'static)> {
        match self {
            SandboxError::Lua(e) => Some(e),
            SandboxError::Io(e) => Some(e),
            SandboxError::Source(e) => Some(e),
            _ => None,
        }
    }
}

impl From<mlua::Error> for SandboxError {
    fn from(e: mlua::Error) -> Self {
        SandboxError::Lua(e)
    }
}

impl From<io::Error> for SandboxError {
    fn from(e: io::Error) -> Self {
        SandboxError::Io(e)
    }
}

impl From<SourceError> for SandboxError {
    fn from(e: SourceError) -> Self {
        SandboxError::Source(e)
    }
}

/// Failure while reading program source.
#[derive(Debug)]
pub enum SourceError {
    /// Termination was requested while waiting for more source.
    Interrupted,
    Io(io::Error),
}

impl fmt::Display for SourceError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            SourceError::Interrupted => write!(f, "read interrupted"),
            SourceError::Io(e) => write!(f, "{}", e),
        }
    }
}

impl std::error::Error for SourceError {}

/// Cooperative termination signal.
///
/// Raised by the instruction hook and by any host function that polls the
/// interrupt controller. The orchestrator recognises it anywhere in an error
/// chain with [`crate::interrupt::is_interrupt`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Interrupted;

impl fmt::Display for Interrupted {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "program terminated")
    }
}

impl std::error::Error for Interrupted {}

impl Interrupted {
    /// The signal as a Lua error, ready to be returned from a callback or hook.
    pub fn into_lua(self) -> mlua::Error {
        mlua::Error::ExternalError(Arc::new(self))
    }
}

/// Failure raised by a host-callable function, tagged with its name.
///
/// This is the one wrapping layer the reporter unwraps to reach the real
/// cause.
#[derive(Debug)]
pub struct InvocationError {
    pub function: String,
    pub source: mlua::Error,
}

impl InvocationError {
    pub fn new(function: impl Into<String>, source: mlua::Error) -> Self {
        Self {
            function: function.into(),
            source,
        }
    }

    pub fn into_lua(self) -> mlua::Error {
        mlua::Error::ExternalError(Arc::new(self))
    }
}

impl fmt::Display for InvocationError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "error invoking host function '{}'", self.function)
    }
}

impl std::error::Error for InvocationError {
    fn source(&self) -> Option<&(dyn std::error::Error + 'static)> {
        Some(&self.source)
    }
}
