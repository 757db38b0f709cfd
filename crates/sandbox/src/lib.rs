//! Capability-gated Lua sandbox for terminal sessions.
//!
//! A host registers [`CapabilityBundle`]s in a [`CapabilityRegistry`], builds a
//! [`SandboxEngine`] around it, and starts scripts with
//! [`SandboxEngine::spawn`], [`SandboxEngine::run`], [`SandboxEngine::exec`] or
//! [`SandboxEngine::exec_file`]. Every session gets a fresh VM, a sealed
//! namespace, cooperative termination through its [`SessionHandle`], and a
//! teardown that returns every frame, channel and display slot it took.

pub mod bindings;
pub mod engine;
pub mod error;
pub mod host;
pub mod interrupt;
pub mod namespace;
pub mod pool;
pub mod registry;
pub mod render;
pub mod report;
pub mod resources;
pub mod session;
pub mod terminal;

pub use engine::{SandboxConfig, SandboxEngine};
pub use error::{Interrupted, InvocationError, SandboxError, SourceError};
pub use host::{ChannelHub, Display, Host};
pub use interrupt::Interrupt;
pub use pool::{BindContext, FunctionPool, SessionBinder};
pub use registry::{CapabilityBundle, CapabilityRegistry, HostFunction, Mode};
pub use render::{FrameHandle, MemoryRenderer, Renderer};
pub use report::{ErrorReport, Failure, ReportKind, ReportLine, Severity};
pub use session::{ExecutionOutcome, ScriptRequest, ScriptSource, SessionHandle, SessionId, SessionState};
pub use terminal::{dispatch_line, InputPipe, InputSink, SharedBuffer, Terminal};
