//! Session lifecycle: states, outcomes, requests and the handle the host
//! keeps while a script runs.
//!
//! A session moves through
//!
//! ```text
//! Created -> Compiling -> Running -> { Completed | Interrupted | Failed } -> TornDown
//! ```
//!
//! Setup failures go straight from `Created` to `Failed`, and a read-in
//! interrupted while compiling goes from `Compiling` to `Interrupted`.
//! `TornDown` is reachable from every state and is always last.

use std::fmt;
use std::io::{Read, Write};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};

use parking_lot::{Condvar, Mutex};

use crate::interrupt::Interrupt;
use crate::registry::Mode;
use crate::report::ErrorReport;
use crate::terminal::Terminal;

/// Unique, process-wide session id.
pub type SessionId = u64;

static NEXT_SESSION_ID: AtomicU64 = AtomicU64::new(1);

pub(crate) fn next_session_id() -> SessionId {
    NEXT_SESSION_ID.fetch_add(1, Ordering::Relaxed)
}

// ============================================================================
// States and outcomes
// ============================================================================

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SessionState {
    Created,
    Compiling,
    Running,
    Completed,
    Interrupted,
    Failed,
    TornDown,
}

impl SessionState {
    /// Whether the lifecycle allows moving from `self` to `next`.
    pub fn can_become(self, next: SessionState) -> bool {
        use SessionState::*;
        match (self, next) {
            (TornDown, _) => false,
            (_, TornDown) => true,
            (Created, Compiling) | (Created, Failed) => true,
            (Compiling, Running) | (Compiling, Failed) | (Compiling, Interrupted) => true,
            (Running, Completed) | (Running, Interrupted) | (Running, Failed) => true,
            _ => false,
        }
    }

    /// One of the three run outcomes.
    pub fn is_outcome(self) -> bool {
        matches!(
            self,
            SessionState::Completed | SessionState::Interrupted | SessionState::Failed
        )
    }
}

impl fmt::Display for SessionState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            SessionState::Created => "created",
            SessionState::Compiling => "compiling",
            SessionState::Running => "running",
            SessionState::Completed => "completed",
            SessionState::Interrupted => "interrupted",
            SessionState::Failed => "failed",
            SessionState::TornDown => "torn down",
        };
        f.write_str(s)
    }
}

/// How a session ended. Produced exactly once per session.
#[derive(Debug, Clone)]
pub enum ExecutionOutcome {
    Completed,
    Interrupted,
    Failed(ErrorReport),
}

impl ExecutionOutcome {
    pub fn state(&self) -> SessionState {
        match self {
            ExecutionOutcome::Completed => SessionState::Completed,
            ExecutionOutcome::Interrupted => SessionState::Interrupted,
            ExecutionOutcome::Failed(_) => SessionState::Failed,
        }
    }

    pub fn is_completed(&self) -> bool {
        matches!(self, ExecutionOutcome::Completed)
    }

    pub fn report(&self) -> Option<&ErrorReport> {
        match self {
            ExecutionOutcome::Failed(report) => Some(report),
            _ => None,
        }
    }
}

// ============================================================================
// Handle
// ============================================================================

struct SessionStatus {
    state: SessionState,
    outcome: Option<ExecutionOutcome>,
    history: Vec<SessionState>,
}

struct SessionShared {
    id: SessionId,
    mode: Mode,
    interrupt: Interrupt,
    status: Mutex<SessionStatus>,
    changed: Condvar,
}

/// Host-side view of a session. Cheap to clone, usable from any thread.
#[derive(Clone)]
pub struct SessionHandle {
    shared: Arc<SessionShared>,
}

impl SessionHandle {
    pub(crate) fn new(mode: Mode) -> Self {
        Self {
            shared: Arc::new(SessionShared {
                id: next_session_id(),
                mode,
                interrupt: Interrupt::new(),
                status: Mutex::new(SessionStatus {
                    state: SessionState::Created,
                    outcome: None,
                    history: vec![SessionState::Created],
                }),
                changed: Condvar::new(),
            }),
        }
    }

    pub fn id(&self) -> SessionId {
        self.shared.id
    }

    pub fn mode(&self) -> Mode {
        self.shared.mode
    }

    pub fn state(&self) -> SessionState {
        self.shared.status.lock().state
    }

    /// Every state the session has been in, oldest first.
    pub fn history(&self) -> Vec<SessionState> {
        self.shared.status.lock().history.clone()
    }

    pub fn outcome(&self) -> Option<ExecutionOutcome> {
        self.shared.status.lock().outcome.clone()
    }

    pub fn is_finished(&self) -> bool {
        self.state() == SessionState::TornDown
    }

    /// Ask the session to stop at its next suspension point.
    pub fn terminate(&self) {
        self.shared.interrupt.request();
    }

    pub fn interrupt(&self) -> &Interrupt {
        &self.shared.interrupt
    }

    /// Block until teardown has finished.
    pub fn wait(&self) -> Option<ExecutionOutcome> {
        let mut status = self.shared.status.lock();
        while status.state != SessionState::TornDown {
            self.shared.changed.wait(&mut status);
        }
        status.outcome.clone()
    }

    /// Like [`wait`](Self::wait), giving up after `timeout`. `None` if the
    /// session is still going.
    pub fn wait_timeout(&self, timeout: Duration) -> Option<ExecutionOutcome> {
        let deadline = Instant::now() + timeout;
        let mut status = self.shared.status.lock();
        while status.state != SessionState::TornDown {
            if self
                .shared
                .changed
                .wait_until(&mut status, deadline)
                .timed_out()
            {
                return None;
            }
        }
        status.outcome.clone()
    }

    /// Move to `next`. Transitions the lifecycle forbids are ignored.
    pub(crate) fn advance(&self, next: SessionState) -> bool {
        let mut status = self.shared.status.lock();
        if !status.state.can_become(next) {
            log::debug!(
                "session {}: ignored transition {} -> {}",
                self.shared.id,
                status.state,
                next
            );
            return false;
        }
        status.state = next;
        status.history.push(next);
        drop(status);
        self.shared.changed.notify_all();
        true
    }

    /// Record the outcome and enter its state. Only the first call counts.
    pub(crate) fn finish(&self, outcome: ExecutionOutcome) -> bool {
        {
            let mut status = self.shared.status.lock();
            if status.outcome.is_some() {
                return false;
            }
            status.outcome = Some(outcome.clone());
        }
        self.advance(outcome.state())
    }
}

impl fmt::Debug for SessionHandle {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("SessionHandle")
            .field("id", &self.shared.id)
            .field("mode", &self.shared.mode)
            .field("state", &self.state())
            .finish()
    }
}

// ============================================================================
// Requests
// ============================================================================

/// Where the program text comes from.
pub enum ScriptSource {
    Text(String),
    /// Read until end of stream; `WouldBlock` means "more is coming".
    Stream(Box<dyn Read + Send>),
}

/// Everything needed to start a session.
///
/// Missing input or output falls back to the terminal's streams, and
/// without a terminal to `io::empty()` / `io::sink()`.
pub struct ScriptRequest {
    pub source: ScriptSource,
    pub name: String,
    pub args: String,
    pub mode: Mode,
    pub terminal: Option<Terminal>,
    pub input: Option<Box<dyn Read + Send>>,
    pub output: Option<Box<dyn Write + Send>>,
}

impl ScriptRequest {
    pub fn text(source: impl Into<String>) -> Self {
        Self::new(ScriptSource::Text(source.into()))
    }

    pub fn stream(reader: impl Read + Send + 'static) -> Self {
        Self::new(ScriptSource::Stream(Box::new(reader)))
    }

    fn new(source: ScriptSource) -> Self {
        Self {
            source,
            name: "program".to_string(),
            args: String::new(),
            mode: Mode::default(),
            terminal: None,
            input: None,
            output: None,
        }
    }

    /// Chunk name shown in error messages.
    pub fn named(mut self, name: impl Into<String>) -> Self {
        self.name = name.into();
        self
    }

    pub fn with_args(mut self, args: impl Into<String>) -> Self {
        self.args = args.into();
        self
    }

    pub fn with_mode(mut self, mode: Mode) -> Self {
        self.mode = mode;
        self
    }

    pub fn on_terminal(mut self, terminal: Terminal) -> Self {
        self.terminal = Some(terminal);
        self
    }

    pub fn with_input(mut self, input: impl Read + Send + 'static) -> Self {
        self.input = Some(Box::new(input));
        self
    }

    pub fn with_output(mut self, output: impl Write + Send + 'static) -> Self {
        self.output = Some(Box::new(output));
        self
    }
}
