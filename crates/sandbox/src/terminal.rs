//! Terminals: the device a session is attached to.
//!
//! A terminal holds at most one running session (its busy slot), the
//! per-run hooks a script may install, a non-blocking input pipe fed by the
//! input driver, and the output stream the session writes to.

use std::collections::VecDeque;
use std::io::{self, Read, Write};
use std::sync::Arc;

use parking_lot::Mutex;

use crate::host::Host;
use crate::session::{SessionHandle, SessionId};

// ============================================================================
// Input driver interface
// ============================================================================

/// Callbacks the input driver uses to hand input to the active component.
pub trait InputSink {
    /// Plain text typed by `source`.
    fn deliver_text(&self, text: &str, source: &str);

    /// A control sequence (`^C`, `^2`, ...) from `source`; `code` is the
    /// character after the caret.
    fn deliver_control(&self, code: char, source: &str);
}

/// Route one raw input line: `^X` is a control sequence, anything else text.
pub fn dispatch_line(sink: &dyn InputSink, line: &str, source: &str) {
    match line.strip_prefix('^').and_then(|rest| rest.chars().next()) {
        Some(code) => sink.deliver_control(code, source),
        None => sink.deliver_text(line, source),
    }
}

// ============================================================================
// Pipes and buffers
// ============================================================================

#[derive(Default)]
struct PipeState {
    buf: VecDeque<u8>,
    closed: bool,
}

/// Byte pipe whose reader never blocks: an empty, open pipe reads as
/// `WouldBlock`; a closed, drained pipe reads as end of stream.
#[derive(Clone, Default)]
pub struct InputPipe {
    state: Arc<Mutex<PipeState>>,
}

impl InputPipe {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn push(&self, bytes: &[u8]) {
        self.state.lock().buf.extend(bytes.iter().copied());
    }

    pub fn close(&self) {
        self.state.lock().closed = true;
    }

    pub fn pending(&self) -> usize {
        self.state.lock().buf.len()
    }
}

impl Read for InputPipe {
    fn read(&mut self, out: &mut [u8]) -> io::Result<usize> {
        let mut state = self.state.lock();
        if state.buf.is_empty() {
            return if state.closed || out.is_empty() {
                Ok(0)
            } else {
                Err(io::ErrorKind::WouldBlock.into())
            };
        }
        let n = out.len().min(state.buf.len());
        for (slot, byte) in out.iter_mut().zip(state.buf.drain(..n)) {
            *slot = byte;
        }
        Ok(n)
    }
}

/// Cloneable in-memory output stream.
#[derive(Clone, Default)]
pub struct SharedBuffer {
    bytes: Arc<Mutex<Vec<u8>>>,
}

impl SharedBuffer {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn contents(&self) -> String {
        String::from_utf8_lossy(&self.bytes.lock()).into_owned()
    }

    pub fn clear(&self) {
        self.bytes.lock().clear();
    }
}

impl Write for SharedBuffer {
    fn write(&mut self, buf: &[u8]) -> io::Result<usize> {
        self.bytes.lock().extend_from_slice(buf);
        Ok(buf.len())
    }

    fn flush(&mut self) -> io::Result<()> {
        Ok(())
    }
}

/// Writer handed to a session; writes through to the terminal's stream.
#[derive(Clone)]
pub struct TerminalWriter {
    target: Arc<Mutex<Box<dyn Write + Send>>>,
}

impl Write for TerminalWriter {
    fn write(&mut self, buf: &[u8]) -> io::Result<usize> {
        self.target.lock().write(buf)
    }

    fn flush(&mut self) -> io::Result<()> {
        self.target.lock().flush()
    }
}

// ============================================================================
// Terminal
// ============================================================================

/// Hooks a running script may install; all reset at session teardown.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct TerminalHooks {
    /// Only the terminal owner may terminate the session.
    pub protected: bool,
    /// Control sequences are delivered to the script as text.
    pub raw_input: bool,
}

struct TerminalInner {
    host: Arc<Host>,
    owner: Option<String>,
    cwd: Mutex<String>,
    hooks: Mutex<TerminalHooks>,
    active: Mutex<Option<SessionHandle>>,
    input: InputPipe,
    output: Arc<Mutex<Box<dyn Write + Send>>>,
}

/// Handle to a terminal. Clones refer to the same device.
#[derive(Clone)]
pub struct Terminal {
    inner: Arc<TerminalInner>,
}

impl Terminal {
    pub fn new(host: Arc<Host>, owner: Option<String>, output: impl Write + Send + 'static) -> Self {
        Self {
            inner: Arc::new(TerminalInner {
                host,
                owner,
                cwd: Mutex::new("/".to_string()),
                hooks: Mutex::new(TerminalHooks::default()),
                active: Mutex::new(None),
                input: InputPipe::new(),
                output: Arc::new(Mutex::new(Box::new(output))),
            }),
        }
    }

    pub fn host(&self) -> &Arc<Host> {
        &self.inner.host
    }

    pub fn owner(&self) -> Option<&str> {
        self.inner.owner.as_deref()
    }

    pub fn current_directory(&self) -> String {
        self.inner.cwd.lock().clone()
    }

    pub fn set_current_directory(&self, dir: impl Into<String>) {
        *self.inner.cwd.lock() = dir.into();
    }

    pub fn input(&self) -> InputPipe {
        self.inner.input.clone()
    }

    pub fn writer(&self) -> TerminalWriter {
        TerminalWriter {
            target: self.inner.output.clone(),
        }
    }

    pub fn hooks(&self) -> TerminalHooks {
        *self.inner.hooks.lock()
    }

    pub fn set_protected(&self, protected: bool) {
        self.inner.hooks.lock().protected = protected;
    }

    pub fn set_raw_input(&self, raw: bool) {
        self.inner.hooks.lock().raw_input = raw;
    }

    pub fn clear_hooks(&self) {
        *self.inner.hooks.lock() = TerminalHooks::default();
    }

    pub fn is_busy(&self) -> bool {
        self.inner.active.lock().is_some()
    }

    pub fn active_session(&self) -> Option<SessionHandle> {
        self.inner.active.lock().clone()
    }

    /// Occupy the busy slot. False if another session holds it.
    pub(crate) fn try_claim(&self, session: &SessionHandle) -> bool {
        let mut active = self.inner.active.lock();
        if active.is_some() {
            return false;
        }
        *active = Some(session.clone());
        true
    }

    /// Whether session `id` holds the busy slot.
    pub(crate) fn is_held_by(&self, id: SessionId) -> bool {
        self.inner.active.lock().as_ref().map(|s| s.id()) == Some(id)
    }

    /// Free the busy slot if `id` still holds it.
    pub(crate) fn release(&self, id: SessionId) {
        let mut active = self.inner.active.lock();
        if active.as_ref().map(|s| s.id()) == Some(id) {
            *active = None;
        }
    }

    /// Request termination of the running session on behalf of `requester`.
    ///
    /// Refused when the terminal is protected and the requester is not the
    /// owner. Returns whether a termination request was issued.
    pub fn sig_term(&self, requester: Option<&str>) -> bool {
        let Some(session) = self.active_session() else {
            return false;
        };
        if self.hooks().protected && requester != self.owner() {
            log::warn!(
                "refused termination of session {} requested by {:?}",
                session.id(),
                requester
            );
            return false;
        }
        session.terminate();
        true
    }
}

impl InputSink for Terminal {
    fn deliver_text(&self, text: &str, _source: &str) {
        let mut line = text.to_string();
        line.push('\n');
        self.inner.input.push(line.as_bytes());
    }

    fn deliver_control(&self, code: char, source: &str) {
        if self.hooks().raw_input {
            self.inner.input.push(format!("^{}\n", code).as_bytes());
            return;
        }
        match code {
            'c' | 'C' => {
                self.sig_term(Some(source));
            }
            _ => {
                if let Some(view) = code.to_digit(10) {
                    self.inner.host.display().switch_view(view as usize);
                }
            }
        }
    }
}
