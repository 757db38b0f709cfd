//! Interrupt controller.
//!
//! Termination is cooperative. Any thread may call [`Interrupt::request`];
//! the session only notices at defined suspension points:
//!
//! - the VM instruction hook installed by [`install_hook`],
//! - host functions that wait or poll ([`Interrupt::sleep`], `read_line`),
//! - the source read-in loop ([`read_source`]).
//!
//! Once noticed, the signal unwinds the script as an [`Interrupted`] error
//! carried inside `mlua::Error`, which the orchestrator recognises with
//! [`is_interrupt`].

use std::io::{self, Read};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};

use mlua::{HookTriggers, Lua, VmState};

use crate::error::{InvocationError, Interrupted, SourceError};

/// Deepest error chain [`is_interrupt`] will follow.
const MAX_CHAIN_DEPTH: usize = 16;

/// Shared termination flag for one session.
#[derive(Debug, Clone, Default)]
pub struct Interrupt {
    requested: Arc<AtomicBool>,
}

impl Interrupt {
    pub fn new() -> Self {
        Self::default()
    }

    /// Ask the session to stop. Safe from any thread, idempotent.
    pub fn request(&self) {
        self.requested.store(true, Ordering::SeqCst);
    }

    pub fn terminated(&self) -> bool {
        self.requested.load(Ordering::SeqCst)
    }

    /// Fail with [`Interrupted`] if termination was requested.
    pub fn check(&self) -> Result<(), Interrupted> {
        if self.terminated() {
            Err(Interrupted)
        } else {
            Ok(())
        }
    }

    /// Sleep for `duration`, waking every `poll` to check the flag.
    pub fn sleep(&self, duration: Duration, poll: Duration) -> Result<(), Interrupted> {
        let deadline = Instant::now() + duration;
        loop {
            self.check()?;
            let now = Instant::now();
            if now >= deadline {
                return Ok(());
            }
            std::thread::sleep(poll.min(deadline - now));
        }
    }
}

/// Install an instruction hook that raises [`Interrupted`] once termination
/// is requested. Checked every `every_n` VM instructions.
pub fn install_hook(lua: &Lua, interrupt: &Interrupt, every_n: u32) {
    let interrupt = interrupt.clone();
    lua.set_hook(
        HookTriggers::new().every_nth_instruction(every_n.max(1)),
        move |_lua, _debug| {
            if interrupt.terminated() {
                Err(Interrupted.into_lua())
            } else {
                Ok(VmState::Continue)
            }
        },
    );
}

/// True if `err`, or anything it wraps, is the termination signal.
pub fn is_interrupt(err: &mlua::Error) -> bool {
    let mut current = err;
    for _ in 0..MAX_CHAIN_DEPTH {
        match current {
            mlua::Error::CallbackError { cause, .. } => current = cause.as_ref(),
            mlua::Error::WithContext { cause, .. } => current = cause.as_ref(),
            mlua::Error::ExternalError(inner) => {
                if inner.downcast_ref::<Interrupted>().is_some() {
                    return true;
                }
                if let Some(invocation) = inner.downcast_ref::<InvocationError>() {
                    current = &invocation.source;
                } else if let Some(lua_err) = inner.downcast_ref::<mlua::Error>() {
                    current = lua_err;
                } else {
                    return false;
                }
            }
            _ => return false,
        }
    }
    false
}

/// Read a whole program from `reader` without blocking uninterruptibly.
///
/// `WouldBlock` from the reader means "nothing yet": the loop sleeps for
/// `poll` and checks the interrupt again. `Ok(0)` ends the stream. Bytes are
/// decoded as UTF-8, lossily.
pub fn read_source(
    reader: &mut dyn Read,
    interrupt: &Interrupt,
    poll: Duration,
) -> Result<String, SourceError> {
    let mut buf = Vec::new();
    let mut chunk = [0u8; 4096];
    loop {
        if interrupt.terminated() {
            return Err(SourceError::Interrupted);
        }
        match reader.read(&mut chunk) {
            Ok(0) => break,
            Ok(n) => buf.extend_from_slice(&chunk[..n]),
            Err(e) if e.kind() == io::ErrorKind::WouldBlock => std::thread::sleep(poll),
            Err(e) if e.kind() == io::ErrorKind::Interrupted => continue,
            Err(e) => return Err(SourceError::Io(e)),
        }
    }
    Ok(String::from_utf8_lossy(&buf).into_owned())
}
