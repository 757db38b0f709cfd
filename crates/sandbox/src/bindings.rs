//! Functions every script can call.
//!
//! [`CoreBinder`] installs the static bindings (console I/O, sleeping,
//! clock). [`HostBinder`] installs the session-bound ones that allocate host
//! resources: frames, channels, display slots and terminal hooks. Anything a
//! host binding allocates is recorded in the session's resources and handed
//! back at teardown.

use std::cell::RefCell;
use std::io::{self, Read, Write};
use std::rc::Rc;
use std::time::Duration;

use mlua::{Lua, MultiValue, Value};

use crate::error::{Interrupted, SandboxError};
use crate::pool::{BindContext, FunctionPool, SessionBinder, SessionInput};

/// Largest single `read(n)` request.
const MAX_READ: usize = 64 * 1024;

/// Longest line `read_line` buffers before handing it over.
const MAX_LINE: usize = 64 * 1024;

/// Format a Lua value for `print`/`write`.
pub fn value_to_string(value: &Value) -> String {
    match value {
        Value::Nil => "nil".to_string(),
        Value::Boolean(b) => b.to_string(),
        Value::Integer(i) => i.to_string(),
        Value::Number(n) => {
            if n.fract() == 0.0 && n.abs() < 1e15 {
                format!("{:.1}", n)
            } else {
                format!("{}", n)
            }
        }
        Value::String(s) => s.to_string_lossy().to_string(),
        Value::Table(t) => format!("table: {:p}", t.to_pointer()),
        Value::Function(f) => format!("function: {:p}", f.to_pointer()),
        Value::Thread(t) => format!("thread: {:p}", t.to_pointer()),
        Value::UserData(_) | Value::LightUserData(_) => "userdata".to_string(),
        Value::Error(e) => e.to_string(),
        _ => "<unknown>".to_string(),
    }
}

fn join_values(values: &MultiValue) -> String {
    values
        .iter()
        .map(value_to_string)
        .collect::<Vec<_>>()
        .join("\t")
}

fn io_failure(e: io::Error) -> mlua::Error {
    mlua::Error::external(e)
}

fn stop() -> mlua::Error {
    Interrupted.into_lua()
}

// ============================================================================
// Core bindings
// ============================================================================

/// Input stream plus bytes read past the last line handed out.
struct LineReader {
    input: SessionInput,
    pending: Vec<u8>,
}

enum Fill {
    Data,
    Eof,
    Empty,
}

impl LineReader {
    fn fill(&mut self) -> io::Result<Fill> {
        let mut chunk = [0u8; 1024];
        match self.input.borrow_mut().read(&mut chunk) {
            Ok(0) => Ok(Fill::Eof),
            Ok(n) => {
                self.pending.extend_from_slice(&chunk[..n]);
                Ok(Fill::Data)
            }
            Err(e) if e.kind() == io::ErrorKind::WouldBlock => Ok(Fill::Empty),
            Err(e) if e.kind() == io::ErrorKind::Interrupted => Ok(Fill::Empty),
            Err(e) => Err(e),
        }
    }

    fn take_line(&mut self) -> Option<Vec<u8>> {
        let pos = self.pending.iter().position(|b| *b == b'\n')?;
        let mut line: Vec<u8> = self.pending.drain(..=pos).collect();
        line.pop();
        if line.last() == Some(&b'\r') {
            line.pop();
        }
        Some(line)
    }
}

/// Console I/O, `sleep`, `terminated` and `time_ms`.
pub struct CoreBinder;

impl SessionBinder for CoreBinder {
    fn bind(&self, lua: &Lua, ctx: &BindContext, pool: &mut FunctionPool) -> Result<(), SandboxError> {
        {
            let output = ctx.output.clone();
            pool.register(lua, "print", move |_, args: MultiValue| {
                let mut out = output.borrow_mut();
                writeln!(out, "{}", join_values(&args)).map_err(io_failure)?;
                out.flush().map_err(io_failure)
            })?;
        }

        {
            let output = ctx.output.clone();
            pool.register(lua, "write", move |_, args: MultiValue| {
                let mut out = output.borrow_mut();
                let text: String = args.iter().map(value_to_string).collect();
                out.write_all(text.as_bytes()).map_err(io_failure)?;
                out.flush().map_err(io_failure)
            })?;
        }

        let reader = Rc::new(RefCell::new(LineReader {
            input: ctx.input.clone(),
            pending: Vec::new(),
        }));

        // read([n]): up to n bytes (default: whatever is available); nil at end of input
        {
            let reader = reader.clone();
            let interrupt = ctx.interrupt.clone();
            let poll = ctx.poll;
            pool.register(lua, "read", move |lua, n: Option<usize>| {
                let limit = n.unwrap_or(MAX_READ).clamp(1, MAX_READ);
                let mut reader = reader.borrow_mut();
                loop {
                    interrupt.check().map_err(|_| stop())?;
                    if !reader.pending.is_empty() {
                        let take = limit.min(reader.pending.len());
                        let bytes: Vec<u8> = reader.pending.drain(..take).collect();
                        return Ok(Some(lua.create_string(&bytes)?));
                    }
                    match reader.fill().map_err(io_failure)? {
                        Fill::Data => {}
                        Fill::Eof => return Ok(None),
                        Fill::Empty => std::thread::sleep(poll),
                    }
                }
            })?;
        }

        {
            let reader = reader.clone();
            let interrupt = ctx.interrupt.clone();
            let poll = ctx.poll;
            pool.register(lua, "read_line", move |lua, ()| {
                let mut reader = reader.borrow_mut();
                loop {
                    interrupt.check().map_err(|_| stop())?;
                    if let Some(line) = reader.take_line() {
                        return Ok(Some(lua.create_string(&line)?));
                    }
                    if reader.pending.len() >= MAX_LINE {
                        let line = std::mem::take(&mut reader.pending);
                        return Ok(Some(lua.create_string(&line)?));
                    }
                    match reader.fill().map_err(io_failure)? {
                        Fill::Data => {}
                        Fill::Eof if reader.pending.is_empty() => return Ok(None),
                        Fill::Eof => {
                            let line = std::mem::take(&mut reader.pending);
                            return Ok(Some(lua.create_string(&line)?));
                        }
                        Fill::Empty => std::thread::sleep(poll),
                    }
                }
            })?;
        }

        {
            let interrupt = ctx.interrupt.clone();
            let poll = ctx.poll;
            pool.register(lua, "sleep", move |_, ms: u64| {
                interrupt
                    .sleep(Duration::from_millis(ms), poll)
                    .map_err(Interrupted::into_lua)
            })?;
        }

        {
            let interrupt = ctx.interrupt.clone();
            pool.register(lua, "terminated", move |_, ()| Ok(interrupt.terminated()))?;
        }

        pool.register(lua, "time_ms", |_, ()| Ok(chrono::Utc::now().timestamp_millis()))?;

        Ok(())
    }
}

// ============================================================================
// Host bindings
// ============================================================================

/// Frames, channels, display slots and terminal hooks.
pub struct HostBinder;

impl SessionBinder for HostBinder {
    fn bind(&self, lua: &Lua, ctx: &BindContext, pool: &mut FunctionPool) -> Result<(), SandboxError> {
        // Frames
        {
            let res = ctx.resources.clone();
            pool.register(lua, "frame_create", move |_, (w, h): (u32, u32)| {
                res.borrow_mut()
                    .create_frame(w, h)
                    .map_err(mlua::Error::RuntimeError)
            })?;
        }
        {
            let res = ctx.resources.clone();
            pool.register(lua, "frame_set", move |_, (id, x, y, c): (u32, u32, u32, u8)| {
                let res = res.borrow();
                let handle = res
                    .frame(id)
                    .ok_or_else(|| mlua::Error::RuntimeError(format!("no frame with id {}", id)))?;
                res.host().renderer().set_pixel(handle, x, y, c);
                Ok(())
            })?;
        }
        {
            let res = ctx.resources.clone();
            pool.register(lua, "frame_get", move |_, (id, x, y): (u32, u32, u32)| {
                let res = res.borrow();
                let handle = res
                    .frame(id)
                    .ok_or_else(|| mlua::Error::RuntimeError(format!("no frame with id {}", id)))?;
                Ok(res.host().renderer().pixel(handle, x, y))
            })?;
        }
        {
            let res = ctx.resources.clone();
            pool.register(lua, "frame_release", move |_, id: u32| {
                Ok(res.borrow_mut().release_frame(id))
            })?;
        }
        {
            let res = ctx.resources.clone();
            pool.register(lua, "frame_count", move |_, ()| Ok(res.borrow().frames().len()))?;
        }

        // Channels
        {
            let res = ctx.resources.clone();
            pool.register(lua, "channel_register", move |_, name: String| {
                Ok(res.borrow_mut().register_channel(&name))
            })?;
        }
        {
            let res = ctx.resources.clone();
            pool.register(lua, "channel_unregister", move |_, name: String| {
                Ok(res.borrow_mut().unregister_channel(&name))
            })?;
        }
        {
            let res = ctx.resources.clone();
            pool.register(lua, "channel_send", move |_, (name, message): (String, String)| {
                Ok(res.borrow().host().channels().send(&name, message))
            })?;
        }
        {
            let res = ctx.resources.clone();
            let session = ctx.session;
            pool.register(lua, "channel_poll", move |_, name: String| {
                Ok(res.borrow().host().channels().poll(&name, session))
            })?;
        }

        // Display slots
        {
            let res = ctx.resources.clone();
            pool.register(lua, "screen_attach", move |_, (slot, frame): (usize, u32)| {
                res.borrow_mut()
                    .attach_slot(slot, frame)
                    .map_err(mlua::Error::RuntimeError)
            })?;
        }
        {
            let res = ctx.resources.clone();
            pool.register(lua, "screen_detach", move |_, slot: usize| {
                Ok(res.borrow_mut().detach_slot(slot))
            })?;
        }

        // Terminal hooks
        {
            let res = ctx.resources.clone();
            pool.register(lua, "terminal_protect", move |_, ()| {
                Ok(match res.borrow().held_terminal() {
                    Some(t) => {
                        t.set_protected(true);
                        true
                    }
                    None => false,
                })
            })?;
        }
        {
            let res = ctx.resources.clone();
            pool.register(lua, "terminal_raw_input", move |_, raw: bool| {
                Ok(match res.borrow().held_terminal() {
                    Some(t) => {
                        t.set_raw_input(raw);
                        true
                    }
                    None => false,
                })
            })?;
        }
        {
            let res = ctx.resources.clone();
            pool.register(lua, "cwd", move |_, ()| {
                Ok(res
                    .borrow()
                    .terminal()
                    .map(|t| t.current_directory())
                    .unwrap_or_else(|| "/".to_string()))
            })?;
        }

        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Arc;

    use crate::host::Host;
    use crate::interrupt::{is_interrupt, Interrupt};
    use crate::registry::Mode;
    use crate::render::{MemoryRenderer, Renderer};
    use crate::resources::SessionResources;
    use crate::session::SessionHandle;
    use crate::terminal::{InputPipe, SharedBuffer, Terminal};

    struct Fixture {
        lua: Lua,
        pool: FunctionPool,
        out: SharedBuffer,
        pipe: InputPipe,
        host: Arc<Host>,
        renderer: Arc<MemoryRenderer>,
        ctx: BindContext,
    }

    fn fixture(terminal: bool) -> Fixture {
        let renderer = Arc::new(MemoryRenderer::new());
        let host = Arc::new(Host::new(std::env::temp_dir(), renderer.clone() as Arc<dyn Renderer>));
        let out = SharedBuffer::new();
        let pipe = InputPipe::new();
        let session = SessionHandle::new(Mode::Restricted);
        let term = terminal.then(|| {
            let t = Terminal::new(host.clone(), None, out.clone());
            assert!(t.try_claim(&session));
            t
        });
        let ctx = BindContext {
            session: session.id(),
            mode: Mode::Restricted,
            resources: Rc::new(RefCell::new(SessionResources::new(session.id(), host.clone(), term))),
            interrupt: Interrupt::new(),
            input: Rc::new(RefCell::new(Box::new(pipe.clone()) as Box<dyn Read + Send>)),
            output: Rc::new(RefCell::new(Box::new(out.clone()) as Box<dyn Write + Send>)),
            poll: Duration::from_millis(1),
        };
        let lua = Lua::new();
        let mut pool = FunctionPool::new();
        CoreBinder.bind(&lua, &ctx, &mut pool).unwrap();
        HostBinder.bind(&lua, &ctx, &mut pool).unwrap();
        for (name, f) in pool.iter() {
            lua.globals().set(name, f.clone()).unwrap();
        }
        Fixture { lua, pool, out, pipe, host, renderer, ctx }
    }

    #[test]
    fn test_print_and_write() {
        let f = fixture(false);
        f.lua.load("print('a', 1, 2.5, nil, true) write('x', 'y')").exec().unwrap();
        assert_eq!(f.out.contents(), "a\t1\t2.5\tnil\ttrue\nxy");
    }

    #[test]
    fn test_read_line_waits_for_input() {
        let f = fixture(false);
        let pipe = f.pipe.clone();
        let feeder = std::thread::spawn(move || {
            std::thread::sleep(Duration::from_millis(20));
            pipe.push(b"first\r\nsecond\nrest");
            pipe.close();
        });
        let lines: (String, String, String, Option<String>) = f
            .lua
            .load("return read_line(), read_line(), read_line(), read_line()")
            .eval()
            .unwrap();
        feeder.join().unwrap();
        assert_eq!(lines, ("first".into(), "second".into(), "rest".into(), None));
    }

    #[test]
    fn test_read_bytes() {
        let f = fixture(false);
        f.pipe.push(b"abcdef");
        f.pipe.close();
        let (a, b, c): (String, String, Option<String>) =
            f.lua.load("return read(2), read(), read()").eval().unwrap();
        assert_eq!((a.as_str(), b.as_str(), c), ("ab", "cdef", None));
    }

    #[test]
    fn test_read_line_interrupted() {
        let f = fixture(false);
        let interrupt = f.ctx.interrupt.clone();
        let waker = std::thread::spawn(move || {
            std::thread::sleep(Duration::from_millis(20));
            interrupt.request();
        });
        let err = f.lua.load("read_line()").exec().unwrap_err();
        waker.join().unwrap();
        assert!(is_interrupt(&err));
    }

    #[test]
    fn test_sleep_interrupted() {
        let f = fixture(false);
        f.ctx.interrupt.request();
        let err = f.lua.load("sleep(10000)").exec().unwrap_err();
        assert!(is_interrupt(&err));
        assert!(f.lua.load("return terminated()").eval::<bool>().unwrap());
    }

    #[test]
    fn test_frames_tracked() {
        let f = fixture(false);
        let (a, b, got, count): (u32, u32, u8, usize) = f
            .lua
            .load(
                "local a = frame_create(2, 2)
                 local b = frame_create(1, 1)
                 frame_set(a, 1, 1, 9)
                 return a, b, frame_get(a, 1, 1), frame_count()",
            )
            .eval()
            .unwrap();
        assert_eq!((a, b, got, count), (0, 1, 9, 2));
        assert_eq!(f.renderer.live_frames(), 2);

        f.lua.load("frame_release(0)").exec().unwrap();
        let again: u32 = f.lua.load("return frame_create(3, 3)").eval().unwrap();
        assert_eq!(again, 0);
    }

    #[test]
    fn test_unknown_frame_names_function() {
        let f = fixture(false);
        let err = f.lua.load("frame_set(7, 0, 0, 1)").exec().unwrap_err();
        let text = format!("{:?}", err);
        assert!(text.contains("frame_set"), "{}", text);
        assert!(text.contains("no frame with id 7"), "{}", text);
    }

    #[test]
    fn test_channels_and_slots() {
        let f = fixture(false);
        let polled: Option<String> = f
            .lua
            .load(
                "assert(channel_register('inbox'))
                 assert(channel_send('inbox', 'hello'))
                 screen_attach(1, frame_create(1, 1))
                 return channel_poll('inbox')",
            )
            .eval()
            .unwrap();
        assert_eq!(polled.as_deref(), Some("hello"));
        assert!(f.host.channels().is_registered("inbox"));
        assert_eq!(f.host.display().occupied(), 1);

        let summary = f.ctx.resources.borrow_mut().release().unwrap();
        assert_eq!((summary.frames, summary.channels, summary.slots), (1, 1, 1));
        assert!(f.host.channels().is_empty());
        assert_eq!(f.host.display().occupied(), 0);
        assert!(f.pool.len() > 10);
    }

    #[test]
    fn test_terminal_hooks() {
        let f = fixture(true);
        let (protected, cwd): (bool, String) = f
            .lua
            .load("terminal_raw_input(true) return terminal_protect(), cwd()")
            .eval()
            .unwrap();
        assert!(protected);
        assert_eq!(cwd, "/");
        let res = f.ctx.resources.borrow();
        let hooks = res.terminal().unwrap().hooks();
        assert!(hooks.protected && hooks.raw_input);
    }

    #[test]
    fn test_terminal_hooks_headless() {
        let f = fixture(false);
        let ok: bool = f.lua.load("return terminal_protect()").eval().unwrap();
        assert!(!ok);
    }
}
