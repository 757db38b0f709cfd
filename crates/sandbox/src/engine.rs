//! The sandbox engine: builds a session's namespace, compiles and runs the
//! program, reports failures, and always tears the session down.
//!
//! Each session runs on its own worker thread (`spawn`) or on the caller's
//! thread (`run`), with its own Lua VM. Whatever happens inside, the session
//! ends in exactly one of `Completed`, `Interrupted` or `Failed`, followed by
//! `TornDown`.

use std::cell::RefCell;
use std::io::{self, Read, Write};
use std::path::{Component, Path, PathBuf};
use std::rc::Rc;
use std::sync::Arc;
use std::time::Duration;

use consoles_config::SandboxSettings;
use mlua::{ChunkMode, Function, Lua, LuaOptions, StdLib};

use crate::bindings::{CoreBinder, HostBinder};
use crate::error::{SandboxError, SourceError};
use crate::host::Host;
use crate::interrupt::{install_hook, is_interrupt, read_source};
use crate::namespace::{Namespace, NamespaceBuilder};
use crate::pool::{BindContext, SessionBinder, SessionInput, SessionOutput};
use crate::registry::{CapabilityRegistry, Mode};
use crate::report::{classify, DumpTarget, ErrorReport, Failure, ReportKind, ReportLine, Reporter, Severity};
use crate::resources::{ResourceGuard, SessionResources};
use crate::session::{ExecutionOutcome, ScriptRequest, ScriptSource, SessionHandle, SessionState};
use crate::terminal::Terminal;

pub const PROGRAM_TERMINATED: &str = "\nProgram terminated";
pub const EXIT_TERMINATED: &str = "\nExit routine terminated";
pub const PARSE_TERMINATED: &str = " [PARSE TERMINATED]";

/// Runtime knobs, resolved from [`SandboxSettings`].
#[derive(Debug, Clone)]
pub struct SandboxConfig {
    pub poll_interval: Duration,
    pub hook_interval: u32,
    pub report_line_limit: usize,
    pub dump_prefix: String,
    pub color: bool,
    pub debug: bool,
    /// Root for [`SandboxEngine::exec_file`].
    pub data_dir: PathBuf,
}

impl Default for SandboxConfig {
    fn default() -> Self {
        Self::from_settings(&SandboxSettings::default())
    }
}

impl SandboxConfig {
    pub fn from_settings(settings: &SandboxSettings) -> Self {
        Self {
            poll_interval: Duration::from_millis(settings.poll_interval_ms.max(1)),
            hook_interval: settings.hook_interval.max(1),
            report_line_limit: settings.report_line_limit,
            dump_prefix: settings.dump_prefix.clone(),
            color: settings.color,
            debug: settings.debug,
            data_dir: settings.effective_data_dir(),
        }
    }
}

// ============================================================================
// Session scope
// ============================================================================

/// Last step of every session, including a worker that panicked: record an
/// outcome if none was, free the terminal, enter `TornDown`.
struct SessionScope<'a> {
    session: &'a SessionHandle,
    terminal: Option<Terminal>,
}

impl Drop for SessionScope<'_> {
    fn drop(&mut self) {
        if self.session.outcome().is_none() {
            let report = ErrorReport {
                kind: ReportKind::Runtime,
                lines: vec![
                    ReportLine {
                        severity: Severity::Error,
                        text: ReportKind::Runtime.header().to_string(),
                    },
                    ReportLine {
                        severity: Severity::Error,
                        text: "session worker aborted".to_string(),
                    },
                ],
                dump: None,
            };
            self.session.finish(ExecutionOutcome::Failed(report));
        }
        if let Some(terminal) = &self.terminal {
            terminal.release(self.session.id());
        }
        self.session.advance(SessionState::TornDown);
        log::debug!("session {} torn down", self.session.id());
    }
}

/// Streams of one running session.
struct SessionIo {
    input: SessionInput,
    output: SessionOutput,
}

impl SessionIo {
    fn notice(&self, text: &str) {
        let mut out = self.output.borrow_mut();
        if let Err(e) = writeln!(out, "{}", text).and_then(|_| out.flush()) {
            log::warn!("could not write notice: {}", e);
        }
    }
}

/// Result of running the chunk and `main`.
enum Step {
    Done,
    Interrupted,
    Failed(mlua::Error),
}

impl From<mlua::Result<()>> for Step {
    fn from(result: mlua::Result<()>) -> Self {
        match result {
            Ok(()) => Step::Done,
            Err(e) if is_interrupt(&e) => Step::Interrupted,
            Err(e) => Step::Failed(e),
        }
    }
}

// ============================================================================
// Engine
// ============================================================================

#[derive(Clone)]
pub struct SandboxEngine {
    registry: Arc<CapabilityRegistry>,
    host: Arc<Host>,
    config: SandboxConfig,
    reporter: Reporter,
    binders: Vec<Arc<dyn SessionBinder>>,
}

impl SandboxEngine {
    pub fn new(registry: Arc<CapabilityRegistry>, host: Arc<Host>, config: SandboxConfig) -> Self {
        let reporter = Reporter::new(config.report_line_limit, config.dump_prefix.clone(), config.color);
        Self {
            registry,
            host,
            config,
            reporter,
            binders: vec![Arc::new(HostBinder)],
        }
    }

    /// Add a binder whose functions every later session gets.
    pub fn with_binder(mut self, binder: impl SessionBinder + 'static) -> Self {
        self.binders.push(Arc::new(binder));
        self
    }

    pub fn registry(&self) -> &Arc<CapabilityRegistry> {
        &self.registry
    }

    pub fn host(&self) -> &Arc<Host> {
        &self.host
    }

    pub fn config(&self) -> &SandboxConfig {
        &self.config
    }

    /// Start a session on its own worker thread.
    ///
    /// Returns `None` if the request's terminal already runs a session or the
    /// worker could not be started.
    pub fn spawn(&self, request: ScriptRequest) -> Option<SessionHandle> {
        let session = SessionHandle::new(request.mode);
        if let Some(terminal) = &request.terminal {
            if !terminal.try_claim(&session) {
                log::debug!("terminal busy, session {} not started", session.id());
                return None;
            }
        }

        let engine = self.clone();
        let worker = session.clone();
        let terminal = request.terminal.clone();
        let spawned = std::thread::Builder::new()
            .name(format!("lua-session-{}", session.id()))
            .spawn(move || engine.execute(&worker, request));

        match spawned {
            Ok(_) => {
                log::debug!("session {} spawned", session.id());
                Some(session)
            }
            Err(e) => {
                log::error!("failed to start session {}: {}", session.id(), e);
                // The request died with the closure; close the session here.
                drop(SessionScope {
                    session: &session,
                    terminal,
                });
                None
            }
        }
    }

    /// Run a session to completion on the current thread.
    pub fn run(&self, request: ScriptRequest) -> SessionHandle {
        let session = SessionHandle::new(request.mode);
        if let Some(terminal) = &request.terminal {
            if !terminal.try_claim(&session) {
                log::debug!("terminal busy, session {} runs without claiming it", session.id());
            }
        }
        self.execute(&session, request);
        session
    }

    /// Start `source` on `terminal` in privileged mode. False if the terminal
    /// is busy.
    pub fn exec(&self, source: &str, terminal: &Terminal, args: &str) -> bool {
        let request = ScriptRequest::text(source)
            .with_args(args)
            .with_mode(Mode::Privileged)
            .on_terminal(terminal.clone());
        self.spawn(request).is_some()
    }

    /// Start the program stored at `path` under the data directory. False if
    /// it cannot be opened or the terminal is busy.
    pub fn exec_file(&self, path: &str, terminal: &Terminal, args: &str) -> bool {
        let Some(full) = self.data_path(path) else {
            log::debug!("refused program path '{}'", path);
            return false;
        };
        let file = match std::fs::File::open(&full) {
            Ok(f) => f,
            Err(e) => {
                log::debug!("cannot open program {}: {}", full.display(), e);
                return false;
            }
        };
        log::debug!("executing {}", full.display());
        let name = full
            .file_name()
            .map(|n| n.to_string_lossy().into_owned())
            .unwrap_or_else(|| "program".to_string());
        let request = ScriptRequest::stream(file)
            .named(name)
            .with_args(args)
            .with_mode(Mode::Privileged)
            .on_terminal(terminal.clone());
        self.spawn(request).is_some()
    }

    /// `path` under the data directory; `None` if it would escape it.
    fn data_path(&self, path: &str) -> Option<PathBuf> {
        let relative = Path::new(path.trim_start_matches('/'));
        if relative.as_os_str().is_empty()
            || relative.components().any(|c| !matches!(c, Component::Normal(_)))
        {
            return None;
        }
        Some(self.config.data_dir.join(relative))
    }

    // ========================================================================
    // Session body
    // ========================================================================

    fn execute(&self, session: &SessionHandle, request: ScriptRequest) {
        let ScriptRequest {
            source,
            name,
            args,
            mode,
            terminal,
            input,
            output,
        } = request;

        let _scope = SessionScope {
            session,
            terminal: terminal.clone(),
        };
        log::debug!("session {} starting ({} mode)", session.id(), mode);

        let input: Box<dyn Read + Send> = match (input, &terminal) {
            (Some(input), _) => input,
            (None, Some(t)) => Box::new(t.input()),
            (None, None) => Box::new(io::empty()),
        };
        let output: Box<dyn Write + Send> = match (output, &terminal) {
            (Some(output), _) => output,
            (None, Some(t)) => Box::new(t.writer()),
            (None, None) => Box::new(io::sink()),
        };
        let io = SessionIo {
            input: Rc::new(RefCell::new(input)),
            output: Rc::new(RefCell::new(output)),
        };

        let outcome = match create_vm(mode) {
            Ok(lua) => {
                let lua_version = lua
                    .globals()
                    .get::<String>("_VERSION")
                    .unwrap_or_else(|_| "Lua".to_string());
                let mut guard = ResourceGuard::new(SessionResources::new(
                    session.id(),
                    self.host.clone(),
                    terminal.clone(),
                ));
                let outcome = self.drive(
                    session,
                    &lua,
                    &mut guard,
                    source,
                    &name,
                    &args,
                    &io,
                    terminal.as_ref(),
                    &lua_version,
                );
                guard.release();
                lua.remove_hook();
                outcome
            }
            Err(e) => {
                let _guard = ResourceGuard::new(SessionResources::new(
                    session.id(),
                    self.host.clone(),
                    terminal.clone(),
                ));
                let report = self.report(session, Failure::Setup(e.into()), &io, terminal.as_ref(), "Lua");
                ExecutionOutcome::Failed(report)
            }
        };

        log::debug!("session {} finished: {}", session.id(), outcome.state());
        session.finish(outcome);
    }

    #[allow(clippy::too_many_arguments)]
    fn drive(
        &self,
        session: &SessionHandle,
        lua: &Lua,
        guard: &mut ResourceGuard,
        source: ScriptSource,
        name: &str,
        args: &str,
        io: &SessionIo,
        terminal: Option<&Terminal>,
        lua_version: &str,
    ) -> ExecutionOutcome {
        let fail = |failure: Failure| {
            ExecutionOutcome::Failed(self.report(session, failure, io, terminal, lua_version))
        };

        let namespace = match self.prepare(session, lua, guard, io) {
            Ok(ns) => ns,
            Err(e) => return fail(Failure::Setup(e)),
        };

        session.advance(SessionState::Compiling);
        let interrupt = session.interrupt().clone();
        let text = match source {
            ScriptSource::Text(text) => text,
            ScriptSource::Stream(mut reader) => {
                match read_source(&mut reader, &interrupt, self.config.poll_interval) {
                    Ok(text) => text,
                    Err(SourceError::Interrupted) => {
                        io.notice(PARSE_TERMINATED);
                        return ExecutionOutcome::Interrupted;
                    }
                    Err(SourceError::Io(e)) => return fail(Failure::Setup(SandboxError::Io(e))),
                }
            }
        };

        let chunk = match lua
            .load(text)
            .set_name(format!("={}", name))
            .set_mode(ChunkMode::Text)
            .set_environment(namespace.env().clone())
            .into_function()
        {
            Ok(chunk) => chunk,
            Err(e) => return fail(Failure::Compile(e)),
        };
        log::debug!("session {} compiled '{}'", session.id(), name);

        install_hook(lua, &interrupt, self.config.hook_interval);
        session.advance(SessionState::Running);

        let mut outcome = match Step::from(run_body(&chunk, &namespace, args)) {
            Step::Done => ExecutionOutcome::Completed,
            Step::Interrupted => {
                io.notice(PROGRAM_TERMINATED);
                ExecutionOutcome::Interrupted
            }
            Step::Failed(e) => fail(Failure::Runtime(e)),
        };

        // A request that landed after the body's last hook check still
        // skips exit, and the run counts as interrupted.
        if interrupt.terminated() {
            if outcome.is_completed() {
                io.notice(PROGRAM_TERMINATED);
                outcome = ExecutionOutcome::Interrupted;
            }
            return outcome;
        }
        let exit = match namespace.entry_point("exit") {
            Ok(exit) => exit,
            Err(e) => {
                log::debug!("session {}: exit lookup failed: {}", session.id(), e);
                None
            }
        };
        if let Some(exit) = exit {
            match Step::from(exit.call::<()>(())) {
                Step::Done => {}
                Step::Interrupted => {
                    io.notice(EXIT_TERMINATED);
                    if outcome.is_completed() {
                        outcome = ExecutionOutcome::Interrupted;
                    }
                }
                Step::Failed(e) => {
                    let report = fail(Failure::Runtime(e));
                    if outcome.is_completed() {
                        outcome = report;
                    }
                }
            }
        }
        outcome
    }

    /// Seed the pool and seal the namespace.
    fn prepare(
        &self,
        session: &SessionHandle,
        lua: &Lua,
        guard: &mut ResourceGuard,
        io: &SessionIo,
    ) -> Result<Namespace, SandboxError> {
        let mode = session.mode();
        let ctx = BindContext {
            session: session.id(),
            mode,
            resources: guard.shared(),
            interrupt: session.interrupt().clone(),
            input: io.input.clone(),
            output: io.output.clone(),
            poll: self.config.poll_interval,
        };

        let pool = guard.pool_mut();
        CoreBinder.bind(lua, &ctx, pool)?;
        pool.seed(lua, &self.registry.resolve(mode))?;
        for binder in &self.binders {
            binder.bind(lua, &ctx, pool)?;
        }

        let mut builder = NamespaceBuilder::new(mode);
        builder.bind_functions(pool.iter())?;
        builder.freeze(lua)
    }

    fn report(
        &self,
        session: &SessionHandle,
        failure: Failure,
        io: &SessionIo,
        terminal: Option<&Terminal>,
        lua_version: &str,
    ) -> ErrorReport {
        let dump = terminal.map(|t| {
            let cwd = t.current_directory();
            DumpTarget {
                dir: self.host.resolve_dir(&cwd),
                display_dir: cwd,
            }
        });
        let emitted = {
            let mut out = io.output.borrow_mut();
            self.reporter.emit(&failure, &mut **out, dump.as_ref(), lua_version)
        };
        let report = match emitted {
            Ok(report) => report,
            Err(e) => {
                log::warn!("session {}: could not write error report: {}", session.id(), e);
                classify(&failure)
            }
        };
        if self.config.debug {
            log::error!("session {}:\n{}", session.id(), report.text());
        }
        report
    }
}

/// A VM with only the libraries `mode` may see.
fn create_vm(mode: Mode) -> mlua::Result<Lua> {
    let mut libs = StdLib::STRING | StdLib::TABLE | StdLib::MATH | StdLib::UTF8;
    if mode == Mode::Privileged {
        libs |= StdLib::COROUTINE | StdLib::OS;
    }
    Lua::new_with(libs, LuaOptions::default())
}

/// Top-level chunk, then `main(args)` if the script defined one.
fn run_body(chunk: &Function, namespace: &Namespace, args: &str) -> mlua::Result<()> {
    chunk.call::<()>(())?;
    if let Some(main) = namespace.entry_point("main")? {
        main.call::<()>(args)?;
    }
    Ok(())
}
