//! Error classification and reporting.
//!
//! A failure is broken down into its causal layers, one `Caused by:` section
//! per layer, and emitted to the session output with a severity per line.
//! Runtime reports longer than the line limit are written to a dump file in
//! the session's working directory instead, and only a short notice naming
//! the file is shown.

use std::fmt;
use std::fs::OpenOptions;
use std::io::{self, Write};
use std::path::{Path, PathBuf};

use crate::error::{InvocationError, SandboxError};

/// Deepest cause chain a breakdown follows.
const MAX_CAUSE_DEPTH: usize = 16;

/// Dump file numbers tried before giving up.
const MAX_DUMP_FILES: u32 = 10_000;

const YELLOW: &str = "\x1b[33m";
const RED: &str = "\x1b[31m";
const RESET: &str = "\x1b[0m";

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Severity {
    Warning,
    Error,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ReportKind {
    Compile,
    Runtime,
    Setup,
}

impl ReportKind {
    pub fn header(self) -> &'static str {
        match self {
            ReportKind::Compile => "lua: compile error",
            ReportKind::Runtime => "lua: runtime error",
            ReportKind::Setup => "lua: setup error",
        }
    }

    fn severity(self) -> Severity {
        match self {
            ReportKind::Compile => Severity::Warning,
            ReportKind::Runtime | ReportKind::Setup => Severity::Error,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ReportLine {
    pub severity: Severity,
    pub text: String,
}

/// A formatted failure, as shown (or dumped) to the user.
#[derive(Debug, Clone)]
pub struct ErrorReport {
    pub kind: ReportKind,
    pub lines: Vec<ReportLine>,
    /// Set when the report went to a dump file instead of the output.
    pub dump: Option<PathBuf>,
}

impl ErrorReport {
    pub fn line_count(&self) -> usize {
        self.lines.len()
    }

    pub fn text(&self) -> String {
        self.lines
            .iter()
            .map(|l| l.text.as_str())
            .collect::<Vec<_>>()
            .join("\n")
    }
}

impl fmt::Display for ErrorReport {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.text())
    }
}

/// Raw failure handed to the reporter.
#[derive(Debug)]
pub enum Failure {
    Compile(mlua::Error),
    Runtime(mlua::Error),
    Setup(SandboxError),
}

impl Failure {
    pub fn kind(&self) -> ReportKind {
        match self {
            Failure::Compile(_) => ReportKind::Compile,
            Failure::Runtime(_) => ReportKind::Runtime,
            Failure::Setup(_) => ReportKind::Setup,
        }
    }
}

// ============================================================================
// Breakdown
// ============================================================================

/// Split a Lua error into causal layers, outermost first, plus the first
/// stack traceback found along the way.
///
/// Callback layers only contribute their traceback. An [`InvocationError`]
/// is unwrapped once: its function name prefixes the real cause's message.
pub fn breakdown(err: &mlua::Error) -> (Vec<String>, Option<String>) {
    let mut layers = Vec::new();
    let mut traceback = None;
    let mut function: Option<&str> = None;
    let mut current = err;

    for _ in 0..MAX_CAUSE_DEPTH {
        let message = match current {
            mlua::Error::CallbackError { traceback: tb, cause } => {
                if traceback.is_none() {
                    traceback = Some(tb.clone());
                }
                current = cause.as_ref();
                continue;
            }
            mlua::Error::WithContext { context, cause } => {
                layers.push(context.clone());
                current = cause.as_ref();
                continue;
            }
            mlua::Error::ExternalError(inner) => {
                if let Some(invocation) = inner.downcast_ref::<InvocationError>() {
                    if function.is_none() {
                        function = Some(invocation.function.as_str());
                        current = &invocation.source;
                        continue;
                    }
                }
                if let Some(lua_err) = inner.downcast_ref::<mlua::Error>() {
                    current = lua_err;
                    continue;
                }
                push_external_chain(&mut layers, inner.as_ref(), function.take());
                break;
            }
            mlua::Error::RuntimeError(msg) => msg.clone(),
            mlua::Error::SyntaxError { message, .. } => message.clone(),
            other => other.to_string(),
        };
        match function.take() {
            Some(name) => layers.push(format!("{}: {}", name, message)),
            None => layers.push(message),
        }
        break;
    }

    (layers, traceback)
}

fn push_external_chain(
    layers: &mut Vec<String>,
    err: &(dyn std::error::Error + 'static),
    function: Option<&str>,
) {
    match function {
        Some(name) => layers.push(format!("{}: {}", name, err)),
        None => layers.push(err.to_string()),
    }
    let mut source = err.source();
    while let Some(cause) = source {
        if layers.len() >= MAX_CAUSE_DEPTH {
            break;
        }
        layers.push(cause.to_string());
        source = cause.source();
    }
}

fn setup_layers(err: &SandboxError) -> Vec<String> {
    if let SandboxError::Lua(lua_err) = err {
        let (mut layers, _) = breakdown(lua_err);
        layers.insert(0, "Lua setup failed".to_string());
        return layers;
    }
    let mut layers = Vec::new();
    push_external_chain(&mut layers, err, None);
    layers
}

/// Report lines for `failure`, header first.
pub fn classify(failure: &Failure) -> ErrorReport {
    let kind = failure.kind();
    let (layers, traceback) = match failure {
        Failure::Compile(e) | Failure::Runtime(e) => breakdown(e),
        Failure::Setup(e) => (setup_layers(e), None),
    };

    let severity = kind.severity();
    let mut lines = vec![ReportLine {
        severity,
        text: kind.header().to_string(),
    }];
    for (i, layer) in layers.iter().enumerate() {
        for (j, text) in layer.lines().enumerate() {
            let text = if i > 0 && j == 0 {
                format!("Caused by: {}", text)
            } else {
                text.to_string()
            };
            lines.push(ReportLine { severity, text });
        }
    }
    if let Some(tb) = traceback {
        let already_listed = layers.iter().any(|l| l.contains(tb.as_str()));
        if !already_listed {
            lines.extend(tb.lines().map(|text| ReportLine {
                severity,
                text: text.to_string(),
            }));
        }
    }

    ErrorReport {
        kind,
        lines,
        dump: None,
    }
}

// ============================================================================
// Reporter
// ============================================================================

/// Where oversized reports go: `dir` on the host, shown to the user as
/// `display_dir`.
#[derive(Debug, Clone)]
pub struct DumpTarget {
    pub dir: PathBuf,
    pub display_dir: String,
}

#[derive(Debug, Clone)]
pub struct Reporter {
    line_limit: usize,
    dump_prefix: String,
    color: bool,
}

impl Reporter {
    pub fn new(line_limit: usize, dump_prefix: impl Into<String>, color: bool) -> Self {
        Self {
            line_limit,
            dump_prefix: dump_prefix.into(),
            color,
        }
    }

    /// Classify `failure` and write it out.
    ///
    /// Oversized runtime reports go to a fresh dump file when `dump` is
    /// given; otherwise everything is written inline. I/O failures are
    /// returned to the caller, who must still tear the session down.
    pub fn emit(
        &self,
        failure: &Failure,
        out: &mut dyn Write,
        dump: Option<&DumpTarget>,
        lua_version: &str,
    ) -> io::Result<ErrorReport> {
        let mut report = classify(failure);

        let oversized = report.kind == ReportKind::Runtime && report.line_count() > self.line_limit;
        if let (true, Some(target)) = (oversized, dump) {
            let (path, name) = self.write_dump(&report, &target.dir, lua_version)?;
            let shown = format!("{}/{}", target.display_dir.trim_end_matches('/'), name);
            self.write_line(out, Severity::Error, "lua: stack trace too large!")?;
            self.write_line(out, Severity::Error, &format!("lua: dumped: {}", shown))?;
            log::debug!("dumped {} line report to {}", report.line_count(), path.display());
            report.dump = Some(path);
        } else {
            for line in &report.lines {
                self.write_line(out, line.severity, &line.text)?;
            }
        }
        out.flush()?;
        Ok(report)
    }

    fn write_line(&self, out: &mut dyn Write, severity: Severity, text: &str) -> io::Result<()> {
        if self.color {
            let color = match severity {
                Severity::Warning => YELLOW,
                Severity::Error => RED,
            };
            writeln!(out, "{}{}{}", color, text, RESET)
        } else {
            writeln!(out, "{}", text)
        }
    }

    /// Create `<prefix><n>` with the first free `n` and write the report.
    fn write_dump(
        &self,
        report: &ErrorReport,
        dir: &Path,
        lua_version: &str,
    ) -> io::Result<(PathBuf, String)> {
        std::fs::create_dir_all(dir)?;
        for n in 0..MAX_DUMP_FILES {
            let name = format!("{}{}", self.dump_prefix, n);
            let path = dir.join(&name);
            let mut file = match OpenOptions::new().write(true).create_new(true).open(&path) {
                Ok(f) => f,
                Err(e) if e.kind() == io::ErrorKind::AlreadyExists => continue,
                Err(e) => return Err(e),
            };
            write!(
                file,
                "Lua stack trace from {}\nLua version: {}\n\n",
                chrono::Local::now().format("%Y-%m-%d %H:%M:%S"),
                lua_version
            )?;
            for line in &report.lines {
                writeln!(file, "{}", line.text.replace('\t', "    "))?;
            }
            file.flush()?;
            return Ok((path, name));
        }
        Err(io::Error::new(
            io::ErrorKind::AlreadyExists,
            format!("no free dump file name in {}", dir.display()),
        ))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::terminal::SharedBuffer;
    use mlua::Lua;
    use tempfile::TempDir;

    fn runtime_error(lua: &Lua, src: &str) -> mlua::Error {
        lua.load(src).set_name("program").exec().unwrap_err()
    }

    fn plain() -> Reporter {
        Reporter::new(16, "lua_dump", false)
    }

    #[test]
    fn test_compile_error_is_warning() {
        let lua = Lua::new();
        let err = lua.load("x = = =").into_function().unwrap_err();
        let report = classify(&Failure::Compile(err));
        assert_eq!(report.kind, ReportKind::Compile);
        assert_eq!(report.lines[0].text, "lua: compile error");
        assert!(report.lines.iter().all(|l| l.severity == Severity::Warning));
        assert!(report.line_count() >= 2);
    }

    #[test]
    fn test_runtime_error_has_message() {
        let lua = Lua::new();
        let err = runtime_error(&lua, "error('boom')");
        let report = classify(&Failure::Runtime(err));
        assert_eq!(report.lines[0].text, "lua: runtime error");
        assert!(report.text().contains("boom"));
        assert!(report.lines.iter().all(|l| l.severity == Severity::Error));
    }

    #[test]
    fn test_invocation_layer_unwrapped_once() {
        let lua = Lua::new();
        let f = lua
            .create_function(|_, ()| -> mlua::Result<()> {
                Err(InvocationError::new(
                    "frame_get",
                    mlua::Error::RuntimeError("no frame with id 3".into()),
                )
                .into_lua())
            })
            .unwrap();
        lua.globals().set("frame_get", f).unwrap();
        let err = runtime_error(&lua, "frame_get()");
        let (layers, traceback) = breakdown(&err);
        assert_eq!(layers, vec!["frame_get: no frame with id 3".to_string()]);
        assert!(traceback.is_some());
    }

    #[test]
    fn test_context_layers_become_caused_by() {
        let inner = mlua::Error::RuntimeError("disk full".into());
        let err = mlua::Error::WithContext {
            context: "saving state".into(),
            cause: std::sync::Arc::new(inner),
        };
        let report = classify(&Failure::Runtime(err));
        let text = report.text();
        assert!(text.contains("saving state\nCaused by: disk full"), "{}", text);
    }

    #[test]
    fn test_self_referential_chain_is_capped() {
        let mut err = mlua::Error::RuntimeError("root".into());
        for i in 0..100 {
            err = mlua::Error::WithContext {
                context: format!("layer {}", i),
                cause: std::sync::Arc::new(err),
            };
        }
        let (layers, _) = breakdown(&err);
        assert!(layers.len() <= MAX_CAUSE_DEPTH);
    }

    #[test]
    fn test_setup_error_report() {
        let report = classify(&Failure::Setup(SandboxError::DuplicateBinding("print".into())));
        assert_eq!(report.kind, ReportKind::Setup);
        assert_eq!(report.lines[0].text, "lua: setup error");
        assert!(report.text().contains("global 'print' is bound more than once"));
    }

    #[test]
    fn test_short_report_inline() {
        let lua = Lua::new();
        let mut out = SharedBuffer::new();
        let dir = TempDir::new().unwrap();
        let target = DumpTarget {
            dir: dir.path().to_path_buf(),
            display_dir: "/".into(),
        };
        let report = plain()
            .emit(&Failure::Runtime(runtime_error(&lua, "error('short')")), &mut out, Some(&target), "Lua 5.4")
            .unwrap();
        assert!(report.dump.is_none());
        assert!(out.contents().starts_with("lua: runtime error\n"));
        assert!(out.contents().contains("short"));
        assert_eq!(std::fs::read_dir(dir.path()).unwrap().count(), 0);
    }

    #[test]
    fn test_long_report_dumped() {
        let lua = Lua::new();
        let err = runtime_error(
            &lua,
            "local function deep(n) if n == 0 then error('bottom') end return deep(n - 1) + 1 end deep(40)",
        );
        let dir = TempDir::new().unwrap();
        std::fs::write(dir.path().join("lua_dump0"), "taken").unwrap();
        let target = DumpTarget {
            dir: dir.path().to_path_buf(),
            display_dir: "/home/".into(),
        };
        let mut out = SharedBuffer::new();
        let report = plain()
            .emit(&Failure::Runtime(err), &mut out, Some(&target), "Lua 5.4")
            .unwrap();

        assert!(report.line_count() > 16);
        assert_eq!(report.dump, Some(dir.path().join("lua_dump1")));
        assert_eq!(
            out.contents(),
            "lua: stack trace too large!\nlua: dumped: /home/lua_dump1\n"
        );
        let dumped = std::fs::read_to_string(dir.path().join("lua_dump1")).unwrap();
        assert!(dumped.starts_with("Lua stack trace from "));
        assert!(dumped.contains("Lua version: Lua 5.4\n\n"));
        assert!(dumped.contains("bottom"));
        assert!(!dumped.contains('\t'));
        assert_eq!(std::fs::read_to_string(dir.path().join("lua_dump0")).unwrap(), "taken");
    }

    #[test]
    fn test_long_report_inline_without_dump_dir() {
        let lua = Lua::new();
        let err = runtime_error(
            &lua,
            "local function deep(n) if n == 0 then error('bottom') end return deep(n - 1) + 1 end deep(40)",
        );
        let mut out = SharedBuffer::new();
        let report = plain().emit(&Failure::Runtime(err), &mut out, None, "Lua 5.4").unwrap();
        assert!(report.dump.is_none());
        assert_eq!(out.contents().lines().count(), report.line_count());
    }

    #[test]
    fn test_color_codes() {
        let mut out = SharedBuffer::new();
        Reporter::new(16, "lua_dump", true)
            .emit(&Failure::Setup(SandboxError::DuplicateBundle("x".into())), &mut out, None, "Lua 5.4")
            .unwrap();
        assert!(out.contents().starts_with("\x1b[31mlua: setup error\x1b[0m\n"));
    }

    struct BrokenPipe;

    impl Write for BrokenPipe {
        fn write(&mut self, _buf: &[u8]) -> io::Result<usize> {
            Err(io::ErrorKind::BrokenPipe.into())
        }
        fn flush(&mut self) -> io::Result<()> {
            Ok(())
        }
    }

    #[test]
    fn test_write_failure_surfaces() {
        let err = plain()
            .emit(&Failure::Setup(SandboxError::DuplicateBundle("x".into())), &mut BrokenPipe, None, "Lua 5.4")
            .unwrap_err();
        assert_eq!(err.kind(), io::ErrorKind::BrokenPipe);
    }
}
