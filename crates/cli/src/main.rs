// consoles - run sandboxed Lua console programs against a headless host

mod exit_codes;

use std::fs::File;
use std::io::{self, BufRead};
use std::path::{Path, PathBuf};
use std::process::ExitCode;
use std::sync::Arc;
use std::time::Duration;

use clap::{Parser, Subcommand, ValueEnum};
use consoles_config::SandboxSettings;
use consoles_sandbox::{
    dispatch_line, CapabilityBundle, CapabilityRegistry, Host, HostFunction, Mode, SandboxConfig,
    SandboxEngine, ScriptRequest, SessionHandle, Terminal,
};

use exit_codes::{outcome_exit_code, EXIT_ERROR, EXIT_SUCCESS, EXIT_USAGE};

/// Name the console user is known by; it owns the terminal.
const CONSOLE_USER: &str = "console";

#[derive(Parser)]
#[command(name = "consoles")]
#[command(about = "Run sandboxed Lua console programs (headless host)")]
#[command(long_version = long_version())]
#[command(version)]
struct Cli {
    #[command(subcommand)]
    command: Commands,

    /// Settings file (defaults to the per-user sandbox.json)
    #[arg(long, global = true, env = "CONSOLES_CONFIG")]
    config: Option<PathBuf>,

    /// Disable ANSI colours in error reports
    #[arg(long, global = true)]
    no_color: bool,

    /// Log full error breakdowns
    #[arg(long, global = true)]
    debug: bool,
}

#[derive(Subcommand)]
enum Commands {
    /// Run a Lua program file
    #[command(after_help = "\
Examples:
  consoles run hello.lua
  consoles run game.lua 'level=3' --mode restricted
  echo 'quit' | consoles run repl.lua --timeout 5000")]
    Run {
        /// Program file
        file: PathBuf,

        /// Argument string handed to main()
        #[arg(default_value = "")]
        args: String,

        #[command(flatten)]
        session: SessionArgs,
    },

    /// Run an inline Lua program
    #[command(after_help = "\
Examples:
  consoles exec 'print(\"hi\")'
  consoles exec 'function main(a) print(a) end' 'hello'")]
    Exec {
        /// Program text
        code: String,

        /// Argument string handed to main()
        #[arg(default_value = "")]
        args: String,

        #[command(flatten)]
        session: SessionArgs,
    },

    /// List the capability bundles visible in a mode
    Libs {
        #[arg(long, value_enum, default_value = "privileged")]
        mode: ModeArg,
    },

    /// Show the settings file location and effective values
    Config {
        /// Write the default settings file if none exists
        #[arg(long)]
        init: bool,
    },
}

#[derive(clap::Args)]
struct SessionArgs {
    /// Execution mode
    #[arg(long, value_enum, default_value = "privileged")]
    mode: ModeArg,

    /// Host filesystem root that terminal directories map onto
    #[arg(long, default_value = ".")]
    root: PathBuf,

    /// Terminal working directory (relative to --root)
    #[arg(long, default_value = "/")]
    cwd: String,

    /// Terminate the program after this many milliseconds
    #[arg(long)]
    timeout: Option<u64>,
}

#[derive(Clone, Copy, ValueEnum)]
enum ModeArg {
    Restricted,
    Privileged,
}

impl From<ModeArg> for Mode {
    fn from(mode: ModeArg) -> Self {
        match mode {
            ModeArg::Restricted => Mode::Restricted,
            ModeArg::Privileged => Mode::Privileged,
        }
    }
}

fn long_version() -> &'static str {
    if cfg!(debug_assertions) {
        concat!(
            env!("CARGO_PKG_VERSION"),
            "\nsandbox: consoles-sandbox ", env!("CARGO_PKG_VERSION"),
            "\nvm:      Lua 5.4 (vendored)",
            "\nbuild:   debug",
        )
    } else {
        concat!(
            env!("CARGO_PKG_VERSION"),
            "\nsandbox: consoles-sandbox ", env!("CARGO_PKG_VERSION"),
            "\nvm:      Lua 5.4 (vendored)",
            "\nbuild:   release",
        )
    }
}

fn main() -> ExitCode {
    let cli = Cli::parse();
    init_logging(cli.debug);

    let result = match cli.command {
        Commands::Run { file, args, session } => {
            let settings = load_settings(cli.config.as_deref());
            cmd_run(file, args, session, config(&settings, cli.no_color, cli.debug))
        }
        Commands::Exec { code, args, session } => {
            let settings = load_settings(cli.config.as_deref());
            cmd_exec(code, args, session, config(&settings, cli.no_color, cli.debug))
        }
        Commands::Libs { mode } => cmd_libs(mode.into()),
        Commands::Config { init } => cmd_config(cli.config, init),
    };

    match result {
        Ok(()) => ExitCode::from(EXIT_SUCCESS),
        Err(CliError { code, message, hint }) => {
            if !message.is_empty() {
                eprintln!("error: {}", message);
            }
            if let Some(hint) = hint {
                eprintln!("hint:  {}", hint);
            }
            ExitCode::from(code)
        }
    }
}

#[derive(Debug)]
pub struct CliError {
    pub code: u8,
    pub message: String,
    pub hint: Option<String>,
}

impl CliError {
    pub fn usage(msg: impl Into<String>) -> Self {
        Self { code: EXIT_USAGE, message: msg.into(), hint: None }
    }

    pub fn general(msg: impl Into<String>) -> Self {
        Self { code: EXIT_ERROR, message: msg.into(), hint: None }
    }

    /// Exit code only; the session already printed its own report.
    pub fn silent(code: u8) -> Self {
        Self { code, message: String::new(), hint: None }
    }

    pub fn with_hint(mut self, hint: impl Into<String>) -> Self {
        self.hint = Some(hint.into());
        self
    }
}

// ============================================================================
// Setup
// ============================================================================

/// `log` records from the sandbox reach the fmt subscriber through the
/// tracing-log bridge. `RUST_LOG` overrides the default level.
fn init_logging(debug: bool) {
    use tracing_subscriber::EnvFilter;

    let default = if debug { "debug" } else { "warn" };
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(default));
    let _ = tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_writer(io::stderr)
        .try_init();
}

fn load_settings(path: Option<&Path>) -> SandboxSettings {
    match path {
        Some(path) => SandboxSettings::load_from(path),
        None => SandboxSettings::load(),
    }
}

fn config(settings: &SandboxSettings, no_color: bool, debug: bool) -> SandboxConfig {
    let mut config = SandboxConfig::from_settings(settings);
    if no_color {
        config.color = false;
    }
    config.debug |= debug;
    config
}

/// Bundles the console host publishes. `env` reads the process environment,
/// so restricted programs do not get it.
fn console_registry() -> Result<CapabilityRegistry, CliError> {
    let registry = CapabilityRegistry::new();

    let console = CapabilityBundle::new("console", false)
        .with_function(HostFunction::new("version", |_, ()| {
            Ok(env!("CARGO_PKG_VERSION").to_string())
        }))
        .with_function(HostFunction::new("platform", |_, ()| {
            Ok(std::env::consts::OS.to_string())
        }));

    let env = CapabilityBundle::new("env", true)
        .with_function(HostFunction::new("getenv", |_, name: String| {
            Ok(std::env::var(name).ok())
        }));

    for bundle in [console, env] {
        registry
            .register(bundle)
            .map_err(|e| CliError::general(e.to_string()))?;
    }
    Ok(registry)
}

// ============================================================================
// Commands
// ============================================================================

fn cmd_run(file: PathBuf, args: String, session: SessionArgs, config: SandboxConfig) -> Result<(), CliError> {
    let handle = File::open(&file).map_err(|e| {
        CliError::usage(format!("cannot open {}: {}", file.display(), e))
            .with_hint("the program path is resolved against the current directory")
    })?;
    let name = file
        .file_name()
        .map(|n| n.to_string_lossy().into_owned())
        .unwrap_or_else(|| "program".to_string());
    let request = ScriptRequest::stream(handle).named(name).with_args(args);
    run_session(request, session, config)
}

fn cmd_exec(code: String, args: String, session: SessionArgs, config: SandboxConfig) -> Result<(), CliError> {
    let request = ScriptRequest::text(code).with_args(args);
    run_session(request, session, config)
}

fn run_session(request: ScriptRequest, args: SessionArgs, config: SandboxConfig) -> Result<(), CliError> {
    if !args.root.is_dir() {
        return Err(CliError::usage(format!("root {} is not a directory", args.root.display())));
    }

    let registry = Arc::new(console_registry()?);
    let host = Arc::new(Host::headless(&args.root));
    let terminal = Terminal::new(host.clone(), Some(CONSOLE_USER.to_string()), io::stdout());
    terminal.set_current_directory(args.cwd);

    let engine = SandboxEngine::new(registry, host, config);
    let request = request.with_mode(args.mode.into()).on_terminal(terminal.clone());
    let Some(session) = engine.spawn(request) else {
        return Err(CliError::general("could not start the session"));
    };

    forward_stdin(terminal);
    let outcome = wait(&session, args.timeout.map(Duration::from_millis));
    log::debug!("session {} finished: {:?}", session.id(), session.history());

    match outcome_exit_code(outcome.as_ref()) {
        EXIT_SUCCESS => Ok(()),
        code => Err(CliError::silent(code)),
    }
}

/// Feed stdin to the terminal line by line; `^C` terminates the program.
/// End of input closes the terminal's input pipe.
fn forward_stdin(terminal: Terminal) {
    let spawned = std::thread::Builder::new()
        .name("stdin-forward".into())
        .spawn(move || {
            let stdin = io::stdin();
            for line in stdin.lock().lines() {
                match line {
                    Ok(line) => dispatch_line(&terminal, &line, CONSOLE_USER),
                    Err(e) => {
                        log::debug!("stdin closed: {}", e);
                        break;
                    }
                }
            }
            terminal.input().close();
        });
    if let Err(e) = spawned {
        log::warn!("stdin forwarding unavailable: {}", e);
    }
}

fn wait(session: &SessionHandle, timeout: Option<Duration>) -> Option<consoles_sandbox::ExecutionOutcome> {
    if let Some(timeout) = timeout {
        if let Some(outcome) = session.wait_timeout(timeout) {
            return Some(outcome);
        }
        log::debug!("session {} timed out after {:?}", session.id(), timeout);
        session.terminate();
    }
    session.wait()
}

fn cmd_libs(mode: Mode) -> Result<(), CliError> {
    let registry = console_registry()?;
    for bundle in registry.resolve(mode) {
        let marker = if bundle.is_restricted() { " (privileged only)" } else { "" };
        println!("{}{}", bundle.name(), marker);
        for function in bundle.functions() {
            println!("  {}", function.name());
        }
    }
    Ok(())
}

fn cmd_config(path: Option<PathBuf>, init: bool) -> Result<(), CliError> {
    let path = path.unwrap_or_else(SandboxSettings::config_path);
    if init && !path.exists() {
        SandboxSettings::default()
            .save_to(&path)
            .map_err(|e| CliError::general(format!("cannot write {}: {}", path.display(), e)))?;
    }

    let settings = SandboxSettings::load_from(&path);
    println!("path:          {}", path.display());
    println!("poll interval: {} ms", settings.poll_interval_ms);
    println!("hook interval: {} instructions", settings.hook_interval);
    println!("report limit:  {} lines", settings.report_line_limit);
    println!("dump prefix:   {}", settings.dump_prefix);
    println!("color:         {}", settings.color);
    println!("debug:         {}", settings.debug);
    println!("data dir:      {}", settings.effective_data_dir().display());
    Ok(())
}
