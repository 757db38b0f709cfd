// Integration tests for the `consoles` binary.
// Run with: cargo test -p consoles-cli --test cli_tests -- --nocapture

use std::io::Write;
use std::path::Path;
use std::process::{Command, Output, Stdio};

use tempfile::TempDir;

/// Every run points --config at a file that does not exist, so the user's own
/// settings never leak into the tests.
fn consoles(config_dir: &TempDir) -> Command {
    let mut cmd = Command::new(env!("CARGO_BIN_EXE_consoles"));
    cmd.arg("--config")
        .arg(config_dir.path().join("sandbox.json"))
        .arg("--no-color")
        .env_remove("RUST_LOG")
        .env_remove("CONSOLES_CONFIG");
    cmd
}

fn stdout(output: &Output) -> String {
    String::from_utf8_lossy(&output.stdout).into_owned()
}

fn describe(output: &Output) -> String {
    format!(
        "exit code: {:?}\nstdout: {}\nstderr: {}",
        output.status,
        String::from_utf8_lossy(&output.stdout),
        String::from_utf8_lossy(&output.stderr)
    )
}

fn write_program(dir: &Path, name: &str, source: &str) -> std::path::PathBuf {
    let path = dir.join(name);
    std::fs::write(&path, source).unwrap();
    path
}

// ---------------------------------------------------------------------------
// exec
// ---------------------------------------------------------------------------

#[test]
fn exec_prints_and_succeeds() {
    let dir = TempDir::new().unwrap();
    let output = consoles(&dir)
        .args(["exec", "print('hello', 42)"])
        .output()
        .expect("consoles exec");

    assert!(output.status.success(), "{}", describe(&output));
    assert!(stdout(&output).contains("hello\t42"), "{}", describe(&output));
}

#[test]
fn exec_passes_arguments_to_main_then_runs_exit() {
    let dir = TempDir::new().unwrap();
    let program = "function main(a) print('main:' .. a) end\nfunction exit() print('exit') end";
    let output = consoles(&dir)
        .args(["exec", program, "level=3"])
        .output()
        .expect("consoles exec");

    assert!(output.status.success(), "{}", describe(&output));
    let out = stdout(&output);
    let main_at = out.find("main:level=3").expect("main ran");
    let exit_at = out.find("exit\n").expect("exit ran");
    assert!(main_at < exit_at);
}

#[test]
fn exec_runtime_error_exit_code() {
    let dir = TempDir::new().unwrap();
    let output = consoles(&dir)
        .args(["exec", "error('boom')"])
        .output()
        .expect("consoles exec");

    assert_eq!(output.status.code(), Some(4), "{}", describe(&output));
    let out = stdout(&output);
    assert!(out.contains("lua: runtime error"), "{}", describe(&output));
    assert!(out.contains("boom"), "{}", describe(&output));
}

#[test]
fn exec_compile_error_exit_code() {
    let dir = TempDir::new().unwrap();
    let output = consoles(&dir)
        .args(["exec", "print("])
        .output()
        .expect("consoles exec");

    assert_eq!(output.status.code(), Some(3), "{}", describe(&output));
    assert!(stdout(&output).contains("lua: compile error"), "{}", describe(&output));
}

#[test]
fn exec_timeout_terminates_program() {
    let dir = TempDir::new().unwrap();
    let output = consoles(&dir)
        .args(["exec", "while true do end", "--timeout", "200"])
        .output()
        .expect("consoles exec");

    assert_eq!(output.status.code(), Some(6), "{}", describe(&output));
    assert!(stdout(&output).contains("Program terminated"), "{}", describe(&output));
}

#[test]
fn exec_restricted_mode_hides_env_bundle() {
    let dir = TempDir::new().unwrap();
    let probe = "print(type(getenv), type(version), type(load))";

    let restricted = consoles(&dir)
        .args(["exec", probe, "--mode", "restricted"])
        .output()
        .expect("consoles exec");
    assert!(restricted.status.success(), "{}", describe(&restricted));
    assert!(stdout(&restricted).contains("nil\tfunction\tnil"), "{}", describe(&restricted));

    let privileged = consoles(&dir)
        .args(["exec", probe])
        .output()
        .expect("consoles exec");
    assert!(privileged.status.success(), "{}", describe(&privileged));
    assert!(stdout(&privileged).contains("function\tfunction\tnil"), "{}", describe(&privileged));
}

#[test]
fn exec_reads_lines_from_stdin() {
    let dir = TempDir::new().unwrap();
    let mut child = consoles(&dir)
        .args(["exec", "local name = read_line() print('hi ' .. name) print(read_line())"])
        .stdin(Stdio::piped())
        .stdout(Stdio::piped())
        .stderr(Stdio::piped())
        .spawn()
        .expect("consoles exec");

    {
        let mut stdin = child.stdin.take().unwrap();
        stdin.write_all(b"alice\n").unwrap();
    }
    let output = child.wait_with_output().unwrap();

    assert!(output.status.success(), "{}", describe(&output));
    let out = stdout(&output);
    assert!(out.contains("hi alice"), "{}", describe(&output));
    assert!(out.contains("nil"), "{}", describe(&output));
}

#[test]
fn exec_control_c_on_stdin_interrupts() {
    let dir = TempDir::new().unwrap();
    let mut child = consoles(&dir)
        .args(["exec", "while true do sleep(10) end"])
        .stdin(Stdio::piped())
        .stdout(Stdio::piped())
        .stderr(Stdio::piped())
        .spawn()
        .expect("consoles exec");

    {
        let mut stdin = child.stdin.take().unwrap();
        stdin.write_all(b"^C\n").unwrap();
    }
    let output = child.wait_with_output().unwrap();

    assert_eq!(output.status.code(), Some(6), "{}", describe(&output));
}

#[test]
fn exec_oversized_report_is_dumped_under_root() {
    let dir = TempDir::new().unwrap();
    std::fs::write(
        dir.path().join("sandbox.json"),
        r#"{ "report.lineLimit": 1, "report.color": false }"#,
    )
    .unwrap();

    let output = consoles(&dir)
        .args(["exec", "error('deep trouble')", "--root"])
        .arg(dir.path())
        .output()
        .expect("consoles exec");

    assert_eq!(output.status.code(), Some(4), "{}", describe(&output));
    assert!(stdout(&output).contains("lua: stack trace too large!"), "{}", describe(&output));
    let dump = std::fs::read_to_string(dir.path().join("lua_dump0")).unwrap();
    assert!(dump.starts_with("Lua stack trace from "));
    assert!(dump.contains("deep trouble"));
}

// ---------------------------------------------------------------------------
// run
// ---------------------------------------------------------------------------

#[test]
fn run_program_file() {
    let dir = TempDir::new().unwrap();
    let program = write_program(
        dir.path(),
        "count.lua",
        "function main(a)\n  for i = 1, tonumber(a) do write(i, ' ') end\n  print()\nend\n",
    );

    let output = consoles(&dir)
        .arg("run")
        .arg(&program)
        .arg("3")
        .output()
        .expect("consoles run");

    assert!(output.status.success(), "{}", describe(&output));
    assert!(stdout(&output).contains("1 2 3"), "{}", describe(&output));
}

#[test]
fn run_reports_errors_with_file_name() {
    let dir = TempDir::new().unwrap();
    let program = write_program(dir.path(), "broken.lua", "local x = 1\nerror('nope')\n");

    let output = consoles(&dir)
        .arg("run")
        .arg(&program)
        .output()
        .expect("consoles run");

    assert_eq!(output.status.code(), Some(4), "{}", describe(&output));
    assert!(stdout(&output).contains("broken.lua:2"), "{}", describe(&output));
}

#[test]
fn run_missing_file_is_usage_error() {
    let dir = TempDir::new().unwrap();
    let output = consoles(&dir)
        .arg("run")
        .arg(dir.path().join("missing.lua"))
        .output()
        .expect("consoles run");

    assert_eq!(output.status.code(), Some(2), "{}", describe(&output));
    assert!(String::from_utf8_lossy(&output.stderr).contains("cannot open"));
}

// ---------------------------------------------------------------------------
// libs / config
// ---------------------------------------------------------------------------

#[test]
fn libs_lists_bundles_per_mode() {
    let dir = TempDir::new().unwrap();

    let all = consoles(&dir).arg("libs").output().expect("consoles libs");
    assert!(all.status.success(), "{}", describe(&all));
    let out = stdout(&all);
    assert!(out.contains("console\n"));
    assert!(out.contains("env (privileged only)"));
    assert!(out.contains("  getenv"));

    let restricted = consoles(&dir)
        .args(["libs", "--mode", "restricted"])
        .output()
        .expect("consoles libs");
    assert!(restricted.status.success(), "{}", describe(&restricted));
    let out = stdout(&restricted);
    assert!(out.contains("  version"));
    assert!(!out.contains("getenv"));
}

#[test]
fn config_init_writes_defaults() {
    let dir = TempDir::new().unwrap();
    let output = consoles(&dir)
        .args(["config", "--init"])
        .output()
        .expect("consoles config");

    assert!(output.status.success(), "{}", describe(&output));
    assert!(dir.path().join("sandbox.json").exists());
    assert!(stdout(&output).contains("report limit:  16 lines"), "{}", describe(&output));
}
