//! CLI Exit Code Registry
//!
//! Single source of truth for the exit codes of `consoles`. Scripts driving
//! the binary rely on them.
//!
//! # Exit Code Ranges
//!
//! | Range   | Domain     | Description                                  |
//! |---------|------------|----------------------------------------------|
//! | 0       | Universal  | Success (program completed)                  |
//! | 1       | Universal  | General error (unspecified)                  |
//! | 2       | Universal  | CLI usage error (bad args, missing file)     |
//! | 3-9     | session    | How the Lua session ended                    |
//!
//! # Adding New Exit Codes
//!
//! 1. Add the constant in the appropriate range
//! 2. Document what triggers it
//! 3. Update the table above
//! 4. Wire it into `outcome_exit_code` or the command's error handling

use consoles_sandbox::{ExecutionOutcome, ReportKind};

// =============================================================================
// Universal (0-2)
// =============================================================================

/// Success - the program ran to completion.
pub const EXIT_SUCCESS: u8 = 0;

/// General error - unspecified failure.
pub const EXIT_ERROR: u8 = 1;

/// Usage error - bad arguments, unreadable program file.
pub const EXIT_USAGE: u8 = 2;

// =============================================================================
// Session (3-9)
// =============================================================================

/// The program did not compile.
pub const EXIT_COMPILE: u8 = 3;

/// The program raised an error while running (body, `main` or `exit`).
pub const EXIT_RUNTIME: u8 = 4;

/// The session could not be set up (for example, colliding bindings).
pub const EXIT_SETUP: u8 = 5;

/// The program was terminated (`^C` on stdin or `--timeout`).
pub const EXIT_INTERRUPTED: u8 = 6;

/// The session ended without recording an outcome.
pub const EXIT_NO_OUTCOME: u8 = 7;

/// Map a finished session to its exit code.
pub fn outcome_exit_code(outcome: Option<&ExecutionOutcome>) -> u8 {
    match outcome {
        Some(ExecutionOutcome::Completed) => EXIT_SUCCESS,
        Some(ExecutionOutcome::Interrupted) => EXIT_INTERRUPTED,
        Some(ExecutionOutcome::Failed(report)) => match report.kind {
            ReportKind::Compile => EXIT_COMPILE,
            ReportKind::Runtime => EXIT_RUNTIME,
            ReportKind::Setup => EXIT_SETUP,
        },
        None => EXIT_NO_OUTCOME,
    }
}
