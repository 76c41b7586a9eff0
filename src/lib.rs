//! Declarative tests for executables.
//!
//! A *scheme* describes one run of a program: the files to create, the
//! arguments, environment and stdin to pass, and the stdout, stderr and exit
//! code to expect.
//!
//! ```no_run
//! #[test]
//! fn ls_lists_hidden_files() {
//!     exectest::execute(
//!         "ls",
//!         "
//! --file:a.txt
//! --file:.b.txt
//! --arg:-a
//! --env:LC_ALL=C
//! --stdout
//! .
//! ..
//! .b.txt
//! a.txt
//! ",
//!     );
//! }
//! ```
//!
//! Each run gets its own fixture root; `{dir}` in arguments, env entries,
//! file bodies and expected output is replaced by its absolute path.

pub mod check;
pub mod config;
pub mod exec;
pub mod fixture;
pub mod harness;
pub mod lines;
pub mod runner;
pub mod scheme;
pub mod vars;

pub use exec::Invocation;
pub use harness::{CmdOption, Harness, HarnessError, Report};
pub use scheme::{Strictness, TestPlan};

use std::path::Path;

/// Run `scheme` against `program`, panicking with a diagnostic on failure.
#[track_caller]
pub fn execute(program: impl AsRef<Path>, scheme: &str) {
    execute_with(program, scheme, &[]);
}

/// Like [`execute`], applying `options` to the process before it starts.
#[track_caller]
pub fn execute_with(program: impl AsRef<Path>, scheme: &str, options: &[&CmdOption]) {
    let outcome = Harness::new().run(program, scheme, options);
    assert_passed(outcome, scheme);
}

/// Like [`execute`], reading the scheme from `path`.
#[track_caller]
pub fn execute_for_file(program: impl AsRef<Path>, path: impl AsRef<Path>) {
    execute_for_file_with(program, path, &[]);
}

/// Like [`execute_for_file`], applying `options` to the process before it
/// starts.
#[track_caller]
pub fn execute_for_file_with(
    program: impl AsRef<Path>,
    path: impl AsRef<Path>,
    options: &[&CmdOption],
) {
    let path = path.as_ref();
    match Harness::new().run_file(program, path, options) {
        Ok(report) if report.passed() => {}
        Ok(report) => panic!("{report}"),
        Err(e) => panic!("{e}"),
    }
}

#[track_caller]
fn assert_passed(outcome: Result<Report, HarnessError>, scheme: &str) {
    match outcome {
        Ok(report) if report.passed() => {}
        Ok(report) => panic!("{report}"),
        Err(e) => panic!("{e}\nTest scheme:\n{scheme}"),
    }
}
