//! Assertion engine.
//!
//! Compares what the plan expects with what the process did. The exit code,
//! stdout and stderr checks are independent: all of them always run and every
//! divergence is reported.
//!
//! Output is compared as raw bytes. Text is only decoded to render a diff.

use crate::exec::ExecutionResult;
use crate::lines;
use crate::scheme::TestPlan;
use serde::Serialize;
use similar::{Algorithm, DiffTag};
use std::fmt::{self, Write as _};
use thiserror::Error;

/// Unchanged lines shown around each difference.
const CONTEXT_LINES: usize = 3;

/// Exit code a signal-terminated process is reported to have.
pub const KILLED_EXIT_CODE: i32 = -1;

/// An output stream of the child.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum Stream {
    Stdout,
    Stderr,
}

impl fmt::Display for Stream {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Stream::Stdout => f.write_str("stdout"),
            Stream::Stderr => f.write_str("stderr"),
        }
    }
}

/// One divergence between expectation and reality.
#[derive(Debug, Clone, PartialEq, Eq, Error, Serialize)]
pub enum Mismatch {
    #[error("Failed to match return code: want {want}, got {got}")]
    ReturnCode { want: i32, got: i32 },
    #[error("Failed to match return code: want {want}, but the process was terminated by signal {signal}")]
    Signal { want: i32, signal: i32 },
    #[error("Failed to match return code: want {want}, but the process reported none")]
    NoExitCode { want: i32 },
    #[error("Failed matching {stream} (-missing line, +extra line):\n{diff}")]
    Output { stream: Stream, diff: String },
    #[error("Failed reading {stream}: {reason}")]
    Unreadable { stream: Stream, reason: String },
}

impl Mismatch {
    /// The stream this mismatch is about, if any.
    pub fn stream(&self) -> Option<Stream> {
        match self {
            Mismatch::Output { stream, .. } | Mismatch::Unreadable { stream, .. } => Some(*stream),
            _ => None,
        }
    }
}

/// Run every check of `plan` against `result`.
pub fn check(plan: &TestPlan, result: &ExecutionResult) -> Vec<Mismatch> {
    let mut mismatches = Vec::new();
    mismatches.extend(check_return_code(plan.return_code, result));
    mismatches.extend(check_stream(Stream::Stdout, &plan.stdout, &result.stdout));
    mismatches.extend(check_stream(Stream::Stderr, &plan.stderr, &result.stderr));
    mismatches
}

/// Compare the exit code. A process without one counts as
/// [`KILLED_EXIT_CODE`].
pub fn check_return_code(want: i32, result: &ExecutionResult) -> Option<Mismatch> {
    match (result.exit_code, result.signal) {
        (Some(got), _) if got == want => None,
        (Some(got), _) => Some(Mismatch::ReturnCode { want, got }),
        (None, _) if want == KILLED_EXIT_CODE => None,
        (None, Some(signal)) => Some(Mismatch::Signal { want, signal }),
        (None, None) => Some(Mismatch::NoExitCode { want }),
    }
}

/// Compare `want` and `got` line by line.
pub fn check_stream(stream: Stream, want: &[u8], got: &[u8]) -> Option<Mismatch> {
    let unreadable = |e: lines::LineError| Mismatch::Unreadable {
        stream,
        reason: e.to_string(),
    };
    let want = match lines::split(want) {
        Ok(lines) => lines,
        Err(e) => return Some(unreadable(e)),
    };
    let got = match lines::split(got) {
        Ok(lines) => lines,
        Err(e) => return Some(unreadable(e)),
    };
    line_diff(&want, &got).map(|diff| Mismatch::Output { stream, diff })
}

/// Render the difference between two line sequences as unified-diff hunks,
/// or `None` when they are equal.
///
/// Lines are expected to carry their terminator, as produced by
/// [`lines::split`].
pub fn line_diff(want: &[Vec<u8>], got: &[Vec<u8>]) -> Option<String> {
    if want == got {
        return None;
    }
    let ops = similar::capture_diff_slices(Algorithm::Myers, want, got);

    let mut out = String::new();
    for group in similar::group_diff_ops(ops, CONTEXT_LINES) {
        let (Some(first), Some(last)) = (group.first(), group.last()) else {
            continue;
        };
        let old = first.old_range().start..last.old_range().end;
        let new = first.new_range().start..last.new_range().end;
        let _ = writeln!(
            out,
            "@@ -{},{} +{},{} @@",
            old.start + 1,
            old.len(),
            new.start + 1,
            new.len()
        );
        for op in &group {
            let (tag, old, new) = op.as_tag_tuple();
            match tag {
                DiffTag::Equal => push_lines(&mut out, ' ', &want[old]),
                DiffTag::Delete => push_lines(&mut out, '-', &want[old]),
                DiffTag::Insert => push_lines(&mut out, '+', &got[new]),
                DiffTag::Replace => {
                    push_lines(&mut out, '-', &want[old]);
                    push_lines(&mut out, '+', &got[new]);
                }
            }
        }
    }
    Some(out)
}

fn push_lines(out: &mut String, sign: char, lines: &[Vec<u8>]) {
    for line in lines {
        out.push(sign);
        out.push_str(&String::from_utf8_lossy(line));
    }
}
