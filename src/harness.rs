//! Runs one scheme end to end: allocate a root, parse, write the fixture,
//! execute, check.

use crate::check::{self, Mismatch};
use crate::exec::{self, ExecError, ExecutionResult, Invocation, OsSpawner, Spawner};
use crate::fixture::{self, FixtureError, FixtureRoot, RootProvider, TempRoots};
use crate::scheme::{self, SchemeError, Strictness, TestPlan, Warning};
use std::fmt;
use std::io;
use std::path::{Path, PathBuf};
use thiserror::Error;

/// Adjusts the child-process descriptor before it is started. Options may
/// borrow from the caller.
pub type CmdOption<'a> = dyn Fn(&mut Invocation) + 'a;

/// Fatal errors: the scheme could not be run at all.
#[derive(Debug, Error)]
pub enum HarnessError {
    #[error("failed to read test file {}: {source}", path.display())]
    ReadScheme { path: PathBuf, source: io::Error },
    #[error(transparent)]
    Scheme(#[from] SchemeError),
    #[error(transparent)]
    Fixture(#[from] FixtureError),
    #[error(transparent)]
    Exec(#[from] ExecError),
}

/// Outcome of one invocation.
///
/// The fixture root stays in place for as long as the report is alive, so
/// files written by the program can still be inspected.
#[derive(Debug)]
pub struct Report {
    pub plan: TestPlan,
    pub warnings: Vec<Warning>,
    pub mismatches: Vec<Mismatch>,
    pub result: ExecutionResult,
    /// The scheme text as given.
    pub scheme: Vec<u8>,
    root: FixtureRoot,
}

impl Report {
    pub fn passed(&self) -> bool {
        self.mismatches.is_empty()
    }

    pub fn root(&self) -> &Path {
        self.root.path()
    }

    /// Rendered mismatches, one entry per failed check. Output mismatches
    /// carry the actual stream.
    pub fn failures(&self) -> Vec<String> {
        self.mismatches
            .iter()
            .map(|mismatch| match mismatch.stream() {
                Some(check::Stream::Stdout) => {
                    format!("{mismatch}\nstdout:\n{}", self.result.stdout_lossy())
                }
                Some(check::Stream::Stderr) => {
                    format!("{mismatch}\nstderr:\n{}", self.result.stderr_lossy())
                }
                None => mismatch.to_string(),
            })
            .collect()
    }
}

impl fmt::Display for Report {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        if self.passed() {
            return write!(f, "passed");
        }
        for failure in self.failures() {
            writeln!(f, "{failure}")?;
        }
        for warning in &self.warnings {
            writeln!(f, "warning: {warning}")?;
        }
        write!(f, "Test scheme:\n{}", String::from_utf8_lossy(&self.scheme))
    }
}

/// Configured scheme runner.
pub struct Harness<S = OsSpawner> {
    strictness: Strictness,
    roots: Box<dyn RootProvider>,
    spawner: S,
}

impl Harness<OsSpawner> {
    /// Lenient parsing, temporary roots, real processes.
    pub fn new() -> Self {
        Self {
            strictness: Strictness::default(),
            roots: Box::new(TempRoots),
            spawner: OsSpawner,
        }
    }
}

impl Default for Harness<OsSpawner> {
    fn default() -> Self {
        Self::new()
    }
}

impl<S: Spawner> Harness<S> {
    pub fn strictness(mut self, strictness: Strictness) -> Self {
        self.strictness = strictness;
        self
    }

    pub fn roots(mut self, roots: Box<dyn RootProvider>) -> Self {
        self.roots = roots;
        self
    }

    pub fn spawner<T: Spawner>(self, spawner: T) -> Harness<T> {
        Harness {
            strictness: self.strictness,
            roots: self.roots,
            spawner,
        }
    }

    /// Run `scheme` against `program`.
    pub fn run(
        &self,
        program: impl AsRef<Path>,
        scheme: impl AsRef<[u8]>,
        options: &[&CmdOption],
    ) -> Result<Report, HarnessError> {
        let program = program.as_ref();
        let label = program
            .file_name()
            .map(|name| name.to_string_lossy().into_owned())
            .unwrap_or_default();
        self.run_labeled(&label, program, scheme.as_ref(), options)
    }

    /// Read a scheme from `path` and run it against `program`.
    pub fn run_file(
        &self,
        program: impl AsRef<Path>,
        path: &Path,
        options: &[&CmdOption],
    ) -> Result<Report, HarnessError> {
        let scheme = std::fs::read(path).map_err(|source| HarnessError::ReadScheme {
            path: path.to_path_buf(),
            source,
        })?;
        let label = path
            .file_stem()
            .map(|stem| stem.to_string_lossy().into_owned())
            .unwrap_or_default();
        self.run_labeled(&label, program.as_ref(), &scheme, options)
    }

    #[tracing::instrument(skip_all, fields(label = %label, program = %program.display()))]
    fn run_labeled(
        &self,
        label: &str,
        program: &Path,
        scheme: &[u8],
        options: &[&CmdOption],
    ) -> Result<Report, HarnessError> {
        let root = self
            .roots
            .allocate(label)
            .map_err(FixtureError::Allocate)?;
        let parsed = scheme::parse_with(scheme, root.path(), self.strictness)?;
        let plan = parsed.plan;
        fixture::materialize(root.path(), &plan.files)?;

        let mut invocation = Invocation::new(program, root.path());
        invocation.args = plan.args.clone();
        invocation.stdin = plan.stdin.clone();
        for option in options {
            option(&mut invocation);
        }
        // Scheme entries go last so they override anything set by options.
        for (key, value) in plan.env_pairs() {
            invocation.env(key, value);
        }

        let result = exec::run(&self.spawner, &invocation)?;
        let mismatches = check::check(&plan, &result);
        if mismatches.is_empty() {
            tracing::debug!("scheme passed");
        } else {
            tracing::debug!(mismatches = mismatches.len(), "scheme failed");
        }

        Ok(Report {
            plan,
            warnings: parsed.warnings,
            mismatches,
            result,
            scheme: scheme.to_vec(),
            root,
        })
    }
}
