//! Suite execution.
//!
//! Runs a set of scheme files against one program and collects per-file
//! results.

use crate::config::SuiteConfig;
use crate::exec::{Invocation, Spawner};
use crate::harness::Harness;
use crate::scheme::TestPlan;
use std::path::{Path, PathBuf};
use std::thread;
use std::time::{Duration, Instant};

/// Result of running a single scheme file.
#[derive(Debug, serde::Serialize)]
pub struct SchemeResult {
    pub name: String,
    pub passed: bool,
    #[serde(serialize_with = "serialize_duration")]
    pub duration: Duration,
    pub failures: Vec<String>,
    #[serde(skip_serializing_if = "Vec::is_empty")]
    pub warnings: Vec<String>,
    /// Parsed plan, absent when the scheme could not be run.
    #[serde(skip)]
    pub plan: Option<TestPlan>,
}

fn serialize_duration<S>(duration: &Duration, serializer: S) -> Result<S::Ok, S::Error>
where
    S: serde::Serializer,
{
    serializer.serialize_f64(duration.as_secs_f64())
}

/// Resolve the program to run.
///
/// Bare names are left for `PATH` lookup. Relative paths are anchored at
/// `base`, since the child runs inside its fixture root.
pub fn resolve_program(program: &str, base: &Path) -> PathBuf {
    let path = Path::new(program);
    if path.is_absolute() || path.components().count() == 1 {
        path.to_path_buf()
    } else {
        base.join(path)
    }
}

/// Run every scheme in `paths`, in parallel unless the config says `serial`.
///
/// Results are returned in the order of `paths`.
pub fn run_schemes<S>(
    harness: &Harness<S>,
    config: &SuiteConfig,
    program: &Path,
    paths: &[PathBuf],
) -> Vec<SchemeResult>
where
    S: Spawner + Sync,
{
    if config.serial {
        return paths
            .iter()
            .map(|path| run_scheme(harness, config, program, path))
            .collect();
    }

    thread::scope(|s| {
        let handles: Vec<_> = paths
            .iter()
            .map(|path| s.spawn(move || run_scheme(harness, config, program, path)))
            .collect();

        handles
            .into_iter()
            .map(|h| h.join().expect("Scheme thread panicked"))
            .collect()
    })
}

/// Run one scheme file.
pub fn run_scheme<S: Spawner>(
    harness: &Harness<S>,
    config: &SuiteConfig,
    program: &Path,
    path: &Path,
) -> SchemeResult {
    let start = Instant::now();
    let name = path.display().to_string();
    let apply = |invocation: &mut Invocation| config.apply(invocation);

    match harness.run_file(program, path, &[&apply]) {
        Ok(report) => SchemeResult {
            name,
            passed: report.passed(),
            duration: start.elapsed(),
            // The full report: every mismatch, the actual output and the scheme.
            failures: if report.passed() {
                Vec::new()
            } else {
                vec![report.to_string()]
            },
            warnings: report.warnings.iter().map(ToString::to_string).collect(),
            plan: Some(report.plan.clone()),
        },
        Err(e) => SchemeResult {
            name,
            passed: false,
            duration: start.elapsed(),
            failures: vec![e.to_string()],
            warnings: Vec::new(),
            plan: None,
        },
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::scheme::Strictness;
    use std::fs;
    use tempfile::TempDir;

    fn write(dir: &TempDir, name: &str, scheme: &str) -> PathBuf {
        let path = dir.path().join(name);
        fs::write(&path, scheme).unwrap();
        path
    }

    #[test]
    fn resolve_program_keeps_bare_names() {
        let base = Path::new("/suite");
        assert_eq!(resolve_program("ls", base), PathBuf::from("ls"));
        assert_eq!(resolve_program("/bin/ls", base), PathBuf::from("/bin/ls"));
        assert_eq!(
            resolve_program("./bin/tool", base),
            PathBuf::from("/suite/./bin/tool")
        );
        assert_eq!(
            resolve_program("target/tool", base),
            PathBuf::from("/suite/target/tool")
        );
    }

    #[test]
    fn results_keep_path_order() {
        let dir = TempDir::new().unwrap();
        let paths = vec![
            write(&dir, "a.scheme", "--arg:-c\n--arg:sleep 0.2; echo a\n--stdout\na\n"),
            write(&dir, "b.scheme", "--arg:-c\n--arg:echo b\n--stdout\nb\n"),
            write(&dir, "c.scheme", "--arg:-c\n--arg:echo c\n--stdout\nc\n"),
        ];

        let results = run_schemes(
            &Harness::new(),
            &SuiteConfig::default(),
            Path::new("sh"),
            &paths,
        );

        let names: Vec<_> = results.iter().map(|r| r.name.clone()).collect();
        let expected: Vec<_> = paths.iter().map(|p| p.display().to_string()).collect();
        assert_eq!(names, expected);
        assert!(results.iter().all(|r| r.passed), "{results:?}");
    }

    #[test]
    fn failures_include_actual_output() {
        let dir = TempDir::new().unwrap();
        let path = write(&dir, "wrong.scheme", "--arg:-c\n--arg:echo got\n--stdout\nwant\n");

        let result = run_scheme(
            &Harness::new(),
            &SuiteConfig::default(),
            Path::new("sh"),
            &path,
        );

        assert!(!result.passed);
        assert_eq!(result.failures.len(), 1);
        assert!(result.failures[0].contains("-want\n+got\n"));
        assert!(result.failures[0].contains("stdout:\ngot\n"));
    }

    #[test]
    fn failures_include_the_scheme() {
        let dir = TempDir::new().unwrap();
        let scheme = "--arg:-c\n--arg:exit 4\n";
        let path = write(&dir, "exit.scheme", scheme);

        let result = run_scheme(
            &Harness::new(),
            &SuiteConfig::default(),
            Path::new("sh"),
            &path,
        );

        assert!(!result.passed);
        assert!(result.failures[0].starts_with("Failed to match return code: want 0, got 4"));
        assert!(result.failures[0].ends_with(&format!("Test scheme:\n{scheme}")));
    }

    #[test]
    fn fatal_errors_become_failures() {
        let dir = TempDir::new().unwrap();
        let path = write(&dir, "bad.scheme", "--return-code: nope\n");

        let result = run_scheme(
            &Harness::new(),
            &SuiteConfig::default(),
            Path::new("true"),
            &path,
        );

        assert!(!result.passed);
        assert!(result.failures[0].contains("failed to convert return code"));
    }

    #[test]
    fn config_env_reaches_the_child() {
        let dir = TempDir::new().unwrap();
        let path = write(
            &dir,
            "env.scheme",
            "--env:SCHEME_VAR=scheme\n--arg:-c\n--arg:echo $SUITE_VAR $SCHEME_VAR\n--stdout\nsuite scheme\n",
        );
        let mut config = SuiteConfig::default();
        config
            .env
            .insert("SUITE_VAR".to_string(), "suite".to_string());
        config
            .env
            .insert("SCHEME_VAR".to_string(), "overridden".to_string());

        let result = run_scheme(&Harness::new(), &config, Path::new("sh"), &path);
        assert!(result.passed, "{:?}", result.failures);
    }

    #[test]
    fn warnings_are_reported() {
        let dir = TempDir::new().unwrap();
        let path = write(&dir, "warn.scheme", "--stdot\n");

        let harness = Harness::new().strictness(Strictness::Warn);
        let result = run_scheme(&harness, &SuiteConfig::default(), Path::new("true"), &path);
        assert!(result.passed);
        assert_eq!(result.warnings, vec!["line 1: unknown directive \"--stdot\""]);
    }
}
