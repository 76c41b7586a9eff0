//! Scheme interpreter.
//!
//! A scheme is a line-oriented description of one program invocation:
//!
//! ```text
//! --file:a.txt
//! --file:.b.txt
//! --arg:-a
//! --stdout
//! .
//! ..
//! .b.txt
//! a.txt
//! ```
//!
//! describes `ls -a` run in a directory holding `a.txt` and `.b.txt`.
//!
//! Lines starting with one of the directive prefixes below switch the open
//! block or record a scalar. Every other line is payload for the open block
//! (a file body, the expected stdout or stderr, or the stdin to feed).

use crate::lines::{self, LineError};
use crate::vars::Vars;
use schemars::JsonSchema;
use serde::{Deserialize, Serialize, Serializer};
use std::collections::{BTreeMap, BTreeSet};
use std::num::ParseIntError;
use std::path::{Path, PathBuf};
use thiserror::Error;

// `--` also opens a comment in Lua and SQL, so payload lines in those
// languages can be mistaken for directives.
const DIRECTIVE_PREFIX: &str = "--";
const FILE_PREFIX: &str = "--file:";
const STDOUT_PREFIX: &str = "--stdout";
const STDERR_PREFIX: &str = "--stderr";
const STDIN_PREFIX: &str = "--stdin";
const ENV_PREFIX: &str = "--env:";
const ARG_PREFIX: &str = "--arg:";
const RETURN_CODE_PREFIX: &str = "--return-code:";

/// How the interpreter treats unknown directives and repeated declarations.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize, JsonSchema)]
#[serde(rename_all = "lowercase")]
pub enum Strictness {
    /// Ignore unknown directives; repeated declarations are last-wins.
    #[default]
    Lenient,
    /// Like `Lenient`, but every finding is reported as a warning.
    Warn,
    /// Every finding is a fatal scheme error.
    Strict,
}

/// Fully parsed description of one invocation.
///
/// Block payloads are kept as bytes; the JSON form shows them lossily.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct TestPlan {
    /// Fixture root the plan was resolved against.
    pub root: PathBuf,
    /// Files to create, keyed by path relative to `root`.
    #[serde(serialize_with = "lossy_map")]
    pub files: BTreeMap<String, Vec<u8>>,
    /// Arguments after the program name.
    pub args: Vec<String>,
    /// `KEY=VALUE` entries overlaid on the child environment, in order.
    pub env: Vec<String>,
    /// Bytes fed to the child's stdin.
    #[serde(serialize_with = "lossy")]
    pub stdin: Vec<u8>,
    /// Expected stdout.
    #[serde(serialize_with = "lossy")]
    pub stdout: Vec<u8>,
    /// Expected stderr.
    #[serde(serialize_with = "lossy")]
    pub stderr: Vec<u8>,
    /// Expected exit code.
    pub return_code: i32,
}

fn lossy<S: Serializer>(bytes: &[u8], serializer: S) -> Result<S::Ok, S::Error> {
    serializer.serialize_str(&String::from_utf8_lossy(bytes))
}

fn lossy_map<S: Serializer>(
    files: &BTreeMap<String, Vec<u8>>,
    serializer: S,
) -> Result<S::Ok, S::Error> {
    serializer.collect_map(
        files
            .iter()
            .map(|(name, content)| (name, String::from_utf8_lossy(content))),
    )
}

impl TestPlan {
    /// Env entries split into key and value.
    pub fn env_pairs(&self) -> impl Iterator<Item = (&str, &str)> {
        self.env.iter().filter_map(|kv| kv.split_once('='))
    }
}

/// Something suspicious in a scheme that is not an error unless strict.
#[derive(Debug, Clone, PartialEq, Eq, Error, Serialize)]
pub enum Lint {
    #[error("unknown directive {0:?}")]
    UnknownDirective(String),
    #[error("{0} declared more than once")]
    Duplicate(String),
    #[error("env entry {0:?} has an empty name")]
    EmptyEnvKey(String),
}

/// A lint reported under [`Strictness::Warn`].
#[derive(Debug, Clone, PartialEq, Eq, Error, Serialize)]
#[error("line {line}: {lint}")]
pub struct Warning {
    pub line: usize,
    pub lint: Lint,
}

/// Result of parsing a scheme.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Parsed {
    pub plan: TestPlan,
    pub warnings: Vec<Warning>,
}

/// Fatal scheme error. No fixture is written and nothing is run.
#[derive(Debug, Error, PartialEq, Eq)]
pub enum SchemeError {
    #[error(transparent)]
    Lines(#[from] LineError),
    #[error("line {line}: failed to convert return code {value:?} to int: {source}")]
    ReturnCode {
        line: usize,
        value: String,
        source: ParseIntError,
    },
    #[error("line {line}: malformed --env entry {entry:?}, expected KEY=VALUE")]
    Env { line: usize, entry: String },
    #[error("line {line}: --file directive without a file name")]
    EmptyFileName { line: usize },
    #[error("line {line}: directive is not valid UTF-8")]
    Encoding { line: usize },
    #[error("line {line}: {lint}")]
    Rejected { line: usize, lint: Lint },
}

/// Parse `scheme` leniently, resolving `{dir}` against `root`.
pub fn parse(scheme: impl AsRef<[u8]>, root: &Path) -> Result<TestPlan, SchemeError> {
    parse_with(scheme, root, Strictness::Lenient).map(|parsed| parsed.plan)
}

/// Parse `scheme` with the given strictness, resolving `{dir}` against `root`.
#[tracing::instrument(skip_all, fields(root = %root.display(), ?strictness))]
pub fn parse_with(
    scheme: impl AsRef<[u8]>,
    root: &Path,
    strictness: Strictness,
) -> Result<Parsed, SchemeError> {
    let lines = lines::split(scheme.as_ref())?;
    tracing::debug!(lines = lines.len(), "parsing scheme");

    let mut interpreter = Interpreter::new(root, strictness);
    for (idx, line) in lines.iter().enumerate() {
        interpreter.feed(idx + 1, line)?;
    }
    Ok(interpreter.finish())
}

/// The block payload lines are currently routed to.
#[derive(Debug, Default)]
enum Block {
    #[default]
    None,
    File {
        name: String,
        content: Vec<u8>,
    },
    Stdout,
    Stderr,
    Stdin,
}

#[derive(Debug, Clone, Copy)]
enum Directive<'a> {
    Stderr,
    Stdout,
    File(&'a [u8]),
    Stdin,
    ReturnCode(&'a [u8]),
    Arg(&'a [u8]),
    Env(&'a [u8]),
    Unknown,
}

/// Recognize a directive. Order matters: the first matching prefix wins.
fn classify(line: &[u8]) -> Option<Directive<'_>> {
    if line.starts_with(STDERR_PREFIX.as_bytes()) {
        return Some(Directive::Stderr);
    }
    if line.starts_with(STDOUT_PREFIX.as_bytes()) {
        return Some(Directive::Stdout);
    }
    if let Some(name) = line.strip_prefix(FILE_PREFIX.as_bytes()) {
        return Some(Directive::File(name));
    }
    if line.starts_with(STDIN_PREFIX.as_bytes()) {
        return Some(Directive::Stdin);
    }
    if let Some(value) = line.strip_prefix(RETURN_CODE_PREFIX.as_bytes()) {
        return Some(Directive::ReturnCode(value));
    }
    if let Some(value) = line.strip_prefix(ARG_PREFIX.as_bytes()) {
        return Some(Directive::Arg(value));
    }
    if let Some(value) = line.strip_prefix(ENV_PREFIX.as_bytes()) {
        return Some(Directive::Env(value));
    }
    if line.starts_with(DIRECTIVE_PREFIX.as_bytes()) {
        return Some(Directive::Unknown);
    }
    None
}

/// Decode and trim a directive value.
fn text(line_no: usize, value: &[u8]) -> Result<&str, SchemeError> {
    std::str::from_utf8(value)
        .map(str::trim)
        .map_err(|_| SchemeError::Encoding { line: line_no })
}

struct Interpreter {
    vars: Vars,
    strictness: Strictness,
    plan: TestPlan,
    block: Block,
    /// Singular directives already seen, for duplicate detection.
    declared: BTreeSet<&'static str>,
    warnings: Vec<Warning>,
}

impl Interpreter {
    fn new(root: &Path, strictness: Strictness) -> Self {
        Self {
            vars: Vars::new(root),
            strictness,
            plan: TestPlan {
                root: root.to_path_buf(),
                ..TestPlan::default()
            },
            block: Block::None,
            declared: BTreeSet::new(),
            warnings: Vec::new(),
        }
    }

    fn feed(&mut self, line_no: usize, line: &[u8]) -> Result<(), SchemeError> {
        let Some(directive) = classify(line) else {
            self.payload(line);
            return Ok(());
        };

        match directive {
            Directive::Stderr => self.open(line_no, STDERR_PREFIX, Block::Stderr)?,
            Directive::Stdout => self.open(line_no, STDOUT_PREFIX, Block::Stdout)?,
            Directive::Stdin => self.open(line_no, STDIN_PREFIX, Block::Stdin)?,
            Directive::File(name) => {
                let name = text(line_no, name)?;
                if name.is_empty() {
                    return Err(SchemeError::EmptyFileName { line: line_no });
                }
                self.close_file();
                if self.plan.files.contains_key(name) {
                    self.lint(line_no, Lint::Duplicate(format!("{FILE_PREFIX}{name}")))?;
                }
                self.block = Block::File {
                    name: name.to_string(),
                    content: Vec::new(),
                };
            }
            Directive::ReturnCode(value) => {
                let value = text(line_no, value)?;
                self.plan.return_code = value.parse().map_err(|source| SchemeError::ReturnCode {
                    line: line_no,
                    value: value.to_string(),
                    source,
                })?;
                self.declare(line_no, RETURN_CODE_PREFIX)?;
            }
            Directive::Arg(value) => {
                let value = text(line_no, value)?;
                self.plan.args.push(self.vars.apply(value));
            }
            Directive::Env(value) => {
                let entry = self.vars.apply(text(line_no, value)?);
                if !entry.contains('=') {
                    return Err(SchemeError::Env { line: line_no, entry });
                }
                if entry.starts_with('=') {
                    self.lint(line_no, Lint::EmptyEnvKey(entry.clone()))?;
                }
                self.plan.env.push(entry);
            }
            Directive::Unknown => {
                let name = String::from_utf8_lossy(line.trim_ascii_end()).into_owned();
                self.lint(line_no, Lint::UnknownDirective(name))?;
            }
        }
        Ok(())
    }

    fn payload(&mut self, line: &[u8]) {
        match &mut self.block {
            Block::None => {}
            Block::File { content, .. } => content.extend(self.vars.apply_bytes(line)),
            Block::Stdout => self.plan.stdout.extend(self.vars.apply_bytes(line)),
            Block::Stderr => self.plan.stderr.extend(self.vars.apply_bytes(line)),
            Block::Stdin => self.plan.stdin.extend_from_slice(line),
        }
    }

    fn open(
        &mut self,
        line_no: usize,
        directive: &'static str,
        block: Block,
    ) -> Result<(), SchemeError> {
        self.close_file();
        self.declare(line_no, directive)?;
        self.block = block;
        Ok(())
    }

    /// Flush an open file block into the plan.
    fn close_file(&mut self) {
        if let Block::File { name, content } = std::mem::take(&mut self.block) {
            self.plan.files.insert(name, content);
        }
    }

    fn declare(&mut self, line_no: usize, directive: &'static str) -> Result<(), SchemeError> {
        if self.declared.insert(directive) {
            return Ok(());
        }
        self.lint(line_no, Lint::Duplicate(directive.to_string()))
    }

    fn lint(&mut self, line: usize, lint: Lint) -> Result<(), SchemeError> {
        match self.strictness {
            Strictness::Lenient => {
                tracing::debug!(line, %lint, "ignoring");
                Ok(())
            }
            Strictness::Warn => {
                tracing::warn!(line, %lint, "suspicious scheme line");
                self.warnings.push(Warning { line, lint });
                Ok(())
            }
            Strictness::Strict => Err(SchemeError::Rejected { line, lint }),
        }
    }

    fn finish(mut self) -> Parsed {
        self.close_file();
        Parsed {
            plan: self.plan,
            warnings: self.warnings,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn root() -> PathBuf {
        PathBuf::from("/fixture/root")
    }

    fn plan(scheme: impl AsRef<[u8]>) -> TestPlan {
        parse(scheme, &root()).unwrap()
    }

    fn files(plan: &TestPlan) -> Vec<(&str, &str)> {
        plan.files
            .iter()
            .map(|(k, v)| (k.as_str(), std::str::from_utf8(v).unwrap()))
            .collect()
    }

    // ==================== Blocks ====================

    #[test]
    fn empty_scheme_is_an_empty_plan() {
        let plan = plan("");
        assert_eq!(
            plan,
            TestPlan {
                root: root(),
                ..TestPlan::default()
            }
        );
    }

    #[test]
    fn file_blocks_collect_payload() {
        let plan = plan("--file:sub/inner.txt\nline1\nline2\n\nline4\n--file:empty.txt\n");
        assert_eq!(
            files(&plan),
            vec![("empty.txt", ""), ("sub/inner.txt", "line1\nline2\n\nline4\n")]
        );
    }

    #[test]
    fn trailing_file_block_is_flushed() {
        let plan = plan("--stdout\nout\n--file:last.txt\nbody");
        assert_eq!(files(&plan), vec![("last.txt", "body\n")]);
        assert_eq!(plan.stdout, b"out\n");
    }

    #[test]
    fn file_name_is_trimmed() {
        let plan = plan("--file:   spaced.txt  \nx\n");
        assert_eq!(files(&plan), vec![("spaced.txt", "x\n")]);
    }

    #[test]
    fn stdout_position_does_not_change_blocks() {
        let after = plan("--file:a.txt\n--file:b.txt\n--stdout\na.txt\nb.txt\n");
        let before = plan("--stdout\na.txt\nb.txt\n--file:a.txt\n--file:b.txt\n");
        let between = plan("--file:a.txt\n--stdout\na.txt\nb.txt\n--file:b.txt\n");

        for p in [&after, &before, &between] {
            assert_eq!(files(p), vec![("a.txt", ""), ("b.txt", "")]);
            assert_eq!(p.stdout, b"a.txt\nb.txt\n");
        }
    }

    #[test]
    fn stdout_stderr_and_stdin_blocks() {
        let plan = plan("--stdin\nin\n--stdout\nout\n--stderr\nerr\nerr2\n");
        assert_eq!(plan.stdin, b"in\n");
        assert_eq!(plan.stdout, b"out\n");
        assert_eq!(plan.stderr, b"err\nerr2\n");
    }

    #[test]
    fn payload_outside_blocks_is_dropped() {
        let plan = plan("\nstray line\n--arg:x\nanother\n");
        assert_eq!(plan.args, vec!["x"]);
        assert!(plan.stdout.is_empty());
        assert!(plan.files.is_empty());
    }

    #[test]
    fn scalar_directives_keep_the_open_block() {
        let plan = plan("--stdout\none\n--arg:-l\n--return-code:3\n--env:A=b\ntwo\n");
        assert_eq!(plan.stdout, b"one\ntwo\n");
        assert_eq!(plan.args, vec!["-l"]);
        assert_eq!(plan.return_code, 3);
        assert_eq!(plan.env, vec!["A=b"]);
    }

    #[test]
    fn directive_tokens_ignore_trailing_text() {
        let plan = plan("--stdout please\nx\n--stderrors\ny\n");
        assert_eq!(plan.stdout, b"x\n");
        assert_eq!(plan.stderr, b"y\n");
    }

    #[test]
    fn crlf_schemes_parse_like_lf() {
        let plan = plan("--file:a.txt\r\nbody\r\n--stdout\r\nok\r\n");
        assert_eq!(files(&plan), vec![("a.txt", "body\n")]);
        assert_eq!(plan.stdout, b"ok\n");
    }

    // ==================== Scalars ====================

    #[test]
    fn args_are_trimmed_and_ordered() {
        let plan = plan("--arg:-c\n--arg:  exit 42  \n--arg:\n");
        assert_eq!(plan.args, vec!["-c", "exit 42", ""]);
    }

    #[test]
    fn return_code_defaults_to_zero() {
        assert_eq!(plan("--stdout\n").return_code, 0);
        assert_eq!(plan("--return-code: 42\n").return_code, 42);
        assert_eq!(plan("--return-code:-1\n").return_code, -1);
        assert_eq!(plan("--return-code:+7\n").return_code, 7);
    }

    #[test]
    fn malformed_return_code_is_fatal() {
        let err = parse("\n--return-code: forty\n", &root()).unwrap_err();
        match err {
            SchemeError::ReturnCode { line, value, .. } => {
                assert_eq!(line, 2);
                assert_eq!(value, "forty");
            }
            other => panic!("unexpected error: {other:?}"),
        }
    }

    #[test]
    fn env_entries_keep_order_and_duplicates() {
        let plan = plan("--env:ONE=1\n--env:TWO=2\n--env:ONE=3\n--env:EMPTY=\n");
        assert_eq!(plan.env, vec!["ONE=1", "TWO=2", "ONE=3", "EMPTY="]);
        let pairs: Vec<_> = plan.env_pairs().collect();
        assert_eq!(pairs[0], ("ONE", "1"));
        assert_eq!(pairs[3], ("EMPTY", ""));
    }

    #[test]
    fn env_value_may_contain_separator() {
        let plan = plan("--env:OPTS=a=b\n");
        assert_eq!(plan.env_pairs().next(), Some(("OPTS", "a=b")));
    }

    #[test]
    fn env_without_separator_is_fatal() {
        assert_eq!(
            parse("--env:NOVALUE\n", &root()),
            Err(SchemeError::Env {
                line: 1,
                entry: "NOVALUE".to_string()
            })
        );
    }

    #[test]
    fn empty_env_name_is_kept_unless_strict() {
        assert_eq!(plan("--env:=value\n").env, vec!["=value"]);

        let parsed = parse_with("--env:=value\n", &root(), Strictness::Warn).unwrap();
        assert_eq!(parsed.plan.env, vec!["=value"]);
        assert_eq!(
            parsed.warnings,
            vec![Warning {
                line: 1,
                lint: Lint::EmptyEnvKey("=value".to_string())
            }]
        );

        assert_eq!(
            parse_with("--env:=value\n", &root(), Strictness::Strict),
            Err(SchemeError::Rejected {
                line: 1,
                lint: Lint::EmptyEnvKey("=value".to_string())
            })
        );
    }

    #[test]
    fn empty_file_name_is_fatal() {
        assert_eq!(
            parse("--file:a\n--file:  \n", &root()),
            Err(SchemeError::EmptyFileName { line: 2 })
        );
    }

    // ==================== Substitution ====================

    #[test]
    fn dir_is_substituted_outside_stdin() {
        let plan = plan(
            "--arg:{dir}/x\n--env:D={dir}\n--file:info.txt\nPath: {dir}\n\
             --stdout\nout {dir}\n--stderr\nerr {dir}\n--stdin\nin {dir}\n",
        );
        assert_eq!(plan.args, vec!["/fixture/root/x"]);
        assert_eq!(plan.env, vec!["D=/fixture/root"]);
        assert_eq!(files(&plan), vec![("info.txt", "Path: /fixture/root\n")]);
        assert_eq!(plan.stdout, b"out /fixture/root\n");
        assert_eq!(plan.stderr, b"err /fixture/root\n");
        assert_eq!(plan.stdin, b"in {dir}\n");
    }

    #[test]
    fn payload_bytes_are_kept_verbatim() {
        let plan = plan(b"--stdin\n\xff\xfe\n--stdout\n\xff {dir}\n--file:bin\n\x00\x80\n");
        assert_eq!(plan.stdin, b"\xff\xfe\n");
        assert_eq!(plan.stdout, b"\xff /fixture/root\n");
        assert_eq!(plan.files["bin"], b"\x00\x80\n");
    }

    #[test]
    fn directive_values_must_be_utf8() {
        assert_eq!(
            parse(b"--stdout\n--arg:\xff\n", &root()),
            Err(SchemeError::Encoding { line: 2 })
        );
        assert_eq!(
            parse(b"--file:\xfe\n", &root()),
            Err(SchemeError::Encoding { line: 1 })
        );
    }

    #[test]
    fn plan_json_shows_payload_as_text() {
        let plan = plan("--file:a.txt\nhi\n--stdin\nin\n--stdout\nout\n");
        let json = serde_json::to_value(&plan).unwrap();
        assert_eq!(json["files"]["a.txt"], "hi\n");
        assert_eq!(json["stdin"], "in\n");
        assert_eq!(json["stdout"], "out\n");
        assert_eq!(json["stderr"], "");
    }

    #[test]
    fn file_names_are_not_substituted() {
        let plan = plan("--file:{dir}.txt\n");
        assert!(plan.files.contains_key("{dir}.txt"));
    }

    // ==================== Strictness ====================

    #[test]
    fn unknown_directive_is_ignored() {
        let parsed =
            parse_with("--unknown:something\n--stdout\nok\n", &root(), Strictness::Lenient)
                .unwrap();
        assert_eq!(parsed.plan.stdout, b"ok\n");
        assert!(parsed.warnings.is_empty());
    }

    #[test]
    fn unknown_directive_inside_block_is_not_payload() {
        let plan = plan("--file:a.sql\nselect 1;\n-- a comment\n");
        assert_eq!(files(&plan), vec![("a.sql", "select 1;\n")]);
    }

    #[test]
    fn duplicates_are_last_wins_when_lenient() {
        let plan = plan(
            "--file:a.txt\nfirst\n--file:a.txt\nsecond\n--return-code:1\n--return-code:2\n\
             --stdout\none\n--stdout\ntwo\n",
        );
        assert_eq!(files(&plan), vec![("a.txt", "second\n")]);
        assert_eq!(plan.return_code, 2);
        assert_eq!(plan.stdout, b"one\ntwo\n");
    }

    #[test]
    fn warn_mode_records_findings() {
        let parsed = parse_with(
            "--file:a\n--file:a\n--typo\n--stdout\n--stdout\n--return-code:1\n--return-code:1\n",
            &root(),
            Strictness::Warn,
        )
        .unwrap();
        assert_eq!(
            parsed.warnings,
            vec![
                Warning {
                    line: 2,
                    lint: Lint::Duplicate("--file:a".to_string())
                },
                Warning {
                    line: 3,
                    lint: Lint::UnknownDirective("--typo".to_string())
                },
                Warning {
                    line: 5,
                    lint: Lint::Duplicate("--stdout".to_string())
                },
                Warning {
                    line: 7,
                    lint: Lint::Duplicate("--return-code:".to_string())
                },
            ]
        );
        assert_eq!(parsed.warnings[1].to_string(), "line 3: unknown directive \"--typo\"");
    }

    #[test]
    fn strict_mode_rejects_unknown_directives() {
        assert_eq!(
            parse_with("--stdout\n--stdot\n", &root(), Strictness::Strict),
            Err(SchemeError::Rejected {
                line: 2,
                lint: Lint::UnknownDirective("--stdot".to_string())
            })
        );
    }

    #[test]
    fn strict_mode_rejects_duplicates() {
        let err = parse_with("--stdin\n--stderr\n--stdin\n", &root(), Strictness::Strict)
            .unwrap_err();
        assert_eq!(err.to_string(), "line 3: --stdin declared more than once");
    }

    #[test]
    fn strict_mode_accepts_clean_schemes() {
        let parsed = parse_with(
            "--file:a.txt\n--file:b.txt\n--arg:-a\n--arg:-b\n--env:A=1\n--env:B=2\n--stdout\nx\n",
            &root(),
            Strictness::Strict,
        )
        .unwrap();
        assert!(parsed.warnings.is_empty());
        assert_eq!(parsed.plan.files.len(), 2);
    }

    #[test]
    fn overlong_line_is_fatal() {
        let scheme = format!("--stdout\n{}\n", "z".repeat(lines::MAX_LINE_LEN + 1));
        assert!(matches!(
            parse(&scheme, &root()),
            Err(SchemeError::Lines(LineError::TooLong { line: 2, .. }))
        ));
    }
}
