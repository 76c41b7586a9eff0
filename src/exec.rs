//! Execution engine.
//!
//! Starts the program under test, feeds its stdin and collects everything it
//! writes. A nonzero exit is just data for the assertion stage; the only
//! errors here are failures to start the program or to talk to it.

use std::borrow::Cow;
use std::io::{self, Write};
use std::path::PathBuf;
use std::process::{Command, Stdio};
use std::thread::{self, JoinHandle};
use thiserror::Error;

/// Descriptor of the child process, built from a plan and then handed to
/// execution options for adjustment before it is started.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Invocation {
    pub program: PathBuf,
    pub args: Vec<String>,
    pub cwd: PathBuf,
    /// Variables set on top of the inherited environment, in order.
    pub env: Vec<(String, String)>,
    /// Whether the child starts from this process's environment.
    pub inherit_env: bool,
    pub stdin: Vec<u8>,
}

impl Invocation {
    pub fn new(program: impl Into<PathBuf>, cwd: impl Into<PathBuf>) -> Self {
        Self {
            program: program.into(),
            args: Vec::new(),
            cwd: cwd.into(),
            env: Vec::new(),
            inherit_env: true,
            stdin: Vec::new(),
        }
    }

    pub fn arg(&mut self, arg: impl Into<String>) -> &mut Self {
        self.args.push(arg.into());
        self
    }

    pub fn env(&mut self, key: impl Into<String>, value: impl Into<String>) -> &mut Self {
        self.env.push((key.into(), value.into()));
        self
    }

    /// Start the child from an empty environment.
    pub fn env_clear(&mut self) -> &mut Self {
        self.env.clear();
        self.inherit_env = false;
        self
    }

    pub fn current_dir(&mut self, dir: impl Into<PathBuf>) -> &mut Self {
        self.cwd = dir.into();
        self
    }

    pub fn stdin(&mut self, data: impl Into<Vec<u8>>) -> &mut Self {
        self.stdin = data.into();
        self
    }

    /// The value `key` will have in the child, if this invocation sets it.
    pub fn env_value(&self, key: &str) -> Option<&str> {
        self.env
            .iter()
            .rev()
            .find(|(k, _)| k == key)
            .map(|(_, v)| v.as_str())
    }
}

/// What the child produced.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ExecutionResult {
    pub stdout: Vec<u8>,
    pub stderr: Vec<u8>,
    /// Exit code if the process exited normally.
    pub exit_code: Option<i32>,
    /// Signal number if the process was terminated by a signal (Unix only).
    pub signal: Option<i32>,
}

impl ExecutionResult {
    pub fn stdout_lossy(&self) -> Cow<'_, str> {
        String::from_utf8_lossy(&self.stdout)
    }

    pub fn stderr_lossy(&self) -> Cow<'_, str> {
        String::from_utf8_lossy(&self.stderr)
    }
}

/// Fatal execution errors.
#[derive(Debug, Error)]
pub enum ExecError {
    #[error("failed to start {}: {source}", program.display())]
    Spawn { program: PathBuf, source: io::Error },
    #[error("failed to write stdin: {0}")]
    Stdin(#[source] io::Error),
    #[error("failed to collect output: {0}")]
    Wait(#[source] io::Error),
}

/// Starts processes.
pub trait Spawner {
    type Child: ChildProcess;

    fn spawn(&self, invocation: &Invocation) -> io::Result<Self::Child>;
}

/// A started process.
pub trait ChildProcess {
    /// Queue `data` for the child's stdin, which is closed afterwards.
    fn write_stdin(&mut self, data: Vec<u8>) -> io::Result<()>;

    /// Wait for exit, draining stdout and stderr to completion.
    fn wait(self) -> io::Result<ExecutionResult>;
}

/// Spawns real operating system processes.
#[derive(Debug, Clone, Copy, Default)]
pub struct OsSpawner;

impl Spawner for OsSpawner {
    type Child = OsChild;

    fn spawn(&self, invocation: &Invocation) -> io::Result<OsChild> {
        let mut cmd = Command::new(&invocation.program);
        cmd.args(&invocation.args);
        cmd.current_dir(&invocation.cwd);

        if !invocation.inherit_env {
            cmd.env_clear();
        }
        for (k, v) in &invocation.env {
            cmd.env(k, v);
        }

        cmd.stdin(Stdio::piped());
        cmd.stdout(Stdio::piped());
        cmd.stderr(Stdio::piped());

        let child = cmd.spawn()?;
        Ok(OsChild {
            child,
            writer: None,
        })
    }
}

/// A process started by [`OsSpawner`].
#[derive(Debug)]
pub struct OsChild {
    child: std::process::Child,
    writer: Option<JoinHandle<io::Result<()>>>,
}

impl ChildProcess for OsChild {
    fn write_stdin(&mut self, data: Vec<u8>) -> io::Result<()> {
        let Some(mut stdin) = self.child.stdin.take() else {
            return Err(io::Error::other("stdin already closed"));
        };
        // Written from a separate thread so a child that fills its stdout
        // pipe before reading all of stdin cannot block us.
        self.writer = Some(thread::spawn(move || match stdin.write_all(&data) {
            Err(e) if e.kind() == io::ErrorKind::BrokenPipe => Ok(()),
            other => other,
        }));
        Ok(())
    }

    fn wait(self) -> io::Result<ExecutionResult> {
        let OsChild { mut child, writer } = self;
        drop(child.stdin.take());

        let output = child.wait_with_output()?;
        if let Some(writer) = writer {
            writer
                .join()
                .map_err(|_| io::Error::other("stdin writer panicked"))??;
        }

        let exit_code = output.status.code();
        #[cfg(unix)]
        let signal = {
            use std::os::unix::process::ExitStatusExt;
            output.status.signal()
        };
        #[cfg(not(unix))]
        let signal = None;

        Ok(ExecutionResult {
            stdout: output.stdout,
            stderr: output.stderr,
            exit_code,
            signal,
        })
    }
}

/// Run `invocation` to completion.
#[tracing::instrument(skip_all, fields(program = %invocation.program.display()))]
pub fn run<S: Spawner>(spawner: &S, invocation: &Invocation) -> Result<ExecutionResult, ExecError> {
    tracing::debug!(
        args = ?invocation.args,
        cwd = %invocation.cwd.display(),
        env = invocation.env.len(),
        stdin_bytes = invocation.stdin.len(),
        "spawning"
    );
    let mut child = spawner
        .spawn(invocation)
        .map_err(|source| ExecError::Spawn {
            program: invocation.program.clone(),
            source,
        })?;
    child
        .write_stdin(invocation.stdin.clone())
        .map_err(ExecError::Stdin)?;
    let result = child.wait().map_err(ExecError::Wait)?;
    tracing::debug!(
        exit_code = ?result.exit_code,
        signal = ?result.signal,
        stdout_bytes = result.stdout.len(),
        stderr_bytes = result.stderr.len(),
        "process finished"
    );
    Ok(result)
}
