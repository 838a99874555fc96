//! External tool boundary.
//!
//! The Postgres pipeline never spawns processes itself; it builds
//! [`CommandSpec`]s and hands them to a [`CommandRunner`].

use std::fmt;
use std::process::Stdio;
use std::time::Duration;

use async_trait::async_trait;
use tokio::process::Command;
use tracing::{debug, warn};

use crate::error::{Result, SyncError};
use crate::postgres::Phase;

/// One external tool invocation.
#[derive(Clone)]
pub struct CommandSpec {
    pub phase: Phase,
    pub program: String,
    pub args: Vec<String>,
    /// Extra environment for the child (`PGPASSWORD`, `PGSSLMODE`).
    pub env: Vec<(&'static str, String)>,
}

impl CommandSpec {
    pub fn new(phase: Phase, program: impl Into<String>) -> Self {
        Self {
            phase,
            program: program.into(),
            args: Vec::new(),
            env: Vec::new(),
        }
    }

    pub fn arg(mut self, arg: impl Into<String>) -> Self {
        self.args.push(arg.into());
        self
    }

    pub fn args<I, S>(mut self, args: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.args.extend(args.into_iter().map(Into::into));
        self
    }

    pub fn env(mut self, key: &'static str, value: impl Into<String>) -> Self {
        self.env.push((key, value.into()));
        self
    }

    /// Value of the `-c` argument, if any.
    pub fn sql(&self) -> Option<&str> {
        let pos = self.args.iter().position(|a| a == "-c")?;
        self.args.get(pos + 1).map(String::as_str)
    }
}

// Env values carry passwords; only the keys are printed.
impl fmt::Debug for CommandSpec {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let env_keys: Vec<&str> = self.env.iter().map(|(k, _)| *k).collect();
        f.debug_struct("CommandSpec")
            .field("phase", &self.phase)
            .field("program", &self.program)
            .field("args", &self.args)
            .field("env", &env_keys)
            .finish()
    }
}

/// Result of a completed invocation.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ExecResult {
    /// `-1` when the process was terminated by a signal.
    pub exit_code: i32,
    pub stdout: String,
    pub stderr: String,
}

impl ExecResult {
    pub fn success(&self) -> bool {
        self.exit_code == 0
    }
}

/// Runs external tools.
///
/// Implementations return `Ok` for any process that ran to completion,
/// whatever its exit code; interpreting the code is the caller's business.
#[async_trait]
pub trait CommandRunner: Send + Sync {
    async fn run(&self, spec: &CommandSpec) -> Result<ExecResult>;
}

/// Spawns real processes with `tokio::process`, bounded by a timeout.
pub struct ProcessRunner {
    timeout: Duration,
}

impl ProcessRunner {
    pub fn new(timeout: Duration) -> Self {
        Self { timeout }
    }
}

#[async_trait]
impl CommandRunner for ProcessRunner {
    async fn run(&self, spec: &CommandSpec) -> Result<ExecResult> {
        debug!(phase = %spec.phase, program = %spec.program, "exec");

        let child = Command::new(&spec.program)
            .args(&spec.args)
            .envs(spec.env.iter().map(|(k, v)| (*k, v.as_str())))
            .stdin(Stdio::null())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            // Dropping the wait future on timeout kills the child.
            .kill_on_drop(true)
            .spawn()
            .map_err(|source| SyncError::Spawn {
                phase: spec.phase,
                program: spec.program.clone(),
                source,
            })?;

        match tokio::time::timeout(self.timeout, child.wait_with_output()).await {
            Ok(Ok(output)) => Ok(ExecResult {
                exit_code: output.status.code().unwrap_or(-1),
                stdout: String::from_utf8_lossy(&output.stdout).into_owned(),
                stderr: String::from_utf8_lossy(&output.stderr).into_owned(),
            }),
            Ok(Err(e)) => Err(SyncError::Io(e)),
            Err(_elapsed) => {
                warn!(phase = %spec.phase, program = %spec.program, timeout_secs = self.timeout.as_secs(), "tool timed out, killed");
                Err(SyncError::Timeout {
                    phase: spec.phase,
                    secs: self.timeout.as_secs(),
                })
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn builder_and_sql_lookup() {
        let spec = CommandSpec::new(Phase::CreateExtension, "psql")
            .args(["-h", "db.local"])
            .arg("-c")
            .arg("SELECT 1;")
            .env("PGPASSWORD", "hunter2");
        assert_eq!(spec.sql(), Some("SELECT 1;"));
        assert_eq!(CommandSpec::new(Phase::Dump, "pg_dump").sql(), None);
    }

    #[test]
    fn debug_hides_env_values() {
        let spec = CommandSpec::new(Phase::Dump, "pg_dump").env("PGPASSWORD", "hunter2");
        let dbg = format!("{spec:?}");
        assert!(dbg.contains("PGPASSWORD"));
        assert!(!dbg.contains("hunter2"));
    }

    #[cfg(unix)]
    #[tokio::test]
    async fn captures_exit_code_and_stderr() {
        let runner = ProcessRunner::new(Duration::from_secs(10));
        let spec = CommandSpec::new(Phase::Restore, "sh")
            .arg("-c")
            .arg("echo out; echo \"$MOLE_TEST_VAR\" >&2; exit 3")
            .env("MOLE_TEST_VAR", "from-env");
        let result = runner.run(&spec).await.unwrap();
        assert_eq!(result.exit_code, 3);
        assert!(!result.success());
        assert_eq!(result.stdout.trim(), "out");
        assert_eq!(result.stderr.trim(), "from-env");
    }

    #[cfg(unix)]
    #[tokio::test]
    async fn slow_tool_times_out() {
        let runner = ProcessRunner::new(Duration::from_millis(100));
        let spec = CommandSpec::new(Phase::Dump, "sleep").arg("5");
        let err = runner.run(&spec).await.unwrap_err();
        assert!(matches!(err, SyncError::Timeout { phase: Phase::Dump, .. }));
    }

    #[tokio::test]
    async fn missing_program_is_a_spawn_error() {
        let runner = ProcessRunner::new(Duration::from_secs(1));
        let spec = CommandSpec::new(Phase::Dump, "definitely-not-a-real-binary-mole");
        let err = runner.run(&spec).await.unwrap_err();
        assert_eq!(err.code(), "SPAWN");
    }
}
