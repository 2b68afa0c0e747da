// src/sys/command.rs

use std::process::{Output, Stdio};
use tokio::io::AsyncWriteExt;
use tokio::process::Command;
use tracing::debug;

use crate::error::BackendError;

/// Captured result of a finished process.
pub struct CommandOutput {
    pub success: bool,
    pub exit_code: i32,
    pub stdout: String,
    pub stderr: String,
}

impl CommandOutput {
    fn from_output(program: &str, output: Output) -> Self {
        let exit_code = output.status.code().unwrap_or(-1);
        debug!(program, exit_code, "process finished");
        Self {
            success: output.status.success(),
            exit_code,
            stdout: String::from_utf8_lossy(&output.stdout).to_string(),
            stderr: String::from_utf8_lossy(&output.stderr).to_string(),
        }
    }
}

/// An executable plus fixed leading arguments, e.g. `docker` or
/// `sudo -n docker`. Parsed from whitespace separated configuration.
/// 🛡️ Zero-Trust: argv only. Nothing here is ever passed through `sh -c`.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Program {
    program: String,
    prefix: Vec<String>,
}

impl Program {
    pub fn new(program: impl Into<String>) -> Self {
        Self { program: program.into(), prefix: Vec::new() }
    }

    /// `None` for an empty argv.
    pub fn from_argv(argv: &[String]) -> Option<Self> {
        let (program, prefix) = argv.split_first()?;
        Some(Self { program: program.clone(), prefix: prefix.to_vec() })
    }

    pub fn name(&self) -> &str {
        &self.program
    }

    /// A fresh command with the prefix already applied.
    pub fn command(&self) -> Command {
        let mut cmd = Command::new(&self.program);
        cmd.args(&self.prefix).kill_on_drop(false);
        cmd
    }

    pub async fn run<I, S>(&self, args: I) -> Result<CommandOutput, BackendError>
    where
        I: IntoIterator<Item = S>,
        S: AsRef<std::ffi::OsStr>,
    {
        let output = self
            .command()
            .args(args)
            .output()
            .await
            .map_err(|e| BackendError::unavailable(format!("failed to spawn {}: {}", self.program, e)))?;
        Ok(CommandOutput::from_output(&self.program, output))
    }

    pub async fn run_checked<I, S>(&self, args: I) -> Result<String, BackendError>
    where
        I: IntoIterator<Item = S>,
        S: AsRef<std::ffi::OsStr>,
    {
        checked(&self.program, self.run(args).await?)
    }

    /// Like [`run_checked`](Self::run_checked), but feeds `input` on stdin.
    /// Secrets belong here rather than in argv, which any local user can read
    /// from `/proc/<pid>/cmdline`.
    pub async fn run_with_input<I, S>(&self, args: I, input: &[u8]) -> Result<String, BackendError>
    where
        I: IntoIterator<Item = S>,
        S: AsRef<std::ffi::OsStr>,
    {
        let mut child = self
            .command()
            .args(args)
            .stdin(Stdio::piped())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .spawn()
            .map_err(|e| BackendError::unavailable(format!("failed to spawn {}: {}", self.program, e)))?;

        let mut stdin = child
            .stdin
            .take()
            .ok_or_else(|| BackendError::unavailable(format!("{} stdin unavailable", self.program)))?;
        let write = stdin.write_all(input).await;
        // Closing stdin tells the child the script is complete.
        drop(stdin);

        let output = child
            .wait_with_output()
            .await
            .map_err(|e| BackendError::unavailable(format!("{} did not finish: {}", self.program, e)))?;
        let stdout = checked(&self.program, CommandOutput::from_output(&self.program, output))?;
        write.map_err(|e| BackendError::unavailable(format!("failed to write to {}: {}", self.program, e)))?;
        Ok(stdout)
    }
}

fn checked(program: &str, out: CommandOutput) -> Result<String, BackendError> {
    if !out.success {
        return Err(BackendError::unavailable(format!(
            "{} exited with code {}: {}",
            program,
            out.exit_code,
            out.stderr.trim()
        )));
    }
    Ok(out.stdout)
}
