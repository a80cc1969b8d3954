//! External command execution.
//!
//! Every change to the host goes through a [`CommandRunner`]. The real
//! implementation spawns processes with `tokio::process`; the
//! [`RecordingRunner`] only records what would have been run, which backs
//! both `--dry-run` and the test suite.

use async_trait::async_trait;
use std::sync::{Arc, Mutex, MutexGuard};
use thiserror::Error;
use tokio::process::Command as TokioCommand;
use tracing::{debug, warn};

/// Failure to run an external command.
#[derive(Debug, Error)]
pub enum CommandError {
    #[error("failed to spawn `{command}`: {source}")]
    Spawn {
        command: String,
        #[source]
        source: std::io::Error,
    },

    #[error("`{command}` failed (exit code: {code:?}): {output}")]
    Exit {
        command: String,
        code: Option<i32>,
        output: String,
    },
}

impl CommandError {
    /// Captured output of the failed command, empty if it never started.
    pub fn output(&self) -> &str {
        match self {
            CommandError::Spawn { .. } => "",
            CommandError::Exit { output, .. } => output,
        }
    }
}

pub type CommandResult = Result<Vec<u8>, CommandError>;

/// Runs one external command to completion.
///
/// Implementations return the combined output on success and never treat a
/// non-zero exit as anything other than an `Err`. `argv` must not be empty.
#[async_trait]
pub trait CommandRunner: Send + Sync {
    async fn run(&self, argv: &[String]) -> CommandResult;
}

#[async_trait]
impl<T: CommandRunner + ?Sized> CommandRunner for Arc<T> {
    async fn run(&self, argv: &[String]) -> CommandResult {
        (**self).run(argv).await
    }
}

/// Builds an owned argv from string slices.
pub fn argv<S: AsRef<str>>(parts: &[S]) -> Vec<String> {
    parts.iter().map(|s| s.as_ref().to_string()).collect()
}

pub(crate) fn display_argv(argv: &[String]) -> String {
    argv.join(" ")
}

fn check_argv(argv: &[String]) {
    // An empty argv can only come from a caller bug.
    assert!(!argv.is_empty(), "command argv is empty; need argv[0]");
}

/// Runs `argv` and logs the command and its output when it fails.
pub async fn run_logged<R>(runner: &R, what: &str, argv: &[String]) -> CommandResult
where
    R: CommandRunner + ?Sized,
{
    let result = runner.run(argv).await;
    if let Err(err) = &result {
        warn!(command = %display_argv(argv), output = %err.output(), "{what} failed: {err}");
    }
    result
}

/// Spawns real processes.
#[derive(Debug, Default, Clone, Copy)]
pub struct SystemRunner;

#[async_trait]
impl CommandRunner for SystemRunner {
    async fn run(&self, argv: &[String]) -> CommandResult {
        check_argv(argv);
        let command = display_argv(argv);
        debug!(%command, "running command");

        let output = TokioCommand::new(&argv[0])
            .args(&argv[1..])
            .output()
            .await
            .map_err(|source| CommandError::Spawn {
                command: command.clone(),
                source,
            })?;

        let mut combined = output.stdout;
        combined.extend_from_slice(&output.stderr);

        if output.status.success() {
            Ok(combined)
        } else {
            Err(CommandError::Exit {
                command,
                code: output.status.code(),
                output: String::from_utf8_lossy(&combined).trim().to_string(),
            })
        }
    }
}

type Matcher = Box<dyn Fn(&[String]) -> bool + Send + Sync>;

/// Records commands instead of running them.
///
/// Every call succeeds with empty output unless a failure or a canned
/// response was registered for it.
#[derive(Default)]
pub struct RecordingRunner {
    calls: Mutex<Vec<Vec<String>>>,
    failures: Vec<Matcher>,
    responses: Vec<(Matcher, Vec<u8>)>,
}

impl RecordingRunner {
    pub fn new() -> Self {
        Self::default()
    }

    /// Fail every command for which `pred` returns true.
    pub fn fail_when<F>(mut self, pred: F) -> Self
    where
        F: Fn(&[String]) -> bool + Send + Sync + 'static,
    {
        self.failures.push(Box::new(pred));
        self
    }

    /// Answer commands matching `pred` with `output`. First match wins.
    pub fn respond_when<F>(mut self, pred: F, output: impl Into<Vec<u8>>) -> Self
    where
        F: Fn(&[String]) -> bool + Send + Sync + 'static,
    {
        self.responses.push((Box::new(pred), output.into()));
        self
    }

    fn lock(&self) -> MutexGuard<'_, Vec<Vec<String>>> {
        self.calls.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    /// Every command seen so far, in order.
    pub fn calls(&self) -> Vec<Vec<String>> {
        self.lock().clone()
    }

    /// Returns the recorded commands and forgets them.
    pub fn take_calls(&self) -> Vec<Vec<String>> {
        std::mem::take(&mut *self.lock())
    }
}

#[async_trait]
impl CommandRunner for RecordingRunner {
    async fn run(&self, argv: &[String]) -> CommandResult {
        check_argv(argv);
        self.lock().push(argv.to_vec());

        let output = self
            .responses
            .iter()
            .find(|(pred, _)| pred(argv))
            .map(|(_, out)| out.clone())
            .unwrap_or_default();

        if self.failures.iter().any(|pred| pred(argv)) {
            return Err(CommandError::Exit {
                command: display_argv(argv),
                code: Some(1),
                output: String::from_utf8_lossy(&output).into_owned(),
            });
        }
        Ok(output)
    }
}
