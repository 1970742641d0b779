//! Bounded execution of external tools.

use std::io;
use std::process::{Child, Command, ExitStatus};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::thread;
use std::time::{Duration, Instant};

use derive_more::{Display, Error, From};

const POLL_INTERVAL: Duration = Duration::from_millis(50);

#[derive(Debug, Display, Error, From)]
pub enum ProcessError {
    /// Process could not be started.
    #[display("failed to run {program}: {source}")]
    Spawn { program: String, source: io::Error },
    /// Process exceeded its time budget and was killed.
    #[display("{program} did not finish within {}s", timeout.as_secs())]
    TimedOut {
        program: String,
        timeout: Duration,
    },
    /// Cancellation was requested while the process ran.
    #[display("{_0} was cancelled")]
    Cancelled(#[error(ignore)] String),
    /// Waiting on the process failed.
    #[from]
    Io(io::Error),
}

/// Cooperative cancellation signal shared between threads.
///
/// Once cancelled, every run observing the token is aborted until [reset](Self::reset).
#[derive(Debug, Clone, Default)]
pub struct CancellationToken(Arc<AtomicBool>);

impl CancellationToken {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn cancel(&self) {
        self.0.store(true, Ordering::SeqCst);
    }

    pub fn is_cancelled(&self) -> bool {
        self.0.load(Ordering::SeqCst)
    }

    /// Lets later runs start again.
    pub fn reset(&self) {
        self.0.store(false, Ordering::SeqCst);
    }
}

fn program_name(command: &Command) -> String {
    command.get_program().to_string_lossy().into_owned()
}

fn kill(child: &mut Child) {
    if let Err(e) = child.kill() {
        log::warn!(target: "process", "Killing child process {} failed: {e}", child.id());
    }
    let _ = child.wait();
}

/// Runs `command` to completion, killing it once `timeout` elapses or `cancel` is tripped.
pub fn run(
    command: &mut Command,
    timeout: Duration,
    cancel: &CancellationToken,
) -> Result<ExitStatus, ProcessError> {
    let program = program_name(command);
    log::trace!(
        target: "process",
        "Running: {program} {}",
        command
            .get_args()
            .map(|arg| arg.to_string_lossy())
            .collect::<Vec<_>>()
            .join(" ")
    );

    let mut child = command.spawn().map_err(|source| ProcessError::Spawn {
        program: program.clone(),
        source,
    })?;
    let deadline = Instant::now() + timeout;

    loop {
        if let Some(status) = child.try_wait()? {
            return Ok(status);
        }
        if cancel.is_cancelled() {
            kill(&mut child);
            return Err(ProcessError::Cancelled(program));
        }
        if Instant::now() >= deadline {
            kill(&mut child);
            return Err(ProcessError::TimedOut { program, timeout });
        }
        thread::sleep(POLL_INTERVAL);
    }
}

#[cfg(all(test, unix))]
mod tests {
    use super::*;

    #[test]
    fn returns_exit_status() {
        let status = run(
            Command::new("sh").args(["-c", "exit 3"]),
            Duration::from_secs(5),
            &CancellationToken::new(),
        )
        .unwrap();
        assert_eq!(status.code(), Some(3));
    }

    #[test]
    fn kills_on_timeout() {
        let started = Instant::now();
        let err = run(
            Command::new("sleep").arg("10"),
            Duration::from_millis(200),
            &CancellationToken::new(),
        )
        .unwrap_err();
        assert!(matches!(err, ProcessError::TimedOut { .. }));
        assert!(started.elapsed() < Duration::from_secs(5));
    }

    #[test]
    fn honours_cancellation() {
        let cancel = CancellationToken::new();
        cancel.cancel();
        let err = run(Command::new("sleep").arg("10"), Duration::from_secs(30), &cancel).unwrap_err();
        assert!(matches!(err, ProcessError::Cancelled(_)));
    }

    #[test]
    fn reset_token_allows_later_runs() {
        let cancel = CancellationToken::new();
        cancel.cancel();
        assert!(run(Command::new("sleep").arg("10"), Duration::from_secs(30), &cancel).is_err());

        cancel.reset();
        let status = run(&mut Command::new("true"), Duration::from_secs(5), &cancel).unwrap();
        assert!(status.success());
    }

    #[test]
    fn missing_program() {
        let err = run(
            &mut Command::new("definitely-not-a-real-binary-pos"),
            Duration::from_secs(1),
            &CancellationToken::new(),
        )
        .unwrap_err();
        assert!(matches!(err, ProcessError::Spawn { .. }));
    }
}
