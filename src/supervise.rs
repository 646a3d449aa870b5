//! Asynchronous supervision of one external converter process.
//!
//! ## Model
//!
//! One [`ProcessSupervisor::start`] call owns one child process for its whole
//! life: spawn, stream combined output, observe termination, cooperative
//! cancellation. The caller is never blocked — `start` returns as soon as the
//! OS has spawned the child, and a driver task owns the process from there.
//! The control thread resumes on three asynchronous events: an output chunk
//! arriving, the process exiting, or the user aborting.
//!
//! States: `Idle → Starting → Running → {Finished(exit_code), Aborted}`.
//! The terminal state is whichever transition is *delivered* first:
//!
//! * [`AbortHandle::abort`] called before [`RunningProcess::wait`] returns
//!   yields `Aborted`, even when the child has already exited and its finish
//!   notification is in flight. Pending output is discarded.
//! * Once `wait` has returned `Finished`, a later abort is a no-op (the
//!   handle consumes itself; the child is already gone).
//!
//! The abort branch of the driver's `select!` is `biased` first, so a kill
//! request is never starved by a chatty child. Dropping a still-running
//! [`RunningProcess`] aborts the child — an export must never leave an
//! unsupervised converter behind — and the spawned `Command` additionally
//! sets `kill_on_drop` as a backstop.
//!
//! stdout and stderr are merged into a single incremental chunk stream
//! regardless of the platform's native process I/O model; each notification
//! carries only the newly received bytes, never the whole buffer.

use crate::error::ExportError;
use std::path::PathBuf;
use std::process::Stdio;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use tokio::io::AsyncReadExt;
use tokio::process::{Child, ChildStderr, ChildStdout, Command};
use tokio::sync::{mpsc, oneshot};
use tokio::task::JoinHandle;
use tokio_stream::wrappers::UnboundedReceiverStream;
use tracing::{debug, info, warn};

/// Lifecycle of a supervised process.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ProcessState {
    Idle,
    Starting,
    Running,
    Finished(i32),
    Aborted,
}

/// Everything needed to launch one converter invocation.
#[derive(Debug, Clone)]
pub struct LaunchSpec {
    /// Resolved executable path.
    pub command: PathBuf,
    /// Argument vector, already in converter order.
    pub args: Vec<String>,
    /// Working directory for the child (the input file's directory).
    pub working_dir: Option<PathBuf>,
    /// User-visible message template reported when the child exits nonzero.
    pub error_message: String,
}

/// Terminal result of a supervised process.
#[derive(Debug)]
pub enum ProcessOutcome {
    /// The child terminated on its own.
    Finished {
        exit_code: i32,
        /// Accumulated combined stdout + stderr.
        output: String,
    },
    /// The supervisor killed the child on request (or the handle was
    /// dropped while running). Pending output was discarded.
    Aborted,
}

impl ProcessOutcome {
    /// Terminal [`ProcessState`] for this outcome.
    pub fn state(&self) -> ProcessState {
        match self {
            ProcessOutcome::Finished { exit_code, .. } => ProcessState::Finished(*exit_code),
            ProcessOutcome::Aborted => ProcessState::Aborted,
        }
    }
}

/// One-shot cancellation handle. Consuming `abort` makes "at most once"
/// structural rather than a runtime check.
#[derive(Debug)]
pub struct AbortHandle {
    tx: oneshot::Sender<()>,
    aborted: Arc<AtomicBool>,
}

impl AbortHandle {
    /// Kill the child and mark the request aborted. A finish notification
    /// still in flight will be suppressed at delivery.
    pub fn abort(self) {
        self.aborted.store(true, Ordering::SeqCst);
        let _ = self.tx.send(());
    }
}

/// A running supervised process.
#[derive(Debug)]
pub struct RunningProcess {
    driver: Option<JoinHandle<ProcessOutcome>>,
    chunks: Option<mpsc::UnboundedReceiver<Vec<u8>>>,
    abort_tx: Option<oneshot::Sender<()>>,
    aborted: Arc<AtomicBool>,
    error_message: String,
}

impl RunningProcess {
    /// The caller-supplied failure message template from the launch spec.
    pub fn error_message(&self) -> &str {
        &self.error_message
    }

    /// Current coarse state. Terminal states are observed via
    /// [`RunningProcess::wait`].
    pub fn state(&self) -> ProcessState {
        if self.aborted.load(Ordering::SeqCst) {
            ProcessState::Aborted
        } else {
            ProcessState::Running
        }
    }

    /// Detach the cancellation handle. Can be taken at most once.
    pub fn abort_handle(&mut self) -> Option<AbortHandle> {
        self.abort_tx.take().map(|tx| AbortHandle {
            tx,
            aborted: Arc::clone(&self.aborted),
        })
    }

    /// Incremental combined-output stream: each item is the newly received
    /// chunk, not the full buffer. Can be taken at most once.
    pub fn output_chunks(&mut self) -> Option<UnboundedReceiverStream<Vec<u8>>> {
        self.chunks.take().map(UnboundedReceiverStream::new)
    }

    /// Wait for the terminal state. An abort issued before this returns wins
    /// over a finish notification already in flight.
    pub async fn wait(mut self) -> Result<ProcessOutcome, ExportError> {
        let driver = self
            .driver
            .take()
            .ok_or_else(|| ExportError::Internal("process already waited".into()))?;
        let outcome = driver
            .await
            .map_err(|e| ExportError::Internal(format!("supervisor task failed: {e}")))?;
        if self.aborted.load(Ordering::SeqCst) {
            return Ok(ProcessOutcome::Aborted);
        }
        Ok(outcome)
    }
}

impl Drop for RunningProcess {
    fn drop(&mut self) {
        // Dropping while running has abort semantics: the child must not
        // continue unsupervised.
        if self.driver.is_some() {
            self.aborted.store(true, Ordering::SeqCst);
            if let Some(tx) = self.abort_tx.take() {
                let _ = tx.send(());
            }
        }
    }
}

/// Builder-free entry point: spawn and supervise one process.
pub struct ProcessSupervisor;

impl ProcessSupervisor {
    /// Launch the child described by `spec`. Non-blocking: returns as soon
    /// as the spawn succeeds; completion is observed via
    /// [`RunningProcess::wait`].
    pub fn start(spec: LaunchSpec) -> Result<RunningProcess, ExportError> {
        debug!(
            "Starting {} {}",
            spec.command.display(),
            spec.args.join(" ")
        );

        let mut cmd = Command::new(&spec.command);
        cmd.args(&spec.args)
            .stdin(Stdio::null())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .kill_on_drop(true);
        if let Some(dir) = &spec.working_dir {
            cmd.current_dir(dir);
        }

        let mut child = cmd.spawn().map_err(|e| ExportError::LaunchFailed {
            command: spec.command.display().to_string(),
            source: e,
        })?;
        info!("Started {} (pid {:?})", spec.command.display(), child.id());

        let stdout = child
            .stdout
            .take()
            .ok_or_else(|| ExportError::Internal("child stdout was not captured".into()))?;
        let stderr = child
            .stderr
            .take()
            .ok_or_else(|| ExportError::Internal("child stderr was not captured".into()))?;

        let (chunks_tx, chunks_rx) = mpsc::unbounded_channel();
        let (abort_tx, abort_rx) = oneshot::channel();
        let aborted = Arc::new(AtomicBool::new(false));

        let driver = tokio::spawn(drive(child, stdout, stderr, abort_rx, chunks_tx));

        Ok(RunningProcess {
            driver: Some(driver),
            chunks: Some(chunks_rx),
            abort_tx: Some(abort_tx),
            aborted,
            error_message: spec.error_message,
        })
    }
}

/// Own the child until a terminal state: forward output chunks as they
/// arrive, then reap the exit status — unless an abort arrives first.
async fn drive(
    mut child: Child,
    mut stdout: ChildStdout,
    mut stderr: ChildStderr,
    mut abort_rx: oneshot::Receiver<()>,
    chunks_tx: mpsc::UnboundedSender<Vec<u8>>,
) -> ProcessOutcome {
    let mut out_buf = [0u8; 4096];
    let mut err_buf = [0u8; 4096];
    let mut out_open = true;
    let mut err_open = true;
    let mut abort_armed = true;
    let mut collected = String::new();

    // Nobody listening on the chunk channel is fine; the accumulated buffer
    // still feeds diagnostics on failure.
    fn deliver(collected: &mut String, tx: &mpsc::UnboundedSender<Vec<u8>>, data: &[u8]) {
        collected.push_str(&String::from_utf8_lossy(data));
        let _ = tx.send(data.to_vec());
    }

    loop {
        tokio::select! {
            biased;

            res = &mut abort_rx, if abort_armed => match res {
                Ok(()) => {
                    warn!("Aborting child process");
                    let _ = child.start_kill();
                    let _ = child.wait().await;
                    return ProcessOutcome::Aborted;
                }
                // Handle dropped without aborting: disarm the branch.
                Err(_) => abort_armed = false,
            },

            res = stdout.read(&mut out_buf), if out_open => match res {
                Ok(0) | Err(_) => out_open = false,
                Ok(n) => deliver(&mut collected, &chunks_tx, &out_buf[..n]),
            },

            res = stderr.read(&mut err_buf), if err_open => match res {
                Ok(0) | Err(_) => err_open = false,
                Ok(n) => deliver(&mut collected, &chunks_tx, &err_buf[..n]),
            },

            status = child.wait(), if !out_open && !err_open => {
                let exit_code = match status {
                    Ok(s) => s.code().unwrap_or(-1),
                    Err(_) => -1,
                };
                debug!("Child exited with code {exit_code}");
                return ProcessOutcome::Finished {
                    exit_code,
                    output: collected,
                };
            }
        }
    }
}
