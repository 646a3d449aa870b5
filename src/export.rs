//! Export coordination: one entry point per export request.
//!
//! ## Flow
//!
//! [`ExportCoordinator::export`] validates the request synchronously — no
//! process is launched, no temporary file is written, and no host dialog
//! state is touched when a precondition fails. It then decides whether the
//! pre-conversion rewrite is needed, resolves the converter executable,
//! launches a [`crate::supervise::ProcessSupervisor`], and returns an
//! [`ExportId`] immediately; completion is observed through the
//! [`crate::host::ExportHost`] callbacks, not through the return value.
//!
//! ## Ownership
//!
//! Multiple exports may be active concurrently. Each lives in the
//! coordinator's active-request registry as an independently owned entry
//! identified by its [`ExportId`], with explicit removal on completion —
//! no shared ownership between requests. The rewritten temporary file is
//! owned by the request's task and deleted on every exit path: success,
//! converter failure, cancellation.

use crate::error::ExportError;
use crate::host::SharedHost;
use crate::request::{ExportFormat, ExportRequest};
use crate::resolve::resolve_tool;
use crate::rewrite;
use crate::supervise::{
    AbortHandle, LaunchSpec, ProcessOutcome, ProcessState, ProcessSupervisor, RunningProcess,
};
use futures::StreamExt;
use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex};
use tempfile::NamedTempFile;
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};

/// Opaque identifier for an active export request.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct ExportId(u64);

impl std::fmt::Display for ExportId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "export-{}", self.0)
    }
}

struct ActiveExport {
    abort: Option<AbortHandle>,
    done: Option<JoinHandle<Result<(), ExportError>>>,
}

/// Orchestrates export requests and owns the active-request registry.
pub struct ExportCoordinator {
    host: SharedHost,
    active: Arc<Mutex<HashMap<ExportId, ActiveExport>>>,
    next_id: AtomicU64,
}

impl ExportCoordinator {
    pub fn new(host: SharedHost) -> Self {
        Self {
            host,
            active: Arc::new(Mutex::new(HashMap::new())),
            next_id: AtomicU64::new(1),
        }
    }

    /// Number of exports currently in the active-request registry. Entries
    /// are released at terminal state, whether or not [`ExportCoordinator::wait`]
    /// is ever called.
    pub fn active_count(&self) -> usize {
        self.active.lock().expect("registry poisoned").len()
    }

    /// Start one export. Returns as soon as the converter is launched.
    ///
    /// `Ok(None)` means the request was abandoned silently: the user declined
    /// the save dialog or the overwrite prompt. That is a cancellation, not
    /// an error. Must be called from within a tokio runtime.
    pub fn export(&self, request: ExportRequest) -> Result<Option<ExportId>, ExportError> {
        // ── Preconditions, checked before anything is created ────────────
        let doc = request.document.as_ref().ok_or(ExportError::MissingDocument)?;
        let source = doc
            .path()
            .ok_or(ExportError::MissingDocument)?
            .to_path_buf();

        match std::fs::File::open(&source) {
            Ok(_) => {}
            Err(e) if e.kind() == std::io::ErrorKind::PermissionDenied => {
                return Err(ExportError::SourceNotReadable { path: source })
            }
            Err(_) => return Err(ExportError::SourceNotFound { path: source }),
        }

        if request.format == ExportFormat::Pdf && !request.options.is_empty() {
            return Err(ExportError::UnsupportedOptions {
                options: request.options.clone(),
            });
        }

        if request.format == ExportFormat::PostScript {
            if doc.page_count() == 0 {
                return Err(ExportError::MalformedDocument {
                    detail: "document has no pages".into(),
                });
            }
            let non_ps = doc.external_non_ps_count()?;
            if non_ps != 0 {
                return Err(ExportError::ExternalNonPsGraphics { count: non_ps });
            }
        }

        let tool = match &request.converter_override {
            Some(path) => resolve_tool(&path.to_string_lossy())?,
            None => resolve_tool(request.format.tool())?,
        };

        // ── Output path, interactively if the request left it unset ──────
        let output = match &request.output {
            Some(p) if p.as_os_str().is_empty() => return Err(ExportError::EmptyOutputPath),
            Some(p) => p.clone(),
            None => {
                let suggested = source.with_extension(request.format.extension());
                let Some(chosen) = self
                    .host
                    .request_save_path(&suggested, request.format.filter())
                else {
                    info!("Export abandoned: no output path chosen");
                    return Ok(None);
                };
                if chosen.as_os_str().is_empty() {
                    return Err(ExportError::EmptyOutputPath);
                }
                if chosen.exists() && !self.host.confirm_overwrite(&chosen) {
                    info!("Export abandoned: overwrite declined");
                    return Ok(None);
                }
                chosen
            }
        };

        // ── Rewrite decision ─────────────────────────────────────────────
        let directive = doc.page_size_directive().ok().flatten();
        let needs_rewrite =
            request.force_renumber || !request.options.is_empty() || directive.is_some();

        let mut tmp: Option<NamedTempFile> = None;
        let input_path = if needs_rewrite {
            match rewrite::rewrite(doc)? {
                Some(rewritten) => {
                    let dir = source.parent().unwrap_or_else(|| Path::new("."));
                    let file = rewritten.write_temp_in(dir)?;
                    let path = file.path().to_path_buf();
                    tmp = Some(file);
                    path
                }
                None => source.clone(),
            }
        } else {
            debug!("Rewrite not needed; converting the original file");
            source.clone()
        };

        // ── Launch ───────────────────────────────────────────────────────
        let spec = LaunchSpec {
            command: tool,
            args: build_args(&request, &input_path, &output),
            working_dir: source.parent().map(Path::to_path_buf),
            error_message: format!(
                "The external program '{}', which was used to export the file, \
                 reported an error.",
                request.format.tool()
            ),
        };

        info!("Export: {} to {}", source.display(), request.format);
        let mut proc = ProcessSupervisor::start(spec)?;

        let id = ExportId(self.next_id.fetch_add(1, Ordering::Relaxed));
        let abort = proc.abort_handle();

        // Register under the lock so the completion task, which acquires the
        // same lock to release the slot, always finds its entry in place.
        let mut registry = self.active.lock().expect("registry poisoned");
        let handle = tokio::spawn(run_to_completion(
            Arc::clone(&self.host),
            Arc::clone(&self.active),
            id,
            proc,
            tmp,
            request.printer_target.is_some(),
            output,
        ));
        registry.insert(
            id,
            ActiveExport {
                abort,
                done: Some(handle),
            },
        );
        drop(registry);

        Ok(Some(id))
    }

    /// Cancel an active export. Kills the converter, discards pending
    /// output, and suppresses completion reporting for the request.
    /// Returns false when the id is unknown or already terminal.
    pub fn cancel(&self, id: ExportId) -> bool {
        let handle = self
            .active
            .lock()
            .expect("registry poisoned")
            .get_mut(&id)
            .and_then(|entry| entry.abort.take());
        match handle {
            Some(h) => {
                h.abort();
                true
            }
            None => false,
        }
    }

    /// Wait for one export to reach its terminal state. `Ok(())` when the id
    /// is unknown — the export already completed (its slot was released at
    /// terminal state) or was never started. Catching a failure through the
    /// return value therefore requires calling this before completion; the
    /// host callbacks observe the outcome in all cases.
    /// The export stays cancellable from other tasks while this waits.
    pub async fn wait(&self, id: ExportId) -> Result<(), ExportError> {
        let handle = {
            let mut registry = self.active.lock().expect("registry poisoned");
            match registry.get_mut(&id) {
                Some(entry) => entry.done.take(),
                None => return Ok(()),
            }
        };
        let result = match handle {
            Some(h) => h
                .await
                .map_err(|e| ExportError::Internal(format!("export task failed: {e}"))),
            None => Ok(Ok(())),
        };
        self.active.lock().expect("registry poisoned").remove(&id);
        result?
    }
}

/// Argument order per converter:
/// `dvipdfm -o <out> <in>`; `dvips [-z] <options…> <in> -o <out>`.
fn build_args(request: &ExportRequest, input: &Path, output: &Path) -> Vec<String> {
    let mut args = Vec::new();
    match request.format {
        ExportFormat::Pdf => {
            args.push("-o".into());
            args.push(output.to_string_lossy().into_owned());
            args.push(input.to_string_lossy().into_owned());
        }
        ExportFormat::PostScript => {
            if request.printer_target.is_none() {
                // Export hyperlinks
                args.push("-z".into());
            }
            args.extend(request.options.iter().cloned());
            args.push(input.to_string_lossy().into_owned());
            args.push("-o".into());
            args.push(output.to_string_lossy().into_owned());
        }
    }
    args
}

/// Drive one request from running converter to terminal state, then release
/// its resources. The temporary rewritten file (if any) is owned here and
/// dropped on every return path.
async fn run_to_completion(
    host: SharedHost,
    active: Arc<Mutex<HashMap<ExportId, ActiveExport>>>,
    id: ExportId,
    mut proc: RunningProcess,
    tmp: Option<NamedTempFile>,
    print_when_done: bool,
    output: PathBuf,
) -> Result<(), ExportError> {
    let result = async {
        if let Some(chunks) = proc.output_chunks() {
            relay_chunks(chunks, || proc.state() == ProcessState::Aborted, &host).await;
        }

        let message = proc.error_message().to_string();
        match proc.wait().await? {
            ProcessOutcome::Finished { exit_code: 0, .. } => {
                if print_when_done && is_readable_file(&output) {
                    host.print_file(&output);
                }
                host.on_completed(true);
                Ok(())
            }
            ProcessOutcome::Finished { exit_code, output: diag } => {
                warn!("Converter failed with exit code {exit_code}");
                host.report_failure(&message);
                host.on_completed(false);
                Err(ExportError::ConversionFailed {
                    message,
                    exit_code,
                    output: diag,
                })
            }
            // Cancelled requests report nothing further; a late finish
            // notification must not re-enter completion logic.
            ProcessOutcome::Aborted => Err(ExportError::Cancelled),
        }
    }
    .await;

    // Terminal: release the registry slot. A waiter in progress has already
    // taken the done handle and removes the entry itself after joining;
    // otherwise (callback-only embedders) remove it here so the registry
    // never outlives its requests.
    {
        let mut registry = active.lock().expect("registry poisoned");
        if let Some(entry) = registry.get_mut(&id) {
            entry.abort = None;
            if entry.done.is_some() {
                registry.remove(&id);
            }
        }
    }
    drop(tmp);
    result
}

/// Forward converter output chunks to the host until the stream ends.
/// An abort discards pending output: chunks already queued when `cancelled`
/// turns true are dropped, not delivered.
async fn relay_chunks<S>(mut chunks: S, cancelled: impl Fn() -> bool, host: &SharedHost)
where
    S: futures::Stream<Item = Vec<u8>> + Unpin,
{
    while let Some(chunk) = chunks.next().await {
        if cancelled() {
            break;
        }
        host.on_output_chunk(&chunk);
    }
}

fn is_readable_file(path: &Path) -> bool {
    std::fs::File::open(path).is_ok()
}
