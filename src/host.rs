//! Host-collaborator trait for export events and interactive decisions.
//!
//! The library core owns processes and files but never owns presentation:
//! the host application (document viewer, CLI, test harness) decides how
//! converter output is shown, where files are saved, and whether existing
//! files may be overwritten. An `Arc<dyn ExportHost>` is the least-invasive
//! integration point — hosts can forward events to a terminal, a dialog, or
//! a channel without the library knowing anything about how the application
//! communicates.
//!
//! All methods have defaults so hosts only override what they care about.
//! Implementations must be `Send + Sync`: multiple exports can be active
//! concurrently, each delivering events from its own task.

use std::path::{Path, PathBuf};
use std::sync::Arc;

/// Callbacks exposed to the export core.
pub trait ExportHost: Send + Sync {
    /// A new chunk of combined converter output arrived. Carries only the
    /// newly received bytes, never the accumulated buffer.
    fn on_output_chunk(&self, bytes: &[u8]) {
        let _ = bytes;
    }

    /// The export finished. Not called for cancelled requests.
    fn on_completed(&self, success: bool) {
        let _ = success;
    }

    /// Ask the user for an output path. `None` abandons the request
    /// silently (not an error).
    fn request_save_path(&self, suggested: &Path, filter: &str) -> Option<PathBuf> {
        let _ = (suggested, filter);
        None
    }

    /// The chosen output path already exists; may it be overwritten?
    fn confirm_overwrite(&self, path: &Path) -> bool {
        let _ = path;
        true
    }

    /// Hand a finished output file to the physical printer. Only called when
    /// the request carried a printer target and the run succeeded.
    fn print_file(&self, path: &Path) {
        let _ = path;
    }

    /// Surface a user-visible failure message (the converter-specific error
    /// template) after a nonzero exit.
    fn report_failure(&self, message: &str) {
        let _ = message;
    }
}

/// A no-op host for callers that don't need any of the events.
pub struct NoopHost;

impl ExportHost for NoopHost {}

/// Convenience alias matching the type the coordinator stores.
pub type SharedHost = Arc<dyn ExportHost>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn noop_host_defaults_do_not_panic() {
        let host = NoopHost;
        host.on_output_chunk(b"chunk");
        host.on_completed(true);
        assert!(host
            .request_save_path(Path::new("a.dvi"), "*.pdf|PDF")
            .is_none());
        assert!(host.confirm_overwrite(Path::new("a.pdf")));
        host.print_file(Path::new("a.ps"));
        host.report_failure("boom");
    }

    #[test]
    fn arc_dyn_host_works() {
        let host: SharedHost = Arc::new(NoopHost);
        host.on_completed(false);
    }
}
