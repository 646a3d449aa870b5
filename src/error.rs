//! Error types for the dviexport library.
//!
//! All failures here are **terminal for the request**: there are no automatic
//! retries anywhere in the export path. A failed export requires a fresh
//! user-initiated export to try again.
//!
//! The taxonomy mirrors the stages of an export:
//!
//! * Validation errors — detected synchronously before any converter process
//!   is launched, any temporary file is written, or any host callback fires.
//! * [`ExportError::ToolNotFound`] — the converter executable could not be
//!   located on the search path.
//! * [`ExportError::LaunchFailed`] — the OS refused to spawn the process.
//! * [`ExportError::ConversionFailed`] — the converter ran and exited with a
//!   nonzero status; the accumulated combined output is attached for
//!   diagnostics.
//! * [`ExportError::Cancelled`] — user-initiated, not treated as a failure by
//!   the coordinator; it suppresses any later success/failure reporting for
//!   the same request.

use std::path::PathBuf;
use thiserror::Error;

/// All errors returned by the dviexport library.
#[derive(Debug, Error)]
pub enum ExportError {
    // ── Validation errors ─────────────────────────────────────────────────
    /// The export request carried no source document.
    #[error("No DVI document attached to the export request")]
    MissingDocument,

    /// Source file was not found at the given path.
    #[error("DVI file not found: '{path}'\nCheck the path exists and is readable.")]
    SourceNotFound { path: PathBuf },

    /// Process does not have read permission on the source file.
    #[error("Permission denied reading '{path}'\nTry: chmod +r {path:?}")]
    SourceNotReadable { path: PathBuf },

    /// The file exists and was read, but does not start with the DVI preamble.
    #[error("File is not a valid DVI: '{path}'\nFirst bytes: {magic:?} (expected [247, 2])")]
    NotADviFile { path: PathBuf, magic: [u8; 2] },

    /// The page table could not be derived from the postamble, or a page's
    /// byte range does not scan as a well-formed opcode stream.
    #[error("DVI document is malformed: {detail}")]
    MalformedDocument { detail: String },

    /// The document references external graphics in a format the PostScript
    /// converter cannot embed. There is no workaround; export to PDF instead.
    #[error(
        "The DVI file references {count} external graphic file(s) that are not \
         in PostScript format and cannot be handled by dvips.\n\
         Export to PDF instead."
    )]
    ExternalNonPsGraphics { count: usize },

    /// Converter options were supplied on the PDF path, where dvipdfm is
    /// invoked with the output and input paths only. Rejected up front
    /// rather than silently dropped from the argument vector.
    #[error(
        "Converter options {options:?} are not supported when exporting to PDF.\n\
         dvipdfm receives only the output and input paths; page selection and \
         other converter options apply to PostScript export."
    )]
    UnsupportedOptions { options: Vec<String> },

    /// The host declined to supply an output path and the request had none.
    /// Distinct from [`ExportError::Cancelled`]: an *empty* path supplied by a
    /// non-interactive caller is a validation error, while a user pressing
    /// Cancel in the save dialog is a silent abandonment.
    #[error("No output path was given for the export")]
    EmptyOutputPath,

    // ── Tool resolution ───────────────────────────────────────────────────
    /// The converter executable could not be located.
    #[error(
        "Could not locate the program '{name}'. That program is essential for \
         the export function to work.\n\
         The PATH environment variable was consulted when looking for it."
    )]
    ToolNotFound { name: String },

    // ── Process errors ────────────────────────────────────────────────────
    /// The OS-level spawn failed (bad binary, resource exhaustion, …).
    #[error("Failed to start '{command}': {source}")]
    LaunchFailed {
        command: String,
        #[source]
        source: std::io::Error,
    },

    /// The converter exited with a nonzero status.
    ///
    /// `message` is the caller-supplied, converter-specific error template;
    /// `output` is everything the child wrote to stdout and stderr combined.
    #[error("{message}\nExit code {exit_code}. Converter output:\n{output}")]
    ConversionFailed {
        message: String,
        exit_code: i32,
        output: String,
    },

    /// The export was cancelled by the user before the converter finished.
    #[error("Export cancelled")]
    Cancelled,

    // ── I/O errors ────────────────────────────────────────────────────────
    /// Could not create or write the temporary rewritten DVI file.
    #[error("Failed to write temporary rewritten DVI: {source}")]
    TempFileFailed {
        #[source]
        source: std::io::Error,
    },

    // ── Catch-all ─────────────────────────────────────────────────────────
    /// Unexpected internal error.
    #[error("Internal error: {0}")]
    Internal(String),
}
