//! Export request types.
//!
//! An [`ExportRequest`] is created per user-initiated export action, is
//! immutable once built, and is destroyed when the export completes or is
//! cancelled. Each request is exclusively owned by the coordinator's
//! active-request registry; nothing is shared between concurrent requests.

use crate::document::DviDocument;
use serde::{Deserialize, Serialize};
use std::fmt;
use std::path::PathBuf;

/// Target converter family.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ExportFormat {
    /// Export via `dvipdfm`.
    Pdf,
    /// Export via `dvips`.
    PostScript,
}

impl ExportFormat {
    /// Converter executable name looked up on the search path.
    pub fn tool(self) -> &'static str {
        match self {
            ExportFormat::Pdf => "dvipdfm",
            ExportFormat::PostScript => "dvips",
        }
    }

    /// Output filename extension.
    pub fn extension(self) -> &'static str {
        match self {
            ExportFormat::Pdf => "pdf",
            ExportFormat::PostScript => "ps",
        }
    }

    /// Save-dialog filter string handed to the host.
    pub fn filter(self) -> &'static str {
        match self {
            ExportFormat::Pdf => "*.pdf|Portable Document Format (*.pdf)",
            ExportFormat::PostScript => "*.ps|PostScript (*.ps)",
        }
    }
}

impl fmt::Display for ExportFormat {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ExportFormat::Pdf => write!(f, "PDF"),
            ExportFormat::PostScript => write!(f, "PostScript"),
        }
    }
}

/// One export action: source document, target, converter options.
///
/// Built via [`ExportRequest::builder`]. The `options` list is passed to the
/// converter verbatim, after any format flags and before the input path.
#[derive(Debug, Clone)]
pub struct ExportRequest {
    /// Source document. Validation fails when absent.
    pub document: Option<DviDocument>,
    /// Target converter family.
    pub format: ExportFormat,
    /// Output file path. When `None`, the host's save dialog supplies one
    /// (or the request is silently abandoned).
    pub output: Option<PathBuf>,
    /// Converter-specific options, e.g. `["-pp", "3"]` for dvips. Only
    /// meaningful on the PostScript path; a PDF request carrying options
    /// fails validation.
    pub options: Vec<String>,
    /// Force the renumbering rewrite even when no option or page-size
    /// directive would trigger it.
    pub force_renumber: bool,
    /// Physical printer the finished output should be handed to. Presence
    /// also suppresses the hyperlink-export flag on the PostScript path.
    pub printer_target: Option<String>,
    /// Use this converter executable instead of looking up the format's
    /// default tool name on the search path.
    pub converter_override: Option<PathBuf>,
}

impl ExportRequest {
    /// Start building a request for the given target format.
    pub fn builder(format: ExportFormat) -> ExportRequestBuilder {
        ExportRequestBuilder {
            request: ExportRequest {
                document: None,
                format,
                output: None,
                options: Vec::new(),
                force_renumber: false,
                printer_target: None,
                converter_override: None,
            },
        }
    }
}

/// Builder for [`ExportRequest`].
#[derive(Debug)]
pub struct ExportRequestBuilder {
    request: ExportRequest,
}

impl ExportRequestBuilder {
    pub fn document(mut self, doc: DviDocument) -> Self {
        self.request.document = Some(doc);
        self
    }

    pub fn output(mut self, path: impl Into<PathBuf>) -> Self {
        self.request.output = Some(path.into());
        self
    }

    pub fn option(mut self, opt: impl Into<String>) -> Self {
        self.request.options.push(opt.into());
        self
    }

    pub fn options(mut self, opts: impl IntoIterator<Item = impl Into<String>>) -> Self {
        self.request.options.extend(opts.into_iter().map(Into::into));
        self
    }

    pub fn force_renumber(mut self, v: bool) -> Self {
        self.request.force_renumber = v;
        self
    }

    pub fn printer_target(mut self, printer: impl Into<String>) -> Self {
        self.request.printer_target = Some(printer.into());
        self
    }

    pub fn converter(mut self, path: impl Into<PathBuf>) -> Self {
        self.request.converter_override = Some(path.into());
        self
    }

    pub fn build(self) -> ExportRequest {
        self.request
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn format_tools_and_extensions() {
        assert_eq!(ExportFormat::Pdf.tool(), "dvipdfm");
        assert_eq!(ExportFormat::PostScript.tool(), "dvips");
        assert_eq!(ExportFormat::Pdf.extension(), "pdf");
        assert_eq!(ExportFormat::PostScript.extension(), "ps");
    }

    #[test]
    fn builder_accumulates_options_in_order() {
        let req = ExportRequest::builder(ExportFormat::PostScript)
            .option("-pp")
            .option("3")
            .options(["-t", "a4"])
            .build();
        assert_eq!(req.options, vec!["-pp", "3", "-t", "a4"]);
        assert!(req.document.is_none());
        assert!(!req.force_renumber);
    }
}
