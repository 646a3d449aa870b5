//! # dviexport
//!
//! Export DVI documents to PDF or PostScript by driving the standard TeX
//! converters (`dvipdfm`, `dvips`) as supervised external processes, with an
//! optional pre-conversion rewrite of the DVI byte stream.
//!
//! ## Why a rewrite pass
//!
//! Editors that support forward/inverse search renumber pages internally, so
//! the logical page numbers stored in a DVI file on disk may be arbitrary.
//! `dvips` page-selection options (`-pp`) address pages by those stored
//! numbers, and its papersize handling conflicts with `papersize` specials
//! embedded by some macro packages. The rewrite pass makes both converters
//! behave predictably: it renumbers pages sequentially from zero and blanks
//! embedded papersize directives, all without changing the length of the
//! file or any page.
//!
//! ## Pipeline
//!
//! ```text
//! DviDocument ──▶ rewrite (optional) ──▶ temp file ──▶ converter process
//!      │                                                      │
//!      └── validation (pages, graphics, tool) ────────────────┴──▶ ExportHost
//! ```
//!
//! ## Quick start
//!
//! ```no_run
//! use dviexport::{DviDocument, ExportCoordinator, ExportFormat, ExportRequest, NoopHost};
//! use std::sync::Arc;
//!
//! # async fn demo() -> Result<(), dviexport::ExportError> {
//! let doc = DviDocument::load("paper.dvi")?;
//! let coordinator = ExportCoordinator::new(Arc::new(NoopHost));
//! let request = ExportRequest::builder(ExportFormat::Pdf)
//!     .document(doc)
//!     .output("paper.pdf")
//!     .build();
//! if let Some(id) = coordinator.export(request)? {
//!     coordinator.wait(id).await?;
//! }
//! # Ok(())
//! # }
//! ```

pub mod document;
pub mod error;
pub mod export;
pub mod host;
pub mod request;
pub mod resolve;
pub mod rewrite;
pub mod supervise;

pub use document::{DviDocument, PageSizeRecord};
pub use error::ExportError;
pub use export::{ExportCoordinator, ExportId};
pub use host::{ExportHost, NoopHost, SharedHost};
pub use request::{ExportFormat, ExportRequest, ExportRequestBuilder};
pub use resolve::resolve_tool;
pub use rewrite::{rewrite, RewrittenDocument};
pub use supervise::{
    AbortHandle, LaunchSpec, ProcessOutcome, ProcessState, ProcessSupervisor, RunningProcess,
};
