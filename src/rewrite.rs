//! Pre-conversion rewrite pass: sequential renumbering plus page-size
//! stripping.
//!
//! ## Why rewrite at all?
//!
//! dvips's page-range arguments (`-pp`) select by *TeX* page number, not by
//! sequential position. "`-pp 7`" can match a front-matter page "vii", a body
//! page "7", and any number of appendix pages also numbered "7" — so feeding
//! the converter the original numbering silently selects the wrong pages
//! whenever numbering is not strictly sequential. On top of that, dvips
//! point-blank refuses page-size or orientation overrides when the source
//! stream already carries a `papersize` special.
//!
//! The fix is a temporary copy of the document in which
//!
//! 1. every page's `c0` count register is replaced by its sequential index
//!    (`0..page_count`), and
//! 2. every `papersize` special payload is overwritten with spaces.
//!
//! Both edits preserve the byte length of every page, so the page table of
//! the rewritten document is identical to the original's.
//!
//! Each page is transformed by a pure function over its explicit byte range;
//! there is no shared scanning cursor to save and restore.

use crate::document::{scan_specials, DviDocument};
use crate::error::ExportError;
use std::io::Write;
use tempfile::NamedTempFile;
use tracing::{debug, warn};

/// An owned, rewritten copy of a [`DviDocument`].
///
/// Lifetime is scoped to one export request: the backing temporary file
/// (created by [`RewrittenDocument::write_temp`]) is deleted when the
/// request finishes or is aborted, converter failure included.
#[derive(Debug)]
pub struct RewrittenDocument {
    document: DviDocument,
}

impl RewrittenDocument {
    /// The rewritten document (sequential numbering, papersize neutralized).
    pub fn document(&self) -> &DviDocument {
        &self.document
    }

    /// Serialize the rewritten bytes to a new temporary file. The returned
    /// handle deletes the file on drop; keep it alive for as long as the
    /// converter needs the path.
    pub fn write_temp(&self) -> Result<NamedTempFile, ExportError> {
        self.write_to(NamedTempFile::new())
    }

    /// Like [`RewrittenDocument::write_temp`], but in a specific directory.
    /// The coordinator places the copy next to the source so relative
    /// `PSfile=` references still resolve from the converter's working
    /// directory.
    pub fn write_temp_in(&self, dir: &std::path::Path) -> Result<NamedTempFile, ExportError> {
        self.write_to(NamedTempFile::new_in(dir))
    }

    fn write_to(
        &self,
        tmp: std::io::Result<NamedTempFile>,
    ) -> Result<NamedTempFile, ExportError> {
        let mut tmp = tmp.map_err(|e| ExportError::TempFileFailed { source: e })?;
        tmp.write_all(self.document.bytes())
            .map_err(|e| ExportError::TempFileFailed { source: e })?;
        tmp.flush()
            .map_err(|e| ExportError::TempFileFailed { source: e })?;
        debug!("Rewritten DVI written to {}", tmp.path().display());
        Ok(tmp)
    }
}

/// Produce a renumbered copy of `doc` with all page-size directives
/// neutralized.
///
/// Returns `Ok(None)` when rewriting is not possible — the document has zero
/// pages, or a page does not scan as a well-formed opcode stream. In that
/// case the caller feeds the converter the original document unchanged.
pub fn rewrite(doc: &DviDocument) -> Result<Option<RewrittenDocument>, ExportError> {
    if doc.page_count() == 0 {
        debug!("Rewrite skipped: document has no pages");
        return Ok(None);
    }

    let table = doc.page_table();
    let mut out = Vec::with_capacity(doc.bytes().len());
    out.extend_from_slice(&doc.bytes()[..table[0]]);

    for page in 0..doc.page_count() {
        match rewritten_page_bytes(doc, page) {
            Ok(bytes) => out.extend_from_slice(&bytes),
            Err(e) => {
                warn!("Rewrite skipped: page {} did not scan cleanly: {e}", page);
                return Ok(None);
            }
        }
    }

    out.extend_from_slice(&doc.bytes()[table[doc.page_count()]..]);
    debug_assert_eq!(out.len(), doc.bytes().len());

    let document = DviDocument::from_bytes(out)?;
    Ok(Some(RewrittenDocument { document }))
}

/// Pure per-page transform: the page's bytes with its logical page number
/// replaced by the sequential index and any `papersize` special payload
/// overwritten with spaces. Output length always equals input length.
fn rewritten_page_bytes(doc: &DviDocument, page: usize) -> Result<Vec<u8>, ExportError> {
    let range = doc.page_range(page);
    let base = range.start;
    let mut bytes = doc.bytes()[range.clone()].to_vec();

    // c0 sits right after the BOP opcode.
    bytes[1..5].copy_from_slice(&(page as i32).to_be_bytes());

    for span in scan_specials(doc.bytes(), range)? {
        let payload = &doc.bytes()[span.clone()];
        if payload.starts_with(b"papersize") {
            bytes[span.start - base..span.end - base].fill(b' ');
        }
    }
    Ok(bytes)
}
