//! In-memory DVI document: source bytes plus the derived page table.
//!
//! ## Why derive the page table up front?
//!
//! Every downstream decision — renumbering, page-size stripping, the
//! PostScript-path precondition on external graphics — needs to address pages
//! by byte range. A DVI file records its page boundaries only as a backward
//! chain of BOP pointers reachable from the postamble, so we walk that chain
//! once at load time and keep an ordered offset table with a sentinel end
//! offset. Invariant: offsets are strictly increasing and
//! `page_count == page_table.len() - 1`.
//!
//! Only the slice of the format needed for export is interpreted here:
//! page boundaries, the `c0` count register (the logical page number),
//! and `\special` payloads (`papersize`, `PSfile=`). Everything else is
//! skipped opcode-by-opcode without interpretation.

use crate::error::ExportError;
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};
use tracing::debug;

// DVI opcodes referenced by name. The full opcode space is handled by
// `skip_opcode` below.
pub(crate) const BOP: u8 = 139;
pub(crate) const EOP: u8 = 140;
pub(crate) const XXX1: u8 = 239;
pub(crate) const PRE: u8 = 247;
pub(crate) const POST: u8 = 248;
pub(crate) const POST_POST: u8 = 249;
pub(crate) const DVI_ID: u8 = 2;
pub(crate) const FILL: u8 = 223;

/// Byte length of a BOP command: opcode + ten 4-byte count registers +
/// 4-byte pointer to the previous BOP.
pub(crate) const BOP_LEN: usize = 45;

/// A `papersize` special embedded in the document.
///
/// Some converters (dvips in particular) refuse explicit page-size or
/// orientation overrides when the source stream already carries one of these,
/// which is why the rewriter neutralizes them before export.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PageSizeRecord {
    /// 0-indexed page the directive was found on.
    pub page: usize,
    /// Raw special payload, e.g. `papersize=614.295pt,794.96999pt`.
    pub raw: String,
}

/// An immutable DVI document with its derived page table.
#[derive(Debug, Clone)]
pub struct DviDocument {
    path: Option<PathBuf>,
    bytes: Vec<u8>,
    /// BOP byte offsets in page order, plus the POST offset as sentinel.
    page_table: Vec<usize>,
}

impl DviDocument {
    /// Load a DVI file from disk, validating magic bytes and deriving the
    /// page table.
    pub fn load(path: impl AsRef<Path>) -> Result<Self, ExportError> {
        let path = path.as_ref();
        let bytes = match std::fs::read(path) {
            Ok(b) => b,
            Err(e) if e.kind() == std::io::ErrorKind::PermissionDenied => {
                return Err(ExportError::SourceNotReadable {
                    path: path.to_path_buf(),
                })
            }
            Err(_) => {
                return Err(ExportError::SourceNotFound {
                    path: path.to_path_buf(),
                })
            }
        };

        if bytes.len() < 2 || bytes[0] != PRE || bytes[1] != DVI_ID {
            let mut magic = [0u8; 2];
            for (m, b) in magic.iter_mut().zip(bytes.iter()) {
                *m = *b;
            }
            return Err(ExportError::NotADviFile {
                path: path.to_path_buf(),
                magic,
            });
        }

        let mut doc = Self::from_bytes(bytes)?;
        doc.path = Some(path.to_path_buf());
        debug!(
            "Loaded DVI: {} ({} pages)",
            path.display(),
            doc.page_count()
        );
        Ok(doc)
    }

    /// Build a document from raw DVI bytes, deriving the page table from the
    /// postamble's backward BOP chain.
    pub fn from_bytes(bytes: Vec<u8>) -> Result<Self, ExportError> {
        let page_table = derive_page_table(&bytes)?;
        Ok(Self {
            path: None,
            bytes,
            page_table,
        })
    }

    /// Path the document was loaded from, if any.
    pub fn path(&self) -> Option<&Path> {
        self.path.as_deref()
    }

    /// Raw DVI bytes.
    pub fn bytes(&self) -> &[u8] {
        &self.bytes
    }

    /// Page count. One less than the page-table length.
    pub fn page_count(&self) -> usize {
        self.page_table.len() - 1
    }

    /// Ordered BOP byte offsets, one more than the page count (the last
    /// entry is the POST offset).
    pub fn page_table(&self) -> &[usize] {
        &self.page_table
    }

    /// Byte range of a page (BOP through the byte before the next BOP).
    pub fn page_range(&self, page: usize) -> std::ops::Range<usize> {
        self.page_table[page]..self.page_table[page + 1]
    }

    /// Logical (TeX) page numbers in page order: the `c0` count register of
    /// each BOP. These may repeat and need not be monotonic — front matter
    /// "vii" followed by body page "7" is the classic case.
    pub fn logical_page_numbers(&self) -> Vec<i32> {
        self.page_table[..self.page_count()]
            .iter()
            .map(|&off| i32::from_be_bytes(self.bytes[off + 1..off + 5].try_into().unwrap()))
            .collect()
    }

    /// First `papersize` special in the document, if any.
    pub fn page_size_directive(&self) -> Result<Option<PageSizeRecord>, ExportError> {
        for page in 0..self.page_count() {
            for span in scan_specials(&self.bytes, self.page_range(page))? {
                let payload = &self.bytes[span.clone()];
                if payload.starts_with(b"papersize") {
                    return Ok(Some(PageSizeRecord {
                        page,
                        raw: String::from_utf8_lossy(payload).into_owned(),
                    }));
                }
            }
        }
        Ok(None)
    }

    /// Number of `PSfile=` specials referencing graphics that are not in
    /// PostScript format (extension other than `.ps`/`.eps`).
    ///
    /// dvips cannot embed those, so a nonzero count makes the PostScript
    /// export path refuse the document outright.
    pub fn external_non_ps_count(&self) -> Result<usize, ExportError> {
        let mut count = 0;
        for page in 0..self.page_count() {
            for span in scan_specials(&self.bytes, self.page_range(page))? {
                let payload = &self.bytes[span.clone()];
                if let Some(name) = psfile_name(payload) {
                    if !is_postscript_name(&name) {
                        count += 1;
                    }
                }
            }
        }
        Ok(count)
    }
}

/// Read a big-endian u32 at `off`.
pub(crate) fn be_u32(bytes: &[u8], off: usize) -> u32 {
    u32::from_be_bytes(bytes[off..off + 4].try_into().unwrap())
}

fn malformed(detail: impl Into<String>) -> ExportError {
    ExportError::MalformedDocument {
        detail: detail.into(),
    }
}

/// Walk the postamble and the backward BOP chain into an ordered offset
/// table. A document with zero pages yields `[post_offset]`.
fn derive_page_table(bytes: &[u8]) -> Result<Vec<usize>, ExportError> {
    const NO_PAGE: u32 = 0xFFFF_FFFF;

    if bytes.len() < 20 {
        return Err(malformed("file too short for a postamble"));
    }

    // Trailing fill bytes, then the id byte, then POST_POST.
    let mut i = bytes.len() - 1;
    while i > 0 && bytes[i] == FILL {
        i -= 1;
    }
    if bytes.len() - 1 - i < 4 {
        return Err(malformed("fewer than four trailing fill bytes"));
    }
    if bytes[i] != DVI_ID {
        return Err(malformed(format!("unsupported DVI id {}", bytes[i])));
    }
    if i < 6 {
        return Err(malformed("postamble overlaps preamble"));
    }
    let post_post = i - 5;
    if bytes[post_post] != POST_POST {
        return Err(malformed("post-postamble opcode missing"));
    }

    let post = be_u32(bytes, post_post + 1) as usize;
    if post + 5 > post_post || bytes[post] != POST {
        return Err(malformed("postamble pointer does not point at POST"));
    }

    // Backward chain from the last page. Pointers must strictly decrease,
    // which also rules out cycles.
    let mut offsets = Vec::new();
    let mut cur = be_u32(bytes, post + 1);
    while cur != NO_PAGE {
        let off = cur as usize;
        if off + BOP_LEN > post || bytes[off] != BOP {
            return Err(malformed(format!("page pointer {off} does not point at BOP")));
        }
        offsets.push(off);
        let prev = be_u32(bytes, off + 41);
        if prev != NO_PAGE && prev as usize >= off {
            return Err(malformed("page pointers are not strictly decreasing"));
        }
        cur = prev;
    }
    offsets.reverse();
    offsets.push(post);
    Ok(offsets)
}

/// Scan one page's opcode stream and return the byte ranges of every
/// `\special` payload (XXX1–XXX4).
///
/// This is a pure function over an explicit byte range: no shared scanning
/// state, no current-page cursor. The range must start at a BOP and contain a
/// terminating EOP.
pub(crate) fn scan_specials(
    bytes: &[u8],
    range: std::ops::Range<usize>,
) -> Result<Vec<std::ops::Range<usize>>, ExportError> {
    let mut specials = Vec::new();
    let end = range.end;
    let mut pos = range.start;

    if pos >= end || bytes[pos] != BOP {
        return Err(malformed(format!("page at {pos} does not start with BOP")));
    }
    pos += BOP_LEN;

    fn need(end: usize, pos: usize, n: usize, op: u8) -> Result<(), ExportError> {
        if pos + 1 + n > end {
            Err(malformed(format!("opcode {op} truncated at {pos}")))
        } else {
            Ok(())
        }
    }

    while pos < end {
        let op = bytes[pos];
        if op == EOP {
            return Ok(specials);
        }
        match op {
            // set_char_0 … set_char_127, push/pop, nop, w0/x0/y0/z0, fnt_num.
            // EOP is listed for exhaustiveness; it is consumed above.
            0..=127 | 138 | 140 | 141 | 142 | 147 | 152 | 161 | 166 | 171..=234 => {
                pos += 1;
            }
            // set1–set4, put1–put4
            128..=131 => {
                need(end, pos, (op - 127) as usize, op)?;
                pos += 1 + (op - 127) as usize;
            }
            133..=136 => {
                need(end, pos, (op - 132) as usize, op)?;
                pos += 1 + (op - 132) as usize;
            }
            // set_rule / put_rule
            132 | 137 => {
                need(end, pos, 8, op)?;
                pos += 9;
            }
            // right1–right4, w1–w4, x1–x4, down1–down4, y1–y4, z1–z4, fnt1–fnt4
            143..=146 => {
                need(end, pos, (op - 142) as usize, op)?;
                pos += 1 + (op - 142) as usize;
            }
            148..=151 => {
                need(end, pos, (op - 147) as usize, op)?;
                pos += 1 + (op - 147) as usize;
            }
            153..=156 => {
                need(end, pos, (op - 152) as usize, op)?;
                pos += 1 + (op - 152) as usize;
            }
            157..=160 => {
                need(end, pos, (op - 156) as usize, op)?;
                pos += 1 + (op - 156) as usize;
            }
            162..=165 => {
                need(end, pos, (op - 161) as usize, op)?;
                pos += 1 + (op - 161) as usize;
            }
            167..=170 => {
                need(end, pos, (op - 166) as usize, op)?;
                pos += 1 + (op - 166) as usize;
            }
            235..=238 => {
                need(end, pos, (op - 234) as usize, op)?;
                pos += 1 + (op - 234) as usize;
            }
            // xxx1–xxx4: k-byte length then k payload bytes
            239..=242 => {
                let klen = (op - 238) as usize;
                need(end, pos, klen, op)?;
                let mut k = 0usize;
                for j in 0..klen {
                    k = (k << 8) | bytes[pos + 1 + j] as usize;
                }
                let payload_start = pos + 1 + klen;
                if payload_start + k > end {
                    return Err(malformed(format!("special truncated at {pos}")));
                }
                specials.push(payload_start..payload_start + k);
                pos = payload_start + k;
            }
            // fnt_def1–fnt_def4
            243..=246 => {
                let klen = (op - 242) as usize;
                need(end, pos, klen + 14, op)?;
                let a = bytes[pos + klen + 13] as usize;
                let l = bytes[pos + klen + 14] as usize;
                need(end, pos, klen + 14 + a + l, op)?;
                pos += 1 + klen + 14 + a + l;
            }
            BOP | PRE | POST | POST_POST | 250..=255 => {
                return Err(malformed(format!("unexpected opcode {op} inside page at {pos}")));
            }
        }
    }
    Err(malformed("page has no terminating EOP"))
}

/// Extract the referenced filename from a `PSfile=` special, if this is one.
fn psfile_name(payload: &[u8]) -> Option<String> {
    let text = std::str::from_utf8(payload).ok()?;
    let rest = text.strip_prefix("PSfile=")?;
    let name = if let Some(stripped) = rest.strip_prefix('"') {
        stripped.split('"').next()?
    } else {
        rest.split_whitespace().next()?
    };
    Some(name.to_string())
}

fn is_postscript_name(name: &str) -> bool {
    let lower = name.to_ascii_lowercase();
    lower.ends_with(".ps") || lower.ends_with(".eps")
}

// ── Test fixtures ────────────────────────────────────────────────────────

/// Synthetic DVI construction for unit tests. Produces structurally valid
/// files: preamble, BOP/EOP page frames with backward pointers, specials,
/// postamble with page pointer, post-postamble and fill bytes.
#[cfg(test)]
pub(crate) mod fixtures {
    use super::*;

    pub(crate) struct PageSpec {
        pub number: i32,
        pub specials: Vec<Vec<u8>>,
    }

    impl PageSpec {
        pub fn plain(number: i32) -> Self {
            Self {
                number,
                specials: Vec::new(),
            }
        }

        pub fn with_special(number: i32, payload: &[u8]) -> Self {
            Self {
                number,
                specials: vec![payload.to_vec()],
            }
        }
    }

    pub(crate) fn build_dvi(pages: &[PageSpec]) -> Vec<u8> {
        let mut out = Vec::new();

        // Preamble: PRE, id, num, den, mag, empty comment.
        out.push(PRE);
        out.push(DVI_ID);
        out.extend_from_slice(&25_400_000u32.to_be_bytes());
        out.extend_from_slice(&473_628_672u32.to_be_bytes());
        out.extend_from_slice(&1000u32.to_be_bytes());
        out.push(0);

        let mut prev: u32 = 0xFFFF_FFFF;
        let mut last_bop: u32 = 0xFFFF_FFFF;
        for page in pages {
            let bop_off = out.len() as u32;
            out.push(BOP);
            out.extend_from_slice(&page.number.to_be_bytes());
            for _ in 0..9 {
                out.extend_from_slice(&0i32.to_be_bytes());
            }
            out.extend_from_slice(&prev.to_be_bytes());
            // A little page content: set_char opcodes.
            out.extend_from_slice(&[72, 105]);
            for sp in &page.specials {
                assert!(sp.len() < 256, "fixture specials fit in xxx1");
                out.push(XXX1);
                out.push(sp.len() as u8);
                out.extend_from_slice(sp);
            }
            out.push(EOP);
            prev = bop_off;
            last_bop = bop_off;
        }

        // Postamble.
        let post_off = out.len() as u32;
        out.push(POST);
        out.extend_from_slice(&last_bop.to_be_bytes());
        out.extend_from_slice(&25_400_000u32.to_be_bytes());
        out.extend_from_slice(&473_628_672u32.to_be_bytes());
        out.extend_from_slice(&1000u32.to_be_bytes());
        out.extend_from_slice(&0u32.to_be_bytes()); // tallest page height+depth
        out.extend_from_slice(&0u32.to_be_bytes()); // widest page width
        out.extend_from_slice(&2u16.to_be_bytes()); // max stack depth
        out.extend_from_slice(&(pages.len() as u16).to_be_bytes());

        out.push(POST_POST);
        out.extend_from_slice(&post_off.to_be_bytes());
        out.push(DVI_ID);
        while out.len() % 4 != 0 || out.iter().rev().take_while(|&&b| b == FILL).count() < 4 {
            out.push(FILL);
        }
        out
    }
}
