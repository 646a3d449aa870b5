//! End-to-end integration tests for dviexport.
//!
//! These tests drive [`ExportCoordinator`] against fake converter scripts
//! instead of a TeX installation, so they are hermetic and fast. The scripts
//! are plain `/bin/sh`, which is why the whole file is unix-only.
//!
//! Run with:
//!   cargo test --test exporter -- --nocapture
#![cfg(unix)]

use dviexport::{
    DviDocument, ExportCoordinator, ExportError, ExportFormat, ExportHost, ExportRequest,
};
use std::os::unix::fs::PermissionsExt;
use std::path::{Path, PathBuf};
use std::sync::{Arc, Mutex};
use tempfile::TempDir;

// ── Test helpers ─────────────────────────────────────────────────────────────

struct PageSpec {
    number: i32,
    specials: Vec<Vec<u8>>,
}

impl PageSpec {
    fn plain(number: i32) -> Self {
        Self {
            number,
            specials: Vec::new(),
        }
    }

    fn with_special(number: i32, payload: &[u8]) -> Self {
        Self {
            number,
            specials: vec![payload.to_vec()],
        }
    }
}

/// Build a structurally valid DVI byte stream: preamble, BOP/EOP page frames
/// with backward pointers, specials, postamble and fill bytes.
fn build_dvi(pages: &[PageSpec]) -> Vec<u8> {
    const PRE: u8 = 247;
    const POST: u8 = 248;
    const POST_POST: u8 = 249;
    const BOP: u8 = 139;
    const EOP: u8 = 140;
    const XXX1: u8 = 239;
    const DVI_ID: u8 = 2;
    const FILL: u8 = 223;

    let mut out = Vec::new();
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
        out.extend_from_slice(&[72, 105]);
        for sp in &page.specials {
            out.push(XXX1);
            out.push(sp.len() as u8);
            out.extend_from_slice(sp);
        }
        out.push(EOP);
        prev = bop_off;
        last_bop = bop_off;
    }

    let post_off = out.len() as u32;
    out.push(POST);
    out.extend_from_slice(&last_bop.to_be_bytes());
    out.extend_from_slice(&25_400_000u32.to_be_bytes());
    out.extend_from_slice(&473_628_672u32.to_be_bytes());
    out.extend_from_slice(&1000u32.to_be_bytes());
    out.extend_from_slice(&0u32.to_be_bytes());
    out.extend_from_slice(&0u32.to_be_bytes());
    out.extend_from_slice(&2u16.to_be_bytes());
    out.extend_from_slice(&(pages.len() as u16).to_be_bytes());
    out.push(POST_POST);
    out.extend_from_slice(&post_off.to_be_bytes());
    out.push(DVI_ID);
    while out.len() % 4 != 0 || out.iter().rev().take_while(|&&b| b == FILL).count() < 4 {
        out.push(FILL);
    }
    out
}

/// Write a DVI file under `dir` and load it back as a document.
fn write_document(dir: &Path, name: &str, pages: &[PageSpec]) -> DviDocument {
    let path = dir.join(name);
    std::fs::write(&path, build_dvi(pages)).unwrap();
    DviDocument::load(&path).unwrap()
}

/// Install an executable `/bin/sh` script under `dir` and return its path.
fn fake_converter(dir: &Path, name: &str, body: &str) -> PathBuf {
    let path = dir.join(name);
    std::fs::write(&path, format!("#!/bin/sh\n{body}\n")).unwrap();
    std::fs::set_permissions(&path, std::fs::Permissions::from_mode(0o755)).unwrap();
    path
}

/// Host that records every callback for later assertions.
#[derive(Default)]
struct RecordingHost {
    chunks: Mutex<Vec<u8>>,
    completions: Mutex<Vec<bool>>,
    failures: Mutex<Vec<String>>,
    printed: Mutex<Vec<PathBuf>>,
}

impl RecordingHost {
    fn output_text(&self) -> String {
        String::from_utf8_lossy(&self.chunks.lock().unwrap()).into_owned()
    }

    fn completions(&self) -> Vec<bool> {
        self.completions.lock().unwrap().clone()
    }
}

impl ExportHost for RecordingHost {
    fn on_output_chunk(&self, bytes: &[u8]) {
        self.chunks.lock().unwrap().extend_from_slice(bytes);
    }

    fn on_completed(&self, success: bool) {
        self.completions.lock().unwrap().push(success);
    }

    fn print_file(&self, path: &Path) {
        self.printed.lock().unwrap().push(path.to_path_buf());
    }

    fn report_failure(&self, message: &str) {
        self.failures.lock().unwrap().push(message.to_string());
    }
}

/// Names of regular files directly under `dir`, sorted.
fn dir_entries(dir: &Path) -> Vec<String> {
    let mut names: Vec<String> = std::fs::read_dir(dir)
        .unwrap()
        .map(|e| e.unwrap().file_name().to_string_lossy().into_owned())
        .collect();
    names.sort();
    names
}

// ── Success paths ────────────────────────────────────────────────────────────

#[tokio::test]
async fn pdf_export_without_rewrite_passes_original_file() {
    let dir = TempDir::new().unwrap();
    // Sequential numbering, no options, no papersize: nothing to rewrite.
    let doc = write_document(dir.path(), "paper.dvi", &[PageSpec::plain(0), PageSpec::plain(1)]);
    let source = dir.path().join("paper.dvi");
    let output = dir.path().join("paper.pdf");

    let converter = fake_converter(
        dir.path(),
        "dvipdfm",
        r#"echo "This is dvipdfm"
cp "$3" "$2""#,
    );

    let host = Arc::new(RecordingHost::default());
    let coordinator = ExportCoordinator::new(host.clone());
    let request = ExportRequest::builder(ExportFormat::Pdf)
        .document(doc)
        .output(output.clone())
        .converter(converter)
        .build();

    let id = coordinator.export(request).unwrap().expect("id assigned");
    coordinator.wait(id).await.unwrap();

    // The converter received the source file itself, so the copy matches.
    assert_eq!(
        std::fs::read(&output).unwrap(),
        std::fs::read(&source).unwrap()
    );
    assert!(host.output_text().contains("This is dvipdfm"));
    assert_eq!(host.completions(), vec![true]);
    assert_eq!(coordinator.active_count(), 0);
}

#[tokio::test]
async fn ps_export_rewrites_and_orders_arguments() {
    let dir = TempDir::new().unwrap();
    let doc = write_document(
        dir.path(),
        "report.dvi",
        &[
            PageSpec::with_special(17, b"papersize=a4"),
            PageSpec::plain(3),
        ],
    );
    let source = dir.path().join("report.dvi");
    let output = dir.path().join("report.ps");
    let args_file = dir.path().join("args.txt");
    let input_copy = dir.path().join("input_copy.dvi");

    // Record argv, keep a copy of the input the converter was handed, and
    // produce the output. Argument order: -z <options...> <input> -o <output>.
    let converter = fake_converter(
        dir.path(),
        "dvips",
        &format!(
            r#"printf '%s\n' "$@" > "{args}"
shift 3
cp "$1" "{copy}"
cp "$1" "$3""#,
            args = args_file.display(),
            copy = input_copy.display(),
        ),
    );

    let host = Arc::new(RecordingHost::default());
    let coordinator = ExportCoordinator::new(host.clone());
    let request = ExportRequest::builder(ExportFormat::PostScript)
        .document(doc)
        .output(output.clone())
        .options(["-pp", "1"])
        .converter(converter)
        .build();

    let id = coordinator.export(request).unwrap().expect("id assigned");
    coordinator.wait(id).await.unwrap();

    let args: Vec<String> = std::fs::read_to_string(&args_file)
        .unwrap()
        .lines()
        .map(str::to_string)
        .collect();
    assert_eq!(args[0], "-z");
    assert_eq!(&args[1..3], &["-pp", "1"]);
    assert_eq!(args[4], "-o");
    assert_eq!(args[5], output.display().to_string());

    // The input was a rewritten temporary next to the source, not the source.
    let input_path = PathBuf::from(&args[3]);
    assert_ne!(input_path, source);
    assert_eq!(input_path.parent(), source.parent());

    // Renumbered sequentially, papersize blanked, length preserved.
    let handed = DviDocument::from_bytes(std::fs::read(&input_copy).unwrap()).unwrap();
    assert_eq!(handed.logical_page_numbers(), vec![0, 1]);
    assert!(handed.page_size_directive().unwrap().is_none());
    assert_eq!(
        std::fs::metadata(&input_copy).unwrap().len(),
        std::fs::metadata(&source).unwrap().len()
    );

    // The temporary is gone once the export completes.
    assert!(!input_path.exists());
    assert_eq!(host.completions(), vec![true]);
}

/// Host that additionally signals completion over a channel, for flows that
/// never call `wait`.
struct ChannelHost {
    inner: RecordingHost,
    done_tx: tokio::sync::mpsc::UnboundedSender<bool>,
}

impl ExportHost for ChannelHost {
    fn on_output_chunk(&self, bytes: &[u8]) {
        self.inner.on_output_chunk(bytes);
    }

    fn on_completed(&self, success: bool) {
        self.inner.on_completed(success);
        let _ = self.done_tx.send(success);
    }
}

#[tokio::test]
async fn callback_only_export_releases_its_registry_slot() {
    let dir = TempDir::new().unwrap();
    let doc = write_document(dir.path(), "hands.dvi", &[PageSpec::plain(0)]);
    let output = dir.path().join("hands.pdf");
    let converter = fake_converter(dir.path(), "dvipdfm", r#"cp "$3" "$2""#);

    let (done_tx, mut done_rx) = tokio::sync::mpsc::unbounded_channel();
    let host = Arc::new(ChannelHost {
        inner: RecordingHost::default(),
        done_tx,
    });
    let coordinator = ExportCoordinator::new(host.clone());
    let request = ExportRequest::builder(ExportFormat::Pdf)
        .document(doc)
        .output(output.clone())
        .converter(converter)
        .build();

    coordinator.export(request).unwrap().expect("id assigned");

    // Observe completion through the host callback alone; wait() is never
    // called. The registry must still release the request's slot.
    assert!(done_rx.recv().await.unwrap());
    assert!(output.exists());

    let mut released = coordinator.active_count() == 0;
    for _ in 0..100 {
        if released {
            break;
        }
        tokio::time::sleep(std::time::Duration::from_millis(10)).await;
        released = coordinator.active_count() == 0;
    }
    assert!(released, "registry entry not released without wait()");
}

#[tokio::test]
async fn printing_hands_the_output_to_the_host() {
    let dir = TempDir::new().unwrap();
    let doc = write_document(dir.path(), "notes.dvi", &[PageSpec::plain(0)]);
    let output = dir.path().join("notes.ps");

    let converter = fake_converter(dir.path(), "dvips", r#"cp "$1" "$3""#);

    let host = Arc::new(RecordingHost::default());
    let coordinator = ExportCoordinator::new(host.clone());
    let request = ExportRequest::builder(ExportFormat::PostScript)
        .document(doc)
        .output(output.clone())
        .printer_target("lp0")
        .converter(converter)
        .build();

    let id = coordinator.export(request).unwrap().expect("id assigned");
    coordinator.wait(id).await.unwrap();

    assert_eq!(host.printed.lock().unwrap().as_slice(), &[output]);
    assert_eq!(host.completions(), vec![true]);
}

// ── Validation failures ──────────────────────────────────────────────────────

#[tokio::test]
async fn ps_export_rejects_non_postscript_graphics_before_any_work() {
    let dir = TempDir::new().unwrap();
    let doc = write_document(
        dir.path(),
        "figures.dvi",
        &[
            PageSpec::with_special(0, b"PSfile=\"diagram.png\" llx=0"),
            PageSpec::with_special(1, b"PSfile=\"plot.eps\" llx=0"),
        ],
    );

    let host = Arc::new(RecordingHost::default());
    let coordinator = ExportCoordinator::new(host.clone());
    let request = ExportRequest::builder(ExportFormat::PostScript)
        .document(doc)
        .output(dir.path().join("figures.ps"))
        .build();

    match coordinator.export(request) {
        Err(ExportError::ExternalNonPsGraphics { count }) => assert_eq!(count, 1),
        other => panic!("expected graphics rejection, got {other:?}"),
    }

    // Rejected before temp creation: the source directory is untouched.
    assert_eq!(dir_entries(dir.path()), vec!["figures.dvi"]);
    assert!(host.completions().is_empty());
}

#[tokio::test]
async fn pdf_export_rejects_converter_options() {
    let dir = TempDir::new().unwrap();
    let doc = write_document(dir.path(), "slides.dvi", &[PageSpec::plain(0)]);

    let coordinator = ExportCoordinator::new(Arc::new(RecordingHost::default()));
    let request = ExportRequest::builder(ExportFormat::Pdf)
        .document(doc)
        .output(dir.path().join("slides.pdf"))
        .options(["-pp", "1"])
        .build();

    // dvipdfm takes no pass-through options; dropping them silently would
    // mislead the caller, so the request fails validation instead.
    match coordinator.export(request) {
        Err(ExportError::UnsupportedOptions { options }) => {
            assert_eq!(options, vec!["-pp", "1"])
        }
        other => panic!("expected options rejection, got {other:?}"),
    }
    assert_eq!(dir_entries(dir.path()), vec!["slides.dvi"]);
}

#[tokio::test]
async fn missing_source_file_is_reported() {
    let dir = TempDir::new().unwrap();
    let doc = write_document(dir.path(), "gone.dvi", &[PageSpec::plain(0)]);
    std::fs::remove_file(dir.path().join("gone.dvi")).unwrap();

    let coordinator = ExportCoordinator::new(Arc::new(RecordingHost::default()));
    let request = ExportRequest::builder(ExportFormat::Pdf)
        .document(doc)
        .output(dir.path().join("gone.pdf"))
        .build();

    match coordinator.export(request) {
        Err(ExportError::SourceNotFound { path }) => {
            assert_eq!(path.file_name().unwrap(), "gone.dvi")
        }
        other => panic!("expected missing-source error, got {other:?}"),
    }
}

#[tokio::test]
async fn unresolvable_converter_is_reported() {
    let dir = TempDir::new().unwrap();
    let doc = write_document(dir.path(), "a.dvi", &[PageSpec::plain(0)]);

    let coordinator = ExportCoordinator::new(Arc::new(RecordingHost::default()));
    let request = ExportRequest::builder(ExportFormat::Pdf)
        .document(doc)
        .output(dir.path().join("a.pdf"))
        .converter(dir.path().join("no-such-converter"))
        .build();

    match coordinator.export(request) {
        Err(ExportError::ToolNotFound { name }) => {
            assert!(name.contains("no-such-converter"))
        }
        other => panic!("expected tool-not-found, got {other:?}"),
    }
}

// ── Converter failure ────────────────────────────────────────────────────────

#[tokio::test]
async fn converter_failure_reports_and_cleans_up() {
    let dir = TempDir::new().unwrap();
    let doc = write_document(dir.path(), "bad.dvi", &[PageSpec::plain(9)]);

    let converter = fake_converter(
        dir.path(),
        "dvipdfm",
        r#"echo "cannot open font file" >&2
exit 4"#,
    );
    let converter_name = "dvipdfm".to_string();

    let host = Arc::new(RecordingHost::default());
    let coordinator = ExportCoordinator::new(host.clone());
    let request = ExportRequest::builder(ExportFormat::Pdf)
        .document(doc)
        .output(dir.path().join("bad.pdf"))
        .force_renumber(true)
        .converter(converter)
        .build();

    let id = coordinator.export(request).unwrap().expect("id assigned");
    match coordinator.wait(id).await {
        Err(ExportError::ConversionFailed {
            exit_code, output, ..
        }) => {
            assert_eq!(exit_code, 4);
            assert!(output.contains("cannot open font file"));
        }
        other => panic!("expected conversion failure, got {other:?}"),
    }

    assert_eq!(host.completions(), vec![false]);
    let failures = host.failures.lock().unwrap();
    assert_eq!(failures.len(), 1);
    assert!(failures[0].contains(&converter_name));

    // force_renumber created a temp next to the source; failure removed it.
    assert_eq!(dir_entries(dir.path()), vec!["bad.dvi", "dvipdfm"]);
}

// ── Cancellation ─────────────────────────────────────────────────────────────

#[tokio::test]
async fn cancel_kills_the_converter_and_stays_silent() {
    let dir = TempDir::new().unwrap();
    let doc = write_document(dir.path(), "slow.dvi", &[PageSpec::plain(0)]);

    let converter = fake_converter(dir.path(), "dvipdfm", "sleep 30");

    let host = Arc::new(RecordingHost::default());
    let coordinator = ExportCoordinator::new(host.clone());
    let request = ExportRequest::builder(ExportFormat::Pdf)
        .document(doc)
        .output(dir.path().join("slow.pdf"))
        .converter(converter)
        .build();

    let id = coordinator.export(request).unwrap().expect("id assigned");
    assert_eq!(coordinator.active_count(), 1);
    assert!(coordinator.cancel(id));
    // Second cancel is a no-op.
    assert!(!coordinator.cancel(id));

    match coordinator.wait(id).await {
        Err(ExportError::Cancelled) => {}
        other => panic!("expected cancellation, got {other:?}"),
    }

    // A cancelled export reports nothing further.
    assert!(host.completions().is_empty());
    assert!(host.failures.lock().unwrap().is_empty());
    assert_eq!(coordinator.active_count(), 0);
}

// ── Interactive output selection ─────────────────────────────────────────────

/// Host whose save dialog always picks `choice`; `None` means "cancelled".
struct DialogHost {
    inner: RecordingHost,
    choice: Option<PathBuf>,
    suggested: Mutex<Option<PathBuf>>,
    overwrite: bool,
}

impl ExportHost for DialogHost {
    fn on_output_chunk(&self, bytes: &[u8]) {
        self.inner.on_output_chunk(bytes);
    }

    fn on_completed(&self, success: bool) {
        self.inner.on_completed(success);
    }

    fn request_save_path(&self, suggested: &Path, _filter: &str) -> Option<PathBuf> {
        *self.suggested.lock().unwrap() = Some(suggested.to_path_buf());
        self.choice.clone()
    }

    fn confirm_overwrite(&self, _path: &Path) -> bool {
        self.overwrite
    }
}

#[tokio::test]
async fn declined_save_dialog_abandons_the_export_silently() {
    let dir = TempDir::new().unwrap();
    let doc = write_document(dir.path(), "draft.dvi", &[PageSpec::plain(0)]);
    let converter = fake_converter(dir.path(), "dvipdfm", r#"cp "$3" "$2""#);

    let host = Arc::new(DialogHost {
        inner: RecordingHost::default(),
        choice: None,
        suggested: Mutex::new(None),
        overwrite: true,
    });
    let coordinator = ExportCoordinator::new(host.clone());
    let request = ExportRequest::builder(ExportFormat::Pdf)
        .document(doc)
        .converter(converter)
        .build();

    assert!(coordinator.export(request).unwrap().is_none());

    // The dialog saw the suggested name: source with the target extension.
    let suggested = host.suggested.lock().unwrap().clone().unwrap();
    assert_eq!(suggested, dir.path().join("draft.pdf"));
    assert!(host.inner.completions().is_empty());
}

#[tokio::test]
async fn declined_overwrite_abandons_the_export_silently() {
    let dir = TempDir::new().unwrap();
    let doc = write_document(dir.path(), "draft.dvi", &[PageSpec::plain(0)]);
    let existing = dir.path().join("chosen.pdf");
    std::fs::write(&existing, b"precious").unwrap();
    let converter = fake_converter(dir.path(), "dvipdfm", r#"cp "$3" "$2""#);

    let host = Arc::new(DialogHost {
        inner: RecordingHost::default(),
        choice: Some(existing.clone()),
        suggested: Mutex::new(None),
        overwrite: false,
    });
    let coordinator = ExportCoordinator::new(host.clone());
    let request = ExportRequest::builder(ExportFormat::Pdf)
        .document(doc)
        .converter(converter)
        .build();

    assert!(coordinator.export(request).unwrap().is_none());
    assert_eq!(std::fs::read(&existing).unwrap(), b"precious");
}

#[tokio::test]
async fn accepted_save_dialog_runs_the_export() {
    let dir = TempDir::new().unwrap();
    let doc = write_document(dir.path(), "draft.dvi", &[PageSpec::plain(0)]);
    let chosen = dir.path().join("picked.pdf");

    // PATH lookup would find the real dvipdfm here, so pin the converter
    // through an env-free override is not possible for the dialog flow;
    // instead put the fake first on PATH for this request only.
    let converter = fake_converter(dir.path(), "dvipdfm", r#"cp "$3" "$2""#);

    let host = Arc::new(DialogHost {
        inner: RecordingHost::default(),
        choice: Some(chosen.clone()),
        suggested: Mutex::new(None),
        overwrite: true,
    });
    let coordinator = ExportCoordinator::new(host.clone());
    let request = ExportRequest::builder(ExportFormat::Pdf)
        .document(doc)
        .converter(converter)
        .build();

    let id = coordinator.export(request).unwrap().expect("id assigned");
    coordinator.wait(id).await.unwrap();

    assert!(chosen.exists());
    assert_eq!(host.inner.completions(), vec![true]);
}
