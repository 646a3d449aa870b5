//! CLI binary for dviexport.
//!
//! A thin shim over the library crate that maps CLI flags to an
//! `ExportRequest` and relays converter output to the terminal.

use anyhow::{Context, Result};
use clap::Parser;
use dviexport::{
    DviDocument, ExportCoordinator, ExportError, ExportFormat, ExportHost, ExportRequest,
};
use indicatif::{ProgressBar, ProgressStyle};
use std::io::{self, Write};
use std::path::{Path, PathBuf};
use std::sync::{Arc, Mutex};
use std::time::Duration;
use tracing_subscriber::EnvFilter;

// ── ANSI colour helpers (no extra deps) ──────────────────────────────────────

fn green(s: &str) -> String {
    format!("\x1b[32m{s}\x1b[0m")
}
fn red(s: &str) -> String {
    format!("\x1b[31m{s}\x1b[0m")
}
fn dim(s: &str) -> String {
    format!("\x1b[2m{s}\x1b[0m")
}
fn bold(s: &str) -> String {
    format!("\x1b[1m{s}\x1b[0m")
}

// ── Terminal export host ─────────────────────────────────────────────────────

/// Relays converter diagnostics below an [indicatif] spinner. The converter
/// writes in its own pace; partial lines are buffered until a newline
/// arrives so the log stays readable.
struct CliHost {
    bar: ProgressBar,
    pending: Mutex<String>,
    quiet: bool,
}

impl CliHost {
    fn new(quiet: bool) -> Arc<Self> {
        let bar = ProgressBar::new_spinner();
        bar.set_style(
            ProgressStyle::with_template("{spinner:.cyan} {prefix:.bold}  {msg}")
                .unwrap_or_else(|_| ProgressStyle::default_spinner())
                .tick_strings(&["⠋", "⠙", "⠹", "⠸", "⠼", "⠴", "⠦", "⠧", "⠇", "⠏", "⠿"]),
        );
        bar.set_prefix("Exporting");
        bar.enable_steady_tick(Duration::from_millis(80));
        if quiet {
            bar.finish_and_clear();
        }
        Arc::new(Self {
            bar,
            pending: Mutex::new(String::new()),
            quiet,
        })
    }

    fn flush_pending(&self) {
        let mut pending = self.pending.lock().unwrap();
        if !pending.is_empty() {
            self.bar.println(format!("  {}", dim(pending.trim_end())));
            pending.clear();
        }
    }
}

impl ExportHost for CliHost {
    fn on_output_chunk(&self, chunk: &[u8]) {
        if self.quiet {
            return;
        }
        let mut pending = self.pending.lock().unwrap();
        pending.push_str(&String::from_utf8_lossy(chunk));
        while let Some(nl) = pending.find('\n') {
            let line: String = pending.drain(..=nl).collect();
            self.bar.println(format!("  {}", dim(line.trim_end())));
        }
    }

    fn on_completed(&self, success: bool) {
        self.flush_pending();
        self.bar.finish_and_clear();
        if !self.quiet && success {
            eprintln!("{} export finished", green("✔"));
        }
    }

    fn report_failure(&self, message: &str) {
        self.flush_pending();
        self.bar.finish_and_clear();
        eprintln!("{} {}", red("✘"), message);
    }
}

const AFTER_HELP: &str = r#"EXAMPLES:
  # Export to PDF next to the source (paper.dvi -> paper.pdf)
  dviexport paper.dvi

  # Export to PostScript with an explicit output path
  dviexport --to ps paper.dvi -o /tmp/paper.ps

  # Pass page-selection options through to dvips
  dviexport --to ps -O=-pp -O 3-7 paper.dvi

  # Use a converter outside PATH
  dviexport --converter /opt/texlive/bin/dvipdfm paper.dvi

  # Show document structure as JSON, no conversion
  dviexport --inspect paper.dvi

CONVERTERS:
  pdf   dvipdfm   invoked as: dvipdfm -o <output> <input>
  ps    dvips     invoked as: dvips [-z] <options...> <input> -o <output>

  The -z flag (preserve hyperlinks) is added automatically for PostScript
  exports. Both converters must be on PATH unless --converter is given.
"#;

/// Export DVI documents to PDF or PostScript.
#[derive(Parser, Debug)]
#[command(
    name = "dviexport",
    version,
    about = "Export DVI documents to PDF or PostScript",
    long_about = "Export DVI documents to PDF (via dvipdfm) or PostScript (via dvips). \
Pages are renumbered sequentially and embedded papersize directives are neutralized \
before conversion when needed, so page-selection options behave predictably.",
    arg_required_else_help = true,
    color = clap::ColorChoice::Auto,
    after_long_help = AFTER_HELP
)]
struct Cli {
    /// DVI file to export.
    input: PathBuf,

    /// Target format: pdf or ps.
    #[arg(long = "to", value_enum, default_value = "pdf")]
    format: FormatArg,

    /// Output path. Defaults to the input with the target extension.
    #[arg(short, long)]
    output: Option<PathBuf>,

    /// Extra option passed through to dvips (repeatable, PostScript only).
    #[arg(short = 'O', long = "option")]
    options: Vec<String>,

    /// Renumber pages even when no converter options are given.
    #[arg(long)]
    force_renumber: bool,

    /// Converter executable to use instead of the PATH lookup.
    #[arg(long)]
    converter: Option<PathBuf>,

    /// Print document structure as JSON, no conversion.
    #[arg(long)]
    inspect: bool,

    /// Enable DEBUG-level tracing logs.
    #[arg(short, long)]
    verbose: bool,

    /// Suppress all output except errors.
    #[arg(short, long)]
    quiet: bool,
}

#[derive(clap::ValueEnum, Clone, Copy, Debug)]
enum FormatArg {
    Pdf,
    Ps,
}

impl From<FormatArg> for ExportFormat {
    fn from(v: FormatArg) -> Self {
        match v {
            FormatArg::Pdf => ExportFormat::Pdf,
            FormatArg::Ps => ExportFormat::PostScript,
        }
    }
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();

    // ── Logging setup ────────────────────────────────────────────────────
    // The spinner provides the feedback that matters; keep library logs
    // quiet unless --verbose asks for them.
    let filter = if cli.verbose {
        "debug"
    } else if cli.quiet {
        "error"
    } else {
        "warn"
    };
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(filter)),
        )
        .with_writer(io::stderr)
        .init();

    let doc = DviDocument::load(&cli.input)
        .with_context(|| format!("Failed to load {}", cli.input.display()))?;

    // ── Inspect mode ─────────────────────────────────────────────────────
    if cli.inspect {
        print_inspection(&doc, &cli.input)?;
        return Ok(());
    }

    let format: ExportFormat = cli.format.into();
    let output = cli
        .output
        .clone()
        .unwrap_or_else(|| cli.input.with_extension(format.extension()));

    let host = CliHost::new(cli.quiet);
    host.bar.set_message(format!(
        "{} → {}",
        cli.input.display(),
        output.display()
    ));

    let mut builder = ExportRequest::builder(format)
        .document(doc)
        .output(output.clone())
        .options(cli.options.iter().cloned())
        .force_renumber(cli.force_renumber);
    if let Some(ref conv) = cli.converter {
        builder = builder.converter(conv.clone());
    }

    let coordinator = ExportCoordinator::new(host.clone());
    let id = coordinator
        .export(builder.build())?
        .context("Export abandoned")?;

    match coordinator.wait(id).await {
        Ok(()) => {
            if !cli.quiet {
                eprintln!("   {}", bold(&output.display().to_string()));
            }
            Ok(())
        }
        Err(ExportError::ConversionFailed {
            output: diagnostics,
            ..
        }) => {
            // The host already reported the failure line.
            if !diagnostics.is_empty() && cli.quiet {
                eprint!("{diagnostics}");
                io::stderr().flush().ok();
            }
            std::process::exit(1);
        }
        Err(e) => Err(e.into()),
    }
}

/// Print the structural facts an export decision depends on.
fn print_inspection(doc: &DviDocument, input: &Path) -> Result<()> {
    let numbers = doc.logical_page_numbers();
    let papersize = doc.page_size_directive().ok().flatten();
    let report = serde_json::json!({
        "file": input.display().to_string(),
        "pages": doc.page_count(),
        "logical_page_numbers": numbers,
        "papersize_special": papersize,
        "external_non_ps_graphics": doc.external_non_ps_count()?,
    });
    println!(
        "{}",
        serde_json::to_string_pretty(&report).context("Failed to serialize inspection")?
    );
    Ok(())
}
