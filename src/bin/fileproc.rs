//! Command-line client for a fileproc server.
//!
//! One subcommand per RPC. Prints a one-line summary, or the
//! `TransferSummary` as JSON with `--json`.

use anyhow::{Context, Result};
use clap::{Parser, Subcommand};
use fileproc::{ClientConfig, FileProcessorClient, TransferProgressCallback, TransferSummary};
use indicatif::{ProgressBar, ProgressStyle};
use std::io;
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tracing_subscriber::EnvFilter;

fn green(s: &str) -> String {
    format!("\x1b[32m{s}\x1b[0m")
}
fn red(s: &str) -> String {
    format!("\x1b[31m{s}\x1b[0m")
}
fn dim(s: &str) -> String {
    format!("\x1b[2m{s}\x1b[0m")
}

// ── Progress bar ─────────────────────────────────────────────────────────────

/// Byte-count bar for the upload, then a spinner while the result streams back.
struct CliProgress {
    bar: ProgressBar,
    downloading: AtomicBool,
}

impl CliProgress {
    fn new() -> Arc<Self> {
        let bar = ProgressBar::new(0);
        bar.set_style(
            ProgressStyle::with_template(
                "{spinner:.cyan} {prefix:.bold}  [{bar:36.green/238}] {bytes}/{total_bytes}  {elapsed_precise}",
            )
            .unwrap_or_else(|_| ProgressStyle::default_bar())
            .progress_chars("█▉▊▋▌▍▎▏  "),
        );
        bar.enable_steady_tick(Duration::from_millis(80));
        Arc::new(Self {
            bar,
            downloading: AtomicBool::new(false),
        })
    }
}

impl TransferProgressCallback for CliProgress {
    fn on_start(&self, operation: &str, input_bytes: u64) {
        self.bar.set_length(input_bytes);
        self.bar.set_prefix(format!("{operation} ↑"));
    }

    fn on_upload(&self, bytes_sent: u64) {
        self.bar.set_position(bytes_sent);
    }

    fn on_download(&self, bytes_received: u64) {
        if !self.downloading.swap(true, Ordering::SeqCst) {
            self.bar.set_style(
                ProgressStyle::with_template(
                    "{spinner:.cyan} {prefix:.bold}  {bytes} received  {elapsed_precise}",
                )
                .unwrap_or_else(|_| ProgressStyle::default_spinner()),
            );
            self.bar.set_length(0);
            self.bar.set_prefix("Receiving ↓");
        }
        self.bar.set_position(bytes_received);
    }

    fn on_finish(&self, _ok: bool) {
        self.bar.finish_and_clear();
    }
}

// ── CLI ──────────────────────────────────────────────────────────────────────

/// Send files to a fileproc server for transformation.
#[derive(Parser, Debug)]
#[command(
    name = "fileproc",
    version,
    about = "Client for the streaming gRPC file processing server",
    arg_required_else_help = true,
    color = clap::ColorChoice::Auto
)]
struct Cli {
    /// Server endpoint.
    #[arg(long, global = true, env = "FILEPROC_SERVER", default_value = "http://localhost:50051")]
    server: String,

    /// Bytes per uploaded chunk.
    #[arg(
        long,
        global = true,
        env = "FILEPROC_CHUNK_SIZE",
        default_value_t = fileproc::config::DEFAULT_UPLOAD_CHUNK_SIZE
    )]
    chunk_size: usize,

    /// Disable the progress bar.
    #[arg(long, global = true)]
    no_progress: bool,

    /// Print the transfer summary as JSON.
    #[arg(long, global = true)]
    json: bool,

    /// Enable DEBUG-level tracing logs.
    #[arg(short, long, global = true)]
    verbose: bool,

    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand, Debug)]
enum Command {
    /// Compress a PDF with Ghostscript.
    Compress { input: PathBuf, output: PathBuf },

    /// Extract the text of a PDF.
    ToTxt { input: PathBuf, output: PathBuf },

    /// Convert an image to another format.
    Convert {
        input: PathBuf,
        output: PathBuf,
        /// Target format; inferred from the output extension if omitted.
        #[arg(long)]
        format: Option<String>,
    },

    /// Resize an image to exact dimensions.
    Resize {
        input: PathBuf,
        output: PathBuf,
        #[arg(long)]
        width: i32,
        #[arg(long)]
        height: i32,
    },
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();

    let show_progress = !cli.no_progress && !cli.json;
    let filter = if cli.verbose {
        "debug"
    } else if show_progress {
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

    let config = ClientConfig::builder()
        .chunk_size(cli.chunk_size)
        .build()
        .context("Invalid client configuration")?;
    let mut client = FileProcessorClient::connect(cli.server.clone(), config)
        .await
        .with_context(|| format!("Cannot connect to {}", cli.server))?;
    if show_progress {
        client = client.with_progress(CliProgress::new());
    }

    let result = match &cli.command {
        Command::Compress { input, output } => client.compress_pdf(input, output).await,
        Command::ToTxt { input, output } => client.convert_to_txt(input, output).await,
        Command::Convert { input, output, format } => {
            let format = match format {
                Some(f) => f.clone(),
                None => infer_format(output)?,
            };
            client.convert_image_format(input, output, &format).await
        }
        Command::Resize {
            input,
            output,
            width,
            height,
        } => client.resize_image(input, output, *width, *height).await,
    };

    match result {
        Ok(summary) => {
            report(&summary, cli.json)?;
            Ok(())
        }
        Err(e) => {
            eprintln!("{} {}", red("✗"), e);
            std::process::exit(1);
        }
    }
}

fn infer_format(output: &Path) -> Result<String> {
    output
        .extension()
        .and_then(|e| e.to_str())
        .map(str::to_ascii_lowercase)
        .with_context(|| {
            format!(
                "Cannot infer the target format from {}; pass --format",
                output.display()
            )
        })
}

fn report(summary: &TransferSummary, json: bool) -> Result<()> {
    if json {
        println!("{}", serde_json::to_string_pretty(summary)?);
        return Ok(());
    }
    eprintln!(
        "{} {} → {}  {}",
        green("✓"),
        summary.operation,
        summary.output.display(),
        dim(&format!(
            "{} bytes up, {} bytes down, {:.1}s",
            summary.bytes_sent,
            summary.bytes_received,
            summary.elapsed_ms as f64 / 1000.0
        ))
    );
    Ok(())
}
