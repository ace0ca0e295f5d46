//! gRPC server binary for fileproc.
//!
//! Maps CLI flags onto `ServerConfig`, opens the operation log and serves
//! until Ctrl-C.

use anyhow::{Context, Result};
use clap::Parser;
use fileproc::{serve, OperationLog, ServerConfig};
use std::io;
use std::net::SocketAddr;
use std::path::PathBuf;
use std::sync::Arc;
use tracing::{info, warn};
use tracing_subscriber::EnvFilter;

const AFTER_HELP: &str = r#"EXAMPLES:
  # Serve on the default port, staging under the system temp dir
  fileproc-server

  # Dedicated staging directory and a custom ImageMagick binary
  fileproc-server --staging-dir /var/lib/fileproc --convert-bin /usr/local/bin/convert

COLLABORATORS:
  Operation            Program     Default binary
  ───────────────────  ──────────  ──────────────
  CompressPDF          Ghostscript gs
  ConvertToTXT         Poppler     pdftotext
  ConvertImageFormat   ImageMagick convert
  ResizeImage          ImageMagick convert

ENVIRONMENT VARIABLES:
  FILEPROC_LISTEN       Listen address (default 0.0.0.0:50051)
  FILEPROC_STAGING_DIR  Staging directory (default: system temp dir)
  FILEPROC_LOG_FILE     Operation log file (default server.log)
  RUST_LOG              Overrides the tracing filter
"#;

/// Serve the FileProcessorService over gRPC.
#[derive(Parser, Debug)]
#[command(
    name = "fileproc-server",
    version,
    about = "Streaming gRPC file processing server",
    color = clap::ColorChoice::Auto,
    after_long_help = AFTER_HELP
)]
struct Cli {
    /// Socket address to listen on.
    #[arg(long, env = "FILEPROC_LISTEN", default_value = "0.0.0.0:50051")]
    listen: SocketAddr,

    /// Directory for staged artifacts.
    #[arg(long, env = "FILEPROC_STAGING_DIR")]
    staging_dir: Option<PathBuf>,

    /// Bytes per outbound chunk.
    #[arg(
        long,
        env = "FILEPROC_READ_CHUNK_SIZE",
        default_value_t = fileproc::config::DEFAULT_READ_CHUNK_SIZE
    )]
    read_chunk_size: usize,

    /// Append-only operation log.
    #[arg(long, env = "FILEPROC_LOG_FILE", default_value = "server.log")]
    log_file: PathBuf,

    /// Do not write the operation log file.
    #[arg(long)]
    no_log_file: bool,

    /// Ghostscript binary.
    #[arg(long, env = "FILEPROC_GS_BIN", default_value = "gs")]
    gs_bin: String,

    /// pdftotext binary.
    #[arg(long, env = "FILEPROC_PDFTOTEXT_BIN", default_value = "pdftotext")]
    pdftotext_bin: String,

    /// ImageMagick `convert` binary.
    #[arg(long, env = "FILEPROC_CONVERT_BIN", default_value = "convert")]
    convert_bin: String,

    /// Enable DEBUG-level tracing logs.
    #[arg(short, long, env = "FILEPROC_VERBOSE")]
    verbose: bool,
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();

    let filter = if cli.verbose { "debug" } else { "info" };
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(filter)),
        )
        .with_writer(io::stderr)
        .init();

    let mut builder = ServerConfig::builder()
        .listen_addr(cli.listen)
        .read_chunk_size(cli.read_chunk_size)
        .ghostscript(cli.gs_bin)
        .pdftotext(cli.pdftotext_bin)
        .imagemagick(cli.convert_bin);
    if let Some(dir) = cli.staging_dir {
        builder = builder.staging_dir(dir);
    }
    if !cli.no_log_file {
        builder = builder.log_file(cli.log_file);
    }
    let config = builder.build().context("Invalid server configuration")?;

    if let Ok(json) = serde_json::to_string(&config) {
        info!("Starting with {}", json);
    }

    let log = match &config.log_file {
        Some(path) => OperationLog::to_file(path)
            .with_context(|| format!("Cannot open operation log {}", path.display()))?,
        None => OperationLog::disabled(),
    };

    serve(&config, Arc::new(log), shutdown_signal())
        .await
        .context("Server failed")?;
    Ok(())
}

async fn shutdown_signal() {
    match tokio::signal::ctrl_c().await {
        Ok(()) => info!("Ctrl-C received, shutting down"),
        Err(e) => {
            warn!("Cannot listen for Ctrl-C: {}", e);
            std::future::pending::<()>().await
        }
    }
}
