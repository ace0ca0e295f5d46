//! # fileproc
//!
//! A streaming gRPC service that transforms files by delegating to external
//! command-line programs: Ghostscript for PDF compression, pdftotext for text
//! extraction and ImageMagick for image conversion and resizing.
//!
//! ## Request Flow
//!
//! ```text
//! client stream ──► assembler ──► staged input
//!                                    │
//!                                    ├─ executor   registry renders argv, collaborator runs
//!                                    ▼
//!                               staged output ──► streamer ──► response stream
//! ```
//!
//! Every request owns its staged artifacts and removes them before its final
//! status goes out, whatever the outcome. Requests run concurrently, one task
//! each.
//!
//! ## Quick Start
//!
//! ```rust,no_run
//! use fileproc::{FileProcessorClient, ClientConfig};
//! use std::path::Path;
//!
//! #[tokio::main]
//! async fn main() -> Result<(), Box<dyn std::error::Error>> {
//!     let mut client =
//!         FileProcessorClient::connect("http://localhost:50051", ClientConfig::default()).await?;
//!     let summary = client
//!         .resize_image(Path::new("photo.jpg"), Path::new("thumb.jpg"), 100, 100)
//!         .await?;
//!     eprintln!("{} bytes back in {} ms", summary.bytes_received, summary.elapsed_ms);
//!     Ok(())
//! }
//! ```
//!
//! ## Feature Flags
//!
//! | Feature | Default | Description |
//! |---------|---------|-------------|
//! | `cli`   | on      | Enables the `fileproc-server` and `fileproc` binaries (clap + anyhow + tracing-subscriber + indicatif) |
//!
//! Disable `cli` when embedding the library:
//! ```toml
//! fileproc = { version = "0.1", default-features = false }
//! ```

// ── Modules ──────────────────────────────────────────────────────────────

pub mod assembler;
pub mod client;
pub mod config;
pub mod error;
pub mod executor;
pub mod lifecycle;
pub mod logging;
pub mod progress;
pub mod proto;
pub mod registry;
pub mod service;
pub mod staging;
pub mod streamer;
pub mod transport;

// ── Re-exports ───────────────────────────────────────────────────────────

pub use client::{FileProcessorClient, TransferSummary};
pub use config::{
    ClientConfig, ClientConfigBuilder, ExecutorPrograms, ServerConfig, ServerConfigBuilder,
};
pub use error::FileProcError;
pub use logging::{OperationLog, Severity};
pub use progress::{NoopProgressCallback, ProgressCallback, TransferProgressCallback};
pub use registry::{Geometry, Job, Operation, OperationRegistry, TargetFormat};
pub use service::{serve, serve_listener, FileProcessor};
pub use staging::StagingStore;
