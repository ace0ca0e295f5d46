//! Progress-callback trait for client transfers.
//!
//! Attach an [`Arc<dyn TransferProgressCallback>`] with
//! [`crate::client::FileProcessorClient::with_progress`] to observe uploads and
//! downloads as they happen. The CLI uses it to drive an `indicatif` bar.
//!
//! # Example
//!
//! ```rust
//! use fileproc::TransferProgressCallback;
//! use std::sync::atomic::{AtomicU64, Ordering};
//!
//! struct Counter(AtomicU64);
//!
//! impl TransferProgressCallback for Counter {
//!     fn on_download(&self, bytes_received: u64) {
//!         self.0.store(bytes_received, Ordering::Relaxed);
//!     }
//! }
//! ```

use std::sync::Arc;

/// Called by [`crate::client::FileProcessorClient`] during a call.
///
/// Upload events come from the uploader task and download events from the
/// caller's task, so the two may interleave. All methods default to no-ops.
pub trait TransferProgressCallback: Send + Sync {
    /// Called once before the first chunk is sent.
    ///
    /// # Arguments
    /// * `operation`: RPC name, e.g. `CompressPDF`
    /// * `input_bytes`: size of the local input file
    fn on_start(&self, operation: &str, input_bytes: u64) {
        let _ = (operation, input_bytes);
    }

    /// Called after each uploaded chunk with the running total.
    fn on_upload(&self, bytes_sent: u64) {
        let _ = bytes_sent;
    }

    /// Called after each received chunk with the running total.
    fn on_download(&self, bytes_received: u64) {
        let _ = bytes_received;
    }

    /// Called once when the call ends, successfully or not.
    fn on_finish(&self, ok: bool) {
        let _ = ok;
    }
}

/// A no-op implementation; the default when no callback is attached.
pub struct NoopProgressCallback;

impl TransferProgressCallback for NoopProgressCallback {}

/// Shared callback handle.
pub type ProgressCallback = Arc<dyn TransferProgressCallback>;
