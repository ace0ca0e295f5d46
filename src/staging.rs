//! Staging store: the ephemeral-file lifecycle behind every request.
//!
//! Collaborators are external programs that only understand file paths, so
//! uploaded bytes are appended to a file on disk and the collaborator's output
//! is read back from another one. Each such file is a [`StagedArtifact`].
//!
//! ## Ownership
//!
//! An artifact belongs to exactly one in-flight request. The guard wraps a
//! [`tempfile::TempPath`], so the file is removed when the guard goes out of
//! scope on any exit path: success, error return, panic, or the request task
//! being dropped mid-await. The normal paths call [`StagedArtifact::delete`]
//! to observe the removal result; `Drop` is the backstop.
//!
//! ## Naming
//!
//! `<dir>/<prefix>_<unix-nanos>_<100000..=999999>`. The time component plus a
//! bounded random suffix is collision-resistant, not collision-proof. Files
//! are opened with `create_new`, so a collision is detected and a fresh name
//! is drawn rather than two requests silently sharing a file.
//!
//! ## Request scope
//!
//! A request stages into its own [`ScratchDir`] under the store. Collaborators
//! may write by-products next to their output (numbered frames, logs); closing
//! the scratch directory removes those along with the known artifacts.

use crate::error::FileProcError;
use rand::Rng;
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::{SystemTime, UNIX_EPOCH};
use tempfile::{TempDir, TempPath};
use tokio::fs::{File, OpenOptions};
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tracing::{debug, warn};

/// Attempts at drawing a fresh name before giving up on `create_unique`.
const MAX_CREATE_ATTEMPTS: usize = 8;

/// Owner of the staging directory and the unique-name generator.
///
/// Cheap to clone; clones share the live-artifact counter.
#[derive(Debug, Clone)]
pub struct StagingStore {
    dir: PathBuf,
    live: Arc<AtomicUsize>,
}

impl StagingStore {
    /// Open a store rooted at `dir`, creating the directory if needed.
    pub async fn open(dir: impl Into<PathBuf>) -> Result<Self, FileProcError> {
        let dir = dir.into();
        tokio::fs::create_dir_all(&dir)
            .await
            .map_err(|e| FileProcError::staging(&dir, e))?;
        debug!("Staging store ready at {}", dir.display());
        Ok(Self {
            dir,
            live: Arc::new(AtomicUsize::new(0)),
        })
    }

    /// Directory holding this store's artifacts.
    pub fn dir(&self) -> &Path {
        &self.dir
    }

    /// Number of artifacts currently owned by in-flight requests.
    pub fn live_artifacts(&self) -> usize {
        self.live.load(Ordering::SeqCst)
    }

    /// Generate a candidate artifact path for `prefix`.
    pub fn unique_path(&self, prefix: &str) -> PathBuf {
        let nanos = SystemTime::now()
            .duration_since(UNIX_EPOCH)
            .map(|d| d.as_nanos())
            .unwrap_or_default();
        let suffix: u32 = rand::thread_rng().gen_range(100_000..=999_999);
        self.dir.join(format!("{prefix}_{nanos}_{suffix}"))
    }

    /// Create a fresh, empty artifact and open it for sequential writing.
    pub async fn create_unique(
        &self,
        prefix: &str,
    ) -> Result<(StagedArtifact, ArtifactWriter), FileProcError> {
        let mut last_path = self.dir.clone();
        for _ in 0..MAX_CREATE_ATTEMPTS {
            let path = self.unique_path(prefix);
            match OpenOptions::new()
                .write(true)
                .create_new(true)
                .open(&path)
                .await
            {
                Ok(file) => {
                    let artifact = match self.reserve(path.clone()) {
                        Ok(artifact) => artifact,
                        Err(e) => {
                            drop(file);
                            let _ = tokio::fs::remove_file(&path).await;
                            return Err(e);
                        }
                    };
                    let path = artifact.path().to_path_buf();
                    debug!("Staged {}", path.display());
                    let writer = ArtifactWriter {
                        file,
                        path,
                        bytes_written: 0,
                    };
                    return Ok((artifact, writer));
                }
                Err(e) if e.kind() == std::io::ErrorKind::AlreadyExists => {
                    warn!("Staging name collision on {}, retrying", path.display());
                    last_path = path;
                }
                Err(e) => return Err(FileProcError::staging(path, e)),
            }
        }
        Err(FileProcError::staging(
            last_path,
            std::io::Error::new(
                std::io::ErrorKind::AlreadyExists,
                format!("no free name after {MAX_CREATE_ATTEMPTS} attempts"),
            ),
        ))
    }

    /// Take ownership of `path`, which may not exist yet.
    ///
    /// Used for the collaborator's output: the guard is held while the
    /// collaborator runs so a partially written output is removed too. A
    /// relative `path` is resolved against the current directory here, not at
    /// removal time.
    pub fn reserve(&self, path: PathBuf) -> Result<StagedArtifact, FileProcError> {
        let temp = TempPath::try_from_path(&path).map_err(|e| FileProcError::staging(&path, e))?;
        self.live.fetch_add(1, Ordering::SeqCst);
        Ok(StagedArtifact {
            path: temp.to_path_buf(),
            temp: Some(temp),
            live: Arc::clone(&self.live),
        })
    }

    /// Create a private directory for one request under this store.
    ///
    /// The returned [`ScratchDir::store`] stages inside it and shares this
    /// store's live-artifact counter.
    pub async fn scratch_dir(&self, prefix: &str) -> Result<ScratchDir, FileProcError> {
        let root = self.dir.clone();
        let prefix = format!("{prefix}_");
        let created = tokio::task::spawn_blocking(move || {
            tempfile::Builder::new().prefix(&prefix).tempdir_in(&root)
        })
        .await
        .map_err(|e| {
            FileProcError::staging(&self.dir, std::io::Error::new(std::io::ErrorKind::Other, e))
        })?;
        let dir = created.map_err(|e| FileProcError::staging(&self.dir, e))?;
        debug!("Opened scratch directory {}", dir.path().display());
        Ok(ScratchDir {
            store: StagingStore {
                dir: dir.path().to_path_buf(),
                live: Arc::clone(&self.live),
            },
            dir,
        })
    }
}

/// One request's private directory. Removed with everything in it on
/// [`ScratchDir::close`] or on drop.
#[derive(Debug)]
pub struct ScratchDir {
    store: StagingStore,
    dir: TempDir,
}

impl ScratchDir {
    /// Store rooted inside this directory.
    pub fn store(&self) -> &StagingStore {
        &self.store
    }

    pub fn path(&self) -> &Path {
        self.dir.path()
    }

    /// Remove the directory, including files nobody reserved.
    pub async fn close(self) -> Result<(), FileProcError> {
        let ScratchDir { store, dir } = self;
        let path = store.dir;
        let result = tokio::task::spawn_blocking(move || dir.close())
            .await
            .map_err(|e| {
                FileProcError::staging(&path, std::io::Error::new(std::io::ErrorKind::Other, e))
            })?;
        match result {
            Ok(()) => {
                debug!("Removed scratch directory {}", path.display());
                Ok(())
            }
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(()),
            Err(e) => Err(FileProcError::staging(path, e)),
        }
    }
}

/// A staged file owned by exactly one request. Removed on drop.
#[derive(Debug)]
pub struct StagedArtifact {
    path: PathBuf,
    temp: Option<TempPath>,
    live: Arc<AtomicUsize>,
}

impl StagedArtifact {
    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Whether the file currently exists on disk.
    pub async fn exists(&self) -> bool {
        tokio::fs::try_exists(&self.path).await.unwrap_or(false)
    }

    /// Open the artifact for sequential reads of up to `chunk_size` bytes.
    pub async fn open_for_read(&self, chunk_size: usize) -> Result<ArtifactReader, FileProcError> {
        let file = File::open(&self.path)
            .await
            .map_err(|e| FileProcError::staging(&self.path, e))?;
        Ok(ArtifactReader {
            file,
            path: self.path.clone(),
            chunk_size: chunk_size.max(1),
        })
    }

    /// Delete the artifact now. A file that was never written is not an error.
    pub async fn delete(mut self) -> Result<(), FileProcError> {
        let Some(temp) = self.temp.take() else {
            return Ok(());
        };
        let path = self.path.clone();
        let result = tokio::task::spawn_blocking(move || temp.close())
            .await
            .map_err(|e| {
                FileProcError::staging(&path, std::io::Error::new(std::io::ErrorKind::Other, e))
            })?;
        match result {
            Ok(()) => {
                debug!("Removed {}", path.display());
                Ok(())
            }
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(()),
            Err(e) => Err(FileProcError::staging(path, e)),
        }
    }
}

impl Drop for StagedArtifact {
    fn drop(&mut self) {
        // TempPath removes the file (if any) when dropped.
        if self.temp.take().is_some() {
            debug!("Dropped staged artifact {}", self.path.display());
        }
        self.live.fetch_sub(1, Ordering::SeqCst);
    }
}

/// Sequential writer over a freshly created artifact.
#[derive(Debug)]
pub struct ArtifactWriter {
    file: File,
    path: PathBuf,
    bytes_written: u64,
}

impl ArtifactWriter {
    /// Append `data` at the end of the artifact.
    pub async fn append_bytes(&mut self, data: &[u8]) -> Result<(), FileProcError> {
        self.file
            .write_all(data)
            .await
            .map_err(|e| FileProcError::staging(&self.path, e))?;
        self.bytes_written += data.len() as u64;
        Ok(())
    }

    pub fn bytes_written(&self) -> u64 {
        self.bytes_written
    }

    /// Flush and close the file. Returns the total bytes written.
    pub async fn close_for_write(mut self) -> Result<u64, FileProcError> {
        self.file
            .flush()
            .await
            .map_err(|e| FileProcError::staging(&self.path, e))?;
        Ok(self.bytes_written)
    }
}

/// Sequential reader over an artifact.
#[derive(Debug)]
pub struct ArtifactReader {
    file: File,
    path: PathBuf,
    chunk_size: usize,
}

impl ArtifactReader {
    /// Read the next chunk, or `None` at end of file.
    ///
    /// Chunks are full-sized except possibly the last one.
    pub async fn read_chunk(&mut self) -> Result<Option<Vec<u8>>, FileProcError> {
        let mut buf = vec![0u8; self.chunk_size];
        let mut filled = 0;
        while filled < buf.len() {
            let n = self
                .file
                .read(&mut buf[filled..])
                .await
                .map_err(|e| FileProcError::staging(&self.path, e))?;
            if n == 0 {
                break;
            }
            filled += n;
        }
        if filled == 0 {
            return Ok(None);
        }
        buf.truncate(filled);
        Ok(Some(buf))
    }
}
