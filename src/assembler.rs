//! Request assembler: drains an inbound content stream into a staged input.
//!
//! Chunks are appended to disk as they arrive; nothing is held in memory
//! beyond the chunk being written. The input lands in a fresh scratch
//! directory owned by the request. If the stream breaks or a write fails, the
//! partially written artifact and its directory are removed before the error
//! is returned.
//!
//! A caller may declare the content length up front (see
//! [`crate::transport::CONTENT_LENGTH_KEY`]). A stream that half-closes short
//! of, or past, the declared length is a receive failure.

use crate::error::FileProcError;
use crate::registry::Job;
use crate::staging::{ScratchDir, StagedArtifact, StagingStore};
use crate::transport::{ContentMessage, ContentStream, ParameterMessage, ParameterizedStream};
use futures::Stream;
use tonic::Status;
use tracing::{debug, warn};

/// A fully received request, ready for execution.
#[derive(Debug)]
pub struct AssembledRequest {
    pub job: Job,
    pub input: StagedArtifact,
    /// Directory holding `input`; the collaborator's output goes next to it.
    pub scratch: ScratchDir,
    pub bytes: u64,
    pub chunks: u64,
}

/// Turns inbound streams into [`AssembledRequest`]s.
#[derive(Debug, Clone)]
pub struct RequestAssembler {
    store: StagingStore,
}

impl RequestAssembler {
    pub fn new(store: StagingStore) -> Self {
        Self { store }
    }

    pub fn store(&self) -> &StagingStore {
        &self.store
    }

    /// Receive a stream that carries only content.
    pub async fn receive_plain<S, M>(
        &self,
        job: Job,
        inbound: S,
        declared_len: Option<u64>,
    ) -> Result<AssembledRequest, FileProcError>
    where
        S: Stream<Item = Result<M, Status>> + Unpin,
        M: ContentMessage,
    {
        self.stage(job, ContentStream::new(inbound), declared_len).await
    }

    /// Receive a stream that opens with a parameter message.
    ///
    /// `make_job` turns the validated parameter into the job to run. A
    /// missing or invalid parameter fails before anything is staged.
    pub async fn receive_parameterized<S, M, F>(
        &self,
        inbound: S,
        declared_len: Option<u64>,
        make_job: F,
    ) -> Result<AssembledRequest, FileProcError>
    where
        S: Stream<Item = Result<M, Status>> + Unpin,
        M: ParameterMessage,
        F: FnOnce(M::Parameter) -> Job,
    {
        let (parameter, content) = ParameterizedStream::new(inbound).take_parameter().await?;
        self.stage(make_job(parameter), content, declared_len).await
    }

    async fn stage<S, M>(
        &self,
        job: Job,
        mut content: ContentStream<S>,
        declared_len: Option<u64>,
    ) -> Result<AssembledRequest, FileProcError>
    where
        S: Stream<Item = Result<M, Status>> + Unpin,
        M: ContentMessage,
    {
        let prefix = job.operation().staging_prefix();
        let scratch = self.store.scratch_dir(prefix).await?;
        let (artifact, mut writer) = match scratch.store().create_unique(prefix).await {
            Ok(staged) => staged,
            Err(e) => {
                discard(None, scratch).await;
                return Err(e);
            }
        };

        let written: Result<u64, FileProcError> = async {
            while let Some(chunk) = content.next_chunk().await? {
                writer.append_bytes(&chunk).await?;
            }
            let bytes = writer.close_for_write().await?;
            match declared_len {
                Some(declared) if declared != bytes => Err(FileProcError::ReceiveFailure(format!(
                    "stream ended after {bytes} of {declared} declared bytes"
                ))),
                _ => Ok(bytes),
            }
        }
        .await;

        match written {
            Ok(bytes) => {
                debug!(
                    "Received {} bytes in {} chunks into {}",
                    bytes,
                    content.chunks(),
                    artifact.path().display()
                );
                Ok(AssembledRequest {
                    job,
                    input: artifact,
                    scratch,
                    bytes,
                    chunks: content.chunks(),
                })
            }
            Err(e) => {
                discard(Some(artifact), scratch).await;
                Err(e)
            }
        }
    }
}

async fn discard(artifact: Option<StagedArtifact>, scratch: ScratchDir) {
    if let Some(artifact) = artifact {
        if let Err(e) = artifact.delete().await {
            warn!("Failed to remove partial input: {}", e);
        }
    }
    if let Err(e) = scratch.close().await {
        warn!("Failed to remove scratch directory: {}", e);
    }
}
