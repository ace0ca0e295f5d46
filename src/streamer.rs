//! Response streamer: sends an output artifact as a sequence of chunks.

use crate::error::FileProcError;
use crate::staging::StagedArtifact;
use crate::transport::ChunkSender;
use tracing::debug;

/// Totals for one streamed artifact.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct StreamedOutput {
    pub bytes: u64,
    pub chunks: u64,
}

/// Read `artifact` sequentially in `chunk_size` pieces and send each one.
///
/// Chunks go out in file order and their concatenation is the artifact's
/// content. The sender's bounded channel applies backpressure, so at most a
/// handful of chunks are buffered at any time. An empty artifact sends no
/// chunks.
pub async fn stream_artifact(
    artifact: &StagedArtifact,
    chunk_size: usize,
    sender: &mut ChunkSender,
) -> Result<StreamedOutput, FileProcError> {
    let mut reader = artifact.open_for_read(chunk_size).await?;
    let mut out = StreamedOutput::default();
    while let Some(chunk) = reader.read_chunk().await? {
        out.bytes += chunk.len() as u64;
        sender.send_chunk(chunk).await?;
        out.chunks += 1;
    }
    debug!(
        "Streamed {} bytes in {} chunks from {}",
        out.bytes,
        out.chunks,
        artifact.path().display()
    );
    Ok(out)
}
