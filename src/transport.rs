//! Transport-facing stream adapters.
//!
//! All four RPCs share one inbound abstraction, [`ContentStream`], which
//! yields raw content chunks in arrival order from any message type that
//! implements [`ContentMessage`]. The two parameterized RPCs wrap their stream
//! in [`ParameterizedStream`], which consumes the leading parameter message
//! and then hands back a plain `ContentStream` over the rest, so the content
//! path is the same code for every operation.
//!
//! Outbound, [`ChunkSender`] feeds a bounded channel whose receiving half is
//! the tonic response body. The terminal non-OK status travels as the last
//! `Err` item; OK is simply end-of-stream.
//!
//! A half-close looks the same whether the caller sent everything or gave up
//! early, so callers may declare the content length in request metadata under
//! [`CONTENT_LENGTH_KEY`].

use crate::error::FileProcError;
use crate::proto::{
    convert_image_request, resize_image_request, ConvertImageRequest, FileChunk,
    ResizeImageRequest,
};
use crate::registry::{Geometry, TargetFormat};
use futures::{Stream, StreamExt};
use tokio::sync::mpsc;
use tokio_stream::wrappers::ReceiverStream;
use tonic::metadata::MetadataMap;
use tonic::Status;
use tracing::debug;

/// Response body type shared by every RPC.
pub type ResponseStream = ReceiverStream<Result<FileChunk, Status>>;

/// Request metadata key carrying the total content bytes the caller will send.
pub const CONTENT_LENGTH_KEY: &str = "x-fileproc-content-length";

/// The declared content length, if the caller sent one.
pub fn declared_length(metadata: &MetadataMap) -> Result<Option<u64>, FileProcError> {
    let Some(value) = metadata.get(CONTENT_LENGTH_KEY) else {
        return Ok(None);
    };
    value
        .to_str()
        .ok()
        .and_then(|v| v.trim().parse::<u64>().ok())
        .map(Some)
        .ok_or_else(|| {
            FileProcError::InvalidArgument(format!(
                "{CONTENT_LENGTH_KEY} must be a byte count, got {value:?}"
            ))
        })
}

/// An inbound message that may carry a content chunk.
pub trait ContentMessage {
    /// The chunk bytes, or `None` if this message carries something else.
    fn into_content(self) -> Option<Vec<u8>>;
}

/// An inbound message type whose stream opens with a parameter.
pub trait ParameterMessage: ContentMessage {
    type Parameter;

    /// Field name used in error messages.
    const PARAMETER: &'static str;

    /// Extract and validate the parameter from the first message.
    fn into_parameter(self) -> Result<Self::Parameter, FileProcError>;
}

impl ContentMessage for FileChunk {
    fn into_content(self) -> Option<Vec<u8>> {
        Some(self.content)
    }
}

impl ContentMessage for ConvertImageRequest {
    fn into_content(self) -> Option<Vec<u8>> {
        match self.data {
            Some(convert_image_request::Data::Content(bytes)) => Some(bytes),
            _ => None,
        }
    }
}

impl ContentMessage for ResizeImageRequest {
    fn into_content(self) -> Option<Vec<u8>> {
        match self.data {
            Some(resize_image_request::Data::Content(bytes)) => Some(bytes),
            _ => None,
        }
    }
}

impl ParameterMessage for ConvertImageRequest {
    type Parameter = TargetFormat;
    const PARAMETER: &'static str = "output_format";

    fn into_parameter(self) -> Result<TargetFormat, FileProcError> {
        match self.data {
            Some(convert_image_request::Data::OutputFormat(format)) => TargetFormat::parse(&format),
            Some(convert_image_request::Data::Content(_)) => Err(FileProcError::InvalidArgument(
                "the first message must carry output_format, got a content chunk".into(),
            )),
            None => Err(FileProcError::InvalidArgument(
                "the first message must carry output_format".into(),
            )),
        }
    }
}

impl ParameterMessage for ResizeImageRequest {
    type Parameter = Geometry;
    const PARAMETER: &'static str = "dimensions";

    fn into_parameter(self) -> Result<Geometry, FileProcError> {
        match self.data {
            Some(resize_image_request::Data::Dimensions(d)) => Geometry::new(d.width, d.height),
            Some(resize_image_request::Data::Content(_)) => Err(FileProcError::InvalidArgument(
                "the first message must carry dimensions, got a content chunk".into(),
            )),
            None => Err(FileProcError::InvalidArgument(
                "the first message must carry dimensions".into(),
            )),
        }
    }
}

/// Content chunks of an inbound stream, in arrival order.
pub struct ContentStream<S> {
    inner: S,
    chunks: u64,
}

impl<S, M> ContentStream<S>
where
    S: Stream<Item = Result<M, Status>> + Unpin,
    M: ContentMessage,
{
    pub fn new(inner: S) -> Self {
        Self { inner, chunks: 0 }
    }

    /// Next content chunk, or `None` once the caller half-closed the stream.
    ///
    /// Messages without content are skipped. A transport error surfaces as
    /// [`FileProcError::ReceiveFailure`].
    pub async fn next_chunk(&mut self) -> Result<Option<Vec<u8>>, FileProcError> {
        loop {
            match self.inner.next().await {
                None => return Ok(None),
                Some(Err(status)) => {
                    return Err(FileProcError::ReceiveFailure(format!(
                        "{:?}: {}",
                        status.code(),
                        status.message()
                    )))
                }
                Some(Ok(message)) => match message.into_content() {
                    Some(bytes) => {
                        self.chunks += 1;
                        return Ok(Some(bytes));
                    }
                    None => debug!("Skipping inbound message without content"),
                },
            }
        }
    }

    /// Content chunks yielded so far.
    pub fn chunks(&self) -> u64 {
        self.chunks
    }
}

/// Inbound stream that must open with a parameter message.
pub struct ParameterizedStream<S> {
    inner: S,
}

impl<S, M> ParameterizedStream<S>
where
    S: Stream<Item = Result<M, Status>> + Unpin,
    M: ParameterMessage,
{
    pub fn new(inner: S) -> Self {
        Self { inner }
    }

    /// Consume the leading parameter and return the remaining content.
    pub async fn take_parameter(
        mut self,
    ) -> Result<(M::Parameter, ContentStream<S>), FileProcError> {
        match self.inner.next().await {
            None => Err(FileProcError::InvalidArgument(format!(
                "stream closed before the {} message",
                M::PARAMETER
            ))),
            Some(Err(status)) => Err(FileProcError::ReceiveFailure(format!(
                "{:?}: {}",
                status.code(),
                status.message()
            ))),
            Some(Ok(first)) => {
                let parameter = first.into_parameter()?;
                Ok((parameter, ContentStream::new(self.inner)))
            }
        }
    }
}

/// Create the outbound channel for one request.
pub fn response_channel(depth: usize) -> (ChunkSender, ResponseStream) {
    let (tx, rx) = mpsc::channel(depth.max(1));
    (
        ChunkSender {
            tx,
            sent_chunks: 0,
            sent_bytes: 0,
        },
        ReceiverStream::new(rx),
    )
}

/// Sending half of a response stream.
#[derive(Debug)]
pub struct ChunkSender {
    tx: mpsc::Sender<Result<FileChunk, Status>>,
    sent_chunks: u64,
    sent_bytes: u64,
}

impl ChunkSender {
    /// Emit one outbound chunk. Fails once the caller has gone away.
    pub async fn send_chunk(&mut self, content: Vec<u8>) -> Result<(), FileProcError> {
        let len = content.len() as u64;
        self.tx
            .send(Ok(FileChunk { content }))
            .await
            .map_err(|_| FileProcError::TransmissionFailure {
                sent_chunks: self.sent_chunks,
                detail: "response stream closed by the caller".into(),
            })?;
        self.sent_chunks += 1;
        self.sent_bytes += len;
        Ok(())
    }

    pub fn sent_chunks(&self) -> u64 {
        self.sent_chunks
    }

    pub fn sent_bytes(&self) -> u64 {
        self.sent_bytes
    }

    /// Close the outbound half, reporting `outcome` as the final status.
    ///
    /// Returns `false` if the caller was no longer listening.
    pub async fn finish(self, outcome: Result<(), Status>) -> bool {
        match outcome {
            Ok(()) => !self.tx.is_closed(),
            Err(status) => self.tx.send(Err(status)).await.is_ok(),
        }
    }

    /// A second handle on the same stream for a terminal error raised outside
    /// the task that owns this sender. The stream stays open while it lives.
    pub fn fallback(&self) -> StatusFallback {
        StatusFallback {
            tx: self.tx.clone(),
        }
    }
}

/// See [`ChunkSender::fallback`].
#[derive(Debug)]
pub struct StatusFallback {
    tx: mpsc::Sender<Result<FileChunk, Status>>,
}

impl StatusFallback {
    /// End the stream with `status`. Returns `false` if the caller is gone.
    pub async fn fail(self, status: Status) -> bool {
        self.tx.send(Err(status)).await.is_ok()
    }
}
