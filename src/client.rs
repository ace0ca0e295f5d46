//! Library client for `file_processor.FileProcessorService`.
//!
//! Each call uploads a local file in `chunk_size` pieces from a background
//! task while the caller's task writes the response chunks to
//! `<output>.part`. The part file is renamed onto `output` only when the
//! server ends the call with OK; on any error it is removed and `output` is
//! left untouched.
//!
//! Every call declares the input's size under [`CONTENT_LENGTH_KEY`]. If the
//! local read fails part way the upload stream just ends, and the server
//! rejects the short input instead of processing it; the caller gets the
//! read error.

use crate::config::ClientConfig;
use crate::error::FileProcError;
use crate::progress::{NoopProgressCallback, ProgressCallback};
use crate::proto::file_processor_service_client::FileProcessorServiceClient;
use crate::proto::{
    convert_image_request, resize_image_request, ConvertImageRequest, Dimensions, FileChunk,
    ResizeImageRequest,
};
use crate::registry::Operation;
use crate::transport::CONTENT_LENGTH_KEY;
use serde::Serialize;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Instant;
use tokio::fs::File;
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tokio_stream::wrappers::ReceiverStream;
use tonic::transport::{Channel, Endpoint};
use tonic::{Request, Streaming};
use tracing::{debug, warn};

/// Depth of the upload channel between the reader task and tonic.
const UPLOAD_BUFFER: usize = 4;

/// Outcome of one successful call.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct TransferSummary {
    pub operation: String,
    pub input: PathBuf,
    pub output: PathBuf,
    pub bytes_sent: u64,
    pub chunks_sent: u64,
    pub bytes_received: u64,
    pub chunks_received: u64,
    pub elapsed_ms: u64,
}

#[derive(Debug, Default, Clone, Copy)]
struct UploadStats {
    bytes: u64,
    chunks: u64,
}

type UploadTask = JoinHandle<Result<UploadStats, FileProcError>>;

struct Download {
    bytes: u64,
    chunks: u64,
}

/// Client handle. Cheap to clone; clones share the underlying channel.
#[derive(Clone)]
pub struct FileProcessorClient {
    inner: FileProcessorServiceClient<Channel>,
    config: ClientConfig,
    progress: ProgressCallback,
}

impl FileProcessorClient {
    /// Connect to `endpoint`, e.g. `http://localhost:50051`.
    pub async fn connect(
        endpoint: impl Into<String>,
        config: ClientConfig,
    ) -> Result<Self, FileProcError> {
        let endpoint = endpoint.into();
        let channel = Endpoint::from_shared(endpoint.clone())
            .map_err(|e| {
                FileProcError::InvalidConfig(format!("invalid server address {endpoint:?}: {e}"))
            })?
            .connect()
            .await?;
        debug!("Connected to {}", endpoint);
        Ok(Self::from_channel(channel, config))
    }

    pub fn from_channel(channel: Channel, config: ClientConfig) -> Self {
        Self {
            inner: FileProcessorServiceClient::new(channel),
            config,
            progress: Arc::new(NoopProgressCallback),
        }
    }

    /// Attach a progress callback.
    pub fn with_progress(mut self, progress: ProgressCallback) -> Self {
        self.progress = progress;
        self
    }

    pub async fn compress_pdf(
        &mut self,
        input: &Path,
        output: &Path,
    ) -> Result<TransferSummary, FileProcError> {
        let start = Instant::now();
        let (request, upload) = self
            .start_upload(Operation::CompressPdf, input, None, plain_chunk)
            .await?;
        let response = match self.inner.compress_pdf(request).await {
            Ok(r) => r.into_inner(),
            Err(status) => return Err(settle(upload, status.into()).await),
        };
        self.complete(Operation::CompressPdf, input, output, response, upload, start)
            .await
    }

    pub async fn convert_to_txt(
        &mut self,
        input: &Path,
        output: &Path,
    ) -> Result<TransferSummary, FileProcError> {
        let start = Instant::now();
        let (request, upload) = self
            .start_upload(Operation::ConvertToTxt, input, None, plain_chunk)
            .await?;
        let response = match self.inner.convert_to_txt(request).await {
            Ok(r) => r.into_inner(),
            Err(status) => return Err(settle(upload, status.into()).await),
        };
        self.complete(Operation::ConvertToTxt, input, output, response, upload, start)
            .await
    }

    /// Convert an image to `format` (e.g. `png`). The format is validated by
    /// the server.
    pub async fn convert_image_format(
        &mut self,
        input: &Path,
        output: &Path,
        format: &str,
    ) -> Result<TransferSummary, FileProcError> {
        let start = Instant::now();
        let first = ConvertImageRequest {
            data: Some(convert_image_request::Data::OutputFormat(format.to_string())),
        };
        let (request, upload) = self
            .start_upload(Operation::ConvertImageFormat, input, Some(first), convert_chunk)
            .await?;
        let response = match self.inner.convert_image_format(request).await {
            Ok(r) => r.into_inner(),
            Err(status) => return Err(settle(upload, status.into()).await),
        };
        self.complete(Operation::ConvertImageFormat, input, output, response, upload, start)
            .await
    }

    /// Resize an image to exactly `width` × `height`. The dimensions are
    /// validated by the server.
    pub async fn resize_image(
        &mut self,
        input: &Path,
        output: &Path,
        width: i32,
        height: i32,
    ) -> Result<TransferSummary, FileProcError> {
        let start = Instant::now();
        let first = ResizeImageRequest {
            data: Some(resize_image_request::Data::Dimensions(Dimensions { width, height })),
        };
        let (request, upload) = self
            .start_upload(Operation::ResizeImage, input, Some(first), resize_chunk)
            .await?;
        let response = match self.inner.resize_image(request).await {
            Ok(r) => r.into_inner(),
            Err(status) => return Err(settle(upload, status.into()).await),
        };
        self.complete(Operation::ResizeImage, input, output, response, upload, start)
            .await
    }

    // ── Upload ───────────────────────────────────────────────────────────────

    async fn start_upload<M>(
        &self,
        operation: Operation,
        input: &Path,
        first: Option<M>,
        wrap: fn(Vec<u8>) -> M,
    ) -> Result<(Request<ReceiverStream<M>>, UploadTask), FileProcError>
    where
        M: Send + 'static,
    {
        let file = File::open(input).await.map_err(|e| FileProcError::io(input, e))?;
        let input_bytes = file
            .metadata()
            .await
            .map_err(|e| FileProcError::io(input, e))?
            .len();
        self.progress.on_start(operation.rpc_name(), input_bytes);

        let (tx, rx) = mpsc::channel(UPLOAD_BUFFER);
        let chunk_size = self.config.chunk_size.max(1);
        let progress = Arc::clone(&self.progress);
        let path = input.to_path_buf();

        let handle = tokio::spawn(async move {
            let mut file = file;
            let mut stats = UploadStats::default();
            if let Some(first) = first {
                if tx.send(first).await.is_err() {
                    return Ok::<UploadStats, FileProcError>(stats);
                }
            }
            loop {
                let mut buf = vec![0u8; chunk_size];
                let mut filled = 0;
                while filled < buf.len() {
                    let n = file
                        .read(&mut buf[filled..])
                        .await
                        .map_err(|e| FileProcError::io(&path, e))?;
                    if n == 0 {
                        break;
                    }
                    filled += n;
                }
                if filled == 0 {
                    if stats.bytes != input_bytes {
                        let changed = std::io::Error::new(
                            std::io::ErrorKind::UnexpectedEof,
                            format!("read {} of {input_bytes} bytes", stats.bytes),
                        );
                        return Err(FileProcError::io(&path, changed));
                    }
                    break;
                }
                buf.truncate(filled);
                if tx.send(wrap(buf)).await.is_err() {
                    // The server ended the call before reading everything.
                    break;
                }
                stats.bytes += filled as u64;
                stats.chunks += 1;
                progress.on_upload(stats.bytes);
            }
            Ok::<UploadStats, FileProcError>(stats)
        });

        let mut request = Request::new(ReceiverStream::new(rx));
        request
            .metadata_mut()
            .insert(CONTENT_LENGTH_KEY, input_bytes.into());
        Ok((request, handle))
    }

    // ── Download ─────────────────────────────────────────────────────────────

    async fn complete(
        &self,
        operation: Operation,
        input: &Path,
        output: &Path,
        response: Streaming<FileChunk>,
        upload: UploadTask,
        start: Instant,
    ) -> Result<TransferSummary, FileProcError> {
        let part = part_path(output);
        let downloaded = self.download(response, &part).await;

        let result = match downloaded {
            Ok(download) => match join_upload(upload).await {
                Ok(sent) => Ok((sent, download)),
                Err(e) => Err(e),
            },
            Err(e) => Err(settle(upload, e).await),
        };

        let (sent, download) = match result {
            Ok(v) => v,
            Err(e) => {
                if let Err(rm) = tokio::fs::remove_file(&part).await {
                    if rm.kind() != std::io::ErrorKind::NotFound {
                        warn!("Failed to remove {}: {}", part.display(), rm);
                    }
                }
                self.progress.on_finish(false);
                return Err(e);
            }
        };

        tokio::fs::rename(&part, output)
            .await
            .map_err(|e| FileProcError::io(output, e))?;
        self.progress.on_finish(true);

        Ok(TransferSummary {
            operation: operation.rpc_name().to_string(),
            input: input.to_path_buf(),
            output: output.to_path_buf(),
            bytes_sent: sent.bytes,
            chunks_sent: sent.chunks,
            bytes_received: download.bytes,
            chunks_received: download.chunks,
            elapsed_ms: start.elapsed().as_millis() as u64,
        })
    }

    async fn download(
        &self,
        mut response: Streaming<FileChunk>,
        part: &Path,
    ) -> Result<Download, FileProcError> {
        let mut file = File::create(part).await.map_err(|e| FileProcError::io(part, e))?;
        let mut download = Download { bytes: 0, chunks: 0 };
        while let Some(chunk) = response.message().await? {
            file.write_all(&chunk.content)
                .await
                .map_err(|e| FileProcError::io(part, e))?;
            download.bytes += chunk.content.len() as u64;
            download.chunks += 1;
            self.progress.on_download(download.bytes);
        }
        file.flush().await.map_err(|e| FileProcError::io(part, e))?;
        Ok(download)
    }
}

fn plain_chunk(content: Vec<u8>) -> FileChunk {
    FileChunk { content }
}

fn convert_chunk(content: Vec<u8>) -> ConvertImageRequest {
    ConvertImageRequest {
        data: Some(convert_image_request::Data::Content(content)),
    }
}

fn resize_chunk(content: Vec<u8>) -> ResizeImageRequest {
    ResizeImageRequest {
        data: Some(resize_image_request::Data::Content(content)),
    }
}

/// Stop the upload after the call failed with `err`. A local read error
/// explains the failure better than the status it provoked.
async fn settle(upload: UploadTask, err: FileProcError) -> FileProcError {
    upload.abort();
    match upload.await {
        Ok(Err(read_err @ FileProcError::Io { .. })) => read_err,
        _ => err,
    }
}

async fn join_upload(upload: UploadTask) -> Result<UploadStats, FileProcError> {
    upload.await.map_err(|e| FileProcError::Rpc {
        code: tonic::Code::Internal,
        message: format!("upload task failed: {e}"),
    })?
}

/// `<output>.part`
pub fn part_path(output: &Path) -> PathBuf {
    let mut name = output.as_os_str().to_os_string();
    name.push(".part");
    PathBuf::from(name)
}
