//! gRPC surface: the four streaming RPCs of `file_processor.FileProcessorService`.
//!
//! Each call gets its own task. The handler returns the response stream
//! immediately; the task drives the [`RequestLifecycle`] and feeds the stream
//! through a bounded channel, ending it with the final status.

use crate::assembler::{AssembledRequest, RequestAssembler};
use crate::config::ServerConfig;
use crate::error::FileProcError;
use crate::executor::JobExecutor;
use crate::lifecycle::RequestLifecycle;
use crate::logging::OperationLog;
use crate::proto::file_processor_service_server::{
    FileProcessorService, FileProcessorServiceServer,
};
use crate::proto::{ConvertImageRequest, FileChunk, ResizeImageRequest};
use crate::registry::{Job, Operation, OperationRegistry};
use crate::staging::StagingStore;
use crate::transport::{declared_length, response_channel, ResponseStream, StatusFallback};
use std::future::Future;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use tokio::net::TcpListener;
use tokio::task::JoinHandle;
use tokio_stream::wrappers::TcpListenerStream;
use tonic::transport::Server;
use tonic::{Request, Response, Status, Streaming};
use tracing::{debug, error, info};

/// Server-side implementation of `FileProcessorService`.
#[derive(Debug)]
pub struct FileProcessor {
    lifecycle: Arc<RequestLifecycle>,
    assembler: RequestAssembler,
    outbound_buffer: usize,
    next_request: AtomicU64,
}

impl FileProcessor {
    /// Build a service from `config`, opening its staging directory.
    pub async fn new(
        config: &ServerConfig,
        log: Arc<OperationLog>,
    ) -> Result<Self, FileProcError> {
        let store = StagingStore::open(&config.staging_dir).await?;
        let registry = OperationRegistry::new(&config.programs);
        Ok(Self::with_registry(config, store, registry, log))
    }

    /// Build a service around an existing store and a custom registry.
    pub fn with_registry(
        config: &ServerConfig,
        store: StagingStore,
        registry: OperationRegistry,
        log: Arc<OperationLog>,
    ) -> Self {
        let executor = JobExecutor::new(Arc::new(registry));
        let lifecycle = RequestLifecycle::new(executor, log, config.read_chunk_size);
        Self {
            lifecycle: Arc::new(lifecycle),
            assembler: RequestAssembler::new(store),
            outbound_buffer: config.outbound_buffer.max(1),
            next_request: AtomicU64::new(1),
        }
    }

    /// The staging store shared by all requests.
    pub fn store(&self) -> &StagingStore {
        self.assembler.store()
    }

    /// Wrap into the tonic service type.
    pub fn into_server(self) -> FileProcessorServiceServer<Self> {
        FileProcessorServiceServer::new(self)
    }

    fn spawn<F>(&self, operation: Operation, receive: F) -> Response<ResponseStream>
    where
        F: Future<Output = Result<AssembledRequest, FileProcError>> + Send + 'static,
    {
        let request_id = self.next_request.fetch_add(1, Ordering::Relaxed);
        let (sender, stream) = response_channel(self.outbound_buffer);
        let fallback = sender.fallback();
        let lifecycle = Arc::clone(&self.lifecycle);
        let task = tokio::spawn(async move {
            lifecycle.run(request_id, operation, receive, sender).await
        });
        tokio::spawn(async move {
            if let Some(report) = supervise(request_id, operation, task, fallback).await {
                debug!(
                    request_id,
                    operation = %operation,
                    ok = report.succeeded(),
                    elapsed_ms = report.elapsed_ms,
                    "Request task finished"
                );
            }
        });
        Response::new(stream)
    }
}

/// Wait for a request task. A task that panicked or was cancelled never sent
/// its final status, so its stream is ended with INTERNAL here.
async fn supervise<T>(
    request_id: u64,
    operation: Operation,
    task: JoinHandle<T>,
    fallback: StatusFallback,
) -> Option<T> {
    match task.await {
        Ok(output) => Some(output),
        Err(e) => {
            error!(request_id, operation = %operation, "Request task aborted: {}", e);
            let status = Status::internal(format!("request {request_id} aborted"));
            if !fallback.fail(status).await {
                debug!(request_id, "Caller left before the abort status");
            }
            None
        }
    }
}

#[tonic::async_trait]
impl FileProcessorService for FileProcessor {
    type CompressPDFStream = ResponseStream;
    type ConvertToTXTStream = ResponseStream;
    type ConvertImageFormatStream = ResponseStream;
    type ResizeImageStream = ResponseStream;

    async fn compress_pdf(
        &self,
        request: Request<Streaming<FileChunk>>,
    ) -> Result<Response<Self::CompressPDFStream>, Status> {
        let declared = declared_length(request.metadata());
        let inbound = request.into_inner();
        let assembler = self.assembler.clone();
        Ok(self.spawn(Operation::CompressPdf, async move {
            let declared_len = declared?;
            assembler
                .receive_plain(Job::CompressPdf, inbound, declared_len)
                .await
        }))
    }

    async fn convert_to_txt(
        &self,
        request: Request<Streaming<FileChunk>>,
    ) -> Result<Response<Self::ConvertToTXTStream>, Status> {
        let declared = declared_length(request.metadata());
        let inbound = request.into_inner();
        let assembler = self.assembler.clone();
        Ok(self.spawn(Operation::ConvertToTxt, async move {
            let declared_len = declared?;
            assembler
                .receive_plain(Job::ConvertToTxt, inbound, declared_len)
                .await
        }))
    }

    async fn convert_image_format(
        &self,
        request: Request<Streaming<ConvertImageRequest>>,
    ) -> Result<Response<Self::ConvertImageFormatStream>, Status> {
        let declared = declared_length(request.metadata());
        let inbound = request.into_inner();
        let assembler = self.assembler.clone();
        Ok(self.spawn(Operation::ConvertImageFormat, async move {
            let declared_len = declared?;
            assembler
                .receive_parameterized(inbound, declared_len, Job::ConvertImageFormat)
                .await
        }))
    }

    async fn resize_image(
        &self,
        request: Request<Streaming<ResizeImageRequest>>,
    ) -> Result<Response<Self::ResizeImageStream>, Status> {
        let declared = declared_length(request.metadata());
        let inbound = request.into_inner();
        let assembler = self.assembler.clone();
        Ok(self.spawn(Operation::ResizeImage, async move {
            let declared_len = declared?;
            assembler
                .receive_parameterized(inbound, declared_len, Job::ResizeImage)
                .await
        }))
    }
}

/// Bind `config.listen_addr` and serve until `shutdown` resolves.
pub async fn serve<F>(
    config: &ServerConfig,
    log: Arc<OperationLog>,
    shutdown: F,
) -> Result<(), FileProcError>
where
    F: Future<Output = ()> + Send,
{
    let listener = TcpListener::bind(config.listen_addr)
        .await
        .map_err(|e| FileProcError::Rpc {
            code: tonic::Code::Unavailable,
            message: format!("cannot bind {}: {e}", config.listen_addr),
        })?;
    let service = FileProcessor::new(config, Arc::clone(&log)).await?;
    serve_listener(listener, service, log, shutdown).await
}

/// Serve `service` on an already-bound listener until `shutdown` resolves.
pub async fn serve_listener<F>(
    listener: TcpListener,
    service: FileProcessor,
    log: Arc<OperationLog>,
    shutdown: F,
) -> Result<(), FileProcError>
where
    F: Future<Output = ()> + Send,
{
    let addr = listener
        .local_addr()
        .map(|a| a.to_string())
        .unwrap_or_else(|_| "<unknown>".to_string());
    let store = service.store().clone();
    info!("Staging artifacts under {}", store.dir().display());
    log.info("Server", &format!("Listening on {addr}"));

    Server::builder()
        .add_service(service.into_server())
        .serve_with_incoming_shutdown(TcpListenerStream::new(listener), shutdown)
        .await?;

    log.info(
        "Server",
        &format!("Shut down with {} live artifacts", store.live_artifacts()),
    );
    Ok(())
}
