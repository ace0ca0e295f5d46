//! Request lifecycle: the per-request state machine.
//!
//! ```text
//! RECEIVING ──► RECEIVED ──► EXECUTING ──► EXECUTED ──► SENDING ──► DONE ──┐
//!     │             │            │             │            │              ├─► CLEANUP
//!     └─────────────┴────────────┴─────────────┴────────────┴──► FAILED ───┘
//! ```
//!
//! Every request ends in CLEANUP, which deletes whatever artifacts the
//! request staged and then removes its scratch directory, taking any
//! by-products the collaborator wrote alongside. Cleanup runs *before* the
//! final status is handed to the transport, so once the caller observes the
//! end of the call nothing of that request is left in the staging directory.
//!
//! Requests share nothing mutable except the staging directory (unique names)
//! and the operation log (append-only), so any number of lifecycles may run
//! concurrently.

use crate::assembler::AssembledRequest;
use crate::error::FileProcError;
use crate::executor::JobExecutor;
use crate::logging::OperationLog;
use crate::registry::Operation;
use crate::staging::{ScratchDir, StagedArtifact};
use crate::streamer::stream_artifact;
use crate::transport::ChunkSender;
use std::fmt;
use std::future::Future;
use std::sync::Arc;
use std::time::Instant;
use tonic::Status;
use tracing::{debug, warn};

/// States a request passes through.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RequestState {
    Receiving,
    Received,
    Executing,
    Executed,
    Sending,
    Done,
    Failed,
    Cleanup,
}

impl fmt::Display for RequestState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(match self {
            RequestState::Receiving => "RECEIVING",
            RequestState::Received => "RECEIVED",
            RequestState::Executing => "EXECUTING",
            RequestState::Executed => "EXECUTED",
            RequestState::Sending => "SENDING",
            RequestState::Done => "DONE",
            RequestState::Failed => "FAILED",
            RequestState::Cleanup => "CLEANUP",
        })
    }
}

/// What happened to one request.
#[derive(Debug)]
pub struct RequestReport {
    pub request_id: u64,
    pub operation: Operation,
    /// Every state entered, in order, starting with `Receiving`.
    pub transitions: Vec<RequestState>,
    pub bytes_received: u64,
    pub bytes_sent: u64,
    pub chunks_sent: u64,
    pub elapsed_ms: u64,
    /// The terminal error, if the request failed.
    pub error: Option<FileProcError>,
}

impl RequestReport {
    pub fn succeeded(&self) -> bool {
        self.error.is_none()
    }
}

struct Tracker {
    request_id: u64,
    operation: Operation,
    transitions: Vec<RequestState>,
}

impl Tracker {
    fn new(request_id: u64, operation: Operation) -> Self {
        debug!(request_id, operation = %operation, "→ {}", RequestState::Receiving);
        Self {
            request_id,
            operation,
            transitions: vec![RequestState::Receiving],
        }
    }

    fn advance(&mut self, next: RequestState) {
        debug!(
            request_id = self.request_id,
            operation = %self.operation,
            "→ {}",
            next
        );
        self.transitions.push(next);
    }
}

/// Everything one request has put on disk so far.
#[derive(Default)]
struct Staged {
    artifacts: Vec<StagedArtifact>,
    scratch: Option<ScratchDir>,
}

impl Staged {
    async fn clean_up(self, request_id: u64) {
        for artifact in self.artifacts {
            if let Err(e) = artifact.delete().await {
                warn!(request_id, "Cleanup failed: {}", e);
            }
        }
        if let Some(scratch) = self.scratch {
            if let Err(e) = scratch.close().await {
                warn!(request_id, "Cleanup failed: {}", e);
            }
        }
    }
}

/// Drives requests from first inbound message to final status.
#[derive(Debug, Clone)]
pub struct RequestLifecycle {
    executor: JobExecutor,
    log: Arc<OperationLog>,
    read_chunk_size: usize,
}

impl RequestLifecycle {
    pub fn new(executor: JobExecutor, log: Arc<OperationLog>, read_chunk_size: usize) -> Self {
        Self {
            executor,
            log,
            read_chunk_size: read_chunk_size.max(1),
        }
    }

    /// Run one request to completion.
    ///
    /// `receive` is the RECEIVING phase: it drains the inbound stream into a
    /// staged input. The final status (OK or the terminal error) is delivered
    /// through `sender` after cleanup.
    pub async fn run<F>(
        &self,
        request_id: u64,
        operation: Operation,
        receive: F,
        mut sender: ChunkSender,
    ) -> RequestReport
    where
        F: Future<Output = Result<AssembledRequest, FileProcError>>,
    {
        let component = operation.rpc_name();
        let start = Instant::now();
        self.log
            .info(component, &format!("Request {request_id} received"));

        let mut tracker = Tracker::new(request_id, operation);
        let mut staged = Staged::default();
        let mut bytes_received = 0;

        let outcome = self
            .drive(
                receive,
                &mut tracker,
                &mut staged,
                &mut bytes_received,
                &mut sender,
            )
            .await;

        tracker.advance(if outcome.is_ok() {
            RequestState::Done
        } else {
            RequestState::Failed
        });
        tracker.advance(RequestState::Cleanup);
        staged.clean_up(request_id).await;

        let bytes_sent = sender.sent_bytes();
        let chunks_sent = sender.sent_chunks();
        let elapsed_ms = start.elapsed().as_millis() as u64;

        let error = match outcome {
            Ok(()) => {
                self.log.success(
                    component,
                    &format!(
                        "Request {request_id} done: {bytes_received} bytes in, \
                         {bytes_sent} bytes out in {chunks_sent} chunks ({elapsed_ms} ms)"
                    ),
                );
                if !sender.finish(Ok(())).await {
                    debug!(request_id, "Caller left before the final status");
                }
                None
            }
            Err(e) => {
                self.log.error(
                    component,
                    &format!(
                        "Request {request_id} failed ({}) after {chunks_sent} chunks: {e}",
                        e.kind()
                    ),
                );
                if !sender.finish(Err(Status::new(e.code(), e.to_string()))).await {
                    debug!(request_id, "Caller left before the error status");
                }
                Some(e)
            }
        };

        RequestReport {
            request_id,
            operation,
            transitions: tracker.transitions,
            bytes_received,
            bytes_sent,
            chunks_sent,
            elapsed_ms,
            error,
        }
    }

    async fn drive<F>(
        &self,
        receive: F,
        tracker: &mut Tracker,
        staged: &mut Staged,
        bytes_received: &mut u64,
        sender: &mut ChunkSender,
    ) -> Result<(), FileProcError>
    where
        F: Future<Output = Result<AssembledRequest, FileProcError>>,
    {
        let request = receive.await?;
        tracker.advance(RequestState::Received);
        *bytes_received = request.bytes;
        let AssembledRequest {
            job, input, scratch, ..
        } = request;
        let input_path = input.path().to_path_buf();
        staged.artifacts.push(input);
        let scratch = staged.scratch.insert(scratch);

        tracker.advance(RequestState::Executing);
        let output = self
            .executor
            .execute(scratch.store(), &job, &input_path)
            .await?;
        tracker.advance(RequestState::Executed);
        staged.artifacts.push(output);

        tracker.advance(RequestState::Sending);
        if let Some(output) = staged.artifacts.last() {
            stream_artifact(output, self.read_chunk_size, sender).await?;
        }
        Ok(())
    }
}

#[cfg(all(test, unix))]
mod tests {
    use super::RequestState::*;
    use super::*;
    use crate::assembler::RequestAssembler;
    use crate::proto::FileChunk;
    use crate::registry::{
        InvocationTemplate, Job, OperationRegistry, OutputRule, RegisteredOperation,
    };
    use crate::staging::StagingStore;
    use crate::transport::response_channel;
    use futures::{stream, StreamExt};
    use tempfile::TempDir;

    struct Fixture {
        dir: TempDir,
        store: StagingStore,
        lifecycle: RequestLifecycle,
    }

    async fn fixture(script: &str) -> Fixture {
        let dir = TempDir::new().unwrap();
        let store = StagingStore::open(dir.path()).await.unwrap();
        let mut registry = OperationRegistry::default();
        registry
            .register(
                Operation::CompressPdf,
                RegisteredOperation {
                    template: InvocationTemplate::new(
                        "sh",
                        ["-c", script, "sh", "{input}", "{output}"],
                    ),
                    output: OutputRule::suffix("_out.pdf"),
                },
            )
            .unwrap();
        let executor = JobExecutor::new(Arc::new(registry));
        let log = Arc::new(OperationLog::disabled());
        let lifecycle = RequestLifecycle::new(executor, log, 1024);
        Fixture {
            dir,
            store,
            lifecycle,
        }
    }

    impl Fixture {
        async fn compress(
            &self,
            request_id: u64,
            inbound: impl futures::Stream<Item = Result<FileChunk, Status>> + Unpin,
            sender: ChunkSender,
        ) -> RequestReport {
            let asm = RequestAssembler::new(self.store.clone());
            let receive = asm.receive_plain(Job::CompressPdf, inbound, None);
            self.lifecycle
                .run(request_id, Operation::CompressPdf, receive, sender)
                .await
        }

        fn left_behind(&self) -> Vec<std::ffi::OsString> {
            std::fs::read_dir(self.dir.path())
                .unwrap()
                .map(|e| e.unwrap().file_name())
                .collect()
        }
    }

    fn inbound(
        data: &[u8],
        chunk: usize,
    ) -> impl futures::Stream<Item = Result<FileChunk, Status>> + Unpin {
        let items: Vec<Result<FileChunk, Status>> = data
            .chunks(chunk)
            .map(|c| {
                Ok(FileChunk {
                    content: c.to_vec(),
                })
            })
            .collect();
        stream::iter(items)
    }

    #[tokio::test]
    async fn success_passes_every_state_and_cleans_up() {
        let fx = fixture("cp \"$1\" \"$2\"").await;
        let data: Vec<u8> = (0..5000u32).map(|i| (i % 199) as u8).collect();
        let (tx, rx) = response_channel(4);
        let collector = tokio::spawn(rx.collect::<Vec<_>>());

        let report = fx.compress(1, inbound(&data, 700), tx).await;

        assert!(report.succeeded(), "error: {:?}", report.error);
        assert_eq!(
            report.transitions,
            vec![Receiving, Received, Executing, Executed, Sending, Done, Cleanup]
        );
        assert_eq!(report.bytes_received, 5000);
        assert_eq!(report.bytes_sent, 5000);
        assert_eq!(report.chunks_sent, 5);

        let items = collector.await.unwrap();
        let joined: Vec<u8> = items.into_iter().flat_map(|i| i.unwrap().content).collect();
        assert_eq!(joined, data);
        assert_eq!(fx.store.live_artifacts(), 0);
        assert!(fx.left_behind().is_empty());
    }

    #[tokio::test]
    async fn collaborator_failure_sends_internal_and_no_chunks() {
        let fx = fixture("echo junk > \"$2\"; exit 1").await;
        let (tx, rx) = response_channel(4);
        let collector = tokio::spawn(rx.collect::<Vec<_>>());

        let report = fx.compress(2, inbound(b"%PDF", 2), tx).await;

        assert_eq!(
            report.transitions,
            vec![Receiving, Received, Executing, Failed, Cleanup]
        );
        assert!(matches!(
            report.error,
            Some(FileProcError::TransformationFailed { .. })
        ));
        let items = collector.await.unwrap();
        assert_eq!(items.len(), 1);
        let status = items.into_iter().next().unwrap().unwrap_err();
        assert_eq!(status.code(), tonic::Code::Internal);
        assert!(fx.left_behind().is_empty());
    }

    #[tokio::test]
    async fn numbered_by_products_are_removed_when_output_is_missing() {
        // Multi-frame inputs make ImageMagick write <out>-0, <out>-1, ... and
        // never <out> itself.
        let fx = fixture("echo a > \"$2-0\"; echo b > \"$2-1\"; exit 0").await;
        let (tx, rx) = response_channel(4);
        let collector = tokio::spawn(rx.collect::<Vec<_>>());

        let report = fx.compress(5, inbound(b"GIF89a", 3), tx).await;

        assert!(matches!(
            report.error,
            Some(FileProcError::TransformationFailed { .. })
        ));
        assert_eq!(report.chunks_sent, 0);
        let status = collector.await.unwrap().pop().unwrap().unwrap_err();
        assert_eq!(status.code(), tonic::Code::Internal);
        let left = fx.left_behind();
        assert!(left.is_empty(), "left behind: {left:?}");
        assert_eq!(fx.store.live_artifacts(), 0);
    }

    #[tokio::test]
    async fn by_products_beside_a_good_output_are_removed() {
        let fx = fixture("cp \"$1\" \"$2\"; echo trace > \"$2.log\"").await;
        let (tx, rx) = response_channel(4);
        let collector = tokio::spawn(rx.collect::<Vec<_>>());

        let report = fx.compress(6, inbound(b"%PDF-1.4", 4), tx).await;

        assert!(report.succeeded(), "error: {:?}", report.error);
        let joined: Vec<u8> = collector
            .await
            .unwrap()
            .into_iter()
            .flat_map(|i| i.unwrap().content)
            .collect();
        assert_eq!(joined, b"%PDF-1.4");
        let left = fx.left_behind();
        assert!(left.is_empty(), "left behind: {left:?}");
    }

    #[tokio::test]
    async fn receive_failure_is_cancelled_and_never_executes() {
        let fx = fixture("touch /should/not/run").await;
        let broken = stream::iter(vec![
            Ok(FileChunk {
                content: b"half".to_vec(),
            }),
            Err(Status::unknown("connection reset")),
        ]);
        let (tx, rx) = response_channel(4);
        let collector = tokio::spawn(rx.collect::<Vec<_>>());

        let report = fx.compress(3, broken, tx).await;

        assert_eq!(report.transitions, vec![Receiving, Failed, Cleanup]);
        let status = collector.await.unwrap().pop().unwrap().unwrap_err();
        assert_eq!(status.code(), tonic::Code::Cancelled);
        assert_eq!(fx.store.live_artifacts(), 0);
        assert!(fx.left_behind().is_empty());
    }

    #[tokio::test]
    async fn caller_disconnect_during_send_cleans_up() {
        let fx = fixture("cp \"$1\" \"$2\"").await;
        let (tx, rx) = response_channel(1);
        drop(rx);

        let report = fx.compress(4, inbound(&[1u8; 4096], 512), tx).await;

        assert!(matches!(
            report.error,
            Some(FileProcError::TransmissionFailure { .. })
        ));
        assert_eq!(report.transitions.last(), Some(&Cleanup));
        assert_eq!(fx.store.live_artifacts(), 0);
        assert!(fx.left_behind().is_empty());
    }
}
