//! Integration tests: a real tonic server on an ephemeral port, driven through
//! both the library client and the generated client.
//!
//! Most tests register `sh -c` scripts as collaborators so they run anywhere
//! with a POSIX shell. The ImageMagick scenarios at the bottom are skipped
//! unless `convert` is on PATH.
//!
//! Run with:
//!   cargo test --test service -- --nocapture

#![cfg(unix)]

use fileproc::proto::file_processor_service_client::FileProcessorServiceClient;
use fileproc::proto::{convert_image_request, ConvertImageRequest, FileChunk};
use fileproc::registry::{InvocationTemplate, OutputRule, RegisteredOperation};
use fileproc::transport::CONTENT_LENGTH_KEY;
use fileproc::{
    serve_listener, ClientConfig, FileProcError, FileProcessor, FileProcessorClient, Operation,
    OperationLog, OperationRegistry, ServerConfig, StagingStore,
};
use futures::stream;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use tempfile::TempDir;
use tokio::net::TcpListener;
use tokio::sync::oneshot;
use tokio::task::JoinHandle;
use tokio_test::{assert_err, assert_ok};
use tonic::{Code, Request, Response, Status, Streaming};

// ── Harness ──────────────────────────────────────────────────────────────────

const MIB: usize = 1024 * 1024;

struct Harness {
    staging: TempDir,
    work: TempDir,
    store: StagingStore,
    url: String,
    client: FileProcessorClient,
    shutdown: Option<oneshot::Sender<()>>,
    server: JoinHandle<Result<(), FileProcError>>,
}

impl Harness {
    async fn start(registry: OperationRegistry) -> Self {
        Self::start_with_log(registry, OperationLog::disabled()).await
    }

    async fn start_with_log(registry: OperationRegistry, log: OperationLog) -> Self {
        let staging = TempDir::new().unwrap();
        let work = TempDir::new().unwrap();
        let config = ServerConfig::builder()
            .staging_dir(staging.path())
            .build()
            .unwrap();
        let store = StagingStore::open(staging.path()).await.unwrap();
        let log = Arc::new(log);
        let service =
            FileProcessor::with_registry(&config, store.clone(), registry, Arc::clone(&log));

        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let url = format!("http://{}", listener.local_addr().unwrap());
        let (tx, rx) = oneshot::channel::<()>();
        let server = tokio::spawn(serve_listener(listener, service, log, async {
            let _ = rx.await;
        }));

        let config = ClientConfig::builder().chunk_size(MIB).build().unwrap();
        let client = FileProcessorClient::connect(url.clone(), config).await.unwrap();

        Self {
            staging,
            work,
            store,
            url,
            client,
            shutdown: Some(tx),
            server,
        }
    }

    fn path(&self, name: &str) -> PathBuf {
        self.work.path().join(name)
    }

    fn write(&self, name: &str, data: &[u8]) -> PathBuf {
        let p = self.path(name);
        std::fs::write(&p, data).unwrap();
        p
    }

    async fn raw(&self) -> FileProcessorServiceClient<tonic::transport::Channel> {
        FileProcessorServiceClient::connect(self.url.clone()).await.unwrap()
    }

    fn assert_staging_empty(&self) {
        let left: Vec<_> = std::fs::read_dir(self.staging.path())
            .unwrap()
            .map(|e| e.unwrap().file_name())
            .collect();
        assert!(left.is_empty(), "staging dir not empty: {left:?}");
        assert_eq!(self.store.live_artifacts(), 0);
    }
}

/// Registry where every operation runs `script` via `sh -c script sh <extra…>`.
fn scripted(script: &str) -> OperationRegistry {
    scripted_with(script, &["{input}", "{output}"])
}

fn scripted_with(script: &str, extra: &[&str]) -> OperationRegistry {
    let defaults = OperationRegistry::default();
    let mut reg = OperationRegistry::default();
    for op in Operation::ALL {
        let mut args = vec!["-c".to_string(), script.to_string(), "sh".to_string()];
        args.extend(extra.iter().map(|s| s.to_string()));
        reg.register(
            op,
            RegisteredOperation {
                template: InvocationTemplate::new("sh", args),
                output: OutputRule::suffix(defaults.get(op).output.suffix.clone()),
            },
        )
        .unwrap();
    }
    reg
}

fn pattern(len: usize) -> Vec<u8> {
    (0..len).map(|i| (i % 251) as u8).collect()
}

/// Drain a raw response, returning the chunk count and the final status.
async fn drain<T>(call: Result<Response<Streaming<T>>, Status>) -> (usize, Status) {
    let mut stream = match call {
        Ok(r) => r.into_inner(),
        Err(status) => return (0, status),
    };
    let mut chunks = 0;
    loop {
        match stream.message().await {
            Ok(Some(_)) => chunks += 1,
            Ok(None) => return (chunks, Status::ok("")),
            Err(status) => return (chunks, status),
        }
    }
}

/// Skip this test unless `program` runs.
macro_rules! skip_unless_program {
    ($program:expr) => {{
        let available = std::process::Command::new($program)
            .arg("-version")
            .stdout(std::process::Stdio::null())
            .stderr(std::process::Stdio::null())
            .status()
            .map(|s| s.success())
            .unwrap_or(false);
        if !available {
            println!("SKIP: {} not found on PATH", $program);
            return;
        }
    }};
}

// ── Scripted collaborators ──────────────────────────────────────────────────

#[tokio::test]
async fn compress_round_trips_a_multi_chunk_upload() {
    let mut h = Harness::start(scripted("cp \"$1\" \"$2\"")).await;
    let data = pattern(2 * MIB + MIB / 2);
    let input = h.write("big.pdf", &data);
    let output = h.path("big.out.pdf");

    let summary = assert_ok!(h.client.compress_pdf(&input, &output).await);
    assert_eq!(summary.chunks_sent, 3);
    assert_eq!(summary.bytes_sent, data.len() as u64);
    assert_eq!(summary.bytes_received, data.len() as u64);
    assert_eq!(summary.operation, "CompressPDF");
    assert_eq!(std::fs::read(&output).unwrap(), data);
    h.assert_staging_empty();
}

#[tokio::test]
async fn collaborator_failure_is_internal_with_no_chunks() {
    let h = Harness::start(scripted("echo partial > \"$2\"; exit 1")).await;
    let mut raw = h.raw().await;
    let chunks: Vec<FileChunk> = pattern(3000)
        .chunks(1000)
        .map(|c| FileChunk { content: c.to_vec() })
        .collect();

    let (received, status) = drain(raw.compress_pdf(stream::iter(chunks)).await).await;
    assert_eq!(received, 0);
    assert_eq!(status.code(), Code::Internal);
    assert!(status.message().contains("CompressPDF"), "got: {}", status.message());
    h.assert_staging_empty();
}

#[tokio::test]
async fn numbered_by_products_do_not_outlive_the_request() {
    let h = Harness::start(scripted("echo a > \"$2-0\"; echo b > \"$2-1\"; exit 0")).await;
    let mut raw = h.raw().await;
    let chunks = vec![FileChunk {
        content: b"%PDF-1.4".to_vec(),
    }];

    let (received, status) = drain(raw.compress_pdf(stream::iter(chunks)).await).await;
    assert_eq!(received, 0);
    assert_eq!(status.code(), Code::Internal);
    h.assert_staging_empty();
}

#[tokio::test]
async fn upload_short_of_declared_length_is_cancelled() {
    let h = Harness::start(scripted("cp \"$1\" \"$2\"")).await;
    let mut raw = h.raw().await;
    let mut request = Request::new(stream::iter(vec![FileChunk {
        content: b"half".to_vec(),
    }]));
    request
        .metadata_mut()
        .insert(CONTENT_LENGTH_KEY, 10u64.into());

    let (received, status) = drain(raw.compress_pdf(request).await).await;
    assert_eq!(received, 0);
    assert_eq!(status.code(), Code::Cancelled);
    assert!(status.message().contains("4 of 10"), "got: {}", status.message());
    h.assert_staging_empty();
}

#[tokio::test]
async fn unparsable_declared_length_is_invalid_argument() {
    let h = Harness::start(scripted("cp \"$1\" \"$2\"")).await;
    let mut raw = h.raw().await;
    let mut request = Request::new(stream::iter(vec![FileChunk {
        content: b"%PDF".to_vec(),
    }]));
    request
        .metadata_mut()
        .insert(CONTENT_LENGTH_KEY, "four".parse().unwrap());

    let (received, status) = drain(raw.compress_pdf(request).await).await;
    assert_eq!(received, 0);
    assert_eq!(status.code(), Code::InvalidArgument);
    h.assert_staging_empty();
}

#[tokio::test]
async fn failed_call_leaves_no_local_output() {
    let mut h = Harness::start(scripted("exit 2")).await;
    let input = h.write("doc.pdf", b"%PDF-1.4");
    let output = h.path("doc.txt");

    let err = assert_err!(h.client.convert_to_txt(&input, &output).await);
    assert_eq!(err.code(), Code::Internal);
    assert!(!output.exists());
    assert!(!fileproc::client::part_path(&output).exists());
    h.assert_staging_empty();
}

#[tokio::test]
async fn content_before_format_is_invalid_argument() {
    let h = Harness::start(scripted("cp \"$1\" \"$2\"")).await;
    let mut raw = h.raw().await;
    let messages = vec![
        ConvertImageRequest {
            data: Some(convert_image_request::Data::Content(b"\x89PNG".to_vec())),
        },
        ConvertImageRequest {
            data: Some(convert_image_request::Data::OutputFormat("jpg".into())),
        },
    ];

    let (received, status) = drain(raw.convert_image_format(stream::iter(messages)).await).await;
    assert_eq!(received, 0);
    assert_eq!(status.code(), Code::InvalidArgument);
    h.assert_staging_empty();
}

#[tokio::test]
async fn bad_format_and_dimensions_are_rejected() {
    let mut h = Harness::start(scripted("cp \"$1\" \"$2\"")).await;
    let input = h.write("img.png", b"not really a png");

    let err = assert_err!(
        h.client
            .convert_image_format(&input, &h.path("x.out"), "../png")
            .await
    );
    assert_eq!(err.code(), Code::InvalidArgument);

    let err = assert_err!(h.client.resize_image(&input, &h.path("y.out"), 0, 100).await);
    assert_eq!(err.code(), Code::InvalidArgument);
    h.assert_staging_empty();
}

#[tokio::test]
async fn output_path_follows_the_target_format() {
    // The collaborator writes its own output path into the output file.
    let mut h = Harness::start(scripted("printf '%s' \"$2\" > \"$2\"")).await;
    let input = h.write("photo.jpg", b"jpeg bytes");
    let output = h.path("photo.png");

    assert_ok!(h.client.convert_image_format(&input, &output, "PNG").await);
    let server_output = std::fs::read_to_string(&output).unwrap();
    let name = Path::new(&server_output).file_name().unwrap().to_string_lossy().to_string();
    assert!(name.starts_with("input_convert_"), "got: {name}");
    assert!(name.ends_with("_out.png"), "got: {name}");
    h.assert_staging_empty();
}

#[tokio::test]
async fn resize_geometry_reaches_the_collaborator() {
    let mut h = Harness::start(scripted_with(
        "printf '%s' \"$1\" > \"$2\"",
        &["{width}x{height}!", "{output}"],
    ))
    .await;
    let input = h.write("photo.png", b"png bytes");
    let output = h.path("thumb.png");

    assert_ok!(h.client.resize_image(&input, &output, 100, 100).await);
    assert_eq!(std::fs::read_to_string(&output).unwrap(), "100x100!");
    h.assert_staging_empty();
}

#[tokio::test]
async fn identical_requests_give_identical_results() {
    let mut h = Harness::start(scripted("tr 'a-z' 'A-Z' < \"$1\" > \"$2\"")).await;
    let input = h.write("notes.pdf", b"the quick brown fox");

    let first = h.path("first.txt");
    let second = h.path("second.txt");
    assert_ok!(h.client.convert_to_txt(&input, &first).await);
    assert_ok!(h.client.convert_to_txt(&input, &second).await);
    assert_eq!(std::fs::read(&first).unwrap(), b"THE QUICK BROWN FOX");
    assert_eq!(std::fs::read(&first).unwrap(), std::fs::read(&second).unwrap());
    h.assert_staging_empty();
}

#[tokio::test]
async fn concurrent_requests_stay_isolated() {
    let h = Harness::start(scripted("sleep 0.1; cp \"$1\" \"$2\"")).await;
    let tasks: Vec<_> = (0..8u8)
        .map(|i| {
            let mut client = h.client.clone();
            let input = h.write(&format!("in{i}.pdf"), &vec![i; 10_000 + i as usize]);
            let output = h.path(&format!("out{i}.pdf"));
            tokio::spawn(async move {
                client.compress_pdf(&input, &output).await.unwrap();
                (i, std::fs::read(&output).unwrap())
            })
        })
        .collect();

    for task in tasks {
        let (i, bytes) = task.await.unwrap();
        assert_eq!(bytes, vec![i; 10_000 + i as usize]);
    }
    h.assert_staging_empty();
}

#[tokio::test]
async fn empty_upload_is_processed() {
    let mut h = Harness::start(scripted("cp \"$1\" \"$2\"")).await;
    let input = h.write("empty.pdf", b"");
    let output = h.path("empty.out.pdf");

    let summary = assert_ok!(h.client.compress_pdf(&input, &output).await);
    assert_eq!(summary.chunks_sent, 0);
    assert_eq!(summary.chunks_received, 0);
    assert_eq!(std::fs::read(&output).unwrap(), b"");
    h.assert_staging_empty();
}

#[tokio::test]
async fn operation_log_records_each_request() {
    let log_dir = TempDir::new().unwrap();
    let log_path = log_dir.path().join("server.log");
    let log = OperationLog::to_file(&log_path).unwrap();
    let mut h = Harness::start_with_log(scripted("cp \"$1\" \"$2\""), log).await;
    let input = h.write("a.pdf", b"abc");

    assert_ok!(h.client.compress_pdf(&input, &h.path("a.out.pdf")).await);

    let content = std::fs::read_to_string(&log_path).unwrap();
    assert!(content.contains("[CompressPDF] [INFO]"), "log: {content}");
    assert!(content.contains("[CompressPDF] [SUCCESS]"), "log: {content}");
}

#[tokio::test]
async fn server_shuts_down_on_signal() {
    let mut h = Harness::start(scripted("cp \"$1\" \"$2\"")).await;
    drop(h.client);
    if let Some(tx) = h.shutdown.take() {
        tx.send(()).unwrap();
    }
    let result = h.server.await.unwrap();
    assert!(result.is_ok(), "server error: {result:?}");
}

// ── ImageMagick ──────────────────────────────────────────────────────────────

#[tokio::test]
async fn imagemagick_resize_to_exact_dimensions() {
    skip_unless_program!("convert");
    let mut h = Harness::start(OperationRegistry::default()).await;
    let input = h.path("wide.png");
    image::RgbImage::from_fn(300, 200, |x, y| image::Rgb([x as u8, y as u8, 128]))
        .save(&input)
        .unwrap();
    let output = h.path("thumb.png");

    assert_ok!(h.client.resize_image(&input, &output, 100, 100).await);
    let resized = image::load_from_memory(&std::fs::read(&output).unwrap()).unwrap();
    assert_eq!((resized.width(), resized.height()), (100, 100));
    h.assert_staging_empty();
}

#[tokio::test]
async fn imagemagick_jpeg_to_png() {
    skip_unless_program!("convert");
    let mut h = Harness::start(OperationRegistry::default()).await;
    let input = h.path("photo.jpg");
    image::RgbImage::from_fn(64, 48, |x, y| image::Rgb([(x * 4) as u8, (y * 5) as u8, 0]))
        .save(&input)
        .unwrap();
    let output = h.path("photo.png");

    assert_ok!(h.client.convert_image_format(&input, &output, "png").await);
    let bytes = std::fs::read(&output).unwrap();
    assert_eq!(image::guess_format(&bytes).unwrap(), image::ImageFormat::Png);
    let decoded = image::load_from_memory(&bytes).unwrap();
    assert_eq!((decoded.width(), decoded.height()), (64, 48));
    h.assert_staging_empty();
}
