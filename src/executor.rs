//! Job executor: runs the collaborator program for one assembled request.
//!
//! The invocation is rendered by the [`OperationRegistry`] and spawned
//! directly with its argument vector; no shell is involved. Only the exit
//! status is inspected. Collaborator stdio is discarded.
//!
//! The output path is reserved as a [`StagedArtifact`] *before* the program
//! starts, so whatever the collaborator writes is removed on every exit path,
//! including a non-zero exit that left a partial file behind.

use crate::error::FileProcError;
use crate::registry::{Invocation, Job, OperationRegistry};
use crate::staging::{StagedArtifact, StagingStore};
use std::path::Path;
use std::process::{ExitStatus, Stdio};
use std::sync::Arc;
use std::time::Instant;
use tokio::process::Command;
use tracing::{debug, warn};

/// Spawns collaborators and verifies their output.
#[derive(Debug, Clone)]
pub struct JobExecutor {
    registry: Arc<OperationRegistry>,
}

impl JobExecutor {
    pub fn new(registry: Arc<OperationRegistry>) -> Self {
        Self { registry }
    }

    pub fn registry(&self) -> &OperationRegistry {
        &self.registry
    }

    /// Run `job` against the staged `input` and return the output artifact.
    ///
    /// Fails with [`FileProcError::TransformationFailed`] when the program
    /// cannot be started, exits non-zero, or exits zero without producing
    /// its output file.
    pub async fn execute(
        &self,
        store: &StagingStore,
        job: &Job,
        input: &Path,
    ) -> Result<StagedArtifact, FileProcError> {
        let invocation = self.registry.invocation(job, input);
        let output = store.reserve(invocation.output_path.clone())?;

        if let Err(e) = run(&invocation).await {
            discard(output).await;
            return Err(e);
        }
        if !output.exists().await {
            discard(output).await;
            return Err(FileProcError::TransformationFailed {
                operation: invocation.operation.to_string(),
                detail: format!(
                    "{} exited successfully but produced no output",
                    invocation.program.to_string_lossy()
                ),
            });
        }
        Ok(output)
    }
}

async fn run(invocation: &Invocation) -> Result<(), FileProcError> {
    let program = invocation.program.to_string_lossy().to_string();
    debug!("Executing {} {:?}", program, invocation.args);
    let start = Instant::now();

    let status = Command::new(&invocation.program)
        .args(&invocation.args)
        .stdin(Stdio::null())
        .stdout(Stdio::null())
        .stderr(Stdio::null())
        .kill_on_drop(true)
        .status()
        .await
        .map_err(|e| FileProcError::TransformationFailed {
            operation: invocation.operation.to_string(),
            detail: format!("failed to start {program}: {e}"),
        })?;

    debug!(
        "{} finished with {} in {} ms",
        program,
        describe(&status),
        start.elapsed().as_millis()
    );

    if status.success() {
        Ok(())
    } else {
        Err(FileProcError::TransformationFailed {
            operation: invocation.operation.to_string(),
            detail: format!("{program} failed with {}", describe(&status)),
        })
    }
}

fn describe(status: &ExitStatus) -> String {
    match status.code() {
        Some(code) => format!("exit code {code}"),
        None => "no exit code (terminated by signal)".to_string(),
    }
}

async fn discard(artifact: StagedArtifact) {
    if let Err(e) = artifact.delete().await {
        warn!("Failed to remove collaborator output: {}", e);
    }
}
