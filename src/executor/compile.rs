use std::path::Path;

use tokio::fs;

use crate::sandbox::{RunRequest, SandboxResult, SlotId};
use crate::task::{CompilingResult, CompilingTask};

use super::{Executor, ExecutorError, apply_template, binary_key};

/// File inside the slot that receives the compiler's diagnostics
const COMPILE_LOG: &str = "compile.log";

impl Executor {
    /// Compiles the submitted source and uploads the binary on success
    ///
    /// Every unsuccessful compiler run is reported as `Failed` with the
    /// captured diagnostics, whatever the reason it stopped.
    pub async fn compile(
        &self,
        task: &CompilingTask,
        slot: SlotId,
        work_dir: &Path,
    ) -> Result<CompilingResult, ExecutorError> {
        let language = self.language(&task.language)?;

        fs::write(
            work_dir.join(&language.src_file),
            format!("{}\n", task.source),
        )
        .await?;

        let request = RunRequest {
            command: apply_template(&language.compile_command, language),
            constraints: task.constraints,
            stdin: None,
            stdout: None,
            stderr: Some(COMPILE_LOG.to_string()),
            env: language.env.clone(),
        };
        let result = self.isolation.run(slot, request).await;
        log::debug!(
            "Compilation of submission {} on slot {slot}: {result:?}",
            task.submission_id
        );

        let reason = match result {
            SandboxResult::Succeeded { .. } => {
                self.storage
                    .upload(
                        &work_dir.join(&language.binary_file),
                        &binary_key(task.submission_id),
                    )
                    .await?;
                return Ok(CompilingResult::Succeeded);
            }
            SandboxResult::MemoryExceeded { memory } => {
                format!("compiler exceeded the memory limit ({memory} KB)")
            }
            SandboxResult::TimeExceeded { time, .. } => {
                format!("compiler exceeded the time limit ({time} ms)")
            }
            SandboxResult::RuntimeError { message } => message,
            SandboxResult::SystemError { message } => message,
        };

        let log = fs::read_to_string(work_dir.join(COMPILE_LOG))
            .await
            .unwrap_or_default();
        let log = if log.trim().is_empty() { reason } else { log };
        Ok(CompilingResult::Failed { log })
    }
}
