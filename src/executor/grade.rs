use std::io::ErrorKind;
use std::os::unix::fs::PermissionsExt;
use std::path::Path;

use tokio::fs;

use crate::sandbox::{RunRequest, SandboxResult, SlotId};
use crate::storage::hash_file;
use crate::task::{GradingResult, GradingTask};

use super::{Executor, ExecutorError, apply_template, binary_key};

const INPUT_FILE: &str = "input.txt";
const OUTPUT_FILE: &str = "output.txt";
const BINARY_PERMISSIONS: u32 = 0o755;

/// sha256 of the empty string, for programs that never opened stdout
const EMPTY_HASH: &str = "e3b0c44298fc1c149afbf4c8996fb92427ae41e4649b934ca495991b7852b855";

impl Executor {
    /// Runs the compiled binary on one testcase and judges its output
    ///
    /// Outputs are compared by content hash against the digest recorded in
    /// storage for the expected output.
    pub async fn grade(
        &self,
        task: &GradingTask,
        slot: SlotId,
        work_dir: &Path,
    ) -> Result<GradingResult, ExecutorError> {
        let language = self.language(&task.language)?;

        let binary_path = work_dir.join(&language.binary_file);
        self.storage
            .download(&binary_key(task.submission_id), &binary_path)
            .await?;
        fs::set_permissions(
            &binary_path,
            std::fs::Permissions::from_mode(BINARY_PERMISSIONS),
        )
        .await?;
        self.storage
            .download(&task.testcase.input_ref, &work_dir.join(INPUT_FILE))
            .await?;
        let expected_hash = self.storage.get_hash(&task.testcase.output_ref).await?;

        let request = RunRequest {
            command: apply_template(&language.execute_command, language),
            constraints: task.constraints,
            stdin: Some(INPUT_FILE.to_string()),
            stdout: Some(OUTPUT_FILE.to_string()),
            stderr: None,
            env: language.env.clone(),
        };
        let result = self.isolation.run(slot, request).await;

        let verdict = match result {
            SandboxResult::Succeeded {
                time,
                wall_time,
                memory,
            } => {
                let actual_hash = match hash_file(&work_dir.join(OUTPUT_FILE)).await {
                    Ok(hash) => hash,
                    Err(e) if e.kind() == ErrorKind::NotFound => EMPTY_HASH.to_string(),
                    Err(e) => return Err(e.into()),
                };
                if actual_hash == expected_hash {
                    GradingResult::Accepted {
                        time,
                        wall_time,
                        memory,
                    }
                } else {
                    GradingResult::WrongAnswer {
                        time,
                        wall_time,
                        memory,
                    }
                }
            }
            SandboxResult::MemoryExceeded { memory } => GradingResult::MemoryExceeded { memory },
            SandboxResult::TimeExceeded { time, wall_time } => {
                GradingResult::TimeExceeded { time, wall_time }
            }
            SandboxResult::RuntimeError { message } => GradingResult::RuntimeError { message },
            SandboxResult::SystemError { message } => GradingResult::SystemError { message },
        };

        log::debug!(
            "Testcase {} of submission {} on slot {slot}: {verdict:?}",
            task.testcase_index,
            task.submission_id
        );
        Ok(verdict)
    }
}
