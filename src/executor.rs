mod compile;
mod grade;

use std::collections::HashMap;
use std::path::Path;
use std::sync::Arc;

use crate::config::LanguageConfig;
use crate::sandbox::{Isolation, SandboxError, SlotId};
use crate::storage::{Storage, StorageError};
use crate::submission::SubmissionId;
use crate::task::{Task, TaskResult};

#[derive(thiserror::Error, Debug)]
pub enum ExecutorError {
    #[error("unknown language {0}")]
    UnknownLanguage(String),
    #[error(transparent)]
    Storage(#[from] StorageError),
    #[error(transparent)]
    Sandbox(#[from] SandboxError),
    #[error(transparent)]
    Io(#[from] std::io::Error),
}

/// Language table indexed by name
#[derive(Default)]
pub struct Languages {
    by_name: HashMap<String, LanguageConfig>,
}

impl Languages {
    pub fn new(languages: impl IntoIterator<Item = LanguageConfig>) -> Self {
        Self {
            by_name: languages
                .into_iter()
                .map(|l| (l.name.clone(), l))
                .collect(),
        }
    }

    pub fn get(&self, name: &str) -> Option<&LanguageConfig> {
        self.by_name.get(name)
    }
}

/// Runs compile and grade tasks inside an already initialized slot
pub struct Executor {
    isolation: Arc<dyn Isolation>,
    storage: Arc<dyn Storage>,
    languages: Arc<Languages>,
}

impl Executor {
    pub fn new(
        isolation: Arc<dyn Isolation>,
        storage: Arc<dyn Storage>,
        languages: Arc<Languages>,
    ) -> Self {
        Self {
            isolation,
            storage,
            languages,
        }
    }

    pub fn isolation(&self) -> &Arc<dyn Isolation> {
        &self.isolation
    }

    fn language(&self, name: &str) -> Result<&LanguageConfig, ExecutorError> {
        self.languages
            .get(name)
            .ok_or_else(|| ExecutorError::UnknownLanguage(name.to_string()))
    }

    /// Dispatches on the task kind and wraps the outcome as a result message
    pub async fn execute(
        &self,
        task: &Task,
        slot: SlotId,
        work_dir: &Path,
    ) -> Result<TaskResult, ExecutorError> {
        match task {
            Task::Compiling(task) => Ok(TaskResult::Compiling {
                submission_id: task.submission_id,
                result: self.compile(task, slot, work_dir).await?,
            }),
            Task::Grading(task) => Ok(TaskResult::Grading {
                submission_id: task.submission_id,
                testcase_index: task.testcase_index,
                result: self.grade(task, slot, work_dir).await?,
            }),
        }
    }
}

/// Storage key of the binary compiled for a submission
pub fn binary_key(submission_id: SubmissionId) -> String {
    format!("binaries/{submission_id}")
}

/// Substitutes the slot-local file names into a language command template
fn apply_template(template: &str, language: &LanguageConfig) -> String {
    template
        .replace("{src_path}", &language.src_file)
        .replace("{binary_path}", &language.binary_file)
}
