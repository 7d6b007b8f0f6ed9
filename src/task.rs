//! Messages carried on the task queue and reported back by executors

use serde::{Deserialize, Serialize};

use crate::sandbox::Constraints;
use crate::submission::SubmissionId;

#[derive(Serialize, Deserialize, Debug, Clone, PartialEq, Eq)]
#[serde(tag = "type")]
pub enum Task {
    Compiling(CompilingTask),
    Grading(GradingTask),
}

impl Task {
    pub fn submission_id(&self) -> SubmissionId {
        match self {
            Self::Compiling(task) => task.submission_id,
            Self::Grading(task) => task.submission_id,
        }
    }

    pub fn kind(&self) -> &'static str {
        match self {
            Self::Compiling(_) => "compile",
            Self::Grading(_) => "grade",
        }
    }
}

#[derive(Serialize, Deserialize, Debug, Clone, PartialEq, Eq)]
#[serde(rename_all = "camelCase")]
pub struct CompilingTask {
    pub submission_id: SubmissionId,
    pub language: String,
    pub constraints: Constraints,
    pub source: String,
}

#[derive(Serialize, Deserialize, Debug, Clone, PartialEq, Eq)]
#[serde(rename_all = "camelCase")]
pub struct GradingTask {
    pub submission_id: SubmissionId,
    pub language: String,
    pub constraints: Constraints,
    pub testcase_index: usize,
    pub testcase: TestcaseRef,
}

/// Storage keys of a testcase's input and expected output
#[derive(Serialize, Deserialize, Debug, Clone, PartialEq, Eq)]
#[serde(rename_all = "camelCase")]
pub struct TestcaseRef {
    pub input_ref: String,
    pub output_ref: String,
}

#[derive(Serialize, Deserialize, Debug, Clone, PartialEq, Eq)]
#[serde(tag = "status")]
pub enum CompilingResult {
    Succeeded,
    Failed { log: String },
}

/// Verdict of one testcase
///
/// Besides the two output comparisons, every failing sandbox outcome is a
/// verdict of its own.
#[derive(Serialize, Deserialize, Debug, Clone, PartialEq, Eq)]
#[serde(tag = "status", rename_all_fields = "camelCase")]
pub enum GradingResult {
    Accepted {
        time: u64,
        wall_time: u64,
        memory: u64,
    },
    WrongAnswer {
        time: u64,
        wall_time: u64,
        memory: u64,
    },
    MemoryExceeded {
        memory: u64,
    },
    TimeExceeded {
        time: u64,
        wall_time: u64,
    },
    RuntimeError {
        message: String,
    },
    SystemError {
        message: String,
    },
}

impl GradingResult {
    pub fn is_accepted(&self) -> bool {
        matches!(self, Self::Accepted { .. })
    }
}

/// Result message published once a task has finished
#[derive(Serialize, Deserialize, Debug, Clone, PartialEq, Eq)]
#[serde(tag = "type", rename_all_fields = "camelCase")]
pub enum TaskResult {
    Compiling {
        submission_id: SubmissionId,
        result: CompilingResult,
    },
    Grading {
        submission_id: SubmissionId,
        testcase_index: usize,
        result: GradingResult,
    },
}
