//! The submission record and its compile → grade → score state machine
//!
//! Every transition is a method returning whether the record changed. An
//! event that does not fit the current state leaves the record untouched,
//! which makes duplicated or late queue deliveries harmless.

use serde::{Deserialize, Serialize};

use crate::task::GradingResult;

pub type SubmissionId = i64;

/// What a caller provides to open a submission
#[derive(Serialize, Deserialize, Debug, Clone, PartialEq, Eq)]
#[serde(rename_all = "camelCase")]
pub struct NewSubmission {
    pub language: String,
    pub source: String,
    pub problem_id: u32,
    pub domain_id: String,
    pub user_id: u32,
    pub contest_id: Option<u32>,
    pub team_id: Option<u32>,
}

#[derive(Serialize, Deserialize, Debug, Clone, PartialEq, Eq)]
#[serde(rename_all = "camelCase")]
pub struct Submission {
    pub id: SubmissionId,
    pub language: String,
    pub source: String,
    pub problem_id: u32,
    pub domain_id: String,
    pub user_id: u32,
    pub contest_id: Option<u32>,
    pub team_id: Option<u32>,
    pub created_at: String,
    #[serde(flatten)]
    pub state: SubmissionState,
}

#[derive(Serialize, Deserialize, Debug, Clone, PartialEq, Eq)]
#[serde(tag = "status", rename_all_fields = "camelCase")]
pub enum SubmissionState {
    Compiling,
    Grading {
        graded_cases: usize,
        testcases: Vec<TestcaseProgress>,
    },
    Graded {
        score: u32,
        testcases: Vec<GradedTestcase>,
    },
    CompileFailed {
        log: Option<String>,
    },
    Terminated {
        log: Option<String>,
    },
}

impl SubmissionState {
    pub fn name(&self) -> &'static str {
        match self {
            Self::Compiling => "Compiling",
            Self::Grading { .. } => "Grading",
            Self::Graded { .. } => "Graded",
            Self::CompileFailed { .. } => "CompileFailed",
            Self::Terminated { .. } => "Terminated",
        }
    }

    pub fn is_terminal(&self) -> bool {
        match self {
            Self::Compiling | Self::Grading { .. } => false,
            Self::Graded { .. } | Self::CompileFailed { .. } | Self::Terminated { .. } => true,
        }
    }
}

#[derive(Serialize, Deserialize, Debug, Clone, PartialEq, Eq)]
pub struct TestcaseProgress {
    pub points: u32,
    pub score: Option<u32>,
    pub result: Option<GradingResult>,
}

#[derive(Serialize, Deserialize, Debug, Clone, PartialEq, Eq)]
pub struct GradedTestcase {
    pub points: u32,
    pub score: u32,
    pub result: GradingResult,
}

impl Submission {
    pub fn new(id: SubmissionId, new: NewSubmission, created_at: String) -> Self {
        Self {
            id,
            language: new.language,
            source: new.source,
            problem_id: new.problem_id,
            domain_id: new.domain_id,
            user_id: new.user_id,
            contest_id: new.contest_id,
            team_id: new.team_id,
            created_at,
            state: SubmissionState::Compiling,
        }
    }

    pub fn is_terminal(&self) -> bool {
        self.state.is_terminal()
    }

    /// `Compiling` → `CompileFailed`
    pub fn compile_failed(&mut self, log: String) -> bool {
        if self.state != SubmissionState::Compiling {
            return false;
        }
        self.state = SubmissionState::CompileFailed { log: Some(log) };
        true
    }

    /// `Compiling` → `Grading`, or `Terminated` when there is nothing to grade
    pub fn start_grading(&mut self, points: &[u32]) -> bool {
        if self.state != SubmissionState::Compiling {
            return false;
        }
        if points.is_empty() {
            self.state = SubmissionState::Terminated {
                log: Some("problem has no testcases".to_string()),
            };
            return true;
        }

        self.state = SubmissionState::Grading {
            graded_cases: 0,
            testcases: points
                .iter()
                .map(|&points| TestcaseProgress {
                    points,
                    score: None,
                    result: None,
                })
                .collect(),
        };
        true
    }

    /// Records the verdict of testcase `index`, finishing the submission on the last one
    ///
    /// Unknown indices and already graded testcases are ignored.
    pub fn record_verdict(&mut self, index: usize, result: GradingResult) -> bool {
        let SubmissionState::Grading {
            graded_cases,
            testcases,
        } = &mut self.state
        else {
            return false;
        };
        let Some(testcase) = testcases.get_mut(index) else {
            return false;
        };
        if testcase.result.is_some() {
            return false;
        }

        testcase.score = Some(if result.is_accepted() {
            testcase.points
        } else {
            0
        });
        testcase.result = Some(result);
        *graded_cases += 1;

        if *graded_cases == testcases.len() {
            let graded: Vec<GradedTestcase> = testcases
                .drain(..)
                .filter_map(|t| {
                    Some(GradedTestcase {
                        points: t.points,
                        score: t.score?,
                        result: t.result?,
                    })
                })
                .collect();
            let score = graded.iter().map(|t| t.score).sum();
            self.state = SubmissionState::Graded {
                score,
                testcases: graded,
            };
        }
        true
    }

    /// Any in-flight state → `Terminated`
    pub fn terminate(&mut self, log: String) -> bool {
        if self.is_terminal() {
            return false;
        }
        self.state = SubmissionState::Terminated { log: Some(log) };
        true
    }

    /// Terminal state → `Compiling`, discarding the previous outcome
    pub fn rejudge(&mut self) -> bool {
        if !self.is_terminal() {
            return false;
        }
        self.state = SubmissionState::Compiling;
        true
    }

    /// In-flight state → `Compiling`, discarding partial grading progress
    pub fn restart(&mut self) -> bool {
        if self.is_terminal() {
            return false;
        }
        self.state = SubmissionState::Compiling;
        true
    }
}
