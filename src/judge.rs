use std::sync::Arc;

use anyhow::{Context, anyhow};
use tokio::sync::broadcast;

use crate::database::{StoreError, SubmissionStore, Transition};
use crate::executor::Languages;
use crate::problem::ProblemProvider;
use crate::queue::TaskQueue;
use crate::submission::{NewSubmission, Submission, SubmissionId, SubmissionState};
use crate::task::{CompilingResult, CompilingTask, GradingTask, Task, TaskResult, TestcaseRef};

const FINISHED_CHANNEL_CAPACITY: usize = 64;

/// Drives submissions through compile → grade → score
///
/// Results may arrive in any order and more than once; every update goes
/// through [`SubmissionStore::apply_transition`], and events that do not fit
/// the stored state are dropped.
pub struct Judge {
    store: Arc<dyn SubmissionStore>,
    problems: Arc<dyn ProblemProvider>,
    languages: Arc<Languages>,
    queue: Arc<TaskQueue>,
    finished: broadcast::Sender<Submission>,
}

impl Judge {
    pub fn new(
        store: Arc<dyn SubmissionStore>,
        problems: Arc<dyn ProblemProvider>,
        languages: Arc<Languages>,
        queue: Arc<TaskQueue>,
    ) -> Self {
        let (finished, _) = broadcast::channel(FINISHED_CHANNEL_CAPACITY);
        Self {
            store,
            problems,
            languages,
            queue,
            finished,
        }
    }

    /// Receives every submission that reaches a terminal state from now on
    pub fn subscribe(&self) -> broadcast::Receiver<Submission> {
        self.finished.subscribe()
    }

    pub async fn read(&self, id: SubmissionId) -> Result<Submission, StoreError> {
        self.store.read(id).await
    }

    /// Opens a submission and queues its compilation
    pub async fn submit(&self, new: NewSubmission) -> anyhow::Result<Submission> {
        if self.languages.get(&new.language).is_none() {
            return Err(anyhow!("unknown language {}", new.language));
        }

        let submission = self.store.create(new).await?;
        self.enqueue_compile(&submission).await?;
        log::info!(
            "Submission {} for problem {} queued for compilation",
            submission.id,
            submission.problem_id
        );
        Ok(submission)
    }

    /// Puts a finished submission back through the whole pipeline
    ///
    /// Returns `false` when the submission is still being judged.
    pub async fn rejudge(&self, id: SubmissionId) -> anyhow::Result<bool> {
        let applied = self
            .store
            .apply_transition(id, Box::new(|s| s.rejudge()))
            .await?;
        if applied.changed {
            self.enqueue_compile(&applied.submission).await?;
            log::info!("Submission {id} queued for rejudge");
        }
        Ok(applied.changed)
    }

    /// Requeues every submission a previous process left unfinished
    pub async fn recover(&self) -> anyhow::Result<usize> {
        let unfinished = self.store.list_unfinished().await?;
        let mut recovered = 0;

        for submission in unfinished {
            let applied = self
                .store
                .apply_transition(submission.id, Box::new(|s| s.restart()))
                .await?;
            if applied.changed {
                self.enqueue_compile(&applied.submission).await?;
                recovered += 1;
            }
        }

        if recovered > 0 {
            log::warn!("Requeued {recovered} unfinished submissions");
        }
        Ok(recovered)
    }

    /// Forces an unfinished submission into `Terminated`
    pub async fn abandon(&self, id: SubmissionId, reason: String) -> Result<bool, StoreError> {
        log::warn!("Terminating submission {id}: {reason}");
        self.transition(id, Box::new(move |s| s.terminate(reason)))
            .await
    }

    /// Applies one result message to its submission
    pub async fn handle_result(&self, result: TaskResult) -> Result<(), StoreError> {
        match result {
            TaskResult::Compiling {
                submission_id,
                result: CompilingResult::Failed { log },
            } => {
                if !self
                    .transition(submission_id, Box::new(move |s| s.compile_failed(log)))
                    .await?
                {
                    log::debug!("Ignored compile failure for submission {submission_id}");
                }
            }
            TaskResult::Compiling {
                submission_id,
                result: CompilingResult::Succeeded,
            } => {
                if let Err(e) = self.start_grading(submission_id).await {
                    log::error!("Failed to start grading submission {submission_id}: {e:#}");
                    self.abandon(submission_id, format!("{e:#}")).await?;
                }
            }
            TaskResult::Grading {
                submission_id,
                testcase_index,
                result,
            } => {
                if !self
                    .transition(
                        submission_id,
                        Box::new(move |s| s.record_verdict(testcase_index, result)),
                    )
                    .await?
                {
                    log::debug!(
                        "Ignored verdict for testcase {testcase_index} of submission {submission_id}"
                    );
                }
            }
        }
        Ok(())
    }

    /// `Compiling` → `Grading`, fanning out one grade task per testcase
    async fn start_grading(&self, id: SubmissionId) -> anyhow::Result<()> {
        let submission = self.store.read(id).await?;
        if submission.state != SubmissionState::Compiling {
            log::debug!("Submission {id} is no longer compiling, skipping fan-out");
            return Ok(());
        }

        let problem = self
            .problems
            .fetch_problem(submission.problem_id, &submission.domain_id)
            .await?;
        let language = self
            .languages
            .get(&submission.language)
            .ok_or_else(|| anyhow!("unknown language {}", submission.language))?;

        let points: Vec<u32> = problem.testcases.iter().map(|t| t.points).collect();
        let changed = self
            .transition(id, Box::new(move |s| s.start_grading(&points)))
            .await?;
        // A duplicate compile result lost the race and must not fan out again
        if !changed || problem.testcases.is_empty() {
            return Ok(());
        }

        let constraints = language.run_constraints.overridden_by(&problem.constraints);
        let count = problem.testcases.len();
        for (testcase_index, testcase) in problem.testcases.into_iter().enumerate() {
            self.queue
                .push(Task::Grading(GradingTask {
                    submission_id: id,
                    language: submission.language.clone(),
                    constraints,
                    testcase_index,
                    testcase: TestcaseRef {
                        input_ref: testcase.input,
                        output_ref: testcase.output,
                    },
                }))
                .await;
        }

        log::info!("Submission {id} compiled, grading {count} testcases");
        Ok(())
    }

    async fn enqueue_compile(&self, submission: &Submission) -> anyhow::Result<()> {
        let language = self
            .languages
            .get(&submission.language)
            .with_context(|| format!("unknown language {}", submission.language))?;

        self.queue
            .push(Task::Compiling(CompilingTask {
                submission_id: submission.id,
                language: submission.language.clone(),
                constraints: language.compile_constraints,
                source: submission.source.clone(),
            }))
            .await;
        Ok(())
    }

    /// Applies a transition and announces terminal states
    async fn transition(
        &self,
        id: SubmissionId,
        transition: Transition,
    ) -> Result<bool, StoreError> {
        let applied = self.store.apply_transition(id, transition).await?;
        if applied.changed && applied.submission.is_terminal() {
            log::info!(
                "Submission {id} finished as {}",
                applied.submission.state.name()
            );
            // Nobody listening is fine
            let _ = self.finished.send(applied.submission);
        }
        Ok(applied.changed)
    }
}
