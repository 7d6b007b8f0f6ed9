#![allow(dead_code)]

use std::collections::{HashMap, HashSet};
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use parking_lot::Mutex;
use tempfile::TempDir;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;

use oj::config::LanguageConfig;
use oj::database::{MemoryStore, SubmissionStore};
use oj::executor::{Executor, Languages};
use oj::judge::Judge;
use oj::problem::{ConfigProblems, Problem, Testcase};
use oj::queue::TaskQueue;
use oj::sandbox::{Constraints, Isolation, RunRequest, SandboxError, SandboxResult, SlotId};
use oj::storage::{LocalStorage, Storage};
use oj::submission::{NewSubmission, Submission, SubmissionId};
use oj::worker::Dispatcher;

pub const LANGUAGE: &str = "C++";

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SlotEvent {
    Init,
    /// `init` refused because the slot was still live
    Conflict,
    Run,
    Destroy,
}

#[derive(Default)]
struct FakeState {
    live: HashSet<SlotId>,
    running: HashSet<SlotId>,
    max_running: usize,
    violations: Vec<String>,
    events: Vec<(SlotId, SlotEvent)>,
    panics_left: HashMap<String, u32>,
}

/// Stand-in for `isolate` that "compiles" by copying the source and "runs"
/// tiny scripts understood by [`FakeIsolation::execute`]
pub struct FakeIsolation {
    root: PathBuf,
    delay: Duration,
    state: Mutex<FakeState>,
}

/// Keeps the running set accurate even if a run panics
struct RunningGuard<'a> {
    state: &'a Mutex<FakeState>,
    slot: SlotId,
}

impl Drop for RunningGuard<'_> {
    fn drop(&mut self) {
        self.state.lock().running.remove(&self.slot);
    }
}

impl FakeIsolation {
    pub fn new(root: &Path) -> Self {
        Self {
            root: root.to_path_buf(),
            delay: Duration::from_millis(15),
            state: Mutex::new(FakeState::default()),
        }
    }

    /// Makes the next `times` runs of `program` panic
    pub fn panic_on(&self, program: &str, times: u32) {
        self.state
            .lock()
            .panics_left
            .insert(program.to_string(), times);
    }

    /// Pretends a previous process left `slot` alive
    pub fn mark_live(&self, slot: SlotId) {
        self.state.lock().live.insert(slot);
    }

    pub fn is_live(&self, slot: SlotId) -> bool {
        self.state.lock().live.contains(&slot)
    }

    pub fn max_running(&self) -> usize {
        self.state.lock().max_running
    }

    pub fn violations(&self) -> Vec<String> {
        self.state.lock().violations.clone()
    }

    pub fn events(&self) -> Vec<(SlotId, SlotEvent)> {
        self.state.lock().events.clone()
    }

    fn work_dir(&self, slot: SlotId) -> PathBuf {
        self.root.join(slot.to_string())
    }

    fn execute(&self, work_dir: &Path, request: &RunRequest) -> SandboxResult {
        if request.command.starts_with("g++") {
            let source = std::fs::read_to_string(work_dir.join("main.cpp")).unwrap();
            if source.contains("syntax error") {
                let log = work_dir.join(request.stderr.as_deref().unwrap());
                std::fs::write(log, "syntax error").unwrap();
                return SandboxResult::RuntimeError {
                    message: "Exited with error status 1".to_string(),
                };
            }
            std::fs::copy(work_dir.join("main.cpp"), work_dir.join("main")).unwrap();
            return SandboxResult::Succeeded {
                time: 100,
                wall_time: 120,
                memory: 20000,
            };
        }

        let program = std::fs::read_to_string(work_dir.join("main")).unwrap();
        let program = program.trim();
        {
            let mut state = self.state.lock();
            if let Some(left) = state.panics_left.get_mut(program) {
                if *left > 0 {
                    *left -= 1;
                    drop(state);
                    panic!("simulated worker crash");
                }
            }
        }

        let input_path = work_dir.join(request.stdin.as_deref().unwrap());
        let input = std::fs::read_to_string(input_path).unwrap();
        let output_path = work_dir.join(request.stdout.as_deref().unwrap());
        match program {
            "ECHO" => {
                std::fs::write(output_path, input).unwrap();
                SandboxResult::Succeeded {
                    time: 5,
                    wall_time: 7,
                    memory: 1000,
                }
            }
            "LOOP" => SandboxResult::TimeExceeded {
                time: 1001,
                wall_time: 3000,
            },
            "HOG" => SandboxResult::MemoryExceeded { memory: 70000 },
            _ => SandboxResult::RuntimeError {
                message: "Caught fatal signal 11".to_string(),
            },
        }
    }
}

#[async_trait]
impl Isolation for FakeIsolation {
    async fn init(&self, slot: SlotId) -> Result<PathBuf, SandboxError> {
        {
            let mut state = self.state.lock();
            if !state.live.insert(slot) {
                state.events.push((slot, SlotEvent::Conflict));
                return Err(SandboxError::Conflict(slot));
            }
            state.events.push((slot, SlotEvent::Init));
        }
        let dir = self.work_dir(slot);
        std::fs::create_dir_all(&dir)?;
        Ok(dir)
    }

    async fn destroy(&self, slot: SlotId) -> Result<(), SandboxError> {
        {
            let mut state = self.state.lock();
            if state.running.contains(&slot) {
                state
                    .violations
                    .push(format!("slot {slot} destroyed while running"));
            }
            state.live.remove(&slot);
            state.events.push((slot, SlotEvent::Destroy));
        }
        let dir = self.work_dir(slot);
        if dir.exists() {
            std::fs::remove_dir_all(dir)?;
        }
        Ok(())
    }

    async fn run(&self, slot: SlotId, request: RunRequest) -> SandboxResult {
        {
            let mut state = self.state.lock();
            if !state.live.contains(&slot) {
                state.violations.push(format!("slot {slot} run before init"));
            }
            if !state.running.insert(slot) {
                state.violations.push(format!("slot {slot} run concurrently"));
            }
            state.max_running = state.max_running.max(state.running.len());
            state.events.push((slot, SlotEvent::Run));
        }
        let _guard = RunningGuard {
            state: &self.state,
            slot,
        };

        tokio::time::sleep(self.delay).await;
        self.execute(&self.work_dir(slot), &request)
    }
}

pub fn language() -> LanguageConfig {
    LanguageConfig {
        name: LANGUAGE.to_string(),
        src_file: "main.cpp".to_string(),
        binary_file: "main".to_string(),
        compile_command: "g++ -O2 -o {binary_path} {src_path}".to_string(),
        execute_command: "./{binary_path}".to_string(),
        compile_constraints: Constraints {
            time: Some(10000),
            memory: Some(262144),
            processes: Some(10),
            ..Default::default()
        },
        run_constraints: Constraints {
            processes: Some(1),
            ..Default::default()
        },
        env: vec!["PATH=/usr/bin:/bin".to_string()],
    }
}

/// A running pipeline wired to the fake isolation
pub struct Harness {
    pub dir: TempDir,
    pub isolation: Arc<FakeIsolation>,
    pub storage: Arc<LocalStorage>,
    pub store: Arc<MemoryStore>,
    pub queue: Arc<TaskQueue>,
    pub judge: Arc<Judge>,
    token: CancellationToken,
    dispatcher: Option<JoinHandle<()>>,
    executor: Arc<Executor>,
    slots: u32,
}

/// `(input, expected output, points)` of each testcase of one problem
pub type CaseSpec<'a> = (&'a str, &'a str, u32);

pub struct HarnessBuilder<'a> {
    slots: u32,
    problems: Vec<(u32, Vec<CaseSpec<'a>>)>,
    broken_problems: Vec<u32>,
}

impl<'a> HarnessBuilder<'a> {
    pub fn new(slots: u32) -> Self {
        Self {
            slots,
            problems: Vec::new(),
            broken_problems: Vec::new(),
        }
    }

    pub fn problem(mut self, id: u32, cases: Vec<CaseSpec<'a>>) -> Self {
        self.problems.push((id, cases));
        self
    }

    /// A problem whose single testcase refers to data missing from storage
    pub fn broken_problem(mut self, id: u32) -> Self {
        self.broken_problems.push(id);
        self
    }

    pub async fn build(self) -> Harness {
        let dir = tempfile::tempdir().unwrap();
        let isolation = Arc::new(FakeIsolation::new(&dir.path().join("boxes")));
        let storage = Arc::new(LocalStorage::new(dir.path().join("blobs")).unwrap());

        let mut problems = ConfigProblems::default();
        for (id, cases) in self.problems {
            let mut testcases = Vec::new();
            for (idx, (input, output, points)) in cases.into_iter().enumerate() {
                let input_key = format!("problems/system/{id}/{idx}.in");
                let output_key = format!("problems/system/{id}/{idx}.out");
                let local = dir.path().join("scratch");
                std::fs::write(&local, input).unwrap();
                storage.upload(&local, &input_key).await.unwrap();
                std::fs::write(&local, output).unwrap();
                storage.upload(&local, &output_key).await.unwrap();
                testcases.push(Testcase {
                    input: input_key,
                    output: output_key,
                    points,
                });
            }
            problems.insert(
                id,
                "system",
                Problem {
                    constraints: Constraints {
                        time: Some(1000),
                        memory: Some(65536),
                        ..Default::default()
                    },
                    testcases,
                },
            );
        }
        for id in self.broken_problems {
            problems.insert(
                id,
                "system",
                Problem {
                    constraints: Constraints::default(),
                    testcases: vec![Testcase {
                        input: "missing/input".to_string(),
                        output: "missing/output".to_string(),
                        points: 100,
                    }],
                },
            );
        }

        let languages = Arc::new(Languages::new([language()]));
        let store = Arc::new(MemoryStore::new());
        let queue = Arc::new(TaskQueue::new());
        let judge = Arc::new(Judge::new(
            store.clone(),
            Arc::new(problems),
            languages.clone(),
            queue.clone(),
        ));
        let executor = Arc::new(Executor::new(
            isolation.clone(),
            storage.clone(),
            languages,
        ));

        Harness {
            dir,
            isolation,
            storage,
            store,
            queue,
            judge,
            token: CancellationToken::new(),
            dispatcher: None,
            executor,
            slots: self.slots,
        }
    }
}

impl Harness {
    /// Starts the dispatch loop
    pub async fn start(&mut self) {
        let dispatcher = Dispatcher::start(
            self.judge.clone(),
            self.executor.clone(),
            self.queue.clone(),
            self.slots,
        )
        .await;
        self.dispatcher = Some(tokio::spawn(dispatcher.run(self.token.clone())));
    }

    pub async fn stop(&mut self) {
        self.token.cancel();
        if let Some(handle) = self.dispatcher.take() {
            handle.await.unwrap();
        }
    }

    pub async fn submit(&self, problem_id: u32, source: &str) -> SubmissionId {
        self.judge
            .submit(NewSubmission {
                language: LANGUAGE.to_string(),
                source: source.to_string(),
                problem_id,
                domain_id: "system".to_string(),
                user_id: 1,
                contest_id: None,
                team_id: None,
            })
            .await
            .unwrap()
            .id
    }

    /// Polls the store until the submission is terminal
    pub async fn wait_finished(&self, id: SubmissionId) -> Submission {
        tokio::time::timeout(Duration::from_secs(10), async {
            loop {
                let submission = self.store.read(id).await.unwrap();
                if submission.is_terminal() {
                    return submission;
                }
                tokio::time::sleep(Duration::from_millis(5)).await;
            }
        })
        .await
        .expect("submission did not finish in time")
    }
}
