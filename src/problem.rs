use std::collections::HashMap;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};

use crate::config::ProblemConfig;
use crate::sandbox::Constraints;
use crate::storage::Storage;

/// Storage keys of one testcase and the points it is worth
#[derive(Serialize, Deserialize, Debug, Clone, PartialEq, Eq)]
#[serde(rename_all = "camelCase")]
pub struct Testcase {
    pub input: String,
    pub output: String,
    pub points: u32,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Problem {
    pub constraints: Constraints,
    pub testcases: Vec<Testcase>,
}

#[derive(thiserror::Error, Debug)]
pub enum ProblemError {
    #[error("problem {problem_id} not found in domain {domain_id}")]
    NotFound { problem_id: u32, domain_id: String },
}

#[async_trait]
pub trait ProblemProvider: Send + Sync {
    async fn fetch_problem(&self, problem_id: u32, domain_id: &str)
    -> Result<Problem, ProblemError>;
}

/// Problems declared in the configuration file
#[derive(Default)]
pub struct ConfigProblems {
    problems: HashMap<(String, u32), Problem>,
}

impl ConfigProblems {
    /// Uploads every configured testcase file to storage and indexes the problems
    pub async fn load(configs: &[ProblemConfig], storage: &dyn Storage) -> anyhow::Result<Self> {
        let mut loaded = Self::default();

        for config in configs {
            let mut testcases = Vec::with_capacity(config.testcases.len());
            for (idx, case) in config.testcases.iter().enumerate() {
                let prefix = format!("problems/{}/{}/{idx}", config.domain_id, config.id);
                let input = format!("{prefix}.in");
                let output = format!("{prefix}.out");
                storage.upload(&case.input_file, &input).await?;
                storage.upload(&case.output_file, &output).await?;
                testcases.push(Testcase {
                    input,
                    output,
                    points: case.points,
                });
            }

            log::info!(
                "Loaded problem {} of domain {} with {} testcases",
                config.id,
                config.domain_id,
                testcases.len()
            );
            loaded.insert(
                config.id,
                &config.domain_id,
                Problem {
                    constraints: config.constraints,
                    testcases,
                },
            );
        }

        Ok(loaded)
    }

    pub fn insert(&mut self, problem_id: u32, domain_id: &str, problem: Problem) {
        self.problems
            .insert((domain_id.to_string(), problem_id), problem);
    }
}

#[async_trait]
impl ProblemProvider for ConfigProblems {
    async fn fetch_problem(
        &self,
        problem_id: u32,
        domain_id: &str,
    ) -> Result<Problem, ProblemError> {
        self.problems
            .get(&(domain_id.to_string(), problem_id))
            .cloned()
            .ok_or_else(|| ProblemError::NotFound {
                problem_id,
                domain_id: domain_id.to_string(),
            })
    }
}
