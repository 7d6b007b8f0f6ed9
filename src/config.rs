use std::path::PathBuf;

use anyhow::anyhow;
use clap::{Parser, Subcommand};
use directories::ProjectDirs;
use serde::Deserialize;

use crate::sandbox::Constraints;

#[derive(Parser)]
#[command(name = "oj", version = "1.0", about, long_about = None)]
pub struct CliArgs {
    /// Path to the configuration file
    #[arg(long = "config", short = 'c')]
    pub config_path: String,

    /// Whether to flush the existing database
    #[arg(long = "flush-data", short = 'f', default_value_t = false)]
    pub flush_data: bool,

    /// Number of isolation slots, defaults to the number of CPU cores
    #[arg(long = "workers", short = 'w')]
    pub workers: Option<u32>,

    #[command(subcommand)]
    pub command: Command,
}

#[derive(Subcommand, Debug)]
pub enum Command {
    /// Run the judge until interrupted
    Serve,
    /// Judge one source file and print the final submission
    Submit {
        #[arg(long)]
        problem: u32,
        #[arg(long, default_value = "system")]
        domain: String,
        #[arg(long)]
        language: String,
        #[arg(long)]
        source: PathBuf,
        #[arg(long, default_value_t = 0)]
        user: u32,
    },
}

impl CliArgs {
    /// Load the configuration from the specified file
    pub fn to_config(&self) -> std::io::Result<Config> {
        let file = std::fs::File::open(&self.config_path)?;
        let reader = std::io::BufReader::new(file);
        serde_json::from_reader(reader).map_err(|e| e.into())
    }

    /// Slot count: the explicit override, else the available parallelism
    pub fn slot_count(&self) -> u32 {
        self.workers.unwrap_or_else(|| {
            std::thread::available_parallelism()
                .map(|n| n.get() as u32)
                .unwrap_or(1)
        })
    }
}

fn project_dirs() -> anyhow::Result<ProjectDirs> {
    ProjectDirs::from("", "", "oj").ok_or_else(|| anyhow!("Unable to find user directory"))
}

#[derive(Deserialize, Debug)]
pub struct Config {
    #[serde(default)]
    pub isolate: IsolateConfig,
    #[serde(default)]
    pub database: DatabaseConfig,
    #[serde(default)]
    pub storage: StorageConfig,
    pub languages: Vec<LanguageConfig>,
    pub problems: Vec<ProblemConfig>,
}

#[derive(Deserialize, Debug, Clone)]
pub struct IsolateConfig {
    #[serde(default = "default_isolate_binary")]
    pub binary: String,
    pub meta_dir: Option<PathBuf>,
    /// Extra host directories made visible inside every box
    #[serde(default)]
    pub dirs: Vec<String>,
}

impl Default for IsolateConfig {
    fn default() -> Self {
        Self {
            binary: default_isolate_binary(),
            meta_dir: None,
            dirs: Vec::new(),
        }
    }
}

impl IsolateConfig {
    pub fn meta_dir(&self) -> anyhow::Result<PathBuf> {
        match &self.meta_dir {
            Some(dir) => Ok(dir.clone()),
            None => Ok(project_dirs()?.cache_dir().join("meta")),
        }
    }
}

fn default_isolate_binary() -> String {
    "isolate".to_string()
}

#[derive(Deserialize, Debug, Default, Clone)]
pub struct DatabaseConfig {
    pub path: Option<PathBuf>,
}

impl DatabaseConfig {
    pub fn path(&self) -> anyhow::Result<PathBuf> {
        match &self.path {
            Some(path) => Ok(path.clone()),
            None => {
                let data_dir = project_dirs()?.data_local_dir().to_path_buf();
                std::fs::create_dir_all(&data_dir)?;
                Ok(data_dir.join(crate::database::DATABASE_NAME))
            }
        }
    }
}

#[derive(Deserialize, Debug, Default, Clone)]
pub struct StorageConfig {
    pub root: Option<PathBuf>,
}

impl StorageConfig {
    pub fn root(&self) -> anyhow::Result<PathBuf> {
        match &self.root {
            Some(root) => Ok(root.clone()),
            None => Ok(project_dirs()?.data_local_dir().join("blobs")),
        }
    }
}

/// How to build and run programs of one language
///
/// `{src_path}` and `{binary_path}` in the command templates are replaced by
/// the slot-local file names before invocation.
#[derive(Deserialize, Debug, Clone)]
pub struct LanguageConfig {
    pub name: String,
    pub src_file: String,
    pub binary_file: String,
    pub compile_command: String,
    pub execute_command: String,
    #[serde(default)]
    pub compile_constraints: Constraints,
    #[serde(default)]
    pub run_constraints: Constraints,
    #[serde(default)]
    pub env: Vec<String>,
}

#[derive(Deserialize, Debug, Clone)]
pub struct ProblemConfig {
    pub id: u32,
    #[serde(default = "default_domain")]
    pub domain_id: String,
    #[serde(default)]
    pub constraints: Constraints,
    pub testcases: Vec<TestcaseConfig>,
}

#[derive(Deserialize, Debug, Clone)]
pub struct TestcaseConfig {
    pub input_file: PathBuf,
    pub output_file: PathBuf,
    pub points: u32,
}

pub fn default_domain() -> String {
    "system".to_string()
}

#[cfg(test)]
mod tests {
    use super::*;

    const EXAMPLE: &str = r#"{
        "isolate": { "binary": "/usr/local/bin/isolate", "dirs": ["/opt/oj"] },
        "languages": [{
            "name": "C++",
            "src_file": "main.cpp",
            "binary_file": "main",
            "compile_command": "g++ -O2 -o {binary_path} {src_path}",
            "execute_command": "./{binary_path}",
            "compile_constraints": { "time": 10000, "memory": 262144, "processes": 10 },
            "run_constraints": { "processes": 1 },
            "env": ["PATH=/usr/bin:/bin"]
        }],
        "problems": [{
            "id": 1,
            "constraints": { "time": 1000, "memory": 65536 },
            "testcases": [
                { "input_file": "data/1.in", "output_file": "data/1.ans", "points": 50 },
                { "input_file": "data/2.in", "output_file": "data/2.ans", "points": 50 }
            ]
        }]
    }"#;

    #[test]
    fn test_config_deserialization() {
        let config: Config = serde_json::from_str(EXAMPLE).unwrap();
        assert_eq!(config.isolate.binary, "/usr/local/bin/isolate");
        assert_eq!(config.isolate.dirs, vec!["/opt/oj"]);
        assert!(config.isolate.meta_dir.is_none());
        assert_eq!(config.problems[0].domain_id, "system");
        assert_eq!(config.problems[0].constraints.time, Some(1000));
        assert_eq!(config.problems[0].testcases[1].points, 50);

        let cpp = &config.languages[0];
        assert_eq!(cpp.name, "C++");
        assert_eq!(cpp.compile_constraints.processes, Some(10));
        assert_eq!(cpp.run_constraints.time, None);
        assert_eq!(cpp.env, vec!["PATH=/usr/bin:/bin"]);
    }

    #[test]
    fn test_cli_parses_submit() {
        let cli = CliArgs::parse_from([
            "oj", "-c", "cfg.json", "-w", "4", "submit", "--problem", "1", "--language", "C++",
            "--source", "a.cpp",
        ]);
        assert_eq!(cli.slot_count(), 4);
        match cli.command {
            Command::Submit {
                problem,
                domain,
                user,
                ..
            } => {
                assert_eq!(problem, 1);
                assert_eq!(domain, "system");
                assert_eq!(user, 0);
            }
            Command::Serve => panic!("expected submit"),
        }
    }
}
