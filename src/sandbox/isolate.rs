use std::io::ErrorKind;
use std::path::{Path, PathBuf};
use std::process::Output;

use async_trait::async_trait;
use tokio::fs;
use tokio::process::Command;

use crate::config::IsolateConfig;

use super::{Isolation, RunRequest, SandboxError, SandboxResult, SlotId, classify, parse_meta};

/// Slot controller backed by the `isolate` command line tool
///
/// Each slot maps onto one isolate box id and always runs in control group
/// mode, so memory is limited with `--cg-mem` and reported as `cg-mem`. Meta
/// files are written outside the box so the sandboxed program can never forge
/// its own telemetry.
pub struct IsolateSandbox {
    binary: String,
    meta_dir: PathBuf,
    dirs: Vec<String>,
}

impl IsolateSandbox {
    pub fn build(config: &IsolateConfig) -> anyhow::Result<Self> {
        let meta_dir = config.meta_dir()?;
        std::fs::create_dir_all(&meta_dir)?;

        log::info!(
            "Using {} for isolation, meta files in {}",
            config.binary,
            meta_dir.display()
        );
        Ok(Self {
            binary: config.binary.clone(),
            meta_dir,
            dirs: config.dirs.clone(),
        })
    }

    fn meta_path(&self, slot: SlotId) -> PathBuf {
        self.meta_dir.join(format!("{slot}.meta"))
    }

    /// Common prefix of every invocation: cgroup mode and box id
    fn base_args(&self, slot: SlotId) -> Vec<String> {
        vec!["--cg".to_string(), "-b".to_string(), slot.to_string()]
    }

    /// Full argument list for `isolate --run`
    fn run_args(&self, slot: SlotId, meta_path: &Path, request: &RunRequest) -> Vec<String> {
        let mut args = self.base_args(slot);
        args.push(format!("--meta={}", meta_path.display()));
        args.extend(self.dirs.iter().map(|dir| format!("--dir={dir}")));
        args.extend(request.constraints.to_isolate_args(&request.env));

        if let Some(stdin) = &request.stdin {
            args.push(format!("--stdin={stdin}"));
        }
        if let Some(stdout) = &request.stdout {
            args.push(format!("--stdout={stdout}"));
        }
        if let Some(stderr) = &request.stderr {
            args.push(format!("--stderr={stderr}"));
        }

        args.extend(
            ["--silent", "--run", "--", "/bin/sh", "-c"]
                .into_iter()
                .map(String::from),
        );
        args.push(request.command.clone());
        args
    }

    async fn invoke(&self, args: &[String]) -> std::io::Result<Output> {
        Command::new(&self.binary).args(args).output().await
    }
}

#[async_trait]
impl Isolation for IsolateSandbox {
    async fn init(&self, slot: SlotId) -> Result<PathBuf, SandboxError> {
        let mut args = self.base_args(slot);
        args.push("--init".to_string());

        let output = self.invoke(&args).await.map_err(|e| SandboxError::Init {
            slot,
            message: format!("failed to spawn {}: {e}", self.binary),
        })?;

        if !output.status.success() {
            let stderr = String::from_utf8_lossy(&output.stderr);
            if stderr.contains("already exists") {
                return Err(SandboxError::Conflict(slot));
            }
            return Err(SandboxError::Init {
                slot,
                message: stderr.trim().to_string(),
            });
        }

        let root_dir = String::from_utf8_lossy(&output.stdout).trim().to_string();
        if root_dir.is_empty() {
            return Err(SandboxError::Init {
                slot,
                message: "isolate --init produced empty stdout".to_string(),
            });
        }

        log::debug!("Slot {slot} initialized at {root_dir}");
        Ok(PathBuf::from(root_dir).join("box"))
    }

    async fn destroy(&self, slot: SlotId) -> Result<(), SandboxError> {
        let mut args = self.base_args(slot);
        args.push("--cleanup".to_string());

        let output = self.invoke(&args).await.map_err(|e| SandboxError::Destroy {
            slot,
            message: format!("failed to spawn {}: {e}", self.binary),
        })?;

        if !output.status.success() {
            return Err(SandboxError::Destroy {
                slot,
                message: String::from_utf8_lossy(&output.stderr).trim().to_string(),
            });
        }

        log::debug!("Slot {slot} destroyed");
        Ok(())
    }

    async fn run(&self, slot: SlotId, request: RunRequest) -> SandboxResult {
        let meta_path = self.meta_path(slot);
        if let Err(e) = fs::remove_file(&meta_path).await {
            if e.kind() != ErrorKind::NotFound {
                return SandboxResult::SystemError {
                    message: format!("cannot clear stale meta file: {e}"),
                };
            }
        }

        let args = self.run_args(slot, &meta_path, &request);
        // A non-zero exit is how isolate reports a failing program, not a fault
        match self.invoke(&args).await {
            Ok(output) if !output.status.success() => {
                log::debug!("isolate run on slot {slot} exited with {}", output.status);
            }
            Ok(_) => {}
            Err(e) => log::error!("Failed to spawn isolate run on slot {slot}: {e}"),
        }

        let telemetry = fs::read_to_string(&meta_path)
            .await
            .ok()
            .map(|content| parse_meta(&content));
        classify(telemetry.as_ref(), &request.constraints)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::sandbox::Constraints;
    use pretty_assertions::assert_eq;

    fn sandbox() -> IsolateSandbox {
        IsolateSandbox {
            binary: "isolate".to_string(),
            meta_dir: PathBuf::from("/tmp/meta"),
            dirs: vec!["/opt/oj".to_string()],
        }
    }

    #[test]
    fn test_run_args_layout() {
        let request = RunRequest {
            command: "./main".to_string(),
            constraints: Constraints {
                memory: Some(65536),
                time: Some(1000),
                ..Default::default()
            },
            stdin: Some("input.txt".to_string()),
            stdout: Some("output.txt".to_string()),
            stderr: None,
            env: vec!["PATH=/usr/bin".to_string()],
        };
        let sandbox = sandbox();
        let args = sandbox.run_args(3, &sandbox.meta_path(3), &request);
        assert_eq!(
            args,
            vec![
                "--cg",
                "-b",
                "3",
                "--meta=/tmp/meta/3.meta",
                "--dir=/opt/oj",
                "--cg-mem=65536",
                "--time=1",
                "--wall-time=3",
                "--env=PATH=/usr/bin",
                "--stdin=input.txt",
                "--stdout=output.txt",
                "--silent",
                "--run",
                "--",
                "/bin/sh",
                "-c",
                "./main",
            ]
        );
    }

    #[test]
    fn test_every_invocation_uses_cgroups() {
        assert_eq!(sandbox().base_args(7), vec!["--cg", "-b", "7"]);
    }

    #[tokio::test]
    async fn test_missing_binary_yields_system_error() {
        let dir = tempfile::tempdir().unwrap();
        let sandbox = IsolateSandbox {
            binary: "/nonexistent/isolate".to_string(),
            meta_dir: dir.path().to_path_buf(),
            dirs: Vec::new(),
        };

        let result = sandbox.run(1, RunRequest::default()).await;
        assert_eq!(
            result,
            SandboxResult::SystemError {
                message: "meta file missing".to_string()
            }
        );
        assert!(matches!(
            sandbox.init(1).await,
            Err(SandboxError::Init { slot: 1, .. })
        ));
    }
}
