use serde::{Deserialize, Serialize};

/// Resource limits attached to a compile or grade task
///
/// Every field is optional; a missing field means no limit is imposed for
/// that dimension. Memory and storage are in KB, times in milliseconds.
#[derive(Serialize, Deserialize, Debug, Clone, Copy, Default, PartialEq, Eq)]
#[serde(rename_all = "camelCase")]
pub struct Constraints {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub memory: Option<u64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub time: Option<u64>,
    #[serde(default, skip_serializing_if = "Option::is_none", alias = "wall_time")]
    pub wall_time: Option<u64>,
    #[serde(default, skip_serializing_if = "Option::is_none", alias = "total_storage")]
    pub total_storage: Option<u64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub processes: Option<u32>,
}

impl Constraints {
    /// Wall-time limit actually enforced: explicit value, else three times the CPU limit
    pub fn effective_wall_time(&self) -> Option<u64> {
        self.wall_time.or(self.time.map(|t| t * 3))
    }

    /// Layers `overrides` on top of `self`, field by field
    pub fn overridden_by(&self, overrides: &Constraints) -> Constraints {
        Constraints {
            memory: overrides.memory.or(self.memory),
            time: overrides.time.or(self.time),
            wall_time: overrides.wall_time.or(self.wall_time),
            total_storage: overrides.total_storage.or(self.total_storage),
            processes: overrides.processes.or(self.processes),
        }
    }

    /// Translates the limits into `isolate` flags
    ///
    /// Only populated fields produce a flag. The order is fixed: memory, time,
    /// wall time, storage, processes, then one `--env` per environment entry.
    pub fn to_isolate_args(&self, env: &[String]) -> Vec<String> {
        let mut args = Vec::new();

        if let Some(memory) = self.memory {
            args.push(format!("--cg-mem={memory}"));
        }
        if let Some(time) = self.time {
            args.push(format!("--time={}", seconds(time)));
        }
        if let Some(wall_time) = self.effective_wall_time() {
            args.push(format!("--wall-time={}", seconds(wall_time)));
        }
        if let Some(total_storage) = self.total_storage {
            args.push(format!("--fsize={total_storage}"));
        }
        if let Some(processes) = self.processes {
            args.push(format!("--processes={processes}"));
        }
        for entry in env {
            args.push(format!("--env={entry}"));
        }

        args
    }
}

/// Renders milliseconds as the shortest decimal number of seconds
fn seconds(ms: u64) -> String {
    format!("{}", ms as f64 / 1000.0)
}
