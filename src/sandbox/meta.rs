//! Parsing and interpretation of the `isolate` meta file
//!
//! The meta file is a list of `key:value` lines. Times are reported in
//! seconds and memory in KB. Only the keys the classifier needs are kept.

use super::{Constraints, SandboxResult};

/// Signal number the kernel uses when the OOM killer terminates a process
const SIGKILL: i32 = 9;

/// Typed view of one meta file
#[derive(Debug, Default, Clone, PartialEq, Eq)]
pub struct Telemetry {
    pub status: Option<String>,
    pub message: Option<String>,
    /// CPU time in milliseconds
    pub time: Option<u64>,
    /// Wall-clock time in milliseconds
    pub wall_time: Option<u64>,
    /// Peak memory in KB
    pub memory: Option<u64>,
    pub exitsig: Option<i32>,
    pub exitcode: Option<i32>,
}

/// Parses meta file content, ignoring unknown keys and malformed values
///
/// A malformed numeric value is dropped rather than guessed, so a status that
/// requires it later classifies as a system error.
pub fn parse_meta(content: &str) -> Telemetry {
    let mut telemetry = Telemetry::default();

    for line in content.lines() {
        let Some((key, value)) = line.split_once(':') else {
            continue;
        };
        let value = value.trim();

        match key.trim() {
            "status" => telemetry.status = Some(value.to_string()),
            "message" => telemetry.message = Some(value.to_string()),
            "time" => telemetry.time = parse_seconds(value),
            "wall-time" => telemetry.wall_time = parse_seconds(value),
            // isolate's own spelling, used only when the canonical key is absent
            "time-wall" => {
                telemetry.wall_time = telemetry.wall_time.or(parse_seconds(value));
            }
            "memory" => telemetry.memory = value.parse().ok(),
            "cg-mem" => telemetry.memory = telemetry.memory.or(value.parse().ok()),
            "exitsig" => telemetry.exitsig = value.parse().ok(),
            "exitcode" => telemetry.exitcode = value.parse().ok(),
            _ => {}
        }
    }

    telemetry
}

/// Converts a seconds value to integer milliseconds, rounding half away from zero
fn parse_seconds(value: &str) -> Option<u64> {
    let secs = value.parse::<f64>().ok()?;
    if !secs.is_finite() || secs < 0.0 {
        return None;
    }
    Some((secs * 1000.0).round() as u64)
}

/// Maps the telemetry of one run onto exactly one [`SandboxResult`]
///
/// `None` means the meta file was never written, which only happens when
/// `isolate` itself terminated abnormally.
pub fn classify(telemetry: Option<&Telemetry>, constraints: &Constraints) -> SandboxResult {
    let Some(t) = telemetry else {
        return SandboxResult::SystemError {
            message: "meta file missing".to_string(),
        };
    };
    let message = |fallback: &str| {
        t.message
            .clone()
            .unwrap_or_else(|| fallback.to_string())
    };

    match t.status.as_deref() {
        Some("XX") => SandboxResult::SystemError {
            message: message("internal sandbox error"),
        },
        Some("RE") => SandboxResult::RuntimeError {
            message: message("runtime error"),
        },
        Some("CG") | Some("SG") => match (t.exitsig, constraints.memory, t.memory) {
            (Some(SIGKILL), Some(limit), Some(memory)) if memory > limit => {
                SandboxResult::MemoryExceeded { memory }
            }
            _ => SandboxResult::RuntimeError {
                message: message("killed by signal"),
            },
        },
        Some("TO") => match (t.time, t.wall_time) {
            (Some(time), Some(wall_time)) => SandboxResult::TimeExceeded { time, wall_time },
            _ => SandboxResult::SystemError {
                message: "time limit telemetry incomplete".to_string(),
            },
        },
        Some("OK") | None => match (t.time, t.wall_time, t.memory) {
            (Some(time), Some(wall_time), Some(memory)) => SandboxResult::Succeeded {
                time,
                wall_time,
                memory,
            },
            _ => SandboxResult::SystemError {
                message: "run telemetry incomplete".to_string(),
            },
        },
        Some(_) => SandboxResult::SystemError {
            message: "unknown status".to_string(),
        },
    }
}
