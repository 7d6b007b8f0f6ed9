mod constraints;
mod isolate;
mod meta;

pub use constraints::Constraints;
pub use isolate::IsolateSandbox;
pub use meta::{Telemetry, classify, parse_meta};

use std::path::PathBuf;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};

/// Identifier of one isolation slot, `1..=N`
pub type SlotId = u32;

/// Outcome of one sandboxed run
///
/// Exactly one variant is produced per run. Times are in milliseconds and
/// memory in KB.
#[derive(Serialize, Deserialize, Debug, Clone, PartialEq, Eq)]
#[serde(tag = "status", rename_all_fields = "camelCase")]
pub enum SandboxResult {
    Succeeded {
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

/// A single command to execute inside a slot
///
/// The redirect paths are file names relative to the slot's working directory.
#[derive(Debug, Clone, Default)]
pub struct RunRequest {
    pub command: String,
    pub constraints: Constraints,
    pub stdin: Option<String>,
    pub stdout: Option<String>,
    pub stderr: Option<String>,
    pub env: Vec<String>,
}

#[derive(thiserror::Error, Debug)]
pub enum SandboxError {
    #[error("slot {0} already exists and must be destroyed first")]
    Conflict(SlotId),
    #[error("failed to initialize slot {slot}: {message}")]
    Init { slot: SlotId, message: String },
    #[error("failed to destroy slot {slot}: {message}")]
    Destroy { slot: SlotId, message: String },
    #[error(transparent)]
    Io(#[from] std::io::Error),
}

/// Lifecycle of one isolation slot: `init`, any number of `run`s, `destroy`
///
/// Implementations never fail a `run`; every failure mode is folded into a
/// [`SandboxResult`].
#[async_trait]
pub trait Isolation: Send + Sync {
    /// Prepares the slot and returns its working directory
    async fn init(&self, slot: SlotId) -> Result<PathBuf, SandboxError>;

    /// Tears the slot down; safe to call on a slot that was never initialized
    async fn destroy(&self, slot: SlotId) -> Result<(), SandboxError>;

    async fn run(&self, slot: SlotId, request: RunRequest) -> SandboxResult;
}
