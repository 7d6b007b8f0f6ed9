pub mod config;
pub mod database;
pub mod executor;
pub mod judge;
pub mod problem;
pub mod queue;
pub mod sandbox;
pub mod storage;
pub mod submission;
pub mod task;
pub mod worker;

pub fn create_timestamp() -> String {
    use chrono::{SecondsFormat, Utc};
    Utc::now().to_rfc3339_opts(SecondsFormat::Millis, true)
}
