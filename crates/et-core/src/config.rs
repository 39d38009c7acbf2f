use serde::{Deserialize, Serialize};
use std::path::PathBuf;

/// Dispatch backend for the job scheduler (spec 4.3 / 6).
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum SchedulerKind {
    InProcess,
    ExternalQueue,
}

impl std::fmt::Display for SchedulerKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let s = match self {
            SchedulerKind::InProcess => "in-process",
            SchedulerKind::ExternalQueue => "external-queue",
        };
        f.write_str(s)
    }
}

impl std::str::FromStr for SchedulerKind {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "in-process" => Ok(SchedulerKind::InProcess),
            "external-queue" => Ok(SchedulerKind::ExternalQueue),
            other => Err(format!(
                "invalid scheduler-type {other:?}: expected \"in-process\" or \"external-queue\""
            )),
        }
    }
}

/// The process-wide configuration recognized by the core (spec 6).
///
/// Threaded explicitly into runners and the CAS engine as a `JobContext`
/// rather than embedded in entity fields — see the design notes in
/// SPEC_FULL.md 4. This is not part of any persisted document.
#[derive(Debug, Clone)]
pub struct Configuration {
    pub document_store_url: String,
    pub blob_store_url: String,
    pub queue_endpoint: Option<String>,
    pub queue_lookup_endpoint: Option<String>,
    pub queue_topic: Option<String>,
    pub work_directory: PathBuf,
    pub scheduler_type: SchedulerKind,
    pub blob_store_replica_min: u32,
}

impl Configuration {
    pub fn job_work_dir(&self, job_id: &str) -> PathBuf {
        self.work_directory.join(job_id)
    }
}

/// Shared, read-only context handed to every runner and to CAS call-sites.
///
/// Cloning is cheap: `Configuration` is wrapped so runners can hold their
/// own owned copy without re-threading a lifetime through every call.
pub type JobContext = std::sync::Arc<Configuration>;
