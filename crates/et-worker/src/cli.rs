use std::path::PathBuf;

use clap::Parser;
use et_core::{Configuration, SchedulerKind};

/// CLI surface over the recognized configuration options (spec 6). Every
/// field maps to one row of the configuration table; there is no config
/// file — environment variables and flags are the only input, per the
/// teacher's own `client/src/cli.rs` (`env = "..."` fallbacks,
/// `default_value_t`).
#[derive(Debug, Clone, Parser)]
#[command(name = "et-worker", version, about = "ElasticThought job orchestration worker")]
pub struct Cli {
    /// Endpoint of the document store. Only an in-process mock document
    /// store ships with this crate (spec 1: real document stores are an
    /// external collaborator), so this is recorded for operator visibility
    /// but does not currently select a backend.
    #[arg(long, env = "DOCUMENT_STORE_URL", default_value = "mock://in-process")]
    pub document_store_url: String,

    /// `blob-store-url` scheme selects the backend: `file://`, `http(s)://`,
    /// or `mock://`.
    #[arg(long, env = "BLOB_STORE_URL", default_value = "mock://")]
    pub blob_store_url: String,

    #[arg(long, env = "QUEUE_ENDPOINT")]
    pub queue_endpoint: Option<String>,

    #[arg(long, env = "QUEUE_LOOKUP_ENDPOINT")]
    pub queue_lookup_endpoint: Option<String>,

    #[arg(long, env = "QUEUE_TOPIC", default_value = "elasticthought-jobs")]
    pub queue_topic: String,

    #[arg(long, env = "WORK_DIRECTORY", default_value = "./work")]
    pub work_directory: PathBuf,

    #[arg(long, env = "SCHEDULER_TYPE", default_value_t = SchedulerKind::InProcess)]
    pub scheduler_type: SchedulerKind,

    #[arg(long, env = "BLOB_STORE_REPLICA_MIN", default_value_t = 1)]
    pub blob_store_replica_min: u32,

    /// Number of in-process consumer tasks draining the external queue.
    /// Only meaningful with `--scheduler-type external-queue`; a real
    /// deployment would run these as separate worker processes (spec 4.3),
    /// but no broker crate ships here (DESIGN.md Open Question 6), so they
    /// run as tasks against the same [`et_store::InMemoryQueue`].
    #[arg(long, env = "QUEUE_WORKERS", default_value_t = 4)]
    pub queue_workers: usize,
}

impl Cli {
    pub fn into_configuration(self) -> Configuration {
        Configuration {
            document_store_url: self.document_store_url,
            blob_store_url: self.blob_store_url,
            queue_endpoint: self.queue_endpoint,
            queue_lookup_endpoint: self.queue_lookup_endpoint,
            queue_topic: Some(self.queue_topic),
            work_directory: self.work_directory,
            scheduler_type: self.scheduler_type,
            blob_store_replica_min: self.blob_store_replica_min,
        }
    }
}
