use serde::{Deserialize, Serialize};

/// A unit of work dispatched by the scheduler, always terminating in a
/// terminal state on its associated entity (spec glossary: "Runnable").
#[async_trait::async_trait]
pub trait Job: Send {
    async fn run(self: Box<Self>) -> anyhow::Result<()>;
}

/// What the change-feed listener (or a queue consumer) hands the job
/// factory: just enough to look the document back up.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct JobDescriptor {
    pub doc_id: String,
}
