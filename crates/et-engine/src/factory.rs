use std::sync::Arc;

use et_core::{DocType, JobContext};
use et_store::{BlobStore, DocumentStore};
use thiserror::Error;

use crate::classify::ClassifyJobRunner;
use crate::downloader::DatafileDownloader;
use crate::entities::{ClassifyJob, Datafile, Dataset, TrainingJob};
use crate::job::{Job, JobDescriptor};
use crate::splitter::DatasetSplitter;
use crate::training::TrainingJobRunner;

#[derive(Debug, Error)]
pub enum FactoryError {
    #[error("document type {0:?} has no runnable")]
    UnsupportedDocType(DocType),
    #[error(transparent)]
    Other(#[from] anyhow::Error),
}

/// Maps a document id to a concrete [`Job`] (spec 4.4).
#[async_trait::async_trait]
pub trait JobFactory: Send + Sync {
    async fn create_job(&self, descriptor: JobDescriptor) -> anyhow::Result<Box<dyn Job>>;
}

/// The one real [`JobFactory`]: fetches the document, reads its type tag,
/// and dispatches to the matching runner, per `original_source/job_factory.go`.
pub struct DocumentJobFactory {
    pub store: Arc<dyn DocumentStore>,
    pub blobs: Arc<dyn BlobStore>,
    pub ctx: JobContext,
}

#[async_trait::async_trait]
impl JobFactory for DocumentJobFactory {
    async fn create_job(&self, descriptor: JobDescriptor) -> anyhow::Result<Box<dyn Job>> {
        let doc = self.store.retrieve(&descriptor.doc_id).await?;
        let doc_type: DocType = serde_json::from_value(
            doc.get("type")
                .cloned()
                .ok_or_else(|| anyhow::anyhow!("document {} missing type tag", descriptor.doc_id))?,
        )?;

        let job: Box<dyn Job> = match doc_type {
            DocType::Datafile => Box::new(DatafileDownloader {
                store: self.store.clone(),
                blobs: self.blobs.clone(),
                http: reqwest::Client::new(),
                entity: serde_json::from_value::<Datafile>(doc)?,
            }),
            DocType::Dataset => Box::new(DatasetSplitter {
                store: self.store.clone(),
                blobs: self.blobs.clone(),
                http: reqwest::Client::new(),
                entity: serde_json::from_value::<Dataset>(doc)?,
            }),
            DocType::TrainingJob => Box::new(TrainingJobRunner {
                store: self.store.clone(),
                blobs: self.blobs.clone(),
                http: reqwest::Client::new(),
                ctx: self.ctx.clone(),
                entity: serde_json::from_value::<TrainingJob>(doc)?,
            }),
            DocType::ClassifyJob => Box::new(ClassifyJobRunner {
                store: self.store.clone(),
                blobs: self.blobs.clone(),
                ctx: self.ctx.clone(),
                entity: serde_json::from_value::<ClassifyJob>(doc)?,
            }),
            other => return Err(FactoryError::UnsupportedDocType(other).into()),
        };

        Ok(job)
    }
}
