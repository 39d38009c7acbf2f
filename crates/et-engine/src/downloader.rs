use std::sync::Arc;

use et_core::ProcessingState;
use et_store::{BlobStore, DocumentStore, PutOptions};
use futures_util::{StreamExt, TryStreamExt};

use crate::entities::{Datafile, cas_transition};
use crate::job::Job;

/// Spec 4.6: CAS `pending -> processing`, stream the source URL straight
/// into the blob store preserving Content-Type, CAS to a terminal state.
pub struct DatafileDownloader {
    pub store: Arc<dyn DocumentStore>,
    pub blobs: Arc<dyn BlobStore>,
    pub http: reqwest::Client,
    pub entity: Datafile,
}

impl DatafileDownloader {
    async fn run_inner(&mut self) -> anyhow::Result<()> {
        let became_owner = cas_transition(
            self.store.as_ref(),
            &mut self.entity,
            |e| e.processing_state = ProcessingState::Processing,
            |e| e.processing_state != ProcessingState::Pending,
        )
        .await?;
        if !became_owner {
            return Ok(());
        }

        let resp = self.http.get(&self.entity.url).send().await?;
        let content_type = resp
            .headers()
            .get(reqwest::header::CONTENT_TYPE)
            .and_then(|v| v.to_str().ok())
            .map(str::to_string);
        let path = self.entity.blob_path()?;
        let stream = resp
            .bytes_stream()
            .map_err(|e| et_store::BlobError::Io(e.into()))
            .boxed();
        self.blobs
            .put(&path, stream, PutOptions { content_type })
            .await?;

        let blob_url = self.blobs.public_url(&path);
        cas_transition(
            self.store.as_ref(),
            &mut self.entity,
            move |e| e.url = blob_url.clone(),
            |e| e.url.starts_with(et_store::blob::CBFS_URI_PREFIX),
        )
        .await?;

        cas_transition(
            self.store.as_ref(),
            &mut self.entity,
            |e| e.processing_state = ProcessingState::FinishedSuccessfully,
            |e| e.processing_state.is_terminal(),
        )
        .await?;
        Ok(())
    }
}

#[async_trait::async_trait]
impl Job for DatafileDownloader {
    async fn run(mut self: Box<Self>) -> anyhow::Result<()> {
        if let Err(err) = self.run_inner().await {
            let message = format!("{err:#}");
            let _ = cas_transition(
                self.store.as_ref(),
                &mut self.entity,
                move |e| e.processing_log = message.clone(),
                |e| e.processing_state.is_terminal(),
            )
            .await;
            let _ = cas_transition(
                self.store.as_ref(),
                &mut self.entity,
                |e| e.processing_state = ProcessingState::Failed,
                |e| e.processing_state.is_terminal(),
            )
            .await;
            return Err(err);
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use et_store::MockBlobStore;
    use et_store::MockDocumentStore;

    #[tokio::test]
    async fn unreachable_source_marks_entity_failed() {
        let store: Arc<dyn DocumentStore> = Arc::new(MockDocumentStore::new());
        let blobs: Arc<dyn BlobStore> = Arc::new(MockBlobStore::new());

        let mut entity = Datafile::new("user-1", "http://127.0.0.1:1/unreachable.bin");
        let (id, rev) = store
            .insert(serde_json::to_value(&entity).unwrap())
            .await
            .unwrap();
        entity.header.id = Some(id.clone());
        entity.header.rev = Some(rev);

        let downloader = DatafileDownloader {
            store: store.clone(),
            blobs,
            http: reqwest::Client::new(),
            entity,
        };

        let result = Box::new(downloader).run().await;
        assert!(result.is_err(), "unreachable host should fail the job");

        let refreshed: Datafile =
            serde_json::from_value(store.retrieve(&id).await.unwrap()).unwrap();
        assert_eq!(refreshed.processing_state, ProcessingState::Failed);
        assert!(!refreshed.processing_log.is_empty());
    }
}
