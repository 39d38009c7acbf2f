mod cli;

use std::sync::Arc;

use clap::Parser;
use et_core::SchedulerKind;
use et_engine::{
    ChangesListener, DocumentJobFactory, ExternalQueueScheduler, InProcessScheduler, JobFactory,
    JobScheduler, QueueWorker,
};
use et_store::{DocumentStore, InMemoryQueue, MockDocumentStore, new_blob_store};

use crate::cli::Cli;

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(tracing_subscriber::EnvFilter::from_default_env())
        .init();

    let cli = Cli::parse();
    let queue_workers = cli.queue_workers;
    let config = Arc::new(cli.into_configuration());

    tracing::info!(
        blob_store_url = %config.blob_store_url,
        scheduler_type = %config.scheduler_type,
        work_directory = %config.work_directory.display(),
        "starting elasticthought worker"
    );

    let blobs: Arc<dyn et_store::BlobStore> = Arc::from(new_blob_store(&config.blob_store_url)?);

    // The real document store is an external collaborator (spec 1); this
    // crate ships only the in-process mock, per et-store/src/document.rs.
    let store: Arc<dyn DocumentStore> = Arc::new(MockDocumentStore::new());

    et_engine::envcheck::run(blobs.as_ref(), store.as_ref(), config.blob_store_replica_min)
        .await
        .map_err(|err| anyhow::anyhow!("environment sanity check failed, refusing to start: {err:#}"))?;

    let factory: Arc<dyn JobFactory> = Arc::new(DocumentJobFactory {
        store: store.clone(),
        blobs: blobs.clone(),
        ctx: config.clone(),
    });

    let scheduler: Arc<dyn JobScheduler> = match config.scheduler_type {
        SchedulerKind::InProcess => Arc::new(InProcessScheduler::new(factory.clone())),
        SchedulerKind::ExternalQueue => {
            let queue = Arc::new(InMemoryQueue::new());
            let topic = config
                .queue_topic
                .clone()
                .unwrap_or_else(|| "elasticthought-jobs".to_string());

            for worker_idx in 0..queue_workers {
                let worker = QueueWorker::new(queue.clone(), topic.clone(), factory.clone());
                tokio::spawn(async move {
                    if let Err(err) = worker.run_forever().await {
                        tracing::error!(worker_idx, error = %err, "queue worker terminated");
                    }
                });
            }

            Arc::new(ExternalQueueScheduler::new(queue, topic))
        }
    };

    let listener = ChangesListener::new(store.clone(), scheduler.clone());

    tokio::select! {
        result = listener.follow_forever() => {
            // Spec 4.2: decode errors on individual batches are swallowed by
            // the listener itself and retried; reaching here means the
            // listener hit a fatal condition and the process must exit.
            match result {
                Ok(()) => unreachable!("follow_forever only returns on error"),
                Err(err) => Err(anyhow::anyhow!("change-feed listener terminated fatally: {err:#}")),
            }
        }
        signal = tokio::signal::ctrl_c() => {
            signal?;
            tracing::info!("received shutdown signal");
            Ok(())
        }
    }
}
