use std::sync::Arc;

use tokio::sync::watch;
use tokio::task::JoinSet;

use et_store::MessageQueue;

use crate::factory::JobFactory;
use crate::job::JobDescriptor;

/// An abstract boundary with two implementations (spec 4.3): in-process
/// (bounded concurrency via wait-group-style backpressure) and
/// external-queue (publish/subscribe). Both must be safe under concurrent
/// `schedule` calls; neither retries a failed job.
#[async_trait::async_trait]
pub trait JobScheduler: Send + Sync {
    async fn schedule(&self, descriptor: JobDescriptor) -> anyhow::Result<()>;
}

/// Serializes jobs to at most one in flight at a time via a
/// wait-group-equivalent counter, the Rust analogue of the original's
/// `sync.WaitGroup` backpressure gate (spec 4.3, design note 9 item 3).
pub struct InProcessScheduler {
    factory: Arc<dyn JobFactory>,
    outstanding: watch::Sender<usize>,
    tasks: tokio::sync::Mutex<JoinSet<()>>,
}

impl InProcessScheduler {
    pub fn new(factory: Arc<dyn JobFactory>) -> Self {
        Self {
            factory,
            outstanding: watch::Sender::new(0),
            tasks: tokio::sync::Mutex::new(JoinSet::new()),
        }
    }

    async fn wait_until_idle(&self) {
        let mut rx = self.outstanding.subscribe();
        // `watch` always holds the latest value, so checking then waiting
        // for a change can never miss the transition to zero the way a
        // bare `Notify` could.
        if *rx.borrow() == 0 {
            return;
        }
        let _ = rx.wait_for(|n| *n == 0).await;
    }
}

#[async_trait::async_trait]
impl JobScheduler for InProcessScheduler {
    async fn schedule(&self, descriptor: JobDescriptor) -> anyhow::Result<()> {
        // 1. Block until no job is outstanding (cooperative backpressure
        //    across peer listeners sharing the same process).
        self.wait_until_idle().await;

        // 2. Build the Runnable via the Job Factory.
        let job = self.factory.create_job(descriptor).await?;

        // 3. Increment outstanding, spawn, decrement on completion.
        self.outstanding.send_modify(|n| *n += 1);
        let outstanding = self.outstanding.clone();
        self.tasks.lock().await.spawn(async move {
            if let Err(err) = job.run().await {
                tracing::error!(error = %err, "job failed");
            }
            outstanding.send_modify(|n| *n -= 1);
        });
        Ok(())
    }
}

/// Serializes the descriptor as JSON and publishes to a named topic;
/// consumption (decode + factory + run) happens in [`QueueWorker`], run by a
/// separate worker process (spec 4.3).
pub struct ExternalQueueScheduler {
    queue: Arc<dyn MessageQueue>,
    topic: String,
}

impl ExternalQueueScheduler {
    pub fn new(queue: Arc<dyn MessageQueue>, topic: impl Into<String>) -> Self {
        Self {
            queue,
            topic: topic.into(),
        }
    }
}

#[async_trait::async_trait]
impl JobScheduler for ExternalQueueScheduler {
    async fn schedule(&self, descriptor: JobDescriptor) -> anyhow::Result<()> {
        let payload = serde_json::to_vec(&descriptor)?;
        self.queue
            .publish(&self.topic, payload)
            .await
            .map_err(|e| anyhow::anyhow!(e))
    }
}

/// Subscribes to the external queue's topic, decodes each payload, and runs
/// it through the job factory — the consumer half of the NSQ-shaped
/// producer/consumer pair (`original_source/nsq_worker.go`), generalized to
/// [`MessageQueue`].
pub struct QueueWorker {
    queue: Arc<dyn MessageQueue>,
    topic: String,
    factory: Arc<dyn JobFactory>,
}

impl QueueWorker {
    pub fn new(queue: Arc<dyn MessageQueue>, topic: impl Into<String>, factory: Arc<dyn JobFactory>) -> Self {
        Self {
            queue,
            topic: topic.into(),
            factory,
        }
    }

    pub async fn run_forever(&self) -> anyhow::Result<()> {
        let mut rx = self
            .queue
            .subscribe(&self.topic)
            .await
            .map_err(|e| anyhow::anyhow!(e))?;

        while let Some(payload) = rx.recv().await {
            let descriptor: JobDescriptor = match serde_json::from_slice(&payload) {
                Ok(d) => d,
                Err(err) => {
                    tracing::warn!(error = %err, "failed to decode queued job descriptor");
                    continue;
                }
            };
            match self.factory.create_job(descriptor).await {
                Ok(job) => {
                    if let Err(err) = job.run().await {
                        tracing::error!(error = %err, "queued job failed");
                    }
                }
                Err(err) => tracing::error!(error = %err, "failed to build job from descriptor"),
            }
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::Duration;
    use tokio::sync::Mutex as AsyncMutex;

    struct OrderRecordingFactory {
        log: Arc<AsyncMutex<Vec<String>>>,
        delay: Duration,
    }

    #[async_trait::async_trait]
    impl JobFactory for OrderRecordingFactory {
        async fn create_job(
            &self,
            descriptor: JobDescriptor,
        ) -> anyhow::Result<Box<dyn crate::job::Job>> {
            Ok(Box::new(RecordingJob {
                id: descriptor.doc_id,
                log: self.log.clone(),
                delay: self.delay,
            }))
        }
    }

    struct RecordingJob {
        id: String,
        log: Arc<AsyncMutex<Vec<String>>>,
        delay: Duration,
    }

    #[async_trait::async_trait]
    impl crate::job::Job for RecordingJob {
        async fn run(self: Box<Self>) -> anyhow::Result<()> {
            self.log.lock().await.push(format!("start:{}", self.id));
            tokio::time::sleep(self.delay).await;
            self.log.lock().await.push(format!("end:{}", self.id));
            Ok(())
        }
    }

    #[tokio::test]
    async fn in_process_scheduler_serializes_jobs() {
        let log = Arc::new(AsyncMutex::new(Vec::new()));
        let factory = Arc::new(OrderRecordingFactory {
            log: log.clone(),
            delay: Duration::from_millis(30),
        });
        let scheduler = Arc::new(InProcessScheduler::new(factory));

        scheduler
            .schedule(JobDescriptor {
                doc_id: "a".into(),
            })
            .await
            .unwrap();
        scheduler
            .schedule(JobDescriptor {
                doc_id: "b".into(),
            })
            .await
            .unwrap();

        tokio::time::sleep(Duration::from_millis(100)).await;
        let entries = log.lock().await.clone();
        assert_eq!(
            entries,
            vec!["start:a", "end:a", "start:b", "end:b"],
            "the second job must not start before the first finishes"
        );
    }
}
