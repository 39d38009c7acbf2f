//! The fail-fast startup probe (spec 6): confirms the blob store is
//! writable and sufficiently replicated, confirms the document store is
//! reachable, and logs (without failing) whether the external binaries are
//! on `PATH` — absence there only matters once a job actually runs.

use et_store::{BlobStore, DocumentStore, PutOptions, bytes_stream};

const PROBE_PATH: &str = "_elasticthought_envcheck_probe";
const PROBE_BODY: &[u8] = b"elasticthought-envcheck";
const REPLICA_POLL_ATTEMPTS: u32 = 20;

/// Runs the blob-store write/read/replication probe and a document-store
/// liveness check. Returns an error (fatal at startup, per spec 7) on any
/// failure; callers should exit the process rather than start serving.
pub async fn run(
    blobs: &dyn BlobStore,
    store: &dyn DocumentStore,
    replica_min: u32,
) -> anyhow::Result<()> {
    blobs
        .put(
            PROBE_PATH,
            bytes_stream(PROBE_BODY.to_vec()),
            PutOptions::default(),
        )
        .await?;

    let mut readback = Vec::new();
    {
        use futures_util::TryStreamExt;
        let mut stream = blobs.get(PROBE_PATH).await?;
        while let Some(chunk) = stream.try_next().await? {
            readback.extend_from_slice(&chunk);
        }
    }
    if readback != PROBE_BODY {
        anyhow::bail!("blob store probe read back different bytes than written");
    }

    if replica_min > 0 {
        poll_replica_count(blobs, replica_min).await?;
    }

    blobs.remove(PROBE_PATH).await?;

    // follow_changes(None) with an empty store returns an empty batch
    // rather than erroring; any `Err` here means the store is unreachable.
    store.follow_changes(None).await?;

    for binary in ["caffe", "classify"] {
        match which::which(binary) {
            Ok(path) => tracing::info!(binary, path = %path.display(), "found external binary on PATH"),
            Err(_) => tracing::warn!(binary, "external binary not found on PATH; jobs that need it will fail at run time"),
        }
    }

    Ok(())
}

async fn poll_replica_count(blobs: &dyn BlobStore, replica_min: u32) -> anyhow::Result<()> {
    for attempt in 1..=REPLICA_POLL_ATTEMPTS {
        let handle = blobs.open_file(PROBE_PATH).await?;
        let nodes = handle.nodes().await?;
        if nodes.len() as u32 >= replica_min {
            return Ok(());
        }
        tracing::info!(
            attempt,
            seen = nodes.len(),
            wanted = replica_min,
            "waiting for blob store replication"
        );
        tokio::time::sleep(std::time::Duration::from_millis(100 * attempt as u64)).await;
    }
    anyhow::bail!(
        "blob store did not reach {replica_min} replicas within {REPLICA_POLL_ATTEMPTS} attempts"
    )
}

#[cfg(test)]
mod tests {
    use super::*;
    use et_store::{MockBlobStore, MockDocumentStore};

    #[tokio::test]
    async fn probe_round_trips_against_mock_store() {
        let blobs = MockBlobStore::new();
        let store = MockDocumentStore::new();
        run(&blobs, &store, 0).await.unwrap();
        assert!(blobs.get_bytes(PROBE_PATH).is_none(), "probe file should be removed after the check");
    }
}
