use std::collections::HashMap;
use std::io::{Read, Write};
use std::sync::Arc;

use et_core::ProcessingState;
use et_store::blob::CBFS_URI_PREFIX;
use et_store::{BlobStore, BlobStream, DocumentStore, PutOptions};
use flate2::Compression;
use flate2::write::GzEncoder;
use futures_util::{StreamExt, TryStreamExt};
use tokio_util::io::{ReaderStream, StreamReader, SyncIoBridge};

use crate::entities::{Dataset, Datafile, cas_transition};
use crate::job::Job;

/// Spec 4.5: partitions a gzipped tar archive by directory according to
/// configured ratios, or (when the dataset is not splittable) relays two
/// already-partitioned datafiles straight into the artifact paths.
pub struct DatasetSplitter {
    pub store: Arc<dyn DocumentStore>,
    pub blobs: Arc<dyn BlobStore>,
    pub http: reqwest::Client,
    pub entity: Dataset,
}

impl DatasetSplitter {
    async fn fetch_datafile_url(&self, datafile_id: &str) -> anyhow::Result<String> {
        let doc = self.store.retrieve(datafile_id).await?;
        let datafile: Datafile = serde_json::from_value(doc)?;
        Ok(datafile.url)
    }

    /// A dataset's source references are blob-store URLs once the
    /// referenced datafile has finished downloading; genuinely external
    /// `http(s)://` URLs are also accepted directly (spec 4.5's
    /// non-splittable path describes opening an HTTP stream).
    async fn open_source_stream(&self, url: &str) -> anyhow::Result<BlobStream> {
        if let Some(path) = url.strip_prefix(CBFS_URI_PREFIX) {
            return self.blobs.get(path).await.map_err(Into::into);
        }
        let resp = self.http.get(url).send().await?.error_for_status()?;
        Ok(resp
            .bytes_stream()
            .map_err(|e| et_store::BlobError::Io(e.into()))
            .boxed())
    }

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

        // Write the eventual artifact URLs before the split begins so a
        // client inspecting a `processing` dataset already sees them
        // (supplemented from original_source/dataset.go::AddArtifactUrls).
        let training_path = self.entity.training_artifact_path()?;
        let testing_path = self.entity.testing_artifact_path()?;
        let training_url = self.blobs.public_url(&training_path);
        let testing_url = self.blobs.public_url(&testing_path);
        cas_transition(
            self.store.as_ref(),
            &mut self.entity,
            move |e| {
                e.training.url = training_url.clone();
                e.test.url = testing_url.clone();
            },
            |e| {
                e.training.url.starts_with(CBFS_URI_PREFIX) && e.test.url.starts_with(CBFS_URI_PREFIX)
            },
        )
        .await?;

        if self.entity.is_splittable() {
            self.run_splittable(&training_path, &testing_path).await?;
        } else {
            self.run_relay(&training_path, &testing_path).await?;
        }

        cas_transition(
            self.store.as_ref(),
            &mut self.entity,
            |e| e.processing_state = ProcessingState::FinishedSuccessfully,
            |e| e.processing_state.is_terminal(),
        )
        .await?;
        Ok(())
    }

    async fn run_relay(&self, training_path: &str, testing_path: &str) -> anyhow::Result<()> {
        let train_src = self.fetch_datafile_url(&self.entity.training.datafile_id).await?;
        let train_stream = self.open_source_stream(&train_src).await?;
        self.blobs
            .put(training_path, train_stream, PutOptions::default())
            .await?;

        let test_src = self.fetch_datafile_url(&self.entity.test.datafile_id).await?;
        let test_stream = self.open_source_stream(&test_src).await?;
        self.blobs
            .put(testing_path, test_stream, PutOptions::default())
            .await?;
        Ok(())
    }

    async fn run_splittable(&self, training_path: &str, testing_path: &str) -> anyhow::Result<()> {
        let source_url = self.fetch_datafile_url(&self.entity.training.datafile_id).await?;
        let source_stream = self.open_source_stream(&source_url).await?;
        let source_reader = StreamReader::new(
            source_stream.map_err(|e| std::io::Error::new(std::io::ErrorKind::Other, e)),
        );

        let (train_pipe_r, train_pipe_w) = tokio::io::duplex(64 * 1024);
        let (test_pipe_r, test_pipe_w) = tokio::io::duplex(64 * 1024);

        let train_ratio = self.entity.training.split_percentage;
        let test_ratio = self.entity.test.split_percentage;

        let transform = tokio::task::spawn_blocking(move || {
            let source = SyncIoBridge::new(source_reader);
            let train_sink = SyncIoBridge::new(train_pipe_w);
            let test_sink = SyncIoBridge::new(test_pipe_w);
            transform_split(source, train_sink, test_sink, train_ratio, test_ratio)
        });

        let upload_train = tokio::spawn(upload_pipe(
            self.blobs.clone(),
            training_path.to_string(),
            train_pipe_r,
        ));
        let upload_test = tokio::spawn(upload_pipe(
            self.blobs.clone(),
            testing_path.to_string(),
            test_pipe_r,
        ));

        let (transform_res, train_res, test_res) = tokio::join!(transform, upload_train, upload_test);

        let mut errors = Vec::new();
        match transform_res {
            Ok(Ok(())) => {}
            Ok(Err(e)) => errors.push(format!("transform: {e:#}")),
            Err(e) => errors.push(format!("transform task panicked: {e}")),
        }
        match train_res {
            Ok(Ok(())) => {}
            Ok(Err(e)) => errors.push(format!("upload training: {e:#}")),
            Err(e) => errors.push(format!("upload training task panicked: {e}")),
        }
        match test_res {
            Ok(Ok(())) => {}
            Ok(Err(e)) => errors.push(format!("upload testing: {e:#}")),
            Err(e) => errors.push(format!("upload testing task panicked: {e}")),
        }

        if !errors.is_empty() {
            anyhow::bail!(errors.join("; "));
        }
        Ok(())
    }
}

async fn upload_pipe(
    blobs: Arc<dyn BlobStore>,
    path: String,
    reader: tokio::io::DuplexStream,
) -> anyhow::Result<()> {
    let stream = ReaderStream::new(reader)
        .map_err(|e| et_store::BlobError::Io(e.into()))
        .boxed();
    blobs.put(&path, stream, PutOptions::default()).await?;
    Ok(())
}

/// Validates that `path` is exactly two components deep with no hidden
/// (leading-`.`) segment, per spec 4.5's validation invariant.
fn validate_entry_path(path: &str) -> anyhow::Result<&str> {
    let mut parts = path.split('/');
    let dir = parts.next().filter(|s| !s.is_empty() && !s.starts_with('.'));
    let file = parts.next().filter(|s| !s.is_empty() && !s.starts_with('.'));
    if parts.next().is_some() || dir.is_none() || file.is_none() {
        anyhow::bail!("invalid archive entry path {path:?}: expected <dir>/<file> with no hidden segments");
    }
    Ok(dir.unwrap())
}

/// The single-pass directory-local ratio partition (spec 4.5). Runs on a
/// blocking thread since `tar`/`flate2` are synchronous; `source`, `train`,
/// and `test` are synchronous bridges over the async pipes.
fn transform_split(
    source: impl Read,
    train_sink: impl Write,
    test_sink: impl Write,
    train_ratio: f64,
    test_ratio: f64,
) -> anyhow::Result<()> {
    let mut archive = tar::Archive::new(source);
    let mut train_tar = tar::Builder::new(GzEncoder::new(train_sink, Compression::default()));
    let mut test_tar = tar::Builder::new(GzEncoder::new(test_sink, Compression::default()));

    let mut counters: HashMap<String, (f64, f64)> = HashMap::new();

    for entry in archive.entries()? {
        let mut entry = entry?;
        let path = entry.path()?.to_string_lossy().into_owned();
        let dir = validate_entry_path(&path)?.to_string();

        let mut data = Vec::new();
        entry.read_to_end(&mut data)?;
        let mut header = entry.header().clone();

        let counter = counters.entry(dir).or_insert((0.0, 0.0));
        let route_train = counter.0 * test_ratio <= counter.1 * train_ratio;
        if route_train {
            counter.0 += 1.0;
            train_tar.append_data(&mut header, &path, data.as_slice())?;
        } else {
            counter.1 += 1.0;
            test_tar.append_data(&mut header, &path, data.as_slice())?;
        }
    }

    // Critical close order (spec 4.5 / 9): inner encoders (tar, then gzip)
    // before the outer pipe write ends, or the reader side deadlocks
    // waiting for EOF that never arrives.
    let train_gz = train_tar.into_inner()?;
    let test_gz = test_tar.into_inner()?;
    let mut train_pipe = train_gz.finish()?;
    let mut test_pipe = test_gz.finish()?;
    train_pipe.flush()?;
    test_pipe.flush()?;
    drop(train_pipe);
    drop(test_pipe);
    Ok(())
}

#[async_trait::async_trait]
impl Job for DatasetSplitter {
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
    use flate2::write::GzEncoder;
    use std::io::Write as _;
    use tar::Header;

    fn build_seed_archive() -> Vec<u8> {
        let gz = GzEncoder::new(Vec::new(), Compression::default());
        let mut builder = tar::Builder::new(gz);
        let entries = [
            "foo/1.txt", "foo/2.txt", "bar/1.txt", "bar/2.txt", "bar/3.txt", "bar/4.txt",
            "bar/5.txt",
        ];
        for name in entries {
            let data = name.as_bytes();
            let mut header = Header::new_gnu();
            header.set_size(data.len() as u64);
            header.set_mode(0o644);
            header.set_cksum();
            builder.append_data(&mut header, name, data).unwrap();
        }
        builder.into_inner().unwrap().finish().unwrap()
    }

    fn split_counts(archive_bytes: &[u8], train_ratio: f64, test_ratio: f64) -> (Vec<String>, Vec<String>) {
        let mut train_out = Vec::new();
        let mut test_out = Vec::new();
        transform_split(
            archive_bytes,
            &mut train_out,
            &mut test_out,
            train_ratio,
            test_ratio,
        )
        .unwrap();

        (names_in(&train_out), names_in(&test_out))
    }

    fn names_in(gz_tar: &[u8]) -> Vec<String> {
        let decoder = flate2::read::GzDecoder::new(gz_tar);
        let mut archive = tar::Archive::new(decoder);
        archive
            .entries()
            .unwrap()
            .map(|e| e.unwrap().path().unwrap().to_string_lossy().into_owned())
            .collect()
    }

    #[test]
    fn seed_scenario_split_50_50() {
        let archive = build_seed_archive();
        let (train, test) = split_counts(&archive, 0.5, 0.5);

        let train_foo = train.iter().filter(|p| p.starts_with("foo/")).count();
        let train_bar = train.iter().filter(|p| p.starts_with("bar/")).count();
        assert_eq!(train_foo, 1);
        assert!((2..=3).contains(&train_bar));

        let mut all: Vec<String> = train.iter().chain(test.iter()).cloned().collect();
        all.sort();
        let mut expected = vec![
            "foo/1.txt", "foo/2.txt", "bar/1.txt", "bar/2.txt", "bar/3.txt", "bar/4.txt",
            "bar/5.txt",
        ];
        expected.sort();
        assert_eq!(all, expected);

        let train_set: std::collections::HashSet<_> = train.iter().collect();
        let test_set: std::collections::HashSet<_> = test.iter().collect();
        assert!(train_set.is_disjoint(&test_set));
    }

    #[test]
    fn seed_scenario_split_80_20() {
        let archive = build_seed_archive();
        let (train, test) = split_counts(&archive, 0.8, 0.2);

        let train_foo = train.iter().filter(|p| p.starts_with("foo/")).count();
        let train_bar = train.iter().filter(|p| p.starts_with("bar/")).count();
        let test_foo = test.iter().filter(|p| p.starts_with("foo/")).count();
        let test_bar = test.iter().filter(|p| p.starts_with("bar/")).count();

        assert_eq!(train_foo, 1);
        assert_eq!(train_bar, 4);
        assert_eq!(test_foo, 1);
        assert_eq!(test_bar, 1);
    }

    #[test]
    fn round_trip_preserves_bytes() {
        let archive = build_seed_archive();
        let mut train_out = Vec::new();
        let mut test_out = Vec::new();
        transform_split(archive.as_slice(), &mut train_out, &mut test_out, 1.0, 0.0).unwrap();

        let decoder = flate2::read::GzDecoder::new(train_out.as_slice());
        let mut archive = tar::Archive::new(decoder);
        for entry in archive.entries().unwrap() {
            let mut entry = entry.unwrap();
            let name = entry.path().unwrap().to_string_lossy().into_owned();
            let mut bytes = Vec::new();
            entry.read_to_end(&mut bytes).unwrap();
            assert_eq!(bytes, name.as_bytes());
        }
    }

    #[test]
    fn hidden_entry_is_rejected() {
        assert!(validate_entry_path(".hidden/1.txt").is_err());
        assert!(validate_entry_path("foo/.hidden").is_err());
        assert!(validate_entry_path("onecomponent").is_err());
        assert!(validate_entry_path("a/b/c").is_err());
        assert!(validate_entry_path("a/b").is_ok());
    }

    async fn insert_datafile(
        store: &Arc<dyn DocumentStore>,
        blobs: &Arc<dyn BlobStore>,
        blob_path: &str,
        bytes: Vec<u8>,
    ) -> String {
        blobs
            .put(blob_path, et_store::blob::bytes_stream(bytes), PutOptions::default())
            .await
            .unwrap();
        let datafile = Datafile::new("user-1", blobs.public_url(blob_path));
        let (id, _rev) = store
            .insert(serde_json::to_value(&datafile).unwrap())
            .await
            .unwrap();
        id
    }

    async fn insert_dataset(store: &Arc<dyn DocumentStore>, dataset: &Dataset) -> (String, String) {
        store
            .insert(serde_json::to_value(dataset).unwrap())
            .await
            .unwrap()
    }

    #[tokio::test]
    async fn splittable_dataset_writes_artifact_urls_before_split_and_finishes_successfully() {
        let store: Arc<dyn DocumentStore> = Arc::new(et_store::MockDocumentStore::new());
        let blobs_mock = Arc::new(et_store::MockBlobStore::new());
        let blobs: Arc<dyn BlobStore> = blobs_mock.clone();

        let datafile_id = insert_datafile(&store, &blobs, "seed/archive.tar.gz", build_seed_archive()).await;

        let mut dataset = Dataset {
            header: et_core::DocumentHeader::new(et_core::DocType::Dataset),
            training: crate::entities::TrainingDatasetRef {
                datafile_id: datafile_id.clone(),
                split_percentage: 0.5,
                url: String::new(),
            },
            test: crate::entities::TrainingDatasetRef {
                datafile_id: datafile_id.clone(),
                split_percentage: 0.5,
                url: String::new(),
            },
            processing_state: ProcessingState::Pending,
            processing_log: String::new(),
        };
        let (dataset_id, rev) = insert_dataset(&store, &dataset).await;
        dataset.header.id = Some(dataset_id.clone());
        dataset.header.rev = Some(rev);

        let splitter = DatasetSplitter {
            store: store.clone(),
            blobs: blobs.clone(),
            http: reqwest::Client::new(),
            entity: dataset,
        };

        Box::new(splitter).run().await.unwrap();

        let refreshed: Dataset =
            serde_json::from_value(store.retrieve(&dataset_id).await.unwrap()).unwrap();
        assert_eq!(refreshed.processing_state, ProcessingState::FinishedSuccessfully);
        // Spec's pre-split artifact-URL write: both references point into the
        // blob store at the configured training/testing paths, not the
        // placeholder empty strings the dataset was created with.
        assert_eq!(refreshed.training.url, format!("{CBFS_URI_PREFIX}{dataset_id}/training.tar.gz"));
        assert_eq!(refreshed.test.url, format!("{CBFS_URI_PREFIX}{dataset_id}/testing.tar.gz"));

        let train_names = names_in(&blobs_mock.get_bytes(&format!("{dataset_id}/training.tar.gz")).unwrap());
        let test_names = names_in(&blobs_mock.get_bytes(&format!("{dataset_id}/testing.tar.gz")).unwrap());
        let mut all: Vec<String> = train_names.iter().chain(test_names.iter()).cloned().collect();
        all.sort();
        let mut expected = vec![
            "foo/1.txt", "foo/2.txt", "bar/1.txt", "bar/2.txt", "bar/3.txt", "bar/4.txt",
            "bar/5.txt",
        ];
        expected.sort();
        assert_eq!(all, expected);
    }

    #[tokio::test]
    async fn non_splittable_dataset_relays_each_reference_directly() {
        let store: Arc<dyn DocumentStore> = Arc::new(et_store::MockDocumentStore::new());
        let blobs_mock = Arc::new(et_store::MockBlobStore::new());
        let blobs: Arc<dyn BlobStore> = blobs_mock.clone();

        let train_datafile_id =
            insert_datafile(&store, &blobs, "train-src/a.tar.gz", b"training bytes".to_vec()).await;
        let test_datafile_id =
            insert_datafile(&store, &blobs, "test-src/b.tar.gz", b"testing bytes".to_vec()).await;

        let mut dataset = Dataset {
            header: et_core::DocumentHeader::new(et_core::DocType::Dataset),
            training: crate::entities::TrainingDatasetRef {
                datafile_id: train_datafile_id,
                split_percentage: 0.0,
                url: String::new(),
            },
            test: crate::entities::TrainingDatasetRef {
                datafile_id: test_datafile_id,
                split_percentage: 0.0,
                url: String::new(),
            },
            processing_state: ProcessingState::Pending,
            processing_log: String::new(),
        };
        let (dataset_id, rev) = insert_dataset(&store, &dataset).await;
        dataset.header.id = Some(dataset_id.clone());
        dataset.header.rev = Some(rev);

        let splitter = DatasetSplitter {
            store: store.clone(),
            blobs: blobs.clone(),
            http: reqwest::Client::new(),
            entity: dataset,
        };

        Box::new(splitter).run().await.unwrap();

        let refreshed: Dataset =
            serde_json::from_value(store.retrieve(&dataset_id).await.unwrap()).unwrap();
        assert_eq!(refreshed.processing_state, ProcessingState::FinishedSuccessfully);
        assert_eq!(
            blobs_mock.get_bytes(&format!("{dataset_id}/training.tar.gz")).unwrap(),
            b"training bytes".to_vec()
        );
        assert_eq!(
            blobs_mock.get_bytes(&format!("{dataset_id}/testing.tar.gz")).unwrap(),
            b"testing bytes".to_vec()
        );
    }

    #[tokio::test]
    async fn missing_source_datafile_marks_dataset_failed() {
        let store: Arc<dyn DocumentStore> = Arc::new(et_store::MockDocumentStore::new());
        let blobs: Arc<dyn BlobStore> = Arc::new(et_store::MockBlobStore::new());

        let mut dataset = Dataset {
            header: et_core::DocumentHeader::new(et_core::DocType::Dataset),
            training: crate::entities::TrainingDatasetRef {
                datafile_id: "nonexistent-datafile".to_string(),
                split_percentage: 0.0,
                url: String::new(),
            },
            test: crate::entities::TrainingDatasetRef {
                datafile_id: "also-nonexistent".to_string(),
                split_percentage: 0.0,
                url: String::new(),
            },
            processing_state: ProcessingState::Pending,
            processing_log: String::new(),
        };
        let (dataset_id, rev) = insert_dataset(&store, &dataset).await;
        dataset.header.id = Some(dataset_id.clone());
        dataset.header.rev = Some(rev);

        let splitter = DatasetSplitter {
            store: store.clone(),
            blobs,
            http: reqwest::Client::new(),
            entity: dataset,
        };

        assert!(Box::new(splitter).run().await.is_err());

        let refreshed: Dataset =
            serde_json::from_value(store.retrieve(&dataset_id).await.unwrap()).unwrap();
        assert_eq!(refreshed.processing_state, ProcessingState::Failed);
        assert!(!refreshed.processing_log.is_empty());
    }
}
