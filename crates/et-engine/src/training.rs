use std::path::{Path, PathBuf};
use std::process::Stdio;
use std::sync::Arc;

use et_core::{JobContext, ProcessingState};
use et_store::{BlobStore, DocumentStore, PutOptions, bytes_stream};
use tokio::io::{AsyncReadExt, AsyncWriteExt};

use crate::entities::{Dataset, InputLayerType, Solver, TrainingJob, cas_transition};
use crate::fetch::{fetch_to_file, fetch_to_string};
use crate::job::Job;
use crate::prototxt::{Document, block_field, set_block_field};

const TRAINING_BINARY: &str = "caffe";

/// Materializes a solver's specs and datasets into a working directory,
/// invokes the external training binary, and publishes the resulting
/// stdio/model artifacts (spec 4.7).
pub struct TrainingJobRunner {
    pub store: Arc<dyn DocumentStore>,
    pub blobs: Arc<dyn BlobStore>,
    pub http: reqwest::Client,
    pub ctx: JobContext,
    pub entity: TrainingJob,
}

impl TrainingJobRunner {
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

        let job_id = self
            .entity
            .header
            .id
            .clone()
            .ok_or_else(|| anyhow::anyhow!("training job has no id"))?;
        let work_dir = self.ctx.job_work_dir(&job_id);
        tokio::fs::create_dir_all(&work_dir).await?;

        let solver_doc = self.store.retrieve(&self.entity.solver_id).await?;
        let solver: Solver = serde_json::from_value(solver_doc)?;

        let solver_url = solver
            .specification_url
            .as_deref()
            .ok_or_else(|| anyhow::anyhow!("solver {} has no specification url", solver.dataset_id))?;
        let net_url = solver
            .net_specification_url
            .as_deref()
            .ok_or_else(|| anyhow::anyhow!("solver {} has no net specification url", solver.dataset_id))?;

        let solver_text = fetch_to_string(self.blobs.as_ref(), &self.http, solver_url).await?;
        let net_text = fetch_to_string(self.blobs.as_ref(), &self.http, net_url).await?;
        let mut solver_spec = Document::parse(&solver_text)?;
        let mut net_spec = Document::parse(&net_text)?;

        solver_spec.set_scalar("net", "solver-net.prototxt");
        solver_spec.set_scalar("snapshot_prefix", "snapshot");

        let dataset_doc = self.store.retrieve(&solver.dataset_id).await?;
        let dataset: Dataset = serde_json::from_value(dataset_doc)?;

        let training_archive = work_dir.join("training.tar.gz");
        let testing_archive = work_dir.join("testing.tar.gz");
        fetch_to_file(self.blobs.as_ref(), &self.http, &dataset.training.url, &training_archive).await?;
        fetch_to_file(self.blobs.as_ref(), &self.http, &dataset.test.url, &testing_archive).await?;

        let training_dir = work_dir.join("training-data");
        let test_dir = work_dir.join("test-data");
        let training_archive_for_task = training_archive.clone();
        let testing_archive_for_task = testing_archive.clone();
        let training_dir_for_task = training_dir.clone();
        let test_dir_for_task = test_dir.clone();
        let (train_toc, test_toc) = tokio::task::spawn_blocking(move || {
            let train_toc = extract_with_toc(&training_archive_for_task, &training_dir_for_task)?;
            let test_toc = extract_with_toc(&testing_archive_for_task, &test_dir_for_task)?;
            anyhow::Ok((train_toc, test_toc))
        })
        .await??;

        match solver.input_layer_type {
            InputLayerType::ImageIndex => {
                let (label_index, train_rewritten) = build_label_index(&train_toc);
                let test_rewritten = apply_label_index(&test_toc, &label_index)?;

                cas_transition(
                    self.store.as_ref(),
                    &mut self.entity,
                    {
                        let label_index = label_index.clone();
                        move |e| e.label_index = label_index.clone()
                    },
                    |e| !e.label_index.is_empty(),
                )
                .await?;

                let train_index_path = work_dir.join("train-index.txt");
                let test_index_path = work_dir.join("test-index.txt");
                tokio::fs::write(&train_index_path, train_rewritten.join("\n")).await?;
                tokio::fs::write(&test_index_path, test_rewritten.join("\n")).await?;

                for block in net_spec.blocks_mut("layer") {
                    match block_field(block, "phase") {
                        Some("TRAIN") => set_block_field(block, "source", "train-index.txt"),
                        Some("TEST") => set_block_field(block, "source", "test-index.txt"),
                        _ => {}
                    }
                }
            }
            InputLayerType::NativeData => {
                for block in net_spec.blocks_mut("layer") {
                    match block_field(block, "phase") {
                        Some("TRAIN") => set_block_field(block, "source", "training-data"),
                        Some("TEST") => set_block_field(block, "source", "test-data"),
                        _ => {}
                    }
                }
            }
        }

        let rendered_solver = solver_spec.render();
        let rendered_net = net_spec.render();
        tokio::fs::write(work_dir.join("solver.prototxt"), &rendered_solver).await?;
        tokio::fs::write(work_dir.join("solver-net.prototxt"), &rendered_net).await?;

        self.blobs
            .put(
                &solver.solver_spec_path()?,
                bytes_stream(rendered_solver.clone().into_bytes()),
                PutOptions { content_type: Some("text/plain".to_string()) },
            )
            .await?;
        self.blobs
            .put(
                &solver.net_spec_path()?,
                bytes_stream(rendered_net.into_bytes()),
                PutOptions { content_type: Some("text/plain".to_string()) },
            )
            .await?;

        run_training_binary(&work_dir).await?;

        let stdout_path = work_dir.join("stdout");
        let stderr_path = work_dir.join("stderr");
        let stdout_url = upload_file(self.blobs.as_ref(), &self.entity.stdout_path()?, &stdout_path).await?;
        let stderr_url = upload_file(self.blobs.as_ref(), &self.entity.stderr_path()?, &stderr_path).await?;
        cas_transition(
            self.store.as_ref(),
            &mut self.entity,
            {
                let stdout_url = stdout_url.clone();
                let stderr_url = stderr_url.clone();
                move |e| {
                    e.stdout_url = Some(stdout_url.clone());
                    e.stderr_url = Some(stderr_url.clone());
                }
            },
            |e| e.stdout_url.is_some() && e.stderr_url.is_some(),
        )
        .await?;

        let max_iter = solver_spec
            .scalar("max_iter")
            .ok_or_else(|| anyhow::anyhow!("solver spec has no max_iter field"))?
            .to_string();
        let model_filename = format!("snapshot_iter_{max_iter}.caffemodel");
        let model_path = work_dir.join(&model_filename);
        let model_url = upload_file(self.blobs.as_ref(), &self.entity.model_path()?, &model_path).await?;
        cas_transition(
            self.store.as_ref(),
            &mut self.entity,
            {
                let model_url = model_url.clone();
                move |e| e.trained_model_url = Some(model_url.clone())
            },
            |e| e.trained_model_url.is_some(),
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

async fn upload_file(blobs: &dyn BlobStore, path: &str, local: &Path) -> anyhow::Result<String> {
    let bytes = tokio::fs::read(local).await?;
    blobs.put(path, bytes_stream(bytes), PutOptions::default()).await?;
    Ok(blobs.public_url(path))
}

async fn run_training_binary(work_dir: &Path) -> anyhow::Result<()> {
    let mut child = tokio::process::Command::new(TRAINING_BINARY)
        .arg("train")
        .arg("--solver=solver.prototxt")
        .current_dir(work_dir)
        .stdout(Stdio::piped())
        .stderr(Stdio::piped())
        .spawn()?;

    let stdout = child.stdout.take().expect("piped stdout");
    let stderr = child.stderr.take().expect("piped stderr");
    let stdout_task = tokio::spawn(tee_to_file_and_sink(
        stdout,
        work_dir.join("stdout"),
        Box::new(tokio::io::stdout()),
    ));
    let stderr_task = tokio::spawn(tee_to_file_and_sink(
        stderr,
        work_dir.join("stderr"),
        Box::new(tokio::io::stderr()),
    ));

    let status = child.wait().await?;
    let (stdout_res, stderr_res) = tokio::try_join!(stdout_task, stderr_task)?;
    stdout_res?;
    stderr_res?;

    if !status.success() {
        anyhow::bail!("{TRAINING_BINARY} train exited with status {status}");
    }
    Ok(())
}

/// Fans a child process stream out to a local file and the parent's own
/// stdio simultaneously — the Rust analogue of `io.MultiWriter` (spec 4.7
/// step 6).
async fn tee_to_file_and_sink(
    mut reader: impl tokio::io::AsyncRead + Unpin,
    file_path: PathBuf,
    mut sink: Box<dyn tokio::io::AsyncWrite + Unpin + Send>,
) -> anyhow::Result<()> {
    let mut file = tokio::fs::File::create(&file_path).await?;
    let mut buf = [0u8; 8192];
    loop {
        let n = reader.read(&mut buf).await?;
        if n == 0 {
            break;
        }
        file.write_all(&buf[..n]).await?;
        sink.write_all(&buf[..n]).await?;
    }
    file.flush().await?;
    sink.flush().await?;
    Ok(())
}

fn extract_with_toc(archive_path: &Path, target_dir: &Path) -> anyhow::Result<Vec<String>> {
    std::fs::create_dir_all(target_dir)?;
    let file = std::fs::File::open(archive_path)?;
    let decoder = flate2::read::GzDecoder::new(file);
    let mut archive = tar::Archive::new(decoder);
    let mut toc = Vec::new();
    for entry in archive.entries()? {
        let mut entry = entry?;
        let rel = entry.path()?.to_string_lossy().into_owned();
        let dest = target_dir.join(&rel);
        if let Some(parent) = dest.parent() {
            std::fs::create_dir_all(parent)?;
        }
        entry.unpack(&dest)?;
        toc.push(rel);
    }
    Ok(toc)
}

/// Assigns a running integer label that increments each time the directory
/// component changes, walking the TOC in order (spec 4.7 step 5 / seed
/// scenario 5).
fn build_label_index(toc: &[String]) -> (Vec<String>, Vec<String>) {
    let mut label_index = Vec::new();
    let mut rewritten = Vec::new();
    let mut current_dir: Option<String> = None;
    let mut label: i64 = -1;

    for path in toc {
        let dir = path.split('/').next().unwrap_or("").to_string();
        if current_dir.as_deref() != Some(dir.as_str()) {
            label += 1;
            label_index.push(dir.clone());
            current_dir = Some(dir);
        }
        rewritten.push(format!("{path} {label}"));
    }
    (label_index, rewritten)
}

/// Translates a second TOC (the test set) through labels already assigned
/// from the training TOC, rather than assigning fresh ones.
fn apply_label_index(toc: &[String], label_index: &[String]) -> anyhow::Result<Vec<String>> {
    toc.iter()
        .map(|path| {
            let dir = path.split('/').next().unwrap_or("");
            let label = label_index
                .iter()
                .position(|d| d == dir)
                .ok_or_else(|| anyhow::anyhow!("directory {dir:?} absent from training label index"))?;
            Ok(format!("{path} {label}"))
        })
        .collect()
}

#[async_trait::async_trait]
impl Job for TrainingJobRunner {
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

    #[test]
    fn label_index_matches_seed_scenario() {
        let toc = vec![
            "foo/1".to_string(),
            "foo/2".to_string(),
            "bar/1".to_string(),
            "bar/2".to_string(),
        ];
        let (label_index, rewritten) = build_label_index(&toc);
        assert_eq!(label_index, vec!["foo", "bar"]);
        assert_eq!(
            rewritten,
            vec!["foo/1 0", "foo/2 0", "bar/1 1", "bar/2 1"]
        );
    }

    #[test]
    fn test_toc_reuses_training_label_assignments() {
        let label_index = vec!["foo".to_string(), "bar".to_string()];
        let toc = vec!["bar/9".to_string(), "foo/9".to_string()];
        let rewritten = apply_label_index(&toc, &label_index).unwrap();
        assert_eq!(rewritten, vec!["bar/9 1", "foo/9 0"]);
    }

    #[test]
    fn unknown_directory_is_rejected() {
        let label_index = vec!["foo".to_string()];
        let toc = vec!["baz/1".to_string()];
        assert!(apply_label_index(&toc, &label_index).is_err());
    }
}
