use std::path::{Path, PathBuf};
use std::process::Stdio;
use std::sync::Arc;

use et_core::{JobContext, ProcessingState};
use et_store::{BlobStore, DocumentStore, PutOptions, bytes_stream};
use sha1::{Digest, Sha1};

use crate::entities::{Classifier, ClassifyJob, InputLayerType, Solver, TrainingJob, cas_transition};
use crate::fetch::fetch_to_file;
use crate::job::Job;

const CLASSIFY_BINARY: &str = "classify";

/// Analogous to [`crate::training::TrainingJobRunner`] but simpler:
/// materializes the classifier spec, the trained model, and each input
/// image, invokes the classification script, and translates its results
/// through the training job's label index when applicable (spec 4.8).
pub struct ClassifyJobRunner {
    pub store: Arc<dyn DocumentStore>,
    pub blobs: Arc<dyn BlobStore>,
    pub ctx: JobContext,
    pub entity: ClassifyJob,
}

impl ClassifyJobRunner {
    async fn run_inner(&mut self) -> anyhow::Result<()> {
        let http = reqwest::Client::new();
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
            .ok_or_else(|| anyhow::anyhow!("classify job has no id"))?;
        let work_dir = self.ctx.job_work_dir(&job_id);
        tokio::fs::create_dir_all(&work_dir).await?;

        let classifier_doc = self.store.retrieve(&self.entity.classifier_id).await?;
        let classifier: Classifier = serde_json::from_value(classifier_doc)?;

        let training_job_doc = self.store.retrieve(&classifier.training_job_id).await?;
        let training_job: TrainingJob = serde_json::from_value(training_job_doc)?;

        let solver_doc = self.store.retrieve(&training_job.solver_id).await?;
        let solver: Solver = serde_json::from_value(solver_doc)?;

        let classifier_spec_local = work_dir.join("classifier.prototxt");
        fetch_to_file(
            self.blobs.as_ref(),
            &http,
            &classifier.specification_url,
            &classifier_spec_local,
        )
        .await?;

        let model_local = work_dir.join("trained.caffemodel");
        let model_url = training_job
            .trained_model_url
            .as_deref()
            .ok_or_else(|| anyhow::anyhow!("training job {} has no trained model", classifier.training_job_id))?;
        fetch_to_file(self.blobs.as_ref(), &http, model_url, &model_local).await?;

        let mut fingerprints = Vec::with_capacity(self.entity.image_urls.len());
        for image_url in &self.entity.image_urls {
            let fingerprint = sha1_hex(image_url);
            let dest = work_dir.join(format!("{fingerprint}.img"));
            let blob_path = self.entity.image_blob_path(&fingerprint)?;
            fetch_to_file(self.blobs.as_ref(), &http, &self.blobs.public_url(&blob_path), &dest).await?;
            fingerprints.push(fingerprint);
        }

        run_classify_binary(&work_dir, &classifier).await?;

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

        let results_path = work_dir.join("results.txt");
        let raw_results = parse_result_file(&results_path).await?;

        let translated = match solver.input_layer_type {
            InputLayerType::ImageIndex => {
                translate_labels(&raw_results, &training_job.label_index)?
            }
            InputLayerType::NativeData => raw_results,
        };

        let had_no_images = self.entity.image_urls.is_empty();
        cas_transition(
            self.store.as_ref(),
            &mut self.entity,
            {
                let translated = translated.clone();
                move |e| e.results = translated.clone()
            },
            move |e| !e.results.is_empty() || had_no_images,
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

fn sha1_hex(input: &str) -> String {
    let mut hasher = Sha1::new();
    hasher.update(input.as_bytes());
    hex::encode(hasher.finalize())
}

async fn upload_file(blobs: &dyn BlobStore, path: &str, local: &Path) -> anyhow::Result<String> {
    let bytes = tokio::fs::read(local).await?;
    blobs.put(path, bytes_stream(bytes), PutOptions::default()).await?;
    Ok(blobs.public_url(path))
}

async fn run_classify_binary(work_dir: &Path, classifier: &Classifier) -> anyhow::Result<()> {
    let mut cmd = tokio::process::Command::new(CLASSIFY_BINARY);
    cmd.arg("--scale")
        .arg(classifier.scale.to_string())
        .arg("--image-width")
        .arg(classifier.image_width.to_string())
        .arg("--image-height")
        .arg(classifier.image_height.to_string())
        .current_dir(work_dir)
        .stdout(Stdio::piped())
        .stderr(Stdio::piped());
    if classifier.color {
        cmd.arg("--color");
    }
    if classifier.gpu {
        cmd.arg("--gpu");
    }

    let mut child = cmd.spawn()?;
    let stdout_file = work_dir.join("stdout");
    let stderr_file = work_dir.join("stderr");
    tokio::io::copy(
        child.stdout.as_mut().expect("piped stdout"),
        &mut tokio::fs::File::create(&stdout_file).await?,
    )
    .await?;
    tokio::io::copy(
        child.stderr.as_mut().expect("piped stderr"),
        &mut tokio::fs::File::create(&stderr_file).await?,
    )
    .await?;

    let status = child.wait().await?;
    if !status.success() {
        anyhow::bail!("{CLASSIFY_BINARY} exited with status {status}");
    }
    Ok(())
}

/// Parses `<fingerprint> <label>` lines, mirroring the training index file
/// format for symmetry (spec 4.8).
async fn parse_result_file(path: &PathBuf) -> anyhow::Result<std::collections::HashMap<String, String>> {
    let text = tokio::fs::read_to_string(path).await?;
    let mut results = std::collections::HashMap::new();
    for line in text.lines() {
        let line = line.trim();
        if line.is_empty() {
            continue;
        }
        let (fingerprint, label) = line
            .split_once(' ')
            .ok_or_else(|| anyhow::anyhow!("malformed classify result line: {line:?}"))?;
        results.insert(fingerprint.to_string(), label.to_string());
    }
    Ok(results)
}

/// Translates numeric label strings through the training job's label index,
/// rejecting any out-of-range integer as a hard error (spec 4.8 / 8 seed
/// scenario 6).
fn translate_labels(
    raw: &std::collections::HashMap<String, String>,
    label_index: &[String],
) -> anyhow::Result<std::collections::HashMap<String, String>> {
    raw.iter()
        .map(|(fingerprint, label)| {
            let index: usize = label
                .parse()
                .map_err(|_| anyhow::anyhow!("result label {label:?} is not a valid index"))?;
            let human = label_index.get(index).cloned().ok_or_else(|| {
                anyhow::anyhow!(
                    "label index {index} out of range for label index of length {}",
                    label_index.len()
                )
            })?;
            Ok((fingerprint.clone(), human))
        })
        .collect()
}

#[async_trait::async_trait]
impl Job for ClassifyJobRunner {
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
    fn translate_labels_rejects_out_of_range_index() {
        let label_index = vec!["cat".to_string(), "dog".to_string(), "bird".to_string()];
        let mut raw = std::collections::HashMap::new();
        raw.insert("img-A".to_string(), "5".to_string());
        let err = translate_labels(&raw, &label_index).unwrap_err();
        assert!(err.to_string().contains('5'));
    }

    #[test]
    fn translate_labels_maps_valid_indices() {
        let label_index = vec!["cat".to_string(), "dog".to_string()];
        let mut raw = std::collections::HashMap::new();
        raw.insert("img-A".to_string(), "1".to_string());
        let translated = translate_labels(&raw, &label_index).unwrap();
        assert_eq!(translated.get("img-A"), Some(&"dog".to_string()));
    }
}
