//! The pipeline entity model (spec 3): Datafile, Dataset, Solver,
//! TrainingJob, Classifier, ClassifyJob, each composing a shared
//! [`DocumentHeader`] and, where applicable, a [`ProcessingState`].

use std::collections::HashMap;

use et_core::{CasError, DocType, DocumentHeader, ProcessingState, cas_update};
use et_store::{DocumentStore, StoreError};
use serde::{Deserialize, Serialize};
use serde::de::DeserializeOwned;

/// Every entity whose lifecycle is driven by CAS must expose its header so
/// the generic transition helper below can read/write `_id`/`_rev`.
pub trait HasHeader {
    fn header(&self) -> &DocumentHeader;
    fn header_mut(&mut self) -> &mut DocumentHeader;
}

macro_rules! impl_has_header {
    ($ty:ty) => {
        impl HasHeader for $ty {
            fn header(&self) -> &DocumentHeader {
                &self.header
            }
            fn header_mut(&mut self) -> &mut DocumentHeader {
                &mut self.header
            }
        }
    };
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub enum InputLayerType {
    #[serde(rename = "image-index")]
    ImageIndex,
    #[serde(rename = "native-data")]
    NativeData,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Datafile {
    #[serde(flatten)]
    pub header: DocumentHeader,
    pub user_id: String,
    pub url: String,
    pub processing_state: ProcessingState,
    #[serde(default)]
    pub processing_log: String,
}
impl_has_header!(Datafile);

impl Datafile {
    pub fn new(user_id: impl Into<String>, source_url: impl Into<String>) -> Self {
        Self {
            header: DocumentHeader::new(DocType::Datafile),
            user_id: user_id.into(),
            url: source_url.into(),
            processing_state: ProcessingState::Pending,
            processing_log: String::new(),
        }
    }

    /// The blob-store path entries are copied to: `<id>/<basename-of-source-url>`.
    pub fn blob_path(&self) -> anyhow::Result<String> {
        let id = self
            .header
            .id
            .as_deref()
            .ok_or_else(|| anyhow::anyhow!("datafile has no id yet"))?;
        let basename = self
            .url
            .rsplit('/')
            .next()
            .filter(|s| !s.is_empty())
            .unwrap_or("datafile.bin");
        Ok(format!("{id}/{basename}"))
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TrainingDatasetRef {
    pub datafile_id: String,
    pub split_percentage: f64,
    pub url: String,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Dataset {
    #[serde(flatten)]
    pub header: DocumentHeader,
    pub training: TrainingDatasetRef,
    pub test: TrainingDatasetRef,
    pub processing_state: ProcessingState,
    #[serde(default)]
    pub processing_log: String,
}
impl_has_header!(Dataset);

impl Dataset {
    /// Splittable iff the training and test references name the same source
    /// datafile and both split ratios are non-zero (spec 4.5).
    pub fn is_splittable(&self) -> bool {
        self.training.datafile_id == self.test.datafile_id
            && self.training.split_percentage != 0.0
            && self.test.split_percentage != 0.0
    }

    pub fn training_artifact_path(&self) -> anyhow::Result<String> {
        Ok(format!("{}/training.tar.gz", self.id()?))
    }

    pub fn testing_artifact_path(&self) -> anyhow::Result<String> {
        Ok(format!("{}/testing.tar.gz", self.id()?))
    }

    fn id(&self) -> anyhow::Result<&str> {
        self.header
            .id
            .as_deref()
            .ok_or_else(|| anyhow::anyhow!("dataset has no id yet"))
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Solver {
    #[serde(flatten)]
    pub header: DocumentHeader,
    pub dataset_id: String,
    pub input_layer_type: InputLayerType,
    #[serde(default)]
    pub specification_url: Option<String>,
    #[serde(default)]
    pub net_specification_url: Option<String>,
}
impl_has_header!(Solver);

impl Solver {
    fn id(&self) -> anyhow::Result<&str> {
        self.header
            .id
            .as_deref()
            .ok_or_else(|| anyhow::anyhow!("solver has no id yet"))
    }

    pub fn solver_spec_path(&self) -> anyhow::Result<String> {
        Ok(format!("{}/solver.prototxt", self.id()?))
    }

    pub fn net_spec_path(&self) -> anyhow::Result<String> {
        Ok(format!("{}/solver-net.prototxt", self.id()?))
    }
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct TrainingJob {
    #[serde(flatten)]
    pub header: DocumentHeader,
    pub solver_id: String,
    pub processing_state: ProcessingState,
    #[serde(default)]
    pub processing_log: String,
    #[serde(default)]
    pub stdout_url: Option<String>,
    #[serde(default)]
    pub stderr_url: Option<String>,
    #[serde(default)]
    pub trained_model_url: Option<String>,
    #[serde(default)]
    pub label_index: Vec<String>,
}
impl_has_header!(TrainingJob);

impl TrainingJob {
    pub fn new(solver_id: impl Into<String>) -> Self {
        Self {
            header: DocumentHeader::new(DocType::TrainingJob),
            solver_id: solver_id.into(),
            processing_state: ProcessingState::Pending,
            ..Default::default()
        }
    }

    fn id(&self) -> anyhow::Result<&str> {
        self.header
            .id
            .as_deref()
            .ok_or_else(|| anyhow::anyhow!("training job has no id yet"))
    }

    pub fn stdout_path(&self) -> anyhow::Result<String> {
        Ok(format!("{}/stdout", self.id()?))
    }

    pub fn stderr_path(&self) -> anyhow::Result<String> {
        Ok(format!("{}/stderr", self.id()?))
    }

    pub fn model_path(&self) -> anyhow::Result<String> {
        Ok(format!("{}/trained.caffemodel", self.id()?))
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Classifier {
    #[serde(flatten)]
    pub header: DocumentHeader,
    pub training_job_id: String,
    pub specification_url: String,
    pub image_width: u32,
    pub image_height: u32,
    pub scale: f64,
    #[serde(default)]
    pub color: bool,
    #[serde(default)]
    pub gpu: bool,
}
impl_has_header!(Classifier);

impl Classifier {
    fn id(&self) -> anyhow::Result<&str> {
        self.header
            .id
            .as_deref()
            .ok_or_else(|| anyhow::anyhow!("classifier has no id yet"))
    }

    pub fn spec_path(&self) -> anyhow::Result<String> {
        Ok(format!("{}/classifier.prototxt", self.id()?))
    }
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct ClassifyJob {
    #[serde(flatten)]
    pub header: DocumentHeader,
    pub classifier_id: String,
    pub processing_state: ProcessingState,
    #[serde(default)]
    pub processing_log: String,
    #[serde(default)]
    pub image_urls: Vec<String>,
    #[serde(default)]
    pub stdout_url: Option<String>,
    #[serde(default)]
    pub stderr_url: Option<String>,
    #[serde(default)]
    pub results: HashMap<String, String>,
}
impl_has_header!(ClassifyJob);

impl ClassifyJob {
    pub fn new(classifier_id: impl Into<String>) -> Self {
        Self {
            header: DocumentHeader::new(DocType::ClassifyJob),
            classifier_id: classifier_id.into(),
            processing_state: ProcessingState::Pending,
            ..Default::default()
        }
    }

    fn id(&self) -> anyhow::Result<&str> {
        self.header
            .id
            .as_deref()
            .ok_or_else(|| anyhow::anyhow!("classify job has no id yet"))
    }

    pub fn stdout_path(&self) -> anyhow::Result<String> {
        Ok(format!("{}/stdout", self.id()?))
    }

    pub fn stderr_path(&self) -> anyhow::Result<String> {
        Ok(format!("{}/stderr", self.id()?))
    }

    pub fn image_blob_path(&self, fingerprint: &str) -> anyhow::Result<String> {
        Ok(format!("{}/{fingerprint}", self.id()?))
    }
}

/// The generic realization of et_core::cas_update for store-backed
/// entities: persist serializes to JSON and calls `DocumentStore::edit`;
/// refresh calls `DocumentStore::retrieve` and deserializes. This is the
/// *only* CAS call-site pipeline entities use — see DESIGN.md Open Question
/// resolution 2.
pub async fn cas_transition<T, MutateFn, PredicateFn>(
    store: &dyn DocumentStore,
    entity: &mut T,
    mutate: MutateFn,
    predicate: PredicateFn,
) -> Result<bool, CasError>
where
    T: Clone + HasHeader + Serialize + DeserializeOwned,
    MutateFn: Fn(&mut T),
    PredicateFn: Fn(&T) -> bool,
{
    cas_update(
        entity,
        mutate,
        |e: &T| {
            let value = serde_json::to_value(e).map_err(|err| CasError::Other(err.into()));
            let mut next = e.clone();
            async move {
                let value = value?;
                let rev = store.edit(value).await.map_err(CasError::from)?;
                next.header_mut().rev = Some(rev);
                Ok(next)
            }
        },
        predicate,
        |e: &T| {
            let id = e.header().id.clone();
            async move {
                let id = id.ok_or_else(|| CasError::Other(anyhow::anyhow!("entity has no id")))?;
                let value = store.retrieve(&id).await.map_err(CasError::from)?;
                serde_json::from_value(value).map_err(|err| CasError::Other(err.into()))
            }
        },
    )
    .await
}
