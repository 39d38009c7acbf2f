use serde::{Deserialize, Serialize};

/// The closed set of type tags every persisted document carries.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum DocType {
    Datafile,
    Dataset,
    Solver,
    TrainingJob,
    Classifier,
    ClassifyJob,
    User,
}

impl DocType {
    pub fn as_str(&self) -> &'static str {
        match self {
            DocType::Datafile => "datafile",
            DocType::Dataset => "dataset",
            DocType::Solver => "solver",
            DocType::TrainingJob => "training-job",
            DocType::Classifier => "classifier",
            DocType::ClassifyJob => "classify-job",
            DocType::User => "user",
        }
    }
}

/// Universal attributes every persisted entity carries: a stable id, an
/// opaque optimistic-concurrency revision token, and a type tag.
///
/// Composed into each entity via `#[serde(flatten)]` rather than modeled
/// through inheritance.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct DocumentHeader {
    #[serde(rename = "_id", skip_serializing_if = "Option::is_none")]
    pub id: Option<String>,
    #[serde(rename = "_rev", skip_serializing_if = "Option::is_none")]
    pub rev: Option<String>,
    #[serde(rename = "type")]
    pub doc_type: DocType,
}

impl DocumentHeader {
    pub fn new(doc_type: DocType) -> Self {
        Self {
            id: None,
            rev: None,
            doc_type,
        }
    }

    pub fn has_valid_id(&self) -> bool {
        matches!(&self.id, Some(id) if !id.is_empty())
    }
}
