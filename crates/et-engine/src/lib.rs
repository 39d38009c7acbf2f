//! The orchestration core: entity model, CAS-driven job runners, the
//! change-feed listener, and the two scheduler backends (spec 4).

#![deny(unreachable_pub)]

pub mod changes;
pub mod classify;
pub mod downloader;
pub mod entities;
pub mod envcheck;
pub mod factory;
pub mod fetch;
pub mod job;
pub mod prototxt;
pub mod scheduler;
pub mod splitter;
pub mod training;

pub use changes::ChangesListener;
pub use entities::{
    Classifier, ClassifyJob, Datafile, Dataset, InputLayerType, Solver, TrainingDatasetRef,
    TrainingJob, cas_transition,
};
pub use factory::{DocumentJobFactory, FactoryError, JobFactory};
pub use job::{Job, JobDescriptor};
pub use scheduler::{ExternalQueueScheduler, InProcessScheduler, JobScheduler, QueueWorker};
