//! External-collaborator contracts: document store, blob store, message
//! queue. Only a mock/in-memory and a filesystem/HTTP reference
//! implementation live here — the real servers are out of scope (spec 1).

#![deny(unreachable_pub)]

pub mod blob;
pub mod document;
pub mod queue;

pub use blob::{
    BlobError, BlobHandle, BlobStore, BlobStream, FileSystemBlobStore, HttpBlobStore,
    MockBlobStore, PutOptions, bytes_stream, new_blob_store, strip_cbfs_prefix,
};
pub use document::{ChangeEvent, ChangesBatch, DocumentStore, MockDocumentStore, StoreError};
pub use queue::{InMemoryQueue, MessageQueue, QueueError};
