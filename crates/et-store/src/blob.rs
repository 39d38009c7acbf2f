use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::sync::Mutex;

use bytes::Bytes;
use chrono::{DateTime, Utc};
use futures_util::stream::{self, BoxStream, StreamExt, TryStreamExt};
use tokio::io::AsyncWriteExt;

/// The literal scheme prefixing every blob-store URL the core hands back to
/// clients (spec 4.9 / 6).
pub const CBFS_URI_PREFIX: &str = "cbfs://";

/// Errors surfaced by a [`BlobStore`] operation.
#[derive(Debug, thiserror::Error)]
pub enum BlobError {
    #[error("blob not found: {0}")]
    NotFound(String),
    #[error(transparent)]
    Io(#[from] anyhow::Error),
}

pub type BlobStream = BoxStream<'static, Result<Bytes, BlobError>>;

/// Options accompanying a [`BlobStore::put`] call.
#[derive(Debug, Clone, Default)]
pub struct PutOptions {
    pub content_type: Option<String>,
}

/// A handle on an open blob, used by the environment sanity check to poll
/// cluster-wide replication (spec 4.9 / 6).
#[async_trait::async_trait]
pub trait BlobHandle: Send + Sync {
    async fn nodes(&self) -> Result<HashMap<String, DateTime<Utc>>, BlobError>;
}

/// Uniform Get/Put/Rm/OpenFile contract across filesystem, network-object-store,
/// and mock backends (spec 4.9).
#[async_trait::async_trait]
pub trait BlobStore: Send + Sync {
    async fn get(&self, path: &str) -> Result<BlobStream, BlobError>;

    async fn put(
        &self,
        path: &str,
        reader: BlobStream,
        options: PutOptions,
    ) -> Result<(), BlobError>;

    async fn remove(&self, path: &str) -> Result<(), BlobError>;

    async fn open_file(&self, path: &str) -> Result<Box<dyn BlobHandle>, BlobError>;

    /// The `cbfs://`-prefixed URL a client should see for `path`.
    fn public_url(&self, path: &str) -> String {
        format!("{CBFS_URI_PREFIX}{path}")
    }
}

/// Strips the [`CBFS_URI_PREFIX`] from a client-supplied blob URL, the
/// inverse of [`BlobStore::public_url`].
pub fn strip_cbfs_prefix(url: &str) -> &str {
    url.strip_prefix(CBFS_URI_PREFIX).unwrap_or(url)
}

/// Builds a [`BlobStream`] from an in-memory buffer — convenient for
/// streaming a small generated file (e.g. a rewritten prototxt) without a
/// dedicated reader type.
pub fn bytes_stream(data: Vec<u8>) -> BlobStream {
    stream::once(async move { Ok(Bytes::from(data)) }).boxed()
}

struct MockEntry {
    bytes: Vec<u8>,
    content_type: Option<String>,
}

/// An in-memory [`BlobStore`], the `mock://` backend named in spec 6.
#[derive(Default)]
pub struct MockBlobStore {
    entries: Mutex<HashMap<String, MockEntry>>,
}

impl MockBlobStore {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn get_bytes(&self, path: &str) -> Option<Vec<u8>> {
        self.entries
            .lock()
            .expect("mock blob store mutex poisoned")
            .get(path)
            .map(|e| e.bytes.clone())
    }
}

struct SingleNodeHandle {
    node_id: String,
}

#[async_trait::async_trait]
impl BlobHandle for SingleNodeHandle {
    async fn nodes(&self) -> Result<HashMap<String, DateTime<Utc>>, BlobError> {
        let mut map = HashMap::new();
        map.insert(self.node_id.clone(), Utc::now());
        Ok(map)
    }
}

#[async_trait::async_trait]
impl BlobStore for MockBlobStore {
    async fn get(&self, path: &str) -> Result<BlobStream, BlobError> {
        let bytes = self
            .get_bytes(path)
            .ok_or_else(|| BlobError::NotFound(path.to_string()))?;
        Ok(bytes_stream(bytes))
    }

    async fn put(
        &self,
        path: &str,
        mut reader: BlobStream,
        options: PutOptions,
    ) -> Result<(), BlobError> {
        let mut buf = Vec::new();
        while let Some(chunk) = reader.try_next().await? {
            buf.extend_from_slice(&chunk);
        }
        self.entries.lock().expect("mock blob store mutex poisoned").insert(
            path.to_string(),
            MockEntry {
                bytes: buf,
                content_type: options.content_type,
            },
        );
        Ok(())
    }

    async fn remove(&self, path: &str) -> Result<(), BlobError> {
        self.entries
            .lock()
            .expect("mock blob store mutex poisoned")
            .remove(path)
            .map(|_| ())
            .ok_or_else(|| BlobError::NotFound(path.to_string()))
    }

    async fn open_file(&self, path: &str) -> Result<Box<dyn BlobHandle>, BlobError> {
        if !self.entries.lock().expect("mock blob store mutex poisoned").contains_key(path) {
            return Err(BlobError::NotFound(path.to_string()));
        }
        Ok(Box::new(SingleNodeHandle {
            node_id: "mock-node-0".to_string(),
        }))
    }
}

/// A local-filesystem-rooted [`BlobStore`], the `file://` backend named in
/// spec 6.
pub struct FileSystemBlobStore {
    root: PathBuf,
}

impl FileSystemBlobStore {
    pub fn new(root: impl Into<PathBuf>) -> Self {
        Self { root: root.into() }
    }

    fn resolve(&self, path: &str) -> Result<PathBuf, BlobError> {
        if path.split('/').any(|seg| seg == "..") {
            return Err(BlobError::Io(anyhow::anyhow!(
                "blob path must not contain '..': {path}"
            )));
        }
        Ok(self.root.join(path))
    }
}

#[async_trait::async_trait]
impl BlobStore for FileSystemBlobStore {
    async fn get(&self, path: &str) -> Result<BlobStream, BlobError> {
        let full = self.resolve(path)?;
        let bytes = tokio::fs::read(&full)
            .await
            .map_err(|_| BlobError::NotFound(path.to_string()))?;
        Ok(bytes_stream(bytes))
    }

    async fn put(
        &self,
        path: &str,
        mut reader: BlobStream,
        _options: PutOptions,
    ) -> Result<(), BlobError> {
        let full = self.resolve(path)?;
        if let Some(parent) = full.parent() {
            tokio::fs::create_dir_all(parent)
                .await
                .map_err(|e| BlobError::Io(e.into()))?;
        }
        let tmp = full.with_extension("tmp-upload");
        let mut file = tokio::fs::File::create(&tmp)
            .await
            .map_err(|e| BlobError::Io(e.into()))?;
        while let Some(chunk) = reader.try_next().await? {
            file.write_all(&chunk).await.map_err(|e| BlobError::Io(e.into()))?;
        }
        file.flush().await.map_err(|e| BlobError::Io(e.into()))?;
        drop(file);
        tokio::fs::rename(&tmp, &full)
            .await
            .map_err(|e| BlobError::Io(e.into()))?;
        Ok(())
    }

    async fn remove(&self, path: &str) -> Result<(), BlobError> {
        let full = self.resolve(path)?;
        tokio::fs::remove_file(&full)
            .await
            .map_err(|_| BlobError::NotFound(path.to_string()))
    }

    async fn open_file(&self, path: &str) -> Result<Box<dyn BlobHandle>, BlobError> {
        let full = self.resolve(path)?;
        if !Path::new(&full).exists() {
            return Err(BlobError::NotFound(path.to_string()));
        }
        Ok(Box::new(SingleNodeHandle {
            node_id: "local".to_string(),
        }))
    }
}

/// A network-object-store-backed [`BlobStore`], the `http://` backend named
/// in spec 6. Generalized from the original's CBFS client library to a
/// plain HTTP PUT/GET/DELETE object protocol, since no CBFS Rust client
/// exists in the ecosystem.
pub struct HttpBlobStore {
    base_url: reqwest::Url,
    client: reqwest::Client,
}

impl HttpBlobStore {
    pub fn new(base_url: reqwest::Url) -> Self {
        Self {
            base_url,
            client: reqwest::Client::new(),
        }
    }

    fn object_url(&self, path: &str) -> Result<reqwest::Url, BlobError> {
        self.base_url
            .join(path)
            .map_err(|e| BlobError::Io(anyhow::anyhow!("invalid blob path {path:?}: {e}")))
    }
}

#[async_trait::async_trait]
impl BlobStore for HttpBlobStore {
    async fn get(&self, path: &str) -> Result<BlobStream, BlobError> {
        let url = self.object_url(path)?;
        let resp = self
            .client
            .get(url)
            .send()
            .await
            .map_err(|e| BlobError::Io(e.into()))?;
        if resp.status() == reqwest::StatusCode::NOT_FOUND {
            return Err(BlobError::NotFound(path.to_string()));
        }
        let resp = resp.error_for_status().map_err(|e| BlobError::Io(e.into()))?;
        Ok(resp
            .bytes_stream()
            .map_err(|e| BlobError::Io(e.into()))
            .boxed())
    }

    async fn put(
        &self,
        path: &str,
        mut reader: BlobStream,
        options: PutOptions,
    ) -> Result<(), BlobError> {
        let url = self.object_url(path)?;
        let mut buf = Vec::new();
        while let Some(chunk) = reader.try_next().await? {
            buf.extend_from_slice(&chunk);
        }
        let mut req = self.client.put(url).body(buf);
        if let Some(ct) = options.content_type {
            req = req.header(reqwest::header::CONTENT_TYPE, ct);
        }
        req.send()
            .await
            .map_err(|e| BlobError::Io(e.into()))?
            .error_for_status()
            .map_err(|e| BlobError::Io(e.into()))?;
        Ok(())
    }

    async fn remove(&self, path: &str) -> Result<(), BlobError> {
        let url = self.object_url(path)?;
        self.client
            .delete(url)
            .send()
            .await
            .map_err(|e| BlobError::Io(e.into()))?
            .error_for_status()
            .map_err(|e| BlobError::Io(e.into()))?;
        Ok(())
    }

    async fn open_file(&self, path: &str) -> Result<Box<dyn BlobHandle>, BlobError> {
        let url = self.object_url(&format!("{path}?nodes=1"))?;
        let resp = self
            .client
            .get(url)
            .send()
            .await
            .map_err(|e| BlobError::Io(e.into()))?
            .error_for_status()
            .map_err(|e| BlobError::Io(e.into()))?;
        let nodes: HashMap<String, DateTime<Utc>> =
            resp.json().await.map_err(|e| BlobError::Io(e.into()))?;
        Ok(Box::new(StaticNodesHandle { nodes }))
    }
}

struct StaticNodesHandle {
    nodes: HashMap<String, DateTime<Utc>>,
}

#[async_trait::async_trait]
impl BlobHandle for StaticNodesHandle {
    async fn nodes(&self) -> Result<HashMap<String, DateTime<Utc>>, BlobError> {
        Ok(self.nodes.clone())
    }
}

/// Dispatches `blob-store-url` to the correct backend by scheme, per the
/// configuration table in spec 6.
pub fn new_blob_store(url: &str) -> anyhow::Result<Box<dyn BlobStore>> {
    if let Some(root) = url.strip_prefix("file://") {
        return Ok(Box::new(FileSystemBlobStore::new(root)));
    }
    if url.strip_prefix("mock://").is_some() {
        return Ok(Box::new(MockBlobStore::new()));
    }
    if url.starts_with("http://") || url.starts_with("https://") {
        let parsed = reqwest::Url::parse(url)?;
        return Ok(Box::new(HttpBlobStore::new(parsed)));
    }
    anyhow::bail!("unrecognized blob-store-url scheme: {url:?}")
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn mock_store_round_trips() {
        let store = MockBlobStore::new();
        store
            .put(
                "a/b.txt",
                bytes_stream(b"hello".to_vec()),
                PutOptions {
                    content_type: Some("text/plain".to_string()),
                },
            )
            .await
            .unwrap();

        let mut stream = store.get("a/b.txt").await.unwrap();
        let mut out = Vec::new();
        while let Some(chunk) = stream.try_next().await.unwrap() {
            out.extend_from_slice(&chunk);
        }
        assert_eq!(out, b"hello");
    }

    #[tokio::test]
    async fn filesystem_store_round_trips() {
        let dir = tempfile::tempdir().unwrap();
        let store = FileSystemBlobStore::new(dir.path());
        store
            .put("x/y.bin", bytes_stream(vec![1, 2, 3]), PutOptions::default())
            .await
            .unwrap();
        let mut stream = store.get("x/y.bin").await.unwrap();
        let mut out = Vec::new();
        while let Some(chunk) = stream.try_next().await.unwrap() {
            out.extend_from_slice(&chunk);
        }
        assert_eq!(out, vec![1, 2, 3]);
    }

    #[test]
    fn cbfs_prefix_strip() {
        assert_eq!(strip_cbfs_prefix("cbfs://a/b"), "a/b");
        assert_eq!(strip_cbfs_prefix("a/b"), "a/b");
    }
}
