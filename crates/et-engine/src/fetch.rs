//! Small shared helper for pulling a source reference (either a `cbfs://`
//! blob-store path or a plain HTTP URL) down to a local file. Used by the
//! training and classify runners to materialize specs, datasets, and images
//! into their working directories.

use std::path::Path;

use et_store::{BlobStore, blob::CBFS_URI_PREFIX};
use futures_util::TryStreamExt;
use tokio::io::AsyncWriteExt;

pub async fn fetch_to_file(
    blobs: &dyn BlobStore,
    http: &reqwest::Client,
    url: &str,
    dest: &Path,
) -> anyhow::Result<()> {
    if let Some(parent) = dest.parent() {
        tokio::fs::create_dir_all(parent).await?;
    }
    let mut file = tokio::fs::File::create(dest).await?;

    if let Some(path) = url.strip_prefix(CBFS_URI_PREFIX) {
        let mut stream = blobs.get(path).await?;
        while let Some(chunk) = stream.try_next().await? {
            file.write_all(&chunk).await?;
        }
    } else {
        let resp = http.get(url).send().await?.error_for_status()?;
        let mut stream = resp.bytes_stream();
        while let Some(chunk) = stream.try_next().await? {
            file.write_all(&chunk).await?;
        }
    }
    file.flush().await?;
    Ok(())
}

pub async fn fetch_to_string(
    blobs: &dyn BlobStore,
    http: &reqwest::Client,
    url: &str,
) -> anyhow::Result<String> {
    if let Some(path) = url.strip_prefix(CBFS_URI_PREFIX) {
        let mut stream = blobs.get(path).await?;
        let mut buf = Vec::new();
        while let Some(chunk) = stream.try_next().await? {
            buf.extend_from_slice(&chunk);
        }
        Ok(String::from_utf8(buf)?)
    } else {
        let resp = http.get(url).send().await?.error_for_status()?;
        Ok(resp.text().await?)
    }
}
