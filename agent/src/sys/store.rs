// agent/src/sys/store.rs

use async_trait::async_trait;
use serde::Deserialize;
use std::collections::BTreeMap;
use std::ffi::OsStr;
use std::io::Write;
use std::path::{Component, Path, PathBuf};
use std::sync::Arc;
use tempfile::NamedTempFile;
use tokio::fs;

use crate::error::StoreError;
use crate::sys::aws_cli::{diagnostics, reject_flag_like, AwsCli};
use crate::sys::traits::{ObjectMeta, ObjectStore};

// ==============================================================================
// 1. Concrete Backend (aws s3api)
// ==============================================================================

#[derive(Deserialize)]
struct ListObjectsResponse {
    #[serde(rename = "Contents", default)]
    contents: Vec<ListedObject>,
}

#[derive(Deserialize)]
struct ListedObject {
    #[serde(rename = "Key")]
    key: String,
}

pub struct AwsS3Store {
    cli: AwsCli,
}

impl AwsS3Store {
    pub fn new(cli: AwsCli) -> Self {
        Self { cli }
    }

    fn classify(key: &str, output: &std::process::Output) -> StoreError {
        let detail = diagnostics(output);
        if detail.contains("NoSuchKey") || detail.contains("Not Found") || detail.contains("(404)") {
            StoreError::NotFound { key: key.to_string() }
        } else if detail.contains("AccessDenied") || detail.contains("Forbidden") {
            StoreError::AccessDenied(detail)
        } else {
            StoreError::Transport(detail)
        }
    }

    fn check_args(bucket: &str, key: &str) -> Result<(), StoreError> {
        for (field, value) in [("bucket", bucket), ("key", key)] {
            reject_flag_like(field, value).map_err(StoreError::Transport)?;
        }
        Ok(())
    }
}

#[async_trait]
impl ObjectStore for AwsS3Store {
    async fn put_object(
        &self,
        bucket: &str,
        key: &str,
        body: Vec<u8>,
        meta: ObjectMeta,
    ) -> Result<(), StoreError> {
        Self::check_args(bucket, key)?;

        // The CLI reads the body from a file; it lives exactly as long as the upload.
        let mut body_file = NamedTempFile::new()?;
        body_file.write_all(&body)?;
        body_file.flush()?;

        let output = self
            .cli
            .run([
                OsStr::new("s3api"),
                OsStr::new("put-object"),
                OsStr::new("--bucket"),
                OsStr::new(bucket),
                OsStr::new("--key"),
                OsStr::new(key),
                OsStr::new("--body"),
                body_file.path().as_os_str(),
                OsStr::new("--content-type"),
                OsStr::new(meta.content_type),
                OsStr::new("--server-side-encryption"),
                OsStr::new(meta.server_side_encryption),
            ])
            .await
            .map_err(|e| StoreError::Transport(format!("aws call failed: {e}")))?;

        if !output.status.success() {
            return Err(Self::classify(key, &output));
        }
        Ok(())
    }

    async fn list_keys(&self, bucket: &str, prefix: &str) -> Result<Vec<String>, StoreError> {
        Self::check_args(bucket, prefix)?;

        let output = self
            .cli
            .run(["s3api", "list-objects-v2", "--bucket", bucket, "--prefix", prefix])
            .await
            .map_err(|e| StoreError::Transport(format!("aws call failed: {e}")))?;

        if !output.status.success() {
            return Err(Self::classify(prefix, &output));
        }

        // An empty listing prints nothing at all.
        if output.stdout.iter().all(u8::is_ascii_whitespace) {
            return Ok(Vec::new());
        }
        let listing: ListObjectsResponse = serde_json::from_slice(&output.stdout)
            .map_err(|e| StoreError::Transport(format!("unreadable listing: {e}")))?;
        Ok(listing.contents.into_iter().map(|o| o.key).collect())
    }

    async fn get_object(&self, bucket: &str, key: &str) -> Result<Vec<u8>, StoreError> {
        Self::check_args(bucket, key)?;

        let target = NamedTempFile::new()?;
        let output = self
            .cli
            .run([
                OsStr::new("s3api"),
                OsStr::new("get-object"),
                OsStr::new("--bucket"),
                OsStr::new(bucket),
                OsStr::new("--key"),
                OsStr::new(key),
                target.path().as_os_str(),
            ])
            .await
            .map_err(|e| StoreError::Transport(format!("aws call failed: {e}")))?;

        if !output.status.success() {
            return Err(Self::classify(key, &output));
        }
        Ok(fs::read(target.path()).await?)
    }
}

// ==============================================================================
// 2. Source Store Client
// ==============================================================================

/// Uploads and downloads IaC bundles laid out as `{owner}/{plan_id}/{version}/{file}`.
#[derive(Clone)]
pub struct SourceStore {
    backend: Arc<dyn ObjectStore>,
}

/// Prefixes always address a "directory": `u1/p1/v1` and `u1/p1/v1/` are the same
/// bundle, and neither matches `u1/p1/v10/`.
pub fn normalize_prefix(prefix: &str) -> String {
    if prefix.is_empty() || prefix.ends_with('/') {
        prefix.to_string()
    } else {
        format!("{prefix}/")
    }
}

/// Maps an object key to its path relative to the bundle root.
/// `Ok(None)` for directory markers; an error for keys that would land outside it.
fn relative_path(prefix: &str, key: &str) -> Result<Option<PathBuf>, StoreError> {
    let Some(rest) = key.strip_prefix(prefix) else {
        return Err(StoreError::InvalidKey { key: key.to_string(), reason: "outside prefix" });
    };
    if rest.is_empty() || rest.ends_with('/') {
        return Ok(None);
    }

    let mut relative = PathBuf::new();
    for component in Path::new(rest).components() {
        match component {
            Component::Normal(part) => relative.push(part),
            Component::CurDir => {}
            Component::ParentDir | Component::RootDir | Component::Prefix(_) => {
                return Err(StoreError::InvalidKey {
                    key: key.to_string(),
                    reason: "escapes the bundle root",
                });
            }
        }
    }
    Ok((!relative.as_os_str().is_empty()).then_some(relative))
}

impl SourceStore {
    pub fn new(backend: Arc<dyn ObjectStore>) -> Self {
        Self { backend }
    }

    /// Writes every file under `prefix` as encrypted text. All files are
    /// attempted; failures are reported together.
    pub async fn upload(
        &self,
        bucket: &str,
        prefix: &str,
        files: &BTreeMap<String, String>,
    ) -> Result<(), StoreError> {
        let prefix = normalize_prefix(prefix);
        let mut failures = Vec::new();

        for (name, content) in files {
            let key = format!("{prefix}{name}");
            match relative_path(&prefix, &key) {
                Ok(Some(_)) => {}
                Ok(None) => {
                    failures.push(format!("{name}: not a file name"));
                    continue;
                }
                Err(e) => {
                    failures.push(format!("{name}: {e}"));
                    continue;
                }
            }
            match self
                .backend
                .put_object(bucket, &key, content.as_bytes().to_vec(), ObjectMeta::TEXT_ENCRYPTED)
                .await
            {
                Ok(()) => tracing::debug!(bucket, key = %key, "Uploaded object"),
                Err(e) => {
                    tracing::error!(bucket, key = %key, error = %e, "Upload failed");
                    failures.push(format!("{name}: {e}"));
                }
            }
        }

        if failures.is_empty() {
            Ok(())
        } else {
            Err(StoreError::Aggregate { failures })
        }
    }

    /// Reconstructs the bundle under `target_dir`, nested paths included, and
    /// returns the local path of every file written.
    pub async fn download_all(
        &self,
        bucket: &str,
        prefix: &str,
        target_dir: &Path,
    ) -> Result<Vec<PathBuf>, StoreError> {
        let prefix = normalize_prefix(prefix);
        let keys = self.backend.list_keys(bucket, &prefix).await?;

        let mut entries = Vec::with_capacity(keys.len());
        for key in keys {
            if let Some(relative) = relative_path(&prefix, &key)? {
                entries.push((key, relative));
            }
        }
        if entries.is_empty() {
            return Err(StoreError::Empty { prefix });
        }

        fs::create_dir_all(target_dir).await?;
        let mut written = Vec::with_capacity(entries.len());
        for (key, relative) in entries {
            let local = target_dir.join(&relative);
            if let Some(parent) = local.parent() {
                fs::create_dir_all(parent).await?;
            }
            let body = self.backend.get_object(bucket, &key).await?;
            fs::write(&local, body).await?;
            written.push(local);
        }

        tracing::info!(bucket, prefix = %prefix, file_count = written.len(), "Downloaded source bundle");
        Ok(written)
    }

    /// Reads the bundle into memory as `relative path -> text`.
    pub async fn download_files(
        &self,
        bucket: &str,
        prefix: &str,
    ) -> Result<BTreeMap<String, String>, StoreError> {
        let prefix = normalize_prefix(prefix);
        let mut files = BTreeMap::new();
        for key in self.backend.list_keys(bucket, &prefix).await? {
            let Some(relative) = relative_path(&prefix, &key)? else {
                continue;
            };
            let body = self.backend.get_object(bucket, &key).await?;
            files.insert(
                relative.to_string_lossy().into_owned(),
                String::from_utf8_lossy(&body).into_owned(),
            );
        }
        Ok(files)
    }
}
