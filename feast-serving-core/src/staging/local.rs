use crate::staging::StagingClient;
use anyhow::{anyhow, Context, Result};
use async_trait::async_trait;
use chrono::Duration;
use std::path::{Path, PathBuf};
use url::Url;

/// Staging on the local filesystem, addressed with `file://` URIs.
pub struct LocalStagingClient {
    root_dir: PathBuf,
    root_uri: String,
    ttl: Duration,
}

impl LocalStagingClient {
    pub fn new(root: &str, cwd: Option<&str>, ttl: Duration) -> Result<Self> {
        let mut root_dir = PathBuf::new();
        root_dir.push(cwd.unwrap_or(""));
        root_dir.push(root);
        let root_dir = std::path::absolute(&root_dir)
            .with_context(|| format!("Invalid staging root {:?}", root_dir))?;
        let root_uri = Url::from_directory_path(&root_dir)
            .map_err(|_| anyhow!("Staging root {:?} is not a valid directory path", root_dir))?
            .to_string()
            .trim_end_matches('/')
            .to_string();
        Ok(Self {
            root_dir,
            root_uri,
            ttl,
        })
    }

    pub fn root_dir(&self) -> &Path {
        &self.root_dir
    }

    /// Maps a `file://` URI to a path, refusing anything outside the staging root.
    fn path_for(&self, uri: &str) -> Result<PathBuf> {
        let url = Url::parse(uri).with_context(|| format!("Invalid staging URI '{}'", uri))?;
        if url.scheme() != "file" {
            return Err(anyhow!("Unsupported staging URI scheme '{}'", url.scheme()));
        }
        let path = url
            .to_file_path()
            .map_err(|_| anyhow!("Staging URI '{}' is not a local path", uri))?;
        if !path.starts_with(&self.root_dir) || path == self.root_dir {
            return Err(anyhow!(
                "Staging URI '{}' is outside the staging root {}",
                uri,
                self.root_uri
            ));
        }
        Ok(path)
    }
}

#[async_trait]
impl StagingClient for LocalStagingClient {
    fn root(&self) -> &str {
        &self.root_uri
    }

    fn ttl(&self) -> Duration {
        self.ttl
    }

    async fn put(&self, uri: &str, data: Vec<u8>) -> Result<()> {
        let path = self.path_for(uri)?;
        if let Some(parent) = path.parent() {
            tokio::fs::create_dir_all(parent)
                .await
                .with_context(|| format!("Failed to create staging directory {:?}", parent))?;
        }
        tokio::fs::write(&path, data)
            .await
            .with_context(|| format!("Failed to write staging file {:?}", path))
    }

    async fn get(&self, uri: &str) -> Result<Vec<u8>> {
        let path = self.path_for(uri)?;
        tokio::fs::read(&path)
            .await
            .with_context(|| format!("Failed to read staging file {:?}", path))
    }
}
