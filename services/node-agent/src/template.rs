//! Sources for the shared game template directory.

use std::path::{Path, PathBuf};

use async_trait::async_trait;
use thiserror::Error;
use tracing::info;

use crate::{archive, files};

#[derive(Debug, Error)]
pub enum TemplateError {
    #[error("download from {url} failed: {source}")]
    Download {
        url: String,
        #[source]
        source: reqwest::Error,
    },

    #[error("download from {url} returned HTTP {status}")]
    Status { url: String, status: u16 },

    #[error("failed to install template into {}: {source}", path.display())]
    Install {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    #[error("template install task failed: {0}")]
    Join(#[from] tokio::task::JoinError),
}

/// Refreshes the template directory.
#[async_trait]
pub trait TemplateSource: Send + Sync {
    /// Brings `install_dir` up to date and returns the installed version.
    async fn refresh(&self, install_dir: &Path) -> Result<String, TemplateError>;
}

/// Uses whatever is already on disk.
#[derive(Debug, Default, Clone)]
pub struct LocalTemplate;

#[async_trait]
impl TemplateSource for LocalTemplate {
    async fn refresh(&self, install_dir: &Path) -> Result<String, TemplateError> {
        let dir = install_dir.to_path_buf();
        Ok(tokio::task::spawn_blocking(move || files::read_version(&dir)).await?)
    }
}

/// Downloads a tar.gz template and swaps it into place.
#[derive(Debug, Clone)]
pub struct HttpTemplateSource {
    client: reqwest::Client,
    url: String,
    api_key: String,
}

impl HttpTemplateSource {
    pub fn new(url: impl Into<String>, api_key: impl Into<String>) -> Self {
        Self {
            client: reqwest::Client::new(),
            url: url.into(),
            api_key: api_key.into(),
        }
    }
}

#[async_trait]
impl TemplateSource for HttpTemplateSource {
    async fn refresh(&self, install_dir: &Path) -> Result<String, TemplateError> {
        info!(url = %self.url, dir = %install_dir.display(), "Downloading game template");

        let mut request = self.client.get(&self.url);
        if !self.api_key.is_empty() {
            request = request.header("X-API-Key", &self.api_key);
        }
        let response = request.send().await.map_err(|source| TemplateError::Download {
            url: self.url.clone(),
            source,
        })?;
        if !response.status().is_success() {
            return Err(TemplateError::Status {
                url: self.url.clone(),
                status: response.status().as_u16(),
            });
        }
        let body = response
            .bytes()
            .await
            .map_err(|source| TemplateError::Download {
                url: self.url.clone(),
                source,
            })?;

        let dir = install_dir.to_path_buf();
        let version = tokio::task::spawn_blocking(move || {
            install(&body, &dir)
                .map(|_| files::read_version(&dir))
                .map_err(|source| TemplateError::Install { path: dir, source })
        })
        .await??;

        info!(version = %version, "Game template installed");
        Ok(version)
    }
}

/// Unpacks into a staging sibling, then swaps it with `install_dir`.
fn install(archive_bytes: &[u8], install_dir: &Path) -> std::io::Result<()> {
    let staging = sibling(install_dir, "staging");
    let retired = sibling(install_dir, "old");
    remove_if_exists(&staging)?;
    remove_if_exists(&retired)?;

    archive::unpack(archive_bytes, &staging)?;

    if install_dir.exists() {
        std::fs::rename(install_dir, &retired)?;
    }
    std::fs::rename(&staging, install_dir)?;
    remove_if_exists(&retired)
}

fn sibling(dir: &Path, suffix: &str) -> PathBuf {
    let mut name = dir.file_name().unwrap_or_default().to_os_string();
    name.push(".");
    name.push(suffix);
    dir.with_file_name(name)
}

fn remove_if_exists(path: &Path) -> std::io::Result<()> {
    match std::fs::remove_dir_all(path) {
        Err(e) if e.kind() != std::io::ErrorKind::NotFound => Err(e),
        _ => Ok(()),
    }
}
