//! Process configuration (§4.9): environment-over-defaults for knobs read
//! once at startup, plus a small settings-store file for the values that
//! must be changeable without a restart (the provider table, the
//! summarize concurrency override) — refreshed through the same
//! `ProviderTableSource` seam the Provider Registry's own TTL cache
//! already expects.

use std::path::{Path, PathBuf};

use evalkit_providers::{ProviderTableRow, ProviderTableSource};
use serde::{Deserialize, Serialize};
use tokio::sync::RwLock;

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
struct SettingsFile {
    #[serde(default)]
    providers: Vec<ProviderTableRow>,
    #[serde(default)]
    summarize_concurrency_override: Option<usize>,
}

/// Backed by `<state_dir>/settings.json`. Missing file reads as an empty
/// table rather than an error — a fresh `state_dir` is the common case.
pub struct SettingsStore {
    path: PathBuf,
    cached: RwLock<SettingsFile>,
}

impl SettingsStore {
    pub async fn load(path: PathBuf) -> anyhow::Result<Self> {
        let cached = read_settings(&path).await?;
        Ok(Self {
            path,
            cached: RwLock::new(cached),
        })
    }

    pub async fn summarize_concurrency_override(&self) -> Option<usize> {
        self.cached.read().await.summarize_concurrency_override
    }
}

async fn read_settings(path: &Path) -> anyhow::Result<SettingsFile> {
    match tokio::fs::read(path).await {
        Ok(bytes) => Ok(serde_json::from_slice(&bytes)?),
        Err(err) if err.kind() == std::io::ErrorKind::NotFound => Ok(SettingsFile::default()),
        Err(err) => Err(err.into()),
    }
}

#[async_trait::async_trait]
impl ProviderTableSource for SettingsStore {
    async fn load_provider_table(&self) -> anyhow::Result<Vec<ProviderTableRow>> {
        let file = read_settings(&self.path).await?;
        let rows = file.providers.clone();
        *self.cached.write().await = file;
        Ok(rows)
    }
}
