//! Filesystem-backed asset catalog for backgrounds and avatar configs.

use std::path::{Path, PathBuf};

use anyhow::{bail, Result};
use async_trait::async_trait;
use tracing::info;

use miko_gateway::server::{AssetCatalog, AvatarSwitch};

use crate::config::AssetsConfig;

const BACKGROUND_EXTENSIONS: &[&str] = &["png", "jpg", "jpeg", "webp", "gif"];
const AVATAR_CONFIG_EXTENSIONS: &[&str] = &["yaml", "yml", "toml", "json"];

/// Lists and activates asset files under the configured directories.
pub struct FileAssetCatalog {
    backgrounds_dir: PathBuf,
    avatar_configs_dir: PathBuf,
    active_model: String,
}

impl FileAssetCatalog {
    pub fn new(cfg: &AssetsConfig) -> Self {
        Self {
            backgrounds_dir: PathBuf::from(&cfg.backgrounds_dir),
            avatar_configs_dir: PathBuf::from(&cfg.avatar_configs_dir),
            active_model: cfg.active_model.clone(),
        }
    }

    async fn list_files(dir: &Path, extensions: &[&str]) -> Result<Vec<String>> {
        // A missing directory is an empty catalog, not an error: asset packs
        // are optional on fresh installs.
        if !dir.exists() {
            return Ok(Vec::new());
        }

        let mut entries = tokio::fs::read_dir(dir).await?;
        let mut files = Vec::new();
        while let Some(entry) = entries.next_entry().await? {
            let path = entry.path();
            if !path.is_file() {
                continue;
            }
            let matches = path
                .extension()
                .and_then(|ext| ext.to_str())
                .map(|ext| extensions.contains(&ext.to_ascii_lowercase().as_str()))
                .unwrap_or(false);
            if !matches {
                continue;
            }
            if let Some(name) = path.file_name().and_then(|name| name.to_str()) {
                files.push(name.to_string());
            }
        }
        files.sort();
        Ok(files)
    }
}

/// Reject names that could escape the catalog directory.
fn validate_file_name(file: &str) -> Result<()> {
    if file.contains('/') || file.contains('\\') || file.contains("..") {
        bail!("invalid avatar config file name '{}'", file);
    }
    Ok(())
}

#[async_trait]
impl AssetCatalog for FileAssetCatalog {
    async fn background_files(&self) -> Result<Vec<String>> {
        Self::list_files(&self.backgrounds_dir, BACKGROUND_EXTENSIONS).await
    }

    async fn avatar_config_files(&self) -> Result<Vec<String>> {
        Self::list_files(&self.avatar_configs_dir, AVATAR_CONFIG_EXTENSIONS).await
    }

    async fn switch_avatar_config(&self, file: &str) -> Result<AvatarSwitch> {
        validate_file_name(file)?;

        let path = self.avatar_configs_dir.join(file);
        if !path.is_file() {
            bail!("avatar config '{}' not found", file);
        }

        let conf_name = path
            .file_stem()
            .and_then(|stem| stem.to_str())
            .unwrap_or(file)
            .to_string();

        info!(file = %file, conf_name = %conf_name, "Switched avatar config");
        Ok(AvatarSwitch {
            file: file.to_string(),
            model: self.active_model.clone(),
            conf_name,
        })
    }
}
