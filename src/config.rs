// Copyright (c) 2024-2025 Jesse Morgan / Morgan Forge
// SPDX-License-Identifier: AGPL-3.0-or-later

//! Configuration for mediafetch.
//!
//! Read from `~/.mediafetch/config.json`. Every field is optional in the
//! file; missing fields take their defaults and a missing file yields the
//! default configuration.

use std::fs;
use std::path::{Path, PathBuf};
use std::sync::Arc;

use anyhow::{Context, Result};
use serde::{Deserialize, Serialize};

use crate::fetch::{ActivationPolicy, CopyToDownloads, NoopHook, SharedHook};

/// Environment variable overriding [`FetchConfig::activation_policy`].
pub const ACTIVATION_ENV: &str = "MEDIAFETCH_ACTIVATION";

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct FetchConfig {
    /// Which wanted entries get a running fetch
    pub activation_policy: ActivationPolicy,
    /// Where finished documents are copied for the user
    pub downloads_dir: Option<PathBuf>,
    /// Where the backend keeps fetched files
    pub cache_dir: Option<PathBuf>,
    /// Default tracing filter when RUST_LOG is unset
    pub log_level: String,
}

impl Default for FetchConfig {
    fn default() -> Self {
        Self {
            activation_policy: ActivationPolicy::default(),
            downloads_dir: None,
            cache_dir: None,
            log_level: "info".to_string(),
        }
    }
}

impl FetchConfig {
    /// Directory holding the config file.
    pub fn config_dir() -> Result<PathBuf> {
        let home = dirs::home_dir().context("Could not find home directory")?;
        Ok(home.join(".mediafetch"))
    }

    /// Default config file location.
    pub fn config_path() -> Result<PathBuf> {
        Ok(Self::config_dir()?.join("config.json"))
    }

    /// Load the user's config file with environment overrides applied.
    pub fn load() -> Result<Self> {
        let mut config = Self::load_from(&Self::config_path()?)?;
        config.apply_env_overrides()?;
        Ok(config)
    }

    /// Load a config file, falling back to defaults if it does not exist.
    pub fn load_from(path: &Path) -> Result<Self> {
        if !path.exists() {
            tracing::debug!("No config at {}, using defaults", path.display());
            return Ok(Self::default());
        }
        let content = fs::read_to_string(path)
            .with_context(|| format!("Failed to read config file: {:?}", path))?;
        serde_json::from_str(&content)
            .with_context(|| format!("Failed to parse config file: {:?}", path))
    }

    pub fn save_to(&self, path: &Path) -> Result<()> {
        if let Some(parent) = path.parent() {
            fs::create_dir_all(parent)
                .with_context(|| format!("Failed to create directory: {:?}", parent))?;
        }
        let content = serde_json::to_string_pretty(self)?;
        fs::write(path, content).with_context(|| format!("Failed to write config file: {:?}", path))
    }

    /// Apply `MEDIAFETCH_ACTIVATION` if set.
    pub fn apply_env_overrides(&mut self) -> Result<()> {
        if let Ok(value) = std::env::var(ACTIVATION_ENV) {
            self.set_activation(&value)?;
        }
        Ok(())
    }

    fn set_activation(&mut self, value: &str) -> Result<()> {
        self.activation_policy = value
            .parse()
            .map_err(|e: String| anyhow::anyhow!(e))
            .with_context(|| format!("Invalid {}", ACTIVATION_ENV))?;
        Ok(())
    }

    /// Completion hook implied by this configuration.
    ///
    /// Copying to downloads needs both directories; otherwise completions are
    /// not post-processed.
    pub fn completion_hook(&self) -> SharedHook {
        match (&self.cache_dir, &self.downloads_dir) {
            (Some(cache_dir), Some(downloads_dir)) => {
                Arc::new(CopyToDownloads::new(cache_dir, downloads_dir))
            }
            _ => Arc::new(NoopHook),
        }
    }
}
