//! TOML configuration loaded from `$RILL_HOME/config.toml`.

use std::collections::{BTreeMap, HashSet};
use std::path::{Path, PathBuf};
use std::sync::Arc;

use anyhow::{Context, Result};
use serde::{Deserialize, Serialize};

use crate::providers::{
    Provider, ProviderKind, ProviderRegistry, anthropic::AnthropicClient, openai::OpenAiClient,
};

pub const CONFIG_FILE: &str = "config.toml";
pub const DEFAULT_PLAN_FILE: &str = "PLAN.md";

/// Root of rill's state. `$RILL_HOME` wins, then `~/.rill`.
pub fn home_dir() -> PathBuf {
    if let Some(home) = std::env::var_os("RILL_HOME")
        && !home.is_empty()
    {
        return PathBuf::from(home);
    }
    let home = std::env::var_os("HOME").map_or_else(|| PathBuf::from("."), PathBuf::from);
    home.join(".rill")
}

pub fn config_path() -> PathBuf {
    home_dir().join(CONFIG_FILE)
}

#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq)]
#[serde(default)]
pub struct Config {
    pub models: ModelsConfig,
    pub providers: ProvidersConfig,
    pub plan: PlanConfig,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq)]
#[serde(default)]
pub struct ModelsConfig {
    /// Global whitelist, applied when no per-provider list matches.
    pub whitelist: Vec<String>,
    /// Per-provider overrides, keyed by provider name or kind id.
    pub provider_whitelist: BTreeMap<String, Vec<String>>,
}

impl ModelsConfig {
    /// Whitelist for one provider. Precedence: entry keyed by provider
    /// name, then by kind id, then the global list. Empty means allow
    /// everything.
    pub fn whitelist_for(&self, name: &str, kind: ProviderKind) -> HashSet<String> {
        let list = self
            .provider_whitelist
            .get(name)
            .or_else(|| self.provider_whitelist.get(kind.id()))
            .unwrap_or(&self.whitelist);
        list.iter()
            .map(|entry| entry.trim().to_string())
            .filter(|entry| !entry.is_empty())
            .collect()
    }
}

#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq)]
#[serde(default)]
pub struct ProvidersConfig {
    pub openai: ProviderSettings,
    pub anthropic: ProviderSettings,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(default)]
pub struct ProviderSettings {
    pub enabled: bool,
    pub api_key: String,
    pub base_url: Option<String>,
}

impl Default for ProviderSettings {
    fn default() -> Self {
        Self {
            enabled: true,
            api_key: String::new(),
            base_url: None,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(default)]
pub struct PlanConfig {
    /// "memory" or "file".
    pub storage: String,
    pub file_path: String,
    pub auto_write: bool,
}

impl Default for PlanConfig {
    fn default() -> Self {
        Self {
            storage: "memory".to_string(),
            file_path: DEFAULT_PLAN_FILE.to_string(),
            auto_write: false,
        }
    }
}

impl PlanConfig {
    pub fn file_backed(&self) -> bool {
        self.storage == "file"
    }
}

impl Config {
    /// Load from `path`, or return defaults when no file exists yet.
    pub fn load(path: &Path) -> Result<Self> {
        if !path.exists() {
            return Ok(Self::default());
        }
        let raw = std::fs::read_to_string(path)
            .with_context(|| format!("failed to read {}", path.display()))?;
        let mut config: Self = toml::from_str(&raw)
            .with_context(|| format!("failed to parse {}", path.display()))?;
        config.normalize();
        Ok(config)
    }

    pub fn save(&self, path: &Path) -> Result<()> {
        if let Some(parent) = path.parent() {
            std::fs::create_dir_all(parent)
                .with_context(|| format!("failed to create {}", parent.display()))?;
        }
        let raw = toml::to_string_pretty(self).context("failed to serialize config")?;
        std::fs::write(path, raw)
            .with_context(|| format!("failed to write {}", path.display()))?;
        Ok(())
    }

    fn normalize(&mut self) {
        let storage = self.plan.storage.trim().to_ascii_lowercase();
        self.plan.storage = match storage.as_str() {
            "file" => "file".to_string(),
            _ => "memory".to_string(),
        };
        if self.plan.file_path.trim().is_empty() {
            self.plan.file_path = DEFAULT_PLAN_FILE.to_string();
        }
    }

    /// Build the provider registry from the enabled provider sections.
    pub fn build_registry(&self) -> ProviderRegistry {
        let mut providers: Vec<Arc<dyn Provider>> = Vec::new();
        if self.providers.openai.enabled {
            providers.push(Arc::new(OpenAiClient::new(
                self.providers.openai.base_url.as_deref(),
                &self.providers.openai.api_key,
            )));
        }
        if self.providers.anthropic.enabled {
            providers.push(Arc::new(AnthropicClient::new(
                self.providers.anthropic.base_url.as_deref(),
                &self.providers.anthropic.api_key,
            )));
        }
        ProviderRegistry::new(providers)
    }
}
