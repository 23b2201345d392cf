use anyhow::{Context, Result};
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::path::{Path, PathBuf};

use crate::api::ProviderEndpoints;
use crate::registry::Provider;

const APP_DIR: &str = "chat0";
const CONFIG_FILE: &str = "config.toml";
const DATABASE_FILE: &str = "chat0.sqlite";

pub const DB_ENV: &str = "CHAT0_DB";
pub const SUMMARY_ENDPOINT_ENV: &str = "CHAT0_SUMMARY_ENDPOINT";

/// Where API keys are persisted.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum SecretsBackend {
    /// The settings table of the conversation database.
    #[default]
    Database,
    /// The OS credential store.
    Keyring,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct SummaryConfig {
    /// External title endpoint; titles are generated in-process when unset.
    pub endpoint: Option<String>,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct ProviderConfig {
    pub base_url: Option<String>,
}

/// Settings read from `config.toml`. Every field is optional.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct AppConfig {
    pub database_path: Option<PathBuf>,
    pub secrets: SecretsBackend,
    /// Prepended to every conversation sent to a provider.
    pub system_prompt: Option<String>,
    pub summary: SummaryConfig,
    /// Keyed by provider name (`openai`, `openrouter`, ...).
    pub providers: HashMap<String, ProviderConfig>,
}

impl AppConfig {
    /// Reads `path`, or the default config file when `path` is `None`, then
    /// applies environment overrides. A missing default file yields defaults; a
    /// missing explicit file is an error.
    pub fn load(path: Option<&Path>) -> Result<Self> {
        let mut config = match path {
            Some(path) => Self::from_file(path)?,
            None => match default_config_path() {
                Some(path) if path.exists() => Self::from_file(&path)?,
                _ => {
                    log::debug!("No config file found, using defaults");
                    Self::default()
                }
            },
        };
        config.apply_overrides(|name| std::env::var(name).ok());
        Ok(config)
    }

    fn from_file(path: &Path) -> Result<Self> {
        log::info!("Loading config from {}", path.display());
        let content = std::fs::read_to_string(path)
            .with_context(|| format!("Failed to read config file {}", path.display()))?;
        toml::from_str(&content)
            .with_context(|| format!("Failed to parse config file {}", path.display()))
    }

    fn apply_overrides(&mut self, var: impl Fn(&str) -> Option<String>) {
        if let Some(db) = var(DB_ENV).filter(|v| !v.trim().is_empty()) {
            log::debug!("Database path overridden by {}", DB_ENV);
            self.database_path = Some(PathBuf::from(db));
        }
        if let Some(endpoint) = var(SUMMARY_ENDPOINT_ENV).filter(|v| !v.trim().is_empty()) {
            log::debug!("Summary endpoint overridden by {}", SUMMARY_ENDPOINT_ENV);
            self.summary.endpoint = Some(endpoint);
        }
    }

    pub fn database_path(&self) -> Result<PathBuf> {
        match &self.database_path {
            Some(path) => Ok(path.clone()),
            None => dirs::data_local_dir()
                .map(|dir| dir.join(APP_DIR).join(DATABASE_FILE))
                .context("Could not determine a data directory; set database_path or CHAT0_DB"),
        }
    }

    pub fn endpoints(&self) -> ProviderEndpoints {
        let mut endpoints = ProviderEndpoints::default();
        for (name, provider_config) in &self.providers {
            let Some(base_url) = &provider_config.base_url else {
                continue;
            };
            match name.parse::<Provider>() {
                Ok(provider) => endpoints = endpoints.with_override(provider, base_url.clone()),
                Err(e) => log::warn!("Ignoring config for unknown provider: {}", e),
            }
        }
        endpoints
    }
}

pub fn default_config_path() -> Option<PathBuf> {
    dirs::config_dir().map(|dir| dir.join(APP_DIR).join(CONFIG_FILE))
}

/// Provider keys present in the environment, used as non-persisted fallbacks.
pub fn env_keys() -> HashMap<Provider, String> {
    keys_from(|name| std::env::var(name).ok())
}

fn keys_from(var: impl Fn(&str) -> Option<String>) -> HashMap<Provider, String> {
    Provider::ALL
        .into_iter()
        .filter_map(|provider| {
            let key = var(provider.env_var())?;
            let key = key.trim();
            if key.is_empty() {
                return None;
            }
            log::debug!(
                "Found API key for {} in environment variable: {}",
                provider,
                provider.env_var()
            );
            Some((provider, key.to_string()))
        })
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parses_full_config() {
        let config: AppConfig = toml::from_str(
            r#"
            database_path = "/tmp/chat.sqlite"
            secrets = "keyring"
            system_prompt = "Be brief."

            [summary]
            endpoint = "http://localhost:3000/api/completion"

            [providers.openai]
            base_url = "http://localhost:8080/v1"

            [providers.mistral]
            base_url = "http://nowhere"
            "#,
        )
        .unwrap();

        assert_eq!(config.secrets, SecretsBackend::Keyring);
        assert_eq!(config.database_path().unwrap(), PathBuf::from("/tmp/chat.sqlite"));
        assert_eq!(config.system_prompt.as_deref(), Some("Be brief."));
        let endpoints = config.endpoints();
        assert_eq!(endpoints.base_url(Provider::OpenAI), "http://localhost:8080/v1");
        assert_eq!(
            endpoints.base_url(Provider::Google),
            Provider::Google.default_base_url()
        );
    }

    #[test]
    fn empty_config_uses_defaults() {
        let config: AppConfig = toml::from_str("").unwrap();
        assert_eq!(config, AppConfig::default());
        assert_eq!(config.secrets, SecretsBackend::Database);
    }

    #[test]
    fn environment_overrides_file() {
        let mut config = AppConfig::default();
        config.apply_overrides(|name| match name {
            DB_ENV => Some("/data/override.sqlite".to_string()),
            SUMMARY_ENDPOINT_ENV => Some("  ".to_string()),
            _ => None,
        });
        assert_eq!(config.database_path, Some(PathBuf::from("/data/override.sqlite")));
        assert_eq!(config.summary.endpoint, None);
    }

    #[test]
    fn explicit_missing_file_is_an_error() {
        let dir = tempfile::tempdir().unwrap();
        assert!(AppConfig::load(Some(&dir.path().join("absent.toml"))).is_err());
    }

    #[test]
    fn blank_environment_keys_are_skipped() {
        let keys = keys_from(|name| match name {
            "OPENAI_API_KEY" => Some(" sk-env ".to_string()),
            "GOOGLE_API_KEY" => Some(String::new()),
            _ => None,
        });
        assert_eq!(keys.len(), 1);
        assert_eq!(keys.get(&Provider::OpenAI).map(String::as_str), Some("sk-env"));
    }
}
