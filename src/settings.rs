//! Persisted user settings: provider API keys, custom models, the selected
//! model and favorites.
//!
//! Each store owns one JSON record written through a [`SettingsBackend`]. After
//! every write the store announces the record key on a [`SettingsBus`]; other
//! instances sharing the bus reload the record (last write wins).

use anyhow::{Context, Result};
use async_trait::async_trait;
use keyring::Entry;
use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, HashMap};
use std::sync::{Arc, Weak};
use tokio::sync::{broadcast, watch, Mutex, OwnedMutexGuard, RwLock};
use tokio::task::JoinHandle;
use uuid::Uuid;

use crate::registry::{self, ModelConfig, Provider, DEFAULT_MODEL};
pub use crate::storage::SettingsBackend;

pub const KEYS_RECORD: &str = "api-keys";
pub const MODEL_RECORD: &str = "selected-model";

const KEYRING_SERVICE: &str = "chat0";
const RETRY_CANDIDATES: usize = 6;

/// Stores records in the OS credential store, one entry per record key.
pub struct KeyringBackend {
    service: String,
}

impl KeyringBackend {
    pub fn new() -> Self {
        Self::with_service(KEYRING_SERVICE)
    }

    pub fn with_service(service: impl Into<String>) -> Self {
        Self {
            service: service.into(),
        }
    }
}

impl Default for KeyringBackend {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl SettingsBackend for KeyringBackend {
    async fn load(&self, key: &str) -> Result<Option<String>> {
        let service = self.service.clone();
        let user = key.to_string();
        // The platform credential APIs block.
        tokio::task::spawn_blocking(move || {
            let entry = Entry::new(&service, &user).context("Failed to create keyring entry")?;
            log::debug!("Reading record '{}' from keyring service: {}", user, service);
            match entry.get_password() {
                Ok(value) => Ok(Some(value)),
                Err(keyring::Error::NoEntry) => Ok(None),
                Err(e) => Err(anyhow::Error::from(e)
                    .context(format!("Failed to read '{}' from keyring", user))),
            }
        })
        .await
        .context("Keyring task panicked")?
    }

    async fn save(&self, key: &str, value: &str) -> Result<()> {
        let service = self.service.clone();
        let user = key.to_string();
        let value = value.to_string();
        tokio::task::spawn_blocking(move || {
            let entry = Entry::new(&service, &user)
                .context("Failed to create keyring entry for setting password")?;
            log::info!("Writing record '{}' to keyring service: {}", user, service);
            entry
                .set_password(&value)
                .with_context(|| format!("Failed to write '{}' to keyring", user))
        })
        .await
        .context("Keyring task panicked")?
    }
}

/// A write notification: which record changed and which store instance wrote it.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SettingsChange {
    pub key: String,
    pub origin: Uuid,
}

/// In-process change notification shared by settings-store instances.
#[derive(Debug, Clone)]
pub struct SettingsBus {
    tx: broadcast::Sender<SettingsChange>,
}

impl SettingsBus {
    pub fn new() -> Self {
        let (tx, _) = broadcast::channel(64);
        Self { tx }
    }

    pub fn publish(&self, change: SettingsChange) {
        let _ = self.tx.send(change);
    }

    pub fn subscribe(&self) -> broadcast::Receiver<SettingsChange> {
        self.tx.subscribe()
    }
}

impl Default for SettingsBus {
    fn default() -> Self {
        Self::new()
    }
}

/// One JSON record, its in-memory copy and the sync plumbing around it.
struct PersistedRecord<R> {
    key: &'static str,
    id: Uuid,
    backend: Arc<dyn SettingsBackend>,
    bus: SettingsBus,
    value: RwLock<R>,
    revision: watch::Sender<u64>,
}

impl<R> PersistedRecord<R>
where
    R: Serialize + DeserializeOwned + Default + Clone + Send + Sync + 'static,
{
    async fn open(
        key: &'static str,
        backend: Arc<dyn SettingsBackend>,
        bus: SettingsBus,
    ) -> Result<(Arc<Self>, SyncTask)> {
        let value = match backend.load(key).await? {
            Some(json) => decode(key, &json).unwrap_or_default(),
            None => R::default(),
        };
        let (revision, _) = watch::channel(0);
        let record = Arc::new(Self {
            key,
            id: Uuid::new_v4(),
            backend,
            bus,
            value: RwLock::new(value),
            revision,
        });
        let sync = record.spawn_sync();
        Ok((record, sync))
    }

    /// Applies `f` to a copy, persists it and only then makes it current. A
    /// failed save leaves the record untouched.
    async fn update<T>(&self, f: impl FnOnce(&mut R) -> T) -> Result<T> {
        let mut value = self.value.write().await;
        let mut next = (*value).clone();
        let out = f(&mut next);
        let json = serde_json::to_string(&next)?;
        self.backend
            .save(self.key, &json)
            .await
            .with_context(|| format!("Failed to persist settings record '{}'", self.key))?;
        *value = next;
        drop(value);

        self.bump();
        self.bus.publish(SettingsChange {
            key: self.key.to_string(),
            origin: self.id,
        });
        Ok(out)
    }

    /// Reloads the persisted record. A missing or unreadable record keeps the
    /// in-memory value.
    async fn rehydrate(&self) -> Result<()> {
        let Some(json) = self.backend.load(self.key).await? else {
            return Ok(());
        };
        let Some(fresh) = decode::<R>(self.key, &json) else {
            return Ok(());
        };
        log::debug!("Rehydrated settings record '{}'", self.key);
        *self.value.write().await = fresh;
        self.bump();
        Ok(())
    }

    fn bump(&self) {
        self.revision.send_modify(|rev| *rev += 1);
    }

    fn spawn_sync(self: &Arc<Self>) -> SyncTask {
        let weak: Weak<Self> = Arc::downgrade(self);
        let mut changes = self.bus.subscribe();
        let (key, id) = (self.key, self.id);

        SyncTask(tokio::spawn(async move {
            loop {
                let relevant = match changes.recv().await {
                    Ok(change) => change.key == key && change.origin != id,
                    Err(broadcast::error::RecvError::Lagged(_)) => true,
                    Err(broadcast::error::RecvError::Closed) => break,
                };
                if !relevant {
                    continue;
                }
                let Some(record) = weak.upgrade() else { break };
                if let Err(e) = record.rehydrate().await {
                    log::error!("Failed to rehydrate settings record '{}': {:?}", key, e);
                }
            }
        }))
    }
}

fn decode<R: DeserializeOwned>(key: &str, json: &str) -> Option<R> {
    match serde_json::from_str(json) {
        Ok(value) => Some(value),
        Err(e) => {
            log::error!("Ignoring unreadable settings record '{}': {}", key, e);
            None
        }
    }
}

/// Stops the rehydrate listener when its store goes away.
struct SyncTask(JoinHandle<()>);

impl Drop for SyncTask {
    fn drop(&mut self) {
        self.0.abort();
    }
}

// --- Key Store ---

#[derive(Serialize, Deserialize, Clone, Debug, Default, PartialEq)]
#[serde(default)]
pub struct CustomModels {
    pub openrouter: Vec<String>,
}

#[derive(Serialize, Deserialize, Clone, Debug, PartialEq)]
#[serde(rename_all = "camelCase", default)]
pub struct KeyRecord {
    pub keys: BTreeMap<Provider, String>,
    pub custom_models: CustomModels,
}

impl Default for KeyRecord {
    fn default() -> Self {
        Self {
            keys: Provider::ALL.into_iter().map(|p| (p, String::new())).collect(),
            custom_models: CustomModels::default(),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum KeyStatus {
    Empty,
    Valid,
    Invalid,
}

/// Checks the key's shape against the provider's known key prefix.
pub fn validate_key(provider: Provider, key: &str) -> KeyStatus {
    let key = key.trim();
    if key.is_empty() {
        return KeyStatus::Empty;
    }
    let valid = match provider {
        Provider::Google => key.starts_with("AIza"),
        Provider::OpenAI => key.starts_with("sk-"),
        Provider::OpenRouter => key.starts_with("sk-or-"),
        Provider::Anthropic => key.starts_with("sk-ant-"),
        Provider::DeepSeek => true,
    };
    if valid {
        KeyStatus::Valid
    } else {
        KeyStatus::Invalid
    }
}

/// Provider API keys and custom OpenRouter model ids.
pub struct KeyStore {
    record: Arc<PersistedRecord<KeyRecord>>,
    fallback: HashMap<Provider, String>,
    _sync: SyncTask,
}

impl KeyStore {
    /// `fallback` keys (usually from the environment) answer [`KeyStore::get_key`]
    /// when no key is stored, and are never persisted.
    pub async fn open(
        backend: Arc<dyn SettingsBackend>,
        bus: SettingsBus,
        fallback: HashMap<Provider, String>,
    ) -> Result<Self> {
        let (record, sync) = PersistedRecord::open(KEYS_RECORD, backend, bus).await?;
        Ok(Self {
            record,
            fallback,
            _sync: sync,
        })
    }

    /// Merges `keys` into the stored keys.
    pub async fn set_keys(&self, keys: impl IntoIterator<Item = (Provider, String)>) -> Result<()> {
        let keys: Vec<_> = keys.into_iter().collect();
        log::info!(
            "Updating API keys for: {:?}",
            keys.iter().map(|(p, _)| p.as_str()).collect::<Vec<_>>()
        );
        self.record
            .update(|record| {
                for (provider, key) in keys {
                    record.keys.insert(provider, key.trim().to_string());
                }
            })
            .await
    }

    /// The key for `provider`; an empty stored key counts as absent.
    pub async fn get_key(&self, provider: Provider) -> Option<String> {
        let stored = self.record.value.read().await.keys.get(&provider).cloned();
        stored
            .filter(|key| !key.is_empty())
            .or_else(|| self.fallback.get(&provider).filter(|key| !key.is_empty()).cloned())
    }

    pub async fn has_required_keys(&self) -> bool {
        for provider in Provider::ALL {
            if self.get_key(provider).await.is_some() {
                return true;
            }
        }
        false
    }

    pub async fn is_model_enabled(&self, model: &ModelConfig) -> bool {
        self.get_key(model.provider).await.is_some()
    }

    pub async fn custom_models(&self) -> Vec<String> {
        self.record.value.read().await.custom_models.openrouter.clone()
    }

    pub async fn set_custom_models(&self, models: Vec<String>) -> Result<()> {
        self.record
            .update(|record| record.custom_models.openrouter = models)
            .await
    }

    /// Returns false when the id is blank or already present.
    pub async fn add_custom_model(&self, model: &str) -> Result<bool> {
        let model = model.trim().to_string();
        if model.is_empty() {
            return Ok(false);
        }
        self.record
            .update(|record| {
                let models = &mut record.custom_models.openrouter;
                if models.contains(&model) {
                    return false;
                }
                models.push(model);
                true
            })
            .await
    }

    pub async fn remove_custom_model(&self, model: &str) -> Result<bool> {
        self.record
            .update(|record| {
                let models = &mut record.custom_models.openrouter;
                let before = models.len();
                models.retain(|m| m != model);
                models.len() != before
            })
            .await
    }

    pub async fn rehydrate(&self) -> Result<()> {
        self.record.rehydrate().await
    }

    /// Ticks after every local write or rehydrate.
    pub fn subscribe_revision(&self) -> watch::Receiver<u64> {
        self.record.revision.subscribe()
    }
}

// --- Model Selection Store ---

#[derive(Serialize, Deserialize, Clone, Debug, PartialEq)]
#[serde(rename_all = "camelCase", default)]
pub struct ModelRecord {
    pub selected_model: String,
    pub favorite_models: Vec<String>,
}

impl Default for ModelRecord {
    fn default() -> Self {
        Self {
            selected_model: DEFAULT_MODEL.to_string(),
            favorite_models: Vec::new(),
        }
    }
}

/// Proof that a retry has swapped the selected model. At most one lease exists
/// per store; it is released when dropped.
pub struct RetryLease {
    previous: String,
    _guard: OwnedMutexGuard<()>,
}

impl RetryLease {
    /// The selection to put back when the retry ends.
    pub fn previous(&self) -> &str {
        &self.previous
    }
}

/// The selected model and the user's favorites.
pub struct ModelStore {
    record: Arc<PersistedRecord<ModelRecord>>,
    retry: Arc<Mutex<()>>,
    _sync: SyncTask,
}

impl ModelStore {
    pub async fn open(backend: Arc<dyn SettingsBackend>, bus: SettingsBus) -> Result<Self> {
        let (record, sync) = PersistedRecord::open(MODEL_RECORD, backend, bus).await?;
        Ok(Self {
            record,
            retry: Arc::new(Mutex::new(())),
            _sync: sync,
        })
    }

    pub async fn selected_model(&self) -> String {
        self.record.value.read().await.selected_model.clone()
    }

    pub async fn set_model(&self, name: &str) -> Result<()> {
        log::info!("Selecting model: {}", name);
        let name = name.to_string();
        self.record.update(|record| record.selected_model = name).await
    }

    /// Selects `name` for the length of one retry. Returns `None` while another
    /// retry, from any session sharing this store, still holds the selection.
    pub async fn begin_retry(&self, name: &str) -> Result<Option<RetryLease>> {
        let Ok(guard) = self.retry.clone().try_lock_owned() else {
            return Ok(None);
        };
        let previous = self.selected_model().await;
        self.set_model(name).await?;
        Ok(Some(RetryLease {
            previous,
            _guard: guard,
        }))
    }

    /// Puts back the selection saved by `lease`, then releases it.
    pub async fn end_retry(&self, lease: RetryLease) -> Result<()> {
        self.set_model(&lease.previous).await
    }

    pub async fn model_config(&self) -> ModelConfig {
        registry::resolve(&self.selected_model().await)
    }

    pub async fn is_custom_model(&self) -> bool {
        registry::is_custom(&self.selected_model().await)
    }

    /// Returns whether `name` is a favorite afterwards.
    pub async fn toggle_favorite(&self, name: &str) -> Result<bool> {
        let name = name.to_string();
        self.record
            .update(|record| {
                let favorites = &mut record.favorite_models;
                if let Some(pos) = favorites.iter().position(|m| *m == name) {
                    favorites.remove(pos);
                    false
                } else {
                    favorites.push(name);
                    true
                }
            })
            .await
    }

    pub async fn is_favorite(&self, name: &str) -> bool {
        self.record
            .value
            .read()
            .await
            .favorite_models
            .iter()
            .any(|m| m == name)
    }

    pub async fn favorites(&self) -> Vec<String> {
        self.record.value.read().await.favorite_models.clone()
    }

    /// Models offered for a retry of a reply produced by `current`: favorites when
    /// there are any, otherwise the catalogue, limited to models with a key.
    pub async fn retry_candidates(&self, current: &str, keys: &KeyStore) -> Vec<ModelConfig> {
        let favorites = self.favorites().await;
        let names: Vec<String> = if favorites.is_empty() {
            registry::MODELS.iter().map(|m| m.name.to_string()).collect()
        } else {
            favorites
        };

        let mut candidates = Vec::new();
        for name in names.iter().filter(|name| name.as_str() != current) {
            let model = registry::resolve(name);
            if keys.is_model_enabled(&model).await {
                candidates.push(model);
                if candidates.len() == RETRY_CANDIDATES {
                    break;
                }
            }
        }
        candidates
    }

    pub async fn rehydrate(&self) -> Result<()> {
        self.record.rehydrate().await
    }

    pub fn subscribe_revision(&self) -> watch::Receiver<u64> {
        self.record.revision.subscribe()
    }
}
