use anyhow::{Context, Result};
use dashmap::DashMap;
use std::sync::Arc;
use uuid::Uuid;

use crate::api::{LLMApiProvider, OpenAICompatibleProvider};
use crate::config::{self, AppConfig, SecretsBackend};
use crate::error::StorageError;
use crate::events::EventEmitter;
use crate::session::{ChatSession, SessionDeps};
use crate::settings::{KeyStore, KeyringBackend, ModelStore, SettingsBackend, SettingsBus};
use crate::storage::StorageManager;
use crate::summary::{DirectSummaryClient, HttpSummaryClient, SummaryClient, SummaryRequestor};

// Core application state shared by every command
#[derive(Clone)]
pub struct AppState {
    pub storage: StorageManager,
    pub keys: Arc<KeyStore>,
    pub models: Arc<ModelStore>,
    pub api_provider: Arc<dyn LLMApiProvider>,
    pub summaries: SummaryRequestor,
    pub events: EventEmitter,
    system_prompt: Option<String>,
    // Live sessions by thread id
    sessions: Arc<DashMap<Uuid, ChatSession>>,
}

impl AppState {
    /// Opens the database and settings stores described by `config`.
    pub async fn init(config: &AppConfig) -> Result<Self> {
        let db_path = config.database_path()?;
        let storage = StorageManager::open(&db_path)
            .await
            .with_context(|| format!("Failed to open database at {}", db_path.display()))?;

        let bus = SettingsBus::new();
        let settings_backend: Arc<dyn SettingsBackend> = Arc::new(storage.clone());
        let key_backend: Arc<dyn SettingsBackend> = match config.secrets {
            SecretsBackend::Database => settings_backend.clone(),
            SecretsBackend::Keyring => Arc::new(KeyringBackend::new()),
        };
        let keys = KeyStore::open(key_backend, bus.clone(), config::env_keys())
            .await
            .context("Failed to load API keys")?;
        let models = ModelStore::open(settings_backend, bus)
            .await
            .context("Failed to load model selection")?;

        let provider = Arc::new(OpenAICompatibleProvider::new(config.endpoints()));
        let summary_client: Arc<dyn SummaryClient> = match &config.summary.endpoint {
            Some(endpoint) => {
                log::info!("Using summary endpoint: {}", endpoint);
                Arc::new(HttpSummaryClient::new(endpoint.clone()))
            }
            None => Arc::new(DirectSummaryClient::new(provider.clone())),
        };

        Ok(Self::new(
            storage,
            Arc::new(keys),
            Arc::new(models),
            provider,
            summary_client,
            EventEmitter::new(),
            config.system_prompt.clone(),
        ))
    }

    pub fn new(
        storage: StorageManager,
        keys: Arc<KeyStore>,
        models: Arc<ModelStore>,
        api_provider: Arc<dyn LLMApiProvider>,
        summary_client: Arc<dyn SummaryClient>,
        events: EventEmitter,
        system_prompt: Option<String>,
    ) -> Self {
        let summaries =
            SummaryRequestor::new(summary_client, storage.clone(), keys.clone(), events.clone());
        Self {
            storage,
            keys,
            models,
            api_provider,
            summaries,
            events,
            system_prompt,
            sessions: Arc::new(DashMap::new()),
        }
    }

    fn session_deps(&self) -> SessionDeps {
        SessionDeps {
            storage: self.storage.clone(),
            provider: self.api_provider.clone(),
            keys: self.keys.clone(),
            models: self.models.clone(),
            summaries: Some(self.summaries.clone()),
            events: self.events.clone(),
            system_prompt: self.system_prompt.clone(),
        }
    }

    /// The session for `thread_id`, opened on first use.
    pub async fn session(&self, thread_id: Uuid) -> Result<ChatSession, StorageError> {
        if let Some(session) = self.sessions.get(&thread_id) {
            return Ok(session.clone());
        }
        let session = ChatSession::open(thread_id, self.session_deps()).await?;
        // A concurrent caller may have opened one meanwhile; keep the first.
        Ok(self.sessions.entry(thread_id).or_insert(session).clone())
    }

    pub fn existing_session(&self, thread_id: Uuid) -> Option<ChatSession> {
        self.sessions.get(&thread_id).map(|s| s.clone())
    }

    pub fn forget_session(&self, thread_id: Uuid) -> Option<ChatSession> {
        self.sessions.remove(&thread_id).map(|(_, session)| session)
    }
}
