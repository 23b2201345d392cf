// Application commands invoked by the front end

use anyhow::{Context, Result};
use serde::Serialize;
use uuid::Uuid;

use crate::models::{Message, MessageSummary, Role, Thread};
use crate::registry::{self, ModelConfig, Provider};
use crate::session::{ChatSession, SessionStatus};
use crate::settings::{validate_key, KeyStatus};
use crate::state::AppState;

#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct ThreadView {
    pub thread: Thread,
    pub messages: Vec<Message>,
    pub summaries: Vec<MessageSummary>,
}

#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct ModelListing {
    pub model: ModelConfig,
    pub enabled: bool,
    pub favorite: bool,
    pub selected: bool,
}

#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct KeyListing {
    pub provider: Provider,
    pub configured: bool,
}

pub async fn list_threads(state: &AppState) -> Result<Vec<Thread>> {
    log::info!("Listing threads");
    state.storage.get_threads().await.context("Failed to load threads")
}

pub async fn show_thread(state: &AppState, thread_id: Uuid) -> Result<ThreadView> {
    let thread = state
        .storage
        .get_thread(thread_id)
        .await?
        .with_context(|| format!("Thread {} not found", thread_id))?;
    let messages = state.storage.get_messages_by_thread_id(thread_id).await?;
    let summaries = state.storage.get_message_summaries(thread_id).await?;
    Ok(ThreadView {
        thread,
        messages,
        summaries,
    })
}

pub async fn rename_thread(state: &AppState, thread_id: Uuid, title: &str) -> Result<()> {
    let title = title.trim();
    anyhow::ensure!(!title.is_empty(), "Title cannot be empty");
    state
        .storage
        .update_thread(thread_id, title)
        .await
        .context("Failed to rename thread")
}

/// Stops any reply in flight for the thread, then deletes it.
pub async fn delete_thread(state: &AppState, thread_id: Uuid) -> Result<()> {
    log::warn!("Deleting thread {}", thread_id);
    if let Some(session) = state.forget_session(thread_id) {
        session.stop().await;
    }
    state
        .storage
        .delete_thread(thread_id)
        .await
        .context("Failed to delete thread")
}

pub async fn search(state: &AppState, query: &str) -> Result<Vec<Message>> {
    state
        .storage
        .search_messages(query)
        .await
        .context("Search failed")
}

/// Sends `text` to `thread_id` (a new thread when `None`) and starts the reply.
/// Returns the session and the user message id, or `None` for the message id when
/// the input was ignored.
pub async fn send_message(
    state: &AppState,
    thread_id: Option<Uuid>,
    text: &str,
) -> Result<(ChatSession, Option<Uuid>)> {
    let thread_id = thread_id.unwrap_or_else(Uuid::new_v4);
    let session = state.session(thread_id).await?;
    let message_id = session.send(text).await?;
    Ok((session, message_id))
}

pub async fn retry(state: &AppState, thread_id: Uuid, model: &str) -> Result<(ChatSession, Option<Uuid>)> {
    let session = state.session(thread_id).await?;
    let reply_id = session.retry_with_model(model).await?;
    Ok((session, reply_id))
}

pub async fn stop(state: &AppState, thread_id: Uuid) -> bool {
    match state.existing_session(thread_id) {
        Some(session) => session.stop().await,
        None => false,
    }
}

/// Waits until the session is no longer busy and returns the reply it produced.
pub async fn wait_for_reply(session: &ChatSession) -> Result<Option<Message>> {
    let mut status = session.subscribe_status();
    let terminal = status
        .wait_for(|s| !s.is_busy())
        .await
        .context("Session closed while waiting for a reply")?
        .clone();

    match terminal {
        SessionStatus::Error(error) => Err(anyhow::anyhow!("Reply failed: {}", error)),
        _ => Ok(session
            .transcript()
            .await
            .pop()
            .filter(|m| m.role == Role::Assistant)),
    }
}

/// Stores `key` and reports whether it looks like a key for `provider`.
pub async fn set_key(state: &AppState, provider: Provider, key: &str) -> Result<KeyStatus> {
    let status = validate_key(provider, key);
    if status == KeyStatus::Invalid {
        log::warn!("Key for {} does not have the expected format", provider);
    }
    state.keys.set_keys([(provider, key.to_string())]).await?;
    Ok(status)
}

pub async fn list_keys(state: &AppState) -> Vec<KeyListing> {
    let mut listing = Vec::new();
    for provider in Provider::ALL {
        listing.push(KeyListing {
            provider,
            configured: state.keys.get_key(provider).await.is_some(),
        });
    }
    listing
}

/// The catalogue followed by the user's custom OpenRouter models.
pub async fn list_models(state: &AppState) -> Vec<ModelListing> {
    let selected = state.models.selected_model().await;
    let mut configs: Vec<ModelConfig> = registry::MODELS.iter().map(ModelConfig::from).collect();
    configs.extend(
        state
            .keys
            .custom_models()
            .await
            .iter()
            .map(|name| registry::resolve(name)),
    );

    let mut listing = Vec::with_capacity(configs.len());
    for model in configs {
        listing.push(ModelListing {
            enabled: state.keys.is_model_enabled(&model).await,
            favorite: state.models.is_favorite(&model.name).await,
            selected: model.name == selected,
            model,
        });
    }
    listing
}

pub async fn select_model(state: &AppState, name: &str) -> Result<ModelConfig> {
    let model = registry::resolve(name);
    if model.custom {
        log::info!("Selecting custom OpenRouter model: {}", name);
    }
    state.models.set_model(name).await?;
    Ok(model)
}

pub async fn toggle_favorite(state: &AppState, name: &str) -> Result<bool> {
    state.models.toggle_favorite(name).await
}

pub async fn add_custom_model(state: &AppState, model_id: &str) -> Result<bool> {
    state.keys.add_custom_model(model_id).await
}

pub async fn remove_custom_model(state: &AppState, model_id: &str) -> Result<bool> {
    state.keys.remove_custom_model(model_id).await
}

/// Models offered to retry the thread's last reply.
pub async fn retry_candidates(state: &AppState, thread_id: Uuid) -> Result<Vec<ModelConfig>> {
    let session = state.session(thread_id).await?;
    let current = session
        .transcript()
        .await
        .iter()
        .rev()
        .find_map(|m| m.stats.as_ref().map(|s| s.model.clone()))
        .unwrap_or(state.models.selected_model().await);
    Ok(state.models.retry_candidates(&current, &state.keys).await)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::api::{ChatRequest, DeltaStream, LLMApiProvider, StreamDelta};
    use crate::error::SummaryError;
    use crate::events::EventEmitter;
    use crate::settings::{KeyStore, ModelStore, SettingsBackend, SettingsBus};
    use crate::storage::StorageManager;
    use crate::summary::{SummaryAuth, SummaryClient, SummaryRequest, SummaryResponse};
    use async_trait::async_trait;
    use futures::stream;
    use std::collections::HashMap;
    use std::sync::Arc;

    /// Always answers "pong".
    struct Pong;

    #[async_trait]
    impl LLMApiProvider for Pong {
        async fn send_chat_stream_request(&self, _request: ChatRequest) -> Result<DeltaStream> {
            Ok(Box::pin(stream::iter(vec![Ok(StreamDelta::Text("pong".into()))])))
        }
    }

    struct NoTitles;

    #[async_trait]
    impl SummaryClient for NoTitles {
        async fn summarize(
            &self,
            _auth: &SummaryAuth,
            _request: &SummaryRequest,
        ) -> std::result::Result<SummaryResponse, SummaryError> {
            Err(SummaryError::InvalidResponse("disabled".into()))
        }
    }

    async fn app() -> AppState {
        let storage = StorageManager::open_in_memory().await.unwrap();
        let backend: Arc<dyn SettingsBackend> = Arc::new(storage.clone());
        let bus = SettingsBus::new();
        let keys = KeyStore::open(backend.clone(), bus.clone(), HashMap::new())
            .await
            .unwrap();
        let models = ModelStore::open(backend, bus).await.unwrap();
        AppState::new(
            storage,
            Arc::new(keys),
            Arc::new(models),
            Arc::new(Pong),
            Arc::new(NoTitles),
            EventEmitter::new(),
            Some("Be brief.".into()),
        )
    }

    #[tokio::test]
    async fn send_and_wait_returns_reply() {
        let state = app().await;
        set_key(&state, Provider::Google, "AIza-test").await.unwrap();

        let (session, message_id) = send_message(&state, None, "ping").await.unwrap();
        assert!(message_id.is_some());
        let reply = wait_for_reply(&session).await.unwrap().unwrap();
        assert_eq!(reply.content, "pong");

        let threads = list_threads(&state).await.unwrap();
        assert_eq!(threads.len(), 1);
        let view = show_thread(&state, session.thread_id()).await.unwrap();
        assert_eq!(view.messages.len(), 2);
        assert_eq!(search(&state, "PING").await.unwrap().len(), 1);
    }

    #[tokio::test]
    async fn send_without_key_fails() {
        let state = app().await;
        let err = send_message(&state, None, "ping").await.unwrap_err();
        assert!(err.to_string().contains("google"));
        assert!(list_threads(&state).await.unwrap().is_empty());
    }

    #[tokio::test]
    async fn delete_forgets_session_and_rows() {
        let state = app().await;
        set_key(&state, Provider::Google, "AIza-test").await.unwrap();
        let (session, _) = send_message(&state, None, "ping").await.unwrap();
        wait_for_reply(&session).await.unwrap();

        delete_thread(&state, session.thread_id()).await.unwrap();
        assert!(list_threads(&state).await.unwrap().is_empty());
        assert!(state.existing_session(session.thread_id()).is_none());
        assert!(show_thread(&state, session.thread_id()).await.is_err());
    }

    #[tokio::test]
    async fn model_listing_marks_state() {
        let state = app().await;
        set_key(&state, Provider::OpenAI, "sk-test").await.unwrap();
        toggle_favorite(&state, "o3").await.unwrap();
        add_custom_model(&state, "meta-llama/llama-3-70b").await.unwrap();
        select_model(&state, "o3").await.unwrap();

        let listing = list_models(&state).await;
        assert_eq!(listing.len(), registry::MODELS.len() + 1);
        let o3 = listing.iter().find(|m| m.model.name == "o3").unwrap();
        assert!(o3.enabled && o3.favorite && o3.selected);
        let custom = listing.last().unwrap();
        assert!(custom.model.custom);
        assert!(!custom.enabled);
    }

    #[tokio::test]
    async fn key_listing_and_validation() {
        let state = app().await;
        assert_eq!(
            set_key(&state, Provider::Anthropic, "sk-proj-wrong").await.unwrap(),
            KeyStatus::Invalid
        );
        let keys = list_keys(&state).await;
        assert!(keys
            .iter()
            .any(|k| k.provider == Provider::Anthropic && k.configured));
        assert!(keys.iter().any(|k| k.provider == Provider::Google && !k.configured));
    }

    #[tokio::test]
    async fn rename_rejects_blank_titles() {
        let state = app().await;
        assert!(rename_thread(&state, Uuid::new_v4(), "  ").await.is_err());
        rename_thread(&state, Uuid::new_v4(), "ghost").await.unwrap();
    }
}
