//! Thread titles and per-message summaries from a secondary model call.
//!
//! The first user message of a thread is turned into the thread title; later
//! messages get a summary row for search surfaces. Requests run in the
//! background and never block the chat.

use async_trait::async_trait;
use reqwest::Client;
use serde::{Deserialize, Serialize};
use std::sync::Arc;
use tokio::task::JoinHandle;
use uuid::Uuid;

use crate::api::{ChatMessage, ChatRequest, OpenAICompatibleProvider};
use crate::error::SummaryError;
use crate::events::EventEmitter;
use crate::models::{Role, DEFAULT_THREAD_TITLE};
use crate::registry::{self, Provider};
use crate::settings::KeyStore;
use crate::storage::StorageManager;

pub const TITLE_INSTRUCTION: &str = "\
- you will generate a short title based on the first message a user begins a conversation with
- ensure it is not more than 80 characters long
- the title should be a summary of the user's message
- you should NOT answer the user's message, you should only generate a summary/title
- do not use quotes or colons";

pub const MAX_TITLE_CHARS: usize = 80;

/// Providers usable for summaries, most preferred first.
const PROVIDER_PRIORITY: [Provider; 3] = [Provider::OpenRouter, Provider::OpenAI, Provider::Google];

#[derive(Serialize, Deserialize, Clone, Debug, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct SummaryRequest {
    pub prompt: String,
    pub is_title: bool,
    pub message_id: Uuid,
    pub thread_id: Uuid,
}

#[derive(Serialize, Deserialize, Clone, Debug, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct SummaryResponse {
    pub title: String,
    pub is_title: bool,
    pub message_id: Uuid,
    pub thread_id: Uuid,
}

#[derive(Deserialize)]
struct ErrorBody {
    error: String,
}

/// The provider and key a summary request is made with.
#[derive(Debug, Clone, PartialEq)]
pub struct SummaryAuth {
    pub provider: Provider,
    pub api_key: String,
}

impl SummaryAuth {
    /// First configured provider in priority order, if any.
    pub async fn select(keys: &KeyStore) -> Option<Self> {
        for provider in PROVIDER_PRIORITY {
            if let Some(api_key) = keys.get_key(provider).await {
                return Some(Self { provider, api_key });
            }
        }
        None
    }
}

#[async_trait]
pub trait SummaryClient: Send + Sync {
    async fn summarize(
        &self,
        auth: &SummaryAuth,
        request: &SummaryRequest,
    ) -> Result<SummaryResponse, SummaryError>;
}

/// Talks to an external summary endpoint.
pub struct HttpSummaryClient {
    client: Client,
    endpoint: String,
}

impl HttpSummaryClient {
    pub fn new(endpoint: impl Into<String>) -> Self {
        Self {
            client: Client::new(),
            endpoint: endpoint.into(),
        }
    }
}

fn rejection(status: u16, body: &str) -> SummaryError {
    let message = serde_json::from_str::<ErrorBody>(body)
        .map(|b| b.error)
        .unwrap_or_else(|_| body.trim().to_string());
    SummaryError::Rejected { status, message }
}

#[async_trait]
impl SummaryClient for HttpSummaryClient {
    async fn summarize(
        &self,
        auth: &SummaryAuth,
        request: &SummaryRequest,
    ) -> Result<SummaryResponse, SummaryError> {
        log::info!(
            "Requesting summary for message {} via {}",
            request.message_id,
            auth.provider
        );
        let response = self
            .client
            .post(&self.endpoint)
            .header("X-Model-Provider", auth.provider.as_str())
            .header(auth.provider.header_key(), &auth.api_key)
            .json(request)
            .send()
            .await?;

        let status = response.status();
        let body = response.text().await?;
        if !status.is_success() {
            return Err(rejection(status.as_u16(), &body));
        }
        serde_json::from_str(&body).map_err(|e| SummaryError::InvalidResponse(e.to_string()))
    }
}

/// Produces titles by calling the provider's chat completion API directly.
pub struct DirectSummaryClient {
    provider: Arc<OpenAICompatibleProvider>,
}

impl DirectSummaryClient {
    pub fn new(provider: Arc<OpenAICompatibleProvider>) -> Self {
        Self { provider }
    }

    pub fn model_for(provider: Provider) -> Option<&'static str> {
        match provider {
            Provider::Google => Some("gemini-1.5-flash-latest"),
            Provider::OpenAI => Some("gpt-4o-mini"),
            Provider::OpenRouter => Some("deepseek/deepseek-v2-chat"),
            Provider::Anthropic | Provider::DeepSeek => None,
        }
    }
}

#[async_trait]
impl SummaryClient for DirectSummaryClient {
    async fn summarize(
        &self,
        auth: &SummaryAuth,
        request: &SummaryRequest,
    ) -> Result<SummaryResponse, SummaryError> {
        let model_id = Self::model_for(auth.provider).ok_or_else(|| SummaryError::Rejected {
            status: 400,
            message: "Invalid model provider.".to_string(),
        })?;
        let mut model = registry::resolve(model_id);
        model.provider = auth.provider;

        let chat = ChatRequest {
            model,
            api_key: auth.api_key.clone(),
            messages: vec![
                ChatMessage {
                    role: Role::System,
                    content: TITLE_INSTRUCTION.to_string(),
                },
                ChatMessage {
                    role: Role::User,
                    content: request.prompt.clone(),
                },
            ],
        };
        let title = self
            .provider
            .complete(&chat)
            .await
            .map_err(SummaryError::Completion)?;

        Ok(SummaryResponse {
            title,
            is_title: request.is_title,
            message_id: request.message_id,
            thread_id: request.thread_id,
        })
    }
}

/// Trims model output down to a bare single-line title.
pub fn clean_title(raw: &str) -> String {
    let line = raw.trim().lines().next().unwrap_or_default();
    let cleaned = line
        .trim()
        .trim_matches(|c: char| c == '"' || c == '\'')
        .trim();

    if cleaned.is_empty() {
        return DEFAULT_THREAD_TITLE.to_string();
    }
    if cleaned.chars().count() > MAX_TITLE_CHARS {
        return cleaned.chars().take(MAX_TITLE_CHARS).collect::<String>().trim_end().to_string();
    }
    cleaned.to_string()
}

#[derive(Debug, Clone, PartialEq)]
pub enum SummaryOutcome {
    /// No summary-capable key is configured.
    Skipped,
    Applied { title: String },
    Failed(String),
}

/// Issues summary requests and writes their results to the store.
#[derive(Clone)]
pub struct SummaryRequestor {
    client: Arc<dyn SummaryClient>,
    storage: StorageManager,
    keys: Arc<KeyStore>,
    events: EventEmitter,
}

impl SummaryRequestor {
    pub fn new(
        client: Arc<dyn SummaryClient>,
        storage: StorageManager,
        keys: Arc<KeyStore>,
        events: EventEmitter,
    ) -> Self {
        Self {
            client,
            storage,
            keys,
            events,
        }
    }

    pub async fn request(&self, request: SummaryRequest) -> SummaryOutcome {
        let Some(auth) = SummaryAuth::select(&self.keys).await else {
            log::debug!("No summary provider key configured; skipping summary");
            return SummaryOutcome::Skipped;
        };

        let response = match self.client.summarize(&auth, &request).await {
            Ok(response) => response,
            Err(e) => {
                log::error!("Summary for message {} failed: {}", request.message_id, e);
                self.events.notice("Failed to generate a summary for the message");
                return SummaryOutcome::Failed(e.to_string());
            }
        };

        let title = clean_title(&response.title);
        if let Err(e) = self.apply(&response, &title).await {
            log::error!(
                "Failed to store summary for message {}: {}",
                response.message_id,
                e
            );
            self.events.notice("Failed to save the summary for the message");
            return SummaryOutcome::Failed(e.to_string());
        }
        SummaryOutcome::Applied { title }
    }

    async fn apply(&self, response: &SummaryResponse, title: &str) -> crate::error::StorageResult<()> {
        if response.is_title {
            self.storage.update_thread(response.thread_id, title).await?;
        }
        self.storage
            .create_message_summary(response.thread_id, response.message_id, title)
            .await?;
        Ok(())
    }

    /// Fire-and-forget variant of [`SummaryRequestor::request`].
    pub fn spawn(&self, request: SummaryRequest) -> JoinHandle<SummaryOutcome> {
        let requestor = self.clone();
        tokio::spawn(async move { requestor.request(request).await })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::events::AppEvent;
    use crate::models::Message;
    use crate::settings::{SettingsBackend, SettingsBus};
    use std::collections::HashMap;
    use std::sync::Mutex;

    /// Echoes the prompt back as the title, or fails.
    struct FakeClient {
        fail: bool,
        seen: Mutex<Vec<Provider>>,
    }

    #[async_trait]
    impl SummaryClient for FakeClient {
        async fn summarize(
            &self,
            auth: &SummaryAuth,
            request: &SummaryRequest,
        ) -> Result<SummaryResponse, SummaryError> {
            self.seen.lock().unwrap().push(auth.provider);
            if self.fail {
                return Err(rejection(500, r#"{"error":"Failed to generate title"}"#));
            }
            Ok(SummaryResponse {
                title: format!("\"{}\"\nextra line", request.prompt),
                is_title: request.is_title,
                message_id: request.message_id,
                thread_id: request.thread_id,
            })
        }
    }

    struct Fixture {
        storage: StorageManager,
        keys: Arc<KeyStore>,
        events: EventEmitter,
        thread_id: Uuid,
        message_id: Uuid,
    }

    async fn fixture(keys: &[(Provider, &str)]) -> Fixture {
        let storage = StorageManager::open_in_memory().await.unwrap();
        let backend: Arc<dyn SettingsBackend> = Arc::new(storage.clone());
        let store = KeyStore::open(backend, SettingsBus::new(), HashMap::new())
            .await
            .unwrap();
        store
            .set_keys(keys.iter().map(|(p, k)| (*p, k.to_string())))
            .await
            .unwrap();

        let thread_id = Uuid::new_v4();
        storage.create_thread(thread_id).await.unwrap();
        let message = Message::user(Uuid::new_v4(), thread_id, "How do lifetimes work");
        storage.create_message(&message, None).await.unwrap();

        Fixture {
            storage,
            keys: Arc::new(store),
            events: EventEmitter::new(),
            thread_id,
            message_id: message.id,
        }
    }

    fn requestor(f: &Fixture, client: Arc<FakeClient>) -> SummaryRequestor {
        SummaryRequestor::new(client, f.storage.clone(), f.keys.clone(), f.events.clone())
    }

    fn fake(fail: bool) -> Arc<FakeClient> {
        Arc::new(FakeClient {
            fail,
            seen: Mutex::new(Vec::new()),
        })
    }

    #[test]
    fn titles_are_cleaned() {
        assert_eq!(clean_title("  \"Rust lifetimes\"  "), "Rust lifetimes");
        assert_eq!(clean_title("'Borrowing'\nSecond line"), "Borrowing");
        assert_eq!(clean_title("   "), DEFAULT_THREAD_TITLE);
        let long = "x".repeat(200);
        assert_eq!(clean_title(&long).chars().count(), MAX_TITLE_CHARS);
    }

    #[test]
    fn rejection_reads_error_body() {
        match rejection(400, r#"{"error":"Google API key is required."}"#) {
            SummaryError::Rejected { status, message } => {
                assert_eq!(status, 400);
                assert_eq!(message, "Google API key is required.");
            }
            other => panic!("unexpected {:?}", other),
        }
    }

    #[test]
    fn request_uses_camel_case() {
        let request = SummaryRequest {
            prompt: "p".into(),
            is_title: true,
            message_id: Uuid::nil(),
            thread_id: Uuid::nil(),
        };
        let value = serde_json::to_value(&request).unwrap();
        assert_eq!(value["isTitle"], true);
        assert!(value.get("messageId").is_some());
    }

    #[tokio::test]
    async fn title_updates_thread_and_adds_summary() {
        let f = fixture(&[(Provider::Google, "AIza-g"), (Provider::OpenAI, "sk-o")]).await;
        let client = fake(false);
        let outcome = requestor(&f, client.clone())
            .request(SummaryRequest {
                prompt: "Lifetimes".into(),
                is_title: true,
                message_id: f.message_id,
                thread_id: f.thread_id,
            })
            .await;

        assert_eq!(outcome, SummaryOutcome::Applied { title: "Lifetimes".into() });
        assert_eq!(*client.seen.lock().unwrap(), vec![Provider::OpenAI]);
        let thread = f.storage.get_thread(f.thread_id).await.unwrap().unwrap();
        assert_eq!(thread.title, "Lifetimes");
        let summaries = f.storage.get_message_summaries(f.thread_id).await.unwrap();
        assert_eq!(summaries.len(), 1);
        assert_eq!(summaries[0].message_id, f.message_id);
    }

    #[tokio::test]
    async fn summary_only_keeps_title() {
        let f = fixture(&[(Provider::OpenRouter, "sk-or-x")]).await;
        requestor(&f, fake(false))
            .request(SummaryRequest {
                prompt: "Follow-up".into(),
                is_title: false,
                message_id: f.message_id,
                thread_id: f.thread_id,
            })
            .await;

        let thread = f.storage.get_thread(f.thread_id).await.unwrap().unwrap();
        assert_eq!(thread.title, DEFAULT_THREAD_TITLE);
        assert_eq!(f.storage.get_message_summaries(f.thread_id).await.unwrap().len(), 1);
    }

    #[tokio::test]
    async fn no_summary_key_is_a_no_op() {
        // Anthropic keys cannot drive the summary request.
        let f = fixture(&[(Provider::Anthropic, "sk-ant-x")]).await;
        let client = fake(false);
        let outcome = requestor(&f, client.clone())
            .spawn(SummaryRequest {
                prompt: "Anything".into(),
                is_title: true,
                message_id: f.message_id,
                thread_id: f.thread_id,
            })
            .await
            .unwrap();

        assert_eq!(outcome, SummaryOutcome::Skipped);
        assert!(client.seen.lock().unwrap().is_empty());
        assert!(f.storage.get_message_summaries(f.thread_id).await.unwrap().is_empty());
    }

    #[tokio::test]
    async fn failure_notifies_and_keeps_fallback_title() {
        let f = fixture(&[(Provider::Google, "AIza-g")]).await;
        let mut events = f.events.subscribe();
        let outcome = requestor(&f, fake(true))
            .request(SummaryRequest {
                prompt: "Q".into(),
                is_title: true,
                message_id: f.message_id,
                thread_id: f.thread_id,
            })
            .await;

        assert!(matches!(outcome, SummaryOutcome::Failed(_)));
        assert!(matches!(events.recv().await.unwrap(), AppEvent::Notice { .. }));
        let thread = f.storage.get_thread(f.thread_id).await.unwrap().unwrap();
        assert_eq!(thread.title, DEFAULT_THREAD_TITLE);
    }

    #[tokio::test]
    async fn storage_failure_after_reply_notifies() {
        let f = fixture(&[(Provider::Google, "AIza-g")]).await;
        let mut events = f.events.subscribe();
        f.storage.pool().close().await;

        let outcome = requestor(&f, fake(false))
            .request(SummaryRequest {
                prompt: "Q".into(),
                is_title: true,
                message_id: f.message_id,
                thread_id: f.thread_id,
            })
            .await;

        assert!(matches!(outcome, SummaryOutcome::Failed(_)));
        match events.recv().await.unwrap() {
            AppEvent::Notice { message } => assert!(message.contains("save")),
            other => panic!("unexpected {:?}", other),
        }
    }

    #[test]
    fn direct_client_models() {
        assert_eq!(DirectSummaryClient::model_for(Provider::Google), Some("gemini-1.5-flash-latest"));
        assert_eq!(DirectSummaryClient::model_for(Provider::DeepSeek), None);
    }
}
