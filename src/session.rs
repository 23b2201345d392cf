//! The live side of one conversation.
//!
//! A [`ChatSession`] owns the in-memory transcript of a thread and at most one
//! in-flight reply. Status moves `Idle -> Submitted -> Streaming` and back to
//! `Idle` (or `Error`). Only completed replies reach the store; a stopped or
//! failed reply leaves nothing behind.

use chrono::{DateTime, Utc};
use futures::StreamExt;
use serde::Serialize;
use std::fmt;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{watch, Mutex};
use tokio::task::JoinHandle;
use uuid::Uuid;

use crate::api::{ChatMessage, ChatRequest, LLMApiProvider, StreamDelta};
use crate::error::{ChatError, StorageError};
use crate::events::{AppEvent, EventEmitter};
use crate::models::{now, Message, MessagePart, Role};
use crate::registry::{self, ModelConfig};
use crate::settings::{KeyStore, ModelStore, RetryLease};
use crate::stats::{compute_stats, TokenUsage};
use crate::storage::StorageManager;
use crate::summary::{SummaryOutcome, SummaryRequest, SummaryRequestor};

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(tag = "state", content = "error", rename_all = "lowercase")]
pub enum SessionStatus {
    Idle,
    Submitted,
    Streaming,
    Error(String),
}

impl SessionStatus {
    /// A reply is in flight.
    pub fn is_busy(&self) -> bool {
        matches!(self, SessionStatus::Submitted | SessionStatus::Streaming)
    }
}

/// Collaborators shared by every session of an application.
#[derive(Clone)]
pub struct SessionDeps {
    pub storage: StorageManager,
    pub provider: Arc<dyn LLMApiProvider>,
    pub keys: Arc<KeyStore>,
    pub models: Arc<ModelStore>,
    pub summaries: Option<SummaryRequestor>,
    pub events: EventEmitter,
    pub system_prompt: Option<String>,
}

/// The reply currently being streamed.
struct ActiveStream {
    id: Uuid,
    model: ModelConfig,
    started_at: DateTime<Utc>,
    /// Held by retries; gives the selection back once this reply ends.
    retry: Option<RetryLease>,
    prompt: String,
    text: String,
    reasoning: String,
    usage: Option<TokenUsage>,
    handle: Option<JoinHandle<()>>,
}

struct Inner {
    transcript: Vec<Message>,
    thread_exists: bool,
    active: Option<ActiveStream>,
    summaries: Vec<JoinHandle<SummaryOutcome>>,
}

impl Inner {
    /// Removes the active stream if it is `stream_id`; a stale id means the
    /// stream was stopped or replaced.
    fn take_active(&mut self, stream_id: Uuid) -> Option<ActiveStream> {
        if self.active.as_ref().map(|a| a.id) == Some(stream_id) {
            self.active.take()
        } else {
            None
        }
    }
}

struct Shared {
    thread_id: Uuid,
    deps: SessionDeps,
    inner: Mutex<Inner>,
    status: watch::Sender<SessionStatus>,
}

/// Controller for one thread's conversation. Clones share state.
#[derive(Clone)]
pub struct ChatSession {
    shared: Arc<Shared>,
}

impl fmt::Debug for ChatSession {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ChatSession")
            .field("thread_id", &self.thread_id())
            .field("status", &self.status())
            .finish()
    }
}

impl ChatSession {
    /// Loads the thread's stored messages (if any) into a new idle session.
    pub async fn open(thread_id: Uuid, deps: SessionDeps) -> Result<Self, StorageError> {
        let thread_exists = deps.storage.get_thread(thread_id).await?.is_some();
        let transcript = if thread_exists {
            deps.storage.get_messages_by_thread_id(thread_id).await?
        } else {
            Vec::new()
        };
        log::debug!(
            "Opened session for thread {} ({} messages)",
            thread_id,
            transcript.len()
        );

        let (status, _) = watch::channel(SessionStatus::Idle);
        Ok(Self {
            shared: Arc::new(Shared {
                thread_id,
                deps,
                inner: Mutex::new(Inner {
                    transcript,
                    thread_exists,
                    active: None,
                    summaries: Vec::new(),
                }),
                status,
            }),
        })
    }

    pub fn thread_id(&self) -> Uuid {
        self.shared.thread_id
    }

    pub fn status(&self) -> SessionStatus {
        self.shared.status.borrow().clone()
    }

    pub fn subscribe_status(&self) -> watch::Receiver<SessionStatus> {
        self.shared.status.subscribe()
    }

    /// Committed messages, oldest first.
    pub async fn transcript(&self) -> Vec<Message> {
        self.shared.inner.lock().await.transcript.clone()
    }

    /// Text received so far for the in-flight reply.
    pub async fn draft(&self) -> Option<String> {
        self.shared
            .inner
            .lock()
            .await
            .active
            .as_ref()
            .map(|a| a.text.clone())
    }

    /// The model answering the in-flight reply.
    pub async fn pending_model(&self) -> Option<ModelConfig> {
        self.shared
            .inner
            .lock()
            .await
            .active
            .as_ref()
            .map(|a| a.model.clone())
    }

    /// Sends a user message and starts the reply.
    ///
    /// Blank input, or a send while a reply is in flight, is ignored and returns
    /// `Ok(None)`. Otherwise returns the id of the stored user message.
    pub async fn send(&self, text: &str) -> Result<Option<Uuid>, ChatError> {
        let text = text.trim();
        if text.is_empty() {
            log::debug!("Ignoring blank message for thread {}", self.thread_id());
            return Ok(None);
        }

        let deps = &self.shared.deps;
        let mut inner = self.shared.inner.lock().await;
        if inner.active.is_some() {
            log::warn!(
                "Ignoring message for thread {}: a reply is already in flight",
                self.thread_id()
            );
            return Ok(None);
        }

        let model = deps.models.model_config().await;
        let api_key = deps
            .keys
            .get_key(model.provider)
            .await
            .ok_or(ChatError::MissingApiKey(model.provider))?;

        let thread_id = self.thread_id();
        let mut is_title = false;
        if !inner.thread_exists {
            match deps.storage.create_thread(thread_id).await {
                Ok(_) => is_title = true,
                // Created elsewhere since this session was opened.
                Err(StorageError::DuplicateThread(_)) => {}
                Err(e) => return Err(e.into()),
            }
            inner.thread_exists = true;
        }

        // The user's message is stored before any network traffic.
        let message = Message::user(Uuid::new_v4(), thread_id, text);
        deps.storage.create_message(&message, None).await?;
        inner.transcript.push(message.clone());
        log::info!("User message {} saved.", message.id);

        if let Some(summaries) = &deps.summaries {
            inner.summaries.retain(|handle| !handle.is_finished());
            inner.summaries.push(summaries.spawn(SummaryRequest {
                prompt: text.to_string(),
                is_title,
                message_id: message.id,
                thread_id,
            }));
        }

        self.start_stream(&mut inner, model, api_key, None);
        Ok(Some(message.id))
    }

    /// Waits up to `limit` for this session's title and summary requests.
    /// Returns false when some were still running at the deadline.
    pub async fn flush_summaries(&self, limit: Duration) -> bool {
        let pending = std::mem::take(&mut self.shared.inner.lock().await.summaries);
        if pending.is_empty() {
            return true;
        }
        let count = pending.len();
        match tokio::time::timeout(limit, futures::future::join_all(pending)).await {
            Ok(outcomes) => {
                log::debug!("Flushed {} summary requests: {:?}", count, outcomes);
                true
            }
            Err(_) => {
                log::warn!(
                    "{} summary requests for thread {} still running after {:?}",
                    count,
                    self.thread_id(),
                    limit
                );
                false
            }
        }
    }

    /// Replays the last user message with `model_name`, dropping every later
    /// message from the live transcript. The previously selected model is
    /// selected again once the new reply ends. Only one retry may hold the
    /// selection at a time across every session sharing the model store; any
    /// other is rejected with [`ChatError::Busy`]. Returns the new reply's id, or
    /// `None` when there is no user message to replay.
    pub async fn retry_with_model(&self, model_name: &str) -> Result<Option<Uuid>, ChatError> {
        let deps = &self.shared.deps;
        let mut inner = self.shared.inner.lock().await;
        if inner.active.is_some() {
            return Err(ChatError::Busy);
        }
        let Some(last_user) = inner.transcript.iter().rposition(|m| m.role == Role::User) else {
            log::warn!("Nothing to retry in thread {}", self.thread_id());
            return Ok(None);
        };

        let model = registry::resolve(model_name);
        let api_key = deps
            .keys
            .get_key(model.provider)
            .await
            .ok_or(ChatError::MissingApiKey(model.provider))?;

        let Some(lease) = deps.models.begin_retry(model_name).await? else {
            log::warn!(
                "Rejecting retry in thread {}: another retry holds the model selection",
                self.thread_id()
            );
            return Err(ChatError::Busy);
        };
        inner.transcript.truncate(last_user + 1);
        log::info!(
            "Retrying thread {} with {} (will restore {})",
            self.thread_id(),
            model_name,
            lease.previous()
        );

        Ok(Some(self.start_stream(&mut inner, model, api_key, Some(lease))))
    }

    /// Cancels the in-flight reply and discards its partial output. Returns false
    /// when nothing was in flight.
    pub async fn stop(&self) -> bool {
        let mut inner = self.shared.inner.lock().await;
        let Some(active) = inner.active.take() else {
            return false;
        };
        if let Some(handle) = &active.handle {
            handle.abort();
        }
        log::warn!(
            "Stopped reply {} in thread {} after {} chars",
            active.id,
            self.thread_id(),
            active.text.len()
        );
        self.restore_model(active.retry).await;
        self.set_status(SessionStatus::Idle);
        true
    }

    fn start_stream(
        &self,
        inner: &mut Inner,
        model: ModelConfig,
        api_key: String,
        retry: Option<RetryLease>,
    ) -> Uuid {
        let stream_id = Uuid::new_v4();
        let messages = self.provider_history(&inner.transcript);
        let prompt = messages
            .iter()
            .map(|m| m.content.as_str())
            .collect::<Vec<_>>()
            .join("\n");
        let request = ChatRequest {
            model: model.clone(),
            api_key,
            messages,
        };

        inner.active = Some(ActiveStream {
            id: stream_id,
            model,
            started_at: now(),
            retry,
            prompt,
            text: String::new(),
            reasoning: String::new(),
            usage: None,
            handle: None,
        });
        self.set_status(SessionStatus::Submitted);

        // The task cannot touch `inner` before we release the lock.
        let session = self.clone();
        let handle = tokio::spawn(async move { session.run_stream(stream_id, request).await });
        if let Some(active) = inner.active.as_mut() {
            active.handle = Some(handle);
        }
        stream_id
    }

    fn provider_history(&self, transcript: &[Message]) -> Vec<ChatMessage> {
        let system = self
            .shared
            .deps
            .system_prompt
            .as_ref()
            .filter(|p| !p.trim().is_empty())
            .map(|p| ChatMessage {
                role: Role::System,
                content: p.clone(),
            });
        system
            .into_iter()
            .chain(
                transcript
                    .iter()
                    .filter(|m| m.role != Role::Data)
                    .map(|m| ChatMessage {
                        role: m.role,
                        content: m.content.clone(),
                    }),
            )
            .collect()
    }

    async fn run_stream(&self, stream_id: Uuid, request: ChatRequest) {
        log::info!(
            "Starting stream {} for thread {} with {}",
            stream_id,
            self.thread_id(),
            request.model.name
        );
        let mut deltas = match self.shared.deps.provider.send_chat_stream_request(request).await {
            Ok(stream) => stream,
            Err(e) => {
                self.fail(stream_id, format!("{:#}", e)).await;
                return;
            }
        };

        while let Some(delta) = deltas.next().await {
            match delta {
                Ok(delta) => {
                    if !self.apply_delta(stream_id, delta).await {
                        log::debug!("Discarding output of stale stream {}", stream_id);
                        return;
                    }
                }
                Err(e) => {
                    self.fail(stream_id, format!("{:#}", e)).await;
                    return;
                }
            }
        }
        self.complete(stream_id).await;
    }

    /// Returns false once the stream is no longer the active one.
    async fn apply_delta(&self, stream_id: Uuid, delta: StreamDelta) -> bool {
        let mut inner = self.shared.inner.lock().await;
        let Some(active) = inner.active.as_mut().filter(|a| a.id == stream_id) else {
            return false;
        };

        match delta {
            StreamDelta::Text(text) => {
                let is_first_chunk = active.text.is_empty();
                active.text.push_str(&text);
                self.shared.deps.events.emit(AppEvent::Chunk {
                    thread_id: self.thread_id(),
                    message_id: stream_id,
                    delta: text,
                    is_first_chunk,
                });
            }
            StreamDelta::Reasoning(reasoning) => active.reasoning.push_str(&reasoning),
            StreamDelta::Usage {
                input_tokens,
                output_tokens,
            } => {
                active.usage = Some(TokenUsage {
                    input_tokens,
                    output_tokens,
                });
                return true;
            }
        }

        if self.status() == SessionStatus::Submitted {
            self.set_status(SessionStatus::Streaming);
        }
        true
    }

    async fn complete(&self, stream_id: Uuid) {
        let mut inner = self.shared.inner.lock().await;
        let Some(active) = inner.take_active(stream_id) else {
            return;
        };

        let mut parts = Vec::new();
        if !active.reasoning.is_empty() {
            parts.push(MessagePart::Reasoning {
                reasoning: active.reasoning,
            });
        }
        parts.push(MessagePart::Text { text: active.text });
        let mut message = Message::new(stream_id, self.thread_id(), Role::Assistant, parts);

        let stats = compute_stats(
            &active.model,
            active.started_at,
            now(),
            active.usage,
            &active.prompt,
            &message.content,
        );
        message.stats = Some(stats);

        let saved = self.shared.deps.storage.create_message(&message, None).await;
        self.restore_model(active.retry).await;

        match saved {
            Ok(()) => {
                log::info!(
                    "Saved assistant message {} ({} chars)",
                    message.id,
                    message.content.len()
                );
                inner.transcript.push(message);
                self.set_status(SessionStatus::Idle);
                self.shared.deps.events.emit(AppEvent::Finished {
                    thread_id: self.thread_id(),
                    message_id: stream_id,
                });
            }
            Err(e) => {
                log::error!("Failed to save assistant message {}: {:?}", stream_id, e);
                self.report_failure(e.to_string());
            }
        }
    }

    async fn fail(&self, stream_id: Uuid, error: String) {
        let mut inner = self.shared.inner.lock().await;
        let Some(active) = inner.take_active(stream_id) else {
            return;
        };
        log::error!("Stream {} for thread {} failed: {}", stream_id, self.thread_id(), error);
        self.restore_model(active.retry).await;
        self.report_failure(error);
    }

    fn report_failure(&self, error: String) {
        self.set_status(SessionStatus::Error(error.clone()));
        self.shared.deps.events.emit(AppEvent::Failed {
            thread_id: self.thread_id(),
            error,
        });
    }

    async fn restore_model(&self, lease: Option<RetryLease>) {
        let Some(lease) = lease else { return };
        let previous = lease.previous().to_string();
        if let Err(e) = self.shared.deps.models.end_retry(lease).await {
            log::error!("Failed to restore model {}: {:?}", previous, e);
        }
    }

    fn set_status(&self, status: SessionStatus) {
        log::debug!("Thread {} status: {:?}", self.thread_id(), status);
        self.shared.status.send_replace(status.clone());
        self.shared.deps.events.emit(AppEvent::StatusChanged {
            thread_id: self.thread_id(),
            status,
        });
    }
}
