use chrono::{DateTime, SubsecRound, Utc};
use serde::{Deserialize, Serialize};
use std::fmt;
use std::str::FromStr;
use uuid::Uuid;

pub const DEFAULT_THREAD_TITLE: &str = "New Chat";

/// Current time truncated to the millisecond precision the store keeps.
pub fn now() -> DateTime<Utc> {
    Utc::now().trunc_subsecs(3)
}

// A single conversation
#[derive(Serialize, Deserialize, Clone, Debug, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct Thread {
    pub id: Uuid,
    pub title: String,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
    pub last_message_at: DateTime<Utc>,
}

#[derive(Serialize, Deserialize, Clone, Copy, Debug, PartialEq, Eq)]
#[serde(rename_all = "lowercase")]
pub enum Role {
    User,
    Assistant,
    System,
    Data,
}

impl Role {
    pub fn as_str(&self) -> &'static str {
        match self {
            Role::User => "user",
            Role::Assistant => "assistant",
            Role::System => "system",
            Role::Data => "data",
        }
    }
}

impl fmt::Display for Role {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for Role {
    type Err = anyhow::Error;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "user" => Ok(Role::User),
            "assistant" => Ok(Role::Assistant),
            "system" => Ok(Role::System),
            "data" => Ok(Role::Data),
            other => Err(anyhow::anyhow!("Unknown message role: {}", other)),
        }
    }
}

/// One content segment of a message.
#[derive(Serialize, Deserialize, Clone, Debug, PartialEq)]
#[serde(tag = "type", rename_all = "lowercase")]
pub enum MessagePart {
    Text { text: String },
    Reasoning { reasoning: String },
}

/// Performance and cost figures attached to a completed assistant message.
#[derive(Serialize, Deserialize, Clone, Debug, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct MessageStats {
    #[serde(with = "chrono::serde::ts_milliseconds")]
    pub start_time: DateTime<Utc>,
    pub model: String,
    /// USD.
    pub cost: f64,
    pub tokens: u64,
    /// Milliseconds.
    pub duration: u64,
    pub tokens_per_second: f64,
}

// A single message in a thread
#[derive(Serialize, Deserialize, Clone, Debug, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct Message {
    pub id: Uuid,
    pub thread_id: Uuid,
    pub parts: Vec<MessagePart>,
    /// Flattened text of `parts`, kept for search.
    pub content: String,
    pub role: Role,
    pub created_at: DateTime<Utc>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub stats: Option<MessageStats>,
}

impl Message {
    pub fn new(id: Uuid, thread_id: Uuid, role: Role, parts: Vec<MessagePart>) -> Self {
        let content = flatten_parts(&parts);
        Self {
            id,
            thread_id,
            parts,
            content,
            role,
            created_at: now(),
            stats: None,
        }
    }

    pub fn user(id: Uuid, thread_id: Uuid, text: impl Into<String>) -> Self {
        Self::new(id, thread_id, Role::User, vec![MessagePart::Text { text: text.into() }])
    }

    pub fn reasoning(&self) -> Option<String> {
        let reasoning: String = self
            .parts
            .iter()
            .filter_map(|part| match part {
                MessagePart::Reasoning { reasoning } => Some(reasoning.as_str()),
                MessagePart::Text { .. } => None,
            })
            .collect();
        (!reasoning.is_empty()).then_some(reasoning)
    }
}

/// Concatenates the text segments; reasoning is not part of the searchable content.
pub fn flatten_parts(parts: &[MessagePart]) -> String {
    parts
        .iter()
        .filter_map(|part| match part {
            MessagePart::Text { text } => Some(text.as_str()),
            MessagePart::Reasoning { .. } => None,
        })
        .collect()
}

/// A derived label for one message, used for titles and search surfaces.
#[derive(Serialize, Deserialize, Clone, Debug, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct MessageSummary {
    pub id: Uuid,
    pub thread_id: Uuid,
    pub message_id: Uuid,
    pub content: String,
    pub created_at: DateTime<Utc>,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn content_flattens_text_parts_only() {
        let message = Message::new(
            Uuid::new_v4(),
            Uuid::new_v4(),
            Role::Assistant,
            vec![
                MessagePart::Reasoning { reasoning: "thinking".into() },
                MessagePart::Text { text: "Hi ".into() },
                MessagePart::Text { text: "there".into() },
            ],
        );
        assert_eq!(message.content, "Hi there");
        assert_eq!(message.reasoning().as_deref(), Some("thinking"));
    }

    #[test]
    fn parts_serialize_with_type_tag() {
        let json = serde_json::to_string(&MessagePart::Text { text: "a".into() }).unwrap();
        assert_eq!(json, r#"{"type":"text","text":"a"}"#);
    }

    #[test]
    fn stats_use_camel_case_and_millisecond_start() {
        let stats = MessageStats {
            start_time: DateTime::from_timestamp_millis(1_700_000_000_123).unwrap(),
            model: "X".into(),
            cost: 0.5,
            tokens: 10,
            duration: 2000,
            tokens_per_second: 5.0,
        };
        let value = serde_json::to_value(&stats).unwrap();
        assert_eq!(value["startTime"], 1_700_000_000_123i64);
        assert_eq!(value["tokensPerSecond"], 5.0);
    }

    #[test]
    fn role_parses_its_own_name() {
        for role in [Role::User, Role::Assistant, Role::System, Role::Data] {
            assert_eq!(role.as_str().parse::<Role>().unwrap(), role);
        }
    }
}
