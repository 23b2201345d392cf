//! Static catalogue of the models the client can talk to.
//!
//! Pure data: provider routing, per-million-token pricing and context metadata.
//! Names that are not in the catalogue resolve to custom OpenRouter models.

use serde::{Deserialize, Serialize};
use std::fmt;
use std::str::FromStr;

/// An external LLM vendor reachable with a user-supplied API key.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Provider {
    Google,
    OpenRouter,
    OpenAI,
    Anthropic,
    DeepSeek,
}

impl Provider {
    pub const ALL: [Provider; 5] = [
        Provider::Google,
        Provider::OpenRouter,
        Provider::OpenAI,
        Provider::Anthropic,
        Provider::DeepSeek,
    ];

    pub fn as_str(&self) -> &'static str {
        match self {
            Provider::Google => "google",
            Provider::OpenRouter => "openrouter",
            Provider::OpenAI => "openai",
            Provider::Anthropic => "anthropic",
            Provider::DeepSeek => "deepseek",
        }
    }

    /// Request header carrying this provider's API key.
    pub fn header_key(&self) -> &'static str {
        match self {
            Provider::Google => "X-Google-API-Key",
            Provider::OpenRouter => "X-OpenRouter-API-Key",
            Provider::OpenAI => "X-OpenAI-API-Key",
            Provider::Anthropic => "X-Anthropic-API-Key",
            Provider::DeepSeek => "X-DeepSeek-API-Key",
        }
    }

    /// Base URL of the provider's OpenAI-compatible API.
    pub fn default_base_url(&self) -> &'static str {
        match self {
            Provider::Google => "https://generativelanguage.googleapis.com/v1beta/openai",
            Provider::OpenRouter => "https://openrouter.ai/api/v1",
            Provider::OpenAI => "https://api.openai.com/v1",
            Provider::Anthropic => "https://api.anthropic.com/v1",
            Provider::DeepSeek => "https://api.deepseek.com/v1",
        }
    }

    /// Environment variable consulted when no key is stored.
    pub fn env_var(&self) -> &'static str {
        match self {
            Provider::Google => "GOOGLE_API_KEY",
            Provider::OpenRouter => "OPENROUTER_API_KEY",
            Provider::OpenAI => "OPENAI_API_KEY",
            Provider::Anthropic => "ANTHROPIC_API_KEY",
            Provider::DeepSeek => "DEEPSEEK_API_KEY",
        }
    }
}

impl fmt::Display for Provider {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for Provider {
    type Err = anyhow::Error;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Provider::ALL
            .into_iter()
            .find(|p| p.as_str().eq_ignore_ascii_case(s.trim()))
            .ok_or_else(|| anyhow::anyhow!("Unknown provider: {}", s))
    }
}

/// One catalogue entry.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct ModelSpec {
    pub name: &'static str,
    pub model_id: &'static str,
    pub provider: Provider,
    pub category: &'static str,
    /// USD per million input tokens.
    pub input_price: f64,
    /// USD per million output tokens.
    pub output_price: f64,
    pub context_window: &'static str,
    pub description: &'static str,
}

/// A resolved model, either from the catalogue or a custom OpenRouter id.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ModelConfig {
    pub name: String,
    pub model_id: String,
    pub provider: Provider,
    pub category: String,
    pub input_price: f64,
    pub output_price: f64,
    pub context_window: String,
    pub description: String,
    pub custom: bool,
}

impl ModelConfig {
    pub fn header_key(&self) -> &'static str {
        self.provider.header_key()
    }
}

impl From<&ModelSpec> for ModelConfig {
    fn from(spec: &ModelSpec) -> Self {
        Self {
            name: spec.name.to_string(),
            model_id: spec.model_id.to_string(),
            provider: spec.provider,
            category: spec.category.to_string(),
            input_price: spec.input_price,
            output_price: spec.output_price,
            context_window: spec.context_window.to_string(),
            description: spec.description.to_string(),
            custom: false,
        }
    }
}

pub const DEFAULT_MODEL: &str = "Gemini 2.5 Flash";

const fn spec(
    name: &'static str,
    model_id: &'static str,
    provider: Provider,
    category: &'static str,
    input_price: f64,
    output_price: f64,
    context_window: &'static str,
    description: &'static str,
) -> ModelSpec {
    ModelSpec {
        name,
        model_id,
        provider,
        category,
        input_price,
        output_price,
        context_window,
        description,
    }
}

use Provider::{Anthropic, DeepSeek, Google, OpenAI, OpenRouter};

/// The catalogue, cheapest tiers first.
pub static MODELS: &[ModelSpec] = &[
    // Ultra budget
    spec("Gemini 1.5 Flash-8B", "gemini-1.5-flash-8b", Google, "Ultra Budget", 0.0375, 0.15, "128K", "Smallest model for simple tasks"),
    spec("Ministral 3B", "ministral-3b", OpenRouter, "Ultra Budget", 0.04, 0.04, "128K", "Very affordable European AI model"),
    spec("Gemini 2.0 Flash Lite", "gemini-2.0-flash-lite", Google, "Ultra Budget", 0.075, 0.30, "1M", "Most affordable Google model"),
    spec("DeepSeek-V3", "deepseek-chat", DeepSeek, "Ultra Budget", 0.27, 1.10, "64K", "Excellent for coding at ultra-low cost"),
    spec("Claude Haiku 3", "claude-3-haiku-20240307", Anthropic, "Ultra Budget", 0.25, 1.25, "200K", "Most affordable Claude model"),
    // Budget
    spec("GPT-4.1 nano", "gpt-4.1-nano", OpenAI, "Budget", 0.10, 0.40, "200K", "Fastest, most cost-effective for low-latency"),
    spec("GPT-4o mini", "gpt-4o-mini", OpenAI, "Budget", 0.15, 0.60, "128K", "Cheaper multimodal option"),
    spec("Gemini 1.5 Flash", "gemini-1.5-flash", Google, "Budget", 0.075, 0.30, "128K", "Previous generation Flash"),
    spec("Gemini 2.5 Flash", "gemini-2.5-flash", Google, "Budget", 0.15, 0.60, "1M", "Fast and affordable"),
    spec("Gemini 2.0 Flash", "gemini-2.0-flash", Google, "Budget", 0.15, 0.60, "1M", "Text, image, video, audio support"),
    spec("GPT-4.1 mini", "gpt-4.1-mini", OpenAI, "Budget", 0.40, 1.60, "200K", "Balanced speed and intelligence"),
    spec("Mistral Large", "mistral-large", OpenRouter, "Budget", 0.40, 2.00, "128K", "European AI model"),
    spec("DeepSeek-R1", "deepseek-reasoner", DeepSeek, "Budget", 0.55, 2.19, "64K", "Reasoning-focused model"),
    spec("Claude Haiku 3.5", "claude-3-5-haiku-20241022", Anthropic, "Budget", 0.80, 4.00, "200K", "Speed-optimized model"),
    spec("o1-mini", "o1-mini", OpenAI, "Budget Reasoning", 1.10, 4.40, "128K", "Cost-efficient reasoning for coding"),
    spec("o3-mini", "o3-mini", OpenAI, "Budget Reasoning", 1.10, 4.40, "200K", "Newer reasoning model for math and coding"),
    spec("o4-mini", "o4-mini", OpenAI, "Budget Reasoning", 1.10, 4.40, "200K", "Faster, cost-efficient reasoning"),
    // Standard
    spec("GPT-4.1", "gpt-4.1", OpenAI, "Premium", 2.00, 8.00, "200K", "Smartest model for complex tasks"),
    spec("GPT-4o", "gpt-4o", OpenAI, "Standard", 2.50, 10.00, "128K", "Text and image processing"),
    spec("Gemini 1.5 Pro", "gemini-1.5-pro", Google, "Standard", 2.50, 10.00, "1M", "Previous generation Pro model"),
    spec("Claude Sonnet 3.5", "claude-3-5-sonnet-20241022", Anthropic, "Standard", 3.00, 15.00, "200K", "Popular general-purpose model"),
    spec("Claude Sonnet 3.7", "claude-3.7-sonnet", OpenRouter, "Standard", 3.00, 15.00, "200K", "Enhanced for coding and writing"),
    spec("Claude Sonnet 4", "claude-4-sonnet", OpenRouter, "Standard", 3.00, 15.00, "200K", "Latest Sonnet model"),
    // Premium
    spec("Gemini 2.5 Pro", "gemini-2.5-pro", Google, "Premium", 1.25, 10.00, "1M", "Advanced reasoning and coding"),
    spec("xAI Grok-beta", "grok-beta", OpenRouter, "Premium", 5.00, 15.00, "131K", "xAI's Grok model"),
    spec("o3", "o3", OpenAI, "Premium Reasoning", 10.00, 40.00, "200K", "Most powerful reasoning model"),
    spec("Claude Opus 3", "claude-3-opus", OpenRouter, "Premium", 15.00, 75.00, "200K", "Previous generation Opus"),
    spec("Claude Opus 4", "claude-4-opus", OpenRouter, "Premium", 15.00, 75.00, "500K", "Most capable Claude model"),
    spec("o1", "o1", OpenAI, "Premium Reasoning", 15.00, 60.00, "200K", "High-level reasoning model"),
    // Ultra premium
    spec("GPT-4.5", "gpt-4.5", OpenAI, "Ultra Premium", 75.00, 150.00, "128K", "Latest GPT model, highest quality"),
    spec("o1-pro", "o1-pro", OpenAI, "Ultra Premium", 150.00, 600.00, "200K", "Most expensive API offering"),
];

/// Catalogue lookup by display name.
pub fn find(name: &str) -> Option<&'static ModelSpec> {
    MODELS.iter().find(|m| m.name == name)
}

/// Resolves any model name. Unknown names are treated as custom OpenRouter
/// model ids with unknown (zero) pricing.
pub fn resolve(name: &str) -> ModelConfig {
    match find(name) {
        Some(spec) => ModelConfig::from(spec),
        None => ModelConfig {
            name: name.to_string(),
            model_id: name.to_string(),
            provider: Provider::OpenRouter,
            category: "Custom".to_string(),
            input_price: 0.0,
            output_price: 0.0,
            context_window: "Unknown".to_string(),
            description: "Custom OpenRouter model".to_string(),
            custom: true,
        },
    }
}

pub fn is_custom(name: &str) -> bool {
    find(name).is_none()
}
