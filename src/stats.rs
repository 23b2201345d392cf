//! Cost and throughput figures for a completed reply.
//!
//! Token counts are approximate: provider-reported usage is used when the stream
//! carried it, otherwise counts are estimated from text length.

use chrono::{DateTime, Utc};

use crate::models::MessageStats;
use crate::registry::ModelConfig;

const CHARS_PER_TOKEN: usize = 4;

/// Token counts for one request.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct TokenUsage {
    pub input_tokens: u64,
    pub output_tokens: u64,
}

/// USD cost of `input_tokens` + `output_tokens` at per-million-token prices.
pub fn calculate_cost(input_tokens: u64, output_tokens: u64, input_price: f64, output_price: f64) -> f64 {
    (input_tokens as f64 / 1e6) * input_price + (output_tokens as f64 / 1e6) * output_price
}

/// Zero when no time has elapsed.
pub fn tokens_per_second(tokens: u64, duration_ms: u64) -> f64 {
    if duration_ms == 0 {
        return 0.0;
    }
    tokens as f64 / (duration_ms as f64 / 1000.0)
}

/// Rough token count for text the provider did not meter for us.
pub fn estimate_tokens(text: &str) -> u64 {
    let chars = text.chars().count();
    if chars == 0 {
        return 0;
    }
    chars.div_ceil(CHARS_PER_TOKEN) as u64
}

/// Builds the stats for a reply that started at `start` and finished at `end`.
///
/// `prompt` and `reply` are only consulted when `usage` is `None`.
pub fn compute_stats(
    model: &ModelConfig,
    start: DateTime<Utc>,
    end: DateTime<Utc>,
    usage: Option<TokenUsage>,
    prompt: &str,
    reply: &str,
) -> MessageStats {
    let usage = usage.unwrap_or_else(|| TokenUsage {
        input_tokens: estimate_tokens(prompt),
        output_tokens: estimate_tokens(reply),
    });
    let duration = (end - start).num_milliseconds().max(0) as u64;

    MessageStats {
        start_time: start,
        model: model.name.clone(),
        cost: calculate_cost(
            usage.input_tokens,
            usage.output_tokens,
            model.input_price,
            model.output_price,
        ),
        tokens: usage.output_tokens,
        duration,
        tokens_per_second: tokens_per_second(usage.output_tokens, duration),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::registry::resolve;
    use chrono::Duration;

    #[test]
    fn cost_is_linear_in_both_token_counts() {
        let n = 2_500;
        let (p_in, p_out) = (0.15, 0.60);
        let expected = (n as f64 / 1e6) * p_in + (n as f64 / 1e6) * p_out;
        assert!((calculate_cost(n, n, p_in, p_out) - expected).abs() < 1e-12);
        assert_eq!(calculate_cost(0, 0, p_in, p_out), 0.0);
    }

    #[test]
    fn throughput_is_finite_for_zero_duration() {
        let tps = tokens_per_second(10, 0);
        assert!(tps.is_finite());
        assert_eq!(tps, 0.0);
        assert_eq!(tokens_per_second(10, 2000), 5.0);
    }

    #[test]
    fn estimates_round_up() {
        assert_eq!(estimate_tokens(""), 0);
        assert_eq!(estimate_tokens("abc"), 1);
        assert_eq!(estimate_tokens("abcdefghi"), 3);
    }

    #[test]
    fn reported_usage_wins_over_estimates() {
        let model = resolve("GPT-4o mini");
        let start = Utc::now();
        let stats = compute_stats(
            &model,
            start,
            start + Duration::milliseconds(2000),
            Some(TokenUsage {
                input_tokens: 1_000_000,
                output_tokens: 10,
            }),
            "ignored",
            "ignored",
        );
        assert_eq!(stats.tokens, 10);
        assert_eq!(stats.duration, 2000);
        assert_eq!(stats.tokens_per_second, 5.0);
        assert_eq!(stats.model, "GPT-4o mini");
        assert!((stats.cost - (0.15 + 10.0 / 1e6 * 0.60)).abs() < 1e-12);
    }

    #[test]
    fn clock_skew_never_yields_negative_duration() {
        let model = resolve("custom/model");
        let start = Utc::now();
        let stats = compute_stats(&model, start, start - Duration::seconds(1), None, "q", "reply");
        assert_eq!(stats.duration, 0);
        assert_eq!(stats.tokens_per_second, 0.0);
        assert_eq!(stats.cost, 0.0);
        assert_eq!(stats.tokens, 2);
    }
}
