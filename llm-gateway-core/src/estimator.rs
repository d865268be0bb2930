//! # Token and Cost Estimation
//!
//! Pure heuristics used in two places: the pre-dispatch cost-ceiling check,
//! and completion-token estimation when an upstream response omits usage.
//!
//! Token counts are derived from per-provider character/word densities plus
//! fixed per-message overheads; costs come from a per-`(provider, model)`
//! price table. Both are estimates and are never fed back into billing.

use crate::error::{ClassifiedError, ErrorCategory};
use crate::models::{ChatRequest, Role};
use crate::providers::ProviderType;
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::sync::OnceLock;

/// Per-provider token density heuristics.
#[derive(Debug, Clone, Copy)]
pub struct TokenHeuristics {
    /// Average characters per token
    pub chars_per_token: f64,
    /// Average words per token
    pub words_per_token: f64,
    /// Flat overhead applied once when a system message is present
    pub system_overhead: u32,
    /// Flat overhead applied per message
    pub message_overhead: u32,
    /// Provider-wide correction factor
    pub model_multiplier: f64,
    /// Assumed completion budget when the caller omits `max_tokens`
    pub default_output_tokens: u32,
}

const OPENAI_HEURISTICS: TokenHeuristics = TokenHeuristics {
    chars_per_token: 4.0,
    words_per_token: 0.75,
    system_overhead: 3,
    message_overhead: 4,
    model_multiplier: 1.00,
    default_output_tokens: 256,
};

const ANTHROPIC_HEURISTICS: TokenHeuristics = TokenHeuristics {
    chars_per_token: 4.2,
    words_per_token: 0.80,
    system_overhead: 5,
    message_overhead: 6,
    model_multiplier: 1.10,
    default_output_tokens: 256,
};

const BAIDU_HEURISTICS: TokenHeuristics = TokenHeuristics {
    chars_per_token: 2.5,
    words_per_token: 0.60,
    system_overhead: 2,
    message_overhead: 3,
    model_multiplier: 1.20,
    default_output_tokens: 128,
};

const DEFAULT_HEURISTICS: TokenHeuristics = TokenHeuristics {
    chars_per_token: 4.0,
    words_per_token: 0.75,
    system_overhead: 3,
    message_overhead: 4,
    model_multiplier: 1.00,
    default_output_tokens: 256,
};

/// Markers that flag content as code, which tokenizes denser than prose.
const CODE_MARKERS: &[&str] = &["```", "fn ", "def ", "class ", "import ", "#include", "function ", "=>"];

const CODE_MULTIPLIER: f64 = 1.3;
const SYMBOL_MULTIPLIER: f64 = 1.1;
const SYMBOL_RATIO_THRESHOLD: f64 = 0.20;

/// Heuristics table lookup by provider type.
pub fn heuristics_for(provider_type: ProviderType) -> &'static TokenHeuristics {
    match provider_type {
        ProviderType::Openai => &OPENAI_HEURISTICS,
        ProviderType::Anthropic => &ANTHROPIC_HEURISTICS,
        ProviderType::Baidu => &BAIDU_HEURISTICS,
        ProviderType::Zhipu | ProviderType::Mock => &DEFAULT_HEURISTICS,
    }
}

/// Estimated prompt and completion token counts for a request.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct TokenEstimate {
    pub input_tokens: u32,
    pub output_tokens: u32,
}

/// Estimate prompt and completion tokens for a request against a provider's
/// density table. Both counts are at least 1.
pub fn estimate_tokens(request: &ChatRequest, provider_type: ProviderType) -> TokenEstimate {
    let table = heuristics_for(provider_type);

    let mut input = 0.0f64;
    let mut has_system = false;
    let mut all_content = String::new();
    for message in &request.messages {
        if message.role == Role::System {
            has_system = true;
        }
        input += raw_token_estimate(&message.content, table) + f64::from(table.message_overhead);
        all_content.push_str(&message.content);
    }
    if has_system {
        input += f64::from(table.system_overhead);
    }
    input *= table.model_multiplier;
    if looks_like_code(&all_content) {
        input *= CODE_MULTIPLIER;
    }
    if symbol_ratio(&all_content) > SYMBOL_RATIO_THRESHOLD {
        input *= SYMBOL_MULTIPLIER;
    }

    let output = request.max_tokens.unwrap_or(table.default_output_tokens);

    TokenEstimate {
        input_tokens: (input.ceil() as u32).max(1),
        output_tokens: output.max(1),
    }
}

/// Estimate completion tokens from emitted content, used when an upstream
/// omits usage in its response.
pub fn estimate_completion_tokens(content: &str, provider_type: ProviderType) -> u32 {
    let table = heuristics_for(provider_type);
    let tokens = raw_token_estimate(content, table) * table.model_multiplier;
    (tokens.ceil() as u32).max(1)
}

fn raw_token_estimate(content: &str, table: &TokenHeuristics) -> f64 {
    let chars = content.chars().count() as f64;
    let words = content.split_whitespace().count() as f64;
    (chars / table.chars_per_token).max(words / table.words_per_token)
}

fn looks_like_code(content: &str) -> bool {
    CODE_MARKERS.iter().any(|marker| content.contains(marker))
}

/// Share of non-alphanumeric, non-whitespace characters. Whitespace is
/// excluded so ordinary prose does not trip the threshold.
fn symbol_ratio(content: &str) -> f64 {
    let total = content.chars().count();
    if total == 0 {
        return 0.0;
    }
    let symbols = content
        .chars()
        .filter(|c| !c.is_alphanumeric() && !c.is_whitespace())
        .count();
    symbols as f64 / total as f64
}

/// Per-1k-token prices for a `(provider, model)` pair.
#[derive(Debug, Clone)]
pub struct ModelPricing {
    pub input_price_per_1k: f64,
    pub output_price_per_1k: f64,
    pub currency: &'static str,
}

/// Pre-flight cost estimate for a request.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CostEstimate {
    pub input_tokens: u32,
    pub output_tokens: u32,
    pub input_cost: f64,
    pub output_cost: f64,
    /// Input plus output cost, rounded to 4 decimal places
    pub total: f64,
    pub currency: String,
}

struct PricingTable {
    by_model: HashMap<(ProviderType, &'static str), ModelPricing>,
    defaults: HashMap<ProviderType, ModelPricing>,
}

fn pricing_table() -> &'static PricingTable {
    static TABLE: OnceLock<PricingTable> = OnceLock::new();
    TABLE.get_or_init(|| {
        let usd = |input, output| ModelPricing {
            input_price_per_1k: input,
            output_price_per_1k: output,
            currency: "USD",
        };
        let cny = |input, output| ModelPricing {
            input_price_per_1k: input,
            output_price_per_1k: output,
            currency: "CNY",
        };

        let mut by_model = HashMap::new();
        by_model.insert((ProviderType::Openai, "gpt-4"), usd(0.03, 0.06));
        by_model.insert((ProviderType::Openai, "gpt-4o"), usd(0.005, 0.015));
        by_model.insert((ProviderType::Openai, "gpt-3.5-turbo"), usd(0.0005, 0.0015));
        by_model.insert((ProviderType::Anthropic, "claude-3-opus"), usd(0.015, 0.075));
        by_model.insert((ProviderType::Anthropic, "claude-3-sonnet"), usd(0.003, 0.015));
        by_model.insert((ProviderType::Anthropic, "claude-3-haiku"), usd(0.00025, 0.00125));
        by_model.insert((ProviderType::Baidu, "ernie-bot-4"), cny(0.12, 0.12));
        by_model.insert((ProviderType::Baidu, "ernie-bot"), cny(0.012, 0.012));
        by_model.insert((ProviderType::Baidu, "ernie-bot-turbo"), cny(0.008, 0.008));
        by_model.insert((ProviderType::Zhipu, "glm-4"), cny(0.1, 0.1));
        by_model.insert((ProviderType::Zhipu, "glm-3-turbo"), cny(0.005, 0.005));

        let mut defaults = HashMap::new();
        defaults.insert(ProviderType::Openai, usd(0.002, 0.002));
        defaults.insert(ProviderType::Anthropic, usd(0.003, 0.015));
        defaults.insert(ProviderType::Baidu, cny(0.012, 0.012));
        defaults.insert(ProviderType::Zhipu, cny(0.005, 0.005));
        defaults.insert(ProviderType::Mock, usd(0.001, 0.002));

        PricingTable { by_model, defaults }
    })
}

fn pricing_for(provider_type: ProviderType, model: &str) -> &'static ModelPricing {
    let table = pricing_table();
    table
        .by_model
        .iter()
        .find(|((pt, m), _)| *pt == provider_type && *m == model)
        .map(|(_, v)| v)
        .or_else(|| table.defaults.get(&provider_type))
        .expect("every provider type has default pricing")
}

/// Estimate the cost of a request for a provider. Combines the token
/// estimate with the price table and rounds the total to 4 decimal places.
pub fn estimate_cost(request: &ChatRequest, provider_type: ProviderType) -> CostEstimate {
    let tokens = estimate_tokens(request, provider_type);
    let pricing = pricing_for(provider_type, &request.model);

    let input_cost = f64::from(tokens.input_tokens) / 1000.0 * pricing.input_price_per_1k;
    let output_cost = f64::from(tokens.output_tokens) / 1000.0 * pricing.output_price_per_1k;

    CostEstimate {
        input_tokens: tokens.input_tokens,
        output_tokens: tokens.output_tokens,
        input_cost: round4(input_cost),
        output_cost: round4(output_cost),
        total: round4(input_cost + output_cost),
        currency: pricing.currency.to_string(),
    }
}

/// Refuse a request whose estimated cost exceeds the per-request limit.
/// A limit of zero disables the check. The refusal is a non-retryable
/// `client` error; no upstream call is made and no breaker is touched.
pub fn enforce_cost_ceiling(
    estimate: &CostEstimate,
    per_request_limit: f64,
    provider: &str,
) -> Result<(), ClassifiedError> {
    if per_request_limit > 0.0 && estimate.total > per_request_limit {
        return Err(ClassifiedError::new(
            ErrorCategory::Client,
            provider,
            "cost_ceiling",
            format!(
                "estimated cost {:.4} {} exceeds per-request limit {:.4}",
                estimate.total, estimate.currency, per_request_limit
            ),
        ));
    }
    Ok(())
}

fn round4(value: f64) -> f64 {
    (value * 10_000.0).round() / 10_000.0
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::models::Message;

    fn request(messages: Vec<Message>, max_tokens: Option<u32>) -> ChatRequest {
        ChatRequest {
            model: "gpt-4".to_string(),
            messages,
            max_tokens,
            ..Default::default()
        }
    }

    #[test]
    fn single_user_message_openai() {
        // "Hello world": 11 chars / 4.0 = 2.75, 2 words / 0.75 = 2.67;
        // max 2.75 + 4 message overhead = 6.75, ceil to 7.
        let req = request(vec![Message::user("Hello world")], Some(128));
        let estimate = estimate_tokens(&req, ProviderType::Openai);
        assert_eq!(estimate.input_tokens, 7);
        assert_eq!(estimate.output_tokens, 128);
    }

    #[test]
    fn system_overhead_applied_once() {
        let without = estimate_tokens(
            &request(vec![Message::user("Hello world")], None),
            ProviderType::Openai,
        );
        let with = estimate_tokens(
            &request(
                vec![Message::system("Hello world"), Message::user("Hello world")],
                None,
            ),
            ProviderType::Openai,
        );
        // Second message adds 6.75 tokens plus the one-time system overhead of 3.
        assert_eq!(with.input_tokens, without.input_tokens + 7 + 3);
    }

    #[test]
    fn code_content_is_denser() {
        let prose = request(vec![Message::user("explain this to me plainly")], None);
        let code = request(
            vec![Message::user("explain this\n```rust\nfn main() {}\n```")],
            None,
        );
        let prose_estimate = estimate_tokens(&prose, ProviderType::Openai);
        let code_estimate = estimate_tokens(&code, ProviderType::Openai);
        assert!(code_estimate.input_tokens > prose_estimate.input_tokens);
    }

    #[test]
    fn default_output_tokens_per_provider() {
        let req = request(vec![Message::user("hi")], None);
        assert_eq!(estimate_tokens(&req, ProviderType::Openai).output_tokens, 256);
        assert_eq!(estimate_tokens(&req, ProviderType::Baidu).output_tokens, 128);
    }

    #[test]
    fn minimum_one_token() {
        let req = request(vec![], Some(0));
        let estimate = estimate_tokens(&req, ProviderType::Openai);
        assert_eq!(estimate.input_tokens, 1);
        assert_eq!(estimate.output_tokens, 1);
    }

    #[test]
    fn cost_uses_model_pricing_and_rounds() {
        // gpt-4: 0.03 in / 0.06 out per 1k.
        let req = request(vec![Message::user("Hello world")], Some(1000));
        let cost = estimate_cost(&req, ProviderType::Openai);
        assert_eq!(cost.input_tokens, 7);
        assert_eq!(cost.output_tokens, 1000);
        assert_eq!(cost.output_cost, 0.06);
        assert_eq!(cost.total, round4(cost.input_cost + cost.output_cost));
        assert_eq!(cost.currency, "USD");
    }

    #[test]
    fn unknown_model_falls_back_to_provider_default() {
        let mut req = request(vec![Message::user("hi")], Some(100));
        req.model = "some-future-model".to_string();
        let cost = estimate_cost(&req, ProviderType::Anthropic);
        assert_eq!(cost.currency, "USD");
        assert!(cost.total > 0.0);
    }

    #[test]
    fn ceiling_refuses_with_client_error() {
        let req = request(vec![Message::user("Hello world")], Some(100_000));
        let estimate = estimate_cost(&req, ProviderType::Openai);
        assert!(estimate.total > 0.01);

        let err = enforce_cost_ceiling(&estimate, 0.01, "openai").unwrap_err();
        assert_eq!(err.category, ErrorCategory::Client);
        assert!(!err.retryable);

        // Zero disables the check.
        assert!(enforce_cost_ceiling(&estimate, 0.0, "openai").is_ok());
    }

    #[test]
    fn completion_estimate_has_floor_of_one() {
        assert_eq!(estimate_completion_tokens("", ProviderType::Openai), 1);
        assert!(estimate_completion_tokens("a longer piece of content", ProviderType::Openai) > 1);
    }
}
