//! Per-model token pricing.

use rust_decimal::Decimal;
use rust_decimal_macros::dec;

/// USD per million tokens.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ModelPricing {
    pub input_per_million: Decimal,
    pub output_per_million: Decimal,
}

impl ModelPricing {
    const fn new(input_per_million: Decimal, output_per_million: Decimal) -> Self {
        Self {
            input_per_million,
            output_per_million,
        }
    }
}

/// Tier used when the model is not listed.
pub const DEFAULT_PRICING: ModelPricing = ModelPricing::new(dec!(2.50), dec!(10.00));

/// Matched by longest prefix, so dated snapshots (`gpt-4o-2024-08-06`)
/// resolve to their family.
const PRICE_TABLE: &[(&str, ModelPricing)] = &[
    ("gpt-3.5-turbo", ModelPricing::new(dec!(0.50), dec!(1.50))),
    ("gpt-4", ModelPricing::new(dec!(30.00), dec!(60.00))),
    ("gpt-4-turbo", ModelPricing::new(dec!(10.00), dec!(30.00))),
    ("gpt-4o", ModelPricing::new(dec!(2.50), dec!(10.00))),
    ("gpt-4o-mini", ModelPricing::new(dec!(0.15), dec!(0.60))),
    ("gpt-4.1", ModelPricing::new(dec!(2.00), dec!(8.00))),
    ("gpt-4.1-mini", ModelPricing::new(dec!(0.40), dec!(1.60))),
    ("gpt-4.1-nano", ModelPricing::new(dec!(0.10), dec!(0.40))),
    ("gpt-5", ModelPricing::new(dec!(1.25), dec!(10.00))),
    ("gpt-5-mini", ModelPricing::new(dec!(0.25), dec!(2.00))),
    ("gpt-5-nano", ModelPricing::new(dec!(0.05), dec!(0.40))),
    ("o1", ModelPricing::new(dec!(15.00), dec!(60.00))),
    ("o3", ModelPricing::new(dec!(2.00), dec!(8.00))),
    ("o3-mini", ModelPricing::new(dec!(1.10), dec!(4.40))),
    ("o4-mini", ModelPricing::new(dec!(1.10), dec!(4.40))),
];

/// Look up pricing for a model, falling back to [`DEFAULT_PRICING`].
pub fn pricing_for(model: &str) -> ModelPricing {
    let model = model.trim().to_ascii_lowercase();
    PRICE_TABLE
        .iter()
        .filter(|(prefix, _)| model.starts_with(prefix))
        .max_by_key(|(prefix, _)| prefix.len())
        .map(|(_, pricing)| *pricing)
        .unwrap_or(DEFAULT_PRICING)
}

/// Estimated cost in USD of a call with the given token counts.
pub fn calculate_cost(model: &str, prompt_tokens: u32, completion_tokens: u32) -> Decimal {
    let pricing = pricing_for(model);
    (Decimal::from(prompt_tokens) * pricing.input_per_million
        + Decimal::from(completion_tokens) * pricing.output_per_million)
        / dec!(1_000_000)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn zero_tokens_cost_nothing() {
        assert_eq!(calculate_cost("gpt-4o", 0, 0), Decimal::ZERO);
        assert_eq!(calculate_cost("unknown-model", 0, 0), Decimal::ZERO);
    }

    #[test]
    fn known_model_cost() {
        // 1000 * 0.15/1M + 500 * 0.60/1M
        assert_eq!(calculate_cost("gpt-4o-mini", 1000, 500), dec!(0.00045));
    }

    #[test]
    fn longest_prefix_wins() {
        assert_eq!(pricing_for("gpt-4o-mini-2024-07-18").input_per_million, dec!(0.15));
        assert_eq!(pricing_for("gpt-4o-2024-08-06").input_per_million, dec!(2.50));
        assert_eq!(pricing_for("gpt-4-0613").input_per_million, dec!(30.00));
        assert_eq!(pricing_for("GPT-5-mini").output_per_million, dec!(2.00));
    }

    #[test]
    fn unknown_model_uses_default_tier() {
        assert_eq!(pricing_for("claude-sonnet"), DEFAULT_PRICING);
    }

    #[test]
    fn monotonic_in_both_arguments() {
        let samples = [0u32, 1, 10, 999, 10_000, 1_000_000];
        for model in ["gpt-4o", "o3-mini", "something-else"] {
            for &p in &samples {
                for pair in samples.windows(2) {
                    assert!(calculate_cost(model, p, pair[0]) <= calculate_cost(model, p, pair[1]));
                    assert!(calculate_cost(model, pair[0], p) <= calculate_cost(model, pair[1], p));
                }
            }
        }
    }
}
