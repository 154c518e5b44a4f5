//! Model pricing registry.
//!
//! Prices are USD per 1000 tokens and are provided data, not derived from
//! provider billing. Costs are never rounded here; use [`round_usd`] for display.

use crate::error::ArenaError;
use crate::models::{ModelId, Usage};
use serde::{Deserialize, Serialize};
use std::collections::HashMap;

/// Per-1000-token prices for a model
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct ModelPricing {
    pub input_per_1k: f64,
    pub output_per_1k: f64,
}

impl ModelPricing {
    pub const fn new(input_per_1k: f64, output_per_1k: f64) -> Self {
        Self {
            input_per_1k,
            output_per_1k,
        }
    }

    pub fn cost(&self, prompt_tokens: u32, completion_tokens: u32) -> f64 {
        (prompt_tokens as f64 / 1000.0) * self.input_per_1k
            + (completion_tokens as f64 / 1000.0) * self.output_per_1k
    }
}

// Published list prices at the time of writing; verify periodically.
const BUILTIN_PRICING: &[(&str, ModelPricing)] = &[
    ("openai/gpt-4o", ModelPricing::new(0.0025, 0.01)),
    ("openai/gpt-4o-mini", ModelPricing::new(0.00015, 0.0006)),
    ("openai/gpt-4.1", ModelPricing::new(0.002, 0.008)),
    ("anthropic/claude-3-5-sonnet", ModelPricing::new(0.003, 0.015)),
    ("anthropic/claude-3-5-haiku", ModelPricing::new(0.0008, 0.004)),
    ("google/gemini-1.5-pro", ModelPricing::new(0.00125, 0.005)),
    ("google/gemini-1.5-flash", ModelPricing::new(0.000075, 0.0003)),
    ("mistral/mistral-large", ModelPricing::new(0.002, 0.006)),
    ("xai/grok-2", ModelPricing::new(0.002, 0.01)),
];

/// Lookup table from model id to pricing
#[derive(Debug, Clone, Default)]
pub struct PricingTable {
    entries: HashMap<ModelId, ModelPricing>,
}

impl PricingTable {
    pub fn new() -> Self {
        Self::default()
    }

    /// Table preloaded with the built-in list prices
    pub fn builtin() -> Self {
        let mut table = Self::new();
        for (id, pricing) in BUILTIN_PRICING {
            table.insert(ModelId::from(*id), *pricing);
        }
        table
    }

    /// Add or replace an entry
    pub fn insert(&mut self, model: ModelId, pricing: ModelPricing) {
        self.entries.insert(model, pricing);
    }

    pub fn get(&self, model: &ModelId) -> Option<ModelPricing> {
        self.entries.get(model).copied()
    }

    pub fn contains(&self, model: &ModelId) -> bool {
        self.entries.contains_key(model)
    }

    /// Pricing for a model, or a `ConfigError` for an unknown id
    pub fn require(&self, model: &ModelId) -> Result<ModelPricing, ArenaError> {
        self.get(model)
            .ok_or_else(|| ArenaError::config(format!("no pricing entry for model '{}'", model)))
    }

    pub fn cost(
        &self,
        model: &ModelId,
        prompt_tokens: u32,
        completion_tokens: u32,
    ) -> Result<f64, ArenaError> {
        Ok(self.require(model)?.cost(prompt_tokens, completion_tokens))
    }

    pub fn cost_for_usage(&self, model: &ModelId, usage: Usage) -> Result<f64, ArenaError> {
        self.cost(model, usage.prompt_tokens, usage.completion_tokens)
    }
}

/// Round a USD amount to 6 decimal places
pub fn round_usd(value: f64) -> f64 {
    (value * 1_000_000.0).round() / 1_000_000.0
}

#[cfg(test)]
mod tests {
    use super::*;

    fn table() -> PricingTable {
        let mut table = PricingTable::new();
        table.insert("test/a".into(), ModelPricing::new(0.01, 0.02));
        table
    }

    #[test]
    fn test_cost_matches_formula() {
        let cost = table().cost(&"test/a".into(), 1, 1).unwrap();
        assert!((cost - 0.00003).abs() < 1e-12);
    }

    #[test]
    fn test_zero_tokens_cost_nothing() {
        assert_eq!(table().cost(&"test/a".into(), 0, 0).unwrap(), 0.0);
    }

    #[test]
    fn test_cost_is_linear_and_non_negative() {
        let table = table();
        let model = ModelId::from("test/a");
        for (p, c) in [(0, 5), (10, 0), (123, 456), (1000, 1000)] {
            let single = table.cost(&model, p, c).unwrap();
            let doubled = table.cost(&model, p * 2, c * 2).unwrap();
            let split = table.cost(&model, p, 0).unwrap() + table.cost(&model, 0, c).unwrap();
            assert!(single >= 0.0);
            assert!((doubled - 2.0 * single).abs() < 1e-12);
            assert!((split - single).abs() < 1e-12);
        }
    }

    #[test]
    fn test_unknown_model_is_config_error() {
        let err = table().cost(&"test/missing".into(), 1, 1).unwrap_err();
        assert!(matches!(err, ArenaError::Config(_)));
        assert!(err.to_string().contains("test/missing"));
    }

    #[test]
    fn test_builtin_table_has_entries() {
        let table = PricingTable::builtin();
        assert!(table.contains(&"openai/gpt-4o".into()));
        assert!(!table.contains(&"test/a".into()));
    }

    #[test]
    fn test_round_usd() {
        assert_eq!(round_usd(0.0000304), 0.00003);
        assert_eq!(round_usd(0.1234564), 0.123456);
        assert_eq!(round_usd(0.1234566), 0.123457);
    }
}
