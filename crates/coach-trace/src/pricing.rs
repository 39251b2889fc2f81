use serde::{Deserialize, Serialize};
use std::collections::HashMap;

/// USD per 1000 tokens.
#[derive(Clone, Copy, Debug, PartialEq, Serialize, Deserialize)]
pub struct ModelPrice {
    pub input_per_1k: f64,
    pub output_per_1k: f64,
}

impl ModelPrice {
    pub const fn new(input_per_1k: f64, output_per_1k: f64) -> Self {
        Self {
            input_per_1k,
            output_per_1k,
        }
    }

    pub fn cost(&self, prompt_tokens: u64, completion_tokens: u64) -> f64 {
        (prompt_tokens as f64 / 1000.0) * self.input_per_1k
            + (completion_tokens as f64 / 1000.0) * self.output_per_1k
    }
}

const DEFAULT_PRICES: &[(&str, ModelPrice)] = &[
    ("gpt-4o", ModelPrice::new(0.005, 0.015)),
    ("gpt-4o-mini", ModelPrice::new(0.000_15, 0.000_6)),
    ("gpt-4-turbo", ModelPrice::new(0.01, 0.03)),
    ("gpt-4", ModelPrice::new(0.03, 0.06)),
    ("gpt-3.5-turbo", ModelPrice::new(0.000_5, 0.001_5)),
];

/// Per-model price lookup. Models missing from the table cost nothing;
/// this under-reports spend for newly introduced models.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct PricingTable {
    prices: HashMap<String, ModelPrice>,
}

impl Default for PricingTable {
    fn default() -> Self {
        Self {
            prices: DEFAULT_PRICES
                .iter()
                .map(|(model, price)| (model.to_string(), *price))
                .collect(),
        }
    }
}

impl PricingTable {
    pub fn empty() -> Self {
        Self {
            prices: HashMap::new(),
        }
    }

    pub fn with_price(mut self, model: impl Into<String>, price: ModelPrice) -> Self {
        self.insert(model, price);
        self
    }

    pub fn insert(&mut self, model: impl Into<String>, price: ModelPrice) {
        self.prices.insert(model.into(), price);
    }

    pub fn price_for(&self, model: &str) -> Option<ModelPrice> {
        self.prices.get(model.trim()).copied()
    }

    pub fn cost(&self, model: &str, prompt_tokens: u64, completion_tokens: u64) -> f64 {
        self.price_for(model)
            .map(|price| price.cost(prompt_tokens, completion_tokens))
            .unwrap_or(0.0)
    }
}
