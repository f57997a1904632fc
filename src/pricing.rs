//! Fallback pricing table for models where the gateway does not return cost.

use std::collections::HashMap;
use std::path::Path;
use std::sync::OnceLock;

use serde::Deserialize;

#[derive(Debug, Default, Deserialize)]
struct PricingFile {
    #[serde(default)]
    models: HashMap<String, ModelPricing>,
}

#[derive(Debug, Clone, Copy, Default, Deserialize)]
struct ModelPricing {
    #[serde(default)]
    input_per_1m: f64,
    #[serde(default)]
    output_per_1m: f64,
}

/// Per-token pricing loaded from YAML.
#[derive(Debug, Default)]
pub struct PricingTable {
    models: HashMap<String, ModelPricing>,
}

impl PricingTable {
    /// Load from `configs/model_pricing.yaml`-shaped YAML. Missing or
    /// malformed files yield an empty table.
    pub fn load(path: &Path) -> Self {
        let Ok(raw) = std::fs::read_to_string(path) else {
            return Self::default();
        };
        let parsed: PricingFile = serde_yaml::from_str(&raw).unwrap_or_default();
        Self {
            models: parsed.models,
        }
    }

    /// Cost in USD for the given token counts, 0 for unknown models.
    pub fn calculate(&self, model: &str, tokens_in: u64, tokens_out: u64) -> f64 {
        let Some(pricing) = self.models.get(model) else {
            return 0.0;
        };
        (tokens_in as f64 / 1_000_000.0) * pricing.input_per_1m
            + (tokens_out as f64 / 1_000_000.0) * pricing.output_per_1m
    }
}

static DEFAULT_TABLE: OnceLock<PricingTable> = OnceLock::new();

/// Install the process-wide pricing table. First call wins.
pub fn init_pricing(table: PricingTable) {
    let _ = DEFAULT_TABLE.set(table);
}

/// Return the gateway-reported cost when positive, otherwise fall back to the
/// pricing table.
pub fn resolve_cost(gateway_cost: f64, model: &str, tokens_in: u64, tokens_out: u64) -> f64 {
    if gateway_cost > 0.0 {
        return gateway_cost;
    }
    DEFAULT_TABLE
        .get_or_init(PricingTable::default)
        .calculate(model, tokens_in, tokens_out)
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write;

    fn table() -> PricingTable {
        let mut file = tempfile::NamedTempFile::new().unwrap();
        writeln!(
            file,
            "models:\n  gpt-4o:\n    input_per_1m: 2.5\n    output_per_1m: 10.0"
        )
        .unwrap();
        PricingTable::load(file.path())
    }

    #[test]
    fn calculates_from_token_counts() {
        let table = table();
        let cost = table.calculate("gpt-4o", 1_000_000, 1_000_000);
        assert!((cost - 12.5).abs() < 1e-9);
    }

    #[test]
    fn unknown_model_is_free() {
        let table = table();
        assert_eq!(table.calculate("unknown", 1_000_000, 0), 0.0);
    }

    #[test]
    fn gateway_cost_takes_precedence() {
        assert_eq!(resolve_cost(0.005, "gpt-4o", 100, 100), 0.005);
    }

    #[test]
    fn missing_file_yields_empty_table() {
        let table = PricingTable::load(Path::new("/nonexistent/pricing.yaml"));
        assert_eq!(table.calculate("gpt-4o", 100, 100), 0.0);
    }
}
