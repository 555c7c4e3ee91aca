use serde::{Deserialize, Serialize};
use serde_json::Value;

use crate::KernelError;

/// Reserved input key under which relevant retrieval results are attached.
pub const RETRIEVED_CONTEXT_KEY: &str = "_retrieved_context";

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct RetrievalConfig {
    pub config_version: u32,
    pub enabled: bool,
    pub max_results: u32,
    pub target_results: u32,
    pub min_relevance: f64,
    pub query_input_chars: usize,
}

impl RetrievalConfig {
    #[must_use]
    pub fn v1() -> Self {
        Self {
            config_version: 1,
            enabled: true,
            max_results: 8,
            target_results: 4,
            min_relevance: 0.5,
            query_input_chars: 256,
        }
    }

    /// Validates retrieval bounds.
    ///
    /// # Errors
    /// Returns [`KernelError::Configuration`] for zero limits or a relevance
    /// floor outside `[0, 1]`.
    pub fn validate(&self) -> Result<(), KernelError> {
        if self.config_version == 0 {
            return Err(KernelError::Configuration(
                "config_version MUST be >= 1".to_string(),
            ));
        }
        if self.max_results == 0 || self.target_results == 0 {
            return Err(KernelError::Configuration(
                "max_results and target_results MUST be >= 1".to_string(),
            ));
        }
        if !(0.0..=1.0).contains(&self.min_relevance) {
            return Err(KernelError::Configuration(
                "min_relevance MUST be in [0.0, 1.0]".to_string(),
            ));
        }
        if self.query_input_chars == 0 {
            return Err(KernelError::Configuration(
                "query_input_chars MUST be >= 1".to_string(),
            ));
        }
        Ok(())
    }

    /// Decodes and validates a retrieval config from JSON.
    ///
    /// # Errors
    /// Returns [`KernelError::Configuration`] when JSON decoding fails or
    /// decoded values violate constraints.
    pub fn from_json(value: &Value) -> Result<Self, KernelError> {
        let config: Self = serde_json::from_value(value.clone()).map_err(|err| {
            KernelError::Configuration(format!("invalid retrieval JSON payload: {err}"))
        })?;
        config.validate()?;
        Ok(config)
    }
}

/// Builds the context query from the skill name and a char-bounded
/// serialization of the input. Reserved keys are dropped so a retry does not
/// query on its own prior context.
#[must_use]
pub fn build_retrieval_query(skill: &str, input: &Value, max_input_chars: usize) -> String {
    let serialized = match input {
        Value::Object(map) => {
            let filtered: serde_json::Map<String, Value> = map
                .iter()
                .filter(|(key, _)| !key.starts_with('_'))
                .map(|(key, value)| (key.clone(), value.clone()))
                .collect();
            Value::Object(filtered).to_string()
        }
        Value::Null => String::new(),
        other => other.to_string(),
    };
    let truncated: String = serialized.chars().take(max_input_chars).collect();
    if truncated.is_empty() {
        skill.to_string()
    } else {
        format!("{skill} {truncated}")
    }
}

#[must_use]
pub fn score_relevance(result_count: u32, target_results: u32) -> f64 {
    if target_results == 0 {
        return 0.0;
    }
    (f64::from(result_count) / f64::from(target_results)).min(1.0)
}

#[cfg(test)]
mod tests {
    use serde_json::json;

    use super::*;

    #[test]
    fn relevance_saturates_at_target() {
        assert!((score_relevance(0, 4) - 0.0).abs() < f64::EPSILON);
        assert!((score_relevance(2, 4) - 0.5).abs() < f64::EPSILON);
        assert!((score_relevance(8, 4) - 1.0).abs() < f64::EPSILON);
    }

    #[test]
    fn query_truncates_input_by_chars() {
        let long = "é".repeat(400);
        let query = build_retrieval_query("summarize", &json!(long), 256);
        assert!(query.starts_with("summarize "));
        assert_eq!(query.chars().count(), "summarize ".len() + 256);
    }

    #[test]
    fn query_skips_reserved_keys() {
        let query = build_retrieval_query(
            "lint",
            &json!({"file": "a.rs", "_prior_failure": {"fidelity": 0.2}}),
            256,
        );
        assert_eq!(query, r#"lint {"file":"a.rs"}"#);
    }
}
