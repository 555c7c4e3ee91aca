use serde::{Deserialize, Serialize};
use serde_json::Value;

use crate::{ConfidenceRuleset, ExperimentConfig, KernelError, LadderConfig, RetrievalConfig};

/// Every versioned ruleset the kernel consults, loadable as one JSON file.
/// Missing sections fall back to their `v1()` defaults.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct KernelConfig {
    #[serde(default = "ConfidenceRuleset::v1")]
    pub confidence: ConfidenceRuleset,
    #[serde(default = "LadderConfig::v1")]
    pub ladder: LadderConfig,
    #[serde(default = "ExperimentConfig::v1")]
    pub experiment: ExperimentConfig,
    #[serde(default = "RetrievalConfig::v1")]
    pub retrieval: RetrievalConfig,
}

impl Default for KernelConfig {
    fn default() -> Self {
        Self::v1()
    }
}

impl KernelConfig {
    #[must_use]
    pub fn v1() -> Self {
        Self {
            confidence: ConfidenceRuleset::v1(),
            ladder: LadderConfig::v1(),
            experiment: ExperimentConfig::v1(),
            retrieval: RetrievalConfig::v1(),
        }
    }

    /// Validates every section.
    ///
    /// # Errors
    /// Returns the first [`KernelError::Configuration`] raised by a section.
    pub fn validate(&self) -> Result<(), KernelError> {
        self.confidence.validate()?;
        self.ladder.validate()?;
        self.experiment.validate()?;
        self.retrieval.validate()
    }

    /// Decodes and validates a bundled config from JSON.
    ///
    /// # Errors
    /// Returns [`KernelError::Configuration`] when decoding or validation
    /// fails.
    pub fn from_json(value: &Value) -> Result<Self, KernelError> {
        let config: Self = serde_json::from_value(value.clone()).map_err(|err| {
            KernelError::Configuration(format!("invalid kernel config JSON payload: {err}"))
        })?;
        config.validate()?;
        Ok(config)
    }
}
