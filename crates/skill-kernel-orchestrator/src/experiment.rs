use std::sync::Arc;

use anyhow::{anyhow, Result};
use rand::Rng;
use serde::{Deserialize, Serialize};
use serde_json::{json, Value};
use skill_kernel_core::{
    AbAssignment, Arm, AssignmentId, ExperimentConfig, Variation, VariationId,
};
use skill_kernel_store_sqlite::TrialReport;
use time::OffsetDateTime;

use crate::{with_store, SharedStore};

/// Reserved input key carrying the variant a skill should run.
pub const VARIANT_KEY: &str = "_variant";

pub trait ArmSelector: Send + Sync {
    fn select(&self, assignment: &AbAssignment) -> Arm;
}

/// Fair coin.
#[derive(Debug, Clone, Copy, Default)]
pub struct RandomArmSelector;

impl ArmSelector for RandomArmSelector {
    fn select(&self, _assignment: &AbAssignment) -> Arm {
        if rand::thread_rng().gen_bool(0.5) {
            Arm::Treatment
        } else {
            Arm::Control
        }
    }
}

#[derive(Debug, Clone, Copy)]
pub struct FixedArmSelector(pub Arm);

impl ArmSelector for FixedArmSelector {
    fn select(&self, _assignment: &AbAssignment) -> Arm {
        self.0
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct ArmRoute {
    pub assignment_id: AssignmentId,
    pub arm: Arm,
    pub variation: Variation,
}

/// Which variant an invocation runs.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(tag = "choice", rename_all = "snake_case")]
pub enum VariantChoice {
    Unversioned,
    Production { variation: Variation },
    Trial { route: ArmRoute },
}

impl VariantChoice {
    #[must_use]
    pub fn variation(&self) -> Option<&Variation> {
        match self {
            Self::Unversioned => None,
            Self::Production { variation } => Some(variation),
            Self::Trial { route } => Some(&route.variation),
        }
    }

    #[must_use]
    pub fn arm(&self) -> Option<Arm> {
        match self {
            Self::Trial { route } => Some(route.arm),
            Self::Unversioned | Self::Production { .. } => None,
        }
    }

    /// Adds the variant under [`VARIANT_KEY`] when `input` is an object.
    pub fn attach(&self, input: &mut Value) {
        let (Some(variation), Value::Object(map)) = (self.variation(), input) else {
            return;
        };
        map.insert(
            VARIANT_KEY.to_string(),
            json!({
                "variation_id": variation.variation_id,
                "arm": self.arm().map(Arm::as_str),
                "content": variation.content,
            }),
        );
    }
}

#[derive(Clone)]
pub struct AbEngine {
    store: SharedStore,
    config: Arc<ExperimentConfig>,
    selector: Arc<dyn ArmSelector>,
}

impl AbEngine {
    #[must_use]
    pub fn new(store: SharedStore, config: ExperimentConfig) -> Self {
        Self {
            store,
            config: Arc::new(config),
            selector: Arc::new(RandomArmSelector),
        }
    }

    #[must_use]
    pub fn with_selector(mut self, selector: Arc<dyn ArmSelector>) -> Self {
        self.selector = selector;
        self
    }

    #[must_use]
    pub fn config(&self) -> &ExperimentConfig {
        &self.config
    }

    /// # Errors
    /// Returns an error when the skill name is empty or the store fails.
    pub fn register_variation(&self, skill: &str, content: &Value) -> Result<Variation> {
        with_store(&self.store, |store| store.register_variation(skill, content))
    }

    /// # Errors
    /// Returns an integrity violation when the skill already has a
    /// production variant or the variation is not pending.
    pub fn adopt_baseline(&self, variation_id: VariationId) -> Result<Variation> {
        with_store(&self.store, |store| store.adopt_baseline(variation_id))
    }

    /// Starts a test of `treatment` against the production `control`.
    /// `sample_target` defaults to the configured per-arm target.
    ///
    /// # Errors
    /// Returns an integrity violation when `control` is not in production,
    /// `treatment` is not pending, or the skill already has a running test.
    pub fn schedule_test(
        &self,
        skill: &str,
        control: VariationId,
        treatment: VariationId,
        sample_target: Option<u32>,
        as_of: OffsetDateTime,
    ) -> Result<AbAssignment> {
        let sample_target = sample_target.unwrap_or(self.config.default_sample_target);
        with_store(&self.store, |store| {
            store.schedule_test(skill, control, treatment, sample_target, &self.config, as_of)
        })
    }

    /// Picks the variant for one invocation, flipping the selector when a
    /// test is running.
    ///
    /// # Errors
    /// Returns an error when the store fails or a routed variation is
    /// missing.
    pub fn choose(&self, skill: &str) -> Result<VariantChoice> {
        with_store(&self.store, |store| {
            if let Some(assignment) = store.running_assignment(skill)? {
                let arm = self.selector.select(&assignment);
                let variation_id = assignment.variation_for(arm);
                let variation = store
                    .get_variation(variation_id)?
                    .ok_or_else(|| anyhow!("routed variation {variation_id} not found"))?;
                return Ok(VariantChoice::Trial {
                    route: ArmRoute {
                        assignment_id: assignment.assignment_id,
                        arm,
                        variation,
                    },
                });
            }
            Ok(match store.production_variation(skill)? {
                Some(variation) => VariantChoice::Production { variation },
                None => VariantChoice::Unversioned,
            })
        })
    }

    /// Counts the observed outcome for the routed arm and applies any
    /// decision.
    ///
    /// # Errors
    /// Returns an error when the store fails.
    pub fn record_outcome(
        &self,
        route: &ArmRoute,
        success: bool,
        as_of: OffsetDateTime,
    ) -> Result<TrialReport> {
        let report = with_store(&self.store, |store| {
            store.record_trial(route.assignment_id, route.arm, success, &self.config, as_of)
        })?;
        if !report.recorded {
            tracing::debug!(
                assignment_id = %route.assignment_id,
                arm = route.arm.as_str(),
                "trial arrived after the test concluded"
            );
        }
        Ok(report)
    }

    /// # Errors
    /// Returns an error when the store fails.
    pub fn running_test(&self, skill: &str) -> Result<Option<AbAssignment>> {
        with_store(&self.store, |store| store.running_assignment(skill))
    }

    /// # Errors
    /// Returns an error when the store fails.
    pub fn list_tests(&self, skill: Option<&str>) -> Result<Vec<AbAssignment>> {
        with_store(&self.store, |store| store.list_assignments(skill))
    }

    /// # Errors
    /// Returns an error when the store fails.
    pub fn list_variations(&self, skill: &str) -> Result<Vec<Variation>> {
        with_store(&self.store, |store| store.list_variations(skill))
    }

    /// # Errors
    /// Returns an error when the store fails.
    pub fn production_variation(&self, skill: &str) -> Result<Option<Variation>> {
        with_store(&self.store, |store| store.production_variation(skill))
    }
}
