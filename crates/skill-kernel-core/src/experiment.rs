use serde::{Deserialize, Serialize};
use serde_json::Value;
use time::{Duration, OffsetDateTime};

use crate::{AbAssignment, AssignmentDecision, KernelError};

/// Absorbs float noise when a margin sits exactly on the decision boundary.
const MARGIN_EPSILON: f64 = 1e-9;

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct ExperimentConfig {
    pub config_version: u32,
    pub default_sample_target: u32,
    pub promote_margin: f64,
    pub archive_margin: f64,
    pub ceiling_multiplier: u32,
    pub max_test_days: i64,
}

impl ExperimentConfig {
    #[must_use]
    pub fn v1() -> Self {
        Self {
            config_version: 1,
            default_sample_target: 20,
            promote_margin: 0.10,
            archive_margin: 0.10,
            ceiling_multiplier: 5,
            max_test_days: 14,
        }
    }

    /// Validates decision margins and ceilings.
    ///
    /// # Errors
    /// Returns [`KernelError::Configuration`] when margins are outside
    /// `(0, 1]` or the sample target and ceilings are not positive.
    pub fn validate(&self) -> Result<(), KernelError> {
        if self.config_version == 0 {
            return Err(KernelError::Configuration(
                "config_version MUST be >= 1".to_string(),
            ));
        }
        for (name, value) in [
            ("promote_margin", self.promote_margin),
            ("archive_margin", self.archive_margin),
        ] {
            if !value.is_finite() || value <= 0.0 || value > 1.0 {
                return Err(KernelError::Configuration(format!(
                    "{name} MUST be in (0.0, 1.0]"
                )));
            }
        }
        if self.default_sample_target == 0 {
            return Err(KernelError::Configuration(
                "default_sample_target MUST be >= 1".to_string(),
            ));
        }
        if self.ceiling_multiplier < 2 {
            return Err(KernelError::Configuration(
                "ceiling_multiplier MUST be >= 2".to_string(),
            ));
        }
        if self.max_test_days < 1 {
            return Err(KernelError::Configuration(
                "max_test_days MUST be >= 1".to_string(),
            ));
        }
        Ok(())
    }

    #[must_use]
    pub fn max_trials_per_arm(&self, sample_target: u32) -> u32 {
        sample_target.saturating_mul(self.ceiling_multiplier)
    }

    #[must_use]
    pub fn deadline(&self, started_at: OffsetDateTime) -> OffsetDateTime {
        started_at + Duration::days(self.max_test_days)
    }

    /// Decodes and validates an experiment config from JSON.
    ///
    /// # Errors
    /// Returns [`KernelError::Configuration`] when JSON decoding fails or
    /// decoded values violate constraints.
    pub fn from_json(value: &Value) -> Result<Self, KernelError> {
        let config: Self = serde_json::from_value(value.clone()).map_err(|err| {
            KernelError::Configuration(format!("invalid experiment JSON payload: {err}"))
        })?;
        config.validate()?;
        Ok(config)
    }
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq)]
#[serde(tag = "verdict", rename_all = "snake_case")]
pub enum ExperimentVerdict {
    AwaitingSamples { control_trials: u32, treatment_trials: u32, sample_target: u32 },
    Inconclusive { margin: f64 },
    Decided { decision: AssignmentDecision, margin: f64 },
}

impl ExperimentVerdict {
    #[must_use]
    pub fn decision(self) -> Option<AssignmentDecision> {
        match self {
            Self::Decided { decision, .. } => Some(decision),
            Self::AwaitingSamples { .. } | Self::Inconclusive { .. } => None,
        }
    }
}

/// Deterministic decision over stored counters and timestamps.
///
/// The sample target applies per arm, so no decision is taken before both
/// arms have `sample_target` trials, except for the hard ceiling which
/// concludes a stalled test at its trial cap or deadline.
#[must_use]
pub fn evaluate_assignment(
    assignment: &AbAssignment,
    config: &ExperimentConfig,
    as_of: OffsetDateTime,
) -> ExperimentVerdict {
    let margin = assignment.margin();
    let target = assignment.sample_target;
    let target_met = assignment.control_trials >= target && assignment.treatment_trials >= target;

    if target_met {
        if margin + MARGIN_EPSILON >= config.promote_margin {
            return ExperimentVerdict::Decided {
                decision: AssignmentDecision::PromotedTreatment,
                margin,
            };
        }
        if margin - MARGIN_EPSILON <= -config.archive_margin {
            return ExperimentVerdict::Decided {
                decision: AssignmentDecision::ArchivedTreatment,
                margin,
            };
        }
    }

    let max_trials = assignment.max_trials_per_arm;
    let trial_ceiling =
        assignment.control_trials >= max_trials || assignment.treatment_trials >= max_trials;
    let expired = as_of >= assignment.deadline;
    if trial_ceiling || expired {
        return ExperimentVerdict::Decided {
            decision: AssignmentDecision::CeilingReached,
            margin,
        };
    }

    if target_met {
        ExperimentVerdict::Inconclusive { margin }
    } else {
        ExperimentVerdict::AwaitingSamples {
            control_trials: assignment.control_trials,
            treatment_trials: assignment.treatment_trials,
            sample_target: target,
        }
    }
}

#[cfg(test)]
mod tests {
    use proptest::prelude::*;

    use super::*;
    use crate::{parse_rfc3339_utc, AssignmentId, AssignmentStatus, VariationId};

    fn started() -> OffsetDateTime {
        match parse_rfc3339_utc("2026-04-01T00:00:00Z") {
            Ok(value) => value,
            Err(err) => panic!("fixture timestamp: {err}"),
        }
    }

    fn assignment(control: (u32, u32), treatment: (u32, u32), target: u32) -> AbAssignment {
        let config = ExperimentConfig::v1();
        AbAssignment {
            assignment_id: AssignmentId::new(),
            skill: "lint".to_string(),
            control_variation: VariationId::new(),
            treatment_variation: VariationId::new(),
            started_at: started(),
            ended_at: None,
            status: AssignmentStatus::Running,
            decision: None,
            control_successes: control.0,
            control_trials: control.1,
            treatment_successes: treatment.0,
            treatment_trials: treatment.1,
            sample_target: target,
            max_trials_per_arm: config.max_trials_per_arm(target),
            deadline: config.deadline(started()),
        }
    }

    #[test]
    fn undersampled_test_stays_undecided_despite_large_margin() {
        let verdict = evaluate_assignment(
            &assignment((5, 10), (9, 10), 20),
            &ExperimentConfig::v1(),
            started() + Duration::days(1),
        );
        assert!(matches!(verdict, ExperimentVerdict::AwaitingSamples { .. }));
    }

    #[test]
    fn margin_of_twelve_points_promotes_once_target_met() {
        let verdict = evaluate_assignment(
            &assignment((13, 25), (16, 25), 20),
            &ExperimentConfig::v1(),
            started() + Duration::days(2),
        );
        assert_eq!(verdict.decision(), Some(AssignmentDecision::PromotedTreatment));
    }

    #[test]
    fn margin_exactly_at_boundary_decides() {
        let config = ExperimentConfig::v1();
        let at = started() + Duration::days(1);
        let promoted = evaluate_assignment(&assignment((14, 20), (16, 20), 20), &config, at);
        assert_eq!(promoted.decision(), Some(AssignmentDecision::PromotedTreatment));
        let archived = evaluate_assignment(&assignment((16, 20), (14, 20), 20), &config, at);
        assert_eq!(archived.decision(), Some(AssignmentDecision::ArchivedTreatment));
    }

    #[test]
    fn inconclusive_tests_hit_the_ceiling() {
        let config = ExperimentConfig::v1();
        let early = evaluate_assignment(
            &assignment((10, 20), (11, 20), 20),
            &config,
            started() + Duration::days(1),
        );
        assert!(matches!(early, ExperimentVerdict::Inconclusive { .. }));

        let exhausted = evaluate_assignment(
            &assignment((50, 100), (52, 100), 20),
            &config,
            started() + Duration::days(1),
        );
        assert_eq!(exhausted.decision(), Some(AssignmentDecision::CeilingReached));

        let expired = evaluate_assignment(
            &assignment((3, 6), (3, 5), 20),
            &config,
            started() + Duration::days(15),
        );
        assert_eq!(expired.decision(), Some(AssignmentDecision::CeilingReached));
    }

    proptest! {
        #![proptest_config(ProptestConfig::with_cases(48))]

        #[test]
        fn promotion_never_precedes_sample_target(
            target in 1_u32..40,
            control_trials in 0_u32..60,
            treatment_trials in 0_u32..60,
            control_rate in 0.0_f64..=1.0,
            treatment_rate in 0.0_f64..=1.0,
        ) {
            let control_successes = scaled(control_trials, control_rate);
            let treatment_successes = scaled(treatment_trials, treatment_rate);
            let candidate = assignment(
                (control_successes, control_trials),
                (treatment_successes, treatment_trials),
                target,
            );
            let verdict = evaluate_assignment(
                &candidate,
                &ExperimentConfig::v1(),
                started() + Duration::days(1),
            );
            if verdict.decision() == Some(AssignmentDecision::PromotedTreatment) {
                prop_assert!(candidate.trials_total() >= target);
                prop_assert!(candidate.treatment_trials >= target);
                prop_assert!(candidate.control_trials >= target);
            }
        }
    }

    #[allow(clippy::cast_possible_truncation, clippy::cast_sign_loss)]
    fn scaled(trials: u32, rate: f64) -> u32 {
        (f64::from(trials) * rate).floor() as u32
    }
}
