use serde::{Deserialize, Serialize};
use serde_json::Value;
use time::OffsetDateTime;

use crate::{days_since, ConfidenceEvent, ConfidenceEventKind, KernelError};

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct ConfidenceRuleset {
    pub ruleset_version: u32,
    pub default_confidence: f64,
    pub decay_lambda_per_day: f64,
    pub lookback_days: f64,
    pub burst_window_days: f64,
    pub burst_penalty_per_failure: f64,
    pub burst_floor: f64,
    pub human_approval_boost: f64,
    pub rollback_penalty: f64,
    pub contract_violation_penalty: f64,
    pub regression_penalty: f64,
    pub security_issue_penalty: f64,
    pub confirmed_detection_boost: f64,
    pub false_positive_penalty: f64,
}

impl ConfidenceRuleset {
    #[must_use]
    pub fn v1() -> Self {
        Self {
            ruleset_version: 1,
            default_confidence: 0.50,
            decay_lambda_per_day: 0.05,
            lookback_days: 30.0,
            burst_window_days: 7.0,
            burst_penalty_per_failure: 0.10,
            burst_floor: 0.50,
            human_approval_boost: 0.10,
            rollback_penalty: 0.15,
            contract_violation_penalty: 0.20,
            regression_penalty: 0.25,
            security_issue_penalty: 0.50,
            confirmed_detection_boost: 0.05,
            false_positive_penalty: 0.05,
        }
    }

    /// Validates ruleset numeric bounds.
    ///
    /// # Errors
    /// Returns [`KernelError::Configuration`] when one or more ruleset fields
    /// are outside allowed bounds.
    pub fn validate(&self) -> Result<(), KernelError> {
        if self.ruleset_version == 0 {
            return Err(KernelError::Configuration(
                "ruleset_version MUST be >= 1".to_string(),
            ));
        }

        for (name, value) in [
            ("default_confidence", self.default_confidence),
            ("decay_lambda_per_day", self.decay_lambda_per_day),
            ("burst_penalty_per_failure", self.burst_penalty_per_failure),
            ("burst_floor", self.burst_floor),
            ("human_approval_boost", self.human_approval_boost),
            ("rollback_penalty", self.rollback_penalty),
            ("contract_violation_penalty", self.contract_violation_penalty),
            ("regression_penalty", self.regression_penalty),
            ("security_issue_penalty", self.security_issue_penalty),
            ("confirmed_detection_boost", self.confirmed_detection_boost),
            ("false_positive_penalty", self.false_positive_penalty),
        ] {
            if !value.is_finite() || !(0.0..=1.0).contains(&value) {
                return Err(KernelError::Configuration(format!(
                    "{name} MUST be in [0.0, 1.0]"
                )));
            }
        }

        if self.lookback_days.is_nan() || self.lookback_days <= 0.0 {
            return Err(KernelError::Configuration(
                "lookback_days MUST be > 0".to_string(),
            ));
        }

        if self.burst_window_days.is_nan()
            || self.burst_window_days <= 0.0
            || self.burst_window_days > self.lookback_days
        {
            return Err(KernelError::Configuration(
                "burst_window_days MUST be in (0, lookback_days]".to_string(),
            ));
        }

        Ok(())
    }

    /// Signed boost or penalty added to the raw 1.0/0.0 outcome of an event.
    #[must_use]
    pub fn adjustment(&self, kind: ConfidenceEventKind) -> f64 {
        match kind {
            ConfidenceEventKind::Execution => 0.0,
            ConfidenceEventKind::HumanApproval => self.human_approval_boost,
            ConfidenceEventKind::Rollback => -self.rollback_penalty,
            ConfidenceEventKind::ContractViolation => -self.contract_violation_penalty,
            ConfidenceEventKind::Regression => -self.regression_penalty,
            ConfidenceEventKind::SecurityIssue => -self.security_issue_penalty,
            ConfidenceEventKind::ConfirmedDetection => self.confirmed_detection_boost,
            ConfidenceEventKind::FalsePositive => -self.false_positive_penalty,
        }
    }

    #[must_use]
    pub fn failure_multiplier(&self, recent_failures: u32) -> f64 {
        let raw = 1.0 - self.burst_penalty_per_failure * f64::from(recent_failures);
        raw.max(self.burst_floor)
    }

    /// Decodes and validates a ruleset from JSON.
    ///
    /// # Errors
    /// Returns [`KernelError::Configuration`] when JSON decoding fails or
    /// decoded values violate ruleset constraints.
    pub fn from_json(value: &Value) -> Result<Self, KernelError> {
        let ruleset: Self = serde_json::from_value(value.clone()).map_err(|err| {
            KernelError::Configuration(format!("invalid confidence ruleset JSON payload: {err}"))
        })?;
        ruleset.validate()?;
        Ok(ruleset)
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct ConfidenceBreakdown {
    pub confidence: f64,
    pub base_score: f64,
    pub failure_multiplier: f64,
    pub recent_failures: u32,
    pub events_in_window: u32,
    pub total_weight: f64,
    pub ruleset_version: u32,
}

/// Projects the decayed, burst-penalized confidence for one agent's event
/// stream as of `as_of`.
///
/// Events older than the lookback window and events in the future of
/// `as_of` carry no weight.
#[must_use]
pub fn compute_confidence(
    events: &[ConfidenceEvent],
    ruleset: &ConfidenceRuleset,
    as_of: OffsetDateTime,
) -> ConfidenceBreakdown {
    let mut weighted_sum = 0.0_f64;
    let mut total_weight = 0.0_f64;
    let mut events_in_window = 0_u32;
    let mut recent_failures = 0_u32;

    for event in events {
        if event.occurred_at > as_of {
            continue;
        }
        let age_days = days_since(event.occurred_at, as_of);
        if age_days > ruleset.lookback_days {
            continue;
        }

        let raw = if event.success { 1.0 } else { 0.0 };
        let adjusted = raw + ruleset.adjustment(event.kind);
        let weight = (-ruleset.decay_lambda_per_day * age_days).exp();

        weighted_sum += weight * adjusted;
        total_weight += weight;
        events_in_window = events_in_window.saturating_add(1);

        if event.kind.is_penalty() && age_days <= ruleset.burst_window_days {
            recent_failures = recent_failures.saturating_add(1);
        }
    }

    let base_score = if total_weight > 0.0 {
        clamp_unit(weighted_sum / total_weight)
    } else {
        ruleset.default_confidence
    };
    let failure_multiplier = ruleset.failure_multiplier(recent_failures);

    ConfidenceBreakdown {
        confidence: clamp_unit(base_score * failure_multiplier),
        base_score,
        failure_multiplier,
        recent_failures,
        events_in_window,
        total_weight,
        ruleset_version: ruleset.ruleset_version,
    }
}

fn clamp_unit(value: f64) -> f64 {
    if value.is_nan() {
        return 0.0;
    }
    value.clamp(0.0, 1.0)
}

#[cfg(test)]
mod tests {
    use proptest::prelude::*;
    use time::Duration;
    use ulid::Ulid;

    use super::*;
    use crate::{parse_rfc3339_utc, ExecutionId};

    fn as_of() -> OffsetDateTime {
        match parse_rfc3339_utc("2026-04-01T00:00:00Z") {
            Ok(value) => value,
            Err(err) => panic!("fixture timestamp: {err}"),
        }
    }

    fn event(kind: ConfidenceEventKind, success: bool, age_days: i64) -> ConfidenceEvent {
        let occurred_at = as_of() - Duration::days(age_days);
        ConfidenceEvent {
            event_seq: 0,
            event_id: Ulid::new(),
            agent: "agent-a".to_string(),
            skill: Some("lint".to_string()),
            kind,
            success,
            fidelity: None,
            occurred_at,
            recorded_at: occurred_at,
            execution_id: if kind == ConfidenceEventKind::Execution {
                Some(ExecutionId::new())
            } else {
                None
            },
            evidence: "fixture".to_string(),
        }
    }

    #[test]
    fn empty_history_yields_default_confidence() {
        let breakdown = compute_confidence(&[], &ConfidenceRuleset::v1(), as_of());
        assert!((breakdown.confidence - 0.5).abs() < 1e-9);
        assert_eq!(breakdown.events_in_window, 0);
    }

    fn event_hours_ago(
        kind: ConfidenceEventKind,
        success: bool,
        age_hours: i64,
    ) -> ConfidenceEvent {
        let mut fixture = event(kind, success, 0);
        fixture.occurred_at = as_of() - Duration::hours(age_hours);
        fixture.recorded_at = fixture.occurred_at;
        fixture
    }

    #[test]
    fn twenty_recent_runs_with_two_failures_land_in_high_band() {
        let events: Vec<ConfidenceEvent> = (0..20)
            .map(|age| {
                let success = age != 3 && age != 11;
                event_hours_ago(ConfidenceEventKind::Execution, success, age)
            })
            .collect();
        let breakdown = compute_confidence(&events, &ConfidenceRuleset::v1(), as_of());

        assert_eq!(breakdown.recent_failures, 0);
        assert!((breakdown.failure_multiplier - 1.0).abs() < 1e-9);
        assert!(breakdown.confidence >= 0.85, "got {}", breakdown.confidence);
        assert!(breakdown.confidence <= 0.95, "got {}", breakdown.confidence);
    }

    #[test]
    fn failed_executions_do_not_feed_the_burst_multiplier() {
        let mut events: Vec<ConfidenceEvent> = (0..5)
            .map(|age| event_hours_ago(ConfidenceEventKind::Execution, false, age))
            .collect();
        events.push(event_hours_ago(ConfidenceEventKind::FalsePositive, false, 1));
        let breakdown = compute_confidence(&events, &ConfidenceRuleset::v1(), as_of());

        assert_eq!(breakdown.recent_failures, 1);
        assert!((breakdown.failure_multiplier - 0.9).abs() < 1e-9);
    }

    #[test]
    fn three_recent_rollbacks_apply_point_seven_multiplier() {
        let mut events: Vec<ConfidenceEvent> = (0..10)
            .map(|age| event(ConfidenceEventKind::Execution, true, age))
            .collect();
        for age in [1, 2, 3] {
            events.push(event(ConfidenceEventKind::Rollback, false, age));
        }
        let breakdown = compute_confidence(&events, &ConfidenceRuleset::v1(), as_of());

        assert_eq!(breakdown.recent_failures, 3);
        assert!((breakdown.failure_multiplier - 0.7).abs() < 1e-9);
        assert!((breakdown.confidence - breakdown.base_score * 0.7).abs() < 1e-9);
    }

    #[test]
    fn burst_multiplier_has_floor() {
        let ruleset = ConfidenceRuleset::v1();
        assert!((ruleset.failure_multiplier(9) - 0.5).abs() < 1e-9);
        assert!((ruleset.failure_multiplier(0) - 1.0).abs() < 1e-9);
    }

    #[test]
    fn human_approval_lifts_and_security_issue_sinks() {
        let base: Vec<ConfidenceEvent> = (0..5)
            .map(|age| event(ConfidenceEventKind::Execution, age % 2 == 0, age + 8))
            .collect();
        let ruleset = ConfidenceRuleset::v1();
        let baseline = compute_confidence(&base, &ruleset, as_of()).confidence;

        let mut approved = base.clone();
        approved.push(event(ConfidenceEventKind::HumanApproval, true, 8));
        assert!(compute_confidence(&approved, &ruleset, as_of()).confidence > baseline);

        let mut breached = base;
        breached.push(event(ConfidenceEventKind::SecurityIssue, false, 8));
        assert!(compute_confidence(&breached, &ruleset, as_of()).confidence < baseline);
    }

    #[test]
    fn ruleset_round_trips_through_json_and_rejects_bad_bounds() {
        let ruleset = ConfidenceRuleset::v1();
        let json = match serde_json::to_value(&ruleset) {
            Ok(value) => value,
            Err(err) => panic!("serialize ruleset: {err}"),
        };
        assert_eq!(ConfidenceRuleset::from_json(&json), Ok(ruleset.clone()));

        let mut broken = ruleset;
        broken.burst_window_days = 60.0;
        assert!(matches!(
            broken.validate(),
            Err(KernelError::Configuration(_))
        ));
    }

    proptest! {
        #![proptest_config(ProptestConfig::with_cases(48))]

        #[test]
        fn events_beyond_lookback_contribute_nothing(
            recent in proptest::collection::vec(any::<bool>(), 1..12),
            stale in proptest::collection::vec(any::<bool>(), 1..12),
        ) {
            let ruleset = ConfidenceRuleset::v1();
            let in_window: Vec<ConfidenceEvent> = recent
                .iter()
                .enumerate()
                .map(|(idx, success)| {
                    event(ConfidenceEventKind::Execution, *success, i64::try_from(idx).unwrap_or(0))
                })
                .collect();
            let mut with_stale = in_window.clone();
            for (idx, success) in stale.iter().enumerate() {
                let age = 31 + i64::try_from(idx).unwrap_or(0);
                with_stale.push(event(ConfidenceEventKind::Execution, *success, age));
            }

            let without = compute_confidence(&in_window, &ruleset, as_of());
            let with = compute_confidence(&with_stale, &ruleset, as_of());
            prop_assert!((without.confidence - with.confidence).abs() < 1e-12);
            prop_assert_eq!(without.events_in_window, with.events_in_window);
        }

        #[test]
        fn confidence_stays_in_unit_interval(
            kinds in proptest::collection::vec(0_u8..8, 0..24),
        ) {
            let ruleset = ConfidenceRuleset::v1();
            let events: Vec<ConfidenceEvent> = kinds
                .iter()
                .enumerate()
                .map(|(idx, code)| {
                    let kind = match code {
                        0 => ConfidenceEventKind::Execution,
                        1 => ConfidenceEventKind::HumanApproval,
                        2 => ConfidenceEventKind::Rollback,
                        3 => ConfidenceEventKind::ContractViolation,
                        4 => ConfidenceEventKind::Regression,
                        5 => ConfidenceEventKind::SecurityIssue,
                        6 => ConfidenceEventKind::ConfirmedDetection,
                        _ => ConfidenceEventKind::FalsePositive,
                    };
                    let success = kind.implied_success().unwrap_or(idx % 3 != 0);
                    event(kind, success, i64::try_from(idx).unwrap_or(0))
                })
                .collect();
            let breakdown = compute_confidence(&events, &ruleset, as_of());
            prop_assert!((0.0..=1.0).contains(&breakdown.confidence));
        }
    }
}
