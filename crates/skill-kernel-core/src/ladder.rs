use globset::{Glob, GlobSet, GlobSetBuilder};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use time::{Duration, OffsetDateTime};

use crate::{success_rate, KernelError, Operation, PermissionRecord, Tier};

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct TierPolicy {
    pub tier: Tier,
    pub promotion_threshold: f64,
    pub downgrade_threshold: f64,
    pub min_executions: u64,
    pub min_human_validations: u64,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct LadderConfig {
    pub config_version: u32,
    pub tiers: Vec<TierPolicy>,
    pub cooldown_hours: i64,
    pub grant_ttl_days: i64,
    pub reapproval_min_success_rate: f64,
    pub reapproval_window_days: i64,
    pub forbidden_patterns: Vec<String>,
}

impl LadderConfig {
    #[must_use]
    pub fn v1() -> Self {
        Self {
            config_version: 1,
            tiers: vec![
                TierPolicy {
                    tier: Tier::MetricsWrite,
                    promotion_threshold: 0.75,
                    downgrade_threshold: 0.65,
                    min_executions: 10,
                    min_human_validations: 0,
                },
                TierPolicy {
                    tier: Tier::EditRestricted,
                    promotion_threshold: 0.85,
                    downgrade_threshold: 0.75,
                    min_executions: 25,
                    min_human_validations: 3,
                },
                TierPolicy {
                    tier: Tier::EditUnrestricted,
                    promotion_threshold: 0.95,
                    downgrade_threshold: 0.88,
                    min_executions: 100,
                    min_human_validations: 10,
                },
            ],
            cooldown_hours: 48,
            grant_ttl_days: 30,
            reapproval_min_success_rate: 0.90,
            reapproval_window_days: 7,
            forbidden_patterns: [
                "**/.env",
                "**/.env.*",
                "**/*.pem",
                "**/*.key",
                "**/secrets/**",
                "**/credentials*",
                ".git/**",
                "**/src/main.rs",
                "**/build.rs",
                "**/skill-kernel-*/**",
            ]
            .into_iter()
            .map(str::to_string)
            .collect(),
        }
    }

    /// Validates ladder thresholds, hysteresis and path patterns.
    ///
    /// # Errors
    /// Returns [`KernelError::Configuration`] when a tier is missing or
    /// duplicated, thresholds are out of range, a downgrade threshold is not
    /// strictly below its promotion threshold, or a pattern fails to compile.
    pub fn validate(&self) -> Result<(), KernelError> {
        if self.config_version == 0 {
            return Err(KernelError::Configuration(
                "config_version MUST be >= 1".to_string(),
            ));
        }

        let mut previous_promotion = 0.0_f64;
        for tier in Tier::LADDER.into_iter().skip(1) {
            let matching: Vec<&TierPolicy> =
                self.tiers.iter().filter(|policy| policy.tier == tier).collect();
            let [policy] = matching.as_slice() else {
                return Err(KernelError::Configuration(format!(
                    "ladder MUST define exactly one policy for {tier}"
                )));
            };

            for (name, value) in [
                ("promotion_threshold", policy.promotion_threshold),
                ("downgrade_threshold", policy.downgrade_threshold),
            ] {
                if !value.is_finite() || !(0.0..=1.0).contains(&value) {
                    return Err(KernelError::Configuration(format!(
                        "{tier}.{name} MUST be in [0.0, 1.0]"
                    )));
                }
            }

            if policy.downgrade_threshold >= policy.promotion_threshold {
                return Err(KernelError::Configuration(format!(
                    "{tier}.downgrade_threshold MUST be < promotion_threshold"
                )));
            }

            if policy.promotion_threshold < previous_promotion {
                return Err(KernelError::Configuration(format!(
                    "{tier}.promotion_threshold MUST NOT be below the rung beneath it"
                )));
            }
            previous_promotion = policy.promotion_threshold;
        }

        if self.tiers.iter().any(|policy| policy.tier == Tier::ReadOnly) {
            return Err(KernelError::Configuration(
                "read_only is the ladder floor and takes no policy".to_string(),
            ));
        }

        if self.cooldown_hours < 0 {
            return Err(KernelError::Configuration(
                "cooldown_hours MUST be >= 0".to_string(),
            ));
        }

        if self.grant_ttl_days < 1 || self.reapproval_window_days < 1 {
            return Err(KernelError::Configuration(
                "grant_ttl_days and reapproval_window_days MUST be >= 1".to_string(),
            ));
        }

        if !(0.0..=1.0).contains(&self.reapproval_min_success_rate) {
            return Err(KernelError::Configuration(
                "reapproval_min_success_rate MUST be in [0.0, 1.0]".to_string(),
            ));
        }

        PathRules::compile(&self.forbidden_patterns)?;
        Ok(())
    }

    #[must_use]
    pub fn policy_for(&self, tier: Tier) -> Option<&TierPolicy> {
        self.tiers.iter().find(|policy| policy.tier == tier)
    }

    #[must_use]
    pub fn cooldown(&self) -> Duration {
        Duration::hours(self.cooldown_hours)
    }

    #[must_use]
    pub fn grant_ttl(&self) -> Duration {
        Duration::days(self.grant_ttl_days)
    }

    #[must_use]
    pub fn reapproval_window(&self) -> Duration {
        Duration::days(self.reapproval_window_days)
    }

    /// Tier to fall back to when `confidence` sinks below the current tier's
    /// downgrade threshold. `None` means the tier holds.
    #[must_use]
    pub fn downgrade_target(&self, current: Tier, confidence: f64) -> Option<Tier> {
        let policy = self.policy_for(current)?;
        if confidence < policy.downgrade_threshold {
            return current.previous();
        }
        None
    }

    /// Decodes and validates a ladder from JSON.
    ///
    /// # Errors
    /// Returns [`KernelError::Configuration`] when JSON decoding fails or
    /// decoded values violate ladder constraints.
    pub fn from_json(value: &Value) -> Result<Self, KernelError> {
        let config: Self = serde_json::from_value(value.clone()).map_err(|err| {
            KernelError::Configuration(format!("invalid ladder JSON payload: {err}"))
        })?;
        config.validate()?;
        Ok(config)
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct PromotionEvidence {
    pub current_tier: Tier,
    pub requested_tier: Tier,
    pub confidence: f64,
    pub executions: u64,
    pub human_validations: u64,
    pub locked: bool,
    pub cooldown_until: Option<OffsetDateTime>,
    pub as_of: OffsetDateTime,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct PromotionGate {
    pub eligible: bool,
    pub reasons: Vec<String>,
}

impl PromotionGate {
    fn from_reasons(reasons: Vec<String>) -> Self {
        Self {
            eligible: reasons.is_empty(),
            reasons,
        }
    }

    /// Converts a failed gate into a single [`KernelError::PolicyGate`].
    ///
    /// # Errors
    /// Returns [`KernelError::PolicyGate`] listing every failing reason.
    pub fn into_result(self) -> Result<(), KernelError> {
        if self.eligible {
            return Ok(());
        }
        Err(KernelError::PolicyGate(self.reasons.join("; ")))
    }
}

/// Evaluates every promotion gate at once so callers see all failures
/// together rather than one per attempt.
#[must_use]
pub fn evaluate_promotion(config: &LadderConfig, evidence: &PromotionEvidence) -> PromotionGate {
    let mut reasons = Vec::new();

    if evidence.locked {
        reasons.push("denied.hard_lock: human re-approval required".to_string());
    }

    if let Some(cooldown_until) = evidence.cooldown_until {
        if cooldown_until > evidence.as_of {
            reasons.push(format!(
                "denied.cooldown_active: until {}",
                crate::format_rfc3339(cooldown_until).unwrap_or_default()
            ));
        }
    }

    if evidence.current_tier.next() != Some(evidence.requested_tier) {
        reasons.push(format!(
            "denied.one_rung_at_a_time: {} -> {}",
            evidence.current_tier, evidence.requested_tier
        ));
    }

    match config.policy_for(evidence.requested_tier) {
        None => reasons.push(format!(
            "denied.no_policy: {} cannot be granted",
            evidence.requested_tier
        )),
        Some(policy) => {
            if !evidence.confidence.is_finite() || evidence.confidence < policy.promotion_threshold
            {
                reasons.push(format!(
                    "denied.confidence_below_threshold: {:.2} < {:.2}",
                    evidence.confidence, policy.promotion_threshold
                ));
            }
            if evidence.executions < policy.min_executions {
                reasons.push(format!(
                    "denied.insufficient_executions: {} < {}",
                    evidence.executions, policy.min_executions
                ));
            }
            if evidence.human_validations < policy.min_human_validations {
                reasons.push(format!(
                    "denied.insufficient_human_validations: {} < {}",
                    evidence.human_validations, policy.min_human_validations
                ));
            }
        }
    }

    PromotionGate::from_reasons(reasons)
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct ReapprovalEvidence {
    pub tier: Tier,
    pub confidence: f64,
    pub recent_executions: u32,
    pub recent_successes: u32,
    pub granted_by: String,
    pub locked: bool,
}

/// Gates a re-approval that waives cooldown (and, for a human, lifts a
/// hard lock). Missing recent history fails closed.
#[must_use]
pub fn evaluate_reapproval(config: &LadderConfig, evidence: &ReapprovalEvidence) -> PromotionGate {
    let mut reasons = Vec::new();

    if evidence.locked && is_system_actor(&evidence.granted_by) {
        reasons.push("denied.hard_lock: only a human may lift the lock".to_string());
    }

    let floor = config
        .policy_for(evidence.tier)
        .map_or(0.0, |policy| policy.downgrade_threshold);
    if !evidence.confidence.is_finite() || evidence.confidence < floor {
        reasons.push(format!(
            "denied.confidence_not_recovered: {:.2} < {floor:.2}",
            evidence.confidence
        ));
    }

    if evidence.recent_executions == 0 {
        reasons.push("denied.no_recent_executions".to_string());
    } else {
        let rate = success_rate(evidence.recent_successes, evidence.recent_executions);
        if rate < config.reapproval_min_success_rate {
            reasons.push(format!(
                "denied.recent_success_rate: {rate:.2} < {:.2}",
                config.reapproval_min_success_rate
            ));
        }
    }

    PromotionGate::from_reasons(reasons)
}

/// Tier in force at `as_of` given an agent's latest permission event. An
/// expired grant falls back to read-only rather than to an older grant.
#[must_use]
pub fn current_tier(latest: Option<&PermissionRecord>, as_of: OffsetDateTime) -> Tier {
    match latest {
        Some(record) if !record.is_expired(as_of) => record.tier,
        _ => Tier::ReadOnly,
    }
}

#[must_use]
pub fn is_system_actor(actor: &str) -> bool {
    actor.trim().to_ascii_lowercase().starts_with("system")
}

#[derive(Debug, Clone)]
pub struct PathRules {
    forbidden: GlobSet,
    patterns: Vec<String>,
}

impl PathRules {
    /// Compiles forbidden path globs.
    ///
    /// # Errors
    /// Returns [`KernelError::Configuration`] when a pattern is not a valid
    /// glob.
    pub fn compile(patterns: &[String]) -> Result<Self, KernelError> {
        Ok(Self {
            forbidden: build_glob_set(patterns)?,
            patterns: patterns.to_vec(),
        })
    }

    #[must_use]
    pub fn patterns(&self) -> &[String] {
        &self.patterns
    }

    /// Paths escaping the workspace are treated as forbidden.
    #[must_use]
    pub fn is_forbidden(&self, path: &str) -> bool {
        match normalize_path(path) {
            Some(normalized) => self.forbidden.is_match(normalized),
            None => true,
        }
    }
}

/// Whether `path` matches any allowlist glob.
///
/// # Errors
/// Returns [`KernelError::Configuration`] when an allowlist pattern is not a
/// valid glob.
pub fn allowlist_matches(allowlist: &[String], path: &str) -> Result<bool, KernelError> {
    if allowlist.is_empty() {
        return Ok(false);
    }
    let Some(normalized) = normalize_path(path) else {
        return Ok(false);
    };
    Ok(build_glob_set(allowlist)?.is_match(normalized))
}

fn build_glob_set(patterns: &[String]) -> Result<GlobSet, KernelError> {
    let mut builder = GlobSetBuilder::new();
    for pattern in patterns {
        let glob = Glob::new(pattern).map_err(|err| {
            KernelError::Configuration(format!("invalid path pattern {pattern:?}: {err}"))
        })?;
        builder.add(glob);
    }
    builder
        .build()
        .map_err(|err| KernelError::Configuration(format!("failed to build path patterns: {err}")))
}

fn normalize_path(path: &str) -> Option<&str> {
    let trimmed = path.trim().trim_start_matches("./");
    if trimmed.is_empty()
        || trimmed.starts_with('/')
        || trimmed.split('/').any(|segment| segment == "..")
    {
        return None;
    }
    Some(trimmed)
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct AccessDecision {
    pub allowed: bool,
    pub tier: Tier,
    pub reason: String,
}

/// Decides whether an agent at `tier` may perform `operation` on `path`.
///
/// # Errors
/// Returns [`KernelError::Configuration`] when the allowlist holds an
/// invalid glob.
pub fn evaluate_access(
    tier: Tier,
    operation: Operation,
    path: Option<&str>,
    allowlist: &[String],
    rules: &PathRules,
) -> Result<AccessDecision, KernelError> {
    let deny = |reason: String| AccessDecision {
        allowed: false,
        tier,
        reason,
    };

    if let Some(path) = path {
        if rules.is_forbidden(path) {
            return Ok(deny(format!("denied.forbidden_path: {path}")));
        }
    }

    if tier < operation.minimum_tier() {
        return Ok(deny(format!(
            "denied.tier_insufficient: {} requires {}, agent holds {tier}",
            operation.as_str(),
            operation.minimum_tier()
        )));
    }

    if operation == Operation::Edit {
        let Some(path) = path else {
            return Ok(deny("denied.edit_requires_path".to_string()));
        };
        if tier == Tier::EditRestricted && !allowlist_matches(allowlist, path)? {
            return Ok(deny(format!("denied.outside_allowlist: {path}")));
        }
    }

    Ok(AccessDecision {
        allowed: true,
        tier,
        reason: format!("allowed.{}", tier.as_str()),
    })
}

#[cfg(test)]
mod tests {
    use proptest::prelude::*;

    use super::*;
    use crate::parse_rfc3339_utc;

    fn as_of() -> OffsetDateTime {
        match parse_rfc3339_utc("2026-04-01T00:00:00Z") {
            Ok(value) => value,
            Err(err) => panic!("fixture timestamp: {err}"),
        }
    }

    fn rules() -> PathRules {
        match PathRules::compile(&LadderConfig::v1().forbidden_patterns) {
            Ok(rules) => rules,
            Err(err) => panic!("default patterns must compile: {err}"),
        }
    }

    #[test]
    fn default_ladder_validates() {
        assert!(LadderConfig::v1().validate().is_ok());
    }

    #[test]
    fn new_agent_cannot_jump_to_edit_restricted() {
        let gate = evaluate_promotion(
            &LadderConfig::v1(),
            &PromotionEvidence {
                current_tier: Tier::ReadOnly,
                requested_tier: Tier::EditRestricted,
                confidence: 0.5,
                executions: 0,
                human_validations: 0,
                locked: false,
                cooldown_until: None,
                as_of: as_of(),
            },
        );

        assert!(!gate.eligible);
        assert!(gate
            .reasons
            .iter()
            .any(|reason| reason.starts_with("denied.confidence_below_threshold: 0.50 < 0.85")));
        assert!(gate
            .reasons
            .iter()
            .any(|reason| reason.starts_with("denied.one_rung_at_a_time")));
        assert!(matches!(
            gate.into_result(),
            Err(KernelError::PolicyGate(_))
        ));
    }

    #[test]
    fn promotion_passes_when_every_gate_holds() {
        let gate = evaluate_promotion(
            &LadderConfig::v1(),
            &PromotionEvidence {
                current_tier: Tier::ReadOnly,
                requested_tier: Tier::MetricsWrite,
                confidence: 0.91,
                executions: 20,
                human_validations: 0,
                locked: false,
                cooldown_until: Some(as_of() - Duration::hours(1)),
                as_of: as_of(),
            },
        );
        assert!(gate.eligible, "{:?}", gate.reasons);
    }

    #[test]
    fn active_cooldown_and_lock_block_promotion() {
        let gate = evaluate_promotion(
            &LadderConfig::v1(),
            &PromotionEvidence {
                current_tier: Tier::ReadOnly,
                requested_tier: Tier::MetricsWrite,
                confidence: 0.99,
                executions: 200,
                human_validations: 20,
                locked: true,
                cooldown_until: Some(as_of() + Duration::hours(3)),
                as_of: as_of(),
            },
        );
        assert_eq!(gate.reasons.len(), 2);
    }

    #[test]
    fn downgrade_only_below_threshold() {
        let config = LadderConfig::v1();
        assert_eq!(config.downgrade_target(Tier::EditRestricted, 0.80), None);
        assert_eq!(
            config.downgrade_target(Tier::EditRestricted, 0.74),
            Some(Tier::MetricsWrite)
        );
        assert_eq!(config.downgrade_target(Tier::ReadOnly, 0.0), None);
    }

    #[test]
    fn validate_rejects_inverted_hysteresis() {
        let mut config = LadderConfig::v1();
        config.tiers[1].downgrade_threshold = 0.90;
        assert!(matches!(
            config.validate(),
            Err(KernelError::Configuration(_))
        ));
    }

    #[test]
    fn reapproval_requires_recent_success_and_human_for_lock() {
        let config = LadderConfig::v1();
        let mut evidence = ReapprovalEvidence {
            tier: Tier::MetricsWrite,
            confidence: 0.80,
            recent_executions: 10,
            recent_successes: 9,
            granted_by: "ops@example.com".to_string(),
            locked: true,
        };
        assert!(evaluate_reapproval(&config, &evidence).eligible);

        evidence.granted_by = "system.ladder".to_string();
        assert!(!evaluate_reapproval(&config, &evidence).eligible);

        evidence.granted_by = "ops@example.com".to_string();
        evidence.recent_executions = 0;
        evidence.recent_successes = 0;
        assert!(!evaluate_reapproval(&config, &evidence).eligible);
    }

    #[test]
    fn forbidden_paths_deny_even_unrestricted_edits() {
        let decision = evaluate_access(
            Tier::EditUnrestricted,
            Operation::Edit,
            Some("config/.env"),
            &[],
            &rules(),
        );
        assert!(matches!(decision, Ok(ref d) if !d.allowed));

        let escape = evaluate_access(
            Tier::EditUnrestricted,
            Operation::Edit,
            Some("../outside.txt"),
            &[],
            &rules(),
        );
        assert!(matches!(escape, Ok(ref d) if !d.allowed));
    }

    #[test]
    fn restricted_edit_needs_allowlist_match_and_a_path() {
        let allowlist = vec!["docs/**".to_string()];
        let inside = evaluate_access(
            Tier::EditRestricted,
            Operation::Edit,
            Some("docs/guide.md"),
            &allowlist,
            &rules(),
        );
        assert!(matches!(inside, Ok(ref d) if d.allowed));

        let outside = evaluate_access(
            Tier::EditRestricted,
            Operation::Edit,
            Some("app/handler.rs"),
            &allowlist,
            &rules(),
        );
        assert!(matches!(outside, Ok(ref d) if !d.allowed));

        let no_path = evaluate_access(Tier::EditRestricted, Operation::Edit, None, &allowlist, &rules());
        assert!(matches!(no_path, Ok(ref d) if d.reason == "denied.edit_requires_path"));
    }

    #[test]
    fn metrics_write_needs_metrics_tier() {
        let read_only =
            evaluate_access(Tier::ReadOnly, Operation::WriteMetrics, None, &[], &rules());
        assert!(matches!(read_only, Ok(ref d) if !d.allowed));
        let metrics =
            evaluate_access(Tier::MetricsWrite, Operation::WriteMetrics, None, &[], &rules());
        assert!(matches!(metrics, Ok(ref d) if d.allowed));
    }

    proptest! {
        #![proptest_config(ProptestConfig::with_cases(48))]

        #[test]
        fn validated_ladders_keep_hysteresis(
            promote in 0.05_f64..1.0,
            gap in 0.0_f64..0.2,
        ) {
            let mut config = LadderConfig::v1();
            config.tiers[0].promotion_threshold = promote.min(config.tiers[1].promotion_threshold);
            config.tiers[0].downgrade_threshold = (promote - gap).max(0.0);
            if config.validate().is_ok() {
                for policy in &config.tiers {
                    prop_assert!(policy.downgrade_threshold < policy.promotion_threshold);
                }
            }
        }
    }
}
