use std::sync::Arc;

use anyhow::Result;
use serde::{Deserialize, Serialize};
use skill_kernel_core::{
    current_tier, evaluate_access, evaluate_promotion, evaluate_reapproval, is_system_actor,
    AccessDecision, ConfidenceEventInput, ConfidenceEventKind, KernelError, LadderConfig,
    Operation, PathRules, PermissionEventKind, PermissionRecord, PermissionRecordInput,
    PromotionEvidence, ReapprovalEvidence, Tier,
};
use skill_kernel_store_sqlite::ConfidenceSnapshot;
use time::OffsetDateTime;

use crate::confidence::{ConfidenceTracker, ConfidenceUpdate};
use crate::{with_store, SharedStore};

pub const DOWNGRADE_ACTOR: &str = "system.confidence";
pub const SEVERE_EVENT_ACTOR: &str = "system.severe_event";

/// Permission facts derived from an agent's event log at one instant.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct PermissionState {
    pub agent: String,
    pub tier: Tier,
    pub locked: bool,
    pub cooldown_until: Option<OffsetDateTime>,
    pub allowlist: Vec<String>,
    pub latest: Option<PermissionRecord>,
}

impl PermissionState {
    #[must_use]
    pub fn cooldown_active(&self, as_of: OffsetDateTime) -> bool {
        self.cooldown_until.is_some_and(|until| as_of < until)
    }
}

/// Folds the ordered event log into tier, lock and cooldown state.
///
/// A revoke locks the agent until a later re-approval by a human. A
/// downgrade or revoke opens a cooldown that only a later re-approval
/// waives early. An expired grant leaves the agent at read-only.
#[must_use]
pub fn derive_permission_state(
    agent: &str,
    records: &[PermissionRecord],
    ladder: &LadderConfig,
    as_of: OffsetDateTime,
) -> PermissionState {
    let latest = records.last().cloned();
    let tier = current_tier(latest.as_ref(), as_of);

    let last_revoke = records
        .iter()
        .rposition(|record| record.event_kind == PermissionEventKind::Revoke);
    let last_human_reapproval = records.iter().rposition(|record| {
        record.event_kind == PermissionEventKind::Reapproval && !is_system_actor(&record.granted_by)
    });
    let locked = match (last_revoke, last_human_reapproval) {
        (Some(revoke), Some(reapproval)) => revoke > reapproval,
        (Some(_), None) => true,
        (None, _) => false,
    };

    let last_restrictive = records.iter().rposition(|record| {
        matches!(
            record.event_kind,
            PermissionEventKind::Downgrade | PermissionEventKind::Revoke
        )
    });
    let cooldown_until = last_restrictive.and_then(|idx| {
        let waived = records[idx + 1..]
            .iter()
            .any(|record| record.event_kind == PermissionEventKind::Reapproval);
        (!waived).then(|| records[idx].granted_at + ladder.cooldown())
    });

    let allowlist = match &latest {
        Some(record) if tier != Tier::ReadOnly => record.allowlist.clone(),
        _ => Vec::new(),
    };

    PermissionState {
        agent: agent.to_string(),
        tier,
        locked,
        cooldown_until,
        allowlist,
        latest,
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct AgentAudit {
    pub agent: String,
    pub current_tier: Tier,
    pub confidence: f64,
    pub locked: bool,
    pub cooldown_until: Option<OffsetDateTime>,
    pub history: Vec<PermissionRecord>,
    pub promotions: usize,
    pub downgrades: usize,
    pub revocations: usize,
    pub reapprovals: usize,
    pub confidence_trajectory: Vec<ConfidenceSnapshot>,
    pub chain_valid: bool,
}

#[derive(Clone)]
pub struct PermissionManager {
    store: SharedStore,
    ladder: Arc<LadderConfig>,
    rules: Arc<PathRules>,
    tracker: ConfidenceTracker,
}

impl PermissionManager {
    /// # Errors
    /// Returns [`KernelError::Configuration`] when the ladder is invalid or
    /// a forbidden pattern does not compile.
    pub fn new(
        store: SharedStore,
        ladder: LadderConfig,
        tracker: ConfidenceTracker,
    ) -> Result<Self, KernelError> {
        ladder.validate()?;
        let rules = PathRules::compile(&ladder.forbidden_patterns)?;
        Ok(Self {
            store,
            ladder: Arc::new(ladder),
            rules: Arc::new(rules),
            tracker,
        })
    }

    #[must_use]
    pub fn ladder(&self) -> &LadderConfig {
        &self.ladder
    }

    /// # Errors
    /// Returns an error when the store fails.
    pub fn state(&self, agent: &str, as_of: OffsetDateTime) -> Result<PermissionState> {
        let records = with_store(&self.store, |store| store.list_permission_events(agent, None))?;
        Ok(derive_permission_state(agent, &records, &self.ladder, as_of))
    }

    /// Decides one access request. Edit requests always re-evaluate
    /// confidence from the log first; other operations tolerate a cached
    /// score. Either way a downgrade the log has not caught up with yet is
    /// applied before deciding.
    ///
    /// # Errors
    /// Returns an error when the store fails or an allowlist glob is invalid.
    pub fn check_permission(
        &self,
        agent: &str,
        operation: Operation,
        path: Option<&str>,
        as_of: OffsetDateTime,
    ) -> Result<AccessDecision> {
        let confidence = if operation == Operation::Edit {
            self.tracker.confidence(agent, as_of)?.confidence
        } else {
            self.tracker.cached_confidence(agent, as_of)?
        };
        self.apply_pending_downgrade(agent, confidence, as_of)?;

        let state = self.state(agent, as_of)?;
        let decision = evaluate_access(state.tier, operation, path, &state.allowlist, &self.rules)?;
        if !decision.allowed {
            tracing::info!(
                agent,
                operation = operation.as_str(),
                path = path.unwrap_or(""),
                reason = %decision.reason,
                "permission denied"
            );
        }
        Ok(decision)
    }

    /// Grants exactly one rung up when every gate passes.
    ///
    /// # Errors
    /// Returns [`KernelError::PolicyGate`] listing every failing gate, or an
    /// error when the store fails.
    pub fn request_promotion(
        &self,
        agent: &str,
        requested_tier: Tier,
        granted_by: &str,
        allowlist: Vec<String>,
        as_of: OffsetDateTime,
    ) -> Result<PermissionRecord> {
        let state = self.state(agent, as_of)?;
        let confidence = self.tracker.confidence(agent, as_of)?.confidence;
        let (executions, human_validations) = with_store(&self.store, |store| {
            let stats = store.agent_execution_stats(agent, None)?;
            let approvals =
                store.count_confidence_events(agent, ConfidenceEventKind::HumanApproval)?;
            Ok((stats.executions, approvals))
        })?;

        let gate = evaluate_promotion(
            &self.ladder,
            &PromotionEvidence {
                current_tier: state.tier,
                requested_tier,
                confidence,
                executions,
                human_validations,
                locked: state.locked,
                cooldown_until: state.cooldown_until,
                as_of,
            },
        );
        if !gate.eligible {
            tracing::info!(
                agent,
                requested_tier = requested_tier.as_str(),
                reasons = %gate.reasons.join("; "),
                "promotion denied"
            );
        }
        gate.into_result()?;

        let allowlist = if allowlist.is_empty() {
            state.allowlist
        } else {
            allowlist
        };
        let record = self.append(&PermissionRecordInput {
            agent: agent.to_string(),
            event_kind: PermissionEventKind::Grant,
            tier_from: state.tier,
            tier: requested_tier,
            granted_at: as_of,
            granted_by: granted_by.to_string(),
            expires_at: Some(as_of + self.ladder.grant_ttl()),
            confidence_at_grant: confidence,
            allowlist,
            evidence: format!(
                "promotion {} -> {}: confidence {confidence:.2}, executions {executions}, human validations {human_validations}",
                state.tier, requested_tier
            ),
        })?;
        tracing::info!(
            agent,
            tier_from = state.tier.as_str(),
            tier = requested_tier.as_str(),
            confidence,
            "permission granted"
        );
        Ok(record)
    }

    /// Waives an open cooldown at the current tier. When granted by a human
    /// it also lifts a hard lock.
    ///
    /// # Errors
    /// Returns [`KernelError::PolicyGate`] when confidence has not recovered,
    /// recent success is too low or missing, or a system actor tries to lift
    /// a lock.
    pub fn reapprove(
        &self,
        agent: &str,
        granted_by: &str,
        as_of: OffsetDateTime,
    ) -> Result<PermissionRecord> {
        let state = self.state(agent, as_of)?;
        let confidence = self.tracker.confidence(agent, as_of)?.confidence;
        let since = as_of - self.ladder.reapproval_window();
        let recent =
            with_store(&self.store, |store| store.agent_execution_stats(agent, Some(since)))?;
        let recent_executions = u32::try_from(recent.executions).unwrap_or(u32::MAX);
        let recent_successes = u32::try_from(recent.learning_successes).unwrap_or(u32::MAX);

        evaluate_reapproval(
            &self.ladder,
            &ReapprovalEvidence {
                tier: state.tier,
                confidence,
                recent_executions,
                recent_successes,
                granted_by: granted_by.to_string(),
                locked: state.locked,
            },
        )
        .into_result()?;

        let record = self.append(&PermissionRecordInput {
            agent: agent.to_string(),
            event_kind: PermissionEventKind::Reapproval,
            tier_from: state.tier,
            tier: state.tier,
            granted_at: as_of,
            granted_by: granted_by.to_string(),
            expires_at: self.expiry_for(state.tier, as_of),
            confidence_at_grant: confidence,
            allowlist: state.allowlist,
            evidence: format!(
                "reapproval at {}: confidence {confidence:.2}, recent success {recent_successes}/{recent_executions}",
                state.tier
            ),
        })?;
        tracing::info!(agent, tier = state.tier.as_str(), granted_by, "permission re-approved");
        Ok(record)
    }

    /// Drops the agent straight to read-only and engages the hard lock.
    ///
    /// # Errors
    /// Returns an error when `reason` is empty or the store fails.
    pub fn emergency_revoke(
        &self,
        agent: &str,
        granted_by: &str,
        reason: &str,
        as_of: OffsetDateTime,
    ) -> Result<PermissionRecord> {
        let state = self.state(agent, as_of)?;
        let confidence = self.tracker.confidence(agent, as_of)?.confidence;
        let record = self.append(&PermissionRecordInput {
            agent: agent.to_string(),
            event_kind: PermissionEventKind::Revoke,
            tier_from: state.tier,
            tier: Tier::ReadOnly,
            granted_at: as_of,
            granted_by: granted_by.to_string(),
            expires_at: None,
            confidence_at_grant: confidence,
            allowlist: Vec::new(),
            evidence: reason.to_string(),
        })?;
        tracing::warn!(
            agent,
            tier_from = state.tier.as_str(),
            granted_by,
            reason,
            "permission revoked, agent locked"
        );
        Ok(record)
    }

    /// Steps the agent down one rung when `confidence` is below its tier's
    /// downgrade threshold. Returns `None` when the tier holds.
    ///
    /// # Errors
    /// Returns an error when the store fails.
    pub fn apply_downgrade(
        &self,
        agent: &str,
        confidence: f64,
        as_of: OffsetDateTime,
    ) -> Result<Option<PermissionRecord>> {
        let state = self.state(agent, as_of)?;
        self.downgrade_from(&state, confidence, as_of)
    }

    /// Like [`Self::apply_downgrade`], but a no-op once the latest record is
    /// already a downgrade or revoke. Further steps down need new evidence
    /// through [`Self::reconcile`].
    fn apply_pending_downgrade(
        &self,
        agent: &str,
        confidence: f64,
        as_of: OffsetDateTime,
    ) -> Result<Option<PermissionRecord>> {
        let state = self.state(agent, as_of)?;
        let already_restricted = state.latest.as_ref().is_some_and(|record| {
            matches!(
                record.event_kind,
                PermissionEventKind::Downgrade | PermissionEventKind::Revoke
            )
        });
        if already_restricted {
            return Ok(None);
        }
        self.downgrade_from(&state, confidence, as_of)
    }

    fn downgrade_from(
        &self,
        state: &PermissionState,
        confidence: f64,
        as_of: OffsetDateTime,
    ) -> Result<Option<PermissionRecord>> {
        let agent = state.agent.as_str();
        let Some(target) = self.ladder.downgrade_target(state.tier, confidence) else {
            return Ok(None);
        };
        let threshold = self
            .ladder
            .policy_for(state.tier)
            .map_or(0.0, |policy| policy.downgrade_threshold);

        let record = self.append(&PermissionRecordInput {
            agent: agent.to_string(),
            event_kind: PermissionEventKind::Downgrade,
            tier_from: state.tier,
            tier: target,
            granted_at: as_of,
            granted_by: DOWNGRADE_ACTOR.to_string(),
            expires_at: self.expiry_for(target, as_of),
            confidence_at_grant: confidence.clamp(0.0, 1.0),
            allowlist: state.allowlist.clone(),
            evidence: format!(
                "confidence {confidence:.2} < downgrade threshold {threshold:.2} for {}",
                state.tier
            ),
        })?;
        tracing::warn!(
            agent,
            tier_from = state.tier.as_str(),
            tier = target.as_str(),
            confidence,
            "permission downgraded"
        );
        Ok(Some(record))
    }

    /// Re-checks permissions after a confidence update: severe events revoke,
    /// a score under the downgrade threshold steps down one rung.
    ///
    /// # Errors
    /// Returns an error when the store fails.
    pub fn reconcile(
        &self,
        update: &ConfidenceUpdate,
        as_of: OffsetDateTime,
    ) -> Result<Option<PermissionRecord>> {
        if update.kind.is_severe() && update.event.is_some() {
            let reason = format!(
                "severe event {}: {}",
                update.kind.as_str(),
                update.snapshot.reason
            );
            return self
                .emergency_revoke(&update.agent, SEVERE_EVENT_ACTOR, &reason, as_of)
                .map(Some);
        }
        self.apply_downgrade(&update.agent, update.breakdown.confidence, as_of)
    }

    /// Records an out-of-band signal (approval, rollback, security issue...)
    /// and reconciles permissions.
    ///
    /// # Errors
    /// Returns an error when the signal is invalid or the store fails.
    pub fn record_signal(
        &self,
        agent: &str,
        kind: ConfidenceEventKind,
        evidence: &str,
        as_of: OffsetDateTime,
    ) -> Result<(ConfidenceUpdate, Option<PermissionRecord>)> {
        let update = self
            .tracker
            .record(&ConfidenceEventInput::signal(agent, kind, as_of, evidence), as_of)?;
        let change = self.reconcile(&update, as_of)?;
        Ok((update, change))
    }

    /// # Errors
    /// Returns an error when the store fails.
    pub fn audit_agent(
        &self,
        agent: &str,
        since: Option<OffsetDateTime>,
        as_of: OffsetDateTime,
    ) -> Result<AgentAudit> {
        let state = self.state(agent, as_of)?;
        let confidence = self.tracker.confidence(agent, as_of)?.confidence;
        let (history, confidence_trajectory, verification) = with_store(&self.store, |store| {
            Ok((
                store.list_permission_events(agent, since)?,
                store.list_confidence_snapshots(agent, since)?,
                store.verify_permission_chain(Some(agent))?,
            ))
        })?;

        let count = |kind: PermissionEventKind| {
            history
                .iter()
                .filter(|record| record.event_kind == kind)
                .count()
        };

        Ok(AgentAudit {
            agent: agent.to_string(),
            current_tier: state.tier,
            confidence,
            locked: state.locked,
            cooldown_until: state.cooldown_until,
            promotions: count(PermissionEventKind::Grant),
            downgrades: count(PermissionEventKind::Downgrade),
            revocations: count(PermissionEventKind::Revoke),
            reapprovals: count(PermissionEventKind::Reapproval),
            history,
            confidence_trajectory,
            chain_valid: verification.valid,
        })
    }

    fn expiry_for(&self, tier: Tier, as_of: OffsetDateTime) -> Option<OffsetDateTime> {
        (tier != Tier::ReadOnly).then(|| as_of + self.ladder.grant_ttl())
    }

    fn append(&self, input: &PermissionRecordInput) -> Result<PermissionRecord> {
        with_store(&self.store, |store| store.append_permission_event(input))
    }
}
