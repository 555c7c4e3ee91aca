//! Pure domain model for the skill kernel: execution records, permission
//! tiers, variations and A/B assignments, retrieval events, skill edges and
//! the confidence event stream.
//!
//! Nothing in this crate performs IO. Persistence lives in
//! `skill-kernel-store-sqlite`; orchestration in `skill-kernel-orchestrator`.

use std::fmt::{Display, Formatter};

use serde::{Deserialize, Serialize};
use serde_json::Value;
use sha2::{Digest, Sha256};
use time::{Duration, OffsetDateTime, UtcOffset};
use ulid::Ulid;

pub mod confidence;
pub mod config;
pub mod experiment;
pub mod ladder;
pub mod retrieval;

pub use confidence::{compute_confidence, ConfidenceBreakdown, ConfidenceRuleset};
pub use config::KernelConfig;
pub use experiment::{evaluate_assignment, ExperimentConfig, ExperimentVerdict};
pub use ladder::{
    allowlist_matches, current_tier, evaluate_access, evaluate_promotion, evaluate_reapproval,
    is_system_actor, AccessDecision, LadderConfig, PathRules, PromotionEvidence, PromotionGate,
    ReapprovalEvidence, TierPolicy,
};
pub use retrieval::{
    build_retrieval_query, score_relevance, RetrievalConfig, RETRIEVED_CONTEXT_KEY,
};

/// Fidelity at or above which an execution counts as a success for learning.
pub const LEARNING_SUCCESS_FIDELITY: f64 = 0.90;

#[derive(Debug, Clone, thiserror::Error, PartialEq)]
pub enum KernelError {
    #[error("skill execution error: {0}")]
    SkillExecution(String),
    #[error("permission denied: {0}")]
    PermissionDenied(String),
    #[error("policy gate failed: {0}")]
    PolicyGate(String),
    #[error("integrity violation: {0}")]
    IntegrityViolation(String),
    #[error("validation error: {0}")]
    Validation(String),
    #[error("configuration error: {0}")]
    Configuration(String),
}

macro_rules! ulid_id {
    ($name:ident) => {
        #[derive(Debug, Clone, Copy, Serialize, Deserialize, Eq, PartialEq, Ord, PartialOrd, Hash)]
        pub struct $name(pub Ulid);

        impl $name {
            #[must_use]
            pub fn new() -> Self {
                Self(Ulid::new())
            }
        }

        impl Default for $name {
            fn default() -> Self {
                Self::new()
            }
        }

        impl Display for $name {
            fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
                write!(f, "{}", self.0)
            }
        }
    };
}

ulid_id!(RunId);
ulid_id!(ExecutionId);
ulid_id!(VariationId);
ulid_id!(AssignmentId);

/// One rung of the permission ladder, lowest first.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, Eq, PartialEq, Ord, PartialOrd, Hash)]
#[serde(rename_all = "snake_case")]
pub enum Tier {
    ReadOnly,
    MetricsWrite,
    EditRestricted,
    EditUnrestricted,
}

impl Tier {
    pub const LADDER: [Tier; 4] = [
        Tier::ReadOnly,
        Tier::MetricsWrite,
        Tier::EditRestricted,
        Tier::EditUnrestricted,
    ];

    #[must_use]
    pub fn as_str(self) -> &'static str {
        match self {
            Self::ReadOnly => "read_only",
            Self::MetricsWrite => "metrics_write",
            Self::EditRestricted => "edit_restricted",
            Self::EditUnrestricted => "edit_unrestricted",
        }
    }

    #[must_use]
    pub fn parse(value: &str) -> Option<Self> {
        match value {
            "read_only" => Some(Self::ReadOnly),
            "metrics_write" => Some(Self::MetricsWrite),
            "edit_restricted" => Some(Self::EditRestricted),
            "edit_unrestricted" => Some(Self::EditUnrestricted),
            _ => None,
        }
    }

    #[must_use]
    pub fn rank(self) -> u8 {
        match self {
            Self::ReadOnly => 0,
            Self::MetricsWrite => 1,
            Self::EditRestricted => 2,
            Self::EditUnrestricted => 3,
        }
    }

    #[must_use]
    pub fn next(self) -> Option<Self> {
        match self {
            Self::ReadOnly => Some(Self::MetricsWrite),
            Self::MetricsWrite => Some(Self::EditRestricted),
            Self::EditRestricted => Some(Self::EditUnrestricted),
            Self::EditUnrestricted => None,
        }
    }

    #[must_use]
    pub fn previous(self) -> Option<Self> {
        match self {
            Self::ReadOnly => None,
            Self::MetricsWrite => Some(Self::ReadOnly),
            Self::EditRestricted => Some(Self::MetricsWrite),
            Self::EditUnrestricted => Some(Self::EditRestricted),
        }
    }

    #[must_use]
    pub fn is_edit(self) -> bool {
        matches!(self, Self::EditRestricted | Self::EditUnrestricted)
    }
}

impl Display for Tier {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize, Eq, PartialEq, Hash)]
#[serde(rename_all = "snake_case")]
pub enum Operation {
    Read,
    WriteMetrics,
    Edit,
}

impl Operation {
    #[must_use]
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Read => "read",
            Self::WriteMetrics => "write_metrics",
            Self::Edit => "edit",
        }
    }

    #[must_use]
    pub fn parse(value: &str) -> Option<Self> {
        match value {
            "read" => Some(Self::Read),
            "write_metrics" => Some(Self::WriteMetrics),
            "edit" => Some(Self::Edit),
            _ => None,
        }
    }

    /// Lowest tier that may perform the operation at all.
    #[must_use]
    pub fn minimum_tier(self) -> Tier {
        match self {
            Self::Read => Tier::ReadOnly,
            Self::WriteMetrics => Tier::MetricsWrite,
            Self::Edit => Tier::EditRestricted,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct ExecutionOutcome {
    pub success: bool,
    pub fidelity: f64,
    #[serde(default)]
    pub output: Value,
    pub error: Option<String>,
}

impl ExecutionOutcome {
    #[must_use]
    pub fn failed(error: impl Into<String>) -> Self {
        Self {
            success: false,
            fidelity: 0.0,
            output: Value::Null,
            error: Some(error.into()),
        }
    }

    #[must_use]
    pub fn is_learning_success(&self) -> bool {
        self.success && self.fidelity >= LEARNING_SUCCESS_FIDELITY
    }

    /// Validates the outcome before it is sealed into an execution record.
    ///
    /// # Errors
    /// Returns [`KernelError::Validation`] when fidelity is outside `[0, 1]`
    /// or not finite.
    pub fn validate(&self) -> Result<(), KernelError> {
        if !self.fidelity.is_finite() || !(0.0..=1.0).contains(&self.fidelity) {
            return Err(KernelError::Validation(format!(
                "fidelity MUST be in [0.0, 1.0], got {}",
                self.fidelity
            )));
        }
        Ok(())
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct ExecutionRecord {
    pub execution_id: ExecutionId,
    pub run_id: RunId,
    pub iteration: u32,
    pub skill: String,
    pub agent: String,
    pub started_at: OffsetDateTime,
    pub input_snapshot: Value,
    pub variation_id: Option<VariationId>,
    pub outcome: ExecutionOutcome,
    pub duration_ms: u64,
}

impl ExecutionRecord {
    /// Validates a record prior to sealing.
    ///
    /// # Errors
    /// Returns [`KernelError::Validation`] for empty identifiers, a zero
    /// iteration, a non-UTC start time or an invalid outcome.
    pub fn validate(&self) -> Result<(), KernelError> {
        ensure_non_empty("skill", &self.skill)?;
        ensure_non_empty("agent", &self.agent)?;
        if self.iteration == 0 {
            return Err(KernelError::Validation(
                "iteration MUST be >= 1".to_string(),
            ));
        }
        ensure_utc("started_at", self.started_at)?;
        self.outcome.validate()
    }
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize, Eq, PartialEq, Hash)]
#[serde(rename_all = "snake_case")]
pub enum VariationStatus {
    Pending,
    Testing,
    Promoted,
    Archived,
}

impl VariationStatus {
    #[must_use]
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Pending => "pending",
            Self::Testing => "testing",
            Self::Promoted => "promoted",
            Self::Archived => "archived",
        }
    }

    #[must_use]
    pub fn parse(value: &str) -> Option<Self> {
        match value {
            "pending" => Some(Self::Pending),
            "testing" => Some(Self::Testing),
            "promoted" => Some(Self::Promoted),
            "archived" => Some(Self::Archived),
            _ => None,
        }
    }

    /// Whether the lifecycle permits moving from `self` to `next`.
    #[must_use]
    pub fn can_transition_to(self, next: Self) -> bool {
        matches!(
            (self, next),
            (Self::Pending, Self::Testing | Self::Archived)
                | (Self::Testing, Self::Promoted | Self::Archived)
                | (Self::Promoted, Self::Archived)
        )
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct Variation {
    pub variation_id: VariationId,
    pub skill: String,
    pub content: Value,
    pub created_at: OffsetDateTime,
    pub promoted: bool,
    pub status: VariationStatus,
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize, Eq, PartialEq, Hash)]
#[serde(rename_all = "snake_case")]
pub enum Arm {
    Control,
    Treatment,
}

impl Arm {
    #[must_use]
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Control => "control",
            Self::Treatment => "treatment",
        }
    }

    #[must_use]
    pub fn parse(value: &str) -> Option<Self> {
        match value {
            "control" => Some(Self::Control),
            "treatment" => Some(Self::Treatment),
            _ => None,
        }
    }
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize, Eq, PartialEq, Hash)]
#[serde(rename_all = "snake_case")]
pub enum AssignmentStatus {
    Running,
    Concluded,
}

impl AssignmentStatus {
    #[must_use]
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Running => "running",
            Self::Concluded => "concluded",
        }
    }

    #[must_use]
    pub fn parse(value: &str) -> Option<Self> {
        match value {
            "running" => Some(Self::Running),
            "concluded" => Some(Self::Concluded),
            _ => None,
        }
    }
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize, Eq, PartialEq, Hash)]
#[serde(rename_all = "snake_case")]
pub enum AssignmentDecision {
    PromotedTreatment,
    ArchivedTreatment,
    CeilingReached,
}

impl AssignmentDecision {
    #[must_use]
    pub fn as_str(self) -> &'static str {
        match self {
            Self::PromotedTreatment => "promoted_treatment",
            Self::ArchivedTreatment => "archived_treatment",
            Self::CeilingReached => "ceiling_reached",
        }
    }

    #[must_use]
    pub fn parse(value: &str) -> Option<Self> {
        match value {
            "promoted_treatment" => Some(Self::PromotedTreatment),
            "archived_treatment" => Some(Self::ArchivedTreatment),
            "ceiling_reached" => Some(Self::CeilingReached),
            _ => None,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct AbAssignment {
    pub assignment_id: AssignmentId,
    pub skill: String,
    pub control_variation: VariationId,
    pub treatment_variation: VariationId,
    pub started_at: OffsetDateTime,
    pub ended_at: Option<OffsetDateTime>,
    pub status: AssignmentStatus,
    pub decision: Option<AssignmentDecision>,
    pub control_trials: u32,
    pub control_successes: u32,
    pub treatment_trials: u32,
    pub treatment_successes: u32,
    pub sample_target: u32,
    pub max_trials_per_arm: u32,
    pub deadline: OffsetDateTime,
}

impl AbAssignment {
    #[must_use]
    pub fn trials_total(&self) -> u32 {
        self.control_trials.saturating_add(self.treatment_trials)
    }

    #[must_use]
    pub fn control_rate(&self) -> f64 {
        success_rate(self.control_successes, self.control_trials)
    }

    #[must_use]
    pub fn treatment_rate(&self) -> f64 {
        success_rate(self.treatment_successes, self.treatment_trials)
    }

    #[must_use]
    pub fn margin(&self) -> f64 {
        self.treatment_rate() - self.control_rate()
    }

    #[must_use]
    pub fn variation_for(&self, arm: Arm) -> VariationId {
        match arm {
            Arm::Control => self.control_variation,
            Arm::Treatment => self.treatment_variation,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct RetrievalEvent {
    pub retrieval_id: Ulid,
    pub execution_id: ExecutionId,
    pub skill: String,
    pub query: String,
    pub result_count: u32,
    pub relevance: f64,
    pub latency_ms: u64,
    pub used: bool,
    pub recorded_at: OffsetDateTime,
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize, Eq, PartialEq, Ord, PartialOrd, Hash)]
#[serde(rename_all = "snake_case")]
pub enum EdgeType {
    CausedBy,
    ImprovedBy,
    SimilarTo,
    DependsOn,
}

impl EdgeType {
    #[must_use]
    pub fn as_str(self) -> &'static str {
        match self {
            Self::CausedBy => "caused_by",
            Self::ImprovedBy => "improved_by",
            Self::SimilarTo => "similar_to",
            Self::DependsOn => "depends_on",
        }
    }

    #[must_use]
    pub fn parse(value: &str) -> Option<Self> {
        match value {
            "caused_by" => Some(Self::CausedBy),
            "improved_by" => Some(Self::ImprovedBy),
            "similar_to" => Some(Self::SimilarTo),
            "depends_on" => Some(Self::DependsOn),
            _ => None,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct SkillEdge {
    pub edge_id: Ulid,
    pub source_skill: String,
    pub target_skill: String,
    pub edge_type: EdgeType,
    pub weight: f64,
    pub created_at: OffsetDateTime,
    pub evidence: String,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct SkillEdgeInput {
    pub source_skill: String,
    pub target_skill: String,
    pub edge_type: EdgeType,
    pub weight: f64,
    pub evidence: String,
}

impl SkillEdgeInput {
    /// Validates an edge before insert.
    ///
    /// # Errors
    /// Returns [`KernelError::Validation`] for empty endpoints, self-loops or
    /// a weight outside `[0, 1]`.
    pub fn validate(&self) -> Result<(), KernelError> {
        ensure_non_empty("source_skill", &self.source_skill)?;
        ensure_non_empty("target_skill", &self.target_skill)?;
        if self.source_skill == self.target_skill {
            return Err(KernelError::Validation(
                "skill edges MUST connect two distinct skills".to_string(),
            ));
        }
        if !self.weight.is_finite() || !(0.0..=1.0).contains(&self.weight) {
            return Err(KernelError::Validation(
                "edge weight MUST be in [0.0, 1.0]".to_string(),
            ));
        }
        Ok(())
    }
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize, Eq, PartialEq, Hash)]
#[serde(rename_all = "snake_case")]
pub enum PermissionEventKind {
    Grant,
    Downgrade,
    Revoke,
    Reapproval,
}

impl PermissionEventKind {
    #[must_use]
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Grant => "grant",
            Self::Downgrade => "downgrade",
            Self::Revoke => "revoke",
            Self::Reapproval => "reapproval",
        }
    }

    #[must_use]
    pub fn parse(value: &str) -> Option<Self> {
        match value {
            "grant" => Some(Self::Grant),
            "downgrade" => Some(Self::Downgrade),
            "revoke" => Some(Self::Revoke),
            "reapproval" => Some(Self::Reapproval),
            _ => None,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct PermissionRecord {
    pub event_seq: i64,
    pub event_id: Ulid,
    pub agent: String,
    pub event_kind: PermissionEventKind,
    pub tier_from: Tier,
    pub tier: Tier,
    pub granted_at: OffsetDateTime,
    pub granted_by: String,
    pub expires_at: Option<OffsetDateTime>,
    pub confidence_at_grant: f64,
    pub allowlist: Vec<String>,
    pub evidence: String,
    pub signature: String,
    pub prev_event_hash: Option<String>,
    pub event_hash: String,
}

impl PermissionRecord {
    #[must_use]
    pub fn is_expired(&self, as_of: OffsetDateTime) -> bool {
        self.expires_at.is_some_and(|expires_at| expires_at <= as_of)
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct PermissionRecordInput {
    pub agent: String,
    pub event_kind: PermissionEventKind,
    pub tier_from: Tier,
    pub tier: Tier,
    pub granted_at: OffsetDateTime,
    pub granted_by: String,
    pub expires_at: Option<OffsetDateTime>,
    pub confidence_at_grant: f64,
    pub allowlist: Vec<String>,
    pub evidence: String,
}

impl PermissionRecordInput {
    /// Validates a permission event before it is appended.
    ///
    /// # Errors
    /// Returns [`KernelError::Validation`] when fields are missing and
    /// [`KernelError::IntegrityViolation`] when the transition skips rungs
    /// (only `revoke` may jump straight down).
    pub fn validate(&self) -> Result<(), KernelError> {
        ensure_non_empty("agent", &self.agent)?;
        ensure_non_empty("granted_by", &self.granted_by)?;
        ensure_non_empty("evidence", &self.evidence)?;
        ensure_utc("granted_at", self.granted_at)?;
        if !(0.0..=1.0).contains(&self.confidence_at_grant) {
            return Err(KernelError::Validation(
                "confidence_at_grant MUST be in [0.0, 1.0]".to_string(),
            ));
        }

        let allowed = match self.event_kind {
            PermissionEventKind::Grant => self.tier_from.next() == Some(self.tier),
            PermissionEventKind::Downgrade => self.tier_from.previous() == Some(self.tier),
            PermissionEventKind::Revoke => self.tier <= self.tier_from,
            PermissionEventKind::Reapproval => self.tier == self.tier_from,
        };
        if !allowed {
            return Err(KernelError::IntegrityViolation(format!(
                "{} from {} to {} is not a single-rung transition",
                self.event_kind.as_str(),
                self.tier_from,
                self.tier
            )));
        }
        Ok(())
    }
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize, Eq, PartialEq, Ord, PartialOrd, Hash)]
#[serde(rename_all = "snake_case")]
pub enum ConfidenceEventKind {
    Execution,
    HumanApproval,
    Rollback,
    ContractViolation,
    Regression,
    SecurityIssue,
    ConfirmedDetection,
    FalsePositive,
}

impl ConfidenceEventKind {
    #[must_use]
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Execution => "execution",
            Self::HumanApproval => "human_approval",
            Self::Rollback => "rollback",
            Self::ContractViolation => "contract_violation",
            Self::Regression => "regression",
            Self::SecurityIssue => "security_issue",
            Self::ConfirmedDetection => "confirmed_detection",
            Self::FalsePositive => "false_positive",
        }
    }

    #[must_use]
    pub fn parse(value: &str) -> Option<Self> {
        match value {
            "execution" => Some(Self::Execution),
            "human_approval" => Some(Self::HumanApproval),
            "rollback" => Some(Self::Rollback),
            "contract_violation" => Some(Self::ContractViolation),
            "regression" => Some(Self::Regression),
            "security_issue" => Some(Self::SecurityIssue),
            "confirmed_detection" => Some(Self::ConfirmedDetection),
            "false_positive" => Some(Self::FalsePositive),
            _ => None,
        }
    }

    /// Success value carried by non-execution events; execution events take
    /// theirs from the observed outcome.
    #[must_use]
    pub fn implied_success(self) -> Option<bool> {
        match self {
            Self::Execution => None,
            Self::HumanApproval | Self::ConfirmedDetection => Some(true),
            Self::Rollback
            | Self::ContractViolation
            | Self::Regression
            | Self::SecurityIssue
            | Self::FalsePositive => Some(false),
        }
    }

    /// Signals that count toward the failure-burst multiplier.
    #[must_use]
    pub fn is_penalty(self) -> bool {
        self.implied_success() == Some(false)
    }

    #[must_use]
    pub fn is_severe(self) -> bool {
        matches!(self, Self::SecurityIssue)
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct ConfidenceEvent {
    pub event_seq: i64,
    pub event_id: Ulid,
    pub agent: String,
    pub skill: Option<String>,
    pub kind: ConfidenceEventKind,
    pub success: bool,
    pub fidelity: Option<f64>,
    pub occurred_at: OffsetDateTime,
    pub recorded_at: OffsetDateTime,
    pub execution_id: Option<ExecutionId>,
    pub evidence: String,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct ConfidenceEventInput {
    pub agent: String,
    pub skill: Option<String>,
    pub kind: ConfidenceEventKind,
    pub success: bool,
    pub fidelity: Option<f64>,
    pub occurred_at: OffsetDateTime,
    pub execution_id: Option<ExecutionId>,
    pub evidence: String,
}

impl ConfidenceEventInput {
    #[must_use]
    pub fn from_execution(record: &ExecutionRecord) -> Self {
        Self {
            agent: record.agent.clone(),
            skill: Some(record.skill.clone()),
            kind: ConfidenceEventKind::Execution,
            success: record.outcome.is_learning_success(),
            fidelity: Some(record.outcome.fidelity),
            occurred_at: record.started_at,
            execution_id: Some(record.execution_id),
            evidence: format!(
                "execution {} iteration {} fidelity {:.2}",
                record.execution_id, record.iteration, record.outcome.fidelity
            ),
        }
    }

    #[must_use]
    pub fn signal(
        agent: &str,
        kind: ConfidenceEventKind,
        occurred_at: OffsetDateTime,
        evidence: &str,
    ) -> Self {
        Self {
            agent: agent.to_string(),
            skill: None,
            kind,
            success: kind.implied_success().unwrap_or(false),
            fidelity: None,
            occurred_at,
            execution_id: None,
            evidence: evidence.to_string(),
        }
    }

    /// Validates a confidence event before append.
    ///
    /// # Errors
    /// Returns [`KernelError::Validation`] for missing agent/evidence,
    /// non-UTC timestamps, out-of-range fidelity, or a success flag that
    /// contradicts the event kind.
    pub fn validate(&self) -> Result<(), KernelError> {
        ensure_non_empty("agent", &self.agent)?;
        ensure_non_empty("evidence", &self.evidence)?;
        ensure_utc("occurred_at", self.occurred_at)?;

        if let Some(fidelity) = self.fidelity {
            if !fidelity.is_finite() || !(0.0..=1.0).contains(&fidelity) {
                return Err(KernelError::Validation(
                    "fidelity MUST be in [0.0, 1.0]".to_string(),
                ));
            }
        }

        if let Some(implied) = self.kind.implied_success() {
            if implied != self.success {
                return Err(KernelError::Validation(format!(
                    "{} events MUST carry success={implied}",
                    self.kind.as_str()
                )));
            }
        } else if self.execution_id.is_none() {
            return Err(KernelError::Validation(
                "execution events require execution_id".to_string(),
            ));
        }

        Ok(())
    }
}

/// Ensure a string field is non-empty after trimming.
///
/// # Errors
/// Returns [`KernelError::Validation`] when the value is empty or whitespace.
pub fn ensure_non_empty(field_name: &str, value: &str) -> Result<(), KernelError> {
    if value.trim().is_empty() {
        return Err(KernelError::Validation(format!(
            "{field_name} MUST be non-empty"
        )));
    }
    Ok(())
}

fn ensure_utc(field_name: &str, value: OffsetDateTime) -> Result<(), KernelError> {
    if value.offset() != UtcOffset::UTC {
        return Err(KernelError::Validation(format!(
            "{field_name} MUST be UTC (offset Z)"
        )));
    }
    Ok(())
}

#[must_use]
#[allow(clippy::cast_precision_loss)]
pub fn success_rate(successes: u32, trials: u32) -> f64 {
    if trials == 0 {
        return 0.0;
    }
    f64::from(successes) / f64::from(trials)
}

#[must_use]
pub fn hash_bytes(bytes: &[u8]) -> String {
    let mut hasher = Sha256::new();
    hasher.update(bytes);
    hex::encode(hasher.finalize())
}

/// Deterministic signature over `{agent, tier, granter, timestamp}`.
///
/// # Errors
/// Returns [`KernelError::Validation`] when the timestamp cannot be formatted.
pub fn permission_signature(
    agent: &str,
    tier: Tier,
    granted_by: &str,
    granted_at: OffsetDateTime,
) -> Result<String, KernelError> {
    let material = format!(
        "{agent}|{}|{granted_by}|{}",
        tier.as_str(),
        format_rfc3339(granted_at)?
    );
    Ok(hash_bytes(material.as_bytes()))
}

#[must_use]
pub fn permission_chain_hash(
    prev_event_hash: Option<&str>,
    signature: &str,
    evidence: &str,
) -> String {
    let material = format!("{}|{signature}|{evidence}", prev_event_hash.unwrap_or(""));
    hash_bytes(material.as_bytes())
}

/// Parses an RFC3339 timestamp and requires UTC (`Z`) offset.
///
/// # Errors
/// Returns [`KernelError::Validation`] when parsing fails or the timestamp is
/// not UTC.
pub fn parse_rfc3339_utc(value: &str) -> Result<OffsetDateTime, KernelError> {
    let parsed = OffsetDateTime::parse(value, &time::format_description::well_known::Rfc3339)
        .map_err(|err| KernelError::Validation(format!("invalid RFC3339 timestamp: {err}")))?;

    if parsed.offset() != UtcOffset::UTC {
        return Err(KernelError::Validation(
            "timestamp MUST use UTC offset Z".to_string(),
        ));
    }

    Ok(parsed)
}

/// Formats a timestamp as RFC3339 after normalizing to UTC.
///
/// # Errors
/// Returns [`KernelError::Validation`] when formatting fails.
pub fn format_rfc3339(value: OffsetDateTime) -> Result<String, KernelError> {
    value
        .to_offset(UtcOffset::UTC)
        .format(&time::format_description::well_known::Rfc3339)
        .map_err(|err| {
            KernelError::Validation(format!("failed to format RFC3339 timestamp: {err}"))
        })
}

#[must_use]
pub fn now_utc() -> OffsetDateTime {
    OffsetDateTime::now_utc().to_offset(UtcOffset::UTC)
}

#[must_use]
pub fn days_since(earlier: OffsetDateTime, later: OffsetDateTime) -> f64 {
    if later <= earlier {
        return 0.0;
    }

    (later - earlier).as_seconds_f64() / Duration::DAY.as_seconds_f64()
}

#[cfg(test)]
mod tests {
    use super::*;

    fn must_ok<T, E: std::fmt::Display>(result: Result<T, E>) -> T {
        match result {
            Ok(value) => value,
            Err(err) => panic!("expected Ok(..), got error: {err}"),
        }
    }

    fn fixture_grant(tier_from: Tier, tier: Tier) -> PermissionRecordInput {
        PermissionRecordInput {
            agent: "agent-a".to_string(),
            event_kind: PermissionEventKind::Grant,
            tier_from,
            tier,
            granted_at: must_ok(parse_rfc3339_utc("2026-03-01T00:00:00Z")),
            granted_by: "system.ladder".to_string(),
            expires_at: None,
            confidence_at_grant: 0.8,
            allowlist: Vec::new(),
            evidence: "fixture".to_string(),
        }
    }

    #[test]
    fn tier_ladder_walks_one_rung_at_a_time() {
        let mut tier = Tier::ReadOnly;
        let mut walked = vec![tier];
        while let Some(next) = tier.next() {
            assert_eq!(next.previous(), Some(tier));
            tier = next;
            walked.push(tier);
        }
        assert_eq!(walked, Tier::LADDER.to_vec());
        for tier in Tier::LADDER {
            assert_eq!(Tier::parse(tier.as_str()), Some(tier));
        }
    }

    #[test]
    fn grants_must_move_exactly_one_rung() {
        assert!(fixture_grant(Tier::ReadOnly, Tier::MetricsWrite)
            .validate()
            .is_ok());

        let skipped = fixture_grant(Tier::ReadOnly, Tier::EditRestricted).validate();
        assert!(matches!(skipped, Err(KernelError::IntegrityViolation(_))));
    }

    #[test]
    fn revoke_may_drop_multiple_rungs() {
        let mut revoke = fixture_grant(Tier::EditUnrestricted, Tier::ReadOnly);
        revoke.event_kind = PermissionEventKind::Revoke;
        assert!(revoke.validate().is_ok());
    }

    #[test]
    fn permission_events_require_evidence() {
        let mut grant = fixture_grant(Tier::ReadOnly, Tier::MetricsWrite);
        grant.evidence = "  ".to_string();
        assert!(matches!(grant.validate(), Err(KernelError::Validation(_))));
    }

    #[test]
    fn signature_is_deterministic_and_field_sensitive() {
        let at = must_ok(parse_rfc3339_utc("2026-03-01T00:00:00Z"));
        let first = must_ok(permission_signature("a", Tier::MetricsWrite, "ops", at));
        let second = must_ok(permission_signature("a", Tier::MetricsWrite, "ops", at));
        let other = must_ok(permission_signature("a", Tier::MetricsWrite, "ops2", at));
        assert_eq!(first, second);
        assert_ne!(first, other);
        assert_eq!(first.len(), 64);
    }

    #[test]
    fn variation_lifecycle_rejects_pending_to_promoted() {
        assert!(!VariationStatus::Pending.can_transition_to(VariationStatus::Promoted));
        assert!(VariationStatus::Testing.can_transition_to(VariationStatus::Promoted));
        assert!(!VariationStatus::Archived.can_transition_to(VariationStatus::Testing));
    }

    #[test]
    fn signal_events_carry_implied_success() {
        let at = must_ok(parse_rfc3339_utc("2026-03-01T00:00:00Z"));
        let rollback =
            ConfidenceEventInput::signal("agent-a", ConfidenceEventKind::Rollback, at, "reverted");
        assert!(!rollback.success);
        assert!(rollback.validate().is_ok());

        let mut contradictory = rollback.clone();
        contradictory.success = true;
        assert!(contradictory.validate().is_err());
    }

    #[test]
    fn edge_input_rejects_self_loops_and_bad_weights() {
        let mut edge = SkillEdgeInput {
            source_skill: "lint".to_string(),
            target_skill: "lint".to_string(),
            edge_type: EdgeType::SimilarTo,
            weight: 0.5,
            evidence: String::new(),
        };
        assert!(edge.validate().is_err());
        edge.target_skill = "format".to_string();
        assert!(edge.validate().is_ok());
        edge.weight = 1.5;
        assert!(edge.validate().is_err());
    }

    #[test]
    fn learning_success_requires_fidelity_threshold() {
        let mut outcome = ExecutionOutcome {
            success: true,
            fidelity: 0.89,
            output: Value::Null,
            error: None,
        };
        assert!(!outcome.is_learning_success());
        outcome.fidelity = 0.90;
        assert!(outcome.is_learning_success());
    }
}
