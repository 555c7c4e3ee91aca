//! Bounded-retry skill orchestration with confidence learning.
//!
//! An [`Orchestrator`] runs a registered [`Skill`] for an agent through a
//! Thought -> Action -> Observation loop. Every sealed execution feeds the
//! confidence tracker, may trigger a permission downgrade, and is counted
//! toward any running variation test for the skill.

use std::sync::{Arc, Mutex};
use std::time::Duration as StdDuration;

use anyhow::{anyhow, Result};
use serde::{Deserialize, Serialize};
use serde_json::{json, Value};
use skill_kernel_core::{
    now_utc, AccessDecision, Arm, ExecutionId, ExecutionOutcome, ExecutionRecord, KernelConfig,
    KernelError, Operation, PermissionRecord, RetrievalEvent, RunId, VariationId,
};
use skill_kernel_store_sqlite::{
    ChainVerification, DashboardMetrics, SqliteSkillStore, TelemetryCounter,
};

pub mod confidence;
pub mod experiment;
pub mod graph;
pub mod permissions;
pub mod retrieval;
pub mod skill;

pub use confidence::{ConfidenceCache, ConfidenceTracker, ConfidenceUpdate};
pub use experiment::{
    AbEngine, ArmRoute, ArmSelector, FixedArmSelector, RandomArmSelector, VariantChoice,
    VARIANT_KEY,
};
pub use graph::{KnowledgeGraph, Subgraph, TransferReport, DEFAULT_SUBGRAPH_DEPTH};
pub use permissions::{derive_permission_state, AgentAudit, PermissionManager, PermissionState};
pub use retrieval::{RetrievalHook, Retriever, StaticRetriever};
pub use skill::{CancelSignal, FnSkill, Skill, SkillMetadata, SkillRegistry};

/// Reserved input key summarizing the previous failed iteration.
pub const PRIOR_FAILURE_KEY: &str = "_prior_failure";

pub type SharedStore = Arc<Mutex<SqliteSkillStore>>;

#[must_use]
pub fn shared_store(store: SqliteSkillStore) -> SharedStore {
    Arc::new(Mutex::new(store))
}

/// Runs `op` with exclusive access to the store. Never call this from
/// inside another `with_store` closure.
pub(crate) fn with_store<T>(
    store: &SharedStore,
    op: impl FnOnce(&mut SqliteSkillStore) -> Result<T>,
) -> Result<T> {
    let mut guard = store
        .lock()
        .map_err(|_| anyhow!("skill store lock poisoned"))?;
    op(&mut guard)
}

#[derive(Debug, Clone)]
pub struct OrchestratorConfig {
    pub max_iterations: u32,
    pub fidelity_threshold: f64,
    pub skill_timeout: StdDuration,
    pub confidence_cache_ttl: StdDuration,
}

impl Default for OrchestratorConfig {
    fn default() -> Self {
        Self {
            max_iterations: 3,
            fidelity_threshold: 0.90,
            skill_timeout: StdDuration::from_secs(30),
            confidence_cache_ttl: StdDuration::from_secs(5),
        }
    }
}

impl OrchestratorConfig {
    /// # Errors
    /// Returns [`KernelError::Configuration`] for zero iterations, a
    /// threshold outside `[0, 1]`, or a zero timeout.
    pub fn validate(&self) -> Result<(), KernelError> {
        if self.max_iterations == 0 {
            return Err(KernelError::Configuration(
                "max_iterations MUST be >= 1".to_string(),
            ));
        }
        if !(0.0..=1.0).contains(&self.fidelity_threshold) {
            return Err(KernelError::Configuration(
                "fidelity_threshold MUST be in [0.0, 1.0]".to_string(),
            ));
        }
        if self.skill_timeout.is_zero() {
            return Err(KernelError::Configuration(
                "skill_timeout MUST be > 0".to_string(),
            ));
        }
        Ok(())
    }
}

#[derive(Debug, Clone)]
pub struct RunRequest {
    pub skill: String,
    pub agent: String,
    pub input: Value,
    pub path: Option<String>,
    pub max_iterations: Option<u32>,
    pub fidelity_threshold: Option<f64>,
    pub cancel: CancelSignal,
}

impl RunRequest {
    #[must_use]
    pub fn new(skill: &str, agent: &str, input: Value) -> Self {
        Self {
            skill: skill.to_string(),
            agent: agent.to_string(),
            input,
            path: None,
            max_iterations: None,
            fidelity_threshold: None,
            cancel: CancelSignal::new(),
        }
    }

    #[must_use]
    pub fn with_path(mut self, path: &str) -> Self {
        self.path = Some(path.to_string());
        self
    }

    #[must_use]
    pub fn with_max_iterations(mut self, max_iterations: u32) -> Self {
        self.max_iterations = Some(max_iterations);
        self
    }

    #[must_use]
    pub fn with_cancel(mut self, cancel: CancelSignal) -> Self {
        self.cancel = cancel;
        self
    }
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub enum Phase {
    Thought,
    Action,
    Observation,
    Retry,
    Done,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct IterationTrace {
    pub iteration: u32,
    pub execution_id: ExecutionId,
    pub phases: Vec<Phase>,
    pub variation_id: Option<VariationId>,
    pub arm: Option<Arm>,
    pub retrieval_relevance: Option<f64>,
    pub fidelity: f64,
    pub success: bool,
    pub error: Option<String>,
    pub timed_out: bool,
    pub duration_ms: u64,
    pub confidence_after: f64,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct ExecutionReport {
    pub run_id: RunId,
    pub skill: String,
    pub agent: String,
    pub iterations: u32,
    pub fidelity_trace: Vec<f64>,
    pub traces: Vec<IterationTrace>,
    pub early_success: bool,
    pub cancelled: bool,
    /// Set when a re-check before an edit action denied the agent mid-run.
    pub halted: Option<String>,
    pub final_outcome: Option<ExecutionOutcome>,
    pub fidelity_delta: Option<f64>,
    pub permission_changes: Vec<PermissionRecord>,
}

#[derive(Clone)]
pub struct Orchestrator {
    config: Arc<OrchestratorConfig>,
    kernel: Arc<KernelConfig>,
    store: SharedStore,
    registry: Arc<SkillRegistry>,
    confidence: ConfidenceTracker,
    permissions: PermissionManager,
    experiments: AbEngine,
    retrieval: RetrievalHook,
    graph: KnowledgeGraph,
}

impl Orchestrator {
    /// # Errors
    /// Returns [`KernelError::Configuration`] when any config section is
    /// invalid.
    pub fn new(
        store: SharedStore,
        registry: SkillRegistry,
        kernel: KernelConfig,
        config: OrchestratorConfig,
    ) -> Result<Self, KernelError> {
        kernel.validate()?;
        config.validate()?;

        let confidence = ConfidenceTracker::new(
            store.clone(),
            kernel.confidence.clone(),
            config.confidence_cache_ttl,
        );
        let permissions =
            PermissionManager::new(store.clone(), kernel.ladder.clone(), confidence.clone())?;
        let experiments = AbEngine::new(store.clone(), kernel.experiment.clone());
        let retrieval = RetrievalHook::new(store.clone(), kernel.retrieval.clone());
        let graph = KnowledgeGraph::new(store.clone());

        Ok(Self {
            config: Arc::new(config),
            kernel: Arc::new(kernel),
            store,
            registry: Arc::new(registry),
            confidence,
            permissions,
            experiments,
            retrieval,
            graph,
        })
    }

    #[must_use]
    pub fn with_retriever(mut self, retriever: Arc<dyn Retriever>) -> Self {
        self.retrieval = self.retrieval.with_retriever(retriever);
        self
    }

    #[must_use]
    pub fn with_arm_selector(mut self, selector: Arc<dyn ArmSelector>) -> Self {
        self.experiments = self.experiments.with_selector(selector);
        self
    }

    #[must_use]
    pub fn kernel_config(&self) -> &KernelConfig {
        &self.kernel
    }

    #[must_use]
    pub fn confidence(&self) -> &ConfidenceTracker {
        &self.confidence
    }

    #[must_use]
    pub fn permissions(&self) -> &PermissionManager {
        &self.permissions
    }

    #[must_use]
    pub fn experiments(&self) -> &AbEngine {
        &self.experiments
    }

    #[must_use]
    pub fn graph(&self) -> &KnowledgeGraph {
        &self.graph
    }

    #[must_use]
    pub fn store(&self) -> &SharedStore {
        &self.store
    }

    /// # Errors
    /// Returns an error when the store fails.
    pub fn dashboard(&self) -> Result<DashboardMetrics> {
        let min_relevance = self.kernel.retrieval.min_relevance;
        with_store(&self.store, |store| store.dashboard_metrics(min_relevance))
    }

    /// Re-applies telemetry for a sealed execution. Returns `false` when it
    /// was already counted.
    ///
    /// # Errors
    /// Returns an error when the execution is not sealed or the store fails.
    pub fn replay_telemetry(&self, execution_id: ExecutionId) -> Result<bool> {
        with_store(&self.store, |store| store.replay_execution_telemetry(execution_id))
    }

    /// # Errors
    /// Returns an error when the store fails.
    pub fn counters(&self) -> Result<Vec<TelemetryCounter>> {
        with_store(&self.store, |store| store.list_counters())
    }

    /// Re-verifies signatures and hash links of the permission log, for one
    /// agent or all of them.
    ///
    /// # Errors
    /// Returns an error when the store fails.
    pub fn verify_audit(&self, agent: Option<&str>) -> Result<ChainVerification> {
        let verification = with_store(&self.store, |store| store.verify_permission_chain(agent))?;
        if !verification.valid {
            tracing::error!(
                failures = verification.failures.len(),
                "permission audit chain failed verification"
            );
        }
        Ok(verification)
    }

    /// Runs one invocation to completion.
    ///
    /// Skill failures and timeouts are recorded and retried, never returned
    /// as errors. Store-bound phases run on the blocking pool.
    ///
    /// # Errors
    /// Returns [`KernelError::PermissionDenied`] before any execution when
    /// the agent may not run the skill, [`KernelError::Validation`] for an
    /// unknown skill or an out-of-range fidelity threshold, or an error when
    /// the store fails.
    pub async fn run(&self, request: RunRequest) -> Result<ExecutionReport> {
        let skill = self.registry.get(&request.skill).ok_or_else(|| {
            KernelError::Validation(format!("unknown skill: {}", request.skill))
        })?;
        let threshold = request
            .fidelity_threshold
            .unwrap_or(self.config.fidelity_threshold);
        if !(0.0..=1.0).contains(&threshold) {
            return Err(KernelError::Validation(format!(
                "fidelity_threshold MUST be in [0.0, 1.0], got {threshold}"
            ))
            .into());
        }
        let max_iterations = request
            .max_iterations
            .unwrap_or(self.config.max_iterations)
            .max(1);

        let request = Arc::new(request);
        let metadata = Arc::new(skill.metadata().clone());
        {
            let request = Arc::clone(&request);
            let metadata = Arc::clone(&metadata);
            self.run_blocking(move |orchestrator| orchestrator.authorize(&request, &metadata))
                .await?;
        }

        let run_id = RunId::new();
        let mut report = ExecutionReport {
            run_id,
            skill: request.skill.clone(),
            agent: request.agent.clone(),
            iterations: 0,
            fidelity_trace: Vec::new(),
            traces: Vec::new(),
            early_success: false,
            cancelled: false,
            halted: None,
            final_outcome: None,
            fidelity_delta: None,
            permission_changes: Vec::new(),
        };

        tracing::info!(
            run_id = %run_id,
            skill = %request.skill,
            agent = %request.agent,
            max_iterations,
            "run started"
        );

        for iteration in 1..=max_iterations {
            if request.cancel.is_cancelled() {
                report.cancelled = true;
                tracing::info!(run_id = %run_id, iteration, "run cancelled between iterations");
                break;
            }

            // Thought
            let execution_id = ExecutionId::new();
            let mut phases = vec![Phase::Thought];
            let thought = {
                let request = Arc::clone(&request);
                let metadata = Arc::clone(&metadata);
                let previous = report.traces.last().cloned();
                self.run_blocking(move |orchestrator| {
                    orchestrator.think(&request, &metadata, execution_id, previous.as_ref())
                })
                .await?
            };
            let (input, choice, retrieval) = match thought {
                Thought::Act {
                    input,
                    choice,
                    retrieval,
                } => (input, choice, retrieval),
                Thought::Halt(reason) => {
                    tracing::warn!(
                        run_id = %run_id,
                        iteration,
                        reason = %reason,
                        "edit re-check denied, halting run"
                    );
                    report.halted = Some(reason);
                    break;
                }
            };

            // Action
            phases.push(Phase::Action);
            let started_at = now_utc();
            let (outcome, timed_out) = self.execute_skill(Arc::clone(&skill), &input).await;
            let duration_ms = elapsed_ms(started_at);

            // Observation
            phases.push(Phase::Observation);
            let record = ExecutionRecord {
                execution_id,
                run_id,
                iteration,
                skill: request.skill.clone(),
                agent: request.agent.clone(),
                started_at,
                input_snapshot: input,
                variation_id: choice.variation().map(|variation| variation.variation_id),
                outcome,
                duration_ms,
            };
            let route = match &choice {
                VariantChoice::Trial { route } => Some(route.clone()),
                VariantChoice::Unversioned | VariantChoice::Production { .. } => None,
            };
            let Observation {
                record,
                update,
                change,
            } = self
                .run_blocking(move |orchestrator| orchestrator.observe(record, route.as_ref()))
                .await?;
            if let Some(change) = change {
                report.permission_changes.push(change);
            }

            let done = record.outcome.success && record.outcome.fidelity >= threshold;
            phases.push(if done { Phase::Done } else { Phase::Retry });
            tracing::info!(
                run_id = %run_id,
                iteration,
                fidelity = record.outcome.fidelity,
                success = record.outcome.success,
                timed_out,
                confidence = update.breakdown.confidence,
                "iteration observed"
            );

            report.iterations = iteration;
            report.fidelity_trace.push(record.outcome.fidelity);
            report.traces.push(IterationTrace {
                iteration,
                execution_id,
                phases,
                variation_id: record.variation_id,
                arm: choice.arm(),
                retrieval_relevance: retrieval.map(|event| event.relevance),
                fidelity: record.outcome.fidelity,
                success: record.outcome.success,
                error: record.outcome.error.clone(),
                timed_out,
                duration_ms,
                confidence_after: update.breakdown.confidence,
            });
            report.final_outcome = Some(record.outcome);

            if done {
                report.early_success = true;
                break;
            }
        }

        if report.iterations > 0 {
            let iterations = report.iterations;
            self.run_blocking(move |orchestrator| {
                with_store(&orchestrator.store, |store| {
                    store.record_run_completion(run_id, iterations)
                })
            })
            .await?;
        }
        report.fidelity_delta = match (report.fidelity_trace.first(), report.fidelity_trace.last())
        {
            (Some(first), Some(last)) => Some(last - first),
            _ => None,
        };

        tracing::info!(
            run_id = %run_id,
            iterations = report.iterations,
            early_success = report.early_success,
            cancelled = report.cancelled,
            retries = report.iterations.saturating_sub(1),
            "run finished"
        );
        Ok(report)
    }

    async fn run_blocking<T, F>(&self, op: F) -> Result<T>
    where
        T: Send + 'static,
        F: FnOnce(Self) -> Result<T> + Send + 'static,
    {
        let orchestrator = self.clone();
        tokio::task::spawn_blocking(move || op(orchestrator))
            .await
            .map_err(|err| anyhow!("store task failed: {err}"))?
    }

    fn authorize(&self, request: &RunRequest, metadata: &SkillMetadata) -> Result<()> {
        if !metadata.accepts_agent(&request.agent) {
            return Err(KernelError::PermissionDenied(format!(
                "skill {} is bound to agent {}",
                metadata.name,
                metadata.agent_affinity.as_deref().unwrap_or_default()
            ))
            .into());
        }

        let decision = self.permissions.check_permission(
            &request.agent,
            metadata.required_operation(),
            request.path.as_deref(),
            now_utc(),
        )?;
        match tier_gate(metadata, &decision) {
            Some(reason) => Err(KernelError::PermissionDenied(reason).into()),
            None => Ok(()),
        }
    }

    /// Re-checks edit permission, then builds this iteration's input. The
    /// re-check comes first so a halted iteration stores nothing.
    fn think(
        &self,
        request: &RunRequest,
        metadata: &SkillMetadata,
        execution_id: ExecutionId,
        previous: Option<&IterationTrace>,
    ) -> Result<Thought> {
        if metadata.required_operation() == Operation::Edit {
            let decision = self.permissions.check_permission(
                &request.agent,
                Operation::Edit,
                request.path.as_deref(),
                now_utc(),
            )?;
            if let Some(reason) = tier_gate(metadata, &decision) {
                return Ok(Thought::Halt(reason));
            }
        }

        let mut input = request.input.clone();
        if let Some(previous) = previous {
            attach_prior_failure(&mut input, previous);
        }
        let choice = self.experiments.choose(&request.skill)?;
        choice.attach(&mut input);
        let retrieval = self.retrieval.enrich(execution_id, &request.skill, &mut input)?;
        Ok(Thought::Act {
            input,
            choice,
            retrieval,
        })
    }

    /// Seals the execution, feeds confidence and permissions, and counts the
    /// trial for a routed arm.
    fn observe(&self, record: ExecutionRecord, route: Option<&ArmRoute>) -> Result<Observation> {
        with_store(&self.store, |store| store.seal_execution(&record))?;

        let observed_at = now_utc();
        let update = self.confidence.record_execution(&record, observed_at)?;
        let change = self.permissions.reconcile(&update, observed_at)?;
        if let Some(route) = route {
            self.experiments.record_outcome(
                route,
                record.outcome.is_learning_success(),
                observed_at,
            )?;
        }
        Ok(Observation {
            record,
            update,
            change,
        })
    }

    /// Runs the skill on the blocking pool under the configured timeout. On
    /// timeout the skill's cancel signal is raised and its eventual result is
    /// discarded.
    async fn execute_skill(&self, skill: Arc<dyn Skill>, input: &Value) -> (ExecutionOutcome, bool) {
        let timeout = self.config.skill_timeout;
        let cancel = CancelSignal::new();
        let action_cancel = cancel.clone();
        let action_input = input.clone();
        let handle =
            tokio::task::spawn_blocking(move || skill.execute(&action_input, &action_cancel));

        match tokio::time::timeout(timeout, handle).await {
            Err(_) => {
                cancel.cancel();
                let timeout_ms = u64::try_from(timeout.as_millis()).unwrap_or(u64::MAX);
                tracing::warn!(timeout_ms, "skill action timed out");
                (
                    ExecutionOutcome::failed(format!("skill timed out after {timeout_ms} ms")),
                    true,
                )
            }
            Ok(Err(join_err)) => (
                ExecutionOutcome::failed(format!("skill task failed: {join_err}")),
                false,
            ),
            Ok(Ok(Err(err))) => (ExecutionOutcome::failed(format!("{err:#}")), false),
            Ok(Ok(Ok(outcome))) => match outcome.validate() {
                Ok(()) => (outcome, false),
                Err(err) => (ExecutionOutcome::failed(err.to_string()), false),
            },
        }
    }
}

enum Thought {
    Act {
        input: Value,
        choice: VariantChoice,
        retrieval: Option<RetrievalEvent>,
    },
    Halt(String),
}

struct Observation {
    record: ExecutionRecord,
    update: ConfidenceUpdate,
    change: Option<PermissionRecord>,
}

/// Denial reason when `decision` does not clear the skill's required tier.
fn tier_gate(metadata: &SkillMetadata, decision: &AccessDecision) -> Option<String> {
    if !decision.allowed {
        return Some(decision.reason.clone());
    }
    (decision.tier < metadata.required_tier).then(|| {
        format!(
            "denied.tier_insufficient: {} requires {}, agent holds {}",
            metadata.name, metadata.required_tier, decision.tier
        )
    })
}

fn attach_prior_failure(input: &mut Value, previous: &IterationTrace) {
    if let Value::Object(map) = input {
        map.insert(
            PRIOR_FAILURE_KEY.to_string(),
            json!({
                "iteration": previous.iteration,
                "fidelity": previous.fidelity,
                "success": previous.success,
                "error": previous.error,
                "timed_out": previous.timed_out,
            }),
        );
    }
}

fn elapsed_ms(started_at: time::OffsetDateTime) -> u64 {
    let millis = (now_utc() - started_at).whole_milliseconds();
    u64::try_from(millis).unwrap_or(0)
}

#[cfg(test)]
mod tests {
    #![allow(clippy::float_cmp, clippy::too_many_lines)]

    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::sync::Mutex as StdMutex;

    use skill_kernel_core::{AssignmentStatus, PermissionEventKind, PermissionRecordInput, Tier};
    use skill_kernel_store_sqlite::{COUNTER_RETRY_COUNT, COUNTER_RUNS_TOTAL, COUNTER_TOTAL_EXECUTIONS};
    use std::path::Path;
    use time::Duration;

    use super::*;

    fn must<T>(result: Result<T>) -> T {
        match result {
            Ok(value) => value,
            Err(err) => panic!("test failure: {err:#}"),
        }
    }

    fn fixture_store() -> SharedStore {
        let store = must(SqliteSkillStore::open(Path::new(":memory:")));
        must(store.migrate());
        shared_store(store)
    }

    fn outcome(fidelity: f64) -> ExecutionOutcome {
        ExecutionOutcome {
            success: true,
            fidelity,
            output: json!({"fidelity": fidelity}),
            error: None,
        }
    }

    /// Skill that replays a scripted fidelity sequence and records inputs.
    fn scripted(
        name: &str,
        tier: Tier,
        fidelities: Vec<f64>,
        seen: Arc<StdMutex<Vec<Value>>>,
    ) -> Arc<dyn Skill> {
        let calls = AtomicUsize::new(0);
        Arc::new(FnSkill::new(
            SkillMetadata::new(name, tier),
            move |input: &Value, _cancel: &CancelSignal| {
                if let Ok(mut guard) = seen.lock() {
                    guard.push(input.clone());
                }
                let idx = calls.fetch_add(1, Ordering::SeqCst);
                let fidelity = fidelities
                    .get(idx)
                    .or_else(|| fidelities.last())
                    .copied()
                    .unwrap_or(0.0);
                Ok(outcome(fidelity))
            },
        ))
    }

    fn orchestrator_with(store: &SharedStore, skills: Vec<Arc<dyn Skill>>, config: OrchestratorConfig) -> Orchestrator {
        let mut registry = SkillRegistry::new();
        for skill in skills {
            if let Err(err) = registry.register(skill) {
                panic!("register: {err}");
            }
        }
        match Orchestrator::new(store.clone(), registry, KernelConfig::v1(), config) {
            Ok(orchestrator) => orchestrator,
            Err(err) => panic!("orchestrator: {err}"),
        }
    }

    fn counter(store: &SharedStore, name: &str) -> i64 {
        must(with_store(store, |store| store.get_counter(name)))
    }

    #[tokio::test]
    async fn improving_fidelity_exits_early_on_third_iteration() {
        let store = fixture_store();
        let seen = Arc::new(StdMutex::new(Vec::new()));
        let orchestrator = orchestrator_with(
            &store,
            vec![scripted("summarize", Tier::ReadOnly, vec![0.70, 0.85, 0.95], seen.clone())],
            OrchestratorConfig::default(),
        );

        let report = must(
            orchestrator
                .run(RunRequest::new("summarize", "agent-a", json!({"text": "report"})))
                .await,
        );
        assert_eq!(report.iterations, 3);
        assert!(report.early_success);
        assert_eq!(report.fidelity_trace, vec![0.70, 0.85, 0.95]);
        assert!(report
            .fidelity_delta
            .is_some_and(|delta| (delta - 0.25).abs() < 1e-9));
        assert_eq!(
            report.traces[2].phases,
            vec![Phase::Thought, Phase::Action, Phase::Observation, Phase::Done]
        );
        assert_eq!(report.traces[0].phases.last(), Some(&Phase::Retry));

        assert_eq!(counter(&store, COUNTER_RETRY_COUNT), 2);
        assert_eq!(counter(&store, COUNTER_TOTAL_EXECUTIONS), 3);
        assert_eq!(counter(&store, COUNTER_RUNS_TOTAL), 1);

        let inputs = seen.lock().map(|guard| guard.clone()).unwrap_or_default();
        assert_eq!(inputs.len(), 3);
        assert!(inputs[0].get(PRIOR_FAILURE_KEY).is_none());
        assert_eq!(inputs[1][PRIOR_FAILURE_KEY]["fidelity"], json!(0.70));
        assert_eq!(inputs[2][PRIOR_FAILURE_KEY]["iteration"], json!(2));

        let executions =
            must(with_store(&store, |store| store.list_executions_for_run(report.run_id)));
        assert_eq!(executions.len(), 3);

        let dashboard = must(orchestrator.dashboard());
        assert_eq!(dashboard.retry_count, 2);
        assert!(dashboard
            .avg_fidelity_delta
            .is_some_and(|delta| (delta - 0.25).abs() < 1e-9));
    }

    #[tokio::test]
    async fn exhausted_runs_return_last_result_and_full_trace() {
        let store = fixture_store();
        let seen = Arc::new(StdMutex::new(Vec::new()));
        let orchestrator = orchestrator_with(
            &store,
            vec![scripted("lint", Tier::ReadOnly, vec![0.3, 0.4, 0.5], seen)],
            OrchestratorConfig::default(),
        );
        let report = must(
            orchestrator
                .run(RunRequest::new("lint", "agent-a", json!({})))
                .await,
        );
        assert_eq!(report.iterations, 3);
        assert!(!report.early_success);
        assert_eq!(report.fidelity_trace, vec![0.3, 0.4, 0.5]);
        assert_eq!(report.final_outcome.map(|outcome| outcome.fidelity), Some(0.5));
        assert_eq!(counter(&store, COUNTER_RETRY_COUNT), 2);
    }

    #[tokio::test]
    async fn new_agent_is_denied_edit_before_execution() {
        let store = fixture_store();
        let seen = Arc::new(StdMutex::new(Vec::new()));
        let orchestrator = orchestrator_with(
            &store,
            vec![scripted("refactor", Tier::EditRestricted, vec![1.0], seen.clone())],
            OrchestratorConfig::default(),
        );
        let result = orchestrator
            .run(RunRequest::new("refactor", "newcomer", json!({})).with_path("docs/guide.md"))
            .await;
        let err = result.err().unwrap_or_else(|| unreachable!());
        assert!(matches!(
            err.downcast_ref::<KernelError>(),
            Some(KernelError::PermissionDenied(_))
        ));
        assert_eq!(seen.lock().map(|guard| guard.len()).unwrap_or(usize::MAX), 0);
        assert_eq!(counter(&store, COUNTER_TOTAL_EXECUTIONS), 0);
    }

    #[tokio::test]
    async fn affinity_mismatch_is_permission_denied() {
        let store = fixture_store();
        let skill: Arc<dyn Skill> = Arc::new(FnSkill::new(
            SkillMetadata::new("deploy-notes", Tier::ReadOnly).with_affinity("ops"),
            |_input: &Value, _cancel: &CancelSignal| Ok(outcome(1.0)),
        ));
        let orchestrator = orchestrator_with(&store, vec![skill], OrchestratorConfig::default());
        let err = orchestrator
            .run(RunRequest::new("deploy-notes", "intern", json!({})))
            .await
            .err()
            .unwrap_or_else(|| unreachable!());
        assert!(err.to_string().contains("bound to agent ops"));
    }

    #[tokio::test]
    async fn timed_out_actions_are_recorded_as_failures_and_retried() {
        let store = fixture_store();
        let attempts = Arc::new(AtomicUsize::new(0));
        let counted = attempts.clone();
        let skill: Arc<dyn Skill> = Arc::new(FnSkill::new(
            SkillMetadata::new("slow", Tier::ReadOnly),
            move |_input: &Value, cancel: &CancelSignal| {
                let attempt = counted.fetch_add(1, Ordering::SeqCst);
                if attempt == 0 {
                    let started = std::time::Instant::now();
                    while !cancel.is_cancelled() && started.elapsed() < StdDuration::from_secs(2) {
                        std::thread::sleep(StdDuration::from_millis(5));
                    }
                    return Ok(outcome(1.0));
                }
                Ok(outcome(0.95))
            },
        ));
        let orchestrator = orchestrator_with(
            &store,
            vec![skill],
            OrchestratorConfig {
                skill_timeout: StdDuration::from_millis(50),
                ..OrchestratorConfig::default()
            },
        );

        let report = must(orchestrator.run(RunRequest::new("slow", "agent-a", json!({}))).await);
        assert_eq!(report.iterations, 2);
        assert!(report.traces[0].timed_out);
        assert_eq!(report.traces[0].fidelity, 0.0);
        assert!(report.traces[0]
            .error
            .as_deref()
            .is_some_and(|error| error.contains("timed out")));
        assert!(report.early_success);

        let executions =
            must(with_store(&store, |store| store.list_executions_for_run(report.run_id)));
        assert_eq!(executions[0].outcome.fidelity, 0.0);
    }

    #[tokio::test]
    async fn skill_errors_are_scored_not_propagated() {
        let store = fixture_store();
        let skill: Arc<dyn Skill> = Arc::new(FnSkill::new(
            SkillMetadata::new("flaky", Tier::ReadOnly),
            |_input: &Value, _cancel: &CancelSignal| Err(anyhow!("upstream 503")),
        ));
        let orchestrator = orchestrator_with(&store, vec![skill], OrchestratorConfig::default());
        let report = must(
            orchestrator
                .run(RunRequest::new("flaky", "agent-a", json!({})).with_max_iterations(2))
                .await,
        );
        assert_eq!(report.iterations, 2);
        assert!(report.traces.iter().all(|trace| !trace.success));
        assert_eq!(report.traces[1].error.as_deref(), Some("upstream 503"));
        assert!(report.traces[1].confidence_after < 0.5);
    }

    #[tokio::test]
    async fn cancellation_stops_between_iterations() {
        let store = fixture_store();
        let cancel = CancelSignal::new();
        let trigger = cancel.clone();
        let skill: Arc<dyn Skill> = Arc::new(FnSkill::new(
            SkillMetadata::new("partial", Tier::ReadOnly),
            move |_input: &Value, _cancel: &CancelSignal| {
                trigger.cancel();
                Ok(outcome(0.4))
            },
        ));
        let orchestrator = orchestrator_with(&store, vec![skill], OrchestratorConfig::default());
        let report = must(
            orchestrator
                .run(RunRequest::new("partial", "agent-a", json!({})).with_cancel(cancel))
                .await,
        );
        assert!(report.cancelled);
        assert_eq!(report.iterations, 1);
        assert_eq!(counter(&store, COUNTER_RETRY_COUNT), 0);
        assert_eq!(counter(&store, COUNTER_RUNS_TOTAL), 1);
    }

    #[tokio::test]
    async fn trial_outcomes_feed_the_running_test() {
        let store = fixture_store();
        let seen = Arc::new(StdMutex::new(Vec::new()));
        let orchestrator = orchestrator_with(
            &store,
            vec![scripted("summarize", Tier::ReadOnly, vec![0.95], seen.clone())],
            OrchestratorConfig::default(),
        )
        .with_arm_selector(Arc::new(FixedArmSelector(Arm::Treatment)));

        let engine = orchestrator.experiments();
        let control = must(engine.register_variation("summarize", &json!({"prompt": "v1"})));
        must(engine.adopt_baseline(control.variation_id));
        let treatment = must(engine.register_variation("summarize", &json!({"prompt": "v2"})));
        let assignment = must(engine.schedule_test(
            "summarize",
            control.variation_id,
            treatment.variation_id,
            None,
            now_utc(),
        ));

        let report = must(
            orchestrator
                .run(RunRequest::new("summarize", "agent-a", json!({"text": "x"})))
                .await,
        );
        assert_eq!(report.traces[0].arm, Some(Arm::Treatment));
        assert_eq!(report.traces[0].variation_id, Some(treatment.variation_id));

        let inputs = seen.lock().map(|guard| guard.clone()).unwrap_or_default();
        assert_eq!(inputs[0][VARIANT_KEY]["content"], json!({"prompt": "v2"}));

        let running = must(engine.running_test("summarize")).unwrap_or_else(|| unreachable!());
        assert_eq!(running.assignment_id, assignment.assignment_id);
        assert_eq!(running.status, AssignmentStatus::Running);
        assert_eq!(running.treatment_trials, 1);
        assert_eq!(running.treatment_successes, 1);
        assert_eq!(running.control_trials, 0);
    }

    #[tokio::test]
    async fn retrieved_context_is_attached_and_counted() {
        let store = fixture_store();
        let seen = Arc::new(StdMutex::new(Vec::new()));
        let retriever = StaticRetriever::new()
            .with_entry("summarize", json!("a"))
            .with_entry("summarize", json!("b"))
            .with_entry("summarize", json!("c"))
            .with_entry("summarize", json!("d"));
        let orchestrator = orchestrator_with(
            &store,
            vec![scripted("summarize", Tier::ReadOnly, vec![0.99], seen.clone())],
            OrchestratorConfig::default(),
        )
        .with_retriever(Arc::new(retriever));

        let report = must(
            orchestrator
                .run(RunRequest::new("summarize", "agent-a", json!({"text": "x"})))
                .await,
        );
        assert_eq!(report.traces[0].retrieval_relevance, Some(1.0));
        let inputs = seen.lock().map(|guard| guard.clone()).unwrap_or_default();
        assert!(inputs[0]
            .get(skill_kernel_core::RETRIEVED_CONTEXT_KEY)
            .is_some());
        assert_eq!(must(orchestrator.dashboard()).retrieval_coverage, Some(1.0));
    }

    #[tokio::test]
    async fn failing_edits_downgrade_and_halt_the_run() {
        let store = fixture_store();
        let seen = Arc::new(StdMutex::new(Vec::new()));
        let orchestrator = orchestrator_with(
            &store,
            vec![
                scripted("warmup", Tier::ReadOnly, vec![0.99], Arc::new(StdMutex::new(Vec::new()))),
                scripted("rewrite-docs", Tier::EditRestricted, vec![0.1], seen.clone()),
            ],
            OrchestratorConfig::default(),
        )
        .with_retriever(Arc::new(
            StaticRetriever::new().with_entry("rewrite-docs", json!("style guide")),
        ));
        for _ in 0..2 {
            must(orchestrator.run(RunRequest::new("warmup", "agent-e", json!({}))).await);
        }

        let now = now_utc();
        for (tier_from, tier, allowlist) in [
            (Tier::ReadOnly, Tier::MetricsWrite, Vec::new()),
            (
                Tier::MetricsWrite,
                Tier::EditRestricted,
                vec!["docs/**".to_string()],
            ),
        ] {
            must(with_store(&store, |store| {
                store.append_permission_event(&PermissionRecordInput {
                    agent: "agent-e".to_string(),
                    event_kind: PermissionEventKind::Grant,
                    tier_from,
                    tier,
                    granted_at: now,
                    granted_by: "ops-lead".to_string(),
                    expires_at: Some(now + Duration::days(30)),
                    confidence_at_grant: 0.9,
                    allowlist,
                    evidence: "seeded grant".to_string(),
                })
            }));
        }

        // 2 successes then one low-fidelity edit: 2/3 drops below 0.75.
        let report = must(
            orchestrator
                .run(RunRequest::new("rewrite-docs", "agent-e", json!({})).with_path("docs/a.md"))
                .await,
        );
        assert_eq!(report.iterations, 1);
        assert!(report
            .halted
            .as_deref()
            .is_some_and(|reason| reason.starts_with("denied.tier_insufficient")));
        assert_eq!(report.permission_changes.len(), 1);
        assert_eq!(report.permission_changes[0].event_kind, PermissionEventKind::Downgrade);
        assert_eq!(report.permission_changes[0].tier, Tier::MetricsWrite);
        assert_eq!(seen.lock().map(|guard| guard.len()).unwrap_or_default(), 1);

        let state = must(orchestrator.permissions().state("agent-e", now_utc()));
        assert_eq!(state.tier, Tier::MetricsWrite);

        let lookups = must(with_store(&store, |store| {
            store.list_retrieval_events(Some("rewrite-docs"))
        }));
        assert_eq!(lookups.len(), 1);
        assert_eq!(lookups[0].execution_id, report.traces[0].execution_id);
        let executions =
            must(with_store(&store, |store| store.list_executions_for_run(report.run_id)));
        assert_eq!(executions.len(), 1);
    }

    #[tokio::test]
    async fn out_of_range_threshold_override_is_rejected() {
        let store = fixture_store();
        let seen = Arc::new(StdMutex::new(Vec::new()));
        let orchestrator = orchestrator_with(
            &store,
            vec![scripted("lint", Tier::ReadOnly, vec![0.95], seen.clone())],
            OrchestratorConfig::default(),
        );
        for threshold in [f64::NAN, 1.5, -0.1] {
            let mut request = RunRequest::new("lint", "agent-a", json!({}));
            request.fidelity_threshold = Some(threshold);
            let err = orchestrator
                .run(request)
                .await
                .err()
                .unwrap_or_else(|| unreachable!());
            assert!(matches!(
                err.downcast_ref::<KernelError>(),
                Some(KernelError::Validation(_))
            ));
        }
        assert_eq!(seen.lock().map(|guard| guard.len()).unwrap_or(usize::MAX), 0);
        assert_eq!(counter(&store, COUNTER_TOTAL_EXECUTIONS), 0);
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 2)]
    async fn independent_agents_run_concurrently() {
        let store = fixture_store();
        let orchestrator = orchestrator_with(
            &store,
            vec![scripted("lint", Tier::ReadOnly, vec![0.95], Arc::new(StdMutex::new(Vec::new())))],
            OrchestratorConfig::default(),
        );
        let first = orchestrator.clone();
        let second = orchestrator.clone();
        let (a, b) = tokio::join!(
            tokio::spawn(async move { first.run(RunRequest::new("lint", "agent-a", json!({}))).await }),
            tokio::spawn(async move { second.run(RunRequest::new("lint", "agent-b", json!({}))).await }),
        );
        let a = must(a.map_err(anyhow::Error::new).and_then(|result| result));
        let b = must(b.map_err(anyhow::Error::new).and_then(|result| result));
        assert_ne!(a.run_id, b.run_id);
        assert_eq!(counter(&store, COUNTER_RUNS_TOTAL), 2);
        assert_eq!(counter(&store, COUNTER_TOTAL_EXECUTIONS), 2);
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 4)]
    async fn concurrent_runs_under_a_running_test_count_each_trial_once() {
        let store = fixture_store();
        let orchestrator = orchestrator_with(
            &store,
            vec![scripted(
                "summarize",
                Tier::ReadOnly,
                vec![0.95],
                Arc::new(StdMutex::new(Vec::new())),
            )],
            OrchestratorConfig::default(),
        );
        let engine = orchestrator.experiments();
        let control = must(engine.register_variation("summarize", &json!({"prompt": "v1"})));
        must(engine.adopt_baseline(control.variation_id));
        let treatment = must(engine.register_variation("summarize", &json!({"prompt": "v2"})));
        must(engine.schedule_test(
            "summarize",
            control.variation_id,
            treatment.variation_id,
            None,
            now_utc(),
        ));

        let handles: Vec<_> = (0..8)
            .map(|idx| {
                let orchestrator = orchestrator.clone();
                tokio::spawn(async move {
                    orchestrator
                        .run(RunRequest::new(
                            "summarize",
                            &format!("agent-{idx}"),
                            json!({"text": "x"}),
                        ))
                        .await
                })
            })
            .collect();
        let mut routed = 0_u32;
        for handle in handles {
            let report = must(handle.await.map_err(anyhow::Error::new).and_then(|result| result));
            assert_eq!(report.iterations, 1);
            routed += u32::try_from(report.traces.iter().filter(|trace| trace.arm.is_some()).count())
                .unwrap_or(u32::MAX);
        }

        let running = must(engine.running_test("summarize")).unwrap_or_else(|| unreachable!());
        assert_eq!(routed, 8);
        assert_eq!(running.control_trials + running.treatment_trials, routed);
        assert_eq!(counter(&store, COUNTER_TOTAL_EXECUTIONS), 8);
    }

    #[test]
    fn invalid_orchestrator_config_is_rejected() {
        let config = OrchestratorConfig {
            max_iterations: 0,
            ..OrchestratorConfig::default()
        };
        assert!(matches!(config.validate(), Err(KernelError::Configuration(_))));
    }
}
