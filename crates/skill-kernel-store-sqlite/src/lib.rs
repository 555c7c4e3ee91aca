#![allow(clippy::missing_errors_doc)]
#![allow(clippy::uninlined_format_args)]

use std::path::Path;

use anyhow::{anyhow, Context, Result};
use rusqlite::types::Type;
use rusqlite::{params, Connection, OptionalExtension, TransactionBehavior};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use skill_kernel_core::{
    current_tier, evaluate_assignment, format_rfc3339, now_utc, parse_rfc3339_utc,
    permission_chain_hash, permission_signature, AbAssignment, Arm, AssignmentDecision,
    AssignmentId, AssignmentStatus, ConfidenceBreakdown, ConfidenceEvent, ConfidenceEventInput,
    ConfidenceEventKind, EdgeType, ExecutionId, ExecutionOutcome, ExecutionRecord,
    ExperimentConfig, ExperimentVerdict, KernelError, PermissionEventKind, PermissionRecord,
    PermissionRecordInput, RetrievalEvent, RunId, SkillEdge, SkillEdgeInput, Tier, Variation,
    VariationId, VariationStatus, LEARNING_SUCCESS_FIDELITY,
};
use time::OffsetDateTime;
use ulid::Ulid;

const SKILL_KERNEL_MIGRATION_VERSION: i64 = 1;

pub const COUNTER_TOTAL_EXECUTIONS: &str = "total_executions";
pub const COUNTER_RETRY_COUNT: &str = "retry_count";
pub const COUNTER_RUNS_TOTAL: &str = "runs_total";

const SCHEMA_SKILL_KERNEL_V1: &str = r"
CREATE TABLE IF NOT EXISTS executions (
  execution_seq INTEGER PRIMARY KEY AUTOINCREMENT,
  execution_id TEXT NOT NULL UNIQUE,
  run_id TEXT NOT NULL,
  iteration INTEGER NOT NULL CHECK (iteration >= 1),
  skill TEXT NOT NULL,
  agent TEXT NOT NULL,
  started_at TEXT NOT NULL,
  input_json TEXT NOT NULL,
  variation_id TEXT,
  success INTEGER NOT NULL CHECK (success IN (0, 1)),
  fidelity REAL NOT NULL CHECK (fidelity BETWEEN 0.0 AND 1.0),
  output_json TEXT NOT NULL,
  error TEXT,
  duration_ms INTEGER NOT NULL CHECK (duration_ms >= 0),
  sealed_at TEXT NOT NULL,
  UNIQUE (run_id, iteration)
);

CREATE TRIGGER IF NOT EXISTS trg_executions_no_update
BEFORE UPDATE ON executions
BEGIN
  SELECT RAISE(FAIL, 'executions are write-once');
END;

CREATE TRIGGER IF NOT EXISTS trg_executions_no_delete
BEFORE DELETE ON executions
BEGIN
  SELECT RAISE(FAIL, 'executions are write-once');
END;

CREATE INDEX IF NOT EXISTS idx_executions_skill_fidelity
  ON executions(skill, fidelity DESC);
CREATE INDEX IF NOT EXISTS idx_executions_agent_seq
  ON executions(agent, execution_seq);

CREATE TABLE IF NOT EXISTS telemetry_counters (
  name TEXT PRIMARY KEY,
  value INTEGER NOT NULL CHECK (value >= 0),
  updated_at TEXT NOT NULL
);

CREATE TRIGGER IF NOT EXISTS trg_telemetry_counters_monotonic
BEFORE UPDATE ON telemetry_counters
WHEN NEW.value < OLD.value
BEGIN
  SELECT RAISE(FAIL, 'telemetry_counters only increase');
END;

CREATE TRIGGER IF NOT EXISTS trg_telemetry_counters_no_delete
BEFORE DELETE ON telemetry_counters
BEGIN
  SELECT RAISE(FAIL, 'telemetry_counters only increase');
END;

CREATE TABLE IF NOT EXISTS telemetry_ledger (
  counter_name TEXT NOT NULL,
  idempotency_key TEXT NOT NULL,
  delta INTEGER NOT NULL CHECK (delta >= 0),
  applied_at TEXT NOT NULL,
  PRIMARY KEY (counter_name, idempotency_key)
);

CREATE TRIGGER IF NOT EXISTS trg_telemetry_ledger_no_update
BEFORE UPDATE ON telemetry_ledger
BEGIN
  SELECT RAISE(FAIL, 'telemetry_ledger is append-only');
END;

CREATE TRIGGER IF NOT EXISTS trg_telemetry_ledger_no_delete
BEFORE DELETE ON telemetry_ledger
BEGIN
  SELECT RAISE(FAIL, 'telemetry_ledger is append-only');
END;

CREATE TABLE IF NOT EXISTS skill_variations (
  variation_id TEXT PRIMARY KEY,
  skill TEXT NOT NULL,
  content_json TEXT NOT NULL,
  created_at TEXT NOT NULL,
  promoted INTEGER NOT NULL DEFAULT 0 CHECK (promoted IN (0, 1)),
  status TEXT NOT NULL CHECK (status IN ('pending', 'testing', 'promoted', 'archived')),
  updated_at TEXT NOT NULL,
  CHECK (NOT (promoted = 1 AND status IN ('pending', 'testing'))),
  CHECK (status <> 'promoted' OR promoted = 1)
);

CREATE TRIGGER IF NOT EXISTS trg_skill_variations_content_immutable
BEFORE UPDATE OF variation_id, skill, content_json, created_at ON skill_variations
BEGIN
  SELECT RAISE(FAIL, 'skill_variations content is immutable');
END;

CREATE TRIGGER IF NOT EXISTS trg_skill_variations_no_delete
BEFORE DELETE ON skill_variations
BEGIN
  SELECT RAISE(FAIL, 'skill_variations are never deleted');
END;

CREATE UNIQUE INDEX IF NOT EXISTS idx_skill_variations_one_production
  ON skill_variations(skill) WHERE status = 'promoted';
CREATE UNIQUE INDEX IF NOT EXISTS idx_skill_variations_one_testing
  ON skill_variations(skill) WHERE status = 'testing';

CREATE TABLE IF NOT EXISTS ab_test_assignments (
  assignment_id TEXT PRIMARY KEY,
  skill TEXT NOT NULL,
  control_variation TEXT NOT NULL REFERENCES skill_variations(variation_id),
  treatment_variation TEXT NOT NULL REFERENCES skill_variations(variation_id),
  started_at TEXT NOT NULL,
  ended_at TEXT,
  status TEXT NOT NULL CHECK (status IN ('running', 'concluded')),
  decision TEXT CHECK (
    decision IN ('promoted_treatment', 'archived_treatment', 'ceiling_reached') OR decision IS NULL
  ),
  control_trials INTEGER NOT NULL DEFAULT 0 CHECK (control_trials >= 0),
  control_successes INTEGER NOT NULL DEFAULT 0 CHECK (control_successes BETWEEN 0 AND control_trials),
  treatment_trials INTEGER NOT NULL DEFAULT 0 CHECK (treatment_trials >= 0),
  treatment_successes INTEGER NOT NULL DEFAULT 0 CHECK (treatment_successes BETWEEN 0 AND treatment_trials),
  sample_target INTEGER NOT NULL CHECK (sample_target >= 1),
  max_trials_per_arm INTEGER NOT NULL CHECK (max_trials_per_arm >= sample_target),
  deadline TEXT NOT NULL,
  CHECK (control_variation <> treatment_variation),
  CHECK ((status = 'concluded') = (decision IS NOT NULL))
);

CREATE TRIGGER IF NOT EXISTS trg_ab_test_assignments_monotonic
BEFORE UPDATE ON ab_test_assignments
WHEN OLD.status = 'concluded'
  OR NEW.control_trials < OLD.control_trials
  OR NEW.control_successes < OLD.control_successes
  OR NEW.treatment_trials < OLD.treatment_trials
  OR NEW.treatment_successes < OLD.treatment_successes
BEGIN
  SELECT RAISE(FAIL, 'ab_test_assignments counters only increase and concluded tests are frozen');
END;

CREATE TRIGGER IF NOT EXISTS trg_ab_test_assignments_no_delete
BEFORE DELETE ON ab_test_assignments
BEGIN
  SELECT RAISE(FAIL, 'ab_test_assignments are never deleted');
END;

CREATE UNIQUE INDEX IF NOT EXISTS idx_ab_test_assignments_one_running
  ON ab_test_assignments(skill) WHERE status = 'running';

CREATE TABLE IF NOT EXISTS retrieval_quality (
  retrieval_id TEXT PRIMARY KEY,
  execution_id TEXT NOT NULL,
  skill TEXT NOT NULL,
  query TEXT NOT NULL,
  result_count INTEGER NOT NULL CHECK (result_count >= 0),
  relevance REAL NOT NULL CHECK (relevance BETWEEN 0.0 AND 1.0),
  latency_ms INTEGER NOT NULL CHECK (latency_ms >= 0),
  used INTEGER NOT NULL CHECK (used IN (0, 1)),
  recorded_at TEXT NOT NULL
);

CREATE TRIGGER IF NOT EXISTS trg_retrieval_quality_no_update
BEFORE UPDATE ON retrieval_quality
BEGIN
  SELECT RAISE(FAIL, 'retrieval_quality is append-only');
END;

CREATE INDEX IF NOT EXISTS idx_retrieval_quality_skill
  ON retrieval_quality(skill, recorded_at);

CREATE TABLE IF NOT EXISTS skill_edges (
  edge_id TEXT PRIMARY KEY,
  source_skill TEXT NOT NULL,
  target_skill TEXT NOT NULL,
  edge_type TEXT NOT NULL CHECK (
    edge_type IN ('caused_by', 'improved_by', 'similar_to', 'depends_on')
  ),
  weight REAL NOT NULL CHECK (weight BETWEEN 0.0 AND 1.0),
  created_at TEXT NOT NULL,
  evidence TEXT NOT NULL,
  CHECK (source_skill <> target_skill)
);

CREATE TRIGGER IF NOT EXISTS trg_skill_edges_no_update
BEFORE UPDATE ON skill_edges
BEGIN
  SELECT RAISE(FAIL, 'skill_edges is append-only');
END;

CREATE INDEX IF NOT EXISTS idx_skill_edges_source_type
  ON skill_edges(source_skill, edge_type);

CREATE TABLE IF NOT EXISTS permission_events (
  event_seq INTEGER PRIMARY KEY AUTOINCREMENT,
  event_id TEXT NOT NULL UNIQUE,
  agent TEXT NOT NULL,
  event_kind TEXT NOT NULL CHECK (event_kind IN ('grant', 'downgrade', 'revoke', 'reapproval')),
  tier_from TEXT NOT NULL CHECK (
    tier_from IN ('read_only', 'metrics_write', 'edit_restricted', 'edit_unrestricted')
  ),
  tier TEXT NOT NULL CHECK (
    tier IN ('read_only', 'metrics_write', 'edit_restricted', 'edit_unrestricted')
  ),
  granted_at TEXT NOT NULL,
  granted_by TEXT NOT NULL,
  expires_at TEXT,
  confidence_at_grant REAL NOT NULL CHECK (confidence_at_grant BETWEEN 0.0 AND 1.0),
  allowlist_json TEXT NOT NULL DEFAULT '[]',
  evidence TEXT NOT NULL CHECK (length(trim(evidence)) > 0),
  signature TEXT NOT NULL,
  prev_event_hash TEXT,
  event_hash TEXT NOT NULL UNIQUE
);

CREATE TRIGGER IF NOT EXISTS trg_permission_events_no_update
BEFORE UPDATE ON permission_events
BEGIN
  SELECT RAISE(FAIL, 'permission_events is append-only');
END;

CREATE TRIGGER IF NOT EXISTS trg_permission_events_no_delete
BEFORE DELETE ON permission_events
BEGIN
  SELECT RAISE(FAIL, 'permission_events is append-only');
END;

CREATE INDEX IF NOT EXISTS idx_permission_events_agent_seq
  ON permission_events(agent, event_seq);

CREATE TABLE IF NOT EXISTS confidence_events (
  event_seq INTEGER PRIMARY KEY AUTOINCREMENT,
  event_id TEXT NOT NULL UNIQUE,
  agent TEXT NOT NULL,
  skill TEXT,
  kind TEXT NOT NULL CHECK (
    kind IN (
      'execution',
      'human_approval',
      'rollback',
      'contract_violation',
      'regression',
      'security_issue',
      'confirmed_detection',
      'false_positive'
    )
  ),
  success INTEGER NOT NULL CHECK (success IN (0, 1)),
  fidelity REAL CHECK (fidelity BETWEEN 0.0 AND 1.0 OR fidelity IS NULL),
  occurred_at TEXT NOT NULL,
  recorded_at TEXT NOT NULL,
  execution_id TEXT,
  evidence TEXT NOT NULL,
  UNIQUE (execution_id, kind)
);

CREATE TRIGGER IF NOT EXISTS trg_confidence_events_no_update
BEFORE UPDATE ON confidence_events
BEGIN
  SELECT RAISE(FAIL, 'confidence_events is append-only');
END;

CREATE TRIGGER IF NOT EXISTS trg_confidence_events_no_delete
BEFORE DELETE ON confidence_events
BEGIN
  SELECT RAISE(FAIL, 'confidence_events is append-only');
END;

CREATE INDEX IF NOT EXISTS idx_confidence_events_agent_seq
  ON confidence_events(agent, event_seq);

CREATE TABLE IF NOT EXISTS confidence_snapshots (
  snapshot_seq INTEGER PRIMARY KEY AUTOINCREMENT,
  agent TEXT NOT NULL,
  confidence REAL NOT NULL CHECK (confidence BETWEEN 0.0 AND 1.0),
  base_score REAL NOT NULL CHECK (base_score BETWEEN 0.0 AND 1.0),
  failure_multiplier REAL NOT NULL,
  recent_failures INTEGER NOT NULL CHECK (recent_failures >= 0),
  events_in_window INTEGER NOT NULL CHECK (events_in_window >= 0),
  ruleset_version INTEGER NOT NULL,
  computed_at TEXT NOT NULL,
  reason TEXT NOT NULL
);

CREATE TRIGGER IF NOT EXISTS trg_confidence_snapshots_no_update
BEFORE UPDATE ON confidence_snapshots
BEGIN
  SELECT RAISE(FAIL, 'confidence_snapshots is append-only');
END;

CREATE INDEX IF NOT EXISTS idx_confidence_snapshots_agent_seq
  ON confidence_snapshots(agent, snapshot_seq);
";

const EXECUTION_COLUMNS: &str = "execution_id, run_id, iteration, skill, agent, started_at,
    input_json, variation_id, success, fidelity, output_json, error, duration_ms";

const VARIATION_COLUMNS: &str = "variation_id, skill, content_json, created_at, promoted, status";

const ASSIGNMENT_COLUMNS: &str = "assignment_id, skill, control_variation, treatment_variation,
    started_at, ended_at, status, decision, control_trials, control_successes,
    treatment_trials, treatment_successes, sample_target, max_trials_per_arm, deadline";

const PERMISSION_COLUMNS: &str = "event_seq, event_id, agent, event_kind, tier_from, tier,
    granted_at, granted_by, expires_at, confidence_at_grant, allowlist_json, evidence,
    signature, prev_event_hash, event_hash";

const CONFIDENCE_COLUMNS: &str = "event_seq, event_id, agent, skill, kind, success, fidelity,
    occurred_at, recorded_at, execution_id, evidence";

const EDGE_COLUMNS: &str =
    "edge_id, source_skill, target_skill, edge_type, weight, created_at, evidence";

const RETRIEVAL_COLUMNS: &str = "retrieval_id, execution_id, skill, query, result_count,
    relevance, latency_ms, used, recorded_at";

pub struct SqliteSkillStore {
    conn: Connection,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct TelemetryCounter {
    pub name: String,
    pub value: i64,
    pub updated_at: String,
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Default)]
pub struct ExecutionStats {
    pub executions: u64,
    pub learning_successes: u64,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct ConfidenceSnapshot {
    pub snapshot_seq: i64,
    pub agent: String,
    pub confidence: f64,
    pub base_score: f64,
    pub failure_multiplier: f64,
    pub recent_failures: u32,
    pub events_in_window: u32,
    pub ruleset_version: u32,
    pub computed_at: OffsetDateTime,
    pub reason: String,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct TrialReport {
    pub recorded: bool,
    pub arm: Arm,
    pub verdict: Option<ExperimentVerdict>,
    pub decision: Option<AssignmentDecision>,
    pub assignment: AbAssignment,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct ChainVerification {
    pub agents_checked: usize,
    pub events_checked: usize,
    pub valid: bool,
    pub failures: Vec<String>,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct DashboardMetrics {
    pub retry_count: i64,
    pub total_executions: i64,
    pub runs_total: i64,
    pub variation_win_rate: Option<f64>,
    pub concluded_tests: u64,
    pub avg_fidelity_delta: Option<f64>,
    pub retrieval_coverage: Option<f64>,
    pub retrieval_events: u64,
    pub edge_count: u64,
    pub connected_skill_count: u64,
}

impl SqliteSkillStore {
    pub fn open(path: &Path) -> Result<Self> {
        let conn = Connection::open(path)
            .with_context(|| format!("failed to open sqlite database at {}", path.display()))?;

        conn.execute_batch(
            "PRAGMA journal_mode = WAL;
             PRAGMA foreign_keys = ON;
             PRAGMA busy_timeout = 5000;",
        )
        .context("failed to configure sqlite pragmas")?;

        Ok(Self { conn })
    }

    pub fn migrate(&self) -> Result<()> {
        self.conn
            .execute_batch(
                "CREATE TABLE IF NOT EXISTS schema_migrations (
                    version INTEGER PRIMARY KEY,
                    applied_at TEXT NOT NULL
                );",
            )
            .context("failed to ensure schema_migrations exists")?;

        self.conn
            .execute_batch(SCHEMA_SKILL_KERNEL_V1)
            .context("failed to apply skill kernel schema")?;

        let now = sql_time(now_utc())?;
        self.conn
            .execute(
                "INSERT OR IGNORE INTO schema_migrations(version, applied_at) VALUES (?1, ?2)",
                params![SKILL_KERNEL_MIGRATION_VERSION, now],
            )
            .context("failed to register skill kernel schema migration")?;

        Ok(())
    }

    /// Inserts a sealed execution and counts it toward `total_executions`.
    /// Re-sealing an identical outcome is a no-op returning `false`; a
    /// different outcome under the same id is an integrity violation.
    pub fn seal_execution(&mut self, record: &ExecutionRecord) -> Result<bool> {
        record
            .validate()
            .map_err(|err| anyhow!("execution validation failed: {err}"))?;

        let now = sql_time(now_utc())?;
        let tx = self
            .conn
            .transaction_with_behavior(TransactionBehavior::Immediate)
            .context("failed to start execution transaction")?;

        let existing: Option<(i64, f64)> = tx
            .query_row(
                "SELECT success, fidelity FROM executions WHERE execution_id = ?1",
                params![record.execution_id.to_string()],
                |row| Ok((row.get(0)?, row.get(1)?)),
            )
            .optional()
            .context("failed to look up execution")?;

        if let Some((success, fidelity)) = existing {
            let same = (success == 1) == record.outcome.success
                && (fidelity - record.outcome.fidelity).abs() < f64::EPSILON;
            if !same {
                return Err(KernelError::IntegrityViolation(format!(
                    "execution {} is already sealed with a different outcome",
                    record.execution_id
                ))
                .into());
            }
            return Ok(false);
        }

        tx.execute(
            "INSERT INTO executions(
                execution_id, run_id, iteration, skill, agent, started_at,
                input_json, variation_id, success, fidelity, output_json, error,
                duration_ms, sealed_at
             ) VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?10, ?11, ?12, ?13, ?14)",
            params![
                record.execution_id.to_string(),
                record.run_id.to_string(),
                i64::from(record.iteration),
                record.skill,
                record.agent,
                sql_time(record.started_at)?,
                serde_json::to_string(&record.input_snapshot)
                    .context("failed to serialize input snapshot")?,
                record.variation_id.map(|id| id.to_string()),
                bool_to_sql(record.outcome.success),
                record.outcome.fidelity,
                serde_json::to_string(&record.outcome.output)
                    .context("failed to serialize execution output")?,
                record.outcome.error,
                i64::try_from(record.duration_ms).unwrap_or(i64::MAX),
                now,
            ],
        )
        .context("failed to insert sealed execution")?;

        apply_counter_increment(
            &tx,
            COUNTER_TOTAL_EXECUTIONS,
            1,
            &record.execution_id.to_string(),
            &now,
        )?;

        tx.commit().context("failed to commit execution transaction")?;
        Ok(true)
    }

    pub fn get_execution(&self, execution_id: ExecutionId) -> Result<Option<ExecutionRecord>> {
        self.conn
            .query_row(
                &format!("SELECT {EXECUTION_COLUMNS} FROM executions WHERE execution_id = ?1"),
                params![execution_id.to_string()],
                parse_execution_row,
            )
            .optional()
            .context("failed to load execution")
    }

    pub fn list_executions_for_run(&self, run_id: RunId) -> Result<Vec<ExecutionRecord>> {
        let mut stmt = self.conn.prepare(&format!(
            "SELECT {EXECUTION_COLUMNS} FROM executions WHERE run_id = ?1 ORDER BY iteration ASC"
        ))?;
        let rows = stmt.query_map(params![run_id.to_string()], parse_execution_row)?;
        collect_rows(rows)
    }

    /// Highest-fidelity learning successes for a skill, best first.
    pub fn best_executions_for_skill(
        &self,
        skill: &str,
        min_fidelity: f64,
        limit: usize,
    ) -> Result<Vec<ExecutionRecord>> {
        let mut stmt = self.conn.prepare(&format!(
            "SELECT {EXECUTION_COLUMNS} FROM executions
             WHERE skill = ?1 AND success = 1 AND fidelity >= ?2
             ORDER BY fidelity DESC, execution_seq ASC
             LIMIT ?3"
        ))?;
        let rows = stmt.query_map(
            params![skill, min_fidelity, i64::try_from(limit).unwrap_or(i64::MAX)],
            parse_execution_row,
        )?;
        collect_rows(rows)
    }

    /// Execution and learning-success counts for an agent, optionally only
    /// those started at or after `since`.
    pub fn agent_execution_stats(
        &self,
        agent: &str,
        since: Option<OffsetDateTime>,
    ) -> Result<ExecutionStats> {
        let mut stmt = self.conn.prepare(
            "SELECT started_at, success, fidelity FROM executions
             WHERE agent = ?1 ORDER BY execution_seq ASC",
        )?;
        let rows = stmt.query_map(params![agent], |row| {
            let started_at = time_column(row, 0)?;
            let success: i64 = row.get(1)?;
            let fidelity: f64 = row.get(2)?;
            Ok((started_at, success == 1 && fidelity >= LEARNING_SUCCESS_FIDELITY))
        })?;

        let mut stats = ExecutionStats::default();
        for (started_at, learning_success) in collect_rows(rows)? {
            if since.is_some_and(|since| started_at < since) {
                continue;
            }
            stats.executions += 1;
            if learning_success {
                stats.learning_successes += 1;
            }
        }
        Ok(stats)
    }

    /// Re-applies the `total_executions` increment for a sealed execution.
    /// Returns `false` when the ledger already holds it.
    pub fn replay_execution_telemetry(&mut self, execution_id: ExecutionId) -> Result<bool> {
        if self.get_execution(execution_id)?.is_none() {
            return Err(anyhow!("execution {execution_id} is not sealed"));
        }
        let now = sql_time(now_utc())?;
        let tx = self
            .conn
            .transaction_with_behavior(TransactionBehavior::Immediate)
            .context("failed to start telemetry replay transaction")?;
        let applied = apply_counter_increment(
            &tx,
            COUNTER_TOTAL_EXECUTIONS,
            1,
            &execution_id.to_string(),
            &now,
        )?;
        tx.commit()
            .context("failed to commit telemetry replay transaction")?;
        Ok(applied)
    }

    /// Records a finished run: `retry_count += iterations - 1` and
    /// `runs_total += 1`, both keyed by run id.
    pub fn record_run_completion(&mut self, run_id: RunId, iterations: u32) -> Result<bool> {
        let now = sql_time(now_utc())?;
        let key = run_id.to_string();
        let tx = self
            .conn
            .transaction_with_behavior(TransactionBehavior::Immediate)
            .context("failed to start run completion transaction")?;
        let applied = apply_counter_increment(&tx, COUNTER_RUNS_TOTAL, 1, &key, &now)?;
        apply_counter_increment(
            &tx,
            COUNTER_RETRY_COUNT,
            i64::from(iterations.saturating_sub(1)),
            &key,
            &now,
        )?;
        tx.commit()
            .context("failed to commit run completion transaction")?;
        Ok(applied)
    }

    pub fn increment_counter(&mut self, name: &str, delta: i64, idempotency_key: &str) -> Result<bool> {
        if delta < 0 {
            return Err(KernelError::IntegrityViolation(format!(
                "counter {name} cannot decrease"
            ))
            .into());
        }
        let now = sql_time(now_utc())?;
        let tx = self
            .conn
            .transaction_with_behavior(TransactionBehavior::Immediate)
            .context("failed to start counter transaction")?;
        let applied = apply_counter_increment(&tx, name, delta, idempotency_key, &now)?;
        tx.commit().context("failed to commit counter transaction")?;
        Ok(applied)
    }

    pub fn get_counter(&self, name: &str) -> Result<i64> {
        let value: Option<i64> = self
            .conn
            .query_row(
                "SELECT value FROM telemetry_counters WHERE name = ?1",
                params![name],
                |row| row.get(0),
            )
            .optional()
            .context("failed to read telemetry counter")?;
        Ok(value.unwrap_or(0))
    }

    pub fn list_counters(&self) -> Result<Vec<TelemetryCounter>> {
        let mut stmt = self
            .conn
            .prepare("SELECT name, value, updated_at FROM telemetry_counters ORDER BY name ASC")?;
        let rows = stmt.query_map([], |row| {
            Ok(TelemetryCounter {
                name: row.get(0)?,
                value: row.get(1)?,
                updated_at: row.get(2)?,
            })
        })?;
        collect_rows(rows)
    }

    /// Appends a confidence event. Returns `None` when the same
    /// `(execution_id, kind)` was already recorded.
    pub fn append_confidence_event(
        &mut self,
        input: &ConfidenceEventInput,
    ) -> Result<Option<ConfidenceEvent>> {
        input
            .validate()
            .map_err(|err| anyhow!("confidence event validation failed: {err}"))?;

        let event_id = Ulid::new();
        let recorded_at = now_utc();
        let inserted = self
            .conn
            .execute(
                "INSERT INTO confidence_events(
                    event_id, agent, skill, kind, success, fidelity,
                    occurred_at, recorded_at, execution_id, evidence
                 ) VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?10)
                 ON CONFLICT(execution_id, kind) DO NOTHING",
                params![
                    event_id.to_string(),
                    input.agent,
                    input.skill,
                    input.kind.as_str(),
                    bool_to_sql(input.success),
                    input.fidelity,
                    sql_time(input.occurred_at)?,
                    sql_time(recorded_at)?,
                    input.execution_id.map(|id| id.to_string()),
                    input.evidence,
                ],
            )
            .context("failed to append confidence event")?;

        if inserted == 0 {
            return Ok(None);
        }

        Ok(Some(ConfidenceEvent {
            event_seq: self.conn.last_insert_rowid(),
            event_id,
            agent: input.agent.clone(),
            skill: input.skill.clone(),
            kind: input.kind,
            success: input.success,
            fidelity: input.fidelity,
            occurred_at: input.occurred_at,
            recorded_at,
            execution_id: input.execution_id,
            evidence: input.evidence.clone(),
        }))
    }

    pub fn list_confidence_events(
        &self,
        agent: &str,
        since: Option<OffsetDateTime>,
    ) -> Result<Vec<ConfidenceEvent>> {
        let mut stmt = self.conn.prepare(&format!(
            "SELECT {CONFIDENCE_COLUMNS} FROM confidence_events
             WHERE agent = ?1 ORDER BY event_seq ASC"
        ))?;
        let rows = stmt.query_map(params![agent], parse_confidence_row)?;
        let events = collect_rows(rows)?;
        Ok(match since {
            Some(since) => events
                .into_iter()
                .filter(|event| event.occurred_at >= since)
                .collect(),
            None => events,
        })
    }

    pub fn count_confidence_events(&self, agent: &str, kind: ConfidenceEventKind) -> Result<u64> {
        let count: i64 = self
            .conn
            .query_row(
                "SELECT COUNT(*) FROM confidence_events WHERE agent = ?1 AND kind = ?2",
                params![agent, kind.as_str()],
                |row| row.get(0),
            )
            .context("failed to count confidence events")?;
        Ok(u64::try_from(count).unwrap_or(0))
    }

    pub fn record_confidence_snapshot(
        &mut self,
        agent: &str,
        breakdown: &ConfidenceBreakdown,
        computed_at: OffsetDateTime,
        reason: &str,
    ) -> Result<ConfidenceSnapshot> {
        self.conn
            .execute(
                "INSERT INTO confidence_snapshots(
                    agent, confidence, base_score, failure_multiplier, recent_failures,
                    events_in_window, ruleset_version, computed_at, reason
                 ) VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9)",
                params![
                    agent,
                    breakdown.confidence,
                    breakdown.base_score,
                    breakdown.failure_multiplier,
                    i64::from(breakdown.recent_failures),
                    i64::from(breakdown.events_in_window),
                    i64::from(breakdown.ruleset_version),
                    sql_time(computed_at)?,
                    reason,
                ],
            )
            .context("failed to record confidence snapshot")?;

        Ok(ConfidenceSnapshot {
            snapshot_seq: self.conn.last_insert_rowid(),
            agent: agent.to_string(),
            confidence: breakdown.confidence,
            base_score: breakdown.base_score,
            failure_multiplier: breakdown.failure_multiplier,
            recent_failures: breakdown.recent_failures,
            events_in_window: breakdown.events_in_window,
            ruleset_version: breakdown.ruleset_version,
            computed_at,
            reason: reason.to_string(),
        })
    }

    pub fn list_confidence_snapshots(
        &self,
        agent: &str,
        since: Option<OffsetDateTime>,
    ) -> Result<Vec<ConfidenceSnapshot>> {
        let mut stmt = self.conn.prepare(
            "SELECT snapshot_seq, agent, confidence, base_score, failure_multiplier,
                    recent_failures, events_in_window, ruleset_version, computed_at, reason
             FROM confidence_snapshots WHERE agent = ?1 ORDER BY snapshot_seq ASC",
        )?;
        let rows = stmt.query_map(params![agent], |row| {
            Ok(ConfidenceSnapshot {
                snapshot_seq: row.get(0)?,
                agent: row.get(1)?,
                confidence: row.get(2)?,
                base_score: row.get(3)?,
                failure_multiplier: row.get(4)?,
                recent_failures: u32_column(row, 5)?,
                events_in_window: u32_column(row, 6)?,
                ruleset_version: u32_column(row, 7)?,
                computed_at: time_column(row, 8)?,
                reason: row.get(9)?,
            })
        })?;
        let snapshots = collect_rows(rows)?;
        Ok(match since {
            Some(since) => snapshots
                .into_iter()
                .filter(|snapshot| snapshot.computed_at >= since)
                .collect(),
            None => snapshots,
        })
    }

    pub fn register_variation(&mut self, skill: &str, content: &Value) -> Result<Variation> {
        skill_kernel_core::ensure_non_empty("skill", skill)
            .map_err(|err| anyhow!("variation validation failed: {err}"))?;

        let variation = Variation {
            variation_id: VariationId::new(),
            skill: skill.to_string(),
            content: content.clone(),
            created_at: now_utc(),
            promoted: false,
            status: VariationStatus::Pending,
        };
        let created_at = sql_time(variation.created_at)?;
        self.conn
            .execute(
                "INSERT INTO skill_variations(
                    variation_id, skill, content_json, created_at, promoted, status, updated_at
                 ) VALUES (?1, ?2, ?3, ?4, 0, 'pending', ?4)",
                params![
                    variation.variation_id.to_string(),
                    variation.skill,
                    serde_json::to_string(content).context("failed to serialize variation")?,
                    created_at,
                ],
            )
            .context("failed to register variation")?;
        Ok(variation)
    }

    pub fn get_variation(&self, variation_id: VariationId) -> Result<Option<Variation>> {
        load_variation(&self.conn, variation_id)
    }

    pub fn list_variations(&self, skill: &str) -> Result<Vec<Variation>> {
        let mut stmt = self.conn.prepare(&format!(
            "SELECT {VARIATION_COLUMNS} FROM skill_variations
             WHERE skill = ?1 ORDER BY created_at ASC, variation_id ASC"
        ))?;
        let rows = stmt.query_map(params![skill], parse_variation_row)?;
        collect_rows(rows)
    }

    pub fn production_variation(&self, skill: &str) -> Result<Option<Variation>> {
        load_production_variation(&self.conn, skill)
    }

    /// Makes a pending variation the first production variant of its skill.
    pub fn adopt_baseline(&mut self, variation_id: VariationId) -> Result<Variation> {
        let now = sql_time(now_utc())?;
        let tx = self
            .conn
            .transaction_with_behavior(TransactionBehavior::Immediate)
            .context("failed to start baseline transaction")?;

        let variation = load_variation(&tx, variation_id)?
            .ok_or_else(|| anyhow!("variation {variation_id} not found"))?;
        if variation.status != VariationStatus::Pending {
            return Err(KernelError::IntegrityViolation(format!(
                "variation {variation_id} is {} and cannot be adopted as baseline",
                variation.status.as_str()
            ))
            .into());
        }
        if let Some(production) = load_production_variation(&tx, &variation.skill)? {
            return Err(KernelError::IntegrityViolation(format!(
                "skill {} already has production variation {}",
                variation.skill, production.variation_id
            ))
            .into());
        }

        tx.execute(
            "UPDATE skill_variations SET status = 'promoted', promoted = 1, updated_at = ?2
             WHERE variation_id = ?1",
            params![variation_id.to_string(), now],
        )
        .context("failed to adopt baseline variation")?;
        tx.commit().context("failed to commit baseline transaction")?;

        Ok(Variation {
            promoted: true,
            status: VariationStatus::Promoted,
            ..variation
        })
    }

    pub fn archive_variation(&mut self, variation_id: VariationId) -> Result<Variation> {
        let now = sql_time(now_utc())?;
        let tx = self
            .conn
            .transaction_with_behavior(TransactionBehavior::Immediate)
            .context("failed to start archive transaction")?;
        let running = running_assignment_touching(&tx, variation_id)?;
        if let Some(assignment_id) = running {
            return Err(KernelError::IntegrityViolation(format!(
                "variation {variation_id} is part of running test {assignment_id}"
            ))
            .into());
        }
        let archived = transition_variation(&tx, variation_id, VariationStatus::Archived, &now)?;
        tx.commit().context("failed to commit archive transaction")?;
        Ok(archived)
    }

    /// Opens an A/B test between the skill's production variant and a
    /// pending treatment.
    pub fn schedule_test(
        &mut self,
        skill: &str,
        control: VariationId,
        treatment: VariationId,
        sample_target: u32,
        config: &ExperimentConfig,
        started_at: OffsetDateTime,
    ) -> Result<AbAssignment> {
        if sample_target == 0 {
            return Err(anyhow!("sample_target MUST be >= 1"));
        }

        let now = sql_time(started_at)?;
        let tx = self
            .conn
            .transaction_with_behavior(TransactionBehavior::Immediate)
            .context("failed to start schedule transaction")?;

        if let Some(existing) = load_running_assignment(&tx, skill)? {
            return Err(KernelError::IntegrityViolation(format!(
                "skill {skill} already has running test {}",
                existing.assignment_id
            ))
            .into());
        }

        let production = load_production_variation(&tx, skill)?;
        if production.as_ref().map(|variation| variation.variation_id) != Some(control) {
            return Err(KernelError::IntegrityViolation(format!(
                "control {control} is not the production variation of {skill}"
            ))
            .into());
        }

        let treatment_variation = load_variation(&tx, treatment)?
            .ok_or_else(|| anyhow!("variation {treatment} not found"))?;
        if treatment_variation.skill != skill {
            return Err(KernelError::IntegrityViolation(format!(
                "treatment {treatment} belongs to skill {}",
                treatment_variation.skill
            ))
            .into());
        }
        transition_variation(&tx, treatment, VariationStatus::Testing, &now)?;

        let assignment = AbAssignment {
            assignment_id: AssignmentId::new(),
            skill: skill.to_string(),
            control_variation: control,
            treatment_variation: treatment,
            started_at,
            ended_at: None,
            status: AssignmentStatus::Running,
            decision: None,
            control_trials: 0,
            control_successes: 0,
            treatment_trials: 0,
            treatment_successes: 0,
            sample_target,
            max_trials_per_arm: config.max_trials_per_arm(sample_target),
            deadline: config.deadline(started_at),
        };

        tx.execute(
            "INSERT INTO ab_test_assignments(
                assignment_id, skill, control_variation, treatment_variation, started_at,
                status, sample_target, max_trials_per_arm, deadline
             ) VALUES (?1, ?2, ?3, ?4, ?5, 'running', ?6, ?7, ?8)",
            params![
                assignment.assignment_id.to_string(),
                assignment.skill,
                control.to_string(),
                treatment.to_string(),
                now,
                i64::from(sample_target),
                i64::from(assignment.max_trials_per_arm),
                sql_time(assignment.deadline)?,
            ],
        )
        .context("failed to insert ab test assignment")?;
        tx.commit().context("failed to commit schedule transaction")?;

        tracing::info!(
            skill,
            assignment_id = %assignment.assignment_id,
            sample_target,
            "scheduled variation test"
        );
        Ok(assignment)
    }

    pub fn running_assignment(&self, skill: &str) -> Result<Option<AbAssignment>> {
        load_running_assignment(&self.conn, skill)
    }

    pub fn get_assignment(&self, assignment_id: AssignmentId) -> Result<Option<AbAssignment>> {
        load_assignment(&self.conn, assignment_id)
    }

    pub fn list_assignments(&self, skill: Option<&str>) -> Result<Vec<AbAssignment>> {
        let mut stmt = self.conn.prepare(&format!(
            "SELECT {ASSIGNMENT_COLUMNS} FROM ab_test_assignments
             WHERE (?1 IS NULL OR skill = ?1)
             ORDER BY started_at ASC, assignment_id ASC"
        ))?;
        let rows = stmt.query_map(params![skill], parse_assignment_row)?;
        collect_rows(rows)
    }

    /// Counts one trial for `arm`, then decides and applies the outcome to
    /// the variation store, all in one immediate transaction. A trial that
    /// arrives after the test concluded is dropped (`recorded = false`).
    pub fn record_trial(
        &mut self,
        assignment_id: AssignmentId,
        arm: Arm,
        success: bool,
        config: &ExperimentConfig,
        as_of: OffsetDateTime,
    ) -> Result<TrialReport> {
        let now = sql_time(as_of)?;
        let tx = self
            .conn
            .transaction_with_behavior(TransactionBehavior::Immediate)
            .context("failed to start trial transaction")?;

        let mut assignment = load_assignment(&tx, assignment_id)?
            .ok_or_else(|| anyhow!("assignment {assignment_id} not found"))?;

        if assignment.status == AssignmentStatus::Concluded {
            tx.commit().context("failed to close trial transaction")?;
            return Ok(TrialReport {
                recorded: false,
                arm,
                verdict: None,
                decision: assignment.decision,
                assignment,
            });
        }

        let successes = u32::from(success);
        match arm {
            Arm::Control => {
                assignment.control_trials = assignment.control_trials.saturating_add(1);
                assignment.control_successes =
                    assignment.control_successes.saturating_add(successes);
            }
            Arm::Treatment => {
                assignment.treatment_trials = assignment.treatment_trials.saturating_add(1);
                assignment.treatment_successes =
                    assignment.treatment_successes.saturating_add(successes);
            }
        }

        let verdict = evaluate_assignment(&assignment, config, as_of);
        let decision = verdict.decision();
        if let Some(decision) = decision {
            assignment.status = AssignmentStatus::Concluded;
            assignment.decision = Some(decision);
            assignment.ended_at = Some(as_of);
        }

        tx.execute(
            "UPDATE ab_test_assignments SET
                control_trials = ?2, control_successes = ?3,
                treatment_trials = ?4, treatment_successes = ?5,
                status = ?6, decision = ?7, ended_at = ?8
             WHERE assignment_id = ?1",
            params![
                assignment_id.to_string(),
                i64::from(assignment.control_trials),
                i64::from(assignment.control_successes),
                i64::from(assignment.treatment_trials),
                i64::from(assignment.treatment_successes),
                assignment.status.as_str(),
                assignment.decision.map(AssignmentDecision::as_str),
                assignment.ended_at.map(sql_time).transpose()?,
            ],
        )
        .context("failed to update ab test counters")?;

        match decision {
            Some(AssignmentDecision::PromotedTreatment) => {
                transition_variation(
                    &tx,
                    assignment.control_variation,
                    VariationStatus::Archived,
                    &now,
                )?;
                transition_variation(
                    &tx,
                    assignment.treatment_variation,
                    VariationStatus::Promoted,
                    &now,
                )?;
            }
            Some(AssignmentDecision::ArchivedTreatment | AssignmentDecision::CeilingReached) => {
                transition_variation(
                    &tx,
                    assignment.treatment_variation,
                    VariationStatus::Archived,
                    &now,
                )?;
            }
            None => {}
        }

        tx.commit().context("failed to commit trial transaction")?;

        if let Some(decision) = decision {
            tracing::info!(
                skill = %assignment.skill,
                assignment_id = %assignment.assignment_id,
                decision = decision.as_str(),
                margin = assignment.margin(),
                control_trials = assignment.control_trials,
                treatment_trials = assignment.treatment_trials,
                "variation test concluded"
            );
        }

        Ok(TrialReport {
            recorded: true,
            arm,
            verdict: Some(verdict),
            decision,
            assignment,
        })
    }

    pub fn record_retrieval_event(&mut self, event: &RetrievalEvent) -> Result<()> {
        if !(0.0..=1.0).contains(&event.relevance) {
            return Err(anyhow!("relevance MUST be in [0.0, 1.0]"));
        }
        self.conn
            .execute(
                "INSERT INTO retrieval_quality(
                    retrieval_id, execution_id, skill, query, result_count,
                    relevance, latency_ms, used, recorded_at
                 ) VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9)",
                params![
                    event.retrieval_id.to_string(),
                    event.execution_id.to_string(),
                    event.skill,
                    event.query,
                    i64::from(event.result_count),
                    event.relevance,
                    i64::try_from(event.latency_ms).unwrap_or(i64::MAX),
                    bool_to_sql(event.used),
                    sql_time(event.recorded_at)?,
                ],
            )
            .context("failed to record retrieval event")?;
        Ok(())
    }

    pub fn list_retrieval_events(&self, skill: Option<&str>) -> Result<Vec<RetrievalEvent>> {
        let mut stmt = self.conn.prepare(&format!(
            "SELECT {RETRIEVAL_COLUMNS} FROM retrieval_quality
             WHERE (?1 IS NULL OR skill = ?1)
             ORDER BY rowid ASC"
        ))?;
        let rows = stmt.query_map(params![skill], parse_retrieval_row)?;
        collect_rows(rows)
    }

    pub fn add_edge(&mut self, input: &SkillEdgeInput) -> Result<SkillEdge> {
        input
            .validate()
            .map_err(|err| anyhow!("edge validation failed: {err}"))?;

        let edge = SkillEdge {
            edge_id: Ulid::new(),
            source_skill: input.source_skill.clone(),
            target_skill: input.target_skill.clone(),
            edge_type: input.edge_type,
            weight: input.weight,
            created_at: now_utc(),
            evidence: input.evidence.clone(),
        };
        self.conn
            .execute(
                "INSERT INTO skill_edges(
                    edge_id, source_skill, target_skill, edge_type, weight, created_at, evidence
                 ) VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7)",
                params![
                    edge.edge_id.to_string(),
                    edge.source_skill,
                    edge.target_skill,
                    edge.edge_type.as_str(),
                    edge.weight,
                    sql_time(edge.created_at)?,
                    edge.evidence,
                ],
            )
            .context("failed to insert skill edge")?;
        Ok(edge)
    }

    /// Outgoing edges of `skill`, filtered by type (empty = any) and minimum
    /// weight, heaviest first.
    pub fn edges_from(
        &self,
        skill: &str,
        edge_types: &[EdgeType],
        min_weight: f64,
    ) -> Result<Vec<SkillEdge>> {
        let mut stmt = self.conn.prepare(&format!(
            "SELECT {EDGE_COLUMNS} FROM skill_edges
             WHERE source_skill = ?1 AND weight >= ?2
             ORDER BY weight DESC, created_at ASC, edge_id ASC"
        ))?;
        let rows = stmt.query_map(params![skill, min_weight], parse_edge_row)?;
        let edges = collect_rows(rows)?;
        Ok(edges
            .into_iter()
            .filter(|edge| edge_types.is_empty() || edge_types.contains(&edge.edge_type))
            .collect())
    }

    pub fn edge_exists(&self, source: &str, target: &str, edge_type: EdgeType) -> Result<bool> {
        let found: Option<i64> = self
            .conn
            .query_row(
                "SELECT 1 FROM skill_edges
                 WHERE source_skill = ?1 AND target_skill = ?2 AND edge_type = ?3
                 LIMIT 1",
                params![source, target, edge_type.as_str()],
                |row| row.get(0),
            )
            .optional()
            .context("failed to look up skill edge")?;
        Ok(found.is_some())
    }

    pub fn append_permission_event(
        &mut self,
        input: &PermissionRecordInput,
    ) -> Result<PermissionRecord> {
        input.validate().map_err(anyhow::Error::new)?;

        let tx = self
            .conn
            .transaction_with_behavior(TransactionBehavior::Immediate)
            .context("failed to start permission transaction")?;

        let latest = load_latest_permission_event(&tx, &input.agent)?;
        let in_force = current_tier(latest.as_ref(), input.granted_at);
        if in_force != input.tier_from {
            return Err(KernelError::IntegrityViolation(format!(
                "{} for {} starts from {} but the tier in force is {in_force}",
                input.event_kind.as_str(),
                input.agent,
                input.tier_from
            ))
            .into());
        }

        let signature =
            permission_signature(&input.agent, input.tier, &input.granted_by, input.granted_at)
                .map_err(anyhow::Error::new)?;
        let prev_event_hash = latest.map(|record| record.event_hash);
        let event_hash =
            permission_chain_hash(prev_event_hash.as_deref(), &signature, &input.evidence);
        let event_id = Ulid::new();

        tx.execute(
            "INSERT INTO permission_events(
                event_id, agent, event_kind, tier_from, tier, granted_at, granted_by,
                expires_at, confidence_at_grant, allowlist_json, evidence, signature,
                prev_event_hash, event_hash
             ) VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?10, ?11, ?12, ?13, ?14)",
            params![
                event_id.to_string(),
                input.agent,
                input.event_kind.as_str(),
                input.tier_from.as_str(),
                input.tier.as_str(),
                sql_time(input.granted_at)?,
                input.granted_by,
                input.expires_at.map(sql_time).transpose()?,
                input.confidence_at_grant,
                serde_json::to_string(&input.allowlist).context("failed to serialize allowlist")?,
                input.evidence,
                signature,
                prev_event_hash,
                event_hash,
            ],
        )
        .context("failed to append permission event")?;

        let event_seq = tx.last_insert_rowid();
        tx.commit()
            .context("failed to commit permission transaction")?;

        Ok(PermissionRecord {
            event_seq,
            event_id,
            agent: input.agent.clone(),
            event_kind: input.event_kind,
            tier_from: input.tier_from,
            tier: input.tier,
            granted_at: input.granted_at,
            granted_by: input.granted_by.clone(),
            expires_at: input.expires_at,
            confidence_at_grant: input.confidence_at_grant,
            allowlist: input.allowlist.clone(),
            evidence: input.evidence.clone(),
            signature,
            prev_event_hash,
            event_hash,
        })
    }

    pub fn latest_permission_event(&self, agent: &str) -> Result<Option<PermissionRecord>> {
        load_latest_permission_event(&self.conn, agent)
    }

    pub fn list_permission_events(
        &self,
        agent: &str,
        since: Option<OffsetDateTime>,
    ) -> Result<Vec<PermissionRecord>> {
        let mut stmt = self.conn.prepare(&format!(
            "SELECT {PERMISSION_COLUMNS} FROM permission_events
             WHERE agent = ?1 ORDER BY event_seq ASC"
        ))?;
        let rows = stmt.query_map(params![agent], parse_permission_row)?;
        let records = collect_rows(rows)?;
        Ok(match since {
            Some(since) => records
                .into_iter()
                .filter(|record| record.granted_at >= since)
                .collect(),
            None => records,
        })
    }

    pub fn list_agents(&self) -> Result<Vec<String>> {
        let mut stmt = self.conn.prepare(
            "SELECT agent FROM permission_events
             UNION SELECT agent FROM confidence_events
             UNION SELECT agent FROM executions
             ORDER BY agent ASC",
        )?;
        let rows = stmt.query_map([], |row| row.get::<_, String>(0))?;
        collect_rows(rows)
    }

    /// Recomputes every signature and chain link. `agent = None` checks all.
    pub fn verify_permission_chain(&self, agent: Option<&str>) -> Result<ChainVerification> {
        let agents = match agent {
            Some(agent) => vec![agent.to_string()],
            None => {
                let mut stmt = self
                    .conn
                    .prepare("SELECT DISTINCT agent FROM permission_events ORDER BY agent ASC")?;
                let rows = stmt.query_map([], |row| row.get::<_, String>(0))?;
                collect_rows(rows)?
            }
        };

        let mut failures = Vec::new();
        let mut events_checked = 0_usize;
        for agent in &agents {
            let mut expected_prev: Option<String> = None;
            for record in self.list_permission_events(agent, None)? {
                events_checked += 1;
                let label = format!("{agent}#{}", record.event_seq);

                if record.prev_event_hash != expected_prev {
                    failures.push(format!("{label}: prev_event_hash does not link"));
                }
                let signature = permission_signature(
                    &record.agent,
                    record.tier,
                    &record.granted_by,
                    record.granted_at,
                )
                .map_err(anyhow::Error::new)?;
                if signature != record.signature {
                    failures.push(format!("{label}: signature mismatch"));
                }
                let recomputed = permission_chain_hash(
                    record.prev_event_hash.as_deref(),
                    &record.signature,
                    &record.evidence,
                );
                if recomputed != record.event_hash {
                    failures.push(format!("{label}: event_hash mismatch"));
                }
                expected_prev = Some(record.event_hash);
            }
        }

        Ok(ChainVerification {
            agents_checked: agents.len(),
            events_checked,
            valid: failures.is_empty(),
            failures,
        })
    }

    pub fn dashboard_metrics(&self, min_relevance: f64) -> Result<DashboardMetrics> {
        let (concluded, promoted): (i64, i64) = self
            .conn
            .query_row(
                "SELECT COUNT(*), COALESCE(SUM(decision = 'promoted_treatment'), 0)
                 FROM ab_test_assignments WHERE status = 'concluded'",
                [],
                |row| Ok((row.get(0)?, row.get(1)?)),
            )
            .context("failed to aggregate ab test decisions")?;

        let avg_fidelity_delta: Option<f64> = self
            .conn
            .query_row(
                "SELECT AVG(last_exec.fidelity - first_exec.fidelity)
                 FROM (
                   SELECT run_id, MIN(iteration) AS first_iteration, MAX(iteration) AS last_iteration
                   FROM executions GROUP BY run_id
                 ) AS runs
                 JOIN executions AS first_exec
                   ON first_exec.run_id = runs.run_id AND first_exec.iteration = runs.first_iteration
                 JOIN executions AS last_exec
                   ON last_exec.run_id = runs.run_id AND last_exec.iteration = runs.last_iteration",
                [],
                |row| row.get(0),
            )
            .context("failed to aggregate fidelity deltas")?;

        let (retrieval_total, retrieval_relevant): (i64, i64) = self
            .conn
            .query_row(
                "SELECT COUNT(*), COALESCE(SUM(relevance >= ?1), 0) FROM retrieval_quality",
                params![min_relevance],
                |row| Ok((row.get(0)?, row.get(1)?)),
            )
            .context("failed to aggregate retrieval coverage")?;

        let edge_count: i64 = self
            .conn
            .query_row("SELECT COUNT(*) FROM skill_edges", [], |row| row.get(0))
            .context("failed to count skill edges")?;

        let connected_skill_count: i64 = self
            .conn
            .query_row(
                "SELECT COUNT(*) FROM (
                   SELECT source_skill AS skill FROM skill_edges
                   UNION SELECT target_skill FROM skill_edges
                 )",
                [],
                |row| row.get(0),
            )
            .context("failed to count connected skills")?;

        #[allow(clippy::cast_precision_loss)]
        let ratio = |numerator: i64, denominator: i64| {
            (denominator > 0).then(|| numerator as f64 / denominator as f64)
        };

        Ok(DashboardMetrics {
            retry_count: self.get_counter(COUNTER_RETRY_COUNT)?,
            total_executions: self.get_counter(COUNTER_TOTAL_EXECUTIONS)?,
            runs_total: self.get_counter(COUNTER_RUNS_TOTAL)?,
            variation_win_rate: ratio(promoted, concluded),
            concluded_tests: u64::try_from(concluded).unwrap_or(0),
            avg_fidelity_delta,
            retrieval_coverage: ratio(retrieval_relevant, retrieval_total),
            retrieval_events: u64::try_from(retrieval_total).unwrap_or(0),
            edge_count: u64::try_from(edge_count).unwrap_or(0),
            connected_skill_count: u64::try_from(connected_skill_count).unwrap_or(0),
        })
    }

    #[cfg(test)]
    fn connection(&self) -> &Connection {
        &self.conn
    }
}

fn apply_counter_increment(
    conn: &Connection,
    name: &str,
    delta: i64,
    idempotency_key: &str,
    now: &str,
) -> Result<bool> {
    let inserted = conn
        .execute(
            "INSERT OR IGNORE INTO telemetry_ledger(counter_name, idempotency_key, delta, applied_at)
             VALUES (?1, ?2, ?3, ?4)",
            params![name, idempotency_key, delta, now],
        )
        .context("failed to write telemetry ledger")?;
    if inserted == 0 {
        return Ok(false);
    }

    conn.execute(
        "INSERT INTO telemetry_counters(name, value, updated_at) VALUES (?1, ?2, ?3)
         ON CONFLICT(name) DO UPDATE SET
           value = telemetry_counters.value + excluded.value,
           updated_at = excluded.updated_at",
        params![name, delta, now],
    )
    .with_context(|| format!("failed to increment counter {name}"))?;
    Ok(true)
}

fn transition_variation(
    conn: &Connection,
    variation_id: VariationId,
    next: VariationStatus,
    now: &str,
) -> Result<Variation> {
    let variation = load_variation(conn, variation_id)?
        .ok_or_else(|| anyhow!("variation {variation_id} not found"))?;
    if !variation.status.can_transition_to(next) {
        return Err(KernelError::IntegrityViolation(format!(
            "variation {variation_id} cannot move from {} to {}",
            variation.status.as_str(),
            next.as_str()
        ))
        .into());
    }

    let promoted = variation.promoted || next == VariationStatus::Promoted;
    conn.execute(
        "UPDATE skill_variations SET status = ?2, promoted = ?3, updated_at = ?4
         WHERE variation_id = ?1",
        params![
            variation_id.to_string(),
            next.as_str(),
            bool_to_sql(promoted),
            now
        ],
    )
    .context("failed to transition variation")?;

    Ok(Variation {
        promoted,
        status: next,
        ..variation
    })
}

fn load_variation(conn: &Connection, variation_id: VariationId) -> Result<Option<Variation>> {
    conn.query_row(
        &format!("SELECT {VARIATION_COLUMNS} FROM skill_variations WHERE variation_id = ?1"),
        params![variation_id.to_string()],
        parse_variation_row,
    )
    .optional()
    .context("failed to load variation")
}

fn load_production_variation(conn: &Connection, skill: &str) -> Result<Option<Variation>> {
    conn.query_row(
        &format!(
            "SELECT {VARIATION_COLUMNS} FROM skill_variations
             WHERE skill = ?1 AND status = 'promoted'"
        ),
        params![skill],
        parse_variation_row,
    )
    .optional()
    .context("failed to load production variation")
}

fn load_assignment(conn: &Connection, assignment_id: AssignmentId) -> Result<Option<AbAssignment>> {
    conn.query_row(
        &format!("SELECT {ASSIGNMENT_COLUMNS} FROM ab_test_assignments WHERE assignment_id = ?1"),
        params![assignment_id.to_string()],
        parse_assignment_row,
    )
    .optional()
    .context("failed to load ab test assignment")
}

fn load_running_assignment(conn: &Connection, skill: &str) -> Result<Option<AbAssignment>> {
    conn.query_row(
        &format!(
            "SELECT {ASSIGNMENT_COLUMNS} FROM ab_test_assignments
             WHERE skill = ?1 AND status = 'running'"
        ),
        params![skill],
        parse_assignment_row,
    )
    .optional()
    .context("failed to load running ab test")
}

fn running_assignment_touching(
    conn: &Connection,
    variation_id: VariationId,
) -> Result<Option<String>> {
    conn.query_row(
        "SELECT assignment_id FROM ab_test_assignments
         WHERE status = 'running' AND (control_variation = ?1 OR treatment_variation = ?1)",
        params![variation_id.to_string()],
        |row| row.get(0),
    )
    .optional()
    .context("failed to look up running tests for variation")
}

fn load_latest_permission_event(conn: &Connection, agent: &str) -> Result<Option<PermissionRecord>> {
    conn.query_row(
        &format!(
            "SELECT {PERMISSION_COLUMNS} FROM permission_events
             WHERE agent = ?1 ORDER BY event_seq DESC LIMIT 1"
        ),
        params![agent],
        parse_permission_row,
    )
    .optional()
    .context("failed to load latest permission event")
}

fn parse_execution_row(row: &rusqlite::Row<'_>) -> rusqlite::Result<ExecutionRecord> {
    let duration_ms: i64 = row.get(12)?;
    Ok(ExecutionRecord {
        execution_id: ExecutionId(ulid_column(row, 0)?),
        run_id: RunId(ulid_column(row, 1)?),
        iteration: u32_column(row, 2)?,
        skill: row.get(3)?,
        agent: row.get(4)?,
        started_at: time_column(row, 5)?,
        input_snapshot: json_column(row, 6)?,
        variation_id: optional_ulid_column(row, 7)?.map(VariationId),
        outcome: ExecutionOutcome {
            success: row.get::<_, i64>(8)? == 1,
            fidelity: row.get(9)?,
            output: json_column(row, 10)?,
            error: row.get(11)?,
        },
        duration_ms: u64::try_from(duration_ms).unwrap_or(0),
    })
}

fn parse_variation_row(row: &rusqlite::Row<'_>) -> rusqlite::Result<Variation> {
    let status_raw: String = row.get(5)?;
    let status = VariationStatus::parse(&status_raw).ok_or_else(|| {
        invalid_column(5, Type::Text, format!("invalid variation status: {status_raw}"))
    })?;
    Ok(Variation {
        variation_id: VariationId(ulid_column(row, 0)?),
        skill: row.get(1)?,
        content: json_column(row, 2)?,
        created_at: time_column(row, 3)?,
        promoted: row.get::<_, i64>(4)? == 1,
        status,
    })
}

fn parse_assignment_row(row: &rusqlite::Row<'_>) -> rusqlite::Result<AbAssignment> {
    let status_raw: String = row.get(6)?;
    let status = AssignmentStatus::parse(&status_raw).ok_or_else(|| {
        invalid_column(6, Type::Text, format!("invalid assignment status: {status_raw}"))
    })?;
    let decision = row
        .get::<_, Option<String>>(7)?
        .map(|raw| {
            AssignmentDecision::parse(&raw).ok_or_else(|| {
                invalid_column(7, Type::Text, format!("invalid assignment decision: {raw}"))
            })
        })
        .transpose()?;

    Ok(AbAssignment {
        assignment_id: AssignmentId(ulid_column(row, 0)?),
        skill: row.get(1)?,
        control_variation: VariationId(ulid_column(row, 2)?),
        treatment_variation: VariationId(ulid_column(row, 3)?),
        started_at: time_column(row, 4)?,
        ended_at: optional_time_column(row, 5)?,
        status,
        decision,
        control_trials: u32_column(row, 8)?,
        control_successes: u32_column(row, 9)?,
        treatment_trials: u32_column(row, 10)?,
        treatment_successes: u32_column(row, 11)?,
        sample_target: u32_column(row, 12)?,
        max_trials_per_arm: u32_column(row, 13)?,
        deadline: time_column(row, 14)?,
    })
}

fn parse_permission_row(row: &rusqlite::Row<'_>) -> rusqlite::Result<PermissionRecord> {
    let kind_raw: String = row.get(3)?;
    let event_kind = PermissionEventKind::parse(&kind_raw).ok_or_else(|| {
        invalid_column(3, Type::Text, format!("invalid permission event kind: {kind_raw}"))
    })?;
    let allowlist_raw: String = row.get(10)?;
    let allowlist: Vec<String> = serde_json::from_str(&allowlist_raw)
        .map_err(|err| invalid_column(10, Type::Text, format!("invalid allowlist_json: {err}")))?;

    Ok(PermissionRecord {
        event_seq: row.get(0)?,
        event_id: ulid_column(row, 1)?,
        agent: row.get(2)?,
        event_kind,
        tier_from: tier_column(row, 4)?,
        tier: tier_column(row, 5)?,
        granted_at: time_column(row, 6)?,
        granted_by: row.get(7)?,
        expires_at: optional_time_column(row, 8)?,
        confidence_at_grant: row.get(9)?,
        allowlist,
        evidence: row.get(11)?,
        signature: row.get(12)?,
        prev_event_hash: row.get(13)?,
        event_hash: row.get(14)?,
    })
}

fn parse_confidence_row(row: &rusqlite::Row<'_>) -> rusqlite::Result<ConfidenceEvent> {
    let kind_raw: String = row.get(4)?;
    let kind = ConfidenceEventKind::parse(&kind_raw).ok_or_else(|| {
        invalid_column(4, Type::Text, format!("invalid confidence event kind: {kind_raw}"))
    })?;
    Ok(ConfidenceEvent {
        event_seq: row.get(0)?,
        event_id: ulid_column(row, 1)?,
        agent: row.get(2)?,
        skill: row.get(3)?,
        kind,
        success: row.get::<_, i64>(5)? == 1,
        fidelity: row.get(6)?,
        occurred_at: time_column(row, 7)?,
        recorded_at: time_column(row, 8)?,
        execution_id: optional_ulid_column(row, 9)?.map(ExecutionId),
        evidence: row.get(10)?,
    })
}

fn parse_edge_row(row: &rusqlite::Row<'_>) -> rusqlite::Result<SkillEdge> {
    let edge_type_raw: String = row.get(3)?;
    let edge_type = EdgeType::parse(&edge_type_raw).ok_or_else(|| {
        invalid_column(3, Type::Text, format!("invalid edge_type: {edge_type_raw}"))
    })?;
    Ok(SkillEdge {
        edge_id: ulid_column(row, 0)?,
        source_skill: row.get(1)?,
        target_skill: row.get(2)?,
        edge_type,
        weight: row.get(4)?,
        created_at: time_column(row, 5)?,
        evidence: row.get(6)?,
    })
}

fn parse_retrieval_row(row: &rusqlite::Row<'_>) -> rusqlite::Result<RetrievalEvent> {
    let latency_ms: i64 = row.get(6)?;
    Ok(RetrievalEvent {
        retrieval_id: ulid_column(row, 0)?,
        execution_id: ExecutionId(ulid_column(row, 1)?),
        skill: row.get(2)?,
        query: row.get(3)?,
        result_count: u32_column(row, 4)?,
        relevance: row.get(5)?,
        latency_ms: u64::try_from(latency_ms).unwrap_or(0),
        used: row.get::<_, i64>(7)? == 1,
        recorded_at: time_column(row, 8)?,
    })
}

fn invalid_column(idx: usize, ty: Type, message: String) -> rusqlite::Error {
    rusqlite::Error::FromSqlConversionFailure(
        idx,
        ty,
        Box::new(std::io::Error::new(std::io::ErrorKind::InvalidData, message)),
    )
}

fn ulid_column(row: &rusqlite::Row<'_>, idx: usize) -> rusqlite::Result<Ulid> {
    let raw: String = row.get(idx)?;
    Ulid::from_string(&raw)
        .map_err(|_| invalid_column(idx, Type::Text, format!("invalid ULID: {raw}")))
}

fn optional_ulid_column(row: &rusqlite::Row<'_>, idx: usize) -> rusqlite::Result<Option<Ulid>> {
    let raw: Option<String> = row.get(idx)?;
    raw.map(|raw| {
        Ulid::from_string(&raw)
            .map_err(|_| invalid_column(idx, Type::Text, format!("invalid ULID: {raw}")))
    })
    .transpose()
}

fn time_column(row: &rusqlite::Row<'_>, idx: usize) -> rusqlite::Result<OffsetDateTime> {
    let raw: String = row.get(idx)?;
    parse_rfc3339_utc(&raw).map_err(|err| invalid_column(idx, Type::Text, err.to_string()))
}

fn optional_time_column(
    row: &rusqlite::Row<'_>,
    idx: usize,
) -> rusqlite::Result<Option<OffsetDateTime>> {
    let raw: Option<String> = row.get(idx)?;
    raw.map(|raw| {
        parse_rfc3339_utc(&raw).map_err(|err| invalid_column(idx, Type::Text, err.to_string()))
    })
    .transpose()
}

fn json_column(row: &rusqlite::Row<'_>, idx: usize) -> rusqlite::Result<Value> {
    let raw: String = row.get(idx)?;
    serde_json::from_str(&raw)
        .map_err(|err| invalid_column(idx, Type::Text, format!("invalid JSON: {err}")))
}

fn u32_column(row: &rusqlite::Row<'_>, idx: usize) -> rusqlite::Result<u32> {
    let raw: i64 = row.get(idx)?;
    u32::try_from(raw)
        .map_err(|_| invalid_column(idx, Type::Integer, format!("value out of range: {raw}")))
}

fn tier_column(row: &rusqlite::Row<'_>, idx: usize) -> rusqlite::Result<Tier> {
    let raw: String = row.get(idx)?;
    Tier::parse(&raw).ok_or_else(|| invalid_column(idx, Type::Text, format!("invalid tier: {raw}")))
}

fn sql_time(value: OffsetDateTime) -> Result<String> {
    format_rfc3339(value).map_err(|err| anyhow!(err.to_string()))
}

fn bool_to_sql(value: bool) -> i64 {
    i64::from(value)
}

fn collect_rows<T>(
    rows: rusqlite::MappedRows<'_, impl FnMut(&rusqlite::Row<'_>) -> rusqlite::Result<T>>,
) -> Result<Vec<T>> {
    let mut values = Vec::new();
    for row in rows {
        values.push(row?);
    }
    Ok(values)
}
