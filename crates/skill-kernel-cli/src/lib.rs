//! `sk` command surface over the skill kernel store.
//!
//! Every command prints one JSON document on stdout. Logs go to stderr.
//! Host runtimes can embed the same behavior through [`run_cli`] or
//! [`run_command`].

use std::path::{Path, PathBuf};

use anyhow::{anyhow, Context, Result};
use clap::{Args, Parser, Subcommand, ValueEnum};
use serde::Serialize;
use serde_json::Value;
use skill_kernel_core::{
    now_utc, parse_rfc3339_utc, ConfidenceEventKind, EdgeType, ExecutionId, KernelConfig,
    Operation, SkillEdgeInput, Tier, VariationId,
};
use skill_kernel_orchestrator::{
    shared_store, Orchestrator, OrchestratorConfig, SkillRegistry, DEFAULT_SUBGRAPH_DEPTH,
};
use skill_kernel_store_sqlite::SqliteSkillStore;
use time::OffsetDateTime;
use ulid::Ulid;

#[derive(Debug, Parser)]
#[command(name = "sk")]
#[command(about = "Skill Kernel CLI")]
pub struct Cli {
    #[arg(long, default_value = "./skill_kernel.sqlite3")]
    db: PathBuf,

    /// Kernel config JSON; missing sections fall back to v1 defaults.
    #[arg(long)]
    config: Option<PathBuf>,

    #[command(subcommand)]
    command: Command,
}

#[derive(Debug, Subcommand)]
pub enum Command {
    Permission {
        #[command(subcommand)]
        command: Box<PermissionCommand>,
    },
    Audit(AuditArgs),
    Dashboard,
    Confidence {
        #[command(subcommand)]
        command: Box<ConfidenceCommand>,
    },
    Variation {
        #[command(subcommand)]
        command: Box<VariationCommand>,
    },
    Experiment {
        #[command(subcommand)]
        command: Box<ExperimentCommand>,
    },
    Graph {
        #[command(subcommand)]
        command: Box<GraphCommand>,
    },
    Telemetry {
        #[command(subcommand)]
        command: Box<TelemetryCommand>,
    },
    VerifyAudit(VerifyAuditArgs),
}

#[derive(Debug, Subcommand)]
pub enum PermissionCommand {
    Check(PermissionCheckArgs),
    Promote(PermissionPromoteArgs),
    Reapprove(PermissionReapproveArgs),
    Revoke(PermissionRevokeArgs),
}

#[derive(Debug, Args)]
pub struct PermissionCheckArgs {
    #[arg(long)]
    agent: String,
    #[arg(long)]
    operation: OperationArg,
    #[arg(long)]
    path: Option<String>,
    #[arg(long)]
    as_of: Option<String>,
}

#[derive(Debug, Args)]
pub struct PermissionPromoteArgs {
    #[arg(long)]
    agent: String,
    #[arg(long)]
    tier: TierArg,
    #[arg(long)]
    granted_by: String,
    /// Glob an edit-restricted agent may touch; repeatable.
    #[arg(long = "allow")]
    allowlist: Vec<String>,
    #[arg(long)]
    as_of: Option<String>,
}

#[derive(Debug, Args)]
pub struct PermissionReapproveArgs {
    #[arg(long)]
    agent: String,
    #[arg(long)]
    granted_by: String,
    #[arg(long)]
    as_of: Option<String>,
}

#[derive(Debug, Args)]
pub struct PermissionRevokeArgs {
    #[arg(long)]
    agent: String,
    #[arg(long)]
    granted_by: String,
    #[arg(long)]
    reason: String,
    #[arg(long)]
    as_of: Option<String>,
}

#[derive(Debug, Args)]
pub struct AuditArgs {
    #[arg(long)]
    agent: String,
    #[arg(long)]
    since: Option<String>,
}

#[derive(Debug, Subcommand)]
pub enum ConfidenceCommand {
    Show(ConfidenceShowArgs),
    Record(ConfidenceRecordArgs),
}

#[derive(Debug, Args)]
pub struct ConfidenceShowArgs {
    #[arg(long)]
    agent: String,
    #[arg(long)]
    as_of: Option<String>,
}

#[derive(Debug, Args)]
pub struct ConfidenceRecordArgs {
    #[arg(long)]
    agent: String,
    #[arg(long)]
    kind: SignalArg,
    #[arg(long)]
    evidence: String,
    #[arg(long)]
    occurred_at: Option<String>,
}

#[derive(Debug, Subcommand)]
pub enum VariationCommand {
    Register(VariationRegisterArgs),
    Adopt(VariationAdoptArgs),
    List(VariationListArgs),
}

#[derive(Debug, Args)]
pub struct VariationRegisterArgs {
    #[arg(long)]
    skill: String,
    #[arg(long, default_value = "{}")]
    content_json: String,
}

#[derive(Debug, Args)]
pub struct VariationAdoptArgs {
    #[arg(long)]
    variation_id: String,
}

#[derive(Debug, Args)]
pub struct VariationListArgs {
    #[arg(long)]
    skill: String,
}

#[derive(Debug, Subcommand)]
pub enum ExperimentCommand {
    Schedule(ExperimentScheduleArgs),
    Status(ExperimentStatusArgs),
}

#[derive(Debug, Args)]
pub struct ExperimentScheduleArgs {
    #[arg(long)]
    skill: String,
    #[arg(long)]
    control: String,
    #[arg(long)]
    treatment: String,
    /// Trials per arm before a decision; defaults to the configured target.
    #[arg(long)]
    sample_target: Option<u32>,
}

#[derive(Debug, Args)]
pub struct ExperimentStatusArgs {
    #[arg(long)]
    skill: Option<String>,
}

#[derive(Debug, Subcommand)]
pub enum GraphCommand {
    AddEdge(GraphAddEdgeArgs),
    Related(GraphRelatedArgs),
    Subgraph(GraphSubgraphArgs),
    Transfer(GraphTransferArgs),
}

#[derive(Debug, Args)]
pub struct GraphAddEdgeArgs {
    #[arg(long)]
    source: String,
    #[arg(long)]
    target: String,
    #[arg(long)]
    edge_type: EdgeTypeArg,
    #[arg(long)]
    weight: f64,
    #[arg(long)]
    evidence: String,
}

#[derive(Debug, Args)]
pub struct GraphRelatedArgs {
    #[arg(long)]
    skill: String,
    #[arg(long = "edge-type")]
    edge_types: Vec<EdgeTypeArg>,
    #[arg(long, default_value_t = 0.0)]
    min_weight: f64,
}

#[derive(Debug, Args)]
pub struct GraphSubgraphArgs {
    #[arg(long)]
    skill: String,
    #[arg(long, default_value_t = DEFAULT_SUBGRAPH_DEPTH)]
    depth: usize,
}

#[derive(Debug, Args)]
pub struct GraphTransferArgs {
    #[arg(long)]
    source: String,
    #[arg(long)]
    target: String,
}

#[derive(Debug, Subcommand)]
pub enum TelemetryCommand {
    Replay(TelemetryReplayArgs),
    Counters,
}

#[derive(Debug, Args)]
pub struct TelemetryReplayArgs {
    #[arg(long)]
    execution_id: String,
}

#[derive(Debug, Args)]
pub struct VerifyAuditArgs {
    #[arg(long)]
    agent: Option<String>,
}

#[derive(Debug, Clone, Copy, ValueEnum)]
pub enum OperationArg {
    Read,
    WriteMetrics,
    Edit,
}

#[derive(Debug, Clone, Copy, ValueEnum)]
pub enum TierArg {
    ReadOnly,
    MetricsWrite,
    EditRestricted,
    EditUnrestricted,
}

#[derive(Debug, Clone, Copy, ValueEnum)]
pub enum SignalArg {
    HumanApproval,
    Rollback,
    ContractViolation,
    Regression,
    SecurityIssue,
    ConfirmedDetection,
    FalsePositive,
}

#[derive(Debug, Clone, Copy, ValueEnum)]
pub enum EdgeTypeArg {
    CausedBy,
    ImprovedBy,
    SimilarTo,
    DependsOn,
}

#[derive(Debug, Serialize)]
struct ReplayOutput {
    execution_id: ExecutionId,
    applied: bool,
}

/// Executes the parsed top-level command.
///
/// # Errors
/// Returns an error when the config is invalid, the store cannot be opened
/// or migrated, or the command fails.
pub fn run_cli(cli: Cli) -> Result<()> {
    let config = load_config(cli.config.as_deref())?;
    run_command_with_db(&cli.db, config, cli.command)
}

/// Opens and migrates the `SQLite` store at `db_path`, then runs `command`.
///
/// # Errors
/// Returns an error when store open/migrate fails or the command fails.
pub fn run_command_with_db(db_path: &Path, config: KernelConfig, command: Command) -> Result<()> {
    let store = SqliteSkillStore::open(db_path)?;
    store.migrate()?;
    tracing::debug!(db = %db_path.display(), "skill store ready");
    let orchestrator = Orchestrator::new(
        shared_store(store),
        SkillRegistry::new(),
        config,
        OrchestratorConfig::default(),
    )?;
    run_command(command, &orchestrator)
}

/// Runs one command against an existing orchestrator.
///
/// # Errors
/// Returns an error when validation, a policy gate, or persistence fails.
pub fn run_command(command: Command, orchestrator: &Orchestrator) -> Result<()> {
    match command {
        Command::Permission { command } => run_permission(*command, orchestrator),
        Command::Audit(args) => {
            let since = parse_optional_since(args.since.as_deref())?;
            let audit = orchestrator
                .permissions()
                .audit_agent(&args.agent, since, now_utc())?;
            print_json(&audit)
        }
        Command::Dashboard => print_json(&orchestrator.dashboard()?),
        Command::Confidence { command } => run_confidence(*command, orchestrator),
        Command::Variation { command } => run_variation(*command, orchestrator),
        Command::Experiment { command } => run_experiment(*command, orchestrator),
        Command::Graph { command } => run_graph(*command, orchestrator),
        Command::Telemetry { command } => match *command {
            TelemetryCommand::Replay(args) => {
                let execution_id = ExecutionId(parse_ulid(&args.execution_id)?);
                let applied = orchestrator.replay_telemetry(execution_id)?;
                print_json(&ReplayOutput {
                    execution_id,
                    applied,
                })
            }
            TelemetryCommand::Counters => print_json(&orchestrator.counters()?),
        },
        Command::VerifyAudit(args) => {
            let verification = orchestrator.verify_audit(args.agent.as_deref())?;
            print_json(&verification)?;
            if verification.valid {
                Ok(())
            } else {
                Err(anyhow!(
                    "permission audit chain verification failed: {}",
                    verification.failures.join(" | ")
                ))
            }
        }
    }
}

fn run_permission(command: PermissionCommand, orchestrator: &Orchestrator) -> Result<()> {
    let permissions = orchestrator.permissions();
    match command {
        PermissionCommand::Check(args) => {
            let decision = permissions.check_permission(
                &args.agent,
                map_operation(args.operation),
                args.path.as_deref(),
                parse_optional_utc(args.as_of.as_deref())?,
            )?;
            print_json(&decision)
        }
        PermissionCommand::Promote(args) => {
            let record = permissions.request_promotion(
                &args.agent,
                map_tier(args.tier),
                &args.granted_by,
                args.allowlist,
                parse_optional_utc(args.as_of.as_deref())?,
            )?;
            print_json(&record)
        }
        PermissionCommand::Reapprove(args) => {
            let record = permissions.reapprove(
                &args.agent,
                &args.granted_by,
                parse_optional_utc(args.as_of.as_deref())?,
            )?;
            print_json(&record)
        }
        PermissionCommand::Revoke(args) => {
            let record = permissions.emergency_revoke(
                &args.agent,
                &args.granted_by,
                &args.reason,
                parse_optional_utc(args.as_of.as_deref())?,
            )?;
            print_json(&record)
        }
    }
}

fn run_confidence(command: ConfidenceCommand, orchestrator: &Orchestrator) -> Result<()> {
    match command {
        ConfidenceCommand::Show(args) => {
            let as_of = parse_optional_utc(args.as_of.as_deref())?;
            print_json(&orchestrator.confidence().confidence(&args.agent, as_of)?)
        }
        ConfidenceCommand::Record(args) => {
            let occurred_at = parse_optional_utc(args.occurred_at.as_deref())?;
            let (update, change) = orchestrator.permissions().record_signal(
                &args.agent,
                map_signal(args.kind),
                &args.evidence,
                occurred_at,
            )?;
            print_json(&serde_json::json!({
                "update": update,
                "permission_change": change,
            }))
        }
    }
}

fn run_variation(command: VariationCommand, orchestrator: &Orchestrator) -> Result<()> {
    let experiments = orchestrator.experiments();
    match command {
        VariationCommand::Register(args) => {
            let content = parse_content_json(&args.content_json)?;
            print_json(&experiments.register_variation(&args.skill, &content)?)
        }
        VariationCommand::Adopt(args) => {
            let variation_id = VariationId(parse_ulid(&args.variation_id)?);
            print_json(&experiments.adopt_baseline(variation_id)?)
        }
        VariationCommand::List(args) => print_json(&experiments.list_variations(&args.skill)?),
    }
}

fn run_experiment(command: ExperimentCommand, orchestrator: &Orchestrator) -> Result<()> {
    let experiments = orchestrator.experiments();
    match command {
        ExperimentCommand::Schedule(args) => {
            let assignment = experiments.schedule_test(
                &args.skill,
                VariationId(parse_ulid(&args.control)?),
                VariationId(parse_ulid(&args.treatment)?),
                args.sample_target,
                now_utc(),
            )?;
            print_json(&assignment)
        }
        ExperimentCommand::Status(args) => {
            print_json(&experiments.list_tests(args.skill.as_deref())?)
        }
    }
}

fn run_graph(command: GraphCommand, orchestrator: &Orchestrator) -> Result<()> {
    let graph = orchestrator.graph();
    match command {
        GraphCommand::AddEdge(args) => {
            let edge = graph.add_edge(&SkillEdgeInput {
                source_skill: args.source,
                target_skill: args.target,
                edge_type: map_edge_type(args.edge_type),
                weight: args.weight,
                evidence: args.evidence,
            })?;
            print_json(&edge)
        }
        GraphCommand::Related(args) => {
            let edge_types: Vec<EdgeType> =
                args.edge_types.into_iter().map(map_edge_type).collect();
            print_json(&graph.related_skills(&args.skill, &edge_types, args.min_weight)?)
        }
        GraphCommand::Subgraph(args) => print_json(&graph.subgraph(&args.skill, args.depth)?),
        GraphCommand::Transfer(args) => {
            print_json(&graph.transfer_learning(&args.source, &args.target)?)
        }
    }
}

fn load_config(path: Option<&Path>) -> Result<KernelConfig> {
    let Some(path) = path else {
        return Ok(KernelConfig::v1());
    };
    let raw = std::fs::read_to_string(path)
        .with_context(|| format!("failed to read config file {}", path.display()))?;
    let value: Value = serde_json::from_str(&raw)
        .with_context(|| format!("config file {} must be valid JSON", path.display()))?;
    Ok(KernelConfig::from_json(&value)?)
}

fn print_json<T: Serialize>(value: &T) -> Result<()> {
    println!("{}", serde_json::to_string_pretty(value)?);
    Ok(())
}

fn parse_content_json(raw: &str) -> Result<Value> {
    serde_json::from_str(raw).with_context(|| format!("content_json must be valid JSON: {raw}"))
}

fn parse_optional_utc(raw: Option<&str>) -> Result<OffsetDateTime> {
    match raw {
        Some(value) => parse_rfc3339_utc(value).map_err(|err| anyhow!("invalid timestamp: {err}")),
        None => Ok(now_utc()),
    }
}

fn parse_optional_since(raw: Option<&str>) -> Result<Option<OffsetDateTime>> {
    raw.map(|value| parse_rfc3339_utc(value).map_err(|err| anyhow!("invalid timestamp: {err}")))
        .transpose()
}

fn parse_ulid(raw: &str) -> Result<Ulid> {
    Ulid::from_string(raw).with_context(|| format!("invalid ULID: {raw}"))
}

fn map_operation(value: OperationArg) -> Operation {
    match value {
        OperationArg::Read => Operation::Read,
        OperationArg::WriteMetrics => Operation::WriteMetrics,
        OperationArg::Edit => Operation::Edit,
    }
}

fn map_tier(value: TierArg) -> Tier {
    match value {
        TierArg::ReadOnly => Tier::ReadOnly,
        TierArg::MetricsWrite => Tier::MetricsWrite,
        TierArg::EditRestricted => Tier::EditRestricted,
        TierArg::EditUnrestricted => Tier::EditUnrestricted,
    }
}

fn map_signal(value: SignalArg) -> ConfidenceEventKind {
    match value {
        SignalArg::HumanApproval => ConfidenceEventKind::HumanApproval,
        SignalArg::Rollback => ConfidenceEventKind::Rollback,
        SignalArg::ContractViolation => ConfidenceEventKind::ContractViolation,
        SignalArg::Regression => ConfidenceEventKind::Regression,
        SignalArg::SecurityIssue => ConfidenceEventKind::SecurityIssue,
        SignalArg::ConfirmedDetection => ConfidenceEventKind::ConfirmedDetection,
        SignalArg::FalsePositive => ConfidenceEventKind::FalsePositive,
    }
}

fn map_edge_type(value: EdgeTypeArg) -> EdgeType {
    match value {
        EdgeTypeArg::CausedBy => EdgeType::CausedBy,
        EdgeTypeArg::ImprovedBy => EdgeType::ImprovedBy,
        EdgeTypeArg::SimilarTo => EdgeType::SimilarTo,
        EdgeTypeArg::DependsOn => EdgeType::DependsOn,
    }
}

#[cfg(test)]
mod tests {
    #![allow(clippy::float_cmp)]

    use serde_json::json;

    use super::*;

    fn must<T>(result: Result<T>) -> T {
        match result {
            Ok(value) => value,
            Err(err) => panic!("test failure: {err:#}"),
        }
    }

    fn temp_path(prefix: &str, extension: &str) -> PathBuf {
        std::env::temp_dir().join(format!("{prefix}-{}.{extension}", Ulid::new()))
    }

    fn execute_cli(args: &[&str]) -> Result<()> {
        let cli = Cli::try_parse_from(args)?;
        run_cli(cli)
    }

    #[test]
    fn parse_content_rejects_invalid_json() {
        assert!(parse_content_json("{").is_err());
        assert_eq!(must(parse_content_json(r#"{"prompt":"v1"}"#))["prompt"], json!("v1"));
    }

    #[test]
    fn parse_optional_utc_rejects_non_utc() {
        assert!(parse_optional_utc(Some("2026-02-07T12:00:00+02:00")).is_err());
        assert!(must(parse_optional_since(None)).is_none());
    }

    #[test]
    fn partial_config_file_falls_back_to_defaults() {
        let path = temp_path("skill-kernel-config", "json");
        let payload = json!({
            "experiment": {
                "config_version": 1,
                "default_sample_target": 10,
                "promote_margin": 0.10,
                "archive_margin": 0.10,
                "ceiling_multiplier": 5,
                "max_test_days": 14
            }
        });
        must(std::fs::write(&path, payload.to_string()).map_err(Into::into));
        let loaded = load_config(Some(&path));
        let _ = std::fs::remove_file(&path);

        let config = must(loaded);
        assert_eq!(config.experiment.default_sample_target, 10);
        assert_eq!(config.ladder, skill_kernel_core::LadderConfig::v1());
    }

    #[test]
    fn invalid_config_file_is_rejected() {
        let path = temp_path("skill-kernel-config-bad", "json");
        let payload = json!({"retrieval": {
            "config_version": 1,
            "enabled": true,
            "max_results": 0,
            "target_results": 4,
            "min_relevance": 0.5,
            "query_input_chars": 256
        }});
        must(std::fs::write(&path, payload.to_string()).map_err(Into::into));
        let loaded = load_config(Some(&path));
        let _ = std::fs::remove_file(&path);
        assert!(loaded.is_err());
    }

    #[test]
    fn embedded_entrypoint_runs_against_a_db_path() {
        let db_path = temp_path("skill-kernel-embed", "sqlite3");
        let db = db_path.to_string_lossy().to_string();

        must(execute_cli(&["sk", "--db", &db, "dashboard"]));
        must(execute_cli(&[
            "sk", "--db", &db, "graph", "add-edge", "--source", "lint", "--target", "format",
            "--edge-type", "similar-to", "--weight", "0.7", "--evidence", "shared parser",
        ]));
        must(execute_cli(&["sk", "--db", &db, "verify-audit"]));
        assert!(execute_cli(&[
            "sk", "--db", &db, "permission", "promote", "--agent", "newcomer", "--tier",
            "edit-restricted", "--granted-by", "ops-lead",
        ])
        .is_err());

        let _ = std::fs::remove_file(&db_path);
    }
}
