use std::collections::BTreeMap;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use anyhow::Result;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use skill_kernel_core::{ExecutionOutcome, KernelError, Operation, Tier};

/// Cooperative cancellation flag shared between the orchestrator and a
/// running skill.
#[derive(Debug, Clone, Default)]
pub struct CancelSignal {
    cancelled: Arc<AtomicBool>,
}

impl CancelSignal {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    pub fn cancel(&self) {
        self.cancelled.store(true, Ordering::SeqCst);
    }

    #[must_use]
    pub fn is_cancelled(&self) -> bool {
        self.cancelled.load(Ordering::SeqCst)
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct SkillMetadata {
    pub name: String,
    pub agent_affinity: Option<String>,
    pub required_tier: Tier,
}

impl SkillMetadata {
    #[must_use]
    pub fn new(name: &str, required_tier: Tier) -> Self {
        Self {
            name: name.to_string(),
            agent_affinity: None,
            required_tier,
        }
    }

    #[must_use]
    pub fn with_affinity(mut self, agent: &str) -> Self {
        self.agent_affinity = Some(agent.to_string());
        self
    }

    #[must_use]
    pub fn accepts_agent(&self, agent: &str) -> bool {
        self.agent_affinity
            .as_deref()
            .map_or(true, |affinity| affinity == agent)
    }

    /// Operation an agent must be allowed to perform to run this skill.
    #[must_use]
    pub fn required_operation(&self) -> Operation {
        match self.required_tier {
            Tier::ReadOnly => Operation::Read,
            Tier::MetricsWrite => Operation::WriteMetrics,
            Tier::EditRestricted | Tier::EditUnrestricted => Operation::Edit,
        }
    }
}

/// A pluggable unit of action. Implementations must be safe to retry and
/// should poll `cancel` during long work; the orchestrator raises it when
/// the action overruns its timeout.
pub trait Skill: Send + Sync {
    fn metadata(&self) -> &SkillMetadata;

    /// Runs the action once.
    ///
    /// # Errors
    /// Any error is recorded as a failed execution with fidelity `0.0`.
    fn execute(&self, input: &Value, cancel: &CancelSignal) -> Result<ExecutionOutcome>;
}

pub struct FnSkill<F> {
    metadata: SkillMetadata,
    run: F,
}

impl<F> FnSkill<F>
where
    F: Fn(&Value, &CancelSignal) -> Result<ExecutionOutcome> + Send + Sync,
{
    pub fn new(metadata: SkillMetadata, run: F) -> Self {
        Self { metadata, run }
    }
}

impl<F> Skill for FnSkill<F>
where
    F: Fn(&Value, &CancelSignal) -> Result<ExecutionOutcome> + Send + Sync,
{
    fn metadata(&self) -> &SkillMetadata {
        &self.metadata
    }

    fn execute(&self, input: &Value, cancel: &CancelSignal) -> Result<ExecutionOutcome> {
        (self.run)(input, cancel)
    }
}

#[derive(Clone, Default)]
pub struct SkillRegistry {
    skills: BTreeMap<String, Arc<dyn Skill>>,
}

impl SkillRegistry {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Registers a skill under its metadata name.
    ///
    /// # Errors
    /// Returns [`KernelError::Validation`] for an empty or duplicate name.
    pub fn register(&mut self, skill: Arc<dyn Skill>) -> Result<(), KernelError> {
        let name = skill.metadata().name.clone();
        skill_kernel_core::ensure_non_empty("skill name", &name)?;
        if self.skills.contains_key(&name) {
            return Err(KernelError::Validation(format!(
                "skill {name} is already registered"
            )));
        }
        self.skills.insert(name, skill);
        Ok(())
    }

    #[must_use]
    pub fn get(&self, name: &str) -> Option<Arc<dyn Skill>> {
        self.skills.get(name).cloned()
    }

    #[must_use]
    pub fn names(&self) -> Vec<&str> {
        self.skills.keys().map(String::as_str).collect()
    }
}
