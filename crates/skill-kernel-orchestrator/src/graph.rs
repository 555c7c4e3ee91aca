use std::collections::{BTreeSet, VecDeque};

use anyhow::Result;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use skill_kernel_core::{EdgeType, SkillEdge, SkillEdgeInput, LEARNING_SUCCESS_FIDELITY};

use crate::{with_store, SharedStore};

pub const DEFAULT_SUBGRAPH_DEPTH: usize = 2;
pub const TRANSFER_EDGE_WEIGHT: f64 = 0.5;
pub const TRANSFER_PATTERN_LIMIT: usize = 10;

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct Subgraph {
    pub root: String,
    pub depth: usize,
    pub nodes: BTreeSet<String>,
    pub edges: Vec<SkillEdge>,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct TransferReport {
    pub source: String,
    pub target: String,
    pub transferred: usize,
    pub best_fidelity: f64,
    pub edge_created: bool,
    pub patterns: Vec<Value>,
}

#[derive(Clone)]
pub struct KnowledgeGraph {
    store: SharedStore,
}

impl KnowledgeGraph {
    #[must_use]
    pub fn new(store: SharedStore) -> Self {
        Self { store }
    }

    /// # Errors
    /// Returns an error for self-loops, empty endpoints, weights outside
    /// `[0, 1]`, or store failures.
    pub fn add_edge(&self, input: &SkillEdgeInput) -> Result<SkillEdge> {
        let edge = with_store(&self.store, |store| store.add_edge(input))?;
        tracing::debug!(
            source = %edge.source_skill,
            target = %edge.target_skill,
            edge_type = edge.edge_type.as_str(),
            weight = edge.weight,
            "skill edge added"
        );
        Ok(edge)
    }

    /// Outgoing edges of `skill`. An empty `edge_types` matches every type.
    ///
    /// # Errors
    /// Returns an error when the store fails.
    pub fn related_skills(
        &self,
        skill: &str,
        edge_types: &[EdgeType],
        min_weight: f64,
    ) -> Result<Vec<SkillEdge>> {
        with_store(&self.store, |store| store.edges_from(skill, edge_types, min_weight))
    }

    /// Breadth-first walk over outgoing edges up to `depth` hops. Cycles are
    /// cut by the visited set.
    ///
    /// # Errors
    /// Returns an error when the store fails.
    pub fn subgraph(&self, skill: &str, depth: usize) -> Result<Subgraph> {
        let mut nodes = BTreeSet::from([skill.to_string()]);
        let mut edges = Vec::new();
        let mut queue = VecDeque::from([(skill.to_string(), 0_usize)]);

        with_store(&self.store, |store| {
            while let Some((current, hops)) = queue.pop_front() {
                if hops >= depth {
                    continue;
                }
                for edge in store.edges_from(&current, &[], 0.0)? {
                    if nodes.insert(edge.target_skill.clone()) {
                        queue.push_back((edge.target_skill.clone(), hops + 1));
                    }
                    edges.push(edge);
                }
            }
            Ok(())
        })?;

        Ok(Subgraph {
            root: skill.to_string(),
            depth,
            nodes,
            edges,
        })
    }

    /// Pulls the best successful executions of `source` as patterns for
    /// `target`, linking the two with a `similar_to` edge when none exists.
    /// Returns `None` when `source` has no qualifying history.
    ///
    /// # Errors
    /// Returns an error when the store fails or `source == target`.
    pub fn transfer_learning(&self, source: &str, target: &str) -> Result<Option<TransferReport>> {
        let report = with_store(&self.store, |store| {
            let best = store.best_executions_for_skill(
                source,
                LEARNING_SUCCESS_FIDELITY,
                TRANSFER_PATTERN_LIMIT,
            )?;
            let Some(top) = best.first() else {
                return Ok(None);
            };
            let best_fidelity = top.outcome.fidelity;

            let edge_created = if store.edge_exists(source, target, EdgeType::SimilarTo)? {
                false
            } else {
                store.add_edge(&SkillEdgeInput {
                    source_skill: source.to_string(),
                    target_skill: target.to_string(),
                    edge_type: EdgeType::SimilarTo,
                    weight: TRANSFER_EDGE_WEIGHT,
                    evidence: format!(
                        "transfer of {} pattern(s), best fidelity {best_fidelity:.2}",
                        best.len()
                    ),
                })?;
                true
            };

            Ok(Some(TransferReport {
                source: source.to_string(),
                target: target.to_string(),
                transferred: best.len(),
                best_fidelity,
                edge_created,
                patterns: best
                    .iter()
                    .map(|record| record.input_snapshot.clone())
                    .collect(),
            }))
        })?;

        if let Some(report) = &report {
            tracing::info!(
                source,
                target,
                transferred = report.transferred,
                best_fidelity = report.best_fidelity,
                "transferred skill patterns"
            );
        }
        Ok(report)
    }
}

#[cfg(test)]
mod tests {
    #![allow(clippy::float_cmp)]

    use std::path::Path;
    use std::sync::{Arc, Mutex};

    use serde_json::json;
    use skill_kernel_core::{now_utc, ExecutionId, ExecutionOutcome, ExecutionRecord, RunId};
    use skill_kernel_store_sqlite::SqliteSkillStore;

    use super::*;

    fn must<T>(result: Result<T>) -> T {
        match result {
            Ok(value) => value,
            Err(err) => panic!("test failure: {err:#}"),
        }
    }

    fn fixture_graph() -> (SharedStore, KnowledgeGraph) {
        let store = must(SqliteSkillStore::open(Path::new(":memory:")));
        must(store.migrate());
        let store: SharedStore = Arc::new(Mutex::new(store));
        (store.clone(), KnowledgeGraph::new(store))
    }

    fn edge(graph: &KnowledgeGraph, source: &str, target: &str, edge_type: EdgeType, weight: f64) {
        must(graph.add_edge(&SkillEdgeInput {
            source_skill: source.to_string(),
            target_skill: target.to_string(),
            edge_type,
            weight,
            evidence: "fixture".to_string(),
        }));
    }

    #[test]
    fn subgraph_is_depth_bounded_and_cycle_safe() {
        let (_, graph) = fixture_graph();
        edge(&graph, "a", "b", EdgeType::DependsOn, 0.9);
        edge(&graph, "b", "c", EdgeType::CausedBy, 0.6);
        edge(&graph, "c", "a", EdgeType::SimilarTo, 0.4);
        edge(&graph, "c", "d", EdgeType::ImprovedBy, 0.3);

        let shallow = must(graph.subgraph("a", DEFAULT_SUBGRAPH_DEPTH));
        assert_eq!(
            shallow.nodes,
            BTreeSet::from(["a".to_string(), "b".to_string(), "c".to_string()])
        );
        assert_eq!(shallow.edges.len(), 2);

        let deep = must(graph.subgraph("a", 10));
        assert_eq!(deep.nodes.len(), 4);
        assert_eq!(deep.edges.len(), 4);
    }

    #[test]
    fn related_skills_filter_by_type_and_weight() {
        let (_, graph) = fixture_graph();
        edge(&graph, "lint", "format", EdgeType::SimilarTo, 0.8);
        edge(&graph, "lint", "test", EdgeType::DependsOn, 0.2);
        let related = must(graph.related_skills("lint", &[EdgeType::SimilarTo], 0.5));
        assert_eq!(related.len(), 1);
        assert_eq!(related[0].target_skill, "format");
        assert!(must(graph.related_skills("lint", &[], 0.9)).is_empty());
    }

    #[test]
    fn transfer_links_skills_once() {
        let (store, graph) = fixture_graph();
        assert!(must(graph.transfer_learning("summarize", "translate")).is_none());

        let run_id = RunId::new();
        for (iteration, fidelity) in [(1, 0.80), (2, 0.93), (3, 0.97)] {
            let record = ExecutionRecord {
                execution_id: ExecutionId::new(),
                run_id,
                iteration,
                skill: "summarize".to_string(),
                agent: "agent-a".to_string(),
                started_at: now_utc(),
                input_snapshot: json!({"attempt": iteration}),
                variation_id: None,
                outcome: ExecutionOutcome {
                    success: true,
                    fidelity,
                    output: json!(null),
                    error: None,
                },
                duration_ms: 1,
            };
            must(with_store(&store, |store| store.seal_execution(&record)));
        }

        let first = must(graph.transfer_learning("summarize", "translate"));
        let first = first.unwrap_or_else(|| unreachable!());
        assert_eq!(first.transferred, 2);
        assert_eq!(first.best_fidelity, 0.97);
        assert!(first.edge_created);
        assert_eq!(first.patterns[0], json!({"attempt": 3}));

        let second = must(graph.transfer_learning("summarize", "translate"));
        assert!(second.is_some_and(|report| !report.edge_created));
        let edges = must(graph.related_skills("summarize", &[EdgeType::SimilarTo], 0.0));
        assert_eq!(edges.len(), 1);
        assert_eq!(edges[0].weight, TRANSFER_EDGE_WEIGHT);
    }
}
