use std::collections::BTreeMap;
use std::sync::Arc;
use std::time::Instant;

use anyhow::Result;
use serde_json::{json, Value};
use skill_kernel_core::{
    build_retrieval_query, now_utc, score_relevance, ExecutionId, RetrievalConfig,
    RetrievalEvent, RETRIEVED_CONTEXT_KEY,
};
use ulid::Ulid;

use crate::{with_store, SharedStore};

/// Context lookup backend. Implementations return at most `limit` results.
pub trait Retriever: Send + Sync {
    /// # Errors
    /// Errors are logged and recorded as a zero-result lookup; they never
    /// fail the execution.
    fn retrieve(&self, query: &str, limit: u32) -> Result<Vec<Value>>;
}

/// Keyword-indexed in-memory retriever: every entry whose keyword occurs in
/// the query is returned, in keyword order.
#[derive(Debug, Clone, Default)]
pub struct StaticRetriever {
    entries: BTreeMap<String, Vec<Value>>,
}

impl StaticRetriever {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    #[must_use]
    pub fn with_entry(mut self, keyword: &str, value: Value) -> Self {
        self.entries
            .entry(keyword.to_string())
            .or_default()
            .push(value);
        self
    }
}

impl Retriever for StaticRetriever {
    fn retrieve(&self, query: &str, limit: u32) -> Result<Vec<Value>> {
        let limit = usize::try_from(limit).unwrap_or(usize::MAX);
        Ok(self
            .entries
            .iter()
            .filter(|(keyword, _)| query.contains(keyword.as_str()))
            .flat_map(|(_, values)| values.iter().cloned())
            .take(limit)
            .collect())
    }
}

#[derive(Clone)]
pub struct RetrievalHook {
    store: SharedStore,
    config: Arc<RetrievalConfig>,
    retriever: Option<Arc<dyn Retriever>>,
}

impl RetrievalHook {
    #[must_use]
    pub fn new(store: SharedStore, config: RetrievalConfig) -> Self {
        Self {
            store,
            config: Arc::new(config),
            retriever: None,
        }
    }

    #[must_use]
    pub fn with_retriever(mut self, retriever: Arc<dyn Retriever>) -> Self {
        self.retriever = Some(retriever);
        self
    }

    #[must_use]
    pub fn is_active(&self) -> bool {
        self.config.enabled && self.retriever.is_some()
    }

    /// Queries for context, attaches relevant results to `input` under
    /// [`RETRIEVED_CONTEXT_KEY`], and records the lookup. Returns `None`
    /// when retrieval is disabled.
    ///
    /// # Errors
    /// Returns an error only when the retrieval event cannot be stored.
    pub fn enrich(
        &self,
        execution_id: ExecutionId,
        skill: &str,
        input: &mut Value,
    ) -> Result<Option<RetrievalEvent>> {
        let Some(retriever) = self.retriever.as_ref().filter(|_| self.config.enabled) else {
            return Ok(None);
        };

        let query = build_retrieval_query(skill, input, self.config.query_input_chars);
        let started = Instant::now();
        let results = match retriever.retrieve(&query, self.config.max_results) {
            Ok(mut results) => {
                results.truncate(usize::try_from(self.config.max_results).unwrap_or(usize::MAX));
                results
            }
            Err(err) => {
                tracing::warn!(skill, error = %err, "context retrieval failed");
                Vec::new()
            }
        };
        let latency_ms = u64::try_from(started.elapsed().as_millis()).unwrap_or(u64::MAX);

        let result_count = u32::try_from(results.len()).unwrap_or(u32::MAX);
        let relevance = score_relevance(result_count, self.config.target_results);
        let used = result_count > 0 && relevance >= self.config.min_relevance;
        if used {
            if let Value::Object(map) = input {
                map.insert(
                    RETRIEVED_CONTEXT_KEY.to_string(),
                    json!({ "query": query, "relevance": relevance, "results": results }),
                );
            }
        }

        let event = RetrievalEvent {
            retrieval_id: Ulid::new(),
            execution_id,
            skill: skill.to_string(),
            query,
            result_count,
            relevance,
            latency_ms,
            used,
            recorded_at: now_utc(),
        };
        with_store(&self.store, |store| store.record_retrieval_event(&event))?;
        Ok(Some(event))
    }
}

#[cfg(test)]
mod tests {
    #![allow(clippy::float_cmp)]

    use std::path::Path;
    use std::sync::Mutex;

    use anyhow::anyhow;
    use skill_kernel_store_sqlite::SqliteSkillStore;

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
        Arc::new(Mutex::new(store))
    }

    struct FailingRetriever;

    impl Retriever for FailingRetriever {
        fn retrieve(&self, _query: &str, _limit: u32) -> Result<Vec<Value>> {
            Err(anyhow!("index offline"))
        }
    }

    #[test]
    fn disabled_without_retriever() {
        let hook = RetrievalHook::new(fixture_store(), RetrievalConfig::v1());
        let mut input = json!({"text": "a"});
        assert!(must(hook.enrich(ExecutionId::new(), "summarize", &mut input)).is_none());
        assert!(input.get(RETRIEVED_CONTEXT_KEY).is_none());
    }

    #[test]
    fn relevant_results_are_attached_and_recorded() {
        let store = fixture_store();
        let retriever = StaticRetriever::new()
            .with_entry("summarize", json!("prior summary one"))
            .with_entry("summarize", json!("prior summary two"))
            .with_entry("translate", json!("unrelated"));
        let hook = RetrievalHook::new(store.clone(), RetrievalConfig::v1())
            .with_retriever(Arc::new(retriever));

        let mut input = json!({"text": "quarterly report"});
        let event = must(hook.enrich(ExecutionId::new(), "summarize", &mut input));
        let event = event.unwrap_or_else(|| unreachable!());
        assert_eq!(event.result_count, 2);
        assert_eq!(event.relevance, 0.5);
        assert!(event.used);
        assert_eq!(input[RETRIEVED_CONTEXT_KEY]["results"].as_array().map(Vec::len), Some(2));

        let stored = must(with_store(&store, |store| store.list_retrieval_events(Some("summarize"))));
        assert_eq!(stored.len(), 1);
    }

    #[test]
    fn weak_results_are_recorded_but_not_attached() {
        let hook = RetrievalHook::new(fixture_store(), RetrievalConfig::v1())
            .with_retriever(Arc::new(StaticRetriever::new().with_entry("lint", json!("hint"))));
        let mut input = json!({"file": "a.rs"});
        let event = must(hook.enrich(ExecutionId::new(), "lint", &mut input));
        let event = event.unwrap_or_else(|| unreachable!());
        assert_eq!(event.relevance, 0.25);
        assert!(!event.used);
        assert!(input.get(RETRIEVED_CONTEXT_KEY).is_none());
    }

    #[test]
    fn retriever_failure_becomes_zero_result_event() {
        let hook = RetrievalHook::new(fixture_store(), RetrievalConfig::v1())
            .with_retriever(Arc::new(FailingRetriever));
        let mut input = json!({"file": "a.rs"});
        let event = must(hook.enrich(ExecutionId::new(), "lint", &mut input));
        let event = event.unwrap_or_else(|| unreachable!());
        assert_eq!(event.result_count, 0);
        assert_eq!(event.relevance, 0.0);
        assert!(!event.used);
    }
}
