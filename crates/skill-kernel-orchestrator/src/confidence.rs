use std::sync::Arc;
use std::time::{Duration as StdDuration, Instant};

use anyhow::Result;
use dashmap::DashMap;
use serde::{Deserialize, Serialize};
use skill_kernel_core::{
    compute_confidence, ConfidenceBreakdown, ConfidenceEvent, ConfidenceEventInput,
    ConfidenceEventKind, ConfidenceRuleset, ExecutionRecord,
};
use skill_kernel_store_sqlite::ConfidenceSnapshot;
use time::{Duration, OffsetDateTime};

use crate::{with_store, SharedStore};

#[derive(Debug, Clone, Copy)]
struct CachedConfidence {
    value: f64,
    cached_at: Instant,
}

/// Bounded-staleness per-agent confidence cache.
#[derive(Debug)]
pub struct ConfidenceCache {
    ttl: StdDuration,
    entries: DashMap<String, CachedConfidence>,
}

impl ConfidenceCache {
    #[must_use]
    pub fn new(ttl: StdDuration) -> Self {
        Self {
            ttl,
            entries: DashMap::new(),
        }
    }

    #[must_use]
    pub fn get(&self, agent: &str) -> Option<f64> {
        let entry = self.entries.get(agent)?;
        if entry.cached_at.elapsed() <= self.ttl {
            return Some(entry.value);
        }
        drop(entry);
        self.entries.remove(agent);
        None
    }

    pub fn put(&self, agent: &str, value: f64) {
        self.entries.insert(
            agent.to_string(),
            CachedConfidence {
                value,
                cached_at: Instant::now(),
            },
        );
    }

    pub fn invalidate(&self, agent: &str) {
        self.entries.remove(agent);
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct ConfidenceUpdate {
    pub agent: String,
    pub kind: ConfidenceEventKind,
    /// `None` when the event was a replay of one already recorded.
    pub event: Option<ConfidenceEvent>,
    pub breakdown: ConfidenceBreakdown,
    pub snapshot: ConfidenceSnapshot,
}

#[derive(Clone)]
pub struct ConfidenceTracker {
    store: SharedStore,
    ruleset: Arc<ConfidenceRuleset>,
    cache: Arc<ConfidenceCache>,
}

impl ConfidenceTracker {
    #[must_use]
    pub fn new(store: SharedStore, ruleset: ConfidenceRuleset, cache_ttl: StdDuration) -> Self {
        Self {
            store,
            ruleset: Arc::new(ruleset),
            cache: Arc::new(ConfidenceCache::new(cache_ttl)),
        }
    }

    #[must_use]
    pub fn ruleset(&self) -> &ConfidenceRuleset {
        &self.ruleset
    }

    /// Appends an event, recomputes the agent's confidence, snapshots it and
    /// refreshes the cache.
    ///
    /// # Errors
    /// Returns an error when the event is invalid or the store fails.
    pub fn record(
        &self,
        input: &ConfidenceEventInput,
        as_of: OffsetDateTime,
    ) -> Result<ConfidenceUpdate> {
        self.cache.invalidate(&input.agent);
        let window_start = self.window_start(as_of);
        let reason = format!("{}: {}", input.kind.as_str(), input.evidence);

        let update = with_store(&self.store, |store| {
            let event = store.append_confidence_event(input)?;
            let events = store.list_confidence_events(&input.agent, Some(window_start))?;
            let breakdown = compute_confidence(&events, &self.ruleset, as_of);
            let snapshot =
                store.record_confidence_snapshot(&input.agent, &breakdown, as_of, &reason)?;
            Ok(ConfidenceUpdate {
                agent: input.agent.clone(),
                kind: input.kind,
                event,
                breakdown,
                snapshot,
            })
        })?;

        self.cache.put(&input.agent, update.breakdown.confidence);
        tracing::debug!(
            agent = %input.agent,
            kind = input.kind.as_str(),
            confidence = update.breakdown.confidence,
            recent_failures = update.breakdown.recent_failures,
            "confidence updated"
        );
        Ok(update)
    }

    /// # Errors
    /// Returns an error when the store fails.
    pub fn record_execution(
        &self,
        record: &ExecutionRecord,
        as_of: OffsetDateTime,
    ) -> Result<ConfidenceUpdate> {
        self.record(&ConfidenceEventInput::from_execution(record), as_of)
    }

    /// Fresh projection straight from the event log.
    ///
    /// # Errors
    /// Returns an error when the store fails.
    pub fn confidence(&self, agent: &str, as_of: OffsetDateTime) -> Result<ConfidenceBreakdown> {
        let window_start = self.window_start(as_of);
        let events = with_store(&self.store, |store| {
            store.list_confidence_events(agent, Some(window_start))
        })?;
        let breakdown = compute_confidence(&events, &self.ruleset, as_of);
        self.cache.put(agent, breakdown.confidence);
        Ok(breakdown)
    }

    /// Cached confidence, at most one TTL stale.
    ///
    /// # Errors
    /// Returns an error when a cache miss has to hit the store and it fails.
    pub fn cached_confidence(&self, agent: &str, as_of: OffsetDateTime) -> Result<f64> {
        if let Some(value) = self.cache.get(agent) {
            return Ok(value);
        }
        Ok(self.confidence(agent, as_of)?.confidence)
    }

    fn window_start(&self, as_of: OffsetDateTime) -> OffsetDateTime {
        as_of - Duration::seconds_f64(self.ruleset.lookback_days * 86_400.0)
    }
}
