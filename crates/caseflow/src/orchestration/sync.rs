use std::collections::BTreeMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::RwLock;

use serde::Serialize;
use tokio::sync::broadcast;

use super::recommendation::{Recommendation, RecommendationId};
use super::store::LifecycleEvent;

/// A page of recommendations changed since a poll cursor, ordered by when
/// their latest change was committed.
#[derive(Debug, Clone, Serialize)]
pub struct ChangePage {
    pub recommendations: Vec<Recommendation>,
    /// Pass this back on the next poll. Cursors are opaque monotonic values;
    /// 0 means "from the beginning".
    pub next_cursor: u64,
}

/// Append-only record of committed lifecycle transitions, doubling as the
/// push fan-out. Pollers read it without touching the per-id mutation locks,
/// so high-frequency polling never blocks writers.
pub(crate) struct ChangeJournal {
    entries: RwLock<Vec<(u64, RecommendationId)>>,
    cursor: AtomicU64,
    transitions: broadcast::Sender<LifecycleEvent>,
}

impl ChangeJournal {
    pub(crate) fn new(capacity: usize) -> Self {
        let (transitions, _) = broadcast::channel(capacity);
        Self {
            entries: RwLock::new(Vec::new()),
            cursor: AtomicU64::new(1),
            transitions,
        }
    }

    /// Append a committed transition and notify push subscribers. Broadcast
    /// delivery is lossy under slow consumers; the journal itself is the
    /// source of truth for pollers.
    pub(crate) fn record(&self, event: LifecycleEvent) {
        let sequence = self.cursor.fetch_add(1, Ordering::Relaxed);
        {
            let mut guard = self.entries.write().expect("journal lock poisoned");
            guard.push((sequence, event.recommendation.id.clone()));
        }
        let _ = self.transitions.send(event);
    }

    pub(crate) fn subscribe(&self) -> broadcast::Receiver<LifecycleEvent> {
        self.transitions.subscribe()
    }

    /// Ids changed after `since`, deduplicated to their latest change, in
    /// commit order, together with the cursor for the next poll.
    pub(crate) fn changed_since(&self, since: u64) -> (Vec<RecommendationId>, u64) {
        let guard = self.entries.read().expect("journal lock poisoned");
        let mut latest: BTreeMap<RecommendationId, u64> = BTreeMap::new();
        let mut next_cursor = since;
        for (sequence, id) in guard.iter() {
            if *sequence <= since {
                continue;
            }
            next_cursor = next_cursor.max(*sequence);
            latest
                .entry(id.clone())
                .and_modify(|seen| *seen = (*seen).max(*sequence))
                .or_insert(*sequence);
        }

        let mut ordered: Vec<(u64, RecommendationId)> = latest
            .into_iter()
            .map(|(id, sequence)| (sequence, id))
            .collect();
        ordered.sort_by_key(|(sequence, _)| *sequence);
        (ordered.into_iter().map(|(_, id)| id).collect(), next_cursor)
    }
}
