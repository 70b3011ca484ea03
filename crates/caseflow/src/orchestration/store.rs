use std::collections::HashMap;
use std::sync::{Arc, Mutex, RwLock};

use chrono::Utc;
use serde::Serialize;
use tokio::sync::broadcast;
use tracing::info;

use super::recommendation::{
    ActionStep, Recommendation, RecommendationId, RecommendationStatus,
};
use super::sync::{ChangeJournal, ChangePage};

/// Storage abstraction behind the lifecycle store so deployments can swap
/// the in-memory map for a persistent table.
pub trait RecommendationRepository: Send + Sync {
    fn insert(&self, record: Recommendation) -> Result<(), RepositoryError>;
    fn update(&self, record: Recommendation) -> Result<(), RepositoryError>;
    fn fetch(&self, id: &RecommendationId) -> Result<Option<Recommendation>, RepositoryError>;
    fn list(
        &self,
        status: Option<RecommendationStatus>,
    ) -> Result<Vec<Recommendation>, RepositoryError>;
}

/// Error enumeration for repository failures.
#[derive(Debug, thiserror::Error)]
pub enum RepositoryError {
    #[error("record already exists")]
    Conflict,
    #[error("record not found")]
    NotFound,
    #[error("repository unavailable: {0}")]
    Unavailable(String),
}

/// Default map-backed repository. Listing orders by creation time then id so
/// repeated reads without intervening writes return identical results.
#[derive(Default)]
pub struct InMemoryRecommendationRepository {
    records: RwLock<HashMap<RecommendationId, Recommendation>>,
}

impl RecommendationRepository for InMemoryRecommendationRepository {
    fn insert(&self, record: Recommendation) -> Result<(), RepositoryError> {
        let mut guard = self.records.write().expect("repository lock poisoned");
        if guard.contains_key(&record.id) {
            return Err(RepositoryError::Conflict);
        }
        guard.insert(record.id.clone(), record);
        Ok(())
    }

    fn update(&self, record: Recommendation) -> Result<(), RepositoryError> {
        let mut guard = self.records.write().expect("repository lock poisoned");
        if guard.contains_key(&record.id) {
            guard.insert(record.id.clone(), record);
            Ok(())
        } else {
            Err(RepositoryError::NotFound)
        }
    }

    fn fetch(&self, id: &RecommendationId) -> Result<Option<Recommendation>, RepositoryError> {
        let guard = self.records.read().expect("repository lock poisoned");
        Ok(guard.get(id).cloned())
    }

    fn list(
        &self,
        status: Option<RecommendationStatus>,
    ) -> Result<Vec<Recommendation>, RepositoryError> {
        let guard = self.records.read().expect("repository lock poisoned");
        let mut records: Vec<Recommendation> = guard
            .values()
            .filter(|record| status.map_or(true, |wanted| record.status == wanted))
            .cloned()
            .collect();
        records.sort_by(|a, b| {
            a.created_at
                .cmp(&b.created_at)
                .then_with(|| a.id.cmp(&b.id))
        });
        Ok(records)
    }
}

/// Illegal state transition or unknown id. The caller should re-fetch the
/// current state before deciding what to do next.
#[derive(Debug, thiserror::Error)]
pub enum LifecycleError {
    #[error("recommendation '{0}' not found")]
    NotFound(RecommendationId),
    #[error("recommendation '{id}' is {current}, expected {expected}")]
    InvalidState {
        id: RecommendationId,
        current: &'static str,
        expected: &'static str,
    },
    #[error(transparent)]
    Repository(#[from] RepositoryError),
}

/// Kind of committed transition carried by a [`LifecycleEvent`].
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum LifecycleEventKind {
    RecommendationCreated,
    Approved,
    ExecutionStarted,
    StepProgress,
    Completed,
    Failed,
    Rejected,
}

/// Snapshot of a recommendation at the moment a transition committed,
/// delivered to push subscribers and recorded in the poll journal.
#[derive(Debug, Clone, Serialize)]
pub struct LifecycleEvent {
    pub kind: LifecycleEventKind,
    pub recommendation: Recommendation,
}

/// Single source of truth for recommendation status. Enforces the state
/// machine and serializes all mutations per id: concurrent approve/reject
/// calls on the same recommendation cannot both succeed, and the loser sees
/// an `InvalidState` error rather than silent success. Reads never take the
/// per-id lock.
pub struct LifecycleStore {
    repository: Arc<dyn RecommendationRepository>,
    locks: Mutex<HashMap<RecommendationId, Arc<Mutex<()>>>>,
    journal: ChangeJournal,
}

impl LifecycleStore {
    pub fn new(repository: Arc<dyn RecommendationRepository>) -> Self {
        Self {
            repository,
            locks: Mutex::new(HashMap::new()),
            journal: ChangeJournal::new(128),
        }
    }

    fn id_lock(&self, id: &RecommendationId) -> Arc<Mutex<()>> {
        let mut guard = self.locks.lock().expect("lock table poisoned");
        guard.entry(id.clone()).or_default().clone()
    }

    /// Drop the lock entry for a record that reached a terminal state, so
    /// the table does not grow with every recommendation ever stored. A
    /// late caller re-creating the entry is harmless: terminal states admit
    /// no further transitions, so its mutation fails the status guard.
    fn release_lock(&self, id: &RecommendationId) {
        let mut guard = self.locks.lock().expect("lock table poisoned");
        guard.remove(id);
    }

    #[cfg(test)]
    pub(crate) fn lock_table_size(&self) -> usize {
        self.locks.lock().expect("lock table poisoned").len()
    }

    fn fetch_required(&self, id: &RecommendationId) -> Result<Recommendation, LifecycleError> {
        self.repository
            .fetch(id)?
            .ok_or_else(|| LifecycleError::NotFound(id.clone()))
    }

    fn commit(
        &self,
        kind: LifecycleEventKind,
        record: Recommendation,
    ) -> Result<Recommendation, LifecycleError> {
        self.repository.update(record.clone())?;
        self.journal.record(LifecycleEvent {
            kind,
            recommendation: record.clone(),
        });
        Ok(record)
    }

    /// Insert a freshly built recommendation in `pending_approval` and emit
    /// the `recommendation_created` notification.
    pub(crate) fn insert_pending(
        &self,
        record: Recommendation,
    ) -> Result<Recommendation, LifecycleError> {
        debug_assert_eq!(record.status, RecommendationStatus::PendingApproval);
        self.repository.insert(record.clone())?;
        self.journal.record(LifecycleEvent {
            kind: LifecycleEventKind::RecommendationCreated,
            recommendation: record.clone(),
        });
        info!(recommendation_id = %record.id, confidence = record.confidence, "recommendation created");
        Ok(record)
    }

    /// Approve a pending recommendation and hand it off to execution. The
    /// returned record is already `executing`. A second approve call on the
    /// same id is an error, never a no-op: re-approving an already-executing
    /// plan would duplicate downstream side effects.
    pub fn approve(
        &self,
        id: &RecommendationId,
        actor: &str,
    ) -> Result<Recommendation, LifecycleError> {
        let lock = self.id_lock(id);
        let _guard = lock.lock().expect("per-id lock poisoned");

        let mut record = self.fetch_required(id)?;
        if record.status != RecommendationStatus::PendingApproval {
            return Err(LifecycleError::InvalidState {
                id: id.clone(),
                current: record.status.label(),
                expected: RecommendationStatus::PendingApproval.label(),
            });
        }

        record.status = RecommendationStatus::Approved;
        record.decided_at = Some(Utc::now());
        record.decided_by = Some(actor.to_string());
        let mut record = self.commit(LifecycleEventKind::Approved, record)?;

        record.status = RecommendationStatus::Executing;
        let record = self.commit(LifecycleEventKind::ExecutionStarted, record)?;
        info!(recommendation_id = %id, actor, "recommendation approved; execution starting");
        Ok(record)
    }

    /// Reject a pending recommendation. Terminal; no execution side effects.
    pub fn reject(
        &self,
        id: &RecommendationId,
        actor: &str,
    ) -> Result<Recommendation, LifecycleError> {
        let lock = self.id_lock(id);
        let _guard = lock.lock().expect("per-id lock poisoned");

        let mut record = self.fetch_required(id)?;
        if record.status != RecommendationStatus::PendingApproval {
            return Err(LifecycleError::InvalidState {
                id: id.clone(),
                current: record.status.label(),
                expected: RecommendationStatus::PendingApproval.label(),
            });
        }

        record.status = RecommendationStatus::Rejected;
        record.decided_at = Some(Utc::now());
        record.decided_by = Some(actor.to_string());
        let record = self.commit(LifecycleEventKind::Rejected, record)?;
        self.release_lock(id);
        info!(recommendation_id = %id, actor, "recommendation rejected");
        Ok(record)
    }

    /// Commit step-level progress while the plan runs so pollers observe it.
    pub(crate) fn record_plan_progress(
        &self,
        id: &RecommendationId,
        action_plan: Vec<ActionStep>,
    ) -> Result<Recommendation, LifecycleError> {
        self.executing_update(id, LifecycleEventKind::StepProgress, |record| {
            record.action_plan = action_plan;
        })
    }

    /// Called only by the executor once every step succeeded.
    pub(crate) fn mark_completed(
        &self,
        id: &RecommendationId,
        action_plan: Vec<ActionStep>,
    ) -> Result<Recommendation, LifecycleError> {
        self.executing_update(id, LifecycleEventKind::Completed, |record| {
            record.action_plan = action_plan;
            record.status = RecommendationStatus::Completed;
            record.completed_at = Some(Utc::now());
        })
    }

    /// Called only by the executor after a step exhausted its retries.
    pub(crate) fn mark_failed(
        &self,
        id: &RecommendationId,
        action_plan: Vec<ActionStep>,
    ) -> Result<Recommendation, LifecycleError> {
        self.executing_update(id, LifecycleEventKind::Failed, |record| {
            record.action_plan = action_plan;
            record.status = RecommendationStatus::Failed;
        })
    }

    fn executing_update<F>(
        &self,
        id: &RecommendationId,
        kind: LifecycleEventKind,
        apply: F,
    ) -> Result<Recommendation, LifecycleError>
    where
        F: FnOnce(&mut Recommendation),
    {
        let lock = self.id_lock(id);
        let _guard = lock.lock().expect("per-id lock poisoned");

        let mut record = self.fetch_required(id)?;
        if record.status != RecommendationStatus::Executing {
            return Err(LifecycleError::InvalidState {
                id: id.clone(),
                current: record.status.label(),
                expected: RecommendationStatus::Executing.label(),
            });
        }
        apply(&mut record);
        let record = self.commit(kind, record)?;
        if record.status.is_terminal() {
            self.release_lock(id);
        }
        Ok(record)
    }

    /// Read-only fetch; observes the latest committed state.
    pub fn get(&self, id: &RecommendationId) -> Result<Option<Recommendation>, RepositoryError> {
        self.repository.fetch(id)
    }

    /// Read-only listing, optionally filtered by status. The primary read
    /// path for dashboards; never blocks on the per-id locks.
    pub fn list(
        &self,
        status: Option<RecommendationStatus>,
    ) -> Result<Vec<Recommendation>, RepositoryError> {
        self.repository.list(status)
    }

    /// Pull contract with bounded staleness: recommendations whose latest
    /// transition committed after `since_cursor`, plus the cursor to resume
    /// from.
    pub fn poll(
        &self,
        status: Option<RecommendationStatus>,
        since_cursor: u64,
    ) -> Result<ChangePage, RepositoryError> {
        let (ids, next_cursor) = self.journal.changed_since(since_cursor);
        let mut recommendations = Vec::with_capacity(ids.len());
        for id in ids {
            if let Some(record) = self.repository.fetch(&id)? {
                if status.map_or(true, |wanted| record.status == wanted) {
                    recommendations.push(record);
                }
            }
        }
        Ok(ChangePage {
            recommendations,
            next_cursor,
        })
    }

    /// Push channel firing on every committed transition. Lossy for slow
    /// consumers; pair with `poll` for guaranteed observation.
    pub fn subscribe(&self) -> broadcast::Receiver<LifecycleEvent> {
        self.journal.subscribe()
    }
}
