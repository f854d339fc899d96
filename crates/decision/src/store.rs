//! Collaborator stores used by the decision engine
//!
//! The engine reads visitor outcomes from a [`SessionStore`], reads and writes
//! experiments through an [`ExperimentStore`], and persists sticky variation
//! assignments in an [`AssignmentStore`]. All three are async traits so that
//! database-backed implementations can be plugged in; in-memory versions
//! backed by `DashMap` are provided for the daemon and for tests.
//!
//! ## Concurrency contract
//!
//! - [`ExperimentStore::compare_and_swap`] must apply the write atomically and
//!   only if the persisted status and version both still equal what the
//!   caller read. Callers stamp the incoming experiment with the next version.
//! - [`AssignmentStore::assign_if_absent`] must be write-once: the first
//!   assignment for a `(experiment, session)` pair wins and every caller gets
//!   that stored value back.

use async_trait::async_trait;
use dashmap::DashMap;
use experiment_types::{
    Assignment, Experiment, ExperimentStatus, SessionCounts, SessionRecord,
};
use std::sync::Arc;
use thiserror::Error;
use tracing::trace;
use uuid::Uuid;

/// Store failure
#[derive(Error, Debug, Clone)]
pub enum StoreError {
    #[error("Store unavailable: {0}")]
    Unavailable(String),

    #[error("Record not found: {0}")]
    NotFound(String),
}

pub type StoreResult<T> = std::result::Result<T, StoreError>;

/// Outcome of a compare-and-set write
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CasOutcome {
    /// The write was applied
    Applied,
    /// The persisted status or version differed; nothing was written.
    /// Carries the persisted status.
    Conflict(ExperimentStatus),
}

/// Filter for listing experiments
#[derive(Debug, Clone, Default)]
pub struct ExperimentFilter {
    pub website_id: Option<String>,
    pub status: Option<ExperimentStatus>,
}

impl ExperimentFilter {
    /// Only experiments in the given status
    pub fn with_status(status: ExperimentStatus) -> Self {
        Self {
            website_id: None,
            status: Some(status),
        }
    }

    /// Only experiments of the given website
    pub fn for_website(mut self, website_id: impl Into<String>) -> Self {
        self.website_id = Some(website_id.into());
        self
    }

    pub fn matches(&self, experiment: &Experiment) -> bool {
        self.website_id
            .as_ref()
            .map_or(true, |w| *w == experiment.website_id)
            && self.status.map_or(true, |s| s == experiment.status)
    }
}

/// Persisted experiment aggregates
#[async_trait]
pub trait ExperimentStore: Send + Sync {
    /// Store a new experiment
    async fn insert(&self, experiment: Experiment) -> StoreResult<()>;

    /// Load an experiment by id
    async fn get(&self, id: &Uuid) -> StoreResult<Option<Experiment>>;

    /// List experiments matching the filter, newest first
    async fn list(&self, filter: &ExperimentFilter) -> StoreResult<Vec<Experiment>>;

    /// Replace the stored experiment if its status still equals
    /// `expected_status` and its version still equals `expected_version`
    ///
    /// Returns `StoreError::NotFound` when no experiment with that id exists.
    async fn compare_and_swap(
        &self,
        expected_status: ExperimentStatus,
        expected_version: u64,
        experiment: Experiment,
    ) -> StoreResult<CasOutcome>;
}

/// Read-only view of visitor sessions
#[async_trait]
pub trait SessionStore: Send + Sync {
    /// Count sessions tagged with the experiment and variation
    async fn count(&self, experiment_id: &Uuid, variation_name: &str)
        -> StoreResult<SessionCounts>;
}

/// Write-once sticky assignments
#[async_trait]
pub trait AssignmentStore: Send + Sync {
    async fn get(&self, experiment_id: &Uuid, session_id: &str) -> StoreResult<Option<Assignment>>;

    /// Persist the assignment unless one already exists; returns the stored value
    async fn assign_if_absent(&self, assignment: Assignment) -> StoreResult<Assignment>;
}

/// In-memory experiment store
#[derive(Debug, Clone, Default)]
pub struct MemoryExperimentStore {
    experiments: Arc<DashMap<Uuid, Experiment>>,
}

impl MemoryExperimentStore {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn len(&self) -> usize {
        self.experiments.len()
    }

    pub fn is_empty(&self) -> bool {
        self.experiments.is_empty()
    }
}

#[async_trait]
impl ExperimentStore for MemoryExperimentStore {
    async fn insert(&self, experiment: Experiment) -> StoreResult<()> {
        self.experiments.insert(experiment.id, experiment);
        Ok(())
    }

    async fn get(&self, id: &Uuid) -> StoreResult<Option<Experiment>> {
        Ok(self.experiments.get(id).map(|e| e.value().clone()))
    }

    async fn list(&self, filter: &ExperimentFilter) -> StoreResult<Vec<Experiment>> {
        let mut experiments: Vec<Experiment> = self
            .experiments
            .iter()
            .filter(|e| filter.matches(e.value()))
            .map(|e| e.value().clone())
            .collect();
        experiments.sort_by(|a, b| b.created_at.cmp(&a.created_at));
        Ok(experiments)
    }

    async fn compare_and_swap(
        &self,
        expected_status: ExperimentStatus,
        expected_version: u64,
        experiment: Experiment,
    ) -> StoreResult<CasOutcome> {
        // The shard write lock is held for the whole check-then-write
        let mut entry = self
            .experiments
            .get_mut(&experiment.id)
            .ok_or_else(|| StoreError::NotFound(experiment.id.to_string()))?;

        if entry.status != expected_status || entry.version != expected_version {
            trace!(
                experiment_id = %experiment.id,
                expected_status = %expected_status,
                actual_status = %entry.status,
                expected_version,
                actual_version = entry.version,
                "Compare-and-swap rejected"
            );
            return Ok(CasOutcome::Conflict(entry.status));
        }

        *entry = experiment;
        Ok(CasOutcome::Applied)
    }
}

/// In-memory session store
#[derive(Debug, Clone, Default)]
pub struct MemorySessionStore {
    sessions: Arc<DashMap<String, SessionRecord>>,
}

impl MemorySessionStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// Insert or replace a session record
    pub fn record(&self, session: SessionRecord) {
        self.sessions.insert(session.session_id.clone(), session);
    }

    /// Flag a session as converted; returns false for unknown sessions
    pub fn mark_converted(&self, session_id: &str) -> bool {
        match self.sessions.get_mut(session_id) {
            Some(mut session) => {
                session.converted = true;
                true
            }
            None => false,
        }
    }

    /// Record `visitors` sessions for a variation, the first `conversions` converted
    pub fn seed_variation(
        &self,
        experiment_id: Uuid,
        variation_name: &str,
        visitors: u64,
        conversions: u64,
    ) {
        for i in 0..visitors {
            self.record(SessionRecord {
                session_id: format!("{}-{}-{}", experiment_id, variation_name, i),
                experiment_id,
                variation_name: variation_name.to_string(),
                converted: i < conversions,
            });
        }
    }
}

#[async_trait]
impl SessionStore for MemorySessionStore {
    async fn count(
        &self,
        experiment_id: &Uuid,
        variation_name: &str,
    ) -> StoreResult<SessionCounts> {
        let counts = self
            .sessions
            .iter()
            .filter(|s| s.experiment_id == *experiment_id && s.variation_name == variation_name)
            .fold(SessionCounts::default(), |mut acc, s| {
                acc.sessions += 1;
                if s.converted {
                    acc.converted += 1;
                }
                acc
            });
        Ok(counts)
    }
}

/// In-memory assignment store
#[derive(Debug, Clone, Default)]
pub struct MemoryAssignmentStore {
    assignments: Arc<DashMap<(Uuid, String), Assignment>>,
}

impl MemoryAssignmentStore {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn len(&self) -> usize {
        self.assignments.len()
    }

    pub fn is_empty(&self) -> bool {
        self.assignments.is_empty()
    }
}

#[async_trait]
impl AssignmentStore for MemoryAssignmentStore {
    async fn get(&self, experiment_id: &Uuid, session_id: &str) -> StoreResult<Option<Assignment>> {
        Ok(self
            .assignments
            .get(&(*experiment_id, session_id.to_string()))
            .map(|a| a.value().clone()))
    }

    async fn assign_if_absent(&self, assignment: Assignment) -> StoreResult<Assignment> {
        let key = (assignment.experiment_id, assignment.session_id.clone());
        let stored = self.assignments.entry(key).or_insert(assignment);
        Ok(stored.value().clone())
    }
}
