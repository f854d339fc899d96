//! Experiment lifecycle management
//!
//! This module owns the experiment status state machine:
//!
//! ```text
//!   draft ──activate──▶ active ──declare_winner / auto_complete──▶ completed
//!                        │  ▲
//!                  pause │  │ activate
//!                        ▼  │
//!                       paused
//! ```
//!
//! Transitions are validated strictly against the status the caller read and
//! then committed with a compare-and-set on that status and the experiment
//! version. Two writers racing to complete the same experiment (an operator
//! declaring a winner while the scheduler auto-completes) therefore resolve to
//! exactly one applied result; the other receives
//! [`DecisionError::StateConflict`] and nothing of its write is persisted.
//! A write whose status still matches but whose version is stale gets
//! [`DecisionError::ConcurrentModification`] instead.

use chrono::{DateTime, Utc};
use experiment_types::{Experiment, ExperimentStatus, WinnerResult};
use std::sync::Arc;
use tracing::{debug, info, warn};
use uuid::Uuid;

use crate::{
    clock::Clock,
    errors::{DecisionError, Result},
    statistical::round2,
    store::{CasOutcome, ExperimentStore},
};

/// Confidence recorded for manually declared winners
///
/// This is operator trust, not a statistical claim.
pub const MANUAL_DECLARATION_CONFIDENCE: f64 = 95.0;

/// Attempts for a load-then-commit that keeps losing to unrelated writes
pub const MAX_COMMIT_ATTEMPTS: usize = 3;

/// A requested status change
#[derive(Debug, Clone, PartialEq)]
pub enum Transition {
    Activate,
    Pause,
    /// Manual override naming the winning variation
    DeclareWinner(String),
    /// Result produced by the significance engine
    AutoComplete(WinnerResult),
}

impl Transition {
    pub fn action(&self) -> &'static str {
        match self {
            Transition::Activate => "activate",
            Transition::Pause => "pause",
            Transition::DeclareWinner(_) => "declare a winner for",
            Transition::AutoComplete(_) => "auto-complete",
        }
    }

    fn allowed_from(&self) -> &'static [ExperimentStatus] {
        match self {
            Transition::Activate => &[ExperimentStatus::Draft, ExperimentStatus::Paused],
            Transition::Pause
            | Transition::DeclareWinner(_)
            | Transition::AutoComplete(_) => &[ExperimentStatus::Active],
        }
    }
}

/// Improvement of a variation over control from the stored conversion rates
///
/// Zero when there is no control or the control has not converted anyone.
pub fn improvement_over_control(experiment: &Experiment, variation_name: &str) -> f64 {
    let (Some(control), Some(variation)) =
        (experiment.control(), experiment.variation(variation_name))
    else {
        return 0.0;
    };

    if control.conversion_rate > 0.0 {
        round2((variation.conversion_rate - control.conversion_rate) / control.conversion_rate * 100.0)
    } else {
        0.0
    }
}

/// Apply a transition to an in-memory experiment
///
/// Completed experiments reject everything with `StateConflict`; other
/// disallowed transitions are `InvalidTransition`.
pub fn apply(
    experiment: &mut Experiment,
    transition: Transition,
    now: DateTime<Utc>,
) -> Result<()> {
    if experiment.status.is_terminal() {
        return Err(DecisionError::StateConflict {
            experiment_id: experiment.id.to_string(),
            actual: experiment.status,
        });
    }

    if !transition.allowed_from().contains(&experiment.status) {
        return Err(DecisionError::InvalidTransition {
            from: experiment.status,
            action: transition.action(),
        });
    }

    match transition {
        Transition::Activate => {
            experiment.status = ExperimentStatus::Active;
            if experiment.start_date.is_none() {
                experiment.start_date = Some(now);
            }
        }
        Transition::Pause => {
            experiment.status = ExperimentStatus::Paused;
        }
        Transition::DeclareWinner(name) => {
            if experiment.variation(&name).is_none() {
                return Err(DecisionError::Validation(format!(
                    "Unknown variation '{}' for experiment {}",
                    name, experiment.id
                )));
            }
            let improvement = improvement_over_control(experiment, &name);
            experiment.results = Some(WinnerResult {
                winner: name,
                confidence: MANUAL_DECLARATION_CONFIDENCE,
                improvement,
                declared_at: Some(now),
            });
            experiment.status = ExperimentStatus::Completed;
            experiment.end_date = Some(now);
        }
        Transition::AutoComplete(result) => {
            experiment.results = Some(result.declared(now));
            experiment.status = ExperimentStatus::Completed;
            experiment.end_date = Some(now);
        }
    }

    experiment.updated_at = now;
    Ok(())
}

/// Drives experiments through their lifecycle against the experiment store
#[derive(Clone)]
pub struct LifecycleController {
    store: Arc<dyn ExperimentStore>,
    clock: Arc<dyn Clock>,
}

impl LifecycleController {
    pub fn new(store: Arc<dyn ExperimentStore>, clock: Arc<dyn Clock>) -> Self {
        Self { store, clock }
    }

    /// Start or resume an experiment
    pub async fn activate(&self, experiment_id: &Uuid) -> Result<Experiment> {
        self.load_and_commit(experiment_id, Transition::Activate).await
    }

    /// Pause a running experiment
    pub async fn pause(&self, experiment_id: &Uuid) -> Result<Experiment> {
        self.load_and_commit(experiment_id, Transition::Pause).await
    }

    /// Manually declare a winner, loading the current snapshot
    pub async fn declare_winner(
        &self,
        experiment_id: &Uuid,
        variation_name: &str,
    ) -> Result<Experiment> {
        self.load_and_commit(
            experiment_id,
            Transition::DeclareWinner(variation_name.to_string()),
        )
        .await
    }

    /// Manually declare a winner on a snapshot the caller already holds
    ///
    /// Use this after refreshing metrics so the improvement reflects current
    /// counts. The snapshot's status and version are the compare-and-set
    /// expectation.
    pub async fn declare_winner_on(
        &self,
        experiment: Experiment,
        variation_name: &str,
    ) -> Result<Experiment> {
        self.commit(experiment, Transition::DeclareWinner(variation_name.to_string()))
            .await
    }

    /// Complete an experiment with an engine-produced result
    pub async fn auto_complete(
        &self,
        experiment: Experiment,
        result: WinnerResult,
    ) -> Result<Experiment> {
        self.commit(experiment, Transition::AutoComplete(result)).await
    }

    /// Persist refreshed metrics (and a provisional result) for an active experiment
    ///
    /// Returns `false` without writing if the experiment left `active` in the
    /// meantime; fresh counts are never worth clobbering a completion.
    pub async fn record_snapshot(&self, mut experiment: Experiment) -> Result<bool> {
        if experiment.status != ExperimentStatus::Active {
            return Ok(false);
        }
        experiment.updated_at = self.clock.now();
        let expected_version = experiment.version;
        experiment.version += 1;

        let id = experiment.id;
        match self
            .store
            .compare_and_swap(ExperimentStatus::Active, expected_version, experiment)
            .await?
        {
            CasOutcome::Applied => Ok(true),
            CasOutcome::Conflict(actual) => {
                warn!(
                    experiment_id = %id,
                    actual = %actual,
                    "Discarded metrics snapshot, experiment changed since it was read"
                );
                Ok(false)
            }
        }
    }

    async fn load(&self, experiment_id: &Uuid) -> Result<Experiment> {
        self.store
            .get(experiment_id)
            .await?
            .ok_or_else(|| DecisionError::ExperimentNotFound(experiment_id.to_string()))
    }

    /// Load the current snapshot and commit, reloading when only the version moved
    async fn load_and_commit(
        &self,
        experiment_id: &Uuid,
        transition: Transition,
    ) -> Result<Experiment> {
        let mut attempt = 1;
        loop {
            let experiment = self.load(experiment_id).await?;
            match self.commit(experiment, transition.clone()).await {
                Err(DecisionError::ConcurrentModification { .. })
                    if attempt < MAX_COMMIT_ATTEMPTS =>
                {
                    debug!(experiment_id = %experiment_id, attempt, "Retrying transition");
                    attempt += 1;
                }
                other => return other,
            }
        }
    }

    async fn commit(&self, snapshot: Experiment, transition: Transition) -> Result<Experiment> {
        let expected = snapshot.status;
        let expected_version = snapshot.version;
        let action = transition.action();
        let mut next = snapshot;
        apply(&mut next, transition, self.clock.now())?;
        next.version = expected_version + 1;

        match self
            .store
            .compare_and_swap(expected, expected_version, next.clone())
            .await?
        {
            CasOutcome::Applied => {
                info!(
                    experiment_id = %next.id,
                    from = %expected,
                    to = %next.status,
                    "Experiment transitioned"
                );
                Ok(next)
            }
            CasOutcome::Conflict(actual) => {
                warn!(
                    experiment_id = %next.id,
                    expected = %expected,
                    actual = %actual,
                    "Lost race to {} experiment",
                    action
                );
                if actual == expected {
                    Err(DecisionError::ConcurrentModification {
                        experiment_id: next.id.to_string(),
                    })
                } else {
                    Err(DecisionError::StateConflict {
                        experiment_id: next.id.to_string(),
                        actual,
                    })
                }
            }
        }
    }
}
