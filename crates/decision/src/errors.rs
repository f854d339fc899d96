//! Error types for decision engine

use experiment_types::ExperimentStatus;
use thiserror::Error;

use crate::store::StoreError;

pub type Result<T> = std::result::Result<T, DecisionError>;

#[derive(Error, Debug)]
pub enum DecisionError {
    #[error("Validation error: {0}")]
    Validation(String),

    /// Lost a compare-and-set on the experiment status
    #[error("State conflict on experiment {experiment_id}: status is now {actual}")]
    StateConflict {
        experiment_id: String,
        actual: ExperimentStatus,
    },

    /// Status still matched but another write landed since the read
    #[error("Experiment {experiment_id} was modified concurrently")]
    ConcurrentModification { experiment_id: String },

    #[error("Cannot {action} an experiment in status {from}")]
    InvalidTransition {
        from: ExperimentStatus,
        action: &'static str,
    },

    #[error("Experiment not found: {0}")]
    ExperimentNotFound(String),

    #[error("Malformed data: {0}")]
    MalformedData(String),

    #[error("Store error: {0}")]
    Store(#[from] StoreError),
}

impl DecisionError {
    /// Whether this error came from losing a concurrent update
    pub fn is_conflict(&self) -> bool {
        matches!(
            self,
            DecisionError::StateConflict { .. } | DecisionError::ConcurrentModification { .. }
        )
    }

    /// Whether this error was caused by caller input
    pub fn is_validation(&self) -> bool {
        matches!(self, DecisionError::Validation(_))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_error_classification() {
        let lost = DecisionError::StateConflict {
            experiment_id: "e1".to_string(),
            actual: ExperimentStatus::Completed,
        };
        let stale = DecisionError::ConcurrentModification {
            experiment_id: "e1".to_string(),
        };
        assert!(lost.is_conflict());
        assert!(stale.is_conflict());
        assert!(!stale.is_validation());

        let store: DecisionError = StoreError::Unavailable("down".to_string()).into();
        assert!(matches!(store, DecisionError::Store(StoreError::Unavailable(_))));
        assert!(!store.is_conflict());
        assert_eq!(store.to_string(), "Store error: Store unavailable: down");
    }
}
