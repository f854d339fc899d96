//! Recomputes per-variation visitor and conversion counts from the session store.

use experiment_types::{Experiment, SessionCounts};
use std::sync::Arc;
use tracing::debug;

use crate::errors::{DecisionError, Result};
use crate::store::SessionStore;

/// Rebuilds variation counts from session records
///
/// Cached counts on an experiment are never trusted; every significance
/// evaluation is preceded by a refresh.
#[derive(Clone)]
pub struct MetricsAggregator {
    sessions: Arc<dyn SessionStore>,
}

impl MetricsAggregator {
    pub fn new(sessions: Arc<dyn SessionStore>) -> Self {
        Self { sessions }
    }

    /// Overwrite every variation's counts with fresh ones
    ///
    /// All counts are fetched before any are applied, so on error the
    /// experiment is left untouched.
    pub async fn refresh_metrics(&self, experiment: &mut Experiment) -> Result<()> {
        let mut fresh: Vec<SessionCounts> = Vec::with_capacity(experiment.variations.len());

        for variation in &experiment.variations {
            let counts = self.sessions.count(&experiment.id, &variation.name).await?;
            if counts.converted > counts.sessions {
                return Err(DecisionError::MalformedData(format!(
                    "variation '{}' of experiment {} reports {} conversions for {} sessions",
                    variation.name, experiment.id, counts.converted, counts.sessions
                )));
            }
            fresh.push(counts);
        }

        for (variation, counts) in experiment.variations.iter_mut().zip(fresh) {
            variation.record_counts(counts.sessions, counts.converted);
        }

        debug!(
            experiment_id = %experiment.id,
            total_visitors = experiment.total_visitors(),
            "Refreshed experiment metrics"
        );

        Ok(())
    }
}
