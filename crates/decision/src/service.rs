//! Inbound experiment operations
//!
//! [`ExperimentService`] is the transport-agnostic entry point for request
//! handlers: creating and listing experiments, reading an experiment with
//! fresh results, status changes, manual winner declaration, and sticky
//! visitor assignment with the matching personalization rule.

use experiment_config::{EngineConfig, ExperimentDefaults};
use experiment_types::{
    Assignment, Experiment, ExperimentSettings, ExperimentStatus, PersonalizationRule,
    SettingsRequest, Variation,
};
use rand::rngs::StdRng;
use rand::RngCore;
use serde::{Deserialize, Serialize};
use std::collections::HashSet;
use std::sync::Arc;
use tracing::{debug, info};
use uuid::Uuid;

use crate::{
    allocator::TrafficAllocator,
    clock::Clock,
    errors::{DecisionError, Result},
    lifecycle::{LifecycleController, MAX_COMMIT_ATTEMPTS},
    metrics::MetricsAggregator,
    statistical::SignificanceEngine,
    store::{AssignmentStore, ExperimentFilter, ExperimentStore, SessionStore},
};

/// Tolerance when checking that traffic shares sum to 100
const TRAFFIC_TOLERANCE: f64 = 0.01;

/// Request to create an experiment
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct NewExperiment {
    pub website_id: String,
    pub name: String,
    #[serde(default)]
    pub description: Option<String>,
    pub variations: Vec<Variation>,
    /// Missing fields fall back to configured defaults
    #[serde(default)]
    pub settings: SettingsRequest,
}

/// Operator-requested status change
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub enum StatusUpdate {
    Activate,
    Pause,
}

/// Settings built from the configured defaults
pub fn default_settings(defaults: &ExperimentDefaults) -> ExperimentSettings {
    ExperimentSettings {
        min_sample_size: defaults.min_sample_size,
        min_confidence: defaults.min_confidence,
        max_duration_days: defaults.max_duration_days,
        ..Default::default()
    }
}

/// Validate experiment settings
pub fn validate_settings(settings: &ExperimentSettings) -> Result<()> {
    if settings.min_sample_size < 1 {
        return Err(DecisionError::Validation(
            "min_sample_size must be at least 1".to_string(),
        ));
    }
    if !(0.0..=100.0).contains(&settings.min_confidence) {
        return Err(DecisionError::Validation(format!(
            "min_confidence must be within 0-100, got {}",
            settings.min_confidence
        )));
    }
    if settings.max_duration_days < 1 {
        return Err(DecisionError::Validation(
            "max_duration_days must be at least 1".to_string(),
        ));
    }
    Ok(())
}

/// Validate a variation list for a new experiment
pub fn validate_variations(variations: &[Variation]) -> Result<()> {
    if variations.len() < 2 {
        return Err(DecisionError::Validation(
            "At least 2 variations required".to_string(),
        ));
    }

    let mut names = HashSet::new();
    for variation in variations {
        if variation.name.trim().is_empty() {
            return Err(DecisionError::Validation(
                "Variation names must not be empty".to_string(),
            ));
        }
        if !names.insert(variation.name.as_str()) {
            return Err(DecisionError::Validation(format!(
                "Duplicate variation name '{}'",
                variation.name
            )));
        }
        if !(0.0..=100.0).contains(&variation.traffic_percentage) {
            return Err(DecisionError::Validation(format!(
                "Traffic percentage of '{}' must be within 0-100, got {}",
                variation.name, variation.traffic_percentage
            )));
        }
    }

    let controls = variations.iter().filter(|v| v.is_control).count();
    if controls > 1 {
        return Err(DecisionError::Validation(format!(
            "Exactly one control variation allowed, got {}",
            controls
        )));
    }

    let total: f64 = variations.iter().map(|v| v.traffic_percentage).sum();
    if (total - 100.0).abs() > TRAFFIC_TOLERANCE {
        return Err(DecisionError::Validation(format!(
            "Traffic percentages must sum to 100, got {}",
            total
        )));
    }

    Ok(())
}

/// Transport-agnostic experiment operations
pub struct ExperimentService<R = StdRng> {
    store: Arc<dyn ExperimentStore>,
    assignments: Arc<dyn AssignmentStore>,
    aggregator: MetricsAggregator,
    engine: SignificanceEngine,
    lifecycle: LifecycleController,
    allocator: TrafficAllocator<R>,
    clock: Arc<dyn Clock>,
    defaults: ExperimentDefaults,
}

impl ExperimentService<StdRng> {
    /// Build a service with an entropy-seeded allocator
    pub fn new(
        config: &EngineConfig,
        store: Arc<dyn ExperimentStore>,
        sessions: Arc<dyn SessionStore>,
        assignments: Arc<dyn AssignmentStore>,
        clock: Arc<dyn Clock>,
    ) -> Self {
        Self {
            aggregator: MetricsAggregator::new(sessions),
            engine: SignificanceEngine::new(config.significance.winner_policy),
            lifecycle: LifecycleController::new(store.clone(), clock.clone()),
            allocator: TrafficAllocator::from_entropy(),
            store,
            assignments,
            clock,
            defaults: config.defaults.clone(),
        }
    }
}

impl<R: RngCore + Send> ExperimentService<R> {
    /// Swap the traffic allocator, e.g. for a seeded one
    pub fn with_allocator<R2: RngCore + Send>(
        self,
        allocator: TrafficAllocator<R2>,
    ) -> ExperimentService<R2> {
        ExperimentService {
            store: self.store,
            assignments: self.assignments,
            aggregator: self.aggregator,
            engine: self.engine,
            lifecycle: self.lifecycle,
            allocator,
            clock: self.clock,
            defaults: self.defaults,
        }
    }

    /// Create a draft experiment
    pub async fn create_experiment(&self, request: NewExperiment) -> Result<Experiment> {
        if request.name.trim().is_empty() {
            return Err(DecisionError::Validation(
                "Experiment name must not be empty".to_string(),
            ));
        }
        validate_variations(&request.variations)?;

        let settings = request
            .settings
            .resolve(&default_settings(&self.defaults));
        validate_settings(&settings)?;

        // Counts are derived from sessions, never supplied by the caller
        let variations = request
            .variations
            .into_iter()
            .map(|v| v.with_counts(0, 0))
            .collect();

        let mut experiment = Experiment::new(
            request.website_id,
            request.name,
            variations,
            settings,
            self.clock.now(),
        );
        experiment.description = request.description;

        self.store.insert(experiment.clone()).await?;
        info!(
            experiment_id = %experiment.id,
            website_id = %experiment.website_id,
            variations = experiment.variations.len(),
            "Created experiment"
        );
        Ok(experiment)
    }

    /// List experiments, newest first
    pub async fn list_experiments(&self, filter: &ExperimentFilter) -> Result<Vec<Experiment>> {
        Ok(self.store.list(filter).await?)
    }

    /// Get an experiment; active ones are refreshed and evaluated first
    ///
    /// A winner found here is surfaced as a provisional result
    /// (`declared_at` unset); completion is left to the scheduler or an
    /// operator.
    pub async fn get_experiment(&self, experiment_id: &Uuid) -> Result<Experiment> {
        let mut experiment = self.load(experiment_id).await?;
        if experiment.status != ExperimentStatus::Active {
            return Ok(experiment);
        }

        self.aggregator.refresh_metrics(&mut experiment).await?;
        experiment.results = self.engine.evaluate(&experiment);

        if self.lifecycle.record_snapshot(experiment.clone()).await? {
            Ok(experiment)
        } else {
            // Status changed underneath us; return what is persisted
            self.load(experiment_id).await
        }
    }

    /// Activate or pause an experiment
    pub async fn update_status(
        &self,
        experiment_id: &Uuid,
        update: StatusUpdate,
    ) -> Result<Experiment> {
        match update {
            StatusUpdate::Activate => self.lifecycle.activate(experiment_id).await,
            StatusUpdate::Pause => self.lifecycle.pause(experiment_id).await,
        }
    }

    /// Manually declare a winner
    ///
    /// Metrics are refreshed first so the recorded improvement reflects
    /// current counts. A concurrent metrics snapshot only forces a reload.
    pub async fn declare_winner(
        &self,
        experiment_id: &Uuid,
        variation_name: &str,
    ) -> Result<Experiment> {
        let mut attempt = 1;
        loop {
            let mut experiment = self.load(experiment_id).await?;
            if experiment.status == ExperimentStatus::Active {
                self.aggregator.refresh_metrics(&mut experiment).await?;
            }
            match self
                .lifecycle
                .declare_winner_on(experiment, variation_name)
                .await
            {
                Err(DecisionError::ConcurrentModification { .. })
                    if attempt < MAX_COMMIT_ATTEMPTS =>
                {
                    debug!(
                        experiment_id = %experiment_id,
                        attempt,
                        "Retrying winner declaration"
                    );
                    attempt += 1;
                }
                other => return other,
            }
        }
    }

    /// Sticky variation assignment for a visitor session
    pub async fn assign_visitor(&self, experiment_id: &Uuid, session_id: &str) -> Result<Assignment> {
        let experiment = self.load(experiment_id).await?;
        self.assign(&experiment, session_id).await
    }

    /// Content rule for the visitor's variation, if any
    ///
    /// Only active experiments produce rules, and control visitors get none
    /// since they see the unmodified page.
    pub async fn personalization_rule(
        &self,
        experiment_id: &Uuid,
        session_id: &str,
    ) -> Result<Option<PersonalizationRule>> {
        let experiment = self.load(experiment_id).await?;
        if experiment.status != ExperimentStatus::Active {
            return Ok(None);
        }

        let assignment = self.assign(&experiment, session_id).await?;
        let Some(variation) = experiment.variation(&assignment.variation_name) else {
            return Ok(None);
        };
        if variation.is_control {
            return Ok(None);
        }

        Ok(Some(PersonalizationRule {
            rule_id: PersonalizationRule::rule_id_for(&experiment.id),
            selector: variation.selector.clone(),
            content: variation.content.clone(),
            content_type: variation.content_type,
            experiment_id: experiment.id,
            variation_name: variation.name.clone(),
        }))
    }

    async fn assign(&self, experiment: &Experiment, session_id: &str) -> Result<Assignment> {
        if let Some(existing) = self.assignments.get(&experiment.id, session_id).await? {
            return Ok(existing);
        }

        if experiment.status != ExperimentStatus::Active {
            return Err(DecisionError::InvalidTransition {
                from: experiment.status,
                action: "assign visitors to",
            });
        }

        let variation = self.allocator.select_variation(&experiment.variations)?;
        let candidate = Assignment {
            experiment_id: experiment.id,
            session_id: session_id.to_string(),
            variation_name: variation.name.clone(),
            assigned_at: self.clock.now(),
        };

        let stored = self.assignments.assign_if_absent(candidate).await?;
        debug!(
            experiment_id = %experiment.id,
            session_id = %session_id,
            variation = %stored.variation_name,
            "Assigned visitor"
        );
        Ok(stored)
    }

    async fn load(&self, experiment_id: &Uuid) -> Result<Experiment> {
        self.store
            .get(experiment_id)
            .await?
            .ok_or_else(|| DecisionError::ExperimentNotFound(experiment_id.to_string()))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::clock::ManualClock;
    use crate::store::{MemoryAssignmentStore, MemoryExperimentStore, MemorySessionStore};
    use chrono::Utc;
    use experiment_types::ContentType;

    struct Fixture {
        service: ExperimentService,
        store: MemoryExperimentStore,
        sessions: MemorySessionStore,
        assignments: MemoryAssignmentStore,
    }

    fn fixture() -> Fixture {
        let store = MemoryExperimentStore::new();
        let sessions = MemorySessionStore::new();
        let assignments = MemoryAssignmentStore::new();
        let service = ExperimentService::new(
            &EngineConfig::default(),
            Arc::new(store.clone()),
            Arc::new(sessions.clone()),
            Arc::new(assignments.clone()),
            Arc::new(ManualClock::new(Utc::now())),
        )
        .with_allocator(TrafficAllocator::seeded(7));
        Fixture {
            service,
            store,
            sessions,
            assignments,
        }
    }

    fn request() -> NewExperiment {
        NewExperiment {
            website_id: "site-1".to_string(),
            name: "Checkout button".to_string(),
            description: Some("Green vs orange".to_string()),
            variations: vec![
                Variation::new("control", 50.0),
                Variation::new("orange", 50.0).with_content(
                    "#checkout",
                    "<button class=\"orange\">Buy</button>",
                    ContentType::Html,
                ),
            ],
            settings: SettingsRequest::default(),
        }
    }

    async fn active(f: &Fixture) -> Experiment {
        let exp = f.service.create_experiment(request()).await.unwrap();
        f.service
            .update_status(&exp.id, StatusUpdate::Activate)
            .await
            .unwrap()
    }

    #[tokio::test]
    async fn test_create_uses_configured_defaults() {
        let f = fixture();
        let mut req = request();
        req.variations[1] = req.variations[1].clone().with_counts(500, 400);

        let exp = f.service.create_experiment(req).await.unwrap();

        assert_eq!(exp.status, ExperimentStatus::Draft);
        assert_eq!(exp.settings.min_sample_size, 100);
        assert_eq!(exp.settings.min_confidence, 95.0);
        assert_eq!(exp.settings.max_duration_days, 30);
        assert!(exp.variations[0].is_control);
        assert_eq!(exp.variations[1].visitors, 0);
        assert_eq!(f.store.len(), 1);
    }

    #[tokio::test]
    async fn test_create_fills_missing_settings_fields() {
        let f = fixture();
        let req: NewExperiment = serde_json::from_str(
            r#"{
                "website_id": "site-1",
                "name": "Pricing page",
                "variations": [
                    {"name": "control", "traffic_percentage": 50},
                    {"name": "annual", "traffic_percentage": 50}
                ],
                "settings": {"target_url": "/pricing", "conversion_goal": "signup"}
            }"#,
        )
        .unwrap();

        let exp = f.service.create_experiment(req).await.unwrap();
        assert_eq!(exp.settings.target_url.as_deref(), Some("/pricing"));
        assert_eq!(exp.settings.conversion_goal.as_deref(), Some("signup"));
        assert_eq!(exp.settings.min_sample_size, 100);
        assert_eq!(exp.settings.min_confidence, 95.0);
        assert_eq!(exp.settings.max_duration_days, 30);

        let mut strict = request();
        strict.settings.min_confidence = Some(99.0);
        let exp = f.service.create_experiment(strict).await.unwrap();
        assert_eq!(exp.settings.min_confidence, 99.0);
        assert_eq!(exp.settings.min_sample_size, 100);

        let mut invalid = request();
        invalid.settings.min_sample_size = Some(0);
        let err = f.service.create_experiment(invalid).await.unwrap_err();
        assert!(err.is_validation());
    }

    #[tokio::test]
    async fn test_create_rejects_invalid_requests() {
        let f = fixture();

        let mut unnamed = request();
        unnamed.name = "  ".to_string();
        assert!(f.service.create_experiment(unnamed).await.is_err());

        let mut bad_traffic = request();
        bad_traffic.variations[0].traffic_percentage = 60.0;
        assert!(f
            .service
            .create_experiment(bad_traffic)
            .await
            .unwrap_err()
            .is_validation());

        assert!(f.store.is_empty());
    }

    #[tokio::test]
    async fn test_get_active_experiment_surfaces_provisional_result() {
        let f = fixture();
        let exp = active(&f).await;
        f.sessions.seed_variation(exp.id, "control", 1000, 100);
        f.sessions.seed_variation(exp.id, "orange", 1000, 140);

        let fetched = f.service.get_experiment(&exp.id).await.unwrap();

        assert_eq!(fetched.status, ExperimentStatus::Active);
        let results = fetched.results.clone().unwrap();
        assert_eq!(results.winner, "orange");
        assert!(!results.is_declared());

        let stored = f.store.get(&exp.id).await.unwrap().unwrap();
        assert_eq!(stored.variations[1].conversions, 140);
        assert_eq!(stored.results, fetched.results);
    }

    #[tokio::test]
    async fn test_get_clears_provisional_result_that_no_longer_holds() {
        let f = fixture();
        let exp = active(&f).await;
        f.sessions.seed_variation(exp.id, "control", 1000, 100);
        f.sessions.seed_variation(exp.id, "orange", 1000, 140);
        let first = f.service.get_experiment(&exp.id).await.unwrap();
        assert!(first.results.is_some());

        // Control catches up: 280 of 2000 matches orange's 14%
        f.sessions.seed_variation(exp.id, "control", 2000, 280);
        let second = f.service.get_experiment(&exp.id).await.unwrap();
        assert!(second.results.is_none());
        assert_eq!(second.variations[0].visitors, 2000);

        let stored = f.store.get(&exp.id).await.unwrap().unwrap();
        assert!(stored.results.is_none());
        assert_eq!(stored.version, second.version);
    }

    #[tokio::test]
    async fn test_get_draft_does_not_refresh() {
        let f = fixture();
        let exp = f.service.create_experiment(request()).await.unwrap();
        f.sessions.seed_variation(exp.id, "control", 10, 1);

        let fetched = f.service.get_experiment(&exp.id).await.unwrap();
        assert_eq!(fetched.variations[0].visitors, 0);
    }

    #[tokio::test]
    async fn test_declare_winner_uses_fresh_counts() {
        let f = fixture();
        let exp = active(&f).await;
        f.sessions.seed_variation(exp.id, "control", 1000, 100);
        f.sessions.seed_variation(exp.id, "orange", 1000, 125);

        let done = f.service.declare_winner(&exp.id, "orange").await.unwrap();

        assert_eq!(done.status, ExperimentStatus::Completed);
        let results = done.results.unwrap();
        assert_eq!(results.confidence, 95.0);
        assert!((results.improvement - 25.0).abs() < 1e-9);

        let err = f.service.declare_winner(&exp.id, "control").await.unwrap_err();
        assert!(err.is_conflict());
    }

    #[tokio::test]
    async fn test_assignment_is_sticky() {
        let f = fixture();
        let exp = active(&f).await;

        let first = f.service.assign_visitor(&exp.id, "visitor-1").await.unwrap();
        for _ in 0..20 {
            let again = f.service.assign_visitor(&exp.id, "visitor-1").await.unwrap();
            assert_eq!(again.variation_name, first.variation_name);
            assert_eq!(again.assigned_at, first.assigned_at);
        }
        assert_eq!(f.assignments.len(), 1);
    }

    #[tokio::test]
    async fn test_assignment_requires_active_experiment() {
        let f = fixture();
        let exp = f.service.create_experiment(request()).await.unwrap();

        let err = f.service.assign_visitor(&exp.id, "visitor-1").await.unwrap_err();
        assert!(matches!(err, DecisionError::InvalidTransition { .. }));
        assert!(f.assignments.is_empty());
    }

    #[tokio::test]
    async fn test_personalization_rule_skips_control() {
        let f = fixture();
        let exp = active(&f).await;

        let mut saw_rule = false;
        let mut saw_control = false;
        for i in 0..50 {
            let session = format!("visitor-{}", i);
            let rule = f
                .service
                .personalization_rule(&exp.id, &session)
                .await
                .unwrap();
            let assignment = f.service.assign_visitor(&exp.id, &session).await.unwrap();
            match rule {
                Some(rule) => {
                    saw_rule = true;
                    assert_eq!(assignment.variation_name, "orange");
                    assert_eq!(rule.rule_id, format!("exp_{}", exp.id));
                    assert_eq!(rule.selector.as_deref(), Some("#checkout"));
                    assert_eq!(rule.content_type, ContentType::Html);
                }
                None => {
                    saw_control = true;
                    assert_eq!(assignment.variation_name, "control");
                }
            }
        }
        assert!(saw_rule && saw_control);
    }

    #[tokio::test]
    async fn test_personalization_rule_none_when_paused() {
        let f = fixture();
        let exp = active(&f).await;
        f.service
            .update_status(&exp.id, StatusUpdate::Pause)
            .await
            .unwrap();

        let rule = f
            .service
            .personalization_rule(&exp.id, "visitor-1")
            .await
            .unwrap();
        assert!(rule.is_none());
    }

    #[tokio::test]
    async fn test_list_filters_by_status() {
        let f = fixture();
        active(&f).await;
        f.service.create_experiment(request()).await.unwrap();

        let all = f
            .service
            .list_experiments(&ExperimentFilter::default())
            .await
            .unwrap();
        assert_eq!(all.len(), 2);

        let drafts = f
            .service
            .list_experiments(&ExperimentFilter::with_status(ExperimentStatus::Draft))
            .await
            .unwrap();
        assert_eq!(drafts.len(), 1);
    }

    fn variations() -> Vec<Variation> {
        vec![Variation::new("a", 50.0), Variation::new("b", 50.0)]
    }

    #[test]
    fn test_validate_variations() {
        assert!(validate_variations(&variations()).is_ok());

        let one = vec![Variation::new("a", 100.0)];
        assert!(validate_variations(&one).unwrap_err().is_validation());

        let dup = vec![Variation::new("a", 50.0), Variation::new("a", 50.0)];
        assert!(validate_variations(&dup).is_err());

        let short = vec![Variation::new("a", 30.0), Variation::new("b", 50.0)];
        assert!(validate_variations(&short).is_err());

        let two_controls = vec![
            Variation::new("a", 50.0).control(),
            Variation::new("b", 50.0).control(),
        ];
        assert!(validate_variations(&two_controls).is_err());

        let thirds = vec![
            Variation::new("a", 33.33),
            Variation::new("b", 33.33),
            Variation::new("c", 33.34),
        ];
        assert!(validate_variations(&thirds).is_ok());
    }

    #[test]
    fn test_validate_settings() {
        assert!(validate_settings(&ExperimentSettings::default()).is_ok());

        let zero_sample = ExperimentSettings {
            min_sample_size: 0,
            ..Default::default()
        };
        assert!(validate_settings(&zero_sample).unwrap_err().is_validation());

        let bad_confidence = ExperimentSettings {
            min_confidence: 101.0,
            ..Default::default()
        };
        assert!(validate_settings(&bad_confidence).is_err());
    }
}
