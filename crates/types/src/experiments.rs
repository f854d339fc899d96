//! A/B testing and experiment types

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::fmt;
use uuid::Uuid;

/// Status of an experiment
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Hash)]
#[serde(rename_all = "snake_case")]
pub enum ExperimentStatus {
    Draft,
    Active,
    Paused,
    Completed,
}

impl ExperimentStatus {
    /// Stable lowercase name, matching the serialized form
    pub fn as_str(&self) -> &'static str {
        match self {
            ExperimentStatus::Draft => "draft",
            ExperimentStatus::Active => "active",
            ExperimentStatus::Paused => "paused",
            ExperimentStatus::Completed => "completed",
        }
    }

    /// Completed experiments accept no further transitions
    pub fn is_terminal(&self) -> bool {
        matches!(self, ExperimentStatus::Completed)
    }
}

impl fmt::Display for ExperimentStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// How a variation's content is injected into the page
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Default)]
#[serde(rename_all = "snake_case")]
pub enum ContentType {
    #[default]
    Text,
    Html,
    Css,
}

/// Per-experiment settings
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct ExperimentSettings {
    /// Page the experiment runs on
    #[serde(default)]
    pub target_url: Option<String>,
    /// Free-form description of what counts as a conversion
    #[serde(default)]
    pub conversion_goal: Option<String>,
    /// Minimum visitors per arm before the significance test runs
    pub min_sample_size: u64,
    /// Confidence bar (0-100) a variation must clear to win
    pub min_confidence: f64,
    /// Planned duration in days
    pub max_duration_days: u32,
}

impl Default for ExperimentSettings {
    fn default() -> Self {
        Self {
            target_url: None,
            conversion_goal: None,
            min_sample_size: 100,
            min_confidence: 95.0,
            max_duration_days: 30,
        }
    }
}

/// Settings as supplied by a caller; missing fields take configured defaults
#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq)]
pub struct SettingsRequest {
    #[serde(default)]
    pub target_url: Option<String>,
    #[serde(default)]
    pub conversion_goal: Option<String>,
    #[serde(default)]
    pub min_sample_size: Option<u64>,
    #[serde(default)]
    pub min_confidence: Option<f64>,
    #[serde(default)]
    pub max_duration_days: Option<u32>,
}

impl SettingsRequest {
    /// Fill every missing field from `defaults`
    pub fn resolve(self, defaults: &ExperimentSettings) -> ExperimentSettings {
        ExperimentSettings {
            target_url: self.target_url.or_else(|| defaults.target_url.clone()),
            conversion_goal: self
                .conversion_goal
                .or_else(|| defaults.conversion_goal.clone()),
            min_sample_size: self.min_sample_size.unwrap_or(defaults.min_sample_size),
            min_confidence: self.min_confidence.unwrap_or(defaults.min_confidence),
            max_duration_days: self.max_duration_days.unwrap_or(defaults.max_duration_days),
        }
    }
}

/// A single variation in an A/B test
///
/// Variations are owned by their experiment. Counts are overwritten on every
/// metrics refresh; `conversion_rate` is derived and never authoritative.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct Variation {
    /// Variation name, unique within the experiment
    pub name: String,
    /// Whether this is the baseline
    #[serde(default)]
    pub is_control: bool,
    /// CSS selector the content is applied to
    #[serde(default)]
    pub selector: Option<String>,
    /// Rendering payload
    #[serde(default)]
    pub content: Option<String>,
    #[serde(default)]
    pub content_type: ContentType,
    /// Share of traffic (0-100)
    pub traffic_percentage: f64,
    #[serde(default)]
    pub visitors: u64,
    #[serde(default)]
    pub conversions: u64,
    /// conversions / visitors * 100
    #[serde(default)]
    pub conversion_rate: f64,
}

impl Variation {
    /// Create a new variation with no recorded traffic
    pub fn new(name: impl Into<String>, traffic_percentage: f64) -> Self {
        Self {
            name: name.into(),
            is_control: false,
            selector: None,
            content: None,
            content_type: ContentType::Text,
            traffic_percentage,
            visitors: 0,
            conversions: 0,
            conversion_rate: 0.0,
        }
    }

    /// Mark as the control variation
    pub fn control(mut self) -> Self {
        self.is_control = true;
        self
    }

    /// Attach rendering content
    pub fn with_content(
        mut self,
        selector: impl Into<String>,
        content: impl Into<String>,
        content_type: ContentType,
    ) -> Self {
        self.selector = Some(selector.into());
        self.content = Some(content.into());
        self.content_type = content_type;
        self
    }

    /// Overwrite counts and recompute the conversion rate
    pub fn record_counts(&mut self, visitors: u64, conversions: u64) {
        self.visitors = visitors;
        self.conversions = conversions;
        self.conversion_rate = conversion_rate(visitors, conversions);
    }

    /// Builder form of [`Variation::record_counts`]
    pub fn with_counts(mut self, visitors: u64, conversions: u64) -> Self {
        self.record_counts(visitors, conversions);
        self
    }
}

/// Conversion rate as a percentage, 0 when there are no visitors
pub fn conversion_rate(visitors: u64, conversions: u64) -> f64 {
    if visitors == 0 {
        0.0
    } else {
        conversions as f64 / visitors as f64 * 100.0
    }
}

/// Winner of an experiment
///
/// `declared_at` is `None` while the result is provisional, i.e. computed for
/// an experiment that is still running.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct WinnerResult {
    /// Name of the winning variation
    pub winner: String,
    /// Confidence (0-100), two decimal places
    pub confidence: f64,
    /// Relative lift over control in percent, two decimal places
    pub improvement: f64,
    #[serde(default)]
    pub declared_at: Option<DateTime<Utc>>,
}

impl WinnerResult {
    /// Whether the result has been declared final
    pub fn is_declared(&self) -> bool {
        self.declared_at.is_some()
    }

    /// Stamp the declaration time
    pub fn declared(mut self, at: DateTime<Utc>) -> Self {
        self.declared_at = Some(at);
        self
    }
}

/// A/B test experiment
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct Experiment {
    /// Unique experiment identifier
    pub id: Uuid,
    /// Owning website (opaque)
    pub website_id: String,
    pub name: String,
    #[serde(default)]
    pub description: Option<String>,
    pub status: ExperimentStatus,
    /// Variations in declared order
    pub variations: Vec<Variation>,
    #[serde(default)]
    pub results: Option<WinnerResult>,
    #[serde(default)]
    pub settings: ExperimentSettings,
    #[serde(default)]
    pub start_date: Option<DateTime<Utc>>,
    #[serde(default)]
    pub end_date: Option<DateTime<Utc>>,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
    /// Bumped on every persisted write; guards compare-and-swap
    #[serde(default)]
    pub version: u64,
}

impl Experiment {
    /// Create a new draft experiment
    ///
    /// If no variation is flagged as control, the first one becomes control.
    pub fn new(
        website_id: impl Into<String>,
        name: impl Into<String>,
        mut variations: Vec<Variation>,
        settings: ExperimentSettings,
        now: DateTime<Utc>,
    ) -> Self {
        if !variations.iter().any(|v| v.is_control) {
            if let Some(first) = variations.first_mut() {
                first.is_control = true;
            }
        }

        Self {
            id: Uuid::new_v4(),
            website_id: website_id.into(),
            name: name.into(),
            description: None,
            status: ExperimentStatus::Draft,
            variations,
            results: None,
            settings,
            start_date: None,
            end_date: None,
            created_at: now,
            updated_at: now,
            version: 0,
        }
    }

    /// The control variation, if present
    pub fn control(&self) -> Option<&Variation> {
        self.variations.iter().find(|v| v.is_control)
    }

    /// Look up a variation by name
    pub fn variation(&self, name: &str) -> Option<&Variation> {
        self.variations.iter().find(|v| v.name == name)
    }

    /// Variations other than control, in declared order
    pub fn challengers(&self) -> impl Iterator<Item = &Variation> {
        self.variations.iter().filter(|v| !v.is_control)
    }

    /// Total visitors across all variations
    pub fn total_visitors(&self) -> u64 {
        self.variations.iter().map(|v| v.visitors).sum()
    }

    /// Whole days the experiment has been running, if started
    pub fn running_days(&self, now: DateTime<Utc>) -> Option<i64> {
        self.start_date.map(|start| (now - start).num_days())
    }

    /// Whether the experiment has run past its planned duration
    pub fn exceeded_max_duration(&self, now: DateTime<Utc>) -> bool {
        self.running_days(now)
            .map(|days| days >= i64::from(self.settings.max_duration_days))
            .unwrap_or(false)
    }
}
