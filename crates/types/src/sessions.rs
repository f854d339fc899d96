//! Visitor-facing records: session outcomes, sticky assignments and the
//! personalization payload handed to content consumers.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::experiments::ContentType;

/// A visitor session tagged with an experiment variation
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct SessionRecord {
    pub session_id: String,
    pub experiment_id: Uuid,
    pub variation_name: String,
    /// Whether the session reached the conversion goal
    pub converted: bool,
}

/// Aggregate session counts for one variation
#[derive(Debug, Clone, Copy, Default, Serialize, Deserialize, PartialEq, Eq)]
pub struct SessionCounts {
    pub sessions: u64,
    pub converted: u64,
}

/// Sticky variation assignment for a session
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct Assignment {
    pub experiment_id: Uuid,
    pub session_id: String,
    pub variation_name: String,
    pub assigned_at: DateTime<Utc>,
}

/// Content rule merged ahead of persona-based rules
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct PersonalizationRule {
    /// `exp_<experiment id>`
    pub rule_id: String,
    pub selector: Option<String>,
    pub content: Option<String>,
    pub content_type: ContentType,
    pub experiment_id: Uuid,
    pub variation_name: String,
}

impl PersonalizationRule {
    /// Rule id used for experiment-driven rules
    pub fn rule_id_for(experiment_id: &Uuid) -> String {
        format!("exp_{}", experiment_id)
    }
}
