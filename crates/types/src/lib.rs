//! Core types and data models for the experimentation engine
//!
//! This crate provides the experiment aggregate and the visitor-facing
//! records shared by the decision engine and its collaborators.

pub mod experiments;
pub mod sessions;

pub use experiments::{
    conversion_rate, ContentType, Experiment, ExperimentSettings, ExperimentStatus, SettingsRequest,
    Variation, WinnerResult,
};
pub use sessions::{Assignment, PersonalizationRule, SessionCounts, SessionRecord};
