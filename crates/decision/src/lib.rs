//! Experiment decision engine
//!
//! This crate holds the decision-making core of the A/B experimentation
//! service: weighted traffic allocation, metric aggregation from session
//! records, two-proportion significance testing, the experiment lifecycle
//! state machine, and the background scheduler that auto-completes
//! experiments once a winner is statistically established.

pub mod allocator;
pub mod clock;
pub mod errors;
pub mod lifecycle;
pub mod metrics;
pub mod scheduler;
pub mod service;
pub mod statistical;
pub mod store;

pub use allocator::TrafficAllocator;
pub use clock::{Clock, ManualClock, SystemClock};
pub use errors::{DecisionError, Result};
pub use lifecycle::{LifecycleController, Transition, MANUAL_DECLARATION_CONFIDENCE};
pub use metrics::MetricsAggregator;
pub use scheduler::{BackgroundScheduler, SchedulerHandle, SchedulerStats, TickReport};
pub use service::{default_settings, ExperimentService, NewExperiment, StatusUpdate};
pub use statistical::{Comparison, SignificanceEngine, StatisticalTest, ZTest};
pub use store::{
    AssignmentStore, CasOutcome, ExperimentFilter, ExperimentStore, MemoryAssignmentStore,
    MemoryExperimentStore, MemorySessionStore, SessionStore, StoreError, StoreResult,
};
