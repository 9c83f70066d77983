pub mod analytics;
pub mod config;
pub mod events;
pub mod limits;
pub mod replay;
pub mod scheduler;
pub mod store;

pub use analytics::{RoundStats, RunAnalytics, RunStats, SchedulerState};
pub use config::{ConfigError, HarnessConfig, ProjectConfig, RunConfig, RunLimits, PROJECT_FILE};
pub use events::{EventRecord, RunEvent};
pub use limits::{CancelCause, ResourceChecker, StopReason};
pub use replay::{replay, CoverageSample, CoverageScript, ReplayError, ReplayOptions, ReplaySummary};
pub use scheduler::{CancelHandle, RoundScheduler, RunError, RunSummary, Target};
pub use store::{RunStore, StoreError};
