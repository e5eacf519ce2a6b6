//! Votemap weighting, selection and whitelist swap engine.
//!
//! Map and environment groups weight each layer of the remote tool's catalog,
//! recent plays decay those weights, and a swap cycle narrows the remote
//! whitelist to a weighted draw just long enough for the vote to regenerate.

pub mod alerts;
mod config;
mod exclusions;
mod hashing;
mod history;
pub mod metrics;
mod orchestrator;
mod selection;
mod service;
mod shutdown;
mod weighting;
mod weighting_store;

pub use config::{load_votemap_config_from_env, VotemapConfig, VotemapConfigError};
pub use exclusions::{ExclusionRules, Exclusions};
pub use hashing::{derive_cycle_seed, FnvHasher};
pub use history::{
    HistorySnapshot, PlayHistoryTracker, PlayRecord, Recency, RecordOutcome,
    DEFAULT_HISTORY_RETENTION,
};
pub use metrics::{SwapMetrics, SwapMetricsSnapshot};
pub use orchestrator::{
    CycleBusy, CycleInput, OutcomeKind, SelectionFailure, SwapOrchestrator, SwapOutcome,
    SwapPhase, SwapReport, SwapSettings, WhitelistState, DEFAULT_STEP_DELAY,
};
pub use selection::{
    decay_multiplier, score_catalog, select, select_plan, ScoredLayer, SelectionError,
    SelectionPlan, SelectionPolicy, SelectionResult, DEFAULT_RECENCY_HORIZON,
};
pub use service::{RoundStart, ServiceHandle, ServiceSettings, ServiceStatus, VotemapService};
pub use shutdown::ShutdownSignal;
pub use weighting::{
    weighting_schema, ConfigurationError, EnvironmentGroup, EnvironmentGroupEntry, GroupKind,
    MapGroup, MapGroupEntry, WeightedGroup, WeightingDocument, WeightingParameters,
    BUILTIN_WEIGHTING,
};
pub use weighting_store::{load_weighting_from_env, VersionedWeighting, WeightingStore};
