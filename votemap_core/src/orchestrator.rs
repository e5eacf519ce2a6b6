//! Whitelist swap cycle.
//!
//! The remote tool has no way to offer an arbitrary set of vote options, so a
//! cycle narrows its whitelist to the selection, forces the vote to
//! regenerate, and then puts the original whitelist back:
//!
//! ```text
//! Idle -> Selecting -> SnapshottingWhitelist -> ApplyingComputedWhitelist
//!      -> ResettingRemoteState -> RestoringOriginalWhitelist -> Idle
//! ```
//!
//! Selecting only reads from the remote tool: the catalog, its votemap
//! settings and the whitelist that bounds what may be offered. A failure after
//! the snapshot triggers exactly one compensating restore. Nothing is retried.
//!
//! When a cycle cannot put the whitelist back, its snapshot is retained. Later
//! cycles select within and restore to that retained baseline instead of
//! reading the narrowed remote whitelist, until a restore succeeds.

use std::collections::HashSet;
use std::fmt;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::Mutex;
use std::time::Duration;

use rand::Rng;
use serde::Serialize;
use thiserror::Error;
use tracing::{debug, error, info, warn};
use votemap_runtime::{MapLayer, RemoteCallError, RemoteTool, WhitelistSnapshot};

use crate::exclusions::ExclusionRules;
use crate::history::HistorySnapshot;
use crate::selection::{
    select_plan, SelectionError, SelectionPlan, SelectionPolicy, SelectionResult,
};
use crate::shutdown::ShutdownSignal;
use crate::weighting::WeightingParameters;

pub const DEFAULT_STEP_DELAY: Duration = Duration::from_secs(2);

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum SwapPhase {
    Idle,
    Selecting,
    SnapshottingWhitelist,
    ApplyingComputedWhitelist,
    ResettingRemoteState,
    RestoringOriginalWhitelist,
}

impl SwapPhase {
    pub fn as_str(self) -> &'static str {
        match self {
            SwapPhase::Idle => "idle",
            SwapPhase::Selecting => "selecting",
            SwapPhase::SnapshottingWhitelist => "snapshotting_whitelist",
            SwapPhase::ApplyingComputedWhitelist => "applying_computed_whitelist",
            SwapPhase::ResettingRemoteState => "resetting_remote_state",
            SwapPhase::RestoringOriginalWhitelist => "restoring_original_whitelist",
        }
    }
}

impl fmt::Display for SwapPhase {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

#[derive(Debug, Clone, PartialEq, Error)]
pub enum SelectionFailure {
    #[error("failed to fetch layer catalog: {0}")]
    Catalog(RemoteCallError),
    #[error("failed to fetch votemap settings: {0}")]
    VotemapConfig(RemoteCallError),
    #[error("failed to read the whitelist to select from: {0}")]
    Whitelist(RemoteCallError),
    #[error(transparent)]
    Engine(#[from] SelectionError),
}

#[derive(Debug, Clone, PartialEq)]
pub enum SwapOutcome {
    Succeeded {
        selection: SelectionResult,
    },
    SelectionFailed {
        error: SelectionFailure,
    },
    SnapshotFailed {
        error: RemoteCallError,
    },
    /// A forward step failed and the original whitelist was restored.
    ApplyFailed {
        phase: SwapPhase,
        error: RemoteCallError,
    },
    /// A forward step failed and so did the compensating restore; the remote
    /// whitelist may still hold the computed subset.
    ApplyFailedUnrecovered {
        phase: SwapPhase,
        error: RemoteCallError,
        restore_error: RemoteCallError,
    },
    /// The vote was narrowed but the whitelist was not returned to baseline.
    RestoreFailedAfterSuccess {
        selection: SelectionResult,
        restore_error: RemoteCallError,
    },
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum OutcomeKind {
    Succeeded,
    SelectionFailed,
    SnapshotFailed,
    ApplyFailed,
    ApplyFailedUnrecovered,
    RestoreFailedAfterSuccess,
}

impl OutcomeKind {
    pub const ALL: [OutcomeKind; 6] = [
        OutcomeKind::Succeeded,
        OutcomeKind::SelectionFailed,
        OutcomeKind::SnapshotFailed,
        OutcomeKind::ApplyFailed,
        OutcomeKind::ApplyFailedUnrecovered,
        OutcomeKind::RestoreFailedAfterSuccess,
    ];

    pub fn as_str(self) -> &'static str {
        match self {
            OutcomeKind::Succeeded => "succeeded",
            OutcomeKind::SelectionFailed => "selection_failed",
            OutcomeKind::SnapshotFailed => "snapshot_failed",
            OutcomeKind::ApplyFailed => "apply_failed",
            OutcomeKind::ApplyFailedUnrecovered => "apply_failed_unrecovered",
            OutcomeKind::RestoreFailedAfterSuccess => "restore_failed_after_success",
        }
    }

    /// Outcomes that leave the remote whitelist away from its baseline.
    pub fn is_unrecovered(self) -> bool {
        matches!(
            self,
            OutcomeKind::ApplyFailedUnrecovered | OutcomeKind::RestoreFailedAfterSuccess
        )
    }
}

impl SwapOutcome {
    pub fn kind(&self) -> OutcomeKind {
        match self {
            SwapOutcome::Succeeded { .. } => OutcomeKind::Succeeded,
            SwapOutcome::SelectionFailed { .. } => OutcomeKind::SelectionFailed,
            SwapOutcome::SnapshotFailed { .. } => OutcomeKind::SnapshotFailed,
            SwapOutcome::ApplyFailed { .. } => OutcomeKind::ApplyFailed,
            SwapOutcome::ApplyFailedUnrecovered { .. } => OutcomeKind::ApplyFailedUnrecovered,
            SwapOutcome::RestoreFailedAfterSuccess { .. } => {
                OutcomeKind::RestoreFailedAfterSuccess
            }
        }
    }

    pub fn selection(&self) -> Option<&SelectionResult> {
        match self {
            SwapOutcome::Succeeded { selection }
            | SwapOutcome::RestoreFailedAfterSuccess { selection, .. } => Some(selection),
            _ => None,
        }
    }
}

impl fmt::Display for SwapOutcome {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            SwapOutcome::Succeeded { selection } => {
                write!(f, "vote narrowed to {} layers and whitelist restored", selection.len())
            }
            SwapOutcome::SelectionFailed { error } => write!(f, "selection failed: {error}"),
            SwapOutcome::SnapshotFailed { error } => {
                write!(f, "whitelist snapshot failed: {error}")
            }
            SwapOutcome::ApplyFailed { phase, error } => {
                write!(f, "{phase} failed ({error}); original whitelist restored")
            }
            SwapOutcome::ApplyFailedUnrecovered {
                phase,
                error,
                restore_error,
            } => write!(
                f,
                "{phase} failed ({error}) and restoring the original whitelist also failed \
                 ({restore_error}); the whitelist may still be narrowed"
            ),
            SwapOutcome::RestoreFailedAfterSuccess {
                selection,
                restore_error,
            } => write!(
                f,
                "vote narrowed to {} layers but restoring the original whitelist failed \
                 ({restore_error}); the whitelist is still narrowed",
                selection.len()
            ),
        }
    }
}

/// Whether the remote whitelist is believed to hold its configured baseline.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum WhitelistState {
    #[default]
    Baseline,
    Narrowed,
}

#[derive(Debug, Clone, PartialEq)]
pub struct SwapReport {
    pub cycle: u64,
    pub round_index: Option<u64>,
    pub parameters_version: u64,
    pub outcome: SwapOutcome,
    pub whitelist: WhitelistState,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Error)]
#[error("a swap cycle is already in progress")]
pub struct CycleBusy;

#[derive(Debug, Clone, PartialEq)]
pub struct SwapSettings {
    pub plan: SelectionPlan,
    pub policy: SelectionPolicy,
    /// Settle time after the reset and before the restore.
    pub step_delay: Duration,
    /// Take option counts and exclusion rules from the remote tool's votemap
    /// settings instead of `plan` and `policy.exclusions`.
    pub use_remote_config: bool,
}

impl Default for SwapSettings {
    fn default() -> Self {
        Self {
            plan: SelectionPlan::standard(),
            policy: SelectionPolicy::default(),
            step_delay: DEFAULT_STEP_DELAY,
            use_remote_config: true,
        }
    }
}

/// Point-in-time inputs of one cycle.
#[derive(Debug, Clone, Copy)]
pub struct CycleInput<'a> {
    pub parameters: &'a WeightingParameters,
    pub parameters_version: u64,
    pub history: &'a HistorySnapshot,
    pub round_index: Option<u64>,
}

pub struct SwapOrchestrator {
    in_progress: AtomicBool,
    cycles: AtomicU64,
    /// Whitelist to restore once a cycle left the remote narrowed.
    retained_baseline: Mutex<Option<WhitelistSnapshot>>,
    shutdown: ShutdownSignal,
}

struct InProgressGuard<'a>(&'a AtomicBool);

impl Drop for InProgressGuard<'_> {
    fn drop(&mut self) {
        self.0.store(false, Ordering::Release);
    }
}

impl SwapOrchestrator {
    pub fn new(shutdown: ShutdownSignal) -> Self {
        Self {
            in_progress: AtomicBool::new(false),
            cycles: AtomicU64::new(0),
            retained_baseline: Mutex::new(None),
            shutdown,
        }
    }

    pub fn is_busy(&self) -> bool {
        self.in_progress.load(Ordering::Acquire)
    }

    pub fn cycles_started(&self) -> u64 {
        self.cycles.load(Ordering::Relaxed)
    }

    pub fn whitelist_state(&self) -> WhitelistState {
        let retained = self
            .retained_baseline
            .lock()
            .expect("retained baseline mutex poisoned");
        if retained.is_some() {
            WhitelistState::Narrowed
        } else {
            WhitelistState::Baseline
        }
    }

    /// The snapshot kept from a cycle that could not restore it.
    pub fn retained_baseline(&self) -> Option<WhitelistSnapshot> {
        self.retained_baseline
            .lock()
            .expect("retained baseline mutex poisoned")
            .clone()
    }

    /// What a cycle would put on the vote right now. Only reads from the
    /// remote tool.
    pub fn preview<T, R>(
        &self,
        remote: &T,
        input: CycleInput<'_>,
        settings: &SwapSettings,
        rng: &mut R,
    ) -> Result<SelectionResult, SelectionFailure>
    where
        T: RemoteTool + ?Sized,
        R: Rng + ?Sized,
    {
        let retained = self.retained_baseline();
        prepare_selection(remote, &input, settings, retained.as_ref(), rng)
    }

    /// Runs one full swap cycle. Returns [`CycleBusy`] without touching the
    /// remote tool if another cycle holds the in-progress flag.
    pub fn run_cycle<T, R>(
        &self,
        remote: &T,
        input: CycleInput<'_>,
        settings: &SwapSettings,
        rng: &mut R,
    ) -> Result<SwapReport, CycleBusy>
    where
        T: RemoteTool + ?Sized,
        R: Rng + ?Sized,
    {
        self.in_progress
            .compare_exchange(false, true, Ordering::AcqRel, Ordering::Acquire)
            .map_err(|_| CycleBusy)?;
        let _guard = InProgressGuard(&self.in_progress);
        let cycle = self.cycles.fetch_add(1, Ordering::Relaxed) + 1;

        let retained = self.retained_baseline();
        let (outcome, baseline) = self.execute(remote, &input, settings, rng, cycle, retained);

        {
            let mut slot = self
                .retained_baseline
                .lock()
                .expect("retained baseline mutex poisoned");
            match outcome.kind() {
                OutcomeKind::Succeeded | OutcomeKind::ApplyFailed => *slot = None,
                OutcomeKind::ApplyFailedUnrecovered | OutcomeKind::RestoreFailedAfterSuccess => {
                    *slot = baseline
                }
                OutcomeKind::SelectionFailed | OutcomeKind::SnapshotFailed => {}
            }
        }
        let whitelist = self.whitelist_state();

        log_outcome(cycle, &outcome);
        Ok(SwapReport {
            cycle,
            round_index: input.round_index,
            parameters_version: input.parameters_version,
            outcome,
            whitelist,
        })
    }

    /// Returns the outcome together with the baseline the cycle restores to,
    /// once one was taken.
    fn execute<T, R>(
        &self,
        remote: &T,
        input: &CycleInput<'_>,
        settings: &SwapSettings,
        rng: &mut R,
        cycle: u64,
        retained: Option<WhitelistSnapshot>,
    ) -> (SwapOutcome, Option<WhitelistSnapshot>)
    where
        T: RemoteTool + ?Sized,
        R: Rng + ?Sized,
    {
        enter_phase(cycle, SwapPhase::Selecting);
        let selection = match prepare_selection(remote, input, settings, retained.as_ref(), rng) {
            Ok(selection) => selection,
            Err(error) => return (SwapOutcome::SelectionFailed { error }, None),
        };

        enter_phase(cycle, SwapPhase::SnapshottingWhitelist);
        let snapshot = match retained {
            Some(retained) => {
                warn!(
                    target: "votemap::swap",
                    cycle,
                    layers = retained.len(),
                    "swap.snapshot_reused_from_unrecovered_cycle"
                );
                retained
            }
            None => match remote.get() {
                Ok(snapshot) => snapshot,
                Err(error) => return (SwapOutcome::SnapshotFailed { error }, None),
            },
        };

        let layer_ids = selection.layer_ids();
        enter_phase(cycle, SwapPhase::ApplyingComputedWhitelist);
        let applied = if self.shutdown.is_triggered() {
            Err(RemoteCallError::Interrupted)
        } else {
            remote.set(&layer_ids)
        };
        if let Err(error) = applied {
            let outcome =
                self.compensate(remote, &snapshot, SwapPhase::ApplyingComputedWhitelist, error, cycle);
            return (outcome, Some(snapshot));
        }

        enter_phase(cycle, SwapPhase::ResettingRemoteState);
        let reset = if self.shutdown.wait_timeout(settings.step_delay) {
            Err(RemoteCallError::Interrupted)
        } else {
            remote.reset()
        };
        if let Err(error) = reset {
            let outcome =
                self.compensate(remote, &snapshot, SwapPhase::ResettingRemoteState, error, cycle);
            return (outcome, Some(snapshot));
        }

        // a shutdown only cuts the settle time short; the restore always runs
        self.shutdown.wait_timeout(settings.step_delay);
        enter_phase(cycle, SwapPhase::RestoringOriginalWhitelist);
        let outcome = match remote.set(snapshot.layer_ids()) {
            Ok(()) => SwapOutcome::Succeeded { selection },
            Err(restore_error) => SwapOutcome::RestoreFailedAfterSuccess {
                selection,
                restore_error,
            },
        };
        (outcome, Some(snapshot))
    }

    fn compensate<T>(
        &self,
        remote: &T,
        snapshot: &WhitelistSnapshot,
        phase: SwapPhase,
        error: RemoteCallError,
        cycle: u64,
    ) -> SwapOutcome
    where
        T: RemoteTool + ?Sized,
    {
        warn!(
            target: "votemap::swap",
            cycle,
            phase = phase.as_str(),
            error = %error,
            "swap.compensating_restore"
        );
        enter_phase(cycle, SwapPhase::RestoringOriginalWhitelist);
        match remote.set(snapshot.layer_ids()) {
            Ok(()) => SwapOutcome::ApplyFailed { phase, error },
            Err(restore_error) => SwapOutcome::ApplyFailedUnrecovered {
                phase,
                error,
                restore_error,
            },
        }
    }
}

/// Reads the catalog, the votemap settings and the whitelist to select within,
/// then draws. `whitelist` stands in for the remote whitelist when given.
fn prepare_selection<T, R>(
    remote: &T,
    input: &CycleInput<'_>,
    settings: &SwapSettings,
    whitelist: Option<&WhitelistSnapshot>,
    rng: &mut R,
) -> Result<SelectionResult, SelectionFailure>
where
    T: RemoteTool + ?Sized,
    R: Rng + ?Sized,
{
    let catalog = remote.current_layers().map_err(SelectionFailure::Catalog)?;
    if catalog.is_empty() {
        return Err(SelectionError::EmptyCatalog.into());
    }

    let (plan, policy) = if settings.use_remote_config {
        let config = remote
            .votemap_config()
            .map_err(SelectionFailure::VotemapConfig)?;
        let policy = SelectionPolicy {
            exclusions: ExclusionRules::from(&config),
            ..settings.policy
        };
        (SelectionPlan::from(&config), policy)
    } else {
        (settings.plan.clone(), settings.policy)
    };

    let offered = match whitelist {
        Some(whitelist) => whitelist.clone(),
        None => remote.get().map_err(SelectionFailure::Whitelist)?,
    };
    let catalog = within_whitelist(catalog, &offered);

    Ok(select_plan(
        input.parameters,
        input.history,
        &catalog,
        &plan,
        &policy,
        rng,
    )?)
}

fn within_whitelist(catalog: Vec<MapLayer>, whitelist: &WhitelistSnapshot) -> Vec<MapLayer> {
    let allowed: HashSet<&str> = whitelist.layer_ids().iter().map(String::as_str).collect();
    let total = catalog.len();
    let offered: Vec<MapLayer> = catalog
        .into_iter()
        .filter(|layer| allowed.contains(layer.id.as_str()))
        .collect();
    if offered.len() < total {
        debug!(
            target: "votemap::swap",
            catalog = total,
            whitelisted = offered.len(),
            "swap.catalog_limited_to_whitelist"
        );
    }
    offered
}

fn enter_phase(cycle: u64, phase: SwapPhase) {
    info!(target: "votemap::swap", cycle, phase = phase.as_str(), "swap.phase");
}

fn log_outcome(cycle: u64, outcome: &SwapOutcome) {
    match outcome {
        SwapOutcome::Succeeded { selection } => info!(
            target: "votemap::swap",
            cycle,
            layers = ?selection.layer_ids(),
            "swap.outcome=succeeded"
        ),
        SwapOutcome::SelectionFailed { error } => warn!(
            target: "votemap::swap",
            cycle,
            error = %error,
            "swap.outcome=selection_failed"
        ),
        SwapOutcome::SnapshotFailed { error } => warn!(
            target: "votemap::swap",
            cycle,
            error = %error,
            "swap.outcome=snapshot_failed"
        ),
        SwapOutcome::ApplyFailed { phase, error } => warn!(
            target: "votemap::swap",
            cycle,
            phase = phase.as_str(),
            error = %error,
            "swap.outcome=apply_failed"
        ),
        SwapOutcome::ApplyFailedUnrecovered {
            phase,
            error,
            restore_error,
        } => error!(
            target: "votemap::alert",
            cycle,
            phase = phase.as_str(),
            error = %error,
            restore_error = %restore_error,
            "swap.outcome=apply_failed_unrecovered"
        ),
        SwapOutcome::RestoreFailedAfterSuccess {
            selection,
            restore_error,
        } => error!(
            target: "votemap::alert",
            cycle,
            layers = ?selection.layer_ids(),
            restore_error = %restore_error,
            "swap.outcome=restore_failed_after_success"
        ),
    }
}
