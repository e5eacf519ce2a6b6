use std::sync::Arc;
use std::thread::{self, JoinHandle};
use std::time::Duration;

use crossbeam_channel::{bounded, Receiver, RecvTimeoutError, Sender, TrySendError};
use rand::{Rng, SeedableRng};
use rand_chacha::ChaCha8Rng;
use serde::{Deserialize, Serialize};
use tracing::{debug, error, info, warn};
use votemap_runtime::{Environment, RemoteTool};

use crate::hashing::derive_cycle_seed;
use crate::history::{PlayHistoryTracker, PlayRecord, RecordOutcome};
use crate::metrics::{SwapMetrics, SwapMetricsSnapshot};
use crate::orchestrator::{
    CycleBusy, CycleInput, SelectionFailure, SwapOrchestrator, SwapReport, SwapSettings,
    WhitelistState,
};
use crate::selection::SelectionResult;
use crate::shutdown::ShutdownSignal;
use crate::weighting_store::WeightingStore;

const POLL_INTERVAL: Duration = Duration::from_millis(50);

/// Round-start notification from the remote log listener.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RoundStart {
    pub map: String,
    pub environment: Environment,
    pub round_index: u64,
    /// Exact layer being played, when the listener knows it.
    #[serde(default)]
    pub layer_id: Option<String>,
}

#[derive(Debug, Clone, PartialEq)]
pub struct ServiceSettings {
    pub run_on_round_start: bool,
    pub swap: SwapSettings,
    /// When set, every cycle's RNG is derived from this seed and the round
    /// index.
    pub seed: Option<u64>,
}

impl Default for ServiceSettings {
    fn default() -> Self {
        Self {
            run_on_round_start: true,
            swap: SwapSettings::default(),
            seed: None,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct ServiceStatus {
    pub weighting_version: u64,
    pub history_len: usize,
    pub latest_round: Option<u64>,
    pub busy: bool,
    pub whitelist: WhitelistState,
    pub metrics: SwapMetricsSnapshot,
}

/// Ties the parameter store, history tracker and orchestrator to one remote
/// tool.
pub struct VotemapService {
    remote: Arc<dyn RemoteTool>,
    store: Arc<WeightingStore>,
    history: Arc<PlayHistoryTracker>,
    orchestrator: SwapOrchestrator,
    settings: ServiceSettings,
    metrics: SwapMetrics,
    shutdown: ShutdownSignal,
}

impl VotemapService {
    pub fn new(
        remote: Arc<dyn RemoteTool>,
        store: Arc<WeightingStore>,
        history: Arc<PlayHistoryTracker>,
        settings: ServiceSettings,
        shutdown: ShutdownSignal,
    ) -> Self {
        Self {
            remote,
            store,
            history,
            orchestrator: SwapOrchestrator::new(shutdown.clone()),
            settings,
            metrics: SwapMetrics::default(),
            shutdown,
        }
    }

    pub fn store(&self) -> &Arc<WeightingStore> {
        &self.store
    }

    pub fn history(&self) -> &Arc<PlayHistoryTracker> {
        &self.history
    }

    pub fn orchestrator(&self) -> &SwapOrchestrator {
        &self.orchestrator
    }

    pub fn settings(&self) -> &ServiceSettings {
        &self.settings
    }

    pub fn shutdown_signal(&self) -> &ShutdownSignal {
        &self.shutdown
    }

    pub fn record_round(&self, event: &RoundStart) -> RecordOutcome {
        let mut play = PlayRecord::new(event.map.clone(), event.environment, event.round_index);
        if let Some(layer_id) = &event.layer_id {
            play = play.with_layer(layer_id.clone());
        }
        self.history.record_play(play)
    }

    /// What a cycle would put on the vote right now. Does not touch the
    /// whitelist.
    pub fn preview<R: Rng + ?Sized>(&self, rng: &mut R) -> Result<SelectionResult, SelectionFailure> {
        let weighting = self.store.current();
        let history = self.history.snapshot();
        let input = CycleInput {
            parameters: weighting.parameters(),
            parameters_version: weighting.version(),
            history: &history,
            round_index: history.latest().map(PlayRecord::round_index),
        };
        self.orchestrator
            .preview(self.remote.as_ref(), input, &self.settings.swap, rng)
    }

    /// Runs one swap cycle against the current parameters and history.
    pub fn run_cycle(&self) -> Result<SwapReport, CycleBusy> {
        let weighting = self.store.current();
        let history = self.history.snapshot();
        let round_index = history.latest().map(PlayRecord::round_index);
        let mut rng = self.cycle_rng(round_index);

        let input = CycleInput {
            parameters: weighting.parameters(),
            parameters_version: weighting.version(),
            history: &history,
            round_index,
        };
        let report =
            self.orchestrator
                .run_cycle(self.remote.as_ref(), input, &self.settings.swap, &mut rng)?;
        self.metrics.observe(&report);
        Ok(report)
    }

    pub fn status(&self) -> ServiceStatus {
        let history = self.history.snapshot();
        ServiceStatus {
            weighting_version: self.store.current().version(),
            history_len: history.len(),
            latest_round: history.latest().map(PlayRecord::round_index),
            busy: self.orchestrator.is_busy(),
            whitelist: self.orchestrator.whitelist_state(),
            metrics: self.metrics.snapshot(),
        }
    }

    fn cycle_rng(&self, round_index: Option<u64>) -> ChaCha8Rng {
        match self.settings.seed {
            Some(seed) => ChaCha8Rng::seed_from_u64(derive_cycle_seed(seed, round_index)),
            None => ChaCha8Rng::from_entropy(),
        }
    }

    /// Spawns the dispatcher and swap worker threads.
    ///
    /// The dispatcher records every round start and, when configured, wakes
    /// the worker through a single-slot channel. Triggers that find the slot
    /// occupied are coalesced, so cycles never overlap or pile up.
    pub fn start(
        self: Arc<Self>,
        events: Receiver<RoundStart>,
        reports: Sender<SwapReport>,
    ) -> ServiceHandle {
        let (trigger_tx, trigger_rx) = bounded::<()>(1);

        let worker_service = Arc::clone(&self);
        let worker = thread::spawn(move || worker_service.run_worker(trigger_rx, reports));

        let dispatcher_service = Arc::clone(&self);
        let dispatcher =
            thread::spawn(move || dispatcher_service.run_dispatcher(events, trigger_tx));

        info!(
            target: "votemap::server",
            run_on_round_start = self.settings.run_on_round_start,
            "service.started"
        );
        ServiceHandle {
            shutdown: self.shutdown.clone(),
            dispatcher: Some(dispatcher),
            worker: Some(worker),
        }
    }

    fn run_dispatcher(&self, events: Receiver<RoundStart>, triggers: Sender<()>) {
        while !self.shutdown.is_triggered() {
            let event = match events.recv_timeout(POLL_INTERVAL) {
                Ok(event) => event,
                Err(RecvTimeoutError::Timeout) => continue,
                Err(RecvTimeoutError::Disconnected) => break,
            };
            let outcome = self.record_round(&event);
            if outcome != RecordOutcome::Appended || !self.settings.run_on_round_start {
                continue;
            }
            match triggers.try_send(()) {
                Ok(()) => {}
                Err(TrySendError::Full(())) => {
                    debug!(
                        target: "votemap::server",
                        round_index = event.round_index,
                        "swap.trigger_coalesced"
                    );
                }
                Err(TrySendError::Disconnected(())) => break,
            }
        }
        debug!(target: "votemap::server", "service.dispatcher_stopped");
    }

    fn run_worker(&self, triggers: Receiver<()>, reports: Sender<SwapReport>) {
        loop {
            match triggers.recv_timeout(POLL_INTERVAL) {
                Ok(()) => {
                    if self.shutdown.is_triggered() {
                        break;
                    }
                    match self.run_cycle() {
                        Ok(report) => {
                            // nobody listening for reports is not an error
                            let _ = reports.send(report);
                        }
                        Err(busy) => {
                            warn!(target: "votemap::server", error = %busy, "swap.trigger_skipped");
                        }
                    }
                }
                Err(RecvTimeoutError::Timeout) => {
                    if self.shutdown.is_triggered() {
                        break;
                    }
                }
                Err(RecvTimeoutError::Disconnected) => break,
            }
        }
        debug!(target: "votemap::server", "service.worker_stopped");
    }
}

/// Join handle for the service threads.
pub struct ServiceHandle {
    shutdown: ShutdownSignal,
    dispatcher: Option<JoinHandle<()>>,
    worker: Option<JoinHandle<()>>,
}

impl ServiceHandle {
    /// Raises the shutdown signal and waits for both threads. A cycle in
    /// flight finishes its compensating restore first.
    pub fn shutdown(mut self) {
        self.shutdown.trigger();
        self.join_threads();
    }

    /// Waits for the threads to finish on their own, which happens once the
    /// event sender is dropped and pending work is drained.
    pub fn join(mut self) {
        self.join_threads();
    }

    fn join_threads(&mut self) {
        for handle in [self.dispatcher.take(), self.worker.take()]
            .into_iter()
            .flatten()
        {
            if handle.join().is_err() {
                error!(target: "votemap::server", "service.thread_panicked");
            }
        }
    }
}
