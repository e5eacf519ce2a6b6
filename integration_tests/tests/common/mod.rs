#![allow(dead_code)]

use std::collections::HashSet;
use std::path::PathBuf;
use std::sync::{Arc, Mutex};
use std::time::Duration;

use crossbeam_channel::{bounded, Receiver, Sender};
use votemap_core::{ShutdownSignal, SwapSettings, WeightingParameters};
use votemap_runtime::{
    catalog_from_json, MapLayer, RemoteCallError, RemoteCatalog, RemoteVotemapConfig,
    RemoteVotemapState, RemoteWhitelist, VotemapUserConfig, WhitelistSnapshot,
};

pub fn fixture_path(name: &str) -> PathBuf {
    PathBuf::from(env!("CARGO_MANIFEST_DIR"))
        .join("tests")
        .join("fixtures")
        .join(name)
}

pub fn fixture_catalog() -> Vec<MapLayer> {
    let json = std::fs::read_to_string(fixture_path("get_maps.json")).expect("catalog fixture");
    catalog_from_json(&json).expect("catalog fixture decodes")
}

pub fn fixture_parameters() -> WeightingParameters {
    WeightingParameters::from_file(&fixture_path("weighting.json")).expect("weighting fixture")
}

pub fn baseline_whitelist() -> Vec<String> {
    fixture_catalog().into_iter().map(|layer| layer.id).collect()
}

/// Swap settings with the standard plan and no settle delay.
pub fn fast_settings() -> SwapSettings {
    SwapSettings {
        step_delay: Duration::ZERO,
        ..SwapSettings::default()
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Step {
    Catalog,
    VotemapConfig,
    /// The whitelist read that bounds the selection.
    SelectionWhitelist,
    Snapshot,
    Apply,
    Reset,
    Restore,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Call {
    CurrentLayers,
    VotemapConfig,
    GetWhitelist,
    SetWhitelist(Vec<String>),
    Reset,
}

#[derive(Default)]
struct FakeState {
    catalog: Vec<MapLayer>,
    whitelist: Vec<String>,
    votemap_config: VotemapUserConfig,
    calls: Vec<Call>,
    failing: HashSet<Step>,
    gets_this_cycle: usize,
    sets_this_cycle: usize,
    hold_snapshot: Option<Receiver<()>>,
    shutdown_on_apply: Option<ShutdownSignal>,
}

/// In-memory remote tool. A catalog read opens a cycle. Within it the first
/// whitelist read bounds the selection and later ones are snapshots; the
/// first whitelist write is the apply and later ones are restores.
pub struct FakeRemoteTool {
    state: Mutex<FakeState>,
}

impl FakeRemoteTool {
    pub fn new(catalog: Vec<MapLayer>, whitelist: Vec<String>) -> Self {
        Self {
            state: Mutex::new(FakeState {
                catalog,
                whitelist,
                ..FakeState::default()
            }),
        }
    }

    pub fn from_fixtures() -> Arc<Self> {
        Arc::new(Self::new(fixture_catalog(), baseline_whitelist()))
    }

    pub fn fail(&self, step: Step) {
        self.lock().failing.insert(step);
    }

    pub fn heal(&self, step: Step) {
        self.lock().failing.remove(&step);
    }

    pub fn set_catalog(&self, catalog: Vec<MapLayer>) {
        self.lock().catalog = catalog;
    }

    pub fn set_whitelist(&self, whitelist: Vec<String>) {
        self.lock().whitelist = whitelist;
    }

    pub fn set_votemap_config(&self, config: VotemapUserConfig) {
        self.lock().votemap_config = config;
    }

    /// Blocks the next snapshot read until the returned sender fires or is
    /// dropped.
    pub fn hold_snapshot(&self) -> Sender<()> {
        let (release, hold) = bounded(0);
        self.lock().hold_snapshot = Some(hold);
        release
    }

    /// Raises `signal` as the computed whitelist is applied.
    pub fn shutdown_on_apply(&self, signal: ShutdownSignal) {
        self.lock().shutdown_on_apply = Some(signal);
    }

    pub fn whitelist(&self) -> Vec<String> {
        self.lock().whitelist.clone()
    }

    pub fn calls(&self) -> Vec<Call> {
        self.lock().calls.clone()
    }

    pub fn count(&self, wanted: fn(&Call) -> bool) -> usize {
        self.lock().calls.iter().filter(|call| wanted(call)).count()
    }

    fn lock(&self) -> std::sync::MutexGuard<'_, FakeState> {
        self.state.lock().expect("fake remote mutex poisoned")
    }
}

fn injected(step: Step) -> RemoteCallError {
    RemoteCallError::Rejected {
        command: format!("{step:?}").to_lowercase(),
        message: "injected failure".to_string(),
    }
}

impl RemoteCatalog for FakeRemoteTool {
    fn current_layers(&self) -> Result<Vec<MapLayer>, RemoteCallError> {
        let mut state = self.lock();
        state.calls.push(Call::CurrentLayers);
        state.gets_this_cycle = 0;
        state.sets_this_cycle = 0;
        if state.failing.contains(&Step::Catalog) {
            return Err(injected(Step::Catalog));
        }
        Ok(state.catalog.clone())
    }
}

impl RemoteWhitelist for FakeRemoteTool {
    fn get(&self) -> Result<WhitelistSnapshot, RemoteCallError> {
        let (step, hold) = {
            let mut state = self.lock();
            state.gets_this_cycle += 1;
            if state.gets_this_cycle == 1 {
                (Step::SelectionWhitelist, None)
            } else {
                (Step::Snapshot, state.hold_snapshot.take())
            }
        };
        if let Some(hold) = hold {
            let _ = hold.recv();
        }

        let mut state = self.lock();
        state.calls.push(Call::GetWhitelist);
        if state.failing.contains(&step) {
            return Err(injected(step));
        }
        Ok(WhitelistSnapshot::new(state.whitelist.clone()))
    }

    fn set(&self, layer_ids: &[String]) -> Result<(), RemoteCallError> {
        let mut state = self.lock();
        state.calls.push(Call::SetWhitelist(layer_ids.to_vec()));
        state.sets_this_cycle += 1;
        let step = if state.sets_this_cycle == 1 {
            Step::Apply
        } else {
            Step::Restore
        };
        if step == Step::Apply {
            if let Some(signal) = state.shutdown_on_apply.take() {
                signal.trigger();
            }
        }
        if state.failing.contains(&step) {
            return Err(injected(step));
        }
        state.whitelist = layer_ids.to_vec();
        Ok(())
    }
}

impl RemoteVotemapState for FakeRemoteTool {
    fn reset(&self) -> Result<(), RemoteCallError> {
        let mut state = self.lock();
        state.calls.push(Call::Reset);
        if state.failing.contains(&Step::Reset) {
            return Err(injected(Step::Reset));
        }
        Ok(())
    }
}

impl RemoteVotemapConfig for FakeRemoteTool {
    fn votemap_config(&self) -> Result<VotemapUserConfig, RemoteCallError> {
        let mut state = self.lock();
        state.calls.push(Call::VotemapConfig);
        if state.failing.contains(&Step::VotemapConfig) {
            return Err(injected(Step::VotemapConfig));
        }
        Ok(state.votemap_config.clone())
    }
}
