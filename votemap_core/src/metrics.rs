use std::collections::BTreeMap;
use std::sync::Mutex;

use serde::Serialize;

use crate::orchestrator::{OutcomeKind, SwapReport, WhitelistState};

/// Running tally of swap cycle outcomes, exposed through the `status` command.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct SwapMetricsSnapshot {
    pub cycles: u64,
    pub outcomes: BTreeMap<OutcomeKind, u64>,
    pub last_cycle: Option<u64>,
    pub last_outcome: Option<OutcomeKind>,
    pub last_round_index: Option<u64>,
    pub whitelist: WhitelistState,
}

#[derive(Debug, Default)]
pub struct SwapMetrics {
    inner: Mutex<SwapMetricsSnapshot>,
}

impl SwapMetrics {
    pub fn observe(&self, report: &SwapReport) {
        let mut metrics = self.inner.lock().expect("swap metrics mutex poisoned");
        let kind = report.outcome.kind();
        metrics.cycles += 1;
        *metrics.outcomes.entry(kind).or_insert(0) += 1;
        metrics.last_cycle = Some(report.cycle);
        metrics.last_outcome = Some(kind);
        if report.round_index.is_some() {
            metrics.last_round_index = report.round_index;
        }
        metrics.whitelist = report.whitelist;
    }

    pub fn snapshot(&self) -> SwapMetricsSnapshot {
        self.inner
            .lock()
            .expect("swap metrics mutex poisoned")
            .clone()
    }
}
