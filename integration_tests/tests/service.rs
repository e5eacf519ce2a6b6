mod common;

use std::sync::Arc;
use std::thread;
use std::time::{Duration, Instant};

use common::{baseline_whitelist, fast_settings, fixture_parameters, Call, FakeRemoteTool};
use crossbeam_channel::unbounded;
use rand::SeedableRng;
use rand_chacha::ChaCha8Rng;
use votemap_core::{
    OutcomeKind, PlayHistoryTracker, RecordOutcome, RoundStart, ServiceSettings, ShutdownSignal,
    VotemapService, WeightingStore, WhitelistState,
};
use votemap_runtime::{Environment, GameMode, RemoteTool, VotemapUserConfig};

const REPORT_TIMEOUT: Duration = Duration::from_secs(5);

fn service_with(remote: &Arc<FakeRemoteTool>, settings: ServiceSettings) -> Arc<VotemapService> {
    let remote: Arc<dyn RemoteTool> = remote.clone();
    Arc::new(VotemapService::new(
        remote,
        Arc::new(WeightingStore::new(Arc::new(fixture_parameters()), None)),
        Arc::new(PlayHistoryTracker::new(10)),
        settings,
        ShutdownSignal::new(),
    ))
}

fn seeded_settings(seed: u64) -> ServiceSettings {
    ServiceSettings {
        run_on_round_start: true,
        swap: fast_settings(),
        seed: Some(seed),
    }
}

fn round(map: &str, environment: Environment, round_index: u64) -> RoundStart {
    RoundStart {
        map: map.to_string(),
        environment,
        round_index,
        layer_id: None,
    }
}

fn wait_for(mut condition: impl FnMut() -> bool) {
    let deadline = Instant::now() + REPORT_TIMEOUT;
    while !condition() {
        assert!(Instant::now() < deadline, "condition not reached in time");
        thread::sleep(Duration::from_millis(10));
    }
}

#[test]
fn round_start_triggers_a_reported_cycle() {
    let remote = FakeRemoteTool::from_fixtures();
    let service = service_with(&remote, seeded_settings(42));
    let (events, event_rx) = unbounded();
    let (report_tx, reports) = unbounded();
    let handle = Arc::clone(&service).start(event_rx, report_tx);

    events
        .send(round("carentan", Environment::Day, 1))
        .expect("dispatcher is running");
    let report = reports
        .recv_timeout(REPORT_TIMEOUT)
        .expect("cycle report arrives");

    assert_eq!(report.round_index, Some(1));
    assert_eq!(report.parameters_version, 1);
    assert_eq!(report.outcome.kind(), OutcomeKind::Succeeded);
    assert_eq!(remote.whitelist(), baseline_whitelist());

    let status = service.status();
    assert_eq!(status.history_len, 1);
    assert_eq!(status.latest_round, Some(1));
    assert_eq!(status.whitelist, WhitelistState::Baseline);
    assert_eq!(status.metrics.cycles, 1);
    assert_eq!(status.metrics.last_outcome, Some(OutcomeKind::Succeeded));

    drop(events);
    handle.join();
}

#[test]
fn duplicate_round_does_not_trigger_another_cycle() {
    let remote = FakeRemoteTool::from_fixtures();
    let service = service_with(&remote, seeded_settings(42));
    let (events, event_rx) = unbounded();
    let (report_tx, reports) = unbounded();
    let handle = Arc::clone(&service).start(event_rx, report_tx);

    events.send(round("foy", Environment::Night, 3)).unwrap();
    reports.recv_timeout(REPORT_TIMEOUT).unwrap();

    events.send(round("foy", Environment::Night, 3)).unwrap();
    events.send(round("kursk", Environment::Day, 2)).unwrap();
    assert!(reports.recv_timeout(Duration::from_millis(300)).is_err());

    assert_eq!(service.status().history_len, 1);
    assert_eq!(service.orchestrator().cycles_started(), 1);
    handle.shutdown();
}

#[test]
fn disabled_trigger_still_records_history() {
    let remote = FakeRemoteTool::from_fixtures();
    let settings = ServiceSettings {
        run_on_round_start: false,
        ..seeded_settings(42)
    };
    let service = service_with(&remote, settings);
    let (events, event_rx) = unbounded();
    let (report_tx, reports) = unbounded();
    let handle = Arc::clone(&service).start(event_rx, report_tx);

    events.send(round("hill400", Environment::Day, 8)).unwrap();
    wait_for(|| service.status().history_len == 1);
    assert!(reports.recv_timeout(Duration::from_millis(200)).is_err());
    assert!(remote.calls().is_empty());

    handle.shutdown();
}

#[test]
fn seeded_cycles_repeat_for_the_same_round() {
    let selections: Vec<Vec<String>> = (0..2)
        .map(|_| {
            let remote = FakeRemoteTool::from_fixtures();
            let service = service_with(&remote, seeded_settings(1234));
            assert_eq!(
                service.record_round(&round("omahabeach", Environment::Dusk, 17)),
                RecordOutcome::Appended
            );
            let report = service.run_cycle().expect("service is idle");
            report
                .outcome
                .selection()
                .expect("cycle succeeded")
                .layer_ids()
        })
        .collect();

    assert_eq!(selections[0], selections[1]);
    assert_eq!(selections[0].len(), 7);
}

#[test]
fn preview_only_reads_from_the_remote() {
    let remote = FakeRemoteTool::from_fixtures();
    let service = service_with(&remote, seeded_settings(9));
    service.record_round(&round("carentan", Environment::Night, 1));

    let mut rng = ChaCha8Rng::seed_from_u64(9);
    let preview = service.preview(&mut rng).expect("fixture catalog is selectable");

    assert_eq!(preview.len(), 7);
    assert_eq!(
        remote.calls(),
        vec![Call::CurrentLayers, Call::VotemapConfig, Call::GetWhitelist]
    );
    assert_eq!(remote.whitelist(), baseline_whitelist());
    assert_eq!(service.status().metrics.cycles, 0);
}

#[test]
fn shutdown_stops_an_idle_service() {
    let remote = FakeRemoteTool::from_fixtures();
    let service = service_with(&remote, seeded_settings(5));
    let (_events, event_rx) = unbounded::<RoundStart>();
    let (report_tx, _reports) = unbounded();
    let handle = Arc::clone(&service).start(event_rx, report_tx);

    handle.shutdown();
    assert!(service.shutdown_signal().is_triggered());
    assert!(remote.calls().is_empty());
}

#[test]
fn round_starts_during_a_cycle_coalesce_into_one_more() {
    let remote = FakeRemoteTool::from_fixtures();
    let release = remote.hold_snapshot();
    let service = service_with(&remote, seeded_settings(21));
    let (events, event_rx) = unbounded();
    let (report_tx, reports) = unbounded();
    let handle = Arc::clone(&service).start(event_rx, report_tx);

    events.send(round("omahabeach", Environment::Day, 1)).unwrap();
    wait_for(|| service.orchestrator().is_busy());

    for (map, index) in [("remagen", 2), ("stalingrad", 3), ("omahabeach", 4)] {
        events.send(round(map, Environment::Day, index)).unwrap();
    }
    wait_for(|| service.status().history_len == 4);
    drop(release);

    let first = reports.recv_timeout(REPORT_TIMEOUT).expect("held cycle reports");
    let second = reports.recv_timeout(REPORT_TIMEOUT).expect("coalesced cycle reports");
    assert!(reports.recv_timeout(Duration::from_millis(300)).is_err());

    assert_eq!(first.round_index, Some(1));
    assert_eq!(second.round_index, Some(4));
    assert_eq!(first.outcome.kind(), OutcomeKind::Succeeded);
    assert_eq!(second.outcome.kind(), OutcomeKind::Succeeded);
    assert_eq!(service.orchestrator().cycles_started(), 2);
    assert_eq!(remote.whitelist(), baseline_whitelist());
    handle.shutdown();
}

#[test]
fn named_layer_is_kept_out_of_the_next_vote() {
    let remote = FakeRemoteTool::from_fixtures();
    remote.set_votemap_config(VotemapUserConfig {
        num_offensive_options: 1,
        ..VotemapUserConfig::default()
    });
    let service = service_with(&remote, seeded_settings(8));
    let event = RoundStart {
        layer_id: Some("kursk_offensive_rus_dawn".to_string()),
        ..round("kursk", Environment::Dawn, 12)
    };
    assert_eq!(service.record_round(&event), RecordOutcome::Appended);

    let report = service.run_cycle().expect("service is idle");
    let offensives: Vec<String> = report
        .outcome
        .selection()
        .expect("cycle succeeded")
        .candidates()
        .iter()
        .filter(|candidate| candidate.layer.game_mode == GameMode::Offensive)
        .map(|candidate| candidate.layer.id.clone())
        .collect();
    // the layer just played is out and an allied offensive may not be
    // followed by an axis one
    assert_eq!(offensives, vec!["carentan_offensive_us".to_string()]);
}
