//! Operator alert stream.
//!
//! Every swap report is broadcast to connected TCP clients as a
//! length-prefixed (u32 little endian) JSON [`AlertEnvelope`].

use std::io::{self, Write};
use std::net::{SocketAddr, TcpListener, TcpStream};
use std::sync::{Arc, Mutex};
use std::thread;
use std::time::{Duration, SystemTime, UNIX_EPOCH};

use crossbeam_channel::{unbounded, Receiver, Sender};
use serde::Serialize;
use tracing::{error, info, warn};

use crate::orchestrator::{OutcomeKind, SwapReport, WhitelistState};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum AlertSeverity {
    Info,
    Warn,
    Critical,
}

impl AlertSeverity {
    pub fn for_outcome(kind: OutcomeKind) -> Self {
        match kind {
            OutcomeKind::Succeeded => AlertSeverity::Info,
            OutcomeKind::SelectionFailed
            | OutcomeKind::SnapshotFailed
            | OutcomeKind::ApplyFailed => AlertSeverity::Warn,
            OutcomeKind::ApplyFailedUnrecovered | OutcomeKind::RestoreFailedAfterSuccess => {
                AlertSeverity::Critical
            }
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct AlertEnvelope {
    pub timestamp_ms: u64,
    pub severity: AlertSeverity,
    pub outcome: OutcomeKind,
    pub cycle: u64,
    pub round_index: Option<u64>,
    pub parameters_version: u64,
    pub whitelist: WhitelistState,
    pub message: String,
    #[serde(skip_serializing_if = "Vec::is_empty")]
    pub layers: Vec<String>,
}

impl AlertEnvelope {
    pub fn from_report(report: &SwapReport) -> Self {
        let timestamp_ms = SystemTime::now()
            .duration_since(UNIX_EPOCH)
            .map(|d| d.as_millis() as u64)
            .unwrap_or(0);
        let outcome = report.outcome.kind();
        Self {
            timestamp_ms,
            severity: AlertSeverity::for_outcome(outcome),
            outcome,
            cycle: report.cycle,
            round_index: report.round_index,
            parameters_version: report.parameters_version,
            whitelist: report.whitelist,
            message: report.outcome.to_string(),
            layers: report
                .outcome
                .selection()
                .map(|selection| selection.layer_ids())
                .unwrap_or_default(),
        }
    }
}

pub struct AlertServer {
    sender: Sender<AlertEnvelope>,
    local_addr: SocketAddr,
}

impl AlertServer {
    pub fn local_addr(&self) -> SocketAddr {
        self.local_addr
    }

    pub fn publish(&self, envelope: AlertEnvelope) {
        if let Err(err) = self.sender.send(envelope) {
            error!(target: "votemap::alert", error = %err, "alert.queue_failed");
        }
    }

    pub fn publish_report(&self, report: &SwapReport) {
        self.publish(AlertEnvelope::from_report(report));
    }
}

/// Binds the alert listener. Returns `None`, with alerts disabled, if the
/// address cannot be bound.
pub fn start_alert_server(bind_addr: SocketAddr) -> Option<AlertServer> {
    let listener = match TcpListener::bind(bind_addr) {
        Ok(listener) => listener,
        Err(err) => {
            warn!(
                target: "votemap::alert",
                bind = %bind_addr,
                error = %err,
                "alert_stream.bind_failed"
            );
            return None;
        }
    };
    if let Err(err) = listener.set_nonblocking(true) {
        warn!(target: "votemap::alert", error = %err, "alert_stream.nonblocking_failed");
        return None;
    }
    let local_addr = listener.local_addr().unwrap_or(bind_addr);

    let (sender, receiver) = unbounded::<AlertEnvelope>();
    let clients: Arc<Mutex<Vec<TcpStream>>> = Arc::new(Mutex::new(Vec::new()));
    thread::spawn(move || run_alert_stream(listener, clients, receiver));

    info!(target: "votemap::alert", bind = %local_addr, "alert_stream.listening");
    Some(AlertServer { sender, local_addr })
}

fn run_alert_stream(
    listener: TcpListener,
    clients: Arc<Mutex<Vec<TcpStream>>>,
    receiver: Receiver<AlertEnvelope>,
) {
    loop {
        match listener.accept() {
            Ok((stream, addr)) => {
                if let Err(err) = stream.set_nonblocking(false) {
                    warn!(target: "votemap::alert", %addr, error = %err, "alert_client.blocking_failed");
                }
                if let Err(err) = stream.set_nodelay(true) {
                    warn!(target: "votemap::alert", %addr, error = %err, "alert_client.nodelay_failed");
                }
                clients
                    .lock()
                    .expect("alert clients mutex poisoned")
                    .push(stream);
                info!(target: "votemap::alert", %addr, "alert_client.connected");
            }
            Err(ref err) if err.kind() == io::ErrorKind::WouldBlock => {}
            Err(err) => {
                error!(target: "votemap::alert", error = %err, "alert_client.accept_failed");
                thread::sleep(Duration::from_millis(200));
            }
        }

        loop {
            match receiver.try_recv() {
                Ok(envelope) => match serde_json::to_vec(&envelope) {
                    Ok(payload) => broadcast_frame(&clients, &payload),
                    Err(err) => {
                        error!(target: "votemap::alert", error = %err, "alert.encode_failed")
                    }
                },
                Err(crossbeam_channel::TryRecvError::Empty) => break,
                // server handle dropped
                Err(crossbeam_channel::TryRecvError::Disconnected) => return,
            }
        }

        thread::sleep(Duration::from_millis(50));
    }
}

pub fn encode_frame(payload: &[u8]) -> Vec<u8> {
    let len = payload.len() as u32;
    let mut buffer = Vec::with_capacity(4 + payload.len());
    buffer.extend_from_slice(&len.to_le_bytes());
    buffer.extend_from_slice(payload);
    buffer
}

fn broadcast_frame(clients: &Arc<Mutex<Vec<TcpStream>>>, payload: &[u8]) {
    let frame = encode_frame(payload);
    let mut guard = clients.lock().expect("alert clients mutex poisoned");
    guard.retain_mut(|stream| match stream.write_all(&frame) {
        Ok(()) => true,
        Err(err) => {
            warn!(target: "votemap::alert", error = %err, "alert_client.dropped");
            false
        }
    });
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::orchestrator::{SwapOutcome, SwapPhase};
    use std::io::Read;
    use votemap_runtime::RemoteCallError;

    fn unrecovered_report() -> SwapReport {
        SwapReport {
            cycle: 3,
            round_index: Some(12),
            parameters_version: 2,
            outcome: SwapOutcome::ApplyFailedUnrecovered {
                phase: SwapPhase::ApplyingComputedWhitelist,
                error: RemoteCallError::Interrupted,
                restore_error: RemoteCallError::Interrupted,
            },
            whitelist: WhitelistState::Narrowed,
        }
    }

    #[test]
    fn unrecovered_outcomes_are_critical() {
        let envelope = AlertEnvelope::from_report(&unrecovered_report());
        assert_eq!(envelope.severity, AlertSeverity::Critical);
        assert_eq!(envelope.outcome, OutcomeKind::ApplyFailedUnrecovered);
        assert!(envelope.layers.is_empty());

        let json = serde_json::to_value(&envelope).unwrap();
        assert_eq!(json["severity"], "critical");
        assert_eq!(json["outcome"], "apply_failed_unrecovered");
        assert_eq!(json["whitelist"], "narrowed");
    }

    #[test]
    fn frames_are_length_prefixed() {
        let frame = encode_frame(b"{}");
        assert_eq!(frame, vec![2, 0, 0, 0, b'{', b'}']);
    }

    #[test]
    fn connected_client_receives_published_alert() {
        let server = start_alert_server(SocketAddr::from(([127, 0, 0, 1], 0)))
            .expect("alert server binds an ephemeral port");
        let mut client = TcpStream::connect(server.local_addr()).unwrap();
        client
            .set_read_timeout(Some(Duration::from_secs(5)))
            .unwrap();

        // let the accept loop register the client before publishing
        thread::sleep(Duration::from_millis(300));
        server.publish_report(&unrecovered_report());

        let mut len = [0u8; 4];
        client.read_exact(&mut len).unwrap();
        let mut payload = vec![0u8; u32::from_le_bytes(len) as usize];
        client.read_exact(&mut payload).unwrap();
        let json: serde_json::Value = serde_json::from_slice(&payload).unwrap();
        assert_eq!(json["cycle"], 3);
        assert_eq!(json["round_index"], 12);
    }
}
