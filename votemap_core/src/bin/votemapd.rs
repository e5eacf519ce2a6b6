use std::future::Future;
use std::io::{BufRead, BufReader, Write};
use std::net::{SocketAddr, TcpListener, TcpStream};
use std::sync::Arc;
use std::thread;
use std::time::Duration;

use anyhow::Context;
use crossbeam_channel::{bounded, unbounded, Sender};
use rand::SeedableRng;
use rand_chacha::ChaCha8Rng;
use serde_json::{json, Value};
use tracing::{info, warn};

use votemap_core::alerts::start_alert_server;
use votemap_core::{
    load_votemap_config_from_env, load_weighting_from_env, PlayHistoryTracker, RoundStart,
    ShutdownSignal, VotemapService,
};
use votemap_runtime::{parse_command_line, CrconClient, CrconConnection, OperatorCommand};

struct CommandRequest {
    command: OperatorCommand,
    reply: Sender<String>,
}

fn main() -> anyhow::Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(tracing_subscriber::EnvFilter::from_default_env())
        .init();

    let config = load_votemap_config_from_env();
    let store = Arc::new(load_weighting_from_env(config.weighting_path.as_deref()));
    let _watcher = match store.watch() {
        Ok(watcher) => watcher,
        Err(err) => {
            warn!(target: "votemap::config", error = %err, "weighting.watch_failed");
            None
        }
    };

    let connection =
        CrconConnection::from_env().context("remote tool connection is not configured")?;
    let client = CrconClient::connect(&connection).context("failed to build remote tool client")?;

    let shutdown = ShutdownSignal::new();
    let service = Arc::new(VotemapService::new(
        Arc::new(client),
        Arc::clone(&store),
        Arc::new(PlayHistoryTracker::new(config.history_retention)),
        config.service_settings(),
        shutdown.clone(),
    ));

    let alerts = start_alert_server(config.alert_bind);
    let (event_tx, event_rx) = unbounded::<RoundStart>();
    let (report_tx, report_rx) = unbounded();
    let handle = Arc::clone(&service).start(event_rx, report_tx);
    let alert_forwarder = thread::spawn(move || {
        for report in report_rx {
            if let Some(server) = alerts.as_ref() {
                server.publish_report(&report);
            }
        }
    });

    let (request_tx, requests) = unbounded::<CommandRequest>();
    spawn_command_listener(config.command_bind, request_tx.clone())?;
    spawn_signal_listener(shutdown.clone(), request_tx, wait_for_signal())?;
    info!(
        target: "votemap::server",
        command_bind = %config.command_bind,
        alert_bind = %config.alert_bind,
        api_url = %connection.api_url(),
        "votemapd ready"
    );

    while let Ok(request) = requests.recv() {
        let stop = request.command == OperatorCommand::Shutdown;
        let reply = match request.command {
            OperatorCommand::RoundStart {
                map,
                environment,
                round_index,
                layer_id,
            } => {
                let event = RoundStart {
                    map,
                    environment,
                    round_index,
                    layer_id,
                };
                match event_tx.send(event) {
                    Ok(()) => json!({ "ok": true, "queued_round": round_index }),
                    Err(err) => failure(&err),
                }
            }
            OperatorCommand::Preview => {
                let mut rng = ChaCha8Rng::from_entropy();
                match service.preview(&mut rng) {
                    Ok(selection) => json!({ "ok": true, "selection": selection }),
                    Err(err) => failure(&err),
                }
            }
            OperatorCommand::Reload => match store.reload() {
                Ok(current) => json!({ "ok": true, "weighting_version": current.version() }),
                Err(err) => failure(&err),
            },
            OperatorCommand::Status => json!({ "ok": true, "status": service.status() }),
            OperatorCommand::Shutdown => json!({ "ok": true, "stopping": true }),
        };
        // the client may have disconnected while waiting
        let _ = request.reply.send(reply.to_string());
        if stop {
            break;
        }
    }

    info!(target: "votemap::server", "votemapd stopping");
    drop(event_tx);
    handle.shutdown();
    if alert_forwarder.join().is_err() {
        warn!(target: "votemap::server", "alert forwarder panicked");
    }
    Ok(())
}

fn failure(err: &dyn std::fmt::Display) -> Value {
    json!({ "ok": false, "error": err.to_string() })
}

/// Turns SIGINT and SIGTERM into a shutdown request for the main loop. The
/// signal is raised first so a cycle in flight cuts its settle time short.
fn spawn_signal_listener<F>(
    shutdown: ShutdownSignal,
    requests: Sender<CommandRequest>,
    signal: F,
) -> anyhow::Result<thread::JoinHandle<()>>
where
    F: Future<Output = std::io::Result<()>> + Send + 'static,
{
    let runtime = tokio::runtime::Builder::new_current_thread()
        .enable_all()
        .build()
        .context("failed to build signal runtime")?;
    Ok(thread::spawn(move || {
        if let Err(err) = runtime.block_on(signal) {
            warn!(target: "votemap::server", error = %err, "failed to install signal handlers");
            return;
        }
        info!(target: "votemap::server", "shutdown signal received");
        shutdown.trigger();
        let (reply, _ignored) = bounded(1);
        let _ = requests.send(CommandRequest {
            command: OperatorCommand::Shutdown,
            reply,
        });
    }))
}

async fn wait_for_signal() -> std::io::Result<()> {
    #[cfg(unix)]
    {
        use tokio::signal::unix::{signal, SignalKind};
        let mut terminate = signal(SignalKind::terminate())?;
        tokio::select! {
            result = tokio::signal::ctrl_c() => result,
            _ = terminate.recv() => Ok(()),
        }
    }
    #[cfg(not(unix))]
    {
        tokio::signal::ctrl_c().await
    }
}

fn spawn_command_listener(bind_addr: SocketAddr, sender: Sender<CommandRequest>) -> anyhow::Result<()> {
    let listener = TcpListener::bind(bind_addr)
        .with_context(|| format!("failed to bind command listener on {bind_addr}"))?;
    listener
        .set_nonblocking(true)
        .context("failed to make command listener non-blocking")?;

    thread::spawn(move || loop {
        match listener.accept() {
            Ok((stream, addr)) => {
                info!(target: "votemap::server", %addr, "command client connected");
                let sender = sender.clone();
                thread::spawn(move || handle_client(stream, sender));
            }
            Err(ref err) if err.kind() == std::io::ErrorKind::WouldBlock => {
                thread::sleep(Duration::from_millis(50));
            }
            Err(err) => {
                warn!(target: "votemap::server", error = %err, "error accepting command client");
                thread::sleep(Duration::from_millis(200));
            }
        }
    });

    Ok(())
}

fn handle_client(stream: TcpStream, sender: Sender<CommandRequest>) {
    if let Err(err) = stream.set_nonblocking(false) {
        warn!(target: "votemap::server", error = %err, "failed to make command client blocking");
        return;
    }
    let mut writer = match stream.try_clone() {
        Ok(writer) => writer,
        Err(err) => {
            warn!(target: "votemap::server", error = %err, "failed to clone command stream");
            return;
        }
    };
    let mut reader = BufReader::new(stream);
    let mut line = String::new();
    loop {
        line.clear();
        match reader.read_line(&mut line) {
            Ok(0) => break,
            Ok(_) => {
                let trimmed = line.trim();
                if trimmed.is_empty() {
                    continue;
                }
                let reply = match parse_command_line(trimmed) {
                    Ok(command) => {
                        let (reply_tx, reply_rx) = bounded(1);
                        let request = CommandRequest {
                            command,
                            reply: reply_tx,
                        };
                        if sender.send(request).is_err() {
                            break;
                        }
                        match reply_rx.recv() {
                            Ok(reply) => reply,
                            Err(_) => break,
                        }
                    }
                    Err(err) => {
                        warn!(target: "votemap::server", command = trimmed, error = %err, "invalid command");
                        failure(&err).to_string()
                    }
                };
                if writeln!(writer, "{reply}").is_err() {
                    break;
                }
            }
            Err(err) => {
                warn!(target: "votemap::server", error = %err, "command read error");
                break;
            }
        }
    }
}
