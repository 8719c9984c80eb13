//! One task per worker slot: launch, wait for ready, connect, watch, relaunch.

use shoal_ipc::control::{ControlReader, ControlWriter, ParentMessage, WorkerMessage};
use shoal_ipc::{ChannelClient, ClientOptions, WireCodec};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::mpsc;
use tracing::{debug, info, warn};

use crate::dispatcher::Command;
use crate::launcher::{ControlRead, ControlWrite, LaunchedWorker, WorkerLauncher};

#[derive(Clone, Debug)]
pub(crate) struct SupervisorSettings {
    pub respawn_delay: Duration,
    pub retry_interval: Duration,
    pub call_timeout: Option<Duration>,
    pub codec: WireCodec,
}

pub(crate) async fn supervise<L: WorkerLauncher>(
    index: usize,
    launcher: Arc<L>,
    settings: Arc<SupervisorSettings>,
    commands: mpsc::UnboundedSender<Command>,
) {
    let mut generation = 0u64;
    loop {
        generation += 1;
        match launcher.launch(index, generation).await {
            Ok(worker) => run_generation(index, generation, worker, &settings, &commands).await,
            Err(err) => warn!(index, generation, error = %err, "worker launch failed"),
        }
        if commands.send(Command::WorkerDown { index, generation }).is_err() {
            return;
        }
        tokio::time::sleep(settings.respawn_delay).await;
    }
}

/// Runs one incarnation of a worker until its process exits or its channel
/// drops. Dropping `worker.exited` on the way out stops the process.
async fn run_generation(
    index: usize,
    generation: u64,
    worker: LaunchedWorker,
    settings: &SupervisorSettings,
    commands: &mpsc::UnboundedSender<Command>,
) {
    let LaunchedWorker {
        endpoint,
        fallback,
        control_in,
        control_out,
        mut exited,
    } = worker;
    let mut reader = ControlReader::new(control_in);

    let server_id = tokio::select! {
        ready = wait_ready(&mut reader) => ready,
        () = &mut exited => None,
    };
    let Some(server_id) = server_id else {
        warn!(index, generation, "worker went away before it was ready");
        return;
    };
    debug!(index, generation, %server_id, %endpoint, "worker ready");

    let mut options = ClientOptions {
        server_id: server_id.clone(),
        endpoint,
        secret: None,
        codec: settings.codec,
        retry_interval: settings.retry_interval,
        call_timeout: settings.call_timeout,
        reconnect: false,
        fallback: None,
    };
    if let Some((addr, secret)) = fallback {
        options = options.with_fallback(ChannelClient::connect(
            ClientOptions::net(server_id.clone(), addr, secret)
                .with_codec(settings.codec)
                .with_retry_interval(settings.retry_interval)
                .with_call_timeout(settings.call_timeout)
                .with_reconnect(false),
        ));
    }
    let client = ChannelClient::connect(options);
    let connected = tokio::select! {
        outcome = client.connected() => outcome.is_ok(),
        () = &mut exited => false,
    };
    if !connected {
        warn!(index, generation, "worker exited before its channel connected");
        client.close();
        return;
    }

    let (control_tx, control_rx) = mpsc::unbounded_channel();
    let writer = tokio::spawn(write_control(ControlWriter::new(control_out), control_rx));
    let announced = commands
        .send(Command::WorkerUp {
            index,
            generation,
            client: client.clone(),
            control: control_tx,
        })
        .is_ok();

    if announced {
        tokio::select! {
            () = &mut exited => info!(index, generation, "worker process ended"),
            () = client.disconnected() => info!(index, generation, "worker channel disconnected"),
            () = forward_control(index, generation, &mut reader, commands) => {}
        }
    }
    writer.abort();
    client.close();
}

async fn wait_ready(reader: &mut ControlReader<ControlRead>) -> Option<String> {
    loop {
        match reader.recv::<WorkerMessage>().await {
            Ok(Some(WorkerMessage::Ready { server_id })) => return Some(server_id),
            Ok(Some(other)) => debug!(message = ?other, "control message before ready"),
            Ok(None) => return None,
            Err(err) => {
                warn!(error = %err, "unreadable control frame");
                return None;
            }
        }
    }
}

/// Relays worker reports to the actor. Never returns once the control
/// stream ends; process exit or a channel drop ends the generation instead.
async fn forward_control(
    index: usize,
    generation: u64,
    reader: &mut ControlReader<ControlRead>,
    commands: &mpsc::UnboundedSender<Command>,
) {
    loop {
        match reader.recv::<WorkerMessage>().await {
            Ok(Some(message)) => {
                let forwarded = commands.send(Command::Control {
                    index,
                    generation,
                    message,
                });
                if forwarded.is_err() {
                    return;
                }
            }
            Ok(None) => break,
            Err(err) => {
                warn!(index, generation, error = %err, "unreadable control frame");
                break;
            }
        }
    }
    std::future::pending::<()>().await
}

async fn write_control(mut writer: ControlWriter<ControlWrite>, mut rx: mpsc::UnboundedReceiver<ParentMessage>) {
    while let Some(message) = rx.recv().await {
        if let Err(err) = writer.send(&message).await {
            debug!(error = %err, "failed to write control message");
            return;
        }
    }
}
