//! The dispatcher actor: owns the worker table, load estimates, startup
//! barrier and held-back operations. Everything else talks to it over a
//! command channel.

use serde::Serialize;
use serde::de::DeserializeOwned;
use serde_json::Value;
use shoal_db::{BatchQuery, OperationKind, Page, QueryOptions, ResultSet, Row};
use shoal_ipc::control::{ParentMessage, WorkerMessage};
use shoal_ipc::{CallStyle, ChannelClient};
use shoal_worker::WorkerMethod;
use std::future::Future;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{mpsc, oneshot, watch};
use tokio::task::JoinHandle;
use tokio::time::MissedTickBehavior;
use tracing::{debug, info, warn};

use crate::balancer::LoadTable;
use crate::barrier::{PendingOps, StartupBarrier};
use crate::config::DispatcherConfig;
use crate::error::DispatchError;
use crate::launcher::{ProcessLauncher, WorkerLauncher};
use crate::supervisor::{SupervisorSettings, supervise};

type Responder = Box<dyn FnOnce(Result<Value, DispatchError>) + Send>;

pub(crate) struct Operation {
    kind: OperationKind,
    method: WorkerMethod,
    params: Vec<Value>,
    respond: Responder,
}

pub(crate) enum Command {
    Submit(Operation),
    WorkerUp {
        index: usize,
        generation: u64,
        client: ChannelClient,
        control: mpsc::UnboundedSender<ParentMessage>,
    },
    WorkerDown {
        index: usize,
        generation: u64,
    },
    Polled {
        index: usize,
        generation: u64,
        count: usize,
    },
    Control {
        index: usize,
        generation: u64,
        message: WorkerMessage,
    },
    Stats(oneshot::Sender<Vec<WorkerStats>>),
    RefreshStats,
    Shutdown(oneshot::Sender<()>),
}

/// Snapshot of one worker slot.
#[derive(Clone, Debug, Default, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct WorkerStats {
    pub index: usize,
    pub generation: u64,
    pub connected: bool,
    /// Last polled concurrency plus operations routed since.
    pub concurrency: usize,
    pub query_time_ms: Option<f64>,
    pub slow: bool,
    pub request_rate: Option<f64>,
}

struct Tasks {
    actor: JoinHandle<()>,
    supervisors: Vec<JoinHandle<()>>,
}

impl Drop for Tasks {
    fn drop(&mut self) {
        self.actor.abort();
        for supervisor in &self.supervisors {
            supervisor.abort();
        }
    }
}

/// Handle to a running worker pool. Clones share the pool; it stops when
/// the last clone is dropped or [`Dispatcher::shutdown`] is called.
#[derive(Clone)]
pub struct Dispatcher {
    commands: mpsc::UnboundedSender<Command>,
    ready: watch::Receiver<bool>,
    tasks: Arc<Tasks>,
}

impl std::fmt::Debug for Dispatcher {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Dispatcher")
            .field("ready", &*self.ready.borrow())
            .finish_non_exhaustive()
    }
}

impl Dispatcher {
    /// Starts `config.num_workers` supervised workers. Must be called inside
    /// a tokio runtime.
    pub fn start<L: WorkerLauncher>(config: DispatcherConfig, launcher: L) -> Self {
        let workers = config.num_workers;
        let (commands, rx) = mpsc::unbounded_channel();
        let (ready_tx, ready) = watch::channel(workers == 0);

        let actor = Actor::new(workers, ready_tx);
        let actor = tokio::spawn(actor.run(rx, commands.clone(), config.poll_interval));

        let settings = Arc::new(SupervisorSettings {
            respawn_delay: config.respawn_delay,
            retry_interval: config.retry_interval,
            call_timeout: config.call_timeout,
            codec: config.worker.codec,
        });
        let launcher = Arc::new(launcher);
        let supervisors = (0..workers)
            .map(|index| {
                tokio::spawn(supervise(
                    index,
                    Arc::clone(&launcher),
                    Arc::clone(&settings),
                    commands.clone(),
                ))
            })
            .collect();
        info!(workers, "dispatcher started");

        Self {
            commands,
            ready,
            tasks: Arc::new(Tasks { actor, supervisors }),
        }
    }

    /// Starts the pool with each worker as a child process of this one.
    pub fn spawn_processes(config: DispatcherConfig) -> Self {
        let launcher = ProcessLauncher::new(config.worker_program.clone(), config.worker.clone());
        Self::start(config, launcher)
    }

    /// Resolves once every worker has been up at least once.
    pub async fn ready(&self) -> Result<(), DispatchError> {
        let mut ready = self.ready.clone();
        ready
            .wait_for(|open| *open)
            .await
            .map(|_| ())
            .map_err(|_| DispatchError::Stopped)
    }

    /// Routes the query now; the returned future only waits for the outcome.
    pub fn execute(
        &self,
        query: String,
        params: Vec<Value>,
        options: QueryOptions,
    ) -> impl Future<Output = Result<ResultSet, DispatchError>> + Send + use<> {
        let params = encode(&options).map(|options| vec![Value::String(query), Value::Array(params), options]);
        self.submit(OperationKind::Execute, WorkerMethod::Execute, params)
    }

    pub fn batch(
        &self,
        queries: Vec<BatchQuery>,
        options: QueryOptions,
    ) -> impl Future<Output = Result<ResultSet, DispatchError>> + Send + use<> {
        let params = serde_json::to_value(&queries)
            .map_err(DispatchError::Encode)
            .and_then(|queries| Ok(vec![queries, encode(&options)?]));
        self.submit(OperationKind::Batch, WorkerMethod::Batch, params)
    }

    pub fn get_page(
        &self,
        query: String,
        params: Vec<Value>,
        options: QueryOptions,
    ) -> impl Future<Output = Result<Page, DispatchError>> + Send + use<> {
        let params = encode(&options).map(|options| vec![Value::String(query), Value::Array(params), options]);
        self.submit(OperationKind::GetPage, WorkerMethod::GetPage, params)
    }

    /// Hands every page to `on_page(page_index, rows)`, following the page
    /// state while `options.auto_page` is set. Returns the state of the next
    /// page when more remain.
    ///
    /// Each page is routed on its own. The page state is a row offset, so any
    /// worker can resume the cursor.
    pub async fn each_page<F>(
        &self,
        query: String,
        params: Vec<Value>,
        mut options: QueryOptions,
        mut on_page: F,
    ) -> Result<Option<String>, DispatchError>
    where
        F: FnMut(usize, Vec<Row>) + Send,
    {
        let mut page_index = 0;
        loop {
            let page = self
                .get_page(query.clone(), params.clone(), options.clone())
                .await?;
            on_page(page_index, page.rows);
            page_index += 1;
            let next = if page.has_next { page.page_state } else { None };
            if !options.auto_page || next.is_none() {
                return Ok(next);
            }
            options.page_state = next;
        }
    }

    pub async fn stats(&self) -> Result<Vec<WorkerStats>, DispatchError> {
        let (tx, rx) = oneshot::channel();
        self.commands
            .send(Command::Stats(tx))
            .map_err(|_| DispatchError::Stopped)?;
        rx.await.map_err(|_| DispatchError::Stopped)
    }

    /// Asks every connected worker for its query time and request rate; the
    /// answers show up in later [`Dispatcher::stats`] snapshots.
    pub fn refresh_stats(&self) -> Result<(), DispatchError> {
        self.commands
            .send(Command::RefreshStats)
            .map_err(|_| DispatchError::Stopped)
    }

    /// Tells workers to exit, then stops the actor and every supervisor.
    /// Operations still held back fail with [`DispatchError::Stopped`].
    pub async fn shutdown(self) {
        let (tx, rx) = oneshot::channel();
        if self.commands.send(Command::Shutdown(tx)).is_ok() {
            let _ = rx.await;
        }
        for supervisor in &self.tasks.supervisors {
            supervisor.abort();
        }
    }

    /// Hands the operation to the actor before returning, so operations are
    /// routed in the order they were issued.
    fn submit<T>(
        &self,
        kind: OperationKind,
        method: WorkerMethod,
        params: Result<Vec<Value>, DispatchError>,
    ) -> impl Future<Output = Result<T, DispatchError>> + Send + use<T>
    where
        T: DeserializeOwned + Send + 'static,
    {
        let (tx, rx) = oneshot::channel();
        let respond: Responder = Box::new(move |outcome| {
            let decoded = outcome.and_then(|value| serde_json::from_value::<T>(value).map_err(DispatchError::from));
            let _ = tx.send(decoded);
        });
        match params {
            Ok(params) => {
                // A closed channel drops the operation, and with it the sender.
                let _ = self.commands.send(Command::Submit(Operation {
                    kind,
                    method,
                    params,
                    respond,
                }));
            }
            Err(err) => respond(Err(err)),
        }
        async move { rx.await.unwrap_or(Err(DispatchError::Stopped)) }
    }
}

fn encode(options: &QueryOptions) -> Result<Value, DispatchError> {
    serde_json::to_value(options).map_err(DispatchError::Encode)
}

#[derive(Default)]
struct WorkerSlot {
    generation: u64,
    client: Option<ChannelClient>,
    control: Option<mpsc::UnboundedSender<ParentMessage>>,
    query_time_ms: Option<f64>,
    slow: bool,
    request_rate: Option<f64>,
}

struct Actor {
    slots: Vec<WorkerSlot>,
    load: LoadTable,
    barrier: StartupBarrier,
    pending: PendingOps<Operation>,
    ready: watch::Sender<bool>,
}

impl Actor {
    fn new(workers: usize, ready: watch::Sender<bool>) -> Self {
        Self {
            slots: (0..workers).map(|_| WorkerSlot::default()).collect(),
            load: LoadTable::new(workers),
            barrier: StartupBarrier::new(workers),
            pending: PendingOps::default(),
            ready,
        }
    }

    async fn run(
        mut self,
        mut rx: mpsc::UnboundedReceiver<Command>,
        commands: mpsc::UnboundedSender<Command>,
        poll_interval: Duration,
    ) {
        let mut poll = tokio::time::interval(poll_interval);
        poll.set_missed_tick_behavior(MissedTickBehavior::Delay);
        loop {
            tokio::select! {
                command = rx.recv() => match command {
                    Some(command) => {
                        if !self.handle(command) {
                            return;
                        }
                    }
                    None => return,
                },
                _ = poll.tick() => self.poll(&commands),
            }
        }
    }

    /// Returns `false` once the actor should stop.
    fn handle(&mut self, command: Command) -> bool {
        match command {
            Command::Submit(op) => self.route(op),
            Command::WorkerUp {
                index,
                generation,
                client,
                control,
            } => self.worker_up(index, generation, client, control),
            Command::WorkerDown { index, generation } => self.worker_down(index, generation),
            Command::Polled {
                index,
                generation,
                count,
            } => {
                if self.is_current(index, generation) && self.load.is_connected(index) {
                    self.load.set_count(index, count);
                }
            }
            Command::Control {
                index,
                generation,
                message,
            } => {
                if self.is_current(index, generation) {
                    self.control(index, message);
                }
            }
            Command::Stats(reply) => {
                let _ = reply.send(self.stats());
            }
            Command::RefreshStats => {
                for control in self.slots.iter().filter_map(|slot| slot.control.as_ref()) {
                    let _ = control.send(ParentMessage::FetchQueryTime);
                    let _ = control.send(ParentMessage::CountRequest);
                }
            }
            Command::Shutdown(done) => {
                self.stop();
                let _ = done.send(());
                return false;
            }
        }
        true
    }

    fn is_current(&self, index: usize, generation: u64) -> bool {
        self.slots
            .get(index)
            .is_some_and(|slot| slot.generation == generation)
    }

    fn worker_up(
        &mut self,
        index: usize,
        generation: u64,
        client: ChannelClient,
        control: mpsc::UnboundedSender<ParentMessage>,
    ) {
        let Some(slot) = self.slots.get_mut(index) else {
            return;
        };
        if generation < slot.generation {
            client.close();
            return;
        }
        if let Some(previous) = slot.client.replace(client) {
            previous.close();
        }
        slot.generation = generation;
        slot.control = Some(control);
        slot.slow = false;
        self.load.set_connected(index, true);
        self.load.set_count(index, 0);
        info!(index, generation, "worker connected");

        if self.barrier.mark_ready(index) {
            info!(buffered = self.pending.len(), "all workers ready");
            self.ready.send_replace(true);
            self.flush();
        } else if self.barrier.is_open() {
            self.flush();
        }
    }

    fn worker_down(&mut self, index: usize, generation: u64) {
        let Some(slot) = self.slots.get_mut(index) else {
            return;
        };
        if generation < slot.generation {
            return;
        }
        slot.generation = generation;
        if let Some(client) = slot.client.take() {
            client.close();
        }
        slot.control = None;
        self.load.set_connected(index, false);
        warn!(index, generation, "worker down");
    }

    fn control(&mut self, index: usize, message: WorkerMessage) {
        let slot = &mut self.slots[index];
        match message {
            WorkerMessage::Ready { .. } => {}
            WorkerMessage::ConcurrentQuery { value } => self.load.set_count(index, value),
            WorkerMessage::RequestRate { count } => slot.request_rate = Some(count),
            WorkerMessage::QueryTime { time_ms } | WorkerMessage::QueryTimeUpdate { time_ms } => {
                slot.query_time_ms = Some(time_ms);
                slot.slow = false;
            }
            WorkerMessage::SlowReport { time_ms } => {
                warn!(index, time_ms, "worker reports slow database");
                slot.query_time_ms = Some(time_ms);
                slot.slow = true;
            }
        }
    }

    /// Sends `op` to the least loaded reachable worker, or holds it when
    /// none is left.
    fn route(&mut self, op: Operation) {
        if !self.barrier.is_open() {
            self.pending.push(op.kind, op);
            return;
        }
        let Operation {
            kind,
            method,
            mut params,
            respond,
        } = op;
        loop {
            let Some(index) = self.load.select() else {
                debug!(kind = kind.as_str(), "no worker connected, holding operation");
                let op = Operation {
                    kind,
                    method,
                    params,
                    respond,
                };
                self.pending.push(kind, op);
                return;
            };
            // The channel can drop before the supervisor's `WorkerDown` lands.
            let slot = &self.slots[index];
            let Some(client) = slot.client.as_ref().filter(|client| client.is_connected()) else {
                self.unreachable(index);
                continue;
            };
            match client.try_start_call(CallStyle::Invoke, method.name(), params) {
                Ok(pending) => {
                    tokio::spawn(async move {
                        let outcome = pending
                            .recv()
                            .await
                            .map(|reply| reply.result.unwrap_or(Value::Null))
                            .map_err(DispatchError::from);
                        respond(outcome);
                    });
                    return;
                }
                Err(unsent) => {
                    debug!(index, error = %unsent.error, "worker unreachable, rerouting");
                    params = unsent.params;
                    self.unreachable(index);
                }
            }
        }
    }

    fn unreachable(&mut self, index: usize) {
        self.load.release(index);
        self.load.set_connected(index, false);
    }

    fn flush(&mut self) {
        for op in self.pending.drain() {
            self.route(op);
        }
    }

    fn poll(&self, commands: &mpsc::UnboundedSender<Command>) {
        for (index, slot) in self.slots.iter().enumerate() {
            let Some(client) = slot.client.as_ref().filter(|client| client.is_connected()) else {
                continue;
            };
            let Ok(pending) = client.start_call(CallStyle::Invoke, WorkerMethod::GetConcurrent.name(), Vec::new())
            else {
                continue;
            };
            let generation = slot.generation;
            let commands = commands.clone();
            tokio::spawn(async move {
                match pending.recv().await {
                    Ok(reply) => {
                        if let Some(count) = reply.result.as_ref().and_then(Value::as_u64) {
                            let _ = commands.send(Command::Polled {
                                index,
                                generation,
                                count: count as usize,
                            });
                        }
                    }
                    Err(err) => debug!(index, generation, error = %err, "concurrency poll failed"),
                }
            });
        }
    }

    fn stats(&self) -> Vec<WorkerStats> {
        self.slots
            .iter()
            .enumerate()
            .map(|(index, slot)| WorkerStats {
                index,
                generation: slot.generation,
                connected: self.load.is_connected(index),
                concurrency: self.load.count(index),
                query_time_ms: slot.query_time_ms,
                slow: slot.slow,
                request_rate: slot.request_rate,
            })
            .collect()
    }

    fn stop(&mut self) {
        for slot in &mut self.slots {
            if let Some(control) = slot.control.take() {
                let _ = control.send(ParentMessage::Shutdown);
            }
            if let Some(client) = slot.client.take() {
                client.close();
            }
        }
        // Held-back callers see `Stopped` once their responders drop.
        drop(self.pending.drain());
        info!("dispatcher stopped");
    }
}
