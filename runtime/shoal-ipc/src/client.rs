//! Client half of a call channel.

use parking_lot::Mutex;
use serde_json::Value;
use std::collections::HashMap;
use std::fmt;
use std::net::SocketAddr;
use std::path::Path;
use std::sync::Arc;
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::Duration;
use tokio::io::{AsyncRead, AsyncWrite};
use tokio::net::{TcpStream, UnixStream};
use tokio::sync::{mpsc, oneshot, watch};
use tokio::task::JoinHandle;
use tracing::{debug, info, trace, warn};

use crate::Endpoint;
use crate::envelope::{CallEnvelope, CallStyle, Frame, Reply, ResponseEnvelope};
use crate::error::CallError;
use crate::frame::{FrameError, WireCodec, read_message, write_message};
use crate::secret::SharedSecret;

const DEFAULT_RETRY_INTERVAL: Duration = Duration::from_millis(1000);

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum ConnectionState {
    Connecting,
    Connected,
    Disconnected,
    /// Terminal: closed by the owner, or lost with reconnects disabled.
    Closed,
}

#[derive(Clone, Debug)]
pub struct ClientOptions {
    pub server_id: String,
    pub endpoint: Endpoint,
    /// Set for network channels; appended to every outbound call.
    pub secret: Option<SharedSecret>,
    pub codec: WireCodec,
    pub retry_interval: Duration,
    /// Per-call deadline. `None` waits until the response or a disconnect.
    pub call_timeout: Option<Duration>,
    /// Go back to connecting after an established connection drops.
    pub reconnect: bool,
    /// Used for calls issued while this client is not connected.
    pub fallback: Option<ChannelClient>,
}

impl ClientOptions {
    pub fn local(server_id: impl Into<String>, socket_dir: &Path) -> Self {
        let server_id = server_id.into();
        Self {
            endpoint: Endpoint::local(socket_dir, &server_id),
            server_id,
            secret: None,
            codec: WireCodec::default(),
            retry_interval: DEFAULT_RETRY_INTERVAL,
            call_timeout: None,
            reconnect: true,
            fallback: None,
        }
    }

    pub fn net(server_id: impl Into<String>, addr: SocketAddr, secret: SharedSecret) -> Self {
        Self {
            server_id: server_id.into(),
            endpoint: Endpoint::Net(addr),
            secret: Some(secret),
            codec: WireCodec::default(),
            retry_interval: DEFAULT_RETRY_INTERVAL,
            call_timeout: None,
            reconnect: true,
            fallback: None,
        }
    }

    pub fn with_codec(mut self, codec: WireCodec) -> Self {
        self.codec = codec;
        self
    }

    pub fn with_retry_interval(mut self, interval: Duration) -> Self {
        self.retry_interval = interval;
        self
    }

    pub fn with_call_timeout(mut self, timeout: Option<Duration>) -> Self {
        self.call_timeout = timeout;
        self
    }

    pub fn with_reconnect(mut self, reconnect: bool) -> Self {
        self.reconnect = reconnect;
        self
    }

    pub fn with_fallback(mut self, fallback: ChannelClient) -> Self {
        self.fallback = Some(fallback);
        self
    }
}

struct PendingCall {
    style: CallStyle,
    tx: oneshot::Sender<Result<Reply, CallError>>,
}

struct Shared {
    server_id: String,
    secret: Option<SharedSecret>,
    call_timeout: Option<Duration>,
    next_call: AtomicU64,
    pending: Mutex<HashMap<String, PendingCall>>,
    outbound: Mutex<Option<mpsc::UnboundedSender<Frame>>>,
    state: watch::Sender<ConnectionState>,
}

impl Shared {
    fn outbound(&self) -> Option<mpsc::UnboundedSender<Frame>> {
        self.outbound.lock().clone()
    }

    fn next_call_id(&self) -> String {
        self.next_call.fetch_add(1, Ordering::Relaxed).to_string()
    }

    fn sealed(&self, mut params: Vec<Value>) -> Vec<Value> {
        if let Some(secret) = &self.secret {
            secret.seal(&mut params);
        }
        params
    }

    fn unsealed(&self, mut params: Vec<Value>) -> Vec<Value> {
        if self.secret.is_some() {
            params.pop();
        }
        params
    }

    fn attach(&self, tx: mpsc::UnboundedSender<Frame>) {
        *self.outbound.lock() = Some(tx);
        self.state.send_replace(ConnectionState::Connected);
    }

    /// Drops the live connection and fails every call still waiting on it.
    fn detach(&self) -> bool {
        let was_connected = self.outbound.lock().take().is_some();
        let drained: Vec<PendingCall> = self.pending.lock().drain().map(|(_, call)| call).collect();
        for call in drained {
            let _ = call.tx.send(Err(CallError::Disconnected));
        }
        if was_connected {
            self.state.send_replace(ConnectionState::Disconnected);
        }
        was_connected
    }

    fn resolve(&self, response: ResponseEnvelope) {
        let Some(pending) = self.pending.lock().remove(&response.call_id) else {
            debug!(
                server_id = %self.server_id,
                call_id = %response.call_id,
                "response for unknown or expired call"
            );
            return;
        };
        if pending.style != response.style {
            warn!(
                server_id = %self.server_id,
                call_id = %response.call_id,
                expected = pending.style.as_str(),
                got = response.style.as_str(),
                "response style does not match the call"
            );
        }
        let reply = match pending.style {
            CallStyle::Fire => response.res.into_fire(),
            CallStyle::Invoke => response.res,
        };
        let _ = pending.tx.send(Ok(reply));
    }
}

struct TaskGuard(JoinHandle<()>);

impl Drop for TaskGuard {
    fn drop(&mut self) {
        self.0.abort();
    }
}

/// Removes a call's pending entry when its waiter goes away.
struct PendingGuard {
    shared: Arc<Shared>,
    call_id: String,
}

impl Drop for PendingGuard {
    fn drop(&mut self) {
        self.shared.pending.lock().remove(&self.call_id);
    }
}

/// Waiter for one in-flight call.
pub struct PendingReply {
    rx: oneshot::Receiver<Result<Reply, CallError>>,
    timeout: Option<Duration>,
    guard: PendingGuard,
}

impl PendingReply {
    pub fn call_id(&self) -> &str {
        &self.guard.call_id
    }

    /// Waits for the response. An error-bearing reply becomes `CallError::Remote`.
    pub async fn recv(self) -> Result<Reply, CallError> {
        let PendingReply { rx, timeout, guard } = self;
        let outcome = match timeout {
            Some(limit) => match tokio::time::timeout(limit, rx).await {
                Ok(outcome) => outcome,
                Err(_) => {
                    drop(guard);
                    return Err(CallError::Timeout(limit));
                }
            },
            None => rx.await,
        };
        drop(guard);
        let reply = outcome.map_err(|_| CallError::Disconnected)??;
        match reply.error {
            Some(err) => Err(CallError::Remote(err)),
            None => Ok(reply),
        }
    }
}

/// A call that was never queued, with the params it was started with.
#[derive(Debug)]
pub struct Unsent {
    pub error: CallError,
    pub params: Vec<Value>,
}

#[derive(Clone)]
pub struct ChannelClient {
    shared: Arc<Shared>,
    fallback: Option<Box<ChannelClient>>,
    task: Arc<TaskGuard>,
}

impl ChannelClient {
    /// Starts connecting in the background. Must be called inside a tokio runtime.
    pub fn connect(options: ClientOptions) -> Self {
        let (state, _) = watch::channel(ConnectionState::Connecting);
        let shared = Arc::new(Shared {
            server_id: options.server_id,
            secret: options.secret,
            call_timeout: options.call_timeout,
            next_call: AtomicU64::new(0),
            pending: Mutex::new(HashMap::new()),
            outbound: Mutex::new(None),
            state,
        });
        let task = tokio::spawn(run_connection(
            Arc::clone(&shared),
            options.endpoint,
            options.codec,
            options.retry_interval,
            options.reconnect,
        ));
        Self {
            shared,
            fallback: options.fallback.map(Box::new),
            task: Arc::new(TaskGuard(task)),
        }
    }

    pub fn server_id(&self) -> &str {
        &self.shared.server_id
    }

    pub fn state(&self) -> ConnectionState {
        *self.shared.state.borrow()
    }

    pub fn is_connected(&self) -> bool {
        self.state() == ConnectionState::Connected
    }

    /// Number of calls still waiting for a response.
    pub fn pending_calls(&self) -> usize {
        self.shared.pending.lock().len()
    }

    /// Resolves once the handshake completes; fails if the client closes first.
    pub async fn connected(&self) -> Result<(), CallError> {
        let mut state = self.shared.state.subscribe();
        let reached = state
            .wait_for(|s| matches!(s, ConnectionState::Connected | ConnectionState::Closed))
            .await
            .map(|s| *s)
            .map_err(|_| CallError::Disconnected)?;
        if reached == ConnectionState::Connected {
            Ok(())
        } else {
            Err(CallError::Disconnected)
        }
    }

    /// Resolves as soon as the client is not connected.
    pub async fn disconnected(&self) {
        let mut state = self.shared.state.subscribe();
        let _ = state.wait_for(|s| *s != ConnectionState::Connected).await;
    }

    /// Registers the call and queues its frame before returning, so calls
    /// leave in the order they were started.
    pub fn start_call(
        &self,
        style: CallStyle,
        method: &str,
        params: Vec<Value>,
    ) -> Result<PendingReply, CallError> {
        self.try_start_call(style, method, params).map_err(|unsent| unsent.error)
    }

    /// Like [`start_call`](Self::start_call), but a call that could not be
    /// queued on this client or its fallback hands its params back.
    pub fn try_start_call(
        &self,
        style: CallStyle,
        method: &str,
        params: Vec<Value>,
    ) -> Result<PendingReply, Unsent> {
        let Some(outbound) = self.shared.outbound() else {
            return match &self.fallback {
                Some(fallback) => fallback.try_start_call(style, method, params),
                None => Err(Unsent {
                    error: CallError::NotConnected,
                    params,
                }),
            };
        };
        let call_id = self.shared.next_call_id();
        let (tx, rx) = oneshot::channel();
        self.shared
            .pending
            .lock()
            .insert(call_id.clone(), PendingCall { style, tx });
        let guard = PendingGuard {
            shared: Arc::clone(&self.shared),
            call_id: call_id.clone(),
        };
        let envelope = CallEnvelope {
            style,
            method: method.to_string(),
            params: self.shared.sealed(params),
            call_id: Some(call_id),
        };
        if let Err(mpsc::error::SendError(frame)) = outbound.send(Frame::Call(envelope)) {
            let params = match frame {
                Frame::Call(envelope) => self.shared.unsealed(envelope.params),
                _ => Vec::new(),
            };
            return Err(Unsent {
                error: CallError::Disconnected,
                params,
            });
        }
        Ok(PendingReply {
            rx,
            timeout: self.shared.call_timeout,
            guard,
        })
    }

    /// Fire-style call; resolves to the bare result.
    pub async fn call(&self, method: &str, params: Vec<Value>) -> Result<Value, CallError> {
        let reply = self.start_call(CallStyle::Fire, method, params)?.recv().await?;
        Ok(reply.result.unwrap_or(Value::Null))
    }

    /// Invoke-style call; resolves to the full reply payload.
    pub async fn call_method(&self, method: &str, params: Vec<Value>) -> Result<Reply, CallError> {
        self.start_call(CallStyle::Invoke, method, params)?.recv().await
    }

    /// Sends without a call id; the server never answers.
    pub fn notify(&self, style: CallStyle, method: &str, params: Vec<Value>) -> Result<(), CallError> {
        let Some(outbound) = self.shared.outbound() else {
            return match &self.fallback {
                Some(fallback) => fallback.notify(style, method, params),
                None => Err(CallError::NotConnected),
            };
        };
        let envelope = CallEnvelope {
            style,
            method: method.to_string(),
            params: self.shared.sealed(params),
            call_id: None,
        };
        outbound
            .send(Frame::Call(envelope))
            .map_err(|_| CallError::Disconnected)
    }

    pub fn close(&self) {
        self.task.0.abort();
        self.shared.detach();
        self.shared.state.send_replace(ConnectionState::Closed);
    }
}

impl fmt::Debug for ChannelClient {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ChannelClient")
            .field("server_id", &self.shared.server_id)
            .field("state", &self.state())
            .field("fallback", &self.fallback.as_ref().map(|client| client.server_id()))
            .finish()
    }
}

async fn run_connection(
    shared: Arc<Shared>,
    endpoint: Endpoint,
    codec: WireCodec,
    retry_interval: Duration,
    reconnect: bool,
) {
    loop {
        let outcome = match &endpoint {
            Endpoint::Local(path) => match UnixStream::connect(path).await {
                Ok(stream) => Some(drive(&shared, stream, codec).await),
                Err(err) => {
                    trace!(server_id = %shared.server_id, %endpoint, error = %err, "connect attempt failed");
                    None
                }
            },
            Endpoint::Net(addr) => match TcpStream::connect(addr).await {
                Ok(stream) => {
                    let _ = stream.set_nodelay(true);
                    Some(drive(&shared, stream, codec).await)
                }
                Err(err) => {
                    trace!(server_id = %shared.server_id, %endpoint, error = %err, "connect attempt failed");
                    None
                }
            },
        };
        if let Some(result) = outcome {
            if let Err(err) = result {
                debug!(server_id = %shared.server_id, error = %err, "channel connection ended");
            }
            if shared.detach() {
                info!(server_id = %shared.server_id, "disconnected from server");
                if !reconnect {
                    shared.state.send_replace(ConnectionState::Closed);
                    return;
                }
            }
        }
        tokio::time::sleep(retry_interval).await;
    }
}

async fn drive<S>(shared: &Arc<Shared>, stream: S, codec: WireCodec) -> Result<(), FrameError>
where
    S: AsyncRead + AsyncWrite + Send + 'static,
{
    let (mut reader, mut writer) = tokio::io::split(stream);
    match read_message::<Frame, _>(&mut reader, codec).await? {
        Some(Frame::Connect { server_id }) => info!("connected to {server_id} server"),
        Some(_) => return Err(FrameError::Decode("expected connect handshake".into())),
        None => return Ok(()),
    }

    let (tx, mut rx) = mpsc::unbounded_channel::<Frame>();
    let writer_task = tokio::spawn(async move {
        while let Some(frame) = rx.recv().await {
            match write_message(&mut writer, codec, &frame).await {
                Ok(()) => {}
                Err(FrameError::Io(err)) => {
                    warn!(error = %err, "channel write failed");
                    break;
                }
                Err(err) => warn!(error = %err, "dropping unencodable frame"),
            }
        }
    });
    shared.attach(tx);

    let result = loop {
        match read_message::<Frame, _>(&mut reader, codec).await {
            Ok(Some(Frame::Response(response))) => shared.resolve(response),
            Ok(Some(_)) => debug!(server_id = %shared.server_id, "ignoring unexpected frame"),
            Ok(None) => break Ok(()),
            Err(err) => break Err(err),
        }
    };
    writer_task.abort();
    result
}
