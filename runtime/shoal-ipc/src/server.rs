//! Server half of a call channel.

use std::io;
use std::net::SocketAddr;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;
use tokio::io::{AsyncRead, AsyncWrite};
use tokio::net::{TcpListener, UnixListener};
use tokio::sync::{mpsc, watch};
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};

use crate::envelope::{CallEnvelope, CallStyle, Frame, Reply, ResponseEnvelope};
use crate::error::RemoteError;
use crate::frame::{FrameError, WireCodec, read_message, write_message};
use crate::registry::MethodRegistry;
use crate::secret::SharedSecret;
use crate::socket_path;

const ACCEPT_BACKOFF: Duration = Duration::from_millis(100);

#[derive(Clone, Debug)]
pub struct ListenOptions {
    /// Directory holding the `shoal.<server_id>.sock` socket file.
    pub socket_dir: PathBuf,
    /// Optional TCP listener; every call on it must carry the secret.
    pub net: Option<(SocketAddr, SharedSecret)>,
}

impl ListenOptions {
    pub fn local(socket_dir: impl Into<PathBuf>) -> Self {
        Self {
            socket_dir: socket_dir.into(),
            net: None,
        }
    }

    pub fn with_net(mut self, addr: SocketAddr, secret: SharedSecret) -> Self {
        self.net = Some((addr, secret));
        self
    }
}

/// Serves the methods of one registry under a server id.
#[derive(Debug)]
pub struct ChannelServer {
    server_id: String,
    registry: Arc<MethodRegistry>,
    codec: WireCodec,
}

impl ChannelServer {
    pub fn new(server_id: impl Into<String>, registry: MethodRegistry) -> Self {
        Self {
            server_id: server_id.into(),
            registry: Arc::new(registry),
            codec: WireCodec::default(),
        }
    }

    pub fn with_codec(mut self, codec: WireCodec) -> Self {
        self.codec = codec;
        self
    }

    pub fn server_id(&self) -> &str {
        &self.server_id
    }

    /// Binds the listeners and starts accepting. A stale socket file left by
    /// an earlier process with the same id is replaced.
    pub async fn listen(&self, options: ListenOptions) -> io::Result<RunningServer> {
        let local_path = socket_path(&options.socket_dir, &self.server_id);
        match std::fs::remove_file(&local_path) {
            Ok(()) => debug!(path = %local_path.display(), "removed stale socket file"),
            Err(err) if err.kind() == io::ErrorKind::NotFound => {}
            Err(err) => return Err(err),
        }
        let unix = UnixListener::bind(&local_path)?;
        let (shutdown, _) = watch::channel(false);

        let mut listeners = vec![tokio::spawn(accept_unix(
            self.context(None),
            unix,
            shutdown.subscribe(),
        ))];
        let mut net_addr = None;
        if let Some((addr, secret)) = options.net {
            let tcp = TcpListener::bind(addr).await?;
            net_addr = Some(tcp.local_addr()?);
            listeners.push(tokio::spawn(accept_tcp(
                self.context(Some(secret)),
                tcp,
                shutdown.subscribe(),
            )));
        }
        info!(
            server_id = %self.server_id,
            path = %local_path.display(),
            net = ?net_addr,
            "channel server listening"
        );
        Ok(RunningServer {
            local_path,
            net_addr,
            shutdown,
            listeners,
        })
    }

    fn context(&self, secret: Option<SharedSecret>) -> Connection {
        Connection {
            server_id: Arc::from(self.server_id.as_str()),
            registry: Arc::clone(&self.registry),
            codec: self.codec,
            secret,
        }
    }
}

/// Listening server. Dropping it stops accepting, closes open connections
/// and removes the socket file.
#[derive(Debug)]
pub struct RunningServer {
    local_path: PathBuf,
    net_addr: Option<SocketAddr>,
    shutdown: watch::Sender<bool>,
    listeners: Vec<JoinHandle<()>>,
}

impl RunningServer {
    pub fn local_path(&self) -> &Path {
        &self.local_path
    }

    /// Bound TCP address, with the real port when 0 was requested.
    pub fn net_addr(&self) -> Option<SocketAddr> {
        self.net_addr
    }

    pub fn shutdown(self) {
        drop(self);
    }
}

impl Drop for RunningServer {
    fn drop(&mut self) {
        for listener in &self.listeners {
            listener.abort();
        }
        self.shutdown.send_replace(true);
        let _ = std::fs::remove_file(&self.local_path);
    }
}

#[derive(Clone)]
struct Connection {
    server_id: Arc<str>,
    registry: Arc<MethodRegistry>,
    codec: WireCodec,
    secret: Option<SharedSecret>,
}

impl Connection {
    /// Runs on the read loop: the handler is entered before the next frame is read.
    fn dispatch(&self, mut call: CallEnvelope, out: &mpsc::UnboundedSender<Frame>) {
        if let Some(secret) = &self.secret {
            if let Err(err) = secret.unseal(&mut call.params) {
                warn!(server_id = %self.server_id, method = %call.method, "rejecting call with mismatched secret");
                respond(out, call.style, call.call_id, Reply::error(err));
                return;
            }
        }
        let Some(handler) = self.registry.get(&call.method) else {
            warn!(server_id = %self.server_id, method = %call.method, "call to unknown method");
            let err = RemoteError::method_not_found(&call.method);
            respond(out, call.style, call.call_id, Reply::error(err));
            return;
        };
        let future = handler(call.params);
        let style = call.style;
        let Some(call_id) = call.call_id else {
            let method = call.method;
            tokio::spawn(async move {
                if let Err(err) = future.await {
                    debug!(%method, error = %err, "notification handler failed");
                }
            });
            return;
        };
        let out = out.clone();
        tokio::spawn(async move {
            let reply = future.await.unwrap_or_else(Reply::error);
            respond(&out, style, Some(call_id), reply);
        });
    }
}

fn respond(
    out: &mpsc::UnboundedSender<Frame>,
    style: CallStyle,
    call_id: Option<String>,
    reply: Reply,
) {
    let Some(call_id) = call_id else {
        return;
    };
    let res = match style {
        CallStyle::Fire => reply.into_fire(),
        CallStyle::Invoke => reply,
    };
    let _ = out.send(Frame::Response(ResponseEnvelope {
        style,
        call_id,
        res,
    }));
}

async fn accept_unix(conn: Connection, listener: UnixListener, shutdown: watch::Receiver<bool>) {
    loop {
        match listener.accept().await {
            Ok((stream, _)) => {
                tokio::spawn(serve_connection(conn.clone(), stream, shutdown.clone()));
            }
            Err(err) => {
                warn!(server_id = %conn.server_id, error = %err, "unix accept failed");
                tokio::time::sleep(ACCEPT_BACKOFF).await;
            }
        }
    }
}

async fn accept_tcp(conn: Connection, listener: TcpListener, shutdown: watch::Receiver<bool>) {
    loop {
        match listener.accept().await {
            Ok((stream, peer)) => {
                debug!(server_id = %conn.server_id, %peer, "accepted network channel");
                let _ = stream.set_nodelay(true);
                tokio::spawn(serve_connection(conn.clone(), stream, shutdown.clone()));
            }
            Err(err) => {
                warn!(server_id = %conn.server_id, error = %err, "tcp accept failed");
                tokio::time::sleep(ACCEPT_BACKOFF).await;
            }
        }
    }
}

async fn serve_connection<S>(conn: Connection, stream: S, mut shutdown: watch::Receiver<bool>)
where
    S: AsyncRead + AsyncWrite + Send + 'static,
{
    let (mut reader, mut writer) = tokio::io::split(stream);
    let codec = conn.codec;
    let (tx, mut rx) = mpsc::unbounded_channel::<Frame>();
    let writer_task = tokio::spawn(async move {
        while let Some(frame) = rx.recv().await {
            match write_message(&mut writer, codec, &frame).await {
                Ok(()) => {}
                Err(FrameError::Io(err)) => {
                    debug!(error = %err, "channel peer went away");
                    break;
                }
                Err(err) => warn!(error = %err, "dropping unencodable response"),
            }
        }
    });
    let _ = tx.send(Frame::Connect {
        server_id: conn.server_id.to_string(),
    });

    loop {
        let frame = tokio::select! {
            _ = shutdown.changed() => {
                writer_task.abort();
                break;
            }
            frame = read_message::<Frame, _>(&mut reader, codec) => frame,
        };
        match frame {
            Ok(Some(Frame::Call(call))) => conn.dispatch(call, &tx),
            Ok(Some(_)) => debug!(server_id = %conn.server_id, "ignoring non-call frame"),
            Ok(None) => break,
            Err(err) => {
                debug!(server_id = %conn.server_id, error = %err, "channel connection failed");
                break;
            }
        }
    }
}
