//! Correlated call channel between a dispatcher and its worker processes.
//!
//! A channel carries tagged frames (`connect`, `call`, `response`) over a Unix
//! socket, or over TCP with a shared secret appended to every call. Calls come
//! in two styles: `fire` resolves to the bare result, `invoke` resolves to the
//! full reply payload.

mod client;
pub mod control;
mod envelope;
mod error;
mod frame;
mod registry;
mod secret;
mod server;

pub use client::{ChannelClient, ClientOptions, ConnectionState, PendingReply, Unsent};
pub use envelope::{CallEnvelope, CallStyle, Frame, Reply, ResponseEnvelope};
pub use error::{CallError, ErrorCode, RemoteError};
pub use frame::{FrameError, MAX_FRAME_SIZE, WireCodec, read_frame, read_message, write_frame, write_message};
pub use registry::{Handler, HandlerFuture, MethodRegistry, RegistryError};
pub use secret::SharedSecret;
pub use server::{ChannelServer, ListenOptions, RunningServer};

use std::net::SocketAddr;
use std::path::{Path, PathBuf};

/// Where a channel server listens.
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum Endpoint {
    Local(PathBuf),
    Net(SocketAddr),
}

impl Endpoint {
    /// Unix socket endpoint for `server_id` inside `socket_dir`.
    pub fn local(socket_dir: &Path, server_id: &str) -> Self {
        Endpoint::Local(socket_path(socket_dir, server_id))
    }
}

pub fn socket_path(socket_dir: &Path, server_id: &str) -> PathBuf {
    socket_dir.join(format!("shoal.{server_id}.sock"))
}

impl std::fmt::Display for Endpoint {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Endpoint::Local(path) => write!(f, "unix:{}", path.display()),
            Endpoint::Net(addr) => write!(f, "tcp:{addr}"),
        }
    }
}
