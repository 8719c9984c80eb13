//! Parent/worker control messages, carried over the worker's stdin/stdout.
//!
//! Same length-prefixed framing as the call channel, always JSON.

use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};
use tokio::io::{AsyncRead, AsyncWrite};

use crate::frame::{FrameError, WireCodec, read_message, write_message};

#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "ac", rename_all = "snake_case")]
pub enum ParentMessage {
    FetchConcurrentQuery,
    CountRequest,
    FetchQueryTime,
    Shutdown,
}

#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(tag = "ac", rename_all = "snake_case")]
pub enum WorkerMessage {
    /// Database and channel server are both up.
    Ready { server_id: String },
    ConcurrentQuery { value: usize },
    /// Requests per second over the last ten seconds.
    RequestRate { count: f64 },
    QueryTime { time_ms: f64 },
    SlowReport { time_ms: f64 },
    QueryTimeUpdate { time_ms: f64 },
}

#[derive(Debug)]
pub struct ControlReader<R> {
    inner: R,
}

impl<R: AsyncRead + Unpin> ControlReader<R> {
    pub fn new(inner: R) -> Self {
        Self { inner }
    }

    /// `Ok(None)` once the peer has closed its end.
    pub async fn recv<T: DeserializeOwned>(&mut self) -> Result<Option<T>, FrameError> {
        read_message(&mut self.inner, WireCodec::Json).await
    }
}

#[derive(Debug)]
pub struct ControlWriter<W> {
    inner: W,
}

impl<W: AsyncWrite + Unpin> ControlWriter<W> {
    pub fn new(inner: W) -> Self {
        Self { inner }
    }

    pub async fn send<T: Serialize>(&mut self, message: &T) -> Result<(), FrameError> {
        write_message(&mut self.inner, WireCodec::Json, message).await
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn messages_use_the_ac_tag() {
        assert_eq!(
            serde_json::to_value(ParentMessage::FetchConcurrentQuery).expect("encode"),
            json!({"ac": "fetch_concurrent_query"})
        );
        assert_eq!(
            serde_json::to_value(WorkerMessage::SlowReport { time_ms: 6100.0 }).expect("encode"),
            json!({"ac": "slow_report", "time_ms": 6100.0})
        );
        let ready: WorkerMessage =
            serde_json::from_value(json!({"ac": "ready", "server_id": "2"})).expect("decode");
        assert_eq!(ready, WorkerMessage::Ready { server_id: "2".into() });
    }

    #[tokio::test]
    async fn link_carries_messages_until_eof() {
        let (parent_end, worker_end) = tokio::io::duplex(4096);
        let mut writer = ControlWriter::new(parent_end);
        let mut reader = ControlReader::new(worker_end);
        writer.send(&ParentMessage::CountRequest).await.expect("send");
        writer.send(&ParentMessage::Shutdown).await.expect("send");
        drop(writer);

        assert_eq!(reader.recv::<ParentMessage>().await.expect("recv"), Some(ParentMessage::CountRequest));
        assert_eq!(reader.recv::<ParentMessage>().await.expect("recv"), Some(ParentMessage::Shutdown));
        assert_eq!(reader.recv::<ParentMessage>().await.expect("eof"), None);
    }
}
