//! Control link to the dispatcher that spawned this worker.

use shoal_db::{Database, LatencyReport, QueryExecutor};
use shoal_ipc::FrameError;
use shoal_ipc::control::{ControlReader, ControlWriter, ParentMessage, WorkerMessage};
use std::time::Duration;
use tokio::io::{AsyncRead, AsyncWrite};
use tokio::sync::mpsc;
use tokio::time::{Instant, MissedTickBehavior, interval_at};
use tracing::{debug, info, warn};

/// Announces readiness, then answers parent requests and pushes a latency
/// report every `report_interval` until the parent hangs up or asks for
/// shutdown.
pub async fn run_control<D, R, W>(
    executor: QueryExecutor<D>,
    server_id: String,
    reader: R,
    writer: W,
    report_interval: Duration,
) -> Result<(), FrameError>
where
    D: Database,
    R: AsyncRead + Unpin,
    W: AsyncWrite + Unpin + Send + 'static,
{
    let (tx, rx) = mpsc::unbounded_channel::<WorkerMessage>();
    let writer_task = tokio::spawn(write_control(ControlWriter::new(writer), rx));
    let _ = tx.send(WorkerMessage::Ready { server_id });
    let reporter = tokio::spawn(report_loop(executor.clone(), report_interval, tx.clone()));

    let mut reader = ControlReader::new(reader);
    let outcome = loop {
        match reader.recv::<ParentMessage>().await {
            Ok(Some(ParentMessage::Shutdown)) => {
                info!("parent requested shutdown");
                break Ok(());
            }
            Ok(Some(request)) => {
                if let Some(answer) = answer(&executor, &request) {
                    let _ = tx.send(answer);
                }
            }
            Ok(None) => {
                info!("parent closed the control channel");
                break Ok(());
            }
            Err(err) => break Err(err),
        }
    };

    reporter.abort();
    drop(tx);
    if let Err(err) = writer_task.await {
        debug!(error = %err, "control writer ended abnormally");
    }
    outcome
}

fn answer<D: Database>(executor: &QueryExecutor<D>, request: &ParentMessage) -> Option<WorkerMessage> {
    match request {
        ParentMessage::FetchConcurrentQuery => Some(WorkerMessage::ConcurrentQuery {
            value: executor.concurrent(),
        }),
        ParentMessage::CountRequest => Some(WorkerMessage::RequestRate {
            count: executor.request_rate(),
        }),
        ParentMessage::FetchQueryTime => Some(WorkerMessage::QueryTime {
            time_ms: executor.average_query_time(),
        }),
        ParentMessage::Shutdown => None,
    }
}

async fn report_loop<D: Database>(
    executor: QueryExecutor<D>,
    report_interval: Duration,
    tx: mpsc::UnboundedSender<WorkerMessage>,
) {
    let mut ticker = interval_at(Instant::now() + report_interval, report_interval);
    ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
    loop {
        ticker.tick().await;
        let message = match LatencyReport::classify(executor.average_query_time()) {
            LatencyReport::Slow(time_ms) => {
                warn!(time_ms, "average query time above threshold");
                WorkerMessage::SlowReport { time_ms }
            }
            LatencyReport::Normal(time_ms) => WorkerMessage::QueryTimeUpdate { time_ms },
        };
        if tx.send(message).is_err() {
            return;
        }
    }
}

async fn write_control<W: AsyncWrite + Unpin>(
    mut writer: ControlWriter<W>,
    mut rx: mpsc::UnboundedReceiver<WorkerMessage>,
) {
    while let Some(message) = rx.recv().await {
        if let Err(err) = writer.send(&message).await {
            warn!(error = %err, "failed to write control message");
            return;
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::Value;
    use shoal_db::{BatchQuery, DbError, Page, QueryOptions, ResultSet};

    struct IdleDb;

    impl Database for IdleDb {
        async fn execute(&self, _: String, _: Vec<Value>, _: QueryOptions) -> Result<ResultSet, DbError> {
            Ok(ResultSet::default())
        }

        async fn batch(&self, _: Vec<BatchQuery>, _: QueryOptions) -> Result<ResultSet, DbError> {
            Ok(ResultSet::default())
        }

        async fn page(&self, _: String, _: Vec<Value>, _: QueryOptions) -> Result<Page, DbError> {
            Ok(Page::default())
        }
    }

    #[tokio::test]
    async fn answers_requests_and_reports_until_eof() {
        let executor = QueryExecutor::new(IdleDb, 4);
        executor.record_request();
        let (parent_out, worker_in) = tokio::io::duplex(4096);
        let (worker_out, parent_in) = tokio::io::duplex(4096);
        let control = tokio::spawn(run_control(
            executor,
            "7".to_string(),
            worker_in,
            worker_out,
            Duration::from_millis(30),
        ));

        let mut to_worker = ControlWriter::new(parent_out);
        let mut from_worker = ControlReader::new(parent_in);
        assert_eq!(
            from_worker.recv::<WorkerMessage>().await.expect("ready"),
            Some(WorkerMessage::Ready { server_id: "7".into() })
        );

        to_worker.send(&ParentMessage::FetchConcurrentQuery).await.expect("send");
        to_worker.send(&ParentMessage::CountRequest).await.expect("send");
        let mut seen = Vec::new();
        while seen.len() < 3 {
            match from_worker.recv::<WorkerMessage>().await.expect("recv") {
                Some(message) => seen.push(message),
                None => panic!("worker hung up early"),
            }
        }
        assert!(seen.contains(&WorkerMessage::ConcurrentQuery { value: 0 }));
        assert!(seen.contains(&WorkerMessage::RequestRate { count: 0.1 }));
        assert!(seen.iter().any(|m| matches!(m, WorkerMessage::QueryTimeUpdate { .. })));

        drop(to_worker);
        control.await.expect("join").expect("clean exit");
    }

    #[tokio::test]
    async fn shutdown_request_ends_the_loop() {
        let (parent_out, worker_in) = tokio::io::duplex(4096);
        let (worker_out, _parent_in) = tokio::io::duplex(4096);
        let mut to_worker = ControlWriter::new(parent_out);
        to_worker.send(&ParentMessage::Shutdown).await.expect("send");
        run_control(
            QueryExecutor::new(IdleDb, 1),
            "1".to_string(),
            worker_in,
            worker_out,
            Duration::from_secs(60),
        )
        .await
        .expect("clean exit");
    }
}
