#![cfg(feature = "sqlite")]

use serde_json::json;
use shoal_ipc::control::{ControlReader, ControlWriter, ParentMessage, WorkerMessage};
use shoal_ipc::{ChannelClient, ClientOptions, ErrorCode};
use shoal_worker::{WorkerConfig, open_database, run_worker};
use std::time::Duration;
use tempfile::TempDir;

fn config(dir: &TempDir) -> WorkerConfig {
    WorkerConfig {
        server_id: "1".to_string(),
        keyspace: dir.path().join("worker.db").display().to_string(),
        socket_dir: dir.path().to_path_buf(),
        db_connections: 2,
        max_concurrent_query: 4,
        report_interval: Duration::from_secs(60),
        ..WorkerConfig::default()
    }
}

#[tokio::test]
async fn worker_serves_methods_until_shutdown() {
    let dir = TempDir::new().expect("tempdir");
    let config = config(&dir);
    let db = open_database(&config).await.expect("open database");

    let (parent_out, worker_in) = tokio::io::duplex(4096);
    let (worker_out, parent_in) = tokio::io::duplex(4096);
    let worker = tokio::spawn({
        let config = config.clone();
        async move { run_worker(&config, db, worker_in, worker_out).await }
    });

    let mut to_worker = ControlWriter::new(parent_out);
    let mut from_worker = ControlReader::new(parent_in);
    assert_eq!(
        from_worker.recv::<WorkerMessage>().await.expect("ready"),
        Some(WorkerMessage::Ready { server_id: "1".into() })
    );

    let client = ChannelClient::connect(
        ClientOptions::local("1", dir.path()).with_retry_interval(Duration::from_millis(20)),
    );
    client.connected().await.expect("connected");

    client
        .call("execute", vec![json!("CREATE TABLE reef (name TEXT)")])
        .await
        .expect("create");
    let batch = client
        .call(
            "batch",
            vec![json!([
                {"query": "INSERT INTO reef VALUES (?)", "params": ["coral"]},
                {"query": "INSERT INTO reef VALUES (?)", "params": ["kelp"]},
                {"query": "INSERT INTO reef VALUES (?)", "params": ["sponge"]}
            ])],
        )
        .await
        .expect("batch");
    assert_eq!(batch["rowsAffected"], json!(3));

    let page = client
        .call(
            "getPage",
            vec![json!("SELECT name FROM reef ORDER BY name"), json!([]), json!({"fetchSize": 2})],
        )
        .await
        .expect("page");
    assert_eq!(page["hasNext"], json!(true));
    assert_eq!(page["rows"], json!([{"name": "coral"}, {"name": "kelp"}]));

    let err = client.call("execute", vec![json!(42)]).await.expect_err("bad params");
    assert_eq!(err.remote_code(), Some(ErrorCode::InvalidParams));
    let err = client
        .call("execute", vec![json!("SELECT * FROM missing")])
        .await
        .expect_err("db error");
    assert_eq!(err.remote_code(), Some(ErrorCode::Database));

    let concurrent = client.call_method("getConcurrent", vec![]).await.expect("concurrent");
    assert_eq!(concurrent.result, Some(json!(0)));

    to_worker.send(&ParentMessage::CountRequest).await.expect("send");
    match from_worker.recv::<WorkerMessage>().await.expect("rate") {
        Some(WorkerMessage::RequestRate { count }) => assert!(count > 0.0),
        other => panic!("unexpected control message: {other:?}"),
    }

    to_worker.send(&ParentMessage::Shutdown).await.expect("send");
    worker.await.expect("join").expect("worker exit");
    client.disconnected().await;
    assert!(!dir.path().join("shoal.1.sock").exists());
}
