//! Relays over a JSON-lines change log with file checkpoints, including the
//! configuration entry point.
use std::{
    collections::BTreeMap,
    io::Write,
    path::Path,
    sync::Arc,
    time::{Duration, Instant},
};

use serde_json::json;
use tokio::time::sleep;
use walrelay::{
    checkpoint::{file::FileCheckpointStore, CheckpointStore},
    codec::Codec,
    event::{Sequence, SourceId},
    relay::{supervisor_from_settings, Relay, RelayOptions, SnapshotMode, Supervisor},
    retry::Backoff,
    settings::Settings,
    sink::{memory::MemorySink, DeleteMode},
    source::file::FileLog,
    status::{RelayState, RelayStatus, StatusBoard},
    transport::{memory::MemoryTransport, Transport},
};

fn orders() -> SourceId {
    SourceId::new("shop", "public", "orders")
}

fn line(seq: u64, op: &str, id: i64, total: Option<f64>) -> String {
    let after = total.map(|t| json!({ "id": id, "total": t }));
    json!({
        "sequence": seq,
        "op": op,
        "before": { "id": id },
        "after": after,
        "ts_ms": 1_700_000_000_000i64 + seq as i64,
    })
    .to_string()
}

fn append_lines(path: &Path, lines: &[String]) {
    let mut file = std::fs::OpenOptions::new()
        .create(true)
        .append(true)
        .open(path)
        .unwrap();
    for l in lines {
        writeln!(file, "{l}").unwrap();
    }
}

fn totals(sink: &MemorySink) -> BTreeMap<String, f64> {
    sink.visible(&orders())
        .into_iter()
        .map(|(k, img)| (k.to_string(), img["total"].as_f64().unwrap_or_default()))
        .collect()
}

async fn eventually(what: &str, mut check: impl FnMut() -> bool) {
    let deadline = Instant::now() + Duration::from_secs(10);
    while !check() {
        assert!(Instant::now() < deadline, "timed out waiting for {what}");
        sleep(Duration::from_millis(10)).await;
    }
}

async fn wait_status(
    board: &StatusBoard,
    relay: &str,
    what: &str,
    check: impl Fn(&RelayStatus) -> bool,
) -> RelayStatus {
    let deadline = Instant::now() + Duration::from_secs(10);
    loop {
        if let Some(status) = board.get(relay).await {
            if check(&status) {
                return status;
            }
        }
        assert!(Instant::now() < deadline, "timed out waiting for {what}");
        sleep(Duration::from_millis(10)).await;
    }
}

struct Pipeline {
    log_path: std::path::PathBuf,
    state: std::path::PathBuf,
    transport: Arc<MemoryTransport>,
    sink: Arc<MemorySink>,
}

impl Pipeline {
    async fn supervisor(&self, snapshot_mode: SnapshotMode) -> Supervisor {
        let checkpoints = FileCheckpointStore::new(&self.state).await.unwrap();
        let relay = Relay::new(
            "orders",
            orders(),
            Arc::new(FileLog::new(&self.log_path, vec![String::from("id")])),
            self.transport.clone(),
            self.sink.clone(),
        )
        .with_options(RelayOptions {
            snapshot_mode,
            batch_size: 50,
            batch_timeout: Duration::from_millis(20),
            poll_interval: Duration::from_millis(10),
            retry: Backoff {
                initial: Duration::from_millis(5),
                max: Duration::from_millis(50),
                multiplier: 2.0,
                max_attempts: None,
            },
            ..RelayOptions::default()
        });
        let mut supervisor = Supervisor::new(Arc::new(checkpoints), StatusBoard::new());
        supervisor.register(relay).await.unwrap();
        supervisor.start("orders").await.unwrap();
        supervisor
    }

    async fn settled(&self, supervisor: &Supervisor, last: u64) {
        let board = supervisor.status_board();
        wait_status(board, "orders", "reader to catch up", |s| {
            s.reader_position == Some(Sequence(last))
        })
        .await;
        for p in 0..self.transport.partitions() {
            let end = self.transport.high_watermark(p).await.unwrap();
            wait_status(board, "orders", "lanes to catch up", |s| {
                end == 0 || s.lanes.get(&p).and_then(|l| l.cursor).is_some_and(|c| c >= end)
            })
            .await;
        }
    }
}

fn pipeline(dir: &Path) -> Pipeline {
    Pipeline {
        log_path: dir.join("orders.jsonl"),
        state: dir.join("checkpoints"),
        transport: Arc::new(MemoryTransport::new(2, Codec::Json)),
        sink: Arc::new(MemorySink::new(DeleteMode::Tombstone)),
    }
}

#[tokio::test]
async fn restart_resumes_from_file_checkpoint() {
    let dir = tempfile::tempdir().unwrap();
    let p = pipeline(dir.path());
    append_lines(
        &p.log_path,
        &[
            line(1, "c", 1, Some(10.0)),
            line(2, "c", 2, Some(20.0)),
            line(3, "u", 1, Some(11.5)),
        ],
    );

    let mut supervisor = p.supervisor(SnapshotMode::Initial).await;
    p.settled(&supervisor, 3).await;
    supervisor.shutdown().await;
    let want = BTreeMap::from([(String::from("1"), 11.5), (String::from("2"), 20.0)]);
    assert_eq!(totals(&p.sink), want);
    let published = p.transport.len();

    let store = FileCheckpointStore::new(&p.state).await.unwrap();
    assert_eq!(store.load(&orders()).await.unwrap(), Some(Sequence(3)));

    append_lines(&p.log_path, &[line(4, "d", 2, None), line(5, "c", 3, Some(30.0))]);
    let mut supervisor = p.supervisor(SnapshotMode::Initial).await;
    let want = BTreeMap::from([(String::from("1"), 11.5), (String::from("3"), 30.0)]);
    eventually("new entries after restart", || totals(&p.sink) == want).await;
    p.settled(&supervisor, 5).await;
    supervisor.shutdown().await;

    // resumed from the checkpoint, no second snapshot
    assert_eq!(p.transport.len(), published + 2);
    assert_eq!(store.load(&orders()).await.unwrap(), Some(Sequence(5)));
}

#[tokio::test]
async fn purged_file_without_checkpoint_halts() {
    let dir = tempfile::tempdir().unwrap();
    let p = pipeline(dir.path());
    append_lines(
        &p.log_path,
        &[
            json!({ "purged_through": 2 }).to_string(),
            line(3, "u", 1, Some(12.0)),
        ],
    );
    let mut supervisor = p.supervisor(SnapshotMode::Initial).await;
    let status = wait_status(supervisor.status_board(), "orders", "reader to halt", |s| {
        s.state == RelayState::Halted
    })
    .await;
    assert!(status.last_error.unwrap().contains("purged through 2"));
    assert!(p.transport.is_empty());
    supervisor.shutdown().await;
}

#[tokio::test]
async fn configured_relays_persist_status_and_checkpoints() {
    let dir = tempfile::tempdir().unwrap();
    let log_path = dir.path().join("users.jsonl");
    let state_dir = dir.path().join("state");
    std::fs::write(
        &log_path,
        format!(
            "{}\n{}\n",
            line(1, "c", 1, Some(1.0)),
            line(2, "c", 2, Some(2.0))
        ),
    )
    .unwrap();

    let cfg = dir.path().join("walrelay.toml");
    std::fs::write(
        &cfg,
        format!(
            r#"
            state_dir = "{state}"
            [relays.users]
            database = "inventory"
            table = "users"
            log_path = "{log}"
            transport = "memory"
            sink = "memory"
            partitions = 2
            batch_timeout_seconds = 1
            "#,
            state = state_dir.display(),
            log = log_path.display(),
        ),
    )
    .unwrap();
    let settings = Settings::new(cfg.to_str().unwrap()).unwrap();

    let mut supervisor = supervisor_from_settings(&settings).await.unwrap();
    assert_eq!(supervisor.relays().collect::<Vec<_>>(), vec!["users"]);
    supervisor.start_all().await.unwrap();
    let source = SourceId::new("inventory", "public", "users");
    let checkpoints = FileCheckpointStore::new(state_dir.join("checkpoints"))
        .await
        .unwrap();
    let deadline = Instant::now() + Duration::from_secs(10);
    while checkpoints.load(&source).await.unwrap() != Some(Sequence(2)) {
        assert!(Instant::now() < deadline, "timed out waiting for checkpoint");
        sleep(Duration::from_millis(20)).await;
    }
    wait_status(supervisor.status_board(), "users", "reader position", |s| {
        s.reader_position == Some(Sequence(2))
    })
    .await;
    supervisor.shutdown().await;

    let persisted = StatusBoard::load(state_dir.join("status.json")).await.unwrap();
    let users = &persisted["users"];
    assert_eq!(users.source_id, source);
    assert_eq!(users.state, RelayState::Stopped);
    assert_eq!(users.reader_position, Some(Sequence(2)));
}

#[tokio::test]
async fn unreadable_line_halts_after_the_entries_before_it() {
    let dir = tempfile::tempdir().unwrap();
    let p = pipeline(dir.path());
    append_lines(
        &p.log_path,
        &[
            line(1, "c", 1, Some(10.0)),
            json!({ "sequence": 2, "op": "c", "after": { "id": 2, "total": 20.0 } }).to_string(),
            line(3, "c", 3, Some(30.0)),
        ],
    );
    let mut supervisor = p.supervisor(SnapshotMode::Never).await;
    let status = wait_status(supervisor.status_board(), "orders", "reader to halt", |s| {
        s.state == RelayState::Halted
    })
    .await;
    let error = status.last_error.unwrap();
    assert!(error.contains("unreadable entry"), "{error}");
    assert!(error.contains("ts_ms"), "{error}");
    assert_eq!(status.reader_position, Some(Sequence(1)));
    let want = BTreeMap::from([(String::from("1"), 10.0)]);
    eventually("the entry before the bad line", || totals(&p.sink) == want).await;
    assert_eq!(p.transport.len(), 1);
    supervisor.shutdown().await;
}

#[tokio::test]
async fn second_process_on_the_same_state_dir_is_locked_out() {
    let dir = tempfile::tempdir().unwrap();
    let log_path = dir.path().join("users.jsonl");
    let state_dir = dir.path().join("state");
    append_lines(&log_path, &[line(1, "c", 1, Some(1.0))]);
    let cfg = dir.path().join("walrelay.toml");
    std::fs::write(
        &cfg,
        format!(
            r#"
            state_dir = "{state}"
            [relays.users]
            database = "inventory"
            table = "users"
            log_path = "{log}"
            transport = "memory"
            sink = "memory"
            batch_timeout_seconds = 1
            "#,
            state = state_dir.display(),
            log = log_path.display(),
        ),
    )
    .unwrap();
    let settings = Settings::new(cfg.to_str().unwrap()).unwrap();

    let mut first = supervisor_from_settings(&settings).await.unwrap();
    first.start_all().await.unwrap();
    wait_status(first.status_board(), "users", "first reader position", |s| {
        s.reader_position == Some(Sequence(1))
    })
    .await;

    let mut second = supervisor_from_settings(&settings).await.unwrap();
    second.start_all().await.unwrap();
    let status = wait_status(second.status_board(), "users", "second reader to halt", |s| {
        s.state == RelayState::Halted
    })
    .await;
    assert!(status.last_error.unwrap().contains("already has an active reader"));

    first.shutdown().await;
    second.start("users").await.unwrap();
    wait_status(second.status_board(), "users", "second reader to take over", |s| {
        s.state == RelayState::Running
    })
    .await;
    second.shutdown().await;
}
