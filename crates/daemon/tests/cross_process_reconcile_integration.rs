// Integration test: a second writer (standing in for the CLI process) edits
// the index files; the daemon's reconcilers absorb the edits and subscribers
// see exactly the synthesized changes.

use std::sync::Arc;
use std::time::Duration;

use tokio::sync::mpsc;
use tokio::time::{sleep, timeout, Instant};
use workloop_common::event::ChangeOperation;
use workloop_common::protocol::notification::ChangeNotification;
use workloop_common::types::{AgentRole, AgentRoleDraft, AgentRolePatch, Work, WorkDraft};
use workloop_daemon::config::{DaemonConfig, ReconcileConfig};
use workloop_daemon::fanout::ChannelSink;
use workloop_daemon::runtime::Services;
use workloop_daemon::store::{DurableStore, WorkStore};

const EVENT_TIMEOUT: Duration = Duration::from_secs(5);

fn fast_config() -> DaemonConfig {
    DaemonConfig { reconcile: ReconcileConfig { debounce_ms: 30 }, ..DaemonConfig::default() }
}

async fn next(rx: &mut mpsc::Receiver<ChangeNotification>) -> ChangeNotification {
    timeout(EVENT_TIMEOUT, rx.recv())
        .await
        .expect("notification should arrive within 5s")
        .expect("channel should stay open")
}

async fn wait_until(mut condition: impl FnMut() -> bool) {
    let deadline = Instant::now() + EVENT_TIMEOUT;
    while !condition() {
        assert!(Instant::now() < deadline, "condition not met within 5s");
        sleep(Duration::from_millis(20)).await;
    }
}

#[tokio::test]
async fn external_create_update_delete_reach_subscribers() {
    let tmp = tempfile::tempdir().unwrap();
    let services = Services::open(&fast_config(), tmp.path()).unwrap();
    services.start_watching().await.unwrap();

    let (sink, mut rx) = ChannelSink::channel(16);
    let (sub_id, snapshot) = services.role_notifier.subscribe(Arc::new(sink));
    assert!(snapshot.is_empty());

    // Give the OS watch a moment to arm before writing.
    sleep(Duration::from_millis(50)).await;
    let cli = DurableStore::<AgentRole>::open(tmp.path()).unwrap();

    let role = cli.create(AgentRoleDraft { name: "reviewer".into(), prompt: String::new() }).unwrap();
    let n = next(&mut rx).await;
    assert_eq!(n.id, sub_id);
    assert_eq!(n.operation, ChangeOperation::Create);
    assert_eq!(n.record.as_ref().unwrap()["name"], "reviewer");
    assert_eq!(services.roles.get(&role.id), Some(role.clone()));

    cli.update(&role.id, AgentRolePatch { prompt: Some("Be terse.".into()), ..Default::default() })
        .unwrap();
    let n = next(&mut rx).await;
    assert_eq!(n.operation, ChangeOperation::Update);
    assert_eq!(n.record.as_ref().unwrap()["prompt"], "Be terse.");

    cli.delete(&role.id).unwrap();
    let n = next(&mut rx).await;
    assert_eq!(n.operation, ChangeOperation::Delete);
    assert_eq!(n.record_id.as_deref(), Some(role.id.as_str()));
    assert!(services.roles.list().is_empty());

    services.shutdown().await;
}

#[tokio::test]
async fn own_writes_are_not_echoed_by_the_reconciler() {
    let tmp = tempfile::tempdir().unwrap();
    let services = Services::open(&fast_config(), tmp.path()).unwrap();
    services.start_watching().await.unwrap();

    let (sink, mut rx) = ChannelSink::channel(16);
    services.work_notifier.subscribe(Arc::new(sink));
    sleep(Duration::from_millis(50)).await;

    services.works.create(WorkDraft { title: "local".into(), ..WorkDraft::default() }).unwrap();
    assert_eq!(next(&mut rx).await.operation, ChangeOperation::Create);

    // Let the watcher see our own rename and the debounce window pass.
    sleep(Duration::from_millis(300)).await;
    assert!(rx.try_recv().is_err(), "a local write must produce exactly one notification");

    services.shutdown().await;
}

#[tokio::test]
async fn burst_of_external_writes_converges() {
    let tmp = tempfile::tempdir().unwrap();
    let services = Services::open(&fast_config(), tmp.path()).unwrap();
    services.start_watching().await.unwrap();
    sleep(Duration::from_millis(50)).await;

    let cli = WorkStore::open(tmp.path()).unwrap();
    for i in 0..10 {
        cli.create(WorkDraft { title: format!("external {i}"), ..WorkDraft::default() }).unwrap();
    }

    let expected: Vec<Work> = cli.list();
    wait_until(|| services.works.list() == expected).await;

    services.shutdown().await;
}

#[tokio::test]
async fn stopped_reconciler_leaves_cache_alone() {
    let tmp = tempfile::tempdir().unwrap();
    let services = Services::open(&fast_config(), tmp.path()).unwrap();
    services.start_watching().await.unwrap();
    services.shutdown().await;

    let cli = DurableStore::<AgentRole>::open(tmp.path()).unwrap();
    cli.create(AgentRoleDraft { name: "late".into(), prompt: String::new() }).unwrap();

    sleep(Duration::from_millis(300)).await;
    assert!(services.roles.list().is_empty());

    // A fresh boot reads the truth from disk.
    let rebooted = Services::open(&fast_config(), tmp.path()).unwrap();
    assert_eq!(rebooted.roles.list().len(), 1);
}
