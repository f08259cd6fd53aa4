use std::path::Path;
use std::sync::Arc;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::time::Duration;

use serde_json::json;
use visitsync_client::gateway::RemoteMethod;
use visitsync_client::{
    ConnectivityMonitor, Database, DrainOutcome, InMemoryRemote, OperationStatus, RemoteGateway, SkipReason,
    SyncContext, SyncSummary,
};
use visitsync_core::{EntityKind, Record, RecordId};

struct App {
    ctx: SyncContext,
    remote: Arc<InMemoryRemote>,
    monitor: Arc<ConnectivityMonitor>,
}

impl App {
    async fn with_db(db: Database, remote: Arc<InMemoryRemote>, online: bool) -> Self {
        let monitor = ConnectivityMonitor::new(online, Duration::from_secs(1));
        let ctx = SyncContext::from_parts(db, remote.clone(), monitor.clone(), None, Duration::from_secs(60))
            .await
            .unwrap();
        Self { ctx, remote, monitor }
    }

    async fn offline() -> Self {
        Self::with_db(Database::in_memory().await.unwrap(), Arc::new(InMemoryRemote::new()), false).await
    }

    async fn drain(&self) -> SyncSummary {
        match self.ctx.orchestrator().drain().await {
            DrainOutcome::Completed(summary) => summary,
            other => panic!("expected a completed drain, got {other:?}"),
        }
    }

    async fn local(&self, kind: EntityKind) -> Vec<Record> {
        self.ctx
            .store()
            .get_all(kind)
            .await
            .unwrap()
            .into_iter()
            .map(|t| t.into_inner())
            .collect()
    }
}

#[tokio::test]
async fn product_created_offline_ends_up_once_under_its_server_id() {
    let app = App::offline().await;

    let created = app
        .ctx
        .facade()
        .create(EntityKind::Product, json!({"name": "Agua 1L", "basePrice": 12}))
        .await
        .unwrap();
    let temp = created.value().uuid.clone();
    assert!(temp.to_string().starts_with("temp-"));

    let before = app.ctx.facade().get_all(EntityKind::Product).await.unwrap();
    assert_eq!(before.len(), 1);
    assert!(before[0].is_pending());
    assert_eq!(before[0].value().uuid, temp);

    app.monitor.set_online(true);
    let summary = app.drain().await;
    assert_eq!(summary.synced, 1);

    let after = app.local(EntityKind::Product).await;
    assert_eq!(after.len(), 1);
    assert!(!after[0].uuid.is_temporary());
    assert_eq!(after[0].field("basePrice"), Some(&json!(12)));
    assert!(app.ctx.store().get(EntityKind::Product, &temp).await.unwrap().is_none());

    let listed = app.ctx.facade().get_all(EntityKind::Product).await.unwrap();
    assert_eq!(listed.len(), 1);
    assert!(!listed[0].is_pending());
}

#[tokio::test]
async fn create_update_delete_offline_never_reaches_the_server() {
    let app = App::offline().await;
    let facade = app.ctx.facade();

    let created = facade.create(EntityKind::Visit, json!({"photo": "data:image/png;base64,AAAA"})).await.unwrap();
    let id = created.value().uuid.clone();
    facade.update(EntityKind::Visit, &id, json!({"validation": true})).await.unwrap();
    facade.delete(EntityKind::Visit, &id).await.unwrap();

    app.monitor.set_online(true);
    app.drain().await;

    assert!(app.remote.calls().is_empty());
    assert!(app.remote.records(EntityKind::Visit).is_empty());
    assert!(app.local(EntityKind::Visit).await.is_empty());
    assert!(app.ctx.queue().list_all().await.unwrap().is_empty());
}

#[tokio::test]
async fn delete_behind_an_in_flight_create_removes_it_remotely() {
    let app = App::offline().await;
    let facade = app.ctx.facade();

    let created = facade.create(EntityKind::Product, json!({"name": "Agua", "basePrice": 12})).await.unwrap();
    let id = created.value().uuid.clone();
    facade.update(EntityKind::Product, &id, json!({"basePrice": 15})).await.unwrap();

    // The create is in flight when the user deletes.
    let create_op = created.pending_op().unwrap();
    app.ctx
        .queue()
        .mark_status(create_op, OperationStatus::Syncing)
        .await
        .unwrap();
    facade.delete(EntityKind::Product, &id).await.unwrap();
    app.ctx.queue().recover_interrupted().await.unwrap();

    app.monitor.set_online(true);
    let summary = app.drain().await;

    assert_eq!(summary.failed, 0);
    let methods: Vec<RemoteMethod> = app.remote.calls().into_iter().map(|c| c.method).collect();
    assert_eq!(methods, vec![RemoteMethod::Create, RemoteMethod::Delete]);
    assert!(app.remote.records(EntityKind::Product).is_empty());
    assert!(app.local(EntityKind::Product).await.is_empty());
}

#[tokio::test]
async fn update_then_delete_of_a_store_leaves_nothing_behind() {
    let remote = Arc::new(InMemoryRemote::new());
    let server_id = remote.insert(EntityKind::Store, json!({"name": "Old Name", "address": "Calle 1"}));
    let app = App::with_db(Database::in_memory().await.unwrap(), remote, true).await;
    let facade = app.ctx.facade();
    assert_eq!(facade.get_all(EntityKind::Store).await.unwrap().len(), 1);

    app.monitor.set_online(false);
    let id = RecordId::Confirmed(server_id);
    facade.update(EntityKind::Store, &id, json!({"name": "New Name"})).await.unwrap();
    facade.delete(EntityKind::Store, &id).await.unwrap();

    app.monitor.set_online(true);
    let summary = app.drain().await;

    assert_eq!(summary.synced, 2);
    let methods: Vec<RemoteMethod> = app
        .remote
        .calls()
        .into_iter()
        .map(|c| c.method)
        .filter(|m| *m != RemoteMethod::List)
        .collect();
    assert_eq!(methods, vec![RemoteMethod::Update, RemoteMethod::Delete]);
    assert!(app.remote.records(EntityKind::Store).is_empty());
    assert!(facade.get_all(EntityKind::Store).await.unwrap().is_empty());
}

#[tokio::test]
async fn records_gone_on_the_server_are_dropped_without_failing_the_drain() {
    let remote = Arc::new(InMemoryRemote::new());
    let kept = remote.insert(EntityKind::Store, json!({"name": "Uno"}));
    let vanished = remote.insert(EntityKind::Store, json!({"name": "Dos"}));
    let app = App::with_db(Database::in_memory().await.unwrap(), remote.clone(), true).await;
    let facade = app.ctx.facade();
    facade.get_all(EntityKind::Store).await.unwrap();

    app.monitor.set_online(false);
    facade
        .update(EntityKind::Store, &RecordId::Confirmed(vanished.clone()), json!({"name": "Dos bis"}))
        .await
        .unwrap();
    facade.delete(EntityKind::Store, &RecordId::Confirmed(kept.clone())).await.unwrap();
    remote.delete(EntityKind::Store, &vanished).await.unwrap();
    remote.delete(EntityKind::Store, &kept).await.unwrap();

    app.monitor.set_online(true);
    let summary = app.drain().await;

    assert_eq!(summary.total, 2);
    assert_eq!(summary.failed, 0);
    assert!(app.ctx.queue().list_all().await.unwrap().is_empty());
    assert!(app.local(EntityKind::Store).await.is_empty());
}

#[tokio::test]
async fn connectivity_loss_mid_drain_resumes_where_it_stopped() {
    let app = App::offline().await;
    let mut ops = Vec::new();
    for n in 1..=5 {
        let created = app
            .ctx
            .facade()
            .create(EntityKind::Product, json!({"name": format!("Producto {n}"), "basePrice": n}))
            .await
            .unwrap();
        ops.push(created.pending_op().unwrap());
    }

    let monitor = app.monitor.clone();
    let answered = Arc::new(AtomicUsize::new(0));
    let counter = answered.clone();
    app.remote.on_call(move |_| {
        if counter.fetch_add(1, Ordering::SeqCst) + 1 == 2 {
            monitor.set_online(false);
        }
    });

    app.monitor.set_online(true);
    let first = app.drain().await;

    assert!(first.aborted);
    assert_eq!(first.synced, 2);
    let queue = app.ctx.queue();
    assert!(queue.get(ops[0]).await.unwrap().is_none());
    assert!(queue.get(ops[1]).await.unwrap().is_none());
    for op in &ops[2..] {
        assert_eq!(queue.get(*op).await.unwrap().unwrap().status, OperationStatus::Pending);
    }

    app.monitor.set_online(true);
    let second = app.drain().await;

    assert_eq!(second.synced, 3);
    assert_eq!(app.remote.calls_of(RemoteMethod::Create).len(), 5);
    let names: Vec<_> = app
        .remote
        .records(EntityKind::Product)
        .into_iter()
        .map(|r| r.field("name").cloned().unwrap())
        .collect();
    assert_eq!(
        names,
        (1..=5).map(|n| json!(format!("Producto {n}"))).collect::<Vec<_>>()
    );
}

#[tokio::test]
async fn rapid_repeated_triggers_submit_each_operation_once() {
    let app = App::offline().await;
    for n in 0..3 {
        app.ctx
            .facade()
            .create(EntityKind::Store, json!({"name": format!("Tienda {n}")}))
            .await
            .unwrap();
    }
    app.remote.set_latency(Duration::from_millis(20));
    app.monitor.set_online(true);

    let orchestrator = app.ctx.orchestrator();
    let (a, b, c, d) = tokio::join!(
        orchestrator.drain(),
        orchestrator.drain(),
        orchestrator.drain(),
        orchestrator.drain()
    );

    let skipped = [&a, &b, &c, &d]
        .iter()
        .filter(|o| matches!(o, DrainOutcome::Skipped { reason: SkipReason::AlreadyDraining }))
        .count();
    assert_eq!(skipped, 3);
    assert_eq!(app.remote.calls_of(RemoteMethod::Create).len(), 3);
}

async fn open(path: &Path, remote: Arc<InMemoryRemote>) -> App {
    App::with_db(Database::open(path).await.unwrap(), remote, true).await
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn two_contexts_on_one_file_never_double_submit() {
    let dir = tempfile::tempdir().unwrap();
    let path = dir.path().join("visitsync.db");
    let remote = Arc::new(InMemoryRemote::new());

    let foreground = open(&path, remote.clone()).await;
    let background = open(&path, remote.clone()).await;

    foreground.monitor.set_online(false);
    for n in 0..4 {
        foreground
            .ctx
            .facade()
            .create(EntityKind::Product, json!({"name": format!("Producto {n}"), "basePrice": 10}))
            .await
            .unwrap();
    }
    foreground.monitor.set_online(true);
    remote.set_latency(Duration::from_millis(25));

    let (a, b) = tokio::join!(
        foreground.ctx.orchestrator().drain(),
        background.ctx.orchestrator().drain()
    );

    let synced: usize = [a, b]
        .into_iter()
        .map(|o| match o {
            DrainOutcome::Completed(s) => s.synced,
            DrainOutcome::Skipped { .. } => 0,
            DrainOutcome::Errored { message } => panic!("drain errored: {message}"),
        })
        .sum();
    assert_eq!(synced, 4);
    assert_eq!(remote.calls_of(RemoteMethod::Create).len(), 4);
    assert_eq!(foreground.local(EntityKind::Product).await.len(), 4);
    assert!(
        foreground
            .local(EntityKind::Product)
            .await
            .iter()
            .all(|r| !r.uuid.is_temporary())
    );

    foreground.ctx.shutdown().await;
    background.ctx.shutdown().await;
}

#[tokio::test]
async fn pending_records_survive_a_refresh() {
    let remote = Arc::new(InMemoryRemote::new());
    remote.insert(EntityKind::Product, json!({"name": "Servidor", "basePrice": 5}));
    let app = App::with_db(Database::in_memory().await.unwrap(), remote, false).await;

    app.ctx
        .facade()
        .create(EntityKind::Product, json!({"name": "Local", "basePrice": 7}))
        .await
        .unwrap();
    app.monitor.set_online(true);
    let listed = app.ctx.facade().get_all(EntityKind::Product).await.unwrap();

    assert_eq!(listed.len(), 2);
    assert_eq!(listed.iter().filter(|t| t.is_pending()).count(), 1);
}
