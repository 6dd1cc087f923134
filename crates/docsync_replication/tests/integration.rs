//! End-to-end tests of the synced store against an embedded remote.

use docsync_core::{
    body_from_value, CoreError, DocumentId, Filter, IndexDefinition, IndexError,
    ReplicatedDocument, Revision, StoreConfig,
};
use docsync_replication::{
    BulkDocsResponse, ChangesResponse, Direction, EmbeddedRemote, Endpoint, FailureCause, Fault,
    Remote, ReplicationConfig, SyncError, SyncEvent, SyncResult, SyncedStore,
};
use serde_json::json;
use std::collections::BTreeSet;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{broadcast, mpsc};
use tokio::time::timeout;

const WAIT: Duration = Duration::from_secs(10);

fn endpoint() -> Endpoint {
    Endpoint::new("memory://remote", "people")
}

fn synced(remote: &Arc<EmbeddedRemote>) -> SyncedStore {
    SyncedStore::builder()
        .in_memory()
        .endpoint(endpoint())
        .remote(Arc::clone(remote) as Arc<dyn Remote>)
        .build()
        .unwrap()
}

fn synced_with_unique_email(remote: &Arc<EmbeddedRemote>) -> SyncedStore {
    SyncedStore::builder()
        .in_memory()
        .index(IndexDefinition::new("by_email", ["email"]).unique())
        .endpoint(endpoint())
        .remote(Arc::clone(remote) as Arc<dyn Remote>)
        .build()
        .unwrap()
}

/// Serves pulls from the wrapped remote and drops every upload.
struct DownloadOnly(Arc<EmbeddedRemote>);

impl Remote for DownloadOnly {
    fn authenticate(&self, endpoint: &Endpoint) -> SyncResult<()> {
        self.0.authenticate(endpoint)
    }

    fn changes(&self, database: &str, since: u64, limit: usize) -> SyncResult<ChangesResponse> {
        self.0.changes(database, since, limit)
    }

    fn bulk_docs(
        &self,
        _database: &str,
        _documents: Vec<ReplicatedDocument>,
    ) -> SyncResult<BulkDocsResponse> {
        Err(SyncError::network("connection reset during upload"))
    }
}

fn seed(remote: &EmbeddedRemote, id: &str, body: serde_json::Value) {
    remote
        .database("people")
        .unwrap()
        .put(&DocumentId::new(id).unwrap(), body_from_value(body).unwrap())
        .unwrap();
}

async fn next_event(events: &mut broadcast::Receiver<SyncEvent>) -> SyncEvent {
    timeout(WAIT, events.recv())
        .await
        .expect("no event in time")
        .expect("event channel closed")
}

async fn wait_for_sync(events: &mut broadcast::Receiver<SyncEvent>) -> Vec<SyncEvent> {
    let mut seen = Vec::new();
    loop {
        let event = next_event(events).await;
        let done = matches!(
            event,
            SyncEvent::SyncCompleted(_) | SyncEvent::ReplicationFailed { .. }
        );
        seen.push(event);
        if done {
            return seen;
        }
    }
}

#[tokio::test(flavor = "multi_thread")]
async fn save_then_fetch_returns_body() {
    let store = synced(&Arc::new(EmbeddedRemote::in_memory()));

    let saved = store.save_value(json!({"name": "Ada"})).unwrap();
    let fetched = store.fetch(saved.id.as_str()).unwrap();

    assert_eq!(fetched.body, body_from_value(json!({"name": "Ada"})).unwrap());
    assert_eq!(fetched.revision, saved.revision);
}

#[tokio::test(flavor = "multi_thread")]
async fn second_save_wins() {
    let store = synced(&Arc::new(EmbeddedRemote::in_memory()));

    store.save_value(json!({"_id": "ada", "v": 1})).unwrap();
    store.save_value(json!({"_id": "ada", "v": 2})).unwrap();

    let doc = store.fetch("ada").unwrap();
    assert_eq!(doc.body["v"], 2);
    assert_eq!(store.query_json(&json!({})).unwrap().len(), 1);
}

#[tokio::test(flavor = "multi_thread")]
async fn query_sees_saves_immediately_in_id_order() {
    let store = synced(&Arc::new(EmbeddedRemote::in_memory()));
    store.ensure_indexed(["team"], "by_team").unwrap();

    for id in ["c", "a", "b"] {
        store
            .save_value(json!({"_id": id, "team": "blue"}))
            .unwrap();
    }

    let all = store.query_json(&json!({})).unwrap();
    let ids: Vec<_> = all.iter().map(|d| d.id.as_str()).collect();
    assert_eq!(ids, ["a", "b", "c"]);

    store.save_value(json!({"_id": "d", "team": "red"})).unwrap();
    let red = store
        .query(&Filter::new().equals("team", "red"))
        .unwrap();
    assert_eq!(red.len(), 1);
    assert_eq!(red[0].id.as_str(), "d");
}

#[tokio::test(flavor = "multi_thread")]
async fn fetch_unknown_id_is_not_found() {
    let store = synced(&Arc::new(EmbeddedRemote::in_memory()));
    let err = store.fetch("missing").unwrap_err();
    assert!(matches!(
        err,
        SyncError::Database(docsync_core::CoreError::NotFound { .. })
    ));
}

#[tokio::test(flavor = "multi_thread")]
async fn pull_indexes_before_completion() {
    let remote = Arc::new(EmbeddedRemote::in_memory());
    seed(&remote, "bob", json!({"name": "Bob"}));
    seed(&remote, "cy", json!({"name": "Cy"}));

    let store = synced(&remote);
    store.ensure_indexed(["name"], "by_name").unwrap();
    let mut events = store.subscribe();

    let (tx, mut rx) = mpsc::unbounded_channel();
    let view = store.clone();
    store
        .pull(move |summary| {
            let hits = view.query(&Filter::new().equals("name", "Bob")).unwrap();
            tx.send((summary.documents_written, hits.len())).unwrap();
        })
        .unwrap();

    let (written, hits) = timeout(WAIT, rx.recv()).await.unwrap().unwrap();
    assert_eq!(written, 2);
    assert_eq!(hits, 1);
    assert!(matches!(
        next_event(&mut events).await,
        SyncEvent::PullCompleted { .. }
    ));
    assert_eq!(store.stats().documents_pulled, 2);
}

#[tokio::test(flavor = "multi_thread")]
async fn second_pull_while_running_is_busy() {
    let remote = Arc::new(EmbeddedRemote::in_memory());
    remote.set_latency(Duration::from_millis(200));
    let store = synced(&remote);
    let mut events = store.subscribe();

    let (tx, mut rx) = mpsc::unbounded_channel();
    store.pull(move |_| tx.send(()).unwrap()).unwrap();

    let err = store.pull(|_| panic!("rejected pull must not complete")).unwrap_err();
    assert!(matches!(
        err,
        SyncError::Busy {
            direction: Direction::Pull
        }
    ));
    assert!(store.coordinator().is_busy(Direction::Pull));

    timeout(WAIT, rx.recv()).await.unwrap().unwrap();
    assert!(matches!(
        next_event(&mut events).await,
        SyncEvent::PullCompleted { .. }
    ));
    assert_eq!(remote.stats().authentications, 1);

    // The direction is free again once the first pull has been reported.
    remote.set_latency(Duration::ZERO);
    store.pull(|_| {}).unwrap();
    next_event(&mut events).await;
    assert_eq!(store.stats().pulls_completed, 2);
}

#[tokio::test(flavor = "multi_thread")]
async fn sync_reports_legs_in_order() {
    let remote = Arc::new(EmbeddedRemote::in_memory());
    seed(&remote, "bob", json!({"name": "Bob"}));
    let store = synced(&remote);
    store.save_value(json!({"_id": "ada", "name": "Ada"})).unwrap();
    let mut events = store.subscribe();

    let (tx, mut rx) = mpsc::unbounded_channel();
    store.sync(move |summary| tx.send(summary.clone()).unwrap()).unwrap();

    let seen = wait_for_sync(&mut events).await;
    assert_eq!(seen.len(), 3, "{seen:?}");
    assert!(matches!(seen[0], SyncEvent::PullCompleted { .. }));
    assert!(matches!(seen[1], SyncEvent::PushCompleted { .. }));
    assert!(matches!(seen[2], SyncEvent::SyncCompleted(_)));

    let summary = timeout(WAIT, rx.recv()).await.unwrap().unwrap();
    assert_eq!(summary.pulled.documents_written, 1);
    // Ada and the pulled Bob are both local changes the remote now holds.
    assert_eq!(summary.pushed.documents_read, 2);
    assert_eq!(summary.pushed.documents_written, 1);

    let people = remote.database("people").unwrap();
    assert!(people.contains(&DocumentId::new("ada").unwrap()));
    let stats = store.stats();
    assert_eq!(stats.syncs_completed, 1);
    assert!(stats.last_sync.is_some());
}

#[tokio::test(flavor = "multi_thread")]
async fn sync_against_unreachable_remote_fails_once() {
    let remote = Arc::new(EmbeddedRemote::in_memory());
    remote.inject_fault(Some(Fault::Unreachable));
    let store = synced(&remote);
    store.save_value(json!({"name": "Ada"})).unwrap();
    let mut events = store.subscribe();

    let (tx, mut rx) = mpsc::unbounded_channel::<()>();
    store.sync(move |_| tx.send(()).unwrap()).unwrap();

    match next_event(&mut events).await {
        SyncEvent::ReplicationFailed {
            direction,
            composite,
            cause,
            ..
        } => {
            assert_eq!(direction, Direction::Pull);
            assert!(composite);
            assert_eq!(cause, FailureCause::Network);
        }
        other => panic!("unexpected event {other:?}"),
    }

    // The callback was dropped without running.
    assert!(timeout(WAIT, rx.recv()).await.unwrap().is_none());
    assert!(events.try_recv().is_err());
    assert_eq!(remote.stats().bulk_requests, 0);

    let stats = store.stats();
    assert_eq!(stats.failures, 1);
    assert_eq!(stats.syncs_completed, 0);
    assert!(stats.last_error.unwrap().contains("unreachable"));
    assert!(!store.coordinator().is_busy(Direction::Pull));
}

#[tokio::test(flavor = "multi_thread")]
async fn rejected_credentials_fail_with_auth_cause() {
    let remote = Arc::new(EmbeddedRemote::in_memory().with_credentials("key", "secret"));
    let store = SyncedStore::builder()
        .endpoint(endpoint().with_credentials("key", "wrong"))
        .remote(Arc::clone(&remote) as Arc<dyn Remote>)
        .build()
        .unwrap();
    let mut events = store.subscribe();

    store.push(|_| panic!("push must fail")).unwrap();

    assert!(matches!(
        next_event(&mut events).await,
        SyncEvent::ReplicationFailed {
            direction: Direction::Push,
            composite: false,
            cause: FailureCause::Auth,
            ..
        }
    ));
}

#[tokio::test(flavor = "multi_thread")]
async fn push_conflict_is_resolved_by_a_later_pull() {
    let remote = Arc::new(EmbeddedRemote::in_memory());
    seed(&remote, "ada", json!({"v": "remote 1"}));
    seed(&remote, "ada", json!({"v": "remote 2"}));

    let store = synced(&remote);
    store.save_value(json!({"_id": "ada", "v": "local"})).unwrap();
    let mut events = store.subscribe();

    store.push(|_| panic!("push must conflict")).unwrap();
    match next_event(&mut events).await {
        SyncEvent::ReplicationFailed { cause, message, .. } => {
            assert_eq!(cause, FailureCause::Conflict);
            assert!(message.contains("ada"));
        }
        other => panic!("unexpected event {other:?}"),
    }

    store.pull(|_| {}).unwrap();
    assert!(matches!(
        next_event(&mut events).await,
        SyncEvent::PullCompleted { .. }
    ));
    assert_eq!(store.fetch("ada").unwrap().body["v"], "remote 2");
}

#[tokio::test(flavor = "multi_thread")]
async fn two_replicas_converge_through_the_remote() {
    let remote = Arc::new(EmbeddedRemote::in_memory());
    let phone = synced(&remote);
    let laptop = synced(&remote);

    phone.save_value(json!({"_id": "ada", "name": "Ada"})).unwrap();
    laptop.save_value(json!({"_id": "bob", "name": "Bob"})).unwrap();

    for replica in [&phone, &laptop, &phone] {
        let mut events = replica.subscribe();
        replica.sync(|_| {}).unwrap();
        let seen = wait_for_sync(&mut events).await;
        assert!(matches!(seen.last(), Some(SyncEvent::SyncCompleted(_))));
    }

    for replica in [&phone, &laptop] {
        let ids: Vec<_> = replica
            .query_json(&json!({}))
            .unwrap()
            .into_iter()
            .map(|d| d.id.to_string())
            .collect();
        assert_eq!(ids, ["ada", "bob"]);
    }
}

#[tokio::test(flavor = "multi_thread")]
async fn directory_store_survives_rebuild() {
    let temp = tempfile::tempdir().unwrap();
    let remote = Arc::new(EmbeddedRemote::in_memory());
    let build = || {
        SyncedStore::builder()
            .directory(temp.path().join("local"))
            .store_config(StoreConfig::default().sync_on_write(false))
            .index(IndexDefinition::new("by_name", ["name"]))
            .endpoint(endpoint())
            .remote(Arc::clone(&remote) as Arc<dyn Remote>)
            .build()
            .unwrap()
    };

    {
        let store = build();
        store.save_value(json!({"_id": "ada", "name": "Ada"})).unwrap();
        store.compact().unwrap();
    }

    let store = build();
    let hits = store
        .query(&Filter::new().equals("name", "Ada"))
        .unwrap();
    assert_eq!(hits.len(), 1);
    assert_eq!(store.index_stats().builds, 1);
}

#[tokio::test(flavor = "multi_thread")]
async fn builder_rejects_incomplete_configuration() {
    let remote: Arc<dyn Remote> = Arc::new(EmbeddedRemote::in_memory());

    let missing_endpoint = SyncedStore::builder().remote(Arc::clone(&remote)).build();
    assert!(matches!(missing_endpoint, Err(SyncError::Configuration(_))));

    let missing_remote = SyncedStore::builder().endpoint(endpoint()).build();
    assert!(matches!(missing_remote, Err(SyncError::Configuration(_))));

    let bad_endpoint = SyncedStore::builder()
        .endpoint(Endpoint::new("https://db.example.com", "people"))
        .remote(remote)
        .build();
    assert!(matches!(bad_endpoint, Err(SyncError::Configuration(_))));
}

#[test]
fn builder_requires_a_runtime() {
    let result = SyncedStore::builder()
        .endpoint(endpoint())
        .remote(Arc::new(EmbeddedRemote::in_memory()))
        .build();
    assert!(matches!(result, Err(SyncError::Configuration(_))));
}

#[tokio::test(flavor = "multi_thread")]
async fn duplicate_unique_key_is_refused_without_writing() {
    let store = synced_with_unique_email(&Arc::new(EmbeddedRemote::in_memory()));

    store.save_value(json!({"email": "a@x"})).unwrap();
    let err = store.save_value(json!({"email": "a@x"})).unwrap_err();
    assert!(
        matches!(
            err,
            SyncError::Database(CoreError::Index(IndexError::UniqueViolation { .. }))
        ),
        "{err}"
    );
    assert_eq!(store.store().len(), 1);
    assert_eq!(store.store().last_sequence(), 1);

    let bob = store
        .save_value(json!({"_id": "bob", "email": "b@x"}))
        .unwrap();
    assert_eq!(bob.id.as_str(), "bob");
    assert_eq!(store.query_json(&json!({})).unwrap().len(), 2);

    let hits = store
        .query(&Filter::new().equals("email", "b@x"))
        .unwrap();
    assert_eq!(hits.len(), 1);
    assert_eq!(hits[0].id.as_str(), "bob");
}

#[tokio::test(flavor = "multi_thread")]
async fn pulled_duplicate_of_a_unique_key_fails_the_pull() {
    let remote = Arc::new(EmbeddedRemote::in_memory());
    seed(&remote, "other-ada", json!({"email": "ada@x"}));
    let store = synced_with_unique_email(&remote);
    store
        .save_value(json!({"_id": "ada", "email": "ada@x"}))
        .unwrap();
    let mut events = store.subscribe();

    store.pull(|_| panic!("pull must fail")).unwrap();
    match next_event(&mut events).await {
        SyncEvent::ReplicationFailed {
            direction, cause, ..
        } => {
            assert_eq!(direction, Direction::Pull);
            assert_eq!(cause, FailureCause::Index);
        }
        other => panic!("unexpected event {other:?}"),
    }
    assert!(!store
        .store()
        .contains(&DocumentId::new("other-ada").unwrap()));

    store
        .save_value(json!({"_id": "bob", "email": "bob@x"}))
        .unwrap();
    let ids: Vec<_> = store
        .query_json(&json!({}))
        .unwrap()
        .into_iter()
        .map(|d| d.id.to_string())
        .collect();
    assert_eq!(ids, ["ada", "bob"]);
}

#[tokio::test(flavor = "multi_thread")]
async fn sync_with_failing_push_leg_reports_one_failure() {
    let remote = Arc::new(EmbeddedRemote::in_memory());
    seed(&remote, "bob", json!({"name": "Bob"}));
    let store = SyncedStore::builder()
        .in_memory()
        .endpoint(endpoint())
        .remote(Arc::new(DownloadOnly(Arc::clone(&remote))) as Arc<dyn Remote>)
        .build()
        .unwrap();
    store.save_value(json!({"_id": "ada", "name": "Ada"})).unwrap();
    let mut events = store.subscribe();

    let (tx, mut rx) = mpsc::unbounded_channel::<()>();
    store.sync(move |_| tx.send(()).unwrap()).unwrap();

    let seen = wait_for_sync(&mut events).await;
    assert_eq!(seen.len(), 2, "{seen:?}");
    assert!(matches!(seen[0], SyncEvent::PullCompleted { .. }));
    match &seen[1] {
        SyncEvent::ReplicationFailed {
            direction,
            composite,
            cause,
            message,
        } => {
            assert_eq!(*direction, Direction::Push);
            assert!(*composite);
            assert_eq!(*cause, FailureCause::Network);
            assert!(message.contains("upload"));
        }
        other => panic!("unexpected event {other:?}"),
    }

    // The callback was dropped without running and nothing else followed.
    assert!(timeout(WAIT, rx.recv()).await.unwrap().is_none());
    assert!(events.try_recv().is_err());

    // The pull leg's writes stay.
    assert_eq!(store.fetch("bob").unwrap().body["name"], "Bob");
    let stats = store.stats();
    assert_eq!(stats.pulls_completed, 1);
    assert_eq!(stats.pushes_completed, 0);
    assert_eq!(stats.syncs_completed, 0);
    assert_eq!(stats.failures, 1);
    assert!(stats.last_sync.is_none());
    assert!(!store.coordinator().is_busy(Direction::Push));
}

#[tokio::test(flavor = "multi_thread")]
async fn saves_during_a_slow_pull_keep_one_consistent_revision_per_id() {
    let remote = Arc::new(EmbeddedRemote::in_memory());
    let shared_ids: Vec<String> = (0..6).map(|i| format!("doc{i}")).collect();
    for id in &shared_ids {
        for edit in 0..3 {
            seed(&remote, id, json!({"by": "remote", "edit": edit}));
        }
    }
    for i in 0..4 {
        seed(&remote, &format!("remote{i}"), json!({"by": "remote"}));
    }

    let store = SyncedStore::builder()
        .in_memory()
        .replication_config(ReplicationConfig::new().with_pull_batch_size(2))
        .endpoint(endpoint())
        .remote(Arc::clone(&remote) as Arc<dyn Remote>)
        .build()
        .unwrap();
    let mut events = store.subscribe();
    remote.set_latency(Duration::from_millis(15));

    store.pull(|_| {}).unwrap();

    let writer = store.clone();
    let ids = shared_ids.clone();
    let saves = tokio::task::spawn_blocking(move || {
        for round in 0..5 {
            for id in ids.iter().map(String::as_str).chain(["local0", "local1"]) {
                writer
                    .save_value(json!({"_id": id, "by": "local", "round": round}))
                    .unwrap();
                std::thread::sleep(Duration::from_millis(3));
            }
        }
    });

    match next_event(&mut events).await {
        SyncEvent::PullCompleted { .. } => {}
        other => panic!("unexpected event {other:?}"),
    }
    saves.await.unwrap();

    let snapshot = store.store().snapshot();
    let expected: BTreeSet<String> = shared_ids
        .iter()
        .cloned()
        .chain((0..4).map(|i| format!("remote{i}")))
        .chain(["local0".to_string(), "local1".to_string()])
        .collect();
    let stored: BTreeSet<String> = snapshot
        .documents
        .iter()
        .map(|d| d.id.to_string())
        .collect();
    assert_eq!(stored, expected);

    for document in &snapshot.documents {
        let replicated = store.store().replicated(&document.id).unwrap();
        assert_eq!(&replicated.document, document);

        // The revision was derived from its parent and this exact body.
        assert_eq!(
            Revision::next(replicated.ancestors.first(), &document.body),
            document.revision,
            "{}",
            document.id
        );
        let generation = document.revision.generation();
        for (depth, ancestor) in replicated.ancestors.iter().enumerate() {
            assert_eq!(ancestor.generation(), generation - 1 - depth as u64);
        }
    }

    // Each id appears once in the change feed.
    let feed = store.store().changes_since(0, usize::MAX);
    assert_eq!(feed.changes.len(), snapshot.documents.len());
    assert!(!feed.pending);

    store.indexes().update_all_indexes().unwrap();
    assert_eq!(store.query_json(&json!({})).unwrap(), snapshot.documents);
}
