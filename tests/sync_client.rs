mod common;

use std::time::Duration;

use common::{client_for, eventually, fields, key, FakeBackend, Recorder};
use firestore_offline_sync::firestore::core::{FilterOperator, ListenOptions, Query};
use firestore_offline_sync::firestore::credentials::User;
use firestore_offline_sync::firestore::error::{permission_denied, FirestoreErrorCode};
use firestore_offline_sync::firestore::model::Mutation;
use firestore_offline_sync::firestore::value::FirestoreValue;
use firestore_offline_sync::firestore::FirestoreClient;

fn with_metadata() -> ListenOptions {
    ListenOptions {
        include_metadata_changes: true,
        ..ListenOptions::default()
    }
}

fn beverages() -> Query {
    Query::collection("beverages").unwrap()
}

async fn wait_until_cached(client: &FirestoreClient, path: &str) {
    for _ in 0..200 {
        if let Ok(Some(_)) = client.get_document_from_local_cache(key(path)).await {
            return;
        }
        tokio::time::sleep(Duration::from_millis(10)).await;
    }
    panic!("{path} never reached the local cache");
}

#[tokio::test]
async fn listeners_receive_server_documents() {
    let backend = FakeBackend::new();
    backend.seed("bases/coffee", fields(&[("name", "Coffee"), ("color", "#6F4E37")]));
    backend.seed("bases/tea", fields(&[("name", "Tea")]));
    let client = client_for(&backend, None).await;

    let recorder = Recorder::default();
    client
        .listen(Query::collection("bases").unwrap(), ListenOptions::default(), recorder.observer())
        .await
        .unwrap();

    eventually("a synced snapshot", || recorder.last().is_some_and(|snapshot| !snapshot.from_cache)).await;
    let snapshot = recorder.last().unwrap();
    assert_eq!(snapshot.documents.len(), 2);
    assert!(!snapshot.has_pending_writes());
    assert!(recorder.errors().is_empty());
}

#[tokio::test]
async fn filtered_queries_only_see_matching_documents() {
    let backend = FakeBackend::new();
    backend.seed("beverages/a", fields(&[("uid", "u1"), ("name", "Latte")]));
    backend.seed("beverages/b", fields(&[("uid", "u2"), ("name", "Mocha")]));
    let client = client_for(&backend, None).await;

    let recorder = Recorder::default();
    let query = beverages()
        .where_field("uid", FilterOperator::Equal, FirestoreValue::from_string("u1"))
        .unwrap();
    client
        .listen(query, ListenOptions::default(), recorder.observer())
        .await
        .unwrap();

    eventually("a synced snapshot", || recorder.last().is_some_and(|snapshot| !snapshot.from_cache)).await;
    let snapshot = recorder.last().unwrap();
    assert_eq!(snapshot.documents.len(), 1);
    assert!(snapshot.documents.has(&key("beverages/a")));
}

#[tokio::test]
async fn writes_show_up_locally_then_get_acknowledged() {
    let backend = FakeBackend::new();
    let client = client_for(&backend, Some(User::new("u1"))).await;
    let recorder = Recorder::default();
    client.listen(beverages(), with_metadata(), recorder.observer()).await.unwrap();
    eventually("the empty server snapshot", || recorder.last().is_some_and(|snapshot| !snapshot.from_cache)).await;

    client
        .write(vec![Mutation::set(
            key("beverages/b1"),
            fields(&[("uid", "u1"), ("name", "Latte")]),
        )])
        .await
        .unwrap();

    assert!(backend.document("beverages/b1").is_some());
    eventually("the acknowledged snapshot", || {
        recorder
            .last()
            .is_some_and(|snapshot| snapshot.documents.len() == 1 && !snapshot.has_pending_writes())
    })
    .await;
    let saw_pending = recorder
        .snapshots
        .lock()
        .unwrap()
        .iter()
        .any(|snapshot| snapshot.has_pending_writes());
    assert!(saw_pending);
}

#[tokio::test]
async fn other_clients_see_committed_writes() {
    let backend = FakeBackend::new();
    let writer = client_for(&backend, Some(User::new("u1"))).await;
    let reader = client_for(&backend, Some(User::new("u2"))).await;

    let recorder = Recorder::default();
    reader.listen(beverages(), ListenOptions::default(), recorder.observer()).await.unwrap();
    eventually("the reader to sync", || recorder.last().is_some_and(|snapshot| !snapshot.from_cache)).await;

    writer
        .write(vec![Mutation::set(key("beverages/b1"), fields(&[("uid", "u1"), ("name", "Chai")]))])
        .await
        .unwrap();

    eventually("the reader to see the write", || {
        recorder
            .last()
            .is_some_and(|snapshot| snapshot.documents.has(&key("beverages/b1")))
    })
    .await;

    writer.write(vec![Mutation::delete(key("beverages/b1"))]).await.unwrap();
    eventually("the reader to see the delete", || {
        recorder.last().is_some_and(|snapshot| snapshot.documents.is_empty())
    })
    .await;
}

#[tokio::test]
async fn rejected_writes_are_rolled_back() {
    let backend = FakeBackend::new();
    backend.reject_next_write(permission_denied("Missing or insufficient permissions."));
    let client = client_for(&backend, Some(User::new("u1"))).await;
    let recorder = Recorder::default();
    client.listen(beverages(), ListenOptions::default(), recorder.observer()).await.unwrap();
    eventually("the empty server snapshot", || recorder.last().is_some_and(|snapshot| !snapshot.from_cache)).await;

    let error = client
        .write(vec![Mutation::set(key("beverages/b1"), fields(&[("uid", "u1")]))])
        .await
        .unwrap_err();

    assert_eq!(error.code, FirestoreErrorCode::PermissionDenied);
    eventually("the rolled back view", || {
        recorder.last().is_some_and(|snapshot| snapshot.documents.is_empty())
    })
    .await;
    assert!(backend.document("beverages/b1").is_none());

    // The stream recovers for later writes.
    client
        .write(vec![Mutation::set(key("beverages/b2"), fields(&[("uid", "u1")]))])
        .await
        .unwrap();
    assert!(backend.document("beverages/b2").is_some());
}

#[tokio::test]
async fn pending_writes_resolve_once_the_network_returns() {
    let backend = FakeBackend::new();
    let client = client_for(&backend, Some(User::new("u1"))).await;
    client.disable_network().await.unwrap();

    let writer = client.clone();
    let write = tokio::spawn(async move {
        writer
            .write(vec![Mutation::set(key("beverages/b1"), fields(&[("uid", "u1")]))])
            .await
    });
    wait_until_cached(&client, "beverages/b1").await;

    let waiting = client.clone();
    let waiter = tokio::spawn(async move { waiting.wait_for_pending_writes().await });
    tokio::time::sleep(Duration::from_millis(50)).await;
    assert!(!waiter.is_finished());
    assert_eq!(backend.commit_count(), 0);

    client.enable_network().await.unwrap();
    waiter.await.unwrap().unwrap();
    write.await.unwrap().unwrap();
    assert_eq!(backend.commit_count(), 1);
}

#[tokio::test]
async fn disabling_the_network_serves_from_cache() {
    let backend = FakeBackend::new();
    backend.seed("beverages/a", fields(&[("uid", "u1"), ("name", "Latte")]));
    let client = client_for(&backend, None).await;
    let recorder = Recorder::default();
    client.listen(beverages(), with_metadata(), recorder.observer()).await.unwrap();
    eventually("a synced snapshot", || recorder.last().is_some_and(|snapshot| !snapshot.from_cache)).await;

    client.disable_network().await.unwrap();
    eventually("an offline snapshot", || recorder.last().is_some_and(|snapshot| snapshot.from_cache)).await;
    assert_eq!(recorder.last().unwrap().documents.len(), 1);

    client.enable_network().await.unwrap();
    eventually("the resync", || recorder.last().is_some_and(|snapshot| !snapshot.from_cache)).await;
    assert_eq!(recorder.last().unwrap().documents.len(), 1);
}

#[tokio::test]
async fn switching_users_hides_the_previous_users_writes() {
    let backend = FakeBackend::new();
    let client = client_for(&backend, Some(User::new("u1"))).await;
    client.disable_network().await.unwrap();
    let recorder = Recorder::default();
    client.listen(beverages(), with_metadata(), recorder.observer()).await.unwrap();

    let writer = client.clone();
    let _write = tokio::spawn(async move {
        writer
            .write(vec![Mutation::set(key("beverages/b1"), fields(&[("uid", "u1")]))])
            .await
    });
    eventually("the local write", || {
        recorder.last().is_some_and(|snapshot| snapshot.documents.len() == 1)
    })
    .await;

    client.handle_credential_change(User::new("u2")).await.unwrap();
    eventually("u2's empty view", || recorder.last().is_some_and(|snapshot| snapshot.documents.is_empty())).await;

    client.handle_credential_change(User::new("u1")).await.unwrap();
    eventually("u1's write again", || {
        recorder.last().is_some_and(|snapshot| snapshot.documents.len() == 1)
    })
    .await;
}

#[tokio::test]
async fn unlisten_stops_snapshots() {
    let backend = FakeBackend::new();
    let client = client_for(&backend, Some(User::new("u1"))).await;
    let recorder = Recorder::default();
    let listener = client.listen(beverages(), ListenOptions::default(), recorder.observer()).await.unwrap();
    eventually("a synced snapshot", || recorder.last().is_some_and(|snapshot| !snapshot.from_cache)).await;

    client.unlisten(listener).await.unwrap();
    let seen = recorder.count();
    client
        .write(vec![Mutation::set(key("beverages/b1"), fields(&[("uid", "u1")]))])
        .await
        .unwrap();
    assert_eq!(recorder.count(), seen);
}

#[tokio::test]
async fn terminated_clients_reject_calls() {
    let backend = FakeBackend::new();
    let client = client_for(&backend, None).await;
    client.terminate().await.unwrap();

    let error = client
        .write(vec![Mutation::set(key("beverages/b1"), fields(&[("uid", "u1")]))])
        .await
        .unwrap_err();
    assert_eq!(error.code, FirestoreErrorCode::FailedPrecondition);
    assert_eq!(error.message(), "The client has already been terminated.");
}
