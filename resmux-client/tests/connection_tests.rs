//! Integration tests for the connection lifecycle: reconnect
//! resynchronization, stale resubscription, teardown and the on-connect
//! hook.

mod common;

use serde_json::json;
use tokio::sync::mpsc;

use common::*;
use resmux_client::{Error, EventPayload};

#[tokio::test(start_paused = true)]
async fn reconnect_resyncs_collection() {
    let (client, mut server) = client_pair();

    let fetch = tokio::spawn({
        let client = client.clone();
        async move { client.get_collection("example.rooms").await }
    });
    let mut conn = server.next_conn().await;
    let req = conn.recv_request().await;
    conn.result(
        req.id,
        json!({ "data": [
            { "rid": "example.room.a", "data": { "name": "a" } },
            { "rid": "example.room.b", "data": { "name": "b" } },
            { "rid": "example.room.c", "data": { "name": "c" } },
        ]}),
    );
    let rooms = fetch.await.unwrap().unwrap();

    let (tx, mut rx) = mpsc::unbounded_channel();
    rooms
        .on("add remove", move |_, payload| {
            let _ = tx.send(payload.clone());
        })
        .unwrap();

    // Connection drops; the client reconnects after the fixed delay and
    // resubscribes the directly observed collection only.
    drop(conn);
    let mut conn = server.next_conn().await;
    let req = conn.recv_request().await;
    assert_eq!(req.method, "subscribe.example.rooms");
    conn.result(
        req.id,
        json!({ "data": [
            { "rid": "example.room.a" },
            { "rid": "example.room.c", "data": { "name": "c2" } },
            { "rid": "example.room.d", "data": { "name": "d" } },
        ]}),
    );

    match recv_event(&mut rx).await {
        EventPayload::Remove { item, idx } => {
            assert_eq!(item.rid(), "example.room.b");
            assert_eq!(idx, 1);
        }
        other => panic!("expected remove payload, got {other:?}"),
    }
    match recv_event(&mut rx).await {
        EventPayload::Add { item, idx } => {
            assert_eq!(item.rid(), "example.room.d");
            assert_eq!(idx, 2);
        }
        other => panic!("expected add payload, got {other:?}"),
    }

    assert_eq!(
        rooms.rids(),
        vec!["example.room.a", "example.room.c", "example.room.d"]
    );
    // The kept element's nested data was applied in place.
    assert_eq!(rooms.get(1).unwrap().get("name"), Some(json!("c2")));

    // No spurious events for kept elements, no child resubscriptions.
    settle().await;
    assert!(conn.try_recv_request().is_none());

    client.disconnect();
}

#[tokio::test(start_paused = true)]
async fn direct_listener_keeps_stale_entry_alive() {
    let (client, mut server) = client_pair();

    let fetch = tokio::spawn({
        let client = client.clone();
        async move { client.get_model("user.42").await }
    });
    let mut conn = server.next_conn().await;
    let req = conn.recv_request().await;
    conn.result(req.id, json!({ "data": { "name": "A" } }));
    let model = fetch.await.unwrap().unwrap();

    let (tx, mut rx) = mpsc::unbounded_channel();
    model
        .on("change unsubscribe", move |_, payload| {
            let _ = tx.send(payload.clone());
        })
        .unwrap();

    // Server drops the subscription; the direct listener keeps the entry
    // and arms the resubscribe timer.
    conn.send_raw(r#"{"event":"user.42.unsubscribe"}"#);
    match recv_event(&mut rx).await {
        EventPayload::Unsubscribe { item } => assert_eq!(item.rid(), "user.42"),
        other => panic!("expected unsubscribe payload, got {other:?}"),
    }

    // After the stale delay the client subscribes again and resynchronizes
    // through the snapshot.
    let req = conn.recv_request().await;
    assert_eq!(req.method, "subscribe.user.42");
    conn.result(req.id, json!({ "data": { "name": "C" } }));

    match recv_event(&mut rx).await {
        EventPayload::Change { old } => assert_eq!(old.get("name"), Some(&Some(json!("A")))),
        other => panic!("expected change payload, got {other:?}"),
    }
    assert_eq!(model.get("name"), Some(json!("C")));

    client.disconnect();
}

#[tokio::test(start_paused = true)]
async fn pending_calls_fail_when_connection_drops() {
    let (client, mut server) = client_pair();

    let call = tokio::spawn({
        let client = client.clone();
        async move { client.call_model("svc.thing.1", "do", None).await }
    });
    let mut conn = server.next_conn().await;
    let _req = conn.recv_request().await;
    drop(conn);

    let err = call.await.unwrap().unwrap_err();
    assert!(matches!(err, Error::Transport { .. }));

    client.disconnect();
}

#[tokio::test(start_paused = true)]
async fn last_off_unsubscribes_and_releases() {
    let (client, mut server) = client_pair();

    let fetch = tokio::spawn({
        let client = client.clone();
        async move { client.get_model("user.42").await }
    });
    let mut conn = server.next_conn().await;
    let req = conn.recv_request().await;
    conn.result(req.id, json!({ "data": { "name": "A" } }));
    let model = fetch.await.unwrap().unwrap();

    let handle = model.on("change", |_, _| {}).unwrap();
    model.off("change", handle).unwrap();

    let req = conn.recv_request().await;
    assert_eq!(req.method, "unsubscribe.user.42");
    conn.result(req.id, json!(null));
    settle().await;

    // The entry is gone: fetching the rid issues a fresh subscribe.
    let fetch = tokio::spawn({
        let client = client.clone();
        async move { client.get_model("user.42").await }
    });
    let req = conn.recv_request().await;
    assert_eq!(req.method, "subscribe.user.42");
    conn.result(req.id, json!({ "data": { "name": "A" } }));
    fetch.await.unwrap().unwrap();
}

#[tokio::test(start_paused = true)]
async fn client_events_track_the_connection() {
    let (client, mut server) = client_pair();

    let (tx, mut rx) = mpsc::unbounded_channel();
    client.on("connect close error", move |_, payload| {
        let _ = tx.send(payload.clone());
    });

    client.connect().await.unwrap();
    assert!(matches!(recv_event(&mut rx).await, EventPayload::Connect));
    assert!(client.is_connected());

    let conn = server.next_conn().await;
    conn.send_raw("not json");
    assert!(matches!(
        recv_event(&mut rx).await,
        EventPayload::Error {
            error: Error::Protocol { .. }
        }
    ));

    drop(conn);
    assert!(matches!(recv_event(&mut rx).await, EventPayload::Close));
    assert!(!client.is_connected());

    client.disconnect();
}

#[tokio::test(start_paused = true)]
async fn on_connect_hook_runs_before_connect_resolves() {
    let (client, mut server) = client_pair();

    client.set_on_connect(|client| async move {
        client
            .authenticate("auth.vault", "login", Some(json!({ "token": "t" })))
            .await
            .map(|_| ())
    });

    let connect = tokio::spawn({
        let client = client.clone();
        async move { client.connect().await }
    });
    let mut conn = server.next_conn().await;
    let req = conn.recv_request().await;
    assert_eq!(req.method, "auth.auth.vault.login");
    assert_eq!(req.params, Some(json!({ "token": "t" })));

    settle().await;
    assert!(!connect.is_finished());

    conn.result(req.id, json!(null));
    connect.await.unwrap().unwrap();
    assert!(client.is_connected());

    client.disconnect();
}

#[tokio::test(start_paused = true)]
async fn failing_hook_rejects_connect() {
    let (client, mut server) = client_pair();

    client.set_on_connect(|_| async {
        Err::<(), _>(Error::Config {
            reason: "credentials missing".to_string(),
        })
    });

    let connect = tokio::spawn({
        let client = client.clone();
        async move { client.connect().await }
    });
    let _conn = server.next_conn().await;

    let err = connect.await.unwrap().unwrap_err();
    assert!(matches!(err, Error::Config { .. }));
    assert!(!client.is_connected());

    client.disconnect();
}
