mod common;

use serde_json::json;

use crate::common::{TestAuthority, connect, start_gateway, status_frame, status_value, wait_for};

// Length-prefixed JSON records on a session channel become the connection's
// status blob, last writer wins, and surface in the status snapshot.
#[tokio::test(flavor = "multi_thread")]
async fn status_records_surface_in_snapshots() {
    let authority = TestAuthority::new();
    let (gateway, address) = start_gateway(&authority).await;

    let (mut client, _forwarded) = connect(address, &authority, "alice", false).await;
    let channel = client
        .channel_open_session()
        .await
        .expect("session channel open failed");

    channel
        .data(&status_frame(br#"{"state":"ok","load":1}"#)[..])
        .await
        .expect("status write failed");
    wait_for(|| {
        status_value(&gateway)["connections"][0]["status"] == json!({"state": "ok", "load": 1})
    })
    .await;

    // A record split across data messages still decodes whole.
    let frame = status_frame(br#"{"state":"degraded"}"#);
    let (head, tail) = frame.split_at(3);
    channel.data(head).await.expect("status write failed");
    channel.data(tail).await.expect("status write failed");
    wait_for(|| status_value(&gateway)["connections"][0]["status"] == json!({"state": "degraded"}))
        .await;

    // Malformed JSON records are discarded without disturbing the blob.
    channel
        .data(&status_frame(b"not json")[..])
        .await
        .expect("status write failed");
    channel
        .data(&status_frame(br#"{"state":"after"}"#)[..])
        .await
        .expect("status write failed");
    wait_for(|| status_value(&gateway)["connections"][0]["status"] == json!({"state": "after"}))
        .await;

    // The snapshot carries the record bytes untouched: key order and spacing
    // survive serialization.
    channel
        .data(&status_frame(br#"{"zeta": 1, "alpha": 2}"#)[..])
        .await
        .expect("status write failed");
    wait_for(|| gateway.status().contains(r#"{"zeta": 1, "alpha": 2}"#)).await;

    let status = status_value(&gateway);
    let connection = &status["connections"][0];
    assert_eq!(connection["user"], "alice");
    assert_eq!(connection["admin"], false);
    assert_eq!(connection["sessions"].as_array().unwrap().len(), 1);
    assert!(connection["address"].is_string());
    assert!(connection["bytes_read"].is_u64());
    assert!(connection["up_time"].is_u64());
    assert!(connection["idle_time"].is_u64());
}
