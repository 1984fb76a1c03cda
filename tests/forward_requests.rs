mod common;

use crate::common::{TestAuthority, connect, start_gateway, status_value, wait_for};

#[tokio::test(flavor = "multi_thread")]
async fn port_zero_forward_is_denied() {
    let authority = TestAuthority::new();
    let (gateway, address) = start_gateway(&authority).await;

    let (mut provider, _forwarded) = connect(address, &authority, "alice", false).await;
    let denied = provider.tcpip_forward("x", 0).await;
    assert!(denied.is_err(), "port 0 must be denied");

    // The attempt registered the connection but no service.
    wait_for(|| !gateway.connections().is_empty()).await;
    let status = status_value(&gateway);
    let services = &status["connections"][0]["services"];
    assert!(services.as_object().unwrap().is_empty());
}

#[tokio::test(flavor = "multi_thread")]
async fn duplicate_forward_is_denied_and_first_survives() {
    let authority = TestAuthority::new();
    let (gateway, address) = start_gateway(&authority).await;

    let (mut provider, _forwarded) = connect(address, &authority, "alice", false).await;
    provider
        .tcpip_forward("x", 8080)
        .await
        .expect("first registration should succeed");
    let duplicate = provider.tcpip_forward("x", 8080).await;
    assert!(duplicate.is_err(), "duplicate registration must be denied");

    let (resolved, host, port) = gateway
        .lookup_connection_service("x.alice", 8080)
        .expect("first registration should still resolve");
    assert_eq!(resolved.user(), "alice");
    assert_eq!(host, "x");
    assert_eq!(port, 8080);
}

#[tokio::test(flavor = "multi_thread")]
async fn cancel_forward_is_idempotent() {
    let authority = TestAuthority::new();
    let (gateway, address) = start_gateway(&authority).await;

    let (mut provider, _forwarded) = connect(address, &authority, "alice", false).await;
    provider
        .tcpip_forward("x", 8080)
        .await
        .expect("registration should succeed");
    provider
        .cancel_tcpip_forward("x", 8080)
        .await
        .expect("cancel should succeed");
    assert!(gateway.lookup_connection_service("x.alice", 8080).is_none());

    // Canceling an unregistered service is a silent success.
    provider
        .cancel_tcpip_forward("x", 8080)
        .await
        .expect("repeated cancel should succeed");

    // So is canceling a port that could never have been registered.
    provider
        .cancel_tcpip_forward("x", 0)
        .await
        .expect("cancel of an invalid port should still succeed");

    // The name is free for registration again.
    provider
        .tcpip_forward("x", 8080)
        .await
        .expect("re-registration should succeed");
    assert!(gateway.lookup_connection_service("x.alice", 8080).is_some());
}
