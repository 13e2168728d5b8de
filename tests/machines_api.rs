use httpmock::prelude::*;

use devgate::compute::{ComputeBackend, MachineState, RemoteBackend};
use devgate::error::AppError;

fn backend(server: &MockServer) -> RemoteBackend {
    RemoteBackend::new(server.base_url(), "test-token".into()).unwrap()
}

#[tokio::test]
async fn create_volume_posts_payload_and_bearer() {
    let server = MockServer::start();
    let mock = server.mock(|when, then| {
        when.method(POST)
            .path("/volumes")
            .header("authorization", "Bearer test-token")
            .json_body(serde_json::json!({
                "name": "ws-deadbeef",
                "size_gb": 10,
                "region": "iad",
            }));
        then.status(200).json_body(serde_json::json!({ "id": "vol_1" }));
    });

    let volume = backend(&server)
        .create_volume("ws-deadbeef", 10, "iad")
        .await
        .unwrap();
    assert_eq!(volume.id, "vol_1");
    mock.assert();
}

#[tokio::test]
async fn get_machine_maps_provider_state() {
    let server = MockServer::start();
    server.mock(|when, then| {
        when.method(GET).path("/machines/m1");
        then.status(200).json_body(serde_json::json!({
            "id": "m1",
            "state": "started",
            "private_ip": "10.0.0.5",
        }));
    });

    let machine = backend(&server).get_machine("m1").await.unwrap();
    assert_eq!(machine.state, MachineState::Started);
    assert_eq!(machine.private_ip.as_deref(), Some("10.0.0.5"));
}

#[tokio::test]
async fn unknown_machine_is_not_found() {
    let server = MockServer::start();
    server.mock(|when, then| {
        when.method(GET).path("/machines/missing");
        then.status(404);
    });

    let err = backend(&server).get_machine("missing").await.unwrap_err();
    assert!(matches!(err, AppError::NotFound));
}

#[tokio::test]
async fn server_errors_are_retried() {
    let server = MockServer::start();
    let failing = server.mock(|when, then| {
        when.method(POST).path("/machines/m1/start");
        then.status(502);
    });

    let err = backend(&server).start_machine("m1").await.unwrap_err();
    assert!(matches!(err, AppError::BackendUnavailable(_)));
    // Two retries after the first 5xx.
    failing.assert_hits(3);
}

#[tokio::test]
async fn ssh_addr_uses_provider_address_and_port_2222() {
    let server = MockServer::start();
    server.mock(|when, then| {
        when.method(GET).path("/machines/m1");
        then.status(200).json_body(serde_json::json!({
            "id": "m1",
            "state": "started",
            "private_ip": "10.0.0.7",
        }));
    });

    let (host, port) = backend(&server).ssh_addr("m1").await.unwrap();
    assert_eq!((host.as_str(), port), ("10.0.0.7", 2222));
}

#[tokio::test]
async fn unknown_state_is_an_internal_error() {
    let server = MockServer::start();
    server.mock(|when, then| {
        when.method(GET).path("/machines/m1");
        then.status(200)
            .json_body(serde_json::json!({ "id": "m1", "state": "hibernating" }));
    });

    let err = backend(&server).get_machine("m1").await.unwrap_err();
    assert!(matches!(err, AppError::Internal(_)));
}
