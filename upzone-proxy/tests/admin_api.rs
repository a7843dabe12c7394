//! End-to-end tests of the admin RPC listener.

use serde_json::{json, Value};
use std::net::SocketAddr;
use std::sync::Arc;
use tokio::net::TcpListener;
use upzone_admin::QueryBinding;
use upzone_core::domain::LiteralResolver;
use upzone_proxy::bootstrap::build_directory;
use upzone_proxy::config::Config;
use upzone_proxy::server::{serve, AdminState, MAX_BODY_BYTES};

async fn spawn_admin(shm_dir: &std::path::Path) -> SocketAddr {
    let config = Config::from_toml(&format!(
        r#"
        shm_dir = "{}"

        [[upstream]]
        name = "backend"
        port = 8080
        zone = "backend_pool"
        zone_size = 16384

        [[upstream.server]]
        address = "127.0.0.1:9001"
        "#,
        shm_dir.display()
    ))
    .unwrap();
    let directory = build_directory(&config, &LiteralResolver).unwrap();
    let state = Arc::new(AdminState::new(directory, QueryBinding::new()));

    let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let addr = listener.local_addr().unwrap();
    tokio::spawn(serve(listener, state));
    addr
}

async fn call(addr: SocketAddr, op: &str, args: Value) -> Value {
    let response = reqwest::Client::new()
        .post(format!("http://{addr}/dynamic/{op}"))
        .json(&args)
        .send()
        .await
        .unwrap();
    assert_eq!(response.status(), 200);
    response.json().await.unwrap()
}

#[tokio::test]
async fn peer_lifecycle_over_http() {
    let dir = tempfile::tempdir().unwrap();
    let addr = spawn_admin(dir.path()).await;

    let zones = call(addr, "list_zones", json!([])).await;
    assert_eq!(zones, json!({"result": ["backend_pool:8080"], "error": null}));

    let added = call(
        addr,
        "add_peer",
        json!(["backend_pool", "127.0.0.1:9002", 5, 2, 30, false]),
    )
    .await;
    assert_eq!(added, json!({"result": true, "error": null}));

    let again = call(
        addr,
        "add_peer",
        json!(["backend_pool", "127.0.0.1:9002", 1, 1, 10, false]),
    )
    .await;
    assert_eq!(again, json!({"result": null, "error": "the peer is exist"}));

    let down = call(addr, "set_peer_down", json!(["backend_pool", "127.0.0.1:9001", true])).await;
    assert_eq!(down["result"], json!(true));

    let described = call(addr, "describe_zone", json!(["backend_pool"])).await;
    let peers = described["result"].as_array().unwrap();
    assert_eq!(peers.len(), 2);
    assert_eq!(peers[0]["name"], "127.0.0.1:9001");
    assert_eq!(peers[0]["down"], true);
    assert_eq!(peers[1]["name"], "127.0.0.1:9002");
    assert_eq!(peers[1]["weight"], 5);
    assert_eq!(peers[1]["max_fails"], 2);
    assert_eq!(peers[1]["fail_timeout"], 30);
    assert!(peers[1].get("down").is_none());

    let missing = call(addr, "describe_zone", json!(["nope"])).await;
    assert_eq!(missing, json!({"result": null, "error": "zone not found"}));
}

#[tokio::test]
async fn argument_errors_are_replies() {
    let dir = tempfile::tempdir().unwrap();
    let addr = spawn_admin(dir.path()).await;

    let reply = call(addr, "list_zones", json!(["extra"])).await;
    assert_eq!(reply["error"], "no argument expected");

    let reply = call(addr, "set_peer_down", json!(["backend_pool"])).await;
    assert_eq!(reply["error"], "exactly 3 arguments expected");
}

#[tokio::test]
async fn transport_errors_use_status_codes() {
    let dir = tempfile::tempdir().unwrap();
    let addr = spawn_admin(dir.path()).await;
    let client = reqwest::Client::new();

    let response = client
        .post(format!("http://{addr}/dynamic/drop_zone"))
        .json(&json!([]))
        .send()
        .await
        .unwrap();
    assert_eq!(response.status(), 404);

    let response = client
        .get(format!("http://{addr}/dynamic/list_zones"))
        .send()
        .await
        .unwrap();
    assert_eq!(response.status(), 405);

    let response = client
        .post(format!("http://{addr}/dynamic/describe_zone"))
        .body("{\"zone\": 1}")
        .send()
        .await
        .unwrap();
    assert_eq!(response.status(), 400);
    let body: Value = response.json().await.unwrap();
    assert!(body["error"].as_str().unwrap().starts_with("arguments must be"));
}

#[tokio::test]
async fn oversized_body_is_refused() {
    let dir = tempfile::tempdir().unwrap();
    let addr = spawn_admin(dir.path()).await;

    let padding = "x".repeat(MAX_BODY_BYTES);
    let response = reqwest::Client::new()
        .post(format!("http://{addr}/dynamic/describe_zone"))
        .json(&json!([padding]))
        .send()
        .await
        .unwrap();
    assert_eq!(response.status(), 413);

    let reply = call(addr, "describe_zone", json!(["backend_pool"])).await;
    assert_eq!(reply["result"].as_array().unwrap().len(), 1);
}
