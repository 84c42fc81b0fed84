//! REST surface tests: routing, error mapping, the ban list and node
//! status control, driven through a real HTTP client.

use std::net::SocketAddr;
use std::sync::Arc;

use serde_json::{json, Value};
use uuid::Uuid;

use gridnode_agent::events::EventSender;
use gridnode_agent::http::HttpService;
use gridnode_agent::node::Agent;
use gridnode_agent::router_link::RouterLink;
use gridnode_agent::session::manager::SessionManager;
use gridnode_agent::ComputationDefaults;

async fn start_service(use_ban_list: bool) -> (HttpService, String, Arc<SessionManager>) {
    let node_id = Uuid::new_v4();
    let defaults = ComputationDefaults::default();
    let agent = Agent::new(node_id, defaults.clone());
    let (link, _link_rx) = RouterLink::disconnected(node_id);
    let (events, _events_rx) = EventSender::null();
    let manager = SessionManager::new(node_id, defaults, link, events);

    let bind: SocketAddr = "127.0.0.1:0".parse().unwrap();
    let service = HttpService::start(agent, manager.clone(), bind, use_ban_list)
        .await
        .unwrap();
    let base = format!("http://127.0.0.1:{}", service.port());
    (service, base, manager)
}

#[tokio::test]
async fn test_sessions_list_empty() {
    let (_service, base, _) = start_service(false).await;
    let resp = reqwest::get(format!("{base}/node/1/sessions")).await.unwrap();
    assert_eq!(resp.status().as_u16(), 200);
    let body: Value = resp.json().await.unwrap();
    assert_eq!(body, json!([]));
}

#[tokio::test]
async fn test_health_down_without_router_socket() {
    let (_service, base, _) = start_service(false).await;
    let resp = reqwest::get(format!("{base}/node/1/health")).await.unwrap();
    assert_eq!(resp.status().as_u16(), 500);
    let body: Value = resp.json().await.unwrap();
    assert_eq!(body["status"], json!("DOWN"));
    assert!(body["info"].as_str().unwrap().contains("IPC socket"));
}

#[tokio::test]
async fn test_unknown_session_is_404() {
    let (_service, base, _) = start_service(false).await;
    let client = reqwest::Client::new();

    let id = Uuid::new_v4();
    let resp = client
        .get(format!("{base}/node/1/sessions/{id}/status"))
        .send()
        .await
        .unwrap();
    assert_eq!(resp.status().as_u16(), 404);

    let resp = client
        .delete(format!("{base}/node/1/sessions/{id}"))
        .header("X-Session-Delete-Reason", "test")
        .send()
        .await
        .unwrap();
    assert_eq!(resp.status().as_u16(), 404);
    assert!(resp.text().await.unwrap().contains("doesn't exist"));
}

#[tokio::test]
async fn test_status_close_then_create_conflicts() {
    let (_service, base, _) = start_service(false).await;
    let client = reqwest::Client::new();

    let resp = client
        .put(format!("{base}/status"))
        .json(&json!({"status": "close"}))
        .send()
        .await
        .unwrap();
    assert_eq!(resp.status().as_u16(), 200);
    let body: Value = resp.json().await.unwrap();
    assert_eq!(body["success"], json!("true"));

    let resp = client
        .post(format!("{base}/node/1/sessions"))
        .json(&json!({}))
        .send()
        .await
        .unwrap();
    assert_eq!(resp.status().as_u16(), 409);
    assert!(resp.text().await.unwrap().contains("closed"));
}

#[tokio::test]
async fn test_status_unknown_value_is_400() {
    let (_service, base, _) = start_service(false).await;
    let client = reqwest::Client::new();

    let resp = client
        .put(format!("{base}/status"))
        .json(&json!({"status": "explode"}))
        .send()
        .await
        .unwrap();
    assert_eq!(resp.status().as_u16(), 400);

    // missing body at all
    let resp = client.put(format!("{base}/status")).send().await.unwrap();
    assert_eq!(resp.status().as_u16(), 400);
}

#[tokio::test]
async fn test_tag_update_and_delete() {
    let (_service, base, _) = start_service(false).await;
    let client = reqwest::Client::new();

    let resp = client
        .put(format!("{base}/node/tags"))
        .json(&json!({"exclusive_user": "alex"}))
        .send()
        .await
        .unwrap();
    assert_eq!(resp.status().as_u16(), 200);

    // invalid tag combination
    let resp = client
        .put(format!("{base}/node/tags"))
        .json(&json!({"exclusive_team": "fx"}))
        .send()
        .await
        .unwrap();
    assert_eq!(resp.status().as_u16(), 400);

    let resp = client
        .delete(format!("{base}/node/tag/exclusive_user"))
        .send()
        .await
        .unwrap();
    assert_eq!(resp.status().as_u16(), 200);
}

#[tokio::test]
async fn test_ban_list_blocks_flooding_source() {
    let (_service, base, _) = start_service(true).await;
    let client = reqwest::Client::new();

    // five unmapped GETs strike out the source
    for _ in 0..5 {
        let resp = client
            .get(format!("{base}/definitely/not/mapped"))
            .send()
            .await
            .unwrap();
        assert_eq!(resp.status().as_u16(), 404);
    }

    let resp = client
        .get(format!("{base}/definitely/not/mapped"))
        .send()
        .await
        .unwrap();
    assert_eq!(resp.status().as_u16(), 429);

    // mapped GETs from the same source are now refused too
    let resp = client
        .get(format!("{base}/node/1/sessions"))
        .send()
        .await
        .unwrap();
    assert_eq!(resp.status().as_u16(), 429);
}

#[tokio::test]
async fn test_favicon_does_not_collect_strikes() {
    let (_service, base, _) = start_service(true).await;
    let client = reqwest::Client::new();

    for _ in 0..8 {
        let resp = client
            .get(format!("{base}/favicon.ico"))
            .send()
            .await
            .unwrap();
        assert_eq!(resp.status().as_u16(), 404);
    }
    // still not banned
    let resp = client
        .get(format!("{base}/node/1/sessions"))
        .send()
        .await
        .unwrap();
    assert_eq!(resp.status().as_u16(), 200);
}

#[tokio::test]
async fn test_unmapped_put_is_400_not_tracked() {
    let (_service, base, _) = start_service(true).await;
    let client = reqwest::Client::new();

    for _ in 0..8 {
        let resp = client
            .put(format!("{base}/definitely/not/mapped"))
            .send()
            .await
            .unwrap();
        assert_eq!(resp.status().as_u16(), 400);
    }
    // PUT floods don't feed the GET ban list
    let resp = client
        .get(format!("{base}/node/1/sessions"))
        .send()
        .await
        .unwrap();
    assert_eq!(resp.status().as_u16(), 200);
}

#[tokio::test]
async fn test_malformed_session_body_is_400() {
    let (_service, base, _) = start_service(false).await;
    let client = reqwest::Client::new();

    let resp = client
        .post(format!("{base}/node/1/sessions"))
        .body("this is not json")
        .send()
        .await
        .unwrap();
    assert_eq!(resp.status().as_u16(), 400);
}
