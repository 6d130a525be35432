//! End-to-end tests against a real listener.

use json_mock_server::{start, ServerError, ServerHandle, ServerOptions};
use serde_json::{json, Value};
use std::io::Write;
use std::net::{Ipv4Addr, SocketAddr};
use std::time::{Duration, Instant};
use tempfile::NamedTempFile;

fn config_file(doc: &Value) -> NamedTempFile {
    let mut file = tempfile::Builder::new().suffix(".json").tempfile().unwrap();
    file.write_all(doc.to_string().as_bytes()).unwrap();
    file
}

fn options(file: &NamedTempFile) -> ServerOptions {
    ServerOptions::new(file.path())
        .with_addr(SocketAddr::from((Ipv4Addr::LOCALHOST, 0)))
        .with_watch_config(false)
        .with_signal_handlers(false)
}

fn versioned(version: u32) -> Value {
    json!({
        "routes": [{ "method": "GET", "path": "/v", "response": { "version": version } }]
    })
}

async fn serve(doc: Value) -> (ServerHandle, NamedTempFile, String) {
    let file = config_file(&doc);
    let handle = start(options(&file)).await.unwrap();
    let base = format!("http://{}", handle.local_addr());
    (handle, file, base)
}

#[tokio::test]
async fn test_path_params_in_response() {
    let (handle, _file, base) = serve(json!({
        "routes": [{
            "method": "GET",
            "path": "/users/:id",
            "response": { "id": "{{id}}", "name": "User {{id}}" }
        }]
    }))
    .await;

    let response = reqwest::get(format!("{}/users/42", base)).await.unwrap();
    assert_eq!(response.status(), 200);
    assert_eq!(response.headers()["x-content-type-options"], "nosniff");
    let body: Value = response.json().await.unwrap();
    assert_eq!(body, json!({ "id": "42", "name": "User 42" }));

    handle.stop().await.unwrap();
}

#[tokio::test]
async fn test_error_code_skips_delay() {
    let (handle, _file, base) = serve(json!({
        "routes": [{
            "method": "POST",
            "path": "/fail",
            "errorCode": 500,
            "errorMessage": "boom",
            "delay": 3000,
            "response": {}
        }]
    }))
    .await;

    let started = Instant::now();
    let response = reqwest::Client::new()
        .post(format!("{}/fail", base))
        .send()
        .await
        .unwrap();
    assert!(started.elapsed() < Duration::from_secs(2));
    assert_eq!(response.status(), 500);
    assert_eq!(response.json::<Value>().await.unwrap(), json!({ "error": "boom" }));

    handle.stop().await.unwrap();
}

#[tokio::test]
async fn test_conditions_with_fallback() {
    let (handle, _file, base) = serve(json!({
        "routes": [{
            "method": "GET",
            "path": "/plan",
            "conditions": { "query": { "type": "premium" } },
            "response": { "msg": "A" },
            "fallback": { "msg": "B" }
        }]
    }))
    .await;

    let a: Value = reqwest::get(format!("{}/plan?type=premium", base))
        .await
        .unwrap()
        .json()
        .await
        .unwrap();
    assert_eq!(a, json!({ "msg": "A" }));

    let response = reqwest::get(format!("{}/plan?type=basic", base)).await.unwrap();
    assert_eq!(response.status(), 200);
    assert_eq!(response.json::<Value>().await.unwrap(), json!({ "msg": "B" }));

    handle.stop().await.unwrap();
}

#[tokio::test]
async fn test_delay_does_not_block_other_requests() {
    let (handle, _file, base) = serve(json!({
        "routes": [
            {
                "method": "GET",
                "path": "/slow",
                "response": { "t": "{{responseTime}}" },
                "delay": 500
            },
            { "method": "GET", "path": "/fast", "response": { "ok": true } }
        ]
    }))
    .await;

    let client = reqwest::Client::new();
    let slow_url = format!("{}/slow", base);
    let started = Instant::now();
    let slow = tokio::spawn({
        let client = client.clone();
        async move {
            let response = client.get(slow_url).send().await.unwrap();
            (Instant::now(), response.json::<Value>().await.unwrap())
        }
    });

    tokio::time::sleep(Duration::from_millis(50)).await;
    let fast = client.get(format!("{}/fast", base)).send().await.unwrap();
    let fast_done = Instant::now();
    assert_eq!(fast.status(), 200);

    let (slow_done, slow_body) = slow.await.unwrap();
    assert!(fast_done < slow_done);
    assert!(slow_done.duration_since(started) >= Duration::from_millis(500));
    let took: i64 = slow_body["t"].as_str().unwrap().parse().unwrap();
    assert!(took >= 500);

    handle.stop().await.unwrap();
}

#[tokio::test]
async fn test_unknown_route_is_404() {
    let (handle, _file, base) = serve(json!({
        "routes": [{ "method": "GET", "path": "/a", "response": {} }]
    }))
    .await;

    let response = reqwest::get(format!("{}/missing", base)).await.unwrap();
    assert_eq!(response.status(), 404);
    assert_eq!(response.headers()["content-type"], "application/json");
    assert_eq!(response.json::<Value>().await.unwrap(), json!({ "error": "Not Found" }));
    assert_eq!(handle.state().stats().total_unmatched(), 1);

    handle.stop().await.unwrap();
}

#[tokio::test]
async fn test_invalid_config_fails_startup() {
    let file = config_file(&json!({ "routes": [{ "path": "/a", "response": {} }] }));
    let err = start(options(&file)).await.err().unwrap();
    assert!(matches!(err, ServerError::Config(_)));
    assert!(err.to_string().contains("routes[0]"));
}

#[tokio::test]
async fn test_reload_swaps_routes_and_rejects_invalid() {
    let (handle, file, base) = serve(versioned(1)).await;

    std::fs::write(file.path(), "{ not json").unwrap();
    assert!(handle.reload().await.is_err());
    let body: Value = reqwest::get(format!("{}/v", base)).await.unwrap().json().await.unwrap();
    assert_eq!(body, json!({ "version": 1 }));
    assert_eq!(handle.state().stats().reloads_rejected(), 1);

    std::fs::write(file.path(), versioned(2).to_string()).unwrap();
    assert_eq!(handle.reload().await.unwrap(), 1);
    let body: Value = reqwest::get(format!("{}/v", base)).await.unwrap().json().await.unwrap();
    assert_eq!(body, json!({ "version": 2 }));

    handle.stop().await.unwrap();
}

#[tokio::test]
async fn test_file_change_triggers_reload() {
    let file = config_file(&versioned(1));
    let handle = start(options(&file).with_watch_config(true)).await.unwrap();
    let url = format!("http://{}/v", handle.local_addr());

    std::fs::write(file.path(), versioned(2).to_string()).unwrap();

    let deadline = Instant::now() + Duration::from_secs(5);
    loop {
        let body: Value = reqwest::get(&url).await.unwrap().json().await.unwrap();
        if body == json!({ "version": 2 }) {
            break;
        }
        assert!(Instant::now() < deadline, "config change was not picked up");
        tokio::time::sleep(Duration::from_millis(50)).await;
    }

    handle.stop().await.unwrap();
}

#[tokio::test]
async fn test_invalid_file_change_keeps_current_routes() {
    let file = config_file(&versioned(1));
    let handle = start(options(&file).with_watch_config(true)).await.unwrap();
    let url = format!("http://{}/v", handle.local_addr());

    std::fs::write(file.path(), r#"{"routes":[{"method":"GET","path":"/v"}]}"#).unwrap();

    let deadline = Instant::now() + Duration::from_secs(5);
    while handle.state().stats().reloads_rejected() == 0 {
        assert!(Instant::now() < deadline, "config change was not picked up");
        tokio::time::sleep(Duration::from_millis(50)).await;
    }

    let response = reqwest::get(&url).await.unwrap();
    assert_eq!(response.status(), 200);
    assert_eq!(response.json::<Value>().await.unwrap(), json!({ "version": 1 }));
    assert_eq!(handle.state().stats().reloads_applied(), 0);

    // A later valid edit is still picked up.
    std::fs::write(file.path(), versioned(2).to_string()).unwrap();
    let deadline = Instant::now() + Duration::from_secs(5);
    loop {
        let body: Value = reqwest::get(&url).await.unwrap().json().await.unwrap();
        if body == json!({ "version": 2 }) {
            break;
        }
        assert!(Instant::now() < deadline, "valid change after a rejected one was ignored");
        tokio::time::sleep(Duration::from_millis(50)).await;
    }

    handle.stop().await.unwrap();
}

#[tokio::test]
async fn test_stop_drains_in_flight_request() {
    let (handle, _file, base) = serve(json!({
        "routes": [{ "method": "GET", "path": "/slow", "response": { "done": true }, "delay": 300 }]
    }))
    .await;

    let in_flight = tokio::spawn(reqwest::get(format!("{}/slow", base)));
    tokio::time::sleep(Duration::from_millis(100)).await;

    handle.stop().await.unwrap();

    let response = in_flight.await.unwrap().unwrap();
    assert_eq!(response.status(), 200);
    assert_eq!(response.json::<Value>().await.unwrap(), json!({ "done": true }));
}

#[tokio::test]
async fn test_stop_times_out_on_long_delay() {
    let file = config_file(&json!({
        "routes": [{ "method": "GET", "path": "/stuck", "response": {}, "delay": 5000 }]
    }));
    let handle = start(options(&file).with_shutdown_timeout(Duration::from_millis(200)))
        .await
        .unwrap();
    let url = format!("http://{}/stuck", handle.local_addr());

    let _in_flight = tokio::spawn(reqwest::get(url));
    tokio::time::sleep(Duration::from_millis(100)).await;

    let started = Instant::now();
    let err = handle.stop().await.unwrap_err();
    assert!(matches!(err, ServerError::ShutdownTimeout { .. }));
    assert!(started.elapsed() < Duration::from_secs(2));
}
