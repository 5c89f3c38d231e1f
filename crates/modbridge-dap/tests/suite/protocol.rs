use serde_json::json;
use tokio::io::AsyncWriteExt;

use modbridge_dap::server::ServerError;

use crate::harness::DapClient;

#[tokio::test]
async fn initialize_advertises_capabilities_without_initialized() {
    let mut dap = DapClient::start();
    let body = dap.request_ok("initialize", json!({})).await;
    assert_eq!(body["supportsSetVariable"], true);
    assert_eq!(body["supportsLogPoints"], true);
    assert_eq!(body["supportsTerminateRequest"], true);

    // `initialized` only follows once a target's debug hook is ready.
    let threads = dap.request_ok("threads", json!({})).await;
    assert_eq!(threads["threads"][0]["id"], 1);
    assert!(dap.seen_events("initialized").is_empty());

    assert!(dap.close().await.is_ok());
}

#[tokio::test]
async fn responses_are_numbered_in_write_order() {
    let mut dap = DapClient::start();
    let first = dap.request("initialize", json!({})).await;
    let second = dap.request("threads", json!({})).await;
    let first_seq = first["seq"].as_i64().unwrap();
    assert_eq!(second["seq"].as_i64().unwrap(), first_seq + 1);
    assert_eq!(second["request_seq"], 2);
    assert_eq!(second["command"], "threads");
}

#[tokio::test]
async fn session_requests_need_a_target() {
    let mut dap = DapClient::start();
    dap.request_ok("initialize", json!({})).await;

    let response = dap
        .request("stackTrace", json!({ "threadId": 1 }))
        .await;
    assert_eq!(response["success"], false);
    assert_eq!(
        response["message"],
        "stackTrace requires a target; send launch or attach first"
    );
}

#[tokio::test]
async fn unknown_requests_and_bad_arguments_fail_cleanly() {
    let mut dap = DapClient::start();
    dap.request_ok("initialize", json!({})).await;

    let response = dap.request("launch", json!({ "program": 42 })).await;
    assert_eq!(response["success"], false);
    assert!(
        response["message"]
            .as_str()
            .unwrap()
            .starts_with("invalid launch arguments"),
        "{response}"
    );

    let response = dap.request("attach", json!({})).await;
    assert_eq!(response["success"], false);

    // The adapter keeps serving.
    let response = dap.request("threads", json!({})).await;
    assert_eq!(response["success"], true);
}

#[tokio::test]
async fn malformed_framing_ends_the_server_with_an_error() {
    let mut dap = DapClient::start();
    dap.request_ok("initialize", json!({})).await;

    dap.writer()
        .get_mut()
        .write_all(b"Content-Length: nope\r\n\r\n")
        .await
        .unwrap();
    let result = dap.close().await;
    assert!(matches!(result, Err(ServerError::Dap(_))), "{result:?}");
}

#[tokio::test]
async fn closing_the_client_stream_stops_the_server() {
    let dap = DapClient::start();
    assert!(dap.close().await.is_ok());
}
