use std::time::Duration;

use modbridge_wire::wire::mock::{MockRuntime, MockRuntimeConfig, MockScenario};
use serde_json::json;
use tokio::net::TcpListener;

use crate::harness::DapClient;

const SCRIPT: &str = "/attached/tests/scenarios/run/control.lua";

/// Serve the mock hook to the first connection on an ephemeral port.
async fn listen() -> (u16, tokio::task::JoinHandle<std::io::Result<()>>) {
    let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let port = listener.local_addr().unwrap().port();
    let hook = tokio::spawn(async move {
        let (stream, _) = listener.accept().await?;
        let (read, write) = stream.into_split();
        MockRuntime::new(MockRuntimeConfig::new(SCRIPT, MockScenario::Run))
            .serve(read, write)
            .await
    });
    (port, hook)
}

#[tokio::test]
async fn attach_debugs_a_target_over_tcp_and_detaches_on_disconnect() {
    let (port, hook) = listen().await;
    let mut dap = DapClient::start();

    dap.request_ok("initialize", json!({ "adapterID": "modbridge" }))
        .await;
    dap.request_ok("attach", json!({ "host": "127.0.0.1", "port": port }))
        .await;

    let process = dap.wait_event("process").await;
    assert_eq!(process["body"]["startMethod"], "attach");
    assert!(process["body"].get("systemProcessId").is_none());

    dap.wait_event("initialized").await;
    let breakpoints = dap.set_breakpoints(SCRIPT, &[2]).await;
    assert_eq!(breakpoints[0]["verified"], true);
    dap.request_ok("configurationDone", json!({})).await;

    let stopped = dap.wait_event("stopped").await;
    assert_eq!(stopped["body"]["reason"], "breakpoint");
    let (_, line, _) = dap.top_frame().await;
    assert_eq!(line, 2);

    // Attached targets are detached from, not terminated: the hook just sees
    // its command stream end.
    let response = dap.disconnect(json!({})).await;
    assert_eq!(response["success"], true);
    let served = tokio::time::timeout(Duration::from_secs(5), hook)
        .await
        .expect("mock hook did not notice the detach")
        .unwrap();
    assert!(served.is_ok(), "{served:?}");
}

#[tokio::test]
async fn attach_fails_when_nothing_listens() {
    let port = {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        listener.local_addr().unwrap().port()
    };
    let mut dap = DapClient::start();
    dap.request_ok("initialize", json!({})).await;

    let response = dap.request("attach", json!({ "port": port })).await;
    assert_eq!(response["success"], false);
    assert!(dap.seen_events("process").is_empty());

    // A failed attach leaves the adapter free to try again.
    let (port, _hook) = listen().await;
    dap.request_ok("attach", json!({ "port": port })).await;
    dap.wait_event("initialized").await;
}

#[tokio::test]
async fn a_second_target_is_rejected() {
    let (port, _hook) = listen().await;
    let mut dap = DapClient::start();
    dap.request_ok("initialize", json!({})).await;
    dap.request_ok("attach", json!({ "port": port })).await;
    dap.wait_event("initialized").await;

    let again = dap.request("attach", json!({ "port": port })).await;
    assert_eq!(again["success"], false);
    assert_eq!(
        again["message"],
        "attach is not allowed while the session is initialized"
    );
}
