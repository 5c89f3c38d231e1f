use serde_json::json;

use crate::harness::{DapClient, ModWorkspace};

#[tokio::test]
async fn breakpoint_step_in_and_continue() {
    let mods = ModWorkspace::new();
    let script = mods.script("run");
    let mut dap = DapClient::start();

    let stopped = dap
        .launch_to_stop(mods.launch_arguments("run"), &script, &[3])
        .await;
    assert_eq!(stopped["body"]["reason"], "breakpoint");
    assert_eq!(stopped["body"]["threadId"], 1);
    assert_eq!(stopped["body"]["allThreadsStopped"], true);

    let threads = dap.request_ok("threads", json!({})).await;
    assert_eq!(threads, json!({ "threads": [{ "id": 1, "name": "thread 1" }] }));

    let trace = dap.request_ok("stackTrace", json!({ "threadId": 1 })).await;
    let top = &trace["stackFrames"][0];
    assert_eq!(top["line"], 3);
    assert_eq!(top["column"], 1);
    assert_eq!(top["source"]["path"], script.as_str());
    assert_eq!(top["source"]["name"], "control.lua");

    dap.request_ok("stepIn", json!({ "threadId": 1 })).await;
    let stopped = dap.wait_event("stopped").await;
    assert_eq!(stopped["body"]["reason"], "step");
    let (_, line, name) = dap.top_frame().await;
    assert_eq!((line, name.as_str()), (7, "count_tick"));

    dap.request_ok("stepOut", json!({ "threadId": 1 })).await;
    dap.wait_event("stopped").await;

    let body = dap.request_ok("continue", json!({ "threadId": 1 })).await;
    assert_eq!(body["allThreadsContinued"], true);
    let stopped = dap.wait_event("stopped").await;
    assert_eq!(stopped["body"]["reason"], "breakpoint");
    let (_, line, _) = dap.top_frame().await;
    assert_eq!(line, 3);

    dap.disconnect(json!({})).await;
}

#[tokio::test]
async fn step_over_stays_in_the_handler() {
    let mods = ModWorkspace::new();
    let script = mods.script("run");
    let mut dap = DapClient::start();

    dap.launch_to_stop(mods.launch_arguments("run"), &script, &[2])
        .await;
    dap.request_ok("next", json!({ "threadId": 1 })).await;
    let stopped = dap.wait_event("stopped").await;
    assert_eq!(stopped["body"]["reason"], "step");
    let (_, line, name) = dap.top_frame().await;
    assert_eq!((line, name.as_str()), (3, "on_tick handler"));

    dap.disconnect(json!({})).await;
}

#[tokio::test]
async fn stack_trace_pages_from_the_innermost_frame() {
    let mods = ModWorkspace::new();
    let script = mods.script("run");
    let mut dap = DapClient::start();

    dap.launch_to_stop(mods.launch_arguments("run"), &script, &[7])
        .await;

    let page = dap
        .request_ok(
            "stackTrace",
            json!({ "threadId": 1, "startFrame": 1, "levels": 1 }),
        )
        .await;
    assert_eq!(page["totalFrames"], 2);
    let frames = page["stackFrames"].as_array().unwrap();
    assert_eq!(frames.len(), 1);
    assert_eq!(frames[0]["name"], "on_tick handler");
    assert_eq!(frames[0]["line"], 3);

    dap.disconnect(json!({})).await;
}

#[tokio::test]
async fn requests_that_need_a_stop_fail_while_running() {
    let mods = ModWorkspace::new();
    let mut dap = DapClient::start();

    let launch = dap.launch(mods.launch_arguments("run")).await;
    assert_eq!(launch["success"], true, "{launch}");
    dap.wait_event("initialized").await;
    dap.request_ok("configurationDone", json!({})).await;

    for (command, arguments) in [
        ("continue", json!({ "threadId": 1 })),
        ("stepIn", json!({ "threadId": 1 })),
        ("stackTrace", json!({ "threadId": 1 })),
    ] {
        let response = dap.request(command, arguments).await;
        assert_eq!(response["success"], false, "{command}");
        assert_eq!(
            response["message"],
            format!("{command} is not allowed while the session is running")
        );
    }

    let again = dap.request("configurationDone", json!({})).await;
    assert_eq!(again["success"], false);

    dap.disconnect(json!({})).await;
}

#[tokio::test]
async fn stop_on_entry_stops_at_the_first_statement() {
    let mods = ModWorkspace::new();
    let mut dap = DapClient::start();

    let mut arguments = mods.launch_arguments("run");
    arguments["stopOnEntry"] = json!(true);
    let launch = dap.launch(arguments).await;
    assert_eq!(launch["success"], true, "{launch}");
    dap.wait_event("initialized").await;
    dap.request_ok("configurationDone", json!({})).await;

    let stopped = dap.wait_event("stopped").await;
    assert_eq!(stopped["body"]["reason"], "entry");
    let (_, line, _) = dap.top_frame().await;
    assert_eq!(line, 2);

    dap.disconnect(json!({})).await;
}

#[tokio::test]
async fn breakpoints_set_while_running_are_armed_at_the_next_stop() {
    let mods = ModWorkspace::new();
    let script = mods.script("run");
    let mut dap = DapClient::start();

    dap.launch_to_stop(mods.launch_arguments("run"), &script, &[2])
        .await;
    dap.request_ok("continue", json!({ "threadId": 1 })).await;

    let pending = dap.set_breakpoints(&script, &[2, 3]).await;
    assert_eq!(pending.len(), 2);
    assert_eq!(pending[1]["verified"], false);
    assert_eq!(pending[1]["message"], "pending until the target stops");

    // The deferred request is armed before the stop is reported, keeping the
    // ids handed out above.
    let mut changed = Vec::new();
    for _ in 0..2 {
        let event = dap.wait_event("breakpoint").await;
        assert_eq!(event["body"]["reason"], "changed");
        changed.push(event["body"]["breakpoint"].clone());
    }
    assert_eq!(changed[0]["id"], pending[0]["id"]);
    assert_eq!(changed[1]["id"], pending[1]["id"]);
    assert_eq!(changed[1]["verified"], true);

    dap.wait_event("stopped").await;
    dap.request_ok("continue", json!({ "threadId": 1 })).await;
    dap.wait_event("stopped").await;
    let (_, line, _) = dap.top_frame().await;
    assert_eq!(line, 3);

    dap.disconnect(json!({})).await;
}

#[tokio::test]
async fn breakpoints_on_blank_lines_are_unverified() {
    let mods = ModWorkspace::new();
    let script = mods.script("run");
    let mut dap = DapClient::start();

    let launch = dap.launch(mods.launch_arguments("run")).await;
    assert_eq!(launch["success"], true, "{launch}");
    dap.wait_event("initialized").await;

    let breakpoints = dap.set_breakpoints(&script, &[3, 5]).await;
    assert_eq!(breakpoints[0]["verified"], true);
    assert_eq!(breakpoints[1]["verified"], false);
    assert_eq!(breakpoints[1]["line"], 5);

    // Re-sending the same set keeps ids stable.
    let again = dap.set_breakpoints(&script, &[3, 5]).await;
    assert_eq!(again[0]["id"], breakpoints[0]["id"]);

    // An empty set clears the source.
    assert!(dap.set_breakpoints(&script, &[]).await.is_empty());

    dap.disconnect(json!({})).await;
}

#[tokio::test]
async fn conditions_and_logpoints() {
    let mods = ModWorkspace::new();
    let script = mods.script("run");
    let mut dap = DapClient::start();

    let launch = dap.launch(mods.launch_arguments("run")).await;
    assert_eq!(launch["success"], true, "{launch}");
    dap.wait_event("initialized").await;

    dap.request_ok(
        "setBreakpoints",
        json!({
            "source": { "path": script },
            "breakpoints": [
                { "line": 2, "condition": "false" },
                { "line": 3, "logMessage": "foo is {foo}" },
                { "line": 7 },
            ],
        }),
    )
    .await;
    dap.request_ok("configurationDone", json!({})).await;

    let log = dap.wait_output("foo is true").await;
    assert_eq!(log["body"]["category"], "console");
    assert_eq!(log["body"]["output"], "foo is true\n");

    // Line 2 never stops (false condition) and line 3 only logs.
    dap.wait_event("stopped").await;
    let (_, line, _) = dap.top_frame().await;
    assert_eq!(line, 7);

    dap.disconnect(json!({})).await;
}

#[tokio::test]
async fn stack_frames_use_the_client_spelling_of_the_source() {
    let mods = ModWorkspace::new();
    let script = mods.script("run");
    let spelled = script.replacen("/tests/scenarios/", "//tests/./scenarios/", 1);
    assert_ne!(spelled, script);
    let mut dap = DapClient::start();

    let launch = dap.launch(mods.launch_arguments("run")).await;
    assert_eq!(launch["success"], true, "{launch}");
    dap.wait_event("initialized").await;
    let breakpoints = dap.set_breakpoints(&spelled, &[3]).await;
    assert_eq!(breakpoints[0]["verified"], true);
    dap.request_ok("configurationDone", json!({})).await;
    dap.wait_event("stopped").await;

    let body = dap
        .request_ok("stackTrace", json!({ "threadId": 1 }))
        .await;
    let frames = body["stackFrames"].as_array().unwrap();
    assert_eq!(frames[0]["line"], 3);
    assert_eq!(frames[0]["source"]["path"], spelled.as_str());
    assert_eq!(frames[0]["source"]["name"], "control.lua");

    dap.disconnect(json!({})).await;
}
