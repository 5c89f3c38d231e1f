use serde_json::json;

use crate::harness::{mod_enabled, DapClient, ModWorkspace};

#[tokio::test]
async fn launch_runs_the_scenario_until_the_target_exits() {
    let mods = ModWorkspace::new();
    let mut dap = DapClient::start();

    let launch = dap.launch(mods.launch_arguments("terminate")).await;
    assert_eq!(launch["success"], true, "{launch}");

    let process = dap.wait_event("process").await;
    assert_eq!(process["body"]["startMethod"], "launch");
    assert!(process["body"]["systemProcessId"].as_u64().is_some(), "{process}");

    // Nothing is configured before the hook reports in.
    dap.wait_event("initialized").await;
    dap.request_ok("configurationDone", json!({})).await;

    let output = dap.wait_output("loading scenario terminate").await;
    assert_eq!(output["body"]["category"], "stdout");

    let exited = dap.wait_event("exited").await;
    assert_eq!(exited["body"]["exitCode"], 0);
    dap.wait_event("terminated").await;

    let disconnect = dap.disconnect(json!({})).await;
    assert_eq!(disconnect["success"], true);
}

#[tokio::test]
async fn invalid_target_arguments_fail_before_spawning() {
    let mods = ModWorkspace::new();
    let mut dap = DapClient::start();

    let mut arguments = mods.launch_arguments("run");
    arguments["args"] = json!(["--load-scenario", "tests/run", "--config"]);
    let launch = dap.launch(arguments).await;
    assert_eq!(launch["success"], false);
    assert_eq!(launch["message"], "argument --config expects a value");
    assert!(dap.seen_events("process").is_empty());

    let mut arguments = mods.launch_arguments("run");
    arguments["args"] = json!(["--load-scenario", "tests/run", "--load-game", "save"]);
    let launch = dap.request("launch", arguments).await;
    assert_eq!(launch["success"], false);
    assert_eq!(
        launch["message"],
        "arguments --load-scenario and --load-game cannot be combined"
    );

    assert!(dap.close().await.is_ok());
}

#[tokio::test]
async fn launch_requires_a_program() {
    let mut dap = DapClient::start();
    let launch = dap.launch(json!({ "args": [] })).await;
    assert_eq!(launch["success"], false);
    assert_eq!(launch["message"], "launch.program is required");
}

#[tokio::test]
async fn mod_overrides_are_written_before_the_target_starts() {
    let mods = ModWorkspace::new();
    let mut dap = DapClient::start();

    let mut arguments = mods.launch_arguments("terminate");
    arguments["disableExtraMods"] = json!(true);
    arguments["adjustMods"] = json!({ "base": true, "tests": true, "pinned": "1.1.0" });
    let launch = dap.launch(arguments).await;
    assert_eq!(launch["success"], true, "{launch}");

    let list = mods.mod_list();
    assert_eq!(mod_enabled(&list, "base"), Some(true));
    assert_eq!(mod_enabled(&list, "tests"), Some(true));
    assert_eq!(mod_enabled(&list, "other"), Some(false));
    assert_eq!(mod_enabled(&list, "debugadapter"), Some(true));
    assert_eq!(mod_enabled(&list, "pinned"), Some(true));

    dap.wait_event("initialized").await;
    dap.request_ok("configurationDone", json!({})).await;
    dap.wait_event("terminated").await;
}

#[tokio::test]
async fn mod_overrides_that_break_the_session_are_rejected() {
    let mods = ModWorkspace::new();
    let mut dap = DapClient::start();

    let mut arguments = mods.launch_arguments("run");
    arguments["adjustMods"] = json!({ "base": false });
    let launch = dap.launch(arguments).await;
    assert_eq!(launch["success"], false);
    assert_eq!(
        launch["message"],
        "cannot disable base mod \"base\" without allowDisableBaseMod"
    );

    let mut arguments = mods.launch_arguments("run");
    arguments["adjustMods"] = json!({ "tests": false });
    let launch = dap.request("launch", arguments).await;
    assert_eq!(launch["success"], false);
    assert!(
        launch["message"].as_str().unwrap().contains("provides the scenario"),
        "{launch}"
    );

    // Rejected launches leave the mod list untouched.
    assert_eq!(mod_enabled(&mods.mod_list(), "debugadapter"), None);
}

#[tokio::test]
async fn disconnect_terminates_a_launched_target() {
    let mods = ModWorkspace::new();
    let mut dap = DapClient::start();

    let launch = dap.launch(mods.launch_arguments("run")).await;
    assert_eq!(launch["success"], true, "{launch}");
    dap.wait_event("initialized").await;
    dap.request_ok("configurationDone", json!({})).await;

    let response = dap.disconnect(json!({})).await;
    assert_eq!(response["success"], true);
}

#[tokio::test]
async fn terminate_ends_the_session_once() {
    let mods = ModWorkspace::new();
    let mut dap = DapClient::start();

    let launch = dap.launch(mods.launch_arguments("run")).await;
    assert_eq!(launch["success"], true, "{launch}");
    dap.wait_event("initialized").await;
    dap.request_ok("configurationDone", json!({})).await;

    dap.request_ok("terminate", json!({})).await;
    dap.wait_event("terminated").await;

    // The session is over; requests that need a live target fail.
    let trace = dap.request("stackTrace", json!({ "threadId": 1 })).await;
    assert_eq!(trace["success"], false);
    assert_eq!(
        trace["message"],
        "stackTrace is not allowed while the session is terminated"
    );
    assert!(dap.seen_events("terminated").is_empty());
}
