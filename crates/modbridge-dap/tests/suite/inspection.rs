use serde_json::json;

use crate::harness::{DapClient, ModWorkspace};

async fn stopped_at_line_3(mods: &ModWorkspace) -> DapClient {
    let mut dap = DapClient::start();
    let script = mods.script("run");
    dap.launch_to_stop(mods.launch_arguments("run"), &script, &[3])
        .await;
    dap
}

#[tokio::test]
async fn scopes_and_variables() {
    let mods = ModWorkspace::new();
    let mut dap = stopped_at_line_3(&mods).await;
    let (frame_id, _, _) = dap.top_frame().await;

    let body = dap.request_ok("scopes", json!({ "frameId": frame_id })).await;
    let scopes = body["scopes"].as_array().unwrap();
    let names: Vec<&str> = scopes.iter().map(|s| s["name"].as_str().unwrap()).collect();
    assert_eq!(names, ["Locals", "Upvalues", "Runtime Global", "Host Globals"]);
    assert!(scopes
        .iter()
        .all(|scope| scope["variablesReference"].as_i64().unwrap() > 0));

    let locals = dap.scope_reference(frame_id, "Locals").await;
    let vars = dap.variables(locals).await;
    assert_eq!(vars.len(), 2, "{vars:?}");
    assert_eq!(vars[0]["name"], "<temporaries>");
    assert_eq!(vars[0]["presentationHint"]["kind"], "virtual");
    assert!(vars[0].get("type").is_none());
    assert_eq!(vars[1]["name"], "foo");
    assert_eq!(vars[1]["value"], "true");
    assert_eq!(vars[1]["type"], "boolean");

    // Temporaries expand like any other container.
    let temporaries = vars[0]["variablesReference"].as_i64().unwrap();
    let inner = dap.variables(temporaries).await;
    assert_eq!(inner[0]["name"], "(*temporary)");
    assert_eq!(inner[0]["type"], "number");

    let paged = dap
        .request_ok(
            "variables",
            json!({ "variablesReference": locals, "start": 1, "count": 1 }),
        )
        .await;
    assert_eq!(paged["variables"].as_array().unwrap().len(), 1);
    assert_eq!(paged["variables"][0]["name"], "foo");

    dap.disconnect(json!({})).await;
}

#[tokio::test]
async fn set_variable_updates_the_target() {
    let mods = ModWorkspace::new();
    let mut dap = stopped_at_line_3(&mods).await;
    let (frame_id, _, _) = dap.top_frame().await;
    let locals = dap.scope_reference(frame_id, "Locals").await;

    let body = dap
        .request_ok(
            "setVariable",
            json!({ "variablesReference": locals, "name": "foo", "value": "\"bar\"" }),
        )
        .await;
    assert_eq!(body["value"], "\"bar\"");
    assert_eq!(body["type"], "string");

    let vars = dap.variables(locals).await;
    assert_eq!(vars[1]["value"], "\"bar\"");

    // The target runs on with the new value.
    dap.request_ok("stepIn", json!({ "threadId": 1 })).await;
    dap.wait_event("stopped").await;
    let (frame_id, line, _) = dap.top_frame().await;
    assert_eq!(line, 7);
    let locals = dap.scope_reference(frame_id, "Locals").await;
    let vars = dap.variables(locals).await;
    let flag = vars.iter().find(|v| v["name"] == "flag").unwrap();
    assert_eq!(flag["value"], "\"bar\"");

    let rejected = dap
        .request(
            "setVariable",
            json!({ "variablesReference": locals, "name": "missing", "value": "1" }),
        )
        .await;
    assert_eq!(rejected["success"], false);
    assert_eq!(rejected["message"], "no variable named missing");

    dap.disconnect(json!({})).await;
}

#[tokio::test]
async fn evaluate_in_frames_and_globally() {
    let mods = ModWorkspace::new();
    let mut dap = stopped_at_line_3(&mods).await;
    let (frame_id, _, _) = dap.top_frame().await;

    let repl = dap
        .request_ok(
            "evaluate",
            json!({ "expression": "foo", "frameId": frame_id, "context": "repl" }),
        )
        .await;
    let result = repl["result"].as_str().unwrap();
    assert!(result.starts_with("true\n⏱️ "), "{result}");
    assert!(result.ends_with("ms"), "{result}");
    assert_eq!(repl["type"], "boolean");

    let hover = dap
        .request_ok(
            "evaluate",
            json!({ "expression": "\"hello\"", "frameId": frame_id, "context": "hover" }),
        )
        .await;
    assert_eq!(hover["result"], "\"hello\"");
    assert_eq!(hover["type"], "string");

    // Without a frame the expression sees the host globals, where `foo` does
    // not exist.
    let global = dap
        .request_ok("evaluate", json!({ "expression": "foo", "context": "watch" }))
        .await;
    assert_eq!(global["result"], "nil");
    assert_eq!(global["type"], "nil");

    let failed = dap
        .request("evaluate", json!({ "expression": "foo +", "frameId": frame_id }))
        .await;
    assert_eq!(failed["success"], false);

    // The session survives failed evaluations.
    dap.request_ok("continue", json!({ "threadId": 1 })).await;
    dap.wait_event("stopped").await;

    dap.disconnect(json!({})).await;
}

#[tokio::test]
async fn references_do_not_survive_a_resume() {
    let mods = ModWorkspace::new();
    let mut dap = stopped_at_line_3(&mods).await;
    let (frame_id, _, _) = dap.top_frame().await;
    let locals = dap.scope_reference(frame_id, "Locals").await;

    dap.request_ok("continue", json!({ "threadId": 1 })).await;
    dap.wait_event("stopped").await;

    let stale = dap
        .request("variables", json!({ "variablesReference": locals }))
        .await;
    assert_eq!(stale["success"], false);
    assert_eq!(
        stale["message"],
        format!("reference {locals} is no longer valid; the target has resumed since it was issued")
    );

    let stale_frame = dap.request("scopes", json!({ "frameId": frame_id })).await;
    assert_eq!(stale_frame["success"], false);

    let unknown = dap
        .request("variables", json!({ "variablesReference": 1_000_000 }))
        .await;
    assert_eq!(unknown["success"], false);

    // Fresh references work.
    let (frame_id, _, _) = dap.top_frame().await;
    let locals = dap.scope_reference(frame_id, "Locals").await;
    assert_eq!(dap.variables(locals).await.len(), 2);

    dap.disconnect(json!({})).await;
}

#[tokio::test]
async fn frame_references_are_not_containers() {
    let mods = ModWorkspace::new();
    let mut dap = stopped_at_line_3(&mods).await;
    let (frame_id, _, _) = dap.top_frame().await;

    let response = dap
        .request("variables", json!({ "variablesReference": frame_id }))
        .await;
    assert_eq!(response["success"], false);
    assert_eq!(
        response["message"],
        format!("reference {frame_id} does not name a variable container")
    );

    dap.disconnect(json!({})).await;
}
