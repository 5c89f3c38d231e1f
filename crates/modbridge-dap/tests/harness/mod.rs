//! In-process DAP client that drives `server::run` over a duplex pipe, plus a
//! throwaway mod directory for the `modbridge_test_target` fixture.

use std::{collections::VecDeque, fs, path::Path, time::Duration};

use modbridge_config::BridgeConfig;
use modbridge_dap::dap::codec::{DapReader, DapWriter};
use modbridge_dap::server;
use serde_json::{json, Value};
use tempfile::TempDir;
use tokio::io::{DuplexStream, ReadHalf, WriteHalf};
use tokio::task::JoinHandle;

pub const TARGET_BIN: &str = env!("CARGO_BIN_EXE_modbridge_test_target");

const READ_TIMEOUT: Duration = Duration::from_secs(15);

pub struct DapClient {
    reader: DapReader<ReadHalf<DuplexStream>>,
    writer: DapWriter<WriteHalf<DuplexStream>>,
    next_seq: i64,
    /// Messages read while waiting for something else, in arrival order.
    backlog: VecDeque<Value>,
    server: JoinHandle<server::Result<()>>,
}

impl DapClient {
    pub fn start() -> Self {
        Self::with_config(BridgeConfig::default())
    }

    pub fn with_config(config: BridgeConfig) -> Self {
        let (client, server_stream) = tokio::io::duplex(256 * 1024);
        let (server_read, server_write) = tokio::io::split(server_stream);
        let server =
            tokio::spawn(async move { server::run(server_read, server_write, config).await });

        let (client_read, client_write) = tokio::io::split(client);
        Self {
            reader: DapReader::new(client_read),
            writer: DapWriter::new(client_write),
            next_seq: 1,
            backlog: VecDeque::new(),
            server,
        }
    }

    pub async fn send(&mut self, command: &str, arguments: Value) -> i64 {
        let seq = self.next_seq;
        self.next_seq += 1;
        let msg = json!({
            "seq": seq,
            "type": "request",
            "command": command,
            "arguments": arguments,
        });
        self.writer.write_value(&msg).await.unwrap();
        seq
    }

    /// Send a request and wait for its response.
    pub async fn request(&mut self, command: &str, arguments: Value) -> Value {
        let seq = self.send(command, arguments).await;
        self.wait_response(seq).await
    }

    /// Like [`DapClient::request`], but panics unless the request succeeded.
    pub async fn request_ok(&mut self, command: &str, arguments: Value) -> Value {
        let response = self.request(command, arguments).await;
        assert_eq!(response["success"], true, "{command} failed: {response}");
        response.get("body").cloned().unwrap_or(Value::Null)
    }

    async fn read_next(&mut self) -> Value {
        tokio::time::timeout(READ_TIMEOUT, self.reader.read_value())
            .await
            .expect("timed out waiting for a DAP message")
            .unwrap()
            .expect("server closed the stream")
    }

    async fn wait_for(&mut self, matches: impl Fn(&Value) -> bool) -> Value {
        if let Some(pos) = self.backlog.iter().position(&matches) {
            return self.backlog.remove(pos).unwrap();
        }
        loop {
            let msg = self.read_next().await;
            if matches(&msg) {
                return msg;
            }
            self.backlog.push_back(msg);
        }
    }

    pub async fn wait_response(&mut self, request_seq: i64) -> Value {
        self.wait_for(|msg| msg["type"] == "response" && msg["request_seq"] == request_seq)
            .await
    }

    /// The earliest `name` event not consumed yet.
    pub async fn wait_event(&mut self, name: &str) -> Value {
        self.wait_for(|msg| msg["type"] == "event" && msg["event"] == name)
            .await
    }

    /// Wait for an `output` event whose text contains `needle`.
    pub async fn wait_output(&mut self, needle: &str) -> Value {
        self.wait_for(|msg| {
            msg["type"] == "event"
                && msg["event"] == "output"
                && msg["body"]["output"]
                    .as_str()
                    .is_some_and(|output| output.contains(needle))
        })
        .await
    }

    /// Events of kind `name` already read but not consumed.
    pub fn seen_events(&self, name: &str) -> Vec<Value> {
        self.backlog
            .iter()
            .filter(|msg| msg["type"] == "event" && msg["event"] == name)
            .cloned()
            .collect()
    }

    /// `initialize` + `launch`; returns the launch response.
    pub async fn launch(&mut self, arguments: Value) -> Value {
        self.request_ok("initialize", json!({ "adapterID": "modbridge" }))
            .await;
        self.request("launch", arguments).await
    }

    /// Launch, arm `lines` in `source` and start the target; returns once it
    /// stopped.
    pub async fn launch_to_stop(&mut self, arguments: Value, source: &str, lines: &[u32]) -> Value {
        let launch = self.launch(arguments).await;
        assert_eq!(launch["success"], true, "{launch}");
        self.wait_event("initialized").await;
        self.set_breakpoints(source, lines).await;
        self.request_ok("configurationDone", json!({})).await;
        self.wait_event("stopped").await
    }

    pub async fn set_breakpoints(&mut self, source: &str, lines: &[u32]) -> Vec<Value> {
        let breakpoints: Vec<Value> = lines.iter().map(|line| json!({ "line": line })).collect();
        let body = self
            .request_ok(
                "setBreakpoints",
                json!({ "source": { "path": source }, "breakpoints": breakpoints }),
            )
            .await;
        body["breakpoints"].as_array().cloned().unwrap_or_default()
    }

    /// `(frame id, line, name)` of the innermost frame.
    pub async fn top_frame(&mut self) -> (i64, u64, String) {
        let body = self
            .request_ok("stackTrace", json!({ "threadId": 1, "levels": 1 }))
            .await;
        let frame = &body["stackFrames"][0];
        (
            frame["id"].as_i64().unwrap(),
            frame["line"].as_u64().unwrap(),
            frame["name"].as_str().unwrap().to_string(),
        )
    }

    pub async fn scope_reference(&mut self, frame_id: i64, name: &str) -> i64 {
        let body = self.request_ok("scopes", json!({ "frameId": frame_id })).await;
        body["scopes"]
            .as_array()
            .unwrap()
            .iter()
            .find(|scope| scope["name"] == name)
            .and_then(|scope| scope["variablesReference"].as_i64())
            .unwrap_or_else(|| panic!("no scope named {name}: {body}"))
    }

    pub async fn variables(&mut self, reference: i64) -> Vec<Value> {
        let body = self
            .request_ok("variables", json!({ "variablesReference": reference }))
            .await;
        body["variables"].as_array().cloned().unwrap_or_default()
    }

    /// Send `disconnect` and wait for the server loop to finish.
    pub async fn disconnect(mut self, arguments: Value) -> Value {
        let response = self.request("disconnect", arguments).await;
        let result = tokio::time::timeout(READ_TIMEOUT, self.server)
            .await
            .expect("server did not stop after disconnect")
            .unwrap();
        assert!(result.is_ok(), "{result:?}");
        response
    }

    /// Drop the client side and return the server's result.
    pub async fn close(self) -> server::Result<()> {
        let DapClient {
            reader,
            writer,
            server,
            ..
        } = self;
        drop(writer);
        drop(reader);
        tokio::time::timeout(READ_TIMEOUT, server)
            .await
            .expect("server did not stop after the client went away")
            .unwrap()
    }

    pub fn writer(&mut self) -> &mut DapWriter<WriteHalf<DuplexStream>> {
        &mut self.writer
    }
}

/// A temporary mod directory with a `tests` mod providing the mock scenarios.
pub struct ModWorkspace {
    dir: TempDir,
}

impl ModWorkspace {
    pub fn new() -> Self {
        let dir = TempDir::new().unwrap();
        fs::write(
            dir.path().join("mod-list.json"),
            serde_json::to_vec_pretty(&json!({
                "mods": [
                    { "name": "base", "enabled": true },
                    { "name": "tests", "enabled": true },
                    { "name": "other", "enabled": true },
                ]
            }))
            .unwrap(),
        )
        .unwrap();
        Self { dir }
    }

    pub fn path(&self) -> &Path {
        self.dir.path()
    }

    /// Path the target reports for `scenario`'s script.
    pub fn script(&self, scenario: &str) -> String {
        self.path()
            .join("tests")
            .join("scenarios")
            .join(scenario)
            .join("control.lua")
            .display()
            .to_string()
    }

    pub fn launch_arguments(&self, scenario: &str) -> Value {
        json!({
            "program": TARGET_BIN,
            "args": ["--load-scenario", format!("tests/{scenario}")],
            "modsPath": self.path(),
        })
    }

    pub fn mod_list(&self) -> Value {
        let text = fs::read_to_string(self.path().join("mod-list.json")).unwrap();
        serde_json::from_str(&text).unwrap()
    }
}

pub fn mod_enabled(list: &Value, name: &str) -> Option<bool> {
    list["mods"]
        .as_array()?
        .iter()
        .find(|entry| entry["name"] == name)
        .and_then(|entry| entry["enabled"].as_bool())
}
