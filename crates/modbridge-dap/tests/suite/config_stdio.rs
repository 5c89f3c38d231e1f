use serde_json::json;
use std::fs;
use std::io::{BufRead, BufReader, Read, Write};
use std::process::{Command, Stdio};
use tempfile::TempDir;

#[test]
fn stdio_server_loads_config_from_flag_and_initializes() {
    let temp = TempDir::new().expect("tempdir");
    let config_path = temp.path().join("modbridge.toml");
    let log_path = temp.path().join("modbridge.log");
    fs::write(
        &config_path,
        format!(
            "[logging]\nlevel = \"debug\"\nstderr = false\nfile = {:?}\n\n[adapter]\nkill_grace_ms = 500\n",
            log_path.display().to_string()
        ),
    )
    .expect("write config");

    let mut child = Command::new(env!("CARGO_BIN_EXE_modbridge-dap"))
        .arg("--config")
        .arg(&config_path)
        .env_remove("MODBRIDGE_CONFIG")
        .env_remove("RUST_LOG")
        .stdin(Stdio::piped())
        .stdout(Stdio::piped())
        .spawn()
        .expect("spawn modbridge-dap");

    let mut stdin = child.stdin.take().expect("stdin");
    let stdout = child.stdout.take().expect("stdout");
    let mut stdout = BufReader::new(stdout);

    write_dap_message(
        &mut stdin,
        &json!({
            "seq": 1,
            "type": "request",
            "command": "initialize",
            "arguments": {}
        }),
    );
    let initialize_resp = read_dap_response(&mut stdout, 1);
    assert_eq!(initialize_resp["success"], true);
    assert_eq!(
        initialize_resp["body"]["supportsConfigurationDoneRequest"],
        true
    );

    write_dap_message(
        &mut stdin,
        &json!({
            "seq": 2,
            "type": "request",
            "command": "disconnect",
            "arguments": {}
        }),
    );
    let disconnect_resp = read_dap_response(&mut stdout, 2);
    assert_eq!(disconnect_resp["success"], true);

    drop(stdin);
    let status = child.wait().expect("wait");
    assert!(status.success());

    // Debug logging went to the configured file, not stdout.
    let log = fs::read_to_string(&log_path).expect("log file");
    assert!(log.contains("request"), "{log}");
}

#[test]
fn broken_config_falls_back_to_defaults() {
    let temp = TempDir::new().expect("tempdir");
    let config_path = temp.path().join("modbridge.toml");
    fs::write(&config_path, "[adapter]\nkill_grace_ms = \"soon\"\n").expect("write config");

    let mut child = Command::new(env!("CARGO_BIN_EXE_modbridge-dap"))
        .env("MODBRIDGE_CONFIG", &config_path)
        .stdin(Stdio::piped())
        .stdout(Stdio::piped())
        .stderr(Stdio::piped())
        .spawn()
        .expect("spawn modbridge-dap");

    let mut stdin = child.stdin.take().expect("stdin");
    let mut stdout = BufReader::new(child.stdout.take().expect("stdout"));

    write_dap_message(
        &mut stdin,
        &json!({ "seq": 1, "type": "request", "command": "initialize", "arguments": {} }),
    );
    assert_eq!(read_dap_response(&mut stdout, 1)["success"], true);

    // Closing stdin ends the session.
    drop(stdin);
    let status = child.wait().expect("wait");
    assert!(status.success());

    let mut stderr = String::new();
    child
        .stderr
        .take()
        .expect("stderr")
        .read_to_string(&mut stderr)
        .expect("read stderr");
    assert!(
        stderr.contains("failed to load config") && stderr.contains("continuing with defaults"),
        "{stderr}"
    );
}

fn write_dap_message(writer: &mut impl Write, message: &serde_json::Value) {
    let bytes = serde_json::to_vec(message).expect("serialize");
    write!(writer, "Content-Length: {}\r\n\r\n", bytes.len()).expect("write header");
    writer.write_all(&bytes).expect("write body");
    writer.flush().expect("flush");
}

fn read_dap_response(reader: &mut impl BufRead, request_seq: i64) -> serde_json::Value {
    loop {
        let msg = read_dap_message(reader);
        if msg.get("type").and_then(|v| v.as_str()) == Some("response")
            && msg.get("request_seq").and_then(|v| v.as_i64()) == Some(request_seq)
        {
            return msg;
        }
    }
}

fn read_dap_message(reader: &mut impl BufRead) -> serde_json::Value {
    let mut content_length: Option<usize> = None;

    loop {
        let mut line = String::new();
        let bytes_read = reader.read_line(&mut line).expect("read header line");
        assert!(bytes_read > 0, "unexpected EOF while reading headers");

        let line = line.trim_end_matches(['\r', '\n']);
        if line.is_empty() {
            break;
        }

        if let Some((name, value)) = line.split_once(':') {
            if name.eq_ignore_ascii_case("Content-Length") {
                content_length = value.trim().parse::<usize>().ok();
            }
        }
    }

    let len = content_length.expect("Content-Length header");
    let mut buf = vec![0u8; len];
    reader.read_exact(&mut buf).expect("read body");
    serde_json::from_slice(&buf).expect("parse json")
}
