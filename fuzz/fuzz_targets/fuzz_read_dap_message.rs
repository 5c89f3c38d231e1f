// Run locally (from the repo root):
//   cargo +nightly fuzz run fuzz_read_dap_message -- -runs=1000
#![no_main]

use std::sync::OnceLock;
use std::time::Duration;

use libfuzzer_sys::fuzz_target;
use modbridge_dap::dap::codec::DapReader;
use tokio::io::AsyncWriteExt as _;

mod utils;

const TIMEOUT: Duration = Duration::from_secs(1);

fn runtime() -> &'static tokio::runtime::Runtime {
    static RUNTIME: OnceLock<tokio::runtime::Runtime> = OnceLock::new();
    RUNTIME.get_or_init(|| {
        tokio::runtime::Builder::new_current_thread()
            .enable_all()
            .build()
            .expect("build tokio runtime")
    })
}

fuzz_target!(|data: &[u8]| {
    let input = utils::truncate(data);

    // Oracle: malformed framing is an error, never a panic or a hang.
    runtime().block_on(async {
        let (mut writer, reader) = tokio::io::duplex(input.len().max(1));
        let _ = writer.write_all(input).await;
        let _ = writer.shutdown().await;
        drop(writer);

        let mut reader = DapReader::new(reader);
        let drained = tokio::time::timeout(TIMEOUT, async {
            // Every message consumes input, so this terminates at EOF.
            while let Ok(Some(_)) = reader.read_value().await {}
        })
        .await;
        if drained.is_err() {
            panic!("DapReader::read_value timed out");
        }
    });
});
