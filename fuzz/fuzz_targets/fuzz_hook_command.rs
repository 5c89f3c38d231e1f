// Run locally (from the repo root):
//   cargo +nightly fuzz run fuzz_hook_command -- -runs=1000
#![no_main]

use libfuzzer_sys::fuzz_target;
use modbridge_wire::wire::codec::{decode_command, encode_command};
use modbridge_wire::wire::mock::parse_literal;

mod utils;

fuzz_target!(|data: &[u8]| {
    let Some(text) = utils::truncate_utf8(data) else {
        return;
    };

    // Oracle: whatever the hook accepts re-encodes to a line it accepts again.
    if let Ok(command) = decode_command(text) {
        let line = encode_command(&command).expect("commands always serialize");
        let line = String::from_utf8(line).expect("encoded commands are UTF-8");
        assert!(decode_command(&line).is_ok(), "re-encoded command rejected: {line:?}");
    }

    let _ = parse_literal(text);
});
