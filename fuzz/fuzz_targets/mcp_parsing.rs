#![no_main]

use libfuzzer_sys::fuzz_target;

fuzz_target!(|data: &[u8]| {
    let s = String::from_utf8_lossy(data);

    if let Err(resp) = droidnotify_mcp::parse_message(&s) {
        assert!(resp.error.is_some());
    }
});
