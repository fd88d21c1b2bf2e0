#![no_main]

use libfuzzer_sys::fuzz_target;

fuzz_target!(|data: &[u8]| {
    let s = String::from_utf8_lossy(data);

    if let Ok(records) = droidnotify_monitor::parse_snapshot(&s) {
        for r in &records {
            let v = serde_json::to_value(r).expect("serialize record");
            assert_eq!(droidnotify_core::NotificationRecord::validate(&v).ok().as_ref(), Some(r));
        }
    }
    if let Ok(v) = serde_json::from_str::<serde_json::Value>(&s) {
        let _ = droidnotify_core::NotificationRecord::validate(&v);
    }
});
