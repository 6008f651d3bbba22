#![no_main]

use libfuzzer_sys::fuzz_target;
use zbr_cli::{parse_event_line, LibtestEvent};

fuzz_target!(|data: &[u8]| {
    let raw = String::from_utf8_lossy(data);
    for line in raw.lines() {
        match parse_event_line(line) {
            Ok(Some(LibtestEvent::Test(event))) => {
                assert!(event.name.ends_with(event.short_name()));
            }
            Ok(None) => assert!(line.trim().is_empty()),
            Ok(Some(_)) | Err(_) => {}
        }
    }
});
