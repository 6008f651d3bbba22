#![no_main]

use std::io::Cursor;

use libfuzzer_sys::fuzz_target;
use zbr_agent::LifecycleController;
use zbr_cli::{replay_libtest, ReplayOptions};

fuzz_target!(|data: &[u8]| {
    let mut listener = LifecycleController::disabled();
    let options = ReplayOptions {
        suite_name: "fuzz".to_string(),
        attachments: Vec::new(),
    };
    let raw = String::from_utf8_lossy(data);
    let summary = replay_libtest(&mut listener, Cursor::new(raw.as_bytes()), &options)
        .expect("a disabled listener never fails");
    assert!(listener.run_id().is_none());
    assert!(summary.passed + summary.failed + summary.ignored <= raw.lines().count());
});
