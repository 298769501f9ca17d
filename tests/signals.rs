#![cfg(unix)]

use podsync_lib::sync::{install_interrupt_handler, CancelToken};
use std::process::Command;
use std::thread;
use std::time::{Duration, Instant};

#[test]
fn sigterm_cancels_a_running_sync() {
    let token = CancelToken::new();
    install_interrupt_handler(&token).unwrap();
    assert!(!token.is_cancelled());

    let status = Command::new("kill")
        .args(["-TERM", &std::process::id().to_string()])
        .status()
        .unwrap();
    assert!(status.success());

    let deadline = Instant::now() + Duration::from_secs(5);
    while !token.is_cancelled() && Instant::now() < deadline {
        thread::sleep(Duration::from_millis(10));
    }
    assert!(token.is_cancelled());
}
