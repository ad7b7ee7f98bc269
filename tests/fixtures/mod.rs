pub mod surrogate;

use std::time::{Duration, Instant};

/// Poll until `predicate` holds, panicking after `timeout`.
pub fn wait_until(what: &str, timeout: Duration, mut predicate: impl FnMut() -> bool) {
    let started = Instant::now();
    while !predicate() {
        if started.elapsed() > timeout {
            panic!("timed out waiting for {what}");
        }
        std::thread::sleep(Duration::from_millis(10));
    }
}
