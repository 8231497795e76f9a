//! Sleeping guinea pig: every sample should land in the sleep syscall.

use std::thread;
use std::time::Duration;

fn main() {
    loop {
        thread::sleep(Duration::from_secs(3600));
    }
}
