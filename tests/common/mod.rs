//! Process liveness helpers shared by the integration tests.

#![allow(dead_code)]

use std::path::Path;
use std::time::Duration;

/// Whether `pid` names a live (non-zombie) process
#[cfg(target_os = "linux")]
pub fn is_running(pid: u32) -> bool {
    match std::fs::read_to_string(format!("/proc/{}/stat", pid)) {
        Ok(stat) => stat
            .rsplit(')')
            .next()
            .map(|rest| !rest.trim_start().starts_with('Z'))
            .unwrap_or(false),
        Err(_) => false,
    }
}

/// Allow a just-killed process a moment to finish dying
#[cfg(target_os = "linux")]
pub async fn stopped_soon(pid: u32) -> bool {
    for _ in 0..25 {
        if !is_running(pid) {
            return true;
        }
        tokio::time::sleep(Duration::from_millis(20)).await;
    }
    false
}

pub fn read_pid(path: &Path) -> u32 {
    std::fs::read_to_string(path)
        .unwrap()
        .trim()
        .parse()
        .unwrap()
}
