// telemetry_client/src/staleness.rs

//! 设备数据新鲜度跟踪。
//!
//! 超过窗口期没有收到遥测的设备视为“数据过期”，从未收到过遥测的设备同样视为过期。
//! 时间由调用方传入，便于测试。

use std::collections::HashMap;
use std::time::{Duration, Instant};

#[derive(Debug, Clone)]
pub struct StalenessTracker {
    window: Duration,
    last_seen: HashMap<String, Instant>,
}

impl StalenessTracker {
    pub fn new(window: Duration) -> Self {
        Self { window, last_seen: HashMap::new() }
    }

    pub fn window(&self) -> Duration {
        self.window
    }

    /// 记录设备在 `at` 时刻收到了一条遥测。较早的时间戳不会覆盖较新的记录。
    pub fn record(&mut self, device_id: &str, at: Instant) {
        let entry = self.last_seen.entry(device_id.to_string()).or_insert(at);
        if at > *entry {
            *entry = at;
        }
    }

    pub fn is_stale(&self, device_id: &str, now: Instant) -> bool {
        match self.last_seen.get(device_id) {
            Some(seen) => now.saturating_duration_since(*seen) > self.window,
            None => true,
        }
    }

    /// 已记录过的设备中数据过期的那些，按设备标识排序。
    pub fn stale_devices(&self, now: Instant) -> Vec<String> {
        let mut stale: Vec<String> = self
            .last_seen
            .keys()
            .filter(|device_id| self.is_stale(device_id, now))
            .cloned()
            .collect();
        stale.sort();
        stale
    }

    pub fn forget(&mut self, device_id: &str) -> bool {
        self.last_seen.remove(device_id).is_some()
    }
}
