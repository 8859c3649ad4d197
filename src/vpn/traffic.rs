//! Traffic sampler - per-interface byte counters and rolling speeds
//!
//! Picks the tunnel interface by name (tun/wintun/utun/...), falling back
//! to the sum of all non-virtual interfaces while connected. Only the last
//! sample is retained between calls; it is cleared whenever the engine is
//! not connected so stale deltas never produce phantom speeds.

use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use std::time::Instant;
use sysinfo::Networks;

/// Interface names that identify the tunnel device.
const TUN_NAME_PARTS: &[&str] = &[
    "tun", "wintun", "utun", "tap", "wg-", "wireguard", "vpn", "sing",
];

/// Interfaces excluded from the all-interfaces fallback sum.
const EXCLUDE_NAME_PARTS: &[&str] = &[
    "lo", "loopback", "bluetooth", "vmware", "vbox", "virtualbox",
];

/// Rolling traffic numbers returned by `/api/traffic`.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct TrafficStats {
    pub upload: i64,
    pub download: i64,
    pub download_speed: i64,
    pub upload_speed: i64,
    pub started_at: i64,
}

struct Sample {
    recv: u64,
    sent: u64,
    at: Instant,
}

pub struct TrafficSampler {
    networks: Mutex<Networks>,
    last: Mutex<Option<Sample>>,
}

impl TrafficSampler {
    pub fn new() -> Self {
        Self {
            networks: Mutex::new(Networks::new_with_refreshed_list()),
            last: Mutex::new(None),
        }
    }

    /// Take a sample. When not connected, the previous sample is dropped
    /// and empty stats are returned.
    pub fn sample(&self, connected: bool) -> TrafficStats {
        if !connected {
            *self.last.lock() = None;
            return TrafficStats::default();
        }

        let counters = {
            let mut networks = self.networks.lock();
            networks.refresh_list();
            select_counters(&networks, connected)
        };
        let (recv, sent) = match counters {
            Some(pair) => pair,
            None => return TrafficStats::default(),
        };

        let now = Instant::now();
        let mut last = self.last.lock();
        let (download_speed, upload_speed) = match last.as_ref() {
            Some(prev) => {
                let elapsed = now.duration_since(prev.at).as_secs_f64();
                derive_speeds(prev.recv, prev.sent, recv, sent, elapsed)
            }
            None => (0, 0),
        };
        *last = Some(Sample {
            recv,
            sent,
            at: now,
        });

        TrafficStats {
            upload: sent as i64,
            download: recv as i64,
            download_speed,
            upload_speed,
            started_at: 0,
        }
    }
}

impl Default for TrafficSampler {
    fn default() -> Self {
        Self::new()
    }
}

/// First tunnel-named interface, else (while connected) the sum over all
/// interfaces except loopback and the usual virtual adapters.
fn select_counters(networks: &Networks, connected: bool) -> Option<(u64, u64)> {
    for (name, data) in networks.iter() {
        let lower = name.to_lowercase();
        if TUN_NAME_PARTS.iter().any(|part| lower.contains(part)) {
            return Some((data.total_received(), data.total_transmitted()));
        }
    }
    if !connected {
        return None;
    }
    let mut recv = 0u64;
    let mut sent = 0u64;
    for (name, data) in networks.iter() {
        let lower = name.to_lowercase();
        if EXCLUDE_NAME_PARTS.iter().any(|part| lower.contains(part)) {
            continue;
        }
        recv += data.total_received();
        sent += data.total_transmitted();
    }
    Some((recv, sent))
}

/// Speeds between two counter snapshots, clamped at zero so counter resets
/// never show negative rates.
fn derive_speeds(
    prev_recv: u64,
    prev_sent: u64,
    recv: u64,
    sent: u64,
    elapsed_secs: f64,
) -> (i64, i64) {
    if elapsed_secs <= 0.0 {
        return (0, 0);
    }
    let down = ((recv as i64 - prev_recv as i64) as f64 / elapsed_secs) as i64;
    let up = ((sent as i64 - prev_sent as i64) as f64 / elapsed_secs) as i64;
    (down.max(0), up.max(0))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_derive_speeds() {
        let (down, up) = derive_speeds(1_000, 500, 3_000, 1_500, 2.0);
        assert_eq!(down, 1_000);
        assert_eq!(up, 500);
    }

    #[test]
    fn test_derive_speeds_clamped_on_counter_reset() {
        let (down, up) = derive_speeds(5_000, 5_000, 100, 100, 1.0);
        assert_eq!(down, 0);
        assert_eq!(up, 0);
    }

    #[test]
    fn test_derive_speeds_zero_elapsed() {
        assert_eq!(derive_speeds(0, 0, 100, 100, 0.0), (0, 0));
    }

    #[test]
    fn test_disconnected_sample_is_empty_and_resets() {
        let sampler = TrafficSampler::new();
        // Seed a fake previous sample, then confirm a disconnected sample
        // clears it.
        *sampler.last.lock() = Some(Sample {
            recv: 10,
            sent: 10,
            at: Instant::now(),
        });
        let stats = sampler.sample(false);
        assert_eq!(stats, TrafficStats::default());
        assert!(sampler.last.lock().is_none());
    }
}
