//! Bounded ring buffer for engine output
//!
//! Keeps the most recent lines of sing-box stdout/stderr for the `/api/logs`
//! endpoint. Drop-oldest on overflow; readers get a snapshot copy, never
//! shared references.

use parking_lot::Mutex;
use std::collections::VecDeque;

/// Default line capacity, overridable via `NEKKUS_SINGBOX_LOG_LINES`.
pub const DEFAULT_CAPACITY: usize = 300;

pub struct LogBuffer {
    max: usize,
    data: Mutex<VecDeque<String>>,
}

impl LogBuffer {
    pub fn new(max: usize) -> Self {
        Self {
            max: max.max(1),
            data: Mutex::new(VecDeque::with_capacity(max.max(1))),
        }
    }

    /// Capacity from the environment, falling back to the default.
    pub fn from_env() -> Self {
        let max = std::env::var("NEKKUS_SINGBOX_LOG_LINES")
            .ok()
            .and_then(|v| v.trim().parse().ok())
            .unwrap_or(DEFAULT_CAPACITY);
        Self::new(max)
    }

    pub fn push(&self, line: String) {
        let mut data = self.data.lock();
        if data.len() >= self.max {
            data.pop_front();
        }
        data.push_back(line);
    }

    pub fn snapshot(&self) -> Vec<String> {
        self.data.lock().iter().cloned().collect()
    }

    pub fn len(&self) -> usize {
        self.data.lock().len()
    }

    pub fn is_empty(&self) -> bool {
        self.data.lock().is_empty()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_drop_oldest_on_overflow() {
        let buf = LogBuffer::new(3);
        for i in 1..=5 {
            buf.push(format!("line {i}"));
        }
        assert_eq!(buf.snapshot(), vec!["line 3", "line 4", "line 5"]);
    }

    #[test]
    fn test_snapshot_is_a_copy() {
        let buf = LogBuffer::new(10);
        buf.push("a".to_string());
        let snap = buf.snapshot();
        buf.push("b".to_string());
        assert_eq!(snap, vec!["a"]);
        assert_eq!(buf.len(), 2);
    }

    #[test]
    fn test_zero_capacity_clamped() {
        let buf = LogBuffer::new(0);
        buf.push("only".to_string());
        buf.push("kept".to_string());
        assert_eq!(buf.snapshot(), vec!["kept"]);
    }
}
