use parking_lot::Mutex;
use std::collections::HashSet;
use std::time::{SystemTime, UNIX_EPOCH};

/// Keep at most this many peer time samples
const MAX_TIME_SAMPLES: usize = 200;

/// Seconds since the Unix epoch from the local clock.
pub fn unix_now() -> u64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .unwrap()
        .as_secs()
}

/// Network-adjusted clock. Peers contribute one time sample each during
/// their handshake; the adjusted time is the local clock shifted by the
/// median of the collected offsets.
#[derive(Default)]
pub struct MedianTimeSource {
    inner: Mutex<Samples>,
}

#[derive(Default)]
struct Samples {
    offsets: Vec<i64>,
    sources: HashSet<String>,
}

impl MedianTimeSource {
    pub fn new() -> Self {
        Self::default()
    }

    /// Record a peer's clock reading. Repeated samples from the same
    /// source id are ignored.
    pub fn add_time_sample(&self, source: &str, peer_time: u64) {
        let mut inner = self.inner.lock();
        if !inner.sources.insert(source.to_string()) {
            return;
        }
        let offset = peer_time as i64 - unix_now() as i64;
        inner.offsets.push(offset);
        if inner.offsets.len() > MAX_TIME_SAMPLES {
            inner.offsets.remove(0);
        }
    }

    fn offset(&self) -> i64 {
        let inner = self.inner.lock();
        if inner.offsets.is_empty() {
            return 0;
        }
        let mut sorted = inner.offsets.clone();
        sorted.sort_unstable();
        sorted[sorted.len() / 2]
    }

    /// Local time shifted by the median peer offset.
    pub fn adjusted_time(&self) -> u64 {
        let adjusted = unix_now() as i64 + self.offset();
        adjusted.max(0) as u64
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_no_samples_uses_local_clock() {
        let ts = MedianTimeSource::new();
        let now = unix_now();
        let adjusted = ts.adjusted_time();
        assert!(adjusted.abs_diff(now) <= 1);
    }

    #[test]
    fn test_median_offset_applied() {
        let ts = MedianTimeSource::new();
        let now = unix_now();
        ts.add_time_sample("a", now + 100);
        ts.add_time_sample("b", now + 100);
        ts.add_time_sample("c", now + 100);
        let adjusted = ts.adjusted_time();
        assert!(adjusted.abs_diff(now + 100) <= 2);
    }

    #[test]
    fn test_duplicate_source_ignored() {
        let ts = MedianTimeSource::new();
        let now = unix_now();
        ts.add_time_sample("a", now + 5000);
        ts.add_time_sample("a", now + 9000);
        assert_eq!(ts.inner.lock().offsets.len(), 1);
    }
}
