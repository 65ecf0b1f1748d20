use std::collections::BTreeMap;
use std::io::Write;
use std::path::Path;
use std::sync::{Arc, Mutex};
use std::time::{Duration, Instant};

/// Per-stage time points for one tracked sequence number.
///
/// Only the first sequence number of each sealed buffer is tracked; the
/// reception stamp creates the entry and later stages fill in their points.
/// Every stamp is first-write-wins.
#[derive(Debug, Clone, Copy)]
pub struct TimePoints {
    pub recv: Instant,
    pub parsed: Option<Instant>,
    pub serialized: Option<Instant>,
    pub published: Option<Instant>,
}

impl TimePoints {
    fn new(recv: Instant) -> Self {
        Self {
            recv,
            parsed: None,
            serialized: None,
            published: None,
        }
    }

    /// End-to-end latency, reception to publication ack.
    pub fn total(&self) -> Option<Duration> {
        self.published.map(|p| p - self.recv)
    }
}

/// Internally synchronized map from sequence number to time points.
///
/// Cloning shares the underlying map, so every stage can hold a handle.
#[derive(Clone, Default)]
pub struct LatencyTracker {
    inner: Arc<Mutex<BTreeMap<u64, TimePoints>>>,
}

impl LatencyTracker {
    /// Create the entry for `seq`. A second call for the same sequence
    /// number leaves the original stamp in place.
    pub fn record_recv(&self, seq: u64, t: Instant) {
        if let Ok(mut map) = self.inner.lock() {
            map.entry(seq).or_insert_with(|| TimePoints::new(t));
        }
    }

    pub fn record_parsed(&self, seq: u64, t: Instant) {
        if let Ok(mut map) = self.inner.lock() {
            if let Some(points) = map.get_mut(&seq) {
                points.parsed.get_or_insert(t);
            }
        }
    }

    pub fn record_serialized(&self, seq: u64, t: Instant) {
        if let Ok(mut map) = self.inner.lock() {
            if let Some(points) = map.get_mut(&seq) {
                points.serialized.get_or_insert(t);
            }
        }
    }

    pub fn record_published(&self, seq: u64, t: Instant) {
        if let Ok(mut map) = self.inner.lock() {
            if let Some(points) = map.get_mut(&seq) {
                points.published.get_or_insert(t);
            }
        }
    }

    /// All measurements in sequence order.
    pub fn measurements(&self) -> Vec<(u64, TimePoints)> {
        match self.inner.lock() {
            Ok(map) => map.iter().map(|(seq, points)| (*seq, *points)).collect(),
            Err(_) => Vec::new(),
        }
    }

    /// End-to-end latency of the lowest tracked sequence number that made it
    /// all the way to publication.
    pub fn first_latency(&self) -> Option<Duration> {
        let Ok(map) = self.inner.lock() else {
            return None;
        };
        map.values().find_map(|points| points.total())
    }

    /// Dump stage deltas as CSV, one line per tracked sequence number.
    pub fn write_csv(&self, path: &Path) -> std::io::Result<()> {
        let mut file = std::fs::File::create(path)?;
        writeln!(file, "seq,parse_us,serialize_us,publish_us,total_us")?;
        for (seq, points) in self.measurements() {
            let delta =
                |later: Option<Instant>, earlier: Option<Instant>| -> i64 {
                    match (later, earlier) {
                        (Some(l), Some(e)) => (l - e).as_micros() as i64,
                        _ => -1,
                    }
                };
            writeln!(
                file,
                "{},{},{},{},{}",
                seq,
                delta(points.parsed, Some(points.recv)),
                delta(points.serialized, points.parsed),
                delta(points.published, points.serialized),
                delta(points.published, Some(points.recv)),
            )?;
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_stage_stamps_in_order() {
        let tracker = LatencyTracker::default();
        let t0 = Instant::now();
        let t1 = t0 + Duration::from_micros(10);
        let t2 = t0 + Duration::from_micros(20);
        let t3 = t0 + Duration::from_micros(30);

        tracker.record_recv(5, t0);
        tracker.record_parsed(5, t1);
        tracker.record_serialized(5, t2);
        tracker.record_published(5, t3);

        let measurements = tracker.measurements();
        assert_eq!(measurements.len(), 1);
        let (seq, points) = measurements[0];
        assert_eq!(seq, 5);
        assert!(points.recv <= points.parsed.unwrap());
        assert!(points.parsed.unwrap() <= points.serialized.unwrap());
        assert!(points.serialized.unwrap() <= points.published.unwrap());
        assert_eq!(points.total(), Some(Duration::from_micros(30)));
    }

    #[test]
    fn test_first_write_wins() {
        let tracker = LatencyTracker::default();
        let t0 = Instant::now();
        let later = t0 + Duration::from_secs(1);

        tracker.record_recv(0, t0);
        tracker.record_recv(0, later);
        tracker.record_parsed(0, t0);
        tracker.record_parsed(0, later);

        let (_, points) = tracker.measurements()[0];
        assert_eq!(points.recv, t0);
        assert_eq!(points.parsed, Some(t0));
    }

    #[test]
    fn test_stamps_without_entry_are_ignored() {
        let tracker = LatencyTracker::default();
        tracker.record_parsed(7, Instant::now());
        tracker.record_published(7, Instant::now());
        assert!(tracker.measurements().is_empty());
        assert!(tracker.first_latency().is_none());
    }

    #[test]
    fn test_first_latency_skips_unpublished() {
        let tracker = LatencyTracker::default();
        let t0 = Instant::now();

        tracker.record_recv(0, t0);
        tracker.record_recv(4, t0);
        tracker.record_published(4, t0 + Duration::from_micros(50));

        assert_eq!(tracker.first_latency(), Some(Duration::from_micros(50)));
    }
}
