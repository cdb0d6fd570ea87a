//! Event bus counters.

use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Mutex;

use crate::events::event::EventKind;

#[derive(Debug, Default)]
pub struct EventMetrics {
    published: AtomicU64,
    processed: AtomicU64,
    failed: AtomicU64,
    dropped: AtomicU64,
    processing_micros: AtomicU64,
    by_kind: Mutex<HashMap<EventKind, u64>>,
}

#[derive(Debug, Clone, PartialEq)]
pub struct EventMetricsSnapshot {
    pub published: u64,
    pub processed: u64,
    pub failed: u64,
    pub dropped: u64,
    /// Total subscriber processing time.
    pub processing_micros: u64,
    pub by_kind: HashMap<EventKind, u64>,
    /// processed / (processed + failed), 1.0 when nothing ran yet.
    pub success_rate: f64,
}

impl EventMetrics {
    pub fn record_published(&self, kind: EventKind) {
        self.published.fetch_add(1, Ordering::Relaxed);
        *self.by_kind.lock().unwrap().entry(kind).or_insert(0) += 1;
    }

    pub fn record_processed(&self, micros: u64) {
        self.processed.fetch_add(1, Ordering::Relaxed);
        self.processing_micros.fetch_add(micros, Ordering::Relaxed);
    }

    pub fn record_failed(&self) {
        self.failed.fetch_add(1, Ordering::Relaxed);
    }

    pub fn record_dropped(&self) {
        self.dropped.fetch_add(1, Ordering::Relaxed);
    }

    pub fn dropped(&self) -> u64 {
        self.dropped.load(Ordering::Relaxed)
    }

    pub fn snapshot(&self) -> EventMetricsSnapshot {
        let processed = self.processed.load(Ordering::Relaxed);
        let failed = self.failed.load(Ordering::Relaxed);
        let total = processed + failed;
        EventMetricsSnapshot {
            published: self.published.load(Ordering::Relaxed),
            processed,
            failed,
            dropped: self.dropped.load(Ordering::Relaxed),
            processing_micros: self.processing_micros.load(Ordering::Relaxed),
            by_kind: self.by_kind.lock().unwrap().clone(),
            success_rate: if total == 0 {
                1.0
            } else {
                processed as f64 / total as f64
            },
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn snapshot_reflects_counts() {
        let m = EventMetrics::default();
        m.record_published(EventKind::Player);
        m.record_published(EventKind::Player);
        m.record_published(EventKind::System);
        m.record_processed(120);
        m.record_failed();
        m.record_dropped();
        let s = m.snapshot();
        assert_eq!(s.published, 3);
        assert_eq!(s.by_kind[&EventKind::Player], 2);
        assert_eq!(s.processed, 1);
        assert_eq!(s.failed, 1);
        assert_eq!(s.dropped, 1);
        assert!((s.success_rate - 0.5).abs() < 1e-12);
    }

    #[test]
    fn success_rate_defaults_to_one() {
        assert_eq!(EventMetrics::default().snapshot().success_rate, 1.0);
    }
}
