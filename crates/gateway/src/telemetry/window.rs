//! Time-bounded event window.

use std::collections::VecDeque;
use std::sync::Mutex;
use std::time::{Duration, Instant};

/// A time-ordered deque of `(timestamp, value)` events with a fixed
/// temporal extent. Events older than the window are evicted lazily on
/// read and write, so no background sweeper is needed.
///
/// The internal mutex is held only for the deque operation itself, never
/// across I/O.
#[derive(Debug)]
pub struct RollingWindow {
    window: Duration,
    events: Mutex<VecDeque<(Instant, f64)>>,
}

impl RollingWindow {
    pub fn new(window: Duration) -> Self {
        Self {
            window,
            events: Mutex::new(VecDeque::new()),
        }
    }

    pub fn window(&self) -> Duration {
        self.window
    }

    pub fn record(&self, value: f64) {
        self.record_at(Instant::now(), value);
    }

    /// Record with an explicit timestamp. Tests use this to lay down
    /// history without sleeping.
    pub(crate) fn record_at(&self, at: Instant, value: f64) {
        let mut events = self.events.lock().expect("window mutex poisoned");
        Self::evict(&mut events, self.window);
        events.push_back((at, value));
    }

    fn evict(events: &mut VecDeque<(Instant, f64)>, window: Duration) {
        let Some(cutoff) = Instant::now().checked_sub(window) else {
            return;
        };
        while events.front().is_some_and(|(at, _)| *at < cutoff) {
            events.pop_front();
        }
    }

    pub fn count(&self) -> usize {
        let mut events = self.events.lock().expect("window mutex poisoned");
        Self::evict(&mut events, self.window);
        events.len()
    }

    pub fn sum(&self) -> f64 {
        let mut events = self.events.lock().expect("window mutex poisoned");
        Self::evict(&mut events, self.window);
        events.iter().map(|(_, v)| v).sum()
    }

    pub fn avg(&self) -> Option<f64> {
        let mut events = self.events.lock().expect("window mutex poisoned");
        Self::evict(&mut events, self.window);
        if events.is_empty() {
            None
        } else {
            Some(events.iter().map(|(_, v)| v).sum::<f64>() / events.len() as f64)
        }
    }

    /// Events per second over the whole window extent.
    pub fn rate_per_sec(&self) -> f64 {
        let secs = self.window.as_secs_f64();
        if secs <= 0.0 {
            return 0.0;
        }
        self.count() as f64 / secs
    }

    /// Events per second counting only events newer than `within`.
    pub fn rate_within(&self, within: Duration) -> f64 {
        let secs = within.as_secs_f64();
        if secs <= 0.0 {
            return 0.0;
        }
        let cutoff = Instant::now().checked_sub(within);
        let mut events = self.events.lock().expect("window mutex poisoned");
        Self::evict(&mut events, self.window);
        let count = match cutoff {
            Some(cutoff) => events.iter().filter(|(at, _)| *at >= cutoff).count(),
            None => events.len(),
        };
        count as f64 / secs
    }

    /// 95th percentile of recorded values, by rank over the sorted sample.
    pub fn p95(&self) -> Option<f64> {
        let mut events = self.events.lock().expect("window mutex poisoned");
        Self::evict(&mut events, self.window);
        if events.is_empty() {
            return None;
        }
        let mut values: Vec<f64> = events.iter().map(|(_, v)| *v).collect();
        values.sort_by(|a, b| a.partial_cmp(b).unwrap_or(std::cmp::Ordering::Equal));
        Some(values[values.len() * 95 / 100])
    }

    /// Newest event, if any survives eviction.
    pub fn last(&self) -> Option<(Instant, f64)> {
        let mut events = self.events.lock().expect("window mutex poisoned");
        Self::evict(&mut events, self.window);
        events.back().copied()
    }

    pub fn newest_age(&self) -> Option<Duration> {
        self.last().map(|(at, _)| at.elapsed())
    }

    pub fn oldest_age(&self) -> Option<Duration> {
        let mut events = self.events.lock().expect("window mutex poisoned");
        Self::evict(&mut events, self.window);
        events.front().map(|(at, _)| at.elapsed())
    }
}
