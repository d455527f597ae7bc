use std::sync::atomic::{AtomicBool, Ordering};

/// A change of backpressure state reported by [`BackpressureMonitor::observe`]
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Transition {
    /// Utilization reached the high watermark
    Engaged,
    /// Utilization dropped to the low watermark
    Released,
}

/// Watermark-based queue monitor.
///
/// Backpressure engages when utilization reaches the high watermark and is
/// released only once it falls to the low watermark, so a queue hovering
/// around one threshold does not flap.
#[derive(Debug)]
pub struct BackpressureMonitor {
    /// Threshold at which backpressure engages (percentage)
    high_watermark: u32,
    /// Threshold at which backpressure is released (percentage)
    low_watermark: u32,
    is_active: AtomicBool,
}

impl BackpressureMonitor {
    /// Default: high=80%, low=40%
    pub fn new() -> Self {
        Self::with_watermarks(80, 40)
    }

    pub fn with_watermarks(high: u32, low: u32) -> Self {
        let high = high.min(100);
        Self {
            high_watermark: high,
            low_watermark: low.min(high),
            is_active: AtomicBool::new(false),
        }
    }

    /// Feed the current utilization; returns a transition when the state
    /// flips.
    pub fn observe(&self, utilization: u32) -> Option<Transition> {
        let was_active = self.is_active.load(Ordering::Relaxed);
        let is_now_active = if was_active {
            utilization > self.low_watermark
        } else {
            utilization >= self.high_watermark
        };

        if is_now_active == was_active {
            return None;
        }
        self.is_active.store(is_now_active, Ordering::Relaxed);
        Some(if is_now_active {
            Transition::Engaged
        } else {
            Transition::Released
        })
    }

    pub fn is_active(&self) -> bool {
        self.is_active.load(Ordering::Relaxed)
    }

    pub fn watermarks(&self) -> (u32, u32) {
        (self.high_watermark, self.low_watermark)
    }
}

impl Default for BackpressureMonitor {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::buffer::bounded_queue;
    use crate::shutdown::Shutdown;
    use std::time::Duration;

    #[test]
    fn test_engages_at_high_watermark() {
        let monitor = BackpressureMonitor::with_watermarks(80, 40);
        let (tx, _rx) = bounded_queue(10);
        let shutdown = Shutdown::new();

        for i in 0..9 {
            tx.send(i, Duration::from_secs(1), &shutdown).unwrap();
        }

        assert_eq!(monitor.observe(tx.utilization()), Some(Transition::Engaged));
        assert!(monitor.is_active());
        assert_eq!(monitor.observe(tx.utilization()), None);
    }

    #[test]
    fn test_release_needs_low_watermark() {
        let monitor = BackpressureMonitor::with_watermarks(80, 40);

        assert_eq!(monitor.observe(85), Some(Transition::Engaged));
        assert_eq!(monitor.observe(60), None);
        assert!(monitor.is_active());
        assert_eq!(monitor.observe(40), Some(Transition::Released));
        assert!(!monitor.is_active());
        assert_eq!(monitor.observe(60), None);
    }

    #[test]
    fn test_watermark_thresholds() {
        assert_eq!(BackpressureMonitor::with_watermarks(50, 25).watermarks(), (50, 25));
        assert_eq!(BackpressureMonitor::with_watermarks(150, 120).watermarks(), (100, 100));
    }
}
