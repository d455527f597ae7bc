use crate::error::Result;
use crate::record::Timestamped;
use crate::shutdown::Shutdown;
use crate::stage::{ensure_open, BoxStage, Outcome, Signal, Stage};
use chrono::NaiveDateTime;
use std::time::Duration;
use tracing::debug;

/// Replays items at the pace they were created.
///
/// The gap between the creation times of consecutive items is divided by
/// `speedup` and capped at `max_delay`. Items that are not newer than the
/// previous one, or carry no timestamp, pass straight through. Waits end
/// early once the shutdown handle is triggered.
pub struct Delay<T> {
    target: BoxStage<T>,
    speedup: f64,
    max_delay: Duration,
    shutdown: Shutdown,
    last: Option<NaiveDateTime>,
    closed: bool,
}

impl<T> Delay<T> {
    pub fn new(target: impl Stage<T> + 'static, speedup: f64) -> Self {
        Self {
            target: Box::new(target),
            speedup,
            max_delay: Duration::from_secs(2),
            shutdown: Shutdown::new(),
            last: None,
            closed: false,
        }
    }

    pub fn max_delay(mut self, max_delay: Duration) -> Self {
        self.max_delay = max_delay;
        self
    }

    pub fn with_shutdown(mut self, shutdown: Shutdown) -> Self {
        self.shutdown = shutdown;
        self
    }

    /// How long to hold an item created at `at`. Zero `speedup` disables waiting.
    fn pause_before(&self, at: NaiveDateTime) -> Option<Duration> {
        let last = self.last?;
        if self.speedup <= 0.0 || at <= last {
            return None;
        }
        let gap = (at - last).to_std().ok()?;
        Some(gap.div_f64(self.speedup).min(self.max_delay))
    }
}

impl<T: Timestamped + Send> Stage<T> for Delay<T> {
    fn push(&mut self, item: T) -> Result<Outcome> {
        ensure_open(self.closed, self.name())?;
        if let Some(at) = item.timestamp() {
            if let Some(pause) = self.pause_before(at) {
                if self.shutdown.wait_timeout(pause) {
                    debug!("delay cut short by shutdown");
                }
            }
            self.last = Some(at);
        }
        self.target.push(item)
    }

    fn signal(&mut self, signal: &Signal<T>) -> Result<()> {
        ensure_open(self.closed, self.name())?;
        self.target.signal(signal)
    }

    fn close(&mut self) -> Result<()> {
        if std::mem::replace(&mut self.closed, true) {
            return Ok(());
        }
        self.target.close()
    }

    fn name(&self) -> &str {
        "delay"
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::record::fixtures::RECORDS;
    use crate::record::Record;
    use crate::stage::CollectSink;
    use std::thread;
    use std::time::Instant;

    fn records() -> Vec<Record> {
        RECORDS.iter().map(|l| Record::parse(l).unwrap()).collect()
    }

    #[test]
    fn test_replay_keeps_order() {
        let (sink, collector) = CollectSink::new();
        // Weeks between the records, squeezed into milliseconds
        let mut delay = Delay::new(sink, 1e9);

        let start = Instant::now();
        for record in records() {
            delay.push(record).unwrap();
        }
        delay.close().unwrap();

        assert!(start.elapsed() < Duration::from_secs(1));
        let lines: Vec<String> = collector
            .items()
            .iter()
            .map(|r| r.raw_line().to_owned())
            .collect();
        assert_eq!(lines, RECORDS.map(str::to_owned).to_vec());
        assert!(collector.is_closed());
    }

    #[test]
    fn test_gap_is_capped() {
        let (sink, collector) = CollectSink::new();
        let mut delay = Delay::new(sink, 1.0).max_delay(Duration::from_millis(20));

        let start = Instant::now();
        for record in records() {
            delay.push(record).unwrap();
        }

        let elapsed = start.elapsed();
        assert!(elapsed >= Duration::from_millis(40));
        assert!(elapsed < Duration::from_secs(2));
        assert_eq!(collector.len(), 3);
    }

    #[test]
    fn test_older_items_are_not_held() {
        let (sink, collector) = CollectSink::new();
        let mut delay = Delay::new(sink, 1.0).max_delay(Duration::from_secs(60));
        let rs = records();

        delay.push(rs[2].clone()).unwrap();
        let start = Instant::now();
        delay.push(rs[0].clone()).unwrap();

        assert!(start.elapsed() < Duration::from_secs(1));
        assert_eq!(collector.len(), 2);
    }

    #[test]
    fn test_shutdown_cuts_the_wait_short() {
        let (sink, collector) = CollectSink::new();
        let shutdown = Shutdown::new();
        let mut delay = Delay::new(sink, 1.0)
            .max_delay(Duration::from_secs(60))
            .with_shutdown(shutdown.clone());
        let rs = records();
        delay.push(rs[0].clone()).unwrap();

        let trigger = thread::spawn(move || {
            thread::sleep(Duration::from_millis(50));
            shutdown.trigger();
        });
        let start = Instant::now();
        delay.push(rs[1].clone()).unwrap();
        trigger.join().unwrap();

        assert!(start.elapsed() < Duration::from_secs(10));
        assert_eq!(collector.len(), 2);
    }
}
