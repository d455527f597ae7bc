use crate::error::{PipelineError, Result};
use parking_lot::{Condvar, Mutex};
use std::sync::Arc;
use std::time::{Duration, Instant};
use tracing::info;

#[derive(Debug, Default)]
struct Inner {
    triggered: Mutex<bool>,
    wakeup: Condvar,
}

/// A cancellation handle shared by drivers, the merge engine and the bridge.
///
/// Triggering wakes every thread blocked in [`Shutdown::wait_timeout`].
#[derive(Debug, Clone, Default)]
pub struct Shutdown {
    inner: Arc<Inner>,
}

impl Shutdown {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn trigger(&self) {
        let mut triggered = self.inner.triggered.lock();
        if !*triggered {
            *triggered = true;
            info!("shutdown requested");
        }
        self.inner.wakeup.notify_all();
    }

    pub fn is_triggered(&self) -> bool {
        *self.inner.triggered.lock()
    }

    /// Fail with [`PipelineError::Interrupted`] once triggered
    pub fn check(&self) -> Result<()> {
        if self.is_triggered() {
            Err(PipelineError::Interrupted)
        } else {
            Ok(())
        }
    }

    /// Sleep for `timeout` or until triggered, whichever comes first.
    /// Returns whether shutdown was triggered.
    pub fn wait_timeout(&self, timeout: Duration) -> bool {
        let deadline = Instant::now() + timeout;
        let mut triggered = self.inner.triggered.lock();
        while !*triggered {
            if self
                .inner
                .wakeup
                .wait_until(&mut triggered, deadline)
                .timed_out()
            {
                break;
            }
        }
        *triggered
    }
}
