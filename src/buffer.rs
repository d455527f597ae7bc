use crate::error::{PipelineError, Result};
use crate::shutdown::Shutdown;
use crossbeam::channel::{self, Receiver, RecvTimeoutError, SendTimeoutError, Sender, TrySendError};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};

/// How often a blocked sender re-checks the shutdown handle
const POLL_INTERVAL: Duration = Duration::from_millis(50);

/// What travels through the queue
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Message<T> {
    Item(T),
    /// Sentinel: the consumer stops after receiving it
    Shutdown,
}

/// Create a bounded FIFO queue holding at most `capacity` messages
pub fn bounded_queue<T>(capacity: usize) -> (QueueSender<T>, QueueReceiver<T>) {
    let capacity = capacity.max(1);
    let (tx, rx) = channel::bounded(capacity);
    (
        QueueSender {
            tx,
            capacity,
            block_count: Arc::new(AtomicU64::new(0)),
        },
        QueueReceiver { rx },
    )
}

/// Producer side of a bounded queue.
///
/// Clones share the queue; the receiver sees a disconnect once every
/// sender is dropped.
#[derive(Debug)]
pub struct QueueSender<T> {
    tx: Sender<Message<T>>,
    capacity: usize,
    block_count: Arc<AtomicU64>,
}

impl<T> Clone for QueueSender<T> {
    fn clone(&self) -> Self {
        Self {
            tx: self.tx.clone(),
            capacity: self.capacity,
            block_count: Arc::clone(&self.block_count),
        }
    }
}

impl<T> QueueSender<T> {
    /// Enqueue an item, blocking while the queue is full.
    ///
    /// Fails with [`PipelineError::QueueFull`] when no slot frees up within
    /// `timeout`, [`PipelineError::QueueDisconnected`] when the receiver is
    /// gone and [`PipelineError::Interrupted`] when `shutdown` fires while
    /// blocked. Items are never dropped or reordered.
    pub fn send(&self, item: T, timeout: Duration, shutdown: &Shutdown) -> Result<()> {
        let mut message = match self.tx.try_send(Message::Item(item)) {
            Ok(()) => return Ok(()),
            Err(TrySendError::Disconnected(_)) => return Err(PipelineError::QueueDisconnected),
            Err(TrySendError::Full(message)) => message,
        };

        self.block_count.fetch_add(1, Ordering::Relaxed);
        let deadline = Instant::now() + timeout;
        loop {
            shutdown.check()?;
            let now = Instant::now();
            if now >= deadline {
                return Err(PipelineError::QueueFull);
            }
            match self.tx.send_timeout(message, (deadline - now).min(POLL_INTERVAL)) {
                Ok(()) => return Ok(()),
                Err(SendTimeoutError::Timeout(m)) => message = m,
                Err(SendTimeoutError::Disconnected(_)) => {
                    return Err(PipelineError::QueueDisconnected)
                }
            }
        }
    }

    /// Enqueue the shutdown sentinel without blocking. Returns whether it fit.
    pub fn try_send_shutdown(&self) -> bool {
        self.tx.try_send(Message::Shutdown).is_ok()
    }

    pub fn len(&self) -> usize {
        self.tx.len()
    }

    pub fn is_empty(&self) -> bool {
        self.tx.is_empty()
    }

    pub fn capacity(&self) -> usize {
        self.capacity
    }

    /// Get the utilization of the queue as a percentage (0-100)
    pub fn utilization(&self) -> u32 {
        ((self.len() * 100 / self.capacity) as u32).min(100)
    }

    /// Number of sends that found the queue full and had to wait
    pub fn block_count(&self) -> u64 {
        self.block_count.load(Ordering::Relaxed)
    }
}

/// Consumer side of a bounded queue
#[derive(Debug)]
pub struct QueueReceiver<T> {
    rx: Receiver<Message<T>>,
}

impl<T> QueueReceiver<T> {
    /// Block until a message arrives. `None` once every sender is gone and
    /// the queue is drained.
    pub fn recv(&self) -> Option<Message<T>> {
        self.rx.recv().ok()
    }

    /// Wait up to `timeout` for a message. `Ok(None)` when none arrived,
    /// [`PipelineError::QueueDisconnected`] once every sender is gone and the
    /// queue is drained.
    pub fn recv_timeout(&self, timeout: Duration) -> Result<Option<Message<T>>> {
        match self.rx.recv_timeout(timeout) {
            Ok(message) => Ok(Some(message)),
            Err(RecvTimeoutError::Timeout) => Ok(None),
            Err(RecvTimeoutError::Disconnected) => Err(PipelineError::QueueDisconnected),
        }
    }

    pub fn len(&self) -> usize {
        self.rx.len()
    }

    pub fn is_empty(&self) -> bool {
        self.rx.is_empty()
    }
}
