use crate::error::{PipelineError, Result};
use parking_lot::Mutex;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use tracing::warn;

/// What a stage did with a pushed item
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Outcome {
    /// The item was consumed (forwarded, stored or deliberately dropped)
    Accepted,
    /// The item was swallowed before producing any output; the driver should
    /// supply the next item without counting this one as a unit of work
    Skip,
}

impl Outcome {
    pub fn is_skip(self) -> bool {
        self == Outcome::Skip
    }
}

/// The end of a batch, as detected by [`crate::stages::Batch`]
#[derive(Debug, Clone, PartialEq)]
pub struct BatchEnd<T> {
    /// The item that started the next batch
    pub last_item: T,
    /// Items pushed since the previous boundary, the triggering item included
    pub batch_size: usize,
}

/// Out-of-band control events delivered through [`Stage::signal`]
#[derive(Debug, Clone, PartialEq)]
pub enum Signal<T> {
    BatchEnd(BatchEnd<T>),
}

impl<T> Signal<T> {
    pub fn batch_end(last_item: T, batch_size: usize) -> Self {
        Signal::BatchEnd(BatchEnd {
            last_item,
            batch_size,
        })
    }

    /// Convert the payload for a stage that changes the item type.
    pub fn try_map<U, E>(
        &self,
        f: impl FnOnce(&T) -> std::result::Result<U, E>,
    ) -> std::result::Result<Signal<U>, E> {
        match self {
            Signal::BatchEnd(end) => Ok(Signal::batch_end(f(&end.last_item)?, end.batch_size)),
        }
    }
}

/// A single processing unit in a push-based chain.
///
/// Items flow strictly downstream: a stage receives one item per [`Stage::push`]
/// and may synchronously push zero or more items to the targets it owns.
/// [`Stage::close`] is idempotent and closes owned targets exactly once; after
/// it, `push` and `signal` fail with [`PipelineError::Closed`].
pub trait Stage<T>: Send {
    /// Deliver one item
    fn push(&mut self, item: T) -> Result<Outcome>;

    /// Deliver a control event. Stages that do not react to a signal forward
    /// it to their targets; sinks ignore it.
    fn signal(&mut self, _signal: &Signal<T>) -> Result<()> {
        Ok(())
    }

    /// Release owned resources and close owned targets
    fn close(&mut self) -> Result<()>;

    /// Get a human-readable name for this stage
    fn name(&self) -> &str {
        "stage"
    }
}

/// An exclusively owned downstream target
pub type BoxStage<T> = Box<dyn Stage<T>>;

impl<T, S> Stage<T> for Box<S>
where
    S: Stage<T> + ?Sized,
{
    fn push(&mut self, item: T) -> Result<Outcome> {
        (**self).push(item)
    }

    fn signal(&mut self, signal: &Signal<T>) -> Result<()> {
        (**self).signal(signal)
    }

    fn close(&mut self) -> Result<()> {
        (**self).close()
    }

    fn name(&self) -> &str {
        (**self).name()
    }
}

/// Fail with [`PipelineError::Closed`] when `closed` is set
pub(crate) fn ensure_open(closed: bool, stage: &str) -> Result<()> {
    if closed {
        Err(PipelineError::closed(stage))
    } else {
        Ok(())
    }
}

/// Close every target, even when an earlier one fails; the first error wins.
pub fn close_all<'a, T: 'a>(targets: impl IntoIterator<Item = &'a mut BoxStage<T>>) -> Result<()> {
    let mut first_error = None;
    for target in targets {
        if let Err(e) = target.close() {
            warn!(stage = target.name(), error = %e, "failed to close stage");
            first_error.get_or_insert(e);
        }
    }
    first_error.map_or(Ok(()), Err)
}

/// Forward a signal to every target
pub fn signal_all<'a, T: 'a>(
    targets: impl IntoIterator<Item = &'a mut BoxStage<T>>,
    signal: &Signal<T>,
) -> Result<()> {
    for target in targets {
        target.signal(signal)?;
    }
    Ok(())
}

/// A target with several owners.
///
/// Every clone is one owner. Closing a handle releases that owner only; the
/// wrapped stage is closed when the last owner closes.
pub struct SharedTarget<T> {
    inner: Arc<Mutex<BoxStage<T>>>,
    owners: Arc<AtomicUsize>,
    released: bool,
}

impl<T> SharedTarget<T> {
    pub fn new(stage: impl Stage<T> + 'static) -> Self {
        Self {
            inner: Arc::new(Mutex::new(Box::new(stage))),
            owners: Arc::new(AtomicUsize::new(1)),
            released: false,
        }
    }

    /// Number of handles that have not been closed yet
    pub fn owners(&self) -> usize {
        self.owners.load(Ordering::Acquire)
    }
}

impl<T> Clone for SharedTarget<T> {
    fn clone(&self) -> Self {
        self.owners.fetch_add(1, Ordering::AcqRel);
        Self {
            inner: Arc::clone(&self.inner),
            owners: Arc::clone(&self.owners),
            released: false,
        }
    }
}

impl<T> Stage<T> for SharedTarget<T> {
    fn push(&mut self, item: T) -> Result<Outcome> {
        ensure_open(self.released, "shared")?;
        self.inner.lock().push(item)
    }

    fn signal(&mut self, signal: &Signal<T>) -> Result<()> {
        ensure_open(self.released, "shared")?;
        self.inner.lock().signal(signal)
    }

    fn close(&mut self) -> Result<()> {
        if std::mem::replace(&mut self.released, true) {
            return Ok(());
        }
        if self.owners.fetch_sub(1, Ordering::AcqRel) == 1 {
            self.inner.lock().close()
        } else {
            Ok(())
        }
    }

    fn name(&self) -> &str {
        "shared"
    }
}

#[derive(Debug)]
struct Collected<T> {
    items: Vec<T>,
    signals: Vec<Signal<T>>,
    close_calls: usize,
    closed: bool,
}

/// A sink that keeps everything it receives, readable through a [`Collector`].
#[derive(Debug)]
pub struct CollectSink<T> {
    shared: Arc<Mutex<Collected<T>>>,
}

/// Read side of a [`CollectSink`]
#[derive(Debug)]
pub struct Collector<T> {
    shared: Arc<Mutex<Collected<T>>>,
}

impl<T> Clone for Collector<T> {
    fn clone(&self) -> Self {
        Self {
            shared: Arc::clone(&self.shared),
        }
    }
}

impl<T: Clone> CollectSink<T> {
    pub fn new() -> (Self, Collector<T>) {
        let shared = Arc::new(Mutex::new(Collected {
            items: Vec::new(),
            signals: Vec::new(),
            close_calls: 0,
            closed: false,
        }));
        (
            Self {
                shared: Arc::clone(&shared),
            },
            Collector { shared },
        )
    }
}

impl<T: Clone> Collector<T> {
    pub fn items(&self) -> Vec<T> {
        self.shared.lock().items.clone()
    }

    pub fn signals(&self) -> Vec<Signal<T>> {
        self.shared.lock().signals.clone()
    }

    pub fn len(&self) -> usize {
        self.shared.lock().items.len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    pub fn is_closed(&self) -> bool {
        self.shared.lock().closed
    }

    /// How many times `close` was invoked on the sink, repeated calls included
    pub fn close_calls(&self) -> usize {
        self.shared.lock().close_calls
    }
}

impl<T: Clone + Send> Stage<T> for CollectSink<T> {
    fn push(&mut self, item: T) -> Result<Outcome> {
        let mut shared = self.shared.lock();
        ensure_open(shared.closed, "collect")?;
        shared.items.push(item);
        Ok(Outcome::Accepted)
    }

    fn signal(&mut self, signal: &Signal<T>) -> Result<()> {
        let mut shared = self.shared.lock();
        ensure_open(shared.closed, "collect")?;
        shared.signals.push(signal.clone());
        Ok(())
    }

    fn close(&mut self) -> Result<()> {
        let mut shared = self.shared.lock();
        shared.close_calls += 1;
        shared.closed = true;
        Ok(())
    }

    fn name(&self) -> &str {
        "collect"
    }
}
