use crate::error::Result;
use crate::stage::{ensure_open, BoxStage, Outcome, Signal, Stage};
use tracing::debug;

/// Splits a stream into batches.
///
/// The splitter compares each item with the first item of the current batch.
/// When it reports a new batch, a [`Signal::BatchEnd`] carrying the item and
/// the number of items pushed since the previous boundary (this one included)
/// is sent downstream before the item itself, which becomes the first of the
/// new batch.
pub struct Batch<T> {
    target: BoxStage<T>,
    splitter: Box<dyn Fn(&T, &T) -> bool + Send>,
    flow_name: Option<String>,
    first: Option<T>,
    batch_size: usize,
    closed: bool,
}

impl<T: PartialEq + 'static> Batch<T> {
    /// A new batch starts whenever an item differs from the batch's first one
    pub fn new(target: impl Stage<T> + 'static) -> Self {
        Self::with_splitter(target, |current: &T, first: &T| current != first)
    }
}

impl<T: 'static> Batch<T> {
    pub fn with_splitter(
        target: impl Stage<T> + 'static,
        splitter: impl Fn(&T, &T) -> bool + Send + 'static,
    ) -> Self {
        Self {
            target: Box::new(target),
            splitter: Box::new(splitter),
            flow_name: None,
            first: None,
            batch_size: 0,
            closed: false,
        }
    }

    /// Batch on a derived key, e.g. the hour an event was created in
    pub fn by_key<K: PartialEq + 'static>(
        target: impl Stage<T> + 'static,
        key: impl Fn(&T) -> K + Send + 'static,
    ) -> Self {
        Self::with_splitter(target, move |current: &T, first: &T| key(current) != key(first))
    }

    /// Name used in log lines
    pub fn with_flow_name(mut self, flow_name: impl Into<String>) -> Self {
        self.flow_name = Some(flow_name.into());
        self
    }
}

impl<T: Clone + Send> Stage<T> for Batch<T> {
    fn push(&mut self, item: T) -> Result<Outcome> {
        ensure_open(self.closed, self.name())?;
        self.batch_size += 1;

        let first = self.first.get_or_insert_with(|| item.clone());
        if (self.splitter)(&item, first) {
            debug!(
                flow = self.flow_name.as_deref().unwrap_or_default(),
                batch_size = self.batch_size,
                "batch ended"
            );
            self.target
                .signal(&Signal::batch_end(item.clone(), self.batch_size))?;
            self.batch_size = 0;
            self.first = Some(item.clone());
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
        "batch"
    }
}
