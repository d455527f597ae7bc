use crate::error::Result;
use crate::stage::{ensure_open, BoxStage, Outcome, Signal, Stage};

/// Rewrites each item given `(current, first_of_batch)` before forwarding it
pub struct Mutate<T> {
    target: BoxStage<T>,
    mutator: Box<dyn Fn(T, &T) -> T + Send>,
    first: Option<T>,
    closed: bool,
}

impl<T> Mutate<T> {
    pub fn new(
        target: impl Stage<T> + 'static,
        mutator: impl Fn(T, &T) -> T + Send + 'static,
    ) -> Self {
        Self {
            target: Box::new(target),
            mutator: Box::new(mutator),
            first: None,
            closed: false,
        }
    }
}

impl<T: Clone + Send> Stage<T> for Mutate<T> {
    fn push(&mut self, item: T) -> Result<Outcome> {
        ensure_open(self.closed, self.name())?;
        let first = self.first.get_or_insert_with(|| item.clone());
        let mutated = (self.mutator)(item, first);
        self.target.push(mutated)
    }

    fn signal(&mut self, signal: &Signal<T>) -> Result<()> {
        ensure_open(self.closed, self.name())?;
        match signal {
            Signal::BatchEnd(_) => self.first = None,
        }
        self.target.signal(signal)
    }

    fn close(&mut self) -> Result<()> {
        if std::mem::replace(&mut self.closed, true) {
            return Ok(());
        }
        self.target.close()
    }

    fn name(&self) -> &str {
        "mutate"
    }
}
