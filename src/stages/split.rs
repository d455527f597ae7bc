use crate::error::Result;
use crate::stage::{close_all, ensure_open, signal_all, BoxStage, Outcome, Signal, Stage};

/// Sends every item, unmodified, to every target
pub struct Split<T> {
    targets: Vec<BoxStage<T>>,
    closed: bool,
}

impl<T> Split<T> {
    pub fn new(targets: Vec<BoxStage<T>>) -> Self {
        Self {
            targets,
            closed: false,
        }
    }
}

impl<T: Clone + Send> Stage<T> for Split<T> {
    fn push(&mut self, item: T) -> Result<Outcome> {
        ensure_open(self.closed, self.name())?;
        if let Some((last, rest)) = self.targets.split_last_mut() {
            for target in rest {
                target.push(item.clone())?;
            }
            last.push(item)?;
        }
        Ok(Outcome::Accepted)
    }

    fn signal(&mut self, signal: &Signal<T>) -> Result<()> {
        ensure_open(self.closed, self.name())?;
        signal_all(self.targets.iter_mut(), signal)
    }

    fn close(&mut self) -> Result<()> {
        if std::mem::replace(&mut self.closed, true) {
            return Ok(());
        }
        close_all(self.targets.iter_mut())
    }

    fn name(&self) -> &str {
        "split"
    }
}
