use crate::error::Result;
use crate::record::Record;
use crate::stage::{ensure_open, BoxStage, Outcome, Signal, Stage};
use tracing::debug;

/// Turns raw lines into [`Record`]s.
///
/// Lines that are not valid records are swallowed with [`Outcome::Skip`].
/// A batch boundary triggered by such a line is held back and forwarded with
/// the next valid record, so downstream batches keep their edges.
pub struct ToRecord {
    target: BoxStage<Record>,
    malformed: u64,
    pending_boundary: Option<usize>,
    closed: bool,
}

impl ToRecord {
    pub fn new(target: impl Stage<Record> + 'static) -> Self {
        Self {
            target: Box::new(target),
            malformed: 0,
            pending_boundary: None,
            closed: false,
        }
    }

    /// Lines rejected so far
    pub fn malformed(&self) -> u64 {
        self.malformed
    }
}

impl Stage<String> for ToRecord {
    fn push(&mut self, line: String) -> Result<Outcome> {
        ensure_open(self.closed, self.name())?;
        match Record::parse(&line) {
            Ok(record) => {
                if let Some(batch_size) = self.pending_boundary.take() {
                    self.target
                        .signal(&Signal::batch_end(record.clone(), batch_size))?;
                }
                self.target.push(record)
            }
            Err(e) => {
                self.malformed += 1;
                debug!(error = %e, "skipping malformed line");
                Ok(Outcome::Skip)
            }
        }
    }

    fn signal(&mut self, signal: &Signal<String>) -> Result<()> {
        ensure_open(self.closed, self.name())?;
        match signal.try_map(|line| Record::parse(line)) {
            Ok(signal) => {
                self.pending_boundary = None;
                self.target.signal(&signal)
            }
            Err(_) => {
                let Signal::BatchEnd(end) = signal;
                debug!(
                    batch_size = end.batch_size,
                    "boundary on a malformed line, forwarding with the next record"
                );
                *self.pending_boundary.get_or_insert(0) += end.batch_size;
                Ok(())
            }
        }
    }

    fn close(&mut self) -> Result<()> {
        if std::mem::replace(&mut self.closed, true) {
            return Ok(());
        }
        self.target.close()
    }

    fn name(&self) -> &str {
        "to_record"
    }
}
