use crate::error::Result;
use crate::record::Record;
use crate::stage::{ensure_open, Outcome, Stage};
use crate::stages::count::Counts;
use std::fmt::Display;
use std::hash::Hash;
use std::io::Write;
use std::marker::PhantomData;

/// How a [`PrintSink`] renders a record
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RecordFormat {
    /// The line the record was parsed from
    Raw,
    /// Only the text, on one line
    Text,
    /// Author, text, permalink, location and time, followed by a blank line
    Summary,
    /// Indented JSON
    Pretty,
}

/// Writes every record it receives to `writer`
pub struct PrintSink<W> {
    writer: W,
    format: RecordFormat,
    closed: bool,
}

impl<W: Write + Send> PrintSink<W> {
    pub fn new(writer: W, format: RecordFormat) -> Self {
        Self {
            writer,
            format,
            closed: false,
        }
    }

    pub fn get_ref(&self) -> &W {
        &self.writer
    }
}

impl<W: Write + Send> Stage<Record> for PrintSink<W> {
    fn push(&mut self, record: Record) -> Result<Outcome> {
        ensure_open(self.closed, self.name())?;
        match self.format {
            RecordFormat::Raw => writeln!(self.writer, "{}", record.raw())?,
            RecordFormat::Text => writeln!(self.writer, "{}", record.text().replace('\n', " "))?,
            RecordFormat::Summary => writeln!(self.writer, "{record}\n")?,
            RecordFormat::Pretty => {
                serde_json::to_writer_pretty(&mut self.writer, record.json())
                    .map_err(std::io::Error::from)?;
                writeln!(self.writer)?;
            }
        }
        Ok(Outcome::Accepted)
    }

    fn close(&mut self) -> Result<()> {
        if std::mem::replace(&mut self.closed, true) {
            return Ok(());
        }
        self.writer.flush()?;
        Ok(())
    }

    fn name(&self) -> &str {
        "print"
    }
}

/// Writes each received [`Counts`] as `key count` lines ordered by key
pub struct CounterPrinter<W, K> {
    writer: W,
    closed: bool,
    _key: PhantomData<fn(K)>,
}

impl<W: Write + Send, K> CounterPrinter<W, K> {
    pub fn new(writer: W) -> Self {
        Self {
            writer,
            closed: false,
            _key: PhantomData,
        }
    }
}

impl<W, K> Stage<Counts<K>> for CounterPrinter<W, K>
where
    W: Write + Send,
    K: Display + Ord + Hash,
{
    fn push(&mut self, counts: Counts<K>) -> Result<Outcome> {
        ensure_open(self.closed, self.name())?;
        for (key, n) in counts.sorted() {
            writeln!(self.writer, "{key} {n}")?;
        }
        Ok(Outcome::Accepted)
    }

    fn close(&mut self) -> Result<()> {
        if std::mem::replace(&mut self.closed, true) {
            return Ok(());
        }
        self.writer.flush()?;
        Ok(())
    }

    fn name(&self) -> &str {
        "counter_printer"
    }
}
