//! Line sources and the drivers that feed them into stage chains.

use crate::error::Result;
use crate::shutdown::Shutdown;
use crate::stage::{Outcome, Stage};
use flate2::read::MultiGzDecoder;
use std::fs::File;
use std::io::{self, BufRead, BufReader};
use std::path::{Path, PathBuf};
use tracing::{debug, warn};
use walkdir::WalkDir;

/// Result of asking a source for one more item
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PullOutcome {
    /// One item was pushed into the chain
    Pushed(Outcome),
    /// The source has no more items and its chain is closed
    Exhausted,
}

/// A source that pushes one item into its chain per call
pub trait Pull: Send {
    fn pull(&mut self) -> Result<PullOutcome>;

    /// Close the chain. Idempotent.
    fn close(&mut self) -> Result<()>;
}

/// Pushes items from an iterator into the head of a chain, one per pull.
/// The chain is closed as soon as the iterator runs out.
pub struct Feeder<I, S> {
    items: I,
    head: S,
    closed: bool,
}

impl<I, S> Feeder<I, S> {
    pub fn new(items: I, head: S) -> Self {
        Self {
            items,
            head,
            closed: false,
        }
    }
}

impl<T, I, S> Pull for Feeder<I, S>
where
    I: Iterator<Item = Result<T>> + Send,
    S: Stage<T>,
{
    fn pull(&mut self) -> Result<PullOutcome> {
        if self.closed {
            return Ok(PullOutcome::Exhausted);
        }
        match self.items.next() {
            Some(item) => Ok(PullOutcome::Pushed(self.head.push(item?)?)),
            None => {
                self.close()?;
                Ok(PullOutcome::Exhausted)
            }
        }
    }

    fn close(&mut self) -> Result<()> {
        if std::mem::replace(&mut self.closed, true) {
            return Ok(());
        }
        self.head.close()
    }
}

impl<P: Pull + ?Sized> Pull for Box<P> {
    fn pull(&mut self) -> Result<PullOutcome> {
        (**self).pull()
    }

    fn close(&mut self) -> Result<()> {
        (**self).close()
    }
}

/// What [`drive`] did
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct DriveReport {
    pub accepted: u64,
    pub skipped: u64,
    /// The run stopped because shutdown was triggered
    pub interrupted: bool,
}

/// Pull from `source` until it is exhausted, fails or `shutdown` fires.
/// The source is closed on every path.
pub fn drive<P: Pull + ?Sized>(source: &mut P, shutdown: &Shutdown) -> Result<DriveReport> {
    let mut report = DriveReport::default();
    let result = loop {
        if shutdown.is_triggered() {
            report.interrupted = true;
            break Ok(());
        }
        match source.pull() {
            Ok(PullOutcome::Pushed(Outcome::Accepted)) => report.accepted += 1,
            Ok(PullOutcome::Pushed(Outcome::Skip)) => report.skipped += 1,
            Ok(PullOutcome::Exhausted) => break Ok(()),
            Err(e) => break Err(e),
        }
    };

    let closed = source.close();
    if let (Err(_), Err(e)) = (&result, &closed) {
        warn!(error = %e, "failed to close source after error");
    }
    result.and(closed)?;
    debug!(
        accepted = report.accepted,
        skipped = report.skipped,
        interrupted = report.interrupted,
        "source drained"
    );
    Ok(report)
}

/// Lines from `reader`, up to the first empty line
pub fn lines_from_reader(reader: impl BufRead + Send + 'static) -> LineReader {
    LineReader {
        files: Vec::new().into_iter(),
        current: Some(Box::new(reader)),
        finished: false,
    }
}

/// Lines from every file under `path`, or from stdin when there is no path.
///
/// A directory is walked recursively in file-name order; `.gz` files are
/// decompressed. Reading stops at the first empty line.
pub fn read_lines(path: Option<&Path>) -> Result<LineReader> {
    let Some(path) = path else {
        return Ok(lines_from_reader(BufReader::new(io::stdin())));
    };

    let mut files = Vec::new();
    for entry in WalkDir::new(path).sort_by_file_name() {
        let entry = entry.map_err(io::Error::from)?;
        if entry.file_type().is_file() {
            files.push(entry.into_path());
        }
    }
    debug!(path = %path.display(), files = files.len(), "reading input files");

    Ok(LineReader {
        files: files.into_iter(),
        current: None,
        finished: false,
    })
}

fn open(path: &Path) -> io::Result<Box<dyn BufRead + Send>> {
    let file = File::open(path)?;
    if path.extension().is_some_and(|ext| ext == "gz") {
        Ok(Box::new(BufReader::new(MultiGzDecoder::new(file))))
    } else {
        Ok(Box::new(BufReader::new(file)))
    }
}

/// Iterator over input lines; see [`read_lines`]
pub struct LineReader {
    files: std::vec::IntoIter<PathBuf>,
    current: Option<Box<dyn BufRead + Send>>,
    finished: bool,
}

impl Iterator for LineReader {
    type Item = Result<String>;

    fn next(&mut self) -> Option<Self::Item> {
        while !self.finished {
            if self.current.is_none() {
                match self.files.next() {
                    Some(path) => match open(&path) {
                        Ok(reader) => self.current = Some(reader),
                        Err(e) => return Some(Err(e.into())),
                    },
                    None => {
                        self.finished = true;
                        break;
                    }
                }
            }
            let Some(reader) = self.current.as_mut() else {
                continue;
            };

            let mut buf = Vec::new();
            match reader.read_until(b'\n', &mut buf) {
                Ok(0) => self.current = None,
                Ok(_) => {
                    let Ok(line) = String::from_utf8(buf) else {
                        debug!("skipping line that is not valid UTF-8");
                        continue;
                    };
                    let trimmed = line.trim_end_matches(['\n', '\r']);
                    if trimmed.is_empty() {
                        debug!("empty line, end of input");
                        self.finished = true;
                        break;
                    }
                    return Some(Ok(trimmed.to_owned()));
                }
                Err(e) => return Some(Err(e.into())),
            }
        }
        None
    }
}
