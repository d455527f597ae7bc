use crate::error::{PipelineError, Result};
use crate::record::Timestamped;
use crate::stage::{ensure_open, Outcome, Stage};
use chrono::format::{Item, StrftimeItems};
use chrono::NaiveDateTime;
use flate2::write::GzEncoder;
use flate2::Compression;
use std::collections::{BTreeMap, HashSet};
use std::fmt::Write as _;
use std::fs::{self, File, OpenOptions};
use std::io::{self, BufWriter, Write};
use std::marker::PhantomData;
use std::path::{Path, PathBuf};
use tracing::{debug, info, warn};

/// A validated strftime pattern
#[derive(Debug, Clone)]
pub struct TimeTemplate {
    template: String,
}

impl TimeTemplate {
    pub fn new(template: &str) -> Result<Self> {
        if StrftimeItems::new(template).any(|item| matches!(item, Item::Error)) {
            return Err(PipelineError::Template {
                template: template.to_owned(),
                reason: "unknown format specifier".into(),
            });
        }
        Ok(Self {
            template: template.to_owned(),
        })
    }

    pub fn render(&self, timestamp: &NaiveDateTime) -> Result<String> {
        let mut rendered = String::new();
        write!(rendered, "{}", timestamp.format(&self.template)).map_err(|_| {
            PipelineError::Template {
                template: self.template.clone(),
                reason: "cannot be applied to a naive timestamp".into(),
            }
        })?;
        Ok(rendered)
    }

    pub fn as_str(&self) -> &str {
        &self.template
    }
}

/// How a bucket file is opened the first time it is used in a run
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum OpenMode {
    #[default]
    Append,
    Truncate,
}

type BucketWriter = GzEncoder<BufWriter<File>>;

/// Writes items to gzip files named by applying a time template to their
/// timestamp, one raw line per item.
///
/// At most `max_open_files` buckets are open at once. Opening another one
/// first closes the open bucket with the smallest key. A bucket reopened
/// later in the same run is always appended to, so eviction never loses
/// lines; each reopen adds a gzip member to the file.
pub struct GroupSink<T> {
    template: TimeTemplate,
    base_dir: PathBuf,
    max_open_files: usize,
    mode: OpenMode,
    files: BTreeMap<String, BucketWriter>,
    opened: HashSet<String>,
    closed: bool,
    _item: PhantomData<fn(T)>,
}

impl<T> GroupSink<T> {
    pub fn new(template: &str) -> Result<Self> {
        Ok(Self {
            template: TimeTemplate::new(template)?,
            base_dir: PathBuf::new(),
            max_open_files: 1,
            mode: OpenMode::default(),
            files: BTreeMap::new(),
            opened: HashSet::new(),
            closed: false,
            _item: PhantomData,
        })
    }

    /// Directory the rendered file names are relative to
    pub fn in_dir(mut self, base_dir: impl AsRef<Path>) -> Self {
        self.base_dir = base_dir.as_ref().to_path_buf();
        self
    }

    pub fn max_open_files(mut self, max_open_files: usize) -> Self {
        self.max_open_files = max_open_files.max(1);
        self
    }

    pub fn open_mode(mut self, mode: OpenMode) -> Self {
        self.mode = mode;
        self
    }

    /// Keys of the buckets that are currently open
    pub fn open_buckets(&self) -> Vec<&str> {
        self.files.keys().map(String::as_str).collect()
    }

    fn writer(&mut self, key: &str) -> Result<&mut BucketWriter> {
        if !self.files.contains_key(key) {
            if self.files.len() >= self.max_open_files {
                if let Some((evicted, writer)) = self.files.pop_first() {
                    debug!(bucket = %evicted, "evicting bucket");
                    finish(writer)?;
                }
            }

            let path = self.base_dir.join(key);
            if let Some(parent) = path.parent().filter(|p| !p.as_os_str().is_empty()) {
                fs::create_dir_all(parent)?;
            }
            let reopen = !self.opened.insert(key.to_owned());
            let mut options = OpenOptions::new();
            options.create(true);
            if reopen || self.mode == OpenMode::Append {
                options.append(true);
            } else {
                options.write(true).truncate(true);
            }
            let file = options.open(&path)?;
            info!(bucket = key, path = %path.display(), reopen, "opened bucket");
            self.files.insert(
                key.to_owned(),
                GzEncoder::new(BufWriter::new(file), Compression::default()),
            );
        }
        // present: inserted above when missing
        self.files
            .get_mut(key)
            .ok_or_else(|| PipelineError::ConfigError(format!("bucket `{key}` is not open")))
    }
}

fn finish(writer: BucketWriter) -> io::Result<()> {
    let mut inner = writer.finish()?;
    inner.flush()
}

impl<T: Timestamped> Stage<T> for GroupSink<T> {
    fn push(&mut self, item: T) -> Result<Outcome> {
        ensure_open(self.closed, self.name())?;
        let Some(timestamp) = item.timestamp() else {
            debug!("skipping item without a timestamp");
            return Ok(Outcome::Skip);
        };
        let key = self.template.render(&timestamp)?;
        let writer = self.writer(&key)?;
        writer.write_all(item.raw_line().as_bytes())?;
        writer.write_all(b"\n")?;
        Ok(Outcome::Accepted)
    }

    fn close(&mut self) -> Result<()> {
        if std::mem::replace(&mut self.closed, true) {
            return Ok(());
        }
        let mut first_error = None;
        for (bucket, writer) in std::mem::take(&mut self.files) {
            if let Err(e) = finish(writer) {
                warn!(bucket = %bucket, error = %e, "failed to finish bucket");
                first_error.get_or_insert(e);
            }
        }
        first_error.map_or(Ok(()), |e| Err(e.into()))
    }

    fn name(&self) -> &str {
        "group"
    }
}

impl<T> Drop for GroupSink<T> {
    fn drop(&mut self) {
        if self.closed {
            return;
        }
        self.closed = true;
        for (bucket, writer) in std::mem::take(&mut self.files) {
            if let Err(e) = finish(writer) {
                warn!(bucket = %bucket, error = %e, "failed to finish bucket on drop");
            }
        }
    }
}
