//! Chronological k-way merge of independently progressing sources.
//!
//! Every source is a [`Pull`] whose chain ends in an [`Inlet`]. The engine
//! keeps at most one pending item per open source in a min-heap keyed by
//! `(key, tag)` and pulls from a source only when that source has nothing
//! pending, so no source is read ahead of the merged output.

use crate::error::Result;
use crate::shutdown::Shutdown;
use crate::source::{Pull, PullOutcome};
use crate::stage::{close_all, ensure_open, BoxStage, Outcome, Stage};
use parking_lot::Mutex;
use std::cmp::{Ordering, Reverse};
use std::collections::BinaryHeap;
use std::fmt;
use std::sync::Arc;
use tracing::{debug, warn};

/// Identifies one source of a merge, in the order the inputs were given
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct Tag(pub usize);

impl fmt::Display for Tag {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "#{}", self.0)
    }
}

struct Pending<K, T> {
    key: K,
    tag: Tag,
    item: T,
}

impl<K: Ord, T> Pending<K, T> {
    fn rank(&self) -> (&K, Tag) {
        (&self.key, self.tag)
    }
}

impl<K: Ord, T> PartialEq for Pending<K, T> {
    fn eq(&self, other: &Self) -> bool {
        self.rank() == other.rank()
    }
}

impl<K: Ord, T> Eq for Pending<K, T> {}

impl<K: Ord, T> PartialOrd for Pending<K, T> {
    fn partial_cmp(&self, other: &Self) -> Option<Ordering> {
        Some(self.cmp(other))
    }
}

impl<K: Ord, T> Ord for Pending<K, T> {
    fn cmp(&self, other: &Self) -> Ordering {
        self.rank().cmp(&other.rank())
    }
}

struct Core<K, T> {
    key_fn: Box<dyn Fn(&T) -> K + Send>,
    heap: BinaryHeap<Reverse<Pending<K, T>>>,
    pending: Vec<bool>,
    closed: Vec<bool>,
    last_key: Vec<Option<K>>,
    draining: bool,
}

impl<K: Ord, T> Core<K, T> {
    /// Tags of the pending entries, ascending by `(key, tag)`
    fn priority(&self) -> Vec<Tag> {
        let mut entries: Vec<_> = self.heap.iter().map(|Reverse(p)| p).collect();
        entries.sort();
        entries.into_iter().map(|p| p.tag).collect()
    }

    fn pop(&mut self) -> Option<Pending<K, T>> {
        let Reverse(next) = self.heap.pop()?;
        self.pending[next.tag.0] = false;
        Some(next)
    }
}

type SharedCore<K, T> = Arc<Mutex<Core<K, T>>>;

/// The end of a source chain: hands items to the merge engine
pub struct Inlet<K, T> {
    core: SharedCore<K, T>,
    tag: Tag,
    closed: bool,
}

impl<K, T> Inlet<K, T> {
    pub fn tag(&self) -> Tag {
        self.tag
    }
}

impl<K, T> Stage<T> for Inlet<K, T>
where
    K: Ord + Clone + Send,
    T: Send,
{
    fn push(&mut self, item: T) -> Result<Outcome> {
        ensure_open(self.closed, self.name())?;
        let mut core = self.core.lock();
        let key = (core.key_fn)(&item);
        let i = self.tag.0;
        debug_assert!(
            core.draining || !core.pending[i],
            "source {} produced a second item before the first was merged",
            self.tag
        );
        debug_assert!(
            core.last_key[i].as_ref().map_or(true, |last| *last <= key),
            "source {} produced a key lower than its previous one",
            self.tag
        );
        core.last_key[i] = Some(key.clone());
        core.pending[i] = true;
        core.heap.push(Reverse(Pending {
            key,
            tag: self.tag,
            item,
        }));
        Ok(Outcome::Accepted)
    }

    fn close(&mut self) -> Result<()> {
        if std::mem::replace(&mut self.closed, true) {
            return Ok(());
        }
        self.core.lock().closed[self.tag.0] = true;
        Ok(())
    }

    fn name(&self) -> &str {
        "inlet"
    }
}

type SourceFactory<K, T> = Box<dyn FnOnce(Inlet<K, T>) -> Box<dyn Pull>>;

/// One merge input: builds a source around its [`Inlet`], and names the
/// target that receives the items this source wins
pub struct MergeInput<K, T> {
    factory: SourceFactory<K, T>,
    target: BoxStage<T>,
}

impl<K, T> MergeInput<K, T> {
    pub fn new<P, F>(factory: F, target: impl Stage<T> + 'static) -> Self
    where
        P: Pull + 'static,
        F: FnOnce(Inlet<K, T>) -> P + 'static,
    {
        Self {
            factory: Box::new(move |inlet| Box::new(factory(inlet)) as Box<dyn Pull>),
            target: Box::new(target),
        }
    }
}

/// What one [`Merge::step`] emitted
#[derive(Debug, Clone, PartialEq)]
pub struct Emission<T> {
    pub tag: Tag,
    pub item: T,
    /// Pending tags ordered by key as they stood before this emission; the
    /// emitted tag comes first
    pub priority: Vec<Tag>,
}

#[derive(Debug, Clone, PartialEq)]
pub enum Step<T> {
    Emitted(Emission<T>),
    /// Every source is exhausted and nothing is pending; targets are closed
    Done,
}

/// Totals of a [`Merge::run_until`]
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct MergeReport {
    pub emitted: u64,
    pub interrupted: bool,
}

/// Merges tagged sources into one stream ordered by `(key, tag)`.
///
/// Given sources whose keys never decrease, every emitted item has a key at
/// least as large as all earlier ones. Items with equal keys come out in tag
/// order.
pub struct Merge<K, T> {
    core: SharedCore<K, T>,
    sources: Vec<Box<dyn Pull>>,
    targets: Vec<BoxStage<T>>,
    priority: Vec<Tag>,
    warmed_up: bool,
    closed: bool,
}

impl<K, T> Merge<K, T>
where
    K: Ord + Clone + Send + 'static,
    T: Clone + Send + 'static,
{
    pub fn new(inputs: Vec<MergeInput<K, T>>, key_fn: impl Fn(&T) -> K + Send + 'static) -> Self {
        let n = inputs.len();
        let core = Arc::new(Mutex::new(Core {
            key_fn: Box::new(key_fn),
            heap: BinaryHeap::with_capacity(n),
            pending: vec![false; n],
            closed: vec![false; n],
            last_key: vec![None; n],
            draining: false,
        }));

        let mut sources = Vec::with_capacity(n);
        let mut targets = Vec::with_capacity(n);
        for (i, input) in inputs.into_iter().enumerate() {
            let inlet = Inlet {
                core: Arc::clone(&core),
                tag: Tag(i),
                closed: false,
            };
            sources.push((input.factory)(inlet));
            targets.push(input.target);
        }

        Self {
            core,
            sources,
            targets,
            priority: Vec::new(),
            warmed_up: false,
            closed: false,
        }
    }

    /// Pull from `tag` until it has a pending item or is exhausted.
    /// Returns whether an item is pending.
    fn fill(&mut self, tag: Tag) -> Result<bool> {
        loop {
            {
                let core = self.core.lock();
                if core.pending[tag.0] {
                    return Ok(true);
                }
                if core.closed[tag.0] {
                    return Ok(false);
                }
            }
            if self.sources[tag.0].pull()? == PullOutcome::Exhausted {
                debug!(tag = %tag, "merge source exhausted");
                self.core.lock().closed[tag.0] = true;
                return Ok(false);
            }
        }
    }

    /// Emit the next item, or report that the merge is complete
    pub fn step(&mut self) -> Result<Step<T>> {
        if self.closed {
            return Ok(Step::Done);
        }

        if !self.warmed_up {
            self.warmed_up = true;
            for i in 0..self.sources.len() {
                self.fill(Tag(i))?;
            }
        } else {
            // The priority list leads; sources missing from it still get a
            // turn so an exhausted favourite never starves the others.
            let mut order = std::mem::take(&mut self.priority);
            let rest: Vec<Tag> = (0..self.sources.len())
                .map(Tag)
                .filter(|t| !order.contains(t))
                .collect();
            order.extend(rest);
            for tag in order {
                if self.fill(tag)? {
                    let core = self.core.lock();
                    let missing = (0..self.sources.len())
                        .any(|i| !core.pending[i] && !core.closed[i]);
                    if !missing {
                        break;
                    }
                }
            }
        }

        let next = {
            let mut core = self.core.lock();
            self.priority = core.priority();
            core.pop()
        };
        let Some(next) = next else {
            self.close()?;
            return Ok(Step::Done);
        };

        self.targets[next.tag.0].push(next.item.clone())?;
        Ok(Step::Emitted(Emission {
            tag: next.tag,
            item: next.item,
            priority: self.priority.clone(),
        }))
    }

    /// Merge everything; returns the number of emitted items
    pub fn run(&mut self) -> Result<u64> {
        Ok(self.run_until(&Shutdown::new())?.emitted)
    }

    /// Merge until every source is drained or `shutdown` fires. Teardown runs
    /// on every path.
    pub fn run_until(&mut self, shutdown: &Shutdown) -> Result<MergeReport> {
        let mut report = MergeReport::default();
        let result = loop {
            if shutdown.is_triggered() {
                report.interrupted = true;
                break Ok(());
            }
            match self.step() {
                Ok(Step::Emitted(_)) => report.emitted += 1,
                Ok(Step::Done) => break Ok(()),
                Err(e) => break Err(e),
            }
        };

        let closed = self.close();
        if let (Err(_), Err(e)) = (&result, &closed) {
            warn!(error = %e, "failed to close merge after error");
        }
        result.and(closed)?;
        Ok(report)
    }

    /// Close every source, flush the pending items to their targets in
    /// `(key, tag)` order and close the targets. Idempotent.
    pub fn close(&mut self) -> Result<()> {
        if std::mem::replace(&mut self.closed, true) {
            return Ok(());
        }
        self.core.lock().draining = true;

        let mut first_error = None;
        for (i, source) in self.sources.iter_mut().enumerate() {
            if let Err(e) = source.close() {
                warn!(tag = i, error = %e, "failed to close merge source");
                first_error.get_or_insert(e);
            }
        }

        let mut flushed = 0;
        loop {
            let Some(next) = self.core.lock().pop() else {
                break;
            };
            flushed += 1;
            if let Err(e) = self.targets[next.tag.0].push(next.item) {
                warn!(tag = %next.tag, error = %e, "failed to flush pending item");
                first_error.get_or_insert(e);
            }
        }
        if flushed > 0 {
            debug!(flushed, "flushed pending items");
        }

        if let Err(e) = close_all(self.targets.iter_mut()) {
            first_error.get_or_insert(e);
        }
        first_error.map_or(Ok(()), Err)
    }
}

impl<T> Merge<T, T>
where
    T: Ord + Clone + Send + 'static,
{
    /// Order by the items themselves
    pub fn by_item(inputs: Vec<MergeInput<T, T>>) -> Self {
        Self::new(inputs, T::clone)
    }
}
