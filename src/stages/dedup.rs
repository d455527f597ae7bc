use crate::error::Result;
use crate::record::Record;
use crate::stage::{ensure_open, BoxStage, Outcome, Signal, Stage};
use std::collections::HashSet;
use std::hash::Hash;

/// Drops items whose identity has been seen before.
///
/// The set of seen identities grows without bound for the lifetime of the
/// stage. Items without an identity are always forwarded.
pub struct Dedup<T, K> {
    target: BoxStage<T>,
    identity: Box<dyn Fn(&T) -> Option<K> + Send>,
    seen: HashSet<K>,
    dropped: u64,
    closed: bool,
}

impl<T, K> Dedup<T, K>
where
    K: Eq + Hash + Send,
{
    pub fn new(
        target: impl Stage<T> + 'static,
        identity: impl Fn(&T) -> Option<K> + Send + 'static,
    ) -> Self {
        Self {
            target: Box::new(target),
            identity: Box::new(identity),
            seen: HashSet::new(),
            dropped: 0,
            closed: false,
        }
    }

    /// Treat `seen` as already delivered
    pub fn with_seen(mut self, seen: impl IntoIterator<Item = K>) -> Self {
        self.seen.extend(seen);
        self
    }

    /// Number of duplicates dropped so far
    pub fn dropped(&self) -> u64 {
        self.dropped
    }
}

impl<T: Clone + Eq + Hash + Send + 'static> Dedup<T, T> {
    /// Deduplicate on the item itself
    pub fn by_value(target: impl Stage<T> + 'static) -> Self {
        Self::new(target, |item: &T| Some(item.clone()))
    }
}

impl Dedup<Record, u64> {
    /// Deduplicate records on their id
    pub fn by_id(target: impl Stage<Record> + 'static) -> Self {
        Self::new(target, Record::id)
    }
}

impl<T, K> Stage<T> for Dedup<T, K>
where
    K: Eq + Hash + Send,
{
    fn push(&mut self, item: T) -> Result<Outcome> {
        ensure_open(self.closed, self.name())?;
        if let Some(key) = (self.identity)(&item) {
            if !self.seen.insert(key) {
                self.dropped += 1;
                return Ok(Outcome::Accepted);
            }
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
        "dedup"
    }
}
