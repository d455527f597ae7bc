use crate::error::Result;
use crate::record::Record;
use crate::stage::{ensure_open, BoxStage, Outcome, Signal, Stage};
use crate::stages::group::TimeTemplate;
use parking_lot::Mutex;
use std::collections::HashMap;
use std::hash::Hash;
use std::sync::Arc;

/// Occurrence counts per key
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Counts<K: Eq + Hash> {
    counts: HashMap<K, u64>,
}

/// A long-lived accumulator shared between a [`Count`] stage and its owner
pub type SharedCounts<K> = Arc<Mutex<Counts<K>>>;

impl<K: Eq + Hash> Default for Counts<K> {
    fn default() -> Self {
        Self {
            counts: HashMap::new(),
        }
    }
}

impl<K: Eq + Hash> Counts<K> {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn shared() -> SharedCounts<K> {
        Arc::new(Mutex::new(Self::new()))
    }

    pub fn add(&mut self, key: K, n: u64) {
        *self.counts.entry(key).or_insert(0) += n;
    }

    pub fn update(&mut self, keys: impl IntoIterator<Item = K>) {
        for key in keys {
            self.add(key, 1);
        }
    }

    pub fn get(&self, key: &K) -> u64 {
        self.counts.get(key).copied().unwrap_or(0)
    }

    pub fn len(&self) -> usize {
        self.counts.len()
    }

    pub fn is_empty(&self) -> bool {
        self.counts.is_empty()
    }

    pub fn total(&self) -> u64 {
        self.counts.values().sum()
    }

    pub fn iter(&self) -> impl Iterator<Item = (&K, &u64)> {
        self.counts.iter()
    }

    /// Entries ordered by key
    pub fn sorted(&self) -> Vec<(&K, u64)>
    where
        K: Ord,
    {
        let mut entries: Vec<_> = self.counts.iter().map(|(k, v)| (k, *v)).collect();
        entries.sort_by(|a, b| a.0.cmp(b.0));
        entries
    }
}

impl<K: Eq + Hash + Clone> Counts<K> {
    pub fn merge(&mut self, other: &Counts<K>) {
        for (key, n) in &other.counts {
            self.add(key.clone(), *n);
        }
    }
}

impl<K: Eq + Hash> FromIterator<(K, u64)> for Counts<K> {
    fn from_iter<I: IntoIterator<Item = (K, u64)>>(iter: I) -> Self {
        let mut counts = Self::new();
        for (key, n) in iter {
            counts.add(key, n);
        }
        counts
    }
}

/// Counts keys derived from each item.
///
/// Counts build up in a local table. On every batch boundary, and once more
/// on close, the local table is sent to the optional target (the counts since
/// the previous boundary), merged into every long-lived accumulator, and reset.
pub struct Count<T, K: Eq + Hash> {
    provider: Box<dyn Fn(&T) -> Vec<K> + Send>,
    local: Counts<K>,
    accumulators: Vec<SharedCounts<K>>,
    target: Option<BoxStage<Counts<K>>>,
    closed: bool,
}

impl<T, K> Count<T, K>
where
    K: Eq + Hash + Clone + Send,
{
    pub fn new(provider: impl Fn(&T) -> Vec<K> + Send + 'static) -> Self {
        Self {
            provider: Box::new(provider),
            local: Counts::new(),
            accumulators: Vec::new(),
            target: None,
            closed: false,
        }
    }

    /// Merge every flushed batch into `accumulator`
    pub fn with_accumulator(mut self, accumulator: SharedCounts<K>) -> Self {
        self.accumulators.push(accumulator);
        self
    }

    /// Stream per-batch counts to `target`
    pub fn with_target(mut self, target: impl Stage<Counts<K>> + 'static) -> Self {
        self.target = Some(Box::new(target));
        self
    }

    fn flush(&mut self) -> Result<()> {
        let local = std::mem::take(&mut self.local);
        for accumulator in &self.accumulators {
            accumulator.lock().merge(&local);
        }
        if let Some(target) = self.target.as_mut() {
            target.push(local)?;
        }
        Ok(())
    }
}

impl<T: Clone + Eq + Hash + Send + 'static> Count<T, T> {
    /// Count the items themselves
    pub fn items() -> Self {
        Self::new(|item: &T| vec![item.clone()])
    }
}

/// Count records per time window, e.g. `%Y-%m-%d-%H` for hourly counts
pub fn timeline(window: &str) -> Result<Count<Record, String>> {
    let window = TimeTemplate::new(window)?;
    Ok(Count::new(move |record: &Record| {
        record
            .created_at()
            .and_then(|created_at| window.render(&created_at).ok())
            .into_iter()
            .collect()
    }))
}

/// Count tokens and hashtags. Distinguished hashtags are counted as `#tag`.
pub fn count_tokens(distinguish_hashtags: bool) -> Count<Record, String> {
    Count::new(move |record: &Record| {
        let mut keys = record.tokens();
        keys.extend(record.hashtags().into_iter().map(|h| {
            if distinguish_hashtags {
                format!("#{h}")
            } else {
                h
            }
        }));
        keys
    })
}

impl<T, K> Stage<T> for Count<T, K>
where
    K: Eq + Hash + Clone + Send,
{
    fn push(&mut self, item: T) -> Result<Outcome> {
        ensure_open(self.closed, self.name())?;
        let keys = (self.provider)(&item);
        self.local.update(keys);
        Ok(Outcome::Accepted)
    }

    fn signal(&mut self, signal: &Signal<T>) -> Result<()> {
        ensure_open(self.closed, self.name())?;
        match signal {
            Signal::BatchEnd(_) => self.flush(),
        }
    }

    fn close(&mut self) -> Result<()> {
        if std::mem::replace(&mut self.closed, true) {
            return Ok(());
        }
        let flushed = self.flush();
        let closed = match self.target.as_mut() {
            Some(target) => target.close(),
            None => Ok(()),
        };
        flushed.and(closed)
    }

    fn name(&self) -> &str {
        "count"
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::record::fixtures::RECORDS;
    use crate::stage::CollectSink;
    use crate::stages::Batch;

    fn records() -> Vec<Record> {
        RECORDS.iter().map(|l| Record::parse(l).unwrap()).collect()
    }

    #[test]
    fn test_close_flushes_to_target_and_accumulator() {
        let total = Counts::shared();
        let (sink, collector) = CollectSink::new();
        let mut count = Count::items().with_accumulator(total.clone()).with_target(sink);

        for item in [1, 1, 2, 3, 4, 4, 4, 4] {
            count.push(item).unwrap();
        }
        assert!(collector.is_empty());
        count.close().unwrap();

        let flushed = collector.items();
        assert_eq!(flushed.len(), 1);
        assert_eq!(flushed[0].sorted(), vec![(&1, 2), (&2, 1), (&3, 1), (&4, 4)]);
        assert_eq!(total.lock().get(&4), 4);
        assert!(collector.is_closed());
    }

    #[test]
    fn test_batch_end_streams_partial_counts() {
        let total = Counts::shared();
        let (sink, collector) = CollectSink::new();
        let count = Count::items().with_accumulator(total.clone()).with_target(sink);
        let mut batch = Batch::new(count);

        for item in ["a", "a", "b", "b", "b", "c"] {
            batch.push(item).unwrap();
        }
        batch.close().unwrap();

        let partials: Vec<_> = collector.items().iter().map(Counts::total).collect();
        assert_eq!(partials, vec![2, 3, 1]);
        assert_eq!(total.lock().get(&"b"), 3);
        assert_eq!(total.lock().total(), 6);
    }

    #[test]
    fn test_timeline_through_batches() {
        let total = Counts::shared();
        let timeline = timeline("%Y-%m-%d-%H").unwrap().with_accumulator(total.clone());
        let mut batch = Batch::by_key(timeline, |r: &Record| r.created_at());

        for record in records() {
            batch.push(record).unwrap();
        }
        batch.close().unwrap();

        let total = total.lock();
        assert_eq!(total.len(), 3);
        assert_eq!(total.get(&"2012-04-13-13".to_string()), 1);
        assert_eq!(total.get(&"2012-04-26-07".to_string()), 1);
        assert_eq!(total.get(&"2012-05-12-09".to_string()), 1);
    }

    #[test]
    fn test_count_tokens() {
        let total = Counts::shared();
        let mut count = count_tokens(true).with_accumulator(total.clone());
        for record in records() {
            count.push(record).unwrap();
        }
        count.close().unwrap();

        let total = total.lock();
        assert_eq!(total.get(&"#pp12".to_string()), 1);
        assert_eq!(total.get(&"#pygrunn".to_string()), 1);
        assert_eq!(total.get(&"pinkpop".to_string()), 1);
        assert_eq!(total.get(&"pygrunn".to_string()), 0);
    }

    #[test]
    fn test_invalid_window_is_rejected() {
        assert!(timeline("%Q").is_err());
    }
}
