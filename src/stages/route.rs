use crate::error::Result;
use crate::stage::{close_all, ensure_open, BoxStage, Outcome, Signal, Stage};

/// Decides whether an item goes to a route, given `(current, first_of_batch)`
pub type Predicate<T> = Box<dyn Fn(&T, &T) -> bool + Send>;

/// Routes items to targets by predicate.
///
/// Predicates are evaluated in order against the current item and the first
/// item of the current batch. An item goes to every matching target, or only
/// to the first one when `send_to_all` is off. Unmatched items go to the
/// dustbin if there is one and are dropped otherwise.
pub struct Route<T> {
    routes: Vec<(BoxStage<T>, Predicate<T>)>,
    dustbin: Option<BoxStage<T>>,
    send_to_all: bool,
    first: Option<T>,
    closed: bool,
}

impl<T> Route<T> {
    pub fn new(routes: Vec<(BoxStage<T>, Predicate<T>)>) -> Self {
        Self {
            routes,
            dustbin: None,
            send_to_all: true,
            first: None,
            closed: false,
        }
    }

    pub fn with_dustbin(mut self, dustbin: impl Stage<T> + 'static) -> Self {
        self.dustbin = Some(Box::new(dustbin));
        self
    }

    /// Stop at the first matching route
    pub fn first_match_only(mut self) -> Self {
        self.send_to_all = false;
        self
    }
}

impl<T: Clone + Send> Stage<T> for Route<T> {
    fn push(&mut self, item: T) -> Result<Outcome> {
        ensure_open(self.closed, self.name())?;
        let first = self.first.get_or_insert_with(|| item.clone());

        let mut sent = false;
        for (target, predicate) in self.routes.iter_mut() {
            if predicate(&item, first) {
                target.push(item.clone())?;
                sent = true;
                if !self.send_to_all {
                    break;
                }
            }
        }

        if !sent {
            if let Some(dustbin) = self.dustbin.as_mut() {
                dustbin.push(item)?;
            }
        }
        Ok(Outcome::Accepted)
    }

    /// A batch boundary makes the next item the new first of batch.
    fn signal(&mut self, signal: &Signal<T>) -> Result<()> {
        ensure_open(self.closed, self.name())?;
        match signal {
            Signal::BatchEnd(_) => self.first = None,
        }
        for (target, _) in self.routes.iter_mut() {
            target.signal(signal)?;
        }
        if let Some(dustbin) = self.dustbin.as_mut() {
            dustbin.signal(signal)?;
        }
        Ok(())
    }

    fn close(&mut self) -> Result<()> {
        if std::mem::replace(&mut self.closed, true) {
            return Ok(());
        }
        close_all(
            self.routes
                .iter_mut()
                .map(|(target, _)| target)
                .chain(self.dustbin.as_mut()),
        )
    }

    fn name(&self) -> &str {
        "route"
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::stage::{CollectSink, Collector};

    #[test]
    fn test_compares_against_first_item() {
        let (sink, collector) = CollectSink::new();
        let mut route = Route::new(vec![(
            Box::new(sink) as BoxStage<i32>,
            Box::new(|c: &i32, f: &i32| c > f) as Predicate<i32>,
        )]);

        for item in [4, 2, 3, 4, 5, 9, 0, 2, 8] {
            route.push(item).unwrap();
        }

        assert_eq!(collector.items(), vec![5, 9, 8]);
    }

    #[test]
    fn test_unmatched_items_go_to_dustbin() {
        let (evens, evens_out) = CollectSink::new();
        let (dustbin, dustbin_out) = CollectSink::new();
        let mut route = Route::new(vec![(
            Box::new(evens) as BoxStage<i32>,
            Box::new(|c: &i32, _: &i32| c % 2 == 0) as Predicate<i32>,
        )])
        .with_dustbin(dustbin);

        for item in 1..=5 {
            route.push(item).unwrap();
        }
        route.close().unwrap();

        assert_eq!(evens_out.items(), vec![2, 4]);
        assert_eq!(dustbin_out.items(), vec![1, 3, 5]);
        assert!(evens_out.is_closed() && dustbin_out.is_closed());
    }

    fn always() -> Predicate<i32> {
        Box::new(|_: &i32, _: &i32| true)
    }

    fn two_routes() -> (Vec<(BoxStage<i32>, Predicate<i32>)>, Collector<i32>, Collector<i32>) {
        let (a, a_out) = CollectSink::new();
        let (b, b_out) = CollectSink::new();
        let a: BoxStage<i32> = Box::new(a);
        let b: BoxStage<i32> = Box::new(b);
        (vec![(a, always()), (b, always())], a_out, b_out)
    }

    #[test]
    fn test_first_match_only() {
        let (routes, a_out, b_out) = two_routes();
        let mut route = Route::new(routes);
        route.push(1).unwrap();
        assert_eq!(a_out.items(), vec![1]);
        assert_eq!(b_out.items(), vec![1]);

        let (routes, a_out, b_out) = two_routes();
        let mut route = Route::new(routes).first_match_only();
        route.push(1).unwrap();
        assert_eq!(a_out.items(), vec![1]);
        assert!(b_out.is_empty());
    }

    #[test]
    fn test_batch_end_resets_first() {
        let (sink, collector) = CollectSink::new();
        let mut route = Route::new(vec![(
            Box::new(sink) as BoxStage<i32>,
            Box::new(|c: &i32, f: &i32| c == f) as Predicate<i32>,
        )]);

        route.push(10).unwrap();
        route.push(20).unwrap();
        route.signal(&Signal::batch_end(20, 2)).unwrap();
        route.push(20).unwrap();

        assert_eq!(collector.items(), vec![10, 20]);
        assert_eq!(collector.signals().len(), 1);
    }
}
