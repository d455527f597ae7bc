use feed_pipeline::config::EnvMsDuration;
use feed_pipeline::feed::FeedLines;
use feed_pipeline::record::Record;
use feed_pipeline::stages::{
    timeline, Batch, Count, Counts, Dedup, GroupSink, Mutate, Predicate, Route, Split, ToRecord,
};
use feed_pipeline::{
    drive, read_lines, BoxStage, Bridge, BridgeConfig, CollectSink, FeedClient, FeedError,
    FeedParams, Feeder, FilterConfig, Merge, MergeInput, Outcome, PipelineError, SharedTarget,
    Shutdown, Signal, Stage,
};
use flate2::read::MultiGzDecoder;
use flate2::write::GzEncoder;
use flate2::Compression;
use std::fs;
use std::io::{Read, Write};
use std::path::Path;
use std::time::Duration;

fn line(id: u64, created_at: &str, text: &str) -> String {
    format!(r#"{{"id": {id}, "created_at": "{created_at}", "text": "{text}", "lang": "en", "user": {{"id": 7, "screen_name": "someone"}}}}"#)
}

fn lines(items: Vec<String>) -> impl Iterator<Item = feed_pipeline::Result<String>> + Send {
    items.into_iter().map(Ok::<String, PipelineError>)
}

fn write_gz(path: &Path, lines: &[String]) {
    let mut encoder = GzEncoder::new(fs::File::create(path).expect("create"), Compression::default());
    for l in lines {
        writeln!(encoder, "{l}").expect("write");
    }
    encoder.finish().expect("finish");
}

fn read_gz(path: &Path) -> Vec<String> {
    let mut text = String::new();
    MultiGzDecoder::new(fs::File::open(path).expect("open"))
        .read_to_string(&mut text)
        .expect("read");
    text.lines().map(str::to_string).collect()
}

#[test]
fn test_closing_the_head_closes_every_stage() {
    let (a, a_items) = CollectSink::new();
    let (b, b_items) = CollectSink::new();
    let targets: Vec<BoxStage<Record>> = vec![Box::new(a), Box::new(b)];
    let chain = ToRecord::new(Dedup::by_id(Split::new(targets)));

    let input = vec![
        line(1, "Fri Apr 13 13:55:02 +0000 2012", "first"),
        "not json".to_string(),
        line(2, "Fri Apr 13 13:56:02 +0000 2012", "second"),
        line(1, "Fri Apr 13 13:55:02 +0000 2012", "first"),
    ];
    let report = drive(&mut Feeder::new(lines(input), chain), &Shutdown::new())
        .expect("drive failed");

    assert_eq!(report.skipped, 1);
    assert!(!report.interrupted);
    let ids = |items: Vec<Record>| items.iter().filter_map(Record::id).collect::<Vec<_>>();
    assert_eq!(ids(a_items.items()), vec![1, 2]);
    assert_eq!(ids(b_items.items()), vec![1, 2]);
    assert!(a_items.is_closed() && b_items.is_closed());
    assert_eq!(a_items.close_calls(), 1);
}

#[test]
fn test_dedup_twice_equals_dedup_once() {
    let input = vec![3, 1, 3, 2, 1, 4, 2];

    let (once, once_items) = CollectSink::new();
    let mut stage = Dedup::by_value(once);
    for i in input.clone() {
        stage.push(i).expect("push");
    }

    let (twice, twice_items) = CollectSink::new();
    let mut stage = Dedup::by_value(Dedup::by_value(twice));
    for i in input {
        stage.push(i).expect("push");
    }

    assert_eq!(once_items.items(), vec![3, 1, 2, 4]);
    assert_eq!(once_items.items(), twice_items.items());
}

#[test]
fn test_push_after_close_fails() {
    let (sink, _) = CollectSink::<i32>::new();
    let mut stage = Split::new(vec![Box::new(sink) as BoxStage<i32>]);
    stage.close().expect("close");
    stage.close().expect("second close is a no-op");

    assert!(matches!(stage.push(1), Err(PipelineError::Closed { .. })));
}

#[test]
fn test_batch_boundaries_reset_mutate() {
    let (sink, collector) = CollectSink::new();
    let mutate = Mutate::new(sink, |current: i32, first: &i32| current - first);
    let mut batch = Batch::by_key(mutate, |i: &i32| i / 10);

    for i in [10, 12, 15, 21, 25, 30] {
        batch.push(i).expect("push");
    }
    batch.close().expect("close");

    assert_eq!(collector.items(), vec![0, 2, 5, 0, 4, 0]);
    assert_eq!(
        collector.signals(),
        vec![Signal::batch_end(21, 4), Signal::batch_end(30, 2)]
    );
}

#[test]
fn test_route_by_filter_configuration() {
    let config = FilterConfig::from_yaml(
        r#"
filters:
  - name: pop
    track: [pinkpop]
    split_template: "pop/%Y.gz"
  - name: early
    end_date: "Sat Apr 14 00:00:00 +0000 2012"
    split_template: "early/%Y.gz"
"#,
    )
    .expect("config");

    let (pop, pop_items) = CollectSink::new();
    let (early, early_items) = CollectSink::new();
    let (dustbin, dustbin_items) = CollectSink::new();
    let routes: Vec<(BoxStage<Record>, Predicate<Record>)> = config
        .filters
        .iter()
        .zip([Box::new(pop) as BoxStage<Record>, Box::new(early)])
        .map(|(filter, target)| {
            let predicates = filter.predicates().expect("predicates");
            let predicate: Predicate<Record> =
                Box::new(move |record: &Record, _: &Record| predicates.matches(record));
            (target, predicate)
        })
        .collect();
    let chain = ToRecord::new(Route::new(routes).with_dustbin(dustbin));

    let input = vec![
        line(1, "Fri Apr 13 13:55:02 +0000 2012", "going to pinkpop"),
        line(2, "Thu Apr 26 07:35:39 +0000 2012", "pinkpop tickets"),
        line(3, "Sat May 12 09:07:14 +0000 2012", "nothing here"),
    ];
    drive(&mut Feeder::new(lines(input), chain), &Shutdown::new()).expect("drive");

    let ids = |items: Vec<Record>| items.iter().filter_map(Record::id).collect::<Vec<_>>();
    assert_eq!(ids(pop_items.items()), vec![1, 2]);
    assert_eq!(ids(early_items.items()), vec![1]);
    assert_eq!(ids(dustbin_items.items()), vec![3]);
    assert!(dustbin_items.is_closed());
}

#[test]
fn test_group_directory_into_hourly_files() {
    let input = tempfile::tempdir().expect("tempdir");
    write_gz(
        &input.path().join("a.gz"),
        &[
            line(1, "Fri Apr 13 13:55:02 +0000 2012", "one"),
            line(2, "Fri Apr 13 13:59:59 +0000 2012", "two"),
        ],
    );
    fs::write(
        input.path().join("b.txt"),
        format!("{}\n", line(3, "Fri Apr 13 14:00:00 +0000 2012", "three")),
    )
    .expect("write");

    let output = tempfile::tempdir().expect("tempdir");
    let sink = GroupSink::new("%Y-%m-%d-%H.gz")
        .expect("template")
        .in_dir(output.path());
    let source = read_lines(Some(input.path())).expect("read_lines");
    drive(&mut Feeder::new(source, ToRecord::new(sink)), &Shutdown::new()).expect("drive");

    let thirteen = read_gz(&output.path().join("2012-04-13-13.gz"));
    let fourteen = read_gz(&output.path().join("2012-04-13-14.gz"));
    assert_eq!(thirteen.len(), 2);
    assert_eq!(fourteen, vec![line(3, "Fri Apr 13 14:00:00 +0000 2012", "three")]);
}

#[test]
fn test_timeline_counts_per_hour() {
    let accumulator = Counts::shared();
    let chain = ToRecord::new(
        timeline("%Y-%m-%d-%H")
            .expect("template")
            .with_accumulator(accumulator.clone()),
    );
    let input = vec![
        line(1, "Fri Apr 13 13:55:02 +0000 2012", "a"),
        line(2, "Fri Apr 13 13:56:02 +0000 2012", "b"),
        line(3, "Fri Apr 13 15:00:00 +0000 2012", "c"),
    ];
    drive(&mut Feeder::new(lines(input), chain), &Shutdown::new()).expect("drive");

    let counts = accumulator.lock();
    assert_eq!(counts.get(&"2012-04-13-13".to_string()), 2);
    assert_eq!(counts.get(&"2012-04-13-15".to_string()), 1);
    assert_eq!(counts.total(), 3);
}

#[test]
fn test_count_items_flushes_on_close() {
    let (sink, collector) = CollectSink::<Counts<char>>::new();
    let mut count = Count::items().with_target(sink);
    for c in "abca".chars() {
        count.push(c).expect("push");
    }
    count.close().expect("close");

    let flushed = collector.items();
    assert_eq!(flushed.len(), 1);
    assert_eq!(flushed[0].get(&'a'), 2);
    assert!(collector.is_closed());
}

#[test]
fn test_merge_directories_chronologically() {
    let first = tempfile::tempdir().expect("tempdir");
    let second = tempfile::tempdir().expect("tempdir");
    write_gz(
        &first.path().join("2012-04.gz"),
        &[
            line(1, "Fri Apr 13 13:55:02 +0000 2012", "one"),
            line(4, "Sat May 12 09:07:14 +0000 2012", "four"),
        ],
    );
    write_gz(
        &second.path().join("2012-04.gz"),
        &[
            line(2, "Sat Apr 14 10:00:00 +0000 2012", "two"),
            line(3, "Thu Apr 26 07:35:39 +0000 2012", "three"),
        ],
    );

    let (sink, collector) = CollectSink::new();
    let output = SharedTarget::new(sink);
    let mut inputs = Vec::new();
    for (dir, target) in [first.path(), second.path()]
        .into_iter()
        .zip([output.clone(), output])
    {
        let source = read_lines(Some(dir)).expect("read_lines");
        inputs.push(MergeInput::new(
            move |inlet| Feeder::new(source, ToRecord::new(inlet)),
            target,
        ));
    }

    let mut merge = Merge::new(inputs, |record: &Record| record.created_at());
    let emitted = merge.run().expect("merge");

    assert_eq!(emitted, 4);
    let ids: Vec<_> = collector.items().iter().filter_map(Record::id).collect();
    assert_eq!(ids, vec![1, 2, 3, 4]);
    assert!(collector.is_closed());
}

/// Serves a fixed set of lines once, then rejects the credentials
struct OnceClient {
    lines: Option<Vec<String>>,
}

impl FeedClient for OnceClient {
    fn connect(&mut self, _params: &FeedParams) -> Result<FeedLines, FeedError> {
        match self.lines.take() {
            Some(lines) => Ok(Box::new(lines.into_iter().map(Ok::<String, FeedError>))),
            None => Err(FeedError::Http { status: 403 }),
        }
    }
}

#[test]
fn test_bridge_feeds_chain_until_credentials_are_rejected() {
    let client = OnceClient {
        lines: Some(vec![
            line(1, "Fri Apr 13 13:55:02 +0000 2012", "one"),
            String::new(),
            line(1, "Fri Apr 13 13:55:02 +0000 2012", "one"),
            line(2, "Fri Apr 13 13:56:02 +0000 2012", "two"),
        ]),
    };
    let (sink, collector) = CollectSink::new();
    let bridge = Bridge::new(BridgeConfig {
        reconnect_backoff: EnvMsDuration(Duration::from_millis(1)),
        ..BridgeConfig::default()
    });

    let result = bridge.run(client, FeedParams::default(), ToRecord::new(Dedup::by_id(sink)));

    assert!(matches!(
        result,
        Err(PipelineError::Feed(FeedError::Http { status: 403 }))
    ));
    let ids: Vec<_> = collector.items().iter().filter_map(Record::id).collect();
    assert_eq!(ids, vec![1, 2]);
    assert!(collector.is_closed());
    assert_eq!(bridge.metrics().lines_received(), 3);
    assert_eq!(bridge.metrics().reconnects(), 1);
}

#[test]
fn test_interrupted_drive_still_closes_chain() {
    let shutdown = Shutdown::new();
    shutdown.trigger();
    let (sink, collector) = CollectSink::<String>::new();

    let report = drive(
        &mut Feeder::new(lines(vec!["a".into(), "b".into()]), sink),
        &shutdown,
    )
    .expect("drive");

    assert!(report.interrupted);
    assert!(collector.is_empty());
    assert!(collector.is_closed());
}

#[test]
fn test_skip_is_reported_as_outcome() {
    let (sink, _) = CollectSink::new();
    let mut chain = ToRecord::new(sink);
    assert_eq!(chain.push("{}".to_string()).expect("push"), Outcome::Skip);
    assert_eq!(chain.malformed(), 1);
}
