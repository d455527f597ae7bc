//! Chronological merge of record collections
//!
//! Merges directories of (optionally gzipped) record files by creation time
//! and prints which collection every record came from, along with the order
//! the collections were in just before it.
//!
//! Usage: cargo run --example merge_collections -- collection_a/ collection_b/

use anyhow::bail;
use feed_pipeline::record::Record;
use feed_pipeline::stages::{Count, Counts, ToRecord};
use feed_pipeline::{read_lines, Feeder, Merge, MergeInput, Step};
use std::path::PathBuf;

fn main() -> anyhow::Result<()> {
    tracing_subscriber::fmt::init();

    let dirs: Vec<PathBuf> = std::env::args_os().skip(1).map(PathBuf::from).collect();
    if dirs.is_empty() {
        bail!("usage: merge_collections <dir>...");
    }

    let mut totals = Vec::with_capacity(dirs.len());
    let mut inputs = Vec::with_capacity(dirs.len());
    for dir in &dirs {
        let lines = read_lines(Some(dir))?;
        let total = Counts::shared();
        let count = Count::new(|_: &Record| vec!["records"]).with_accumulator(total.clone());
        totals.push(total);
        inputs.push(MergeInput::new(
            move |inlet| Feeder::new(lines, ToRecord::new(inlet)),
            count,
        ));
    }

    let mut merge = Merge::new(inputs, |record: &Record| record.created_at());
    while let Step::Emitted(emission) = merge.step()? {
        let order: Vec<String> = emission.priority.iter().map(ToString::to_string).collect();
        println!(
            "{} [{}] {} {}",
            emission.tag,
            order.join(" "),
            emission
                .item
                .created_at()
                .map(|at| at.to_string())
                .unwrap_or_default(),
            emission.item.id().unwrap_or_default()
        );
    }

    for (dir, total) in dirs.iter().zip(&totals) {
        println!("{}: {} records", dir.display(), total.lock().get(&"records"));
    }
    Ok(())
}
