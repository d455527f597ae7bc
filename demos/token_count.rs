//! Hourly token frequencies
//!
//! Reads records from stdin, splits them into hourly batches and prints the
//! most frequent tokens of every hour, then of the whole input.
//!
//! Usage: cargo run --example token_count --release < tweets.json

use feed_pipeline::record::Record;
use feed_pipeline::stages::{count_tokens, Batch, Counts, ToRecord};
use feed_pipeline::{drive, read_lines, Feeder, Outcome, Result, Shutdown, Stage};

const TOP_N: usize = 10;

fn top(counts: &Counts<String>, n: usize) -> Vec<(&String, u64)> {
    let mut entries = counts.sorted();
    entries.sort_by(|a, b| b.1.cmp(&a.1));
    entries.truncate(n);
    entries
}

/// Prints the leaders of every flushed batch
struct HourlyReport {
    batches: usize,
}

impl Stage<Counts<String>> for HourlyReport {
    fn push(&mut self, counts: Counts<String>) -> Result<Outcome> {
        self.batches += 1;
        let leaders: Vec<String> = top(&counts, 5)
            .into_iter()
            .map(|(token, n)| format!("{token}={n}"))
            .collect();
        println!("batch {:>3}: {}", self.batches, leaders.join(" "));
        Ok(Outcome::Accepted)
    }

    fn close(&mut self) -> Result<()> {
        println!("{} hourly batches", self.batches);
        Ok(())
    }

    fn name(&self) -> &str {
        "hourly_report"
    }
}

fn main() -> anyhow::Result<()> {
    tracing_subscriber::fmt::init();

    let total = Counts::shared();
    let count = count_tokens(true)
        .with_accumulator(total.clone())
        .with_target(HourlyReport { batches: 0 });
    let hourly = Batch::by_key(count, |record: &Record| {
        record.created_at().map(|at| at.format("%Y-%m-%d-%H").to_string())
    })
    .with_flow_name("hourly");

    let mut feeder = Feeder::new(read_lines(None)?, ToRecord::new(hourly));
    let report = drive(&mut feeder, &Shutdown::new())?;

    let total = total.lock();
    println!("\n{} records, {} distinct tokens", report.accepted, total.len());
    for (token, n) in top(&total, TOP_N) {
        println!("{n:>8} {token}");
    }
    Ok(())
}
