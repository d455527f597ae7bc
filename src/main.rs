use anyhow::{bail, Context};
use clap::{ArgAction, Parser, Subcommand};
use envconfig::Envconfig;
use feed_pipeline::record::Record;
use feed_pipeline::stages::{
    count_tokens, timeline, CounterPrinter, Dedup, Delay, GroupSink, OpenMode, PrintSink, Predicate,
    RecordFormat, Route, ToRecord,
};
use feed_pipeline::{
    drive, read_lines, BoxStage, Bridge, BridgeConfig, FeedConfig, FeedParams, Feeder,
    FilterConfig, HttpFeedClient, Merge, MergeInput, PipelineError, SharedTarget, Shutdown, Stage,
};
use std::io::{self, BufWriter};
use std::path::{Path, PathBuf};
use std::process::ExitCode;
use std::thread;
use std::time::Duration;
use tracing::{info, warn};
use tracing_subscriber::EnvFilter;

#[derive(Parser)]
#[command(version, about = "Process collections and live streams of social-media events", long_about = None)]
struct Cli {
    /// Where records come from: a directory of (optionally gzipped) files,
    /// `feed://sample` or `feed://filter`. Reads stdin when omitted.
    #[arg(short, long, global = true)]
    source: Option<String>,

    /// YAML filter configuration, needed by `filter` and `feed://filter`
    #[arg(short, long, global = true, env = "FEEDPIPE_CONFIG")]
    config: Option<PathBuf>,

    /// Log more (-v for debug)
    #[arg(short, long, global = true, action = ArgAction::Count)]
    verbose: u8,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Print records exactly as they were received
    Select,
    /// Print records in human readable form
    Show,
    /// Print only the text of each record
    Text,
    /// Pretty print the JSON of each record
    Pprint,
    /// Omit repeated records
    Uniq,
    /// Print records at the pace they were created
    Replay {
        /// Divide the gaps between records by this factor
        #[arg(long, default_value_t = 100.0)]
        speedup: f64,
        /// Longest pause between two records, in milliseconds
        #[arg(long, default_value_t = 2000)]
        max_delay_ms: u64,
    },
    /// Write records to gzip files named by their creation time
    Group {
        /// strftime template for the file names
        #[arg(short = 't', long, default_value = "%Y-%m-%d-%H.gz")]
        template: String,
        #[arg(long, default_value_t = 1)]
        max_open_files: usize,
        /// Truncate existing files instead of appending
        #[arg(long)]
        truncate: bool,
        #[arg(short, long, default_value = ".")]
        out_dir: PathBuf,
    },
    /// Write records to per-filter files as defined in the configuration
    Filter {
        #[arg(short, long, default_value = ".")]
        out_dir: PathBuf,
        #[arg(long, default_value_t = 1)]
        max_open_files: usize,
    },
    /// Count records per time window
    Timeline {
        /// strftime template naming the window
        #[arg(short, long, default_value = "%Y-%m-%d-%H")]
        window: String,
    },
    /// Count tokens and hashtags
    Tokens {
        /// Count `#tag` and `tag` as the same key
        #[arg(long)]
        merge_hashtags: bool,
    },
    /// Merge directories of chronologically ordered records into one stream
    Merge {
        #[arg(required = true)]
        inputs: Vec<PathBuf>,
    },
}

enum Input {
    Stdin,
    Dir(PathBuf),
    Sample,
    Filter,
}

impl Input {
    fn parse(source: Option<&str>) -> Self {
        match source {
            None | Some("-") => Input::Stdin,
            Some("feed://sample") => Input::Sample,
            Some("feed://filter") => Input::Filter,
            Some(path) => Input::Dir(PathBuf::from(path)),
        }
    }
}

fn stdout() -> BufWriter<io::Stdout> {
    BufWriter::new(io::stdout())
}

fn printer(format: RecordFormat) -> ToRecord {
    ToRecord::new(PrintSink::new(stdout(), format))
}

fn group_sink(
    template: &str,
    out_dir: &Path,
    max_open_files: usize,
    mode: OpenMode,
) -> anyhow::Result<GroupSink<Record>> {
    Ok(GroupSink::new(template)?
        .in_dir(out_dir)
        .max_open_files(max_open_files)
        .open_mode(mode))
}

fn filter_chain(
    config: &FilterConfig,
    out_dir: &Path,
    max_open_files: usize,
) -> anyhow::Result<ToRecord> {
    let mut routes: Vec<(BoxStage<Record>, Predicate<Record>)> = Vec::new();
    for filter in &config.filters {
        let predicates = filter
            .predicates()
            .with_context(|| format!("invalid filter `{}`", filter.name))?;
        let sink = group_sink(&filter.split_template, out_dir, max_open_files, OpenMode::Append)?;
        let predicate: Predicate<Record> =
            Box::new(move |record: &Record, _first: &Record| predicates.matches(record));
        routes.push((Box::new(sink), predicate));
    }

    let mut route = Route::new(routes);
    if let Some(template) = config.dustbin_template() {
        let dustbin = group_sink(template, out_dir, max_open_files, OpenMode::Append)?;
        route = route.with_dustbin(dustbin);
    }
    Ok(ToRecord::new(route))
}

fn load_filters(cli_config: Option<&Path>) -> anyhow::Result<FilterConfig> {
    let Some(path) = cli_config else {
        bail!("a filter configuration is required (--config or FEEDPIPE_CONFIG)");
    };
    FilterConfig::load(path).with_context(|| format!("loading {}", path.display()))
}

/// Feed every line of `input` into `head` until the input ends or shutdown
fn run_chain(
    input: Input,
    cli_config: Option<&Path>,
    head: impl Stage<String> + 'static,
    shutdown: &Shutdown,
) -> anyhow::Result<()> {
    let path = match input {
        Input::Stdin => None,
        Input::Dir(path) => Some(path),
        Input::Sample | Input::Filter => return run_feed(input, cli_config, head, shutdown),
    };

    let lines = read_lines(path.as_deref()).context("opening input")?;
    let report = drive(&mut Feeder::new(lines, head), shutdown)?;
    info!(
        accepted = report.accepted,
        skipped = report.skipped,
        interrupted = report.interrupted,
        "input processed"
    );
    Ok(())
}

fn run_feed(
    input: Input,
    cli_config: Option<&Path>,
    head: impl Stage<String> + 'static,
    shutdown: &Shutdown,
) -> anyhow::Result<()> {
    let feed = FeedConfig::init_from_env().context("reading feed configuration")?;
    let bridge_config = BridgeConfig::init_from_env().context("reading bridge configuration")?;

    let (url, params) = match input {
        Input::Filter => (feed.filter_url, load_filters(cli_config)?.feed_params()?),
        _ => (feed.sample_url, FeedParams::default()),
    };
    let client = HttpFeedClient::new(url, feed.token, feed.connect_timeout.0)?;
    Bridge::new(bridge_config)
        .with_shutdown(shutdown.clone())
        .run(client, params, head)?;
    Ok(())
}

fn run_merge(inputs: &[PathBuf], shutdown: &Shutdown) -> anyhow::Result<()> {
    let output = SharedTarget::new(PrintSink::new(stdout(), RecordFormat::Raw));
    let mut targets: Vec<_> = (1..inputs.len()).map(|_| output.clone()).collect();
    targets.push(output);

    let mut merge_inputs = Vec::with_capacity(inputs.len());
    for (dir, target) in inputs.iter().zip(targets) {
        let lines = read_lines(Some(dir)).with_context(|| format!("reading {}", dir.display()))?;
        merge_inputs.push(MergeInput::new(
            move |inlet| Feeder::new(lines, ToRecord::new(inlet)),
            target,
        ));
    }

    let mut merge = Merge::new(merge_inputs, |record: &Record| record.created_at());
    let report = merge.run_until(shutdown)?;
    info!(
        emitted = report.emitted,
        interrupted = report.interrupted,
        "merge finished"
    );
    Ok(())
}

fn run(cli: Cli, shutdown: &Shutdown) -> anyhow::Result<()> {
    let input = Input::parse(cli.source.as_deref());
    let config = cli.config.as_deref();

    match cli.command {
        Commands::Select => run_chain(input, config, printer(RecordFormat::Raw), shutdown),
        Commands::Show => run_chain(input, config, printer(RecordFormat::Summary), shutdown),
        Commands::Text => run_chain(input, config, printer(RecordFormat::Text), shutdown),
        Commands::Pprint => run_chain(input, config, printer(RecordFormat::Pretty), shutdown),
        Commands::Uniq => {
            let chain = ToRecord::new(Dedup::by_id(PrintSink::new(stdout(), RecordFormat::Raw)));
            run_chain(input, config, chain, shutdown)
        }
        Commands::Replay {
            speedup,
            max_delay_ms,
        } => {
            let delay = Delay::new(PrintSink::new(stdout(), RecordFormat::Raw), speedup)
                .max_delay(Duration::from_millis(max_delay_ms))
                .with_shutdown(shutdown.clone());
            run_chain(input, config, ToRecord::new(delay), shutdown)
        }
        Commands::Group {
            template,
            max_open_files,
            truncate,
            out_dir,
        } => {
            let mode = if truncate {
                OpenMode::Truncate
            } else {
                OpenMode::Append
            };
            let sink = group_sink(&template, &out_dir, max_open_files, mode)?;
            run_chain(input, config, ToRecord::new(sink), shutdown)
        }
        Commands::Filter {
            out_dir,
            max_open_files,
        } => {
            let filters = load_filters(config)?;
            let chain = filter_chain(&filters, &out_dir, max_open_files)?;
            run_chain(input, config, chain, shutdown)
        }
        Commands::Timeline { window } => {
            let count = timeline(&window)?.with_target(CounterPrinter::new(stdout()));
            run_chain(input, config, ToRecord::new(count), shutdown)
        }
        Commands::Tokens { merge_hashtags } => {
            let count = count_tokens(!merge_hashtags).with_target(CounterPrinter::new(stdout()));
            run_chain(input, config, ToRecord::new(count), shutdown)
        }
        Commands::Merge { inputs } => run_merge(&inputs, shutdown),
    }
}

/// Trigger `shutdown` on Ctrl-C
fn watch_ctrl_c(shutdown: Shutdown) -> anyhow::Result<()> {
    let runtime = tokio::runtime::Builder::new_current_thread()
        .enable_all()
        .build()
        .context("building signal runtime")?;
    thread::Builder::new()
        .name("ctrl-c".into())
        .spawn(move || {
            runtime.block_on(async {
                match tokio::signal::ctrl_c().await {
                    Ok(()) => shutdown.trigger(),
                    Err(e) => warn!(error = %e, "cannot listen for Ctrl-C"),
                }
            })
        })
        .context("spawning signal thread")?;
    Ok(())
}

fn init_tracing(verbose: u8) {
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| {
        EnvFilter::new(if verbose > 0 { "debug" } else { "info" })
    });
    tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_writer(io::stderr)
        .init();
}

fn is_broken_pipe(e: &anyhow::Error) -> bool {
    e.chain().any(|cause| {
        cause
            .downcast_ref::<io::Error>()
            .is_some_and(|err| err.kind() == io::ErrorKind::BrokenPipe)
            || matches!(
                cause.downcast_ref::<PipelineError>(),
                Some(PipelineError::Io(err)) if err.kind() == io::ErrorKind::BrokenPipe
            )
    })
}

fn main() -> ExitCode {
    let cli = Cli::parse();
    init_tracing(cli.verbose);

    let shutdown = Shutdown::new();
    if let Err(e) = watch_ctrl_c(shutdown.clone()) {
        warn!(error = %e, "running without Ctrl-C handling");
    }

    match run(cli, &shutdown) {
        Ok(()) if shutdown.is_triggered() => ExitCode::from(130),
        Ok(()) => ExitCode::SUCCESS,
        Err(e) if is_broken_pipe(&e) => ExitCode::SUCCESS,
        Err(e)
            if e
                .downcast_ref::<PipelineError>()
                .is_some_and(PipelineError::is_interrupted) =>
        {
            ExitCode::from(130)
        }
        Err(e) => {
            eprintln!("Error: {e}");
            for cause in e.chain().skip(1) {
                eprintln!("Caused by: {cause}");
            }
            ExitCode::FAILURE
        }
    }
}
