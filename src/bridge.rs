//! The ingestion bridge: a producer thread reading the live feed into a
//! bounded queue and a consumer thread draining it into a stage chain.
//!
//! Transport failures and unexpected ends of the stream are retried after a
//! fixed backoff. A queue that stays full, or a consumer that has gone away,
//! stops the producer without failing the run. Rejected credentials stop it
//! with an error.

use crate::backpressure::{BackpressureMonitor, Transition};
use crate::buffer::{bounded_queue, Message, QueueReceiver, QueueSender};
use crate::config::BridgeConfig;
use crate::error::{PipelineError, Result};
use crate::feed::{FeedClient, FeedError, FeedLines, FeedParams};
use crate::metrics::{FeedMetrics, MetricsSnapshot};
use crate::shutdown::Shutdown;
use crate::stage::{BoxStage, Outcome, Stage};
use crossbeam::channel::{self, Receiver, RecvTimeoutError};
use std::thread;
use std::time::{Duration, Instant};
use tracing::{debug, error, info, warn};

/// How often waiting threads re-check the shutdown handle
const POLL_INTERVAL: Duration = Duration::from_millis(100);
/// How long the bridge waits for a producer stuck in a feed read after
/// shutdown before leaving it behind
const SHUTDOWN_GRACE: Duration = Duration::from_secs(2);

/// Head of the producer's chain: enqueues every line
pub struct QueueSink {
    sender: Option<QueueSender<String>>,
    timeout: Duration,
    shutdown: Shutdown,
    monitor: BackpressureMonitor,
    metrics: FeedMetrics,
}

impl QueueSink {
    pub fn new(
        sender: QueueSender<String>,
        config: &BridgeConfig,
        shutdown: Shutdown,
        metrics: FeedMetrics,
    ) -> Self {
        Self {
            sender: Some(sender),
            timeout: config.enqueue_timeout.0,
            shutdown,
            monitor: BackpressureMonitor::with_watermarks(
                config.high_watermark,
                config.low_watermark,
            ),
            metrics,
        }
    }
}

impl Stage<String> for QueueSink {
    fn push(&mut self, line: String) -> Result<Outcome> {
        let Some(sender) = self.sender.as_ref() else {
            return Err(PipelineError::closed("queue"));
        };
        let sent = sender.send(line, self.timeout, &self.shutdown);
        self.metrics.set_queue_blocks(sender.block_count());
        sent?;

        let utilization = sender.utilization();
        match self.monitor.observe(utilization) {
            Some(Transition::Engaged) => warn!(utilization, "queue backpressure engaged"),
            Some(Transition::Released) => info!(utilization, "queue backpressure released"),
            None => {}
        }
        Ok(Outcome::Accepted)
    }

    fn close(&mut self) -> Result<()> {
        self.sender = None;
        Ok(())
    }

    fn name(&self) -> &str {
        "queue"
    }
}

/// Why a producer stopped without an error
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ProducerExit {
    Interrupted,
    /// The queue stayed full past the enqueue timeout
    QueueFull,
    /// The consumer dropped its end of the queue
    ConsumerGone,
}

/// Reads the feed into the queue, reconnecting after recoverable failures
pub struct StreamProducer {
    client: Box<dyn FeedClient>,
    params: FeedParams,
    sink: QueueSink,
    backoff: Duration,
    shutdown: Shutdown,
    metrics: FeedMetrics,
}

impl StreamProducer {
    pub fn new(
        client: impl FeedClient + 'static,
        params: FeedParams,
        sink: QueueSink,
        backoff: Duration,
    ) -> Self {
        let shutdown = sink.shutdown.clone();
        let metrics = sink.metrics.clone();
        Self {
            client: Box::new(client),
            params,
            sink,
            backoff,
            shutdown,
            metrics,
        }
    }

    pub fn run(mut self) -> Result<ProducerExit> {
        let exit = self.connect_loop();
        self.sink.close()?;
        match &exit {
            Ok(reason) => info!(?reason, "producer stopped"),
            Err(e) => error!(error = %e, "producer failed"),
        }
        exit
    }

    fn connect_loop(&mut self) -> Result<ProducerExit> {
        loop {
            if self.shutdown.is_triggered() {
                return Ok(ProducerExit::Interrupted);
            }

            let failure = match self.client.connect(&self.params) {
                Ok(lines) => match self.forward(lines) {
                    Ok(failure) => failure,
                    Err(PipelineError::Interrupted) => return Ok(ProducerExit::Interrupted),
                    Err(PipelineError::QueueFull) => {
                        warn!("queue stayed full, stopping producer");
                        return Ok(ProducerExit::QueueFull);
                    }
                    Err(PipelineError::QueueDisconnected) => {
                        warn!("consumer is gone, stopping producer");
                        return Ok(ProducerExit::ConsumerGone);
                    }
                    Err(e) => return Err(e),
                },
                Err(e) => e,
            };

            if !failure.is_recoverable() {
                return Err(failure.into());
            }
            self.metrics.record_reconnect();
            warn!(
                error = %failure,
                backoff_ms = self.backoff.as_millis() as u64,
                "feed interrupted, reconnecting after backoff"
            );
            if self.shutdown.wait_timeout(self.backoff) {
                return Ok(ProducerExit::Interrupted);
            }
        }
    }

    /// Enqueue lines until the connection ends; returns what ended it
    fn forward(&mut self, lines: FeedLines) -> Result<FeedError> {
        for line in lines {
            let line = match line {
                Ok(line) => line,
                Err(e) => return Ok(e),
            };
            // keep-alive
            if line.trim().is_empty() {
                continue;
            }
            self.metrics.record_received();
            self.sink.push(line)?;
            self.shutdown.check()?;
        }
        Ok(FeedError::EndOfStream)
    }
}

/// Drains the queue into the target chain until the sentinel arrives, the
/// producer side disconnects, or shutdown fires with the queue empty. The
/// target is closed on every path.
pub struct StreamConsumer {
    receiver: QueueReceiver<String>,
    target: BoxStage<String>,
    shutdown: Shutdown,
    metrics: FeedMetrics,
}

impl StreamConsumer {
    pub fn new(
        receiver: QueueReceiver<String>,
        target: impl Stage<String> + 'static,
        shutdown: Shutdown,
        metrics: FeedMetrics,
    ) -> Self {
        Self {
            receiver,
            target: Box::new(target),
            shutdown,
            metrics,
        }
    }

    pub fn run(mut self) -> Result<()> {
        let result = self.drain();
        let closed = self.target.close();
        if let (Err(_), Err(e)) = (&result, &closed) {
            warn!(error = %e, "failed to close consumer target after error");
        }
        result.and(closed)
    }

    fn drain(&mut self) -> Result<()> {
        loop {
            let message = match self.receiver.recv_timeout(POLL_INTERVAL) {
                Ok(Some(message)) => message,
                Ok(None) if self.shutdown.is_triggered() && self.receiver.is_empty() => {
                    debug!("shutdown with an empty queue, consumer stopping");
                    return Ok(());
                }
                Ok(None) => continue,
                Err(PipelineError::QueueDisconnected) => {
                    debug!("queue disconnected, consumer stopping");
                    return Ok(());
                }
                Err(e) => return Err(e),
            };

            match message {
                Message::Item(line) => {
                    let started = Instant::now();
                    match self.target.push(line)? {
                        Outcome::Accepted => self.metrics.record_delivered(started.elapsed()),
                        Outcome::Skip => self.metrics.record_skipped(),
                    }
                }
                Message::Shutdown => {
                    debug!("received shutdown sentinel");
                    return Ok(());
                }
            }
        }
    }
}

/// Runs a producer and a consumer around one bounded queue
pub struct Bridge {
    config: BridgeConfig,
    shutdown: Shutdown,
    metrics: FeedMetrics,
}

impl Bridge {
    pub fn new(config: BridgeConfig) -> Self {
        Self {
            config,
            shutdown: Shutdown::new(),
            metrics: FeedMetrics::new(),
        }
    }

    /// Stop when `shutdown` is triggered
    pub fn with_shutdown(mut self, shutdown: Shutdown) -> Self {
        self.shutdown = shutdown;
        self
    }

    pub fn shutdown_handle(&self) -> Shutdown {
        self.shutdown.clone()
    }

    pub fn metrics(&self) -> &FeedMetrics {
        &self.metrics
    }

    /// Stream the feed into `target`, blocking until both threads are done.
    ///
    /// The consumer starts first. Once the producer stops, the shutdown
    /// sentinel is offered to the queue without blocking and the bridge
    /// waits for the consumer to drain.
    pub fn run(
        &self,
        client: impl FeedClient + 'static,
        params: FeedParams,
        target: impl Stage<String> + 'static,
    ) -> Result<MetricsSnapshot> {
        let (sender, receiver) = bounded_queue(self.config.queue_capacity);
        info!(
            capacity = self.config.queue_capacity,
            sample = params.is_empty(),
            "starting ingestion bridge"
        );

        let consumer = StreamConsumer::new(
            receiver,
            target,
            self.shutdown.clone(),
            self.metrics.clone(),
        );
        let consumer = thread::Builder::new()
            .name("feed-consumer".into())
            .spawn(move || consumer.run())
            .map_err(|e| PipelineError::ThreadError(e.to_string()))?;

        let produced = self.spawn_producer(client, params, sender.clone());

        if !sender.try_send_shutdown() {
            debug!("queue full, consumer stops on disconnect instead of the sentinel");
        }
        drop(sender);

        let consumed = consumer
            .join()
            .map_err(|_| PipelineError::ThreadError("consumer thread panicked".into()))
            .and_then(|result| result);

        let snapshot = self.metrics.snapshot();
        info!(%snapshot, "ingestion bridge stopped");
        produced?;
        consumed?;
        Ok(snapshot)
    }

    fn spawn_producer(
        &self,
        client: impl FeedClient + 'static,
        params: FeedParams,
        sender: QueueSender<String>,
    ) -> Result<ProducerExit> {
        let sink = QueueSink::new(
            sender,
            &self.config,
            self.shutdown.clone(),
            self.metrics.clone(),
        );
        let producer = StreamProducer::new(client, params, sink, self.config.reconnect_backoff.0);

        let (done_tx, done_rx) = channel::bounded(1);
        thread::Builder::new()
            .name("feed-producer".into())
            .spawn(move || {
                if done_tx.send(producer.run()).is_err() {
                    debug!("bridge stopped waiting for the producer");
                }
            })
            .map_err(|e| PipelineError::ThreadError(e.to_string()))?;

        self.await_producer(&done_rx)
    }

    /// Wait for the producer's result. After shutdown a producer blocked in a
    /// feed read gets a short grace period and is then left behind.
    fn await_producer(&self, done: &Receiver<Result<ProducerExit>>) -> Result<ProducerExit> {
        loop {
            match done.recv_timeout(POLL_INTERVAL) {
                Ok(result) => return result,
                Err(RecvTimeoutError::Disconnected) => {
                    return Err(PipelineError::ThreadError("producer thread panicked".into()))
                }
                Err(RecvTimeoutError::Timeout) if self.shutdown.is_triggered() => {
                    return match done.recv_timeout(SHUTDOWN_GRACE) {
                        Ok(result) => result,
                        Err(_) => {
                            warn!("producer still blocked on the feed, leaving it behind");
                            Ok(ProducerExit::Interrupted)
                        }
                    };
                }
                Err(RecvTimeoutError::Timeout) => {}
            }
        }
    }
}
