//! Session orchestrator
//!
//! Drives the packet loop: feeds segments to the reassembler, flushes idle
//! connections on a timer, and on stop or end of input closes every
//! half-stream and waits for its handler before returning.

use crate::stats::{Counters, DumperStats};
use crate::stream::HttpStreamFactory;
use promptdump_capture::{open_capture, CaptureError, PacketSource};
use promptdump_core::{ConfigError, Notifier, PromptdumpConfig};
use promptdump_reassembly::{Assembler, AssemblerConfig};
use std::sync::Arc;
use thiserror::Error;
use tokio::sync::watch;
use tokio::time::{interval_at, Instant, MissedTickBehavior};
use tracing::{debug, info, warn};

/// Startup errors; nothing has run when one of these is returned
#[derive(Error, Debug)]
pub enum DumperError {
    #[error("invalid capture configuration: {0}")]
    Config(#[from] ConfigError),

    #[error(transparent)]
    Capture(#[from] CaptureError),
}

/// Requests a running [`HttpDumper`] to stop
#[derive(Clone)]
pub struct StopHandle {
    tx: Arc<watch::Sender<bool>>,
}

impl StopHandle {
    pub fn stop(&self) {
        self.tx.send_replace(true);
    }
}

/// Captures HTTP traffic and reports paired messages to a [`Notifier`]
pub struct HttpDumper {
    config: PromptdumpConfig,
    notifier: Arc<dyn Notifier>,
    stop_tx: Arc<watch::Sender<bool>>,
    counters: Arc<Counters>,
}

impl HttpDumper {
    pub fn new(config: PromptdumpConfig, notifier: Arc<dyn Notifier>) -> Self {
        let (stop_tx, _) = watch::channel(false);
        Self {
            config,
            notifier,
            stop_tx: Arc::new(stop_tx),
            counters: Arc::new(Counters::default()),
        }
    }

    pub fn config(&self) -> &PromptdumpConfig {
        &self.config
    }

    /// Open the configured capture source and process it until it ends or
    /// [`stop`](HttpDumper::stop) is called.
    pub async fn start(&self) -> Result<DumperStats, DumperError> {
        self.config.capture.source()?;
        let source = open_capture(&self.config.capture)?;
        Ok(self.run(source).await)
    }

    /// Process packets from `source` until it ends or a stop is requested.
    /// Returns only after every half-stream handler has finished.
    pub async fn run<S: PacketSource>(&self, mut source: S) -> DumperStats {
        let factory = HttpStreamFactory::new(
            self.notifier.clone(),
            self.config.correlation.clone(),
            self.counters.clone(),
        );
        let mut assembler = Assembler::new(factory, AssemblerConfig::from(&self.config.reassembly));

        let flush_interval = self.config.reassembly.flush_interval();
        let idle_timeout = self.config.reassembly.idle_timeout();
        let mut ticker = interval_at(Instant::now() + flush_interval, flush_interval);
        ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);

        let mut stop_rx = self.stop_tx.subscribe();

        info!("Waiting for packets...");
        loop {
            tokio::select! {
                packet = source.next_packet() => match packet {
                    None => {
                        info!("End of packet stream");
                        assembler.flush_all().await;
                        break;
                    }
                    Some(Err(e)) => {
                        Counters::incr(&self.counters.decode_errors);
                        warn!("Error decoding a packet: {}", e);
                    }
                    Some(Ok(segment)) => {
                        Counters::incr(&self.counters.packets);
                        assembler.assemble(segment).await;
                    }
                },
                _ = ticker.tick() => {
                    let cutoff = Instant::now()
                        .into_std()
                        .checked_sub(idle_timeout);
                    if let Some(cutoff) = cutoff {
                        let (flushed, closed) = assembler.flush_older_than(cutoff).await;
                        if flushed > 0 || closed > 0 {
                            info!("Flushed {} old streams, closed {} streams", flushed, closed);
                        }
                    }
                    let factory = assembler.factory();
                    let purged = factory.registry().purge();
                    let reaped = factory.reap();
                    debug!(
                        "Flush tick: purged {} sessions, reaped {} handlers, {} streams open",
                        purged,
                        reaped,
                        assembler.connection_count()
                    );
                }
                _ = stop_requested(&mut stop_rx) => {
                    info!("Stopping packet processing...");
                    let closed = assembler.flush_all().await;
                    debug!("Closed {} streams", closed);
                    break;
                }
            }
        }

        assembler.factory().wait_all().await;
        info!("done");
        self.stats()
    }

    /// Ask a running [`run`](HttpDumper::run) to finish. Takes effect
    /// immediately if called before the run starts.
    pub fn stop(&self) {
        self.stop_tx.send_replace(true);
    }

    pub fn stop_handle(&self) -> StopHandle {
        StopHandle {
            tx: self.stop_tx.clone(),
        }
    }

    /// Counters so far
    pub fn stats(&self) -> DumperStats {
        self.counters.snapshot()
    }
}

async fn stop_requested(rx: &mut watch::Receiver<bool>) {
    while !*rx.borrow_and_update() {
        if rx.changed().await.is_err() {
            return;
        }
    }
}
