//! Restart policy for the long-running services.
//!
//! Each service is a named [`Worker`] whose factory builds a fresh run from a
//! shutdown [`Watcher`]. Every run is spawned as its own task and reports how
//! it ended over a single channel to the supervising loop, which alone owns
//! the error accounting and the shutdown countdown.
//!
//! A run that ends while the supervisor is running is started again after
//! `restart_delay_milliseconds`. Failed runs are counted in a window of
//! `error_window_seconds`. More than `max_errors` failures inside one window
//! is fatal.

use std::{fmt, panic::AssertUnwindSafe, time::Duration};

use futures::{FutureExt, future::BoxFuture};
use serde::{Deserialize, Serialize};
use statproxy_signal::Watcher;
use tokio::{
    sync::mpsc,
    time::{self, Instant},
};
use tracing::{debug, error, info, warn};

/// A single run of a worker.
pub type WorkerFuture = BoxFuture<'static, Result<(), crate::Error>>;

type Factory = Box<dyn Fn(Watcher) -> WorkerFuture + Send + Sync>;

#[derive(thiserror::Error, Debug, Clone, PartialEq, Eq)]
/// Errors produced by [`Supervisor`].
pub enum Error {
    /// Workers failed too often
    #[error("worker {worker} failed {errors} times within {window:?}")]
    TooManyErrors {
        /// The worker whose failure crossed the limit
        worker: String,
        /// Failures counted in the window
        errors: u32,
        /// The window length
        window: Duration,
    },
    /// There is nothing to supervise
    #[error("no worker to run")]
    NoWorkers,
}

fn default_max_errors() -> u32 {
    1000
}

fn default_error_window_seconds() -> u64 {
    10
}

fn default_restart_delay_milliseconds() -> u64 {
    100
}

#[derive(Debug, Deserialize, Serialize, Clone, Copy, PartialEq, Eq)]
#[serde(deny_unknown_fields)]
/// Configuration for [`Supervisor`].
pub struct Config {
    /// Failures tolerated inside one window
    #[serde(default = "default_max_errors")]
    pub max_errors: u32,
    /// Length of the failure counting window
    #[serde(default = "default_error_window_seconds")]
    pub error_window_seconds: u64,
    /// Pause before a finished worker is started again
    #[serde(default = "default_restart_delay_milliseconds")]
    pub restart_delay_milliseconds: u64,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            max_errors: default_max_errors(),
            error_window_seconds: default_error_window_seconds(),
            restart_delay_milliseconds: default_restart_delay_milliseconds(),
        }
    }
}

/// A named, restartable service.
pub struct Worker {
    name: String,
    factory: Factory,
}

impl fmt::Debug for Worker {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Worker").field("name", &self.name).finish()
    }
}

impl Worker {
    /// Create a new [`Worker`]. `factory` is called once per run.
    pub fn new<F>(name: impl Into<String>, factory: F) -> Self
    where
        F: Fn(Watcher) -> WorkerFuture + Send + Sync + 'static,
    {
        Self {
            name: name.into(),
            factory: Box::new(factory),
        }
    }

    /// The worker's name.
    #[must_use]
    pub fn name(&self) -> &str {
        &self.name
    }
}

#[derive(Debug)]
enum Outcome {
    Exited,
    Failed(crate::Error),
    Panicked,
}

#[derive(Debug)]
struct Report {
    worker: usize,
    outcome: Outcome,
}

#[derive(Debug)]
struct ErrorWindow {
    max: u32,
    length: Duration,
    started: Instant,
    errors: u32,
}

impl ErrorWindow {
    fn new(config: &Config) -> Self {
        Self {
            max: config.max_errors,
            length: Duration::from_secs(config.error_window_seconds),
            started: Instant::now(),
            errors: 0,
        }
    }

    /// Count one failure at `now`. True once the limit is exceeded.
    fn record(&mut self, now: Instant) -> bool {
        if now.duration_since(self.started) > self.length {
            self.started = now;
            self.errors = 0;
        }
        self.errors += 1;
        self.errors > self.max
    }
}

#[derive(Debug)]
/// Runs every [`Worker`] until shutdown.
pub struct Supervisor {
    config: Config,
    workers: Vec<Worker>,
}

impl Supervisor {
    /// Create a new, empty [`Supervisor`].
    #[must_use]
    pub fn new(config: Config) -> Self {
        Self {
            config,
            workers: Vec::new(),
        }
    }

    /// Add a worker.
    pub fn push(&mut self, worker: Worker) {
        self.workers.push(worker);
    }

    /// Number of workers.
    #[must_use]
    pub fn len(&self) -> usize {
        self.workers.len()
    }

    /// True if no worker was added.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.workers.is_empty()
    }

    fn spawn(
        &self,
        index: usize,
        shutdown: Watcher,
        reports: mpsc::UnboundedSender<Report>,
        delay: Option<Duration>,
    ) {
        let run = (self.workers[index].factory)(shutdown);
        tokio::spawn(async move {
            if let Some(delay) = delay {
                time::sleep(delay).await;
            }
            let outcome = match AssertUnwindSafe(run).catch_unwind().await {
                Ok(Ok(())) => Outcome::Exited,
                Ok(Err(err)) => Outcome::Failed(err),
                Err(_) => Outcome::Panicked,
            };
            // The supervisor is gone only after it stopped waiting.
            let _ = reports.send(Report {
                worker: index,
                outcome,
            });
        });
    }

    /// Run every worker until `shutdown` fires or workers fail too often.
    ///
    /// On exit every worker is signalled and given up to `max_shutdown_delay`
    /// to finish.
    ///
    /// # Errors
    ///
    /// Function will return an error if there are no workers or if more than
    /// `max_errors` runs fail within one window.
    pub async fn run(self, shutdown: Watcher, max_shutdown_delay: Duration) -> Result<(), Error> {
        if self.workers.is_empty() {
            return Err(Error::NoWorkers);
        }

        let (worker_watcher, worker_broadcast) = statproxy_signal::signal();
        let (report_tx, mut report_rx) = mpsc::unbounded_channel();
        for index in 0..self.workers.len() {
            info!(worker = self.workers[index].name(), "starting worker");
            self.spawn(index, worker_watcher.clone(), report_tx.clone(), None);
        }

        let restart_delay = Duration::from_millis(self.config.restart_delay_milliseconds);
        let mut window = ErrorWindow::new(&self.config);

        let shutdown_wait = shutdown.recv();
        tokio::pin!(shutdown_wait);
        let res = loop {
            tokio::select! {
                Some(report) = report_rx.recv() => {
                    let name = self.workers[report.worker].name();
                    match report.outcome {
                        Outcome::Exited => warn!(worker = name, "worker exited, restarting"),
                        Outcome::Failed(err) => {
                            error!(worker = name, %err, "worker failed, restarting");
                            if window.record(Instant::now()) {
                                break Err(Error::TooManyErrors {
                                    worker: name.to_string(),
                                    errors: window.errors,
                                    window: window.length,
                                });
                            }
                        }
                        Outcome::Panicked => error!(worker = name, "worker panicked, restarting"),
                    }
                    self.spawn(report.worker, worker_watcher.clone(), report_tx.clone(), Some(restart_delay));
                }
                () = &mut shutdown_wait => {
                    info!("shutdown signal received");
                    break Ok(());
                }
            }
        };

        // The failed run that ended the loop is not respawned.
        let mut pending = self.workers.len() - usize::from(res.is_err());
        drop(worker_watcher);
        worker_broadcast.signal();
        let drain = async {
            while pending > 0 {
                let Some(report) = report_rx.recv().await else {
                    break;
                };
                pending -= 1;
                let name = self.workers[report.worker].name();
                match report.outcome {
                    Outcome::Exited => debug!(worker = name, "worker stopped"),
                    Outcome::Failed(err) => warn!(worker = name, %err, "worker failed while stopping"),
                    Outcome::Panicked => error!(worker = name, "worker panicked while stopping"),
                }
            }
        };
        if time::timeout(max_shutdown_delay, drain).await.is_err() {
            warn!(
                "workers did not stop within {} seconds",
                max_shutdown_delay.as_secs()
            );
        }
        res
    }
}
