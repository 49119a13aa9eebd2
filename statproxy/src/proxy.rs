//! The periodic flusher and its HTTP sink.
//!
//! Every `save_time_seconds` the flusher drains numeric metrics from the
//! registry and POSTs them as JSON to `proxy_to`. Every `pattern_every_ticks`
//! ticks it does the same for pattern metrics, flagged with the
//! `X-String-Values: 1` header. Once a day, on the first tick in the UTC hour
//! `daily_hour_utc`, it ships the daily cardinality estimates.
//!
//! Drains happen on the flusher task. Deliveries are spawned so a slow sink
//! never delays the next tick. A delivery that fails is logged and dropped.
//!
//! After the takes of a tick, sources left with nothing are pruned from the
//! registry.
//!
//! On shutdown the registry is drained completely, numeric and pattern
//! results are sent one last time and the daily sketches are written to the
//! state file, from which they are restored on the next start.
//!
//! ## Metrics
//!
//! `payload_sent`: Payloads the sink acknowledged, labeled by `payload`
//! `payload_failed`: Payloads the sink did not acknowledge, labeled by `payload`
//! `bytes_sent`: Total JSON body bytes sent
//!

use std::{
    path::PathBuf,
    sync::Arc,
    time::{Duration, SystemTime, UNIX_EPOCH},
};

use metrics::counter;
use serde::{Deserialize, Serialize};
use statproxy_core::Registry;
use statproxy_signal::Watcher;
use tokio::{task::JoinSet, time};
use tracing::{debug, error, info, warn};

use crate::state;

/// Header marking a body as pattern metrics.
pub const STRING_VALUES_HEADER: &str = "X-String-Values";
/// The body a sink replies with to acknowledge a payload.
pub const ACK: &str = "OK";

const DEFAULT_SAVE_TIME_SECONDS: u64 = 60;

#[derive(thiserror::Error, Debug)]
/// Errors produced by [`Proxy`] and [`HttpSink`].
pub enum Error {
    /// Wrapper for [`reqwest::Error`].
    #[error("HTTP delivery failed: {0}")]
    Http(#[from] reqwest::Error),
    /// The sink answered with a non-success status
    #[error("Sink replied with status {0}")]
    Status(reqwest::StatusCode),
    /// The sink answered without acknowledging
    #[error("Sink replied {0:?} instead of OK")]
    NotAcknowledged(String),
    /// Wrapper for [`serde_json::Error`].
    #[error("Failed to serialize payload: {0}")]
    Json(#[from] serde_json::Error),
    /// See [`crate::state::Error`] for details.
    #[error(transparent)]
    State(#[from] state::Error),
}

fn default_save_time_seconds() -> u64 {
    DEFAULT_SAVE_TIME_SECONDS
}

fn default_state_path() -> PathBuf {
    PathBuf::from("./data.tmp")
}

fn default_pattern_every_ticks() -> u32 {
    5
}

fn default_daily_hour_utc() -> u8 {
    3
}

fn default_request_timeout_seconds() -> u64 {
    300
}

fn default_pattern_request_timeout_seconds() -> u64 {
    600
}

#[derive(Debug, Deserialize, Serialize, Clone, PartialEq, Eq)]
#[serde(deny_unknown_fields)]
/// Configuration for [`Proxy`].
pub struct Config {
    /// The URL drained payloads are POSTed to
    pub proxy_to: String,
    /// Seconds between numeric flushes. Values of 1 or less mean 60.
    #[serde(default = "default_save_time_seconds")]
    pub save_time_seconds: u64,
    /// Where daily sketches are kept across restarts
    #[serde(default = "default_state_path")]
    pub state_path: PathBuf,
    /// Numeric flushes per pattern flush
    #[serde(default = "default_pattern_every_ticks")]
    pub pattern_every_ticks: u32,
    /// The UTC hour in which the daily estimates are shipped
    #[serde(default = "default_daily_hour_utc")]
    pub daily_hour_utc: u8,
    /// Timeout for numeric and daily deliveries
    #[serde(default = "default_request_timeout_seconds")]
    pub request_timeout_seconds: u64,
    /// Timeout for pattern deliveries
    #[serde(default = "default_pattern_request_timeout_seconds")]
    pub pattern_request_timeout_seconds: u64,
}

impl Config {
    /// A configuration that ships to `proxy_to` with every other setting at
    /// its default.
    #[must_use]
    pub fn new(proxy_to: impl Into<String>) -> Self {
        Self {
            proxy_to: proxy_to.into(),
            save_time_seconds: default_save_time_seconds(),
            state_path: default_state_path(),
            pattern_every_ticks: default_pattern_every_ticks(),
            daily_hour_utc: default_daily_hour_utc(),
            request_timeout_seconds: default_request_timeout_seconds(),
            pattern_request_timeout_seconds: default_pattern_request_timeout_seconds(),
        }
    }

    /// The flush period, with the minimum applied.
    #[must_use]
    pub fn save_period(&self) -> Duration {
        if self.save_time_seconds <= 1 {
            warn!(
                save_time_seconds = self.save_time_seconds,
                "bad save time, using {DEFAULT_SAVE_TIME_SECONDS}"
            );
            return Duration::from_secs(DEFAULT_SAVE_TIME_SECONDS);
        }
        Duration::from_secs(self.save_time_seconds)
    }
}

/// The kinds of payload the sink receives.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Payload {
    /// `source → metric → value`, numeric metrics and rolling estimates
    Numeric,
    /// `source → metric → pattern → value`
    Patterns,
    /// `source → metric → value`, daily estimates
    Daily,
}

impl Payload {
    fn label(self) -> &'static str {
        match self {
            Payload::Numeric => "numeric",
            Payload::Patterns => "patterns",
            Payload::Daily => "daily",
        }
    }
}

#[derive(Debug)]
/// Client for the downstream sink.
pub struct HttpSink {
    client: reqwest::Client,
    url: String,
    timeout: Duration,
    pattern_timeout: Duration,
}

impl HttpSink {
    /// Create a new [`HttpSink`].
    ///
    /// # Errors
    ///
    /// Function will return an error if the HTTP client cannot be built.
    pub fn new(config: &Config) -> Result<Self, Error> {
        Ok(Self {
            client: reqwest::Client::builder().build()?,
            url: config.proxy_to.clone(),
            timeout: Duration::from_secs(config.request_timeout_seconds),
            pattern_timeout: Duration::from_secs(config.pattern_request_timeout_seconds),
        })
    }

    /// POST one JSON body.
    ///
    /// # Errors
    ///
    /// Function will return an error if the request fails, the sink replies
    /// with a non-success status or with anything but `OK`.
    pub async fn send(&self, payload: Payload, body: Vec<u8>) -> Result<(), Error> {
        let bytes = body.len() as u64;
        let mut request = self
            .client
            .post(&self.url)
            .header(reqwest::header::CONTENT_TYPE, "application/json")
            .body(body);
        request = match payload {
            Payload::Patterns => request
                .header(STRING_VALUES_HEADER, "1")
                .timeout(self.pattern_timeout),
            Payload::Numeric | Payload::Daily => request.timeout(self.timeout),
        };

        let response = request.send().await?;
        let status = response.status();
        if !status.is_success() {
            return Err(Error::Status(status));
        }
        let reply = response.text().await?;
        if reply != ACK {
            return Err(Error::NotAcknowledged(reply));
        }
        counter!("bytes_sent").increment(bytes);
        Ok(())
    }
}

/// Fires once per day on the first poll inside the configured hour.
#[derive(Debug, Clone, Copy)]
struct DailyTrigger {
    hour: u8,
    fired: bool,
}

impl DailyTrigger {
    fn new(hour: u8) -> Self {
        Self { hour, fired: false }
    }

    fn poll(&mut self, hour_now: u8) -> bool {
        if hour_now != self.hour {
            self.fired = false;
            return false;
        }
        if self.fired {
            return false;
        }
        self.fired = true;
        true
    }
}

fn utc_hour(now: SystemTime) -> u8 {
    let secs = now.duration_since(UNIX_EPOCH).map_or(0, |d| d.as_secs());
    // Always below 24.
    u8::try_from((secs / 3600) % 24).unwrap_or(0)
}

#[derive(Debug)]
/// The periodic flusher.
pub struct Proxy {
    config: Config,
    registry: Arc<Registry>,
    sink: Arc<HttpSink>,
    shutdown: Watcher,
    hour_now: fn() -> u8,
}

fn current_utc_hour() -> u8 {
    utc_hour(SystemTime::now())
}

impl Proxy {
    /// Create a new [`Proxy`].
    ///
    /// # Errors
    ///
    /// Function will return an error if the HTTP client cannot be built.
    pub fn new(config: Config, registry: Arc<Registry>, shutdown: Watcher) -> Result<Self, Error> {
        let sink = Arc::new(HttpSink::new(&config)?);
        Ok(Self {
            config,
            registry,
            sink,
            shutdown,
            hour_now: current_utc_hour,
        })
    }

    fn deliver<T: Serialize>(
        &self,
        inflight: &mut JoinSet<()>,
        payload: Payload,
        snapshot: &T,
        sources: usize,
    ) {
        if sources == 0 {
            return;
        }
        let body = match serde_json::to_vec(snapshot) {
            Ok(body) => body,
            Err(err) => {
                error!(payload = payload.label(), %err, "failed to serialize payload");
                return;
            }
        };
        let sink = Arc::clone(&self.sink);
        inflight.spawn(async move {
            let label = payload.label();
            match sink.send(payload, body).await {
                Ok(()) => {
                    debug!(payload = label, sources, "payload delivered");
                    counter!("payload_sent", "payload" => label).increment(1);
                }
                Err(err) => {
                    warn!(payload = label, sources, %err, "payload dropped");
                    counter!("payload_failed", "payload" => label).increment(1);
                }
            }
        });
    }

    async fn restore(&self) {
        match state::load(&self.config.state_path).await {
            Ok(state) => {
                info!(
                    path = %self.config.state_path.display(),
                    sources = state.len(),
                    "restoring daily sketches"
                );
                self.registry.import_daily_state(&state);
            }
            Err(err) if err.is_not_found() => {
                info!(path = %self.config.state_path.display(), "no daily state to restore");
            }
            Err(err) => warn!(%err, "failed to restore daily state"),
        }
    }

    /// Run [`Proxy`] to completion
    ///
    /// Flushes on every tick until a shutdown signal is received, then runs
    /// the final drain.
    ///
    /// # Errors
    ///
    /// Function will return an error if the daily state cannot be saved on
    /// shutdown.
    pub async fn run(self) -> Result<(), Error> {
        self.restore().await;

        let period = self.config.save_period();
        let pattern_every = self.config.pattern_every_ticks.max(1);
        let mut ticker = time::interval_at(time::Instant::now() + period, period);
        ticker.set_missed_tick_behavior(time::MissedTickBehavior::Delay);
        let mut daily = DailyTrigger::new(self.config.daily_hour_utc);
        let mut tick = 0;
        let mut inflight = JoinSet::new();

        let shutdown_wait = self.shutdown.clone().recv();
        tokio::pin!(shutdown_wait);
        loop {
            tokio::select! {
                _ = ticker.tick() => {
                    let numeric = self.registry.take_numeric();
                    self.deliver(&mut inflight, Payload::Numeric, &numeric, numeric.len());

                    tick += 1;
                    if tick >= pattern_every {
                        tick = 0;
                        let patterns = self.registry.take_patterns();
                        self.deliver(&mut inflight, Payload::Patterns, &patterns, patterns.len());
                    }

                    if daily.poll((self.hour_now)()) {
                        let estimates = self.registry.take_daily();
                        self.deliver(&mut inflight, Payload::Daily, &estimates, estimates.len());
                    }

                    let pruned = self.registry.prune_idle();
                    if pruned > 0 {
                        debug!(pruned, "idle sources pruned");
                    }

                    while inflight.try_join_next().is_some() {}
                }
                () = &mut shutdown_wait => {
                    info!("shutdown signal received");
                    break;
                }
            }
        }

        let drained = self.registry.drain_all();
        self.deliver(&mut inflight, Payload::Numeric, &drained.numeric, drained.numeric.len());
        self.deliver(&mut inflight, Payload::Patterns, &drained.patterns, drained.patterns.len());
        let saved = if drained.daily_state.is_empty() {
            Ok(())
        } else {
            let result = state::save(&self.config.state_path, &drained.daily_state).await;
            if result.is_ok() {
                info!(path = %self.config.state_path.display(), "daily sketches saved");
            }
            result
        };
        while inflight.join_next().await.is_some() {}
        saved?;
        Ok(())
    }
}
