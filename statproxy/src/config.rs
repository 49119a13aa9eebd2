//! This module controls configuration parsing from the end user, providing a
//! convenience mechanism for the rest of the program. Crashes are most likely
//! to originate from this code, intentionally.

use std::{
    io,
    net::SocketAddr,
    path::{Path, PathBuf},
};

use rustc_hash::FxHashMap;
use serde::Deserialize;
use statproxy_core::Limits;
use tracing::debug;

use crate::{listener, proxy, supervisor};

/// Environment variable whose contents, when set, replace the config file.
pub const CONFIG_ENV: &str = "STATPROXY_CONFIG";

/// Errors produced by [`Config`].
#[derive(thiserror::Error, Debug)]
pub enum Error {
    /// Error reading config file
    #[error("Failed to read config file {path:?}: {source}")]
    ReadFile {
        /// File path
        path: PathBuf,
        /// Underlying IO error
        #[source]
        source: Box<io::Error>,
    },
    /// Config file is not valid YAML or does not match the schema
    #[error("Failed to deserialize config: {0}")]
    SerdeYaml(#[from] serde_yaml::Error),
    /// Neither the listener nor the proxy is configured
    #[error("No service to run, configure a listener or a proxy")]
    NoService,
}

/// Main configuration struct for this program
#[derive(Debug, Default, Deserialize, PartialEq, Eq, Clone)]
#[serde(deny_unknown_fields)]
pub struct Config {
    /// The UDP listener that receives metric events
    #[serde(default)]
    pub listener: Option<listener::Config>,
    /// The flusher that drains aggregates to the downstream sink
    #[serde(default)]
    pub proxy: Option<proxy::Config>,
    /// Bounds applied to every source's accumulator
    #[serde(default)]
    pub limits: Limits,
    /// Restart policy for the services
    #[serde(default)]
    pub supervisor: supervisor::Config,
    /// The method by which to express telemetry
    #[serde(default)]
    pub telemetry: Option<Telemetry>,
    /// Report this node's own lifecycle events to a stat-proxy
    #[serde(default)]
    pub self_report: Option<SelfReport>,
}

#[derive(Debug, Deserialize, PartialEq, Eq, Clone)]
#[serde(untagged)]
/// Defines the manner of stat-proxy's own telemetry.
pub enum Telemetry {
    /// In prometheus mode stat-proxy will emit its internal telemetry for
    /// scraping at a prometheus poll endpoint.
    Prometheus {
        /// Address and port for prometheus exporter
        addr: SocketAddr,
        /// Additional labels to include in every metric
        #[serde(default)]
        global_labels: FxHashMap<String, String>,
    },
}

fn default_self_report_addr() -> SocketAddr {
    SocketAddr::from(([127, 0, 0, 1], 1007))
}

fn default_self_report_source() -> String {
    "dev_log_saver/0".to_string()
}

#[derive(Debug, Deserialize, PartialEq, Eq, Clone)]
#[serde(deny_unknown_fields)]
/// Where and as whom this node reports its own events.
pub struct SelfReport {
    /// The stat-proxy listener to report to
    #[serde(default = "default_self_report_addr")]
    pub addr: SocketAddr,
    /// The source key to report under
    #[serde(default = "default_self_report_source")]
    pub source: String,
}

impl Default for SelfReport {
    fn default() -> Self {
        Self {
            addr: default_self_report_addr(),
            source: default_self_report_source(),
        }
    }
}

/// Read the raw configuration, preferring [`CONFIG_ENV`] over the file at
/// `path`.
///
/// Returns `Ok(None)` when the variable is unset and the file does not exist.
///
/// # Errors
///
/// Function will return an error if the file exists but cannot be read.
pub fn load_contents(path: &Path) -> Result<Option<String>, Error> {
    if let Ok(contents) = std::env::var(CONFIG_ENV) {
        debug!("Using config from env var '{CONFIG_ENV}'");
        return Ok(Some(contents));
    }
    debug!("Attempting to open configuration file at: {}", path.display());
    match std::fs::read_to_string(path) {
        Ok(contents) => Ok(Some(contents)),
        Err(err) if err.kind() == io::ErrorKind::NotFound => Ok(None),
        Err(source) => Err(Error::ReadFile {
            path: path.to_path_buf(),
            source: Box::new(source),
        }),
    }
}

impl Config {
    /// Parse a YAML document.
    ///
    /// # Errors
    ///
    /// Function will return an error if the document does not match the
    /// schema.
    pub fn parse(contents: &str) -> Result<Self, Error> {
        Ok(serde_yaml::from_str(contents)?)
    }

    /// Check that the configuration describes something to run.
    ///
    /// # Errors
    ///
    /// Function will return [`Error::NoService`] if neither a listener nor a
    /// proxy is configured.
    pub fn validate(&self) -> Result<(), Error> {
        if self.listener.is_none() && self.proxy.is_none() {
            return Err(Error::NoService);
        }
        Ok(())
    }
}
