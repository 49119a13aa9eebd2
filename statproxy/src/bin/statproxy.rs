use std::{
    net::SocketAddr,
    path::{Path, PathBuf},
    sync::Arc,
};

use clap::{Args, Parser, Subcommand};
use futures::FutureExt;
use jemallocator::Jemalloc;
use metrics_exporter_prometheus::PrometheusBuilder;
use statproxy::{
    config::{self, Config, SelfReport, Telemetry},
    emitter::Emitter,
    listener::{self, Listener},
    proxy::{self, Proxy},
    supervisor::{Supervisor, Worker},
};
use statproxy_core::{Event, Kind, Op, Registry};
use tokio::{
    runtime::Builder,
    signal,
    time::{Duration, sleep},
};
use tracing::{Instrument, debug, error, info, info_span, warn};
use tracing_subscriber::{EnvFilter, util::SubscriberInitExt};

#[global_allocator]
static GLOBAL: Jemalloc = Jemalloc;

const SELF_REPORT_DELAY: Duration = Duration::from_secs(5);

#[derive(thiserror::Error, Debug)]
enum Error {
    #[error(transparent)]
    Io(#[from] std::io::Error),
    #[error("Invalid configuration: {0}")]
    Config(#[from] config::Error),
    #[error("No configuration found at {0:?}")]
    MissingConfig(PathBuf),
    #[error(transparent)]
    Supervisor(#[from] statproxy::supervisor::Error),
}

fn default_config_path() -> PathBuf {
    PathBuf::from("/etc/statproxy/statproxy.yaml")
}

#[derive(Parser)]
#[clap(version, about, long_about = None)]
struct Cli {
    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Run stat-proxy with specified configuration
    Run(RunArgs),
    /// Validate configuration file and exit
    ConfigCheck(ConfigCheckArgs),
}

#[derive(Args)]
struct RunArgs {
    /// path on disk to the configuration file
    #[clap(long, default_value_os_t = default_config_path())]
    config_path: PathBuf,
    /// address to receive metric events on, overrides the listener config
    #[clap(long)]
    udp: Option<SocketAddr>,
    /// URL to ship drained metrics to, overrides the proxy config
    #[clap(long)]
    proxy_to: Option<String>,
    /// seconds between numeric flushes
    #[clap(long)]
    save_time_seconds: Option<u64>,
    /// path of the daily sketch state file
    #[clap(long)]
    state_path: Option<PathBuf>,
    /// the maximum time to wait, in seconds, for controlled shutdown
    #[clap(long, default_value_t = 30)]
    max_shutdown_delay: u16,
}

#[derive(Args)]
struct ConfigCheckArgs {
    /// path on disk to the configuration file
    #[clap(long, default_value_os_t = default_config_path())]
    config_path: PathBuf,
}

fn validate_config(config_path: &Path) -> Result<Config, Error> {
    let contents = config::load_contents(config_path)?
        .ok_or_else(|| Error::MissingConfig(config_path.to_path_buf()))?;
    let config = Config::parse(&contents).inspect_err(|err| {
        error!("Configuration validation failed: {err}");
    })?;
    config.validate()?;
    info!("Configuration file is valid");
    Ok(config)
}

fn get_config(args: &RunArgs, contents: Option<String>) -> Result<Config, Error> {
    let contents = match contents {
        Some(contents) => Some(contents),
        None => config::load_contents(&args.config_path)?,
    };
    let mut config = match contents {
        Some(contents) => Config::parse(&contents)?,
        None => {
            debug!(
                "No configuration at {}, using command line only",
                args.config_path.display()
            );
            Config::default()
        }
    };

    if let Some(binding_addr) = args.udp {
        config.listener = Some(listener::Config { binding_addr });
    }
    if let Some(proxy_to) = &args.proxy_to {
        match config.proxy {
            Some(ref mut proxy) => proxy.proxy_to.clone_from(proxy_to),
            None => config.proxy = Some(proxy::Config::new(proxy_to.clone())),
        }
    }
    if let Some(proxy) = config.proxy.as_mut() {
        if let Some(secs) = args.save_time_seconds {
            proxy.save_time_seconds = secs;
        }
        if let Some(path) = &args.state_path {
            proxy.state_path.clone_from(path);
        }
    }

    config.validate()?;
    Ok(config)
}

fn install_telemetry(telemetry: Option<Telemetry>) {
    let Some(Telemetry::Prometheus {
        addr,
        global_labels,
    }) = telemetry
    else {
        return;
    };
    let mut builder = PrometheusBuilder::new().with_http_listener(addr);
    for (k, v) in global_labels {
        builder = builder.add_global_label(k, v);
    }
    tokio::spawn(async move {
        if let Err(err) = builder.install() {
            warn!("failed to install prometheus recorder: {err}");
        }
    });
}

async fn report_start(self_report: SelfReport) {
    sleep(SELF_REPORT_DELAY).await;
    let event = Event {
        source: &self_report.source,
        metric: "start",
        op: Op::Scalar {
            kind: Kind::Sum,
            value: 1,
        },
    };
    let result = match Emitter::bind(self_report.addr).await {
        Ok(emitter) => emitter.emit(&event).await,
        Err(err) => Err(err),
    };
    if let Err(err) = result {
        warn!("failed to report start: {err}");
    }
}

async fn inner_main(config: Config, max_shutdown_delay: Duration) -> Result<(), Error> {
    let (shutdown_watcher, shutdown_broadcast) = statproxy_signal::signal();

    install_telemetry(config.telemetry);

    let registry = Arc::new(Registry::new(config.limits));
    let mut supervisor = Supervisor::new(config.supervisor);

    //
    // LISTENER
    //
    if let Some(listener_config) = config.listener {
        let registry = Arc::clone(&registry);
        supervisor.push(Worker::new("listener", move |shutdown| {
            let registry = Arc::clone(&registry);
            async move {
                let listener = Listener::bind(&listener_config, registry, shutdown).await?;
                listener.run().await?;
                Ok(())
            }
            .boxed()
        }));
    }

    //
    // PROXY
    //
    if let Some(proxy_config) = config.proxy {
        let registry = Arc::clone(&registry);
        supervisor.push(Worker::new("proxy", move |shutdown| {
            let proxy = Proxy::new(proxy_config.clone(), Arc::clone(&registry), shutdown);
            async move {
                proxy?.run().await?;
                Ok(())
            }
            .boxed()
        }));
    }

    if let Some(self_report) = config.self_report {
        tokio::spawn(report_start(self_report).instrument(info_span!("self_report")));
    }

    tokio::spawn(async move {
        match signal::ctrl_c().await {
            Ok(()) => info!("received ctrl-c"),
            Err(err) => error!("unable to listen for ctrl-c, shutting down: {err}"),
        }
        shutdown_broadcast.signal();
    });

    supervisor.run(shutdown_watcher, max_shutdown_delay).await?;
    Ok(())
}

fn main() -> Result<(), Error> {
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::from_default_env())
        .with_ansi(false)
        .finish()
        .init();

    let version = env!("CARGO_PKG_VERSION");
    info!("Starting statproxy {version} run.");

    let args = match Cli::parse().command {
        Commands::Run(args) => args,
        Commands::ConfigCheck(check) => match validate_config(&check.config_path) {
            Ok(_) => std::process::exit(0),
            Err(_) => std::process::exit(1),
        },
    };

    let config = get_config(&args, None)?;
    let max_shutdown_delay = Duration::from_secs(args.max_shutdown_delay.into());

    let runtime = Builder::new_multi_thread()
        .enable_io()
        .enable_time()
        .build()?;
    let res = runtime.block_on(inner_main(config, max_shutdown_delay));
    info!(
        "Shutting down runtime with a {} second delay. May leave orphaned tasks.",
        max_shutdown_delay.as_secs(),
    );
    runtime.shutdown_timeout(max_shutdown_delay);
    info!("Bye. :)");
    res
}
