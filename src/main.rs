use std::path::PathBuf;
use std::time::Duration;

use clap::Parser;
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

use executant::agent::Supervisor;
use executant::compose::{ComposeCommand, OutputMode};
use executant::config::{self, AgentConfig, ConsulSettings, Timings};

#[derive(Parser)]
#[command(name = "executant")]
#[command(about = "Converge local docker-compose stacks to manifests stored in Consul")]
struct Cli {
    /// Consul keys to watch, comma separated (one compose project per key)
    #[arg(long, env = "EXECUTANT_KEYS", value_delimiter = ',')]
    keys: Vec<String>,

    /// Service labels to deploy, comma separated
    #[arg(long, env = "EXECUTANT_FILTERS", value_delimiter = ',', default_value = config::DEFAULT_FILTER)]
    filters: Vec<String>,

    /// Directory holding one sub-directory per project
    #[arg(long, env = "EXECUTANT_WORK_DIR", default_value = config::DEFAULT_WORK_DIR)]
    work_dir: PathBuf,

    /// Consul HTTP address
    #[arg(long, env = "CONSUL_HTTP_ADDR", default_value = executant::consul::DEFAULT_ADDRESS)]
    consul_addr: String,

    /// Consul ACL token
    #[arg(long, env = "CONSUL_HTTP_TOKEN", hide_env_values = true)]
    consul_token: Option<String>,

    /// Consul datacenter to query
    #[arg(long, env = "CONSUL_DATACENTER")]
    datacenter: Option<String>,

    /// Compose command line, e.g. "docker compose"
    #[arg(long, env = "EXECUTANT_COMPOSE_COMMAND", default_value = "docker-compose")]
    compose_command: String,

    /// Maximum duration of a blocking read, in seconds
    #[arg(long, default_value_t = 60)]
    wait_time: u64,

    /// Delay after Consul could not be reached, in seconds
    #[arg(long, default_value_t = 30)]
    transport_backoff: u64,

    /// Delay after a key was found missing, in seconds
    #[arg(long, default_value_t = 15)]
    not_found_backoff: u64,

    /// Delay after a manifest failed to parse, in seconds
    #[arg(long, default_value_t = 15)]
    parse_error_backoff: u64,

    /// Delay between leader probes at startup, in seconds
    #[arg(long, default_value_t = 5)]
    readiness_interval: u64,

    /// Time allowed for in-flight actions at shutdown, in seconds
    #[arg(long, default_value_t = 30)]
    shutdown_grace: u64,

    /// Send compose output to the agent's stdout/stderr instead of the log
    #[arg(long)]
    inherit_output: bool,

    /// Enable debug logging
    #[arg(short, long)]
    verbose: bool,
}

impl Cli {
    fn into_config(self) -> anyhow::Result<AgentConfig> {
        let keys = if self.keys.is_empty() {
            std::env::var("EXECUTANT_KEY")
                .map(|key| config::split_list(&key))
                .unwrap_or_else(|_| vec![config::DEFAULT_KEY.to_string()])
        } else {
            self.keys
        };

        let compose = ComposeCommand::parse(&self.compose_command)
            .ok_or_else(|| anyhow::anyhow!("Compose command must not be empty"))?;

        Ok(AgentConfig {
            keys: keys.into_iter().map(|k| k.trim().to_string()).collect(),
            filter: executant::models::LabelFilter::new(
                self.filters
                    .iter()
                    .map(|f| f.trim())
                    .filter(|f| !f.is_empty()),
            ),
            work_dir: self.work_dir,
            consul: ConsulSettings {
                address: self.consul_addr,
                token: self.consul_token,
                datacenter: self.datacenter,
            },
            compose,
            output: if self.inherit_output {
                OutputMode::Inherit
            } else {
                OutputMode::Log
            },
            timings: Timings {
                wait_time: Duration::from_secs(self.wait_time),
                transport_backoff: Duration::from_secs(self.transport_backoff),
                not_found_backoff: Duration::from_secs(self.not_found_backoff),
                parse_error_backoff: Duration::from_secs(self.parse_error_backoff),
                readiness_interval: Duration::from_secs(self.readiness_interval),
                shutdown_grace: Duration::from_secs(self.shutdown_grace),
            },
        })
    }
}

/// Initialize tracing on stdout
fn init_tracing(verbose: bool) {
    let default = if verbose {
        "executant=debug"
    } else {
        "executant=info"
    };
    let filter = tracing_subscriber::EnvFilter::new(
        std::env::var("RUST_LOG").unwrap_or_else(|_| default.into()),
    );

    tracing_subscriber::registry()
        .with(filter)
        .with(tracing_subscriber::fmt::layer())
        .init();
}

/// Resolve on SIGINT, or SIGTERM on unix.
async fn shutdown_signal() {
    let ctrl_c = async {
        if let Err(e) = tokio::signal::ctrl_c().await {
            tracing::error!(error = %e, "Unable to listen for SIGINT");
            std::future::pending::<()>().await;
        }
    };

    #[cfg(unix)]
    let terminate = async {
        use tokio::signal::unix::{signal, SignalKind};
        match signal(SignalKind::terminate()) {
            Ok(mut sigterm) => {
                sigterm.recv().await;
            }
            Err(e) => {
                tracing::error!(error = %e, "Unable to listen for SIGTERM");
                std::future::pending::<()>().await;
            }
        }
    };

    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        _ = ctrl_c => tracing::warn!("Shutdown signal received (SIGINT)"),
        _ = terminate => tracing::warn!("Shutdown signal received (SIGTERM)"),
    }
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let cli = Cli::parse();
    init_tracing(cli.verbose);

    let config = cli.into_config()?;
    config.log_summary();

    let supervisor = Supervisor::new(config)?;
    let report = supervisor.run(shutdown_signal()).await?;

    if report.all_succeeded() {
        tracing::info!("All projects torn down");
    } else {
        tracing::warn!("Some projects could not be torn down, see errors above");
    }

    Ok(())
}
