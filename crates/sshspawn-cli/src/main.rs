//! sshspawn control plane
//!
//! Drives the spawner for one user per invocation. State lives in a JSON
//! file per user, so consecutive invocations behave like a manager that
//! restarts between calls.
//!
//! ## Usage
//!
//! ```bash
//! sshspawn --config /etc/sshspawn/config.ron start amy --env API_TOKEN=abc -- jupyterhub-singleuser
//! sshspawn poll amy
//! sshspawn watch amy --interval 30
//! sshspawn stop amy
//! sshspawn state amy
//! sshspawn identity amy
//! ```

use std::collections::BTreeMap;
use std::path::{Path, PathBuf};
use std::process::ExitCode;
use std::sync::Arc;
use std::time::Duration;

use anyhow::Context as _;
use clap::{Parser, Subcommand};
use sshspawn_core::{
    identity, CertPaths, JsonFileStore, LaunchRequest, PersistedState, PollStatus,
    SessionManager, SpawnerConfig,
};
use tracing_subscriber::{fmt, layer::SubscriberExt, util::SubscriberInitExt, EnvFilter};

/// Environment variable naming the config file when `--config` is absent.
const CONFIG_ENV: &str = "SSHSPAWN_CONFIG";

#[derive(Debug, Parser)]
#[command(name = "sshspawn", version, about = "Launch and supervise a remote process over SSH")]
struct Cli {
    /// RON config file (default: $SSHSPAWN_CONFIG, then <config dir>/sshspawn/config.ron)
    #[arg(long, global = true)]
    config: Option<PathBuf>,

    /// Directory holding per-user state files
    #[arg(long, global = true)]
    state_dir: Option<PathBuf>,

    #[command(subcommand)]
    command: Command,
}

#[derive(Debug, Subcommand)]
enum Command {
    /// Launch the user's process; prints {"address", "port"}
    Start {
        user: String,
        /// Environment entry for the remote process (repeatable)
        #[arg(long = "env", value_name = "KEY=VALUE", value_parser = parse_env)]
        env: Vec<(String, String)>,
        /// Hub API URL present in the command, rewritten if the config overrides it
        #[arg(long)]
        api_url: Option<String>,
        /// TLS key to stage (moved)
        #[arg(long, requires = "cafile")]
        keyfile: Option<PathBuf>,
        /// TLS CA to stage (copied)
        #[arg(long, requires = "keyfile")]
        cafile: Option<PathBuf>,
        /// Program and arguments
        #[arg(last = true, required = true)]
        command: Vec<String>,
    },
    /// Probe once; prints {"alive", "exit_code", "status"}
    Poll { user: String },
    /// Probe repeatedly until the process is gone
    Watch {
        user: String,
        #[arg(long, default_value_t = 30)]
        interval: u64,
    },
    /// Send SIGTERM and forget the process
    Stop { user: String },
    /// Print persisted state
    State { user: String },
    /// Load persisted fields from a JSON record
    LoadState { user: String, json: String },
    /// Forget the process without signalling it
    Clear { user: String },
    /// Print the remote identity and key path for a user
    Identity { user: String },
}

fn parse_env(s: &str) -> Result<(String, String), String> {
    match s.split_once('=') {
        Some((key, value)) if !key.is_empty() => Ok((key.to_string(), value.to_string())),
        _ => Err(format!("expected KEY=VALUE, got {s:?}")),
    }
}

#[cfg(feature = "telemetry")]
type TelemetryGuard = sshspawn_telemetry::OtelGuard;
#[cfg(not(feature = "telemetry"))]
type TelemetryGuard = ();

fn init_tracing() -> Option<TelemetryGuard> {
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info"));

    let registry = tracing_subscriber::registry()
        .with(filter)
        .with(fmt::layer().with_writer(std::io::stderr));

    #[cfg(feature = "telemetry")]
    {
        if sshspawn_telemetry::otel_enabled() {
            match sshspawn_telemetry::otel_layer("sshspawn") {
                Ok((otel_layer, guard)) => {
                    registry.with(otel_layer).init();
                    return Some(guard);
                }
                Err(e) => eprintln!("OTel exporter unavailable, continuing without: {e}"),
            }
        }
    }

    registry.init();
    None
}

#[tokio::main]
async fn main() -> ExitCode {
    let cli = Cli::parse();
    let _otel_guard = init_tracing();

    match run(cli).await {
        Ok(code) => code,
        Err(e) => {
            tracing::error!("{:#}", e);
            ExitCode::FAILURE
        }
    }
}

fn config_path(cli: &Cli) -> Option<PathBuf> {
    cli.config
        .clone()
        .or_else(|| std::env::var_os(CONFIG_ENV).map(PathBuf::from))
        .or_else(|| {
            dirs::config_dir()
                .map(|d| d.join("sshspawn").join("config.ron"))
                .filter(|p| p.exists())
        })
}

fn load_config(cli: &Cli) -> anyhow::Result<SpawnerConfig> {
    match config_path(cli) {
        Some(path) => {
            tracing::debug!(path = %path.display(), "loading config");
            Ok(SpawnerConfig::load(&path)?)
        }
        None => {
            tracing::debug!("no config file, using defaults");
            Ok(SpawnerConfig::default())
        }
    }
}

fn state_dir(cli: &Cli) -> anyhow::Result<PathBuf> {
    if let Some(dir) = &cli.state_dir {
        return Ok(dir.clone());
    }
    dirs::state_dir()
        .or_else(dirs::data_local_dir)
        .map(|d| d.join("sshspawn"))
        .context("no state directory available; pass --state-dir")
}

fn manager(config: SpawnerConfig, state_dir: &Path) -> SessionManager {
    let executor = config.executor();
    let store = Arc::new(JsonFileStore::new(state_dir));
    SessionManager::new(Arc::new(config), executor, store)
}

fn poll_json(status: PollStatus) -> serde_json::Value {
    let label = match status {
        PollStatus::Running => "running",
        PollStatus::Unreachable { .. } => "unreachable",
        PollStatus::Exited => "exited",
        PollStatus::NotRunning => "not_running",
    };
    serde_json::json!({
        "alive": status.is_alive(),
        "exit_code": status.exit_code(),
        "status": label,
    })
}

async fn run(cli: Cli) -> anyhow::Result<ExitCode> {
    let config = load_config(&cli)?;
    let state_dir = state_dir(&cli)?;
    let mgr = manager(config, &state_dir);

    match cli.command {
        Command::Start { user, env, api_url, keyfile, cafile, command } => {
            let certs = match (keyfile, cafile) {
                (Some(keyfile), Some(cafile)) => Some(CertPaths { keyfile, cafile }),
                _ => None,
            };
            let request = LaunchRequest {
                environment: env.into_iter().collect::<BTreeMap<_, _>>(),
                command,
                hub_api_url: api_url,
                certs,
            };
            let endpoint = mgr
                .start(&user, &request)
                .await
                .with_context(|| format!("could not start server for {user}"))?;
            println!(
                "{}",
                serde_json::json!({ "address": endpoint.address, "port": endpoint.port })
            );
        }
        Command::Poll { user } => {
            let status = mgr.poll(&user).await?;
            println!("{}", poll_json(status));
        }
        Command::Watch { user, interval } => {
            let mut ticker = tokio::time::interval(Duration::from_secs(interval.max(1)));
            loop {
                ticker.tick().await;
                let status = mgr.poll(&user).await?;
                println!("{}", poll_json(status));
                if !status.is_alive() {
                    break;
                }
            }
        }
        Command::Stop { user } => {
            mgr.stop(&user).await?;
            tracing::info!(user, "stopped");
        }
        Command::State { user } => {
            let state = mgr.get_state(&user).await?;
            println!("{}", serde_json::to_string(&state)?);
        }
        Command::LoadState { user, json } => {
            let state: PersistedState =
                serde_json::from_str(&json).context("state must be a JSON object")?;
            mgr.load_state(&user, &state).await?;
        }
        Command::Clear { user } => {
            mgr.clear_state(&user).await?;
        }
        Command::Identity { user } => {
            let id = identity::resolve(&user);
            println!(
                "{}",
                serde_json::json!({
                    "user": user,
                    "remote_identity": id.as_str(),
                    "key_path": identity::key_path(&mgr.config().ssh_keyfile, &id),
                })
            );
        }
    }

    Ok(ExitCode::SUCCESS)
}
