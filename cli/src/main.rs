//! SafeWalk CLI - headless driver for the monitoring engine.
//!
//! # Commands
//!
//! - `safewalk score --from LAT,LON --to LAT,LON` fetches a walking route and
//!   prints its safety assessment as JSON.
//! - `safewalk monitor` runs a [`SafetyMonitorSession`] fed from stdin (see
//!   [`protocol`]) and prints every session event as one JSON line.
//!
//! The CLI stands in for the platform layer: it grants location access,
//! publishes fixes into a [`ChannelPositionSource`] and answers password
//! prompts through a [`PromptBroker`].

mod protocol;

use anyhow::{Context, Result, bail};
use clap::{Parser, Subcommand};
use std::{
    fs::{self, OpenOptions},
    path::PathBuf,
    sync::{Arc, Mutex},
};
use tokio::io::{AsyncBufReadExt, BufReader};
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;
use tracing_subscriber::{EnvFilter, fmt, prelude::*};

use safewalk_config::{SafewalkConfig, Settings, config_dir, resolve_device_id};
use safewalk_engine::{
    PasswordPrompt, PromptBroker, RouteSafetyScorer, SafetyMonitorSession, SessionCommand,
    SessionProviders, SessionSettings,
};
use safewalk_providers::{
    BackendClient, ChannelPositionSource, HttpOptions, LocationPermission,
    OpenRouteServiceClient, PositionSource, RouteProvider, http_client,
};
use safewalk_types::LatLon;

use protocol::{Input, parse_lat_lon, parse_line};

#[derive(Parser)]
#[command(name = "safewalk")]
#[command(about = "Route deviation safety monitor")]
struct Cli {
    /// Config file to use instead of ~/.safewalk/config.toml
    #[arg(long, global = true)]
    config: Option<PathBuf>,
    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Fetch a walking route and print its safety assessment
    Score {
        /// Start point as LAT,LON
        #[arg(long, value_parser = lat_lon_arg, allow_hyphen_values = true)]
        from: LatLon,
        /// Destination as LAT,LON
        #[arg(long, value_parser = lat_lon_arg, allow_hyphen_values = true)]
        to: LatLon,
    },
    /// Run a monitoring session driven by commands on stdin
    Monitor,
}

fn lat_lon_arg(value: &str) -> Result<LatLon, String> {
    parse_lat_lon(value).map_err(|e| e.to_string())
}

fn init_tracing() {
    let env_filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info"));

    let (log_file, init_warnings) = open_log_file(default_log_paths());

    if let Some((log_path, file)) = log_file {
        tracing_subscriber::registry()
            .with(fmt::layer().with_ansi(false).with_writer(Mutex::new(file)))
            .with(env_filter)
            .init();

        tracing::info!(path = %log_path.display(), "Logging initialized");
        for warning in init_warnings {
            tracing::warn!("{warning}");
        }
        return;
    }

    // Stdout carries JSON; logs go to stderr when no file is available.
    tracing_subscriber::registry()
        .with(fmt::layer().with_writer(std::io::stderr))
        .with(env_filter)
        .init();
    for warning in init_warnings {
        tracing::warn!("{warning}");
    }
}

/// `~/.safewalk/logs/safewalk.log`, else `./.safewalk/logs/safewalk.log`.
fn default_log_paths() -> impl Iterator<Item = PathBuf> {
    let relative = PathBuf::from(".safewalk").join("logs").join("safewalk.log");
    config_dir()
        .map(|dir| dir.join("logs").join("safewalk.log"))
        .into_iter()
        .chain(std::iter::once(relative))
}

/// Opens the first writable path for appending, collecting a warning per
/// path that failed. The warnings are logged once tracing is up.
fn open_log_file(
    paths: impl IntoIterator<Item = PathBuf>,
) -> (Option<(PathBuf, fs::File)>, Vec<String>) {
    let mut warnings = Vec::new();
    for path in paths {
        let opened = path
            .parent()
            .map_or(Ok(()), fs::create_dir_all)
            .and_then(|()| OpenOptions::new().create(true).append(true).open(&path));
        match opened {
            Ok(file) => return (Some((path, file)), warnings),
            Err(e) => warnings.push(format!("Cannot log to {}: {e}", path.display())),
        }
    }
    (None, warnings)
}

fn load_settings(path: Option<&PathBuf>) -> Result<Settings> {
    let config = match path {
        Some(path) => SafewalkConfig::load_from(path)?,
        None => SafewalkConfig::load()?.unwrap_or_default(),
    };
    Ok(config.resolve()?)
}

/// Production clients for the directions service and the SafeWalk backend.
struct Clients {
    directions: OpenRouteServiceClient,
    backend: BackendClient,
}

impl Clients {
    fn build(settings: &Settings) -> Result<Self> {
        if settings.directions.api_key.is_empty() {
            bail!("directions.api_key is not set");
        }
        let Some(base_url) = settings.backend.base_url.as_deref() else {
            bail!("backend.base_url is not set");
        };

        let http = http_client(HttpOptions {
            request_timeout: settings.backend.request_timeout,
            allow_insecure_http: settings.backend.allow_insecure_http,
        })
        .context("failed to build HTTP client")?;
        let device = resolve_device_id(settings.device_id.as_deref())?;
        tracing::info!(device = device.as_str(), "Using device id");

        Ok(Self {
            directions: OpenRouteServiceClient::with_base_url(
                http.clone(),
                settings.directions.base_url.clone(),
                settings.directions.api_key.clone(),
            ),
            backend: BackendClient::new(http, base_url, settings.backend.token.clone(), device),
        })
    }
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();
    init_tracing();

    let settings = load_settings(cli.config.as_ref())?;

    match cli.command {
        Commands::Score { from, to } => score(&settings, from, to).await,
        Commands::Monitor => monitor(&settings).await,
    }
}

async fn score(settings: &Settings, from: LatLon, to: LatLon) -> Result<()> {
    let clients = Clients::build(settings)?;
    let route = clients.directions.fetch_route(from, to).await?;

    let scorer = RouteSafetyScorer::new(Arc::new(clients.backend), settings.scorer);
    let assessment = scorer
        .score_route(&route, &CancellationToken::new())
        .await?;

    let output = serde_json::json!({
        "route_points": route.len(),
        "assessment": assessment,
    });
    println!("{}", serde_json::to_string_pretty(&output)?);
    Ok(())
}

async fn monitor(settings: &Settings) -> Result<()> {
    let clients = Clients::build(settings)?;
    let backend = Arc::new(clients.backend);

    // Fixes come from stdin, so access is granted up front.
    let source = ChannelPositionSource::with_permission(LocationPermission::Granted);
    let broker = PromptBroker::new();
    let positions: Arc<dyn PositionSource> = Arc::new(source.clone());
    let prompt: Arc<dyn PasswordPrompt> = Arc::new(broker.clone());
    let providers = SessionProviders {
        positions,
        routes: Arc::new(clients.directions),
        predictions: backend.clone(),
        challenges: backend.clone(),
        addresses: backend,
        prompt,
    };

    let (session, mut events) = SafetyMonitorSession::new(providers, SessionSettings::from(settings));
    let snapshots = session.snapshots();
    let (commands, commands_rx) = mpsc::channel(16);
    let shutdown = CancellationToken::new();
    let session_task = tokio::spawn(session.run(commands_rx, shutdown.clone()));

    let printer = tokio::spawn(async move {
        while let Some(event) = events.recv().await {
            print_json(&event);
        }
    });

    let mut lines = BufReader::new(tokio::io::stdin()).lines();
    loop {
        let line = tokio::select! {
            line = lines.next_line() => line.context("failed to read stdin")?,
            _ = tokio::signal::ctrl_c() => break,
        };
        let Some(line) = line else { break };

        let input = match parse_line(&line) {
            Ok(Some(input)) => input,
            Ok(None) => continue,
            Err(e) => {
                tracing::warn!(error = %e, "Ignoring input line");
                eprintln!("{e}");
                continue;
            }
        };

        let command = match input {
            Input::Position(position) => {
                source.publish(position);
                continue;
            }
            Input::Answer(password) => {
                match broker.open_request() {
                    Some(challenge) => {
                        broker.answer(challenge, password);
                    }
                    None => eprintln!("no challenge is waiting for a password"),
                }
                continue;
            }
            Input::Dismiss => {
                match broker.open_request() {
                    Some(challenge) => {
                        broker.dismiss(challenge);
                    }
                    None => eprintln!("no challenge is waiting for a password"),
                }
                continue;
            }
            Input::Snapshot => {
                print_json(&*snapshots.borrow());
                continue;
            }
            Input::Quit => break,
            Input::Destination(destination) => SessionCommand::SelectDestination(destination),
            Input::Override => SessionCommand::OverrideMonitoring,
            Input::SetPassword(password) => SessionCommand::RegisterPassword(password),
            Input::Address(Some(address)) => SessionCommand::ReportAddress(address),
            Input::Address(None) => SessionCommand::FetchAddress,
        };
        if commands.send(command).await.is_err() {
            // The session ended on its own; its result is reported below.
            break;
        }
    }

    shutdown.cancel();
    drop(commands);
    let result = session_task.await.context("session task failed")?;
    if let Err(e) = printer.await {
        tracing::warn!(error = %e, "Event printer failed");
    }
    result?;
    Ok(())
}

fn print_json<T: serde::Serialize>(value: &T) {
    match serde_json::to_string(value) {
        Ok(line) => println!("{line}"),
        Err(e) => tracing::warn!(error = %e, "Failed to encode output"),
    }
}
