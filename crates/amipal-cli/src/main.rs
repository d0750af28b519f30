use amipal_client::{
    build_arguments, CommandArgs, Controller, ControllerConfig, ControlRequest, ControlRouter, JsonlSink,
    QueryOutcome, SessionEnd, TrafficSink,
};
use amipal_core::registry::Classification;
use amipal_core::ActionCatalog;
use anyhow::{Context, Result};
use clap::{Parser, Subcommand};
use std::{
    fs::{File, OpenOptions},
    io::{self, Write},
    path::{Path, PathBuf},
    sync::{Arc, Mutex},
    time::Duration,
};
use tokio::sync::{broadcast, mpsc, watch};
use tracing::{debug, error, info, warn};
use tracing_subscriber::{fmt::writer::BoxMakeWriter, EnvFilter};

const CONTROL_REPLY_TIMEOUT: Duration = Duration::from_secs(10);

#[derive(Parser, Debug)]
#[command(name = "amipal")]
#[command(about = "Asterisk Manager Interface client", long_about = None)]
struct Cli {
    #[arg(long, global = true, default_value = "")]
    host: String,
    #[arg(long, global = true)]
    port: Option<u16>,
    #[arg(long, global = true, default_value = "")]
    username: String,
    #[arg(long, global = true, default_value = "")]
    secret: String,
    #[arg(long, global = true, default_value_t = false)]
    debug: bool,
    #[arg(long, global = true, default_value = "")]
    log_dir: String,
    /// Drop registry events older than this many seconds.
    #[arg(long, global = true)]
    retention_secs: Option<u64>,
    /// Append raw session traffic as JSON lines to this file.
    #[arg(long, global = true)]
    traffic_log: Option<PathBuf>,
    /// JSON action catalog to use instead of the built-in table.
    #[arg(long, global = true)]
    catalog: Option<PathBuf>,
    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand, Debug)]
enum Commands {
    /// Log in and log every event until interrupted
    Listen {
        /// Accept control messages on this Unix socket
        #[arg(long)]
        control_socket: Option<PathBuf>,
        /// Requester ids allowed to use the control socket
        #[arg(long = "allow")]
        allow: Vec<String>,
    },
    /// Run one action and print its correlated events as JSON lines
    Action {
        name: String,
        /// `Key=Value` pairs, or bare positional values
        args: Vec<String>,
        /// Wait for this event to close a list response
        #[arg(long)]
        sentinel: Option<String>,
    },
    /// Send one control message to a running `listen`
    Control {
        socket: PathBuf,
        requester: String,
        command: String,
        args: Vec<String>,
    },
}

impl Commands {
    fn name(&self) -> &'static str {
        match self {
            Commands::Listen { .. } => "listen",
            Commands::Action { .. } => "action",
            Commands::Control { .. } => "control",
        }
    }
}

#[derive(Clone, Debug)]
struct Config {
    controller: ControllerConfig,
    debug: bool,
    log_dir: String,
    traffic_log: Option<PathBuf>,
    catalog: Option<PathBuf>,
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();
    let config = load_config(&cli);
    let _session_log = init_logging(&config, cli.command.name());

    match cli.command {
        Commands::Listen {
            control_socket,
            allow,
        } => listen(&config, control_socket, allow).await,
        Commands::Action {
            name,
            args,
            sentinel,
        } => run_action(&config, &name, &args, sentinel.as_deref()).await,
        Commands::Control {
            socket,
            requester,
            command,
            args,
        } => send_control(&socket, requester, command, &args).await,
    }
}

fn load_config(cli: &Cli) -> Config {
    let mut controller = ControllerConfig::new(
        resolve_value(&cli.host, "AMI_HOST", "127.0.0.1"),
        resolve_value(&cli.username, "AMI_USERNAME", "ami"),
        resolve_value(&cli.secret, "AMI_SECRET", ""),
    );
    controller.port = resolve_port(cli.port);
    controller.retention = cli.retention_secs.map(Duration::from_secs);
    Config {
        controller,
        debug: cli.debug || env_flag("AMIPAL_DEBUG"),
        log_dir: resolve_value(&cli.log_dir, "AMIPAL_LOG_DIR", ""),
        traffic_log: cli.traffic_log.clone(),
        catalog: cli.catalog.clone(),
    }
}

fn build_controller(
    config: &Config,
    catalog: Arc<ActionCatalog>,
    control: Option<(ControlRouter, mpsc::Receiver<ControlRequest>)>,
) -> Result<Controller> {
    let mut builder = Controller::builder(config.controller.clone()).catalog(catalog);
    if let Some(path) = &config.traffic_log {
        let sink: Arc<dyn TrafficSink> = Arc::new(
            JsonlSink::open(path).with_context(|| format!("Failed to open traffic log {}", path.display()))?,
        );
        builder = builder.sink(sink);
    }
    if let Some((router, requests)) = control {
        builder = builder.control(router, requests);
    }
    Ok(builder.build())
}

fn load_catalog(path: Option<&Path>) -> Result<ActionCatalog> {
    let Some(path) = path else {
        return Ok(ActionCatalog::default());
    };
    let raw = std::fs::read_to_string(path)
        .with_context(|| format!("Failed to read catalog {}", path.display()))?;
    ActionCatalog::from_json(&raw).with_context(|| format!("Failed to parse catalog {}", path.display()))
}

async fn listen(config: &Config, control_socket: Option<PathBuf>, allow: Vec<String>) -> Result<()> {
    let catalog = Arc::new(load_catalog(config.catalog.as_deref())?);
    let (shutdown_tx, shutdown_rx) = watch::channel(false);
    let mut listener = None;
    let control = match control_socket {
        Some(path) => {
            let router = ControlRouter::with_catalog(&catalog, allow)?;
            let (tx, rx) = mpsc::channel(64);
            listener = Some(spawn_control_listener(path, tx, shutdown_rx.clone())?);
            Some((router, rx))
        }
        None => None,
    };

    let controller = build_controller(config, catalog, control)?;
    let mut events = controller.subscribe();
    controller.login().await.context("Login failed")?;

    let mut liveness = tokio::time::interval(Duration::from_secs(1));
    let outcome = loop {
        tokio::select! {
            _ = tokio::signal::ctrl_c() => {
                info!(event = "amipal_interrupted");
                break Ok(());
            }
            received = events.recv() => {
                match received {
                    Ok(event) => {
                        let classification = event.classification().unwrap_or(Classification::Alien);
                        info!(
                            event = "ami_event",
                            name = event.name().or(event.response()).unwrap_or_default(),
                            class = %classification,
                            pairs = %event
                        );
                    }
                    Err(broadcast::error::RecvError::Lagged(skipped)) => {
                        warn!(event = "ami_event_lagged", skipped);
                    }
                    Err(broadcast::error::RecvError::Closed) => break Ok(()),
                }
            }
            _ = liveness.tick() => {
                if !controller.is_connected() {
                    break listen_outcome(controller.session_end());
                }
            }
        }
    };

    controller.logoff().await;
    let _ = shutdown_tx.send(true);
    if let Some(handle) = listener {
        if let Ok(Err(err)) = handle.await {
            warn!(event = "amipal_control_listener_error", error = %err);
        }
    }
    outcome
}

/// A logoff requested over the control socket ends `listen` cleanly; any
/// other loss of the session is an error.
fn listen_outcome(end: Option<SessionEnd>) -> Result<()> {
    match end {
        Some(SessionEnd::Logoff) => {
            info!(event = "amipal_logged_off");
            Ok(())
        }
        other => {
            error!(event = "ami_session_lost", reason = ?other);
            Err(anyhow::anyhow!("Manager session ended: {other:?}"))
        }
    }
}

#[cfg(unix)]
fn spawn_control_listener(
    path: PathBuf,
    tx: mpsc::Sender<ControlRequest>,
    shutdown: watch::Receiver<bool>,
) -> Result<tokio::task::JoinHandle<io::Result<()>>> {
    Ok(tokio::spawn(async move {
        amipal_client::control::listen_unix(&path, tx, shutdown).await
    }))
}

#[cfg(not(unix))]
fn spawn_control_listener(
    _path: PathBuf,
    _tx: mpsc::Sender<ControlRequest>,
    _shutdown: watch::Receiver<bool>,
) -> Result<tokio::task::JoinHandle<io::Result<()>>> {
    anyhow::bail!("Control sockets require a Unix platform")
}

async fn run_action(config: &Config, name: &str, raw_args: &[String], sentinel: Option<&str>) -> Result<()> {
    let catalog = Arc::new(load_catalog(config.catalog.as_deref())?);
    let controller = build_controller(config, catalog, None)?;
    let args = parse_command_args(raw_args);
    controller.login().await.context("Login failed")?;

    let result = match sentinel {
        Some(sentinel) => {
            let fields = build_arguments(name, controller.catalog().action(name), &args)?;
            let fields = fields
                .iter()
                .map(|(key, value)| (key.as_str(), value.as_str()))
                .collect::<Vec<_>>();
            controller.query_raw(name, &fields, Some(sentinel)).await
        }
        None => controller.query(name, args).await,
    };
    controller.logoff().await;

    let outcome = result?;
    print_outcome(&outcome)?;
    if !outcome.complete {
        warn!(event = "amipal_partial_result", action = %name, events = outcome.events.len());
    }
    Ok(())
}

fn print_outcome(outcome: &QueryOutcome) -> Result<()> {
    let stdout = io::stdout();
    let mut out = stdout.lock();
    for event in &outcome.events {
        serde_json::to_writer(&mut out, &event.to_map())?;
        out.write_all(b"\n")?;
    }
    out.flush()?;
    Ok(())
}

#[cfg(unix)]
async fn send_control(socket: &Path, requester: String, command: String, raw_args: &[String]) -> Result<()> {
    let args = parse_command_args(raw_args);
    let message = amipal_core::control::ControlMessage {
        requester_id: requester,
        command,
        args: args.positional,
        kwargs: args.keyword,
    };
    debug!(event = "amipal_control_send", socket = %socket.display(), command = %message.command);
    let reply = amipal_client::control::send_unix(socket, &message, CONTROL_REPLY_TIMEOUT)
        .await
        .with_context(|| format!("Control request to {} failed", socket.display()))?;
    println!("{}", serde_json::to_string(&reply)?);
    Ok(())
}

#[cfg(not(unix))]
async fn send_control(_socket: &Path, _requester: String, _command: String, _raw_args: &[String]) -> Result<()> {
    anyhow::bail!("Control sockets require a Unix platform")
}

/// `Key=Value` items become keyword arguments, anything else is positional.
fn parse_command_args(raw: &[String]) -> CommandArgs {
    let mut args = CommandArgs::default();
    for item in raw {
        match item.split_once('=') {
            Some((key, value)) if !key.trim().is_empty() => {
                args.keyword.insert(key.trim().to_string(), value.to_string());
            }
            _ => args.positional.push(item.clone()),
        }
    }
    args
}

fn init_logging(config: &Config, command: &str) -> Option<SessionLog> {
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(log_level(config.debug)));
    let log = match SessionLog::open(&config.log_dir, command, &config.controller.host) {
        Ok(log) => log,
        Err(err) => {
            eprintln!("log_file_error: {err}");
            None
        }
    };
    let file = log.as_ref().map(|log| log.file.clone());
    let make_writer = BoxMakeWriter::new(move || TeeWriter { file: file.clone() });
    let subscriber = tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_writer(make_writer)
        .finish();
    tracing::subscriber::set_global_default(subscriber).ok()?;
    if let Some(log) = &log {
        debug!(event = "amipal_log_file", path = %log.path.display());
    }
    log
}

fn log_level(debug: bool) -> String {
    std::env::var("AMIPAL_LOG_LEVEL")
        .ok()
        .filter(|level| !level.trim().is_empty())
        .unwrap_or_else(|| if debug { "debug" } else { "info" }.to_string())
}

/// Append-only log for one subcommand against one manager host, e.g.
/// `amipal-listen-pbx.local.log`.
struct SessionLog {
    path: PathBuf,
    file: Arc<Mutex<File>>,
}

impl SessionLog {
    fn open(log_dir: &str, command: &str, host: &str) -> io::Result<Option<Self>> {
        if log_dir.trim().is_empty() {
            return Ok(None);
        }
        let dir = PathBuf::from(log_dir);
        std::fs::create_dir_all(&dir)?;
        let path = dir.join(log_file_name(command, host));
        let file = OpenOptions::new().create(true).append(true).open(&path)?;
        Ok(Some(Self {
            path,
            file: Arc::new(Mutex::new(file)),
        }))
    }
}

fn log_file_name(command: &str, host: &str) -> String {
    let host = host
        .chars()
        .map(|c| if c.is_ascii_alphanumeric() || c == '.' || c == '-' { c } else { '_' })
        .collect::<String>();
    format!("amipal-{command}-{host}.log")
}

/// Log lines go to stderr plus the session log; stdout is left to command output.
struct TeeWriter {
    file: Option<Arc<Mutex<File>>>,
}

impl TeeWriter {
    fn with_file(&self, op: impl FnOnce(&mut File) -> io::Result<()>) {
        if let Some(file) = &self.file {
            let mut file = file.lock().unwrap_or_else(|poisoned| poisoned.into_inner());
            let _ = op(&mut file);
        }
    }
}

impl Write for TeeWriter {
    fn write(&mut self, buf: &[u8]) -> io::Result<usize> {
        let _ = io::stderr().write_all(buf);
        self.with_file(|file| file.write_all(buf));
        Ok(buf.len())
    }

    fn flush(&mut self) -> io::Result<()> {
        let _ = io::stderr().flush();
        self.with_file(|file| file.flush());
        Ok(())
    }
}

fn env_flag(key: &str) -> bool {
    std::env::var(key)
        .map(|value| matches!(value.trim().to_ascii_lowercase().as_str(), "1" | "true" | "yes" | "on"))
        .unwrap_or(false)
}

/// Flag, then environment, then `default`; blank values count as unset.
fn resolve_value(flag: &str, env_key: &str, default: &str) -> String {
    if !flag.trim().is_empty() {
        return flag.to_string();
    }
    if let Ok(value) = std::env::var(env_key) {
        if !value.trim().is_empty() {
            return value;
        }
    }
    default.to_string()
}

fn resolve_port(flag: Option<u16>) -> u16 {
    if let Some(port) = flag {
        return port;
    }
    std::env::var("AMI_PORT")
        .ok()
        .and_then(|value| value.trim().parse().ok())
        .unwrap_or(amipal_client::config::DEFAULT_PORT)
}
