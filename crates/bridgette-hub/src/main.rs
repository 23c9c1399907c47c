mod gateway;
mod process;
mod terminal;
mod turn;

use crate::{
    gateway::{Gateway, GatewayConfig},
    process::agent_env,
    terminal::TerminalConfig,
    turn::TurnConfig,
};
use clap::Parser;
use std::{
    fs::{File, OpenOptions},
    io,
    net::SocketAddr,
    path::PathBuf,
    sync::{Arc, Mutex},
    time::Duration,
};
use tracing::{error, info, warn};
use tracing_subscriber::{
    fmt::writer::{BoxMakeWriter, MakeWriterExt},
    EnvFilter,
};

const DEFAULT_PORT: u16 = 3000;

#[derive(Clone, Debug)]
struct Config {
    addr: String,
    home: PathBuf,
    agent_bin: PathBuf,
    agent_args: Vec<String>,
    token: Option<String>,
    kill_grace: Duration,
    write_timeout: Duration,
    ping_interval: Duration,
    log_dir: String,
    debug: bool,
    cols: u16,
    rows: u16,
}

#[derive(Parser, Debug)]
#[command(name = "bridgette-hub")]
struct Args {
    #[arg(long, default_value = "")]
    addr: String,
    #[arg(long, default_value = "")]
    home: String,
    #[arg(long, default_value = "")]
    agent_bin: String,
    /// Extra argument placed before the per-turn flags; repeatable.
    #[arg(long = "agent-arg", allow_hyphen_values = true)]
    agent_args: Vec<String>,
    #[arg(long, default_value = "")]
    token: String,
    #[arg(long)]
    kill_grace_ms: Option<u64>,
    #[arg(long, default_value_t = 2)]
    write_timeout: u64,
    #[arg(long, default_value_t = 15)]
    ping_interval: u64,
    #[arg(long, default_value = "")]
    log_dir: String,
    #[arg(long, default_value_t = false)]
    debug: bool,
    #[arg(long, default_value_t = 80)]
    cols: u16,
    #[arg(long, default_value_t = 30)]
    rows: u16,
}

#[tokio::main]
async fn main() {
    let config = match load_config() {
        Ok(config) => config,
        Err(err) => {
            eprintln!("config_error: {err}");
            std::process::exit(2);
        }
    };
    init_logging(&config);
    let addr: SocketAddr = match config.addr.parse() {
        Ok(value) => value,
        Err(err) => {
            error!(event = "invalid_addr", error = %err, addr = %config.addr);
            std::process::exit(1);
        }
    };
    if !addr.ip().is_loopback() && config.token.is_none() {
        warn!(event = "unauthenticated_bind", addr = %addr);
    }

    let env = agent_env(&config.home);
    let mut terminal_env = env.clone();
    terminal_env.push(("TERM".to_string(), "xterm-256color".to_string()));

    let gateway = Gateway::new(
        GatewayConfig {
            home: config.home.clone(),
            token: config.token.clone(),
            write_timeout: config.write_timeout,
            ping_interval: config.ping_interval,
            debug: config.debug,
        },
        TurnConfig {
            program: config.agent_bin.clone(),
            base_args: config.agent_args.clone(),
            env,
            kill_grace: config.kill_grace,
        },
        TerminalConfig {
            program: config.agent_bin.clone(),
            args: Vec::new(),
            cwd: config.home.clone(),
            env: terminal_env,
            cols: config.cols,
            rows: config.rows,
        },
    );
    let app = gateway.router();

    let listener = match tokio::net::TcpListener::bind(addr).await {
        Ok(value) => value,
        Err(err) => {
            error!(event = "hub_error", error = %err);
            std::process::exit(1);
        }
    };

    info!(
        event = "hub_start",
        addr = %addr,
        home = %config.home.display(),
        agent_bin = %config.agent_bin.display(),
        auth = config.token.is_some()
    );

    let shutdown = shutdown_signal(gateway.clone());
    let served = axum::serve(
        listener,
        app.into_make_service_with_connect_info::<SocketAddr>(),
    )
    .with_graceful_shutdown(shutdown)
    .await;

    if let Err(err) = served {
        error!(event = "hub_error", error = %err);
        std::process::exit(1);
    }
    info!(event = "hub_stop");
}

async fn shutdown_signal(gateway: Arc<Gateway>) {
    tokio::select! {
        _ = tokio::signal::ctrl_c() => info!(event = "shutdown", reason = "signal"),
        _ = gateway.restart_requested() => info!(event = "shutdown", reason = "restart"),
    }
    gateway.shutdown().await;
}

fn load_config() -> Result<Config, String> {
    let args = Args::parse();
    let home = resolve_home(&args.home)?;
    let agent_bin = resolve_agent_bin(&args.agent_bin, &home);
    let kill_grace_ms = args
        .kill_grace_ms
        .or_else(|| env_u64("BRIDGETTE_KILL_GRACE_MS"))
        .unwrap_or(3000);
    Ok(Config {
        addr: resolve_addr(&args.addr),
        home,
        agent_bin,
        agent_args: args.agent_args,
        token: resolve_token(&args.token),
        kill_grace: Duration::from_millis(kill_grace_ms),
        write_timeout: Duration::from_secs(args.write_timeout),
        ping_interval: Duration::from_secs(args.ping_interval),
        log_dir: resolve_log_dir(&args.log_dir),
        debug: args.debug || env_true("BRIDGETTE_DEBUG"),
        cols: args.cols.max(1),
        rows: args.rows.max(1),
    })
}

/// Stdout, teed into `<log_dir>/bridgette-hub.log` when the directory is
/// usable. `RUST_LOG` overrides the level chosen from the config.
fn init_logging(config: &Config) {
    let level = if config.debug {
        "debug".to_string()
    } else if let Some(level) = env_nonempty("BRIDGETTE_LOG_LEVEL") {
        level
    } else {
        "info".to_string()
    };
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(level));

    let writer = match open_log_file(&config.log_dir) {
        Ok(Some(file)) => BoxMakeWriter::new(io::stdout.and(Mutex::new(file))),
        Ok(None) => BoxMakeWriter::new(io::stdout),
        Err(err) => {
            eprintln!("log_file_error: {err}");
            BoxMakeWriter::new(io::stdout)
        }
    };
    if let Err(err) = tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_writer(writer)
        .try_init()
    {
        eprintln!("log_init_error: {err}");
    }
}

fn open_log_file(log_dir: &str) -> io::Result<Option<File>> {
    if log_dir.trim().is_empty() {
        return Ok(None);
    }
    let dir = PathBuf::from(log_dir);
    std::fs::create_dir_all(&dir)?;
    let file = OpenOptions::new()
        .create(true)
        .append(true)
        .open(dir.join("bridgette-hub.log"))?;
    Ok(Some(file))
}

fn env_true(key: &str) -> bool {
    match std::env::var(key) {
        Ok(value) => matches!(
            value.trim().to_lowercase().as_str(),
            "1" | "true" | "yes" | "on"
        ),
        Err(_) => false,
    }
}

fn env_nonempty(key: &str) -> Option<String> {
    std::env::var(key)
        .ok()
        .filter(|value| !value.trim().is_empty())
}

fn env_u64(key: &str) -> Option<u64> {
    env_nonempty(key).and_then(|value| value.trim().parse().ok())
}

fn resolve_addr(addr_flag: &str) -> String {
    if !addr_flag.trim().is_empty() {
        return addr_flag.to_string();
    }
    if let Some(value) = env_nonempty("BRIDGETTE_ADDR") {
        return value;
    }
    let port = env_nonempty("PORT")
        .and_then(|value| value.trim().parse::<u16>().ok())
        .unwrap_or(DEFAULT_PORT);
    format!("127.0.0.1:{port}")
}

fn resolve_home(home_flag: &str) -> Result<PathBuf, String> {
    let home = if !home_flag.trim().is_empty() {
        home_flag.to_string()
    } else if let Some(value) = env_nonempty("BRIDGETTE_HOME") {
        value
    } else if let Some(value) = env_nonempty("HOME") {
        value
    } else {
        return Err("no home directory: pass --home or set BRIDGETTE_HOME or HOME".to_string());
    };
    let home = PathBuf::from(home);
    if !home.is_dir() {
        return Err(format!("home is not a directory: {}", home.display()));
    }
    Ok(home)
}

fn resolve_agent_bin(agent_bin_flag: &str, home: &std::path::Path) -> PathBuf {
    if !agent_bin_flag.trim().is_empty() {
        return PathBuf::from(agent_bin_flag);
    }
    if let Some(value) = env_nonempty("BRIDGETTE_AGENT_BIN") {
        return PathBuf::from(value);
    }
    home.join(".local").join("bin").join("claude")
}

fn resolve_token(token_flag: &str) -> Option<String> {
    if !token_flag.is_empty() {
        return Some(token_flag.to_string());
    }
    env_nonempty("BRIDGETTE_TOKEN")
}

fn resolve_log_dir(log_dir_flag: &str) -> String {
    if !log_dir_flag.trim().is_empty() {
        return log_dir_flag.to_string();
    }
    if let Some(value) = env_nonempty("BRIDGETTE_LOG_DIR") {
        return value;
    }
    ".bridgette/logs".to_string()
}
