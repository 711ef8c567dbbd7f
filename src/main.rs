use std::process::ExitCode;
use std::sync::Arc;
use std::time::Duration;

use clap::Parser;
use serde_json::json;
use tokio::sync::watch;
use tokio::task::JoinHandle;

use mongotrap::config::Config;
use mongotrap::logger::EventLog;
use mongotrap::proxy::ProxyContext;
use mongotrap::sandbox::MongoSandbox;
use mongotrap::{Error, Result, server, supervisor};

const EXIT_INTERRUPTED: u8 = 1;
const EXIT_SANDBOX: u8 = 2;
const EXIT_UPSTREAM: u8 = 3;

const STARTUP_PROBE_ATTEMPTS: u32 = 3;
const STARTUP_PROBE_DELAY: Duration = Duration::from_millis(500);
const SHUTDOWN_GRACE: Duration = Duration::from_secs(2);

#[tokio::main]
async fn main() -> ExitCode {
    // Load .env first so clap's env fallbacks see variables
    let _ = dotenvy::dotenv();

    let cli = Cli::parse();

    // Load config before initializing logs to pick up log_level from file
    let cfg_file_res = Config::load_from_file(cli.config.as_deref());
    let cfg_file = match &cfg_file_res {
        Ok(c) => c.clone(),
        Err(_) => Config::default(),
    };

    // Filter precedence: CLI (--log-level / MONGOTRAP_LOG_LEVEL) > RUST_LOG
    // (env) > config file log_level > default
    let filter_spec = if let Some(ref lvl) = cli.log_level {
        lvl.clone()
    } else if let Ok(env_spec) = std::env::var("RUST_LOG") {
        env_spec
    } else if let Some(ref lvl) = cfg_file.log_level {
        lvl.clone()
    } else if cli.verbose || cfg_file.verbose {
        "info,mongotrap=debug".to_string()
    } else {
        "info".to_string()
    };

    tracing_subscriber::fmt()
        .with_env_filter(tracing_subscriber::EnvFilter::new(filter_spec))
        .compact()
        .init();

    if let Err(e) = cfg_file_res.as_ref() {
        tracing::warn!(error = %format!("{e:?}"), "invalid config; using defaults");
    }

    let cfg = cfg_file
        .with_overrides(
            cli.host,
            cli.mongo_host,
            cli.check_interval,
            cli.verbose,
            cli.log_file,
            cli.log_rotation_threshold,
            cli.restart_cmd,
            cli.log_level,
        )
        .normalized();
    let cfg = match cfg {
        Ok(c) => c,
        Err(e) => {
            tracing::error!(error = %e, "invalid configuration");
            return ExitCode::from(EXIT_INTERRUPTED);
        }
    };

    match run(cfg).await {
        Ok(code) => ExitCode::from(code),
        Err(e) => {
            tracing::error!(error = %format!("{e:?}"), "monitor terminated with error");
            ExitCode::from(EXIT_INTERRUPTED)
        }
    }
}

async fn run(cfg: Config) -> Result<u8> {
    let log = Arc::new(EventLog::open(&cfg.log_file, cfg.log_rotation_threshold)?);
    let result = serve(cfg, log.clone()).await;
    // Exit hook: every path out of serve() gets a shutdown entry.
    if let Err(e) = log.log("system", "shutdown", json!({})) {
        tracing::error!(error = %e, "failed to log shutdown");
    }
    result
}

async fn serve(cfg: Config, log: Arc<EventLog>) -> Result<u8> {
    let sandbox = Arc::new(MongoSandbox::new(
        cfg.mongo_host.clone(),
        cfg.restart_cmd.clone(),
    ));

    // The upstream must answer before the honeypot goes up.
    let mut up = false;
    for attempt in 1..=STARTUP_PROBE_ATTEMPTS {
        if supervisor::probe(sandbox.addr(), supervisor::PROBE_TIMEOUT).await {
            up = true;
            break;
        }
        tracing::warn!(attempt, addr = sandbox.addr(), "upstream not answering yet");
        tokio::time::sleep(STARTUP_PROBE_DELAY).await;
    }
    if !up {
        tracing::error!(addr = sandbox.addr(), "upstream failed startup probing");
        return Ok(EXIT_UPSTREAM);
    }

    log.log(
        "system",
        "startup",
        json!({"host": cfg.host, "mongo_host": cfg.mongo_host}),
    )?;

    let ctx = Arc::new(ProxyContext {
        log: log.clone(),
        verbose: cfg.verbose,
        max_message: cfg.max_message_bytes,
    });
    let listener = server::bind(&cfg.host).await?;
    tracing::info!(host = %cfg.host, mongo_host = %cfg.mongo_host, "mongotrap listening");

    let (shutdown, shutdown_rx) = watch::channel(false);
    let mut supervisor_task = tokio::spawn(supervisor::run(
        sandbox,
        log.clone(),
        Duration::from_secs_f64(cfg.check_interval_secs),
        shutdown_rx,
    ));
    let mut server_task = tokio::spawn(server::run(
        listener,
        cfg.mongo_host.clone(),
        ctx,
        shutdown.clone(),
    ));

    enum Outcome {
        Interrupted,
        Server(Result<()>),
        Supervisor(Result<()>),
    }

    let outcome = tokio::select! {
        _ = tokio::signal::ctrl_c() => Outcome::Interrupted,
        r = &mut server_task => Outcome::Server(flatten(r)),
        r = &mut supervisor_task => Outcome::Supervisor(flatten(r)),
    };
    let _ = shutdown.send(true);

    let code = match outcome {
        Outcome::Interrupted => {
            tracing::info!("interrupted");
            drain(server_task).await;
            drain(supervisor_task).await;
            EXIT_INTERRUPTED
        }
        Outcome::Server(res) => {
            drain(supervisor_task).await;
            if let Err(e) = res {
                tracing::error!(error = %e, "accept loop failed");
            }
            EXIT_INTERRUPTED
        }
        Outcome::Supervisor(res) => {
            drain(server_task).await;
            match res {
                Err(e @ Error::Sandbox(_)) => {
                    tracing::error!(error = %e, "upstream restart failed");
                    EXIT_SANDBOX
                }
                Err(e) => {
                    tracing::error!(error = %e, "supervisor failed");
                    EXIT_INTERRUPTED
                }
                // Only returns cleanly on shutdown, which nobody else sent.
                Ok(()) => EXIT_INTERRUPTED,
            }
        }
    };
    Ok(code)
}

fn flatten(joined: std::result::Result<Result<()>, tokio::task::JoinError>) -> Result<()> {
    match joined {
        Ok(r) => r,
        Err(e) => Err(Error::Msg(format!("worker panicked: {e}"))),
    }
}

/// Give a worker its one-wake window to observe shutdown, then move on.
async fn drain(handle: JoinHandle<Result<()>>) {
    let _ = tokio::time::timeout(SHUTDOWN_GRACE, handle).await;
}

#[derive(Debug, Parser, Clone)]
#[command(
    name = "mongotrap",
    version,
    about = "Interception proxy and monitor for MongoDB honeypots"
)]
struct Cli {
    /// ADDRESS:PORT to bind the monitor to
    #[arg(short = 'H', long = "host", env = "MONGOTRAP_HOST")]
    host: Option<String>,

    /// ADDRESS:PORT of the running mongodb instance
    #[arg(short = 'm', long = "mongo-host", env = "MONGOTRAP_MONGO_HOST")]
    mongo_host: Option<String>,

    /// Every how many seconds to check for mongodb being up
    #[arg(short = 't', long = "check-interval", env = "MONGOTRAP_CHECK_INTERVAL")]
    check_interval: Option<f64>,

    /// Dump decoded wire messages
    #[arg(short = 'v', long = "verbose")]
    verbose: bool,

    /// Structured event log destination
    #[arg(long = "log-file", env = "MONGOTRAP_LOG_FILE")]
    log_file: Option<String>,

    /// Rotate the event log once it exceeds this many bytes
    #[arg(
        long = "log-rotation-threshold",
        env = "MONGOTRAP_LOG_ROTATION_THRESHOLD"
    )]
    log_rotation_threshold: Option<u64>,

    /// Command run via `sh -c` to restart the sandboxed mongod
    #[arg(long = "restart-cmd", env = "MONGOTRAP_RESTART_CMD")]
    restart_cmd: Option<String>,

    /// Path to config TOML file
    #[arg(short = 'c', long = "config", env = "MONGOTRAP_CONFIG")]
    config: Option<String>,

    /// Log level or filter spec (e.g., info or info,mongotrap=debug)
    #[arg(long = "log-level", env = "MONGOTRAP_LOG_LEVEL")]
    log_level: Option<String>,
}
