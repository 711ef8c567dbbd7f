use serde::Deserialize;
use std::fs;

use crate::error::{Error, Result};
use crate::logger::DEFAULT_ROTATION_THRESHOLD;
use crate::proxy::DEFAULT_MAX_MESSAGE;

pub const DEFAULT_HOST_PORT: u16 = 27017;
pub const DEFAULT_MONGO_PORT: u16 = 27016;
pub const DEFAULT_ADDRESS: &str = "localhost";

#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct Config {
    /// ADDRESS:PORT the monitor binds.
    pub host: String,
    /// ADDRESS:PORT of the sacrificial mongod.
    pub mongo_host: String,
    /// Seconds between upstream liveness checks.
    pub check_interval_secs: f64,
    /// Dump every decoded wire message at debug level.
    pub verbose: bool,
    /// Structured event log destination.
    pub log_file: String,
    /// Rotate the event log once it exceeds this many bytes.
    pub log_rotation_threshold: u64,
    /// Ceiling on a single wire message.
    pub max_message_bytes: usize,
    /// Command run via `sh -c` to restart the sandboxed mongod.
    pub restart_cmd: Option<String>,
    pub log_level: Option<String>,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            host: format!("{DEFAULT_ADDRESS}:{DEFAULT_HOST_PORT}"),
            mongo_host: format!("{DEFAULT_ADDRESS}:{DEFAULT_MONGO_PORT}"),
            check_interval_secs: 5.0,
            verbose: false,
            log_file: "mongotrap.log".to_string(),
            log_rotation_threshold: DEFAULT_ROTATION_THRESHOLD,
            max_message_bytes: DEFAULT_MAX_MESSAGE,
            restart_cmd: None,
            log_level: None,
        }
    }
}

impl Config {
    /// Load configuration from a TOML file. If `path_opt` is None or the file
    /// is missing/unreadable, returns defaults. Parsing errors are returned.
    pub fn load_from_file(path_opt: Option<&str>) -> Result<Self> {
        let path = path_opt.unwrap_or("mongotrap.toml");
        match fs::read_to_string(path) {
            Ok(contents) => match toml::from_str::<Config>(&contents) {
                Ok(cfg) => Ok(cfg),
                Err(e) => Err(Error::Msg(format!("Failed to parse {path}: {e}"))),
            },
            Err(_e) => Ok(Self::default()),
        }
    }

    /// Apply CLI/env overrides (highest precedence) to an existing config.
    #[allow(clippy::too_many_arguments)]
    pub fn with_overrides(
        mut self,
        host: Option<String>,
        mongo_host: Option<String>,
        check_interval: Option<f64>,
        verbose: bool,
        log_file: Option<String>,
        log_rotation_threshold: Option<u64>,
        restart_cmd: Option<String>,
        log_level: Option<String>,
    ) -> Self {
        if let Some(v) = host {
            self.host = v;
        }
        if let Some(v) = mongo_host {
            self.mongo_host = v;
        }
        if let Some(v) = check_interval {
            self.check_interval_secs = v;
        }
        if verbose {
            self.verbose = true;
        }
        if let Some(v) = log_file {
            self.log_file = v;
        }
        if let Some(v) = log_rotation_threshold {
            self.log_rotation_threshold = v;
        }
        if let Some(v) = restart_cmd {
            self.restart_cmd = Some(v);
        }
        if let Some(v) = log_level {
            self.log_level = Some(v);
        }
        self
    }

    /// Fill in partial endpoints and sanity-check the numbers.
    pub fn normalized(mut self) -> Result<Self> {
        self.host = parse_endpoint(&self.host, DEFAULT_ADDRESS, DEFAULT_HOST_PORT)?;
        self.mongo_host = parse_endpoint(&self.mongo_host, DEFAULT_ADDRESS, DEFAULT_MONGO_PORT)?;
        if !self.check_interval_secs.is_finite() || self.check_interval_secs <= 0.0 {
            return Err(Error::Msg(format!(
                "check interval must be positive, got {}",
                self.check_interval_secs
            )));
        }
        if self.log_file.is_empty() {
            return Err(Error::Msg("log_file cannot be empty".to_string()));
        }
        Ok(self)
    }
}

/// Complete an `ADDRESS:PORT` endpoint: a missing address falls back to
/// `default_address`, a missing port to `default_port`. `":27018"` and
/// `"10.0.0.1"` are both valid inputs.
pub fn parse_endpoint(s: &str, default_address: &str, default_port: u16) -> Result<String> {
    let (address, port) = match s.split_once(':') {
        Some((a, p)) => {
            let port = if p.is_empty() {
                default_port
            } else {
                p.parse::<u16>()
                    .map_err(|_| Error::Msg(format!("invalid port in '{s}'")))?
            };
            (if a.is_empty() { default_address } else { a }, port)
        }
        None => (
            if s.is_empty() { default_address } else { s },
            default_port,
        ),
    };
    Ok(format!("{address}:{port}"))
}
