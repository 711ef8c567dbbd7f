//! Opaque handle to the sacrificial MongoDB instance.
//!
//! Container lifecycle is someone else's job. The handle knows where the
//! upstream listens and how to ask the operator's runtime for a restart
//! (an arbitrary command, e.g. `docker restart mongo-honeypot`).

use tokio::process::Command;

use crate::error::{Error, Result};

pub struct MongoSandbox {
    addr: String,
    restart_cmd: Option<String>,
}

impl MongoSandbox {
    pub fn new(addr: impl Into<String>, restart_cmd: Option<String>) -> Self {
        Self {
            addr: addr.into(),
            restart_cmd,
        }
    }

    pub fn addr(&self) -> &str {
        &self.addr
    }

    /// Run the configured restart command and wait for it to finish.
    pub async fn restart(&self) -> Result<()> {
        let Some(cmd) = &self.restart_cmd else {
            return Err(Error::Sandbox(
                "upstream is down and no restart command is configured".into(),
            ));
        };
        tracing::info!(%cmd, "restarting upstream");
        let status = Command::new("sh")
            .arg("-c")
            .arg(cmd)
            .status()
            .await
            .map_err(|e| Error::Sandbox(format!("failed to run restart command: {e}")))?;
        if !status.success() {
            return Err(Error::Sandbox(format!(
                "restart command exited with {status}"
            )));
        }
        Ok(())
    }
}
