use std::{fmt, io, process::Stdio, sync::Arc, time::Duration};

use tokio::process::Command;
use tracing::{info, warn};

use crate::config::FleetConfig;

/// stderr marker adb emits while the emulator's control daemon is still
/// coming up on its port. Everything else is treated as final.
const TRANSIENT_CONNECT_MARKER: &str = "error: could not connect to TCP port";

#[derive(Debug)]
pub enum AdbError {
    /// The adb binary itself is missing.
    NotFound,
    Io(String),
    /// The caller-supplied command timeout elapsed. Never retried here.
    TimedOut { command: String },
    /// The control daemon stayed unreachable through every retry.
    Unavailable { command: String },
}

impl fmt::Display for AdbError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            AdbError::NotFound => write!(f, "adb not found (check ANDROID_HOME)"),
            AdbError::Io(msg) => write!(f, "adb failed: {msg}"),
            AdbError::TimedOut { command } => write!(f, "`{command}` timed out"),
            AdbError::Unavailable { command } => {
                write!(f, "control channel unavailable for `{command}`")
            }
        }
    }
}

impl std::error::Error for AdbError {}

pub(crate) fn is_transient_connect_failure(stderr: &str) -> bool {
    stderr.contains(TRANSIENT_CONNECT_MARKER)
}

/// Issues commands to the fleet's devices over adb, absorbing the transient
/// connect failures that are normal while an emulator is booting.
#[derive(Clone)]
pub struct AdbChannel {
    cfg: Arc<FleetConfig>,
}

impl AdbChannel {
    pub fn new(cfg: Arc<FleetConfig>) -> Self {
        Self { cfg }
    }

    /// Runs `adb <args…>` and returns its stdout. Retries transient connect
    /// failures up to the configured attempt count with linearly growing
    /// delays; adb's exit status is otherwise not inspected because several
    /// of its subcommands report failure on stderr with status 0.
    pub async fn run(&self, args: &[&str], timeout: Option<Duration>) -> Result<String, AdbError> {
        let command = format!("adb {}", args.join(" "));
        for attempt in 0..self.cfg.adb_attempts {
            let output = self.invoke(args, timeout, &command).await?;
            let stderr = String::from_utf8_lossy(&output.stderr);
            if is_transient_connect_failure(&stderr) {
                warn!("failed to run `{command}`: {}", stderr.trim());
                if attempt + 1 < self.cfg.adb_attempts {
                    tokio::time::sleep(Duration::from_secs(u64::from(attempt) + 1)).await;
                    info!("retrying `{command}`");
                }
                continue;
            }
            return Ok(String::from_utf8_lossy(&output.stdout).to_string());
        }
        Err(AdbError::Unavailable { command })
    }

    /// `adb -s <serial> <args…>`.
    pub async fn run_for(
        &self,
        serial: &str,
        args: &[&str],
        timeout: Option<Duration>,
    ) -> Result<String, AdbError> {
        let mut full = Vec::with_capacity(args.len() + 2);
        full.push("-s");
        full.push(serial);
        full.extend_from_slice(args);
        self.run(&full, timeout).await
    }

    pub async fn wait_for_device(
        &self,
        serial: &str,
        timeout: Option<Duration>,
    ) -> Result<(), AdbError> {
        self.run_for(serial, &["wait-for-device"], timeout).await?;
        Ok(())
    }

    /// Console subcommands (`emu kill`, `emu avd snapshot …`).
    pub async fn emu(
        &self,
        serial: &str,
        args: &[&str],
        timeout: Option<Duration>,
    ) -> Result<String, AdbError> {
        let mut full = Vec::with_capacity(args.len() + 1);
        full.push("emu");
        full.extend_from_slice(args);
        self.run_for(serial, &full, timeout).await
    }

    pub async fn devices(&self) -> Result<String, AdbError> {
        self.run(&["devices"], Some(Duration::from_secs(30))).await
    }

    pub async fn device_online(&self, serial: &str) -> Result<bool, AdbError> {
        let listing = self.devices().await?;
        Ok(listing
            .lines()
            .any(|line| line.trim() == format!("{serial}\tdevice")))
    }

    /// Live emulator count, for the per-job progress line only.
    pub async fn running_emulators(&self) -> Result<usize, AdbError> {
        let listing = self.devices().await?;
        Ok(listing
            .lines()
            .filter(|line| line.contains("emulator-"))
            .count())
    }

    async fn invoke(
        &self,
        args: &[&str],
        timeout: Option<Duration>,
        command: &str,
    ) -> Result<std::process::Output, AdbError> {
        let mut cmd = Command::new(&self.cfg.adb_bin);
        cmd.args(args)
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .kill_on_drop(true);

        let output = match timeout {
            Some(limit) => tokio::time::timeout(limit, cmd.output())
                .await
                .map_err(|_| AdbError::TimedOut {
                    command: command.to_string(),
                })?,
            None => cmd.output().await,
        };
        output.map_err(|e| {
            if e.kind() == io::ErrorKind::NotFound {
                AdbError::NotFound
            } else {
                AdbError::Io(e.to_string())
            }
        })
    }
}
