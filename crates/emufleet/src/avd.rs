use std::{collections::HashSet, fmt, io, process::Stdio, sync::Arc, time::Duration};

use tokio::process::{Child, Command};
use tracing::warn;

use crate::{adb::AdbChannel, config::FleetConfig};

/// Grace given to `adb emu kill` before the emulator process is killed
/// outright.
const SHUTDOWN_GRACE: Duration = Duration::from_secs(25);

/// One fixed worker identity. Ports, serial and AVD name all derive from the
/// index, so a slot owns the same device for the orchestrator's whole run.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct Slot {
    pub index: usize,
}

impl Slot {
    pub fn console_port(&self, cfg: &FleetConfig) -> u16 {
        // Fits u16 for any configuration accepted by FleetConfig::check_ports.
        (u32::from(cfg.base_console_port) + 2 * self.index as u32) as u16
    }

    pub fn adb_port(&self, cfg: &FleetConfig) -> u16 {
        self.console_port(cfg) + 1
    }

    pub fn serial(&self, cfg: &FleetConfig) -> String {
        format!("emulator-{}", self.console_port(cfg))
    }

    pub fn avd_name(&self, cfg: &FleetConfig) -> String {
        format!("{}{}", cfg.avd_prefix, self.index)
    }
}

#[derive(Debug)]
pub enum ProvisionError {
    Io(String),
    Tool {
        tool: String,
        status: i32,
        stderr: String,
    },
}

impl fmt::Display for ProvisionError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ProvisionError::Io(msg) => write!(f, "provisioning failed: {msg}"),
            ProvisionError::Tool {
                tool,
                status,
                stderr,
            } => {
                let stderr = stderr.trim();
                if stderr.is_empty() {
                    write!(f, "{tool} exited with {status}")
                } else {
                    write!(f, "{tool} exited with {status}: {stderr}")
                }
            }
        }
    }
}

impl std::error::Error for ProvisionError {}

impl From<io::Error> for ProvisionError {
    fn from(err: io::Error) -> Self {
        ProvisionError::Io(err.to_string())
    }
}

/// Owns the fleet's device images and the emulator subprocesses bound to each
/// slot's port pair.
#[derive(Clone)]
pub struct SlotManager {
    cfg: Arc<FleetConfig>,
    adb: AdbChannel,
}

impl SlotManager {
    pub fn new(cfg: Arc<FleetConfig>, adb: AdbChannel) -> Self {
        Self { cfg, adb }
    }

    pub fn slots(&self) -> impl Iterator<Item = Slot> {
        (0..self.cfg.slot_count).map(|index| Slot { index })
    }

    pub async fn installed_avds(&self) -> Result<HashSet<String>, ProvisionError> {
        let output = Command::new(&self.cfg.emulator_bin)
            .arg("-list-avds")
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .output()
            .await?;
        Ok(String::from_utf8_lossy(&output.stdout)
            .lines()
            .map(|line| line.trim().to_string())
            .filter(|line| !line.is_empty())
            .collect())
    }

    pub async fn create_avd(&self, slot: Slot) -> Result<(), ProvisionError> {
        let name = slot.avd_name(&self.cfg);
        let output = Command::new(&self.cfg.avdmanager_bin)
            .args(["create", "avd", "--name", &name])
            .args(["--package", &self.cfg.system_image])
            .args(["--sdcard", &self.cfg.sdcard])
            .args(["--device", &self.cfg.device_profile])
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .output()
            .await?;
        check_tool_status("avdmanager create", &output)
    }

    pub async fn delete_avd(&self, slot: Slot) -> Result<(), ProvisionError> {
        let name = slot.avd_name(&self.cfg);
        let output = Command::new(&self.cfg.avdmanager_bin)
            .args(["delete", "avd", "--name", &name])
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .output()
            .await?;
        check_tool_status("avdmanager delete", &output)
    }

    /// Removes every slot's device image that currently exists.
    pub async fn teardown_images(&self) -> Result<(), ProvisionError> {
        let installed = self.installed_avds().await?;
        for slot in self.slots() {
            if installed.contains(&slot.avd_name(&self.cfg)) {
                self.delete_avd(slot).await?;
            }
        }
        Ok(())
    }

    /// Spawns the slot's emulator. The debug variant keeps verbose logcat
    /// output attached; the plain variant discards all output, since the
    /// emulator stays up for many jobs.
    pub fn boot(&self, slot: Slot, debug: bool) -> io::Result<Child> {
        let mut cmd = Command::new(&self.cfg.emulator_bin);
        cmd.arg("-avd")
            .arg(slot.avd_name(&self.cfg))
            .arg("-no-window")
            .arg("-no-metrics");
        if debug {
            cmd.arg("-debug-init").arg("-logcat").arg("*:v");
        } else {
            cmd.stdout(Stdio::null()).stderr(Stdio::null());
        }
        cmd.arg("-ports").arg(format!(
            "{},{}",
            slot.console_port(&self.cfg),
            slot.adb_port(&self.cfg)
        ));
        cmd.spawn()
    }

    /// Polite shutdown: `adb emu kill`, wait for the process to exit, then
    /// kill it if the console command did not take.
    pub async fn shutdown(&self, slot: Slot, child: &mut Child) {
        let serial = slot.serial(&self.cfg);
        if let Err(err) = self.adb.emu(&serial, &["kill"], Some(SHUTDOWN_GRACE)).await {
            warn!("emu kill for {serial} failed: {err}");
        }
        match tokio::time::timeout(SHUTDOWN_GRACE, child.wait()).await {
            Ok(_) => {}
            Err(_) => {
                let _ = child.kill().await;
                tokio::time::sleep(Duration::from_secs(3)).await;
            }
        }
    }
}

fn check_tool_status(tool: &str, output: &std::process::Output) -> Result<(), ProvisionError> {
    if output.status.success() {
        Ok(())
    } else {
        Err(ProvisionError::Tool {
            tool: tool.to_string(),
            status: output.status.code().unwrap_or(-1),
            stderr: String::from_utf8_lossy(&output.stderr).to_string(),
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::path::PathBuf;

    fn cfg() -> FleetConfig {
        FleetConfig::with_android_home(PathBuf::from("/opt/sdk"))
    }

    #[test]
    fn ports_derive_from_slot_index() {
        let cfg = cfg();
        let slot = Slot { index: 0 };
        assert_eq!(slot.console_port(&cfg), 5554);
        assert_eq!(slot.adb_port(&cfg), 5555);
        assert_eq!(slot.serial(&cfg), "emulator-5554");

        let slot = Slot { index: 7 };
        assert_eq!(slot.console_port(&cfg), 5568);
        assert_eq!(slot.adb_port(&cfg), 5569);
    }

    #[test]
    fn avd_names_use_the_configured_prefix() {
        let cfg = cfg();
        assert_eq!(Slot { index: 3 }.avd_name(&cfg), "root34-3");
    }

    #[test]
    fn port_pairs_never_overlap_across_slots() {
        let cfg = cfg();
        let mut seen = HashSet::new();
        for index in 0..cfg.slot_count {
            let slot = Slot { index };
            assert!(seen.insert(slot.console_port(&cfg)));
            assert!(seen.insert(slot.adb_port(&cfg)));
        }
    }
}
