use std::{fmt, io, process::Stdio, sync::Arc, time::Duration};

use tokio::process::{Child, Command};
use tracing::info;

use crate::{
    adb::{AdbChannel, AdbError},
    avd::{Slot, SlotManager},
    config::{FleetConfig, SNAPSHOT_NAME},
};

/// Ceiling on `wait-for-device` during a fresh boot. The worker's readiness
/// loop handles an emulator that never comes up; this merely stops a single
/// restore call from blocking forever.
const BOOT_WAIT: Duration = Duration::from_secs(60);

#[derive(Debug)]
pub enum SnapshotError {
    Adb(AdbError),
    Io(String),
    Setup { status: i32, detail: String },
}

impl fmt::Display for SnapshotError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            SnapshotError::Adb(err) => write!(f, "{err}"),
            SnapshotError::Io(msg) => write!(f, "snapshot handling failed: {msg}"),
            SnapshotError::Setup { status, detail } => {
                write!(f, "device setup script exited with {status}: {detail}")
            }
        }
    }
}

impl std::error::Error for SnapshotError {}

impl From<AdbError> for SnapshotError {
    fn from(err: AdbError) -> Self {
        SnapshotError::Adb(err)
    }
}

impl From<io::Error> for SnapshotError {
    fn from(err: io::Error) -> Self {
        SnapshotError::Io(err.to_string())
    }
}

/// Builds and restores each slot's known-clean device state. Restoring the
/// baseline before every job is what isolates one application's installs,
/// permissions and filesystem writes from the next.
#[derive(Clone)]
pub struct SnapshotManager {
    cfg: Arc<FleetConfig>,
    adb: AdbChannel,
    slots: SlotManager,
}

impl SnapshotManager {
    pub fn new(cfg: Arc<FleetConfig>, adb: AdbChannel, slots: SlotManager) -> Self {
        Self { cfg, adb, slots }
    }

    /// One-time baseline construction for a freshly created device image:
    /// a throwaway debug-init boot (the image does not settle without it),
    /// then a clean boot, instrumentation-server install, snapshot save and
    /// power-off.
    pub async fn build_baseline(&self, slot: Slot) -> Result<(), SnapshotError> {
        let serial = slot.serial(&self.cfg);
        info!("building baseline snapshot for {serial}");

        let mut child = self.slots.boot(slot, true)?;
        self.adb.wait_for_device(&serial, None).await?;
        tokio::time::sleep(Duration::from_secs(10)).await;
        self.slots.shutdown(slot, &mut child).await;

        let mut child = self.slots.boot(slot, false)?;
        self.adb.wait_for_device(&serial, None).await?;
        tokio::time::sleep(Duration::from_secs(1)).await;

        if let Some(script) = self.cfg.setup_script.clone() {
            self.run_setup_script(&script, &serial).await?;
        }

        tokio::time::sleep(Duration::from_secs(10)).await;
        self.adb
            .emu(&serial, &["avd", "snapshot", "save", SNAPSHOT_NAME], None)
            .await?;
        self.slots.shutdown(slot, &mut child).await;
        info!("baseline snapshot for {serial} saved");
        Ok(())
    }

    /// Returns a live emulator positioned at the baseline. A still-running
    /// process has its current state re-saved as the baseline and is handed
    /// back untouched; a dead or absent one is booted fresh and the saved
    /// baseline loaded into it.
    pub async fn restore_or_boot(
        &self,
        slot: Slot,
        current: Option<Child>,
    ) -> Result<Child, SnapshotError> {
        let serial = slot.serial(&self.cfg);

        if let Some(mut child) = current {
            match child.try_wait() {
                Ok(Some(_)) => {}
                Ok(None) => {
                    if let Err(err) = self
                        .adb
                        .emu(&serial, &["avd", "snapshot", "save", SNAPSHOT_NAME], None)
                        .await
                    {
                        let _ = child.start_kill();
                        return Err(err.into());
                    }
                    tokio::time::sleep(self.cfg.settle_delay).await;
                    return Ok(child);
                }
                Err(err) => {
                    let _ = child.start_kill();
                    return Err(err.into());
                }
            }
        }

        let mut child = self.slots.boot(slot, false)?;
        match self.load_baseline(&serial).await {
            Ok(()) => Ok(child),
            Err(err) => {
                // The caller never sees this handle, so the fresh boot must
                // not be left squatting on the slot's ports.
                let _ = child.start_kill();
                Err(err)
            }
        }
    }

    async fn load_baseline(&self, serial: &str) -> Result<(), SnapshotError> {
        self.adb.wait_for_device(serial, Some(BOOT_WAIT)).await?;
        tokio::time::sleep(self.cfg.settle_delay).await;
        self.adb
            .emu(serial, &["avd", "snapshot", "load", SNAPSHOT_NAME], None)
            .await?;
        tokio::time::sleep(self.cfg.settle_delay).await;
        Ok(())
    }

    async fn run_setup_script(&self, script: &std::path::Path, serial: &str) -> Result<(), SnapshotError> {
        let output = Command::new("bash")
            .arg(script)
            .arg(serial)
            .env("ANDROID_HOME", &self.cfg.android_home)
            .env("ADB", &self.cfg.adb_bin)
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .output()
            .await?;
        if output.status.success() {
            Ok(())
        } else {
            Err(SnapshotError::Setup {
                status: output.status.code().unwrap_or(-1),
                detail: String::from_utf8_lossy(&output.stderr).trim().to_string(),
            })
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::{fs, os::unix::fs::PermissionsExt, path::Path};

    fn write_tool(path: &Path, contents: &str) {
        fs::write(path, contents).unwrap();
        let mut perms = fs::metadata(path).unwrap().permissions();
        perms.set_mode(0o755);
        fs::set_permissions(path, perms).unwrap();
    }

    #[tokio::test]
    async fn failed_restore_kills_the_fresh_boot() {
        let dir = tempfile::tempdir().unwrap();
        let pid_file = dir.path().join("pid");

        // An emulator that records its pid and stays alive, and an adb whose
        // wait-for-device keeps failing with the transient connect error.
        write_tool(
            &dir.path().join("emulator"),
            &format!(
                "#!/bin/sh\necho $$ > \"{}\"\nexec sleep 300\n",
                pid_file.display()
            ),
        );
        write_tool(
            &dir.path().join("adb"),
            "#!/bin/sh\n\
             sleep 1\n\
             echo 'error: could not connect to TCP port 5555' >&2\n\
             exit 1\n",
        );

        let mut cfg = FleetConfig::with_android_home(dir.path().to_path_buf());
        cfg.emulator_bin = dir.path().join("emulator");
        cfg.adb_bin = dir.path().join("adb");
        cfg.adb_attempts = 1;
        cfg.settle_delay = Duration::from_millis(10);
        let cfg = Arc::new(cfg);

        let adb = AdbChannel::new(Arc::clone(&cfg));
        let slots = SlotManager::new(Arc::clone(&cfg), adb.clone());
        let snapshots = SnapshotManager::new(cfg, adb, slots);

        let restored = snapshots.restore_or_boot(Slot { index: 0 }, None).await;
        assert!(restored.is_err());

        let mut pid = String::new();
        for _ in 0..100 {
            if let Ok(text) = fs::read_to_string(&pid_file) {
                if !text.trim().is_empty() {
                    pid = text.trim().to_string();
                    break;
                }
            }
            tokio::time::sleep(Duration::from_millis(20)).await;
        }
        assert!(!pid.is_empty(), "emulator stub never started");

        // Dead means either reaped (no /proc entry) or still a zombie.
        let mut dead = false;
        for _ in 0..100 {
            match fs::read_to_string(format!("/proc/{pid}/stat")) {
                Err(_) => {
                    dead = true;
                    break;
                }
                Ok(stat) if stat.contains(") Z") => {
                    dead = true;
                    break;
                }
                Ok(_) => tokio::time::sleep(Duration::from_millis(20)).await,
            }
        }
        assert!(dead, "emulator process survived the failed restore");
    }
}
