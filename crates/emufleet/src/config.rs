use std::{path::PathBuf, time::Duration};

use emufleet_util::{env_trimmed, expand_user};

/// The one reserved snapshot identifier each device image is reset to.
pub const SNAPSHOT_NAME: &str = "baseline";

/// Explicit fleet configuration, threaded into every component instead of
/// process-wide constants.
#[derive(Clone, Debug)]
pub struct FleetConfig {
    /// Number of worker slots, each owning one emulator for the whole batch.
    pub slot_count: usize,
    /// Slot i owns ports (base + 2i, base + 2i + 1) = (console, adb).
    pub base_console_port: u16,
    /// AVD names are `<prefix><slot index>`.
    pub avd_prefix: String,
    /// sdkmanager package id of the system image used for every slot.
    pub system_image: String,
    pub sdcard: String,
    pub device_profile: String,
    /// Hard wall-clock limit for one analysis invocation.
    pub job_timeout: Duration,
    /// Total attempts for a transiently failing adb invocation.
    pub adb_attempts: u32,
    /// Pause after snapshot save/load and boot, giving the device time to
    /// settle before it is used.
    pub settle_delay: Duration,
    pub android_home: PathBuf,
    pub emulator_bin: PathBuf,
    pub avdmanager_bin: PathBuf,
    pub adb_bin: PathBuf,
    /// Optional instrumentation-server installer, run once per slot while
    /// the baseline snapshot is being prepared. Invoked as
    /// `bash <script> <serial>` with ANDROID_HOME and ADB exported.
    pub setup_script: Option<PathBuf>,
}

impl FleetConfig {
    pub fn from_env() -> Self {
        let android_home = env_trimmed("ANDROID_HOME")
            .map(PathBuf::from)
            .unwrap_or_else(|| expand_user("~/Android/Sdk"));
        Self::with_android_home(android_home)
    }

    /// Checks that every slot's (console, adb) port pair fits the TCP port
    /// space, so slot port derivation can never wrap.
    pub fn check_ports(&self) -> Result<(), String> {
        let last_slot = self.slot_count.saturating_sub(1) as u64;
        let highest = u64::from(self.base_console_port) + 2 * last_slot + 1;
        if highest > u64::from(u16::MAX) {
            Err(format!(
                "slot {last_slot} would use port {highest}, past the TCP port range"
            ))
        } else {
            Ok(())
        }
    }

    pub fn with_android_home(android_home: PathBuf) -> Self {
        let emulator_bin = android_home.join("emulator").join("emulator");
        let avdmanager_bin = android_home
            .join("cmdline-tools")
            .join("latest")
            .join("bin")
            .join("avdmanager");
        let adb_bin = android_home.join("platform-tools").join("adb");
        Self {
            slot_count: 20,
            base_console_port: 5554,
            avd_prefix: "root34-".into(),
            system_image: "system-images;android-34;default;x86_64".into(),
            sdcard: "512M".into(),
            device_profile: "medium_phone".into(),
            job_timeout: Duration::from_secs(400),
            adb_attempts: 3,
            settle_delay: Duration::from_secs(3),
            android_home,
            emulator_bin,
            avdmanager_bin,
            adb_bin,
            setup_script: None,
        }
    }
}
