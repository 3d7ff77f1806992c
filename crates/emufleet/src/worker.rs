use std::{
    any::Any,
    fmt,
    fs::File,
    io::{self, Write},
    panic::AssertUnwindSafe,
    path::{Path, PathBuf},
    process::Stdio,
    sync::{
        atomic::{AtomicUsize, Ordering},
        Arc,
    },
    time::Duration,
};

use emufleet_util::poll_until;
use futures_util::FutureExt;
use tokio::process::{Child, Command};
use tracing::{info, warn};

use crate::{
    adb::{AdbChannel, AdbError},
    avd::Slot,
    config::FleetConfig,
    queue::JobQueue,
    results::{RecordState, ResultStore},
    snapshot::{SnapshotError, SnapshotManager},
};

const DEVICE_POLL_INTERVAL: Duration = Duration::from_secs(1);
/// Consecutive offline polls tolerated before the emulator process is killed
/// and restarted.
const OFFLINE_POLL_BUDGET: u32 = 10;
const WAIT_FOR_DEVICE_TIMEOUT: Duration = Duration::from_secs(30);
/// A stalled-slot warning is emitted every this many readiness attempts.
const STALLED_ATTEMPT_CADENCE: u32 = 10;

#[derive(Debug)]
pub enum WorkerError {
    Adb(AdbError),
    Snapshot(SnapshotError),
    Io(String),
    Panicked(String),
}

impl fmt::Display for WorkerError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            WorkerError::Adb(err) => write!(f, "{err}"),
            WorkerError::Snapshot(err) => write!(f, "{err}"),
            WorkerError::Io(msg) => write!(f, "{msg}"),
            WorkerError::Panicked(msg) => write!(f, "worker panicked: {msg}"),
        }
    }
}

impl std::error::Error for WorkerError {}

impl From<AdbError> for WorkerError {
    fn from(err: AdbError) -> Self {
        WorkerError::Adb(err)
    }
}

impl From<SnapshotError> for WorkerError {
    fn from(err: SnapshotError) -> Self {
        WorkerError::Snapshot(err)
    }
}

impl From<io::Error> for WorkerError {
    fn from(err: io::Error) -> Self {
        WorkerError::Io(err.to_string())
    }
}

/// Everything a worker shares with the rest of the fleet. Cheap to clone;
/// one copy per slot.
#[derive(Clone)]
pub struct WorkerContext {
    pub cfg: Arc<FleetConfig>,
    pub adb: AdbChannel,
    pub snapshots: SnapshotManager,
    pub queue: Arc<JobQueue>,
    pub store: ResultStore,
    pub analysis_script: Arc<PathBuf>,
    pub live_workers: Arc<AtomicUsize>,
}

struct InFlight {
    job: String,
    acked: bool,
}

/// The per-slot control loop: pull a job, get the device clean and
/// reachable, run the analysis under the hard timeout, record the outcome,
/// acknowledge, repeat. A supervising outer loop turns any unhandled failure
/// into a crash-log entry and a respawn instead of a dead slot.
pub struct Worker {
    slot: Slot,
    ctx: WorkerContext,
    emulator: Option<Child>,
    in_flight: Option<InFlight>,
}

impl Worker {
    pub fn new(slot: Slot, ctx: WorkerContext) -> Self {
        Self {
            slot,
            ctx,
            emulator: None,
            in_flight: None,
        }
    }

    pub async fn run(mut self) {
        self.ctx.live_workers.fetch_add(1, Ordering::SeqCst);
        loop {
            let err = match AssertUnwindSafe(self.serve()).catch_unwind().await {
                Ok(err) => err,
                Err(payload) => WorkerError::Panicked(panic_message(payload)),
            };
            self.handle_crash(err).await;
            if self.ctx.queue.is_empty().await {
                break;
            }
            info!(
                "respawning worker for {} ({})",
                self.slot.avd_name(&self.ctx.cfg),
                self.slot.serial(&self.ctx.cfg)
            );
        }
        self.ctx.live_workers.fetch_sub(1, Ordering::SeqCst);
    }

    /// Inner loop; only ever exits by reporting the error that broke it.
    async fn serve(&mut self) -> WorkerError {
        loop {
            if let Err(err) = self.iteration().await {
                return err;
            }
        }
    }

    async fn iteration(&mut self) -> Result<(), WorkerError> {
        let job = self.ctx.queue.pull().await;
        self.in_flight = Some(InFlight {
            job: job.clone(),
            acked: false,
        });

        let dir = self.ctx.store.job_dir(&job);
        match self.ctx.store.inspect(&dir) {
            RecordState::Valid => {
                // Idempotent resume: completed jobs are never re-run.
                self.ack().await;
                self.in_flight = None;
                return Ok(());
            }
            RecordState::Invalid => self.ctx.store.clear(&dir)?,
            RecordState::Missing => {}
        }

        let (mut stdout_log, stderr_log) = self.ctx.store.create(&dir)?;

        self.ensure_device_ready().await;

        let serial = self.slot.serial(&self.ctx.cfg);
        writeln!(stdout_log, "START ANALYSIS: {job}, {serial}")?;
        if let Ok(devices) = self.ctx.adb.devices().await {
            stdout_log.write_all(devices.as_bytes())?;
        }

        self.run_analysis(&job, &dir, &stdout_log, &stderr_log)
            .await?;

        self.ctx
            .store
            .write_slot_marker(&dir, &self.slot.avd_name(&self.ctx.cfg), &serial)?;
        self.ack().await;
        self.in_flight = None;
        self.progress_line().await;
        Ok(())
    }

    /// Restores the slot's device to the baseline and waits until adb
    /// reports it online. Never gives up: a device that stays unreachable is
    /// forcibly restarted and retried, with a warning every
    /// `STALLED_ATTEMPT_CADENCE` attempts so a stuck slot is visible without
    /// flooding the log.
    async fn ensure_device_ready(&mut self) {
        let serial = self.slot.serial(&self.ctx.cfg);
        let avd = self.slot.avd_name(&self.ctx.cfg);
        let mut attempt: u32 = 0;
        loop {
            attempt += 1;
            if attempt > 1 && (attempt - 1) % STALLED_ATTEMPT_CADENCE == 0 {
                warn!(
                    "tried to start {serial} (avd {avd}) {} times without success",
                    attempt - 1
                );
            }

            match self
                .ctx
                .snapshots
                .restore_or_boot(self.slot, self.emulator.take())
                .await
            {
                Ok(child) => self.emulator = Some(child),
                Err(err) => {
                    // Handle is gone either way; the next round boots fresh.
                    warn!("restore of {serial} failed: {err}");
                    tokio::time::sleep(DEVICE_POLL_INTERVAL).await;
                    continue;
                }
            }

            if let Err(err) = self
                .ctx
                .adb
                .wait_for_device(&serial, Some(WAIT_FOR_DEVICE_TIMEOUT))
                .await
            {
                warn!("wait-for-device {serial}: {err}");
            }

            let adb = self.ctx.adb.clone();
            let poll_serial = serial.clone();
            let online = poll_until(DEVICE_POLL_INTERVAL, OFFLINE_POLL_BUDGET, move || {
                let adb = adb.clone();
                let serial = poll_serial.clone();
                async move { adb.device_online(&serial).await.unwrap_or(false) }
            })
            .await;
            if online {
                return;
            }

            warn!("{serial} has been offline for {OFFLINE_POLL_BUDGET}s, restarting it now");
            if let Some(mut child) = self.emulator.take() {
                let _ = child.start_kill();
            }
        }
    }

    /// Runs the external analysis script under the hard wall-clock timeout.
    /// A timeout is a job outcome, not a worker failure: the subprocess is
    /// killed, the marker written, and the slot moves on.
    async fn run_analysis(
        &mut self,
        job: &str,
        dir: &Path,
        stdout_log: &File,
        stderr_log: &File,
    ) -> Result<(), WorkerError> {
        let serial = self.slot.serial(&self.ctx.cfg);
        let mut child = Command::new("bash")
            .arg(self.ctx.analysis_script.as_ref())
            .arg(job)
            .arg(&serial)
            .arg(dir)
            .env("ANDROID_HOME", &self.ctx.cfg.android_home)
            .stdout(Stdio::from(stdout_log.try_clone()?))
            .stderr(Stdio::from(stderr_log.try_clone()?))
            .spawn()?;

        match tokio::time::timeout(self.ctx.cfg.job_timeout, child.wait()).await {
            // Analysis failures are reported through data.json, not the
            // script's exit status.
            Ok(status) => {
                let _ = status?;
            }
            Err(_) => {
                let _ = child.kill().await;
                self.ctx.store.write_timeout_marker(dir)?;
                warn!("TIMEOUT ANALYSIS: {job}, {serial}");
            }
        }
        Ok(())
    }

    /// Acknowledges the in-flight job unless it already was; crash and
    /// success paths both funnel through here so no job is ever acked twice
    /// or dropped.
    async fn ack(&mut self) {
        if let Some(in_flight) = self.in_flight.as_mut() {
            if !in_flight.acked {
                self.ctx.queue.ack().await;
                in_flight.acked = true;
            }
        }
    }

    async fn handle_crash(&mut self, err: WorkerError) {
        let avd = self.slot.avd_name(&self.ctx.cfg);
        let serial = self.slot.serial(&self.ctx.cfg);
        let job = self
            .in_flight
            .as_ref()
            .map(|in_flight| in_flight.job.clone())
            .unwrap_or_else(|| "<no job>".into());
        warn!("worker for {avd} ({serial}) terminated after: {err}");
        if let Err(log_err) = self
            .ctx
            .store
            .append_crash_log(&avd, &job, &format!("{err:?}"))
        {
            warn!("failed to write crash log for {avd}: {log_err}");
        }
        self.ack().await;
        self.in_flight = None;
        if let Some(mut child) = self.emulator.take() {
            let _ = child.start_kill();
        }
    }

    async fn progress_line(&self) {
        let workers = self.ctx.live_workers.load(Ordering::SeqCst);
        let emulators = self.ctx.adb.running_emulators().await.unwrap_or(0);
        info!(
            "[{}({})] end of job, {workers} workers live, {emulators} emulators running",
            self.slot.avd_name(&self.ctx.cfg),
            self.slot.serial(&self.ctx.cfg)
        );
    }
}

fn panic_message(payload: Box<dyn Any + Send>) -> String {
    if let Some(msg) = payload.downcast_ref::<&str>() {
        (*msg).to_string()
    } else if let Some(msg) = payload.downcast_ref::<String>() {
        msg.clone()
    } else {
        "panic".to_string()
    }
}
