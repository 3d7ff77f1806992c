use std::{
    fmt, io,
    path::Path,
    sync::{atomic::AtomicUsize, Arc},
};

use tokio::task::JoinSet;
use tracing::info;

use crate::{
    adb::AdbChannel,
    avd::{ProvisionError, SlotManager},
    config::FleetConfig,
    queue::JobQueue,
    results::ResultStore,
    snapshot::{SnapshotError, SnapshotManager},
    worker::{Worker, WorkerContext},
};

#[derive(Debug)]
pub enum FleetError {
    Config(String),
    Provision(ProvisionError),
    Snapshot(SnapshotError),
    Io(String),
}

impl fmt::Display for FleetError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            FleetError::Config(msg) => write!(f, "invalid fleet configuration: {msg}"),
            FleetError::Provision(err) => write!(f, "{err}"),
            FleetError::Snapshot(err) => write!(f, "{err}"),
            FleetError::Io(msg) => write!(f, "{msg}"),
        }
    }
}

impl std::error::Error for FleetError {}

impl From<ProvisionError> for FleetError {
    fn from(err: ProvisionError) -> Self {
        FleetError::Provision(err)
    }
}

impl From<SnapshotError> for FleetError {
    fn from(err: SnapshotError) -> Self {
        FleetError::Snapshot(err)
    }
}

impl From<io::Error> for FleetError {
    fn from(err: io::Error) -> Self {
        FleetError::Io(err.to_string())
    }
}

/// Provisions the device fleet, seeds the job queue and drives one worker
/// per slot until the whole batch has been acknowledged. Per-job outcomes
/// are not reported back; they live in the result store.
pub struct Fleet {
    cfg: Arc<FleetConfig>,
}

impl Fleet {
    pub fn new(cfg: FleetConfig) -> Self {
        Self { cfg: Arc::new(cfg) }
    }

    pub async fn run(
        &self,
        jobs: Vec<String>,
        result_root: &Path,
        analysis_script: &Path,
    ) -> Result<(), FleetError> {
        self.cfg.check_ports().map_err(FleetError::Config)?;

        let adb = AdbChannel::new(Arc::clone(&self.cfg));
        let slots = SlotManager::new(Arc::clone(&self.cfg), adb.clone());
        let snapshots = SnapshotManager::new(Arc::clone(&self.cfg), adb.clone(), slots.clone());

        self.ensure_images_exist(&slots, &snapshots).await?;

        let store = ResultStore::new(result_root)?;
        let queue = Arc::new(JobQueue::new());
        let job_count = jobs.len();
        for job in jobs {
            queue.push(job).await;
        }
        info!(
            "dispatching {job_count} jobs across {} slots",
            self.cfg.slot_count
        );

        let ctx = WorkerContext {
            cfg: Arc::clone(&self.cfg),
            adb,
            snapshots,
            queue: Arc::clone(&queue),
            store,
            analysis_script: Arc::new(analysis_script.to_path_buf()),
            live_workers: Arc::new(AtomicUsize::new(0)),
        };

        let mut workers = JoinSet::new();
        for slot in slots.slots() {
            workers.spawn(Worker::new(slot, ctx.clone()).run());
        }

        queue.join().await;
        info!("batch drained, all jobs acknowledged");
        // Workers are idle in pull() by now. Their emulator processes are
        // left running; cleanup is external, same as after an operator
        // interrupt.
        workers.abort_all();
        Ok(())
    }

    async fn ensure_images_exist(
        &self,
        slots: &SlotManager,
        snapshots: &SnapshotManager,
    ) -> Result<(), FleetError> {
        let installed = slots.installed_avds().await?;
        for slot in slots.slots() {
            let name = slot.avd_name(&self.cfg);
            if !installed.contains(&name) {
                info!("creating device image {name}");
                slots.create_avd(slot).await?;
                snapshots.build_baseline(slot).await?;
            }
        }
        Ok(())
    }

    pub async fn teardown_images(&self) -> Result<(), FleetError> {
        let adb = AdbChannel::new(Arc::clone(&self.cfg));
        let slots = SlotManager::new(Arc::clone(&self.cfg), adb);
        slots.teardown_images().await?;
        Ok(())
    }
}
