use std::{
    fs::{self, File, OpenOptions},
    io::{self, Write},
    path::{Path, PathBuf},
};

use emufleet_util::{now_millis, write_json_atomic};
use serde::Serialize;

pub const DATA_FILE: &str = "data.json";
pub const TIMEOUT_MARKER: &str = "TIMEOUT";
pub const STDOUT_LOG: &str = "analysis.out";
pub const STDERR_LOG: &str = "analysis.err";
pub const SLOT_MARKER: &str = "emu";

/// What a previously produced record is worth on resumption.
#[derive(Debug, PartialEq, Eq)]
pub enum RecordState {
    /// No directory; the job has never run here.
    Missing,
    /// A complete success record; the job must not be re-run.
    Valid,
    /// Partial, errored or timed-out; delete it and redo the job.
    Invalid,
}

#[derive(Serialize)]
struct SlotMarker<'a> {
    avd: &'a str,
    serial: &'a str,
}

/// One directory per job under a persistent root, doubling as the batch's
/// resumption ledger. The queue's at-most-one-consumer guarantee means no
/// two slots ever touch the same record, so plain filesystem operations are
/// enough.
#[derive(Clone)]
pub struct ResultStore {
    root: PathBuf,
}

impl ResultStore {
    pub fn new(root: &Path) -> io::Result<Self> {
        fs::create_dir_all(root)?;
        Ok(Self {
            root: root.to_path_buf(),
        })
    }

    pub fn root(&self) -> &Path {
        &self.root
    }

    /// Record directory for an application path, keyed by its filename with
    /// the `.apk` suffix dropped.
    pub fn job_dir(&self, apk: &str) -> PathBuf {
        let file_name = Path::new(apk)
            .file_name()
            .map(|name| name.to_string_lossy().into_owned())
            .unwrap_or_else(|| apk.to_string());
        let key = file_name.strip_suffix(".apk").unwrap_or(&file_name);
        self.root.join(key)
    }

    pub fn inspect(&self, dir: &Path) -> RecordState {
        if !dir.exists() {
            return RecordState::Missing;
        }
        if dir.join(TIMEOUT_MARKER).exists() {
            return RecordState::Invalid;
        }
        let data = match fs::read_to_string(dir.join(DATA_FILE)) {
            Ok(data) => data,
            Err(_) => return RecordState::Invalid,
        };
        match serde_json::from_str::<serde_json::Value>(&data) {
            Ok(value) if value.get("error").is_none() => RecordState::Valid,
            _ => RecordState::Invalid,
        }
    }

    /// Removes an invalid record. The directory is renamed aside before
    /// deletion so an external aggregator scanning the root never sees a
    /// half-deleted record under the job's name.
    pub fn clear(&self, dir: &Path) -> io::Result<()> {
        let name = dir
            .file_name()
            .map(|name| name.to_string_lossy().into_owned())
            .unwrap_or_default();
        let doomed = self.root.join(format!("{name}.deleting"));
        // Leftover from an interrupted clear.
        let _ = fs::remove_dir_all(&doomed);
        fs::rename(dir, &doomed)?;
        fs::remove_dir_all(&doomed)
    }

    /// Creates a fresh record directory and opens its log files, which stay
    /// open for the whole job.
    pub fn create(&self, dir: &Path) -> io::Result<(File, File)> {
        fs::create_dir_all(dir)?;
        let stdout = File::create(dir.join(STDOUT_LOG))?;
        let stderr = File::create(dir.join(STDERR_LOG))?;
        Ok((stdout, stderr))
    }

    pub fn write_timeout_marker(&self, dir: &Path) -> io::Result<()> {
        fs::write(dir.join(TIMEOUT_MARKER), "Process timed out\n")
    }

    /// Diagnostic note of which slot served the job.
    pub fn write_slot_marker(&self, dir: &Path, avd: &str, serial: &str) -> io::Result<()> {
        write_json_atomic(&dir.join(SLOT_MARKER), &SlotMarker { avd, serial })
    }

    /// Appends one crash entry to the slot's log under the root, so repeated
    /// respawns of a flaky slot stay visible across the whole run.
    pub fn append_crash_log(&self, avd: &str, job: &str, detail: &str) -> io::Result<()> {
        let path = self.root.join(format!("worker_{avd}"));
        let mut file = OpenOptions::new().create(true).append(true).open(path)?;
        writeln!(file, "[{}] worker for {avd} crashed on {job}: {detail}", now_millis())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn store() -> (tempfile::TempDir, ResultStore) {
        let dir = tempfile::tempdir().unwrap();
        let store = ResultStore::new(dir.path()).unwrap();
        (dir, store)
    }

    #[test]
    fn job_dir_strips_path_and_apk_suffix() {
        let (_tmp, store) = store();
        assert_eq!(
            store.job_dir("/data/apks/com.example.app.apk"),
            store.root().join("com.example.app")
        );
        assert_eq!(
            store.job_dir("plain-name"),
            store.root().join("plain-name")
        );
    }

    #[test]
    fn missing_record_is_missing() {
        let (_tmp, store) = store();
        let dir = store.job_dir("a.apk");
        assert_eq!(store.inspect(&dir), RecordState::Missing);
    }

    #[test]
    fn success_record_is_valid() {
        let (_tmp, store) = store();
        let dir = store.job_dir("a.apk");
        fs::create_dir_all(&dir).unwrap();
        fs::write(dir.join(DATA_FILE), r#"{"ok": true}"#).unwrap();
        assert_eq!(store.inspect(&dir), RecordState::Valid);
    }

    #[test]
    fn error_key_invalidates_a_record() {
        let (_tmp, store) = store();
        let dir = store.job_dir("a.apk");
        fs::create_dir_all(&dir).unwrap();
        fs::write(dir.join(DATA_FILE), r#"{"error": "boom"}"#).unwrap();
        assert_eq!(store.inspect(&dir), RecordState::Invalid);
    }

    #[test]
    fn timeout_marker_invalidates_even_a_good_data_file() {
        let (_tmp, store) = store();
        let dir = store.job_dir("a.apk");
        fs::create_dir_all(&dir).unwrap();
        fs::write(dir.join(DATA_FILE), r#"{"ok": true}"#).unwrap();
        fs::write(dir.join(TIMEOUT_MARKER), "").unwrap();
        assert_eq!(store.inspect(&dir), RecordState::Invalid);
    }

    #[test]
    fn malformed_or_absent_data_is_invalid() {
        let (_tmp, store) = store();
        let dir = store.job_dir("a.apk");
        fs::create_dir_all(&dir).unwrap();
        assert_eq!(store.inspect(&dir), RecordState::Invalid);
        fs::write(dir.join(DATA_FILE), "{not json").unwrap();
        assert_eq!(store.inspect(&dir), RecordState::Invalid);
    }

    #[test]
    fn clear_removes_the_record_entirely() {
        let (_tmp, store) = store();
        let dir = store.job_dir("a.apk");
        fs::create_dir_all(&dir).unwrap();
        fs::write(dir.join(DATA_FILE), r#"{"error": "x"}"#).unwrap();
        store.clear(&dir).unwrap();
        assert!(!dir.exists());
        assert_eq!(store.inspect(&dir), RecordState::Missing);
    }

    #[test]
    fn create_opens_both_log_files() {
        let (_tmp, store) = store();
        let dir = store.job_dir("a.apk");
        store.create(&dir).unwrap();
        assert!(dir.join(STDOUT_LOG).exists());
        assert!(dir.join(STDERR_LOG).exists());
    }

    #[test]
    fn crash_log_appends_across_respawns() {
        let (_tmp, store) = store();
        store.append_crash_log("root34-2", "a.apk", "first").unwrap();
        store.append_crash_log("root34-2", "b.apk", "second").unwrap();
        let log = fs::read_to_string(store.root().join("worker_root34-2")).unwrap();
        assert_eq!(log.lines().count(), 2);
        assert!(log.contains("a.apk"));
        assert!(log.contains("second"));
    }

    #[test]
    fn slot_marker_records_the_serving_device() {
        let (_tmp, store) = store();
        let dir = store.job_dir("a.apk");
        fs::create_dir_all(&dir).unwrap();
        store
            .write_slot_marker(&dir, "root34-0", "emulator-5554")
            .unwrap();
        let marker: serde_json::Value =
            serde_json::from_str(&fs::read_to_string(dir.join(SLOT_MARKER)).unwrap()).unwrap();
        assert_eq!(marker["serial"], "emulator-5554");
    }
}
