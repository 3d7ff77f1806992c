use std::{
    fs, io,
    path::{Path, PathBuf},
    time::Duration,
};

use serde::Serialize;

pub fn env_trimmed(key: &str) -> Option<String> {
    let value = std::env::var(key).ok()?;
    let trimmed = value.trim();
    if trimmed.is_empty() {
        None
    } else {
        Some(trimmed.to_string())
    }
}

pub fn expand_user(path: &str) -> PathBuf {
    if path == "~" || path.starts_with("~/") {
        if let Ok(home) = std::env::var("HOME") {
            let rest = path.strip_prefix("~/").unwrap_or("");
            return PathBuf::from(home).join(rest);
        }
    }
    PathBuf::from(path)
}

pub fn write_json_atomic<T: Serialize>(path: &Path, value: &T) -> io::Result<()> {
    if let Some(parent) = path.parent() {
        fs::create_dir_all(parent)?;
    }
    let tmp = path.with_extension("json.tmp");
    let data = serde_json::to_vec_pretty(value).map_err(io::Error::other)?;
    fs::write(&tmp, data)?;
    fs::rename(&tmp, path)?;
    Ok(())
}

pub fn now_millis() -> i64 {
    std::time::SystemTime::now()
        .duration_since(std::time::UNIX_EPOCH)
        .unwrap_or_default()
        .as_millis() as i64
}

pub fn init_tracing() -> Result<(), Box<dyn std::error::Error>> {
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::from_default_env().add_directive("info".parse()?),
        )
        .init();
    Ok(())
}

/// Polls `predicate` up to `max_polls` times, sleeping `interval` between
/// polls. Returns true as soon as the predicate holds, false once the poll
/// budget is spent. Callers decide how to escalate a false result.
pub async fn poll_until<P, Fut>(interval: Duration, max_polls: u32, mut predicate: P) -> bool
where
    P: FnMut() -> Fut,
    Fut: std::future::Future<Output = bool>,
{
    for poll in 0..max_polls {
        if predicate().await {
            return true;
        }
        if poll + 1 < max_polls {
            tokio::time::sleep(interval).await;
        }
    }
    false
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicU32, Ordering};

    #[test]
    fn expand_user_replaces_home_prefix() {
        std::env::set_var("HOME", "/home/tester");
        assert_eq!(
            expand_user("~/Android/Sdk"),
            PathBuf::from("/home/tester/Android/Sdk")
        );
        assert_eq!(expand_user("/opt/sdk"), PathBuf::from("/opt/sdk"));
    }

    #[test]
    fn write_json_atomic_creates_parent_dirs() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("nested").join("state.json");
        write_json_atomic(&path, &serde_json::json!({"ok": true})).unwrap();
        let data: serde_json::Value =
            serde_json::from_str(&fs::read_to_string(&path).unwrap()).unwrap();
        assert_eq!(data["ok"], true);
    }

    #[tokio::test(start_paused = true)]
    async fn poll_until_stops_at_first_success() {
        let calls = AtomicU32::new(0);
        let ready = poll_until(Duration::from_secs(1), 10, || {
            let n = calls.fetch_add(1, Ordering::SeqCst);
            async move { n == 2 }
        })
        .await;
        assert!(ready);
        assert_eq!(calls.load(Ordering::SeqCst), 3);
    }

    #[tokio::test(start_paused = true)]
    async fn poll_until_gives_up_after_budget() {
        let calls = AtomicU32::new(0);
        let ready = poll_until(Duration::from_secs(1), 5, || {
            calls.fetch_add(1, Ordering::SeqCst);
            async { false }
        })
        .await;
        assert!(!ready);
        assert_eq!(calls.load(Ordering::SeqCst), 5);
    }
}
