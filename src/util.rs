//! Shared utility functions for the foreman crate.
//!
//! Everything here is deliberately small: atomic JSON persistence
//! (write-to-temp + rename), advisory file locking with bounded retry,
//! epoch/timestamp helpers, and process liveness probes.

use anyhow::{Context, Result};
use fs2::FileExt;
use serde::Serialize;
use serde::de::DeserializeOwned;
use std::fs::{self, File, OpenOptions};
use std::io::Write;
use std::path::{Path, PathBuf};
use std::time::Duration;

/// Write a value as pretty JSON atomically: temp file in the same directory,
/// fsync, then rename over the target.
pub fn write_json_atomic<T: Serialize>(path: &Path, value: &T) -> Result<()> {
    let content = serde_json::to_string_pretty(value).context("Failed to serialize JSON")?;
    write_atomic(path, content.as_bytes())
}

/// Write raw bytes atomically via a sibling temp file.
pub fn write_atomic(path: &Path, bytes: &[u8]) -> Result<()> {
    let parent = path
        .parent()
        .with_context(|| format!("Path has no parent: {}", path.display()))?;
    fs::create_dir_all(parent)
        .with_context(|| format!("Failed to create {}", parent.display()))?;

    let tmp = parent.join(format!(
        ".{}.tmp-{}",
        path.file_name()
            .map(|n| n.to_string_lossy().into_owned())
            .unwrap_or_else(|| "file".into()),
        std::process::id()
    ));

    {
        let mut f = File::create(&tmp)
            .with_context(|| format!("Failed to create temp file {}", tmp.display()))?;
        f.write_all(bytes)?;
        f.sync_all()
            .with_context(|| format!("Failed to fsync {}", tmp.display()))?;
    }

    fs::rename(&tmp, path)
        .with_context(|| format!("Failed to rename {} -> {}", tmp.display(), path.display()))?;
    Ok(())
}

/// Read and deserialize a JSON file.
pub fn read_json<T: DeserializeOwned>(path: &Path) -> Result<T> {
    let content = fs::read_to_string(path)
        .with_context(|| format!("Failed to read {}", path.display()))?;
    serde_json::from_str(&content)
        .with_context(|| format!("Failed to parse JSON in {}", path.display()))
}

/// Append one line to a file, creating it if absent. The write is flushed
/// before returning so a crash after this call cannot lose the line.
pub fn append_line(path: &Path, line: &str) -> Result<()> {
    if let Some(parent) = path.parent() {
        fs::create_dir_all(parent)?;
    }
    let mut f = OpenOptions::new()
        .create(true)
        .append(true)
        .open(path)
        .with_context(|| format!("Failed to open {} for append", path.display()))?;
    writeln!(f, "{}", line)?;
    f.sync_data()?;
    Ok(())
}

/// Default number of lock acquisition attempts before giving up.
pub const LOCK_MAX_ATTEMPTS: u32 = 50;
/// Initial sleep between lock attempts; doubles up to [`LOCK_BACKOFF_CAP`].
pub const LOCK_BACKOFF_INITIAL: Duration = Duration::from_millis(20);
pub const LOCK_BACKOFF_CAP: Duration = Duration::from_millis(500);

/// Run `body` while holding an exclusive advisory lock on `<path>.lock`.
///
/// Acquisition retries with exponential backoff and is bounded; the error
/// is surfaced to the caller rather than blocking forever. The lock file
/// itself is left in place (lock files are cheap and racing on unlink is not).
pub fn with_file_lock<T>(path: &Path, body: impl FnOnce() -> Result<T>) -> Result<T> {
    let lock_path = lock_path_for(path);
    if let Some(parent) = lock_path.parent() {
        fs::create_dir_all(parent)?;
    }
    let lock_file = OpenOptions::new()
        .create(true)
        .write(true)
        .truncate(false)
        .open(&lock_path)
        .with_context(|| format!("Failed to open lock file {}", lock_path.display()))?;

    let mut backoff = LOCK_BACKOFF_INITIAL;
    let mut acquired = false;
    for _ in 0..LOCK_MAX_ATTEMPTS {
        match lock_file.try_lock_exclusive() {
            Ok(()) => {
                acquired = true;
                break;
            }
            Err(_) => {
                std::thread::sleep(backoff);
                backoff = (backoff * 2).min(LOCK_BACKOFF_CAP);
            }
        }
    }
    if !acquired {
        anyhow::bail!(
            "Timed out acquiring lock on {} after {} attempts",
            lock_path.display(),
            LOCK_MAX_ATTEMPTS
        );
    }

    let result = body();
    let _ = fs2::FileExt::unlock(&lock_file);
    result
}

fn lock_path_for(path: &Path) -> PathBuf {
    let mut name = path
        .file_name()
        .map(|n| n.to_string_lossy().into_owned())
        .unwrap_or_else(|| "file".into());
    name.push_str(".lock");
    path.with_file_name(name)
}

/// Seconds since the Unix epoch.
pub fn epoch_secs() -> u64 {
    std::time::SystemTime::now()
        .duration_since(std::time::UNIX_EPOCH)
        .unwrap_or_default()
        .as_secs()
}

/// Current time as an ISO-8601 / RFC 3339 string (UTC, second precision).
pub fn now_iso() -> String {
    chrono::Utc::now().to_rfc3339_opts(chrono::SecondsFormat::Secs, true)
}

/// Turn an arbitrary brief into a branch-safe slug: lowercase alphanumerics
/// joined by single dashes, capped at 40 chars.
pub fn slugify(text: &str) -> String {
    let mut slug = String::new();
    let mut last_dash = true;
    for ch in text.chars() {
        if ch.is_ascii_alphanumeric() {
            slug.push(ch.to_ascii_lowercase());
            last_dash = false;
        } else if !last_dash {
            slug.push('-');
            last_dash = true;
        }
        if slug.len() >= 40 {
            break;
        }
    }
    slug.trim_matches('-').to_string()
}

/// Probe whether a process is alive without signalling it.
pub fn pid_alive(pid: u32) -> bool {
    if pid == 0 {
        return false;
    }
    // Signal 0 performs error checking only.
    unsafe { libc::kill(pid as libc::pid_t, 0) == 0 }
}

/// Send SIGTERM to a process.
pub fn terminate_pid(pid: u32) {
    if pid != 0 {
        unsafe {
            libc::kill(pid as libc::pid_t, libc::SIGTERM);
        }
    }
}

/// Send SIGKILL to a process.
pub fn kill_pid(pid: u32) {
    if pid != 0 {
        unsafe {
            libc::kill(pid as libc::pid_t, libc::SIGKILL);
        }
    }
}

/// Extract a JSON object from text that may contain other content.
/// Uses brace-counting to find the outermost JSON object.
pub fn extract_json_object(text: &str) -> Option<String> {
    let start = text.find('{')?;
    let mut depth = 0;
    let mut end = start;

    for (i, ch) in text[start..].char_indices() {
        match ch {
            '{' => depth += 1,
            '}' => {
                depth -= 1;
                if depth == 0 {
                    end = start + i + 1;
                    break;
                }
            }
            _ => {}
        }
    }

    if depth == 0 && end > start {
        Some(text[start..end].to_string())
    } else {
        None
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde::Deserialize;
    use tempfile::tempdir;

    #[derive(Debug, Serialize, Deserialize, PartialEq)]
    struct Record {
        name: String,
        count: u32,
    }

    #[test]
    fn test_write_json_atomic_round_trip() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("nested").join("record.json");
        let record = Record {
            name: "alpha".into(),
            count: 3,
        };

        write_json_atomic(&path, &record).unwrap();
        let loaded: Record = read_json(&path).unwrap();
        assert_eq!(loaded, record);

        // No temp file left behind
        let leftovers: Vec<_> = std::fs::read_dir(path.parent().unwrap())
            .unwrap()
            .filter_map(|e| e.ok())
            .filter(|e| e.file_name().to_string_lossy().contains(".tmp-"))
            .collect();
        assert!(leftovers.is_empty());
    }

    #[test]
    fn test_write_json_atomic_overwrites() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("record.json");
        write_json_atomic(&path, &Record { name: "a".into(), count: 1 }).unwrap();
        write_json_atomic(&path, &Record { name: "b".into(), count: 2 }).unwrap();
        let loaded: Record = read_json(&path).unwrap();
        assert_eq!(loaded.name, "b");
    }

    #[test]
    fn test_append_line_accumulates() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("events.jsonl");
        append_line(&path, "one").unwrap();
        append_line(&path, "two").unwrap();
        let content = std::fs::read_to_string(&path).unwrap();
        assert_eq!(content, "one\ntwo\n");
    }

    #[test]
    fn test_with_file_lock_runs_body() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("kanban.md");
        let out = with_file_lock(&path, || Ok(42)).unwrap();
        assert_eq!(out, 42);
        assert!(dir.path().join("kanban.md.lock").exists());
    }

    #[test]
    fn test_with_file_lock_serializes_writers() {
        use std::sync::Arc;
        use std::sync::atomic::{AtomicU32, Ordering};

        let dir = tempdir().unwrap();
        let path = Arc::new(dir.path().join("shared.json"));
        let counter = Arc::new(AtomicU32::new(0));

        let handles: Vec<_> = (0..8)
            .map(|_| {
                let path = Arc::clone(&path);
                let counter = Arc::clone(&counter);
                std::thread::spawn(move || {
                    with_file_lock(&path, || {
                        let v = counter.load(Ordering::SeqCst);
                        std::thread::sleep(Duration::from_millis(2));
                        counter.store(v + 1, Ordering::SeqCst);
                        Ok(())
                    })
                    .unwrap();
                })
            })
            .collect();
        for h in handles {
            h.join().unwrap();
        }
        // Without mutual exclusion the read-sleep-write would lose updates.
        assert_eq!(counter.load(Ordering::SeqCst), 8);
    }

    #[test]
    fn test_slugify() {
        assert_eq!(slugify("Add user login!"), "add-user-login");
        assert_eq!(slugify("  --weird__input--  "), "weird-input");
        let long = slugify(&"x".repeat(100));
        assert!(long.len() <= 40);
    }

    #[test]
    fn test_pid_alive_self_and_bogus() {
        assert!(pid_alive(std::process::id()));
        assert!(!pid_alive(0));
    }

    #[test]
    fn test_extract_json_object_nested() {
        let text = r#"plan follows: {"prs": [{"task": "AB-1"}]} done"#;
        assert_eq!(
            extract_json_object(text),
            Some(r#"{"prs": [{"task": "AB-1"}]}"#.to_string())
        );
    }

    #[test]
    fn test_extract_json_object_unclosed() {
        assert_eq!(extract_json_object(r#"{"key": "value""#), None);
    }
}
