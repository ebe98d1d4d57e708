//! Per-account disk snapshot of the ledger.
//!
//! Persistence here is best-effort, not transactional: every I/O error
//! is swallowed and logged, an absent or corrupt file reads as an empty
//! ledger, and the worst outcome is replaying an already-applied diff —
//! safe, because diffs are idempotent end-states.
use std::collections::HashMap;
use std::io::Write;
use std::path::{Path, PathBuf};

use anyhow::{Context, Result};
use serde::{Deserialize, Serialize};

use super::ledger::Diff;

/// On-disk form: map of article id → state, one JSON file per account.
#[derive(Debug, Serialize, Deserialize)]
struct CacheEntry {
    is_unread: bool,
    feed_id: i64,
    #[serde(default)]
    group_id: Option<i64>,
}

/// Durable backstop for the ledger's destructive drain.
pub struct DiffCache {
    dir: PathBuf,
}

impl DiffCache {
    pub fn new(dir: PathBuf) -> Self {
        Self { dir }
    }

    fn path_for(&self, account_id: &str) -> PathBuf {
        // Account ids come from the user's config; keep the filename
        // safe regardless of what they typed.
        let safe: String = account_id
            .chars()
            .map(|c| {
                if c.is_ascii_alphanumeric() || c == '-' || c == '_' {
                    c
                } else {
                    '_'
                }
            })
            .collect();
        self.dir.join(format!("pending-{safe}.json"))
    }

    /// Write the account's ledger snapshot, replacing any previous file.
    pub fn write_snapshot(&self, account_id: &str, diffs: &[Diff]) {
        if let Err(e) = self.try_write(account_id, diffs) {
            tracing::warn!(
                account = account_id,
                error = %e,
                "failed to write diff cache, continuing without it"
            );
        }
    }

    fn try_write(&self, account_id: &str, diffs: &[Diff]) -> Result<()> {
        std::fs::create_dir_all(&self.dir)
            .with_context(|| format!("creating cache dir {}", self.dir.display()))?;

        let map: HashMap<String, CacheEntry> = diffs
            .iter()
            .map(|d| {
                (
                    d.article_id.to_string(),
                    CacheEntry {
                        is_unread: d.is_unread,
                        feed_id: d.feed_id,
                        group_id: d.group_id,
                    },
                )
            })
            .collect();
        let json = serde_json::to_vec(&map).context("serializing diff cache")?;

        atomic_write(&self.path_for(account_id), &json)
    }

    /// Read the account's snapshot back. Missing or corrupt files are an
    /// empty ledger, never an error.
    pub fn read_snapshot(&self, account_id: &str) -> Vec<Diff> {
        let path = self.path_for(account_id);
        let bytes = match std::fs::read(&path) {
            Ok(b) => b,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Vec::new(),
            Err(e) => {
                tracing::warn!(path = %path.display(), error = %e, "failed to read diff cache");
                return Vec::new();
            }
        };

        let map: HashMap<String, CacheEntry> = match serde_json::from_slice(&bytes) {
            Ok(m) => m,
            Err(e) => {
                tracing::warn!(
                    path = %path.display(),
                    error = %e,
                    "corrupt diff cache, treating as empty"
                );
                return Vec::new();
            }
        };

        map.into_iter()
            .filter_map(|(key, entry)| {
                key.parse().ok().map(|article_id| Diff {
                    article_id,
                    feed_id: entry.feed_id,
                    group_id: entry.group_id,
                    is_unread: entry.is_unread,
                })
            })
            .collect()
    }

    /// Delete the account's snapshot file, if any.
    pub fn clear(&self, account_id: &str) {
        let path = self.path_for(account_id);
        match std::fs::remove_file(&path) {
            Ok(()) => {}
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => {}
            Err(e) => {
                tracing::warn!(path = %path.display(), error = %e, "failed to clear diff cache");
            }
        }
    }
}

/// Write-to-temp-then-rename so the destination is never left partial.
fn atomic_write(dst: &Path, bytes: &[u8]) -> Result<()> {
    // Randomized temp filename: an unpredictable path cannot be raced
    // with a pre-created symlink.
    use std::time::{SystemTime, UNIX_EPOCH};
    let random_suffix = SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|d| d.as_nanos())
        .unwrap_or(0);
    let temp_path = dst.with_extension(format!("tmp.{:016x}", random_suffix));

    let mut temp_file = std::fs::OpenOptions::new()
        .write(true)
        .create_new(true) // Fails atomically if the file exists
        .open(&temp_path)
        .with_context(|| format!("creating temp file {}", temp_path.display()))?;

    let write_result = temp_file
        .write_all(bytes)
        .and_then(|()| temp_file.sync_all());
    if let Err(e) = write_result {
        let _ = std::fs::remove_file(&temp_path);
        return Err(e).with_context(|| format!("writing temp file {}", temp_path.display()));
    }
    drop(temp_file);

    // On Windows, rename fails if the destination exists
    #[cfg(windows)]
    if dst.exists() {
        let _ = std::fs::remove_file(dst);
    }

    if let Err(e) = std::fs::rename(&temp_path, dst) {
        let _ = std::fs::remove_file(&temp_path);
        return Err(e).with_context(|| format!("renaming into {}", dst.display()));
    }
    Ok(())
}

// ============================================================================
// Tests
// ============================================================================

#[cfg(test)]
mod tests {
    use super::*;
    use pretty_assertions::assert_eq;

    fn diff(article_id: i64, is_unread: bool) -> Diff {
        Diff {
            article_id,
            feed_id: article_id * 10,
            group_id: (article_id % 2 == 0).then_some(5),
            is_unread,
        }
    }

    fn sorted(mut diffs: Vec<Diff>) -> Vec<Diff> {
        diffs.sort_by_key(|d| d.article_id);
        diffs
    }

    #[test]
    fn test_round_trip_is_exact() {
        let dir = tempfile::tempdir().unwrap();
        let cache = DiffCache::new(dir.path().to_path_buf());

        let diffs = vec![diff(1, true), diff(2, false), diff(3, true)];
        cache.write_snapshot("home", &diffs);

        assert_eq!(sorted(cache.read_snapshot("home")), sorted(diffs));
    }

    #[test]
    fn test_missing_file_is_empty() {
        let dir = tempfile::tempdir().unwrap();
        let cache = DiffCache::new(dir.path().to_path_buf());
        assert!(cache.read_snapshot("nobody").is_empty());
    }

    #[test]
    fn test_corrupt_file_is_empty() {
        let dir = tempfile::tempdir().unwrap();
        let cache = DiffCache::new(dir.path().to_path_buf());
        cache.write_snapshot("home", &[diff(1, true)]);

        let path = cache.path_for("home");
        std::fs::write(&path, "not valid json {{").unwrap();

        assert!(cache.read_snapshot("home").is_empty());
    }

    #[test]
    fn test_overwrite_replaces_previous_snapshot() {
        let dir = tempfile::tempdir().unwrap();
        let cache = DiffCache::new(dir.path().to_path_buf());

        cache.write_snapshot("home", &[diff(1, true), diff(2, true)]);
        cache.write_snapshot("home", &[diff(3, false)]);

        let read = cache.read_snapshot("home");
        assert_eq!(read.len(), 1);
        assert_eq!(read[0].article_id, 3);
    }

    #[test]
    fn test_clear_removes_file() {
        let dir = tempfile::tempdir().unwrap();
        let cache = DiffCache::new(dir.path().to_path_buf());

        cache.write_snapshot("home", &[diff(1, true)]);
        cache.clear("home");
        assert!(cache.read_snapshot("home").is_empty());

        // Clearing again is a no-op, not an error
        cache.clear("home");
    }

    #[test]
    fn test_accounts_are_isolated() {
        let dir = tempfile::tempdir().unwrap();
        let cache = DiffCache::new(dir.path().to_path_buf());

        cache.write_snapshot("one", &[diff(1, true)]);
        cache.write_snapshot("two", &[diff(2, false)]);

        assert_eq!(cache.read_snapshot("one")[0].article_id, 1);
        assert_eq!(cache.read_snapshot("two")[0].article_id, 2);
    }

    #[test]
    fn test_hostile_account_id_stays_in_dir() {
        let dir = tempfile::tempdir().unwrap();
        let cache = DiffCache::new(dir.path().to_path_buf());

        cache.write_snapshot("../../etc/passwd", &[diff(1, true)]);
        let path = cache.path_for("../../etc/passwd");
        assert!(path.starts_with(dir.path()));
        assert_eq!(cache.read_snapshot("../../etc/passwd").len(), 1);
    }
}
