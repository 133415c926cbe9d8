//! Durable L2 cache tier: one JSON file per fingerprint.
//!
//! The tier is content-addressed: the file name is the fingerprint, so
//! lookups are a single stat+read. Expiry is wall-clock here (entries must
//! survive restarts); the in-memory tier keeps its own monotonic deadline.
//! Every failure degrades to a miss — the cache never fails a request.

use std::path::{Path, PathBuf};

use chrono::Utc;
use serde::{Deserialize, Serialize};

use crate::usage::TokenUsage;

/// A persisted cache entry.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DiskEntry {
    pub fingerprint: String,
    pub payload: serde_json::Value,
    pub provider: String,
    pub model: String,
    pub usage: Option<TokenUsage>,
    /// Request text kept for similarity matching after promotion.
    pub input_text: String,
    pub inserted_at_unix: i64,
    pub expires_at_unix: i64,
}

impl DiskEntry {
    pub fn is_expired(&self, now_unix: i64) -> bool {
        now_unix >= self.expires_at_unix
    }
}

/// File-per-fingerprint store rooted at one directory.
pub struct DiskTier {
    dir: PathBuf,
}

impl DiskTier {
    /// Create the tier, making the directory if needed. Returns `None`
    /// (tier disabled) when the directory cannot be created.
    pub fn open(dir: &Path) -> Option<Self> {
        if let Err(e) = std::fs::create_dir_all(dir) {
            tracing::warn!(dir = %dir.display(), error = %e, "disabling L2 cache tier");
            return None;
        }
        Some(Self {
            dir: dir.to_path_buf(),
        })
    }

    fn path(&self, fingerprint: &str) -> PathBuf {
        // Fingerprints are hex; no path traversal is possible, but reject
        // anything else rather than trusting the caller.
        debug_assert!(fingerprint.chars().all(|c| c.is_ascii_hexdigit()));
        self.dir.join(format!("{fingerprint}.json"))
    }

    /// Read an entry; expired or unreadable files are removed and miss.
    pub fn get(&self, fingerprint: &str) -> Option<DiskEntry> {
        let path = self.path(fingerprint);
        let raw = std::fs::read_to_string(&path).ok()?;
        let entry: DiskEntry = match serde_json::from_str(&raw) {
            Ok(entry) => entry,
            Err(e) => {
                tracing::warn!(fingerprint, error = %e, "dropping corrupt L2 entry");
                let _ = std::fs::remove_file(&path);
                return None;
            }
        };
        if entry.is_expired(Utc::now().timestamp()) {
            let _ = std::fs::remove_file(&path);
            return None;
        }
        Some(entry)
    }

    pub fn put(&self, entry: &DiskEntry) {
        let path = self.path(&entry.fingerprint);
        match serde_json::to_vec(entry) {
            Ok(bytes) => {
                if let Err(e) = std::fs::write(&path, bytes) {
                    tracing::warn!(fingerprint = %entry.fingerprint, error = %e, "L2 write failed");
                }
            }
            Err(e) => {
                tracing::warn!(fingerprint = %entry.fingerprint, error = %e, "L2 serialize failed");
            }
        }
    }

    pub fn remove(&self, fingerprint: &str) {
        let _ = std::fs::remove_file(self.path(fingerprint));
    }

    /// Remove every entry. Returns how many files were deleted.
    pub fn flush(&self) -> usize {
        self.visit_entries(|path, _| {
            let _ = std::fs::remove_file(path);
            true
        })
    }

    /// Remove entries matching a predicate. Returns how many were deleted.
    pub fn remove_matching(&self, pred: impl Fn(&DiskEntry) -> bool) -> usize {
        self.visit_entries(|path, entry| {
            if pred(entry) {
                let _ = std::fs::remove_file(path);
                true
            } else {
                false
            }
        })
    }

    /// Remove expired entries. Returns how many were deleted.
    pub fn sweep(&self) -> usize {
        let now = Utc::now().timestamp();
        self.visit_entries(|path, entry| {
            if entry.is_expired(now) {
                let _ = std::fs::remove_file(path);
                true
            } else {
                false
            }
        })
    }

    /// Number of entry files currently on disk.
    pub fn len(&self) -> usize {
        self.entry_paths().len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    fn entry_paths(&self) -> Vec<PathBuf> {
        let Ok(entries) = std::fs::read_dir(&self.dir) else {
            return Vec::new();
        };
        entries
            .filter_map(|e| e.ok())
            .map(|e| e.path())
            .filter(|p| p.extension().is_some_and(|ext| ext == "json"))
            .collect()
    }

    /// Visit every parseable entry; the callback returns whether it acted.
    fn visit_entries(&self, mut visit: impl FnMut(&Path, &DiskEntry) -> bool) -> usize {
        let mut acted = 0;
        for path in self.entry_paths() {
            let Ok(raw) = std::fs::read_to_string(&path) else {
                continue;
            };
            match serde_json::from_str::<DiskEntry>(&raw) {
                Ok(entry) => {
                    if visit(&path, &entry) {
                        acted += 1;
                    }
                }
                Err(_) => {
                    // Corrupt files are junk regardless of the caller.
                    let _ = std::fs::remove_file(&path);
                }
            }
        }
        acted
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn entry(fingerprint: &str, expires_in_secs: i64) -> DiskEntry {
        let now = Utc::now().timestamp();
        DiskEntry {
            fingerprint: fingerprint.to_string(),
            payload: serde_json::json!({ "content": "cached" }),
            provider: "anthropic".to_string(),
            model: "claude-sonnet".to_string(),
            usage: Some(TokenUsage::new(10, 20)),
            input_text: "ping".to_string(),
            inserted_at_unix: now,
            expires_at_unix: now + expires_in_secs,
        }
    }

    #[test]
    fn put_get_round_trip() {
        let dir = tempfile::tempdir().unwrap();
        let tier = DiskTier::open(dir.path()).unwrap();

        tier.put(&entry("aa11", 600));
        let got = tier.get("aa11").unwrap();
        assert_eq!(got.payload["content"], "cached");
        assert_eq!(got.usage, Some(TokenUsage::new(10, 20)));
    }

    #[test]
    fn expired_entries_miss_and_are_removed() {
        let dir = tempfile::tempdir().unwrap();
        let tier = DiskTier::open(dir.path()).unwrap();

        tier.put(&entry("bb22", -5));
        assert!(tier.get("bb22").is_none());
        assert!(tier.is_empty(), "expired file should be deleted on read");
    }

    #[test]
    fn missing_fingerprint_is_a_miss() {
        let dir = tempfile::tempdir().unwrap();
        let tier = DiskTier::open(dir.path()).unwrap();
        assert!(tier.get("cc33").is_none());
    }

    #[test]
    fn corrupt_files_are_dropped() {
        let dir = tempfile::tempdir().unwrap();
        let tier = DiskTier::open(dir.path()).unwrap();
        std::fs::write(dir.path().join("dd44.json"), "not json").unwrap();

        assert!(tier.get("dd44").is_none());
        assert!(tier.is_empty());
    }

    #[test]
    fn sweep_removes_only_expired() {
        let dir = tempfile::tempdir().unwrap();
        let tier = DiskTier::open(dir.path()).unwrap();

        tier.put(&entry("ee55", 600));
        tier.put(&entry("ff66", -5));

        assert_eq!(tier.sweep(), 1);
        assert!(tier.get("ee55").is_some());
        assert_eq!(tier.len(), 1);
    }

    #[test]
    fn flush_removes_everything() {
        let dir = tempfile::tempdir().unwrap();
        let tier = DiskTier::open(dir.path()).unwrap();

        tier.put(&entry("ab12", 600));
        tier.put(&entry("cd34", 600));
        assert_eq!(tier.flush(), 2);
        assert!(tier.is_empty());
    }
}
