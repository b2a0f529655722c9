// SPDX-License-Identifier: BUSL-1.1
// Copyright (c) 2026 Alfred Jean LLC

//! Durable key-value storage for the credential pair.

use std::collections::BTreeMap;
use std::path::{Path, PathBuf};

use anyhow::Context;
use parking_lot::Mutex;

/// Key holding the access token.
pub const ACCESS_TOKEN_KEY: &str = "access_token";
/// Key holding the refresh token.
pub const REFRESH_TOKEN_KEY: &str = "refresh_token";

/// Minimal string key-value storage surviving process restarts.
///
/// `set_many` and `remove_many` apply all entries as one logical write.
pub trait KeyValueStore: Send + Sync + 'static {
    fn get(&self, key: &str) -> anyhow::Result<Option<String>>;

    fn set_many(&self, entries: &[(&str, &str)]) -> anyhow::Result<()>;

    fn remove_many(&self, keys: &[&str]) -> anyhow::Result<()>;
}

/// Volatile store for tests and sessions that should not outlive the process.
#[derive(Debug, Default)]
pub struct MemoryStore {
    entries: Mutex<BTreeMap<String, String>>,
}

impl MemoryStore {
    pub fn new() -> Self {
        Self::default()
    }
}

impl KeyValueStore for MemoryStore {
    fn get(&self, key: &str) -> anyhow::Result<Option<String>> {
        Ok(self.entries.lock().get(key).cloned())
    }

    fn set_many(&self, entries: &[(&str, &str)]) -> anyhow::Result<()> {
        let mut map = self.entries.lock();
        for (k, v) in entries {
            map.insert((*k).to_owned(), (*v).to_owned());
        }
        Ok(())
    }

    fn remove_many(&self, keys: &[&str]) -> anyhow::Result<()> {
        let mut map = self.entries.lock();
        for k in keys {
            map.remove(*k);
        }
        Ok(())
    }
}

/// JSON object on disk, rewritten atomically on every change.
#[derive(Debug)]
pub struct FileStore {
    path: PathBuf,
    /// Serializes read-modify-write cycles within this process.
    guard: Mutex<()>,
}

impl FileStore {
    pub fn new(path: impl Into<PathBuf>) -> Self {
        Self { path: path.into(), guard: Mutex::new(()) }
    }

    pub fn path(&self) -> &Path {
        &self.path
    }
}

impl KeyValueStore for FileStore {
    fn get(&self, key: &str) -> anyhow::Result<Option<String>> {
        let _guard = self.guard.lock();
        Ok(load(&self.path)?.remove(key))
    }

    fn set_many(&self, entries: &[(&str, &str)]) -> anyhow::Result<()> {
        let _guard = self.guard.lock();
        let mut map = load(&self.path)?;
        for (k, v) in entries {
            map.insert((*k).to_owned(), (*v).to_owned());
        }
        save(&self.path, &map)
    }

    fn remove_many(&self, keys: &[&str]) -> anyhow::Result<()> {
        let _guard = self.guard.lock();
        let mut map = load(&self.path)?;
        let before = map.len();
        for k in keys {
            map.remove(*k);
        }
        if map.len() == before && !self.path.exists() {
            return Ok(());
        }
        save(&self.path, &map)
    }
}

/// Load the entry map. A missing file is an empty map.
fn load(path: &Path) -> anyhow::Result<BTreeMap<String, String>> {
    let contents = match std::fs::read_to_string(path) {
        Ok(c) => c,
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(BTreeMap::new()),
        Err(e) => return Err(e).with_context(|| format!("reading {}", path.display())),
    };
    if contents.trim().is_empty() {
        return Ok(BTreeMap::new());
    }
    let map = serde_json::from_str(&contents)
        .with_context(|| format!("parsing credential state {}", path.display()))?;
    Ok(map)
}

/// Write the entry map atomically (unique tmp file + rename).
///
/// The temp name carries PID + counter so concurrent writers never share a
/// `.tmp` file and leave trailing bytes from a longer previous write.
fn save(path: &Path, map: &BTreeMap<String, String>) -> anyhow::Result<()> {
    use std::sync::atomic::{AtomicU32, Ordering};
    static COUNTER: AtomicU32 = AtomicU32::new(0);

    if let Some(parent) = path.parent() {
        if !parent.as_os_str().is_empty() {
            std::fs::create_dir_all(parent)
                .with_context(|| format!("creating {}", parent.display()))?;
        }
    }

    let json = serde_json::to_string_pretty(map)?;
    let seq = COUNTER.fetch_add(1, Ordering::Relaxed);
    let tmp_name = format!(
        "{}.{}.{}.tmp",
        path.file_name().unwrap_or_default().to_string_lossy(),
        std::process::id(),
        seq,
    );
    let tmp_path = path.with_file_name(tmp_name);
    std::fs::write(&tmp_path, json).with_context(|| format!("writing {}", tmp_path.display()))?;
    std::fs::rename(&tmp_path, path).with_context(|| format!("replacing {}", path.display()))?;
    Ok(())
}

#[cfg(test)]
#[path = "persist_tests.rs"]
mod tests;
