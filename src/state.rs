//! Persisted pid state.
//!
//! Each project gets one JSON file mapping server name to the pid we last spawned
//! for it, stored as `<state-dir>/<hash>_processes.json` where `<hash>` is the first
//! eight hex digits of the SHA-256 of the project's absolute path. The file is a
//! hint, never proof of liveness: every entry is re-checked against the OS before
//! it is trusted, and a missing or unreadable file reads as empty.

use std::collections::BTreeMap;
use std::env;
use std::fs;
use std::io;
use std::path::{Path, PathBuf};
use std::time::Duration;

use anyhow::{Context, Result};
use serde_json::{Map, Value};
use sha2::{Digest, Sha256};
use tracing::{debug, info, warn};

use crate::platform::{self, Delivery, Signal};

const STATE_FILE_SUFFIX: &str = "_processes.json";
const APP_DIR: &str = "devrack";

/// Pid bookkeeping for one project.
#[derive(Debug)]
pub struct StateStore {
    path: PathBuf,
}

impl StateStore {
    /// Opens (and if needed creates) the store for `project_root` under `state_dir`.
    ///
    /// Failing to create the state directory is the one unrecoverable error here.
    pub fn open(state_dir: &Path, project_root: &Path) -> Result<Self> {
        fs::create_dir_all(state_dir)
            .with_context(|| format!("failed to create state dir {}", state_dir.display()))?;
        let path = state_dir.join(format!("{}{}", project_key(project_root), STATE_FILE_SUFFIX));
        Ok(Self { path })
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    pub fn save_pid(&self, name: &str, pid: u32) -> Result<()> {
        let mut entries = self.entries();
        entries.insert(name.to_string(), pid);
        self.write(&entries)
    }

    pub fn get_pid(&self, name: &str) -> Option<u32> {
        self.entries().get(name).copied()
    }

    pub fn clear_pid(&self, name: &str) -> Result<()> {
        let mut entries = self.entries();
        if entries.remove(name).is_none() {
            return Ok(());
        }
        self.write(&entries)
    }

    /// Drops every entry whose pid no longer exists and returns the removed names.
    pub fn cleanup_dead(&self) -> Vec<String> {
        let mut entries = self.entries();
        let dead: Vec<String> = entries
            .iter()
            .filter(|(_, pid)| !platform::is_pid_alive(**pid))
            .map(|(name, _)| name.clone())
            .collect();
        if dead.is_empty() {
            return dead;
        }
        for name in &dead {
            entries.remove(name);
        }
        if let Err(err) = self.write(&entries) {
            warn!("failed to prune state file {}: {:#}", self.path.display(), err);
        }
        debug!("pruned {} dead entries from {}", dead.len(), self.path.display());
        dead
    }

    /// All entries currently on disk.
    pub fn entries(&self) -> BTreeMap<String, u32> {
        read_entries(&self.path)
    }

    fn write(&self, entries: &BTreeMap<String, u32>) -> Result<()> {
        write_entries(&self.path, entries)
    }
}

fn read_entries(path: &Path) -> BTreeMap<String, u32> {
    let Ok(raw) = fs::read_to_string(path) else {
        return BTreeMap::new();
    };
    match serde_json::from_str::<Map<String, Value>>(&raw) {
        Ok(map) => map
            .into_iter()
            .filter_map(|(name, pid)| {
                let pid = pid.as_u64().and_then(|pid| u32::try_from(pid).ok())?;
                Some((name, pid))
            })
            .collect(),
        Err(err) => {
            warn!("ignoring unreadable state file {}: {}", path.display(), err);
            BTreeMap::new()
        }
    }
}

fn write_entries(path: &Path, entries: &BTreeMap<String, u32>) -> Result<()> {
    let serialized = serde_json::to_string_pretty(entries)?;
    let tmp = path.with_extension("json.tmp");
    fs::write(&tmp, serialized)
        .with_context(|| format!("failed to write state file {}", tmp.display()))?;
    fs::rename(&tmp, path)
        .with_context(|| format!("failed to replace state file {}", path.display()))?;
    Ok(())
}

/// Short stable key for a project directory.
pub fn project_key(project_root: &Path) -> String {
    let resolved = fs::canonicalize(project_root).unwrap_or_else(|_| absolute(project_root));
    let digest = Sha256::digest(resolved.to_string_lossy().as_bytes());
    let hex = format!("{:x}", digest);
    hex[..8].to_string()
}

fn absolute(path: &Path) -> PathBuf {
    if path.is_absolute() {
        return path.to_path_buf();
    }
    env::current_dir()
        .map(|cwd| cwd.join(path))
        .unwrap_or_else(|_| path.to_path_buf())
}

/// Per-user directory holding pid files and the UI log.
pub fn default_state_dir() -> Option<PathBuf> {
    if let Ok(path) = env::var("XDG_STATE_HOME") {
        return Some(PathBuf::from(path).join(APP_DIR));
    }
    if cfg!(windows) {
        return env::var("LOCALAPPDATA")
            .ok()
            .map(|dir| PathBuf::from(dir).join(APP_DIR));
    }
    env::var("HOME")
        .ok()
        .map(|home| PathBuf::from(home).join(format!(".{}", APP_DIR)))
}

/// Terminates processes left behind by earlier runs, across every project.
///
/// Walks all pid files in `state_dir`, sends SIGTERM to each recorded group that is
/// still alive (never our own process) and drops every entry it handled. Live pids
/// owned by another user are left in place. Returns the number of process groups
/// signaled.
pub async fn cleanup_orphans(state_dir: &Path) -> usize {
    let Ok(dir) = fs::read_dir(state_dir) else {
        return 0;
    };
    let own_pid = std::process::id();
    let mut terminated = 0;

    for entry in dir.flatten() {
        let path = entry.path();
        let is_state_file = path
            .file_name()
            .and_then(|name| name.to_str())
            .map(|name| name.ends_with(STATE_FILE_SUFFIX))
            .unwrap_or(false);
        if !is_state_file {
            continue;
        }

        let mut entries = read_entries(&path);
        let mut handled = Vec::new();
        for (name, pid) in &entries {
            if *pid == own_pid {
                continue;
            }
            match settle_orphan(*pid, platform::is_pid_alive, |pid| {
                platform::signal_tree(pid, Signal::Terminate)
            }) {
                Orphan::Terminated => {
                    info!("terminated orphaned {} (pid {})", name, pid);
                    terminated += 1;
                }
                Orphan::Dead => {}
                Orphan::Foreign => {
                    debug!("{} (pid {}) belongs to another user, leaving it", name, pid);
                    continue;
                }
                Orphan::Failed(err) => {
                    warn!("could not terminate {} (pid {}): {}", name, pid, err);
                }
            }
            handled.push(name.clone());
        }

        if handled.is_empty() {
            continue;
        }
        for name in &handled {
            entries.remove(name);
        }
        if let Err(err) = write_entries(&path, &entries) {
            warn!("failed to update {}: {:#}", path.display(), err);
        }
    }

    if terminated > 0 {
        // Give the signaled groups a moment before callers probe ports again.
        tokio::time::sleep(Duration::from_millis(200)).await;
    }
    terminated
}

/// What the cleanup pass did with one recorded pid.
#[derive(Debug)]
enum Orphan {
    Terminated,
    Dead,
    /// Alive but not ours to signal; the entry stays.
    Foreign,
    Failed(io::Error),
}

fn settle_orphan(
    pid: u32,
    alive: impl Fn(u32) -> bool,
    terminate: impl FnOnce(u32) -> io::Result<Delivery>,
) -> Orphan {
    if !alive(pid) {
        return Orphan::Dead;
    }
    match terminate(pid) {
        Ok(Delivery::Sent) => Orphan::Terminated,
        Ok(Delivery::Gone) if alive(pid) => Orphan::Foreign,
        Ok(Delivery::Gone) => Orphan::Dead,
        Err(err) => Orphan::Failed(err),
    }
}

#[cfg(test)]
mod tests {
    use pretty_assertions::assert_eq;
    use tempfile::TempDir;

    use super::*;

    fn store() -> (TempDir, StateStore) {
        let dir = tempfile::tempdir().unwrap();
        let store = StateStore::open(&dir.path().join("state"), dir.path()).unwrap();
        (dir, store)
    }

    // A pid far above any default pid_max.
    const DEAD_PID: u32 = 999_999_999;

    #[test]
    fn save_get_and_clear() {
        let (_dir, store) = store();
        assert_eq!(store.get_pid("api"), None);
        store.save_pid("api", 4242).unwrap();
        store.save_pid("web", 4343).unwrap();
        assert_eq!(store.get_pid("api"), Some(4242));
        store.clear_pid("api").unwrap();
        assert_eq!(store.get_pid("api"), None);
        assert_eq!(store.get_pid("web"), Some(4343));
    }

    #[test]
    fn file_name_is_hashed_project_path() {
        let (dir, store) = store();
        let name = store.path().file_name().unwrap().to_str().unwrap().to_string();
        assert_eq!(name, format!("{}_processes.json", project_key(dir.path())));
        assert_eq!(project_key(dir.path()).len(), 8);
        assert_eq!(project_key(dir.path()), project_key(dir.path()));
    }

    #[test]
    fn corrupt_file_reads_as_empty() {
        let (_dir, store) = store();
        fs::write(store.path(), "{not json").unwrap();
        assert!(store.entries().is_empty());
        store.save_pid("api", 10).unwrap();
        assert_eq!(store.get_pid("api"), Some(10));
    }

    #[test]
    fn non_integer_entries_are_skipped() {
        let (_dir, store) = store();
        fs::write(store.path(), r#"{"api": 12, "web": "oops", "db": -4}"#).unwrap();
        let entries = store.entries();
        assert_eq!(entries.len(), 1);
        assert_eq!(entries.get("api"), Some(&12));
    }

    #[test]
    fn cleanup_dead_keeps_live_entries() {
        let (_dir, store) = store();
        store.save_pid("me", std::process::id()).unwrap();
        store.save_pid("ghost", DEAD_PID).unwrap();
        let removed = store.cleanup_dead();
        assert_eq!(removed, vec!["ghost".to_string()]);
        assert_eq!(store.get_pid("me"), Some(std::process::id()));
        assert_eq!(store.get_pid("ghost"), None);
    }

    #[tokio::test]
    async fn orphan_cleanup_skips_current_process_and_drops_dead() {
        let dir = tempfile::tempdir().unwrap();
        let store = StateStore::open(dir.path(), dir.path()).unwrap();
        store.save_pid("me", std::process::id()).unwrap();
        store.save_pid("ghost", DEAD_PID).unwrap();
        fs::write(dir.path().join("notes.txt"), "unrelated").unwrap();

        let terminated = cleanup_orphans(dir.path()).await;
        assert_eq!(terminated, 0);
        let entries = store.entries();
        assert_eq!(entries.get("me"), Some(&std::process::id()));
        assert!(!entries.contains_key("ghost"));
    }

    #[test]
    fn orphans_owned_by_someone_else_are_kept() {
        let settled = settle_orphan(4242, |_| true, |_| Ok(Delivery::Gone));
        assert!(matches!(settled, Orphan::Foreign), "{settled:?}");

        let settled = settle_orphan(4242, |_| true, |_| Ok(Delivery::Sent));
        assert!(matches!(settled, Orphan::Terminated), "{settled:?}");

        let settled = settle_orphan(4242, |_| false, |_| panic!("dead pids are not signaled"));
        assert!(matches!(settled, Orphan::Dead), "{settled:?}");

        // Exited between the probe and the signal.
        let calls = std::cell::Cell::new(0);
        let alive = |_: u32| {
            calls.set(calls.get() + 1);
            calls.get() == 1
        };
        let settled = settle_orphan(4242, alive, |_| Ok(Delivery::Gone));
        assert!(matches!(settled, Orphan::Dead), "{settled:?}");
    }

    #[cfg(unix)]
    #[tokio::test]
    async fn orphan_cleanup_terminates_live_groups() {
        let dir = tempfile::tempdir().unwrap();
        let store = StateStore::open(dir.path(), dir.path()).unwrap();
        let mut child = std::process::Command::new("sleep").arg("30").spawn().unwrap();
        store.save_pid("sleeper", child.id()).unwrap();

        assert_eq!(cleanup_orphans(dir.path()).await, 1);
        child.wait().unwrap();
        assert!(store.entries().is_empty());
    }
}
