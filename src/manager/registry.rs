//! Runtime registry of running worlds.
//!
//! `emsm_state.json` maps world names to the process serving them and the
//! manager that owns that process. Every manager on the host reads it to
//! avoid starting a world twice and to keep auto ports of running worlds
//! out of the allocator's reach.

use std::collections::BTreeMap;
use std::fs::{self, File};
use std::io::{self, BufReader, BufWriter, ErrorKind, Write};
use std::path::{Path, PathBuf};

use serde::{Deserialize, Serialize};
use thiserror::Error;

use crate::lifecycle::LockGuard;
use crate::process::control::pid_alive;

#[derive(Debug, Error)]
pub enum RegistryError {
    #[error("runtime registry {}: {source}", path.display())]
    Io {
        path: PathBuf,
        #[source]
        source: io::Error,
    },

    #[error("runtime registry {} is corrupt: {source}", path.display())]
    Corrupt {
        path: PathBuf,
        #[source]
        source: serde_json::Error,
    },
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RegistryEntry {
    /// Pid of the server process.
    pub pid: u32,
    pub port: u16,
    /// Pid of the manager supervising the server.
    pub manager_pid: u32,
    /// Unix time the world was started.
    pub started_at: u64,
}

impl RegistryEntry {
    pub fn is_owned_by_this_process(&self) -> bool {
        self.manager_pid == std::process::id()
    }

    /// The server outlived the manager that started it.
    pub fn is_orphaned(&self) -> bool {
        !self.is_owned_by_this_process() && !pid_alive(self.manager_pid)
    }
}

#[derive(Debug, Clone)]
pub struct RuntimeRegistry {
    path: PathBuf,
}

impl RuntimeRegistry {
    pub fn new(path: impl Into<PathBuf>) -> Self {
        Self { path: path.into() }
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Entries whose server process is still alive. Needs no lock.
    pub fn load(&self) -> Result<BTreeMap<String, RegistryEntry>, RegistryError> {
        let mut entries = self.read()?;
        entries.retain(|world, entry| {
            let alive = pid_alive(entry.pid);
            if !alive {
                tracing::debug!(world = %world, pid = entry.pid, "Pruning dead registry entry");
            }
            alive
        });
        Ok(entries)
    }

    pub fn record(
        &self,
        world: &str,
        entry: RegistryEntry,
        _guard: &LockGuard,
    ) -> Result<(), RegistryError> {
        let mut entries = self.load()?;
        entries.insert(world.to_string(), entry);
        self.write(&entries)
    }

    pub fn remove(
        &self,
        world: &str,
        _guard: &LockGuard,
    ) -> Result<Option<RegistryEntry>, RegistryError> {
        let mut entries = self.load()?;
        let removed = entries.remove(world);
        self.write(&entries)?;
        Ok(removed)
    }

    fn read(&self) -> Result<BTreeMap<String, RegistryEntry>, RegistryError> {
        let file = match File::open(&self.path) {
            Ok(file) => file,
            Err(e) if e.kind() == ErrorKind::NotFound => return Ok(BTreeMap::new()),
            Err(source) => return Err(self.io_error(source)),
        };
        serde_json::from_reader(BufReader::new(file)).map_err(|source| RegistryError::Corrupt {
            path: self.path.clone(),
            source,
        })
    }

    fn write(&self, entries: &BTreeMap<String, RegistryEntry>) -> Result<(), RegistryError> {
        let tmp = self.path.with_extension("json.tmp");
        let file = File::create(&tmp).map_err(|source| self.io_error(source))?;
        let mut writer = BufWriter::new(file);
        serde_json::to_writer_pretty(&mut writer, entries).map_err(|source| {
            RegistryError::Corrupt {
                path: self.path.clone(),
                source,
            }
        })?;
        writer.flush().map_err(|source| self.io_error(source))?;
        fs::rename(&tmp, &self.path).map_err(|source| self.io_error(source))
    }

    fn io_error(&self, source: io::Error) -> RegistryError {
        RegistryError::Io {
            path: self.path.clone(),
            source,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::LockTimeout;
    use crate::lifecycle::InstanceLock;

    fn entry(pid: u32, port: u16) -> RegistryEntry {
        RegistryEntry {
            pid,
            port,
            manager_pid: std::process::id(),
            started_at: 0,
        }
    }

    #[tokio::test]
    async fn test_record_and_remove() {
        let dir = tempfile::tempdir().unwrap();
        let registry = RuntimeRegistry::new(dir.path().join("emsm_state.json"));
        let guard = InstanceLock::new(dir.path().join("emsm.lock"))
            .acquire(LockTimeout::Forever)
            .await
            .unwrap();

        assert!(registry.load().unwrap().is_empty());

        let me = std::process::id();
        registry.record("foo", entry(me, 25565), &guard).unwrap();
        let loaded = registry.load().unwrap();
        assert_eq!(loaded.get("foo"), Some(&entry(me, 25565)));
        assert!(loaded["foo"].is_owned_by_this_process());

        assert_eq!(registry.remove("foo", &guard).unwrap(), Some(entry(me, 25565)));
        assert!(registry.load().unwrap().is_empty());
        assert_eq!(registry.remove("foo", &guard).unwrap(), None);
    }

    #[test]
    fn test_dead_pids_are_pruned() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("emsm_state.json");
        let mut entries = BTreeMap::new();
        entries.insert("alive".to_string(), entry(std::process::id(), 25565));
        entries.insert("gone".to_string(), entry(i32::MAX as u32, 25566));
        fs::write(&path, serde_json::to_string(&entries).unwrap()).unwrap();

        let loaded = RuntimeRegistry::new(&path).load().unwrap();
        assert_eq!(loaded.keys().collect::<Vec<_>>(), ["alive"]);
    }

    #[test]
    fn test_corrupt_file() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("emsm_state.json");
        fs::write(&path, "{ not json").unwrap();
        assert!(matches!(
            RuntimeRegistry::new(&path).load(),
            Err(RegistryError::Corrupt { .. })
        ));
    }

    #[test]
    fn test_entry_of_dead_manager_is_orphaned() {
        let mine = entry(std::process::id(), 25565);
        assert!(!mine.is_orphaned());

        let foreign = RegistryEntry {
            manager_pid: 1,
            ..mine.clone()
        };
        assert!(!foreign.is_orphaned());

        let abandoned = RegistryEntry {
            manager_pid: i32::MAX as u32,
            ..mine
        };
        assert!(abandoned.is_orphaned());
    }
}
