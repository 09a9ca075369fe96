//! Instance directory layout.

use std::path::{Path, PathBuf};

/// Locations of everything the manager reads or writes under its root.
#[derive(Debug, Clone)]
pub struct InstancePaths {
    root: PathBuf,
}

impl InstancePaths {
    pub fn new(root: impl Into<PathBuf>) -> Self {
        Self { root: root.into() }
    }

    pub fn root(&self) -> &Path {
        &self.root
    }

    pub fn conf_dir(&self) -> PathBuf {
        self.root.join("conf")
    }

    pub fn main_conf(&self) -> PathBuf {
        self.conf_dir().join("main.conf")
    }

    pub fn server_conf(&self) -> PathBuf {
        self.conf_dir().join("server.conf")
    }

    pub fn worlds_conf(&self) -> PathBuf {
        self.conf_dir().join("worlds.conf")
    }

    /// Directory holding the server executables.
    pub fn server_dir(&self) -> PathBuf {
        self.root.join("server")
    }

    pub fn executable(&self, file_name: &str) -> PathBuf {
        self.server_dir().join(file_name)
    }

    /// Working directory of a world's server process.
    pub fn world_dir(&self, world: &str) -> PathBuf {
        self.root.join("worlds").join(world)
    }

    /// File guarded by the instance lock.
    pub fn lock_file(&self) -> PathBuf {
        self.root.join("emsm.lock")
    }

    /// Registry of worlds currently running under some manager.
    pub fn state_file(&self) -> PathBuf {
        self.root.join("emsm_state.json")
    }
}
