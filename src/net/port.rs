//! Automatic port allocation.
//!
//! # Responsibilities
//! - Resolve `port = <auto>` to a concrete port once and keep it stable
//! - Skip ports other worlds hold and ports something else is bound to
//! - Persist the choice into `worlds.conf`
//!
//! # Design Decisions
//! - `allocate` borrows a `LockGuard`: scan and write are one critical section
//! - `worlds.conf` is reloaded first, another manager may have written to it
//! - The bind probe runs last, only for ports that survived the cheap checks

use std::collections::HashSet;
use std::net::{IpAddr, Ipv4Addr};

use thiserror::Error;
use tokio::net::TcpListener;

use crate::config::{ConfigError, PortRange, PortSetting, WorldSpec, WorldsStore};
use crate::lifecycle::LockGuard;

#[derive(Debug, Error)]
pub enum PortError {
    #[error("no free port left in {first}-{last}")]
    Exhausted { first: u16, last: u16 },

    #[error("failed to persist port: {0}")]
    Store(#[from] ConfigError),
}

/// Hands out ports from a configured range.
#[derive(Debug, Clone)]
pub struct PortAllocator {
    range: PortRange,
    probe_host: IpAddr,
}

impl PortAllocator {
    pub fn new(range: PortRange) -> Self {
        Self {
            range,
            probe_host: IpAddr::V4(Ipv4Addr::UNSPECIFIED),
        }
    }

    /// Address used for the bind probe (all interfaces by default).
    pub fn with_probe_host(mut self, host: IpAddr) -> Self {
        self.probe_host = host;
        self
    }

    pub fn range(&self) -> PortRange {
        self.range
    }

    /// Port the world should listen on.
    ///
    /// `claimed` holds ports of running worlds that `worlds.conf` does not
    /// pin, e.g. from the runtime registry.
    pub async fn allocate(
        &self,
        world: &WorldSpec,
        store: &mut WorldsStore,
        claimed: &HashSet<u16>,
        _guard: &LockGuard,
    ) -> Result<u16, PortError> {
        if let PortSetting::Fixed(port) = world.port {
            return Ok(port);
        }

        store.reload()?;
        let mut taken: HashSet<u16> = store.claimed_ports(&world.name).into_iter().collect();
        taken.extend(claimed.iter().copied());

        if let Some(PortSetting::Fixed(previous)) = store.port_of(&world.name) {
            if !taken.contains(&previous) && self.probe(previous).await {
                tracing::debug!(world = %world.name, port = previous, "Reusing persisted port");
                return Ok(previous);
            }
            tracing::warn!(world = %world.name, port = previous, "Persisted port is no longer free");
        }

        for port in self.range.ports() {
            if taken.contains(&port) {
                continue;
            }
            if !self.probe(port).await {
                tracing::debug!(port, "Port busy outside the manager, skipping");
                continue;
            }
            store.set_port(&world.name, port)?;
            tracing::info!(world = %world.name, port, "Allocated port");
            return Ok(port);
        }

        Err(PortError::Exhausted {
            first: self.range.first,
            last: self.range.last,
        })
    }

    /// True if nothing is bound to `port` right now.
    pub async fn probe(&self, port: u16) -> bool {
        TcpListener::bind((self.probe_host, port)).await.is_ok()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::LockTimeout;
    use crate::lifecycle::InstanceLock;
    use std::fs;
    use std::path::Path;

    fn world(name: &str, port: PortSetting) -> WorldSpec {
        WorldSpec {
            name: name.to_string(),
            port,
            stop_timeout: 10,
            stop_message: String::new(),
            stop_delay: 0,
            server: "vanilla".to_string(),
        }
    }

    fn store(dir: &Path, content: &str) -> WorldsStore {
        let path = dir.join("worlds.conf");
        fs::write(&path, content).unwrap();
        WorldsStore::open(&path).unwrap()
    }

    fn allocator(first: u16, last: u16) -> PortAllocator {
        PortAllocator::new(PortRange { first, last })
    }

    #[tokio::test]
    async fn test_fixed_port_is_returned_unchanged() {
        let dir = tempfile::tempdir().unwrap();
        let lock = InstanceLock::new(dir.path().join("emsm.lock"));
        let guard = lock.acquire(LockTimeout::Forever).await.unwrap();
        let mut store = store(dir.path(), "[bar]\nport = 25565\n");

        let port = allocator(41100, 41110)
            .allocate(&world("bar", PortSetting::Fixed(25565)), &mut store, &HashSet::new(), &guard)
            .await
            .unwrap();
        assert_eq!(port, 25565);
        assert_eq!(
            fs::read_to_string(dir.path().join("worlds.conf")).unwrap(),
            "[bar]\nport = 25565\n"
        );
    }

    #[tokio::test]
    async fn test_auto_port_is_persisted_and_stable() {
        let dir = tempfile::tempdir().unwrap();
        let lock = InstanceLock::new(dir.path().join("emsm.lock"));
        let guard = lock.acquire(LockTimeout::Forever).await.unwrap();
        let mut store = store(dir.path(), "[DEFAULT]\nport = <auto>\n\n[foo]\n");
        let foo = world("foo", PortSetting::Auto);
        let allocator = allocator(41120, 41130);

        let first = allocator.allocate(&foo, &mut store, &HashSet::new(), &guard).await.unwrap();
        assert!(allocator.range().ports().contains(&first));
        assert_eq!(store.port_of("foo"), Some(PortSetting::Fixed(first)));

        let second = allocator.allocate(&foo, &mut store, &HashSet::new(), &guard).await.unwrap();
        assert_eq!(first, second);
    }

    #[tokio::test]
    async fn test_skips_claimed_and_bound_ports() {
        let dir = tempfile::tempdir().unwrap();
        let lock = InstanceLock::new(dir.path().join("emsm.lock"));
        let guard = lock.acquire(LockTimeout::Forever).await.unwrap();
        let mut store = store(
            dir.path(),
            "[DEFAULT]\nport = <auto>\n\n[foo]\n\n[bar]\nport = 41140\n",
        );

        // Something outside the manager holds 41141, the registry holds 41142.
        let _external = std::net::TcpListener::bind(("0.0.0.0", 41141)).unwrap();
        let claimed = HashSet::from([41142]);

        let port = allocator(41140, 41150)
            .allocate(&world("foo", PortSetting::Auto), &mut store, &claimed, &guard)
            .await
            .unwrap();
        assert_eq!(port, 41143);
    }

    #[tokio::test]
    async fn test_exhausted_range() {
        let dir = tempfile::tempdir().unwrap();
        let lock = InstanceLock::new(dir.path().join("emsm.lock"));
        let guard = lock.acquire(LockTimeout::Forever).await.unwrap();
        let mut store = store(dir.path(), "[foo]\nport = <auto>\n\n[bar]\nport = 41160\n");

        let err = allocator(41160, 41160)
            .allocate(&world("foo", PortSetting::Auto), &mut store, &HashSet::new(), &guard)
            .await
            .unwrap_err();
        assert!(matches!(err, PortError::Exhausted { first: 41160, last: 41160 }));
    }

    #[tokio::test]
    async fn test_concurrent_allocations_are_unique() {
        const WORLDS: usize = 8;
        let dir = tempfile::tempdir().unwrap();
        let mut content = String::from("[DEFAULT]\nport = <auto>\n");
        for i in 0..WORLDS {
            content.push_str(&format!("\n[world{}]\n", i));
        }
        fs::write(dir.path().join("worlds.conf"), content).unwrap();

        let mut tasks = Vec::new();
        for i in 0..WORLDS {
            let root = dir.path().to_path_buf();
            tasks.push(tokio::spawn(async move {
                let lock = InstanceLock::new(root.join("emsm.lock"));
                let guard = lock.acquire(LockTimeout::Forever).await.unwrap();
                let mut store = WorldsStore::open(&root.join("worlds.conf")).unwrap();
                allocator(41170, 41199)
                    .allocate(
                        &world(&format!("world{}", i), PortSetting::Auto),
                        &mut store,
                        &HashSet::new(),
                        &guard,
                    )
                    .await
                    .unwrap()
            }));
        }

        let mut ports = HashSet::new();
        for task in tasks {
            ports.insert(task.await.unwrap());
        }
        assert_eq!(ports.len(), WORLDS);
    }
}
