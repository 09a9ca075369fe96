//! World lifecycle orchestration.
//!
//! # Data Flow
//! ```text
//! start(world):
//!     supervisor mutex → instance lock
//!     → fresh configuration read (world + server)
//!     → registry check (not served by another manager)
//!     → port allocation (worlds.conf) → server.properties
//!     → supervisor start (one download + retry if the executable is missing)
//!     → registry record → lock released
//!
//! stop(world):
//!     supervisor mutex → graceful stop (no instance lock held)
//!     → instance lock → registry entry removed
//!
//! stop(orphaned world):
//!     SIGTERM to its process group → wait stop_timeout → SIGKILL
//!     → instance lock → registry entry removed
//! ```
//!
//! # Design Decisions
//! - One supervisor per world, each behind its own mutex; worlds never wait
//!   on each other except for the short instance-lock sections
//! - Status reads go through watch channels and never block on a stop
//! - Batch operations report every world, one failure never aborts the rest

pub mod monitor;
pub mod properties;
pub mod registry;
pub mod report;

use std::collections::HashSet;
use std::fs;
use std::io;
use std::path::PathBuf;
use std::sync::Arc;
use std::time::{Duration, Instant};

use dashmap::DashMap;
use futures_util::future::join_all;
use thiserror::Error;
use tokio::sync::{watch, Mutex};

use crate::config::loader::read_document;
use crate::config::store::write_document;
use crate::config::{
    load_config, ConfigError, Configuration, InstancePaths, PortRange, ServerType, WorldSpec,
    WorldsStore,
};
use crate::lifecycle::{InstanceLock, LockError};
use crate::net::{PortAllocator, PortError};
use crate::process::control::{signal_group, wait_for_exit};
use crate::process::state::unix_now;
use crate::process::supervisor::{DEFAULT_STARTUP_GRACE, SAY_COMMAND};
use crate::process::{
    CrashReport, LaunchError, LaunchPlan, Launcher, ProcessSupervisor, RuntimeWorldState,
    SupervisorError, WorldPhase,
};
use crate::provision::{ExecutableFetcher, FetchError};

pub use monitor::CrashMonitor;
pub use registry::{RegistryEntry, RegistryError, RuntimeRegistry};
pub use report::{BatchReport, Outcome, UninstallReport, UpdateReport, WorldReport, WorldStatus};

#[derive(Debug, Error)]
pub enum WorldError {
    #[error("unknown world '{0}'")]
    UnknownWorld(String),

    #[error("unknown server '{0}'")]
    UnknownServer(String),

    #[error("world '{world}' is already running (pid {pid}) under manager {manager_pid}")]
    AlreadyRunning {
        world: String,
        pid: u32,
        manager_pid: u32,
    },

    #[error("world '{world}' is served by manager {manager_pid}")]
    ManagedElsewhere { world: String, manager_pid: u32 },

    #[error("world '{world}' still runs as pid {pid} but its manager {manager_pid} is gone, stop it first")]
    Orphaned {
        world: String,
        pid: u32,
        manager_pid: u32,
    },

    #[error("port {port} of world '{world}' is held by running world '{holder}'")]
    PortInUse {
        world: String,
        port: u16,
        holder: String,
    },

    #[error("server '{server}' is used by running worlds: {}", .worlds.join(", "))]
    ServerInUse { server: String, worlds: Vec<String> },

    #[error("server '{server}' cannot be replaced by '{replacement}'")]
    InvalidReplacement { server: String, replacement: String },

    #[error(transparent)]
    Config(#[from] ConfigError),

    #[error(transparent)]
    Lock(#[from] LockError),

    #[error(transparent)]
    Port(#[from] PortError),

    #[error(transparent)]
    Supervisor(#[from] SupervisorError),

    #[error(transparent)]
    Fetch(#[from] FetchError),

    #[error(transparent)]
    Registry(#[from] RegistryError),

    #[error("world '{world}': writing server.properties failed: {source}")]
    Properties {
        world: String,
        #[source]
        source: io::Error,
    },

    #[error("world '{world}': signalling pid {pid} failed: {source}")]
    Signal {
        world: String,
        pid: u32,
        #[source]
        source: io::Error,
    },

    #[error("{}: {source}", path.display())]
    Io {
        path: PathBuf,
        #[source]
        source: io::Error,
    },
}

struct WorldSlot<L: Launcher> {
    supervisor: Arc<Mutex<ProcessSupervisor<L>>>,
    state: watch::Receiver<RuntimeWorldState>,
}

impl<L: Launcher> Clone for WorldSlot<L> {
    fn clone(&self) -> Self {
        Self {
            supervisor: Arc::clone(&self.supervisor),
            state: self.state.clone(),
        }
    }
}

/// Owns the supervisors of every world this process serves.
pub struct WorldManager<L: Launcher, F: ExecutableFetcher> {
    config: Configuration,
    launcher: Arc<L>,
    fetcher: F,
    lock: InstanceLock,
    registry: RuntimeRegistry,
    slots: DashMap<String, WorldSlot<L>>,
    startup_grace: Duration,
}

impl<L: Launcher, F: ExecutableFetcher> WorldManager<L, F> {
    pub fn new(config: Configuration, launcher: L, fetcher: F) -> Self {
        let lock = InstanceLock::new(config.paths.lock_file());
        let registry = RuntimeRegistry::new(config.paths.state_file());
        Self {
            config,
            launcher: Arc::new(launcher),
            fetcher,
            lock,
            registry,
            slots: DashMap::new(),
            startup_grace: DEFAULT_STARTUP_GRACE,
        }
    }

    pub fn with_startup_grace(mut self, grace: Duration) -> Self {
        self.startup_grace = grace;
        self
    }

    /// Configuration as loaded at construction.
    pub fn config(&self) -> &Configuration {
        &self.config
    }

    pub fn paths(&self) -> &InstancePaths {
        &self.config.paths
    }

    pub fn registry(&self) -> &RuntimeRegistry {
        &self.registry
    }

    pub async fn start(&self, name: &str) -> Result<Outcome, WorldError> {
        let slot = self.slot(name)?;
        let mut supervisor = slot.supervisor.lock().await;
        self.reap(name, &mut supervisor).await;
        if supervisor.phase() != WorldPhase::Stopped {
            return Err(SupervisorError::InvalidTransition {
                world: name.to_string(),
                action: "start",
                phase: supervisor.phase(),
            }
            .into());
        }

        let guard = self.lock.acquire(self.config.global.timeout).await?;
        let (world, server, port_range) = self.fresh_definition(name)?;

        let registered = self.registry.load()?;
        if let Some(entry) = registered.get(name) {
            if entry.is_orphaned() {
                return Err(WorldError::Orphaned {
                    world: name.to_string(),
                    pid: entry.pid,
                    manager_pid: entry.manager_pid,
                });
            }
            if !entry.is_owned_by_this_process() {
                return Err(WorldError::AlreadyRunning {
                    world: name.to_string(),
                    pid: entry.pid,
                    manager_pid: entry.manager_pid,
                });
            }
        }
        let claimed: HashSet<u16> = registered
            .iter()
            .filter(|(other, _)| other.as_str() != name)
            .map(|(_, entry)| entry.port)
            .collect();

        let mut store = WorldsStore::open(&self.config.paths.worlds_conf())?;
        let port = PortAllocator::new(port_range)
            .allocate(&world, &mut store, &claimed, &guard)
            .await?;
        // Fixed ports skip the allocator's checks.
        if let Some((holder, _)) = registered
            .iter()
            .find(|(other, entry)| other.as_str() != name && entry.port == port)
        {
            return Err(WorldError::PortInUse {
                world: name.to_string(),
                port,
                holder: holder.clone(),
            });
        }

        let world_dir = self.config.paths.world_dir(name);
        properties::write_server_port(&world_dir, port).map_err(|source| {
            WorldError::Properties {
                world: name.to_string(),
                source,
            }
        })?;

        supervisor.reconfigure(world)?;
        let plan = LaunchPlan {
            executable: self.config.paths.executable(&server.executable),
            template: server.start_cmd.clone(),
            cwd: world_dir,
            port,
        };
        match supervisor.start(&plan).await {
            Ok(()) => {}
            Err(SupervisorError::Launch(LaunchError::ExecutableMissing { path })) => {
                tracing::info!(
                    world = %name,
                    server = %server.name,
                    path = %path.display(),
                    "Server executable missing, downloading"
                );
                self.fetcher.fetch(&server, &plan.executable).await?;
                supervisor.start(&plan).await?;
            }
            Err(e) => return Err(e.into()),
        }

        let pid = supervisor.state().pid;
        let entry = RegistryEntry {
            pid: pid.unwrap_or_default(),
            port,
            manager_pid: std::process::id(),
            started_at: unix_now(),
        };
        if let Err(e) = self.registry.record(name, entry, &guard) {
            tracing::error!(world = %name, error = %e, "World is running but could not be registered");
            return Err(e.into());
        }
        drop(guard);

        Ok(Outcome::Started { port, pid })
    }

    /// Stop a world, killing it if it outlives its stop_timeout. Orphaned
    /// worlds are terminated through signals.
    pub async fn stop(&self, name: &str) -> Result<Outcome, WorldError> {
        self.stop_with(name, true).await
    }

    /// Like `stop`, but unless `force` is set a world that outlives its
    /// stop_timeout keeps running and the stop fails.
    pub async fn stop_with(&self, name: &str, force: bool) -> Result<Outcome, WorldError> {
        let slot = match self.existing_slot(name) {
            Ok(Some(slot)) => slot,
            Ok(None) => return Ok(Outcome::NotRunning),
            Err(WorldError::Orphaned { .. }) => return self.stop_orphan(name, force).await,
            Err(e) => return Err(e),
        };
        let mut supervisor = slot.supervisor.lock().await;
        if self.reap(name, &mut supervisor).await.is_some()
            || supervisor.phase() != WorldPhase::Running
        {
            return Ok(Outcome::NotRunning);
        }

        let outcome = supervisor.stop_with(force).await?;
        // Still holding the supervisor: a concurrent start cannot register
        // before this entry is gone.
        self.deregister(name).await;
        Ok(outcome.into())
    }

    pub async fn restart(&self, name: &str) -> Result<Outcome, WorldError> {
        self.stop(name).await?;
        match self.start(name).await? {
            Outcome::Started { port, pid } => Ok(Outcome::Restarted { port, pid }),
            other => Ok(other),
        }
    }

    pub async fn send_command(&self, name: &str, line: &str) -> Result<Outcome, WorldError> {
        let not_running = || {
            WorldError::Supervisor(SupervisorError::InvalidTransition {
                world: name.to_string(),
                action: "receive commands",
                phase: WorldPhase::Stopped,
            })
        };
        let Some(slot) = self.existing_slot(name)? else {
            return Err(not_running());
        };
        let mut supervisor = slot.supervisor.lock().await;
        self.reap(name, &mut supervisor).await;
        supervisor.send_command(line).await?;
        Ok(Outcome::CommandSent)
    }

    pub fn status(&self, name: &str) -> Result<WorldStatus, WorldError> {
        let mut registered = self.registry.load()?;
        let local = self.local_state(name)?;
        Ok(WorldStatus::new(local, registered.remove(name)))
    }

    /// Status of every configured world.
    pub fn statuses(&self) -> Result<Vec<WorldStatus>, WorldError> {
        let mut registered = self.registry.load()?;
        self.config
            .world_names()
            .into_iter()
            .map(|name| -> Result<WorldStatus, WorldError> {
                Ok(WorldStatus::new(self.local_state(&name)?, registered.remove(&name)))
            })
            .collect()
    }

    pub async fn start_all(&self, names: &[String]) -> BatchReport {
        let results = join_all(names.iter().map(|name| self.start(name))).await;
        BatchReport::from_results(names, results)
    }

    pub async fn stop_all(&self, names: &[String]) -> BatchReport {
        let results = join_all(names.iter().map(|name| self.stop(name))).await;
        BatchReport::from_results(names, results)
    }

    pub async fn restart_all(&self, names: &[String]) -> BatchReport {
        let results = join_all(names.iter().map(|name| self.restart(name))).await;
        BatchReport::from_results(names, results)
    }

    /// Worlds with a live process supervised by this manager.
    pub fn supervised_worlds(&self) -> Vec<String> {
        let mut names: Vec<String> = self
            .slots
            .iter()
            .filter(|entry| entry.value().state.borrow().phase.has_process())
            .map(|entry| entry.key().clone())
            .collect();
        names.sort();
        names
    }

    /// Stop the running worlds using `server_name`, replace its executable
    /// and start again the worlds this manager supervised.
    ///
    /// Without `force` a world that will not stop is left running and the
    /// download is skipped. Worlds served by another live manager also
    /// block the download.
    pub async fn update_server(
        &self,
        server_name: &str,
        force: bool,
    ) -> Result<UpdateReport, WorldError> {
        let fresh = load_config(&self.config.paths)?;
        let server = fresh
            .server(server_name)
            .cloned()
            .ok_or_else(|| WorldError::UnknownServer(server_name.to_string()))?;
        let message = fresh.global.update_message().to_string();

        let supervised: HashSet<String> = self.supervised_worlds().into_iter().collect();
        let registered = self.registry.load()?;
        let affected: Vec<String> = fresh
            .worlds_using(server_name)
            .into_iter()
            .filter(|world| supervised.contains(world) || registered.contains_key(world))
            .collect();
        tracing::info!(server = %server_name, worlds = ?affected, force, "Updating server");

        let results = join_all(
            affected
                .iter()
                .map(|world| self.stop_for_update(world, &message, force)),
        )
        .await;
        let stopped = BatchReport::from_results(&affected, results);

        let download = if stopped.is_success() {
            Some(self.download(&server).await)
        } else {
            tracing::error!(server = %server_name, "A world did not stop, skipping the download");
            None
        };

        let to_restart: Vec<String> = stopped
            .reports
            .iter()
            .filter(|r| matches!(r.result, Ok(Outcome::Stopped { .. })))
            .filter(|r| supervised.contains(&r.world))
            .map(|r| r.world.clone())
            .collect();
        let restarted = self.start_all(&to_restart).await;

        Ok(UpdateReport {
            server: server_name.to_string(),
            stopped,
            download,
            restarted,
        })
    }

    /// Remove a server type: its worlds are reassigned to `replacement` in
    /// `worlds.conf`, its section leaves `server.conf` and its executable is
    /// deleted unless another server type shares it. Refused while any world
    /// using the server runs.
    pub async fn uninstall_server(
        &self,
        server_name: &str,
        replacement: &str,
    ) -> Result<UninstallReport, WorldError> {
        let invalid = || WorldError::InvalidReplacement {
            server: server_name.to_string(),
            replacement: replacement.to_string(),
        };
        if server_name == replacement {
            return Err(invalid());
        }

        let _guard = self.lock.acquire(self.config.global.timeout).await?;
        let fresh = load_config(&self.config.paths)?;
        let server = fresh
            .server(server_name)
            .cloned()
            .ok_or_else(|| WorldError::UnknownServer(server_name.to_string()))?;
        if fresh.server(replacement).is_none() {
            return Err(invalid());
        }

        let worlds = fresh.worlds_using(server_name);
        let registered = self.registry.load()?;
        let running: Vec<String> = worlds
            .iter()
            .filter(|world| registered.contains_key(*world) || self.has_local_process(world))
            .cloned()
            .collect();
        if !running.is_empty() {
            return Err(WorldError::ServerInUse {
                server: server_name.to_string(),
                worlds: running,
            });
        }

        let mut store = WorldsStore::open(&self.config.paths.worlds_conf())?;
        store.replace_server(server_name, replacement)?;

        let server_conf = self.config.paths.server_conf();
        let mut doc = read_document(&server_conf)?;
        doc.remove_section(server_name);
        write_document(&server_conf, &doc)?;

        let shared = fresh
            .servers
            .values()
            .any(|other| other.name != server.name && other.executable == server.executable);
        let executable = self.config.paths.executable(&server.executable);
        let executable_removed = if shared {
            false
        } else {
            match fs::remove_file(&executable) {
                Ok(()) => true,
                Err(e) if e.kind() == io::ErrorKind::NotFound => false,
                Err(source) => {
                    return Err(WorldError::Io {
                        path: executable,
                        source,
                    })
                }
            }
        };

        tracing::info!(
            server = %server_name,
            replacement = %replacement,
            worlds = ?worlds,
            executable_removed,
            "Server uninstalled"
        );
        Ok(UninstallReport {
            server: server_name.to_string(),
            replacement: replacement.to_string(),
            worlds,
            executable_removed,
        })
    }

    /// Collect unexpected exits, settle the worlds and drop their registry
    /// entries. Worlds with an operation in flight are skipped.
    pub async fn poll_crashes(&self) -> Vec<CrashReport> {
        let slots: Vec<(String, WorldSlot<L>)> = self
            .slots
            .iter()
            .map(|entry| (entry.key().clone(), entry.value().clone()))
            .collect();

        let mut reports = Vec::new();
        for (name, slot) in slots {
            let Ok(mut supervisor) = slot.supervisor.try_lock() else {
                continue;
            };
            if let Some(report) = self.reap(&name, &mut supervisor).await {
                reports.push(report);
            }
        }
        reports
    }

    async fn stop_for_update(
        &self,
        world: &str,
        message: &str,
        force: bool,
    ) -> Result<Outcome, WorldError> {
        if self.has_local_process(world) {
            let say = format!("{} {}", SAY_COMMAND, message);
            if let Err(e) = self.send_command(world, &say).await {
                tracing::warn!(world = %world, error = %e, "Could not broadcast the update message");
            }
        }
        self.stop_with(world, force).await
    }

    /// Terminate a world whose manager died and drop its registry entry.
    async fn stop_orphan(&self, name: &str, force: bool) -> Result<Outcome, WorldError> {
        let world = self.known_world(name)?;
        let Some(entry) = self
            .registry
            .load()?
            .remove(name)
            .filter(RegistryEntry::is_orphaned)
        else {
            return Ok(Outcome::NotRunning);
        };
        tracing::warn!(
            world = %name,
            pid = entry.pid,
            manager_pid = entry.manager_pid,
            "Stopping orphaned world"
        );

        let signal = |sig| {
            signal_group(entry.pid, sig).map_err(|source| WorldError::Signal {
                world: name.to_string(),
                pid: entry.pid,
                source,
            })
        };
        let started = Instant::now();
        signal(libc::SIGTERM)?;
        let forced = if wait_for_exit(entry.pid, world.stop_timeout()).await {
            false
        } else if force {
            tracing::warn!(world = %name, pid = entry.pid, "GracefulStopTimeout: killing orphaned server");
            signal(libc::SIGKILL)?;
            true
        } else {
            return Err(SupervisorError::StopTimedOut {
                world: name.to_string(),
                stop_timeout: world.stop_timeout,
            }
            .into());
        };

        self.deregister(name).await;
        Ok(Outcome::Stopped {
            forced,
            elapsed_ms: started.elapsed().as_millis() as u64,
        })
    }

    async fn download(&self, server: &ServerType) -> Result<PathBuf, WorldError> {
        let _guard = self.lock.acquire(self.config.global.timeout).await?;
        let target = self.config.paths.executable(&server.executable);
        Ok(self.fetcher.fetch(server, &target).await?)
    }

    /// Observe an unexpected exit, settle it and deregister the world.
    async fn reap(
        &self,
        name: &str,
        supervisor: &mut ProcessSupervisor<L>,
    ) -> Option<CrashReport> {
        let report = supervisor.poll();
        if supervisor.phase() == WorldPhase::Crashed {
            if let Err(e) = supervisor.settle() {
                tracing::error!(world = %name, error = %e, "Could not settle crashed world");
            }
            self.deregister(name).await;
        }
        report
    }

    async fn deregister(&self, name: &str) {
        match self.lock.acquire(self.config.global.timeout).await {
            Ok(guard) => {
                if let Err(e) = self.registry.remove(name, &guard) {
                    tracing::warn!(world = %name, error = %e, "Could not remove registry entry");
                }
            }
            Err(e) => {
                tracing::warn!(
                    world = %name,
                    error = %e,
                    "Registry entry left behind, it is pruned once the pid is gone"
                );
            }
        }
    }

    fn slot(&self, name: &str) -> Result<WorldSlot<L>, WorldError> {
        if let Some(slot) = self.slots.get(name) {
            return Ok(slot.value().clone());
        }
        let world = self.known_world(name)?;
        let slot = self
            .slots
            .entry(name.to_string())
            .or_insert_with(|| self.new_slot(world))
            .value()
            .clone();
        Ok(slot)
    }

    fn has_local_process(&self, name: &str) -> bool {
        self.slots
            .get(name)
            .is_some_and(|slot| slot.state.borrow().phase.has_process())
    }

    /// The world's slot if this manager ever touched it. Fails for worlds
    /// another manager is serving or left orphaned.
    fn existing_slot(&self, name: &str) -> Result<Option<WorldSlot<L>>, WorldError> {
        let slot = self.slots.get(name).map(|slot| slot.value().clone());
        match &slot {
            Some(slot) if slot.state.borrow().phase.has_process() => return Ok(Some(slot.clone())),
            Some(_) => {}
            None => {
                self.known_world(name)?;
            }
        }
        if let Some(entry) = self.registry.load()?.get(name) {
            if entry.is_orphaned() {
                return Err(WorldError::Orphaned {
                    world: name.to_string(),
                    pid: entry.pid,
                    manager_pid: entry.manager_pid,
                });
            }
            if !entry.is_owned_by_this_process() {
                return Err(WorldError::ManagedElsewhere {
                    world: name.to_string(),
                    manager_pid: entry.manager_pid,
                });
            }
        }
        Ok(slot)
    }

    fn new_slot(&self, world: WorldSpec) -> WorldSlot<L> {
        let supervisor = ProcessSupervisor::new(world, Arc::clone(&self.launcher))
            .with_startup_grace(self.startup_grace);
        WorldSlot {
            state: supervisor.subscribe(),
            supervisor: Arc::new(Mutex::new(supervisor)),
        }
    }

    fn local_state(&self, name: &str) -> Result<RuntimeWorldState, WorldError> {
        if let Some(slot) = self.slots.get(name) {
            return Ok(slot.state.borrow().clone());
        }
        self.known_world(name)?;
        Ok(RuntimeWorldState::new(name))
    }

    /// Worlds added to `worlds.conf` after startup are known too.
    fn known_world(&self, name: &str) -> Result<WorldSpec, WorldError> {
        if let Some(world) = self.config.world(name) {
            return Ok(world.clone());
        }
        let Configuration {
            mut worlds,
            failures,
            ..
        } = load_config(&self.config.paths)?;
        worlds
            .remove(name)
            .ok_or_else(|| section_failure(failures, name))
    }

    /// World and server definitions as they are on disk right now.
    fn fresh_definition(&self, name: &str) -> Result<(WorldSpec, ServerType, PortRange), WorldError> {
        let Configuration {
            global,
            mut worlds,
            servers,
            failures,
            ..
        } = load_config(&self.config.paths)?;

        let Some(world) = worlds.remove(name) else {
            return Err(section_failure(failures, name));
        };
        let server = servers
            .get(&world.server)
            .cloned()
            .ok_or_else(|| WorldError::UnknownServer(world.server.clone()))?;
        Ok((world, server, global.port_range))
    }
}

/// Why `name` did not resolve: its rejected section, or that it does not exist.
fn section_failure(failures: Vec<ConfigError>, name: &str) -> WorldError {
    failures
        .into_iter()
        .find(|f| f.section() == Some(name))
        .map(WorldError::Config)
        .unwrap_or_else(|| WorldError::UnknownWorld(name.to_string()))
}
