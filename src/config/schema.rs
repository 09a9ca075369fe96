//! Configuration schema definitions.
//!
//! Typed, fully resolved records produced from the three configuration
//! files. Every record is immutable once loaded; runtime state lives in
//! `process::state`.

use std::collections::BTreeMap;
use std::fmt;
use std::ops::RangeInclusive;
use std::time::Duration;

use serde::{Serialize, Serializer};

use crate::config::template::StartTemplate;

/// Literal used in `worlds.conf` for automatic port selection.
pub const AUTO_PORT: &str = "<auto>";

/// Message broadcast to worlds before a server update when `main.conf`
/// does not set `[server] update_message`.
pub const DEFAULT_UPDATE_MESSAGE: &str = "The server is going down for an update.";

/// Global settings from the `[emsm]` section of `main.conf`.
#[derive(Debug, Clone, Serialize)]
pub struct GlobalSettings {
    /// User the manager runs as.
    pub user: String,

    /// Log verbosity.
    pub loglevel: LogLevel,

    /// Maximum wait for the instance lock.
    pub timeout: LockTimeout,

    /// Ports scanned for worlds with `port = <auto>`.
    pub port_range: PortRange,

    /// Every other section of `main.conf`, kept raw.
    pub plugins: BTreeMap<String, BTreeMap<String, String>>,
}

impl Default for GlobalSettings {
    fn default() -> Self {
        Self {
            user: "minecraft".to_string(),
            loglevel: LogLevel::Warning,
            timeout: LockTimeout::Forever,
            port_range: PortRange::default(),
            plugins: BTreeMap::new(),
        }
    }
}

impl GlobalSettings {
    /// Message sent to players before their world is stopped for an update.
    pub fn update_message(&self) -> &str {
        self.plugins
            .get("server")
            .and_then(|section| section.get("update_message"))
            .map(String::as_str)
            .unwrap_or(DEFAULT_UPDATE_MESSAGE)
    }
}

/// Log levels as spelled in `main.conf`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "UPPERCASE")]
pub enum LogLevel {
    Debug,
    Info,
    Warning,
    Error,
    Critical,
}

impl LogLevel {
    /// Accepts the names used in `main.conf` as well as the tracing ones.
    pub fn parse(raw: &str) -> Option<Self> {
        match raw.trim().to_ascii_uppercase().as_str() {
            "TRACE" | "DEBUG" => Some(Self::Debug),
            "INFO" => Some(Self::Info),
            "WARN" | "WARNING" => Some(Self::Warning),
            "ERROR" => Some(Self::Error),
            "CRITICAL" | "FATAL" => Some(Self::Critical),
            _ => None,
        }
    }

    /// `EnvFilter` directive for this level.
    pub fn as_directive(&self) -> &'static str {
        match self {
            Self::Debug => "debug",
            Self::Info => "info",
            Self::Warning => "warn",
            Self::Error | Self::Critical => "error",
        }
    }
}

/// Lock acquisition bound (`timeout` in `main.conf`).
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LockTimeout {
    /// `-1`: block until the lock is free.
    Forever,
    /// `0` tries once, any other value bounds the wait in seconds.
    Seconds(u64),
}

impl LockTimeout {
    pub fn from_secs(raw: i64) -> Option<Self> {
        match raw {
            -1 => Some(Self::Forever),
            secs if secs >= 0 => Some(Self::Seconds(secs as u64)),
            _ => None,
        }
    }

    pub fn as_duration(&self) -> Option<Duration> {
        match self {
            Self::Forever => None,
            Self::Seconds(secs) => Some(Duration::from_secs(*secs)),
        }
    }
}

impl Serialize for LockTimeout {
    fn serialize<S: Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        match self {
            Self::Forever => serializer.serialize_i64(-1),
            Self::Seconds(secs) => serializer.serialize_u64(*secs),
        }
    }
}

/// Inclusive range of ports for automatic allocation.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub struct PortRange {
    pub first: u16,
    pub last: u16,
}

impl Default for PortRange {
    fn default() -> Self {
        Self {
            first: 25565,
            last: 25665,
        }
    }
}

impl PortRange {
    /// Parse `FIRST-LAST`.
    pub fn parse(raw: &str) -> Option<Self> {
        let (first, last) = raw.split_once('-')?;
        let first: u16 = first.trim().parse().ok()?;
        let last: u16 = last.trim().parse().ok()?;
        (first >= 1 && first <= last).then_some(Self { first, last })
    }

    pub fn ports(&self) -> RangeInclusive<u16> {
        self.first..=self.last
    }
}

impl fmt::Display for PortRange {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}-{}", self.first, self.last)
    }
}

/// A server executable definition from `server.conf`.
#[derive(Debug, Clone, Serialize)]
pub struct ServerType {
    /// Section name, referenced by `worlds.conf`.
    pub name: String,

    /// File name of the executable inside the server directory.
    #[serde(rename = "server")]
    pub executable: String,

    /// Where the executable can be downloaded from.
    pub url: String,

    /// Command used to launch a world.
    pub start_cmd: StartTemplate,
}

impl Serialize for StartTemplate {
    fn serialize<S: Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        serializer.serialize_str(self.source())
    }
}

/// Port setting of a world.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum PortSetting {
    Auto,
    Fixed(u16),
}

impl PortSetting {
    pub fn fixed(&self) -> Option<u16> {
        match self {
            Self::Auto => None,
            Self::Fixed(port) => Some(*port),
        }
    }
}

impl fmt::Display for PortSetting {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Auto => f.write_str(AUTO_PORT),
            Self::Fixed(port) => write!(f, "{}", port),
        }
    }
}

impl Serialize for PortSetting {
    fn serialize<S: Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        match self {
            Self::Auto => serializer.serialize_str(AUTO_PORT),
            Self::Fixed(port) => serializer.serialize_u16(*port),
        }
    }
}

/// A world definition from `worlds.conf`, DEFAULT already merged in.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct WorldSpec {
    pub name: String,
    pub port: PortSetting,
    /// Seconds to wait for a voluntary exit after the stop command.
    pub stop_timeout: u64,
    /// Broadcast to players before stopping, may span several lines.
    pub stop_message: String,
    /// Seconds between the stop message and the stop command.
    pub stop_delay: u64,
    /// Name of the `ServerType` this world runs.
    pub server: String,
}

impl WorldSpec {
    pub fn stop_timeout(&self) -> Duration {
        Duration::from_secs(self.stop_timeout)
    }

    pub fn stop_delay(&self) -> Duration {
        Duration::from_secs(self.stop_delay)
    }
}
