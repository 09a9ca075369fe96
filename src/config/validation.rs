//! Configuration resolution and validation.
//!
//! # Responsibilities
//! - Merge every section over `DEFAULT` (two passes, no lookup chains)
//! - Coerce raw strings into typed records
//! - Check referential integrity (worlds reference declared servers)
//! - Report lints that do not block loading
//!
//! # Design Decisions
//! - One failure per offending section, the other sections still resolve
//! - Pure functions over `IniDocument`; nothing here touches the disk

use std::collections::BTreeMap;
use std::fmt;
use std::path::PathBuf;

use thiserror::Error;
use url::Url;

use crate::config::ini::{IniDocument, IniError, DEFAULT_SECTION};
use crate::config::schema::{
    GlobalSettings, LockTimeout, LogLevel, PortRange, PortSetting, ServerType, WorldSpec, AUTO_PORT,
};
use crate::config::template::StartTemplate;

/// Section of `main.conf` holding the global settings.
pub const GLOBAL_SECTION: &str = "emsm";

/// Time assumed for the stop command to reach the server console.
pub const COMMAND_LATENCY_SECS: u64 = 1;

const SERVER_KEYS: [&str; 3] = ["server", "url", "start_cmd"];
const WORLD_KEYS: [&str; 5] = ["port", "stop_timeout", "stop_message", "stop_delay", "server"];

/// Errors raised while loading configuration.
#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("failed to access {path}: {source}")]
    Io {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    #[error("{path}: {source}")]
    Syntax {
        path: PathBuf,
        #[source]
        source: IniError,
    },

    #[error("[{section}] missing required key '{key}'")]
    MissingField { section: String, key: String },

    #[error("[{section}] invalid value '{value}' for '{key}': {reason}")]
    InvalidValue {
        section: String,
        key: String,
        value: String,
        reason: String,
    },

    #[error("[{section}] invalid start_cmd: {reason}")]
    TemplateError { section: String, reason: String },

    #[error("[{world}] unknown server '{server}'")]
    UnknownServerReference { world: String, server: String },
}

impl ConfigError {
    /// Section the error belongs to, if it concerns a single section.
    pub fn section(&self) -> Option<&str> {
        match self {
            Self::Io { .. } | Self::Syntax { .. } => None,
            Self::MissingField { section, .. }
            | Self::InvalidValue { section, .. }
            | Self::TemplateError { section, .. } => Some(section),
            Self::UnknownServerReference { world, .. } => Some(world),
        }
    }

    fn invalid(section: &str, key: &str, value: &str, reason: impl Into<String>) -> Self {
        Self::InvalidValue {
            section: section.to_string(),
            key: key.to_string(),
            value: value.to_string(),
            reason: reason.into(),
        }
    }
}

/// Problems worth reporting that do not prevent a world from loading.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ConfigWarning {
    /// The graceful-stop deadline leaves no time for the stop command.
    StopDelayExceedsTimeout {
        world: String,
        stop_delay: u64,
        stop_timeout: u64,
    },
    /// Several worlds are pinned to the same fixed port.
    SharedFixedPort { port: u16, worlds: Vec<String> },
}

impl fmt::Display for ConfigWarning {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::StopDelayExceedsTimeout {
                world,
                stop_delay,
                stop_timeout,
            } => write!(
                f,
                "[{}] stop_delay ({}s) + command latency ({}s) exceeds stop_timeout ({}s)",
                world, stop_delay, COMMAND_LATENCY_SECS, stop_timeout
            ),
            Self::SharedFixedPort { port, worlds } => {
                write!(f, "port {} is shared by worlds {}", port, worlds.join(", "))
            }
        }
    }
}

/// Records that resolved plus one error per section that did not.
#[derive(Debug)]
pub struct Resolved<T> {
    pub records: Vec<T>,
    pub failures: Vec<ConfigError>,
}

/// First pass copies `DEFAULT`, second pass overlays the section's own keys.
pub fn merge_section(doc: &IniDocument, section: &str) -> BTreeMap<String, String> {
    let mut merged: BTreeMap<String, String> = doc
        .entries(DEFAULT_SECTION)
        .into_iter()
        .map(|(k, v)| (k.to_string(), v.to_string()))
        .collect();
    if section != DEFAULT_SECTION {
        for (key, value) in doc.entries(section) {
            merged.insert(key.to_string(), value.to_string());
        }
    }
    merged
}

fn require<'a>(
    merged: &'a BTreeMap<String, String>,
    section: &str,
    key: &str,
) -> Result<&'a str, ConfigError> {
    merged
        .get(key)
        .map(String::as_str)
        .ok_or_else(|| ConfigError::MissingField {
            section: section.to_string(),
            key: key.to_string(),
        })
}

fn parse_seconds(section: &str, key: &str, raw: &str) -> Result<u64, ConfigError> {
    raw.trim()
        .parse::<u64>()
        .map_err(|_| ConfigError::invalid(section, key, raw, "expected a non-negative integer"))
}

/// Parse `<auto>` or a port number in 1..=65535.
pub fn parse_port(section: &str, raw: &str) -> Result<PortSetting, ConfigError> {
    let raw = raw.trim();
    if raw == AUTO_PORT {
        return Ok(PortSetting::Auto);
    }
    match raw.parse::<u16>() {
        Ok(port) if port >= 1 => Ok(PortSetting::Fixed(port)),
        _ => Err(ConfigError::invalid(
            section,
            "port",
            raw,
            format!("expected {} or an integer between 1 and 65535", AUTO_PORT),
        )),
    }
}

/// Resolve the `[emsm]` section and collect plugin sections of `main.conf`.
pub fn resolve_global(doc: &IniDocument) -> Result<GlobalSettings, ConfigError> {
    let mut settings = GlobalSettings::default();
    let merged = merge_section(doc, GLOBAL_SECTION);

    if let Some(user) = merged.get("user") {
        if user.trim().is_empty() {
            return Err(ConfigError::invalid(GLOBAL_SECTION, "user", user, "must not be empty"));
        }
        settings.user = user.trim().to_string();
    }
    if let Some(raw) = merged.get("loglevel") {
        settings.loglevel = LogLevel::parse(raw).ok_or_else(|| {
            ConfigError::invalid(GLOBAL_SECTION, "loglevel", raw, "unknown log level")
        })?;
    }
    if let Some(raw) = merged.get("timeout") {
        settings.timeout = raw
            .trim()
            .parse::<i64>()
            .ok()
            .and_then(LockTimeout::from_secs)
            .ok_or_else(|| {
                ConfigError::invalid(GLOBAL_SECTION, "timeout", raw, "expected -1 or seconds >= 0")
            })?;
    }
    if let Some(raw) = merged.get("port_range") {
        settings.port_range = PortRange::parse(raw).ok_or_else(|| {
            ConfigError::invalid(GLOBAL_SECTION, "port_range", raw, "expected FIRST-LAST")
        })?;
    }

    settings.plugins = doc
        .section_names()
        .into_iter()
        .filter(|name| *name != GLOBAL_SECTION)
        .map(|name| (name.to_string(), merge_section(doc, name)))
        .collect();

    Ok(settings)
}

/// Resolve one section of `server.conf`.
pub fn resolve_server(doc: &IniDocument, name: &str) -> Result<ServerType, ConfigError> {
    let merged = merge_section(doc, name);
    for key in SERVER_KEYS {
        require(&merged, name, key)?;
    }

    let executable = require(&merged, name, "server")?.trim();
    if executable.is_empty() || executable.contains('/') {
        return Err(ConfigError::invalid(
            name,
            "server",
            executable,
            "expected a plain file name",
        ));
    }

    let url = require(&merged, name, "url")?.trim();
    Url::parse(url).map_err(|e| ConfigError::invalid(name, "url", url, e.to_string()))?;

    let start_cmd = StartTemplate::parse(require(&merged, name, "start_cmd")?).map_err(|reason| {
        ConfigError::TemplateError {
            section: name.to_string(),
            reason,
        }
    })?;

    Ok(ServerType {
        name: name.to_string(),
        executable: executable.to_string(),
        url: url.to_string(),
        start_cmd,
    })
}

/// Resolve every section of `server.conf`.
pub fn resolve_servers(doc: &IniDocument) -> Resolved<ServerType> {
    let mut records = Vec::new();
    let mut failures = Vec::new();
    for name in doc.section_names() {
        match resolve_server(doc, name) {
            Ok(server) => records.push(server),
            Err(e) => failures.push(e),
        }
    }
    Resolved { records, failures }
}

/// Resolve one section of `worlds.conf` against the declared servers.
pub fn resolve_world(
    doc: &IniDocument,
    name: &str,
    servers: &BTreeMap<String, ServerType>,
) -> Result<WorldSpec, ConfigError> {
    let merged = merge_section(doc, name);
    for key in WORLD_KEYS {
        require(&merged, name, key)?;
    }

    let port = parse_port(name, require(&merged, name, "port")?)?;
    let stop_timeout = parse_seconds(name, "stop_timeout", require(&merged, name, "stop_timeout")?)?;
    let stop_delay = parse_seconds(name, "stop_delay", require(&merged, name, "stop_delay")?)?;
    let stop_message = require(&merged, name, "stop_message")?.to_string();
    let server = require(&merged, name, "server")?.trim().to_string();

    if !servers.contains_key(&server) {
        return Err(ConfigError::UnknownServerReference {
            world: name.to_string(),
            server,
        });
    }

    Ok(WorldSpec {
        name: name.to_string(),
        port,
        stop_timeout,
        stop_message,
        stop_delay,
        server,
    })
}

/// Resolve every section of `worlds.conf`.
pub fn resolve_worlds(
    doc: &IniDocument,
    servers: &BTreeMap<String, ServerType>,
) -> Resolved<WorldSpec> {
    let mut records = Vec::new();
    let mut failures = Vec::new();
    for name in doc.section_names() {
        match resolve_world(doc, name, servers) {
            Ok(world) => records.push(world),
            Err(e) => failures.push(e),
        }
    }
    Resolved { records, failures }
}

/// Non-fatal checks over the resolved worlds.
pub fn lint_worlds(worlds: &[WorldSpec]) -> Vec<ConfigWarning> {
    let mut warnings = Vec::new();
    let mut by_port: BTreeMap<u16, Vec<String>> = BTreeMap::new();

    for world in worlds {
        if world.stop_delay.saturating_add(COMMAND_LATENCY_SECS) > world.stop_timeout {
            warnings.push(ConfigWarning::StopDelayExceedsTimeout {
                world: world.name.clone(),
                stop_delay: world.stop_delay,
                stop_timeout: world.stop_timeout,
            });
        }
        if let Some(port) = world.port.fixed() {
            by_port.entry(port).or_default().push(world.name.clone());
        }
    }

    for (port, worlds) in by_port {
        if worlds.len() > 1 {
            warnings.push(ConfigWarning::SharedFixedPort { port, worlds });
        }
    }
    warnings
}
