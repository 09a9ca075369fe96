//! Configuration loading from disk.

use std::collections::BTreeMap;
use std::fs;
use std::io::ErrorKind;
use std::path::Path;

use crate::config::ini::IniDocument;
use crate::config::paths::InstancePaths;
use crate::config::schema::{GlobalSettings, ServerType, WorldSpec};
use crate::config::validation::{
    lint_worlds, resolve_global, resolve_servers, resolve_worlds, ConfigError, ConfigWarning,
};

/// Everything resolved from `main.conf`, `server.conf` and `worlds.conf`.
#[derive(Debug)]
pub struct Configuration {
    pub paths: InstancePaths,
    pub global: GlobalSettings,
    pub servers: BTreeMap<String, ServerType>,
    pub worlds: BTreeMap<String, WorldSpec>,
    /// Sections that failed to resolve; the rest of the configuration is usable.
    pub failures: Vec<ConfigError>,
    pub warnings: Vec<ConfigWarning>,
}

impl Configuration {
    pub fn world(&self, name: &str) -> Option<&WorldSpec> {
        self.worlds.get(name)
    }

    pub fn server(&self, name: &str) -> Option<&ServerType> {
        self.servers.get(name)
    }

    pub fn world_names(&self) -> Vec<String> {
        self.worlds.keys().cloned().collect()
    }

    pub fn server_names(&self) -> Vec<String> {
        self.servers.keys().cloned().collect()
    }

    /// Worlds configured to run the given server.
    pub fn worlds_using(&self, server: &str) -> Vec<String> {
        self.worlds
            .values()
            .filter(|w| w.server == server)
            .map(|w| w.name.clone())
            .collect()
    }
}

/// Read and parse an INI file, treating a missing file as empty.
pub fn read_document(path: &Path) -> Result<IniDocument, ConfigError> {
    let content = match fs::read_to_string(path) {
        Ok(content) => content,
        Err(e) if e.kind() == ErrorKind::NotFound => {
            tracing::debug!(path = %path.display(), "Configuration file missing, using empty document");
            return Ok(IniDocument::new());
        }
        Err(e) => {
            return Err(ConfigError::Io {
                path: path.to_path_buf(),
                source: e,
            })
        }
    };
    IniDocument::parse(&content).map_err(|source| ConfigError::Syntax {
        path: path.to_path_buf(),
        source,
    })
}

/// Load and validate the configuration of an instance.
///
/// Unreadable files, syntax errors and an invalid `[emsm]` section abort
/// loading. Invalid server or world sections only end up in `failures`.
pub fn load_config(paths: &InstancePaths) -> Result<Configuration, ConfigError> {
    let main = read_document(&paths.main_conf())?;
    let global = resolve_global(&main)?;

    let server_doc = read_document(&paths.server_conf())?;
    let resolved_servers = resolve_servers(&server_doc);
    let servers: BTreeMap<String, ServerType> = resolved_servers
        .records
        .into_iter()
        .map(|s| (s.name.clone(), s))
        .collect();

    let worlds_doc = read_document(&paths.worlds_conf())?;
    let resolved_worlds = resolve_worlds(&worlds_doc, &servers);
    let warnings = lint_worlds(&resolved_worlds.records);
    let worlds: BTreeMap<String, WorldSpec> = resolved_worlds
        .records
        .into_iter()
        .map(|w| (w.name.clone(), w))
        .collect();

    let mut failures = resolved_servers.failures;
    failures.extend(resolved_worlds.failures);

    for failure in &failures {
        tracing::error!(error = %failure, "Configuration section rejected");
    }
    for warning in &warnings {
        tracing::warn!(warning = %warning, "Configuration warning");
    }
    tracing::info!(
        servers = servers.len(),
        worlds = worlds.len(),
        failures = failures.len(),
        "Configuration loaded"
    );

    Ok(Configuration {
        paths: paths.clone(),
        global,
        servers,
        worlds,
        failures,
        warnings,
    })
}

#[cfg(test)]
mod tests {
    use super::*;

    fn write(paths: &InstancePaths, main: &str, server: &str, worlds: &str) {
        fs::create_dir_all(paths.conf_dir()).unwrap();
        fs::write(paths.main_conf(), main).unwrap();
        fs::write(paths.server_conf(), server).unwrap();
        fs::write(paths.worlds_conf(), worlds).unwrap();
    }

    #[test]
    fn test_load_partial_configuration() {
        let dir = tempfile::tempdir().unwrap();
        let paths = InstancePaths::new(dir.path());
        write(
            &paths,
            "[emsm]\ntimeout = 5\n",
            "[vanilla]\nserver = minecraft_server.jar\nurl = https://example.com/s.jar\nstart_cmd = java -jar {server}\n",
            "[DEFAULT]\nport = <auto>\nstop_timeout = 10\nstop_message = bye\nstop_delay = 0\nserver = vanilla\n\n[foo]\n\n[bad]\nserver = nope\n",
        );

        let config = load_config(&paths).unwrap();
        assert_eq!(config.world_names(), vec!["foo".to_string()]);
        assert_eq!(config.server_names(), vec!["vanilla".to_string()]);
        assert_eq!(config.failures.len(), 1);
        assert_eq!(config.worlds_using("vanilla"), vec!["foo".to_string()]);
    }

    #[test]
    fn test_missing_files_are_empty() {
        let dir = tempfile::tempdir().unwrap();
        let config = load_config(&InstancePaths::new(dir.path())).unwrap();
        assert!(config.worlds.is_empty());
        assert!(config.servers.is_empty());
        assert_eq!(config.global.user, "minecraft");
    }

    #[test]
    fn test_syntax_error_aborts() {
        let dir = tempfile::tempdir().unwrap();
        let paths = InstancePaths::new(dir.path());
        write(&paths, "", "", "port = 1\n");
        assert!(matches!(load_config(&paths), Err(ConfigError::Syntax { .. })));
    }
}
