//! Writable view of `worlds.conf`.
//!
//! Ports chosen for `<auto>` worlds are written back here so the next run
//! reuses them. Callers hold the instance lock while reloading and writing.

use std::fs;
use std::path::{Path, PathBuf};

use crate::config::ini::{IniDocument, DEFAULT_SECTION};
use crate::config::loader::read_document;
use crate::config::validation::{merge_section, parse_port, ConfigError};
use crate::config::schema::PortSetting;

#[derive(Debug)]
pub struct WorldsStore {
    path: PathBuf,
    doc: IniDocument,
}

impl WorldsStore {
    /// Read `worlds.conf`; a missing file yields an empty store.
    pub fn open(path: &Path) -> Result<Self, ConfigError> {
        Ok(Self {
            path: path.to_path_buf(),
            doc: read_document(path)?,
        })
    }

    /// Pick up changes written by other manager instances.
    pub fn reload(&mut self) -> Result<(), ConfigError> {
        self.doc = read_document(&self.path)?;
        Ok(())
    }

    pub fn document(&self) -> &IniDocument {
        &self.doc
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Current port setting of a world, `DEFAULT` applied.
    pub fn port_of(&self, world: &str) -> Option<PortSetting> {
        if !self.doc.has_section(world) {
            return None;
        }
        let merged = merge_section(&self.doc, world);
        merged.get("port").and_then(|raw| parse_port(world, raw).ok())
    }

    /// Fixed ports of every world except `world`.
    pub fn claimed_ports(&self, world: &str) -> Vec<u16> {
        self.doc
            .section_names()
            .into_iter()
            .filter(|name| *name != world)
            .filter_map(|name| self.port_of(name).and_then(|p| p.fixed()))
            .collect()
    }

    /// Persist `port` into the world's own section.
    pub fn set_port(&mut self, world: &str, port: u16) -> Result<(), ConfigError> {
        self.doc.set(world, "port", &port.to_string());
        self.write()?;
        tracing::info!(world = %world, port, path = %self.path.display(), "Persisted port");
        Ok(())
    }

    /// Point every section that names `old` as its server at `new`,
    /// `DEFAULT` included. Returns the sections that changed.
    pub fn replace_server(&mut self, old: &str, new: &str) -> Result<Vec<String>, ConfigError> {
        let mut sections = vec![DEFAULT_SECTION.to_string()];
        sections.extend(self.doc.section_names().into_iter().map(str::to_string));
        sections.retain(|section| self.doc.get(section, "server") == Some(old));

        for section in &sections {
            self.doc.set(section, "server", new);
        }
        if !sections.is_empty() {
            self.write()?;
            tracing::info!(from = %old, to = %new, sections = ?sections, "Reassigned worlds");
        }
        Ok(sections)
    }

    fn write(&self) -> Result<(), ConfigError> {
        write_document(&self.path, &self.doc)
    }
}

/// Write through a temporary file so readers never see a partial file.
pub fn write_document(path: &Path, doc: &IniDocument) -> Result<(), ConfigError> {
    let io_err = |source| ConfigError::Io {
        path: path.to_path_buf(),
        source,
    };
    if let Some(parent) = path.parent() {
        fs::create_dir_all(parent).map_err(io_err)?;
    }
    let tmp = path.with_extension("conf.tmp");
    fs::write(&tmp, doc.to_string()).map_err(io_err)?;
    fs::rename(&tmp, path).map_err(io_err)?;
    Ok(())
}
