//! World and server selection from the command line.

use thiserror::Error;

#[derive(Debug, Error, PartialEq, Eq)]
pub enum SelectionError {
    #[error("unknown {kind} '{name}' (known: {known})")]
    Unknown {
        kind: &'static str,
        name: String,
        known: String,
    },

    #[error("no {kind} selected")]
    Empty { kind: &'static str },
}

/// Names given with `-w`/`-s`, or the `-W`/`-S` switch.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct Selection {
    pub names: Vec<String>,
    pub all: bool,
}

impl Selection {
    pub fn is_empty(&self) -> bool {
        !self.all && self.names.is_empty()
    }

    /// Resolve against the configured names, keeping their order and
    /// dropping duplicates.
    pub fn resolve(&self, kind: &'static str, available: &[String]) -> Result<Vec<String>, SelectionError> {
        if self.all {
            return Ok(available.to_vec());
        }
        if self.names.is_empty() {
            return Err(SelectionError::Empty { kind });
        }
        if let Some(name) = self.names.iter().find(|n| !available.contains(n)) {
            return Err(SelectionError::Unknown {
                kind,
                name: name.clone(),
                known: available.join(", "),
            });
        }
        Ok(available
            .iter()
            .filter(|n| self.names.contains(n))
            .cloned()
            .collect())
    }
}
