//! INI document model.
//!
//! # Responsibilities
//! - Parse the configparser dialect used by `main.conf`, `server.conf` and
//!   `worlds.conf`
//! - Answer per-section lookups (own keys only; inheritance lives in
//!   `validation.rs`)
//! - Apply edits and write the document back with untouched lines verbatim
//!
//! # Dialect
//! - `[section]` headers, `DEFAULT` is an ordinary section at this layer
//! - `key = value` or `key: value`, keys are lower-cased
//! - Full-line comments start with `#` or `;`
//! - Indented lines continue the previous value (multi-line values)
//! - Duplicate sections and duplicate keys within a section are rejected

use std::collections::HashSet;
use std::fmt;

/// Name of the section every other section inherits from.
pub const DEFAULT_SECTION: &str = "DEFAULT";

/// Syntax error with the 1-based line it was found on.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
#[error("line {line}: {message}")]
pub struct IniError {
    pub line: usize,
    pub message: String,
}

impl IniError {
    fn new(line: usize, message: impl Into<String>) -> Self {
        Self {
            line,
            message: message.into(),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
enum Node {
    /// Blank line or comment, written back as-is.
    Raw(String),
    Header { name: String, raw: String },
    /// `raw` is dropped once the value is edited.
    Entry {
        key: String,
        value: String,
        raw: Option<String>,
    },
}

/// A parsed INI file.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct IniDocument {
    nodes: Vec<Node>,
}

impl IniDocument {
    /// Create an empty document.
    pub fn new() -> Self {
        Self::default()
    }

    /// Parse a document from text.
    pub fn parse(input: &str) -> Result<Self, IniError> {
        let mut nodes: Vec<Node> = Vec::new();
        let mut current: Option<String> = None;
        let mut sections: HashSet<String> = HashSet::new();
        let mut keys: HashSet<String> = HashSet::new();

        for (idx, line) in input.lines().enumerate() {
            let number = idx + 1;
            let trimmed = line.trim();

            if trimmed.is_empty() || is_comment(trimmed) {
                nodes.push(Node::Raw(line.to_string()));
                continue;
            }

            let indented = line.starts_with([' ', '\t']);
            if indented {
                if let Some(Node::Entry { value, raw, .. }) = nodes.last_mut() {
                    if !value.is_empty() {
                        value.push('\n');
                    }
                    value.push_str(trimmed);
                    if let Some(raw) = raw {
                        raw.push('\n');
                        raw.push_str(line);
                    }
                    continue;
                }
            }

            if trimmed.starts_with('[') {
                let name = trimmed
                    .strip_prefix('[')
                    .and_then(|rest| rest.strip_suffix(']'))
                    .map(str::trim)
                    .ok_or_else(|| IniError::new(number, "unterminated section header"))?;
                if name.is_empty() {
                    return Err(IniError::new(number, "empty section name"));
                }
                if !sections.insert(name.to_string()) {
                    return Err(IniError::new(number, format!("duplicate section '{}'", name)));
                }
                keys.clear();
                current = Some(name.to_string());
                nodes.push(Node::Header {
                    name: name.to_string(),
                    raw: line.to_string(),
                });
                continue;
            }

            let Some(section) = current.as_deref() else {
                return Err(IniError::new(number, "entry outside of a section"));
            };

            let split = trimmed
                .find(['=', ':'])
                .ok_or_else(|| IniError::new(number, "expected 'key = value'"))?;
            let key = trimmed[..split].trim().to_lowercase();
            let value = trimmed[split + 1..].trim().to_string();
            if key.is_empty() {
                return Err(IniError::new(number, "empty key"));
            }
            if !keys.insert(key.clone()) {
                return Err(IniError::new(
                    number,
                    format!("duplicate key '{}' in section '{}'", key, section),
                ));
            }

            nodes.push(Node::Entry {
                key,
                value,
                raw: Some(line.to_string()),
            });
        }

        Ok(Self { nodes })
    }

    /// Section names in file order, `DEFAULT` excluded.
    pub fn section_names(&self) -> Vec<&str> {
        self.nodes
            .iter()
            .filter_map(|node| match node {
                Node::Header { name, .. } if name != DEFAULT_SECTION => Some(name.as_str()),
                _ => None,
            })
            .collect()
    }

    pub fn has_section(&self, section: &str) -> bool {
        self.section_range(section).is_some()
    }

    /// The section's own entries in file order.
    pub fn entries(&self, section: &str) -> Vec<(&str, &str)> {
        let Some((start, end)) = self.section_range(section) else {
            return Vec::new();
        };
        self.nodes[start..end]
            .iter()
            .filter_map(|node| match node {
                Node::Entry { key, value, .. } => Some((key.as_str(), value.as_str())),
                _ => None,
            })
            .collect()
    }

    /// Look up a key the section sets itself.
    pub fn get(&self, section: &str, key: &str) -> Option<&str> {
        let key = key.to_lowercase();
        self.entries(section)
            .into_iter()
            .find(|(k, _)| *k == key)
            .map(|(_, v)| v)
    }

    /// Set `key` in `section`, creating either when missing.
    ///
    /// An existing entry is replaced in place; a new one goes after the
    /// last entry of the section so trailing comments stay put.
    pub fn set(&mut self, section: &str, key: &str, value: &str) {
        let key = key.to_lowercase();
        let entry = Node::Entry {
            key: key.clone(),
            value: value.to_string(),
            raw: None,
        };

        let Some((start, end)) = self.section_range(section) else {
            if matches!(self.nodes.last(), Some(node) if !is_blank(node)) {
                self.nodes.push(Node::Raw(String::new()));
            }
            self.nodes.push(Node::Header {
                name: section.to_string(),
                raw: format!("[{}]", section),
            });
            self.nodes.push(entry);
            return;
        };

        let mut insert_at = start;
        for idx in start..end {
            if let Node::Entry { key: existing, .. } = &self.nodes[idx] {
                if *existing == key {
                    self.nodes[idx] = entry;
                    return;
                }
                insert_at = idx;
            }
        }
        self.nodes.insert(insert_at + 1, entry);
    }

    /// Drop a section with everything up to the next header.
    pub fn remove_section(&mut self, section: &str) -> bool {
        let Some((start, end)) = self.section_range(section) else {
            return false;
        };
        self.nodes.drain(start..end);
        true
    }

    /// Header index and the exclusive end of the section body.
    fn section_range(&self, section: &str) -> Option<(usize, usize)> {
        let start = self
            .nodes
            .iter()
            .position(|node| matches!(node, Node::Header { name, .. } if name == section))?;
        let end = self.nodes[start + 1..]
            .iter()
            .position(|node| matches!(node, Node::Header { .. }))
            .map(|offset| start + 1 + offset)
            .unwrap_or(self.nodes.len());
        Some((start, end))
    }
}

impl fmt::Display for IniDocument {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        for node in &self.nodes {
            match node {
                Node::Raw(line) => writeln!(f, "{}", line)?,
                Node::Header { raw, .. } => writeln!(f, "{}", raw)?,
                Node::Entry {
                    raw: Some(raw), ..
                } => writeln!(f, "{}", raw)?,
                Node::Entry {
                    key,
                    value,
                    raw: None,
                } => {
                    let mut lines = value.lines();
                    writeln!(f, "{} = {}", key, lines.next().unwrap_or_default())?;
                    for line in lines {
                        writeln!(f, "\t{}", line)?;
                    }
                }
            }
        }
        Ok(())
    }
}

fn is_comment(trimmed: &str) -> bool {
    trimmed.starts_with('#') || trimmed.starts_with(';')
}

fn is_blank(node: &Node) -> bool {
    matches!(node, Node::Raw(line) if line.trim().is_empty())
}

#[cfg(test)]
mod tests {
    use super::*;

    const WORLDS: &str = "\
# worlds managed by this instance
[DEFAULT]
port = <auto>
stop_timeout = 10
stop_message = The server is going down.
\tHope to see you soon.
stop_delay = 5
server = vanilla

[foo]

[bar]
Port: 25565
; keep bar on bukkit
server = bukkit
";

    #[test]
    fn test_parse_sections_and_entries() {
        let doc = IniDocument::parse(WORLDS).unwrap();
        assert_eq!(doc.section_names(), vec!["foo", "bar"]);
        assert!(doc.has_section(DEFAULT_SECTION));
        assert_eq!(doc.get("DEFAULT", "stop_delay"), Some("5"));
        assert_eq!(doc.get("bar", "port"), Some("25565"));
        assert_eq!(doc.get("bar", "PORT"), Some("25565"));
        assert!(doc.entries("foo").is_empty());
        assert_eq!(doc.get("foo", "port"), None);
    }

    #[test]
    fn test_multiline_value() {
        let doc = IniDocument::parse(WORLDS).unwrap();
        assert_eq!(
            doc.get("DEFAULT", "stop_message"),
            Some("The server is going down.\nHope to see you soon.")
        );
    }

    #[test]
    fn test_roundtrip_is_verbatim() {
        let doc = IniDocument::parse(WORLDS).unwrap();
        assert_eq!(doc.to_string(), WORLDS);
    }

    #[test]
    fn test_set_keeps_comments_and_order() {
        let mut doc = IniDocument::parse(WORLDS).unwrap();
        doc.set("foo", "port", "25566");
        doc.set("bar", "port", "25570");

        let text = doc.to_string();
        assert!(text.contains("[foo]\nport = 25566\n"));
        assert!(text.contains("port = 25570\n; keep bar on bukkit\nserver = bukkit\n"));
        assert!(text.starts_with("# worlds managed by this instance\n"));

        let reparsed = IniDocument::parse(&text).unwrap();
        assert_eq!(reparsed.get("foo", "port"), Some("25566"));
        assert_eq!(reparsed.get("bar", "port"), Some("25570"));
    }

    #[test]
    fn test_set_creates_missing_section() {
        let mut doc = IniDocument::parse("[a]\nx = 1\n").unwrap();
        doc.set("b", "y", "two\nlines");
        assert_eq!(doc.to_string(), "[a]\nx = 1\n\n[b]\ny = two\n\tlines\n");
        let reparsed = IniDocument::parse(&doc.to_string()).unwrap();
        assert_eq!(reparsed.get("b", "y"), Some("two\nlines"));
    }

    #[test]
    fn test_remove_section() {
        let mut doc = IniDocument::parse("[a]\nx = 1\n\n[b]\ny = 2\n\n[c]\nz = 3\n").unwrap();
        assert!(doc.remove_section("b"));
        assert!(!doc.remove_section("b"));
        assert_eq!(doc.section_names(), vec!["a", "c"]);
        assert_eq!(doc.to_string(), "[a]\nx = 1\n\n[c]\nz = 3\n");
    }

    #[test]
    fn test_rejects_duplicates() {
        let err = IniDocument::parse("[a]\n[a]\n").unwrap_err();
        assert_eq!(err.line, 2);
        assert!(err.message.contains("duplicate section"));

        let err = IniDocument::parse("[a]\nx = 1\nX = 2\n").unwrap_err();
        assert_eq!(err.line, 3);
        assert!(err.message.contains("duplicate key"));
    }

    #[test]
    fn test_rejects_malformed_lines() {
        assert_eq!(IniDocument::parse("x = 1\n").unwrap_err().line, 1);
        assert_eq!(IniDocument::parse("[a]\nnot a pair\n").unwrap_err().line, 2);
        assert_eq!(IniDocument::parse("[a\n").unwrap_err().line, 1);
    }
}
