//! `server.properties` port synchronisation.
//!
//! Minecraft servers read their listening port from `server-port` in the
//! world directory. The allocated port is written there before each start;
//! every other line stays as it was.

use std::fs;
use std::io::{self, ErrorKind};
use std::path::Path;

pub const PROPERTIES_FILE: &str = "server.properties";
pub const PORT_KEY: &str = "server-port";

pub fn write_server_port(world_dir: &Path, port: u16) -> io::Result<()> {
    fs::create_dir_all(world_dir)?;
    let path = world_dir.join(PROPERTIES_FILE);
    let current = match fs::read_to_string(&path) {
        Ok(content) => content,
        Err(e) if e.kind() == ErrorKind::NotFound => String::new(),
        Err(e) => return Err(e),
    };

    let updated = set_port_line(&current, port);
    if updated != current {
        fs::write(&path, updated)?;
        tracing::debug!(path = %path.display(), port, "Updated server.properties");
    }
    Ok(())
}

fn set_port_line(content: &str, port: u16) -> String {
    let line = format!("{}={}", PORT_KEY, port);
    let mut found = false;
    let mut out: Vec<String> = content
        .lines()
        .map(|l| {
            let key = l.split('=').next().unwrap_or("").trim();
            if !l.trim_start().starts_with('#') && key == PORT_KEY {
                found = true;
                line.clone()
            } else {
                l.to_string()
            }
        })
        .collect();
    if !found {
        out.push(line);
    }
    let mut joined = out.join("\n");
    joined.push('\n');
    joined
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_replaces_existing_port() {
        let before = "#Minecraft server properties\nmotd=Hello\nserver-port=25565\nmax-players=20\n";
        assert_eq!(
            set_port_line(before, 25570),
            "#Minecraft server properties\nmotd=Hello\nserver-port=25570\nmax-players=20\n"
        );
    }

    #[test]
    fn test_appends_when_missing() {
        assert_eq!(set_port_line("", 25565), "server-port=25565\n");
        assert_eq!(set_port_line("motd=Hi", 25565), "motd=Hi\nserver-port=25565\n");
        assert_eq!(
            set_port_line("#server-port=1\n", 25565),
            "#server-port=1\nserver-port=25565\n"
        );
    }

    #[test]
    fn test_writes_file_in_world_dir() {
        let dir = tempfile::tempdir().unwrap();
        let world = dir.path().join("worlds").join("foo");
        write_server_port(&world, 25565).unwrap();
        assert_eq!(
            fs::read_to_string(world.join(PROPERTIES_FILE)).unwrap(),
            "server-port=25565\n"
        );
    }
}
