//! Shared fixtures for integration tests.

#![allow(dead_code)]

use std::collections::BTreeMap;
use std::fs;
use std::os::unix::process::CommandExt;
use std::path::{Path, PathBuf};
use std::process::Command;
use std::time::Duration;

use tempfile::TempDir;
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::TcpListener;

use emsm::config::{load_config, InstancePaths};
use emsm::manager::{RegistryEntry, WorldManager};
use emsm::process::ShellLauncher;
use emsm::provision::HttpFetcher;
use emsm::resilience::BackoffPolicy;

/// Fake server: logs every console line, exits on `stop`.
pub const COOPERATIVE_SERVER: &str = "\
while read line; do
  echo \"$line\" >> console.log
  if [ \"$line\" = stop ]; then exit 0; fi
done
";

/// Fake server that ignores the console and polite signals.
pub const STUBBORN_SERVER: &str = "\
trap '' TERM INT
while true; do sleep 1; done
";

/// Fake server that dies on its own after a second.
pub const CRASHING_SERVER: &str = "sleep 1\nexit 3\n";

pub type TestManager = WorldManager<ShellLauncher, HttpFetcher>;

/// An instance root in a temporary directory.
pub struct Instance {
    pub dir: TempDir,
    pub paths: InstancePaths,
}

impl Instance {
    /// `main.conf` with the given port range and a short lock timeout.
    pub fn new(port_range: &str) -> Self {
        let dir = tempfile::tempdir().unwrap();
        let paths = InstancePaths::new(dir.path());
        fs::create_dir_all(paths.conf_dir()).unwrap();
        fs::write(
            paths.main_conf(),
            format!("[emsm]\ntimeout = 10\nport_range = {}\n", port_range),
        )
        .unwrap();
        Self { dir, paths }
    }

    pub fn root(&self) -> &Path {
        self.dir.path()
    }

    pub fn write_main(&self, content: &str) {
        fs::write(self.paths.main_conf(), content).unwrap();
    }

    pub fn write_servers(&self, content: &str) {
        fs::write(self.paths.server_conf(), content).unwrap();
    }

    pub fn write_worlds(&self, content: &str) {
        fs::write(self.paths.worlds_conf(), content).unwrap();
    }

    pub fn worlds_conf(&self) -> String {
        fs::read_to_string(self.paths.worlds_conf()).unwrap()
    }

    /// A `script` server type whose executable is the given shell script.
    pub fn install_script_server(&self, script: &str) -> PathBuf {
        self.write_servers(
            "[script]\nserver = server.sh\nurl = http://127.0.0.1:9/server.sh\nstart_cmd = sh {server}\n",
        );
        let path = self.paths.executable("server.sh");
        fs::create_dir_all(self.paths.server_dir()).unwrap();
        fs::write(&path, script).unwrap();
        path
    }

    /// Replace the runtime registry with the given entries.
    pub fn write_registry(&self, entries: &[(&str, RegistryEntry)]) {
        let entries: BTreeMap<&str, &RegistryEntry> =
            entries.iter().map(|(world, entry)| (*world, entry)).collect();
        fs::write(self.paths.state_file(), serde_json::to_string(&entries).unwrap()).unwrap();
    }

    pub fn console_log(&self, world: &str) -> String {
        fs::read_to_string(self.paths.world_dir(world).join("console.log")).unwrap_or_default()
    }

    pub fn manager(&self) -> TestManager {
        let config = load_config(&self.paths).unwrap();
        let fetcher = HttpFetcher::with_policy(BackoffPolicy {
            attempts: 1,
            base: Duration::from_millis(10),
            max: Duration::from_millis(10),
        })
        .unwrap();
        WorldManager::new(config, ShellLauncher, fetcher).with_startup_grace(Duration::from_millis(200))
    }
}

/// Run `script` in its own process group, detached from any manager, and
/// return its pid. A background thread reaps it.
pub fn spawn_detached(script: &str) -> u32 {
    let mut child = Command::new("sh")
        .arg("-c")
        .arg(script)
        .process_group(0)
        .spawn()
        .unwrap();
    let pid = child.id();
    std::thread::spawn(move || child.wait());
    pid
}

/// Serve `body` to every HTTP request on a random local port.
pub async fn start_mock_download(body: &'static str) -> u16 {
    let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let port = listener.local_addr().unwrap().port();

    tokio::spawn(async move {
        loop {
            match listener.accept().await {
                Ok((mut socket, _)) => {
                    tokio::spawn(async move {
                        let mut buf = [0u8; 4096];
                        let _ = socket.read(&mut buf).await;
                        let response = format!(
                            "HTTP/1.1 200 OK\r\nContent-Length: {}\r\nConnection: close\r\n\r\n{}",
                            body.len(),
                            body
                        );
                        let _ = socket.write_all(response.as_bytes()).await;
                        let _ = socket.shutdown().await;
                    });
                }
                Err(_) => break,
            }
        }
    });
    port
}
