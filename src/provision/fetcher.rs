//! Server executable downloads.
//!
//! # Responsibilities
//! - Fetch a server type's executable from its configured URL
//! - Replace the file under `server/` atomically
//!
//! # Design Decisions
//! - `http(s)` URLs are tried as https first, then plain http
//! - Every attempt goes through all candidate URLs before backing off
//! - The download lands in a sibling temp file and is renamed into place,
//!   so a running server never sees a half-written executable

use std::future::Future;
use std::io;
use std::os::unix::fs::PermissionsExt;
use std::path::{Path, PathBuf};
use std::time::Duration;

use thiserror::Error;
use url::Url;

use crate::config::ServerType;
use crate::resilience::BackoffPolicy;

const REQUEST_TIMEOUT: Duration = Duration::from_secs(300);

#[derive(Debug, Error)]
pub enum FetchError {
    #[error("server '{server}' has no download url")]
    NoUrl { server: String },

    #[error("invalid download url '{url}': {reason}")]
    InvalidUrl { url: String, reason: String },

    #[error("download client setup failed: {0}")]
    Client(#[source] reqwest::Error),

    #[error("downloading {url} failed: {reason}")]
    Download { url: String, reason: String },

    #[error("writing {}: {source}", path.display())]
    Io {
        path: PathBuf,
        #[source]
        source: io::Error,
    },
}

/// Provides server executables.
pub trait ExecutableFetcher: Send + Sync + 'static {
    /// Put the executable of `server` at `target` and return its path.
    fn fetch(
        &self,
        server: &ServerType,
        target: &Path,
    ) -> impl Future<Output = Result<PathBuf, FetchError>> + Send;
}

/// Downloads executables over HTTP(S) with reqwest.
#[derive(Debug, Clone)]
pub struct HttpFetcher {
    client: reqwest::Client,
    policy: BackoffPolicy,
}

impl HttpFetcher {
    pub fn new() -> Result<Self, FetchError> {
        Self::with_policy(BackoffPolicy::default())
    }

    pub fn with_policy(policy: BackoffPolicy) -> Result<Self, FetchError> {
        let client = reqwest::Client::builder()
            .timeout(REQUEST_TIMEOUT)
            .user_agent(concat!("emsm/", env!("CARGO_PKG_VERSION")))
            .build()
            .map_err(FetchError::Client)?;
        Ok(Self { client, policy })
    }

    async fn download(&self, url: &Url) -> Result<Vec<u8>, String> {
        let response = self
            .client
            .get(url.clone())
            .send()
            .await
            .map_err(|e| e.to_string())?;
        let status = response.status();
        if !status.is_success() {
            return Err(format!("status {}", status));
        }
        let bytes = response.bytes().await.map_err(|e| e.to_string())?;
        Ok(bytes.to_vec())
    }
}

impl ExecutableFetcher for HttpFetcher {
    async fn fetch(&self, server: &ServerType, target: &Path) -> Result<PathBuf, FetchError> {
        if server.url.trim().is_empty() {
            return Err(FetchError::NoUrl {
                server: server.name.clone(),
            });
        }
        let candidates = candidate_urls(server.url.trim())?;

        let mut last_failure = None;
        for attempt in 0..self.policy.attempts.max(1) {
            let delay = self.policy.delay(attempt);
            if !delay.is_zero() {
                tracing::debug!(server = %server.name, attempt, delay = ?delay, "Retrying download");
                tokio::time::sleep(delay).await;
            }

            for url in &candidates {
                match self.download(url).await {
                    Ok(bytes) => {
                        write_atomically(target, &bytes).await?;
                        tracing::info!(
                            server = %server.name,
                            url = %url,
                            bytes = bytes.len(),
                            path = %target.display(),
                            "Downloaded server executable"
                        );
                        return Ok(target.to_path_buf());
                    }
                    Err(reason) => {
                        tracing::warn!(server = %server.name, url = %url, reason = %reason, "Download failed");
                        last_failure = Some((url.to_string(), reason));
                    }
                }
            }
        }

        let (url, reason) = last_failure.unwrap_or_else(|| (server.url.clone(), "no attempt made".to_string()));
        Err(FetchError::Download { url, reason })
    }
}

/// URLs to try, in order.
pub fn candidate_urls(raw: &str) -> Result<Vec<Url>, FetchError> {
    let url = Url::parse(raw).map_err(|e| FetchError::InvalidUrl {
        url: raw.to_string(),
        reason: e.to_string(),
    })?;

    match url.scheme() {
        "https" | "http" => {
            let mut secure = url.clone();
            let mut plain = url;
            // Switching between the two special schemes cannot fail.
            let _ = secure.set_scheme("https");
            let _ = plain.set_scheme("http");
            Ok(vec![secure, plain])
        }
        other => Err(FetchError::InvalidUrl {
            url: raw.to_string(),
            reason: format!("unsupported scheme '{}'", other),
        }),
    }
}

async fn write_atomically(target: &Path, bytes: &[u8]) -> Result<(), FetchError> {
    let io_err = |source| FetchError::Io {
        path: target.to_path_buf(),
        source,
    };
    if let Some(parent) = target.parent() {
        tokio::fs::create_dir_all(parent).await.map_err(io_err)?;
    }
    let mut tmp = target.as_os_str().to_owned();
    tmp.push(".download");
    let tmp = PathBuf::from(tmp);

    tokio::fs::write(&tmp, bytes).await.map_err(io_err)?;
    tokio::fs::set_permissions(&tmp, std::fs::Permissions::from_mode(0o755))
        .await
        .map_err(io_err)?;
    tokio::fs::rename(&tmp, target).await.map_err(io_err)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::template::StartTemplate;
    use tokio::io::{AsyncReadExt, AsyncWriteExt};
    use tokio::net::TcpListener;

    fn server(url: &str) -> ServerType {
        ServerType {
            name: "vanilla".to_string(),
            executable: "minecraft_server.jar".to_string(),
            url: url.to_string(),
            start_cmd: StartTemplate::parse("java -jar {server} nogui.").unwrap(),
        }
    }

    fn quick_policy(attempts: u32) -> BackoffPolicy {
        BackoffPolicy {
            attempts,
            base: Duration::from_millis(10),
            max: Duration::from_millis(20),
        }
    }

    /// Plain-HTTP server answering every connection with `status` and `body`.
    async fn serve(status: &'static str, body: &'static str) -> u16 {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let port = listener.local_addr().unwrap().port();
        tokio::spawn(async move {
            loop {
                let Ok((mut stream, _)) = listener.accept().await else {
                    break;
                };
                tokio::spawn(async move {
                    let mut buf = [0u8; 4096];
                    let _ = stream.read(&mut buf).await;
                    let response = format!(
                        "HTTP/1.1 {}\r\nContent-Length: {}\r\nConnection: close\r\n\r\n{}",
                        status,
                        body.len(),
                        body
                    );
                    let _ = stream.write_all(response.as_bytes()).await;
                    let _ = stream.shutdown().await;
                });
            }
        });
        port
    }

    #[test]
    fn test_candidate_urls() {
        let urls = candidate_urls("http://example.com/server.jar").unwrap();
        let urls: Vec<String> = urls.iter().map(|u| u.to_string()).collect();
        assert_eq!(urls, ["https://example.com/server.jar", "http://example.com/server.jar"]);

        assert!(matches!(candidate_urls("ftp://example.com/x"), Err(FetchError::InvalidUrl { .. })));
        assert!(matches!(candidate_urls("not a url"), Err(FetchError::InvalidUrl { .. })));
    }

    #[tokio::test]
    async fn test_missing_url() {
        let dir = tempfile::tempdir().unwrap();
        let fetcher = HttpFetcher::with_policy(quick_policy(1)).unwrap();
        let err = fetcher
            .fetch(&server(""), &dir.path().join("server.jar"))
            .await
            .unwrap_err();
        assert!(matches!(err, FetchError::NoUrl { .. }));
    }

    #[tokio::test]
    async fn test_falls_back_to_plain_http() {
        let port = serve("200 OK", "jar-bytes").await;
        let dir = tempfile::tempdir().unwrap();
        let target = dir.path().join("server").join("minecraft_server.jar");

        let fetcher = HttpFetcher::with_policy(quick_policy(1)).unwrap();
        let path = fetcher
            .fetch(&server(&format!("http://127.0.0.1:{}/server.jar", port)), &target)
            .await
            .unwrap();

        assert_eq!(path, target);
        assert_eq!(std::fs::read_to_string(&target).unwrap(), "jar-bytes");
        assert!(!dir.path().join("server").join("minecraft_server.jar.download").exists());
    }

    #[tokio::test]
    async fn test_error_status_exhausts_attempts() {
        let port = serve("404 Not Found", "").await;
        let dir = tempfile::tempdir().unwrap();
        let target = dir.path().join("server.jar");

        let fetcher = HttpFetcher::with_policy(quick_policy(2)).unwrap();
        let err = fetcher
            .fetch(&server(&format!("http://127.0.0.1:{}/server.jar", port)), &target)
            .await
            .unwrap_err();

        match err {
            FetchError::Download { url, reason } => {
                assert!(url.starts_with("http://"));
                assert!(reason.contains("404"));
            }
            other => panic!("unexpected error: {other}"),
        }
        assert!(!target.exists());
    }
}
