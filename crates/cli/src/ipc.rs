//! IPC between CLI commands and the running scheduler
//!
//! `digestd run` owns the store and listens on a unix socket under the
//! data directory. Other commands send one JSON object per line and read
//! one JSON reply per line back.

use crate::notify::Event;
use crate::scheduler::TickReport;
use anyhow::{Context, Result};
use digest_core::{Record, ScheduleEntry, TimelineState};
use serde::{Deserialize, Serialize};
use std::io::ErrorKind;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;
use tokio::io::{AsyncBufReadExt, AsyncWriteExt, BufReader, Lines};
use tokio::net::unix::{OwnedReadHalf, OwnedWriteHalf};
use tokio::net::{UnixListener, UnixStream};
use tracing::{debug, info, warn};

/// A scheduler tick can take a while when many timelines are due
const REQUEST_TIMEOUT: Duration = Duration::from_secs(120);

/// Socket the daemon listens on
pub fn socket_path(data_dir: &Path) -> PathBuf {
    data_dir.join("state").join("digestd.sock")
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "op", rename_all = "snake_case")]
pub enum Request {
    Ping,
    Add {
        timeline: String,
        record: Record<Event>,
        #[serde(default)]
        increment_delay: Option<f64>,
        #[serde(default)]
        maximum_delay: Option<f64>,
    },
    Delete {
        timeline: String,
    },
    Status {
        #[serde(default)]
        timeline: Option<String>,
    },
    Tick {
        #[serde(default)]
        now: Option<f64>,
    },
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "status", rename_all = "snake_case")]
pub enum Response {
    Pong { pid: u32 },
    Added { created: bool },
    Deleted { existed: bool },
    Status(StatusReport),
    Ticked(TickReport),
    Error { message: String },
}

/// Queue contents, or a single timeline when one was asked for
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct StatusReport {
    pub waiting: Vec<ScheduleEntry>,
    pub ready: Vec<ScheduleEntry>,
    pub timeline: Option<TimelineStatus>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TimelineStatus {
    pub timeline: String,
    pub state: Option<TimelineState>,
    pub records: usize,
}

/// Request handler; runs on the blocking pool
pub type Handler = Arc<dyn Fn(Request) -> Response + Send + Sync>;

/// Client side of the daemon socket
pub struct IpcClient {
    reader: Lines<BufReader<OwnedReadHalf>>,
    writer: OwnedWriteHalf,
}

impl IpcClient {
    /// Connect to the daemon. `None` when no daemon is listening.
    pub async fn connect(path: &Path) -> Result<Option<Self>> {
        match UnixStream::connect(path).await {
            Ok(stream) => {
                let (read, writer) = stream.into_split();
                Ok(Some(Self {
                    reader: BufReader::new(read).lines(),
                    writer,
                }))
            }
            Err(e) if matches!(e.kind(), ErrorKind::NotFound | ErrorKind::ConnectionRefused) => {
                Ok(None)
            }
            Err(e) => {
                Err(e).with_context(|| format!("Failed to connect to {}", path.display()))
            }
        }
    }

    /// Send one request and wait for its reply
    pub async fn request(&mut self, request: &Request) -> Result<Response> {
        let mut line = serde_json::to_string(request)?;
        line.push('\n');
        self.writer
            .write_all(line.as_bytes())
            .await
            .context("Failed to send request to daemon")?;

        let reply = tokio::time::timeout(REQUEST_TIMEOUT, self.reader.next_line())
            .await
            .context("Timed out waiting for the daemon")?
            .context("Failed to read daemon reply")?
            .context("Daemon closed the connection")?;
        serde_json::from_str(&reply).context("Malformed daemon reply")
    }
}

/// Daemon side: accepts connections and answers requests
pub struct IpcServer {
    listener: UnixListener,
    path: PathBuf,
}

impl IpcServer {
    /// Listen on `path`, replacing a stale socket left by a dead daemon
    pub async fn bind(path: &Path) -> Result<Self> {
        if let Some(dir) = path.parent() {
            std::fs::create_dir_all(dir)
                .with_context(|| format!("Failed to create {}", dir.display()))?;
        }

        if path.exists() {
            if UnixStream::connect(path).await.is_ok() {
                anyhow::bail!("A daemon is already listening on {}", path.display());
            }
            debug!(path = %path.display(), "removing stale socket");
            std::fs::remove_file(path)
                .with_context(|| format!("Failed to remove stale socket {}", path.display()))?;
        }

        let listener = UnixListener::bind(path)
            .with_context(|| format!("Failed to listen on {}", path.display()))?;
        info!(path = %path.display(), "IPC server listening");
        Ok(Self {
            listener,
            path: path.to_path_buf(),
        })
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Serve until the task is dropped; the socket file goes with it
    pub async fn serve(self, handler: Handler) {
        loop {
            match self.listener.accept().await {
                Ok((stream, _)) => {
                    let handler = Arc::clone(&handler);
                    tokio::spawn(async move {
                        if let Err(e) = serve_connection(stream, handler).await {
                            debug!("IPC connection ended: {e:#}");
                        }
                    });
                }
                Err(e) => {
                    warn!("IPC accept failed: {e}");
                    tokio::time::sleep(Duration::from_millis(100)).await;
                }
            }
        }
    }
}

impl Drop for IpcServer {
    fn drop(&mut self) {
        let _ = std::fs::remove_file(&self.path);
    }
}

async fn serve_connection(stream: UnixStream, handler: Handler) -> Result<()> {
    let (read, mut write) = stream.into_split();
    let mut lines = BufReader::new(read).lines();

    while let Some(line) = lines.next_line().await? {
        if line.trim().is_empty() {
            continue;
        }

        let response = match serde_json::from_str::<Request>(&line) {
            Ok(request) => {
                let handler = Arc::clone(&handler);
                tokio::task::spawn_blocking(move || handler(request))
                    .await
                    .unwrap_or_else(|e| Response::Error {
                        message: format!("Request handler panicked: {e}"),
                    })
            }
            Err(e) => Response::Error {
                message: format!("Malformed request: {e}"),
            },
        };

        let mut reply = serde_json::to_string(&response)?;
        reply.push('\n');
        write.write_all(reply.as_bytes()).await?;
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    fn echo_handler() -> Handler {
        Arc::new(|request| match request {
            Request::Ping => Response::Pong { pid: 7 },
            Request::Delete { timeline } => Response::Deleted {
                existed: timeline == "known",
            },
            _ => Response::Error {
                message: "unsupported".to_string(),
            },
        })
    }

    #[test]
    fn test_wire_format() {
        let request: Request =
            serde_json::from_str(r#"{"op":"status","timeline":"mail:p:1"}"#).unwrap();
        assert_eq!(
            request,
            Request::Status {
                timeline: Some("mail:p:1".to_string())
            }
        );
        let request: Request = serde_json::from_str(r#"{"op":"tick"}"#).unwrap();
        assert_eq!(request, Request::Tick { now: None });

        let reply = serde_json::to_value(Response::Added { created: true }).unwrap();
        assert_eq!(reply, serde_json::json!({"status": "added", "created": true}));
    }

    #[tokio::test]
    async fn test_request_round_trip() {
        let dir = TempDir::new().unwrap();
        let path = socket_path(dir.path());
        let server = IpcServer::bind(&path).await.unwrap();
        assert!(path.exists());
        let task = tokio::spawn(server.serve(echo_handler()));

        let mut client = IpcClient::connect(&path).await.unwrap().unwrap();
        assert_eq!(
            client.request(&Request::Ping).await.unwrap(),
            Response::Pong { pid: 7 }
        );
        // Several requests share one connection
        let reply = client
            .request(&Request::Delete {
                timeline: "known".to_string(),
            })
            .await
            .unwrap();
        assert_eq!(reply, Response::Deleted { existed: true });

        task.abort();
        let _ = task.await;
        assert!(!path.exists());
    }

    #[tokio::test]
    async fn test_malformed_line_gets_error_reply() {
        let dir = TempDir::new().unwrap();
        let path = socket_path(dir.path());
        let server = IpcServer::bind(&path).await.unwrap();
        let task = tokio::spawn(server.serve(echo_handler()));

        let stream = UnixStream::connect(&path).await.unwrap();
        let (read, mut write) = stream.into_split();
        write.write_all(b"{\"op\":\"explode\"}\n").await.unwrap();
        let line = BufReader::new(read).lines().next_line().await.unwrap().unwrap();
        let reply: Response = serde_json::from_str(&line).unwrap();
        assert!(matches!(reply, Response::Error { message } if message.contains("Malformed")));

        task.abort();
    }

    #[tokio::test]
    async fn test_connect_without_daemon() {
        let dir = TempDir::new().unwrap();
        let client = IpcClient::connect(&socket_path(dir.path())).await.unwrap();
        assert!(client.is_none());
    }

    #[tokio::test]
    async fn test_stale_socket_is_replaced() {
        let dir = TempDir::new().unwrap();
        let path = socket_path(dir.path());
        std::fs::create_dir_all(path.parent().unwrap()).unwrap();
        // Bound and dropped without cleanup, as after a crash
        drop(std::os::unix::net::UnixListener::bind(&path).unwrap());
        assert!(path.exists());
        assert!(IpcClient::connect(&path).await.unwrap().is_none());

        let server = IpcServer::bind(&path).await.unwrap();
        let task = tokio::spawn(server.serve(echo_handler()));
        let mut client = IpcClient::connect(&path).await.unwrap().unwrap();
        assert_eq!(
            client.request(&Request::Ping).await.unwrap(),
            Response::Pong { pid: 7 }
        );

        // A second daemon on the same socket is refused
        assert!(IpcServer::bind(&path).await.is_err());
        task.abort();
    }
}
