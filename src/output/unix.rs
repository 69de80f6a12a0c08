//! Scan events streamed as JSON lines over a Unix domain socket

use crate::error::{Error, Result};
use crate::output::event_value;
use crate::scanner::ScanEvent;
use std::io;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use tokio::io::AsyncWriteExt;
use tokio::net::{UnixListener, UnixStream};
use tokio::sync::broadcast;
use tokio::task::JoinHandle;

const CHANNEL_CAPACITY: usize = 128;

/// Fan-out of scan events to every connected socket client.
///
/// Clients that fall behind by more than the channel capacity skip the
/// missed lines. The socket file is removed on drop.
pub struct EventSocket {
    sender: broadcast::Sender<Arc<str>>,
    accept_task: JoinHandle<()>,
    socket_path: PathBuf,
}

fn io_context(err: io::Error, context: String) -> Error {
    Error::Io(io::Error::new(err.kind(), format!("{context}: {err}")))
}

impl EventSocket {
    /// Bind `path`, replacing a stale socket file, and start accepting clients.
    pub async fn bind(path: &Path) -> Result<Self> {
        if let Some(parent) = path.parent().filter(|p| !p.as_os_str().is_empty()) {
            tokio::fs::create_dir_all(parent)
                .await
                .map_err(|e| io_context(e, format!("Failed to create {}", parent.display())))?;
        }

        if tokio::fs::try_exists(path).await.unwrap_or(false) {
            tokio::fs::remove_file(path).await.map_err(|e| {
                io_context(e, format!("Failed to remove stale socket {}", path.display()))
            })?;
        }

        let listener = UnixListener::bind(path)
            .map_err(|e| io_context(e, format!("Failed to bind {}", path.display())))?;
        let (sender, _) = broadcast::channel(CHANNEL_CAPACITY);

        let accept_sender = sender.clone();
        let accept_task = tokio::spawn(async move {
            loop {
                match listener.accept().await {
                    Ok((stream, _)) => {
                        tracing::debug!(target: "voucherscan::output", "Event socket client connected");
                        tokio::spawn(stream_events(stream, accept_sender.subscribe()));
                    }
                    Err(err) => {
                        tracing::warn!(target: "voucherscan::output", error = %err, "Event socket accept failed");
                    }
                }
            }
        });

        tracing::info!(target: "voucherscan::output", path = %path.display(), "Streaming scan events");
        Ok(Self {
            sender,
            accept_task,
            socket_path: path.to_path_buf(),
        })
    }

    /// Path the socket is bound to
    pub fn path(&self) -> &Path {
        &self.socket_path
    }

    /// Number of connected clients
    pub fn client_count(&self) -> usize {
        self.sender.receiver_count()
    }

    /// Send a scan event to all clients. Returns how many received it.
    pub fn publish(&self, event: &ScanEvent) -> Result<usize> {
        let line = serde_json::to_string(&event_value(event))?;
        Ok(self.publish_line(line))
    }

    /// Send a pre-serialized JSON line. Having no clients is not an error.
    pub fn publish_line(&self, line: String) -> usize {
        self.sender.send(Arc::from(line)).unwrap_or(0)
    }
}

impl Drop for EventSocket {
    fn drop(&mut self) {
        self.accept_task.abort();
        if let Err(err) = std::fs::remove_file(&self.socket_path) {
            tracing::debug!(
                target: "voucherscan::output",
                path = %self.socket_path.display(),
                error = %err,
                "Failed to remove event socket"
            );
        }
    }
}

async fn stream_events(mut stream: UnixStream, mut rx: broadcast::Receiver<Arc<str>>) {
    loop {
        let line = match rx.recv().await {
            Ok(line) => line,
            Err(broadcast::error::RecvError::Lagged(missed)) => {
                tracing::debug!(target: "voucherscan::output", missed, "Event socket client lagging");
                continue;
            }
            Err(broadcast::error::RecvError::Closed) => break,
        };

        let write = async {
            stream.write_all(line.as_bytes()).await?;
            stream.write_all(b"\n").await?;
            stream.flush().await
        };
        if let Err(err) = write.await {
            tracing::debug!(target: "voucherscan::output", error = %err, "Event socket client dropped");
            break;
        }
    }
}
