//! Unix socket server for extension-facing connections.
//!
//! The host application binds a [`BridgeServer`] and hands each accepted
//! connection to [`serve_connection`], which runs a dedicated
//! [`ActionDispatcher`] over a JSON newline-delimited protocol. Each line is
//! a single JSON envelope; replies go out through a bounded per-connection
//! channel so deferred responses and direct replies share one writer.
//!
//! ## Socket Path
//!
//! The socket path follows the XDG Base Directory Specification:
//! - Primary: `$XDG_RUNTIME_DIR/vaultlink/browser.sock`
//! - Fallback: `/tmp/vaultlink-$UID/browser.sock`

use std::io;
use std::path::{Path, PathBuf};
use std::sync::Arc;

use serde_json::Value;
use tokio::io::{AsyncBufRead, AsyncBufReadExt, AsyncReadExt, AsyncWriteExt, BufReader};
use tokio::net::{UnixListener, UnixStream};
use tokio::sync::mpsc;
use tracing::{debug, warn};

use crate::dispatch::ActionDispatcher;
use crate::store::{BridgeSettings, CredentialStore};

/// Capacity of the per-connection outbound reply channel.
const REPLY_CHANNEL_CAPACITY: usize = 32;

/// A server that listens for extension connections on a Unix Domain Socket.
pub struct BridgeServer {
    listener: UnixListener,
}

impl BridgeServer {
    /// Binds the server to the specified socket path.
    ///
    /// Creates any missing parent directories and removes a stale socket
    /// file left behind by a previous run.
    ///
    /// # Errors
    ///
    /// Returns an error if:
    /// - The parent directories cannot be created
    /// - The existing socket cannot be removed
    /// - The socket cannot be bound
    pub async fn bind(path: &Path) -> Result<Self, io::Error> {
        if let Some(parent) = path.parent() {
            if !parent.exists() {
                std::fs::create_dir_all(parent)?;
            }
        }

        if path.exists() {
            std::fs::remove_file(path)?;
        }

        let listener = UnixListener::bind(path)?;

        Ok(Self { listener })
    }

    /// Accepts the next incoming connection.
    pub async fn accept(&self) -> Result<UnixStream, io::Error> {
        let (stream, _addr) = self.listener.accept().await?;
        Ok(stream)
    }

    /// Runs the accept loop, spawning one [`serve_connection`] task per
    /// client. Returns only on a listener error.
    pub async fn run(
        self,
        store: Arc<dyn CredentialStore>,
        settings: Arc<dyn BridgeSettings>,
        max_message_size: usize,
    ) -> Result<(), io::Error> {
        loop {
            let stream = self.accept().await?;
            let store = Arc::clone(&store);
            let settings = Arc::clone(&settings);
            tokio::spawn(async move {
                serve_connection(stream, store, settings, max_message_size).await;
            });
        }
    }
}

/// Drives one connection to completion.
///
/// Reads envelopes line by line, feeds them to a fresh dispatcher, and
/// writes replies in submission order. Returns when the peer disconnects or
/// sends a line above `max_message_size`.
pub async fn serve_connection(
    stream: UnixStream,
    store: Arc<dyn CredentialStore>,
    settings: Arc<dyn BridgeSettings>,
    max_message_size: usize,
) {
    let (read_half, write_half) = tokio::io::split(stream);
    let mut reader = BufReader::new(read_half);

    let (reply_tx, mut reply_rx) = mpsc::channel::<Value>(REPLY_CHANNEL_CAPACITY);
    let mut dispatcher = ActionDispatcher::new(store, settings, reply_tx.clone());

    // Writer task: single owner of the write half, so direct replies and
    // deferred generator responses cannot interleave mid-line.
    tokio::spawn(async move {
        let mut writer = write_half;
        while let Some(message) = reply_rx.recv().await {
            let mut json = message.to_string();
            json.push('\n');
            if writer.write_all(json.as_bytes()).await.is_err() {
                break;
            }
            if writer.flush().await.is_err() {
                break;
            }
        }
    });

    debug!("connection opened");
    loop {
        let message = match read_message(&mut reader, max_message_size).await {
            Ok(Some(message)) => message,
            Ok(None) => {
                debug!("connection closed by peer");
                break;
            }
            Err(ServerError::MessageTooLarge { size, max }) => {
                warn!(size, max, "dropping connection, message too large");
                break;
            }
            Err(err) => {
                // A malformed line still gets a structured error reply.
                warn!(error = %err, "unreadable message");
                Value::Null
            }
        };

        if let Some(response) = dispatcher.process_client_message(&message) {
            if reply_tx.send(response).await.is_err() {
                break;
            }
        }
    }
}

/// Reads one newline-delimited JSON value, refusing lines above `max` bytes.
///
/// Returns `Ok(None)` when the peer has disconnected.
async fn read_message<R>(reader: &mut R, max: usize) -> Result<Option<Value>, ServerError>
where
    R: AsyncBufRead + Unpin,
{
    let mut line = Vec::new();
    let limit = max as u64 + 1;
    let bytes_read = reader.take(limit).read_until(b'\n', &mut line).await?;

    if bytes_read == 0 {
        return Ok(None);
    }

    if line.last() != Some(&b'\n') && bytes_read as u64 == limit {
        return Err(ServerError::MessageTooLarge {
            size: line.len(),
            max,
        });
    }

    let message = serde_json::from_slice(&line)?;
    Ok(Some(message))
}

/// Errors that can occur while servicing a connection.
#[derive(Debug, thiserror::Error)]
pub enum ServerError {
    /// An I/O error occurred.
    #[error("I/O error: {0}")]
    Io(#[from] io::Error),

    /// The line was not valid JSON.
    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),

    /// The line exceeded the configured size limit.
    #[error("message of {size} bytes exceeds limit of {max} bytes")]
    MessageTooLarge { size: usize, max: usize },
}

/// Gets the default socket path for extension connections.
///
/// ## Path Resolution
///
/// 1. If `$XDG_RUNTIME_DIR` is set: `$XDG_RUNTIME_DIR/vaultlink/browser.sock`
/// 2. Otherwise: `/tmp/vaultlink-$UID/browser.sock`
///
/// XDG_RUNTIME_DIR is preferred because it is per-user with 0700
/// permissions and is cleaned up on logout.
#[cfg(unix)]
pub fn get_socket_path() -> PathBuf {
    use std::os::unix::fs::MetadataExt;

    if let Ok(runtime_dir) = std::env::var("XDG_RUNTIME_DIR") {
        PathBuf::from(runtime_dir)
            .join("vaultlink")
            .join("browser.sock")
    } else {
        let uid = std::fs::metadata("/proc/self")
            .map(|m| m.uid())
            .unwrap_or(0);

        PathBuf::from(format!("/tmp/vaultlink-{}", uid)).join("browser.sock")
    }
}

/// Non-Unix platforms are not supported for Unix Domain Sockets.
#[cfg(not(unix))]
pub fn get_socket_path() -> PathBuf {
    PathBuf::from("/tmp/vaultlink-unsupported/browser.sock")
}
