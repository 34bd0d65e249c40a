//! Relay between the browser's stdio framing and the store's Unix socket.
//!
//! The proxy binary runs one relay. Frames from the browser arrive on stdin
//! in native-messaging format, cross a bounded channel, and leave on the
//! socket as newline-delimited JSON; socket lines travel the same road in
//! reverse. The relay owns the connection lifecycle: it connects on startup,
//! announces each successful connect to the browser, and retries on a fixed
//! delay while the store is away.

use std::io::{Read, Write};
use std::path::PathBuf;
use std::time::Duration;

use protocol::messages::reconnected_notification;
use protocol::{read_frame, write_frame};
use tokio::io::{AsyncBufReadExt, AsyncReadExt, AsyncWriteExt, BufReader};
use tokio::net::UnixStream;
use tokio::sync::mpsc;
use tracing::{debug, info, warn};

/// Delay between reconnection attempts once a connect has failed or a
/// connection has dropped.
pub const DEFAULT_RECONNECT_DELAY: Duration = Duration::from_secs(1);

/// Capacity of the stdin-to-relay and relay-to-stdout handoff channels.
const HANDOFF_CAPACITY: usize = 16;

/// Relay settings, resolved from config and CLI by the proxy binary.
#[derive(Debug, Clone)]
pub struct RelayConfig {
    /// Unix socket the credential store listens on.
    pub socket_path: PathBuf,
    /// Fixed delay between reconnection attempts.
    pub reconnect_delay: Duration,
    /// Upper bound for a single browser frame.
    pub max_frame_size: usize,
}

/// How one connected stretch ended.
enum LinkEnd {
    /// The browser closed stdin; the relay is done.
    HostClosed,
    /// The store went away; the relay should reconnect.
    SocketClosed,
}

/// Runs the relay until the browser side disconnects.
///
/// `host_rx` carries frames read from stdin, `host_tx` delivers frames to
/// be written to stdout. Frames arriving while the socket is down are
/// dropped; the extension retries on its own schedule.
pub async fn run_relay(
    mut host_rx: mpsc::Receiver<Vec<u8>>,
    host_tx: mpsc::Sender<Vec<u8>>,
    config: RelayConfig,
) -> std::io::Result<()> {
    loop {
        match UnixStream::connect(&config.socket_path).await {
            Ok(stream) => {
                info!(path = %config.socket_path.display(), "connected to credential store");

                // Tell the extension the link is up so it can re-handshake;
                // the previous session died with the old connection.
                let notification = reconnected_notification().to_string().into_bytes();
                if host_tx.send(notification).await.is_err() {
                    return Ok(());
                }

                match pump(stream, &mut host_rx, &host_tx, config.max_frame_size).await {
                    LinkEnd::HostClosed => return Ok(()),
                    LinkEnd::SocketClosed => {
                        info!("credential store disconnected");
                    }
                }
            }
            Err(err) => {
                debug!(error = %err, "connect failed");
            }
        }

        if !wait_for_retry(&mut host_rx, config.reconnect_delay).await {
            return Ok(());
        }
    }
}

/// Forwards traffic in both directions until either side goes away.
///
/// Socket lines are read under `max_frame_size`; a line that exceeds the
/// cap, or a stream that ends mid-line, tears the connection down instead
/// of forwarding a partial or oversized message to the browser.
async fn pump(
    stream: UnixStream,
    host_rx: &mut mpsc::Receiver<Vec<u8>>,
    host_tx: &mpsc::Sender<Vec<u8>>,
    max_frame_size: usize,
) -> LinkEnd {
    let (read_half, write_half) = stream.into_split();
    let mut reader = BufReader::new(read_half);
    let mut writer = write_half;
    let mut line = Vec::new();

    loop {
        // One byte past the cap distinguishes an exactly-max line (which
        // still carries its newline within budget) from an oversized one.
        let budget = (max_frame_size + 1).saturating_sub(line.len()) as u64;
        let mut limited = (&mut reader).take(budget);
        tokio::select! {
            frame = host_rx.recv() => match frame {
                Some(frame) => {
                    if writer.write_all(&frame).await.is_err()
                        || writer.write_all(b"\n").await.is_err()
                        || writer.flush().await.is_err()
                    {
                        return LinkEnd::SocketClosed;
                    }
                }
                None => return LinkEnd::HostClosed,
            },
            // read_until is cancel safe; partial reads stay in `line`.
            result = limited.read_until(b'\n', &mut line) => match result {
                Ok(0) | Err(_) => return LinkEnd::SocketClosed,
                Ok(_) => {
                    if line.last() != Some(&b'\n') {
                        // Either past the cap or the socket ended mid-line;
                        // the partial bytes never reach the browser.
                        if line.len() > max_frame_size {
                            warn!(len = line.len(), "dropping oversized socket message");
                        }
                        return LinkEnd::SocketClosed;
                    }
                    line.pop();
                    if host_tx.send(std::mem::take(&mut line)).await.is_err() {
                        return LinkEnd::HostClosed;
                    }
                }
            },
        }
    }
}

/// Sleeps out the reconnect delay, discarding browser frames meanwhile.
///
/// Returns `false` when the browser side has closed and the relay should
/// exit instead of retrying.
async fn wait_for_retry(host_rx: &mut mpsc::Receiver<Vec<u8>>, delay: Duration) -> bool {
    let deadline = tokio::time::sleep(delay);
    tokio::pin!(deadline);

    loop {
        tokio::select! {
            () = &mut deadline => return true,
            frame = host_rx.recv() => match frame {
                Some(frame) => {
                    debug!(len = frame.len(), "dropping frame while disconnected");
                }
                None => return false,
            },
        }
    }
}

/// Spawns the blocking stdin reader thread.
///
/// Frames flow into the returned channel; the thread stops on end of
/// stream, a zero-length frame, or a framing error.
pub fn spawn_host_reader<R>(mut reader: R, max_frame_size: usize) -> mpsc::Receiver<Vec<u8>>
where
    R: Read + Send + 'static,
{
    let (tx, rx) = mpsc::channel(HANDOFF_CAPACITY);
    std::thread::spawn(move || loop {
        match read_frame(&mut reader, max_frame_size) {
            Ok(Some(frame)) => {
                if tx.blocking_send(frame).is_err() {
                    break;
                }
            }
            Ok(None) => {
                debug!("host stream ended");
                break;
            }
            Err(err) => {
                warn!(error = %err, "host framing error");
                break;
            }
        }
    });
    rx
}

/// Spawns the blocking stdout writer task.
///
/// Frames sent to the returned channel leave as native-messaging frames;
/// the task stops when all senders drop or the stream breaks.
pub fn spawn_host_writer<W>(writer: W) -> mpsc::Sender<Vec<u8>>
where
    W: Write + Send + 'static,
{
    let (tx, rx) = mpsc::channel(HANDOFF_CAPACITY);
    tokio::task::spawn_blocking(move || run_host_writer(rx, writer));
    tx
}

fn run_host_writer<W: Write>(mut rx: mpsc::Receiver<Vec<u8>>, mut writer: W) {
    while let Some(frame) = rx.blocking_recv() {
        if let Err(err) = write_frame(&mut writer, &frame) {
            warn!(error = %err, "host write failed");
            break;
        }
    }
}
