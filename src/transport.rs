//! Reliable control channel for chat, file transfer, and signaling.
//!
//! One TCP connection per exchange: an outbound send opens a fresh connection,
//! writes one framed payload, and closes; the accept loop hands every inbound
//! connection to a short-lived handler task. The transport knows nothing about
//! calls — signaling rides on ordinary `MSG` payloads and is decoded upstream.

use chrono::Utc;
use std::net::SocketAddr;
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use tokio::io::{self, AsyncReadExt, AsyncWriteExt};
use tokio::net::{TcpListener, TcpStream};
use tokio::sync::{mpsc, Notify};

use crate::protocol::{read_field, write_field, TAG_FILE, TAG_MSG};

/// Capacity of the inbound exchange queue.
const INBOUND_QUEUE_SIZE: usize = 64;

/// A decoded inbound exchange.
#[derive(Debug, Clone)]
pub enum Inbound {
    /// Chat text or a signaling envelope; delivered the instant it is read
    /// off the wire, no acknowledgement.
    Message { sender: String, content: String },

    /// A file already streamed to local storage.
    File {
        sender: String,
        filename: String,
        path: PathBuf,
        size: u64,
    },
}

/// Transport errors.
#[derive(Debug, thiserror::Error)]
pub enum TransportError {
    #[error("failed to bind control listener: {0}")]
    BindFailed(String),

    #[error("failed to connect to {0}: {1}")]
    ConnectFailed(SocketAddr, String),

    #[error("failed to send: {0}")]
    SendFailed(String),

    #[error("file not found: {0}")]
    FileNotFound(String),
}

/// Control-channel transport: one listening endpoint, one connection per unit
/// of work, fire-and-forget delivery.
#[derive(Clone)]
pub struct ControlTransport {
    local_name: String,
    local_port: u16,
    running: Arc<AtomicBool>,
    shutdown: Arc<Notify>,
}

impl ControlTransport {
    /// Bind an ephemeral listening endpoint and start accepting. Returns the
    /// transport handle and the stream of decoded inbound exchanges.
    pub async fn bind(
        local_name: &str,
        download_dir: &Path,
    ) -> Result<(Self, mpsc::Receiver<Inbound>), TransportError> {
        tokio::fs::create_dir_all(download_dir)
            .await
            .map_err(|e| TransportError::BindFailed(e.to_string()))?;

        let listener = TcpListener::bind("0.0.0.0:0")
            .await
            .map_err(|e| TransportError::BindFailed(e.to_string()))?;
        let local_port = listener
            .local_addr()
            .map_err(|e| TransportError::BindFailed(e.to_string()))?
            .port();

        let (tx, rx) = mpsc::channel(INBOUND_QUEUE_SIZE);
        let transport = Self {
            local_name: local_name.to_string(),
            local_port,
            running: Arc::new(AtomicBool::new(true)),
            shutdown: Arc::new(Notify::new()),
        };

        transport.spawn_accept_loop(listener, tx, download_dir.to_path_buf());
        tracing::info!("control transport listening on port {}", local_port);

        Ok((transport, rx))
    }

    fn spawn_accept_loop(
        &self,
        listener: TcpListener,
        events: mpsc::Sender<Inbound>,
        download_dir: PathBuf,
    ) {
        let running = Arc::clone(&self.running);
        let shutdown = Arc::clone(&self.shutdown);

        tokio::spawn(async move {
            loop {
                tokio::select! {
                    _ = shutdown.notified() => break,
                    accepted = listener.accept() => match accepted {
                        Ok((stream, peer)) => {
                            let events = events.clone();
                            let download_dir = download_dir.clone();
                            tokio::spawn(async move {
                                if let Err(e) = handle_connection(stream, &events, &download_dir).await {
                                    tracing::warn!("control exchange from {} failed: {}", peer, e);
                                }
                            });
                        }
                        Err(e) => {
                            if running.load(Ordering::SeqCst) {
                                tracing::warn!("accept failed: {}", e);
                            } else {
                                break;
                            }
                        }
                    }
                }
            }
            tracing::debug!("control accept loop exited");
        });
    }

    /// Port of the local listening endpoint.
    pub fn local_port(&self) -> u16 {
        self.local_port
    }

    /// Send one chat or signaling payload. Fire-and-forget: no
    /// acknowledgement, no retry.
    pub async fn send_text(&self, addr: SocketAddr, content: &str) -> Result<(), TransportError> {
        let mut stream = TcpStream::connect(addr)
            .await
            .map_err(|e| TransportError::ConnectFailed(addr, e.to_string()))?;
        write_message(&mut stream, &self.local_name, content)
            .await
            .map_err(|e| TransportError::SendFailed(e.to_string()))
    }

    /// Stream one file. Fails up front if the source does not exist.
    pub async fn send_file(&self, addr: SocketAddr, path: &Path) -> Result<u64, TransportError> {
        let metadata = tokio::fs::metadata(path)
            .await
            .map_err(|_| TransportError::FileNotFound(path.display().to_string()))?;
        if !metadata.is_file() {
            return Err(TransportError::FileNotFound(path.display().to_string()));
        }
        let size = metadata.len();
        let filename = path
            .file_name()
            .and_then(|n| n.to_str())
            .unwrap_or("file")
            .to_string();

        let mut stream = TcpStream::connect(addr)
            .await
            .map_err(|e| TransportError::ConnectFailed(addr, e.to_string()))?;
        stream_file(&mut stream, &self.local_name, &filename, size, path)
            .await
            .map_err(|e| TransportError::SendFailed(e.to_string()))?;

        tracing::info!("sent file {} ({} bytes) to {}", filename, size, addr);
        Ok(size)
    }

    /// Close the listening endpoint. In-flight handlers finish naturally.
    pub fn stop(&self) {
        if self.running.swap(false, Ordering::SeqCst) {
            self.shutdown.notify_waiters();
        }
    }
}

async fn write_message(stream: &mut TcpStream, sender: &str, content: &str) -> io::Result<()> {
    write_field(stream, TAG_MSG).await?;
    write_field(stream, sender).await?;
    write_field(stream, content).await?;
    stream.flush().await?;
    stream.shutdown().await
}

async fn stream_file(
    stream: &mut TcpStream,
    sender: &str,
    filename: &str,
    size: u64,
    path: &Path,
) -> io::Result<()> {
    write_field(stream, TAG_FILE).await?;
    write_field(stream, sender).await?;
    write_field(stream, filename).await?;
    stream.write_u64(size).await?;

    let mut file = tokio::fs::File::open(path).await?;
    io::copy(&mut file, stream).await?;
    stream.flush().await?;
    stream.shutdown().await
}

async fn handle_connection(
    mut stream: TcpStream,
    events: &mpsc::Sender<Inbound>,
    download_dir: &Path,
) -> io::Result<()> {
    let tag = read_field(&mut stream).await?;
    match tag.as_str() {
        TAG_MSG => {
            let sender = read_field(&mut stream).await?;
            let content = read_field(&mut stream).await?;
            let _ = events.send(Inbound::Message { sender, content }).await;
        }
        TAG_FILE => {
            let sender = read_field(&mut stream).await?;
            let filename = read_field(&mut stream).await?;
            let size = stream.read_u64().await?;
            let path = store_file(&mut stream, download_dir, &filename, size).await?;
            let _ = events
                .send(Inbound::File {
                    sender,
                    filename,
                    path,
                    size,
                })
                .await;
        }
        other => {
            // Not a hard error; the peer may simply be newer than us.
            tracing::warn!("unknown control tag {:?}; closing connection", other);
        }
    }
    Ok(())
}

async fn store_file(
    stream: &mut TcpStream,
    download_dir: &Path,
    filename: &str,
    size: u64,
) -> io::Result<PathBuf> {
    let name = sanitize_filename(filename);
    let path = download_dir.join(format!("received_{}_{}", Utc::now().timestamp_millis(), name));

    let mut file = tokio::fs::File::create(&path).await?;
    let copied = io::copy(&mut stream.take(size), &mut file).await?;
    file.flush().await?;

    if copied < size {
        tracing::warn!("file {} truncated: {} of {} bytes received", name, copied, size);
    }
    Ok(path)
}

/// Keep only the final path component of a peer-supplied filename.
fn sanitize_filename(filename: &str) -> &str {
    filename
        .rsplit(['/', '\\'])
        .next()
        .filter(|name| !name.is_empty())
        .unwrap_or("file")
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_sanitize_filename() {
        assert_eq!(sanitize_filename("report.pdf"), "report.pdf");
        assert_eq!(sanitize_filename("../../etc/passwd"), "passwd");
        assert_eq!(sanitize_filename("C:\\temp\\notes.txt"), "notes.txt");
        assert_eq!(sanitize_filename(""), "file");
        assert_eq!(sanitize_filename("dir/"), "file");
    }
}
