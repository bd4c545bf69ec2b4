//! Connectionless media streaming for active calls.
//!
//! One engine per media kind (voice, video). An engine owns one UDP socket
//! bound at construction time; once started against a remote endpoint it runs
//! a send loop (pulling captured units from a [`FrameSource`]) and a receive
//! loop (publishing datagram payloads to subscribers). The engine is agnostic
//! to call semantics — the session controller points it somewhere and stops it.
//!
//! Capture and playback devices live behind the [`FrameSource`] trait and the
//! frame subscription: the collaborator that owns the devices constructs the
//! source, so device unavailability surfaces before the engine ever starts.

use std::fmt;
use std::net::{SocketAddr, UdpSocket};
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;
use tokio::sync::broadcast;

/// Largest UDP payload an engine will send or receive.
pub const MAX_DATAGRAM_SIZE: usize = 65_507;

/// Receive poll timeout; bounds how long `stop` takes to converge without
/// closing the socket.
const RECV_POLL_MS: u64 = 250;

/// Backoff when a source momentarily has nothing captured.
const SOURCE_IDLE_MS: u64 = 10;

/// Media kind carried by one engine instance.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum MediaKind {
    Voice,
    Video,
}

impl fmt::Display for MediaKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            MediaKind::Voice => write!(f, "voice"),
            MediaKind::Video => write!(f, "video"),
        }
    }
}

/// Media errors.
#[derive(Debug, thiserror::Error)]
pub enum MediaError {
    #[error("failed to bind media socket: {0}")]
    BindFailed(String),

    #[error("failed to clone media socket: {0}")]
    CloneFailed(String),

    #[error("media socket released")]
    Released,

    #[error("capture failed: {0}")]
    CaptureFailed(String),
}

/// Source of captured media units (one datagram each).
///
/// `next_frame` may block while capturing; it runs on a dedicated worker
/// thread. `Ok(0)` means nothing captured right now; an error ends the send
/// loop (the engine is then effectively stopped for sending).
pub trait FrameSource: Send {
    fn next_frame(&mut self, buf: &mut [u8]) -> Result<usize, MediaError>;
}

/// One media engine: a UDP socket, a send loop, and a receive loop.
pub struct MediaEngine {
    kind: MediaKind,
    local_port: u16,
    socket: Mutex<Option<UdpSocket>>,
    remote: Arc<Mutex<Option<SocketAddr>>>,
    source: Arc<Mutex<Option<Box<dyn FrameSource>>>>,
    frame_tx: broadcast::Sender<Vec<u8>>,
    running: Arc<AtomicBool>,
    // Bumped on every stop; the loops exit when their spawn-time value no
    // longer matches, so a quick stop/start cycle cannot resurrect them.
    generation: Arc<AtomicU64>,
}

impl MediaEngine {
    /// Bind the media socket on an ephemeral port. The port is fixed for the
    /// lifetime of the engine; bind failure is fatal to the caller.
    pub fn new(kind: MediaKind) -> Result<Self, MediaError> {
        let socket = UdpSocket::bind("0.0.0.0:0").map_err(|e| MediaError::BindFailed(e.to_string()))?;
        socket
            .set_read_timeout(Some(Duration::from_millis(RECV_POLL_MS)))
            .map_err(|e| MediaError::BindFailed(e.to_string()))?;
        let local_port = socket
            .local_addr()
            .map_err(|e| MediaError::BindFailed(e.to_string()))?
            .port();

        let (frame_tx, _) = broadcast::channel(64);

        Ok(Self {
            kind,
            local_port,
            socket: Mutex::new(Some(socket)),
            remote: Arc::new(Mutex::new(None)),
            source: Arc::new(Mutex::new(None)),
            frame_tx,
            running: Arc::new(AtomicBool::new(false)),
            generation: Arc::new(AtomicU64::new(0)),
        })
    }

    pub fn kind(&self) -> MediaKind {
        self.kind
    }

    /// Local port the media socket is bound to.
    pub fn local_port(&self) -> u16 {
        self.local_port
    }

    pub fn is_running(&self) -> bool {
        self.running.load(Ordering::SeqCst)
    }

    /// Install the capture source driving the send loop. Takes effect on the
    /// next `start`.
    pub fn set_source(&self, source: Box<dyn FrameSource>) {
        *self.source.lock().unwrap() = Some(source);
    }

    /// Subscribe to payloads received from the remote endpoint.
    pub fn subscribe_frames(&self) -> broadcast::Receiver<Vec<u8>> {
        self.frame_tx.subscribe()
    }

    /// Start streaming toward a remote endpoint. Calling `start` while
    /// already running repoints the remote endpoint without restarting the
    /// loops.
    pub fn start(&self, remote: SocketAddr) -> Result<(), MediaError> {
        *self.remote.lock().unwrap() = Some(remote);

        if self.running.swap(true, Ordering::SeqCst) {
            tracing::debug!("{} engine repointed to {}", self.kind, remote);
            return Ok(());
        }

        let (recv_socket, send_socket) = {
            let guard = self.socket.lock().unwrap();
            let Some(socket) = guard.as_ref() else {
                self.running.store(false, Ordering::SeqCst);
                return Err(MediaError::Released);
            };
            let recv = socket
                .try_clone()
                .map_err(|e| MediaError::CloneFailed(e.to_string()))?;
            let send = socket
                .try_clone()
                .map_err(|e| MediaError::CloneFailed(e.to_string()))?;
            (recv, send)
        };

        let generation = self.generation.load(Ordering::SeqCst);
        self.spawn_receive_loop(recv_socket, generation);
        if self.source.lock().unwrap().is_some() {
            self.spawn_send_loop(send_socket, generation);
        }

        tracing::info!(
            "{} engine started on port {} -> remote {}",
            self.kind,
            self.local_port,
            remote
        );
        Ok(())
    }

    fn spawn_receive_loop(&self, socket: UdpSocket, generation: u64) {
        let kind = self.kind;
        let running = Arc::clone(&self.running);
        let counter = Arc::clone(&self.generation);
        let frame_tx = self.frame_tx.clone();

        std::thread::spawn(move || {
            let mut buf = vec![0u8; MAX_DATAGRAM_SIZE];
            while counter.load(Ordering::SeqCst) == generation {
                match socket.recv_from(&mut buf) {
                    Ok((len, _from)) => {
                        if frame_tx.send(buf[..len].to_vec()).is_err() {
                            tracing::debug!("{} engine received {} bytes (no consumer)", kind, len);
                        }
                    }
                    Err(e)
                        if e.kind() == std::io::ErrorKind::WouldBlock
                            || e.kind() == std::io::ErrorKind::TimedOut =>
                    {
                        continue;
                    }
                    Err(e) => {
                        // Socket error mid-stream: the loop ends, the engine
                        // is considered stopped. No reconnection.
                        if running.swap(false, Ordering::SeqCst) {
                            tracing::warn!("{} engine receive loop ended: {}", kind, e);
                        }
                        counter.fetch_add(1, Ordering::SeqCst);
                        break;
                    }
                }
            }
        });
    }

    fn spawn_send_loop(&self, socket: UdpSocket, generation: u64) {
        let kind = self.kind;
        let running = Arc::clone(&self.running);
        let counter = Arc::clone(&self.generation);
        let remote = Arc::clone(&self.remote);
        let source = Arc::clone(&self.source);

        std::thread::spawn(move || {
            let mut buf = vec![0u8; MAX_DATAGRAM_SIZE];
            while counter.load(Ordering::SeqCst) == generation {
                let captured = {
                    let mut guard = source.lock().unwrap();
                    let Some(src) = guard.as_mut() else { break };
                    src.next_frame(&mut buf)
                };
                match captured {
                    Ok(0) => std::thread::sleep(Duration::from_millis(SOURCE_IDLE_MS)),
                    Ok(len) => {
                        let target = *remote.lock().unwrap();
                        if let Some(target) = target {
                            if let Err(e) = socket.send_to(&buf[..len], target) {
                                if running.load(Ordering::SeqCst) {
                                    tracing::warn!("{} engine send loop ended: {}", kind, e);
                                }
                                break;
                            }
                        }
                    }
                    Err(e) => {
                        if running.load(Ordering::SeqCst) {
                            tracing::warn!("{} engine capture ended: {}", kind, e);
                        }
                        break;
                    }
                }
            }
        });
    }

    /// Transmit one externally captured unit to the configured endpoint. A
    /// no-op with a logged warning when not running or not yet pointed at a
    /// remote endpoint.
    pub fn send_frame(&self, data: &[u8]) {
        if !self.running.load(Ordering::SeqCst) {
            tracing::warn!("{} engine send_frame while not running", self.kind);
            return;
        }
        let Some(target) = *self.remote.lock().unwrap() else {
            tracing::warn!("{} engine send_frame with no remote endpoint", self.kind);
            return;
        };
        let guard = self.socket.lock().unwrap();
        let Some(socket) = guard.as_ref() else {
            tracing::warn!("{} engine send_frame after release", self.kind);
            return;
        };
        if let Err(e) = socket.send_to(data, target) {
            tracing::warn!("{} engine failed to send frame: {}", self.kind, e);
        }
    }

    /// Halt the loops. The socket stays bound so a later call can reuse the
    /// same port; a no-op when not running.
    pub fn stop(&self) {
        if !self.running.swap(false, Ordering::SeqCst) {
            return;
        }
        self.generation.fetch_add(1, Ordering::SeqCst);
        *self.remote.lock().unwrap() = None;
        tracing::info!("{} engine stopped on port {}", self.kind, self.local_port);
    }

    /// Halt the loops and release the socket; reserved for process teardown.
    pub fn shutdown(&self) {
        self.stop();
        *self.socket.lock().unwrap() = None;
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::Duration;
    use tokio::time::timeout;

    /// Emits `limit` copies of `frame`, then reports idle forever.
    struct ScriptedSource {
        frame: Vec<u8>,
        sent: usize,
        limit: usize,
    }

    impl FrameSource for ScriptedSource {
        fn next_frame(&mut self, buf: &mut [u8]) -> Result<usize, MediaError> {
            if self.sent >= self.limit {
                std::thread::sleep(Duration::from_millis(20));
                return Ok(0);
            }
            self.sent += 1;
            buf[..self.frame.len()].copy_from_slice(&self.frame);
            std::thread::sleep(Duration::from_millis(5));
            Ok(self.frame.len())
        }
    }

    fn loopback(port: u16) -> SocketAddr {
        SocketAddr::from(([127, 0, 0, 1], port))
    }

    #[test]
    fn test_stop_when_not_running_is_noop() {
        let engine = MediaEngine::new(MediaKind::Voice).unwrap();
        assert!(!engine.is_running());
        engine.stop();
        engine.stop();
        assert!(!engine.is_running());
    }

    #[test]
    fn test_send_frame_when_not_running_is_noop() {
        let engine = MediaEngine::new(MediaKind::Video).unwrap();
        // Must not panic or send anything.
        engine.send_frame(b"frame");
    }

    #[test]
    fn test_stop_retires_loop_generation() {
        let engine = MediaEngine::new(MediaKind::Voice).unwrap();
        let before = engine.generation.load(Ordering::SeqCst);

        engine.start(loopback(9)).unwrap();
        engine.stop();
        // The spawned loops key off the old value and exit on mismatch.
        assert_eq!(engine.generation.load(Ordering::SeqCst), before + 1);

        // A redundant stop must not retire the next generation.
        engine.stop();
        assert_eq!(engine.generation.load(Ordering::SeqCst), before + 1);
        engine.shutdown();
    }

    #[test]
    fn test_start_keeps_local_port() {
        let engine = MediaEngine::new(MediaKind::Voice).unwrap();
        let port = engine.local_port();
        engine.start(loopback(9)).unwrap();
        assert_eq!(engine.local_port(), port);
        engine.start(loopback(10)).unwrap();
        assert_eq!(engine.local_port(), port);
        engine.shutdown();
    }

    #[tokio::test]
    async fn test_engine_pair_streams_frames() {
        let sender = MediaEngine::new(MediaKind::Voice).unwrap();
        let receiver = MediaEngine::new(MediaKind::Voice).unwrap();

        sender.set_source(Box::new(ScriptedSource {
            frame: vec![0xAB; 160],
            sent: 0,
            limit: 50,
        }));

        let mut frames = receiver.subscribe_frames();
        receiver.start(loopback(sender.local_port())).unwrap();
        sender.start(loopback(receiver.local_port())).unwrap();

        let frame = timeout(Duration::from_secs(5), frames.recv())
            .await
            .expect("timed out waiting for frame")
            .expect("frame channel closed");
        assert_eq!(frame, vec![0xAB; 160]);

        sender.shutdown();
        receiver.shutdown();
    }

    #[tokio::test]
    async fn test_restart_after_stop_streams_again() {
        let sender = MediaEngine::new(MediaKind::Voice).unwrap();
        let receiver = MediaEngine::new(MediaKind::Voice).unwrap();

        sender.set_source(Box::new(ScriptedSource {
            frame: vec![0xCD; 32],
            sent: 0,
            limit: usize::MAX,
        }));

        let remote = loopback(receiver.local_port());
        receiver.start(loopback(sender.local_port())).unwrap();
        sender.start(remote).unwrap();

        let mut frames = receiver.subscribe_frames();
        timeout(Duration::from_secs(5), frames.recv())
            .await
            .expect("timed out before stop")
            .expect("frame channel closed");

        // Restart immediately, well inside the receive poll window.
        sender.stop();
        assert!(!sender.is_running());
        sender.start(remote).unwrap();

        // The old loops must be gone once the poll window passes, and the
        // new ones must still be streaming.
        tokio::time::sleep(Duration::from_millis(600)).await;
        let mut frames = receiver.subscribe_frames();
        timeout(Duration::from_secs(5), frames.recv())
            .await
            .expect("timed out after restart")
            .expect("frame channel closed");

        sender.shutdown();
        receiver.shutdown();
    }

    #[tokio::test]
    async fn test_start_twice_repoints_remote() {
        let sender = MediaEngine::new(MediaKind::Video).unwrap();
        let first = MediaEngine::new(MediaKind::Video).unwrap();
        let second = MediaEngine::new(MediaKind::Video).unwrap();

        first.start(loopback(sender.local_port())).unwrap();
        second.start(loopback(sender.local_port())).unwrap();

        sender.start(loopback(first.local_port())).unwrap();
        let mut first_frames = first.subscribe_frames();
        sender.send_frame(b"one");
        let frame = timeout(Duration::from_secs(5), first_frames.recv())
            .await
            .expect("timed out")
            .expect("closed");
        assert_eq!(frame, b"one");

        // Repoint in place: same socket, new destination.
        sender.start(loopback(second.local_port())).unwrap();
        let mut second_frames = second.subscribe_frames();
        sender.send_frame(b"two");
        let frame = timeout(Duration::from_secs(5), second_frames.recv())
            .await
            .expect("timed out")
            .expect("closed");
        assert_eq!(frame, b"two");

        sender.shutdown();
        first.shutdown();
        second.shutdown();
    }
}
