//! Call state machine and session facade.
//!
//! One controller per process, one call slot per controller. Signaling arrives
//! as decoded [`Signal`] values from the control channel; user intents arrive
//! as method calls. Both funnel into the same call slot, guarded by a plain
//! mutex that is never held across an await, so every transition is atomic
//! with respect to both sources. Everything observable surfaces on a single
//! broadcast stream of [`SessionEvent`].

use std::fmt;
use std::net::{IpAddr, SocketAddr};
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use tokio::sync::broadcast;
use uuid::Uuid;

use crate::config::NetworkConfig;
use crate::discovery::{
    self, DiscoveryError, DiscoveryEvent, DiscoveryService, PeerDirectory, PeerRecord,
};
use crate::media::{FrameSource, MediaEngine, MediaError, MediaKind};
use crate::protocol::Signal;
use crate::transport::{ControlTransport, Inbound, TransportError};

/// Capacity of the session event stream.
const EVENT_QUEUE_SIZE: usize = 128;

/// How often an armed video watcher re-checks that its session still exists.
const VIDEO_WATCH_POLL_MS: u64 = 250;

/// Kind of call being placed or answered.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CallKind {
    Voice,
    Video,
}

impl fmt::Display for CallKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            CallKind::Voice => write!(f, "voice"),
            CallKind::Video => write!(f, "video"),
        }
    }
}

/// Which side placed the call.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CallDirection {
    Outgoing,
    Incoming,
}

/// Call slot state.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CallState {
    /// No call; the slot is free.
    Idle,
    /// We sent a request and are waiting for the answer.
    OutgoingPending,
    /// A request from a peer is waiting for the local answer.
    IncomingPending,
    /// Media is flowing.
    Active,
}

/// The one call a controller can carry at a time.
#[derive(Debug, Clone)]
pub struct CallSession {
    pub id: Uuid,
    pub remote_peer: String,
    pub remote_ip: Option<IpAddr>,
    pub direction: CallDirection,
    pub kind: CallKind,
    pub state: CallState,
    pub remote_voice_port: Option<u16>,
    pub remote_video_port: Option<u16>,
}

impl CallSession {
    fn outgoing(peer: &str, kind: CallKind) -> Self {
        Self {
            id: Uuid::new_v4(),
            remote_peer: peer.to_string(),
            remote_ip: None,
            direction: CallDirection::Outgoing,
            kind,
            state: CallState::OutgoingPending,
            remote_voice_port: None,
            remote_video_port: None,
        }
    }

    fn incoming(
        peer: &str,
        kind: CallKind,
        ip: IpAddr,
        voice_port: u16,
        video_port: Option<u16>,
    ) -> Self {
        Self {
            id: Uuid::new_v4(),
            remote_peer: peer.to_string(),
            remote_ip: Some(ip),
            direction: CallDirection::Incoming,
            kind,
            state: CallState::IncomingPending,
            remote_voice_port: Some(voice_port),
            remote_video_port: video_port,
        }
    }
}

/// Session event.
#[derive(Debug, Clone)]
pub enum SessionEvent {
    PeerOnline { name: String, address: SocketAddr },
    PeerOffline { name: String },
    MessageReceived { sender: String, content: String },
    FileReceived {
        sender: String,
        filename: String,
        path: PathBuf,
        size: u64,
    },
    IncomingCall {
        caller: String,
        address: IpAddr,
        voice_port: u16,
        kind: CallKind,
    },
    CallStarted { peer: String, kind: CallKind },
    CallEnded { peer: String },
    CallRejected { peer: String },
    CallTimedOut { peer: String },
    RemoteVideoOn { peer: String },
    RemoteVideoOff { peer: String },
}

/// Session errors.
#[derive(Debug, thiserror::Error)]
pub enum SessionError {
    #[error("session already started")]
    AlreadyStarted,

    #[error("session not started")]
    NotStarted,

    #[error("display name must be non-empty and must not contain '|'")]
    InvalidName,

    #[error("a call is already in progress")]
    CallInProgress,

    #[error("no incoming call to answer")]
    NoPendingCall,

    #[error("no call to hang up")]
    NoActiveCall,

    #[error("unknown peer: {0}")]
    UnknownPeer(String),

    #[error(transparent)]
    Transport(#[from] TransportError),

    #[error(transparent)]
    Discovery(#[from] DiscoveryError),

    #[error(transparent)]
    Media(#[from] MediaError),
}

/// Outcome of an inbound call request, decided under the call-slot lock.
enum RequestAction {
    Surface,
    Busy,
    Ignore,
}

/// State shared between the controller facade and its background tasks.
#[derive(Clone)]
struct Shared {
    local_name: String,
    config: NetworkConfig,
    directory: Arc<PeerDirectory>,
    transport: Arc<Mutex<Option<ControlTransport>>>,
    voice: Arc<MediaEngine>,
    video: Arc<MediaEngine>,
    call: Arc<Mutex<Option<CallSession>>>,
    event_tx: broadcast::Sender<SessionEvent>,
}

impl Shared {
    fn transport(&self) -> Result<ControlTransport, SessionError> {
        self.transport
            .lock()
            .unwrap()
            .clone()
            .ok_or(SessionError::NotStarted)
    }

    fn emit(&self, event: SessionEvent) {
        // Zero subscribers is not an error; events are advisory.
        let _ = self.event_tx.send(event);
    }

    async fn handle_inbound(&self, inbound: Inbound) {
        match inbound {
            Inbound::Message { sender, content } => match Signal::parse(&content) {
                Some(signal) => self.handle_signal(signal).await,
                None => self.emit(SessionEvent::MessageReceived { sender, content }),
            },
            Inbound::File {
                sender,
                filename,
                path,
                size,
            } => {
                tracing::info!("received file {} ({} bytes) from {}", filename, size, sender);
                self.emit(SessionEvent::FileReceived {
                    sender,
                    filename,
                    path,
                    size,
                });
            }
        }
    }

    async fn handle_signal(&self, signal: Signal) {
        match signal {
            Signal::CallRequest {
                caller,
                ip,
                voice_port,
            } => self.handle_call_request(caller, ip, voice_port, None).await,
            Signal::CallRequestVideo {
                caller,
                ip,
                voice_port,
                video_port,
            } => {
                self.handle_call_request(caller, ip, voice_port, Some(video_port))
                    .await
            }
            Signal::CallAccept {
                accepter,
                ip,
                voice_port,
            } => self.handle_call_accept(accepter, ip, voice_port, None),
            Signal::CallAcceptVideo {
                accepter,
                ip,
                voice_port,
                video_port,
            } => self.handle_call_accept(accepter, ip, voice_port, Some(video_port)),
            Signal::CallEnd { peer } => self.handle_call_end(&peer),
            Signal::CallReject { peer } => self.handle_call_reject(&peer),
            Signal::Offline { peer } => {
                if self.directory.remove(&peer) {
                    tracing::info!("peer {} went offline", peer);
                    self.emit(SessionEvent::PeerOffline { name: peer });
                }
            }
        }
    }

    async fn handle_call_request(
        &self,
        caller: String,
        ip: IpAddr,
        voice_port: u16,
        video_port: Option<u16>,
    ) {
        let kind = if video_port.is_some() {
            CallKind::Video
        } else {
            CallKind::Voice
        };

        let action = {
            let mut call = self.call.lock().unwrap();
            match call.as_ref() {
                None => {
                    *call = Some(CallSession::incoming(&caller, kind, ip, voice_port, video_port));
                    RequestAction::Surface
                }
                Some(cur) if cur.remote_peer == caller && cur.state == CallState::OutgoingPending => {
                    // Crossing requests. The lexicographically smaller name
                    // yields its outgoing attempt and takes the callee role,
                    // so exactly one call survives on both machines.
                    if self.local_name < caller {
                        *call =
                            Some(CallSession::incoming(&caller, kind, ip, voice_port, video_port));
                        RequestAction::Surface
                    } else {
                        RequestAction::Ignore
                    }
                }
                Some(cur) if cur.remote_peer == caller => RequestAction::Ignore,
                Some(_) => RequestAction::Busy,
            }
        };

        match action {
            RequestAction::Surface => {
                tracing::info!("incoming {} call from {}", kind, caller);
                self.emit(SessionEvent::IncomingCall {
                    caller,
                    address: ip,
                    voice_port,
                    kind,
                });
            }
            RequestAction::Busy => {
                tracing::info!("busy; rejecting {} call from {}", kind, caller);
                self.send_reject_best_effort(&caller).await;
            }
            RequestAction::Ignore => {
                tracing::debug!("ignoring duplicate call request from {}", caller);
            }
        }
    }

    async fn send_reject_best_effort(&self, peer: &str) {
        let Ok(transport) = self.transport() else {
            return;
        };
        let Some(addr) = self.directory.lookup(peer) else {
            tracing::warn!("no known address for {}; reject not delivered", peer);
            return;
        };
        let reject = Signal::CallReject {
            peer: self.local_name.clone(),
        };
        if let Err(e) = transport.send_text(addr, &reject.encode()).await {
            tracing::warn!("failed to deliver reject to {}: {}", peer, e);
        }
    }

    fn handle_call_accept(
        &self,
        accepter: String,
        ip: IpAddr,
        voice_port: u16,
        video_port: Option<u16>,
    ) {
        let accept_kind = if video_port.is_some() {
            CallKind::Video
        } else {
            CallKind::Voice
        };

        let activated = {
            let mut call = self.call.lock().unwrap();
            match call.as_mut() {
                Some(cur)
                    if cur.state == CallState::OutgoingPending
                        && cur.remote_peer == accepter
                        && cur.kind == accept_kind =>
                {
                    cur.state = CallState::Active;
                    cur.remote_ip = Some(ip);
                    cur.remote_voice_port = Some(voice_port);
                    cur.remote_video_port = video_port;
                    Some(cur.id)
                }
                _ => None,
            }
        };

        let Some(id) = activated else {
            tracing::debug!("ignoring stray accept from {}", accepter);
            return;
        };

        self.start_media(Some(ip), Some(voice_port), video_port, accept_kind);
        if accept_kind == CallKind::Video {
            self.watch_remote_video(accepter.clone(), id);
        }
        tracing::info!("{} call with {} active", accept_kind, accepter);
        self.emit(SessionEvent::CallStarted {
            peer: accepter,
            kind: accept_kind,
        });
    }

    fn handle_call_end(&self, peer: &str) {
        let session = {
            let mut call = self.call.lock().unwrap();
            match call.as_ref() {
                Some(cur) if cur.remote_peer == peer => call.take(),
                _ => None,
            }
        };
        let Some(session) = session else {
            tracing::debug!("ignoring stray call end from {}", peer);
            return;
        };

        self.teardown_media(&session);
        tracing::info!("call with {} ended by remote", peer);
        self.emit(SessionEvent::CallEnded {
            peer: session.remote_peer,
        });
    }

    fn handle_call_reject(&self, peer: &str) {
        let session = {
            let mut call = self.call.lock().unwrap();
            match call.as_ref() {
                Some(cur) if cur.state == CallState::OutgoingPending && cur.remote_peer == peer => {
                    call.take()
                }
                _ => None,
            }
        };
        let Some(session) = session else {
            tracing::debug!("ignoring stray reject from {}", peer);
            return;
        };

        tracing::info!("{} rejected the call", peer);
        self.emit(SessionEvent::CallRejected {
            peer: session.remote_peer,
        });
    }

    /// Point the engines at the remote media endpoints. Media failure does
    /// not tear the call down; signaling already committed it.
    fn start_media(
        &self,
        remote_ip: Option<IpAddr>,
        voice_port: Option<u16>,
        video_port: Option<u16>,
        kind: CallKind,
    ) {
        let Some(ip) = remote_ip else {
            tracing::warn!("no remote address for media");
            return;
        };
        if let Some(port) = voice_port {
            if let Err(e) = self.voice.start(SocketAddr::new(ip, port)) {
                tracing::warn!("failed to start voice engine: {}", e);
            }
        }
        if kind == CallKind::Video {
            match video_port {
                Some(port) => {
                    if let Err(e) = self.video.start(SocketAddr::new(ip, port)) {
                        tracing::warn!("failed to start video engine: {}", e);
                    }
                }
                None => tracing::warn!("video call without a remote video port"),
            }
        }
    }

    fn teardown_media(&self, session: &CallSession) {
        self.voice.stop();
        if session.kind == CallKind::Video {
            self.video.stop();
            if session.state == CallState::Active {
                self.emit(SessionEvent::RemoteVideoOff {
                    peer: session.remote_peer.clone(),
                });
            }
        }
    }

    /// Announce the remote camera once the first video payload arrives for
    /// the session the watcher was armed for. A watcher left over from an
    /// ended or replaced call exits without announcing.
    fn watch_remote_video(&self, peer: String, id: Uuid) {
        let mut frames = self.video.subscribe_frames();
        let shared = self.clone();

        tokio::spawn(async move {
            loop {
                tokio::select! {
                    received = frames.recv() => match received {
                        Ok(_frame) => {
                            let live = {
                                let call = shared.call.lock().unwrap();
                                matches!(
                                    call.as_ref(),
                                    Some(c) if c.id == id && c.state == CallState::Active
                                )
                            };
                            if live {
                                shared.emit(SessionEvent::RemoteVideoOn { peer });
                            }
                            break;
                        }
                        Err(broadcast::error::RecvError::Lagged(_)) => continue,
                        Err(broadcast::error::RecvError::Closed) => break,
                    },
                    _ = tokio::time::sleep(Duration::from_millis(VIDEO_WATCH_POLL_MS)) => {
                        let armed = {
                            let call = shared.call.lock().unwrap();
                            call.as_ref().map(|c| c.id) == Some(id)
                        };
                        if !armed {
                            break;
                        }
                    }
                }
            }
        });
    }

    /// Give up on an unanswered outgoing call after the configured timeout.
    fn spawn_call_watchdog(&self, id: Uuid, timeout: Duration) {
        let shared = self.clone();

        tokio::spawn(async move {
            tokio::time::sleep(timeout).await;
            let session = {
                let mut call = shared.call.lock().unwrap();
                match call.as_ref() {
                    Some(cur) if cur.id == id && cur.state == CallState::OutgoingPending => {
                        call.take()
                    }
                    _ => None,
                }
            };
            let Some(session) = session else { return };

            tracing::info!("call to {} timed out", session.remote_peer);
            if let Ok(transport) = shared.transport() {
                if let Some(addr) = shared.directory.lookup(&session.remote_peer) {
                    let end = Signal::CallEnd {
                        peer: shared.local_name.clone(),
                    };
                    if let Err(e) = transport.send_text(addr, &end.encode()).await {
                        tracing::debug!(
                            "timeout notice to {} not delivered: {}",
                            session.remote_peer,
                            e
                        );
                    }
                }
            }
            shared.emit(SessionEvent::CallTimedOut {
                peer: session.remote_peer,
            });
        });
    }
}

/// The peer session facade: discovery, chat, file transfer, and calls behind
/// one handle.
pub struct SessionController {
    shared: Shared,
    discovery: Mutex<Option<DiscoveryService>>,
    started: AtomicBool,
    shut_down: AtomicBool,
}

impl SessionController {
    /// Create a controller. Binds the media sockets immediately so their
    /// ports are stable for the controller's lifetime; nothing listens until
    /// [`start`](Self::start).
    pub fn new(local_name: &str, config: NetworkConfig) -> Result<Self, SessionError> {
        if local_name.is_empty() || local_name.contains('|') {
            return Err(SessionError::InvalidName);
        }

        let (event_tx, _) = broadcast::channel(EVENT_QUEUE_SIZE);
        let shared = Shared {
            local_name: local_name.to_string(),
            config,
            directory: Arc::new(PeerDirectory::new()),
            transport: Arc::new(Mutex::new(None)),
            voice: Arc::new(MediaEngine::new(MediaKind::Voice)?),
            video: Arc::new(MediaEngine::new(MediaKind::Video)?),
            call: Arc::new(Mutex::new(None)),
            event_tx,
        };

        Ok(Self {
            shared,
            discovery: Mutex::new(None),
            started: AtomicBool::new(false),
            shut_down: AtomicBool::new(false),
        })
    }

    /// Bind the control listener, start dispatching inbound exchanges, and
    /// (when enabled) join the discovery multicast group.
    pub async fn start(&self) -> Result<(), SessionError> {
        if self.started.swap(true, Ordering::SeqCst) {
            return Err(SessionError::AlreadyStarted);
        }

        let (transport, mut inbound) = match ControlTransport::bind(
            &self.shared.local_name,
            &self.shared.config.download_dir,
        )
        .await
        {
            Ok(pair) => pair,
            Err(e) => {
                self.started.store(false, Ordering::SeqCst);
                return Err(e.into());
            }
        };
        let control_port = transport.local_port();
        *self.shared.transport.lock().unwrap() = Some(transport);

        let shared = self.shared.clone();
        tokio::spawn(async move {
            while let Some(exchange) = inbound.recv().await {
                shared.handle_inbound(exchange).await;
            }
            tracing::debug!("inbound dispatch loop exited");
        });

        if self.shared.config.discovery_enabled {
            let mut service = DiscoveryService::new(
                &self.shared.local_name,
                control_port,
                self.shared.config.clone(),
                Arc::clone(&self.shared.directory),
            );

            let mut events = service.subscribe();
            let shared = self.shared.clone();
            tokio::spawn(async move {
                loop {
                    match events.recv().await {
                        Ok(DiscoveryEvent::PeerOnline { name, address }) => {
                            shared.emit(SessionEvent::PeerOnline { name, address });
                        }
                        Ok(DiscoveryEvent::PeerExpired { name }) => {
                            shared.emit(SessionEvent::PeerOffline { name });
                        }
                        Err(broadcast::error::RecvError::Lagged(_)) => continue,
                        Err(broadcast::error::RecvError::Closed) => break,
                    }
                }
            });

            if let Err(e) = service.start().await {
                if let Some(transport) = self.shared.transport.lock().unwrap().take() {
                    transport.stop();
                }
                self.started.store(false, Ordering::SeqCst);
                return Err(e.into());
            }
            *self.discovery.lock().unwrap() = Some(service);
        }

        tracing::info!(
            "session {} started on control port {}",
            self.shared.local_name,
            control_port
        );
        Ok(())
    }

    /// Send chat text to a known peer.
    pub async fn send_text(&self, peer: &str, content: &str) -> Result<(), SessionError> {
        let transport = self.shared.transport()?;
        let addr = self.lookup_peer(peer)?;
        transport.send_text(addr, content).await?;
        Ok(())
    }

    /// Stream a file to a known peer; returns its size in bytes.
    pub async fn send_file(&self, peer: &str, path: &Path) -> Result<u64, SessionError> {
        let transport = self.shared.transport()?;
        let addr = self.lookup_peer(peer)?;
        Ok(transport.send_file(addr, path).await?)
    }

    /// Place a call. The call slot is reserved before the request leaves so a
    /// crossing inbound request cannot claim it; on send failure the slot is
    /// released untouched.
    pub async fn start_call(&self, peer: &str, kind: CallKind) -> Result<(), SessionError> {
        let transport = self.shared.transport()?;
        let addr = self.lookup_peer(peer)?;

        let id = {
            let mut call = self.shared.call.lock().unwrap();
            if call.is_some() {
                return Err(SessionError::CallInProgress);
            }
            let session = CallSession::outgoing(peer, kind);
            let id = session.id;
            *call = Some(session);
            id
        };

        let local_ip = discovery::local_ip_best_effort();
        let signal = match kind {
            CallKind::Voice => Signal::CallRequest {
                caller: self.shared.local_name.clone(),
                ip: local_ip,
                voice_port: self.shared.voice.local_port(),
            },
            CallKind::Video => Signal::CallRequestVideo {
                caller: self.shared.local_name.clone(),
                ip: local_ip,
                voice_port: self.shared.voice.local_port(),
                video_port: self.shared.video.local_port(),
            },
        };

        if let Err(e) = transport.send_text(addr, &signal.encode()).await {
            let mut call = self.shared.call.lock().unwrap();
            if call.as_ref().map(|c| c.id) == Some(id) {
                *call = None;
            }
            return Err(e.into());
        }

        if let Some(timeout) = self.shared.config.call_timeout {
            self.shared.spawn_call_watchdog(id, timeout);
        }
        tracing::info!("requested {} call with {}", kind, peer);
        Ok(())
    }

    /// Answer the pending incoming call. The acceptance is sent first; the
    /// slot only moves to active if the call is still pending afterward (the
    /// caller may have hung up in between).
    pub async fn accept_call(&self) -> Result<(), SessionError> {
        let transport = self.shared.transport()?;

        let (id, peer, kind) = {
            let call = self.shared.call.lock().unwrap();
            match call.as_ref() {
                Some(c) if c.state == CallState::IncomingPending => {
                    (c.id, c.remote_peer.clone(), c.kind)
                }
                _ => return Err(SessionError::NoPendingCall),
            }
        };
        let addr = self.lookup_peer(&peer)?;

        let local_ip = discovery::local_ip_best_effort();
        let signal = match kind {
            CallKind::Voice => Signal::CallAccept {
                accepter: self.shared.local_name.clone(),
                ip: local_ip,
                voice_port: self.shared.voice.local_port(),
            },
            CallKind::Video => Signal::CallAcceptVideo {
                accepter: self.shared.local_name.clone(),
                ip: local_ip,
                voice_port: self.shared.voice.local_port(),
                video_port: self.shared.video.local_port(),
            },
        };
        transport.send_text(addr, &signal.encode()).await?;

        let media = {
            let mut call = self.shared.call.lock().unwrap();
            match call.as_mut() {
                Some(c) if c.id == id && c.state == CallState::IncomingPending => {
                    c.state = CallState::Active;
                    Some((c.remote_ip, c.remote_voice_port, c.remote_video_port))
                }
                _ => None,
            }
        };
        let Some((remote_ip, voice_port, video_port)) = media else {
            return Err(SessionError::NoPendingCall);
        };

        self.shared.start_media(remote_ip, voice_port, video_port, kind);
        if kind == CallKind::Video {
            self.shared.watch_remote_video(peer.clone(), id);
        }
        tracing::info!("{} call with {} active", kind, peer);
        self.shared.emit(SessionEvent::CallStarted { peer, kind });
        Ok(())
    }

    /// Decline the pending incoming call.
    pub async fn reject_call(&self) -> Result<(), SessionError> {
        let transport = self.shared.transport()?;

        let session = {
            let mut call = self.shared.call.lock().unwrap();
            match call.as_ref().map(|c| c.state) {
                Some(CallState::IncomingPending) => call.take(),
                _ => None,
            }
        }
        .ok_or(SessionError::NoPendingCall)?;

        let reject = Signal::CallReject {
            peer: self.shared.local_name.clone(),
        };
        if let Some(addr) = self.shared.directory.lookup(&session.remote_peer) {
            if let Err(e) = transport.send_text(addr, &reject.encode()).await {
                tracing::warn!("failed to deliver reject to {}: {}", session.remote_peer, e);
            }
        }
        tracing::info!("rejected call from {}", session.remote_peer);
        Ok(())
    }

    /// End the active call, or cancel an unanswered outgoing one.
    pub async fn hang_up(&self) -> Result<(), SessionError> {
        let transport = self.shared.transport()?;

        let session = {
            let mut call = self.shared.call.lock().unwrap();
            match call.as_ref().map(|c| c.state) {
                Some(CallState::OutgoingPending | CallState::Active) => call.take(),
                _ => None,
            }
        }
        .ok_or(SessionError::NoActiveCall)?;

        self.shared.teardown_media(&session);

        let end = Signal::CallEnd {
            peer: self.shared.local_name.clone(),
        };
        if let Some(addr) = self.shared.directory.lookup(&session.remote_peer) {
            if let Err(e) = transport.send_text(addr, &end.encode()).await {
                tracing::warn!("hangup notice to {} not delivered: {}", session.remote_peer, e);
            }
        }
        tracing::info!("ended call with {}", session.remote_peer);
        self.shared.emit(SessionEvent::CallEnded {
            peer: session.remote_peer,
        });
        Ok(())
    }

    /// Notify every known peer that this node is going offline.
    pub async fn broadcast_offline(&self) -> Result<(), SessionError> {
        let transport = self.shared.transport()?;
        let notice = Signal::Offline {
            peer: self.shared.local_name.clone(),
        }
        .encode();

        for record in self.shared.directory.snapshot() {
            if let Err(e) = transport.send_text(record.address, &notice).await {
                tracing::warn!("offline notice to {} not delivered: {}", record.display_name, e);
            }
        }
        Ok(())
    }

    /// Tear everything down; idempotent. Ends any call, leaves the multicast
    /// group, closes the control listener, and releases the media sockets.
    pub async fn shutdown(&self) {
        if self.shut_down.swap(true, Ordering::SeqCst) {
            return;
        }

        let session = self.shared.call.lock().unwrap().take();
        if let Some(session) = session {
            self.shared.teardown_media(&session);
            if let Ok(transport) = self.shared.transport() {
                if let Some(addr) = self.shared.directory.lookup(&session.remote_peer) {
                    let end = Signal::CallEnd {
                        peer: self.shared.local_name.clone(),
                    };
                    let _ = transport.send_text(addr, &end.encode()).await;
                }
            }
            self.shared.emit(SessionEvent::CallEnded {
                peer: session.remote_peer,
            });
        }

        if let Some(mut service) = self.discovery.lock().unwrap().take() {
            service.stop();
        }
        if let Some(transport) = self.shared.transport.lock().unwrap().take() {
            transport.stop();
        }
        self.shared.voice.shutdown();
        self.shared.video.shutdown();
        tracing::info!("session {} shut down", self.shared.local_name);
    }

    /// Add a peer directly, bypassing discovery; emits the same online event
    /// an announcement would.
    pub fn register_peer(&self, name: &str, address: SocketAddr) {
        if self.shared.directory.insert(name, address) {
            self.shared.emit(SessionEvent::PeerOnline {
                name: name.to_string(),
                address,
            });
        }
    }

    /// Drop a peer from the directory.
    pub fn remove_peer(&self, name: &str) {
        if self.shared.directory.remove(name) {
            self.shared.emit(SessionEvent::PeerOffline {
                name: name.to_string(),
            });
        }
    }

    /// Known peers, sorted by name.
    pub fn peer_list(&self) -> Vec<PeerRecord> {
        self.shared.directory.snapshot()
    }

    /// Cached control address for a peer, if known. No network I/O.
    pub fn lookup(&self, name: &str) -> Option<SocketAddr> {
        self.shared.directory.lookup(name)
    }

    fn lookup_peer(&self, name: &str) -> Result<SocketAddr, SessionError> {
        self.shared
            .directory
            .lookup(name)
            .ok_or_else(|| SessionError::UnknownPeer(name.to_string()))
    }

    pub fn local_name(&self) -> &str {
        &self.shared.local_name
    }

    /// Port of the control listener; available after [`start`](Self::start).
    pub fn control_port(&self) -> Result<u16, SessionError> {
        Ok(self.shared.transport()?.local_port())
    }

    pub fn voice_port(&self) -> u16 {
        self.shared.voice.local_port()
    }

    pub fn video_port(&self) -> u16 {
        self.shared.video.local_port()
    }

    /// Current call slot state; `Idle` when no call exists.
    pub fn call_state(&self) -> CallState {
        self.shared
            .call
            .lock()
            .unwrap()
            .as_ref()
            .map(|c| c.state)
            .unwrap_or(CallState::Idle)
    }

    /// Snapshot of the current call, if any.
    pub fn current_call(&self) -> Option<CallSession> {
        self.shared.call.lock().unwrap().clone()
    }

    /// Subscribe to session events.
    pub fn subscribe(&self) -> broadcast::Receiver<SessionEvent> {
        self.shared.event_tx.subscribe()
    }

    /// Install the microphone source driving the voice send loop.
    pub fn set_voice_source(&self, source: Box<dyn FrameSource>) {
        self.shared.voice.set_source(source);
    }

    /// Install the camera source driving the video send loop.
    pub fn set_video_source(&self, source: Box<dyn FrameSource>) {
        self.shared.video.set_source(source);
    }

    /// Payloads received on the voice channel.
    pub fn subscribe_voice_frames(&self) -> broadcast::Receiver<Vec<u8>> {
        self.shared.voice.subscribe_frames()
    }

    /// Payloads received on the video channel.
    pub fn subscribe_video_frames(&self) -> broadcast::Receiver<Vec<u8>> {
        self.shared.video.subscribe_frames()
    }

    /// Push one externally captured video frame into the active call.
    pub fn send_video_frame(&self, data: &[u8]) {
        self.shared.video.send_frame(data);
    }
}
