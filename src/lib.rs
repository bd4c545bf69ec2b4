//! PeerLink - Serverless LAN Peer Communication
//!
//! A peer-to-peer chat, file transfer, and calling core for local networks.
//! Peers find each other over multicast announcements, exchange messages and
//! files over per-exchange TCP connections, and negotiate voice or video
//! calls whose media flows over dedicated UDP channels. No server, no
//! accounts: a display name and a LAN are enough.

pub mod config;
pub mod discovery;
pub mod media;
pub mod protocol;
pub mod session;
pub mod transport;

// Re-export commonly used types
pub use config::NetworkConfig;
pub use discovery::{PeerDirectory, PeerRecord};
pub use media::{FrameSource, MediaEngine, MediaKind};
pub use protocol::Signal;
pub use session::{CallKind, CallState, SessionController, SessionError, SessionEvent};
