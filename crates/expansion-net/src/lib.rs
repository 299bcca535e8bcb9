//! Two-peer network play for Expansion War: newline-delimited JSON messages
//! over one TCP connection, a handshake that verifies both ends, strict turn
//! hand-off, reconnection with local fallback, and a host reachability prober.

pub mod codec;
pub mod engine;
pub mod error;
pub mod handshake;
pub mod messages;
pub mod platform;
pub mod prober;
pub mod reconnection;
pub mod session;
pub mod transport;
pub mod turn;

pub use codec::{CodecConfig, CodecError, DecodeError, LineDecoder, decode, encode};
pub use engine::GameEngine;
pub use error::{DisconnectReason, SessionErrorKind, SyncError};
pub use handshake::{GAME_ID, HandshakeConfig, HandshakeError, PROTOCOL_VERSION};
pub use messages::{
    ActionId, GameAction, GameStateSnapshot, MessageKind, NetworkMessage, PeerInfo, Role,
    SnapshotError, UnitId,
};
pub use prober::{ProbeReport, ProbeStatus, ProberConfig, ServerProber, probe_once};
pub use reconnection::{ReconnectConfig, ReconnectError, ReconnectPolicy, ReconnectState};
pub use session::{
    Session, SessionConfig, SessionError, SessionPhase, SessionState, StopHandle, SubmitError,
};
pub use transport::{
    AcceptError, BindError, ConnectError, Connection, Listener, SendError, TransportConfig,
    TransportEvent,
};
pub use turn::{TurnError, TurnTracker};
