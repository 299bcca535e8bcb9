//! The seam between the network session and the game.
//!
//! The session calls into a [`GameEngine`] from the single task that owns both,
//! so implementations never need interior locking.

use crate::error::{DisconnectReason, SessionErrorKind, SyncError};
use crate::messages::{GameAction, GameStateSnapshot, PeerInfo, Role};

/// Callbacks the session drives.
pub trait GameEngine {
    /// Apply a move made by the peer. An `Err` is reported as a sync error and
    /// the session stays up.
    fn on_remote_action(&mut self, action: &GameAction) -> Result<(), SyncError>;

    /// Turn ownership moved to `owner`. `local_can_act` is true when input
    /// should be unblocked.
    fn on_turn_changed(&mut self, owner: Role, local_can_act: bool);

    /// Replace local state with the host's snapshot.
    fn on_state_received(&mut self, snapshot: &GameStateSnapshot) -> Result<(), SyncError>;

    /// A non-fatal problem worth showing to the player.
    fn on_session_error(&mut self, kind: SessionErrorKind, message: &str);

    /// The connection to the peer is gone.
    fn on_disconnected(&mut self, reason: &DisconnectReason);

    /// Block local input until the session is back or fallen back.
    fn on_input_suspended(&mut self);

    /// Network play is over; continue as a local game.
    fn on_local_fallback(&mut self);

    /// A peer passed the handshake.
    fn on_peer_connected(&mut self, _peer: &PeerInfo) {}

    /// Chat line from the peer.
    fn on_chat(&mut self, _from: Role, _text: &str) {}

    /// Whether to try to get an unexpectedly lost connection back. Resets are
    /// retried regardless.
    fn should_reconnect(&mut self, _reason: &DisconnectReason) -> bool {
        true
    }

    /// Current full state, used for the host's initial broadcast and resyncs.
    fn snapshot(&self) -> GameStateSnapshot;
}
