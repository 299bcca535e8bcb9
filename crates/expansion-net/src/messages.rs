//! Network message types.
//!
//! Every message on the wire is a JSON object with two fields: `type`, the
//! upper-case message tag, and `data`, the payload map whose shape is fixed per
//! tag. Encoding and stream splitting live in [`crate::codec`].

use std::fmt;

use serde::{Deserialize, Serialize};

// ---------------------------------------------------------------------------
// Roles and identifiers
// ---------------------------------------------------------------------------

/// Which side of the session a peer plays.
///
/// The role is decided by who listens and who connects and never changes for
/// the lifetime of a session, reconnections included. On the wire and in game
/// snapshots roles use the game's own labels: the host is `"player"`, the
/// joiner is `"pc"`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum Role {
    /// The listening peer; authoritative sender of the initial snapshot.
    #[serde(rename = "player")]
    Host,
    /// The connecting peer.
    #[serde(rename = "pc")]
    Joiner,
}

impl Role {
    /// The other side of the session.
    pub fn peer(self) -> Role {
        match self {
            Role::Host => Role::Joiner,
            Role::Joiner => Role::Host,
        }
    }

    /// Game-domain label for this role.
    pub fn label(self) -> &'static str {
        match self {
            Role::Host => "player",
            Role::Joiner => "pc",
        }
    }

    /// Parse a game-domain label. Returns `None` for anything else.
    pub fn from_label(label: &str) -> Option<Role> {
        match label {
            "player" => Some(Role::Host),
            "pc" => Some(Role::Joiner),
            _ => None,
        }
    }
}

impl fmt::Display for Role {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.label())
    }
}

/// Identifier of a unit on the game board. Resolved by the engine, never by
/// the network layer.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct UnitId(pub u64);

impl fmt::Display for UnitId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "#{}", self.0)
    }
}

/// Opaque identifier of one completed action, echoed in the turn change that
/// follows it.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct ActionId(pub String);

impl fmt::Display for ActionId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

// ---------------------------------------------------------------------------
// Top-level enum
// ---------------------------------------------------------------------------

/// Top-level network message. The variant name is the `type` tag.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", content = "data", rename_all = "SCREAMING_SNAKE_CASE")]
pub enum NetworkMessage {
    // --- Handshake ---
    /// Joiner asks to join a specific game with a specific protocol version.
    HandshakeRequest(HandshakeRequest),
    /// Host accepts or rejects a handshake request.
    HandshakeResponse(HandshakeResponse),

    // --- Session ---
    /// Informational: a peer has been verified. Emitted locally, never required
    /// on the wire.
    Connect(PeerInfo),
    /// Full game snapshot, sent by the host.
    GameState(GameStateSnapshot),
    /// One game move.
    Action(GameAction),
    /// Hands turn ownership to `next_turn`.
    TurnChange(TurnChange),
    /// Free-form text between players.
    Chat(Chat),
    /// The sender is leaving network mode on purpose.
    Disconnect(Disconnect),
    /// Malformed input or a peer-reported failure.
    Error(ErrorReport),
}

/// Message tag without payload, for logging and protocol-order checks.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum MessageKind {
    HandshakeRequest,
    HandshakeResponse,
    Connect,
    GameState,
    Action,
    TurnChange,
    Chat,
    Disconnect,
    Error,
}

impl fmt::Display for MessageKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let tag = match self {
            MessageKind::HandshakeRequest => "HANDSHAKE_REQUEST",
            MessageKind::HandshakeResponse => "HANDSHAKE_RESPONSE",
            MessageKind::Connect => "CONNECT",
            MessageKind::GameState => "GAME_STATE",
            MessageKind::Action => "ACTION",
            MessageKind::TurnChange => "TURN_CHANGE",
            MessageKind::Chat => "CHAT",
            MessageKind::Disconnect => "DISCONNECT",
            MessageKind::Error => "ERROR",
        };
        f.write_str(tag)
    }
}

impl NetworkMessage {
    /// The tag of this message.
    pub fn kind(&self) -> MessageKind {
        match self {
            NetworkMessage::HandshakeRequest(_) => MessageKind::HandshakeRequest,
            NetworkMessage::HandshakeResponse(_) => MessageKind::HandshakeResponse,
            NetworkMessage::Connect(_) => MessageKind::Connect,
            NetworkMessage::GameState(_) => MessageKind::GameState,
            NetworkMessage::Action(_) => MessageKind::Action,
            NetworkMessage::TurnChange(_) => MessageKind::TurnChange,
            NetworkMessage::Chat(_) => MessageKind::Chat,
            NetworkMessage::Disconnect(_) => MessageKind::Disconnect,
            NetworkMessage::Error(_) => MessageKind::Error,
        }
    }

    /// Whether this message is only legal on a verified session.
    pub fn requires_verified(&self) -> bool {
        matches!(
            self.kind(),
            MessageKind::GameState | MessageKind::Action | MessageKind::TurnChange | MessageKind::Chat
        )
    }
}

// ---------------------------------------------------------------------------
// Payload structs
// ---------------------------------------------------------------------------

/// Joiner's handshake request.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct HandshakeRequest {
    /// Random identifier chosen by the joiner for this connection.
    pub client_id: String,
    /// Game the joiner expects to find.
    pub game_id: String,
    /// Protocol version spoken by the joiner.
    pub version: String,
}

/// Outcome of a handshake request.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum HandshakeStatus {
    Accepted,
    Rejected,
}

/// Host's handshake response.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct HandshakeResponse {
    /// Identifier of the host instance.
    pub server_id: String,
    /// Echo of the request's `clientId`.
    pub client_id: String,
    /// Whether the request was accepted.
    pub status: HandshakeStatus,
    /// Human-readable rejection reason.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub reason: Option<String>,
}

/// Address of a verified peer.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct PeerInfo {
    /// Peer IP address.
    pub address: String,
    /// Peer TCP port.
    pub port: u16,
    /// The peer's handshake identifier.
    pub peer_id: String,
}

/// One game move. The network layer forwards it untouched; the engine decides
/// whether it is legal and resolves the unit ids.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case", rename_all_fields = "camelCase")]
pub enum GameAction {
    /// Link two units.
    Connect { source_id: UnitId, target_id: UnitId },
    /// Remove the link between two units.
    Disconnect { source_id: UnitId, target_id: UnitId },
    /// Overwrite a unit's value and owner.
    UnitUpdate {
        unit_id: UnitId,
        value: i64,
        owner: String,
    },
}

impl GameAction {
    /// Every unit this action refers to.
    pub fn unit_ids(&self) -> Vec<UnitId> {
        match self {
            GameAction::Connect {
                source_id,
                target_id,
            }
            | GameAction::Disconnect {
                source_id,
                target_id,
            } => vec![*source_id, *target_id],
            GameAction::UnitUpdate { unit_id, .. } => vec![*unit_id],
        }
    }
}

/// Turn hand-off sent right after the action that completed the turn.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct TurnChange {
    /// Role that owns the turn from now on.
    pub next_turn: Role,
    /// Action that completed the previous turn.
    pub action_id: ActionId,
}

/// Chat line.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Chat {
    pub text: String,
}

/// Graceful leave notice.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Disconnect {
    pub reason: String,
}

/// Error description.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ErrorReport {
    pub message: String,
}

// ---------------------------------------------------------------------------
// Game state snapshot
// ---------------------------------------------------------------------------

/// Key of the current turn owner inside a snapshot.
pub const CURRENT_TURN_KEY: &str = "currentTurn";
/// Key of the host's role label inside a snapshot.
pub const HOST_ROLE_KEY: &str = "hostRole";

/// Engine-defined game state. Transported as-is; the network layer only reads
/// `currentTurn` and `hostRole`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(transparent)]
pub struct GameStateSnapshot(serde_json::Value);

/// Errors reading the fields the network layer needs from a snapshot.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum SnapshotError {
    /// The snapshot is not a JSON object.
    #[error("snapshot is not an object")]
    NotAnObject,
    /// A required field is absent.
    #[error("snapshot has no `{0}` field")]
    MissingField(&'static str),
    /// A role field holds something other than a known role label.
    #[error("snapshot field `{field}` holds unknown role {value}")]
    UnknownRole {
        /// Field name.
        field: &'static str,
        /// Offending value, as JSON.
        value: String,
    },
}

impl GameStateSnapshot {
    /// Wrap an engine-produced JSON object.
    pub fn new(value: serde_json::Value) -> Result<Self, SnapshotError> {
        if !value.is_object() {
            return Err(SnapshotError::NotAnObject);
        }
        Ok(Self(value))
    }

    /// The raw JSON value.
    pub fn as_value(&self) -> &serde_json::Value {
        &self.0
    }

    /// Consume the snapshot, returning the raw JSON value.
    pub fn into_value(self) -> serde_json::Value {
        self.0
    }

    /// Role whose turn it is at the time of the snapshot.
    pub fn current_turn(&self) -> Result<Role, SnapshotError> {
        self.role_field(CURRENT_TURN_KEY)?
            .ok_or(SnapshotError::MissingField(CURRENT_TURN_KEY))
    }

    /// Role the snapshot claims for the host, if it carries one.
    pub fn host_role(&self) -> Result<Option<Role>, SnapshotError> {
        self.role_field(HOST_ROLE_KEY)
    }

    /// Record `role` as the host role unless the snapshot already names one.
    pub fn stamp_host_role(&mut self, role: Role) {
        if let Some(map) = self.0.as_object_mut() {
            map.entry(HOST_ROLE_KEY)
                .or_insert_with(|| serde_json::Value::String(role.label().to_string()));
        }
    }

    fn role_field(&self, field: &'static str) -> Result<Option<Role>, SnapshotError> {
        let map = self.0.as_object().ok_or(SnapshotError::NotAnObject)?;
        let Some(value) = map.get(field) else {
            return Ok(None);
        };
        value
            .as_str()
            .and_then(Role::from_label)
            .map(Some)
            .ok_or_else(|| SnapshotError::UnknownRole {
                field,
                value: value.to_string(),
            })
    }
}

impl From<serde_json::Map<String, serde_json::Value>> for GameStateSnapshot {
    fn from(map: serde_json::Map<String, serde_json::Value>) -> Self {
        Self(serde_json::Value::Object(map))
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------
