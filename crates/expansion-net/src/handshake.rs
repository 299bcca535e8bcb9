//! Handshake sub-protocol.
//!
//! A fresh TCP connection only proves that something answered on the port.
//! Before any game traffic flows, the joiner sends
//! `HANDSHAKE_REQUEST{clientId, gameId, version}` and the host answers with
//! `HANDSHAKE_RESPONSE{serverId, clientId, status}`. The host rejects a foreign
//! game id or a different protocol version; the joiner rejects a response that
//! does not echo its own client id. Game messages that arrive before the
//! exchange completes are dropped and reported, never applied.

use std::time::Duration;

use rand::Rng;

use crate::error::DisconnectReason;
use crate::messages::{
    HandshakeRequest, HandshakeResponse, HandshakeStatus, MessageKind, NetworkMessage,
};
use crate::transport::{Connection, SendError, TransportEvent};

/// Game identifier both peers must agree on.
pub const GAME_ID: &str = "ExpansionWar";
/// Wire protocol version both peers must agree on.
pub const PROTOCOL_VERSION: &str = "1.0";

/// Handshake parameters.
#[derive(Debug, Clone)]
pub struct HandshakeConfig {
    /// Game identifier sent and expected. Default: [`GAME_ID`].
    pub game_id: String,
    /// Protocol version sent and expected. Default: [`PROTOCOL_VERSION`].
    pub version: String,
    /// How long either side waits for the counterpart. Default: 10 s.
    pub timeout: Duration,
}

impl Default for HandshakeConfig {
    fn default() -> Self {
        Self {
            game_id: GAME_ID.to_string(),
            version: PROTOCOL_VERSION.to_string(),
            timeout: Duration::from_secs(10),
        }
    }
}

/// Errors that end a handshake. The connection must be closed afterwards.
#[derive(Debug, thiserror::Error)]
pub enum HandshakeError {
    /// The joiner asked for a different game.
    #[error("game id mismatch: expected {expected}, got {actual}")]
    GameIdMismatch { expected: String, actual: String },

    /// The joiner speaks a different protocol version.
    #[error("protocol version mismatch: expected {expected}, got {actual}")]
    VersionMismatch { expected: String, actual: String },

    /// The response was meant for another client.
    #[error("response echoes client id {actual}, expected {expected}")]
    ClientIdMismatch { expected: String, actual: String },

    /// The host refused the request.
    #[error("host rejected the handshake: {0}")]
    Rejected(String),

    /// The counterpart did not answer in time.
    #[error("handshake timed out after {0:?}")]
    TimedOut(Duration),

    /// The counterpart sent a handshake message meant for the other role.
    #[error("unexpected {0} during handshake")]
    UnexpectedMessage(MessageKind),

    /// The connection ended mid-handshake. `silent` is set when the peer never
    /// sent a single byte, which is what a status probe looks like.
    #[error("connection closed during handshake ({reason})")]
    ConnectionClosed {
        reason: DisconnectReason,
        silent: bool,
    },

    /// Writing a handshake message failed.
    #[error("handshake send failed: {0}")]
    Transport(#[from] SendError),
}

impl HandshakeError {
    /// Whether the peer was a reachability probe rather than a player.
    pub fn is_probe(&self) -> bool {
        matches!(self, HandshakeError::ConnectionClosed { silent: true, .. })
    }
}

/// A completed handshake.
#[derive(Debug, Clone)]
pub struct Handshaken {
    /// The counterpart's identifier.
    pub peer_id: String,
    /// Our own identifier on this connection.
    pub local_id: String,
    /// Out-of-order or malformed input dropped while waiting.
    pub dropped: Vec<String>,
}

/// Random identifier such as `c-1f3a9b07`.
pub fn generate_peer_id(prefix: &str) -> String {
    let n: u32 = rand::rng().random();
    format!("{prefix}-{n:08x}")
}

/// The joiner's request for `client_id`.
pub fn request(config: &HandshakeConfig, client_id: &str) -> HandshakeRequest {
    HandshakeRequest {
        client_id: client_id.to_string(),
        game_id: config.game_id.clone(),
        version: config.version.clone(),
    }
}

/// Check a request against the host's expectations.
pub fn evaluate_request(
    config: &HandshakeConfig,
    req: &HandshakeRequest,
) -> Result<(), HandshakeError> {
    if req.game_id != config.game_id {
        return Err(HandshakeError::GameIdMismatch {
            expected: config.game_id.clone(),
            actual: req.game_id.clone(),
        });
    }
    if req.version != config.version {
        return Err(HandshakeError::VersionMismatch {
            expected: config.version.clone(),
            actual: req.version.clone(),
        });
    }
    Ok(())
}

/// Accepting response to `req`.
pub fn accept_response(server_id: &str, req: &HandshakeRequest) -> HandshakeResponse {
    HandshakeResponse {
        server_id: server_id.to_string(),
        client_id: req.client_id.clone(),
        status: HandshakeStatus::Accepted,
        reason: None,
    }
}

/// Rejecting response to `req`.
pub fn reject_response(
    server_id: &str,
    req: &HandshakeRequest,
    reason: impl Into<String>,
) -> HandshakeResponse {
    HandshakeResponse {
        server_id: server_id.to_string(),
        client_id: req.client_id.clone(),
        status: HandshakeStatus::Rejected,
        reason: Some(reason.into()),
    }
}

/// Check the host's response on the joiner side.
pub fn verify_response(client_id: &str, resp: &HandshakeResponse) -> Result<(), HandshakeError> {
    if resp.client_id != client_id {
        return Err(HandshakeError::ClientIdMismatch {
            expected: client_id.to_string(),
            actual: resp.client_id.clone(),
        });
    }
    match resp.status {
        HandshakeStatus::Accepted => Ok(()),
        HandshakeStatus::Rejected => Err(HandshakeError::Rejected(
            resp.reason
                .clone()
                .unwrap_or_else(|| "no reason given".to_string()),
        )),
    }
}

// ---------------------------------------------------------------------------
// Exchanges over a live connection
// ---------------------------------------------------------------------------

/// Joiner side: send a request and wait for a matching accepted response.
pub async fn initiate(
    conn: &mut Connection,
    config: &HandshakeConfig,
    client_id: &str,
) -> Result<Handshaken, HandshakeError> {
    let req = request(config, client_id);
    conn.send(&NetworkMessage::HandshakeRequest(req)).await?;
    tracing::debug!("Handshake request {client_id} sent to {}", conn.peer_addr());

    let mut dropped = Vec::new();
    let exchange = async {
        let mut silent = true;
        loop {
            match conn.next_event().await {
                Some(TransportEvent::Received(NetworkMessage::HandshakeResponse(resp))) => {
                    verify_response(client_id, &resp)?;
                    return Ok::<_, HandshakeError>(resp.server_id);
                }
                Some(TransportEvent::Received(NetworkMessage::HandshakeRequest(_))) => {
                    return Err(HandshakeError::UnexpectedMessage(MessageKind::HandshakeRequest));
                }
                Some(event) => {
                    silent = false;
                    note_dropped(event, &mut dropped)?;
                }
                None => {
                    return Err(HandshakeError::ConnectionClosed {
                        reason: DisconnectReason::Local,
                        silent,
                    });
                }
            }
        }
    };

    let server_id = tokio::time::timeout(config.timeout, exchange)
        .await
        .map_err(|_| HandshakeError::TimedOut(config.timeout))??;

    Ok(Handshaken {
        peer_id: server_id,
        local_id: client_id.to_string(),
        dropped,
    })
}

/// Host side: wait for a request, validate it and answer.
///
/// A rejected request is answered with a `rejected` response before the error
/// is returned, so the joiner learns why.
pub async fn respond(
    conn: &mut Connection,
    config: &HandshakeConfig,
    server_id: &str,
) -> Result<Handshaken, HandshakeError> {
    let mut dropped = Vec::new();
    let exchange = async {
        let mut silent = true;
        loop {
            match conn.next_event().await {
                Some(TransportEvent::Received(NetworkMessage::HandshakeRequest(req))) => {
                    return Ok::<_, HandshakeError>(req);
                }
                Some(TransportEvent::Received(NetworkMessage::HandshakeResponse(_))) => {
                    return Err(HandshakeError::UnexpectedMessage(MessageKind::HandshakeResponse));
                }
                Some(TransportEvent::Closed(reason)) => {
                    return Err(HandshakeError::ConnectionClosed { reason, silent });
                }
                Some(event) => {
                    silent = false;
                    note_dropped(event, &mut dropped)?;
                }
                None => {
                    return Err(HandshakeError::ConnectionClosed {
                        reason: DisconnectReason::Local,
                        silent,
                    });
                }
            }
        }
    };

    let req = tokio::time::timeout(config.timeout, exchange)
        .await
        .map_err(|_| HandshakeError::TimedOut(config.timeout))??;

    if let Err(e) = evaluate_request(config, &req) {
        tracing::warn!("Rejecting handshake from {}: {e}", conn.peer_addr());
        let resp = reject_response(server_id, &req, e.to_string());
        if let Err(send_err) = conn.send(&NetworkMessage::HandshakeResponse(resp)).await {
            tracing::debug!("Could not deliver rejection: {send_err}");
        }
        return Err(e);
    }

    conn.send(&NetworkMessage::HandshakeResponse(accept_response(server_id, &req)))
        .await?;
    tracing::info!("Handshake with {} accepted", req.client_id);

    Ok(Handshaken {
        peer_id: req.client_id,
        local_id: server_id.to_string(),
        dropped,
    })
}

/// Record an event that is not part of the handshake. Ends the exchange only
/// when the connection closed.
fn note_dropped(event: TransportEvent, dropped: &mut Vec<String>) -> Result<(), HandshakeError> {
    match event {
        TransportEvent::Received(msg) => {
            tracing::warn!("Dropping {} received before the handshake completed", msg.kind());
            dropped.push(format!("{} received before handshake", msg.kind()));
            Ok(())
        }
        TransportEvent::Malformed(report) => {
            dropped.push(report.message);
            Ok(())
        }
        TransportEvent::Closed(reason) => Err(HandshakeError::ConnectionClosed {
            reason,
            silent: false,
        }),
    }
}
