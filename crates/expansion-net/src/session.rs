//! Verified game session between the host and the joiner.
//!
//! A [`Session`] owns the listener (host), the single live [`Connection`], the
//! [`SessionState`] and the turn tracker. It is driven from one task, the same
//! one that owns the game, and calls back into the [`GameEngine`] from there.
//! The only concurrent piece is each connection's reader task, which never
//! touches session or game state; it only queues [`TransportEvent`]s.
//!
//! Phase flow:
//!
//! ```text
//! Disconnected -> Listening | Connecting -> TcpEstablished
//!     -> HandshakeAwaited | HandshakeSent -> Verified -> Active
//!     -> Closing -> Disconnected
//!                -> Reconnecting -> Listening | Connecting -> ...
//! ```

use std::fmt;
use std::net::SocketAddr;
use std::sync::Arc;
use std::time::{Duration, Instant};

use tokio::sync::watch;

use crate::engine::GameEngine;
use crate::error::{DisconnectReason, SessionErrorKind, SyncError};
use crate::handshake::{self, HandshakeConfig, HandshakeError, Handshaken};
use crate::messages::{
    ActionId, Chat, Disconnect, GameAction, GameStateSnapshot, NetworkMessage, PeerInfo, Role,
    SnapshotError,
};
use crate::reconnection::{ReconnectConfig, ReconnectError};
use crate::transport::{
    self, AcceptError, BindError, ConnectError, Connection, Listener, SendError, TransportConfig,
    TransportEvent,
};
use crate::turn::{TurnError, TurnTracker};

// ---------------------------------------------------------------------------
// Phase
// ---------------------------------------------------------------------------

/// Where the session is in its lifecycle. Decides which operations are legal.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SessionPhase {
    /// No socket open.
    Disconnected,
    /// Host waiting for a peer.
    Listening,
    /// Joiner dialing the host.
    Connecting,
    /// TCP is up, nothing exchanged yet.
    TcpEstablished,
    /// Joiner sent its request and waits for the answer.
    HandshakeSent,
    /// Host waits for the joiner's request.
    HandshakeAwaited,
    /// Handshake complete, initial state not yet exchanged.
    Verified,
    /// Initial state exchanged, turns are being played.
    Active,
    /// Tearing the connection down.
    Closing,
    /// Trying to get a lost connection back.
    Reconnecting,
}

impl SessionPhase {
    /// Whether `next` may follow `self`.
    pub fn can_transition_to(self, next: SessionPhase) -> bool {
        use SessionPhase::*;
        if self == next {
            return true;
        }
        match self {
            Disconnected => matches!(next, Listening | Connecting),
            Listening | Connecting => matches!(next, TcpEstablished | Closing | Disconnected),
            TcpEstablished => matches!(next, HandshakeSent | HandshakeAwaited | Closing | Listening),
            HandshakeSent => matches!(next, Verified | Closing),
            HandshakeAwaited => matches!(next, Verified | Closing | Listening),
            Verified => matches!(next, Active | Closing),
            Active => matches!(next, Closing),
            Closing => matches!(next, Disconnected | Reconnecting),
            Reconnecting => matches!(next, Listening | Connecting | Closing | Disconnected),
        }
    }

    /// Whether the peer has passed the handshake.
    pub fn is_verified(self) -> bool {
        matches!(self, SessionPhase::Verified | SessionPhase::Active)
    }
}

impl fmt::Display for SessionPhase {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        fmt::Debug::fmt(self, f)
    }
}

// ---------------------------------------------------------------------------
// State
// ---------------------------------------------------------------------------

/// Observable state of a session.
#[derive(Debug, Clone)]
pub struct SessionState {
    /// Current phase.
    pub phase: SessionPhase,
    /// Fixed at construction; survives reconnections.
    pub role: Role,
    /// Whether the current connection passed the handshake.
    pub peer_verified: bool,
    /// `"<serverId>/<clientId>"` of the current connection, empty before.
    pub session_id: String,
    /// When the current peer was verified.
    pub connected_since: Option<Instant>,
    pub(crate) turn: TurnTracker,
}

impl SessionState {
    fn new(role: Role) -> Self {
        Self {
            phase: SessionPhase::Disconnected,
            role,
            peer_verified: false,
            session_id: String::new(),
            connected_since: None,
            turn: TurnTracker::new(role),
        }
    }

    /// Role that may act now, `None` before the first snapshot.
    pub fn local_turn_owner(&self) -> Option<Role> {
        self.turn.owner()
    }

    /// Whether the local peer may act now.
    pub fn is_local_turn(&self) -> bool {
        self.phase == SessionPhase::Active && self.turn.is_local_turn()
    }
}

// ---------------------------------------------------------------------------
// Configuration
// ---------------------------------------------------------------------------

/// Everything a session needs to run.
#[derive(Debug, Clone)]
pub struct SessionConfig {
    /// Host listens, joiner connects.
    pub role: Role,
    /// Host: address to bind. Joiner: address to dial.
    pub peer_addr: SocketAddr,
    /// Identifier used in the handshake. Generated when `None`.
    pub local_id: Option<String>,
    pub transport: TransportConfig,
    pub handshake: HandshakeConfig,
    pub reconnect: ReconnectConfig,
    /// Consecutive protocol errors tolerated before the connection is dropped.
    /// Default: 5.
    pub max_protocol_errors: u32,
    /// How long a host waits for the joiner on each reconnection attempt.
    /// Default: 10 s.
    pub reconnect_accept_window: Duration,
    /// Reachability probe timeout used before a joiner reconnects. Default: 3 s.
    pub probe_timeout: Duration,
}

impl SessionConfig {
    /// Defaults for `role` at `peer_addr`.
    pub fn new(role: Role, peer_addr: SocketAddr) -> Self {
        Self {
            role,
            peer_addr,
            local_id: None,
            transport: TransportConfig::default(),
            handshake: HandshakeConfig::default(),
            reconnect: ReconnectConfig::default(),
            max_protocol_errors: 5,
            reconnect_accept_window: Duration::from_secs(10),
            probe_timeout: Duration::from_secs(3),
        }
    }
}

// ---------------------------------------------------------------------------
// Errors
// ---------------------------------------------------------------------------

/// Errors from session operations.
#[derive(Debug, thiserror::Error)]
pub enum SessionError {
    /// Only the host may do this.
    #[error("only the host can do this")]
    NotHost,

    /// The operation is not legal in the current phase.
    #[error("{op} is not allowed while {phase}")]
    WrongPhase {
        op: &'static str,
        phase: SessionPhase,
    },

    /// The initial state was already sent on this connection.
    #[error("initial state already broadcast")]
    AlreadyBroadcast,

    /// The snapshot lacks what the session needs.
    #[error("snapshot rejected: {0}")]
    Snapshot(#[from] SnapshotError),

    /// The local peer does not hold the turn.
    #[error(transparent)]
    Turn(#[from] TurnError),

    #[error(transparent)]
    Bind(#[from] BindError),

    #[error(transparent)]
    Accept(#[from] AcceptError),

    #[error(transparent)]
    Connect(#[from] ConnectError),

    #[error(transparent)]
    Handshake(#[from] HandshakeError),

    #[error(transparent)]
    Send(#[from] SendError),

    #[error(transparent)]
    Reconnect(#[from] ReconnectError),
}

/// Why a local action was refused.
#[derive(Debug, thiserror::Error)]
pub enum SubmitError {
    /// The peer holds the turn, or no turn has been assigned yet.
    #[error("not your turn (owner: {owner:?})")]
    NotYourTurn { owner: Option<Role> },

    /// There is no active session.
    #[error("not connected ({0})")]
    NotConnected(SessionPhase),

    /// The action could not be delivered. The connection is treated as lost.
    #[error(transparent)]
    Transport(#[from] SendError),
}

// ---------------------------------------------------------------------------
// Stop handle
// ---------------------------------------------------------------------------

/// Cancels a session's pending accept, connect or reconnection from another
/// task.
#[derive(Debug, Clone)]
pub struct StopHandle(Arc<watch::Sender<bool>>);

impl StopHandle {
    pub fn stop(&self) {
        let _ = self.0.send(true);
    }

    pub fn is_stopped(&self) -> bool {
        *self.0.borrow()
    }
}

// ---------------------------------------------------------------------------
// Session
// ---------------------------------------------------------------------------

/// One peer's side of a two-player network game.
pub struct Session {
    pub(crate) config: SessionConfig,
    pub(crate) state: SessionState,
    pub(crate) conn: Option<Connection>,
    pub(crate) listener: Option<Listener>,
    pub(crate) bound_addr: Option<SocketAddr>,
    pub(crate) local_id: String,
    pub(crate) peer: Option<PeerInfo>,
    /// Initial state sent (host) or received (joiner) on this connection.
    pub(crate) state_exchanged: bool,
    pub(crate) protocol_errors: u32,
    /// Loss noticed outside the reader (failed send, protocol teardown, peer
    /// leaving). Handled before any further queued event.
    pub(crate) pending_loss: Option<DisconnectReason>,
    pub(crate) fell_back: bool,
    pub(crate) stop_tx: Arc<watch::Sender<bool>>,
    pub(crate) stop_rx: watch::Receiver<bool>,
}

impl Session {
    /// Create an idle session. No socket is opened until [`establish`](Self::establish).
    pub fn new(config: SessionConfig) -> Self {
        let local_id = config.local_id.clone().unwrap_or_else(|| {
            let prefix = match config.role {
                Role::Host => "s",
                Role::Joiner => "c",
            };
            handshake::generate_peer_id(prefix)
        });
        let (stop_tx, stop_rx) = watch::channel(false);
        Self {
            state: SessionState::new(config.role),
            config,
            conn: None,
            listener: None,
            bound_addr: None,
            local_id,
            peer: None,
            state_exchanged: false,
            protocol_errors: 0,
            pending_loss: None,
            fell_back: false,
            stop_tx: Arc::new(stop_tx),
            stop_rx,
        }
    }

    pub fn state(&self) -> &SessionState {
        &self.state
    }

    pub fn phase(&self) -> SessionPhase {
        self.state.phase
    }

    pub fn role(&self) -> Role {
        self.state.role
    }

    /// Our handshake identifier.
    pub fn local_id(&self) -> &str {
        &self.local_id
    }

    /// The verified peer, if any.
    pub fn peer(&self) -> Option<&PeerInfo> {
        self.peer.as_ref()
    }

    /// Host: the address actually bound, once listening.
    pub fn bound_addr(&self) -> Option<SocketAddr> {
        self.bound_addr
    }

    /// Whether the local peer may submit an action now.
    pub fn is_local_turn(&self) -> bool {
        self.state.is_local_turn()
    }

    /// Whether the session gave up and handed the game back to local play.
    pub fn fell_back_to_local(&self) -> bool {
        self.fell_back
    }

    /// How long the current peer has been connected. Zero when not connected.
    pub fn connection_age(&self) -> Duration {
        self.state
            .connected_since
            .map(|since| since.elapsed())
            .unwrap_or(Duration::ZERO)
    }

    pub fn stop_handle(&self) -> StopHandle {
        StopHandle(Arc::clone(&self.stop_tx))
    }

    // --- phase bookkeeping ---

    pub(crate) fn set_phase(&mut self, next: SessionPhase) {
        let current = self.state.phase;
        if current == next {
            return;
        }
        if !current.can_transition_to(next) {
            tracing::warn!("Unexpected session phase change {current} -> {next}");
        }
        tracing::debug!("Session phase {current} -> {next}");
        self.state.phase = next;
    }

    pub(crate) fn enter_disconnected(&mut self) {
        if self.state.phase == SessionPhase::Disconnected {
            return;
        }
        if !matches!(
            self.state.phase,
            SessionPhase::Listening | SessionPhase::Connecting | SessionPhase::Closing
        ) {
            self.set_phase(SessionPhase::Closing);
        }
        self.set_phase(SessionPhase::Disconnected);
    }

    /// Close the current connection and forget the peer. The turn owner is
    /// kept so a resync can restore it.
    pub(crate) async fn drop_connection(&mut self) {
        if let Some(mut conn) = self.conn.take() {
            conn.close().await;
        }
        self.state.peer_verified = false;
        self.state.connected_since = None;
        self.peer = None;
        self.state_exchanged = false;
        self.protocol_errors = 0;
    }

    // -----------------------------------------------------------------------
    // Establishing
    // -----------------------------------------------------------------------

    /// Open the session: the host binds and waits for a verified joiner, the
    /// joiner connects (with retries) and completes the handshake.
    ///
    /// Returns once the phase is [`SessionPhase::Verified`]. The host then
    /// calls [`broadcast_state`](Self::broadcast_state); the joiner becomes
    /// active when that state arrives.
    pub async fn establish<E: GameEngine>(&mut self, engine: &mut E) -> Result<(), SessionError> {
        let pre_bound = self.state.phase == SessionPhase::Listening && self.listener.is_some();
        if self.state.phase != SessionPhase::Disconnected && !pre_bound {
            return Err(SessionError::WrongPhase {
                op: "establish",
                phase: self.state.phase,
            });
        }
        self.fell_back = false;

        let result = match self.state.role {
            Role::Host => self.establish_host(engine).await,
            Role::Joiner => self.establish_joiner(engine).await,
        };
        if result.is_err() {
            self.listener = None;
            self.enter_disconnected();
        }
        result
    }

    async fn establish_host<E: GameEngine>(&mut self, engine: &mut E) -> Result<(), SessionError> {
        self.listen(engine)?;
        let (conn, handshaken) = self.accept_peer(None, engine).await?;
        self.finish_verified(conn, handshaken, engine);
        Ok(())
    }

    async fn establish_joiner<E: GameEngine>(
        &mut self,
        engine: &mut E,
    ) -> Result<(), SessionError> {
        self.set_phase(SessionPhase::Connecting);
        let addr = self.config.peer_addr;
        let conn =
            match transport::connect_with_retry(addr, &self.config.transport, &mut self.stop_rx)
                .await
            {
                Ok(conn) => conn,
                Err(e) => {
                    tracing::error!("Could not connect to host at {addr}: {e}");
                    engine.on_session_error(SessionErrorKind::Connect, &format!("{e}. {}", e.hint()));
                    return Err(e.into());
                }
            };
        let (conn, handshaken) = self.handshake_as_joiner(conn, engine).await?;
        self.finish_verified(conn, handshaken, engine);
        Ok(())
    }

    /// Host: bind the listening socket and return the bound address.
    ///
    /// [`establish`](Self::establish) binds on its own; calling this first
    /// makes the real port known before waiting for the joiner. Later binds
    /// reuse the first bound address. A no-op while already listening.
    pub fn listen<E: GameEngine>(&mut self, engine: &mut E) -> Result<SocketAddr, SessionError> {
        if self.state.role != Role::Host {
            return Err(SessionError::NotHost);
        }
        if let Some(listener) = &self.listener {
            return Ok(listener.local_addr());
        }
        let addr = self.bound_addr.unwrap_or(self.config.peer_addr);
        match transport::listen(addr, &self.config.transport) {
            Ok(listener) => {
                let bound = listener.local_addr();
                self.bound_addr = Some(bound);
                self.listener = Some(listener);
                self.set_phase(SessionPhase::Listening);
                Ok(bound)
            }
            Err(e) => {
                tracing::error!("{e}");
                engine.on_session_error(SessionErrorKind::Bind, &format!("{e}. {}", e.hint()));
                Err(e.into())
            }
        }
    }

    /// Host: accept peers until one completes the handshake.
    ///
    /// Probe connections and failed handshakes are closed and the host keeps
    /// listening. `window` bounds the total wait.
    pub(crate) async fn accept_peer<E: GameEngine>(
        &mut self,
        window: Option<Duration>,
        engine: &mut E,
    ) -> Result<(Connection, Handshaken), SessionError> {
        let deadline = window.map(|w| Instant::now() + w);
        loop {
            self.set_phase(SessionPhase::Listening);
            let remaining = deadline.map(|d| d.saturating_duration_since(Instant::now()));
            let Some(listener) = self.listener.as_ref() else {
                return Err(SessionError::WrongPhase {
                    op: "accept",
                    phase: self.state.phase,
                });
            };
            let mut conn = listener.accept(&mut self.stop_rx, remaining).await?;

            self.set_phase(SessionPhase::TcpEstablished);
            self.set_phase(SessionPhase::HandshakeAwaited);
            match handshake::respond(&mut conn, &self.config.handshake, &self.local_id).await {
                Ok(handshaken) => return Ok((conn, handshaken)),
                Err(e) if e.is_probe() => {
                    tracing::debug!("Connection from {} closed without data, treating as probe", conn.peer_addr());
                }
                Err(e) => {
                    tracing::warn!("Handshake with {} failed: {e}", conn.peer_addr());
                    engine.on_session_error(SessionErrorKind::Handshake, &e.to_string());
                }
            }
            conn.close().await;
        }
    }

    /// Joiner: run the handshake on a fresh connection. The connection is
    /// closed on failure.
    pub(crate) async fn handshake_as_joiner<E: GameEngine>(
        &mut self,
        mut conn: Connection,
        engine: &mut E,
    ) -> Result<(Connection, Handshaken), SessionError> {
        self.set_phase(SessionPhase::TcpEstablished);
        self.set_phase(SessionPhase::HandshakeSent);
        match handshake::initiate(&mut conn, &self.config.handshake, &self.local_id).await {
            Ok(handshaken) => Ok((conn, handshaken)),
            Err(e) => {
                tracing::warn!("Handshake with {} failed: {e}", conn.peer_addr());
                engine.on_session_error(SessionErrorKind::Handshake, &e.to_string());
                conn.close().await;
                self.set_phase(SessionPhase::Closing);
                Err(e.into())
            }
        }
    }

    /// Adopt a connection that completed the handshake.
    pub(crate) fn finish_verified<E: GameEngine>(
        &mut self,
        conn: Connection,
        handshaken: Handshaken,
        engine: &mut E,
    ) {
        let peer_addr = conn.peer_addr();
        let peer = PeerInfo {
            address: peer_addr.ip().to_string(),
            port: peer_addr.port(),
            peer_id: handshaken.peer_id.clone(),
        };

        self.state.session_id = match self.state.role {
            Role::Host => format!("{}/{}", handshaken.local_id, handshaken.peer_id),
            Role::Joiner => format!("{}/{}", handshaken.peer_id, handshaken.local_id),
        };
        self.state.peer_verified = true;
        self.state.connected_since = Some(Instant::now());
        self.conn = Some(conn);
        // The host stops accepting once a peer is in; further dials are refused.
        self.listener = None;
        self.peer = Some(peer.clone());
        self.state_exchanged = false;
        self.protocol_errors = 0;
        self.pending_loss = None;
        self.set_phase(SessionPhase::Verified);

        tracing::info!(
            "Session {} verified with {} at {peer_addr} (we are {})",
            self.state.session_id,
            peer.peer_id,
            self.state.role
        );
        engine.on_peer_connected(&peer);
        for dropped in handshaken.dropped {
            self.protocol_error(&dropped, engine);
        }
    }

    // -----------------------------------------------------------------------
    // Outbound
    // -----------------------------------------------------------------------

    /// Host: send the authoritative initial state and start play.
    ///
    /// Legal once per connection, right after the handshake. The turn owner is
    /// taken from the snapshot's `currentTurn` and seeded before sending, so
    /// both peers agree on the first mover.
    pub async fn broadcast_state(&mut self, snapshot: GameStateSnapshot) -> Result<(), SessionError> {
        if self.state.role != Role::Host {
            return Err(SessionError::NotHost);
        }
        if self.state_exchanged {
            return Err(SessionError::AlreadyBroadcast);
        }
        if self.state.phase != SessionPhase::Verified {
            return Err(SessionError::WrongPhase {
                op: "broadcast_state",
                phase: self.state.phase,
            });
        }
        self.send_state(snapshot).await?;
        self.state_exchanged = true;
        self.set_phase(SessionPhase::Active);
        Ok(())
    }

    /// Host: push a fresh snapshot while playing. Only while holding the turn,
    /// so the joiner cannot be mid-move.
    pub async fn resync_state(&mut self, snapshot: GameStateSnapshot) -> Result<(), SessionError> {
        if self.state.role != Role::Host {
            return Err(SessionError::NotHost);
        }
        if self.state.phase != SessionPhase::Active {
            return Err(SessionError::WrongPhase {
                op: "resync_state",
                phase: self.state.phase,
            });
        }
        self.state.turn.check_local_turn()?;
        self.send_state(snapshot).await
    }

    pub(crate) async fn send_state(&mut self, mut snapshot: GameStateSnapshot) -> Result<(), SessionError> {
        let owner = snapshot.current_turn()?;
        snapshot.host_role()?;
        snapshot.stamp_host_role(Role::Host);
        self.state.turn.seed(owner);

        let msg = NetworkMessage::GameState(snapshot);
        self.send_or_mark_lost(&msg).await?;
        tracing::info!("Game state sent, {owner} moves first");
        Ok(())
    }

    /// Send a move and hand the turn to the peer.
    ///
    /// `ACTION` goes out first, then `TURN_CHANGE`; ownership moves locally only
    /// after both writes succeed.
    pub async fn submit_action(&mut self, action: GameAction) -> Result<ActionId, SubmitError> {
        if self.state.phase != SessionPhase::Active || self.pending_loss.is_some() {
            return Err(SubmitError::NotConnected(self.state.phase));
        }
        if self.state.turn.check_local_turn().is_err() {
            return Err(SubmitError::NotYourTurn {
                owner: self.state.turn.owner(),
            });
        }

        let action_id = self.state.turn.next_action_id(&self.local_id);
        let change = self
            .state
            .turn
            .turn_change_for(action_id.clone())
            .map_err(|_| SubmitError::NotYourTurn {
                owner: self.state.turn.owner(),
            })?;

        self.send_or_mark_lost(&NetworkMessage::Action(action)).await?;
        self.send_or_mark_lost(&NetworkMessage::TurnChange(change.clone())).await?;

        self.state
            .turn
            .hand_over(&change)
            .map_err(|_| SubmitError::NotYourTurn {
                owner: self.state.turn.owner(),
            })?;
        tracing::debug!("Action {action_id} sent, turn handed to {}", change.next_turn);
        Ok(action_id)
    }

    /// Send a chat line. Needs a verified peer; never turn-gated.
    pub async fn send_chat(&mut self, text: &str) -> Result<(), SessionError> {
        if !self.state.phase.is_verified() {
            return Err(SessionError::WrongPhase {
                op: "chat",
                phase: self.state.phase,
            });
        }
        let msg = NetworkMessage::Chat(Chat {
            text: text.to_string(),
        });
        self.send_or_mark_lost(&msg).await?;
        Ok(())
    }

    async fn send_or_mark_lost(&mut self, msg: &NetworkMessage) -> Result<(), SendError> {
        let Some(conn) = self.conn.as_mut() else {
            return Err(SendError::Closed);
        };
        let result = conn.send(msg).await;
        if let Err(e) = &result
            && let Some(reason) = e.disconnect_reason()
        {
            tracing::warn!("Sending {} failed: {e}", msg.kind());
            self.pending_loss.get_or_insert(reason);
        }
        result
    }

    /// Tell the peer we are leaving, then close. No reconnection follows on
    /// either side.
    pub async fn leave(&mut self, reason: &str) {
        if let Some(conn) = self.conn.as_mut() {
            let msg = NetworkMessage::Disconnect(Disconnect {
                reason: reason.to_string(),
            });
            if let Err(e) = conn.send(&msg).await {
                tracing::debug!("Could not deliver leave notice: {e}");
            }
        }
        self.close().await;
    }

    /// Close every socket and wait for the reader task. Idempotent.
    pub async fn close(&mut self) {
        self.drop_connection().await;
        self.listener = None;
        self.pending_loss = None;
        self.state.turn.clear();
        self.enter_disconnected();
    }

    /// Cancel anything pending and close. The session cannot be re-established.
    pub async fn shutdown(&mut self) {
        let _ = self.stop_tx.send(true);
        self.close().await;
        tracing::info!("Session shut down");
    }

    // -----------------------------------------------------------------------
    // Inbound
    // -----------------------------------------------------------------------

    /// Wait for the next event. Pending forever while there is no connection,
    /// so it can sit in a `select!` next to other input.
    pub async fn recv(&mut self) -> TransportEvent {
        if let Some(reason) = self.pending_loss.take() {
            return TransportEvent::Closed(reason);
        }
        match self.conn.as_mut() {
            Some(conn) => match conn.next_event().await {
                Some(event) => event,
                None => TransportEvent::Closed(DisconnectReason::Local),
            },
            None => std::future::pending().await,
        }
    }

    /// Handle every event already queued, without waiting. Returns how many
    /// were handled.
    pub async fn process_events<E: GameEngine>(&mut self, engine: &mut E) -> usize {
        let mut handled = 0;
        loop {
            let event = match self.pending_loss.take() {
                Some(reason) => TransportEvent::Closed(reason),
                None => match self.conn.as_mut().and_then(Connection::try_next_event) {
                    Some(event) => event,
                    None => return handled,
                },
            };
            self.handle_event(event, engine).await;
            handled += 1;
        }
    }

    /// Wait up to `timeout` for one event, handle it and anything queued
    /// behind it. Returns how many were handled.
    pub async fn wait_for_event<E: GameEngine>(&mut self, engine: &mut E, timeout: Duration) -> usize {
        match tokio::time::timeout(timeout, self.recv()).await {
            Ok(event) => {
                self.handle_event(event, engine).await;
                1 + self.process_events(engine).await
            }
            Err(_) => 0,
        }
    }

    /// Apply one event to the session and the engine.
    pub async fn handle_event<E: GameEngine>(&mut self, event: TransportEvent, engine: &mut E) {
        match event {
            TransportEvent::Received(msg) => self.handle_message(msg, engine),
            TransportEvent::Malformed(report) => self.protocol_error(&report.message, engine),
            TransportEvent::Closed(reason) => self.on_connection_lost(reason, engine).await,
        }
    }

    fn handle_message<E: GameEngine>(&mut self, msg: NetworkMessage, engine: &mut E) {
        let kind = msg.kind();
        let phase = self.state.phase;
        tracing::debug!("<- {kind} while {phase}");

        if msg.requires_verified() && !phase.is_verified() {
            self.protocol_error(&format!("{kind} received while {phase}"), engine);
            return;
        }

        match msg {
            NetworkMessage::HandshakeRequest(_) | NetworkMessage::HandshakeResponse(_) => {
                self.protocol_error(&format!("{kind} after handshake"), engine);
            }
            NetworkMessage::Connect(info) => {
                tracing::debug!("Peer announced {}:{}", info.address, info.port);
                self.protocol_errors = 0;
            }
            NetworkMessage::GameState(snapshot) => self.apply_snapshot(snapshot, engine),
            NetworkMessage::Action(action) => {
                if phase != SessionPhase::Active {
                    self.protocol_error(&format!("{kind} received while {phase}"), engine);
                    return;
                }
                self.protocol_errors = 0;
                if let Err(e) = engine.on_remote_action(&action) {
                    tracing::warn!("Remote action rejected: {e}");
                    engine.on_session_error(SessionErrorKind::Sync, &e.to_string());
                }
            }
            NetworkMessage::TurnChange(change) => {
                if phase != SessionPhase::Active {
                    self.protocol_error(&format!("{kind} received while {phase}"), engine);
                    return;
                }
                match self.state.turn.apply_turn_change(&change) {
                    Ok(owner) => {
                        self.protocol_errors = 0;
                        tracing::debug!("Turn passed to {owner} by action {}", change.action_id);
                        engine.on_turn_changed(owner, self.state.turn.is_local_turn());
                    }
                    Err(TurnError::Duplicate(id)) => {
                        tracing::warn!("Ignoring repeated turn change for action {id}");
                    }
                    Err(e) => self.protocol_error(&e.to_string(), engine),
                }
            }
            NetworkMessage::Chat(chat) => {
                self.protocol_errors = 0;
                engine.on_chat(self.state.role.peer(), &chat.text);
            }
            NetworkMessage::Disconnect(notice) => {
                tracing::info!("Peer left: {}", notice.reason);
                self.pending_loss.get_or_insert(DisconnectReason::PeerLeft(notice.reason));
            }
            NetworkMessage::Error(report) => {
                tracing::warn!("Peer reported an error: {}", report.message);
                engine.on_session_error(
                    SessionErrorKind::Protocol,
                    &format!("peer reported: {}", report.message),
                );
            }
        }
    }

    /// Joiner: adopt the host's snapshot and start play.
    fn apply_snapshot<E: GameEngine>(&mut self, snapshot: GameStateSnapshot, engine: &mut E) {
        if self.state.role == Role::Host {
            self.protocol_error("GAME_STATE sent to the host", engine);
            return;
        }
        self.protocol_errors = 0;

        let owner = match snapshot.current_turn() {
            Ok(owner) => owner,
            Err(e) => {
                self.sync_error(SyncError::from(e), engine);
                return;
            }
        };
        match snapshot.host_role() {
            Ok(Some(asserted)) if asserted != Role::Host => {
                // Roles were fixed at connect time; keep them.
                self.sync_error(
                    SyncError::RoleMismatch {
                        expected: Role::Host,
                        asserted,
                    },
                    engine,
                );
            }
            Ok(_) => {}
            Err(e) => {
                self.sync_error(SyncError::from(e), engine);
                return;
            }
        }

        if let Err(e) = engine.on_state_received(&snapshot) {
            self.sync_error(e, engine);
            return;
        }

        self.state.turn.seed(owner);
        self.state_exchanged = true;
        self.set_phase(SessionPhase::Active);
        tracing::info!("Game state received, {owner} moves first");
        engine.on_turn_changed(owner, self.state.turn.is_local_turn());
    }

    fn sync_error<E: GameEngine>(&mut self, err: SyncError, engine: &mut E) {
        tracing::warn!("Sync error: {err}");
        engine.on_session_error(SessionErrorKind::Sync, &err.to_string());
    }

    /// Report a malformed or out-of-order message. Too many in a row drop the
    /// connection.
    pub(crate) fn protocol_error<E: GameEngine>(&mut self, detail: &str, engine: &mut E) {
        self.protocol_errors += 1;
        tracing::warn!(
            "Protocol error {}/{}: {detail}",
            self.protocol_errors,
            self.config.max_protocol_errors
        );
        engine.on_session_error(SessionErrorKind::Protocol, detail);
        if self.config.max_protocol_errors > 0
            && self.protocol_errors >= self.config.max_protocol_errors
        {
            self.pending_loss.get_or_insert_with(|| {
                DisconnectReason::Protocol(format!("{} consecutive protocol errors", self.protocol_errors))
            });
        }
    }
}
