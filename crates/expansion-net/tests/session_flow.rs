//! End-to-end session tests over loopback TCP.
//!
//! Two kinds of peers appear here: full [`Session`]s on both ends, and a
//! scripted raw peer that writes exact wire lines, for cases a well-behaved
//! session never produces (duplicates, corrupt roles, resets).

use std::net::SocketAddr;
use std::time::Duration;

use expansion_net::handshake::accept_response;
use expansion_net::{
    DisconnectReason, GameAction, GameEngine, GameStateSnapshot, HandshakeError, NetworkMessage,
    PeerInfo, ReconnectConfig, Role, Session, SessionConfig, SessionError, SessionErrorKind,
    SessionPhase, SubmitError, SyncError, UnitId, decode, encode,
};
use serde_json::json;
use socket2::{Domain, SockRef, Socket, Type};
use tokio::io::{AsyncBufReadExt, AsyncWriteExt, BufReader};
use tokio::net::{TcpListener, TcpStream};
use tokio::sync::mpsc;
use tokio::time::Instant;

// ---------------------------------------------------------------------------
// Recording engine
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, PartialEq)]
enum Event {
    RemoteAction(GameAction),
    TurnChanged(Role, bool),
    StateReceived,
    SessionError(SessionErrorKind, String),
    Disconnected(DisconnectReason),
    InputSuspended,
    LocalFallback,
    PeerConnected(String),
    Chat(Role, String),
}

/// Brings a host back on `addr` once `after_failures` reconnection attempts
/// have failed, handing the new listener to the test.
struct HostReturns {
    after_failures: usize,
    addr: SocketAddr,
    ready: mpsc::UnboundedSender<std::net::TcpListener>,
}

impl HostReturns {
    fn bind(self) {
        let socket = Socket::new(Domain::IPV4, Type::STREAM, None).unwrap();
        socket.set_reuse_address(true).unwrap();
        socket.bind(&self.addr.into()).unwrap();
        socket.listen(8).unwrap();
        let listener: std::net::TcpListener = socket.into();
        listener.set_nonblocking(true).unwrap();
        self.ready.send(listener).unwrap();
    }
}

struct RecordingEngine {
    events: Vec<Event>,
    units: Vec<u64>,
    current_turn: Role,
    host_returns: Option<HostReturns>,
}

impl RecordingEngine {
    fn new() -> Self {
        Self {
            events: Vec::new(),
            units: vec![1, 2, 3],
            current_turn: Role::Host,
            host_returns: None,
        }
    }

    fn count(&self, pred: impl Fn(&Event) -> bool) -> usize {
        self.events.iter().filter(|e| pred(e)).count()
    }

    fn has(&self, pred: impl Fn(&Event) -> bool) -> bool {
        self.count(pred) > 0
    }

    fn position(&self, pred: impl Fn(&Event) -> bool) -> Option<usize> {
        self.events.iter().position(pred)
    }
}

impl GameEngine for RecordingEngine {
    fn on_remote_action(&mut self, action: &GameAction) -> Result<(), SyncError> {
        for id in action.unit_ids() {
            if !self.units.contains(&id.0) {
                return Err(SyncError::UnknownUnit(id));
            }
        }
        self.events.push(Event::RemoteAction(action.clone()));
        Ok(())
    }

    fn on_turn_changed(&mut self, owner: Role, local_can_act: bool) {
        self.current_turn = owner;
        self.events.push(Event::TurnChanged(owner, local_can_act));
    }

    fn on_state_received(&mut self, _snapshot: &GameStateSnapshot) -> Result<(), SyncError> {
        self.events.push(Event::StateReceived);
        Ok(())
    }

    fn on_session_error(&mut self, kind: SessionErrorKind, message: &str) {
        self.events.push(Event::SessionError(kind, message.to_string()));
        let failures = self.count(|e| matches!(e, Event::SessionError(SessionErrorKind::Connect, _)));
        if self
            .host_returns
            .as_ref()
            .is_some_and(|r| failures == r.after_failures)
            && let Some(returns) = self.host_returns.take()
        {
            returns.bind();
        }
    }

    fn on_disconnected(&mut self, reason: &DisconnectReason) {
        self.events.push(Event::Disconnected(reason.clone()));
    }

    fn on_input_suspended(&mut self) {
        self.events.push(Event::InputSuspended);
    }

    fn on_local_fallback(&mut self) {
        self.events.push(Event::LocalFallback);
    }

    fn on_peer_connected(&mut self, peer: &PeerInfo) {
        self.events.push(Event::PeerConnected(peer.peer_id.clone()));
    }

    fn on_chat(&mut self, from: Role, text: &str) {
        self.events.push(Event::Chat(from, text.to_string()));
    }

    fn snapshot(&self) -> GameStateSnapshot {
        GameStateSnapshot::new(json!({
            "units": self.units,
            "currentTurn": self.current_turn.label(),
        }))
        .unwrap()
    }
}

// ---------------------------------------------------------------------------
// Helpers
// ---------------------------------------------------------------------------

fn loopback() -> SocketAddr {
    "127.0.0.1:0".parse().unwrap()
}

fn fast_config(role: Role, addr: SocketAddr, id: &str) -> SessionConfig {
    let mut config = SessionConfig::new(role, addr);
    config.local_id = Some(id.to_string());
    config.transport.accept_poll_interval = Duration::from_millis(20);
    config.transport.connect_timeout = Duration::from_secs(2);
    config.transport.connect_attempts = 3;
    config.transport.connect_retry_delay = Duration::from_millis(50);
    config.handshake.timeout = Duration::from_secs(2);
    config.reconnect = ReconnectConfig {
        initial_delay: Duration::from_millis(50),
        backoff_multiplier: 1.0,
        max_delay: Duration::from_millis(50),
        max_attempts: 3,
        jitter: 0.0,
    };
    config.reconnect_accept_window = Duration::from_secs(2);
    config.probe_timeout = Duration::from_millis(500);
    config
}

fn opening_snapshot() -> GameStateSnapshot {
    GameStateSnapshot::new(json!({"units": [1, 2, 3], "currentTurn": "player"})).unwrap()
}

/// Handle events until `done` holds, failing after a few seconds.
async fn pump_until(
    session: &mut Session,
    engine: &mut RecordingEngine,
    done: impl Fn(&Session, &RecordingEngine) -> bool,
) {
    let deadline = Instant::now() + Duration::from_secs(5);
    while !done(session, engine) {
        assert!(
            Instant::now() < deadline,
            "Condition not reached; phase {:?}, events {:?}",
            session.phase(),
            engine.events
        );
        session
            .wait_for_event(engine, Duration::from_millis(50))
            .await;
    }
}

/// Host and joiner sessions, verified and active, host to move.
async fn active_pair() -> (Session, RecordingEngine, Session, RecordingEngine) {
    let mut host_engine = RecordingEngine::new();
    let mut joiner_engine = RecordingEngine::new();
    let mut host = Session::new(fast_config(Role::Host, loopback(), "s1"));
    let addr = host.listen(&mut host_engine).unwrap();
    let mut joiner = Session::new(fast_config(Role::Joiner, addr, "c1"));

    let (h, j) = tokio::join!(
        host.establish(&mut host_engine),
        joiner.establish(&mut joiner_engine)
    );
    h.unwrap();
    j.unwrap();

    host.broadcast_state(opening_snapshot()).await.unwrap();
    pump_until(&mut joiner, &mut joiner_engine, |s, _| {
        s.phase() == SessionPhase::Active
    })
    .await;
    (host, host_engine, joiner, joiner_engine)
}

/// A hand-driven peer speaking raw wire lines.
struct RawPeer {
    stream: BufReader<TcpStream>,
}

impl RawPeer {
    fn new(stream: TcpStream) -> Self {
        Self {
            stream: BufReader::new(stream),
        }
    }

    async fn send(&mut self, msg: &NetworkMessage) {
        let bytes = encode(msg).unwrap();
        self.stream.get_mut().write_all(&bytes).await.unwrap();
    }

    async fn send_raw(&mut self, line: &str) {
        self.stream.get_mut().write_all(line.as_bytes()).await.unwrap();
        self.stream.get_mut().write_all(b"\n").await.unwrap();
    }

    /// Next message, `None` on EOF.
    async fn read(&mut self) -> Option<NetworkMessage> {
        let mut line = String::new();
        let n = self.stream.read_line(&mut line).await.ok()?;
        if n == 0 {
            return None;
        }
        Some(decode(line.trim_end().as_bytes()).unwrap())
    }

    /// Drop the connection with an RST instead of a FIN.
    fn reset(self) {
        let stream = self.stream.into_inner();
        SockRef::from(&stream)
            .set_linger(Some(Duration::ZERO))
            .unwrap();
        drop(stream);
    }
}

/// Play the host's side of the handshake on `listener`, skipping probes.
async fn raw_host_accept(listener: &TcpListener) -> RawPeer {
    loop {
        let (stream, _) = listener.accept().await.unwrap();
        let mut peer = RawPeer::new(stream);
        match peer.read().await {
            None => continue,
            Some(NetworkMessage::HandshakeRequest(req)) => {
                peer.send(&NetworkMessage::HandshakeResponse(accept_response("s1", &req)))
                    .await;
                return peer;
            }
            Some(other) => panic!("expected handshake request, got {other:?}"),
        }
    }
}

/// Joiner session talking to a raw host that has sent the opening state.
async fn joiner_with_raw_host(
    snapshot: serde_json::Value,
) -> (Session, RecordingEngine, RawPeer, TcpListener) {
    joiner_with_raw_host_tuned(snapshot, |_| {}).await
}

async fn joiner_with_raw_host_tuned(
    snapshot: serde_json::Value,
    tune: impl FnOnce(&mut SessionConfig),
) -> (Session, RecordingEngine, RawPeer, TcpListener) {
    let listener = TcpListener::bind(loopback()).await.unwrap();
    let addr = listener.local_addr().unwrap();
    let mut engine = RecordingEngine::new();
    let mut config = fast_config(Role::Joiner, addr, "c1");
    tune(&mut config);
    let mut joiner = Session::new(config);

    let (joined, mut host) = tokio::join!(joiner.establish(&mut engine), raw_host_accept(&listener));
    joined.unwrap();
    host.send(&NetworkMessage::GameState(
        GameStateSnapshot::new(snapshot).unwrap(),
    ))
    .await;
    pump_until(&mut joiner, &mut engine, |s, _| {
        s.phase() == SessionPhase::Active
    })
    .await;
    (joiner, engine, host, listener)
}

fn turn_change(next: &str, id: &str) -> String {
    format!(r#"{{"type":"TURN_CHANGE","data":{{"nextTurn":"{next}","actionId":"{id}"}}}}"#)
}

const CONNECT_1_2: &str =
    r#"{"type":"ACTION","data":{"kind":"connect","sourceId":1,"targetId":2}}"#;

// ---------------------------------------------------------------------------
// Handshake
// ---------------------------------------------------------------------------

#[tokio::test]
async fn test_handshake_and_opening_state_scenario() {
    let (host, host_engine, joiner, joiner_engine) = active_pair().await;

    assert_eq!(host.phase(), SessionPhase::Active);
    assert_eq!(joiner.phase(), SessionPhase::Active);
    assert_eq!(host.state().session_id, "s1/c1");
    assert_eq!(joiner.state().session_id, "s1/c1");
    assert!(host.state().peer_verified && joiner.state().peer_verified);

    assert_eq!(joiner.role().label(), "pc");
    assert_eq!(joiner.state().local_turn_owner(), Some(Role::Host));
    assert!(!joiner.is_local_turn(), "Joiner must wait for a turn change");
    assert!(host.is_local_turn());

    assert!(host_engine.has(|e| *e == Event::PeerConnected("c1".to_string())));
    assert!(joiner_engine.has(|e| *e == Event::PeerConnected("s1".to_string())));
    assert!(joiner_engine.has(|e| *e == Event::StateReceived));
    assert!(joiner_engine.has(|e| *e == Event::TurnChanged(Role::Host, false)));
}

#[tokio::test]
async fn test_version_mismatch_never_verifies() {
    let mut host_engine = RecordingEngine::new();
    let mut joiner_engine = RecordingEngine::new();
    let mut host = Session::new(fast_config(Role::Host, loopback(), "s1"));
    let addr = host.listen(&mut host_engine).unwrap();
    let mut joiner_config = fast_config(Role::Joiner, addr, "c1");
    joiner_config.handshake.version = "2.0".to_string();
    let mut joiner = Session::new(joiner_config);

    let (host_result, joiner_result) = tokio::join!(
        tokio::time::timeout(Duration::from_millis(500), host.establish(&mut host_engine)),
        joiner.establish(&mut joiner_engine)
    );

    assert!(host_result.is_err(), "Host should still be waiting for a valid peer");
    assert!(matches!(
        joiner_result,
        Err(SessionError::Handshake(HandshakeError::Rejected(_)))
    ));
    assert_ne!(host.phase(), SessionPhase::Verified);
    assert_eq!(joiner.phase(), SessionPhase::Disconnected);
    assert!(host_engine.has(|e| matches!(e, Event::SessionError(SessionErrorKind::Handshake, _))));
    assert!(
        !joiner_engine.has(|e| matches!(e, Event::Disconnected(_))),
        "A rejected handshake is not a mid-game disconnect"
    );
}

#[tokio::test]
async fn test_host_skips_probe_connections() {
    let mut host_engine = RecordingEngine::new();
    let mut joiner_engine = RecordingEngine::new();
    let mut host = Session::new(fast_config(Role::Host, loopback(), "s1"));
    let addr = host.listen(&mut host_engine).unwrap();
    let mut joiner = Session::new(fast_config(Role::Joiner, addr, "c1"));

    let probe_then_join = async {
        let report = expansion_net::probe_once(addr, Duration::from_secs(1)).await;
        assert!(report.is_reachable());
        joiner.establish(&mut joiner_engine).await
    };
    let (h, j) = tokio::join!(host.establish(&mut host_engine), probe_then_join);
    h.unwrap();
    j.unwrap();
    assert!(
        !host_engine.has(|e| matches!(e, Event::SessionError(..))),
        "A probe is not an error: {:?}",
        host_engine.events
    );
}

#[tokio::test]
async fn test_host_keeps_listening_after_peer_resets_before_accept() {
    let mut host_engine = RecordingEngine::new();
    let mut joiner_engine = RecordingEngine::new();
    let mut host = Session::new(fast_config(Role::Host, loopback(), "s1"));
    let addr = host.listen(&mut host_engine).unwrap();

    // Connects, then vanishes with an RST while still in the accept queue.
    let crashed = TcpStream::connect(addr).await.unwrap();
    SockRef::from(&crashed)
        .set_linger(Some(Duration::ZERO))
        .unwrap();
    drop(crashed);
    tokio::time::sleep(Duration::from_millis(50)).await;

    let mut joiner = Session::new(fast_config(Role::Joiner, addr, "c1"));
    let (h, j) = tokio::join!(
        host.establish(&mut host_engine),
        joiner.establish(&mut joiner_engine)
    );
    h.unwrap();
    j.unwrap();

    assert_eq!(host.phase(), SessionPhase::Verified);
    assert!(host.state().peer_verified);
    assert!(
        !host_engine.has(|e| matches!(e, Event::SessionError(..))),
        "A dead pending connection is not an error: {:?}",
        host_engine.events
    );
}

#[tokio::test]
async fn test_game_message_before_handshake_is_reported_not_applied() {
    let mut host_engine = RecordingEngine::new();
    let mut host = Session::new(fast_config(Role::Host, loopback(), "s1"));
    let addr = host.listen(&mut host_engine).unwrap();

    let raw_joiner = async {
        let mut peer = RawPeer::new(TcpStream::connect(addr).await.unwrap());
        peer.send_raw(CONNECT_1_2).await;
        peer.send_raw(r#"{"type":"HANDSHAKE_REQUEST","data":{"clientId":"c1","gameId":"ExpansionWar","version":"1.0"}}"#)
            .await;
        let reply = peer.read().await;
        (peer, reply)
    };
    let (h, (_peer, reply)) = tokio::join!(host.establish(&mut host_engine), raw_joiner);
    h.unwrap();

    assert!(matches!(reply, Some(NetworkMessage::HandshakeResponse(_))));
    assert!(!host_engine.has(|e| matches!(e, Event::RemoteAction(_))));
    assert!(host_engine.has(|e| matches!(e, Event::SessionError(SessionErrorKind::Protocol, m) if m.contains("ACTION"))));
}

#[tokio::test]
async fn test_refused_connect_gives_actionable_error() {
    let closed = TcpListener::bind(loopback()).await.unwrap().local_addr().unwrap();
    let mut engine = RecordingEngine::new();
    let mut joiner = Session::new(fast_config(Role::Joiner, closed, "c1"));

    let result = joiner.establish(&mut engine).await;
    assert!(matches!(result, Err(SessionError::Connect(_))));
    assert_eq!(joiner.phase(), SessionPhase::Disconnected);
    assert!(engine.has(|e| matches!(
        e,
        Event::SessionError(SessionErrorKind::Connect, m) if m.contains("No game is listening")
    )));
}

#[tokio::test]
async fn test_second_bind_reports_port_in_use() {
    let mut engine = RecordingEngine::new();
    let taken = TcpListener::bind(loopback()).await.unwrap();
    let mut host = Session::new(fast_config(Role::Host, taken.local_addr().unwrap(), "s1"));

    let result = host.listen(&mut engine);
    assert!(matches!(result, Err(SessionError::Bind(_))));
    assert!(engine.has(|e| matches!(
        e,
        Event::SessionError(SessionErrorKind::Bind, m) if m.contains("in use")
    )));
}

// ---------------------------------------------------------------------------
// Turns
// ---------------------------------------------------------------------------

#[tokio::test]
async fn test_action_exchange_flips_turn_exactly_once() {
    let (mut host, mut host_engine, mut joiner, mut joiner_engine) = active_pair().await;

    let not_mine = joiner
        .submit_action(GameAction::Connect {
            source_id: UnitId(1),
            target_id: UnitId(2),
        })
        .await;
    assert!(matches!(
        not_mine,
        Err(SubmitError::NotYourTurn {
            owner: Some(Role::Host)
        })
    ));

    let action = GameAction::Connect {
        source_id: UnitId(1),
        target_id: UnitId(2),
    };
    let id = host.submit_action(action.clone()).await.unwrap();
    assert_eq!(id.0, "s1:1");
    assert!(!host.is_local_turn(), "Host gives up the turn on submit");
    assert!(!(host.is_local_turn() && joiner.is_local_turn()));

    pump_until(&mut joiner, &mut joiner_engine, |s, _| s.is_local_turn()).await;
    assert!(!host.is_local_turn());
    assert_eq!(
        joiner_engine.count(|e| matches!(e, Event::TurnChanged(..))),
        2,
        "Opening seed plus exactly one hand-off"
    );
    let action_at = joiner_engine
        .position(|e| *e == Event::RemoteAction(action.clone()))
        .unwrap();
    let turn_at = joiner_engine
        .position(|e| *e == Event::TurnChanged(Role::Joiner, true))
        .unwrap();
    assert!(action_at < turn_at, "Action is applied before the turn moves");

    joiner
        .submit_action(GameAction::Disconnect {
            source_id: UnitId(1),
            target_id: UnitId(2),
        })
        .await
        .unwrap();
    assert!(!joiner.is_local_turn());
    pump_until(&mut host, &mut host_engine, |s, _| s.is_local_turn()).await;
    assert!(host_engine.has(|e| *e == Event::TurnChanged(Role::Host, true)));
}

#[tokio::test]
async fn test_unknown_unit_is_sync_error_and_session_survives() {
    let (mut host, _host_engine, mut joiner, mut joiner_engine) = active_pair().await;

    host.submit_action(GameAction::UnitUpdate {
        unit_id: UnitId(99),
        value: 7,
        owner: "player".to_string(),
    })
    .await
    .unwrap();
    pump_until(&mut joiner, &mut joiner_engine, |s, _| s.is_local_turn()).await;

    assert!(joiner_engine.has(|e| matches!(
        e,
        Event::SessionError(SessionErrorKind::Sync, m) if m.contains("#99")
    )));
    assert!(!joiner_engine.has(|e| matches!(e, Event::RemoteAction(_))));
    assert_eq!(joiner.phase(), SessionPhase::Active);
}

#[tokio::test]
async fn test_duplicated_messages_never_move_the_turn_twice() {
    let (mut joiner, mut engine, mut host, _listener) =
        joiner_with_raw_host(json!({"units": [1, 2], "currentTurn": "player"})).await;

    // A repeated ACTION alone leaves the turn with the host.
    host.send_raw(CONNECT_1_2).await;
    host.send_raw(CONNECT_1_2).await;
    pump_until(&mut joiner, &mut engine, |_, e| {
        e.count(|ev| matches!(ev, Event::RemoteAction(_))) == 2
    })
    .await;
    assert_eq!(joiner.state().local_turn_owner(), Some(Role::Host));
    assert!(!joiner.is_local_turn());

    // A repeated TURN_CHANGE is applied once.
    host.send_raw(&turn_change("pc", "s1:1")).await;
    host.send_raw(&turn_change("pc", "s1:1")).await;
    host.send_raw(r#"{"type":"CHAT","data":{"text":"marker"}}"#).await;
    pump_until(&mut joiner, &mut engine, |_, e| {
        e.has(|ev| matches!(ev, Event::Chat(..)))
    })
    .await;
    assert!(joiner.is_local_turn());
    assert_eq!(
        engine.count(|ev| matches!(ev, Event::TurnChanged(Role::Joiner, true))),
        1
    );
}

#[tokio::test]
async fn test_corrupt_turn_change_keeps_previous_owner() {
    let (mut joiner, mut engine, mut host, _listener) =
        joiner_with_raw_host(json!({"units": [1, 2], "currentTurn": "player"})).await;

    host.send_raw(&turn_change("neutral", "s1:1")).await;
    pump_until(&mut joiner, &mut engine, |_, e| {
        e.has(|ev| matches!(ev, Event::SessionError(SessionErrorKind::Protocol, _)))
    })
    .await;
    assert_eq!(joiner.state().local_turn_owner(), Some(Role::Host));
    assert_eq!(joiner.phase(), SessionPhase::Active);
}

#[tokio::test]
async fn test_snapshot_claiming_other_host_role_is_flagged() {
    let (joiner, engine, _host, _listener) = joiner_with_raw_host(
        json!({"units": [], "currentTurn": "player", "hostRole": "pc"}),
    )
    .await;

    assert_eq!(joiner.role(), Role::Joiner, "Roles never change after connect");
    assert!(engine.has(|e| matches!(
        e,
        Event::SessionError(SessionErrorKind::Sync, m) if m.contains("expected player")
    )));
}

#[tokio::test]
async fn test_chat_and_connection_age() {
    let (mut host, mut host_engine, mut joiner, _joiner_engine) = active_pair().await;

    tokio::time::sleep(Duration::from_millis(30)).await;
    assert!(joiner.connection_age() >= Duration::from_millis(30));

    joiner.send_chat("gl hf").await.unwrap();
    pump_until(&mut host, &mut host_engine, |_, e| {
        e.has(|ev| *ev == Event::Chat(Role::Joiner, "gl hf".to_string()))
    })
    .await;
    assert!(host.is_local_turn(), "Chat is not turn-gated and moves nothing");
}

#[tokio::test]
async fn test_second_dial_is_refused_while_active() {
    let (host, _host_engine, _joiner, _joiner_engine) = active_pair().await;
    let addr = host.bound_addr().unwrap();
    let err = TcpStream::connect(addr).await.unwrap_err();
    assert_eq!(err.kind(), std::io::ErrorKind::ConnectionRefused);
}

// ---------------------------------------------------------------------------
// Disconnects
// ---------------------------------------------------------------------------

#[tokio::test]
async fn test_reset_reports_disconnect_before_reconnecting() {
    let (mut joiner, mut engine, host, listener) =
        joiner_with_raw_host(json!({"units": [1], "currentTurn": "player"})).await;

    // Nobody comes back: every attempt fails and the game goes local.
    drop(listener);
    host.reset();
    pump_until(&mut joiner, &mut engine, |s, _| s.fell_back_to_local()).await;

    let disconnected = engine
        .position(|e| *e == Event::Disconnected(DisconnectReason::Reset))
        .expect("reset should be reported");
    let suspended = engine.position(|e| *e == Event::InputSuspended).unwrap();
    let first_attempt = engine
        .position(|e| matches!(e, Event::SessionError(SessionErrorKind::Connect, _)))
        .expect("at least one reconnection attempt");
    let fallback = engine.position(|e| *e == Event::LocalFallback).unwrap();

    assert!(suspended < disconnected);
    assert!(disconnected < first_attempt);
    assert!(first_attempt < fallback);
    assert_eq!(
        engine.count(|e| matches!(e, Event::SessionError(SessionErrorKind::Connect, _))),
        3,
        "One failure per configured attempt"
    );
    assert_eq!(joiner.phase(), SessionPhase::Disconnected);
    assert_eq!(joiner.state().local_turn_owner(), None);
    assert!(joiner.peer().is_none());
}

#[tokio::test]
async fn test_reset_then_host_returns_restores_play() {
    let (mut joiner, mut engine, host, listener) =
        joiner_with_raw_host(json!({"units": [1], "currentTurn": "player"})).await;

    host.reset();
    let host_again = tokio::spawn(async move {
        let mut peer = raw_host_accept(&listener).await;
        peer.send_raw(r#"{"type":"GAME_STATE","data":{"units":[1],"currentTurn":"pc"}}"#)
            .await;
        (peer, listener)
    });

    pump_until(&mut joiner, &mut engine, |s, e| {
        s.phase() == SessionPhase::Active && e.count(|ev| *ev == Event::StateReceived) == 2
    })
    .await;
    let _host = host_again.await.unwrap();

    assert!(!joiner.fell_back_to_local());
    assert!(!engine.has(|e| *e == Event::LocalFallback));
    assert!(joiner.is_local_turn(), "Resynced snapshot hands the turn to pc");
    assert_eq!(joiner.role(), Role::Joiner);
    assert_eq!(
        engine.count(|e| *e == Event::PeerConnected("s1".to_string())),
        2
    );
}

#[tokio::test]
async fn test_failures_below_the_cap_still_end_active() {
    let (mut joiner, mut engine, host, listener) =
        joiner_with_raw_host(json!({"units": [1], "currentTurn": "player"})).await;
    let addr = listener.local_addr().unwrap();
    let max_attempts = fast_config(Role::Joiner, addr, "c1").reconnect.max_attempts as usize;
    let failures = max_attempts - 1;

    let (ready_tx, mut ready_rx) = mpsc::unbounded_channel();
    engine.host_returns = Some(HostReturns {
        after_failures: failures,
        addr,
        ready: ready_tx,
    });
    let host_again = tokio::spawn(async move {
        let listener = TcpListener::from_std(ready_rx.recv().await.unwrap()).unwrap();
        let mut peer = raw_host_accept(&listener).await;
        peer.send_raw(r#"{"type":"GAME_STATE","data":{"units":[1],"currentTurn":"player"}}"#)
            .await;
        (peer, listener)
    });

    drop(listener);
    host.reset();
    pump_until(&mut joiner, &mut engine, |s, e| {
        s.phase() == SessionPhase::Active && e.count(|ev| *ev == Event::StateReceived) == 2
    })
    .await;
    let _host = host_again.await.unwrap();

    assert_eq!(
        engine.count(|e| matches!(e, Event::SessionError(SessionErrorKind::Connect, _))),
        failures,
        "Each refused attempt is reported once"
    );
    let last_failure = engine
        .events
        .iter()
        .rposition(|e| matches!(e, Event::SessionError(SessionErrorKind::Connect, _)))
        .unwrap();
    let reconnected = engine
        .events
        .iter()
        .rposition(|e| *e == Event::PeerConnected("s1".to_string()))
        .unwrap();
    assert!(last_failure < reconnected);
    assert!(!engine.has(|e| *e == Event::LocalFallback));
    assert!(!joiner.fell_back_to_local());
    assert_eq!(joiner.phase(), SessionPhase::Active);
}

#[tokio::test]
async fn test_stop_from_another_task_cuts_reconnection_short() {
    let (mut joiner, mut engine, host, listener) =
        joiner_with_raw_host_tuned(json!({"units": [1], "currentTurn": "player"}), |c| {
            c.reconnect.initial_delay = Duration::from_secs(30);
            c.reconnect.max_delay = Duration::from_secs(30);
            c.reconnect.max_attempts = 5;
        })
        .await;

    let stop = joiner.stop_handle();
    let interrupt = tokio::spawn(async move {
        tokio::time::sleep(Duration::from_millis(200)).await;
        stop.stop();
    });

    let started = Instant::now();
    drop(listener);
    host.reset();
    pump_until(&mut joiner, &mut engine, |s, _| s.fell_back_to_local()).await;
    interrupt.await.unwrap();

    assert!(
        started.elapsed() < Duration::from_secs(3),
        "Stop must not wait out the backoff, took {:?}",
        started.elapsed()
    );
    assert!(engine.has(|e| matches!(
        e,
        Event::SessionError(SessionErrorKind::Disconnect, m) if m.contains("stopped")
    )));
    assert_eq!(
        engine.count(|e| matches!(e, Event::SessionError(SessionErrorKind::Connect, _))),
        0,
        "No attempt ran before the stop"
    );
    assert_eq!(joiner.phase(), SessionPhase::Disconnected);
}

#[tokio::test]
async fn test_host_rebinds_and_resends_state_after_reset() {
    let mut engine = RecordingEngine::new();
    let mut host = Session::new(fast_config(Role::Host, loopback(), "s1"));
    let addr = host.listen(&mut engine).unwrap();

    let handshake_line = r#"{"type":"HANDSHAKE_REQUEST","data":{"clientId":"c1","gameId":"ExpansionWar","version":"1.0"}}"#;
    let raw_joiner = async {
        let mut peer = RawPeer::new(TcpStream::connect(addr).await.unwrap());
        peer.send_raw(handshake_line).await;
        assert!(matches!(peer.read().await, Some(NetworkMessage::HandshakeResponse(_))));
        peer
    };
    let (h, mut peer) = tokio::join!(host.establish(&mut engine), raw_joiner);
    h.unwrap();
    host.broadcast_state(opening_snapshot()).await.unwrap();
    assert!(matches!(peer.read().await, Some(NetworkMessage::GameState(_))));

    peer.reset();
    let rejoin = tokio::spawn(async move {
        let deadline = Instant::now() + Duration::from_secs(5);
        let stream = loop {
            match TcpStream::connect(addr).await {
                Ok(stream) => break stream,
                Err(_) if Instant::now() < deadline => {
                    tokio::time::sleep(Duration::from_millis(20)).await
                }
                Err(e) => panic!("host never came back: {e}"),
            }
        };
        let mut peer = RawPeer::new(stream);
        peer.send_raw(handshake_line).await;
        let response = peer.read().await;
        let state = peer.read().await;
        (peer, response, state)
    });

    pump_until(&mut host, &mut engine, |s, e| {
        e.has(|ev| *ev == Event::Disconnected(DisconnectReason::Reset))
            && s.phase() == SessionPhase::Active
    })
    .await;
    let (_peer, response, state) = rejoin.await.unwrap();

    assert!(matches!(response, Some(NetworkMessage::HandshakeResponse(_))));
    let Some(NetworkMessage::GameState(snapshot)) = state else {
        panic!("expected a fresh GAME_STATE, got {state:?}");
    };
    assert_eq!(snapshot.host_role(), Ok(Some(Role::Host)));
    assert_eq!(snapshot.current_turn(), Ok(Role::Host));
    assert!(engine.has(|e| *e == Event::Disconnected(DisconnectReason::Reset)));
    assert!(host.is_local_turn());
    assert_eq!(host.bound_addr(), Some(addr), "Host rebinds the same port");
}

#[tokio::test]
async fn test_peer_leaving_falls_back_without_retry() {
    let (mut host, _host_engine, mut joiner, mut joiner_engine) = active_pair().await;

    host.leave("player quit").await;
    assert_eq!(host.phase(), SessionPhase::Disconnected);

    pump_until(&mut joiner, &mut joiner_engine, |s, _| s.fell_back_to_local()).await;
    assert!(joiner_engine.has(|e| {
        *e == Event::Disconnected(DisconnectReason::PeerLeft("player quit".to_string()))
    }));
    assert!(
        !joiner_engine.has(|e| matches!(e, Event::SessionError(SessionErrorKind::Connect, _))),
        "No reconnection after a deliberate leave"
    );
    assert_eq!(joiner.phase(), SessionPhase::Disconnected);
}

#[tokio::test]
async fn test_repeated_garbage_drops_the_connection() {
    let (mut joiner, mut engine, mut host, _listener) =
        joiner_with_raw_host(json!({"units": [], "currentTurn": "player"})).await;

    for _ in 0..5 {
        host.send_raw("this is not json").await;
    }
    pump_until(&mut joiner, &mut engine, |s, _| s.fell_back_to_local()).await;

    assert!(engine.has(|e| matches!(e, Event::Disconnected(DisconnectReason::Protocol(_)))));
    assert!(engine.count(|e| matches!(e, Event::SessionError(SessionErrorKind::Protocol, _))) >= 5);
}

#[tokio::test]
async fn test_close_releases_everything() {
    let (mut host, _host_engine, mut joiner, _joiner_engine) = active_pair().await;
    host.close().await;
    joiner.close().await;
    joiner.close().await;

    assert_eq!(host.phase(), SessionPhase::Disconnected);
    assert_eq!(joiner.phase(), SessionPhase::Disconnected);
    assert_eq!(host.connection_age(), Duration::ZERO);
    assert!(matches!(
        joiner.send_chat("anyone?").await,
        Err(SessionError::WrongPhase { .. })
    ));
}
