//! Recovery from a connection lost mid-game.
//!
//! When an active session loses its connection, the engine is told to suspend
//! input and why the connection went away. Resets are retried automatically;
//! other unexpected losses are retried if the engine agrees; a peer that left
//! on purpose or kept sending garbage is never retried. Each attempt waits
//! out an exponential backoff with jitter ([`ReconnectState`]). A joiner probes
//! the host before redoing connect and handshake; a host binds its port again
//! and waits a bounded window for the joiner. After a successful reconnect the
//! host re-sends the engine's current snapshot. If every attempt fails, the
//! session is torn down and the engine falls back to local play.

use std::time::Duration;

use rand::Rng;

use crate::engine::GameEngine;
use crate::error::{DisconnectReason, SessionErrorKind};
use crate::messages::Role;
use crate::prober::probe_once;
use crate::session::{Session, SessionError, SessionPhase};
use crate::transport::{self, wait_stopped};

/// Backoff settings for reconnection attempts.
#[derive(Debug, Clone)]
pub struct ReconnectConfig {
    /// Delay before the first attempt. Default: 2 s.
    pub initial_delay: Duration,
    /// Growth factor between attempts. Default: 1.5.
    pub backoff_multiplier: f64,
    /// Upper bound on any delay. Default: 10 s.
    pub max_delay: Duration,
    /// Attempts before giving up. Default: 5.
    pub max_attempts: u32,
    /// Relative jitter, 0.0 to 1.0, applied as +/- to each delay. Default: 0.1.
    pub jitter: f64,
}

impl Default for ReconnectConfig {
    fn default() -> Self {
        Self {
            initial_delay: Duration::from_secs(2),
            backoff_multiplier: 1.5,
            max_delay: Duration::from_secs(10),
            max_attempts: 5,
            jitter: 0.1,
        }
    }
}

/// Attempt counter and delay schedule.
#[derive(Debug, Clone)]
pub struct ReconnectState {
    config: ReconnectConfig,
    attempts: u32,
    current_delay: Duration,
}

impl ReconnectState {
    pub fn new(config: ReconnectConfig) -> Self {
        let initial = config.initial_delay;
        Self {
            config,
            attempts: 0,
            current_delay: initial,
        }
    }

    /// Delay before the next attempt, counting it. `None` once the attempts
    /// are used up.
    pub fn next_delay(&mut self) -> Option<Duration> {
        if self.attempts >= self.config.max_attempts {
            return None;
        }
        let base = self.current_delay;
        self.attempts += 1;

        let jitter = self.config.jitter.clamp(0.0, 1.0);
        let jittered = if jitter > 0.0 && !base.is_zero() {
            let factor = rand::rng().random_range((1.0 - jitter)..=(1.0 + jitter));
            base.mul_f64(factor)
        } else {
            base
        };

        let next = self.current_delay.mul_f64(self.config.backoff_multiplier.max(1.0));
        self.current_delay = next.min(self.config.max_delay);

        Some(jittered.min(self.config.max_delay))
    }

    /// Start over after a success.
    pub fn reset(&mut self) {
        self.attempts = 0;
        self.current_delay = self.config.initial_delay;
    }

    pub fn attempts(&self) -> u32 {
        self.attempts
    }
}

/// Why reconnection ended without a connection.
#[derive(Debug, thiserror::Error)]
pub enum ReconnectError {
    /// Every attempt failed.
    #[error("gave up after {0} reconnection attempts")]
    MaxAttemptsExhausted(u32),

    /// The session was stopped while reconnecting.
    #[error("reconnection stopped")]
    Stopped,

    /// The joiner's pre-connect probe did not find the host.
    #[error("{0}")]
    HostUnreachable(String),
}

/// What to do about a lost connection.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ReconnectPolicy {
    /// Retry without asking.
    Automatic,
    /// Retry if [`GameEngine::should_reconnect`] agrees.
    AskEngine,
    /// Do not retry.
    Never,
}

impl ReconnectPolicy {
    pub fn for_reason(reason: &DisconnectReason) -> Self {
        match reason {
            DisconnectReason::Reset => ReconnectPolicy::Automatic,
            other if other.is_unexpected() => ReconnectPolicy::AskEngine,
            _ => ReconnectPolicy::Never,
        }
    }
}

// ---------------------------------------------------------------------------
// Supervisor
// ---------------------------------------------------------------------------

impl Session {
    /// React to the loss of the current connection.
    pub(crate) async fn on_connection_lost<E: GameEngine>(
        &mut self,
        reason: DisconnectReason,
        engine: &mut E,
    ) {
        let was_playing = self.state.phase.is_verified();
        tracing::warn!(
            "Connection lost while {} ({reason}, connected for {:?})",
            self.state.phase,
            self.connection_age()
        );
        self.drop_connection().await;

        if !was_playing {
            engine.on_session_error(SessionErrorKind::Disconnect, &reason.to_string());
            self.enter_disconnected();
            return;
        }
        self.set_phase(SessionPhase::Closing);

        engine.on_input_suspended();
        engine.on_disconnected(&reason);

        let retry = match ReconnectPolicy::for_reason(&reason) {
            ReconnectPolicy::Automatic => true,
            ReconnectPolicy::AskEngine => engine.should_reconnect(&reason),
            ReconnectPolicy::Never => false,
        };

        if retry {
            match self.reconnect(engine).await {
                Ok(()) => return,
                Err(e) => {
                    tracing::error!("Reconnection failed: {e}");
                    engine.on_session_error(SessionErrorKind::Disconnect, &e.to_string());
                }
            }
        } else {
            tracing::info!("Not reconnecting after {reason}");
        }
        self.fall_back_to_local(engine).await;
    }

    /// Retry until a verified connection is back or the attempts run out.
    async fn reconnect<E: GameEngine>(&mut self, engine: &mut E) -> Result<(), ReconnectError> {
        self.set_phase(SessionPhase::Reconnecting);
        let mut backoff = ReconnectState::new(self.config.reconnect.clone());

        while let Some(delay) = backoff.next_delay() {
            let attempt = backoff.attempts();
            tracing::info!(
                "Reconnection attempt {attempt}/{} in {delay:?}",
                self.config.reconnect.max_attempts
            );
            tokio::select! {
                _ = tokio::time::sleep(delay) => {}
                _ = wait_stopped(&mut self.stop_rx) => return Err(ReconnectError::Stopped),
            }

            match self.reconnect_once(engine).await {
                Ok(()) => {
                    tracing::info!("Reconnected after {attempt} attempt(s)");
                    backoff.reset();
                    return Ok(());
                }
                Err(e) => {
                    tracing::warn!("Reconnection attempt {attempt} failed: {e}");
                    engine.on_session_error(SessionErrorKind::Connect, &e.to_string());
                    self.drop_connection().await;
                    self.pending_loss = None;
                    if *self.stop_rx.borrow() {
                        return Err(ReconnectError::Stopped);
                    }
                    if self.state.phase != SessionPhase::Reconnecting {
                        self.set_phase(SessionPhase::Closing);
                        self.set_phase(SessionPhase::Reconnecting);
                    }
                }
            }
        }
        Err(ReconnectError::MaxAttemptsExhausted(backoff.attempts()))
    }

    /// One attempt. Leaves the session `Verified` (joiner) or `Active` (host)
    /// on success.
    async fn reconnect_once<E: GameEngine>(&mut self, engine: &mut E) -> Result<(), SessionError> {
        match self.state.role {
            Role::Joiner => {
                let addr = self.config.peer_addr;
                let report = probe_once(addr, self.config.probe_timeout).await;
                if !report.is_reachable() {
                    return Err(ReconnectError::HostUnreachable(report.status_text()).into());
                }

                self.set_phase(SessionPhase::Connecting);
                let conn = transport::connect(addr, &self.config.transport).await?;
                let (conn, handshaken) = self.handshake_as_joiner(conn, engine).await?;
                self.finish_verified(conn, handshaken, engine);
                Ok(())
            }
            Role::Host => {
                self.listen(engine)?;
                let window = Some(self.config.reconnect_accept_window);
                let (conn, handshaken) = match self.accept_peer(window, engine).await {
                    Ok(accepted) => accepted,
                    Err(e) => {
                        // Release the port so the next attempt binds afresh.
                        self.listener = None;
                        return Err(e);
                    }
                };
                self.finish_verified(conn, handshaken, engine);

                let snapshot = engine.snapshot();
                self.send_state(snapshot).await?;
                self.state_exchanged = true;
                self.set_phase(SessionPhase::Active);
                if let Some(owner) = self.state.turn.owner() {
                    engine.on_turn_changed(owner, self.state.turn.is_local_turn());
                }
                Ok(())
            }
        }
    }

    /// Tear everything down and hand the game back to local play.
    async fn fall_back_to_local<E: GameEngine>(&mut self, engine: &mut E) {
        self.close().await;
        self.fell_back = true;
        tracing::info!("Falling back to local play");
        engine.on_local_fallback();
    }
}
