//! The board wired to the network session.
//!
//! [`ConsoleEngine`] applies remote moves to the [`Board`], tracks whether the
//! local player may act, and prints what the session reports. In local mode
//! both sides play on this console and every move passes the turn.

use expansion_net::{
    DisconnectReason, GameAction, GameEngine, GameStateSnapshot, PeerInfo, Role,
    SessionErrorKind, SyncError,
};

use crate::board::Board;
use crate::command::MoveCommand;

pub struct ConsoleEngine {
    pub board: Board,
    local_role: Role,
    networked: bool,
    input_blocked: bool,
}

impl ConsoleEngine {
    /// A fresh game. In network mode input starts blocked until the session
    /// assigns the first turn.
    pub fn new(local_role: Role, networked: bool) -> Self {
        Self {
            board: Board::new_game(),
            local_role,
            networked,
            input_blocked: networked,
        }
    }

    pub fn is_networked(&self) -> bool {
        self.networked
    }

    /// The side the next local move is made for.
    pub fn mover(&self) -> Role {
        if self.networked {
            self.local_role
        } else {
            self.board.current_turn
        }
    }

    /// Whether the console may make a move right now.
    pub fn can_act(&self) -> bool {
        !self.networked || (!self.input_blocked && self.board.current_turn == self.local_role)
    }

    /// Turn a move command into a checked action for the current mover.
    pub fn prepare_move(&self, mv: MoveCommand) -> Result<GameAction, SyncError> {
        let mover = self.mover();
        let action = match mv {
            MoveCommand::Claim(id) => self.board.claim(mover, id)?,
            link => link.link_action().ok_or_else(|| {
                SyncError::Rejected("move has no link action".to_string())
            })?,
        };
        self.board.validate(mover, &action)?;
        Ok(action)
    }

    /// Apply a move the session already delivered (or a local-mode move) and
    /// pass the turn.
    pub fn commit_local_move(&mut self, action: &GameAction) -> Result<(), SyncError> {
        let mover = self.mover();
        self.board.apply(mover, action)?;
        self.board.current_turn = mover.peer();
        if self.networked {
            self.input_blocked = true;
        }
        Ok(())
    }

    /// Continue without a peer.
    pub fn go_local(&mut self) {
        self.networked = false;
        self.input_blocked = false;
    }
}

impl GameEngine for ConsoleEngine {
    fn on_remote_action(&mut self, action: &GameAction) -> Result<(), SyncError> {
        self.board.apply(self.local_role.peer(), action)?;
        println!("{} played {action:?}", self.local_role.peer());
        Ok(())
    }

    fn on_turn_changed(&mut self, owner: Role, local_can_act: bool) {
        self.board.current_turn = owner;
        self.input_blocked = !local_can_act;
        if local_can_act {
            println!("Your turn.");
        } else {
            println!("Waiting for {owner}...");
        }
    }

    fn on_state_received(&mut self, snapshot: &GameStateSnapshot) -> Result<(), SyncError> {
        self.board = Board::from_snapshot(snapshot)?;
        println!("Board received from the host:\n{}", self.board);
        Ok(())
    }

    fn on_session_error(&mut self, kind: SessionErrorKind, message: &str) {
        println!("[{kind}] {message}");
    }

    fn on_disconnected(&mut self, reason: &DisconnectReason) {
        println!("Connection lost ({reason}).");
    }

    fn on_input_suspended(&mut self) {
        self.input_blocked = true;
        println!("Input suspended while the connection is restored.");
    }

    fn on_local_fallback(&mut self) {
        self.go_local();
        println!("Network play ended. Continuing locally, {} to move.", self.board.current_turn);
    }

    fn on_peer_connected(&mut self, peer: &PeerInfo) {
        println!("{} joined from {}:{}.", peer.peer_id, peer.address, peer.port);
    }

    fn on_chat(&mut self, from: Role, text: &str) {
        println!("<{from}> {text}");
    }

    fn snapshot(&self) -> GameStateSnapshot {
        self.board.to_snapshot()
    }
}
