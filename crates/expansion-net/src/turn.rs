//! Turn-ownership state machine.
//!
//! Exactly one role may act at a time. Ownership is seeded once from the
//! host's snapshot and then changes only through explicit turn hand-offs: a
//! local submit hands the turn to the peer, an inbound `TURN_CHANGE` sets the
//! owner it names. Receiving an `ACTION` never moves the turn.

use crate::messages::{ActionId, Role, TurnChange};

/// Errors from turn bookkeeping.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum TurnError {
    /// No snapshot has seeded the owner yet.
    #[error("turn owner not known yet")]
    NotSeeded,

    /// The local role tried to act while the peer holds the turn.
    #[error("it is {owner}'s turn")]
    NotYourTurn {
        /// Current owner.
        owner: Role,
    },

    /// The hand-off repeats the last applied action id.
    #[error("turn change for action {0} already applied")]
    Duplicate(ActionId),
}

/// Tracks whose turn it is from one peer's point of view.
#[derive(Debug, Clone)]
pub struct TurnTracker {
    local_role: Role,
    owner: Option<Role>,
    last_applied: Option<ActionId>,
    next_seq: u64,
}

impl TurnTracker {
    /// Unseeded tracker for `local_role`.
    pub fn new(local_role: Role) -> Self {
        Self {
            local_role,
            owner: None,
            last_applied: None,
            next_seq: 1,
        }
    }

    pub fn local_role(&self) -> Role {
        self.local_role
    }

    /// Current owner, `None` until seeded.
    pub fn owner(&self) -> Option<Role> {
        self.owner
    }

    /// Whether the local peer may act now.
    pub fn is_local_turn(&self) -> bool {
        self.owner == Some(self.local_role)
    }

    /// Set the owner from an authoritative snapshot.
    pub fn seed(&mut self, owner: Role) {
        self.owner = Some(owner);
        self.last_applied = None;
    }

    /// Fail unless the local peer holds the turn.
    pub fn check_local_turn(&self) -> Result<(), TurnError> {
        match self.owner {
            None => Err(TurnError::NotSeeded),
            Some(owner) if owner != self.local_role => Err(TurnError::NotYourTurn { owner }),
            Some(_) => Ok(()),
        }
    }

    /// Mint the identifier for the next local action, `"<local_id>:<seq>"`.
    pub fn next_action_id(&mut self, local_id: &str) -> ActionId {
        let id = ActionId(format!("{local_id}:{}", self.next_seq));
        self.next_seq += 1;
        id
    }

    /// The message that hands the turn to the peer after local action
    /// `action_id`. Ownership does not move until [`hand_over`](Self::hand_over).
    pub fn turn_change_for(&self, action_id: ActionId) -> Result<TurnChange, TurnError> {
        self.check_local_turn()?;
        Ok(TurnChange {
            next_turn: self.local_role.peer(),
            action_id,
        })
    }

    /// Commit a hand-off built by [`turn_change_for`](Self::turn_change_for)
    /// once it has been sent.
    pub fn hand_over(&mut self, change: &TurnChange) -> Result<(), TurnError> {
        self.check_local_turn()?;
        self.owner = Some(change.next_turn);
        self.last_applied = Some(change.action_id.clone());
        Ok(())
    }

    /// Apply an inbound hand-off. Returns the new owner.
    pub fn apply_turn_change(&mut self, change: &TurnChange) -> Result<Role, TurnError> {
        if self.owner.is_none() {
            return Err(TurnError::NotSeeded);
        }
        if self.last_applied.as_ref() == Some(&change.action_id) {
            return Err(TurnError::Duplicate(change.action_id.clone()));
        }
        self.owner = Some(change.next_turn);
        self.last_applied = Some(change.action_id.clone());
        Ok(change.next_turn)
    }

    /// Forget the owner; nobody may act until the next seed.
    pub fn clear(&mut self) {
        self.owner = None;
        self.last_applied = None;
    }
}
