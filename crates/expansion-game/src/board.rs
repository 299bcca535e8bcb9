//! In-memory Expansion War board.
//!
//! Units belong to a player, to the pc or to nobody. A move either links one
//! of the mover's units to another unit, removes such a link, or updates a
//! unit's value and owner. The board knows nothing about the network; the
//! session hands it remote moves and snapshots through the engine.

use std::collections::BTreeSet;
use std::fmt;

use expansion_net::messages::CURRENT_TURN_KEY;
use expansion_net::{GameAction, GameStateSnapshot, Role, SyncError, UnitId};
use serde::{Deserialize, Serialize};

/// Value a fresh unit starts with.
const START_VALUE: i64 = 10;

/// Who holds a unit.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Owner {
    Player,
    Pc,
    Neutral,
}

impl Owner {
    pub fn from_label(label: &str) -> Option<Self> {
        match label {
            "player" => Some(Owner::Player),
            "pc" => Some(Owner::Pc),
            "neutral" => Some(Owner::Neutral),
            _ => None,
        }
    }

    pub fn label(self) -> &'static str {
        match self {
            Owner::Player => "player",
            Owner::Pc => "pc",
            Owner::Neutral => "neutral",
        }
    }
}

impl From<Role> for Owner {
    fn from(role: Role) -> Self {
        match role {
            Role::Host => Owner::Player,
            Role::Joiner => Owner::Pc,
        }
    }
}

/// One unit on the board.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Unit {
    pub id: UnitId,
    pub owner: Owner,
    pub value: i64,
    #[serde(default)]
    pub links: BTreeSet<UnitId>,
}

impl Unit {
    fn new(id: u64, owner: Owner) -> Self {
        Self {
            id: UnitId(id),
            owner,
            value: START_VALUE,
            links: BTreeSet::new(),
        }
    }
}

/// The whole game state, serialized as the network snapshot.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Board {
    pub units: Vec<Unit>,
    pub current_turn: Role,
}

impl Default for Board {
    fn default() -> Self {
        Self::new_game()
    }
}

impl Board {
    /// Opening layout: one unit per side and four neutral units, player first.
    pub fn new_game() -> Self {
        let mut units = vec![Unit::new(1, Owner::Player), Unit::new(2, Owner::Pc)];
        units.extend((3..=6).map(|id| Unit::new(id, Owner::Neutral)));
        Self {
            units,
            current_turn: Role::Host,
        }
    }

    pub fn unit(&self, id: UnitId) -> Option<&Unit> {
        self.units.iter().find(|u| u.id == id)
    }

    fn unit_mut(&mut self, id: UnitId) -> Result<&mut Unit, SyncError> {
        self.units
            .iter_mut()
            .find(|u| u.id == id)
            .ok_or(SyncError::UnknownUnit(id))
    }

    /// Check a move by `mover` without applying it.
    pub fn validate(&self, mover: Role, action: &GameAction) -> Result<(), SyncError> {
        for id in action.unit_ids() {
            if self.unit(id).is_none() {
                return Err(SyncError::UnknownUnit(id));
            }
        }
        let owned_by_mover = |id: UnitId| {
            self.unit(id)
                .is_some_and(|u| u.owner == Owner::from(mover))
        };

        match action {
            GameAction::Connect {
                source_id,
                target_id,
            } => {
                if source_id == target_id {
                    return Err(SyncError::Rejected("a unit cannot link to itself".into()));
                }
                if !owned_by_mover(*source_id) {
                    return Err(SyncError::Rejected(format!(
                        "unit {source_id} does not belong to {mover}"
                    )));
                }
                if self.is_linked(*source_id, *target_id) {
                    return Err(SyncError::Rejected(format!(
                        "{source_id} and {target_id} are already linked"
                    )));
                }
            }
            GameAction::Disconnect {
                source_id,
                target_id,
            } => {
                if !owned_by_mover(*source_id) {
                    return Err(SyncError::Rejected(format!(
                        "unit {source_id} does not belong to {mover}"
                    )));
                }
                if !self.is_linked(*source_id, *target_id) {
                    return Err(SyncError::Rejected(format!(
                        "{source_id} and {target_id} are not linked"
                    )));
                }
            }
            GameAction::UnitUpdate { owner, .. } => {
                if Owner::from_label(owner).is_none() {
                    return Err(SyncError::Rejected(format!("unknown owner {owner:?}")));
                }
            }
        }
        Ok(())
    }

    /// Validate and apply a move by `mover`.
    pub fn apply(&mut self, mover: Role, action: &GameAction) -> Result<(), SyncError> {
        self.validate(mover, action)?;
        match action {
            GameAction::Connect {
                source_id,
                target_id,
            } => {
                self.unit_mut(*source_id)?.links.insert(*target_id);
                self.unit_mut(*target_id)?.links.insert(*source_id);
            }
            GameAction::Disconnect {
                source_id,
                target_id,
            } => {
                self.unit_mut(*source_id)?.links.remove(target_id);
                self.unit_mut(*target_id)?.links.remove(source_id);
            }
            GameAction::UnitUpdate {
                unit_id,
                value,
                owner,
            } => {
                let owner = Owner::from_label(owner)
                    .ok_or_else(|| SyncError::Rejected(format!("unknown owner {owner:?}")))?;
                let unit = self.unit_mut(*unit_id)?;
                unit.value = (*value).max(0);
                unit.owner = owner;
            }
        }
        Ok(())
    }

    /// A claim of a neutral unit linked to one of `mover`'s units, as an
    /// update action. The unit keeps its value.
    pub fn claim(&self, mover: Role, id: UnitId) -> Result<GameAction, SyncError> {
        let unit = self.unit(id).ok_or(SyncError::UnknownUnit(id))?;
        if unit.owner != Owner::Neutral {
            return Err(SyncError::Rejected(format!("unit {id} is not neutral")));
        }
        let reachable = unit
            .links
            .iter()
            .any(|l| self.unit(*l).is_some_and(|u| u.owner == Owner::from(mover)));
        if !reachable {
            return Err(SyncError::Rejected(format!(
                "unit {id} is not linked to any unit of {mover}"
            )));
        }
        Ok(GameAction::UnitUpdate {
            unit_id: id,
            value: unit.value,
            owner: Owner::from(mover).label().to_string(),
        })
    }

    pub fn is_linked(&self, a: UnitId, b: UnitId) -> bool {
        self.unit(a).is_some_and(|u| u.links.contains(&b))
    }

    /// Units held by each side: (player, pc).
    pub fn score(&self) -> (usize, usize) {
        let count = |owner| self.units.iter().filter(|u| u.owner == owner).count();
        (count(Owner::Player), count(Owner::Pc))
    }

    /// The board as a network snapshot, `currentTurn` included.
    pub fn to_snapshot(&self) -> GameStateSnapshot {
        let mut map = serde_json::Map::new();
        match serde_json::to_value(&self.units) {
            Ok(units) => {
                map.insert("units".to_string(), units);
            }
            Err(e) => tracing::error!("Could not serialize units: {e}"),
        }
        map.insert(
            CURRENT_TURN_KEY.to_string(),
            serde_json::Value::String(self.current_turn.label().to_string()),
        );
        GameStateSnapshot::from(map)
    }

    pub fn from_snapshot(snapshot: &GameStateSnapshot) -> Result<Self, SyncError> {
        serde_json::from_value(snapshot.as_value().clone())
            .map_err(|e| SyncError::InvalidSnapshot(e.to_string()))
    }
}

impl fmt::Display for Board {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let (player, pc) = self.score();
        writeln!(f, "turn: {}   player {player} / pc {pc}", self.current_turn)?;
        for unit in &self.units {
            write!(f, "  {:<4} {:<8} {:>3}", unit.id.to_string(), unit.owner.label(), unit.value)?;
            if !unit.links.is_empty() {
                let links: Vec<String> = unit.links.iter().map(ToString::to_string).collect();
                write!(f, "  -> {}", links.join(" "))?;
            }
            writeln!(f)?;
        }
        Ok(())
    }
}
