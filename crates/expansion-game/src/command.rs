//! Console commands.

use expansion_net::{GameAction, UnitId};

/// One line of player input.
#[derive(Debug, Clone, PartialEq)]
pub enum Command {
    /// A move: link, unlink or claim.
    Move(MoveCommand),
    Chat(String),
    Board,
    /// Host: push the current board to the joiner.
    Resync,
    /// Leave network mode and keep playing locally.
    Leave,
    Help,
    Quit,
}

/// A move before it is turned into a [`GameAction`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum MoveCommand {
    Connect(UnitId, UnitId),
    Disconnect(UnitId, UnitId),
    Claim(UnitId),
}

impl MoveCommand {
    /// The wire action for link moves. Claims need the board and are built
    /// by [`Board::claim`](crate::board::Board::claim).
    pub fn link_action(self) -> Option<GameAction> {
        match self {
            MoveCommand::Connect(source_id, target_id) => Some(GameAction::Connect {
                source_id,
                target_id,
            }),
            MoveCommand::Disconnect(source_id, target_id) => Some(GameAction::Disconnect {
                source_id,
                target_id,
            }),
            MoveCommand::Claim(_) => None,
        }
    }
}

pub const HELP: &str = "\
commands:
  connect <a> <b>     link your unit a to unit b
  disconnect <a> <b>  remove the link between your unit a and unit b
  claim <u>           take a neutral unit linked to one of yours
  chat <text>         message the other player
  board               show the board
  resync              (host) send the board to the joiner again
  leave               stop network play and continue locally
  quit                exit";

#[derive(Debug, PartialEq, Eq, thiserror::Error)]
pub enum ParseError {
    #[error("empty input")]
    Empty,
    #[error("unknown command {0:?}, type `help`")]
    Unknown(String),
    #[error("usage: {0}")]
    Usage(&'static str),
}

fn unit(arg: Option<&str>, usage: &'static str) -> Result<UnitId, ParseError> {
    let arg = arg.ok_or(ParseError::Usage(usage))?;
    arg.trim_start_matches('#')
        .parse()
        .map(UnitId)
        .map_err(|_| ParseError::Usage(usage))
}

impl std::str::FromStr for Command {
    type Err = ParseError;

    fn from_str(line: &str) -> Result<Self, Self::Err> {
        let line = line.trim();
        let (word, rest) = line.split_once(char::is_whitespace).unwrap_or((line, ""));
        let rest = rest.trim();
        let mut args = rest.split_whitespace();

        let command = match word.to_ascii_lowercase().as_str() {
            "" => return Err(ParseError::Empty),
            "connect" | "c" => {
                const USAGE: &str = "connect <a> <b>";
                Command::Move(MoveCommand::Connect(
                    unit(args.next(), USAGE)?,
                    unit(args.next(), USAGE)?,
                ))
            }
            "disconnect" | "d" => {
                const USAGE: &str = "disconnect <a> <b>";
                Command::Move(MoveCommand::Disconnect(
                    unit(args.next(), USAGE)?,
                    unit(args.next(), USAGE)?,
                ))
            }
            "claim" => Command::Move(MoveCommand::Claim(unit(args.next(), "claim <u>")?)),
            "chat" | "say" => {
                if rest.is_empty() {
                    return Err(ParseError::Usage("chat <text>"));
                }
                Command::Chat(rest.to_string())
            }
            "board" | "b" => Command::Board,
            "resync" => Command::Resync,
            "leave" => Command::Leave,
            "help" | "?" => Command::Help,
            "quit" | "exit" | "q" => Command::Quit,
            other => return Err(ParseError::Unknown(other.to_string())),
        };
        Ok(command)
    }
}
