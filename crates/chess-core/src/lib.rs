//! Chess notation helpers shared by the analysis worker.
//!
//! Nothing in here evaluates positions. It only validates position
//! descriptors and replays recorded move lists so every ply can be handed
//! to an external engine as a standalone FEN.

pub mod fen;
pub mod pgn;
pub mod replay;

use thiserror::Error;

pub use fen::{fen_of, parse_position, side_to_move, validate_fen, Side, STANDARD_START_FEN};
pub use replay::{replay_moves, san_line, Ply};

#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum NotationError {
    #[error("invalid FEN '{fen}': {reason}")]
    InvalidFen { fen: String, reason: String },

    #[error("illegal or unrecognized move '{notation}' at ply {ply}")]
    IllegalMove { ply: usize, notation: String },
}
