//! FEN validation and side-to-move helpers.

use serde::{Deserialize, Serialize};
use shakmaty::fen::Fen;
use shakmaty::{CastlingMode, Chess, Color, EnPassantMode, Position};

use crate::NotationError;

pub const STANDARD_START_FEN: &str = "rnbqkbnr/pppppppp/8/8/8/8/PPPPPPPP/RNBQKBNR w KQkq - 0 1";

/// The two players. White moves first.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Side {
    White,
    Black,
}

impl Side {
    pub fn opposite(self) -> Self {
        match self {
            Side::White => Side::Black,
            Side::Black => Side::White,
        }
    }

    pub fn is_white(self) -> bool {
        self == Side::White
    }
}

impl From<Color> for Side {
    fn from(color: Color) -> Self {
        match color {
            Color::White => Side::White,
            Color::Black => Side::Black,
        }
    }
}

/// Parse a FEN string into a legal standard-chess position.
pub fn parse_position(fen: &str) -> Result<Chess, NotationError> {
    let invalid = |reason: String| NotationError::InvalidFen {
        fen: fen.to_string(),
        reason,
    };

    let parsed: Fen = fen.trim().parse().map_err(|e| invalid(format!("{e}")))?;
    parsed
        .into_position(CastlingMode::Standard)
        .map_err(|e| invalid(format!("{e}")))
}

/// Validate a FEN and return it in normalized form.
pub fn validate_fen(fen: &str) -> Result<String, NotationError> {
    parse_position(fen).map(|pos| fen_of(&pos))
}

pub fn fen_of(pos: &Chess) -> String {
    Fen::from_position(pos, EnPassantMode::Legal).to_string()
}

/// Read the side-to-move field without validating the rest of the FEN.
pub fn side_to_move(fen: &str) -> Option<Side> {
    match fen.split_whitespace().nth(1)? {
        "w" => Some(Side::White),
        "b" => Some(Side::Black),
        _ => None,
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_validate_start_position() {
        let fen = validate_fen(STANDARD_START_FEN).unwrap();
        assert_eq!(fen, STANDARD_START_FEN);
    }

    #[test]
    fn test_rejects_garbage() {
        assert!(matches!(
            validate_fen("not a fen"),
            Err(NotationError::InvalidFen { .. })
        ));
    }

    #[test]
    fn test_rejects_impossible_position() {
        // Both kings missing.
        let err = validate_fen("8/8/8/8/8/8/8/8 w - - 0 1").unwrap_err();
        assert!(err.to_string().contains("invalid FEN"));
    }

    #[test]
    fn test_side_to_move() {
        assert_eq!(side_to_move(STANDARD_START_FEN), Some(Side::White));
        assert_eq!(
            side_to_move("rnbqkbnr/pppppppp/8/8/4P3/8/PPPP1PPP/RNBQKBNR b KQkq - 0 1"),
            Some(Side::Black)
        );
        assert_eq!(side_to_move("8/8/8/8/8/8/8/8"), None);
    }

    #[test]
    fn test_side_opposite() {
        assert_eq!(Side::White.opposite(), Side::Black);
        assert!(!Side::Black.is_white());
    }
}
