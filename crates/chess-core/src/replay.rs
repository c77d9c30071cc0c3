//! Replay a recorded move list into standalone per-ply positions.

use serde::Serialize;
use shakmaty::san::SanPlus;
use shakmaty::uci::UciMove;
use shakmaty::{CastlingMode, Chess, Move, Position};

use crate::fen::{fen_of, parse_position, Side};
use crate::NotationError;

/// One half-move of a replayed game.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct Ply {
    /// 1-based ply index.
    pub number: usize,
    /// The move exactly as it was supplied.
    pub notation: String,
    /// Normalized SAN of the played move, with check suffix.
    pub san: String,
    pub uci: String,
    pub mover: Side,
    pub fen_before: String,
    pub fen_after: String,
}

/// Replay `moves` (SAN or UCI) from `start_fen`, or the standard starting
/// position when none is given. Fails on the first move that is not legal.
pub fn replay_moves(start_fen: Option<&str>, moves: &[String]) -> Result<Vec<Ply>, NotationError> {
    let mut pos = match start_fen {
        Some(fen) => parse_position(fen)?,
        None => Chess::default(),
    };

    let mut plies = Vec::with_capacity(moves.len());
    for (i, notation) in moves.iter().enumerate() {
        let number = i + 1;
        let mv = resolve_move(&pos, notation).ok_or_else(|| NotationError::IllegalMove {
            ply: number,
            notation: notation.clone(),
        })?;

        let fen_before = fen_of(&pos);
        let mover = Side::from(pos.turn());
        let uci = mv.to_uci(CastlingMode::Standard).to_string();

        let san = SanPlus::from_move_and_play_unchecked(&mut pos, mv).to_string();

        plies.push(Ply {
            number,
            notation: notation.trim().to_string(),
            san,
            uci,
            mover,
            fen_before,
            fen_after: fen_of(&pos),
        });
    }

    Ok(plies)
}

/// Render an engine line (UCI moves from `fen`) as SAN. Stops at the first
/// move that is not legal in the running position.
pub fn san_line(fen: &str, uci_moves: &[String]) -> Result<Vec<String>, NotationError> {
    let mut pos = parse_position(fen)?;
    let mut line = Vec::with_capacity(uci_moves.len());
    for token in uci_moves {
        let Some(mv) = find_uci(&pos, token.trim()) else {
            break;
        };
        line.push(SanPlus::from_move_and_play_unchecked(&mut pos, mv).to_string());
    }
    Ok(line)
}

fn resolve_move(pos: &Chess, notation: &str) -> Option<Move> {
    let token = notation.trim();
    if token.is_empty() {
        return None;
    }

    if let Ok(san) = token.parse::<SanPlus>() {
        if let Ok(mv) = san.san.to_move(pos) {
            return Some(mv);
        }
    }

    find_uci(pos, token)
}

fn find_uci(pos: &Chess, token: &str) -> Option<Move> {
    let uci: UciMove = token.parse().ok()?;
    uci.to_move(pos).ok()
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::fen::STANDARD_START_FEN;

    fn moves(list: &[&str]) -> Vec<String> {
        list.iter().map(|s| s.to_string()).collect()
    }

    #[test]
    fn test_replay_san() {
        let plies = replay_moves(None, &moves(&["e4", "e5", "Nf3"])).unwrap();
        assert_eq!(plies.len(), 3);
        assert_eq!(plies[0].uci, "e2e4");
        assert_eq!(plies[0].mover, Side::White);
        assert_eq!(plies[0].fen_before, STANDARD_START_FEN);
        assert_eq!(plies[1].mover, Side::Black);
        assert_eq!(plies[1].fen_before, plies[0].fen_after);
        assert_eq!(plies[2].uci, "g1f3");
        assert_eq!(plies[2].number, 3);
    }

    #[test]
    fn test_replay_uci_and_mixed() {
        let plies = replay_moves(None, &moves(&["e2e4", "c5", "g1f3"])).unwrap();
        assert_eq!(plies[1].uci, "c7c5");
        assert_eq!(plies[2].notation, "g1f3");
        assert_eq!(plies[2].san, "Nf3");
    }

    #[test]
    fn test_replay_check_suffix() {
        let plies = replay_moves(None, &moves(&["f3", "e5", "g4", "Qh4#"])).unwrap();
        assert_eq!(plies[3].uci, "d8h4");
        assert_eq!(plies[3].san, "Qh4#");
    }

    #[test]
    fn test_san_line() {
        let line = san_line(STANDARD_START_FEN, &moves(&["e2e4", "e7e5", "g1f3"])).unwrap();
        assert_eq!(line, vec!["e4", "e5", "Nf3"]);

        let truncated = san_line(STANDARD_START_FEN, &moves(&["e2e4", "e2e4"])).unwrap();
        assert_eq!(truncated, vec!["e4"]);
    }

    #[test]
    fn test_illegal_move_reports_ply() {
        let err = replay_moves(None, &moves(&["e4", "e4"])).unwrap_err();
        assert_eq!(
            err,
            NotationError::IllegalMove {
                ply: 2,
                notation: "e4".to_string()
            }
        );
    }

    #[test]
    fn test_custom_start() {
        let fen = "4k3/8/8/8/8/8/4P3/4K3 b - - 0 1";
        let plies = replay_moves(Some(fen), &moves(&["Kd7"])).unwrap();
        assert_eq!(plies[0].mover, Side::Black);
        assert_eq!(plies[0].uci, "e8d7");
    }

    #[test]
    fn test_empty_game() {
        assert!(replay_moves(None, &[]).unwrap().is_empty());
    }
}
