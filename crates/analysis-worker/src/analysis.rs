//! Move analysis and classification: pure functions only
//! (no session, pool or engine dependencies).

use chess_core::Side;
use serde::{Deserialize, Serialize};

use crate::uci::Score;

/// Classification thresholds (centipawn loss), checked from most severe down.
pub const THRESHOLD_BLUNDER: u32 = 300;
pub const THRESHOLD_MISTAKE: u32 = 100;
pub const THRESHOLD_INACCURACY: u32 = 50;
/// Losses at or below this still count as the engine's move.
pub const THRESHOLD_BEST: u32 = 10;

/// Evaluation in centipawns from White's point of view.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Default, Serialize, Deserialize)]
pub struct Evaluation(i32);

impl Evaluation {
    pub fn from_white_centipawns(cp: i32) -> Self {
        Self(cp)
    }

    /// Convert an engine score (relative to the side to move) into a
    /// White-relative evaluation.
    pub fn from_engine(score: Score, side_to_move: Side) -> Self {
        let cp = score.to_centipawns();
        match side_to_move {
            Side::White => Self(cp),
            Side::Black => Self(cp.saturating_neg()),
        }
    }

    pub fn white_centipawns(self) -> i32 {
        self.0
    }

    /// Centipawns from `side`'s point of view.
    pub fn for_side(self, side: Side) -> i32 {
        match side {
            Side::White => self.0,
            Side::Black => self.0.saturating_neg(),
        }
    }

    pub fn pawns(self) -> f64 {
        f64::from(self.0) / 100.0
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum MoveCategory {
    Best,
    Good,
    Inaccuracy,
    Mistake,
    Blunder,
}

/// One classified ply.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct MoveRecord {
    /// 1-based ply number.
    pub move_number: usize,
    pub side: Side,
    pub move_notation: String,
    pub move_uci: String,
    /// White-relative evaluation after the move.
    pub evaluation_pawns: f64,
    pub best_move_notation: Option<String>,
    pub centipawn_loss: u32,
    pub category: MoveCategory,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SideSummary {
    pub moves: u32,
    pub average_centipawn_loss: f64,
    pub accuracy: f64,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct GameAnalysis {
    pub moves: Vec<MoveRecord>,
    pub blunders: Vec<MoveRecord>,
    pub mistakes: Vec<MoveRecord>,
    pub inaccuracies: Vec<MoveRecord>,
    pub average_centipawn_loss: f64,
    /// `100 - averageCentipawnLoss`, clamped to [0, 100].
    pub game_quality: f64,
    pub white: SideSummary,
    pub black: SideSummary,
}

impl GameAnalysis {
    /// Derive every aggregate from the ordered move records.
    pub fn from_records(moves: Vec<MoveRecord>) -> Self {
        let pick = |category: MoveCategory| -> Vec<MoveRecord> {
            moves
                .iter()
                .filter(|m| m.category == category)
                .cloned()
                .collect()
        };
        let blunders = pick(MoveCategory::Blunder);
        let mistakes = pick(MoveCategory::Mistake);
        let inaccuracies = pick(MoveCategory::Inaccuracy);

        let losses: Vec<u32> = moves.iter().map(|m| m.centipawn_loss).collect();
        let average_centipawn_loss = average_centipawn_loss(&losses);

        let white = side_summary(&moves, Side::White);
        let black = side_summary(&moves, Side::Black);

        Self {
            game_quality: game_quality(average_centipawn_loss),
            average_centipawn_loss,
            blunders,
            mistakes,
            inaccuracies,
            white,
            black,
            moves,
        }
    }
}

pub fn calculate_cp_loss(best_cp: i32, actual_cp: i32) -> u32 {
    best_cp.saturating_sub(actual_cp).max(0).unsigned_abs()
}

pub fn classify_move(cp_loss: u32) -> MoveCategory {
    if cp_loss >= THRESHOLD_BLUNDER {
        MoveCategory::Blunder
    } else if cp_loss >= THRESHOLD_MISTAKE {
        MoveCategory::Mistake
    } else if cp_loss >= THRESHOLD_INACCURACY {
        MoveCategory::Inaccuracy
    } else if cp_loss <= THRESHOLD_BEST {
        MoveCategory::Best
    } else {
        MoveCategory::Good
    }
}

pub fn average_centipawn_loss(losses: &[u32]) -> f64 {
    if losses.is_empty() {
        return 0.0;
    }
    let total: u64 = losses.iter().map(|&l| u64::from(l)).sum();
    total as f64 / losses.len() as f64
}

pub fn game_quality(average_cp_loss: f64) -> f64 {
    (100.0 - average_cp_loss).clamp(0.0, 100.0)
}

pub fn calculate_accuracy(average_cp_loss: f64) -> f64 {
    let accuracy = 100.0 * (1.0 / (1.0 + average_cp_loss / 100.0)).sqrt();
    accuracy.clamp(0.0, 100.0)
}

fn side_summary(moves: &[MoveRecord], side: Side) -> SideSummary {
    let losses: Vec<u32> = moves
        .iter()
        .filter(|m| m.side == side)
        .map(|m| m.centipawn_loss)
        .collect();
    let average_centipawn_loss = average_centipawn_loss(&losses);

    SideSummary {
        moves: losses.len() as u32,
        average_centipawn_loss,
        accuracy: calculate_accuracy(average_centipawn_loss),
    }
}
