//! UCI line codec: structured commands out, structured events in.

use std::fmt;

/// Centipawn value assigned to "mate in 0" before the distance discount.
pub const MATE_SCORE: i32 = 10_000;

/// Longest mate distance that still scores apart from a shorter one.
const MAX_MATE_DISTANCE: i32 = 999;

/// Engine score, always relative to the side to move.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Score {
    Centipawns(i32),
    /// Mate in N moves (positive = side to move mates, negative = gets mated).
    Mate(i32),
}

impl Score {
    /// Collapse to centipawns. Shorter mates score further from zero;
    /// `mate 0` means the side to move is already mated.
    pub fn to_centipawns(self) -> i32 {
        match self {
            Score::Centipawns(cp) => cp,
            Score::Mate(m) => {
                let m = m.clamp(-MAX_MATE_DISTANCE, MAX_MATE_DISTANCE);
                if m > 0 {
                    MATE_SCORE - m * 10
                } else {
                    -MATE_SCORE - m * 10
                }
            }
        }
    }
}

/// One `info` line. Fields the engine did not send stay `None`.
#[derive(Debug, Clone, PartialEq, Default)]
pub struct InfoLine {
    pub depth: Option<u32>,
    pub seldepth: Option<u32>,
    /// 1-based candidate-line rank (absent when MultiPV is 1).
    pub multipv: Option<u32>,
    pub score: Option<Score>,
    pub nodes: Option<u64>,
    pub pv: Vec<String>,
}

impl InfoLine {
    pub fn rank(&self) -> u32 {
        self.multipv.unwrap_or(1)
    }
}

/// A parsed line of engine output.
#[derive(Debug, Clone, PartialEq)]
pub enum EngineEvent {
    Id { name: String },
    UciOk,
    ReadyOk,
    Info(InfoLine),
    /// Terminal search event. `mv` is `None` for `bestmove (none)`.
    BestMove {
        mv: Option<String>,
        ponder: Option<String>,
    },
    Other(String),
}

/// Commands the worker sends to the engine.
#[derive(Debug, Clone, PartialEq)]
pub enum Command {
    Uci,
    IsReady,
    SetOption { name: &'static str, value: String },
    NewGame,
    Position { fen: String },
    GoDepth(u32),
    GoMovetime(u64),
    Stop,
    Quit,
}

impl fmt::Display for Command {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Command::Uci => f.write_str("uci"),
            Command::IsReady => f.write_str("isready"),
            Command::SetOption { name, value } => write!(f, "setoption name {name} value {value}"),
            Command::NewGame => f.write_str("ucinewgame"),
            Command::Position { fen } => write!(f, "position fen {fen}"),
            Command::GoDepth(depth) => write!(f, "go depth {depth}"),
            Command::GoMovetime(ms) => write!(f, "go movetime {ms}"),
            Command::Stop => f.write_str("stop"),
            Command::Quit => f.write_str("quit"),
        }
    }
}

/// Parse one line of engine output.
pub fn parse_line(line: &str) -> EngineEvent {
    let line = line.trim();
    let mut parts = line.split_whitespace();

    match parts.next() {
        Some("uciok") => EngineEvent::UciOk,
        Some("readyok") => EngineEvent::ReadyOk,
        Some("info") => EngineEvent::Info(parse_info(line)),
        Some("bestmove") => {
            let mv = parts.next().filter(|m| *m != "(none)").map(String::from);
            let ponder = match parts.next() {
                Some("ponder") => parts.next().map(String::from),
                _ => None,
            };
            EngineEvent::BestMove { mv, ponder }
        }
        Some("id") if parts.next() == Some("name") => EngineEvent::Id {
            name: parts.collect::<Vec<_>>().join(" "),
        },
        _ => EngineEvent::Other(line.to_string()),
    }
}

/// Parse the fields of an `info` line.
pub fn parse_info(line: &str) -> InfoLine {
    let parts: Vec<&str> = line.split_whitespace().collect();
    let mut info = InfoLine::default();
    let mut i = 1; // skip "info"

    while i < parts.len() {
        match parts[i] {
            "depth" => {
                info.depth = parts.get(i + 1).and_then(|v| v.parse().ok());
                i += 2;
            }
            "seldepth" => {
                info.seldepth = parts.get(i + 1).and_then(|v| v.parse().ok());
                i += 2;
            }
            "multipv" => {
                info.multipv = parts.get(i + 1).and_then(|v| v.parse().ok());
                i += 2;
            }
            "nodes" => {
                info.nodes = parts.get(i + 1).and_then(|v| v.parse().ok());
                i += 2;
            }
            "score" => {
                let value = parts.get(i + 2).and_then(|v| v.parse().ok());
                info.score = match (parts.get(i + 1), value) {
                    (Some(&"cp"), Some(v)) => Some(Score::Centipawns(v)),
                    (Some(&"mate"), Some(v)) => Some(Score::Mate(v)),
                    _ => info.score,
                };
                i += 3;
            }
            "pv" => {
                i += 1;
                while i < parts.len() && !is_info_keyword(parts[i]) {
                    info.pv.push(parts[i].to_string());
                    i += 1;
                }
            }
            // Free text runs to end of line.
            "string" => break,
            _ => i += 1,
        }
    }

    info
}

fn is_info_keyword(s: &str) -> bool {
    matches!(
        s,
        "depth"
            | "seldepth"
            | "multipv"
            | "score"
            | "nodes"
            | "nps"
            | "time"
            | "pv"
            | "currmove"
            | "currmovenumber"
            | "hashfull"
            | "tbhits"
            | "bmc"
            | "string"
    )
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_parse_info_multipv() {
        let line = "info depth 20 seldepth 25 multipv 2 score cp -35 nodes 100000 nps 900 pv e7e5 g1f3";
        let info = parse_info(line);
        assert_eq!(info.depth, Some(20));
        assert_eq!(info.seldepth, Some(25));
        assert_eq!(info.rank(), 2);
        assert_eq!(info.score, Some(Score::Centipawns(-35)));
        assert_eq!(info.nodes, Some(100_000));
        assert_eq!(info.pv, vec!["e7e5", "g1f3"]);
    }

    #[test]
    fn test_parse_info_bounds_and_trailing_fields() {
        let line = "info depth 7 score cp 12 lowerbound nodes 55 pv d2d4 bmc 0.3";
        let info = parse_info(line);
        assert_eq!(info.score, Some(Score::Centipawns(12)));
        assert_eq!(info.nodes, Some(55));
        assert_eq!(info.pv, vec!["d2d4"]);
        assert_eq!(info.rank(), 1);
    }

    #[test]
    fn test_parse_info_without_score() {
        let info = parse_info("info depth 3 currmove e2e4 currmovenumber 1");
        assert_eq!(info.depth, Some(3));
        assert!(info.score.is_none());
        assert!(info.pv.is_empty());
    }

    #[test]
    fn test_parse_info_string_is_ignored() {
        let info = parse_info("info string NNUE evaluation using nn-1.nnue depth 9");
        assert_eq!(info, InfoLine::default());
    }

    #[test]
    fn test_parse_bestmove() {
        assert_eq!(
            parse_line("bestmove e2e4 ponder e7e5"),
            EngineEvent::BestMove {
                mv: Some("e2e4".into()),
                ponder: Some("e7e5".into())
            }
        );
        assert_eq!(
            parse_line("bestmove (none)"),
            EngineEvent::BestMove {
                mv: None,
                ponder: None
            }
        );
    }

    #[test]
    fn test_parse_handshake_lines() {
        assert_eq!(parse_line("uciok\n"), EngineEvent::UciOk);
        assert_eq!(parse_line("readyok"), EngineEvent::ReadyOk);
        assert_eq!(
            parse_line("id name Stockfish 17"),
            EngineEvent::Id {
                name: "Stockfish 17".into()
            }
        );
        assert!(matches!(parse_line("id author someone"), EngineEvent::Other(_)));
        assert!(matches!(parse_line("option name Hash type spin"), EngineEvent::Other(_)));
    }

    #[test]
    fn test_mate_scores() {
        assert_eq!(Score::Mate(3).to_centipawns(), 9970);
        assert_eq!(Score::Mate(-2).to_centipawns(), -9980);
        assert_eq!(Score::Mate(0).to_centipawns(), -10_000);
        assert_eq!(Score::Centipawns(-41).to_centipawns(), -41);
    }

    #[test]
    fn test_extreme_mate_distance_is_clamped() {
        let far = parse_info("info depth 1 score mate 2147483647 pv e2e4")
            .score
            .unwrap();
        assert_eq!(far.to_centipawns(), 10);

        let mated = parse_info("info depth 1 score mate -2147483648 pv e2e4")
            .score
            .unwrap();
        assert_eq!(mated.to_centipawns(), -10);
        assert!(Score::Mate(1).to_centipawns() > far.to_centipawns());
    }

    #[test]
    fn test_command_text() {
        assert_eq!(Command::GoDepth(18).to_string(), "go depth 18");
        assert_eq!(Command::GoMovetime(100).to_string(), "go movetime 100");
        assert_eq!(
            Command::SetOption {
                name: "MultiPV",
                value: "3".into()
            }
            .to_string(),
            "setoption name MultiPV value 3"
        );
        assert_eq!(
            Command::Position {
                fen: "8/8/8/8/8/8/8/K6k w - - 0 1".into()
            }
            .to_string(),
            "position fen 8/8/8/8/8/8/8/K6k w - - 0 1"
        );
    }
}
