//! PGN move-text extraction, for stored games that only carry a PGN.

use std::sync::LazyLock;

use regex::Regex;

static HEADER_RE: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"\[[^\]]*\]").expect("static regex"));
static COMMENT_RE: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"\{[^}]*\}").expect("static regex"));
static SAN_RE: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(r"[KQRBN]?[a-h]?[1-8]?x?[a-h][1-8](?:=[QRBN])?[+#]?|O-O-O|O-O")
        .expect("static regex")
});

/// Pull the mainline SAN moves out of a PGN, ignoring headers, comments
/// and side variations.
pub fn extract_moves(pgn: &str) -> Vec<String> {
    let text = HEADER_RE.replace_all(pgn, "");
    let text = COMMENT_RE.replace_all(&text, "");
    let text = strip_variations(&text);

    SAN_RE
        .find_iter(&text)
        .map(|m| m.as_str().to_string())
        .collect()
}

/// Drop parenthesized side variations, which may nest.
fn strip_variations(text: &str) -> String {
    let mut depth = 0usize;
    text.chars()
        .filter(|&c| match c {
            '(' => {
                depth += 1;
                false
            }
            ')' => {
                depth = depth.saturating_sub(1);
                false
            }
            _ => depth == 0,
        })
        .collect()
}
