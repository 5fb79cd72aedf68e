//! Rewrites the CLI's startup shield logo into a block-art "7".
//!
//! The logo is three lines of block elements (U+2580..U+259F) interleaved with
//! ANSI escapes and padding. Early output is held until all three lines have
//! been seen, then rewritten and released in one piece. If the banner never
//! shows up (a trust prompt, a new CLI version) the buffer is released
//! unchanged once it grows past `MAX_BUFFER_BYTES` or the caller's deadline
//! fires. After the first release everything passes straight through.

use std::sync::OnceLock;
use std::time::Duration;

use regex::{NoExpand, Regex};

pub const MAX_BUFFER_BYTES: usize = 16 * 1024;
pub const DEADLINE: Duration = Duration::from_secs(2);

const RESET: &str = "\x1b[0m";
const SEVEN_COLOR: &str = "\x1b[38;2;217;119;87m";

// Anything except a newline or another block element, lazily: absorbs SGR,
// cursor moves, OSC sequences and spaces between the logo cells.
const GAP: &str = r"[^\n\x{2580}-\x{259F}]{0,40}?";

const LINE1: &[char] = &['▐', '▛', '█', '█', '█', '▜', '▌'];
const LINE2: &[char] = &['▝', '▜', '█', '█', '█', '█', '█', '▛', '▘'];
const LINE3: &[char] = &['▘', '▘', '▝', '▝'];

struct ShieldPatterns {
    lines: [(Regex, String); 3],
}

fn shield_regex(prefix: &str, cells: &[char]) -> Regex {
    let body = cells
        .iter()
        .map(|c| regex::escape(&c.to_string()))
        .collect::<Vec<_>>()
        .join(GAP);
    Regex::new(&format!("{prefix}{body}")).expect("static shield pattern")
}

fn patterns() -> &'static ShieldPatterns {
    static PATTERNS: OnceLock<ShieldPatterns> = OnceLock::new();
    PATTERNS.get_or_init(|| ShieldPatterns {
        lines: [
            (
                shield_regex(&format!(" {GAP}"), LINE1),
                format!("{SEVEN_COLOR}▛▘▌▌▌▌  ▀▌▌{RESET}"),
            ),
            (
                shield_regex("", LINE2),
                format!("{SEVEN_COLOR}▄▌▙▌▚▘▗ █▌▌{RESET} "),
            ),
            (
                shield_regex("", LINE3),
                format!("{SEVEN_COLOR}▄▌{RESET}      "),
            ),
        ],
    })
}

fn is_block_element(c: char) -> bool {
    ('\u{2580}'..='\u{259F}').contains(&c)
}

#[derive(Debug)]
enum State {
    /// Holding early output; `dirty` is set when new block elements arrived
    /// since the last scan.
    Buffering { buf: String, dirty: bool },
    Passthrough,
}

#[derive(Debug)]
pub struct BannerFilter {
    state: State,
}

impl Default for BannerFilter {
    fn default() -> Self {
        Self {
            state: State::Buffering {
                buf: String::new(),
                dirty: false,
            },
        }
    }
}

impl BannerFilter {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn is_buffering(&self) -> bool {
        matches!(self.state, State::Buffering { .. })
    }

    /// Feed one chunk. Returns text to forward now, or `None` while the
    /// banner may still be arriving.
    pub fn push(&mut self, chunk: &str) -> Option<String> {
        let State::Buffering { buf, dirty } = &mut self.state else {
            return Some(chunk.to_string());
        };
        buf.push_str(chunk);
        *dirty |= chunk.chars().any(is_block_element);

        if *dirty {
            *dirty = false;
            let pats = patterns();
            if pats.lines.iter().all(|(re, _)| re.is_match(buf)) {
                let mut out = std::mem::take(buf);
                for (re, replacement) in &pats.lines {
                    out = re.replace(&out, NoExpand(replacement)).into_owned();
                }
                self.state = State::Passthrough;
                return Some(out);
            }
        }

        if buf.len() > MAX_BUFFER_BYTES {
            return self.flush();
        }
        None
    }

    /// Release anything held, unchanged, and stop filtering. Used on the
    /// deadline and at end of stream.
    pub fn flush(&mut self) -> Option<String> {
        match std::mem::replace(&mut self.state, State::Passthrough) {
            State::Buffering { buf, .. } if !buf.is_empty() => Some(buf),
            _ => None,
        }
    }
}
