//! Incremental parser for sentinel-framed command output.
//!
//! Each command's output on a stream is wrapped as
//! `__START_<id>__ ... __END_<id>_<status>__`. The parser consumes the stream
//! chunk by chunk and only keeps what it still needs: the body of the frame
//! currently open, or, between frames, a tail short enough to hold the start of
//! a marker that was cut off by a read boundary. Nothing is rescanned from the
//! beginning.

const START_PREFIX: &str = "__START_";
const END_PREFIX: &str = "__END_";
const MARKER_SUFFIX: &str = "__";
/// Correlation ids are short alphanumeric tokens; longer runs are not markers.
const MAX_ID_LEN: usize = 64;
/// `$?` is at most three digits; anything longer is not a marker.
const MAX_STATUS_LEN: usize = 10;

#[derive(Clone, Debug, PartialEq, Eq)]
pub(crate) struct Frame {
    pub id: String,
    pub body: String,
    pub exit_code: i32,
}

#[derive(Debug, PartialEq, Eq)]
enum Token<T> {
    /// The buffer ends inside the candidate marker.
    NeedMore,
    /// Not a marker after all.
    Invalid,
    /// Marker value and the number of bytes it occupies after the prefix.
    Found(T, usize),
}

#[derive(Debug, Default)]
pub(crate) struct FrameParser {
    buf: String,
    /// Everything before this offset has been scanned.
    cursor: usize,
    /// Id and body offset of the frame whose end marker has not arrived yet.
    open: Option<(String, usize)>,
}

impl FrameParser {
    pub(crate) fn feed(&mut self, text: &str) {
        self.buf.push_str(text);
    }

    /// Bytes currently held.
    #[cfg(test)]
    pub(crate) fn buffered(&self) -> usize {
        self.buf.len()
    }

    /// Look for a one-off sentinel (the readiness probe). On a hit, everything
    /// through the sentinel is consumed; on a miss only a tail that might hold
    /// its first half is kept.
    pub(crate) fn take_sentinel(&mut self, sentinel: &str) -> bool {
        let from = floor_boundary(&self.buf, self.cursor);
        if let Some(rel) = self.buf[from..].find(sentinel) {
            self.buf.drain(..from + rel + sentinel.len());
            self.cursor = 0;
            return true;
        }
        let keep = floor_boundary(&self.buf, self.buf.len().saturating_sub(sentinel.len()));
        self.buf.drain(..keep);
        self.cursor = 0;
        false
    }

    /// Parse as far as the buffered text allows and return completed frames in
    /// stream order.
    ///
    /// A start marker only opens a frame when `expected` accepts its id; any
    /// other `__START_<id>__` is treated as plain output and skipped.
    pub(crate) fn frames(&mut self, expected: impl Fn(&str) -> bool) -> Vec<Frame> {
        let mut done = Vec::new();
        loop {
            let from = floor_boundary(&self.buf, self.cursor);
            match self.open.take() {
                None => {
                    let Some(rel) = self.buf[from..].find(START_PREFIX) else {
                        self.cursor = self.buf.len().saturating_sub(START_PREFIX.len()).max(from);
                        break;
                    };
                    let at = from + rel;
                    let after = at + START_PREFIX.len();
                    match parse_start(&self.buf[after..]) {
                        Token::NeedMore => {
                            self.cursor = at;
                            break;
                        }
                        Token::Invalid => self.cursor = after,
                        Token::Found(id, len) => {
                            self.cursor = after + len;
                            if expected(&id) {
                                self.open = Some((id, after + len));
                            }
                        }
                    }
                }
                Some((id, body_start)) => {
                    let prefix = format!("{END_PREFIX}{id}_");
                    let Some(rel) = self.buf[from..].find(&prefix) else {
                        self.cursor = self
                            .buf
                            .len()
                            .saturating_sub(prefix.len())
                            .max(from);
                        self.open = Some((id, body_start));
                        break;
                    };
                    let at = from + rel;
                    let after = at + prefix.len();
                    match parse_status(&self.buf[after..]) {
                        Token::NeedMore => {
                            self.cursor = at;
                            self.open = Some((id, body_start));
                            break;
                        }
                        Token::Invalid => {
                            self.cursor = after;
                            self.open = Some((id, body_start));
                        }
                        Token::Found(exit_code, len) => {
                            done.push(Frame {
                                body: self.buf[body_start..at].trim().to_string(),
                                id,
                                exit_code,
                            });
                            self.cursor = after + len;
                        }
                    }
                }
            }
        }
        self.discard_consumed();
        done
    }

    /// Drop scanned bytes that no frame needs anymore.
    fn discard_consumed(&mut self) {
        let keep_from = match &self.open {
            Some((_, body_start)) => *body_start,
            None => self.cursor,
        };
        let keep_from = floor_boundary(&self.buf, keep_from.min(self.buf.len()));
        if keep_from == 0 {
            return;
        }
        self.buf.drain(..keep_from);
        self.cursor -= keep_from.min(self.cursor);
        if let Some((_, body_start)) = &mut self.open {
            *body_start -= keep_from;
        }
    }
}

fn floor_boundary(s: &str, mut i: usize) -> usize {
    i = i.min(s.len());
    while !s.is_char_boundary(i) {
        i -= 1;
    }
    i
}

/// `<id>__` following the start prefix.
fn parse_start(rest: &str) -> Token<String> {
    let id_len = rest
        .bytes()
        .take_while(|b| b.is_ascii_alphanumeric())
        .count();
    if id_len > MAX_ID_LEN {
        return Token::Invalid;
    }
    if id_len == rest.len() {
        return Token::NeedMore;
    }
    if id_len == 0 {
        return Token::Invalid;
    }
    match suffix(&rest[id_len..]) {
        Token::Found((), n) => Token::Found(rest[..id_len].to_string(), id_len + n),
        Token::NeedMore => Token::NeedMore,
        Token::Invalid => Token::Invalid,
    }
}

/// `<digits>__` following `__END_<id>_`.
fn parse_status(rest: &str) -> Token<i32> {
    let digits = rest.bytes().take_while(|b| b.is_ascii_digit()).count();
    if digits > MAX_STATUS_LEN {
        return Token::Invalid;
    }
    if digits == rest.len() {
        return Token::NeedMore;
    }
    if digits == 0 {
        return Token::Invalid;
    }
    let Ok(code) = rest[..digits].parse::<i32>() else {
        return Token::Invalid;
    };
    match suffix(&rest[digits..]) {
        Token::Found((), n) => Token::Found(code, digits + n),
        Token::NeedMore => Token::NeedMore,
        Token::Invalid => Token::Invalid,
    }
}

fn suffix(rest: &str) -> Token<()> {
    if rest.starts_with(MARKER_SUFFIX) {
        Token::Found((), MARKER_SUFFIX.len())
    } else if MARKER_SUFFIX.starts_with(rest) {
        Token::NeedMore
    } else {
        Token::Invalid
    }
}
