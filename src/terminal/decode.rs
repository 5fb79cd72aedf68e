/// Incremental UTF-8 decoding for pipe and PTY reads.
///
/// A read can end in the middle of a multi-byte sequence. The incomplete tail
/// is held back and prefixed to the next read instead of being replaced with
/// U+FFFD. Genuinely invalid bytes are still replaced.
#[derive(Debug, Default)]
pub(crate) struct Utf8Carry {
    pending: Vec<u8>,
}

impl Utf8Carry {
    pub(crate) fn push(&mut self, bytes: &[u8]) -> String {
        self.pending.extend_from_slice(bytes);
        let cut = incomplete_tail_start(&self.pending);
        let text = String::from_utf8_lossy(&self.pending[..cut]).into_owned();
        self.pending.drain(..cut);
        text
    }

    /// Flush whatever is left at end of stream.
    pub(crate) fn finish(&mut self) -> String {
        let text = String::from_utf8_lossy(&self.pending).into_owned();
        self.pending.clear();
        text
    }
}

/// Index where a trailing, not-yet-complete UTF-8 sequence starts, or `len`.
fn incomplete_tail_start(bytes: &[u8]) -> usize {
    let len = bytes.len();
    for back in 1..=len.min(3) {
        let b = bytes[len - back];
        if b & 0b1100_0000 == 0b1000_0000 {
            continue;
        }
        let need = if b & 0b1110_0000 == 0b1100_0000 {
            2
        } else if b & 0b1111_0000 == 0b1110_0000 {
            3
        } else if b & 0b1111_1000 == 0b1111_0000 {
            4
        } else {
            1
        };
        return if need > back { len - back } else { len };
    }
    len
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn ascii_passes_straight_through() {
        let mut carry = Utf8Carry::default();
        assert_eq!(carry.push(b"hello"), "hello");
        assert_eq!(carry.finish(), "");
    }

    #[test]
    fn split_codepoint_is_carried_to_next_read() {
        let bytes = "a█b".as_bytes();
        let mut carry = Utf8Carry::default();
        assert_eq!(carry.push(&bytes[..2]), "a");
        assert_eq!(carry.push(&bytes[2..3]), "");
        assert_eq!(carry.push(&bytes[3..]), "█b");
    }

    #[test]
    fn invalid_bytes_are_replaced_not_held() {
        let mut carry = Utf8Carry::default();
        assert_eq!(carry.push(&[b'x', 0xFF, b'y']), "x\u{FFFD}y");
    }

    #[test]
    fn truncated_stream_flushes_lossily() {
        let mut carry = Utf8Carry::default();
        assert_eq!(carry.push(&[0xE2, 0x96]), "");
        assert_eq!(carry.finish(), "\u{FFFD}");
    }
}
