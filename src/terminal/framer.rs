//! Line reassembly: arbitrary byte fragments in, complete normalized lines out.
//!
//! Accepted terminators are LF, CR+LF, LF+CR and CR+LF+CR. Devices on the bench
//! mix these freely, sometimes within one boot log. The trailing segment of every
//! feed is held back unless the combined text ends on a terminator, so a
//! terminator split across two reads coalesces naturally. When a read ends on
//! a complete terminator, a CR opening the next read is the tail of a split
//! `\n\r` or `\r\n\r` and is discarded.

#![allow(missing_docs)]

/// Terminator variants, longest first so a greedy scan never splits `\r\n\r`.
const TERMINATORS: [&str; 4] = ["\r\n\r", "\r\n", "\n\r", "\n"];

/// Per-channel line reassembler.
#[derive(Debug, Default)]
pub struct LineReassembler {
    /// Incomplete trailing text from the previous feed.
    carry: String,
    /// Trailing bytes of an unfinished UTF-8 sequence.
    partial_utf8: Vec<u8>,
    /// The previous non-empty feed ended on a terminator.
    at_line_start: bool,
}

impl LineReassembler {
    pub fn new() -> Self {
        Self::default()
    }

    /// Feed a text fragment; returns every line completed by it.
    pub fn feed(&mut self, chunk: &str) -> Vec<String> {
        if chunk.is_empty() {
            return Vec::new();
        }
        let chunk = match chunk.strip_prefix('\r') {
            Some(rest) if self.at_line_start && self.carry.is_empty() => rest,
            _ => chunk,
        };
        let mut combined = std::mem::take(&mut self.carry);
        combined.push_str(chunk);

        let complete_tail = ends_with_terminator(&combined);
        self.at_line_start = complete_tail;
        let mut segments = split_terminated(&combined);

        if !complete_tail {
            if let Some(last) = segments.pop() {
                self.carry = last.to_string();
            }
        }

        segments
            .into_iter()
            .filter(|segment| !segment.is_empty())
            .map(normalize_line)
            .filter(|line| !line.is_empty())
            .collect()
    }

    /// Feed raw bytes from a transport.
    ///
    /// UTF-8 sequences split across reads are held until complete. Invalid bytes
    /// decode to U+FFFD rather than dropping the frame.
    pub fn feed_bytes(&mut self, bytes: &[u8]) -> Vec<String> {
        let mut pending = std::mem::take(&mut self.partial_utf8);
        pending.extend_from_slice(bytes);

        let mut text = String::with_capacity(pending.len());
        let mut rest: &[u8] = &pending;
        loop {
            match std::str::from_utf8(rest) {
                Ok(valid) => {
                    text.push_str(valid);
                    break;
                }
                Err(err) => {
                    let (valid, after) = rest.split_at(err.valid_up_to());
                    text.push_str(&String::from_utf8_lossy(valid));
                    match err.error_len() {
                        Some(bad) => {
                            text.push(char::REPLACEMENT_CHARACTER);
                            rest = &after[bad..];
                        }
                        None => {
                            self.partial_utf8 = after.to_vec();
                            break;
                        }
                    }
                }
            }
        }

        self.feed(&text)
    }

    /// Text held back waiting for a terminator.
    pub fn pending(&self) -> &str {
        &self.carry
    }

    /// End of stream: emit whatever is held back as a final line.
    pub fn flush_pending(&mut self) -> Option<String> {
        self.partial_utf8.clear();
        let carry = std::mem::take(&mut self.carry);
        let line = normalize_line(&carry);
        (!line.is_empty()).then_some(line)
    }

    pub fn reset(&mut self) {
        self.carry.clear();
        self.partial_utf8.clear();
        self.at_line_start = false;
    }
}

fn ends_with_terminator(text: &str) -> bool {
    text.ends_with('\n') || text.ends_with("\n\r")
}

/// Split on every terminator variant, longest match first at each position.
fn split_terminated(text: &str) -> Vec<&str> {
    let mut segments = Vec::new();
    let mut start = 0;
    let mut idx = 0;
    let bytes = text.as_bytes();

    while idx < bytes.len() {
        if bytes[idx] == b'\r' || bytes[idx] == b'\n' {
            let matched = TERMINATORS
                .iter()
                .find(|term| text[idx..].starts_with(*term));
            if let Some(term) = matched {
                segments.push(&text[start..idx]);
                idx += term.len();
                start = idx;
                continue;
            }
        }
        idx += 1;
    }
    segments.push(&text[start..]);
    segments
}

/// Tabs become two spaces, then leading whitespace (including a stray CR) goes.
fn normalize_line(segment: &str) -> String {
    let expanded = segment.replace('\t', "  ");
    let trimmed = expanded.strip_prefix('\r').unwrap_or(&expanded);
    trimmed.trim_start().to_string()
}

#[cfg(test)]
mod tests {
    use super::*;
    use proptest::prelude::*;

    #[test]
    fn splits_every_terminator_variant() {
        let mut r = LineReassembler::new();
        let lines = r.feed("one\ntwo\r\nthree\n\rfour\r\n\rfive\n");
        assert_eq!(lines, vec!["one", "two", "three", "four", "five"]);
        assert_eq!(r.pending(), "");
    }

    #[test]
    fn incomplete_tail_is_carried() {
        let mut r = LineReassembler::new();
        assert_eq!(r.feed("U-Boot 20"), Vec::<String>::new());
        assert_eq!(r.pending(), "U-Boot 20");
        assert_eq!(r.feed("23.04\r\nDRAM"), vec!["U-Boot 2023.04"]);
        assert_eq!(r.pending(), "DRAM");
    }

    #[test]
    fn cr_and_lf_split_across_feeds_do_not_emit_empty_line() {
        let mut r = LineReassembler::new();
        assert!(r.feed("MMCSD boot\r").is_empty());
        assert_eq!(r.feed("\nnext\r\n"), vec!["MMCSD boot", "next"]);
    }

    #[test]
    fn lfcr_split_across_feeds_coalesces() {
        let mut r = LineReassembler::new();
        assert_eq!(r.feed("alpha\n"), vec!["alpha"]);
        assert_eq!(r.feed("\rbeta\n\r"), vec!["beta"]);
    }

    #[test]
    fn terminator_tail_cr_in_next_read_is_not_carried() {
        let mut r = LineReassembler::new();
        assert_eq!(r.feed("0 a0( a (\r\nAa( 00 A0(Aa\r\n"), vec!["0 a0( a (", "Aa( 00 A0(Aa"]);
        assert!(r.feed("\r").is_empty());
        assert_eq!(r.pending(), "");

        let mut r = LineReassembler::new();
        assert_eq!(r.feed("alpha\n"), vec!["alpha"]);
        assert!(r.feed("\r").is_empty());
        assert_eq!(r.pending(), "");
        assert_eq!(r.feed("beta\n"), vec!["beta"]);
    }

    #[test]
    fn normalization_expands_tabs_and_trims_leading_space() {
        let mut r = LineReassembler::new();
        let lines = r.feed("  \tADC0 AIN6\tvoltage: 1225mV\r\n");
        assert_eq!(lines, vec!["ADC0 AIN6  voltage: 1225mV"]);
    }

    #[test]
    fn blank_segments_are_dropped() {
        let mut r = LineReassembler::new();
        assert_eq!(r.feed("\r\n\r\n   \r\nx\n\n"), vec!["x"]);
    }

    #[test]
    fn utf8_sequence_split_across_reads_is_preserved() {
        let mut r = LineReassembler::new();
        let text = "temp 25°C\n".as_bytes();
        let split = text.iter().position(|&b| b == 0xC2).unwrap() + 1;
        assert!(r.feed_bytes(&text[..split]).is_empty());
        assert_eq!(r.feed_bytes(&text[split..]), vec!["temp 25°C"]);
    }

    #[test]
    fn invalid_bytes_become_replacement_characters() {
        let mut r = LineReassembler::new();
        let lines = r.feed_bytes(b"ok\xFF\xFEdone\n");
        assert_eq!(lines, vec!["ok\u{FFFD}\u{FFFD}done"]);
    }

    #[test]
    fn flush_pending_emits_unterminated_tail() {
        let mut r = LineReassembler::new();
        assert!(r.feed("Hit any key to stop autoboot").is_empty());
        assert_eq!(
            r.flush_pending().as_deref(),
            Some("Hit any key to stop autoboot")
        );
        assert_eq!(r.flush_pending(), None);
    }

    fn well_delimited_stream() -> impl Strategy<Value = String> {
        let line = "[a-zA-Z0-9 :()!.-]{1,24}";
        let term = prop::sample::select(vec!["\n", "\r\n", "\n\r", "\r\n\r"]);
        prop::collection::vec((line, term), 1..20).prop_map(|parts| {
            parts
                .into_iter()
                .map(|(l, t)| format!("{l}{t}"))
                .collect::<String>()
        })
    }

    proptest! {
        #![proptest_config(ProptestConfig::with_cases(200))]

        #[test]
        fn reassembly_is_fragmentation_invariant(
            stream in well_delimited_stream(),
            cuts in prop::collection::vec(any::<prop::sample::Index>(), 0..12),
        ) {
            let mut whole = LineReassembler::new();
            let expected = whole.feed(&stream);

            let bytes = stream.as_bytes();
            let mut points: Vec<usize> = cuts.iter().map(|c| c.index(bytes.len() + 1)).collect();
            points.sort_unstable();
            points.dedup();

            let mut fragmented = LineReassembler::new();
            let mut got = Vec::new();
            let mut prev = 0;
            for p in points.into_iter().chain(std::iter::once(bytes.len())) {
                got.extend(fragmented.feed_bytes(&bytes[prev..p]));
                prev = p;
            }

            prop_assert_eq!(got, expected);
            prop_assert_eq!(fragmented.pending(), "");
        }
    }
}
