//! Ring buffer for terminal output with sequence-based replay.
//!
//! Terminals produce byte streams; the resume protocol hands out per-line
//! sequence numbers, so the ring stores completed lines and carries the
//! partial trailing line across appends. A client that cached `seq` from a
//! heartbeat can ask for everything after it; if the ring has already
//! dropped that point, `since` signals overflow and the caller falls back
//! to a full snapshot.

use std::collections::VecDeque;

/// Result of an incremental replay request.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Replay {
    /// Lines with sequence strictly greater than the requested one.
    Delta(Vec<String>),
    /// The requested sequence has been evicted; callers must fall back to
    /// `snapshot()`.
    Overflow,
}

/// Bounded FIFO of output lines with monotone sequence numbers.
///
/// Invariant: `current_seq - oldest_seq <= capacity` whenever the buffer
/// is non-empty; lines retained have sequences `oldest_seq..=current_seq`.
#[derive(Debug)]
pub struct RingBuffer {
    lines: VecDeque<String>,
    capacity: usize,
    /// Sequence of the most recently completed line; 0 before any line.
    current_seq: u64,
    /// Sequence of the oldest retained line.
    oldest_seq: u64,
    /// Partial trailing line carried until its newline arrives.
    partial: String,
}

impl RingBuffer {
    pub fn new(capacity: usize) -> Self {
        Self {
            lines: VecDeque::with_capacity(capacity.min(4096)),
            capacity: capacity.max(1),
            current_seq: 0,
            oldest_seq: 1,
            partial: String::new(),
        }
    }

    /// Append raw output. Bytes are split on `\n`; each completed line is
    /// assigned the next sequence number. A partial trailing line is
    /// coalesced with the next append.
    pub fn append(&mut self, data: &[u8]) {
        let text = String::from_utf8_lossy(data);
        for ch in text.chars() {
            if ch == '\n' {
                let mut line = std::mem::take(&mut self.partial);
                if line.ends_with('\r') {
                    line.pop();
                }
                self.push_line(line);
            } else {
                self.partial.push(ch);
            }
        }
    }

    /// Seed completed lines directly, used when rebuilding a session from
    /// a holder's replay.
    pub fn append_lines<I: IntoIterator<Item = String>>(&mut self, lines: I) {
        for line in lines {
            self.push_line(line);
        }
    }

    fn push_line(&mut self, line: String) {
        self.current_seq += 1;
        self.lines.push_back(line);
        if self.lines.len() > self.capacity {
            self.lines.pop_front();
            self.oldest_seq += 1;
        }
    }

    /// Sequence of the newest completed line.
    pub fn current_seq(&self) -> u64 {
        self.current_seq
    }

    /// Sequence of the oldest retained line.
    pub fn oldest_seq(&self) -> u64 {
        self.oldest_seq
    }

    pub fn len(&self) -> usize {
        self.lines.len()
    }

    pub fn is_empty(&self) -> bool {
        self.lines.is_empty()
    }

    /// All retained lines, oldest first.
    pub fn snapshot(&self) -> Vec<String> {
        self.lines.iter().cloned().collect()
    }

    /// Lines with sequence strictly greater than `seq`.
    pub fn since(&self, seq: u64) -> Replay {
        if seq >= self.current_seq {
            return Replay::Delta(Vec::new());
        }
        if seq < self.oldest_seq {
            return Replay::Overflow;
        }
        let skip = (seq + 1 - self.oldest_seq) as usize;
        Replay::Delta(self.lines.iter().skip(skip).cloned().collect())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn filled(capacity: usize, lines: usize) -> RingBuffer {
        let mut ring = RingBuffer::new(capacity);
        for i in 1..=lines {
            ring.append(format!("line-{}\n", i).as_bytes());
        }
        ring
    }

    #[test]
    fn appends_split_on_newlines() {
        let mut ring = RingBuffer::new(100);
        ring.append(b"alpha\nbeta\n");
        assert_eq!(ring.snapshot(), vec!["alpha", "beta"]);
        assert_eq!(ring.current_seq(), 2);
    }

    #[test]
    fn partial_lines_coalesce_across_appends() {
        let mut ring = RingBuffer::new(100);
        ring.append(b"hel");
        assert_eq!(ring.current_seq(), 0);
        assert!(ring.snapshot().is_empty());
        ring.append(b"lo\nwor");
        assert_eq!(ring.snapshot(), vec!["hello"]);
        ring.append(b"ld\n");
        assert_eq!(ring.snapshot(), vec!["hello", "world"]);
    }

    #[test]
    fn crlf_line_endings_are_normalized() {
        let mut ring = RingBuffer::new(100);
        ring.append(b"prompt\r\nnext\r\n");
        assert_eq!(ring.snapshot(), vec!["prompt", "next"]);
    }

    #[test]
    fn capacity_bound_holds_under_eviction() {
        let ring = filled(5, 1000);
        assert_eq!(ring.len(), 5);
        assert_eq!(ring.current_seq(), 1000);
        assert_eq!(ring.oldest_seq(), 996);
        assert!(ring.current_seq() - ring.oldest_seq() <= 5);
        assert_eq!(ring.snapshot().first().unwrap(), "line-996");
    }

    #[test]
    fn since_returns_exact_suffix() {
        let ring = filled(100, 10);
        // every in-range seq returns exactly the lines after it
        for seq in ring.oldest_seq()..=ring.current_seq() {
            match ring.since(seq) {
                Replay::Delta(lines) => {
                    let expected: Vec<String> =
                        (seq + 1..=10).map(|i| format!("line-{}", i)).collect();
                    assert_eq!(lines, expected, "seq {}", seq);
                }
                Replay::Overflow => panic!("unexpected overflow at {}", seq),
            }
        }
    }

    #[test]
    fn since_current_is_empty() {
        let ring = filled(100, 10);
        assert_eq!(ring.since(10), Replay::Delta(Vec::new()));
        assert_eq!(ring.since(999), Replay::Delta(Vec::new()));
    }

    #[test]
    fn since_before_oldest_overflows() {
        let ring = filled(5, 1000);
        assert_eq!(ring.since(3), Replay::Overflow);
        assert_eq!(ring.since(994), Replay::Overflow);
        assert!(matches!(ring.since(996), Replay::Delta(_)));
    }

    #[test]
    fn empty_ring_since_zero_is_empty() {
        let ring = RingBuffer::new(10);
        assert_eq!(ring.since(0), Replay::Delta(Vec::new()));
    }

    #[test]
    fn seeded_lines_get_sequences() {
        let mut ring = RingBuffer::new(10);
        ring.append_lines(["a".to_string(), "b".to_string()]);
        assert_eq!(ring.current_seq(), 2);
        assert_eq!(ring.snapshot(), vec!["a", "b"]);
    }
}
