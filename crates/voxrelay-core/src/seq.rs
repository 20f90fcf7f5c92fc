//! 16-bit wraparound sequence arithmetic.
//!
//! Sequence numbers are compared in serial-number fashion (RFC 1982): `a`
//! precedes `b` when the forward distance from `a` to `b` is non-zero and
//! less than half the sequence space.

/// Half of the 16-bit sequence space.
pub const HALF_SPACE: u16 = 0x8000;

/// Forward distance from `from` to `to`, modulo 2^16.
pub fn forward_distance(from: u16, to: u16) -> u16 {
    to.wrapping_sub(from)
}

/// Whether `a` strictly precedes `b`.
pub fn seq_lt(a: u16, b: u16) -> bool {
    let d = forward_distance(a, b);
    d != 0 && d < HALF_SPACE
}

/// Whether `a` precedes or equals `b`.
pub fn seq_le(a: u16, b: u16) -> bool {
    a == b || seq_lt(a, b)
}

/// Where `seq` lies relative to the playout pointer `next`.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SeqPosition {
    /// `seq` is `offset` slots at or ahead of the pointer.
    Ahead(u16),
    /// `seq` is `offset` slots behind the pointer (already passed).
    Behind(u16),
}

/// Classify `seq` relative to the next expected sequence number.
pub fn position(next: u16, seq: u16) -> SeqPosition {
    let d = forward_distance(next, seq);
    if d < HALF_SPACE {
        SeqPosition::Ahead(d)
    } else {
        SeqPosition::Behind(next.wrapping_sub(seq))
    }
}

/// Monotonic 16-bit sequence generator for outbound streams.
#[derive(Debug, Clone, Default)]
pub struct SeqCounter {
    next: u16,
}

impl SeqCounter {
    pub fn starting_at(next: u16) -> Self {
        Self { next }
    }

    /// Return the current value and advance, wrapping at 2^16.
    pub fn next(&mut self) -> u16 {
        let seq = self.next;
        self.next = self.next.wrapping_add(1);
        seq
    }

    pub fn peek(&self) -> u16 {
        self.next
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_seq_ordering_across_wrap() {
        assert!(seq_lt(1, 2));
        assert!(seq_lt(65535, 0));
        assert!(seq_lt(65530, 5));
        assert!(!seq_lt(5, 65530));
        assert!(!seq_lt(7, 7));
        assert!(seq_le(7, 7));
    }

    #[test]
    fn test_position() {
        assert_eq!(position(10, 10), SeqPosition::Ahead(0));
        assert_eq!(position(10, 13), SeqPosition::Ahead(3));
        assert_eq!(position(10, 8), SeqPosition::Behind(2));
        assert_eq!(position(65535, 1), SeqPosition::Ahead(2));
        assert_eq!(position(1, 65535), SeqPosition::Behind(2));
    }

    #[test]
    fn test_counter_wraps() {
        let mut counter = SeqCounter::starting_at(65534);
        assert_eq!(counter.next(), 65534);
        assert_eq!(counter.next(), 65535);
        assert_eq!(counter.next(), 0);
        assert_eq!(counter.peek(), 1);
    }
}
