//! Generic RTP rebaser: lets a play session fuse multiple upstream streams
//! without clock or sequence discontinuity.

/// Wrapping value a jitter corrector can rebase.
pub trait JitterValue: Copy + PartialEq {
    fn wrapping_add(self, other: Self) -> Self;
    fn wrapping_sub(self, other: Self) -> Self;
    /// Wrap-aware absolute distance.
    fn distance(a: Self, b: Self) -> u64;
}

impl JitterValue for u16 {
    fn wrapping_add(self, other: Self) -> Self {
        u16::wrapping_add(self, other)
    }

    fn wrapping_sub(self, other: Self) -> Self {
        u16::wrapping_sub(self, other)
    }

    fn distance(a: Self, b: Self) -> u64 {
        let forward = a.wrapping_sub(b);
        let backward = b.wrapping_sub(a);
        forward.min(backward) as u64
    }
}

impl JitterValue for u32 {
    fn wrapping_add(self, other: Self) -> Self {
        u32::wrapping_add(self, other)
    }

    fn wrapping_sub(self, other: Self) -> Self {
        u32::wrapping_sub(self, other)
    }

    fn distance(a: Self, b: Self) -> u64 {
        let forward = a.wrapping_sub(b);
        let backward = b.wrapping_sub(a);
        forward.min(backward) as u64
    }
}

/// Rebases a wrapping counter onto a continuous output clock. While inputs
/// move smoothly the output is `base + (input - first_input)`; a jump past
/// the threshold rebases so the output never steps backward.
pub struct RtcJitter<V: JitterValue> {
    threshold: u64,
    /// Output advance applied on rebase: 1 for sequences, 0 for timestamps.
    advance: V,
    init: bool,
    pkt_base: V,
    pkt_last: V,
    correct_base: V,
    correct_last: V,
}

impl<V: JitterValue> RtcJitter<V> {
    pub fn new(base: V, threshold: u64, advance: V) -> Self {
        Self {
            threshold,
            advance,
            init: false,
            pkt_base: base,
            pkt_last: base,
            correct_base: base,
            correct_last: base,
        }
    }

    pub fn last(&self) -> V {
        self.correct_last
    }

    pub fn correct(&mut self, value: V) -> V {
        if !self.init {
            self.init = true;
            self.pkt_base = value;
            self.pkt_last = value;
            self.correct_last = self.correct_base;
            return self.correct_base;
        }
        if V::distance(value, self.pkt_last) > self.threshold {
            // Rebase: the stream jumped (new upstream, seek, restart).
            self.correct_base = self.correct_last.wrapping_add(self.advance);
            self.pkt_base = value;
        }
        self.pkt_last = value;
        self.correct_last = self.correct_base.wrapping_add(value.wrapping_sub(self.pkt_base));
        self.correct_last
    }
}

/// Sequence corrector: u16, threshold ~1e3, advances by one on rebase.
pub struct RtcSeqJitter(RtcJitter<u16>);

impl RtcSeqJitter {
    pub fn new(base: u16) -> Self {
        Self(RtcJitter::new(base, 1000, 1))
    }

    pub fn correct(&mut self, seq: u16) -> u16 {
        self.0.correct(seq)
    }

    pub fn last(&self) -> u16 {
        self.0.last()
    }
}

/// Timestamp corrector: u32, threshold ~1e6 ticks, resumes at the base on
/// rebase.
pub struct RtcTsJitter(RtcJitter<u32>);

impl RtcTsJitter {
    pub fn new(base: u32) -> Self {
        Self(RtcJitter::new(base, 1_000_000, 0))
    }

    pub fn correct(&mut self, ts: u32) -> u32 {
        self.0.correct(ts)
    }

    pub fn last(&self) -> u32 {
        self.0.last()
    }
}
