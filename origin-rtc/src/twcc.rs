//! Transport-wide congestion control: records arrival times by TWCC
//! sequence and emits feedback packets on the fast timer.

use bytes::{BufMut, Bytes, BytesMut};
use std::collections::BTreeMap;
use std::time::Instant;

/// 2-bit status symbols.
const SYMBOL_NOT_RECEIVED: u16 = 0;
const SYMBOL_SMALL_DELTA: u16 = 1;
const SYMBOL_LARGE_DELTA: u16 = 2;

/// Records transport-wide sequence arrivals and builds feedback bodies.
pub struct TwccRecorder {
    media_ssrc: u32,
    sender_ssrc: u32,
    epoch: Instant,
    arrivals: BTreeMap<u16, Instant>,
    next_base: Option<u16>,
    fb_count: u8,
}

impl TwccRecorder {
    pub fn new(sender_ssrc: u32, media_ssrc: u32, epoch: Instant) -> Self {
        Self {
            media_ssrc,
            sender_ssrc,
            epoch,
            arrivals: BTreeMap::new(),
            next_base: None,
            fb_count: 0,
        }
    }

    pub fn record(&mut self, twcc_seq: u16, arrival: Instant) {
        self.arrivals.entry(twcc_seq).or_insert(arrival);
        if self.next_base.is_none() {
            self.next_base = Some(twcc_seq);
        }
    }

    pub fn pending(&self) -> usize {
        self.arrivals.len()
    }

    /// Drains the recorded window into one feedback body, or None when
    /// there is nothing to report.
    pub fn build_feedback(&mut self) -> Option<Bytes> {
        let base_seq = self.next_base.take()?;
        if self.arrivals.is_empty() {
            return None;
        }
        let last_seq = *self.arrivals.keys().next_back()?;
        let count = last_seq.wrapping_sub(base_seq) as u32 + 1;
        // A torn window (reordering across wrap) re-anchors next time.
        if count > 0x7fff {
            self.arrivals.clear();
            return None;
        }

        let first_arrival = *self.arrivals.values().next()?;
        let reference_64ms =
            (first_arrival.duration_since(self.epoch).as_millis() / 64) as u32 & 0xff_ffff;
        let reference = self.epoch + std::time::Duration::from_millis(reference_64ms as u64 * 64);

        // Symbols and deltas in 250us ticks from the reference time.
        let mut symbols = Vec::with_capacity(count as usize);
        let mut deltas: Vec<i32> = Vec::new();
        let mut prev = reference;
        for i in 0..count {
            let seq = base_seq.wrapping_add(i as u16);
            match self.arrivals.get(&seq) {
                None => symbols.push(SYMBOL_NOT_RECEIVED),
                Some(&at) => {
                    let delta_us = if at >= prev {
                        at.duration_since(prev).as_micros() as i64
                    } else {
                        -(prev.duration_since(at).as_micros() as i64)
                    };
                    let ticks = (delta_us / 250) as i32;
                    if (0..=255).contains(&ticks) {
                        symbols.push(SYMBOL_SMALL_DELTA);
                    } else {
                        symbols.push(SYMBOL_LARGE_DELTA);
                    }
                    deltas.push(ticks);
                    prev = at;
                }
            }
        }

        let mut body = BytesMut::new();
        body.put_u32(self.sender_ssrc);
        body.put_u32(self.media_ssrc);
        body.put_u16(base_seq);
        body.put_u16(count as u16);
        body.put_u8((reference_64ms >> 16) as u8);
        body.put_u8((reference_64ms >> 8) as u8);
        body.put_u8(reference_64ms as u8);
        body.put_u8(self.fb_count);
        self.fb_count = self.fb_count.wrapping_add(1);

        // Two-bit status vector chunks, 7 symbols each.
        for chunk in symbols.chunks(7) {
            let mut word: u16 = 0x8000 | 0x4000;
            for (i, &s) in chunk.iter().enumerate() {
                word |= s << (12 - 2 * i);
            }
            body.put_u16(word);
        }
        for d in &deltas {
            if (0..=255).contains(d) {
                body.put_u8(*d as u8);
            } else {
                body.put_i16(((*d).clamp(i16::MIN as i32, i16::MAX as i32)) as i16);
            }
        }

        self.arrivals.clear();
        Some(body.freeze())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::Duration;

    #[test]
    fn test_feedback_shape() {
        let epoch = Instant::now();
        let mut rec = TwccRecorder::new(1, 2, epoch);
        rec.record(100, epoch + Duration::from_millis(100));
        rec.record(101, epoch + Duration::from_millis(105));
        rec.record(103, epoch + Duration::from_millis(110)); // 102 lost

        let body = rec.build_feedback().unwrap();
        let base = u16::from_be_bytes([body[8], body[9]]);
        let count = u16::from_be_bytes([body[10], body[11]]);
        assert_eq!(base, 100);
        assert_eq!(count, 4);
        // fb count starts at zero and increments.
        assert_eq!(body[15], 0);
        assert!(rec.build_feedback().is_none());
        rec.record(104, epoch + Duration::from_millis(120));
        let body2 = rec.build_feedback().unwrap();
        assert_eq!(body2[15], 1);
    }

    #[test]
    fn test_empty_recorder_builds_nothing() {
        let mut rec = TwccRecorder::new(1, 2, Instant::now());
        assert!(rec.build_feedback().is_none());
    }

    #[test]
    fn test_duplicate_seq_keeps_first_arrival() {
        let epoch = Instant::now();
        let mut rec = TwccRecorder::new(1, 2, epoch);
        rec.record(5, epoch + Duration::from_millis(10));
        rec.record(5, epoch + Duration::from_millis(99));
        assert_eq!(rec.pending(), 1);
    }
}
