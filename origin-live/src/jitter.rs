//! Time-jitter detection and correction, to keep delivered timestamps
//! monotonic per consumer.

use crate::message::SharedMessage;

/// Milliseconds of delta considered sane between adjacent packets.
const MAX_JITTER_MS: i64 = 250;
/// Fallback delta when the measured one is out of range.
const DEFAULT_FRAME_TIME_MS: i64 = 10;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum JitterAlgorithm {
    /// Rewrite timestamps so playback is continuous across source restarts.
    #[default]
    Full,
    /// Only shift the stream so it starts at zero.
    Zero,
    /// Leave timestamps untouched.
    Off,
}

impl JitterAlgorithm {
    pub fn parse(s: &str) -> JitterAlgorithm {
        match s {
            "zero" => JitterAlgorithm::Zero,
            "off" => JitterAlgorithm::Off,
            _ => JitterAlgorithm::Full,
        }
    }
}

#[derive(Debug, Default)]
pub struct RtmpJitter {
    last_pkt_time: i64,
    last_pkt_correct_time: i64,
    zero_base: Option<i64>,
}

impl RtmpJitter {
    pub fn new() -> Self {
        Self::default()
    }

    /// The current client time: the last corrected packet time.
    pub fn get_time(&self) -> i64 {
        self.last_pkt_correct_time
    }

    /// Corrects the message timestamp in place per the algorithm.
    pub fn correct(&mut self, msg: &mut SharedMessage, algorithm: JitterAlgorithm) {
        match algorithm {
            JitterAlgorithm::Off => {}
            JitterAlgorithm::Zero => {
                let base = *self.zero_base.get_or_insert(msg.header.timestamp);
                msg.header.timestamp -= base;
            }
            JitterAlgorithm::Full => {
                if !msg.is_av() {
                    msg.header.timestamp = 0;
                    return;
                }
                let time = msg.header.timestamp;
                let mut delta = time - self.last_pkt_time;
                if !(-MAX_JITTER_MS..=MAX_JITTER_MS).contains(&delta) {
                    delta = DEFAULT_FRAME_TIME_MS;
                }
                self.last_pkt_correct_time = (self.last_pkt_correct_time + delta).max(0);
                msg.header.timestamp = self.last_pkt_correct_time;
                self.last_pkt_time = time;
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use bytes::Bytes;

    fn video(ts: i64) -> SharedMessage {
        SharedMessage::video(ts, Bytes::from_static(&[0x27, 0x01]))
    }

    #[test]
    fn test_full_passes_smooth_stream() {
        let mut jitter = RtmpJitter::new();
        let mut last = 0;
        for ts in [0i64, 40, 80, 120] {
            let mut msg = video(ts);
            jitter.correct(&mut msg, JitterAlgorithm::Full);
            last = msg.header.timestamp;
        }
        assert_eq!(last, 120);
    }

    #[test]
    fn test_full_bridges_backward_jump() {
        let mut jitter = RtmpJitter::new();
        for ts in [0i64, 40, 80] {
            let mut msg = video(ts);
            jitter.correct(&mut msg, JitterAlgorithm::Full);
        }
        // The source restarted at zero: delta is out of range, so the
        // corrected clock advances by the default frame time.
        let mut msg = video(0);
        jitter.correct(&mut msg, JitterAlgorithm::Full);
        assert_eq!(msg.header.timestamp, 80 + DEFAULT_FRAME_TIME_MS);
        assert_eq!(jitter.get_time(), 90);
    }

    #[test]
    fn test_full_zeroes_non_av() {
        let mut jitter = RtmpJitter::new();
        let mut msg = SharedMessage::amf0_data(Bytes::from_static(b"x"));
        msg.header.timestamp = 1234;
        jitter.correct(&mut msg, JitterAlgorithm::Full);
        assert_eq!(msg.header.timestamp, 0);
    }

    #[test]
    fn test_zero_shifts_to_origin() {
        let mut jitter = RtmpJitter::new();
        let mut msg = video(5000);
        jitter.correct(&mut msg, JitterAlgorithm::Zero);
        assert_eq!(msg.header.timestamp, 0);
        let mut msg = video(5040);
        jitter.correct(&mut msg, JitterAlgorithm::Zero);
        assert_eq!(msg.header.timestamp, 40);
    }

    #[test]
    fn test_off_is_identity() {
        let mut jitter = RtmpJitter::new();
        let mut msg = video(987_654);
        jitter.correct(&mut msg, JitterAlgorithm::Off);
        assert_eq!(msg.header.timestamp, 987_654);
    }
}
