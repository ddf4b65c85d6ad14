//! NACK support: a receive log tracking missing sequences on the publish
//! path, and a send buffer answering peer NACKs on the play path.

use crate::rtp::RtpPacket;
use std::collections::HashMap;

const UINT16_SIZE_HALF: u16 = 1 << 15;

/// Tracks received sequence numbers in a circular bitmap and reports the
/// missing ones for NACK generation.
pub struct ReceiveLog {
    packets: Vec<u64>,
    size: u16,
    end: u16,
    started: bool,
    last_consecutive: u16,
}

impl ReceiveLog {
    /// Size must be a power of two in [64, 32768].
    pub fn new(size: u16) -> Option<ReceiveLog> {
        let is_valid = (6..=15).any(|i| size == 1 << i);
        if !is_valid {
            return None;
        }
        Some(ReceiveLog {
            packets: vec![0u64; (size / 64) as usize],
            size,
            end: 0,
            started: false,
            last_consecutive: 0,
        })
    }

    pub fn add(&mut self, seq: u16) {
        if !self.started {
            self.set_received(seq);
            self.end = seq;
            self.started = true;
            self.last_consecutive = seq;
            return;
        }

        let diff = seq.wrapping_sub(self.end);
        match diff {
            0 => return, // duplicate
            d if d < UINT16_SIZE_HALF => {
                // Ahead of the highest seen: clear the skipped range.
                let mut i = self.end.wrapping_add(1);
                while i != seq {
                    self.del_received(i);
                    i = i.wrapping_add(1);
                }
                self.end = seq;

                if self.last_consecutive.wrapping_add(1) == seq {
                    self.last_consecutive = seq;
                } else if seq.wrapping_sub(self.last_consecutive) > self.size {
                    self.last_consecutive = seq.wrapping_sub(self.size);
                    self.fix_last_consecutive();
                }
            }
            _ => {
                // Out-of-order arrival filling a gap.
                if self.last_consecutive.wrapping_add(1) == seq {
                    self.last_consecutive = seq;
                    self.fix_last_consecutive();
                }
            }
        }
        self.set_received(seq);
    }

    pub fn get(&self, seq: u16) -> bool {
        let diff = self.end.wrapping_sub(seq);
        if diff >= UINT16_SIZE_HALF || diff >= self.size {
            return false;
        }
        self.get_received(seq)
    }

    /// Missing sequences between the last consecutive and `end -
    /// skip_last_n`; recent packets are skipped because they may simply be
    /// in flight.
    pub fn missing_seq_numbers(&self, skip_last_n: u16) -> Vec<u16> {
        let until = self.end.wrapping_sub(skip_last_n);
        if until.wrapping_sub(self.last_consecutive) >= UINT16_SIZE_HALF {
            return Vec::new();
        }
        let mut missing = Vec::new();
        let mut i = self.last_consecutive.wrapping_add(1);
        while i != until.wrapping_add(1) {
            if !self.get_received(i) {
                missing.push(i);
            }
            i = i.wrapping_add(1);
        }
        missing
    }

    fn set_received(&mut self, seq: u16) {
        let pos = seq % self.size;
        self.packets[(pos / 64) as usize] |= 1 << (pos % 64);
    }

    fn del_received(&mut self, seq: u16) {
        let pos = seq % self.size;
        self.packets[(pos / 64) as usize] &= !(1u64 << (pos % 64));
    }

    fn get_received(&self, seq: u16) -> bool {
        let pos = seq % self.size;
        (self.packets[(pos / 64) as usize] & (1 << (pos % 64))) != 0
    }

    fn fix_last_consecutive(&mut self) {
        let mut i = self.last_consecutive.wrapping_add(1);
        while i != self.end.wrapping_add(1) && self.get_received(i) {
            i = i.wrapping_add(1);
        }
        self.last_consecutive = i.wrapping_sub(1);
    }
}

/// Recent outbound packets by sequence number, to answer NACKs.
pub struct SendBuffer {
    packets: HashMap<u16, RtpPacket>,
    order: std::collections::VecDeque<u16>,
    capacity: usize,
}

impl SendBuffer {
    pub fn new(capacity: usize) -> SendBuffer {
        SendBuffer {
            packets: HashMap::with_capacity(capacity),
            order: std::collections::VecDeque::with_capacity(capacity),
            capacity,
        }
    }

    pub fn add(&mut self, packet: RtpPacket) {
        let seq = packet.header.sequence_number;
        if self.packets.insert(seq, packet).is_none() {
            self.order.push_back(seq);
        }
        while self.order.len() > self.capacity {
            if let Some(old) = self.order.pop_front() {
                self.packets.remove(&old);
            }
        }
    }

    pub fn get(&self, seq: u16) -> Option<&RtpPacket> {
        self.packets.get(&seq)
    }

    pub fn len(&self) -> usize {
        self.order.len()
    }

    pub fn is_empty(&self) -> bool {
        self.order.is_empty()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_invalid_sizes() {
        assert!(ReceiveLog::new(5).is_none());
        assert!(ReceiveLog::new(100).is_none());
        assert!(ReceiveLog::new(64).is_some());
        assert!(ReceiveLog::new(32768).is_some());
    }

    #[test]
    fn test_gap_reported_missing() {
        let mut log = ReceiveLog::new(128).unwrap();
        log.add(0);
        log.add(5);
        assert_eq!(log.missing_seq_numbers(0), vec![1, 2, 3, 4]);
        // Recent packets can be skipped.
        assert_eq!(log.missing_seq_numbers(2), vec![1, 2, 3]);
    }

    #[test]
    fn test_out_of_order_fills_gap() {
        let mut log = ReceiveLog::new(128).unwrap();
        log.add(0);
        log.add(3);
        assert_eq!(log.missing_seq_numbers(0), vec![1, 2]);
        log.add(1);
        assert_eq!(log.missing_seq_numbers(0), vec![2]);
        log.add(2);
        assert!(log.missing_seq_numbers(0).is_empty());
    }

    #[test]
    fn test_wraparound_grid() {
        for start in [0u16, 1, 127, 128, 511, 32767, 32768, 65534, 65535] {
            let mut log = ReceiveLog::new(128).unwrap();
            log.add(start);
            for i in 1..=127u16 {
                log.add(start.wrapping_add(i));
            }
            assert!(log.missing_seq_numbers(0).is_empty());
            log.add(start.wrapping_add(130));
            assert_eq!(
                log.missing_seq_numbers(0),
                vec![start.wrapping_add(128), start.wrapping_add(129)]
            );
        }
    }

    #[test]
    fn test_send_buffer_evicts_oldest() {
        let mut buf = SendBuffer::new(4);
        for seq in 0..6u16 {
            buf.add(RtpPacket {
                header: crate::rtp::RtpHeader {
                    sequence_number: seq,
                    ..Default::default()
                },
                ..Default::default()
            });
        }
        assert_eq!(buf.len(), 4);
        assert!(buf.get(0).is_none());
        assert!(buf.get(1).is_none());
        assert!(buf.get(5).is_some());
    }
}
