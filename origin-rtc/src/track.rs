//! Publish and play track pipelines, one per SSRC.

use crate::frame::{RtcFrame, RtcFrameBuilder};
use crate::jitter::{RtcSeqJitter, RtcTsJitter};
use crate::nack::{ReceiveLog, SendBuffer};
use crate::rtcp::TransportLayerNack;
use crate::rtp::RtpPacket;
use shared::error::Result;

const RECEIVE_LOG_SIZE: u16 = 1024;
const SEND_BUFFER_SIZE: usize = 1024;
/// Skip the most recent packets when NACKing; they may be in flight.
const NACK_SKIP_LAST: u16 = 2;

/// An inbound track of a publisher session: ring buffer for loss tracking
/// and the frame builder feeding the hub.
pub struct PublishTrack {
    pub ssrc: u32,
    pub is_video: bool,
    pub nack_enabled: bool,
    receive_log: ReceiveLog,
    builder: RtcFrameBuilder,
    pub packets: u64,
}

impl PublishTrack {
    pub fn new(ssrc: u32, is_video: bool, nack_enabled: bool) -> Self {
        Self {
            ssrc,
            is_video,
            nack_enabled,
            receive_log: ReceiveLog::new(RECEIVE_LOG_SIZE).expect("receive log size"),
            builder: RtcFrameBuilder::new(),
            packets: 0,
        }
    }

    /// Feeds one unprotected RTP packet, producing any completed frames.
    pub fn on_rtp(&mut self, packet: RtpPacket) -> Result<Vec<RtcFrame>> {
        self.packets += 1;
        self.receive_log.add(packet.header.sequence_number);
        if self.is_video {
            self.builder.push_video(packet)
        } else {
            Ok(vec![self.builder.push_audio(&packet)])
        }
    }

    /// NACK for the currently missing sequences, fired by the fast timer.
    pub fn generate_nack(&mut self, sender_ssrc: u32) -> Option<TransportLayerNack> {
        if !self.nack_enabled {
            return None;
        }
        let missing = self.receive_log.missing_seq_numbers(NACK_SKIP_LAST);
        if missing.is_empty() {
            return None;
        }
        Some(TransportLayerNack {
            sender_ssrc,
            media_ssrc: self.ssrc,
            pairs: crate::rtcp::nack_pairs_from_sequences(&missing),
        })
    }
}

/// An outbound track of a play session: rewrites SSRC/PT, fuses upstream
/// clock and sequence spaces, and answers NACKs from its send buffer.
pub struct PlayTrack {
    pub ssrc: u32,
    pub payload_type: u8,
    pub is_video: bool,
    seq_jitter: RtcSeqJitter,
    ts_jitter: RtcTsJitter,
    send_buffer: SendBuffer,
    pub sent: u64,
}

impl PlayTrack {
    pub fn new(ssrc: u32, payload_type: u8, is_video: bool) -> Self {
        Self {
            ssrc,
            payload_type,
            is_video,
            seq_jitter: RtcSeqJitter::new(rand::random()),
            ts_jitter: RtcTsJitter::new(rand::random()),
            send_buffer: SendBuffer::new(SEND_BUFFER_SIZE),
            sent: 0,
        }
    }

    /// Rewrites one packet for the wire and remembers it for NACKs.
    pub fn on_outgoing(&mut self, mut packet: RtpPacket) -> RtpPacket {
        packet.header.ssrc = self.ssrc;
        packet.header.payload_type = self.payload_type;
        packet.header.sequence_number = self.seq_jitter.correct(packet.header.sequence_number);
        packet.header.timestamp = self.ts_jitter.correct(packet.header.timestamp);
        self.sent += 1;
        self.send_buffer.add(packet.clone());
        packet
    }

    /// Looks up the packets a peer NACK asks to resend.
    pub fn resend_for(&self, nack: &TransportLayerNack) -> Vec<RtpPacket> {
        nack.lost_sequences()
            .into_iter()
            .filter_map(|seq| self.send_buffer.get(seq).cloned())
            .collect()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::rtp::RtpHeader;
    use bytes::Bytes;

    fn rtp(seq: u16, ts: u32) -> RtpPacket {
        RtpPacket {
            header: RtpHeader {
                sequence_number: seq,
                timestamp: ts,
                payload_type: 96,
                ssrc: 111,
                marker: false,
                ..Default::default()
            },
            payload: Bytes::from_static(&[0x41, 1, 2]),
        }
    }

    #[test]
    fn test_publish_track_generates_nack_for_gap() {
        let mut t = PublishTrack::new(111, true, true);
        t.on_rtp(rtp(10, 0)).unwrap();
        t.on_rtp(rtp(14, 0)).unwrap();
        let nack = t.generate_nack(42).unwrap();
        assert_eq!(nack.media_ssrc, 111);
        assert_eq!(nack.sender_ssrc, 42);
        // skip_last_n=2 keeps 13 out for now.
        let lost = nack.lost_sequences();
        assert!(lost.contains(&11));
        assert!(lost.contains(&12));
        assert!(!lost.contains(&13));
    }

    #[test]
    fn test_publish_track_nack_disabled() {
        let mut t = PublishTrack::new(111, true, false);
        t.on_rtp(rtp(10, 0)).unwrap();
        t.on_rtp(rtp(20, 0)).unwrap();
        assert!(t.generate_nack(1).is_none());
    }

    #[test]
    fn test_play_track_rewrites_and_resends() {
        let mut t = PlayTrack::new(999, 102, true);
        let out1 = t.on_outgoing(rtp(100, 9000));
        let out2 = t.on_outgoing(rtp(101, 12600));
        assert_eq!(out1.header.ssrc, 999);
        assert_eq!(out1.header.payload_type, 102);
        assert_eq!(out2.header.sequence_number, out1.header.sequence_number.wrapping_add(1));
        assert_eq!(
            out2.header.timestamp.wrapping_sub(out1.header.timestamp),
            3600
        );

        let nack = TransportLayerNack {
            sender_ssrc: 0,
            media_ssrc: 999,
            pairs: vec![(out1.header.sequence_number, 0)],
        };
        let resend = t.resend_for(&nack);
        assert_eq!(resend.len(), 1);
        assert_eq!(resend[0].header.sequence_number, out1.header.sequence_number);
    }

    #[test]
    fn test_play_track_fuses_upstream_switch() {
        let mut t = PlayTrack::new(1, 102, true);
        let a = t.on_outgoing(rtp(100, 9000));
        let _ = t.on_outgoing(rtp(101, 12600));
        // New upstream with a wildly different sequence space.
        let c = t.on_outgoing(rtp(40000, 500_000_000));
        assert_eq!(
            c.header.sequence_number,
            a.header.sequence_number.wrapping_add(2)
        );
    }
}
