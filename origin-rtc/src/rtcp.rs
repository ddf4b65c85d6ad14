//! The RTCP subset the engine speaks: receiver reports, NACK, PLI and TWCC
//! feedback.

use bytes::{Buf, BufMut, Bytes, BytesMut};
use shared::error::{Error, Result};

pub const PT_SENDER_REPORT: u8 = 200;
pub const PT_RECEIVER_REPORT: u8 = 201;
pub const PT_RTP_FEEDBACK: u8 = 205;
pub const PT_PAYLOAD_FEEDBACK: u8 = 206;

pub const FMT_NACK: u8 = 1;
pub const FMT_TWCC: u8 = 15;
pub const FMT_PLI: u8 = 1;

/// One decoded RTCP packet; compound packets parse into a Vec of these.
#[derive(Debug, Clone, PartialEq)]
pub enum RtcpPacket {
    SenderReport {
        ssrc: u32,
        ntp: u64,
        rtp_time: u32,
        packet_count: u32,
        octet_count: u32,
    },
    ReceiverReport {
        ssrc: u32,
    },
    Nack(TransportLayerNack),
    Pli {
        sender_ssrc: u32,
        media_ssrc: u32,
    },
    Twcc(Bytes),
    Other {
        payload_type: u8,
    },
}

/// Transport-layer NACK: (pid, blp) pairs covering 17 sequences each.
#[derive(Debug, Clone, PartialEq)]
pub struct TransportLayerNack {
    pub sender_ssrc: u32,
    pub media_ssrc: u32,
    pub pairs: Vec<(u16, u16)>,
}

impl TransportLayerNack {
    /// Every sequence number this NACK asks for.
    pub fn lost_sequences(&self) -> Vec<u16> {
        let mut out = Vec::new();
        for &(pid, blp) in &self.pairs {
            out.push(pid);
            for i in 0..16 {
                if blp & (1 << i) != 0 {
                    out.push(pid.wrapping_add(i + 1));
                }
            }
        }
        out
    }
}

/// Packs missing sequences into (pid, blp) pairs.
pub fn nack_pairs_from_sequences(seqs: &[u16]) -> Vec<(u16, u16)> {
    let mut pairs: Vec<(u16, u16)> = Vec::new();
    for &seq in seqs {
        if let Some(last) = pairs.last_mut() {
            let distance = seq.wrapping_sub(last.0);
            if distance > 0 && distance <= 16 {
                last.1 |= 1 << (distance - 1);
                continue;
            }
        }
        pairs.push((seq, 0));
    }
    pairs
}

/// Parses a compound RTCP buffer.
pub fn parse_compound(data: &[u8]) -> Result<Vec<RtcpPacket>> {
    let mut buf = Bytes::copy_from_slice(data);
    let mut out = Vec::new();
    while buf.remaining() >= 4 {
        let b0 = buf[0];
        if (b0 >> 6) & 0x03 != 2 {
            return Err(Error::ErrRtcpPacket);
        }
        let fmt = b0 & 0x1f;
        let pt = buf[1];
        let words = u16::from_be_bytes([buf[2], buf[3]]) as usize;
        let total = (words + 1) * 4;
        if buf.remaining() < total {
            return Err(Error::ErrRtcpPacket);
        }
        let mut pkt = buf.split_to(total);
        pkt.advance(4);
        out.push(parse_one(fmt, pt, pkt)?);
    }
    Ok(out)
}

fn parse_one(fmt: u8, pt: u8, mut pkt: Bytes) -> Result<RtcpPacket> {
    match (pt, fmt) {
        (PT_SENDER_REPORT, _) => {
            if pkt.remaining() < 24 {
                return Err(Error::ErrRtcpPacket);
            }
            Ok(RtcpPacket::SenderReport {
                ssrc: pkt.get_u32(),
                ntp: pkt.get_u64(),
                rtp_time: pkt.get_u32(),
                packet_count: pkt.get_u32(),
                octet_count: pkt.get_u32(),
            })
        }
        (PT_RECEIVER_REPORT, _) => {
            if pkt.remaining() < 4 {
                return Err(Error::ErrRtcpPacket);
            }
            Ok(RtcpPacket::ReceiverReport {
                ssrc: pkt.get_u32(),
            })
        }
        (PT_RTP_FEEDBACK, FMT_NACK) => {
            if pkt.remaining() < 8 {
                return Err(Error::ErrRtcpPacket);
            }
            let sender_ssrc = pkt.get_u32();
            let media_ssrc = pkt.get_u32();
            let mut pairs = Vec::new();
            while pkt.remaining() >= 4 {
                pairs.push((pkt.get_u16(), pkt.get_u16()));
            }
            Ok(RtcpPacket::Nack(TransportLayerNack {
                sender_ssrc,
                media_ssrc,
                pairs,
            }))
        }
        (PT_RTP_FEEDBACK, FMT_TWCC) => Ok(RtcpPacket::Twcc(pkt)),
        (PT_PAYLOAD_FEEDBACK, FMT_PLI) => {
            if pkt.remaining() < 8 {
                return Err(Error::ErrRtcpPacket);
            }
            Ok(RtcpPacket::Pli {
                sender_ssrc: pkt.get_u32(),
                media_ssrc: pkt.get_u32(),
            })
        }
        _ => Ok(RtcpPacket::Other { payload_type: pt }),
    }
}

fn header(fmt: u8, pt: u8, words: u16) -> [u8; 4] {
    let b0 = 0x80 | (fmt & 0x1f);
    let w = words.to_be_bytes();
    [b0, pt, w[0], w[1]]
}

pub fn marshal_nack(nack: &TransportLayerNack) -> Bytes {
    let words = 2 + nack.pairs.len() as u16;
    let mut buf = BytesMut::new();
    buf.put_slice(&header(FMT_NACK, PT_RTP_FEEDBACK, words));
    buf.put_u32(nack.sender_ssrc);
    buf.put_u32(nack.media_ssrc);
    for (pid, blp) in &nack.pairs {
        buf.put_u16(*pid);
        buf.put_u16(*blp);
    }
    buf.freeze()
}

pub fn marshal_pli(sender_ssrc: u32, media_ssrc: u32) -> Bytes {
    let mut buf = BytesMut::new();
    buf.put_slice(&header(FMT_PLI, PT_PAYLOAD_FEEDBACK, 2));
    buf.put_u32(sender_ssrc);
    buf.put_u32(media_ssrc);
    buf.freeze()
}

/// Minimal receiver report: no report blocks, just our SSRC.
pub fn marshal_receiver_report(ssrc: u32) -> Bytes {
    let mut buf = BytesMut::new();
    buf.put_slice(&header(0, PT_RECEIVER_REPORT, 1));
    buf.put_u32(ssrc);
    buf.freeze()
}

/// Wraps an already-built TWCC feedback body (see [crate::twcc]).
pub fn marshal_twcc(body: &[u8]) -> Bytes {
    let padded = (body.len() + 3) / 4 * 4;
    let mut buf = BytesMut::new();
    buf.put_slice(&header(FMT_TWCC, PT_RTP_FEEDBACK, (padded / 4) as u16));
    buf.put_slice(body);
    for _ in body.len()..padded {
        buf.put_u8(0);
    }
    buf.freeze()
}
