//! RTP ⇄ AV frame bridging: reassemble FU-A/STAP-A into RTMP-shaped video
//! messages, and packetize AV frames back into RTP.

use crate::rtp::{RtpHeader, RtpPacket};
use bytes::{BufMut, Bytes, BytesMut};
use codec::{avc, flv};
use live::SharedMessage;
use shared::error::{Error, Result};
use std::collections::BTreeMap;

const NALU_TYPE_STAP_A: u8 = 24;
const NALU_TYPE_FU_A: u8 = 28;
/// Payload budget per RTP packet before fragmenting.
const RTP_MTU: usize = 1200;

/// Output of the builder: AV messages for the hub, opus frames kept raw for
/// RTC-only consumers.
#[derive(Debug, Clone)]
pub enum RtcFrame {
    Video(SharedMessage),
    OpusAudio { timestamp_ms: i64, frame: Bytes },
}

/// Reassembles one video SSRC's RTP into access units. Packets buffer by
/// sequence; a marker bit closes the unit, and any gap drops it.
pub struct RtcFrameBuilder {
    pending: BTreeMap<u16, RtpPacket>,
    first_seq: Option<u16>,
    sps: Bytes,
    pps: Bytes,
    sh_emitted: bool,
}

impl Default for RtcFrameBuilder {
    fn default() -> Self {
        Self::new()
    }
}

impl RtcFrameBuilder {
    pub fn new() -> Self {
        Self {
            pending: BTreeMap::new(),
            first_seq: None,
            sps: Bytes::new(),
            pps: Bytes::new(),
            sh_emitted: false,
        }
    }

    /// Feeds one video RTP packet; returns completed frames.
    pub fn push_video(&mut self, packet: RtpPacket) -> Result<Vec<RtcFrame>> {
        let seq = packet.header.sequence_number;
        let marker = packet.header.marker;
        self.first_seq.get_or_insert(seq);
        self.pending.insert(seq, packet);
        if !marker {
            return Ok(Vec::new());
        }
        self.assemble(seq)
    }

    fn assemble(&mut self, last_seq: u16) -> Result<Vec<RtcFrame>> {
        let Some(first_seq) = self.first_seq.take() else {
            return Ok(Vec::new());
        };
        let span = last_seq.wrapping_sub(first_seq) as usize + 1;
        let packets: Vec<RtpPacket> = {
            let mut out = Vec::with_capacity(span);
            let mut complete = true;
            let mut seq = first_seq;
            for _ in 0..span {
                match self.pending.remove(&seq) {
                    Some(p) => out.push(p),
                    None => {
                        complete = false;
                        break;
                    }
                }
                seq = seq.wrapping_add(1);
            }
            self.pending.clear();
            if !complete {
                // A hole inside the unit; NACK handles recovery, we drop.
                log::debug!("frame builder: drop access unit, seq hole near {}", seq);
                return Ok(Vec::new());
            }
            out
        };

        let timestamp_ms = (packets[0].header.timestamp / 90) as i64;
        let mut nalus: Vec<Bytes> = Vec::new();
        let mut fua: Option<BytesMut> = None;
        for p in &packets {
            let payload = &p.payload;
            if payload.is_empty() {
                continue;
            }
            match payload[0] & 0x1f {
                NALU_TYPE_STAP_A => {
                    let mut buf = payload.slice(1..);
                    while buf.len() >= 2 {
                        let len = u16::from_be_bytes([buf[0], buf[1]]) as usize;
                        if buf.len() < 2 + len {
                            break;
                        }
                        nalus.push(buf.slice(2..2 + len));
                        buf = buf.slice(2 + len..);
                    }
                }
                NALU_TYPE_FU_A => {
                    if payload.len() < 2 {
                        continue;
                    }
                    let indicator = payload[0];
                    let fu_header = payload[1];
                    let start = fu_header & 0x80 != 0;
                    let end = fu_header & 0x40 != 0;
                    if start {
                        let mut acc = BytesMut::new();
                        acc.put_u8((indicator & 0xe0) | (fu_header & 0x1f));
                        acc.put_slice(&payload[2..]);
                        fua = Some(acc);
                    } else if let Some(acc) = fua.as_mut() {
                        acc.put_slice(&payload[2..]);
                    }
                    if end {
                        if let Some(acc) = fua.take() {
                            nalus.push(acc.freeze());
                        }
                    }
                }
                _ => nalus.push(payload.clone()),
            }
        }

        let mut frames = Vec::new();
        let mut keyframe = false;
        let mut slices: Vec<Bytes> = Vec::new();
        for nalu in nalus {
            if avc::is_sps(&nalu) {
                if self.sps.as_ref() != nalu.as_ref() {
                    self.sps = nalu;
                    self.sh_emitted = false;
                }
                continue;
            }
            if avc::is_pps(&nalu) {
                if self.pps.as_ref() != nalu.as_ref() {
                    self.pps = nalu;
                    self.sh_emitted = false;
                }
                continue;
            }
            keyframe |= avc::is_idr(&nalu);
            slices.push(nalu);
        }

        if !self.sh_emitted && !self.sps.is_empty() && !self.pps.is_empty() {
            let record = avc::mux_sequence_header(&self.sps, &self.pps);
            let payload = avc::mux_avc2flv(
                &record,
                flv::FRAME_TYPE_KEYFRAME,
                flv::AVC_PACKET_SEQUENCE_HEADER,
                0,
            );
            frames.push(RtcFrame::Video(SharedMessage::video(timestamp_ms, payload)));
            self.sh_emitted = true;
        }
        if !slices.is_empty() {
            let mut avcc = BytesMut::new();
            for s in &slices {
                avcc.extend_from_slice(&avc::mux_ipb_frame(s));
            }
            let frame_type = if keyframe {
                flv::FRAME_TYPE_KEYFRAME
            } else {
                flv::FRAME_TYPE_INTER
            };
            let payload = avc::mux_avc2flv(&avcc, frame_type, flv::AVC_PACKET_NALU, 0);
            frames.push(RtcFrame::Video(SharedMessage::video(timestamp_ms, payload)));
        }
        Ok(frames)
    }

    /// Opus needs no reassembly; one packet is one frame.
    pub fn push_audio(&mut self, packet: &RtpPacket) -> RtcFrame {
        RtcFrame::OpusAudio {
            timestamp_ms: (packet.header.timestamp / 48) as i64,
            frame: packet.payload.clone(),
        }
    }
}

/// Packetizes AVCC video messages into RTP: STAP-A for parameter sets and
/// FU-A fragmentation past the MTU.
pub struct RtpPacketizer {
    ssrc: u32,
    payload_type: u8,
    sequence: u16,
    sps: Bytes,
    pps: Bytes,
}

impl RtpPacketizer {
    pub fn new(ssrc: u32, payload_type: u8) -> Self {
        Self {
            ssrc,
            payload_type,
            sequence: rand::random(),
            sps: Bytes::new(),
            pps: Bytes::new(),
        }
    }

    fn next_header(&mut self, timestamp: u32, marker: bool) -> RtpHeader {
        let header = RtpHeader {
            marker,
            payload_type: self.payload_type,
            sequence_number: self.sequence,
            timestamp,
            ssrc: self.ssrc,
            ..Default::default()
        };
        self.sequence = self.sequence.wrapping_add(1);
        header
    }

    /// Converts one video message from the hub into RTP packets.
    pub fn packetize_video(&mut self, msg: &SharedMessage) -> Result<Vec<RtpPacket>> {
        if !msg.is_video() {
            return Err(Error::ErrRtpHeader);
        }
        let ts = (msg.header.timestamp as u32).wrapping_mul(90);

        if msg.is_video_sequence_header() {
            // Remember parameter sets; they ride a STAP-A ahead of the next
            // keyframe.
            let mut format = codec::format::Format::new();
            format.on_video(&msg.payload)?;
            if let Some(v) = format.video {
                self.sps = v.sps;
                self.pps = v.pps;
            }
            return Ok(Vec::new());
        }

        let nalus = avc::demux_avcc(&msg.payload)?;
        let mut out = Vec::new();
        let keyframe = msg.is_video_keyframe();
        if keyframe && !self.sps.is_empty() && !self.pps.is_empty() {
            let mut stap = BytesMut::new();
            stap.put_u8(NALU_TYPE_STAP_A | 0x60);
            for ps in [&self.sps, &self.pps] {
                stap.put_u16(ps.len() as u16);
                stap.put_slice(ps);
            }
            out.push(RtpPacket {
                header: self.next_header(ts, false),
                payload: stap.freeze(),
            });
        }

        let last_index = nalus.len().saturating_sub(1);
        for (i, nalu) in nalus.iter().enumerate() {
            let is_last_nalu = i == last_index;
            if nalu.len() <= RTP_MTU {
                out.push(RtpPacket {
                    header: self.next_header(ts, is_last_nalu),
                    payload: nalu.clone(),
                });
                continue;
            }
            // FU-A fragmentation.
            let indicator = (nalu[0] & 0xe0) | NALU_TYPE_FU_A;
            let nalu_type = nalu[0] & 0x1f;
            let body = &nalu[1..];
            let mut offset = 0;
            while offset < body.len() {
                let take = RTP_MTU.min(body.len() - offset);
                let start = offset == 0;
                let end = offset + take >= body.len();
                let mut payload = BytesMut::with_capacity(2 + take);
                payload.put_u8(indicator);
                payload.put_u8(
                    if start { 0x80 } else { 0 } | if end { 0x40 } else { 0 } | nalu_type,
                );
                payload.put_slice(&body[offset..offset + take]);
                out.push(RtpPacket {
                    header: self.next_header(ts, is_last_nalu && end),
                    payload: payload.freeze(),
                });
                offset += take;
            }
        }
        Ok(out)
    }
}
