//! MPEG-TS packetizer and demuxer: 188-byte packets, PAT/PMT, PES assembly.
//!
//! The muxer feeds the HLS segmenter; the demuxer feeds the UDP/SRT ingest
//! adapters. Timestamps ride the 90kHz clock.

use bytes::{Buf, BufMut, Bytes, BytesMut};
use shared::error::{Error, Result};
use std::collections::HashMap;

pub const TS_PACKET_SIZE: usize = 188;
pub const TS_SYNC_BYTE: u8 = 0x47;

pub const PID_PAT: u16 = 0x0000;
pub const PID_PMT: u16 = 0x1001;
pub const PID_VIDEO: u16 = 0x0100;
pub const PID_AUDIO: u16 = 0x0101;

pub const STREAM_TYPE_H264: u8 = 0x1b;
pub const STREAM_TYPE_H265: u8 = 0x24;
pub const STREAM_TYPE_AAC: u8 = 0x0f;
pub const STREAM_TYPE_MP3: u8 = 0x03;

pub const SID_VIDEO: u8 = 0xe0;
pub const SID_AUDIO: u8 = 0xc0;
/// Private-stream-1; some encoders put AAC here.
pub const SID_PRIVATE_STREAM_1: u8 = 0xbd;

/// MPEG-2 CRC32 over PSI sections: poly 0x04C11DB7, init all-ones, no
/// reflection, no final xor.
pub fn crc32_mpeg(data: &[u8]) -> u32 {
    let mut crc: u32 = 0xffff_ffff;
    for &b in data {
        crc ^= (b as u32) << 24;
        for _ in 0..8 {
            if crc & 0x8000_0000 != 0 {
                crc = (crc << 1) ^ 0x04c1_1db7;
            } else {
                crc <<= 1;
            }
        }
    }
    crc
}

fn put_pts(buf: &mut BytesMut, prefix: u8, v: u64) {
    buf.put_u8((prefix << 4) | (((v >> 30) as u8 & 0x07) << 1) | 0x01);
    buf.put_u8((v >> 22) as u8);
    buf.put_u8((((v >> 15) as u8) << 1) | 0x01);
    buf.put_u8((v >> 7) as u8);
    buf.put_u8(((v as u8) << 1) | 0x01);
}

fn get_pts(b: &[u8]) -> u64 {
    (((b[0] >> 1) as u64 & 0x07) << 30)
        | ((b[1] as u64) << 22)
        | (((b[2] >> 1) as u64 & 0x7f) << 15)
        | ((b[3] as u64) << 7)
        | ((b[4] >> 1) as u64 & 0x7f)
}

/// The muxer: stateful continuity counters per PID, PSI on demand.
pub struct TsWriter {
    cc: HashMap<u16, u8>,
    video_stream_type: u8,
    audio_stream_type: u8,
}

impl TsWriter {
    pub fn new(video_stream_type: u8, audio_stream_type: u8) -> Self {
        Self {
            cc: HashMap::new(),
            video_stream_type,
            audio_stream_type,
        }
    }

    fn next_cc(&mut self, pid: u16) -> u8 {
        let cc = self.cc.entry(pid).or_insert(0);
        let v = *cc;
        *cc = (*cc + 1) & 0x0f;
        v
    }

    fn put_header(&mut self, buf: &mut BytesMut, pid: u16, pusi: bool, adaptation: bool) {
        buf.put_u8(TS_SYNC_BYTE);
        buf.put_u8(if pusi { 0x40 } else { 0x00 } | ((pid >> 8) as u8 & 0x1f));
        buf.put_u8(pid as u8);
        let afc = if adaptation { 0x30 } else { 0x10 };
        buf.put_u8(afc | self.next_cc(pid));
    }

    fn write_psi(&mut self, out: &mut BytesMut, pid: u16, table: &[u8]) {
        let mut buf = BytesMut::with_capacity(TS_PACKET_SIZE);
        self.put_header(&mut buf, pid, true, false);
        buf.put_u8(0); // pointer_field
        buf.put_slice(table);
        buf.put_u32(crc32_mpeg(table));
        while buf.len() < TS_PACKET_SIZE {
            buf.put_u8(0xff);
        }
        out.put_slice(&buf);
    }

    /// Writes PAT and PMT; once per segment is enough for live HLS.
    pub fn write_pat_pmt(&mut self, out: &mut BytesMut, has_video: bool, has_audio: bool) {
        // PAT: one program, number 1, mapped to PID_PMT.
        let mut pat = BytesMut::new();
        pat.put_u8(0x00); // table_id
        let body_len = 5 + 4 + 4; // fixed PSI fields + one program + CRC
        pat.put_u16(0xb000 | body_len as u16);
        pat.put_u16(0x0001); // transport_stream_id
        pat.put_u8(0xc1);
        pat.put_u8(0x00);
        pat.put_u8(0x00);
        pat.put_u16(0x0001); // program_number
        pat.put_u16(0xe000 | PID_PMT);
        self.write_psi(out, PID_PAT, &pat);

        // PMT: PCR on the video PID (or audio when pure audio).
        let pcr_pid = if has_video { PID_VIDEO } else { PID_AUDIO };
        let mut streams = Vec::new();
        if has_video {
            streams.push((self.video_stream_type, PID_VIDEO));
        }
        if has_audio {
            streams.push((self.audio_stream_type, PID_AUDIO));
        }
        let mut pmt = BytesMut::new();
        pmt.put_u8(0x02);
        let body_len = 9 + streams.len() * 5 + 4;
        pmt.put_u16(0xb000 | body_len as u16);
        pmt.put_u16(0x0001); // program_number
        pmt.put_u8(0xc1);
        pmt.put_u8(0x00);
        pmt.put_u8(0x00);
        pmt.put_u16(0xe000 | pcr_pid);
        pmt.put_u16(0xf000); // program_info_length 0
        for (stream_type, pid) in streams {
            pmt.put_u8(stream_type);
            pmt.put_u16(0xe000 | pid);
            pmt.put_u16(0xf000); // ES_info_length 0
        }
        self.write_psi(out, PID_PMT, &pmt);
    }

    /// Packetizes one PES, splitting across 188-byte packets with stuffing
    /// in the final one. PCR rides the first packet when requested.
    pub fn write_pes(
        &mut self,
        out: &mut BytesMut,
        pid: u16,
        sid: u8,
        payload: &[u8],
        pts: u64,
        dts: u64,
        with_pcr: bool,
    ) {
        let mut pes = BytesMut::with_capacity(payload.len() + 19);
        pes.put_slice(&[0x00, 0x00, 0x01, sid]);
        let has_dts = dts != pts;
        let header_len: u8 = if has_dts { 10 } else { 5 };
        let pes_len = payload.len() + 3 + header_len as usize;
        // Video PES length may exceed 16 bits; zero means unbounded.
        if pes_len > 0xffff {
            pes.put_u16(0);
        } else {
            pes.put_u16(pes_len as u16);
        }
        pes.put_u8(0x80);
        pes.put_u8(if has_dts { 0xc0 } else { 0x80 });
        pes.put_u8(header_len);
        if has_dts {
            put_pts(&mut pes, 0x03, pts);
            put_pts(&mut pes, 0x01, dts);
        } else {
            put_pts(&mut pes, 0x02, pts);
        }
        pes.put_slice(payload);

        let mut remaining = &pes[..];
        let mut first = true;
        while !remaining.is_empty() {
            let mut pkt = BytesMut::with_capacity(TS_PACKET_SIZE);
            // PCR or stuffing both need an adaptation field.
            let pcr_here = first && with_pcr;
            let body_capacity = if pcr_here { 184 - 8 } else { 184 };
            let needs_stuffing = remaining.len() < body_capacity;
            let adaptation = pcr_here || needs_stuffing;
            self.put_header(&mut pkt, pid, first, adaptation);
            if adaptation {
                let take = remaining.len().min(body_capacity);
                let af_len = (184 - take - 1) as u8;
                pkt.put_u8(af_len);
                if af_len > 0 {
                    let mut flags = 0u8;
                    if pcr_here {
                        flags |= 0x10;
                    }
                    if first {
                        flags |= 0x40; // random_access_indicator
                    }
                    pkt.put_u8(flags);
                    if pcr_here {
                        let pcr_base = dts;
                        pkt.put_u8((pcr_base >> 25) as u8);
                        pkt.put_u8((pcr_base >> 17) as u8);
                        pkt.put_u8((pcr_base >> 9) as u8);
                        pkt.put_u8((pcr_base >> 1) as u8);
                        pkt.put_u8((((pcr_base & 0x01) as u8) << 7) | 0x7e);
                        pkt.put_u8(0);
                    }
                    while pkt.len() < TS_PACKET_SIZE - take {
                        pkt.put_u8(0xff);
                    }
                }
                pkt.put_slice(&remaining[..take]);
                remaining = &remaining[take..];
            } else {
                pkt.put_slice(&remaining[..184]);
                remaining = &remaining[184..];
            }
            debug_assert_eq!(pkt.len(), TS_PACKET_SIZE);
            out.put_slice(&pkt);
            first = false;
        }
    }
}

/// One reassembled PES message.
#[derive(Debug, Clone)]
pub struct TsMessage {
    pub pid: u16,
    pub sid: u8,
    pub stream_type: u8,
    /// 90kHz ticks.
    pub pts: u64,
    pub dts: u64,
    pub payload: Bytes,
}

impl TsMessage {
    pub fn is_video(&self) -> bool {
        self.sid & 0xf0 == SID_VIDEO
    }

    pub fn is_audio(&self) -> bool {
        self.sid & 0xe0 == SID_AUDIO
    }
}

#[derive(Default)]
struct PesAssembly {
    stream_type: u8,
    sid: u8,
    pts: u64,
    dts: u64,
    buffer: BytesMut,
    started: bool,
}

/// The demuxer: tracks PAT→PMT→ES pids and flushes a message whenever the
/// next payload-unit-start arrives on its PID.
#[derive(Default)]
pub struct TsDemuxer {
    pmt_pid: Option<u16>,
    streams: HashMap<u16, PesAssembly>,
}

impl TsDemuxer {
    pub fn new() -> Self {
        Self::default()
    }

    /// Consumes one aligned 188-byte packet, returning any message it
    /// completed.
    pub fn demux(&mut self, packet: &[u8]) -> Result<Option<TsMessage>> {
        if packet.len() != TS_PACKET_SIZE || packet[0] != TS_SYNC_BYTE {
            return Err(Error::ErrTsSync);
        }
        let pusi = packet[1] & 0x40 != 0;
        let pid = (((packet[1] & 0x1f) as u16) << 8) | packet[2] as u16;
        let afc = (packet[3] >> 4) & 0x03;
        let mut offset = 4usize;
        if afc == 0x02 || afc == 0x03 {
            let af_len = packet[4] as usize;
            offset += 1 + af_len;
        }
        if afc == 0x02 || offset >= TS_PACKET_SIZE {
            return Ok(None); // adaptation only
        }
        let payload = &packet[offset..];

        if pid == PID_PAT {
            self.parse_pat(payload)?;
            return Ok(None);
        }
        if Some(pid) == self.pmt_pid {
            self.parse_pmt(payload)?;
            return Ok(None);
        }
        let Some(assembly) = self.streams.get_mut(&pid) else {
            return Ok(None);
        };

        let mut completed = None;
        if pusi {
            if assembly.started && !assembly.buffer.is_empty() {
                completed = Some(TsMessage {
                    pid,
                    sid: assembly.sid,
                    stream_type: assembly.stream_type,
                    pts: assembly.pts,
                    dts: assembly.dts,
                    payload: assembly.buffer.split().freeze(),
                });
            }
            Self::begin_pes(assembly, payload)?;
        } else if assembly.started {
            assembly.buffer.put_slice(payload);
        }
        Ok(completed)
    }

    /// Flushes every partially assembled message; call at end of stream.
    pub fn flush(&mut self) -> Vec<TsMessage> {
        let mut out = Vec::new();
        for (&pid, assembly) in self.streams.iter_mut() {
            if assembly.started && !assembly.buffer.is_empty() {
                out.push(TsMessage {
                    pid,
                    sid: assembly.sid,
                    stream_type: assembly.stream_type,
                    pts: assembly.pts,
                    dts: assembly.dts,
                    payload: assembly.buffer.split().freeze(),
                });
                assembly.started = false;
            }
        }
        out
    }

    fn begin_pes(assembly: &mut PesAssembly, payload: &[u8]) -> Result<()> {
        if payload.len() < 9 || payload[0] != 0 || payload[1] != 0 || payload[2] != 1 {
            return Err(Error::ErrTsPacket);
        }
        let sid = payload[3];
        let pts_dts_flags = (payload[7] >> 6) & 0x03;
        let header_len = payload[8] as usize;
        if payload.len() < 9 + header_len {
            return Err(Error::ErrTsPacket);
        }
        let (mut pts, mut dts) = (0u64, 0u64);
        if pts_dts_flags & 0x02 != 0 && header_len >= 5 {
            pts = get_pts(&payload[9..14]);
            dts = pts;
        }
        if pts_dts_flags == 0x03 && header_len >= 10 {
            dts = get_pts(&payload[14..19]);
        }
        assembly.sid = sid;
        assembly.pts = pts;
        assembly.dts = dts;
        assembly.started = true;
        assembly.buffer.clear();
        assembly.buffer.put_slice(&payload[9 + header_len..]);
        Ok(())
    }

    fn parse_pat(&mut self, payload: &[u8]) -> Result<()> {
        let section = Self::psi_section(payload)?;
        if section.len() < 8 + 4 {
            return Err(Error::ErrTsPacket);
        }
        // Programs sit after the 8-byte fixed part, 4 bytes each, CRC last.
        let programs = &section[8..section.len() - 4];
        let mut buf = programs;
        while buf.len() >= 4 {
            let program = u16::from_be_bytes([buf[0], buf[1]]);
            let pid = u16::from_be_bytes([buf[2], buf[3]]) & 0x1fff;
            if program != 0 {
                self.pmt_pid = Some(pid);
            }
            buf = &buf[4..];
        }
        Ok(())
    }

    fn parse_pmt(&mut self, payload: &[u8]) -> Result<()> {
        let section = Self::psi_section(payload)?;
        if section.len() < 12 + 4 {
            return Err(Error::ErrTsPacket);
        }
        let program_info_len = (u16::from_be_bytes([section[10], section[11]]) & 0x0fff) as usize;
        let mut buf = &section[12 + program_info_len..section.len() - 4];
        while buf.len() >= 5 {
            let stream_type = buf[0];
            let pid = u16::from_be_bytes([buf[1], buf[2]]) & 0x1fff;
            let es_info_len = (u16::from_be_bytes([buf[3], buf[4]]) & 0x0fff) as usize;
            if buf.len() < 5 + es_info_len {
                return Err(Error::ErrTsPacket);
            }
            let assembly = self.streams.entry(pid).or_default();
            assembly.stream_type = stream_type;
            buf = &buf[5 + es_info_len..];
        }
        Ok(())
    }

    /// Section bytes from pointer_field through CRC, bounded by
    /// section_length.
    fn psi_section(payload: &[u8]) -> Result<&[u8]> {
        if payload.is_empty() {
            return Err(Error::ErrTsPacket);
        }
        let pointer = payload[0] as usize;
        let table = payload.get(1 + pointer..).ok_or(Error::ErrTsPacket)?;
        if table.len() < 3 {
            return Err(Error::ErrTsPacket);
        }
        let section_len = (u16::from_be_bytes([table[1], table[2]]) & 0x0fff) as usize;
        table.get(..3 + section_len).ok_or(Error::ErrTsPacket)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn mux_stream(payloads: &[(u16, u8, &[u8], u64, u64)]) -> BytesMut {
        let mut w = TsWriter::new(STREAM_TYPE_H264, STREAM_TYPE_AAC);
        let mut out = BytesMut::new();
        w.write_pat_pmt(&mut out, true, true);
        for &(pid, sid, payload, pts, dts) in payloads {
            w.write_pes(&mut out, pid, sid, payload, pts, dts, pid == PID_VIDEO);
        }
        out
    }

    #[test]
    fn test_packets_are_aligned() {
        let big = vec![0xabu8; 1000];
        let out = mux_stream(&[(PID_VIDEO, SID_VIDEO, &big, 90_000, 89_000)]);
        assert_eq!(out.len() % TS_PACKET_SIZE, 0);
        for pkt in out.chunks(TS_PACKET_SIZE) {
            assert_eq!(pkt[0], TS_SYNC_BYTE);
        }
    }

    #[test]
    fn test_continuity_counters() {
        let big = vec![0u8; 600];
        let out = mux_stream(&[(PID_VIDEO, SID_VIDEO, &big, 0, 0)]);
        let mut last_cc: Option<u8> = None;
        for pkt in out.chunks(TS_PACKET_SIZE) {
            let pid = (((pkt[1] & 0x1f) as u16) << 8) | pkt[2] as u16;
            if pid != PID_VIDEO {
                continue;
            }
            let cc = pkt[3] & 0x0f;
            if let Some(last) = last_cc {
                assert_eq!(cc, (last + 1) & 0x0f);
            }
            last_cc = Some(cc);
        }
        assert!(last_cc.is_some());
    }

    #[test]
    fn test_mux_demux_roundtrip() {
        let video = vec![0x65u8; 700];
        let audio = [0xffu8, 0xf1, 0x50, 0x80, 0x02, 0x1f, 0xfc, 0x01, 0x02];
        let out = mux_stream(&[
            (PID_VIDEO, SID_VIDEO, &video, 180_000, 177_000),
            (PID_AUDIO, SID_AUDIO, &audio, 181_000, 181_000),
            // A second video PES flushes the first.
            (PID_VIDEO, SID_VIDEO, &[0x41u8; 10], 183_600, 180_600),
        ]);

        let mut demuxer = TsDemuxer::new();
        let mut messages = Vec::new();
        for pkt in out.chunks(TS_PACKET_SIZE) {
            if let Some(m) = demuxer.demux(pkt).unwrap() {
                messages.push(m);
            }
        }
        messages.extend(demuxer.flush());
        assert_eq!(messages.len(), 3);

        let v = messages.iter().find(|m| m.pid == PID_VIDEO).unwrap();
        assert_eq!(v.sid, SID_VIDEO);
        assert_eq!(v.stream_type, STREAM_TYPE_H264);
        assert_eq!(v.pts, 180_000);
        assert_eq!(v.dts, 177_000);
        assert_eq!(v.payload.as_ref(), video.as_slice());
        assert!(v.is_video());

        let a = messages.iter().find(|m| m.pid == PID_AUDIO).unwrap();
        assert_eq!(a.pts, 181_000);
        assert_eq!(a.dts, 181_000);
        assert_eq!(a.payload.as_ref(), audio.as_slice());
        assert!(a.is_audio());
    }

    #[test]
    fn test_demux_rejects_lost_sync() {
        let mut demuxer = TsDemuxer::new();
        let pkt = [0u8; TS_PACKET_SIZE];
        assert_eq!(demuxer.demux(&pkt).unwrap_err(), Error::ErrTsSync);
    }

    #[test]
    fn test_pts_codec() {
        let mut buf = BytesMut::new();
        let v = 0x1_2345_6789u64 & 0x1_ffff_ffff;
        put_pts(&mut buf, 0x02, v);
        assert_eq!(get_pts(&buf), v);
    }

    #[test]
    fn test_crc32_mpeg_vector() {
        // Known MPEG-2 CRC of the ASCII digits "123456789".
        assert_eq!(crc32_mpeg(b"123456789"), 0x0376_e6e7);
    }
}
