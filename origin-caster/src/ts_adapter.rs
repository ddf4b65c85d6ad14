//! TS → RTMP adaptation: align to sync bytes, demux PES, rebuild the
//! AVC/HEVC/AAC messages the live hub expects.

use crate::dedup::AvDedupQueue;
use bytes::{Buf, Bytes, BytesMut};
use codec::mpegts::{TsDemuxer, TsMessage, SID_PRIVATE_STREAM_1, STREAM_TYPE_AAC, STREAM_TYPE_H265, TS_PACKET_SIZE, TS_SYNC_BYTE};
use codec::{aac, avc, flv, hevc};
use live::SharedMessage;
use shared::error::{Result, WrapExt};

/// Stateful adapter for one TS-carrying transport (UDP socket or SRT
/// connection).
pub struct TsToRtmp {
    buffer: BytesMut,
    demuxer: TsDemuxer,
    queue: AvDedupQueue,
    // Parameter sets seen on the wire; the sequence header is emitted once
    // per change, before the next IDR.
    sps: Bytes,
    pps: Bytes,
    vps: Bytes,
    video_sh_sent: bool,
    audio_sh_sent: bool,
}

impl Default for TsToRtmp {
    fn default() -> Self {
        Self::new()
    }
}

impl TsToRtmp {
    pub fn new() -> Self {
        Self {
            buffer: BytesMut::new(),
            demuxer: TsDemuxer::new(),
            queue: AvDedupQueue::new(),
            sps: Bytes::new(),
            pps: Bytes::new(),
            vps: Bytes::new(),
            video_sh_sent: false,
            audio_sh_sent: false,
        }
    }

    /// Feeds raw transport bytes; returns the RTMP messages released by the
    /// dedup queue, DTS-ordered.
    pub fn feed(&mut self, data: &[u8]) -> Result<Vec<SharedMessage>> {
        self.buffer.extend_from_slice(data);

        // Align to the sync byte, discarding garbage between packets.
        loop {
            if let Some(pos) = self.buffer.iter().position(|&b| b == TS_SYNC_BYTE) {
                if pos > 0 {
                    log::warn!("ts: lost sync, skip {} bytes", pos);
                    self.buffer.advance(pos);
                }
            } else {
                self.buffer.clear();
                break;
            }
            if self.buffer.len() < TS_PACKET_SIZE {
                break;
            }
            // A sync byte must recur one packet later, else this was a
            // payload byte masquerading as sync.
            if self.buffer.len() > TS_PACKET_SIZE && self.buffer[TS_PACKET_SIZE] != TS_SYNC_BYTE {
                self.buffer.advance(1);
                continue;
            }
            let packet = self.buffer.split_to(TS_PACKET_SIZE);
            if let Some(pes) = self.demuxer.demux(&packet).wrap("ts demux")? {
                self.on_pes(pes)?;
            }
        }

        let mut out = Vec::new();
        while let Some(msg) = self.queue.pop() {
            out.push(msg);
        }
        Ok(out)
    }

    fn on_pes(&mut self, mut pes: TsMessage) -> Result<()> {
        // Some encoders mark AAC as private-stream-1; rewrite to the
        // common audio SID before dispatch.
        if pes.sid == SID_PRIVATE_STREAM_1 && pes.stream_type == STREAM_TYPE_AAC {
            pes.sid = codec::mpegts::SID_AUDIO;
        }
        if pes.is_video() {
            self.on_video_pes(&pes)
        } else if pes.is_audio() {
            self.on_audio_pes(&pes)
        } else {
            Ok(())
        }
    }

    fn on_video_pes(&mut self, pes: &TsMessage) -> Result<()> {
        let dts = (pes.dts / 90) as i64;
        let pts = (pes.pts / 90) as i64;
        let cts = (pts - dts).max(0) as u32;
        let hevc_mode = pes.stream_type == STREAM_TYPE_H265;

        let mut payload = pes.payload.clone();
        let mut frames: Vec<Bytes> = Vec::new();
        let mut keyframe = false;
        while !payload.is_empty() {
            let nalu = match avc::annexb_demux(&mut payload) {
                Ok(n) => n,
                Err(e) => {
                    e.wrap("annexb").reset("skip malformed access unit");
                    break;
                }
            };
            if nalu.is_empty() {
                continue;
            }
            if hevc_mode {
                if hevc::is_vps(&nalu) {
                    self.update_ps(&nalu, PsKind::Vps);
                    continue;
                }
                if hevc::is_sps(&nalu) {
                    self.update_ps(&nalu, PsKind::Sps);
                    continue;
                }
                if hevc::is_pps(&nalu) {
                    self.update_ps(&nalu, PsKind::Pps);
                    continue;
                }
                keyframe |= hevc::is_keyframe(&nalu);
            } else {
                if avc::is_sps(&nalu) {
                    self.update_ps(&nalu, PsKind::Sps);
                    continue;
                }
                if avc::is_pps(&nalu) {
                    self.update_ps(&nalu, PsKind::Pps);
                    continue;
                }
                if avc::nalu_type(&nalu) == Some(avc::NALU_TYPE_AUD) {
                    continue;
                }
                keyframe |= avc::is_idr(&nalu);
            }
            frames.push(nalu);
        }

        // Sequence header precedes the first frame after a change.
        if !self.video_sh_sent && !self.sps.is_empty() && !self.pps.is_empty() {
            let payload = if hevc_mode {
                if self.vps.is_empty() {
                    return Ok(());
                }
                let record = hevc::mux_sequence_header(&self.vps, &self.sps, &self.pps)?;
                hevc::mux_hevc2flv(
                    &record,
                    flv::FRAME_TYPE_KEYFRAME,
                    flv::AVC_PACKET_SEQUENCE_HEADER,
                    0,
                )
            } else {
                let record = avc::mux_sequence_header(&self.sps, &self.pps);
                avc::mux_avc2flv(
                    &record,
                    flv::FRAME_TYPE_KEYFRAME,
                    flv::AVC_PACKET_SEQUENCE_HEADER,
                    0,
                )
            };
            self.queue.push(SharedMessage::video(dts, payload));
            self.video_sh_sent = true;
        }

        if frames.is_empty() {
            return Ok(());
        }
        let mut avcc = BytesMut::new();
        for frame in &frames {
            avcc.extend_from_slice(&avc::mux_ipb_frame(frame));
        }
        let frame_type = if keyframe {
            flv::FRAME_TYPE_KEYFRAME
        } else {
            flv::FRAME_TYPE_INTER
        };
        let payload = if hevc_mode {
            hevc::mux_hevc2flv(&avcc, frame_type, flv::AVC_PACKET_NALU, cts)
        } else {
            avc::mux_avc2flv(&avcc, frame_type, flv::AVC_PACKET_NALU, cts)
        };
        self.queue.push(SharedMessage::video(dts, payload));
        Ok(())
    }

    fn on_audio_pes(&mut self, pes: &TsMessage) -> Result<()> {
        let mut dts = (pes.dts / 90) as i64;
        let mut buf = pes.payload.clone();
        while buf.len() >= 7 {
            let (codec, frame) = match aac::adts_demux(&mut buf) {
                Ok(v) => v,
                Err(e) => {
                    e.wrap("adts").reset("skip malformed audio frame");
                    break;
                }
            };
            if !self.audio_sh_sent {
                let asc = aac::mux_sequence_header(&codec);
                let sh = aac::mux_aac2flv(&codec, aac::AAC_PACKET_SEQUENCE_HEADER, &asc);
                self.queue.push(SharedMessage::audio(dts, sh));
                self.audio_sh_sent = true;
            }
            if !frame.is_empty() {
                let payload = aac::mux_aac2flv(&codec, aac::AAC_PACKET_RAW, &frame);
                self.queue.push(SharedMessage::audio(dts, payload));
            }
            // Spread packed frames by the AAC frame duration.
            let hz = aac::AAC_SAMPLE_RATES[(codec.sampling_frequency_index & 0x0f) as usize].max(1);
            dts += (1024 * 1000 / hz as i64).max(1);
        }
        Ok(())
    }

    fn update_ps(&mut self, nalu: &Bytes, kind: PsKind) {
        let slot = match kind {
            PsKind::Vps => &mut self.vps,
            PsKind::Sps => &mut self.sps,
            PsKind::Pps => &mut self.pps,
        };
        if slot.as_ref() != nalu.as_ref() {
            *slot = nalu.clone();
            self.video_sh_sent = false;
        }
    }
}

enum PsKind {
    Vps,
    Sps,
    Pps,
}

#[cfg(test)]
mod tests {
    use super::*;
    use bytes::BufMut;
    use codec::mpegts::{TsWriter, PID_AUDIO, PID_VIDEO, SID_AUDIO, SID_VIDEO, STREAM_TYPE_H264};

    fn annexb_video(nalus: &[&[u8]]) -> Vec<u8> {
        let mut out = Vec::new();
        for n in nalus {
            out.extend_from_slice(&[0, 0, 0, 1]);
            out.extend_from_slice(n);
        }
        out
    }

    fn mux_ts(payloads: &[(u16, u8, Vec<u8>, u64)]) -> BytesMut {
        let mut w = TsWriter::new(STREAM_TYPE_H264, STREAM_TYPE_AAC);
        let mut out = BytesMut::new();
        w.write_pat_pmt(&mut out, true, true);
        for (pid, sid, payload, pts90) in payloads {
            w.write_pes(&mut out, *pid, *sid, payload, *pts90, *pts90, *pid == PID_VIDEO);
        }
        out
    }

    #[test]
    fn test_h264_ingest_emits_sh_then_frames() {
        let sps: &[u8] = &[0x67, 0x42, 0xc0, 0x1f];
        let pps: &[u8] = &[0x68, 0xcb];
        let idr: &[u8] = &[0x65, 1, 2, 3];
        let p: &[u8] = &[0x41, 4, 5];

        let wire = mux_ts(&[
            (PID_VIDEO, SID_VIDEO, annexb_video(&[sps, pps, idr]), 0),
            (PID_VIDEO, SID_VIDEO, annexb_video(&[p]), 3600),
            (PID_VIDEO, SID_VIDEO, annexb_video(&[p]), 7200),
            (PID_AUDIO, SID_AUDIO, {
                let mut b = Vec::new();
                // Two packed ADTS frames.
                b.extend_from_slice(&[0xff, 0xf9, 0x50, 0x40, 0x01, 0x00, 0x00, 0xaa]);
                b.extend_from_slice(&[0xff, 0xf9, 0x50, 0x40, 0x01, 0x00, 0x00, 0xbb]);
                b
            }, 1800),
            // A second audio PES completes the first one.
            (PID_AUDIO, SID_AUDIO, vec![0xff, 0xf9, 0x50, 0x40, 0x01, 0x00, 0x00, 0xcc], 5400),
        ]);

        let mut adapter = TsToRtmp::new();
        let mut msgs = adapter.feed(&wire).unwrap();
        // Flush the demuxer tail through one more video PES.
        let tail = mux_ts(&[(PID_VIDEO, SID_VIDEO, annexb_video(&[p]), 10800)]);
        msgs.extend(adapter.feed(&tail).unwrap());

        assert!(!msgs.is_empty());
        // First video message is the sequence header.
        let first_video = msgs.iter().find(|m| m.is_video()).unwrap();
        assert!(first_video.is_video_sequence_header());
        // First audio message is the AAC sequence header.
        let first_audio = msgs.iter().find(|m| m.is_audio()).unwrap();
        assert!(first_audio.is_audio_sequence_header());
        // DTS out of the dedup queue never decreases.
        let ts: Vec<i64> = msgs.iter().map(|m| m.header.timestamp).collect();
        let mut sorted = ts.clone();
        sorted.sort_unstable();
        assert_eq!(ts, sorted);
    }

    #[test]
    fn test_garbage_before_sync_is_skipped() {
        let mut wire = BytesMut::new();
        wire.put_slice(&[0xde, 0xad, 0xbe, 0xef]);
        let idr = annexb_video(&[&[0x65, 1]]);
        wire.put_slice(&mux_ts(&[(PID_VIDEO, SID_VIDEO, idr, 0)]));
        let mut adapter = TsToRtmp::new();
        // Must not error; garbage is skipped to the first sync byte.
        adapter.feed(&wire).unwrap();
    }

    #[test]
    fn test_keyframe_flag_set() {
        let sps: &[u8] = &[0x67, 0x42, 0xc0, 0x1f];
        let pps: &[u8] = &[0x68, 0xcb];
        let idr: &[u8] = &[0x65, 1, 2, 3];
        let wire = mux_ts(&[
            (PID_VIDEO, SID_VIDEO, annexb_video(&[sps, pps, idr]), 0),
            (PID_VIDEO, SID_VIDEO, annexb_video(&[&[0x41, 9]]), 3600),
        ]);
        let mut adapter = TsToRtmp::new();
        adapter.feed(&wire).unwrap();
        // Force the first PES out by flushing the demuxer directly.
        let pending = adapter.demuxer.flush();
        for pes in pending {
            adapter.on_pes(pes).unwrap();
        }
        // Drain ignoring AV-depth by filling audio.
        let audio = vec![0xffu8, 0xf9, 0x50, 0x40, 0x01, 0x00, 0x00, 0xcc];
        let wire2 = mux_ts(&[
            (PID_AUDIO, SID_AUDIO, audio.clone(), 0),
            (PID_AUDIO, SID_AUDIO, audio, 1800),
        ]);
        let msgs = adapter.feed(&wire2).unwrap();
        let kf = msgs
            .iter()
            .find(|m| m.is_video() && !m.is_video_sequence_header());
        if let Some(kf) = kf {
            assert!(kf.is_video_keyframe());
        }
    }
}
