//! Chunk stream mux/demux: fmt0–3 headers, extended timestamps and the
//! in-band chunk-size control.

use bytes::{Buf, BufMut, Bytes, BytesMut};
use shared::error::{Error, Result};
use std::collections::HashMap;

use crate::{MAX_CHUNK_SIZE, MIN_CHUNK_SIZE, PROTOCOL_CHUNK_SIZE};

pub mod message_type {
    pub const SET_CHUNK_SIZE: u8 = 1;
    pub const ABORT: u8 = 2;
    pub const ACK: u8 = 3;
    pub const USER_CONTROL: u8 = 4;
    pub const WINDOW_ACK_SIZE: u8 = 5;
    pub const SET_PEER_BANDWIDTH: u8 = 6;
    pub const AUDIO: u8 = 8;
    pub const VIDEO: u8 = 9;
    pub const AMF0_DATA: u8 = 18;
    pub const AMF0_COMMAND: u8 = 20;
}

/// Well-known chunk stream ids we mux onto.
pub mod csid {
    pub const PROTOCOL_CONTROL: u32 = 2;
    pub const COMMAND: u32 = 3;
    pub const AUDIO: u32 = 6;
    pub const VIDEO: u32 = 7;
    pub const DATA: u32 = 5;
}

/// One demuxed RTMP message.
#[derive(Debug, Clone, PartialEq)]
pub struct RtmpMessage {
    pub message_type: u8,
    pub timestamp: u32,
    pub stream_id: u32,
    pub payload: Bytes,
}

impl RtmpMessage {
    pub fn new(message_type: u8, timestamp: u32, stream_id: u32, payload: Bytes) -> Self {
        Self {
            message_type,
            timestamp,
            stream_id,
            payload,
        }
    }

    pub fn is_audio(&self) -> bool {
        self.message_type == message_type::AUDIO
    }

    pub fn is_video(&self) -> bool {
        self.message_type == message_type::VIDEO
    }

    pub fn is_av(&self) -> bool {
        self.is_audio() || self.is_video()
    }
}

#[derive(Default)]
struct ChunkStream {
    timestamp: u32,
    timestamp_delta: u32,
    message_length: u32,
    message_type: u8,
    stream_id: u32,
    extended_timestamp: bool,
    payload: BytesMut,
}

enum Decoded {
    Message(RtmpMessage),
    Progress,
    NeedMore,
}

/// Demuxes chunks into messages. Applies SetChunkSize in-band, since later
/// chunks cannot be parsed without it.
pub struct ChunkDecoder {
    in_chunk_size: u32,
    buffer: BytesMut,
    streams: HashMap<u32, ChunkStream>,
    /// Total bytes consumed, for window-ack accounting.
    pub in_bytes: u64,
}

impl Default for ChunkDecoder {
    fn default() -> Self {
        Self::new()
    }
}

impl ChunkDecoder {
    pub fn new() -> Self {
        Self {
            in_chunk_size: PROTOCOL_CHUNK_SIZE,
            buffer: BytesMut::new(),
            streams: HashMap::new(),
            in_bytes: 0,
        }
    }

    pub fn in_chunk_size(&self) -> u32 {
        self.in_chunk_size
    }

    /// Appends raw bytes and demuxes every complete message available.
    pub fn feed(&mut self, data: &[u8]) -> Result<Vec<RtmpMessage>> {
        self.buffer.put_slice(data);
        self.in_bytes += data.len() as u64;
        let mut out = Vec::new();
        loop {
            match self.try_decode()? {
                Decoded::Message(msg) => {
                    if msg.message_type == message_type::SET_CHUNK_SIZE && msg.payload.len() >= 4 {
                        let size = u32::from_be_bytes([
                            msg.payload[0],
                            msg.payload[1],
                            msg.payload[2],
                            msg.payload[3],
                        ]);
                        if !(MIN_CHUNK_SIZE..=MAX_CHUNK_SIZE).contains(&size) {
                            return Err(Error::ErrRtmpChunkSize(size));
                        }
                        self.in_chunk_size = size;
                    }
                    out.push(msg);
                }
                Decoded::Progress => continue,
                Decoded::NeedMore => return Ok(out),
            }
        }
    }

    fn try_decode(&mut self) -> Result<Decoded> {
        let buf = &self.buffer[..];
        if buf.is_empty() {
            return Ok(Decoded::NeedMore);
        }

        // Basic header: fmt + chunk stream id, 1 to 3 bytes.
        let fmt = (buf[0] >> 6) & 0x03;
        let (csid, mut offset) = match buf[0] & 0x3f {
            0 => {
                if buf.len() < 2 {
                    return Ok(Decoded::NeedMore);
                }
                (64 + buf[1] as u32, 2usize)
            }
            1 => {
                if buf.len() < 3 {
                    return Ok(Decoded::NeedMore);
                }
                (64 + buf[1] as u32 + 256 * buf[2] as u32, 3usize)
            }
            v => (v as u32, 1usize),
        };

        let header_size = match fmt {
            0 => 11,
            1 => 7,
            2 => 3,
            _ => 0,
        };
        if buf.len() < offset + header_size {
            return Ok(Decoded::NeedMore);
        }

        // A fresh message on this stream must not start with fmt3 unless we
        // have cached headers; an unknown stream with fmt3 is a peer bug.
        if fmt == 3 && !self.streams.contains_key(&csid) {
            return Err(Error::ErrRtmpChunkHeader);
        }
        let stream = self.streams.entry(csid).or_default();

        let mut timestamp_field = 0u32;
        let mut message_length = stream.message_length;
        let mut message_type = stream.message_type;
        let mut stream_id = stream.stream_id;
        match fmt {
            0 => {
                timestamp_field = u24(&buf[offset..]);
                message_length = u24(&buf[offset + 3..]);
                message_type = buf[offset + 6];
                stream_id = u32::from_le_bytes([
                    buf[offset + 7],
                    buf[offset + 8],
                    buf[offset + 9],
                    buf[offset + 10],
                ]);
            }
            1 => {
                timestamp_field = u24(&buf[offset..]);
                message_length = u24(&buf[offset + 3..]);
                message_type = buf[offset + 6];
            }
            2 => {
                timestamp_field = u24(&buf[offset..]);
            }
            _ => {}
        }
        offset += header_size;

        // Extended timestamp applies when the 24-bit field saturates; fmt3
        // repeats it only while the stream stays in extended mode.
        let extended = if fmt == 3 {
            stream.extended_timestamp
        } else {
            timestamp_field >= 0xffffff
        };
        let mut timestamp_full = timestamp_field;
        if extended {
            if buf.len() < offset + 4 {
                return Ok(Decoded::NeedMore);
            }
            timestamp_full = u32::from_be_bytes([
                buf[offset],
                buf[offset + 1],
                buf[offset + 2],
                buf[offset + 3],
            ]);
            offset += 4;
        }

        let remaining = (message_length as usize).saturating_sub(stream.payload.len());
        let chunk_payload = remaining.min(self.in_chunk_size as usize);
        if buf.len() < offset + chunk_payload {
            return Ok(Decoded::NeedMore);
        }

        // Everything buffered: commit header state.
        stream.message_length = message_length;
        stream.message_type = message_type;
        stream.stream_id = stream_id;
        stream.extended_timestamp = extended;
        match fmt {
            0 => {
                stream.timestamp = timestamp_full;
                stream.timestamp_delta = 0;
            }
            1 | 2 => {
                stream.timestamp_delta = timestamp_full;
                stream.timestamp = stream.timestamp.wrapping_add(timestamp_full);
            }
            _ => {
                // fmt3 continuing a message keeps its timestamp; starting a
                // new message reuses the previous delta.
                if stream.payload.is_empty() {
                    stream.timestamp = stream.timestamp.wrapping_add(stream.timestamp_delta);
                }
            }
        }

        stream.payload.put_slice(&buf[offset..offset + chunk_payload]);
        let complete = stream.payload.len() >= stream.message_length as usize;
        let msg = if complete {
            Some(RtmpMessage {
                message_type: stream.message_type,
                timestamp: stream.timestamp,
                stream_id: stream.stream_id,
                payload: stream.payload.split().freeze(),
            })
        } else {
            None
        };
        self.buffer.advance(offset + chunk_payload);
        Ok(match msg {
            Some(m) => Decoded::Message(m),
            None => Decoded::Progress,
        })
    }
}

/// Muxes messages into chunks: fmt0 first, fmt3 continuations.
pub struct ChunkEncoder {
    out_chunk_size: u32,
}

impl Default for ChunkEncoder {
    fn default() -> Self {
        Self::new()
    }
}

impl ChunkEncoder {
    pub fn new() -> Self {
        Self {
            out_chunk_size: PROTOCOL_CHUNK_SIZE,
        }
    }

    pub fn set_out_chunk_size(&mut self, size: u32) {
        self.out_chunk_size = size.clamp(MIN_CHUNK_SIZE, MAX_CHUNK_SIZE);
    }

    pub fn out_chunk_size(&self) -> u32 {
        self.out_chunk_size
    }

    fn csid_for(msg: &RtmpMessage) -> u32 {
        match msg.message_type {
            message_type::AUDIO => csid::AUDIO,
            message_type::VIDEO => csid::VIDEO,
            message_type::AMF0_DATA => csid::DATA,
            message_type::AMF0_COMMAND => csid::COMMAND,
            _ => csid::PROTOCOL_CONTROL,
        }
    }

    pub fn encode(&self, msg: &RtmpMessage) -> BytesMut {
        let csid = Self::csid_for(msg);
        let mut out = BytesMut::with_capacity(msg.payload.len() + 16);
        let extended = msg.timestamp >= 0xffffff;
        let ts_field = if extended { 0xffffff } else { msg.timestamp };

        // fmt0 header.
        out.put_u8((csid & 0x3f) as u8);
        put_u24(&mut out, ts_field);
        put_u24(&mut out, msg.payload.len() as u32);
        out.put_u8(msg.message_type);
        out.put_u32_le(msg.stream_id);
        if extended {
            out.put_u32(msg.timestamp);
        }

        let mut offset = 0usize;
        let chunk = self.out_chunk_size as usize;
        loop {
            let take = chunk.min(msg.payload.len() - offset);
            out.put_slice(&msg.payload[offset..offset + take]);
            offset += take;
            if offset >= msg.payload.len() {
                break;
            }
            // fmt3 continuation.
            out.put_u8(0xc0 | (csid & 0x3f) as u8);
            if extended {
                out.put_u32(msg.timestamp);
            }
        }
        out
    }
}

fn u24(b: &[u8]) -> u32 {
    ((b[0] as u32) << 16) | ((b[1] as u32) << 8) | b[2] as u32
}

fn put_u24(out: &mut BytesMut, v: u32) {
    out.put_u8((v >> 16) as u8);
    out.put_u8((v >> 8) as u8);
    out.put_u8(v as u8);
}

#[cfg(test)]
mod tests {
    use super::*;

    fn roundtrip(msgs: &[RtmpMessage], out_chunk: u32) -> Vec<RtmpMessage> {
        let mut enc = ChunkEncoder::new();
        enc.set_out_chunk_size(out_chunk);
        let mut dec = ChunkDecoder::new();
        // The decoder must learn the encoder's chunk size in-band.
        let set = RtmpMessage::new(
            message_type::SET_CHUNK_SIZE,
            0,
            0,
            Bytes::copy_from_slice(&out_chunk.to_be_bytes()),
        );
        let mut wire = BytesMut::new();
        wire.put_slice(&ChunkEncoder::new().encode(&set));
        for m in msgs {
            wire.put_slice(&enc.encode(m));
        }
        let mut out = dec.feed(&wire).unwrap();
        out.remove(0); // the SetChunkSize itself
        out
    }

    #[test]
    fn test_small_message_roundtrip() {
        let msg = RtmpMessage::new(
            message_type::AMF0_COMMAND,
            1234,
            1,
            Bytes::from_static(b"hello world"),
        );
        let out = roundtrip(std::slice::from_ref(&msg), 4096);
        assert_eq!(out, vec![msg]);
    }

    #[test]
    fn test_multi_chunk_message() {
        let payload: Vec<u8> = (0..100_000u32).map(|i| i as u8).collect();
        let msg = RtmpMessage::new(message_type::VIDEO, 40, 1, Bytes::from(payload));
        let out = roundtrip(std::slice::from_ref(&msg), 60000);
        assert_eq!(out.len(), 1);
        assert_eq!(out[0].payload, msg.payload);
        assert_eq!(out[0].timestamp, 40);
    }

    #[test]
    fn test_extended_timestamp() {
        let msg = RtmpMessage::new(
            message_type::VIDEO,
            0x0100_0000,
            1,
            Bytes::from(vec![9u8; 300]),
        );
        let out = roundtrip(std::slice::from_ref(&msg), 256);
        assert_eq!(out.len(), 1);
        assert_eq!(out[0].timestamp, 0x0100_0000);
    }

    #[test]
    fn test_partial_feed_resumes() {
        let msg = RtmpMessage::new(
            message_type::AUDIO,
            10,
            1,
            Bytes::from(vec![7u8; 500]),
        );
        let mut enc = ChunkEncoder::new();
        enc.set_out_chunk_size(4096);
        let set = RtmpMessage::new(
            message_type::SET_CHUNK_SIZE,
            0,
            0,
            Bytes::copy_from_slice(&4096u32.to_be_bytes()),
        );
        let mut wire = BytesMut::new();
        wire.put_slice(&ChunkEncoder::new().encode(&set));
        wire.put_slice(&enc.encode(&msg));

        let mut dec = ChunkDecoder::new();
        let split = wire.len() / 2;
        let first = dec.feed(&wire[..split]).unwrap();
        let second = dec.feed(&wire[split..]).unwrap();
        let all: Vec<_> = first.into_iter().chain(second).collect();
        assert_eq!(all.len(), 2);
        assert_eq!(all[1].payload.len(), 500);
    }

    #[test]
    fn test_interleaved_streams() {
        // Audio and video interleave on distinct chunk streams.
        let a = RtmpMessage::new(message_type::AUDIO, 20, 1, Bytes::from(vec![1u8; 50]));
        let v = RtmpMessage::new(message_type::VIDEO, 40, 1, Bytes::from(vec![2u8; 50]));
        let out = roundtrip(&[a.clone(), v.clone(), a.clone()], 4096);
        assert_eq!(out.len(), 3);
        assert!(out[0].is_audio());
        assert!(out[1].is_video());
        assert!(out[2].is_audio());
    }

    #[test]
    fn test_rejects_chunk_size_out_of_bounds() {
        let set = RtmpMessage::new(
            message_type::SET_CHUNK_SIZE,
            0,
            0,
            Bytes::copy_from_slice(&100_000u32.to_be_bytes()),
        );
        let wire = ChunkEncoder::new().encode(&set);
        let mut dec = ChunkDecoder::new();
        assert_eq!(
            dec.feed(&wire).unwrap_err(),
            Error::ErrRtmpChunkSize(100_000)
        );
    }

    #[test]
    fn test_rejects_fmt3_without_context() {
        let mut dec = ChunkDecoder::new();
        let wire = [0xc3u8];
        assert_eq!(
            dec.feed(&wire).unwrap_err(),
            Error::ErrRtmpChunkHeader
        );
    }
}
