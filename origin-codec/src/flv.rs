//! FLV stream mux/demux: 9-byte file header, 11-byte tag headers, and the
//! audio/video tag sniffers the cache layers rely on.

use bytes::{Buf, BufMut, Bytes, BytesMut};
use shared::error::{Error, Result};

pub const TAG_TYPE_AUDIO: u8 = 8;
pub const TAG_TYPE_VIDEO: u8 = 9;
pub const TAG_TYPE_SCRIPT: u8 = 18;

pub const HEADER_FLAG_AUDIO: u8 = 0x04;
pub const HEADER_FLAG_VIDEO: u8 = 0x01;

/// Frame type nibble of a video tag.
pub const FRAME_TYPE_KEYFRAME: u8 = 1;
pub const FRAME_TYPE_INTER: u8 = 2;

/// AVC packet types, byte 1 of an AVC video tag.
pub const AVC_PACKET_SEQUENCE_HEADER: u8 = 0;
pub const AVC_PACKET_NALU: u8 = 1;

/// AAC packet types, byte 1 of an AAC audio tag.
pub const AAC_PACKET_SEQUENCE_HEADER: u8 = 0;
pub const AAC_PACKET_RAW: u8 = 1;

/// One demuxed FLV tag.
#[derive(Debug, Clone, PartialEq)]
pub struct FlvTag {
    pub tag_type: u8,
    pub timestamp: u32,
    pub payload: Bytes,
}

/// Writes the 9-byte FLV header plus PreviousTagSize0: 13 bytes total.
pub fn write_header(has_video: bool, has_audio: bool) -> [u8; 13] {
    let mut flags = 0u8;
    if has_audio {
        flags |= HEADER_FLAG_AUDIO;
    }
    if has_video {
        flags |= HEADER_FLAG_VIDEO;
    }
    [
        b'F', b'L', b'V', 0x01, flags, 0x00, 0x00, 0x00, 0x09, 0x00, 0x00, 0x00, 0x00,
    ]
}

/// Appends one tag: 11-byte header, payload, 4-byte PreviousTagSize.
pub fn write_tag(buf: &mut BytesMut, tag_type: u8, timestamp: u32, payload: &[u8]) {
    buf.put_u8(tag_type);
    let size = payload.len() as u32;
    buf.put_u8((size >> 16) as u8);
    buf.put_u8((size >> 8) as u8);
    buf.put_u8(size as u8);
    buf.put_u8((timestamp >> 16) as u8);
    buf.put_u8((timestamp >> 8) as u8);
    buf.put_u8(timestamp as u8);
    buf.put_u8((timestamp >> 24) as u8); // extended
    buf.put_slice(&[0, 0, 0]); // stream id, always 0
    buf.put_slice(payload);
    buf.put_u32(11 + size);
}

/// Validates the 9-byte header, returning (has_video, has_audio).
pub fn read_header(buf: &mut Bytes) -> Result<(bool, bool)> {
    if buf.remaining() < 9 {
        return Err(Error::ErrBufferShort);
    }
    let sig = buf.split_to(3);
    if sig.as_ref() != b"FLV" {
        return Err(Error::ErrFlvSignature);
    }
    let version = buf.get_u8();
    if version != 0x01 {
        return Err(Error::ErrFlvSignature);
    }
    let flags = buf.get_u8();
    let _data_offset = buf.get_u32();
    Ok((
        flags & HEADER_FLAG_VIDEO != 0,
        flags & HEADER_FLAG_AUDIO != 0,
    ))
}

/// Reads one tag plus its trailing PreviousTagSize.
pub fn read_tag(buf: &mut Bytes) -> Result<FlvTag> {
    // 4 bytes of PreviousTagSize precede every tag after the header.
    if buf.remaining() < 4 + 11 {
        return Err(Error::ErrBufferShort);
    }
    let _previous = buf.get_u32();
    let tag_type = buf.get_u8();
    if tag_type != TAG_TYPE_AUDIO && tag_type != TAG_TYPE_VIDEO && tag_type != TAG_TYPE_SCRIPT {
        return Err(Error::ErrFlvTagType(tag_type));
    }
    let size = ((buf.get_u8() as u32) << 16) | ((buf.get_u8() as u32) << 8) | buf.get_u8() as u32;
    let ts_base =
        ((buf.get_u8() as u32) << 16) | ((buf.get_u8() as u32) << 8) | buf.get_u8() as u32;
    let ts_ext = buf.get_u8() as u32;
    let timestamp = (ts_ext << 24) | ts_base;
    let mut stream_id = [0u8; 3];
    buf.copy_to_slice(&mut stream_id);
    if buf.remaining() < size as usize {
        return Err(Error::ErrBufferShort);
    }
    let payload = buf.split_to(size as usize);
    Ok(FlvTag {
        tag_type,
        timestamp,
        payload,
    })
}

/// Video payload sniffers, mirroring the cache layers' needs: a sequence
/// header is a keyframe whose AVC packet type is 0.
pub mod video {
    use super::*;
    use crate::format::VideoCodecId;

    pub fn codec_id(data: &[u8]) -> Option<VideoCodecId> {
        let id = data.first()? & 0x0f;
        VideoCodecId::from_u8(id)
    }

    pub fn is_keyframe(data: &[u8]) -> bool {
        !data.is_empty() && (data[0] >> 4) & 0x0f == FRAME_TYPE_KEYFRAME
    }

    pub fn is_sequence_header(data: &[u8]) -> bool {
        if data.len() < 2 || !is_keyframe(data) {
            return false;
        }
        matches!(
            codec_id(data),
            Some(VideoCodecId::Avc) | Some(VideoCodecId::Hevc)
        ) && data[1] == AVC_PACKET_SEQUENCE_HEADER
    }
}

/// Audio payload sniffers.
pub mod audio {
    use super::*;
    use crate::format::AudioCodecId;

    pub fn codec_id(data: &[u8]) -> Option<AudioCodecId> {
        let id = (data.first()? >> 4) & 0x0f;
        AudioCodecId::from_u8(id)
    }

    pub fn is_sequence_header(data: &[u8]) -> bool {
        data.len() >= 2
            && codec_id(data) == Some(AudioCodecId::Aac)
            && data[1] == AAC_PACKET_SEQUENCE_HEADER
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_write_header_golden() {
        // "FLV" 0x01 0x05 0x00 0x00 0x00 0x09, then PreviousTagSize0.
        let h = write_header(true, true);
        assert_eq!(
            h,
            [0x46, 0x4c, 0x56, 0x01, 0x05, 0x00, 0x00, 0x00, 0x09, 0x00, 0x00, 0x00, 0x00]
        );
    }

    #[test]
    fn test_write_header_flags() {
        assert_eq!(write_header(true, false)[4], 0x01);
        assert_eq!(write_header(false, true)[4], 0x04);
        assert_eq!(write_header(false, false)[4], 0x00);
    }

    #[test]
    fn test_tag_roundtrip() {
        let mut buf = BytesMut::new();
        buf.put_slice(&write_header(true, true)[9..]); // PreviousTagSize0
        write_tag_after_prev(&mut buf);

        let mut b = buf.freeze();
        let tag = read_tag(&mut b).unwrap();
        assert_eq!(tag.tag_type, TAG_TYPE_VIDEO);
        assert_eq!(tag.timestamp, 0x01020304);
        assert_eq!(tag.payload.as_ref(), b"nalu");
    }

    fn write_tag_after_prev(buf: &mut BytesMut) {
        // Timestamp above 24 bits exercises the extended byte.
        let mut tag = BytesMut::new();
        write_tag(&mut tag, TAG_TYPE_VIDEO, 0x01020304, b"nalu");
        // write_tag emits header..payload..prevsize; reader wants prevsize
        // first, so feed it in stream order: our PreviousTagSize0 is already
        // in buf.
        buf.put_slice(&tag[..tag.len() - 4]);
        buf.put_u32(11 + 4);
    }

    #[test]
    fn test_read_header_rejects_bad_signature() {
        let mut b = Bytes::from_static(b"FLX\x01\x05\x00\x00\x00\x09");
        assert_eq!(read_header(&mut b).unwrap_err(), Error::ErrFlvSignature);
    }

    #[test]
    fn test_video_sniffers() {
        // keyframe + AVC + sequence header
        assert!(video::is_sequence_header(&[0x17, 0x00]));
        // keyframe + AVC + NALU
        assert!(!video::is_sequence_header(&[0x17, 0x01]));
        assert!(video::is_keyframe(&[0x17, 0x01]));
        // inter frame
        assert!(!video::is_keyframe(&[0x27, 0x01]));
    }

    #[test]
    fn test_audio_sniffers() {
        // AAC (10) << 4 | flags, then packet type 0.
        assert!(audio::is_sequence_header(&[0xaf, 0x00]));
        assert!(!audio::is_sequence_header(&[0xaf, 0x01]));
        // MP3 has no sequence header concept.
        assert!(!audio::is_sequence_header(&[0x2f, 0x00]));
    }
}
