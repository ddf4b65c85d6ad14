//! Raw AAC: ADTS demux for the TS/SRT ingest path, and the FLV-side muxers.

use bytes::{Buf, BufMut, Bytes, BytesMut};
use shared::error::{Error, Result};

pub use crate::flv::{AAC_PACKET_RAW, AAC_PACKET_SEQUENCE_HEADER};

/// Frequencies of the 4-bit sampling_frequency_index.
pub const AAC_SAMPLE_RATES: [u32; 16] = [
    96000, 88200, 64000, 48000, 44100, 32000, 24000, 22050, 16000, 12000, 11025, 8000, 7350, 0, 0,
    0,
];

/// The four FLV sound-rate buckets, for the informational sound_rate nibble.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FlvSoundRate {
    R5512 = 0,
    R11025 = 1,
    R22050 = 2,
    R44100 = 3,
}

impl FlvSoundRate {
    fn from_hz(hz: u32) -> FlvSoundRate {
        if hz >= 44100 {
            FlvSoundRate::R44100
        } else if hz >= 22050 {
            FlvSoundRate::R22050
        } else if hz >= 11025 {
            FlvSoundRate::R11025
        } else {
            FlvSoundRate::R5512
        }
    }
}

/// Codec parameters carried by each ADTS frame header. The
/// sampling_frequency_index is authoritative; sound_rate is the FLV bucket
/// derived from it.
#[derive(Debug, Clone, PartialEq)]
pub struct AdtsCodec {
    pub protection_absent: u8,
    /// Audio object type, profile + 1: 1 Main, 2 LC, 3 SSR.
    pub aac_object: u8,
    pub sampling_frequency_index: u8,
    pub channel_configuration: u8,
    pub frame_length: u16,
    pub sound_rate: FlvSoundRate,
    /// 0 mono, 1 stereo.
    pub sound_type: u8,
    /// Always 1: 16-bit samples.
    pub sound_size: u8,
}

/// Demuxes one ADTS frame from the front of `buf`, returning the codec
/// parameters and the raw AAC payload (which may be empty for a bare
/// header).
pub fn adts_demux(buf: &mut Bytes) -> Result<(AdtsCodec, Bytes)> {
    if buf.len() < 7 {
        return Err(Error::ErrBufferShort);
    }
    let b = buf.as_ref();
    // 12-bit syncword; the ID (MPEG version) bit is ignored on purpose.
    if b[0] != 0xff || (b[1] & 0xf0) != 0xf0 {
        return Err(Error::ErrAdtsHeader);
    }
    let protection_absent = b[1] & 0x01;
    let profile = (b[2] >> 6) & 0x03;
    let sampling_frequency_index = (b[2] >> 2) & 0x0f;
    let channel_configuration = ((b[2] & 0x01) << 2) | ((b[3] >> 6) & 0x03);
    let frame_length =
        (((b[3] & 0x03) as u16) << 11) | ((b[4] as u16) << 3) | (((b[5] >> 5) & 0x07) as u16);

    let header_len: u16 = if protection_absent == 1 { 7 } else { 9 };
    if frame_length < header_len || buf.len() < frame_length as usize {
        return Err(Error::ErrAdtsHeader);
    }

    let hz = AAC_SAMPLE_RATES[sampling_frequency_index as usize];
    let codec = AdtsCodec {
        protection_absent,
        aac_object: profile + 1,
        sampling_frequency_index,
        channel_configuration,
        frame_length,
        sound_rate: FlvSoundRate::from_hz(hz),
        sound_type: if channel_configuration == 2 { 1 } else { 0 },
        sound_size: 1,
    };

    let mut frame = buf.split_to(frame_length as usize);
    frame.advance(header_len as usize);
    Ok((codec, frame))
}

/// Builds the 2-byte AudioSpecificConfig for the RTMP sequence header.
pub fn mux_sequence_header(codec: &AdtsCodec) -> Bytes {
    let object = codec.aac_object;
    let sfi = codec.sampling_frequency_index;
    let channels = codec.channel_configuration;
    let mut buf = BytesMut::with_capacity(2);
    buf.put_u8((object << 3) | ((sfi >> 1) & 0x07));
    buf.put_u8(((sfi & 0x01) << 7) | ((channels & 0x0f) << 3));
    buf.freeze()
}

/// Wraps raw AAC (or the ASC) into an FLV audio tag payload.
pub fn mux_aac2flv(codec: &AdtsCodec, packet_type: u8, data: &[u8]) -> Bytes {
    let mut buf = BytesMut::with_capacity(2 + data.len());
    // Codec 10 (AAC), the informational rate bucket, 16-bit, and the
    // channel flag; AAC is always signalled stereo-compatible here.
    let sound_byte = (10u8 << 4)
        | ((codec.sound_rate as u8) << 2)
        | ((codec.sound_size & 0x01) << 1)
        | (codec.sound_type & 0x01);
    buf.put_u8(sound_byte);
    buf.put_u8(packet_type);
    buf.put_slice(data);
    buf.freeze()
}

/// Rebuilds the 7-byte ADTS header in front of a raw frame, for the TS
/// segmenters.
pub fn mux_adts(codec: &AdtsCodec, raw: &[u8]) -> Bytes {
    let frame_length = (raw.len() + 7) as u16;
    let profile = codec.aac_object.saturating_sub(1) & 0x03;
    let sfi = codec.sampling_frequency_index & 0x0f;
    let ch = codec.channel_configuration & 0x07;
    let mut buf = BytesMut::with_capacity(raw.len() + 7);
    buf.put_u8(0xff);
    buf.put_u8(0xf9);
    buf.put_u8((profile << 6) | (sfi << 2) | ((ch >> 2) & 0x01));
    buf.put_u8(((ch & 0x03) << 6) | ((frame_length >> 11) as u8 & 0x03));
    buf.put_u8((frame_length >> 3) as u8);
    buf.put_u8((((frame_length & 0x07) as u8) << 5) | 0x1f);
    buf.put_u8(0xfc);
    buf.put_slice(raw);
    buf.freeze()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_demux_rejects_bad_sync() {
        let mut b = Bytes::from_static(&[0xff, 0x09, 0x2c, 0x40, 0, 0xe0, 0]);
        assert!(adts_demux(&mut b).is_err());
    }

    #[test]
    fn test_demux_rejects_short() {
        let mut b = Bytes::from_static(&[0xff, 0xf9]);
        assert_eq!(adts_demux(&mut b).unwrap_err(), Error::ErrBufferShort);
    }

    #[test]
    fn test_demux_5512() {
        let mut b = Bytes::from_static(&[0xff, 0xf9, 0x2c, 0x40, 0, 0xe0, 0]);
        let (codec, frame) = adts_demux(&mut b).unwrap();
        assert_eq!(codec.protection_absent, 1);
        assert_eq!(codec.aac_object, 1); // Main
        assert_eq!(codec.sampling_frequency_index, 0x0b);
        assert_eq!(codec.channel_configuration, 1);
        assert_eq!(codec.frame_length, 7);
        assert_eq!(frame.len(), 0);
        assert_eq!(codec.sound_rate, FlvSoundRate::R5512);
        assert_eq!(codec.sound_type, 0);
        assert_eq!(codec.sound_size, 1);
    }

    #[test]
    fn test_demux_22050() {
        let mut b = Bytes::from_static(&[0xff, 0xf9, 0x18, 0x40, 0, 0xe0, 0]);
        let (codec, _) = adts_demux(&mut b).unwrap();
        assert_eq!(codec.sampling_frequency_index, 6);
        assert_eq!(codec.sound_rate, FlvSoundRate::R22050);
    }

    #[test]
    fn test_demux_44100() {
        let mut b = Bytes::from_static(&[0xff, 0xf9, 0x04, 0x40, 0, 0xe0, 0]);
        let (codec, _) = adts_demux(&mut b).unwrap();
        assert_eq!(codec.sampling_frequency_index, 1);
        assert_eq!(codec.sound_rate, FlvSoundRate::R44100);
    }

    #[test]
    fn test_demux_protected_has_crc() {
        let mut b = Bytes::from_static(&[0xff, 0xf0, 0x10, 0x40, 0x01, 0x40, 0, 0, 0, 1]);
        let (codec, frame) = adts_demux(&mut b).unwrap();
        assert_eq!(codec.protection_absent, 0);
        assert_eq!(codec.frame_length, 10);
        assert_eq!(frame.as_ref(), &[1]);
    }

    #[test]
    fn test_demux_protected_needs_crc_room() {
        // frame_length 8 < 9-byte protected header.
        let mut b = Bytes::from_static(&[0xff, 0xf0, 0x10, 0x40, 0x01, 0, 0, 1]);
        assert!(adts_demux(&mut b).is_err());
    }

    #[test]
    fn test_demux_minimum_raw_frame() {
        let mut b = Bytes::from_static(&[0xff, 0xf9, 0x10, 0x40, 0x01, 0, 0, 1]);
        let (codec, frame) = adts_demux(&mut b).unwrap();
        assert_eq!(codec.frame_length, 8);
        assert_eq!(frame.as_ref(), &[1]);
    }

    #[test]
    fn test_asc_roundtrip_via_adts() {
        let mut b = Bytes::from_static(&[0xff, 0xf9, 0x10, 0x40, 0x01, 0, 0, 1]);
        let (codec, _) = adts_demux(&mut b).unwrap();
        let asc = mux_sequence_header(&codec);
        // object 1, sfi 4, channels 1.
        assert_eq!(asc.as_ref(), &[0x0a, 0x08]);
    }

    #[test]
    fn test_adts_remux_roundtrip() {
        let mut b = Bytes::from_static(&[0xff, 0xf9, 0x10, 0x40, 0x01, 0, 0, 0x55]);
        let (codec, frame) = adts_demux(&mut b).unwrap();
        let remuxed = mux_adts(&codec, &frame);
        let mut again = remuxed.clone();
        let (codec2, frame2) = adts_demux(&mut again).unwrap();
        assert_eq!(codec2.sampling_frequency_index, codec.sampling_frequency_index);
        assert_eq!(codec2.channel_configuration, codec.channel_configuration);
        assert_eq!(frame2, frame);
    }

    #[test]
    fn test_mux_aac2flv_sound_byte() {
        let mut b = Bytes::from_static(&[0xff, 0xf9, 0x04, 0x40, 0, 0xe0, 0]);
        let (codec, _) = adts_demux(&mut b).unwrap();
        let flv = mux_aac2flv(&codec, AAC_PACKET_SEQUENCE_HEADER, &[0x12, 0x10]);
        // AAC, 44100 bucket, 16-bit, mono: 0b1010_1110.
        assert_eq!(flv[0], 0xae);
        assert_eq!(flv[1], AAC_PACKET_SEQUENCE_HEADER);
        assert_eq!(&flv[2..], &[0x12, 0x10]);
        let raw = mux_aac2flv(&codec, AAC_PACKET_RAW, &[0xaa]);
        assert_eq!(raw[1], AAC_PACKET_RAW);
    }
}
