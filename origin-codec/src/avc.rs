//! Raw H.264: Annex-B splitting, SPS/PPS sniffing and the AVCC/FLV muxers
//! used by the TS and RTC ingest paths.

use bytes::{Buf, BufMut, Bytes, BytesMut};
use shared::error::{Error, Result};

pub use crate::flv::{AVC_PACKET_NALU, AVC_PACKET_SEQUENCE_HEADER};

pub const NALU_TYPE_IDR: u8 = 5;
pub const NALU_TYPE_SEI: u8 = 6;
pub const NALU_TYPE_SPS: u8 = 7;
pub const NALU_TYPE_PPS: u8 = 8;
pub const NALU_TYPE_AUD: u8 = 9;

pub fn nalu_type(frame: &[u8]) -> Option<u8> {
    frame.first().map(|b| b & 0x1f)
}

pub fn is_sps(frame: &[u8]) -> bool {
    // forbidden_zero_bit must be 0.
    !frame.is_empty() && frame[0] & 0x80 == 0 && frame[0] & 0x1f == NALU_TYPE_SPS
}

pub fn is_pps(frame: &[u8]) -> bool {
    !frame.is_empty() && frame[0] & 0x80 == 0 && frame[0] & 0x1f == NALU_TYPE_PPS
}

pub fn is_idr(frame: &[u8]) -> bool {
    nalu_type(frame) == Some(NALU_TYPE_IDR)
}

/// Byte length of the start code at `data`, or None.
fn startcode_at(data: &[u8]) -> Option<usize> {
    if data.len() >= 3 && data[0] == 0 && data[1] == 0 && data[2] == 1 {
        Some(3)
    } else if data.len() >= 4 && data[0] == 0 && data[1] == 0 && data[2] == 0 && data[3] == 1 {
        Some(4)
    } else {
        None
    }
}

/// Demuxes the next NALU from an Annex-B buffer. The buffer must begin with
/// a 3- or 4-byte start code; the returned frame runs to the next start code
/// or the end of the buffer.
pub fn annexb_demux(buf: &mut Bytes) -> Result<Bytes> {
    let prefix = startcode_at(buf.as_ref()).ok_or(Error::ErrAnnexbNoStartCode)?;
    buf.advance(prefix);
    let data = buf.as_ref();
    let mut end = data.len();
    for i in 0..data.len() {
        if startcode_at(&data[i..]).is_some() {
            end = i;
            break;
        }
    }
    Ok(buf.split_to(end))
}

/// Splits a whole Annex-B access unit into NALUs.
pub fn annexb_split(mut buf: Bytes) -> Result<Vec<Bytes>> {
    let mut nalus = Vec::new();
    while !buf.is_empty() {
        let nalu = annexb_demux(&mut buf)?;
        if !nalu.is_empty() {
            nalus.push(nalu);
        }
    }
    Ok(nalus)
}

/// Builds the AVCDecoderConfigurationRecord from SPS and PPS.
pub fn mux_sequence_header(sps: &[u8], pps: &[u8]) -> Bytes {
    let mut buf = BytesMut::with_capacity(11 + sps.len() + pps.len());
    buf.put_u8(0x01); // configurationVersion
    buf.put_u8(sps.get(1).copied().unwrap_or(0)); // AVCProfileIndication
    buf.put_u8(sps.get(2).copied().unwrap_or(0)); // profile_compatibility
    buf.put_u8(sps.get(3).copied().unwrap_or(0)); // AVCLevelIndication
    buf.put_u8(0xff); // lengthSizeMinusOne = 3
    buf.put_u8(0xe1); // one SPS
    buf.put_u16(sps.len() as u16);
    buf.put_slice(sps);
    buf.put_u8(0x01); // one PPS
    buf.put_u16(pps.len() as u16);
    buf.put_slice(pps);
    buf.freeze()
}

/// Length-prefixes one I/P/B NALU for the AVCC stream.
pub fn mux_ipb_frame(frame: &[u8]) -> Bytes {
    let mut buf = BytesMut::with_capacity(4 + frame.len());
    buf.put_u32(frame.len() as u32);
    buf.put_slice(frame);
    buf.freeze()
}

/// Wraps AVCC data into an FLV video tag payload: frame type + codec nibble,
/// packet type, 24-bit composition time, data.
pub fn mux_avc2flv(data: &[u8], frame_type: u8, packet_type: u8, cts: u32) -> Bytes {
    let mut buf = BytesMut::with_capacity(5 + data.len());
    buf.put_u8((frame_type << 4) | 0x07);
    buf.put_u8(packet_type);
    buf.put_u8((cts >> 16) as u8);
    buf.put_u8((cts >> 8) as u8);
    buf.put_u8(cts as u8);
    buf.put_slice(data);
    buf.freeze()
}

/// Demuxed view of an FLV/RTMP AVC payload: length-prefixed NALUs after the
/// 5-byte tag prologue.
pub fn demux_avcc(data: &[u8]) -> Result<Vec<Bytes>> {
    if data.len() < 5 {
        return Err(Error::ErrBufferShort);
    }
    let mut buf = Bytes::copy_from_slice(&data[5..]);
    let mut nalus = Vec::new();
    while buf.remaining() >= 4 {
        let len = buf.get_u32() as usize;
        if buf.remaining() < len {
            return Err(Error::ErrBufferShort);
        }
        nalus.push(buf.split_to(len));
    }
    Ok(nalus)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_annexb_demux_multiple_frames() {
        let mut b = Bytes::from_static(&[0, 0, 1, 0x0d, 0x0a, 0x0f, 0, 0, 1, 0x0a]);
        let f1 = annexb_demux(&mut b).unwrap();
        assert_eq!(f1.as_ref(), &[0x0d, 0x0a, 0x0f]);
        let f2 = annexb_demux(&mut b).unwrap();
        assert_eq!(f2.as_ref(), &[0x0a]);
        assert!(b.is_empty());
    }

    #[test]
    fn test_annexb_demux_4byte_prefix() {
        let mut b = Bytes::from_static(&[0, 0, 0, 1, 0x0d, 0x0a, 0x0f, 0x0a]);
        let f = annexb_demux(&mut b).unwrap();
        assert_eq!(f.as_ref(), &[0x0d, 0x0a, 0x0f, 0x0a]);
    }

    #[test]
    fn test_annexb_demux_requires_prefix() {
        for bad in [
            &[0u8, 0, 2, 0x0d, 0x0a, 0x0f, 0x0a][..],
            &[0, 1, 0x0d, 0x0a, 0x0f, 0x0a][..],
            &[0x0d, 0x0a, 0x0f, 0x0a][..],
        ] {
            let mut b = Bytes::copy_from_slice(bad);
            assert_eq!(
                annexb_demux(&mut b).unwrap_err(),
                Error::ErrAnnexbNoStartCode
            );
        }
    }

    #[test]
    fn test_sps_pps_sniffers() {
        assert!(is_pps(&[0x08]));
        assert!(is_pps(&[0x68]));
        assert!(!is_pps(&[0x09]));
        assert!(!is_pps(&[0xf8]));
        assert!(is_sps(&[0x07]));
        assert!(is_sps(&[0x67]));
        assert!(!is_sps(&[0x08]));
        assert!(!is_sps(&[0xf7]));
    }

    #[test]
    fn test_mux_sequence_header_layout() {
        let sh = mux_sequence_header(b"Hello", b"world");
        assert_eq!(sh.len(), 11 + 5 + 5);
        assert_eq!(&sh[8..13], b"Hello");
        assert_eq!(&sh[16..], b"world");
        assert_eq!(sh[0], 1);
        assert_eq!(sh[4], 0xff);
        assert_eq!(sh[5], 0xe1);
    }

    #[test]
    fn test_mux_ipb_frame() {
        let f = mux_ipb_frame(b"Hello");
        assert_eq!(f.len(), 9);
        assert_eq!(&f[..4], &[0, 0, 0, 5]);
        assert_eq!(&f[4..], b"Hello");
    }

    #[test]
    fn test_mux_avc2flv() {
        let flv = mux_avc2flv(
            b"Hello",
            crate::flv::FRAME_TYPE_KEYFRAME,
            AVC_PACKET_SEQUENCE_HEADER,
            0x010203,
        );
        assert_eq!(flv.len(), 10);
        assert_eq!((flv[0] >> 4) & 0x0f, crate::flv::FRAME_TYPE_KEYFRAME);
        assert_eq!(flv[1], AVC_PACKET_SEQUENCE_HEADER);
        assert_eq!(&flv[2..5], &[1, 2, 3]);
        assert_eq!(&flv[5..], b"Hello");
    }

    #[test]
    fn test_demux_avcc_roundtrip() {
        let payload = mux_avc2flv(
            &mux_ipb_frame(&[0x65, 1, 2, 3]),
            crate::flv::FRAME_TYPE_KEYFRAME,
            AVC_PACKET_NALU,
            0,
        );
        let nalus = demux_avcc(&payload).unwrap();
        assert_eq!(nalus.len(), 1);
        assert_eq!(nalus[0].as_ref(), &[0x65, 1, 2, 3]);
        assert!(is_idr(&nalus[0]));
    }
}
