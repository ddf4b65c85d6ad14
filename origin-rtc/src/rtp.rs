//! RTP packet codec: the fixed header, one-byte extensions and payload.

use bytes::{Buf, BufMut, Bytes, BytesMut};
use shared::error::{Error, Result};

/// One-byte-header extension profile.
pub const EXTENSION_PROFILE_ONE_BYTE: u16 = 0xbede;

#[derive(Debug, Clone, PartialEq, Default)]
pub struct RtpHeader {
    pub padding: bool,
    pub marker: bool,
    pub payload_type: u8,
    pub sequence_number: u16,
    pub timestamp: u32,
    pub ssrc: u32,
    pub csrc: Vec<u32>,
    /// (id, payload) pairs of the one-byte extension block.
    pub extensions: Vec<(u8, Bytes)>,
}

impl RtpHeader {
    /// Fetches a one-byte extension payload by id.
    pub fn extension(&self, id: u8) -> Option<&Bytes> {
        self.extensions.iter().find(|(i, _)| *i == id).map(|(_, p)| p)
    }

    /// Sets or replaces an extension value.
    pub fn set_extension(&mut self, id: u8, payload: Bytes) {
        if let Some(e) = self.extensions.iter_mut().find(|(i, _)| *i == id) {
            e.1 = payload;
        } else {
            self.extensions.push((id, payload));
        }
    }
}

#[derive(Debug, Clone, PartialEq, Default)]
pub struct RtpPacket {
    pub header: RtpHeader,
    pub payload: Bytes,
}

impl RtpPacket {
    pub fn parse(data: &[u8]) -> Result<RtpPacket> {
        let mut buf = Bytes::copy_from_slice(data);
        if buf.remaining() < 12 {
            return Err(Error::ErrRtpHeader);
        }
        let b0 = buf.get_u8();
        if (b0 >> 6) & 0x03 != 2 {
            return Err(Error::ErrRtpHeader);
        }
        let padding = b0 & 0x20 != 0;
        let has_extension = b0 & 0x10 != 0;
        let cc = (b0 & 0x0f) as usize;
        let b1 = buf.get_u8();
        let marker = b1 & 0x80 != 0;
        let payload_type = b1 & 0x7f;
        let sequence_number = buf.get_u16();
        let timestamp = buf.get_u32();
        let ssrc = buf.get_u32();
        if buf.remaining() < cc * 4 {
            return Err(Error::ErrRtpHeader);
        }
        let mut csrc = Vec::with_capacity(cc);
        for _ in 0..cc {
            csrc.push(buf.get_u32());
        }

        let mut extensions = Vec::new();
        if has_extension {
            if buf.remaining() < 4 {
                return Err(Error::ErrRtpHeader);
            }
            let profile = buf.get_u16();
            let words = buf.get_u16() as usize;
            if buf.remaining() < words * 4 {
                return Err(Error::ErrRtpHeader);
            }
            let mut ext = buf.split_to(words * 4);
            if profile == EXTENSION_PROFILE_ONE_BYTE {
                while ext.has_remaining() {
                    let b = ext.get_u8();
                    if b == 0 {
                        continue; // padding
                    }
                    let id = b >> 4;
                    let len = (b & 0x0f) as usize + 1;
                    if id == 0x0f || ext.remaining() < len {
                        break;
                    }
                    extensions.push((id, ext.split_to(len)));
                }
            }
        }

        let mut payload = buf;
        if padding && !payload.is_empty() {
            let pad = payload[payload.len() - 1] as usize;
            if pad <= payload.len() {
                payload.truncate(payload.len() - pad);
            }
        }
        Ok(RtpPacket {
            header: RtpHeader {
                padding: false,
                marker,
                payload_type,
                sequence_number,
                timestamp,
                ssrc,
                csrc,
                extensions,
            },
            payload,
        })
    }

    pub fn marshal(&self) -> Bytes {
        let h = &self.header;
        let has_extension = !h.extensions.is_empty();
        let mut buf = BytesMut::with_capacity(12 + self.payload.len() + 16);
        let mut b0 = 0x80u8;
        if has_extension {
            b0 |= 0x10;
        }
        b0 |= (h.csrc.len() as u8) & 0x0f;
        buf.put_u8(b0);
        buf.put_u8(if h.marker { 0x80 } else { 0 } | (h.payload_type & 0x7f));
        buf.put_u16(h.sequence_number);
        buf.put_u32(h.timestamp);
        buf.put_u32(h.ssrc);
        for c in &h.csrc {
            buf.put_u32(*c);
        }
        if has_extension {
            let mut ext = BytesMut::new();
            for (id, payload) in &h.extensions {
                if payload.is_empty() {
                    continue;
                }
                let len = payload.len().min(16);
                ext.put_u8((id << 4) | ((len - 1) as u8 & 0x0f));
                ext.put_slice(&payload[..len]);
            }
            while ext.len() % 4 != 0 {
                ext.put_u8(0);
            }
            buf.put_u16(EXTENSION_PROFILE_ONE_BYTE);
            buf.put_u16((ext.len() / 4) as u16);
            buf.put_slice(&ext);
        }
        buf.put_slice(&self.payload);
        buf.freeze()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_roundtrip_plain() {
        let pkt = RtpPacket {
            header: RtpHeader {
                marker: true,
                payload_type: 111,
                sequence_number: 1234,
                timestamp: 3000,
                ssrc: 0xdeadbeef,
                ..Default::default()
            },
            payload: Bytes::from_static(&[1, 2, 3, 4]),
        };
        let wire = pkt.marshal();
        assert_eq!(wire[0], 0x80);
        let parsed = RtpPacket::parse(&wire).unwrap();
        assert_eq!(parsed, pkt);
    }

    #[test]
    fn test_roundtrip_with_twcc_extension() {
        let mut pkt = RtpPacket {
            header: RtpHeader {
                payload_type: 96,
                sequence_number: 7,
                timestamp: 90_000,
                ssrc: 1,
                ..Default::default()
            },
            payload: Bytes::from_static(&[0xaa; 10]),
        };
        pkt.header
            .set_extension(3, Bytes::copy_from_slice(&42u16.to_be_bytes()));
        let wire = pkt.marshal();
        let parsed = RtpPacket::parse(&wire).unwrap();
        let twcc = parsed.header.extension(3).unwrap();
        assert_eq!(u16::from_be_bytes([twcc[0], twcc[1]]), 42);
    }

    #[test]
    fn test_parse_strips_padding() {
        let pkt = RtpPacket {
            header: RtpHeader {
                payload_type: 96,
                ssrc: 9,
                ..Default::default()
            },
            payload: Bytes::from_static(&[1, 2, 3]),
        };
        let mut wire = BytesMut::from(pkt.marshal().as_ref());
        wire[0] |= 0x20; // padding flag
        wire.put_slice(&[0, 0, 3]); // 3 bytes of padding
        let parsed = RtpPacket::parse(&wire).unwrap();
        assert_eq!(parsed.payload.as_ref(), &[1, 2, 3]);
    }

    #[test]
    fn test_rejects_short_and_bad_version() {
        assert!(RtpPacket::parse(&[0x80, 0, 0]).is_err());
        let bad = [0x40u8; 12];
        assert!(RtpPacket::parse(&bad).is_err());
    }
}
