//! STUN binding subset for ICE-lite: parse binding requests, answer with
//! XOR-MAPPED-ADDRESS, MESSAGE-INTEGRITY and FINGERPRINT.

use bytes::{Buf, BufMut, Bytes, BytesMut};
use crc::{Crc, CRC_32_ISO_HDLC};
use ring::hmac;
use shared::error::{Error, Result};
use std::net::SocketAddr;

pub const MAGIC_COOKIE: u32 = 0x2112_a442;
pub const BINDING_REQUEST: u16 = 0x0001;
pub const BINDING_RESPONSE: u16 = 0x0101;

const ATTR_USERNAME: u16 = 0x0006;
const ATTR_MESSAGE_INTEGRITY: u16 = 0x0008;
const ATTR_XOR_MAPPED_ADDRESS: u16 = 0x0020;
const ATTR_PRIORITY: u16 = 0x0024;
const ATTR_USE_CANDIDATE: u16 = 0x0025;
const ATTR_FINGERPRINT: u16 = 0x8028;
const ATTR_ICE_CONTROLLING: u16 = 0x802a;

const FINGERPRINT_XOR: u32 = 0x5354_554e;
const CRC32: Crc<u32> = Crc::<u32>::new(&CRC_32_ISO_HDLC);

/// A parsed STUN message, attributes kept raw by type.
#[derive(Debug, Clone)]
pub struct StunMessage {
    pub message_type: u16,
    pub transaction_id: [u8; 12],
    pub attributes: Vec<(u16, Bytes)>,
}

impl StunMessage {
    pub fn is_binding_request(&self) -> bool {
        self.message_type == BINDING_REQUEST
    }

    pub fn attribute(&self, attr: u16) -> Option<&Bytes> {
        self.attributes.iter().find(|(t, _)| *t == attr).map(|(_, v)| v)
    }

    /// The `local:remote` username pair of an ICE binding request.
    pub fn username(&self) -> Option<(String, String)> {
        let raw = self.attribute(ATTR_USERNAME)?;
        let s = std::str::from_utf8(raw).ok()?;
        let (local, remote) = s.split_once(':')?;
        Some((local.to_string(), remote.to_string()))
    }

    pub fn use_candidate(&self) -> bool {
        self.attribute(ATTR_USE_CANDIDATE).is_some()
    }

    pub fn parse(data: &[u8]) -> Result<StunMessage> {
        if data.len() < 20 {
            return Err(Error::ErrStunMessage);
        }
        let mut buf = Bytes::copy_from_slice(data);
        let message_type = buf.get_u16();
        let length = buf.get_u16() as usize;
        let cookie = buf.get_u32();
        if cookie != MAGIC_COOKIE {
            return Err(Error::ErrStunMessage);
        }
        let mut transaction_id = [0u8; 12];
        buf.copy_to_slice(&mut transaction_id);
        if buf.remaining() < length {
            return Err(Error::ErrStunMessage);
        }
        let mut attrs_buf = buf.split_to(length);
        let mut attributes = Vec::new();
        while attrs_buf.remaining() >= 4 {
            let attr_type = attrs_buf.get_u16();
            let attr_len = attrs_buf.get_u16() as usize;
            if attrs_buf.remaining() < attr_len {
                return Err(Error::ErrStunMessage);
            }
            let value = attrs_buf.split_to(attr_len);
            // Attributes pad to 32-bit boundaries.
            let pad = (4 - attr_len % 4) % 4;
            if attrs_buf.remaining() < pad {
                break;
            }
            attrs_buf.advance(pad);
            attributes.push((attr_type, value));
        }
        Ok(StunMessage {
            message_type,
            transaction_id,
            attributes,
        })
    }

    /// Verifies MESSAGE-INTEGRITY against the ICE password.
    pub fn check_integrity(&self, raw: &[u8], password: &str) -> Result<()> {
        let Some(mi) = self.attribute(ATTR_MESSAGE_INTEGRITY) else {
            return Err(Error::ErrStunIntegrity);
        };
        // The HMAC covers the header (with length rewritten to end at the
        // integrity attribute) plus everything before it.
        let mi_offset = find_attribute_offset(raw, ATTR_MESSAGE_INTEGRITY)
            .ok_or(Error::ErrStunIntegrity)?;
        let adjusted_len = (mi_offset - 20 + 4 + 20) as u16;
        let mut covered = raw[..mi_offset].to_vec();
        covered[2..4].copy_from_slice(&adjusted_len.to_be_bytes());

        let key = hmac::Key::new(hmac::HMAC_SHA1_FOR_LEGACY_USE_ONLY, password.as_bytes());
        let tag = hmac::sign(&key, &covered);
        if tag.as_ref() != mi.as_ref() {
            return Err(Error::ErrStunIntegrity);
        }
        Ok(())
    }
}

fn find_attribute_offset(raw: &[u8], wanted: u16) -> Option<usize> {
    let mut i = 20usize;
    while i + 4 <= raw.len() {
        let t = u16::from_be_bytes([raw[i], raw[i + 1]]);
        let l = u16::from_be_bytes([raw[i + 2], raw[i + 3]]) as usize;
        if t == wanted {
            return Some(i);
        }
        i += 4 + l + (4 - l % 4) % 4;
    }
    None
}

/// Builds a binding success response with XOR-MAPPED-ADDRESS, integrity and
/// fingerprint.
pub fn binding_response(
    transaction_id: &[u8; 12],
    mapped: SocketAddr,
    password: &str,
) -> Bytes {
    let mut attrs = BytesMut::new();

    // XOR-MAPPED-ADDRESS.
    let mut xor = BytesMut::new();
    match mapped {
        SocketAddr::V4(v4) => {
            xor.put_u8(0);
            xor.put_u8(0x01);
            xor.put_u16(v4.port() ^ (MAGIC_COOKIE >> 16) as u16);
            let ip = u32::from_be_bytes(v4.ip().octets()) ^ MAGIC_COOKIE;
            xor.put_u32(ip);
        }
        SocketAddr::V6(v6) => {
            xor.put_u8(0);
            xor.put_u8(0x02);
            xor.put_u16(v6.port() ^ (MAGIC_COOKIE >> 16) as u16);
            let octets = v6.ip().octets();
            let mut xored = [0u8; 16];
            let cookie = MAGIC_COOKIE.to_be_bytes();
            for (i, b) in octets.iter().enumerate() {
                let mask = if i < 4 { cookie[i] } else { transaction_id[i - 4] };
                xored[i] = b ^ mask;
            }
            xor.put_slice(&xored);
        }
    }
    put_attribute(&mut attrs, ATTR_XOR_MAPPED_ADDRESS, &xor);

    // Header with room for MESSAGE-INTEGRITY when we compute its HMAC.
    let mi_len = attrs.len() + 4 + 20;
    let mut msg = BytesMut::new();
    msg.put_u16(BINDING_RESPONSE);
    msg.put_u16(mi_len as u16);
    msg.put_u32(MAGIC_COOKIE);
    msg.put_slice(transaction_id);
    msg.put_slice(&attrs);

    let key = hmac::Key::new(hmac::HMAC_SHA1_FOR_LEGACY_USE_ONLY, password.as_bytes());
    let tag = hmac::sign(&key, &msg);
    put_attribute(&mut msg, ATTR_MESSAGE_INTEGRITY, tag.as_ref());

    // Fingerprint covers everything, with the length including itself.
    let final_len = (msg.len() - 20 + 8) as u16;
    msg[2..4].copy_from_slice(&final_len.to_be_bytes());
    let crc = CRC32.checksum(&msg) ^ FINGERPRINT_XOR;
    put_attribute(&mut msg, ATTR_FINGERPRINT, &crc.to_be_bytes());

    msg.freeze()
}

/// Builds a binding request for the keepalive/renomination probes we send.
pub fn binding_request(username: &str, password: &str, transaction_id: &[u8; 12]) -> Bytes {
    let mut attrs = BytesMut::new();
    put_attribute(&mut attrs, ATTR_USERNAME, username.as_bytes());
    put_attribute(&mut attrs, ATTR_ICE_CONTROLLING, &rand::random::<u64>().to_be_bytes());
    put_attribute(&mut attrs, ATTR_PRIORITY, &0x7e00_0000u32.to_be_bytes());

    let mi_len = attrs.len() + 4 + 20;
    let mut msg = BytesMut::new();
    msg.put_u16(BINDING_REQUEST);
    msg.put_u16(mi_len as u16);
    msg.put_u32(MAGIC_COOKIE);
    msg.put_slice(transaction_id);
    msg.put_slice(&attrs);

    let key = hmac::Key::new(hmac::HMAC_SHA1_FOR_LEGACY_USE_ONLY, password.as_bytes());
    let tag = hmac::sign(&key, &msg);
    put_attribute(&mut msg, ATTR_MESSAGE_INTEGRITY, tag.as_ref());

    let final_len = (msg.len() - 20 + 8) as u16;
    msg[2..4].copy_from_slice(&final_len.to_be_bytes());
    let crc = CRC32.checksum(&msg) ^ FINGERPRINT_XOR;
    put_attribute(&mut msg, ATTR_FINGERPRINT, &crc.to_be_bytes());
    msg.freeze()
}

fn put_attribute(buf: &mut BytesMut, attr_type: u16, value: &[u8]) {
    buf.put_u16(attr_type);
    buf.put_u16(value.len() as u16);
    buf.put_slice(value);
    let pad = (4 - value.len() % 4) % 4;
    for _ in 0..pad {
        buf.put_u8(0);
    }
}
