//! SRTP/SRTCP with AEAD_AES_128_GCM (RFC 7714), keyed from the DTLS
//! exporter.

use aes_gcm::aead::{Aead, Payload};
use aes_gcm::{Aes128Gcm, Key, KeyInit, Nonce};
use bytes::{BufMut, Bytes, BytesMut};
use shared::error::{Error, Result};
use std::collections::HashMap;

const GCM_TAG_LEN: usize = 16;
const REPLAY_WINDOW: u64 = 64;

#[derive(Default)]
struct RocState {
    started: bool,
    roc: u32,
    last_seq: u16,
}

impl RocState {
    /// Rollover-counter estimate for an incoming sequence number.
    fn update(&mut self, seq: u16) -> u32 {
        if !self.started {
            self.started = true;
            self.last_seq = seq;
            return self.roc;
        }
        let delta = seq.wrapping_sub(self.last_seq);
        if delta < 0x8000 {
            if seq < self.last_seq {
                self.roc = self.roc.wrapping_add(1);
            }
            self.last_seq = seq;
            self.roc
        } else {
            // Reordered packet from before a rollover.
            if seq > self.last_seq {
                self.roc.wrapping_sub(1)
            } else {
                self.roc
            }
        }
    }
}

#[derive(Default)]
struct ReplayWindow {
    highest: u64,
    bitmap: u64,
}

impl ReplayWindow {
    fn check_and_set(&mut self, index: u64) -> Result<()> {
        if index > self.highest {
            let shift = index - self.highest;
            self.bitmap = if shift >= REPLAY_WINDOW {
                1
            } else {
                (self.bitmap << shift) | 1
            };
            self.highest = index;
            return Ok(());
        }
        let offset = self.highest - index;
        if offset >= REPLAY_WINDOW {
            return Err(Error::ErrSrtpReplay);
        }
        if self.bitmap & (1 << offset) != 0 {
            return Err(Error::ErrSrtpReplay);
        }
        self.bitmap |= 1 << offset;
        Ok(())
    }
}

/// One direction of SRTP protection.
pub struct SrtpContext {
    cipher: Aes128Gcm,
    salt: [u8; 12],
    rocs: HashMap<u32, RocState>,
    replay: HashMap<u32, ReplayWindow>,
    srtcp_index: u32,
    srtcp_replay: ReplayWindow,
}

impl SrtpContext {
    pub fn new(key: [u8; 16], salt: [u8; 12]) -> Self {
        Self {
            cipher: Aes128Gcm::new(Key::<Aes128Gcm>::from_slice(&key)),
            salt,
            rocs: HashMap::new(),
            replay: HashMap::new(),
            srtcp_index: 0,
            srtcp_replay: ReplayWindow::default(),
        }
    }

    fn rtp_iv(&self, ssrc: u32, roc: u32, seq: u16) -> [u8; 12] {
        let mut iv = [0u8; 12];
        iv[2..6].copy_from_slice(&ssrc.to_be_bytes());
        iv[6..10].copy_from_slice(&roc.to_be_bytes());
        iv[10..12].copy_from_slice(&seq.to_be_bytes());
        for (i, b) in iv.iter_mut().enumerate() {
            *b ^= self.salt[i];
        }
        iv
    }

    fn rtcp_iv(&self, ssrc: u32, index: u32) -> [u8; 12] {
        let mut iv = [0u8; 12];
        iv[2..6].copy_from_slice(&ssrc.to_be_bytes());
        iv[8..12].copy_from_slice(&index.to_be_bytes());
        for (i, b) in iv.iter_mut().enumerate() {
            *b ^= self.salt[i];
        }
        iv
    }

    /// Encrypts an RTP packet in sender direction.
    pub fn protect_rtp(&mut self, packet: &[u8]) -> Result<Bytes> {
        let header_len = rtp_header_len(packet)?;
        let ssrc = u32::from_be_bytes([packet[8], packet[9], packet[10], packet[11]]);
        let seq = u16::from_be_bytes([packet[2], packet[3]]);
        let roc = self.rocs.entry(ssrc).or_default().update(seq);
        let iv = self.rtp_iv(ssrc, roc, seq);

        let ciphertext = self
            .cipher
            .encrypt(
                Nonce::from_slice(&iv),
                Payload {
                    msg: &packet[header_len..],
                    aad: &packet[..header_len],
                },
            )
            .map_err(|_| Error::ErrSrtpUnprotect)?;

        let mut out = BytesMut::with_capacity(header_len + ciphertext.len());
        out.put_slice(&packet[..header_len]);
        out.put_slice(&ciphertext);
        Ok(out.freeze())
    }

    /// Decrypts an SRTP packet; authentication or replay failure is fatal
    /// for the session.
    pub fn unprotect_rtp(&mut self, packet: &[u8]) -> Result<Bytes> {
        let header_len = rtp_header_len(packet)?;
        if packet.len() < header_len + GCM_TAG_LEN {
            return Err(Error::ErrSrtpUnprotect);
        }
        let ssrc = u32::from_be_bytes([packet[8], packet[9], packet[10], packet[11]]);
        let seq = u16::from_be_bytes([packet[2], packet[3]]);
        let roc = self.rocs.entry(ssrc).or_default().update(seq);
        let iv = self.rtp_iv(ssrc, roc, seq);

        let index = ((roc as u64) << 16) | seq as u64;
        self.replay
            .entry(ssrc)
            .or_default()
            .check_and_set(index)?;

        let plaintext = self
            .cipher
            .decrypt(
                Nonce::from_slice(&iv),
                Payload {
                    msg: &packet[header_len..],
                    aad: &packet[..header_len],
                },
            )
            .map_err(|_| Error::ErrSrtpUnprotect)?;

        let mut out = BytesMut::with_capacity(header_len + plaintext.len());
        out.put_slice(&packet[..header_len]);
        out.put_slice(&plaintext);
        Ok(out.freeze())
    }

    /// Encrypts an RTCP compound; the E-flag and index trail the packet.
    pub fn protect_rtcp(&mut self, packet: &[u8]) -> Result<Bytes> {
        if packet.len() < 8 {
            return Err(Error::ErrRtcpPacket);
        }
        self.srtcp_index = (self.srtcp_index + 1) & 0x7fff_ffff;
        let index = self.srtcp_index;
        let ssrc = u32::from_be_bytes([packet[4], packet[5], packet[6], packet[7]]);
        let iv = self.rtcp_iv(ssrc, index);

        let trailer = 0x8000_0000u32 | index;
        let mut aad = Vec::with_capacity(12);
        aad.extend_from_slice(&packet[..8]);
        aad.extend_from_slice(&trailer.to_be_bytes());

        let ciphertext = self
            .cipher
            .encrypt(
                Nonce::from_slice(&iv),
                Payload {
                    msg: &packet[8..],
                    aad: &aad,
                },
            )
            .map_err(|_| Error::ErrSrtpUnprotect)?;

        let mut out = BytesMut::with_capacity(8 + ciphertext.len() + 4);
        out.put_slice(&packet[..8]);
        out.put_slice(&ciphertext);
        out.put_u32(trailer);
        Ok(out.freeze())
    }

    pub fn unprotect_rtcp(&mut self, packet: &[u8]) -> Result<Bytes> {
        if packet.len() < 8 + GCM_TAG_LEN + 4 {
            return Err(Error::ErrSrtpUnprotect);
        }
        let trailer_at = packet.len() - 4;
        let trailer = u32::from_be_bytes([
            packet[trailer_at],
            packet[trailer_at + 1],
            packet[trailer_at + 2],
            packet[trailer_at + 3],
        ]);
        if trailer & 0x8000_0000 == 0 {
            // Unencrypted SRTCP is not accepted on this profile.
            return Err(Error::ErrSrtpUnprotect);
        }
        let index = trailer & 0x7fff_ffff;
        self.srtcp_replay.check_and_set(index as u64)?;
        let ssrc = u32::from_be_bytes([packet[4], packet[5], packet[6], packet[7]]);
        let iv = self.rtcp_iv(ssrc, index);

        let mut aad = Vec::with_capacity(12);
        aad.extend_from_slice(&packet[..8]);
        aad.extend_from_slice(&trailer.to_be_bytes());

        let plaintext = self
            .cipher
            .decrypt(
                Nonce::from_slice(&iv),
                Payload {
                    msg: &packet[8..trailer_at],
                    aad: &aad,
                },
            )
            .map_err(|_| Error::ErrSrtpUnprotect)?;

        let mut out = BytesMut::with_capacity(8 + plaintext.len());
        out.put_slice(&packet[..8]);
        out.put_slice(&plaintext);
        Ok(out.freeze())
    }
}

/// Bytes before the payload: fixed header, CSRCs and any extension block.
fn rtp_header_len(packet: &[u8]) -> Result<usize> {
    if packet.len() < 12 {
        return Err(Error::ErrRtpHeader);
    }
    let cc = (packet[0] & 0x0f) as usize;
    let mut len = 12 + cc * 4;
    if packet[0] & 0x10 != 0 {
        if packet.len() < len + 4 {
            return Err(Error::ErrRtpHeader);
        }
        let words = u16::from_be_bytes([packet[len + 2], packet[len + 3]]) as usize;
        len += 4 + words * 4;
    }
    if packet.len() < len {
        return Err(Error::ErrRtpHeader);
    }
    Ok(len)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::rtp::{RtpHeader, RtpPacket};

    fn sample_rtp(seq: u16) -> Bytes {
        RtpPacket {
            header: RtpHeader {
                payload_type: 96,
                sequence_number: seq,
                timestamp: 1234,
                ssrc: 0x1020_3040,
                ..Default::default()
            },
            payload: Bytes::from_static(b"media payload"),
        }
        .marshal()
    }

    fn pair() -> (SrtpContext, SrtpContext) {
        let key = [7u8; 16];
        let salt = [3u8; 12];
        (SrtpContext::new(key, salt), SrtpContext::new(key, salt))
    }

    #[test]
    fn test_rtp_roundtrip() {
        let (mut tx, mut rx) = pair();
        let plain = sample_rtp(100);
        let protected = tx.protect_rtp(&plain).unwrap();
        assert_ne!(protected, plain);
        assert_eq!(protected.len(), plain.len() + GCM_TAG_LEN);
        let unprotected = rx.unprotect_rtp(&protected).unwrap();
        assert_eq!(unprotected, plain);
    }

    #[test]
    fn test_tampered_packet_fails_auth() {
        let (mut tx, mut rx) = pair();
        let mut protected = tx.protect_rtp(&sample_rtp(1)).unwrap().to_vec();
        let last = protected.len() - 1;
        protected[last] ^= 0xff;
        assert_eq!(
            rx.unprotect_rtp(&protected).unwrap_err(),
            Error::ErrSrtpUnprotect
        );
    }

    #[test]
    fn test_replay_rejected() {
        let (mut tx, mut rx) = pair();
        let protected = tx.protect_rtp(&sample_rtp(5)).unwrap();
        rx.unprotect_rtp(&protected).unwrap();
        assert_eq!(
            rx.unprotect_rtp(&protected).unwrap_err(),
            Error::ErrSrtpReplay
        );
    }

    #[test]
    fn test_seq_rollover_keeps_decrypting() {
        let (mut tx, mut rx) = pair();
        for seq in [65534u16, 65535, 0, 1] {
            let protected = tx.protect_rtp(&sample_rtp(seq)).unwrap();
            let plain = rx.unprotect_rtp(&protected).unwrap();
            let parsed = RtpPacket::parse(&plain).unwrap();
            assert_eq!(parsed.header.sequence_number, seq);
        }
        // The rollover counter advanced in both directions.
        assert_eq!(tx.rocs.get(&0x1020_3040).unwrap().roc, 1);
        assert_eq!(rx.rocs.get(&0x1020_3040).unwrap().roc, 1);
    }

    #[test]
    fn test_rtcp_roundtrip() {
        let (mut tx, mut rx) = pair();
        let rr = crate::rtcp::marshal_receiver_report(0xabcd);
        let protected = tx.protect_rtcp(&rr).unwrap();
        let unprotected = rx.unprotect_rtcp(&protected).unwrap();
        assert_eq!(unprotected, rr);
    }

    #[test]
    fn test_rtcp_replay_rejected() {
        let (mut tx, mut rx) = pair();
        let rr = crate::rtcp::marshal_receiver_report(1);
        let protected = tx.protect_rtcp(&rr).unwrap();
        rx.unprotect_rtcp(&protected).unwrap();
        assert_eq!(
            rx.unprotect_rtcp(&protected).unwrap_err(),
            Error::ErrSrtpReplay
        );
    }
}
