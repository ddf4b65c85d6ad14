//! Byte sniffing at the UDP receive boundary.

/// What a received datagram is, before any parsing.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PacketKind {
    Stun,
    Dtls,
    Rtp,
    Rtcp,
    Unknown,
}

/// Classifies by the first bytes only; cheap enough for every datagram.
pub fn classify(data: &[u8]) -> PacketKind {
    let Some(&b0) = data.first() else {
        return PacketKind::Unknown;
    };
    if b0 == 0x00 || b0 == 0x01 {
        return PacketKind::Stun;
    }
    if data.len() >= 13 && b0 > 19 && b0 < 64 {
        return PacketKind::Dtls;
    }
    if b0 & 0xc0 == 0x80 {
        // RTCP payload types occupy [192, 223] in the second byte.
        let b1 = data.get(1).copied().unwrap_or(0);
        if (192..=223).contains(&b1) {
            return PacketKind::Rtcp;
        }
        return PacketKind::Rtp;
    }
    PacketKind::Unknown
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_stun_first_bytes() {
        assert_eq!(classify(&[0x00, 0x01, 0, 0]), PacketKind::Stun);
        assert_eq!(classify(&[0x01, 0x01, 0, 0]), PacketKind::Stun);
    }

    #[test]
    fn test_dtls_range_and_length() {
        let mut pkt = vec![22u8; 13];
        assert_eq!(classify(&pkt), PacketKind::Dtls);
        pkt.truncate(12); // too short for a record header
        assert_eq!(classify(&pkt), PacketKind::Unknown);
        assert_eq!(classify(&[19u8; 13]), PacketKind::Unknown);
        assert_eq!(classify(&[63u8; 13]), PacketKind::Dtls);
        assert_eq!(classify(&[64u8; 13]), PacketKind::Unknown);
    }

    #[test]
    fn test_rtp_vs_rtcp() {
        // Version 2, payload type 111 → RTP.
        assert_eq!(classify(&[0x80, 111, 0, 0]), PacketKind::Rtp);
        // Version 2, packet type 200 (SR) → RTCP.
        assert_eq!(classify(&[0x80, 200, 0, 0]), PacketKind::Rtcp);
        assert_eq!(classify(&[0x81, 205, 0, 0]), PacketKind::Rtcp);
        // Marker bit set on RTP: second byte 0xe0+ is still < 192.
        assert_eq!(classify(&[0x80, 0xe0 & 0x7f, 0, 0]), PacketKind::Rtp);
    }

    #[test]
    fn test_garbage() {
        assert_eq!(classify(&[]), PacketKind::Unknown);
        assert_eq!(classify(&[0x47, 0, 0]), PacketKind::Unknown);
    }
}
