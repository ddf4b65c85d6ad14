//! SDP offer/answer for the bundled, rtcp-mux WebRTC surface.

use shared::error::{Error, Result};
use std::fmt::Write as _;

/// DTLS role negotiation per the actpass rule: an `actpass` offer is
/// answered `passive` by default, keeping the server as the DTLS server.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DtlsSetup {
    ActPass,
    Active,
    Passive,
}

impl DtlsSetup {
    pub fn parse(s: &str) -> Result<DtlsSetup> {
        match s {
            "actpass" => Ok(DtlsSetup::ActPass),
            "active" => Ok(DtlsSetup::Active),
            "passive" => Ok(DtlsSetup::Passive),
            other => Err(Error::ErrSdpLine(format!("setup:{}", other))),
        }
    }

    /// Our answer to the peer's offered setup.
    pub fn answer_to(offered: DtlsSetup) -> DtlsSetup {
        match offered {
            DtlsSetup::ActPass | DtlsSetup::Active => DtlsSetup::Passive,
            DtlsSetup::Passive => DtlsSetup::Active,
        }
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            DtlsSetup::ActPass => "actpass",
            DtlsSetup::Active => "active",
            DtlsSetup::Passive => "passive",
        }
    }
}

#[derive(Debug, Clone, PartialEq)]
pub struct PayloadType {
    pub pt: u8,
    pub codec: String,
    pub clock: u32,
    pub channels: u8,
    pub rtcp_fb: Vec<String>,
}

#[derive(Debug, Clone, Default)]
pub struct MediaDesc {
    /// "audio" or "video".
    pub kind: String,
    pub mid: String,
    pub payloads: Vec<PayloadType>,
    pub ssrc: Option<u32>,
    /// TWCC header-extension id, from `a=extmap`.
    pub twcc_id: Option<u8>,
    pub direction: String,
}

/// The session-level fields the engine cares about plus its media lines.
#[derive(Debug, Clone, Default)]
pub struct RtcSdp {
    pub ice_ufrag: String,
    pub ice_pwd: String,
    /// sha-256 fingerprint, colon-hex.
    pub fingerprint: String,
    pub setup: Option<DtlsSetup>,
    pub media: Vec<MediaDesc>,
}

impl RtcSdp {
    pub fn parse(s: &str) -> Result<RtcSdp> {
        let mut sdp = RtcSdp::default();
        let mut current: Option<MediaDesc> = None;
        for line in s.lines() {
            let line = line.trim_end();
            if line.len() < 2 {
                continue;
            }
            let (kind, value) = line.split_at(2);
            match kind {
                "m=" => {
                    if let Some(m) = current.take() {
                        sdp.media.push(m);
                    }
                    let mut desc = MediaDesc::default();
                    desc.kind = value.split(' ').next().unwrap_or_default().to_string();
                    current = Some(desc);
                }
                "a=" => Self::parse_attribute(value, &mut sdp, &mut current)?,
                _ => {}
            }
        }
        if let Some(m) = current.take() {
            sdp.media.push(m);
        }
        Ok(sdp)
    }

    fn parse_attribute(
        value: &str,
        sdp: &mut RtcSdp,
        current: &mut Option<MediaDesc>,
    ) -> Result<()> {
        let (name, rest) = match value.split_once(':') {
            Some((n, r)) => (n, r),
            None => (value, ""),
        };
        match name {
            "ice-ufrag" => sdp.ice_ufrag = rest.to_string(),
            "ice-pwd" => sdp.ice_pwd = rest.to_string(),
            "fingerprint" => {
                if let Some((algo, fp)) = rest.split_once(' ') {
                    if algo.eq_ignore_ascii_case("sha-256") {
                        sdp.fingerprint = fp.to_lowercase();
                    }
                }
            }
            "setup" => sdp.setup = Some(DtlsSetup::parse(rest)?),
            "mid" => {
                if let Some(m) = current {
                    m.mid = rest.to_string();
                }
            }
            "rtpmap" => {
                if let Some(m) = current {
                    // e.g. "111 opus/48000/2"
                    let mut parts = rest.splitn(2, ' ');
                    let pt: u8 = parts.next().unwrap_or("0").parse().unwrap_or(0);
                    let spec = parts.next().unwrap_or_default();
                    let mut spec_parts = spec.split('/');
                    let codec = spec_parts.next().unwrap_or_default().to_string();
                    let clock = spec_parts.next().and_then(|c| c.parse().ok()).unwrap_or(0);
                    let channels = spec_parts.next().and_then(|c| c.parse().ok()).unwrap_or(1);
                    m.payloads.push(PayloadType {
                        pt,
                        codec,
                        clock,
                        channels,
                        rtcp_fb: Vec::new(),
                    });
                }
            }
            "rtcp-fb" => {
                if let Some(m) = current {
                    if let Some((pt_s, fb)) = rest.split_once(' ') {
                        if let Ok(pt) = pt_s.parse::<u8>() {
                            if let Some(p) = m.payloads.iter_mut().find(|p| p.pt == pt) {
                                p.rtcp_fb.push(fb.to_string());
                            }
                        }
                    }
                }
            }
            "extmap" => {
                if let Some(m) = current {
                    if let Some((id_s, uri)) = rest.split_once(' ') {
                        if uri.contains("transport-wide-cc") {
                            m.twcc_id = id_s.parse().ok();
                        }
                    }
                }
            }
            "ssrc" => {
                if let Some(m) = current {
                    if m.ssrc.is_none() {
                        m.ssrc = rest.split(' ').next().and_then(|v| v.parse().ok());
                    }
                }
            }
            "sendonly" | "recvonly" | "sendrecv" => {
                if let Some(m) = current {
                    m.direction = name.to_string();
                }
            }
            _ => {}
        }
        Ok(())
    }

    /// Serializes an answer/offer with bundle, rtcp-mux and rtcp-rsize.
    pub fn marshal(&self, session_id: u64, candidate: Option<(&str, u16)>) -> String {
        let mut out = String::new();
        let _ = writeln!(out, "v=0");
        let _ = writeln!(out, "o=- {} 2 IN IP4 127.0.0.1", session_id);
        let _ = writeln!(out, "s=OriginMediaServer");
        let _ = writeln!(out, "t=0 0");
        let mids: Vec<&str> = self.media.iter().map(|m| m.mid.as_str()).collect();
        let _ = writeln!(out, "a=group:BUNDLE {}", mids.join(" "));
        let _ = writeln!(out, "a=msid-semantic: WMS live");
        for m in &self.media {
            let pts: Vec<String> = m.payloads.iter().map(|p| p.pt.to_string()).collect();
            let _ = writeln!(out, "m={} 9 UDP/TLS/RTP/SAVPF {}", m.kind, pts.join(" "));
            let _ = writeln!(out, "c=IN IP4 0.0.0.0");
            let _ = writeln!(out, "a=rtcp:9 IN IP4 0.0.0.0");
            let _ = writeln!(out, "a=ice-ufrag:{}", self.ice_ufrag);
            let _ = writeln!(out, "a=ice-pwd:{}", self.ice_pwd);
            let _ = writeln!(out, "a=fingerprint:sha-256 {}", self.fingerprint);
            if let Some(setup) = self.setup {
                let _ = writeln!(out, "a=setup:{}", setup.as_str());
            }
            let _ = writeln!(out, "a=mid:{}", m.mid);
            if !m.direction.is_empty() {
                let _ = writeln!(out, "a={}", m.direction);
            }
            let _ = writeln!(out, "a=rtcp-mux");
            let _ = writeln!(out, "a=rtcp-rsize");
            if let Some(id) = m.twcc_id {
                let _ = writeln!(
                    out,
                    "a=extmap:{} http://www.ietf.org/id/draft-holmer-rmcat-transport-wide-cc-extensions-01",
                    id
                );
            }
            for p in &m.payloads {
                if p.channels > 1 {
                    let _ = writeln!(out, "a=rtpmap:{} {}/{}/{}", p.pt, p.codec, p.clock, p.channels);
                } else {
                    let _ = writeln!(out, "a=rtpmap:{} {}/{}", p.pt, p.codec, p.clock);
                }
                for fb in &p.rtcp_fb {
                    let _ = writeln!(out, "a=rtcp-fb:{} {}", p.pt, fb);
                }
            }
            if let Some(ssrc) = m.ssrc {
                let _ = writeln!(out, "a=ssrc:{} cname:origin", ssrc);
            }
            if let Some((ip, port)) = candidate {
                let _ = writeln!(
                    out,
                    "a=candidate:0 1 udp 2130706431 {} {} typ host generation 0",
                    ip, port
                );
            }
        }
        out
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    const OFFER: &str = "v=0\r\n\
o=- 4611731400430051336 2 IN IP4 127.0.0.1\r\n\
s=-\r\n\
t=0 0\r\n\
a=group:BUNDLE 0 1\r\n\
m=audio 9 UDP/TLS/RTP/SAVPF 111\r\n\
a=mid:0\r\n\
a=ice-ufrag:EsAw\r\n\
a=ice-pwd:P2uYro0UCOQ4zxjKXaWCBui1\r\n\
a=fingerprint:sha-256 D2:FA:0E:C3:22:59:5E:14:95:69:92:3D:13:B4:84:24:2C:C2:A2:C0:3E:FD:34:8E:5E:EA:6F:AF:52:CE:E6:0F\r\n\
a=setup:actpass\r\n\
a=rtpmap:111 opus/48000/2\r\n\
a=sendonly\r\n\
m=video 9 UDP/TLS/RTP/SAVPF 102\r\n\
a=mid:1\r\n\
a=rtpmap:102 H264/90000\r\n\
a=rtcp-fb:102 nack\r\n\
a=rtcp-fb:102 nack pli\r\n\
a=rtcp-fb:102 transport-cc\r\n\
a=extmap:3 http://www.ietf.org/id/draft-holmer-rmcat-transport-wide-cc-extensions-01\r\n\
a=ssrc:1879696119 cname:x\r\n";

    #[test]
    fn test_parse_offer() {
        let sdp = RtcSdp::parse(OFFER).unwrap();
        assert_eq!(sdp.ice_ufrag, "EsAw");
        assert_eq!(sdp.setup, Some(DtlsSetup::ActPass));
        assert!(sdp.fingerprint.starts_with("d2:fa:0e"));
        assert_eq!(sdp.media.len(), 2);

        let audio = &sdp.media[0];
        assert_eq!(audio.kind, "audio");
        assert_eq!(audio.payloads[0].codec, "opus");
        assert_eq!(audio.payloads[0].clock, 48000);
        assert_eq!(audio.payloads[0].channels, 2);
        assert_eq!(audio.direction, "sendonly");

        let video = &sdp.media[1];
        assert_eq!(video.twcc_id, Some(3));
        assert_eq!(video.ssrc, Some(1_879_696_119));
        assert!(video.payloads[0].rtcp_fb.contains(&"nack pli".to_string()));
    }

    #[test]
    fn test_setup_negotiation_rule() {
        assert_eq!(DtlsSetup::answer_to(DtlsSetup::ActPass), DtlsSetup::Passive);
        assert_eq!(DtlsSetup::answer_to(DtlsSetup::Active), DtlsSetup::Passive);
        assert_eq!(DtlsSetup::answer_to(DtlsSetup::Passive), DtlsSetup::Active);
    }

    #[test]
    fn test_marshal_roundtrip() {
        let mut sdp = RtcSdp::parse(OFFER).unwrap();
        sdp.setup = Some(DtlsSetup::Passive);
        sdp.fingerprint = "ab:cd".to_string();
        let text = sdp.marshal(1, Some(("192.0.2.1", 8000)));
        assert!(text.contains("a=group:BUNDLE 0 1"));
        assert!(text.contains("a=setup:passive"));
        assert!(text.contains("a=rtcp-mux"));
        assert!(text.contains("a=rtcp-rsize"));
        assert!(text.contains("a=candidate:0 1 udp"));
        let parsed = RtcSdp::parse(&text).unwrap();
        assert_eq!(parsed.media.len(), 2);
        assert_eq!(parsed.media[1].twcc_id, Some(3));
    }
}
