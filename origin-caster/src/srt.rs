//! Minimal SRT framing for MPEG-TS ingest: caller-listener handshake
//! (induction/conclusion with cookie), data passthrough, keepalive and
//! shutdown. Encryption is negotiated away: a peer demanding crypto is
//! rejected unless the configured passphrase discipline allows it.

use bytes::{Buf, BufMut, Bytes, BytesMut};
use shared::error::{Error, Result};
use std::collections::HashMap;
use std::net::SocketAddr;
use std::time::{Duration, Instant};

pub const SRT_VERSION_4: u32 = 0x0004_0000;
pub const SRT_VERSION_5: u32 = 0x0005_0000;
/// Magic riding the encryption field of an induction response.
pub const SRT_MAGIC: u16 = 0x4a17;

pub const HS_TYPE_INDUCTION: u32 = 0x0000_0001;
pub const HS_TYPE_CONCLUSION: u32 = 0xffff_ffff;
/// Rejection family base (SRT_REJ_*).
pub const HS_TYPE_REJECT: u32 = 0x0000_03e8;

const CTRL_HANDSHAKE: u16 = 0x0000;
const CTRL_KEEPALIVE: u16 = 0x0001;
const CTRL_ACK: u16 = 0x0002;
const CTRL_SHUTDOWN: u16 = 0x0005;

const EXT_TYPE_HSREQ: u16 = 1;
const EXT_TYPE_HSRSP: u16 = 2;
const EXT_TYPE_KMREQ: u16 = 3;
const EXT_TYPE_SID: u16 = 5;

/// Lite ACK cadence, in data packets.
const ACK_EVERY: u64 = 64;

/// Typed socket options; the ranges match the library contract.
#[derive(Debug, Clone)]
pub struct SrtOptions {
    pub latency_ms: u32,
    pub passphrase: Option<String>,
    pub pbkeylen: u8,
    pub peer_idle_timeout: Duration,
}

impl Default for SrtOptions {
    fn default() -> Self {
        Self {
            latency_ms: 120,
            passphrase: None,
            pbkeylen: 0,
            peer_idle_timeout: Duration::from_secs(10),
        }
    }
}

impl SrtOptions {
    pub fn set_latency_ms(&mut self, v: u32) -> Result<()> {
        self.latency_ms = v;
        Ok(())
    }

    pub fn set_passphrase(&mut self, v: &str) -> Result<()> {
        if !v.is_empty() && !(10..=79).contains(&v.len()) {
            return Err(Error::ErrConfigInvalid("srt passphrase length".to_string()));
        }
        self.passphrase = if v.is_empty() {
            None
        } else {
            Some(v.to_string())
        };
        Ok(())
    }

    pub fn set_pbkeylen(&mut self, v: u8) -> Result<()> {
        if ![0, 16, 24, 32].contains(&v) {
            return Err(Error::ErrConfigInvalid("srt pbkeylen".to_string()));
        }
        self.pbkeylen = v;
        Ok(())
    }

    pub fn set_peer_idle_timeout(&mut self, v: Duration) -> Result<()> {
        self.peer_idle_timeout = v;
        Ok(())
    }
}

#[derive(Debug, Clone, PartialEq)]
pub struct HandshakePacket {
    pub version: u32,
    pub encryption: u16,
    pub extension: u16,
    pub init_seq: u32,
    pub mtu: u32,
    pub flow_window: u32,
    pub hs_type: u32,
    pub socket_id: u32,
    pub syn_cookie: u32,
    pub peer_ip: [u8; 16],
    pub extensions: Vec<(u16, Bytes)>,
}

impl HandshakePacket {
    fn parse(mut buf: Bytes) -> Result<HandshakePacket> {
        if buf.remaining() < 48 {
            return Err(Error::ErrSrtPacket);
        }
        let version = buf.get_u32();
        let encryption = buf.get_u16();
        let extension = buf.get_u16();
        let init_seq = buf.get_u32();
        let mtu = buf.get_u32();
        let flow_window = buf.get_u32();
        let hs_type = buf.get_u32();
        let socket_id = buf.get_u32();
        let syn_cookie = buf.get_u32();
        let mut peer_ip = [0u8; 16];
        buf.copy_to_slice(&mut peer_ip);
        let mut extensions = Vec::new();
        while buf.remaining() >= 4 {
            let ext_type = buf.get_u16();
            let len_words = buf.get_u16() as usize;
            if buf.remaining() < len_words * 4 {
                return Err(Error::ErrSrtPacket);
            }
            extensions.push((ext_type, buf.split_to(len_words * 4)));
        }
        Ok(HandshakePacket {
            version,
            encryption,
            extension,
            init_seq,
            mtu,
            flow_window,
            hs_type,
            socket_id,
            syn_cookie,
            peer_ip,
            extensions,
        })
    }

    fn serialize(&self, dst_socket_id: u32) -> Bytes {
        let mut buf = BytesMut::with_capacity(64);
        buf.put_u16(0x8000 | CTRL_HANDSHAKE);
        buf.put_u16(0); // subtype
        buf.put_u32(0); // type-specific
        buf.put_u32(0); // timestamp
        buf.put_u32(dst_socket_id);
        buf.put_u32(self.version);
        buf.put_u16(self.encryption);
        buf.put_u16(self.extension);
        buf.put_u32(self.init_seq);
        buf.put_u32(self.mtu);
        buf.put_u32(self.flow_window);
        buf.put_u32(self.hs_type);
        buf.put_u32(self.socket_id);
        buf.put_u32(self.syn_cookie);
        buf.put_slice(&self.peer_ip);
        for (ext_type, payload) in &self.extensions {
            buf.put_u16(*ext_type);
            buf.put_u16((payload.len() / 4) as u16);
            buf.put_slice(payload);
        }
        buf.freeze()
    }

    fn streamid(&self) -> Option<String> {
        let (_, payload) = self
            .extensions
            .iter()
            .find(|(t, _)| *t == EXT_TYPE_SID)?;
        Some(decode_streamid(payload))
    }
}

/// Streamid rides in 32-bit little-endian groups; decode and trim padding.
fn decode_streamid(payload: &[u8]) -> String {
    let mut bytes = Vec::with_capacity(payload.len());
    for chunk in payload.chunks(4) {
        let mut group: Vec<u8> = chunk.to_vec();
        group.reverse();
        bytes.extend(group);
    }
    while bytes.last() == Some(&0) {
        bytes.pop();
    }
    String::from_utf8_lossy(&bytes).to_string()
}

/// Inverse of [decode_streamid], for tests and the caller side.
pub fn encode_streamid(streamid: &str) -> Bytes {
    let mut padded = streamid.as_bytes().to_vec();
    while padded.len() % 4 != 0 {
        padded.push(0);
    }
    let mut out = BytesMut::with_capacity(padded.len());
    for chunk in padded.chunks(4) {
        let mut group: Vec<u8> = chunk.to_vec();
        group.reverse();
        out.put_slice(&group);
    }
    out.freeze()
}

/// Actions the driver must perform after feeding a packet.
#[derive(Debug)]
pub enum SrtEvent {
    SendTo(Bytes, SocketAddr),
    Accepted {
        socket_id: u32,
        streamid: String,
        addr: SocketAddr,
    },
    Data {
        socket_id: u32,
        payload: Bytes,
    },
    Closed {
        socket_id: u32,
    },
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum SessionState {
    Inducted,
    Established,
}

struct Session {
    state: SessionState,
    peer_socket_id: u32,
    our_socket_id: u32,
    cookie: u32,
    last_seen: Instant,
    data_packets: u64,
    last_seq: u32,
}

/// Sans-io SRT listener: feed datagrams in, collect events out.
pub struct SrtListenerProtocol {
    options: SrtOptions,
    sessions: HashMap<SocketAddr, Session>,
    next_socket_id: u32,
}

impl SrtListenerProtocol {
    pub fn new(options: SrtOptions) -> Self {
        Self {
            options,
            sessions: HashMap::new(),
            next_socket_id: 0x0100_0000,
        }
    }

    pub fn options(&self) -> &SrtOptions {
        &self.options
    }

    fn cookie_for(addr: &SocketAddr) -> u32 {
        // Deterministic per address, unpredictable enough for a liveness
        // check.
        let mut h: u32 = 0x811c_9dc5;
        for b in addr.to_string().bytes() {
            h ^= b as u32;
            h = h.wrapping_mul(0x0100_0193);
        }
        h | 1
    }

    pub fn handle_packet(
        &mut self,
        data: &[u8],
        from: SocketAddr,
        now: Instant,
    ) -> Result<Vec<SrtEvent>> {
        if data.len() < 16 {
            return Err(Error::ErrSrtPacket);
        }
        let first = u16::from_be_bytes([data[0], data[1]]);
        if first & 0x8000 == 0 {
            return self.handle_data(data, from, now);
        }
        let ctrl_type = first & 0x7fff;
        let payload = Bytes::copy_from_slice(&data[16..]);
        match ctrl_type {
            CTRL_HANDSHAKE => self.handle_handshake(payload, from, now),
            CTRL_KEEPALIVE => {
                if let Some(session) = self.sessions.get_mut(&from) {
                    session.last_seen = now;
                    let echo = control_packet(CTRL_KEEPALIVE, session.peer_socket_id, &[]);
                    return Ok(vec![SrtEvent::SendTo(echo, from)]);
                }
                Ok(vec![])
            }
            CTRL_ACK | 0x0006 /* ACKACK */ => Ok(vec![]),
            CTRL_SHUTDOWN => {
                if let Some(session) = self.sessions.remove(&from) {
                    log::info!("srt: peer {} shutdown", from);
                    return Ok(vec![SrtEvent::Closed {
                        socket_id: session.our_socket_id,
                    }]);
                }
                Ok(vec![])
            }
            _ => Ok(vec![]),
        }
    }

    fn handle_handshake(
        &mut self,
        payload: Bytes,
        from: SocketAddr,
        now: Instant,
    ) -> Result<Vec<SrtEvent>> {
        let hs = HandshakePacket::parse(payload)?;
        match hs.hs_type {
            HS_TYPE_INDUCTION => {
                let cookie = Self::cookie_for(&from);
                self.sessions.insert(
                    from,
                    Session {
                        state: SessionState::Inducted,
                        peer_socket_id: hs.socket_id,
                        our_socket_id: 0,
                        cookie,
                        last_seen: now,
                        data_packets: 0,
                        last_seq: 0,
                    },
                );
                let reply = HandshakePacket {
                    version: SRT_VERSION_5,
                    encryption: SRT_MAGIC,
                    extension: 0,
                    init_seq: hs.init_seq,
                    mtu: hs.mtu,
                    flow_window: hs.flow_window,
                    hs_type: HS_TYPE_INDUCTION,
                    socket_id: hs.socket_id,
                    syn_cookie: cookie,
                    peer_ip: hs.peer_ip,
                    extensions: vec![],
                };
                Ok(vec![SrtEvent::SendTo(reply.serialize(hs.socket_id), from)])
            }
            HS_TYPE_CONCLUSION => {
                let Some(session) = self.sessions.get_mut(&from) else {
                    return Err(Error::ErrSrtHandshake);
                };
                if hs.syn_cookie != session.cookie {
                    return Err(Error::ErrSrtHandshake.wrap("cookie mismatch"));
                }
                // A peer demanding key material needs a configured
                // passphrase; this build does not negotiate crypto.
                let wants_crypto = hs.encryption != 0
                    || hs.extensions.iter().any(|(t, _)| *t == EXT_TYPE_KMREQ);
                if wants_crypto && self.options.passphrase.is_none() {
                    let mut reject = hs.clone();
                    reject.hs_type = HS_TYPE_REJECT;
                    reject.extensions.clear();
                    let out = reject.serialize(session.peer_socket_id);
                    self.sessions.remove(&from);
                    return Ok(vec![SrtEvent::SendTo(out, from)]);
                }

                session.state = SessionState::Established;
                session.peer_socket_id = hs.socket_id;
                session.last_seen = now;
                if session.our_socket_id == 0 {
                    session.our_socket_id = self.next_socket_id;
                    self.next_socket_id += 1;
                }
                let streamid = hs.streamid().unwrap_or_default();

                // HSRSP echoing the latency in both directions.
                let mut hsrsp = BytesMut::new();
                hsrsp.put_u32(0x0001_0503); // SRT version of this impl
                hsrsp.put_u32(0x0000_00bf); // TSBPD flags
                hsrsp.put_u16(self.options.latency_ms as u16);
                hsrsp.put_u16(self.options.latency_ms as u16);
                let reply = HandshakePacket {
                    version: SRT_VERSION_5,
                    encryption: 0,
                    extension: 1,
                    init_seq: hs.init_seq,
                    mtu: hs.mtu,
                    flow_window: hs.flow_window,
                    hs_type: HS_TYPE_CONCLUSION,
                    socket_id: session.our_socket_id,
                    syn_cookie: 0,
                    peer_ip: hs.peer_ip,
                    extensions: vec![(EXT_TYPE_HSRSP, hsrsp.freeze())],
                };
                log::info!(
                    "srt: accept {} socket_id={} streamid={:?}",
                    from,
                    session.our_socket_id,
                    streamid
                );
                Ok(vec![
                    SrtEvent::SendTo(reply.serialize(hs.socket_id), from),
                    SrtEvent::Accepted {
                        socket_id: session.our_socket_id,
                        streamid,
                        addr: from,
                    },
                ])
            }
            _ => Ok(vec![]),
        }
    }

    fn handle_data(
        &mut self,
        data: &[u8],
        from: SocketAddr,
        now: Instant,
    ) -> Result<Vec<SrtEvent>> {
        let Some(session) = self.sessions.get_mut(&from) else {
            return Ok(vec![]);
        };
        if session.state != SessionState::Established {
            return Ok(vec![]);
        }
        session.last_seen = now;
        session.data_packets += 1;
        let seq = u32::from_be_bytes([data[0], data[1], data[2], data[3]]) & 0x7fff_ffff;
        session.last_seq = seq;
        let payload = Bytes::copy_from_slice(&data[16..]);

        let mut events = vec![SrtEvent::Data {
            socket_id: session.our_socket_id,
            payload,
        }];
        if session.data_packets % ACK_EVERY == 0 {
            // Lite ACK: acknowledge up to the next expected sequence.
            let mut body = BytesMut::new();
            body.put_u32(seq.wrapping_add(1));
            events.push(SrtEvent::SendTo(
                control_packet(CTRL_ACK, session.peer_socket_id, &body),
                from,
            ));
        }
        Ok(events)
    }

    /// Expires idle peers; run on a timer.
    pub fn handle_timeout(&mut self, now: Instant) -> Vec<SrtEvent> {
        let idle = self.options.peer_idle_timeout;
        let mut events = Vec::new();
        self.sessions.retain(|addr, session| {
            let dead = now.duration_since(session.last_seen) >= idle;
            if dead {
                log::warn!("srt: peer {} idle, expire", addr);
                events.push(SrtEvent::Closed {
                    socket_id: session.our_socket_id,
                });
            }
            !dead
        });
        events
    }
}

fn control_packet(ctrl_type: u16, dst_socket_id: u32, body: &[u8]) -> Bytes {
    let mut buf = BytesMut::with_capacity(16 + body.len());
    buf.put_u16(0x8000 | ctrl_type);
    buf.put_u16(0);
    buf.put_u32(0);
    buf.put_u32(0); // timestamp
    buf.put_u32(dst_socket_id);
    buf.put_slice(body);
    buf.freeze()
}

#[cfg(test)]
mod tests {
    use super::*;

    fn addr() -> SocketAddr {
        "127.0.0.1:9000".parse().unwrap()
    }

    fn induction() -> Bytes {
        HandshakePacket {
            version: SRT_VERSION_4,
            encryption: 0,
            extension: 2,
            init_seq: 1000,
            mtu: 1500,
            flow_window: 8192,
            hs_type: HS_TYPE_INDUCTION,
            socket_id: 42,
            syn_cookie: 0,
            peer_ip: [0; 16],
            extensions: vec![],
        }
        .serialize(0)
    }

    fn conclusion(cookie: u32, streamid: &str, encryption: u16) -> Bytes {
        HandshakePacket {
            version: SRT_VERSION_5,
            encryption,
            extension: 5,
            init_seq: 1000,
            mtu: 1500,
            flow_window: 8192,
            hs_type: HS_TYPE_CONCLUSION,
            socket_id: 42,
            syn_cookie: cookie,
            peer_ip: [0; 16],
            extensions: vec![(EXT_TYPE_SID, encode_streamid(streamid))],
        }
        .serialize(0)
    }

    fn extract_cookie(reply: &Bytes) -> u32 {
        // 16B control header, then the handshake body; cookie at offset 28.
        let b = &reply[16..];
        u32::from_be_bytes([b[28], b[29], b[30], b[31]])
    }

    #[test]
    fn test_streamid_codec() {
        let id = "#!::r=live/livestream,m=publish";
        assert_eq!(decode_streamid(&encode_streamid(id)), id);
    }

    #[test]
    fn test_full_handshake_accepts_with_streamid() {
        let mut p = SrtListenerProtocol::new(SrtOptions::default());
        let now = Instant::now();

        let events = p.handle_packet(&induction(), addr(), now).unwrap();
        let SrtEvent::SendTo(reply, to) = &events[0] else {
            panic!("expected induction reply");
        };
        assert_eq!(*to, addr());
        // Version 5 with the magic in the encryption field.
        let body = &reply[16..];
        assert_eq!(u32::from_be_bytes([body[0], body[1], body[2], body[3]]), SRT_VERSION_5);
        assert_eq!(u16::from_be_bytes([body[4], body[5]]), SRT_MAGIC);
        let cookie = extract_cookie(reply);
        assert_ne!(cookie, 0);

        let events = p
            .handle_packet(&conclusion(cookie, "#!::r=live/ls,m=publish", 0), addr(), now)
            .unwrap();
        assert_eq!(events.len(), 2);
        let SrtEvent::Accepted { streamid, .. } = &events[1] else {
            panic!("expected accept");
        };
        assert_eq!(streamid, "#!::r=live/ls,m=publish");
    }

    #[test]
    fn test_conclusion_with_wrong_cookie_rejected() {
        let mut p = SrtListenerProtocol::new(SrtOptions::default());
        let now = Instant::now();
        p.handle_packet(&induction(), addr(), now).unwrap();
        let err = p
            .handle_packet(&conclusion(0xdeadbeef, "x", 0), addr(), now)
            .unwrap_err();
        assert_eq!(err.root_cause(), &Error::ErrSrtHandshake);
    }

    #[test]
    fn test_encrypted_peer_rejected_without_passphrase() {
        let mut p = SrtListenerProtocol::new(SrtOptions::default());
        let now = Instant::now();
        let events = p.handle_packet(&induction(), addr(), now).unwrap();
        let SrtEvent::SendTo(reply, _) = &events[0] else {
            panic!();
        };
        let cookie = extract_cookie(reply);
        let events = p
            .handle_packet(&conclusion(cookie, "x", 2), addr(), now)
            .unwrap();
        // One reject reply, no accept, session gone.
        assert_eq!(events.len(), 1);
        assert!(matches!(events[0], SrtEvent::SendTo(..)));
        assert!(p.sessions.is_empty());
    }

    #[test]
    fn test_data_flows_after_accept() {
        let mut p = SrtListenerProtocol::new(SrtOptions::default());
        let now = Instant::now();
        let events = p.handle_packet(&induction(), addr(), now).unwrap();
        let SrtEvent::SendTo(reply, _) = &events[0] else {
            panic!();
        };
        let cookie = extract_cookie(reply);
        p.handle_packet(&conclusion(cookie, "s", 0), addr(), now)
            .unwrap();

        let mut data = BytesMut::new();
        data.put_u32(1000); // seq, top bit clear
        data.put_u32(0);
        data.put_u32(0);
        data.put_u32(42);
        data.put_slice(&[0x47; 188]);
        let events = p.handle_packet(&data, addr(), now).unwrap();
        let SrtEvent::Data { payload, .. } = &events[0] else {
            panic!("expected data");
        };
        assert_eq!(payload.len(), 188);
        assert_eq!(payload[0], 0x47);
    }

    #[test]
    fn test_idle_peer_expires() {
        let mut p = SrtListenerProtocol::new(SrtOptions {
            peer_idle_timeout: Duration::from_secs(5),
            ..Default::default()
        });
        let now = Instant::now();
        p.handle_packet(&induction(), addr(), now).unwrap();
        let events = p.handle_timeout(now + Duration::from_secs(6));
        assert_eq!(events.len(), 1);
        assert!(p.sessions.is_empty());
    }

    #[test]
    fn test_option_validation() {
        let mut o = SrtOptions::default();
        assert!(o.set_pbkeylen(16).is_ok());
        assert!(o.set_pbkeylen(17).is_err());
        assert!(o.set_passphrase("0123456789").is_ok());
        assert!(o.set_passphrase("short").is_err());
        assert!(o.set_passphrase("").is_ok());
        assert!(o.passphrase.is_none());
    }
}
