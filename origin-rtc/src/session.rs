//! The WebRTC session: one peer, one transport, publish and play tracks,
//! fast feedback timers and the keyed session manager.

use crate::classify::{classify, PacketKind};
use crate::frame::RtcFrame;
use crate::pli::PliWorker;
use crate::rtcp::{self, RtcpPacket};
use crate::rtp::RtpPacket;
use crate::stun::{self, StunMessage};
use crate::track::{PlayTrack, PublishTrack};
use crate::transport::RtcTransport;
use crate::twcc::TwccRecorder;
use bytes::Bytes;
use shared::context::ContextId;
use shared::error::{Error, Result, WrapExt};
use std::collections::HashMap;
use std::net::SocketAddr;
use std::time::{Duration, Instant};

/// NACK fast timer.
pub const NACK_INTERVAL: Duration = Duration::from_millis(20);
/// TWCC feedback timer.
pub const TWCC_INTERVAL: Duration = Duration::from_millis(50);
/// Keepalive STUN absence beyond this closes the session.
pub const SESSION_TIMEOUT: Duration = Duration::from_secs(30);
/// At most one PLI per SSRC in this window.
pub const PLI_INTERVAL: Duration = Duration::from_millis(500);

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RtcSessionState {
    Init,
    WaitingAnswer,
    WaitingStun,
    DoingDtlsHandshake,
    Established,
    Closed,
}

/// Side effects for the UDP driver.
#[derive(Debug)]
pub enum RtcAction {
    SendTo(Bytes, SocketAddr),
    /// A media frame for the source/hub layer.
    Frame(RtcFrame),
    StateChanged(RtcSessionState),
}

pub struct RtcConnection {
    pub cid: ContextId,
    /// `local:remote` ICE username pair keying this session.
    pub username: String,
    local_pwd: String,
    state: RtcSessionState,
    transport: Box<dyn RtcTransport>,
    peer_addr: Option<SocketAddr>,
    publish_tracks: HashMap<u32, PublishTrack>,
    play_tracks: Vec<PlayTrack>,
    twcc: Option<TwccRecorder>,
    twcc_id: Option<u8>,
    pli: PliWorker,
    rtcp_ssrc: u32,
    last_stun: Instant,
    next_nack_at: Instant,
    next_twcc_at: Instant,
    /// DTLS handshake-done events seen; exactly one precedes Established.
    handshake_done_events: u32,
}

impl RtcConnection {
    pub fn new(
        cid: ContextId,
        username: String,
        local_pwd: String,
        transport: Box<dyn RtcTransport>,
        now: Instant,
    ) -> Self {
        Self {
            cid,
            username,
            local_pwd,
            state: RtcSessionState::Init,
            transport,
            peer_addr: None,
            publish_tracks: HashMap::new(),
            play_tracks: Vec::new(),
            twcc: None,
            twcc_id: None,
            pli: PliWorker::new(PLI_INTERVAL),
            rtcp_ssrc: rand::random(),
            last_stun: now,
            next_nack_at: now + NACK_INTERVAL,
            next_twcc_at: now + TWCC_INTERVAL,
            handshake_done_events: 0,
        }
    }

    pub fn state(&self) -> RtcSessionState {
        self.state
    }

    pub fn peer_addr(&self) -> Option<SocketAddr> {
        self.peer_addr
    }

    pub fn publish_track_count(&self) -> usize {
        self.publish_tracks.len()
    }

    /// SDP answer sent: INIT → WAITING_ANSWER → WAITING_STUN.
    pub fn on_answer(&mut self) {
        if self.state == RtcSessionState::Init {
            self.state = RtcSessionState::WaitingAnswer;
        }
        if self.state == RtcSessionState::WaitingAnswer {
            self.state = RtcSessionState::WaitingStun;
        }
    }

    pub fn add_publish_track(&mut self, ssrc: u32, is_video: bool, nack: bool) {
        self.publish_tracks
            .insert(ssrc, PublishTrack::new(ssrc, is_video, nack));
    }

    pub fn add_play_track(&mut self, track: PlayTrack) {
        self.play_tracks.push(track);
    }

    pub fn set_twcc(&mut self, id: u8, media_ssrc: u32, now: Instant) {
        self.twcc_id = Some(id);
        self.twcc = Some(TwccRecorder::new(self.rtcp_ssrc, media_ssrc, now));
    }

    /// Queues a PLI towards the publisher of `ssrc`.
    pub fn request_keyframe(&mut self, ssrc: u32) {
        self.pli.request(ssrc);
    }

    pub fn close(&mut self) -> Vec<RtcAction> {
        if self.state == RtcSessionState::Closed {
            return Vec::new();
        }
        log::info!("rtc: session {} closed", self.username);
        self.state = RtcSessionState::Closed;
        vec![RtcAction::StateChanged(RtcSessionState::Closed)]
    }

    /// Feeds one datagram, classified at the receive boundary.
    pub fn handle_datagram(
        &mut self,
        data: &[u8],
        from: SocketAddr,
        now: Instant,
    ) -> Result<Vec<RtcAction>> {
        if self.state == RtcSessionState::Closed {
            return Ok(Vec::new());
        }
        match classify(data) {
            PacketKind::Stun => self.on_stun(data, from, now),
            PacketKind::Dtls => self.on_dtls(data, now),
            PacketKind::Rtp => self.on_rtp(data, now),
            PacketKind::Rtcp => self.on_rtcp(data),
            PacketKind::Unknown => Ok(Vec::new()),
        }
    }

    fn on_stun(&mut self, data: &[u8], from: SocketAddr, now: Instant) -> Result<Vec<RtcAction>> {
        let msg = StunMessage::parse(data)?;
        if !msg.is_binding_request() {
            return Ok(Vec::new());
        }
        msg.check_integrity(data, &self.local_pwd)
            .wrap("stun integrity")?;
        self.last_stun = now;

        // ICE renomination: any valid binding request may move the peer.
        let mut actions = Vec::new();
        if self.peer_addr != Some(from) {
            if let Some(old) = self.peer_addr {
                log::info!("rtc: peer address {} -> {}", old, from);
            }
            self.peer_addr = Some(from);
        }
        let response = stun::binding_response(&msg.transaction_id, from, &self.local_pwd);
        actions.push(RtcAction::SendTo(response, from));

        if self.state == RtcSessionState::WaitingStun {
            self.state = RtcSessionState::DoingDtlsHandshake;
            actions.push(RtcAction::StateChanged(self.state));
            // Active role opens the handshake now that a path exists.
            self.transport.start(now)?;
            self.drain_transport(&mut actions, from);
        }
        Ok(actions)
    }

    fn on_dtls(&mut self, data: &[u8], now: Instant) -> Result<Vec<RtcAction>> {
        let mut actions = Vec::new();
        let was_established = self.transport.is_established();
        if let Err(e) = self.transport.handle_dtls(data, now) {
            // A DTLS alert or handshake failure closes the session.
            actions.extend(self.close());
            return Err(e.wrap("dtls"));
        }
        let from = self.peer_addr;
        if let Some(from) = from {
            self.drain_transport(&mut actions, from);
        }
        if !was_established && self.transport.is_established() {
            self.handshake_done_events += 1;
            if self.state == RtcSessionState::DoingDtlsHandshake {
                self.state = RtcSessionState::Established;
                log::info!("rtc: session {} established", self.username);
                actions.push(RtcAction::StateChanged(self.state));
            }
        }
        Ok(actions)
    }

    fn on_rtp(&mut self, data: &[u8], now: Instant) -> Result<Vec<RtcAction>> {
        let plain = match self.transport.unprotect_rtp(data) {
            Ok(p) => p,
            Err(e) if e.root_cause() == &Error::ErrSrtpReplay => {
                // Replays are dropped quietly; NACK storms cause them.
                return Ok(Vec::new());
            }
            Err(e) => {
                // Unprotect failure is fatal for the session.
                let _ = self.close();
                return Err(e.wrap("srtp unprotect"));
            }
        };
        let packet = RtpPacket::parse(&plain)?;

        if let (Some(id), Some(twcc)) = (self.twcc_id, self.twcc.as_mut()) {
            if let Some(ext) = packet.header.extension(id) {
                if ext.len() >= 2 {
                    twcc.record(u16::from_be_bytes([ext[0], ext[1]]), now);
                }
            }
        }

        let Some(track) = self.publish_tracks.get_mut(&packet.header.ssrc) else {
            return Ok(Vec::new());
        };
        let frames = track.on_rtp(packet)?;
        Ok(frames.into_iter().map(RtcAction::Frame).collect())
    }

    fn on_rtcp(&mut self, data: &[u8]) -> Result<Vec<RtcAction>> {
        let plain = self.transport.unprotect_rtcp(data).wrap("srtcp")?;
        let packets = rtcp::parse_compound(&plain)?;
        let mut actions = Vec::new();
        for pkt in packets {
            match pkt {
                RtcpPacket::Nack(nack) => {
                    // Resend from the matching play track's buffer.
                    let peer = self.peer_addr;
                    for track in &self.play_tracks {
                        if track.ssrc != nack.media_ssrc {
                            continue;
                        }
                        for packet in track.resend_for(&nack) {
                            let wire = self.transport.protect_rtp(&packet.marshal())?;
                            if let Some(peer) = peer {
                                actions.push(RtcAction::SendTo(wire, peer));
                            }
                        }
                    }
                }
                RtcpPacket::Pli { media_ssrc, .. } => {
                    // A player wants a keyframe from our publisher side.
                    self.pli.request(media_ssrc);
                }
                RtcpPacket::SenderReport { .. }
                | RtcpPacket::ReceiverReport { .. }
                | RtcpPacket::Twcc(_)
                | RtcpPacket::Other { .. } => {}
            }
        }
        Ok(actions)
    }

    /// Fast timers: NACK ~20ms, TWCC ~50ms, PLI coalescing, keepalive
    /// timeout and DTLS retransmits.
    pub fn handle_timer(&mut self, now: Instant) -> Result<Vec<RtcAction>> {
        if self.state == RtcSessionState::Closed {
            return Ok(Vec::new());
        }
        let mut actions = Vec::new();

        if now.duration_since(self.last_stun) >= SESSION_TIMEOUT {
            log::warn!("rtc: session {} keepalive timeout", self.username);
            actions.extend(self.close());
            return Ok(actions);
        }
        if self.state != RtcSessionState::Established {
            if let Err(e) = self.transport.handle_timeout(now) {
                actions.extend(self.close());
                return Err(e);
            }
            if let Some(peer) = self.peer_addr {
                self.drain_transport(&mut actions, peer);
            }
            return Ok(actions);
        }
        let Some(peer) = self.peer_addr else {
            return Ok(actions);
        };

        if now >= self.next_nack_at {
            self.next_nack_at = now + NACK_INTERVAL;
            let rtcp_ssrc = self.rtcp_ssrc;
            let mut nacks = Vec::new();
            for track in self.publish_tracks.values_mut() {
                if let Some(nack) = track.generate_nack(rtcp_ssrc) {
                    nacks.push(nack);
                }
            }
            for nack in nacks {
                let wire = self.transport.protect_rtcp(&rtcp::marshal_nack(&nack))?;
                actions.push(RtcAction::SendTo(wire, peer));
            }
        }

        if now >= self.next_twcc_at {
            self.next_twcc_at = now + TWCC_INTERVAL;
            if let Some(body) = self.twcc.as_mut().and_then(|t| t.build_feedback()) {
                let wire = self.transport.protect_rtcp(&rtcp::marshal_twcc(&body))?;
                actions.push(RtcAction::SendTo(wire, peer));
            }
        }

        for ssrc in self.pli.poll(now) {
            let wire = self
                .transport
                .protect_rtcp(&rtcp::marshal_pli(self.rtcp_ssrc, ssrc))?;
            actions.push(RtcAction::SendTo(wire, peer));
        }
        Ok(actions)
    }

    /// Sends one media packet through a play track.
    pub fn send_rtp(&mut self, track_index: usize, packet: RtpPacket) -> Result<Option<RtcAction>> {
        if self.state != RtcSessionState::Established {
            return Ok(None);
        }
        let Some(peer) = self.peer_addr else {
            return Ok(None);
        };
        let Some(track) = self.play_tracks.get_mut(track_index) else {
            return Ok(None);
        };
        let rewritten = track.on_outgoing(packet);
        let wire = self.transport.protect_rtp(&rewritten.marshal())?;
        Ok(Some(RtcAction::SendTo(wire, peer)))
    }

    fn drain_transport(&mut self, actions: &mut Vec<RtcAction>, to: SocketAddr) {
        while let Some(d) = self.transport.poll_outgoing() {
            actions.push(RtcAction::SendTo(d, to));
        }
    }
}

/// Sessions keyed by the ICE username pair; datagrams with no STUN username
/// resolve through the peer address map.
#[derive(Default)]
pub struct RtcSessionManager {
    sessions: HashMap<String, RtcConnection>,
    by_addr: HashMap<SocketAddr, String>,
}

impl RtcSessionManager {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn insert(&mut self, session: RtcConnection) {
        self.sessions.insert(session.username.clone(), session);
    }

    pub fn len(&self) -> usize {
        self.sessions.len()
    }

    pub fn is_empty(&self) -> bool {
        self.sessions.is_empty()
    }

    pub fn get_mut(&mut self, username: &str) -> Option<&mut RtcConnection> {
        self.sessions.get_mut(username)
    }

    /// Routes one datagram to its session, returning the session username
    /// with the actions so the driver can bind side effects to it.
    pub fn dispatch(
        &mut self,
        data: &[u8],
        from: SocketAddr,
        now: Instant,
    ) -> Result<(String, Vec<RtcAction>)> {
        let username = if classify(data) == PacketKind::Stun {
            let msg = StunMessage::parse(data)?;
            let (local, _remote) = msg
                .username()
                .ok_or(Error::ErrStunMessage)?;
            let username = self
                .sessions
                .keys()
                .find(|u| u.starts_with(&format!("{}:", local)))
                .cloned()
                .ok_or(Error::ErrRtcSessionNotFound)?;
            self.by_addr.insert(from, username.clone());
            username
        } else {
            self.by_addr
                .get(&from)
                .cloned()
                .ok_or(Error::ErrRtcSessionNotFound)?
        };
        let session = self
            .sessions
            .get_mut(&username)
            .ok_or(Error::ErrRtcSessionNotFound)?;
        let actions = session.handle_datagram(data, from, now)?;
        Ok((username, actions))
    }

    /// Drives every session's timers; returns actions plus closed sessions
    /// swept out of the map.
    pub fn on_timer(&mut self, now: Instant) -> (Vec<RtcAction>, Vec<String>) {
        let mut actions = Vec::new();
        let mut closed = Vec::new();
        for (username, session) in self.sessions.iter_mut() {
            match session.handle_timer(now) {
                Ok(a) => actions.extend(a),
                Err(e) => {
                    e.wrap(format!("session {}", username)).reset("timer sweep");
                }
            }
            if session.state() == RtcSessionState::Closed {
                closed.push(username.clone());
            }
        }
        for username in &closed {
            self.sessions.remove(username);
            self.by_addr.retain(|_, u| u != username);
        }
        (actions, closed)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::transport::PlaintextTransport;
    use shared::context::generate_cid;

    fn conn(now: Instant) -> RtcConnection {
        RtcConnection::new(
            generate_cid(),
            "local:remote".to_string(),
            "thelocalpassword".to_string(),
            Box::new(PlaintextTransport::new()),
            now,
        )
    }

    fn peer() -> SocketAddr {
        "10.0.0.9:5000".parse().unwrap()
    }

    #[test]
    fn test_state_machine_happy_path() {
        let now = Instant::now();
        let mut c = conn(now);
        assert_eq!(c.state(), RtcSessionState::Init);
        c.on_answer();
        assert_eq!(c.state(), RtcSessionState::WaitingStun);

        // First valid binding request advances and answers.
        let req = stun::binding_request("local:remote", "thelocalpassword", &[9u8; 12]);
        let actions = c.handle_datagram(&req, peer(), now).unwrap();
        assert_eq!(c.state(), RtcSessionState::DoingDtlsHandshake);
        assert!(actions
            .iter()
            .any(|a| matches!(a, RtcAction::SendTo(..))));
        assert_eq!(c.peer_addr(), Some(peer()));
    }

    #[test]
    fn test_stun_with_wrong_password_rejected() {
        let now = Instant::now();
        let mut c = conn(now);
        c.on_answer();
        let req = stun::binding_request("local:remote", "wrongpassword", &[9u8; 12]);
        assert!(c.handle_datagram(&req, peer(), now).is_err());
        assert_eq!(c.state(), RtcSessionState::WaitingStun);
    }

    #[test]
    fn test_ice_renomination_moves_peer() {
        let now = Instant::now();
        let mut c = conn(now);
        c.on_answer();
        let req = stun::binding_request("local:remote", "thelocalpassword", &[1u8; 12]);
        c.handle_datagram(&req, peer(), now).unwrap();
        assert_eq!(c.peer_addr(), Some(peer()));

        let new_addr: SocketAddr = "10.0.0.10:6000".parse().unwrap();
        let req2 = stun::binding_request("local:remote", "thelocalpassword", &[2u8; 12]);
        c.handle_datagram(&req2, new_addr, now).unwrap();
        assert_eq!(c.peer_addr(), Some(new_addr));
    }

    #[test]
    fn test_keepalive_timeout_closes() {
        let now = Instant::now();
        let mut c = conn(now);
        c.on_answer();
        let req = stun::binding_request("local:remote", "thelocalpassword", &[1u8; 12]);
        c.handle_datagram(&req, peer(), now).unwrap();
        let actions = c.handle_timer(now + SESSION_TIMEOUT + Duration::from_secs(1)).unwrap();
        assert!(actions
            .iter()
            .any(|a| matches!(a, RtcAction::StateChanged(RtcSessionState::Closed))));
        assert_eq!(c.state(), RtcSessionState::Closed);
    }

    #[test]
    fn test_manager_routes_by_username_then_addr() {
        let now = Instant::now();
        let mut mgr = RtcSessionManager::new();
        let mut c = conn(now);
        c.on_answer();
        c.add_publish_track(7, true, true);
        mgr.insert(c);

        let req = stun::binding_request("local:remote", "thelocalpassword", &[1u8; 12]);
        let (username, _) = mgr.dispatch(&req, peer(), now).unwrap();
        assert_eq!(username, "local:remote");

        // Plain RTP from the same address now routes without a username.
        let rtp = crate::rtp::RtpPacket {
            header: crate::rtp::RtpHeader {
                payload_type: 96,
                ssrc: 7,
                marker: true,
                ..Default::default()
            },
            payload: bytes::Bytes::from_static(&[0x41, 0, 0]),
        }
        .marshal();
        mgr.dispatch(&rtp, peer(), now).unwrap();

        // Unknown address has no session.
        let other: SocketAddr = "10.1.1.1:1".parse().unwrap();
        assert_eq!(
            mgr.dispatch(&rtp, other, now).unwrap_err().root_cause(),
            &Error::ErrRtcSessionNotFound
        );
    }

    #[test]
    fn test_closed_sessions_swept() {
        let now = Instant::now();
        let mut mgr = RtcSessionManager::new();
        let mut c = conn(now);
        c.on_answer();
        mgr.insert(c);
        let (_, closed) = mgr.on_timer(now + SESSION_TIMEOUT + Duration::from_secs(5));
        assert_eq!(closed.len(), 1);
        assert!(mgr.is_empty());
    }
}
