//! Caster drivers: MPEG-TS over raw UDP, and the SRT listener, both feeding
//! the live hub through the TS adapter.

use crate::server::ServerContext;
use caster::srt::{SrtEvent, SrtListenerProtocol, SrtOptions};
use caster::streamid::{streamid_to_request, SrtMode};
use caster::TsToRtmp;
use live::{LiveSource, SharedMessage, StreamKey};
use runtime::{Interrupt, UdpFd};
use shared::context::generate_cid;
use shared::error::{Result, WrapExt};
use std::collections::HashMap;
use std::net::SocketAddr;
use std::sync::Arc;
use std::time::{Duration, Instant};

/// Voluntary yield cadence for datagram loops.
const YIELD_EVERY: u32 = 16;
const UDP_READ_TIMEOUT: Duration = Duration::from_millis(500);

fn deliver(source: &Arc<LiveSource>, msgs: Vec<SharedMessage>) -> Result<()> {
    for msg in msgs {
        if msg.is_audio() {
            source.on_audio(msg)?;
        } else if msg.is_video() {
            source.on_video(msg)?;
        }
    }
    Ok(())
}

/// Raw MPEG-TS over UDP: every sender on the port feeds one configured
/// stream, keyed by peer address.
pub async fn run_mpegts_udp(
    ctx: Arc<ServerContext>,
    socket: UdpFd,
    interrupt: Interrupt,
) -> Result<()> {
    let key = StreamKey::new(crate::config::DEFAULT_VHOST, "live", "livestream");
    let mut adapters: HashMap<SocketAddr, (TsToRtmp, Arc<LiveSource>)> = HashMap::new();
    let mut buf = vec![0u8; 65536];
    let mut since_yield = 0u32;

    loop {
        interrupt.pull()?;
        let (n, from) = match socket.recvfrom(&mut buf, Some(UDP_READ_TIMEOUT)).await {
            Ok(v) => v,
            Err(e) if e.is_timeout() => continue,
            Err(e) => return Err(e),
        };

        let entry = match adapters.get_mut(&from) {
            Some(e) => e,
            None => {
                let config = ctx.config();
                let source = ctx
                    .sources
                    .fetch_or_create(&key, config.source_config(&key.vhost));
                if !source.can_publish() {
                    continue;
                }
                ctx.wire_hub(&source);
                source.on_publish(generate_cid()).wrap("mpegts publish")?;
                log::info!("mpegts: publisher {} on {}", from, key);
                adapters.insert(from, (TsToRtmp::new(), source));
                adapters.get_mut(&from).unwrap()
            }
        };

        let (adapter, source) = entry;
        match adapter.feed(&buf[..n]) {
            Ok(msgs) => deliver(source, msgs)?,
            Err(e) => e.wrap("mpegts feed").reset("skip bad datagram"),
        }

        // Starvation guard: let the poller breathe between datagram bursts.
        since_yield += 1;
        if since_yield >= YIELD_EVERY {
            since_yield = 0;
            runtime::yield_now().await;
        }
    }
}

struct SrtSession {
    adapter: TsToRtmp,
    source: Option<Arc<LiveSource>>,
}

/// The SRT listener loop: handshake via the sans-io protocol core, TS
/// payloads through the adapter into the hub.
pub async fn run_srt(ctx: Arc<ServerContext>, socket: UdpFd, interrupt: Interrupt) -> Result<()> {
    let config = ctx.config();
    let vhost = config.vhost("");
    let mut options = SrtOptions::default();
    options.set_latency_ms(vhost.srt.latency_ms)?;
    options.set_passphrase(&vhost.srt.passphrase)?;
    options.set_pbkeylen(vhost.srt.pbkeylen)?;
    options.set_peer_idle_timeout(Duration::from_secs(vhost.srt.peer_idle_timeout_secs))?;

    let mut protocol = SrtListenerProtocol::new(options);
    let mut sessions: HashMap<u32, SrtSession> = HashMap::new();
    let mut buf = vec![0u8; 2048];
    let mut since_yield = 0u32;

    loop {
        interrupt.pull()?;
        let now = Instant::now();
        let (n, from) = match socket.recvfrom(&mut buf, Some(UDP_READ_TIMEOUT)).await {
            Ok(v) => v,
            Err(e) if e.is_timeout() => {
                for event in protocol.handle_timeout(now) {
                    if let SrtEvent::Closed { socket_id } = event {
                        close_srt_session(&mut sessions, socket_id);
                    }
                }
                continue;
            }
            Err(e) => return Err(e),
        };

        let events = match protocol.handle_packet(&buf[..n], from, now) {
            Ok(ev) => ev,
            Err(e) => {
                e.wrap("srt packet").reset("drop bad srt datagram");
                continue;
            }
        };
        for event in events {
            match event {
                SrtEvent::SendTo(data, to) => {
                    socket.sendto(&data, to, runtime::NO_TIMEOUT).await?;
                }
                SrtEvent::Accepted {
                    socket_id,
                    streamid,
                    addr,
                } => {
                    on_srt_accept(&ctx, &mut sessions, socket_id, &streamid, addr);
                }
                SrtEvent::Data { socket_id, payload } => {
                    if let Some(session) = sessions.get_mut(&socket_id) {
                        if let Some(source) = &session.source {
                            match session.adapter.feed(&payload) {
                                Ok(msgs) => deliver(source, msgs)?,
                                Err(e) => e.wrap("srt ts feed").reset("skip bad payload"),
                            }
                        }
                    }
                }
                SrtEvent::Closed { socket_id } => {
                    close_srt_session(&mut sessions, socket_id);
                }
            }
        }

        since_yield += 1;
        if since_yield >= YIELD_EVERY {
            since_yield = 0;
            runtime::yield_now().await;
        }
    }
}

fn on_srt_accept(
    ctx: &Arc<ServerContext>,
    sessions: &mut HashMap<u32, SrtSession>,
    socket_id: u32,
    streamid: &str,
    addr: SocketAddr,
) {
    let (mode, request) = match streamid_to_request(streamid, crate::config::DEFAULT_VHOST) {
        Ok(v) => v,
        Err(e) => {
            e.reset("srt: bad streamid, ignore peer");
            return;
        }
    };
    if mode != SrtMode::Push {
        log::warn!("srt: pull mode not served on this listener, peer={}", addr);
        return;
    }
    let config = ctx.config();
    let vhost = config.vhost(&request.vhost);
    if !vhost.srt.enabled || !vhost.srt.to_rtmp {
        log::warn!("srt: disabled for vhost {}", request.vhost);
        return;
    }
    let key = StreamKey::new(&request.vhost, &request.app, &request.stream);
    let source = ctx
        .sources
        .fetch_or_create(&key, config.source_config(&key.vhost));
    if !source.can_publish() {
        log::warn!("srt: {} busy, refuse {}", key, addr);
        return;
    }
    ctx.wire_hub(&source);
    if let Err(e) = source.on_publish(generate_cid()) {
        e.reset("srt publish");
        return;
    }
    log::info!("srt: publish {} from {} (socket_id={})", key, addr, socket_id);
    sessions.insert(
        socket_id,
        SrtSession {
            adapter: TsToRtmp::new(),
            source: Some(source),
        },
    );
}

fn close_srt_session(sessions: &mut HashMap<u32, SrtSession>, socket_id: u32) {
    if let Some(session) = sessions.remove(&socket_id) {
        if let Some(source) = session.source {
            source.on_unpublish();
        }
    }
}
