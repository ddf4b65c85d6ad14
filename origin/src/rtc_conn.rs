//! The RTC UDP driver: classification happens inside the session layer;
//! this loop moves datagrams, timers and media between sockets and
//! sessions.

use crate::server::ServerContext;
use rtc::frame::RtcFrame;
use rtc::session::RtcAction;
use runtime::{Interrupt, UdpFd};
use shared::error::Result;
use std::sync::Arc;
use std::time::{Duration, Instant};

const YIELD_EVERY: u32 = 16;
const TIMER_TICK: Duration = Duration::from_millis(20);

/// Applies session actions against the socket and the media hub.
async fn apply_actions(
    ctx: &Arc<ServerContext>,
    socket: &UdpFd,
    username: &str,
    actions: Vec<RtcAction>,
) -> Result<()> {
    for action in actions {
        match action {
            RtcAction::SendTo(data, to) => {
                socket.sendto(&data, to, runtime::NO_TIMEOUT).await?;
            }
            RtcAction::Frame(frame) => {
                let binding = ctx
                    .rtc_publish_bindings
                    .lock()
                    .unwrap()
                    .get(username)
                    .cloned();
                if let Some(source) = binding {
                    on_publish_frame(&source, &frame)?;
                }
            }
            RtcAction::StateChanged(rtc::RtcSessionState::Closed) => {
                ctx.on_rtc_session_closed(username);
            }
            RtcAction::StateChanged(state) => {
                log::debug!("rtc: session {} -> {:?}", username, state);
            }
        }
    }
    Ok(())
}

fn on_publish_frame(source: &Arc<live::LiveSource>, frame: &RtcFrame) -> Result<()> {
    match frame {
        RtcFrame::Video(msg) => source.on_video(msg.clone()),
        // Opus stays in the RTC domain; the RTMP side would need a
        // transcoder.
        RtcFrame::OpusAudio { .. } => Ok(()),
    }
}

/// Pulls queued RTP from play bindings into their sessions.
async fn drive_play_sessions(ctx: &Arc<ServerContext>, socket: &UdpFd) -> Result<()> {
    let bindings: Vec<(String, Vec<rtc::RtpPacket>)> = {
        let bindings = ctx.rtc_play_bindings.lock().unwrap();
        bindings
            .iter()
            .map(|b| (b.username.clone(), b.consumer.dump(64)))
            .collect()
    };
    for (username, packets) in bindings {
        if packets.is_empty() {
            continue;
        }
        let mut to_send = Vec::new();
        {
            let mut sessions = ctx.rtc_sessions.lock().unwrap();
            let Some(session) = sessions.get_mut(&username) else {
                continue;
            };
            for packet in packets {
                if let Some(action) = session.send_rtp(0, packet)? {
                    to_send.push(action);
                }
            }
        }
        apply_actions(ctx, socket, &username, to_send).await?;
    }
    Ok(())
}

/// The receive/timer loop for the RTC UDP port.
pub async fn run_rtc_udp(ctx: Arc<ServerContext>, socket: UdpFd, interrupt: Interrupt) -> Result<()> {
    let mut buf = vec![0u8; 2048];
    let mut since_yield = 0u32;
    let mut next_timer = Instant::now() + TIMER_TICK;

    loop {
        interrupt.pull()?;
        let now = Instant::now();

        if now >= next_timer {
            next_timer = now + TIMER_TICK;
            let (actions, closed) = ctx.rtc_sessions.lock().unwrap().on_timer(now);
            // Timer actions have no single owner; peers are in the actions.
            apply_actions(&ctx, &socket, "", actions).await?;
            for username in closed {
                ctx.on_rtc_session_closed(&username);
            }
            drive_play_sessions(&ctx, &socket).await?;
        }

        let timeout = next_timer.saturating_duration_since(now).max(Duration::from_millis(1));
        let (n, from) = match socket.recvfrom(&mut buf, Some(timeout)).await {
            Ok(v) => v,
            Err(e) if e.is_timeout() => continue,
            Err(e) => return Err(e),
        };

        let dispatched = {
            let mut sessions = ctx.rtc_sessions.lock().unwrap();
            sessions.dispatch(&buf[..n], from, now)
        };
        match dispatched {
            Ok((username, actions)) => {
                apply_actions(&ctx, &socket, &username, actions).await?;
            }
            Err(e) => {
                e.wrap("rtc dispatch").reset("drop unroutable datagram");
            }
        }

        since_yield += 1;
        if since_yield >= YIELD_EVERY {
            since_yield = 0;
            runtime::yield_now().await;
        }
    }
}
