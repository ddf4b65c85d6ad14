//! RTMP session orchestration: accept → handshake → identify → publish or
//! play against the live hub, with the hook gates in between.

use crate::hooks::{body, HookClient, HooksClient};
use crate::server::ServerContext;
use bytes::Bytes;
use live::{Consumer, LiveSource, SharedMessage, StreamKey};
use rtmp::chunk::{message_type, RtmpMessage};
use rtmp::packet;
use rtmp::server::{strip_set_data_frame, ClientType, RtmpServer};
use runtime::{Interrupt, TcpFd};
use shared::context::current_cid;
use shared::error::{Error, Result, WrapExt};
use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;
use tokio::net::TcpStream;

/// Chunked flush pulse for the play loop.
const PULSE: Duration = Duration::from_millis(500);
/// Messages pulled per play-loop iteration.
const PLAY_BATCH: usize = 128;

/// Entry point for one accepted RTMP connection.
pub async fn serve_rtmp(ctx: Arc<ServerContext>, stream: TcpStream, peer: SocketAddr) {
    if !ctx.admit_new_session() {
        log::warn!("rtmp: refuse {} at critical water level", peer);
        return;
    }
    let _ = stream.set_nodelay(true);
    let fd = TcpFd::new(stream);
    let mut delta = runtime::NetworkDelta::new();
    delta.attach(fd.stat());
    let mut kbps = runtime::Kbps::new();
    let mut rtmp = RtmpServer::new(fd);

    let result = serve_cycle(&ctx, &mut rtmp, peer).await;
    match &result {
        Ok(()) => {}
        Err(e) if e.is_eof() || e.is_interrupted() => {
            log::info!("rtmp: client {} gone", peer);
        }
        Err(e) => {
            log::warn!("rtmp: serve {} failed: {}", peer, e);
        }
    }

    let (din, dout) = delta.detach();
    kbps.add_delta(din, dout);
    kbps.sample(std::time::Instant::now());
    log::info!(
        "rtmp: close {} recv={}B send={}B",
        peer,
        kbps.recv_bytes(),
        kbps.send_bytes()
    );
}

async fn serve_cycle(
    ctx: &Arc<ServerContext>,
    rtmp: &mut RtmpServer,
    peer: SocketAddr,
) -> Result<()> {
    rtmp.handshake().await.wrap("handshake")?;
    let mut request = rtmp.connect_app().await.wrap("connect app")?;

    let hooks = HooksClient::new();
    let cid = current_cid().unwrap_or_else(shared::context::generate_cid);
    let mut hook_client = HookClient {
        cid,
        ip: peer.ip().to_string(),
        vhost: request.vhost.clone(),
        app: request.app.clone(),
        stream: String::new(),
    };

    let config = ctx.config();
    let vhost = config.vhost(&request.vhost);
    if vhost.http_hooks.enabled && !vhost.http_hooks.on_connect.is_empty() {
        hooks
            .call_gate(
                "on_connect",
                &vhost.http_hooks.on_connect,
                body::on_connect(&hook_client, &request.tc_url, &request.page_url),
            )
            .await?;
    }

    let client_type = rtmp.identify_client().await.wrap("identify")?;
    let result = match client_type {
        ClientType::Publish { stream } => {
            request.set_stream(&stream);
            hook_client.stream = request.stream.clone();
            hook_client.vhost = request.vhost.clone();
            publishing(ctx, rtmp, &request_key(&request), &hook_client, &request.param).await
        }
        ClientType::Play { stream } => {
            request.set_stream(&stream);
            hook_client.stream = request.stream.clone();
            hook_client.vhost = request.vhost.clone();
            playing(ctx, rtmp, &request_key(&request), &hook_client, &request.param).await
        }
    };

    // on_close is advisory, never a gate.
    let config = ctx.config();
    let vhost = config.vhost(&hook_client.vhost);
    if vhost.http_hooks.enabled && !vhost.http_hooks.on_close.is_empty() {
        let stat = rtmp.fd().stat();
        let _ = hooks
            .call_notify(
                "on_close",
                &vhost.http_hooks.on_close,
                body::on_close(&hook_client, stat.send_bytes(), stat.recv_bytes()),
            )
            .await;
    }
    result
}

fn request_key(request: &rtmp::RtmpRequest) -> StreamKey {
    StreamKey::new(&request.vhost, &request.app, &request.stream)
}

async fn publishing(
    ctx: &Arc<ServerContext>,
    rtmp: &mut RtmpServer,
    key: &StreamKey,
    hook_client: &HookClient,
    param: &str,
) -> Result<()> {
    let config = ctx.config();
    let vhost = config.vhost(&key.vhost);
    let source = ctx
        .sources
        .fetch_or_create(key, config.source_config(&key.vhost));
    if !source.can_publish() {
        rtmp.reject("NetStream.Publish.BadName", "Stream already publishing.")
            .await?;
        return Err(Error::ErrSourceBusy.wrap(format!("publish {}", key)));
    }

    let hooks = HooksClient::new();
    if vhost.http_hooks.enabled && !vhost.http_hooks.on_publish.is_empty() {
        if let Err(e) = hooks
            .call_gate(
                "on_publish",
                &vhost.http_hooks.on_publish,
                body::on_publish(hook_client, param),
            )
            .await
        {
            rtmp.reject("NetStream.Publish.Denied", "Publish denied by hook.")
                .await?;
            return Err(e);
        }
    }

    ctx.wire_hub(&source);
    source.on_publish(hook_client.cid.clone())?;
    rtmp.start_publish().await?;
    log::info!("rtmp: publish {} started", key);

    let result = publish_recv_loop(rtmp, &source).await;
    source.on_unpublish();

    if vhost.http_hooks.enabled && !vhost.http_hooks.on_unpublish.is_empty() {
        let _ = hooks
            .call_notify(
                "on_unpublish",
                &vhost.http_hooks.on_unpublish,
                body::on_unpublish(hook_client),
            )
            .await;
    }
    result
}

async fn publish_recv_loop(rtmp: &mut RtmpServer, source: &Arc<LiveSource>) -> Result<()> {
    loop {
        let msg = match rtmp.recv_message(rtmp::RTMP_TIMEOUT).await {
            Ok(m) => m,
            Err(e) if e.is_eof() => return Ok(()),
            Err(e) => return Err(e),
        };
        match msg.message_type {
            message_type::AUDIO => {
                source.on_audio(SharedMessage::audio(msg.timestamp as i64, msg.payload))?;
            }
            message_type::VIDEO => {
                source.on_video(SharedMessage::video(msg.timestamp as i64, msg.payload))?;
            }
            message_type::AMF0_DATA => {
                let payload = strip_set_data_frame(&msg.payload)?;
                source.on_meta_data(SharedMessage::amf0_data(payload))?;
            }
            message_type::AMF0_COMMAND => {
                let cmd = rtmp::packet::Command::decode(&msg.payload)?;
                if cmd.name == "FCUnpublish" || cmd.name == "closeStream" {
                    return Ok(());
                }
            }
            _ => {}
        }
    }
}

async fn playing(
    ctx: &Arc<ServerContext>,
    rtmp: &mut RtmpServer,
    key: &StreamKey,
    hook_client: &HookClient,
    param: &str,
) -> Result<()> {
    let config = ctx.config();
    let vhost = config.vhost(&key.vhost);

    let hooks = HooksClient::new();
    if vhost.http_hooks.enabled && !vhost.http_hooks.on_play.is_empty() {
        if let Err(e) = hooks
            .call_gate(
                "on_play",
                &vhost.http_hooks.on_play,
                body::on_play(hook_client, param, ""),
            )
            .await
        {
            rtmp.reject("NetStream.Play.Failed", "Play denied by hook.")
                .await?;
            return Err(e);
        }
    }

    let source = ctx
        .sources
        .fetch_or_create(key, config.source_config(&key.vhost));
    let consumer = source.create_consumer();
    source.consumer_dumps(&consumer, true, true, source.config().gop_cache);
    rtmp.start_play().await?;
    log::info!("rtmp: play {} started", key);

    let result = play_send_loop(rtmp, &source, &consumer).await;

    if vhost.http_hooks.enabled && !vhost.http_hooks.on_stop.is_empty() {
        let _ = hooks
            .call_notify(
                "on_stop",
                &vhost.http_hooks.on_stop,
                body::on_stop(hook_client),
            )
            .await;
    }
    result
}

async fn play_send_loop(
    rtmp: &mut RtmpServer,
    source: &Arc<LiveSource>,
    consumer: &Arc<Consumer>,
) -> Result<()> {
    let interrupt = Interrupt::new();
    loop {
        interrupt.pull()?;
        if consumer.take_source_id_changed() {
            if let Some(id) = source.source_id() {
                log::info!("play: source id changed to {}", id);
            }
        }

        consumer.wait(1, PULSE).await;
        let msgs = consumer.dump_packets(PLAY_BATCH);
        if !msgs.is_empty() {
            let batch: Vec<RtmpMessage> = msgs.into_iter().map(to_rtmp_message).collect();
            rtmp.send_messages(&batch).await?;
        }

        // Drain client commands without stalling the send path.
        loop {
            match rtmp.recv_message(Duration::from_millis(1)).await {
                Ok(msg) if msg.message_type == message_type::AMF0_COMMAND => {
                    let cmd = packet::Command::decode(&msg.payload)?;
                    match cmd.name.as_str() {
                        "closeStream" => return Ok(()),
                        "pause" => {
                            let pause = cmd
                                .args
                                .get(1)
                                .and_then(|v| v.as_bool())
                                .unwrap_or(false);
                            consumer.on_play_pause(pause);
                        }
                        _ => {}
                    }
                }
                Ok(_) => {}
                Err(e) if e.is_timeout() => break,
                Err(e) if e.is_eof() => return Ok(()),
                Err(e) => return Err(e),
            }
        }
    }
}

fn to_rtmp_message(msg: SharedMessage) -> RtmpMessage {
    let message_type = match msg.header.msg_type {
        live::MessageType::Audio => message_type::AUDIO,
        live::MessageType::Video => message_type::VIDEO,
        _ => message_type::AMF0_DATA,
    };
    RtmpMessage::new(
        message_type,
        msg.header.timestamp as u32,
        1,
        Bytes::clone(&msg.payload),
    )
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_to_rtmp_message_types() {
        let audio = SharedMessage::audio(10, Bytes::from_static(&[0xaf, 0x01]));
        assert_eq!(to_rtmp_message(audio).message_type, message_type::AUDIO);
        let video = SharedMessage::video(10, Bytes::from_static(&[0x17, 0x01]));
        let m = to_rtmp_message(video);
        assert_eq!(m.message_type, message_type::VIDEO);
        assert_eq!(m.timestamp, 10);
        assert_eq!(m.stream_id, 1);
        let meta = SharedMessage::amf0_data(Bytes::from_static(b"x"));
        assert_eq!(to_rtmp_message(meta).message_type, message_type::AMF0_DATA);
    }
}
