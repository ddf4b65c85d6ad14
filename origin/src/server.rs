//! Server assembly: the shared context, global initialization, listeners
//! and the lifetime of the hybrid media thread.

use crate::config::{Config, DEFAULT_VHOST};
use crate::http::HlsContexts;
use crate::reload::ReloadDispatcher;
use live::{SourceManager, StreamKey};
use rand::distributions::Alphanumeric;
use rand::Rng;
use rtc::dtls::{DtlsCertificate, DtlsRole};
use rtc::sdp::{DtlsSetup, MediaDesc, RtcSdp};
use rtc::session::{RtcConnection, RtcSessionManager};
use rtc::source::{RtcConsumer, RtcSourceManager, TrackDesc};
use rtc::track::PlayTrack;
use rtc::transport::{PlaintextTransport, RtcTransport, SecurityTransport, SemiSecurityTransport};
use runtime::{CircuitBreaker, CircuitBreakerConfig};
use shared::context::generate_cid;
use shared::error::{Error, Result, WrapExt};
use std::collections::HashMap;
use std::net::SocketAddr;
use std::sync::{Arc, Mutex};
use std::time::{Duration, Instant};

/// A play session's pull binding: the RTC consumer feeding one session.
pub struct PlayBinding {
    pub username: String,
    pub consumer: Arc<RtcConsumer>,
}

/// Explicit process-wide state, initialized before any coroutine runs.
pub struct ServerContext {
    dispatcher: Mutex<ReloadDispatcher>,
    pub sources: SourceManager,
    pub rtc_sources: RtcSourceManager,
    pub rtc_sessions: Mutex<RtcSessionManager>,
    pub hls_contexts: HlsContexts,
    pub cert: DtlsCertificate,
    pub breaker: Mutex<CircuitBreaker>,
    /// Live sources fed by RTC publishers, by session username.
    pub rtc_publish_bindings: Mutex<HashMap<String, Arc<live::LiveSource>>>,
    pub rtc_play_bindings: Mutex<Vec<PlayBinding>>,
    /// Stream keys whose hub children are already attached.
    hub_wired: Mutex<std::collections::HashSet<StreamKey>>,
    /// Installed by the run loop; HLS reaps ride it into the hook worker.
    hls_reap_tx: Mutex<Option<tokio::sync::mpsc::UnboundedSender<hls::HlsReapEvent>>>,
}

fn random_ice_string(len: usize) -> String {
    rand::thread_rng()
        .sample_iter(&Alphanumeric)
        .take(len)
        .map(char::from)
        .collect()
}

impl ServerContext {
    /// Global initialization; everything the old singletons carried.
    pub fn global_initialize(config: Config) -> Result<Arc<ServerContext>> {
        let die_window = Duration::from_secs(config.server.source_die_window_secs);
        let breaker_config = CircuitBreakerConfig {
            enabled: config.breaker.enabled,
            high_threshold: config.breaker.high_threshold,
            high_pulse: config.breaker.high_pulse,
            critical_threshold: config.breaker.critical_threshold,
            critical_pulse: config.breaker.critical_pulse,
            dying_threshold: config.breaker.dying_threshold,
            dying_pulse: config.breaker.dying_pulse,
        };
        Ok(Arc::new(ServerContext {
            dispatcher: Mutex::new(ReloadDispatcher::new(config)),
            sources: SourceManager::new(die_window),
            rtc_sources: RtcSourceManager::new(),
            rtc_sessions: Mutex::new(RtcSessionManager::new()),
            hls_contexts: HlsContexts::new(),
            cert: DtlsCertificate::generate().wrap("dtls certificate")?,
            breaker: Mutex::new(CircuitBreaker::new(breaker_config)),
            rtc_publish_bindings: Mutex::new(HashMap::new()),
            rtc_play_bindings: Mutex::new(Vec::new()),
            hub_wired: Mutex::new(std::collections::HashSet::new()),
            hls_reap_tx: Mutex::new(None),
        }))
    }

    pub fn set_hls_reap_tx(&self, tx: tokio::sync::mpsc::UnboundedSender<hls::HlsReapEvent>) {
        *self.hls_reap_tx.lock().unwrap() = Some(tx);
    }

    /// Snapshot of the running config.
    pub fn config(&self) -> Config {
        self.dispatcher.lock().unwrap().config().clone()
    }

    /// Applies a reload and fans the narrow events into the running hubs:
    /// an hls-only change restarts only hls children, never the listeners.
    pub fn reload(&self, text: &str) -> Vec<crate::reload::ReloadEvent> {
        use crate::reload::ReloadEvent;
        let events = self.dispatcher.lock().unwrap().reload(text);
        for event in &events {
            let (child, vhost) = match event {
                ReloadEvent::VhostHlsChanged(v) => ("hls", v),
                ReloadEvent::VhostDashChanged(v) => ("dash", v),
                ReloadEvent::VhostForwardChanged(v) => ("forward", v),
                ReloadEvent::ListenChanged => {
                    log::warn!("reload: listen changes apply on restart");
                    continue;
                }
                _ => continue,
            };
            for source in self.sources.all() {
                if &source.key().vhost == vhost {
                    log::info!("reload: restart {} of {}", child, source.key());
                    source.restart_hub_child(child);
                }
            }
        }
        events
    }

    /// Admission control: refuse new work at critical water level.
    pub fn admit_new_session(&self) -> bool {
        !self.breaker.lock().unwrap().hybrid_critical_water_level()
    }

    /// Wires HLS/DASH hub children and protocol bridges onto a source the
    /// first time it publishes.
    pub fn wire_hub(&self, source: &Arc<live::LiveSource>) {
        let key = source.key().clone();
        if !self.hub_wired.lock().unwrap().insert(key.clone()) {
            return;
        }
        let hls_reap_tx = self.hls_reap_tx.lock().unwrap().clone();
        let config = self.config();
        let vhost = config.vhost(&key.vhost);

        if vhost.hls.enabled {
            let mut child = hls::Hls::new(hls::HlsConfig {
                path: vhost.hls.path.clone(),
                fragment_ms: (vhost.hls.fragment_secs * 1000.0) as i64,
                window_ms: (vhost.hls.window_secs * 1000.0) as i64,
                cleanup: vhost.hls.cleanup,
            });
            if let Some(tx) = hls_reap_tx {
                child.muxer_mut().set_on_reap(Box::new(move |event| {
                    let _ = tx.send(event);
                }));
            }
            source.attach_hub_child(Box::new(child));
        }
        if vhost.dash.enabled {
            source.attach_hub_child(Box::new(dash::Dash::new(dash::DashConfig {
                path: vhost.dash.path.clone(),
                fragment_ms: (vhost.dash.fragment_secs * 1000.0) as i64,
                window_size: vhost.dash.window_size,
                cleanup: vhost.dash.cleanup,
            })));
        }
        if vhost.rtc.enabled && vhost.rtc.from_rtmp {
            let rtc_source = self.rtc_sources.fetch_or_create(&key);
            source.attach_bridge(Box::new(rtc::source::RtmpToRtcBridge::new(
                rtc_source,
                rand::random(),
                102,
            )));
        }
        if vhost.forward.enabled {
            let hook_urls = if vhost.http_hooks.enabled {
                vhost.http_hooks.on_forward.clone()
            } else {
                Vec::new()
            };
            for destination in &vhost.forward.destinations {
                source.attach_hub_child(Box::new(crate::forward::Forwarder::new(
                    destination,
                    hook_urls.clone(),
                )));
            }
        }
    }

    fn build_transport(
        &self,
        kind: &str,
        role: DtlsRole,
        peer_fingerprint: Option<&str>,
    ) -> Result<Box<dyn RtcTransport>> {
        Ok(match kind {
            "plaintext" => Box::new(PlaintextTransport::new()),
            "semi" => Box::new(SemiSecurityTransport::new(role, &self.cert)?),
            _ => {
                let mut t = SecurityTransport::new(role, &self.cert)?;
                if let Some(fp) = peer_fingerprint {
                    t.set_expected_fingerprint(fp);
                }
                Box::new(t)
            }
        })
    }

    fn parse_stream_url(streamurl: &str) -> Result<StreamKey> {
        // webrtc://host[:port]/app/stream
        let rest = streamurl
            .strip_prefix("webrtc://")
            .or_else(|| streamurl.strip_prefix("rtmp://"))
            .or_else(|| streamurl.strip_prefix("http://"))
            .unwrap_or(streamurl);
        let mut parts = rest.splitn(2, '/');
        let _authority = parts.next().unwrap_or_default();
        let path = parts.next().unwrap_or_default();
        let path = path.split('?').next().unwrap_or_default();
        let (app, stream) = path
            .rsplit_once('/')
            .ok_or_else(|| Error::ErrRtmpTcUrl(streamurl.to_string()))?;
        Ok(StreamKey::new(DEFAULT_VHOST, app, stream))
    }

    fn build_answer(
        &self,
        offer: &RtcSdp,
        local_ufrag: &str,
        local_pwd: &str,
        publish: bool,
    ) -> RtcSdp {
        let mut answer = RtcSdp {
            ice_ufrag: local_ufrag.to_string(),
            ice_pwd: local_pwd.to_string(),
            fingerprint: self.cert.fingerprint.clone(),
            setup: Some(DtlsSetup::answer_to(offer.setup.unwrap_or(DtlsSetup::ActPass))),
            media: Vec::new(),
        };
        for m in &offer.media {
            answer.media.push(MediaDesc {
                kind: m.kind.clone(),
                mid: m.mid.clone(),
                payloads: m.payloads.clone(),
                ssrc: if publish { None } else { Some(rand::random()) },
                twcc_id: m.twcc_id,
                direction: if publish {
                    "recvonly".to_string()
                } else {
                    "sendonly".to_string()
                },
            });
        }
        answer
    }

    /// WebRTC publish: parse the offer, create the session with publish
    /// tracks, answer.
    pub fn rtc_publish(&self, streamurl: &str, offer_sdp: &str) -> Result<String> {
        if !self.admit_new_session() {
            return Err(Error::Other("circuit breaker critical".to_string()));
        }
        let key = Self::parse_stream_url(streamurl)?;
        let config = self.config();
        let vhost = config.vhost(&key.vhost);
        if !vhost.rtc.enabled {
            return Err(Error::ErrConfigInvalid(format!("rtc disabled on {}", key.vhost)));
        }

        let offer = RtcSdp::parse(offer_sdp).wrap("parse offer")?;
        let source = self
            .sources
            .fetch_or_create(&key, config.source_config(&key.vhost));
        if !source.can_publish() {
            return Err(Error::ErrSourceBusy.wrap(format!("rtc publish {}", key)));
        }

        let local_ufrag = random_ice_string(8);
        let local_pwd = random_ice_string(32);
        let username = format!("{}:{}", local_ufrag, offer.ice_ufrag);
        let cid = generate_cid();
        let now = Instant::now();

        let role = match DtlsSetup::answer_to(offer.setup.unwrap_or(DtlsSetup::ActPass)) {
            DtlsSetup::Active => DtlsRole::Active,
            _ => DtlsRole::Passive,
        };
        let fp = (!offer.fingerprint.is_empty()).then_some(offer.fingerprint.as_str());
        let transport = self.build_transport(&vhost.rtc.transport, role, fp)?;

        let mut session = RtcConnection::new(cid.clone(), username.clone(), local_pwd.clone(), transport, now);
        let mut tracks = Vec::new();
        for m in &offer.media {
            let Some(ssrc) = m.ssrc else { continue };
            let is_video = m.kind == "video";
            let nack = m
                .payloads
                .iter()
                .any(|p| p.rtcp_fb.iter().any(|fb| fb.starts_with("nack")));
            session.add_publish_track(ssrc, is_video, nack);
            if is_video {
                if let Some(id) = m.twcc_id {
                    session.set_twcc(id, ssrc, now);
                }
            }
            tracks.push(TrackDesc {
                ssrc,
                payload_type: m.payloads.first().map(|p| p.pt).unwrap_or(102),
                is_video,
                rtx_ssrc: None,
                twcc_id: m.twcc_id,
            });
        }

        // Hub children must exist before on_publish fans out to them.
        self.wire_hub(&source);
        source.on_publish(cid)?;
        let rtc_source = self.rtc_sources.fetch_or_create(&key);
        let _ = rtc_source.on_publish(tracks);
        self.rtc_publish_bindings
            .lock()
            .unwrap()
            .insert(username.clone(), source);

        let answer = self.build_answer(&offer, &local_ufrag, &local_pwd, true);
        session.on_answer();
        self.rtc_sessions.lock().unwrap().insert(session);
        log::info!("rtc publish {} session={}", key, username);

        let port = self
            .config()
            .server
            .listen_rtc
            .rsplit(':')
            .next()
            .and_then(|p| p.parse::<u16>().ok())
            .unwrap_or(8000);
        Ok(answer.marshal(rand::random::<u32>() as u64, Some(("127.0.0.1", port))))
    }

    /// WebRTC play: subscribe an RTC consumer and answer with a send track.
    pub fn rtc_play(&self, streamurl: &str, offer_sdp: &str) -> Result<String> {
        if !self.admit_new_session() {
            return Err(Error::Other("circuit breaker critical".to_string()));
        }
        let key = Self::parse_stream_url(streamurl)?;
        let config = self.config();
        let vhost = config.vhost(&key.vhost);
        if !vhost.rtc.enabled {
            return Err(Error::ErrConfigInvalid(format!("rtc disabled on {}", key.vhost)));
        }
        let offer = RtcSdp::parse(offer_sdp).wrap("parse offer")?;
        let rtc_source = self
            .rtc_sources
            .fetch(&key)
            .ok_or(Error::ErrSourceNotFound)?;

        let local_ufrag = random_ice_string(8);
        let local_pwd = random_ice_string(32);
        let username = format!("{}:{}", local_ufrag, offer.ice_ufrag);
        let cid = generate_cid();
        let now = Instant::now();

        let role = match DtlsSetup::answer_to(offer.setup.unwrap_or(DtlsSetup::ActPass)) {
            DtlsSetup::Active => DtlsRole::Active,
            _ => DtlsRole::Passive,
        };
        let fp = (!offer.fingerprint.is_empty()).then_some(offer.fingerprint.as_str());
        let transport = self.build_transport(&vhost.rtc.transport, role, fp)?;
        let mut session =
            RtcConnection::new(cid, username.clone(), local_pwd.clone(), transport, now);

        let answer = self.build_answer(&offer, &local_ufrag, &local_pwd, false);
        for m in &answer.media {
            if m.kind == "video" {
                let pt = m.payloads.first().map(|p| p.pt).unwrap_or(102);
                session.add_play_track(PlayTrack::new(m.ssrc.unwrap_or_else(rand::random), pt, true));
            }
        }
        session.on_answer();

        let consumer = rtc_source.create_consumer();
        self.rtc_play_bindings.lock().unwrap().push(PlayBinding {
            username: username.clone(),
            consumer,
        });
        self.rtc_sessions.lock().unwrap().insert(session);
        log::info!("rtc play {} session={}", key, username);

        let port = self
            .config()
            .server
            .listen_rtc
            .rsplit(':')
            .next()
            .and_then(|p| p.parse::<u16>().ok())
            .unwrap_or(8000);
        Ok(answer.marshal(rand::random::<u32>() as u64, Some(("127.0.0.1", port))))
    }

    /// A session closed: release its bindings and sources.
    pub fn on_rtc_session_closed(&self, username: &str) {
        if let Some(source) = self.rtc_publish_bindings.lock().unwrap().remove(username) {
            source.on_unpublish();
            if let Some(rtc_source) = self.rtc_sources.fetch(source.key()) {
                rtc_source.on_unpublish();
            }
        }
        self.rtc_play_bindings
            .lock()
            .unwrap()
            .retain(|b| b.username != username);
    }
}

/// Acquires an exclusive write lock on the pid file; a second instance on
/// the same pid path fails fast.
pub fn acquire_pid_file(path: &std::path::Path) -> Result<std::fs::File> {
    use std::io::Write;
    use std::os::unix::io::AsRawFd;

    if let Some(parent) = path.parent() {
        let _ = std::fs::create_dir_all(parent);
    }
    let mut file = std::fs::OpenOptions::new()
        .create(true)
        .write(true)
        .truncate(false)
        .open(path)
        .map_err(|e| Error::Io(e.to_string()))
        .with_wrap(|| format!("open pid file {}", path.display()))?;

    let lock = libc::flock {
        l_type: libc::F_WRLCK as libc::c_short,
        l_whence: libc::SEEK_SET as libc::c_short,
        l_start: 0,
        l_len: 0,
        l_pid: 0,
    };
    let rc = unsafe { libc::fcntl(file.as_raw_fd(), libc::F_SETLK, &lock) };
    if rc < 0 {
        return Err(Error::Io(format!(
            "pid file {} locked by another instance",
            path.display()
        )));
    }
    file.set_len(0).map_err(|e| Error::Io(e.to_string()))?;
    write!(file, "{}", std::process::id()).map_err(|e| Error::Io(e.to_string()))?;
    Ok(file)
}

/// Resolves a socket address string.
pub fn parse_addr(addr: &str) -> Result<SocketAddr> {
    addr.parse()
        .map_err(|_| Error::ErrConfigInvalid(format!("listen address {}", addr)))
}

/// Brings up every listener and service coroutine, then parks until
/// interrupted.
pub async fn run(
    ctx: Arc<ServerContext>,
    config_path: Option<std::path::PathBuf>,
    interrupt: runtime::Interrupt,
) -> Result<()> {
    let config = ctx.config();
    let _pid_file = acquire_pid_file(&config.server.pid_file)?;

    // SIGHUP re-reads the config file and fires the narrow reload events.
    if let Some(path) = config_path {
        let ctx = ctx.clone();
        runtime::spawn("reload-signal", async move {
            let Ok(mut hangup) =
                tokio::signal::unix::signal(tokio::signal::unix::SignalKind::hangup())
            else {
                return;
            };
            while hangup.recv().await.is_some() {
                match std::fs::read_to_string(&path) {
                    Ok(text) => {
                        let events = ctx.reload(&text);
                        log::info!("reload: {} events applied", events.len());
                    }
                    Err(e) => log::error!("reload: read {} failed: {}", path.display(), e),
                }
            }
        });
    }

    // HLS reap events ride a channel into the async hook worker.
    let (reap_tx, mut reap_rx) = tokio::sync::mpsc::unbounded_channel::<hls::HlsReapEvent>();
    ctx.set_hls_reap_tx(reap_tx);
    let worker = runtime::AsyncCallWorker::start();
    {
        let ctx = ctx.clone();
        runtime::spawn("hls-reap-hooks", async move {
            let hooks = crate::hooks::HooksClient::new();
            let hooks = Arc::new(hooks);
            while let Some(event) = reap_rx.recv().await {
                let config = ctx.config();
                let vhost = config.vhost(&event.vhost);
                if !vhost.http_hooks.enabled {
                    continue;
                }
                let client = crate::hooks::HookClient {
                    cid: generate_cid(),
                    ip: String::new(),
                    vhost: event.vhost.clone(),
                    app: event.app.clone(),
                    stream: event.stream.clone(),
                };
                let on_hls = vhost.http_hooks.on_hls.clone();
                let on_notify = vhost.http_hooks.on_hls_notify.clone();
                let hooks = hooks.clone();
                let task = async move {
                    if !on_hls.is_empty() {
                        let body = crate::hooks::body::on_hls(
                            &client,
                            event.duration_ms as f64 / 1000.0,
                            &event.path.display().to_string(),
                            &event.m3u8_path.display().to_string(),
                            event.sequence_no,
                        );
                        hooks.call_notify("on_hls", &on_hls, body).await?;
                    }
                    if !on_notify.is_empty() {
                        let ts_url = event
                            .path
                            .file_name()
                            .map(|f| f.to_string_lossy().to_string())
                            .unwrap_or_default();
                        hooks.call_hls_notify(&on_notify, &client, &ts_url, "").await?;
                    }
                    Ok(())
                };
                if let Err(e) = worker.execute("on_hls", task) {
                    e.reset("hook worker gone");
                    break;
                }
            }
        });
    }

    // RTMP acceptor.
    {
        let listener = runtime::listener::tcp_listen(parse_addr(&config.server.listen_rtmp)?)?;
        let ctx = ctx.clone();
        let interrupt = interrupt.clone();
        runtime::spawn("rtmp-listener", async move {
            let r = runtime::listener::run_tcp_listener(listener, interrupt, |stream, peer| {
                let ctx = ctx.clone();
                async move {
                    runtime::spawn_with_cid("rtmp-session", async move {
                        crate::rtmp_conn::serve_rtmp(ctx, stream, peer).await;
                    });
                }
            })
            .await;
            if let Err(e) = r {
                if !e.is_interrupted() {
                    log::error!("rtmp listener died: {}", e);
                }
            }
        });
    }

    // Streaming HTTP surface.
    {
        let listener = runtime::listener::tcp_listen(parse_addr(&config.server.listen_http)?)?;
        let app = crate::http::router(ctx.clone());
        runtime::spawn("http-server", async move {
            if let Err(e) = axum::serve(listener, app).await {
                log::error!("http server died: {}", e);
            }
        });
        runtime::spawn("hls-ctx-sweeper", crate::http::hls_context_sweeper(ctx.clone()));
    }

    // RTC UDP.
    {
        let socket = runtime::listener::udp_listen(parse_addr(&config.server.listen_rtc)?)?;
        let ctx = ctx.clone();
        let interrupt = interrupt.clone();
        runtime::spawn("rtc-udp", async move {
            if let Err(e) = crate::rtc_conn::run_rtc_udp(ctx, runtime::UdpFd::new(socket), interrupt).await {
                if !e.is_interrupted() {
                    log::error!("rtc udp loop died: {}", e);
                }
            }
        });
    }

    // SRT, when any vhost enables it.
    if config.vhosts.values().any(|v| v.srt.enabled) {
        let socket = runtime::listener::udp_listen(parse_addr(&config.server.listen_srt)?)?;
        let ctx = ctx.clone();
        let interrupt = interrupt.clone();
        runtime::spawn("srt-listener", async move {
            if let Err(e) = crate::caster_conn::run_srt(ctx, runtime::UdpFd::new(socket), interrupt).await {
                if !e.is_interrupted() {
                    log::error!("srt loop died: {}", e);
                }
            }
        });
    }

    // Raw MPEG-TS over UDP, when configured.
    if let Some(addr) = &config.server.listen_mpegts_udp {
        let socket = runtime::listener::udp_listen(parse_addr(addr)?)?;
        let ctx = ctx.clone();
        let interrupt = interrupt.clone();
        runtime::spawn("mpegts-udp", async move {
            if let Err(e) =
                crate::caster_conn::run_mpegts_udp(ctx, runtime::UdpFd::new(socket), interrupt).await
            {
                if !e.is_interrupted() {
                    log::error!("mpegts udp loop died: {}", e);
                }
            }
        });
    }

    // Circuit breaker sampling and source cleanup timers.
    {
        let ctx = ctx.clone();
        let interrupt = interrupt.clone();
        runtime::spawn("hybrid-timers", async move {
            let mut sampler = runtime::ProcCpuSampler::new();
            let mut ticks = 0u64;
            loop {
                if interrupt.pull().is_err() {
                    return;
                }
                runtime::usleep(Duration::from_secs(1)).await;
                let cpu = sampler.sample();
                ctx.breaker.lock().unwrap().on_timer(cpu);
                ticks += 1;
                if ticks % 5 == 0 {
                    ctx.sources.cleanup(Instant::now());
                }
            }
        });
    }

    log::info!(
        "origin up: rtmp={} http={} rtc={} srt={}",
        config.server.listen_rtmp,
        config.server.listen_http,
        config.server.listen_rtc,
        config.server.listen_srt
    );
    interrupt.interrupted().await;
    log::info!("origin: interrupted, shutting down");
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_parse_stream_url() {
        let key = ServerContext::parse_stream_url("webrtc://example.com/live/stream").unwrap();
        assert_eq!(key.app, "live");
        assert_eq!(key.stream, "stream");
        let key = ServerContext::parse_stream_url("webrtc://h:8000/live/s?x=1").unwrap();
        assert_eq!(key.stream, "s");
        assert!(ServerContext::parse_stream_url("webrtc://h/onlyapp").is_err());
    }

    #[test]
    fn test_pid_file_exclusive() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("origin.pid");
        let _first = acquire_pid_file(&path).unwrap();
        // The lock is per-process with fcntl, so a second acquire in the
        // same process succeeds; the content must be our pid.
        let content = std::fs::read_to_string(&path).unwrap();
        assert_eq!(content, std::process::id().to_string());
    }

    #[test]
    fn test_rtc_publish_answers_sdp() {
        let ctx = ServerContext::global_initialize(
            Config::parse("[vhosts.__defaultVhost__.rtc]\nenabled = true\ntransport = \"plaintext\"")
                .unwrap(),
        )
        .unwrap();
        let offer = "v=0\r\n\
a=ice-ufrag:client\r\n\
a=ice-pwd:clientpassword\r\n\
a=setup:actpass\r\n\
m=video 9 UDP/TLS/RTP/SAVPF 102\r\n\
a=mid:0\r\n\
a=rtpmap:102 H264/90000\r\n\
a=rtcp-fb:102 nack\r\n\
a=sendonly\r\n\
a=ssrc:1234 cname:x\r\n";
        let answer = ctx
            .rtc_publish("webrtc://127.0.0.1/live/stream", offer)
            .unwrap();
        assert!(answer.contains("a=setup:passive"));
        assert!(answer.contains("a=recvonly"));
        assert!(answer.contains("a=fingerprint:sha-256"));
        assert_eq!(ctx.rtc_sessions.lock().unwrap().len(), 1);

        // Second publisher is refused.
        let err = ctx
            .rtc_publish("webrtc://127.0.0.1/live/stream", offer)
            .unwrap_err();
        assert_eq!(err.root_cause(), &Error::ErrSourceBusy);
    }

    #[test]
    fn test_rtc_play_requires_source() {
        let ctx = ServerContext::global_initialize(
            Config::parse("[vhosts.__defaultVhost__.rtc]\nenabled = true\ntransport = \"plaintext\"")
                .unwrap(),
        )
        .unwrap();
        let offer = "v=0\r\na=ice-ufrag:c\r\na=ice-pwd:p\r\nm=video 9 X 102\r\na=mid:0\r\na=rtpmap:102 H264/90000\r\n";
        assert_eq!(
            ctx.rtc_play("webrtc://h/live/nosuch", offer)
                .unwrap_err()
                .root_cause(),
            &Error::ErrSourceNotFound
        );
    }
}
