//! The streaming HTTP surface: HTTP-FLV remux, HLS with virtual session
//! contexts, DASH files and the WebRTC SDP exchange.

use crate::hooks::{body, HookClient, HooksClient};
use crate::server::ServerContext;
use axum::body::Body;
use axum::extract::{Path as AxumPath, Query, State};
use axum::http::{header, StatusCode};
use axum::response::{IntoResponse, Response};
use axum::routing::{get, post};
use axum::{Json, Router};
use bytes::{BufMut, Bytes, BytesMut};
use live::StreamKey;
use rand::distributions::Alphanumeric;
use rand::Rng;
use serde::Deserialize;
use serde_json::json;
use shared::context::generate_cid;
use std::collections::HashMap;
use std::sync::{Arc, Mutex};
use std::time::{Duration, Instant};

/// One HLS player, identified by the opaque `hls_ctx` token.
struct HlsVirtualConn {
    client: HookClient,
    last_seen: Instant,
    recv_bytes: u64,
}

/// Virtual connection table for HLS statistics and lifecycle.
#[derive(Default)]
pub struct HlsContexts {
    map: Mutex<HashMap<String, HlsVirtualConn>>,
}

impl HlsContexts {
    pub fn new() -> Self {
        Self::default()
    }

    fn generate_ctx(&self) -> String {
        let map = self.map.lock().unwrap();
        loop {
            let ctx: String = rand::thread_rng()
                .sample_iter(&Alphanumeric)
                .take(8)
                .map(char::from)
                .collect();
            if !map.contains_key(&ctx) {
                return ctx;
            }
        }
    }

    fn exists(&self, ctx: &str) -> bool {
        self.map.lock().unwrap().contains_key(ctx)
    }

    /// Refreshes (or creates) a context on every request that carries it.
    fn alive(&self, ctx: &str, client: &HookClient, bytes: u64, now: Instant) {
        let mut map = self.map.lock().unwrap();
        let conn = map.entry(ctx.to_string()).or_insert_with(|| HlsVirtualConn {
            client: client.clone(),
            last_seen: now,
            recv_bytes: 0,
        });
        conn.last_seen = now;
        conn.recv_bytes += bytes;
    }

    /// Evicts contexts idle beyond the window; one `expire` path for both
    /// explicit and idle eviction. Returns the expired clients so on_stop
    /// fires exactly once each.
    pub fn expire_idle(&self, idle: Duration, now: Instant) -> Vec<HookClient> {
        let mut map = self.map.lock().unwrap();
        let mut expired = Vec::new();
        map.retain(|ctx, conn| {
            let dead = now.duration_since(conn.last_seen) >= idle;
            if dead {
                log::info!(
                    "hls: evict ctx={} after {}B, idle {:?}",
                    ctx,
                    conn.recv_bytes,
                    idle
                );
                expired.push(conn.client.clone());
            }
            !dead
        });
        expired
    }

    pub fn len(&self) -> usize {
        self.map.lock().unwrap().len()
    }

    pub fn is_empty(&self) -> bool {
        self.map.lock().unwrap().is_empty()
    }
}

/// Rewrites every `.ts` URI in a playlist to carry the context token.
pub fn rewrite_m3u8_with_ctx(m3u8: &str, ctx: &str) -> String {
    m3u8.lines()
        .map(|line| {
            if line.ends_with(".ts") {
                format!("{}?hls_ctx={}", line, ctx)
            } else {
                line.to_string()
            }
        })
        .collect::<Vec<_>>()
        .join("\n")
        + "\n"
}

#[derive(Deserialize)]
pub struct StreamQuery {
    #[serde(default)]
    hls_ctx: Option<String>,
}

pub fn router(ctx: Arc<ServerContext>) -> Router {
    Router::new()
        .route("/rtc/v1/publish/", post(rtc_publish))
        .route("/rtc/v1/play/", post(rtc_play))
        .route("/:app/:file", get(serve_media))
        .route("/:app/:stream/:file", get(serve_dash_fragment))
        .with_state(ctx)
}

async fn serve_media(
    State(ctx): State<Arc<ServerContext>>,
    AxumPath((app, file)): AxumPath<(String, String)>,
    Query(query): Query<StreamQuery>,
) -> Response {
    if let Some(stream) = file.strip_suffix(".flv") {
        return serve_http_flv(ctx, &app, stream).await;
    }
    if file.ends_with(".m3u8") {
        return serve_m3u8(ctx, &app, &file, query).await;
    }
    if file.ends_with(".ts") {
        return serve_ts(ctx, &app, &file, query).await;
    }
    if file.ends_with(".mpd") {
        let path = ctx.config().vhost("").dash.path.join(&app).join(&file);
        return serve_file(&path, "application/dash+xml").await;
    }
    StatusCode::NOT_FOUND.into_response()
}

async fn serve_dash_fragment(
    State(ctx): State<Arc<ServerContext>>,
    AxumPath((app, stream, file)): AxumPath<(String, String, String)>,
) -> Response {
    let path = ctx
        .config()
        .vhost("")
        .dash
        .path
        .join(&app)
        .join(&stream)
        .join(&file);
    let content_type = if file.ends_with(".mp4") || file.ends_with(".m4s") {
        "video/mp4"
    } else {
        "application/octet-stream"
    };
    serve_file(&path, content_type).await
}

async fn serve_file(path: &std::path::Path, content_type: &str) -> Response {
    match tokio::fs::read(path).await {
        Ok(data) => (
            StatusCode::OK,
            [(header::CONTENT_TYPE, content_type.to_string())],
            data,
        )
            .into_response(),
        Err(_) => StatusCode::NOT_FOUND.into_response(),
    }
}

async fn serve_m3u8(
    ctx: Arc<ServerContext>,
    app: &str,
    file: &str,
    query: StreamQuery,
) -> Response {
    let stream = file.trim_end_matches(".m3u8");
    let config = ctx.config();
    let vhost = config.vhost("");
    let path = vhost.hls.path.join(app).join(file);
    let Ok(m3u8) = tokio::fs::read_to_string(&path).await else {
        return StatusCode::NOT_FOUND.into_response();
    };
    if !vhost.hls.hls_ctx {
        return (
            StatusCode::OK,
            [(header::CONTENT_TYPE, "application/vnd.apple.mpegurl".to_string())],
            m3u8,
        )
            .into_response();
    }

    // A fresh playlist request mints a context; known contexts refresh.
    let hls_ctx = match query.hls_ctx {
        Some(c) if ctx.hls_contexts.exists(&c) => c,
        _ => ctx.hls_contexts.generate_ctx(),
    };
    let client = HookClient {
        cid: generate_cid(),
        ip: String::new(),
        vhost: crate::config::DEFAULT_VHOST.to_string(),
        app: app.to_string(),
        stream: stream.to_string(),
    };
    ctx.hls_contexts
        .alive(&hls_ctx, &client, m3u8.len() as u64, Instant::now());

    let rewritten = rewrite_m3u8_with_ctx(&m3u8, &hls_ctx);
    (
        StatusCode::OK,
        [(header::CONTENT_TYPE, "application/vnd.apple.mpegurl".to_string())],
        rewritten,
    )
        .into_response()
}

async fn serve_ts(
    ctx: Arc<ServerContext>,
    app: &str,
    file: &str,
    query: StreamQuery,
) -> Response {
    let config = ctx.config();
    let vhost = config.vhost("");
    let path = vhost.hls.path.join(app).join(file);
    let Ok(data) = tokio::fs::read(&path).await else {
        return StatusCode::NOT_FOUND.into_response();
    };
    if let Some(hls_ctx) = &query.hls_ctx {
        if ctx.hls_contexts.exists(hls_ctx) {
            // The segment name carries the stream: "stream-42.ts".
            let stream = file
                .rsplit_once('-')
                .map(|(s, _)| s)
                .unwrap_or(file)
                .to_string();
            let client = HookClient {
                cid: generate_cid(),
                ip: String::new(),
                vhost: crate::config::DEFAULT_VHOST.to_string(),
                app: app.to_string(),
                stream,
            };
            ctx.hls_contexts
                .alive(hls_ctx, &client, data.len() as u64, Instant::now());
        }
    }
    (
        StatusCode::OK,
        [(header::CONTENT_TYPE, "video/mp2t".to_string())],
        data,
    )
        .into_response()
}

/// Live HTTP-FLV: bootstrap the consumer, then stream tags as they arrive.
async fn serve_http_flv(ctx: Arc<ServerContext>, app: &str, stream: &str) -> Response {
    let key = StreamKey::new(crate::config::DEFAULT_VHOST, app, stream);
    let Some(source) = ctx.sources.fetch(&key) else {
        return StatusCode::NOT_FOUND.into_response();
    };
    let consumer = source.create_consumer();
    source.consumer_dumps(&consumer, true, true, true);

    let stream = async_stream(consumer);
    (
        StatusCode::OK,
        [(header::CONTENT_TYPE, "video/x-flv".to_string())],
        Body::from_stream(stream),
    )
        .into_response()
}

fn async_stream(
    consumer: Arc<live::Consumer>,
) -> impl futures::Stream<Item = std::io::Result<Bytes>> {
    futures::stream::unfold((consumer, false), |(consumer, header_done)| async move {
        let mut out = BytesMut::new();
        if !header_done {
            out.put_slice(&codec::flv::write_header(true, true));
        }
        loop {
            let msgs = consumer.dump_packets(0);
            if !msgs.is_empty() {
                for msg in msgs {
                    codec::flv::write_tag(
                        &mut out,
                        msg.flv_tag_type(),
                        msg.header.timestamp as u32,
                        &msg.payload,
                    );
                }
                break;
            }
            if !out.is_empty() {
                // Flush the header before parking for media.
                break;
            }
            consumer.wait(1, Duration::from_secs(10)).await;
            if consumer.size() == 0 {
                break;
            }
        }
        Some((Ok(out.freeze()), (consumer, true)))
    })
}

#[derive(Deserialize)]
pub struct RtcApiRequest {
    pub streamurl: String,
    pub sdp: String,
}

async fn rtc_publish(
    State(ctx): State<Arc<ServerContext>>,
    Json(request): Json<RtcApiRequest>,
) -> Response {
    match ctx.rtc_publish(&request.streamurl, &request.sdp) {
        Ok(answer) => Json(json!({"code": 0, "sdp": answer})).into_response(),
        Err(e) => {
            log::warn!("rtc publish failed: {}", e);
            Json(json!({"code": 400, "msg": e.to_string()})).into_response()
        }
    }
}

async fn rtc_play(
    State(ctx): State<Arc<ServerContext>>,
    Json(request): Json<RtcApiRequest>,
) -> Response {
    match ctx.rtc_play(&request.streamurl, &request.sdp) {
        Ok(answer) => Json(json!({"code": 0, "sdp": answer})).into_response(),
        Err(e) => {
            log::warn!("rtc play failed: {}", e);
            Json(json!({"code": 400, "msg": e.to_string()})).into_response()
        }
    }
}

/// Background sweeper: HLS context eviction fires on_stop once per context.
pub async fn hls_context_sweeper(ctx: Arc<ServerContext>) {
    let hooks = HooksClient::new();
    loop {
        runtime::usleep(Duration::from_secs(5)).await;
        let config = ctx.config();
        let vhost = config.vhost("");
        if !vhost.hls.enabled || !vhost.hls.hls_ctx {
            continue;
        }
        // Dead after 2 x hls_window without a request.
        let idle = Duration::from_secs_f64(vhost.hls.window_secs * 2.0);
        let urls = vhost.http_hooks.on_stop.clone();
        let hooks_enabled = vhost.http_hooks.enabled;
        for client in ctx.hls_contexts.expire_idle(idle, Instant::now()) {
            if hooks_enabled && !urls.is_empty() {
                let _ = hooks
                    .call_notify("on_stop", &urls, body::on_stop(&client))
                    .await;
            }
        }
    }
}
