//! Forwarder: an origin-hub child pushing the stream to another RTMP
//! origin. The hub side only enqueues; a relay coroutine owns the client
//! connection so a slow destination never stalls ingest.

use crate::hooks::{body, HookClient, HooksClient};
use live::{HubChild, SharedMessage};
use rtmp::chunk::message_type;
use rtmp::client::{relay_message, RtmpClient};
use shared::context::generate_cid;
use shared::error::{Error, Result, WrapExt};
use std::net::SocketAddr;
use tokio::sync::mpsc;

enum Relay {
    Start { app: String, stream: String },
    Frame(SharedMessage),
    Stop,
}

/// Hub child: one instance per destination.
pub struct Forwarder {
    destination: String,
    hook_urls: Vec<String>,
    tx: Option<mpsc::UnboundedSender<Relay>>,
}

impl Forwarder {
    pub fn new(destination: &str, hook_urls: Vec<String>) -> Self {
        Self {
            destination: destination.to_string(),
            hook_urls,
            tx: None,
        }
    }

    fn send(&mut self, item: Relay) {
        if let Some(tx) = &self.tx {
            if tx.send(item).is_err() {
                log::warn!("forward {}: relay gone", self.destination);
                self.tx = None;
            }
        }
    }
}

impl HubChild for Forwarder {
    fn name(&self) -> &str {
        "forward"
    }

    fn on_publish(&mut self, vhost: &str, app: &str, stream: &str) -> Result<()> {
        let (tx, rx) = mpsc::unbounded_channel();
        self.tx = Some(tx);
        let destination = self.destination.clone();
        let hook_urls = self.hook_urls.clone();
        let vhost = vhost.to_string();
        // Publish may originate on any runtime thread (RTMP coroutine or
        // the HTTP surface), so the relay is a plain Send task.
        let cid = shared::context::current_cid().unwrap_or_else(generate_cid);
        tokio::spawn(shared::context::ContextScope::new(cid, async move {
            if let Err(e) = relay_cycle(&destination, &hook_urls, &vhost, rx).await {
                if !e.is_interrupted() && !e.is_eof() {
                    log::warn!("forward to {} failed: {}", destination, e);
                }
            }
        }));
        self.send(Relay::Start {
            app: app.to_string(),
            stream: stream.to_string(),
        });
        Ok(())
    }

    fn on_meta_data(&mut self, msg: &SharedMessage) -> Result<()> {
        self.send(Relay::Frame(msg.clone()));
        Ok(())
    }

    fn on_audio(&mut self, msg: &SharedMessage) -> Result<()> {
        self.send(Relay::Frame(msg.clone()));
        Ok(())
    }

    fn on_video(&mut self, msg: &SharedMessage) -> Result<()> {
        self.send(Relay::Frame(msg.clone()));
        Ok(())
    }

    fn on_unpublish(&mut self) {
        self.send(Relay::Stop);
        self.tx = None;
    }
}

async fn relay_cycle(
    destination: &str,
    hook_urls: &[String],
    vhost: &str,
    mut rx: mpsc::UnboundedReceiver<Relay>,
) -> Result<()> {
    // The relay starts on the Start item carrying app/stream.
    let Some(Relay::Start { app, stream }) = rx.recv().await else {
        return Ok(());
    };

    let addr: SocketAddr = resolve_destination(destination)?;
    let tc_url = format!("rtmp://{}/{}", destination, app);

    if !hook_urls.is_empty() {
        let client = HookClient {
            cid: generate_cid(),
            ip: String::new(),
            vhost: vhost.to_string(),
            app: app.clone(),
            stream: stream.clone(),
        };
        HooksClient::new()
            .call_notify("on_forward", hook_urls, body::on_forward(&client, &tc_url))
            .await?;
    }

    let mut client = RtmpClient::connect(addr, &tc_url, &app)
        .await
        .wrap("forward connect")?;
    client.publish(&stream).await.wrap("forward publish")?;
    let stream_id = client.stream_id();

    while let Some(item) = rx.recv().await {
        match item {
            Relay::Frame(msg) => {
                let mt = match msg.header.msg_type {
                    live::MessageType::Audio => message_type::AUDIO,
                    live::MessageType::Video => message_type::VIDEO,
                    _ => message_type::AMF0_DATA,
                };
                client
                    .send_message(relay_message(
                        mt,
                        msg.header.timestamp as u32,
                        stream_id,
                        msg.payload,
                    ))
                    .await?;
            }
            Relay::Stop => break,
            Relay::Start { .. } => {}
        }
    }
    log::info!("forward to {} finished", destination);
    Ok(())
}

fn resolve_destination(destination: &str) -> Result<SocketAddr> {
    use std::net::ToSocketAddrs;
    let with_port = if destination.contains(':') {
        destination.to_string()
    } else {
        format!("{}:{}", destination, rtmp::DEFAULT_PORT)
    };
    with_port
        .to_socket_addrs()
        .map_err(|e| Error::Io(e.to_string()))?
        .next()
        .ok_or_else(|| Error::ErrConfigInvalid(format!("forward destination {}", destination)))
}
