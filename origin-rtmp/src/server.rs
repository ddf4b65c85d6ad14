//! The server-side RTMP session: handshake, connect, identify, then the
//! publish or play message loops.

use bytes::Bytes;
use codec::amf0::Amf0Value;
use runtime::TcpFd;
use shared::error::{Error, Result, WrapExt};
use std::collections::VecDeque;
use std::time::Duration;

use crate::chunk::{message_type, ChunkDecoder, ChunkEncoder, RtmpMessage};
use crate::packet::{self, Command};
use crate::request::RtmpRequest;
use crate::{handshake, RTMP_TIMEOUT, SERVER_CHUNK_SIZE};

const WINDOW_ACK_SIZE: u32 = 2_500_000;
const PEER_BANDWIDTH: u32 = 2_500_000;
const READ_BUFFER: usize = 16 * 1024;

/// What the connected client wants to do.
#[derive(Debug, Clone, PartialEq)]
pub enum ClientType {
    Publish { stream: String },
    Play { stream: String },
}

pub struct RtmpServer {
    fd: TcpFd,
    decoder: ChunkDecoder,
    encoder: ChunkEncoder,
    pending: VecDeque<RtmpMessage>,
    last_acked: u64,
    stream_id: u32,
}

impl RtmpServer {
    pub fn new(fd: TcpFd) -> Self {
        Self {
            fd,
            decoder: ChunkDecoder::new(),
            encoder: ChunkEncoder::new(),
            pending: VecDeque::new(),
            last_acked: 0,
            stream_id: 1,
        }
    }

    pub fn fd(&mut self) -> &mut TcpFd {
        &mut self.fd
    }

    pub async fn handshake(&mut self) -> Result<()> {
        handshake::server_handshake(&mut self.fd, RTMP_TIMEOUT).await
    }

    /// Waits for the connect command, replies with the control burst and
    /// `_result`, and returns the parsed request.
    pub async fn connect_app(&mut self) -> Result<RtmpRequest> {
        loop {
            let msg = self.recv_message(RTMP_TIMEOUT).await?;
            if msg.message_type != message_type::AMF0_COMMAND {
                continue;
            }
            let cmd = Command::decode(&msg.payload).wrap("decode connect")?;
            if cmd.name != "connect" {
                continue;
            }
            let obj = cmd
                .args
                .first()
                .ok_or_else(|| Error::ErrRtmpCommand("connect without object".to_string()))?;
            let tc_url = obj
                .get("tcUrl")
                .and_then(|v| v.as_str())
                .ok_or_else(|| Error::ErrRtmpTcUrl("missing".to_string()))?;
            let mut request = RtmpRequest::parse_tc_url(tc_url);
            if let Some(page) = obj.get("pageUrl").and_then(|v| v.as_str()) {
                request.page_url = page.to_string();
            }

            self.send_message(packet::window_ack_size(WINDOW_ACK_SIZE))
                .await?;
            self.send_message(packet::set_peer_bandwidth(PEER_BANDWIDTH, 2))
                .await?;
            self.send_message(packet::set_chunk_size(SERVER_CHUNK_SIZE))
                .await?;
            self.encoder.set_out_chunk_size(SERVER_CHUNK_SIZE);
            self.send_message(packet::connect_result(cmd.transaction_id).into_message(0))
                .await?;
            log::info!("rtmp connect app, tcUrl={}", tc_url);
            return Ok(request);
        }
    }

    /// Drives the command exchange until the client declares itself a
    /// publisher or a player.
    pub async fn identify_client(&mut self) -> Result<ClientType> {
        loop {
            let msg = self.recv_message(RTMP_TIMEOUT).await?;
            if msg.message_type != message_type::AMF0_COMMAND {
                continue;
            }
            let cmd = Command::decode(&msg.payload).wrap("identify")?;
            match cmd.name.as_str() {
                "createStream" => {
                    self.send_message(
                        packet::create_stream_result(cmd.transaction_id, self.stream_id)
                            .into_message(0),
                    )
                    .await?;
                }
                "releaseStream" | "FCPublish" | "FCUnpublish" => {
                    let reply = Command {
                        name: "_result".to_string(),
                        transaction_id: cmd.transaction_id,
                        args: vec![Amf0Value::Null, Amf0Value::Undefined],
                    };
                    self.send_message(reply.into_message(0)).await?;
                }
                "publish" => {
                    // args: [null, stream, type]
                    let stream = cmd
                        .args
                        .get(1)
                        .and_then(|v| v.as_str())
                        .ok_or_else(|| Error::ErrRtmpCommand("publish".to_string()))?;
                    return Ok(ClientType::Publish {
                        stream: stream.to_string(),
                    });
                }
                "play" => {
                    let stream = cmd
                        .args
                        .get(1)
                        .and_then(|v| v.as_str())
                        .ok_or_else(|| Error::ErrRtmpCommand("play".to_string()))?;
                    return Ok(ClientType::Play {
                        stream: stream.to_string(),
                    });
                }
                other => {
                    log::debug!("ignore command {}", other);
                }
            }
        }
    }

    /// Acknowledges the publisher so it starts pushing media.
    pub async fn start_publish(&mut self) -> Result<()> {
        self.send_message(
            packet::on_status(packet::status::PUBLISH_START, "Started publishing stream.")
                .into_message(self.stream_id),
        )
        .await
    }

    /// The play response burst: StreamBegin, reset, start.
    pub async fn start_play(&mut self) -> Result<()> {
        self.send_message(packet::stream_begin(self.stream_id)).await?;
        self.send_message(
            packet::on_status(packet::status::PLAY_RESET, "Playing and resetting stream.")
                .into_message(self.stream_id),
        )
        .await?;
        self.send_message(
            packet::on_status(packet::status::PLAY_START, "Started playing stream.")
                .into_message(self.stream_id),
        )
        .await
    }

    /// Rejects a second publisher or a gated session, then the caller
    /// closes the connection.
    pub async fn reject(&mut self, code: &str, description: &str) -> Result<()> {
        self.send_message(packet::on_status(code, description).into_message(self.stream_id))
            .await
    }

    /// Receives the next message, transparently answering acks.
    pub async fn recv_message(&mut self, timeout: Duration) -> Result<RtmpMessage> {
        loop {
            if let Some(msg) = self.pending.pop_front() {
                return Ok(msg);
            }
            let mut buf = [0u8; READ_BUFFER];
            let n = self.fd.read(&mut buf, Some(timeout)).await?;
            let msgs = self.decoder.feed(&buf[..n])?;
            self.pending.extend(msgs);

            // Window acknowledgement.
            if self.decoder.in_bytes - self.last_acked >= WINDOW_ACK_SIZE as u64 {
                self.last_acked = self.decoder.in_bytes;
                self.send_message(packet::ack(self.decoder.in_bytes as u32))
                    .await?;
            }
        }
    }

    pub async fn send_message(&mut self, msg: RtmpMessage) -> Result<()> {
        let data = self.encoder.encode(&msg);
        self.fd.write(&data, Some(RTMP_TIMEOUT)).await
    }

    /// Serializes a batch in one write, for the play fast path.
    pub async fn send_messages(&mut self, msgs: &[RtmpMessage]) -> Result<()> {
        let mut chunks = Vec::with_capacity(msgs.len());
        for msg in msgs {
            chunks.push(self.encoder.encode(msg));
        }
        let slices: Vec<&[u8]> = chunks.iter().map(|c| c.as_ref()).collect();
        self.fd.writev(&slices, Some(RTMP_TIMEOUT)).await?;
        Ok(())
    }
}

/// A metadata payload stripped of the `@setDataFrame` wrapper, ready for
/// the source cache.
pub fn strip_set_data_frame(payload: &Bytes) -> Result<Bytes> {
    let mut buf = payload.clone();
    let probe = Amf0Value::read(&mut buf)?;
    if probe.as_str() == Some("@setDataFrame") {
        Ok(buf)
    } else {
        Ok(payload.clone())
    }
}
