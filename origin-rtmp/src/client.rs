//! The client side of RTMP, for forward pushes to another origin.

use bytes::Bytes;
use codec::amf0::Amf0Value;
use rand::RngCore;
use runtime::TcpFd;
use shared::error::{Error, Result, WrapExt};
use std::collections::VecDeque;
use std::net::SocketAddr;
use tokio::net::TcpStream;

use crate::chunk::{message_type, ChunkDecoder, ChunkEncoder, RtmpMessage};
use crate::handshake::HANDSHAKE_SIZE;
use crate::packet::{self, Command};
use crate::{RTMP_TIMEOUT, SERVER_CHUNK_SIZE};

pub struct RtmpClient {
    fd: TcpFd,
    decoder: ChunkDecoder,
    encoder: ChunkEncoder,
    pending: VecDeque<RtmpMessage>,
    next_transaction: f64,
    stream_id: u32,
}

impl RtmpClient {
    /// Connects, handshakes and issues the connect command.
    pub async fn connect(addr: SocketAddr, tc_url: &str, app: &str) -> Result<RtmpClient> {
        let stream = TcpStream::connect(addr)
            .await
            .map_err(|e| Error::Io(e.to_string()))
            .with_wrap(|| format!("connect {}", addr))?;
        let _ = stream.set_nodelay(true);
        let mut client = RtmpClient {
            fd: TcpFd::new(stream),
            decoder: ChunkDecoder::new(),
            encoder: ChunkEncoder::new(),
            pending: VecDeque::new(),
            next_transaction: 1.0,
            stream_id: 0,
        };
        client.handshake().await.wrap("client handshake")?;
        client.connect_app(tc_url, app).await.wrap("client connect")?;
        Ok(client)
    }

    async fn handshake(&mut self) -> Result<()> {
        let mut c0c1 = vec![0u8; 1 + HANDSHAKE_SIZE];
        c0c1[0] = 0x03;
        rand::thread_rng().fill_bytes(&mut c0c1[1..]);
        c0c1[1..5].copy_from_slice(&0u32.to_be_bytes());
        c0c1[5..9].copy_from_slice(&[0, 0, 0, 0]);
        self.fd.write(&c0c1, Some(RTMP_TIMEOUT)).await?;

        let mut s0s1s2 = vec![0u8; 1 + 2 * HANDSHAKE_SIZE];
        self.fd.read_fully(&mut s0s1s2, Some(RTMP_TIMEOUT)).await?;
        if s0s1s2[0] != 0x03 {
            return Err(Error::ErrRtmpHandshake);
        }
        // c2 echoes s1.
        self.fd
            .write(&s0s1s2[1..1 + HANDSHAKE_SIZE], Some(RTMP_TIMEOUT))
            .await?;
        Ok(())
    }

    fn transaction(&mut self) -> f64 {
        let id = self.next_transaction;
        self.next_transaction += 1.0;
        id
    }

    async fn connect_app(&mut self, tc_url: &str, app: &str) -> Result<()> {
        let mut obj = Amf0Value::object();
        obj.set("app", Amf0Value::String(app.to_string()));
        obj.set("type", Amf0Value::String("nonprivate".to_string()));
        obj.set("flashVer", Amf0Value::String("FMLE/3.0 (compatible; origin)".to_string()));
        obj.set("tcUrl", Amf0Value::String(tc_url.to_string()));
        let tid = self.transaction();
        let connect = Command {
            name: "connect".to_string(),
            transaction_id: tid,
            args: vec![obj],
        };
        self.send_message(connect.into_message(0)).await?;
        self.send_message(packet::set_chunk_size(SERVER_CHUNK_SIZE))
            .await?;
        self.encoder.set_out_chunk_size(SERVER_CHUNK_SIZE);
        self.expect_result("connect").await?;
        Ok(())
    }

    /// createStream then publish; afterwards AV flows with send_message.
    pub async fn publish(&mut self, stream: &str) -> Result<()> {
        let tid = self.transaction();
        let create = Command {
            name: "createStream".to_string(),
            transaction_id: tid,
            args: vec![Amf0Value::Null],
        };
        self.send_message(create.into_message(0)).await?;
        let result = self.expect_result("createStream").await?;
        self.stream_id = result
            .args
            .iter()
            .find_map(|v| v.as_number())
            .unwrap_or(1.0) as u32;

        let tid = self.transaction();
        let publish = Command {
            name: "publish".to_string(),
            transaction_id: tid,
            args: vec![
                Amf0Value::Null,
                Amf0Value::String(stream.to_string()),
                Amf0Value::String("live".to_string()),
            ],
        };
        self.send_message(publish.into_message(self.stream_id))
            .await?;
        log::info!("forward client publishing {}", stream);
        Ok(())
    }

    pub fn stream_id(&self) -> u32 {
        self.stream_id
    }

    pub async fn send_message(&mut self, msg: RtmpMessage) -> Result<()> {
        let data = self.encoder.encode(&msg);
        self.fd.write(&data, Some(RTMP_TIMEOUT)).await
    }

    async fn recv_message(&mut self) -> Result<RtmpMessage> {
        loop {
            if let Some(msg) = self.pending.pop_front() {
                return Ok(msg);
            }
            let mut buf = [0u8; 4096];
            let n = self.fd.read(&mut buf, Some(RTMP_TIMEOUT)).await?;
            self.pending.extend(self.decoder.feed(&buf[..n])?);
        }
    }

    async fn expect_result(&mut self, context: &str) -> Result<Command> {
        loop {
            let msg = self.recv_message().await?;
            if msg.message_type != message_type::AMF0_COMMAND {
                continue;
            }
            let cmd = Command::decode(&msg.payload)?;
            match cmd.name.as_str() {
                "_result" => return Ok(cmd),
                "_error" => {
                    return Err(Error::ErrRtmpCommand(format!("{} refused", context)));
                }
                _ => continue,
            }
        }
    }
}

/// AV relay helper: a hub message as an outbound RTMP message.
pub fn relay_message(msg_type: u8, timestamp: u32, stream_id: u32, payload: Bytes) -> RtmpMessage {
    RtmpMessage::new(msg_type, timestamp, stream_id, payload)
}

#[cfg(test)]
mod tests {
    use super::*;
    use runtime::executor::Runtime;
    use tokio::net::TcpListener;

    #[test]
    fn test_client_against_our_server() {
        let rt = Runtime::new().unwrap();
        rt.block_on(async {
            let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
            let addr = listener.local_addr().unwrap();

            let server = runtime::spawn("server", async move {
                let (stream, _) = listener.accept().await.unwrap();
                let mut rtmp = crate::server::RtmpServer::new(TcpFd::new(stream));
                rtmp.handshake().await?;
                let request = rtmp.connect_app().await?;
                let client = rtmp.identify_client().await?;
                rtmp.start_publish().await?;
                // One relayed video message lands.
                let msg = rtmp.recv_message(RTMP_TIMEOUT).await?;
                Ok::<_, Error>((request, client, msg))
            });

            let tc_url = format!("rtmp://127.0.0.1:{}/live", addr.port());
            let mut client = RtmpClient::connect(addr, &tc_url, "live").await.unwrap();
            client.publish("forwarded").await.unwrap();
            client
                .send_message(relay_message(
                    message_type::VIDEO,
                    40,
                    client.stream_id(),
                    Bytes::from_static(&[0x17, 0x01, 0, 0, 0]),
                ))
                .await
                .unwrap();

            let (request, client_type, msg) = server.await.unwrap().unwrap();
            assert_eq!(request.app, "live");
            assert_eq!(
                client_type,
                crate::server::ClientType::Publish {
                    stream: "forwarded".to_string()
                }
            );
            assert!(msg.is_video());
            assert_eq!(msg.timestamp, 40);
        });
    }
}
