use crate::executor::io_timeout;
use crate::kbps::IoStat;
use shared::error::{Error, Result};
use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::{TcpStream, UdpSocket};

/// A TCP descriptor with per-call timeouts and byte accounting.
///
/// Every operation is a suspension point. `timeout = None` is the no-timeout
/// sentinel; expiry surfaces as [Error::ErrTimeout], never EOF.
pub struct TcpFd {
    stream: TcpStream,
    stat: Arc<IoStat>,
}

impl TcpFd {
    pub fn new(stream: TcpStream) -> Self {
        Self {
            stream,
            stat: Arc::new(IoStat::default()),
        }
    }

    /// Byte counters, shareable with a [crate::kbps::NetworkDelta].
    pub fn stat(&self) -> Arc<IoStat> {
        self.stat.clone()
    }

    pub fn peer_addr(&self) -> Result<SocketAddr> {
        Ok(self.stream.peer_addr()?)
    }

    pub fn local_addr(&self) -> Result<SocketAddr> {
        Ok(self.stream.local_addr()?)
    }

    pub fn set_nodelay(&self, v: bool) -> Result<()> {
        Ok(self.stream.set_nodelay(v)?)
    }

    /// Reads at most `buf.len()` bytes; 0 bytes is EOF.
    pub async fn read(&mut self, buf: &mut [u8], timeout: Option<Duration>) -> Result<usize> {
        io_timeout(timeout, async {
            let n = self.stream.read(buf).await?;
            if n == 0 {
                return Err(Error::ErrEof);
            }
            self.stat.add_in(n as u64);
            Ok(n)
        })
        .await
    }

    /// Reads exactly `buf.len()` bytes.
    pub async fn read_fully(&mut self, buf: &mut [u8], timeout: Option<Duration>) -> Result<()> {
        io_timeout(timeout, async {
            self.stream.read_exact(buf).await?;
            self.stat.add_in(buf.len() as u64);
            Ok(())
        })
        .await
    }

    pub async fn write(&mut self, buf: &[u8], timeout: Option<Duration>) -> Result<()> {
        io_timeout(timeout, async {
            self.stream.write_all(buf).await?;
            self.stat.add_out(buf.len() as u64);
            Ok(())
        })
        .await
    }

    /// Gathering write; each slice is written fully, in order.
    pub async fn writev(&mut self, bufs: &[&[u8]], timeout: Option<Duration>) -> Result<usize> {
        io_timeout(timeout, async {
            let mut nn = 0usize;
            for buf in bufs {
                self.stream.write_all(buf).await?;
                nn += buf.len();
            }
            self.stat.add_out(nn as u64);
            Ok(nn)
        })
        .await
    }
}

/// A UDP descriptor with per-call timeouts and byte accounting.
pub struct UdpFd {
    socket: UdpSocket,
    stat: Arc<IoStat>,
}

impl UdpFd {
    pub fn new(socket: UdpSocket) -> Self {
        Self {
            socket,
            stat: Arc::new(IoStat::default()),
        }
    }

    pub fn stat(&self) -> Arc<IoStat> {
        self.stat.clone()
    }

    pub fn local_addr(&self) -> Result<SocketAddr> {
        Ok(self.socket.local_addr()?)
    }

    pub async fn recvfrom(
        &self,
        buf: &mut [u8],
        timeout: Option<Duration>,
    ) -> Result<(usize, SocketAddr)> {
        io_timeout(timeout, async {
            let (n, from) = self.socket.recv_from(buf).await?;
            self.stat.add_in(n as u64);
            Ok((n, from))
        })
        .await
    }

    pub async fn sendto(
        &self,
        buf: &[u8],
        to: SocketAddr,
        timeout: Option<Duration>,
    ) -> Result<usize> {
        io_timeout(timeout, async {
            let n = self.socket.send_to(buf, to).await?;
            self.stat.add_out(n as u64);
            Ok(n)
        })
        .await
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::executor::{Runtime, NO_TIMEOUT};

    #[test]
    fn test_tcp_read_timeout() {
        let rt = Runtime::new().unwrap();
        rt.block_on(async {
            let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
            let addr = listener.local_addr().unwrap();
            let _server = crate::spawn("srv", async move {
                // Accept and hold the connection open without writing.
                let (s, _) = listener.accept().await.unwrap();
                crate::usleep(Duration::from_secs(5)).await;
                drop(s);
            });
            let stream = TcpStream::connect(addr).await.unwrap();
            let mut fd = TcpFd::new(stream);
            let mut buf = [0u8; 4];
            let err = fd
                .read(&mut buf, Some(Duration::from_millis(10)))
                .await
                .unwrap_err();
            assert_eq!(err, Error::ErrTimeout);
        });
    }

    #[test]
    fn test_tcp_roundtrip_and_accounting() {
        let rt = Runtime::new().unwrap();
        rt.block_on(async {
            let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
            let addr = listener.local_addr().unwrap();
            let server = crate::spawn("srv", async move {
                let (s, _) = listener.accept().await.unwrap();
                let mut fd = TcpFd::new(s);
                let mut buf = [0u8; 5];
                fd.read_fully(&mut buf, NO_TIMEOUT).await.unwrap();
                fd.write(&buf, NO_TIMEOUT).await.unwrap();
                (fd.stat().recv_bytes(), fd.stat().send_bytes())
            });
            let stream = TcpStream::connect(addr).await.unwrap();
            let mut fd = TcpFd::new(stream);
            fd.writev(&[b"he", b"llo"], NO_TIMEOUT).await.unwrap();
            let mut buf = [0u8; 5];
            fd.read_fully(&mut buf, NO_TIMEOUT).await.unwrap();
            assert_eq!(&buf, b"hello");
            assert_eq!(fd.stat().send_bytes(), 5);
            assert_eq!(fd.stat().recv_bytes(), 5);
            let (srv_in, srv_out) = server.await.unwrap();
            assert_eq!((srv_in, srv_out), (5, 5));
        });
    }

    #[test]
    fn test_udp_roundtrip() {
        let rt = Runtime::new().unwrap();
        rt.block_on(async {
            let a = UdpFd::new(UdpSocket::bind("127.0.0.1:0").await.unwrap());
            let b = UdpFd::new(UdpSocket::bind("127.0.0.1:0").await.unwrap());
            let baddr = b.local_addr().unwrap();
            a.sendto(b"ping", baddr, NO_TIMEOUT).await.unwrap();
            let mut buf = [0u8; 16];
            let (n, from) = b.recvfrom(&mut buf, Some(Duration::from_secs(1))).await.unwrap();
            assert_eq!(&buf[..n], b"ping");
            assert_eq!(from, a.local_addr().unwrap());
        });
    }
}
