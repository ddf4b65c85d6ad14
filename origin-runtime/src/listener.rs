use shared::error::{Error, Result};
use socket2::{Domain, Protocol, Socket, Type};
use std::future::Future;
use std::net::SocketAddr;
use tokio::net::{TcpListener, TcpStream, UdpSocket};

use crate::interrupt::Interrupt;

/// Listen backlog for all TCP acceptors.
const TCP_BACKLOG: i32 = 512;
/// UDP socket buffers are raised to roughly this size, best-effort.
const UDP_SO_BUF: usize = 10 * 1024 * 1024;

/// Binds a TCP server socket with the engine's mandatory options:
/// close-on-exec, SO_REUSEADDR, best-effort SO_REUSEPORT, SO_KEEPALIVE and a
/// backlog of 512.
pub fn tcp_listen(addr: SocketAddr) -> Result<TcpListener> {
    let domain = if addr.is_ipv6() {
        Domain::IPV6
    } else {
        Domain::IPV4
    };
    let socket = Socket::new(domain, Type::STREAM.cloexec(), Some(Protocol::TCP))
        .map_err(|e| Error::Io(e.to_string()))?;
    socket.set_reuse_address(true)?;
    #[cfg(all(unix, not(target_os = "solaris"), not(target_os = "illumos")))]
    if let Err(e) = socket.set_reuse_port(true) {
        log::warn!("ignore SO_REUSEPORT on {}: {}", addr, e);
    }
    socket.set_keepalive(true)?;
    socket.set_nonblocking(true)?;
    socket.bind(&addr.into())?;
    socket.listen(TCP_BACKLOG)?;
    let listener = TcpListener::from_std(socket.into())?;
    log::info!("tcp listen at {}", addr);
    Ok(listener)
}

/// Binds a UDP socket with ~10MB send/receive buffers, best-effort.
pub fn udp_listen(addr: SocketAddr) -> Result<UdpSocket> {
    let domain = if addr.is_ipv6() {
        Domain::IPV6
    } else {
        Domain::IPV4
    };
    let socket = Socket::new(domain, Type::DGRAM.cloexec(), Some(Protocol::UDP))
        .map_err(|e| Error::Io(e.to_string()))?;
    socket.set_reuse_address(true)?;
    if let Err(e) = socket.set_recv_buffer_size(UDP_SO_BUF) {
        log::warn!("ignore SO_RCVBUF on {}: {}", addr, e);
    }
    if let Err(e) = socket.set_send_buffer_size(UDP_SO_BUF) {
        log::warn!("ignore SO_SNDBUF on {}: {}", addr, e);
    }
    socket.set_nonblocking(true)?;
    socket.bind(&addr.into())?;
    let socket = UdpSocket::from_std(socket.into())?;
    log::info!("udp listen at {}", addr);
    Ok(socket)
}

/// Accept loop: each accepted descriptor is handed to `handler`, which
/// typically spawns a per-connection coroutine and returns immediately.
/// Runs until interrupted.
pub async fn run_tcp_listener<F, Fut>(
    listener: TcpListener,
    interrupt: Interrupt,
    handler: F,
) -> Result<()>
where
    F: Fn(TcpStream, SocketAddr) -> Fut,
    Fut: Future<Output = ()>,
{
    loop {
        tokio::select! {
            r = listener.accept() => {
                let (stream, peer) = r.map_err(|e| Error::Io(e.to_string()))?;
                handler(stream, peer).await;
            }
            _ = interrupt.interrupted() => {
                return Err(Error::ErrInterrupted);
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::executor::Runtime;
    use std::cell::Cell;
    use std::rc::Rc;

    #[test]
    fn test_tcp_listen_and_accept() {
        let rt = Runtime::new().unwrap();
        rt.block_on(async {
            let listener = tcp_listen("127.0.0.1:0".parse().unwrap()).unwrap();
            let addr = listener.local_addr().unwrap();
            let interrupt = Interrupt::new();
            let accepted = Rc::new(Cell::new(0u32));

            let n = accepted.clone();
            let i2 = interrupt.clone();
            let loop_task = crate::spawn("listener", async move {
                run_tcp_listener(listener, i2, move |_s, _peer| {
                    let n = n.clone();
                    async move {
                        n.set(n.get() + 1);
                    }
                })
                .await
            });

            let _c = TcpStream::connect(addr).await.unwrap();
            crate::usleep(std::time::Duration::from_millis(20)).await;
            interrupt.interrupt();
            let r = loop_task.await.unwrap();
            assert_eq!(r.unwrap_err(), Error::ErrInterrupted);
            assert_eq!(accepted.get(), 1);
        });
    }

    #[test]
    fn test_udp_listen_binds() {
        let rt = Runtime::new().unwrap();
        rt.block_on(async {
            let socket = udp_listen("127.0.0.1:0".parse().unwrap()).unwrap();
            assert_ne!(socket.local_addr().unwrap().port(), 0);
        });
    }
}
