//! TCP and UDP relays between a host listener and a container address.

use std::collections::HashMap;
use std::io;
use std::net::{IpAddr, Ipv4Addr, Ipv6Addr, SocketAddr};
use std::sync::Arc;
use std::time::Duration;

use log::{debug, warn};
use tokio::net::{TcpListener, TcpStream, UdpSocket};
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;

use crate::resources::Protocol;

/// Upstream sockets of UDP peers that have been quiet this long are dropped.
const UDP_PEER_IDLE: Duration = Duration::from_secs(120);

const UDP_BUFFER_SIZE: usize = 65535;

/// A bound host-side endpoint.
pub(crate) enum Listener {
    Tcp(TcpListener),
    Udp(UdpSocket),
}

impl Listener {
    pub(crate) async fn bind(protocol: Protocol, addr: SocketAddr) -> io::Result<Self> {
        match protocol {
            Protocol::Tcp => Ok(Listener::Tcp(TcpListener::bind(addr).await?)),
            Protocol::Udp => Ok(Listener::Udp(UdpSocket::bind(addr).await?)),
        }
    }
}

/// A running relay. Dropping it leaves the relay running; call
/// [`ProxyHandle::shutdown`] to close it.
pub(crate) struct ProxyHandle {
    cancel: CancellationToken,
    task: JoinHandle<()>,
}

impl ProxyHandle {
    /// Stop relaying and wait until the host listener is closed.
    pub(crate) async fn shutdown(self) {
        self.cancel.cancel();
        if let Err(e) = self.task.await
            && e.is_panic()
        {
            warn!("port relay task panicked: {}", e);
        }
    }
}

/// Start relaying traffic from `listener` to `upstream`.
pub(crate) fn spawn(listener: Listener, upstream: SocketAddr, connect_timeout: Duration) -> ProxyHandle {
    let cancel = CancellationToken::new();
    let token = cancel.clone();
    let task = match listener {
        Listener::Tcp(listener) => {
            tokio::spawn(async move { tcp_relay(listener, upstream, connect_timeout, token).await })
        }
        Listener::Udp(socket) => {
            tokio::spawn(async move { udp_relay(Arc::new(socket), upstream, token).await })
        }
    };
    ProxyHandle { cancel, task }
}

async fn tcp_relay(
    listener: TcpListener,
    upstream: SocketAddr,
    connect_timeout: Duration,
    cancel: CancellationToken,
) {
    let host_port = listener.local_addr().map(|a| a.port()).unwrap_or(0);
    loop {
        tokio::select! {
            biased;
            _ = cancel.cancelled() => break,
            result = listener.accept() => match result {
                Ok((inbound, peer)) => {
                    debug!("tcp :{} accepted {} -> {}", host_port, peer, upstream);
                    let conn_cancel = cancel.child_token();
                    tokio::spawn(async move {
                        tokio::select! {
                            _ = conn_cancel.cancelled() => {}
                            result = relay_connection(inbound, upstream, connect_timeout) => {
                                if let Err(e) = result {
                                    debug!("tcp :{} connection from {} ended: {}", host_port, peer, e);
                                }
                            }
                        }
                    });
                }
                Err(e) => {
                    warn!("tcp :{} accept failed: {}", host_port, e);
                    // Avoid spinning on persistent errors such as fd exhaustion.
                    tokio::time::sleep(Duration::from_millis(50)).await;
                }
            }
        }
    }
    debug!("tcp relay on :{} closed", host_port);
}

async fn relay_connection(
    mut inbound: TcpStream,
    upstream: SocketAddr,
    connect_timeout: Duration,
) -> io::Result<()> {
    let mut outbound = tokio::time::timeout(connect_timeout, TcpStream::connect(upstream))
        .await
        .map_err(|_| io::Error::new(io::ErrorKind::TimedOut, "connecting to container timed out"))??;
    tokio::io::copy_bidirectional(&mut inbound, &mut outbound).await?;
    Ok(())
}

struct UdpPeer {
    socket: Arc<UdpSocket>,
    cancel: CancellationToken,
}

async fn udp_relay(socket: Arc<UdpSocket>, upstream: SocketAddr, cancel: CancellationToken) {
    let host_port = socket.local_addr().map(|a| a.port()).unwrap_or(0);
    let mut peers: HashMap<SocketAddr, UdpPeer> = HashMap::new();
    let mut buf = vec![0u8; UDP_BUFFER_SIZE];

    loop {
        tokio::select! {
            biased;
            _ = cancel.cancelled() => break,
            result = socket.recv_from(&mut buf) => {
                let (len, peer) = match result {
                    Ok(received) => received,
                    Err(e) => {
                        debug!("udp :{} receive failed: {}", host_port, e);
                        continue;
                    }
                };

                peers.retain(|_, p| !p.cancel.is_cancelled());
                if !peers.contains_key(&peer) {
                    match open_udp_peer(&socket, peer, upstream, &cancel).await {
                        Ok(entry) => {
                            peers.insert(peer, entry);
                        }
                        Err(e) => {
                            warn!("udp :{} cannot reach {}: {}", host_port, upstream, e);
                            continue;
                        }
                    }
                }
                if let Some(entry) = peers.get(&peer)
                    && let Err(e) = entry.socket.send(&buf[..len]).await
                {
                    debug!("udp :{} forward from {} failed: {}", host_port, peer, e);
                }
            }
        }
    }
    debug!("udp relay on :{} closed", host_port);
}

/// Connect a fresh upstream socket for `peer` and spawn the task that
/// carries replies back.
async fn open_udp_peer(
    host_socket: &Arc<UdpSocket>,
    peer: SocketAddr,
    upstream: SocketAddr,
    relay_cancel: &CancellationToken,
) -> io::Result<UdpPeer> {
    let local: SocketAddr = match upstream.ip() {
        IpAddr::V4(_) => (Ipv4Addr::UNSPECIFIED, 0).into(),
        IpAddr::V6(_) => (Ipv6Addr::UNSPECIFIED, 0).into(),
    };
    let upstream_socket = UdpSocket::bind(local).await?;
    upstream_socket.connect(upstream).await?;
    let upstream_socket = Arc::new(upstream_socket);

    let cancel = relay_cancel.child_token();
    let replies = Arc::clone(&upstream_socket);
    let host = Arc::clone(host_socket);
    let token = cancel.clone();
    tokio::spawn(async move {
        let mut buf = vec![0u8; UDP_BUFFER_SIZE];
        loop {
            tokio::select! {
                _ = token.cancelled() => break,
                result = tokio::time::timeout(UDP_PEER_IDLE, replies.recv(&mut buf)) => match result {
                    Ok(Ok(len)) => {
                        if let Err(e) = host.send_to(&buf[..len], peer).await {
                            debug!("udp reply to {} failed: {}", peer, e);
                        }
                    }
                    Ok(Err(e)) => {
                        debug!("udp upstream for {} failed: {}", peer, e);
                        break;
                    }
                    Err(_) => break,
                },
            }
        }
        token.cancel();
    });

    Ok(UdpPeer {
        socket: upstream_socket,
        cancel,
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use tokio::io::{AsyncReadExt, AsyncWriteExt};

    fn localhost(port: u16) -> SocketAddr {
        (Ipv4Addr::LOCALHOST, port).into()
    }

    #[tokio::test]
    async fn test_tcp_relay_and_shutdown() {
        let backend = TcpListener::bind(localhost(0)).await.unwrap();
        let backend_addr = backend.local_addr().unwrap();
        tokio::spawn(async move {
            while let Ok((mut stream, _)) = backend.accept().await {
                tokio::spawn(async move {
                    let mut buf = [0u8; 64];
                    while let Ok(n) = stream.read(&mut buf).await {
                        if n == 0 || stream.write_all(&buf[..n]).await.is_err() {
                            break;
                        }
                    }
                });
            }
        });

        let listener = Listener::bind(Protocol::Tcp, localhost(0)).await.unwrap();
        let Listener::Tcp(ref tcp) = listener else {
            unreachable!()
        };
        let host_addr = tcp.local_addr().unwrap();
        let handle = spawn(listener, backend_addr, Duration::from_secs(1));

        let mut client = TcpStream::connect(host_addr).await.unwrap();
        client.write_all(b"ping").await.unwrap();
        let mut reply = [0u8; 4];
        client.read_exact(&mut reply).await.unwrap();
        assert_eq!(&reply, b"ping");

        handle.shutdown().await;
        // The listener is gone once shutdown returns, so the port can be bound again.
        TcpListener::bind(host_addr).await.unwrap();
    }

    #[tokio::test]
    async fn test_udp_relay_answers_each_peer() {
        let backend = UdpSocket::bind(localhost(0)).await.unwrap();
        let backend_addr = backend.local_addr().unwrap();
        tokio::spawn(async move {
            let mut buf = [0u8; 64];
            while let Ok((n, from)) = backend.recv_from(&mut buf).await {
                let _ = backend.send_to(&buf[..n], from).await;
            }
        });

        let listener = Listener::bind(Protocol::Udp, localhost(0)).await.unwrap();
        let Listener::Udp(ref udp) = listener else {
            unreachable!()
        };
        let host_addr = udp.local_addr().unwrap();
        let handle = spawn(listener, backend_addr, Duration::from_secs(1));

        for payload in [&b"one"[..], &b"two"[..]] {
            let client = UdpSocket::bind(localhost(0)).await.unwrap();
            client.send_to(payload, host_addr).await.unwrap();
            let mut buf = [0u8; 16];
            let (n, from) = tokio::time::timeout(Duration::from_secs(2), client.recv_from(&mut buf))
                .await
                .unwrap()
                .unwrap();
            assert_eq!(&buf[..n], payload);
            assert_eq!(from, host_addr);
        }

        handle.shutdown().await;
    }
}
