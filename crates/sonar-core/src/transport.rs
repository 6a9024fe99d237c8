//! Datagram transport abstraction
//!
//! Discovery only needs unreliable, unordered datagrams with a source
//! address. The [`Transport`] trait captures exactly that so the protocol
//! engine can run over a real UDP socket in production and over an
//! in-memory network in tests.

use crate::{Error, Result};
use std::future::Future;
use std::net::SocketAddr;
use tokio::net::{ToSocketAddrs, UdpSocket};

/// Transport trait for datagram communication
///
/// Implementations must be shareable: the receive loop and every
/// outstanding request use the same handle concurrently.
pub trait Transport: Send + Sync + 'static {
    /// The address peers should send to
    fn local_addr(&self) -> SocketAddr;

    /// Send one datagram
    fn send_to(&self, data: &[u8], target: SocketAddr) -> impl Future<Output = Result<()>> + Send;

    /// Wait for the next datagram, returning its length and source
    fn recv_from(&self, buf: &mut [u8])
        -> impl Future<Output = Result<(usize, SocketAddr)>> + Send;
}

/// Transport over a UDP socket
#[derive(Debug)]
pub struct UdpTransport {
    socket: UdpSocket,
    local_addr: SocketAddr,
}

impl UdpTransport {
    /// Bind a UDP socket
    pub async fn bind(addr: impl ToSocketAddrs) -> Result<Self> {
        let socket = UdpSocket::bind(addr).await?;
        let local_addr = socket.local_addr()?;
        tracing::debug!(%local_addr, "bound UDP socket");
        Ok(Self { socket, local_addr })
    }
}

impl Transport for UdpTransport {
    fn local_addr(&self) -> SocketAddr {
        self.local_addr
    }

    async fn send_to(&self, data: &[u8], target: SocketAddr) -> Result<()> {
        let sent = self
            .socket
            .send_to(data, target)
            .await
            .map_err(|e| Error::SendFailed(format!("{}: {}", target, e)))?;
        if sent != data.len() {
            return Err(Error::SendFailed(format!(
                "short write to {}: {} of {} bytes",
                target,
                sent,
                data.len()
            )));
        }
        Ok(())
    }

    async fn recv_from(&self, buf: &mut [u8]) -> Result<(usize, SocketAddr)> {
        self.socket
            .recv_from(buf)
            .await
            .map_err(|e| Error::ReceiveFailed(e.to_string()))
    }
}

pub mod mock {
    //! In-memory datagram network for testing
    //!
    //! Every [`MemoryTransport`] bound on a [`MemoryNetwork`] gets its own
    //! inbox. Datagrams to unknown or disconnected addresses are silently
    //! dropped, as UDP would.

    use super::*;
    use std::collections::HashMap;
    use std::net::{IpAddr, Ipv4Addr};
    use std::sync::{Arc, Mutex, MutexGuard};
    use tokio::sync::mpsc;

    const INBOX_CAPACITY: usize = 1024;
    const FIRST_PORT: u16 = 30000;

    type Datagram = (SocketAddr, Vec<u8>);

    #[derive(Default)]
    struct NetworkState {
        inboxes: HashMap<SocketAddr, mpsc::Sender<Datagram>>,
        next_port: u16,
    }

    /// A shared in-memory network
    #[derive(Clone, Default)]
    pub struct MemoryNetwork {
        state: Arc<Mutex<NetworkState>>,
    }

    impl MemoryNetwork {
        pub fn new() -> Self {
            Self::default()
        }

        fn state(&self) -> MutexGuard<'_, NetworkState> {
            self.state.lock().unwrap_or_else(|e| e.into_inner())
        }

        /// Bind a transport at a specific address
        pub fn bind(&self, addr: SocketAddr) -> Result<MemoryTransport> {
            let mut state = self.state();
            if state.inboxes.contains_key(&addr) {
                return Err(Error::InvalidAddress(format!("{} already in use", addr)));
            }
            let (tx, rx) = mpsc::channel(INBOX_CAPACITY);
            state.inboxes.insert(addr, tx.clone());
            Ok(MemoryTransport {
                network: self.clone(),
                local_addr: addr,
                inbox: tx,
                rx: tokio::sync::Mutex::new(rx),
            })
        }

        /// Bind a transport on the next free loopback port
        pub fn bind_next(&self) -> Result<MemoryTransport> {
            let addr = {
                let mut state = self.state();
                loop {
                    let port = FIRST_PORT.wrapping_add(state.next_port);
                    state.next_port = state.next_port.wrapping_add(1);
                    let addr = SocketAddr::new(IpAddr::V4(Ipv4Addr::LOCALHOST), port);
                    if !state.inboxes.contains_key(&addr) {
                        break addr;
                    }
                }
            };
            self.bind(addr)
        }

        /// Stop delivering datagrams to `addr`, as if the host went away
        pub fn disconnect(&self, addr: &SocketAddr) {
            self.state().inboxes.remove(addr);
        }

        fn deliver(&self, from: SocketAddr, to: SocketAddr, data: &[u8]) {
            let inbox = self.state().inboxes.get(&to).cloned();
            match inbox {
                Some(inbox) => {
                    if inbox.try_send((from, data.to_vec())).is_err() {
                        tracing::trace!(%from, %to, "inbox full, datagram dropped");
                    }
                }
                None => tracing::trace!(%from, %to, "no such host, datagram dropped"),
            }
        }
    }

    /// A transport endpoint on a [`MemoryNetwork`]
    pub struct MemoryTransport {
        network: MemoryNetwork,
        local_addr: SocketAddr,
        inbox: mpsc::Sender<Datagram>,
        rx: tokio::sync::Mutex<mpsc::Receiver<Datagram>>,
    }

    impl Transport for MemoryTransport {
        fn local_addr(&self) -> SocketAddr {
            self.local_addr
        }

        async fn send_to(&self, data: &[u8], target: SocketAddr) -> Result<()> {
            self.network.deliver(self.local_addr, target, data);
            Ok(())
        }

        async fn recv_from(&self, buf: &mut [u8]) -> Result<(usize, SocketAddr)> {
            let mut rx = self.rx.lock().await;
            // Our own sender keeps the channel open, so this only ends with data
            match rx.recv().await {
                Some((from, data)) => {
                    let len = data.len().min(buf.len());
                    buf[..len].copy_from_slice(&data[..len]);
                    Ok((len, from))
                }
                None => Err(Error::ReceiveFailed("inbox closed".to_string())),
            }
        }
    }

    impl Drop for MemoryTransport {
        fn drop(&mut self) {
            let mut state = self.network.state();
            let ours = state
                .inboxes
                .get(&self.local_addr)
                .map(|tx| tx.same_channel(&self.inbox))
                .unwrap_or(false);
            if ours {
                state.inboxes.remove(&self.local_addr);
            }
        }
    }

    #[cfg(test)]
    mod tests {
        use super::*;
        use std::time::Duration;

        #[tokio::test]
        async fn test_memory_send_receive() {
            let network = MemoryNetwork::new();
            let a = network.bind_next().unwrap();
            let b = network.bind_next().unwrap();
            assert_ne!(a.local_addr(), b.local_addr());

            a.send_to(b"hello", b.local_addr()).await.unwrap();

            let mut buf = [0u8; 64];
            let (len, from) = b.recv_from(&mut buf).await.unwrap();
            assert_eq!(&buf[..len], b"hello");
            assert_eq!(from, a.local_addr());
        }

        #[tokio::test]
        async fn test_disconnected_host_drops_datagrams() {
            let network = MemoryNetwork::new();
            let a = network.bind_next().unwrap();
            let b = network.bind_next().unwrap();

            network.disconnect(&b.local_addr());
            a.send_to(b"lost", b.local_addr()).await.unwrap();

            let mut buf = [0u8; 64];
            let received =
                tokio::time::timeout(Duration::from_millis(50), b.recv_from(&mut buf)).await;
            assert!(received.is_err());
        }

        #[tokio::test]
        async fn test_drop_releases_address() {
            let network = MemoryNetwork::new();
            let a = network.bind_next().unwrap();
            let addr = a.local_addr();

            assert!(network.bind(addr).is_err());
            drop(a);
            assert!(network.bind(addr).is_ok());
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_udp_loopback() {
        let a = UdpTransport::bind("127.0.0.1:0").await.unwrap();
        let b = UdpTransport::bind("127.0.0.1:0").await.unwrap();

        a.send_to(b"ping", b.local_addr()).await.unwrap();

        let mut buf = [0u8; 16];
        let (len, from) = b.recv_from(&mut buf).await.unwrap();
        assert_eq!(&buf[..len], b"ping");
        assert_eq!(from, a.local_addr());
    }
}
