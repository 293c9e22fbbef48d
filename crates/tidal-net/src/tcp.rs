//! TCP transport.
//!
//! Socket I/O runs on a small private tokio runtime. Each accepted or dialled
//! connection gets a reader task and a writer task; everything they observe is
//! pushed into a channel that [`Transport::poll`] drains on the caller's
//! thread, so no user logic ever runs on a runtime worker.
//!
//! TCP is reliable and ordered, so both [`DeliveryMode`]s travel the same
//! stream; the mode is still carried per frame and reported to the receiver.
//! A dialled connection reports [`TransportEvent::Connected`] as soon as the
//! TCP handshake completes; a host that rejects it simply closes the socket.

use std::net::SocketAddr;
use std::sync::Arc;

use crossbeam_channel::{Receiver, Sender};
use dashmap::DashMap;
use tokio::io::AsyncWriteExt;
use tokio::net::tcp::{OwnedReadHalf, OwnedWriteHalf};
use tokio::net::{TcpListener, TcpStream};
use tokio::runtime::Runtime;
use tokio::sync::{mpsc, watch};

use crate::framing::{Frame, FrameConfig, FrameError, read_frame, write_frame};
use crate::transport::{DeliveryMode, IdGenerator, PeerId, Transport, TransportError, TransportEvent};

struct PeerHandle {
    outbound: mpsc::UnboundedSender<Frame>,
    close: watch::Sender<bool>,
}

/// [`Transport`] over TCP streams with length-prefixed frames.
pub struct TcpTransport {
    runtime: Runtime,
    frame_config: FrameConfig,
    ids: Arc<IdGenerator>,
    events_tx: Sender<TransportEvent>,
    events_rx: Receiver<TransportEvent>,
    pending: Arc<DashMap<PeerId, TcpStream>>,
    peers: Arc<DashMap<PeerId, PeerHandle>>,
    shutdown_tx: watch::Sender<bool>,
    stopped: bool,
}

impl TcpTransport {
    /// Create a transport with its own I/O runtime.
    pub fn new(frame_config: FrameConfig) -> Result<Self, TransportError> {
        let runtime = tokio::runtime::Builder::new_multi_thread()
            .worker_threads(2)
            .thread_name("tidal-net")
            .enable_all()
            .build()?;
        let (events_tx, events_rx) = crossbeam_channel::unbounded();
        let (shutdown_tx, _) = watch::channel(false);

        Ok(Self {
            runtime,
            frame_config,
            ids: Arc::new(IdGenerator::new()),
            events_tx,
            events_rx,
            pending: Arc::new(DashMap::new()),
            peers: Arc::new(DashMap::new()),
            shutdown_tx,
            stopped: false,
        })
    }

    fn ensure_running(&self) -> Result<(), TransportError> {
        if self.stopped {
            return Err(TransportError::Stopped);
        }
        Ok(())
    }

    /// Register an established stream and start its reader/writer tasks.
    fn spawn_connection(&self, peer: PeerId, stream: TcpStream) {
        if let Err(e) = stream.set_nodelay(true) {
            tracing::warn!("Failed to set TCP_NODELAY on {peer}: {e}");
        }
        let (reader, writer) = stream.into_split();
        let (outbound_tx, outbound_rx) = mpsc::unbounded_channel();
        let (close_tx, close_rx) = watch::channel(false);

        self.peers.insert(
            peer,
            PeerHandle {
                outbound: outbound_tx,
                close: close_tx,
            },
        );
        let _ = self.events_tx.send(TransportEvent::Connected(peer));

        self.runtime.spawn(write_loop(
            peer,
            writer,
            self.frame_config.clone(),
            outbound_rx,
            self.events_tx.clone(),
        ));
        self.runtime.spawn(read_loop(
            peer,
            reader,
            self.frame_config.clone(),
            Arc::clone(&self.peers),
            self.events_tx.clone(),
            close_rx,
            self.shutdown_tx.subscribe(),
        ));
    }
}

async fn accept_loop(
    listener: TcpListener,
    ids: Arc<IdGenerator>,
    pending: Arc<DashMap<PeerId, TcpStream>>,
    events: Sender<TransportEvent>,
    mut shutdown: watch::Receiver<bool>,
) {
    loop {
        tokio::select! {
            result = listener.accept() => match result {
                Ok((stream, addr)) => {
                    let peer = ids.next_id();
                    tracing::debug!("Connection request {peer} from {addr}");
                    pending.insert(peer, stream);
                    let _ = events.send(TransportEvent::ConnectionRequest { peer, addr: Some(addr) });
                }
                Err(e) => {
                    let _ = events.send(TransportEvent::Error { peer: None, message: e.to_string() });
                }
            },
            _ = shutdown.changed() => break,
        }
    }
}

async fn read_loop(
    peer: PeerId,
    mut reader: OwnedReadHalf,
    config: FrameConfig,
    peers: Arc<DashMap<PeerId, PeerHandle>>,
    events: Sender<TransportEvent>,
    mut close: watch::Receiver<bool>,
    mut shutdown: watch::Receiver<bool>,
) {
    loop {
        tokio::select! {
            result = read_frame(&mut reader, &config) => match result {
                Ok(Frame { mode, payload }) => {
                    let _ = events.send(TransportEvent::Received { peer, mode, payload });
                }
                Err(FrameError::ConnectionClosed) => break,
                Err(e) => {
                    let _ = events.send(TransportEvent::Error { peer: Some(peer), message: e.to_string() });
                    break;
                }
            },
            _ = close.changed() => break,
            _ = shutdown.changed() => break,
        }
    }

    // Dropping the handle closes the outbound channel, which ends the writer.
    if peers.remove(&peer).is_some() {
        let _ = events.send(TransportEvent::Disconnected(peer));
    }
}

async fn write_loop(
    peer: PeerId,
    mut writer: OwnedWriteHalf,
    config: FrameConfig,
    mut outbound: mpsc::UnboundedReceiver<Frame>,
    events: Sender<TransportEvent>,
) {
    while let Some(frame) = outbound.recv().await {
        if let Err(e) = write_frame(&mut writer, &frame, &config).await {
            let _ = events.send(TransportEvent::Error {
                peer: Some(peer),
                message: e.to_string(),
            });
            break;
        }
    }
    let _ = writer.shutdown().await;
}

impl Transport for TcpTransport {
    fn listen(&mut self, addr: SocketAddr) -> Result<SocketAddr, TransportError> {
        self.ensure_running()?;
        let listener = self
            .runtime
            .block_on(TcpListener::bind(addr))
            .map_err(|e| match e.kind() {
                std::io::ErrorKind::AddrInUse => TransportError::AddressInUse(addr),
                _ => TransportError::Io(e),
            })?;
        let bound = listener.local_addr()?;
        tracing::info!("Listening on {bound}");

        self.runtime.spawn(accept_loop(
            listener,
            Arc::clone(&self.ids),
            Arc::clone(&self.pending),
            self.events_tx.clone(),
            self.shutdown_tx.subscribe(),
        ));
        Ok(bound)
    }

    fn connect(&mut self, addr: SocketAddr) -> Result<PeerId, TransportError> {
        self.ensure_running()?;
        let stream = self
            .runtime
            .block_on(TcpStream::connect(addr))
            .map_err(|e| match e.kind() {
                std::io::ErrorKind::ConnectionRefused => TransportError::Unreachable(addr),
                _ => TransportError::Io(e),
            })?;
        let peer = self.ids.next_id();
        tracing::info!("Connected to {addr} as {peer}");
        self.spawn_connection(peer, stream);
        Ok(peer)
    }

    fn accept(&mut self, peer: PeerId) {
        if let Some((_, stream)) = self.pending.remove(&peer) {
            self.spawn_connection(peer, stream);
        }
    }

    fn reject(&mut self, peer: PeerId) {
        if self.pending.remove(&peer).is_some() {
            tracing::debug!("Rejected {peer}");
        }
    }

    fn send(
        &mut self,
        peer: PeerId,
        payload: &[u8],
        mode: DeliveryMode,
    ) -> Result<(), TransportError> {
        self.ensure_running()?;
        let handle = self.peers.get(&peer).ok_or(TransportError::UnknownPeer(peer))?;
        handle
            .outbound
            .send(Frame {
                mode,
                payload: payload.to_vec(),
            })
            .map_err(|_| TransportError::UnknownPeer(peer))
    }

    fn disconnect(&mut self, peer: PeerId) {
        if let Some(handle) = self.peers.get(&peer) {
            let _ = handle.close.send(true);
        }
    }

    fn poll(&mut self) -> Vec<TransportEvent> {
        self.events_rx.try_iter().collect()
    }

    fn stop(&mut self) {
        if self.stopped {
            return;
        }
        self.stopped = true;
        let _ = self.shutdown_tx.send(true);
        self.peers.clear();
        self.pending.clear();
        self.events_rx.try_iter().for_each(drop);
        tracing::info!("Transport stopped");
    }

    fn peer_count(&self) -> usize {
        self.peers.len()
    }
}

impl Drop for TcpTransport {
    fn drop(&mut self) {
        self.stop();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::{Duration, Instant};

    /// Poll until `pred` matches an event or two seconds pass.
    fn wait_for(
        transport: &mut TcpTransport,
        pred: impl Fn(&TransportEvent) -> bool,
    ) -> Option<TransportEvent> {
        let deadline = Instant::now() + Duration::from_secs(2);
        while Instant::now() < deadline {
            if let Some(event) = transport.poll().into_iter().find(|e| pred(e)) {
                return Some(event);
            }
            std::thread::sleep(Duration::from_millis(5));
        }
        None
    }

    fn loopback() -> SocketAddr {
        "127.0.0.1:0".parse().unwrap()
    }

    fn connected_pair() -> (TcpTransport, PeerId, TcpTransport, PeerId) {
        let mut host = TcpTransport::new(FrameConfig::default()).unwrap();
        let mut client = TcpTransport::new(FrameConfig::default()).unwrap();
        let addr = host.listen(loopback()).unwrap();
        let to_host = client.connect(addr).unwrap();

        let Some(TransportEvent::ConnectionRequest { peer: to_client, .. }) =
            wait_for(&mut host, |e| matches!(e, TransportEvent::ConnectionRequest { .. }))
        else {
            panic!("host never saw the connection request");
        };
        host.accept(to_client);
        assert!(wait_for(&mut host, |e| *e == TransportEvent::Connected(to_client)).is_some());
        (host, to_client, client, to_host)
    }

    #[test]
    fn test_connect_unreachable() {
        let mut host = TcpTransport::new(FrameConfig::default()).unwrap();
        let addr = host.listen(loopback()).unwrap();
        host.stop();
        drop(host);

        let mut client = TcpTransport::new(FrameConfig::default()).unwrap();
        assert!(client.connect(addr).is_err());
    }

    #[test]
    fn test_payload_roundtrip_over_socket() {
        let (mut host, to_client, mut client, to_host) = connected_pair();
        client
            .send(to_host, b"ping", DeliveryMode::Sequenced)
            .unwrap();

        let received = wait_for(&mut host, |e| matches!(e, TransportEvent::Received { .. }));
        assert_eq!(
            received,
            Some(TransportEvent::Received {
                peer: to_client,
                mode: DeliveryMode::Sequenced,
                payload: b"ping".to_vec(),
            })
        );
        assert_eq!(host.peer_count(), 1);
    }

    #[test]
    fn test_reject_closes_client() {
        let mut host = TcpTransport::new(FrameConfig::default()).unwrap();
        let mut client = TcpTransport::new(FrameConfig::default()).unwrap();
        let addr = host.listen(loopback()).unwrap();
        let to_host = client.connect(addr).unwrap();

        let Some(TransportEvent::ConnectionRequest { peer, .. }) =
            wait_for(&mut host, |e| matches!(e, TransportEvent::ConnectionRequest { .. }))
        else {
            panic!("host never saw the connection request");
        };
        host.reject(peer);
        assert!(wait_for(&mut client, |e| *e == TransportEvent::Disconnected(to_host)).is_some());
        assert_eq!(host.peer_count(), 0);
    }

    #[test]
    fn test_disconnect_propagates() {
        let (mut host, to_client, mut client, to_host) = connected_pair();
        client.disconnect(to_host);
        assert!(wait_for(&mut client, |e| *e == TransportEvent::Disconnected(to_host)).is_some());
        assert!(wait_for(&mut host, |e| *e == TransportEvent::Disconnected(to_client)).is_some());
        assert!(matches!(
            client.send(to_host, b"late", DeliveryMode::ReliableOrdered),
            Err(TransportError::UnknownPeer(_))
        ));
    }

    #[test]
    fn test_stopped_transport_refuses_work() {
        let mut transport = TcpTransport::new(FrameConfig::default()).unwrap();
        transport.stop();
        assert!(matches!(
            transport.listen(loopback()),
            Err(TransportError::Stopped)
        ));
    }
}
