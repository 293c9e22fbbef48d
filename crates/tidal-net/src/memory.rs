//! In-process transport.
//!
//! Routes payloads between endpoints of one [`MemoryNetwork`] without any
//! network I/O. Delivery is immediate and in order on both channels, which
//! makes handshake and replication runs fully deterministic in tests and
//! single-process sessions.

use std::collections::{HashMap, VecDeque};
use std::net::SocketAddr;
use std::sync::{Arc, Mutex, MutexGuard};

use crate::transport::{DeliveryMode, PeerId, Transport, TransportError, TransportEvent};

#[derive(Debug, Clone, Copy)]
struct Link {
    endpoint: usize,
    peer: PeerId,
}

#[derive(Debug, Default)]
struct Endpoint {
    events: VecDeque<TransportEvent>,
    links: HashMap<PeerId, Link>,
    pending: HashMap<PeerId, Link>,
    listening: Option<SocketAddr>,
    next_peer: u64,
}

impl Endpoint {
    fn allocate_peer(&mut self) -> PeerId {
        self.next_peer += 1;
        PeerId(self.next_peer)
    }
}

#[derive(Debug, Default)]
struct Hub {
    endpoints: Vec<Endpoint>,
    listeners: HashMap<SocketAddr, usize>,
}

/// A closed set of in-process endpoints that can reach each other.
#[derive(Clone, Default)]
pub struct MemoryNetwork {
    hub: Arc<Mutex<Hub>>,
}

impl MemoryNetwork {
    /// Create an empty network.
    pub fn new() -> Self {
        Self::default()
    }

    /// Create a new endpoint attached to this network.
    pub fn endpoint(&self) -> MemoryTransport {
        let mut hub = lock(&self.hub);
        hub.endpoints.push(Endpoint::default());
        MemoryTransport {
            hub: Arc::clone(&self.hub),
            index: hub.endpoints.len() - 1,
        }
    }
}

/// One endpoint of a [`MemoryNetwork`].
pub struct MemoryTransport {
    hub: Arc<Mutex<Hub>>,
    index: usize,
}

fn lock(hub: &Mutex<Hub>) -> MutexGuard<'_, Hub> {
    hub.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
}

impl MemoryTransport {
    fn hub(&self) -> MutexGuard<'_, Hub> {
        lock(&self.hub)
    }
}

impl Transport for MemoryTransport {
    fn listen(&mut self, addr: SocketAddr) -> Result<SocketAddr, TransportError> {
        let mut hub = self.hub();
        if hub.listeners.contains_key(&addr) {
            return Err(TransportError::AddressInUse(addr));
        }
        hub.listeners.insert(addr, self.index);
        hub.endpoints[self.index].listening = Some(addr);
        Ok(addr)
    }

    fn connect(&mut self, addr: SocketAddr) -> Result<PeerId, TransportError> {
        let mut hub = self.hub();
        let host = *hub
            .listeners
            .get(&addr)
            .ok_or(TransportError::Unreachable(addr))?;

        let local_peer = hub.endpoints[self.index].allocate_peer();
        let remote_peer = hub.endpoints[host].allocate_peer();

        hub.endpoints[self.index].pending.insert(
            local_peer,
            Link {
                endpoint: host,
                peer: remote_peer,
            },
        );
        let host_end = &mut hub.endpoints[host];
        host_end.pending.insert(
            remote_peer,
            Link {
                endpoint: self.index,
                peer: local_peer,
            },
        );
        host_end.events.push_back(TransportEvent::ConnectionRequest {
            peer: remote_peer,
            addr: None,
        });
        Ok(local_peer)
    }

    fn accept(&mut self, peer: PeerId) {
        let mut hub = self.hub();
        let Some(link) = hub.endpoints[self.index].pending.remove(&peer) else {
            return;
        };
        let me = &mut hub.endpoints[self.index];
        me.links.insert(peer, link);
        me.events.push_back(TransportEvent::Connected(peer));

        let remote = &mut hub.endpoints[link.endpoint];
        if let Some(back) = remote.pending.remove(&link.peer) {
            remote.links.insert(link.peer, back);
            remote.events.push_back(TransportEvent::Connected(link.peer));
        }
    }

    fn reject(&mut self, peer: PeerId) {
        let mut hub = self.hub();
        let Some(link) = hub.endpoints[self.index].pending.remove(&peer) else {
            return;
        };
        let remote = &mut hub.endpoints[link.endpoint];
        if remote.pending.remove(&link.peer).is_some() {
            remote.events.push_back(TransportEvent::Disconnected(link.peer));
        }
    }

    fn send(
        &mut self,
        peer: PeerId,
        payload: &[u8],
        mode: DeliveryMode,
    ) -> Result<(), TransportError> {
        let mut hub = self.hub();
        let link = *hub.endpoints[self.index]
            .links
            .get(&peer)
            .ok_or(TransportError::UnknownPeer(peer))?;
        hub.endpoints[link.endpoint]
            .events
            .push_back(TransportEvent::Received {
                peer: link.peer,
                mode,
                payload: payload.to_vec(),
            });
        Ok(())
    }

    fn disconnect(&mut self, peer: PeerId) {
        let mut hub = self.hub();
        let me = &mut hub.endpoints[self.index];
        let Some(link) = me.links.remove(&peer) else {
            return;
        };
        me.events.push_back(TransportEvent::Disconnected(peer));

        let remote = &mut hub.endpoints[link.endpoint];
        if remote.links.remove(&link.peer).is_some() {
            remote.events.push_back(TransportEvent::Disconnected(link.peer));
        }
    }

    fn poll(&mut self) -> Vec<TransportEvent> {
        self.hub().endpoints[self.index].events.drain(..).collect()
    }

    fn stop(&mut self) {
        let mut hub = self.hub();
        let me = &mut hub.endpoints[self.index];
        let links: Vec<Link> = me.links.drain().chain(me.pending.drain()).map(|(_, l)| l).collect();
        me.events.clear();
        if let Some(addr) = me.listening.take() {
            hub.listeners.remove(&addr);
        }

        for link in links {
            let remote = &mut hub.endpoints[link.endpoint];
            let was_linked = remote.links.remove(&link.peer).is_some();
            let was_pending = remote.pending.remove(&link.peer).is_some();
            if was_linked || was_pending {
                remote.events.push_back(TransportEvent::Disconnected(link.peer));
            }
        }
    }

    fn peer_count(&self) -> usize {
        self.hub().endpoints[self.index].links.len()
    }
}
