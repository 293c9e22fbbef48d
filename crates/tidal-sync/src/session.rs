//! Session adapter.
//!
//! Turns transport events into change-queue operations and local changes
//! into wire messages. The host side runs the identity handshake:
//!
//! ```text
//! client                                    host
//!   | ---- connect -------------------------> |  accepted iff peers < max
//!   | <--- ConnectionAccepted { id } -------- |
//!   | <--- ClientDetails (each known client)  |
//!   | ---- ClientDetails { id, name } ------> |  bound, forwarded to others
//!   | <--- DataPayload Reckon (each record) - |  late-join snapshot
//! ```
//!
//! Per connection the state advances
//! `Connecting → IdentityAssigned → DetailsExchanged → Active`; anything that
//! goes wrong drops the peer back to `Disconnected`.

use std::collections::{BTreeMap, HashMap};
use std::net::SocketAddr;
use std::sync::Arc;

use serde::{Deserialize, Serialize};
use tidal_config::Config;
use tidal_net::{
    DeliveryMode, PeerId, ProtocolError, Transport, TransportError, TransportEvent, WireMessage,
    decode, encode,
};

use crate::client::{Client, ClientDirectory, ClientId};
use crate::engine::ReconciliationEngine;
use crate::queue::ActionKind;
use crate::record::EntityRecord;

/// Errors surfaced by [`NetSession`] calls.
#[derive(Debug, thiserror::Error)]
pub enum SessionError {
    #[error("protocol error: {0}")]
    Protocol(#[from] ProtocolError),

    #[error("transport error: {0}")]
    Transport(#[from] TransportError),

    /// Every `u16` client id has been handed out.
    #[error("client id space exhausted")]
    IdSpaceExhausted,

    /// `host` or `join` called on a session that already has a role.
    #[error("session is already running as {0:?}")]
    AlreadyStarted(Role),
}

/// What this process is in the session.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Role {
    Offline,
    Host,
    Client,
}

/// Handshake progress of one connection.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord)]
pub enum ConnectionState {
    Disconnected,
    Connecting,
    IdentityAssigned,
    DetailsExchanged,
    Active,
}

/// Session tunables.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SessionConfig {
    /// Connections the host admits at once.
    pub max_peers: usize,
    /// First client id the host hands out. Ids below 2 are reserved.
    pub client_id_seed: u16,
    /// Display name this process announces when joining.
    pub name: String,
    /// Whether joining clients treat the host as the authority.
    pub host_is_authority: bool,
}

impl Default for SessionConfig {
    fn default() -> Self {
        Self {
            max_peers: 16,
            client_id_seed: 10,
            name: "player".to_string(),
            host_is_authority: true,
        }
    }
}

impl From<&Config> for SessionConfig {
    fn from(config: &Config) -> Self {
        Self {
            max_peers: config.network.max_peers as usize,
            client_id_seed: config.network.client_id_seed,
            name: config.network.client_name.clone(),
            host_is_authority: config.sync.host_is_authority,
        }
    }
}

/// Text of a `DataPayload` message.
#[derive(Serialize, Deserialize, Debug, Clone, PartialEq)]
pub struct ChangeEnvelope {
    pub kind: ActionKind,
    pub record: EntityRecord,
}

fn delivery_for(kind: ActionKind) -> DeliveryMode {
    match kind {
        ActionKind::Update => DeliveryMode::Sequenced,
        _ => DeliveryMode::ReliableOrdered,
    }
}

/// Identity every host gives itself.
fn host_identity() -> Client {
    Client::new(ClientId::HOST, "host")
}

/// Drives one transport on behalf of a [`ReconciliationEngine`].
pub struct NetSession<T: Transport> {
    transport: T,
    directory: Arc<ClientDirectory>,
    config: SessionConfig,
    role: Role,
    peers: BTreeMap<PeerId, ConnectionState>,
    assigned: HashMap<PeerId, ClientId>,
    next_client_id: Option<u16>,
    host_peer: Option<PeerId>,
}

impl<T: Transport> NetSession<T> {
    pub fn new(transport: T, directory: Arc<ClientDirectory>, config: SessionConfig) -> Self {
        let seed = config.client_id_seed.max(ClientId::HOST.0 + 1);
        Self {
            transport,
            directory,
            config,
            role: Role::Offline,
            peers: BTreeMap::new(),
            assigned: HashMap::new(),
            next_client_id: Some(seed),
            host_peer: None,
        }
    }

    pub fn role(&self) -> Role {
        self.role
    }

    pub fn directory(&self) -> &Arc<ClientDirectory> {
        &self.directory
    }

    pub fn transport(&self) -> &T {
        &self.transport
    }

    pub fn transport_mut(&mut self) -> &mut T {
        &mut self.transport
    }

    /// Connection to the host, when joined.
    pub fn host_peer(&self) -> Option<PeerId> {
        self.host_peer
    }

    /// Handshake state of `peer`.
    pub fn state(&self, peer: PeerId) -> ConnectionState {
        self.peers
            .get(&peer)
            .copied()
            .unwrap_or(ConnectionState::Disconnected)
    }

    /// Peers that finished the handshake.
    pub fn active_peers(&self) -> Vec<PeerId> {
        self.peers_at_least(ConnectionState::Active, None)
    }

    /// Whether a joined client completed its handshake.
    pub fn is_active(&self) -> bool {
        self.host_peer
            .is_some_and(|peer| self.state(peer) == ConnectionState::Active)
    }

    fn peers_at_least(&self, state: ConnectionState, except: Option<PeerId>) -> Vec<PeerId> {
        self.peers
            .iter()
            .filter(|(peer, s)| **s >= state && Some(**peer) != except)
            .map(|(peer, _)| *peer)
            .collect()
    }

    /// Start hosting on `addr`. The local identity becomes
    /// [`ClientId::HOST`] and the authority.
    pub fn host(&mut self, addr: SocketAddr) -> Result<SocketAddr, SessionError> {
        if self.role != Role::Offline {
            return Err(SessionError::AlreadyStarted(self.role));
        }
        let bound = self.transport.listen(addr)?;
        let me = Client::new(ClientId::HOST, self.config.name.clone());
        self.directory.set_local(me.clone());
        self.directory.register_authority(me);
        self.role = Role::Host;
        tracing::info!("Hosting on {bound} (max {} peers)", self.config.max_peers);
        Ok(bound)
    }

    /// Dial a host. Identity arrives later through the handshake.
    pub fn join(&mut self, addr: SocketAddr) -> Result<PeerId, SessionError> {
        if self.role != Role::Offline {
            return Err(SessionError::AlreadyStarted(self.role));
        }
        let peer = self.transport.connect(addr)?;
        self.peers.insert(peer, ConnectionState::Connecting);
        self.host_peer = Some(peer);
        self.role = Role::Client;
        tracing::info!("Joining {addr} as '{}'", self.config.name);
        Ok(peer)
    }

    /// Handle every transport event queued since the last call. Returns the
    /// number of events handled.
    pub fn poll(&mut self, engine: &mut ReconciliationEngine) -> usize {
        let events = self.transport.poll();
        let count = events.len();
        for event in events {
            match event {
                TransportEvent::ConnectionRequest { peer, addr } => {
                    self.on_connection_request(peer, addr)
                }
                TransportEvent::Connected(peer) => self.on_connected(peer),
                TransportEvent::Disconnected(peer) => self.on_disconnected(peer),
                TransportEvent::Received {
                    peer,
                    mode,
                    payload,
                } => self.on_received(engine, peer, mode, &payload),
                TransportEvent::Error { peer, message } => {
                    tracing::error!("Transport error on {peer:?}: {message}");
                    if let Some(peer) = peer {
                        self.drop_peer(peer);
                    }
                }
            }
        }
        count
    }

    /// Enqueue a local change and send it to the session. Returns whether
    /// the engine accepted it. Oversized payloads fail before anything is
    /// enqueued or sent.
    pub fn submit(
        &mut self,
        engine: &mut ReconciliationEngine,
        record: EntityRecord,
        kind: ActionKind,
    ) -> Result<bool, SessionError> {
        let envelope = ChangeEnvelope { kind, record };
        let bytes = encode(&WireMessage::data_payload(
            envelope.record.type_name(),
            &envelope,
        )?)?;

        let local = self.directory.local();
        if !engine.try_enqueue(envelope.record, kind, &local) {
            return Ok(false);
        }

        let targets = match self.role {
            Role::Offline => Vec::new(),
            Role::Host => self.active_peers(),
            Role::Client => self
                .host_peer
                .filter(|peer| self.state(*peer) == ConnectionState::Active)
                .into_iter()
                .collect(),
        };
        if targets.is_empty() && self.role == Role::Client {
            tracing::debug!("Not connected yet; {kind:?} applied locally only");
        }
        for peer in targets {
            self.send_bytes(peer, &bytes, delivery_for(kind));
        }
        Ok(true)
    }

    /// Close every connection and discard pending work.
    pub fn stop(&mut self, engine: &mut ReconciliationEngine) {
        self.transport.stop();
        engine.clear_pending();
        self.peers.clear();
        self.assigned.clear();
        self.directory.clear_roster();
        self.host_peer = None;
        if self.role != Role::Offline {
            tracing::info!("Session stopped");
        }
        self.role = Role::Offline;
    }

    // ---------------------------------------------------------------------
    // Event handlers
    // ---------------------------------------------------------------------

    fn on_connection_request(&mut self, peer: PeerId, addr: Option<SocketAddr>) {
        if self.role != Role::Host {
            self.transport.reject(peer);
            return;
        }
        if self.peers.len() < self.config.max_peers {
            tracing::info!("Accepting {peer} from {addr:?}");
            self.peers.insert(peer, ConnectionState::Connecting);
            self.transport.accept(peer);
        } else {
            tracing::info!(
                "Rejecting {peer} from {addr:?}: {} of {} peers connected",
                self.peers.len(),
                self.config.max_peers
            );
            self.transport.reject(peer);
        }
    }

    fn on_connected(&mut self, peer: PeerId) {
        match self.role {
            Role::Host => self.assign_identity(peer),
            Role::Client => tracing::debug!("Transport link to host up ({peer})"),
            Role::Offline => {}
        }
    }

    fn assign_identity(&mut self, peer: PeerId) {
        if self.state(peer) != ConnectionState::Connecting {
            return;
        }
        let id = match self.allocate_client_id() {
            Ok(id) => id,
            Err(e) => {
                tracing::error!("Cannot admit {peer}: {e}");
                self.drop_peer(peer);
                return;
            }
        };
        self.assigned.insert(peer, id);
        self.peers.insert(peer, ConnectionState::IdentityAssigned);
        tracing::info!("Assigned {id} to {peer}");
        self.send_message(
            peer,
            &WireMessage::ConnectionAccepted { client_id: id.0 },
            DeliveryMode::ReliableOrdered,
        );

        for client in self.directory.roster() {
            match WireMessage::client_details(Client::TYPE_NAME, &client) {
                Ok(msg) => self.send_message(peer, &msg, DeliveryMode::ReliableOrdered),
                Err(e) => tracing::error!("Failed to encode details of {}: {e}", client.id),
            }
        }
    }

    fn allocate_client_id(&mut self) -> Result<ClientId, SessionError> {
        let id = self.next_client_id.ok_or(SessionError::IdSpaceExhausted)?;
        self.next_client_id = id.checked_add(1);
        Ok(ClientId(id))
    }

    fn on_disconnected(&mut self, peer: PeerId) {
        if self.peers.remove(&peer).is_none() {
            return;
        }
        self.forget(peer);
        tracing::info!("{peer} disconnected");
    }

    fn on_received(
        &mut self,
        engine: &mut ReconciliationEngine,
        peer: PeerId,
        mode: DeliveryMode,
        payload: &[u8],
    ) {
        let msg = match decode(payload) {
            Ok(msg) => msg,
            Err(e) => {
                tracing::error!("Malformed message from {peer}: {e}");
                self.drop_peer(peer);
                return;
            }
        };
        let result = match self.role {
            Role::Host => self.host_received(engine, peer, mode, &msg, payload),
            Role::Client => self.client_received(engine, peer, &msg),
            Role::Offline => Ok(()),
        };
        if let Err(e) = result {
            tracing::error!("Dropping {peer}: {e}");
            self.drop_peer(peer);
        }
    }

    fn host_received(
        &mut self,
        engine: &mut ReconciliationEngine,
        peer: PeerId,
        mode: DeliveryMode,
        msg: &WireMessage,
        raw: &[u8],
    ) -> Result<(), SessionError> {
        match msg {
            WireMessage::ClientDetails { .. } => {
                if self.state(peer) != ConnectionState::IdentityAssigned {
                    tracing::warn!("Unexpected details from {peer}; ignored");
                    return Ok(());
                }
                let client: Client = msg.parse_text()?;
                let expected = self.assigned.get(&peer).copied();
                if expected != Some(client.id) {
                    tracing::warn!(
                        "{peer} announced {} but was assigned {expected:?}; disconnecting",
                        client.id
                    );
                    self.drop_peer(peer);
                    return Ok(());
                }
                if !self.directory.bind_peer(peer, client.clone()) {
                    tracing::warn!("{peer} is already bound; disconnecting");
                    self.drop_peer(peer);
                    return Ok(());
                }
                tracing::info!("{} joined as '{}'", client.id, client.name);

                for other in self.peers_at_least(ConnectionState::IdentityAssigned, Some(peer)) {
                    self.send_bytes(other, raw, DeliveryMode::ReliableOrdered);
                }
                self.peers.insert(peer, ConnectionState::DetailsExchanged);

                for record in engine.snapshot() {
                    let id = record.id();
                    let envelope = ChangeEnvelope {
                        kind: ActionKind::Reckon,
                        record,
                    };
                    match WireMessage::data_payload(envelope.record.type_name(), &envelope) {
                        Ok(msg) => self.send_message(peer, &msg, DeliveryMode::ReliableOrdered),
                        Err(e) => tracing::error!("Snapshot of {id} skipped for {peer}: {e}"),
                    }
                }
                self.peers.insert(peer, ConnectionState::Active);
                Ok(())
            }
            WireMessage::DataPayload { tag, .. } => {
                if self.state(peer) != ConnectionState::Active {
                    tracing::warn!("Data from {peer} before handshake completed; ignored");
                    return Ok(());
                }
                let Some(requestor) = self.directory.client_for_peer(peer) else {
                    tracing::warn!("Data from unbound {peer}; ignored");
                    return Ok(());
                };
                let envelope: ChangeEnvelope = msg.parse_text()?;
                if envelope.record.type_name() != tag {
                    tracing::warn!(
                        "Tag '{tag}' does not match record type '{}'; ignored",
                        envelope.record.type_name()
                    );
                    return Ok(());
                }
                let kind = envelope.kind;
                if engine.try_enqueue(envelope.record, kind, &requestor) {
                    for other in self.peers_at_least(ConnectionState::Active, Some(peer)) {
                        self.send_bytes(other, raw, mode);
                    }
                }
                Ok(())
            }
            WireMessage::ConnectionAccepted { .. } => {
                tracing::warn!("{peer} sent an identity assignment to the host; disconnecting");
                self.drop_peer(peer);
                Ok(())
            }
        }
    }

    fn client_received(
        &mut self,
        engine: &mut ReconciliationEngine,
        peer: PeerId,
        msg: &WireMessage,
    ) -> Result<(), SessionError> {
        if Some(peer) != self.host_peer {
            tracing::warn!("Message from unknown {peer}; ignored");
            return Ok(());
        }
        match msg {
            WireMessage::ConnectionAccepted { client_id } => {
                if self.state(peer) != ConnectionState::Connecting {
                    tracing::warn!("Repeated identity assignment; ignored");
                    return Ok(());
                }
                let me = Client::new(ClientId(*client_id), self.config.name.clone());
                self.directory.set_local(me.clone());
                if self.config.host_is_authority {
                    self.directory.register_authority(host_identity());
                }
                self.directory.insert(me.clone());
                self.peers.insert(peer, ConnectionState::IdentityAssigned);
                tracing::info!("Assigned identity {}", me.id);

                let details = WireMessage::client_details(Client::TYPE_NAME, &me)?;
                self.send_message(peer, &details, DeliveryMode::ReliableOrdered);
                self.peers.insert(peer, ConnectionState::DetailsExchanged);
                self.peers.insert(peer, ConnectionState::Active);
                Ok(())
            }
            WireMessage::ClientDetails { .. } => {
                let client: Client = msg.parse_text()?;
                if self.directory.insert(client.clone()) {
                    tracing::info!("{} ('{}') is in the session", client.id, client.name);
                }
                Ok(())
            }
            WireMessage::DataPayload { tag, .. } => {
                let envelope: ChangeEnvelope = msg.parse_text()?;
                if envelope.record.type_name() != tag {
                    tracing::warn!(
                        "Tag '{tag}' does not match record type '{}'; ignored",
                        envelope.record.type_name()
                    );
                    return Ok(());
                }
                let requestor = if self.config.host_is_authority {
                    self.directory.authority()
                } else {
                    host_identity()
                };
                let kind = envelope.kind;
                engine.try_enqueue(envelope.record, kind, &requestor);
                Ok(())
            }
        }
    }

    // ---------------------------------------------------------------------
    // Sending
    // ---------------------------------------------------------------------

    fn send_message(&mut self, peer: PeerId, msg: &WireMessage, mode: DeliveryMode) {
        match encode(msg) {
            Ok(bytes) => self.send_bytes(peer, &bytes, mode),
            Err(e) => tracing::error!("Failed to encode {:?}: {e}", msg.message_type()),
        }
    }

    fn send_bytes(&mut self, peer: PeerId, bytes: &[u8], mode: DeliveryMode) {
        if let Err(e) = self.transport.send(peer, bytes, mode) {
            tracing::warn!("Send to {peer} failed: {e}");
        }
    }

    /// Disconnect `peer` and forget it right away.
    fn drop_peer(&mut self, peer: PeerId) {
        self.transport.disconnect(peer);
        if self.peers.remove(&peer).is_some() {
            self.forget(peer);
        }
    }

    fn forget(&mut self, peer: PeerId) {
        self.assigned.remove(&peer);
        if let Some(client) = self.directory.unbind_peer(peer) {
            tracing::info!("{} ('{}') left", client.id, client.name);
        }
        if self.host_peer == Some(peer) {
            tracing::warn!("Lost connection to host");
            self.host_peer = None;
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::engine::SyncSettings;
    use crate::record::EntityId;
    use tidal_net::{MemoryNetwork, MemoryTransport};

    fn addr() -> SocketAddr {
        "127.0.0.1:7777".parse().unwrap()
    }

    struct Node {
        session: NetSession<MemoryTransport>,
        engine: ReconciliationEngine,
    }

    impl Node {
        fn new(net: &MemoryNetwork, name: &str, max_peers: usize) -> Self {
            let directory = Arc::new(ClientDirectory::new(host_identity()));
            let engine =
                ReconciliationEngine::new(Arc::clone(&directory), SyncSettings::default()).unwrap();
            let config = SessionConfig {
                max_peers,
                client_id_seed: 20,
                name: name.to_string(),
                host_is_authority: true,
            };
            Self {
                session: NetSession::new(net.endpoint(), directory, config),
                engine,
            }
        }

        fn tick(&mut self) {
            self.session.poll(&mut self.engine);
            self.engine.update();
        }
    }

    fn pump(nodes: &mut [&mut Node]) {
        for _ in 0..4 {
            for node in nodes.iter_mut() {
                node.tick();
            }
        }
    }

    #[test]
    fn test_handshake_reaches_active() {
        let net = MemoryNetwork::new();
        let mut host = Node::new(&net, "host", 4);
        let mut joiner = Node::new(&net, "Vega", 4);
        host.session.host(addr()).unwrap();
        let to_host = joiner.session.join(addr()).unwrap();
        assert_eq!(joiner.session.state(to_host), ConnectionState::Connecting);

        pump(&mut [&mut host, &mut joiner]);

        assert!(joiner.session.is_active());
        assert_eq!(joiner.session.directory().local(), Client::new(ClientId(20), "Vega"));
        assert!(joiner.session.directory().is_authority(ClientId::HOST));
        assert_eq!(host.session.directory().roster(), vec![Client::new(ClientId(20), "Vega")]);
        assert_eq!(host.session.active_peers().len(), 1);
    }

    #[test]
    fn test_host_and_join_are_exclusive() {
        let net = MemoryNetwork::new();
        let mut node = Node::new(&net, "host", 4);
        node.session.host(addr()).unwrap();
        assert!(matches!(
            node.session.join(addr()),
            Err(SessionError::AlreadyStarted(Role::Host))
        ));
    }

    #[test]
    fn test_late_joiner_receives_existing_records() {
        let net = MemoryNetwork::new();
        let mut host = Node::new(&net, "host", 4);
        host.session.host(addr()).unwrap();
        let rock = EntityRecord::new(EntityId(5), ClientId::HOST, "Rock").with("x", 3.0);
        assert!(host.session.submit(&mut host.engine, rock, ActionKind::Create).unwrap());
        host.tick();

        let mut joiner = Node::new(&net, "Vega", 4);
        joiner.session.join(addr()).unwrap();
        pump(&mut [&mut host, &mut joiner]);

        let copy = joiner.engine.get(EntityId(5)).unwrap();
        assert_eq!(copy.type_name(), "Rock");
        assert_eq!(copy.number("x"), Some(3.0));
    }

    #[test]
    fn test_unencodable_record_is_left_out_of_snapshot() {
        let net = MemoryNetwork::new();
        let mut host = Node::new(&net, "host", 4);
        host.session.host(addr()).unwrap();

        // Each change fits on the wire alone; the merged record does not.
        let half = "a".repeat(600);
        let big = EntityRecord::new(EntityId(1), ClientId::HOST, "Banner").with("a", half.as_str());
        assert!(host.session.submit(&mut host.engine, big, ActionKind::Create).unwrap());
        host.tick();
        let more = EntityRecord::new(EntityId(1), ClientId::HOST, "Banner").with("b", half.as_str());
        assert!(host.session.submit(&mut host.engine, more, ActionKind::Update).unwrap());
        let rock = EntityRecord::new(EntityId(2), ClientId::HOST, "Rock").with("x", 1.0);
        assert!(host.session.submit(&mut host.engine, rock, ActionKind::Create).unwrap());
        host.tick();
        assert_eq!(host.engine.get(EntityId(1)).unwrap().field_count(), 2);

        let mut joiner = Node::new(&net, "Vega", 4);
        joiner.session.join(addr()).unwrap();
        pump(&mut [&mut host, &mut joiner]);

        assert!(joiner.session.is_active());
        assert_eq!(host.session.active_peers().len(), 1);
        assert!(joiner.engine.get(EntityId(1)).is_none());
        assert_eq!(joiner.engine.get(EntityId(2)).unwrap().number("x"), Some(1.0));
    }

    #[test]
    fn test_malformed_bytes_disconnect_peer() {
        let net = MemoryNetwork::new();
        let mut host = Node::new(&net, "host", 4);
        let mut joiner = Node::new(&net, "Vega", 4);
        host.session.host(addr()).unwrap();
        let to_host = joiner.session.join(addr()).unwrap();
        pump(&mut [&mut host, &mut joiner]);

        joiner
            .session
            .transport_mut()
            .send(to_host, &[9, 9, 9], DeliveryMode::ReliableOrdered)
            .unwrap();
        pump(&mut [&mut host, &mut joiner]);

        assert!(host.session.active_peers().is_empty());
        assert!(host.session.directory().roster().is_empty());
        assert_eq!(joiner.session.state(to_host), ConnectionState::Disconnected);
        assert!(joiner.session.host_peer().is_none());
    }

    #[test]
    fn test_stop_discards_pending_work() {
        let net = MemoryNetwork::new();
        let mut host = Node::new(&net, "host", 4);
        host.session.host(addr()).unwrap();
        let rock = EntityRecord::new(EntityId(1), ClientId::HOST, "Rock");
        host.session.submit(&mut host.engine, rock, ActionKind::Create).unwrap();
        assert_eq!(host.engine.pending_len(), 1);

        host.session.stop(&mut host.engine);
        assert_eq!(host.engine.pending_len(), 0);
        assert_eq!(host.session.role(), Role::Offline);
    }

    #[test]
    fn test_envelope_json_shape() {
        let envelope = ChangeEnvelope {
            kind: ActionKind::Update,
            record: EntityRecord::new(EntityId(2), ClientId(14), "Ship").with("x", 1.0),
        };
        let json = serde_json::to_string(&envelope).unwrap();
        assert_eq!(
            json,
            r#"{"kind":"Update","record":{"id":2,"owner":14,"type_name":"Ship","fields":{"x":1.0}}}"#
        );
    }
}
