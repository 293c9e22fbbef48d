//! Client identities and the directory that maps peers onto them.

use std::collections::{BTreeMap, HashMap};
use std::fmt;
use std::sync::{Mutex, MutexGuard};

use serde::{Deserialize, Serialize};
use tidal_net::PeerId;

/// Session-wide client identity, assigned by the authority at connect time.
#[derive(Serialize, Deserialize, Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
#[serde(transparent)]
pub struct ClientId(pub u16);

impl ClientId {
    /// Identity a hosting (or offline) process gives itself.
    pub const HOST: ClientId = ClientId(1);
}

impl fmt::Display for ClientId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "client#{}", self.0)
    }
}

/// A participant in the session.
#[derive(Serialize, Deserialize, Debug, Clone, PartialEq, Eq)]
pub struct Client {
    /// Unique id.
    pub id: ClientId,
    /// Display name.
    pub name: String,
}

impl Client {
    /// Type tag used on the wire for client records.
    pub const TYPE_NAME: &'static str = "Client";

    /// Create a client identity.
    pub fn new(id: ClientId, name: impl Into<String>) -> Self {
        Self {
            id,
            name: name.into(),
        }
    }
}

#[derive(Debug)]
struct DirectoryState {
    local: Client,
    authority: Client,
    roster: BTreeMap<ClientId, Client>,
    peers: HashMap<PeerId, ClientId>,
}

/// Who is who: the local identity, the current authority, and the roster of
/// known clients with the transport peer each one is reached through.
///
/// Shared between the engine and the session adapter. A single lock guards
/// all of it, since a connect and a details message for the same peer can
/// otherwise interleave and insert that peer twice.
#[derive(Debug)]
pub struct ClientDirectory {
    state: Mutex<DirectoryState>,
}

impl ClientDirectory {
    /// Create a directory in which `local` is also the authority.
    pub fn new(local: Client) -> Self {
        Self {
            state: Mutex::new(DirectoryState {
                authority: local.clone(),
                local,
                roster: BTreeMap::new(),
                peers: HashMap::new(),
            }),
        }
    }

    fn lock(&self) -> MutexGuard<'_, DirectoryState> {
        self.state.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    /// This process's identity.
    pub fn local(&self) -> Client {
        self.lock().local.clone()
    }

    /// Replace the local identity. When the local client was also the
    /// authority, the authority follows.
    pub fn set_local(&self, client: Client) {
        let mut state = self.lock();
        if state.authority.id == state.local.id {
            state.authority = client.clone();
        }
        state.local = client;
    }

    /// The client whose writes override ownership.
    pub fn authority(&self) -> Client {
        self.lock().authority.clone()
    }

    /// Hand authority to `client`.
    pub fn register_authority(&self, client: Client) {
        tracing::info!("Authority is now {} ({})", client.id, client.name);
        self.lock().authority = client;
    }

    /// Whether `id` is the current authority.
    pub fn is_authority(&self, id: ClientId) -> bool {
        self.lock().authority.id == id
    }

    /// Add (or rename) a roster entry that has no direct peer.
    /// Returns `true` when the id was new.
    pub fn insert(&self, client: Client) -> bool {
        self.lock().roster.insert(client.id, client).is_none()
    }

    /// Bind a transport peer to a client and add it to the roster.
    /// Returns `false`, changing nothing, if the peer or the id is already
    /// bound.
    pub fn bind_peer(&self, peer: PeerId, client: Client) -> bool {
        let mut state = self.lock();
        if state.peers.contains_key(&peer) || state.peers.values().any(|id| *id == client.id) {
            return false;
        }
        state.peers.insert(peer, client.id);
        state.roster.insert(client.id, client);
        true
    }

    /// Forget a peer and its roster entry.
    pub fn unbind_peer(&self, peer: PeerId) -> Option<Client> {
        let mut state = self.lock();
        let id = state.peers.remove(&peer)?;
        state.roster.remove(&id)
    }

    /// Client reached through `peer`.
    pub fn client_for_peer(&self, peer: PeerId) -> Option<Client> {
        let state = self.lock();
        let id = state.peers.get(&peer)?;
        state.roster.get(id).cloned()
    }

    /// Roster lookup by id.
    pub fn get(&self, id: ClientId) -> Option<Client> {
        self.lock().roster.get(&id).cloned()
    }

    /// Every known client, in id order.
    pub fn roster(&self) -> Vec<Client> {
        self.lock().roster.values().cloned().collect()
    }

    /// Drop every roster entry and peer binding.
    pub fn clear_roster(&self) {
        let mut state = self.lock();
        state.roster.clear();
        state.peers.clear();
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn nova() -> Client {
        Client::new(ClientId(14), "Nova")
    }

    #[test]
    fn test_new_directory_is_its_own_authority() {
        let dir = ClientDirectory::new(Client::new(ClientId::HOST, "host"));
        assert!(dir.is_authority(ClientId::HOST));
        assert_eq!(dir.authority(), dir.local());
        assert!(dir.roster().is_empty());
    }

    #[test]
    fn test_set_local_carries_authority_when_self_authoritative() {
        let dir = ClientDirectory::new(Client::new(ClientId::HOST, "solo"));
        dir.set_local(nova());
        assert!(dir.is_authority(ClientId(14)));

        dir.register_authority(Client::new(ClientId::HOST, "host"));
        dir.set_local(Client::new(ClientId(15), "Orion"));
        assert!(dir.is_authority(ClientId::HOST));
        assert_eq!(dir.local().id, ClientId(15));
    }

    #[test]
    fn test_bind_peer_refuses_double_insert() {
        let dir = ClientDirectory::new(Client::new(ClientId::HOST, "host"));
        assert!(dir.bind_peer(PeerId(1), nova()));
        assert!(!dir.bind_peer(PeerId(1), Client::new(ClientId(15), "Orion")));
        assert!(!dir.bind_peer(PeerId(2), nova()));
        assert_eq!(dir.roster(), vec![nova()]);
        assert_eq!(dir.client_for_peer(PeerId(1)), Some(nova()));
    }

    #[test]
    fn test_unbind_removes_roster_entry() {
        let dir = ClientDirectory::new(Client::new(ClientId::HOST, "host"));
        dir.bind_peer(PeerId(3), nova());
        assert_eq!(dir.unbind_peer(PeerId(3)), Some(nova()));
        assert!(dir.get(ClientId(14)).is_none());
        assert!(dir.unbind_peer(PeerId(3)).is_none());
    }

    #[test]
    fn test_insert_reports_new_entries() {
        let dir = ClientDirectory::new(Client::new(ClientId::HOST, "host"));
        assert!(dir.insert(nova()));
        assert!(!dir.insert(Client::new(ClientId(14), "Nova II")));
        assert_eq!(dir.get(ClientId(14)).unwrap().name, "Nova II");
    }
}
