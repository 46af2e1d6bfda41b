use crate::config::Settings;
use crate::ledger::Ledger;
use crate::liveness::Liveness;
use crate::peer::{Peer, PeerId, PeerInfo};
use crate::protocol::ServerMessage;
use crate::ratelimit::RateLimiter;
use crate::rooms::RoomRegistry;
use dashmap::DashMap;
use parking_lot::Mutex;
use std::sync::Arc;
use tokio::sync::mpsc;
use tokio::time::Instant;
use tokio_util::sync::CancellationToken;

/// One live connection. Everything that must die with the connection hangs off
/// this value, including the token that stops its liveness task.
#[derive(Debug)]
pub struct Session {
    pub id: PeerId,
    pub peer: Mutex<Peer>,
    pub liveness: Mutex<Liveness>,
    pub rate: Mutex<RateLimiter>,
    pub cancel: CancellationToken,
    outbound: mpsc::UnboundedSender<String>,
}

impl Session {
    pub fn new(peer: Peer, outbound: mpsc::UnboundedSender<String>, settings: &Settings) -> Self {
        Self {
            id: peer.id,
            peer: Mutex::new(peer),
            liveness: Mutex::new(Liveness::new(settings.liveness, Instant::now())),
            rate: Mutex::new(RateLimiter::new(settings.rate_limit)),
            cancel: CancellationToken::new(),
            outbound,
        }
    }

    pub fn send(&self, message: &ServerMessage) {
        match serde_json::to_string(message) {
            Ok(text) => self.send_raw(text),
            Err(e) => tracing::error!("Failed to serialize message for {}: {}", self.id, e),
        }
    }

    /// Queues an already serialized envelope. A closed queue means the peer is
    /// on its way out; the message is dropped.
    pub fn send_raw(&self, text: String) {
        if self.outbound.send(text).is_err() {
            tracing::debug!("Dropped message for departed peer {}", self.id);
        }
    }

    pub fn describe(&self) -> PeerInfo {
        self.peer.lock().describe()
    }

    pub fn is_closed(&self) -> bool {
        self.cancel.is_cancelled()
    }
}

/// Process-wide registries. Each map locks per shard, so unrelated peers and
/// rooms never wait on each other.
#[derive(Debug)]
pub struct Rendezvous {
    pub(crate) settings: Settings,
    pub(crate) peers: DashMap<PeerId, Arc<Session>>,
    pub(crate) rooms: RoomRegistry,
    pub(crate) ledger: Ledger,
}

impl Rendezvous {
    pub fn new(settings: Settings) -> Arc<Self> {
        Arc::new(Self {
            settings,
            peers: DashMap::new(),
            rooms: RoomRegistry::new(),
            ledger: Ledger::new(),
        })
    }

    pub fn settings(&self) -> &Settings {
        &self.settings
    }

    pub fn session(&self, id: &PeerId) -> Option<Arc<Session>> {
        self.peers.get(id).map(|session| session.clone())
    }

    pub fn is_online(&self, id: &PeerId) -> bool {
        self.peers.contains_key(id)
    }

    pub fn peer_count(&self) -> usize {
        self.peers.len()
    }

    pub fn rooms(&self) -> &RoomRegistry {
        &self.rooms
    }

    pub fn ledger(&self) -> &Ledger {
        &self.ledger
    }
}
