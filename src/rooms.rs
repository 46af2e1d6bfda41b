//! Room registry: named sets of peer ids.
//!
//! Locality rooms group peers by normalized network address, public rooms by a
//! short shareable code. A room exists exactly as long as it has members. Every
//! mutation happens under the map shard lock for that room only, so rooms do
//! not serialize against each other.

use crate::peer::PeerId;
use dashmap::mapref::entry::Entry;
use dashmap::DashMap;
use rand::Rng;
use serde::{Deserialize, Serialize};
use std::collections::HashSet;
use std::fmt;

pub const PUBLIC_CODE_LEN: usize = 5;
const PUBLIC_CODE_ALPHABET: &[u8] = b"ABCDEFGHIJKLMNOPQRSTUVWXYZ0123456789";

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum RoomKind {
    /// Serialized as `ip`, the name browser clients already key on.
    #[serde(rename = "ip")]
    Locality,
    Public,
}

#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub enum RoomKey {
    Locality(String),
    Public(String),
}

impl RoomKey {
    pub fn kind(&self) -> RoomKind {
        match self {
            RoomKey::Locality(_) => RoomKind::Locality,
            RoomKey::Public(_) => RoomKind::Public,
        }
    }

    pub fn id(&self) -> &str {
        match self {
            RoomKey::Locality(id) | RoomKey::Public(id) => id,
        }
    }
}

impl fmt::Display for RoomKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            RoomKey::Locality(addr) => write!(f, "locality:{}", addr),
            RoomKey::Public(code) => write!(f, "public:{}", code),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum LeaveReason {
    Voluntary,
    Disconnect,
}

#[derive(Debug, Default)]
pub struct Joined {
    /// Members present before the joining peer, never including it.
    pub existing: Vec<PeerId>,
    /// False when the peer was already a member; nobody needs telling again.
    pub newly_joined: bool,
}

#[derive(Debug, Default)]
pub struct RoomRegistry {
    rooms: DashMap<RoomKey, HashSet<PeerId>>,
}

impl RoomRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Creates the room if absent. `seated` runs while the room is locked, before
    /// the peer is added; returning false leaves the registry untouched. Whatever
    /// `seated` queues for the joiner is ordered ahead of any later joiner's
    /// announcement.
    pub fn join(
        &self,
        peer: PeerId,
        key: &RoomKey,
        seated: impl FnOnce(&Joined) -> bool,
    ) -> Option<Joined> {
        match self.rooms.entry(key.clone()) {
            Entry::Occupied(mut room) => Self::seat(room.get_mut(), peer, seated),
            Entry::Vacant(slot) => {
                let joined = Joined {
                    existing: Vec::new(),
                    newly_joined: true,
                };
                if !seated(&joined) {
                    return None;
                }
                slot.insert(HashSet::from([peer]));
                Some(joined)
            }
        }
    }

    /// Joins only if the room is live. Used for public codes typed in by users.
    pub fn join_existing(
        &self,
        peer: PeerId,
        key: &RoomKey,
        seated: impl FnOnce(&Joined) -> bool,
    ) -> Option<Joined> {
        let mut members = self.rooms.get_mut(key)?;
        Self::seat(&mut members, peer, seated)
    }

    fn seat(
        members: &mut HashSet<PeerId>,
        peer: PeerId,
        seated: impl FnOnce(&Joined) -> bool,
    ) -> Option<Joined> {
        let joined = Joined {
            existing: members.iter().copied().filter(|id| *id != peer).collect(),
            newly_joined: !members.contains(&peer),
        };
        if !seated(&joined) {
            return None;
        }
        members.insert(peer);
        Some(joined)
    }

    /// Returns the members left behind, or `None` if the peer was not in the room.
    /// The room is dropped in the same critical section that empties it.
    pub fn leave(&self, peer: PeerId, key: &RoomKey) -> Option<Vec<PeerId>> {
        match self.rooms.entry(key.clone()) {
            Entry::Occupied(mut room) => {
                if !room.get_mut().remove(&peer) {
                    return None;
                }
                if room.get().is_empty() {
                    room.remove();
                    Some(Vec::new())
                } else {
                    Some(room.get().iter().copied().collect())
                }
            }
            Entry::Vacant(_) => None,
        }
    }

    /// Allocates a fresh public code and seats `creator` in it atomically, so
    /// two concurrent creators can never land on the same code. `None` if
    /// `seated` declined.
    pub fn create_public(
        &self,
        creator: PeerId,
        seated: impl FnOnce(&RoomKey) -> bool,
    ) -> Option<RoomKey> {
        let mut rng = rand::thread_rng();
        loop {
            let code: String = (0..PUBLIC_CODE_LEN)
                .map(|_| PUBLIC_CODE_ALPHABET[rng.gen_range(0..PUBLIC_CODE_ALPHABET.len())] as char)
                .collect();
            let key = RoomKey::Public(code);
            if let Entry::Vacant(slot) = self.rooms.entry(key.clone()) {
                if !seated(&key) {
                    return None;
                }
                slot.insert(HashSet::from([creator]));
                return Some(key);
            }
            tracing::debug!("Public room code {} collided, retrying", key);
        }
    }

    pub fn members(&self, key: &RoomKey) -> Vec<PeerId> {
        self.rooms
            .get(key)
            .map(|members| members.iter().copied().collect())
            .unwrap_or_default()
    }

    pub fn contains(&self, key: &RoomKey) -> bool {
        self.rooms.contains_key(key)
    }

    pub fn len(&self) -> usize {
        self.rooms.len()
    }

    pub fn is_empty(&self) -> bool {
        self.rooms.is_empty()
    }

    pub fn public_room_count(&self) -> usize {
        self.rooms
            .iter()
            .filter(|room| room.key().kind() == RoomKind::Public)
            .count()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Arc;
    use uuid::Uuid;

    fn lan() -> RoomKey {
        RoomKey::Locality("127.0.0.1".to_string())
    }

    fn join(registry: &RoomRegistry, peer: PeerId, key: &RoomKey) -> Joined {
        registry.join(peer, key, |_| true).unwrap()
    }

    fn create(registry: &RoomRegistry, creator: PeerId) -> RoomKey {
        registry.create_public(creator, |_| true).unwrap()
    }

    #[test]
    fn test_join_snapshot_excludes_self() {
        let registry = RoomRegistry::new();
        let (a, b, c) = (Uuid::new_v4(), Uuid::new_v4(), Uuid::new_v4());

        assert!(join(&registry, a, &lan()).existing.is_empty());
        assert_eq!(join(&registry, b, &lan()).existing, vec![a]);

        let third = join(&registry, c, &lan());
        assert!(third.newly_joined);
        assert_eq!(third.existing.len(), 2);
        assert!(!third.existing.contains(&c));

        let again = join(&registry, c, &lan());
        assert!(!again.newly_joined);
        assert!(!again.existing.contains(&c));
    }

    #[test]
    fn test_room_exists_iff_non_empty() {
        let registry = RoomRegistry::new();
        let (a, b) = (Uuid::new_v4(), Uuid::new_v4());

        join(&registry, a, &lan());
        join(&registry, b, &lan());
        assert_eq!(registry.leave(a, &lan()), Some(vec![b]));
        assert!(registry.contains(&lan()));

        assert_eq!(registry.leave(b, &lan()), Some(vec![]));
        assert!(!registry.contains(&lan()));
        assert!(registry.is_empty());

        // Leaving a room you are not in is a no-op and does not resurrect it.
        assert_eq!(registry.leave(b, &lan()), None);
        assert!(!registry.contains(&lan()));
    }

    #[test]
    fn test_declined_seat_leaves_no_trace() {
        let registry = RoomRegistry::new();
        let (a, b) = (Uuid::new_v4(), Uuid::new_v4());

        assert!(registry.join(a, &lan(), |_| false).is_none());
        assert!(!registry.contains(&lan()));
        assert!(registry.create_public(a, |_| false).is_none());
        assert!(registry.is_empty());

        join(&registry, a, &lan());
        assert!(registry.join(b, &lan(), |_| false).is_none());
        assert_eq!(registry.members(&lan()), vec![a]);
    }

    #[test]
    fn test_join_existing_requires_live_room() {
        let registry = RoomRegistry::new();
        let (a, b) = (Uuid::new_v4(), Uuid::new_v4());
        let missing = RoomKey::Public("ZZZZZ".to_string());
        assert!(registry.join_existing(a, &missing, |_| true).is_none());
        assert!(!registry.contains(&missing));

        let key = create(&registry, a);
        let joined = registry.join_existing(b, &key, |_| true).unwrap();
        assert_eq!(joined.existing, vec![a]);
    }

    #[test]
    fn test_public_code_shape() {
        let registry = RoomRegistry::new();
        let key = create(&registry, Uuid::new_v4());
        assert_eq!(key.kind(), RoomKind::Public);
        assert_eq!(key.id().len(), PUBLIC_CODE_LEN);
        assert!(key
            .id()
            .chars()
            .all(|c| c.is_ascii_uppercase() || c.is_ascii_digit()));
        assert_eq!(key.to_string(), format!("public:{}", key.id()));
    }

    #[test]
    fn test_concurrent_public_codes_never_collide() {
        let registry = Arc::new(RoomRegistry::new());
        let handles: Vec<_> = (0..8)
            .map(|_| {
                let registry = registry.clone();
                std::thread::spawn(move || {
                    (0..250)
                        .map(|_| create(&registry, Uuid::new_v4()))
                        .collect::<Vec<_>>()
                })
            })
            .collect();

        let mut seen = HashSet::new();
        for handle in handles {
            for key in handle.join().unwrap() {
                assert!(seen.insert(key), "duplicate public code");
            }
        }
        assert_eq!(registry.public_room_count(), 2000);
        for key in &seen {
            assert_eq!(registry.members(key).len(), 1);
        }
    }
}
