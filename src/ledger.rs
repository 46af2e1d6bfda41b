//! Relationship ledger.
//!
//! Remembers which peers each peer has paired with, and survives the peer's
//! disconnect so a later reconnect can pick the relationships back up. Lives for
//! the process lifetime only.

use crate::peer::{DeviceInfo, PeerId};
use dashmap::DashMap;
use serde::{Deserialize, Serialize};
use std::collections::HashMap;

pub fn now_millis() -> u64 {
    std::time::SystemTime::now()
        .duration_since(std::time::UNIX_EPOCH)
        .unwrap_or_default()
        .as_millis() as u64
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Contact {
    /// Counterpart's descriptor the last time the two were in contact.
    pub device: Option<DeviceInfo>,
    pub last_connected_at: u64,
    pub established: bool,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct LedgerEntry {
    /// This peer's own last-known descriptor, carried in offline notices.
    pub device: DeviceInfo,
    pub last_seen: u64,
    pub contacts: HashMap<PeerId, Contact>,
}

#[derive(Serialize, Deserialize, Debug, Clone, PartialEq, Eq)]
#[serde(rename_all = "camelCase")]
pub struct PersistentPeer {
    pub peer_id: PeerId,
    pub device_info: Option<DeviceInfo>,
    pub last_connected_at: u64,
    pub is_online: bool,
    pub established: bool,
}

/// Who to tell that a peer went away, and what it looked like.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Departure {
    pub device: DeviceInfo,
    pub notify: Vec<PeerId>,
}

#[derive(Debug, Default)]
pub struct Ledger {
    entries: DashMap<PeerId, LedgerEntry>,
}

impl Ledger {
    pub fn new() -> Self {
        Self::default()
    }

    /// Records `peer`'s current descriptor. Returns true if the peer already had
    /// an entry, i.e. this is a returning identity.
    pub fn touch(&self, peer: PeerId, device: &DeviceInfo, now: u64) -> bool {
        let mut returning = true;
        let mut entry = self.entries.entry(peer).or_insert_with(|| {
            returning = false;
            LedgerEntry {
                device: device.clone(),
                last_seen: now,
                contacts: HashMap::new(),
            }
        });
        entry.device = device.clone();
        entry.last_seen = now;
        returning
    }

    pub fn mark_established(
        &self,
        peer: PeerId,
        own_device: &DeviceInfo,
        other: PeerId,
        other_device: Option<DeviceInfo>,
        now: u64,
    ) {
        let other_device = other_device.or_else(|| self.last_known_device(&other));
        let mut entry = self.entry_for(peer, own_device, now);
        let contact = entry.contacts.entry(other).or_insert(Contact {
            device: None,
            last_connected_at: now,
            established: true,
        });
        if other_device.is_some() {
            contact.device = other_device;
        }
        contact.last_connected_at = now;
        contact.established = true;
    }

    /// Clears the established flag. The contact itself stays listed.
    pub fn mark_lost(&self, peer: PeerId, own_device: &DeviceInfo, other: PeerId, now: u64) {
        let mut entry = self.entry_for(peer, own_device, now);
        if let Some(contact) = entry.contacts.get_mut(&other) {
            contact.established = false;
            contact.last_connected_at = now;
        }
    }

    pub fn snapshot(&self, peer: &PeerId, is_online: impl Fn(&PeerId) -> bool) -> Vec<PersistentPeer> {
        let Some(entry) = self.entries.get(peer) else {
            return Vec::new();
        };
        let mut peers: Vec<PersistentPeer> = entry
            .contacts
            .iter()
            .map(|(id, contact)| PersistentPeer {
                peer_id: *id,
                device_info: contact.device.clone(),
                last_connected_at: contact.last_connected_at,
                is_online: false,
                established: contact.established,
            })
            .collect();
        drop(entry);

        for persistent in &mut peers {
            persistent.is_online = is_online(&persistent.peer_id);
        }
        peers.sort_by(|a, b| b.last_connected_at.cmp(&a.last_connected_at));
        peers
    }

    /// Keeps the entry; returns the established contacts to notify.
    pub fn on_disconnect(&self, peer: &PeerId, now: u64) -> Option<Departure> {
        let mut entry = self.entries.get_mut(peer)?;
        entry.last_seen = now;
        let notify = entry
            .contacts
            .iter()
            .filter(|(_, contact)| contact.established)
            .map(|(id, _)| *id)
            .collect();
        Some(Departure {
            device: entry.device.clone(),
            notify,
        })
    }

    pub fn entry(&self, peer: &PeerId) -> Option<LedgerEntry> {
        self.entries.get(peer).map(|entry| entry.clone())
    }

    fn last_known_device(&self, peer: &PeerId) -> Option<DeviceInfo> {
        self.entries.get(peer).map(|entry| entry.device.clone())
    }

    fn entry_for(
        &self,
        peer: PeerId,
        own_device: &DeviceInfo,
        now: u64,
    ) -> dashmap::mapref::one::RefMut<'_, PeerId, LedgerEntry> {
        let mut entry = self.entries.entry(peer).or_insert_with(|| LedgerEntry {
            device: own_device.clone(),
            last_seen: now,
            contacts: HashMap::new(),
        });
        entry.device = own_device.clone();
        entry.last_seen = now;
        entry
    }
}
