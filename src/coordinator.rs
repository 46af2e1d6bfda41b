//! Rendezvous coordinator: admission, message dispatch and disconnect unwinding.
//!
//! Registry mutations happen first; notifications are queued onto the affected
//! peers' outbound channels afterwards. The one exception is the snapshot a
//! joining peer receives, which is queued while its room is still locked so that
//! no later arrival can be announced to it ahead of its own member list.

use crate::error::{Error, Result};
use crate::ledger::now_millis;
use crate::liveness;
use crate::peer::{hash_code, ConnectionMetadata, DeviceInfoUpdate, Peer, PeerId, PeerInfo};
use crate::protocol::{self, ClientMessage, Inbound, ServerMessage};
use crate::rooms::{Joined, LeaveReason, RoomKey, RoomKind};
use crate::state::{Rendezvous, Session};
use serde_json::{Map, Value};
use std::sync::Arc;
use tokio::sync::mpsc;
use tokio::time::Instant;
use tracing::{debug, info, warn};
use uuid::Uuid;

impl Rendezvous {
    /// Registers a new connection and starts its liveness task. Outbound
    /// envelopes for the peer are pushed onto `outbound`.
    pub fn admit(
        self: &Arc<Self>,
        meta: &ConnectionMetadata,
        outbound: mpsc::UnboundedSender<String>,
    ) -> Arc<Session> {
        let peer = Peer::admit(meta, self.settings.trust_proxy_headers);
        let device = peer.device.clone();
        let session = Arc::new(Session::new(peer, outbound, &self.settings));
        let id = session.id;

        if let Some(previous) = self.peers.insert(id, session.clone()) {
            // Same identity reconnecting before its old socket noticed it was dead.
            warn!("Peer {} reconnected, replacing stale session", id);
            self.teardown(&previous, false);
        }
        liveness::spawn(self.clone(), session.clone());

        session.send(&ServerMessage::DisplayName {
            peer_id: id,
            peer_id_hash: hash_code(&id.to_string()),
            display_name: device.display_name.clone(),
            device_name: device.device_name.clone(),
            device_info: device.clone(),
        });

        let returning = self.ledger.touch(id, &device, now_millis());
        if returning {
            self.send_persistent_peers(&session);
        }

        info!(
            "Peer {} connected from {} ({} online)",
            id,
            session.peer.lock().origin,
            self.peers.len()
        );
        session
    }

    /// Entry point for a text frame. Errors are scoped to this one envelope.
    pub fn handle_text(self: &Arc<Self>, session: &Arc<Session>, text: &str) -> Result<()> {
        if session.is_closed() {
            return Ok(());
        }
        let inbound = protocol::decode(text)?;

        let gated = !matches!(&inbound, Inbound::Message(msg) if msg.is_rate_exempt());
        if gated && !session.rate.lock().try_acquire(Instant::now()) {
            return Err(Error::RateLimited(session.id));
        }

        match inbound {
            Inbound::Relay { to, envelope } => self.relay(session, &to, envelope),
            Inbound::Message(msg) => {
                debug!("Peer {} sent {:?}", session.id, msg);
                self.dispatch(session, msg);
                Ok(())
            }
        }
    }

    pub fn dispatch(self: &Arc<Self>, session: &Arc<Session>, msg: ClientMessage) {
        match msg {
            ClientMessage::JoinIpRoom => {
                let key = session.peer.lock().locality_room();
                self.enter_room(session, key, false);
            }
            ClientMessage::DeviceInfo { device_info, peer_id } => {
                self.update_device(session, &device_info);
                if peer_id.is_some() {
                    self.update_peerjs_id(session, peer_id);
                }
            }
            ClientMessage::RequestDevices => self.replay_memberships(session),
            ClientMessage::CreatePublicRoom => self.create_public_room(session),
            ClientMessage::JoinPublicRoom { public_room_id } => {
                self.join_public_room(session, &public_room_id)
            }
            ClientMessage::LeavePublicRoom => {
                self.leave_public_room(session);
            }
            ClientMessage::PeerjsIdUpdate { peerjs_id } => self.update_peerjs_id(session, peerjs_id),
            ClientMessage::Heartbeat => {
                session.liveness.lock().on_ack(Instant::now());
                session.send(&ServerMessage::HeartbeatResponse);
            }
            ClientMessage::Pong => session.liveness.lock().on_ack(Instant::now()),
            ClientMessage::ConnectionEstablished { peer_id } => {
                self.mark_connection(session, peer_id, true)
            }
            ClientMessage::ConnectionLost { peer_id } => self.mark_connection(session, peer_id, false),
            ClientMessage::RequestPersistentPeers => self.send_persistent_peers(session),
            ClientMessage::Disconnect => {
                info!("Peer {} asked to disconnect", session.id);
                self.disconnect(session);
            }
        }
    }

    /// Full unwind for a departing peer. Safe to call more than once and from
    /// any exit path; only the call that removes the session does the work.
    pub fn disconnect(&self, session: &Arc<Session>) {
        let removed = self
            .peers
            .remove_if(&session.id, |_, current| Arc::ptr_eq(current, session))
            .is_some();
        if removed {
            self.teardown(session, true);
        } else {
            session.cancel.cancel();
        }
    }

    fn teardown(&self, session: &Arc<Session>, notify_contacts: bool) {
        let id = session.id;
        // Stops the liveness task and the connection loop, and must precede the
        // drain below so no new seat can be claimed after it.
        session.cancel.cancel();

        let rooms: Vec<RoomKey> = {
            let mut peer = session.peer.lock();
            peer.public_room = None;
            peer.rooms.drain().collect()
        };
        for key in &rooms {
            self.vacate(id, key, LeaveReason::Disconnect);
        }

        if notify_contacts {
            if let Some(departure) = self.ledger.on_disconnect(&id, now_millis()) {
                let notice = ServerMessage::PersistentPeerOffline {
                    peer_id: id,
                    device_info: departure.device,
                };
                self.broadcast(&departure.notify, &notice);
            }
        }

        info!(
            "Peer {} disconnected, left {} room(s) ({} online)",
            id,
            rooms.len(),
            self.peers.len()
        );
    }

    /// False if the room was required to exist and did not, or if the session
    /// closed before it could be seated.
    fn enter_room(&self, session: &Arc<Session>, key: RoomKey, must_exist: bool) -> bool {
        let mut peer_info = None;
        let seated = |joined: &Joined| {
            let Some(info) = Self::claim_seat(session, &key) else {
                return false;
            };
            peer_info = Some(info);
            session.send(&ServerMessage::Peers {
                room_type: key.kind(),
                room_id: key.id().to_string(),
                peers: self.describe_all(&joined.existing),
            });
            true
        };
        let joined = if must_exist {
            self.rooms.join_existing(session.id, &key, seated)
        } else {
            self.rooms.join(session.id, &key, seated)
        };
        let (Some(joined), Some(peer_info)) = (joined, peer_info) else {
            return false;
        };

        if joined.newly_joined {
            info!("Peer {} joined {} ({} already there)", session.id, key, joined.existing.len());
            self.broadcast(
                &joined.existing,
                &ServerMessage::PeerJoined {
                    room_type: key.kind(),
                    room_id: key.id().to_string(),
                    peer: peer_info,
                },
            );
        }
        true
    }

    /// Records the membership on the peer while the room is still locked.
    /// `teardown` cancels before draining `peer.rooms` under this same lock, so
    /// a seat is either drained or never taken.
    fn claim_seat(session: &Session, key: &RoomKey) -> Option<PeerInfo> {
        let mut peer = session.peer.lock();
        if session.is_closed() {
            return None;
        }
        peer.rooms.insert(key.clone());
        if key.kind() == RoomKind::Public {
            peer.public_room = Some(key.id().to_string());
        }
        Some(peer.describe())
    }

    fn vacate(&self, id: PeerId, key: &RoomKey, reason: LeaveReason) {
        let Some(remaining) = self.rooms.leave(id, key) else {
            return;
        };
        debug!("Peer {} left {} ({:?})", id, key, reason);
        self.broadcast(
            &remaining,
            &ServerMessage::PeerLeft {
                room_type: key.kind(),
                room_id: key.id().to_string(),
                peer_id: id,
                reason,
            },
        );
    }

    fn leave_public_room(&self, session: &Arc<Session>) -> bool {
        let key = {
            let mut peer = session.peer.lock();
            let Some(code) = peer.public_room.take() else {
                return false;
            };
            let key = RoomKey::Public(code);
            peer.rooms.remove(&key);
            key
        };
        self.vacate(session.id, &key, LeaveReason::Voluntary);
        session.send(&ServerMessage::PublicRoomLeft {
            room_id: key.id().to_string(),
        });
        true
    }

    fn create_public_room(&self, session: &Arc<Session>) {
        self.leave_public_room(session);

        let created = self.rooms.create_public(session.id, |key| {
            if Self::claim_seat(session, key).is_none() {
                return false;
            }
            session.send(&ServerMessage::PublicRoomCreated {
                room_id: key.id().to_string(),
            });
            session.send(&ServerMessage::Peers {
                room_type: RoomKind::Public,
                room_id: key.id().to_string(),
                peers: Vec::new(),
            });
            true
        });
        match created {
            Some(key) => info!("Peer {} created public room {}", session.id, key),
            None => debug!("Peer {} closed before its public room was created", session.id),
        }
    }

    fn join_public_room(&self, session: &Arc<Session>, code: &str) {
        let code = code.trim().to_uppercase();
        let key = RoomKey::Public(code.clone());

        let current = session.peer.lock().public_room.clone();
        if current.as_deref() == Some(code.as_str()) {
            self.send_room_snapshot(session, &key);
            return;
        }
        if !self.rooms.contains(&key) {
            session.send(&ServerMessage::PublicRoomIdInvalid { public_room_id: code });
            return;
        }

        self.leave_public_room(session);
        if !self.enter_room(session, key, true) && !session.is_closed() {
            // Emptied between the check and the join.
            session.send(&ServerMessage::PublicRoomIdInvalid { public_room_id: code });
        }
    }

    fn replay_memberships(&self, session: &Arc<Session>) {
        let rooms: Vec<RoomKey> = session.peer.lock().rooms.iter().cloned().collect();
        for key in &rooms {
            self.send_room_snapshot(session, key);
        }
    }

    fn send_room_snapshot(&self, session: &Arc<Session>, key: &RoomKey) {
        let others: Vec<PeerId> = self
            .rooms
            .members(key)
            .into_iter()
            .filter(|id| *id != session.id)
            .collect();
        session.send(&ServerMessage::Peers {
            room_type: key.kind(),
            room_id: key.id().to_string(),
            peers: self.describe_all(&others),
        });
    }

    fn update_device(&self, session: &Arc<Session>, update: &DeviceInfoUpdate) {
        let (changed, peer_info, rooms) = {
            let mut peer = session.peer.lock();
            let changed = peer.device.apply(update);
            (changed, peer.describe(), peer.rooms.iter().cloned().collect::<Vec<_>>())
        };
        self.ledger
            .touch(session.id, &peer_info.device_info, now_millis());
        debug!("Peer {} device info update (changed: {})", session.id, changed);

        for key in &rooms {
            let message = ServerMessage::PeerInfoUpdated {
                room_type: key.kind(),
                room_id: key.id().to_string(),
                peer: peer_info.clone(),
            };
            self.broadcast(&self.co_members(session.id, key), &message);
        }
    }

    fn update_peerjs_id(&self, session: &Arc<Session>, peerjs_id: Option<String>) {
        let rooms = {
            let mut peer = session.peer.lock();
            peer.peerjs_id = peerjs_id.clone();
            peer.rooms.iter().cloned().collect::<Vec<_>>()
        };
        debug!("Peer {} negotiation id is now {:?}", session.id, peerjs_id);

        for key in &rooms {
            let message = ServerMessage::PeerjsIdUpdated {
                room_type: key.kind(),
                room_id: key.id().to_string(),
                peer_id: session.id,
                peerjs_id: peerjs_id.clone(),
            };
            self.broadcast(&self.co_members(session.id, key), &message);
        }
    }

    fn mark_connection(&self, session: &Arc<Session>, other: PeerId, established: bool) {
        let own_device = session.peer.lock().device.clone();
        let counterpart = self.session(&other);
        let now = now_millis();

        if established {
            let other_device = counterpart
                .as_ref()
                .map(|counterpart| counterpart.peer.lock().device.clone());
            self.ledger
                .mark_established(session.id, &own_device, other, other_device, now);
        } else {
            self.ledger.mark_lost(session.id, &own_device, other, now);
        }
        debug!(
            "Peer {} marked {} as {}",
            session.id,
            other,
            if established { "established" } else { "lost" }
        );

        if let Some(counterpart) = counterpart {
            let notice = if established {
                ServerMessage::ConnectionEstablishedNotification {
                    peer_id: session.id,
                    device_info: own_device,
                }
            } else {
                ServerMessage::ConnectionLostNotification {
                    peer_id: session.id,
                    device_info: own_device,
                }
            };
            counterpart.send(&notice);
        }
    }

    fn send_persistent_peers(&self, session: &Arc<Session>) {
        let peers = self.ledger.snapshot(&session.id, |id| self.is_online(id));
        session.send(&ServerMessage::PersistentPeers { peers });
    }

    /// Forwards the envelope untouched apart from `from`. Unknown or departed
    /// targets are dropped without telling the sender.
    fn relay(&self, session: &Arc<Session>, to: &str, envelope: Map<String, Value>) -> Result<()> {
        let target = Uuid::parse_str(to).map_err(|_| Error::InvalidTarget(to.to_string()))?;
        let Some(recipient) = self.session(&target) else {
            return Err(Error::UnknownPeer(target));
        };
        let text = serde_json::to_string(&protocol::stamp_sender(envelope, session.id))?;
        debug!("Relaying {} bytes from {} to {}", text.len(), session.id, target);
        recipient.send_raw(text);
        Ok(())
    }

    fn co_members(&self, id: PeerId, key: &RoomKey) -> Vec<PeerId> {
        self.rooms
            .members(key)
            .into_iter()
            .filter(|member| *member != id)
            .collect()
    }

    fn describe_all(&self, ids: &[PeerId]) -> Vec<PeerInfo> {
        ids.iter()
            .filter_map(|id| self.session(id))
            .map(|session| session.describe())
            .collect()
    }

    fn broadcast(&self, targets: &[PeerId], message: &ServerMessage) {
        if targets.is_empty() {
            return;
        }
        let text = match serde_json::to_string(message) {
            Ok(text) => text,
            Err(e) => {
                warn!("Failed to serialize broadcast: {}", e);
                return;
            }
        };
        for target in targets {
            if let Some(session) = self.session(target) {
                session.send_raw(text.clone());
            }
        }
    }
}
