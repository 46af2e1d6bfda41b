use crate::error::{Error, Result};
use crate::ledger::PersistentPeer;
use crate::peer::{DeviceInfo, DeviceInfoUpdate, PeerId, PeerInfo};
use crate::rooms::{LeaveReason, RoomKind};
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};

/// Client -> server envelopes that the server interprets.
#[derive(Serialize, Deserialize, Debug, Clone, PartialEq)]
#[serde(tag = "type", rename_all = "kebab-case", rename_all_fields = "camelCase")]
pub enum ClientMessage {
    JoinIpRoom,
    #[serde(alias = "device-info-update")]
    DeviceInfo {
        #[serde(default)]
        device_info: DeviceInfoUpdate,
        // Negotiation library id, sent alongside the descriptor once known.
        #[serde(default)]
        peer_id: Option<String>,
    },
    #[serde(alias = "discovery-request")]
    RequestDevices,
    CreatePublicRoom,
    JoinPublicRoom {
        public_room_id: String,
    },
    LeavePublicRoom,
    PeerjsIdUpdate {
        #[serde(default, rename = "peerJSId", alias = "peerId")]
        peerjs_id: Option<String>,
    },
    Heartbeat,
    Pong,
    ConnectionEstablished {
        peer_id: PeerId,
    },
    ConnectionLost {
        peer_id: PeerId,
    },
    RequestPersistentPeers,
    Disconnect,
}

impl ClientMessage {
    /// Liveness acks answer our own probes, and a throttled client must still be
    /// able to leave. Neither counts against the rate limit.
    pub fn is_rate_exempt(&self) -> bool {
        matches!(
            self,
            ClientMessage::Heartbeat | ClientMessage::Pong | ClientMessage::Disconnect
        )
    }
}

/// Server -> client envelopes.
#[derive(Serialize, Deserialize, Debug, Clone, PartialEq)]
#[serde(tag = "type", rename_all = "kebab-case", rename_all_fields = "camelCase")]
pub enum ServerMessage {
    DisplayName {
        peer_id: PeerId,
        peer_id_hash: String,
        display_name: String,
        device_name: String,
        device_info: DeviceInfo,
    },
    Peers {
        room_type: RoomKind,
        room_id: String,
        peers: Vec<PeerInfo>,
    },
    PeerJoined {
        room_type: RoomKind,
        room_id: String,
        peer: PeerInfo,
    },
    PeerLeft {
        room_type: RoomKind,
        room_id: String,
        peer_id: PeerId,
        reason: LeaveReason,
    },
    PeerInfoUpdated {
        room_type: RoomKind,
        room_id: String,
        peer: PeerInfo,
    },
    PeerjsIdUpdated {
        room_type: RoomKind,
        room_id: String,
        peer_id: PeerId,
        #[serde(rename = "peerJSId")]
        peerjs_id: Option<String>,
    },
    PublicRoomCreated {
        room_id: String,
    },
    PublicRoomLeft {
        room_id: String,
    },
    PublicRoomIdInvalid {
        public_room_id: String,
    },
    PersistentPeers {
        peers: Vec<PersistentPeer>,
    },
    PersistentPeerOffline {
        peer_id: PeerId,
        device_info: DeviceInfo,
    },
    ConnectionEstablishedNotification {
        peer_id: PeerId,
        device_info: DeviceInfo,
    },
    ConnectionLostNotification {
        peer_id: PeerId,
        device_info: DeviceInfo,
    },
    HeartbeatResponse,
    Ping,
}

#[derive(Debug, Clone, PartialEq)]
pub enum Inbound {
    Message(ClientMessage),
    /// Opaque envelope for another peer. Kept as parsed JSON so it can be
    /// forwarded without knowing its schema.
    Relay {
        to: String,
        envelope: Map<String, Value>,
    },
}

/// Anything carrying a string `to` is a relay, whatever its `type` says.
pub fn decode(text: &str) -> Result<Inbound> {
    let Value::Object(envelope) = serde_json::from_str::<Value>(text)? else {
        return Err(Error::NotAnObject);
    };
    if let Some(Value::String(to)) = envelope.get("to") {
        return Ok(Inbound::Relay {
            to: to.clone(),
            envelope,
        });
    }
    Ok(Inbound::Message(serde_json::from_value(Value::Object(
        envelope,
    ))?))
}

/// Injects (or overwrites) `from` so the receiver knows who to answer.
pub fn stamp_sender(mut envelope: Map<String, Value>, from: PeerId) -> Value {
    envelope.insert("from".to_string(), Value::String(from.to_string()));
    Value::Object(envelope)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::peer::DeviceType;
    use serde_json::json;
    use uuid::Uuid;

    fn message(value: Value) -> ClientMessage {
        match decode(&value.to_string()).unwrap() {
            Inbound::Message(msg) => msg,
            other => panic!("expected message, got {:?}", other),
        }
    }

    #[test]
    fn test_aliases_decode_to_same_kind() {
        assert_eq!(message(json!({"type": "request-devices"})), ClientMessage::RequestDevices);
        assert_eq!(message(json!({"type": "discovery-request"})), ClientMessage::RequestDevices);
        assert_eq!(message(json!({"type": "heartbeat"})), ClientMessage::Heartbeat);
        assert_eq!(message(json!({"type": "pong"})), ClientMessage::Pong);
        assert!(ClientMessage::Pong.is_rate_exempt());
        assert!(ClientMessage::Disconnect.is_rate_exempt());
        assert!(!ClientMessage::RequestDevices.is_rate_exempt());

        let update = message(json!({
            "type": "device-info-update",
            "deviceInfo": {"name": "Den PC", "type": "tablet"}
        }));
        let ClientMessage::DeviceInfo { device_info, peer_id } = update else {
            panic!("expected device info");
        };
        assert_eq!(device_info.display_name.as_deref(), Some("Den PC"));
        assert_eq!(device_info.device_type, Some(DeviceType::Tablet));
        assert_eq!(peer_id, None);
    }

    #[test]
    fn test_peerjs_id_update_field_names() {
        assert_eq!(
            message(json!({"type": "peerjs-id-update", "peerJSId": "abc"})),
            ClientMessage::PeerjsIdUpdate { peerjs_id: Some("abc".to_string()) }
        );
        assert_eq!(
            message(json!({"type": "peerjs-id-update", "peerId": "abc"})),
            ClientMessage::PeerjsIdUpdate { peerjs_id: Some("abc".to_string()) }
        );
    }

    #[test]
    fn test_to_field_wins_over_type() {
        let raw = json!({"type": "join-ip-room", "to": "someone", "sdp": {"a": 1}});
        let Inbound::Relay { to, envelope } = decode(&raw.to_string()).unwrap() else {
            panic!("expected relay");
        };
        assert_eq!(to, "someone");
        assert_eq!(envelope.get("sdp"), Some(&json!({"a": 1})));
    }

    #[test]
    fn test_malformed_envelopes_rejected() {
        assert!(matches!(decode("not json"), Err(Error::Malformed(_))));
        assert!(matches!(decode("[1, 2]"), Err(Error::NotAnObject)));
        assert!(matches!(decode(r#"{"type": "launch-rockets"}"#), Err(Error::Malformed(_))));
        assert!(matches!(decode(r#"{"to": 7}"#), Err(Error::Malformed(_))));
    }

    #[test]
    fn test_stamp_sender_preserves_payload() {
        let from = Uuid::new_v4();
        let mut envelope = Map::new();
        envelope.insert("type".to_string(), json!("offer"));
        envelope.insert("from".to_string(), json!("spoofed"));
        let stamped = stamp_sender(envelope, from);
        assert_eq!(stamped, json!({"type": "offer", "from": from.to_string()}));
    }

    #[test]
    fn test_server_message_wire_shape() {
        let id = Uuid::new_v4();
        let left = ServerMessage::PeerLeft {
            room_type: RoomKind::Locality,
            room_id: "127.0.0.1".to_string(),
            peer_id: id,
            reason: LeaveReason::Disconnect,
        };
        assert_eq!(
            serde_json::to_value(&left).unwrap(),
            json!({
                "type": "peer-left",
                "roomType": "ip",
                "roomId": "127.0.0.1",
                "peerId": id.to_string(),
                "reason": "disconnect"
            })
        );
        assert_eq!(serde_json::to_value(&ServerMessage::Ping).unwrap(), json!({"type": "ping"}));
        assert_eq!(
            serde_json::to_value(&ServerMessage::PeerjsIdUpdated {
                room_type: RoomKind::Public,
                room_id: "AB12C".to_string(),
                peer_id: id,
                peerjs_id: None,
            })
            .unwrap(),
            json!({
                "type": "peerjs-id-updated",
                "roomType": "public",
                "roomId": "AB12C",
                "peerId": id.to_string(),
                "peerJSId": null
            })
        );
    }
}
