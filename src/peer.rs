use crate::rooms::RoomKey;
use ipnetwork::IpNetwork;
use once_cell::sync::Lazy;
use serde::{Deserialize, Serialize};
use std::collections::HashSet;
use std::net::{IpAddr, Ipv4Addr, SocketAddr};
use uuid::Uuid;

pub type PeerId = Uuid;

/// Every LAN-ish origin collapses onto this address so devices behind the same
/// private network share a locality room.
pub const CANONICAL_LOOPBACK: IpAddr = IpAddr::V4(Ipv4Addr::LOCALHOST);

static PRIVATE_RANGES: Lazy<Vec<IpNetwork>> = Lazy::new(|| {
    [
        "127.0.0.0/8",
        "10.0.0.0/8",
        "172.16.0.0/12",
        "192.168.0.0/16",
        "::1/128",
        "fc00::/7",
        "fec0::/10",
        "fe80::/16",
        "100::/16",
    ]
    .iter()
    .filter_map(|net| net.parse().ok())
    .collect()
});

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum DeviceType {
    #[default]
    Desktop,
    Mobile,
    Tablet,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct DeviceInfo {
    pub display_name: String,
    pub device_name: String,
    #[serde(rename = "type")]
    pub device_type: DeviceType,
    pub browser: String,
    pub os: String,
}

/// Partial descriptor sent by clients. Absent fields keep their stored value.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct DeviceInfoUpdate {
    #[serde(default, alias = "name")]
    pub display_name: Option<String>,
    #[serde(default)]
    pub device_name: Option<String>,
    #[serde(default, rename = "type")]
    pub device_type: Option<DeviceType>,
    #[serde(default)]
    pub browser: Option<String>,
    #[serde(default)]
    pub os: Option<String>,
}

impl DeviceInfo {
    pub fn unknown() -> Self {
        Self {
            display_name: "Unknown Device".to_string(),
            device_name: "Unknown Device".to_string(),
            device_type: DeviceType::Desktop,
            browser: "Unknown".to_string(),
            os: "Unknown".to_string(),
        }
    }

    pub fn from_user_agent(user_agent: Option<&str>) -> Self {
        let Some(user_agent) = user_agent.filter(|ua| !ua.is_empty()) else {
            return Self::unknown();
        };
        let ua = user_agent.to_lowercase();

        let os = if ua.contains("windows") {
            "Windows"
        } else if ua.contains("mac os") {
            "macOS"
        } else if ua.contains("linux") {
            "Linux"
        } else if ua.contains("android") {
            "Android"
        } else if ua.contains("iphone") || ua.contains("ipad") {
            "iOS"
        } else {
            "Unknown"
        };

        let browser = if ua.contains("chrome") && !ua.contains("edg") {
            "Chrome"
        } else if ua.contains("firefox") {
            "Firefox"
        } else if ua.contains("safari") && !ua.contains("chrome") {
            "Safari"
        } else if ua.contains("edg") {
            "Edge"
        } else if ua.contains("opera") {
            "Opera"
        } else {
            "Unknown"
        };

        let device_type = if ua.contains("mobile") || ua.contains("android") || ua.contains("iphone")
        {
            DeviceType::Mobile
        } else if ua.contains("tablet") || ua.contains("ipad") {
            DeviceType::Tablet
        } else {
            DeviceType::Desktop
        };

        let device_name = if os == "Unknown" {
            browser.to_string()
        } else {
            format!("{} {}", os, browser)
        };

        Self {
            display_name: random_display_name(),
            device_name,
            device_type,
            browser: browser.to_string(),
            os: os.to_string(),
        }
    }

    /// Last write wins per field. Returns whether anything changed.
    pub fn apply(&mut self, update: &DeviceInfoUpdate) -> bool {
        let before = self.clone();
        if let Some(name) = &update.display_name {
            self.display_name = name.clone();
        }
        if let Some(name) = &update.device_name {
            self.device_name = name.clone();
        }
        if let Some(device_type) = update.device_type {
            self.device_type = device_type;
        }
        if let Some(browser) = &update.browser {
            self.browser = browser.clone();
        }
        if let Some(os) = &update.os {
            self.os = os.clone();
        }
        *self != before
    }
}

// "hulking-jam" -> "Hulking Jam"
fn random_display_name() -> String {
    let Some(raw) = names::Generator::default().next() else {
        return "Unknown Device".to_string();
    };
    raw.split('-')
        .map(|word| {
            let mut chars = word.chars();
            match chars.next() {
                Some(first) => first.to_uppercase().chain(chars).collect::<String>(),
                None => String::new(),
            }
        })
        .collect::<Vec<_>>()
        .join(" ")
}

/// What the upgrade request tells us about the connecting client.
#[derive(Debug, Clone)]
pub struct ConnectionMetadata {
    pub remote_addr: SocketAddr,
    pub cf_connecting_ip: Option<String>,
    pub forwarded_for: Option<String>,
    pub user_agent: Option<String>,
    pub peer_id: Option<String>,
    pub peer_id_hash: Option<String>,
}

impl ConnectionMetadata {
    pub fn new(remote_addr: SocketAddr) -> Self {
        Self {
            remote_addr,
            cf_connecting_ip: None,
            forwarded_for: None,
            user_agent: None,
            peer_id: None,
            peer_id_hash: None,
        }
    }
}

/// Externally visible view of a peer, used whenever it is advertised to others.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct PeerInfo {
    pub id: PeerId,
    pub device_info: DeviceInfo,
    #[serde(rename = "peerJSId")]
    pub peerjs_id: Option<String>,
    pub rtc_supported: bool,
}

#[derive(Debug, Clone)]
pub struct Peer {
    pub id: PeerId,
    pub origin: IpAddr,
    pub device: DeviceInfo,
    pub peerjs_id: Option<String>,
    pub rooms: HashSet<RoomKey>,
    pub public_room: Option<String>,
}

impl Peer {
    /// Never fails: a reuse attempt that does not validate silently gets a fresh id.
    pub fn admit(meta: &ConnectionMetadata, trust_proxy_headers: bool) -> Self {
        let id = match (meta.peer_id.as_deref(), meta.peer_id_hash.as_deref()) {
            (Some(candidate), Some(hash)) if is_valid_uuid(candidate) && hash == hash_code(candidate) => {
                Uuid::parse_str(candidate).unwrap_or_else(|_| Uuid::new_v4())
            }
            (Some(candidate), _) => {
                tracing::debug!("Rejected identity reuse for {:?}", candidate);
                Uuid::new_v4()
            }
            _ => Uuid::new_v4(),
        };

        let origin = network_origin(meta, trust_proxy_headers);
        let device = DeviceInfo::from_user_agent(meta.user_agent.as_deref());
        tracing::debug!("Admitted {} from {} as {:?}", id, origin, device);

        Self {
            id,
            origin,
            device,
            peerjs_id: None,
            rooms: HashSet::new(),
            public_room: None,
        }
    }

    pub fn describe(&self) -> PeerInfo {
        PeerInfo {
            id: self.id,
            device_info: self.device.clone(),
            peerjs_id: self.peerjs_id.clone(),
            rtc_supported: true,
        }
    }

    pub fn locality_room(&self) -> RoomKey {
        RoomKey::Locality(self.origin.to_string())
    }
}

/// Lowercase `8-4-4-4-12` hex, the only form clients ever send back.
pub fn is_valid_uuid(candidate: &str) -> bool {
    const GROUPS: [usize; 5] = [8, 4, 4, 4, 12];
    let parts: Vec<&str> = candidate.split('-').collect();
    parts.len() == GROUPS.len()
        && parts.iter().zip(GROUPS).all(|(part, len)| {
            part.len() == len && part.chars().all(|c| matches!(c, '0'..='9' | 'a'..='f'))
        })
}

/// 31-multiplier string hash over UTF-16 units with 32-bit wrapping, as a signed
/// decimal. Not keyed: this only guards the id format, it authenticates nothing.
pub fn hash_code(input: &str) -> String {
    input
        .encode_utf16()
        .fold(0i32, |hash, unit| hash.wrapping_mul(31).wrapping_add(i32::from(unit)))
        .to_string()
}

pub fn network_origin(meta: &ConnectionMetadata, trust_proxy_headers: bool) -> IpAddr {
    let from_headers = if trust_proxy_headers {
        meta.cf_connecting_ip
            .as_deref()
            .or(meta.forwarded_for.as_deref())
            .and_then(first_forwarded)
    } else {
        None
    };
    normalize(from_headers.unwrap_or_else(|| meta.remote_addr.ip()))
}

fn first_forwarded(header: &str) -> Option<IpAddr> {
    let first = header.split(',').next()?.trim();
    let first = first.strip_prefix("::ffff:").unwrap_or(first);
    first.parse().ok()
}

pub fn normalize(ip: IpAddr) -> IpAddr {
    let ip = match ip {
        IpAddr::V6(v6) => v6.to_ipv4_mapped().map(IpAddr::V4).unwrap_or(ip),
        v4 => v4,
    };
    if PRIVATE_RANGES.iter().any(|net| net.contains(ip)) {
        CANONICAL_LOOPBACK
    } else {
        ip
    }
}
