pub mod config;
mod coordinator;
pub mod error;
pub mod ledger;
pub mod liveness;
pub mod logging;
pub mod peer;
pub mod protocol;
pub mod ratelimit;
pub mod rooms;
pub mod server;
pub mod state;

pub use config::{Config, Settings};
pub use error::{Error, Result};
pub use ledger::{Ledger, LedgerEntry, PersistentPeer};
pub use liveness::LivenessConfig;
pub use logging::init as init_logging;
pub use peer::{hash_code, ConnectionMetadata, DeviceInfo, DeviceType, PeerId, PeerInfo};
pub use protocol::{ClientMessage, ServerMessage};
pub use ratelimit::RateLimitConfig;
pub use rooms::{LeaveReason, RoomKind};
pub use server::{router, serve};
pub use state::{Rendezvous, Session};

/// Binds the configured address and serves until Ctrl-C.
pub async fn run(config: Config) -> Result<()> {
    server::run(config).await
}
