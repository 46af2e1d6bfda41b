//! Per-peer heartbeat scheduling.
//!
//! Each tick either probes the peer with a `ping` or, once `miss_limit` whole
//! intervals have passed since the last acknowledgement, declares it
//! unresponsive. Acknowledgements are not matched to probes; any ack resets the
//! clock.

use crate::protocol::ServerMessage;
use crate::state::{Rendezvous, Session};
use std::sync::Arc;
use std::time::Duration;
use tokio::task::JoinHandle;
use tokio::time::{Instant, MissedTickBehavior};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct LivenessConfig {
    pub interval: Duration,
    pub miss_limit: u32,
}

impl Default for LivenessConfig {
    fn default() -> Self {
        Self {
            interval: Duration::from_secs(1),
            miss_limit: 5,
        }
    }
}

impl LivenessConfig {
    pub fn deadline(&self) -> Duration {
        self.interval * self.miss_limit
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Phase {
    Scheduled,
    AwaitingPong,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Tick {
    /// `unanswered` is set when the previous probe got no ack before this tick.
    Probe { unanswered: bool },
    Expired,
}

#[derive(Debug)]
pub struct Liveness {
    config: LivenessConfig,
    last_beat: Instant,
    phase: Phase,
}

impl Liveness {
    pub fn new(config: LivenessConfig, now: Instant) -> Self {
        Self {
            config,
            last_beat: now,
            phase: Phase::Scheduled,
        }
    }

    pub fn on_tick(&mut self, now: Instant) -> Tick {
        if now.saturating_duration_since(self.last_beat) >= self.config.deadline() {
            return Tick::Expired;
        }
        let unanswered = self.phase == Phase::AwaitingPong;
        self.phase = Phase::AwaitingPong;
        Tick::Probe { unanswered }
    }

    pub fn on_ack(&mut self, now: Instant) {
        self.last_beat = now;
        self.phase = Phase::Scheduled;
    }
}

/// Drives a peer's liveness until its session is cancelled or the peer
/// expires, in which case it runs the regular disconnect path.
pub fn spawn(rendezvous: Arc<Rendezvous>, session: Arc<Session>) -> JoinHandle<()> {
    let interval = rendezvous.settings().liveness.interval;
    tokio::spawn(async move {
        let mut ticker = tokio::time::interval_at(Instant::now() + interval, interval);
        ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);

        loop {
            tokio::select! {
                _ = session.cancel.cancelled() => break,
                _ = ticker.tick() => {
                    let outcome = session.liveness.lock().on_tick(Instant::now());
                    match outcome {
                        Tick::Probe { unanswered } => {
                            if unanswered {
                                tracing::debug!("Peer {} has not answered its last probe", session.id);
                            }
                            session.send(&ServerMessage::Ping);
                        }
                        Tick::Expired => {
                            tracing::warn!("Peer {} missed its heartbeats, disconnecting", session.id);
                            rendezvous.disconnect(&session);
                            break;
                        }
                    }
                }
            }
        }
        tracing::debug!("Liveness task for {} ended", session.id);
    })
}
