//! Liveness probing
//!
//! A single monitor task ticks on a fixed period and queues a `Probe` for
//! every open connection. Each connection task owns its [`LivenessState`] and
//! applies the transition itself, so the tick and the pong never race.

use std::sync::Arc;
use std::time::Duration;

use tokio::sync::broadcast;
use tokio::time::{interval, MissedTickBehavior};
use tracing::{debug, info, warn};

use crate::registry::ConnectionRegistry;

/// What the connection task must do after a probe tick
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ProbeAction {
    /// Send a transport-level ping
    Ping,
    /// Peer missed too many probes: force-close
    Evict,
}

/// Per-connection probe state
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum LivenessState {
    /// Answered the last probe (or just connected)
    #[default]
    Alive,
    /// A probe is outstanding; `missed` counts the ticks that found it still
    /// unanswered without evicting
    Pending { missed: u32 },
}

impl LivenessState {
    /// Apply a probe tick.
    ///
    /// `miss_tolerance` is the number of extra ticks a pending connection is
    /// allowed before eviction; zero evicts on the first tick that finds the
    /// previous probe unanswered.
    pub fn on_tick(&mut self, miss_tolerance: u32) -> ProbeAction {
        match *self {
            LivenessState::Alive => {
                *self = LivenessState::Pending { missed: 0 };
                ProbeAction::Ping
            }
            LivenessState::Pending { missed } if missed >= miss_tolerance => ProbeAction::Evict,
            LivenessState::Pending { missed } => {
                *self = LivenessState::Pending { missed: missed + 1 };
                ProbeAction::Ping
            }
        }
    }

    /// Apply a probe response
    pub fn on_pong(&mut self) {
        *self = LivenessState::Alive;
    }

    pub fn is_alive(&self) -> bool {
        matches!(self, LivenessState::Alive)
    }
}

/// Recurring task that drives probe ticks for every connection
pub struct LivenessMonitor {
    registry: Arc<ConnectionRegistry>,
    period: Duration,
}

impl LivenessMonitor {
    /// Create a monitor ticking every `period`
    pub fn new(registry: Arc<ConnectionRegistry>, period: Duration) -> Self {
        Self { registry, period }
    }

    /// Run until the shutdown signal fires
    pub async fn run(self, mut shutdown_rx: broadcast::Receiver<()>) {
        let mut ticker = interval(self.period);
        ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
        // Skip the first immediate tick
        ticker.tick().await;

        info!("Liveness monitor started (period {:?})", self.period);

        loop {
            tokio::select! {
                _ = ticker.tick() => {
                    self.sweep().await;
                }
                _ = shutdown_rx.recv() => {
                    debug!("Liveness monitor stopping");
                    break;
                }
            }
        }
    }

    /// Queue one probe tick for every open connection.
    ///
    /// Connections whose task exited without releasing its entries are
    /// reclaimed first. Returns the number probed.
    pub async fn sweep(&self) -> usize {
        let reclaimed = self.registry.prune_closed().await;
        if reclaimed > 0 {
            warn!("Reclaimed {} stale connections", reclaimed);
        }

        let mut probed = 0;
        for handle in self.registry.snapshot().await {
            match handle.probe() {
                Ok(()) => probed += 1,
                // Closed between snapshot and probe, or backlogged behind a
                // blocked write that its task times out on
                Err(e) => debug!("Skipping probe: {}", e),
            }
        }

        debug!("Liveness sweep probed {} connections", probed);
        probed
    }
}
