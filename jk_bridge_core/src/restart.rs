//! Suspends event notifications while the server restarts or changes map.
//!
//! Each suspension gets a new epoch. The timeout and settle messages carry the
//! epoch they were scheduled for, so whichever arrives second (or arrives for
//! an older suspension) finds nothing to do.

use std::time::Duration;

use event_loop::Message;

use crate::state::BridgeState;

pub const RESTART_TIMEOUT: Duration = Duration::from_secs(30);
pub const SETTLE_DELAY: Duration = Duration::from_secs(10);

pub const SUSPENDED_NOTICE: &str =
    "Standby: Server integration suspended while map changes or server restarts.";
pub const TIMED_OUT_NOTICE: &str =
    "Server Integration Resumed: Restart timed out, resuming normal operation.";

#[must_use]
pub fn resumed_notice(map: &str) -> String {
    format!("Server Integration Resumed: Map {map} loaded.")
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum RestartPhase {
    Normal,
    Suspended { target_map: Option<String> },
}

#[derive(Debug, Clone)]
pub struct RestartState {
    phase: RestartPhase,
    epoch: u64,
}

impl Default for RestartState {
    fn default() -> Self {
        Self::new()
    }
}

impl RestartState {
    #[must_use]
    pub const fn new() -> Self {
        Self {
            phase: RestartPhase::Normal,
            epoch: 0,
        }
    }

    #[must_use]
    pub const fn phase(&self) -> &RestartPhase {
        &self.phase
    }

    #[must_use]
    pub const fn is_suspended(&self) -> bool {
        matches!(self.phase, RestartPhase::Suspended { .. })
    }

    /// Epoch of the current (or most recent) suspension.
    #[must_use]
    pub const fn epoch(&self) -> u64 {
        self.epoch
    }

    /// Epoch the next suspension will get.
    #[must_use]
    pub const fn next_epoch(&self) -> u64 {
        self.epoch + 1
    }

    #[must_use]
    pub fn target_map(&self) -> Option<&str> {
        match &self.phase {
            RestartPhase::Suspended { target_map, .. } => target_map.as_deref(),
            RestartPhase::Normal => None,
        }
    }

    /// True while suspended and no map has been announced yet.
    #[must_use]
    pub const fn awaiting_map(&self) -> bool {
        matches!(
            self.phase,
            RestartPhase::Suspended { target_map: None }
        )
    }

    /// The map to announce if a settle for `epoch` would resume now.
    #[must_use]
    pub fn settles(&self, epoch: u64) -> Option<&str> {
        if epoch != self.epoch {
            return None;
        }
        self.target_map()
    }

    #[must_use]
    pub const fn times_out(&self, epoch: u64) -> bool {
        epoch == self.epoch && self.is_suspended()
    }

    // **** Transitions ****

    /// Returns the new epoch, or `None` if already suspended. The caller
    /// schedules the matching [`RestartTimedOut`].
    pub fn suspend(&mut self) -> Option<u64> {
        if self.is_suspended() {
            return None;
        }
        self.epoch += 1;
        self.phase = RestartPhase::Suspended { target_map: None };
        tracing::info!("Server restarting, notifications suspended.");
        Some(self.epoch)
    }

    /// Only the first map named during a suspension counts.
    pub fn map_loaded(&mut self, map: &str) -> bool {
        if let RestartPhase::Suspended { target_map, .. } = &mut self.phase {
            if target_map.is_none() {
                *target_map = Some(map.to_owned());
                return true;
            }
        }
        false
    }

    /// Resumes after the settle delay. Returns the loaded map if this call
    /// resumed.
    pub fn settle(&mut self, epoch: u64) -> Option<String> {
        let map = self.settles(epoch)?.to_owned();
        self.phase = RestartPhase::Normal;
        tracing::info!("Map {map} loaded, notifications resumed.");
        Some(map)
    }

    /// Fail-safe resume. Returns whether this call resumed.
    pub fn time_out(&mut self, epoch: u64) -> bool {
        if !self.times_out(epoch) {
            return false;
        }
        self.phase = RestartPhase::Normal;
        tracing::warn!("No map loaded before the restart timeout, notifications resumed.");
        true
    }
}

// Messages *************************

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RestartSettled {
    pub epoch: u64,
}
impl Message<BridgeState> for RestartSettled {
    fn update_state(self, state: &mut BridgeState) {
        state.restart.settle(self.epoch);
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RestartTimedOut {
    pub epoch: u64,
}
impl Message<BridgeState> for RestartTimedOut {
    fn update_state(self, state: &mut BridgeState) {
        state.restart.time_out(self.epoch);
    }
}
