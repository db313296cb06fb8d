//! Device LED / locate-indicator control (spec §4.K, §6).
//!
//! Grounded on `bio_led_device_manage`/`led_state` in the original
//! source's `bio_device.c`, reduced to the pieces this crate owns: the
//! action/state enums, a per-device state table, and the periodic sweep
//! that times out a `QUICK_BLINK` identify request back to whatever the
//! blobstore's health implies.

use std::collections::HashMap;
use std::time::{Duration, Instant};

use parking_lot::Mutex;
use uuid::Uuid;

use crate::blobstore::BsState;
use crate::error::{Error, Result};

/// Requested LED operation (spec §6).
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LedAction {
    /// Report the current LED state.
    Get,
    /// Set the LED to an explicit state, optionally for a duration.
    Set,
    /// Reset the LED to whatever the device's current health implies.
    Reset,
}

/// LED visual states (spec §4.K).
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LedState {
    /// LED off.
    Off,
    /// Fast blink: identify request in progress.
    QuickBlink,
    /// Steady on: device faulty.
    On,
    /// Slow blink: device rebuilding/reintegrating.
    SlowBlink,
    /// State unknown or unsupported by the device.
    Na,
}

impl LedState {
    fn from_health(state: BsState) -> Self {
        match state {
            BsState::Normal => LedState::Off,
            BsState::Faulty | BsState::Teardown | BsState::Out => LedState::On,
            BsState::Setup => LedState::SlowBlink,
        }
    }
}

struct Entry {
    state: LedState,
    expires_at: Option<Instant>,
}

/// Tracks LED state per device and resolves timed `QUICK_BLINK` identify
/// requests back to the device's health-derived state (spec §4.K).
#[derive(Default)]
pub struct LedController {
    entries: Mutex<HashMap<Uuid, Entry>>,
}

impl LedController {
    /// Creates an empty controller.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Applies `action` to `device`'s LED. `set_state`/`duration` are only
    /// consulted for [`LedAction::Set`]; `health` supplies the fallback
    /// state for [`LedAction::Reset`] and for any device never explicitly
    /// set.
    pub fn manage(
        &self,
        device: Uuid,
        action: LedAction,
        set_state: Option<LedState>,
        duration: Option<Duration>,
        health: BsState,
    ) -> Result<LedState> {
        let mut guard = self.entries.lock();
        match action {
            LedAction::Get => Ok(guard
                .get(&device)
                .map_or_else(|| LedState::from_health(health), |e| e.state)),
            LedAction::Set => {
                let state = set_state.ok_or_else(|| Error::Inval("SET requires a state".into()))?;
                let expires_at = duration.map(|d| Instant::now() + d);
                guard.insert(device, Entry { state, expires_at });
                Ok(state)
            }
            LedAction::Reset => {
                let state = LedState::from_health(health);
                guard.insert(
                    device,
                    Entry {
                        state,
                        expires_at: None,
                    },
                );
                Ok(state)
            }
        }
    }

    /// Resolves any device whose timed `QUICK_BLINK` request has expired
    /// back to its health-derived state. Called periodically alongside
    /// the blobstore health poller.
    pub fn sweep_expired(&self, health_of: impl Fn(Uuid) -> BsState) {
        let now = Instant::now();
        let mut guard = self.entries.lock();
        for (device, entry) in guard.iter_mut() {
            if entry.expires_at.is_some_and(|exp| now >= exp) {
                entry.state = LedState::from_health(health_of(*device));
                entry.expires_at = None;
            }
        }
    }
}

#[cfg(test)]
mod led_tests {
    use super::*;

    #[test]
    fn set_then_get_round_trips() {
        let ctrl = LedController::new();
        let dev = Uuid::new_v4();
        ctrl.manage(dev, LedAction::Set, Some(LedState::QuickBlink), None, BsState::Normal)
            .unwrap();
        let state = ctrl.manage(dev, LedAction::Get, None, None, BsState::Normal).unwrap();
        assert_eq!(state, LedState::QuickBlink);
    }

    #[test]
    fn reset_follows_health() {
        let ctrl = LedController::new();
        let dev = Uuid::new_v4();
        ctrl.manage(dev, LedAction::Set, Some(LedState::QuickBlink), None, BsState::Normal)
            .unwrap();
        let state = ctrl.manage(dev, LedAction::Reset, None, None, BsState::Faulty).unwrap();
        assert_eq!(state, LedState::On);
    }

    #[test]
    fn sweep_clears_expired_quick_blink() {
        let ctrl = LedController::new();
        let dev = Uuid::new_v4();
        ctrl.manage(
            dev,
            LedAction::Set,
            Some(LedState::QuickBlink),
            Some(Duration::from_millis(0)),
            BsState::Normal,
        )
        .unwrap();
        std::thread::sleep(Duration::from_millis(5));
        ctrl.sweep_expired(|_| BsState::Normal);
        let state = ctrl.manage(dev, LedAction::Get, None, None, BsState::Normal).unwrap();
        assert_eq!(state, LedState::Off);
    }

    #[test]
    fn get_on_unknown_device_falls_back_to_health() {
        let ctrl = LedController::new();
        let state = ctrl
            .manage(Uuid::new_v4(), LedAction::Get, None, None, BsState::Faulty)
            .unwrap();
        assert_eq!(state, LedState::On);
    }
}
