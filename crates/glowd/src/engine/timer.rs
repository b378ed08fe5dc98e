//! Auto-off countdown engine.
//!
//! Maintains, per target entity, a countdown that is correct across process
//! restarts, idempotent with respect to duplicate arm calls, and resilient
//! to the target being controlled by other agents.
//!
//! The expiration instant is persisted as `timer_expiration_<entity>`
//! (stringified epoch milliseconds). The activation reference is the target
//! entity's own last-transition time, so a restart reconstructs the same
//! expiration without a separate start record; wall-clock-now is a fallback
//! only when the gateway cannot provide that timestamp.

use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use tokio::task::JoinHandle;
use tokio::time::MissedTickBehavior;
use tracing::{debug, info, warn};

use super::message::{EngineMessage, EngineSender, ServiceCall};
use super::state::EntityState;
use crate::config::CardConfig;
use crate::store::Store;

fn expiration_key(entity_id: &str) -> String {
    format!("timer_expiration_{}", entity_id)
}

/// Remaining whole seconds until `expiration_ms`, clamped to >= 0.
fn remaining_secs(expiration_ms: i64, now_ms: i64) -> u64 {
    let delta = expiration_ms - now_ms;
    if delta <= 0 {
        0
    } else {
        ((delta + 999) / 1000) as u64
    }
}

pub struct TimerEngine {
    store: Arc<dyn Store>,

    /// Sender for tick wakeups back into the engine loop
    wakeups: EngineSender,

    /// One ticker task per armed target entity. Assign-and-replace keeps the
    /// "at most one live countdown per target" invariant structural.
    tickers: HashMap<String, JoinHandle<()>>,

    /// Last computed remaining seconds, for display
    remaining: HashMap<String, u64>,
}

impl TimerEngine {
    pub fn new(store: Arc<dyn Store>, wakeups: EngineSender) -> Self {
        Self {
            store,
            wakeups,
            tickers: HashMap::new(),
            remaining: HashMap::new(),
        }
    }

    /// Whether a countdown is currently live for this target.
    pub fn is_armed(&self, entity_id: &str) -> bool {
        self.tickers.contains_key(entity_id)
    }

    /// Remaining seconds of the live countdown, for display.
    pub fn remaining(&self, entity_id: &str) -> Option<u64> {
        self.remaining.get(entity_id).copied()
    }

    /// (Re)start the countdown for a card's target.
    ///
    /// No-ops when the timer automation is disabled or the target is not
    /// currently active; arming a timer for an inactive target would issue a
    /// nonsensical future turn-off.
    pub fn arm(&mut self, card: &CardConfig, target: Option<&EntityState>, now_ms: i64) {
        if !card.timer_enabled {
            return;
        }
        let Some(target) = target else {
            debug!("not arming timer for {}: target state unknown", card.entity);
            return;
        };
        if !target.is_active() {
            debug!("not arming timer for {}: target is inactive", card.entity);
            return;
        }

        let activation_ms = target.last_changed_ms.unwrap_or(now_ms);
        let expiration_ms = activation_ms + card.timer_duration as i64 * 1000;

        if let Err(e) = self
            .store
            .set(&expiration_key(&card.entity), &expiration_ms.to_string())
        {
            warn!(
                "failed to persist timer for {}, countdown will not survive a restart: {}",
                card.entity, e
            );
        }

        self.remaining
            .insert(card.entity.clone(), remaining_secs(expiration_ms, now_ms));

        let handle = self.spawn_ticker(card.entity.clone());
        if let Some(previous) = self.tickers.insert(card.entity.clone(), handle) {
            previous.abort();
        }

        info!(
            "armed {}s countdown for {} (expires at {})",
            card.timer_duration, card.entity, expiration_ms
        );
    }

    /// Recompute remaining seconds from persisted or observed state.
    ///
    /// Reads the persisted expiration; when it is absent (storage cleared,
    /// or never written) the expiration is re-derived from the target's own
    /// last-transition time plus the configured duration. Returns None when
    /// no countdown can be reconstructed. Safe to call at any time.
    pub fn recompute_remaining(
        &self,
        card: &CardConfig,
        target: Option<&EntityState>,
        now_ms: i64,
    ) -> Option<u64> {
        let persisted = match self.store.get(&expiration_key(&card.entity)) {
            Ok(value) => value.and_then(|raw| match raw.trim().parse::<i64>() {
                Ok(ms) => Some(ms),
                Err(_) => {
                    warn!("ignoring malformed timer record for {}: {:?}", card.entity, raw);
                    None
                }
            }),
            Err(e) => {
                warn!("failed to read timer record for {}: {}", card.entity, e);
                None
            }
        };

        let expiration_ms = persisted.or_else(|| {
            let target = target?;
            if !target.is_active() {
                return None;
            }
            let activation_ms = target.last_changed_ms?;
            Some(activation_ms + card.timer_duration as i64 * 1000)
        })?;

        Some(remaining_secs(expiration_ms, now_ms))
    }

    /// One-second tick for a live countdown.
    ///
    /// Returns the expiry turn-off call when the countdown reached zero and
    /// the target was still observed active. Ticks for targets without a
    /// live countdown are ignored, so a stale record can never fire a
    /// spurious turn-off.
    pub fn tick(
        &mut self,
        card: &CardConfig,
        target: Option<&EntityState>,
        now_ms: i64,
    ) -> Option<ServiceCall> {
        if !self.is_armed(&card.entity) {
            return None;
        }

        let Some(target) = target else {
            // Target disappeared mid-countdown.
            debug!("target {} vanished, cancelling countdown", card.entity);
            self.cancel(&card.entity);
            return None;
        };

        match self.recompute_remaining(card, Some(target), now_ms) {
            None => {
                self.cancel(&card.entity);
                None
            }
            Some(0) => {
                info!("countdown expired for {}", card.entity);
                let call = target.is_active().then(|| ServiceCall::turn_off(&card.entity));

                if let Err(e) = self.store.remove(&expiration_key(&card.entity)) {
                    warn!("failed to clear timer record for {}: {}", card.entity, e);
                }
                if let Some(handle) = self.tickers.remove(&card.entity) {
                    handle.abort();
                }
                self.remaining.remove(&card.entity);

                call
            }
            Some(secs) => {
                self.remaining.insert(card.entity.clone(), secs);
                None
            }
        }
    }

    /// Stop the countdown and delete the persisted record. Issues no
    /// service call. Used when the target turns off through any path or the
    /// automation is disabled.
    pub fn cancel(&mut self, entity_id: &str) {
        if let Some(handle) = self.tickers.remove(entity_id) {
            handle.abort();
            debug!("cancelled countdown for {}", entity_id);
        }
        self.remaining.remove(entity_id);
        if let Err(e) = self.store.remove(&expiration_key(entity_id)) {
            warn!("failed to clear timer record for {}: {}", entity_id, e);
        }
    }

    /// React to a state change of a card's target entity.
    ///
    /// inactive -> active arms (from the new state's transition time),
    /// active -> inactive cancels, active -> active refreshes the display
    /// only. With the automation disabled any existing countdown is
    /// cancelled.
    pub fn on_target_state_changed(
        &mut self,
        card: &CardConfig,
        previous: Option<&EntityState>,
        new: Option<&EntityState>,
        now_ms: i64,
    ) {
        if !card.timer_enabled {
            if self.is_armed(&card.entity) {
                self.cancel(&card.entity);
            }
            return;
        }

        let was_active = previous.map(EntityState::is_active).unwrap_or(false);
        let is_active = new.map(EntityState::is_active).unwrap_or(false);

        match (was_active, is_active) {
            (false, true) => self.arm(card, new, now_ms),
            (true, false) => self.cancel(&card.entity),
            (true, true) => {
                // Attribute-only change: no re-arm.
                if let Some(secs) = self.recompute_remaining(card, new, now_ms) {
                    self.remaining.insert(card.entity.clone(), secs);
                }
            }
            (false, false) => {}
        }
    }

    /// Abort every ticker without touching persisted records, so countdowns
    /// can be reconstructed after a restart.
    pub fn shutdown(&mut self) {
        for (_, handle) in self.tickers.drain() {
            handle.abort();
        }
        self.remaining.clear();
    }

    fn spawn_ticker(&self, entity_id: String) -> JoinHandle<()> {
        let wakeups = self.wakeups.clone();
        tokio::spawn(async move {
            let mut interval = tokio::time::interval(Duration::from_secs(1));
            interval.set_missed_tick_behavior(MissedTickBehavior::Delay);
            // The first tick completes immediately; skip it so ticks land at
            // one-second marks after arming.
            interval.tick().await;
            loop {
                interval.tick().await;
                let tick = EngineMessage::TimerTick {
                    entity_id: entity_id.clone(),
                };
                if wakeups.send(tick).is_err() {
                    break;
                }
            }
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::engine::message::{EngineReceiver, Service};
    use crate::store::MemoryStore;
    use tokio::sync::mpsc;

    fn card(entity: &str, duration: u64) -> CardConfig {
        CardConfig {
            entity: entity.to_string(),
            name: None,
            timer_enabled: true,
            timer_duration: duration,
            motion_enabled: false,
            motion_sensor: None,
            motion_off_delay: 60,
            default_brightness: None,
        }
    }

    fn active_since(ms: i64) -> EntityState {
        EntityState {
            state: "on".to_string(),
            attributes: serde_json::Map::new(),
            last_changed_ms: Some(ms),
        }
    }

    fn inactive() -> EntityState {
        EntityState {
            state: "off".to_string(),
            attributes: serde_json::Map::new(),
            last_changed_ms: Some(0),
        }
    }

    fn timer_engine() -> (TimerEngine, Arc<MemoryStore>, EngineReceiver) {
        let store = Arc::new(MemoryStore::new());
        let (tx, rx) = mpsc::unbounded_channel();
        (TimerEngine::new(store.clone(), tx), store, rx)
    }

    #[tokio::test]
    async fn test_arm_then_recompute_counts_down() {
        let (mut timer, _store, _rx) = timer_engine();
        let card = card("light.a", 300);
        let target = active_since(1_000_000);

        timer.arm(&card, Some(&target), 1_000_000);
        assert!(timer.is_armed("light.a"));
        assert_eq!(timer.remaining("light.a"), Some(300));

        // k seconds in: remaining is d - k.
        for k in [1_i64, 10, 299] {
            let secs = timer
                .recompute_remaining(&card, Some(&target), 1_000_000 + k * 1000)
                .unwrap();
            assert_eq!(secs, (300 - k) as u64);
        }

        // At and past expiry: clamped to zero.
        assert_eq!(
            timer.recompute_remaining(&card, Some(&target), 1_000_000 + 300_000),
            Some(0)
        );
        assert_eq!(
            timer.recompute_remaining(&card, Some(&target), 1_000_000 + 400_000),
            Some(0)
        );
    }

    #[tokio::test]
    async fn test_arm_rejects_inactive_target() {
        let (mut timer, store, _rx) = timer_engine();
        let card = card("light.a", 300);

        timer.arm(&card, Some(&inactive()), 1_000_000);
        assert!(!timer.is_armed("light.a"));
        assert_eq!(store.get("timer_expiration_light.a").unwrap(), None);

        timer.arm(&card, None, 1_000_000);
        assert!(!timer.is_armed("light.a"));
    }

    #[tokio::test]
    async fn test_arm_disabled_is_noop() {
        let (mut timer, _store, _rx) = timer_engine();
        let mut card = card("light.a", 300);
        card.timer_enabled = false;

        timer.arm(&card, Some(&active_since(0)), 0);
        assert!(!timer.is_armed("light.a"));
    }

    #[tokio::test]
    async fn test_double_arm_replaces_ticker_and_fires_once() {
        let (mut timer, _store, _rx) = timer_engine();
        let card = card("light.a", 5);
        let target = active_since(0);

        timer.arm(&card, Some(&target), 0);
        timer.arm(&card, Some(&target), 0);
        assert_eq!(timer.tickers.len(), 1);

        let mut calls = Vec::new();
        for k in 1..=10_i64 {
            if let Some(call) = timer.tick(&card, Some(&target), k * 1000) {
                calls.push(call);
            }
        }
        assert_eq!(calls.len(), 1);
        assert_eq!(calls[0].service, Service::TurnOff);
        assert_eq!(calls[0].entity_id, "light.a");
    }

    #[tokio::test]
    async fn test_expiry_exactly_once() {
        let (mut timer, store, _rx) = timer_engine();
        let card = card("light.a", 300);
        let target = active_since(0);

        timer.arm(&card, Some(&target), 0);

        let mut calls = 0;
        for k in 1..=310_i64 {
            if timer.tick(&card, Some(&target), k * 1000).is_some() {
                calls += 1;
            }
        }
        assert_eq!(calls, 1);
        assert_eq!(store.get("timer_expiration_light.a").unwrap(), None);
        assert!(!timer.is_armed("light.a"));
    }

    #[tokio::test]
    async fn test_five_second_scenario() {
        let (mut timer, store, _rx) = timer_engine();
        let card = card("light.a", 5);
        let target = active_since(0);

        timer.arm(&card, Some(&target), 0);
        assert_eq!(timer.remaining("light.a"), Some(5));

        let mut observed = Vec::new();
        let mut calls = Vec::new();
        for k in 1..=5_i64 {
            if let Some(call) = timer.tick(&card, Some(&target), k * 1000) {
                calls.push(call);
            }
            observed.push(timer.remaining("light.a"));
        }

        assert_eq!(
            observed,
            vec![Some(4), Some(3), Some(2), Some(1), None]
        );
        assert_eq!(calls, vec![ServiceCall::turn_off("light.a")]);
        assert_eq!(store.get("timer_expiration_light.a").unwrap(), None);
    }

    #[test]
    fn test_restart_survival_from_persisted_record() {
        // A fresh engine (nothing armed this process) reconstructs the
        // remaining time from the persisted expiration alone.
        let store = Arc::new(MemoryStore::new());
        store.set("timer_expiration_light.a", "1000000").unwrap();

        let (tx, _rx) = mpsc::unbounded_channel();
        let timer = TimerEngine::new(store, tx);
        let card = card("light.a", 300);

        assert_eq!(timer.recompute_remaining(&card, None, 880_000), Some(120));
        assert_eq!(timer.recompute_remaining(&card, None, 1_000_000), Some(0));
    }

    #[test]
    fn test_recompute_falls_back_to_activation_time() {
        // Storage cleared, but the target is still on: derive the
        // expiration from its own transition time.
        let store = Arc::new(MemoryStore::new());
        let (tx, _rx) = mpsc::unbounded_channel();
        let timer = TimerEngine::new(store, tx);
        let card = card("light.a", 300);
        let target = active_since(500_000);

        assert_eq!(
            timer.recompute_remaining(&card, Some(&target), 560_000),
            Some(240)
        );

        // Inactive target, no record: no countdown to reconstruct.
        assert_eq!(timer.recompute_remaining(&card, Some(&inactive()), 560_000), None);
        assert_eq!(timer.recompute_remaining(&card, None, 560_000), None);
    }

    #[tokio::test]
    async fn test_external_turn_off_cancels() {
        let (mut timer, store, _rx) = timer_engine();
        let card = card("light.a", 300);
        let on = active_since(0);

        timer.arm(&card, Some(&on), 0);
        assert!(timer.is_armed("light.a"));

        // Someone else turned the light off at t=180 (remaining 120).
        let off = EntityState {
            state: "off".to_string(),
            attributes: serde_json::Map::new(),
            last_changed_ms: Some(180_000),
        };
        timer.on_target_state_changed(&card, Some(&on), Some(&off), 180_000);

        assert!(!timer.is_armed("light.a"));
        assert_eq!(store.get("timer_expiration_light.a").unwrap(), None);

        // No late turn-off fires afterwards.
        assert_eq!(timer.tick(&card, Some(&off), 300_000), None);
        assert_eq!(timer.tick(&card, Some(&off), 301_000), None);
    }

    #[tokio::test]
    async fn test_activation_arms_from_transition_time() {
        let (mut timer, store, _rx) = timer_engine();
        let card = card("light.a", 300);
        let on = active_since(100_000);

        // Event is processed slightly after the transition itself.
        timer.on_target_state_changed(&card, Some(&inactive()), Some(&on), 102_000);
        assert!(timer.is_armed("light.a"));
        assert_eq!(
            store.get("timer_expiration_light.a").unwrap(),
            Some("400000".to_string())
        );
    }

    #[tokio::test]
    async fn test_attribute_only_change_does_not_rearm() {
        let (mut timer, _store, _rx) = timer_engine();
        let card = card("light.a", 300);
        let on = active_since(0);

        timer.arm(&card, Some(&on), 0);

        // Brightness change at t=60 while still on: remaining keeps
        // counting from the original activation.
        let mut dimmed = active_since(0);
        dimmed
            .attributes
            .insert("brightness".to_string(), serde_json::json!(64));
        timer.on_target_state_changed(&card, Some(&on), Some(&dimmed), 60_000);

        assert_eq!(timer.remaining("light.a"), Some(240));
    }

    #[tokio::test]
    async fn test_disabling_automation_cancels() {
        let (mut timer, store, _rx) = timer_engine();
        let mut cfg = card("light.a", 300);
        let on = active_since(0);

        timer.arm(&cfg, Some(&on), 0);
        assert!(timer.is_armed("light.a"));

        cfg.timer_enabled = false;
        timer.on_target_state_changed(&cfg, Some(&on), Some(&on), 10_000);

        assert!(!timer.is_armed("light.a"));
        assert_eq!(store.get("timer_expiration_light.a").unwrap(), None);
    }

    #[tokio::test]
    async fn test_expiry_skips_call_when_target_already_off() {
        let (mut timer, store, _rx) = timer_engine();
        let card = card("light.a", 5);
        let on = active_since(0);

        timer.arm(&card, Some(&on), 0);

        // The target is off by expiry but no state event reached us.
        let off = inactive();
        let call = timer.tick(&card, Some(&off), 6_000);
        assert_eq!(call, None);
        assert!(!timer.is_armed("light.a"));
        assert_eq!(store.get("timer_expiration_light.a").unwrap(), None);
    }

    #[tokio::test]
    async fn test_missing_target_at_tick_cancels() {
        let (mut timer, _store, _rx) = timer_engine();
        let card = card("light.a", 300);

        timer.arm(&card, Some(&active_since(0)), 0);
        assert!(timer.is_armed("light.a"));

        assert_eq!(timer.tick(&card, None, 1000), None);
        assert!(!timer.is_armed("light.a"));
    }

    #[tokio::test]
    async fn test_shutdown_keeps_persisted_records() {
        let (mut timer, store, _rx) = timer_engine();
        let card = card("light.a", 300);

        timer.arm(&card, Some(&active_since(0)), 0);
        timer.shutdown();

        assert!(!timer.is_armed("light.a"));
        assert!(store.get("timer_expiration_light.a").unwrap().is_some());
    }
}
