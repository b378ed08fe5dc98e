//! Motion-sensor automation.
//!
//! Translates a binary sensor's activity into on/off calls for a card's
//! target entity. Motion-active turns the target on immediately; motion
//! cleared schedules a delayed check which re-reads the sensor's *current*
//! state before turning off, so sensor flicker inside the off-delay never
//! drops the light.

use std::collections::HashMap;
use std::time::Duration;

use tokio::task::JoinHandle;
use tracing::{debug, info};

use super::card::CardRuntime;
use super::message::{EngineMessage, EngineSender, ServiceCall};
use super::state::{percent_to_brightness, EntityState};

pub struct MotionController {
    /// Sender for delayed-check wakeups back into the engine loop
    wakeups: EngineSender,

    /// At most one pending delayed turn-off per card, keyed by card name.
    /// Replaced outright on re-schedule; the freshness re-read in
    /// `on_off_delay_elapsed` is the correctness guard.
    pending: HashMap<String, JoinHandle<()>>,
}

impl MotionController {
    pub fn new(wakeups: EngineSender) -> Self {
        Self {
            wakeups,
            pending: HashMap::new(),
        }
    }

    /// React to a state change of a card's motion sensor.
    ///
    /// Returns the service call to issue, if any. Every active observation
    /// produces a turn-on (the caller re-arms the countdown); an inactive
    /// observation schedules the delayed off-check and produces nothing yet.
    pub fn on_sensor_state_changed(
        &mut self,
        card: &CardRuntime,
        sensor: Option<&EntityState>,
        target: Option<&EntityState>,
    ) -> Option<ServiceCall> {
        if !card.config.motion_enabled {
            return None;
        }
        let sensor = sensor?;

        if sensor.is_active() {
            info!("motion active on card '{}', turning on {}", card.name, card.config.entity);
            let mut call = ServiceCall::turn_on(&card.config.entity);
            if let (Some(percent), Some(target)) = (card.config.default_brightness, target) {
                if target.supports_brightness() {
                    call = call.with_brightness(percent_to_brightness(percent));
                }
            }
            Some(call)
        } else {
            self.schedule_off_check(card);
            None
        }
    }

    /// The off-delay for a card ran out.
    ///
    /// Re-reads the sensor's current state: only a sensor still observed
    /// inactive ("off" or "unavailable") produces a turn-off. Motion that
    /// returned in the interim makes this a no-op.
    pub fn on_off_delay_elapsed(
        &mut self,
        card: &CardRuntime,
        sensor: Option<&EntityState>,
    ) -> Option<ServiceCall> {
        self.pending.remove(&card.name);

        let sensor = sensor?;
        if !matches!(sensor.state.as_str(), "off" | "unavailable") {
            debug!("motion returned on card '{}', keeping {} on", card.name, card.config.entity);
            return None;
        }

        info!(
            "no motion on card '{}' for {}s, turning off {}",
            card.name, card.config.motion_off_delay, card.config.entity
        );
        Some(ServiceCall::turn_off(&card.config.entity))
    }

    /// Whether a delayed turn-off is pending for this card.
    pub fn is_pending(&self, card_name: &str) -> bool {
        self.pending.contains_key(card_name)
    }

    /// Drop the pending delayed check, if any. Used when the motion
    /// automation is reconfigured away.
    pub fn cancel(&mut self, card_name: &str) {
        if let Some(handle) = self.pending.remove(card_name) {
            handle.abort();
        }
    }

    /// Abort every pending delayed check.
    pub fn shutdown(&mut self) {
        for (_, handle) in self.pending.drain() {
            handle.abort();
        }
    }

    fn schedule_off_check(&mut self, card: &CardRuntime) {
        let wakeups = self.wakeups.clone();
        let name = card.name.clone();
        let delay = Duration::from_secs(card.config.motion_off_delay);

        debug!(
            "motion cleared on card '{}', checking again in {}s",
            card.name, card.config.motion_off_delay
        );

        let handle = tokio::spawn(async move {
            tokio::time::sleep(delay).await;
            let _ = wakeups.send(EngineMessage::MotionDelayElapsed { card: name });
        });
        if let Some(previous) = self.pending.insert(card.name.clone(), handle) {
            previous.abort();
        }
    }
}
