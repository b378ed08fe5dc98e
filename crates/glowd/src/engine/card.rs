//! Card runtime state: effective configuration and display snapshots.
//!
//! Each card starts from its static `[cards.<name>]` file configuration,
//! overridden by the per-entity settings overlay persisted in the store
//! under `card_settings_<entity>`. The overlay is owned exclusively by this
//! layer; the timer and motion components never touch it.

use std::collections::HashMap;

use serde::{Deserialize, Serialize};
use tracing::warn;

use super::state::{brightness_to_percent, EntityState};
use crate::config::CardConfig;
use crate::store::{Store, StoreError};

pub fn settings_key(entity_id: &str) -> String {
    format!("card_settings_{}", entity_id)
}

/// User-adjustable settings overlay, every field optional.
///
/// Mirrors the adjustable subset of [`CardConfig`]; a field left as `None`
/// keeps the current value.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct CardSettings {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub name: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub entity: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub timer_enabled: Option<bool>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub timer_duration: Option<u64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub motion_enabled: Option<bool>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub motion_sensor: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub motion_off_delay: Option<u64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub default_brightness: Option<u8>,
}

/// A configured card with its effective (file + overlay) configuration.
#[derive(Debug, Clone)]
pub struct CardRuntime {
    pub name: String,
    pub config: CardConfig,
}

impl CardRuntime {
    /// Build a card from its file configuration, applying any persisted
    /// settings overlay. Store failures only cost the overlay.
    pub fn load(name: String, config: CardConfig, store: &dyn Store) -> Self {
        let mut card = Self { name, config };

        match store.get(&settings_key(&card.config.entity)) {
            Ok(Some(raw)) => match serde_json::from_str::<CardSettings>(&raw) {
                Ok(settings) => card.apply_settings(&settings),
                Err(e) => warn!("card '{}': ignoring corrupt saved settings: {}", card.name, e),
            },
            Ok(None) => {}
            Err(e) => warn!("card '{}': failed to load saved settings: {}", card.name, e),
        }

        card
    }

    /// Apply a settings overlay to the effective configuration.
    pub fn apply_settings(&mut self, settings: &CardSettings) {
        if let Some(name) = &settings.name {
            self.config.name = Some(name.clone());
        }
        if let Some(entity) = &settings.entity {
            if !entity.is_empty() {
                self.config.entity = entity.clone();
            }
        }
        if let Some(enabled) = settings.timer_enabled {
            self.config.timer_enabled = enabled;
        }
        if let Some(duration) = settings.timer_duration {
            self.config.timer_duration = duration;
        }
        if let Some(enabled) = settings.motion_enabled {
            self.config.motion_enabled = enabled;
        }
        if let Some(sensor) = &settings.motion_sensor {
            self.config.motion_sensor = Some(sensor.clone());
        }
        if let Some(delay) = settings.motion_off_delay {
            self.config.motion_off_delay = delay;
        }
        if let Some(percent) = settings.default_brightness {
            self.config.default_brightness = Some(percent.min(100));
        }
    }

    /// Full snapshot of the adjustable settings, as persisted.
    pub fn settings(&self) -> CardSettings {
        CardSettings {
            name: self.config.name.clone(),
            entity: Some(self.config.entity.clone()),
            timer_enabled: Some(self.config.timer_enabled),
            timer_duration: Some(self.config.timer_duration),
            motion_enabled: Some(self.config.motion_enabled),
            motion_sensor: self.config.motion_sensor.clone(),
            motion_off_delay: Some(self.config.motion_off_delay),
            default_brightness: self.config.default_brightness,
        }
    }

    /// Persist the current settings overlay, keyed by the card's entity.
    pub fn save_settings(&self, store: &dyn Store) -> Result<(), StoreError> {
        let encoded = serde_json::to_string(&self.settings())?;
        store.set(&settings_key(&self.config.entity), &encoded)
    }

    /// Build the display snapshot for this card.
    pub fn view(
        &self,
        entities: &HashMap<String, EntityState>,
        remaining_seconds: Option<u64>,
    ) -> CardView {
        let target = entities.get(&self.config.entity);
        let state = target
            .map(|t| t.state.clone())
            .unwrap_or_else(|| "unavailable".to_string());
        let on = target.map(EntityState::is_active).unwrap_or(false);
        let brightness_percent = target
            .and_then(EntityState::brightness)
            .map(brightness_to_percent);

        let motion_active = if self.config.motion_enabled {
            let sensor = self
                .config
                .motion_sensor
                .as_ref()
                .and_then(|id| entities.get(id));
            Some(sensor.map(EntityState::is_active).unwrap_or(false))
        } else {
            None
        };

        CardView {
            name: self.name.clone(),
            title: self
                .config
                .name
                .clone()
                .unwrap_or_else(|| self.config.entity.clone()),
            entity: self.config.entity.clone(),
            state,
            on,
            brightness_percent,
            remaining_seconds,
            countdown: remaining_seconds
                .filter(|secs| *secs > 0)
                .map(format_countdown),
            motion_active,
        }
    }
}

/// Display snapshot of one card, published for the status API.
#[derive(Debug, Clone, Serialize)]
pub struct CardView {
    pub name: String,
    pub title: String,
    pub entity: String,
    pub state: String,
    pub on: bool,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub brightness_percent: Option<u8>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub remaining_seconds: Option<u64>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub countdown: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub motion_active: Option<bool>,
}

/// Display snapshot of every card.
#[derive(Debug, Clone, Default, Serialize)]
pub struct View {
    pub cards: Vec<CardView>,
}

/// Format a countdown as `M:SS`, minutes unbounded.
pub fn format_countdown(seconds: u64) -> String {
    format!("{}:{:02}", seconds / 60, seconds % 60)
}
