//! Message types for the engine event loop.
//!
//! Messages are split by direction to enforce correct usage at compile time:
//! - `FromGatewayMessage`: entity events from gateways to the engine
//! - `ToGatewayMessage`: service calls from the engine to gateways
//! - `EngineMessage`: internal wakeups (timer ticks, motion delays) and
//!   operations submitted through the API

use serde::Serialize;

use super::card::CardSettings;
use super::state::EntityState;

/// Messages FROM gateways TO the engine
#[derive(Debug, Clone)]
pub enum FromGatewayMessage {
    /// First sighting of an entity; records which gateway owns it for
    /// service-call routing
    EntityObserved {
        entity_id: String,
        gateway: String,
    },

    /// An entity's state or attributes changed
    StateChanged {
        entity_id: String,
        state: EntityState,
    },

    /// An entity disappeared from the gateway
    EntityRemoved { entity_id: String },
}

/// Messages FROM the engine TO gateways
#[derive(Debug, Clone)]
pub enum ToGatewayMessage {
    CallService(ServiceCall),
}

/// Internal engine messages: scheduled wakeups and API operations.
#[derive(Debug)]
pub enum EngineMessage {
    /// One-second countdown tick for an armed target entity
    TimerTick { entity_id: String },

    /// A motion off-delay ran out for a card
    MotionDelayElapsed { card: String },

    /// Manual toggle of a card's target (API)
    Toggle { card: String },

    /// Manual brightness set, percent 0-100 (API)
    SetBrightness { card: String, percent: u8 },

    /// Update and persist a card's settings overlay (API)
    UpdateSettings {
        card: String,
        settings: CardSettings,
    },
}

/// Sender for internal engine messages; cloned into ticker and delay tasks
/// (unbounded - wakeups must not block)
pub type EngineSender = tokio::sync::mpsc::UnboundedSender<EngineMessage>;
pub type EngineReceiver = tokio::sync::mpsc::UnboundedReceiver<EngineMessage>;

/// Service invoked on a target entity.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, strum::Display, strum::EnumString)]
#[serde(rename_all = "snake_case")]
#[strum(serialize_all = "snake_case")]
pub enum Service {
    TurnOn,
    TurnOff,
}

/// A "turn_on"/"turn_off" request for a target entity.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct ServiceCall {
    pub entity_id: String,
    pub service: Service,

    /// Native brightness (0-255), only meaningful with `TurnOn`
    #[serde(skip_serializing_if = "Option::is_none")]
    pub brightness: Option<u8>,
}

impl ServiceCall {
    pub fn turn_on(entity_id: impl Into<String>) -> Self {
        Self {
            entity_id: entity_id.into(),
            service: Service::TurnOn,
            brightness: None,
        }
    }

    pub fn turn_off(entity_id: impl Into<String>) -> Self {
        Self {
            entity_id: entity_id.into(),
            service: Service::TurnOff,
            brightness: None,
        }
    }

    pub fn with_brightness(mut self, brightness: u8) -> Self {
        self.brightness = Some(brightness);
        self
    }

    /// Service domain, derived by splitting the entity id at the first `.`
    pub fn domain(&self) -> &str {
        self.entity_id
            .split_once('.')
            .map(|(domain, _)| domain)
            .unwrap_or(&self.entity_id)
    }
}
