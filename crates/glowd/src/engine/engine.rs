use std::collections::HashMap;
use std::sync::Arc;

use arc_swap::ArcSwap;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};

use super::card::{CardRuntime, View};
use super::message::{
    EngineMessage, EngineReceiver, EngineSender, FromGatewayMessage, ServiceCall,
    ToGatewayMessage,
};
use super::motion::MotionController;
use super::state::{percent_to_brightness, EntityState};
use super::timer::TimerEngine;
use crate::config::Config;
use crate::gateway::{Gateway, GatewayContext, ToGatewaySender};
use crate::store::Store;

/// Capacity for the gateway→engine event channel
/// Provides backpressure when gateways deliver faster than the engine reacts
const FROM_GATEWAY_CHANNEL_SIZE: usize = 1024;

/// Current wall-clock time in epoch milliseconds.
pub(crate) fn now_ms() -> i64 {
    chrono::Utc::now().timestamp_millis()
}

/// glowd engine
///
/// Owns every card's automation state and runs the single event loop:
/// gateway events and scheduled wakeups in, service calls out, and a fresh
/// display snapshot published after each reaction.
pub struct Engine {
    /// Configured cards with their effective settings
    cards: Vec<CardRuntime>,

    /// Last observed state per entity, keyed by entity id
    entities: HashMap<String, EntityState>,

    /// Published display snapshot (readers load, the loop stores)
    view: Arc<ArcSwap<View>>,

    timer: TimerEngine,
    motion: MotionController,

    store: Arc<dyn Store>,

    /// Communication channels to gateways (for service calls)
    gateway_channels: HashMap<String, ToGatewaySender>,

    /// Map of entity_id -> gateway name for routing service calls
    entity_gateway_map: HashMap<String, String>,

    /// Handles for gateway tasks
    gateway_handles: Vec<JoinHandle<()>>,

    /// Receive events from gateways
    events_rx: mpsc::Receiver<FromGatewayMessage>,

    /// Sender handed to gateways at registration
    events_tx: mpsc::Sender<FromGatewayMessage>,

    /// Receive internal wakeups and API operations
    messages_rx: EngineReceiver,

    /// Sender cloned into ticker/delay tasks and the API handle
    messages_tx: EngineSender,
}

/// Cheaply cloneable handle for submitting operations and reading the
/// display snapshot from outside the loop (the HTTP API).
#[derive(Clone)]
pub struct EngineHandle {
    commands: EngineSender,
    view: Arc<ArcSwap<View>>,
}

impl EngineHandle {
    /// Latest display snapshot. Clones the `Arc`, essentially free.
    pub fn view(&self) -> Arc<View> {
        self.view.load_full()
    }

    /// Submit an operation to the engine loop.
    pub fn send(&self, msg: EngineMessage) {
        if self.commands.send(msg).is_err() {
            warn!("engine is gone, dropping operation");
        }
    }
}

impl Engine {
    /// Create a new Engine from configuration, applying each card's
    /// persisted settings overlay.
    pub fn new(config: &Config, store: Arc<dyn Store>) -> Self {
        let (events_tx, events_rx) = mpsc::channel(FROM_GATEWAY_CHANNEL_SIZE);
        let (messages_tx, messages_rx) = mpsc::unbounded_channel();

        let cards = config
            .cards
            .iter()
            .map(|(name, card)| CardRuntime::load(name.clone(), card.clone(), store.as_ref()))
            .collect();

        Self {
            cards,
            entities: HashMap::new(),
            view: Arc::new(ArcSwap::from_pointee(View::default())),
            timer: TimerEngine::new(store.clone(), messages_tx.clone()),
            motion: MotionController::new(messages_tx.clone()),
            store,
            gateway_channels: HashMap::new(),
            entity_gateway_map: HashMap::new(),
            gateway_handles: Vec::new(),
            events_rx,
            events_tx,
            messages_rx,
            messages_tx,
        }
    }

    pub fn handle(&self) -> EngineHandle {
        EngineHandle {
            commands: self.messages_tx.clone(),
            view: self.view.clone(),
        }
    }

    /// Register gateways from configuration
    ///
    /// Checks the config against every registered gateway constructor and
    /// spawns the ones that apply.
    pub fn register_gateways_from_config(&mut self, config: &Config) {
        let ctx = GatewayContext { config };
        for constructor in crate::gateway::REGISTRY {
            let gateway = match constructor(&ctx) {
                Ok(Some(g)) => g,
                Ok(None) => continue,
                Err(e) => {
                    warn!("failed to set up gateway: {}", e);
                    continue;
                }
            };
            let name = gateway.name().to_string();
            self.register_gateway(name, gateway);
        }
    }

    /// Register a gateway with the engine
    ///
    /// Spawns the gateway in a background task, wires up channels, and
    /// starts its setup process.
    pub fn register_gateway(&mut self, name: String, mut gateway: Box<dyn Gateway>) {
        let (to_gateway_tx, mut to_gateway_rx) = mpsc::unbounded_channel();
        let events_tx = self.events_tx.clone();

        self.gateway_channels.insert(name.clone(), to_gateway_tx);

        let handle = tokio::spawn(async move {
            if let Err(e) = gateway.setup(events_tx).await {
                warn!("gateway '{}' setup failed: {}", name, e);
                return;
            }

            while let Some(msg) = to_gateway_rx.recv().await {
                if let Err(e) = gateway.handle_message(msg).await {
                    warn!("gateway '{}' failed to handle command: {}", name, e);
                }
            }

            if let Err(e) = gateway.shutdown().await {
                warn!("gateway '{}' shutdown failed: {}", name, e);
            }
        });

        self.gateway_handles.push(handle);
    }

    /// Run the engine's main event loop.
    pub async fn run(mut self) {
        info!("engine starting with {} card(s)", self.cards.len());

        enum Incoming {
            Gateway(FromGatewayMessage),
            Engine(EngineMessage),
        }

        loop {
            let incoming = tokio::select! {
                msg = self.events_rx.recv() => msg.map(Incoming::Gateway),
                msg = self.messages_rx.recv() => msg.map(Incoming::Engine),
            };

            match incoming {
                Some(Incoming::Gateway(msg)) => self.handle_gateway_message(msg),
                Some(Incoming::Engine(msg)) => self.handle_engine_message(msg),
                None => break,
            }

            self.publish_view();
        }

        info!("engine shutting down");
        self.timer.shutdown();
        self.motion.shutdown();
    }

    fn handle_gateway_message(&mut self, msg: FromGatewayMessage) {
        match msg {
            FromGatewayMessage::EntityObserved { entity_id, gateway } => {
                debug!("entity observed: {} (via '{}')", entity_id, gateway);
                self.entity_gateway_map.insert(entity_id, gateway);
            }
            FromGatewayMessage::StateChanged { entity_id, state } => {
                let now = now_ms();
                let previous = self.entities.insert(entity_id.clone(), state.clone());

                for i in 0..self.cards.len() {
                    if self.cards[i].config.entity == entity_id {
                        self.timer.on_target_state_changed(
                            &self.cards[i].config,
                            previous.as_ref(),
                            Some(&state),
                            now,
                        );
                    }

                    let watches_sensor = self.cards[i].config.motion_enabled
                        && self.cards[i].config.motion_sensor.as_deref()
                            == Some(entity_id.as_str());
                    if watches_sensor {
                        let target = self.entities.get(&self.cards[i].config.entity);
                        if let Some(call) =
                            self.motion
                                .on_sensor_state_changed(&self.cards[i], Some(&state), target)
                        {
                            self.dispatch(call);
                            // Motion-active also (re)arms the countdown. With
                            // the target still off this no-ops and the arm
                            // happens on its own state transition instead.
                            let target = self.entities.get(&self.cards[i].config.entity);
                            self.timer.arm(&self.cards[i].config, target, now);
                        }
                    }
                }
            }
            FromGatewayMessage::EntityRemoved { entity_id } => {
                info!("entity removed: {}", entity_id);
                self.entities.remove(&entity_id);
                self.entity_gateway_map.remove(&entity_id);

                for card in &self.cards {
                    if card.config.entity == entity_id {
                        self.timer.cancel(&entity_id);
                    }
                }
            }
        }
    }

    fn handle_engine_message(&mut self, msg: EngineMessage) {
        match msg {
            EngineMessage::TimerTick { entity_id } => {
                let Some(i) = self
                    .cards
                    .iter()
                    .position(|c| c.config.entity == entity_id)
                else {
                    // Ticker for a target no card controls anymore.
                    self.timer.cancel(&entity_id);
                    return;
                };
                let target = self.entities.get(&entity_id);
                if let Some(call) = self.timer.tick(&self.cards[i].config, target, now_ms()) {
                    self.dispatch(call);
                }
            }
            EngineMessage::MotionDelayElapsed { card } => {
                let Some(i) = self.cards.iter().position(|c| c.name == card) else {
                    return;
                };
                let sensor = self.cards[i]
                    .config
                    .motion_sensor
                    .as_ref()
                    .and_then(|id| self.entities.get(id));
                if let Some(call) = self.motion.on_off_delay_elapsed(&self.cards[i], sensor) {
                    self.dispatch(call);
                }
            }
            EngineMessage::Toggle { card } => {
                let Some(i) = self.cards.iter().position(|c| c.name == card) else {
                    warn!("toggle for unknown card '{}'", card);
                    return;
                };
                let entity = &self.cards[i].config.entity;
                let on = self
                    .entities
                    .get(entity)
                    .map(EntityState::is_active)
                    .unwrap_or(false);
                let call = if on {
                    ServiceCall::turn_off(entity)
                } else {
                    ServiceCall::turn_on(entity)
                };
                self.dispatch(call);
            }
            EngineMessage::SetBrightness { card, percent } => {
                let Some(i) = self.cards.iter().position(|c| c.name == card) else {
                    warn!("brightness for unknown card '{}'", card);
                    return;
                };
                let call = ServiceCall::turn_on(&self.cards[i].config.entity)
                    .with_brightness(percent_to_brightness(percent));
                self.dispatch(call);
            }
            EngineMessage::UpdateSettings { card, settings } => {
                let Some(i) = self.cards.iter().position(|c| c.name == card) else {
                    warn!("settings for unknown card '{}'", card);
                    return;
                };

                let old_entity = self.cards[i].config.entity.clone();
                self.cards[i].apply_settings(&settings);
                let new_entity = self.cards[i].config.entity.clone();

                if new_entity != old_entity {
                    info!(
                        "card '{}' retargeted from {} to {}",
                        card, old_entity, new_entity
                    );
                    // The old target's countdown belongs to the old binding.
                    self.timer.cancel(&old_entity);
                }

                if let Err(e) = self.cards[i].save_settings(self.store.as_ref()) {
                    warn!("card '{}': failed to persist settings: {}", card, e);
                }

                // Re-evaluate the automations under the new settings.
                let now = now_ms();
                if self.cards[i].config.timer_enabled {
                    if !self.timer.is_armed(&self.cards[i].config.entity) {
                        let target = self.entities.get(&self.cards[i].config.entity);
                        self.timer.arm(&self.cards[i].config, target, now);
                    }
                } else {
                    self.timer.cancel(&self.cards[i].config.entity);
                }
                if !self.cards[i].config.motion_enabled {
                    self.motion.cancel(&self.cards[i].name);
                }
            }
        }
    }

    /// Route a service call to the gateway owning its entity.
    fn dispatch(&self, call: ServiceCall) {
        let gateway = self
            .entity_gateway_map
            .get(&call.entity_id)
            .cloned()
            .or_else(|| {
                // An entity never observed still routes when there is only
                // one place it could live.
                (self.gateway_channels.len() == 1)
                    .then(|| self.gateway_channels.keys().next().unwrap().clone())
            });

        let Some(gateway) = gateway else {
            warn!("no gateway for entity {}, dropping service call", call.entity_id);
            return;
        };

        debug!("{} {} via '{}'", call.service, call.entity_id, gateway);
        if let Some(tx) = self.gateway_channels.get(&gateway) {
            if tx.send(ToGatewayMessage::CallService(call)).is_err() {
                warn!("gateway '{}' is gone, dropping service call", gateway);
            }
        }
    }

    /// Publish a fresh display snapshot (the view refresh).
    fn publish_view(&self) {
        let cards = self
            .cards
            .iter()
            .map(|card| {
                card.view(&self.entities, self.timer.remaining(&card.config.entity))
            })
            .collect();
        self.view.store(Arc::new(View { cards }));
    }
}
