use std::collections::HashMap;
use std::error::Error;
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use tokio::sync::Mutex;
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};

use super::client::{MqttClient, MqttMessage};
use super::statestream::{decode_field, parse_statestream_topic, StateField};
use crate::config::MqttConfig;
use crate::engine::state::EntityState;
use crate::engine::{FromGatewayMessage, ToGatewayMessage};
use crate::gateway::{FromGatewaySender, Gateway};

/// Type alias for the shared entity snapshot map
type EntitiesMap = Arc<Mutex<HashMap<String, EntityState>>>;

/// MQTT gateway
///
/// Consumes a Home Assistant MQTT statestream for entity states and
/// publishes service calls under the configured command topic, where a
/// companion automation on the HA side executes them.
pub struct MqttGateway<C: MqttClient> {
    client: Arc<Mutex<C>>,
    config: MqttConfig,
    entities: EntitiesMap,

    /// Handle to the background message processing task
    message_task: Option<JoinHandle<()>>,
}

impl<C: MqttClient> MqttGateway<C> {
    pub fn new(client: C, config: &MqttConfig) -> Self {
        Self {
            client: Arc::new(Mutex::new(client)),
            config: config.clone(),
            entities: Arc::new(Mutex::new(HashMap::new())),
            message_task: None,
        }
    }

    /// Process incoming MQTT messages in a background task
    ///
    /// Spawned in setup() so that handle_message() can publish service
    /// calls concurrently.
    async fn process_messages_task(
        client: Arc<Mutex<C>>,
        config: MqttConfig,
        entities: EntitiesMap,
        to_engine: FromGatewaySender,
    ) {
        loop {
            // Poll with a short lock hold time so publishes interleave.
            let msg = {
                let mut client_guard = client.lock().await;
                tokio::time::timeout(Duration::from_millis(100), client_guard.poll_message())
                    .await
                    .unwrap_or_default()
            };

            match msg {
                Some(msg) => {
                    Self::handle_statestream_message(&msg, &config, &entities, &to_engine).await;
                }
                None => {
                    // No message available, yield to other tasks.
                    tokio::task::yield_now().await;
                }
            }
        }
    }

    /// Apply one statestream message to the entity snapshot and notify the
    /// engine.
    async fn handle_statestream_message(
        msg: &MqttMessage,
        config: &MqttConfig,
        entities: &EntitiesMap,
        to_engine: &FromGatewaySender,
    ) {
        let Some((entity_id, field)) =
            parse_statestream_topic(&msg.topic, &config.statestream_prefix)
        else {
            debug!("ignoring message on unrelated topic {}", msg.topic);
            return;
        };

        // A retained empty state payload clears the entity.
        if field == "state" && msg.payload.is_empty() {
            let removed = entities.lock().await.remove(&entity_id).is_some();
            if removed {
                let event = FromGatewayMessage::EntityRemoved { entity_id };
                if to_engine.send(event).await.is_err() {
                    warn!("engine is gone, dropping entity removal");
                }
            }
            return;
        }

        let Some(field) = decode_field(field, &msg.payload) else {
            return;
        };

        let (first_sighting, snapshot) = {
            let mut guard = entities.lock().await;
            let first = !guard.contains_key(&entity_id);
            let entry = guard
                .entry(entity_id.clone())
                .or_insert_with(EntityState::unknown);
            match field {
                StateField::State(state) => entry.state = state,
                StateField::LastChanged(ms) => entry.last_changed_ms = Some(ms),
                StateField::Attribute(name, value) => {
                    entry.attributes.insert(name, value);
                }
            }
            (first, entry.clone())
        };

        if first_sighting {
            let event = FromGatewayMessage::EntityObserved {
                entity_id: entity_id.clone(),
                gateway: "mqtt".to_string(),
            };
            if to_engine.send(event).await.is_err() {
                return;
            }
        }

        let event = FromGatewayMessage::StateChanged {
            entity_id,
            state: snapshot,
        };
        if to_engine.send(event).await.is_err() {
            warn!("engine is gone, dropping state change");
        }
    }
}

#[async_trait]
impl<C: MqttClient + 'static> Gateway for MqttGateway<C> {
    fn name(&self) -> &str {
        "mqtt"
    }

    async fn setup(&mut self, tx: FromGatewaySender) -> Result<(), Box<dyn Error + Send>> {
        let topic = format!("{}/#", self.config.statestream_prefix);
        {
            let mut client = self.client.lock().await;
            client.connect().await?;
            client.subscribe(&topic).await?;
        }
        info!("mqtt gateway subscribed to {}", topic);

        let task = tokio::spawn(Self::process_messages_task(
            self.client.clone(),
            self.config.clone(),
            self.entities.clone(),
            tx,
        ));
        self.message_task = Some(task);

        Ok(())
    }

    async fn handle_message(
        &mut self,
        msg: ToGatewayMessage,
    ) -> Result<(), Box<dyn Error + Send>> {
        let ToGatewayMessage::CallService(call) = msg;

        let topic = format!(
            "{}/{}/{}",
            self.config.command_prefix,
            call.domain(),
            call.service
        );
        let payload =
            serde_json::to_vec(&call).map_err(|e| Box::new(e) as Box<dyn Error + Send>)?;

        debug!("publishing service call to {}", topic);
        let mut client = self.client.lock().await;
        client.publish(&topic, &payload).await
    }

    async fn shutdown(&mut self) -> Result<(), Box<dyn Error + Send>> {
        if let Some(task) = self.message_task.take() {
            task.abort();
        }
        Ok(())
    }
}
