//! Entity state gateways.
//!
//! A gateway is glowd's window onto the host platform: it delivers
//! state-changed events for entities and executes service calls. Gateways
//! run as background tasks wired to the engine over channels; constructors
//! register themselves in [`REGISTRY`] and are instantiated from
//! configuration at startup.

mod mqtt;

use std::error::Error;

use async_trait::async_trait;
use linkme::distributed_slice;
use tokio::sync::mpsc;

use crate::config::Config;
use crate::engine::{FromGatewayMessage, ToGatewayMessage};

pub use mqtt::MqttGateway;

/// Channel types for events FROM gateways TO the engine
/// These are bounded channels to provide backpressure
pub type FromGatewaySender = mpsc::Sender<FromGatewayMessage>;

/// Channel types for commands FROM the engine TO gateways (unbounded - the
/// engine loop must not block)
pub type ToGatewaySender = mpsc::UnboundedSender<ToGatewayMessage>;

/// Result type for gateway constructor functions
pub type GatewayFactoryResult = anyhow::Result<Option<Box<dyn Gateway>>>;

pub struct GatewayContext<'a> {
    pub config: &'a Config,
}

#[distributed_slice]
pub static REGISTRY: [fn(&GatewayContext) -> GatewayFactoryResult];

/// Gateway trait that all gateways must implement
#[async_trait]
pub trait Gateway: Send + Sync {
    /// Get the name/identifier of this gateway
    fn name(&self) -> &str;

    /// Set up the gateway - connect, subscribe, start delivering events
    ///
    /// The gateway receives a sender to report entity events back to the
    /// engine.
    async fn setup(&mut self, tx: FromGatewaySender) -> Result<(), Box<dyn Error + Send>>;

    /// Execute a service call requested by the engine
    async fn handle_message(
        &mut self,
        msg: ToGatewayMessage,
    ) -> Result<(), Box<dyn Error + Send>>;

    /// Shut down the gateway gracefully
    async fn shutdown(&mut self) -> Result<(), Box<dyn Error + Send>>;
}
