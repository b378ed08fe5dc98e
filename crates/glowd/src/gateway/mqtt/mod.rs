mod client;
mod gateway;
mod statestream;

use linkme::distributed_slice;

pub use gateway::MqttGateway;

use crate::gateway::{GatewayContext, GatewayFactoryResult, REGISTRY};

#[distributed_slice(REGISTRY)]
fn init_mqtt(ctx: &GatewayContext) -> GatewayFactoryResult {
    let mqtt_config = match &ctx.config.gateways.mqtt {
        Some(c) => c,
        None => return Ok(None),
    };

    let client = client::RumqttcClient::new(mqtt_config);
    Ok(Some(Box::new(MqttGateway::new(client, mqtt_config))))
}
