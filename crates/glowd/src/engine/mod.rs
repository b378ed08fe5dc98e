mod card;
#[allow(clippy::module_inception)]
mod engine;
mod message;
mod motion;
pub mod state;
mod timer;

pub use card::CardSettings;
pub use card::CardView;
pub use card::View;
pub use engine::Engine;
pub use engine::EngineHandle;
pub use message::EngineMessage;
pub use message::FromGatewayMessage;
pub use message::Service;
pub use message::ServiceCall;
pub use message::ToGatewayMessage;
pub use state::EntityState;
