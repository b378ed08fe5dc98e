pub mod api;
pub mod config;
mod engine;
pub mod gateway;
mod store;

pub use config::Config;
pub use config::ConfigError;
pub use config::LogLevel;
pub use engine::CardSettings;
pub use engine::CardView;
pub use engine::Engine;
pub use engine::EngineHandle;
pub use engine::EngineMessage;
pub use engine::EntityState;
pub use engine::FromGatewayMessage;
pub use engine::Service;
pub use engine::ServiceCall;
pub use engine::ToGatewayMessage;
pub use engine::View;
pub use store::JsonFileStore;
pub use store::MemoryStore;
pub use store::Store;
pub use store::StoreError;
