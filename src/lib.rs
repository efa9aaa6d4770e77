// Core logic lives in chatcore; the runtime side (tasks, timers, storage) lives here.
pub use chatcore;
pub use chatcore::SyncError;
pub use chatcore::error::status_code;

// Core types are re-exported, but events (with EventBus) remain here for the broadcast channels
pub mod types {
    pub use chatcore::types::*;
    pub mod events;
}

pub mod client;
pub mod config;
pub mod conversations;
pub mod loopback;
pub mod messages;
pub mod queue;
pub mod send;
pub mod store;
pub mod upload;

pub use client::Client;
pub use config::ClientConfig;
