pub mod bus;
pub mod cache;
pub mod conversation_list;
pub mod engine;
pub mod error;
pub mod queue;
pub mod store;
pub mod transport;
pub mod types;
pub mod window;

pub use error::SyncError;
