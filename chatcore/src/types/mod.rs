pub mod conversation;
pub mod events;
pub mod message;

pub use conversation::*;
pub use message::*;
