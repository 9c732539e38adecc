pub mod bus;
pub mod payloads;
pub mod types;

// Re-export key types for convenience
pub use bus::{EventBus, EventBusConfig, EventBusStats, EventHandler, FnHandler, SubscriptionId};
pub use payloads::ProgressSnapshot;
pub use types::{topics, Event};
