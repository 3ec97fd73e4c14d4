//! gridmux-metadata: configuration types for the multiplexer
//!
//! Provider configurations describe one logical upstream data source; the
//! config store is the key/value collaborator the gateway resolves them
//! from. Settings carry the multiplexer's tunables with their defaults.

pub mod error;
pub mod provider;
pub mod settings;
pub mod store;

pub use error::MetadataError;
pub use provider::{Destination, ProviderConfig, TriggerSpec};
pub use settings::MuxSettings;
pub use store::{ConfigStore, MemoryStore};
