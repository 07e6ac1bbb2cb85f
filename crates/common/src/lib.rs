//! Cross-cutting infrastructure shared by the gateway crates: structured
//! logging initialisation and the distributed key-value state store.

pub mod logging;
pub mod state;

pub use state::{MemoryStateStore, StateStore, StateStoreError};
