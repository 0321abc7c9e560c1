//! # fedvpn-state
//!
//! The client's persisted state: the server set, the last chosen server,
//! and the discovery cache, written atomically to `<state_dir>/state.json`.
//! Old v1 files are migrated in-process on first load.

pub mod migrate;
pub mod store;
pub mod types;

pub use store::StateStore;
pub use types::StateFile;
