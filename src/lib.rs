//! Snapsend backup agent library
//!
//! Orchestrates btrfs subvolume backups: read-only snapshots are serialized
//! with `btrfs send`, compressed, encrypted, and streamed over SSH to an
//! archival host. Lineage between full and incremental archives is recorded
//! durably so later incrementals and restores stay sound.

pub mod api;
pub mod config;
pub mod daemon;
pub mod pipeline;
pub mod policy;
pub mod remote;
pub mod restore;
pub mod retention;
pub mod run;
pub mod snapshot;
pub mod stages;
pub mod store;
pub mod utils;

// Re-export commonly used types
pub use config::Config;
pub use utils::errors::AgentError;
pub type Result<T> = std::result::Result<T, AgentError>;
