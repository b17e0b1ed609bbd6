//! Real-time lead comment synchronization for the Klientel CRM client.
//!
//! A client subscribes to per-lead rooms on the room server, merges inbound
//! `new_comment` events into local state, and reconciles them with comments
//! it creates itself over the GraphQL API. Comment ids are the only dedup
//! key; display order is always `created_at`, then `id`.
//!
//! Layers, leaves first:
//! - [`connection`]: zero or one transport session per credential
//! - [`membership`]: join/leave state machine per lead room
//! - [`reconciler`]: validates inbound payloads and upserts them
//! - [`store`]: the per-lead comment lists and UI flags
//! - [`engine`]: the surface a view talks to

pub mod cli;
pub mod comment;
pub mod config;
pub mod connection;
pub mod engine;
pub mod error;
pub mod graphql;
pub mod membership;
pub mod protocol;
pub mod reconciler;
pub mod store;
pub mod transport;

pub use comment::Comment;
pub use config::SyncConfig;
pub use connection::{Connectivity, Credential};
pub use engine::{Notice, NoticeLevel, RoomGuard, SyncEngine};
pub use error::{Result, SyncError};
pub use membership::MembershipState;
pub use store::UpsertOutcome;
