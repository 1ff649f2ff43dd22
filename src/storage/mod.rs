//! Storage tiers.
//!
//! - [`traits`]: the store contracts and the shared upsert rule
//! - [`memory`]: DashMap-backed stores for embedding and tests
//! - [`redis`]: ephemeral tier on Redis
//! - [`sql`]: durable and saved-for-later tiers on MySQL/SQLite

pub mod memory;
pub mod redis;
pub mod sql;
pub mod traits;
