//! Multi-tier cache engine
//!
//! Three tiers behind one manager:
//! - L1: in-process LRU with entry and byte caps ([`memory`])
//! - L2: Redis-backed distributed cache ([`redis_tier`], via [`redis_client`])
//! - L3: durable KV in Postgres ([`durable`])
//!
//! Reads fall through L1 -> L2 -> L3 and repopulate upward; writes go
//! through every tier. A failing tier degrades to a miss, never an error.

pub mod durable;
pub mod manager;
pub mod memory;
pub mod metrics;
pub mod redis_client;
pub mod redis_tier;

pub use manager::{CacheManager, TierCounts};
pub use memory::MemoryCache;
pub use metrics::CacheMetricsSnapshot;
pub use redis_client::RedisClient;
