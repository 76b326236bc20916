//! Event recorder: the sinks that consume change signals.
//!
//! Two independent sinks share one query surface: a bounded in-memory
//! ring cache for fast recent-history queries, and a day-rotated SQLite
//! store for durable history. Either, both, or neither may be enabled.

pub mod backup;
pub mod query;
pub mod ring;
pub mod store;

pub use query::{EventQuery, FilterOp, ValueFilter, DEFAULT_QUERY_LIMIT};
pub use ring::{CompressionConfig, RingCache, RingConfig, RingHealth, SpilloverConfig};
pub use store::{EventStore, StoreStatistics};
