//! Cache primitives for mimir.
//!
//! - [`TtlCell`]: one value with a creation stamp and its own refresh lock,
//!   refreshed at most once at a time no matter how many callers find it stale
//! - [`KeyedCacheTable`]: the concurrent key -> cell map every layer is built on
//!
//! The message-bundle layers (candidate lists, parsed sources, merged views,
//! compiled formats) live in [`crate::messages`].

pub mod entry;
pub mod table;

pub use entry::{CellOutcome, SelfRefreshing, Ttl, TtlCell};
pub use table::KeyedCacheTable;
