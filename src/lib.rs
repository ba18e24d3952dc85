//! Mimir - layered, stampede-safe message bundle cache.

pub mod cache;
pub mod config;
pub mod error;
pub mod messages;
pub mod metrics;
pub mod services;
