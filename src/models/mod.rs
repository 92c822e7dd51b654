//! Core data models for the flow/segment/object store.
//!
//! Row types map to SQLite tables via `sqlx::FromRow` and serialize as JSON
//! via `serde`. [`timerange`] holds the timerange value type all of them
//! are keyed by.

pub mod deletion;
pub mod flow;
pub mod object;
pub mod segment;
pub mod timerange;
