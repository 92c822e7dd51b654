//! Domain services: the core the HTTP handlers delegate to.

pub mod blob_store;
pub mod deletion_orchestrator;
pub mod deletion_worker;
pub mod error;
pub mod flow_registry;
pub mod object_ledger;
pub mod segment_store;
pub mod storage_keys;
