//! slotd — interview slot booking engine.
//!
//! Per-slot write locks serialize booking decisions (lock, decide,
//! commit); a write-ahead log is the durable ledger; a line-delimited
//! JSON protocol is the wire surface.

pub mod auth;
pub mod config;
pub mod engine;
pub mod facade;
pub mod limits;
pub mod maintenance;
pub mod model;
pub mod notify;
pub mod observability;
pub mod wal;
pub mod wire;
