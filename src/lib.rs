//! Storage engine for a time-series metrics store.
//!
//! Labeled samples arrive as [`proto::ValueStream`]s, land in an in-memory
//! hot tail plus a crash-recoverable record log, and are periodically
//! compacted into indexed on-disk files. Queries match variables by name and
//! labels across RAM and every overlapping indexed file, with Bloom-filter
//! gating per file and an LRU on open file handles, then optionally resample
//! and aggregate the merged result server-side.

#[macro_use]
extern crate tracing;

pub mod config;
pub mod merge;
pub mod mutations;
pub mod proto;
pub mod protofile;
pub mod server;
pub mod service;
pub mod store;
pub mod variable;
