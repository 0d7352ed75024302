//! Patchfleet aggregator daemon.
//!
//! Holds the ticket/report store, accepts report submissions from workers,
//! answers status queries, and prunes expired pending leases on reads.

#![forbid(unsafe_code)]

pub mod api;
pub mod logs;
pub mod store;
