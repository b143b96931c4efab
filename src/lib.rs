//! Floodgate - Admission Control and Rate Limiting
//!
//! This crate decides, for every incoming HTTP request, whether the calling
//! client may proceed. Four interchangeable strategies (fixed window, sliding
//! window, token bucket, leaky bucket) keep their state in a shared Redis
//! counter store, with an in-process store used when Redis is unreachable.
//! Store failures never reject traffic: a check that cannot reach its store
//! admits the request.

pub mod config;
pub mod error;
pub mod http;
pub mod ratelimit;
pub mod store;
