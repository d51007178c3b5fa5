//! Floodgate - In-process admission control
//!
//! This crate decides whether an operation on a shared resource may proceed
//! now, may proceed after a bounded wait, or must be rejected. It provides
//! multi-tier token bucket limiters driven by `capacity:seconds` configuration
//! strings, a buffered permit pool for asynchronous callers, and a registry
//! that keeps one limiter per tenant, customer, session or entity.

pub mod config;
pub mod error;
pub mod profile;
pub mod ratelimit;

pub use error::{ConfigErrorReason, FloodgateError, Result};
