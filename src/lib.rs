//! Quorate - Distributed Request Quota Enforcement
//!
//! This crate admits or rejects requests against per-tier quotas. Counters
//! live in a shared store (Redis in production) and every consume is a single
//! atomic store operation, so limits hold across any number of concurrent
//! server processes.

pub mod config;
pub mod error;
pub mod ratelimit;
pub mod store;
