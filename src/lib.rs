//! Authguard - Brute Force Protection for Authentication Endpoints
//!
//! This crate limits how often callers may hit sensitive endpoints and locks
//! accounts after repeated authentication failures. Limits are enforced with
//! a sliding window kept either in process memory or in a shared Redis store
//! so every service instance enforces one global limit.

pub mod clock;
pub mod config;
pub mod error;
pub mod http;
pub mod lockout;
pub mod ratelimit;
mod sweep;

pub use error::{GuardError, Result};
