//! Turnstile - Tiered Admission-Control Rate Limiter
//!
//! This crate decides whether an inbound API call may proceed. Each caller
//! is held to four simultaneous fixed-window budgets (10-second burst,
//! minute, hour and day) taken from its subscription tier, and callers that
//! keep hitting their limits are blocked outright for a while.

pub mod adapter;
pub mod config;
pub mod error;
pub mod ratelimit;
