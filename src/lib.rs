//! Turnstile - HTTP Admission Control
//!
//! This crate implements a fixed-window rate limiter that sits in front of
//! HTTP handlers. Requests are counted per client identity (an `API_KEY`
//! header or the peer IP address) in a pluggable counter store, and the
//! limits applied to each identity can be overridden at runtime through a
//! small management API.

pub mod config;
pub mod error;
pub mod http;
pub mod ratelimit;
pub mod store;
