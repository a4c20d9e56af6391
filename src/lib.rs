//! Solegate - Request Rate Limiting Gate
//!
//! This crate implements the rate limiting gate that sits in front of the
//! sneaker social API. Every inbound request is counted against a sliding
//! window keyed by client and route, backed either by an in-process bucket
//! map or by a shared counter store when several instances serve traffic.

pub mod config;
pub mod error;
pub mod http;
pub mod ratelimit;
