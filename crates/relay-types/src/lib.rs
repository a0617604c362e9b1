//! Shared domain types for Relay.
//!
//! This crate contains the data shapes exchanged between the router core,
//! the provider adapters, and callers: completion payloads, classified
//! provider errors, router configuration, and per-call outcomes.
//!
//! Zero infrastructure dependencies -- only serde, uuid, chrono, thiserror.

pub mod config;
pub mod llm;
pub mod routing;
