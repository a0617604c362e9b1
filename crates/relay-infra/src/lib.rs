//! Infrastructure for Relay: configuration loading and concrete provider
//! adapters.
//!
//! - [`config`]: reads and validates `relay.toml`
//! - [`llm`]: HTTP adapters implementing `relay_core::llm::provider::LlmProvider`,
//!   HTTP status classification, and router construction from configuration

pub mod config;
pub mod llm;
