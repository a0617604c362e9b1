//! Provider routing core for Relay.
//!
//! This crate holds the resilience logic that sits between callers and LLM
//! provider adapters: per-provider token buckets, circuit breakers, retry
//! backoff, and the router that composes them. It depends only on
//! `relay-types` -- never on `relay-infra` or any network crate.

pub mod llm;
