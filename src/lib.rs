//! # Param Sync Library
//!
//! Keep a ground-station copy of a flight controller's parameter table in
//! sync over a lossy, half-duplex link.
//!
//! The [`engine::ParamEngine`] fetches the whole table with gap recovery,
//! writes single parameters with echo confirmation and serves cache-first
//! reads. Every confirmed value lands in a shared [`cache::ParameterCache`]
//! that publishes snapshots to subscribers.

pub mod cache;
pub mod config;
pub mod engine;
pub mod error;
pub mod metadata;
pub mod protocol;
pub mod transport;
