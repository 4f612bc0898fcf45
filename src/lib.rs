//! # fireplacectl
//!
//! Device-side agent that keeps one relay in sync with an MQTT control plane.
//!
//! ```text
//! broker ◄──► mqtt ──events──► session ──► dispatcher ──► synchronizer ──► relay
//!                                 │                            │
//!                                 └── ONLINE / OFFLINE         └── retained state
//! ```
//!
//! - [`mqtt`] - broker connection, acknowledgement tracking
//! - [`session`] - connect, announce, dispatch and shutdown lifecycle
//! - [`dispatcher`] - decodes `ON`/`OFF` commands
//! - [`synchronizer`] - sole writer of the relay state and its retained topic
//! - [`relay`] - GPIO or simulated relay driver
//! - [`config`] - defaults, TOML file and environment

pub mod config;
pub mod dispatcher;
pub mod mqtt;
pub mod relay;
pub mod session;
pub mod synchronizer;

#[cfg(test)]
mod testing;
