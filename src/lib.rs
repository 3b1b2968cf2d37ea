//! Multi-protocol service prober.
//!
//! A [`probe::Prober`] resolves a protocol adapter from the registry, runs
//! its handshake against `host:port` under a single deadline and returns a
//! [`probe::ProbeResult`] for every request, success or not.

pub mod cli;
pub mod config;
pub mod network;
pub mod output;
pub mod probe;

pub use config::ProbeConfig;
pub use probe::{ErrorKind, ProbeRequest, ProbeResult, Prober, SubmitError};
