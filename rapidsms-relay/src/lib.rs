//! Relay between a Vumi messaging backbone and a RapidSMS HTTP backend.
//!
//! Inbound messages from the backbone are forwarded to RapidSMS over HTTP.
//! RapidSMS sends messages back by calling the relay's own HTTP endpoint.

pub mod api;
pub mod auth;
pub mod backbone;
pub mod config;
pub mod correlator;
pub mod dispatcher;
pub mod errors;
pub mod forwarder;
pub mod message;
pub mod metrics_defs;
pub mod service;
pub mod signer;

#[cfg(test)]
mod testutils;

pub use errors::{RelayError, Result};
pub use service::{RelayService, ServiceState};
