//! Instagram puppet bridge: relays Instagram direct messages to Matrix.
//!
//! One [`session::SessionClient`] per linked account polls the remote inbox
//! and emits typed [`session::SessionEvent`]s. The [`bridge::BridgeAdapter`]
//! forwards them to the bridge framework and routes outbound deliveries back.
//! New accounts are linked through the multi-step [`provisioning`] flow.
//!
//! See `DESIGN.md` for the module map.

#![forbid(unsafe_code)]
#![warn(missing_docs)]

pub mod config;
pub mod http;
pub mod logging;

pub mod login;
pub mod platform;
pub mod session;

pub mod bridge;
pub mod provisioning;

/// Bridge-assigned identifier of a linked account ("puppet").
pub type PuppetId = i64;
