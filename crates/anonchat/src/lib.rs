//! anonchat - OpenAI-compatible proxy for the anonymous chat backend.
//!
//! Clients speak the OpenAI chat-completions API. This crate exposes that
//! surface and forwards each request to the no-login conversation endpoint,
//! keeping an anonymous session alive in the background:
//!
//! - a random device id stands in for an account ([`session`]);
//! - a timer trades it for short-lived session tokens, solving the attached
//!   proof-of-work challenge ([`refresher`], [`pow`]);
//! - the upstream event stream is decoded ([`stream`]) and reshaped into
//!   OpenAI chunks or a single completion ([`responder`]).

pub mod config;
pub mod error;
pub mod pow;
pub mod refresher;
pub mod responder;
pub mod server;
pub mod session;
pub mod stream;
pub mod types;
pub mod upstream;

pub use config::ProxyConfig;
pub use error::{ProxyError, Result};
pub use server::{serve, AppState, ProxyServices};
