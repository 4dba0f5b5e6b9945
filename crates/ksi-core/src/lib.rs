//! Core types and protocol for the KSI event daemon.
//!
//! This crate provides the shared vocabulary used by the daemon, the socket
//! client, and external tools:
//! - Event envelopes (`{event, data, _ksi_context}`) and context stamping
//! - Event-name pattern matching (literal names and suffix globs)
//! - The stable error taxonomy exchanged over the wire
//! - Daemon configuration resolution (file, environment, defaults)
//! - Extraction of event blocks embedded in completion responses
//! - An async client for the daemon's Unix socket
//!
//! All wire payloads are `serde_json::Value`; schema types preserve unknown
//! fields so that old clients and new daemons interoperate.

pub mod client;
pub mod config;
pub mod envelope;
pub mod error;
pub mod logging;
pub mod pattern;
pub mod tool_use;

pub use envelope::{Envelope, EventContext};
pub use error::KsiError;
pub use pattern::EventPattern;
