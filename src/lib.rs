//! rollcall: a login-gated command server.
//!
//! Clients connect over TCP, log in once with an email and password, and
//! then send single-character action codes followed by a JSON payload.
//! One thread multiplexes every connection.

pub mod commands;
pub mod config;
pub mod directory;
pub mod protocol;
pub mod runtime;
