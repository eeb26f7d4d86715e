//! chronod — the ChronoGrid metadata daemon, as a library.
//!
//! The binary in `main.rs` parses the CLI and config and runs a
//! [`server::MetaServer`]. The pieces live here so integration tests
//! can drive a full server in-process against the in-memory backend.

pub mod bootstrap;
pub mod config;
pub mod server;

pub use config::Config;
pub use server::MetaServer;
