//! kaytu: plugin host and plugin SDK
//!
//! The host installs plugin executables from their release repositories,
//! launches them, and exchanges messages with them over a local TCP stream.
//! The [`sdk`] module is the plugin side of the same stream.

pub mod app;
pub mod config;
pub mod core;
pub mod plugin;
pub mod protocol;
pub mod release;
pub mod sdk;
