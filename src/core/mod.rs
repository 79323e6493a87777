//! Core services and infrastructure

pub mod error_handling;
pub mod logging;
pub mod progress;
pub mod retry;
pub mod shutdown;
pub mod styles;
pub mod version;
