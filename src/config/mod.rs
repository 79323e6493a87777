//! Configuration Store
//!
//! Persistent record of the access token and installed plugins, stored as
//! JSON under `~/.kaytu`. The store is an explicit handle: callers build a
//! [`ConfigStore`] from a [`KaytuPaths`] and pass it where it is needed.

pub mod error;
pub mod paths;
pub mod store;
pub mod token;

pub use error::{ConfigError, ConfigResult};
pub use paths::KaytuPaths;
pub use store::{Config, ConfigStore, PluginDescriptor};
