//! Plugin Host
//!
//! Installs plugin executables, launches them, and serves the bidirectional
//! `Register` stream each plugin opens back to the host. Traffic from every
//! session is routed into caller-supplied sinks.
//!
//! [`PluginManager`] is the entry point; the other types are exposed for
//! callers that wire sinks, supply a custom [`Launcher`] or inspect sessions.

pub(crate) mod endpoint;
pub mod error;
pub mod installer;
pub mod jobs;
pub mod launcher;
pub mod manager;
pub mod optimizations;
pub mod registry;
pub(crate) mod router;
pub mod session;
pub mod sinks;

pub use error::{HostError, HostResult};
pub use installer::{InstallOutcome, InstallRequest, REGISTRATION_TIMEOUT};
pub use jobs::{JobKey, JobMirror, JobSummary};
pub use launcher::{Launcher, PluginProcess, ProcessLauncher};
pub use manager::{ManagerOptions, ManagerState, PluginManager};
pub use optimizations::{OptimizationStore, StoredItem, Upsert};
pub use registry::{Rejection, SessionRegistry, WaitError};
pub use session::{PluginSession, SessionId, SessionState};
pub use sinks::{HostSinks, ResultsSignal, SessionError, SinkReceivers};
