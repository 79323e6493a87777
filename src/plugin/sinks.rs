//! Caller-supplied outputs for plugin traffic
//!
//! Jobs and items land in shared stores; errors, results-ready signals and
//! re-login requests are delivered over bounded channels. A full or missing
//! channel drops the event with a log line rather than stalling a session.

use crate::plugin::error::HostError;
use crate::plugin::jobs::JobMirror;
use crate::plugin::optimizations::OptimizationStore;
use crate::plugin::session::SessionId;
use std::sync::Arc;
use tokio::sync::mpsc;

/// Buffer size of each event channel
pub const SINK_CAPACITY: usize = 10_000;

/// An error attributed to one plugin session
#[derive(Debug)]
pub struct SessionError {
    pub plugin: String,
    pub session: Option<SessionId>,
    pub error: HostError,
}

/// A plugin declared its invocation finished
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ResultsSignal {
    pub plugin: String,
    pub session: SessionId,
}

#[derive(Clone, Default)]
pub struct HostSinks {
    pub jobs: Option<Arc<JobMirror>>,
    pub items: Option<Arc<OptimizationStore>>,
    pub errors: Option<mpsc::Sender<SessionError>>,
    pub ready: Option<mpsc::Sender<ResultsSignal>>,
    pub relogin: Option<mpsc::Sender<()>>,
}

/// Receiving ends of a [`HostSinks::wired`] set
pub struct SinkReceivers {
    pub errors: mpsc::Receiver<SessionError>,
    pub ready: mpsc::Receiver<ResultsSignal>,
    pub relogin: mpsc::Receiver<()>,
}

impl std::fmt::Debug for HostSinks {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("HostSinks")
            .field("jobs", &self.jobs.is_some())
            .field("items", &self.items.is_some())
            .field("errors", &self.errors.is_some())
            .field("ready", &self.ready.is_some())
            .field("relogin", &self.relogin.is_some())
            .finish()
    }
}

impl HostSinks {
    /// Every sink connected, with fresh stores and channels
    pub fn wired() -> (Self, SinkReceivers) {
        let (errors_tx, errors) = mpsc::channel(SINK_CAPACITY);
        let (ready_tx, ready) = mpsc::channel(SINK_CAPACITY);
        let (relogin_tx, relogin) = mpsc::channel(8);
        let sinks = Self {
            jobs: Some(Arc::new(JobMirror::new())),
            items: Some(Arc::new(OptimizationStore::new())),
            errors: Some(errors_tx),
            ready: Some(ready_tx),
            relogin: Some(relogin_tx),
        };
        (
            sinks,
            SinkReceivers {
                errors,
                ready,
                relogin,
            },
        )
    }

    pub(crate) fn emit_error(&self, event: SessionError) {
        if let Some(jobs) = &self.jobs {
            jobs.record_error(event.error.to_string());
        }
        let Some(errors) = &self.errors else {
            log::warn!(
                "Plugin '{}' error with no error sink wired: {}",
                event.plugin,
                event.error
            );
            return;
        };
        if let Err(e) = errors.try_send(event) {
            let event = match e {
                mpsc::error::TrySendError::Full(event) => event,
                mpsc::error::TrySendError::Closed(event) => event,
            };
            log::warn!(
                "Error sink unavailable; dropping error from '{}': {}",
                event.plugin,
                event.error
            );
        }
    }

    pub(crate) fn emit_ready(&self, signal: ResultsSignal) {
        match &self.ready {
            Some(ready) => {
                if ready.try_send(signal).is_err() {
                    log::warn!("Results-ready sink unavailable; signal dropped");
                }
            }
            None => log::debug!("Results ready from '{}' with no sink wired", signal.plugin),
        }
    }

    pub(crate) fn request_relogin(&self) {
        match &self.relogin {
            Some(relogin) => {
                let _ = relogin.try_send(());
            }
            None => log::info!("Access token expired; please log in again"),
        }
    }
}
