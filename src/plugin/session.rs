//! Plugin Session
//!
//! One registered plugin and the outbound half of its stream. The inbound
//! half is owned by the router task serving the connection.

use crate::plugin::error::HostResult;
use crate::protocol::{
    PreferenceItem, ReEvaluate, RegisterConfig, ServerMessage, ServerTerminate, StartProcess,
    StreamSender,
};
use chrono::{DateTime, Utc};
use std::collections::HashSet;
use std::sync::atomic::{AtomicBool, AtomicU8, Ordering};
use std::sync::Mutex;

/// Registry-unique identifier of an accepted stream
pub type SessionId = u64;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SessionState {
    /// Registered and idle between invocations
    Registered,
    /// A `StartProcess` or `ReEvaluate` is outstanding
    Running,
    Closing,
    Closed,
}

impl SessionState {
    fn from_u8(raw: u8) -> Self {
        match raw {
            0 => SessionState::Registered,
            1 => SessionState::Running,
            2 => SessionState::Closing,
            _ => SessionState::Closed,
        }
    }

    fn as_u8(self) -> u8 {
        match self {
            SessionState::Registered => 0,
            SessionState::Running => 1,
            SessionState::Closing => 2,
            SessionState::Closed => 3,
        }
    }
}

pub struct PluginSession {
    id: SessionId,
    config: RegisterConfig,
    sender: StreamSender<ServerMessage>,
    state: AtomicU8,
    results_ready: AtomicBool,
    pending_reevaluations: Mutex<HashSet<String>>,
    started_at: DateTime<Utc>,
}

impl std::fmt::Debug for PluginSession {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("PluginSession")
            .field("id", &self.id)
            .field("name", &self.config.name)
            .field("version", &self.config.version)
            .field("state", &self.state())
            .finish()
    }
}

impl PluginSession {
    pub fn new(id: SessionId, config: RegisterConfig, sender: StreamSender<ServerMessage>) -> Self {
        Self {
            id,
            config,
            sender,
            state: AtomicU8::new(SessionState::Registered.as_u8()),
            results_ready: AtomicBool::new(false),
            pending_reevaluations: Mutex::new(HashSet::new()),
            started_at: Utc::now(),
        }
    }

    pub fn id(&self) -> SessionId {
        self.id
    }

    pub fn name(&self) -> &str {
        &self.config.name
    }

    pub fn config(&self) -> &RegisterConfig {
        &self.config
    }

    pub fn state(&self) -> SessionState {
        SessionState::from_u8(self.state.load(Ordering::Acquire))
    }

    fn set_state(&self, state: SessionState) {
        self.state.store(state.as_u8(), Ordering::Release);
    }

    pub fn started_at(&self) -> DateTime<Utc> {
        self.started_at
    }

    pub fn advertises(&self, command: &str) -> bool {
        self.config.command(command).is_some()
    }

    /// True once the plugin declared the current invocation finished
    pub fn results_ready(&self) -> bool {
        self.results_ready.load(Ordering::Acquire)
    }

    /// Returns true for the first `ResultsReady` of an invocation
    pub(crate) fn mark_results_ready(&self) -> bool {
        let first = !self.results_ready.swap(true, Ordering::AcqRel);
        if first && self.state() == SessionState::Running {
            self.set_state(SessionState::Registered);
        }
        first
    }

    // A new invocation opens a fresh result window before the request is sent
    fn begin_invocation(&self) -> HostResult<()> {
        match self.state() {
            SessionState::Closing | SessionState::Closed => {
                Err(crate::protocol::TransportError::Closed.into())
            }
            _ => {
                self.results_ready.store(false, Ordering::Release);
                self.set_state(SessionState::Running);
                Ok(())
            }
        }
    }

    pub fn send(&self, msg: ServerMessage) -> HostResult<()> {
        log::trace!("PluginSession[{}]: sending {}", self.name(), msg.kind());
        self.sender.send(msg)?;
        Ok(())
    }

    pub fn start_process(&self, request: StartProcess) -> HostResult<()> {
        self.begin_invocation()?;
        log::debug!(
            "PluginSession[{}]: starting command '{}'",
            self.name(),
            request.command
        );
        self.send(ServerMessage::StartProcess(request))
    }

    pub fn re_evaluate(&self, id: &str, preferences: Vec<PreferenceItem>) -> HostResult<()> {
        self.begin_invocation()?;
        self.pending_reevaluations
            .lock()
            .unwrap_or_else(std::sync::PoisonError::into_inner)
            .insert(id.to_string());
        self.send(ServerMessage::ReEvaluate(ReEvaluate {
            id: id.to_string(),
            preferences: preferences
                .into_iter()
                .map(PreferenceItem::normalized)
                .collect(),
        }))
    }

    /// Item ids sent for re-evaluation that have not come back yet
    pub fn pending_reevaluations(&self) -> Vec<String> {
        let mut ids: Vec<String> = self
            .pending_reevaluations
            .lock()
            .unwrap_or_else(std::sync::PoisonError::into_inner)
            .iter()
            .cloned()
            .collect();
        ids.sort();
        ids
    }

    pub(crate) fn note_item(&self, id: &str) {
        self.pending_reevaluations
            .lock()
            .unwrap_or_else(std::sync::PoisonError::into_inner)
            .remove(id);
    }

    /// Ask the plugin to exit and close the stream
    pub fn terminate(&self, reason: &str) {
        if matches!(self.state(), SessionState::Closing | SessionState::Closed) {
            return;
        }
        self.set_state(SessionState::Closing);
        log::debug!("PluginSession[{}]: terminating ({})", self.name(), reason);
        let _ = self.sender.send(ServerMessage::ServerTerminate(ServerTerminate {
            reason: reason.to_string(),
        }));
        self.sender.close();
    }

    pub(crate) fn mark_closed(&self) {
        self.set_state(SessionState::Closed);
        self.sender.close();
    }

    pub fn is_closed(&self) -> bool {
        self.state() == SessionState::Closed
    }

    /// Resolves once the outbound side has been closed
    pub(crate) async fn closed(&self) {
        self.sender.closed().await
    }
}
