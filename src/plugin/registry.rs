//! Session Registry
//!
//! Map of live plugin sessions keyed by plugin name. Reads are concurrent,
//! writes are serialised, and every change bumps a generation counter so that
//! registration waiters wake without polling.

use crate::plugin::session::{PluginSession, SessionId};
use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{watch, RwLock};

/// A registration refused because the host is too old for the plugin
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Rejection {
    pub plugin: String,
    pub required: String,
    pub host: String,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum WaitError {
    TimedOut,
    Rejected(Rejection),
}

pub struct SessionRegistry {
    sessions: RwLock<HashMap<String, Arc<PluginSession>>>,
    rejections: RwLock<HashMap<String, Rejection>>,
    generation: watch::Sender<u64>,
    next_id: AtomicU64,
}

impl std::fmt::Debug for SessionRegistry {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("SessionRegistry")
            .field("generation", &*self.generation.borrow())
            .finish()
    }
}

impl Default for SessionRegistry {
    fn default() -> Self {
        Self::new()
    }
}

impl SessionRegistry {
    pub fn new() -> Self {
        let (generation, _) = watch::channel(0);
        Self {
            sessions: RwLock::new(HashMap::new()),
            rejections: RwLock::new(HashMap::new()),
            generation,
            next_id: AtomicU64::new(1),
        }
    }

    pub fn next_session_id(&self) -> SessionId {
        self.next_id.fetch_add(1, Ordering::Relaxed)
    }

    /// Id the next registration will get; every existing session is older
    pub fn upcoming_session_id(&self) -> SessionId {
        self.next_id.load(Ordering::Relaxed)
    }

    fn bump(&self) {
        self.generation.send_modify(|g| *g += 1);
    }

    /// Add a session, returning the one it replaced (the caller terminates it)
    pub async fn insert(&self, session: Arc<PluginSession>) -> Option<Arc<PluginSession>> {
        let name = session.name().to_string();
        let previous = self.sessions.write().await.insert(name.clone(), session);
        self.rejections.write().await.remove(&name);
        self.bump();
        previous
    }

    pub async fn get(&self, name: &str) -> Option<Arc<PluginSession>> {
        self.sessions.read().await.get(name).cloned()
    }

    pub async fn get_by_id(&self, id: SessionId) -> Option<Arc<PluginSession>> {
        self.sessions
            .read()
            .await
            .values()
            .find(|s| s.id() == id)
            .cloned()
    }

    /// Remove `name` only if it still maps to session `id`
    pub async fn remove_if_same(&self, name: &str, id: SessionId) -> Option<Arc<PluginSession>> {
        let mut sessions = self.sessions.write().await;
        if sessions.get(name).map(|s| s.id()) != Some(id) {
            return None;
        }
        let removed = sessions.remove(name);
        drop(sessions);
        self.bump();
        removed
    }

    /// Point-in-time snapshot, oldest registration first
    pub async fn sessions(&self) -> Vec<Arc<PluginSession>> {
        let mut sessions: Vec<_> = self.sessions.read().await.values().cloned().collect();
        sessions.sort_by_key(|s| s.id());
        sessions
    }

    pub async fn most_recent(&self) -> Option<Arc<PluginSession>> {
        self.sessions
            .read()
            .await
            .values()
            .max_by_key(|s| s.id())
            .cloned()
    }

    /// First live session advertising `command`
    pub async fn find_by_command(&self, command: &str) -> Option<Arc<PluginSession>> {
        self.sessions()
            .await
            .into_iter()
            .find(|s| s.advertises(command))
    }

    pub async fn len(&self) -> usize {
        self.sessions.read().await.len()
    }

    pub async fn is_empty(&self) -> bool {
        self.len().await == 0
    }

    /// Remove and return every session
    pub async fn drain(&self) -> Vec<Arc<PluginSession>> {
        let drained: Vec<_> = self.sessions.write().await.drain().map(|(_, s)| s).collect();
        self.bump();
        drained
    }

    pub async fn reject(&self, rejection: Rejection) {
        self.rejections
            .write()
            .await
            .insert(rejection.plugin.clone(), rejection);
        self.bump();
    }

    pub async fn clear_rejection(&self, name: &str) {
        self.rejections.write().await.remove(name);
    }

    pub async fn rejection(&self, name: &str) -> Option<Rejection> {
        self.rejections.read().await.get(name).cloned()
    }

    /// Wait until a plugin registers under any of `names`
    ///
    /// Ends early when one of those names is refused at registration.
    pub async fn wait_for_any(
        &self,
        names: &[&str],
        timeout: Duration,
    ) -> Result<Arc<PluginSession>, WaitError> {
        self.wait_for_newer(names, 0, timeout).await
    }

    /// Wait for a session under one of `names` whose id is at least `since`
    pub async fn wait_for_newer(
        &self,
        names: &[&str],
        since: SessionId,
        timeout: Duration,
    ) -> Result<Arc<PluginSession>, WaitError> {
        let deadline = tokio::time::Instant::now() + timeout;
        let mut changes = self.generation.subscribe();
        loop {
            let _ = changes.borrow_and_update();
            for name in names {
                if let Some(session) = self.get(name).await.filter(|s| s.id() >= since) {
                    return Ok(session);
                }
                if let Some(rejection) = self.rejection(name).await {
                    return Err(WaitError::Rejected(rejection));
                }
            }
            match tokio::time::timeout_at(deadline, changes.changed()).await {
                Ok(Ok(())) => continue,
                Ok(Err(_)) | Err(_) => return Err(WaitError::TimedOut),
            }
        }
    }

    pub async fn wait_for(
        &self,
        name: &str,
        timeout: Duration,
    ) -> Result<Arc<PluginSession>, WaitError> {
        self.wait_for_any(&[name], timeout).await
    }
}
