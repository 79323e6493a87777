//! Message Router
//!
//! Serves one accepted stream: admits the plugin on its `RegisterConfig`,
//! then dispatches every later message by tag in arrival order. Dispatch is
//! synchronous and runs under `catch_unwind`, so a fault while handling one
//! message is reported and the loop moves on.

use crate::core::version::satisfies_minimum;
use crate::plugin::error::HostError;
use crate::plugin::manager::HostShared;
use crate::plugin::registry::Rejection;
use crate::plugin::session::{PluginSession, SessionState};
use crate::plugin::sinks::{HostSinks, ResultsSignal, SessionError};
use crate::protocol::{
    FrameReader, PluginMessage, RegisterConfig, ServerMessage, ServerTerminate, StreamSender,
    TransportError,
};
use std::panic::AssertUnwindSafe;
use std::sync::Arc;
use tokio::io::AsyncRead;

/// Serve a stream whose header has already been accepted
pub(crate) async fn serve_stream<R>(
    shared: Arc<HostShared>,
    mut reader: FrameReader<R>,
    sender: StreamSender<ServerMessage>,
    peer: String,
) where
    R: AsyncRead + Unpin + Send,
{
    let Some(config) = admit(&shared, &mut reader, &sender, &peer).await else {
        sender.close();
        return;
    };

    let session = Arc::new(PluginSession::new(
        shared.registry.next_session_id(),
        config,
        sender.clone(),
    ));
    if let Some(previous) = shared.registry.insert(session.clone()).await {
        log::info!(
            "MessageRouter: '{}' registered again; closing session {}",
            session.name(),
            previous.id()
        );
        previous.terminate("replaced by a newer registration");
    }
    log::info!(
        "MessageRouter: '{}' v{} registered from {} as session {}",
        session.name(),
        session.config().version,
        peer,
        session.id()
    );

    let mut broken = None;
    loop {
        tokio::select! {
            msg = reader.recv::<PluginMessage>() => match msg {
                Ok(Some(msg)) => dispatch(&shared.sinks(), &session, msg),
                Ok(None) => break,
                Err(e) => {
                    if !e.is_disconnect() {
                        broken = Some(e);
                    }
                    break;
                }
            },
            _ = session.closed() => break,
        }
    }

    let was_running = session.state() == SessionState::Running;
    close_session(&shared, &session, broken, was_running).await;
}

/// Retire a finished session unless a newer registration already owns its name
async fn close_session(
    shared: &HostShared,
    session: &PluginSession,
    broken: Option<TransportError>,
    was_running: bool,
) {
    session.mark_closed();
    if shared
        .registry
        .remove_if_same(session.name(), session.id())
        .await
        .is_none()
    {
        log::debug!("MessageRouter: session {} closed after replacement", session.id());
        return;
    }
    if let Some(jobs) = &shared.sinks().jobs {
        jobs.forget_plugin(session.name());
    }
    log::info!(
        "MessageRouter: session {} for '{}' ended after {}s",
        session.id(),
        session.name(),
        (chrono::Utc::now() - session.started_at()).num_seconds()
    );

    let cause = match broken {
        Some(e) => Some(e),
        None if was_running && !session.results_ready() => Some(TransportError::Closed),
        None => None,
    };
    if let Some(cause) = cause {
        shared.sinks().emit_error(SessionError {
            plugin: session.name().to_string(),
            session: Some(session.id()),
            error: HostError::Transport(cause),
        });
    }
    shared.processes.stop(session.name()).await;
}

/// Read and vet the first message; `None` means the stream must close
async fn admit<R>(
    shared: &HostShared,
    reader: &mut FrameReader<R>,
    sender: &StreamSender<ServerMessage>,
    peer: &str,
) -> Option<RegisterConfig>
where
    R: AsyncRead + Unpin + Send,
{
    let config = match reader.recv::<PluginMessage>().await {
        Ok(Some(PluginMessage::RegisterConfig(config))) => config,
        Ok(Some(other)) => {
            log::warn!(
                "MessageRouter: {} sent {} before RegisterConfig; closing",
                peer,
                other.kind()
            );
            shared.sinks().emit_error(SessionError {
                plugin: peer.to_string(),
                session: None,
                error: HostError::protocol(
                    peer,
                    format!("first message must be RegisterConfig, got {}", other.kind()),
                ),
            });
            return None;
        }
        Ok(None) => {
            log::debug!("MessageRouter: {} closed before registering", peer);
            return None;
        }
        Err(e) => {
            log::warn!("MessageRouter: {} failed before registering: {}", peer, e);
            return None;
        }
    };

    if config.name.trim().is_empty() {
        shared.sinks().emit_error(SessionError {
            plugin: peer.to_string(),
            session: None,
            error: HostError::protocol(peer, "RegisterConfig has an empty name"),
        });
        return None;
    }

    let required = config
        .min_host_versions()
        .find(|min| !satisfies_minimum(&shared.host_version, min))
        .map(str::to_string);
    if let Some(required) = required {
        log::warn!(
            "MessageRouter: '{}' requires host {}, running {}",
            config.name,
            required,
            shared.host_version
        );
        let _ = sender.send(ServerMessage::ServerTerminate(ServerTerminate {
            reason: format!("host {} is older than required {}", shared.host_version, required),
        }));
        shared
            .registry
            .reject(Rejection {
                plugin: config.name.clone(),
                required: required.clone(),
                host: shared.host_version.clone(),
            })
            .await;
        shared.sinks().emit_error(SessionError {
            plugin: config.name.clone(),
            session: None,
            error: HostError::VersionMismatch {
                plugin: config.name.clone(),
                required,
                host: shared.host_version.clone(),
            },
        });
        return None;
    }

    Some(config)
}

fn dispatch(sinks: &HostSinks, session: &PluginSession, msg: PluginMessage) {
    let kind = msg.kind();
    let outcome = std::panic::catch_unwind(AssertUnwindSafe(|| route(sinks, session, msg)));
    if let Err(panic) = outcome {
        let detail = panic
            .downcast_ref::<&str>()
            .map(|s| s.to_string())
            .or_else(|| panic.downcast_ref::<String>().cloned())
            .unwrap_or_else(|| "unknown panic".to_string());
        log::error!(
            "MessageRouter: handling {} from '{}' panicked: {}",
            kind,
            session.name(),
            detail
        );
        sinks.emit_error(SessionError {
            plugin: session.name().to_string(),
            session: Some(session.id()),
            error: HostError::protocol(session.name(), format!("failed to handle {kind}: {detail}")),
        });
    }
}

fn protocol_error(sinks: &HostSinks, session: &PluginSession, message: String) {
    log::warn!("MessageRouter: '{}': {}", session.name(), message);
    sinks.emit_error(SessionError {
        plugin: session.name().to_string(),
        session: Some(session.id()),
        error: HostError::protocol(session.name(), message),
    });
}

fn route(sinks: &HostSinks, session: &PluginSession, msg: PluginMessage) {
    let is_work = matches!(
        msg,
        PluginMessage::JobResult(_)
            | PluginMessage::OptimizationItem(_)
            | PluginMessage::ResultsReady(_)
    );
    if is_work && session.results_ready() {
        protocol_error(
            sinks,
            session,
            format!("{} received after ResultsReady", msg.kind()),
        );
        return;
    }

    match msg {
        PluginMessage::RegisterConfig(_) => {
            protocol_error(sinks, session, "duplicate RegisterConfig".to_string());
        }
        PluginMessage::JobResult(job) => match &sinks.jobs {
            Some(jobs) => jobs.apply(session.name(), &job),
            None => log::debug!("MessageRouter: no job sink; dropping job '{}'", job.id),
        },
        PluginMessage::OptimizationItem(item) => {
            if let Err(reason) = item.validate() {
                protocol_error(sinks, session, reason);
                return;
            }
            session.note_item(&item.id);
            match &sinks.items {
                Some(items) => {
                    items.upsert(session.name(), session.id(), Arc::new(item));
                }
                None => log::warn!(
                    "MessageRouter: no item sink wired; discarding item '{}' from '{}'",
                    item.id,
                    session.name()
                ),
            }
        }
        PluginMessage::Error(err) => {
            log::debug!("MessageRouter: '{}' reported: {}", session.name(), err.error);
            sinks.emit_error(SessionError {
                plugin: session.name().to_string(),
                session: Some(session.id()),
                error: HostError::Plugin {
                    plugin: session.name().to_string(),
                    message: err.error,
                },
            });
        }
        PluginMessage::ResultsReady(ready) => {
            if !ready.ready {
                log::debug!("MessageRouter: '{}' sent ResultsReady(false)", session.name());
                return;
            }
            if session.mark_results_ready() {
                sinks.emit_ready(ResultsSignal {
                    plugin: session.name().to_string(),
                    session: session.id(),
                });
            }
        }
    }
}
