//! Plugin Launcher
//!
//! Starts installed plugins as child processes and keeps one handle per
//! plugin name so that every child can be stopped on session close or host
//! shutdown.

use crate::config::{KaytuPaths, PluginDescriptor};
use crate::plugin::error::{HostError, HostResult};
use async_trait::async_trait;
use std::collections::HashMap;
use std::path::Path;
use std::process::Stdio;
use std::sync::Arc;
use std::time::Duration;
use tokio::process::{Child, Command};
use tokio::sync::Mutex;

/// Log files above this size are rotated before a new child appends to them
pub const MAX_LOG_BYTES: u64 = 10 * 1024 * 1024;

/// Time a child gets to exit after the soft signal
pub const DEFAULT_STOP_GRACE: Duration = Duration::from_secs(3);

/// A started plugin
#[async_trait]
pub trait PluginProcess: Send + Sync {
    fn id(&self) -> Option<u32>;

    /// Soft signal, then a hard kill once `grace` has passed
    async fn terminate(&mut self, grace: Duration) -> HostResult<()>;
}

#[async_trait]
pub trait Launcher: Send + Sync {
    /// Spawn `descriptor` pointing it at `server_addr`; does not wait for exit
    async fn start(
        &self,
        descriptor: &PluginDescriptor,
        server_addr: &str,
    ) -> HostResult<Box<dyn PluginProcess>>;

    async fn stop(&self, mut handle: Box<dyn PluginProcess>, grace: Duration) -> HostResult<()> {
        handle.terminate(grace).await
    }
}

/// Launches real executables with output redirected to the logs directory
#[derive(Debug, Clone)]
pub struct ProcessLauncher {
    paths: KaytuPaths,
}

impl ProcessLauncher {
    pub fn new(paths: KaytuPaths) -> Self {
        Self { paths }
    }

    fn open_log(&self, path: &Path) -> HostResult<std::fs::File> {
        rotate_if_large(path, MAX_LOG_BYTES)
            .map_err(|e| HostError::io(format!("rotating {}", path.display()), e))?;
        std::fs::OpenOptions::new()
            .create(true)
            .append(true)
            .open(path)
            .map_err(|e| HostError::io(format!("opening {}", path.display()), e))
    }
}

fn rotate_if_large(path: &Path, max_bytes: u64) -> std::io::Result<()> {
    match std::fs::metadata(path) {
        Ok(meta) if meta.len() > max_bytes => {
            let mut rotated = path.as_os_str().to_owned();
            rotated.push(".1");
            std::fs::rename(path, rotated)
        }
        Ok(_) => Ok(()),
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(()),
        Err(e) => Err(e),
    }
}

#[async_trait]
impl Launcher for ProcessLauncher {
    async fn start(
        &self,
        descriptor: &PluginDescriptor,
        server_addr: &str,
    ) -> HostResult<Box<dyn PluginProcess>> {
        let logs_dir = self.paths.logs_dir();
        tokio::fs::create_dir_all(&logs_dir)
            .await
            .map_err(|e| HostError::io(format!("creating {}", logs_dir.display()), e))?;
        let stdout = self.open_log(&self.paths.stdout_log(&descriptor.name))?;
        let stderr = self.open_log(&self.paths.stderr_log(&descriptor.name))?;

        let child = Command::new(&descriptor.path)
            .arg("--server")
            .arg(server_addr)
            .stdin(Stdio::null())
            .stdout(Stdio::from(stdout))
            .stderr(Stdio::from(stderr))
            .kill_on_drop(true)
            .spawn()
            .map_err(|source| HostError::Spawn {
                plugin: descriptor.name.clone(),
                source,
            })?;

        log::info!(
            "ProcessLauncher: started '{}' (pid {:?}) from {}",
            descriptor.name,
            child.id(),
            descriptor.path.display()
        );
        Ok(Box::new(ChildProcess {
            name: descriptor.name.clone(),
            child,
        }))
    }
}

struct ChildProcess {
    name: String,
    child: Child,
}

#[async_trait]
impl PluginProcess for ChildProcess {
    fn id(&self) -> Option<u32> {
        self.child.id()
    }

    async fn terminate(&mut self, grace: Duration) -> HostResult<()> {
        if let Ok(Some(status)) = self.child.try_wait() {
            log::debug!("ChildProcess[{}]: already exited ({})", self.name, status);
            return Ok(());
        }

        #[cfg(unix)]
        if let Some(pid) = self.child.id() {
            // SAFETY: pid belongs to a child we have not yet reaped
            unsafe {
                libc::kill(pid as libc::pid_t, libc::SIGTERM);
            }
            if let Ok(status) = tokio::time::timeout(grace, self.child.wait()).await {
                log::debug!("ChildProcess[{}]: exited after SIGTERM ({:?})", self.name, status);
                return Ok(());
            }
        }
        #[cfg(not(unix))]
        let _ = grace;

        log::debug!("ChildProcess[{}]: killing", self.name);
        match self.child.kill().await {
            Ok(()) => Ok(()),
            Err(e) if e.kind() == std::io::ErrorKind::InvalidInput => Ok(()),
            Err(e) => Err(HostError::io(format!("killing plugin '{}'", self.name), e)),
        }
    }
}

/// Live process handles keyed by plugin name
pub struct ProcessTable {
    launcher: Arc<dyn Launcher>,
    handles: Mutex<HashMap<String, Box<dyn PluginProcess>>>,
    grace: Duration,
}

impl ProcessTable {
    pub fn new(launcher: Arc<dyn Launcher>, grace: Duration) -> Self {
        Self {
            launcher,
            handles: Mutex::new(HashMap::new()),
            grace,
        }
    }

    /// Start a plugin, stopping any process already running under its name
    pub async fn start(&self, descriptor: &PluginDescriptor, server_addr: &str) -> HostResult<()> {
        let handle = self.launcher.start(descriptor, server_addr).await?;
        let previous = self
            .handles
            .lock()
            .await
            .insert(descriptor.name.clone(), handle);
        if let Some(previous) = previous {
            log::debug!("ProcessTable: replacing running '{}'", descriptor.name);
            self.stop_handle(&descriptor.name, previous).await;
        }
        Ok(())
    }

    /// Track the handle started as `from` under `to`, the name its plugin registered with
    pub async fn rekey(&self, from: &str, to: &str) {
        let mut handles = self.handles.lock().await;
        let Some(handle) = handles.remove(from) else {
            return;
        };
        let previous = handles.insert(to.to_string(), handle);
        drop(handles);
        log::debug!("ProcessTable: '{}' now tracked as '{}'", from, to);
        if let Some(previous) = previous {
            self.stop_handle(to, previous).await;
        }
    }

    /// Stop the process for `name`; false if none was tracked
    pub async fn stop(&self, name: &str) -> bool {
        let handle = self.handles.lock().await.remove(name);
        match handle {
            Some(handle) => {
                self.stop_handle(name, handle).await;
                true
            }
            None => false,
        }
    }

    pub async fn stop_all(&self) {
        let handles: Vec<_> = self.handles.lock().await.drain().collect();
        let stops = handles
            .into_iter()
            .map(|(name, handle)| async move { self.stop_handle(&name, handle).await });
        futures::future::join_all(stops).await;
    }

    async fn stop_handle(&self, name: &str, handle: Box<dyn PluginProcess>) {
        if let Err(e) = self.launcher.stop(handle, self.grace).await {
            log::warn!("ProcessTable: failed to stop '{}': {}", name, e);
        }
    }

    pub async fn contains(&self, name: &str) -> bool {
        self.handles.lock().await.contains_key(name)
    }

    pub async fn len(&self) -> usize {
        self.handles.lock().await.len()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    #[test]
    fn test_large_logs_are_rotated() {
        let dir = TempDir::new().unwrap();
        let log = dir.path().join("aws.out.logs");
        std::fs::write(&log, vec![b'x'; 64]).unwrap();

        rotate_if_large(&log, 100).unwrap();
        assert!(log.exists(), "small log stays");

        rotate_if_large(&log, 10).unwrap();
        assert!(!log.exists());
        assert!(dir.path().join("aws.out.logs.1").exists());

        rotate_if_large(&dir.path().join("missing"), 10).unwrap();
    }

    #[tokio::test]
    async fn test_missing_executable_is_spawn_error() {
        let dir = TempDir::new().unwrap();
        let launcher = ProcessLauncher::new(KaytuPaths::new(dir.path()));
        let descriptor = PluginDescriptor {
            name: "kaytu-io/ghost".into(),
            path: dir.path().join("plugins").join("ghost"),
            ..PluginDescriptor::default()
        };

        let err = launcher
            .start(&descriptor, "127.0.0.1:1")
            .await
            .err()
            .expect("spawn should fail");
        assert_eq!(err.kind(), "SpawnError");
        assert!(
            dir.path().join("logs").join("kaytu-io_ghost.err.logs").exists(),
            "log files are created before spawning"
        );
    }

    #[cfg(unix)]
    #[tokio::test]
    async fn test_terminate_stops_running_child() {
        let dir = TempDir::new().unwrap();
        let launcher = ProcessLauncher::new(KaytuPaths::new(dir.path()));
        let script = dir.path().join("sleepy.sh");
        std::fs::write(&script, "#!/bin/sh\nexec sleep 30\n").unwrap();
        {
            use std::os::unix::fs::PermissionsExt;
            std::fs::set_permissions(&script, std::fs::Permissions::from_mode(0o755)).unwrap();
        }
        let descriptor = PluginDescriptor {
            name: "sleepy".into(),
            path: script,
            ..PluginDescriptor::default()
        };

        let mut handle = launcher.start(&descriptor, "127.0.0.1:1").await.unwrap();
        assert!(handle.id().is_some());
        tokio::time::timeout(
            Duration::from_secs(10),
            handle.terminate(Duration::from_millis(500)),
        )
        .await
        .expect("terminate should not hang")
        .unwrap();
    }
}
