//! Plugin Manager
//!
//! Top-level controller of the plugin host. Owns the RPC endpoint, the
//! session registry, the running plugin processes and the output sinks, and
//! exposes install, launch and command operations on top of them.
//!
//! ```text
//!  Idle --start_server--> Listening --plugin registers--> Running(n)
//!  Running(n) --session closes--> Running(n-1) | Listening
//!  any --shutdown--> Stopped
//! ```

use crate::config::{Config, ConfigError, ConfigStore, KaytuPaths, PluginDescriptor};
use crate::core::retry::RetryPolicy;
use crate::core::version::host_version;
use crate::plugin::endpoint::RpcEndpoint;
use crate::plugin::error::{HostError, HostResult};
use crate::plugin::installer::{InstallOutcome, InstallRequest, Installer, REGISTRATION_TIMEOUT};
use crate::plugin::launcher::{Launcher, ProcessLauncher, ProcessTable, DEFAULT_STOP_GRACE};
use crate::plugin::registry::SessionRegistry;
use crate::plugin::session::PluginSession;
use crate::plugin::sinks::HostSinks;
use crate::protocol::{PreferenceItem, StartProcess};
use crate::release::{GithubReleases, Platform, ReleaseIndex};
use std::collections::BTreeMap;
use std::net::SocketAddr;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex, PoisonError, RwLock};
use std::time::Duration;
use tokio::sync::watch;
use tokio::task::JoinHandle;

/// State shared between the manager, the endpoint and every router task
pub(crate) struct HostShared {
    pub(crate) registry: SessionRegistry,
    pub(crate) processes: ProcessTable,
    sinks: RwLock<Arc<HostSinks>>,
    pub(crate) host_version: String,
    pub(crate) paths: KaytuPaths,
    pub(crate) store: ConfigStore,
}

impl HostShared {
    pub(crate) fn new(
        paths: KaytuPaths,
        launcher: Arc<dyn Launcher>,
        stop_grace: Duration,
        host_version: String,
    ) -> Self {
        Self {
            registry: SessionRegistry::new(),
            processes: ProcessTable::new(launcher, stop_grace),
            sinks: RwLock::new(Arc::new(HostSinks::default())),
            host_version,
            store: ConfigStore::for_paths(&paths),
            paths,
        }
    }

    /// Snapshot of the currently wired sinks
    pub(crate) fn sinks(&self) -> Arc<HostSinks> {
        self.sinks
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .clone()
    }

    pub(crate) fn set_sinks(&self, sinks: HostSinks) {
        *self.sinks.write().unwrap_or_else(PoisonError::into_inner) = Arc::new(sinks);
    }
}

/// Construction parameters for [`PluginManager`]
pub struct ManagerOptions {
    pub paths: KaytuPaths,
    /// 0 binds an ephemeral port
    pub port: u16,
    pub host_version: String,
    pub launcher: Option<Arc<dyn Launcher>>,
    pub release_index: Option<Arc<dyn ReleaseIndex>>,
    pub platform: Platform,
    pub registration_timeout: Duration,
    pub stop_grace: Duration,
    pub retry: RetryPolicy,
}

impl ManagerOptions {
    pub fn new(paths: KaytuPaths) -> Self {
        Self {
            paths,
            port: 0,
            host_version: host_version(),
            launcher: None,
            release_index: None,
            platform: Platform::current(),
            registration_timeout: REGISTRATION_TIMEOUT,
            stop_grace: DEFAULT_STOP_GRACE,
            retry: RetryPolicy::default(),
        }
    }

    pub fn with_port(mut self, port: u16) -> Self {
        self.port = port;
        self
    }

    pub fn with_host_version(mut self, version: impl Into<String>) -> Self {
        self.host_version = version.into();
        self
    }

    pub fn with_launcher(mut self, launcher: Arc<dyn Launcher>) -> Self {
        self.launcher = Some(launcher);
        self
    }

    pub fn with_release_index(mut self, index: Arc<dyn ReleaseIndex>) -> Self {
        self.release_index = Some(index);
        self
    }

    pub fn with_platform(mut self, platform: Platform) -> Self {
        self.platform = platform;
        self
    }

    pub fn with_registration_timeout(mut self, timeout: Duration) -> Self {
        self.registration_timeout = timeout;
        self
    }

    pub fn with_stop_grace(mut self, grace: Duration) -> Self {
        self.stop_grace = grace;
        self
    }

    pub fn with_retry(mut self, retry: RetryPolicy) -> Self {
        self.retry = retry;
        self
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ManagerState {
    Idle,
    Listening,
    /// Listening with this many registered sessions
    Running(usize),
    Stopped,
}

struct ServerHandle {
    addr: SocketAddr,
    shutdown: watch::Sender<bool>,
    task: JoinHandle<()>,
}

pub struct PluginManager {
    shared: Arc<HostShared>,
    installer: Installer,
    port: u16,
    server: Mutex<Option<ServerHandle>>,
    stopped: AtomicBool,
}

impl PluginManager {
    pub fn new(options: ManagerOptions) -> HostResult<Self> {
        let launcher = match options.launcher {
            Some(launcher) => launcher,
            None => Arc::new(ProcessLauncher::new(options.paths.clone())),
        };
        let index = match options.release_index {
            Some(index) => index,
            None => Arc::new(GithubReleases::new()?),
        };
        let shared = Arc::new(HostShared::new(
            options.paths,
            launcher,
            options.stop_grace,
            options.host_version,
        ));
        Ok(Self {
            shared,
            installer: Installer::new(
                index,
                options.platform,
                options.registration_timeout,
                options.retry,
            ),
            port: options.port,
            server: Mutex::new(None),
            stopped: AtomicBool::new(false),
        })
    }

    /// Bind the RPC endpoint and start accepting plugin streams
    ///
    /// Calling it again returns the port already bound.
    pub async fn start_server(&self) -> HostResult<u16> {
        if let Some(addr) = self.server_addr() {
            return Ok(addr.port());
        }
        let endpoint = RpcEndpoint::bind(self.port).await?;
        let addr = endpoint.local_addr();

        let mut server = self.server.lock().unwrap_or_else(PoisonError::into_inner);
        if let Some(existing) = server.as_ref() {
            return Ok(existing.addr.port());
        }
        let (shutdown, shutdown_rx) = watch::channel(false);
        let task = endpoint.spawn(self.shared.clone(), shutdown_rx);
        *server = Some(ServerHandle {
            addr,
            shutdown,
            task,
        });
        self.stopped.store(false, Ordering::Release);
        log::info!("PluginManager: plugin server listening on {}", addr);
        Ok(addr.port())
    }

    pub fn server_addr(&self) -> Option<SocketAddr> {
        self.server
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .as_ref()
            .map(|s| s.addr)
    }

    fn require_server(&self) -> HostResult<String> {
        self.server_addr()
            .map(|addr| addr.to_string())
            .ok_or(HostError::NotListening)
    }

    pub async fn state(&self) -> ManagerState {
        if self.stopped.load(Ordering::Acquire) {
            return ManagerState::Stopped;
        }
        if self.server_addr().is_none() {
            return ManagerState::Idle;
        }
        match self.shared.registry.len().await {
            0 => ManagerState::Listening,
            n => ManagerState::Running(n),
        }
    }

    pub fn paths(&self) -> &KaytuPaths {
        &self.shared.paths
    }

    pub fn host_version(&self) -> &str {
        &self.shared.host_version
    }

    pub fn registry(&self) -> &SessionRegistry {
        &self.shared.registry
    }

    pub async fn install(&self, request: &InstallRequest) -> HostResult<InstallOutcome> {
        let server_addr = self.require_server()?;
        self.installer
            .install(&self.shared, &server_addr, request)
            .await
    }

    pub async fn uninstall(&self, name: &str) -> HostResult<PluginDescriptor> {
        self.installer.uninstall(&self.shared, name).await
    }

    pub async fn installed_plugins(&self) -> HostResult<Vec<PluginDescriptor>> {
        Ok(self.shared.store.load_lenient().await?.plugins)
    }

    /// Launch the installed plugin that provides `command`
    ///
    /// Returns once the process is spawned; use [`Self::wait_for_plugin`] to
    /// wait for its registration.
    pub async fn start_plugin(&self, command: &str) -> HostResult<PluginDescriptor> {
        let server_addr = self.require_server()?;
        let config = self.shared.store.load_lenient().await?;
        let descriptor = config
            .plugin_for_command(command)
            .cloned()
            .ok_or_else(|| HostError::NotFound(format!("plugin providing command '{command}'")))?;

        self.shared.registry.clear_rejection(&descriptor.name).await;
        self.shared
            .processes
            .start(&descriptor, &server_addr)
            .await?;
        Ok(descriptor)
    }

    pub async fn get_plugin(&self, name: &str) -> Option<Arc<PluginSession>> {
        self.shared.registry.get(name).await
    }

    pub async fn wait_for_plugin(
        &self,
        name: &str,
        timeout: Duration,
    ) -> HostResult<Arc<PluginSession>> {
        self.shared
            .registry
            .wait_for(name, timeout)
            .await
            .map_err(|e| HostError::registration_wait(name, timeout, e))
    }

    /// The most recently registered session
    pub async fn stream(&self) -> Option<Arc<PluginSession>> {
        self.shared.registry.most_recent().await
    }

    /// Send `StartProcess` to the session advertising `command`
    pub async fn start_command(
        &self,
        command: &str,
        flags: BTreeMap<String, String>,
        access_token: &str,
    ) -> HostResult<Arc<PluginSession>> {
        let session = self
            .shared
            .registry
            .find_by_command(command)
            .await
            .ok_or_else(|| HostError::NotFound(format!("session for command '{command}'")))?;

        let login_required = session
            .config()
            .command(command)
            .is_some_and(|c| c.login_required);
        if login_required && access_token.is_empty() {
            return Err(HostError::LoginRequired(command.to_string()));
        }

        session.start_process(StartProcess {
            command: command.to_string(),
            flags,
            access_token: access_token.to_string(),
        })?;
        Ok(session)
    }

    /// Ask the session that produced item `id` to evaluate it again
    pub async fn re_evaluate(&self, id: &str, preferences: Vec<PreferenceItem>) -> HostResult<()> {
        let owner = match self.shared.sinks().items.as_ref().and_then(|items| items.find(id)) {
            Some(stored) => self.shared.registry.get_by_id(stored.session).await,
            None => None,
        };
        let session = match owner {
            Some(session) => session,
            None => self
                .stream()
                .await
                .ok_or_else(|| HostError::NotFound(format!("session for item '{id}'")))?,
        };
        session.re_evaluate(id, preferences)
    }

    /// Replace the output sinks; sessions pick them up on their next message
    pub fn set_sinks(&self, sinks: HostSinks) {
        self.shared.set_sinks(sinks);
    }

    pub fn sinks(&self) -> Arc<HostSinks> {
        self.shared.sinks()
    }

    /// Load the config file, clearing an expired access token
    ///
    /// An expired token is removed on disk and the re-login sink is notified;
    /// the cleared config is returned.
    pub async fn load_config(&self) -> HostResult<Config> {
        match self.shared.store.load().await {
            Ok(config) => Ok(config),
            Err(ConfigError::TokenExpired { config }) => {
                log::info!("PluginManager: access token expired; clearing it");
                if let Err(e) = self.shared.store.save(&config).await {
                    log::warn!("PluginManager: could not save cleared token: {}", e);
                }
                self.shared.sinks().request_relogin();
                Ok(*config)
            }
            Err(e) => Err(e.into()),
        }
    }

    /// Stop accepting streams, close every session and stop every child
    pub async fn shutdown(&self) {
        let server = self
            .server
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .take();
        self.stopped.store(true, Ordering::Release);

        for session in self.shared.registry.drain().await {
            session.terminate("host shutting down");
        }
        self.shared.processes.stop_all().await;

        if let Some(server) = server {
            let _ = server.shutdown.send(true);
            if tokio::time::timeout(Duration::from_secs(2), server.task)
                .await
                .is_err()
            {
                log::warn!("PluginManager: endpoint did not stop in time");
            }
        }
        log::debug!("PluginManager: shut down");
    }
}

impl Drop for PluginManager {
    fn drop(&mut self) {
        let server = self
            .server
            .get_mut()
            .unwrap_or_else(PoisonError::into_inner)
            .take();
        if let Some(server) = server {
            let _ = server.shutdown.send(true);
        }
    }
}
