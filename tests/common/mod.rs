//! Common test utilities and helpers
//!
//! A release index served from memory, a launcher that runs plugins as tasks
//! of the test runtime instead of child processes, and scripted plugins that
//! use the SDK runner so the host is exercised over a real TCP stream.

#![allow(dead_code)]

use async_trait::async_trait;
use kaytu::config::{KaytuPaths, PluginDescriptor};
use kaytu::core::progress::DownloadProgress;
use kaytu::plugin::{HostError, HostResult, Launcher, ManagerOptions, PluginProcess};
use kaytu::protocol::{
    CommandDescriptor, Device, OptimizationItem, ReEvaluate, RegisterConfig, StartProcess,
};
use kaytu::release::{
    Asset, Platform, Release, ReleaseError, ReleaseIndex, ReleaseResult, RepositoryRef,
};
use kaytu::sdk::{
    job_fn, JobProperties, PluginRunner, ProcessContext, Processor, SdkError, SdkResult,
};
use std::collections::HashMap;
use std::future::Future;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;
use tokio::io::AsyncWriteExt;
use tokio::sync::watch;
use tokio::task::JoinHandle;

pub const WAIT: Duration = Duration::from_secs(10);

/// Bytes written for every downloaded plugin
pub const PLUGIN_BYTES: &[u8] = b"#!/bin/sh\necho fake plugin\n";

/// Poll `check` until it holds or `WAIT` passes
pub async fn eventually<F, Fut>(what: &str, mut check: F)
where
    F: FnMut() -> Fut,
    Fut: Future<Output = bool>,
{
    let deadline = tokio::time::Instant::now() + WAIT;
    while !check().await {
        assert!(
            tokio::time::Instant::now() < deadline,
            "timed out waiting for {what}"
        );
        tokio::time::sleep(Duration::from_millis(20)).await;
    }
}

pub fn item(id: &str, current: f64, right_sized: f64) -> OptimizationItem {
    OptimizationItem {
        id: id.into(),
        name: format!("instance {id}"),
        resource_type: "m5.large".into(),
        region: "us-east-1".into(),
        devices: vec![Device {
            device_id: id.into(),
            current_cost: current,
            right_sized_cost: right_sized,
            ..Device::default()
        }],
        ..OptimizationItem::default()
    }
}

pub fn register_config(name: &str, command: &str) -> RegisterConfig {
    RegisterConfig {
        name: name.into(),
        version: "1.0".into(),
        commands: vec![CommandDescriptor {
            name: command.into(),
            ..CommandDescriptor::default()
        }],
        ..RegisterConfig::default()
    }
}

/// Descriptor of an installed plugin, as the installer would record it
pub fn descriptor(paths: &KaytuPaths, name: &str, command: &str) -> PluginDescriptor {
    PluginDescriptor::from_registration(
        &register_config(name, command),
        paths.plugin_executable(name, ""),
    )
}

/// What a scripted plugin does when asked to run its command
#[derive(Debug, Clone, Copy)]
pub enum Script {
    /// Job `j1` reports `r1` at 10 -> 6; re-evaluation reports 10 -> 8
    SingleItem,
    /// One job reporting `count` items `<prefix>0..`, one per `interval`
    Slow { count: usize, interval: Duration },
    /// One job that never finishes
    Hang,
}

#[derive(Debug, Default)]
pub struct Calls {
    pub start_process: AtomicUsize,
    pub re_evaluate: AtomicUsize,
}

#[derive(Clone)]
pub struct ScriptedPlugin {
    pub config: RegisterConfig,
    pub script: Script,
    pub calls: Arc<Calls>,
}

impl ScriptedPlugin {
    pub fn new(config: RegisterConfig, script: Script) -> Self {
        Self {
            config,
            script,
            calls: Arc::new(Calls::default()),
        }
    }

    pub fn start_calls(&self) -> usize {
        self.calls.start_process.load(Ordering::SeqCst)
    }
}

#[async_trait]
impl Processor for ScriptedPlugin {
    fn config(&self) -> RegisterConfig {
        self.config.clone()
    }

    async fn start_process(&self, _request: StartProcess, ctx: ProcessContext) -> SdkResult<()> {
        self.calls.start_process.fetch_add(1, Ordering::SeqCst);
        let job_ctx = ctx.clone();
        match self.script {
            Script::SingleItem => {
                ctx.submit(job_fn(JobProperties::new("j1", "scanning"), move || {
                    let ctx = job_ctx.clone();
                    async move { ctx.send_item(item("r1", 10.0, 6.0)) }
                }))?;
            }
            Script::Slow { count, interval } => {
                let prefix = self.config.name.clone();
                ctx.submit(job_fn(JobProperties::new("slow", "slow scan"), move || {
                    let ctx = job_ctx.clone();
                    let prefix = prefix.clone();
                    async move {
                        for i in 0..count {
                            tokio::time::sleep(interval).await;
                            ctx.send_item(item(&format!("{prefix}{i}"), 5.0, 4.0))?;
                        }
                        Ok::<(), SdkError>(())
                    }
                }))?;
            }
            Script::Hang => {
                ctx.submit(job_fn(JobProperties::new("hang", "never ends"), || async {
                    std::future::pending::<()>().await;
                    Ok::<(), SdkError>(())
                }))?;
                return Ok(());
            }
        }
        ctx.finish_when_idle();
        Ok(())
    }

    async fn re_evaluate(&self, request: ReEvaluate, ctx: ProcessContext) -> SdkResult<()> {
        self.calls.re_evaluate.fetch_add(1, Ordering::SeqCst);
        ctx.send_item(item(&request.id, 10.0, 8.0))?;
        ctx.results_ready()
    }
}

/// Starts, terminations and crash switches shared by a launcher's handles
#[derive(Default)]
pub struct LaunchLog {
    started: Mutex<Vec<String>>,
    terminated: Mutex<Vec<String>>,
    switches: Mutex<HashMap<String, Arc<watch::Sender<bool>>>>,
}

impl LaunchLog {
    pub fn started(&self) -> Vec<String> {
        self.started.lock().unwrap().clone()
    }

    pub fn terminated(&self) -> Vec<String> {
        self.terminated.lock().unwrap().clone()
    }

    /// Drop the plugin's stream without telling the host
    pub fn crash(&self, name: &str) {
        let switch = self.switches.lock().unwrap().get(name).cloned();
        switch.expect("plugin was never started").send_replace(true);
    }
}

/// Runs scripted plugins on the test runtime
#[derive(Default)]
pub struct InProcessLauncher {
    plugins: Mutex<HashMap<String, ScriptedPlugin>>,
    pub log: Arc<LaunchLog>,
}

impl InProcessLauncher {
    pub fn new() -> Arc<Self> {
        Arc::new(Self::default())
    }

    /// Serve `plugin` whenever an installed plugin called `name` is started
    pub fn provide(&self, name: &str, plugin: ScriptedPlugin) {
        self.plugins
            .lock()
            .unwrap()
            .insert(name.to_string(), plugin);
    }
}

struct InProcessPlugin {
    name: String,
    stop: Arc<watch::Sender<bool>>,
    task: Option<JoinHandle<()>>,
    log: Arc<LaunchLog>,
}

#[async_trait]
impl PluginProcess for InProcessPlugin {
    fn id(&self) -> Option<u32> {
        None
    }

    async fn terminate(&mut self, grace: Duration) -> HostResult<()> {
        self.stop.send_replace(true);
        if let Some(task) = self.task.take() {
            let abort = task.abort_handle();
            if tokio::time::timeout(grace, task).await.is_err() {
                abort.abort();
            }
        }
        self.log.terminated.lock().unwrap().push(self.name.clone());
        Ok(())
    }
}

#[async_trait]
impl Launcher for InProcessLauncher {
    async fn start(
        &self,
        descriptor: &PluginDescriptor,
        server_addr: &str,
    ) -> HostResult<Box<dyn PluginProcess>> {
        let plugin = self
            .plugins
            .lock()
            .unwrap()
            .get(&descriptor.name)
            .cloned()
            .ok_or_else(|| HostError::Spawn {
                plugin: descriptor.name.clone(),
                source: std::io::Error::new(std::io::ErrorKind::NotFound, "no scripted plugin"),
            })?;

        let (stop, stopped) = watch::channel(false);
        let stop = Arc::new(stop);
        self.log
            .switches
            .lock()
            .unwrap()
            .insert(descriptor.name.clone(), stop.clone());
        self.log.started.lock().unwrap().push(descriptor.name.clone());

        let addr = server_addr.to_string();
        let task = tokio::spawn(async move {
            if let Err(e) = PluginRunner::new(plugin).run_until(&addr, stopped).await {
                log::debug!("scripted plugin ended: {e}");
            }
        });
        Ok(Box::new(InProcessPlugin {
            name: descriptor.name.clone(),
            stop,
            task: Some(task),
            log: self.log.clone(),
        }))
    }
}

/// Release index holding one release per repository
#[derive(Default)]
pub struct FakeReleases {
    releases: Mutex<HashMap<String, Release>>,
    approved: Mutex<Vec<String>>,
    downloads: AtomicUsize,
}

impl FakeReleases {
    pub fn new() -> Arc<Self> {
        Arc::new(Self::default())
    }

    /// Publish `version` of `full_name` with one asset per platform
    pub fn publish(&self, full_name: &str, version: &str, platforms: &[Platform]) {
        let assets = platforms
            .iter()
            .enumerate()
            .map(|(i, p)| Asset {
                id: i as u64 + 1,
                name: format!("plugin_{version}_{p}"),
                size: PLUGIN_BYTES.len() as u64,
                ..Asset::default()
            })
            .collect();
        self.releases.lock().unwrap().insert(
            full_name.to_string(),
            Release {
                tag_name: format!("v{version}"),
                assets,
            },
        );
        self.approved.lock().unwrap().push(full_name.to_string());
    }

    pub fn downloads(&self) -> usize {
        self.downloads.load(Ordering::SeqCst)
    }
}

#[async_trait]
impl ReleaseIndex for FakeReleases {
    async fn latest_release(
        &self,
        repo: &RepositoryRef,
        _auth_token: Option<&str>,
    ) -> ReleaseResult<Release> {
        self.releases
            .lock()
            .unwrap()
            .get(&repo.full_name())
            .cloned()
            .ok_or_else(|| ReleaseError::NotFound(repo.full_name()))
    }

    async fn download_asset(
        &self,
        _repo: &RepositoryRef,
        _asset: &Asset,
        _auth_token: Option<&str>,
        dest: &mut tokio::fs::File,
        progress: &mut DownloadProgress,
    ) -> ReleaseResult<u64> {
        self.downloads.fetch_add(1, Ordering::SeqCst);
        dest.write_all(PLUGIN_BYTES).await?;
        dest.flush().await?;
        progress.advance(PLUGIN_BYTES.len() as u64);
        Ok(PLUGIN_BYTES.len() as u64)
    }

    async fn approved_plugins(&self, _auth_token: Option<&str>) -> ReleaseResult<Vec<String>> {
        Ok(self.approved.lock().unwrap().clone())
    }
}

/// Manager options rooted at `paths` with the in-memory fakes wired in
pub fn options(
    paths: &KaytuPaths,
    launcher: &Arc<InProcessLauncher>,
    releases: &Arc<FakeReleases>,
) -> ManagerOptions {
    ManagerOptions::new(paths.clone())
        .with_launcher(launcher.clone())
        .with_release_index(releases.clone())
        .with_registration_timeout(WAIT)
        .with_stop_grace(Duration::from_secs(1))
}
