//! Plugin Host Integration Tests
//!
//! Install, command, re-evaluation, crash and version checks driven through
//! `PluginManager` against scripted plugins connected over TCP.

mod common;

use common::*;
use kaytu::config::{Config, ConfigStore, KaytuPaths};
use kaytu::plugin::{
    HostError, HostSinks, InstallOutcome, InstallRequest, PluginManager, SinkReceivers,
};
use kaytu::protocol::PreferenceItem;
use kaytu::release::Platform;
use std::collections::BTreeMap;
use std::sync::Arc;
use std::time::Duration;
use tempfile::TempDir;

struct Host {
    _dir: TempDir,
    paths: KaytuPaths,
    manager: PluginManager,
    launcher: Arc<InProcessLauncher>,
    plugin: ScriptedPlugin,
}

/// Host with `my-plugin` published and installed
async fn installed_host() -> Host {
    let dir = TempDir::new().unwrap();
    let paths = KaytuPaths::new(dir.path());
    let launcher = InProcessLauncher::new();
    let releases = FakeReleases::new();
    releases.publish("kaytu-io/plugin-my-plugin", "1.0", &[Platform::current()]);
    let plugin = ScriptedPlugin::new(register_config("my-plugin", "scan"), Script::SingleItem);
    launcher.provide("my-plugin", plugin.clone());

    let manager = PluginManager::new(options(&paths, &launcher, &releases)).unwrap();
    manager.start_server().await.unwrap();
    let outcome = manager
        .install(&InstallRequest::new("my-plugin"))
        .await
        .unwrap();
    assert!(matches!(outcome, InstallOutcome::Installed(_)));

    Host {
        _dir: dir,
        paths,
        manager,
        launcher,
        plugin,
    }
}

async fn next_ready(receivers: &mut SinkReceivers, plugin: &str) -> u64 {
    loop {
        let signal = tokio::time::timeout(WAIT, receivers.ready.recv())
            .await
            .expect("results ready in time")
            .expect("ready channel open");
        if signal.plugin == plugin {
            return signal.session;
        }
    }
}

#[tokio::test]
async fn test_install_registers_and_records_plugin() {
    let host = installed_host().await;

    assert!(host.manager.get_plugin("my-plugin").await.is_some());
    let installed = host.manager.installed_plugins().await.unwrap();
    assert_eq!(installed.len(), 1);
    assert_eq!(installed[0].name, "my-plugin");
    assert_eq!(installed[0].version, "1.0");
    assert_eq!(installed[0].path, host.paths.plugin_executable("my-plugin", ""));
    assert_eq!(
        tokio::fs::read(&installed[0].path).await.unwrap(),
        PLUGIN_BYTES
    );
    assert_eq!(host.launcher.log.started(), vec!["my-plugin".to_string()]);

    host.manager.shutdown().await;
}

#[tokio::test]
async fn test_command_runs_to_results_ready() {
    let host = installed_host().await;
    let (sinks, mut receivers) = HostSinks::wired();
    host.manager.set_sinks(sinks.clone());

    host.manager
        .start_command("scan", BTreeMap::new(), "T")
        .await
        .unwrap();
    next_ready(&mut receivers, "my-plugin").await;

    let jobs = sinks.jobs.as_ref().unwrap();
    assert_eq!(jobs.running_count(), 0);
    assert_eq!(jobs.failed_count(), 0);
    let items = sinks.items.as_ref().unwrap().items();
    assert_eq!(items.len(), 1);
    assert_eq!(items[0].item.id, "r1");
    assert_eq!(items[0].item.savings(), 4.0);

    tokio::time::sleep(Duration::from_millis(100)).await;
    assert!(receivers.ready.try_recv().is_err(), "ready fired twice");
    assert_eq!(host.plugin.start_calls(), 1);

    host.manager.shutdown().await;
}

#[tokio::test]
async fn test_re_evaluate_replaces_item() {
    let host = installed_host().await;
    let (sinks, mut receivers) = HostSinks::wired();
    host.manager.set_sinks(sinks.clone());

    host.manager
        .start_command("scan", BTreeMap::new(), "T")
        .await
        .unwrap();
    let session = next_ready(&mut receivers, "my-plugin").await;

    let preference = PreferenceItem::new("EC2Instance", "Region").with_value("us-east-1");
    host.manager
        .re_evaluate("r1", vec![preference])
        .await
        .unwrap();
    next_ready(&mut receivers, "my-plugin").await;

    let store = sinks.items.as_ref().unwrap();
    let items = store.items();
    assert_eq!(items.len(), 1);
    assert_eq!(items[0].item.savings(), 2.0);
    let current = store.get(session, "r1").unwrap();
    assert_eq!(current.right_sized_cost(), 8.0);
    assert_eq!(host.plugin.calls.re_evaluate.load(std::sync::atomic::Ordering::SeqCst), 1);

    host.manager.shutdown().await;
}

#[tokio::test]
async fn test_crashed_session_does_not_disturb_others() {
    let dir = TempDir::new().unwrap();
    let paths = KaytuPaths::new(dir.path());
    let launcher = InProcessLauncher::new();
    let releases = FakeReleases::new();
    launcher.provide(
        "a",
        ScriptedPlugin::new(register_config("a", "scan-a"), Script::Hang),
    );
    launcher.provide(
        "b",
        ScriptedPlugin::new(
            register_config("b", "scan-b"),
            Script::Slow {
                count: 5,
                interval: Duration::from_millis(100),
            },
        ),
    );

    let mut config = Config::default();
    config.upsert_plugin(descriptor(&paths, "a", "scan-a"));
    config.upsert_plugin(descriptor(&paths, "b", "scan-b"));
    ConfigStore::for_paths(&paths).save(&config).await.unwrap();

    let manager = PluginManager::new(options(&paths, &launcher, &releases)).unwrap();
    let (sinks, mut receivers) = HostSinks::wired();
    manager.set_sinks(sinks.clone());
    manager.start_server().await.unwrap();
    for command in ["scan-a", "scan-b"] {
        let descriptor = manager.start_plugin(command).await.unwrap();
        manager
            .wait_for_plugin(&descriptor.name, WAIT)
            .await
            .unwrap();
    }

    manager
        .start_command("scan-a", BTreeMap::new(), "")
        .await
        .unwrap();
    manager
        .start_command("scan-b", BTreeMap::new(), "")
        .await
        .unwrap();

    let jobs = sinks.jobs.clone().unwrap();
    eventually("job of a to run", || {
        let jobs = jobs.clone();
        async move { jobs.is_running("a", "hang") }
    })
    .await;
    launcher.log.crash("a");

    let host = &manager;
    eventually("a to leave the registry", || async move {
        host.get_plugin("a").await.is_none()
    })
    .await;
    let error = tokio::time::timeout(WAIT, receivers.errors.recv())
        .await
        .unwrap()
        .unwrap();
    assert_eq!(error.plugin, "a");
    assert!(matches!(error.error, HostError::Transport(_)));

    next_ready(&mut receivers, "b").await;
    let from_b = sinks
        .items
        .as_ref()
        .unwrap()
        .items()
        .into_iter()
        .filter(|s| s.plugin == "b")
        .count();
    assert_eq!(from_b, 5);
    assert!(manager.get_plugin("b").await.is_some());
    assert!(!jobs.is_running("a", "hang"));

    eventually("a's handle to be terminated", || {
        let log = launcher.log.clone();
        async move { log.terminated().contains(&"a".to_string()) }
    })
    .await;
    assert!(!launcher.log.terminated().contains(&"b".to_string()));

    manager.shutdown().await;
}

#[tokio::test]
async fn test_plugin_requiring_newer_host_is_rejected() {
    let dir = TempDir::new().unwrap();
    let paths = KaytuPaths::new(dir.path());
    let launcher = InProcessLauncher::new();
    let releases = FakeReleases::new();
    releases.publish("kaytu-io/plugin-old", "1.0", &[Platform::current()]);

    let mut config = register_config("old", "scan");
    config.commands[0].min_host_version = "v9.9.9".into();
    let plugin = ScriptedPlugin::new(config, Script::SingleItem);
    launcher.provide("old", plugin.clone());

    let manager = PluginManager::new(
        options(&paths, &launcher, &releases).with_host_version("v0.1.0"),
    )
    .unwrap();
    let (sinks, mut receivers) = HostSinks::wired();
    manager.set_sinks(sinks);
    manager.start_server().await.unwrap();

    let err = manager
        .install(&InstallRequest::new("old"))
        .await
        .unwrap_err();
    assert!(matches!(err, HostError::VersionMismatch { .. }), "{err}");

    let surfaced = tokio::time::timeout(WAIT, receivers.errors.recv())
        .await
        .unwrap()
        .unwrap();
    assert!(surfaced.error.to_string().starts_with("VersionMismatch"));

    assert_eq!(plugin.start_calls(), 0);
    assert!(manager.get_plugin("old").await.is_none());
    assert!(manager.installed_plugins().await.unwrap().is_empty());
    assert!(!paths.plugin_executable("old", "").exists());

    manager.shutdown().await;
}

#[tokio::test]
async fn test_login_required_command_needs_a_token() {
    let dir = TempDir::new().unwrap();
    let paths = KaytuPaths::new(dir.path());
    let launcher = InProcessLauncher::new();
    let releases = FakeReleases::new();
    releases.publish("kaytu-io/plugin-guarded", "1.0", &[Platform::current()]);

    let mut config = register_config("guarded", "scan");
    config.commands[0].login_required = true;
    let plugin = ScriptedPlugin::new(config, Script::SingleItem);
    launcher.provide("guarded", plugin.clone());

    let manager = PluginManager::new(options(&paths, &launcher, &releases)).unwrap();
    let (sinks, mut receivers) = HostSinks::wired();
    manager.set_sinks(sinks);
    manager.start_server().await.unwrap();
    manager
        .install(&InstallRequest::new("guarded"))
        .await
        .unwrap();

    let err = manager
        .start_command("scan", BTreeMap::new(), "")
        .await
        .unwrap_err();
    assert!(matches!(err, HostError::LoginRequired(ref c) if c == "scan"));
    assert_eq!(plugin.start_calls(), 0);

    manager
        .start_command("scan", BTreeMap::new(), "T")
        .await
        .unwrap();
    next_ready(&mut receivers, "guarded").await;
    assert_eq!(plugin.start_calls(), 1);

    manager.shutdown().await;
}
