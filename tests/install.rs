//! Installer Integration Tests
//!
//! Platform selection, idempotent reinstall, approval and uninstall.

mod common;

use common::*;
use kaytu::config::{ConfigStore, KaytuPaths};
use kaytu::plugin::{HostError, InstallOutcome, InstallRequest, PluginManager};
use kaytu::release::Platform;
use kaytu::sdk::PluginRunner;
use tempfile::TempDir;
use tokio::sync::watch;

fn dir_listing(paths: &KaytuPaths) -> Vec<String> {
    match std::fs::read_dir(paths.plugins_dir()) {
        Ok(entries) => {
            let mut names: Vec<String> = entries
                .map(|e| e.unwrap().file_name().to_string_lossy().into_owned())
                .collect();
            names.sort();
            names
        }
        Err(_) => Vec::new(),
    }
}

#[tokio::test]
async fn test_platform_without_asset_is_unsupported() {
    let dir = TempDir::new().unwrap();
    let paths = KaytuPaths::new(dir.path());
    let launcher = InProcessLauncher::new();
    let releases = FakeReleases::new();
    releases.publish(
        "kaytu-io/plugin-my-plugin",
        "1.0",
        &[Platform::new("linux", "amd64"), Platform::new("darwin", "amd64")],
    );
    launcher.provide(
        "my-plugin",
        ScriptedPlugin::new(register_config("my-plugin", "scan"), Script::SingleItem),
    );

    let manager = PluginManager::new(
        options(&paths, &launcher, &releases).with_platform(Platform::new("linux", "arm64")),
    )
    .unwrap();
    manager.start_server().await.unwrap();
    let before = dir_listing(&paths);

    let err = manager
        .install(&InstallRequest::new("my-plugin"))
        .await
        .unwrap_err();
    match err {
        HostError::PlatformUnsupported { plugin, platform } => {
            assert_eq!(plugin, "kaytu-io/plugin-my-plugin");
            assert_eq!(platform, "linux_arm64");
        }
        other => panic!("expected PlatformUnsupported, got {other}"),
    }

    assert_eq!(dir_listing(&paths), before);
    assert_eq!(releases.downloads(), 0);
    assert!(launcher.log.started().is_empty());
    assert!(manager.installed_plugins().await.unwrap().is_empty());

    manager.shutdown().await;
}

#[tokio::test]
async fn test_reinstalling_same_version_is_a_no_op() {
    let dir = TempDir::new().unwrap();
    let paths = KaytuPaths::new(dir.path());
    let launcher = InProcessLauncher::new();
    let releases = FakeReleases::new();
    releases.publish("kaytu-io/plugin-my-plugin", "1.0", &[Platform::current()]);
    launcher.provide(
        "my-plugin",
        ScriptedPlugin::new(register_config("my-plugin", "scan"), Script::SingleItem),
    );

    let manager = PluginManager::new(options(&paths, &launcher, &releases)).unwrap();
    manager.start_server().await.unwrap();

    let first = manager
        .install(&InstallRequest::new("my-plugin"))
        .await
        .unwrap();
    assert!(matches!(first, InstallOutcome::Installed(_)));
    let store = ConfigStore::for_paths(&paths);
    let config_after_first = std::fs::read(store.path()).unwrap();
    let listing_after_first = dir_listing(&paths);

    let second = manager
        .install(&InstallRequest::new("my-plugin"))
        .await
        .unwrap();
    assert!(matches!(second, InstallOutcome::AlreadyInstalled(_)));
    assert_eq!(second.descriptor(), first.descriptor());

    assert_eq!(std::fs::read(store.path()).unwrap(), config_after_first);
    assert_eq!(dir_listing(&paths), listing_after_first);
    assert_eq!(releases.downloads(), 1);
    assert_eq!(launcher.log.started().len(), 1);
    assert_eq!(manager.registry().len().await, 1);

    manager.shutdown().await;
}

#[tokio::test]
async fn test_unapproved_plugin_needs_unsafe() {
    let dir = TempDir::new().unwrap();
    let paths = KaytuPaths::new(dir.path());
    let launcher = InProcessLauncher::new();
    let releases = FakeReleases::new();

    let manager = PluginManager::new(options(&paths, &launcher, &releases)).unwrap();
    manager.start_server().await.unwrap();

    let err = manager
        .install(&InstallRequest::new("github.com/acme/plugin-x"))
        .await
        .unwrap_err();
    assert!(matches!(err, HostError::NotApproved(ref name) if name == "acme/plugin-x"));
    assert_eq!(releases.downloads(), 0);

    manager.shutdown().await;
}

#[tokio::test]
async fn test_uninstall_removes_executable_and_entry() {
    let dir = TempDir::new().unwrap();
    let paths = KaytuPaths::new(dir.path());
    let launcher = InProcessLauncher::new();
    let releases = FakeReleases::new();
    releases.publish("kaytu-io/plugin-my-plugin", "1.0", &[Platform::current()]);
    launcher.provide(
        "my-plugin",
        ScriptedPlugin::new(register_config("my-plugin", "scan"), Script::SingleItem),
    );

    let manager = PluginManager::new(options(&paths, &launcher, &releases)).unwrap();
    manager.start_server().await.unwrap();
    let installed = manager
        .install(&InstallRequest::new("my-plugin"))
        .await
        .unwrap();
    let path = installed.descriptor().path.clone();
    assert!(path.exists());

    let removed = manager.uninstall("my-plugin").await.unwrap();
    assert_eq!(removed.name, "my-plugin");
    assert!(!path.exists());
    assert!(manager.installed_plugins().await.unwrap().is_empty());
    assert!(launcher.log.terminated().contains(&"my-plugin".to_string()));

    let host = &manager;
    eventually("session to close", || async move {
        host.get_plugin("my-plugin").await.is_none()
    })
    .await;

    manager.shutdown().await;
}

#[tokio::test]
async fn test_debug_install_records_plugin_started_by_hand() {
    let dir = TempDir::new().unwrap();
    let paths = KaytuPaths::new(dir.path());
    let launcher = InProcessLauncher::new();
    let releases = FakeReleases::new();

    let manager = PluginManager::new(options(&paths, &launcher, &releases)).unwrap();
    let port = manager.start_server().await.unwrap();

    let (stop, stopped) = watch::channel(false);
    let plugin = ScriptedPlugin::new(register_config("my-plugin", "scan"), Script::SingleItem);
    let by_hand = tokio::spawn(async move {
        PluginRunner::new(plugin)
            .run_until(&format!("127.0.0.1:{port}"), stopped)
            .await
    });

    let mut request = InstallRequest::new("my-plugin");
    request.debug_mode = true;
    request.allow_unapproved = true;
    let outcome = manager.install(&request).await.unwrap();
    assert_eq!(outcome.descriptor().name, "my-plugin");
    assert_eq!(outcome.descriptor().commands[0].name, "scan");

    let installed = manager.installed_plugins().await.unwrap();
    assert_eq!(installed.len(), 1);
    assert_eq!(releases.downloads(), 0);
    assert!(launcher.log.started().is_empty());

    stop.send_replace(true);
    let _ = by_hand.await;
    manager.shutdown().await;
}

#[tokio::test]
async fn test_upgrade_records_commands_of_new_version() {
    let dir = TempDir::new().unwrap();
    let paths = KaytuPaths::new(dir.path());
    let launcher = InProcessLauncher::new();
    let releases = FakeReleases::new();
    releases.publish("kaytu-io/plugin-my-plugin", "1.0", &[Platform::current()]);
    launcher.provide(
        "my-plugin",
        ScriptedPlugin::new(register_config("my-plugin", "scan"), Script::SingleItem),
    );

    let manager = PluginManager::new(options(&paths, &launcher, &releases)).unwrap();
    manager.start_server().await.unwrap();
    manager
        .install(&InstallRequest::new("my-plugin"))
        .await
        .unwrap();
    let first = manager.get_plugin("my-plugin").await.unwrap();

    releases.publish("kaytu-io/plugin-my-plugin", "2.0", &[Platform::current()]);
    launcher.provide(
        "my-plugin",
        ScriptedPlugin::new(register_config("my-plugin", "scan-v2"), Script::SingleItem),
    );
    let upgraded = manager
        .install(&InstallRequest::new("my-plugin"))
        .await
        .unwrap();
    assert!(matches!(upgraded, InstallOutcome::Installed(_)));
    assert_eq!(upgraded.descriptor().version, "2.0");
    assert_eq!(upgraded.descriptor().commands[0].name, "scan-v2");

    let installed = manager.installed_plugins().await.unwrap();
    assert_eq!(installed.len(), 1);
    assert_eq!(installed[0].version, "2.0");
    assert_eq!(installed[0].commands.len(), 1);
    assert_eq!(installed[0].commands[0].name, "scan-v2");

    let current = manager.get_plugin("my-plugin").await.unwrap();
    assert!(current.id() > first.id());
    assert_eq!(launcher.log.started().len(), 2);

    manager.shutdown().await;
}

#[tokio::test]
async fn test_plugin_registering_full_name_is_stopped_when_it_closes() {
    let dir = TempDir::new().unwrap();
    let paths = KaytuPaths::new(dir.path());
    let launcher = InProcessLauncher::new();
    let releases = FakeReleases::new();
    releases.publish("kaytu-io/plugin-my-plugin", "1.0", &[Platform::current()]);
    launcher.provide(
        "my-plugin",
        ScriptedPlugin::new(
            register_config("kaytu-io/plugin-my-plugin", "scan"),
            Script::SingleItem,
        ),
    );

    let manager = PluginManager::new(options(&paths, &launcher, &releases)).unwrap();
    manager.start_server().await.unwrap();
    let installed = manager
        .install(&InstallRequest::new("my-plugin"))
        .await
        .unwrap();
    assert_eq!(installed.descriptor().name, "kaytu-io/plugin-my-plugin");

    launcher.log.crash("my-plugin");
    let log = launcher.log.clone();
    eventually("the launched handle to be stopped", || {
        let log = log.clone();
        async move { log.terminated().contains(&"my-plugin".to_string()) }
    })
    .await;
    assert!(manager
        .get_plugin("kaytu-io/plugin-my-plugin")
        .await
        .is_none());

    manager.shutdown().await;
}
