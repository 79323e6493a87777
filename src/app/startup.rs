//! Application startup and command dispatch

use crate::app::cli::{self, CliRequest, Invocation};
use crate::app::display;
use crate::config::{ConfigStore, KaytuPaths, PluginDescriptor};
use crate::core::error_handling::{log_error_with_context, operator_message};
use crate::core::logging::init_logging;
use crate::core::shutdown::{ShutdownCoordinator, FORCED_EXIT_CODE};
use crate::core::version::{build_time, git_hash, host_version};
use crate::plugin::{
    HostError, HostResult, HostSinks, InstallOutcome, InstallRequest, ManagerOptions,
    PluginManager, SessionError, SinkReceivers, REGISTRATION_TIMEOUT,
};
use crate::release::{GithubReleases, UpdateChecker, UpdateStatus};
use std::collections::BTreeMap;
use std::io::IsTerminal;
use std::sync::Arc;
use std::time::Duration;

/// Fixed plugin server port used with `install --plugin-debug-mode`
pub const DEBUG_SERVER_PORT: u16 = 30422;

const UPDATE_CHECK_TIMEOUT: Duration = Duration::from_secs(3);

/// How a dispatched command ended
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Outcome {
    Done,
    Interrupted,
}

/// Parse arguments, run the command and exit with its status
pub fn startup() {
    let runtime = match tokio::runtime::Builder::new_multi_thread()
        .enable_all()
        .build()
    {
        Ok(runtime) => runtime,
        Err(e) => {
            eprintln!("Failed to start the async runtime: {e}");
            std::process::exit(1);
        }
    };
    let code = runtime.block_on(run());
    drop(runtime);
    std::process::exit(code);
}

async fn installed_plugins(paths: &KaytuPaths) -> (Vec<PluginDescriptor>, Option<String>) {
    match ConfigStore::for_paths(paths).load_lenient().await {
        Ok(config) => (config.plugins, None),
        Err(e) => (Vec::new(), Some(e.to_string())),
    }
}

async fn run() -> i32 {
    let paths = match KaytuPaths::from_home() {
        Ok(paths) => paths,
        Err(e) => {
            eprintln!("{e}");
            return 1;
        }
    };

    // Installed plugins shape the command tree, so read them before parsing
    let (plugins, config_problem) = installed_plugins(&paths).await;
    let color = std::io::stdout().is_terminal() && std::env::var_os("NO_COLOR").is_none();
    let request = match cli::parse_from(&plugins, color, std::env::args_os()) {
        Ok(request) => request,
        Err(e) => {
            let _ = e.print();
            return e.exit_code();
        }
    };
    let color = color && !request.globals.no_color;

    if let Err(e) = init_logging(
        request.globals.log_level.as_deref(),
        request.globals.log_format.as_deref(),
        request.globals.log_file.as_deref(),
        color && std::io::stderr().is_terminal(),
    ) {
        eprintln!("Failed to initialise logging: {e}");
    }
    log::debug!("kaytu {} starting", host_version());
    if let Some(problem) = config_problem {
        log::warn!("Could not read installed plugins: {}", problem);
    }

    let (shutdown, _rx) = ShutdownCoordinator::new();
    shutdown.install_signal_handlers();

    if !matches!(request.invocation, Invocation::Version) {
        report_update(&paths).await;
    }

    match dispatch(&paths, request, color, &shutdown).await {
        Ok(Outcome::Done) => 0,
        Ok(Outcome::Interrupted) => {
            eprintln!("Interrupted");
            FORCED_EXIT_CODE
        }
        Err(e) => {
            log_error_with_context(&e, "command failed");
            eprintln!("{}", operator_message(&e, "command failed"));
            1
        }
    }
}

/// Best-effort notice about a newer host release
async fn report_update(paths: &KaytuPaths) {
    let index = match GithubReleases::new() {
        Ok(index) => Arc::new(index),
        Err(e) => {
            log::debug!("Update check unavailable: {}", e);
            return;
        }
    };
    let checker = UpdateChecker::new(ConfigStore::for_paths(paths), index, host_version());
    match tokio::time::timeout(UPDATE_CHECK_TIMEOUT, checker.check(chrono::Utc::now())).await {
        Ok(Ok(UpdateStatus::Available { version })) => {
            eprintln!(
                "A new version of kaytu is available: {} (running {})",
                version,
                host_version()
            );
        }
        Ok(Ok(_)) => {}
        Ok(Err(e)) => log::debug!("Update check failed: {}", e),
        Err(_) => log::debug!("Update check timed out"),
    }
}

fn manager(paths: &KaytuPaths, port: u16) -> HostResult<PluginManager> {
    PluginManager::new(ManagerOptions::new(paths.clone()).with_port(port))
}

async fn dispatch(
    paths: &KaytuPaths,
    request: CliRequest,
    color: bool,
    shutdown: &ShutdownCoordinator,
) -> HostResult<Outcome> {
    let json = request.globals.json_output();
    match request.invocation {
        Invocation::Version => {
            println!("kaytu {}", host_version());
            println!("  built   {}", build_time());
            println!("  commit  {}", git_hash());
            Ok(Outcome::Done)
        }
        Invocation::List => {
            let plugins = manager(paths, 0)?.installed_plugins().await?;
            if json {
                println!("{}", serde_json::to_string_pretty(&plugins).unwrap_or_default());
            } else if plugins.is_empty() {
                eprintln!("No plugins installed. Try: kaytu install aws");
            } else {
                display::plugins_table(&plugins, color).printstd();
            }
            Ok(Outcome::Done)
        }
        Invocation::Uninstall { name } => {
            let removed = manager(paths, 0)?.uninstall(&name).await?;
            eprintln!("Uninstalled plugin {}", removed.name);
            Ok(Outcome::Done)
        }
        Invocation::Install {
            address,
            token,
            allow_unapproved,
            debug_mode,
        } => {
            let port = if debug_mode { DEBUG_SERVER_PORT } else { 0 };
            let manager = manager(paths, port)?;
            manager.start_server().await?;
            if debug_mode {
                eprintln!(
                    "Waiting for a plugin on 127.0.0.1:{}; start it with --server 127.0.0.1:{}",
                    DEBUG_SERVER_PORT, DEBUG_SERVER_PORT
                );
            }
            let install = InstallRequest {
                address,
                auth_token: token,
                allow_unapproved,
                debug_mode,
            };
            let outcome = tokio::select! {
                outcome = manager.install(&install) => Some(outcome),
                _ = shutdown.wait() => None,
            };
            manager.shutdown().await;
            match outcome {
                None => Ok(Outcome::Interrupted),
                Some(Err(e)) => Err(e),
                Some(Ok(InstallOutcome::Installed(d))) => {
                    eprintln!("Plugin {} {} installed", d.name, d.version);
                    Ok(Outcome::Done)
                }
                Some(Ok(InstallOutcome::AlreadyInstalled(d))) => {
                    eprintln!("Plugin {} {} is already installed", d.name, d.version);
                    Ok(Outcome::Done)
                }
            }
        }
        Invocation::Run {
            plugin,
            command,
            flags,
        } => {
            let manager = manager(paths, 0)?;
            let result = run_command(&manager, &plugin, &command, flags, json, color, shutdown).await;
            manager.shutdown().await;
            result
        }
    }
}

async fn run_command(
    manager: &PluginManager,
    plugin: &str,
    command: &str,
    flags: BTreeMap<String, String>,
    json: bool,
    color: bool,
    shutdown: &ShutdownCoordinator,
) -> HostResult<Outcome> {
    let (sinks, mut receivers) = HostSinks::wired();
    manager.set_sinks(sinks.clone());
    let config = manager.load_config().await?;
    if receivers.relogin.try_recv().is_ok() {
        eprintln!("Your session has expired; please log in again.");
    }

    manager.start_server().await?;
    let descriptor = manager.start_plugin(command).await?;
    log::debug!("Started plugin '{}' for '{}'", descriptor.name, command);
    let session = tokio::select! {
        session = manager.wait_for_plugin(&descriptor.name, REGISTRATION_TIMEOUT) => session?,
        _ = shutdown.wait() => return Ok(Outcome::Interrupted),
    };
    log::debug!("Plugin '{}' registered as session {}", plugin, session.id());

    manager
        .start_command(command, flags, &config.access_token)
        .await?;

    let outcome = tokio::select! {
        result = await_results(&mut receivers, session.id()) => result.map(|_| Outcome::Done),
        _ = shutdown.wait() => Ok(Outcome::Interrupted),
    };
    let outcome = outcome?;
    if outcome == Outcome::Interrupted {
        return Ok(outcome);
    }

    let items = sinks
        .items
        .as_ref()
        .map(|items| items.items())
        .unwrap_or_default();
    if json {
        let report = display::report_json(&items, sinks.jobs.as_deref());
        println!("{}", serde_json::to_string_pretty(&report).unwrap_or_default());
    } else if items.is_empty() {
        eprintln!("No optimizations found.");
    } else {
        display::report_table(&items, color).printstd();
    }
    if let Some(note) = sinks
        .jobs
        .as_deref()
        .and_then(|jobs| display::failed_jobs_note(jobs, color))
    {
        eprintln!("{note}");
    }
    Ok(Outcome::Done)
}

/// Wait for the session's `ResultsReady`; its errors end the wait
async fn await_results(receivers: &mut SinkReceivers, session: u64) -> HostResult<()> {
    loop {
        tokio::select! {
            signal = receivers.ready.recv() => match signal {
                Some(signal) if signal.session == session => return Ok(()),
                Some(_) => continue,
                None => return Err(HostError::NotListening),
            },
            error = receivers.errors.recv() => match error {
                Some(SessionError { error, .. }) => return Err(error),
                None => return Err(HostError::NotListening),
            },
        }
    }
}
