//! Command line parsing
//!
//! Global options are declared with clap's derive API. Subcommands are added
//! with the builder API because most of them come from the installed plugins:
//! every command of every plugin becomes a subcommand whose `--flags` are
//! taken from its `CommandDescriptor`.

use crate::config::PluginDescriptor;
use crate::core::styles::clap_styles;
use crate::protocol::CommandDescriptor;
use clap::{Arg, ArgAction, ArgMatches, Args, Command, FromArgMatches};
use std::collections::BTreeMap;

/// Fixed subcommands; plugin commands with these names are not exposed
pub const RESERVED_COMMANDS: [&str; 5] = ["install", "uninstall", "list", "version", "help"];

/// Global options; plugin flags with these names are not exposed
const GLOBAL_FLAGS: [&str; 7] = [
    "log-level",
    "log-format",
    "log-file",
    "no-color",
    "output",
    "help",
    "version",
];

#[derive(Args, Debug, Clone, Default, PartialEq, Eq)]
pub struct GlobalArgs {
    /// Log level
    #[arg(
        long = "log-level",
        value_name = "LEVEL",
        global = true,
        value_parser = ["trace", "debug", "info", "warn", "error", "off"]
    )]
    pub log_level: Option<String>,

    /// Log output format
    #[arg(
        long = "log-format",
        value_name = "FORMAT",
        global = true,
        value_parser = ["text", "ext", "json"]
    )]
    pub log_format: Option<String>,

    /// Write logs to this file instead of stderr
    #[arg(long = "log-file", value_name = "FILE", global = true)]
    pub log_file: Option<String>,

    /// Disable coloured output
    #[arg(long = "no-color", global = true)]
    pub no_color: bool,

    /// Result format
    #[arg(
        long = "output",
        value_name = "FORMAT",
        global = true,
        default_value = "text",
        value_parser = ["text", "json"]
    )]
    pub output: String,
}

impl GlobalArgs {
    pub fn json_output(&self) -> bool {
        self.output == "json"
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Invocation {
    Install {
        address: String,
        token: Option<String>,
        allow_unapproved: bool,
        debug_mode: bool,
    },
    Uninstall {
        name: String,
    },
    List,
    Version,
    /// A command provided by an installed plugin
    Run {
        plugin: String,
        command: String,
        flags: BTreeMap<String, String>,
    },
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CliRequest {
    pub globals: GlobalArgs,
    pub invocation: Invocation,
}

fn fixed_commands() -> Vec<Command> {
    vec![
        Command::new("install")
            .about("Install a plugin from its release repository")
            .arg(
                Arg::new("address")
                    .required(true)
                    .value_name("PLUGIN")
                    .help("Plugin name (aws) or repository (github.com/owner/plugin-x)"),
            )
            .arg(
                Arg::new("token")
                    .long("token")
                    .value_name("TOKEN")
                    .help("Token for private repositories"),
            )
            .arg(
                Arg::new("unsafe")
                    .long("unsafe")
                    .action(ArgAction::SetTrue)
                    .help("Allow plugins that are not on the approved list"),
            )
            .arg(
                Arg::new("plugin-debug-mode")
                    .long("plugin-debug-mode")
                    .action(ArgAction::SetTrue)
                    .help("Wait for a plugin started by hand instead of downloading it"),
            ),
        Command::new("uninstall")
            .about("Remove an installed plugin")
            .arg(Arg::new("name").required(true).value_name("NAME")),
        Command::new("list").about("List installed plugins"),
        Command::new("version").about("Show version and build information"),
    ]
}

fn plugin_command(plugin: &PluginDescriptor, command: &CommandDescriptor) -> Command {
    let about = if command.description.is_empty() {
        format!("{} command from plugin {}", command.name, plugin.name)
    } else {
        command.description.clone()
    };
    let mut cmd = Command::new(command.name.clone()).about(about);
    for flag in &command.flags {
        if flag.name.is_empty() || GLOBAL_FLAGS.contains(&flag.name.as_str()) {
            log::warn!(
                "Plugin '{}' flag '{}' of '{}' is not usable",
                plugin.name,
                flag.name,
                command.name
            );
            continue;
        }
        let mut arg = Arg::new(flag.name.clone())
            .long(flag.name.clone())
            .value_name("VALUE")
            .help(flag.description.clone());
        if !flag.default.is_empty() {
            arg = arg.default_value(flag.default.clone());
        } else if flag.required {
            arg = arg.required(true);
        }
        cmd = cmd.arg(arg);
    }
    cmd
}

/// Full command tree for the given installed plugins
pub fn build_command(plugins: &[PluginDescriptor], color: bool) -> Command {
    let mut cmd = GlobalArgs::augment_args(
        Command::new("kaytu")
            .about("Find savings in your cloud resources with plugins")
            .version(env!("CARGO_PKG_VERSION"))
            .styles(clap_styles(color))
            .subcommand_required(true)
            .arg_required_else_help(true),
    )
    .subcommands(fixed_commands());

    let mut seen = std::collections::HashSet::new();
    for plugin in plugins {
        for command in &plugin.commands {
            if RESERVED_COMMANDS.contains(&command.name.as_str()) {
                log::warn!(
                    "Plugin '{}' command '{}' clashes with a built-in command",
                    plugin.name,
                    command.name
                );
                continue;
            }
            if !seen.insert(command.name.clone()) {
                log::warn!(
                    "Command '{}' of plugin '{}' is already provided by another plugin",
                    command.name,
                    plugin.name
                );
                continue;
            }
            cmd = cmd.subcommand(plugin_command(plugin, command));
        }
    }
    cmd
}

fn invocation(
    plugins: &[PluginDescriptor],
    name: &str,
    matches: &ArgMatches,
) -> Result<Invocation, clap::Error> {
    let text = |id: &str| matches.try_get_one::<String>(id).ok().flatten().cloned();
    Ok(match name {
        "install" => Invocation::Install {
            address: text("address").unwrap_or_default(),
            token: text("token"),
            allow_unapproved: matches.get_flag("unsafe"),
            debug_mode: matches.get_flag("plugin-debug-mode"),
        },
        "uninstall" => Invocation::Uninstall {
            name: text("name").unwrap_or_default(),
        },
        "list" => Invocation::List,
        "version" => Invocation::Version,
        command => {
            let (plugin, descriptor) = plugins
                .iter()
                .find_map(|p| p.command(command).map(|c| (p, c)))
                .ok_or_else(|| {
                    clap::Error::raw(
                        clap::error::ErrorKind::InvalidSubcommand,
                        format!("unknown command '{command}'\n"),
                    )
                })?;
            let flags = descriptor
                .flags
                .iter()
                .filter_map(|f| text(&f.name).map(|v| (f.name.clone(), v)))
                .collect();
            Invocation::Run {
                plugin: plugin.name.clone(),
                command: command.to_string(),
                flags,
            }
        }
    })
}

/// Parse `args` (including the program name) against the installed plugins
pub fn parse_from<I, T>(
    plugins: &[PluginDescriptor],
    color: bool,
    args: I,
) -> Result<CliRequest, clap::Error>
where
    I: IntoIterator<Item = T>,
    T: Into<std::ffi::OsString> + Clone,
{
    let matches = build_command(plugins, color).try_get_matches_from(args)?;
    let globals = GlobalArgs::from_arg_matches(&matches)?;
    let (name, sub) = matches.subcommand().ok_or_else(|| {
        clap::Error::raw(
            clap::error::ErrorKind::MissingSubcommand,
            "a command is required\n",
        )
    })?;
    Ok(CliRequest {
        globals,
        invocation: invocation(plugins, name, sub)?,
    })
}
