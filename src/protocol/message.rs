//! Protocol Messages
//!
//! Tagged unions for both directions of a `Register` stream. Plugins send
//! [`PluginMessage`]s, the host answers with [`ServerMessage`]s. Each variant
//! serialises as a single-key JSON object named after the variant.

use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;

/// First message of every stream: what the plugin is and what it can do
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct RegisterConfig {
    pub name: String,
    pub version: String,
    pub provider: String,
    pub min_host_version: String,
    pub commands: Vec<CommandDescriptor>,
}

impl RegisterConfig {
    /// Find an advertised command by name
    pub fn command(&self, name: &str) -> Option<&CommandDescriptor> {
        self.commands.iter().find(|c| c.name == name)
    }

    /// Every minimum host version the plugin declares, plugin-level first
    pub fn min_host_versions(&self) -> impl Iterator<Item = &str> {
        std::iter::once(self.min_host_version.as_str())
            .chain(self.commands.iter().map(|c| c.min_host_version.as_str()))
            .filter(|v| !v.trim().is_empty())
    }
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct CommandDescriptor {
    pub name: String,
    pub description: String,
    pub login_required: bool,
    pub default_preferences: Vec<PreferenceItem>,
    pub flags: Vec<FlagDescriptor>,
    pub min_host_version: String,
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct FlagDescriptor {
    pub name: String,
    pub default: String,
    pub description: String,
    pub required: bool,
}

/// A scoring knob the plugin consults for a resource
///
/// A pinned preference carries no value: the resource's current value is used.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct PreferenceItem {
    pub service: String,
    pub key: String,
    pub alias: String,
    pub is_number: bool,
    pub value: Option<String>,
    pub possible_values: Vec<String>,
    pub pinned: bool,
    pub prevent_pinning: bool,
    pub unit: String,
}

impl PreferenceItem {
    pub fn new(service: impl Into<String>, key: impl Into<String>) -> Self {
        Self {
            service: service.into(),
            key: key.into(),
            ..Self::default()
        }
    }

    pub fn with_value(mut self, value: impl Into<String>) -> Self {
        self.value = Some(value.into());
        self.pinned = false;
        self
    }

    /// Pin to the resource's own value, dropping any explicit value
    pub fn pin(&mut self) {
        self.pinned = true;
        self.value = None;
    }

    /// Restore the pinned-implies-no-value rule on a received preference
    pub fn normalized(mut self) -> Self {
        if self.pinned {
            self.value = None;
        }
        self
    }
}

/// Progress event for one plugin job
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct JobResult {
    pub id: String,
    pub description: String,
    pub done: bool,
    pub failure_message: String,
}

impl JobResult {
    pub fn running(id: impl Into<String>, description: impl Into<String>) -> Self {
        Self {
            id: id.into(),
            description: description.into(),
            done: false,
            failure_message: String::new(),
        }
    }

    pub fn finished(
        id: impl Into<String>,
        description: impl Into<String>,
        failure: Option<String>,
    ) -> Self {
        Self {
            id: id.into(),
            description: description.into(),
            done: true,
            failure_message: failure.unwrap_or_default(),
        }
    }

    pub fn is_failed(&self) -> bool {
        self.done && !self.failure_message.is_empty()
    }
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct Property {
    pub key: String,
    pub current: String,
    pub average: String,
    pub max: String,
    pub recommended: String,
}

/// A billable sub-resource of an optimization item
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct Device {
    pub device_id: String,
    pub resource_type: String,
    pub runtime: String,
    pub current_cost: f64,
    pub right_sized_cost: f64,
    pub properties: Vec<Property>,
}

impl Device {
    pub fn savings(&self) -> f64 {
        self.current_cost - self.right_sized_cost
    }
}

/// A resource the plugin has analysed, with its proposed right-sizing
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct OptimizationItem {
    pub id: String,
    pub name: String,
    pub resource_type: String,
    pub region: String,
    pub platform: String,
    pub devices: Vec<Device>,
    pub preferences: Vec<PreferenceItem>,
    pub description: String,
    pub loading: bool,
    pub skipped: bool,
    pub skip_reason: String,
    pub lazy_loading_enabled: bool,
}

impl OptimizationItem {
    /// Total monthly savings across all devices
    pub fn savings(&self) -> f64 {
        self.devices.iter().map(Device::savings).sum()
    }

    pub fn current_cost(&self) -> f64 {
        self.devices.iter().map(|d| d.current_cost).sum()
    }

    pub fn right_sized_cost(&self) -> f64 {
        self.devices.iter().map(|d| d.right_sized_cost).sum()
    }

    /// Reject items the host cannot key or that are both loading and skipped
    pub fn validate(&self) -> Result<(), String> {
        if self.id.is_empty() {
            return Err("optimization item has an empty id".to_string());
        }
        if self.loading && self.skipped {
            return Err(format!(
                "optimization item '{}' is marked both loading and skipped",
                self.id
            ));
        }
        Ok(())
    }
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct ErrorMessage {
    pub error: String,
}

impl ErrorMessage {
    pub fn new(error: impl Into<String>) -> Self {
        Self {
            error: error.into(),
        }
    }
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct ResultsReady {
    pub ready: bool,
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct StartProcess {
    pub command: String,
    pub flags: BTreeMap<String, String>,
    pub access_token: String,
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct ReEvaluate {
    pub id: String,
    pub preferences: Vec<PreferenceItem>,
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct ServerTerminate {
    pub reason: String,
}

/// Plugin to host
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum PluginMessage {
    RegisterConfig(RegisterConfig),
    JobResult(JobResult),
    OptimizationItem(OptimizationItem),
    Error(ErrorMessage),
    ResultsReady(ResultsReady),
}

impl PluginMessage {
    pub fn kind(&self) -> &'static str {
        match self {
            PluginMessage::RegisterConfig(_) => "RegisterConfig",
            PluginMessage::JobResult(_) => "JobResult",
            PluginMessage::OptimizationItem(_) => "OptimizationItem",
            PluginMessage::Error(_) => "Error",
            PluginMessage::ResultsReady(_) => "ResultsReady",
        }
    }
}

/// Host to plugin
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ServerMessage {
    StartProcess(StartProcess),
    ReEvaluate(ReEvaluate),
    ServerTerminate(ServerTerminate),
}

impl ServerMessage {
    pub fn kind(&self) -> &'static str {
        match self {
            ServerMessage::StartProcess(_) => "StartProcess",
            ServerMessage::ReEvaluate(_) => "ReEvaluate",
            ServerMessage::ServerTerminate(_) => "ServerTerminate",
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_plugin_message_wire_tag_is_snake_case() {
        let msg = PluginMessage::ResultsReady(ResultsReady { ready: true });
        let json = serde_json::to_string(&msg).unwrap();
        assert_eq!(json, r#"{"results_ready":{"ready":true}}"#);
    }

    #[test]
    fn test_missing_fields_take_defaults() {
        let msg: PluginMessage =
            serde_json::from_str(r#"{"register_config":{"name":"my-plugin","commands":[{"name":"scan"}]}}"#)
                .unwrap();
        match msg {
            PluginMessage::RegisterConfig(cfg) => {
                assert_eq!(cfg.name, "my-plugin");
                assert!(cfg.version.is_empty());
                let scan = cfg.command("scan").expect("scan command should be present");
                assert!(!scan.login_required);
                assert!(scan.flags.is_empty());
            }
            other => panic!("expected RegisterConfig, got {}", other.kind()),
        }
    }

    #[test]
    fn test_item_savings_sum_over_devices() {
        let item = OptimizationItem {
            id: "r1".into(),
            devices: vec![
                Device {
                    current_cost: 10.0,
                    right_sized_cost: 6.0,
                    ..Device::default()
                },
                Device {
                    current_cost: 5.0,
                    right_sized_cost: 5.0,
                    ..Device::default()
                },
            ],
            ..OptimizationItem::default()
        };
        assert_eq!(item.savings(), 4.0);
        assert_eq!(item.current_cost(), 15.0);
    }

    #[test]
    fn test_loading_and_skipped_are_exclusive() {
        let item = OptimizationItem {
            id: "r1".into(),
            loading: true,
            skipped: true,
            ..OptimizationItem::default()
        };
        assert!(item.validate().is_err());

        let blank = OptimizationItem::default();
        assert!(blank.validate().is_err(), "empty id must be rejected");
    }

    #[test]
    fn test_pinned_preference_has_no_value() {
        let mut pref = PreferenceItem::new("EC2Instance", "vCPU").with_value("4");
        pref.pin();
        assert!(pref.pinned);
        assert_eq!(pref.value, None);

        let received = PreferenceItem {
            pinned: true,
            value: Some("8".into()),
            ..PreferenceItem::default()
        };
        assert_eq!(received.normalized().value, None);
    }

    #[test]
    fn test_min_host_versions_skip_blank_entries() {
        let cfg = RegisterConfig {
            min_host_version: String::new(),
            commands: vec![
                CommandDescriptor {
                    name: "scan".into(),
                    min_host_version: "v0.2.0".into(),
                    ..CommandDescriptor::default()
                },
                CommandDescriptor {
                    name: "plan".into(),
                    ..CommandDescriptor::default()
                },
            ],
            ..RegisterConfig::default()
        };
        assert_eq!(cfg.min_host_versions().collect::<Vec<_>>(), vec!["v0.2.0"]);
    }
}
