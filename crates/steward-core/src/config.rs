//! Agent configuration.
//!
//! One immutable record passed into each subsystem at construction time.
//! Path roots, topic prefixes, pool sizes, and rewrite rules all live here
//! rather than in process-wide mutable state, so there is no init-order to
//! get wrong and tests can build any shape they need.

use std::path::PathBuf;
use std::time::Duration;

use serde::{Deserialize, Serialize};

/// Immutable configuration for the agent's command-processing core.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AgentConfig {
    /// Identity of the managed host.
    #[serde(default)]
    pub instance_id: String,

    /// Root under which document state folders live.
    #[serde(default = "default_data_root")]
    pub data_root: PathBuf,

    /// Root under which per-command orchestration directories are created.
    #[serde(default = "default_orchestration_root")]
    pub orchestration_root: PathBuf,

    /// Root under which packages are downloaded and installed.
    #[serde(default = "default_package_root")]
    pub package_root: PathBuf,

    /// Base URL of the package repository.
    #[serde(default)]
    pub package_repository_url: String,

    /// Platform name used when looking up packages.
    #[serde(default = "default_package_platform")]
    pub package_platform: String,

    /// Architecture name used when looking up packages.
    #[serde(default = "default_package_architecture")]
    pub package_architecture: String,

    /// Topic prefix that routes a message to the send-command parser.
    #[serde(default = "default_send_command_topic_prefix")]
    pub send_command_topic_prefix: String,

    /// Topic prefix that routes a message to the cancel-command parser.
    #[serde(default = "default_cancel_command_topic_prefix")]
    pub cancel_command_topic_prefix: String,

    /// Worker threads in the send-command pool.
    #[serde(default = "default_send_command_workers")]
    pub send_command_workers: usize,

    /// Worker threads in the cancel-command pool.
    #[serde(default = "default_cancel_command_workers")]
    pub cancel_command_workers: usize,

    /// How long shutdown waits for in-flight jobs.
    #[serde(default = "default_shutdown_timeout")]
    #[serde(with = "humantime_serde")]
    pub shutdown_timeout: Duration,

    /// Consecutive remote errors before a subsystem backs off.
    #[serde(default = "default_stop_policy_threshold")]
    pub stop_policy_threshold: u32,

    /// How long a tripped subsystem stays paused.
    #[serde(default = "default_stop_policy_cooldown")]
    #[serde(with = "humantime_serde")]
    pub stop_policy_cooldown: Duration,

    /// Whether this host is a managed (non-EC2) instance.
    #[serde(default)]
    pub managed_instance: bool,

    /// Administrator documents whose plugin configurations assume EC2
    /// instance-metadata availability and must be rewritten on managed
    /// instances.
    #[serde(default = "default_incompatible_documents")]
    pub instance_metadata_incompatible_documents: Vec<String>,

    /// Plugins that update the agent itself and own the deletion of their
    /// message.
    #[serde(default = "default_update_plugin_names")]
    pub update_plugin_names: Vec<String>,
}

fn default_data_root() -> PathBuf {
    PathBuf::from("/var/lib/steward")
}

fn default_orchestration_root() -> PathBuf {
    PathBuf::from("/var/lib/steward/orchestration")
}

fn default_package_root() -> PathBuf {
    PathBuf::from("/var/lib/steward/packages")
}

fn default_package_platform() -> String {
    std::env::consts::OS.to_string()
}

fn default_package_architecture() -> String {
    std::env::consts::ARCH.to_string()
}

fn default_send_command_topic_prefix() -> String {
    "aws.ssm.sendCommand.".to_string()
}

fn default_cancel_command_topic_prefix() -> String {
    "aws.ssm.cancelCommand.".to_string()
}

const fn default_send_command_workers() -> usize {
    5
}

const fn default_cancel_command_workers() -> usize {
    1
}

const fn default_shutdown_timeout() -> Duration {
    Duration::from_secs(20)
}

const fn default_stop_policy_threshold() -> u32 {
    crate::stoppolicy::DEFAULT_ERROR_THRESHOLD
}

const fn default_stop_policy_cooldown() -> Duration {
    Duration::from_secs(300)
}

fn default_incompatible_documents() -> Vec<String> {
    [
        "AWS-ConfigureCloudWatch",
        "AWS-FindWindowsUpdates",
        "AWS-InstallMissingWindowsUpdates",
        "AWS-InstallSpecificWindowsUpdates",
        "AWS-ListWindowsInventory",
    ]
    .iter()
    .map(ToString::to_string)
    .collect()
}

fn default_update_plugin_names() -> Vec<String> {
    ["aws:updateSsmAgent", "aws:updateEc2Config"]
        .iter()
        .map(ToString::to_string)
        .collect()
}

impl Default for AgentConfig {
    fn default() -> Self {
        Self {
            instance_id: String::new(),
            data_root: default_data_root(),
            orchestration_root: default_orchestration_root(),
            package_root: default_package_root(),
            package_repository_url: String::new(),
            package_platform: default_package_platform(),
            package_architecture: default_package_architecture(),
            send_command_topic_prefix: default_send_command_topic_prefix(),
            cancel_command_topic_prefix: default_cancel_command_topic_prefix(),
            send_command_workers: default_send_command_workers(),
            cancel_command_workers: default_cancel_command_workers(),
            shutdown_timeout: default_shutdown_timeout(),
            stop_policy_threshold: default_stop_policy_threshold(),
            stop_policy_cooldown: default_stop_policy_cooldown(),
            managed_instance: false,
            instance_metadata_incompatible_documents: default_incompatible_documents(),
            update_plugin_names: default_update_plugin_names(),
        }
    }
}

impl AgentConfig {
    /// Whether `document_name` must be rewritten on a managed instance.
    #[must_use]
    pub fn is_instance_metadata_incompatible(&self, document_name: &str) -> bool {
        self.instance_metadata_incompatible_documents
            .iter()
            .any(|name| name == document_name)
    }

    /// Whether `plugin_name` is an update-self plugin.
    #[must_use]
    pub fn is_update_plugin(&self, plugin_name: &str) -> bool {
        self.update_plugin_names.iter().any(|n| n == plugin_name)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn defaults_parse_from_empty_json() {
        let config: AgentConfig = serde_json::from_str("{}").unwrap();
        assert_eq!(config.send_command_topic_prefix, "aws.ssm.sendCommand.");
        assert_eq!(config.cancel_command_topic_prefix, "aws.ssm.cancelCommand.");
        assert_eq!(config.send_command_workers, 5);
        assert_eq!(config.cancel_command_workers, 1);
        assert_eq!(config.stop_policy_threshold, 10);
        assert!(!config.managed_instance);
    }

    #[test]
    fn durations_parse_from_humantime() {
        let config: AgentConfig =
            serde_json::from_str(r#"{"shutdown_timeout": "45s", "stop_policy_cooldown": "2m"}"#)
                .unwrap();
        assert_eq!(config.shutdown_timeout, Duration::from_secs(45));
        assert_eq!(config.stop_policy_cooldown, Duration::from_secs(120));
    }

    #[test]
    fn incompatible_document_lookup() {
        let config = AgentConfig::default();
        assert!(config.is_instance_metadata_incompatible("AWS-ConfigureCloudWatch"));
        assert!(!config.is_instance_metadata_incompatible("AWS-RunPowerShellScript"));
    }

    #[test]
    fn update_plugin_lookup() {
        let config = AgentConfig::default();
        assert!(config.is_update_plugin("aws:updateSsmAgent"));
        assert!(config.is_update_plugin("aws:updateEc2Config"));
        assert!(!config.is_update_plugin("aws:runPowerShellScript"));
    }
}
