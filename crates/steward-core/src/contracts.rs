//! Command-document and plugin-result contracts.
//!
//! A [`DocumentState`] is the serialized unit of work: it is created when a
//! command message is parsed, persisted through every folder transition of
//! the document store, and doubles as the recovery record after a crash or
//! reboot. Plugin outcomes are a tagged variant rather than a bag of mixed
//! fields so that serialization stays explicit.

use std::collections::BTreeMap;
use std::fmt;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

/// Exit code that signals a soft reboot request from a plugin script.
pub const REBOOT_EXIT_CODE: i64 = 3010;

/// Terminal and interim statuses of a command document.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum DocumentStatus {
    /// Accepted and executing.
    InProgress,
    /// All plugins completed successfully.
    Success,
    /// At least one plugin failed.
    Failed,
    /// Execution was cancelled before completion.
    Cancelled,
    /// Completed successfully and the host must reboot before the document
    /// can be finalized.
    SuccessAndReboot,
    /// Execution exceeded its time budget.
    TimedOut,
}

impl Default for DocumentStatus {
    fn default() -> Self {
        Self::InProgress
    }
}

impl fmt::Display for DocumentStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let label = match self {
            Self::InProgress => "InProgress",
            Self::Success => "Success",
            Self::Failed => "Failed",
            Self::Cancelled => "Cancelled",
            Self::SuccessAndReboot => "SuccessAndReboot",
            Self::TimedOut => "TimedOut",
        };
        f.write_str(label)
    }
}

/// Kind of command document.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum DocumentType {
    /// Run-command document received from the message service.
    SendCommand,
    /// Run-command document submitted locally while offline.
    SendCommandOffline,
    /// Cancellation of an in-flight send command.
    CancelCommand,
    /// Cancellation submitted locally while offline.
    CancelCommandOffline,
}

impl Default for DocumentType {
    fn default() -> Self {
        Self::SendCommand
    }
}

impl DocumentType {
    /// Whether this document cancels another document.
    #[must_use]
    pub const fn is_cancel(self) -> bool {
        matches!(self, Self::CancelCommand | Self::CancelCommandOffline)
    }
}

/// Outcome of a single plugin execution.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "status")]
pub enum PluginOutcome {
    /// The plugin completed successfully.
    Success {
        /// Process exit code.
        code: i64,
        /// Captured standard output.
        output: String,
    },
    /// The plugin failed.
    Failed {
        /// Process exit code.
        code: i64,
        /// Captured standard error.
        stderr: String,
    },
    /// The plugin completed and requested a host reboot.
    Reboot,
}

impl PluginOutcome {
    /// Document-level status this outcome maps to.
    #[must_use]
    pub const fn document_status(&self) -> DocumentStatus {
        match self {
            Self::Success { .. } => DocumentStatus::Success,
            Self::Failed { .. } => DocumentStatus::Failed,
            Self::Reboot => DocumentStatus::SuccessAndReboot,
        }
    }

    /// Exit code carried by the outcome, if any.
    #[must_use]
    pub const fn code(&self) -> i64 {
        match self {
            Self::Success { code, .. } | Self::Failed { code, .. } => *code,
            Self::Reboot => REBOOT_EXIT_CODE,
        }
    }
}

/// Result of one plugin run, with its execution window.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PluginResult {
    /// What happened.
    #[serde(flatten)]
    pub outcome: PluginOutcome,
    /// When the plugin started.
    pub start_time: DateTime<Utc>,
    /// When the plugin finished.
    pub end_time: DateTime<Utc>,
}

impl PluginResult {
    /// Builds a result stamped with the current time for both endpoints.
    ///
    /// Callers that track the real execution window set the timestamps
    /// themselves; this is for synthetic results (validation failures,
    /// cancellations) that never ran.
    #[must_use]
    pub fn now(outcome: PluginOutcome) -> Self {
        let at = Utc::now();
        Self {
            outcome,
            start_time: at,
            end_time: at,
        }
    }
}

/// Configuration handed to one plugin of a command document.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct PluginConfiguration {
    /// Plugin-specific properties from the document's runtime config, with
    /// document parameters already substituted.
    pub properties: serde_json::Value,
    /// S3 bucket for plugin output, empty when S3 upload is disabled.
    pub output_s3_bucket_name: String,
    /// S3 key prefix for plugin output.
    pub output_s3_key_prefix: String,
    /// Directory the plugin may use for intermediate files.
    pub orchestration_directory: String,
    /// Message this configuration belongs to.
    pub message_id: String,
    /// Name of the plugin that consumes this configuration.
    pub plugin_name: String,
}

/// Per-plugin slice of a document's execution state.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct PluginState {
    /// Plugin name, e.g. `aws:runPowerShellScript`.
    pub name: String,
    /// Expanded configuration for this plugin.
    pub configuration: PluginConfiguration,
    /// Result once the plugin has run.
    pub result: Option<PluginResult>,
    /// Set once the plugin has run; executed plugins are never re-run on
    /// recovery.
    pub has_executed: bool,
}

/// Document-level information of a command.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct DocumentInfo {
    /// Stable identity of this document on disk.
    pub document_id: String,
    /// Host identity the command targets.
    pub instance_id: String,
    /// Message-service identifier, globally unique per instance lifetime.
    pub message_id: String,
    /// Command identifier extracted from the message id.
    pub command_id: String,
    /// Name of the administrator document, e.g. `AWS-RunPowerShellScript`.
    pub document_name: String,
    /// Creation timestamp as reported by the message service.
    pub created_date: String,
    /// Current document-level status.
    pub document_status: DocumentStatus,
    /// Per-plugin results, keyed by plugin name.
    pub runtime_status: BTreeMap<String, PluginResult>,
    /// Aggregated bookkeeping sent with replies.
    pub additional_info: AdditionalInfo,
    /// Free-form trace output included in replies.
    pub document_trace_output: String,
}

/// Aggregated reply bookkeeping.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct AdditionalInfo {
    /// Reporting agent name.
    pub agent: String,
    /// Reply build time, RFC 3339.
    pub date_time: String,
    /// Count of plugin results per status label.
    pub runtime_status_counts: BTreeMap<String, u32>,
}

/// Cancellation target carried by a cancel document.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct CancelInfo {
    /// Message id of the send command to cancel.
    pub cancel_message_id: String,
    /// Command id of the send command to cancel.
    pub cancel_command_id: String,
    /// Human-readable outcome of the cancellation attempt.
    pub debug_info: String,
}

/// The serialized unit of work and recovery record.
///
/// At rest a `DocumentState` lives in exactly one folder of the document
/// store. It is created by the parser, mutated only by the worker that owns
/// it (or the cancel path), and retired once moved to a terminal folder.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct DocumentState {
    /// Document-level information.
    pub document_info: DocumentInfo,
    /// Kind of document.
    pub document_type: DocumentType,
    /// Ordered plugin execution states.
    pub instance_plugins_information: Vec<PluginState>,
    /// Present only on cancel documents.
    pub cancel_information: Option<CancelInfo>,
}

impl DocumentState {
    /// Whether this state carries no document identity, i.e. it was produced
    /// by a failed or absent read.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.document_info.document_id.is_empty()
    }
}

/// Document-level payload of a reply to the message service.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct DocumentPayload {
    /// Aggregated document status.
    pub document_status: DocumentStatus,
    /// Per-plugin results, keyed by plugin name.
    pub runtime_status: BTreeMap<String, PluginResult>,
    /// Aggregated bookkeeping.
    pub additional_info: AdditionalInfo,
    /// Free-form trace output.
    pub document_trace_output: String,
}

/// Aggregates plugin outputs into a document-level reply payload.
///
/// An empty output set means the document is still in progress. Otherwise
/// any failure wins, then any reboot request, then success.
#[must_use]
pub fn build_reply(outputs: &BTreeMap<String, PluginResult>) -> DocumentPayload {
    let mut counts: BTreeMap<String, u32> = BTreeMap::new();
    for result in outputs.values() {
        *counts
            .entry(result.outcome.document_status().to_string())
            .or_insert(0) += 1;
    }

    let document_status = if outputs.is_empty() {
        DocumentStatus::InProgress
    } else if outputs
        .values()
        .any(|r| matches!(r.outcome, PluginOutcome::Failed { .. }))
    {
        DocumentStatus::Failed
    } else if outputs
        .values()
        .any(|r| matches!(r.outcome, PluginOutcome::Reboot))
    {
        DocumentStatus::SuccessAndReboot
    } else {
        DocumentStatus::Success
    };

    DocumentPayload {
        document_status,
        runtime_status: outputs.clone(),
        additional_info: AdditionalInfo {
            agent: "steward".to_string(),
            date_time: Utc::now().to_rfc3339(),
            runtime_status_counts: counts,
        },
        document_trace_output: String::new(),
    }
}

/// Extracts the command id from a message id of the form
/// `aws.ssm.<command-id>.<instance-id>`.
///
/// Returns an empty string when the message id does not carry a command
/// segment.
#[must_use]
pub fn command_id(message_id: &str) -> String {
    message_id.split('.').nth(2).unwrap_or_default().to_string()
}
