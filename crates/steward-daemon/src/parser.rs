//! Message parsing: raw service payloads into typed document states.
//!
//! Two entry points selected by topic prefix: send-command payloads carry a
//! full administrator document with parameters to expand, cancel-command
//! payloads name the message to cancel. Parsing composes the on-disk
//! [`DocumentState`] the rest of the pipeline operates on.

use std::collections::BTreeMap;
use std::sync::LazyLock;

use regex::{Captures, Regex};
use serde::Deserialize;
use serde_json::Value;
use steward_core::config::AgentConfig;
use steward_core::contracts::{
    self, CancelInfo, DocumentInfo, DocumentState, DocumentStatus, DocumentType,
    PluginConfiguration, PluginState,
};
use tracing::debug;
use uuid::Uuid;

use crate::mds::MdsMessage;

/// Errors from message parsing.
#[derive(Debug, thiserror::Error)]
pub enum ParseError {
    /// The payload is not valid JSON for the routed message kind.
    #[error("invalid payload: {0}")]
    InvalidPayload(#[source] serde_json::Error),

    /// A required payload field is missing or empty.
    #[error("invalid payload: missing required field {0}")]
    MissingField(&'static str),

    /// The topic matches no known prefix.
    #[error("unexpected topic name {0}")]
    UnexpectedTopic(String),

    /// The managed-instance rewrite could not be applied.
    #[error("cannot rewrite configuration of plugin {plugin} for a managed instance")]
    RewriteFailed {
        /// Plugin whose properties defeated the rewrite.
        plugin: String,
    },
}

/// Wire shape of a send-command payload.
#[derive(Debug, Deserialize)]
struct SendCommandPayload {
    #[serde(rename = "CommandId", default)]
    command_id: String,
    #[serde(rename = "DocumentName", default)]
    document_name: String,
    #[serde(rename = "DocumentContent")]
    document_content: DocumentContent,
    #[serde(rename = "Parameters", default)]
    parameters: BTreeMap<String, Value>,
    #[serde(rename = "OutputS3BucketName", default)]
    output_s3_bucket_name: String,
    #[serde(rename = "OutputS3KeyPrefix", default)]
    output_s3_key_prefix: String,
}

/// Administrator document content: plugin configurations keyed by plugin
/// name. `BTreeMap` keeps the execution order deterministic.
#[derive(Debug, Deserialize)]
struct DocumentContent {
    #[serde(rename = "runtimeConfig", default)]
    runtime_config: BTreeMap<String, RuntimeConfigEntry>,
}

#[derive(Debug, Deserialize, Default)]
struct RuntimeConfigEntry {
    #[serde(default)]
    properties: Value,
}

/// Wire shape of a cancel-command payload.
#[derive(Debug, Deserialize)]
struct CancelPayload {
    #[serde(rename = "CancelMessageId", default)]
    cancel_message_id: String,
    #[serde(rename = "CancelCommandId", default)]
    cancel_command_id: String,
}

/// Routes a message by topic prefix and parses it into a document state.
///
/// # Errors
///
/// Returns [`ParseError`] on unknown topics, malformed payloads, or a
/// failed managed-instance rewrite.
pub fn parse_message(config: &AgentConfig, msg: &MdsMessage) -> Result<DocumentState, ParseError> {
    if msg.topic.starts_with(&config.send_command_topic_prefix) {
        parse_send_command(config, msg)
    } else if msg.topic.starts_with(&config.cancel_command_topic_prefix) {
        parse_cancel_command(msg)
    } else {
        Err(ParseError::UnexpectedTopic(msg.topic.clone()))
    }
}

/// Parses a send-command payload and composes its document state.
///
/// # Errors
///
/// Returns [`ParseError`] on malformed payloads or a failed
/// managed-instance rewrite.
pub fn parse_send_command(
    config: &AgentConfig,
    msg: &MdsMessage,
) -> Result<DocumentState, ParseError> {
    let payload: SendCommandPayload =
        serde_json::from_str(&msg.payload).map_err(ParseError::InvalidPayload)?;

    if payload.document_name.is_empty() {
        return Err(ParseError::MissingField("DocumentName"));
    }
    if payload.document_content.runtime_config.is_empty() {
        return Err(ParseError::MissingField("runtimeConfig"));
    }

    let mut command_id = contracts::command_id(&msg.message_id);
    if command_id.is_empty() {
        command_id = payload.command_id.clone();
    }

    let orchestration_dir = config.orchestration_root.join(&command_id);
    let s3_key_prefix = join_key_prefix(&[
        &payload.output_s3_key_prefix,
        &payload.command_id,
        &msg.destination,
    ]);

    let plugins = payload
        .document_content
        .runtime_config
        .iter()
        .map(|(name, entry)| PluginState {
            name: name.clone(),
            configuration: PluginConfiguration {
                properties: substitute_parameters(&entry.properties, &payload.parameters),
                output_s3_bucket_name: payload.output_s3_bucket_name.clone(),
                output_s3_key_prefix: s3_key_prefix.clone(),
                orchestration_directory: orchestration_dir.join(name).display().to_string(),
                message_id: msg.message_id.clone(),
                plugin_name: name.clone(),
            },
            result: None,
            has_executed: false,
        })
        .collect();

    let mut state = DocumentState {
        document_info: DocumentInfo {
            document_id: Uuid::new_v4().to_string(),
            instance_id: msg.destination.clone(),
            message_id: msg.message_id.clone(),
            command_id,
            document_name: payload.document_name.clone(),
            created_date: msg.created_date.clone(),
            document_status: DocumentStatus::InProgress,
            ..DocumentInfo::default()
        },
        document_type: DocumentType::SendCommand,
        instance_plugins_information: plugins,
        cancel_information: None,
    };

    // A few public administrator documents assume EC2 instance-metadata
    // availability; on managed instances their configurations are rewritten
    // before dispatch.
    if config.managed_instance && config.is_instance_metadata_incompatible(&payload.document_name) {
        debug!(
            document_name = %payload.document_name,
            "rewriting instance-metadata-incompatible document for managed instance"
        );
        remove_dependency_on_instance_metadata(&mut state)?;
    }

    Ok(state)
}

/// Parses a cancel-command payload and composes a minimal document state.
///
/// # Errors
///
/// Returns [`ParseError`] on malformed payloads.
pub fn parse_cancel_command(msg: &MdsMessage) -> Result<DocumentState, ParseError> {
    let payload: CancelPayload =
        serde_json::from_str(&msg.payload).map_err(ParseError::InvalidPayload)?;

    if payload.cancel_message_id.is_empty() {
        return Err(ParseError::MissingField("CancelMessageId"));
    }

    let mut cancel_command_id = payload.cancel_command_id;
    if cancel_command_id.is_empty() {
        cancel_command_id = contracts::command_id(&payload.cancel_message_id);
    }

    Ok(DocumentState {
        document_info: DocumentInfo {
            document_id: Uuid::new_v4().to_string(),
            instance_id: msg.destination.clone(),
            message_id: msg.message_id.clone(),
            command_id: contracts::command_id(&msg.message_id),
            created_date: msg.created_date.clone(),
            document_status: DocumentStatus::InProgress,
            ..DocumentInfo::default()
        },
        document_type: DocumentType::CancelCommand,
        instance_plugins_information: Vec::new(),
        cancel_information: Some(CancelInfo {
            cancel_message_id: payload.cancel_message_id,
            cancel_command_id,
            debug_info: String::new(),
        }),
    })
}

/// Strips the instance-metadata-dependent pieces from every plugin
/// configuration: the S3 output targets at both the configuration level and
/// inside the raw properties.
fn remove_dependency_on_instance_metadata(state: &mut DocumentState) -> Result<(), ParseError> {
    for plugin in &mut state.instance_plugins_information {
        plugin.configuration.output_s3_bucket_name.clear();
        plugin.configuration.output_s3_key_prefix.clear();
        strip_s3_outputs(&mut plugin.configuration.properties).map_err(|()| {
            ParseError::RewriteFailed {
                plugin: plugin.name.clone(),
            }
        })?;
    }
    Ok(())
}

fn strip_s3_outputs(properties: &mut Value) -> Result<(), ()> {
    match properties {
        Value::Object(map) => {
            map.retain(|key, _| {
                !key.eq_ignore_ascii_case("outputS3BucketName")
                    && !key.eq_ignore_ascii_case("outputS3KeyPrefix")
            });
            Ok(())
        },
        Value::Array(items) => {
            for item in items {
                strip_s3_outputs(item)?;
            }
            Ok(())
        },
        Value::Null => Ok(()),
        // A scalar configuration cannot be proven metadata-independent.
        Value::Bool(_) | Value::Number(_) | Value::String(_) => Err(()),
    }
}

static PLACEHOLDER_RE: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(r"\{\{\s*([A-Za-z0-9_.-]+)\s*\}\}").expect("placeholder regex should compile")
});

/// Expands `{{ name }}` placeholders in a properties tree.
///
/// A string that is exactly one placeholder takes the parameter's JSON
/// value, preserving its type; placeholders embedded in longer strings are
/// substituted textually. Unknown parameter names are left in place.
#[must_use]
pub fn substitute_parameters(properties: &Value, parameters: &BTreeMap<String, Value>) -> Value {
    match properties {
        Value::String(text) => substitute_string(text, parameters),
        Value::Array(items) => Value::Array(
            items
                .iter()
                .map(|item| substitute_parameters(item, parameters))
                .collect(),
        ),
        Value::Object(map) => Value::Object(
            map.iter()
                .map(|(key, value)| (key.clone(), substitute_parameters(value, parameters)))
                .collect(),
        ),
        other => other.clone(),
    }
}

fn substitute_string(text: &str, parameters: &BTreeMap<String, Value>) -> Value {
    if let Some(captures) = PLACEHOLDER_RE.captures(text) {
        let whole = captures.get(0).map(|m| m.as_str()).unwrap_or_default();
        if whole.len() == text.len() {
            if let Some(value) = parameters.get(&captures[1]) {
                return value.clone();
            }
        }
    }

    let replaced = PLACEHOLDER_RE.replace_all(text, |captures: &Captures<'_>| {
        match parameters.get(&captures[1]) {
            Some(Value::String(param)) => param.clone(),
            Some(other) => other.to_string(),
            None => captures[0].to_string(),
        }
    });
    Value::String(replaced.into_owned())
}

fn join_key_prefix(segments: &[&str]) -> String {
    segments
        .iter()
        .filter(|s| !s.is_empty())
        .copied()
        .collect::<Vec<_>>()
        .join("/")
}

#[cfg(test)]
mod tests {
    use super::*;

    const MESSAGE_ID: &str = "aws.ssm.11111111-2222-3333-4444-555555555555.i-0123";

    fn send_message(payload: &str) -> MdsMessage {
        MdsMessage {
            message_id: MESSAGE_ID.to_string(),
            topic: "aws.ssm.sendCommand.test".to_string(),
            payload: payload.to_string(),
            destination: "i-0123".to_string(),
            created_date: "2016-04-01T12:00:00Z".to_string(),
        }
    }

    fn sample_payload() -> String {
        serde_json::json!({
            "CommandId": "11111111-2222-3333-4444-555555555555",
            "DocumentName": "AWS-RunPowerShellScript",
            "Parameters": {"commands": ["hostname"], "workingDirectory": "C:\\tmp"},
            "DocumentContent": {
                "schemaVersion": "1.2",
                "runtimeConfig": {
                    "aws:runPowerShellScript": {
                        "properties": {
                            "commands": "{{ commands }}",
                            "workingDirectory": "run in {{ workingDirectory }}",
                            "outputS3BucketName": "bucket",
                            "outputS3KeyPrefix": "prefix"
                        }
                    }
                }
            },
            "OutputS3BucketName": "bucket",
            "OutputS3KeyPrefix": "out"
        })
        .to_string()
    }

    #[test]
    fn parses_send_command_into_document_state() {
        let config = AgentConfig::default();
        let msg = send_message(&sample_payload());

        let state = parse_message(&config, &msg).unwrap();

        assert_eq!(state.document_type, DocumentType::SendCommand);
        assert_eq!(state.document_info.message_id, MESSAGE_ID);
        assert_eq!(
            state.document_info.command_id,
            "11111111-2222-3333-4444-555555555555"
        );
        assert_eq!(state.document_info.instance_id, "i-0123");
        assert!(!state.document_info.document_id.is_empty());
        assert_eq!(state.instance_plugins_information.len(), 1);

        let plugin = &state.instance_plugins_information[0];
        assert_eq!(plugin.name, "aws:runPowerShellScript");
        assert!(!plugin.has_executed);
        assert_eq!(
            plugin.configuration.output_s3_key_prefix,
            "out/11111111-2222-3333-4444-555555555555/i-0123"
        );
        assert!(plugin
            .configuration
            .orchestration_directory
            .contains("11111111-2222-3333-4444-555555555555"));
    }

    #[test]
    fn whole_string_placeholder_keeps_parameter_type() {
        let config = AgentConfig::default();
        let msg = send_message(&sample_payload());

        let state = parse_message(&config, &msg).unwrap();
        let properties = &state.instance_plugins_information[0].configuration.properties;

        assert_eq!(properties["commands"], serde_json::json!(["hostname"]));
        assert_eq!(properties["workingDirectory"], "run in C:\\tmp");
    }

    #[test]
    fn unknown_placeholder_is_left_in_place() {
        let params = BTreeMap::new();
        let value = substitute_parameters(&serde_json::json!("{{ nope }}"), &params);
        assert_eq!(value, "{{ nope }}");
    }

    #[test]
    fn invalid_json_payload_is_rejected() {
        let config = AgentConfig::default();
        let msg = send_message("{ not json");
        assert!(matches!(
            parse_message(&config, &msg),
            Err(ParseError::InvalidPayload(_))
        ));
    }

    #[test]
    fn missing_document_name_is_rejected() {
        let config = AgentConfig::default();
        let msg = send_message(
            &serde_json::json!({
                "CommandId": "c",
                "DocumentContent": {"runtimeConfig": {"aws:x": {"properties": {}}}}
            })
            .to_string(),
        );
        assert!(matches!(
            parse_message(&config, &msg),
            Err(ParseError::MissingField("DocumentName"))
        ));
    }

    #[test]
    fn unexpected_topic_is_rejected() {
        let config = AgentConfig::default();
        let mut msg = send_message(&sample_payload());
        msg.topic = "aws.ssm.somethingElse.test".to_string();

        let err = parse_message(&config, &msg).unwrap_err();
        assert!(err.to_string().contains("unexpected topic name"));
    }

    #[test]
    fn parses_cancel_command() {
        let config = AgentConfig::default();
        let msg = MdsMessage {
            message_id: "aws.ssm.99999999-2222-3333-4444-555555555555.i-0123".to_string(),
            topic: "aws.ssm.cancelCommand.test".to_string(),
            payload: serde_json::json!({
                "CancelMessageId": MESSAGE_ID,
            })
            .to_string(),
            destination: "i-0123".to_string(),
            created_date: "2016-04-01T12:00:00Z".to_string(),
        };

        let state = parse_message(&config, &msg).unwrap();
        assert_eq!(state.document_type, DocumentType::CancelCommand);
        let cancel = state.cancel_information.unwrap();
        assert_eq!(cancel.cancel_message_id, MESSAGE_ID);
        assert_eq!(
            cancel.cancel_command_id,
            "11111111-2222-3333-4444-555555555555"
        );
    }

    #[test]
    fn cancel_without_target_is_rejected() {
        let config = AgentConfig::default();
        let msg = MdsMessage {
            message_id: "aws.ssm.9.i-0123".to_string(),
            topic: "aws.ssm.cancelCommand.test".to_string(),
            payload: "{}".to_string(),
            destination: "i-0123".to_string(),
            created_date: "now".to_string(),
        };
        assert!(matches!(
            parse_message(&config, &msg),
            Err(ParseError::MissingField("CancelMessageId"))
        ));
    }

    #[test]
    fn managed_instance_rewrite_strips_s3_outputs() {
        let config = AgentConfig {
            managed_instance: true,
            ..AgentConfig::default()
        };
        let payload = sample_payload().replace(
            "AWS-RunPowerShellScript",
            "AWS-ConfigureCloudWatch",
        );
        let msg = send_message(&payload);

        let state = parse_message(&config, &msg).unwrap();
        let plugin = &state.instance_plugins_information[0];

        assert!(plugin.configuration.output_s3_bucket_name.is_empty());
        assert!(plugin.configuration.output_s3_key_prefix.is_empty());
        assert!(plugin.configuration.properties.get("outputS3BucketName").is_none());
        assert!(plugin.configuration.properties.get("outputS3KeyPrefix").is_none());
        // Unrelated properties survive the rewrite.
        assert!(plugin.configuration.properties.get("commands").is_some());
    }

    #[test]
    fn rewrite_not_applied_on_ec2_instances() {
        let config = AgentConfig::default();
        let payload = sample_payload().replace(
            "AWS-RunPowerShellScript",
            "AWS-ConfigureCloudWatch",
        );
        let msg = send_message(&payload);

        let state = parse_message(&config, &msg).unwrap();
        let plugin = &state.instance_plugins_information[0];
        assert_eq!(plugin.configuration.output_s3_bucket_name, "bucket");
    }

    #[test]
    fn rewrite_failure_is_fatal_for_the_message() {
        let config = AgentConfig {
            managed_instance: true,
            ..AgentConfig::default()
        };
        let msg = send_message(
            &serde_json::json!({
                "CommandId": "c",
                "DocumentName": "AWS-ConfigureCloudWatch",
                "DocumentContent": {
                    "runtimeConfig": {"aws:cloudWatch": {"properties": "opaque"}}
                }
            })
            .to_string(),
        );

        assert!(matches!(
            parse_message(&config, &msg),
            Err(ParseError::RewriteFailed { .. })
        ));
    }
}
