//! Shared fakes and helpers for the processor integration tests.

#![allow(dead_code)]

use std::collections::BTreeMap;
use std::path::Path;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::mpsc::Sender;
use std::sync::Mutex;
use std::time::{Duration, Instant};

use steward_core::config::AgentConfig;
use steward_core::contracts::{
    DocumentInfo, DocumentState, DocumentStatus, DocumentType, PluginConfiguration, PluginOutcome,
    PluginResult, PluginState,
};
use steward_core::taskpool::CancelFlag;
use steward_daemon::mds::{FailureType, MdsError, MdsMessage, MdsService};
use steward_daemon::processor::{PluginRunner, ResponseFn};

pub const INSTANCE: &str = "i-0123456789abcdef0";

pub fn test_config(data_root: &Path) -> AgentConfig {
    AgentConfig {
        instance_id: INSTANCE.to_string(),
        data_root: data_root.to_path_buf(),
        orchestration_root: data_root.join("orchestration"),
        package_root: data_root.join("packages"),
        shutdown_timeout: Duration::from_secs(5),
        ..AgentConfig::default()
    }
}

/// Records every service call; never fails unless told to.
#[derive(Default)]
pub struct FakeMds {
    pub acks: Mutex<Vec<String>>,
    pub replies: Mutex<Vec<(String, String)>>,
    pub deletes: Mutex<Vec<String>>,
    pub failures: Mutex<Vec<(String, FailureType)>>,
    pub fail_get_transiently: AtomicBool,
    pub get_calls: AtomicUsize,
}

impl MdsService for FakeMds {
    fn get_messages(&self, _instance_id: &str) -> Result<Vec<MdsMessage>, MdsError> {
        self.get_calls.fetch_add(1, Ordering::SeqCst);
        if self.fail_get_transiently.load(Ordering::SeqCst) {
            return Err(MdsError::Transient("throttled".to_string()));
        }
        Ok(Vec::new())
    }

    fn acknowledge_message(&self, message_id: &str) -> Result<(), MdsError> {
        self.acks.lock().unwrap().push(message_id.to_string());
        Ok(())
    }

    fn send_reply(&self, message_id: &str, _reply_id: &str, payload: &str) -> Result<(), MdsError> {
        self.replies
            .lock()
            .unwrap()
            .push((message_id.to_string(), payload.to_string()));
        Ok(())
    }

    fn fail_message(&self, message_id: &str, failure: FailureType) -> Result<(), MdsError> {
        self.failures
            .lock()
            .unwrap()
            .push((message_id.to_string(), failure));
        Ok(())
    }

    fn delete_message(&self, message_id: &str) -> Result<(), MdsError> {
        self.deletes.lock().unwrap().push(message_id.to_string());
        Ok(())
    }
}

/// Scripted plugin runner: records which plugins it was asked to run and
/// answers every one with a fixed outcome. The blocking variant parks on
/// the cancel flag so tests can interleave cancellation and shutdown.
pub struct FakeRunner {
    pub invocations: Mutex<Vec<Vec<String>>>,
    pub outcome: PluginOutcome,
    pub wait_for_signal: bool,
    pub started: Mutex<Option<Sender<()>>>,
}

impl FakeRunner {
    pub fn success() -> Self {
        Self::with_outcome(PluginOutcome::Success {
            code: 0,
            output: "ok".to_string(),
        })
    }

    pub fn with_outcome(outcome: PluginOutcome) -> Self {
        Self {
            invocations: Mutex::new(Vec::new()),
            outcome,
            wait_for_signal: false,
            started: Mutex::new(None),
        }
    }

    pub fn blocking(started: Sender<()>) -> Self {
        Self {
            invocations: Mutex::new(Vec::new()),
            outcome: PluginOutcome::Success {
                code: 0,
                output: "ok".to_string(),
            },
            wait_for_signal: true,
            started: Mutex::new(Some(started)),
        }
    }

    pub fn invocation_count(&self) -> usize {
        self.invocations.lock().unwrap().len()
    }
}

impl PluginRunner for FakeRunner {
    fn run_plugins(
        &self,
        _message_id: &str,
        plugins: &[PluginState],
        _send_response: &ResponseFn<'_>,
        cancel_flag: &CancelFlag,
    ) -> BTreeMap<String, PluginResult> {
        self.invocations
            .lock()
            .unwrap()
            .push(plugins.iter().map(|p| p.name.clone()).collect());
        if let Some(tx) = &*self.started.lock().unwrap() {
            let _ = tx.send(());
        }
        if self.wait_for_signal {
            let _ = cancel_flag.wait();
            if cancel_flag.canceled() {
                return BTreeMap::new();
            }
        }
        plugins
            .iter()
            .map(|p| (p.name.clone(), PluginResult::now(self.outcome.clone())))
            .collect()
    }
}

pub fn send_command_message(message_id: &str, plugin_name: &str) -> MdsMessage {
    let payload = serde_json::json!({
        "CommandId": steward_core::contracts::command_id(message_id),
        "DocumentName": "AWS-RunShellScript",
        "Parameters": {},
        "DocumentContent": {
            "schemaVersion": "1.2",
            "runtimeConfig": {
                plugin_name: {"properties": {"commands": ["hostname"]}}
            }
        },
        "OutputS3BucketName": "",
        "OutputS3KeyPrefix": ""
    });
    MdsMessage {
        message_id: message_id.to_string(),
        topic: "aws.ssm.sendCommand.AWS-RunShellScript".to_string(),
        payload: payload.to_string(),
        destination: INSTANCE.to_string(),
        created_date: "2016-04-01T12:00:00Z".to_string(),
    }
}

pub fn cancel_command_message(message_id: &str, cancel_message_id: &str) -> MdsMessage {
    let payload = serde_json::json!({
        "CancelMessageId": cancel_message_id,
    });
    MdsMessage {
        message_id: message_id.to_string(),
        topic: "aws.ssm.cancelCommand.AWS-RunShellScript".to_string(),
        payload: payload.to_string(),
        destination: INSTANCE.to_string(),
        created_date: "2016-04-01T12:00:00Z".to_string(),
    }
}

/// A document state shaped like what the parser produces, for seeding the
/// store directly in recovery tests.
pub fn sample_doc_state(document_id: &str, message_id: &str, plugins: Vec<PluginState>) -> DocumentState {
    DocumentState {
        document_info: DocumentInfo {
            document_id: document_id.to_string(),
            instance_id: INSTANCE.to_string(),
            message_id: message_id.to_string(),
            command_id: steward_core::contracts::command_id(message_id),
            document_name: "AWS-RunShellScript".to_string(),
            created_date: "2016-04-01T12:00:00Z".to_string(),
            document_status: DocumentStatus::InProgress,
            ..DocumentInfo::default()
        },
        document_type: DocumentType::SendCommand,
        instance_plugins_information: plugins,
        cancel_information: None,
    }
}

pub fn plugin_state(name: &str, has_executed: bool, result: Option<PluginResult>) -> PluginState {
    PluginState {
        name: name.to_string(),
        configuration: PluginConfiguration {
            plugin_name: name.to_string(),
            ..PluginConfiguration::default()
        },
        result,
        has_executed,
    }
}

/// Polls `condition` until it holds or a generous deadline expires.
pub fn wait_until(what: &str, mut condition: impl FnMut() -> bool) {
    let deadline = Instant::now() + Duration::from_secs(10);
    while !condition() {
        assert!(Instant::now() < deadline, "timed out waiting for {what}");
        std::thread::sleep(Duration::from_millis(10));
    }
}
