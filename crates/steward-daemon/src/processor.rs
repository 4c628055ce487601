//! Command processor: polls the message service, validates and persists
//! messages, dispatches them to the plugin runner with bounded concurrency,
//! and reports results back.
//!
//! The processor owns two pools. Send commands execute in the send pool;
//! cancel commands execute in the cancel pool and reach back into the send
//! pool by key. The document store carries every command across the
//! pending -> current -> completed folder walk, which doubles as the crash
//! recovery protocol: on startup, documents found in current are resumed
//! (skipping plugins that already executed) and documents in pending are
//! re-dispatched.

use std::collections::{BTreeMap, HashSet};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};

use steward_core::config::AgentConfig;
use steward_core::contracts::{
    self, DocumentState, DocumentStatus, PluginResult, PluginState,
};
use steward_core::docstore::{DocumentStore, Folder};
use steward_core::stoppolicy::StopPolicy;
use steward_core::taskpool::{CancelFlag, PoolError, TaskPool};
use tracing::{debug, error, info, warn};

use crate::mds::{self, FailureType, MdsMessage, MdsService};
use crate::parser;

/// Callback through which the plugin runner publishes progress replies.
pub type ResponseFn<'a> = dyn Fn(&str, &str, &BTreeMap<String, PluginResult>) + 'a;

/// Executes an ordered set of plugin configurations.
///
/// Implementations receive only plugins that have not yet executed, so a
/// resumed document never re-runs finished work. The runner should invoke
/// `send_response` as each plugin completes so the console sees progress,
/// persist per-plugin progress to the document's current state, and poll
/// `cancel_flag` between plugins; an external process already in flight is
/// never aborted.
pub trait PluginRunner: Send + Sync {
    /// Runs `plugins` and returns the per-plugin results by name.
    fn run_plugins(
        &self,
        message_id: &str,
        plugins: &[PluginState],
        send_response: &ResponseFn<'_>,
        cancel_flag: &CancelFlag,
    ) -> BTreeMap<String, PluginResult>;
}

/// Top-level orchestrator for command messages.
pub struct Processor<S: MdsService + 'static> {
    config: AgentConfig,
    service: Arc<S>,
    store: DocumentStore,
    runner: Arc<dyn PluginRunner>,
    send_pool: TaskPool,
    cancel_pool: TaskPool,
    stop_policy: StopPolicy,
    /// Message ids whose documents reached the completed folder. Message
    /// ids are unique across the instance's lifetime, so membership makes
    /// reprocessing a redelivered message a constant-time no-op.
    completed_messages: Mutex<HashSet<String>>,
}

impl<S: MdsService + 'static> Processor<S> {
    /// Builds a processor and its worker pools.
    ///
    /// # Errors
    ///
    /// Returns [`PoolError`] when a pool's worker threads cannot be started.
    pub fn new(
        config: AgentConfig,
        service: Arc<S>,
        runner: Arc<dyn PluginRunner>,
    ) -> Result<Self, PoolError> {
        let send_pool = TaskPool::new("send-command", config.send_command_workers)?;
        let cancel_pool = TaskPool::new("cancel-command", config.cancel_command_workers)?;
        let store = DocumentStore::new(&config.data_root);
        let stop_policy = StopPolicy::new(
            "processor",
            config.stop_policy_threshold,
            config.stop_policy_cooldown,
        );

        // One walk of the completed folder at startup; from here on the
        // index is maintained as documents complete.
        let completed_messages = store
            .enumerate(&config.instance_id, Folder::Completed)
            .iter()
            .map(|id| {
                store
                    .get(id, &config.instance_id, Folder::Completed)
                    .document_info
                    .message_id
            })
            .filter(|message_id| !message_id.is_empty())
            .collect();

        Ok(Self {
            config,
            service,
            store,
            runner,
            send_pool,
            cancel_pool,
            stop_policy,
            completed_messages: Mutex::new(completed_messages),
        })
    }

    /// The document store this processor persists through.
    #[must_use]
    pub const fn store(&self) -> &DocumentStore {
        &self.store
    }

    /// Polls the message service once and processes everything it returned.
    ///
    /// Returns the number of messages processed. A tripped stop policy
    /// skips the poll entirely until its cooldown elapses.
    pub fn poll_once(self: &Arc<Self>) -> usize {
        if !self.stop_policy.is_healthy() {
            debug!("stop policy tripped, skipping poll");
            return 0;
        }

        let messages = match self.service.get_messages(&self.config.instance_id) {
            Ok(messages) => {
                self.stop_policy.reset();
                messages
            },
            Err(err) => {
                mds::handle_service_error(&self.stop_policy, &err);
                return 0;
            },
        };

        let count = messages.len();
        for msg in &messages {
            self.process_message(msg);
        }
        count
    }

    /// Processes one message: validate, parse, persist, acknowledge, and
    /// dispatch.
    pub fn process_message(self: &Arc<Self>, msg: &MdsMessage) {
        if let Err(reason) = validate(msg) {
            // No ack: the service will redeliver and the message may be
            // well-formed next time.
            warn!(message_id = %msg.message_id, reason, "dropping invalid message");
            return;
        }
        debug!(message_id = %msg.message_id, topic = %msg.topic, "processing message");

        // Redelivery of a message whose document already completed, i.e.
        // the earlier delete was lost in transit. The document is not
        // reopened; the message only needs deleting again. A document still
        // in flight is covered by the pool's keyed submit instead.
        if self.completed_messages().contains(&msg.message_id) {
            warn!(message_id = %msg.message_id, "redelivery of a completed message");
            if let Err(err) = self.service.delete_message(&msg.message_id) {
                mds::handle_service_error(&self.stop_policy, &err);
            }
            return;
        }

        let state = match parser::parse_message(&self.config, msg) {
            Ok(state) => state,
            Err(err) => {
                error!(message_id = %msg.message_id, error = %err, "message parse failed");
                if msg.topic.starts_with(&self.config.send_command_topic_prefix) {
                    self.send_doc_level_response(
                        &msg.message_id,
                        DocumentStatus::Failed,
                        &err.to_string(),
                    );
                }
                if let Err(fail_err) = self
                    .service
                    .fail_message(&msg.message_id, FailureType::InternalHandlerException)
                {
                    mds::handle_service_error(&self.stop_policy, &fail_err);
                }
                return;
            },
        };

        if let Err(err) = self.store.persist(&state, Folder::Pending) {
            error!(message_id = %msg.message_id, error = %err, "could not persist pending state");
            return;
        }

        if let Err(err) = self.service.acknowledge_message(&msg.message_id) {
            mds::handle_service_error(&self.stop_policy, &err);
            return;
        }
        self.stop_policy.reset();
        debug!(message_id = %msg.message_id, "ack done");

        self.send_doc_level_response(&msg.message_id, DocumentStatus::InProgress, "");
        self.execute_pending_document(state);
    }

    /// Moves a pending document to current and submits it for execution.
    pub fn execute_pending_document(self: &Arc<Self>, state: DocumentState) {
        let document_id = state.document_info.document_id.clone();
        let instance_id = state.document_info.instance_id.clone();
        if let Err(err) =
            self.store
                .move_document(&document_id, &instance_id, Folder::Pending, Folder::Current)
        {
            error!(document_id = %document_id, error = %err, "could not move document to current");
            return;
        }
        self.submit_current_document(state);
    }

    /// Submits a document already resting in current to the right pool,
    /// keyed by its message id.
    fn submit_current_document(self: &Arc<Self>, state: DocumentState) {
        let key = state.document_info.message_id.clone();
        let submitted = if state.document_type.is_cancel() {
            let this = Arc::clone(self);
            self.cancel_pool
                .submit(&key, move |_flag| this.process_cancel_command_message(state))
        } else {
            let this = Arc::clone(self);
            self.send_pool
                .submit(&key, move |flag| this.process_send_command_message(flag, &state))
        };

        if let Err(err) = submitted {
            // DuplicateJob means this message id is already in flight;
            // redelivery handling owns the message from here.
            warn!(message_id = %key, error = %err, "submit refused");
        }
    }

    /// Runs the not-yet-executed plugins of a send command and walks the
    /// document to its terminal folder.
    fn process_send_command_message(&self, cancel_flag: &CancelFlag, state: &DocumentState) {
        let document_id = &state.document_info.document_id;
        let instance_id = &state.document_info.instance_id;
        let message_id = &state.document_info.message_id;

        if cancel_flag.shut_down() {
            // Leave the document in current; the next start resumes it.
            info!(message_id = %message_id, "shutdown before execution, leaving document in current");
            return;
        }

        let pending: Vec<PluginState> = state
            .instance_plugins_information
            .iter()
            .filter(|p| !p.has_executed)
            .cloned()
            .collect();

        let outputs = if cancel_flag.canceled() {
            BTreeMap::new()
        } else {
            debug!(message_id = %message_id, plugins = pending.len(), "running plugins");
            let responder = |message_id: &str, reply_id: &str, outputs: &BTreeMap<String, PluginResult>| {
                self.send_response(message_id, reply_id, outputs);
            };
            self.runner
                .run_plugins(message_id, &pending, &responder, cancel_flag)
        };

        // Read back the interim state: the runner persists per-plugin
        // progress while it executes. Overlay this run's results; a plugin
        // that requested a reboot has not finished and stays eligible to
        // run again after the host is back.
        let mut interim = self.store.get(document_id, instance_id, Folder::Current);
        if interim.is_empty() {
            interim = state.clone();
        }
        for (name, result) in &outputs {
            if let Some(plugin) = interim
                .instance_plugins_information
                .iter_mut()
                .find(|p| p.name == *name)
            {
                plugin.result = Some(result.clone());
                plugin.has_executed =
                    !matches!(result.outcome, contracts::PluginOutcome::Reboot);
            }
        }

        // Aggregate over everything the document has produced so far, not
        // just this run: a document resumed after a crash or reboot carries
        // results from before it.
        let accumulated: BTreeMap<String, PluginResult> = interim
            .instance_plugins_information
            .iter()
            .filter_map(|p| p.result.as_ref().map(|r| (p.name.clone(), r.clone())))
            .collect();
        let mut payload = contracts::build_reply(&accumulated);
        if cancel_flag.canceled() {
            payload.document_status = DocumentStatus::Cancelled;
        }

        interim.document_info.document_status = payload.document_status;
        interim.document_info.runtime_status = payload.runtime_status.clone();
        interim.document_info.additional_info = payload.additional_info.clone();
        interim
            .document_info
            .document_trace_output
            .clone_from(&payload.document_trace_output);

        if let Err(err) = self.store.persist(&interim, Folder::Current) {
            error!(message_id = %message_id, error = %err, "could not persist final document info");
        }

        if cancel_flag.shut_down() {
            // Interrupted mid-document: stay in current for the next start.
            info!(message_id = %message_id, "shutdown during execution, leaving document in current");
            return;
        }

        debug!(message_id = %message_id, "sending reply on message completion");
        self.send_response(message_id, "", &accumulated);

        if interim.document_info.document_status == DocumentStatus::SuccessAndReboot {
            // The document resumes from current after the reboot, and the
            // undeleted message keeps the command alive on the service side.
            info!(message_id = %message_id, "document requested reboot, leaving state in current");
            return;
        }

        debug!(message_id = %message_id, "execution over, moving state to completed");
        if let Err(err) =
            self.store
                .move_document(document_id, instance_id, Folder::Current, Folder::Completed)
        {
            error!(message_id = %message_id, error = %err, "could not move document to completed");
            return;
        }
        self.record_completed(message_id);

        if self.has_update_plugin(&interim) {
            debug!(message_id = %message_id, "message deletion owned by the update plugin");
        } else if let Err(err) = self.service.delete_message(message_id) {
            mds::handle_service_error(&self.stop_policy, &err);
        }
    }

    /// Cancels the targeted send command and completes the cancel document.
    fn process_cancel_command_message(&self, mut state: DocumentState) {
        let Some(cancel) = state.cancel_information.as_mut() else {
            warn!(
                message_id = %state.document_info.message_id,
                "cancel document without cancel information"
            );
            return;
        };

        debug!(cancel_message_id = %cancel.cancel_message_id, "cancelling job");
        if self.send_pool.cancel(&cancel.cancel_message_id) {
            cancel.debug_info = format!("Command {} cancelled", cancel.cancel_command_id);
            state.document_info.document_status = DocumentStatus::Success;
        } else {
            debug!(
                cancel_message_id = %cancel.cancel_message_id,
                "job not found, possibly completed"
            );
            cancel.debug_info =
                format!("Command {} couldn't be cancelled", cancel.cancel_command_id);
            state.document_info.document_status = DocumentStatus::Failed;
        }

        let document_id = state.document_info.document_id.clone();
        let instance_id = state.document_info.instance_id.clone();
        let message_id = state.document_info.message_id.clone();

        if let Err(err) = self.store.persist(&state, Folder::Current) {
            error!(message_id = %message_id, error = %err, "could not persist cancel result");
        }
        if let Err(err) = self.store.move_document(
            &document_id,
            &instance_id,
            Folder::Current,
            Folder::Completed,
        ) {
            error!(message_id = %message_id, error = %err, "could not move cancel document");
            return;
        }
        self.record_completed(&message_id);
        if let Err(err) = self.service.delete_message(&message_id) {
            mds::handle_service_error(&self.stop_policy, &err);
        }
    }

    /// Resumes documents left in current by a crash or reboot.
    ///
    /// Executed plugins are skipped through their `has_executed` marker;
    /// unparseable states are quarantined.
    pub fn process_in_progress_documents(self: &Arc<Self>) {
        let instance_id = self.config.instance_id.clone();
        for document_id in self.store.enumerate(&instance_id, Folder::Current) {
            let state = self.store.get(&document_id, &instance_id, Folder::Current);
            if state.is_empty() {
                warn!(document_id = %document_id, "quarantining unparseable in-progress document");
                self.store.quarantine(&document_id, &instance_id, Folder::Current);
                continue;
            }
            info!(
                document_id = %document_id,
                message_id = %state.document_info.message_id,
                "resuming in-progress document"
            );
            self.submit_current_document(state);
        }
    }

    /// Re-dispatches documents accepted before a crash but never started.
    pub fn process_pending_documents(self: &Arc<Self>) {
        let instance_id = self.config.instance_id.clone();
        for document_id in self.store.enumerate(&instance_id, Folder::Pending) {
            let state = self.store.get(&document_id, &instance_id, Folder::Pending);
            if state.is_empty() {
                warn!(document_id = %document_id, "quarantining unparseable pending document");
                self.store.quarantine(&document_id, &instance_id, Folder::Pending);
                continue;
            }
            info!(document_id = %document_id, "re-dispatching pending document");
            self.execute_pending_document(state);
        }
    }

    /// Stops both pools, waiting up to the configured shutdown timeout for
    /// in-flight jobs to observe the signal.
    pub fn shutdown(&self) {
        let timeout = self.config.shutdown_timeout;
        self.send_pool.shutdown(timeout);
        self.cancel_pool.shutdown(timeout);
    }

    fn send_response(
        &self,
        message_id: &str,
        reply_id: &str,
        outputs: &BTreeMap<String, PluginResult>,
    ) {
        let payload = contracts::build_reply(outputs);
        self.send_payload(message_id, reply_id, &payload);
    }

    fn send_doc_level_response(&self, message_id: &str, status: DocumentStatus, info: &str) {
        let payload = contracts::DocumentPayload {
            document_status: status,
            document_trace_output: info.to_string(),
            ..contracts::DocumentPayload::default()
        };
        self.send_payload(message_id, "", &payload);
    }

    fn send_payload(&self, message_id: &str, reply_id: &str, payload: &contracts::DocumentPayload) {
        let body = match serde_json::to_string(payload) {
            Ok(body) => body,
            Err(err) => {
                error!(message_id = %message_id, error = %err, "could not serialize reply payload");
                return;
            },
        };
        match self.service.send_reply(message_id, reply_id, &body) {
            Ok(()) => self.stop_policy.reset(),
            Err(err) => mds::handle_service_error(&self.stop_policy, &err),
        }
    }

    fn completed_messages(&self) -> MutexGuard<'_, HashSet<String>> {
        self.completed_messages
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
    }

    fn record_completed(&self, message_id: &str) {
        self.completed_messages().insert(message_id.to_string());
    }

    fn has_update_plugin(&self, state: &DocumentState) -> bool {
        state
            .instance_plugins_information
            .iter()
            .any(|p| self.config.is_update_plugin(&p.name))
    }
}

fn validate(msg: &MdsMessage) -> Result<(), &'static str> {
    if msg.message_id.is_empty() {
        return Err("empty message id");
    }
    if msg.topic.is_empty() {
        return Err("empty topic");
    }
    if msg.payload.is_empty() {
        return Err("empty payload");
    }
    if msg.created_date.is_empty() {
        return Err("empty created date");
    }
    Ok(())
}
