//! Message-delivery-service collaborator contract.
//!
//! The concrete wire client lives outside this crate; the processor only
//! depends on this trait. Every call may fail transiently, and the caller
//! routes those failures through its stop policy.

use steward_core::stoppolicy::StopPolicy;
use tracing::{error, warn};

/// One command message pulled from the delivery service.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct MdsMessage {
    /// Globally unique message identifier.
    pub message_id: String,
    /// Routing topic, e.g. `aws.ssm.sendCommand.AWS-RunPowerShellScript`.
    pub topic: String,
    /// JSON document payload.
    pub payload: String,
    /// Target instance identity.
    pub destination: String,
    /// Creation timestamp as reported by the service.
    pub created_date: String,
}

/// Failure categories reported back to the service.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FailureType {
    /// The handler raised an internal error while processing the message.
    InternalHandlerException,
    /// No handler is registered for the message's topic.
    NoHandlerExists,
}

impl FailureType {
    /// Wire label of the failure type.
    #[must_use]
    pub const fn as_str(self) -> &'static str {
        match self {
            Self::InternalHandlerException => "InternalHandlerException",
            Self::NoHandlerExists => "NoHandlerExists",
        }
    }
}

/// Errors surfaced by a message-service client.
#[derive(Debug, thiserror::Error)]
pub enum MdsError {
    /// Throttling or a server-side failure; worth backing off and retrying.
    #[error("transient message service error: {0}")]
    Transient(String),

    /// A client-side rejection; retrying the same call will not help.
    #[error("permanent message service error: {0}")]
    Permanent(String),
}

impl MdsError {
    /// Whether the error should feed the caller's stop policy.
    #[must_use]
    pub const fn is_transient(&self) -> bool {
        matches!(self, Self::Transient(_))
    }
}

/// Receive, acknowledge, reply, fail, and delete operations of the remote
/// message-delivery service.
pub trait MdsService: Send + Sync {
    /// Polls for messages addressed to `instance_id`.
    ///
    /// # Errors
    ///
    /// Returns [`MdsError`] when the service call fails.
    fn get_messages(&self, instance_id: &str) -> Result<Vec<MdsMessage>, MdsError>;

    /// Acknowledges receipt of a message.
    ///
    /// # Errors
    ///
    /// Returns [`MdsError`] when the service call fails.
    fn acknowledge_message(&self, message_id: &str) -> Result<(), MdsError>;

    /// Sends a reply payload for a message. `reply_id` is empty for the
    /// final document-level reply.
    ///
    /// # Errors
    ///
    /// Returns [`MdsError`] when the service call fails.
    fn send_reply(&self, message_id: &str, reply_id: &str, payload: &str) -> Result<(), MdsError>;

    /// Reports that the message could not be handled.
    ///
    /// # Errors
    ///
    /// Returns [`MdsError`] when the service call fails.
    fn fail_message(&self, message_id: &str, failure: FailureType) -> Result<(), MdsError>;

    /// Deletes a fully processed message.
    ///
    /// # Errors
    ///
    /// Returns [`MdsError`] when the service call fails.
    fn delete_message(&self, message_id: &str) -> Result<(), MdsError>;
}

/// Routes a service error through the owning subsystem's stop policy:
/// transient errors count toward back-off, permanent ones are only logged.
pub fn handle_service_error(policy: &StopPolicy, err: &MdsError) {
    if err.is_transient() {
        warn!(error = %err, "transient message service failure");
        policy.record_error();
    } else {
        error!(error = %err, "permanent message service failure");
    }
}

#[cfg(test)]
mod tests {
    use std::time::Duration;

    use super::*;

    #[test]
    fn transient_errors_feed_the_stop_policy() {
        let policy = StopPolicy::new("test", 2, Duration::from_secs(60));

        handle_service_error(&policy, &MdsError::Transient("throttled".to_string()));
        assert_eq!(policy.error_count(), 1);

        handle_service_error(&policy, &MdsError::Permanent("bad request".to_string()));
        assert_eq!(policy.error_count(), 1);

        handle_service_error(&policy, &MdsError::Transient("throttled".to_string()));
        assert!(!policy.is_healthy());
    }

    #[test]
    fn failure_type_labels() {
        assert_eq!(
            FailureType::InternalHandlerException.as_str(),
            "InternalHandlerException"
        );
        assert_eq!(FailureType::NoHandlerExists.as_str(), "NoHandlerExists");
    }
}
