use serde::{Deserialize, Serialize};
use thiserror::Error;

/// Core error type for the Accord runtime
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum CoreError {
    /// Flow instance not found
    #[error("Flow instance not found: {0}")]
    FlowNotFound(String),

    /// No flow registered under the given name
    #[error("Flow not registered: {0}")]
    FlowNotRegistered(String),

    /// Session not found
    #[error("Session not found: {0}")]
    SessionNotFound(String),

    /// Illegal flow state transition
    #[error("Flow state error: {0}")]
    FlowStateError(String),

    /// Checkpoint could not be written or read back
    #[error("Checkpoint error: {0}")]
    CheckpointError(String),

    /// Storage error
    #[error("State store error: {0}")]
    StateStoreError(String),

    /// Transaction not found in local storage
    #[error("Transaction not found: {0}")]
    TransactionNotFound(String),

    /// Messaging error
    #[error("Messaging error: {0}")]
    MessagingError(String),

    /// Cryptographic key or signature error
    #[error("Signature error: {0}")]
    SignatureError(String),

    /// Serialization error
    #[error("Serialization error: {0}")]
    SerializationError(String),

    /// Ledger rules rejected a transaction
    #[error("Transaction verification failed: {0}")]
    VerificationError(String),

    /// Configuration error
    #[error("Configuration error: {0}")]
    ConfigurationError(String),

    /// The manager has not finished restoring checkpoints
    #[error("State machine manager is not started")]
    NotStarted,

    /// Input/output error
    #[error("Input/output error: {0}")]
    IOError(String),

    /// Generic error
    #[error("{0}")]
    Other(String),
}

impl From<serde_json::Error> for CoreError {
    fn from(err: serde_json::Error) -> Self {
        CoreError::SerializationError(err.to_string())
    }
}

impl From<std::io::Error> for CoreError {
    fn from(err: std::io::Error) -> Self {
        CoreError::IOError(err.to_string())
    }
}

impl From<String> for CoreError {
    fn from(err: String) -> Self {
        CoreError::Other(err)
    }
}

impl From<&str> for CoreError {
    fn from(err: &str) -> Self {
        CoreError::Other(err.to_string())
    }
}

/// A protocol-level exception raised deliberately by flow logic.
///
/// Unlike other failures, a `FlowException` is sent to every counterparty of
/// the failing flow so that their flows can abort with the same cause.
#[derive(Error, Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[error("{code}: {message}")]
pub struct FlowException {
    /// Stable machine-readable code, e.g. `state_replacement.rejected`
    pub code: String,
    /// Human-readable description
    pub message: String,
}

impl FlowException {
    /// Create a new flow exception
    pub fn new(code: impl Into<String>, message: impl Into<String>) -> Self {
        Self {
            code: code.into(),
            message: message.into(),
        }
    }
}

/// Outcome error of a flow.
///
/// This is what an external waiter on a flow sees when the flow does not
/// complete. It is serializable so that failed flows can be reported from a
/// checkpointed state.
#[derive(Error, Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub enum FlowError {
    /// Deliberate protocol exception raised by local or counterparty logic
    #[error("Flow exception: {0}")]
    Protocol(FlowException),

    /// A received payload did not have the expected type
    #[error("Expected {expected} on session {session} but received {actual} (suspended at {site})")]
    UnexpectedMessageType {
        /// Session the payload arrived on
        session: String,
        /// Declared type tag
        expected: String,
        /// Delivered type tag
        actual: String,
        /// Where the flow was suspended
        site: String,
    },

    /// No reply arrived within the session timeout
    #[error("Session {session} with {party} timed out after {timeout_ms}ms")]
    SessionTimeout {
        /// Session that timed out
        session: String,
        /// Counterparty name
        party: String,
        /// Configured timeout
        timeout_ms: u64,
    },

    /// The counterparty refused to open the session
    #[error("Session {session} rejected by {party}: {reason}")]
    SessionRejected {
        /// Session that was rejected
        session: String,
        /// Counterparty name
        party: String,
        /// Reason given by the counterparty
        reason: String,
    },

    /// The counterparty ended the session while we were waiting for data
    #[error("Counterparty {party} ended session {session}")]
    SessionEnded {
        /// Session that ended
        session: String,
        /// Counterparty name
        party: String,
    },

    /// The counterparty flow failed with an error it did not disclose
    #[error("Counterparty {party} failed unexpectedly")]
    CounterpartyFailed {
        /// Counterparty name
        party: String,
    },

    /// The awaited transaction will never be committed
    #[error("Transaction {hash} will never be committed")]
    TransactionNotCommitted {
        /// Transaction hash
        hash: String,
    },

    /// Local storage or engine failure
    #[error("Flow engine error: {0}")]
    Engine(String),

    /// Flow logic misuse, e.g. resuming with an event it cannot handle
    #[error("Flow logic error: {0}")]
    Logic(String),
}

impl FlowError {
    /// Protocol exception code if this is a protocol-level failure
    pub fn exception_code(&self) -> Option<&str> {
        match self {
            FlowError::Protocol(exception) => Some(exception.code.as_str()),
            _ => None,
        }
    }

    /// Exception to signal to counterparties when a flow fails with this error
    pub fn to_counterparty_exception(&self) -> Option<FlowException> {
        match self {
            FlowError::Protocol(exception) => Some(exception.clone()),
            _ => None,
        }
    }
}

impl From<FlowException> for FlowError {
    fn from(exception: FlowException) -> Self {
        FlowError::Protocol(exception)
    }
}

impl From<CoreError> for FlowError {
    fn from(err: CoreError) -> Self {
        FlowError::Engine(err.to_string())
    }
}

impl From<serde_json::Error> for FlowError {
    fn from(err: serde_json::Error) -> Self {
        FlowError::Engine(format!("Serialization error: {}", err))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::{Error as IoError, ErrorKind};

    #[test]
    fn test_error_display() {
        let errors = vec![
            (CoreError::FlowNotFound("f1".to_string()), "Flow instance not found: f1"),
            (CoreError::SessionNotFound("s1".to_string()), "Session not found: s1"),
            (CoreError::CheckpointError("bad".to_string()), "Checkpoint error: bad"),
            (CoreError::TransactionNotFound("abc".to_string()), "Transaction not found: abc"),
            (CoreError::NotStarted, "State machine manager is not started"),
            (CoreError::Other("other_err".to_string()), "other_err"),
        ];

        for (error, expected_msg) in errors {
            assert_eq!(error.to_string(), expected_msg);
        }
    }

    #[test]
    fn test_from_serde_json_error() {
        let json_error = serde_json::from_str::<serde_json::Value>("invalid json").unwrap_err();
        let error: CoreError = json_error.into();

        match error {
            CoreError::SerializationError(msg) => assert!(msg.contains("expected value")),
            _ => panic!("Expected SerializationError variant"),
        }
    }

    #[test]
    fn test_from_io_error() {
        let io_error = IoError::new(ErrorKind::NotFound, "file not found");
        let error: CoreError = io_error.into();
        assert!(matches!(error, CoreError::IOError(msg) if msg.contains("file not found")));
    }

    #[test]
    fn test_protocol_errors_are_signalled_to_counterparties() {
        let exception = FlowException::new("demo.refused", "no thanks");
        let error = FlowError::from(exception.clone());

        assert_eq!(error.exception_code(), Some("demo.refused"));
        assert_eq!(error.to_counterparty_exception(), Some(exception));

        let engine = FlowError::from(CoreError::StateStoreError("disk".to_string()));
        assert_eq!(engine.exception_code(), None);
        assert_eq!(engine.to_counterparty_exception(), None);
    }

    #[test]
    fn test_flow_error_serializes() {
        let error = FlowError::SessionTimeout {
            session: "s".to_string(),
            party: "Bob".to_string(),
            timeout_ms: 10,
        };
        let json = serde_json::to_string(&error).unwrap();
        let back: FlowError = serde_json::from_str(&json).unwrap();
        assert_eq!(back, error);
        assert_eq!(back.to_string(), "Session s with Bob timed out after 10ms");
    }
}
