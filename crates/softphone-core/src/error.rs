//! Error types for the softphone session engine
//!
//! Every fallible operation returns [`PhoneResult`]. Errors are grouped into an
//! [`ErrorCategory`] that decides how the engine reacts to them:
//!
//! - **Transient network** - dropped connections and timeouts. The engine
//!   retries these with exponential backoff and only emits informational events.
//! - **Protocol rejection** - the server refused a request (401/403, a rejected
//!   invite, a failed subscription). Retried at most the configured number of
//!   times, then surfaced as a terminal failure event.
//! - **Resource exhaustion** - all three lines are occupied. Rejected at once,
//!   nothing is queued.
//! - **Malformed input** - an unparseable presence body decodes to `unknown`
//!   and never reaches the caller. Invalid DTMF digits are reported.
//! - **Invalid state** - the command does not apply to the current state of the
//!   line, call, registration or agent. Check state first.
//!
//! ```rust
//! use rvoip_softphone_core::{ErrorCategory, PhoneError};
//!
//! let err = PhoneError::NoCapacity { resource: "line" };
//! assert_eq!(err.category(), ErrorCategory::ResourceExhaustion);
//! assert!(!err.is_recoverable());
//! ```

use std::fmt;

use serde::{Deserialize, Serialize};
use thiserror::Error;

use crate::agent::AgentState;
use crate::call::{CallId, CallState};
use crate::line::LineId;

/// Result type alias for softphone operations
pub type PhoneResult<T> = Result<T, PhoneError>;

/// Coarse error taxonomy used for recovery decisions and UI reporting
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum ErrorCategory {
    TransientNetwork,
    ProtocolRejection,
    ResourceExhaustion,
    MalformedInput,
    InvalidState,
    Configuration,
    Internal,
}

impl ErrorCategory {
    pub fn as_str(&self) -> &'static str {
        match self {
            ErrorCategory::TransientNetwork => "transient-network",
            ErrorCategory::ProtocolRejection => "protocol-rejection",
            ErrorCategory::ResourceExhaustion => "resource-exhaustion",
            ErrorCategory::MalformedInput => "malformed-input",
            ErrorCategory::InvalidState => "invalid-state",
            ErrorCategory::Configuration => "configuration",
            ErrorCategory::Internal => "internal",
        }
    }
}

impl fmt::Display for ErrorCategory {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Errors reported by a [`SignalingEngine`](crate::engine::SignalingEngine) implementation
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum EngineError {
    #[error("Transport error: {reason}")]
    Transport { reason: String },

    #[error("Engine request timed out")]
    Timeout,

    #[error("Request rejected with {code}: {reason}")]
    Rejected { code: u16, reason: String },

    #[error("Unknown session or handle: {id}")]
    NotFound { id: String },

    #[error("Engine failure: {reason}")]
    Internal { reason: String },
}

impl EngineError {
    pub fn transport(reason: impl Into<String>) -> Self {
        Self::Transport { reason: reason.into() }
    }

    pub fn rejected(code: u16, reason: impl Into<String>) -> Self {
        Self::Rejected { code, reason: reason.into() }
    }

    /// 401, 403 and 407 responses
    pub fn is_auth_rejection(&self) -> bool {
        matches!(self, EngineError::Rejected { code: 401 | 403 | 407, .. })
    }
}

/// Errors reported by the agent administration API
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum AdminApiError {
    #[error("Admin API unavailable: {reason}")]
    Unavailable { reason: String },

    #[error("Admin API rejected the action: {reason}")]
    Rejected { reason: String },
}

/// Errors produced by the softphone session engine
#[derive(Error, Debug, Clone, PartialEq)]
pub enum PhoneError {
    // ===== Connection =====
    #[error("Not connected to the signaling server")]
    NotConnected,

    #[error("Not registered with the signaling server")]
    NotRegistered,

    #[error("Registration failed after {attempts} attempts: {reason}")]
    RegistrationFailed { attempts: u32, reason: String },

    // ===== Lines and calls =====
    #[error("No free {resource} available")]
    NoCapacity { resource: &'static str },

    #[error("Invalid line number: {line}")]
    InvalidLine { line: u8 },

    #[error("Line {line} has no call")]
    LineIdle { line: LineId },

    #[error("Call not found: {call_id}")]
    CallNotFound { call_id: CallId },

    #[error("Cannot {operation} call on line {line} in state {state:?}")]
    InvalidCallState {
        line: LineId,
        state: CallState,
        operation: &'static str,
    },

    #[error("Another operation is already in progress on {entity}")]
    OperationInProgress { entity: String },

    #[error("No attended transfer in progress on line {line}")]
    NoTransferInProgress { line: LineId },

    #[error("Transfer from line {line} failed: {reason}")]
    TransferFailed { line: LineId, reason: String },

    #[error("Invalid DTMF digits: {digits:?}")]
    InvalidDtmf { digits: String },

    // ===== Presence =====
    #[error("Subscription to {extension} failed after {attempts} attempts: {reason}")]
    SubscriptionFailed {
        extension: String,
        attempts: u32,
        reason: String,
    },

    // ===== Agent =====
    #[error("Agent cannot {action} while {state:?}")]
    InvalidAgentState {
        state: AgentState,
        action: &'static str,
    },

    #[error(transparent)]
    AdminApi(#[from] AdminApiError),

    // ===== Generic =====
    #[error("Operation '{operation}' timed out after {duration_ms}ms")]
    OperationTimeout { operation: String, duration_ms: u64 },

    #[error("Operation '{operation}' was cancelled")]
    Cancelled { operation: String },

    #[error(transparent)]
    Engine(#[from] EngineError),

    #[error("Invalid configuration for {field}: {reason}")]
    InvalidConfiguration { field: String, reason: String },

    #[error("Internal error: {message}")]
    InternalError { message: String },
}

impl PhoneError {
    pub fn in_progress(entity: impl Into<String>) -> Self {
        Self::OperationInProgress { entity: entity.into() }
    }

    pub fn cancelled(operation: impl Into<String>) -> Self {
        Self::Cancelled { operation: operation.into() }
    }

    pub fn invalid_configuration(field: impl Into<String>, reason: impl Into<String>) -> Self {
        Self::InvalidConfiguration {
            field: field.into(),
            reason: reason.into(),
        }
    }

    pub fn internal_error(message: impl Into<String>) -> Self {
        Self::InternalError { message: message.into() }
    }

    /// Classify this error for recovery decisions
    pub fn category(&self) -> ErrorCategory {
        match self {
            PhoneError::NotConnected | PhoneError::OperationTimeout { .. } => {
                ErrorCategory::TransientNetwork
            }

            PhoneError::Engine(engine) => match engine {
                EngineError::Transport { .. } | EngineError::Timeout => {
                    ErrorCategory::TransientNetwork
                }
                EngineError::Rejected { .. } => ErrorCategory::ProtocolRejection,
                EngineError::NotFound { .. } | EngineError::Internal { .. } => {
                    ErrorCategory::Internal
                }
            },

            PhoneError::RegistrationFailed { .. }
            | PhoneError::SubscriptionFailed { .. }
            | PhoneError::TransferFailed { .. }
            | PhoneError::AdminApi(_) => ErrorCategory::ProtocolRejection,

            PhoneError::NoCapacity { .. } => ErrorCategory::ResourceExhaustion,

            PhoneError::InvalidDtmf { .. } => ErrorCategory::MalformedInput,

            PhoneError::NotRegistered
            | PhoneError::InvalidLine { .. }
            | PhoneError::LineIdle { .. }
            | PhoneError::CallNotFound { .. }
            | PhoneError::InvalidCallState { .. }
            | PhoneError::OperationInProgress { .. }
            | PhoneError::NoTransferInProgress { .. }
            | PhoneError::InvalidAgentState { .. }
            | PhoneError::Cancelled { .. } => ErrorCategory::InvalidState,

            PhoneError::InvalidConfiguration { .. } => ErrorCategory::Configuration,

            PhoneError::InternalError { .. } => ErrorCategory::Internal,
        }
    }

    /// Whether retrying the same command later can succeed without user intervention
    pub fn is_recoverable(&self) -> bool {
        match self {
            PhoneError::OperationInProgress { .. } | PhoneError::TransferFailed { .. } => true,
            _ => self.category() == ErrorCategory::TransientNetwork,
        }
    }

    /// Whether the error was caused by the server refusing credentials
    pub fn is_auth_error(&self) -> bool {
        matches!(self, PhoneError::Engine(e) if e.is_auth_rejection())
    }
}
