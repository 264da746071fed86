//! The signaling and media engine boundary
//!
//! The session engine never touches the wire. Everything protocol-level (SIP
//! over WebSocket, SDP, ICE, codecs, audio devices) lives behind
//! [`SignalingEngine`], which the host application implements on top of its
//! user agent. Requests are async methods. Unsolicited traffic (incoming
//! invites, remote state changes, NOTIFY bodies, transport drops) arrives as
//! [`EngineEvent`]s on a broadcast channel.

use std::fmt;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use tokio::sync::broadcast;

use crate::config::Credentials;
use crate::error::EngineError;
use crate::line::LineId;

/// Opaque identifier of one signaling session (dialog) inside the engine
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct SessionHandle(pub String);

impl SessionHandle {
    pub fn new(id: impl Into<String>) -> Self {
        Self(id.into())
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for SessionHandle {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

/// Opaque identifier of one event subscription inside the engine
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct SubscriptionHandle(pub String);

impl SubscriptionHandle {
    pub fn new(id: impl Into<String>) -> Self {
        Self(id.into())
    }
}

impl fmt::Display for SubscriptionHandle {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

/// Result of a successful REGISTER
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct RegisterOutcome {
    /// Expiry granted by the registrar, in seconds
    pub expires: Option<u32>,
}

/// Result of a successful SUBSCRIBE
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SubscribeOutcome {
    pub handle: SubscriptionHandle,
    /// Expiry advertised by the notifier, in seconds
    pub expires: Option<u32>,
}

/// Media requested when placing or answering a call
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct MediaOptions {
    pub audio: bool,
    pub video: bool,
}

impl Default for MediaOptions {
    fn default() -> Self {
        Self { audio: true, video: false }
    }
}

/// Direction change requested by a re-INVITE
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum Renegotiation {
    /// Put the remote party on hold (sendonly)
    Hold,
    /// Restore bidirectional media (sendrecv)
    Resume,
}

/// Remote-driven progress of a session
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum RemoteSessionState {
    Progress,
    Ringing,
    Accepted,
    Rejected { code: u16, reason: String },
    Terminated { reason: String },
    /// The transferee accepted a REFER (202)
    TransferAccepted,
    /// The transfer target answered (NOTIFY sipfrag 200)
    TransferSucceeded,
    TransferFailed { reason: String },
}

/// Unsolicited events produced by the engine
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum EngineEvent {
    TransportConnected,
    TransportDisconnected {
        reason: String,
    },
    InviteReceived {
        session: SessionHandle,
        from: String,
        display_name: Option<String>,
    },
    SessionStateChanged {
        session: SessionHandle,
        state: RemoteSessionState,
    },
    NotificationReceived {
        extension: String,
        body: String,
        /// Remaining subscription lifetime from `Subscription-State`
        expires: Option<u32>,
        /// `Subscription-State: terminated`
        terminated: bool,
    },
    SubscriptionTerminated {
        extension: String,
        reason: String,
    },
}

/// The external signaling and media engine
#[async_trait]
pub trait SignalingEngine: Send + Sync {
    async fn connect(&self, server_uri: &str) -> Result<(), EngineError>;

    async fn disconnect(&self) -> Result<(), EngineError>;

    /// Lightweight keep-alive probe (OPTIONS or WebSocket ping)
    async fn ping(&self) -> Result<(), EngineError>;

    async fn register(&self, credentials: &Credentials) -> Result<RegisterOutcome, EngineError>;

    async fn unregister(&self) -> Result<(), EngineError>;

    async fn invite(&self, target: &str, media: MediaOptions) -> Result<SessionHandle, EngineError>;

    async fn accept(&self, session: &SessionHandle, media: MediaOptions) -> Result<(), EngineError>;

    async fn reject(&self, session: &SessionHandle, code: u16) -> Result<(), EngineError>;

    /// BYE for established sessions, CANCEL for early ones
    async fn terminate(&self, session: &SessionHandle) -> Result<(), EngineError>;

    async fn renegotiate(&self, session: &SessionHandle, direction: Renegotiation) -> Result<(), EngineError>;

    /// REFER, with `replaces` naming the consultation session of an attended transfer
    async fn refer(
        &self,
        session: &SessionHandle,
        target: &str,
        replaces: Option<&SessionHandle>,
    ) -> Result<(), EngineError>;

    async fn send_dtmf(&self, session: &SessionHandle, digits: &str) -> Result<(), EngineError>;

    async fn subscribe(&self, target: &str, event_package: &str) -> Result<SubscribeOutcome, EngineError>;

    async fn unsubscribe(&self, handle: &SubscriptionHandle) -> Result<(), EngineError>;

    /// Dial a feature-code sequence on a line that carries no user call
    async fn send_in_band_signal(&self, line: LineId, sequence: &str) -> Result<(), EngineError>;

    fn subscribe_events(&self) -> broadcast::Receiver<EngineEvent>;
}
