//! # Softphone-Core
//!
//! Call and presence session engine for call-center softphones.
//!
//! This crate provides:
//! - A pool of three call lines with at most one active line
//! - SIP registration with bounded exponential retry and refresh
//! - Busy-lamp-field (BLF) presence subscriptions with batching, refresh and
//!   stale detection
//! - Blind and attended transfers
//! - Agent state (login, logout, pause, resume) via an admin API or in-band
//!   feature codes
//! - Transport supervision with heartbeat and reconnection
//!
//! ## Architecture
//!
//! The SIP stack and media plane sit behind the [`SignalingEngine`] trait.
//! [`Softphone`] owns the components and an event pump that routes engine
//! events to them. All state changes are published on the [`EventBus`].
//! Every timer tied to the connection lives in one
//! [`TimerScope`](timer::TimerScope), so losing the transport cancels all of
//! them at once.
//!
//! [`mock::MockEngine`] is a scriptable in-memory engine for tests and the
//! `softphone-sim` binary.

pub mod agent;
pub mod call;
pub mod config;
pub mod engine;
pub mod error;
pub mod events;
pub mod line;
pub mod logging;
pub mod mock;
pub mod phone;
pub mod presence;
pub mod recovery;
pub mod registration;
pub mod timer;
pub mod transport;

pub use agent::{AgentAction, AgentActionOutcome, AgentAdminApi, AgentContext, AgentState};
pub use call::{CallDirection, CallId, CallInfo, CallState, TerminationReason};
pub use config::{ConfigStore, Credentials, PhoneConfig, StaticConfigStore};
pub use engine::{EngineEvent, RemoteSessionState, SessionHandle, SignalingEngine, SubscriptionHandle};
pub use error::{AdminApiError, EngineError, ErrorCategory, PhoneError, PhoneResult};
pub use events::{EventBus, EventStream, PhoneEvent, RejectionReason};
pub use line::{LineId, LineSnapshot, LineStatus, LINE_COUNT};
pub use phone::{Softphone, SoftphoneBuilder};
pub use presence::{BatchReport, PresenceValue, SubscriptionInfo, SubscriptionStatus};
pub use registration::RegistrationState;
pub use transport::TransportState;
