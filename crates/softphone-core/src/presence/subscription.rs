//! Subscription records

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use tokio::time::Instant;
use tokio_util::sync::CancellationToken;

use super::PresenceValue;
use crate::engine::SubscriptionHandle;

/// Lifecycle of one presence subscription
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum SubscriptionStatus {
    Idle,
    /// SUBSCRIBE sent or accepted, no NOTIFY yet
    Pending,
    Active,
    /// Renewing an active subscription
    Refreshing,
    /// Retries exhausted or the release failed
    Failed,
    /// Terminated by the notifier
    Expired,
}

impl SubscriptionStatus {
    /// Statuses for which a new subscribe request is redundant
    pub fn is_live(&self) -> bool {
        matches!(
            self,
            SubscriptionStatus::Idle
                | SubscriptionStatus::Pending
                | SubscriptionStatus::Active
                | SubscriptionStatus::Refreshing
        )
    }
}

/// Point-in-time view of a subscription
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SubscriptionInfo {
    pub extension: String,
    pub status: SubscriptionStatus,
    pub presence: PresenceValue,
    /// Expiry granted by the notifier, in seconds
    pub expires: Option<u32>,
    pub retry_count: u32,
    pub created_at: DateTime<Utc>,
    pub last_notification_at: Option<DateTime<Utc>>,
}

pub(crate) struct Subscription {
    pub extension: String,
    pub status: SubscriptionStatus,
    pub presence: PresenceValue,
    pub handle: Option<SubscriptionHandle>,
    pub expires: Option<u32>,
    pub retry_count: u32,
    pub created_at: DateTime<Utc>,
    pub last_notification_at: Option<DateTime<Utc>>,
    /// Last NOTIFY, or the subscribe response until the first NOTIFY
    pub last_heard: Instant,
    /// Identifies the request run that owns this record
    pub epoch: u64,
    pub in_flight: bool,
    /// Cancels the in-flight request run
    pub token: CancellationToken,
}

impl Subscription {
    pub fn new(extension: impl Into<String>, epoch: u64, token: CancellationToken) -> Self {
        Self {
            extension: extension.into(),
            status: SubscriptionStatus::Idle,
            presence: PresenceValue::Unknown,
            handle: None,
            expires: None,
            retry_count: 0,
            created_at: Utc::now(),
            last_notification_at: None,
            last_heard: Instant::now(),
            epoch,
            in_flight: false,
            token,
        }
    }

    pub fn info(&self) -> SubscriptionInfo {
        SubscriptionInfo {
            extension: self.extension.clone(),
            status: self.status,
            presence: self.presence,
            expires: self.expires,
            retry_count: self.retry_count,
            created_at: self.created_at,
            last_notification_at: self.last_notification_at,
        }
    }
}
