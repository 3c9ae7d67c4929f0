//! Billing status types.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::{PlanId, UserId};

/// Whether a user's subscription entitles them to periodic grants.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct BillingStatus {
    /// The user this status belongs to.
    pub user_id: UserId,

    /// Subscribed plan, if any. No plan means no entitlement.
    pub plan_id: Option<PlanId>,

    /// Subscription state.
    pub status: SubscriptionStatus,

    /// When the status was last changed.
    pub updated_at: DateTime<Utc>,
}

impl BillingStatus {
    /// Create a billing status.
    #[must_use]
    pub fn new(user_id: UserId, plan_id: Option<PlanId>, status: SubscriptionStatus) -> Self {
        Self {
            user_id,
            plan_id,
            status,
            updated_at: Utc::now(),
        }
    }

    /// Whether periodic grants apply: an entitled status and a plan.
    #[must_use]
    pub fn is_entitled(&self) -> bool {
        self.status.is_entitled() && self.plan_id.is_some()
    }
}

/// Status of a subscription.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SubscriptionStatus {
    /// Paid and current.
    Active,

    /// In a trial period.
    Trialing,

    /// Payment lapsed or subscription paused.
    Inactive,

    /// Cancelled by the user or provider.
    Cancelled,
}

impl SubscriptionStatus {
    /// Whether this status receives periodic grants.
    #[must_use]
    pub const fn is_entitled(self) -> bool {
        matches!(self, Self::Active | Self::Trialing)
    }

    /// Get the status name as a string.
    #[must_use]
    pub const fn as_str(self) -> &'static str {
        match self {
            Self::Active => "active",
            Self::Trialing => "trialing",
            Self::Inactive => "inactive",
            Self::Cancelled => "cancelled",
        }
    }
}

impl std::str::FromStr for SubscriptionStatus {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "active" => Ok(Self::Active),
            "trialing" => Ok(Self::Trialing),
            "inactive" => Ok(Self::Inactive),
            "cancelled" => Ok(Self::Cancelled),
            other => Err(format!("unknown subscription status: {other}")),
        }
    }
}
