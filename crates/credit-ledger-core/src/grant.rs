//! Periodic grant types.
//!
//! A grant resets a subscriber's balance to their plan's entitlement once per
//! period. The period check lives here so every store backend evaluates it the
//! same way while holding its own lock on the balance row.

use chrono::{DateTime, Datelike, Duration, Utc};
use serde::{Deserialize, Serialize};

use crate::PlanId;

/// How often a grant may be applied.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum GrantPeriod {
    /// At most once every 24 hours.
    Daily,

    /// At most once per calendar month (UTC).
    #[default]
    Monthly,
}

impl GrantPeriod {
    /// Whether a grant is due at `now` given the previous grant time.
    ///
    /// A missing previous grant is always due. A previous grant in the future
    /// (clock skew between instances) is never due.
    #[must_use]
    pub fn is_due(self, last_grant_at: Option<DateTime<Utc>>, now: DateTime<Utc>) -> bool {
        let Some(last) = last_grant_at else {
            return true;
        };
        if last > now {
            return false;
        }
        match self {
            Self::Daily => now - last >= Duration::hours(24),
            Self::Monthly => (last.year(), last.month()) < (now.year(), now.month()),
        }
    }

    /// Get the period name as a string.
    #[must_use]
    pub const fn as_str(self) -> &'static str {
        match self {
            Self::Daily => "daily",
            Self::Monthly => "monthly",
        }
    }
}

impl std::str::FromStr for GrantPeriod {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_ascii_lowercase().as_str() {
            "daily" => Ok(Self::Daily),
            "monthly" => Ok(Self::Monthly),
            other => Err(format!("unknown grant period: {other}")),
        }
    }
}

/// Parameters for an atomic grant, resolved from the plan catalog.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct GrantRequest {
    /// Plan the grant is for (recorded on the transaction).
    pub plan_id: PlanId,

    /// Balance to reset to.
    pub credits: i64,

    /// Period gating the grant.
    pub period: GrantPeriod,
}

/// Result of a grant attempt.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct GrantOutcome {
    /// Whether the balance was reset by this call.
    pub granted: bool,

    /// Balance after the call.
    pub balance: i64,
}

impl GrantOutcome {
    /// A grant that was applied.
    #[must_use]
    pub const fn granted(balance: i64) -> Self {
        Self {
            granted: true,
            balance,
        }
    }

    /// A grant that was not due (or not entitled).
    #[must_use]
    pub const fn not_granted(balance: i64) -> Self {
        Self {
            granted: false,
            balance,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::TimeZone;

    fn at(y: i32, m: u32, d: u32, h: u32) -> DateTime<Utc> {
        Utc.with_ymd_and_hms(y, m, d, h, 0, 0).unwrap()
    }

    #[test]
    fn never_granted_is_due() {
        assert!(GrantPeriod::Daily.is_due(None, at(2026, 1, 1, 0)));
        assert!(GrantPeriod::Monthly.is_due(None, at(2026, 1, 1, 0)));
    }

    #[test]
    fn daily_requires_full_day() {
        let last = at(2026, 3, 10, 12);
        assert!(!GrantPeriod::Daily.is_due(Some(last), at(2026, 3, 11, 11)));
        assert!(GrantPeriod::Daily.is_due(Some(last), at(2026, 3, 11, 12)));
    }

    #[test]
    fn monthly_uses_calendar_boundary() {
        let last = at(2026, 3, 31, 23);
        assert!(!GrantPeriod::Monthly.is_due(Some(last), at(2026, 3, 31, 23)));
        assert!(GrantPeriod::Monthly.is_due(Some(last), at(2026, 4, 1, 0)));

        let early = at(2026, 3, 1, 0);
        assert!(!GrantPeriod::Monthly.is_due(Some(early), at(2026, 3, 30, 0)));
    }

    #[test]
    fn monthly_handles_year_rollover() {
        assert!(GrantPeriod::Monthly.is_due(Some(at(2025, 12, 15, 0)), at(2026, 1, 2, 0)));
    }

    #[test]
    fn future_last_grant_is_not_due() {
        let now = at(2026, 5, 1, 0);
        assert!(!GrantPeriod::Daily.is_due(Some(at(2026, 6, 1, 0)), now));
        assert!(!GrantPeriod::Monthly.is_due(Some(at(2026, 6, 1, 0)), now));
    }

    #[test]
    fn period_parses_case_insensitively() {
        assert_eq!("Daily".parse::<GrantPeriod>(), Ok(GrantPeriod::Daily));
        assert_eq!("monthly".parse::<GrantPeriod>(), Ok(GrantPeriod::Monthly));
        assert!("weekly".parse::<GrantPeriod>().is_err());
    }
}
