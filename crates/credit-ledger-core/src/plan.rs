//! Plan catalog.
//!
//! The catalog is the single source of truth for how many credits each
//! subscription tier is entitled to. It carries a version that increases on
//! every administrative change so callers can tell which revision they read.

use std::collections::BTreeMap;

use serde::{Deserialize, Serialize};

use crate::error::LedgerError;
use crate::PlanId;

/// Number of days a monthly allotment is spread over for the informational daily rate.
pub const GRANT_DAYS_PER_MONTH: i64 = 30;

/// Plans seeded when no catalog file is configured: `(plan_id, monthly_credits)`.
pub const DEFAULT_PLANS: &[(&str, i64)] = &[("one_t", 12_000), ("one_z", 50_000), ("one_pro", 150_000)];

/// A subscription tier's credit entitlement.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PlanDescriptor {
    /// Plan identifier.
    pub plan_id: PlanId,

    /// Credits the balance is reset to on each grant.
    pub monthly_credits: i64,
}

impl PlanDescriptor {
    /// Create a plan descriptor.
    ///
    /// # Errors
    ///
    /// Returns [`LedgerError::InvalidAmount`] if `monthly_credits` is negative.
    pub fn new(plan_id: PlanId, monthly_credits: i64) -> Result<Self, LedgerError> {
        if monthly_credits < 0 {
            return Err(LedgerError::InvalidAmount {
                amount: monthly_credits,
            });
        }
        Ok(Self {
            plan_id,
            monthly_credits,
        })
    }

    /// Informational daily rate (`monthly_credits / 30`, rounded down).
    #[must_use]
    pub const fn daily_grant(&self) -> i64 {
        self.monthly_credits / GRANT_DAYS_PER_MONTH
    }
}

/// A versioned set of plan descriptors, one per plan id.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PlanCatalog {
    /// Revision counter, bumped on every change.
    pub version: u64,

    /// Plans keyed by id.
    pub plans: BTreeMap<PlanId, PlanDescriptor>,
}

/// On-disk catalog format.
#[derive(Debug, Deserialize)]
struct CatalogFile {
    #[serde(default)]
    version: u64,
    plans: Vec<PlanEntry>,
}

#[derive(Debug, Deserialize)]
struct PlanEntry {
    plan_id: PlanId,
    monthly_credits: i64,
}

impl PlanCatalog {
    /// Create an empty catalog at version 0.
    #[must_use]
    pub fn empty() -> Self {
        Self {
            version: 0,
            plans: BTreeMap::new(),
        }
    }

    /// Look up a plan.
    #[must_use]
    pub fn get(&self, plan_id: &PlanId) -> Option<&PlanDescriptor> {
        self.plans.get(plan_id)
    }

    /// Insert or replace a plan and bump the version.
    pub fn upsert(&mut self, plan: PlanDescriptor) {
        self.plans.insert(plan.plan_id.clone(), plan);
        self.version += 1;
    }

    /// Iterate plans in id order.
    pub fn iter(&self) -> impl Iterator<Item = &PlanDescriptor> {
        self.plans.values()
    }

    /// Parse a catalog from JSON: `{"version": 3, "plans": [{"plan_id": "...", "monthly_credits": 1}]}`.
    ///
    /// # Errors
    ///
    /// Returns [`LedgerError::Configuration`] on malformed JSON, duplicate plan
    /// ids, or negative credit amounts.
    pub fn from_json(json: &str) -> Result<Self, LedgerError> {
        let file: CatalogFile = serde_json::from_str(json)
            .map_err(|e| LedgerError::Configuration(format!("invalid plan catalog: {e}")))?;

        let mut plans = BTreeMap::new();
        for entry in file.plans {
            let plan = PlanDescriptor::new(entry.plan_id, entry.monthly_credits).map_err(|_| {
                LedgerError::Configuration(format!(
                    "plan catalog: negative monthly_credits {}",
                    entry.monthly_credits
                ))
            })?;
            let id = plan.plan_id.clone();
            if plans.insert(id.clone(), plan).is_some() {
                return Err(LedgerError::Configuration(format!(
                    "plan catalog: duplicate plan_id {id}"
                )));
            }
        }

        Ok(Self {
            version: file.version,
            plans,
        })
    }
}

impl Default for PlanCatalog {
    fn default() -> Self {
        let plans = DEFAULT_PLANS
            .iter()
            .filter_map(|(id, credits)| {
                let plan_id = PlanId::new(*id).ok()?;
                Some((
                    plan_id.clone(),
                    PlanDescriptor {
                        plan_id,
                        monthly_credits: *credits,
                    },
                ))
            })
            .collect();
        Self { version: 1, plans }
    }
}
