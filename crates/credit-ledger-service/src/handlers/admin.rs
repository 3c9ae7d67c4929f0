//! Admin handlers for the plan catalog and billing statuses.

use std::sync::Arc;

use axum::extract::rejection::JsonRejection;
use axum::extract::{Path, State};
use axum::Json;
use chrono::Utc;
use serde::{Deserialize, Serialize};

use credit_ledger_core::{
    BillingStatus, GrantOutcome, PlanDescriptor, PlanId, SubscriptionStatus, UserId,
};

use crate::auth::AdminAuth;
use crate::error::ApiError;
use crate::state::AppState;

/// Plan response.
#[derive(Debug, Serialize)]
pub struct PlanResponse {
    /// Plan ID.
    pub plan_id: String,
    /// Credits granted per period.
    pub monthly_credits: i64,
    /// Informational daily rate (monthly / 30).
    pub daily_grant: i64,
}

impl From<&PlanDescriptor> for PlanResponse {
    fn from(plan: &PlanDescriptor) -> Self {
        Self {
            plan_id: plan.plan_id.to_string(),
            monthly_credits: plan.monthly_credits,
            daily_grant: plan.daily_grant(),
        }
    }
}

/// Catalog response.
#[derive(Debug, Serialize)]
pub struct CatalogResponse {
    /// Catalog version; bumped on every plan change.
    pub version: u64,
    /// All plans, ordered by ID.
    pub plans: Vec<PlanResponse>,
}

/// List the plan catalog.
pub async fn list_plans(
    State(state): State<Arc<AppState>>,
    _admin: AdminAuth,
) -> Result<Json<CatalogResponse>, ApiError> {
    let catalog = state.ledger.catalog().await?;

    Ok(Json(CatalogResponse {
        version: catalog.version,
        plans: catalog.iter().map(PlanResponse::from).collect(),
    }))
}

/// Plan update request.
#[derive(Debug, Deserialize)]
pub struct PutPlanRequest {
    /// Credits granted per period.
    pub monthly_credits: i64,
}

/// Plan update response.
#[derive(Debug, Serialize)]
pub struct PutPlanResponse {
    /// Catalog version after the update.
    pub version: u64,
    /// The stored plan.
    pub plan: PlanResponse,
}

/// Create or replace a plan.
pub async fn put_plan(
    State(state): State<Arc<AppState>>,
    admin: AdminAuth,
    Path(plan_id): Path<String>,
    payload: Result<Json<PutPlanRequest>, JsonRejection>,
) -> Result<Json<PutPlanResponse>, ApiError> {
    let Json(body) = payload.map_err(|e| ApiError::BadRequest(e.body_text()))?;
    let plan = PlanDescriptor::new(PlanId::new(plan_id)?, body.monthly_credits)?;

    let version = state.ledger.put_plan(&plan).await?;
    tracing::info!(admin_id = %admin.admin_id, plan_id = %plan.plan_id, version, "Admin updated plan");

    Ok(Json(PutPlanResponse {
        version,
        plan: PlanResponse::from(&plan),
    }))
}

/// Billing status response.
#[derive(Debug, Serialize)]
pub struct BillingResponse {
    /// User ID.
    pub user_id: String,
    /// Subscribed plan, if any.
    pub plan_id: Option<String>,
    /// Subscription state.
    pub status: SubscriptionStatus,
    /// Whether periodic grants apply.
    pub entitled: bool,
    /// Last change.
    pub updated_at: String,
    /// Grant applied as part of this request, if one was requested.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub grant: Option<GrantOutcome>,
}

impl From<&BillingStatus> for BillingResponse {
    fn from(status: &BillingStatus) -> Self {
        Self {
            user_id: status.user_id.to_string(),
            plan_id: status.plan_id.as_ref().map(ToString::to_string),
            status: status.status,
            entitled: status.is_entitled(),
            updated_at: status.updated_at.to_rfc3339(),
            grant: None,
        }
    }
}

/// Get a user's billing status.
pub async fn get_billing(
    State(state): State<Arc<AppState>>,
    _admin: AdminAuth,
    Path(user_id): Path<String>,
) -> Result<Json<BillingResponse>, ApiError> {
    let user_id = UserId::new(user_id)?;
    let status = state
        .ledger
        .billing_status(&user_id)
        .await?
        .ok_or_else(|| ApiError::NotFound(format!("no billing status for {user_id}")))?;

    Ok(Json(BillingResponse::from(&status)))
}

/// Billing status update request.
#[derive(Debug, Deserialize)]
pub struct PutBillingRequest {
    /// Subscribed plan. Must exist in the catalog.
    #[serde(default)]
    pub plan_id: Option<PlanId>,
    /// Subscription state.
    pub status: SubscriptionStatus,
    /// Apply the plan grant right away if one is due.
    #[serde(default)]
    pub grant: bool,
}

/// Set a user's billing status.
pub async fn put_billing(
    State(state): State<Arc<AppState>>,
    admin: AdminAuth,
    Path(user_id): Path<String>,
    payload: Result<Json<PutBillingRequest>, JsonRejection>,
) -> Result<Json<BillingResponse>, ApiError> {
    let Json(body) = payload.map_err(|e| ApiError::BadRequest(e.body_text()))?;
    let user_id = UserId::new(user_id)?;

    if let Some(plan_id) = &body.plan_id {
        state.ledger.get_plan(plan_id).await?;
    }

    let status = BillingStatus::new(user_id.clone(), body.plan_id.clone(), body.status);
    state.ledger.set_billing_status(&status).await?;
    tracing::info!(admin_id = %admin.admin_id, user_id = %user_id, status = status.status.as_str(), "Admin updated billing status");

    let grant = match (&body.plan_id, body.grant) {
        (Some(plan_id), true) => Some(
            state
                .ledger
                .grant_if_due(&user_id, plan_id, Utc::now())
                .await?,
        ),
        _ => None,
    };

    let mut response = BillingResponse::from(&status);
    response.grant = grant;
    Ok(Json(response))
}
