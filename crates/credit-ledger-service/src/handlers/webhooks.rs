//! Billing provider webhooks.
//!
//! Each delivery is an envelope `{"id", "type", "data"}` signed with
//! HMAC-SHA256 over the raw body (hex, `x-webhook-signature`). Event ids are
//! claimed before processing so a redelivered event is acknowledged without
//! being applied twice. If processing fails the claim is released and the
//! error returned, so the provider's retry gets a fresh attempt.
//!
//! The exception is a store timeout during a credit: the add may have
//! committed, so the claim is kept and the event logged for reconciliation
//! rather than risk crediting twice.
//!
//! A redelivery that arrives while this instance is still processing the
//! same id gets `409 Conflict` so the provider retries it later. The mark is
//! per process: a concurrent redelivery landing on another instance finds the
//! claim and is acknowledged as a duplicate even if the first attempt later
//! fails and releases it.

use std::sync::Arc;

use axum::body::Bytes;
use axum::extract::State;
use axum::http::HeaderMap;
use axum::Json;
use chrono::Utc;
use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};

use credit_ledger_core::{Amount, BillingStatus, PlanId, SubscriptionStatus, UserId};

use crate::crypto::verify_signature;
use crate::error::ApiError;
use crate::state::AppState;

/// Header carrying the hex HMAC-SHA256 of the body.
pub const SIGNATURE_HEADER: &str = "x-webhook-signature";

/// Webhook envelope.
#[derive(Debug, Deserialize)]
pub struct BillingEvent {
    /// Provider event ID (idempotency key).
    pub id: String,
    /// Event type.
    #[serde(rename = "type")]
    pub event_type: String,
    /// Event payload.
    #[serde(default)]
    pub data: serde_json::Value,
}

/// Payload of `subscription.*` events.
#[derive(Debug, Deserialize)]
struct SubscriptionData {
    user_id: UserId,
    #[serde(default)]
    plan_id: Option<PlanId>,
}

/// Payload of `payment.captured` events.
#[derive(Debug, Deserialize)]
struct PaymentData {
    user_id: UserId,
    credits: Amount,
    #[serde(default)]
    payment_id: Option<String>,
}

/// Webhook response.
#[derive(Debug, Serialize)]
pub struct WebhookResponse {
    /// Whether the webhook was accepted.
    pub received: bool,
    /// Whether this event id had already been processed.
    pub duplicate: bool,
}

/// Handle billing provider webhooks.
pub async fn billing_webhook(
    State(state): State<Arc<AppState>>,
    headers: HeaderMap,
    body: Bytes,
) -> Result<Json<WebhookResponse>, ApiError> {
    if let Some(secret) = &state.config.webhook_secret {
        let signature = headers
            .get(SIGNATURE_HEADER)
            .and_then(|v| v.to_str().ok())
            .ok_or_else(|| ApiError::BadRequest("Missing webhook signature".into()))?;

        if !verify_signature(secret, &body, signature) {
            tracing::warn!("Invalid billing webhook signature");
            return Err(ApiError::BadRequest("Invalid webhook signature".into()));
        }
    } else {
        tracing::warn!("Webhook secret not configured - skipping signature verification");
    }

    let event: BillingEvent =
        serde_json::from_slice(&body).map_err(|e| ApiError::BadRequest(e.to_string()))?;

    tracing::info!(
        event_type = %event.event_type,
        event_id = %event.id,
        "Received billing webhook"
    );

    let Some(_in_flight) = state.in_flight.begin(&event.id) else {
        tracing::info!(event_id = %event.id, "Billing webhook already in progress");
        return Err(ApiError::Conflict(format!(
            "event {} is already being processed",
            event.id
        )));
    };

    if !state.ledger.claim_event(&event.id, &event.event_type).await? {
        tracing::info!(event_id = %event.id, "Duplicate billing webhook ignored");
        return Ok(Json(WebhookResponse {
            received: true,
            duplicate: true,
        }));
    }

    if let Err(e) = process_event(&state, &event).await {
        if may_have_applied(&event, &e) {
            tracing::error!(
                event_id = %event.id,
                event_type = %event.event_type,
                error = %e,
                "Billing webhook timed out mid-credit; claim kept, reconcile manually"
            );
            return Err(e);
        }

        tracing::warn!(event_id = %event.id, error = %e, "Billing webhook failed, releasing event");
        if let Err(release_err) = state.ledger.release_event(&event.id).await {
            tracing::error!(
                event_id = %event.id,
                error = %release_err,
                "Failed to release webhook event; redeliveries will be ignored"
            );
        }
        return Err(e);
    }

    Ok(Json(WebhookResponse {
        received: true,
        duplicate: false,
    }))
}

/// Whether a failed event may still have changed a balance.
///
/// Subscription events only set a status and grant once per period, so
/// replaying them is harmless. A credit that timed out may have committed.
fn may_have_applied(event: &BillingEvent, err: &ApiError) -> bool {
    event.event_type == "payment.captured" && matches!(err, ApiError::StoreUnavailable(_))
}

async fn process_event(state: &AppState, event: &BillingEvent) -> Result<(), ApiError> {
    match event.event_type.as_str() {
        "subscription.activated" => {
            handle_subscription_started(state, event, SubscriptionStatus::Active).await
        }
        "subscription.trialing" => {
            handle_subscription_started(state, event, SubscriptionStatus::Trialing).await
        }
        "subscription.halted" => {
            handle_subscription_ended(state, event, SubscriptionStatus::Inactive).await
        }
        "subscription.cancelled" => {
            handle_subscription_ended(state, event, SubscriptionStatus::Cancelled).await
        }
        "payment.captured" => handle_payment_captured(state, event).await,
        _ => {
            tracing::debug!(event_type = %event.event_type, "Unhandled billing event");
            Ok(())
        }
    }
}

fn parse_data<T: DeserializeOwned>(event: &BillingEvent) -> Result<T, ApiError> {
    serde_json::from_value(event.data.clone()).map_err(|e| {
        ApiError::BadRequest(format!("invalid {} payload: {e}", event.event_type))
    })
}

/// Mark the subscription entitled and apply the plan grant if due.
async fn handle_subscription_started(
    state: &AppState,
    event: &BillingEvent,
    status: SubscriptionStatus,
) -> Result<(), ApiError> {
    let data: SubscriptionData = parse_data(event)?;
    let plan_id = data
        .plan_id
        .ok_or_else(|| ApiError::BadRequest(format!("{} requires plan_id", event.event_type)))?;

    // Reject unknown plans before recording an entitlement to them.
    state.ledger.get_plan(&plan_id).await?;

    let billing = BillingStatus::new(data.user_id.clone(), Some(plan_id.clone()), status);
    state.ledger.set_billing_status(&billing).await?;

    let outcome = state
        .ledger
        .grant_if_due(&data.user_id, &plan_id, Utc::now())
        .await?;

    tracing::info!(
        user_id = %data.user_id,
        plan_id = %plan_id,
        granted = outcome.granted,
        balance = outcome.balance,
        "Subscription started"
    );
    Ok(())
}

/// Record that the subscription no longer entitles grants.
///
/// The plan is kept for reference: from the event if present, otherwise
/// from the stored status.
async fn handle_subscription_ended(
    state: &AppState,
    event: &BillingEvent,
    status: SubscriptionStatus,
) -> Result<(), ApiError> {
    let data: SubscriptionData = parse_data(event)?;

    let plan_id = match data.plan_id {
        Some(plan_id) => Some(plan_id),
        None => state
            .ledger
            .billing_status(&data.user_id)
            .await?
            .and_then(|existing| existing.plan_id),
    };

    let billing = BillingStatus::new(data.user_id.clone(), plan_id, status);
    state.ledger.set_billing_status(&billing).await?;

    tracing::info!(user_id = %data.user_id, status = status.as_str(), "Subscription ended");
    Ok(())
}

/// Credit a confirmed one-off purchase.
async fn handle_payment_captured(state: &AppState, event: &BillingEvent) -> Result<(), ApiError> {
    let data: PaymentData = parse_data(event)?;
    let reference = data.payment_id.as_deref().unwrap_or(&event.id);
    let reason = format!("payment {reference}");

    let balance = state.ledger.add(&data.user_id, data.credits, &reason).await?;

    tracing::info!(
        user_id = %data.user_id,
        credits = data.credits.get(),
        balance,
        "Payment credited"
    );
    Ok(())
}
