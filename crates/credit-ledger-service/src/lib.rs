//! Credit ledger HTTP API service.
//!
//! This crate provides the HTTP API for the credit ledger, including:
//!
//! - Balance queries and transaction history
//! - Deduct / add / refund / grant operations for internal callers
//! - Plan catalog and billing status administration
//! - Billing provider webhooks
//!
//! The [`Ledger`] facade is also usable in-process by callers that embed the
//! ledger instead of talking to it over HTTP.
//!
//! # Authentication
//!
//! 1. **Service API key** (`x-api-key`) - for ledger operations
//! 2. **Admin code** (`x-admin-code`) - for catalog and billing administration
//! 3. **Webhook signature** (`x-webhook-signature`) - for provider events

#![forbid(unsafe_code)]
#![warn(missing_docs)]
#![warn(clippy::all)]
#![warn(clippy::pedantic)]
// Allow some pedantic lints that are noisy for Axum handler functions
#![allow(clippy::missing_errors_doc)] // Axum handlers all return Result
#![allow(clippy::unused_async)] // Health handler needs async for routing

pub mod auth;
pub mod config;
pub mod crypto;
pub mod error;
pub mod handlers;
pub mod ledger;
pub mod routes;
pub mod state;

pub use config::{ConfigError, ServiceConfig, StoreBackend};
pub use error::ApiError;
pub use ledger::{ChargeOutcome, Ledger};
pub use routes::create_router;
pub use state::AppState;
