//! API handlers.

pub mod admin;
pub mod health;
pub mod ledger;
pub mod webhooks;
