//! Credit Ledger Client SDK.
//!
//! This crate provides a client library for services that spend credits
//! (generation endpoints, exports, chat) to talk to the credit ledger API.
//!
//! # Example
//!
//! ```no_run
//! use credit_ledger_client::{ChargeOutcome, ClientOptions, LedgerClient};
//! use credit_ledger_core::{Amount, UserId};
//!
//! # async fn render(prompt: &str) -> Result<String, std::io::Error> { Ok(prompt.into()) }
//! # async fn example() -> Result<(), Box<dyn std::error::Error>> {
//! let client = LedgerClient::with_options(
//!     "http://credit-ledger.internal:8080",
//!     "your-service-api-key",
//!     ClientOptions::with_service_name("video-gen"),
//! )?;
//!
//! let user_id = UserId::new("user_2abc")?;
//! let outcome = client
//!     .charge(&user_id, Amount::new(10)?, "video generation", || render("a cat"))
//!     .await?;
//!
//! match outcome {
//!     ChargeOutcome::Completed { balance, .. } => println!("done, {balance} credits left"),
//!     ChargeOutcome::Insufficient { available, required } => {
//!         println!("need {required} credits, have {available}");
//!     }
//!     ChargeOutcome::Failed { error, refunded } => {
//!         println!("render failed ({error}), refunded: {refunded}");
//!     }
//! }
//! # Ok(())
//! # }
//! ```

#![forbid(unsafe_code)]
#![warn(missing_docs)]
#![warn(clippy::all)]
#![warn(clippy::pedantic)]

mod client;
mod error;
mod types;

pub use client::{ClientOptions, LedgerClient};
pub use error::ClientError;
pub use types::{BalanceResponse, ChargeOutcome, TransactionEntry};
