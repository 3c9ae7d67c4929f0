//! Application state.

use std::collections::HashSet;
use std::sync::{Arc, Mutex, PoisonError};

use credit_ledger_store::Store;

use crate::config::ServiceConfig;
use crate::ledger::Ledger;

/// Application state shared across handlers.
pub struct AppState {
    /// Ledger operations over the configured store.
    pub ledger: Ledger,

    /// Service configuration.
    pub config: ServiceConfig,

    /// Webhook events this instance is processing right now.
    pub in_flight: InFlightEvents,
}

impl AppState {
    /// Create a new application state.
    #[must_use]
    pub fn new(store: Arc<dyn Store>, config: ServiceConfig) -> Self {
        if config.webhook_secret.is_none() {
            tracing::warn!(
                "WEBHOOK_SECRET not configured - webhook signatures will not be verified"
            );
        }

        let ledger = Ledger::new(store, config.grant_period, config.store_timeout());

        Self {
            ledger,
            config,
            in_flight: InFlightEvents::default(),
        }
    }
}

/// Set of webhook event ids being processed in this process.
#[derive(Debug, Default)]
pub struct InFlightEvents {
    ids: Mutex<HashSet<String>>,
}

impl InFlightEvents {
    /// Mark `event_id` as in flight until the returned guard is dropped.
    ///
    /// Returns `None` if it is already in flight.
    #[must_use]
    pub fn begin(&self, event_id: &str) -> Option<InFlightGuard<'_>> {
        let inserted = self
            .ids
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .insert(event_id.to_string());
        inserted.then(|| InFlightGuard {
            events: self,
            event_id: event_id.to_string(),
        })
    }
}

/// Clears an in-flight mark on drop.
#[derive(Debug)]
pub struct InFlightGuard<'a> {
    events: &'a InFlightEvents,
    event_id: String,
}

impl Drop for InFlightGuard<'_> {
    fn drop(&mut self) {
        self.events
            .ids
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .remove(&self.event_id);
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn second_begin_is_refused_until_guard_drops() {
        let events = InFlightEvents::default();

        let guard = events.begin("evt_1").unwrap();
        assert!(events.begin("evt_1").is_none());
        assert!(events.begin("evt_2").is_some());

        drop(guard);
        assert!(events.begin("evt_1").is_some());
    }
}
