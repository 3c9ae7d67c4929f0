//! Common test utilities for credit-ledger integration tests.

#![allow(dead_code)] // Some utilities are used by different test files

use std::sync::Arc;

use async_trait::async_trait;
use axum::http::{HeaderName, HeaderValue};
use axum::Router;
use axum_test::{TestRequest, TestServer};
use chrono::{DateTime, Utc};
use tokio::sync::Notify;

use credit_ledger_core::{
    AccountBalance, Amount, BillingStatus, DeductOutcome, GrantOutcome, GrantPeriod,
    GrantRequest, LedgerAction, LedgerTransaction, PlanCatalog, PlanDescriptor, PlanId, UserId,
};
use credit_ledger_service::crypto::hmac_sha256_hex;
use credit_ledger_service::{create_router, AppState, ServiceConfig, StoreBackend};
use credit_ledger_store::{MemoryStore, Store};

pub const SERVICE_API_KEY: &str = "test-service-key";
pub const ADMIN_CODE: &str = "test-admin-code-0123";
pub const WEBHOOK_SECRET: &str = "test-webhook-secret";

/// Test harness containing everything needed for integration tests.
pub struct TestHarness {
    /// The test server for making HTTP requests.
    pub server: TestServer,
    /// The store behind the server, for direct assertions.
    pub store: Arc<dyn Store>,
    /// A fresh user for this test.
    pub test_user_id: UserId,
}

impl TestHarness {
    /// Create a harness over an in-memory store seeded with the default plans.
    pub async fn new() -> Self {
        Self::with_store(Arc::new(MemoryStore::new()), test_config()).await
    }

    /// Create a harness over `store`, seeding it with the default plans.
    pub async fn with_store(store: Arc<dyn Store>, config: ServiceConfig) -> Self {
        store
            .seed_catalog(&PlanCatalog::default())
            .await
            .expect("Failed to seed catalog");

        let state = AppState::new(store.clone(), config);
        let router: Router = create_router(state);

        let server = TestServer::new(router).expect("Failed to create test server");
        let test_user_id = UserId::new(format!("user-{}", ulid::Ulid::new())).unwrap();

        Self {
            server,
            store,
            test_user_id,
        }
    }

    /// `GET` with the service API key.
    pub fn service_get(&self, path: &str) -> TestRequest {
        let (name, value) = api_key_header();
        self.server.get(path).add_header(name, value)
    }

    /// `POST /v1/ledger/ops` with the service API key.
    pub fn op(&self, body: &serde_json::Value) -> TestRequest {
        let (name, value) = api_key_header();
        self.server
            .post("/v1/ledger/ops")
            .add_header(name, value)
            .json(body)
    }

    /// `GET` with the admin code.
    pub fn admin_get(&self, path: &str) -> TestRequest {
        let (name, value) = admin_code_header();
        self.server.get(path).add_header(name, value)
    }

    /// `PUT` with the admin code.
    pub fn admin_put(&self, path: &str, body: &serde_json::Value) -> TestRequest {
        let (name, value) = admin_code_header();
        self.server.put(path).add_header(name, value).json(body)
    }

    /// `POST /webhooks/billing` with a valid signature over `body`.
    pub fn signed_webhook(&self, body: &serde_json::Value) -> TestRequest {
        let body = body.to_string();
        let (name, value) = signature_header(&body);
        self.server
            .post("/webhooks/billing")
            .add_header(name, value)
            .text(body)
    }

    /// Fund the test user through the ledger API.
    pub async fn fund(&self, amount: i64) {
        self.op(&serde_json::json!({
            "op": "add",
            "user_id": self.test_user_id.as_str(),
            "amount": amount,
            "reason": "test funding"
        }))
        .await
        .assert_status_ok();
    }

    /// Current balance of the test user, read through the API.
    pub async fn balance(&self) -> i64 {
        let response = self
            .service_get(&format!("/v1/ledger/{}/balance", self.test_user_id))
            .await;
        response.assert_status_ok();
        let body: serde_json::Value = response.json();
        body["balance"].as_i64().unwrap()
    }
}

pub fn test_config() -> ServiceConfig {
    ServiceConfig {
        listen_addr: "127.0.0.1:0".into(),
        store_backend: StoreBackend::Memory,
        database_url: None,
        data_dir: String::new(),
        service_api_key: Some(SERVICE_API_KEY.into()),
        admin_code: Some(ADMIN_CODE.into()),
        webhook_secret: Some(WEBHOOK_SECRET.into()),
        grant_period: GrantPeriod::Monthly,
        plan_catalog_path: None,
        store_timeout_ms: 3000,
        cors_origins: vec!["*".into()],
        max_body_bytes: 64 * 1024,
        request_timeout_seconds: 30,
        max_concurrent_requests: 256,
    }
}

fn header(name: &'static str, value: &str) -> (HeaderName, HeaderValue) {
    (
        HeaderName::from_static(name),
        HeaderValue::from_str(value).unwrap(),
    )
}

/// `x-api-key` header with the test service key.
pub fn api_key_header() -> (HeaderName, HeaderValue) {
    header("x-api-key", SERVICE_API_KEY)
}

/// `x-admin-code` header with the test admin code.
pub fn admin_code_header() -> (HeaderName, HeaderValue) {
    header("x-admin-code", ADMIN_CODE)
}

/// `x-webhook-signature` header for `body`.
pub fn signature_header(body: &str) -> (HeaderName, HeaderValue) {
    let signature = hmac_sha256_hex(WEBHOOK_SECRET, body.as_bytes()).unwrap();
    header("x-webhook-signature", &signature)
}

/// How [`SlowAddStore::add`] misbehaves.
pub enum SlowAdd {
    /// Apply the credit, then never answer.
    StallAfterWrite,
    /// Signal `entered`, wait for `release`, then apply the credit.
    HoldUntilReleased {
        entered: Arc<Notify>,
        release: Arc<Notify>,
    },
}

/// A memory store whose `add` is slow in a controlled way. Everything else
/// passes straight through.
pub struct SlowAddStore {
    inner: MemoryStore,
    mode: SlowAdd,
}

impl SlowAddStore {
    pub fn new(mode: SlowAdd) -> Self {
        Self {
            inner: MemoryStore::new(),
            mode,
        }
    }
}

#[async_trait]
impl Store for SlowAddStore {
    async fn get_balance(
        &self,
        user_id: &UserId,
    ) -> credit_ledger_store::Result<Option<AccountBalance>> {
        self.inner.get_balance(user_id).await
    }

    async fn add(
        &self,
        user_id: &UserId,
        amount: Amount,
        action: LedgerAction,
        reason: &str,
    ) -> credit_ledger_store::Result<i64> {
        match &self.mode {
            SlowAdd::StallAfterWrite => {
                self.inner.add(user_id, amount, action, reason).await?;
                std::future::pending().await
            }
            SlowAdd::HoldUntilReleased { entered, release } => {
                entered.notify_one();
                release.notified().await;
                self.inner.add(user_id, amount, action, reason).await
            }
        }
    }

    async fn deduct(
        &self,
        user_id: &UserId,
        amount: Amount,
        reason: &str,
    ) -> credit_ledger_store::Result<DeductOutcome> {
        self.inner.deduct(user_id, amount, reason).await
    }

    async fn grant_if_due(
        &self,
        user_id: &UserId,
        grant: &GrantRequest,
        now: DateTime<Utc>,
    ) -> credit_ledger_store::Result<GrantOutcome> {
        self.inner.grant_if_due(user_id, grant, now).await
    }

    async fn list_transactions(
        &self,
        user_id: &UserId,
        limit: usize,
        offset: usize,
    ) -> credit_ledger_store::Result<Vec<LedgerTransaction>> {
        self.inner.list_transactions(user_id, limit, offset).await
    }

    async fn get_plan(
        &self,
        plan_id: &PlanId,
    ) -> credit_ledger_store::Result<Option<PlanDescriptor>> {
        self.inner.get_plan(plan_id).await
    }

    async fn put_plan(&self, plan: &PlanDescriptor) -> credit_ledger_store::Result<u64> {
        self.inner.put_plan(plan).await
    }

    async fn catalog(&self) -> credit_ledger_store::Result<PlanCatalog> {
        self.inner.catalog().await
    }

    async fn seed_catalog(&self, catalog: &PlanCatalog) -> credit_ledger_store::Result<bool> {
        self.inner.seed_catalog(catalog).await
    }

    async fn get_billing_status(
        &self,
        user_id: &UserId,
    ) -> credit_ledger_store::Result<Option<BillingStatus>> {
        self.inner.get_billing_status(user_id).await
    }

    async fn put_billing_status(&self, status: &BillingStatus) -> credit_ledger_store::Result<()> {
        self.inner.put_billing_status(status).await
    }

    async fn record_external_event(
        &self,
        event_id: &str,
        event_type: &str,
    ) -> credit_ledger_store::Result<bool> {
        self.inner.record_external_event(event_id, event_type).await
    }

    async fn release_external_event(&self, event_id: &str) -> credit_ledger_store::Result<()> {
        self.inner.release_external_event(event_id).await
    }
}
