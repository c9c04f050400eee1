//! Payment orchestration
//!
//! Uploads on unpaid accounts are answered with 402 and a `taler://pay`
//! URI pointing at an order on the merchant backend. The client pays
//! out of band and retries with `paying=<order_id>`, which long-polls
//! the merchant until the order settles or the timeout strikes. A
//! settled order extends the account lifetime by one year.

use std::time::Duration as StdDuration;

use async_trait::async_trait;
use bytes::Bytes;
use chrono::Duration;
use http_body_util::Full;
use hyper::{Response, StatusCode};
use serde::Deserialize;
use thiserror::Error;
use tokio::time::Instant;
use tracing::{debug, info, warn};
use url::Url;

use sync_core::{AccountId, Amount, HEADER_TALER};
use sync_storage::{CreditOutcome, PendingPayment, SyncStore};

use crate::protocol::ApiError;
use crate::server::{error_response, ServerState};

/// Order summary shown in the client's wallet.
const ORDER_SUMMARY: &str = "one year of backup service";

/// Fulfillment URI confirming the purchase inside the wallet.
const FULFILLMENT_URL: &str = "taler://fulfillment-success/backup+service+paid";

/// How long a single merchant poll may block before we re-check the
/// deadline and the shutdown flag.
const MERCHANT_POLL_SLICE: StdDuration = StdDuration::from_secs(30);

/// Lifetime purchased by one settled order.
pub fn paid_lifetime() -> Duration {
    Duration::days(365)
}

/// Merchant backend error
#[derive(Error, Debug)]
pub enum MerchantError {
    #[error("Merchant backend unreachable: {0}")]
    Transport(String),

    #[error("Merchant backend protocol error: {0}")]
    Protocol(String),
}

/// A freshly created order
#[derive(Debug, Clone)]
pub struct OrderCreated {
    pub order_id: String,
    /// Claim token, forwarded when polling order status.
    pub token: Option<String>,
}

/// Settlement state of an order
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum OrderStatus {
    Paid,
    Unpaid,
}

/// Order management on a merchant backend
#[async_trait]
pub trait MerchantBackend: Send + Sync {
    /// Create a new order over `amount`.
    async fn create_order(&self, amount: &Amount) -> Result<OrderCreated, MerchantError>;

    /// Poll an order's settlement state, blocking up to `timeout`.
    async fn check_order(
        &self,
        order_id: &str,
        token: Option<&str>,
        timeout: StdDuration,
    ) -> Result<OrderStatus, MerchantError>;
}

/// HTTP client for a Taler merchant backend
pub struct MerchantClient {
    http: reqwest::Client,
    base: Url,
    api_key: Option<String>,
}

impl MerchantClient {
    pub fn new(base_url: &str, api_key: Option<String>) -> Result<Self, MerchantError> {
        let mut base =
            Url::parse(base_url).map_err(|e| MerchantError::Protocol(e.to_string()))?;
        // Url::join drops the last path segment without this
        if !base.path().ends_with('/') {
            base.set_path(&format!("{}/", base.path()));
        }
        Ok(Self {
            http: reqwest::Client::new(),
            base,
            api_key,
        })
    }

    fn request(&self, method: reqwest::Method, url: Url) -> reqwest::RequestBuilder {
        let req = self.http.request(method, url);
        match &self.api_key {
            Some(key) => req.bearer_auth(key),
            None => req,
        }
    }
}

#[async_trait]
impl MerchantBackend for MerchantClient {
    async fn create_order(&self, amount: &Amount) -> Result<OrderCreated, MerchantError> {
        #[derive(Deserialize)]
        struct CreateOrderResponse {
            order_id: String,
            token: Option<String>,
        }

        let url = self
            .base
            .join("private/orders")
            .map_err(|e| MerchantError::Protocol(e.to_string()))?;
        let body = serde_json::json!({
            "order": {
                "amount": amount,
                "summary": ORDER_SUMMARY,
                "fulfillment_url": FULFILLMENT_URL,
            }
        });
        let resp = self
            .request(reqwest::Method::POST, url)
            .json(&body)
            .send()
            .await
            .map_err(|e| MerchantError::Transport(e.to_string()))?;
        if !resp.status().is_success() {
            return Err(MerchantError::Protocol(format!(
                "order creation failed with status {}",
                resp.status()
            )));
        }
        let parsed: CreateOrderResponse = resp
            .json()
            .await
            .map_err(|e| MerchantError::Protocol(e.to_string()))?;
        Ok(OrderCreated {
            order_id: parsed.order_id,
            token: parsed.token,
        })
    }

    async fn check_order(
        &self,
        order_id: &str,
        token: Option<&str>,
        timeout: StdDuration,
    ) -> Result<OrderStatus, MerchantError> {
        #[derive(Deserialize)]
        struct OrderStatusResponse {
            order_status: String,
        }

        let mut url = self
            .base
            .join(&format!("private/orders/{order_id}"))
            .map_err(|e| MerchantError::Protocol(e.to_string()))?;
        {
            let mut query = url.query_pairs_mut();
            query.append_pair("timeout_ms", &timeout.as_millis().to_string());
            if let Some(token) = token {
                query.append_pair("token", token);
            }
        }
        let resp = self
            .request(reqwest::Method::GET, url)
            .send()
            .await
            .map_err(|e| MerchantError::Transport(e.to_string()))?;
        if !resp.status().is_success() {
            return Err(MerchantError::Protocol(format!(
                "order status failed with status {}",
                resp.status()
            )));
        }
        let parsed: OrderStatusResponse = resp
            .json()
            .await
            .map_err(|e| MerchantError::Protocol(e.to_string()))?;
        Ok(match parsed.order_status.as_str() {
            "paid" => OrderStatus::Paid,
            _ => OrderStatus::Unpaid,
        })
    }
}

/// What the caller should do after a payment step
pub enum PaymentOutcome {
    /// Order settled and the account was credited; retry the storage
    /// operation.
    Settled,
    /// Send this response instead.
    Respond(Response<Full<Bytes>>),
}

/// Answer an upload that needs payment with 402 and an order to pay.
///
/// The most recent unpaid order at the current fee is reused so that
/// retrying clients do not pile up orders; a fee change strands old
/// orders and forces a fresh one.
pub async fn begin_payment(state: &ServerState, account: &AccountId) -> Response<Full<Bytes>> {
    let pending = match state.store.lookup_pending_payments(account).await {
        Ok(pending) => pending,
        Err(e) => {
            warn!("pending payment lookup failed: {}", e);
            return error_response(ApiError::internal("storage failure"));
        }
    };
    if let Some(order) = pending
        .iter()
        .find(|p| p.amount == state.config.annual_fee)
    {
        debug!("reusing unpaid order {} for {}", order.order_id, account);
        return payment_required_response(state, &order.order_id);
    }

    let order = match state.merchant.create_order(&state.config.annual_fee).await {
        Ok(order) => order,
        Err(e) => {
            warn!("order creation failed: {}", e);
            return error_response(ApiError::unavailable("merchant backend unavailable"));
        }
    };
    if let Err(e) = state
        .store
        .store_payment(
            account,
            &order.order_id,
            order.token.as_deref(),
            &state.config.annual_fee,
        )
        .await
    {
        warn!("recording order {} failed: {}", order.order_id, e);
        return error_response(ApiError::internal("storage failure"));
    }
    info!("created order {} for {}", order.order_id, account);
    payment_required_response(state, &order.order_id)
}

/// Long-poll the merchant for an order the client claims to be paying.
pub async fn await_payment(
    state: &ServerState,
    account: &AccountId,
    order_id: &str,
) -> PaymentOutcome {
    let pending = match state.store.lookup_pending_payments(account).await {
        Ok(pending) => pending,
        Err(e) => {
            warn!("pending payment lookup failed: {}", e);
            return PaymentOutcome::Respond(error_response(ApiError::internal(
                "storage failure",
            )));
        }
    };
    let token = pending
        .iter()
        .find(|p| p.order_id == order_id)
        .and_then(|p| p.token.clone());

    let mut shutdown = state.shutdown_signal();
    let deadline = Instant::now() + StdDuration::from_secs(state.config.payment_timeout_secs);
    loop {
        if *shutdown.borrow() {
            return PaymentOutcome::Respond(error_response(ApiError::unavailable(
                "service shutting down",
            )));
        }
        let remaining = deadline.saturating_duration_since(Instant::now());
        if remaining.is_zero() {
            break;
        }
        let poll = remaining.min(MERCHANT_POLL_SLICE);
        let status = tokio::select! {
            _ = shutdown.changed() => {
                return PaymentOutcome::Respond(error_response(ApiError::unavailable(
                    "service shutting down",
                )));
            }
            status = state.merchant.check_order(order_id, token.as_deref(), poll) => status,
        };
        match status {
            Ok(OrderStatus::Paid) => return credit_order(state, account, order_id).await,
            Ok(OrderStatus::Unpaid) => continue,
            Err(e) => {
                warn!("order status poll for {} failed: {}", order_id, e);
                return PaymentOutcome::Respond(error_response(ApiError::unavailable(
                    "merchant backend unavailable",
                )));
            }
        }
    }

    // Timed out. If a newer order exists the client is probably paying
    // a stale one; point it at the fresh order instead.
    match fresher_order(&pending, order_id, &state.config.annual_fee) {
        Some(fresh) => {
            debug!("redirecting {} from stale order {} to {}", account, order_id, fresh);
            PaymentOutcome::Respond(payment_required_response(state, fresh))
        }
        None => PaymentOutcome::Respond(error_response(ApiError {
            message: "payment not received in time".to_string(),
            status: 408,
        })),
    }
}

async fn credit_order(
    state: &ServerState,
    account: &AccountId,
    order_id: &str,
) -> PaymentOutcome {
    let mut attempts = 0;
    loop {
        match state
            .store
            .increment_lifetime(account, order_id, paid_lifetime())
            .await
        {
            Ok(CreditOutcome::Credited) => {
                info!("order {} settled, credited {}", order_id, account);
                return PaymentOutcome::Settled;
            }
            Ok(CreditOutcome::AlreadyCredited) => {
                debug!("order {} was already credited", order_id);
                return PaymentOutcome::Settled;
            }
            Err(e) if e.is_soft() && attempts < 5 => {
                attempts += 1;
                continue;
            }
            Err(e) => {
                warn!("crediting order {} failed: {}", order_id, e);
                return PaymentOutcome::Respond(error_response(ApiError::internal(
                    "storage failure",
                )));
            }
        }
    }
}

fn fresher_order<'a>(
    pending: &'a [PendingPayment],
    order_id: &str,
    fee: &Amount,
) -> Option<&'a str> {
    let fresh = pending.iter().find(|p| p.amount == *fee)?;
    (fresh.order_id != order_id).then_some(fresh.order_id.as_str())
}

/// 402 with the `Taler` header pointing at the order to pay.
pub fn payment_required_response(state: &ServerState, order_id: &str) -> Response<Full<Bytes>> {
    Response::builder()
        .status(StatusCode::PAYMENT_REQUIRED)
        .header(HEADER_TALER, state.payment_uri(order_id))
        .body(Full::new(Bytes::new()))
        .expect("valid response")
}

/// Build the `taler://pay` URI for an order on our merchant backend.
pub fn payment_uri(merchant_url: &Url, order_id: &str) -> String {
    let host = merchant_url.host_str().unwrap_or("localhost");
    match merchant_url.port() {
        Some(port) => format!("taler://pay/{host}:{port}/-/-/{order_id}"),
        None => format!("taler://pay/{host}/-/-/{order_id}"),
    }
}


#[cfg(test)]
mod tests {
    use super::testing::MockMerchant;
    use super::*;
    use std::sync::Arc;

    use sync_storage::{AccountLookup, MemoryStore, SyncStore};

    use crate::config::ServerConfig;

    fn test_account() -> AccountId {
        AccountId::from_bytes([7u8; 32])
    }

    fn test_state(
        timeout_secs: u64,
    ) -> (Arc<ServerState>, Arc<MockMerchant>, tokio::sync::watch::Sender<bool>) {
        let merchant = Arc::new(MockMerchant::default());
        let (tx, rx) = tokio::sync::watch::channel(false);
        let config = ServerConfig {
            payment_timeout_secs: timeout_secs,
            ..Default::default()
        };
        let state = Arc::new(ServerState::new(
            config,
            Arc::new(MemoryStore::default()),
            merchant.clone(),
            rx,
        ));
        (state, merchant, tx)
    }

    #[test]
    fn test_payment_uri_format() {
        let url = Url::parse("http://merchant.example:8888/instances/sync/").unwrap();
        assert_eq!(
            payment_uri(&url, "2026.042-ABC"),
            "taler://pay/merchant.example:8888/-/-/2026.042-ABC"
        );
        let url = Url::parse("https://merchant.example/").unwrap();
        assert_eq!(
            payment_uri(&url, "X"),
            "taler://pay/merchant.example/-/-/X"
        );
    }

    #[tokio::test]
    async fn test_begin_payment_creates_and_reuses_order() {
        let (state, merchant, _tx) = test_state(1800);
        let account = test_account();

        let resp = begin_payment(&state, &account).await;
        assert_eq!(resp.status(), StatusCode::PAYMENT_REQUIRED);
        let uri = resp.headers()[HEADER_TALER].to_str().unwrap().to_string();
        assert!(uri.contains("/ORDER-1"), "unexpected pay URI {uri}");

        // second request must reuse the unpaid order, not create a new one
        let resp = begin_payment(&state, &account).await;
        assert_eq!(resp.status(), StatusCode::PAYMENT_REQUIRED);
        assert_eq!(merchant.orders_created(), vec!["ORDER-1".to_string()]);
    }

    #[tokio::test]
    async fn test_begin_payment_ignores_orders_at_stale_fee() {
        let (state, merchant, _tx) = test_state(1800);
        let account = test_account();
        let old_fee: Amount = "KUDOS:5".parse().unwrap();
        state
            .store
            .store_payment(&account, "STALE", None, &old_fee)
            .await
            .unwrap();

        let resp = begin_payment(&state, &account).await;
        assert_eq!(resp.status(), StatusCode::PAYMENT_REQUIRED);
        assert_eq!(merchant.orders_created(), vec!["ORDER-1".to_string()]);
    }

    #[tokio::test]
    async fn test_await_payment_credits_account() {
        let (state, merchant, _tx) = test_state(1800);
        let account = test_account();

        begin_payment(&state, &account).await;
        merchant.mark_paid("ORDER-1");

        match await_payment(&state, &account, "ORDER-1").await {
            PaymentOutcome::Settled => {}
            PaymentOutcome::Respond(resp) => panic!("expected settlement, got {}", resp.status()),
        }
        assert_eq!(
            state.store.lookup_account(&account).await.unwrap(),
            AccountLookup::NoBackup
        );
    }

    #[tokio::test]
    async fn test_await_payment_times_out() {
        let (state, _merchant, _tx) = test_state(0);
        let account = test_account();
        begin_payment(&state, &account).await;

        match await_payment(&state, &account, "ORDER-1").await {
            PaymentOutcome::Respond(resp) => assert_eq!(resp.status().as_u16(), 408),
            PaymentOutcome::Settled => panic!("expected timeout"),
        }
    }

    #[tokio::test]
    async fn test_await_payment_redirects_to_fresher_order() {
        let (state, _merchant, _tx) = test_state(0);
        let account = test_account();
        let fee = state.config.annual_fee.clone();
        state
            .store
            .store_payment(&account, "OLD", None, &fee)
            .await
            .unwrap();
        state
            .store
            .store_payment(&account, "NEW", None, &fee)
            .await
            .unwrap();

        match await_payment(&state, &account, "OLD").await {
            PaymentOutcome::Respond(resp) => {
                assert_eq!(resp.status(), StatusCode::PAYMENT_REQUIRED);
                let uri = resp.headers()[HEADER_TALER].to_str().unwrap();
                assert!(uri.ends_with("/NEW"), "unexpected pay URI {uri}");
            }
            PaymentOutcome::Settled => panic!("expected redirect"),
        }
    }

    #[tokio::test]
    async fn test_await_payment_stops_on_shutdown() {
        let (state, _merchant, tx) = test_state(1800);
        let account = test_account();
        begin_payment(&state, &account).await;

        tx.send(true).unwrap();
        match await_payment(&state, &account, "ORDER-1").await {
            PaymentOutcome::Respond(resp) => {
                assert_eq!(resp.status(), StatusCode::SERVICE_UNAVAILABLE)
            }
            PaymentOutcome::Settled => panic!("expected shutdown response"),
        }
    }

    #[tokio::test]
    async fn test_no_double_credit_on_repeated_poll() {
        let merchant = Arc::new(MockMerchant::default());
        let mem = Arc::new(MemoryStore::default());
        let (_tx, rx) = tokio::sync::watch::channel(false);
        let state = Arc::new(ServerState::new(
            ServerConfig::default(),
            mem.clone(),
            merchant.clone(),
            rx,
        ));
        let account = test_account();
        begin_payment(&state, &account).await;
        merchant.mark_paid("ORDER-1");

        assert!(matches!(
            await_payment(&state, &account, "ORDER-1").await,
            PaymentOutcome::Settled
        ));
        let first = mem.account_expiration(&account).await;
        assert!(first.is_some());

        // replaying the same order must not extend the lifetime again
        assert!(matches!(
            await_payment(&state, &account, "ORDER-1").await,
            PaymentOutcome::Settled
        ));
        assert_eq!(mem.account_expiration(&account).await, first);
    }
}
