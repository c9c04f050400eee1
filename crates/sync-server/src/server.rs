//! HTTP server and request routing
//!
//! Plain HTTP/1.1; TLS termination belongs to the reverse proxy in
//! front of the service.

use std::convert::Infallible;
use std::net::SocketAddr;
use std::sync::Arc;

use bytes::Bytes;
use chrono::{Duration, Utc};
use http_body_util::Full;
use hyper::body::Body;
use hyper::server::conn::http1;
use hyper::service::service_fn;
use hyper::{Method, Request, Response, StatusCode};
use hyper_util::rt::TokioIo;
use tokio::net::TcpListener;
use tokio::sync::watch;
use tracing::{debug, error, info, instrument};
use url::Url;

use sync_core::AccountId;
use sync_storage::{MemoryStore, PostgresStore, SyncStore};

use crate::backup::{handle_download, handle_upload};
use crate::config::{ServerConfig, StorageConfig};
use crate::payments::{self, MerchantBackend, MerchantClient};
use crate::protocol::{ApiError, ServiceTerms};

/// Server state
pub struct ServerState {
    /// Configuration
    pub config: ServerConfig,
    /// Storage backend
    pub store: Arc<dyn SyncStore>,
    /// Merchant backend for order management
    pub merchant: Arc<dyn MerchantBackend>,
    /// Flipped to true once when the server should stop
    shutdown: watch::Receiver<bool>,
}

impl ServerState {
    pub fn new(
        config: ServerConfig,
        store: Arc<dyn SyncStore>,
        merchant: Arc<dyn MerchantBackend>,
        shutdown: watch::Receiver<bool>,
    ) -> Self {
        Self {
            config,
            store,
            merchant,
            shutdown,
        }
    }

    /// Create server state from config, connecting the backends.
    pub async fn from_config(
        config: ServerConfig,
        shutdown: watch::Receiver<bool>,
    ) -> anyhow::Result<Self> {
        let store: Arc<dyn SyncStore> = match &config.storage {
            StorageConfig::Memory => Arc::new(MemoryStore::default()),
            StorageConfig::Postgres { url } => Arc::new(PostgresStore::connect(url).await?),
        };
        let merchant = Arc::new(MerchantClient::new(
            &config.merchant_url,
            config.merchant_api_key.clone(),
        )?);
        Ok(Self::new(config, store, merchant, shutdown))
    }

    /// Fresh receiver for the shutdown flag.
    pub fn shutdown_signal(&self) -> watch::Receiver<bool> {
        self.shutdown.clone()
    }

    /// `taler://pay` URI for an order on our merchant backend.
    pub fn payment_uri(&self, order_id: &str) -> String {
        match Url::parse(&self.config.merchant_url) {
            Ok(url) => payments::payment_uri(&url, order_id),
            Err(_) => format!("taler://pay/localhost/-/-/{order_id}"),
        }
    }
}

/// Run the server until the shutdown flag flips.
#[instrument(skip(state))]
pub async fn run_server(state: Arc<ServerState>) -> anyhow::Result<()> {
    let addr: SocketAddr = state.config.listen_addr.parse()?;
    let listener = TcpListener::bind(addr).await?;
    info!("sync server listening on http://{}", addr);

    if state.config.gc.enabled {
        spawn_gc_task(state.clone());
    }

    let mut shutdown = state.shutdown_signal();
    loop {
        let accepted = tokio::select! {
            _ = shutdown.changed() => {
                info!("shutdown requested, no longer accepting connections");
                break;
            }
            accepted = listener.accept() => accepted,
        };
        let (stream, peer_addr) = accepted?;
        let state = state.clone();
        tokio::spawn(async move {
            debug!("connection from {}", peer_addr);
            let io = TokioIo::new(stream);
            let service = service_fn(move |req| {
                let state = state.clone();
                async move { handle_request(state, req).await }
            });
            if let Err(err) = http1::Builder::new().serve_connection(io, service).await {
                error!("error serving {}: {:?}", peer_addr, err);
            }
        });
    }
    Ok(())
}

/// Periodically drop expired accounts and stale unpaid orders.
fn spawn_gc_task(state: Arc<ServerState>) {
    let interval_secs = state.config.gc.interval_hours * 3600;
    info!("gc enabled, running every {}h", state.config.gc.interval_hours);
    tokio::spawn(async move {
        let mut shutdown = state.shutdown_signal();
        let mut interval =
            tokio::time::interval(tokio::time::Duration::from_secs(interval_secs));
        // skip the immediate first tick
        interval.tick().await;
        loop {
            tokio::select! {
                _ = shutdown.changed() => break,
                _ = interval.tick() => {}
            }
            let now = Utc::now();
            let payment_cutoff =
                now - Duration::hours(state.config.gc.payment_retention_hours as i64);
            match state.store.gc(now, payment_cutoff).await {
                Ok(stats) => info!(
                    "gc done: {} accounts, {} stale orders",
                    stats.accounts_deleted, stats.payments_deleted
                ),
                Err(e) => error!("gc failed: {}", e),
            }
        }
    });
}

/// Route an HTTP request
pub async fn handle_request<B>(
    state: Arc<ServerState>,
    req: Request<B>,
) -> Result<Response<Full<Bytes>>, Infallible>
where
    B: Body<Data = Bytes> + Send + Unpin,
    B::Error: std::fmt::Display,
{
    let method = req.method().clone();
    let path = req.uri().path().to_string();
    debug!("{} {}", method, path);

    let mut response = match (method, path.as_str()) {
        (Method::OPTIONS, _) => cors_preflight(),
        (Method::GET, "/config") => handle_terms(&state),
        (method, path) => match path.strip_prefix("/backups/") {
            Some(account_str) => match AccountId::from_base32(account_str) {
                Err(_) => error_response(ApiError::bad_request("malformed account key")),
                Ok(account) => match method {
                    Method::GET => handle_download(&state, account, req.headers()).await,
                    Method::POST => handle_upload(&state, account, req).await,
                    _ => method_not_allowed(),
                },
            },
            None => error_response(ApiError::not_found("Not found")),
        },
    };
    // wallets talk to us cross-origin
    let headers = response.headers_mut();
    headers.insert(
        "Access-Control-Allow-Origin",
        hyper::header::HeaderValue::from_static("*"),
    );
    headers.insert(
        "Access-Control-Expose-Headers",
        hyper::header::HeaderValue::from_static("ETag, Sync-Signature, Sync-Previous, Taler"),
    );
    Ok(response)
}

/// GET /config
fn handle_terms(state: &ServerState) -> Response<Full<Bytes>> {
    let terms = ServiceTerms::new(
        state.config.upload_limit_mb,
        state.config.annual_fee.clone(),
    );
    json_response(StatusCode::OK, &terms)
}

fn cors_preflight() -> Response<Full<Bytes>> {
    Response::builder()
        .status(StatusCode::NO_CONTENT)
        .header("Access-Control-Allow-Origin", "*")
        .header("Access-Control-Allow-Methods", "GET, POST, OPTIONS")
        .header(
            "Access-Control-Allow-Headers",
            "Content-Type, If-Match, If-None-Match, Sync-Signature",
        )
        .body(Full::new(Bytes::new()))
        .expect("valid response")
}

// === Response helpers ===

pub(crate) fn json_response<T: serde::Serialize>(
    status: StatusCode,
    data: &T,
) -> Response<Full<Bytes>> {
    let json = serde_json::to_string(data).unwrap_or_else(|_| "{}".to_string());
    Response::builder()
        .status(status)
        .header("content-type", "application/json")
        .body(Full::new(Bytes::from(json)))
        .expect("valid response")
}

pub(crate) fn error_response(error: ApiError) -> Response<Full<Bytes>> {
    let status = StatusCode::from_u16(error.status).unwrap_or(StatusCode::INTERNAL_SERVER_ERROR);
    let body = serde_json::json!({ "error": error.message });
    json_response(status, &body)
}

fn method_not_allowed() -> Response<Full<Bytes>> {
    let body = serde_json::json!({ "error": "method not allowed" });
    json_response(StatusCode::METHOD_NOT_ALLOWED, &body)
}

/// Extract query parameter
pub(crate) fn get_query_param(uri: &hyper::Uri, name: &str) -> Option<String> {
    uri.query().and_then(|q| {
        url::form_urlencoded::parse(q.as_bytes())
            .find(|(k, _)| k == name)
            .map(|(_, v)| v.to_string())
    })
}

#[cfg(test)]
mod tests {
    use super::*;

    use ed25519_dalek::SigningKey;
    use http_body_util::BodyExt;
    use hyper::header::{CONTENT_LENGTH, ETAG, IF_MATCH, IF_NONE_MATCH};
    use rand::RngCore;

    use sync_core::keys::{account_for, sign_upload};
    use sync_core::{BackupHash, HEADER_SYNC_PREVIOUS, HEADER_SYNC_SIGNATURE, HEADER_TALER};
    use sync_storage::MemoryStore;

    use crate::payments::testing::MockMerchant;

    struct Harness {
        state: Arc<ServerState>,
        merchant: Arc<MockMerchant>,
        _shutdown: watch::Sender<bool>,
    }

    fn harness() -> Harness {
        let merchant = Arc::new(MockMerchant::default());
        let (tx, rx) = watch::channel(false);
        let state = Arc::new(ServerState::new(
            ServerConfig::default(),
            Arc::new(MemoryStore::default()),
            merchant.clone(),
            rx,
        ));
        Harness {
            state,
            merchant,
            _shutdown: tx,
        }
    }

    fn test_key() -> SigningKey {
        let mut seed = [0u8; 32];
        rand::thread_rng().fill_bytes(&mut seed);
        SigningKey::from_bytes(&seed)
    }

    fn upload_request(
        key: &SigningKey,
        old: &BackupHash,
        data: &[u8],
        query: &str,
    ) -> Request<Full<Bytes>> {
        let new = BackupHash::hash(data);
        let sig = sign_upload(key, old, &new);
        let mut builder = Request::builder()
            .method("POST")
            .uri(format!("/backups/{}{}", account_for(key), query))
            .header(CONTENT_LENGTH, data.len().to_string())
            .header(IF_NONE_MATCH, new.to_base32())
            .header(HEADER_SYNC_SIGNATURE, sig.to_base32());
        if !old.is_zero() {
            builder = builder.header(IF_MATCH, old.to_base32());
        }
        builder
            .body(Full::new(Bytes::copy_from_slice(data)))
            .unwrap()
    }

    fn get(uri: &str) -> Request<Full<Bytes>> {
        Request::builder()
            .method("GET")
            .uri(uri)
            .body(Full::new(Bytes::new()))
            .unwrap()
    }

    async fn send(h: &Harness, req: Request<Full<Bytes>>) -> Response<Full<Bytes>> {
        handle_request(h.state.clone(), req).await.unwrap()
    }

    #[tokio::test]
    async fn test_terms_endpoint() {
        let h = harness();
        let resp = send(&h, get("/config")).await;
        assert_eq!(resp.status(), StatusCode::OK);
        let body = resp.into_body().collect().await.unwrap().to_bytes();
        let json: serde_json::Value = serde_json::from_slice(&body).unwrap();
        assert_eq!(json["name"], "sync");
        assert_eq!(json["version"], "1:0:1");
        assert_eq!(json["storage_limit_in_megabytes"], 16);
        assert_eq!(json["annual_fee"], "KUDOS:0.1");
    }

    #[tokio::test]
    async fn test_cors_preflight() {
        let h = harness();
        let req = Request::builder()
            .method("OPTIONS")
            .uri("/backups/whatever")
            .body(Full::new(Bytes::new()))
            .unwrap();
        let resp = send(&h, req).await;
        assert_eq!(resp.status(), StatusCode::NO_CONTENT);
        assert_eq!(resp.headers()["Access-Control-Allow-Origin"], "*");
    }

    #[tokio::test]
    async fn test_unknown_routes() {
        let h = harness();
        let resp = send(&h, get("/nope")).await;
        assert_eq!(resp.status(), StatusCode::NOT_FOUND);

        let resp = send(&h, get("/backups/not-a-key")).await;
        assert_eq!(resp.status(), StatusCode::BAD_REQUEST);

        let key = test_key();
        let req = Request::builder()
            .method("DELETE")
            .uri(format!("/backups/{}", account_for(&key)))
            .body(Full::new(Bytes::new()))
            .unwrap();
        let resp = send(&h, req).await;
        assert_eq!(resp.status(), StatusCode::METHOD_NOT_ALLOWED);
    }

    /// Full client lifecycle: first upload hits the paywall, payment
    /// settles it, the chain advances, a stale device conflicts.
    #[tokio::test]
    async fn test_backup_lifecycle() {
        let h = harness();
        let key = test_key();
        let account = account_for(&key);

        // first upload is answered with an order to pay
        let resp = send(&h, upload_request(&key, &BackupHash::ZERO, b"Test-1", "")).await;
        assert_eq!(resp.status(), StatusCode::PAYMENT_REQUIRED);
        let pay_uri = resp.headers()[HEADER_TALER].to_str().unwrap().to_string();
        let order_id = pay_uri.rsplit('/').next().unwrap().to_string();

        // wallet pays, client retries while polling the order
        h.merchant.mark_paid(&order_id);
        let resp = send(
            &h,
            upload_request(
                &key,
                &BackupHash::ZERO,
                b"Test-1",
                &format!("?paying={order_id}"),
            ),
        )
        .await;
        assert_eq!(resp.status(), StatusCode::NO_CONTENT);

        // advance the chain
        let h1 = BackupHash::hash(b"Test-1");
        let resp = send(&h, upload_request(&key, &h1, b"Test-3", "")).await;
        assert_eq!(resp.status(), StatusCode::NO_CONTENT);

        // download sees the latest version and its predecessor
        let resp = send(&h, get(&format!("/backups/{account}"))).await;
        assert_eq!(resp.status(), StatusCode::OK);
        assert_eq!(
            resp.headers()[HEADER_SYNC_PREVIOUS].to_str().unwrap(),
            h1.to_base32()
        );
        assert_eq!(
            resp.headers()[ETAG].to_str().unwrap(),
            BackupHash::hash(b"Test-3").to_base32()
        );
        let body = resp.into_body().collect().await.unwrap().to_bytes();
        assert_eq!(&body[..], b"Test-3");

        // a device still on Test-1 loses the race and gets the current state
        let resp = send(&h, upload_request(&key, &h1, b"Test-2", "")).await;
        assert_eq!(resp.status(), StatusCode::CONFLICT);
        let body = resp.into_body().collect().await.unwrap().to_bytes();
        assert_eq!(&body[..], b"Test-3");
    }

    #[tokio::test]
    async fn test_get_query_param() {
        let uri: hyper::Uri = "/backups/X?pay=y&paying=ORDER-1".parse().unwrap();
        assert_eq!(get_query_param(&uri, "pay").as_deref(), Some("y"));
        assert_eq!(get_query_param(&uri, "paying").as_deref(), Some("ORDER-1"));
        assert_eq!(get_query_param(&uri, "other"), None);
    }
}
