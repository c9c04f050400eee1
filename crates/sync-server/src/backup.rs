//! Backup upload and download handlers
//!
//! POST /backups/{account} is the heart of the protocol. The client
//! promises the new backup's hash in If-None-Match, names the
//! predecessor in If-Match (absent for a first upload) and signs the
//! transition in Sync-Signature. Everything that can be rejected from
//! headers alone is rejected before the body is read, payment included,
//! so unpaid clients never push megabytes for nothing.

use bytes::Bytes;
use http_body_util::{BodyExt, Full};
use hyper::body::Body;
use hyper::header::{CONTENT_LENGTH, CONTENT_TYPE, ETAG, IF_MATCH, IF_NONE_MATCH};
use hyper::{HeaderMap, Request, Response, StatusCode};
use tracing::{debug, warn};

use sync_core::{
    AccountId, AccountSignature, BackupHash, BackupHasher, HEADER_SYNC_PREVIOUS,
    HEADER_SYNC_SIGNATURE,
};
use sync_storage::{AccountLookup, StoreOutcome, SyncStore};

use crate::payments::{await_payment, begin_payment, PaymentOutcome};
use crate::protocol::ApiError;
use crate::server::{error_response, get_query_param, ServerState};

/// Transient storage errors are retried this many times before giving up.
const MAX_SOFT_RETRIES: u32 = 5;

/// Header fields of an upload, parsed and verified before any body
/// byte is read.
struct UploadRequest {
    length: u64,
    old_hash: BackupHash,
    new_hash: BackupHash,
    sig: AccountSignature,
    pay: bool,
    paying: Option<String>,
}

impl UploadRequest {
    fn parse<B>(account: &AccountId, req: &Request<B>, limit_mb: u64) -> Result<Self, ApiError> {
        let length = match req.headers().get(CONTENT_LENGTH) {
            None => return Err(ApiError::bad_request("Content-Length required")),
            Some(v) => v
                .to_str()
                .ok()
                .and_then(|s| s.parse::<u64>().ok())
                .ok_or_else(|| ApiError::bad_request("malformed Content-Length"))?,
        };
        if length / 1024 / 1024 >= limit_mb {
            return Err(ApiError::payload_too_large("backup too large"));
        }

        let sig = match req.headers().get(HEADER_SYNC_SIGNATURE) {
            None => return Err(ApiError::bad_request("Sync-Signature required")),
            Some(v) => v
                .to_str()
                .ok()
                .and_then(|s| AccountSignature::from_base32(s).ok())
                .ok_or_else(|| ApiError::bad_request("malformed Sync-Signature"))?,
        };

        let old_hash = match req.headers().get(IF_MATCH) {
            None => BackupHash::ZERO,
            Some(v) => v
                .to_str()
                .ok()
                .and_then(|s| BackupHash::from_base32(s).ok())
                .ok_or_else(|| ApiError::bad_request("malformed If-Match"))?,
        };

        let new_hash = match req.headers().get(IF_NONE_MATCH) {
            None => return Err(ApiError::bad_request("If-None-Match required")),
            Some(v) => v
                .to_str()
                .ok()
                .and_then(|s| BackupHash::from_base32(s).ok())
                .ok_or_else(|| ApiError::bad_request("malformed If-None-Match"))?,
        };
        if new_hash.is_zero() {
            return Err(ApiError::bad_request("If-None-Match hash is reserved"));
        }

        if !sig.verify(account, &old_hash, &new_hash) {
            return Err(ApiError::forbidden("signature does not match hash pair"));
        }

        Ok(Self {
            length,
            old_hash,
            new_hash,
            sig,
            pay: get_query_param(req.uri(), "pay").is_some(),
            paying: get_query_param(req.uri(), "paying"),
        })
    }
}

/// Handle POST /backups/{account}.
pub async fn handle_upload<B>(
    state: &ServerState,
    account: AccountId,
    req: Request<B>,
) -> Response<Full<Bytes>>
where
    B: Body<Data = Bytes> + Send + Unpin,
    B::Error: std::fmt::Display,
{
    let upload = match UploadRequest::parse(&account, &req, state.config.upload_limit_mb) {
        Ok(upload) => upload,
        Err(e) => return error_response(e),
    };

    // Everything decidable from headers happens before the body is
    // read: dedup, conflicts and the payment gate.
    let mut payment_needed = upload.pay;
    match lookup_with_retries(state, &account).await {
        Err(resp) => return *resp,
        Ok(AccountLookup::PaymentRequired) => payment_needed = true,
        Ok(AccountLookup::NoBackup) => {}
        Ok(AccountLookup::Backup(stored)) => {
            if stored == upload.new_hash {
                return not_modified(&upload.new_hash);
            }
            if stored != upload.old_hash {
                return current_backup_response(state, &account, StatusCode::CONFLICT).await;
            }
        }
    }
    if payment_needed {
        match upload.paying.as_deref() {
            Some(order_id) => match await_payment(state, &account, order_id).await {
                PaymentOutcome::Settled => {}
                PaymentOutcome::Respond(resp) => return resp,
            },
            None => return begin_payment(state, &account).await,
        }
    }

    let data = match read_body(req.into_body(), upload.length, &upload.new_hash).await {
        Ok(data) => data,
        Err(e) => return error_response(e),
    };

    let mut attempts = 0;
    let mut payment_retried = false;
    loop {
        let result = if upload.old_hash.is_zero() {
            state
                .store
                .store_backup(&account, &upload.sig, &upload.new_hash, &data)
                .await
        } else {
            state
                .store
                .update_backup(
                    &account,
                    &upload.old_hash,
                    &upload.sig,
                    &upload.new_hash,
                    &data,
                )
                .await
        };
        match result {
            Ok(StoreOutcome::Stored) => {
                debug!("stored backup {} for {}", upload.new_hash, account);
                return Response::builder()
                    .status(StatusCode::NO_CONTENT)
                    .header(ETAG, upload.new_hash.to_base32())
                    .body(Full::new(Bytes::new()))
                    .expect("valid response");
            }
            Ok(StoreOutcome::Unchanged) => return not_modified(&upload.new_hash),
            Ok(StoreOutcome::Conflict) => {
                return current_backup_response(state, &account, StatusCode::CONFLICT).await
            }
            Ok(StoreOutcome::Missing) => {
                return error_response(ApiError::not_found("no backup to update"))
            }
            // account expired between the precheck and the write
            Ok(StoreOutcome::PaymentRequired) => {
                if payment_retried {
                    return begin_payment(state, &account).await;
                }
                payment_retried = true;
                match upload.paying.as_deref() {
                    Some(order_id) => match await_payment(state, &account, order_id).await {
                        PaymentOutcome::Settled => continue,
                        PaymentOutcome::Respond(resp) => return resp,
                    },
                    None => return begin_payment(state, &account).await,
                }
            }
            Err(e) if e.is_soft() && attempts < MAX_SOFT_RETRIES => {
                attempts += 1;
                continue;
            }
            Err(e) => {
                warn!("storing backup for {} failed: {}", account, e);
                return error_response(ApiError::internal("storage failure"));
            }
        }
    }
}

/// Handle GET /backups/{account}.
pub async fn handle_download(
    state: &ServerState,
    account: AccountId,
    headers: &HeaderMap,
) -> Response<Full<Bytes>> {
    let if_none_match = headers
        .get(IF_NONE_MATCH)
        .and_then(|v| v.to_str().ok())
        .and_then(|s| BackupHash::from_base32(s).ok());

    let stored = match lookup_with_retries(state, &account).await {
        Ok(lookup) => lookup,
        Err(resp) => return *resp,
    };
    let stored = match stored {
        AccountLookup::PaymentRequired => {
            return error_response(ApiError::not_found("unknown account"))
        }
        AccountLookup::NoBackup => {
            return Response::builder()
                .status(StatusCode::NO_CONTENT)
                .body(Full::new(Bytes::new()))
                .expect("valid response")
        }
        AccountLookup::Backup(stored) => stored,
    };
    if if_none_match == Some(stored) {
        return not_modified(&stored);
    }
    let record = match state.store.lookup_backup(&account).await {
        Ok(Some(record)) => record,
        // the backup existed a lookup ago; losing it now is a bug
        Ok(None) => {
            warn!("backup for {} vanished between lookups", account);
            return error_response(ApiError::internal("storage failure"));
        }
        Err(e) => {
            warn!("backup lookup for {} failed: {}", account, e);
            return error_response(ApiError::internal("storage failure"));
        }
    };
    Response::builder()
        .status(StatusCode::OK)
        .header(CONTENT_TYPE, "application/octet-stream")
        .header(ETAG, record.backup_hash.to_base32())
        .header(HEADER_SYNC_SIGNATURE, record.account_sig.to_base32())
        .header(HEADER_SYNC_PREVIOUS, record.prev_hash.to_base32())
        .body(Full::new(Bytes::from(record.data)))
        .expect("valid response")
}

/// Stream the body, hashing as it arrives, and check the promise.
async fn read_body<B>(mut body: B, length: u64, promised: &BackupHash) -> Result<Vec<u8>, ApiError>
where
    B: Body<Data = Bytes> + Send + Unpin,
    B::Error: std::fmt::Display,
{
    let mut data = Vec::with_capacity(length as usize);
    let mut hasher = BackupHasher::new();
    while let Some(frame) = body.frame().await {
        let frame = frame.map_err(|e| ApiError::bad_request(&format!("body read failed: {e}")))?;
        if let Ok(chunk) = frame.into_data() {
            if data.len() as u64 + chunk.len() as u64 > length {
                return Err(ApiError::bad_request("body exceeds Content-Length"));
            }
            hasher.update(&chunk);
            data.extend_from_slice(&chunk);
        }
    }
    if data.len() as u64 != length {
        return Err(ApiError::bad_request("body shorter than Content-Length"));
    }
    if hasher.finish() != *promised {
        return Err(ApiError::bad_request("body does not match promised hash"));
    }
    Ok(data)
}

async fn lookup_with_retries(
    state: &ServerState,
    account: &AccountId,
) -> Result<AccountLookup, Box<Response<Full<Bytes>>>> {
    let mut attempts = 0;
    loop {
        match state.store.lookup_account(account).await {
            Ok(lookup) => return Ok(lookup),
            Err(e) if e.is_soft() && attempts < MAX_SOFT_RETRIES => {
                attempts += 1;
                continue;
            }
            Err(e) => {
                warn!("account lookup for {} failed: {}", account, e);
                return Err(Box::new(error_response(ApiError::internal(
                    "storage failure",
                ))));
            }
        }
    }
}

/// 409 (or 304-adjacent) response carrying the backup currently stored,
/// so the conflicted client can merge instead of guessing.
async fn current_backup_response(
    state: &ServerState,
    account: &AccountId,
    status: StatusCode,
) -> Response<Full<Bytes>> {
    match state.store.lookup_backup(account).await {
        Ok(Some(record)) => Response::builder()
            .status(status)
            .header(CONTENT_TYPE, "application/octet-stream")
            .header(ETAG, record.backup_hash.to_base32())
            .header(HEADER_SYNC_SIGNATURE, record.account_sig.to_base32())
            .header(HEADER_SYNC_PREVIOUS, record.prev_hash.to_base32())
            .body(Full::new(Bytes::from(record.data)))
            .expect("valid response"),
        // conflicting backup vanished under us; the client can simply retry
        Ok(None) => error_response(ApiError::not_found("no backup stored")),
        Err(e) => {
            warn!("backup lookup for {} failed: {}", account, e);
            error_response(ApiError::internal("storage failure"))
        }
    }
}

fn not_modified(hash: &BackupHash) -> Response<Full<Bytes>> {
    Response::builder()
        .status(StatusCode::NOT_MODIFIED)
        .header(ETAG, hash.to_base32())
        .body(Full::new(Bytes::new()))
        .expect("valid response")
}
