// ferret - coverage-guided fuzzing for EVM smart contracts
// Copyright (C) 2026 ferret contributors
//
// This program is free software: you can redistribute it and/or modify
// it under the terms of the GNU Affero General Public License as published by
// the Free Software Foundation, either version 3 of the License, or
// (at your option) any later version.
//
// This program is distributed in the hope that it will be useful,
// but WITHOUT ANY WARRANTY; without even the implied warranty of
// MERCHANTABILITY or FITNESS FOR A PARTICULAR PURPOSE. See the
// GNU Affero General Public License for more details.
//
// You should have received a copy of the GNU Affero General Public License
// along with this program. If not, see <https://www.gnu.org/licenses/>.

//! Remote state backend.
//!
//! Executes JSON-RPC reads against an endpoint pinned at a block height,
//! with a round-robin pool of persistent HTTP clients, deduplication of
//! concurrent identical requests, linear-backoff retry of transport
//! failures, and a state cache in front of the wire.

use crate::{
    cache::{MemoryStateCache, StateCache, StateObject},
    error::BackendError,
};
use alloy_primitives::{Address, Bytes, B256, U256};
use parking_lot::Mutex;
use serde_json::{json, Value};
use std::{
    collections::HashMap,
    sync::{
        atomic::{AtomicU64, AtomicUsize, Ordering},
        Arc,
    },
    time::Duration,
};
use tokio::sync::{broadcast, watch};
use tracing::{debug, trace, warn};

/// Default number of pooled HTTP clients.
pub const DEFAULT_POOL_SIZE: usize = 4;

/// Default number of retries after a failed dispatch.
pub const DEFAULT_MAX_RETRIES: u32 = 3;

/// Read interface the forked overlay consumes.
///
/// Implementations must be callable from non-async worker threads; the
/// remote implementation bridges onto its runtime internally.
#[auto_impl::auto_impl(&, Arc)]
pub trait StateBackend: Send + Sync {
    /// The account object at the pinned height.
    fn state_object(&self, addr: Address) -> Result<StateObject, BackendError>;

    /// The storage slot value at the pinned height. Never-written slots
    /// read as the zero hash, which the wire cannot distinguish from
    /// "unknown".
    fn storage_at(&self, addr: Address, slot: B256) -> Result<B256, BackendError>;
}

/// Backend for unforked runs: every read succeeds with zero values.
#[derive(Debug, Clone, Copy, Default)]
pub struct EmptyBackend;

impl StateBackend for EmptyBackend {
    fn state_object(&self, _addr: Address) -> Result<StateObject, BackendError> {
        Ok(StateObject::default())
    }

    fn storage_at(&self, _addr: Address, _slot: B256) -> Result<B256, BackendError> {
        Ok(B256::ZERO)
    }
}

type InflightResult = Option<Result<Value, BackendError>>;

struct BackendInner {
    endpoint: String,
    height: u64,
    clients: Vec<reqwest::Client>,
    cursor: AtomicUsize,
    max_retries: u32,
    cache: Arc<dyn StateCache>,
    // Holds the sender, never a receiver: receiver count is how the
    // dispatch task knows every waiter lost interest.
    inflight: Mutex<HashMap<String, Arc<watch::Sender<InflightResult>>>>,
    shutdown: broadcast::Sender<()>,
    request_id: AtomicU64,
    handle: tokio::runtime::Handle,
}

/// Builder for [`RemoteBackend`] with sensible defaults.
#[derive(Debug, Clone)]
pub struct RemoteBackendBuilder {
    endpoint: String,
    height: u64,
    pool_size: usize,
    max_retries: u32,
    shutdown: Option<broadcast::Sender<()>>,
}

impl RemoteBackendBuilder {
    /// New builder for an endpoint pinned at `height`.
    pub fn new(endpoint: impl Into<String>, height: u64) -> Self {
        Self {
            endpoint: endpoint.into(),
            height,
            pool_size: DEFAULT_POOL_SIZE,
            max_retries: DEFAULT_MAX_RETRIES,
            shutdown: None,
        }
    }

    /// Set the number of pooled HTTP clients.
    pub fn pool_size(mut self, pool_size: usize) -> Self {
        self.pool_size = pool_size.max(1);
        self
    }

    /// Set the retry budget for failed dispatches.
    pub fn max_retries(mut self, max_retries: u32) -> Self {
        self.max_retries = max_retries;
        self
    }

    /// Use an external shutdown channel. Sending on it cancels every
    /// inflight request.
    pub fn shutdown(mut self, shutdown: broadcast::Sender<()>) -> Self {
        self.shutdown = Some(shutdown);
        self
    }

    /// Build the backend with an in-memory cache.
    pub fn build(self) -> eyre::Result<RemoteBackend> {
        self.build_with_cache(Arc::new(MemoryStateCache::new()))
    }

    /// Build the backend fronting the supplied cache. Must be called from
    /// within a tokio runtime, whose handle is captured for the blocking
    /// facade.
    pub fn build_with_cache(self, cache: Arc<dyn StateCache>) -> eyre::Result<RemoteBackend> {
        let handle = tokio::runtime::Handle::try_current()
            .map_err(|_| eyre::eyre!("RemoteBackend must be built inside a tokio runtime"))?;

        let clients = (0..self.pool_size)
            .map(|_| {
                reqwest::Client::builder()
                    .timeout(Duration::from_secs(30))
                    .build()
                    .map_err(|e| eyre::eyre!("failed to build HTTP client: {e}"))
            })
            .collect::<eyre::Result<Vec<_>>>()?;

        let shutdown = self.shutdown.unwrap_or_else(|| broadcast::channel(1).0);

        debug!(
            endpoint = %self.endpoint,
            height = self.height,
            pool_size = self.pool_size,
            "Remote backend ready"
        );

        Ok(RemoteBackend {
            inner: Arc::new(BackendInner {
                endpoint: self.endpoint,
                height: self.height,
                clients,
                cursor: AtomicUsize::new(0),
                max_retries: self.max_retries,
                cache,
                inflight: Mutex::new(HashMap::new()),
                shutdown,
                request_id: AtomicU64::new(1),
                handle,
            }),
        })
    }
}

/// The remote JSON-RPC backend. Cheap to clone; clones share the client
/// pool, the inflight map and the cache.
#[derive(Clone)]
pub struct RemoteBackend {
    inner: Arc<BackendInner>,
}

impl RemoteBackend {
    /// Builder entry point.
    pub fn builder(endpoint: impl Into<String>, height: u64) -> RemoteBackendBuilder {
        RemoteBackendBuilder::new(endpoint, height)
    }

    /// The pinned block height all reads target.
    pub fn height(&self) -> u64 {
        self.inner.height
    }

    /// Sender half of the shutdown channel; sending cancels every
    /// inflight request.
    pub fn shutdown_handle(&self) -> broadcast::Sender<()> {
        self.inner.shutdown.clone()
    }

    /// Execute a JSON-RPC request, deduplicating against identical
    /// concurrent requests: callers with a canonically-equal
    /// `(method, params)` pair share one wire request and receive clones
    /// of the same result.
    pub async fn execute(&self, method: &str, params: Value) -> Result<Value, BackendError> {
        let key = request_key(method, &params);

        let mut rx = {
            let mut inflight = self.inner.inflight.lock();
            if let Some(tx) = inflight.get(&key) {
                trace!(key, "Joining inflight request");
                tx.subscribe()
            } else {
                let (tx, rx) = watch::channel(None);
                let tx = Arc::new(tx);
                inflight.insert(key.clone(), tx.clone());
                let inner = self.inner.clone();
                let method = method.to_string();
                self.inner.handle.spawn(run_dispatch(inner, method, params, key, tx));
                rx
            }
        };

        let result = match rx.wait_for(Option::is_some).await {
            Ok(value) => value.clone().expect("guarded by wait_for"),
            // The dispatch task dropped the sender without publishing;
            // that only happens on cancellation.
            Err(_) => Err(BackendError::Cancelled),
        };
        result
    }

    /// Account object read: cache, then three concurrent subrequests
    /// (balance, nonce, code) joined into one [`StateObject`].
    pub async fn get_state_object(&self, addr: Address) -> Result<StateObject, BackendError> {
        if let Some(obj) = self.inner.cache.account(&addr) {
            return Ok(obj);
        }

        let height = self.height_param();
        let addr_param = format!("{addr:#x}");
        let (balance, nonce, code) = tokio::join!(
            self.execute("eth_getBalance", json!([addr_param, height])),
            self.execute("eth_getTransactionCount", json!([addr_param, height])),
            self.execute("eth_getCode", json!([addr_param, height])),
        );

        let obj = StateObject {
            balance: parse_quantity(&balance?)?,
            nonce: parse_u64(&nonce?)?,
            code: parse_bytes(&code?)?,
        };
        self.inner.cache.put_account(addr, obj.clone());
        Ok(obj)
    }

    /// Storage slot read at the pinned height.
    pub async fn get_storage_at(&self, addr: Address, slot: B256) -> Result<B256, BackendError> {
        if let Some(value) = self.inner.cache.slot(&addr, &slot) {
            return Ok(value);
        }

        let result = self
            .execute(
                "eth_getStorageAt",
                json!([format!("{addr:#x}"), format!("{slot:#x}"), self.height_param()]),
            )
            .await?;
        let value = parse_word(&result)?;
        self.inner.cache.put_slot(addr, slot, value);
        Ok(value)
    }

    fn height_param(&self) -> String {
        format!("0x{:x}", self.inner.height)
    }
}

impl StateBackend for RemoteBackend {
    fn state_object(&self, addr: Address) -> Result<StateObject, BackendError> {
        // Worker threads are plain OS threads, so blocking on the captured
        // runtime handle is sound here.
        self.inner.handle.block_on(self.get_state_object(addr))
    }

    fn storage_at(&self, addr: Address, slot: B256) -> Result<B256, BackendError> {
        self.inner.handle.block_on(self.get_storage_at(addr, slot))
    }
}

/// Canonical request key: deterministic, order-preserving serialization
/// of the arguments under the method name.
fn request_key(method: &str, params: &Value) -> String {
    format!("{method}:{params}")
}

async fn run_dispatch(
    inner: Arc<BackendInner>,
    method: String,
    params: Value,
    key: String,
    tx: Arc<watch::Sender<InflightResult>>,
) {
    let mut shutdown_rx = inner.shutdown.subscribe();

    let result = tokio::select! {
        result = dispatch_with_retry(&inner, &method, &params) => result,
        // Every waiter dropped its interest; abort the wire request.
        // One waiter cancelling never aborts it for the others.
        _ = tx.closed() => {
            trace!(key, "All waiters gone, aborting request");
            Err(BackendError::Cancelled)
        }
        _ = shutdown_rx.recv() => Err(BackendError::Cancelled),
    };

    // Remove the inflight entry before publishing so that late callers
    // start a fresh request instead of adopting a finished channel.
    inner.inflight.lock().remove(&key);
    let _ = tx.send(Some(result));
}

async fn dispatch_with_retry(
    inner: &BackendInner,
    method: &str,
    params: &Value,
) -> Result<Value, BackendError> {
    let mut last_error = BackendError::Transport("request never dispatched".into());
    for attempt in 0..=inner.max_retries {
        if attempt > 0 {
            tokio::time::sleep(Duration::from_millis(100 * attempt as u64)).await;
        }
        match dispatch_once(inner, method, params).await {
            Ok(value) => return Ok(value),
            Err(err) if err.is_retryable() => {
                warn!(method, attempt, %err, "RPC dispatch failed, retrying");
                last_error = err;
            }
            Err(err) => return Err(err),
        }
    }
    Err(last_error)
}

async fn dispatch_once(
    inner: &BackendInner,
    method: &str,
    params: &Value,
) -> Result<Value, BackendError> {
    let index = inner.cursor.fetch_add(1, Ordering::Relaxed) % inner.clients.len();
    let client = &inner.clients[index];
    let id = inner.request_id.fetch_add(1, Ordering::Relaxed);

    let request = json!({
        "jsonrpc": "2.0",
        "method": method,
        "params": params,
        "id": id,
    });

    let response = client
        .post(&inner.endpoint)
        .json(&request)
        .send()
        .await
        .map_err(|e| BackendError::Transport(e.to_string()))?;

    let body: Value =
        response.json().await.map_err(|e| BackendError::Decode(e.to_string()))?;

    if let Some(error) = body.get("error") {
        if !error.is_null() {
            return Err(BackendError::Rpc(error.to_string()));
        }
    }

    // An empty (null) result is a terminal success; the read paths decide
    // what a missing value means.
    Ok(body.get("result").cloned().unwrap_or(Value::Null))
}

fn expect_hex_str(value: &Value) -> Result<&str, BackendError> {
    value
        .as_str()
        .ok_or_else(|| BackendError::Decode(format!("expected hex string, got {value}")))
}

fn parse_quantity(value: &Value) -> Result<U256, BackendError> {
    if value.is_null() {
        return Ok(U256::ZERO);
    }
    let raw = expect_hex_str(value)?.trim_start_matches("0x");
    if raw.is_empty() {
        return Ok(U256::ZERO);
    }
    U256::from_str_radix(raw, 16)
        .map_err(|e| BackendError::Decode(format!("bad quantity {value}: {e}")))
}

fn parse_u64(value: &Value) -> Result<u64, BackendError> {
    let quantity = parse_quantity(value)?;
    quantity
        .try_into()
        .map_err(|_| BackendError::Decode(format!("quantity {quantity} does not fit in u64")))
}

fn parse_word(value: &Value) -> Result<B256, BackendError> {
    Ok(B256::from(parse_quantity(value)?))
}

fn parse_bytes(value: &Value) -> Result<Bytes, BackendError> {
    if value.is_null() {
        return Ok(Bytes::new());
    }
    let raw = expect_hex_str(value)?.trim_start_matches("0x");
    hex::decode(raw)
        .map(Bytes::from)
        .map_err(|e| BackendError::Decode(format!("bad byte string {value}: {e}")))
}

#[cfg(test)]
mod tests {
    use super::*;
    use alloy_primitives::address;
    use wiremock::{
        matchers::{body_partial_json, method, path},
        Mock, MockServer, ResponseTemplate,
    };

    fn rpc_result(result: &str) -> ResponseTemplate {
        ResponseTemplate::new(200).set_body_json(json!({
            "jsonrpc": "2.0",
            "id": 1,
            "result": result,
        }))
    }

    async fn mount_state_object_mocks(server: &MockServer) {
        Mock::given(method("POST"))
            .and(path("/"))
            .and(body_partial_json(json!({"method": "eth_getBalance"})))
            .respond_with(rpc_result("0x64"))
            .mount(server)
            .await;
        Mock::given(method("POST"))
            .and(path("/"))
            .and(body_partial_json(json!({"method": "eth_getTransactionCount"})))
            .respond_with(rpc_result("0x7"))
            .mount(server)
            .await;
        Mock::given(method("POST"))
            .and(path("/"))
            .and(body_partial_json(json!({"method": "eth_getCode"})))
            .respond_with(rpc_result("0x6060"))
            .mount(server)
            .await;
    }

    async fn count_method_requests(server: &MockServer, rpc_method: &str) -> usize {
        server
            .received_requests()
            .await
            .unwrap_or_default()
            .iter()
            .filter(|r| {
                serde_json::from_slice::<Value>(&r.body)
                    .ok()
                    .and_then(|v| v.get("method").and_then(|m| m.as_str().map(String::from)))
                    .as_deref()
                    == Some(rpc_method)
            })
            .count()
    }

    #[tokio::test(flavor = "multi_thread")]
    async fn test_get_state_object_joins_three_subrequests() {
        ferret_common::logging::ensure_test_logging(None);

        let server = MockServer::start().await;
        mount_state_object_mocks(&server).await;

        let backend = RemoteBackend::builder(server.uri(), 1_000).build().unwrap();
        let obj = backend
            .get_state_object(address!("00000000000000000000000000000000000000aa"))
            .await
            .unwrap();

        assert_eq!(obj.balance, U256::from(100));
        assert_eq!(obj.nonce, 7);
        assert_eq!(obj.code.as_ref(), &[0x60, 0x60]);
    }

    #[tokio::test(flavor = "multi_thread")]
    async fn test_state_object_read_is_served_from_cache() {
        ferret_common::logging::ensure_test_logging(None);

        let server = MockServer::start().await;
        mount_state_object_mocks(&server).await;

        let backend = RemoteBackend::builder(server.uri(), 1_000).build().unwrap();
        let addr = address!("00000000000000000000000000000000000000ab");

        let first = backend.get_state_object(addr).await.unwrap();
        let second = backend.get_state_object(addr).await.unwrap();
        assert_eq!(first, second);

        assert_eq!(count_method_requests(&server, "eth_getBalance").await, 1);
        assert_eq!(count_method_requests(&server, "eth_getCode").await, 1);
    }

    #[tokio::test(flavor = "multi_thread")]
    async fn test_concurrent_identical_requests_share_one_rpc() {
        ferret_common::logging::ensure_test_logging(None);

        let server = MockServer::start().await;
        // Slow responses keep every caller inside the inflight window.
        for (rpc_method, result) in
            [("eth_getBalance", "0x64"), ("eth_getTransactionCount", "0x7"), ("eth_getCode", "0x6060")]
        {
            Mock::given(method("POST"))
                .and(path("/"))
                .and(body_partial_json(json!({"method": rpc_method})))
                .respond_with(rpc_result(result).set_delay(Duration::from_millis(200)))
                .mount(&server)
                .await;
        }

        let backend = RemoteBackend::builder(server.uri(), 1_000).build().unwrap();
        let addr = address!("00000000000000000000000000000000000000de");

        let mut tasks = tokio::task::JoinSet::new();
        for _ in 0..50 {
            let backend = backend.clone();
            tasks.spawn(async move { backend.get_state_object(addr).await });
        }

        let mut results = Vec::new();
        while let Some(joined) = tasks.join_next().await {
            results.push(joined.unwrap().unwrap());
        }

        assert_eq!(results.len(), 50);
        let expected = &results[0];
        assert!(results.iter().all(|r| r == expected));

        // All 50 callers shared a single wire request per subrequest.
        assert_eq!(count_method_requests(&server, "eth_getBalance").await, 1);
        assert_eq!(count_method_requests(&server, "eth_getTransactionCount").await, 1);
        assert_eq!(count_method_requests(&server, "eth_getCode").await, 1);
    }

    #[tokio::test(flavor = "multi_thread")]
    async fn test_storage_read_returns_zero_for_unwritten_slot() {
        ferret_common::logging::ensure_test_logging(None);

        let server = MockServer::start().await;
        Mock::given(method("POST"))
            .and(path("/"))
            .respond_with(rpc_result("0x0"))
            .mount(&server)
            .await;

        let backend = RemoteBackend::builder(server.uri(), 5).build().unwrap();
        let value = backend
            .get_storage_at(
                address!("00000000000000000000000000000000000000c0"),
                B256::with_last_byte(0xab),
            )
            .await
            .unwrap();
        assert_eq!(value, B256::ZERO);
    }

    #[tokio::test(flavor = "multi_thread")]
    async fn test_transport_failures_are_retried() {
        ferret_common::logging::ensure_test_logging(None);

        let server = MockServer::start().await;
        // Two failures, then success. With the default retry budget of 3
        // the call must succeed.
        Mock::given(method("POST"))
            .and(path("/"))
            .respond_with(ResponseTemplate::new(500))
            .up_to_n_times(2)
            .mount(&server)
            .await;
        Mock::given(method("POST"))
            .and(path("/"))
            .respond_with(rpc_result("0x5"))
            .mount(&server)
            .await;

        let backend = RemoteBackend::builder(server.uri(), 1).build().unwrap();
        let value = backend.execute("eth_getBalance", json!(["0x00", "0x1"])).await.unwrap();
        assert_eq!(value, json!("0x5"));
        assert_eq!(count_method_requests(&server, "eth_getBalance").await, 3);
    }

    #[tokio::test(flavor = "multi_thread")]
    async fn test_rpc_error_is_terminal() {
        ferret_common::logging::ensure_test_logging(None);

        let server = MockServer::start().await;
        Mock::given(method("POST"))
            .and(path("/"))
            .respond_with(ResponseTemplate::new(200).set_body_json(json!({
                "jsonrpc": "2.0",
                "id": 1,
                "error": {"code": -32000, "message": "height pruned"},
            })))
            .mount(&server)
            .await;

        let backend = RemoteBackend::builder(server.uri(), 1).build().unwrap();
        let err = backend.execute("eth_getBalance", json!(["0x00", "0x1"])).await.unwrap_err();
        assert!(matches!(err, BackendError::Rpc(_)));
        // No retries for an RPC-level error.
        assert_eq!(count_method_requests(&server, "eth_getBalance").await, 1);
    }

    #[tokio::test(flavor = "multi_thread")]
    async fn test_shutdown_cancels_inflight_requests() {
        ferret_common::logging::ensure_test_logging(None);

        let server = MockServer::start().await;
        Mock::given(method("POST"))
            .and(path("/"))
            .respond_with(rpc_result("0x1").set_delay(Duration::from_secs(30)))
            .mount(&server)
            .await;

        let backend = RemoteBackend::builder(server.uri(), 1).build().unwrap();
        let shutdown = backend.shutdown_handle();

        let pending = {
            let backend = backend.clone();
            tokio::spawn(async move { backend.execute("eth_getBalance", json!(["0x00"])).await })
        };

        tokio::time::sleep(Duration::from_millis(100)).await;
        shutdown.send(()).unwrap();

        let result = pending.await.unwrap();
        assert!(matches!(result, Err(BackendError::Cancelled)));
    }

    #[tokio::test(flavor = "multi_thread")]
    async fn test_empty_backend_serves_zero_state() {
        let backend = EmptyBackend;
        let addr = address!("00000000000000000000000000000000000000bb");

        let obj = backend.state_object(addr).unwrap();
        assert!(obj.is_empty());
        assert_eq!(backend.storage_at(addr, B256::with_last_byte(1)).unwrap(), B256::ZERO);
    }

    #[test]
    fn test_request_key_is_order_preserving() {
        let a = request_key("eth_getStorageAt", &json!(["0xaa", "0x01", "0x10"]));
        let b = request_key("eth_getStorageAt", &json!(["0x01", "0xaa", "0x10"]));
        let c = request_key("eth_getStorageAt", &json!(["0xaa", "0x01", "0x10"]));
        assert_ne!(a, b);
        assert_eq!(a, c);
    }

    #[test]
    fn test_quantity_parsing() {
        assert_eq!(parse_quantity(&json!("0x0")).unwrap(), U256::ZERO);
        assert_eq!(parse_quantity(&json!("0x")).unwrap(), U256::ZERO);
        assert_eq!(parse_quantity(&json!(null)).unwrap(), U256::ZERO);
        assert_eq!(parse_quantity(&json!("0xff")).unwrap(), U256::from(255));
        assert!(parse_quantity(&json!(12)).is_err());
        assert!(parse_u64(&json!("0xffffffffffffffffff")).is_err());
    }
}
