//! JSON-RPC 2.0 calls over a broker [`Connection`], one JSON document per line.
//!
//! Two interchangeable transports share the [`Transport`] contract:
//! * [`SyncTransport`] keeps a single call in flight; the server answers
//!   requests strictly one after another.
//! * [`StreamTransport`] multiplexes concurrent calls by request id; the
//!   server handles every request in its own task.

use std::{
    collections::HashMap,
    fmt,
    panic::AssertUnwindSafe,
    sync::{
        atomic::{AtomicI64, Ordering},
        Arc, Mutex,
    },
    time::Duration,
};

use async_trait::async_trait;
use futures::{FutureExt, SinkExt, StreamExt};
use serde::{de::DeserializeOwned, Deserialize, Serialize};
use serde_json::Value;
use tokio::{
    sync::{mpsc, oneshot},
    time::timeout,
};
use tokio_util::codec::{Framed, LinesCodec, LinesCodecError};

use crate::broker::Connection;

pub const JSONRPC_VERSION: &str = "2.0";

pub const DEFAULT_CALL_TIMEOUT: Duration = Duration::from_secs(30);

const MAX_LINE: usize = 16 * 1024 * 1024;

pub mod codes {
    pub const PARSE_ERROR: i64 = -32700;
    pub const INVALID_REQUEST: i64 = -32600;
    pub const METHOD_NOT_FOUND: i64 = -32601;
    pub const INVALID_PARAMS: i64 = -32602;
    pub const INTERNAL_ERROR: i64 = -32603;
    /// Failure reported by the handler itself.
    pub const APPLICATION_ERROR: i64 = -32000;
}

/// `id` may be a number, a string or null.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(untagged)]
pub enum Id {
    Number(i64),
    String(String),
    Null,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Request {
    #[serde(default = "default_version")]
    pub jsonrpc: String,
    pub method: String,
    #[serde(default, skip_serializing_if = "Value::is_null")]
    pub params: Value,
    /// Omitted for notifications.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub id: Option<Id>,
}

fn default_version() -> String {
    JSONRPC_VERSION.to_owned()
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ErrorObject {
    pub code: i64,
    pub message: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub data: Option<Value>,
}

/// Exactly one of `result` or `error` is present.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Response {
    #[serde(default = "default_version")]
    pub jsonrpc: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub result: Option<Value>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error: Option<ErrorObject>,
    pub id: Id,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(untagged)]
pub enum Message {
    Request(Request),
    Response(Response),
}

impl Request {
    pub fn call(id: Id, method: impl Into<String>, params: Value) -> Self {
        Self {
            jsonrpc: JSONRPC_VERSION.to_owned(),
            method: method.into(),
            params,
            id: Some(id),
        }
    }

    pub fn notification(method: impl Into<String>, params: Value) -> Self {
        Self {
            jsonrpc: JSONRPC_VERSION.to_owned(),
            method: method.into(),
            params,
            id: None,
        }
    }
}

impl Response {
    pub fn success(id: Id, result: Value) -> Self {
        Self {
            jsonrpc: JSONRPC_VERSION.to_owned(),
            result: Some(result),
            error: None,
            id,
        }
    }

    pub fn fail(id: Id, code: i64, message: impl Into<String>) -> Self {
        Self {
            jsonrpc: JSONRPC_VERSION.to_owned(),
            result: None,
            error: Some(ErrorObject {
                code,
                message: message.into(),
                data: None,
            }),
            id,
        }
    }

    pub fn into_result(self) -> Result<Value, RpcError> {
        match self.error {
            Some(err) => Err(RpcError::Remote {
                code: err.code,
                message: err.message,
            }),
            None => Ok(self.result.unwrap_or(Value::Null)),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum RpcError {
    /// The connection went away before the call completed.
    #[error("peer unreachable: {0}")]
    PeerUnreachable(String),
    #[error("call `{method}` timed out after {after:?}")]
    Timeout { method: String, after: Duration },
    /// Rejected locally; never sent over the wire.
    #[error("`{0}` is not implemented")]
    MethodNotImplemented(String),
    /// The peer ran the call and reported a failure.
    #[error("remote error {code}: {message}")]
    Remote { code: i64, message: String },
    #[error("codec error: {0}")]
    Codec(String),
}

impl RpcError {
    pub fn remote(message: impl fmt::Display) -> Self {
        RpcError::Remote {
            code: codes::APPLICATION_ERROR,
            message: message.to_string(),
        }
    }

    pub fn invalid_params(message: impl fmt::Display) -> Self {
        RpcError::Remote {
            code: codes::INVALID_PARAMS,
            message: message.to_string(),
        }
    }

    /// Connection-level failure rather than an answer from the peer.
    pub fn is_transport_failure(&self) -> bool {
        matches!(self, RpcError::PeerUnreachable(_) | RpcError::Timeout { .. })
    }

    fn to_error_object(&self) -> (i64, String) {
        match self {
            RpcError::Remote { code, message } => (*code, message.clone()),
            RpcError::MethodNotImplemented(method) => {
                (codes::METHOD_NOT_FOUND, format!("method `{method}` not found"))
            }
            RpcError::Codec(message) => (codes::INVALID_PARAMS, message.clone()),
            other => (codes::INTERNAL_ERROR, other.to_string()),
        }
    }
}

impl From<LinesCodecError> for RpcError {
    fn from(err: LinesCodecError) -> Self {
        match err {
            LinesCodecError::Io(err) => RpcError::PeerUnreachable(err.to_string()),
            LinesCodecError::MaxLineLengthExceeded => {
                RpcError::Codec("message exceeds maximum line length".into())
            }
        }
    }
}

/// Which call protocol a plugin speaks; chosen per plugin at load time.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TransportKind {
    Sync,
    #[default]
    Streaming,
}

impl fmt::Display for TransportKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            TransportKind::Sync => f.write_str("sync"),
            TransportKind::Streaming => f.write_str("streaming"),
        }
    }
}

impl std::str::FromStr for TransportKind {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "sync" => Ok(TransportKind::Sync),
            "streaming" => Ok(TransportKind::Streaming),
            other => Err(format!("unknown transport `{other}`")),
        }
    }
}

/// Calls a named method on the peer.
#[async_trait]
pub trait Transport: Send + Sync {
    fn kind(&self) -> TransportKind;

    async fn call(&self, method: &str, params: Value) -> Result<Value, RpcError>;
}

impl dyn Transport + '_ {
    /// Typed wrapper around [`Transport::call`].
    pub async fn invoke<P, R>(&self, method: &str, params: &P) -> Result<R, RpcError>
    where
        P: Serialize + ?Sized,
        R: DeserializeOwned,
    {
        let params = serde_json::to_value(params).map_err(|err| RpcError::Codec(err.to_string()))?;
        let result = self.call(method, params).await?;
        serde_json::from_value(result).map_err(|err| RpcError::Codec(err.to_string()))
    }
}

/// Builds the client side of `kind` on `connection`.
pub fn connect(kind: TransportKind, connection: Connection, call_timeout: Duration) -> Arc<dyn Transport> {
    match kind {
        TransportKind::Sync => Arc::new(SyncTransport::new(connection, call_timeout)),
        TransportKind::Streaming => Arc::new(StreamTransport::new(connection, call_timeout)),
    }
}

fn framed(connection: Connection) -> Framed<Connection, LinesCodec> {
    Framed::new(connection, LinesCodec::new_with_max_length(MAX_LINE))
}

fn encode<T: Serialize>(message: &T) -> Result<String, RpcError> {
    serde_json::to_string(message).map_err(|err| RpcError::Codec(err.to_string()))
}

pub struct SyncTransport {
    conn: tokio::sync::Mutex<Framed<Connection, LinesCodec>>,
    next_id: AtomicI64,
    call_timeout: Duration,
}

impl SyncTransport {
    pub fn new(connection: Connection, call_timeout: Duration) -> Self {
        Self {
            conn: tokio::sync::Mutex::new(framed(connection)),
            next_id: AtomicI64::new(1),
            call_timeout,
        }
    }
}

#[async_trait]
impl Transport for SyncTransport {
    fn kind(&self) -> TransportKind {
        TransportKind::Sync
    }

    async fn call(&self, method: &str, params: Value) -> Result<Value, RpcError> {
        let id = Id::Number(self.next_id.fetch_add(1, Ordering::Relaxed));
        let line = encode(&Request::call(id.clone(), method, params))?;
        timeout(self.call_timeout, self.exchange(&id, line))
            .await
            .map_err(|_| RpcError::Timeout {
                method: method.to_string(),
                after: self.call_timeout,
            })?
    }
}

impl SyncTransport {
    async fn exchange(&self, id: &Id, line: String) -> Result<Value, RpcError> {
        let mut conn = self.conn.lock().await;
        conn.send(line).await?;
        loop {
            let line = match conn.next().await {
                Some(line) => line?,
                None => return Err(RpcError::PeerUnreachable("connection closed".into())),
            };
            match serde_json::from_str::<Message>(&line) {
                Ok(Message::Response(resp)) if resp.id == *id => return resp.into_result(),
                // answer to a call that already timed out
                Ok(Message::Response(_)) => continue,
                Ok(Message::Request(req)) => {
                    tracing::debug!(method = %req.method, "ignoring request on client side");
                }
                Err(err) => return Err(RpcError::Codec(err.to_string())),
            }
        }
    }
}

#[derive(Default)]
struct Pending {
    closed: bool,
    calls: HashMap<i64, oneshot::Sender<Response>>,
}

pub struct StreamTransport {
    writer: mpsc::Sender<String>,
    pending: Arc<Mutex<Pending>>,
    next_id: AtomicI64,
    call_timeout: Duration,
}

impl StreamTransport {
    pub fn new(connection: Connection, call_timeout: Duration) -> Self {
        let (mut sink, mut stream) = framed(connection).split();
        let (writer, mut rx) = mpsc::channel::<String>(64);
        let pending = Arc::new(Mutex::new(Pending::default()));

        tokio::spawn(async move {
            while let Some(line) = rx.recv().await {
                if let Err(err) = sink.send(line).await {
                    tracing::debug!(error = %err, "rpc writer stopped");
                    break;
                }
            }
        });

        let routes = pending.clone();
        tokio::spawn(async move {
            while let Some(line) = stream.next().await {
                let line = match line {
                    Ok(line) => line,
                    Err(err) => {
                        tracing::debug!(error = %err, "rpc reader stopped");
                        break;
                    }
                };
                match serde_json::from_str::<Message>(&line) {
                    Ok(Message::Response(resp)) => {
                        let Id::Number(id) = &resp.id else {
                            tracing::warn!(id = ?resp.id, "response with foreign id");
                            continue;
                        };
                        let waiter = lock(&routes).calls.remove(id);
                        if let Some(waiter) = waiter {
                            let _ = waiter.send(resp);
                        }
                    }
                    Ok(Message::Request(req)) => {
                        tracing::debug!(method = %req.method, "ignoring request on client side");
                    }
                    Err(err) => tracing::warn!(error = %err, "unparseable rpc message"),
                }
            }
            let mut pending = lock(&routes);
            pending.closed = true;
            pending.calls.clear();
        });

        Self {
            writer,
            pending,
            next_id: AtomicI64::new(1),
            call_timeout,
        }
    }
}

fn lock(pending: &Mutex<Pending>) -> std::sync::MutexGuard<'_, Pending> {
    pending.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
}

#[async_trait]
impl Transport for StreamTransport {
    fn kind(&self) -> TransportKind {
        TransportKind::Streaming
    }

    async fn call(&self, method: &str, params: Value) -> Result<Value, RpcError> {
        let id = self.next_id.fetch_add(1, Ordering::Relaxed);
        let line = encode(&Request::call(Id::Number(id), method, params))?;
        let (tx, rx) = oneshot::channel();
        {
            let mut pending = lock(&self.pending);
            if pending.closed {
                return Err(RpcError::PeerUnreachable("connection closed".into()));
            }
            pending.calls.insert(id, tx);
        }
        if self.writer.send(line).await.is_err() {
            lock(&self.pending).calls.remove(&id);
            return Err(RpcError::PeerUnreachable("connection closed".into()));
        }
        match timeout(self.call_timeout, rx).await {
            Ok(Ok(resp)) => resp.into_result(),
            Ok(Err(_)) => Err(RpcError::PeerUnreachable("connection closed".into())),
            Err(_) => {
                lock(&self.pending).calls.remove(&id);
                Err(RpcError::Timeout {
                    method: method.to_string(),
                    after: self.call_timeout,
                })
            }
        }
    }
}

/// Server-side method dispatch.
#[async_trait]
pub trait Handler: Send + Sync + 'static {
    async fn handle(&self, method: &str, params: Value) -> Result<Value, RpcError>;
}

/// Answers requests arriving on `connection` until the peer closes it.
pub async fn serve(
    kind: TransportKind,
    connection: Connection,
    handler: Arc<dyn Handler>,
) -> Result<(), RpcError> {
    match kind {
        TransportKind::Sync => serve_sequential(connection, handler).await,
        TransportKind::Streaming => serve_concurrent(connection, handler).await,
    }
}

async fn serve_sequential(connection: Connection, handler: Arc<dyn Handler>) -> Result<(), RpcError> {
    let mut conn = framed(connection);
    while let Some(line) = conn.next().await {
        if let Some(resp) = dispatch(handler.as_ref(), &line?).await {
            conn.send(encode(&resp)?).await?;
        }
    }
    Ok(())
}

async fn serve_concurrent(connection: Connection, handler: Arc<dyn Handler>) -> Result<(), RpcError> {
    let (mut sink, mut stream) = framed(connection).split();
    let (tx, mut rx) = mpsc::channel::<Response>(64);
    let writer = tokio::spawn(async move {
        while let Some(resp) = rx.recv().await {
            sink.send(encode(&resp)?).await?;
        }
        Ok::<_, RpcError>(())
    });

    while let Some(line) = stream.next().await {
        let line = line?;
        let handler = handler.clone();
        let tx = tx.clone();
        tokio::spawn(async move {
            if let Some(resp) = dispatch(handler.as_ref(), &line).await {
                let _ = tx.send(resp).await;
            }
        });
    }
    drop(tx);
    writer
        .await
        .map_err(|err| RpcError::PeerUnreachable(err.to_string()))?
}

async fn dispatch(handler: &dyn Handler, line: &str) -> Option<Response> {
    let req = match serde_json::from_str::<Message>(line) {
        Ok(Message::Request(req)) => req,
        Ok(Message::Response(_)) => {
            return Some(Response::fail(Id::Null, codes::INVALID_REQUEST, "unexpected response"));
        }
        Err(err) => return Some(Response::fail(Id::Null, codes::PARSE_ERROR, err.to_string())),
    };
    let outcome = AssertUnwindSafe(handler.handle(&req.method, req.params))
        .catch_unwind()
        .await
        .unwrap_or_else(|_| {
            tracing::error!(method = %req.method, "rpc handler panicked");
            Err(RpcError::Remote {
                code: codes::INTERNAL_ERROR,
                message: format!("handler for `{}` panicked", req.method),
            })
        });
    let id = req.id?;
    Some(match outcome {
        Ok(result) => Response::success(id, result),
        Err(err) => {
            let (code, message) = err.to_error_object();
            Response::fail(id, code, message)
        }
    })
}

#[cfg(test)]
mod tests {
    use std::sync::atomic::AtomicUsize;

    use serde_json::json;
    use tokio::io::duplex;

    use super::*;
    use crate::broker::{Broker, BrokerOptions, Side};

    struct Echo {
        calls: AtomicUsize,
    }

    #[async_trait]
    impl Handler for Echo {
        async fn handle(&self, method: &str, params: Value) -> Result<Value, RpcError> {
            self.calls.fetch_add(1, Ordering::SeqCst);
            match method {
                "echo" => Ok(params),
                "sleep" => {
                    let ms = params.as_u64().unwrap_or(0);
                    tokio::time::sleep(Duration::from_millis(ms)).await;
                    Ok(json!(ms))
                }
                "fail" => Err(RpcError::remote("nope")),
                "panic" => panic!("boom"),
                other => Err(RpcError::MethodNotImplemented(other.to_string())),
            }
        }
    }

    fn link() -> (Broker, Broker) {
        let (a, b) = duplex(64 * 1024);
        let (ar, aw) = tokio::io::split(a);
        let (br, bw) = tokio::io::split(b);
        (
            Broker::new(Side::Host, ar, aw, BrokerOptions::default()),
            Broker::new(Side::Plugin, br, bw, BrokerOptions::default()),
        )
    }

    fn start(kind: TransportKind, call_timeout: Duration) -> (Arc<dyn Transport>, Arc<Echo>, Broker) {
        let (host, plugin) = link();
        let handler = Arc::new(Echo {
            calls: AtomicUsize::new(0),
        });
        let server_conn = plugin.control().unwrap();
        let dyn_handler: Arc<dyn Handler> = handler.clone();
        tokio::spawn(serve(kind, server_conn, dyn_handler));
        let client = connect(kind, host.control().unwrap(), call_timeout);
        (client, handler, plugin)
    }

    #[test]
    fn request_serialization_omits_null_params() {
        let req = Request::call(Id::Number(1), "Implemented", Value::Null);
        let s = serde_json::to_string(&req).unwrap();
        assert_eq!(s, r#"{"jsonrpc":"2.0","method":"Implemented","id":1}"#);
    }

    #[test]
    fn remote_errors_keep_code_and_message() {
        let resp = Response::fail(Id::Number(3), 42, "bad");
        assert_eq!(
            resp.into_result().unwrap_err(),
            RpcError::Remote {
                code: 42,
                message: "bad".into()
            }
        );
    }

    #[tokio::test]
    async fn both_transports_round_trip_calls() {
        for kind in [TransportKind::Sync, TransportKind::Streaming] {
            let (client, _, _plugin) = start(kind, DEFAULT_CALL_TIMEOUT);
            assert_eq!(client.kind(), kind);
            let value = client.call("echo", json!({"a": [1, 2]})).await.unwrap();
            assert_eq!(value, json!({"a": [1, 2]}));
            let typed: u64 = client.invoke("sleep", &1u64).await.unwrap();
            assert_eq!(typed, 1);
        }
    }

    #[tokio::test]
    async fn remote_failures_propagate_verbatim() {
        for kind in [TransportKind::Sync, TransportKind::Streaming] {
            let (client, _, _plugin) = start(kind, DEFAULT_CALL_TIMEOUT);
            let err = client.call("fail", Value::Null).await.unwrap_err();
            assert_eq!(
                err,
                RpcError::Remote {
                    code: codes::APPLICATION_ERROR,
                    message: "nope".into()
                }
            );
            let err = client.call("missing", Value::Null).await.unwrap_err();
            assert!(matches!(err, RpcError::Remote { code: codes::METHOD_NOT_FOUND, .. }));
            let err = client.call("panic", Value::Null).await.unwrap_err();
            assert!(matches!(err, RpcError::Remote { code: codes::INTERNAL_ERROR, .. }));
            // the server survives a panicking handler
            assert_eq!(client.call("echo", json!(1)).await.unwrap(), json!(1));
        }
    }

    #[tokio::test]
    async fn streaming_transport_runs_calls_concurrently() {
        let (client, _, _plugin) = start(TransportKind::Streaming, DEFAULT_CALL_TIMEOUT);
        let started = std::time::Instant::now();
        let calls = (0..8).map(|_| client.call("sleep", json!(200)));
        let results = futures::future::join_all(calls).await;
        assert!(results.iter().all(|r| r.is_ok()));
        assert!(started.elapsed() < Duration::from_millis(1200));
    }

    #[tokio::test]
    async fn slow_calls_hit_the_deadline() {
        for kind in [TransportKind::Sync, TransportKind::Streaming] {
            let (client, _, _plugin) = start(kind, Duration::from_millis(100));
            let err = client.call("sleep", json!(1000)).await.unwrap_err();
            assert!(matches!(err, RpcError::Timeout { .. }));
            assert!(err.is_transport_failure());
        }
    }

    #[tokio::test]
    async fn sync_transport_skips_stale_answers() {
        let (client, _, _plugin) = start(TransportKind::Sync, Duration::from_millis(100));
        assert!(client.call("sleep", json!(300)).await.is_err());
        tokio::time::sleep(Duration::from_millis(300)).await;
        let value = client.call("echo", json!("fresh")).await.unwrap();
        assert_eq!(value, json!("fresh"));
    }

    #[tokio::test]
    async fn dropped_link_reports_peer_unreachable() {
        for kind in [TransportKind::Sync, TransportKind::Streaming] {
            let (client, _, plugin) = start(kind, DEFAULT_CALL_TIMEOUT);
            assert!(client.call("echo", json!(1)).await.is_ok());
            plugin.close();
            let err = client.call("sleep", json!(5000)).await.unwrap_err();
            assert!(matches!(err, RpcError::PeerUnreachable(_)), "{kind}: {err:?}");
        }
    }
}
