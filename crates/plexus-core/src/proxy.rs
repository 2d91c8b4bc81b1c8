//! Host side of `ServeHTTP`: forwards one HTTP request to a plugin and
//! streams its response back.

use std::{net::SocketAddr, sync::Arc};

use bytes::Bytes;
use futures::{stream, StreamExt};
use http::{HeaderMap, HeaderName, HeaderValue, Request, Response, StatusCode};
use http_body::{Body as HttpBody, Frame};
use http_body_util::{BodyExt, StreamBody};
use plexus_plugin_sdk::{
    broker::{Connection, PendingAccept, CONTROL_STREAM},
    hooks::HookId,
    http::{copy_body, full, response_ops, Body, BoxError, CodecError, ResponseOp, ResponseOpCodec},
    model::Context,
    wire::{ForwardedRequest, ServeHttpArgs},
};
use serde_json::Value;
use tokio::{
    sync::{oneshot, watch},
    time::sleep,
};
use tokio_util::codec::FramedRead;

use crate::handle::PluginHandle;

/// Outcome of the `ServeHTTP` call, published once it settles. `Err` carries
/// the reason the call failed.
type Dispatch = watch::Receiver<Option<Result<(), String>>>;

/// Forwards `request` to the plugin behind `handle`.
///
/// Resolves as soon as the response head is known; the body keeps streaming
/// from the plugin afterwards and ends with an error if the call fails or
/// outlives the call timeout. Never fails: every error maps to a status.
pub async fn serve_http<B>(
    handle: Arc<PluginHandle>,
    context: Context,
    request: Request<B>,
    remote_addr: Option<SocketAddr>,
) -> Response<Body>
where
    B: HttpBody<Data = Bytes> + Send + Unpin + 'static,
    B::Error: Into<BoxError> + Send,
{
    if !handle.implements(HookId::ServeHttp) {
        metrics::counter!("plexus_plugin_http_total", "outcome" => "not_implemented").increment(1);
        return not_found();
    }

    let broker = handle.broker();
    let response_stream = broker.next_id();
    let pending_response = match broker.listen(response_stream) {
        Ok(pending) => pending,
        Err(err) => return transport_failure(&handle, "cannot open response stream", &err),
    };

    let (parts, body) = request.into_parts();
    let body_stream = if body.is_end_stream() {
        CONTROL_STREAM
    } else {
        let id = broker.next_id();
        match broker.listen(id) {
            Ok(pending) => {
                spawn_body_copy(handle.id().to_string(), pending, body);
                id
            }
            Err(err) => return transport_failure(&handle, "cannot open body stream", &err),
        }
    };

    let (head_tx, head_rx) = oneshot::channel();
    let (outcome_tx, mut outcome_rx) = watch::channel(None);
    tokio::spawn(relay(
        handle.id().to_string(),
        pending_response,
        head_tx,
        outcome_rx.clone(),
    ));

    let args = ServeHttpArgs {
        context,
        request: ForwardedRequest::from_parts(&parts, remote_addr),
        response_stream,
        body_stream,
    };
    let dispatcher = handle.clone();
    tokio::spawn(async move {
        let outcome = dispatcher
            .invoke::<_, Value>(HookId::ServeHttp, &args)
            .await
            .map(drop)
            .map_err(|err| err.to_string());
        let _ = outcome_tx.send(Some(outcome));
    });

    let deadline = sleep(handle.call_timeout());
    tokio::pin!(deadline);
    tokio::pin!(head_rx);
    let mut dispatched = false;
    loop {
        tokio::select! {
            biased;
            head = &mut head_rx => {
                return match head {
                    Ok(response) => {
                        metrics::counter!("plexus_plugin_http_total", "outcome" => "ok").increment(1);
                        response
                    }
                    Err(_) => {
                        metrics::counter!("plexus_plugin_http_total", "outcome" => "error").increment(1);
                        internal_error()
                    }
                };
            }
            failure = dispatch_failure(&mut outcome_rx), if !dispatched => {
                dispatched = true;
                let Some(err) = failure else {
                    continue;
                };
                tracing::warn!(plugin_id = handle.id(), error = %err, "ServeHTTP dispatch failed");
                metrics::counter!("plexus_plugin_http_total", "outcome" => "error").increment(1);
                return internal_error();
            }
            _ = &mut deadline => {
                tracing::warn!(plugin_id = handle.id(), "no response head before deadline");
                metrics::counter!("plexus_plugin_http_total", "outcome" => "timeout").increment(1);
                return internal_error();
            }
        }
    }
}

fn spawn_body_copy<B>(plugin_id: String, pending: PendingAccept, body: B)
where
    B: HttpBody<Data = Bytes> + Send + Unpin + 'static,
    B::Error: Into<BoxError> + Send,
{
    tokio::spawn(async move {
        let mut connection = match pending.wait().await {
            Ok(connection) => connection,
            Err(err) => {
                tracing::debug!(plugin_id = %plugin_id, error = %err, "plugin never opened the body stream");
                return;
            }
        };
        match copy_body(body, &mut connection).await {
            Ok(bytes) => tracing::trace!(plugin_id = %plugin_id, bytes, "request body forwarded"),
            Err(err) => tracing::debug!(plugin_id = %plugin_id, error = %err, "request body copy stopped"),
        }
    });
}

/// Waits for the call to settle; `Some(reason)` when it failed.
async fn dispatch_failure(outcome: &mut Dispatch) -> Option<String> {
    let settled = match outcome.wait_for(Option::is_some).await {
        Ok(settled) => settled,
        Err(_) => return Some("ServeHTTP dispatch abandoned".to_string()),
    };
    let failure = match &*settled {
        Some(Err(reason)) => Some(reason.clone()),
        _ => None,
    };
    failure
}

/// Reads response ops until the head is known, then hands the rest of the
/// stream over as the response body.
async fn relay(
    plugin_id: String,
    pending: PendingAccept,
    head_tx: oneshot::Sender<Response<Body>>,
    outcome: Dispatch,
) {
    let connection = match pending.wait().await {
        Ok(connection) => connection,
        Err(err) => {
            tracing::warn!(plugin_id = %plugin_id, error = %err, "plugin never opened the response stream");
            return;
        }
    };
    let mut ops = response_ops(connection);
    let mut headers = HeaderMap::new();
    let (status, first_chunk) = loop {
        match ops.next().await {
            Some(Ok(ResponseOp::SetHeader { name, value })) => {
                match (HeaderName::from_bytes(name.as_bytes()), HeaderValue::from_bytes(&value)) {
                    (Ok(name), Ok(value)) => {
                        headers.append(name, value);
                    }
                    _ => tracing::warn!(plugin_id = %plugin_id, header = %name, "dropping invalid header"),
                }
            }
            Some(Ok(ResponseOp::WriteStatus(code))) => break (status_from(&plugin_id, code), None),
            Some(Ok(ResponseOp::Body(chunk))) => break (StatusCode::OK, Some(chunk)),
            Some(Err(err)) => {
                tracing::warn!(plugin_id = %plugin_id, error = %err, "response stream failed before head");
                return;
            }
            None => {
                let mut response = Response::new(plexus_plugin_sdk::http::empty());
                *response.headers_mut() = headers;
                let _ = head_tx.send(response);
                return;
            }
        }
    };

    let head = stream::iter(first_chunk.map(|chunk| Ok::<_, BoxError>(Frame::data(chunk))));
    let rest = stream::unfold(
        BodyRelay {
            plugin_id,
            ops,
            outcome,
            settled: false,
            done: false,
        },
        BodyRelay::next_frame,
    );
    let body = BodyExt::boxed_unsync(StreamBody::new(head.chain(rest)));

    let mut response = Response::new(body);
    *response.status_mut() = status;
    *response.headers_mut() = headers;
    let _ = head_tx.send(response);
}

/// Streams body ops after the head until the plugin closes the stream, the
/// stream fails, or the call itself fails.
struct BodyRelay {
    plugin_id: String,
    ops: FramedRead<Connection, ResponseOpCodec>,
    outcome: Dispatch,
    /// The call returned successfully; the stream alone decides the end.
    settled: bool,
    done: bool,
}

enum Step {
    Op(Option<Result<ResponseOp, CodecError>>),
    Dispatch(Option<String>),
}

impl BodyRelay {
    async fn next_frame(mut self) -> Option<(Result<Frame<Bytes>, BoxError>, Self)> {
        loop {
            if self.done {
                return None;
            }
            let step = tokio::select! {
                biased;
                op = self.ops.next() => Step::Op(op),
                failure = dispatch_failure(&mut self.outcome), if !self.settled => Step::Dispatch(failure),
            };
            match step {
                Step::Op(Some(Ok(ResponseOp::Body(chunk)))) => return Some((Ok(Frame::data(chunk)), self)),
                Step::Op(Some(Ok(other))) => {
                    tracing::debug!(plugin_id = %self.plugin_id, op = ?other, "ignoring op after response head");
                }
                Step::Op(Some(Err(err))) => {
                    self.done = true;
                    return Some((Err(Box::new(err) as BoxError), self));
                }
                Step::Op(None) => return None,
                Step::Dispatch(None) => self.settled = true,
                Step::Dispatch(Some(reason)) => {
                    tracing::warn!(plugin_id = %self.plugin_id, reason, "ServeHTTP failed mid-response");
                    self.done = true;
                    return Some((Err(reason.into()), self));
                }
            }
        }
    }
}

fn status_from(plugin_id: &str, code: u16) -> StatusCode {
    StatusCode::from_u16(code).unwrap_or_else(|_| {
        tracing::warn!(plugin_id, code, "plugin wrote an invalid status");
        StatusCode::INTERNAL_SERVER_ERROR
    })
}

fn transport_failure(handle: &PluginHandle, what: &str, err: &dyn std::fmt::Display) -> Response<Body> {
    tracing::warn!(plugin_id = handle.id(), error = %err, "{what}");
    metrics::counter!("plexus_plugin_http_total", "outcome" => "error").increment(1);
    internal_error()
}

pub(crate) fn not_found() -> Response<Body> {
    response_with(StatusCode::NOT_FOUND, "not found")
}

pub(crate) fn internal_error() -> Response<Body> {
    response_with(StatusCode::INTERNAL_SERVER_ERROR, "internal error")
}

pub(crate) fn response_with(status: StatusCode, msg: &'static str) -> Response<Body> {
    let mut response = Response::new(full(Bytes::from_static(msg.as_bytes())));
    *response.status_mut() = status;
    response
}

#[cfg(test)]
mod tests {
    use async_trait::async_trait;
    use http_body_util::Full;
    use plexus_plugin_sdk::{
        hooks::HookTable,
        plugin::Plugin,
        runtime::{serve_io, RuntimeOptions},
    };
    use tokio::io::duplex;

    use super::*;
    use crate::handle::HandleOptions;

    struct Shaper;

    #[async_trait]
    impl Plugin for Shaper {
        fn implemented(&self) -> Vec<HookId> {
            vec![HookId::ServeHttp]
        }

        async fn serve_http(&self, _ctx: &Context, request: Request<Body>) -> Response<Body> {
            match request.uri().path() {
                "/teapot" => Response::builder()
                    .status(StatusCode::IM_A_TEAPOT)
                    .header("x-kind", "tea")
                    .body(full("short and stout"))
                    .unwrap(),
                "/silent" => Response::new(plexus_plugin_sdk::http::empty()),
                "/stall" => {
                    tokio::time::sleep(std::time::Duration::from_secs(10)).await;
                    Response::new(full("late"))
                }
                _ => {
                    let bytes = request.into_body().collect().await.unwrap().to_bytes();
                    Response::new(full(bytes))
                }
            }
        }
    }

    struct Mute;

    #[async_trait]
    impl Plugin for Mute {
        fn implemented(&self) -> Vec<HookId> {
            Vec::new()
        }
    }

    async fn start<P: Plugin>(plugin: P, options: HandleOptions) -> Arc<PluginHandle> {
        let (host_io, plugin_io) = duplex(256 * 1024);
        let (pr, pw) = tokio::io::split(plugin_io);
        tokio::spawn(serve_io(plugin, pr, pw, RuntimeOptions::default()));
        let (hr, hw) = tokio::io::split(host_io);
        Arc::new(
            PluginHandle::connect("shaper", hr, hw, options, &HookTable::new(), None)
                .await
                .unwrap(),
        )
    }

    fn get(path: &str) -> Request<Full<Bytes>> {
        Request::builder().uri(path).body(Full::new(Bytes::new())).unwrap()
    }

    async fn body_of(response: Response<Body>) -> Bytes {
        response.into_body().collect().await.unwrap().to_bytes()
    }

    #[tokio::test]
    async fn status_headers_and_body_reach_the_client() {
        let handle = start(Shaper, HandleOptions::default()).await;
        let response = serve_http(handle, Context::default(), get("/teapot"), None).await;
        assert_eq!(response.status(), StatusCode::IM_A_TEAPOT);
        assert_eq!(response.headers()["x-kind"], "tea");
        assert_eq!(body_of(response).await, "short and stout");
    }

    #[tokio::test]
    async fn request_body_is_forwarded() {
        let handle = start(Shaper, HandleOptions::default()).await;
        let request = Request::builder()
            .method("POST")
            .uri("/echo")
            .body(Full::new(Bytes::from_static(b"payload")))
            .unwrap();
        let response = serve_http(handle, Context::default(), request, None).await;
        assert_eq!(response.status(), StatusCode::OK);
        assert_eq!(body_of(response).await, "payload");
    }

    #[tokio::test]
    async fn close_without_status_is_empty_ok() {
        let handle = start(Shaper, HandleOptions::default()).await;
        let response = serve_http(handle, Context::default(), get("/silent"), None).await;
        assert_eq!(response.status(), StatusCode::OK);
        assert!(body_of(response).await.is_empty());
    }

    #[tokio::test]
    async fn missing_hook_is_404_without_a_call() {
        let handle = start(Mute, HandleOptions::default()).await;
        let response = serve_http(handle.clone(), Context::default(), get("/"), None).await;
        assert_eq!(response.status(), StatusCode::NOT_FOUND);
        // No stream was opened for the refused request.
        assert_eq!(handle.broker().next_id(), 1);
    }

    #[tokio::test]
    async fn no_head_before_deadline_is_500() {
        let options = HandleOptions {
            call_timeout: std::time::Duration::from_millis(200),
            ..HandleOptions::default()
        };
        let handle = start(Shaper, options).await;
        let response = serve_http(handle, Context::default(), get("/stall"), None).await;
        assert_eq!(response.status(), StatusCode::INTERNAL_SERVER_ERROR);
    }
}
