//! Plugin-side process runtime: answers hook calls arriving from the host on
//! the control stream.

use std::{
    panic::AssertUnwindSafe,
    sync::{
        atomic::{AtomicBool, Ordering},
        Arc, OnceLock,
    },
    time::Duration,
};

use anyhow::{anyhow, Context as _, Result};
use async_trait::async_trait;
use futures::FutureExt;
use http::StatusCode;
use serde::{de::DeserializeOwned, Serialize};
use serde_json::Value;
use tokio::io::{AsyncRead, AsyncWrite};
use tracing_subscriber::{fmt, EnvFilter};

use crate::{
    api::ApiClient,
    broker::{Broker, BrokerOptions, Connection, Side, CONTROL_STREAM},
    hooks::{HookId, ImplementedSet},
    http::{body_from_reader, empty, ResponseWriter},
    plugin::Plugin,
    rpc::{self, Handler, RpcError, TransportKind, DEFAULT_CALL_TIMEOUT},
    wire::{ActivateArgs, CommandArgsParams, PostArgs, ServeHttpArgs, UserArgs, IMPLEMENTED},
};

/// Environment handed to the plugin process by the host.
pub const ENV_PLUGIN_ID: &str = "PLEXUS_PLUGIN_ID";
pub const ENV_TRANSPORT: &str = "PLEXUS_PLUGIN_TRANSPORT";
pub const ENV_CALL_TIMEOUT_SECS: &str = "PLEXUS_CALL_TIMEOUT_SECS";
pub const ENV_ACCEPT_TIMEOUT_SECS: &str = "PLEXUS_ACCEPT_TIMEOUT_SECS";

#[derive(Debug, Clone)]
pub struct RuntimeOptions {
    pub transport: TransportKind,
    pub call_timeout: Duration,
    pub broker: BrokerOptions,
}

impl Default for RuntimeOptions {
    fn default() -> Self {
        Self {
            transport: TransportKind::default(),
            call_timeout: DEFAULT_CALL_TIMEOUT,
            broker: BrokerOptions::default(),
        }
    }
}

impl RuntimeOptions {
    /// Reads the settings the host exported; unset variables keep defaults.
    pub fn from_env() -> Result<Self> {
        let mut options = Self::default();
        if let Ok(value) = std::env::var(ENV_TRANSPORT) {
            options.transport = value.parse().map_err(|err: String| anyhow!(err))?;
        }
        if let Some(secs) = env_secs(ENV_CALL_TIMEOUT_SECS)? {
            options.call_timeout = secs;
        }
        if let Some(secs) = env_secs(ENV_ACCEPT_TIMEOUT_SECS)? {
            options.broker.accept_timeout = secs;
        }
        Ok(options)
    }
}

fn env_secs(name: &str) -> Result<Option<Duration>> {
    match std::env::var(name) {
        Ok(value) => {
            let secs: u64 = value
                .parse()
                .with_context(|| format!("{name} must be a number of seconds, got `{value}`"))?;
            Ok(Some(Duration::from_secs(secs)))
        }
        Err(_) => Ok(None),
    }
}

/// Logs go to stderr; stdout carries the link.
pub fn init_logging() {
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info"));
    fmt()
        .with_env_filter(filter)
        .with_writer(std::io::stderr)
        .with_ansi(false)
        .try_init()
        .ok();
}

/// Entry point for a plugin binary: serves `plugin` over stdin/stdout until
/// the host closes the link.
pub async fn serve<P: Plugin>(plugin: P) -> Result<()> {
    init_logging();
    let options = RuntimeOptions::from_env()?;
    tracing::info!(
        plugin_id = %std::env::var(ENV_PLUGIN_ID).unwrap_or_default(),
        transport = %options.transport,
        "plugin runtime starting"
    );
    serve_io(plugin, tokio::io::stdin(), tokio::io::stdout(), options).await
}

/// Serves `plugin` over an arbitrary link.
pub async fn serve_io<P, R, W>(plugin: P, reader: R, writer: W, options: RuntimeOptions) -> Result<()>
where
    P: Plugin,
    R: AsyncRead + Unpin + Send + 'static,
    W: AsyncWrite + Unpin + Send + 'static,
{
    let broker = Arc::new(Broker::new(Side::Plugin, reader, writer, options.broker));
    let control = broker.control()?;
    let implemented = ImplementedSet::from_hooks(&plugin.implemented());
    tracing::debug!(hooks = ?implemented.names(), "serving hooks");
    let handler = Arc::new(HookHandler {
        plugin,
        broker: broker.clone(),
        kind: options.transport,
        call_timeout: options.call_timeout,
        implemented,
        activating: AtomicBool::new(false),
        api: OnceLock::new(),
    });
    let outcome = rpc::serve(options.transport, control, handler).await;
    broker.close();
    outcome.context("control stream failed")?;
    tracing::info!("host closed the link; plugin runtime exiting");
    Ok(())
}

struct HookHandler<P> {
    plugin: P,
    broker: Arc<Broker>,
    kind: TransportKind,
    call_timeout: Duration,
    implemented: ImplementedSet,
    /// Claimed before the API stream is dialed; released only if the dial fails.
    activating: AtomicBool,
    api: OnceLock<ApiClient>,
}

#[async_trait]
impl<P: Plugin> Handler for HookHandler<P> {
    async fn handle(&self, method: &str, params: Value) -> Result<Value, RpcError> {
        if method == IMPLEMENTED {
            return reply(self.implemented.names());
        }
        let hook: HookId = method
            .parse()
            .map_err(|_| RpcError::MethodNotImplemented(method.to_string()))?;
        // Activation sets up the API channel whether or not the plugin
        // listens for the hook itself.
        if hook != HookId::OnActivate && !self.implemented.contains(hook) {
            return Err(RpcError::MethodNotImplemented(method.to_string()));
        }

        let plugin = &self.plugin;
        match hook {
            HookId::OnActivate => self.activate(params).await,
            HookId::OnDeactivate => {
                plugin.on_deactivate().await.map_err(remote)?;
                Ok(Value::Null)
            }
            HookId::OnConfigurationChange => {
                plugin.on_configuration_change().await.map_err(remote)?;
                Ok(Value::Null)
            }
            HookId::ServeHttp => self.serve_http(decode(params)?).await,
            HookId::ExecuteCommand => {
                let CommandArgsParams { context, args } = decode(params)?;
                reply(plugin.execute_command(&context, args).await.map_err(remote)?)
            }
            HookId::MessageWillBePosted => {
                let PostArgs { context, post } = decode(params)?;
                reply(plugin.message_will_be_posted(&context, post).await)
            }
            HookId::MessageHasBeenPosted => {
                let PostArgs { context, post } = decode(params)?;
                plugin.message_has_been_posted(&context, post).await;
                Ok(Value::Null)
            }
            HookId::UserWillLogIn => {
                let UserArgs { context, user } = decode(params)?;
                let rejection = plugin.user_will_log_in(&context, &user).await;
                reply(rejection.unwrap_or_default())
            }
            HookId::UserHasLoggedIn => {
                let UserArgs { context, user } = decode(params)?;
                plugin.user_has_logged_in(&context, &user).await;
                Ok(Value::Null)
            }
        }
    }
}

impl<P: Plugin> HookHandler<P> {
    async fn activate(&self, params: Value) -> Result<Value, RpcError> {
        let ActivateArgs { api_stream } = decode(params)?;
        if self
            .activating
            .compare_exchange(false, true, Ordering::AcqRel, Ordering::Acquire)
            .is_err()
        {
            return Err(RpcError::remote("plugin is already active"));
        }
        let connection = match self.broker.dial(api_stream).await {
            Ok(connection) => connection,
            Err(err) => {
                self.activating.store(false, Ordering::Release);
                return Err(RpcError::remote(format!(
                    "cannot reach host api on stream {api_stream}: {err}"
                )));
            }
        };
        let client = ApiClient::new(rpc::connect(self.kind, connection, self.call_timeout));
        if self.api.set(client.clone()).is_err() {
            return Err(RpcError::remote("plugin is already active"));
        }
        tracing::info!(api_stream, "host api channel established");

        self.plugin.set_api(client.clone());
        if self.implemented.contains(HookId::OnConfigurationChange) {
            self.plugin
                .on_configuration_change()
                .await
                .map_err(|err| RpcError::remote(format!("configuration rejected during activation: {err:#}")))?;
        }
        if self.implemented.contains(HookId::OnActivate) {
            self.plugin.on_activate(client).await.map_err(remote)?;
        }
        Ok(Value::Null)
    }

    async fn serve_http(&self, args: ServeHttpArgs) -> Result<Value, RpcError> {
        let response = self
            .broker
            .dial(args.response_stream)
            .await
            .map_err(|err| RpcError::remote(format!("cannot open response stream: {err}")))?;
        let mut writer = ResponseWriter::new(response);

        let body = if args.body_stream == CONTROL_STREAM {
            Ok(empty())
        } else {
            self.broker.dial(args.body_stream).await.map(body_from_reader)
        };
        let request = match body {
            Ok(body) => args
                .request
                .to_request(body)
                .map_err(|err| (StatusCode::BAD_REQUEST, err.to_string())),
            Err(err) => Err((StatusCode::INTERNAL_SERVER_ERROR, err.to_string())),
        };

        match request {
            Ok(request) => {
                let outcome = AssertUnwindSafe(self.plugin.serve_http(&args.context, request))
                    .catch_unwind()
                    .await;
                match outcome {
                    Ok(resp) => {
                        let streamed = AssertUnwindSafe(writer.send(resp)).catch_unwind().await;
                        let failure = match streamed {
                            Ok(Ok(())) => None,
                            Ok(Err(err)) => Some(err.to_string()),
                            Err(_) => Some("response body panicked".to_string()),
                        };
                        if let Some(reason) = failure {
                            tracing::warn!(uri = %args.request.request_uri, reason, "failed to stream response");
                            if writer.status().is_some() {
                                // The head is out; only a reset tells the host the body is cut short.
                                writer.into_inner().reset();
                                return Ok(Value::Null);
                            }
                            fail_response(&mut writer, StatusCode::INTERNAL_SERVER_ERROR).await;
                        }
                    }
                    Err(_) => {
                        tracing::error!(uri = %args.request.request_uri, "ServeHTTP handler panicked");
                        fail_response(&mut writer, StatusCode::INTERNAL_SERVER_ERROR).await;
                    }
                }
            }
            Err((status, reason)) => {
                tracing::warn!(%status, reason, "cannot rebuild forwarded request");
                fail_response(&mut writer, status).await;
            }
        }

        if let Err(err) = writer.close().await {
            tracing::debug!(error = %err, "response stream already gone");
        }
        Ok(Value::Null)
    }
}

async fn fail_response(writer: &mut ResponseWriter<Connection>, status: StatusCode) {
    if writer.status().is_none() {
        if let Err(err) = writer.write_status(status).await {
            tracing::debug!(error = %err, "could not report failure status");
        }
    }
}

fn decode<T: DeserializeOwned>(params: Value) -> Result<T, RpcError> {
    serde_json::from_value(params).map_err(RpcError::invalid_params)
}

fn reply<T: Serialize>(value: T) -> Result<Value, RpcError> {
    serde_json::to_value(value).map_err(|err| RpcError::Codec(err.to_string()))
}

fn remote(err: anyhow::Error) -> RpcError {
    RpcError::remote(format!("{err:#}"))
}

#[cfg(test)]
mod tests {
    use std::sync::atomic::{AtomicUsize, Ordering};

    use bytes::Bytes;
    use futures::StreamExt;
    use http::{Request, Response};
    use http_body_util::BodyExt;
    use serde_json::json;
    use tokio::io::duplex;

    use super::*;
    use crate::{
        http::{full, response_ops, Body, ResponseOp},
        model::{Context, User},
        rpc::{codes, Transport},
        wire::ForwardedRequest,
    };

    #[derive(Default)]
    struct Recorder {
        activations: Arc<AtomicUsize>,
    }

    #[async_trait]
    impl Plugin for Recorder {
        fn implemented(&self) -> Vec<HookId> {
            vec![HookId::OnActivate, HookId::ServeHttp, HookId::UserWillLogIn]
        }

        async fn on_activate(&self, _api: ApiClient) -> anyhow::Result<()> {
            self.activations.fetch_add(1, Ordering::SeqCst);
            Ok(())
        }

        async fn serve_http(&self, _ctx: &Context, request: Request<Body>) -> Response<Body> {
            if request.uri().path() == "/panic" {
                panic!("handler blew up");
            }
            let bytes = request.into_body().collect().await.unwrap().to_bytes();
            Response::builder()
                .header("x-len", bytes.len().to_string())
                .body(full(bytes))
                .unwrap()
        }

        async fn user_will_log_in(&self, _ctx: &Context, user: &User) -> Option<String> {
            (user.username == "mallory").then(|| "blocked".to_string())
        }
    }

    struct NoApi;

    #[async_trait]
    impl Handler for NoApi {
        async fn handle(&self, method: &str, _params: Value) -> Result<Value, RpcError> {
            Err(RpcError::MethodNotImplemented(method.to_string()))
        }
    }

    fn start<P: Plugin>(plugin: P) -> (Arc<Broker>, Arc<dyn Transport>) {
        let (host_io, plugin_io) = duplex(256 * 1024);
        let (pr, pw) = tokio::io::split(plugin_io);
        tokio::spawn(serve_io(plugin, pr, pw, RuntimeOptions::default()));
        let (hr, hw) = tokio::io::split(host_io);
        let broker = Arc::new(Broker::new(Side::Host, hr, hw, BrokerOptions::default()));
        let control = broker.control().unwrap();
        let transport = rpc::connect(TransportKind::Streaming, control, Duration::from_secs(5));
        (broker, transport)
    }

    async fn activate(broker: &Broker, transport: &dyn Transport) -> Result<Value, RpcError> {
        activate_counting(broker, transport, Arc::new(AtomicUsize::new(0))).await
    }

    /// Activates once, counting API streams the plugin actually opens.
    async fn activate_counting(
        broker: &Broker,
        transport: &dyn Transport,
        opened: Arc<AtomicUsize>,
    ) -> Result<Value, RpcError> {
        let api_stream = broker.next_id();
        broker
            .accept_and_serve(api_stream, move |conn| async move {
                opened.fetch_add(1, Ordering::SeqCst);
                let _ = rpc::serve(TransportKind::Streaming, conn, Arc::new(NoApi)).await;
            })
            .unwrap();
        transport
            .call("OnActivate", json!({ "api_stream": api_stream }))
            .await
    }

    #[tokio::test]
    async fn reports_declared_hooks() {
        let (_broker, transport) = start(Recorder::default());
        let names: Vec<String> = transport.invoke(IMPLEMENTED, &json!({})).await.unwrap();
        assert_eq!(names, vec!["OnActivate", "ServeHTTP", "UserWillLogIn"]);
    }

    #[tokio::test]
    async fn undeclared_hook_is_method_not_found() {
        let (_broker, transport) = start(Recorder::default());
        let err = transport
            .call("ExecuteCommand", json!({}))
            .await
            .unwrap_err();
        assert!(matches!(err, RpcError::Remote { code, .. } if code == codes::METHOD_NOT_FOUND));
    }

    #[tokio::test]
    async fn second_activation_is_refused() {
        let recorder = Recorder::default();
        let activations = recorder.activations.clone();
        let (broker, transport) = start(recorder);
        activate(&broker, transport.as_ref()).await.unwrap();
        let err = activate(&broker, transport.as_ref()).await.unwrap_err();
        assert!(err.to_string().contains("already active"));
        assert_eq!(activations.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn login_gate_returns_rejection() {
        let (_broker, transport) = start(Recorder::default());
        let user = User {
            username: "mallory".into(),
            ..User::default()
        };
        let verdict: String = transport
            .invoke("UserWillLogIn", &UserArgs { context: Context::default(), user })
            .await
            .unwrap();
        assert_eq!(verdict, "blocked");
    }

    async fn serve_once(
        broker: &Broker,
        transport: &dyn Transport,
        path: &str,
        body: Option<&'static [u8]>,
    ) -> Vec<ResponseOp> {
        let response_stream = broker.next_id();
        let pending = broker.listen(response_stream).unwrap();
        let body_stream = match body {
            Some(bytes) => {
                let id = broker.next_id();
                let pending = broker.listen(id).unwrap();
                tokio::spawn(async move {
                    let mut conn = pending.wait().await.unwrap();
                    crate::http::copy_body(full(Bytes::from_static(bytes)), &mut conn)
                        .await
                        .unwrap();
                });
                id
            }
            None => CONTROL_STREAM,
        };
        let ops = tokio::spawn(async move {
            let conn = pending.wait().await.unwrap();
            response_ops(conn)
                .map(|op| op.unwrap())
                .collect::<Vec<_>>()
                .await
        });
        let args = ServeHttpArgs {
            context: Context::default(),
            request: ForwardedRequest {
                method: "POST".into(),
                url: path.into(),
                ..ForwardedRequest::default()
            },
            response_stream,
            body_stream,
        };
        transport.invoke::<_, Value>("ServeHTTP", &args).await.unwrap();
        ops.await.unwrap()
    }

    #[tokio::test]
    async fn serve_http_streams_headers_status_and_body() {
        let (broker, transport) = start(Recorder::default());
        let ops = serve_once(&broker, transport.as_ref(), "/echo", Some(b"ping")).await;
        assert_eq!(
            ops,
            vec![
                ResponseOp::SetHeader {
                    name: "x-len".into(),
                    value: "4".into()
                },
                ResponseOp::WriteStatus(200),
                ResponseOp::Body(Bytes::from_static(b"ping")),
            ]
        );
    }

    #[tokio::test]
    async fn handler_panic_becomes_500() {
        let (broker, transport) = start(Recorder::default());
        let ops = serve_once(&broker, transport.as_ref(), "/panic", None).await;
        assert_eq!(ops, vec![ResponseOp::WriteStatus(500)]);

        // the runtime keeps serving afterwards
        let ops = serve_once(&broker, transport.as_ref(), "/echo", None).await;
        assert!(ops.contains(&ResponseOp::WriteStatus(200)));
    }

    /// Records the order in which activation reaches the plugin.
    struct Lifecycle {
        events: Arc<std::sync::Mutex<Vec<&'static str>>>,
        hooks: Vec<HookId>,
        reject_configuration: bool,
    }

    impl Lifecycle {
        fn new(hooks: Vec<HookId>) -> Self {
            Self {
                events: Arc::default(),
                hooks,
                reject_configuration: false,
            }
        }

        fn push(&self, event: &'static str) {
            self.events.lock().unwrap().push(event);
        }
    }

    #[async_trait]
    impl Plugin for Lifecycle {
        fn implemented(&self) -> Vec<HookId> {
            self.hooks.clone()
        }

        fn set_api(&self, _api: ApiClient) {
            self.push("set_api");
        }

        async fn on_configuration_change(&self) -> anyhow::Result<()> {
            self.push("configuration");
            if self.reject_configuration {
                anyhow::bail!("greeting must not be empty");
            }
            Ok(())
        }

        async fn on_activate(&self, _api: ApiClient) -> anyhow::Result<()> {
            self.push("activate");
            Ok(())
        }
    }

    #[tokio::test]
    async fn activation_hands_over_api_then_configuration_then_activate() {
        let plugin = Lifecycle::new(vec![HookId::OnActivate, HookId::OnConfigurationChange]);
        let events = plugin.events.clone();
        let (broker, transport) = start(plugin);
        activate(&broker, transport.as_ref()).await.unwrap();
        assert_eq!(*events.lock().unwrap(), vec!["set_api", "configuration", "activate"]);
    }

    #[tokio::test]
    async fn api_reaches_plugins_without_activation_hooks() {
        let plugin = Lifecycle::new(vec![HookId::ServeHttp]);
        let events = plugin.events.clone();
        let (broker, transport) = start(plugin);
        activate(&broker, transport.as_ref()).await.unwrap();
        assert_eq!(*events.lock().unwrap(), vec!["set_api"]);
    }

    #[tokio::test]
    async fn rejected_configuration_fails_activation() {
        let mut plugin = Lifecycle::new(vec![HookId::OnActivate, HookId::OnConfigurationChange]);
        plugin.reject_configuration = true;
        let events = plugin.events.clone();
        let (broker, transport) = start(plugin);
        let err = activate(&broker, transport.as_ref()).await.unwrap_err();
        assert!(err.to_string().contains("greeting must not be empty"), "{err}");
        assert_eq!(*events.lock().unwrap(), vec!["set_api", "configuration"]);
    }

    #[tokio::test]
    async fn racing_activations_open_one_api_stream() {
        let (broker, transport) = start(Recorder::default());
        let opened = Arc::new(AtomicUsize::new(0));
        let (first, second) = tokio::join!(
            activate_counting(&broker, transport.as_ref(), opened.clone()),
            activate_counting(&broker, transport.as_ref(), opened.clone()),
        );
        assert_eq!([first.is_ok(), second.is_ok()].iter().filter(|ok| **ok).count(), 1);
        tokio::time::sleep(Duration::from_millis(100)).await;
        assert_eq!(opened.load(Ordering::SeqCst), 1);
    }

    /// Sends a head and one chunk, then fails the body.
    struct Broken;

    #[async_trait]
    impl Plugin for Broken {
        fn implemented(&self) -> Vec<HookId> {
            vec![HookId::ServeHttp]
        }

        async fn serve_http(&self, _ctx: &Context, _request: Request<Body>) -> Response<Body> {
            let frames = futures::stream::iter([
                Ok(http_body::Frame::data(Bytes::from_static(b"partial"))),
                Err::<_, crate::http::BoxError>("disk read failed".into()),
            ]);
            Response::new(BodyExt::boxed_unsync(http_body_util::StreamBody::new(frames)))
        }
    }

    #[tokio::test]
    async fn body_failure_after_head_resets_the_response_stream() {
        let (broker, transport) = start(Broken);
        let response_stream = broker.next_id();
        let pending = broker.listen(response_stream).unwrap();
        let args = ServeHttpArgs {
            context: Context::default(),
            request: ForwardedRequest {
                method: "GET".into(),
                url: "/file".into(),
                ..ForwardedRequest::default()
            },
            response_stream,
            body_stream: CONTROL_STREAM,
        };
        let reader = tokio::spawn(async move {
            let mut ops = response_ops(pending.wait().await.unwrap());
            let mut seen = Vec::new();
            while let Some(op) = ops.next().await {
                match op {
                    Ok(op) => seen.push(op),
                    Err(err) => return (seen, Some(err.to_string())),
                }
            }
            (seen, None)
        });
        transport.invoke::<_, Value>("ServeHTTP", &args).await.unwrap();
        let (seen, failure) = reader.await.unwrap();
        assert_eq!(
            seen,
            vec![
                ResponseOp::WriteStatus(200),
                ResponseOp::Body(Bytes::from_static(b"partial")),
            ]
        );
        assert!(failure.is_some(), "a cut-short body must not look complete");
    }
}
