//! Front HTTP listener that hands `/plugins/{id}/...` to the environment.

use std::{convert::Infallible, future::Future, net::SocketAddr, sync::Arc, time::Duration, time::Instant};

use anyhow::{anyhow, Context, Result};
use bytes::Bytes;
use http::{Request, Response, StatusCode};
use http_body::Body as HttpBody;
use hyper::{body::Incoming, server::conn::http1, service::service_fn};
use hyper_util::rt::TokioIo;
use plexus_plugin_sdk::http::{Body, BoxError};
use rustls::{Certificate, PrivateKey, ServerConfig};
use tokio::{
    io::{AsyncRead, AsyncWrite},
    net::TcpListener,
    sync::watch,
    task::JoinSet,
};
use tokio_rustls::TlsAcceptor;
use tower::{timeout::error::Elapsed, util::BoxCloneService, ServiceBuilder, ServiceExt};
use tracing::Instrument;

use crate::{
    config::{Config, ResolvedListener, Tls},
    environment::PluginEnvironment,
    proxy::{internal_error, response_with},
};

/// Request handler shared by every connection of one listener.
pub type PluginService<B> = BoxCloneService<Request<B>, Response<Body>, BoxError>;

/// Peer address of the connection a request arrived on.
#[derive(Debug, Clone, Copy)]
pub struct PeerAddr(pub SocketAddr);

pub struct Server {
    env: Arc<PluginEnvironment>,
    listeners: Vec<ListenerRuntime>,
}

struct ListenerRuntime {
    name: String,
    addr: SocketAddr,
    acceptor: Option<TlsAcceptor>,
    request_timeout: Duration,
}

impl Server {
    pub fn new(config: &Config, env: Arc<PluginEnvironment>) -> Result<Self> {
        config.validate()?;
        let listeners = config
            .resolved_listeners()?
            .into_iter()
            .map(ListenerRuntime::try_from)
            .collect::<Result<Vec<_>>>()?;
        Ok(Self { env, listeners })
    }

    /// Serves until Ctrl+C, then shuts every plugin down.
    pub async fn run(self) -> Result<()> {
        self.run_until(async {
            if let Err(err) = tokio::signal::ctrl_c().await {
                tracing::error!(error = %err, "failed to install ctrl-c handler");
            }
        })
        .await
    }

    pub async fn run_until<F>(self, signal: F) -> Result<()>
    where
        F: Future<Output = ()>,
    {
        let (shutdown_tx, shutdown_rx) = watch::channel(false);
        let mut join_set = JoinSet::new();
        for listener in self.listeners {
            let tcp = TcpListener::bind(listener.addr)
                .await
                .with_context(|| format!("failed to bind listener `{}`", listener.name))?;
            let rx = shutdown_rx.clone();
            let env = self.env.clone();
            join_set.spawn(serve_listener(tcp, listener, env, rx));
        }

        tracing::info!("listeners started; awaiting shutdown signal");
        signal.await;
        tracing::info!("shutdown signal received; draining listeners");
        shutdown_tx.send(true).ok();

        while let Some(result) = join_set.join_next().await {
            match result {
                Ok(Err(err)) => tracing::error!(error = %format!("{err:#}"), "listener failed"),
                Err(err) => tracing::error!(error = %err, "listener task aborted"),
                Ok(Ok(())) => {}
            }
        }
        self.env.shutdown().await;
        Ok(())
    }
}

async fn serve_listener(
    tcp: TcpListener,
    listener: ListenerRuntime,
    env: Arc<PluginEnvironment>,
    mut shutdown: watch::Receiver<bool>,
) -> Result<()> {
    let local = tcp.local_addr()?;
    tracing::info!(
        listener = listener.name,
        addr = %local,
        tls = listener.acceptor.is_some(),
        "listener ready"
    );
    let service = plugin_service::<Incoming>(env, listener.request_timeout);

    loop {
        tokio::select! {
            biased;
            _ = shutdown.changed() => {
                tracing::info!(listener = listener.name, "listener shutting down");
                break;
            }
            accept = tcp.accept() => {
                let (stream, peer_addr) = match accept {
                    Ok(accepted) => accepted,
                    Err(err) => {
                        tracing::warn!(listener = listener.name, error = %err, "accept failed");
                        continue;
                    }
                };
                let acceptor = listener.acceptor.clone();
                let service = service.clone();
                let listener_name = listener.name.clone();
                tokio::spawn(async move {
                    let outcome = match acceptor {
                        Some(acceptor) => match acceptor.accept(stream).await {
                            Ok(tls) => serve_connection(tls, peer_addr, service).await,
                            Err(err) => Err(anyhow!(err).context("tls handshake failed")),
                        },
                        None => serve_connection(stream, peer_addr, service).await,
                    };
                    if let Err(err) = outcome {
                        tracing::warn!(listener = listener_name, peer = %peer_addr, error = %format!("{err:#}"), "connection closed with error");
                    }
                });
            }
        }
    }

    Ok(())
}

async fn serve_connection<I>(io: I, peer_addr: SocketAddr, service: PluginService<Incoming>) -> Result<()>
where
    I: AsyncRead + AsyncWrite + Unpin + Send + 'static,
{
    let hyper_service = service_fn(move |req| {
        let service = service.clone();
        async move { Ok::<_, Infallible>(handle_request(service, req, peer_addr).await) }
    });
    http1::Builder::new()
        .preserve_header_case(true)
        .title_case_headers(true)
        .serve_connection(TokioIo::new(io), hyper_service)
        .await
        .with_context(|| format!("connection from {peer_addr} failed"))
}

/// Routes plugin requests through the environment under a deadline.
pub fn plugin_service<B>(env: Arc<PluginEnvironment>, request_timeout: Duration) -> PluginService<B>
where
    B: HttpBody<Data = Bytes> + Send + Unpin + 'static,
    B::Error: Into<BoxError> + Send,
{
    let inner = tower::service_fn(move |req: Request<B>| {
        let env = env.clone();
        async move {
            let peer = req.extensions().get::<PeerAddr>().map(|peer| peer.0);
            Ok::<_, Infallible>(env.serve_plugin_request(req, peer).await)
        }
    });
    ServiceBuilder::new()
        .timeout(request_timeout)
        .service(inner)
        .boxed_clone()
}

async fn handle_request<B>(service: PluginService<B>, mut req: Request<B>, peer_addr: SocketAddr) -> Response<Body> {
    let start = Instant::now();
    let span = tracing::info_span!(
        "request",
        method = %req.method(),
        path = %req.uri().path(),
        peer = %peer_addr,
        status = tracing::field::Empty,
        duration_ms = tracing::field::Empty,
    );
    req.extensions_mut().insert(PeerAddr(peer_addr));

    let (response, outcome) = match service.oneshot(req).instrument(span.clone()).await {
        Ok(response) => (response, "ok"),
        Err(err) if err.is::<Elapsed>() => {
            span.in_scope(|| tracing::warn!("request deadline expired"));
            (response_with(StatusCode::GATEWAY_TIMEOUT, "request timed out"), "timeout")
        }
        Err(err) => {
            span.in_scope(|| tracing::error!(error = %err, "request handling failed"));
            (internal_error(), "error")
        }
    };
    span.record("status", response.status().as_u16());
    span.record("duration_ms", start.elapsed().as_millis() as u64);
    metrics::counter!("plexus_requests_total", "outcome" => outcome).increment(1);
    response
}

impl TryFrom<ResolvedListener> for ListenerRuntime {
    type Error = anyhow::Error;

    fn try_from(value: ResolvedListener) -> Result<Self> {
        let acceptor = match &value.tls {
            Some(tls) => Some(TlsAcceptor::from(Arc::new(build_tls_config(tls)?))),
            None => None,
        };
        Ok(Self {
            name: value.name,
            addr: value.addr,
            acceptor,
            request_timeout: value.request_timeout,
        })
    }
}

fn build_tls_config(tls: &Tls) -> Result<ServerConfig> {
    let certs = load_certs(&tls.cert)?;
    let key = load_private_key(&tls.key)?;
    let mut config = ServerConfig::builder()
        .with_safe_defaults()
        .with_no_client_auth()
        .with_single_cert(certs, key)
        .context("invalid certificate/key pair")?;
    config.alpn_protocols = vec![b"http/1.1".to_vec()];
    Ok(config)
}

fn load_certs(path: &str) -> Result<Vec<Certificate>> {
    let data = std::fs::read(path).with_context(|| format!("failed to read cert {path}"))?;
    let mut reader = std::io::Cursor::new(data);
    let raw = rustls_pemfile::certs(&mut reader).map_err(|_| anyhow!("invalid certificate data"))?;
    if raw.is_empty() {
        anyhow::bail!("no certificates found in {path}");
    }
    Ok(raw.into_iter().map(Certificate).collect())
}

fn load_private_key(path: &str) -> Result<PrivateKey> {
    let data = std::fs::read(path).with_context(|| format!("failed to read key {path}"))?;
    let mut reader = std::io::Cursor::new(data);
    while let Some(item) = rustls_pemfile::read_one(&mut reader).map_err(|_| anyhow!("invalid key format"))? {
        match item {
            rustls_pemfile::Item::PKCS8Key(key)
            | rustls_pemfile::Item::RSAKey(key)
            | rustls_pemfile::Item::ECKey(key) => return Ok(PrivateKey(key)),
            _ => continue,
        }
    }
    anyhow::bail!("no usable private keys found in {path}")
}

#[cfg(test)]
mod tests {
    use async_trait::async_trait;
    use http_body_util::{BodyExt, Full};
    use plexus_plugin_sdk::{
        hooks::{HookId, HookTable},
        manifest::PluginManifest,
        model::Context as HookContext,
        plugin::Plugin,
        runtime::{serve_io, RuntimeOptions},
    };
    use tokio::io::{duplex, AsyncReadExt, AsyncWriteExt};

    use super::*;
    use crate::{
        api::MemoryHostApi,
        config::PluginSettings,
        handle::{HandleOptions, PluginHandle},
    };

    struct Clock;

    #[async_trait]
    impl Plugin for Clock {
        fn implemented(&self) -> Vec<HookId> {
            vec![HookId::ServeHttp]
        }

        async fn serve_http(&self, ctx: &HookContext, request: Request<Body>) -> Response<Body> {
            if request.uri().path() == "/slow" {
                tokio::time::sleep(Duration::from_secs(5)).await;
            }
            Response::new(plexus_plugin_sdk::http::full(format!("tick for {}", ctx.ip_address)))
        }
    }

    async fn environment() -> Arc<PluginEnvironment> {
        let env = Arc::new(PluginEnvironment::new(
            PluginSettings::default(),
            Arc::new(MemoryHostApi::new()),
        ));
        let (host_io, plugin_io) = duplex(64 * 1024);
        let (pr, pw) = tokio::io::split(plugin_io);
        tokio::spawn(serve_io(Clock, pr, pw, RuntimeOptions::default()));
        let (hr, hw) = tokio::io::split(host_io);
        let handle = PluginHandle::connect("clock", hr, hw, HandleOptions::default(), &HookTable::new(), None)
            .await
            .unwrap();
        let manifest = PluginManifest {
            id: "clock".into(),
            version: "1.0.0".into(),
            ..PluginManifest::default()
        };
        env.attach(manifest, "/bundles/clock".into(), handle).await.unwrap();
        env
    }

    fn get(path: &str) -> Request<Full<Bytes>> {
        Request::builder().uri(path).body(Full::new(Bytes::new())).unwrap()
    }

    #[tokio::test]
    async fn deadline_maps_to_gateway_timeout() {
        let service = plugin_service(environment().await, Duration::from_millis(100));
        let peer: SocketAddr = "192.0.2.7:4000".parse().unwrap();

        let response = handle_request(service.clone(), get("/plugins/clock/now"), peer).await;
        assert_eq!(response.status(), StatusCode::OK);
        let body = response.into_body().collect().await.unwrap().to_bytes();
        assert_eq!(body, "tick for 192.0.2.7");

        let response = handle_request(service.clone(), get("/plugins/clock/slow"), peer).await;
        assert_eq!(response.status(), StatusCode::GATEWAY_TIMEOUT);

        let response = handle_request(service, get("/api/v4/system/ping"), peer).await;
        assert_eq!(response.status(), StatusCode::NOT_FOUND);
    }

    #[tokio::test]
    async fn serves_plugin_routes_over_tcp() {
        let env = environment().await;
        let tcp = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = tcp.local_addr().unwrap();
        let (shutdown_tx, shutdown_rx) = watch::channel(false);
        let listener = ListenerRuntime {
            name: "test".into(),
            addr,
            acceptor: None,
            request_timeout: Duration::from_secs(5),
        };
        let task = tokio::spawn(serve_listener(tcp, listener, env, shutdown_rx));

        let mut stream = tokio::net::TcpStream::connect(addr).await.unwrap();
        stream
            .write_all(b"GET /plugins/clock/now HTTP/1.1\r\nHost: localhost\r\nConnection: close\r\n\r\n")
            .await
            .unwrap();
        let mut raw = String::new();
        stream.read_to_string(&mut raw).await.unwrap();
        assert!(raw.starts_with("HTTP/1.1 200 OK"), "{raw}");
        assert!(raw.contains("tick for 127.0.0.1"), "{raw}");

        shutdown_tx.send(true).unwrap();
        task.await.unwrap().unwrap();
    }

    #[test]
    fn missing_tls_material_is_reported() {
        let tls = Tls {
            cert: "/nonexistent/cert.pem".into(),
            key: "/nonexistent/key.pem".into(),
        };
        let err = build_tls_config(&tls).err().unwrap();
        assert!(err.to_string().contains("failed to read cert"));
    }
}
