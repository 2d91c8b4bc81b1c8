//! Host-side handle on one plugin process.

use std::{
    path::Path,
    process::Stdio,
    sync::{
        atomic::{AtomicU32, Ordering},
        Arc, Mutex, MutexGuard,
    },
    time::Duration,
};

use anyhow::Context as _;
use futures::StreamExt;
use plexus_plugin_sdk::{
    broker::{Broker, BrokerError, BrokerOptions, Side},
    hooks::{HookId, HookTable, ImplementedSet},
    manifest::PluginManifest,
    rpc::{self, Handler, RpcError, Transport, TransportKind, DEFAULT_CALL_TIMEOUT},
    runtime::{ENV_ACCEPT_TIMEOUT_SECS, ENV_CALL_TIMEOUT_SECS, ENV_PLUGIN_ID, ENV_TRANSPORT},
    wire::{ActivateArgs, IMPLEMENTED},
};
use serde::{de::DeserializeOwned, Serialize};
use serde_json::Value;
use tokio::{
    io::{AsyncRead, AsyncWrite},
    process::{Child, ChildStderr, Command},
    task::JoinHandle,
};
use tokio_util::codec::{FramedRead, LinesCodec};

use crate::config::PluginSettings;

#[derive(Debug, thiserror::Error)]
pub enum HandleError {
    /// Answered locally without touching the link.
    #[error("hook `{0}` is not implemented")]
    NotImplemented(HookId),
    #[error("plugin unavailable: {0}")]
    Unavailable(String),
    #[error("plugin is already active")]
    AlreadyActive,
    #[error(transparent)]
    Rpc(#[from] RpcError),
    #[error(transparent)]
    Broker(#[from] BrokerError),
}

#[derive(Debug, Clone)]
pub struct HandleOptions {
    pub transport: TransportKind,
    pub call_timeout: Duration,
    pub accept_timeout: Duration,
    /// Consecutive call timeouts after which the plugin is marked failed.
    pub max_consecutive_failures: u32,
}

impl Default for HandleOptions {
    fn default() -> Self {
        Self {
            transport: TransportKind::default(),
            call_timeout: DEFAULT_CALL_TIMEOUT,
            accept_timeout: BrokerOptions::default().accept_timeout,
            max_consecutive_failures: 3,
        }
    }
}

impl HandleOptions {
    pub fn from_settings(settings: &PluginSettings, transport: TransportKind) -> Self {
        Self {
            transport,
            call_timeout: settings.call_timeout(),
            accept_timeout: settings.accept_timeout(),
            max_consecutive_failures: settings.max_consecutive_failures,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Activation {
    Inactive,
    Activating,
    Active,
    Failed(String),
}

pub struct PluginHandle {
    id: String,
    broker: Broker,
    transport: Arc<dyn Transport>,
    implemented: ImplementedSet,
    options: HandleOptions,
    state: Mutex<Activation>,
    failures: AtomicU32,
    api_task: Mutex<Option<JoinHandle<()>>>,
    child: Mutex<Option<Child>>,
}

fn lock<T>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
}

impl PluginHandle {
    /// Starts the bundle's executable and connects to it over its stdio.
    pub async fn spawn(
        manifest: &PluginManifest,
        bundle_dir: &Path,
        options: HandleOptions,
        table: &HookTable,
    ) -> anyhow::Result<Self> {
        let executable = manifest
            .executable_path(bundle_dir)
            .with_context(|| format!("plugin `{}` names no executable", manifest.id))?;
        let mut child = Command::new(&executable)
            .current_dir(bundle_dir)
            .env(ENV_PLUGIN_ID, &manifest.id)
            .env(ENV_TRANSPORT, options.transport.to_string())
            .env(ENV_CALL_TIMEOUT_SECS, options.call_timeout.as_secs().to_string())
            .env(ENV_ACCEPT_TIMEOUT_SECS, options.accept_timeout.as_secs().to_string())
            .stdin(Stdio::piped())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .kill_on_drop(true)
            .spawn()
            .with_context(|| {
                format!(
                    "failed to start plugin `{}` from {}",
                    manifest.id,
                    executable.display()
                )
            })?;
        tracing::info!(plugin_id = %manifest.id, pid = ?child.id(), "plugin process started");

        let stdin = child.stdin.take().context("plugin stdin is not piped")?;
        let stdout = child.stdout.take().context("plugin stdout is not piped")?;
        if let Some(stderr) = child.stderr.take() {
            forward_stderr(manifest.id.clone(), stderr);
        }

        let declared = manifest.declared_hooks();
        let handle = Self::connect(
            manifest.id.clone(),
            stdout,
            stdin,
            options,
            table,
            declared.as_deref(),
        )
        .await?;
        *lock(&handle.child) = Some(child);
        Ok(handle)
    }

    /// Builds a handle over an already established link and queries which
    /// hooks the plugin implements.
    ///
    /// `declared` comes from the manifest; reported hooks missing from it are
    /// disabled.
    pub async fn connect<R, W>(
        id: impl Into<String>,
        reader: R,
        writer: W,
        options: HandleOptions,
        table: &HookTable,
        declared: Option<&[&str]>,
    ) -> Result<Self, HandleError>
    where
        R: AsyncRead + Unpin + Send + 'static,
        W: AsyncWrite + Unpin + Send + 'static,
    {
        let id = id.into();
        let broker = Broker::new(
            Side::Host,
            reader,
            writer,
            BrokerOptions {
                accept_timeout: options.accept_timeout,
            },
        );
        let control = broker.control()?;
        let transport = rpc::connect(options.transport, control, options.call_timeout);

        let reported = match transport.invoke::<_, Vec<String>>(IMPLEMENTED, &()).await {
            Ok(names) => ImplementedSet::from_names(table, &names),
            Err(err) => {
                tracing::warn!(plugin_id = %id, error = %err, "capability query failed; treating every hook as unimplemented");
                ImplementedSet::none()
            }
        };
        let implemented = reconcile(&id, reported, declared);
        tracing::info!(plugin_id = %id, hooks = ?implemented.names(), transport = %options.transport, "plugin connected");

        Ok(Self {
            id,
            broker,
            transport,
            implemented,
            options,
            state: Mutex::new(Activation::Inactive),
            failures: AtomicU32::new(0),
            api_task: Mutex::new(None),
            child: Mutex::new(None),
        })
    }

    pub fn id(&self) -> &str {
        &self.id
    }

    pub fn implemented(&self) -> &ImplementedSet {
        &self.implemented
    }

    pub fn implements(&self, hook: HookId) -> bool {
        self.implemented.contains(hook)
    }

    pub fn activation(&self) -> Activation {
        lock(&self.state).clone()
    }

    pub fn is_active(&self) -> bool {
        *lock(&self.state) == Activation::Active
    }

    pub fn call_timeout(&self) -> Duration {
        self.options.call_timeout
    }

    pub(crate) fn broker(&self) -> &Broker {
        &self.broker
    }

    /// Opens the host API channel and calls `OnActivate`.
    pub async fn activate(&self, api: Arc<dyn Handler>) -> Result<(), HandleError> {
        {
            let mut state = lock(&self.state);
            match &*state {
                Activation::Inactive => {}
                Activation::Activating | Activation::Active => return Err(HandleError::AlreadyActive),
                Activation::Failed(reason) => return Err(HandleError::Unavailable(reason.clone())),
            }
            *state = Activation::Activating;
        }

        let api_stream = self.broker.next_id();
        let kind = self.options.transport;
        let plugin_id = self.id.clone();
        let task = self
            .broker
            .accept_and_serve(api_stream, move |connection| async move {
                if let Err(err) = rpc::serve(kind, connection, api).await {
                    tracing::warn!(plugin_id = %plugin_id, error = %err, "api channel failed");
                }
                tracing::debug!(plugin_id = %plugin_id, "api channel closed");
            });
        let task = match task {
            Ok(task) => task,
            Err(err) => {
                self.mark_failed(format!("cannot open api channel: {err}"));
                return Err(err.into());
            }
        };

        let outcome = self
            .transport
            .invoke::<_, Value>(HookId::OnActivate.as_str(), &ActivateArgs { api_stream })
            .await;
        self.record(HookId::OnActivate, &outcome);
        match outcome {
            Ok(_) => {
                *lock(&self.api_task) = Some(task);
                let mut state = lock(&self.state);
                if *state == Activation::Activating {
                    *state = Activation::Active;
                }
                tracing::info!(plugin_id = %self.id, api_stream, "plugin activated");
                Ok(())
            }
            Err(err) => {
                task.abort();
                self.mark_failed(format!("activation failed: {err}"));
                Err(err.into())
            }
        }
    }

    /// Calls `hook` on the plugin, answering locally when it is not
    /// implemented or the plugin has failed.
    pub async fn invoke<P, R>(&self, hook: HookId, params: &P) -> Result<R, HandleError>
    where
        P: Serialize + ?Sized,
        R: DeserializeOwned,
    {
        if !self.implemented.contains(hook) {
            metrics::counter!("plexus_hook_calls_total", "hook" => hook.as_str(), "outcome" => "not_implemented")
                .increment(1);
            return Err(HandleError::NotImplemented(hook));
        }
        if let Activation::Failed(reason) = self.activation() {
            return Err(HandleError::Unavailable(reason));
        }
        let outcome = self.transport.invoke(hook.as_str(), params).await;
        self.record(hook, &outcome);
        outcome.map_err(HandleError::from)
    }

    /// Failure accounting: a lost link fails the plugin at once, timeouts only
    /// after `max_consecutive_failures` in a row.
    fn record<T>(&self, hook: HookId, outcome: &Result<T, RpcError>) {
        let label = match outcome {
            Ok(_) => {
                self.failures.store(0, Ordering::Relaxed);
                "ok"
            }
            Err(RpcError::PeerUnreachable(reason)) => {
                self.mark_failed(format!("peer unreachable: {reason}"));
                "unreachable"
            }
            Err(RpcError::Timeout { .. }) => {
                let failures = self.failures.fetch_add(1, Ordering::Relaxed) + 1;
                tracing::warn!(plugin_id = %self.id, hook = %hook, failures, "hook call timed out");
                if failures >= self.options.max_consecutive_failures {
                    self.mark_failed(format!("{failures} consecutive timeouts"));
                }
                "timeout"
            }
            Err(RpcError::MethodNotImplemented(_)) => "not_implemented",
            Err(RpcError::Remote { .. }) => "remote_error",
            Err(RpcError::Codec(_)) => "codec_error",
        };
        metrics::counter!("plexus_hook_calls_total", "hook" => hook.as_str(), "outcome" => label).increment(1);
    }

    fn mark_failed(&self, reason: String) {
        let mut state = lock(&self.state);
        if !matches!(*state, Activation::Failed(_)) {
            tracing::error!(plugin_id = %self.id, reason = %reason, "plugin marked failed");
            *state = Activation::Failed(reason);
        }
    }

    /// Calls `OnDeactivate` when the plugin is active and implements it, then
    /// tears the link down and stops the process.
    pub async fn shutdown(&self) {
        if self.is_active() && self.implements(HookId::OnDeactivate) {
            if let Err(err) = self.invoke::<_, Value>(HookId::OnDeactivate, &()).await {
                tracing::warn!(plugin_id = %self.id, error = %err, "OnDeactivate failed");
            }
        }
        {
            let mut state = lock(&self.state);
            if !matches!(*state, Activation::Failed(_)) {
                *state = Activation::Inactive;
            }
        }
        if let Some(task) = lock(&self.api_task).take() {
            task.abort();
        }
        self.broker.close();

        let child = lock(&self.child).take();
        if let Some(mut child) = child {
            if let Err(err) = child.kill().await {
                tracing::debug!(plugin_id = %self.id, error = %err, "plugin process already gone");
            }
        }
        tracing::info!(plugin_id = %self.id, "plugin shut down");
    }
}

impl std::fmt::Debug for PluginHandle {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("PluginHandle")
            .field("id", &self.id)
            .field("implemented", &self.implemented.names())
            .field("activation", &self.activation())
            .finish()
    }
}

fn reconcile(id: &str, reported: ImplementedSet, declared: Option<&[&str]>) -> ImplementedSet {
    let Some(declared) = declared else {
        return reported;
    };
    let kept: Vec<HookId> = HookId::ALL
        .into_iter()
        .filter(|hook| reported.contains(*hook))
        .filter(|hook| {
            let matched = declared.contains(&hook.as_str());
            if !matched {
                tracing::warn!(plugin_id = id, hook = %hook, "hook not declared with a matching signature; disabled");
            }
            matched
        })
        .collect();
    ImplementedSet::from_hooks(&kept)
}

/// Re-emits each line the plugin writes to stderr as a host log event.
fn forward_stderr(plugin_id: String, stderr: ChildStderr) {
    tokio::spawn(async move {
        let mut lines = FramedRead::new(stderr, LinesCodec::new_with_max_length(64 * 1024));
        while let Some(line) = lines.next().await {
            match line {
                Ok(line) if line.trim().is_empty() => {}
                Ok(line) => tracing::info!(target: "plexus::plugin", plugin_id = %plugin_id, "{line}"),
                Err(err) => {
                    tracing::debug!(plugin_id = %plugin_id, error = %err, "plugin stderr closed");
                    break;
                }
            }
        }
    });
}

#[cfg(test)]
mod tests {
    use std::sync::Arc;

    use async_trait::async_trait;
    use plexus_plugin_sdk::{
        api::ApiClient,
        model::{Context, User},
        plugin::Plugin,
        runtime::{serve_io, RuntimeOptions},
        wire::UserArgs,
    };
    use tokio::io::duplex;

    use super::*;

    struct Gate {
        delay: Duration,
    }

    #[async_trait]
    impl Plugin for Gate {
        fn implemented(&self) -> Vec<HookId> {
            vec![HookId::OnActivate, HookId::UserWillLogIn]
        }

        async fn on_activate(&self, api: ApiClient) -> anyhow::Result<()> {
            api.log_info("gate ready").await?;
            Ok(())
        }

        async fn user_will_log_in(&self, _ctx: &Context, user: &User) -> Option<String> {
            tokio::time::sleep(self.delay).await;
            (user.username == "blocked").then(|| "no entry".to_string())
        }
    }

    struct NoApi;

    #[async_trait]
    impl Handler for NoApi {
        async fn handle(&self, method: &str, _params: Value) -> Result<Value, RpcError> {
            if method.starts_with("Log") {
                return Ok(Value::Null);
            }
            Err(RpcError::MethodNotImplemented(method.to_string()))
        }
    }

    async fn start(plugin: Gate, options: HandleOptions, declared: Option<&[&str]>) -> PluginHandle {
        let (host_io, plugin_io) = duplex(64 * 1024);
        let (pr, pw) = tokio::io::split(plugin_io);
        let runtime = RuntimeOptions {
            transport: options.transport,
            ..RuntimeOptions::default()
        };
        tokio::spawn(serve_io(plugin, pr, pw, runtime));
        let (hr, hw) = tokio::io::split(host_io);
        PluginHandle::connect("gate", hr, hw, options, &HookTable::new(), declared)
            .await
            .unwrap()
    }

    fn login(username: &str) -> UserArgs {
        UserArgs {
            context: Context::default(),
            user: User {
                username: username.into(),
                ..User::default()
            },
        }
    }

    #[tokio::test]
    async fn unimplemented_hook_is_answered_locally() {
        let handle = start(Gate { delay: Duration::ZERO }, HandleOptions::default(), None).await;
        assert!(handle.implements(HookId::UserWillLogIn));
        let err = handle
            .invoke::<_, Value>(HookId::ServeHttp, &())
            .await
            .unwrap_err();
        assert!(matches!(err, HandleError::NotImplemented(HookId::ServeHttp)));
        assert_eq!(handle.activation(), Activation::Inactive);
    }

    #[tokio::test]
    async fn activation_happens_once() {
        for transport in [TransportKind::Sync, TransportKind::Streaming] {
            let options = HandleOptions {
                transport,
                ..HandleOptions::default()
            };
            let handle = start(Gate { delay: Duration::ZERO }, options, None).await;
            handle.activate(Arc::new(NoApi)).await.unwrap();
            assert!(handle.is_active());
            let err = handle.activate(Arc::new(NoApi)).await.unwrap_err();
            assert!(matches!(err, HandleError::AlreadyActive));
            assert!(handle.is_active());

            let verdict: String = handle.invoke(HookId::UserWillLogIn, &login("blocked")).await.unwrap();
            assert_eq!(verdict, "no entry");
        }
    }

    #[tokio::test]
    async fn undeclared_hooks_are_disabled() {
        let declared = ["OnActivate"];
        let handle = start(Gate { delay: Duration::ZERO }, HandleOptions::default(), Some(&declared)).await;
        assert!(handle.implements(HookId::OnActivate));
        assert!(!handle.implements(HookId::UserWillLogIn));
    }

    #[tokio::test]
    async fn repeated_timeouts_fail_the_plugin() {
        let options = HandleOptions {
            call_timeout: Duration::from_millis(200),
            max_consecutive_failures: 2,
            ..HandleOptions::default()
        };
        let handle = start(Gate { delay: Duration::from_secs(5) }, options, None).await;

        let first = handle.invoke::<_, String>(HookId::UserWillLogIn, &login("a")).await;
        assert!(matches!(first, Err(HandleError::Rpc(RpcError::Timeout { .. }))));
        assert_eq!(handle.activation(), Activation::Inactive);

        let second = handle.invoke::<_, String>(HookId::UserWillLogIn, &login("a")).await;
        assert!(matches!(second, Err(HandleError::Rpc(RpcError::Timeout { .. }))));
        assert!(matches!(handle.activation(), Activation::Failed(_)));

        let third = handle.invoke::<_, String>(HookId::UserWillLogIn, &login("a")).await;
        assert!(matches!(third, Err(HandleError::Unavailable(_))));
    }

    #[tokio::test]
    async fn lost_link_fails_the_plugin_immediately() {
        let handle = start(Gate { delay: Duration::ZERO }, HandleOptions::default(), None).await;
        handle.activate(Arc::new(NoApi)).await.unwrap();
        handle.broker().close();
        let err = handle
            .invoke::<_, String>(HookId::UserWillLogIn, &login("a"))
            .await
            .unwrap_err();
        assert!(matches!(err, HandleError::Rpc(RpcError::PeerUnreachable(_))));
        assert!(matches!(handle.activation(), Activation::Failed(_)));
    }

    #[test]
    fn reconcile_keeps_only_declared_hooks() {
        let reported = ImplementedSet::from_hooks(&[HookId::ServeHttp, HookId::ExecuteCommand]);
        let kept = reconcile("p", reported, Some(&["ServeHTTP", "OnActivate"]));
        assert_eq!(kept.names(), vec!["ServeHTTP"]);
        assert_eq!(reconcile("p", reported, None), reported);
    }
}
