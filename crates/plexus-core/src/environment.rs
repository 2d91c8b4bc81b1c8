//! The set of loaded plugins and the server-side entry points into them.

use std::{
    collections::BTreeMap,
    future::Future,
    net::SocketAddr,
    ops::ControlFlow,
    path::{Path, PathBuf},
    sync::{
        atomic::{AtomicU64, Ordering},
        Arc, RwLock, RwLockReadGuard, RwLockWriteGuard,
    },
};

use anyhow::{bail, Context as _, Result};
use bytes::Bytes;
use http::{header, HeaderMap, Request, Response};
use http_body::Body as HttpBody;
use plexus_plugin_sdk::{
    hooks::{HookId, HookTable},
    http::{Body, BoxError},
    manifest::{PluginManifest, MANIFEST_FILE},
    model::{CommandArgs, CommandResponse, Context, Post, User},
    wire::{CommandArgsParams, PostArgs, PostVerdict, UserArgs},
};
use serde_json::Value;

use crate::{
    api::{ApiServer, HostApi, PluginScope},
    config::PluginSettings,
    handle::{HandleError, HandleOptions, PluginHandle},
    proxy,
    router::PluginRoute,
};

/// One activated plugin.
#[derive(Debug)]
pub struct ActivePlugin {
    pub manifest: PluginManifest,
    pub bundle_path: PathBuf,
    pub handle: Arc<PluginHandle>,
}

pub struct PluginEnvironment {
    table: Arc<HookTable>,
    host: Arc<dyn HostApi>,
    settings: PluginSettings,
    plugins: RwLock<BTreeMap<String, Arc<ActivePlugin>>>,
    request_seq: AtomicU64,
}

impl PluginEnvironment {
    pub fn new(settings: PluginSettings, host: Arc<dyn HostApi>) -> Self {
        Self {
            table: Arc::new(HookTable::new()),
            host,
            settings,
            plugins: RwLock::new(BTreeMap::new()),
            request_seq: AtomicU64::new(0),
        }
    }

    pub fn settings(&self) -> &PluginSettings {
        &self.settings
    }

    fn read(&self) -> RwLockReadGuard<'_, BTreeMap<String, Arc<ActivePlugin>>> {
        self.plugins.read().unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    fn write(&self) -> RwLockWriteGuard<'_, BTreeMap<String, Arc<ActivePlugin>>> {
        self.plugins.write().unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    /// Spawns and activates every enabled bundle under the configured
    /// directory. A bundle that fails to start is logged and skipped.
    pub async fn load_all(&self) -> Result<Vec<String>> {
        let dir = self.settings.directory();
        let mut loaded = Vec::new();
        for (manifest, bundle_path) in discover_bundles(&dir)? {
            if !self.settings.is_enabled(&manifest.id) {
                tracing::debug!(plugin_id = %manifest.id, "plugin not enabled; skipping");
                continue;
            }
            let id = manifest.id.clone();
            match self.activate_bundle(manifest, bundle_path).await {
                Ok(_) => loaded.push(id),
                Err(err) => tracing::error!(plugin_id = %id, error = %format!("{err:#}"), "failed to load plugin"),
            }
        }
        tracing::info!(count = loaded.len(), directory = %dir.display(), "plugins loaded");
        Ok(loaded)
    }

    /// Starts the bundle's process and activates it.
    pub async fn activate_bundle(&self, manifest: PluginManifest, bundle_path: PathBuf) -> Result<Arc<PluginHandle>> {
        if self.read().contains_key(&manifest.id) {
            bail!("plugin `{}` is already active", manifest.id);
        }
        let options = HandleOptions::from_settings(&self.settings, manifest.transport);
        let handle = PluginHandle::spawn(&manifest, &bundle_path, options, &self.table).await?;
        let id = manifest.id.clone();
        self.attach(manifest, bundle_path, handle)
            .await
            .with_context(|| format!("failed to activate plugin `{id}`"))
    }

    /// Activates an already connected handle and makes it reachable.
    pub async fn attach(
        &self,
        manifest: PluginManifest,
        bundle_path: PathBuf,
        handle: PluginHandle,
    ) -> Result<Arc<PluginHandle>, HandleError> {
        if self.read().contains_key(&manifest.id) {
            return Err(HandleError::AlreadyActive);
        }
        let handle = Arc::new(handle);
        let api = ApiServer::new(
            PluginScope {
                plugin_id: manifest.id.clone(),
                bundle_path: bundle_path.clone(),
                settings: manifest.settings.clone(),
            },
            self.host.clone(),
        );
        if let Err(err) = handle.activate(Arc::new(api)).await {
            handle.shutdown().await;
            return Err(err);
        }

        let plugin = Arc::new(ActivePlugin {
            manifest,
            bundle_path,
            handle: handle.clone(),
        });
        let previous = self.write().insert(plugin.manifest.id.clone(), plugin);
        if let Some(previous) = previous {
            tracing::warn!(plugin_id = %previous.manifest.id, "replaced a concurrently attached plugin");
            previous.handle.shutdown().await;
        }
        Ok(handle)
    }

    pub fn active_ids(&self) -> Vec<String> {
        self.read()
            .values()
            .filter(|plugin| plugin.handle.is_active())
            .map(|plugin| plugin.manifest.id.clone())
            .collect()
    }

    pub fn get(&self, id: &str) -> Option<Arc<ActivePlugin>> {
        self.read().get(id).cloned()
    }

    /// Active handles implementing `hook`, in plugin id order.
    fn implementers(&self, hook: HookId) -> Vec<Arc<PluginHandle>> {
        self.read()
            .values()
            .filter(|plugin| plugin.handle.is_active() && plugin.handle.implements(hook))
            .map(|plugin| plugin.handle.clone())
            .collect()
    }

    /// Calls `f` for each active plugin implementing `hook` until it breaks,
    /// returning the break value.
    pub async fn run_multi_plugin_hook<T, F, Fut>(&self, hook: HookId, mut f: F) -> Option<T>
    where
        F: FnMut(Arc<PluginHandle>) -> Fut,
        Fut: Future<Output = ControlFlow<T>>,
    {
        for handle in self.implementers(hook) {
            if let ControlFlow::Break(value) = f(handle).await {
                return Some(value);
            }
        }
        None
    }

    /// Login gate. The first plugin returning a non-empty rejection wins; a
    /// plugin that fails to answer does not block the login.
    pub async fn user_will_log_in(&self, context: &Context, user: &User) -> Option<String> {
        let args = UserArgs {
            context: context.clone(),
            user: user.clone(),
        };
        let args = &args;
        self.run_multi_plugin_hook(HookId::UserWillLogIn, move |handle| {
            async move {
                match handle.invoke::<_, String>(HookId::UserWillLogIn, args).await {
                    Ok(rejection) if !rejection.is_empty() => {
                        tracing::info!(plugin_id = handle.id(), user_id = %args.user.id, "login rejected by plugin");
                        ControlFlow::Break(rejection)
                    }
                    Ok(_) => ControlFlow::Continue(()),
                    Err(err) => {
                        tracing::warn!(plugin_id = handle.id(), error = %err, "UserWillLogIn failed");
                        ControlFlow::Continue(())
                    }
                }
            }
        })
        .await
    }

    /// Notifies every implementer without waiting for them.
    pub async fn user_has_logged_in(&self, context: &Context, user: &User) {
        let args = UserArgs {
            context: context.clone(),
            user: user.clone(),
        };
        self.notify(HookId::UserHasLoggedIn, args).await;
    }

    /// Runs the post through every implementer in turn. Each may replace the
    /// post; the first rejection stops the chain.
    pub async fn message_will_be_posted(&self, context: &Context, post: Post) -> Result<Post, String> {
        let mut post = post;
        for handle in self.implementers(HookId::MessageWillBePosted) {
            let args = PostArgs {
                context: context.clone(),
                post: post.clone(),
            };
            match handle
                .invoke::<_, PostVerdict>(HookId::MessageWillBePosted, &args)
                .await
            {
                Ok(verdict) if !verdict.rejection.is_empty() => return Err(verdict.rejection),
                Ok(PostVerdict { post: Some(replaced), .. }) => post = replaced,
                Ok(_) => {}
                Err(err) => tracing::warn!(plugin_id = handle.id(), error = %err, "MessageWillBePosted failed"),
            }
        }
        Ok(post)
    }

    pub async fn message_has_been_posted(&self, context: &Context, post: &Post) {
        let args = PostArgs {
            context: context.clone(),
            post: post.clone(),
        };
        self.notify(HookId::MessageHasBeenPosted, args).await;
    }

    pub async fn configuration_changed(&self) {
        self.notify(HookId::OnConfigurationChange, ()).await;
    }

    async fn notify<P>(&self, hook: HookId, args: P)
    where
        P: serde::Serialize + Clone + Send + Sync + 'static,
    {
        self.run_multi_plugin_hook(hook, |handle| {
            let args = args.clone();
            tokio::spawn(async move {
                if let Err(err) = handle.invoke::<_, Value>(hook, &args).await {
                    tracing::warn!(plugin_id = handle.id(), hook = %hook, error = %err, "hook failed");
                }
            });
            std::future::ready(ControlFlow::<()>::Continue(()))
        })
        .await;
    }

    pub async fn execute_command(
        &self,
        plugin_id: &str,
        context: &Context,
        args: CommandArgs,
    ) -> Result<CommandResponse, HandleError> {
        let plugin = self
            .get(plugin_id)
            .ok_or_else(|| HandleError::Unavailable(format!("plugin `{plugin_id}` is not loaded")))?;
        let params = CommandArgsParams {
            context: context.clone(),
            args,
        };
        plugin.handle.invoke(HookId::ExecuteCommand, &params).await
    }

    /// Routes `/plugins/{id}/...` to the plugin's `ServeHTTP`.
    pub async fn serve_plugin_request<B>(&self, mut request: Request<B>, remote_addr: Option<SocketAddr>) -> Response<Body>
    where
        B: HttpBody<Data = Bytes> + Send + Unpin + 'static,
        B::Error: Into<BoxError> + Send,
    {
        let Some(route) = PluginRoute::select(request.uri()) else {
            return proxy::not_found();
        };
        let handle = match self.get(&route.plugin_id) {
            Some(plugin) if plugin.handle.is_active() => plugin.handle.clone(),
            _ => {
                tracing::debug!(plugin_id = %route.plugin_id, "request for inactive or unknown plugin");
                return proxy::not_found();
            }
        };
        let context = self.request_context(request.headers(), remote_addr);
        route.apply(&mut request);
        proxy::serve_http(handle, context, request, remote_addr).await
    }

    fn request_context(&self, headers: &HeaderMap, remote_addr: Option<SocketAddr>) -> Context {
        let text = |name: &str| {
            headers
                .get(name)
                .and_then(|value| value.to_str().ok())
                .map(str::trim)
                .unwrap_or_default()
                .to_string()
        };
        let request_id = match text("x-request-id") {
            id if id.is_empty() => format!("req-{}", self.request_seq.fetch_add(1, Ordering::Relaxed) + 1),
            id => id,
        };
        let forwarded = text("x-forwarded-for");
        let ip_address = match forwarded.split(',').next().map(str::trim) {
            Some(first) if !first.is_empty() => first.to_string(),
            _ => remote_addr.map(|addr| addr.ip().to_string()).unwrap_or_default(),
        };
        Context {
            session_id: text("x-session-id"),
            request_id,
            ip_address,
            accept_language: text(header::ACCEPT_LANGUAGE.as_str()),
            user_agent: text(header::USER_AGENT.as_str()),
        }
    }

    /// Shuts one plugin down and forgets it.
    pub async fn deactivate(&self, id: &str) -> bool {
        let removed = self.write().remove(id);
        match removed {
            Some(plugin) => {
                plugin.handle.shutdown().await;
                true
            }
            None => false,
        }
    }

    pub async fn shutdown(&self) {
        let plugins: Vec<_> = std::mem::take(&mut *self.write()).into_values().collect();
        for plugin in plugins {
            plugin.handle.shutdown().await;
        }
    }
}

impl std::fmt::Debug for PluginEnvironment {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("PluginEnvironment")
            .field("directory", &self.settings.directory)
            .field("plugins", &self.read().keys().collect::<Vec<_>>())
            .finish()
    }
}

/// Finds bundle directories (those holding a `plugin.json`) under `dir`.
/// Invalid manifests and bundles without their executable are logged and
/// skipped; a missing directory is empty.
pub fn discover_bundles(dir: &Path) -> Result<Vec<(PluginManifest, PathBuf)>> {
    let mut bundles = Vec::new();
    if !dir.exists() {
        return Ok(bundles);
    }
    let mut entries = std::fs::read_dir(dir)
        .with_context(|| format!("failed to read plugin directory {}", dir.display()))?
        .collect::<std::io::Result<Vec<_>>>()?;
    entries.sort_by_key(|entry| entry.file_name());
    for entry in entries {
        let path = entry.path();
        if !path.is_dir() || !path.join(MANIFEST_FILE).is_file() {
            continue;
        }
        let manifest = match PluginManifest::load(&path).and_then(|m| m.validate_bundle(&path).map(|_| m)) {
            Ok(manifest) => manifest,
            Err(err) => {
                tracing::warn!(bundle = %path.display(), error = %format!("{err:#}"), "skipping invalid plugin bundle");
                continue;
            }
        };
        if bundles.iter().any(|(seen, _): &(PluginManifest, PathBuf)| seen.id == manifest.id) {
            tracing::warn!(plugin_id = %manifest.id, bundle = %path.display(), "duplicate plugin id; skipping");
            continue;
        }
        bundles.push((manifest, path));
    }
    Ok(bundles)
}
