//! Demo plugin: echo routes, a login gate and a `/demo` slash command.

use std::{
    collections::HashMap,
    sync::{
        atomic::{AtomicU64, Ordering},
        OnceLock, RwLock,
    },
};

use anyhow::{bail, Context as _, Result};
use async_trait::async_trait;
use http::{header, Method, Request, Response, StatusCode};
use plexus_plugin_sdk::{
    api::ApiClient,
    helpers::{ensure_bot, load_i18n_bundle, I18nBundle},
    hooks::HookId,
    http::{full, Body},
    model::{Bot, CommandArgs, CommandResponse, Context, User},
    plugin::Plugin,
    runtime,
};
use serde::Deserialize;

const BOT_USERNAME: &str = "demo-bot";

#[derive(Debug, Clone, Default, Deserialize)]
#[serde(default)]
struct DemoSettings {
    greeting: String,
    blocked_users: Vec<String>,
}

#[derive(Default)]
struct DemoPlugin {
    api: OnceLock<ApiClient>,
    bot_id: OnceLock<String>,
    settings: RwLock<DemoSettings>,
    i18n: RwLock<I18nBundle>,
    logins: AtomicU64,
}

impl DemoPlugin {
    fn with_settings(settings: DemoSettings) -> Self {
        let plugin = Self::default();
        plugin.apply(settings, None);
        plugin
    }

    /// Installs new settings and, when given, a freshly loaded translation
    /// bundle. English strings come from the settings.
    fn apply(&self, settings: DemoSettings, bundle: Option<I18nBundle>) {
        let mut english = HashMap::from([
            ("demo.greeting".to_string(), "Hello from the demo plugin".to_string()),
            ("demo.login_blocked".to_string(), "Logins for this account are blocked".to_string()),
            ("demo.command_reply".to_string(), "The demo plugin is active".to_string()),
        ]);
        if !settings.greeting.is_empty() {
            english.insert("demo.greeting".into(), settings.greeting.clone());
        }
        {
            let mut i18n = self.i18n.write().unwrap_or_else(|poisoned| poisoned.into_inner());
            if let Some(bundle) = bundle {
                *i18n = bundle;
            }
            i18n.add_messages("en", english);
        }
        *self.settings.write().unwrap_or_else(|poisoned| poisoned.into_inner()) = settings;
    }

    fn text(&self, language: &str, id: &str) -> String {
        let i18n = self.i18n.read().unwrap_or_else(|poisoned| poisoned.into_inner());
        i18n.localize(language, id).unwrap_or(id).to_string()
    }

    fn settings(&self) -> DemoSettings {
        self.settings
            .read()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
            .clone()
    }

    fn api(&self) -> Result<&ApiClient> {
        self.api.get().context("plugin is not active")
    }

    async fn reload(&self, api: &ApiClient) -> Result<()> {
        let settings: DemoSettings = api
            .load_plugin_configuration()
            .await
            .context("failed to load plugin configuration")?;
        let bundle = match load_i18n_bundle(api).await {
            Ok(bundle) => Some(bundle),
            Err(err) => {
                tracing::warn!(error = %format!("{err:#}"), "no translations loaded");
                None
            }
        };
        self.apply(settings, bundle);
        Ok(())
    }
}

#[async_trait]
impl Plugin for DemoPlugin {
    fn implemented(&self) -> Vec<HookId> {
        vec![
            HookId::OnActivate,
            HookId::OnDeactivate,
            HookId::OnConfigurationChange,
            HookId::ServeHttp,
            HookId::ExecuteCommand,
            HookId::UserWillLogIn,
            HookId::UserHasLoggedIn,
        ]
    }

    fn set_api(&self, api: ApiClient) {
        let _ = self.api.set(api);
    }

    /// Settings and translations are already loaded: activation runs
    /// `OnConfigurationChange` first.
    async fn on_activate(&self, api: ApiClient) -> Result<()> {
        let bot = Bot {
            username: BOT_USERNAME.into(),
            display_name: "Demo Bot".into(),
            description: "Posts on behalf of the demo plugin".into(),
            ..Bot::default()
        };
        let bot_id = ensure_bot(&api, &bot).await?;
        let _ = self.bot_id.set(bot_id.clone());
        api.log_info(format!("demo plugin active with bot {bot_id}")).await?;
        Ok(())
    }

    async fn on_deactivate(&self) -> Result<()> {
        tracing::info!(logins = self.logins.load(Ordering::Relaxed), "demo plugin stopping");
        Ok(())
    }

    async fn on_configuration_change(&self) -> Result<()> {
        self.reload(self.api()?).await
    }

    async fn serve_http(&self, ctx: &Context, request: Request<Body>) -> Response<Body> {
        match (request.method(), request.uri().path()) {
            (&Method::GET, "/hello") => Response::new(full(self.text(&ctx.accept_language, "demo.greeting"))),
            (&Method::POST | &Method::PUT, "/echo") => {
                let content_type = request.headers().get(header::CONTENT_TYPE).cloned();
                let mut response = Response::new(request.into_body());
                if let Some(value) = content_type {
                    response.headers_mut().insert(header::CONTENT_TYPE, value);
                }
                response
            }
            (&Method::GET, "/whoami") => match serde_json::to_vec(ctx) {
                Ok(json) => {
                    let mut response = Response::new(full(json));
                    response
                        .headers_mut()
                        .insert(header::CONTENT_TYPE, header::HeaderValue::from_static("application/json"));
                    response
                }
                Err(_) => status(StatusCode::INTERNAL_SERVER_ERROR, "internal error"),
            },
            (_, "/hello" | "/echo" | "/whoami") => status(StatusCode::METHOD_NOT_ALLOWED, "method not allowed"),
            _ => status(StatusCode::NOT_FOUND, "not found"),
        }
    }

    async fn execute_command(&self, ctx: &Context, args: CommandArgs) -> Result<CommandResponse> {
        let trigger = args.command.split_whitespace().next().unwrap_or_default();
        if trigger != "/demo" {
            bail!("unknown command `{trigger}`");
        }
        Ok(CommandResponse::ephemeral(self.text(&ctx.accept_language, "demo.command_reply")))
    }

    async fn user_will_log_in(&self, ctx: &Context, user: &User) -> Option<String> {
        let blocked = self
            .settings()
            .blocked_users
            .iter()
            .any(|name| name.eq_ignore_ascii_case(&user.username));
        blocked.then(|| self.text(&ctx.accept_language, "demo.login_blocked"))
    }

    async fn user_has_logged_in(&self, _ctx: &Context, user: &User) {
        let count = self.logins.fetch_add(1, Ordering::Relaxed) + 1;
        if let Ok(api) = self.api() {
            if let Err(err) = api.log_info(format!("{} logged in ({count} so far)", user.username)).await {
                tracing::warn!(error = %err, "failed to report login");
            }
        }
    }
}

fn status(code: StatusCode, msg: &'static str) -> Response<Body> {
    let mut response = Response::new(full(msg));
    *response.status_mut() = code;
    response
}

#[tokio::main]
async fn main() -> Result<()> {
    runtime::serve(DemoPlugin::default()).await
}

#[cfg(test)]
mod tests {
    use std::{path::PathBuf, sync::Arc, sync::Mutex};

    use bytes::Bytes;
    use http_body_util::BodyExt;
    use plexus_plugin_sdk::{
        rpc::{RpcError, Transport, TransportKind},
        wire::api,
    };
    use serde_json::{json, Value};

    use super::*;

    fn blocking(names: &[&str]) -> DemoPlugin {
        DemoPlugin::with_settings(DemoSettings {
            greeting: String::new(),
            blocked_users: names.iter().map(|name| name.to_string()).collect(),
        })
    }

    fn ctx(language: &str) -> Context {
        Context {
            accept_language: language.into(),
            ..Context::default()
        }
    }

    async fn body(response: Response<Body>) -> Bytes {
        response.into_body().collect().await.unwrap().to_bytes()
    }

    #[tokio::test]
    async fn routes_answer_without_activation() {
        let plugin = blocking(&[]);
        let hello = Request::get("/hello").body(full("")).unwrap();
        assert_eq!(body(plugin.serve_http(&ctx("en"), hello).await).await, "Hello from the demo plugin");

        let echo = Request::post("/echo")
            .header(header::CONTENT_TYPE, "text/plain")
            .body(full("round trip"))
            .unwrap();
        let response = plugin.serve_http(&ctx(""), echo).await;
        assert_eq!(response.headers()[header::CONTENT_TYPE], "text/plain");
        assert_eq!(body(response).await, "round trip");

        let wrong = Request::delete("/echo").body(full("")).unwrap();
        assert_eq!(plugin.serve_http(&ctx(""), wrong).await.status(), StatusCode::METHOD_NOT_ALLOWED);
        let missing = Request::get("/nope").body(full("")).unwrap();
        assert_eq!(plugin.serve_http(&ctx(""), missing).await.status(), StatusCode::NOT_FOUND);
    }

    #[tokio::test]
    async fn login_gate_is_case_insensitive() {
        let plugin = blocking(&["Mallory"]);
        let mallory = User {
            username: "mallory".into(),
            ..User::default()
        };
        let alice = User {
            username: "alice".into(),
            ..User::default()
        };
        assert_eq!(
            plugin.user_will_log_in(&ctx("en-US"), &mallory).await.as_deref(),
            Some("Logins for this account are blocked")
        );
        assert_eq!(plugin.user_will_log_in(&ctx("en-US"), &alice).await, None);
    }

    #[tokio::test]
    async fn only_the_demo_command_is_handled() {
        let plugin = blocking(&[]);
        let args = CommandArgs {
            command: "/demo status".into(),
            ..CommandArgs::default()
        };
        assert_eq!(
            plugin.execute_command(&ctx("en"), args).await.unwrap().text,
            "The demo plugin is active"
        );
        let other = CommandArgs {
            command: "/other".into(),
            ..CommandArgs::default()
        };
        assert!(plugin.execute_command(&ctx("en"), other).await.is_err());
    }

    /// Answers the calls activation makes.
    #[derive(Default)]
    struct Host {
        kv: Mutex<HashMap<String, Value>>,
        logs: Mutex<Vec<String>>,
    }

    #[async_trait]
    impl Transport for Host {
        fn kind(&self) -> TransportKind {
            TransportKind::Streaming
        }

        async fn call(&self, method: &str, params: Value) -> Result<Value, RpcError> {
            match method {
                api::LOAD_PLUGIN_CONFIGURATION => Ok(json!({
                    "greeting": "Hi there",
                    "blocked_users": ["eve"],
                })),
                api::GET_BUNDLE_PATH => Ok(json!(PathBuf::from(env!("CARGO_MANIFEST_DIR")))),
                api::KV_GET => Ok(self.kv.lock().unwrap().get(params["key"].as_str().unwrap()).cloned().unwrap_or(Value::Null)),
                api::KV_SET => {
                    let key = params["key"].as_str().unwrap().to_string();
                    self.kv.lock().unwrap().insert(key, params["value"].clone());
                    Ok(Value::Null)
                }
                api::GET_USER_BY_USERNAME => Ok(Value::Null),
                api::CREATE_BOT => {
                    let mut bot = params["bot"].clone();
                    bot["user_id"] = json!("bot-1");
                    Ok(bot)
                }
                api::LOG_INFO => {
                    self.logs.lock().unwrap().push(params["message"].as_str().unwrap().to_string());
                    Ok(Value::Null)
                }
                other => Err(RpcError::MethodNotImplemented(other.into())),
            }
        }
    }

    #[tokio::test]
    async fn activation_loads_settings_translations_and_bot() {
        let host = Arc::new(Host::default());
        let plugin = DemoPlugin::default();
        let api = ApiClient::new(host.clone());
        plugin.set_api(api.clone());
        plugin.on_configuration_change().await.unwrap();
        plugin.on_activate(api).await.unwrap();

        assert_eq!(plugin.bot_id.get().map(String::as_str), Some("bot-1"));
        assert_eq!(host.kv.lock().unwrap()["plexus_bot_id"], json!("bot-1"));
        assert_eq!(plugin.text("en", "demo.greeting"), "Hi there");
        assert_eq!(plugin.text("de-DE", "demo.greeting"), "Hallo vom Demo-Plugin");
        assert_eq!(plugin.text("de", "demo.command_reply"), "Demo-Plugin ist aktiv");

        let eve = User {
            username: "eve".into(),
            ..User::default()
        };
        assert!(plugin.user_will_log_in(&ctx("de"), &eve).await.is_some());
        plugin.user_has_logged_in(&ctx(""), &eve).await;
        let logs = host.logs.lock().unwrap();
        assert!(logs.iter().any(|line| line == "eve logged in (1 so far)"), "{logs:?}");
    }
}
