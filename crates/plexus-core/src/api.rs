//! Host side of the reverse channel: what a plugin may ask of the server.

use std::{
    collections::HashMap,
    path::PathBuf,
    sync::{
        atomic::{AtomicU64, Ordering},
        Arc, Mutex,
    },
};

use anyhow::{bail, Result};
use async_trait::async_trait;
use plexus_plugin_sdk::{
    model::{Bot, LogLevel, User},
    rpc::{Handler, RpcError},
    wire::{api, BotArgs, KeyArgs, KvSetArgs, LogArgs, UserIdArgs, UsernameArgs},
};
use serde::{de::DeserializeOwned, Serialize};
use serde_json::{Map, Value};

/// Data store and logging sink shared by every plugin.
#[async_trait]
pub trait HostApi: Send + Sync + 'static {
    async fn log(&self, plugin_id: &str, level: LogLevel, message: &str, fields: &Map<String, Value>) {
        let fields = Value::Object(fields.clone());
        match level {
            LogLevel::Debug => tracing::debug!(plugin_id, %fields, "{message}"),
            LogLevel::Info => tracing::info!(plugin_id, %fields, "{message}"),
            LogLevel::Warn => tracing::warn!(plugin_id, %fields, "{message}"),
            LogLevel::Error => tracing::error!(plugin_id, %fields, "{message}"),
        }
    }

    async fn kv_set(&self, plugin_id: &str, key: &str, value: Value) -> Result<()>;
    async fn kv_get(&self, plugin_id: &str, key: &str) -> Result<Option<Value>>;
    async fn kv_delete(&self, plugin_id: &str, key: &str) -> Result<()>;
    async fn get_user(&self, user_id: &str) -> Result<Option<User>>;
    async fn get_user_by_username(&self, username: &str) -> Result<Option<User>>;
    async fn create_bot(&self, bot: Bot) -> Result<Bot>;
    async fn get_bot(&self, user_id: &str) -> Result<Option<Bot>>;
}

/// In-process [`HostApi`] used by the CLI and by tests.
#[derive(Debug, Default)]
pub struct MemoryHostApi {
    kv: Mutex<HashMap<(String, String), Value>>,
    users: Mutex<HashMap<String, User>>,
    bots: Mutex<HashMap<String, Bot>>,
    next_id: AtomicU64,
}

impl MemoryHostApi {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn add_user(&self, user: User) {
        lock(&self.users).insert(user.id.clone(), user);
    }

    fn allocate_id(&self, prefix: &str) -> String {
        format!("{prefix}{}", self.next_id.fetch_add(1, Ordering::Relaxed) + 1)
    }
}

fn lock<T>(mutex: &Mutex<T>) -> std::sync::MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
}

#[async_trait]
impl HostApi for MemoryHostApi {
    async fn kv_set(&self, plugin_id: &str, key: &str, value: Value) -> Result<()> {
        if key.is_empty() {
            bail!("kv key must not be empty");
        }
        lock(&self.kv).insert((plugin_id.to_string(), key.to_string()), value);
        Ok(())
    }

    async fn kv_get(&self, plugin_id: &str, key: &str) -> Result<Option<Value>> {
        Ok(lock(&self.kv)
            .get(&(plugin_id.to_string(), key.to_string()))
            .cloned())
    }

    async fn kv_delete(&self, plugin_id: &str, key: &str) -> Result<()> {
        lock(&self.kv).remove(&(plugin_id.to_string(), key.to_string()));
        Ok(())
    }

    async fn get_user(&self, user_id: &str) -> Result<Option<User>> {
        Ok(lock(&self.users).get(user_id).cloned())
    }

    async fn get_user_by_username(&self, username: &str) -> Result<Option<User>> {
        Ok(lock(&self.users)
            .values()
            .find(|user| user.username == username)
            .cloned())
    }

    async fn create_bot(&self, mut bot: Bot) -> Result<Bot> {
        if bot.username.is_empty() {
            bail!("bot username must not be empty");
        }
        let mut users = lock(&self.users);
        if users.values().any(|user| user.username == bot.username) {
            bail!("username `{}` is already taken", bot.username);
        }
        bot.user_id = self.allocate_id("bot-");
        users.insert(
            bot.user_id.clone(),
            User {
                id: bot.user_id.clone(),
                username: bot.username.clone(),
                email: String::new(),
                is_bot: true,
            },
        );
        lock(&self.bots).insert(bot.user_id.clone(), bot.clone());
        Ok(bot)
    }

    async fn get_bot(&self, user_id: &str) -> Result<Option<Bot>> {
        Ok(lock(&self.bots).get(user_id).cloned())
    }
}

/// What the host knows about one loaded plugin.
#[derive(Debug, Clone, Default)]
pub struct PluginScope {
    pub plugin_id: String,
    pub bundle_path: PathBuf,
    pub settings: Map<String, Value>,
}

/// Serves one plugin's API channel; every call is scoped to that plugin.
pub struct ApiServer {
    scope: PluginScope,
    host: Arc<dyn HostApi>,
}

impl ApiServer {
    pub fn new(scope: PluginScope, host: Arc<dyn HostApi>) -> Self {
        Self { scope, host }
    }
}

fn decode<T: DeserializeOwned>(params: Value) -> Result<T, RpcError> {
    serde_json::from_value(params).map_err(RpcError::invalid_params)
}

fn reply<T: Serialize>(value: T) -> Result<Value, RpcError> {
    serde_json::to_value(value).map_err(|err| RpcError::Codec(err.to_string()))
}

fn failed(err: anyhow::Error) -> RpcError {
    RpcError::remote(format!("{err:#}"))
}

#[async_trait]
impl Handler for ApiServer {
    async fn handle(&self, method: &str, params: Value) -> Result<Value, RpcError> {
        let plugin_id = self.scope.plugin_id.as_str();
        if let Some(level) = LogLevel::from_method(method) {
            let LogArgs { message, fields } = decode(params)?;
            self.host.log(plugin_id, level, &message, &fields).await;
            return Ok(Value::Null);
        }
        match method {
            api::KV_SET => {
                let KvSetArgs { key, value } = decode(params)?;
                self.host.kv_set(plugin_id, &key, value).await.map_err(failed)?;
                Ok(Value::Null)
            }
            api::KV_GET => {
                let KeyArgs { key } = decode(params)?;
                reply(self.host.kv_get(plugin_id, &key).await.map_err(failed)?)
            }
            api::KV_DELETE => {
                let KeyArgs { key } = decode(params)?;
                self.host.kv_delete(plugin_id, &key).await.map_err(failed)?;
                Ok(Value::Null)
            }
            api::GET_BUNDLE_PATH => reply(&self.scope.bundle_path),
            api::LOAD_PLUGIN_CONFIGURATION => Ok(Value::Object(self.scope.settings.clone())),
            api::GET_USER => {
                let UserIdArgs { user_id } = decode(params)?;
                reply(self.host.get_user(&user_id).await.map_err(failed)?)
            }
            api::GET_USER_BY_USERNAME => {
                let UsernameArgs { username } = decode(params)?;
                reply(self.host.get_user_by_username(&username).await.map_err(failed)?)
            }
            api::CREATE_BOT => {
                let BotArgs { mut bot } = decode(params)?;
                if bot.owner_id.is_empty() {
                    bot.owner_id = plugin_id.to_string();
                }
                reply(self.host.create_bot(bot).await.map_err(failed)?)
            }
            api::GET_BOT => {
                let UserIdArgs { user_id } = decode(params)?;
                reply(self.host.get_bot(&user_id).await.map_err(failed)?)
            }
            other => Err(RpcError::MethodNotImplemented(other.to_string())),
        }
    }
}
