use std::{path::PathBuf, sync::Arc};

use serde::{de::DeserializeOwned, Serialize};
use serde_json::{json, Map, Value};

use crate::{
    model::{Bot, LogLevel, User},
    rpc::{RpcError, Transport},
    wire::{api, BotArgs, KeyArgs, KvSetArgs, LogArgs, UserIdArgs, UsernameArgs},
};

/// Plugin-side client for the host API reverse channel.
#[derive(Clone)]
pub struct ApiClient {
    transport: Arc<dyn Transport>,
}

impl ApiClient {
    pub fn new(transport: Arc<dyn Transport>) -> Self {
        Self { transport }
    }

    pub async fn log(
        &self,
        level: LogLevel,
        message: impl Into<String>,
        fields: Map<String, Value>,
    ) -> Result<(), RpcError> {
        let args = LogArgs {
            message: message.into(),
            fields,
        };
        self.transport.invoke::<_, Value>(level.method(), &args).await?;
        Ok(())
    }

    pub async fn log_debug(&self, message: impl Into<String>) -> Result<(), RpcError> {
        self.log(LogLevel::Debug, message, Map::new()).await
    }

    pub async fn log_info(&self, message: impl Into<String>) -> Result<(), RpcError> {
        self.log(LogLevel::Info, message, Map::new()).await
    }

    pub async fn log_warn(&self, message: impl Into<String>) -> Result<(), RpcError> {
        self.log(LogLevel::Warn, message, Map::new()).await
    }

    pub async fn log_error(&self, message: impl Into<String>) -> Result<(), RpcError> {
        self.log(LogLevel::Error, message, Map::new()).await
    }

    pub async fn kv_set<T: Serialize + ?Sized>(&self, key: &str, value: &T) -> Result<(), RpcError> {
        let value = serde_json::to_value(value).map_err(|err| RpcError::Codec(err.to_string()))?;
        let args = KvSetArgs {
            key: key.to_string(),
            value,
        };
        self.transport.invoke::<_, Value>(api::KV_SET, &args).await?;
        Ok(())
    }

    /// `None` when the key was never set or has been deleted.
    pub async fn kv_get<T: DeserializeOwned>(&self, key: &str) -> Result<Option<T>, RpcError> {
        let args = KeyArgs { key: key.to_string() };
        let value: Option<Value> = self.transport.invoke(api::KV_GET, &args).await?;
        value
            .map(serde_json::from_value)
            .transpose()
            .map_err(|err| RpcError::Codec(err.to_string()))
    }

    pub async fn kv_delete(&self, key: &str) -> Result<(), RpcError> {
        let args = KeyArgs { key: key.to_string() };
        self.transport.invoke::<_, Value>(api::KV_DELETE, &args).await?;
        Ok(())
    }

    pub async fn get_bundle_path(&self) -> Result<PathBuf, RpcError> {
        self.transport.invoke(api::GET_BUNDLE_PATH, &json!({})).await
    }

    /// Deserializes the plugin's `settings` block from its manifest.
    pub async fn load_plugin_configuration<T: DeserializeOwned>(&self) -> Result<T, RpcError> {
        self.transport
            .invoke(api::LOAD_PLUGIN_CONFIGURATION, &json!({}))
            .await
    }

    pub async fn get_user(&self, user_id: &str) -> Result<Option<User>, RpcError> {
        let args = UserIdArgs {
            user_id: user_id.to_string(),
        };
        self.transport.invoke(api::GET_USER, &args).await
    }

    pub async fn get_user_by_username(&self, username: &str) -> Result<Option<User>, RpcError> {
        let args = UsernameArgs {
            username: username.to_string(),
        };
        self.transport.invoke(api::GET_USER_BY_USERNAME, &args).await
    }

    pub async fn create_bot(&self, bot: &Bot) -> Result<Bot, RpcError> {
        let args = BotArgs { bot: bot.clone() };
        self.transport.invoke(api::CREATE_BOT, &args).await
    }

    pub async fn get_bot(&self, user_id: &str) -> Result<Option<Bot>, RpcError> {
        let args = UserIdArgs {
            user_id: user_id.to_string(),
        };
        self.transport.invoke(api::GET_BOT, &args).await
    }
}

impl std::fmt::Debug for ApiClient {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ApiClient")
            .field("transport", &self.transport.kind())
            .finish()
    }
}
