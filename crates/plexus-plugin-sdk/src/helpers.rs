//! Conveniences built on top of [`ApiClient`].

use std::{
    collections::{BTreeMap, HashMap},
    path::Path,
};

use anyhow::{bail, Context, Result};
use serde::Deserialize;

use crate::{api::ApiClient, model::Bot};

/// KV key under which [`ensure_bot`] remembers the bot's user id.
pub const BOT_USER_KEY: &str = "plexus_bot_id";

/// Returns the user id of the plugin's bot, creating the bot on first use.
///
/// An existing account with the same username is adopted when it is a bot
/// and refused otherwise.
pub async fn ensure_bot(api: &ApiClient, bot: &Bot) -> Result<String> {
    if let Some(id) = api.kv_get::<String>(BOT_USER_KEY).await? {
        if !id.is_empty() {
            return Ok(id);
        }
    }

    let user_id = match api.get_user_by_username(&bot.username).await? {
        Some(user) if user.is_bot => user.id,
        Some(user) => bail!("user `{}` already exists and is not a bot", user.username),
        None => {
            let created = api
                .create_bot(bot)
                .await
                .with_context(|| format!("failed to create bot `{}`", bot.username))?;
            tracing::info!(user_id = %created.user_id, username = %bot.username, "created bot");
            created.user_id
        }
    };
    api.kv_set(BOT_USER_KEY, &user_id).await?;
    Ok(user_id)
}

const SOURCE_LANGUAGE: &str = "en";

/// Translations keyed by language tag, then message id.
#[derive(Debug, Clone)]
pub struct I18nBundle {
    default_language: String,
    messages: BTreeMap<String, HashMap<String, String>>,
}

impl Default for I18nBundle {
    fn default() -> Self {
        Self::new(SOURCE_LANGUAGE)
    }
}

#[derive(Deserialize)]
#[serde(untagged)]
enum MessageText {
    Plain(String),
    Plural { other: String },
}

impl I18nBundle {
    pub fn new(default_language: impl Into<String>) -> Self {
        Self {
            default_language: default_language.into(),
            messages: BTreeMap::new(),
        }
    }

    pub fn add_messages(&mut self, language: impl Into<String>, messages: HashMap<String, String>) {
        self.messages.entry(language.into()).or_default().extend(messages);
    }

    pub fn languages(&self) -> Vec<&str> {
        self.messages.keys().map(String::as_str).collect()
    }

    /// Looks `id` up for `language`, then its primary subtag, then the
    /// default language.
    pub fn localize(&self, language: &str, id: &str) -> Option<&str> {
        let primary = language.split(['-', '_']).next().unwrap_or(language);
        [language, primary, self.default_language.as_str()]
            .into_iter()
            .find_map(|lang| self.messages.get(lang).and_then(|m| m.get(id)))
            .map(String::as_str)
    }

    /// Parses the contents of an `active.<lang>.json` message file into the
    /// bundle; the language comes from `file_name`.
    pub fn add_message_file(&mut self, file_name: &str, raw: &str) -> Result<()> {
        let language = file_name
            .strip_prefix("active.")
            .and_then(|rest| rest.strip_suffix(".json"))
            .with_context(|| format!("message file {file_name} is not named active.<lang>.json"))?;
        let parsed: HashMap<String, MessageText> = serde_json::from_str(raw)
            .with_context(|| format!("failed to load message file {file_name}"))?;
        let messages = parsed
            .into_iter()
            .map(|(id, text)| match text {
                MessageText::Plain(text) | MessageText::Plural { other: text } => (id, text),
            })
            .collect();
        self.add_messages(language, messages);
        Ok(())
    }
}

/// Loads every translation under `<bundle>/assets/i18n` except the source
/// language file.
pub async fn load_i18n_dir(bundle_path: &Path) -> Result<I18nBundle> {
    let dir = bundle_path.join("assets").join("i18n");
    let mut entries = tokio::fs::read_dir(&dir)
        .await
        .with_context(|| format!("failed to open i18n directory {}", dir.display()))?;
    let mut bundle = I18nBundle::default();
    while let Some(entry) = entries.next_entry().await? {
        let name = entry.file_name();
        let Some(name) = name.to_str() else { continue };
        if !name.starts_with("active.") || name == "active.en.json" {
            continue;
        }
        let path = entry.path();
        let raw = tokio::fs::read_to_string(&path)
            .await
            .with_context(|| format!("failed to read message file {}", path.display()))?;
        bundle.add_message_file(name, &raw)?;
    }
    Ok(bundle)
}

/// [`load_i18n_dir`] on the bundle path reported by the host.
pub async fn load_i18n_bundle(api: &ApiClient) -> Result<I18nBundle> {
    let bundle_path = api
        .get_bundle_path()
        .await
        .context("failed to get bundle path")?;
    load_i18n_dir(&bundle_path).await
}
