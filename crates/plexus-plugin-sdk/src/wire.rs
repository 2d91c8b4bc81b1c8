//! Argument and reply shapes exchanged by the hook and API methods.

use std::{fmt, net::SocketAddr};

use bytes::Bytes;
use http::{header, request::Parts, HeaderName, HeaderValue, Method, Request, Version};
use serde::{de, Deserialize, Deserializer, Serialize, Serializer};
use serde_json::{Map, Value};

use crate::{
    broker::StreamId,
    model::{Bot, CommandArgs, Context, LogLevel, Post, User},
};

/// Protocol method that is always available, independent of the hook set.
pub const IMPLEMENTED: &str = "Implemented";

/// A header value exactly as it arrived, opaque bytes included.
///
/// Serialized as a JSON string with one char per byte (U+0000..=U+00FF), so
/// ASCII values stay readable and every other byte survives unchanged.
#[derive(Debug, Clone, Default, PartialEq, Eq, Hash)]
pub struct HeaderBytes(pub Bytes);

impl HeaderBytes {
    pub fn as_bytes(&self) -> &[u8] {
        &self.0
    }
}

impl From<&HeaderValue> for HeaderBytes {
    fn from(value: &HeaderValue) -> Self {
        Self(Bytes::copy_from_slice(value.as_bytes()))
    }
}

impl From<&str> for HeaderBytes {
    fn from(value: &str) -> Self {
        Self(Bytes::copy_from_slice(value.as_bytes()))
    }
}

impl TryFrom<&HeaderBytes> for HeaderValue {
    type Error = http::header::InvalidHeaderValue;

    fn try_from(value: &HeaderBytes) -> Result<Self, Self::Error> {
        HeaderValue::from_bytes(value.as_bytes())
    }
}

impl Serialize for HeaderBytes {
    fn serialize<S: Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        let text: String = self.0.iter().map(|&byte| char::from(byte)).collect();
        serializer.serialize_str(&text)
    }
}

impl<'de> Deserialize<'de> for HeaderBytes {
    fn deserialize<D: Deserializer<'de>>(deserializer: D) -> Result<Self, D::Error> {
        struct Visitor;

        impl de::Visitor<'_> for Visitor {
            type Value = HeaderBytes;

            fn expecting(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
                f.write_str("a header value string with chars up to U+00FF")
            }

            fn visit_str<E: de::Error>(self, text: &str) -> Result<HeaderBytes, E> {
                text.chars()
                    .map(|c| u8::try_from(u32::from(c)).map_err(|_| E::custom(format!("char {c:?} is not a byte"))))
                    .collect::<Result<Vec<u8>, E>>()
                    .map(|raw| HeaderBytes(Bytes::from(raw)))
            }
        }

        deserializer.deserialize_str(Visitor)
    }
}

/// The serializable subset of an HTTP request; the body travels on its own
/// stream.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct ForwardedRequest {
    pub method: String,
    pub url: String,
    pub proto: String,
    pub proto_major: u8,
    pub proto_minor: u8,
    /// In arrival order; a name may repeat.
    pub headers: Vec<(String, HeaderBytes)>,
    pub host: String,
    pub remote_addr: String,
    pub request_uri: String,
}

impl ForwardedRequest {
    pub fn from_parts(parts: &Parts, remote_addr: Option<SocketAddr>) -> Self {
        let (proto, proto_major, proto_minor) = match parts.version {
            Version::HTTP_09 => ("HTTP/0.9", 0, 9),
            Version::HTTP_10 => ("HTTP/1.0", 1, 0),
            Version::HTTP_2 => ("HTTP/2.0", 2, 0),
            Version::HTTP_3 => ("HTTP/3.0", 3, 0),
            _ => ("HTTP/1.1", 1, 1),
        };
        let headers = parts
            .headers
            .iter()
            .map(|(name, value)| (name.as_str().to_string(), HeaderBytes::from(value)))
            .collect();
        let host = parts
            .uri
            .host()
            .map(str::to_string)
            .or_else(|| {
                parts
                    .headers
                    .get(header::HOST)
                    .and_then(|value| value.to_str().ok())
                    .map(str::to_string)
            })
            .unwrap_or_default();
        let request_uri = parts
            .uri
            .path_and_query()
            .map(|pq| pq.as_str().to_string())
            .unwrap_or_else(|| "/".to_string());
        Self {
            method: parts.method.as_str().to_string(),
            url: parts.uri.to_string(),
            proto: proto.to_string(),
            proto_major,
            proto_minor,
            headers,
            host,
            remote_addr: remote_addr.map(|addr| addr.to_string()).unwrap_or_default(),
            request_uri,
        }
    }

    /// Rebuilds an `http::Request` carrying `body`.
    pub fn to_request<B>(&self, body: B) -> Result<Request<B>, http::Error> {
        let version = match (self.proto_major, self.proto_minor) {
            (0, 9) => Version::HTTP_09,
            (1, 0) => Version::HTTP_10,
            (2, _) => Version::HTTP_2,
            (3, _) => Version::HTTP_3,
            _ => Version::HTTP_11,
        };
        let mut builder = Request::builder()
            .method(Method::from_bytes(self.method.as_bytes())?)
            .uri(&self.url)
            .version(version);
        for (name, value) in &self.headers {
            builder = builder.header(
                HeaderName::from_bytes(name.as_bytes())?,
                HeaderValue::from_bytes(value.as_bytes())?,
            );
        }
        builder.body(body)
    }
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct ServeHttpArgs {
    pub context: Context,
    pub request: ForwardedRequest,
    pub response_stream: StreamId,
    /// `0` when the request has no body.
    pub body_stream: StreamId,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct ActivateArgs {
    pub api_stream: StreamId,
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct UserArgs {
    pub context: Context,
    pub user: User,
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct PostArgs {
    pub context: Context,
    pub post: Post,
}

/// Reply to `MessageWillBePosted`: a replacement post and/or a rejection.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct PostVerdict {
    pub post: Option<Post>,
    pub rejection: String,
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct CommandArgsParams {
    pub context: Context,
    pub args: CommandArgs,
}

/// Names of the host API methods reachable on the reverse channel.
pub mod api {
    pub const LOG_DEBUG: &str = "LogDebug";
    pub const LOG_INFO: &str = "LogInfo";
    pub const LOG_WARN: &str = "LogWarn";
    pub const LOG_ERROR: &str = "LogError";
    pub const KV_SET: &str = "KVSet";
    pub const KV_GET: &str = "KVGet";
    pub const KV_DELETE: &str = "KVDelete";
    pub const GET_BUNDLE_PATH: &str = "GetBundlePath";
    pub const LOAD_PLUGIN_CONFIGURATION: &str = "LoadPluginConfiguration";
    pub const GET_USER: &str = "GetUser";
    pub const GET_USER_BY_USERNAME: &str = "GetUserByUsername";
    pub const CREATE_BOT: &str = "CreateBot";
    pub const GET_BOT: &str = "GetBot";
}

impl LogLevel {
    pub const fn method(self) -> &'static str {
        match self {
            LogLevel::Debug => api::LOG_DEBUG,
            LogLevel::Info => api::LOG_INFO,
            LogLevel::Warn => api::LOG_WARN,
            LogLevel::Error => api::LOG_ERROR,
        }
    }

    pub fn from_method(method: &str) -> Option<Self> {
        match method {
            api::LOG_DEBUG => Some(LogLevel::Debug),
            api::LOG_INFO => Some(LogLevel::Info),
            api::LOG_WARN => Some(LogLevel::Warn),
            api::LOG_ERROR => Some(LogLevel::Error),
            _ => None,
        }
    }
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct LogArgs {
    pub message: String,
    pub fields: Map<String, Value>,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct KvSetArgs {
    pub key: String,
    pub value: Value,
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct KeyArgs {
    pub key: String,
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct UserIdArgs {
    pub user_id: String,
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct UsernameArgs {
    pub username: String,
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct BotArgs {
    pub bot: Bot,
}
