use std::str::FromStr;

use anyhow::Result;
use http::{uri::PathAndQuery, Request, Uri};

/// Path prefix under which every plugin serves its HTTP routes.
pub const PLUGIN_PREFIX: &str = "/plugins/";

/// A request addressed to one plugin, with the prefix already stripped.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PluginRoute {
    pub plugin_id: String,
    /// Path and query as the plugin sees them.
    pub uri: Uri,
}

impl PluginRoute {
    /// Matches `/plugins/{id}` and `/plugins/{id}/...`.
    pub fn select(uri: &Uri) -> Option<Self> {
        let rest = uri.path().strip_prefix(PLUGIN_PREFIX)?;
        let (plugin_id, tail) = match rest.find('/') {
            Some(at) => (&rest[..at], &rest[at..]),
            None => (rest, "/"),
        };
        if plugin_id.is_empty()
            || !plugin_id
                .chars()
                .all(|c| c.is_ascii_alphanumeric() || matches!(c, '.' | '-' | '_'))
        {
            return None;
        }
        let target = match uri.query() {
            Some(query) => format!("{tail}?{query}"),
            None => tail.to_string(),
        };
        let uri = rewrite(&target).ok()?;
        Some(Self {
            plugin_id: plugin_id.to_string(),
            uri,
        })
    }

    /// Points `request` at the plugin-relative uri.
    pub fn apply<B>(&self, request: &mut Request<B>) {
        *request.uri_mut() = self.uri.clone();
    }
}

fn rewrite(target: &str) -> Result<Uri> {
    let path_and_query = PathAndQuery::from_str(target)?;
    Ok(Uri::from(path_and_query))
}
