use async_trait::async_trait;
use http::{Request, Response, StatusCode};

use crate::{
    api::ApiClient,
    hooks::HookId,
    http::{full, Body},
    model::{CommandArgs, CommandResponse, Context, Post, User},
    wire::PostVerdict,
};

/// Behaviour a plugin binary provides to the host.
///
/// Only the hooks listed by [`Plugin::implemented`] are ever invoked; the host
/// short-circuits everything else without a round trip. Every hook has a
/// default so a plugin overrides just what it lists.
#[async_trait]
pub trait Plugin: Send + Sync + 'static {
    fn implemented(&self) -> Vec<HookId>;

    /// Hands over the host API on every activation, before any hook runs and
    /// whether or not the plugin lists `OnActivate`. Store it to reach the
    /// host from later hooks.
    fn set_api(&self, _api: ApiClient) {}

    /// Runs after [`Plugin::set_api`] and, when listed, after
    /// `OnConfigurationChange`.
    async fn on_activate(&self, _api: ApiClient) -> anyhow::Result<()> {
        Ok(())
    }

    async fn on_deactivate(&self) -> anyhow::Result<()> {
        Ok(())
    }

    async fn on_configuration_change(&self) -> anyhow::Result<()> {
        Ok(())
    }

    async fn serve_http(&self, _ctx: &Context, _request: Request<Body>) -> Response<Body> {
        let mut response = Response::new(full("not found"));
        *response.status_mut() = StatusCode::NOT_FOUND;
        response
    }

    async fn execute_command(
        &self,
        _ctx: &Context,
        _args: CommandArgs,
    ) -> anyhow::Result<CommandResponse> {
        Ok(CommandResponse::default())
    }

    /// Return a replacement post, a non-empty rejection, or neither.
    async fn message_will_be_posted(&self, _ctx: &Context, _post: Post) -> PostVerdict {
        PostVerdict::default()
    }

    async fn message_has_been_posted(&self, _ctx: &Context, _post: Post) {}

    /// `Some(reason)` rejects the login.
    async fn user_will_log_in(&self, _ctx: &Context, _user: &User) -> Option<String> {
        None
    }

    async fn user_has_logged_in(&self, _ctx: &Context, _user: &User) {}
}
