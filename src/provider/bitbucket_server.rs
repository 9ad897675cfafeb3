use async_trait::async_trait;
use reqwest::Method;
use serde::Deserialize;
use serde_json::json;
use std::sync::Arc;

use super::http::{ApiClient, Transport};
use super::{
    HookClient, HookRegistration, ProviderKind, RemoteHook, RemoteHooks, RepoPath, STATUS_CONTEXT,
    encode_segment, hook_url, host_of, recorded_secret, register, status_target, unregister,
};
use crate::error::HookError;
use crate::payload::{InboundHook, ParsedHook, bitbucket_server as payload};
use crate::signature::{self, Scheme};
use crate::types::{CommitState, Trigger, Watch};

/// Self-hosted Bitbucket. Signs deliveries with HMAC-SHA256 and expects 422
/// when a delivery is refused.
pub struct BitbucketServerClient {
    api: ApiClient,
    host: Option<String>,
    callback_base: String,
}

#[derive(Deserialize)]
struct Page<T> {
    #[serde(default = "Vec::new")]
    values: Vec<T>,
}

#[derive(Deserialize)]
struct Hook {
    id: u64,
    #[serde(default)]
    url: String,
}

#[derive(Deserialize)]
#[serde(rename_all = "camelCase")]
struct Branch {
    display_id: String,
    latest_commit: String,
}

impl BitbucketServerClient {
    pub fn new(transport: Arc<dyn Transport>, server_url: &str, callback_base: &str) -> Self {
        Self {
            api: ApiClient::new(transport, server_url),
            host: host_of(server_url),
            callback_base: callback_base.to_string(),
        }
    }

    /// Clone URLs look like `https://host/scm/PROJECT/repo.git`.
    fn repo_path(repo: &RepoPath) -> String {
        let project = repo.owner.strip_prefix("scm/").unwrap_or(&repo.owner);
        format!("/rest/api/1.0/projects/{project}/repos/{}", repo.name)
    }

    fn events(watch: &Watch) -> Vec<&'static str> {
        let mut events = Vec::new();
        if watch.spec.push || watch.spec.tag || !watch.spec.pull_request {
            events.push("repo:refs_changed");
        }
        if watch.spec.pull_request {
            events.extend([
                "pr:opened",
                "pr:modified",
                "pr:from_ref_updated",
                "pr:reopened",
                "pr:merged",
                "pr:declined",
            ]);
        }
        events
    }

    fn state(state: CommitState) -> &'static str {
        match state {
            CommitState::Pending => "INPROGRESS",
            CommitState::Success => "SUCCESSFUL",
            CommitState::Failure => "FAILED",
        }
    }

    fn refused(&self, message: &str) -> HookError {
        HookError::Authentication {
            provider: self.kind(),
            message: message.to_string(),
        }
    }
}

#[async_trait]
impl RemoteHooks for BitbucketServerClient {
    async fn list_hooks(&self, repo: &RepoPath, token: &str) -> Result<Vec<RemoteHook>, HookError> {
        let path = format!("{}/webhooks?limit=100", Self::repo_path(repo));
        let page: Page<Hook> = self.api.get_json(&path, token).await?;
        Ok(page
            .values
            .into_iter()
            .map(|h| RemoteHook {
                id: h.id.to_string(),
                url: h.url,
            })
            .collect())
    }

    async fn add_hook(
        &self,
        watch: &Watch,
        repo: &RepoPath,
        secret: &str,
        token: &str,
    ) -> Result<String, HookError> {
        let body = json!({
            "name": format!("gitwatcher-{}", watch.metadata.name),
            "url": hook_url(&self.callback_base, &watch.key()),
            "active": true,
            "events": Self::events(watch),
            "configuration": { "secret": secret },
        });
        let path = format!("{}/webhooks", Self::repo_path(repo));
        let request = self.api.request(Method::POST, &path).bearer(token).json(body);
        let hook: Hook = self.api.send(request).await?.json()?;
        Ok(hook.id.to_string())
    }

    async fn remove_hook(&self, repo: &RepoPath, id: &str, token: &str) -> Result<(), HookError> {
        let path = format!("{}/webhooks/{id}", Self::repo_path(repo));
        let request = self.api.request(Method::DELETE, &path).bearer(token);
        self.api.send_optional(request).await.map(|_| ())
    }
}

#[async_trait]
impl HookClient for BitbucketServerClient {
    fn kind(&self) -> ProviderKind {
        ProviderKind::BitbucketServer
    }

    fn owns_host(&self, host: &str) -> bool {
        self.host.as_deref() == Some(host)
    }

    fn scheme(&self) -> Option<Scheme> {
        Some(Scheme::HmacSha256)
    }

    fn verify(&self, watch: &Watch, hook: &InboundHook<'_>) -> Result<(), HookError> {
        let secret = recorded_secret(self.kind(), watch)?;
        let signature = hook
            .header(payload::SIGNATURE_HEADER)
            .filter(|s| !s.is_empty())
            .ok_or_else(|| self.refused("webhook missing signature"))?;
        if signature::verify_hmac_sha256(secret.as_bytes(), signature, hook.body) {
            Ok(())
        } else {
            Err(self.refused("invalid signature"))
        }
    }

    fn parse(&self, hook: &InboundHook<'_>) -> Result<ParsedHook, HookError> {
        payload::parse(hook.required_header(payload::EVENT_HEADER)?, hook.body)
    }

    async fn create_hook(&self, watch: &Watch, token: &str) -> Result<HookRegistration, HookError> {
        let repo = RepoPath::parse(&watch.spec.repository_url)?;
        register(self, watch, &repo, token).await
    }

    async fn delete_hook(&self, watch: &Watch, token: &str) -> Result<(), HookError> {
        let repo = RepoPath::parse(&watch.spec.repository_url)?;
        unregister(self, watch, &repo, token).await
    }

    async fn update_status(&self, trigger: &Trigger, token: &str) -> Result<(), HookError> {
        let (_, commit, state) = status_target(trigger)?;
        let body = json!({
            "state": Self::state(state),
            "key": STATUS_CONTEXT,
            "url": trigger.status.status_url,
            "description": state.description(),
        });
        let path = format!("/rest/build-status/1.0/commits/{commit}");
        let request = self.api.request(Method::POST, &path).bearer(token).json(body);
        self.api.send(request).await.map(|_| ())
    }

    async fn branch_head(&self, watch: &Watch, token: &str) -> Result<Option<String>, HookError> {
        let Some(branch) = watch.spec.branch.as_deref() else {
            return Ok(None);
        };
        let repo = RepoPath::parse(&watch.spec.repository_url)?;
        let path = format!(
            "{}/branches?filterText={}&limit=100",
            Self::repo_path(&repo),
            encode_segment(branch)
        );
        let page: Page<Branch> = self.api.get_json(&path, token).await?;
        Ok(page
            .values
            .into_iter()
            .find(|b| b.display_id == branch)
            .map(|b| b.latest_commit))
    }
}
