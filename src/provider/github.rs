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
use crate::payload::{InboundHook, ParsedHook, github as payload};
use crate::signature::{self, Scheme};
use crate::types::{CommitState, Trigger, Watch};

pub const DEFAULT_API_URL: &str = "https://api.github.com";
const ACCEPT: &str = "application/vnd.github+json";

pub struct GitHubClient {
    api: ApiClient,
    api_host: Option<String>,
    callback_base: String,
}

#[derive(Deserialize)]
struct HookConfig {
    #[serde(default)]
    url: Option<String>,
}

#[derive(Deserialize)]
struct Hook {
    id: u64,
    config: HookConfig,
}

#[derive(Deserialize)]
struct GitRef {
    object: GitObject,
}

#[derive(Deserialize)]
struct GitObject {
    sha: String,
}

impl GitHubClient {
    pub fn new(transport: Arc<dyn Transport>, api_url: &str, callback_base: &str) -> Self {
        Self {
            api: ApiClient::new(transport, api_url),
            api_host: host_of(api_url),
            callback_base: callback_base.to_string(),
        }
    }

    fn repo_path(repo: &RepoPath) -> String {
        format!("/repos/{}/{}", repo.owner, repo.name)
    }

    fn events(watch: &Watch) -> Vec<&'static str> {
        let mut events = Vec::new();
        if watch.spec.push {
            events.push("push");
        }
        if watch.spec.pull_request {
            events.push("pull_request");
        }
        if watch.spec.tag {
            events.push("create");
        }
        if events.is_empty() {
            events.push("push");
        }
        events
    }

    fn state(state: CommitState) -> &'static str {
        match state {
            CommitState::Pending => "pending",
            CommitState::Success => "success",
            CommitState::Failure => "failure",
        }
    }
}

#[async_trait]
impl RemoteHooks for GitHubClient {
    async fn list_hooks(&self, repo: &RepoPath, token: &str) -> Result<Vec<RemoteHook>, HookError> {
        let path = format!("{}/hooks?per_page=100", Self::repo_path(repo));
        let request = self.api.request(Method::GET, &path).bearer(token).header("accept", ACCEPT);
        let hooks: Vec<Hook> = self.api.send(request).await?.json()?;
        Ok(hooks
            .into_iter()
            .map(|h| RemoteHook {
                id: h.id.to_string(),
                url: h.config.url.unwrap_or_default(),
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
            "name": "web",
            "active": true,
            "events": Self::events(watch),
            "config": {
                "url": hook_url(&self.callback_base, &watch.key()),
                "content_type": "json",
                "secret": secret,
                "insecure_ssl": "0",
            },
        });
        let path = format!("{}/hooks", Self::repo_path(repo));
        let request = self
            .api
            .request(Method::POST, &path)
            .bearer(token)
            .header("accept", ACCEPT)
            .json(body);
        let hook: Hook = self.api.send(request).await?.json()?;
        Ok(hook.id.to_string())
    }

    async fn remove_hook(&self, repo: &RepoPath, id: &str, token: &str) -> Result<(), HookError> {
        let path = format!("{}/hooks/{id}", Self::repo_path(repo));
        let request = self.api.request(Method::DELETE, &path).bearer(token).header("accept", ACCEPT);
        // Already gone counts as removed.
        self.api.send_optional(request).await.map(|_| ())
    }
}

#[async_trait]
impl HookClient for GitHubClient {
    fn kind(&self) -> ProviderKind {
        ProviderKind::GitHub
    }

    fn owns_host(&self, host: &str) -> bool {
        host == "github.com" || self.api_host.as_deref() == Some(host)
    }

    fn scheme(&self) -> Option<Scheme> {
        Some(Scheme::HmacSha256)
    }

    /// Prefers `X-Hub-Signature-256`; falls back to the legacy SHA-1 header.
    fn verify(&self, watch: &Watch, hook: &InboundHook<'_>) -> Result<(), HookError> {
        let secret = recorded_secret(self.kind(), watch)?.as_bytes();
        let valid = if let Some(signature) = hook.header(payload::SIGNATURE_256_HEADER) {
            signature::verify_hmac_sha256(secret, signature, hook.body)
        } else if let Some(signature) = hook.header(payload::SIGNATURE_HEADER) {
            signature::verify_hmac_sha1(secret, signature, hook.body)
        } else {
            return Err(HookError::Authentication {
                provider: self.kind(),
                message: "webhook missing signature".into(),
            });
        };
        if valid {
            Ok(())
        } else {
            Err(HookError::Authentication {
                provider: self.kind(),
                message: "signature does not match payload".into(),
            })
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
        let (repo, commit, state) = status_target(trigger)?;
        let body = json!({
            "state": Self::state(state),
            "target_url": trigger.status.status_url,
            "description": state.description(),
            "context": STATUS_CONTEXT,
        });
        let path = format!("{}/statuses/{commit}", Self::repo_path(&repo));
        let request = self
            .api
            .request(Method::POST, &path)
            .bearer(token)
            .header("accept", ACCEPT)
            .json(body);
        self.api.send(request).await.map(|_| ())
    }

    async fn branch_head(&self, watch: &Watch, token: &str) -> Result<Option<String>, HookError> {
        let Some(branch) = watch.spec.branch.as_deref() else {
            return Ok(None);
        };
        let repo = RepoPath::parse(&watch.spec.repository_url)?;
        let path = format!(
            "{}/git/ref/heads/{}",
            Self::repo_path(&repo),
            encode_segment(branch)
        );
        let request = self.api.request(Method::GET, &path).bearer(token).header("accept", ACCEPT);
        match self.api.send_optional(request).await? {
            Some(response) => Ok(Some(response.json::<GitRef>()?.object.sha)),
            None => Ok(None),
        }
    }
}
