//! Per-host capability table.
//!
//! A [`ProviderKind`] names a host; a [`HookClient`] implements everything the
//! core needs from it (signature verification, payload decoding, remote hook
//! management, commit statuses and branch lookup). [`ProviderRegistry`] maps
//! kinds to clients and is built once at startup.

pub mod bitbucket_cloud;
pub mod bitbucket_server;
pub mod github;
pub mod gitlab;
pub mod http;
pub mod polling;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::fmt;
use std::sync::Arc;
use tracing::{debug, info};

use crate::config::Settings;
use crate::credential::OAuthApp;
use crate::error::HookError;
use crate::payload::{InboundHook, ParsedHook};
use crate::signature::Scheme;
use crate::types::{CommitState, ObjectKey, Trigger, Watch};
use http::Transport;

/// Context reported with every commit status.
pub const STATUS_CONTEXT: &str = "continuous-integration/gitwatcher";
pub const HOOK_ID_PARAM: &str = "gitwebhookId";
const HOOKS_PATH: &str = "hooks";

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub enum ProviderKind {
    #[serde(rename = "github")]
    GitHub,
    #[serde(rename = "gitlab")]
    GitLab,
    #[serde(rename = "bitbucket-cloud")]
    BitbucketCloud,
    #[serde(rename = "bitbucket-server")]
    BitbucketServer,
    #[serde(rename = "polling")]
    Polling,
}

impl ProviderKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            ProviderKind::GitHub => "github",
            ProviderKind::GitLab => "gitlab",
            ProviderKind::BitbucketCloud => "bitbucket-cloud",
            ProviderKind::BitbucketServer => "bitbucket-server",
            ProviderKind::Polling => "polling",
        }
    }
}

impl fmt::Display for ProviderKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Result of a successful remote hook registration.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct HookRegistration {
    pub id: String,
    pub token: String,
}

#[async_trait]
pub trait HookClient: Send + Sync {
    fn kind(&self) -> ProviderKind;

    /// Whether repositories served from `host` belong to this client.
    fn owns_host(&self, host: &str) -> bool;

    fn scheme(&self) -> Option<Scheme>;

    fn supports_hooks(&self) -> bool {
        true
    }

    /// OAuth application used to refresh credentials, when configured.
    fn oauth_app(&self) -> Option<&OAuthApp> {
        None
    }

    fn verify(&self, watch: &Watch, hook: &InboundHook<'_>) -> Result<(), HookError>;

    fn parse(&self, hook: &InboundHook<'_>) -> Result<ParsedHook, HookError>;

    async fn create_hook(&self, watch: &Watch, token: &str) -> Result<HookRegistration, HookError>;

    async fn delete_hook(&self, watch: &Watch, token: &str) -> Result<(), HookError>;

    async fn update_status(&self, trigger: &Trigger, token: &str) -> Result<(), HookError>;

    async fn branch_head(&self, watch: &Watch, token: &str) -> Result<Option<String>, HookError>;
}

/// A hook as listed by the host.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RemoteHook {
    pub id: String,
    pub url: String,
}

/// The list/add/remove primitives each host exposes for webhooks.
#[async_trait]
pub trait RemoteHooks: Send + Sync {
    async fn list_hooks(&self, repo: &RepoPath, token: &str) -> Result<Vec<RemoteHook>, HookError>;

    /// Creates a hook delivering to this watch's callback URL; returns its id.
    async fn add_hook(
        &self,
        watch: &Watch,
        repo: &RepoPath,
        secret: &str,
        token: &str,
    ) -> Result<String, HookError>;

    async fn remove_hook(&self, repo: &RepoPath, id: &str, token: &str) -> Result<(), HookError>;
}

/// Idempotent registration: reuse the recorded hook, drop strays, add if needed.
pub async fn register<H: RemoteHooks + ?Sized>(
    hooks: &H,
    watch: &Watch,
    repo: &RepoPath,
    token: &str,
) -> Result<HookRegistration, HookError> {
    let suffix = hook_url_suffix(&watch.key());
    let matching: Vec<RemoteHook> = hooks
        .list_hooks(repo, token)
        .await?
        .into_iter()
        .filter(|h| h.url.ends_with(&suffix))
        .collect();

    let mut reused = None;
    for hook in matching {
        let recorded = watch.status.hook_id.as_deref() == Some(hook.id.as_str());
        if reused.is_none() && recorded {
            if let Some(secret) = &watch.status.token {
                reused = Some(HookRegistration {
                    id: hook.id,
                    token: secret.clone(),
                });
                continue;
            }
        }
        debug!(watch = %watch.key(), hook_id = %hook.id, "removing stale hook");
        hooks.remove_hook(repo, &hook.id, token).await?;
    }
    if let Some(registration) = reused {
        return Ok(registration);
    }

    let secret = new_secret();
    let id = hooks.add_hook(watch, repo, &secret, token).await?;
    info!(watch = %watch.key(), hook_id = %id, "registered remote hook");
    Ok(HookRegistration { id, token: secret })
}

/// Deletes every hook pointing at this watch; absent hooks are not an error.
pub async fn unregister<H: RemoteHooks + ?Sized>(
    hooks: &H,
    watch: &Watch,
    repo: &RepoPath,
    token: &str,
) -> Result<(), HookError> {
    let suffix = hook_url_suffix(&watch.key());
    for hook in hooks.list_hooks(repo, token).await? {
        if hook.url.ends_with(&suffix) {
            hooks.remove_hook(repo, &hook.id, token).await?;
        }
    }
    Ok(())
}

/// Repository, commit and state a trigger's status update applies to.
pub fn status_target(trigger: &Trigger) -> Result<(RepoPath, &str, CommitState), HookError> {
    let repo = RepoPath::parse(&trigger.spec.repository_url)?;
    let commit = trigger
        .spec
        .event
        .commit
        .as_deref()
        .filter(|c| !c.is_empty())
        .ok_or_else(|| HookError::Config(format!("trigger {} has no commit", trigger.metadata.key())))?;
    Ok((repo, commit, CommitState::from_handled(trigger.status.handled)))
}

/// Fails verification unless the watch has a recorded secret.
pub fn recorded_secret(kind: ProviderKind, watch: &Watch) -> Result<&str, HookError> {
    watch
        .status
        .token
        .as_deref()
        .filter(|t| !t.is_empty())
        .ok_or_else(|| HookError::Authentication {
            provider: kind,
            message: "no verification token recorded".into(),
        })
}

pub fn new_secret() -> String {
    uuid::Uuid::new_v4().to_string()
}

pub fn hook_url(base: &str, key: &ObjectKey) -> String {
    format!("{}/{HOOKS_PATH}?{}", base.trim_end_matches('/'), hook_url_suffix(key))
}

/// Bitbucket Cloud cannot sign payloads; the secret travels in the URL.
pub fn hook_url_with_secret(base: &str, key: &ObjectKey, secret: &str) -> String {
    format!(
        "{}/{HOOKS_PATH}?secret={secret}&{}",
        base.trim_end_matches('/'),
        hook_url_suffix(key)
    )
}

pub fn hook_url_suffix(key: &ObjectKey) -> String {
    format!("{HOOK_ID_PARAM}={key}")
}

/// `owner/name` coordinates of a repository; `owner` may contain slashes.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RepoPath {
    pub host: String,
    pub owner: String,
    pub name: String,
}

impl RepoPath {
    /// Accepts `https://host/owner/name(.git)` and `git@host:owner/name.git`.
    pub fn parse(repository_url: &str) -> Result<Self, HookError> {
        let invalid = || HookError::Config(format!("cannot derive repository from '{repository_url}'"));
        let normalized = match repository_url.split_once("://") {
            Some(_) => repository_url.to_string(),
            None => {
                let (user_host, path) = repository_url.split_once(':').ok_or_else(invalid)?;
                format!("ssh://{user_host}/{path}")
            }
        };
        let url = url::Url::parse(&normalized).map_err(|_| invalid())?;
        let host = url.host_str().ok_or_else(invalid)?.to_ascii_lowercase();
        let path = url.path().trim_matches('/');
        let path = path.strip_suffix(".git").unwrap_or(path);
        let (owner, name) = path.rsplit_once('/').ok_or_else(invalid)?;
        if owner.is_empty() || name.is_empty() {
            return Err(invalid());
        }
        Ok(Self {
            host,
            owner: owner.to_string(),
            name: name.to_string(),
        })
    }

    pub fn full_name(&self) -> String {
        format!("{}/{}", self.owner, self.name)
    }
}

/// Host name of an API base URL, used to match self-hosted instances.
pub fn host_of(base_url: &str) -> Option<String> {
    url::Url::parse(base_url)
        .ok()
        .and_then(|u| u.host_str().map(str::to_ascii_lowercase))
}

/// Percent-encodes a single path segment (`/` included).
pub fn encode_segment(raw: &str) -> String {
    url::form_urlencoded::byte_serialize(raw.as_bytes()).collect()
}

#[derive(Clone, Default)]
pub struct ProviderRegistry {
    clients: BTreeMap<ProviderKind, Arc<dyn HookClient>>,
}

impl ProviderRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn register(&mut self, client: Arc<dyn HookClient>) {
        self.clients.insert(client.kind(), client);
    }

    pub fn with(mut self, client: Arc<dyn HookClient>) -> Self {
        self.register(client);
        self
    }

    /// Builds every client the settings enable.
    pub fn from_settings(settings: &Settings, transport: Arc<dyn Transport>) -> Self {
        let mut registry = Self::new()
            .with(Arc::new(github::GitHubClient::new(
                transport.clone(),
                &settings.github_api_url,
                &settings.webhook_base_url,
            )))
            .with(Arc::new(gitlab::GitLabClient::new(
                transport.clone(),
                &settings.gitlab_api_url,
                &settings.webhook_base_url,
                settings.gitlab_oauth.clone(),
            )))
            .with(Arc::new(bitbucket_cloud::BitbucketCloudClient::new(
                transport.clone(),
                &settings.bitbucket_cloud_api_url,
                &settings.webhook_base_url,
                settings.bitbucket_cloud_oauth.clone(),
            )))
            .with(Arc::new(polling::PollingClient::new(settings.http_timeout)));
        if let Some(server_url) = &settings.bitbucket_server_url {
            registry.register(Arc::new(bitbucket_server::BitbucketServerClient::new(
                transport,
                server_url,
                &settings.webhook_base_url,
            )));
        }
        registry
    }

    pub fn get(&self, kind: ProviderKind) -> Result<Arc<dyn HookClient>, HookError> {
        self.clients
            .get(&kind)
            .cloned()
            .ok_or_else(|| HookError::UnknownProvider(kind.to_string()))
    }

    /// Explicit provider, else the client owning the repository host, else
    /// polling when the watch tracks a branch.
    pub fn resolve(&self, watch: &Watch) -> Option<ProviderKind> {
        if let Some(kind) = watch.spec.provider {
            return Some(kind);
        }
        if let Ok(repo) = RepoPath::parse(&watch.spec.repository_url) {
            let owner = self
                .clients
                .values()
                .find(|c| c.kind() != ProviderKind::Polling && c.owns_host(&repo.host));
            if let Some(client) = owner {
                return Some(client.kind());
            }
        }
        watch
            .spec
            .branch
            .as_deref()
            .filter(|b| !b.is_empty())
            .map(|_| ProviderKind::Polling)
    }

    pub fn client_for(&self, watch: &Watch) -> Result<Arc<dyn HookClient>, HookError> {
        let kind = self.resolve(watch).ok_or_else(|| {
            HookError::UnknownProvider(format!("none for '{}'", watch.spec.repository_url))
        })?;
        self.get(kind)
    }

    pub fn kinds(&self) -> impl Iterator<Item = ProviderKind> + '_ {
        self.clients.keys().copied()
    }
}
