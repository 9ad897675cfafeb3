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
use crate::credential::OAuthApp;
use crate::error::HookError;
use crate::payload::{InboundHook, ParsedHook, gitlab as payload};
use crate::signature::{self, Scheme};
use crate::types::{CommitState, Trigger, Watch};

pub const DEFAULT_API_URL: &str = "https://gitlab.com/api/v4";
pub const DEFAULT_TOKEN_URL: &str = "https://gitlab.com/oauth/token";

pub struct GitLabClient {
    api: ApiClient,
    api_host: Option<String>,
    callback_base: String,
    oauth: Option<OAuthApp>,
}

#[derive(Deserialize)]
struct Hook {
    id: u64,
    #[serde(default)]
    url: String,
}

#[derive(Deserialize)]
struct Branch {
    commit: BranchCommit,
}

#[derive(Deserialize)]
struct BranchCommit {
    id: String,
}

impl GitLabClient {
    pub fn new(
        transport: Arc<dyn Transport>,
        api_url: &str,
        callback_base: &str,
        oauth: Option<OAuthApp>,
    ) -> Self {
        Self {
            api: ApiClient::new(transport, api_url),
            api_host: host_of(api_url),
            callback_base: callback_base.to_string(),
            oauth,
        }
    }

    /// Projects are addressed by their URL-encoded full path.
    fn project_path(repo: &RepoPath) -> String {
        format!("/projects/{}", encode_segment(&repo.full_name()))
    }

    fn state(state: CommitState) -> &'static str {
        match state {
            CommitState::Pending => "running",
            CommitState::Success => "success",
            CommitState::Failure => "failed",
        }
    }
}

#[async_trait]
impl RemoteHooks for GitLabClient {
    async fn list_hooks(&self, repo: &RepoPath, token: &str) -> Result<Vec<RemoteHook>, HookError> {
        let path = format!("{}/hooks?per_page=100", Self::project_path(repo));
        let hooks: Vec<Hook> = self.api.get_json(&path, token).await?;
        Ok(hooks
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
        let spec = &watch.spec;
        let nothing_enabled = !(spec.push || spec.tag || spec.pull_request);
        let body = json!({
            "url": hook_url(&self.callback_base, &watch.key()),
            "push_events": spec.push || nothing_enabled,
            "tag_push_events": spec.tag,
            "merge_requests_events": spec.pull_request,
            "token": secret,
            "enable_ssl_verification": true,
        });
        let path = format!("{}/hooks", Self::project_path(repo));
        let request = self.api.request(Method::POST, &path).bearer(token).json(body);
        let hook: Hook = self.api.send(request).await?.json()?;
        Ok(hook.id.to_string())
    }

    async fn remove_hook(&self, repo: &RepoPath, id: &str, token: &str) -> Result<(), HookError> {
        let path = format!("{}/hooks/{id}", Self::project_path(repo));
        let request = self.api.request(Method::DELETE, &path).bearer(token);
        self.api.send_optional(request).await.map(|_| ())
    }
}

#[async_trait]
impl HookClient for GitLabClient {
    fn kind(&self) -> ProviderKind {
        ProviderKind::GitLab
    }

    fn owns_host(&self, host: &str) -> bool {
        host == "gitlab.com" || self.api_host.as_deref() == Some(host)
    }

    fn scheme(&self) -> Option<Scheme> {
        Some(Scheme::TokenEcho)
    }

    fn oauth_app(&self) -> Option<&OAuthApp> {
        self.oauth.as_ref()
    }

    fn verify(&self, watch: &Watch, hook: &InboundHook<'_>) -> Result<(), HookError> {
        let expected = recorded_secret(self.kind(), watch)?;
        if signature::verify_token(expected, hook.header(payload::TOKEN_HEADER)) {
            Ok(())
        } else {
            Err(HookError::Authentication {
                provider: self.kind(),
                message: "X-Gitlab-Token does not match".into(),
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
            "name": STATUS_CONTEXT,
        });
        let path = format!("{}/statuses/{commit}", Self::project_path(&repo));
        let request = self.api.request(Method::POST, &path).bearer(token).json(body);
        self.api.send(request).await.map(|_| ())
    }

    async fn branch_head(&self, watch: &Watch, token: &str) -> Result<Option<String>, HookError> {
        let Some(branch) = watch.spec.branch.as_deref() else {
            return Ok(None);
        };
        let repo = RepoPath::parse(&watch.spec.repository_url)?;
        let path = format!(
            "{}/repository/branches/{}",
            Self::project_path(&repo),
            encode_segment(branch)
        );
        let request = self.api.request(Method::GET, &path).bearer(token);
        match self.api.send_optional(request).await? {
            Some(response) => Ok(Some(response.json::<Branch>()?.commit.id)),
            None => Ok(None),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::payload::HookHeaders;
    use crate::provider::http::fake::{FakeTransport, request_json, respond};
    use crate::provider::testing::{BASE_URL, watch};

    #[tokio::test]
    async fn hooks_are_addressed_by_encoded_project_path() {
        let transport = FakeTransport::new(|req| match req.method {
            Method::GET => respond(200, json!([
                { "id": 7, "url": "https://elsewhere.example.com/ci" },
            ])),
            _ => respond(201, json!({ "id": 8, "url": "ignored" })),
        });
        let client = GitLabClient::new(transport.clone(), DEFAULT_API_URL, BASE_URL, None);
        let mut watch = watch("https://gitlab.com/group/sub/app.git");
        watch.spec.tag = false;

        let registration = client.create_hook(&watch, "glpat").await.unwrap();
        assert_eq!(registration.id, "8");

        let requests = transport.requests();
        assert_eq!(requests[0].url, "https://gitlab.com/api/v4/projects/group%2Fsub%2Fapp/hooks?per_page=100");
        let body = request_json(&requests[1]);
        assert_eq!(body["token"], registration.token.as_str());
        assert_eq!(body["tag_push_events"], false);
        assert_eq!(body["merge_requests_events"], true);
        assert_eq!(transport.count(&Method::DELETE), 0);
    }

    #[tokio::test]
    async fn hook_without_enabled_events_listens_for_pushes() {
        let transport = FakeTransport::new(|req| match req.method {
            Method::GET => respond(200, json!([])),
            _ => respond(201, json!({ "id": 8, "url": "ignored" })),
        });
        let client = GitLabClient::new(transport.clone(), DEFAULT_API_URL, BASE_URL, None);
        let mut watch = watch("https://gitlab.com/acme/app");
        watch.spec.push = false;
        watch.spec.tag = false;
        watch.spec.pull_request = false;

        client.create_hook(&watch, "glpat").await.unwrap();
        let body = request_json(&transport.requests()[1]);
        assert_eq!(body["push_events"], true);
        assert_eq!(body["tag_push_events"], false);
        assert_eq!(body["merge_requests_events"], false);
    }

    #[test]
    fn verifies_echoed_token() {
        let client = GitLabClient::new(FakeTransport::new(|_| respond(200, json!({}))), DEFAULT_API_URL, BASE_URL, None);
        let mut watch = watch("https://gitlab.com/acme/app");
        watch.status.token = Some("echo-me".into());

        let mut headers = HookHeaders::default();
        headers.insert("X-Gitlab-Token", "echo-me");
        let hook = InboundHook { headers: &headers, query_secret: None, body: b"{}" };
        assert!(client.verify(&watch, &hook).is_ok());

        headers.insert("X-Gitlab-Token", "guess");
        let hook = InboundHook { headers: &headers, query_secret: None, body: b"{}" };
        assert_eq!(client.verify(&watch, &hook).unwrap_err().status_code().code, 401);
    }

    #[tokio::test]
    async fn pending_status_is_running() {
        let transport = FakeTransport::new(|_| respond(201, json!({})));
        let client = GitLabClient::new(transport.clone(), DEFAULT_API_URL, BASE_URL, None);
        let trigger = crate::provider::testing::trigger("https://gitlab.com/acme/app", None);
        client.update_status(&trigger, "t").await.unwrap();
        let body = request_json(&transport.requests()[0]);
        assert_eq!(body["state"], "running");
        assert_eq!(body["name"], STATUS_CONTEXT);
    }
}
