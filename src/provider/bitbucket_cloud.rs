use async_trait::async_trait;
use reqwest::Method;
use serde::Deserialize;
use serde_json::json;
use std::sync::Arc;

use super::http::{ApiClient, Transport};
use super::{
    HookClient, HookRegistration, ProviderKind, RemoteHook, RemoteHooks, RepoPath, STATUS_CONTEXT,
    encode_segment, hook_url_with_secret, recorded_secret, register, status_target, unregister,
};
use crate::credential::OAuthApp;
use crate::error::HookError;
use crate::payload::{InboundHook, ParsedHook, bitbucket_cloud as payload};
use crate::signature::{self, Scheme};
use crate::types::{CommitState, Trigger, Watch};

pub const DEFAULT_API_URL: &str = "https://api.bitbucket.org/2.0";
pub const DEFAULT_TOKEN_URL: &str = "https://bitbucket.org/site/oauth2/access_token";
const HOST: &str = "bitbucket.org";

pub struct BitbucketCloudClient {
    api: ApiClient,
    callback_base: String,
    oauth: Option<OAuthApp>,
}

#[derive(Deserialize)]
struct Page<T> {
    #[serde(default = "Vec::new")]
    values: Vec<T>,
}

#[derive(Deserialize)]
struct Hook {
    uuid: String,
    #[serde(default)]
    url: String,
}

#[derive(Deserialize)]
struct Branch {
    target: BranchTarget,
}

#[derive(Deserialize)]
struct BranchTarget {
    hash: String,
}

impl BitbucketCloudClient {
    pub fn new(
        transport: Arc<dyn Transport>,
        api_url: &str,
        callback_base: &str,
        oauth: Option<OAuthApp>,
    ) -> Self {
        Self {
            api: ApiClient::new(transport, api_url),
            callback_base: callback_base.to_string(),
            oauth,
        }
    }

    fn repo_path(repo: &RepoPath) -> String {
        format!("/repositories/{}/{}", repo.owner, repo.name)
    }

    fn events(watch: &Watch) -> Vec<&'static str> {
        let mut events = Vec::new();
        if watch.spec.push || watch.spec.tag || !watch.spec.pull_request {
            events.push("repo:push");
        }
        if watch.spec.pull_request {
            events.extend([
                "pullrequest:created",
                "pullrequest:updated",
                "pullrequest:fulfilled",
                "pullrequest:rejected",
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
}

#[async_trait]
impl RemoteHooks for BitbucketCloudClient {
    async fn list_hooks(&self, repo: &RepoPath, token: &str) -> Result<Vec<RemoteHook>, HookError> {
        let path = format!("{}/hooks?pagelen=100", Self::repo_path(repo));
        let page: Page<Hook> = self.api.get_json(&path, token).await?;
        Ok(page
            .values
            .into_iter()
            .map(|h| RemoteHook { id: h.uuid, url: h.url })
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
            "description": format!("gitwatcher {}", watch.key()),
            "url": hook_url_with_secret(&self.callback_base, &watch.key(), secret),
            "active": true,
            "events": Self::events(watch),
        });
        let path = format!("{}/hooks", Self::repo_path(repo));
        let request = self.api.request(Method::POST, &path).bearer(token).json(body);
        let hook: Hook = self.api.send(request).await?.json()?;
        Ok(hook.uuid)
    }

    async fn remove_hook(&self, repo: &RepoPath, id: &str, token: &str) -> Result<(), HookError> {
        let path = format!("{}/hooks/{}", Self::repo_path(repo), encode_segment(id));
        let request = self.api.request(Method::DELETE, &path).bearer(token);
        self.api.send_optional(request).await.map(|_| ())
    }
}

#[async_trait]
impl HookClient for BitbucketCloudClient {
    fn kind(&self) -> ProviderKind {
        ProviderKind::BitbucketCloud
    }

    fn owns_host(&self, host: &str) -> bool {
        host == HOST
    }

    fn scheme(&self) -> Option<Scheme> {
        Some(Scheme::TokenEcho)
    }

    fn oauth_app(&self) -> Option<&OAuthApp> {
        self.oauth.as_ref()
    }

    /// The secret is echoed back through the callback URL's query string.
    fn verify(&self, watch: &Watch, hook: &InboundHook<'_>) -> Result<(), HookError> {
        let expected = recorded_secret(self.kind(), watch)?;
        if signature::verify_token(expected, hook.query_secret) {
            Ok(())
        } else {
            Err(HookError::Authentication {
                provider: self.kind(),
                message: "secret query parameter does not match".into(),
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
            "key": STATUS_CONTEXT,
            "url": trigger.status.status_url,
            "description": state.description(),
        });
        let path = format!("{}/commit/{commit}/statuses/build", Self::repo_path(&repo));
        let request = self.api.request(Method::POST, &path).bearer(token).json(body);
        self.api.send(request).await.map(|_| ())
    }

    async fn branch_head(&self, watch: &Watch, token: &str) -> Result<Option<String>, HookError> {
        let Some(branch) = watch.spec.branch.as_deref() else {
            return Ok(None);
        };
        let repo = RepoPath::parse(&watch.spec.repository_url)?;
        let path = format!(
            "{}/refs/branches/{}",
            Self::repo_path(&repo),
            encode_segment(branch)
        );
        let request = self.api.request(Method::GET, &path).bearer(token);
        match self.api.send_optional(request).await? {
            Some(response) => Ok(Some(response.json::<Branch>()?.target.hash)),
            None => Ok(None),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::payload::HookHeaders;
    use crate::provider::http::fake::{FakeTransport, request_json, respond};
    use crate::provider::testing::{BASE_URL, trigger, watch};

    #[tokio::test]
    async fn callback_url_carries_secret() {
        let transport = FakeTransport::new(|req| match req.method {
            Method::GET => respond(200, json!({ "values": [] })),
            _ => respond(201, json!({ "uuid": "{2c1f8a10-0f3e-4bfa-9a0e-0f5e2e0b1c11}", "url": "" })),
        });
        let client = BitbucketCloudClient::new(transport.clone(), DEFAULT_API_URL, BASE_URL, None);
        let watch = watch("https://bitbucket.org/acme/app.git");

        let registration = client.create_hook(&watch, "bb").await.unwrap();
        assert_eq!(registration.id, "{2c1f8a10-0f3e-4bfa-9a0e-0f5e2e0b1c11}");

        let body = request_json(&transport.requests()[1]);
        let expected = format!(
            "https://hooks.example.com/hooks?secret={}&gitwebhookId=team-a:app",
            registration.token
        );
        assert_eq!(body["url"], expected.as_str());
        assert_eq!(body["events"][0], "repo:push");
        assert_eq!(body["events"].as_array().unwrap().len(), 5);
    }

    #[tokio::test]
    async fn hook_ids_are_encoded_on_delete() {
        let listed = json!({ "values": [{
            "uuid": "{abc}",
            "url": "https://hooks.example.com/hooks?secret=x&gitwebhookId=team-a:app",
        }] });
        let transport = FakeTransport::new(move |req| match req.method {
            Method::GET => respond(200, listed.clone()),
            _ => respond(204, json!(null)),
        });
        let client = BitbucketCloudClient::new(transport.clone(), DEFAULT_API_URL, BASE_URL, None);
        client.delete_hook(&watch("https://bitbucket.org/acme/app"), "bb").await.unwrap();
        assert_eq!(
            transport.requests()[1].url,
            "https://api.bitbucket.org/2.0/repositories/acme/app/hooks/%7Babc%7D"
        );
    }

    #[tokio::test]
    async fn status_vocabulary() {
        let transport = FakeTransport::new(|_| respond(201, json!({})));
        let client = BitbucketCloudClient::new(transport.clone(), DEFAULT_API_URL, BASE_URL, None);
        client
            .update_status(&trigger("https://bitbucket.org/acme/app", Some(true)), "bb")
            .await
            .unwrap();
        let request = &transport.requests()[0];
        assert!(request.url.ends_with("/repositories/acme/app/commit/9fceb02d0ae598e95dc970b74767f19372d61af8/statuses/build"));
        assert_eq!(request_json(request)["state"], "SUCCESSFUL");
    }

    #[test]
    fn verifies_query_secret() {
        let client = BitbucketCloudClient::new(FakeTransport::new(|_| respond(200, json!({}))), DEFAULT_API_URL, BASE_URL, None);
        let mut watch = watch("https://bitbucket.org/acme/app");
        watch.status.token = Some("q-secret".into());
        let headers = HookHeaders::default();

        let good = InboundHook { headers: &headers, query_secret: Some("q-secret"), body: b"{}" };
        assert!(client.verify(&watch, &good).is_ok());
        let missing = InboundHook { headers: &headers, query_secret: None, body: b"{}" };
        assert!(client.verify(&watch, &missing).is_err());
    }
}
