//! Pseudo-host for repositories reachable only over git.
//!
//! Branch heads are resolved by running `git ls-remote`; nothing is
//! registered remotely and no deliveries are accepted.

use async_trait::async_trait;
use std::process::Stdio;
use std::time::Duration;
use tokio::process::Command;
use tracing::debug;

use super::{HookClient, HookRegistration, ProviderKind};
use crate::error::HookError;
use crate::payload::{InboundHook, ParsedHook, REFS_BRANCH_PREFIX};
use crate::signature::Scheme;
use crate::types::{Trigger, Watch};

pub struct PollingClient {
    timeout: Duration,
}

impl PollingClient {
    pub fn new(timeout: Duration) -> Self {
        Self { timeout }
    }

    fn no_hooks(&self) -> HookError {
        HookError::UnknownProvider(format!("{} does not accept webhooks", self.kind()))
    }
}

/// Embeds `token` as `oauth2:<token>` credentials for HTTP(S) remotes.
pub fn authenticated_url(repository_url: &str, token: &str) -> String {
    if token.is_empty() {
        return repository_url.to_string();
    }
    match url::Url::parse(repository_url) {
        Ok(mut url) if matches!(url.scheme(), "http" | "https") => {
            if url.set_username("oauth2").is_ok() && url.set_password(Some(token)).is_ok() {
                url.to_string()
            } else {
                repository_url.to_string()
            }
        }
        _ => repository_url.to_string(),
    }
}

/// First SHA in `git ls-remote` output for exactly `refs/heads/<branch>`.
pub fn parse_ls_remote(output: &str, branch: &str) -> Option<String> {
    let wanted = format!("{REFS_BRANCH_PREFIX}{branch}");
    output.lines().find_map(|line| {
        let (sha, name) = line.split_once('\t')?;
        (name.trim() == wanted && !sha.is_empty()).then(|| sha.trim().to_string())
    })
}

fn redact(text: &str, token: &str) -> String {
    if token.is_empty() {
        text.to_string()
    } else {
        text.replace(token, "***")
    }
}

#[async_trait]
impl HookClient for PollingClient {
    fn kind(&self) -> ProviderKind {
        ProviderKind::Polling
    }

    fn owns_host(&self, _host: &str) -> bool {
        false
    }

    fn scheme(&self) -> Option<Scheme> {
        None
    }

    fn supports_hooks(&self) -> bool {
        false
    }

    fn verify(&self, _watch: &Watch, _hook: &InboundHook<'_>) -> Result<(), HookError> {
        Err(self.no_hooks())
    }

    fn parse(&self, _hook: &InboundHook<'_>) -> Result<ParsedHook, HookError> {
        Err(self.no_hooks())
    }

    async fn create_hook(&self, _watch: &Watch, _token: &str) -> Result<HookRegistration, HookError> {
        Err(self.no_hooks())
    }

    async fn delete_hook(&self, _watch: &Watch, _token: &str) -> Result<(), HookError> {
        Ok(())
    }

    async fn update_status(&self, _trigger: &Trigger, _token: &str) -> Result<(), HookError> {
        Ok(())
    }

    async fn branch_head(&self, watch: &Watch, token: &str) -> Result<Option<String>, HookError> {
        let Some(branch) = watch.spec.branch.as_deref().filter(|b| !b.is_empty()) else {
            return Ok(None);
        };
        let remote = authenticated_url(&watch.spec.repository_url, token);
        let refspec = format!("{REFS_BRANCH_PREFIX}{branch}");
        debug!(watch = %watch.key(), refspec = %refspec, "git ls-remote");

        let child = Command::new("git")
            .arg("ls-remote")
            .arg(&remote)
            .arg(&refspec)
            .env("GIT_TERMINAL_PROMPT", "0")
            .stdin(Stdio::null())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .kill_on_drop(true)
            .spawn()
            .map_err(|e| HookError::RemoteUnavailable(format!("failed to run git: {e}")))?;

        let output = tokio::time::timeout(self.timeout, child.wait_with_output())
            .await
            .map_err(|_| HookError::RemoteUnavailable(format!("git ls-remote timed out after {:?}", self.timeout)))?
            .map_err(|e| HookError::RemoteUnavailable(format!("failed to wait for git: {e}")))?;

        if !output.status.success() {
            let stderr = String::from_utf8_lossy(&output.stderr);
            return Err(HookError::RemoteUnavailable(format!(
                "git ls-remote exited with {:?}: {}",
                output.status.code(),
                redact(stderr.trim(), token)
            )));
        }
        Ok(parse_ls_remote(&String::from_utf8_lossy(&output.stdout), branch))
    }
}
