use serde::Deserialize;

use super::{ParsedHook, REFS_TAG_PREFIX, branch_from_ref, decode, is_null_sha};
use crate::error::HookError;
use crate::types::{Author, ChangeEvent, EventKind, PullRequestAction, PullRequestInfo};

pub const EVENT_HEADER: &str = "x-gitlab-event";
pub const TOKEN_HEADER: &str = "x-gitlab-token";

#[derive(Debug, Deserialize)]
struct Project {
    #[serde(default)]
    web_url: String,
}

#[derive(Debug, Deserialize)]
struct Commit {
    id: String,
    #[serde(default)]
    message: String,
    #[serde(default)]
    url: String,
}

/// Shared shape of "Push Hook" and "Tag Push Hook".
#[derive(Debug, Deserialize)]
struct PushEvent {
    #[serde(rename = "ref")]
    git_ref: String,
    #[serde(default)]
    before: String,
    #[serde(default)]
    after: String,
    #[serde(default)]
    checkout_sha: Option<String>,
    #[serde(default)]
    user_username: String,
    #[serde(default)]
    user_email: Option<String>,
    #[serde(default)]
    user_avatar: Option<String>,
    #[serde(default)]
    commits: Vec<Commit>,
    project: Option<Project>,
}

impl PushEvent {
    fn author(&self) -> Author {
        Author {
            login: self.user_username.clone(),
            email: self.user_email.clone().unwrap_or_default(),
            avatar: self.user_avatar.clone().unwrap_or_default(),
        }
    }

    fn head_sha(&self) -> String {
        self.checkout_sha
            .clone()
            .filter(|sha| !sha.is_empty())
            .unwrap_or_else(|| self.after.clone())
    }
}

#[derive(Debug, Deserialize)]
struct MergeRequestEvent {
    user: Option<User>,
    object_attributes: MergeRequest,
    project: Option<Project>,
}

#[derive(Debug, Deserialize)]
struct User {
    #[serde(default)]
    username: String,
    #[serde(default)]
    email: Option<String>,
    #[serde(default)]
    avatar_url: Option<String>,
}

#[derive(Debug, Deserialize)]
struct MergeRequest {
    iid: u64,
    #[serde(default)]
    action: Option<String>,
    #[serde(default)]
    title: String,
    #[serde(default)]
    description: Option<String>,
    #[serde(default)]
    url: String,
    target_branch: String,
    last_commit: Commit,
    /// Present on `update` only when new commits were pushed.
    #[serde(default)]
    oldrev: Option<String>,
}

/// Decodes a GitLab delivery given its `X-Gitlab-Event` value.
pub fn parse(event: &str, body: &[u8]) -> Result<ParsedHook, HookError> {
    match event {
        "Push Hook" => parse_push(body).map(ParsedHook::Event),
        "Tag Push Hook" => parse_tag(body).map(ParsedHook::Event),
        "Merge Request Hook" => parse_merge_request(body).map(ParsedHook::Event),
        other => Err(HookError::omitted(format!("event '{other}'"))),
    }
}

fn parse_push(body: &[u8]) -> Result<ChangeEvent, HookError> {
    let payload: PushEvent = decode(body)?;
    let branch = branch_from_ref(&payload.git_ref)?;
    if is_null_sha(&payload.after) {
        return Err(HookError::omitted("branch deletion"));
    }

    let head = payload.head_sha();
    let mut event = ChangeEvent::push(branch, head.clone());
    event.author = payload.author();
    if let Some(commit) = payload.commits.iter().find(|c| c.id == head) {
        event.message = commit.message.clone();
        event.source_link = commit.url.clone();
    }
    event.repository_url = payload.project.map(|p| p.web_url).filter(|u| !u.is_empty());
    Ok(event)
}

fn parse_tag(body: &[u8]) -> Result<ChangeEvent, HookError> {
    let payload: PushEvent = decode(body)?;
    let Some(name) = payload.git_ref.strip_prefix(REFS_TAG_PREFIX) else {
        return Err(HookError::Decode(format!("tag push for ref '{}'", payload.git_ref)));
    };
    if !is_null_sha(&payload.before) || is_null_sha(&payload.after) {
        return Err(HookError::omitted("tag update or deletion"));
    }

    let mut event = ChangeEvent::tag(name);
    event.commit = Some(payload.head_sha());
    event.author = payload.author();
    event.repository_url = payload.project.map(|p| p.web_url).filter(|u| !u.is_empty());
    Ok(event)
}

fn parse_merge_request(body: &[u8]) -> Result<ChangeEvent, HookError> {
    let payload: MergeRequestEvent = decode(body)?;
    let mr = payload.object_attributes;
    let action = match mr.action.as_deref() {
        Some("open") => PullRequestAction::Opened,
        Some("reopen") => PullRequestAction::Reopened,
        Some("close") => PullRequestAction::Closed,
        Some("merge") => PullRequestAction::Merged,
        Some("update") if mr.oldrev.is_some() => PullRequestAction::Synchronize,
        Some(other) => return Err(HookError::omitted(format!("action {other}"))),
        None => return Err(HookError::omitted("merge request without action")),
    };

    let mut event = ChangeEvent::new(EventKind::PullRequest);
    event.branch = Some(mr.target_branch);
    event.commit = Some(mr.last_commit.id);
    event.title = mr.title;
    event.message = mr.description.unwrap_or(mr.last_commit.message);
    event.source_link = mr.url;
    if let Some(user) = payload.user {
        event.author = Author {
            login: user.username,
            email: user.email.unwrap_or_default(),
            avatar: user.avatar_url.unwrap_or_default(),
        };
    }
    event.repository_url = payload.project.map(|p| p.web_url).filter(|u| !u.is_empty());
    event.pull_request = Some(PullRequestInfo {
        number: mr.iid,
        action,
        merged: action == PullRequestAction::Merged,
    });
    Ok(event)
}
