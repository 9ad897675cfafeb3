use serde::Deserialize;

use super::{ParsedHook, branch_from_ref, decode, is_null_sha};
use crate::error::HookError;
use crate::types::{Author, ChangeEvent, EventKind, PullRequestAction, PullRequestInfo};

pub const EVENT_HEADER: &str = "x-github-event";
pub const SIGNATURE_256_HEADER: &str = "x-hub-signature-256";
pub const SIGNATURE_HEADER: &str = "x-hub-signature";

#[derive(Debug, Default, Deserialize)]
struct User {
    #[serde(default)]
    login: String,
    #[serde(default)]
    email: Option<String>,
    #[serde(default)]
    avatar_url: Option<String>,
}

impl From<User> for Author {
    fn from(user: User) -> Self {
        Author {
            login: user.login,
            email: user.email.unwrap_or_default(),
            avatar: user.avatar_url.unwrap_or_default(),
        }
    }
}

#[derive(Debug, Deserialize)]
struct Repository {
    #[serde(default)]
    html_url: String,
}

#[derive(Debug, Deserialize)]
struct Commit {
    id: String,
    #[serde(default)]
    message: String,
    #[serde(default)]
    url: String,
}

#[derive(Debug, Deserialize)]
struct PushEvent {
    #[serde(rename = "ref")]
    git_ref: String,
    #[serde(default)]
    after: String,
    #[serde(default)]
    deleted: bool,
    head_commit: Option<Commit>,
    sender: Option<User>,
}

#[derive(Debug, Deserialize)]
struct RefEvent {
    #[serde(rename = "ref")]
    git_ref: String,
    ref_type: String,
    sender: Option<User>,
    repository: Option<Repository>,
}

#[derive(Debug, Deserialize)]
struct PullRequestEvent {
    action: String,
    number: u64,
    pull_request: PullRequest,
    sender: Option<User>,
    repository: Option<Repository>,
}

#[derive(Debug, Deserialize)]
struct PullRequest {
    #[serde(default)]
    title: String,
    #[serde(default)]
    body: Option<String>,
    #[serde(default)]
    html_url: String,
    #[serde(default)]
    merged: Option<bool>,
    head: Branch,
    base: Branch,
}

#[derive(Debug, Deserialize)]
struct Branch {
    #[serde(rename = "ref")]
    git_ref: String,
    sha: String,
}

/// Decodes a GitHub delivery given its `X-GitHub-Event` value.
pub fn parse(event: &str, body: &[u8]) -> Result<ParsedHook, HookError> {
    match event {
        "push" => parse_push(body).map(ParsedHook::Event),
        "create" => parse_create(body).map(ParsedHook::Event),
        "delete" => {
            let deleted: RefEvent = decode(body)?;
            Err(HookError::omitted(format!("{} deletion", deleted.ref_type)))
        }
        "pull_request" => parse_pull_request(body).map(ParsedHook::Event),
        "ping" => Ok(ParsedHook::Ping),
        other => Err(HookError::omitted(format!("event '{other}'"))),
    }
}

fn parse_push(body: &[u8]) -> Result<ChangeEvent, HookError> {
    let payload: PushEvent = decode(body)?;
    let branch = branch_from_ref(&payload.git_ref)?;
    if payload.deleted || is_null_sha(&payload.after) {
        return Err(HookError::omitted("branch deletion"));
    }

    let mut event = ChangeEvent::new(EventKind::Push);
    event.branch = Some(branch);
    event.author = payload.sender.unwrap_or_default().into();
    match payload.head_commit {
        Some(commit) => {
            event.commit = Some(commit.id);
            event.message = commit.message;
            event.source_link = commit.url;
        }
        None => event.commit = Some(payload.after),
    }
    Ok(event)
}

fn parse_create(body: &[u8]) -> Result<ChangeEvent, HookError> {
    let payload: RefEvent = decode(body)?;
    if payload.ref_type != "tag" {
        return Err(HookError::omitted(format!("{} creation", payload.ref_type)));
    }
    if payload.git_ref.is_empty() {
        return Err(HookError::Decode("create event has empty tag ref".into()));
    }

    let mut event = ChangeEvent::tag(payload.git_ref);
    event.author = payload.sender.unwrap_or_default().into();
    if let Some(repo) = payload.repository {
        event.source_link = repo.html_url;
    }
    Ok(event)
}

fn parse_pull_request(body: &[u8]) -> Result<ChangeEvent, HookError> {
    let payload: PullRequestEvent = decode(body)?;
    let pr = payload.pull_request;
    let merged = pr.merged.unwrap_or(false);
    let action = match payload.action.as_str() {
        "opened" => PullRequestAction::Opened,
        "synchronize" => PullRequestAction::Synchronize,
        "reopened" => PullRequestAction::Reopened,
        "closed" if merged => PullRequestAction::Merged,
        "closed" => PullRequestAction::Closed,
        other => return Err(HookError::omitted(format!("action {other}"))),
    };

    let mut event = ChangeEvent::new(EventKind::PullRequest);
    event.branch = Some(pr.base.git_ref);
    event.commit = Some(pr.head.sha);
    event.title = pr.title;
    event.message = pr.body.unwrap_or_default();
    event.source_link = pr.html_url;
    event.author = payload.sender.unwrap_or_default().into();
    event.repository_url = payload
        .repository
        .map(|r| r.html_url)
        .filter(|url| !url.is_empty());
    event.pull_request = Some(PullRequestInfo {
        number: payload.number,
        action,
        merged,
    });
    Ok(event)
}

#[cfg(test)]
pub(crate) mod fixtures {
    pub fn push(git_ref: &str, sha: &str) -> String {
        serde_json::json!({
            "ref": git_ref,
            "before": "6113728f27ae82c7b1a177c8d03f9e96e0adf246",
            "after": sha,
            "deleted": false,
            "head_commit": {
                "id": sha,
                "message": "Fix flaky test",
                "url": format!("https://github.com/acme/app/commit/{sha}"),
            },
            "repository": { "html_url": "https://github.com/acme/app" },
            "sender": {
                "login": "octocat",
                "avatar_url": "https://avatars.githubusercontent.com/u/583231",
            },
        })
        .to_string()
    }

    pub fn pull_request(action: &str, merged: bool) -> String {
        serde_json::json!({
            "action": action,
            "number": 17,
            "pull_request": {
                "title": "Add retries",
                "body": "Retries transient failures.",
                "html_url": "https://github.com/acme/app/pull/17",
                "merged": merged,
                "head": { "ref": "feature/retries", "sha": "a1b2c3d4e5f60718293a4b5c6d7e8f9012345678" },
                "base": { "ref": "main", "sha": "0f1e2d3c4b5a69788796a5b4c3d2e1f009876543" },
            },
            "repository": { "html_url": "https://github.com/acme/app" },
            "sender": { "login": "hubot" },
        })
        .to_string()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::Rejection;

    const SHA: &str = "9fceb02d0ae598e95dc970b74767f19372d61af8";

    fn event(parsed: ParsedHook) -> ChangeEvent {
        match parsed {
            ParsedHook::Event(event) => event,
            ParsedHook::Ping => panic!("expected an event"),
        }
    }

    #[test]
    fn push_to_branch() {
        let body = fixtures::push("refs/heads/main", SHA);
        let event = event(parse("push", body.as_bytes()).unwrap());
        assert_eq!(event.kind, EventKind::Push);
        assert_eq!(event.branch.as_deref(), Some("main"));
        assert_eq!(event.commit.as_deref(), Some(SHA));
        assert_eq!(event.author.login, "octocat");
        assert_eq!(event.message, "Fix flaky test");
    }

    #[test]
    fn push_of_tag_ref_is_rejected() {
        let body = fixtures::push("refs/tags/v1", SHA);
        let err = parse("push", body.as_bytes()).unwrap_err();
        assert!(matches!(err, HookError::Rejected(Rejection::Omitted(_))));
    }

    #[test]
    fn branch_deletion_is_rejected() {
        let body = fixtures::push("refs/heads/old", super::super::NULL_SHA);
        assert!(parse("push", body.as_bytes()).is_err());
    }

    #[test]
    fn tag_creation_only() {
        let created = serde_json::json!({
            "ref": "v1.2.0", "ref_type": "tag",
            "repository": { "html_url": "https://github.com/acme/app" },
            "sender": { "login": "octocat" },
        })
        .to_string();
        let event = event(parse("create", created.as_bytes()).unwrap());
        assert_eq!(event.kind, EventKind::Tag);
        assert_eq!(event.tag.as_deref(), Some("v1.2.0"));
        assert_eq!(event.message, "tag v1.2.0 is created");

        let branch = created.replace("\"tag\"", "\"branch\"");
        assert!(parse("create", branch.as_bytes()).is_err());

        let deleted = serde_json::json!({ "ref": "v1.2.0", "ref_type": "tag" }).to_string();
        assert!(matches!(
            parse("delete", deleted.as_bytes()),
            Err(HookError::Rejected(Rejection::Omitted(_)))
        ));
    }

    #[test]
    fn pull_request_actions() {
        let opened = event(parse("pull_request", fixtures::pull_request("opened", false).as_bytes()).unwrap());
        let info = opened.pull_request.unwrap();
        assert_eq!(info.number, 17);
        assert_eq!(info.action, PullRequestAction::Opened);
        assert_eq!(opened.commit.as_deref(), Some("a1b2c3d4e5f60718293a4b5c6d7e8f9012345678"));
        assert_eq!(opened.branch.as_deref(), Some("main"));

        let merged = event(parse("pull_request", fixtures::pull_request("closed", true).as_bytes()).unwrap());
        assert_eq!(merged.pull_request.unwrap().action, PullRequestAction::Merged);

        let closed = event(parse("pull_request", fixtures::pull_request("closed", false).as_bytes()).unwrap());
        assert_eq!(closed.pull_request.unwrap().action, PullRequestAction::Closed);

        assert!(matches!(
            parse("pull_request", fixtures::pull_request("labeled", false).as_bytes()),
            Err(HookError::Rejected(Rejection::Omitted(_)))
        ));
    }

    #[test]
    fn unknown_events_and_bad_json() {
        assert_eq!(parse("ping", b"{}").unwrap(), ParsedHook::Ping);
        assert!(matches!(parse("issues", b"{}"), Err(HookError::Rejected(_))));
        assert!(matches!(parse("push", b"not json"), Err(HookError::Decode(_))));
        assert!(matches!(parse("push", b"{\"after\":\"x\"}"), Err(HookError::Decode(_))));
    }
}
