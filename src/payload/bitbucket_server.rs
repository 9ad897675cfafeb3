use serde::Deserialize;

use super::{ParsedHook, REFS_BRANCH_PREFIX, REFS_TAG_PREFIX, decode};
use crate::error::HookError;
use crate::types::{Author, ChangeEvent, EventKind, PullRequestAction, PullRequestInfo};

pub const EVENT_HEADER: &str = "x-event-key";
pub const SIGNATURE_HEADER: &str = "x-hub-signature";

const STATE_OPEN: &str = "OPEN";

#[derive(Debug, Default, Deserialize)]
struct Link {
    #[serde(default)]
    href: String,
}

#[derive(Debug, Default, Deserialize)]
struct SelfLinks {
    #[serde(rename = "self", default)]
    self_links: Vec<Link>,
}

impl SelfLinks {
    fn first(&self) -> Option<&str> {
        self.self_links.first().map(|l| l.href.as_str())
    }
}

#[derive(Debug, Default, Deserialize)]
#[serde(rename_all = "camelCase")]
struct User {
    #[serde(default)]
    name: String,
    #[serde(default)]
    email_address: Option<String>,
    #[serde(default)]
    links: SelfLinks,
}

impl From<User> for Author {
    fn from(user: User) -> Self {
        let avatar = user
            .links
            .first()
            .map(|href| format!("{href}/avatar.png"))
            .unwrap_or_default();
        Author {
            login: user.name,
            email: user.email_address.unwrap_or_default(),
            avatar,
        }
    }
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct RefChange {
    ref_id: String,
    to_hash: String,
    #[serde(rename = "type")]
    kind: String,
}

#[derive(Debug, Deserialize)]
struct RefsChangedEvent {
    #[serde(default)]
    actor: User,
    #[serde(default)]
    changes: Vec<RefChange>,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct PullRequestRef {
    display_id: String,
    #[serde(default)]
    latest_commit: String,
}

#[derive(Debug, Deserialize)]
struct Participant {
    #[serde(default)]
    user: User,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct PullRequest {
    id: u64,
    #[serde(default)]
    title: String,
    #[serde(default)]
    description: Option<String>,
    state: String,
    from_ref: PullRequestRef,
    to_ref: PullRequestRef,
    author: Participant,
    #[serde(default)]
    links: SelfLinks,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct PullRequestEvent {
    pull_request: PullRequest,
}

/// Decodes a Bitbucket Server delivery given its `X-Event-Key` value.
pub fn parse(event: &str, body: &[u8]) -> Result<ParsedHook, HookError> {
    let action = match event {
        "diagnostics:ping" => return Ok(ParsedHook::Ping),
        "repo:refs_changed" => return parse_refs_changed(body).map(ParsedHook::Event),
        "pr:opened" => PullRequestAction::Opened,
        "pr:from_ref_updated" | "pr:modified" => PullRequestAction::Synchronize,
        "pr:reopened" => PullRequestAction::Reopened,
        "pr:merged" => PullRequestAction::Merged,
        "pr:declined" => PullRequestAction::Closed,
        other => return Err(HookError::omitted(format!("event '{other}'"))),
    };
    parse_pull_request(action, body).map(ParsedHook::Event)
}

fn parse_refs_changed(body: &[u8]) -> Result<ChangeEvent, HookError> {
    let payload: RefsChangedEvent = decode(body)?;
    let Some(change) = payload.changes.into_iter().next() else {
        return Err(HookError::Decode("refs_changed event without changes".into()));
    };

    let mut event = if let Some(tag) = change.ref_id.strip_prefix(REFS_TAG_PREFIX) {
        if change.kind != "ADD" {
            return Err(HookError::omitted(format!("{} change for tag", change.kind)));
        }
        ChangeEvent::tag(tag)
    } else if let Some(branch) = change.ref_id.strip_prefix(REFS_BRANCH_PREFIX) {
        if change.kind != "ADD" && change.kind != "UPDATE" {
            return Err(HookError::omitted(format!("{} change for branch", change.kind)));
        }
        ChangeEvent::push(branch, String::new())
    } else {
        return Err(HookError::omitted(format!("change to ref '{}'", change.ref_id)));
    };
    event.commit = Some(change.to_hash);
    event.author = payload.actor.into();
    Ok(event)
}

fn parse_pull_request(action: PullRequestAction, body: &[u8]) -> Result<ChangeEvent, HookError> {
    let payload: PullRequestEvent = decode(body)?;
    let pr = payload.pull_request;
    let still_open = matches!(action, PullRequestAction::Opened | PullRequestAction::Synchronize);
    if still_open && pr.state != STATE_OPEN {
        return Err(HookError::omitted(format!("update of {} pull request", pr.state)));
    }

    let mut event = ChangeEvent::new(EventKind::PullRequest);
    event.branch = Some(pr.to_ref.display_id);
    event.commit = Some(pr.from_ref.latest_commit);
    event.message = pr.description.unwrap_or_else(|| pr.title.clone());
    event.title = pr.title;
    event.source_link = pr.links.first().unwrap_or_default().to_string();
    event.author = pr.author.user.into();
    event.pull_request = Some(PullRequestInfo {
        number: pr.id,
        action,
        merged: action == PullRequestAction::Merged,
    });
    Ok(event)
}

#[cfg(test)]
pub(crate) mod fixtures {
    use serde_json::json;

    pub fn refs_changed(ref_id: &str, kind: &str) -> String {
        json!({
            "eventKey": "repo:refs_changed",
            "actor": {
                "name": "admin",
                "emailAddress": "admin@example.com",
                "links": { "self": [{ "href": "https://bitbucket.example.com/users/admin" }] },
            },
            "changes": [{
                "ref": { "id": ref_id, "type": "BRANCH" },
                "refId": ref_id,
                "fromHash": "ecddabb624f6f5ba43816f5926e580a5f680a932",
                "toHash": "178864a7d521b6f5e720b386b2c2b0ef8563e0dc",
                "type": kind,
            }],
        })
        .to_string()
    }

    pub fn pull_request(state: &str) -> String {
        json!({
            "pullRequest": {
                "id": 12,
                "title": "Speed up CI",
                "state": state,
                "fromRef": { "displayId": "ci", "latestCommit": "ef8755f06ee4b28c96a847a95cb8ec8ed6ddd1ca" },
                "toRef": { "displayId": "master", "latestCommit": "178864a7d521b6f5e720b386b2c2b0ef8563e0dc" },
                "author": { "user": {
                    "name": "admin",
                    "links": { "self": [{ "href": "https://bitbucket.example.com/users/admin" }] },
                } },
                "links": { "self": [{ "href": "https://bitbucket.example.com/projects/PRJ/repos/app/pull-requests/12" }] },
            },
        })
        .to_string()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::Rejection;

    fn event(parsed: ParsedHook) -> ChangeEvent {
        match parsed {
            ParsedHook::Event(event) => event,
            ParsedHook::Ping => panic!("expected an event"),
        }
    }

    #[test]
    fn branch_updates_and_additions() {
        for kind in ["UPDATE", "ADD"] {
            let body = fixtures::refs_changed("refs/heads/master", kind);
            let event = event(parse("repo:refs_changed", body.as_bytes()).unwrap());
            assert_eq!(event.kind, EventKind::Push);
            assert_eq!(event.branch.as_deref(), Some("master"));
            assert_eq!(event.commit.as_deref(), Some("178864a7d521b6f5e720b386b2c2b0ef8563e0dc"));
            assert_eq!(event.author.avatar, "https://bitbucket.example.com/users/admin/avatar.png");
        }
        let deleted = fixtures::refs_changed("refs/heads/master", "DELETE");
        assert!(parse("repo:refs_changed", deleted.as_bytes()).is_err());
    }

    #[test]
    fn tags_only_on_add() {
        let added = fixtures::refs_changed("refs/tags/v1.0", "ADD");
        let event = event(parse("repo:refs_changed", added.as_bytes()).unwrap());
        assert_eq!(event.kind, EventKind::Tag);
        assert_eq!(event.tag.as_deref(), Some("v1.0"));

        let deleted = fixtures::refs_changed("refs/tags/v1.0", "DELETE");
        assert!(matches!(
            parse("repo:refs_changed", deleted.as_bytes()),
            Err(HookError::Rejected(Rejection::Omitted(_)))
        ));
    }

    #[test]
    fn pull_requests_must_be_open_to_build() {
        let open = fixtures::pull_request("OPEN");
        let event = event(parse("pr:opened", open.as_bytes()).unwrap());
        assert_eq!(event.branch.as_deref(), Some("master"));
        assert_eq!(event.message, "Speed up CI");
        assert_eq!(event.pull_request.unwrap().number, 12);

        let declined = fixtures::pull_request("DECLINED");
        assert!(parse("pr:modified", declined.as_bytes()).is_err());
        assert!(parse("pr:declined", declined.as_bytes()).is_ok());
    }

    #[test]
    fn ping_and_unknown() {
        assert_eq!(parse("diagnostics:ping", b"").unwrap(), ParsedHook::Ping);
        assert!(parse("repo:comment:added", b"{}").is_err());
    }
}
