use serde::Deserialize;

use super::{ParsedHook, decode};
use crate::error::HookError;
use crate::types::{Author, ChangeEvent, EventKind, PullRequestAction, PullRequestInfo};

pub const EVENT_HEADER: &str = "x-event-key";

#[derive(Debug, Default, Deserialize)]
struct Link {
    #[serde(default)]
    href: String,
}

#[derive(Debug, Default, Deserialize)]
struct ActorLinks {
    #[serde(default)]
    avatar: Link,
}

#[derive(Debug, Default, Deserialize)]
struct Actor {
    #[serde(default)]
    nickname: Option<String>,
    #[serde(default)]
    display_name: Option<String>,
    #[serde(default)]
    links: ActorLinks,
}

impl From<Actor> for Author {
    fn from(actor: Actor) -> Self {
        Author {
            login: actor
                .nickname
                .filter(|n| !n.is_empty())
                .or(actor.display_name)
                .unwrap_or_default(),
            email: String::new(),
            avatar: actor.links.avatar.href,
        }
    }
}

#[derive(Debug, Default, Deserialize)]
struct HtmlLinks {
    #[serde(default)]
    html: Link,
}

#[derive(Debug, Deserialize)]
struct Target {
    hash: String,
    #[serde(default)]
    message: String,
    #[serde(default)]
    links: HtmlLinks,
}

#[derive(Debug, Deserialize)]
struct RefState {
    #[serde(rename = "type")]
    kind: String,
    name: String,
    target: Target,
}

#[derive(Debug, Deserialize)]
struct RefChange {
    new: Option<RefState>,
    old: Option<RefState>,
}

#[derive(Debug, Deserialize)]
struct Push {
    #[serde(default)]
    changes: Vec<RefChange>,
}

#[derive(Debug, Deserialize)]
struct Repository {
    #[serde(default)]
    links: HtmlLinks,
}

#[derive(Debug, Deserialize)]
struct PushEvent {
    push: Push,
    #[serde(default)]
    actor: Actor,
    repository: Option<Repository>,
}

#[derive(Debug, Deserialize)]
struct BranchName {
    name: String,
}

#[derive(Debug, Deserialize)]
struct CommitHash {
    hash: String,
}

#[derive(Debug, Deserialize)]
struct Endpoint {
    branch: BranchName,
    commit: CommitHash,
}

#[derive(Debug, Deserialize)]
struct PullRequest {
    id: u64,
    #[serde(default)]
    title: String,
    #[serde(default)]
    description: String,
    source: Endpoint,
    destination: Endpoint,
    #[serde(default)]
    links: HtmlLinks,
}

#[derive(Debug, Deserialize)]
struct PullRequestEvent {
    pullrequest: PullRequest,
    #[serde(default)]
    actor: Actor,
    repository: Option<Repository>,
}

/// Decodes a Bitbucket Cloud delivery given its `X-Event-Key` value.
pub fn parse(event: &str, body: &[u8]) -> Result<ParsedHook, HookError> {
    let action = match event {
        "repo:push" => return parse_push(body).map(ParsedHook::Event),
        "pullrequest:created" => PullRequestAction::Opened,
        "pullrequest:updated" => PullRequestAction::Synchronize,
        "pullrequest:fulfilled" => PullRequestAction::Merged,
        "pullrequest:rejected" => PullRequestAction::Closed,
        other => return Err(HookError::omitted(format!("event '{other}'"))),
    };
    parse_pull_request(action, body).map(ParsedHook::Event)
}

fn parse_push(body: &[u8]) -> Result<ChangeEvent, HookError> {
    let payload: PushEvent = decode(body)?;
    let Some(change) = payload.push.changes.into_iter().next() else {
        return Err(HookError::Decode("push event without changes".into()));
    };
    let Some(new) = change.new else {
        return Err(HookError::omitted("ref deletion"));
    };

    let mut event = match new.kind.as_str() {
        "branch" => ChangeEvent::push(new.name, new.target.hash),
        "tag" | "annotated_tag" if change.old.is_none() => {
            let mut event = ChangeEvent::tag(new.name);
            event.commit = Some(new.target.hash);
            event
        }
        "tag" | "annotated_tag" => return Err(HookError::omitted("tag update")),
        other => return Err(HookError::omitted(format!("{other} change"))),
    };
    if event.kind == EventKind::Push {
        event.message = new.target.message;
        event.source_link = new.target.links.html.href;
    }
    event.author = payload.actor.into();
    event.repository_url = payload
        .repository
        .map(|r| r.links.html.href)
        .filter(|u| !u.is_empty());
    Ok(event)
}

fn parse_pull_request(action: PullRequestAction, body: &[u8]) -> Result<ChangeEvent, HookError> {
    let payload: PullRequestEvent = decode(body)?;
    let pr = payload.pullrequest;

    let mut event = ChangeEvent::new(EventKind::PullRequest);
    event.branch = Some(pr.destination.branch.name);
    event.commit = Some(pr.source.commit.hash);
    event.title = pr.title;
    event.message = pr.description;
    event.source_link = pr.links.html.href;
    event.author = payload.actor.into();
    event.repository_url = payload
        .repository
        .map(|r| r.links.html.href)
        .filter(|u| !u.is_empty());
    event.pull_request = Some(PullRequestInfo {
        number: pr.id,
        action,
        merged: action == PullRequestAction::Merged,
    });
    Ok(event)
}


#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::Rejection;

    const SHA: &str = "709d658dc5b6d6afcd46049c2f332ee3f515a67d";

    fn event(parsed: ParsedHook) -> ChangeEvent {
        match parsed {
            ParsedHook::Event(event) => event,
            ParsedHook::Ping => panic!("expected an event"),
        }
    }

    #[test]
    fn branch_push() {
        let body = fixtures::push("branch", "main", Some("1111111"), Some(SHA));
        let event = event(parse("repo:push", body.as_bytes()).unwrap());
        assert_eq!(event.kind, EventKind::Push);
        assert_eq!(event.branch.as_deref(), Some("main"));
        assert_eq!(event.commit.as_deref(), Some(SHA));
        assert_eq!(event.author.login, "jdoe");
        assert_eq!(event.repository_url.as_deref(), Some("https://bitbucket.org/acme/app"));
    }

    #[test]
    fn tag_creation_but_not_update_or_deletion() {
        let created = fixtures::push("tag", "v3", None, Some(SHA));
        let event = event(parse("repo:push", created.as_bytes()).unwrap());
        assert_eq!(event.tag.as_deref(), Some("v3"));
        assert_eq!(event.branch, None);

        let moved = fixtures::push("tag", "v3", Some("1111111"), Some(SHA));
        assert!(matches!(
            parse("repo:push", moved.as_bytes()),
            Err(HookError::Rejected(Rejection::Omitted(_)))
        ));

        let deleted = fixtures::push("branch", "old", Some(SHA), None);
        assert!(parse("repo:push", deleted.as_bytes()).is_err());
    }

    #[test]
    fn pull_request_events() {
        let body = fixtures::pull_request();
        let created = event(parse("pullrequest:created", body.as_bytes()).unwrap());
        assert_eq!(created.branch.as_deref(), Some("main"));
        assert_eq!(created.commit.as_deref(), Some("1e2a3b4c5d6e"));
        assert_eq!(created.author.login, "Jane Doe");
        assert_eq!(created.pull_request.unwrap().action, PullRequestAction::Opened);

        let merged = event(parse("pullrequest:fulfilled", body.as_bytes()).unwrap());
        assert!(merged.pull_request.unwrap().merged);

        assert!(parse("pullrequest:comment_created", body.as_bytes()).is_err());
    }
}
