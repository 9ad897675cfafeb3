use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::fmt;

use crate::provider::ProviderKind;

pub type Labels = BTreeMap<String, String>;

/// Identity of a stored resource, rendered as `namespace:name`.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct ObjectKey {
    pub namespace: String,
    pub name: String,
}

impl ObjectKey {
    pub const DEFAULT_NAMESPACE: &'static str = "default";

    pub fn new(namespace: impl Into<String>, name: impl Into<String>) -> Self {
        Self {
            namespace: namespace.into(),
            name: name.into(),
        }
    }

    /// Parses `namespace:name`; a bare `name` lands in the default namespace.
    pub fn parse(raw: &str) -> Option<Self> {
        let raw = raw.trim();
        if raw.is_empty() {
            return None;
        }
        match raw.split_once(':') {
            Some((ns, name)) if !ns.is_empty() && !name.is_empty() => Some(Self::new(ns, name)),
            Some(_) => None,
            None => Some(Self::new(Self::DEFAULT_NAMESPACE, raw)),
        }
    }
}

impl fmt::Display for ObjectKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}:{}", self.namespace, self.name)
    }
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ObjectMeta {
    pub namespace: String,
    pub name: String,
    /// Prefix used by the store to name the object when `name` is empty.
    #[serde(default, skip_serializing_if = "String::is_empty")]
    pub generate_name: String,
    /// Bumped by the store on every write; used for optimistic concurrency.
    #[serde(default)]
    pub resource_version: u64,
    #[serde(default, skip_serializing_if = "BTreeMap::is_empty")]
    pub labels: Labels,
}

impl ObjectMeta {
    pub fn new(namespace: impl Into<String>, name: impl Into<String>) -> Self {
        Self {
            namespace: namespace.into(),
            name: name.into(),
            ..Default::default()
        }
    }

    pub fn key(&self) -> ObjectKey {
        ObjectKey::new(self.namespace.clone(), self.name.clone())
    }
}

// ---------------------------------------------------------------------------
// Watch
// ---------------------------------------------------------------------------

/// Desired state for a tracked repository and its trigger policy.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Watch {
    pub metadata: ObjectMeta,
    pub spec: WatchSpec,
    #[serde(default)]
    pub status: WatchStatus,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct WatchSpec {
    pub repository_url: String,
    /// Explicit host; inferred from the repository URL when absent.
    #[serde(default)]
    pub provider: Option<ProviderKind>,
    /// Credential used for hook management, status updates and polling.
    #[serde(default)]
    pub credential: Option<ObjectKey>,
    #[serde(default)]
    pub push: bool,
    #[serde(default)]
    pub tag: bool,
    #[serde(default)]
    pub pull_request: bool,
    #[serde(default)]
    pub tag_include_regexp: Option<String>,
    #[serde(default)]
    pub tag_exclude_regexp: Option<String>,
    /// Branch followed by the poller.
    #[serde(default)]
    pub branch: Option<String>,
    #[serde(default)]
    pub execution_labels: Labels,
    #[serde(default)]
    pub enabled: bool,
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub enum HookState {
    #[default]
    Unregistered,
    Registering,
    Registered,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct WatchStatus {
    #[serde(default)]
    pub hook_state: HookState,
    #[serde(default)]
    pub hook_id: Option<String>,
    /// Shared secret the host signs or echoes with every delivery.
    #[serde(default)]
    pub token: Option<String>,
    #[serde(default)]
    pub first_commit: Option<String>,
    #[serde(default)]
    pub last_commit: Option<String>,
    #[serde(default)]
    pub last_error: Option<String>,
}

impl Watch {
    pub fn key(&self) -> ObjectKey {
        self.metadata.key()
    }

    pub fn has_registered_hook(&self) -> bool {
        self.status.hook_state == HookState::Registered && self.status.hook_id.is_some()
    }

    /// Polling applies to watches that track a branch and have no live hook.
    pub fn uses_polling(&self) -> bool {
        self.spec.branch.as_deref().is_some_and(|b| !b.is_empty()) && !self.has_registered_hook()
    }

    pub fn is_event_enabled(&self, kind: EventKind) -> bool {
        match kind {
            EventKind::Push => self.spec.push,
            EventKind::Tag => self.spec.tag,
            EventKind::PullRequest => self.spec.pull_request,
        }
    }
}

// ---------------------------------------------------------------------------
// Credential
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Credential {
    pub metadata: ObjectMeta,
    #[serde(default)]
    pub provider: Option<ProviderKind>,
    pub access_token: String,
    #[serde(default)]
    pub refresh_token: Option<String>,
    /// RFC 3339 timestamp, as handed out by the host's token endpoint.
    #[serde(default)]
    pub expiry: Option<String>,
}

// ---------------------------------------------------------------------------
// Change events and triggers
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum EventKind {
    Push,
    Tag,
    PullRequest,
}

impl EventKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            EventKind::Push => "push",
            EventKind::Tag => "tag",
            EventKind::PullRequest => "pull_request",
        }
    }
}

impl fmt::Display for EventKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum PullRequestAction {
    Opened,
    Synchronize,
    Reopened,
    Closed,
    Merged,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Author {
    #[serde(default)]
    pub login: String,
    #[serde(default)]
    pub email: String,
    #[serde(default)]
    pub avatar: String,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct PullRequestInfo {
    pub number: u64,
    pub action: PullRequestAction,
    #[serde(default)]
    pub merged: bool,
}

/// Canonical, host-independent description of a repository change.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ChangeEvent {
    pub kind: EventKind,
    #[serde(default)]
    pub branch: Option<String>,
    #[serde(default)]
    pub tag: Option<String>,
    #[serde(default)]
    pub commit: Option<String>,
    #[serde(default)]
    pub author: Author,
    #[serde(default)]
    pub message: String,
    #[serde(default)]
    pub title: String,
    #[serde(default)]
    pub source_link: String,
    /// Repository URL reported by the host, when it differs from the watch.
    #[serde(default)]
    pub repository_url: Option<String>,
    #[serde(default)]
    pub pull_request: Option<PullRequestInfo>,
}

impl ChangeEvent {
    pub fn new(kind: EventKind) -> Self {
        Self {
            kind,
            branch: None,
            tag: None,
            commit: None,
            author: Author::default(),
            message: String::new(),
            title: String::new(),
            source_link: String::new(),
            repository_url: None,
            pull_request: None,
        }
    }

    pub fn push(branch: impl Into<String>, commit: impl Into<String>) -> Self {
        Self {
            branch: Some(branch.into()),
            commit: Some(commit.into()),
            ..Self::new(EventKind::Push)
        }
    }

    pub fn tag(name: impl Into<String>) -> Self {
        let name = name.into();
        Self {
            message: format!("tag {name} is created"),
            tag: Some(name),
            ..Self::new(EventKind::Tag)
        }
    }
}

/// Externally visible record of an accepted change, consumed downstream.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Trigger {
    pub metadata: ObjectMeta,
    pub spec: TriggerSpec,
    #[serde(default)]
    pub status: TriggerStatus,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct TriggerSpec {
    /// Originating watch, `namespace:name`.
    pub watch: ObjectKey,
    pub provider: ProviderKind,
    pub repository_url: String,
    #[serde(flatten)]
    pub event: ChangeEvent,
    pub created_at: DateTime<Utc>,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct TriggerStatus {
    /// Set by downstream automation: `Some(true)` succeeded, `Some(false)` failed,
    /// `None` still running.
    #[serde(default)]
    pub handled: Option<bool>,
    /// Last handled-state successfully reported to the host.
    #[serde(default)]
    pub applied_status: Option<CommitState>,
    /// Link posted with commit statuses (build log location).
    #[serde(default)]
    pub status_url: Option<String>,
}

/// Host-independent commit status vocabulary.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub enum CommitState {
    Pending,
    Success,
    Failure,
}

impl CommitState {
    pub fn from_handled(handled: Option<bool>) -> Self {
        match handled {
            Some(true) => CommitState::Success,
            Some(false) => CommitState::Failure,
            None => CommitState::Pending,
        }
    }

    pub fn description(&self) -> &'static str {
        match self {
            CommitState::Pending => "This build is pending",
            CommitState::Success => "This build is successful",
            CommitState::Failure => "This build has failed",
        }
    }
}

// ---------------------------------------------------------------------------
// HTTP surface
// ---------------------------------------------------------------------------

#[derive(Debug, Serialize, Deserialize)]
pub struct ApiError {
    #[serde(rename = "type")]
    pub kind: String,
    pub code: u16,
    pub message: String,
}

impl ApiError {
    pub fn new(code: u16, message: impl Into<String>) -> Self {
        Self {
            kind: "error".to_string(),
            code,
            message: message.into(),
        }
    }
}

#[derive(Debug, Serialize)]
pub struct ApiResponse {
    pub success: bool,
    pub message: String,
}

#[derive(Debug, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct WatchRequest {
    #[serde(default)]
    pub namespace: Option<String>,
    pub name: String,
    #[serde(flatten)]
    pub spec: WatchSpec,
}

#[derive(Debug, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct CredentialRequest {
    #[serde(default)]
    pub namespace: Option<String>,
    pub name: String,
    #[serde(default)]
    pub provider: Option<ProviderKind>,
    pub access_token: String,
    #[serde(default)]
    pub refresh_token: Option<String>,
    #[serde(default)]
    pub expiry: Option<String>,
}

#[derive(Debug, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct HandledRequest {
    pub handled: Option<bool>,
    #[serde(default)]
    pub status_url: Option<String>,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn object_key_parsing() {
        assert_eq!(
            ObjectKey::parse("team-a:frontend"),
            Some(ObjectKey::new("team-a", "frontend"))
        );
        assert_eq!(
            ObjectKey::parse("frontend"),
            Some(ObjectKey::new("default", "frontend"))
        );
        assert_eq!(ObjectKey::parse(":frontend"), None);
        assert_eq!(ObjectKey::parse(""), None);
        assert_eq!(ObjectKey::new("a", "b").to_string(), "a:b");
    }

    #[test]
    fn polling_requires_branch_and_no_live_hook() {
        let mut watch = Watch {
            metadata: ObjectMeta::new("default", "w"),
            spec: WatchSpec {
                branch: Some("main".into()),
                ..Default::default()
            },
            status: WatchStatus::default(),
        };
        assert!(watch.uses_polling());

        watch.status.hook_state = HookState::Registered;
        watch.status.hook_id = Some("42".into());
        assert!(!watch.uses_polling());

        watch.status = WatchStatus::default();
        watch.spec.branch = None;
        assert!(!watch.uses_polling());
    }

    #[test]
    fn handled_maps_to_commit_state() {
        assert_eq!(CommitState::from_handled(Some(true)), CommitState::Success);
        assert_eq!(CommitState::from_handled(Some(false)), CommitState::Failure);
        assert_eq!(CommitState::from_handled(None), CommitState::Pending);
    }
}
