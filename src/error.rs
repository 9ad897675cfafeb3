//! Error taxonomy for hook ingestion, hook lifecycle and polling.
//!
//! Every error is scoped to a single inbound request or a single Watch; none of
//! them is fatal to the process. [`HookError::status_code`] maps an error to the
//! HTTP status reported to a webhook sender, and [`HookError::is_retryable`]
//! tells lifecycle/polling callers whether the next reconciliation tick may
//! try again.

use rocket::http::Status;
use thiserror::Error;

use crate::provider::ProviderKind;

/// Errors raised by a [`crate::store::Store`] implementation.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum StoreError {
    #[error("{kind} {key} not found")]
    NotFound { kind: &'static str, key: String },

    #[error("{kind} {key} already exists")]
    AlreadyExists { kind: &'static str, key: String },

    /// The caller's copy is stale: `resource_version` no longer matches.
    #[error("{kind} {key} was modified concurrently")]
    Conflict { kind: &'static str, key: String },

    #[error("store unavailable: {0}")]
    Unavailable(String),
}

pub type StoreResult<T> = Result<T, StoreError>;

/// Why a change event did not produce a trigger.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum Rejection {
    #[error("trigger for event '{0}' is disabled")]
    EventDisabled(&'static str),

    #[error("tag '{0}' did not match the include pattern")]
    TagNotIncluded(String),

    #[error("tag '{0}' matched the exclude pattern")]
    TagExcluded(String),

    #[error("webhook receiver is disabled")]
    ReceiverDisabled,

    /// The host sent an event or action this system does not turn into triggers.
    #[error("{0} omitted")]
    Omitted(String),
}

#[derive(Debug, Error)]
pub enum HookError {
    /// The payload could not be attributed to the claimed host.
    #[error("invalid signature: {message}")]
    Authentication {
        provider: ProviderKind,
        message: String,
    },

    #[error(transparent)]
    Rejected(#[from] Rejection),

    #[error("undecodable payload: {0}")]
    Decode(String),

    #[error("remote API responded {status}: {body}")]
    RemoteApi { status: u16, body: String },

    #[error("remote host unavailable: {0}")]
    RemoteUnavailable(String),

    #[error("credential refresh failed: {0}")]
    CredentialRefresh(String),

    #[error("configuration error: {0}")]
    Config(String),

    #[error("no hook client for provider '{0}'")]
    UnknownProvider(String),

    #[error("watch '{0}' not found")]
    WatchNotFound(String),

    #[error(transparent)]
    Store(#[from] StoreError),
}

impl HookError {
    pub fn decode(err: impl std::fmt::Display) -> Self {
        HookError::Decode(err.to_string())
    }

    pub fn omitted(what: impl Into<String>) -> Self {
        HookError::Rejected(Rejection::Omitted(what.into()))
    }

    /// HTTP status reported to the inbound webhook sender.
    pub fn status_code(&self) -> Status {
        match self {
            // Bitbucket Server senders expect 422 on a bad signature.
            HookError::Authentication {
                provider: ProviderKind::BitbucketServer,
                ..
            } => Status::UnprocessableEntity,
            HookError::Authentication { .. } => Status::Unauthorized,
            HookError::Rejected(Rejection::ReceiverDisabled) => Status::UnprocessableEntity,
            HookError::Rejected(_) => Status::new(451),
            HookError::Decode(_) => Status::BadRequest,
            HookError::UnknownProvider(_) | HookError::WatchNotFound(_) => Status::NotFound,
            HookError::Store(StoreError::NotFound { .. }) => Status::NotFound,
            HookError::RemoteApi { .. }
            | HookError::RemoteUnavailable(_)
            | HookError::CredentialRefresh(_) => Status::BadGateway,
            HookError::Config(_) | HookError::Store(_) => Status::InternalServerError,
        }
    }

    /// Whether re-invoking the failed lifecycle or polling operation later may succeed.
    pub fn is_retryable(&self) -> bool {
        matches!(
            self,
            HookError::RemoteApi { .. }
                | HookError::RemoteUnavailable(_)
                | HookError::CredentialRefresh(_)
                | HookError::Store(StoreError::Conflict { .. })
                | HookError::Store(StoreError::Unavailable(_))
        )
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn signature_failures_map_per_host() {
        let server = HookError::Authentication {
            provider: ProviderKind::BitbucketServer,
            message: "bad".into(),
        };
        let github = HookError::Authentication {
            provider: ProviderKind::GitHub,
            message: "bad".into(),
        };
        assert_eq!(server.status_code(), Status::UnprocessableEntity);
        assert_eq!(github.status_code(), Status::Unauthorized);
    }

    #[test]
    fn policy_rejections_are_451_except_disabled_receiver() {
        let disabled = HookError::from(Rejection::EventDisabled("push"));
        assert_eq!(disabled.status_code().code, 451);
        let receiver = HookError::from(Rejection::ReceiverDisabled);
        assert_eq!(receiver.status_code(), Status::UnprocessableEntity);
        assert!(!disabled.is_retryable());
    }

    #[test]
    fn only_remote_failures_are_retryable() {
        assert!(HookError::RemoteApi { status: 502, body: String::new() }.is_retryable());
        assert!(HookError::RemoteUnavailable("timeout".into()).is_retryable());
        assert!(HookError::CredentialRefresh("denied".into()).is_retryable());
        assert!(!HookError::Decode("eof".into()).is_retryable());
        assert!(!HookError::Config("bad regex".into()).is_retryable());
    }
}
