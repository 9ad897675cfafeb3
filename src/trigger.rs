use chrono::Utc;
use tracing::{debug, info};

use crate::error::{HookError, StoreError};
use crate::provider::ProviderKind;
use crate::store::Store;
use crate::types::{ChangeEvent, ObjectMeta, Trigger, TriggerSpec, TriggerStatus, Watch};

const SHORT_SHA_LEN: usize = 7;

/// Where an accepted change was observed.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Origin {
    /// Host delivery; every accepted call yields its own trigger.
    Webhook,
    /// Poller detection; the name is derived from the commit.
    Poll,
}

/// `<watch>-<first 7 chars of sha>`.
pub fn poll_trigger_name(watch: &Watch, commit: &str) -> String {
    let short: String = commit.chars().take(SHORT_SHA_LEN).collect();
    format!("{}-{}", watch.metadata.name, short.to_ascii_lowercase())
}

pub fn build(watch: &Watch, provider: ProviderKind, event: ChangeEvent, origin: Origin) -> Trigger {
    let mut metadata = ObjectMeta::new(watch.metadata.namespace.clone(), "");
    metadata.labels = watch.spec.execution_labels.clone();
    match origin {
        Origin::Webhook => metadata.generate_name = format!("{}-", watch.metadata.name),
        Origin::Poll => {
            let commit = event.commit.as_deref().unwrap_or_default();
            metadata.name = poll_trigger_name(watch, commit);
        }
    }
    let repository_url = event
        .repository_url
        .clone()
        .filter(|url| !url.is_empty())
        .unwrap_or_else(|| watch.spec.repository_url.clone());
    Trigger {
        metadata,
        spec: TriggerSpec {
            watch: watch.key(),
            provider,
            repository_url,
            event,
            created_at: Utc::now(),
        },
        status: TriggerStatus::default(),
    }
}

/// Outcome of [`emit`].
#[derive(Debug)]
pub struct Emitted {
    pub trigger: Trigger,
    /// False when a poll detection found its trigger already stored.
    pub created: bool,
}

/// Persists the trigger for an accepted change. A repeated poll detection of
/// the same commit returns the trigger already stored.
pub async fn emit(
    triggers: &dyn Store<Trigger>,
    watch: &Watch,
    provider: ProviderKind,
    event: ChangeEvent,
    origin: Origin,
) -> Result<Emitted, HookError> {
    let trigger = build(watch, provider, event, origin);
    let key = (!trigger.metadata.name.is_empty()).then(|| trigger.metadata.key());
    match triggers.create(trigger).await {
        Ok(created) => {
            info!(
                watch = %watch.key(),
                trigger = %created.metadata.key(),
                kind = %created.spec.event.kind,
                commit = created.spec.event.commit.as_deref().unwrap_or_default(),
                "trigger created"
            );
            Ok(Emitted {
                trigger: created,
                created: true,
            })
        }
        Err(StoreError::AlreadyExists { .. }) if origin == Origin::Poll => {
            let key = key.ok_or_else(|| HookError::Config("poll trigger without name".into()))?;
            debug!(trigger = %key, "trigger already recorded");
            Ok(Emitted {
                trigger: triggers.get(&key).await?,
                created: false,
            })
        }
        Err(err) => Err(err.into()),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::store::InMemoryStore;
    use crate::types::{EventKind, WatchSpec, WatchStatus};

    fn watch() -> Watch {
        let mut spec = WatchSpec {
            repository_url: "https://github.com/acme/app".into(),
            push: true,
            enabled: true,
            ..Default::default()
        };
        spec.execution_labels.insert("pipeline".into(), "deploy".into());
        Watch {
            metadata: ObjectMeta::new("team-a", "app"),
            spec,
            status: WatchStatus::default(),
        }
    }

    #[tokio::test]
    async fn webhook_triggers_are_never_deduplicated() {
        let store = InMemoryStore::<Trigger>::new();
        let w = watch();
        let event = ChangeEvent::push("main", "9fceb02d0ae598e95dc970b74767f19372d61af8");

        let a = emit(&store, &w, ProviderKind::GitHub, event.clone(), Origin::Webhook)
            .await
            .unwrap()
            .trigger;
        let b = emit(&store, &w, ProviderKind::GitHub, event, Origin::Webhook)
            .await
            .unwrap()
            .trigger;
        assert_ne!(a.metadata.name, b.metadata.name);
        assert!(a.metadata.name.starts_with("app-"));
        assert_eq!(a.metadata.labels.get("pipeline").map(String::as_str), Some("deploy"));
        assert_eq!(a.spec.watch.to_string(), "team-a:app");
        assert_eq!(a.spec.event.kind, EventKind::Push);
        assert_eq!(a.spec.repository_url, "https://github.com/acme/app");
        assert_eq!(store.list().await.unwrap().len(), 2);
    }

    #[tokio::test]
    async fn every_webhook_delivery_gets_a_trigger() {
        let store = InMemoryStore::<Trigger>::new();
        let w = watch();
        let event = ChangeEvent::push("main", "9fceb02d0ae598e95dc970b74767f19372d61af8");

        for _ in 0..5000 {
            let emitted = emit(&store, &w, ProviderKind::GitHub, event.clone(), Origin::Webhook)
                .await
                .unwrap();
            assert!(emitted.created);
        }
        assert_eq!(store.list().await.unwrap().len(), 5000);
    }

    #[test]
    fn reported_repository_url_wins() {
        let w = watch();
        let mut event = ChangeEvent::push("main", "9fceb02d0ae598e95dc970b74767f19372d61af8");
        event.repository_url = Some("https://github.com/acme/app-fork".into());
        let t = build(&w, ProviderKind::GitHub, event.clone(), Origin::Webhook);
        assert_eq!(t.spec.repository_url, "https://github.com/acme/app-fork");

        event.repository_url = Some(String::new());
        let t = build(&w, ProviderKind::GitHub, event, Origin::Webhook);
        assert_eq!(t.spec.repository_url, "https://github.com/acme/app");
    }

    #[tokio::test]
    async fn poll_triggers_are_named_by_commit() {
        let store = InMemoryStore::<Trigger>::new();
        let w = watch();
        let event = ChangeEvent::push("main", "9FCEB02d0ae598e95dc970b74767f19372d61af8");

        let first = emit(&store, &w, ProviderKind::Polling, event.clone(), Origin::Poll).await.unwrap();
        let again = emit(&store, &w, ProviderKind::Polling, event, Origin::Poll).await.unwrap();
        assert_eq!(first.trigger.metadata.name, "app-9fceb02");
        assert!(first.created);
        assert!(!again.created);
        assert_eq!(first.trigger, again.trigger);
        assert_eq!(store.list().await.unwrap().len(), 1);
    }
}
