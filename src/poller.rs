//! Branch polling and the reconciliation sweep.
//!
//! One sequential loop drives both: every poll tick resolves the head of each
//! polled watch's branch, every reconcile tick re-drives hook registration and
//! pending commit statuses.

use std::future::Future;
use std::sync::Arc;
use std::time::Duration;
use tokio::time::MissedTickBehavior;
use tracing::{debug, info, warn};

use crate::error::HookError;
use crate::lifecycle::HookLifecycle;
use crate::policy;
use crate::store::{ResourceStore, update_with_retry};
use crate::trigger::{self, Origin};
use crate::types::{ChangeEvent, CommitState, ObjectKey, Trigger, Watch};

pub struct Poller {
    lifecycle: Arc<HookLifecycle>,
}

enum Tick {
    Poll,
    Reconcile,
}

impl Poller {
    pub fn new(lifecycle: Arc<HookLifecycle>) -> Self {
        Self { lifecycle }
    }

    fn store(&self) -> &ResourceStore {
        self.lifecycle.store()
    }

    /// Polls every watch that tracks a branch without a live hook. Returns the
    /// number of triggers emitted; per-watch failures are logged and skipped.
    pub async fn poll_once(&self) -> usize {
        let watches = match self.store().watches.list().await {
            Ok(watches) => watches,
            Err(err) => {
                warn!(error = %err, "cannot list watches for polling");
                return 0;
            }
        };
        let mut emitted = 0;
        for watch in watches.iter().filter(|w| w.uses_polling()) {
            match self.poll_watch(watch).await {
                Ok(Some(_)) => emitted += 1,
                Ok(None) => {}
                Err(err) => {
                    warn!(watch = %watch.key(), error = %err, retryable = err.is_retryable(), "poll failed")
                }
            }
        }
        emitted
    }

    /// Returns the trigger when this observation created one.
    pub async fn poll_watch(&self, watch: &Watch) -> Result<Option<Trigger>, HookError> {
        let registry = self.lifecycle.registry();
        let kind = registry.resolve(watch).ok_or_else(|| {
            HookError::UnknownProvider(format!("none for '{}'", watch.spec.repository_url))
        })?;
        let client = registry.get(kind)?;
        let token = self.lifecycle.broker().token_for(watch, kind).await?;
        let branch = watch.spec.branch.clone().unwrap_or_default();

        let Some(head) = client.branch_head(watch, &token).await? else {
            debug!(watch = %watch.key(), branch = %branch, "branch not found");
            return Ok(None);
        };
        let key = watch.key();
        match watch.status.last_commit.as_deref() {
            Some(previous) if previous == head => return Ok(None),
            Some(_) => {}
            None => {
                self.record(&key, &head).await?;
                info!(watch = %key, branch = %branch, commit = %head, "baseline recorded");
                return Ok(None);
            }
        }

        let event = ChangeEvent::push(branch.as_str(), head.as_str());
        let emitted = match policy::evaluate(watch, &event) {
            Ok(()) => {
                let emitted = trigger::emit(
                    self.store().triggers.as_ref(),
                    watch,
                    kind,
                    event,
                    Origin::Poll,
                )
                .await?;
                emitted.created.then_some(emitted.trigger)
            }
            Err(HookError::Rejected(reason)) => {
                info!(watch = %key, commit = %head, reason = %reason, "polled change rejected");
                None
            }
            Err(err) => return Err(err),
        };
        self.record(&key, &head).await?;
        Ok(emitted)
    }

    async fn record(&self, key: &ObjectKey, head: &str) -> Result<(), HookError> {
        update_with_retry(self.store().watches.as_ref(), key, |w| {
            if w.status.last_commit.as_deref() == Some(head) {
                return false;
            }
            w.status.last_commit = Some(head.to_string());
            if w.status.first_commit.is_none() {
                w.status.first_commit = Some(head.to_string());
            }
            true
        })
        .await?;
        Ok(())
    }

    /// Retries hook registration for watches without one, and commit statuses
    /// that never reached their host.
    pub async fn reconcile_once(&self) {
        match self.store().watches.list().await {
            Ok(watches) => {
                for watch in watches.iter().filter(|w| !w.has_registered_hook()) {
                    if let Err(err) = self.lifecycle.ensure_hook(&watch.key()).await {
                        debug!(watch = %watch.key(), error = %err, "hook still unregistered");
                    }
                }
            }
            Err(err) => warn!(error = %err, "cannot list watches for reconciliation"),
        }

        match self.store().triggers.list().await {
            Ok(triggers) => {
                let pending = triggers
                    .iter()
                    .filter(|t| t.status.applied_status != Some(CommitState::from_handled(t.status.handled)));
                for trigger in pending {
                    let key = trigger.metadata.key();
                    if let Err(err) = self.lifecycle.sync_trigger_status(&key).await {
                        warn!(trigger = %key, error = %err, "commit status still pending");
                    }
                }
            }
            Err(err) => warn!(error = %err, "cannot list triggers for reconciliation"),
        }
    }

    /// Runs until `shutdown` resolves; an in-progress tick is abandoned.
    pub async fn run(
        self: Arc<Self>,
        poll_every: Duration,
        reconcile_every: Duration,
        shutdown: impl Future<Output = ()> + Send,
    ) {
        let mut poll = tokio::time::interval(poll_every);
        let mut reconcile = tokio::time::interval(reconcile_every);
        poll.set_missed_tick_behavior(MissedTickBehavior::Skip);
        reconcile.set_missed_tick_behavior(MissedTickBehavior::Skip);
        tokio::pin!(shutdown);
        info!(?poll_every, ?reconcile_every, "poller started");

        loop {
            let tick = tokio::select! {
                _ = &mut shutdown => break,
                _ = poll.tick() => Tick::Poll,
                _ = reconcile.tick() => Tick::Reconcile,
            };
            let work = async {
                match tick {
                    Tick::Poll => {
                        let emitted = self.poll_once().await;
                        if emitted > 0 {
                            info!(emitted, "poll tick emitted triggers");
                        }
                    }
                    Tick::Reconcile => self.reconcile_once().await,
                }
            };
            tokio::select! {
                _ = &mut shutdown => break,
                _ = work => {}
            }
        }
        info!("poller stopped");
    }
}
