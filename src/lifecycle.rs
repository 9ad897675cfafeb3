//! Remote hook registration and commit-status propagation.
//!
//! Reacts to store changes: new watches get a hook, triggers whose handled
//! state moved get a commit status. Status is written back only after the
//! host call succeeded; failures are recorded on the watch and picked up
//! again by the reconciliation sweep.

use std::collections::HashSet;
use std::future::Future;
use std::sync::Arc;
use tokio::sync::broadcast::error::RecvError;
use tracing::{debug, info, warn};

use crate::credential::CredentialBroker;
use crate::error::{HookError, StoreError};
use crate::provider::{HookClient, ProviderRegistry};
use crate::store::{Change, ResourceStore, update_with_retry};
use crate::types::{CommitState, HookState, ObjectKey, Watch};

pub struct HookLifecycle {
    store: ResourceStore,
    registry: ProviderRegistry,
    broker: Arc<CredentialBroker>,
    registering: parking_lot::Mutex<HashSet<ObjectKey>>,
}

/// Marks a watch as `Registering` until dropped.
struct InFlight<'a> {
    set: &'a parking_lot::Mutex<HashSet<ObjectKey>>,
    key: ObjectKey,
}

impl Drop for InFlight<'_> {
    fn drop(&mut self) {
        self.set.lock().remove(&self.key);
    }
}

/// Watches the change stream should register right away. Failed attempts
/// carry `last_error` and wait for the sweep.
fn needs_registration(watch: &Watch) -> bool {
    watch.status.hook_state == HookState::Unregistered && watch.status.last_error.is_none()
}

impl HookLifecycle {
    pub fn new(store: ResourceStore, registry: ProviderRegistry, broker: Arc<CredentialBroker>) -> Self {
        Self {
            store,
            registry,
            broker,
            registering: parking_lot::Mutex::new(HashSet::new()),
        }
    }

    pub fn store(&self) -> &ResourceStore {
        &self.store
    }

    pub fn registry(&self) -> &ProviderRegistry {
        &self.registry
    }

    pub fn broker(&self) -> &Arc<CredentialBroker> {
        &self.broker
    }

    /// In-memory state for a watch that is mid-registration.
    pub fn hook_state(&self, watch: &Watch) -> HookState {
        if self.registering.lock().contains(&watch.key()) {
            HookState::Registering
        } else {
            watch.status.hook_state
        }
    }

    fn claim(&self, key: &ObjectKey) -> Option<InFlight<'_>> {
        self.registering.lock().insert(key.clone()).then(|| InFlight {
            set: &self.registering,
            key: key.clone(),
        })
    }

    /// Registers the remote hook for a watch unless one is already live.
    ///
    /// Returns `Unregistered` for watches whose host takes no hooks (polling).
    pub async fn ensure_hook(&self, key: &ObjectKey) -> Result<HookState, HookError> {
        let watch = self.store.watches.get(key).await?;
        self.ensure_hook_for(&watch).await
    }

    /// Like [`ensure_hook`](Self::ensure_hook), starting from a watch the
    /// caller already read. The record is read again once claimed.
    async fn ensure_hook_for(&self, seen: &Watch) -> Result<HookState, HookError> {
        let key = &seen.key();
        if seen.has_registered_hook() {
            return Ok(HookState::Registered);
        }
        let client = match self.registry.client_for(seen) {
            Ok(client) => client,
            Err(err) => return self.record_failure(key, err).await,
        };
        if !client.supports_hooks() {
            debug!(watch = %key, provider = %client.kind(), "provider takes no hooks");
            return Ok(HookState::Unregistered);
        }
        let Some(_in_flight) = self.claim(key) else {
            return Ok(HookState::Registering);
        };
        // Another caller may have registered between our read and the claim.
        let watch = self.store.watches.get(key).await?;
        if watch.has_registered_hook() {
            return Ok(HookState::Registered);
        }

        let token = match self.broker.token_for(&watch, client.kind()).await {
            Ok(token) => token,
            Err(err) => return self.record_failure(key, err).await,
        };
        let registration = match client.create_hook(&watch, &token).await {
            Ok(registration) => registration,
            Err(err) => return self.record_failure(key, err).await,
        };

        let first_commit = match watch.status.first_commit {
            Some(_) => None,
            None => self.first_commit(client.as_ref(), &watch, &token).await,
        };
        update_with_retry(self.store.watches.as_ref(), key, |w| {
            w.status.hook_state = HookState::Registered;
            w.status.hook_id = Some(registration.id.clone());
            w.status.token = Some(registration.token.clone());
            w.status.last_error = None;
            if w.status.first_commit.is_none() {
                w.status.first_commit = first_commit.clone();
            }
            true
        })
        .await?;
        info!(watch = %key, provider = %client.kind(), hook_id = %registration.id, "hook registered");
        Ok(HookState::Registered)
    }

    async fn record_failure(&self, key: &ObjectKey, err: HookError) -> Result<HookState, HookError> {
        warn!(watch = %key, error = %err, retryable = err.is_retryable(), "hook registration failed");
        let message = err.to_string();
        update_with_retry(self.store.watches.as_ref(), key, |w| {
            if w.status.hook_state == HookState::Unregistered
                && w.status.last_error.as_deref() == Some(message.as_str())
            {
                return false;
            }
            w.status.hook_state = HookState::Unregistered;
            w.status.last_error = Some(message.clone());
            true
        })
        .await?;
        Err(err)
    }

    async fn first_commit(&self, client: &dyn HookClient, watch: &Watch, token: &str) -> Option<String> {
        watch.spec.branch.as_ref()?;
        match client.branch_head(watch, token).await {
            Ok(head) => head,
            Err(err) => {
                debug!(watch = %watch.key(), error = %err, "could not resolve first commit");
                None
            }
        }
    }

    /// Deletes the remote hook, then the watch. The record stays when the
    /// host refuses the deletion.
    pub async fn remove_watch(&self, key: &ObjectKey) -> Result<Watch, HookError> {
        let watch = match self.store.watches.get(key).await {
            Ok(watch) => watch,
            Err(StoreError::NotFound { .. }) => return Err(HookError::WatchNotFound(key.to_string())),
            Err(err) => return Err(err.into()),
        };
        // The hook may exist without a recorded id; deletion matches by URL.
        match self.registry.client_for(&watch) {
            Ok(client) if client.supports_hooks() => {
                let token = self.broker.token_for(&watch, client.kind()).await?;
                client.delete_hook(&watch, &token).await?;
                info!(watch = %key, provider = %client.kind(), "hook removed");
            }
            Ok(_) => {}
            Err(err) => debug!(watch = %key, error = %err, "no provider, no remote hook to remove"),
        }
        Ok(self.store.watches.delete(key).await?)
    }

    /// Reports the trigger's handled state as a commit status when it differs
    /// from what was last applied. Returns whether the host was called.
    pub async fn sync_trigger_status(&self, key: &ObjectKey) -> Result<bool, HookError> {
        let trigger = self.store.triggers.get(key).await?;
        let desired = CommitState::from_handled(trigger.status.handled);
        if trigger.status.applied_status == Some(desired) {
            return Ok(false);
        }
        if trigger.spec.event.commit.as_deref().is_none_or(str::is_empty) {
            debug!(trigger = %key, "no commit to report status on");
            return Ok(false);
        }
        let watch = match self.store.watches.get(&trigger.spec.watch).await {
            Ok(watch) => watch,
            Err(StoreError::NotFound { .. }) => {
                debug!(trigger = %key, watch = %trigger.spec.watch, "watch gone, status not reported");
                return Ok(false);
            }
            Err(err) => return Err(err.into()),
        };

        let client = self.registry.get(trigger.spec.provider)?;
        let token = self.broker.token_for(&watch, client.kind()).await?;
        client.update_status(&trigger, &token).await?;
        update_with_retry(self.store.triggers.as_ref(), key, |t| {
            if t.status.applied_status == Some(desired) {
                return false;
            }
            t.status.applied_status = Some(desired);
            true
        })
        .await?;
        info!(trigger = %key, provider = %client.kind(), state = ?desired, "commit status reported");
        Ok(true)
    }

    /// Follows watch and trigger changes until `shutdown` resolves.
    pub async fn run(self: Arc<Self>, shutdown: impl Future<Output = ()> + Send) {
        let mut watches = self.store.watches.watch();
        let mut triggers = self.store.triggers.watch();
        tokio::pin!(shutdown);
        info!("hook lifecycle started");

        loop {
            tokio::select! {
                _ = &mut shutdown => break,
                change = watches.recv() => match change {
                    Ok(Change::Applied(watch)) if needs_registration(&watch) => {
                        let this = self.clone();
                        tokio::spawn(async move {
                            if let Err(err) = this.ensure_hook_for(&watch).await {
                                debug!(watch = %watch.key(), error = %err, "registration deferred to sweep");
                            }
                        });
                    }
                    Ok(_) => {}
                    Err(RecvError::Lagged(skipped)) => {
                        warn!(skipped, "watch changes lagged, sweep will catch up");
                    }
                    Err(RecvError::Closed) => break,
                },
                change = triggers.recv() => match change {
                    Ok(Change::Applied(trigger)) => {
                        let this = self.clone();
                        tokio::spawn(async move {
                            let key = trigger.metadata.key();
                            if let Err(err) = this.sync_trigger_status(&key).await {
                                warn!(trigger = %key, error = %err, "commit status update failed");
                            }
                        });
                    }
                    Ok(Change::Deleted(_)) => {}
                    Err(RecvError::Lagged(skipped)) => {
                        warn!(skipped, "trigger changes lagged, sweep will catch up");
                    }
                    Err(RecvError::Closed) => break,
                },
            }
        }
        info!("hook lifecycle stopped");
    }
}
