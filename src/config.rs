use serde::{Deserialize, Serialize};
use std::fs;
use std::future::Future;
use std::path::{Path, PathBuf};
use std::time::Duration;
use tokio::sync::broadcast::error::RecvError;
use tracing::{debug, error, info};

use crate::credential::OAuthApp;
use crate::error::HookError;
use crate::provider::{bitbucket_cloud, github, gitlab};
use crate::store::{ResourceStore, apply};
use crate::types::{Credential, Watch};

const DEFAULT_PORT: u16 = 8888;
const DEFAULT_INTERVAL_SECS: u64 = 30;
const DEFAULT_HTTP_TIMEOUT_SECS: u64 = 15;
const DEFAULT_SEED_FILE: &str = "gitwatcher.json";

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LogFormat {
    Pretty,
    Json,
}

#[derive(Debug, Clone)]
pub struct Settings {
    pub port: u16,
    pub admin_token: String,
    /// Public base URL hosts deliver webhooks to.
    pub webhook_base_url: String,
    pub poll_interval: Duration,
    pub reconcile_interval: Duration,
    pub http_timeout: Duration,
    pub github_api_url: String,
    pub gitlab_api_url: String,
    pub gitlab_oauth: Option<OAuthApp>,
    pub bitbucket_cloud_api_url: String,
    pub bitbucket_cloud_oauth: Option<OAuthApp>,
    /// Bitbucket Server is only enabled when its URL is set.
    pub bitbucket_server_url: Option<String>,
    pub seed_file: PathBuf,
    pub log_format: LogFormat,
}

impl Settings {
    pub fn from_env() -> Result<Self, HookError> {
        Self::from_lookup(|name| std::env::var(name).ok())
    }

    pub fn from_lookup(lookup: impl Fn(&str) -> Option<String>) -> Result<Self, HookError> {
        let var = |name: &str| lookup(name).map(|v| v.trim().to_string()).filter(|v| !v.is_empty());
        let secs = |name: &str, default: u64| -> Result<Duration, HookError> {
            match var(name) {
                None => Ok(Duration::from_secs(default)),
                Some(raw) => match raw.parse::<u64>() {
                    Ok(0) | Err(_) => Err(HookError::Config(format!("{name} must be a positive number of seconds, got '{raw}'"))),
                    Ok(n) => Ok(Duration::from_secs(n)),
                },
            }
        };
        let oauth = |prefix: &str, default_token_url: &str| {
            let client_id = var(&format!("{prefix}_CLIENT_ID"))?;
            let client_secret = var(&format!("{prefix}_CLIENT_SECRET"))?;
            Some(OAuthApp {
                client_id,
                client_secret,
                token_url: var(&format!("{prefix}_TOKEN_URL")).unwrap_or_else(|| default_token_url.to_string()),
            })
        };

        let port = match var("PORT") {
            None => DEFAULT_PORT,
            Some(raw) => raw
                .parse()
                .map_err(|_| HookError::Config(format!("PORT must be a port number, got '{raw}'")))?,
        };
        let log_format = match var("LOG_FORMAT").as_deref() {
            None | Some("pretty") => LogFormat::Pretty,
            Some("json") => LogFormat::Json,
            Some(other) => {
                return Err(HookError::Config(format!("LOG_FORMAT must be 'pretty' or 'json', got '{other}'")));
            }
        };

        Ok(Self {
            port,
            admin_token: var("ADMIN_TOKEN").unwrap_or_default(),
            webhook_base_url: var("WEBHOOK_BASE_URL").unwrap_or_else(|| format!("http://localhost:{port}")),
            poll_interval: secs("POLL_INTERVAL_SECS", DEFAULT_INTERVAL_SECS)?,
            reconcile_interval: secs("RECONCILE_INTERVAL_SECS", DEFAULT_INTERVAL_SECS)?,
            http_timeout: secs("HTTP_TIMEOUT_SECS", DEFAULT_HTTP_TIMEOUT_SECS)?,
            github_api_url: var("GITHUB_API_URL").unwrap_or_else(|| github::DEFAULT_API_URL.to_string()),
            gitlab_api_url: var("GITLAB_API_URL").unwrap_or_else(|| gitlab::DEFAULT_API_URL.to_string()),
            gitlab_oauth: oauth("GITLAB", gitlab::DEFAULT_TOKEN_URL),
            bitbucket_cloud_api_url: var("BITBUCKET_CLOUD_API_URL")
                .unwrap_or_else(|| bitbucket_cloud::DEFAULT_API_URL.to_string()),
            bitbucket_cloud_oauth: oauth("BITBUCKET_CLOUD", bitbucket_cloud::DEFAULT_TOKEN_URL),
            bitbucket_server_url: var("BITBUCKET_SERVER_URL"),
            seed_file: var("SEED_FILE").map(PathBuf::from).unwrap_or_else(|| PathBuf::from(DEFAULT_SEED_FILE)),
            log_format,
        })
    }
}

/// Watches and credentials persisted between restarts.
#[derive(Debug, Default, Serialize, Deserialize)]
pub struct Seed {
    #[serde(default)]
    pub watches: Vec<Watch>,
    #[serde(default)]
    pub credentials: Vec<Credential>,
}

/// A missing file is an empty seed; an unreadable one is an error.
pub fn load_seed(path: &Path) -> Result<Seed, HookError> {
    if !path.exists() {
        return Ok(Seed::default());
    }
    let data = fs::read_to_string(path)
        .map_err(|e| HookError::Config(format!("cannot read {}: {e}", path.display())))?;
    serde_json::from_str(&data).map_err(|e| HookError::Config(format!("invalid seed {}: {e}", path.display())))
}

pub async fn apply_seed(store: &ResourceStore, seed: Seed) -> Result<(), HookError> {
    let (watches, credentials) = (seed.watches.len(), seed.credentials.len());
    for credential in seed.credentials {
        apply(store.credentials.as_ref(), credential).await?;
    }
    for watch in seed.watches {
        apply(store.watches.as_ref(), watch).await?;
    }
    info!(watches, credentials, "seed loaded");
    Ok(())
}

/// Writes the current watches and credentials; failures are logged.
///
/// The file is replaced by rename, so concurrent saves never interleave.
pub async fn save_seed(store: &ResourceStore, path: &Path) -> bool {
    let seed = match (store.watches.list().await, store.credentials.list().await) {
        (Ok(watches), Ok(credentials)) => Seed { watches, credentials },
        (Err(err), _) | (_, Err(err)) => {
            error!(error = %err, "cannot snapshot store for seed");
            return false;
        }
    };
    let data = match serde_json::to_string_pretty(&seed) {
        Ok(data) => data,
        Err(err) => {
            error!(error = %err, "error serializing seed");
            return false;
        }
    };

    let staging = staging_path(path);
    let written = match tokio::fs::write(&staging, data).await {
        Ok(()) => tokio::fs::rename(&staging, path).await,
        Err(err) => Err(err),
    };
    match written {
        Ok(()) => true,
        Err(err) => {
            error!(path = %path.display(), error = %err, "error saving seed");
            let _ = tokio::fs::remove_file(&staging).await;
            false
        }
    }
}

fn staging_path(path: &Path) -> PathBuf {
    let mut name = path.file_name().unwrap_or_default().to_os_string();
    name.push(format!(".{}.tmp", uuid::Uuid::new_v4().simple()));
    path.with_file_name(name)
}

/// Saves the seed after every watch or credential change until `shutdown`
/// resolves. Refreshed tokens and hook ids reach disk without a clean exit.
pub async fn persist_changes(store: ResourceStore, path: PathBuf, shutdown: impl Future<Output = ()> + Send) {
    let mut watches = store.watches.watch();
    let mut credentials = store.credentials.watch();
    tokio::pin!(shutdown);

    loop {
        let changed = tokio::select! {
            _ = &mut shutdown => break,
            change = watches.recv() => change.map(drop),
            change = credentials.recv() => change.map(drop),
        };
        match changed {
            Ok(()) | Err(RecvError::Lagged(_)) => {}
            Err(RecvError::Closed) => break,
        }
        // One save covers everything already queued.
        while watches.try_recv().is_ok() || credentials.try_recv().is_ok() {}
        if save_seed(&store, &path).await {
            debug!(path = %path.display(), "seed saved");
        }
    }
}
