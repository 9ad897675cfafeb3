use chrono::DateTime;
use rocket::{
    State, delete, get,
    http::Status,
    post, put,
    request::{self, FromRequest, Request},
    serde::json::Json,
};
use tracing::info;

use crate::AppState;
use crate::config::save_seed;
use crate::error::StoreError;
use crate::policy;
use crate::store::{apply, update_with_retry};
use crate::types::{
    ApiError, ApiResponse, Credential, CredentialRequest, HandledRequest, ObjectKey, ObjectMeta,
    Trigger, Watch, WatchRequest, WatchStatus,
};
use crate::webhook::error_response;

const TOKEN_HEADER: &str = "x-admin-token";

type AdminResult<T> = Result<Json<T>, (Status, Json<ApiError>)>;

// Admin token guard
pub struct AdminToken;

#[rocket::async_trait]
impl<'r> FromRequest<'r> for AdminToken {
    type Error = ();

    async fn from_request(request: &'r Request<'_>) -> request::Outcome<Self, Self::Error> {
        let admin_token = request
            .rocket()
            .state::<AppState>()
            .map(|state| state.settings.admin_token.as_str())
            .unwrap_or_default();
        if admin_token.is_empty() {
            return request::Outcome::Error((Status::InternalServerError, ()));
        }

        match request.headers().get_one(TOKEN_HEADER) {
            Some(token) if token == admin_token => request::Outcome::Success(AdminToken),
            _ => request::Outcome::Error((Status::Unauthorized, ())),
        }
    }
}

fn bad_request(message: impl Into<String>) -> (Status, Json<ApiError>) {
    (Status::BadRequest, Json(ApiError::new(Status::BadRequest.code, message)))
}

fn store_failure(err: StoreError) -> (Status, Json<ApiError>) {
    let status = match err {
        StoreError::NotFound { .. } => Status::NotFound,
        StoreError::Conflict { .. } | StoreError::AlreadyExists { .. } => Status::Conflict,
        StoreError::Unavailable(_) => Status::ServiceUnavailable,
    };
    (status, Json(ApiError::new(status.code, err.to_string())))
}

fn key_for(namespace: Option<String>, name: String) -> Result<ObjectKey, (Status, Json<ApiError>)> {
    let namespace = namespace
        .filter(|ns| !ns.is_empty())
        .unwrap_or_else(|| ObjectKey::DEFAULT_NAMESPACE.to_string());
    if name.is_empty() || name.contains(':') || namespace.contains(':') {
        return Err(bad_request("name and namespace must be non-empty and must not contain ':'"));
    }
    Ok(ObjectKey::new(namespace, name))
}

/// List all watches
#[get("/watches")]
pub async fn list_watches(_admin: AdminToken, state: &State<AppState>) -> AdminResult<Vec<Watch>> {
    let mut watches = state.store().watches.list().await.map_err(store_failure)?;
    for watch in &mut watches {
        watch.status.hook_state = state.lifecycle.hook_state(watch);
    }
    Ok(Json(watches))
}

/// Add or update a watch. Updating keeps the recorded hook.
#[post("/watches", data = "<request>")]
pub async fn apply_watch(
    _admin: AdminToken,
    state: &State<AppState>,
    request: Json<WatchRequest>,
) -> AdminResult<Watch> {
    let WatchRequest { namespace, name, spec } = request.into_inner();
    let key = key_for(namespace, name)?;
    if spec.repository_url.trim().is_empty() {
        return Err(bad_request("repositoryUrl is required"));
    }
    policy::validate(&spec).map_err(|e| bad_request(e.to_string()))?;

    let candidate = Watch {
        metadata: ObjectMeta::new(key.namespace.clone(), key.name.clone()),
        spec,
        status: WatchStatus::default(),
    };
    state
        .registry()
        .client_for(&candidate)
        .map_err(|e| bad_request(e.to_string()))?;

    let watches = state.store().watches.as_ref();
    let stored = match watches.get(&key).await {
        Ok(_) => {
            update_with_retry(watches, &key, |w| {
                if w.spec == candidate.spec {
                    return false;
                }
                w.spec = candidate.spec.clone();
                w.status.last_error = None;
                true
            })
            .await
        }
        Err(StoreError::NotFound { .. }) => watches.create(candidate.clone()).await,
        Err(err) => Err(err),
    }
    .map_err(store_failure)?;

    save_seed(state.store(), &state.settings.seed_file).await;
    info!(watch = %key, "watch applied");
    Ok(Json(stored))
}

/// Delete a watch and its remote hook
#[delete("/watches/<namespace>/<name>")]
pub async fn delete_watch(
    _admin: AdminToken,
    state: &State<AppState>,
    namespace: &str,
    name: &str,
) -> AdminResult<ApiResponse> {
    let key = ObjectKey::new(namespace, name);
    state
        .lifecycle
        .remove_watch(&key)
        .await
        .map_err(|e| error_response(&e))?;

    save_seed(state.store(), &state.settings.seed_file).await;
    info!(watch = %key, "watch removed");
    Ok(Json(ApiResponse {
        success: true,
        message: format!("Watch {key} removed successfully"),
    }))
}

/// Add or replace a credential
#[post("/credentials", data = "<request>")]
pub async fn apply_credential(
    _admin: AdminToken,
    state: &State<AppState>,
    request: Json<CredentialRequest>,
) -> AdminResult<ApiResponse> {
    let request = request.into_inner();
    let key = key_for(request.namespace, request.name)?;
    if request.access_token.is_empty() {
        return Err(bad_request("accessToken is required"));
    }
    if let Some(expiry) = request.expiry.as_deref().filter(|e| !e.is_empty()) {
        DateTime::parse_from_rfc3339(expiry)
            .map_err(|e| bad_request(format!("expiry must be RFC 3339: {e}")))?;
    }

    let credential = Credential {
        metadata: ObjectMeta::new(key.namespace.clone(), key.name.clone()),
        provider: request.provider,
        access_token: request.access_token,
        refresh_token: request.refresh_token,
        expiry: request.expiry,
    };
    apply(state.store().credentials.as_ref(), credential)
        .await
        .map_err(store_failure)?;

    save_seed(state.store(), &state.settings.seed_file).await;
    info!(credential = %key, "credential applied");
    Ok(Json(ApiResponse {
        success: true,
        message: format!("Credential {key} configured successfully"),
    }))
}

/// List all triggers
#[get("/triggers")]
pub async fn list_triggers(_admin: AdminToken, state: &State<AppState>) -> AdminResult<Vec<Trigger>> {
    let triggers = state.store().triggers.list().await.map_err(store_failure)?;
    Ok(Json(triggers))
}

/// Record the outcome of a trigger; the commit status follows.
#[put("/triggers/<namespace>/<name>/handled", data = "<request>")]
pub async fn set_handled(
    _admin: AdminToken,
    state: &State<AppState>,
    namespace: &str,
    name: &str,
    request: Json<HandledRequest>,
) -> AdminResult<Trigger> {
    let key = ObjectKey::new(namespace, name);
    let HandledRequest { handled, status_url } = request.into_inner();
    let trigger = update_with_retry(state.store().triggers.as_ref(), &key, |t| {
        let url_unchanged = status_url.is_none() || t.status.status_url == status_url;
        if t.status.handled == handled && url_unchanged {
            return false;
        }
        t.status.handled = handled;
        if status_url.is_some() {
            t.status.status_url = status_url.clone();
        }
        true
    })
    .await
    .map_err(store_failure)?;

    info!(trigger = %key, ?handled, "trigger outcome recorded");
    Ok(Json(trigger))
}
