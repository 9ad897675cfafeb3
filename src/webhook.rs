use rocket::{
    State,
    data::{Data, ToByteUnit},
    http::Status,
    post,
    request::{self, FromRequest, Request},
    serde::json::Json,
};
use tracing::{debug, info, warn};

use crate::AppState;
use crate::error::{HookError, Rejection, StoreError};
use crate::payload::{HookHeaders, InboundHook, ParsedHook};
use crate::policy;
use crate::provider::HOOK_ID_PARAM;
use crate::trigger::{self, Origin};
use crate::types::{ApiError, ObjectKey};

const SECRET_PARAM: &str = "secret";

/// Headers and callback query parameters of a delivery.
pub struct HookRequest {
    pub headers: HookHeaders,
    pub watch_id: Option<String>,
    pub secret: Option<String>,
}

#[rocket::async_trait]
impl<'r> FromRequest<'r> for HookRequest {
    type Error = ();

    async fn from_request(request: &'r Request<'_>) -> request::Outcome<Self, Self::Error> {
        let mut headers = HookHeaders::default();
        for header in request.headers().iter() {
            headers.insert(header.name().as_str(), header.value());
        }
        let query = |name: &str| {
            request
                .query_value::<&str>(name)
                .and_then(Result::ok)
                .map(str::to_string)
        };

        request::Outcome::Success(HookRequest {
            headers,
            watch_id: query(HOOK_ID_PARAM),
            secret: query(SECRET_PARAM),
        })
    }
}

/// What an accepted delivery amounted to.
#[derive(Debug)]
pub enum Delivery {
    Ping,
    Triggered(ObjectKey),
}

pub fn error_response(err: &HookError) -> (Status, Json<ApiError>) {
    let status = err.status_code();
    (status, Json(ApiError::new(status.code, err.to_string())))
}

/// Handler for POST /hooks
#[post("/hooks", data = "<data>")]
pub async fn receive(
    state: &State<AppState>,
    request: HookRequest,
    data: Data<'_>,
) -> Result<Status, (Status, Json<ApiError>)> {
    let body = match data.open(5.megabytes()).into_bytes().await {
        Ok(bytes) if bytes.is_complete() => bytes.into_inner(),
        Ok(_) => return Err(error_response(&HookError::Decode("payload too large".into()))),
        Err(err) => return Err(error_response(&HookError::decode(err))),
    };

    let watch = request.watch_id.as_deref().unwrap_or_default();
    match dispatch(state, &request, &body).await {
        Ok(Delivery::Ping) => {
            debug!(watch, "ping acknowledged");
            Ok(Status::Ok)
        }
        Ok(Delivery::Triggered(trigger)) => {
            debug!(watch, trigger = %trigger, "delivery accepted");
            Ok(Status::Ok)
        }
        Err(err @ HookError::Rejected(_)) => {
            info!(watch, reason = %err, "delivery rejected");
            Err(error_response(&err))
        }
        Err(err) => {
            warn!(watch, error = %err, status = err.status_code().code, "delivery failed");
            Err(error_response(&err))
        }
    }
}

/// Resolve watch and host, authenticate, decode, evaluate, emit.
pub async fn dispatch(state: &AppState, request: &HookRequest, body: &[u8]) -> Result<Delivery, HookError> {
    let key = request
        .watch_id
        .as_deref()
        .and_then(ObjectKey::parse)
        .ok_or_else(|| HookError::Decode(format!("missing {HOOK_ID_PARAM} parameter")))?;
    let watch = match state.store().watches.get(&key).await {
        Ok(watch) => watch,
        Err(StoreError::NotFound { .. }) => return Err(HookError::WatchNotFound(key.to_string())),
        Err(err) => return Err(err.into()),
    };
    if !watch.spec.enabled {
        return Err(Rejection::ReceiverDisabled.into());
    }

    let client = state.registry().client_for(&watch)?;
    if !client.supports_hooks() {
        return Err(HookError::UnknownProvider(format!("{} does not accept webhooks", client.kind())));
    }
    let hook = InboundHook {
        headers: &request.headers,
        query_secret: request.secret.as_deref(),
        body,
    };
    debug!(watch = %key, provider = %client.kind(), scheme = ?client.scheme(), "verifying delivery");
    client.verify(&watch, &hook)?;

    let event = match client.parse(&hook)? {
        ParsedHook::Ping => return Ok(Delivery::Ping),
        ParsedHook::Event(event) => event,
    };
    policy::evaluate(&watch, &event)?;
    let emitted = trigger::emit(
        state.store().triggers.as_ref(),
        &watch,
        client.kind(),
        event,
        Origin::Webhook,
    )
    .await?;
    Ok(Delivery::Triggered(emitted.trigger.metadata.key()))
}

#[cfg(test)]
pub(crate) mod tests {
    use super::*;
    use crate::build_rocket;
    use crate::config::Settings;
    use crate::lifecycle::tests::{github_host, lifecycle};
    use crate::payload::bitbucket_server::fixtures as bitbucket_server;
    use crate::payload::github::fixtures;
    use crate::provider::testing::watch;
    use crate::signature::sign_sha256;
    use crate::types::{EventKind, Watch};
    use rocket::http::Header;
    use rocket::local::asynchronous::{Client, LocalResponse};

    pub const ADMIN_TOKEN: &str = "admin-secret";
    const SECRET: &str = "s3cret";

    pub fn test_state() -> AppState {
        let settings = Settings::from_lookup(|name| match name {
            "ADMIN_TOKEN" => Some(ADMIN_TOKEN.to_string()),
            "SEED_FILE" => Some(
                std::env::temp_dir()
                    .join(format!("gitwatcher-test-{}.json", uuid::Uuid::new_v4()))
                    .display()
                    .to_string(),
            ),
            _ => None,
        })
        .unwrap();
        AppState {
            settings,
            lifecycle: lifecycle(github_host(Default::default())),
        }
    }

    pub async fn client_with(watches: Vec<Watch>) -> Client {
        let state = test_state();
        for w in watches {
            state.store().watches.create(w).await.unwrap();
        }
        Client::tracked(build_rocket(state)).await.unwrap()
    }

    fn registered_watch() -> Watch {
        let mut w = watch("https://github.com/acme/app");
        w.status.token = Some(SECRET.into());
        w
    }

    async fn deliver(client: &Client, query: &str, event: &str, body: &str, secret: &str) -> (Status, String) {
        let response = client
            .post(format!("/hooks{query}"))
            .header(Header::new("X-GitHub-Event", event.to_string()))
            .header(Header::new("X-Hub-Signature-256", sign_sha256(secret.as_bytes(), body.as_bytes())))
            .body(body)
            .dispatch()
            .await;
        let status = response.status();
        (status, response.into_string().await.unwrap_or_default())
    }

    async fn deliver_bitbucket_server<'c>(client: &'c Client, body: &str, secret: &str) -> LocalResponse<'c> {
        client
            .post(format!("/hooks{QUERY}"))
            .header(Header::new("X-Event-Key", "repo:refs_changed"))
            .header(Header::new("X-Hub-Signature", sign_sha256(secret.as_bytes(), body.as_bytes())))
            .body(body.to_string())
            .dispatch()
            .await
    }

    fn state_of(client: &Client) -> &AppState {
        client.rocket().state::<AppState>().unwrap()
    }

    const QUERY: &str = "?gitwebhookId=team-a:app";

    #[rocket::async_test]
    async fn signed_push_creates_trigger() {
        let client = client_with(vec![registered_watch()]).await;
        let body = fixtures::push("refs/heads/main", "9fceb02d0ae598e95dc970b74767f19372d61af8");

        let (status, text) = deliver(&client, QUERY, "push", &body, SECRET).await;
        assert_eq!(status, Status::Ok);
        assert!(text.is_empty());

        let triggers = state_of(&client).store().triggers.list().await.unwrap();
        assert_eq!(triggers.len(), 1);
        assert_eq!(triggers[0].spec.event.kind, EventKind::Push);
        assert_eq!(triggers[0].spec.event.branch.as_deref(), Some("main"));
        assert_eq!(
            triggers[0].spec.event.commit.as_deref(),
            Some("9fceb02d0ae598e95dc970b74767f19372d61af8")
        );
        assert!(triggers[0].metadata.name.starts_with("app-"));
    }

    #[rocket::async_test]
    async fn replayed_delivery_creates_second_trigger() {
        let client = client_with(vec![registered_watch()]).await;
        let body = fixtures::push("refs/heads/main", "9fceb02d0ae598e95dc970b74767f19372d61af8");
        deliver(&client, QUERY, "push", &body, SECRET).await;
        deliver(&client, QUERY, "push", &body, SECRET).await;
        assert_eq!(state_of(&client).store().triggers.list().await.unwrap().len(), 2);
    }

    #[rocket::async_test]
    async fn bad_signature_is_401_with_error_body() {
        let client = client_with(vec![registered_watch()]).await;
        let body = fixtures::push("refs/heads/main", "9fceb02d0ae598e95dc970b74767f19372d61af8");

        let (status, text) = deliver(&client, QUERY, "push", &body, "wrong").await;
        assert_eq!(status, Status::Unauthorized);
        let error: ApiError = serde_json::from_str(&text).unwrap();
        assert_eq!(error.kind, "error");
        assert_eq!(error.code, 401);
        assert!(state_of(&client).store().triggers.list().await.unwrap().is_empty());
    }

    #[rocket::async_test]
    async fn bitbucket_server_bad_signature_is_422() {
        let mut w = watch("https://bitbucket.example.com/scm/PRJ/app.git");
        w.status.token = Some(SECRET.into());
        let client = client_with(vec![w]).await;
        let body = bitbucket_server::refs_changed("refs/heads/main", "UPDATE");

        let refused = deliver_bitbucket_server(&client, &body, "wrong").await;
        assert_eq!(refused.status(), Status::UnprocessableEntity);
        let error: ApiError = serde_json::from_str(&refused.into_string().await.unwrap()).unwrap();
        assert_eq!(error.code, 422);
        assert!(state_of(&client).store().triggers.list().await.unwrap().is_empty());

        assert_eq!(deliver_bitbucket_server(&client, &body, SECRET).await.status(), Status::Ok);
        let triggers = state_of(&client).store().triggers.list().await.unwrap();
        assert_eq!(triggers.len(), 1);
        assert_eq!(
            triggers[0].spec.event.commit.as_deref(),
            Some("178864a7d521b6f5e720b386b2c2b0ef8563e0dc")
        );
    }

    #[rocket::async_test]
    async fn routing_failures() {
        let mut disabled = registered_watch();
        disabled.metadata.name = "off".into();
        disabled.spec.enabled = false;
        let client = client_with(vec![registered_watch(), disabled]).await;
        let body = fixtures::push("refs/heads/main", "9fceb02d0ae598e95dc970b74767f19372d61af8");

        assert_eq!(deliver(&client, "", "push", &body, SECRET).await.0, Status::BadRequest);
        assert_eq!(
            deliver(&client, "?gitwebhookId=team-a:missing", "push", &body, SECRET).await.0,
            Status::NotFound
        );
        assert_eq!(
            deliver(&client, "?gitwebhookId=team-a:off", "push", &body, SECRET).await.0,
            Status::UnprocessableEntity
        );
    }

    #[rocket::async_test]
    async fn policy_rejection_is_451() {
        let mut w = registered_watch();
        w.spec.push = false;
        let client = client_with(vec![w]).await;
        let body = fixtures::push("refs/heads/main", "9fceb02d0ae598e95dc970b74767f19372d61af8");

        let (status, text) = deliver(&client, QUERY, "push", &body, SECRET).await;
        assert_eq!(status.code, 451);
        assert!(text.contains("disabled"));
    }

    #[rocket::async_test]
    async fn ping_and_garbage() {
        let client = client_with(vec![registered_watch()]).await;
        assert_eq!(deliver(&client, QUERY, "ping", "{}", SECRET).await.0, Status::Ok);
        assert_eq!(deliver(&client, QUERY, "push", "not json", SECRET).await.0, Status::BadRequest);
        assert!(state_of(&client).store().triggers.list().await.unwrap().is_empty());
    }
}
