//! Outbound REST plumbing shared by the host clients.

use async_trait::async_trait;
use reqwest::Method;
use serde::de::DeserializeOwned;
use std::sync::Arc;
use std::time::Duration;
use tracing::debug;

use crate::error::HookError;

const USER_AGENT: &str = concat!("gitwatcher-rs/", env!("CARGO_PKG_VERSION"));

#[derive(Debug, Clone)]
pub enum Body {
    Empty,
    Json(serde_json::Value),
    Form(Vec<(String, String)>),
}

#[derive(Debug, Clone)]
pub struct ApiRequest {
    pub method: Method,
    pub url: String,
    pub bearer: Option<String>,
    pub basic: Option<(String, String)>,
    pub headers: Vec<(&'static str, String)>,
    pub body: Body,
}

impl ApiRequest {
    pub fn new(method: Method, url: impl Into<String>) -> Self {
        Self {
            method,
            url: url.into(),
            bearer: None,
            basic: None,
            headers: Vec::new(),
            body: Body::Empty,
        }
    }

    /// Anonymous requests are allowed; public repositories need no token.
    pub fn bearer(mut self, token: &str) -> Self {
        if !token.is_empty() {
            self.bearer = Some(token.to_string());
        }
        self
    }

    pub fn basic(mut self, user: &str, password: &str) -> Self {
        self.basic = Some((user.to_string(), password.to_string()));
        self
    }

    pub fn header(mut self, name: &'static str, value: impl Into<String>) -> Self {
        self.headers.push((name, value.into()));
        self
    }

    pub fn json(mut self, value: serde_json::Value) -> Self {
        self.body = Body::Json(value);
        self
    }

    pub fn form(mut self, fields: &[(&str, &str)]) -> Self {
        self.body = Body::Form(
            fields
                .iter()
                .map(|(k, v)| (k.to_string(), v.to_string()))
                .collect(),
        );
        self
    }
}

#[derive(Debug, Clone)]
pub struct RawResponse {
    pub status: u16,
    pub body: Vec<u8>,
}

impl RawResponse {
    pub fn is_success(&self) -> bool {
        (200..300).contains(&self.status)
    }

    /// Non-2xx responses become [`HookError::RemoteApi`].
    pub fn error_for_status(self) -> Result<Self, HookError> {
        if self.is_success() {
            Ok(self)
        } else {
            Err(HookError::RemoteApi {
                status: self.status,
                body: String::from_utf8_lossy(&self.body).into_owned(),
            })
        }
    }

    pub fn json<T: DeserializeOwned>(&self) -> Result<T, HookError> {
        serde_json::from_slice(&self.body).map_err(|e| {
            HookError::RemoteApi {
                status: self.status,
                body: format!("unexpected response body: {e}"),
            }
        })
    }
}

/// Sends one request. Implementations never retry.
#[async_trait]
pub trait Transport: Send + Sync {
    async fn execute(&self, request: ApiRequest) -> Result<RawResponse, HookError>;
}

pub struct ReqwestTransport {
    client: reqwest::Client,
}

impl ReqwestTransport {
    pub fn new(timeout: Duration) -> Result<Self, HookError> {
        let client = reqwest::Client::builder()
            .timeout(timeout)
            .user_agent(USER_AGENT)
            .build()
            .map_err(|e| HookError::Config(format!("failed to build HTTP client: {e}")))?;
        Ok(Self { client })
    }
}

#[async_trait]
impl Transport for ReqwestTransport {
    async fn execute(&self, request: ApiRequest) -> Result<RawResponse, HookError> {
        debug!(method = %request.method, url = %request.url, "outbound request");
        let mut builder = self.client.request(request.method, &request.url);
        if let Some(token) = &request.bearer {
            builder = builder.bearer_auth(token);
        }
        if let Some((user, password)) = &request.basic {
            builder = builder.basic_auth(user, Some(password));
        }
        for (name, value) in &request.headers {
            builder = builder.header(*name, value);
        }
        builder = match request.body {
            Body::Empty => builder,
            Body::Json(value) => builder.json(&value),
            Body::Form(fields) => builder.form(&fields),
        };

        let response = builder
            .send()
            .await
            .map_err(|e| HookError::RemoteUnavailable(e.to_string()))?;
        let status = response.status().as_u16();
        let body = response
            .bytes()
            .await
            .map_err(|e| HookError::RemoteUnavailable(e.to_string()))?;
        Ok(RawResponse {
            status,
            body: body.to_vec(),
        })
    }
}

/// A host REST API rooted at `base`.
#[derive(Clone)]
pub struct ApiClient {
    transport: Arc<dyn Transport>,
    base: String,
}

impl ApiClient {
    pub fn new(transport: Arc<dyn Transport>, base: &str) -> Self {
        Self {
            transport,
            base: base.trim_end_matches('/').to_string(),
        }
    }

    pub fn url(&self, path: &str) -> String {
        format!("{}{}", self.base, path)
    }

    pub fn request(&self, method: Method, path: &str) -> ApiRequest {
        ApiRequest::new(method, self.url(path))
    }

    pub async fn send(&self, request: ApiRequest) -> Result<RawResponse, HookError> {
        self.transport.execute(request).await?.error_for_status()
    }

    /// Like [`ApiClient::send`] but maps 404 to `None`.
    pub async fn send_optional(&self, request: ApiRequest) -> Result<Option<RawResponse>, HookError> {
        let response = self.transport.execute(request).await?;
        if response.status == 404 {
            return Ok(None);
        }
        response.error_for_status().map(Some)
    }

    pub async fn get_json<T: DeserializeOwned>(&self, path: &str, token: &str) -> Result<T, HookError> {
        self.send(self.request(Method::GET, path).bearer(token))
            .await?
            .json()
    }
}


#[cfg(test)]
mod tests {
    use super::fake::{FakeTransport, respond};
    use super::*;

    #[tokio::test]
    async fn non_success_maps_to_remote_api() {
        let transport = FakeTransport::new(|_| respond(403, serde_json::json!({"message": "nope"})));
        let api = ApiClient::new(transport.clone(), "https://api.example.com/");
        let err = api
            .send(api.request(Method::GET, "/user").bearer("t"))
            .await
            .unwrap_err();
        assert!(matches!(err, HookError::RemoteApi { status: 403, ref body } if body.contains("nope")));
        assert_eq!(transport.requests()[0].url, "https://api.example.com/user");
        assert_eq!(transport.requests()[0].bearer.as_deref(), Some("t"));
    }

    #[tokio::test]
    async fn not_found_is_optional() {
        let transport = FakeTransport::new(|_| respond(404, serde_json::json!({})));
        let api = ApiClient::new(transport, "https://api.example.com");
        let found = api.send_optional(api.request(Method::GET, "/x")).await.unwrap();
        assert!(found.is_none());
    }

    #[test]
    fn empty_token_sends_no_auth() {
        let request = ApiRequest::new(Method::GET, "https://x").bearer("");
        assert!(request.bearer.is_none());
    }
}
