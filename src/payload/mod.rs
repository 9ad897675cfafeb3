//! Host payload decoding into [`ChangeEvent`]s.
//!
//! Each submodule understands one host's webhook vocabulary. Parsers only
//! decide *what happened*; whether it should produce a trigger is left to
//! [`crate::policy`].

pub mod bitbucket_cloud;
pub mod bitbucket_server;
pub mod github;
pub mod gitlab;

use std::collections::BTreeMap;

use crate::error::HookError;
use crate::types::ChangeEvent;

pub const REFS_BRANCH_PREFIX: &str = "refs/heads/";
pub const REFS_TAG_PREFIX: &str = "refs/tags/";
pub const NULL_SHA: &str = "0000000000000000000000000000000000000000";

/// Request headers with lower-cased names.
#[derive(Debug, Clone, Default)]
pub struct HookHeaders(BTreeMap<String, String>);

impl HookHeaders {
    pub fn insert(&mut self, name: &str, value: impl Into<String>) {
        self.0.insert(name.to_ascii_lowercase(), value.into());
    }

    pub fn get(&self, name: &str) -> Option<&str> {
        self.0.get(&name.to_ascii_lowercase()).map(String::as_str)
    }
}

impl<'a> FromIterator<(&'a str, &'a str)> for HookHeaders {
    fn from_iter<I: IntoIterator<Item = (&'a str, &'a str)>>(iter: I) -> Self {
        let mut headers = HookHeaders::default();
        for (name, value) in iter {
            headers.insert(name, value);
        }
        headers
    }
}

/// Everything a host client needs to verify and decode one delivery.
#[derive(Debug, Clone, Copy)]
pub struct InboundHook<'a> {
    pub headers: &'a HookHeaders,
    /// `secret` query parameter of the callback URL, if any.
    pub query_secret: Option<&'a str>,
    pub body: &'a [u8],
}

impl<'a> InboundHook<'a> {
    pub fn header(&self, name: &str) -> Option<&'a str> {
        self.headers.get(name)
    }

    /// The host-declared event type, or a decode error naming the header.
    pub fn required_header(&self, name: &str) -> Result<&'a str, HookError> {
        self.header(name)
            .filter(|v| !v.is_empty())
            .ok_or_else(|| HookError::Decode(format!("missing {name} header")))
    }
}

#[derive(Debug, Clone, PartialEq)]
pub enum ParsedHook {
    Event(ChangeEvent),
    /// Connectivity check sent by the host after registration.
    Ping,
}

/// Branch name of a push ref. Tag refs are refused: tags arrive as their own
/// event kind and must not be processed twice.
pub fn branch_from_ref(git_ref: &str) -> Result<String, HookError> {
    if let Some(branch) = git_ref.strip_prefix(REFS_BRANCH_PREFIX) {
        return Ok(branch.to_string());
    }
    if git_ref.starts_with(REFS_TAG_PREFIX) {
        return Err(HookError::omitted("tag ref on push event"));
    }
    Err(HookError::omitted(format!("push to ref '{git_ref}'")))
}

pub fn is_null_sha(sha: &str) -> bool {
    !sha.is_empty() && sha.bytes().all(|b| b == b'0')
}

fn decode<T: serde::de::DeserializeOwned>(body: &[u8]) -> Result<T, HookError> {
    serde_json::from_slice(body).map_err(HookError::decode)
}
